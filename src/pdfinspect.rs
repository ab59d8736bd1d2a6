use lopdf::Document as LoDocument;
use lopdf::Object as LoObject;
use lopdf::content::Content;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdfInspectErrorCode {
    PdfParseFailed,
    PdfEncryptedUnsupported,
    PdfEmptyOrNoPages,
    PdfContentDecodeFailed,
    PdfIoError,
}

impl PdfInspectErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PdfInspectErrorCode::PdfParseFailed => "PDF_PARSE_FAILED",
            PdfInspectErrorCode::PdfEncryptedUnsupported => "PDF_ENCRYPTED_UNSUPPORTED",
            PdfInspectErrorCode::PdfEmptyOrNoPages => "PDF_EMPTY_OR_NO_PAGES",
            PdfInspectErrorCode::PdfContentDecodeFailed => "PDF_CONTENT_DECODE_FAILED",
            PdfInspectErrorCode::PdfIoError => "PDF_IO_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfInspectError {
    pub code: PdfInspectErrorCode,
    pub message: String,
}

impl PdfInspectError {
    fn new(code: PdfInspectErrorCode, message: impl ToString) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for PdfInspectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for PdfInspectError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfInspectReport {
    pub pdf_version: String,
    pub page_count: usize,
    pub encrypted: bool,
    pub file_size_bytes: usize,
}

/// What one page's content stream draws.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContentSummary {
    pub texts: Vec<String>,
    pub images_drawn: usize,
    pub artifacts: usize,
}

impl PageContentSummary {
    pub fn contains_text(&self, needle: &str) -> bool {
        self.texts.iter().any(|text| text.contains(needle))
    }
}

pub fn inspect_pdf_bytes(bytes: &[u8]) -> Result<PdfInspectReport, PdfInspectError> {
    let pdf = load(bytes)?;
    Ok(PdfInspectReport {
        pdf_version: pdf.version.clone(),
        page_count: pdf.get_pages().len(),
        encrypted: pdf.is_encrypted(),
        file_size_bytes: bytes.len(),
    })
}

pub fn inspect_pdf_path(path: &Path) -> Result<PdfInspectReport, PdfInspectError> {
    let data = std::fs::read(path)
        .map_err(|err| PdfInspectError::new(PdfInspectErrorCode::PdfIoError, err))?;
    inspect_pdf_bytes(&data)
}

/// Decodes each page's content stream, in page order.
pub fn page_summaries(bytes: &[u8]) -> Result<Vec<PageContentSummary>, PdfInspectError> {
    let pdf = load(bytes)?;
    let pages = pdf.get_pages();
    if pages.is_empty() {
        return Err(PdfInspectError::new(
            PdfInspectErrorCode::PdfEmptyOrNoPages,
            "pdf has no pages",
        ));
    }
    let mut out = Vec::with_capacity(pages.len());
    for (_, page_id) in pages {
        let data = pdf.get_page_content(page_id).map_err(|err| {
            PdfInspectError::new(PdfInspectErrorCode::PdfContentDecodeFailed, err)
        })?;
        let content = Content::decode(&data).map_err(|err| {
            PdfInspectError::new(PdfInspectErrorCode::PdfContentDecodeFailed, err)
        })?;
        let mut summary = PageContentSummary::default();
        for op in &content.operations {
            match op.operator.as_str() {
                "Tj" | "'" | "\"" => {
                    if let Some(text) = op.operands.last().and_then(string_operand) {
                        summary.texts.push(text);
                    }
                }
                "TJ" => {
                    if let Some(LoObject::Array(items)) = op.operands.first() {
                        let text: String = items.iter().filter_map(string_operand).collect();
                        summary.texts.push(text);
                    }
                }
                "Do" => summary.images_drawn += 1,
                "BDC" | "BMC" => {
                    if let Some(LoObject::Name(tag)) = op.operands.first() {
                        if tag.as_slice() == b"Artifact" {
                            summary.artifacts += 1;
                        }
                    }
                }
                _ => {}
            }
        }
        out.push(summary);
    }
    Ok(out)
}

/// Text-show operands per page.
pub fn page_texts(bytes: &[u8]) -> Result<Vec<Vec<String>>, PdfInspectError> {
    Ok(page_summaries(bytes)?
        .into_iter()
        .map(|summary| summary.texts)
        .collect())
}

fn load(bytes: &[u8]) -> Result<LoDocument, PdfInspectError> {
    LoDocument::load_mem(bytes)
        .map_err(|err| PdfInspectError::new(PdfInspectErrorCode::PdfParseFailed, err))
}

// Single-byte (WinAnsi/Latin-1) strings as written by the base-14 fonts.
fn string_operand(object: &LoObject) -> Option<String> {
    match object {
        LoObject::String(bytes, _) => Some(bytes.iter().map(|b| *b as char).collect()),
        _ => None,
    }
}
