use crate::error::FormPressError;
use crate::metrics::ExportMetrics;
use crate::model::ExportFormat;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CANCELLED_SUFFIX: &str = "-CANCELADO";
const DEFAULT_STEM: &str = "documento";

/// `<stem>.<ext>`, or `<stem>-CANCELADO.<ext>` for cancelled documents.
/// Path separators and control characters in the stem are replaced.
pub fn export_file_name(stem: &str, cancelled: bool, format: ExportFormat) -> String {
    let mut clean: String = stem
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed_len = clean.trim_end_matches('.').len();
    clean.truncate(trimmed_len);
    if clean.is_empty() {
        clean.push_str(DEFAULT_STEM);
    }
    let suffix = if cancelled { CANCELLED_SUFFIX } else { "" };
    format!("{}{}.{}", clean, suffix, format.extension())
}

/// "Save as" target for finished exports.
pub trait FileSink {
    fn save(&mut self, file_name: &str, bytes: &[u8]) -> Result<(), FormPressError>;
}

/// Writes files into a directory, creating it on first use.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

impl FileSink for DirectorySink {
    fn save(&mut self, file_name: &str, bytes: &[u8]) -> Result<(), FormPressError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(file_name);
        std::fs::write(&path, bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "export saved");
        Ok(())
    }
}

/// Keeps saved files in memory, keyed by file name.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file_name: &str) -> Option<&[u8]> {
        self.files.get(file_name).map(Vec::as_slice)
    }

    pub fn file_names(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }
}

impl FileSink for MemorySink {
    fn save(&mut self, file_name: &str, bytes: &[u8]) -> Result<(), FormPressError> {
        self.files.insert(file_name.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub file_name: String,
    pub format: ExportFormat,
    /// Zero for Word and Excel exports.
    pub page_count: usize,
    pub bytes: usize,
    pub sha256: String,
    pub cancelled: bool,
    pub metrics: Option<ExportMetrics>,
}

impl ExportReport {
    pub(crate) fn new(
        file_name: String,
        format: ExportFormat,
        data: &[u8],
        cancelled: bool,
        metrics: Option<ExportMetrics>,
    ) -> Self {
        Self {
            file_name,
            format,
            page_count: metrics.as_ref().map(|m| m.pages.len()).unwrap_or(0),
            bytes: data.len(),
            sha256: sha256_hex(data),
            cancelled,
            metrics,
        }
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_follow_cancellation_and_format() {
        assert_eq!(export_file_name("relatorio", false, ExportFormat::Pdf), "relatorio.pdf");
        assert_eq!(
            export_file_name("relatorio", true, ExportFormat::Pdf),
            "relatorio-CANCELADO.pdf"
        );
        assert_eq!(export_file_name("ficha", false, ExportFormat::Word), "ficha.doc");
        assert_eq!(export_file_name("ficha", true, ExportFormat::Excel), "ficha-CANCELADO.xlsx");
    }

    #[test]
    fn unsafe_stems_are_cleaned() {
        assert_eq!(export_file_name("a/b:c", false, ExportFormat::Pdf), "a_b_c.pdf");
        assert_eq!(export_file_name("  ", false, ExportFormat::Pdf), "documento.pdf");
        assert_eq!(export_file_name("nota..", false, ExportFormat::Pdf), "nota.pdf");
    }

    #[test]
    fn directory_sink_creates_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path().join("out/nested"));
        sink.save("x.pdf", b"%PDF").unwrap();
        assert_eq!(std::fs::read(sink.path_for("x.pdf")).unwrap(), b"%PDF");
    }

    #[test]
    fn report_fingerprints_bytes() {
        let report = ExportReport::new("a.doc".into(), ExportFormat::Word, b"abc", false, None);
        assert_eq!(
            report.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(report.page_count, 0);
        assert_eq!(report.bytes, 3);
    }
}
