use crate::canvas::{Command, Document, Page};
use crate::error::FormPressError;
use crate::font::is_bold;
use crate::metrics::PageMetrics;
use crate::types::{Color, Pt};
use fixed::types::I32F32;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;

/// A baseline JPEG embedded as-is through `/DCTDecode`.
#[derive(Debug, Clone)]
pub(crate) struct JpegImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Images addressable from `Command::DrawImage::resource_id`.
pub(crate) type ImageStore = BTreeMap<String, JpegImage>;

#[derive(Debug, Clone)]
pub(crate) struct PdfOptions {
    pub title: Option<String>,
    pub compress: bool,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            title: None,
            compress: true,
        }
    }
}

struct PdfObject {
    dict: String,
    stream: Option<Vec<u8>>,
}

impl PdfObject {
    fn dict(dict: String) -> Self {
        Self { dict, stream: None }
    }

    fn stream(dict: String, data: Vec<u8>) -> Self {
        Self {
            dict,
            stream: Some(data),
        }
    }
}

/// Serialises command pages into a PDF 1.7 file.
pub(crate) fn document_to_pdf(
    document: &Document,
    images: &ImageStore,
    options: &PdfOptions,
) -> Result<(Vec<u8>, Vec<PageMetrics>), FormPressError> {
    // 1 catalog, 2 pages tree, 3 info; resources and pages follow.
    let mut objects: Vec<PdfObject> = Vec::new();
    let mut next_id = 4usize;

    let font_names = collect_font_names(document);
    let mut font_map: HashMap<String, String> = HashMap::new();
    let mut font_resources: Vec<(String, usize)> = Vec::new();
    let mut base_fonts: BTreeMap<&'static str, String> = BTreeMap::new();
    for name in &font_names {
        let base = base14_name(name);
        let resource = match base_fonts.get(base) {
            Some(resource) => resource.clone(),
            None => {
                let resource = format!("F{}", base_fonts.len() + 1);
                objects.push(PdfObject::dict(font_object(base)));
                font_resources.push((resource.clone(), next_id));
                next_id += 1;
                base_fonts.insert(base, resource.clone());
                resource
            }
        };
        font_map.insert(name.clone(), resource);
    }

    let (gs_objects, gs_resources, gs_map, after_gs) = build_extgstate_objects(document, next_id);
    objects.extend(gs_objects.into_iter().map(PdfObject::dict));
    next_id = after_gs;

    let mut image_map: HashMap<String, String> = HashMap::new();
    let mut image_resources: Vec<(String, usize)> = Vec::new();
    for source in collect_image_sources(document) {
        let Some(image) = images.get(&source) else {
            tracing::warn!(resource = %source, "image resource missing from store; skipped");
            continue;
        };
        let name = format!("Im{}", image_resources.len() + 1);
        objects.push(PdfObject::stream(image_dict(image), image.data.clone()));
        image_resources.push((name.clone(), next_id));
        image_map.insert(source, name);
        next_id += 1;
    }

    let resources = format!(
        "<< /Font {} /XObject {} /ExtGState {} >>",
        named_refs(&font_resources),
        named_refs(&image_resources),
        named_refs(&gs_resources)
    );

    let mut page_ids = Vec::with_capacity(document.pages.len());
    let mut metrics = Vec::with_capacity(document.pages.len());
    for (index, page) in document.pages.iter().enumerate() {
        let content = render_page(page, document.page_size.height, &font_map, &image_map, &gs_map);
        let raw = content.into_bytes();
        let content_bytes = raw.len();
        let stream = if options.compress {
            PdfObject::stream("/Filter /FlateDecode".to_string(), flate_compress(&raw)?)
        } else {
            PdfObject::stream(String::new(), raw)
        };
        let content_id = next_id;
        let page_id = next_id + 1;
        next_id += 2;
        objects.push(stream);
        objects.push(PdfObject::dict(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] /Resources {} /Contents {} 0 R >>",
            fmt_pt(document.page_size.width),
            fmt_pt(document.page_size.height),
            resources,
            content_id
        )));
        page_ids.push(page_id);
        metrics.push(PageMetrics {
            page_number: index + 1,
            command_count: page.commands.len(),
            content_bytes,
        });
    }

    let kids = page_ids
        .iter()
        .map(|id| format!("{} 0 R", id))
        .collect::<Vec<_>>()
        .join(" ");
    let mut head = vec![
        PdfObject::dict("<< /Type /Catalog /Pages 2 0 R >>".to_string()),
        PdfObject::dict(format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids,
            page_ids.len()
        )),
        PdfObject::dict(info_object(options.title.as_deref())),
    ];
    head.extend(objects);
    Ok((build_pdf(&head)?, metrics))
}

fn collect_font_names(document: &Document) -> Vec<String> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    names.insert("Helvetica".to_string());
    for page in &document.pages {
        for cmd in &page.commands {
            if let Command::SetFontName(name) = cmd {
                names.insert(name.clone());
            }
        }
    }
    names.into_iter().collect()
}

fn collect_image_sources(document: &Document) -> Vec<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for page in &document.pages {
        for cmd in &page.commands {
            if let Command::DrawImage { resource_id, .. } = cmd {
                seen.insert(resource_id.clone());
            }
        }
    }
    seen.into_iter().collect()
}

fn base14_name(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("times") {
        if is_bold(name) { "Times-Bold" } else { "Times-Roman" }
    } else if lower.starts_with("courier") {
        if is_bold(name) { "Courier-Bold" } else { "Courier" }
    } else if is_bold(name) {
        "Helvetica-Bold"
    } else {
        "Helvetica"
    }
}

fn build_extgstate_objects(
    document: &Document,
    start_id: usize,
) -> (
    Vec<String>,
    Vec<(String, usize)>,
    HashMap<(u16, u16), String>,
    usize,
) {
    // Map (fill_alpha, stroke_alpha) -> /GSn resource.
    let mut pairs: BTreeSet<(u16, u16)> = BTreeSet::new();
    for page in &document.pages {
        for cmd in &page.commands {
            if let Command::SetOpacity { fill, stroke } = cmd {
                pairs.insert((quantize_alpha(*fill), quantize_alpha(*stroke)));
            }
        }
    }

    let mut objects = Vec::new();
    let mut resources = Vec::new();
    let mut name_map: HashMap<(u16, u16), String> = HashMap::new();
    let mut next_id = start_id;

    for (index, (f, s)) in pairs.into_iter().enumerate() {
        let name = format!("GS{}", index + 1);
        objects.push(format!(
            "<< /Type /ExtGState /ca {} /CA {} >>",
            fmt(f as f32 / 1000.0),
            fmt(s as f32 / 1000.0)
        ));
        resources.push((name.clone(), next_id));
        name_map.insert((f, s), name);
        next_id += 1;
    }

    (objects, resources, name_map, next_id)
}

fn quantize_alpha(value: f32) -> u16 {
    ((value * 1000.0).round() as i32).clamp(0, 1000) as u16
}

fn render_page(
    page: &Page,
    page_height: Pt,
    font_map: &HashMap<String, String>,
    image_map: &HashMap<String, String>,
    gs_map: &HashMap<(u16, u16), String>,
) -> String {
    let mut out = String::new();
    let mut current_font_size = Pt::from_f32(12.0);
    let mut current_font_name = "Helvetica".to_string();

    for cmd in &page.commands {
        match cmd {
            Command::SaveState => out.push_str("q\n"),
            Command::RestoreState => out.push_str("Q\n"),
            Command::Translate(x, y) => {
                out.push_str(&format!("1 0 0 1 {} {} cm\n", fmt_pt(*x), fmt_pt(*y)));
            }
            Command::Rotate(angle) => {
                let sin = libm::sinf(*angle);
                let cos = libm::cosf(*angle);
                out.push_str(&format!(
                    "{} {} {} {} 0 0 cm\n",
                    fmt(cos),
                    fmt(sin),
                    fmt(-sin),
                    fmt(cos)
                ));
            }
            Command::Meta { .. } => {}
            Command::BeginArtifact { subtype } => {
                if let Some(subtype) = subtype.as_deref() {
                    out.push_str(&format!(
                        "/Artifact <</Subtype /{}>> BDC\n",
                        escape_pdf_name(subtype)
                    ));
                } else {
                    out.push_str("/Artifact BMC\n");
                }
            }
            Command::EndMarkedContent => out.push_str("EMC\n"),
            Command::SetFillColor(color) => out.push_str(&color_to_pdf_fill(*color)),
            Command::SetOpacity { fill, stroke } => {
                if let Some(name) = gs_map.get(&(quantize_alpha(*fill), quantize_alpha(*stroke))) {
                    out.push_str(&format!("/{} gs\n", name));
                }
            }
            Command::SetFontName(name) => current_font_name = name.clone(),
            Command::SetFontSize(size) => current_font_size = *size,
            Command::ClipRect {
                x,
                y,
                width,
                height,
            } => {
                // Top-left page space to PDF bottom-left space.
                out.push_str(&format!(
                    "{} {} {} {} re\nW\nn\n",
                    fmt_pt(*x),
                    fmt_pt(page_height - *y - *height),
                    fmt_pt(*width),
                    fmt_pt(*height)
                ));
            }
            Command::DrawString { x, y, text } => {
                let resource = font_map
                    .get(&current_font_name)
                    .map(String::as_str)
                    .unwrap_or("F1");
                out.push_str("BT\n");
                out.push_str(&format!("/{} {} Tf\n", resource, fmt_pt(current_font_size)));
                out.push_str(&format!(
                    "{} {} Td\n",
                    fmt_pt(*x),
                    fmt_pt(page_height - *y - current_font_size)
                ));
                out.push_str(&format!("({}) Tj\n", encode_winansi_pdf_string(text)));
                out.push_str("ET\n");
            }
            Command::DrawRect {
                x,
                y,
                width,
                height,
            } => {
                out.push_str(&format!(
                    "{} {} {} {} re\nf\n",
                    fmt_pt(*x),
                    fmt_pt(page_height - *y - *height),
                    fmt_pt(*width),
                    fmt_pt(*height)
                ));
            }
            Command::DrawImage {
                x,
                y,
                width,
                height,
                resource_id,
            } => {
                if let Some(name) = image_map.get(resource_id) {
                    let draw_y = page_height - *y - *height;
                    out.push_str("q\n");
                    out.push_str(&format!(
                        "{} 0 0 {} {} {} cm\n",
                        fmt_pt(*width),
                        fmt_pt(*height),
                        fmt_pt(*x),
                        fmt_pt(draw_y)
                    ));
                    out.push_str(&format!("/{} Do\n", name));
                    out.push_str("Q\n");
                }
            }
        }
    }

    out
}

fn image_dict(image: &JpegImage) -> String {
    format!(
        "/Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceRGB /BitsPerComponent 8 /Filter /DCTDecode",
        image.width, image.height
    )
}

fn font_object(base: &str) -> String {
    format!(
        "<< /Type /Font /Subtype /Type1 /BaseFont /{} /Encoding /WinAnsiEncoding >>",
        base
    )
}

fn named_refs(entries: &[(String, usize)]) -> String {
    let mut parts = Vec::new();
    for (resource, obj_id) in entries {
        parts.push(format!("/{} {} 0 R", resource, obj_id));
    }
    format!("<< {} >>", parts.join(" "))
}

fn info_object(title: Option<&str>) -> String {
    let mut entries = vec!["/Producer (formpress)".to_string()];
    if let Some(title) = title {
        entries.push(format!("/Title ({})", encode_winansi_pdf_string(title)));
    }
    format!("<< {} >>", entries.join(" "))
}

fn build_pdf(objects: &[PdfObject]) -> Result<Vec<u8>, FormPressError> {
    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(b"%PDF-1.7\n");
    out.extend_from_slice(b"%\xE2\xE3\xCF\xD3\n");

    let mut offsets = Vec::with_capacity(objects.len());
    for (index, obj) in objects.iter().enumerate() {
        offsets.push(out.len());
        writeln!(out, "{} 0 obj", index + 1)?;
        match &obj.stream {
            Some(data) => {
                let extra = if obj.dict.is_empty() {
                    String::new()
                } else {
                    format!(" {}", obj.dict)
                };
                write!(out, "<< /Length {}{} >>\nstream\n", data.len(), extra)?;
                out.extend_from_slice(data);
                out.extend_from_slice(b"\nendstream");
            }
            None => out.extend_from_slice(obj.dict.as_bytes()),
        }
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_start = out.len();
    writeln!(out, "xref\n0 {}", objects.len() + 1)?;
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        writeln!(out, "{:010} 00000 n ", offset)?;
    }
    write!(
        out,
        "trailer\n<< /Size {} /Root 1 0 R /Info 3 0 R >>\nstartxref\n{}\n%%EOF",
        objects.len() + 1,
        xref_start
    )?;
    Ok(out)
}

fn flate_compress(data: &[u8]) -> Result<Vec<u8>, FormPressError> {
    use flate2::Compression;
    use flate2::write::ZlibEncoder;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn encode_winansi_pdf_string(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        let byte = match ch {
            '\u{0000}'..='\u{007F}' => ch as u8,
            '\u{00A0}'..='\u{00FF}' => ch as u8,
            // cp1252 extensions
            '\u{20AC}' => 0x80,
            '\u{2026}' => 0x85,
            '\u{2022}' => 0x95,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            _ => b'?',
        };
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'(' => out.push_str("\\("),
            b')' => out.push_str("\\)"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b if !(0x20..0x7f).contains(&b) => out.push_str(&format!("\\{:03o}", b)),
            b => out.push(b as char),
        }
    }
    out
}

fn escape_pdf_name(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch);
        } else {
            let mut buf = [0u8; 4];
            for b in ch.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("#{:02X}", b));
            }
        }
    }
    out
}

fn color_to_pdf_fill(color: Color) -> String {
    format!("{} {} {} rg\n", fmt(color.r), fmt(color.g), fmt(color.b))
}

fn fmt(value: f32) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    let fixed = I32F32::from_num(value);
    let scaled = (fixed * I32F32::from_num(1000)).round();
    let milli: i64 = scaled.to_num();
    format_milli(milli)
}

fn fmt_pt(value: Pt) -> String {
    format_milli(value.to_milli_i64())
}

fn format_milli(milli: i64) -> String {
    if milli == 0 {
        return "0".to_string();
    }
    let sign = if milli < 0 { "-" } else { "" };
    let abs = milli.unsigned_abs();
    let int = abs / 1000;
    let frac = abs % 1000;
    if frac == 0 {
        return format!("{sign}{int}");
    }
    let mut s = format!("{sign}{int}.{frac:03}");
    while s.ends_with('0') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Canvas;
    use crate::types::Size;
    use crate::pdfinspect::{inspect_pdf_bytes, page_texts};

    fn tiny_jpeg() -> JpegImage {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        let mut data = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut data, 80);
        img.write_with_encoder(encoder).unwrap();
        JpegImage {
            width: 4,
            height: 4,
            data,
        }
    }

    #[test]
    fn format_milli_trims_trailing_zeros() {
        assert_eq!(format_milli(0), "0");
        assert_eq!(format_milli(12_500), "12.5");
        assert_eq!(format_milli(-1_050), "-1.05");
        assert_eq!(format_milli(3_000), "3");
    }

    #[test]
    fn winansi_escapes_delimiters_and_latin1() {
        assert_eq!(encode_winansi_pdf_string("a(b)\\"), "a\\(b\\)\\\\");
        assert_eq!(encode_winansi_pdf_string("Não"), "N\\343o");
        assert_eq!(encode_winansi_pdf_string("✓"), "?");
    }

    #[test]
    fn written_pdf_parses_with_pages_text_and_image() {
        let mut canvas = Canvas::new(Size::a4());
        canvas.draw_image(
            crate::types::Rect {
                x: Pt::ZERO,
                y: Pt::ZERO,
                width: Pt::from_f32(100.0),
                height: Pt::from_f32(100.0),
            },
            "snap",
        );
        canvas.set_opacity(0.25, 0.25);
        canvas.set_font_name("Helvetica-Bold");
        canvas.draw_string(Pt::from_f32(10.0), Pt::from_f32(10.0), "CANCELADO");
        canvas.show_page();
        canvas.draw_string(Pt::from_f32(10.0), Pt::from_f32(10.0), "segunda");
        let document = canvas.finish();

        let mut images = ImageStore::new();
        images.insert("snap".to_string(), tiny_jpeg());
        let (bytes, metrics) = document_to_pdf(&document, &images, &PdfOptions::default()).unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(bytes.starts_with(b"%PDF-1.7"));

        let info = inspect_pdf_bytes(&bytes).unwrap();
        assert_eq!(info.page_count, 2);
        let texts = page_texts(&bytes).unwrap();
        assert_eq!(texts[0], vec!["CANCELADO".to_string()]);
        assert_eq!(texts[1], vec!["segunda".to_string()]);
    }

    #[test]
    fn missing_image_resource_is_skipped() {
        let mut canvas = Canvas::new(Size::a4());
        canvas.draw_image(
            crate::types::Rect {
                x: Pt::ZERO,
                y: Pt::ZERO,
                width: Pt::from_f32(10.0),
                height: Pt::from_f32(10.0),
            },
            "absent",
        );
        let (bytes, _) =
            document_to_pdf(&canvas.finish(), &ImageStore::new(), &PdfOptions::default()).unwrap();
        assert_eq!(inspect_pdf_bytes(&bytes).unwrap().page_count, 1);
    }
}
