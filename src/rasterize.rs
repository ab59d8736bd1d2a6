use crate::error::FormPressError;
use crate::font::FontBook;
use crate::layout::{LayoutSettings, layout_tree};
use crate::markup::escape_html;
use crate::model::Align;
use crate::raster::{page_to_pixmap, pixmap_to_rgb};
use crate::types::Pt;
use image::RgbImage;
use kuchiki::iter::NodeIterator;
use kuchiki::traits::TendrilSink;
use kuchiki::{NodeData, NodeRef};

/// Spacing hints (`data-padding`, `data-margin`) are multiples of this unit.
pub const SPACING_UNIT_PX: u32 = 8;

const MAX_SPACING_FACTOR: u32 = 64;

pub const CANCELLED_BANNER_TEXT: &str = "DOCUMENTO CANCELADO";

/// Per-export switches: whether the document is cancelled and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub cancelled: bool,
    pub cancellation_reason: Option<String>,
}

impl ExportOptions {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn cancelled(reason: Option<&str>) -> Self {
        Self {
            cancelled: true,
            cancellation_reason: reason
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        }
    }
}

/// Flattened raster of the whole document at a known DPI.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub image: RgbImage,
    pub dpi: u32,
}

impl Snapshot {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SnapshotSettings {
    pub layout: LayoutSettings,
    pub dpi: u32,
}

/// Clones `root`, prints the layout hints into the clone and paints it.
/// The caller's tree is left untouched.
pub(crate) fn rasterize(
    root: Option<&NodeRef>,
    options: &ExportOptions,
    settings: &SnapshotSettings,
    fonts: &FontBook,
) -> Result<Snapshot, FormPressError> {
    let root = root.ok_or(FormPressError::MissingRoot)?;
    let clone = prepare_print_clone(root, options);
    let laid_out = layout_tree(&clone, &settings.layout, fonts);
    let pixmap = page_to_pixmap(&laid_out.page, laid_out.size, settings.dpi, fonts)?;
    Ok(Snapshot {
        image: pixmap_to_rgb(&pixmap),
        dpi: settings.dpi,
    })
}

/// Detached copy of `root` with print styles applied and, for cancelled
/// exports, the banner as first child.
pub fn prepare_print_clone(root: &NodeRef, options: &ExportOptions) -> NodeRef {
    let clone = deep_clone(root);
    apply_print_styles(&clone);
    if options.cancelled {
        inject_cancellation_banner(&clone, options.cancellation_reason.as_deref());
    }
    clone
}

fn deep_clone(node: &NodeRef) -> NodeRef {
    let copy = match node.data() {
        NodeData::Element(element) => NodeRef::new_element(
            element.name.clone(),
            element.attributes.borrow().map.clone(),
        ),
        NodeData::Text(text) => NodeRef::new_text(text.borrow().clone()),
        NodeData::Comment(comment) => NodeRef::new_comment(comment.borrow().clone()),
        NodeData::ProcessingInstruction(pi) => {
            let (target, data) = pi.borrow().clone();
            NodeRef::new_processing_instruction(target, data)
        }
        NodeData::Doctype(doctype) => NodeRef::new_doctype(
            doctype.name.clone(),
            doctype.public_id.clone(),
            doctype.system_id.clone(),
        ),
        NodeData::Document(_) => NodeRef::new_document(),
        NodeData::DocumentFragment => NodeRef::new(NodeData::DocumentFragment),
    };
    for child in node.children() {
        copy.append(deep_clone(&child));
    }
    copy
}

/// Rewrites `data-*` layout hints on sections and fields into inline styles.
pub fn apply_print_styles(root: &NodeRef) {
    for element in root.inclusive_descendants().elements() {
        let mut attrs = element.attributes.borrow_mut();
        let declarations = if attrs.contains("data-section") {
            section_declarations(
                attrs.get("data-align"),
                attrs.get("data-width"),
                attrs.get("data-padding"),
                attrs.get("data-margin"),
                attrs.get("data-columns"),
            )
        } else if attrs.contains("data-field") {
            field_declarations(attrs.get("data-align"), attrs.get("data-width"))
        } else {
            continue;
        };
        let merged = match attrs.get("style").map(str::trim) {
            Some(existing) if !existing.is_empty() => {
                format!("{}; {}", existing.trim_end_matches(';'), declarations)
            }
            _ => declarations,
        };
        attrs.insert("style", merged);
    }
}

fn section_declarations(
    align: Option<&str>,
    width: Option<&str>,
    padding: Option<&str>,
    margin: Option<&str>,
    columns: Option<&str>,
) -> String {
    let mut out = vec!["break-inside: avoid".to_string()];
    let align = align.and_then(Align::parse);
    if let Some(align) = align {
        out.push(format!("text-align: {}", align.as_css()));
    }
    if let Some(px) = spacing_px(padding) {
        out.push(format!("padding: {}px", px));
    }
    if let Some(px) = spacing_px(margin) {
        out.push(format!("margin: {}px 0", px));
    }
    if let Some(width) = parse_hint(width).filter(|w| (1..=100).contains(w)) {
        out.push(format!("width: {}%", width));
        out.extend(box_alignment(align));
    }
    if let Some(columns) = parse_hint(columns).filter(|c| *c > 1) {
        out.push(format!("column-count: {}", columns));
        out.push(format!("column-gap: {}px", 2 * SPACING_UNIT_PX));
    }
    out.join("; ")
}

fn field_declarations(align: Option<&str>, width: Option<&str>) -> String {
    let mut out = vec![
        "break-inside: avoid".to_string(),
        format!("margin-bottom: {}px", SPACING_UNIT_PX),
    ];
    let align = align.and_then(Align::parse);
    if let Some(align) = align {
        out.push(format!("text-align: {}", align.as_css()));
    }
    if let Some(width) = parse_hint(width).filter(|w| (1..=100).contains(w)) {
        out.push(format!("width: {}%", width));
        out.extend(box_alignment(align));
    }
    out.join("; ")
}

fn box_alignment(align: Option<Align>) -> Vec<String> {
    match align {
        Some(Align::Center) => vec![
            "margin-left: auto".to_string(),
            "margin-right: auto".to_string(),
        ],
        Some(Align::Right) => vec![
            "margin-left: auto".to_string(),
            "margin-right: 0".to_string(),
        ],
        _ => Vec::new(),
    }
}

/// Spacing hint in pixels; factors past `MAX_SPACING_FACTOR` are ignored.
fn spacing_px(raw: Option<&str>) -> Option<u32> {
    parse_hint(raw)
        .filter(|factor| *factor <= MAX_SPACING_FACTOR)
        .and_then(|factor| factor.checked_mul(SPACING_UNIT_PX))
}

fn parse_hint(raw: Option<&str>) -> Option<u32> {
    raw?.trim().trim_end_matches('%').parse().ok()
}

/// Prepends the cancellation banner to `root`.
pub fn inject_cancellation_banner(root: &NodeRef, reason: Option<&str>) {
    let mut html = format!(
        "<div data-cancel-banner style=\"background-color: #fdecea; color: #b71c1c; padding: 12px; margin-bottom: 16px; text-align: center\"><p style=\"font-weight: bold; font-size: 18px; margin: 0\">{}</p>",
        CANCELLED_BANNER_TEXT
    );
    if let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty()) {
        html.push_str(&format!(
            "<p style=\"margin: 4px 0 0 0\">Motivo: {}</p>",
            escape_html(reason)
        ));
    }
    html.push_str("</div>");

    let fragment = kuchiki::parse_html().one(html);
    let Ok(banner) = fragment.select_first("[data-cancel-banner]") else {
        return;
    };
    let banner = banner.as_node().clone();
    banner.detach();
    root.prepend(banner);
}

/// Default snapshot geometry derived from a viewport width.
pub(crate) fn snapshot_settings(viewport_width: Pt, dpi: u32) -> SnapshotSettings {
    SnapshotSettings {
        layout: LayoutSettings {
            width: viewport_width,
            gutter: Pt::from_px(32.0),
            font_size: Pt::from_px(14.0),
        },
        dpi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Size;

    fn tree(html: &str) -> NodeRef {
        let doc = kuchiki::parse_html().one(html);
        doc.select_first("#doc").unwrap().as_node().clone()
    }

    #[test]
    fn absent_root_is_reported_not_panicked() {
        let settings = snapshot_settings(Size::a4().width, 72);
        let err = rasterize(
            None,
            &ExportOptions::active(),
            &settings,
            &FontBook::new(false),
        )
        .unwrap_err();
        assert!(matches!(err, FormPressError::MissingRoot));
    }

    #[test]
    fn live_tree_is_not_mutated() {
        let root = tree("<div id=doc><section data-section data-align=center data-width=50>x</section></div>");
        let before = root.to_string();
        let clone = prepare_print_clone(&root, &ExportOptions::cancelled(Some("erro")));
        assert_eq!(root.to_string(), before);
        assert!(clone.to_string().contains(CANCELLED_BANNER_TEXT));
        assert!(!before.contains(CANCELLED_BANNER_TEXT));
    }

    #[test]
    fn section_hints_become_inline_styles() {
        let root = tree(
            "<div id=doc><section data-section data-align=right data-width=60 data-padding=2 data-margin=1 data-columns=3></section></div>",
        );
        apply_print_styles(&root);
        let section = root.select_first("[data-section]").unwrap();
        let attrs = section.attributes.borrow();
        let style = attrs.get("style").unwrap();
        assert!(style.contains("text-align: right"));
        assert!(style.contains("width: 60%"));
        assert!(style.contains("padding: 16px"));
        assert!(style.contains("margin: 8px 0"));
        assert!(style.contains("column-count: 3"));
        assert!(style.contains("break-inside: avoid"));
        assert!(style.contains("margin-left: auto"));
    }

    #[test]
    fn oversized_spacing_hints_are_ignored() {
        let root = tree(
            "<div id=doc><section data-section data-padding=600000000 data-margin=65 data-align=left></section></div>",
        );
        apply_print_styles(&root);
        let section = root.select_first("[data-section]").unwrap();
        let attrs = section.attributes.borrow();
        let style = attrs.get("style").unwrap();
        assert!(!style.contains("padding"));
        assert!(!style.contains("margin:"));
        assert!(style.contains("text-align: left"));
        assert_eq!(spacing_px(Some("64")), Some(512));
    }

    #[test]
    fn field_hints_keep_existing_style_first() {
        let root = tree("<div id=doc><div data-field style=\"color: red;\" data-width=50 data-align=center></div></div>");
        apply_print_styles(&root);
        let field = root.select_first("[data-field]").unwrap();
        let attrs = field.attributes.borrow();
        let style = attrs.get("style").unwrap();
        assert!(style.starts_with("color: red; break-inside: avoid"));
        assert!(style.contains("width: 50%"));
    }

    #[test]
    fn banner_is_first_child_and_carries_reason() {
        let root = tree("<div id=doc><p>conteudo</p></div>");
        inject_cancellation_banner(&root, Some("erro de <preenchimento>"));
        let first = root.first_child().unwrap();
        let text = first.text_contents();
        assert!(text.contains(CANCELLED_BANNER_TEXT));
        assert!(text.contains("Motivo: erro de <preenchimento>"));
    }

    #[test]
    fn banner_without_reason_has_single_line() {
        let root = tree("<div id=doc></div>");
        inject_cancellation_banner(&root, Some("   "));
        let text = root.text_contents();
        assert!(text.contains(CANCELLED_BANNER_TEXT));
        assert!(!text.contains("Motivo"));
    }

    #[test]
    fn snapshot_spans_viewport_width_at_dpi() {
        let root = tree("<div id=doc><p>ola</p></div>");
        let settings = snapshot_settings(Size::a4().width, 72);
        let snapshot = rasterize(
            Some(&root),
            &ExportOptions::active(),
            &settings,
            &FontBook::new(true),
        )
        .unwrap();
        assert_eq!(snapshot.width(), 595);
        assert!(snapshot.height() > 0);
        assert_eq!(snapshot.dpi, 72);
    }

    #[test]
    fn document_text_reaches_the_snapshot() {
        let root = tree("<div id=doc><p style=\"font-size:40px\">TEXTO IMPORTANTE</p></div>");
        let settings = snapshot_settings(Size::a4().width, 72);
        let snapshot = rasterize(
            Some(&root),
            &ExportOptions::active(),
            &settings,
            &FontBook::new(true),
        )
        .unwrap();
        let inked = snapshot
            .image
            .pixels()
            .filter(|p| p.0 != [255, 255, 255])
            .count();
        assert!(inked > 200, "only {inked} inked pixels");
    }

    #[test]
    fn text_without_any_font_fails_the_snapshot() {
        let root = tree("<div id=doc><p>ola</p></div>");
        let settings = snapshot_settings(Size::a4().width, 72);
        let err = rasterize(
            Some(&root),
            &ExportOptions::active(),
            &settings,
            &FontBook::new(false),
        )
        .unwrap_err();
        assert!(matches!(err, FormPressError::Asset(_)));
    }

    #[test]
    fn cancelled_snapshot_is_taller_than_active_one() {
        let root = tree("<div id=doc><p>ola</p></div>");
        let settings = snapshot_settings(Size::a4().width, 72);
        let fonts = FontBook::new(true);
        let active = rasterize(Some(&root), &ExportOptions::active(), &settings, &fonts).unwrap();
        let cancelled = rasterize(
            Some(&root),
            &ExportOptions::cancelled(Some("motivo")),
            &settings,
            &fonts,
        )
        .unwrap();
        assert!(cancelled.height() > active.height());
    }
}
