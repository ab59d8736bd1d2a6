use crate::canvas::{Canvas, Document};
use crate::font::base14_text_width;
use crate::rasterize::CANCELLED_BANNER_TEXT;
use crate::types::{Color, Pt};
use rayon::prelude::*;

const NOTICE_FONT: &str = "Helvetica-Bold";
const NOTICE_FONT_SIZE: Pt = Pt::from_int(8);
// Sits inside the 5 mm margin above the snapshot band.
const NOTICE_TOP: Pt = Pt::from_int(3);
const NOTICE_SIDE_MARGIN: Pt = Pt::from_int(14);
const NOTICE_COLOR: Color = Color {
    r: 0.718,
    g: 0.110,
    b: 0.110,
};

/// Diagonal text stamped over every page of a cancelled export.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkSpec {
    pub text: String,
    pub color: Color,
    pub opacity: f32,
    /// Degrees in screen orientation; negative tilts the text up to the right.
    pub rotation_deg: f32,
    pub font_name: String,
    pub font_size: Pt,
}

impl WatermarkSpec {
    pub fn cancelled() -> Self {
        Self {
            text: "CANCELADO".to_string(),
            color: Color::rgb(1.0, 0.0, 0.0),
            opacity: 0.25,
            rotation_deg: -45.0,
            font_name: "Helvetica-Bold".to_string(),
            font_size: Pt::from_f32(72.0),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::cancelled()
        }
    }
}

impl Default for WatermarkSpec {
    fn default() -> Self {
        Self::cancelled()
    }
}

/// Appends the watermark to every page, after the page's own content. When
/// `notice` is given it is also printed across the top margin of each page.
pub(crate) fn apply_watermark(doc: &mut Document, spec: &WatermarkSpec, notice: Option<&str>) {
    let page_size = doc.page_size;
    let mut canvas = Canvas::new(page_size);
    stamp(&mut canvas, spec);
    if let Some(notice) = notice.map(str::trim).filter(|n| !n.is_empty()) {
        header_notice(&mut canvas, notice);
    }
    let overlay = canvas.finish().pages.swap_remove(0).commands;
    doc.pages.par_iter_mut().for_each(|page| {
        page.commands.extend(overlay.iter().cloned());
    });
}

/// Banner line carried onto every page of a cancelled export, e.g.
/// `DOCUMENTO CANCELADO - Motivo: erro`.
pub(crate) fn cancellation_notice(reason: Option<&str>) -> String {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => format!("{} - Motivo: {}", CANCELLED_BANNER_TEXT, reason),
        None => CANCELLED_BANNER_TEXT.to_string(),
    }
}

fn stamp(canvas: &mut Canvas, spec: &WatermarkSpec) {
    let page_size = canvas.page_size();
    let text_width = base14_text_width(&spec.font_name, spec.font_size, &spec.text);
    // Canvas rotation follows PDF orientation (counter-clockwise positive).
    let angle = (-spec.rotation_deg).to_radians();
    // DrawString is flipped on emission; compensate so the text box centres
    // on the translated origin.
    let local_y = Pt::ZERO - spec.font_size.mul_ratio(1, 2);
    let compensated_y = page_size.height - local_y - spec.font_size;

    canvas.begin_artifact(Some("Watermark"));
    canvas.save_state();
    canvas.set_opacity(spec.opacity, spec.opacity);
    canvas.set_fill_color(spec.color);
    canvas.translate(page_size.width.mul_ratio(1, 2), page_size.height.mul_ratio(1, 2));
    if angle.abs() > f32::EPSILON {
        canvas.rotate(angle);
    }
    canvas.set_font_name(&spec.font_name);
    canvas.set_font_size(spec.font_size);
    canvas.draw_string(Pt::ZERO - text_width.mul_ratio(1, 2), compensated_y, spec.text.clone());
    canvas.restore_state();
    canvas.end_marked_content();
}

fn header_notice(canvas: &mut Canvas, notice: &str) {
    let page_size = canvas.page_size();
    let mut font_size = NOTICE_FONT_SIZE;
    let mut width = base14_text_width(NOTICE_FONT, font_size, notice);
    let max_width = page_size.width - NOTICE_SIDE_MARGIN.mul_ratio(2, 1);
    if width > max_width && width > Pt::ZERO {
        let scale = max_width.to_f32() / width.to_f32();
        font_size = Pt::from_f32(font_size.to_f32() * scale);
        width = base14_text_width(NOTICE_FONT, font_size, notice);
    }

    canvas.begin_artifact(Some("Header"));
    canvas.save_state();
    canvas.set_fill_color(NOTICE_COLOR);
    canvas.set_font_name(NOTICE_FONT);
    canvas.set_font_size(font_size);
    canvas.draw_string(
        (page_size.width - width).mul_ratio(1, 2),
        NOTICE_TOP,
        notice.to_string(),
    );
    canvas.restore_state();
    canvas.end_marked_content();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Command, Page};
    use crate::types::{Rect, Size};

    fn three_page_doc() -> Document {
        let mut canvas = Canvas::new(Size::a4());
        for idx in 0..3 {
            if idx > 0 {
                canvas.show_page();
            }
            canvas.draw_image(
                Rect {
                    x: Pt::ZERO,
                    y: Pt::ZERO,
                    width: Pt::from_f32(100.0),
                    height: Pt::from_f32(100.0),
                },
                "snapshot",
            );
        }
        canvas.finish()
    }

    fn stamp_commands(spec: &WatermarkSpec) -> Vec<Command> {
        let mut doc = Canvas::new(Size::a4()).finish();
        apply_watermark(&mut doc, spec, None);
        doc.pages.swap_remove(0).commands
    }

    fn draw_string_x(commands: &[Command], needle: &str) -> Pt {
        commands
            .iter()
            .find_map(|c| match c {
                Command::DrawString { x, text, .. } if text.contains(needle) => Some(*x),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn every_page_gets_the_stamp_after_its_content() {
        let mut doc = three_page_doc();
        let before: Vec<Page> = doc.pages.clone();
        apply_watermark(&mut doc, &WatermarkSpec::cancelled(), None);
        assert_eq!(doc.pages.len(), 3);
        for (page, original) in doc.pages.iter().zip(before.iter()) {
            assert!(page.contains_text("CANCELADO"));
            assert_eq!(&page.commands[..original.commands.len()], &original.commands[..]);
            assert_eq!(
                page.commands[original.commands.len()],
                Command::BeginArtifact {
                    subtype: Some("Watermark".to_string())
                }
            );
            assert_eq!(page.commands.last(), Some(&Command::EndMarkedContent));
        }
    }

    #[test]
    fn stamp_is_centred_translucent_and_tilted() {
        let spec = WatermarkSpec::cancelled();
        let size = Size::a4();
        let cmds = stamp_commands(&spec);
        assert!(cmds.contains(&Command::Translate(
            size.width.mul_ratio(1, 2),
            size.height.mul_ratio(1, 2)
        )));
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::SetOpacity { fill, .. } if (*fill - 0.25).abs() < 1e-6
        )));
        let angle = cmds
            .iter()
            .find_map(|c| match c {
                Command::Rotate(angle) => Some(*angle),
                _ => None,
            })
            .unwrap();
        assert!((angle - std::f32::consts::FRAC_PI_4).abs() < 1e-5);
    }

    #[test]
    fn stamp_is_centred_with_the_pdf_font_metrics() {
        let spec = WatermarkSpec::cancelled();
        let width = base14_text_width("Helvetica-Bold", spec.font_size, "CANCELADO");
        let x = draw_string_x(&stamp_commands(&spec), "CANCELADO");
        assert_eq!(x, Pt::ZERO - width.mul_ratio(1, 2));
    }

    #[test]
    fn zero_rotation_skips_rotate() {
        let spec = WatermarkSpec {
            rotation_deg: 0.0,
            ..WatermarkSpec::text("RASCUNHO")
        };
        let cmds = stamp_commands(&spec);
        assert!(!cmds.iter().any(|c| matches!(c, Command::Rotate(_))));
    }

    #[test]
    fn notice_is_repeated_in_every_page_header() {
        let mut doc = three_page_doc();
        let notice = cancellation_notice(Some("erro de preenchimento"));
        assert_eq!(notice, "DOCUMENTO CANCELADO - Motivo: erro de preenchimento");
        apply_watermark(&mut doc, &WatermarkSpec::cancelled(), Some(notice.as_str()));
        let size = Size::a4();
        for page in &doc.pages {
            assert!(page.contains_text("Motivo: erro de preenchimento"));
            let artifacts = page
                .commands
                .iter()
                .filter(|c| matches!(c, Command::BeginArtifact { .. }))
                .count();
            assert_eq!(artifacts, 2);
            let x = draw_string_x(&page.commands, "Motivo");
            let width = base14_text_width(NOTICE_FONT, NOTICE_FONT_SIZE, &notice);
            assert_eq!(x, (size.width - width).mul_ratio(1, 2));
        }
    }

    #[test]
    fn notice_without_reason_is_the_banner_text() {
        assert_eq!(cancellation_notice(Some("  ")), CANCELLED_BANNER_TEXT);
        assert_eq!(cancellation_notice(None), CANCELLED_BANNER_TEXT);
    }

    #[test]
    fn long_notice_shrinks_to_fit_the_page() {
        let mut doc = three_page_doc();
        let notice = cancellation_notice(Some("motivo muito longo ".repeat(20).as_str()));
        apply_watermark(&mut doc, &WatermarkSpec::cancelled(), Some(notice.as_str()));
        let x = draw_string_x(&doc.pages[0].commands, "Motivo");
        assert!(x >= NOTICE_SIDE_MARGIN.mul_ratio(99, 100));
    }
}
