use crate::canvas::{Command, Page};
use crate::error::FormPressError;
use crate::font::FontBook;
use crate::types::{Color, Pt, Size};
use base64::Engine;
use image::RgbImage;
use rustybuzz::{Direction as HbDirection, Face as HbFace, UnicodeBuffer};
use std::collections::HashMap;
use tiny_skia::{
    FillRule, FilterQuality, Mask, Paint, Path, PathBuilder, Pixmap, PixmapPaint, Rect, Transform,
};
use ttf_parser::{GlyphId, OutlineBuilder};

#[derive(Clone)]
struct RasterState {
    transform: Transform,
    fill_color: Color,
    fill_opacity: f32,
    font_name: String,
    font_size: Pt,
    clip_mask: Option<Mask>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            transform: Transform::identity(),
            fill_color: Color::BLACK,
            fill_opacity: 1.0,
            font_name: "Helvetica".to_string(),
            font_size: Pt::from_f32(12.0),
            clip_mask: None,
        }
    }
}

/// Paints one command page onto a white pixmap at `dpi`.
pub(crate) fn page_to_pixmap(
    page: &Page,
    page_size: Size,
    dpi: u32,
    fonts: &FontBook,
) -> Result<Pixmap, FormPressError> {
    let width_px = pt_milli_to_px_u32(page_size.width.to_milli_i64(), dpi)?;
    let height_px = pt_milli_to_px_u32(page_size.height.to_milli_i64(), dpi)?;
    let page_height_pt = page_size.height.to_f32();
    let scale = dpi as f32 / 72.0;
    let base_transform = Transform::from_row(scale, 0.0, 0.0, -scale, 0.0, page_height_pt * scale);

    let mut pixmap = Pixmap::new(width_px, height_px).ok_or_else(|| {
        FormPressError::Raster(format!(
            "cannot allocate canvas {}x{} at {} DPI",
            width_px, height_px, dpi
        ))
    })?;
    pixmap.fill(tiny_skia::Color::WHITE);

    let mut state = RasterState::default();
    let mut stack: Vec<RasterState> = Vec::new();
    let mut image_cache: HashMap<String, Option<Pixmap>> = HashMap::new();

    for cmd in &page.commands {
        match cmd {
            Command::SaveState => stack.push(state.clone()),
            Command::RestoreState => {
                if let Some(restored) = stack.pop() {
                    state = restored;
                }
            }
            Command::Translate(x, y) => {
                // New operations apply in the current local space, as PDF `cm` does.
                state.transform = state
                    .transform
                    .pre_concat(Transform::from_translate(x.to_f32(), y.to_f32()));
            }
            Command::Rotate(angle) => {
                let deg = *angle * 180.0 / core::f32::consts::PI;
                state.transform = state.transform.pre_concat(Transform::from_rotate(deg));
            }
            Command::Meta { .. } => {}
            Command::BeginArtifact { .. } => {}
            Command::EndMarkedContent => {}
            Command::SetFillColor(color) => state.fill_color = *color,
            Command::SetOpacity { fill, .. } => state.fill_opacity = fill.clamp(0.0, 1.0),
            Command::SetFontName(name) => state.font_name = name.clone(),
            Command::SetFontSize(size) => state.font_size = *size,
            Command::ClipRect {
                x,
                y,
                width,
                height,
            } => {
                let draw_y = page_height_pt - y.to_f32() - height.to_f32();
                if let Some(rect) =
                    Rect::from_xywh(x.to_f32(), draw_y, width.to_f32(), height.to_f32())
                {
                    let path = PathBuilder::from_rect(rect);
                    let mut mask = Mask::new(pixmap.width(), pixmap.height())
                        .ok_or_else(|| FormPressError::Raster("clip mask allocation".into()))?;
                    mask.fill_path(
                        &path,
                        FillRule::Winding,
                        true,
                        base_transform.pre_concat(state.transform),
                    );
                    if let Some(existing) = state.clip_mask.as_ref() {
                        intersect_masks(&mut mask, existing);
                    }
                    state.clip_mask = Some(mask);
                }
            }
            Command::DrawString { x, y, text } => {
                draw_string(
                    &mut pixmap,
                    &state,
                    x.to_f32(),
                    y.to_f32(),
                    text,
                    page_height_pt,
                    base_transform,
                    fonts,
                )?;
            }
            Command::DrawRect {
                x,
                y,
                width,
                height,
            } => {
                let draw_y = page_height_pt - y.to_f32() - height.to_f32();
                if let Some(rect) =
                    Rect::from_xywh(x.to_f32(), draw_y, width.to_f32(), height.to_f32())
                {
                    let path = PathBuilder::from_rect(rect);
                    let paint = fill_paint(state.fill_color, state.fill_opacity);
                    pixmap.fill_path(
                        &path,
                        &paint,
                        FillRule::Winding,
                        base_transform.pre_concat(state.transform),
                        state.clip_mask.as_ref(),
                    );
                }
            }
            Command::DrawImage {
                x,
                y,
                width,
                height,
                resource_id,
            } => {
                let source = image_cache
                    .entry(resource_id.clone())
                    .or_insert_with(|| load_image_pixmap(resource_id));
                let Some(image) = source.as_ref() else {
                    continue;
                };
                let src_w = image.width() as f32;
                let src_h = image.height() as f32;
                if src_w <= 0.0 || src_h <= 0.0 {
                    continue;
                }
                let sx = width.to_f32() / src_w;
                let sy = height.to_f32() / src_h;
                // Source row 0 lands at the visual top, matching PDF /Im Do.
                let image_ts = Transform::from_row(
                    sx,
                    0.0,
                    0.0,
                    -sy,
                    x.to_f32(),
                    page_height_pt - y.to_f32(),
                );
                let device_ts = base_transform.pre_concat(state.transform.pre_concat(image_ts));
                let paint = PixmapPaint {
                    quality: FilterQuality::Bilinear,
                    opacity: state.fill_opacity.clamp(0.0, 1.0),
                    ..PixmapPaint::default()
                };
                pixmap.draw_pixmap(
                    0,
                    0,
                    image.as_ref(),
                    &paint,
                    device_ts,
                    state.clip_mask.as_ref(),
                );
            }
        }
    }

    Ok(pixmap)
}

/// Flattens the (opaque) pixmap into an RGB image.
pub(crate) fn pixmap_to_rgb(pixmap: &Pixmap) -> RgbImage {
    let mut out = RgbImage::new(pixmap.width(), pixmap.height());
    for (dst, src) in out.pixels_mut().zip(pixmap.pixels()) {
        let c = src.demultiply();
        // Composite any residual transparency over white.
        let a = c.alpha() as u16;
        let blend = |v: u8| ((v as u16 * a + 255 * (255 - a) + 127) / 255) as u8;
        dst.0 = [blend(c.red()), blend(c.green()), blend(c.blue())];
    }
    out
}

fn intersect_masks(mask: &mut Mask, existing: &Mask) {
    for (dst, src) in mask.data_mut().iter_mut().zip(existing.data().iter()) {
        *dst = ((*dst as u16 * *src as u16 + 127) / 255) as u8;
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_string(
    pixmap: &mut Pixmap,
    state: &RasterState,
    x: f32,
    y: f32,
    text: &str,
    page_height_pt: f32,
    base_transform: Transform,
    fonts: &FontBook,
) -> Result<(), FormPressError> {
    let font_size = state.font_size.to_f32().max(0.0);
    if font_size <= 0.0 || text.trim().is_empty() {
        return Ok(());
    }
    let font_data = fonts.resolve(&state.font_name).ok_or_else(|| {
        FormPressError::Asset(format!(
            "no outline font resolves for '{}'; register a font file or enable system fonts",
            state.font_name
        ))
    })?;
    let face = ttf_parser::Face::parse(font_data.as_slice(), 0).map_err(|err| {
        FormPressError::Asset(format!("font for '{}' is unreadable: {}", state.font_name, err))
    })?;

    let baseline_y = page_height_pt - y - font_size;
    let paint = fill_paint(state.fill_color, state.fill_opacity);
    let device_transform = base_transform.pre_concat(state.transform);

    for placement in layout_text_glyphs(font_data.as_slice(), text, font_size, x, baseline_y) {
        let mut builder =
            GlyphPathBuilder::new(placement.origin_x, placement.origin_y, placement.scale);
        if face
            .outline_glyph(GlyphId(placement.glyph_id), &mut builder)
            .is_none()
        {
            continue;
        }
        let Some(path) = builder.finish() else {
            continue;
        };
        pixmap.fill_path(
            &path,
            &paint,
            FillRule::Winding,
            device_transform,
            state.clip_mask.as_ref(),
        );
    }
    Ok(())
}

#[derive(Clone, Copy)]
struct GlyphPlacement {
    glyph_id: u16,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

fn layout_text_glyphs(
    font_data: &[u8],
    text: &str,
    font_size: f32,
    baseline_x: f32,
    baseline_y: f32,
) -> Vec<GlyphPlacement> {
    let Some(face) = HbFace::from_slice(font_data, 0) else {
        return Vec::new();
    };
    let units = face.units_per_em().max(1) as f32;
    let scale = font_size / units;
    let mut buffer = UnicodeBuffer::new();
    buffer.set_direction(HbDirection::LeftToRight);
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let infos = output.glyph_infos();
    let positions = output.glyph_positions();

    let mut out = Vec::with_capacity(infos.len());
    let mut pen_x = 0.0f32;
    for (info, pos) in infos.iter().zip(positions.iter()) {
        let gid = info.glyph_id as u16;
        if gid != 0 {
            out.push(GlyphPlacement {
                glyph_id: gid,
                origin_x: baseline_x + pen_x + (pos.x_offset as f32 / units) * font_size,
                origin_y: baseline_y + (pos.y_offset as f32 / units) * font_size,
                scale,
            });
        }
        pen_x += (pos.x_advance as f32 / units) * font_size;
    }
    out
}

struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    fn finish(self) -> Option<Path> {
        self.builder.finish()
    }

    fn map(&self, x: f32, y: f32) -> (f32, f32) {
        (self.origin_x + x * self.scale, self.origin_y + y * self.scale)
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x, y) = self.map(x, y);
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x2, y2) = self.map(x2, y2);
        let (x, y) = self.map(x, y);
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

fn fill_paint(color: Color, opacity: f32) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(to_sk_color(color, opacity));
    paint.anti_alias = true;
    paint
}

fn to_sk_color(color: Color, opacity: f32) -> tiny_skia::Color {
    tiny_skia::Color::from_rgba(
        color.r.clamp(0.0, 1.0),
        color.g.clamp(0.0, 1.0),
        color.b.clamp(0.0, 1.0),
        opacity.clamp(0.0, 1.0),
    )
    .unwrap_or(tiny_skia::Color::BLACK)
}

pub(crate) fn pt_milli_to_px_u32(pt_milli: i64, dpi: u32) -> Result<u32, FormPressError> {
    let px = pt_milli_to_px_i64(pt_milli, dpi)?;
    if px <= 0 {
        return Err(FormPressError::Raster(format!(
            "non-positive pixel dimension {px} for pt_milli={pt_milli} dpi={dpi}"
        )));
    }
    u32::try_from(px).map_err(|_| {
        FormPressError::Raster(format!(
            "pixel dimension out of range: {px} for pt_milli={pt_milli} dpi={dpi}"
        ))
    })
}

fn pt_milli_to_px_i64(pt_milli: i64, dpi: u32) -> Result<i64, FormPressError> {
    if dpi == 0 {
        return Err(FormPressError::InvalidConfiguration(
            "dpi must be > 0".to_string(),
        ));
    }
    let num = (pt_milli as i128).saturating_mul(dpi as i128);
    let den = 72_000_i128;
    let px = if num >= 0 {
        (num + (den / 2)) / den
    } else {
        -(((-num) + (den / 2)) / den)
    };
    i64::try_from(px).map_err(|_| {
        FormPressError::Raster(format!(
            "pixel conversion overflow: pt_milli={pt_milli} dpi={dpi}"
        ))
    })
}

// Only data URLs reach the snapshot; form images are embedded inline.
fn load_image_pixmap(source: &str) -> Option<Pixmap> {
    let (mime, data) = parse_data_uri(source)?;
    decode_image_to_pixmap(&data, &mime)
}

fn decode_image_to_pixmap(data: &[u8], mime: &str) -> Option<Pixmap> {
    let format = if mime.contains("png") {
        Some(image::ImageFormat::Png)
    } else if mime.contains("jpeg") || mime.contains("jpg") {
        Some(image::ImageFormat::Jpeg)
    } else {
        image::guess_format(data).ok()
    };
    let decoded = match format {
        Some(fmt) => image::load_from_memory_with_format(data, fmt).ok()?,
        None => image::load_from_memory(data).ok()?,
    };
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut pixmap = Pixmap::new(width, height)?;
    for (src_px, dst_px) in rgba
        .as_raw()
        .chunks_exact(4)
        .zip(pixmap.data_mut().chunks_exact_mut(4))
    {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Some(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

pub(crate) fn parse_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header
        .split(';')
        .next()
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = if header.contains(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .ok()?
    } else {
        payload.as_bytes().to_vec()
    };
    Some((mime, data))
}
