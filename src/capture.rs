use crate::geolocation::CancelToken;
use base64::Engine;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::fmt;
use std::time::Duration;
use tiny_skia::{FillRule, LineCap, LineJoin, Paint, PathBuilder, Pixmap, Stroke, Transform};

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    PermissionDenied,
    NoDevice,
    Timeout(Duration),
    Cancelled,
    EmptySignature,
    Encode(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::PermissionDenied => write!(f, "camera permission denied"),
            CaptureError::NoDevice => write!(f, "no capture device available"),
            CaptureError::Timeout(limit) => write!(f, "capture timed out after {:?}", limit),
            CaptureError::Cancelled => write!(f, "capture cancelled"),
            CaptureError::EmptySignature => write!(f, "signature pad is empty"),
            CaptureError::Encode(message) => write!(f, "image encoding failed: {}", message),
        }
    }
}

impl std::error::Error for CaptureError {}

/// A camera or any other frame producer.
pub trait MediaSource {
    fn capture_frame(
        &mut self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RgbImage, CaptureError>;
}

pub const DEFAULT_PHOTO_MAX_WIDTH: u32 = 1024;
pub const DEFAULT_PHOTO_QUALITY: u8 = 80;

/// Takes one frame and returns it as a JPEG data URL ready to store as a
/// field value.
pub fn capture_photo(
    source: &mut dyn MediaSource,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<String, CaptureError> {
    if cancel.is_cancelled() {
        return Err(CaptureError::Cancelled);
    }
    let frame = source.capture_frame(timeout, cancel)?;
    if cancel.is_cancelled() {
        return Err(CaptureError::Cancelled);
    }
    photo_data_url(&frame, DEFAULT_PHOTO_MAX_WIDTH, DEFAULT_PHOTO_QUALITY)
}

/// Downscales frames wider than `max_width`, keeping the aspect ratio.
pub fn photo_data_url(frame: &RgbImage, max_width: u32, quality: u8) -> Result<String, CaptureError> {
    let frame = if max_width > 0 && frame.width() > max_width {
        let height = ((frame.height() as u64 * max_width as u64) / frame.width() as u64).max(1);
        image::imageops::resize(frame, max_width, height as u32, FilterType::Triangle)
    } else {
        frame.clone()
    };
    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
    frame
        .write_with_encoder(encoder)
        .map_err(|err| CaptureError::Encode(err.to_string()))?;
    Ok(data_url("image/jpeg", &jpeg))
}

/// Collects pointer strokes and renders them as a PNG.
#[derive(Debug, Clone)]
pub struct SignaturePad {
    width: u32,
    height: u32,
    stroke_width: f32,
    strokes: Vec<Vec<(f32, f32)>>,
    drawing: bool,
}

impl SignaturePad {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            stroke_width: 2.0,
            strokes: Vec::new(),
            drawing: false,
        }
    }

    pub fn with_stroke_width(mut self, width: f32) -> Self {
        self.stroke_width = width.max(0.5);
        self
    }

    pub fn begin_stroke(&mut self, x: f32, y: f32) {
        self.strokes.push(vec![(x, y)]);
        self.drawing = true;
    }

    /// Ignored unless a stroke is in progress.
    pub fn line_to(&mut self, x: f32, y: f32) {
        if !self.drawing {
            return;
        }
        if let Some(stroke) = self.strokes.last_mut() {
            stroke.push((x, y));
        }
    }

    pub fn end_stroke(&mut self) {
        self.drawing = false;
    }

    pub fn clear(&mut self) {
        self.strokes.clear();
        self.drawing = false;
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    pub fn stroke_count(&self) -> usize {
        self.strokes.len()
    }

    pub fn to_png_data_url(&self) -> Result<String, CaptureError> {
        if self.is_empty() {
            return Err(CaptureError::EmptySignature);
        }
        let mut pixmap = Pixmap::new(self.width, self.height)
            .ok_or_else(|| CaptureError::Encode("pixmap allocation failed".to_string()))?;
        pixmap.fill(tiny_skia::Color::WHITE);

        let mut paint = Paint::default();
        paint.set_color_rgba8(0, 0, 0, 255);
        paint.anti_alias = true;
        let stroke = Stroke {
            width: self.stroke_width,
            line_cap: LineCap::Round,
            line_join: LineJoin::Round,
            ..Stroke::default()
        };

        for points in &self.strokes {
            match points.as_slice() {
                [] => {}
                [(x, y)] => {
                    // A tap leaves a dot.
                    let mut pb = PathBuilder::new();
                    pb.push_circle(*x, *y, self.stroke_width / 2.0);
                    if let Some(path) = pb.finish() {
                        pixmap.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
                    }
                }
                [(x0, y0), rest @ ..] => {
                    let mut pb = PathBuilder::new();
                    pb.move_to(*x0, *y0);
                    for (x, y) in rest {
                        pb.line_to(*x, *y);
                    }
                    if let Some(path) = pb.finish() {
                        pixmap.stroke_path(&path, &paint, &stroke, Transform::identity(), None);
                    }
                }
            }
        }

        let png = pixmap
            .encode_png()
            .map_err(|err| CaptureError::Encode(err.to_string()))?;
        Ok(data_url("image/png", &png))
    }
}

fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
