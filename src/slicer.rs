use crate::canvas::{Canvas, Document};
use crate::error::FormPressError;
use crate::pdf::{ImageStore, JpegImage};
use crate::rasterize::Snapshot;
use crate::types::{Pt, Rect, Size};
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;

const SNAPSHOT_RESOURCE: &str = "snapshot";
// Baseline JPEG stores dimensions as 16-bit values.
const MAX_JPEG_ROWS: u32 = u16::MAX as u32;

/// How each page shows its band of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceMode {
    /// Every page places the whole image, shifted up by one band per page,
    /// and clips to the band.
    #[default]
    Overlay,
    /// Every page embeds only its own rows of the image.
    Crop,
}

/// Physical page plus the printable band the snapshot is sliced into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub page_size: Size,
    pub content_width_mm: f32,
    pub usable_height_mm: f32,
}

impl PageGeometry {
    pub fn a4() -> Self {
        Self {
            page_size: Size::a4(),
            content_width_mm: 210.0,
            usable_height_mm: 287.0,
        }
    }

    fn content_width_um(&self) -> i64 {
        mm_to_um(self.content_width_mm)
    }

    fn usable_height_um(&self) -> i64 {
        mm_to_um(self.usable_height_mm)
    }

    /// Band offset from the top of the sheet; the band is vertically centred.
    fn band_top_um(&self) -> i64 {
        let page_um = mm_to_um(self.page_size.height.to_mm());
        ((page_um - self.usable_height_um()) / 2).max(0)
    }

    fn content_left_um(&self) -> i64 {
        let page_um = mm_to_um(self.page_size.width.to_mm());
        ((page_um - self.content_width_um()) / 2).max(0)
    }
}

impl Default for PageGeometry {
    fn default() -> Self {
        Self::a4()
    }
}

/// Page-by-page offsets for one snapshot, in micrometres.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlan {
    pub image_height_um: i64,
    pub page_height_um: i64,
    /// Vertical offset of the image top relative to the band top, per page
    /// (0, -page_height, -2*page_height, ...).
    pub offsets_um: Vec<i64>,
}

impl SlicePlan {
    pub fn page_count(&self) -> usize {
        self.offsets_um.len()
    }
}

/// Plans pages for a `canvas_width` x `canvas_height` pixel snapshot scaled
/// to `page_width_mm`. Page 1 always exists; further pages are added while
/// image height remains after subtracting one band per page.
pub fn plan_pages(
    canvas_width: u32,
    canvas_height: u32,
    page_width_mm: f32,
    page_height_mm: f32,
) -> Result<SlicePlan, FormPressError> {
    if canvas_width == 0 {
        return Err(FormPressError::Raster("snapshot has zero width".to_string()));
    }
    let page_width_um = mm_to_um(page_width_mm);
    let page_height_um = mm_to_um(page_height_mm);
    if page_width_um <= 0 || page_height_um <= 0 {
        return Err(FormPressError::InvalidConfiguration(format!(
            "page dimensions must be positive: {page_width_mm}x{page_height_mm} mm"
        )));
    }
    let image_height_um = div_round(
        canvas_height as i128 * page_width_um as i128,
        canvas_width as i128,
    ) as i64;

    let mut offsets_um = vec![0];
    let mut height_left = image_height_um - page_height_um;
    let mut position = 0i64;
    while height_left > 0 {
        position -= page_height_um;
        offsets_um.push(position);
        height_left -= page_height_um;
    }

    Ok(SlicePlan {
        image_height_um,
        page_height_um,
        offsets_um,
    })
}

/// Lays the snapshot out over pages and encodes the images they reference.
pub(crate) fn paginate(
    snapshot: &Snapshot,
    geometry: &PageGeometry,
    mode: SliceMode,
    jpeg_quality: u8,
) -> Result<(Document, ImageStore), FormPressError> {
    let plan = plan_pages(
        snapshot.width(),
        snapshot.height(),
        geometry.content_width_mm,
        geometry.usable_height_mm,
    )?;
    let band_top = um_to_pt(geometry.band_top_um());
    let left = um_to_pt(geometry.content_left_um());
    let width = um_to_pt(geometry.content_width_um());
    let band_height = um_to_pt(plan.page_height_um);
    let mut canvas = Canvas::new(geometry.page_size);
    let mut images = ImageStore::new();

    match mode {
        SliceMode::Overlay => {
            let total_rows = snapshot.height() as i128;
            let strips = overlay_strips(snapshot.height(), MAX_JPEG_ROWS);
            let mut placed = Vec::with_capacity(strips.len());
            for (index, (start_row, rows)) in strips.iter().enumerate() {
                let (resource, encoded) = if strips.len() == 1 {
                    (
                        SNAPSHOT_RESOURCE.to_string(),
                        encode_jpeg(&snapshot.image, jpeg_quality)?,
                    )
                } else {
                    let strip = image::imageops::crop_imm(
                        &snapshot.image,
                        0,
                        *start_row,
                        snapshot.width(),
                        *rows,
                    )
                    .to_image();
                    (
                        format!("{}-strip-{}", SNAPSHOT_RESOURCE, index + 1),
                        encode_jpeg(&strip, jpeg_quality)?,
                    )
                };
                images.insert(resource.clone(), encoded);
                let top_um = row_to_um(*start_row, total_rows, plan.image_height_um);
                let bottom_um = row_to_um(start_row + rows, total_rows, plan.image_height_um);
                placed.push((resource, top_um, bottom_um));
            }

            for (index, offset) in plan.offsets_um.iter().enumerate() {
                if index > 0 {
                    canvas.show_page();
                }
                canvas.meta("slice.page", (index + 1).to_string());
                canvas.save_state();
                canvas.clip_rect(Rect {
                    x: left,
                    y: band_top,
                    width,
                    height: band_height,
                });
                let band_start = -*offset;
                let band_end = band_start + plan.page_height_um;
                for (resource, top_um, bottom_um) in &placed {
                    if *bottom_um <= band_start || *top_um >= band_end {
                        continue;
                    }
                    canvas.draw_image(
                        Rect {
                            x: left,
                            y: band_top + um_to_pt(*offset + *top_um),
                            width,
                            height: um_to_pt(*bottom_um - *top_um),
                        },
                        resource.as_str(),
                    );
                }
                canvas.restore_state();
            }
        }
        SliceMode::Crop => {
            let total_rows = snapshot.height() as i128;
            for (index, offset) in plan.offsets_um.iter().enumerate() {
                if index > 0 {
                    canvas.show_page();
                }
                let start_um = -*offset;
                let end_um = (start_um + plan.page_height_um).min(plan.image_height_um);
                let start_row = rows_for(start_um, total_rows, plan.image_height_um);
                let end_row = rows_for(end_um, total_rows, plan.image_height_um).max(start_row + 1);
                let end_row = end_row.min(snapshot.height()).max(start_row.min(snapshot.height()));
                canvas.meta("slice.page", (index + 1).to_string());
                if end_row <= start_row {
                    continue;
                }
                let rows = end_row - start_row;
                let band = image::imageops::crop_imm(
                    &snapshot.image,
                    0,
                    start_row,
                    snapshot.width(),
                    rows,
                )
                .to_image();
                let resource = format!("{}-{}", SNAPSHOT_RESOURCE, index + 1);
                images.insert(resource.clone(), encode_jpeg(&band, jpeg_quality)?);
                let slice_height_um = div_round(
                    rows as i128 * plan.image_height_um as i128,
                    total_rows.max(1),
                ) as i64;
                canvas.draw_image(
                    Rect {
                        x: left,
                        y: band_top,
                        width,
                        height: um_to_pt(slice_height_um),
                    },
                    resource,
                );
            }
        }
    }

    Ok((canvas.finish(), images))
}

/// Splits `height` rows into `(start_row, rows)` strips of at most `max_rows`.
fn overlay_strips(height: u32, max_rows: u32) -> Vec<(u32, u32)> {
    let max_rows = max_rows.max(1);
    let mut strips = Vec::new();
    let mut start = 0u32;
    while start < height {
        let rows = (height - start).min(max_rows);
        strips.push((start, rows));
        start += rows;
    }
    strips
}

fn row_to_um(row: u32, total_rows: i128, image_height_um: i64) -> i64 {
    if total_rows <= 0 {
        return 0;
    }
    div_round(row as i128 * image_height_um as i128, total_rows) as i64
}

fn rows_for(position_um: i64, total_rows: i128, image_height_um: i64) -> u32 {
    if image_height_um <= 0 {
        return 0;
    }
    let rows = div_round(position_um as i128 * total_rows, image_height_um as i128);
    rows.clamp(0, u32::MAX as i128) as u32
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<JpegImage, FormPressError> {
    let mut data = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut data, quality.clamp(1, 100));
    image
        .write_with_encoder(encoder)
        .map_err(|err| FormPressError::Encode(format!("jpeg: {err}")))?;
    Ok(JpegImage {
        width: image.width(),
        height: image.height(),
        data,
    })
}

fn mm_to_um(mm: f32) -> i64 {
    (mm as f64 * 1000.0).round() as i64
}

fn um_to_pt(um: i64) -> Pt {
    // 1 pt = 25400/72 um.
    Pt::from_milli_i64(div_round(um as i128 * 72_000, 25_400) as i64)
}

fn div_round(num: i128, den: i128) -> i128 {
    if den == 0 {
        return 0;
    }
    if (num >= 0) == (den > 0) {
        (num.abs() + den.abs() / 2) / den.abs()
    } else {
        -((num.abs() + den.abs() / 2) / den.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Command;

    fn snapshot(width: u32, height: u32) -> Snapshot {
        Snapshot {
            image: RgbImage::from_pixel(width, height, image::Rgb([200, 200, 200])),
            dpi: 72,
        }
    }

    #[test]
    fn short_content_fits_one_page() {
        let plan = plan_pages(2100, 1000, 210.0, 287.0).unwrap();
        assert_eq!(plan.image_height_um, 100_000);
        assert_eq!(plan.offsets_um, vec![0]);
    }

    #[test]
    fn exactly_one_band_has_no_spurious_second_page() {
        let plan = plan_pages(2100, 2870, 210.0, 287.0).unwrap();
        assert_eq!(plan.image_height_um, 287_000);
        assert_eq!(plan.page_count(), 1);
        let plan = plan_pages(2100, 2871, 210.0, 287.0).unwrap();
        assert_eq!(plan.page_count(), 2);
    }

    #[test]
    fn tall_content_offsets_are_exact_multiples() {
        let plan = plan_pages(2100, 28_700, 210.0, 287.0).unwrap();
        assert_eq!(plan.page_count(), 10);
        for (k, offset) in plan.offsets_um.iter().enumerate() {
            assert_eq!(*offset, -(k as i64) * 287_000);
        }
    }

    #[test]
    fn empty_image_still_yields_first_page() {
        let plan = plan_pages(100, 0, 210.0, 287.0).unwrap();
        assert_eq!(plan.page_count(), 1);
        assert!(plan_pages(0, 10, 210.0, 287.0).is_err());
    }

    #[test]
    fn plan_is_stable_across_repeated_runs() {
        let a = plan_pages(1240, 9_999, 210.0, 287.0).unwrap();
        let b = plan_pages(1240, 9_999, 210.0, 287.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn overlay_pages_clip_and_shift_the_full_image() {
        let geometry = PageGeometry::a4();
        let (doc, images) = paginate(&snapshot(210, 600), &geometry, SliceMode::Overlay, 80).unwrap();
        assert_eq!(doc.pages.len(), 3);
        assert_eq!(images.len(), 1);
        let band_top = um_to_pt(5_000);
        for (k, page) in doc.pages.iter().enumerate() {
            assert!(page.commands.iter().any(|c| matches!(c, Command::ClipRect { .. })));
            let y = page
                .commands
                .iter()
                .find_map(|c| match c {
                    Command::DrawImage { y, .. } => Some(*y),
                    _ => None,
                })
                .unwrap();
            assert_eq!(y, band_top + um_to_pt(-(k as i64) * 287_000));
        }
    }

    #[test]
    fn strips_cover_every_row_once() {
        assert_eq!(overlay_strips(10, 4), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(overlay_strips(8, 4), vec![(0, 4), (4, 4)]);
        assert!(overlay_strips(0, 4).is_empty());
    }

    #[test]
    fn overlay_splits_snapshots_taller_than_a_jpeg() {
        let geometry = PageGeometry::a4();
        let tall = snapshot(64, 70_000);
        let (doc, images) = paginate(&tall, &geometry, SliceMode::Overlay, 50).unwrap();
        let plan = plan_pages(64, 70_000, 210.0, 287.0).unwrap();
        assert_eq!(doc.pages.len(), plan.page_count());
        assert_eq!(images.len(), 2);
        assert_eq!(images["snapshot-strip-1"].height, 65_535);
        assert_eq!(images["snapshot-strip-2"].height, 70_000 - 65_535);

        let drawn = |page: &crate::canvas::Page| -> Vec<String> {
            page.commands
                .iter()
                .filter_map(|c| match c {
                    Command::DrawImage { resource_id, .. } => Some(resource_id.clone()),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(drawn(&doc.pages[0]), vec!["snapshot-strip-1"]);
        assert_eq!(drawn(doc.pages.last().unwrap()), vec!["snapshot-strip-2"]);
        // The page holding the seam shows both strips.
        let seam_um = row_to_um(65_535, 70_000, plan.image_height_um);
        let seam_page = (seam_um / plan.page_height_um) as usize;
        if seam_um % plan.page_height_um != 0 {
            assert_eq!(
                drawn(&doc.pages[seam_page]),
                vec!["snapshot-strip-1", "snapshot-strip-2"]
            );
        }
    }

    #[test]
    fn crop_pages_embed_their_own_rows() {
        let geometry = PageGeometry::a4();
        let (doc, images) = paginate(&snapshot(210, 600), &geometry, SliceMode::Crop, 80).unwrap();
        assert_eq!(doc.pages.len(), 3);
        assert_eq!(images.len(), 3);
        assert_eq!(images["snapshot-1"].height, 287);
        assert_eq!(images["snapshot-2"].height, 287);
        assert_eq!(images["snapshot-3"].height, 26);
    }
}
