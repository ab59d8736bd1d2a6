mod canvas;
mod capture;
mod debug;
mod error;
mod excel;
mod export;
mod font;
mod geolocation;
mod layout;
mod markup;
mod metrics;
mod model;
mod notify;
mod pdf;
mod pdfinspect;
mod perf;
mod raster;
mod rasterize;
mod repository;
mod slicer;
mod template;
mod types;
mod watermark;
mod word;

pub use canvas::{Canvas, Command, Document as CanvasDocument, Page};
pub use capture::{
    CaptureError, DEFAULT_PHOTO_MAX_WIDTH, DEFAULT_PHOTO_QUALITY, MediaSource, SignaturePad,
    capture_photo, photo_data_url,
};
use debug::DebugLogger;
pub use error::FormPressError;
pub use excel::{EXCEL_HEADER, excel_bytes, sheet_rows};
pub use export::{
    CANCELLED_SUFFIX, DirectorySink, ExportReport, FileSink, MemorySink, export_file_name,
};
use font::FontBook;
pub use geolocation::{
    CancelToken, GeoError, GeoPosition, LocationProvider, RetryPolicy, Sleeper, ThreadSleeper,
    acquire_position,
};
pub use markup::{parse_document_root, render_document_html};
pub use metrics::{ExportMetrics, PageMetrics};
pub use model::{
    Align, Document, ExportFormat, Field, FieldKind, FieldLayout, FieldValue, Section,
    SectionLayout, Status, Template,
};
pub use notify::{Level, LogNotifier, MemoryNotifier, Notice, Notifier};
use pdf::PdfOptions;
pub use pdfinspect::{
    PageContentSummary, PdfInspectError, PdfInspectErrorCode, PdfInspectReport,
    inspect_pdf_bytes, inspect_pdf_path, page_summaries, page_texts,
};
use perf::{PerfLogger, timed};
pub use rasterize::{
    CANCELLED_BANNER_TEXT, ExportOptions, SPACING_UNIT_PX, Snapshot, apply_print_styles,
    inject_cancellation_banner, prepare_print_clone,
};
pub use repository::{Entity, JsonFileRepository, MemoryRepository, Repository};
pub use slicer::{PageGeometry, SliceMode, SlicePlan, plan_pages};
pub use template::FieldIssue;
pub use types::{Color, EdgeSizes, Pt, Rect, Size};
pub use watermark::WatermarkSpec;
pub use word::{render_word_html, word_bytes};

use kuchiki::NodeRef;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_DPI: u32 = 150;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;
const MAX_DPI: u32 = 600;

/// Export engine: rasterizes a document tree, slices it over pages,
/// stamps cancelled exports and hands the bytes to a sink.
pub struct Exporter {
    geometry: PageGeometry,
    dpi: u32,
    slice_mode: SliceMode,
    watermark: WatermarkSpec,
    jpeg_quality: u8,
    fonts: Arc<FontBook>,
    notifier: Arc<dyn Notifier>,
    debug: Option<Arc<DebugLogger>>,
    perf: Option<Arc<PerfLogger>>,
}

pub struct ExporterBuilder {
    geometry: PageGeometry,
    dpi: u32,
    slice_mode: SliceMode,
    watermark: WatermarkSpec,
    jpeg_quality: u8,
    font_files: Vec<PathBuf>,
    system_fonts: bool,
    notifier: Option<Arc<dyn Notifier>>,
    debug_path: Option<PathBuf>,
    perf_path: Option<PathBuf>,
}

impl Exporter {
    pub fn builder() -> ExporterBuilder {
        ExporterBuilder::new()
    }

    pub fn geometry(&self) -> PageGeometry {
        self.geometry
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// Flattened raster of `root` as it would be printed. The caller's tree
    /// is not modified.
    pub fn snapshot(
        &self,
        root: Option<&NodeRef>,
        options: &ExportOptions,
    ) -> Result<Snapshot, FormPressError> {
        let viewport = Pt::from_mm(self.geometry.content_width_mm);
        let settings = rasterize::snapshot_settings(viewport, self.dpi);
        rasterize::rasterize(root, options, &settings, &self.fonts)
    }

    /// Pages the PDF would contain for `root`, before serialisation.
    pub fn layout_pages(
        &self,
        root: Option<&NodeRef>,
        options: &ExportOptions,
    ) -> Result<CanvasDocument, FormPressError> {
        let snapshot = self.snapshot(root, options)?;
        let (mut pages, _) =
            slicer::paginate(&snapshot, &self.geometry, self.slice_mode, self.jpeg_quality)?;
        if options.cancelled {
            let notice = watermark::cancellation_notice(options.cancellation_reason.as_deref());
            watermark::apply_watermark(&mut pages, &self.watermark, Some(notice.as_str()));
        }
        Ok(pages)
    }

    /// Runs the whole pipeline and returns the PDF bytes.
    pub fn render_pdf(
        &self,
        root: Option<&NodeRef>,
        options: &ExportOptions,
        stem: &str,
    ) -> Result<(Vec<u8>, ExportMetrics), FormPressError> {
        let perf = self.perf.as_deref();
        if let Some(logger) = self.debug.as_deref() {
            logger.log_event(
                "export.start",
                stem,
                &[
                    ("cancelled", json!(options.cancelled)),
                    ("dpi", json!(self.dpi)),
                ],
            );
        }

        let snapshot = timed(perf, "export.snapshot", stem, || {
            self.snapshot(root, options)
        })?;
        let (mut pages, images) = timed(perf, "export.slice", stem, || {
            slicer::paginate(&snapshot, &self.geometry, self.slice_mode, self.jpeg_quality)
        })?;
        if options.cancelled {
            let notice = watermark::cancellation_notice(options.cancellation_reason.as_deref());
            timed(perf, "export.watermark", stem, || {
                watermark::apply_watermark(&mut pages, &self.watermark, Some(notice.as_str()))
            });
        }
        let pdf_options = PdfOptions {
            title: Some(stem.to_string()),
            ..PdfOptions::default()
        };
        let (bytes, page_metrics) = timed(perf, "export.pdf", stem, || {
            pdf::document_to_pdf(&pages, &images, &pdf_options)
        })?;

        let metrics = ExportMetrics {
            pages: page_metrics,
            snapshot_width_px: snapshot.width(),
            snapshot_height_px: snapshot.height(),
            total_bytes: bytes.len(),
        };
        if let Some(perf) = perf {
            perf.log_counts(
                "export",
                stem,
                &[
                    ("pages", metrics.pages.len() as u64),
                    ("bytes", metrics.total_bytes as u64),
                    ("snapshot_px", snapshot.height() as u64),
                ],
            );
        }
        if let Some(logger) = self.debug.as_deref() {
            logger.log_event(
                "export.pages",
                stem,
                &[
                    ("pages", json!(metrics.pages.len())),
                    ("snapshot_w", json!(snapshot.width())),
                    ("snapshot_h", json!(snapshot.height())),
                ],
            );
        }
        Ok((bytes, metrics))
    }

    /// Renders `root` to PDF and saves it as `<stem>.pdf` or
    /// `<stem>-CANCELADO.pdf`. Failures are reported to the notifier and
    /// returned.
    pub fn export_pdf(
        &self,
        root: Option<&NodeRef>,
        options: &ExportOptions,
        stem: &str,
        sink: &mut dyn FileSink,
    ) -> Result<ExportReport, FormPressError> {
        let file_name = export_file_name(stem, options.cancelled, ExportFormat::Pdf);
        tracing::info!(file = %file_name, cancelled = options.cancelled, "pdf export started");
        let result = self.render_pdf(root, options, stem).and_then(|(bytes, metrics)| {
            self.save(sink, &file_name, &bytes, stem)?;
            Ok(ExportReport::new(
                file_name.clone(),
                ExportFormat::Pdf,
                &bytes,
                options.cancelled,
                Some(metrics),
            ))
        });
        self.finish(result, "PDF")
    }

    /// Exports a filled document in the requested format.
    pub fn export_document(
        &self,
        document: &Document,
        template: &Template,
        format: ExportFormat,
        stem: &str,
        sink: &mut dyn FileSink,
    ) -> Result<ExportReport, FormPressError> {
        match format {
            ExportFormat::Pdf => {
                let html = render_document_html(document, template);
                let root = parse_document_root(&html);
                let options = if document.cancelled {
                    ExportOptions::cancelled(document.cancellation_reason.as_deref())
                } else {
                    ExportOptions::active()
                };
                self.export_pdf(root.as_ref(), &options, stem, sink)
            }
            ExportFormat::Word => {
                let file_name = export_file_name(stem, document.cancelled, format);
                let bytes = timed(self.perf.as_deref(), "export.word", stem, || {
                    word_bytes(document, template)
                });
                let result = self.save(sink, &file_name, &bytes, stem).map(|_| {
                    ExportReport::new(file_name.clone(), format, &bytes, document.cancelled, None)
                });
                self.finish(result, "Word")
            }
            ExportFormat::Excel => {
                let file_name = export_file_name(stem, document.cancelled, format);
                let result = timed(self.perf.as_deref(), "export.excel", stem, || {
                    excel_bytes(document, template)
                })
                .and_then(|bytes| {
                    self.save(sink, &file_name, &bytes, stem)?;
                    Ok(ExportReport::new(
                        file_name.clone(),
                        format,
                        &bytes,
                        document.cancelled,
                        None,
                    ))
                });
                self.finish(result, "Excel")
            }
        }
    }

    fn save(
        &self,
        sink: &mut dyn FileSink,
        file_name: &str,
        bytes: &[u8],
        stem: &str,
    ) -> Result<(), FormPressError> {
        timed(self.perf.as_deref(), "export.save", stem, || {
            sink.save(file_name, bytes)
        })
        .inspect_err(|err| {
            tracing::warn!(file = %file_name, error = %err, "saving export failed");
        })
    }

    fn finish(
        &self,
        result: Result<ExportReport, FormPressError>,
        label: &str,
    ) -> Result<ExportReport, FormPressError> {
        match &result {
            Ok(report) => {
                tracing::info!(
                    file = %report.file_name,
                    pages = report.page_count,
                    bytes = report.bytes,
                    "export finished"
                );
                if let Some(logger) = self.debug.as_deref() {
                    logger.log_event(
                        "export.saved",
                        &report.file_name,
                        &[
                            ("bytes", json!(report.bytes)),
                            ("sha256", json!(report.sha256)),
                        ],
                    );
                }
                self.notifier.notify(
                    Level::Success,
                    "Sucesso",
                    &format!("{} exportado: {}", label, report.file_name),
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, format = label, "export failed");
                self.notifier.notify(
                    Level::Error,
                    "Erro",
                    &format!("Erro ao exportar {}: {}", label, err),
                );
            }
        }
        self.emit_debug_summary("export");
        result
    }

    fn emit_debug_summary(&self, context: &str) {
        if let Some(logger) = self.debug.as_deref() {
            logger.emit_summary(context);
            logger.flush();
        }
        if let Some(perf) = self.perf.as_deref() {
            perf.flush();
        }
    }
}

impl ExporterBuilder {
    pub fn new() -> Self {
        Self {
            geometry: PageGeometry::a4(),
            dpi: DEFAULT_DPI,
            slice_mode: SliceMode::Overlay,
            watermark: WatermarkSpec::cancelled(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            font_files: Vec::new(),
            system_fonts: true,
            notifier: None,
            debug_path: None,
            perf_path: None,
        }
    }

    pub fn page_size(mut self, size: Size) -> Self {
        self.geometry.page_size = size;
        self
    }

    pub fn page_width_mm(mut self, width_mm: f32) -> Self {
        self.geometry.content_width_mm = width_mm;
        self
    }

    pub fn usable_height_mm(mut self, height_mm: f32) -> Self {
        self.geometry.usable_height_mm = height_mm;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    pub fn slice_mode(mut self, mode: SliceMode) -> Self {
        self.slice_mode = mode;
        self
    }

    pub fn watermark(mut self, spec: WatermarkSpec) -> Self {
        self.watermark = spec;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    pub fn register_font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_files.push(path.into());
        self
    }

    // Look up installed Helvetica/Arial-compatible faces when no font file
    // matches. On by default.
    pub fn system_fonts(mut self, enabled: bool) -> Self {
        self.system_fonts = enabled;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    // Enable debug logging to a JSONL file for export inspection.
    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }

    // Enable performance logging to a JSONL file for stage timings.
    pub fn perf_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.perf_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Exporter, FormPressError> {
        let geometry = self.geometry;
        let page_w_mm = geometry.page_size.width.to_mm();
        let page_h_mm = geometry.page_size.height.to_mm();
        if !(geometry.content_width_mm > 0.0 && geometry.content_width_mm <= page_w_mm + 0.01) {
            return Err(FormPressError::InvalidConfiguration(format!(
                "page width {} mm must be within the {:.1} mm sheet",
                geometry.content_width_mm, page_w_mm
            )));
        }
        if !(geometry.usable_height_mm > 0.0 && geometry.usable_height_mm <= page_h_mm + 0.01) {
            return Err(FormPressError::InvalidConfiguration(format!(
                "usable height {} mm must be within the {:.1} mm sheet",
                geometry.usable_height_mm, page_h_mm
            )));
        }
        if self.dpi == 0 || self.dpi > MAX_DPI {
            return Err(FormPressError::InvalidConfiguration(format!(
                "dpi must be in 1..={MAX_DPI}, got {}",
                self.dpi
            )));
        }
        if !(0.0..=1.0).contains(&self.watermark.opacity) {
            return Err(FormPressError::InvalidConfiguration(format!(
                "watermark opacity must be in 0..=1, got {}",
                self.watermark.opacity
            )));
        }
        if self.watermark.font_size <= Pt::ZERO {
            return Err(FormPressError::InvalidConfiguration(
                "watermark font size must be positive".to_string(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(FormPressError::InvalidConfiguration(format!(
                "jpeg quality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }

        let mut fonts = FontBook::new(self.system_fonts);
        for file in &self.font_files {
            fonts.register_file(file)?;
        }
        let debug = if let Some(path) = self.debug_path {
            Some(Arc::new(DebugLogger::new(path)?))
        } else {
            None
        };
        let perf = if let Some(path) = self.perf_path {
            Some(Arc::new(PerfLogger::new(path)?))
        } else {
            None
        };
        Ok(Exporter {
            geometry,
            dpi: self.dpi,
            slice_mode: self.slice_mode,
            watermark: self.watermark,
            jpeg_quality: self.jpeg_quality,
            fonts: Arc::new(fonts),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            debug,
            perf,
        })
    }
}

impl Default for ExporterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_root(paragraphs: usize) -> NodeRef {
        let mut html = String::from("<div data-document><section data-section data-columns=\"1\">");
        for idx in 0..paragraphs {
            html.push_str(&format!(
                "<div data-field><label>Campo {idx}</label><p data-value>Valor {idx}</p></div>"
            ));
        }
        html.push_str("</section></div>");
        parse_document_root(&html).unwrap()
    }

    fn exporter(notifier: Arc<MemoryNotifier>) -> Exporter {
        Exporter::builder()
            .dpi(48)
            .notifier(notifier)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_rejects_bad_configuration() {
        assert!(Exporter::builder().dpi(0).build().is_err());
        assert!(Exporter::builder().usable_height_mm(300.0).build().is_err());
        let mut spec = WatermarkSpec::cancelled();
        spec.opacity = 1.5;
        assert!(Exporter::builder().watermark(spec).build().is_err());
        assert!(Exporter::builder().jpeg_quality(0).build().is_err());
        let exporter = Exporter::builder().build().unwrap();
        assert_eq!(exporter.dpi(), DEFAULT_DPI);
        assert_eq!(exporter.geometry(), PageGeometry::a4());
    }

    #[test]
    fn missing_root_is_reported_not_panicked() {
        let notifier = Arc::new(MemoryNotifier::new());
        let exporter = exporter(notifier.clone());
        let mut sink = MemorySink::new();
        let err = exporter
            .export_pdf(None, &ExportOptions::active(), "relatorio", &mut sink)
            .unwrap_err();
        assert!(matches!(err, FormPressError::MissingRoot));
        assert!(sink.file_names().is_empty());
        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, Level::Error);
    }

    #[test]
    fn unpaintable_text_fails_the_export() {
        let notifier = Arc::new(MemoryNotifier::new());
        let exporter = Exporter::builder()
            .dpi(48)
            .system_fonts(false)
            .notifier(notifier.clone())
            .build()
            .unwrap();
        let mut sink = MemorySink::new();
        let err = exporter
            .export_pdf(Some(&sample_root(2)), &ExportOptions::active(), "r", &mut sink)
            .unwrap_err();
        assert!(matches!(err, FormPressError::Asset(_)));
        assert!(sink.file_names().is_empty());
        assert_eq!(notifier.notices()[0].level, Level::Error);
    }

    #[test]
    fn watermark_follows_cancellation() {
        let notifier = Arc::new(MemoryNotifier::new());
        let exporter = exporter(notifier);
        let root = sample_root(4);
        let active = exporter
            .layout_pages(Some(&root), &ExportOptions::active())
            .unwrap();
        assert!(active.pages.iter().all(|p| !p.contains_text("CANCELADO")));
        let cancelled = exporter
            .layout_pages(Some(&root), &ExportOptions::cancelled(Some("teste")))
            .unwrap();
        assert!(cancelled.pages.iter().all(|p| p.contains_text("CANCELADO")));
        assert!(cancelled.pages.iter().all(|p| p.contains_text("Motivo: teste")));
    }

    #[test]
    fn debug_and_perf_logs_record_the_export() {
        let dir = tempfile::tempdir().unwrap();
        let debug_path = dir.path().join("debug.jsonl");
        let perf_path = dir.path().join("perf.jsonl");
        {
            let exporter = Exporter::builder()
                .dpi(36)
                .notifier(Arc::new(MemoryNotifier::new()))
                .debug_log(&debug_path)
                .perf_log(&perf_path)
                .build()
                .unwrap();
            let mut sink = MemorySink::new();
            exporter
                .export_pdf(Some(&sample_root(2)), &ExportOptions::active(), "r", &mut sink)
                .unwrap();
        }
        let debug = std::fs::read_to_string(&debug_path).unwrap();
        assert!(debug.contains("\"type\":\"export.start\""));
        assert!(debug.contains("\"type\":\"debug.summary\""));
        let perf = std::fs::read_to_string(&perf_path).unwrap();
        assert!(perf.contains("\"name\":\"export.snapshot\""));
        assert!(perf.contains("\"name\":\"export.pdf\""));
    }
}
