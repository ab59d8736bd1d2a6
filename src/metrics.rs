/// Per-page output of the PDF writer.
#[derive(Debug, Clone, Default)]
pub struct PageMetrics {
    pub page_number: usize,
    pub command_count: usize,
    pub content_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExportMetrics {
    pub pages: Vec<PageMetrics>,
    pub snapshot_width_px: u32,
    pub snapshot_height_px: u32,
    pub total_bytes: usize,
}
