//! In-memory watermarking session: the uploaded document, its rendered
//! pages and selection, the watermark unit, and the exports.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::embed::{TileAnchor, embed};
use crate::error::TilemarkError;
use crate::font::FontRegistry;
use crate::pages::{PageImage, PageRenderOptions, render_pages};
use crate::perf::PerfLogger;
use crate::raster::decode_image_to_pixmap;
use crate::rasterizer::{SkiaRasterizer, WatermarkUnit};
use crate::tile::{DEFAULT_PHASE_OFFSET, PreviewFill, preview_fill, preview_scale, render_tile, scaled_unit_tile};
use crate::unit::{ContentMode, UnitBuilder, UnitSizePolicy, UnitStyle, WatermarkSpec};
use crate::viewer::{NavKey, PageCursor};

/// Display width of page thumbnails.
pub const THUMBNAIL_WIDTH: f32 = 160.0;

pub const PDF_MIME: &str = "application/pdf";
pub const PNG_MIME: &str = "image/png";

/// A file ready for download.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub file_name: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

/// `report.pdf` -> `report_watermark.pdf`. Every `.pdf` occurrence is removed.
pub fn watermarked_file_name(name: &str) -> String {
    format!("{}_watermark.pdf", name.replace(".pdf", ""))
}

pub fn blank_tile_file_name(width: u32, height: u32) -> String {
    format!("watermark_{width}x{height}@2x.png")
}

/// Handle for one upload run. Batches carry its epoch so results of a
/// superseded upload can be told apart.
#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub epoch: u64,
    pub bytes: Arc<Vec<u8>>,
    /// Wait before decoding starts, so a status indicator can paint.
    pub delay: Duration,
}

#[derive(Debug, Clone)]
struct SourceDocument {
    name: String,
    bytes: Arc<Vec<u8>>,
    /// Set once every page rendered; a failed upload leaves it false.
    complete: bool,
}

#[derive(Debug, Clone)]
struct SessionConfig {
    device_pixel_ratio: f32,
    render: PageRenderOptions,
    parse_delay: Duration,
    phase_offset: f32,
    tile_anchor: TileAnchor,
}

pub struct SessionBuilder {
    device_pixel_ratio: f32,
    content_mode: ContentMode,
    unit_size_policy: UnitSizePolicy,
    unit_style: UnitStyle,
    batch_size: usize,
    hi_dpi_width_threshold: f32,
    preview_scale: Option<f32>,
    parse_delay: Duration,
    phase_offset: f32,
    tile_anchor: TileAnchor,
    container_width: f32,
    font_dirs: Vec<PathBuf>,
    font_files: Vec<PathBuf>,
    font_programs: Vec<Vec<u8>>,
    perf_path: Option<PathBuf>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        let render = PageRenderOptions::default();
        Self {
            device_pixel_ratio: 2.0,
            content_mode: ContentMode::Presets,
            unit_size_policy: UnitSizePolicy::default(),
            unit_style: UnitStyle::default(),
            batch_size: render.batch_size,
            hi_dpi_width_threshold: render.hi_dpi_width_threshold,
            preview_scale: None,
            parse_delay: Duration::from_millis(300),
            phase_offset: DEFAULT_PHASE_OFFSET,
            tile_anchor: TileAnchor::default(),
            container_width: 0.0,
            font_dirs: Vec::new(),
            font_files: Vec::new(),
            font_programs: Vec::new(),
            perf_path: None,
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_pixel_ratio(mut self, ratio: f32) -> Self {
        self.device_pixel_ratio = ratio;
        self
    }

    pub fn content_mode(mut self, mode: ContentMode) -> Self {
        self.content_mode = mode;
        self
    }

    pub fn unit_size_policy(mut self, policy: UnitSizePolicy) -> Self {
        self.unit_size_policy = policy;
        self
    }

    pub fn unit_style(mut self, style: UnitStyle) -> Self {
        self.unit_style = style;
        self
    }

    // Pages decoded per sequential batch.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    // Pages narrower than this get the hi-dpi preview render.
    pub fn hi_dpi_width_threshold(mut self, width: f32) -> Self {
        self.hi_dpi_width_threshold = width;
        self
    }

    // Render scale for hi-dpi page previews (default: the device pixel ratio).
    pub fn preview_scale(mut self, scale: f32) -> Self {
        self.preview_scale = Some(scale);
        self
    }

    pub fn parse_delay(mut self, delay: Duration) -> Self {
        self.parse_delay = delay;
        self
    }

    // Horizontal pattern phase for previews and blank tile exports.
    pub fn phase_offset(mut self, offset: f32) -> Self {
        self.phase_offset = offset;
        self
    }

    pub fn tile_anchor(mut self, anchor: TileAnchor) -> Self {
        self.tile_anchor = anchor;
        self
    }

    pub fn container_width(mut self, width: f32) -> Self {
        self.container_width = width;
        self
    }

    pub fn font_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_dirs.push(path.into());
        self
    }

    pub fn font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_files.push(path.into());
        self
    }

    // An in-memory TrueType/OpenType program; rejected at build time when
    // it does not parse.
    pub fn font_bytes(mut self, data: Vec<u8>) -> Self {
        self.font_programs.push(data);
        self
    }

    // Enable performance logging to a JSONL file. Without it the
    // TILEMARK_PERF_LOG variable is consulted.
    pub fn perf_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.perf_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Session, TilemarkError> {
        let positive = |v: f32| v.is_finite() && v > 0.0;
        if !positive(self.device_pixel_ratio) {
            return Err(TilemarkError::InvalidConfiguration(format!(
                "device_pixel_ratio must be > 0, got {}",
                self.device_pixel_ratio
            )));
        }
        if self.batch_size == 0 {
            return Err(TilemarkError::InvalidConfiguration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if !positive(self.hi_dpi_width_threshold) {
            return Err(TilemarkError::InvalidConfiguration(
                "hi_dpi_width_threshold must be > 0".to_string(),
            ));
        }
        let hi_dpi_scale = self.preview_scale.unwrap_or(self.device_pixel_ratio);
        if !positive(hi_dpi_scale) {
            return Err(TilemarkError::InvalidConfiguration(
                "preview_scale must be > 0".to_string(),
            ));
        }
        if !self.phase_offset.is_finite() {
            return Err(TilemarkError::InvalidConfiguration(
                "phase_offset must be finite".to_string(),
            ));
        }
        if !(self.container_width.is_finite() && self.container_width >= 0.0) {
            return Err(TilemarkError::InvalidConfiguration(
                "container_width must be >= 0".to_string(),
            ));
        }
        self.unit_size_policy.validate()?;

        let mut registry = FontRegistry::new();
        for dir in &self.font_dirs {
            registry.register_dir(dir);
        }
        for file in &self.font_files {
            if registry.register_file(file).is_none() {
                tracing::warn!(path = %file.display(), "font file skipped");
            }
        }
        for data in self.font_programs {
            registry.register_bytes(data, None)?;
        }
        let perf = match self.perf_path {
            Some(path) => Some(PerfLogger::new(path)?),
            None => PerfLogger::from_env(),
        };

        let mut spec = WatermarkSpec::new(self.content_mode);
        spec.style = self.unit_style;
        spec.size_policy = self.unit_size_policy;

        Ok(Session {
            config: SessionConfig {
                device_pixel_ratio: self.device_pixel_ratio,
                render: PageRenderOptions {
                    batch_size: self.batch_size,
                    hi_dpi_width_threshold: self.hi_dpi_width_threshold,
                    hi_dpi_scale,
                    ..PageRenderOptions::default()
                },
                parse_delay: self.parse_delay,
                phase_offset: self.phase_offset,
                tile_anchor: self.tile_anchor,
            },
            rasterizer: SkiaRasterizer::new(Arc::new(registry)),
            perf,
            unit: UnitBuilder::from_spec(spec),
            document: None,
            pages: Vec::new(),
            selected: BTreeSet::new(),
            cursor: PageCursor::default(),
            reference_width: None,
            container_width: self.container_width,
            preview_scale: 1.0,
            epoch: 0,
            uploading: false,
        })
    }
}

pub struct Session {
    config: SessionConfig,
    rasterizer: SkiaRasterizer,
    perf: Option<PerfLogger>,
    unit: UnitBuilder,
    document: Option<SourceDocument>,
    pages: Vec<PageImage>,
    selected: BTreeSet<usize>,
    cursor: PageCursor,
    reference_width: Option<f32>,
    container_width: f32,
    preview_scale: f32,
    epoch: u64,
    uploading: bool,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn device_pixel_ratio(&self) -> f32 {
        self.config.device_pixel_ratio
    }

    pub fn unit(&self) -> &UnitBuilder {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut UnitBuilder {
        &mut self.unit
    }

    /// Captures the current watermark content at the device pixel ratio.
    pub fn apply_unit(&mut self) -> Result<Option<&WatermarkUnit>, TilemarkError> {
        let _span = self.perf.as_ref().map(|p| p.span("unit.apply", None));
        self.unit
            .apply(&self.rasterizer, self.config.device_pixel_ratio)
    }

    // --- document and upload ---------------------------------------------

    pub fn document_name(&self) -> Option<&str> {
        self.document.as_ref().map(|d| d.name.as_str())
    }

    pub fn has_document(&self) -> bool {
        self.document.is_some()
    }

    /// Whether the current document finished loading without error.
    pub fn is_document_complete(&self) -> bool {
        self.document.as_ref().is_some_and(|d| d.complete)
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn pages(&self) -> &[PageImage] {
        &self.pages
    }

    /// Replaces the document and resets everything derived from the old
    /// one. Batches of earlier uploads are discarded from here on.
    pub fn begin_upload(&mut self, name: &str, bytes: Vec<u8>) -> UploadTicket {
        self.epoch += 1;
        let bytes = Arc::new(bytes);
        self.document = Some(SourceDocument {
            name: name.to_string(),
            bytes: Arc::clone(&bytes),
            complete: false,
        });
        self.reset_pages();
        self.uploading = true;
        tracing::info!(epoch = self.epoch, name, bytes = bytes.len(), "upload started");
        UploadTicket {
            epoch: self.epoch,
            bytes,
            delay: self.config.parse_delay,
        }
    }

    /// Appends a rendered batch. Returns false when `epoch` is stale.
    pub fn accept_batch(&mut self, epoch: u64, batch: Vec<PageImage>) -> bool {
        if epoch != self.epoch || !self.uploading {
            tracing::debug!(
                epoch,
                current = self.epoch,
                pages = batch.len(),
                "stale page batch discarded"
            );
            return false;
        }
        self.pages.extend(batch);
        self.cursor.set_count(self.pages.len());
        true
    }

    /// Ends the upload `epoch`. On success every page is selected, the
    /// cursor returns to the first page and the preview scale is
    /// recomputed from the first page. On failure pages already accepted
    /// stay for display, the document is marked incomplete so PDF export
    /// stays blocked, and the error is handed back.
    pub fn finish_upload(
        &mut self,
        epoch: u64,
        outcome: Result<usize, TilemarkError>,
    ) -> Result<(), TilemarkError> {
        if epoch != self.epoch {
            return Ok(());
        }
        self.uploading = false;
        match outcome {
            Ok(total) => {
                if let Some(document) = self.document.as_mut() {
                    document.complete = true;
                }
                self.selected = (0..self.pages.len()).collect();
                self.cursor = PageCursor::new(self.pages.len());
                self.reference_width = self.pages.first().map(|p| p.width);
                self.recompute_preview_scale();
                tracing::info!(epoch, pages = total, "upload finished");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(epoch, error = %err, pages = self.pages.len(), "upload failed");
                Err(err)
            }
        }
    }

    /// Full upload on the calling thread: delay, batched render, finish.
    pub fn load_document(&mut self, name: &str, bytes: Vec<u8>) -> Result<usize, TilemarkError> {
        let ticket = self.begin_upload(name, bytes);
        if !ticket.delay.is_zero() {
            std::thread::sleep(ticket.delay);
        }
        let options = self.config.render.clone();
        let perf = self.perf.clone();
        let outcome = render_pages(
            ticket.bytes.as_slice(),
            &options,
            perf.as_ref(),
            Some(ticket.epoch),
            |batch| {
                self.accept_batch(ticket.epoch, batch);
            },
        );
        let total = outcome.as_ref().ok().copied();
        self.finish_upload(ticket.epoch, outcome)?;
        Ok(total.unwrap_or(self.pages.len()))
    }

    /// Drops the document and everything derived from it. The watermark
    /// unit is kept.
    pub fn clear(&mut self) {
        self.epoch += 1;
        self.document = None;
        self.uploading = false;
        self.reset_pages();
        tracing::debug!(epoch = self.epoch, "session cleared");
    }

    fn reset_pages(&mut self) {
        self.pages.clear();
        self.selected.clear();
        self.cursor = PageCursor::default();
        self.reference_width = None;
        self.preview_scale = 1.0;
    }

    // --- selection and paging --------------------------------------------

    pub fn selected_pages(&self) -> &BTreeSet<usize> {
        &self.selected
    }

    /// Flips membership of `index`; returns whether it is selected now.
    pub fn toggle_page(&mut self, index: usize) -> Result<bool, TilemarkError> {
        if index >= self.pages.len() {
            return Err(TilemarkError::InvalidConfiguration(format!(
                "page {index} out of range ({} pages)",
                self.pages.len()
            )));
        }
        if self.selected.remove(&index) {
            Ok(false)
        } else {
            self.selected.insert(index);
            Ok(true)
        }
    }

    pub fn select_all(&mut self) {
        self.selected = (0..self.pages.len()).collect();
    }

    pub fn current_page(&self) -> usize {
        self.cursor.current()
    }

    pub fn go_to_page(&mut self, index: usize) -> bool {
        self.cursor.go_to(index)
    }

    pub fn handle_key(&mut self, key: NavKey) -> bool {
        self.cursor.handle(key)
    }

    pub fn thumbnail_scale(&self, index: usize) -> Option<f32> {
        let page = self.pages.get(index)?;
        (page.width > 0.0).then(|| THUMBNAIL_WIDTH / page.width)
    }

    // --- preview -----------------------------------------------------------

    pub fn set_container_width(&mut self, width: f32) {
        self.container_width = width;
        self.recompute_preview_scale();
    }

    /// Explicit override of the tiling scale.
    pub fn set_preview_scale(&mut self, scale: f32) {
        if scale.is_finite() && scale > 0.0 {
            self.preview_scale = scale;
        }
    }

    pub fn preview_scale(&self) -> f32 {
        self.preview_scale
    }

    fn recompute_preview_scale(&mut self) {
        self.preview_scale = preview_scale(self.container_width, self.reference_width);
    }

    /// Tiling for the preview surface, from the latest unit even if it is
    /// stale.
    pub fn preview_fill(&self) -> Option<PreviewFill> {
        let unit = self.unit.unit()?;
        Some(preview_fill(
            unit,
            self.preview_scale,
            self.has_document(),
            self.config.phase_offset,
        ))
    }

    // --- exports -----------------------------------------------------------

    pub fn can_export_pdf(&self) -> bool {
        self.is_document_complete() && !self.uploading && self.unit.applied_unit().is_some()
    }

    pub fn can_export_tile(&self) -> bool {
        self.unit.applied_unit().is_some()
    }

    /// The uploaded document with the unit tiled over every selected page.
    pub fn export_pdf(&self) -> Result<ExportArtifact, TilemarkError> {
        let Some(document) = self.document.as_ref() else {
            return Err(TilemarkError::ExportBlocked("no document loaded"));
        };
        if self.uploading {
            return Err(TilemarkError::ExportBlocked("document is still loading"));
        }
        if !document.complete {
            return Err(TilemarkError::ExportBlocked("document failed to load"));
        }
        let Some(unit) = self.unit.applied_unit() else {
            return Err(TilemarkError::ExportBlocked("watermark not applied"));
        };
        let _span = self.perf.as_ref().map(|p| p.span("export.pdf", Some(self.epoch)));
        let report = embed(
            document.bytes.as_slice(),
            &unit.png,
            &self.selected,
            unit.width,
            unit.height,
            self.config.tile_anchor,
        )?;
        if let Some(perf) = &self.perf {
            perf.log_counts(
                "export.pdf",
                Some(self.epoch),
                &[
                    ("pages", report.pages.len() as u64),
                    ("draws", report.draws() as u64),
                ],
            );
        }
        Ok(ExportArtifact {
            file_name: watermarked_file_name(&document.name),
            mime: PDF_MIME,
            bytes: report.bytes,
        })
    }

    /// A `width x height` tile image of the repeated unit at the device
    /// pixel ratio, optionally composited over `background` (PNG/JPEG).
    /// `Ok(None)` means the bitmap could not be produced.
    pub fn export_tile(
        &self,
        width: u32,
        height: u32,
        background: Option<&[u8]>,
    ) -> Result<Option<ExportArtifact>, TilemarkError> {
        let Some(unit) = self.unit.applied_unit() else {
            return Err(TilemarkError::ExportBlocked("watermark not applied"));
        };
        if width == 0 || height == 0 {
            return Err(TilemarkError::InvalidConfiguration(format!(
                "tile size must be positive, got {width}x{height}"
            )));
        }
        let background = match background {
            Some(data) => Some(decode_image_to_pixmap(data).ok_or_else(|| {
                TilemarkError::Image("background image could not be decoded".to_string())
            })?),
            None => None,
        };
        let _span = self.perf.as_ref().map(|p| p.span("export.tile", None));
        let dpr = self.config.device_pixel_ratio;
        let Some(tile) = scaled_unit_tile(unit, dpr) else {
            tracing::warn!("unit tile could not be allocated");
            return Ok(None);
        };
        let png = render_tile(
            width as f32,
            height as f32,
            dpr,
            &tile,
            self.config.phase_offset,
            background.as_ref(),
        );
        Ok(png.map(|bytes| ExportArtifact {
            file_name: blank_tile_file_name(width, height),
            mime: PNG_MIME,
            bytes,
        }))
    }

    pub fn export_blank_tile(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Option<ExportArtifact>, TilemarkError> {
        self.export_tile(width, height, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{box_font, pdf_with_pages};
    use crate::presets::{CUSTOM_PRESET_KEY, size_preset};
    use crate::unit::ContentLine;
    use lopdf::Document as LoDocument;
    use lopdf::content::Content;

    fn session() -> Session {
        Session::builder()
            .parse_delay(Duration::ZERO)
            .container_width(306.0)
            .font_bytes(box_font())
            .build()
            .unwrap()
    }

    fn do_counts(bytes: &[u8]) -> Vec<usize> {
        let doc = LoDocument::load_mem(bytes).unwrap();
        doc.get_pages()
            .values()
            .map(|id| {
                let content = Content::decode(&doc.get_page_content(*id).unwrap()).unwrap();
                content
                    .operations
                    .iter()
                    .filter(|op| op.operator == "Do")
                    .count()
            })
            .collect()
    }

    fn page_image(index: usize) -> PageImage {
        PageImage {
            index,
            width: 100.0,
            height: 100.0,
            thumbnail_png: Vec::new(),
            preview_png: Vec::new(),
            preview_scale: 1.0,
        }
    }

    #[test]
    fn builder_rejects_bad_values() {
        assert!(Session::builder().device_pixel_ratio(0.0).build().is_err());
        assert!(Session::builder().batch_size(0).build().is_err());
        assert!(Session::builder().font_bytes(vec![1, 2, 3]).build().is_err());
        assert!(Session::builder().preview_scale(f32::NAN).build().is_err());
        assert!(Session::builder()
            .unit_size_policy(UnitSizePolicy::Fixed {
                width: -1.0,
                height: 5.0
            })
            .build()
            .is_err());
    }

    #[test]
    fn scenario_three_pages_two_lines() {
        let mut s = session();
        let bytes = pdf_with_pages(&[(612, 792, ""); 3]);
        assert_eq!(s.load_document("contract.pdf", bytes).unwrap(), 3);
        assert_eq!(s.selected_pages().len(), 3);
        assert_eq!(s.current_page(), 0);
        assert_eq!(s.preview_scale(), 0.5);

        let unit = s.unit_mut();
        unit.toggle_preset("confidential").unwrap();
        unit.toggle_preset(CUSTOM_PRESET_KEY).unwrap();
        unit.set_custom_text("DRAFT");
        unit.confirm_custom_text().unwrap();
        assert!(!s.can_export_pdf());
        let applied = s.apply_unit().unwrap().unwrap();
        assert_eq!((applied.width, applied.height, applied.nums), (222.0, 336.0, 2));
        assert!(s.can_export_pdf());

        let artifact = s.export_pdf().unwrap();
        assert_eq!(artifact.file_name, "contract_watermark.pdf");
        assert_eq!(artifact.mime, PDF_MIME);
        assert_eq!(do_counts(&artifact.bytes), vec![9, 9, 9]);
    }

    #[test]
    fn scenario_blank_tile_export() {
        let mut s = session();
        s.unit_mut().toggle_preset("draft").unwrap();
        assert!(!s.can_export_tile());
        s.apply_unit().unwrap();
        assert!(s.can_export_tile());
        assert!(!s.can_export_pdf());

        let size = size_preset("size1").unwrap();
        let artifact = s.export_blank_tile(size.width, size.height).unwrap().unwrap();
        assert_eq!(artifact.file_name, "watermark_800x600@2x.png");
        let img = image::load_from_memory(&artifact.bytes).unwrap();
        assert_eq!((img.width(), img.height()), (1600, 1200));
    }

    #[test]
    fn tile_export_over_background() {
        let mut s = session();
        s.unit_mut().toggle_preset("draft").unwrap();
        s.apply_unit().unwrap();
        let bg = image::RgbaImage::from_pixel(4, 4, image::Rgba([255, 255, 255, 255]));
        let mut png = std::io::Cursor::new(Vec::new());
        bg.write_to(&mut png, image::ImageFormat::Png).unwrap();
        let artifact = s.export_tile(10, 10, Some(png.get_ref().as_slice())).unwrap().unwrap();
        let img = image::load_from_memory(&artifact.bytes).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (20, 20));
        assert_eq!(img.get_pixel(0, 0).0[3], 255);
        assert!(s.export_tile(10, 10, Some(b"junk")).is_err());
    }

    #[test]
    fn exports_are_blocked_until_ready() {
        let mut s = session();
        assert!(matches!(
            s.export_pdf(),
            Err(TilemarkError::ExportBlocked(_))
        ));
        assert!(matches!(
            s.export_blank_tile(10, 10),
            Err(TilemarkError::ExportBlocked(_))
        ));
        s.load_document("a.pdf", pdf_with_pages(&[(100, 100, "")])).unwrap();
        assert!(matches!(
            s.export_pdf(),
            Err(TilemarkError::ExportBlocked("watermark not applied"))
        ));
        s.unit_mut().toggle_preset("draft").unwrap();
        s.apply_unit().unwrap();
        assert!(s.can_export_pdf());
        // Editing makes the unit stale again.
        s.unit_mut().toggle_preset("internal").unwrap();
        assert!(!s.can_export_pdf());
        assert!(s.preview_fill().is_some());
    }

    #[test]
    fn empty_selection_exports_without_draws() {
        let mut s = session();
        s.load_document("x.pdf", pdf_with_pages(&[(300, 300, ""); 2])).unwrap();
        s.unit_mut().toggle_preset("draft").unwrap();
        s.apply_unit().unwrap();
        assert!(!s.toggle_page(0).unwrap());
        assert!(!s.toggle_page(1).unwrap());
        assert!(s.toggle_page(1).unwrap());
        assert!(s.toggle_page(2).is_err());
        assert_eq!(do_counts(&s.export_pdf().unwrap().bytes), vec![0, 4]);
        s.toggle_page(1).unwrap();
        assert_eq!(do_counts(&s.export_pdf().unwrap().bytes), vec![0, 0]);
    }

    #[test]
    fn stale_batches_are_discarded() {
        let mut s = session();
        let first = s.begin_upload("one.pdf", Vec::new());
        let second = s.begin_upload("two.pdf", Vec::new());
        assert!(!s.accept_batch(first.epoch, vec![page_image(0)]));
        assert!(s.accept_batch(second.epoch, vec![page_image(0), page_image(1)]));
        s.finish_upload(first.epoch, Ok(5)).unwrap();
        assert!(s.is_uploading());
        s.finish_upload(second.epoch, Ok(2)).unwrap();
        assert!(!s.is_uploading());
        assert_eq!(s.pages().len(), 2);
        assert_eq!(s.document_name(), Some("two.pdf"));
        assert_eq!(s.selected_pages().len(), 2);
        assert!((s.preview_scale() - 3.06).abs() < 1e-5);
    }

    #[test]
    fn failed_upload_keeps_finished_pages() {
        let mut s = session();
        let ticket = s.begin_upload("bad.pdf", Vec::new());
        s.accept_batch(ticket.epoch, vec![page_image(0)]);
        let err = s
            .finish_upload(
                ticket.epoch,
                Err(TilemarkError::PageRender {
                    index: 1,
                    message: "boom".to_string(),
                }),
            )
            .unwrap_err();
        assert!(err.is_decode_failure());
        assert!(!s.is_uploading());
        assert_eq!(s.pages().len(), 1);
        assert!(!s.is_document_complete());

        let err = s.load_document("junk.pdf", b"junk".to_vec()).unwrap_err();
        assert!(err.is_decode_failure());
        assert!(!s.is_uploading());
        assert!(s.pages().is_empty());
    }

    #[test]
    fn failed_upload_blocks_pdf_export() {
        let mut s = session();
        s.unit_mut().toggle_preset("draft").unwrap();
        assert!(s.apply_unit().unwrap().is_some());

        let ticket = s.begin_upload("r.pdf", pdf_with_pages(&[(100, 100, ""); 3]));
        s.accept_batch(ticket.epoch, vec![page_image(0)]);
        s.finish_upload(
            ticket.epoch,
            Err(TilemarkError::PageRender {
                index: 1,
                message: "bad page".to_string(),
            }),
        )
        .unwrap_err();

        assert!(s.has_document());
        assert!(!s.can_export_pdf());
        assert!(matches!(
            s.export_pdf(),
            Err(TilemarkError::ExportBlocked("document failed to load"))
        ));
        // Tile export does not depend on the document.
        assert!(s.can_export_tile());

        s.load_document("ok.pdf", pdf_with_pages(&[(100, 100, "")])).unwrap();
        assert!(s.is_document_complete());
        assert!(s.can_export_pdf());
        assert!(s.export_pdf().is_ok());
    }

    #[test]
    fn clear_keeps_the_unit() {
        let mut s = session();
        s.load_document("a.pdf", pdf_with_pages(&[(200, 100, ""); 2])).unwrap();
        assert_eq!(s.thumbnail_scale(0), Some(0.8));
        s.handle_key(NavKey::End);
        assert_eq!(s.current_page(), 1);
        s.unit_mut().toggle_preset("draft").unwrap();
        s.apply_unit().unwrap();

        s.clear();
        assert!(!s.has_document());
        assert!(s.pages().is_empty());
        assert!(s.selected_pages().is_empty());
        assert_eq!(s.current_page(), 0);
        assert_eq!(s.preview_scale(), 1.0);
        assert!(s.can_export_tile());
        let fill = s.preview_fill().unwrap();
        assert_eq!(fill.position_x, -138.0);
    }

    #[test]
    fn preview_fill_follows_container() {
        let mut s = session();
        s.load_document("a.pdf", pdf_with_pages(&[(612, 792, "")])).unwrap();
        s.unit_mut()
            .set_content(vec![ContentLine::preset("draft")])
            .unwrap();
        s.apply_unit().unwrap();
        s.set_container_width(1224.0);
        let fill = s.preview_fill().unwrap();
        assert_eq!((fill.tile_width, fill.tile_height), (444.0, 336.0));
        assert_eq!(fill.position_x, 0.0);
        s.set_preview_scale(1.0);
        assert_eq!(s.preview_fill().unwrap().tile_width, 222.0);
    }

    #[test]
    fn output_names() {
        assert_eq!(watermarked_file_name("a.pdf.pdf"), "a_watermark.pdf");
        assert_eq!(watermarked_file_name("scan"), "scan_watermark.pdf");
        assert_eq!(blank_tile_file_name(1920, 1080), "watermark_1920x1080@2x.png");
    }
}
