mod canvas;
mod embed;
mod error;
#[cfg(test)]
mod fixtures;
mod font;
mod pages;
mod pdf_raster;
mod perf;
mod presets;
mod raster;
mod rasterizer;
mod session;
mod tile;
mod types;
mod unit;
mod viewer;

pub use canvas::{Command, DisplayList, GlyphRef, Matrix, PlacedGlyph, StrokeStyle};
pub use embed::{
    EmbedReport, PagePlacement, TileAnchor, TileGrid, embed, tile_grid, tile_origins,
};
pub use error::{TilemarkError, ValidationIssue};
pub use font::{FONT_DIR_ENV, FontRegistry, ShapedGlyph, ShapedRun, VerticalMetrics, shape_text};
pub use pages::{PageImage, PageRenderOptions, page_count, render_pages};
pub use pdf_raster::{PageGeometry, PdfPages, page_geometry};
pub use perf::{PERF_LOG_ENV, PerfLogger};
pub use presets::{
    CUSTOM_PRESET_KEY, PRESETS, Preset, SIZE_PRESETS, SizePreset, preset, size_preset,
};
pub use raster::{
    decode_image_to_pixmap, encode_png, parse_data_url, png_data_url, render_display_list,
};
pub use rasterizer::{Rasterizer, SkiaRasterizer, WatermarkUnit};
pub use session::{
    ExportArtifact, PDF_MIME, PNG_MIME, Session, SessionBuilder, THUMBNAIL_WIDTH, UploadTicket,
    blank_tile_file_name, watermarked_file_name,
};
pub use tile::{
    DEFAULT_PHASE_OFFSET, PreviewFill, TileBlend, preview_fill, preview_scale, render_tile,
    scaled_unit_tile,
};
pub use types::{Color, PixelSize, Pt, Size};
pub use unit::{
    CUSTOM_TEXT_LIMIT, ContentLine, ContentMode, LINE_UNIT_HEIGHT, MAX_PRESET_LINES, UNIT_WIDTH,
    UnitBuilder, UnitLayout, UnitSizePolicy, UnitStyle, WatermarkSpec,
};
pub use viewer::{InputHub, NavKey, PageCursor, Subscription, Viewer};

/// Re-exported so callers can hand bitmaps to [`render_tile`] without
/// depending on tiny-skia themselves.
pub use tiny_skia::Pixmap;
