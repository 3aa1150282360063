//! Tiling the captured unit: preview fill parameters and the export bitmap.

use tiny_skia::{
    BlendMode, FilterQuality, Paint, Pattern, Pixmap, PixmapPaint, Rect, SpreadMode, Transform,
};

use crate::raster::encode_png;
use crate::rasterizer::WatermarkUnit;

/// Horizontal pattern phase used when there is no document underneath.
pub const DEFAULT_PHASE_OFFSET: f32 = 138.0;

/// Composite operator of both tiling paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileBlend {
    Exclusion,
}

impl TileBlend {
    pub fn css_name(self) -> &'static str {
        match self {
            TileBlend::Exclusion => "exclusion",
        }
    }
}

/// Repeating background description for the live preview surface.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewFill {
    pub image_url: String,
    pub tile_width: f32,
    pub tile_height: f32,
    pub position_x: f32,
    pub position_y: f32,
    pub blend: TileBlend,
}

impl PreviewFill {
    pub fn to_css(&self) -> String {
        format!(
            "background-image: url({}); background-repeat: repeat; background-size: {}px {}px; background-position: {}px {}px; mix-blend-mode: {};",
            self.image_url,
            self.tile_width,
            self.tile_height,
            self.position_x,
            self.position_y,
            self.blend.css_name()
        )
    }
}

/// Container width over the first page width; 1 without a reference page.
pub fn preview_scale(container_width: f32, reference_width: Option<f32>) -> f32 {
    match reference_width {
        Some(w) if w > 0.0 && container_width > 0.0 => container_width / w,
        _ => 1.0,
    }
}

/// Pure recompute of the preview tiling from the unit and the surface
/// state. With no document the pattern is shifted left by `phase_offset`.
pub fn preview_fill(
    unit: &WatermarkUnit,
    scale: f32,
    document_loaded: bool,
    phase_offset: f32,
) -> PreviewFill {
    let position_x = if document_loaded { 0.0 } else { -phase_offset };
    PreviewFill {
        image_url: unit.data_url.clone(),
        tile_width: unit.width * scale,
        tile_height: unit.height * scale,
        position_x,
        position_y: 0.0,
        blend: TileBlend::Exclusion,
    }
}

/// Redraws the captured unit into a `width*density x height*density`
/// pattern tile.
pub fn scaled_unit_tile(unit: &WatermarkUnit, density: f32) -> Option<Pixmap> {
    let w = (unit.width * density).round();
    let h = (unit.height * density).round();
    if !(w >= 1.0 && h >= 1.0) {
        return None;
    }
    let mut tile = Pixmap::new(w as u32, h as u32)?;
    let src = &unit.pixmap;
    let sx = w / src.width() as f32;
    let sy = h / src.height() as f32;
    let paint = PixmapPaint {
        quality: FilterQuality::Bilinear,
        ..PixmapPaint::default()
    };
    tile.draw_pixmap(
        0,
        0,
        Pixmap::as_ref(src),
        &paint,
        Transform::from_scale(sx, sy),
        None,
    );
    Some(tile)
}

/// Fills a `canvas_width*density x canvas_height*density` canvas with the
/// repeated `unit_tile` and encodes it as PNG.
///
/// An optional background is drawn first with exclusion, stretched to the
/// canvas; the pattern is then composited with exclusion over whatever is
/// there. The pattern origin sits at `phase_offset_x` device pixels and the
/// fill rectangle starts at `-phase_offset_x`, so the left edge is covered.
pub fn render_tile(
    canvas_width: f32,
    canvas_height: f32,
    density: f32,
    unit_tile: &Pixmap,
    phase_offset_x: f32,
    background: Option<&Pixmap>,
) -> Option<Vec<u8>> {
    let pixmap = compose_tile(
        canvas_width,
        canvas_height,
        density,
        unit_tile,
        phase_offset_x,
        background,
    )?;
    match encode_png(&pixmap) {
        Ok(png) => Some(png),
        Err(err) => {
            tracing::warn!(error = %err, "tile encoding failed");
            None
        }
    }
}

pub(crate) fn compose_tile(
    canvas_width: f32,
    canvas_height: f32,
    density: f32,
    unit_tile: &Pixmap,
    phase_offset_x: f32,
    background: Option<&Pixmap>,
) -> Option<Pixmap> {
    let w = (canvas_width * density).round();
    let h = (canvas_height * density).round();
    if !(w >= 1.0 && h >= 1.0) {
        return None;
    }
    let mut canvas = Pixmap::new(w as u32, h as u32)?;

    if let Some(bg) = background {
        let paint = PixmapPaint {
            quality: FilterQuality::Bilinear,
            blend_mode: BlendMode::Exclusion,
            ..PixmapPaint::default()
        };
        let ts = Transform::from_scale(w / bg.width() as f32, h / bg.height() as f32);
        canvas.draw_pixmap(0, 0, bg.as_ref(), &paint, ts, None);
    }

    let mut paint = Paint::default();
    paint.shader = Pattern::new(
        unit_tile.as_ref(),
        SpreadMode::Repeat,
        FilterQuality::Nearest,
        1.0,
        Transform::identity(),
    );
    paint.blend_mode = BlendMode::Exclusion;
    let rect = Rect::from_xywh(-phase_offset_x, 0.0, w, h)?;
    canvas.fill_rect(
        rect,
        &paint,
        Transform::from_translate(phase_offset_x, 0.0),
        None,
    );
    Some(canvas)
}
