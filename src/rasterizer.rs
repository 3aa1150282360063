use std::sync::Arc;

use tiny_skia::Pixmap;

use crate::canvas::{Command, DisplayList, GlyphRef, Matrix, PlacedGlyph};
use crate::font::{FontRegistry, VerticalMetrics, shape_text};
use crate::raster::{encode_png, png_data_url, render_display_list};
use crate::unit::UnitLayout;

/// Turns a unit layout into a transparent bitmap of `size * density`
/// pixels. `None` means nothing could be captured.
pub trait Rasterizer {
    fn render(&self, layout: &UnitLayout, density: f32) -> Option<Pixmap>;
}

/// A captured watermark unit: the bitmap plus its encoded forms.
#[derive(Debug, Clone)]
pub struct WatermarkUnit {
    pub pixmap: Arc<Pixmap>,
    pub png: Vec<u8>,
    pub data_url: String,
    pub nums: usize,
    /// Logical size of the unit box.
    pub width: f32,
    pub height: f32,
    pub density: f32,
    pub fingerprint: String,
}

impl WatermarkUnit {
    pub(crate) fn from_capture(
        pixmap: Pixmap,
        layout: &UnitLayout,
        density: f32,
        fingerprint: String,
    ) -> Option<Self> {
        let png = encode_png(&pixmap).ok()?;
        let data_url = png_data_url(&png);
        Some(Self {
            pixmap: Arc::new(pixmap),
            png,
            data_url,
            nums: layout.nums(),
            width: layout.size.width.to_f32(),
            height: layout.size.height.to_f32(),
            density,
            fingerprint,
        })
    }
}

/// Software rasterizer: lays the lines out as shaped glyph runs and draws
/// them with tiny-skia.
#[derive(Debug, Clone)]
pub struct SkiaRasterizer {
    fonts: Arc<FontRegistry>,
}

impl SkiaRasterizer {
    pub fn new(fonts: Arc<FontRegistry>) -> Self {
        Self { fonts }
    }

    pub fn fonts(&self) -> &FontRegistry {
        &self.fonts
    }

    /// Registered family, else the first registered font, else the family
    /// name for system lookup.
    fn font_key(&self, family: &str) -> String {
        if self.fonts.resolve(family).is_some() {
            return family.to_string();
        }
        match self.fonts.first() {
            Some(font) => font.name.clone(),
            None => family.to_string(),
        }
    }

    /// Lines stacked and centered in the unit box, the block rotated about
    /// the box center and shrunk to fit inside the padding.
    ///
    /// `None` when no font program resolves or a non-blank line shapes to
    /// no glyphs: such a capture would come out blank.
    pub fn display_list(&self, layout: &UnitLayout) -> Option<DisplayList> {
        let mut list = DisplayList::new(layout.size);
        let style = &layout.style;
        if layout.lines.is_empty() || style.font_size <= 0.0 {
            return Some(list);
        }
        let width = layout.size.width.to_f32();
        let height = layout.size.height.to_f32();
        let font_key = self.font_key(&style.font_family);
        let Some(font_data) = self.fonts.font_data(&font_key) else {
            tracing::debug!(font = %font_key, "no font for watermark text");
            return None;
        };
        let metrics = VerticalMetrics::from_data(&font_data);

        let mut runs = Vec::with_capacity(layout.lines.len());
        for line in &layout.lines {
            let run = shape_text(&font_data, line).filter(|run| {
                line.trim().is_empty() || !run.glyphs.is_empty()
            });
            let Some(run) = run else {
                tracing::debug!(font = %font_key, line = %line, "watermark line has no glyphs");
                return None;
            };
            runs.push(run);
        }
        let widest_em = runs
            .iter()
            .map(|run| run.advance_em)
            .fold(0.0f32, f32::max);

        let n = layout.lines.len() as f32;
        let line_box_em = metrics.height_em();
        let block_w = widest_em * style.font_size;
        let block_h = n * line_box_em * style.font_size + (n - 1.0) * style.line_spacing;
        let inner_w = (width - 2.0 * style.padding).max(1.0);
        let inner_h = (height - 2.0 * style.padding).max(1.0);
        let fit = if block_w > 0.0 && block_h > 0.0 {
            (inner_w / block_w).min(inner_h / block_h).min(1.0)
        } else {
            1.0
        };
        let font_size = style.font_size * fit;
        let spacing = style.line_spacing * fit;

        let cx = width / 2.0;
        let cy = height / 2.0;
        let rotate = Matrix::translation(-cx, -cy)
            .concat(Matrix::rotation_deg(style.rotation_deg))
            .concat(Matrix::translation(cx, cy));
        let top = cy - block_h * fit / 2.0;
        let line_step = line_box_em * font_size + spacing;

        list.push(Command::SaveState);
        list.push(Command::SetFillColor(style.color));
        for (i, run) in runs.into_iter().enumerate() {
            if run.glyphs.is_empty() {
                continue;
            }
            let x = cx - run.advance_em * font_size / 2.0;
            let baseline = top + i as f32 * line_step + metrics.ascent * font_size;
            let glyphs = run
                .glyphs
                .iter()
                .map(|g| PlacedGlyph {
                    glyph: GlyphRef::Id(g.glyph_id),
                    x_em: g.x_em,
                    y_em: g.y_em,
                })
                .collect();
            list.push(Command::DrawGlyphs {
                font_name: font_key.clone(),
                transform: Matrix::new(font_size, 0.0, 0.0, -font_size, x, baseline).concat(rotate),
                glyphs,
            });
        }
        list.push(Command::RestoreState);
        Some(list)
    }
}

impl Rasterizer for SkiaRasterizer {
    fn render(&self, layout: &UnitLayout, density: f32) -> Option<Pixmap> {
        let list = self.display_list(layout)?;
        match render_display_list(&list, density, None, &self.fonts) {
            Ok(pixmap) => Some(pixmap),
            Err(err) => {
                tracing::debug!(error = %err, "unit capture failed");
                None
            }
        }
    }
}
