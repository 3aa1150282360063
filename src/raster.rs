use crate::canvas::{Command, DisplayList, GlyphRef, Matrix, PlacedGlyph, StrokeStyle};
use crate::error::{TilemarkError, image_err};
use crate::font::FontRegistry;
use crate::types::{Color, PixelSize};
use base64::Engine;
use tiny_skia::{
    FillRule, FilterQuality, LineCap, LineJoin, Mask, Paint, Path, PathBuilder, Pixmap,
    PixmapPaint, Stroke, StrokeDash, Transform,
};
use ttf_parser::{GlyphId, OutlineBuilder};

#[derive(Clone)]
struct RasterState {
    fill_color: Color,
    stroke_color: Color,
    fill_opacity: f32,
    stroke_opacity: f32,
    clip_mask: Option<Mask>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            fill_color: Color::BLACK,
            stroke_color: Color::BLACK,
            fill_opacity: 1.0,
            stroke_opacity: 1.0,
            clip_mask: None,
        }
    }
}

struct PathState {
    builder: PathBuilder,
    has_path: bool,
    pending_clip: Option<FillRule>,
}

impl PathState {
    fn new() -> Self {
        Self {
            builder: PathBuilder::new(),
            has_path: false,
            pending_clip: None,
        }
    }

    fn take(&mut self) -> Option<Path> {
        if !self.has_path {
            return None;
        }
        self.has_path = false;
        std::mem::replace(&mut self.builder, PathBuilder::new()).finish()
    }
}

/// Pixel size of a surface of `width x height` points rendered at `scale`.
pub fn raster_size(width: f32, height: f32, scale: f32) -> Result<PixelSize, TilemarkError> {
    PixelSize::scaled(width, height, scale).ok_or_else(|| {
        TilemarkError::InvalidConfiguration(format!(
            "invalid raster size {width}x{height} at scale {scale}"
        ))
    })
}

/// Renders `list` at `scale` pixels per point. `background: None` leaves the
/// surface transparent.
pub fn render_display_list(
    list: &DisplayList,
    scale: f32,
    background: Option<Color>,
    registry: &FontRegistry,
) -> Result<Pixmap, TilemarkError> {
    let size = raster_size(list.size.width.to_f32(), list.size.height.to_f32(), scale)?;
    let mut pixmap = Pixmap::new(size.width, size.height).ok_or_else(|| {
        TilemarkError::InvalidConfiguration(format!(
            "cannot allocate {}x{} raster",
            size.width, size.height
        ))
    })?;
    if let Some(color) = background {
        pixmap.fill(to_sk_color(color, 1.0));
    }
    let base = Transform::from_scale(scale, scale);
    render_commands(&mut pixmap, &list.commands, base, registry);
    Ok(pixmap)
}

fn render_commands(
    pixmap: &mut Pixmap,
    commands: &[Command],
    base: Transform,
    registry: &FontRegistry,
) {
    let mut state = RasterState::default();
    let mut stack: Vec<RasterState> = Vec::new();
    let mut path = PathState::new();

    for cmd in commands {
        match cmd {
            Command::SaveState => stack.push(state.clone()),
            Command::RestoreState => {
                if let Some(restored) = stack.pop() {
                    state = restored;
                }
            }
            Command::SetFillColor(color) => state.fill_color = *color,
            Command::SetStrokeColor(color) => state.stroke_color = *color,
            Command::SetOpacity { fill, stroke } => {
                state.fill_opacity = fill.clamp(0.0, 1.0);
                state.stroke_opacity = stroke.clamp(0.0, 1.0);
            }
            Command::MoveTo { x, y } => {
                path.builder.move_to(*x, *y);
                path.has_path = true;
            }
            Command::LineTo { x, y } => {
                path.builder.line_to(*x, *y);
                path.has_path = true;
            }
            Command::CurveTo {
                x1,
                y1,
                x2,
                y2,
                x,
                y,
            } => {
                path.builder.cubic_to(*x1, *y1, *x2, *y2, *x, *y);
                path.has_path = true;
            }
            Command::ClosePath => {
                if path.has_path {
                    path.builder.close();
                }
            }
            Command::Clip { evenodd } => {
                path.pending_clip = Some(fill_rule(*evenodd));
            }
            Command::Fill { evenodd } => {
                paint_path(pixmap, &mut state, &mut path, base, Some(*evenodd), None);
            }
            Command::Stroke(style) => {
                paint_path(pixmap, &mut state, &mut path, base, None, Some(style));
            }
            Command::FillStroke { evenodd, stroke } => {
                paint_path(pixmap, &mut state, &mut path, base, Some(*evenodd), Some(stroke));
            }
            Command::EndPath => {
                paint_path(pixmap, &mut state, &mut path, base, None, None);
            }
            Command::DrawGlyphs {
                font_name,
                transform,
                glyphs,
            } => {
                draw_glyphs(pixmap, &state, font_name, *transform, glyphs, base, registry);
            }
            Command::DrawImage { transform, image } => {
                let mut paint = PixmapPaint::default();
                paint.quality = FilterQuality::Bilinear;
                paint.opacity = state.fill_opacity;
                pixmap.draw_pixmap(
                    0,
                    0,
                    Pixmap::as_ref(image),
                    &paint,
                    base.pre_concat(transform.to_transform()),
                    state.clip_mask.as_ref(),
                );
            }
        }
    }
}

fn paint_path(
    pixmap: &mut Pixmap,
    state: &mut RasterState,
    path_state: &mut PathState,
    base: Transform,
    fill: Option<bool>,
    stroke: Option<&StrokeStyle>,
) {
    let pending_clip = path_state.pending_clip.take();
    let Some(path) = path_state.take() else {
        return;
    };
    if let Some(evenodd) = fill {
        let paint = fill_paint(state.fill_color, state.fill_opacity);
        pixmap.fill_path(
            &path,
            &paint,
            fill_rule(evenodd),
            base,
            state.clip_mask.as_ref(),
        );
    }
    if let Some(style) = stroke {
        let paint = fill_paint(state.stroke_color, state.stroke_opacity);
        pixmap.stroke_path(
            &path,
            &paint,
            &build_stroke(style),
            base,
            state.clip_mask.as_ref(),
        );
    }
    if let Some(rule) = pending_clip {
        apply_clip_path(state, &path, rule, base, pixmap.width(), pixmap.height());
    }
}

fn apply_clip_path(
    state: &mut RasterState,
    path: &Path,
    fill_rule: FillRule,
    transform: Transform,
    width: u32,
    height: u32,
) {
    if let Some(mask) = state.clip_mask.as_mut() {
        mask.intersect_path(path, fill_rule, true, transform);
        return;
    }
    let Some(mut mask) = Mask::new(width, height) else {
        return;
    };
    mask.fill_path(path, fill_rule, true, transform);
    state.clip_mask = Some(mask);
}

fn draw_glyphs(
    pixmap: &mut Pixmap,
    state: &RasterState,
    font_name: &str,
    run_transform: Matrix,
    glyphs: &[PlacedGlyph],
    base: Transform,
    registry: &FontRegistry,
) {
    if glyphs.is_empty() {
        return;
    }
    let Some(font_data) = registry.font_data(font_name) else {
        tracing::trace!(font = font_name, "no font program, text skipped");
        return;
    };
    let Ok(face) = ttf_parser::Face::parse(font_data.as_slice(), 0) else {
        return;
    };
    let scale = 1.0 / face.units_per_em().max(1) as f32;
    let paint = fill_paint(state.fill_color, state.fill_opacity);
    let device = base.pre_concat(run_transform.to_transform());
    for placed in glyphs {
        let gid = match placed.glyph {
            GlyphRef::Id(gid) => GlyphId(gid),
            GlyphRef::Char(ch) => match face.glyph_index(ch) {
                Some(gid) => gid,
                None => continue,
            },
        };
        let mut builder = GlyphPathBuilder::new(placed.x_em, placed.y_em, scale);
        if face.outline_glyph(gid, &mut builder).is_none() {
            continue;
        }
        let Some(path) = builder.finish() else {
            continue;
        };
        pixmap.fill_path(
            &path,
            &paint,
            FillRule::Winding,
            device,
            state.clip_mask.as_ref(),
        );
    }
}

/// Maps font outlines (font units, y up) into em space at a pen position.
pub(crate) struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    pub(crate) fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    pub(crate) fn finish(self) -> Option<Path> {
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

fn fill_rule(evenodd: bool) -> FillRule {
    if evenodd {
        FillRule::EvenOdd
    } else {
        FillRule::Winding
    }
}

fn build_stroke(style: &StrokeStyle) -> Stroke {
    let mut stroke = Stroke {
        width: style.width.max(0.0),
        miter_limit: style.miter_limit.max(1.0),
        line_cap: match style.cap {
            1 => LineCap::Round,
            2 => LineCap::Square,
            _ => LineCap::Butt,
        },
        line_join: match style.join {
            1 => LineJoin::Round,
            2 => LineJoin::Bevel,
            _ => LineJoin::Miter,
        },
        dash: None,
    };
    if stroke.width == 0.0 {
        // Zero width is the thinnest visible line.
        stroke.width = 0.1;
    }
    if !style.dash.is_empty() {
        let mut pattern = style.dash.clone();
        if pattern.len() % 2 == 1 {
            pattern.extend_from_within(..);
        }
        stroke.dash = StrokeDash::new(pattern, style.dash_phase);
    }
    stroke
}

pub(crate) fn fill_paint(color: Color, opacity: f32) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(to_sk_color(color, opacity));
    paint.anti_alias = true;
    paint
}

pub(crate) fn to_sk_color(color: Color, opacity: f32) -> tiny_skia::Color {
    tiny_skia::Color::from_rgba(
        color.r.clamp(0.0, 1.0),
        color.g.clamp(0.0, 1.0),
        color.b.clamp(0.0, 1.0),
        opacity.clamp(0.0, 1.0),
    )
    .unwrap_or(tiny_skia::Color::BLACK)
}

/// Straight-alpha RGBA8 to a premultiplied pixmap.
pub fn rgba_to_pixmap(width: u32, height: u32, rgba: &[u8]) -> Option<Pixmap> {
    let expected = (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(4)?;
    if rgba.len() < expected {
        return None;
    }
    let mut pixmap = Pixmap::new(width, height)?;
    let data = pixmap.data_mut();
    for (dst, src) in data.chunks_exact_mut(4).zip(rgba.chunks_exact(4)) {
        let a = src[3];
        dst[0] = premul_u8(src[0], a);
        dst[1] = premul_u8(src[1], a);
        dst[2] = premul_u8(src[2], a);
        dst[3] = a;
    }
    Some(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    (((channel as u16) * (alpha as u16) + 127) / 255) as u8
}

/// Decodes PNG/JPEG bytes into a pixmap.
pub fn decode_image_to_pixmap(data: &[u8]) -> Option<Pixmap> {
    let decoded = image::load_from_memory(data).ok()?.to_rgba8();
    let (width, height) = decoded.dimensions();
    rgba_to_pixmap(width, height, decoded.as_raw())
}

pub fn encode_png(pixmap: &Pixmap) -> Result<Vec<u8>, TilemarkError> {
    pixmap.encode_png().map_err(image_err)
}

pub fn png_data_url(png: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(png);
    format!("data:image/png;base64,{b64}")
}

/// Splits a `data:<mime>;base64,<payload>` URL.
pub fn parse_data_url(url: &str) -> Option<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()?;
    Some((mime.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Size;
    use std::sync::Arc;

    fn pixel(pixmap: &Pixmap, x: u32, y: u32) -> [u8; 4] {
        let c = pixmap.pixel(x, y).unwrap();
        [c.red(), c.green(), c.blue(), c.alpha()]
    }

    #[test]
    fn fill_rect_lands_in_top_left_space() {
        let mut list = DisplayList::new(Size::new(20.0, 20.0));
        list.fill_rect(0.0, 0.0, 10.0, 5.0, Color::rgb(1.0, 0.0, 0.0));
        let pixmap =
            render_display_list(&list, 2.0, Some(Color::WHITE), &FontRegistry::new()).unwrap();
        assert_eq!((pixmap.width(), pixmap.height()), (40, 40));
        assert_eq!(pixel(&pixmap, 5, 5), [255, 0, 0, 255]);
        assert_eq!(pixel(&pixmap, 5, 30), [255, 255, 255, 255]);
        assert_eq!(pixel(&pixmap, 30, 5), [255, 255, 255, 255]);
    }

    #[test]
    fn transparent_background_stays_clear() {
        let list = DisplayList::new(Size::new(4.0, 4.0));
        let pixmap = render_display_list(&list, 1.0, None, &FontRegistry::new()).unwrap();
        assert!(pixmap.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn pending_clip_limits_later_fills() {
        let mut list = DisplayList::new(Size::new(20.0, 20.0));
        list.push(Command::MoveTo { x: 0.0, y: 0.0 });
        list.push(Command::LineTo { x: 10.0, y: 0.0 });
        list.push(Command::LineTo { x: 10.0, y: 20.0 });
        list.push(Command::LineTo { x: 0.0, y: 20.0 });
        list.push(Command::ClosePath);
        list.push(Command::Clip { evenodd: false });
        list.push(Command::EndPath);
        list.fill_rect(0.0, 0.0, 20.0, 20.0, Color::BLACK);
        let pixmap =
            render_display_list(&list, 1.0, Some(Color::WHITE), &FontRegistry::new()).unwrap();
        assert_eq!(pixel(&pixmap, 5, 10), [0, 0, 0, 255]);
        assert_eq!(pixel(&pixmap, 15, 10), [255, 255, 255, 255]);
    }

    #[test]
    fn draw_image_keeps_row_zero_on_top() {
        let mut rgba = Vec::new();
        rgba.extend_from_slice(&[255, 0, 0, 255]);
        rgba.extend_from_slice(&[0, 0, 255, 255]);
        let image = rgba_to_pixmap(1, 2, &rgba).unwrap();
        let mut list = DisplayList::new(Size::new(20.0, 20.0));
        list.push(Command::DrawImage {
            transform: Matrix::scale(20.0, 10.0),
            image: Arc::new(image),
        });
        let pixmap =
            render_display_list(&list, 1.0, Some(Color::WHITE), &FontRegistry::new()).unwrap();
        let top = pixel(&pixmap, 10, 3);
        let bottom = pixel(&pixmap, 10, 17);
        assert!(top[0] > top[2], "top {top:?}");
        assert!(bottom[2] > bottom[0], "bottom {bottom:?}");
    }

    #[test]
    fn unknown_font_draws_nothing_without_system_fonts() {
        let mut list = DisplayList::new(Size::new(10.0, 10.0));
        list.push(Command::DrawGlyphs {
            font_name: "NoSuchFont".to_string(),
            transform: Matrix::IDENTITY,
            glyphs: Vec::new(),
        });
        let pixmap = render_display_list(&list, 1.0, None, &FontRegistry::new()).unwrap();
        assert!(pixmap.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_sized_surface_is_rejected() {
        let list = DisplayList::new(Size::new(0.0, 10.0));
        assert!(render_display_list(&list, 1.0, None, &FontRegistry::new()).is_err());
    }

    #[test]
    fn data_url_round_trip() {
        let url = png_data_url(b"Hello");
        assert_eq!(url, "data:image/png;base64,SGVsbG8=");
        let (mime, data) = parse_data_url(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, b"Hello");
        assert!(parse_data_url("data:image/png,raw").is_none());
    }

    #[test]
    fn premultiplies_on_import() {
        let pixmap = rgba_to_pixmap(1, 1, &[255, 0, 0, 128]).unwrap();
        assert_eq!(pixmap.data(), &[128, 0, 0, 128]);
        assert!(rgba_to_pixmap(2, 2, &[0; 4]).is_none());
    }
}
