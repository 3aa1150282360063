use crate::types::{Color, Size};
use std::sync::Arc;
use tiny_skia::{Pixmap, Transform};

/// Affine matrix in PDF operand order `[a b c d e f]`, row-vector convention:
/// `x' = a*x + c*y + e`, `y' = b*x + d*y + f`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    pub fn new(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Self { a, b, c, d, e, f }
    }

    pub fn translation(tx: f32, ty: f32) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self::new(sx, 0.0, 0.0, sy, 0.0, 0.0)
    }

    pub fn rotation_deg(deg: f32) -> Self {
        let (sin, cos) = deg.to_radians().sin_cos();
        Self::new(cos, sin, -sin, cos, 0.0, 0.0)
    }

    /// PDF user space (y up) to top-left page space (y down).
    pub fn flip_y(page_height: f32) -> Self {
        Self::new(1.0, 0.0, 0.0, -1.0, 0.0, page_height)
    }

    /// `self` applied first, then `rhs`.
    pub fn concat(self, rhs: Self) -> Self {
        Self {
            a: self.a * rhs.a + self.b * rhs.c,
            b: self.a * rhs.b + self.b * rhs.d,
            c: self.c * rhs.a + self.d * rhs.c,
            d: self.c * rhs.b + self.d * rhs.d,
            e: self.e * rhs.a + self.f * rhs.c + rhs.e,
            f: self.e * rhs.b + self.f * rhs.d + rhs.f,
        }
    }

    pub fn transform_point(self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    /// Linear part only, for displacement vectors.
    pub fn transform_vector(self, x: f32, y: f32) -> (f32, f32) {
        (self.a * x + self.c * y, self.b * x + self.d * y)
    }

    /// Geometric mean of the axis scales; used to carry line widths through a CTM.
    pub fn mean_scale(self) -> f32 {
        (self.a * self.d - self.b * self.c).abs().sqrt()
    }

    pub fn to_transform(self) -> Transform {
        Transform::from_row(self.a, self.b, self.c, self.d, self.e, self.f)
    }
}

impl Default for Matrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StrokeStyle {
    /// Already mapped through the CTM into page points.
    pub width: f32,
    pub cap: u8,
    pub join: u8,
    pub miter_limit: f32,
    pub dash: Vec<f32>,
    pub dash_phase: f32,
}

impl Default for StrokeStyle {
    fn default() -> Self {
        Self {
            width: 1.0,
            cap: 0,
            join: 0,
            miter_limit: 10.0,
            dash: Vec::new(),
            dash_phase: 0.0,
        }
    }
}

/// How a glyph is looked up in the font program at raster time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GlyphRef {
    Char(char),
    Id(u16),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlacedGlyph {
    pub glyph: GlyphRef,
    /// Pen position in em units along the run baseline.
    pub x_em: f32,
    pub y_em: f32,
}

/// Display-list operation. Geometry is in top-left page space, in points.
#[derive(Clone, Debug)]
pub enum Command {
    SaveState,
    RestoreState,
    SetFillColor(Color),
    SetStrokeColor(Color),
    SetOpacity {
        fill: f32,
        stroke: f32,
    },
    MoveTo {
        x: f32,
        y: f32,
    },
    LineTo {
        x: f32,
        y: f32,
    },
    CurveTo {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        x: f32,
        y: f32,
    },
    ClosePath,
    Fill {
        evenodd: bool,
    },
    Stroke(StrokeStyle),
    FillStroke {
        evenodd: bool,
        stroke: StrokeStyle,
    },
    // Path end without painting; applies a pending clip.
    EndPath,
    // Marks the current path as a clip, applied when the path is next painted or ended.
    Clip {
        evenodd: bool,
    },
    // `transform` maps em space (y up) of the run origin into page space.
    DrawGlyphs {
        font_name: String,
        transform: Matrix,
        glyphs: Vec<PlacedGlyph>,
    },
    // `transform` maps image pixel space (row 0 on top) into page space.
    DrawImage {
        transform: Matrix,
        image: Arc<Pixmap>,
    },
}

/// Commands for one surface of `size` points.
#[derive(Clone, Debug)]
pub struct DisplayList {
    pub size: Size,
    pub commands: Vec<Command>,
}

impl DisplayList {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Color) {
        self.commands.extend([
            Command::SaveState,
            Command::SetFillColor(color),
            Command::MoveTo { x, y },
            Command::LineTo { x: x + width, y },
            Command::LineTo {
                x: x + width,
                y: y + height,
            },
            Command::LineTo { x, y: y + height },
            Command::ClosePath,
            Command::Fill { evenodd: false },
            Command::RestoreState,
        ]);
    }

    pub fn glyph_count(&self) -> usize {
        self.commands
            .iter()
            .map(|cmd| match cmd {
                Command::DrawGlyphs { glyphs, .. } => glyphs.len(),
                _ => 0,
            })
            .sum()
    }
}
