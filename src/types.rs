use fixed::types::I32F32;

/// PDF length in points, stored as fixed point so tile placement arithmetic
/// (`col * tile_width`) is exact at milli-point resolution.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Pt(I32F32);

impl Pt {
    pub const ZERO: Pt = Pt(I32F32::from_bits(0));

    pub fn from_f32(value: f32) -> Pt {
        if !value.is_finite() {
            return Pt::ZERO;
        }
        let milli = (value as f64 * 1000.0).round();
        let milli = milli.clamp(i64::MIN as f64, i64::MAX as f64) as i64;
        Pt::from_milli_i64(milli)
    }

    pub fn from_i32(value: i32) -> Pt {
        Pt::from_milli_i64((value as i64) * 1000)
    }

    pub fn to_f32(self) -> f32 {
        self.0.to_num()
    }

    pub fn to_milli_i64(self) -> i64 {
        let bits = self.0.to_bits() as i128;
        let denom = 1i128 << 32;
        let scaled = bits * 1000;
        let adj = if scaled >= 0 { denom / 2 } else { -denom / 2 };
        let milli = (scaled + adj) / denom;
        milli.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn from_milli_i64(milli: i64) -> Pt {
        Pt::from_milli_i128(milli as i128)
    }

    fn from_milli_i128(milli: i128) -> Pt {
        let denom = 1i128 << 32;
        let adj = if milli >= 0 { 500 } else { -500 };
        let bits = (milli * denom + adj) / 1000;
        let bits = bits.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        Pt(I32F32::from_bits(bits))
    }

    pub fn max(self, other: Pt) -> Pt {
        if self >= other { self } else { other }
    }

    pub fn is_positive(self) -> bool {
        self.to_milli_i64() > 0
    }

    /// Number of `step`-sized spans needed to cover `self`, i.e. `ceil(self / step)`.
    /// Non-positive inputs cover nothing.
    pub fn spans_of(self, step: Pt) -> usize {
        let total = self.to_milli_i64();
        let step = step.to_milli_i64();
        if total <= 0 || step <= 0 {
            return 0;
        }
        let count = (total + step - 1) / step;
        usize::try_from(count).unwrap_or(usize::MAX)
    }
}

impl std::ops::Add for Pt {
    type Output = Pt;
    fn add(self, rhs: Pt) -> Pt {
        Pt::from_milli_i128(self.to_milli_i64() as i128 + rhs.to_milli_i64() as i128)
    }
}

impl std::ops::Sub for Pt {
    type Output = Pt;
    fn sub(self, rhs: Pt) -> Pt {
        Pt::from_milli_i128(self.to_milli_i64() as i128 - rhs.to_milli_i64() as i128)
    }
}

impl std::ops::Mul<usize> for Pt {
    type Output = Pt;
    fn mul(self, rhs: usize) -> Pt {
        let milli = self.to_milli_i64() as i128;
        Pt::from_milli_i128(milli.saturating_mul(rhs as i128))
    }
}

impl std::ops::Mul<f32> for Pt {
    type Output = Pt;
    fn mul(self, rhs: f32) -> Pt {
        if !rhs.is_finite() {
            return Pt::ZERO;
        }
        Pt::from_f32(self.to_f32() * rhs)
    }
}

impl std::ops::Neg for Pt {
    type Output = Pt;
    fn neg(self) -> Pt {
        Pt::from_milli_i128(-(self.to_milli_i64() as i128))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub width: Pt,
    pub height: Pt,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            width: Pt::from_f32(width),
            height: Pt::from_f32(height),
        }
    }

    pub fn letter() -> Self {
        // 8.5in x 11in at 72pt/in.
        Self::new(612.0, 792.0)
    }

    pub fn a4() -> Self {
        Self::new(595.28, 841.89)
    }
}

/// Integer bitmap dimensions in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    /// Scales a logical (CSS-pixel) size by a density factor, rounding to whole pixels.
    /// Returns `None` when either side collapses to zero.
    pub fn scaled(width: f32, height: f32, density: f32) -> Option<Self> {
        if !(width.is_finite() && height.is_finite() && density.is_finite()) {
            return None;
        }
        let w = (width * density).round();
        let h = (height * density).round();
        if w < 1.0 || h < 1.0 || w > u32::MAX as f32 || h > u32::MAX as f32 {
            return None;
        }
        Some(Self {
            width: w as u32,
            height: h as u32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const BLACK: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
    };

    pub const WHITE: Color = Color {
        r: 1.0,
        g: 1.0,
        b: 1.0,
    };

    pub fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn rgb8(r: u8, g: u8, b: u8) -> Self {
        Self::rgb(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
    }

    /// Parses `#RGB` or `#RRGGBB`.
    pub fn from_hex(raw: &str) -> Option<Self> {
        let hex = raw.trim().strip_prefix('#')?;
        let nibble = |c: u8| -> Option<u8> { (c as char).to_digit(16).map(|v| v as u8) };
        let bytes = hex.as_bytes();
        match bytes.len() {
            3 => {
                let r = nibble(bytes[0])?;
                let g = nibble(bytes[1])?;
                let b = nibble(bytes[2])?;
                Some(Self::rgb8(r * 17, g * 17, b * 17))
            }
            6 => {
                let byte = |i: usize| -> Option<u8> {
                    Some(nibble(bytes[i])? * 16 + nibble(bytes[i + 1])?)
                };
                Some(Self::rgb8(byte(0)?, byte(2)?, byte(4)?))
            }
            _ => None,
        }
    }

    pub fn to_hex(self) -> String {
        let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            to_u8(self.r),
            to_u8(self.g),
            to_u8(self.b)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pt_round_trips_milli_points() {
        assert_eq!(Pt::from_f32(612.0).to_milli_i64(), 612_000);
        assert_eq!(Pt::from_f32(-0.25).to_milli_i64(), -250);
        assert_eq!((Pt::from_i32(222) * 3usize).to_milli_i64(), 666_000);
    }

    #[test]
    fn spans_of_is_ceiling_division() {
        assert_eq!(Pt::from_i32(612).spans_of(Pt::from_i32(222)), 3);
        assert_eq!(Pt::from_i32(792).spans_of(Pt::from_i32(336)), 3);
        assert_eq!(Pt::from_i32(444).spans_of(Pt::from_i32(222)), 2);
        assert_eq!(Pt::from_f32(444.001).spans_of(Pt::from_i32(222)), 3);
        assert_eq!(Pt::ZERO.spans_of(Pt::from_i32(10)), 0);
        assert_eq!(Pt::from_i32(10).spans_of(Pt::ZERO), 0);
    }

    #[test]
    fn pixel_size_scales_and_rejects_empty() {
        assert_eq!(
            PixelSize::scaled(800.0, 600.0, 2.0),
            Some(PixelSize {
                width: 1600,
                height: 1200
            })
        );
        assert_eq!(PixelSize::scaled(0.0, 600.0, 2.0), None);
        assert_eq!(PixelSize::scaled(10.0, 10.0, f32::NAN), None);
    }

    #[test]
    fn color_hex_parses_short_and_long_forms() {
        assert_eq!(Color::from_hex("#fff"), Some(Color::WHITE));
        assert_eq!(Color::from_hex("#000000"), Some(Color::BLACK));
        assert_eq!(Color::from_hex("#1a2b3c").map(Color::to_hex).as_deref(), Some("#1a2b3c"));
        assert_eq!(Color::from_hex("123456"), None);
        assert_eq!(Color::from_hex("#12345"), None);
        assert_eq!(Color::from_hex("#gg0000"), None);
    }
}
