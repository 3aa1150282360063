//! Watermark content and the builder that turns it into a rasterizable
//! layout.
//!
//! The builder owns the current content, style and unit geometry, plus the
//! last applied [`WatermarkUnit`]. Every edit clears the applied flag; the
//! previous unit stays around for preview until a new apply replaces it.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::error::{TilemarkError, ValidationIssue};
use crate::presets::{CUSTOM_PRESET_KEY, preset};
use crate::rasterizer::{Rasterizer, WatermarkUnit};
use crate::types::{Color, Pt, Size};

pub const CUSTOM_TEXT_LIMIT: usize = 20;
pub const MAX_PRESET_LINES: usize = 2;
pub const UNIT_WIDTH: f32 = 222.0;
pub const LINE_UNIT_HEIGHT: f32 = 168.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentLine {
    /// Key into the preset table; `customize` resolves to the custom text.
    Preset(String),
    /// Free-form editable line.
    Text(String),
}

impl ContentLine {
    pub fn preset(key: &str) -> Self {
        ContentLine::Preset(key.to_string())
    }

    pub fn text(text: &str) -> Self {
        ContentLine::Text(text.to_string())
    }

    fn is_custom(&self) -> bool {
        matches!(self, ContentLine::Preset(key) if key == CUSTOM_PRESET_KEY)
    }
}

/// Checkbox presets (at most two lines) or free editable lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    Presets,
    FreeText,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitStyle {
    pub color: Color,
    pub font_size: f32,
    pub rotation_deg: f32,
    /// Gap between consecutive lines; the last line has none.
    pub line_spacing: f32,
    pub padding: f32,
    pub font_family: String,
}

impl Default for UnitStyle {
    fn default() -> Self {
        Self {
            color: Color::rgb8(0xc7, 0xc7, 0xc7),
            font_size: 16.0,
            rotation_deg: -30.0,
            line_spacing: 12.0,
            padding: 16.0,
            font_family: "sans-serif".to_string(),
        }
    }
}

/// How the unit box is sized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnitSizePolicy {
    /// Fixed width; height grows by `line_height` per content line.
    PerLine { width: f32, line_height: f32 },
    /// Explicit box for the whole unit regardless of line count.
    Fixed { width: f32, height: f32 },
}

impl Default for UnitSizePolicy {
    fn default() -> Self {
        UnitSizePolicy::PerLine {
            width: UNIT_WIDTH,
            line_height: LINE_UNIT_HEIGHT,
        }
    }
}

impl UnitSizePolicy {
    pub fn unit_size(&self, nums: usize) -> Size {
        match *self {
            UnitSizePolicy::PerLine { width, line_height } => Size {
                width: Pt::from_f32(width),
                height: Pt::from_f32(line_height) * nums,
            },
            UnitSizePolicy::Fixed { width, height } => Size::new(width, height),
        }
    }

    pub fn validate(&self) -> Result<(), TilemarkError> {
        let (w, h) = match *self {
            UnitSizePolicy::PerLine { width, line_height } => (width, line_height),
            UnitSizePolicy::Fixed { width, height } => (width, height),
        };
        if !(w.is_finite() && h.is_finite() && w > 0.0 && h > 0.0) {
            return Err(TilemarkError::InvalidConfiguration(format!(
                "unit size must be positive, got {w}x{h}"
            )));
        }
        Ok(())
    }
}

/// The user's watermark description.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkSpec {
    pub mode: ContentMode,
    pub lines: Vec<ContentLine>,
    pub custom_text: String,
    pub style: UnitStyle,
    pub size_policy: UnitSizePolicy,
}

impl WatermarkSpec {
    pub fn new(mode: ContentMode) -> Self {
        Self {
            mode,
            lines: Vec::new(),
            custom_text: String::new(),
            style: UnitStyle::default(),
            size_policy: UnitSizePolicy::default(),
        }
    }

    /// Display text of each line, in order.
    pub fn resolved_lines(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|line| match line {
                ContentLine::Preset(key) if key == CUSTOM_PRESET_KEY => {
                    self.custom_text.trim().to_string()
                }
                ContentLine::Preset(key) => preset(key)
                    .map(|p| p.content.to_string())
                    .unwrap_or_default(),
                ContentLine::Text(text) => text.trim().to_string(),
            })
            .collect()
    }
}

/// Everything the rasterizer needs: resolved lines, style and the unit box.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitLayout {
    pub lines: Vec<String>,
    pub style: UnitStyle,
    pub size: Size,
}

impl UnitLayout {
    pub fn nums(&self) -> usize {
        self.lines.len()
    }

    /// Hex SHA-256 over everything that affects the captured pixels.
    pub fn fingerprint(&self, density: f32) -> String {
        let mut hasher = Sha256::new();
        for line in &self.lines {
            hasher.update(line.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.style.color.to_hex().as_bytes());
        for value in [
            self.style.font_size,
            self.style.rotation_deg,
            self.style.line_spacing,
            self.style.padding,
            density,
        ] {
            hasher.update(value.to_bits().to_le_bytes());
        }
        hasher.update(self.style.font_family.as_bytes());
        hasher.update(self.size.width.to_milli_i64().to_le_bytes());
        hasher.update(self.size.height.to_milli_i64().to_le_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

#[derive(Debug)]
pub struct UnitBuilder {
    spec: WatermarkSpec,
    text_limit: usize,
    custom_confirmed: bool,
    applied: bool,
    unit: Option<WatermarkUnit>,
}

impl UnitBuilder {
    pub fn new(mode: ContentMode) -> Self {
        Self::from_spec(WatermarkSpec::new(mode))
    }

    pub fn from_spec(spec: WatermarkSpec) -> Self {
        Self {
            spec,
            text_limit: CUSTOM_TEXT_LIMIT,
            custom_confirmed: false,
            applied: false,
            unit: None,
        }
    }

    pub fn spec(&self) -> &WatermarkSpec {
        &self.spec
    }

    pub fn mode(&self) -> ContentMode {
        self.spec.mode
    }

    pub fn nums(&self) -> usize {
        self.spec.lines.len()
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Last successfully applied unit, possibly stale.
    pub fn unit(&self) -> Option<&WatermarkUnit> {
        self.unit.as_ref()
    }

    /// Unit usable for export: applied and not edited since.
    pub fn applied_unit(&self) -> Option<&WatermarkUnit> {
        if self.applied { self.unit.as_ref() } else { None }
    }

    pub fn custom_text(&self) -> &str {
        &self.spec.custom_text
    }

    pub fn is_custom_active(&self) -> bool {
        self.spec.lines.iter().any(ContentLine::is_custom)
    }

    pub fn is_custom_confirmed(&self) -> bool {
        self.custom_confirmed
    }

    /// Replaces the content lines. In preset mode only the two most recent
    /// entries are kept.
    pub fn set_content(&mut self, lines: Vec<ContentLine>) -> Result<(), TilemarkError> {
        for line in &lines {
            check_line(self.spec.mode, line)?;
        }
        let mut lines = lines;
        if self.spec.mode == ContentMode::Presets && lines.len() > MAX_PRESET_LINES {
            lines.drain(..lines.len() - MAX_PRESET_LINES);
        }
        self.spec.lines = lines;
        if !self.is_custom_active() {
            self.custom_confirmed = false;
        }
        self.invalidate();
        Ok(())
    }

    /// Checkbox toggle. Returns whether `key` is selected afterwards.
    pub fn toggle_preset(&mut self, key: &str) -> Result<bool, TilemarkError> {
        let line = ContentLine::preset(key);
        check_line(ContentMode::Presets, &line)?;
        let mut lines = self.spec.lines.clone();
        let selected = match lines.iter().position(|l| *l == line) {
            Some(pos) => {
                lines.remove(pos);
                false
            }
            None => {
                lines.push(line);
                true
            }
        };
        self.set_content(lines)?;
        Ok(selected)
    }

    pub fn add_text_line(&mut self, text: &str) -> Result<(), TilemarkError> {
        let mut lines = self.spec.lines.clone();
        lines.push(ContentLine::text(text));
        self.set_content(lines)
    }

    pub fn set_text_line(&mut self, index: usize, text: &str) -> Result<(), TilemarkError> {
        let mut lines = self.spec.lines.clone();
        let slot = lines.get_mut(index).ok_or_else(|| {
            TilemarkError::InvalidConfiguration(format!("no content line {index}"))
        })?;
        *slot = ContentLine::text(text);
        self.set_content(lines)
    }

    pub fn remove_line(&mut self, index: usize) -> Result<(), TilemarkError> {
        if index >= self.spec.lines.len() {
            return Err(TilemarkError::InvalidConfiguration(format!(
                "no content line {index}"
            )));
        }
        let mut lines = self.spec.lines.clone();
        lines.remove(index);
        self.set_content(lines)
    }

    pub fn set_custom_text(&mut self, text: &str) {
        if self.spec.custom_text == text {
            return;
        }
        self.spec.custom_text = text.to_string();
        self.custom_confirmed = false;
        self.invalidate();
    }

    /// Marks the custom line as confirmed. Fails with the same issue
    /// `validation` would report for an empty or over-long text.
    pub fn confirm_custom_text(&mut self) -> Result<(), ValidationIssue> {
        let line = self
            .spec
            .lines
            .iter()
            .position(ContentLine::is_custom)
            .unwrap_or(0);
        if let Some(issue) = self.text_issue(line, &self.spec.custom_text) {
            return Err(issue);
        }
        self.custom_confirmed = true;
        Ok(())
    }

    pub fn set_style(&mut self, style: UnitStyle) {
        if self.spec.style != style {
            self.spec.style = style;
            self.invalidate();
        }
    }

    pub fn set_size_policy(&mut self, policy: UnitSizePolicy) -> Result<(), TilemarkError> {
        policy.validate()?;
        if self.spec.size_policy != policy {
            self.spec.size_policy = policy;
            self.invalidate();
        }
        Ok(())
    }

    /// First reason the content cannot be applied, if any.
    pub fn validation(&self) -> Option<ValidationIssue> {
        if self.spec.lines.is_empty() {
            return Some(ValidationIssue::NoContent);
        }
        for (index, line) in self.spec.lines.iter().enumerate() {
            match line {
                ContentLine::Preset(key) if key == CUSTOM_PRESET_KEY => {
                    if let Some(issue) = self.text_issue(index, &self.spec.custom_text) {
                        return Some(issue);
                    }
                    if !self.custom_confirmed {
                        return Some(ValidationIssue::UnconfirmedCustomText);
                    }
                }
                ContentLine::Preset(_) => {}
                ContentLine::Text(text) => {
                    if let Some(issue) = self.text_issue(index, text) {
                        return Some(issue);
                    }
                }
            }
        }
        None
    }

    pub fn layout(&self) -> UnitLayout {
        UnitLayout {
            lines: self.spec.resolved_lines(),
            style: self.spec.style.clone(),
            size: self.spec.size_policy.unit_size(self.nums()),
        }
    }

    /// Rasterizes the current content at `density` and marks it applied.
    ///
    /// Returns `Ok(None)` when the rasterizer produced nothing; the applied
    /// flag then stays cleared. Content identical to the current unit is
    /// not captured again.
    pub fn apply(
        &mut self,
        rasterizer: &dyn Rasterizer,
        density: f32,
    ) -> Result<Option<&WatermarkUnit>, TilemarkError> {
        if let Some(issue) = self.validation() {
            tracing::debug!(issue = %issue, "watermark apply blocked");
            return Err(TilemarkError::Validation(issue));
        }
        let layout = self.layout();
        let fingerprint = layout.fingerprint(density);
        let current = self
            .unit
            .as_ref()
            .is_some_and(|unit| unit.fingerprint == fingerprint);
        if !current {
            let Some(pixmap) = rasterizer.render(&layout, density) else {
                tracing::warn!(lines = layout.nums(), density, "watermark capture produced no output");
                return Ok(None);
            };
            let Some(unit) = WatermarkUnit::from_capture(pixmap, &layout, density, fingerprint)
            else {
                tracing::warn!("watermark capture could not be encoded");
                return Ok(None);
            };
            tracing::info!(
                lines = unit.nums,
                width = unit.width,
                height = unit.height,
                density,
                "watermark unit applied"
            );
            self.unit = Some(unit);
        }
        self.applied = true;
        Ok(self.unit.as_ref())
    }

    fn invalidate(&mut self) {
        self.applied = false;
    }

    fn text_issue(&self, line: usize, text: &str) -> Option<ValidationIssue> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Some(ValidationIssue::EmptyLine { line });
        }
        let length = trimmed.chars().count();
        if length > self.text_limit {
            return Some(ValidationIssue::TooLong {
                line,
                limit: self.text_limit,
                length,
            });
        }
        None
    }
}

fn check_line(mode: ContentMode, line: &ContentLine) -> Result<(), TilemarkError> {
    match line {
        ContentLine::Preset(key) if preset(key).is_none() => Err(
            TilemarkError::InvalidConfiguration(format!("unknown preset `{key}`")),
        ),
        ContentLine::Text(_) if mode == ContentMode::Presets => Err(
            TilemarkError::InvalidConfiguration("free text lines need free-text mode".to_string()),
        ),
        _ => Ok(()),
    }
}
