use crate::error::TilemarkError;
use rustybuzz::{Direction as HbDirection, Face as HbFace, UnicodeBuffer};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub const FONT_DIR_ENV: &str = "TILEMARK_FONT_DIR";

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct TextWidthKey {
    font_index: usize,
    size_milli: i64,
    text: String,
}

#[derive(Debug)]
struct TextWidthCache {
    map: HashMap<TextWidthKey, f32>,
    order: VecDeque<TextWidthKey>,
    max_entries: usize,
}

impl TextWidthCache {
    fn new(max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    fn get(&self, key: &TextWidthKey) -> Option<f32> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: TextWidthKey, value: f32) {
        if self.map.contains_key(&key) {
            return;
        }
        self.map.insert(key.clone(), value);
        self.order.push_back(key);
        while self.map.len() > self.max_entries {
            match self.order.pop_front() {
                Some(old) => {
                    self.map.remove(&old);
                }
                None => break,
            }
        }
    }
}

/// Fonts known by name: user-supplied files for the watermark text and
/// programs embedded in uploaded PDFs.
#[derive(Debug)]
pub struct FontRegistry {
    fonts: Vec<RegisteredFont>,
    lookup: HashMap<String, usize>,
    text_width_cache: Mutex<TextWidthCache>,
}

#[derive(Debug)]
pub struct RegisteredFont {
    pub name: String,
    pub data: Arc<Vec<u8>>,
    pub metrics: VerticalMetrics,
}

/// Ascent/descent in em units (descent negative).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerticalMetrics {
    pub ascent: f32,
    pub descent: f32,
}

impl VerticalMetrics {
    pub const FALLBACK: VerticalMetrics = VerticalMetrics {
        ascent: 0.8,
        descent: -0.2,
    };

    fn from_face(face: &ttf_parser::Face<'_>) -> Self {
        let upem = face.units_per_em().max(1) as f32;
        let ascent = face.ascender() as f32 / upem;
        let descent = face.descender() as f32 / upem;
        if ascent <= 0.0 || ascent - descent <= 0.0 {
            return Self::FALLBACK;
        }
        Self { ascent, descent }
    }

    /// Metrics of the first face in `data`; `FALLBACK` when it does not parse.
    pub fn from_data(data: &[u8]) -> Self {
        ttf_parser::Face::parse(data, 0)
            .map(|face| Self::from_face(&face))
            .unwrap_or(Self::FALLBACK)
    }

    pub fn height_em(self) -> f32 {
        self.ascent - self.descent
    }
}

impl Default for FontRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FontRegistry {
    pub fn new() -> Self {
        Self {
            fonts: Vec::new(),
            lookup: HashMap::new(),
            text_width_cache: Mutex::new(TextWidthCache::new(4_096)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    pub fn register_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let Ok(entries) = fs::read_dir(path) else {
            tracing::debug!(dir = %path.display(), "font dir not readable");
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                self.register_file(path);
            }
        }
    }

    /// Registers a `.ttf`/`.otf` file; anything else is skipped silently.
    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Option<String> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|v| v.to_str())?.to_ascii_lowercase();
        if ext != "ttf" && ext != "otf" {
            return None;
        }
        let data = fs::read(path).ok()?;
        let stem = path.file_stem().and_then(|v| v.to_str());
        self.register_bytes(data, stem).ok()
    }

    pub fn register_bytes(
        &mut self,
        data: Vec<u8>,
        source_name: Option<&str>,
    ) -> Result<String, TilemarkError> {
        let source = source_name.unwrap_or("EmbeddedFont");
        let Ok(face) = ttf_parser::Face::parse(&data, 0) else {
            return Err(TilemarkError::InvalidConfiguration(format!(
                "invalid font data for {source}"
            )));
        };
        let (name, aliases) = font_names(&face, source);
        let metrics = VerticalMetrics::from_face(&face);
        let index = self.fonts.len();
        self.fonts.push(RegisteredFont {
            name: name.clone(),
            data: Arc::new(data),
            metrics,
        });

        for alias in std::iter::once(name.clone()).chain(aliases) {
            let key = normalize_name(&alias);
            if key.is_empty() || self.lookup.contains_key(&key) {
                continue;
            }
            self.lookup.insert(key, index);
        }
        tracing::debug!(font = %name, "registered font");
        Ok(name)
    }

    pub fn resolve(&self, name: &str) -> Option<&RegisteredFont> {
        let key = normalize_name(name);
        self.lookup
            .get(&key)
            .and_then(|index| self.fonts.get(*index))
    }

    /// First registered font, used when a requested name is unknown.
    pub fn first(&self) -> Option<&RegisteredFont> {
        self.fonts.first()
    }

    /// Font program bytes for `name`: registry first, then the system font
    /// directories.
    pub fn font_data(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(font) = self.resolve(name) {
            return Some(font.data.clone());
        }
        resolve_system_font_bytes(name)
    }

    /// Advance width of `text` in points. Unknown fonts fall back to
    /// `0.6 * size` per character.
    pub fn measure_text_width(&self, name: &str, font_size: f32, text: &str) -> f32 {
        let fallback = (font_size * 0.6).max(1.0) * text.chars().count() as f32;
        let key = normalize_name(name);
        let Some(index) = self.lookup.get(&key).copied() else {
            return fallback;
        };
        let cache_key = TextWidthKey {
            font_index: index,
            size_milli: (font_size * 1000.0).round() as i64,
            text: text.to_string(),
        };
        if let Ok(cache) = self.text_width_cache.lock() {
            if let Some(value) = cache.get(&cache_key) {
                return value;
            }
        }
        let Some(font) = self.fonts.get(index) else {
            return fallback;
        };
        let value = shape_text(&font.data, text)
            .map(|run| run.advance_em * font_size)
            .unwrap_or(fallback);
        if let Ok(mut cache) = self.text_width_cache.lock() {
            cache.insert(cache_key, value);
        }
        value
    }
}

/// One positioned glyph of a shaped run, in em units from the run origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapedGlyph {
    pub glyph_id: u16,
    pub x_em: f32,
    pub y_em: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapedRun {
    pub glyphs: Vec<ShapedGlyph>,
    pub advance_em: f32,
}

/// Shapes `text` with rustybuzz; falls back to cmap lookup plus horizontal
/// advances when shaping yields nothing.
pub fn shape_text(font_data: &[u8], text: &str) -> Option<ShapedRun> {
    if let Some(run) = shape_text_hb(font_data, text) {
        return Some(run);
    }
    shape_text_unshaped(font_data, text)
}

fn shape_text_hb(font_data: &[u8], text: &str) -> Option<ShapedRun> {
    let face = HbFace::from_slice(font_data, 0)?;
    let units = face.units_per_em().max(1) as f32;
    let mut buffer = UnicodeBuffer::new();
    buffer.set_direction(detect_direction(text));
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let infos = output.glyph_infos();
    let positions = output.glyph_positions();
    if infos.is_empty() || infos.len() != positions.len() {
        return None;
    }
    let mut glyphs = Vec::with_capacity(infos.len());
    let mut pen_x = 0.0f32;
    let mut pen_y = 0.0f32;
    for (info, pos) in infos.iter().zip(positions.iter()) {
        let gid = info.glyph_id as u16;
        if gid != 0 {
            glyphs.push(ShapedGlyph {
                glyph_id: gid,
                x_em: pen_x + pos.x_offset as f32 / units,
                y_em: pen_y + pos.y_offset as f32 / units,
            });
        }
        pen_x += pos.x_advance as f32 / units;
        pen_y += pos.y_advance as f32 / units;
    }
    Some(ShapedRun {
        glyphs,
        advance_em: pen_x,
    })
}

fn shape_text_unshaped(font_data: &[u8], text: &str) -> Option<ShapedRun> {
    let face = ttf_parser::Face::parse(font_data, 0).ok()?;
    let units = face.units_per_em().max(1) as f32;
    let mut glyphs = Vec::new();
    let mut pen_x = 0.0f32;
    for ch in text.chars() {
        let Some(gid) = face.glyph_index(ch) else {
            pen_x += 0.5;
            continue;
        };
        glyphs.push(ShapedGlyph {
            glyph_id: gid.0,
            x_em: pen_x,
            y_em: 0.0,
        });
        let adv = face.glyph_hor_advance(gid).unwrap_or(0) as f32 / units;
        pen_x += if adv > 0.0 { adv } else { 0.5 };
    }
    Some(ShapedRun {
        glyphs,
        advance_em: pen_x,
    })
}

fn detect_direction(text: &str) -> HbDirection {
    for ch in text.chars() {
        let rtl = matches!(
            ch as u32,
            0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF | 0x1EE00..=0x1EEFF
        );
        if rtl {
            return HbDirection::RightToLeft;
        }
    }
    HbDirection::LeftToRight
}

fn font_names(face: &ttf_parser::Face<'_>, source: &str) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;
    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => {
                family.get_or_insert(name);
            }
            name_id::FULL_NAME => {
                full.get_or_insert(name);
            }
            name_id::POST_SCRIPT_NAME => {
                post.get_or_insert(name);
            }
            _ => {}
        }
    }

    let source = Some(source.to_string()).filter(|s| !s.is_empty());
    let primary = post
        .clone()
        .or_else(|| full.clone())
        .or_else(|| family.clone())
        .or_else(|| source.clone())
        .unwrap_or_else(|| "EmbeddedFont".to_string());
    let aliases = [family, full, post, source]
        .into_iter()
        .flatten()
        .filter(|candidate| *candidate != primary)
        .collect();
    (primary, aliases)
}

fn normalize_name(name: &str) -> String {
    strip_subset_prefix(
        name.trim()
            .trim_start_matches('/')
            .trim_matches('"')
            .trim_matches('\''),
    )
    .to_ascii_lowercase()
}

/// Drops a PDF subset tag (`ABCDEF+Name`).
pub fn strip_subset_prefix(name: &str) -> &str {
    if let Some((prefix, rest)) = name.split_once('+') {
        if prefix.len() == 6 && prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return rest;
        }
    }
    name
}

static SYSTEM_FONT_CACHE: OnceLock<Mutex<HashMap<String, Option<Arc<Vec<u8>>>>>> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FontStyle {
    Regular,
    Bold,
    Italic,
    BoldItalic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GenericFamily {
    Sans,
    Serif,
    Mono,
}

pub fn resolve_system_font_bytes(font_name: &str) -> Option<Arc<Vec<u8>>> {
    let (family, style) = parse_font_request(font_name);
    let key = format!("{family:?}/{style:?}");
    let cache = SYSTEM_FONT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock() {
        if let Some(entry) = guard.get(&key) {
            return entry.clone();
        }
    }
    let loaded = load_system_font(&system_font_file_candidates(family, style));
    if loaded.is_none() {
        tracing::debug!(font = font_name, "no system font found");
    }
    if let Ok(mut guard) = cache.lock() {
        guard.insert(key, loaded.clone());
    }
    loaded
}

fn load_system_font(candidates: &[&str]) -> Option<Arc<Vec<u8>>> {
    for dir in system_font_dirs() {
        for file_name in candidates {
            for path in [dir.join(file_name), dir.join("truetype").join(file_name)] {
                let Ok(bytes) = fs::read(&path) else {
                    continue;
                };
                if ttf_parser::Face::parse(&bytes, 0).is_ok() {
                    return Some(Arc::new(bytes));
                }
            }
        }
    }
    None
}

fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(extra) = std::env::var(FONT_DIR_ENV) {
        for path in std::env::split_paths(&extra) {
            if !path.as_os_str().is_empty() {
                dirs.push(path);
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        dirs.push(PathBuf::from(r"C:\Windows\Fonts"));
        if let Ok(windir) = std::env::var("WINDIR") {
            dirs.push(PathBuf::from(windir).join("Fonts"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        for root in ["/usr/share/fonts", "/usr/local/share/fonts"] {
            let root = PathBuf::from(root);
            for sub in ["truetype/dejavu", "truetype/liberation", "TTF", "dejavu", "liberation"] {
                dirs.push(root.join(sub));
            }
            dirs.push(root);
        }
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join(".fonts"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/System/Library/Fonts"));
        dirs.push(PathBuf::from("/System/Library/Fonts/Supplemental"));
        dirs.push(PathBuf::from("/Library/Fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join("Library/Fonts"));
        }
    }

    dirs
}

fn parse_font_request(font_name: &str) -> (GenericFamily, FontStyle) {
    let lowered = strip_subset_prefix(font_name.trim()).to_ascii_lowercase();
    let compact: String = lowered
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_' && *c != ',')
        .collect();

    let bold = ["bold", "black", "heavy", "semibold", "demi"]
        .iter()
        .any(|token| compact.contains(token))
        || compact.ends_with("bd");
    let italic = ["italic", "oblique"]
        .iter()
        .any(|token| compact.contains(token))
        || compact.ends_with("it")
        || compact.ends_with("bi");
    let style = match (bold, italic) {
        (true, true) => FontStyle::BoldItalic,
        (true, false) => FontStyle::Bold,
        (false, true) => FontStyle::Italic,
        (false, false) => FontStyle::Regular,
    };

    let family = if ["courier", "mono", "consol", "menlo"]
        .iter()
        .any(|token| compact.contains(token))
    {
        GenericFamily::Mono
    } else if compact.contains("sans") {
        GenericFamily::Sans
    } else if ["times", "serif", "georgia", "garamond", "roman", "schoolbook"]
        .iter()
        .any(|token| compact.contains(token))
    {
        GenericFamily::Serif
    } else {
        GenericFamily::Sans
    };
    (family, style)
}

fn system_font_file_candidates(family: GenericFamily, style: FontStyle) -> Vec<&'static str> {
    let table: [&[&'static str]; 4] = match family {
        GenericFamily::Sans => [
            &["arial.ttf", "Arial.ttf", "LiberationSans-Regular.ttf", "DejaVuSans.ttf", "NotoSans-Regular.ttf", "Helvetica.ttc"],
            &["arialbd.ttf", "Arial Bold.ttf", "LiberationSans-Bold.ttf", "DejaVuSans-Bold.ttf", "NotoSans-Bold.ttf"],
            &["ariali.ttf", "Arial Italic.ttf", "LiberationSans-Italic.ttf", "DejaVuSans-Oblique.ttf", "NotoSans-Italic.ttf"],
            &["arialbi.ttf", "Arial Bold Italic.ttf", "LiberationSans-BoldItalic.ttf", "DejaVuSans-BoldOblique.ttf", "NotoSans-BoldItalic.ttf"],
        ],
        GenericFamily::Serif => [
            &["times.ttf", "Times New Roman.ttf", "LiberationSerif-Regular.ttf", "DejaVuSerif.ttf"],
            &["timesbd.ttf", "Times New Roman Bold.ttf", "LiberationSerif-Bold.ttf", "DejaVuSerif-Bold.ttf"],
            &["timesi.ttf", "Times New Roman Italic.ttf", "LiberationSerif-Italic.ttf", "DejaVuSerif-Italic.ttf"],
            &["timesbi.ttf", "Times New Roman Bold Italic.ttf", "LiberationSerif-BoldItalic.ttf", "DejaVuSerif-BoldItalic.ttf"],
        ],
        GenericFamily::Mono => [
            &["cour.ttf", "Courier New.ttf", "LiberationMono-Regular.ttf", "DejaVuSansMono.ttf"],
            &["courbd.ttf", "Courier New Bold.ttf", "LiberationMono-Bold.ttf", "DejaVuSansMono-Bold.ttf"],
            &["couri.ttf", "Courier New Italic.ttf", "LiberationMono-Italic.ttf", "DejaVuSansMono-Oblique.ttf"],
            &["courbi.ttf", "Courier New Bold Italic.ttf", "LiberationMono-BoldItalic.ttf", "DejaVuSansMono-BoldOblique.ttf"],
        ],
    };
    let [regular, bold, italic, bold_italic] = table;
    let order: [&[&'static str]; 4] = match style {
        FontStyle::Regular => [regular, bold, italic, bold_italic],
        FontStyle::Bold => [bold, regular, bold_italic, italic],
        FontStyle::Italic => [italic, regular, bold_italic, bold],
        FontStyle::BoldItalic => [bold_italic, bold, italic, regular],
    };
    let mut out: Vec<&'static str> = Vec::new();
    for group in order {
        for candidate in group {
            if !out.contains(candidate) {
                out.push(candidate);
            }
        }
    }
    out
}
