use crate::canvas::{Command, DisplayList, GlyphRef, Matrix, PlacedGlyph, StrokeStyle};
use crate::error::{TilemarkError, lopdf_err};
use crate::font::{FontRegistry, resolve_system_font_bytes, strip_subset_prefix};
use crate::raster::rgba_to_pixmap;
use crate::types::{Color, Size};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tiny_skia::Pixmap;

/// MediaBox plus `/Rotate`, resolved through the page tree.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageGeometry {
    pub media_box: [f32; 4],
    pub rotate: i64,
}

impl PageGeometry {
    pub fn media_width(&self) -> f32 {
        (self.media_box[2] - self.media_box[0]).abs()
    }

    pub fn media_height(&self) -> f32 {
        (self.media_box[3] - self.media_box[1]).abs()
    }

    /// Lower-left corner of the MediaBox in user space.
    pub fn origin(&self) -> (f32, f32) {
        (
            self.media_box[0].min(self.media_box[2]),
            self.media_box[1].min(self.media_box[3]),
        )
    }

    /// Displayed size; quarter turns swap width and height.
    pub fn display_size(&self) -> Size {
        let (w, h) = (self.media_width(), self.media_height());
        if self.rotate.rem_euclid(180) == 90 {
            Size::new(h, w)
        } else {
            Size::new(w, h)
        }
    }

    /// PDF user space to top-left display space.
    pub fn user_to_page(&self) -> Matrix {
        let (x0, y0) = self.origin();
        let x1 = x0 + self.media_width();
        let y1 = y0 + self.media_height();
        match self.rotate.rem_euclid(360) {
            90 => Matrix::new(0.0, 1.0, 1.0, 0.0, -y0, -x0),
            180 => Matrix::new(-1.0, 0.0, 0.0, 1.0, x1, -y0),
            270 => Matrix::new(0.0, -1.0, -1.0, 0.0, y1, x1),
            _ => Matrix::new(1.0, 0.0, 0.0, -1.0, -x0, y1),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct PdfFont {
    /// Registry key for embedded programs, base font name otherwise.
    font_name: String,
    two_byte: bool,
    embedded: bool,
    widths: HashMap<u16, f32>,
    default_width: f32,
    to_unicode: HashMap<u16, String>,
    code_to_gid: HashMap<u16, u16>,
    /// CID to glyph id for Type0 fonts; `None` is the identity map.
    cid_to_gid: Option<Vec<u16>>,
}

impl PdfFont {
    fn fallback(name: &str) -> Self {
        Self {
            font_name: name.to_string(),
            default_width: 500.0,
            ..Self::default()
        }
    }

    fn codes(&self, bytes: &[u8]) -> Vec<u16> {
        if !self.two_byte {
            return bytes.iter().map(|b| *b as u16).collect();
        }
        bytes
            .chunks(2)
            .map(|pair| match pair {
                [hi, lo] => u16::from_be_bytes([*hi, *lo]),
                [lo] => *lo as u16,
                _ => 0,
            })
            .collect()
    }

    fn width(&self, code: u16) -> f32 {
        self.widths
            .get(&code)
            .copied()
            .unwrap_or(self.default_width)
            .max(0.0)
    }

    fn unicode(&self, code: u16) -> Option<char> {
        if let Some(mapped) = self.to_unicode.get(&code) {
            return mapped.chars().next();
        }
        if self.two_byte {
            return None;
        }
        win_ansi_char(code as u8)
    }

    fn glyph(&self, code: u16) -> Option<GlyphRef> {
        if self.embedded {
            if self.two_byte {
                let gid = match &self.cid_to_gid {
                    Some(map) => *map.get(code as usize)?,
                    None => code,
                };
                return Some(GlyphRef::Id(gid));
            }
            if let Some(gid) = self.code_to_gid.get(&code) {
                return Some(GlyphRef::Id(*gid));
            }
        }
        self.unicode(code).map(GlyphRef::Char)
    }

    fn is_word_space(&self, code: u16) -> bool {
        !self.two_byte && code == 0x20
    }
}

#[derive(Clone, Default)]
struct PdfResources {
    fonts: HashMap<String, Arc<PdfFont>>,
    xobjects: HashMap<String, ObjectId>,
    /// Fill and stroke alpha per graphics state name.
    extgstates: HashMap<String, (f32, f32)>,
}

impl PdfResources {
    fn merged_over(mut self, parent: &PdfResources) -> PdfResources {
        for (k, v) in &parent.fonts {
            self.fonts.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &parent.xobjects {
            self.xobjects.entry(k.clone()).or_insert(*v);
        }
        for (k, v) in &parent.extgstates {
            self.extgstates.entry(k.clone()).or_insert(*v);
        }
        self
    }
}

/// Fonts and images decoded so far; shared by every page of a document.
#[derive(Default)]
struct ResourceLoader {
    fonts: FontRegistry,
    font_cache: HashMap<ObjectId, Arc<PdfFont>>,
    images: HashMap<ObjectId, Option<Arc<Pixmap>>>,
}

impl ResourceLoader {
    fn resources(&mut self, doc: &LoDocument, obj: &LoObject) -> PdfResources {
        let mut out = PdfResources::default();
        let Some(dict) = resolve_dict(doc, obj) else {
            return out;
        };

        if let Some(font_dict) = dict.get(b"Font").ok().and_then(|o| resolve_dict(doc, o)) {
            for (name, font_ref) in font_dict.iter() {
                let font = self.load_font(doc, font_ref);
                out.fonts.insert(name_bytes_to_string(name), font);
            }
        }

        if let Some(xobj_dict) = dict.get(b"XObject").ok().and_then(|o| resolve_dict(doc, o)) {
            for (name, ref_obj) in xobj_dict.iter() {
                if let Ok(id) = ref_obj.as_reference() {
                    out.xobjects.insert(name_bytes_to_string(name), id);
                }
            }
        }

        if let Some(gs_dict) = dict.get(b"ExtGState").ok().and_then(|o| resolve_dict(doc, o)) {
            for (name, gs_ref) in gs_dict.iter() {
                let Some(gs) = resolve_dict(doc, gs_ref) else {
                    continue;
                };
                let alpha = |key: &[u8]| {
                    gs.get(key)
                        .ok()
                        .and_then(obj_to_f32)
                        .unwrap_or(1.0)
                        .clamp(0.0, 1.0)
                };
                out.extgstates
                    .insert(name_bytes_to_string(name), (alpha(b"ca"), alpha(b"CA")));
            }
        }

        out
    }

    fn load_font(&mut self, doc: &LoDocument, obj: &LoObject) -> Arc<PdfFont> {
        let id = obj.as_reference().ok();
        if let Some(font) = id.and_then(|id| self.font_cache.get(&id)) {
            return font.clone();
        }
        let font = Arc::new(self.parse_font(doc, obj, id));
        if let Some(id) = id {
            self.font_cache.insert(id, font.clone());
        }
        font
    }

    fn parse_font(&mut self, doc: &LoDocument, obj: &LoObject, id: Option<ObjectId>) -> PdfFont {
        let Some(dict) = resolve_dict(doc, obj) else {
            return PdfFont::fallback("Helvetica");
        };
        let base_font = dict
            .get(b"BaseFont")
            .ok()
            .and_then(|o| o.as_name().ok())
            .map(name_bytes_to_string)
            .map(|name| strip_subset_prefix(&name).to_string())
            .unwrap_or_else(|| "Helvetica".to_string());
        let subtype = dict
            .get(b"Subtype")
            .ok()
            .and_then(|o| o.as_name().ok())
            .unwrap_or_default();

        let mut font = PdfFont::fallback(&base_font);
        font.to_unicode = parse_to_unicode_cmap(doc, dict);

        let descriptor_owner = if subtype == b"Type0" {
            font.two_byte = true;
            font.default_width = 1000.0;
            let descendant = dict
                .get(b"DescendantFonts")
                .ok()
                .and_then(|o| resolve_object(doc, o).ok())
                .and_then(|o| o.as_array().ok())
                .and_then(|arr| arr.first())
                .and_then(|o| resolve_dict(doc, o));
            if let Some(descendant) = descendant {
                if let Some(dw) = descendant
                    .get(b"DW")
                    .ok()
                    .and_then(|o| resolved_obj_to_f32(doc, o))
                {
                    font.default_width = dw.max(0.0);
                }
                if let Ok(w) = descendant.get(b"W") {
                    font.widths = parse_cid_font_widths(doc, w);
                }
                font.cid_to_gid = descendant
                    .get(b"CIDToGIDMap")
                    .ok()
                    .and_then(|o| resolve_object(doc, o).ok())
                    .and_then(|o| o.as_stream().ok())
                    .and_then(|s| s.get_plain_content().ok())
                    .map(|bytes| {
                        bytes
                            .chunks_exact(2)
                            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                            .collect()
                    });
            }
            descendant
        } else {
            parse_simple_widths(doc, dict, &mut font);
            Some(dict)
        };

        let program = descriptor_owner
            .and_then(|owner| owner.get(b"FontDescriptor").ok())
            .and_then(|descriptor| font_descriptor_file_bytes(doc, descriptor));

        match program {
            Some(program) => self.adopt_embedded_program(&mut font, program, id),
            None if !font.two_byte && font.widths.is_empty() => {
                font.widths = system_font_widths(&base_font);
            }
            None => {}
        }
        font
    }

    fn adopt_embedded_program(
        &mut self,
        font: &mut PdfFont,
        program: Vec<u8>,
        id: Option<ObjectId>,
    ) {
        let Ok(face) = ttf_parser::Face::parse(&program, 0) else {
            tracing::debug!(font = %font.font_name, "embedded font program is not sfnt, using fallback");
            return;
        };
        if !font.two_byte {
            font.code_to_gid = simple_code_to_gid(&face, font);
            if font.widths.is_empty() {
                let upem = face.units_per_em().max(1) as f32;
                for (code, gid) in &font.code_to_gid {
                    if let Some(adv) = face.glyph_hor_advance(ttf_parser::GlyphId(*gid)) {
                        font.widths.insert(*code, adv as f32 * 1000.0 / upem);
                    }
                }
            }
        }
        let key = match id {
            Some((num, generation)) => format!("pdf-font-{num}-{generation}"),
            None => format!("pdf-font-direct-{}", self.font_cache.len()),
        };
        match self.fonts.register_bytes(program, Some(&key)) {
            Ok(_) => {
                font.font_name = key;
                font.embedded = true;
            }
            Err(err) => {
                tracing::debug!(font = %font.font_name, error = %err, "embedded font rejected")
            }
        }
    }

    fn image(
        &mut self,
        doc: &LoDocument,
        id: ObjectId,
        stream: &lopdf::Stream,
    ) -> Option<Arc<Pixmap>> {
        if let Some(cached) = self.images.get(&id) {
            return cached.clone();
        }
        let decoded = image_stream_to_pixmap(doc, stream).map(Arc::new);
        if decoded.is_none() {
            tracing::debug!(object = id.0, "unsupported image xobject skipped");
        }
        self.images.insert(id, decoded.clone());
        decoded
    }
}

#[derive(Clone)]
struct ParseState {
    ctm: Matrix,
    line_width: f32,
    line_cap: u8,
    line_join: u8,
    miter_limit: f32,
    dash: Vec<f32>,
    dash_phase: f32,
    font: Option<Arc<PdfFont>>,
    font_size: f32,
    text_matrix: Matrix,
    text_line_matrix: Matrix,
    text_leading: f32,
    char_spacing: f32,
    word_spacing: f32,
    text_h_scale: f32,
    text_rise: f32,
    text_render_mode: i64,
}

impl Default for ParseState {
    fn default() -> Self {
        Self {
            ctm: Matrix::IDENTITY,
            line_width: 1.0,
            line_cap: 0,
            line_join: 0,
            miter_limit: 10.0,
            dash: Vec::new(),
            dash_phase: 0.0,
            font: None,
            font_size: 12.0,
            text_matrix: Matrix::IDENTITY,
            text_line_matrix: Matrix::IDENTITY,
            text_leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            text_h_scale: 1.0,
            text_rise: 0.0,
            text_render_mode: 0,
        }
    }
}

struct Walk<'a> {
    doc: &'a LoDocument,
    loader: &'a mut ResourceLoader,
    page: Matrix,
    commands: Vec<Command>,
    active_forms: HashSet<ObjectId>,
    current_point: Option<(f32, f32)>,
}

impl Walk<'_> {
    fn to_page(&self, state: &ParseState, x: f32, y: f32) -> (f32, f32) {
        state.ctm.concat(self.page).transform_point(x, y)
    }

    fn stroke_style(&self, state: &ParseState) -> StrokeStyle {
        let scale = state.ctm.concat(self.page).mean_scale();
        StrokeStyle {
            width: state.line_width * scale,
            cap: state.line_cap,
            join: state.line_join,
            miter_limit: state.miter_limit,
            dash: state.dash.iter().map(|v| v * scale).collect(),
            dash_phase: state.dash_phase * scale,
        }
    }
}

/// A decoded PDF whose pages are interpreted into display lists on demand.
pub struct PdfPages {
    doc: LoDocument,
    page_ids: Vec<ObjectId>,
    loader: ResourceLoader,
}

impl PdfPages {
    pub fn load(bytes: &[u8]) -> Result<Self, TilemarkError> {
        let doc = LoDocument::load_mem(bytes).map_err(|e| TilemarkError::Decode(e.to_string()))?;
        if doc.is_encrypted() {
            return Err(TilemarkError::Decode(
                "encrypted documents are not supported".to_string(),
            ));
        }
        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if page_ids.is_empty() {
            return Err(TilemarkError::Decode("document has no pages".to_string()));
        }
        Ok(Self {
            doc,
            page_ids,
            loader: ResourceLoader::default(),
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    /// Embedded font programs seen by `display_list` calls so far.
    pub fn fonts(&self) -> &FontRegistry {
        &self.loader.fonts
    }

    pub fn geometry(&self, index: usize) -> Result<PageGeometry, TilemarkError> {
        page_geometry(&self.doc, self.page_id(index)?)
    }

    fn page_id(&self, index: usize) -> Result<ObjectId, TilemarkError> {
        self.page_ids
            .get(index)
            .copied()
            .ok_or_else(|| TilemarkError::PageRender {
                index,
                message: "page index out of range".to_string(),
            })
    }

    pub fn display_list(&mut self, index: usize) -> Result<DisplayList, TilemarkError> {
        let page_id = self.page_id(index)?;
        let geometry = page_geometry(&self.doc, page_id)?;
        let page_dict = self
            .doc
            .get_object(page_id)
            .and_then(LoObject::as_dict)
            .map_err(lopdf_err)?;
        // Missing contents is a blank page.
        let content_bytes = self.doc.get_page_content(page_id).unwrap_or_default();
        let content = Content::decode(&content_bytes).map_err(|e| TilemarkError::PageRender {
            index,
            message: e.to_string(),
        })?;

        let mut walk = Walk {
            doc: &self.doc,
            loader: &mut self.loader,
            page: geometry.user_to_page(),
            commands: Vec::new(),
            active_forms: HashSet::new(),
            current_point: None,
        };
        let resources = match inherited_page_attr(walk.doc, page_dict, b"Resources") {
            Some(obj) => walk.loader.resources(walk.doc, obj),
            None => PdfResources::default(),
        };
        let mut state = ParseState::default();
        parse_operations(&mut walk, &content.operations, &resources, &mut state);

        let mut list = DisplayList::new(geometry.display_size());
        list.commands = walk.commands;
        Ok(list)
    }
}

/// Resolves MediaBox and Rotate for `page_id`, following `/Parent` for
/// inherited values. A missing or degenerate MediaBox falls back to US Letter.
pub fn page_geometry(doc: &LoDocument, page_id: ObjectId) -> Result<PageGeometry, TilemarkError> {
    let page = doc
        .get_object(page_id)
        .and_then(LoObject::as_dict)
        .map_err(lopdf_err)?;
    let media_box = inherited_page_attr(doc, page, b"MediaBox")
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_array().ok())
        .and_then(|arr| parse_box_array(arr))
        .unwrap_or([0.0, 0.0, 612.0, 792.0]);
    let rotate = inherited_page_attr(doc, page, b"Rotate")
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_i64().ok())
        .unwrap_or(0);
    Ok(PageGeometry { media_box, rotate })
}

pub(crate) fn inherited_page_attr<'a>(
    doc: &'a LoDocument,
    page: &'a LoDictionary,
    key: &[u8],
) -> Option<&'a LoObject> {
    let mut dict = page;
    // Bounded: malformed page trees can cycle.
    for _ in 0..64 {
        if let Ok(obj) = dict.get(key) {
            return Some(obj);
        }
        let parent = dict.get(b"Parent").ok()?.as_reference().ok()?;
        dict = doc.get_object(parent).ok()?.as_dict().ok()?;
    }
    None
}

fn parse_box_array(arr: &[LoObject]) -> Option<[f32; 4]> {
    if arr.len() < 4 {
        return None;
    }
    let vals = [
        obj_to_f32(&arr[0])?,
        obj_to_f32(&arr[1])?,
        obj_to_f32(&arr[2])?,
        obj_to_f32(&arr[3])?,
    ];
    if (vals[2] - vals[0]).abs() < 1.0 || (vals[3] - vals[1]).abs() < 1.0 {
        return None;
    }
    Some(vals)
}

fn parse_operations(
    walk: &mut Walk<'_>,
    operations: &[Operation],
    resources: &PdfResources,
    state: &mut ParseState,
) {
    let mut stack: Vec<ParseState> = Vec::new();
    for op in operations {
        match op.operator.as_str() {
            "q" => {
                stack.push(state.clone());
                walk.commands.push(Command::SaveState);
            }
            "Q" => {
                if let Some(prev) = stack.pop() {
                    *state = prev;
                    walk.commands.push(Command::RestoreState);
                }
            }
            "cm" => {
                if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                    state.ctm = Matrix::new(a, b, c, d, e, f).concat(state.ctm);
                }
            }
            "w" => {
                if let Some(width) = op_f32(op, 0) {
                    state.line_width = width.max(0.0);
                }
            }
            "J" => {
                if let Some(cap) = op_i64(op, 0) {
                    state.line_cap = cap.clamp(0, 2) as u8;
                }
            }
            "j" => {
                if let Some(join) = op_i64(op, 0) {
                    state.line_join = join.clamp(0, 2) as u8;
                }
            }
            "M" => {
                if let Some(limit) = op_f32(op, 0) {
                    state.miter_limit = limit.max(1.0);
                }
            }
            "d" => {
                state.dash = op
                    .operands
                    .first()
                    .and_then(|o| o.as_array().ok())
                    .map(|arr| arr.iter().filter_map(obj_to_f32).map(f32::abs).collect())
                    .unwrap_or_default();
                state.dash_phase = op_f32(op, 1).unwrap_or(0.0);
            }
            "gs" => {
                if let Some((fill, stroke)) =
                    op_name(op, 0).and_then(|name| resources.extgstates.get(&name).copied())
                {
                    walk.commands.push(Command::SetOpacity { fill, stroke });
                }
            }
            "rg" | "g" | "k" | "sc" | "scn" => {
                if let Some(color) = color_from_operands(op) {
                    walk.commands.push(Command::SetFillColor(color));
                }
            }
            "RG" | "G" | "K" | "SC" | "SCN" => {
                if let Some(color) = color_from_operands(op) {
                    walk.commands.push(Command::SetStrokeColor(color));
                }
            }
            // Selecting a color space resets the color to its initial black.
            "cs" => walk.commands.push(Command::SetFillColor(Color::BLACK)),
            "CS" => walk.commands.push(Command::SetStrokeColor(Color::BLACK)),
            "m" => {
                if let Some([x, y]) = op_f32_2(op) {
                    let (x, y) = walk.to_page(state, x, y);
                    walk.commands.push(Command::MoveTo { x, y });
                    walk.current_point = Some((x, y));
                }
            }
            "l" => {
                if let Some([x, y]) = op_f32_2(op) {
                    let (x, y) = walk.to_page(state, x, y);
                    walk.commands.push(Command::LineTo { x, y });
                    walk.current_point = Some((x, y));
                }
            }
            "c" | "v" | "y" => {
                let curve = match op.operator.as_str() {
                    "c" => op_f32_6(op).map(|[x1, y1, x2, y2, x, y]| {
                        (
                            walk.to_page(state, x1, y1),
                            walk.to_page(state, x2, y2),
                            walk.to_page(state, x, y),
                        )
                    }),
                    "v" => op_f32_4(op).and_then(|[x2, y2, x, y]| {
                        let start = walk.current_point?;
                        Some((start, walk.to_page(state, x2, y2), walk.to_page(state, x, y)))
                    }),
                    _ => op_f32_4(op).map(|[x1, y1, x, y]| {
                        let end = walk.to_page(state, x, y);
                        (walk.to_page(state, x1, y1), end, end)
                    }),
                };
                if let Some(((x1, y1), (x2, y2), (x, y))) = curve {
                    walk.commands.push(Command::CurveTo {
                        x1,
                        y1,
                        x2,
                        y2,
                        x,
                        y,
                    });
                    walk.current_point = Some((x, y));
                }
            }
            "re" => {
                if let Some([x, y, w, h]) = op_f32_4(op) {
                    let p0 = walk.to_page(state, x, y);
                    let p1 = walk.to_page(state, x + w, y);
                    let p2 = walk.to_page(state, x + w, y + h);
                    let p3 = walk.to_page(state, x, y + h);
                    walk.commands.extend([
                        Command::MoveTo { x: p0.0, y: p0.1 },
                        Command::LineTo { x: p1.0, y: p1.1 },
                        Command::LineTo { x: p2.0, y: p2.1 },
                        Command::LineTo { x: p3.0, y: p3.1 },
                        Command::ClosePath,
                    ]);
                    walk.current_point = Some(p0);
                }
            }
            "h" => walk.commands.push(Command::ClosePath),
            "W" => walk.commands.push(Command::Clip { evenodd: false }),
            "W*" => walk.commands.push(Command::Clip { evenodd: true }),
            "f" | "F" => walk.commands.push(Command::Fill { evenodd: false }),
            "f*" => walk.commands.push(Command::Fill { evenodd: true }),
            "S" | "s" => {
                if op.operator == "s" {
                    walk.commands.push(Command::ClosePath);
                }
                let style = walk.stroke_style(state);
                walk.commands.push(Command::Stroke(style));
            }
            "B" | "B*" | "b" | "b*" => {
                if op.operator.starts_with('b') {
                    walk.commands.push(Command::ClosePath);
                }
                let stroke = walk.stroke_style(state);
                walk.commands.push(Command::FillStroke {
                    evenodd: op.operator.ends_with('*'),
                    stroke,
                });
            }
            "n" => walk.commands.push(Command::EndPath),
            "BT" => {
                state.text_matrix = Matrix::IDENTITY;
                state.text_line_matrix = Matrix::IDENTITY;
            }
            "TL" => {
                if let Some(leading) = op_f32(op, 0) {
                    state.text_leading = leading;
                }
            }
            "Tc" => {
                if let Some(spacing) = op_f32(op, 0) {
                    state.char_spacing = spacing;
                }
            }
            "Tw" => {
                if let Some(spacing) = op_f32(op, 0) {
                    state.word_spacing = spacing;
                }
            }
            "Tz" => {
                if let Some(percent) = op_f32(op, 0) {
                    state.text_h_scale = (percent / 100.0).max(0.0);
                }
            }
            "Ts" => {
                if let Some(rise) = op_f32(op, 0) {
                    state.text_rise = rise;
                }
            }
            "Tr" => {
                if let Some(mode) = op_i64(op, 0) {
                    state.text_render_mode = mode.clamp(0, 7);
                }
            }
            "Tf" => {
                if let Some(name) = op_name(op, 0) {
                    let font = resources
                        .fonts
                        .get(&name)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(PdfFont::fallback("Helvetica")));
                    state.font = Some(font);
                    state.font_size = op_f32(op, 1).unwrap_or(12.0);
                }
            }
            "Td" | "TD" => {
                if let Some([tx, ty]) = op_f32_2(op) {
                    if op.operator == "TD" {
                        state.text_leading = -ty;
                    }
                    next_line(state, tx, ty);
                }
            }
            "T*" => {
                let leading = state.text_leading;
                next_line(state, 0.0, -leading);
            }
            "Tm" => {
                if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                    state.text_matrix = Matrix::new(a, b, c, d, e, f);
                    state.text_line_matrix = state.text_matrix;
                }
            }
            "Tj" => {
                if let Some(bytes) = op.operands.first().and_then(|o| o.as_str().ok()) {
                    show_text(walk, state, bytes);
                }
            }
            "'" => {
                let leading = state.text_leading;
                next_line(state, 0.0, -leading);
                if let Some(bytes) = op.operands.first().and_then(|o| o.as_str().ok()) {
                    show_text(walk, state, bytes);
                }
            }
            "\"" => {
                if let (Some(aw), Some(ac)) = (op_f32(op, 0), op_f32(op, 1)) {
                    state.word_spacing = aw;
                    state.char_spacing = ac;
                }
                let leading = state.text_leading;
                next_line(state, 0.0, -leading);
                if let Some(bytes) = op.operands.get(2).and_then(|o| o.as_str().ok()) {
                    show_text(walk, state, bytes);
                }
            }
            "TJ" => {
                let Some(items) = op.operands.first().and_then(|o| o.as_array().ok()) else {
                    continue;
                };
                for item in items {
                    if let Ok(bytes) = item.as_str() {
                        show_text(walk, state, bytes);
                    } else if let Some(adj) = obj_to_f32(item) {
                        // Thousandths of text space, subtracted from the pen.
                        let tx = -(adj / 1000.0) * state.font_size * state.text_h_scale;
                        advance_text(state, tx);
                    }
                }
            }
            "Do" => {
                if let Some(id) =
                    op_name(op, 0).and_then(|name| resources.xobjects.get(&name).copied())
                {
                    draw_xobject(walk, id, resources, state);
                }
            }
            _ => {}
        }
    }
    // Unbalanced q must not leak past this content stream.
    for _ in stack {
        walk.commands.push(Command::RestoreState);
    }
}

fn color_from_operands(op: &Operation) -> Option<Color> {
    let values: Vec<f32> = op.operands.iter().filter_map(obj_to_f32).collect();
    match values.as_slice() {
        [gray] => Some(Color::rgb(*gray, *gray, *gray)),
        [r, g, b] => Some(Color::rgb(*r, *g, *b)),
        [c, m, y, k] => {
            let (r, g, b) = cmyk_to_rgb(*c, *m, *y, *k);
            Some(Color::rgb(r, g, b))
        }
        _ => None,
    }
}

fn next_line(state: &mut ParseState, tx: f32, ty: f32) {
    state.text_line_matrix = Matrix::translation(tx, ty).concat(state.text_line_matrix);
    state.text_matrix = state.text_line_matrix;
}

fn advance_text(state: &mut ParseState, tx: f32) {
    state.text_matrix = Matrix::translation(tx, 0.0).concat(state.text_matrix);
}

fn show_text(walk: &mut Walk<'_>, state: &mut ParseState, bytes: &[u8]) {
    let font = state
        .font
        .clone()
        .unwrap_or_else(|| Arc::new(PdfFont::fallback("Helvetica")));
    let font_size = state.font_size;
    let h_scale = state.text_h_scale;
    let em_x = font_size * h_scale;
    let drawable = em_x.abs() > f32::EPSILON && !matches!(state.text_render_mode, 3 | 7);

    let mut glyphs = Vec::new();
    let mut pen = 0.0f32;
    for code in font.codes(bytes) {
        if drawable {
            if let Some(glyph) = font.glyph(code) {
                glyphs.push(PlacedGlyph {
                    glyph,
                    x_em: pen / em_x,
                    y_em: 0.0,
                });
            }
        }
        let mut advance = font.width(code) / 1000.0 * font_size + state.char_spacing;
        if font.is_word_space(code) {
            advance += state.word_spacing;
        }
        pen += advance * h_scale;
    }

    if !glyphs.is_empty() {
        let text_space = Matrix::new(em_x, 0.0, 0.0, font_size, 0.0, state.text_rise);
        let transform = text_space
            .concat(state.text_matrix)
            .concat(state.ctm)
            .concat(walk.page);
        walk.commands.push(Command::DrawGlyphs {
            font_name: font.font_name.clone(),
            transform,
            glyphs,
        });
    }
    advance_text(state, pen);
}

fn draw_xobject(walk: &mut Walk<'_>, id: ObjectId, parent: &PdfResources, state: &ParseState) {
    let doc = walk.doc;
    let Ok(stream) = doc.get_object(id).and_then(LoObject::as_stream) else {
        return;
    };
    let subtype = stream
        .dict
        .get(b"Subtype")
        .ok()
        .and_then(|o| o.as_name().ok())
        .unwrap_or_default();

    if subtype == b"Image" {
        if let Some(image) = walk.loader.image(doc, id, stream) {
            let (w, h) = (image.width() as f32, image.height() as f32);
            let unit = Matrix::new(1.0 / w, 0.0, 0.0, -1.0 / h, 0.0, 1.0);
            walk.commands.push(Command::DrawImage {
                transform: unit.concat(state.ctm).concat(walk.page),
                image,
            });
        }
        return;
    }
    if subtype != b"Form" || !walk.active_forms.insert(id) {
        return;
    }

    let Some(content) = stream
        .get_plain_content()
        .ok()
        .and_then(|bytes| Content::decode(&bytes).ok())
    else {
        walk.active_forms.remove(&id);
        return;
    };
    let resources = match stream.dict.get(b"Resources") {
        Ok(obj) => walk.loader.resources(doc, obj).merged_over(parent),
        Err(_) => parent.clone(),
    };
    let form_matrix = stream
        .dict
        .get(b"Matrix")
        .ok()
        .and_then(parse_matrix_object)
        .unwrap_or_default();

    let mut nested = state.clone();
    nested.ctm = form_matrix.concat(state.ctm);
    walk.commands.push(Command::SaveState);
    if let Some([x0, y0, x1, y1]) = stream
        .dict
        .get(b"BBox")
        .ok()
        .and_then(|o| o.as_array().ok())
        .and_then(|arr| parse_box_array(arr))
    {
        let corners =
            [(x0, y0), (x1, y0), (x1, y1), (x0, y1)].map(|(x, y)| walk.to_page(&nested, x, y));
        walk.commands.push(Command::MoveTo {
            x: corners[0].0,
            y: corners[0].1,
        });
        for (x, y) in &corners[1..] {
            walk.commands.push(Command::LineTo { x: *x, y: *y });
        }
        walk.commands.extend([
            Command::ClosePath,
            Command::Clip { evenodd: false },
            Command::EndPath,
        ]);
    }
    parse_operations(walk, &content.operations, &resources, &mut nested);
    walk.commands.push(Command::RestoreState);
    walk.active_forms.remove(&id);
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DeviceSpace {
    Gray,
    Rgb,
    Cmyk,
}

impl DeviceSpace {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"DeviceGray" | b"G" | b"CalGray" => Some(Self::Gray),
            b"DeviceRGB" | b"RGB" | b"CalRGB" => Some(Self::Rgb),
            b"DeviceCMYK" | b"CMYK" => Some(Self::Cmyk),
            _ => None,
        }
    }

    fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb => 3,
            Self::Cmyk => 4,
        }
    }

    fn rgb(self, px: &[u8]) -> Option<[u8; 3]> {
        match (self, px) {
            (Self::Gray, [v, ..]) => Some([*v, *v, *v]),
            (Self::Rgb, [r, g, b, ..]) => Some([*r, *g, *b]),
            (Self::Cmyk, [c, m, y, k, ..]) => {
                let (r, g, b) = cmyk_to_rgb(
                    *c as f32 / 255.0,
                    *m as f32 / 255.0,
                    *y as f32 / 255.0,
                    *k as f32 / 255.0,
                );
                Some([
                    (r * 255.0).round() as u8,
                    (g * 255.0).round() as u8,
                    (b * 255.0).round() as u8,
                ])
            }
            _ => None,
        }
    }
}

enum ImageColorSpace {
    Device(DeviceSpace),
    Indexed { base: DeviceSpace, lookup: Vec<u8> },
}

fn image_color_space(doc: &LoDocument, obj: &LoObject) -> Option<ImageColorSpace> {
    match resolve_object(doc, obj).ok()? {
        LoObject::Name(name) => DeviceSpace::from_name(name).map(ImageColorSpace::Device),
        LoObject::Array(arr) => {
            let head = resolve_object(doc, arr.first()?).ok()?.as_name().ok()?;
            if head == b"ICCBased" {
                let n = resolve_object(doc, arr.get(1)?)
                    .ok()?
                    .as_stream()
                    .ok()?
                    .dict
                    .get(b"N")
                    .ok()?
                    .as_i64()
                    .ok()?;
                return match n {
                    1 => Some(ImageColorSpace::Device(DeviceSpace::Gray)),
                    3 => Some(ImageColorSpace::Device(DeviceSpace::Rgb)),
                    4 => Some(ImageColorSpace::Device(DeviceSpace::Cmyk)),
                    _ => None,
                };
            }
            if let Some(space) = DeviceSpace::from_name(head) {
                return Some(ImageColorSpace::Device(space));
            }
            if head != b"Indexed" && head != b"I" {
                return None;
            }
            let base = match image_color_space(doc, arr.get(1)?)? {
                ImageColorSpace::Device(space) => space,
                ImageColorSpace::Indexed { .. } => return None,
            };
            let lookup = match resolve_object(doc, arr.get(3)?).ok()? {
                LoObject::String(bytes, _) => bytes.clone(),
                LoObject::Stream(stream) => stream.get_plain_content().ok()?,
                _ => return None,
            };
            Some(ImageColorSpace::Indexed { base, lookup })
        }
        _ => None,
    }
}

fn dict_u32(dict: &LoDictionary, key: &[u8]) -> Option<u32> {
    dict.get(key)
        .ok()
        .and_then(|o| o.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
}

/// Decodes an image XObject to a premultiplied pixmap. Handles DCT streams
/// and raw 8-bit gray, RGB, CMYK and indexed samples, with an optional
/// `/SMask`. Stencil masks and other encodings return `None`.
fn image_stream_to_pixmap(doc: &LoDocument, stream: &lopdf::Stream) -> Option<Pixmap> {
    let dict = &stream.dict;
    if dict
        .get(b"ImageMask")
        .ok()
        .and_then(|o| o.as_bool().ok())
        .unwrap_or(false)
    {
        return None;
    }
    let filters = stream.filters().unwrap_or_default();
    let (width, height, mut rgba) = if filters.iter().any(|f| *f == b"DCTDecode") {
        let decoded =
            image::load_from_memory_with_format(&stream.content, image::ImageFormat::Jpeg)
                .ok()?
                .to_rgba8();
        let (w, h) = decoded.dimensions();
        (w, h, decoded.into_raw())
    } else {
        let width = dict_u32(dict, b"Width")?;
        let height = dict_u32(dict, b"Height")?;
        let bpc = dict
            .get(b"BitsPerComponent")
            .ok()
            .and_then(|o| o.as_i64().ok())
            .unwrap_or(8);
        if bpc != 8 {
            return None;
        }
        let space = match dict.get(b"ColorSpace") {
            Ok(obj) => image_color_space(doc, obj)?,
            Err(_) => ImageColorSpace::Device(DeviceSpace::Gray),
        };
        let plain = stream.get_plain_content().ok()?;
        (width, height, samples_to_rgba(&plain, width, height, &space)?)
    };

    if let Some(alpha) = dict
        .get(b"SMask")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_stream().ok())
        .and_then(|mask| soft_mask_alpha(mask, width, height))
    {
        for (px, a) in rgba.chunks_exact_mut(4).zip(alpha) {
            px[3] = a;
        }
    }
    rgba_to_pixmap(width, height, &rgba)
}

fn samples_to_rgba(
    plain: &[u8],
    width: u32,
    height: u32,
    space: &ImageColorSpace,
) -> Option<Vec<u8>> {
    let pixels = (width as usize).checked_mul(height as usize)?;
    let stride = match space {
        ImageColorSpace::Device(space) => space.channels(),
        ImageColorSpace::Indexed { .. } => 1,
    };
    if plain.len() < pixels.checked_mul(stride)? {
        return None;
    }
    let mut rgba = Vec::with_capacity(pixels * 4);
    for px in plain.chunks_exact(stride).take(pixels) {
        let rgb = match space {
            ImageColorSpace::Device(space) => space.rgb(px)?,
            ImageColorSpace::Indexed { base, lookup } => {
                let channels = base.channels();
                let offset = px[0] as usize * channels;
                base.rgb(lookup.get(offset..offset + channels)?)?
            }
        };
        rgba.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
    }
    Some(rgba)
}

fn soft_mask_alpha(mask: &lopdf::Stream, width: u32, height: u32) -> Option<Vec<u8>> {
    if dict_u32(&mask.dict, b"Width")? != width || dict_u32(&mask.dict, b"Height")? != height {
        return None;
    }
    let plain = mask.get_plain_content().ok()?;
    let pixels = width as usize * height as usize;
    (plain.len() >= pixels).then(|| plain[..pixels].to_vec())
}

fn parse_simple_widths(doc: &LoDocument, dict: &LoDictionary, font: &mut PdfFont) {
    if let Some(missing) = dict
        .get(b"FontDescriptor")
        .ok()
        .and_then(|o| resolve_dict(doc, o))
        .and_then(|d| d.get(b"MissingWidth").ok())
        .and_then(obj_to_f32)
    {
        font.default_width = missing.max(0.0);
    }
    let first_char = dict
        .get(b"FirstChar")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_i64().ok())
        .unwrap_or(0);
    let Some(widths) = dict
        .get(b"Widths")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_array().ok())
    else {
        return;
    };
    for (offset, width_obj) in widths.iter().enumerate() {
        let Ok(code) = u16::try_from(first_char + offset as i64) else {
            continue;
        };
        if let Some(width) = resolved_obj_to_f32(doc, width_obj) {
            font.widths.insert(code, width.max(0.0));
        }
    }
}

fn parse_cid_font_widths(doc: &LoDocument, obj: &LoObject) -> HashMap<u16, f32> {
    let mut out = HashMap::new();
    let Some(items) = resolve_object(doc, obj).ok().and_then(|o| o.as_array().ok()) else {
        return out;
    };
    let mut idx = 0usize;
    while idx + 1 < items.len() {
        let Some(start) = resolved_obj_to_u16(doc, &items[idx]) else {
            idx += 1;
            continue;
        };
        // Either `c [w1 w2 ...]` or `c_first c_last w`.
        if let Some(list) = resolve_object(doc, &items[idx + 1])
            .ok()
            .and_then(|o| o.as_array().ok())
        {
            for (offset, width_obj) in list.iter().enumerate() {
                let (Some(width), Some(code)) = (
                    resolved_obj_to_f32(doc, width_obj),
                    u16::try_from(offset).ok().and_then(|o| start.checked_add(o)),
                ) else {
                    continue;
                };
                out.insert(code, width.max(0.0));
            }
            idx += 2;
            continue;
        }
        let (Some(end), Some(width)) = (
            resolved_obj_to_u16(doc, &items[idx + 1]),
            items.get(idx + 2).and_then(|o| resolved_obj_to_f32(doc, o)),
        ) else {
            idx += 3;
            continue;
        };
        for code in start..=end {
            out.insert(code, width.max(0.0));
        }
        idx += 3;
    }
    out
}

fn font_descriptor_file_bytes(doc: &LoDocument, descriptor_obj: &LoObject) -> Option<Vec<u8>> {
    let descriptor = resolve_dict(doc, descriptor_obj)?;
    [b"FontFile2".as_slice(), b"FontFile3".as_slice()]
        .into_iter()
        .filter_map(|key| descriptor.get(key).ok())
        .filter_map(|obj| resolve_object(doc, obj).ok())
        .filter_map(|obj| obj.as_stream().ok())
        .filter_map(|stream| stream.get_plain_content().ok())
        .find(|data| !data.is_empty())
}

/// Maps single-byte codes to glyphs of an embedded program: Unicode first,
/// then the symbolic (3,0) and Mac Roman (1,0) cmap subtables.
fn simple_code_to_gid(face: &ttf_parser::Face<'_>, font: &PdfFont) -> HashMap<u16, u16> {
    let mut out = HashMap::new();
    let subtables: Vec<_> = face
        .tables()
        .cmap
        .map(|cmap| cmap.subtables.into_iter().collect())
        .unwrap_or_default();
    for code in 0u16..=255 {
        let by_unicode = font.unicode(code).and_then(|ch| face.glyph_index(ch));
        let gid = by_unicode.or_else(|| {
            subtables
                .iter()
                .find_map(|sub| match (sub.platform_id, sub.encoding_id) {
                    (ttf_parser::PlatformId::Windows, 0) => sub
                        .glyph_index(0xF000 + code as u32)
                        .or_else(|| sub.glyph_index(code as u32)),
                    (ttf_parser::PlatformId::Macintosh, 0) => sub.glyph_index(code as u32),
                    _ => None,
                })
        });
        if let Some(gid) = gid.filter(|g| g.0 != 0) {
            out.insert(code, gid.0);
        }
    }
    out
}

/// Widths in thousandths of an em for a non-embedded simple font, taken from
/// its system substitute so advances agree with the glyphs that get drawn.
fn system_font_widths(base_font: &str) -> HashMap<u16, f32> {
    let mut out = HashMap::new();
    let Some(data) = resolve_system_font_bytes(base_font) else {
        return out;
    };
    let Ok(face) = ttf_parser::Face::parse(data.as_slice(), 0) else {
        return out;
    };
    let upem = face.units_per_em().max(1) as f32;
    for code in 0x20u8..=0xFF {
        let Some(gid) = win_ansi_char(code).and_then(|ch| face.glyph_index(ch)) else {
            continue;
        };
        if let Some(adv) = face.glyph_hor_advance(gid) {
            out.insert(code as u16, adv as f32 * 1000.0 / upem);
        }
    }
    out
}

/// WinAnsiEncoding, the usual encoding of simple fonts without `/Differences`.
fn win_ansi_char(code: u8) -> Option<char> {
    let ch = match code {
        0x20..=0x7E | 0xA0..=0xFF => code as char,
        0x80 => '€',
        0x82 => '‚',
        0x84 => '„',
        0x85 => '…',
        0x8A => 'Š',
        0x8C => 'Œ',
        0x91 => '‘',
        0x92 => '’',
        0x93 => '“',
        0x94 => '”',
        0x95 => '•',
        0x96 => '–',
        0x97 => '—',
        0x99 => '™',
        0x9A => 'š',
        0x9C => 'œ',
        0x9F => 'Ÿ',
        _ => return None,
    };
    Some(ch)
}

fn parse_to_unicode_cmap(doc: &LoDocument, font_dict: &LoDictionary) -> HashMap<u16, String> {
    let Some(bytes) = font_dict
        .get(b"ToUnicode")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_stream().ok())
        .and_then(|stream| stream.get_plain_content().ok())
    else {
        return HashMap::new();
    };
    parse_cmap_text(&String::from_utf8_lossy(&bytes))
}

fn parse_cmap_text(text: &str) -> HashMap<u16, String> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Char,
        Range,
    }

    let mut map = HashMap::new();
    let mut section = Section::None;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.ends_with("beginbfchar") {
            section = Section::Char;
            continue;
        }
        if line.ends_with("beginbfrange") {
            section = Section::Range;
            continue;
        }
        if line.ends_with("endbfchar") || line.ends_with("endbfrange") {
            section = Section::None;
            continue;
        }
        let tokens = extract_hex_tokens(line);
        match section {
            Section::Char => {
                if let [src, dst, ..] = tokens.as_slice() {
                    if let Some(code) = hex_code(src) {
                        map.insert(code, utf16_be_string(dst));
                    }
                }
            }
            Section::Range => {
                let [start, end, rest @ ..] = tokens.as_slice() else {
                    continue;
                };
                let (Some(start), Some(end)) = (hex_code(start), hex_code(end)) else {
                    continue;
                };
                if start > end || rest.is_empty() {
                    continue;
                }
                if line.contains('[') {
                    for (code, dst) in (start..=end).zip(rest) {
                        map.insert(code, utf16_be_string(dst));
                    }
                } else if let Some(base) = hex_code(&rest[0]) {
                    for code in start..=end {
                        let target = base as u32 + (code - start) as u32;
                        if let Some(ch) = char::from_u32(target) {
                            map.insert(code, ch.to_string());
                        }
                    }
                }
            }
            Section::None => {}
        }
    }
    map
}

fn extract_hex_tokens(line: &str) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut rest = line;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            break;
        };
        if let Some(bytes) = parse_hex(&after[..close]) {
            out.push(bytes);
        }
        rest = &after[close + 1..];
    }
    out
}

fn parse_hex(token: &str) -> Option<Vec<u8>> {
    let mut nibbles: Vec<u8> = token
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_digit(16).map(|v| v as u8))
        .collect::<Option<_>>()?;
    if nibbles.len() % 2 == 1 {
        nibbles.push(0);
    }
    Some(nibbles.chunks_exact(2).map(|p| (p[0] << 4) | p[1]).collect())
}

fn hex_code(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [lo] => Some(*lo as u16),
        [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

fn utf16_be_string(bytes: &[u8]) -> String {
    if bytes.len() % 2 == 1 {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn parse_matrix_object(obj: &LoObject) -> Option<Matrix> {
    let arr = obj.as_array().ok()?;
    if arr.len() < 6 {
        return None;
    }
    Some(Matrix::new(
        obj_to_f32(&arr[0])?,
        obj_to_f32(&arr[1])?,
        obj_to_f32(&arr[2])?,
        obj_to_f32(&arr[3])?,
        obj_to_f32(&arr[4])?,
        obj_to_f32(&arr[5])?,
    ))
}

pub(crate) fn resolve_object<'a>(
    doc: &'a LoDocument,
    mut obj: &'a LoObject,
) -> Result<&'a LoObject, TilemarkError> {
    for _ in 0..32 {
        match obj {
            LoObject::Reference(id) => obj = doc.get_object(*id).map_err(lopdf_err)?,
            _ => return Ok(obj),
        }
    }
    Err(TilemarkError::Pdf("reference chain too deep".to_string()))
}

pub(crate) fn resolve_dict<'a>(doc: &'a LoDocument, obj: &'a LoObject) -> Option<&'a LoDictionary> {
    resolve_object(doc, obj).ok()?.as_dict().ok()
}

fn resolved_obj_to_f32(doc: &LoDocument, obj: &LoObject) -> Option<f32> {
    obj_to_f32(resolve_object(doc, obj).ok()?)
}

fn resolved_obj_to_u16(doc: &LoDocument, obj: &LoObject) -> Option<u16> {
    let v = resolve_object(doc, obj).ok()?.as_i64().ok()?;
    u16::try_from(v).ok()
}

fn op_name(op: &Operation, idx: usize) -> Option<String> {
    op.operands
        .get(idx)?
        .as_name()
        .ok()
        .map(name_bytes_to_string)
}

fn op_f32(op: &Operation, idx: usize) -> Option<f32> {
    obj_to_f32(op.operands.get(idx)?)
}

fn op_i64(op: &Operation, idx: usize) -> Option<i64> {
    let obj = op.operands.get(idx)?;
    obj.as_i64()
        .ok()
        .or_else(|| obj_to_f32(obj).map(|v| v.round() as i64))
}

fn op_f32_2(op: &Operation) -> Option<[f32; 2]> {
    Some([op_f32(op, 0)?, op_f32(op, 1)?])
}

fn op_f32_4(op: &Operation) -> Option<[f32; 4]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
    ])
}

fn op_f32_6(op: &Operation) -> Option<[f32; 6]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
        op_f32(op, 4)?,
        op_f32(op, 5)?,
    ])
}

pub(crate) fn obj_to_f32(obj: &LoObject) -> Option<f32> {
    if let Ok(v) = obj.as_float() {
        return Some(v);
    }
    obj.as_i64().ok().map(|v| v as f32)
}

fn name_bytes_to_string(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn cmyk_to_rgb(c: f32, m: f32, y: f32, k: f32) -> (f32, f32, f32) {
    let k = k.clamp(0.0, 1.0);
    (
        (1.0 - c.clamp(0.0, 1.0)) * (1.0 - k),
        (1.0 - m.clamp(0.0, 1.0)) * (1.0 - k),
        (1.0 - y.clamp(0.0, 1.0)) * (1.0 - k),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureDoc, pdf_with_pages};
    use crate::raster::render_display_list;
    use lopdf::{Stream as LoStream, dictionary};

    fn render(bytes: &[u8], index: usize) -> Pixmap {
        let mut pages = PdfPages::load(bytes).expect("load");
        let list = pages.display_list(index).expect("display list");
        render_display_list(&list, 1.0, Some(Color::WHITE), pages.fonts()).expect("render")
    }

    fn rgb_at(pixmap: &Pixmap, x: u32, y: u32) -> (u8, u8, u8) {
        let px = pixmap.pixel(x, y).expect("in bounds").demultiply();
        (px.red(), px.green(), px.blue())
    }

    fn near(actual: (u8, u8, u8), expected: (u8, u8, u8)) -> bool {
        actual.0.abs_diff(expected.0) <= 3
            && actual.1.abs_diff(expected.1) <= 3
            && actual.2.abs_diff(expected.2) <= 3
    }

    #[test]
    fn filled_rect_lands_top_left_with_its_color() {
        let bytes = pdf_with_pages(&[(100, 100, "1 0 0 rg 0 50 50 50 re f")]);
        let pixmap = render(&bytes, 0);
        assert_eq!((pixmap.width(), pixmap.height()), (100, 100));
        assert_eq!(rgb_at(&pixmap, 10, 10), (255, 0, 0));
        assert_eq!(rgb_at(&pixmap, 10, 90), (255, 255, 255));
        assert_eq!(rgb_at(&pixmap, 90, 10), (255, 255, 255));
    }

    #[test]
    fn cm_and_nested_state_are_honored() {
        let content = "q 2 0 0 2 10 10 cm 0 0 1 rg 0 0 10 10 re f Q 0 g 80 80 10 10 re f";
        let bytes = pdf_with_pages(&[(100, 100, content)]);
        let pixmap = render(&bytes, 0);
        // Blue square covers x 10..30, y 70..90 in top-left space.
        assert_eq!(rgb_at(&pixmap, 20, 80), (0, 0, 255));
        assert_eq!(rgb_at(&pixmap, 85, 15), (0, 0, 0));
        assert_eq!(rgb_at(&pixmap, 50, 50), (255, 255, 255));
    }

    #[test]
    fn cmyk_fill_converts_to_rgb() {
        let bytes = pdf_with_pages(&[(20, 20, "0 1 1 0 k 0 0 20 20 re f")]);
        let pixmap = render(&bytes, 0);
        assert_eq!(rgb_at(&pixmap, 10, 10), (255, 0, 0));
    }

    #[test]
    fn form_xobject_draws_with_its_matrix_and_bbox() {
        let mut fixture = FixtureDoc::new();
        let form_id = fixture.doc.add_object(LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "BBox" => vec![0.into(), 0.into(), 10.into(), 10.into()],
                "Matrix" => vec![1.into(), 0.into(), 0.into(), 1.into(), 40.into(), 40.into()],
            },
            b"0 1 0 rg 0 0 100 100 re f".to_vec(),
        ));
        fixture.add_page(
            100,
            100,
            "/Fx Do",
            dictionary! { "XObject" => dictionary! { "Fx" => form_id } },
        );
        let pixmap = render(&fixture.finish(), 0);
        assert_eq!(rgb_at(&pixmap, 45, 55), (0, 255, 0));
        assert_eq!(rgb_at(&pixmap, 70, 20), (255, 255, 255));
    }

    #[test]
    fn self_referencing_form_terminates() {
        let mut fixture = FixtureDoc::new();
        let form_id = fixture.doc.new_object_id();
        let form = LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "BBox" => vec![0.into(), 0.into(), 10.into(), 10.into()],
                "Resources" => dictionary! { "XObject" => dictionary! { "Me" => form_id } },
            },
            b"0 0 10 10 re f /Me Do".to_vec(),
        );
        fixture.doc.objects.insert(form_id, LoObject::Stream(form));
        fixture.add_page(
            20,
            20,
            "/Me Do",
            dictionary! { "XObject" => dictionary! { "Me" => form_id } },
        );
        let bytes = fixture.finish();
        let mut pages = PdfPages::load(&bytes).unwrap();
        let list = pages.display_list(0).unwrap();
        let fills = list
            .commands
            .iter()
            .filter(|c| matches!(c, Command::Fill { .. }))
            .count();
        assert_eq!(fills, 1);
    }

    #[test]
    fn raw_rgb_image_keeps_row_order() {
        let mut fixture = FixtureDoc::new();
        let samples = vec![
            255, 0, 0, 0, 255, 0, // top row: red, green
            0, 0, 255, 255, 255, 255, // bottom row: blue, white
        ];
        let image_id = fixture.doc.add_object(LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 2,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            samples,
        ));
        fixture.add_page(
            100,
            100,
            "q 100 0 0 100 0 0 cm /Im1 Do Q",
            dictionary! { "XObject" => dictionary! { "Im1" => image_id } },
        );
        let pixmap = render(&fixture.finish(), 0);
        assert!(near(rgb_at(&pixmap, 24, 24), (255, 0, 0)));
        assert!(near(rgb_at(&pixmap, 75, 24), (0, 255, 0)));
        assert!(near(rgb_at(&pixmap, 24, 75), (0, 0, 255)));
    }

    #[test]
    fn indexed_cmyk_samples_expand_through_lookup() {
        let space = ImageColorSpace::Indexed {
            base: DeviceSpace::Cmyk,
            lookup: vec![0, 0, 0, 0, 0, 255, 255, 0],
        };
        let rgba = samples_to_rgba(&[1, 0], 2, 1, &space).unwrap();
        assert_eq!(rgba, vec![255, 0, 0, 255, 255, 255, 255, 255]);
        assert!(samples_to_rgba(&[1], 2, 1, &space).is_none());
    }

    #[test]
    fn rotated_page_swaps_size_and_maps_origin() {
        let mut fixture = FixtureDoc::new();
        let page = fixture.add_page(200, 100, "0 0 10 20 re f", LoDictionary::new());
        fixture.set_page_attr(page, "Rotate", 90.into());
        let bytes = fixture.finish();
        let pages = PdfPages::load(&bytes).unwrap();
        let geometry = pages.geometry(0).unwrap();
        assert_eq!(geometry.display_size(), Size::new(100.0, 200.0));
        let pixmap = render(&bytes, 0);
        assert_eq!((pixmap.width(), pixmap.height()), (100, 200));
        assert_eq!(rgb_at(&pixmap, 15, 5), (0, 0, 0));
        assert_eq!(rgb_at(&pixmap, 5, 15), (255, 255, 255));
    }

    #[test]
    fn user_to_page_handles_all_quarter_turns() {
        let mut g = PageGeometry {
            media_box: [0.0, 0.0, 200.0, 100.0],
            rotate: 0,
        };
        assert_eq!(g.user_to_page().transform_point(0.0, 0.0), (0.0, 100.0));
        g.rotate = 180;
        assert_eq!(g.user_to_page().transform_point(0.0, 0.0), (200.0, 0.0));
        g.rotate = 270;
        assert_eq!(g.user_to_page().transform_point(0.0, 0.0), (100.0, 200.0));
        g.rotate = -90;
        assert_eq!(g.display_size(), Size::new(100.0, 200.0));
    }

    #[test]
    fn shifted_media_box_is_normalized() {
        let g = PageGeometry {
            media_box: [50.0, 50.0, 150.0, 250.0],
            rotate: 0,
        };
        assert_eq!(g.origin(), (50.0, 50.0));
        assert_eq!(g.user_to_page().transform_point(50.0, 250.0), (0.0, 0.0));
    }

    #[test]
    fn text_advances_by_widths_and_invisible_text_emits_nothing() {
        let mut fixture = FixtureDoc::new();
        let font_id = fixture.doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "FirstChar" => 65,
            "LastChar" => 66,
            "Widths" => vec![500.into(), 250.into()],
        });
        fixture.add_page(
            200,
            200,
            "BT /F1 10 Tf 20 100 Td (AB) Tj ET BT 3 Tr /F1 10 Tf (AB) Tj ET",
            dictionary! { "Font" => dictionary! { "F1" => font_id } },
        );
        let bytes = fixture.finish();
        let mut pages = PdfPages::load(&bytes).unwrap();
        let list = pages.display_list(0).unwrap();
        let runs: Vec<_> = list
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::DrawGlyphs {
                    transform, glyphs, ..
                } => Some((*transform, glyphs.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(runs.len(), 1);
        let (transform, glyphs) = &runs[0];
        assert_eq!(glyphs[0].glyph, GlyphRef::Char('A'));
        assert!((glyphs[1].x_em - 0.5).abs() < 1e-5);
        let (x, y) = transform.transform_point(0.0, 0.0);
        assert!((x - 20.0).abs() < 1e-4 && (y - 100.0).abs() < 1e-4);
    }

    #[test]
    fn tj_adjustments_move_the_pen() {
        let mut state = ParseState {
            font: Some(Arc::new(PdfFont::fallback("Helvetica"))),
            font_size: 10.0,
            ..ParseState::default()
        };
        let mut loader = ResourceLoader::default();
        let doc = LoDocument::with_version("1.7");
        let mut walk = Walk {
            doc: &doc,
            loader: &mut loader,
            page: Matrix::IDENTITY,
            commands: Vec::new(),
            active_forms: HashSet::new(),
            current_point: None,
        };
        let ops = vec![Operation::new(
            "TJ",
            vec![LoObject::Array(vec![
                LoObject::string_literal("A"),
                LoObject::Integer(-1000),
                LoObject::string_literal("B"),
            ])],
        )];
        parse_operations(&mut walk, &ops, &PdfResources::default(), &mut state);
        // 5pt for "A", 10pt from the adjustment, 5pt for "B".
        assert!((state.text_matrix.e - 20.0).abs() < 1e-4);
        assert_eq!(walk.commands.len(), 2);
    }

    #[test]
    fn to_unicode_cmap_parses_char_and_range_sections() {
        let cmap = "2 beginbfchar\n<0003> <0020>\n<0024> <0041>\nendbfchar\n\
                    1 beginbfrange\n<0044> <0046> <0061>\nendbfrange\n\
                    1 beginbfrange\n<0050> <0051> [<00E9> <00FC>]\nendbfrange\n";
        let map = parse_cmap_text(cmap);
        assert_eq!(map.get(&0x03).map(String::as_str), Some(" "));
        assert_eq!(map.get(&0x24).map(String::as_str), Some("A"));
        assert_eq!(map.get(&0x46).map(String::as_str), Some("c"));
        assert_eq!(map.get(&0x51).map(String::as_str), Some("ü"));
    }

    #[test]
    fn cid_widths_accept_both_forms() {
        let doc = LoDocument::with_version("1.7");
        let w = LoObject::Array(vec![
            1.into(),
            LoObject::Array(vec![600.into(), 700.into()]),
            10.into(),
            12.into(),
            300.into(),
        ]);
        let widths = parse_cid_font_widths(&doc, &w);
        assert_eq!(widths.get(&2), Some(&700.0));
        assert_eq!(widths.get(&11), Some(&300.0));
        assert_eq!(widths.get(&13), None);
    }

    #[test]
    fn garbage_and_empty_inputs_are_decode_errors() {
        let err = PdfPages::load(b"not a pdf").err().expect("must fail");
        assert!(err.is_decode_failure());
        let err = PdfPages::load(&[]).err().expect("must fail");
        assert!(err.is_decode_failure());
    }

    #[test]
    fn missing_page_index_is_a_page_error() {
        let bytes = pdf_with_pages(&[(10, 10, "")]);
        let mut pages = PdfPages::load(&bytes).unwrap();
        assert_eq!(pages.page_count(), 1);
        assert!(matches!(
            pages.display_list(3),
            Err(TilemarkError::PageRender { index: 3, .. })
        ));
    }

    #[test]
    fn ext_gstate_alpha_becomes_opacity() {
        let mut fixture = FixtureDoc::new();
        fixture.add_page(
            10,
            10,
            "/GS1 gs 0 0 10 10 re f",
            dictionary! { "ExtGState" => dictionary! { "GS1" => dictionary! { "ca" => 0.5f32 } } },
        );
        let bytes = fixture.finish();
        let mut pages = PdfPages::load(&bytes).unwrap();
        let list = pages.display_list(0).unwrap();
        assert!(list.commands.iter().any(|c| matches!(
            c,
            Command::SetOpacity { fill, stroke } if (*fill - 0.5).abs() < 1e-6 && *stroke == 1.0
        )));
    }
}
