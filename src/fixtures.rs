//! Small in-memory PDFs for unit tests.

use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};
use lopdf::{Stream as LoStream, dictionary};

pub(crate) struct FixtureDoc {
    pub doc: LoDocument,
    pub pages_id: ObjectId,
    pub kids: Vec<ObjectId>,
}

impl FixtureDoc {
    pub fn new() -> Self {
        let mut doc = LoDocument::with_version("1.7");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
        }
    }

    pub fn add_page(
        &mut self,
        width: i64,
        height: i64,
        content: &str,
        resources: LoDictionary,
    ) -> ObjectId {
        let content_id = self.doc.add_object(LoStream::new(
            LoDictionary::new(),
            content.as_bytes().to_vec(),
        ));
        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "Contents" => content_id,
            "Resources" => resources,
            "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
        });
        self.kids.push(page_id);
        page_id
    }

    pub fn set_page_attr(&mut self, page_id: ObjectId, key: &str, value: LoObject) {
        if let Ok(LoObject::Dictionary(dict)) = self.doc.get_object_mut(page_id) {
            dict.set(key, value);
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        let count = self.kids.len() as i64;
        let kids: Vec<LoObject> = self.kids.iter().map(|id| (*id).into()).collect();
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        };
        self.doc
            .objects
            .insert(self.pages_id, LoObject::Dictionary(pages));
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        self.doc.compress();
        let mut out = Vec::new();
        self.doc.save_to(&mut out).expect("save fixture");
        out
    }
}

/// One blank-resource page per `(width, height, content)`.
pub(crate) fn pdf_with_pages(pages: &[(i64, i64, &str)]) -> Vec<u8> {
    let mut fixture = FixtureDoc::new();
    for (width, height, content) in pages {
        fixture.add_page(*width, *height, content, LoDictionary::new());
    }
    fixture.finish()
}

/// Advance of every printable glyph in [`box_font`], in font units of 1000.
pub(crate) const BOX_ADVANCE: u16 = 600;

/// A minimal TrueType font: printable ASCII maps to a solid box glyph
/// (x 50..550, y 0..700), space to an empty glyph. Tests get real glyph
/// outlines without depending on the fonts installed on the host.
pub(crate) fn box_font() -> Vec<u8> {
    fn be16(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_be_bytes());
    }
    fn be32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    const NUM_GLYPHS: u16 = 3;

    // cmap: one Windows Unicode BMP subtable, format 6 over 0x20..=0x7E.
    let mut cmap = Vec::new();
    be16(&mut cmap, 0);
    be16(&mut cmap, 1);
    be16(&mut cmap, 3);
    be16(&mut cmap, 1);
    be32(&mut cmap, 12);
    let entries = 0x7E - 0x20 + 1;
    be16(&mut cmap, 6);
    be16(&mut cmap, 10 + 2 * entries);
    be16(&mut cmap, 0);
    be16(&mut cmap, 0x20);
    be16(&mut cmap, entries);
    for code in 0x20..=0x7Eu16 {
        be16(&mut cmap, if code == 0x20 { 1 } else { 2 });
    }

    // glyf: .notdef and space are empty, glyph 2 is the box.
    let mut glyf = Vec::new();
    be16(&mut glyf, 1);
    for v in [50u16, 0, 550, 700] {
        be16(&mut glyf, v);
    }
    be16(&mut glyf, 3);
    be16(&mut glyf, 0);
    glyf.extend_from_slice(&[0x01; 4]);
    for dx in [50i16, 500, 0, -500] {
        be16(&mut glyf, dx as u16);
    }
    for dy in [0i16, 0, 700, 0] {
        be16(&mut glyf, dy as u16);
    }
    while glyf.len() % 4 != 0 {
        glyf.push(0);
    }

    let mut loca = Vec::new();
    for offset in [0u32, 0, 0, glyf.len() as u32] {
        be32(&mut loca, offset);
    }

    let mut head = Vec::new();
    be32(&mut head, 0x0001_0000);
    be32(&mut head, 0x0001_0000);
    be32(&mut head, 0);
    be32(&mut head, 0x5F0F_3CF5);
    be16(&mut head, 0);
    be16(&mut head, 1000);
    head.extend_from_slice(&[0; 16]);
    for v in [0u16, 0, 550, 700] {
        be16(&mut head, v);
    }
    be16(&mut head, 0);
    be16(&mut head, 8);
    be16(&mut head, 2);
    be16(&mut head, 1);
    be16(&mut head, 0);

    let mut hhea = Vec::new();
    be32(&mut hhea, 0x0001_0000);
    be16(&mut hhea, 800);
    be16(&mut hhea, (-200i16) as u16);
    be16(&mut hhea, 0);
    be16(&mut hhea, BOX_ADVANCE);
    be16(&mut hhea, 0);
    be16(&mut hhea, 50);
    be16(&mut hhea, 550);
    be16(&mut hhea, 1);
    be16(&mut hhea, 0);
    be16(&mut hhea, 0);
    hhea.extend_from_slice(&[0; 8]);
    be16(&mut hhea, 0);
    be16(&mut hhea, NUM_GLYPHS);

    let mut hmtx = Vec::new();
    for (advance, lsb) in [(500u16, 0u16), (BOX_ADVANCE / 2, 0), (BOX_ADVANCE, 50)] {
        be16(&mut hmtx, advance);
        be16(&mut hmtx, lsb);
    }

    let mut maxp = Vec::new();
    be32(&mut maxp, 0x0001_0000);
    be16(&mut maxp, NUM_GLYPHS);
    for v in [4u16, 1, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0] {
        be16(&mut maxp, v);
    }

    // Table records must be sorted by tag.
    let tables: [(&[u8; 4], Vec<u8>); 7] = [
        (b"cmap", cmap),
        (b"glyf", glyf),
        (b"head", head),
        (b"hhea", hhea),
        (b"hmtx", hmtx),
        (b"loca", loca),
        (b"maxp", maxp),
    ];
    let mut out = Vec::new();
    be32(&mut out, 0x0001_0000);
    be16(&mut out, tables.len() as u16);
    be16(&mut out, 64);
    be16(&mut out, 2);
    be16(&mut out, 48);
    let mut offset = 12 + 16 * tables.len();
    let mut body = Vec::new();
    for (tag, data) in &tables {
        out.extend_from_slice(*tag);
        be32(&mut out, 0);
        be32(&mut out, offset as u32);
        be32(&mut out, data.len() as u32);
        body.extend_from_slice(data);
        while body.len() % 4 != 0 {
            body.push(0);
        }
        offset = 12 + 16 * tables.len() + body.len();
    }
    out.extend_from_slice(&body);
    out
}
