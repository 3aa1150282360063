//! Stamps a tile image across the selected pages of a PDF.
//!
//! The original bytes are re-parsed on every call. The tile PNG becomes one
//! image XObject (RGB plus a DeviceGray soft mask) shared by every page, and
//! each selected page gets a grid of `Do` draws under an exclusion
//! ExtGState, covering its MediaBox.

use std::collections::BTreeSet;

use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};
use lopdf::{Stream as LoStream, dictionary};

use crate::error::{TilemarkError, image_err, lopdf_err};
use crate::pdf_raster::{PageGeometry, inherited_page_attr, page_geometry, resolve_dict};
use crate::types::Pt;

/// Which page edge the first full tile row is flush with.
///
/// Named in PDF user space, where y grows upwards from the MediaBox
/// origin. The partial last row overflows the opposite edge, so `Top`
/// is the layout whose overflow hangs off the bottom of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileAnchor {
    /// Row 0 rests on the bottom edge, `y = row * th`; overflow is past
    /// the top edge.
    #[default]
    Bottom,
    /// Row 0 is flush with the top edge, `y = H - th * (row + 1)`;
    /// overflow is below `y = 0`.
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    pub columns: usize,
    pub rows: usize,
}

impl TileGrid {
    pub fn draws(&self) -> usize {
        self.columns * self.rows
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PagePlacement {
    pub index: usize,
    pub grid: TileGrid,
}

#[derive(Debug, Clone)]
pub struct EmbedReport {
    pub bytes: Vec<u8>,
    pub pages: Vec<PagePlacement>,
}

impl EmbedReport {
    pub fn draws(&self) -> usize {
        self.pages.iter().map(|p| p.grid.draws()).sum()
    }
}

/// `ceil(W / tw)` by `ceil(H / th)`.
pub fn tile_grid(page_width: f32, page_height: f32, tile_width: f32, tile_height: f32) -> TileGrid {
    TileGrid {
        columns: Pt::from_f32(page_width).spans_of(Pt::from_f32(tile_width)),
        rows: Pt::from_f32(page_height).spans_of(Pt::from_f32(tile_height)),
    }
}

/// Lower-left corners of every tile, relative to the page origin.
pub fn tile_origins(
    page_width: f32,
    page_height: f32,
    tile_width: f32,
    tile_height: f32,
    anchor: TileAnchor,
) -> Vec<(f32, f32)> {
    let grid = tile_grid(page_width, page_height, tile_width, tile_height);
    let tw = Pt::from_f32(tile_width);
    let th = Pt::from_f32(tile_height);
    let h = Pt::from_f32(page_height);
    let mut out = Vec::with_capacity(grid.draws());
    for row in 0..grid.rows {
        let y = match anchor {
            TileAnchor::Bottom => th * row,
            TileAnchor::Top => h - th * (row + 1),
        };
        for col in 0..grid.columns {
            out.push(((tw * col).to_f32(), y.to_f32()));
        }
    }
    out
}

struct TileImage {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
    alpha: Vec<u8>,
}

fn decode_tile(png: &[u8]) -> Result<TileImage, TilemarkError> {
    let decoded = image::load_from_memory(png).map_err(image_err)?.to_rgba8();
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(TilemarkError::Image("empty tile image".to_string()));
    }
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    for px in decoded.pixels() {
        rgb.extend_from_slice(&px.0[..3]);
        alpha.push(px.0[3]);
    }
    Ok(TileImage {
        width,
        height,
        rgb,
        alpha,
    })
}

fn add_tile_image(doc: &mut LoDocument, tile: TileImage) -> ObjectId {
    let smask_id = doc.add_object(LoStream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => tile.width as i64,
            "Height" => tile.height as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        tile.alpha,
    ));
    doc.add_object(LoStream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => tile.width as i64,
            "Height" => tile.height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "SMask" => smask_id,
        },
        tile.rgb,
    ))
}

/// Embeds `tile_png` on every page in `selected`, drawn `tile_width` by
/// `tile_height` points per repeat, and returns the serialized document.
pub fn embed(
    original: &[u8],
    tile_png: &[u8],
    selected: &BTreeSet<usize>,
    tile_width: f32,
    tile_height: f32,
    anchor: TileAnchor,
) -> Result<EmbedReport, TilemarkError> {
    if !(tile_width.is_finite() && tile_height.is_finite() && tile_width > 0.0 && tile_height > 0.0)
    {
        return Err(TilemarkError::InvalidConfiguration(format!(
            "tile size must be positive, got {tile_width}x{tile_height}"
        )));
    }
    let mut doc = LoDocument::load_mem(original).map_err(|e| TilemarkError::Decode(e.to_string()))?;
    if doc.is_encrypted() {
        return Err(TilemarkError::Decode(
            "encrypted documents are not supported".to_string(),
        ));
    }
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    if let Some(bad) = selected.iter().find(|i| **i >= page_ids.len()) {
        return Err(TilemarkError::InvalidConfiguration(format!(
            "page {bad} selected but the document has {} pages",
            page_ids.len()
        )));
    }

    let image_id = add_tile_image(&mut doc, decode_tile(tile_png)?);
    let gs_id = doc.add_object(dictionary! {
        "Type" => "ExtGState",
        "BM" => "Exclusion",
    });

    let mut pages = Vec::with_capacity(selected.len());
    for &index in selected {
        let page_id = page_ids[index];
        let geometry = page_geometry(&doc, page_id)?;
        let grid = stamp_page(
            &mut doc,
            page_id,
            &geometry,
            image_id,
            gs_id,
            tile_width,
            tile_height,
            anchor,
        )?;
        pages.push(PagePlacement { index, grid });
    }

    doc.compress();
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;
    let report = EmbedReport { bytes, pages };
    tracing::info!(
        pages = report.pages.len(),
        draws = report.draws(),
        bytes = report.bytes.len(),
        "watermark embedded"
    );
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn stamp_page(
    doc: &mut LoDocument,
    page_id: ObjectId,
    geometry: &PageGeometry,
    image_id: ObjectId,
    gs_id: ObjectId,
    tile_width: f32,
    tile_height: f32,
    anchor: TileAnchor,
) -> Result<TileGrid, TilemarkError> {
    let page = doc
        .get_object(page_id)
        .and_then(LoObject::as_dict)
        .map_err(lopdf_err)?;

    let mut resources = inherited_page_attr(doc, page, b"Resources")
        .and_then(|obj| resolve_dict(doc, obj))
        .cloned()
        .unwrap_or_default();
    let mut xobjects = resource_subdict(doc, &resources, b"XObject");
    let mut gstates = resource_subdict(doc, &resources, b"ExtGState");
    let image_name = unused_name(&xobjects, "TmTile");
    let gs_name = unused_name(&gstates, "TmExcl");
    xobjects.set(image_name.as_bytes().to_vec(), LoObject::Reference(image_id));
    gstates.set(gs_name.as_bytes().to_vec(), LoObject::Reference(gs_id));
    resources.set("XObject", LoObject::Dictionary(xobjects));
    resources.set("ExtGState", LoObject::Dictionary(gstates));

    let existing: Vec<LoObject> = match page.get(b"Contents") {
        Ok(LoObject::Reference(id)) => match doc.get_object(*id) {
            Ok(LoObject::Array(items)) => items.clone(),
            _ => vec![LoObject::Reference(*id)],
        },
        Ok(LoObject::Array(items)) => items.clone(),
        _ => Vec::new(),
    };

    let width = geometry.media_width();
    let height = geometry.media_height();
    let (x0, y0) = geometry.origin();
    let grid = tile_grid(width, height, tile_width, tile_height);
    // Streams are concatenated without separators.
    let mut ops = String::from("\nQ\n");
    for (x, y) in tile_origins(width, height, tile_width, tile_height, anchor) {
        ops.push_str(&format!(
            "q /{gs_name} gs {} 0 0 {} {} {} cm /{image_name} Do Q\n",
            num(tile_width),
            num(tile_height),
            num(x0 + x),
            num(y0 + y)
        ));
    }

    // The page's own content runs inside q/Q so its CTM does not leak into
    // the tile draws.
    let prefix_id = doc.add_object(LoStream::new(LoDictionary::new(), b"q\n".to_vec()));
    let suffix_id = doc.add_object(LoStream::new(LoDictionary::new(), ops.into_bytes()));
    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(LoObject::Reference(prefix_id));
    contents.extend(existing);
    contents.push(LoObject::Reference(suffix_id));

    let page_mut = doc
        .get_object_mut(page_id)
        .and_then(LoObject::as_dict_mut)
        .map_err(lopdf_err)?;
    page_mut.set("Resources", LoObject::Dictionary(resources));
    page_mut.set("Contents", LoObject::Array(contents));
    Ok(grid)
}

fn resource_subdict(doc: &LoDocument, resources: &LoDictionary, key: &[u8]) -> LoDictionary {
    resources
        .get(key)
        .ok()
        .and_then(|obj| resolve_dict(doc, obj))
        .cloned()
        .unwrap_or_default()
}

fn unused_name(dict: &LoDictionary, stem: &str) -> String {
    let mut n = 0usize;
    loop {
        let candidate = if n == 0 {
            stem.to_string()
        } else {
            format!("{stem}{n}")
        };
        if !dict.has(candidate.as_bytes()) {
            return candidate;
        }
        n += 1;
    }
}

fn num(value: f32) -> String {
    let s = format!("{value:.3}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" { "0".to_string() } else { s.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FixtureDoc, pdf_with_pages};
    use lopdf::content::Content;

    fn tile_png(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(w, h, image::Rgba([200, 40, 40, 128]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn all(n: usize) -> BTreeSet<usize> {
        (0..n).collect()
    }

    /// `Do` operands per page, in page order.
    fn draws_per_page(bytes: &[u8]) -> Vec<Vec<(f32, f32)>> {
        let doc = LoDocument::load_mem(bytes).unwrap();
        doc.get_pages()
            .values()
            .map(|id| {
                let content = Content::decode(&doc.get_page_content(*id).unwrap()).unwrap();
                let mut last_cm = (0.0, 0.0);
                let mut out = Vec::new();
                for op in &content.operations {
                    match op.operator.as_str() {
                        "cm" => {
                            let f = |i: usize| op.operands[i].as_float().unwrap_or_else(|_| {
                                op.operands[i].as_i64().unwrap() as f32
                            });
                            last_cm = (f(4), f(5));
                        }
                        "Do" => out.push(last_cm),
                        _ => {}
                    }
                }
                out
            })
            .collect()
    }

    fn image_xobjects(bytes: &[u8]) -> Vec<(i64, i64, Vec<u8>)> {
        let doc = LoDocument::load_mem(bytes).unwrap();
        doc.objects
            .values()
            .filter_map(|obj| obj.as_stream().ok())
            .filter(|s| s.dict.get(b"Subtype").and_then(LoObject::as_name).ok() == Some(&b"Image"[..]))
            .map(|s| {
                (
                    s.dict.get(b"Width").unwrap().as_i64().unwrap(),
                    s.dict.get(b"Height").unwrap().as_i64().unwrap(),
                    s.dict
                        .get(b"ColorSpace")
                        .unwrap()
                        .as_name()
                        .unwrap()
                        .to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn grid_is_ceil_of_page_over_tile() {
        assert_eq!(tile_grid(612.0, 792.0, 222.0, 336.0), TileGrid { columns: 3, rows: 3 });
        assert_eq!(tile_grid(444.0, 336.0, 222.0, 168.0), TileGrid { columns: 2, rows: 2 });
        assert_eq!(tile_grid(445.0, 1.0, 222.0, 168.0).draws(), 3);
    }

    #[test]
    fn origins_cover_every_point() {
        let (w, h, tw, th) = (612.0f32, 792.0f32, 222.0f32, 336.0f32);
        for anchor in [TileAnchor::Bottom, TileAnchor::Top] {
            let origins = tile_origins(w, h, tw, th, anchor);
            assert_eq!(origins.len(), 9);
            let mut y = 0.0;
            while y < h {
                let mut x = 0.0;
                while x < w {
                    assert!(
                        origins
                            .iter()
                            .any(|(ox, oy)| x >= *ox && x < ox + tw && y >= *oy && y < oy + th),
                        "({x}, {y}) uncovered with {anchor:?}"
                    );
                    x += 7.5;
                }
                y += 7.5;
            }
        }
        let top = tile_origins(w, h, tw, th, TileAnchor::Top);
        assert_eq!(top[0], (0.0, 456.0));
        assert_eq!(top[8], (444.0, -216.0));
    }

    #[test]
    fn anchors_are_named_in_y_up_space() {
        let (w, h, tw, th) = (100.0f32, 250.0f32, 100.0f32, 100.0f32);
        let bottom = tile_origins(w, h, tw, th, TileAnchor::Bottom);
        assert_eq!(bottom.first(), Some(&(0.0, 0.0)));
        assert_eq!(bottom.last(), Some(&(0.0, 200.0)));
        assert!(bottom[2].1 + th > h);

        let top = tile_origins(w, h, tw, th, TileAnchor::Top);
        assert_eq!(top.first(), Some(&(0.0, 150.0)));
        assert_eq!(top[0].1 + th, h);
        assert_eq!(top.last(), Some(&(0.0, -50.0)));
    }

    #[test]
    fn stamps_selected_pages_only() {
        let original = pdf_with_pages(&[(612, 792, "0 g 0 0 10 10 re f"); 3]);
        let selected: BTreeSet<usize> = [0, 2].into_iter().collect();
        let report = embed(&original, &tile_png(4, 6), &selected, 222.0, 336.0, TileAnchor::Bottom)
            .unwrap();
        assert_eq!(report.draws(), 18);
        let draws = draws_per_page(&report.bytes);
        assert_eq!(draws.iter().map(Vec::len).collect::<Vec<_>>(), vec![9, 0, 9]);
        assert!(draws[0].contains(&(444.0, 672.0)));
    }

    #[test]
    fn empty_selection_embeds_image_without_draws() {
        let original = pdf_with_pages(&[(100, 100, "")]);
        let report =
            embed(&original, &tile_png(4, 6), &BTreeSet::new(), 50.0, 50.0, TileAnchor::Bottom)
                .unwrap();
        assert_eq!(report.draws(), 0);
        let images = image_xobjects(&report.bytes);
        assert!(images.contains(&(4, 6, b"DeviceRGB".to_vec())));
        assert!(images.contains(&(4, 6, b"DeviceGray".to_vec())));
    }

    #[test]
    fn repeated_exports_are_independent() {
        let original = pdf_with_pages(&[(300, 300, ""), (300, 300, "")]);
        let png = tile_png(2, 2);
        let first = embed(&original, &png, &all(2), 100.0, 100.0, TileAnchor::Bottom).unwrap();
        let only_second: BTreeSet<usize> = [1].into_iter().collect();
        let second =
            embed(&original, &png, &only_second, 100.0, 100.0, TileAnchor::Bottom).unwrap();
        assert_eq!(draws_per_page(&first.bytes).iter().map(Vec::len).sum::<usize>(), 18);
        assert_eq!(
            draws_per_page(&second.bytes).iter().map(Vec::len).collect::<Vec<_>>(),
            vec![0, 9]
        );
    }

    #[test]
    fn media_box_origin_offsets_draws() {
        let mut fixture = FixtureDoc::new();
        let page = fixture.add_page(100, 100, "", LoDictionary::new());
        fixture.set_page_attr(
            page,
            "MediaBox",
            LoObject::Array(vec![10.into(), 20.into(), 110.into(), 120.into()]),
        );
        let original = fixture.finish();
        let report = embed(&original, &tile_png(2, 2), &all(1), 60.0, 60.0, TileAnchor::Top).unwrap();
        let draws = &draws_per_page(&report.bytes)[0];
        assert_eq!(draws.len(), 4);
        assert!(draws.contains(&(10.0, 60.0)));
        assert!(draws.contains(&(70.0, 0.0)));
    }

    #[test]
    fn existing_resources_keep_their_names() {
        let mut fixture = FixtureDoc::new();
        let gs = fixture.doc.add_object(dictionary! { "Type" => "ExtGState", "ca" => LoObject::Real(0.5) });
        let resources = dictionary! {
            "ExtGState" => dictionary! { "TmExcl" => gs },
        };
        fixture.add_page(50, 50, "/TmExcl gs 0 g 0 0 5 5 re f", resources);
        let original = fixture.finish();
        let report = embed(&original, &tile_png(2, 2), &all(1), 50.0, 50.0, TileAnchor::Bottom).unwrap();

        let doc = LoDocument::load_mem(&report.bytes).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        let page = doc.get_object(page_id).unwrap().as_dict().unwrap();
        let res = resolve_dict(&doc, page.get(b"Resources").unwrap()).unwrap();
        let gstates = resolve_dict(&doc, res.get(b"ExtGState").unwrap()).unwrap();
        assert!(gstates.has(b"TmExcl"));
        assert!(gstates.has(b"TmExcl1"));
        let content = String::from_utf8_lossy(&doc.get_page_content(page_id).unwrap()).into_owned();
        assert!(content.contains("/TmExcl1 gs"));
        let ours = resolve_dict(&doc, gstates.get(b"TmExcl1").unwrap()).unwrap();
        assert_eq!(ours.get(b"BM").unwrap().as_name().unwrap(), b"Exclusion");
    }

    #[test]
    fn rejects_bad_input() {
        let original = pdf_with_pages(&[(10, 10, "")]);
        let png = tile_png(1, 1);
        assert!(embed(&original, &png, &all(2), 5.0, 5.0, TileAnchor::Bottom).is_err());
        assert!(embed(&original, &png, &all(1), 0.0, 5.0, TileAnchor::Bottom).is_err());
        assert!(embed(&original, b"nope", &all(1), 5.0, 5.0, TileAnchor::Bottom).is_err());
        let err = embed(b"not a pdf", &png, &all(1), 5.0, 5.0, TileAnchor::Bottom).unwrap_err();
        assert!(err.is_decode_failure());
    }

    #[test]
    fn numbers_are_compact() {
        assert_eq!(num(222.0), "222");
        assert_eq!(num(0.5), "0.5");
        assert_eq!(num(-0.0001), "0");
    }
}
