use crate::error::TilemarkError;
use crate::pdf_raster::PdfPages;
use crate::perf::PerfLogger;
use crate::raster::{encode_png, png_data_url, render_display_list};
use crate::types::Color;

/// One rendered page: natural size in points plus two encoded renders.
#[derive(Clone, Debug)]
pub struct PageImage {
    pub index: usize,
    pub width: f32,
    pub height: f32,
    /// Scale-1 render used for thumbnails and metadata.
    pub thumbnail_png: Vec<u8>,
    /// Render used for the main preview, at `preview_scale`.
    pub preview_png: Vec<u8>,
    pub preview_scale: f32,
}

impl PageImage {
    pub fn preview_data_url(&self) -> String {
        png_data_url(&self.preview_png)
    }

    pub fn thumbnail_data_url(&self) -> String {
        png_data_url(&self.thumbnail_png)
    }
}

#[derive(Clone, Debug)]
pub struct PageRenderOptions {
    pub batch_size: usize,
    /// Pages narrower than this (points) get the hi-dpi preview render.
    pub hi_dpi_width_threshold: f32,
    pub hi_dpi_scale: f32,
    pub background: Color,
}

impl Default for PageRenderOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            hi_dpi_width_threshold: 1600.0,
            hi_dpi_scale: 2.0,
            background: Color::WHITE,
        }
    }
}

impl PageRenderOptions {
    pub fn preview_scale_for(&self, page_width: f32) -> f32 {
        if page_width < self.hi_dpi_width_threshold {
            self.hi_dpi_scale
        } else {
            1.0
        }
    }
}

/// Number of pages in `bytes`, without rendering anything.
pub fn page_count(bytes: &[u8]) -> Result<usize, TilemarkError> {
    Ok(PdfPages::load(bytes)?.page_count())
}

/// Renders every page of `bytes` in sequential batches of
/// `options.batch_size`; pages inside a batch render in parallel. Each
/// finished batch is handed to `on_batch` in page order.
///
/// On a page failure the pages of that batch that precede it are still
/// delivered, then the error is returned. Returns the page count on success.
pub fn render_pages<F>(
    bytes: &[u8],
    options: &PageRenderOptions,
    perf: Option<&PerfLogger>,
    epoch: Option<u64>,
    mut on_batch: F,
) -> Result<usize, TilemarkError>
where
    F: FnMut(Vec<PageImage>),
{
    use rayon::prelude::*;

    let mut pdf = PdfPages::load(bytes)?;
    let total = pdf.page_count();
    let batch_size = options.batch_size.max(1);
    tracing::debug!(pages = total, batch_size, "page render started");

    let mut start = 0usize;
    while start < total {
        let end = (start + batch_size).min(total);
        let _span = perf.map(|p| p.span("pages.batch", epoch));

        // Content interpretation needs `&mut PdfPages`; rasterization does not.
        let mut lists = Vec::with_capacity(end - start);
        let mut parse_error = None;
        for index in start..end {
            match pdf.display_list(index) {
                Ok(list) => lists.push((index, list)),
                Err(err) => {
                    parse_error = Some(err);
                    break;
                }
            }
        }

        let fonts = pdf.fonts();
        let mut results: Vec<(usize, Result<PageImage, TilemarkError>)> = lists
            .par_iter()
            .map(|(index, list)| {
                let width = list.size.width.to_f32();
                let height = list.size.height.to_f32();
                let preview_scale = options.preview_scale_for(width);
                let render = |scale: f32| {
                    render_display_list(list, scale, Some(options.background), fonts)
                        .and_then(|pixmap| encode_png(&pixmap))
                };
                let page = render(1.0).and_then(|thumbnail_png| {
                    let preview_png = if (preview_scale - 1.0).abs() < f32::EPSILON {
                        thumbnail_png.clone()
                    } else {
                        render(preview_scale)?
                    };
                    Ok(PageImage {
                        index: *index,
                        width,
                        height,
                        thumbnail_png,
                        preview_png,
                        preview_scale,
                    })
                });
                let page = page.map_err(|err| match err {
                    TilemarkError::PageRender { .. } => err,
                    other => TilemarkError::PageRender {
                        index: *index,
                        message: other.to_string(),
                    },
                });
                (*index, page)
            })
            .collect();
        results.sort_by_key(|(idx, _)| *idx);

        let mut batch = Vec::with_capacity(results.len());
        let mut failure = None;
        for (_, res) in results {
            match res {
                Ok(page) => batch.push(page),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let delivered = batch.len();
        if !batch.is_empty() {
            on_batch(batch);
        }
        if let Some(err) = failure.or(parse_error) {
            tracing::warn!(error = %err, "page render aborted");
            return Err(err);
        }
        if let Some(p) = perf {
            p.log_counts(
                "pages.batch",
                epoch,
                &[("first", start as u64), ("pages", delivered as u64)],
            );
        }
        tracing::debug!(first = start, pages = delivered, total, "page batch rendered");
        start = end;
    }
    Ok(total)
}
