use std::convert::TryFrom;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use leitor_core::{
    BackendKind, DocumentBackend, Drawable, ReaderError, ReaderResult, RenderImage,
    RenderRequest, Thumbnail,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

use crate::encode_thumbnail;

/// Runtime override for the Pdfium shared library location.
pub const PDFIUM_PATH_ENV: &str = "LEITOR_PDFIUM_LIBRARY_PATH";

pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }

    pub fn open_bytes(&self, bytes: Vec<u8>) -> ReaderResult<PdfiumDocument> {
        let page_count = {
            let document = self
                .pdfium
                .load_pdf_from_byte_slice(&bytes, None)
                .map_err(|err| ReaderError::CorruptDocument(format!("unreadable pdf: {err}")))?;
            usize::try_from(document.pages().len()).unwrap_or_default()
        };
        debug!(page_count, "opened pdf");
        Ok(PdfiumDocument {
            pdfium: Arc::clone(&self.pdfium),
            bytes: Mutex::new(Some(Arc::new(bytes))),
            page_count,
            cache: Mutex::new(None),
        })
    }
}

pub struct PdfiumDocument {
    pdfium: Arc<Pdfium>,
    bytes: Mutex<Option<Arc<Vec<u8>>>>,
    page_count: usize,
    cache: Mutex<Option<RenderCacheEntry>>,
}

struct RenderCacheEntry {
    page_index: usize,
    scale: f32,
    image: RenderImage,
}

impl PdfiumDocument {
    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'_>) -> Result<R>,
    {
        let bytes = self
            .bytes
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("document is closed"))?;
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(&bytes, None)
            .context("failed to reload pdf")?;
        f(&document)
    }

    fn render_internal(
        document: &PdfDocument<'_>,
        page_index: usize,
        config: &PdfRenderConfig,
    ) -> Result<RenderImage> {
        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))?;
        let bitmap = page
            .render_with_config(config)
            .with_context(|| format!("failed to render page {}", page_index))?;
        let image = bitmap.as_image().to_rgba8();

        Ok(RenderImage {
            width: u32::try_from(bitmap.width()).unwrap_or_default(),
            height: u32::try_from(bitmap.height()).unwrap_or_default(),
            pixels: image.into_raw(),
        })
    }
}

impl DocumentBackend for PdfiumDocument {
    fn kind(&self) -> BackendKind {
        BackendKind::FixedPages
    }

    fn page_count(&self) -> usize {
        self.page_count
    }

    #[instrument(skip(self))]
    fn render(&self, request: RenderRequest) -> ReaderResult<Drawable> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.page_index == request.page_index
                    && (entry.scale - request.scale).abs() < f32::EPSILON
                {
                    return Ok(Drawable::Raster(entry.image.clone()));
                }
            }
        }

        let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
        let image = self
            .with_document(|document| {
                Self::render_internal(document, request.page_index, &config)
            })
            .map_err(|err| ReaderError::RenderFailure {
                page: request.page_index,
                reason: format!("{err:#}"),
            })?;

        *self.cache.lock() = Some(RenderCacheEntry {
            page_index: request.page_index,
            scale: request.scale,
            image: image.clone(),
        });
        Ok(Drawable::Raster(image))
    }

    fn thumbnail(&self, max_dimension: u32) -> ReaderResult<Option<Thumbnail>> {
        let edge = i32::try_from(max_dimension).unwrap_or(i32::MAX);
        let config = PdfRenderConfig::new()
            .set_target_width(edge)
            .set_maximum_height(edge);
        let image = self
            .with_document(|document| Self::render_internal(document, 0, &config))
            .map_err(|err| ReaderError::RenderFailure {
                page: 0,
                reason: format!("{err:#}"),
            })?;
        let Some(buffer) = image::RgbaImage::from_raw(image.width, image.height, image.pixels)
        else {
            return Ok(None);
        };
        encode_thumbnail(&image::DynamicImage::ImageRgba8(buffer), max_dimension)
            .map(Some)
            .map_err(|err| ReaderError::RenderFailure {
                page: 0,
                reason: format!("{err:#}"),
            })
    }

    fn close(&self) {
        self.cache.lock().take();
        self.bytes.lock().take();
    }
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match std::env::var(PDFIUM_PATH_ENV) {
        Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!("failed to load Pdfium from {}={}: {}", PDFIUM_PATH_ENV, path, err);
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {} or install it ({})",
                PDFIUM_PATH_ENV,
                errors.join(", ")
            ))
        }
    }
}
