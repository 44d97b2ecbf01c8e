use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use leitor_core::{
    DocumentBackend, DocumentKind, DocumentProvider, DocumentSource, ReaderError, ReaderResult,
    RenderImage, Thumbnail,
};
use tracing::{info, instrument, warn};

mod archive;
mod epub;
#[cfg(feature = "pdf")]
mod pdf;

pub use archive::{natural_cmp, ComicArchiveDocument};
pub use epub::{location_ranges, xhtml_to_text, EpubDocument, LOCATION_CHARS};
#[cfg(feature = "pdf")]
pub use pdf::{PdfiumDocument, PdfiumProvider, PDFIUM_PATH_ENV};

const THUMBNAIL_QUALITY: u8 = 75;

/// Opens documents by dispatching on their declared kind.
pub struct FormatRouter {
    #[cfg(feature = "pdf")]
    pdf: Option<PdfiumProvider>,
    pdf_unavailable: Option<String>,
}

impl FormatRouter {
    /// Builds a router, binding Pdfium if a library can be found.
    pub fn new() -> Self {
        #[cfg(feature = "pdf")]
        {
            match PdfiumProvider::new() {
                Ok(provider) => Self {
                    pdf: Some(provider),
                    pdf_unavailable: None,
                },
                Err(err) => {
                    warn!("pdf support disabled: {err:#}");
                    Self {
                        pdf: None,
                        pdf_unavailable: Some(format!("{err:#}")),
                    }
                }
            }
        }
        #[cfg(not(feature = "pdf"))]
        {
            Self::without_pdf()
        }
    }

    pub fn without_pdf() -> Self {
        Self {
            #[cfg(feature = "pdf")]
            pdf: None,
            pdf_unavailable: Some("pdf support is not available".into()),
        }
    }

    fn open_pdf(&self, bytes: Vec<u8>) -> ReaderResult<Arc<dyn DocumentBackend>> {
        #[cfg(feature = "pdf")]
        {
            if let Some(provider) = &self.pdf {
                return Ok(Arc::new(provider.open_bytes(bytes)?));
            }
        }
        #[cfg(not(feature = "pdf"))]
        {
            drop(bytes);
        }

        Err(ReaderError::LoadFailure(
            self.pdf_unavailable
                .clone()
                .unwrap_or_else(|| "pdf support is not available".into()),
        ))
    }
}

impl Default for FormatRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentProvider for FormatRouter {
    #[instrument(skip(self, source), fields(name = %source.name, kind = %source.kind))]
    async fn open(&self, source: DocumentSource) -> ReaderResult<Arc<dyn DocumentBackend>> {
        let backend: Arc<dyn DocumentBackend> = match source.kind {
            DocumentKind::ComicArchive => Arc::new(ComicArchiveDocument::open(source.bytes)?),
            DocumentKind::Epub => Arc::new(EpubDocument::open(source.bytes)?),
            DocumentKind::Pdf => self.open_pdf(source.bytes)?,
        };
        info!(pages = backend.page_count(), "document opened");
        Ok(backend)
    }
}

pub(crate) fn to_render_image(image: DynamicImage) -> RenderImage {
    let rgba = image.into_rgba8();
    RenderImage {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    }
}

/// Encodes `image` as a JPEG no larger than `max_dimension` on either edge.
pub fn encode_thumbnail(image: &DynamicImage, max_dimension: u32) -> Result<Thumbnail> {
    let max_dimension = max_dimension.max(1);
    let scaled = if image.width() > max_dimension || image.height() > max_dimension {
        image.thumbnail(max_dimension, max_dimension)
    } else {
        image.clone()
    };
    let rgb = scaled.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, THUMBNAIL_QUALITY)
        .encode_image(&rgb)
        .context("failed to encode thumbnail")?;
    Ok(Thumbnail {
        mime: "image/jpeg".into(),
        bytes,
    })
}
