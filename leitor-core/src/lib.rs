use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod detect;
mod error;
mod library;
mod panel;
mod session;
mod settings;

pub use detect::{sanitize_panels, PanelDetector};
pub use error::{ReaderError, ReaderResult};
pub use library::{
    library_id, FileLibraryStore, Library, LibraryItem, LibraryRecord, LibraryStore,
    MemoryLibraryStore,
};
pub use panel::{Panel, PanelCache, PixelRect, ViewTransform};
pub use session::{
    Command, DetectRequest, DetectionJob, DisplayedPage, NavigationState, OpenTicket, PageTicket,
    ReadingSession, RenderJob, RenderTicket, SessionEvent, SessionPhase, ViewMode, MAX_ZOOM,
    MIN_ZOOM, ZOOM_STEP,
};
pub use settings::{DetectorSettings, LibrarySettings, RenderSettings, Settings};

/// The three document formats a library item can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentKind {
    ComicArchive,
    Epub,
    Pdf,
}

impl DocumentKind {
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "cbz" | "zip" => Some(DocumentKind::ComicArchive),
            "epub" => Some(DocumentKind::Epub),
            "pdf" => Some(DocumentKind::Pdf),
            _ => None,
        }
    }

    pub fn backend(self) -> BackendKind {
        match self {
            DocumentKind::ComicArchive => BackendKind::PagedImages,
            DocumentKind::Pdf => BackendKind::FixedPages,
            DocumentKind::Epub => BackendKind::Flowable,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DocumentKind::ComicArchive => "comic-archive",
            DocumentKind::Epub => "epub",
            DocumentKind::Pdf => "pdf",
        };
        f.pad(label)
    }
}

/// How a backend paginates its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Pages are individually extracted raster images.
    PagedImages,
    /// The format declares a fixed, renderable page count.
    FixedPages,
    /// Reflowable content; pages are computed location chunks.
    Flowable,
}

impl BackendKind {
    pub fn supports_panels(self) -> bool {
        matches!(self, BackendKind::PagedImages)
    }

    pub fn supports_zoom(self) -> bool {
        !matches!(self, BackendKind::Flowable)
    }
}

/// Stable identity of a page, unique within one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey(String);

impl PageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_index(page_index: usize) -> Self {
        Self(format!("#{page_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw bytes of a document plus the format they were imported as.
#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub name: String,
    pub kind: DocumentKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    /// Rasterization scale, independent of the display scale.
    pub scale: f32,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: 1.0,
        }
    }
}

/// RGBA8 pixels, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A reflowed content view for one location of a flowable document.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflowView {
    pub location: usize,
    pub chapter: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Drawable {
    Raster(RenderImage),
    Reflow(ReflowView),
}

impl Drawable {
    pub fn as_raster(&self) -> Option<&RenderImage> {
        match self {
            Drawable::Raster(image) => Some(image),
            Drawable::Reflow(_) => None,
        }
    }
}

/// An encoded cover image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl Thumbnail {
    pub fn to_data_url(&self) -> String {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;

        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Forward,
    Backward,
}

/// An opened document. Owned by one reading session at a time.
pub trait DocumentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn page_count(&self) -> usize;

    fn page_key(&self, page_index: usize) -> PageKey {
        PageKey::from_index(page_index)
    }

    fn render(&self, request: RenderRequest) -> ReaderResult<Drawable>;

    /// Moves one page from `from`, returning the new location or `None` at a boundary.
    ///
    /// Flowable backends override this to drive their own reflow cursor.
    fn relocate(&self, from: usize, step: Step) -> Option<usize> {
        match step {
            Step::Forward => {
                let next = from + 1;
                (next < self.page_count()).then_some(next)
            }
            Step::Backward => from.checked_sub(1),
        }
    }

    /// Jumps directly to `page_index` (already clamped by the caller).
    fn seek(&self, page_index: usize) -> usize {
        page_index
    }

    fn thumbnail(&self, max_dimension: u32) -> ReaderResult<Option<Thumbnail>>;

    /// Releases backend resources. Safe to call more than once.
    fn close(&self);
}

#[async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, source: DocumentSource) -> ReaderResult<std::sync::Arc<dyn DocumentBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_file_name_is_case_insensitive() {
        assert_eq!(
            DocumentKind::from_file_name("Vol 01.CBZ"),
            Some(DocumentKind::ComicArchive)
        );
        assert_eq!(DocumentKind::from_file_name("a.epub"), Some(DocumentKind::Epub));
        assert_eq!(DocumentKind::from_file_name("b.Pdf"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_file_name("notes.txt"), None);
        assert_eq!(DocumentKind::from_file_name("no_extension"), None);
    }

    #[test]
    fn only_paged_images_support_panels() {
        assert!(BackendKind::PagedImages.supports_panels());
        assert!(!BackendKind::FixedPages.supports_panels());
        assert!(!BackendKind::Flowable.supports_panels());
        assert!(!BackendKind::Flowable.supports_zoom());
    }

    #[test]
    fn thumbnail_data_url_is_base64() {
        let thumb = Thumbnail {
            mime: "image/jpeg".into(),
            bytes: vec![1, 2, 3],
        };
        assert_eq!(thumb.to_data_url(), "data:image/jpeg;base64,AQID");
    }
}
