use thiserror::Error;

pub type ReaderResult<T> = std::result::Result<T, ReaderError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReaderError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("corrupt document: {0}")]
    CorruptDocument(String),
    #[error("failed to load document: {0}")]
    LoadFailure(String),
    #[error("panel detection rate limited: {0}")]
    RateLimited(String),
    #[error("panel detection failed: {0}")]
    DetectionFailed(String),
    #[error("failed to render page {page}: {reason}")]
    RenderFailure { page: usize, reason: String },
    #[error("library already contains {0}")]
    DuplicateItem(String),
    #[error("no library item with id {0}")]
    NotFound(String),
    #[error("library storage error: {0}")]
    Storage(String),
}

impl ReaderError {
    /// Text for the inline message area of the failure's domain.
    pub fn user_message(&self) -> String {
        match self {
            ReaderError::UnsupportedFormat(_) => {
                "This file type is not supported. Use a comic archive, EPUB or PDF.".into()
            }
            ReaderError::CorruptDocument(_) => {
                "The document could not be opened; it may be damaged.".into()
            }
            ReaderError::LoadFailure(_) => "The document failed to load.".into(),
            ReaderError::RateLimited(_) => {
                "Panel detection is rate limited right now. Wait a moment and try again.".into()
            }
            ReaderError::DetectionFailed(_) => "Panel detection failed.".into(),
            ReaderError::RenderFailure { page, .. } => {
                format!("Page {} could not be displayed.", page + 1)
            }
            ReaderError::DuplicateItem(_) => "This file is already in the library.".into(),
            ReaderError::NotFound(_) => "That library item does not exist.".into(),
            ReaderError::Storage(_) => "The library could not be saved.".into(),
        }
    }
}

impl From<std::io::Error> for ReaderError {
    fn from(err: std::io::Error) -> Self {
        ReaderError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_message_asks_to_retry_later() {
        let err = ReaderError::RateLimited("429".into());
        assert!(err.user_message().contains("try again"));
    }

    #[test]
    fn render_failure_message_is_one_based() {
        let err = ReaderError::RenderFailure {
            page: 4,
            reason: "boom".into(),
        };
        assert_eq!(err.user_message(), "Page 5 could not be displayed.");
    }
}
