use std::cmp::Ordering;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use leitor_core::{
    BackendKind, DocumentBackend, Drawable, PageKey, ReaderError, ReaderResult, RenderRequest,
    Thumbnail,
};
use parking_lot::Mutex;
use tracing::{debug, instrument};
use zip::ZipArchive;

use crate::{encode_thumbnail, to_render_image};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// A zip-based comic archive. Every image entry is one page.
#[derive(Debug)]
pub struct ComicArchiveDocument {
    entries: Vec<String>,
    archive: Mutex<Option<ZipArchive<Cursor<Vec<u8>>>>>,
}

impl ComicArchiveDocument {
    pub fn open(bytes: Vec<u8>) -> ReaderResult<Self> {
        let archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|err| ReaderError::CorruptDocument(format!("not a readable archive: {err}")))?;

        let mut entries: Vec<String> = archive
            .file_names()
            .filter(|name| is_page_entry(name))
            .map(str::to_owned)
            .collect();
        if entries.is_empty() {
            return Err(ReaderError::CorruptDocument(
                "archive contains no images".into(),
            ));
        }
        entries.sort_by(|a, b| natural_cmp(a, b));
        debug!(pages = entries.len(), "opened comic archive");

        Ok(Self {
            entries,
            archive: Mutex::new(Some(archive)),
        })
    }

    fn decode(&self, page_index: usize) -> Result<DynamicImage> {
        let name = self
            .entries
            .get(page_index)
            .ok_or_else(|| anyhow!("page {} out of range", page_index))?;
        let bytes = {
            let mut guard = self.archive.lock();
            let archive = guard.as_mut().ok_or_else(|| anyhow!("document is closed"))?;
            let mut file = archive
                .by_name(name)
                .with_context(|| format!("missing entry {name}"))?;
            let mut bytes = Vec::with_capacity(usize::try_from(file.size()).unwrap_or_default());
            file.read_to_end(&mut bytes)
                .with_context(|| format!("failed to extract {name}"))?;
            bytes
        };
        image::load_from_memory(&bytes).with_context(|| format!("failed to decode {name}"))
    }
}

impl DocumentBackend for ComicArchiveDocument {
    fn kind(&self) -> BackendKind {
        BackendKind::PagedImages
    }

    fn page_count(&self) -> usize {
        self.entries.len()
    }

    fn page_key(&self, page_index: usize) -> PageKey {
        match self.entries.get(page_index) {
            Some(name) => PageKey::new(name.as_str()),
            None => PageKey::from_index(page_index),
        }
    }

    #[instrument(skip(self))]
    fn render(&self, request: RenderRequest) -> ReaderResult<Drawable> {
        self.decode(request.page_index)
            .map(|image| Drawable::Raster(to_render_image(image)))
            .map_err(|err| ReaderError::RenderFailure {
                page: request.page_index,
                reason: format!("{err:#}"),
            })
    }

    fn thumbnail(&self, max_dimension: u32) -> ReaderResult<Option<Thumbnail>> {
        let image = self.decode(0).map_err(|err| ReaderError::RenderFailure {
            page: 0,
            reason: format!("{err:#}"),
        })?;
        encode_thumbnail(&image, max_dimension)
            .map(Some)
            .map_err(|err| ReaderError::RenderFailure {
                page: 0,
                reason: format!("{err:#}"),
            })
    }

    fn close(&self) {
        self.archive.lock().take();
    }
}

fn is_page_entry(name: &str) -> bool {
    if name.ends_with('/') || name.starts_with("__MACOSX/") {
        return false;
    }
    let path = Path::new(name);
    let hidden = path
        .file_name()
        .and_then(|file| file.to_str())
        .map_or(true, |file| file.starts_with('.'));
    if hidden {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Case-insensitive ordering that compares digit runs by numeric value.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let lnum = take_digits(&mut left);
                let rnum = take_digits(&mut right);
                let order = compare_digit_runs(&lnum, &rnum);
                if order != Ordering::Equal {
                    return order;
                }
            }
            (Some(l), Some(r)) => {
                let order = l.to_lowercase().cmp(r.to_lowercase());
                if order != Ordering::Equal {
                    return order;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(ch) = chars.next_if(|ch| ch.is_ascii_digit()) {
        run.push(ch);
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
