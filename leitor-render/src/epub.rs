use std::io::Cursor;
use std::rc::Rc;

use epub::doc::EpubDoc;
use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use leitor_core::{
    BackendKind, DocumentBackend, Drawable, ReaderError, ReaderResult, ReflowView, RenderRequest,
    Step, Thumbnail,
};
use markup5ever_rcdom::{NodeData, RcDom};
use parking_lot::Mutex;
use roxmltree::{Document, Node, ParsingOptions};
use tracing::{debug, warn};

use crate::encode_thumbnail;

/// Upper bound on the characters in one reading location.
pub const LOCATION_CHARS: usize = 1024;

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "blockquote", "li", "tr", "br", "hr", "h1", "h2", "h3", "h4",
    "h5", "h6", "pre", "figure", "figcaption", "dt", "dd",
];
const SKIPPED_ELEMENTS: &[&str] = &["head", "script", "style", "title"];

#[derive(Debug)]
struct Location {
    chapter: usize,
    start: usize,
    end: usize,
}

#[derive(Debug)]
struct Book {
    chapters: Vec<String>,
    locations: Vec<Location>,
    cover: Option<Vec<u8>>,
}

/// A reflowable book paginated into fixed-size text locations.
#[derive(Debug)]
pub struct EpubDocument {
    page_count: usize,
    book: Mutex<Option<Book>>,
    cursor: Mutex<usize>,
}

impl EpubDocument {
    pub fn open(bytes: Vec<u8>) -> ReaderResult<Self> {
        let mut doc = EpubDoc::from_reader(Cursor::new(bytes))
            .map_err(|err| ReaderError::CorruptDocument(format!("unreadable epub: {err}")))?;

        let mut chapters = Vec::new();
        for index in 0..doc.get_num_chapters() {
            if !doc.set_current_chapter(index) {
                warn!(index, "skipping unreachable spine entry");
                continue;
            }
            match doc.get_current_str() {
                Some((content, _mime)) => chapters.push(xhtml_to_text(&content)),
                None => warn!(index, "spine entry has no text content"),
            }
        }
        let cover = doc.get_cover().map(|(bytes, _mime)| bytes);

        let locations: Vec<Location> = chapters
            .iter()
            .enumerate()
            .flat_map(|(chapter, text)| {
                location_ranges(text, LOCATION_CHARS)
                    .into_iter()
                    .map(move |(start, end)| Location {
                        chapter,
                        start,
                        end,
                    })
            })
            .collect();
        if locations.is_empty() {
            return Err(ReaderError::CorruptDocument(
                "book contains no readable text".into(),
            ));
        }
        debug!(
            chapters = chapters.len(),
            locations = locations.len(),
            "opened epub"
        );

        Ok(Self {
            page_count: locations.len(),
            book: Mutex::new(Some(Book {
                chapters,
                locations,
                cover,
            })),
            cursor: Mutex::new(0),
        })
    }

    /// Location the reflow cursor currently points at.
    pub fn cursor(&self) -> usize {
        *self.cursor.lock()
    }
}

impl DocumentBackend for EpubDocument {
    fn kind(&self) -> BackendKind {
        BackendKind::Flowable
    }

    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render(&self, request: RenderRequest) -> ReaderResult<Drawable> {
        let guard = self.book.lock();
        let failure = |reason: &str| ReaderError::RenderFailure {
            page: request.page_index,
            reason: reason.to_owned(),
        };
        let book = guard.as_ref().ok_or_else(|| failure("document is closed"))?;
        let location = book
            .locations
            .get(request.page_index)
            .ok_or_else(|| failure("location out of range"))?;
        let text = book.chapters[location.chapter][location.start..location.end]
            .trim()
            .to_owned();
        *self.cursor.lock() = request.page_index;

        Ok(Drawable::Reflow(ReflowView {
            location: request.page_index,
            chapter: location.chapter,
            text,
        }))
    }

    fn relocate(&self, from: usize, step: Step) -> Option<usize> {
        let next = match step {
            Step::Forward => Some(from + 1).filter(|next| *next < self.page_count),
            Step::Backward => from.checked_sub(1),
        }?;
        *self.cursor.lock() = next;
        Some(next)
    }

    fn seek(&self, page_index: usize) -> usize {
        let target = page_index.min(self.page_count.saturating_sub(1));
        *self.cursor.lock() = target;
        target
    }

    fn thumbnail(&self, max_dimension: u32) -> ReaderResult<Option<Thumbnail>> {
        let guard = self.book.lock();
        let Some(cover) = guard.as_ref().and_then(|book| book.cover.as_ref()) else {
            return Ok(None);
        };
        let image = match image::load_from_memory(cover) {
            Ok(image) => image,
            Err(err) => {
                warn!("cover image is unreadable: {err}");
                return Ok(None);
            }
        };
        encode_thumbnail(&image, max_dimension)
            .map(Some)
            .map_err(|err| ReaderError::RenderFailure {
                page: 0,
                reason: format!("{err:#}"),
            })
    }

    fn close(&self) {
        self.book.lock().take();
    }
}

/// Splits `text` into byte ranges of at most `max_chars` characters.
///
/// A range that would cut a word breaks after the last whitespace in its second half instead.
pub fn location_ranges(text: &str, max_chars: usize) -> Vec<(usize, usize)> {
    let max_chars = max_chars.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let rest = &text[start..];
        let mut end = rest.len();
        let mut last_break = None;
        for (count, (offset, ch)) in rest.char_indices().enumerate() {
            if count == max_chars {
                end = offset;
                break;
            }
            if ch.is_whitespace() && count >= max_chars / 2 {
                last_break = Some(offset + ch.len_utf8());
            }
        }
        if end < rest.len() {
            if let Some(at) = last_break {
                end = at;
            }
        }
        if !rest[..end].trim().is_empty() {
            ranges.push((start, start + end));
        }
        start += end;
    }
    ranges
}

/// Extracts readable text from an XHTML chapter, one paragraph per line group.
pub fn xhtml_to_text(content: &str) -> String {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let raw = match Document::parse_with_options(content, options) {
        Ok(document) => {
            let mut out = String::new();
            collect_text(document.root(), &mut out);
            out
        }
        Err(err) => {
            debug!("chapter is not well-formed XML, parsing as HTML: {err}");
            html_to_text(content)
        }
    };
    normalize_whitespace(&raw)
}

fn collect_text(node: Node<'_, '_>, out: &mut String) {
    if node.is_text() {
        if let Some(text) = node.text() {
            out.push_str(text);
        }
        return;
    }
    let name = node.tag_name().name();
    if node.is_element() && SKIPPED_ELEMENTS.contains(&name) {
        return;
    }
    for child in node.children() {
        collect_text(child, out);
    }
    if node.is_element() && BLOCK_ELEMENTS.contains(&name) {
        out.push_str("\n\n");
    }
}

/// Lenient HTML parse for chapters that are not well-formed XML.
fn html_to_text(content: &str) -> String {
    let dom = match parse_document(RcDom::default(), Default::default())
        .from_utf8()
        .read_from(&mut content.as_bytes())
    {
        Ok(dom) => dom,
        Err(err) => {
            warn!("unable to parse chapter markup: {err}");
            return String::new();
        }
    };
    let mut out = String::new();
    collect_html_text(&dom.document, &mut out);
    out
}

fn collect_html_text(node: &Rc<markup5ever_rcdom::Node>, out: &mut String) {
    let name = match &node.data {
        NodeData::Text { contents } => {
            out.push_str(&contents.borrow());
            return;
        }
        NodeData::Element { name, .. } => Some(name.local.as_ref()),
        _ => None,
    };
    if name.is_some_and(|name| SKIPPED_ELEMENTS.contains(&name)) {
        return;
    }
    for child in node.children.borrow().iter() {
        collect_html_text(child, out);
    }
    if name.is_some_and(|name| BLOCK_ELEMENTS.contains(&name)) {
        out.push_str("\n\n");
    }
}

fn normalize_whitespace(raw: &str) -> String {
    let paragraphs: Vec<String> = raw
        .split("\n\n")
        .map(|paragraph| paragraph.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|paragraph| !paragraph.is_empty())
        .collect();
    paragraphs.join("\n\n")
}
