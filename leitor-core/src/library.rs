use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{DocumentKind, DocumentProvider, DocumentSource, ReaderError, ReaderResult};

const LIBRARY_NAMESPACE: Uuid = Uuid::from_u128(0x3f0c2b9e_5d1a_5c7e_9a44_8e2f6b1d7c30);

/// Library id for a file. Depends only on the name and byte size, so two
/// different files sharing both are treated as the same item.
pub fn library_id(file_name: &str, size: u64) -> String {
    let key = format!("{file_name}:{size}");
    Uuid::new_v5(&LIBRARY_NAMESPACE, key.as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub id: String,
    pub title: String,
    /// `data:` URL, empty when the document has no cover.
    pub cover_thumbnail: String,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    pub page_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LibraryRecord {
    pub item: LibraryItem,
    pub file_bytes: Vec<u8>,
}

impl LibraryRecord {
    pub fn source(&self) -> DocumentSource {
        DocumentSource {
            name: self.item.title.clone(),
            kind: self.item.kind,
            bytes: self.file_bytes.clone(),
        }
    }
}

/// Persistent table of library records keyed by id.
pub trait LibraryStore: Send + Sync {
    fn list(&self) -> ReaderResult<Vec<LibraryItem>>;
    fn contains(&self, id: &str) -> ReaderResult<bool>;
    fn get(&self, id: &str) -> ReaderResult<Option<LibraryRecord>>;
    /// Fails with `DuplicateItem` if the id is already stored.
    fn insert(&self, record: LibraryRecord) -> ReaderResult<()>;
    /// Returns whether a record was removed.
    fn delete(&self, id: &str) -> ReaderResult<bool>;
    /// Fails with `NotFound` if the id is not stored.
    fn update_title(&self, id: &str, title: &str) -> ReaderResult<()>;
}

/// One `<id>.json` metadata file plus one `<id>.bin` payload per record.
pub struct FileLibraryStore {
    root: PathBuf,
}

impl FileLibraryStore {
    pub fn new(root: PathBuf) -> ReaderResult<Self> {
        fs::create_dir_all(&root).map_err(|err| {
            ReaderError::Storage(format!("failed to create library at {root:?}: {err}"))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, id: &str) -> ReaderResult<(PathBuf, PathBuf)> {
        if Uuid::parse_str(id).is_err() {
            return Err(ReaderError::NotFound(id.to_owned()));
        }
        Ok((
            self.root.join(format!("{id}.json")),
            self.root.join(format!("{id}.bin")),
        ))
    }

    fn read_item(path: &Path) -> ReaderResult<LibraryItem> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| ReaderError::Storage(format!("failed to decode {path:?}: {err}")))
    }

    fn write_atomic(path: &Path, payload: &[u8]) -> ReaderResult<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = File::create(&tmp)?;
        file.write_all(payload)?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn write_item(path: &Path, item: &LibraryItem) -> ReaderResult<()> {
        let payload = serde_json::to_vec_pretty(item)
            .map_err(|err| ReaderError::Storage(err.to_string()))?;
        Self::write_atomic(path, &payload)
    }
}

impl LibraryStore for FileLibraryStore {
    fn list(&self) -> ReaderResult<Vec<LibraryItem>> {
        let mut items = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_item(&path) {
                Ok(item) => items.push(item),
                Err(err) => warn!(%err, path = %path.display(), "skipping unreadable record"),
            }
        }
        items.sort_by_key(|item| item.title.to_lowercase());
        Ok(items)
    }

    fn contains(&self, id: &str) -> ReaderResult<bool> {
        match self.paths(id) {
            Ok((meta, _)) => Ok(meta.exists()),
            Err(ReaderError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn get(&self, id: &str) -> ReaderResult<Option<LibraryRecord>> {
        let (meta, blob) = match self.paths(id) {
            Ok(paths) => paths,
            Err(ReaderError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !meta.exists() {
            return Ok(None);
        }
        let item = Self::read_item(&meta)?;
        let file_bytes = fs::read(&blob)?;
        Ok(Some(LibraryRecord { item, file_bytes }))
    }

    fn insert(&self, record: LibraryRecord) -> ReaderResult<()> {
        let (meta, blob) = self.paths(&record.item.id)?;
        if meta.exists() {
            return Err(ReaderError::DuplicateItem(record.item.id));
        }
        // The metadata file is written last; its presence marks a complete record.
        Self::write_atomic(&blob, &record.file_bytes)?;
        Self::write_item(&meta, &record.item)
    }

    fn delete(&self, id: &str) -> ReaderResult<bool> {
        let (meta, blob) = match self.paths(id) {
            Ok(paths) => paths,
            Err(ReaderError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        if !meta.exists() {
            return Ok(false);
        }
        fs::remove_file(&meta)?;
        if blob.exists() {
            fs::remove_file(&blob)?;
        }
        Ok(true)
    }

    fn update_title(&self, id: &str, title: &str) -> ReaderResult<()> {
        let (meta, _) = self.paths(id)?;
        if !meta.exists() {
            return Err(ReaderError::NotFound(id.to_owned()));
        }
        let mut item = Self::read_item(&meta)?;
        item.title = title.to_owned();
        Self::write_item(&meta, &item)
    }
}

#[derive(Default)]
pub struct MemoryLibraryStore {
    inner: Mutex<BTreeMap<String, LibraryRecord>>,
}

impl MemoryLibraryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LibraryStore for MemoryLibraryStore {
    fn list(&self) -> ReaderResult<Vec<LibraryItem>> {
        let mut items: Vec<_> = self
            .inner
            .lock()
            .values()
            .map(|record| record.item.clone())
            .collect();
        items.sort_by_key(|item| item.title.to_lowercase());
        Ok(items)
    }

    fn contains(&self, id: &str) -> ReaderResult<bool> {
        Ok(self.inner.lock().contains_key(id))
    }

    fn get(&self, id: &str) -> ReaderResult<Option<LibraryRecord>> {
        Ok(self.inner.lock().get(id).cloned())
    }

    fn insert(&self, record: LibraryRecord) -> ReaderResult<()> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&record.item.id) {
            return Err(ReaderError::DuplicateItem(record.item.id));
        }
        inner.insert(record.item.id.clone(), record);
        Ok(())
    }

    fn delete(&self, id: &str) -> ReaderResult<bool> {
        Ok(self.inner.lock().remove(id).is_some())
    }

    fn update_title(&self, id: &str, title: &str) -> ReaderResult<()> {
        match self.inner.lock().get_mut(id) {
            Some(record) => {
                record.item.title = title.to_owned();
                Ok(())
            }
            None => Err(ReaderError::NotFound(id.to_owned())),
        }
    }
}

/// Import and lookup on top of an injected store.
pub struct Library {
    store: Arc<dyn LibraryStore>,
    thumbnail_size: u32,
}

impl Library {
    pub fn new(store: Arc<dyn LibraryStore>, thumbnail_size: u32) -> Self {
        Self {
            store,
            thumbnail_size: thumbnail_size.max(1),
        }
    }

    pub fn items(&self) -> ReaderResult<Vec<LibraryItem>> {
        self.store.list()
    }

    pub fn source(&self, id: &str) -> ReaderResult<DocumentSource> {
        self.store
            .get(id)?
            .map(|record| record.source())
            .ok_or_else(|| ReaderError::NotFound(id.to_owned()))
    }

    pub fn remove(&self, id: &str) -> ReaderResult<bool> {
        self.store.delete(id)
    }

    pub fn rename(&self, id: &str, title: &str) -> ReaderResult<()> {
        self.store.update_title(id, title)
    }

    #[instrument(skip(self, provider, bytes), fields(size = bytes.len()))]
    pub async fn import<P>(
        &self,
        provider: &P,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> ReaderResult<LibraryItem>
    where
        P: DocumentProvider + ?Sized,
    {
        let kind = DocumentKind::from_file_name(file_name)
            .ok_or_else(|| ReaderError::UnsupportedFormat(file_name.to_owned()))?;
        let id = library_id(file_name, bytes.len() as u64);
        if self.store.contains(&id)? {
            return Err(ReaderError::DuplicateItem(file_name.to_owned()));
        }

        let backend = provider
            .open(DocumentSource {
                name: file_name.to_owned(),
                kind,
                bytes: bytes.clone(),
            })
            .await?;
        let page_count = backend.page_count();
        let cover_thumbnail = match backend.thumbnail(self.thumbnail_size) {
            Ok(Some(thumb)) => thumb.to_data_url(),
            Ok(None) => String::new(),
            Err(err) => {
                warn!(%err, file_name, "failed to build cover thumbnail");
                String::new()
            }
        };
        backend.close();

        let title = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(file_name)
            .to_owned();
        let item = LibraryItem {
            id,
            title,
            cover_thumbnail,
            kind,
            page_count,
        };
        self.store.insert(LibraryRecord {
            item: item.clone(),
            file_bytes: bytes,
        })?;
        info!(id = %item.id, title = %item.title, page_count, "imported into library");
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::{
        BackendKind, DocumentBackend, Drawable, RenderImage, RenderRequest, Thumbnail,
    };

    fn record(name: &str, bytes: &[u8]) -> LibraryRecord {
        LibraryRecord {
            item: LibraryItem {
                id: library_id(name, bytes.len() as u64),
                title: name.to_owned(),
                cover_thumbnail: String::new(),
                kind: DocumentKind::ComicArchive,
                page_count: 3,
            },
            file_bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn library_id_depends_on_name_and_size_only() {
        assert_eq!(library_id("a.cbz", 10), library_id("a.cbz", 10));
        assert_ne!(library_id("a.cbz", 10), library_id("a.cbz", 11));
        assert_ne!(library_id("a.cbz", 10), library_id("b.cbz", 10));
        assert!(Uuid::parse_str(&library_id("a.cbz", 10)).is_ok());
    }

    #[test]
    fn file_store_round_trips_records() {
        let dir = tempdir().unwrap();
        let store = FileLibraryStore::new(dir.path().join("library")).unwrap();
        let first = record("beta", b"one");
        let second = record("Alpha", b"two!");

        store.insert(first.clone()).unwrap();
        store.insert(second.clone()).unwrap();

        let titles: Vec<_> = store.list().unwrap().into_iter().map(|i| i.title).collect();
        assert_eq!(titles, vec!["Alpha", "beta"]);
        assert_eq!(store.get(&first.item.id).unwrap(), Some(first.clone()));

        let reopened = FileLibraryStore::new(dir.path().join("library")).unwrap();
        assert_eq!(reopened.get(&second.item.id).unwrap(), Some(second));
    }

    #[test]
    fn file_store_rejects_duplicates_and_unknown_ids() {
        let dir = tempdir().unwrap();
        let store = FileLibraryStore::new(dir.path().to_path_buf()).unwrap();
        let rec = record("comic.cbz", b"xyz");
        store.insert(rec.clone()).unwrap();

        assert!(matches!(
            store.insert(rec.clone()),
            Err(ReaderError::DuplicateItem(_))
        ));
        let missing = library_id("missing.cbz", 1);
        assert!(matches!(
            store.update_title(&missing, "x"),
            Err(ReaderError::NotFound(_))
        ));
        assert!(matches!(
            store.update_title("../escape", "x"),
            Err(ReaderError::NotFound(_))
        ));
        assert!(store.get("../escape").unwrap().is_none());
    }

    #[test]
    fn file_store_updates_titles_and_deletes() {
        let dir = tempdir().unwrap();
        let store = FileLibraryStore::new(dir.path().to_path_buf()).unwrap();
        let rec = record("comic.cbz", b"xyz");
        let id = rec.item.id.clone();
        store.insert(rec).unwrap();

        store.update_title(&id, "Renamed").unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().item.title, "Renamed");

        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
        assert!(store.list().unwrap().is_empty());
        assert!(!store.contains(&id).unwrap());
    }

    struct OnePageBackend;

    impl DocumentBackend for OnePageBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::PagedImages
        }

        fn page_count(&self) -> usize {
            7
        }

        fn render(&self, _request: RenderRequest) -> ReaderResult<Drawable> {
            Ok(Drawable::Raster(RenderImage {
                width: 1,
                height: 1,
                pixels: vec![0; 4],
            }))
        }

        fn thumbnail(&self, _max_dimension: u32) -> ReaderResult<Option<Thumbnail>> {
            Ok(Some(Thumbnail {
                mime: "image/jpeg".into(),
                bytes: vec![0xff, 0xd8],
            }))
        }

        fn close(&self) {}
    }

    struct OnePageProvider;

    #[async_trait]
    impl DocumentProvider for OnePageProvider {
        async fn open(&self, _source: DocumentSource) -> ReaderResult<Arc<dyn DocumentBackend>> {
            Ok(Arc::new(OnePageBackend))
        }
    }

    #[tokio::test]
    async fn import_builds_record_and_rejects_duplicates() {
        let store = Arc::new(MemoryLibraryStore::new());
        let library = Library::new(store.clone(), 300);

        let item = library
            .import(&OnePageProvider, "My Comic 01.cbz", b"abc".to_vec())
            .await
            .unwrap();
        assert_eq!(item.title, "My Comic 01");
        assert_eq!(item.page_count, 7);
        assert_eq!(item.kind, DocumentKind::ComicArchive);
        assert_eq!(item.id, library_id("My Comic 01.cbz", 3));
        assert_eq!(item.cover_thumbnail, "data:image/jpeg;base64,/9g=");

        let again = library
            .import(&OnePageProvider, "My Comic 01.cbz", b"xyz".to_vec())
            .await;
        assert!(matches!(again, Err(ReaderError::DuplicateItem(_))));

        let source = library.source(&item.id).unwrap();
        assert_eq!(source.bytes, b"abc");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn import_rejects_unknown_extensions() {
        let library = Library::new(Arc::new(MemoryLibraryStore::new()), 300);
        let err = library
            .import(&OnePageProvider, "notes.txt", b"abc".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::UnsupportedFormat(_)));
        assert!(library.items().unwrap().is_empty());
    }
}
