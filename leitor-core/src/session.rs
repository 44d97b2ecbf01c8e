use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    BackendKind, DocumentBackend, DocumentProvider, DocumentSource, Drawable, PageKey, Panel,
    PanelCache, PanelDetector, ReaderError, ReaderResult, RenderImage, RenderRequest, Step,
    ViewTransform,
};

pub const ZOOM_STEP: f32 = 0.25;
pub const MIN_ZOOM: f32 = 0.25;
pub const MAX_ZOOM: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Page,
    /// Index into the current page's panel list.
    Panel(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavigationState {
    pub page_index: usize,
    pub view: ViewMode,
    pub zoom_factor: f32,
    /// When set, `zoom_factor` is ignored and the page is fitted to the viewport.
    pub fit_to_container: bool,
}

impl Default for NavigationState {
    fn default() -> Self {
        Self {
            page_index: 0,
            view: ViewMode::Page,
            zoom_factor: 1.0,
            fit_to_container: true,
        }
    }
}

impl NavigationState {
    pub fn panel_index(&self) -> Option<usize> {
        match self.view {
            ViewMode::Page => None,
            ViewMode::Panel(index) => Some(index),
        }
    }

    fn go_to_page(&mut self, page_index: usize) {
        self.page_index = page_index;
        self.view = ViewMode::Page;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Closed,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NextPage,
    PrevPage,
    GotoPage { page: usize },
    ZoomIn,
    ZoomOut,
    ToggleFit,
    ExitPanels,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DocumentOpened { title: String, page_count: usize },
    LoadFailed(ReaderError),
    DocumentClosed,
    RedrawNeeded,
    DetectionFailed(ReaderError),
    RenderFailed(ReaderError),
}

/// Captured identity of the page an asynchronous job was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTicket {
    generation: u64,
    page_index: usize,
    page_key: PageKey,
}

impl PageTicket {
    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn page_key(&self) -> &PageKey {
        &self.page_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTicket {
    generation: u64,
    page_index: usize,
    seq: u64,
}

impl RenderTicket {
    pub fn page_index(&self) -> usize {
        self.page_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTicket {
    generation: u64,
}

/// A page render that can run off the session's thread.
pub struct RenderJob {
    ticket: RenderTicket,
    backend: Arc<dyn DocumentBackend>,
    request: RenderRequest,
}

impl RenderJob {
    pub fn ticket(&self) -> RenderTicket {
        self.ticket
    }

    pub fn run(&self) -> ReaderResult<Drawable> {
        self.backend.render(self.request)
    }
}

/// A panel detection started for one page.
pub struct DetectionJob {
    ticket: PageTicket,
    backend: Arc<dyn DocumentBackend>,
}

impl DetectionJob {
    pub fn ticket(&self) -> &PageTicket {
        &self.ticket
    }

    /// Full-resolution raster of the page being detected.
    pub fn page_image(&self) -> ReaderResult<RenderImage> {
        let request = RenderRequest {
            page_index: self.ticket.page_index,
            scale: 1.0,
        };
        match self.backend.render(request)? {
            Drawable::Raster(image) => Ok(image),
            Drawable::Reflow(_) => Err(ReaderError::DetectionFailed(
                "page has no raster to analyse".into(),
            )),
        }
    }

    pub async fn run(self, detector: &dyn PanelDetector) -> (PageTicket, ReaderResult<Vec<Panel>>) {
        let result = match self.page_image() {
            Ok(image) => detector.detect(&image).await,
            Err(err) => Err(err),
        };
        (self.ticket, result)
    }
}

#[derive(Debug)]
pub enum DetectRequest {
    /// Panels were cached; the session is already in panel view.
    Cached,
    /// A detection must be run and handed back to `complete_detection`.
    Pending(DetectionJob),
    AlreadyPending,
    Unsupported,
}

impl std::fmt::Debug for DetectionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionJob")
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct DisplayedPage {
    pub page_index: usize,
    pub drawable: Drawable,
}

struct OpenDocument {
    title: String,
    kind: BackendKind,
    backend: Arc<dyn DocumentBackend>,
    page_count: usize,
    nav: NavigationState,
    detecting: HashSet<PageKey>,
    render_seq: u64,
    displayed: Option<DisplayedPage>,
    detection_error: Option<ReaderError>,
    render_error: Option<ReaderError>,
}

impl OpenDocument {
    fn current_key(&self) -> PageKey {
        self.backend.page_key(self.nav.page_index)
    }

    fn move_to(&mut self, page_index: usize) {
        self.nav.go_to_page(page_index);
        self.detection_error = None;
        self.render_error = None;
    }
}

enum Phase {
    Closed,
    Loading { title: String },
    Ready(Box<OpenDocument>),
    Failed(ReaderError),
}

/// Owns navigation state for one document at a time and mediates between
/// the document backend, the panel cache and panel detection.
///
/// Asynchronous work (open, render, detection) is handed out as jobs carrying
/// a ticket; results are only applied while the ticket still matches the
/// current document and page.
pub struct ReadingSession {
    phase: Phase,
    generation: u64,
    cache: PanelCache,
    render_scale: f32,
    events: Mutex<Vec<SessionEvent>>,
}

impl Default for ReadingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingSession {
    pub fn new() -> Self {
        Self {
            phase: Phase::Closed,
            generation: 0,
            cache: PanelCache::new(),
            render_scale: 1.0,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Rasterization scale for fixed-page documents.
    pub fn with_render_scale(mut self, scale: f32) -> Self {
        self.render_scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };
        self
    }

    pub fn take_events(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn emit(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }

    pub fn phase(&self) -> SessionPhase {
        match self.phase {
            Phase::Closed => SessionPhase::Closed,
            Phase::Loading { .. } => SessionPhase::Loading,
            Phase::Ready(_) => SessionPhase::Ready,
            Phase::Failed(_) => SessionPhase::Error,
        }
    }

    fn ready(&self) -> Option<&OpenDocument> {
        match &self.phase {
            Phase::Ready(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match &self.phase {
            Phase::Loading { title } => Some(title),
            Phase::Ready(doc) => Some(&doc.title),
            _ => None,
        }
    }

    pub fn navigation(&self) -> Option<&NavigationState> {
        self.ready().map(|doc| &doc.nav)
    }

    pub fn page_count(&self) -> Option<usize> {
        self.ready().map(|doc| doc.page_count)
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.ready().map(|doc| doc.kind)
    }

    pub fn cache(&self) -> &PanelCache {
        &self.cache
    }

    pub fn load_error(&self) -> Option<&ReaderError> {
        match &self.phase {
            Phase::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn detection_error(&self) -> Option<&ReaderError> {
        self.ready().and_then(|doc| doc.detection_error.as_ref())
    }

    pub fn render_error(&self) -> Option<&ReaderError> {
        self.ready().and_then(|doc| doc.render_error.as_ref())
    }

    pub fn displayed(&self) -> Option<&DisplayedPage> {
        self.ready().and_then(|doc| doc.displayed.as_ref())
    }

    pub fn is_detecting(&self) -> bool {
        self.ready()
            .map(|doc| doc.detecting.contains(&doc.current_key()))
            .unwrap_or(false)
    }

    pub fn current_panels(&self) -> Option<&[Panel]> {
        let doc = self.ready()?;
        self.cache.get(&doc.current_key())
    }

    pub fn current_panel(&self) -> Option<Panel> {
        let index = self.navigation()?.panel_index()?;
        self.current_panels()?.get(index).copied()
    }

    /// Transform the view applies to the full page image.
    pub fn view_transform(&self) -> ViewTransform {
        self.current_panel()
            .map(|panel| panel.transform())
            .unwrap_or(ViewTransform::IDENTITY)
    }

    /// Starts loading a new document, invalidating everything tied to the
    /// previous one.
    pub fn begin_open(&mut self, title: &str) -> OpenTicket {
        self.release_document();
        self.generation += 1;
        self.cache.clear();
        self.phase = Phase::Loading {
            title: title.to_owned(),
        };
        OpenTicket {
            generation: self.generation,
        }
    }

    pub fn finish_open(
        &mut self,
        ticket: OpenTicket,
        result: ReaderResult<Arc<dyn DocumentBackend>>,
    ) -> ReaderResult<()> {
        if ticket.generation != self.generation || !matches!(self.phase, Phase::Loading { .. }) {
            debug!("discarding superseded document open");
            if let Ok(backend) = result {
                backend.close();
            }
            return Ok(());
        }

        let title = match &self.phase {
            Phase::Loading { title } => title.clone(),
            _ => String::new(),
        };

        let backend = match result {
            Ok(backend) => backend,
            Err(err) => return Err(self.fail_open(err)),
        };

        let page_count = backend.page_count();
        if page_count == 0 {
            backend.close();
            return Err(self.fail_open(ReaderError::CorruptDocument(
                "document has no pages".into(),
            )));
        }

        info!(%title, page_count, kind = ?backend.kind(), "document ready");
        self.phase = Phase::Ready(Box::new(OpenDocument {
            title: title.clone(),
            kind: backend.kind(),
            backend,
            page_count,
            nav: NavigationState::default(),
            detecting: HashSet::new(),
            render_seq: 0,
            displayed: None,
            detection_error: None,
            render_error: None,
        }));
        self.emit(SessionEvent::DocumentOpened { title, page_count });
        self.emit(SessionEvent::RedrawNeeded);
        Ok(())
    }

    fn fail_open(&mut self, err: ReaderError) -> ReaderError {
        warn!(%err, "failed to open document");
        self.phase = Phase::Failed(err.clone());
        self.emit(SessionEvent::LoadFailed(err.clone()));
        err
    }

    #[instrument(skip(self, provider, source), fields(name = %source.name, kind = %source.kind))]
    pub async fn open_with<P>(&mut self, provider: &P, source: DocumentSource) -> ReaderResult<()>
    where
        P: DocumentProvider + ?Sized,
    {
        let ticket = self.begin_open(&source.name);
        let result = provider.open(source).await;
        self.finish_open(ticket, result)
    }

    /// Ends the session. In-flight jobs become no-ops when they complete.
    pub fn close(&mut self) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }
        self.release_document();
        self.generation += 1;
        self.phase = Phase::Closed;
        self.emit(SessionEvent::DocumentClosed);
    }

    fn release_document(&mut self) {
        if let Phase::Ready(doc) = &self.phase {
            debug!(title = %doc.title, "closing document backend");
            doc.backend.close();
        }
    }

    pub fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::NextPage => self.next_page(),
            Command::PrevPage => self.prev_page(),
            Command::GotoPage { page } => self.goto_page(page),
            Command::ZoomIn => self.zoom(Step::Forward),
            Command::ZoomOut => self.zoom(Step::Backward),
            Command::ToggleFit => self.toggle_fit(),
            Command::ExitPanels => self.exit_panels(),
        }
    }

    pub fn next_page(&mut self) -> bool {
        self.step(Step::Forward)
    }

    pub fn prev_page(&mut self) -> bool {
        self.step(Step::Backward)
    }

    fn step(&mut self, step: Step) -> bool {
        let Phase::Ready(doc) = &mut self.phase else {
            return false;
        };

        if let ViewMode::Panel(index) = doc.nav.view {
            let len = self
                .cache
                .get(&doc.backend.page_key(doc.nav.page_index))
                .map_or(0, |panels| panels.len());
            let next = match step {
                Step::Forward if index + 1 < len => Some(index + 1),
                Step::Backward if index > 0 => Some(index - 1),
                _ => None,
            };
            if let Some(next) = next {
                doc.nav.view = ViewMode::Panel(next);
                self.events.lock().push(SessionEvent::RedrawNeeded);
                return true;
            }
        }

        let Some(target) = doc.backend.relocate(doc.nav.page_index, step) else {
            return false;
        };
        let target = target.min(doc.page_count - 1);
        if target == doc.nav.page_index && doc.nav.view == ViewMode::Page {
            return false;
        }
        doc.move_to(target);
        self.events.lock().push(SessionEvent::RedrawNeeded);
        true
    }

    pub fn goto_page(&mut self, page: usize) -> bool {
        let Phase::Ready(doc) = &mut self.phase else {
            return false;
        };
        let target = page.min(doc.page_count - 1);
        if target == doc.nav.page_index {
            return false;
        }
        let location = doc.backend.seek(target).min(doc.page_count - 1);
        doc.move_to(location);
        self.events.lock().push(SessionEvent::RedrawNeeded);
        true
    }

    pub fn zoom(&mut self, step: Step) -> bool {
        let Phase::Ready(doc) = &mut self.phase else {
            return false;
        };
        if !doc.kind.supports_zoom() {
            return false;
        }
        let delta = match step {
            Step::Forward => ZOOM_STEP,
            Step::Backward => -ZOOM_STEP,
        };
        let zoom = (doc.nav.zoom_factor + delta).clamp(MIN_ZOOM, MAX_ZOOM);
        if zoom == doc.nav.zoom_factor && !doc.nav.fit_to_container {
            return false;
        }
        doc.nav.zoom_factor = zoom;
        doc.nav.fit_to_container = false;
        self.events.lock().push(SessionEvent::RedrawNeeded);
        true
    }

    pub fn toggle_fit(&mut self) -> bool {
        let Phase::Ready(doc) = &mut self.phase else {
            return false;
        };
        if !doc.kind.supports_zoom() {
            return false;
        }
        doc.nav.fit_to_container = !doc.nav.fit_to_container;
        if !doc.nav.fit_to_container {
            doc.nav.zoom_factor = 1.0;
        }
        self.events.lock().push(SessionEvent::RedrawNeeded);
        true
    }

    pub fn exit_panels(&mut self) -> bool {
        let Phase::Ready(doc) = &mut self.phase else {
            return false;
        };
        if doc.nav.view == ViewMode::Page {
            return false;
        }
        doc.nav.view = ViewMode::Page;
        self.events.lock().push(SessionEvent::RedrawNeeded);
        true
    }

    /// Enters panel view for the current page, detecting panels first if the
    /// cache has none.
    pub fn detect_panels(&mut self) -> DetectRequest {
        let Phase::Ready(doc) = &mut self.phase else {
            return DetectRequest::Unsupported;
        };
        if !doc.kind.supports_panels() {
            return DetectRequest::Unsupported;
        }

        let key = doc.current_key();
        if self.cache.get(&key).is_some() {
            doc.nav.view = ViewMode::Panel(0);
            doc.detection_error = None;
            self.events.lock().push(SessionEvent::RedrawNeeded);
            return DetectRequest::Cached;
        }
        if doc.detecting.contains(&key) {
            return DetectRequest::AlreadyPending;
        }

        debug!(page = doc.nav.page_index, key = %key, "starting panel detection");
        doc.detecting.insert(key.clone());
        doc.detection_error = None;
        DetectRequest::Pending(DetectionJob {
            ticket: PageTicket {
                generation: self.generation,
                page_index: doc.nav.page_index,
                page_key: key,
            },
            backend: Arc::clone(&doc.backend),
        })
    }

    /// Applies a detection result. Returns `true` when the view switched to
    /// panel mode.
    pub fn complete_detection(
        &mut self,
        ticket: PageTicket,
        result: ReaderResult<Vec<Panel>>,
    ) -> bool {
        if ticket.generation != self.generation {
            debug!(page = ticket.page_index, "discarding detection for a closed document");
            return false;
        }
        let Phase::Ready(doc) = &mut self.phase else {
            return false;
        };
        doc.detecting.remove(&ticket.page_key);
        let on_current_page = doc.nav.page_index == ticket.page_index
            && doc.current_key() == ticket.page_key;

        match result {
            Ok(panels) => {
                let panels = if panels.is_empty() {
                    vec![Panel::FULL_PAGE]
                } else {
                    panels
                };
                info!(page = ticket.page_index, panels = panels.len(), "panels detected");
                self.cache.put(ticket.page_key, panels);
                if !on_current_page {
                    return false;
                }
                doc.nav.view = ViewMode::Panel(0);
                doc.detection_error = None;
                self.events.lock().push(SessionEvent::RedrawNeeded);
                true
            }
            Err(err) => {
                warn!(%err, page = ticket.page_index, "panel detection failed");
                if on_current_page {
                    doc.detection_error = Some(err.clone());
                    self.events.lock().push(SessionEvent::DetectionFailed(err));
                }
                false
            }
        }
    }

    /// Runs detection to completion for the current page.
    pub async fn detect_with(&mut self, detector: &dyn PanelDetector) -> ReaderResult<()> {
        match self.detect_panels() {
            DetectRequest::Pending(job) => {
                let (ticket, result) = job.run(detector).await;
                let error = result.as_ref().err().cloned();
                self.complete_detection(ticket, result);
                match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            DetectRequest::Cached | DetectRequest::AlreadyPending | DetectRequest::Unsupported => {
                Ok(())
            }
        }
    }

    /// Creates a render job for the current page, superseding earlier ones.
    pub fn request_render(&mut self) -> Option<RenderJob> {
        let scale = self.render_scale;
        let Phase::Ready(doc) = &mut self.phase else {
            return None;
        };
        doc.render_seq += 1;
        Some(RenderJob {
            ticket: RenderTicket {
                generation: self.generation,
                page_index: doc.nav.page_index,
                seq: doc.render_seq,
            },
            backend: Arc::clone(&doc.backend),
            request: RenderRequest {
                page_index: doc.nav.page_index,
                scale,
            },
        })
    }

    /// Applies a render result unless it was superseded. Failures keep the
    /// previously displayed page.
    pub fn complete_render(
        &mut self,
        ticket: RenderTicket,
        result: ReaderResult<Drawable>,
    ) -> bool {
        if ticket.generation != self.generation {
            return false;
        }
        let Phase::Ready(doc) = &mut self.phase else {
            return false;
        };
        if ticket.seq != doc.render_seq || ticket.page_index != doc.nav.page_index {
            debug!(page = ticket.page_index, "discarding stale render");
            return false;
        }
        match result {
            Ok(drawable) => {
                doc.displayed = Some(DisplayedPage {
                    page_index: ticket.page_index,
                    drawable,
                });
                doc.render_error = None;
                true
            }
            Err(err) => {
                warn!(%err, page = ticket.page_index, "page render failed");
                doc.render_error = Some(err.clone());
                self.events.lock().push(SessionEvent::RenderFailed(err));
                false
            }
        }
    }
}
