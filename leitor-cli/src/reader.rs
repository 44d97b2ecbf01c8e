use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossterm::{cursor, event, terminal};
use leitor_core::{
    DetectRequest, DetectionJob, DocumentProvider, DocumentSource, Drawable, PageTicket, Panel,
    PanelDetector, ReaderError, ReaderResult, ReadingSession, RenderJob, RenderTicket,
    SessionEvent, SessionPhase,
};
use leitor_tty::{
    compute_scaled_dimensions, page_view, panel_view, wrap_text, CellGeometry, DrawParams,
    EventMapper, KittyRenderer, UiEvent,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

enum JobResult {
    Rendered(RenderTicket, ReaderResult<Drawable>),
    Detected(PageTicket, ReaderResult<Vec<Panel>>),
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

/// Runs the interactive reader until the user quits.
pub async fn run<P>(
    source: DocumentSource,
    provider: &P,
    detector: Option<Arc<dyn PanelDetector>>,
    render_scale: f32,
) -> Result<()>
where
    P: DocumentProvider + ?Sized,
{
    let mut session = ReadingSession::new().with_render_scale(render_scale);
    let (tx, mut rx) = mpsc::unbounded_channel::<JobResult>();

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut event_mapper = EventMapper::new();

    let ticket = session.begin_open(&source.name);
    redraw(&mut renderer, &session, None)?;
    let opened = provider.open(source).await;
    if session.finish_open(ticket, opened).is_ok() {
        schedule_render(&mut session, &tx);
    }

    let mut dirty = true;
    loop {
        while let Ok(result) = rx.try_recv() {
            match result {
                JobResult::Rendered(ticket, result) => {
                    session.complete_render(ticket, result);
                }
                JobResult::Detected(ticket, result) => {
                    session.complete_detection(ticket, result);
                }
            }
        }
        for event in session.take_events() {
            match &event {
                SessionEvent::DetectionFailed(err) | SessionEvent::RenderFailed(err) => {
                    warn!(%err, "reader error");
                }
                other => debug!(?other, "session event"),
            }
            dirty = true;
        }

        if dirty {
            let pending = event_mapper.pending_input();
            redraw(&mut renderer, &session, pending.as_deref())?;
            dirty = false;
        }

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        match event_mapper.map_event(event::read()?) {
            UiEvent::Command { command, count } => {
                let before = session.navigation().map(|nav| nav.page_index);
                let mut changed = false;
                for _ in 0..count {
                    if !session.apply(command.clone()) {
                        break;
                    }
                    changed = true;
                }
                if changed && session.navigation().map(|nav| nav.page_index) != before {
                    schedule_render(&mut session, &tx);
                }
                dirty = true;
            }
            UiEvent::DetectPanels => {
                match session.detect_panels() {
                    DetectRequest::Pending(job) => match &detector {
                        Some(detector) => spawn_detection(job, Arc::clone(detector), tx.clone()),
                        None => {
                            let ticket = job.ticket().clone();
                            session.complete_detection(
                                ticket,
                                Err(ReaderError::DetectionFailed(
                                    "no detector api key configured".into(),
                                )),
                            );
                        }
                    },
                    DetectRequest::Cached => {}
                    DetectRequest::AlreadyPending | DetectRequest::Unsupported => {
                        debug!("panel detection request ignored");
                    }
                }
                dirty = true;
            }
            UiEvent::Resize => dirty = true,
            UiEvent::Quit => break,
            UiEvent::None => dirty = true,
        }
    }

    session.close();
    renderer.delete_images()?;
    renderer.clear_all()?;
    info!("reader closed");
    Ok(())
}

fn schedule_render(session: &mut ReadingSession, tx: &UnboundedSender<JobResult>) {
    if let Some(job) = session.request_render() {
        spawn_render(job, tx.clone());
    }
}

fn spawn_render(job: RenderJob, tx: UnboundedSender<JobResult>) {
    tokio::task::spawn_blocking(move || {
        let ticket = job.ticket();
        let result = job.run();
        let _ = tx.send(JobResult::Rendered(ticket, result));
    });
}

fn spawn_detection(
    job: DetectionJob,
    detector: Arc<dyn PanelDetector>,
    tx: UnboundedSender<JobResult>,
) {
    tokio::spawn(async move {
        let (ticket, result) = job.run(detector.as_ref()).await;
        let _ = tx.send(JobResult::Detected(ticket, result));
    });
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    session: &ReadingSession,
    pending_input: Option<&str>,
) -> Result<()> {
    let window = terminal::window_size()?;
    let geometry = CellGeometry {
        columns: u32::from(window.columns).max(1),
        rows: u32::from(window.rows).max(1),
        pixel_width: u32::from(window.width),
        pixel_height: u32::from(window.height),
    };
    let content_rows = geometry.rows.saturating_sub(2).max(1);
    let status_row = u16::try_from(geometry.rows.saturating_sub(1)).unwrap_or(u16::MAX);
    let message_row = status_row.saturating_sub(1);
    let width = geometry.columns as usize;

    renderer.begin_sync_update()?;
    renderer.clear_all()?;

    match session.phase() {
        SessionPhase::Loading => {
            renderer.delete_images()?;
            let title = session.title().unwrap_or_default();
            renderer.draw_text(1, 1, &[format!("Loading {title}…")], 1)?;
        }
        SessionPhase::Error => {
            renderer.delete_images()?;
            if let Some(err) = session.load_error() {
                let lines = wrap_text(
                    &format!("{}\n\n{}\n\nPress q to quit.", err.user_message(), err),
                    width.saturating_sub(2),
                );
                renderer.draw_text(1, 1, &lines, content_rows as usize)?;
            }
        }
        SessionPhase::Closed => renderer.delete_images()?,
        SessionPhase::Ready => draw_page(renderer, session, geometry, content_rows)?,
    }

    let inline_error = session
        .render_error()
        .or_else(|| session.detection_error())
        .map(ReaderError::user_message);
    if let Some(message) = inline_error {
        renderer.draw_banner(message_row, width, &message)?;
    }
    renderer.draw_banner(status_row, width, &status_line(session, pending_input))?;
    renderer.end_sync_update()?;
    Ok(())
}

fn draw_page(
    renderer: &mut KittyRenderer<io::Stdout>,
    session: &ReadingSession,
    geometry: CellGeometry,
    content_rows: u32,
) -> Result<()> {
    let Some(displayed) = session.displayed() else {
        renderer.delete_images()?;
        let page = session.navigation().map_or(0, |nav| nav.page_index) + 1;
        renderer.draw_text(1, 1, &[format!("Rendering page {page}…")], 1)?;
        return Ok(());
    };
    let Some(nav) = session.navigation() else {
        return Ok(());
    };

    match &displayed.drawable {
        Drawable::Raster(image) => {
            let (view, zoom, fit) = match session.current_panel() {
                Some(panel) => (panel_view(image, &panel), 1.0, true),
                None => {
                    let (view, zoom) = page_view(image, nav.zoom_factor, nav.fit_to_container);
                    (view, zoom, nav.fit_to_container)
                }
            };
            let (cols, rows) = compute_scaled_dimensions(
                &view,
                zoom,
                fit,
                geometry.columns,
                content_rows,
                geometry,
            );
            let start_col = geometry.columns.saturating_sub(cols) / 2;
            let start_row = content_rows.saturating_sub(rows) / 2;
            let writer = renderer.writer();
            crossterm::execute!(
                writer,
                cursor::MoveTo(
                    u16::try_from(start_col).unwrap_or_default(),
                    u16::try_from(start_row).unwrap_or_default()
                )
            )?;
            renderer.draw(&view, DrawParams::clamped(cols, rows))?;
        }
        Drawable::Reflow(reflow) => {
            renderer.delete_images()?;
            let margin = 2;
            let lines = wrap_text(
                &reflow.text,
                (geometry.columns as usize).saturating_sub(margin * 2),
            );
            renderer.draw_text(margin as u16, 0, &lines, content_rows as usize)?;
        }
    }
    Ok(())
}

fn status_line(session: &ReadingSession, pending_input: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(title) = session.title() {
        parts.push(title.to_owned());
    }
    if let (Some(nav), Some(count)) = (session.navigation(), session.page_count()) {
        parts.push(format!("page {}/{}", nav.page_index + 1, count));
        if let (Some(index), Some(panels)) = (nav.panel_index(), session.current_panels()) {
            parts.push(format!("panel {}/{}", index + 1, panels.len()));
        }
        if session
            .backend_kind()
            .is_some_and(|kind| kind.supports_zoom())
        {
            parts.push(format!("{:.0}%", nav.zoom_factor * 100.0));
            if nav.fit_to_container {
                parts.push("fit".into());
            }
        }
    }
    if session.is_detecting() {
        parts.push("detecting panels…".into());
    }
    if let Some(pending) = pending_input.filter(|pending| !pending.is_empty()) {
        parts.push(pending.to_owned());
    }
    parts.join(" | ")
}
