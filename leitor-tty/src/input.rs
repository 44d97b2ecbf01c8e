use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use leitor_core::Command;

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A controller command, repeated `count` times.
    Command { command: Command, count: usize },
    DetectPanels,
    Resize,
    Quit,
    None,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent { kind, .. }) if kind == KeyEventKind::Release => UiEvent::None,
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => self.map_key(code, modifiers),
            Event::Resize(..) => UiEvent::Resize,
            _ => UiEvent::None,
        }
    }

    fn map_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.reset_count();
                UiEvent::Quit
            }
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Char(' '), KeyModifiers::NONE)
            | (KeyCode::Down, _)
            | (KeyCode::Right, _)
            | (KeyCode::PageDown, _) => self.repeat(Command::NextPage),
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Up, _)
            | (KeyCode::Left, _)
            | (KeyCode::PageUp, _) => self.repeat(Command::PrevPage),
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                let page = self.take_page().unwrap_or(0);
                Self::once(Command::GotoPage { page })
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => {
                let page = self.take_page().unwrap_or(usize::MAX);
                Self::once(Command::GotoPage { page })
            }
            (KeyCode::Char('p'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::DetectPanels
            }
            (KeyCode::Esc, _) => {
                self.reset_count();
                Self::once(Command::ExitPanels)
            }
            (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => self.repeat(Command::ZoomIn),
            (KeyCode::Char('-'), _) => self.repeat(Command::ZoomOut),
            (KeyCode::Char('f'), KeyModifiers::NONE) => {
                self.reset_count();
                Self::once(Command::ToggleFit)
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn once(command: Command) -> UiEvent {
        UiEvent::Command { command, count: 1 }
    }

    fn repeat(&mut self, command: Command) -> UiEvent {
        let count = self.take_count();
        UiEvent::Command { command, count }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    /// Consumes a 1-based page prefix as a 0-based page index.
    fn take_page(&mut self) -> Option<usize> {
        let page = self.pending_count.take().map(|page| page.saturating_sub(1));
        self.pending_digits.clear();
        page
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}
