use std::io::Write;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    style::{Attribute, Print, SetAttribute},
    terminal::{Clear, ClearType},
};
use leitor_core::RenderImage;
use png::{BitDepth, ColorType, Encoder};
use tracing::trace;

mod input;
mod view;

pub use input::{EventMapper, UiEvent};
pub use view::{
    compute_scaled_dimensions, crop_render_image, page_view, panel_view, wrap_text, zoom_view,
    CellGeometry,
};

const CHUNK_SIZE: usize = 4096;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Transmits `image` as PNG and places it at the cursor, replacing the previous page.
    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        trace!(bytes = encoded.len(), "transmitting page image");
        let mut chunks = encoded.as_bytes().chunks(CHUNK_SIZE).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    u8::from(more)
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", u8::from(more))?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes every placed image, e.g. before showing reflowed text.
    pub fn delete_images(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=A,q=2\u{1b}\\")?;
        Ok(())
    }

    /// Writes pre-wrapped lines starting at (`col`, `row`), at most `max_rows` of them.
    pub fn draw_text(&mut self, col: u16, row: u16, lines: &[String], max_rows: usize) -> Result<()> {
        for (offset, line) in lines.iter().take(max_rows).enumerate() {
            let offset = u16::try_from(offset).unwrap_or(u16::MAX);
            crossterm::queue!(
                &mut self.writer,
                cursor::MoveTo(col, row.saturating_add(offset)),
                Print(line)
            )?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Writes `message` on `row` in reverse video, truncated to `width` characters.
    pub fn draw_banner(&mut self, row: u16, width: usize, message: &str) -> Result<()> {
        let text: String = message.chars().take(width).collect();
        crossterm::queue!(
            &mut self.writer,
            cursor::MoveTo(0, row),
            Clear(ClearType::CurrentLine),
            SetAttribute(Attribute::Reverse),
            Print(text),
            SetAttribute(Attribute::Reset)
        )?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Disables synchronized updates.
    /// The terminal will render all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Clears the entire screen.
    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}
