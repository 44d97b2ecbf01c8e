use leitor_core::{Panel, RenderImage};

/// Terminal dimensions in cells and, when the terminal reports them, pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellGeometry {
    pub columns: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl CellGeometry {
    const FALLBACK_CELL: (f32, f32) = (8.0, 16.0);

    fn cell_size(&self) -> (f32, f32) {
        if self.pixel_width == 0 || self.pixel_height == 0 || self.columns == 0 || self.rows == 0 {
            return Self::FALLBACK_CELL;
        }
        (
            self.pixel_width as f32 / self.columns as f32,
            self.pixel_height as f32 / self.rows as f32,
        )
    }
}

pub fn crop_render_image(
    image: &RenderImage,
    origin_x: u32,
    origin_y: u32,
    width: u32,
    height: u32,
) -> RenderImage {
    if image.width == 0 || image.height == 0 {
        return RenderImage {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        };
    }

    let width = width.min(image.width).max(1);
    let height = height.min(image.height).max(1);
    let origin_x = origin_x.min(image.width.saturating_sub(width));
    let origin_y = origin_y.min(image.height.saturating_sub(height));

    let stride = image.width as usize * 4;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);

    for row in 0..height {
        let src_y = origin_y + row;
        let start = src_y as usize * stride + origin_x as usize * 4;
        let end = start + width as usize * 4;
        pixels.extend_from_slice(&image.pixels[start..end]);
    }

    RenderImage {
        width,
        height,
        pixels,
    }
}

/// Crops the page raster to one panel's normalized rectangle.
pub fn panel_view(image: &RenderImage, panel: &Panel) -> RenderImage {
    match panel.pixel_rect(image.width, image.height) {
        Some(rect) => crop_render_image(image, rect.x, rect.y, rect.width, rect.height),
        None => image.clone(),
    }
}

/// Crops the centered `1 / zoom` region of the page. Zoom at or below 1 keeps the whole page.
pub fn zoom_view(image: &RenderImage, zoom: f32) -> RenderImage {
    if !(zoom.is_finite() && zoom > 1.0) {
        return image.clone();
    }
    let width = (image.width as f32 / zoom).round().max(1.0) as u32;
    let height = (image.height as f32 / zoom).round().max(1.0) as u32;
    let origin_x = (image.width.saturating_sub(width)) / 2;
    let origin_y = (image.height.saturating_sub(height)) / 2;
    crop_render_image(image, origin_x, origin_y, width, height)
}

/// Page image and magnification for page view. Fit mode ignores `zoom`.
pub fn page_view(image: &RenderImage, zoom: f32, fit: bool) -> (RenderImage, f32) {
    if fit {
        return (image.clone(), 1.0);
    }
    (zoom_view(image, zoom), zoom)
}

/// Number of cells to draw `image` into.
///
/// With `fit` the image is scaled to fill the available area; otherwise it is drawn at
/// `zoom` times its pixel size, shrunk only when it would not fit. Aspect ratio is kept.
pub fn compute_scaled_dimensions(
    image: &RenderImage,
    zoom: f32,
    fit: bool,
    available_cols: u32,
    available_rows: u32,
    geometry: CellGeometry,
) -> (u32, u32) {
    let available_cols = available_cols.max(1);
    let available_rows = available_rows.max(1);
    if image.width == 0 || image.height == 0 {
        return (available_cols, available_rows);
    }

    let (cell_width, cell_height) = geometry.cell_size();
    let magnification = if fit || !zoom.is_finite() || zoom <= 0.0 {
        1.0
    } else {
        zoom
    };
    let needed_cols = image.width as f32 * magnification / cell_width;
    let needed_rows = image.height as f32 * magnification / cell_height;

    let mut scale = (available_cols as f32 / needed_cols).min(available_rows as f32 / needed_rows);
    if !fit {
        scale = scale.min(1.0);
    }

    let cols = (needed_cols * scale).round().clamp(1.0, available_cols as f32) as u32;
    let rows = (needed_rows * scale).round().clamp(1.0, available_rows as f32) as u32;
    (cols, rows)
}

/// Greedy word wrap. Blank lines between paragraphs are kept.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let mut line = String::new();
        let mut line_len = 0;
        for word in paragraph.split_whitespace() {
            let mut word = word;
            let mut word_len = word.chars().count();
            if line_len > 0 && line_len + 1 + word_len > width {
                lines.push(std::mem::take(&mut line));
                line_len = 0;
            }
            while word_len > width {
                let split = word
                    .char_indices()
                    .nth(width)
                    .map_or(word.len(), |(at, _)| at);
                lines.push(word[..split].to_owned());
                word = &word[split..];
                word_len = word.chars().count();
            }
            if word.is_empty() {
                continue;
            }
            if line_len > 0 {
                line.push(' ');
                line_len += 1;
            }
            line.push_str(word);
            line_len += word_len;
        }
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RenderImage {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[x as u8, y as u8, 0, 255]);
            }
        }
        RenderImage {
            width,
            height,
            pixels,
        }
    }

    fn geometry() -> CellGeometry {
        CellGeometry {
            columns: 100,
            rows: 50,
            pixel_width: 1000,
            pixel_height: 1000,
        }
    }

    #[test]
    fn crop_takes_the_requested_region() {
        let image = gradient(10, 10);
        let cropped = crop_render_image(&image, 2, 3, 4, 5);
        assert_eq!((cropped.width, cropped.height), (4, 5));
        assert_eq!(&cropped.pixels[..4], &[2, 3, 0, 255]);
    }

    #[test]
    fn crop_clamps_out_of_bounds_origins() {
        let image = gradient(10, 10);
        let cropped = crop_render_image(&image, 9, 9, 4, 4);
        assert_eq!((cropped.width, cropped.height), (4, 4));
        assert_eq!(&cropped.pixels[..4], &[6, 6, 0, 255]);
    }

    #[test]
    fn panel_view_crops_to_the_panel() {
        let image = gradient(100, 100);
        let view = panel_view(&image, &Panel::new(50.0, 0.0, 50.0, 50.0));
        assert_eq!((view.width, view.height), (50, 50));
        assert_eq!(&view.pixels[..4], &[50, 0, 0, 255]);

        let full = panel_view(&image, &Panel::FULL_PAGE);
        assert_eq!(full, image);
    }

    #[test]
    fn zoom_view_keeps_the_center() {
        let image = gradient(100, 100);
        let view = zoom_view(&image, 2.0);
        assert_eq!((view.width, view.height), (50, 50));
        assert_eq!(&view.pixels[..4], &[25, 25, 0, 255]);
        assert_eq!(zoom_view(&image, 1.0), image);
    }

    #[test]
    fn fit_fills_the_limiting_dimension() {
        // cells are 10x20 pixels
        let image = gradient(100, 200);
        let (cols, rows) = compute_scaled_dimensions(&image, 1.0, true, 100, 40, geometry());
        assert_eq!(rows, 40);
        assert_eq!(cols, 40);
    }

    #[test]
    fn natural_size_does_not_upscale() {
        let image = gradient(100, 200);
        let (cols, rows) = compute_scaled_dimensions(&image, 1.0, false, 100, 40, geometry());
        assert_eq!((cols, rows), (10, 10));

        let (cols, rows) = compute_scaled_dimensions(&image, 2.0, false, 100, 40, geometry());
        assert_eq!((cols, rows), (20, 20));
    }

    #[test]
    fn zoom_out_shrinks_the_page() {
        let image = gradient(100, 100);
        let natural = compute_scaled_dimensions(&image, 1.0, false, 100, 40, geometry());
        let half = compute_scaled_dimensions(&image, 0.5, false, 100, 40, geometry());
        assert_eq!(natural, (10, 5));
        assert_eq!(half, (5, 3));
    }

    #[test]
    fn fit_mode_ignores_zoom() {
        let image = gradient(100, 100);
        let (view, zoom) = page_view(&image, 1.5, true);
        assert_eq!((view.width, view.height), (100, 100));
        assert_eq!(zoom, 1.0);

        let (view, zoom) = page_view(&image, 1.5, false);
        assert_eq!((view.width, view.height), (67, 67));
        assert_eq!(zoom, 1.5);

        let (view, _) = page_view(&image, 0.5, false);
        assert_eq!(view, image);
    }

    #[test]
    fn unknown_pixel_size_uses_a_fallback_cell() {
        let image = gradient(80, 160);
        let unknown = CellGeometry {
            columns: 80,
            rows: 24,
            pixel_width: 0,
            pixel_height: 0,
        };
        assert_eq!(
            compute_scaled_dimensions(&image, 1.0, false, 80, 23, unknown),
            (10, 10)
        );
    }

    #[test]
    fn wrap_breaks_on_words_and_keeps_paragraphs() {
        let lines = wrap_text("one two three\n\nfour", 7);
        assert_eq!(lines, ["one two", "three", "", "four"]);
    }

    #[test]
    fn wrap_splits_overlong_words() {
        let lines = wrap_text("abcdefghij", 4);
        assert_eq!(lines, ["abcd", "efgh", "ij"]);
    }
}
