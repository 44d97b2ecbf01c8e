use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::PageKey;

/// A reading panel in percent of the page dimensions.
///
/// `x + width` and `y + height` may exceed 100; consumers clamp when they
/// map a panel onto pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Panel {
    pub const FULL_PAGE: Panel = Panel {
        x: 0.0,
        y: 0.0,
        width: 100.0,
        height: 100.0,
    };

    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Zoom transform that fills the viewport with this panel.
    pub fn transform(&self) -> ViewTransform {
        let width = self.width.max(f32::EPSILON);
        ViewTransform {
            scale: 100.0 / width,
            translate_x: 50.0 - (self.x + self.width / 2.0),
            translate_y: 50.0 - (self.y + self.height / 2.0),
        }
    }

    /// Maps the panel onto a `width` x `height` raster, clamped to its bounds.
    pub fn pixel_rect(&self, width: u32, height: u32) -> Option<PixelRect> {
        if width == 0 || height == 0 {
            return None;
        }
        let w = width as f32;
        let h = height as f32;
        let x0 = (self.x * w / 100.0).floor().clamp(0.0, w) as u32;
        let y0 = (self.y * h / 100.0).floor().clamp(0.0, h) as u32;
        let x1 = ((self.x + self.width) * w / 100.0).ceil().clamp(0.0, w) as u32;
        let y1 = ((self.y + self.height) * h / 100.0).ceil().clamp(0.0, h) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

/// Percent-based transform: translate by (`translate_x`, `translate_y`) percent
/// of the page, then scale around the viewport centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub scale: f32,
    pub translate_x: f32,
    pub translate_y: f32,
}

impl ViewTransform {
    pub const IDENTITY: ViewTransform = ViewTransform {
        scale: 1.0,
        translate_x: 0.0,
        translate_y: 0.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Per-document panel lists, keyed by page identity.
///
/// Populated on demand and only ever emptied as a whole.
#[derive(Debug, Default)]
pub struct PanelCache {
    entries: HashMap<PageKey, Vec<Panel>>,
}

impl PanelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PageKey) -> Option<&[Panel]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Stores `panels` for `key`, replacing any previous entry. Empty lists are
    /// not stored.
    pub fn put(&mut self, key: PageKey, panels: Vec<Panel>) -> bool {
        if panels.is_empty() {
            debug!(page = %key, "refusing to cache an empty panel list");
            return false;
        }
        self.entries.insert(key, panels);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_panels_in_order() {
        let mut cache = PanelCache::new();
        let key = PageKey::new("001.png");
        let panels = vec![
            Panel::new(0.0, 0.0, 50.0, 50.0),
            Panel::new(50.0, 0.0, 50.0, 50.0),
        ];
        assert!(cache.put(key.clone(), panels.clone()));
        assert_eq!(cache.get(&key), Some(panels.as_slice()));

        let replacement = vec![Panel::FULL_PAGE];
        assert!(cache.put(key.clone(), replacement.clone()));
        assert_eq!(cache.get(&key), Some(replacement.as_slice()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_drops_every_entry() {
        let mut cache = PanelCache::new();
        for idx in 0..5 {
            cache.put(PageKey::from_index(idx), vec![Panel::FULL_PAGE]);
        }
        cache.clear();
        assert!(cache.is_empty());
        for idx in 0..5 {
            assert!(cache.get(&PageKey::from_index(idx)).is_none());
        }
    }

    #[test]
    fn empty_lists_are_not_cached() {
        let mut cache = PanelCache::new();
        assert!(!cache.put(PageKey::from_index(0), Vec::new()));
        assert!(cache.get(&PageKey::from_index(0)).is_none());
    }

    #[test]
    fn transform_centres_panel() {
        let t = Panel::new(50.0, 0.0, 50.0, 50.0).transform();
        assert_eq!(t.scale, 2.0);
        assert_eq!(t.translate_x, -25.0);
        assert_eq!(t.translate_y, 25.0);

        assert_eq!(Panel::FULL_PAGE.transform(), ViewTransform::IDENTITY);
    }

    #[test]
    fn pixel_rect_clamps_overflowing_panels() {
        let rect = Panel::new(80.0, 90.0, 40.0, 30.0)
            .pixel_rect(200, 100)
            .unwrap();
        assert_eq!(
            rect,
            PixelRect {
                x: 160,
                y: 90,
                width: 40,
                height: 10
            }
        );
        assert!(Panel::new(120.0, 0.0, 10.0, 10.0).pixel_rect(200, 100).is_none());
    }
}
