use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Panel, ReaderResult, RenderImage};

/// External reading-panel detector.
///
/// Implementations return the sanitized panel list for a full-resolution
/// page raster, or `RateLimited` / `DetectionFailed`.
#[async_trait]
pub trait PanelDetector: Send + Sync {
    async fn detect(&self, page: &RenderImage) -> ReaderResult<Vec<Panel>>;
}

/// Turns the detector's JSON text into a non-empty panel list.
///
/// Malformed elements are dropped. When nothing usable remains the whole
/// page is returned as a single panel.
pub fn sanitize_panels(raw: &str) -> Vec<Panel> {
    let parsed: Value = match serde_json::from_str(raw.trim()) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, "panel response is not valid JSON; using full page");
            return vec![Panel::FULL_PAGE];
        }
    };

    let Some(items) = parsed.as_array() else {
        warn!("panel response is not an array; using full page");
        return vec![Panel::FULL_PAGE];
    };

    let panels: Vec<Panel> = items.iter().filter_map(parse_panel).collect();
    if panels.len() < items.len() {
        debug!(
            dropped = items.len() - panels.len(),
            kept = panels.len(),
            "dropped malformed panel entries"
        );
    }

    if panels.is_empty() {
        debug!("no usable panels in response; using full page");
        vec![Panel::FULL_PAGE]
    } else {
        panels
    }
}

fn parse_panel(value: &Value) -> Option<Panel> {
    let object = value.as_object()?;
    let field = |name: &str| -> Option<f32> {
        let number = object.get(name)?.as_f64()?;
        number
            .is_finite()
            .then(|| (number as f32).clamp(0.0, 100.0))
    };
    let panel = Panel::new(field("x")?, field("y")?, field("width")?, field("height")?);
    // A zero-area rectangle has nothing to crop to, so it counts as malformed.
    (panel.width > 0.0 && panel.height > 0.0).then_some(panel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_array_falls_back_to_full_page() {
        assert_eq!(sanitize_panels("[]"), vec![Panel::FULL_PAGE]);
    }

    #[test]
    fn degenerate_payloads_fall_back_to_full_page() {
        for raw in ["", "   ", "{\"x\": 1}", "null", "not json", "[1, 2, \"three\"]"] {
            assert_eq!(sanitize_panels(raw), vec![Panel::FULL_PAGE], "{raw:?}");
        }
    }

    #[test]
    fn valid_panels_are_kept_verbatim_and_in_order() {
        let raw = r#"[{"x":0,"y":0,"width":50,"height":50},{"x":50,"y":0,"width":50,"height":50}]"#;
        assert_eq!(
            sanitize_panels(raw),
            vec![
                Panel::new(0.0, 0.0, 50.0, 50.0),
                Panel::new(50.0, 0.0, 50.0, 50.0)
            ]
        );
    }

    #[test]
    fn malformed_entries_are_dropped_silently() {
        let raw = r#"[
            {"x":10,"y":10,"width":30,"height":40},
            {"x":"10","y":10,"width":30,"height":40},
            {"x":10,"y":10,"width":30},
            {"x":5,"y":60,"width":90,"height":35.5}
        ]"#;
        assert_eq!(
            sanitize_panels(raw),
            vec![
                Panel::new(10.0, 10.0, 30.0, 40.0),
                Panel::new(5.0, 60.0, 90.0, 35.5)
            ]
        );
    }

    #[test]
    fn out_of_range_values_are_clamped_and_empty_panels_dropped() {
        let raw = r#"[{"x":-5,"y":0,"width":140,"height":50},{"x":0,"y":0,"width":0,"height":10}]"#;
        assert_eq!(
            sanitize_panels(raw),
            vec![Panel::new(0.0, 0.0, 100.0, 50.0)]
        );
    }
}
