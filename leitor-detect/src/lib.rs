//! Panel detection backed by the Gemini `generateContent` endpoint.
//!
//! One request is issued per call; retries are left to the user.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use leitor_core::{
    sanitize_panels, DetectorSettings, Panel, PanelDetector, ReaderError, ReaderResult,
    RenderImage,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

pub const PANEL_PROMPT: &str = "Identifique os quadros de leitura desta página de quadrinhos, \
na ordem de leitura. Para cada quadro, informe x, y, width e height como porcentagens \
(de 0 a 100) das dimensões da página.";

const RATE_LIMIT_STATUS: u16 = 429;
const RATE_LIMIT_CODE: &str = "RESOURCE_EXHAUSTED";

/// A page raster re-encoded for upload.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub width: u32,
    pub height: u32,
    pub mime: &'static str,
    pub data: String,
}

pub struct GeminiPanelDetector {
    client: reqwest::Client,
    settings: DetectorSettings,
    api_key: String,
}

impl GeminiPanelDetector {
    pub fn new(settings: DetectorSettings) -> Result<Self> {
        let api_key = settings.resolve_api_key().ok_or_else(|| {
            anyhow!(
                "no detector api key configured; set detector.api_key or {}",
                settings.api_key_env
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .user_agent(concat!("leitor/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            settings,
            api_key,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.model
        )
    }
}

#[async_trait]
impl PanelDetector for GeminiPanelDetector {
    #[instrument(skip(self, page), fields(width = page.width, height = page.height))]
    async fn detect(&self, page: &RenderImage) -> ReaderResult<Vec<Panel>> {
        let prepared = prepare_image(page, self.settings.max_dimension, self.settings.jpeg_quality)
            .map_err(|err| ReaderError::DetectionFailed(format!("{err:#}")))?;
        debug!(
            width = prepared.width,
            height = prepared.height,
            "sending page for panel detection"
        );

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(&prepared))
            .send()
            .await
            .map_err(|err| classify_failure(err.status().map(|s| s.as_u16()), &err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ReaderError::DetectionFailed(err.to_string()))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "panel detection rejected");
            return Err(classify_failure(Some(status.as_u16()), &body));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|err| ReaderError::DetectionFailed(format!("malformed response: {err}")))?;
        let panels = sanitize_panels(parsed.first_text().unwrap_or_default());
        info!(panels = panels.len(), "panel detection finished");
        Ok(panels)
    }
}

/// Downscales `page` so its longest edge is at most `max_dimension` and encodes it as base64 JPEG.
pub fn prepare_image(page: &RenderImage, max_dimension: u32, quality: u8) -> Result<PreparedImage> {
    let buffer = RgbaImage::from_raw(page.width, page.height, page.pixels.clone())
        .ok_or_else(|| anyhow!("page raster does not match its dimensions"))?;
    let mut image = DynamicImage::ImageRgba8(buffer);
    let max_dimension = max_dimension.max(1);
    if image.width().max(image.height()) > max_dimension {
        image = image.resize(max_dimension, max_dimension, FilterType::Triangle);
    }

    let rgb = image.to_rgb8();
    let mut bytes = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
        .encode_image(&rgb)
        .context("failed to encode page for detection")?;

    Ok(PreparedImage {
        width: rgb.width(),
        height: rgb.height(),
        mime: "image/jpeg",
        data: BASE64.encode(bytes.into_inner()),
    })
}

pub fn request_body(image: &PreparedImage) -> Value {
    let coordinate = json!({ "type": "NUMBER" });
    json!({
        "contents": [{
            "parts": [
                { "inline_data": { "mime_type": image.mime, "data": image.data } },
                { "text": PANEL_PROMPT }
            ]
        }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "x": coordinate,
                        "y": coordinate,
                        "width": coordinate,
                        "height": coordinate
                    },
                    "required": ["x", "y", "width", "height"]
                }
            }
        }
    })
}

/// Maps a transport or provider failure onto the detection error taxonomy.
pub fn classify_failure(status: Option<u16>, detail: &str) -> ReaderError {
    if status == Some(RATE_LIMIT_STATUS) || detail.contains(RATE_LIMIT_CODE) {
        ReaderError::RateLimited(summarize(detail))
    } else {
        ReaderError::DetectionFailed(summarize(detail))
    }
}

fn summarize(detail: &str) -> String {
    let line = detail.trim().lines().next().unwrap_or_default();
    line.chars().take(200).collect()
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn first_text(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|part| part.text.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answers a single HTTP request with `status` and `body`, returning the raw request.
    async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/v1beta", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = socket.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..read]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (endpoint, handle)
    }

    fn detector_for(endpoint: String) -> GeminiPanelDetector {
        GeminiPanelDetector::new(DetectorSettings {
            endpoint,
            model: "test-model".into(),
            api_key: Some("secret".into()),
            timeout_secs: 10,
            ..DetectorSettings::default()
        })
        .unwrap()
    }

    fn page(width: u32, height: u32) -> RenderImage {
        RenderImage {
            width,
            height,
            pixels: vec![128; (width * height * 4) as usize],
        }
    }

    #[test]
    fn large_pages_are_downscaled_preserving_aspect() {
        let prepared = prepare_image(&page(2048, 1024), 1024, 80).unwrap();
        assert_eq!((prepared.width, prepared.height), (1024, 512));
        let bytes = BASE64.decode(&prepared.data).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1024, 512));
    }

    #[test]
    fn small_pages_keep_their_size() {
        let prepared = prepare_image(&page(300, 500), 1024, 80).unwrap();
        assert_eq!((prepared.width, prepared.height), (300, 500));
    }

    #[test]
    fn mismatched_raster_is_rejected() {
        let broken = RenderImage {
            width: 10,
            height: 10,
            pixels: vec![0; 3],
        };
        assert!(prepare_image(&broken, 1024, 80).is_err());
    }

    #[test]
    fn rate_limits_are_recognized_by_status_or_code() {
        assert!(matches!(
            classify_failure(Some(429), "Too Many Requests"),
            ReaderError::RateLimited(_)
        ));
        assert!(matches!(
            classify_failure(
                Some(400),
                r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED"}}"#
            ),
            ReaderError::RateLimited(_)
        ));
        assert!(matches!(
            classify_failure(Some(500), "internal"),
            ReaderError::DetectionFailed(_)
        ));
        assert!(matches!(
            classify_failure(None, "connection refused"),
            ReaderError::DetectionFailed(_)
        ));
    }

    #[test]
    fn request_requires_all_coordinates() {
        let prepared = prepare_image(&page(4, 4), 1024, 80).unwrap();
        let body = request_body(&prepared);
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(parts[1]["text"], PANEL_PROMPT);
        let schema = &body["generationConfig"]["responseSchema"];
        assert_eq!(schema["type"], "ARRAY");
        assert_eq!(
            schema["items"]["required"],
            json!(["x", "y", "width", "height"])
        );
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn response_text_feeds_the_sanitizer() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"[{\"x\":0,\"y\":0,\"width\":50,\"height\":50}]"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let panels = sanitize_panels(parsed.first_text().unwrap_or_default());
        assert_eq!(panels, vec![Panel::new(0.0, 0.0, 50.0, 50.0)]);
    }

    #[test]
    fn missing_candidates_fall_back_to_full_page() {
        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"OTHER"}}"#).unwrap();
        assert_eq!(parsed.first_text(), None);
        assert_eq!(
            sanitize_panels(parsed.first_text().unwrap_or_default()),
            vec![Panel::FULL_PAGE]
        );
    }

    #[test]
    fn detector_requires_an_api_key() {
        let settings = DetectorSettings {
            api_key: None,
            api_key_env: "LEITOR_TEST_DETECT_KEY_UNSET_9C1".into(),
            ..DetectorSettings::default()
        };
        assert!(GeminiPanelDetector::new(settings).is_err());
    }

    #[test]
    fn url_targets_the_configured_model() {
        let settings = DetectorSettings {
            api_key: Some("k".into()),
            endpoint: "http://localhost:9/v1beta/".into(),
            model: "m1".into(),
            ..DetectorSettings::default()
        };
        let detector = GeminiPanelDetector::new(settings).unwrap();
        assert_eq!(detector.url(), "http://localhost:9/v1beta/models/m1:generateContent");
    }

    #[tokio::test]
    async fn empty_detection_falls_back_to_the_full_page() {
        let body = json!({
            "candidates": [{ "content": { "parts": [{ "text": "[]" }] } }]
        })
        .to_string();
        let (endpoint, server) = serve_once("200 OK", body).await;

        let panels = detector_for(endpoint).detect(&page(64, 32)).await.unwrap();
        assert_eq!(panels, vec![Panel::FULL_PAGE]);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1beta/models/test-model:generateContent "));
        assert!(request.to_ascii_lowercase().contains("x-goog-api-key: secret"));
        assert!(request.contains(PANEL_PROMPT));
    }

    #[tokio::test]
    async fn detected_panels_keep_reading_order() {
        let panels = r#"[{"x":0,"y":0,"width":50,"height":50},{"x":50,"y":0,"width":50,"height":50}]"#;
        let body = json!({
            "candidates": [{ "content": { "parts": [{ "text": panels }] } }]
        })
        .to_string();
        let (endpoint, server) = serve_once("200 OK", body).await;

        let detected = detector_for(endpoint).detect(&page(64, 32)).await.unwrap();
        assert_eq!(
            detected,
            vec![
                Panel::new(0.0, 0.0, 50.0, 50.0),
                Panel::new(50.0, 0.0, 50.0, 50.0)
            ]
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_429_is_reported_as_rate_limited() {
        let body = json!({
            "error": { "code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED" }
        })
        .to_string();
        let (endpoint, server) = serve_once("429 Too Many Requests", body).await;

        let err = detector_for(endpoint)
            .detect(&page(64, 32))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::RateLimited(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_generic_failures() {
        let (endpoint, server) =
            serve_once("500 Internal Server Error", "backend unavailable".into()).await;

        let err = detector_for(endpoint)
            .detect(&page(64, 32))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::DetectionFailed(_)));
        server.await.unwrap();
    }
}
