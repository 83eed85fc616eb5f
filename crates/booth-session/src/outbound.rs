//! Events pushed to the transport layer.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

/// Outward event, serialized as `{"event": "...", "data": "data:image/jpeg;base64,..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    PreviewFrame(String),
    CaptureReady(String),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::PreviewFrame(_) => "preview-frame",
            OutboundEvent::CaptureReady(_) => "capture-ready",
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            OutboundEvent::PreviewFrame(data) | OutboundEvent::CaptureReady(data) => data,
        }
    }
}

/// Transport-safe representation of a JPEG.
pub fn jpeg_data_url(bytes: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_and_wire_shape() {
        let url = jpeg_data_url(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(url, "data:image/jpeg;base64,/9j/2Q==");

        let event = OutboundEvent::CaptureReady(url.clone());
        assert_eq!(event.name(), "capture-ready");
        assert_eq!(event.payload(), url);
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            format!(r#"{{"event":"capture-ready","data":"{url}"}}"#)
        );
    }
}
