//! Codecs and header extensions every router is created with

use serde_json::json;

use super::rtp::{CodecParameters, RtcpFeedback, RtpCodecCapability, RtpHeaderExtension};
use crate::types::MediaKind;

pub const MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

fn video_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::new("nack", ""),
        RtcpFeedback::new("nack", "pli"),
        RtcpFeedback::new("ccm", "fir"),
        RtcpFeedback::new("goog-remb", ""),
        RtcpFeedback::new("transport-cc", ""),
    ]
}

fn h264_parameters(packetization_mode: u8) -> CodecParameters {
    [
        ("packetization-mode".to_string(), json!(packetization_mode)),
        ("profile-level-id".to_string(), json!("42e01f")),
        ("level-asymmetry-allowed".to_string(), json!(1)),
    ]
    .into_iter()
    .collect()
}

/// Codecs routers accept; payload types are assigned by the engine
#[must_use]
pub fn router_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: CodecParameters::new(),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: CodecParameters::new(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: h264_parameters(1),
            rtcp_feedback: video_feedback(),
        },
        // Safari without packetization-mode=1 support
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: h264_parameters(0),
            rtcp_feedback: video_feedback(),
        },
    ]
}

/// Header extensions forwarded from publishers
#[must_use]
pub fn supported_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, preferred_id| RtpHeaderExtension {
        kind: Some(kind),
        uri: uri.to_string(),
        preferred_id,
    };

    vec![
        ext(MediaKind::Audio, MID_URI, 1),
        ext(MediaKind::Video, MID_URI, 1),
        ext(MediaKind::Audio, ABS_SEND_TIME_URI, 4),
        ext(MediaKind::Video, ABS_SEND_TIME_URI, 4),
        ext(MediaKind::Audio, TRANSPORT_CC_URI, 5),
        ext(MediaKind::Video, TRANSPORT_CC_URI, 5),
        ext(MediaKind::Audio, AUDIO_LEVEL_URI, 10),
    ]
}

/// Whether `uri` may be carried on a `kind` track
#[must_use]
pub fn is_supported_header_extension(kind: MediaKind, uri: &str) -> bool {
    supported_header_extensions()
        .iter()
        .any(|ext| ext.kind.map_or(true, |k| k == kind) && ext.uri == uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_codecs_cover_vp8_h264_and_opus() {
        let codecs = router_media_codecs();
        assert!(codecs.iter().any(|c| c.mime_type == "audio/opus"));
        assert!(codecs.iter().any(|c| c.mime_type == "video/VP8"));
        assert_eq!(codecs.iter().filter(|c| c.mime_type == "video/H264").count(), 2);
        assert!(codecs.iter().all(|c| !c.is_rtx()));
    }

    #[test]
    fn test_header_extension_support_is_kind_aware() {
        assert!(is_supported_header_extension(MediaKind::Audio, AUDIO_LEVEL_URI));
        assert!(!is_supported_header_extension(MediaKind::Video, AUDIO_LEVEL_URI));
        assert!(!is_supported_header_extension(
            MediaKind::Video,
            "urn:3gpp:video-orientation"
        ));
    }
}
