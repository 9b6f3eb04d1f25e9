//! WHIP publish negotiation
//!
//! Turns an SDP offer into an ingest transport plus one producer per accepted
//! media section and renders the SDP answer. Everything a failed request
//! created is rolled back before the error is returned.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use whipcast_core::config::VideoCodecPreference;

use crate::engine::codecs::{is_supported_header_extension, router_media_codecs};
use crate::engine::rtp::{
    parameter_str, CodecParameters, RtcpFeedback, RtcpParameters, RtpCodecParameters,
    RtpEncodingParameters, RtpHeaderExtensionParameters, RtpParameters, RtxParameters,
};
use crate::engine::{
    ConnectParameters, DtlsFingerprint, DtlsParameters, DtlsRole, EngineError, IceParameters,
    Producer, Transport,
};
use crate::error::{SfuError, SfuResult};
use crate::manager::StreamManager;
use crate::sdp::{
    Candidate, Direction, ExtMap, Fingerprint, Group, MediaDescription, Origin,
    SessionDescription,
};
use crate::stream::Stream;
use crate::types::{MediaKind, StreamId};

/// One offered section the SFU will receive
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedMedia {
    pub kind: MediaKind,
    pub mid: String,
    pub rtp_parameters: RtpParameters,
}

impl AcceptedMedia {
    #[must_use]
    pub fn payload_types(&self) -> Vec<u8> {
        self.rtp_parameters.payload_types()
    }
}

/// Credentials every offer must carry
struct RemoteCredentials {
    ice: IceParameters,
    dtls: DtlsParameters,
}

fn remote_credentials(offer: &SessionDescription) -> SfuResult<RemoteCredentials> {
    let (Some(ufrag), Some(pwd), Some(fingerprint)) =
        (offer.ice_ufrag(), offer.ice_pwd(), offer.fingerprint())
    else {
        return Err(SfuError::MalformedOffer(
            "missing ICE credentials or DTLS fingerprint".to_string(),
        ));
    };

    Ok(RemoteCredentials {
        ice: IceParameters {
            username_fragment: ufrag.to_string(),
            password: pwd.to_string(),
            ice_lite: offer.ice_lite,
        },
        dtls: DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: fingerprint.algorithm.to_lowercase(),
                value: fingerprint.hash.clone(),
            }],
        },
    })
}

/// Numeric fmtp values become JSON numbers, everything else stays a string
fn fmtp_value(value: &str) -> Value {
    value
        .parse::<u64>()
        .map_or_else(|_| Value::String(value.to_string()), Value::from)
}

/// Codec description of payload type `pt` as offered in `section`
fn offered_codec(section: &MediaDescription, kind: MediaKind, pt: u8) -> Option<RtpCodecParameters> {
    let rtpmap = section.rtpmap(pt)?;

    let parameters: CodecParameters = section
        .fmtp(pt)
        .map(|fmtp| {
            fmtp.params()
                .map(|(k, v)| (k.to_string(), fmtp_value(v)))
                .collect()
        })
        .unwrap_or_default();

    Some(RtpCodecParameters {
        mime_type: format!("{kind}/{}", rtpmap.encoding),
        payload_type: pt,
        clock_rate: rtpmap.clock_rate,
        channels: rtpmap.channels,
        parameters,
        rtcp_feedback: section
            .rtcp_fbs_for(pt)
            .map(|fb| RtcpFeedback::new(fb.feedback_type.clone(), fb.parameter.clone()))
            .collect(),
    })
}

fn is_codec(codec: &RtpCodecParameters, name: &str) -> bool {
    codec
        .mime_type
        .split_once('/')
        .is_some_and(|(_, codec_name)| codec_name.eq_ignore_ascii_case(name))
}

fn pick_h264(codecs: &[RtpCodecParameters]) -> Option<&RtpCodecParameters> {
    let h264: Vec<&RtpCodecParameters> = codecs.iter().filter(|c| is_codec(c, "h264")).collect();
    h264.iter()
        .find(|c| parameter_str(&c.parameters, "packetization-mode").as_deref() == Some("1"))
        .or_else(|| h264.first())
        .copied()
}

/// The single media codec accepted for a section
fn pick_media_codec(
    kind: MediaKind,
    codecs: &[RtpCodecParameters],
    preference: VideoCodecPreference,
) -> Option<&RtpCodecParameters> {
    match kind {
        MediaKind::Audio => codecs
            .iter()
            .find(|c| is_codec(c, "opus") && c.clock_rate == 48000),
        MediaKind::Video => {
            let vp8 = || codecs.iter().find(|c| is_codec(c, "vp8"));
            match preference {
                VideoCodecPreference::Vp8 => vp8().or_else(|| pick_h264(codecs)),
                VideoCodecPreference::H264 => pick_h264(codecs).or_else(vp8),
            }
        }
    }
}

/// Deterministic non-zero SSRC for publishers that announce none
#[must_use]
pub fn synthesize_ssrc(stream_id: &StreamId, mid: &str) -> u32 {
    let digest = Sha256::digest(format!("{stream_id}{mid}").as_bytes());
    let ssrc = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    if ssrc == 0 {
        1
    } else {
        ssrc
    }
}

/// Primary SSRC and, when grouped, the RTX SSRC of a section
fn select_ssrcs(section: &MediaDescription, stream_id: &StreamId, mid: &str) -> (u32, Option<u32>) {
    if let Some(group) = section
        .ssrc_groups
        .iter()
        .find(|g| g.semantics == "FID" && g.ssrcs.len() >= 2)
    {
        return (group.ssrcs[0], Some(group.ssrcs[1]));
    }
    if let Some(line) = section.ssrcs.iter().find(|s| s.attribute == "cname") {
        return (line.ssrc, None);
    }
    if let Some(line) = section.ssrcs.first() {
        return (line.ssrc, None);
    }

    let ssrc = synthesize_ssrc(stream_id, mid);
    warn!(stream_id = %stream_id, mid, ssrc, "Offer carries no SSRC, using synthesized one");
    (ssrc, None)
}

/// Decide whether and how the SFU receives `section`
///
/// Returns `None` for sections that are not audio/video, that the publisher
/// does not send on, or that offer no acceptable codec.
#[must_use]
pub fn accept_section(
    section: &MediaDescription,
    index: usize,
    stream_id: &StreamId,
    preference: VideoCodecPreference,
) -> Option<AcceptedMedia> {
    let kind = MediaKind::from_sdp_media(&section.media)?;
    if !section.direction().is_sending() || section.port == 0 {
        return None;
    }
    let mid = section.mid.clone().unwrap_or_else(|| index.to_string());

    // only codecs the router forwards are candidates; RTX is resolved by apt below
    let forwarded = router_media_codecs();
    let offered: Vec<RtpCodecParameters> = section
        .formats
        .iter()
        .filter_map(|f| f.parse::<u8>().ok())
        .filter_map(|pt| offered_codec(section, kind, pt))
        .filter(|codec| codec.is_rtx() || forwarded.iter().any(|cap| codec.matches(cap)))
        .collect();

    let Some(media_codec) = pick_media_codec(kind, &offered, preference).cloned() else {
        debug!(stream_id = %stream_id, mid = %mid, kind = %kind, "No acceptable codec in section");
        return None;
    };

    let apt = media_codec.payload_type.to_string();
    let rtx = offered
        .iter()
        .find(|c| c.is_rtx() && parameter_str(&c.parameters, "apt").as_deref() == Some(apt.as_str()))
        .cloned();

    let (ssrc, rtx_ssrc) = select_ssrcs(section, stream_id, &mid);
    let encoding = RtpEncodingParameters {
        ssrc: Some(ssrc),
        rtx: match (&rtx, rtx_ssrc) {
            (Some(_), Some(rtx_ssrc)) => Some(RtxParameters { ssrc: rtx_ssrc }),
            _ => None,
        },
    };

    let cname = section
        .ssrcs
        .iter()
        .find(|s| s.attribute == "cname")
        .and_then(|s| s.value.clone())
        .unwrap_or_else(|| format!("whipcast-{stream_id}"));

    let header_extensions = section
        .extmaps
        .iter()
        .filter(|ext| is_supported_header_extension(kind, &ext.uri))
        .map(|ext| RtpHeaderExtensionParameters {
            uri: ext.uri.clone(),
            id: ext.id,
            encrypt: false,
        })
        .collect();

    let mut codecs = vec![media_codec];
    codecs.extend(rtx);

    Some(AcceptedMedia {
        kind,
        mid: mid.clone(),
        rtp_parameters: RtpParameters {
            mid: Some(mid),
            codecs,
            header_extensions,
            encodings: vec![encoding],
            rtcp: RtcpParameters {
                cname: Some(cname),
                reduced_size: true,
            },
        },
    })
}

fn to_sdp_candidate(candidate: &crate::engine::IceCandidate) -> Candidate {
    Candidate {
        foundation: candidate.foundation.clone(),
        component: 1,
        transport: candidate.protocol.as_str().to_string(),
        priority: candidate.priority,
        ip: candidate.ip.clone(),
        port: candidate.port,
        candidate_type: candidate.candidate_type.clone(),
        tcp_type: candidate.tcp_type.clone(),
    }
}

/// Render the answer for `offer` given what was accepted per section
#[must_use]
pub fn build_answer(
    offer: &SessionDescription,
    accepted: &[Option<AcceptedMedia>],
    transport: &dyn Transport,
) -> SessionDescription {
    let ice = transport.ice_parameters();
    let candidates: Vec<Candidate> = transport.ice_candidates().iter().map(to_sdp_candidate).collect();
    let fingerprint = transport
        .dtls_parameters()
        .preferred_fingerprint()
        .map(|fp| Fingerprint {
            algorithm: fp.algorithm.clone(),
            hash: fp.value.clone(),
        });
    let connection_ip = candidates
        .first()
        .map_or_else(|| "0.0.0.0".to_string(), |c| c.ip.clone());

    let mut media = Vec::with_capacity(offer.media.len());
    for (index, offered) in offer.media.iter().enumerate() {
        let mid = offered.mid.clone().unwrap_or_else(|| index.to_string());

        let section = match accepted.get(index).and_then(Option::as_ref) {
            Some(accepted) => {
                let pts = accepted.payload_types();
                let mut section = MediaDescription::new(&offered.media, 9, &offered.protocol);
                section.formats = pts.iter().map(u8::to_string).collect();
                section.connection = Some(connection_ip.clone());
                section.mid = Some(mid);
                section.direction = Some(Direction::RecvOnly);
                section.ice_ufrag = Some(ice.username_fragment.clone());
                section.ice_pwd = Some(ice.password.clone());
                section.ice_options = Some("ice2".to_string());
                section.fingerprint = fingerprint.clone();
                section.setup = Some("active".to_string());
                section.rtcp_mux = true;
                section.rtcp_rsize = true;
                section.rtpmaps = offered
                    .rtpmaps
                    .iter()
                    .filter(|r| pts.contains(&r.payload_type))
                    .cloned()
                    .collect();
                section.fmtps = offered
                    .fmtps
                    .iter()
                    .filter(|f| pts.contains(&f.payload_type))
                    .cloned()
                    .collect();
                section.rtcp_fbs = offered
                    .rtcp_fbs
                    .iter()
                    .filter(|fb| fb.payload_type.map_or(true, |pt| pts.contains(&pt)))
                    .cloned()
                    .collect();
                section.extmaps = accepted
                    .rtp_parameters
                    .header_extensions
                    .iter()
                    .map(|ext| ExtMap {
                        id: ext.id,
                        direction: None,
                        uri: ext.uri.clone(),
                    })
                    .collect();
                section.candidates = candidates.clone();
                section.end_of_candidates = true;
                section
            }
            None => {
                let mut section = MediaDescription::new(&offered.media, 0, &offered.protocol);
                section.formats = offered.formats.iter().take(1).cloned().collect();
                section.mid = Some(mid);
                section.direction = Some(Direction::Inactive);
                section
            }
        };
        media.push(section);
    }

    let groups = match offer.bundle_group() {
        Some(_) => {
            let mids: Vec<String> = accepted.iter().flatten().map(|a| a.mid.clone()).collect();
            if mids.is_empty() {
                Vec::new()
            } else {
                vec![Group {
                    semantics: "BUNDLE".to_string(),
                    mids,
                }]
            }
        }
        None => Vec::new(),
    };

    let session_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());

    SessionDescription {
        origin: Origin {
            username: "whipcast".to_string(),
            session_id: session_id.to_string(),
            session_version: "1".to_string(),
            ..Origin::default()
        },
        session_name: "-".to_string(),
        ice_lite: ice.ice_lite,
        groups,
        media,
        ..SessionDescription::default()
    }
}

/// Undo what a failed publish created
///
/// `owns_stream` is set when this request created the stream or connected its
/// ingest transport; such a stream is unusable for anyone else and goes too.
fn rollback(
    manager: &StreamManager,
    stream: &Stream,
    owns_stream: bool,
    producers: &[Arc<dyn Producer>],
) {
    for producer in producers {
        stream.remove_producer(producer.id());
        producer.close();
    }
    if owns_stream {
        manager.remove_stream(stream.id());
    }
}

/// Handle `POST /whip/{streamId}`: negotiate and return the SDP answer
pub async fn publish(manager: &StreamManager, stream_id: &StreamId, offer_sdp: &str) -> SfuResult<String> {
    let offer = SessionDescription::parse(offer_sdp)?;
    let credentials = remote_credentials(&offer)?;

    let preference = manager.media_config().preferred_video_codec;
    let accepted: Vec<Option<AcceptedMedia>> = offer
        .media
        .iter()
        .enumerate()
        .map(|(index, section)| accept_section(section, index, stream_id, preference))
        .collect();
    if accepted.iter().all(Option::is_none) {
        return Err(SfuError::MalformedOffer(
            "offer contains no supported media the publisher sends".to_string(),
        ));
    }

    let (stream, created) = manager.get_or_create_stream(stream_id).await?;
    let Some(transport) = manager.ingest_transport(stream_id) else {
        if created {
            manager.remove_stream(stream_id);
        }
        return Err(SfuError::TransportFailure(format!(
            "stream {stream_id} has no ingest transport"
        )));
    };

    let connect = transport
        .connect(ConnectParameters {
            dtls_parameters: credentials.dtls,
            ice_parameters: Some(credentials.ice),
        })
        .await;
    match connect {
        Ok(()) => {}
        // someone else owns this stream's publish; leave their stream alone
        Err(EngineError::AlreadyConnected(_)) => {
            return Err(SfuError::AlreadyPublishing(stream_id.clone()));
        }
        Err(e) => {
            rollback(manager, &stream, created, &[]);
            return Err(e.into());
        }
    }

    let mut producers: Vec<Arc<dyn Producer>> = Vec::new();
    for media in accepted.iter().flatten() {
        let result = transport
            .produce(media.kind, media.rtp_parameters.clone())
            .await
            .map_err(SfuError::from)
            .and_then(|producer| {
                producers.push(Arc::clone(&producer));
                stream.add_producer(producer)
            });

        if let Err(e) = result {
            warn!(stream_id = %stream_id, mid = %media.mid, error = %e, "Publish failed, rolling back");
            // this request connected the transport, so the stream is its to drop
            rollback(manager, &stream, true, &producers);
            return Err(e);
        }
    }

    let answer = build_answer(&offer, &accepted, transport.as_ref());
    manager.mark_stream_started(&stream);

    info!(
        stream_id = %stream_id,
        producers = producers.len(),
        sections = offer.media.len(),
        "WHIP publish negotiated"
    );
    Ok(answer.to_string())
}

/// Handle `DELETE /whip/{streamId}`
pub fn unpublish(manager: &StreamManager, stream_id: &StreamId) -> bool {
    manager.remove_stream(stream_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 102 103 104\r\n\
a=ice-ufrag:u\r\n\
a=ice-pwd:p\r\n\
a=fingerprint:sha-256 AA\r\n\
a=mid:v\r\n\
a=sendonly\r\n\
a=extmap:4 http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time\r\n\
a=extmap:13 urn:3gpp:video-orientation\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:96 nack pli\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f\r\n\
a=rtpmap:103 H264/90000\r\n\
a=fmtp:103 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
a=rtpmap:104 rtx/90000\r\n\
a=fmtp:104 apt=999\r\n";

    fn section(sdp: &str) -> MediaDescription {
        SessionDescription::parse(sdp).unwrap().media.remove(0)
    }

    #[test]
    fn test_vp8_preference_keeps_vp8_and_its_rtx() {
        let accepted =
            accept_section(&section(VIDEO), 0, &"s".into(), VideoCodecPreference::Vp8).unwrap();
        assert_eq!(accepted.kind, MediaKind::Video);
        assert_eq!(accepted.mid, "v");
        assert_eq!(accepted.payload_types(), vec![96, 97]);
        assert_eq!(accepted.rtp_parameters.codecs[0].rtcp_feedback[0].parameter, "pli");
        assert_eq!(accepted.rtp_parameters.header_extensions.len(), 1);
    }

    #[test]
    fn test_h264_preference_prefers_packetization_mode_one() {
        let accepted =
            accept_section(&section(VIDEO), 0, &"s".into(), VideoCodecPreference::H264).unwrap();
        // 104 claims apt=999 which was never accepted
        assert_eq!(accepted.payload_types(), vec![103]);
        assert_eq!(
            parameter_str(&accepted.rtp_parameters.codecs[0].parameters, "packetization-mode")
                .as_deref(),
            Some("1")
        );
    }

    #[test]
    fn test_unforwarded_h264_mode_falls_back_to_vp8() {
        let offer = "v=0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 102\r\n\
a=mid:v\r\n\
a=sendonly\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 packetization-mode=2;profile-level-id=42e01f\r\n";
        let accepted =
            accept_section(&section(offer), 0, &"s".into(), VideoCodecPreference::H264).unwrap();
        assert_eq!(accepted.payload_types(), vec![96]);
        assert_eq!(accepted.rtp_parameters.codecs[0].mime_type, "video/VP8");

        let h264_only = offer.replace(" 96 102", " 102").replace("a=rtpmap:96 VP8/90000\r\n", "");
        assert!(
            accept_section(&section(&h264_only), 0, &"s".into(), VideoCodecPreference::H264)
                .is_none()
        );
    }

    #[test]
    fn test_non_sending_sections_are_rejected() {
        let recv = VIDEO.replace("a=sendonly", "a=recvonly");
        assert!(accept_section(&section(&recv), 0, &"s".into(), VideoCodecPreference::Vp8).is_none());
        let app = "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";
        assert!(accept_section(&section(app), 0, &"s".into(), VideoCodecPreference::Vp8).is_none());
    }

    #[test]
    fn test_ssrc_selection_order() {
        let stream_id = StreamId::from("s");
        let grouped = format!("{VIDEO}a=ssrc-group:FID 10 11\r\na=ssrc:9 cname:x\r\n");
        assert_eq!(select_ssrcs(&section(&grouped), &stream_id, "v"), (10, Some(11)));

        let cname = format!("{VIDEO}a=ssrc:8 msid:a b\r\na=ssrc:9 cname:x\r\n");
        assert_eq!(select_ssrcs(&section(&cname), &stream_id, "v"), (9, None));

        let first = format!("{VIDEO}a=ssrc:8 msid:a b\r\n");
        assert_eq!(select_ssrcs(&section(&first), &stream_id, "v"), (8, None));

        let (synth, rtx) = select_ssrcs(&section(VIDEO), &stream_id, "v");
        assert_eq!(rtx, None);
        assert_ne!(synth, 0);
        assert_eq!(synth, synthesize_ssrc(&stream_id, "v"));
        assert_ne!(synth, synthesize_ssrc(&stream_id, "a"));
    }

    #[test]
    fn test_missing_credentials_is_malformed() {
        let offer = SessionDescription::parse(&VIDEO.replace("a=ice-pwd:p\r\n", "")).unwrap();
        assert!(matches!(
            remote_credentials(&offer),
            Err(SfuError::MalformedOffer(_))
        ));
    }
}
