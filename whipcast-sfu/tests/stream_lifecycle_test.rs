// End-to-end flows against the local media engine:
// publish over WHIP, view over signaling, tear down from every trigger.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use whipcast_core::config::{MediaConfig, VideoCodecPreference, WorkerDeathPolicy};
use whipcast_core::events::{DomainEvent, EventPublisher, EventType};
use whipcast_sfu::engine::local::{LocalEngine, LocalEngineOptions};
use whipcast_sfu::engine::{Producer, RtpCapabilities, Worker};
use whipcast_sfu::sdp::{Direction, SessionDescription};
use whipcast_sfu::{
    whip, ClientRequest, MediaKind, Reply, SessionState, SfuError, SignalingSession, StreamId,
    StreamManager, ViewerNotice, WorkerPool,
};

const OFFER: &str = "v=0\r\n\
o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=ice-ufrag:pubufrag\r\n\
a=ice-pwd:pubpasswordpubpassword\r\n\
a=fingerprint:sha-256 3A:1F:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=setup:actpass\r\n\
a=rtcp-mux\r\n\
a=extmap:1 urn:ietf:params:rtp-hdrext:sdes:mid\r\n\
a=extmap:10 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtcp-fb:111 transport-cc\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=ssrc:1001 cname:publisher\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 99\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=setup:actpass\r\n\
a=rtcp-mux\r\n\
a=extmap:1 urn:ietf:params:rtp-hdrext:sdes:mid\r\n\
a=extmap:13 urn:3gpp:video-orientation\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:* nack\r\n\
a=rtcp-fb:96 nack pli\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 VP9/90000\r\n\
a=rtpmap:99 rtx/90000\r\n\
a=fmtp:99 apt=98\r\n\
a=ssrc-group:FID 2001 2002\r\n\
a=ssrc:2001 cname:publisher\r\n\
a=ssrc:2002 cname:publisher\r\n";

struct Harness {
    engine: Arc<LocalEngine>,
    manager: Arc<StreamManager>,
    events: mpsc::Receiver<DomainEvent>,
    shutdown: CancellationToken,
}

async fn harness(policy: WorkerDeathPolicy) -> Harness {
    harness_with(MediaConfig {
        stats_interval_secs: 0,
        on_worker_death: policy,
        ..MediaConfig::default()
    })
    .await
}

async fn harness_with(media: MediaConfig) -> Harness {
    let engine = Arc::new(LocalEngine::new(&LocalEngineOptions::default()));
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::start(engine.clone(), 2, media.on_worker_death, shutdown.clone())
        .await
        .unwrap();
    let (publisher, events) = EventPublisher::channel(256);
    Harness {
        engine,
        manager: StreamManager::new(media, pool, publisher),
        events,
        shutdown,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn drain(events: &mut mpsc::Receiver<DomainEvent>) -> Vec<EventType> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    seen
}

fn session(manager: &Arc<StreamManager>) -> (SignalingSession, mpsc::Receiver<ViewerNotice>) {
    let (tx, rx) = mpsc::channel(8);
    (SignalingSession::new(Arc::clone(manager), tx), rx)
}

fn router_caps(manager: &StreamManager, stream_id: &str) -> RtpCapabilities {
    manager
        .get_router(&stream_id.into())
        .unwrap()
        .rtp_capabilities()
}

async fn join(session: &mut SignalingSession, stream_id: &str) -> Reply {
    session
        .handle(ClientRequest::JoinStream {
            stream_id: stream_id.into(),
            rtp_capabilities: None,
        })
        .await
}

#[tokio::test]
async fn test_publish_answers_two_recvonly_sections() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    let stream_id = StreamId::from("cam");

    let answer = whip::publish(&h.manager, &stream_id, OFFER).await.unwrap();
    let answer = SessionDescription::parse(&answer).unwrap();

    assert!(answer.ice_lite);
    assert_eq!(answer.media.len(), 2);
    assert!(answer
        .media
        .iter()
        .all(|m| m.direction() == Direction::RecvOnly && m.port == 9));
    assert_eq!(answer.media[0].formats, vec!["111"]);
    // VP9 and its RTX are dropped, VP8 keeps its RTX
    assert_eq!(answer.media[1].formats, vec!["96", "97"]);
    assert_eq!(answer.bundle_group().unwrap().mids, vec!["0", "1"]);

    let video = &answer.media[1];
    assert_eq!(video.setup.as_deref(), Some("active"));
    assert!(video.rtcp_mux && video.rtcp_rsize && video.end_of_candidates);
    assert!(!video.candidates.is_empty());
    assert_eq!(video.fingerprint.as_ref().unwrap().algorithm, "sha-256");
    assert!(video.ice_ufrag.is_some() && video.ice_pwd.is_some());
    assert!(video.extmaps.iter().all(|e| e.uri != "urn:3gpp:video-orientation"));

    let stream = h.manager.get_stream(&stream_id).unwrap();
    assert_eq!(stream.producer_kinds(), vec![MediaKind::Audio, MediaKind::Video]);
    let video_params = stream.producer(MediaKind::Video).unwrap().rtp_parameters();
    assert_eq!(video_params.payload_types(), vec![96, 97]);
    assert_eq!(video_params.encodings[0].ssrc, Some(2001));
    assert_eq!(video_params.encodings[0].rtx.map(|r| r.ssrc), Some(2002));
}

#[tokio::test]
async fn test_publish_rejects_bad_offers_without_leaving_state() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    let stream_id = StreamId::from("cam");

    assert!(matches!(
        whip::publish(&h.manager, &stream_id, "not sdp").await,
        Err(SfuError::MalformedOffer(_))
    ));

    let no_fingerprint: String = OFFER
        .lines()
        .filter(|l| !l.starts_with("a=fingerprint"))
        .map(|l| format!("{l}\r\n"))
        .collect();
    assert!(matches!(
        whip::publish(&h.manager, &stream_id, &no_fingerprint).await,
        Err(SfuError::MalformedOffer(_))
    ));

    assert!(h.manager.get_stream(&stream_id).is_none());
    assert!(h.manager.get_router(&stream_id).is_err());
}

/// OFFER with the audio section announcing the video section's primary SSRC
fn offer_with_ssrc_clash() -> String {
    OFFER.replace("a=ssrc:1001 cname:publisher", "a=ssrc:2001 cname:publisher")
}

#[tokio::test]
async fn test_publish_skips_h264_modes_the_router_does_not_forward() {
    let h = harness_with(MediaConfig {
        stats_interval_secs: 0,
        preferred_video_codec: VideoCodecPreference::H264,
        ..MediaConfig::default()
    })
    .await;
    let offer = OFFER.replace(
        "a=rtpmap:98 VP9/90000\r\n",
        "a=rtpmap:98 H264/90000\r\na=fmtp:98 packetization-mode=2;profile-level-id=42e01f\r\n",
    );

    let answer = whip::publish(&h.manager, &"cam".into(), &offer).await.unwrap();
    let answer = SessionDescription::parse(&answer).unwrap();
    assert_eq!(answer.media[1].formats, vec!["96", "97"]);

    let video = h
        .manager
        .get_stream(&"cam".into())
        .unwrap()
        .producer(MediaKind::Video)
        .unwrap();
    assert_eq!(video.rtp_parameters().codecs[0].mime_type, "video/VP8");
}

#[tokio::test]
async fn test_failed_produce_rolls_back_created_stream() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    let stream_id = StreamId::from("cam");

    let result = whip::publish(&h.manager, &stream_id, &offer_with_ssrc_clash()).await;
    assert!(matches!(result, Err(SfuError::Engine(_))));

    assert!(h.manager.get_stream(&stream_id).is_none());
    assert!(h.manager.get_router(&stream_id).is_err());
    assert!(h.manager.ingest_transport(&stream_id).is_none());

    whip::publish(&h.manager, &stream_id, OFFER).await.unwrap();
    assert_eq!(h.manager.get_stream(&stream_id).unwrap().producers().len(), 2);
}

#[tokio::test]
async fn test_failed_produce_drops_stream_it_connected() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    let stream_id = StreamId::from("cam");

    // another request created the stream but never connected it
    let (_, created) = h.manager.get_or_create_stream(&stream_id).await.unwrap();
    assert!(created);

    let result = whip::publish(&h.manager, &stream_id, &offer_with_ssrc_clash()).await;
    assert!(matches!(result, Err(SfuError::Engine(_))));
    assert!(h.manager.get_stream(&stream_id).is_none());

    // the id is free again rather than stuck behind a connected, empty stream
    whip::publish(&h.manager, &stream_id, OFFER).await.unwrap();
}

#[tokio::test]
async fn test_second_publisher_gets_already_publishing() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    let stream_id = StreamId::from("cam");

    whip::publish(&h.manager, &stream_id, OFFER).await.unwrap();
    assert!(matches!(
        whip::publish(&h.manager, &stream_id, OFFER).await,
        Err(SfuError::AlreadyPublishing(_))
    ));
    // the first publisher is untouched
    assert_eq!(h.manager.get_stream(&stream_id).unwrap().producers().len(), 2);
}

#[tokio::test]
async fn test_concurrent_publishes_create_one_stream() {
    let mut h = harness(WorkerDeathPolicy::Restart).await;
    let stream_id = StreamId::from("cam");

    let attempts: Vec<_> = (0..6)
        .map(|_| {
            let manager = Arc::clone(&h.manager);
            let stream_id = stream_id.clone();
            tokio::spawn(async move { whip::publish(&manager, &stream_id, OFFER).await })
        })
        .collect();

    let mut accepted = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert!(matches!(e, SfuError::AlreadyPublishing(_)), "{e}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(h.manager.stream_count(), 1);
    let starts = drain(&mut h.events)
        .into_iter()
        .filter(|e| *e == EventType::StreamStart)
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn test_viewer_flow_join_connect_consume_resume() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    whip::publish(&h.manager, &"cam".into(), OFFER).await.unwrap();
    let caps = router_caps(&h.manager, "cam");

    let (mut viewer, _notices) = session(&h.manager);

    let reply = viewer
        .handle(ClientRequest::GetRouterRtpCapabilities {
            stream_id: "cam".into(),
        })
        .await;
    assert!(matches!(reply, Reply::Capabilities(_)));
    assert_eq!(viewer.state(), SessionState::CapabilitiesExchanged);

    let Reply::Transport(info) = join(&mut viewer, "cam").await else {
        panic!("join failed");
    };
    assert!(!info.ice_candidates.is_empty());
    assert_eq!(h.manager.get_stream(&"cam".into()).unwrap().viewer_count(), 1);

    let reply = viewer
        .handle(ClientRequest::ConnectTransport {
            transport_id: info.id.clone(),
            dtls_parameters: info.dtls_parameters.clone(),
        })
        .await;
    assert_eq!(reply, Reply::Status("connected"));

    let Reply::Consumers(consumers) = viewer
        .handle(ClientRequest::Consume {
            stream_id: "cam".into(),
            rtp_capabilities: Some(caps),
        })
        .await
    else {
        panic!("consume failed");
    };
    assert_eq!(consumers.len(), 2);
    assert_eq!(viewer.state(), SessionState::Consuming);

    let reply = viewer
        .handle(ClientRequest::Resume {
            consumer_id: consumers[0].id.clone(),
        })
        .await;
    assert_eq!(reply, Reply::Empty);

    let reply = viewer
        .handle(ClientRequest::RequestKeyFrame {
            consumer_id: consumers[1].id.clone(),
        })
        .await;
    assert_eq!(reply, Reply::Success { success: true });
}

#[tokio::test]
async fn test_consume_skips_incompatible_producers() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    whip::publish(&h.manager, &"cam".into(), OFFER).await.unwrap();
    let mut caps = router_caps(&h.manager, "cam");
    caps.codecs.retain(|c| c.kind == MediaKind::Audio);

    let (mut viewer, _notices) = session(&h.manager);
    join(&mut viewer, "cam").await;
    let Reply::Consumers(consumers) = viewer
        .handle(ClientRequest::Consume {
            stream_id: "cam".into(),
            rtp_capabilities: Some(caps),
        })
        .await
    else {
        panic!("consume failed");
    };
    assert_eq!(consumers.len(), 1);
    assert_eq!(consumers[0].kind, MediaKind::Audio);
}

#[tokio::test]
async fn test_consume_on_stream_without_producers_is_empty() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    h.manager.get_or_create_stream(&"cam".into()).await.unwrap();
    let caps = router_caps(&h.manager, "cam");

    let (mut viewer, _notices) = session(&h.manager);
    assert!(matches!(join(&mut viewer, "cam").await, Reply::Transport(_)));
    let reply = viewer
        .handle(ClientRequest::Consume {
            stream_id: "cam".into(),
            rtp_capabilities: Some(caps),
        })
        .await;
    assert_eq!(reply, Reply::Consumers(vec![]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consume_racing_teardown_never_panics() {
    let h = harness(WorkerDeathPolicy::Restart).await;

    for round in 0..20 {
        let stream_id = StreamId::from(format!("race-{round}"));
        whip::publish(&h.manager, &stream_id, OFFER).await.unwrap();
        let caps = router_caps(&h.manager, stream_id.as_str());

        let (mut viewer, _notices) = session(&h.manager);
        assert!(matches!(join(&mut viewer, stream_id.as_str()).await, Reply::Transport(_)));

        let consume = {
            let stream_id = stream_id.clone();
            tokio::spawn(async move {
                viewer
                    .handle(ClientRequest::Consume {
                        stream_id,
                        rtp_capabilities: Some(caps),
                    })
                    .await
            })
        };
        let teardown = {
            let manager = Arc::clone(&h.manager);
            let stream_id = stream_id.clone();
            tokio::spawn(async move { whip::unpublish(&manager, &stream_id) })
        };

        assert!(teardown.await.unwrap());
        match consume.await.unwrap() {
            Reply::Consumers(consumers) => assert!(consumers.len() <= 2),
            Reply::Error { error } => assert_eq!(error, "Stream not found"),
            other => panic!("unexpected consume reply: {other:?}"),
        }
        assert!(h.manager.get_stream(&stream_id).is_none());
    }
}

#[tokio::test]
async fn test_unknown_streams_and_consumers() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    let (mut viewer, _notices) = session(&h.manager);

    let not_found = Reply::Error {
        error: "Stream not found".to_string(),
    };
    assert_eq!(join(&mut viewer, "ghost").await, not_found);
    assert_eq!(
        viewer
            .handle(ClientRequest::GetRouterRtpCapabilities {
                stream_id: "ghost".into()
            })
            .await,
        not_found
    );
    assert_eq!(
        viewer
            .handle(ClientRequest::Consume {
                stream_id: "ghost".into(),
                rtp_capabilities: Some(RtpCapabilities::default()),
            })
            .await,
        not_found
    );

    // unknown consumer: no-op and the session keeps working
    assert_eq!(
        viewer
            .handle(ClientRequest::Resume {
                consumer_id: "nope".into()
            })
            .await,
        Reply::Empty
    );
    assert!(matches!(
        viewer
            .handle(ClientRequest::RequestKeyFrame {
                consumer_id: "nope".into()
            })
            .await,
        Reply::Error { .. }
    ));
    assert_eq!(viewer.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_text_frames_carry_ack() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    let (mut viewer, _notices) = session(&h.manager);

    let reply = viewer
        .handle_text(r#"{"event":"resume","data":{"consumerId":"x"},"ack":7}"#)
        .await
        .unwrap();
    assert_eq!(serde_json::from_str::<Value>(&reply).unwrap(), json!({ "ack": 7, "data": null }));

    let reply = viewer
        .handle_text(r#"{"event":"fly","data":{},"ack":"a1"}"#)
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["ack"], json!("a1"));
    assert!(reply["data"]["error"].is_string());

    assert!(viewer.handle_text("{not json").await.is_none());
    assert!(viewer
        .handle_text(r#"{"event":"resume","data":{"consumerId":"x"}}"#)
        .await
        .is_none());
}

#[tokio::test]
async fn test_disconnect_removes_viewer_everywhere() {
    let mut h = harness(WorkerDeathPolicy::Restart).await;
    whip::publish(&h.manager, &"cam".into(), OFFER).await.unwrap();

    let (mut viewer, _notices) = session(&h.manager);
    join(&mut viewer, "cam").await;
    let viewer_id = viewer.viewer_id().clone();
    assert!(h.manager.viewer_transport(&viewer_id).is_some());
    assert_eq!(h.manager.get_stream(&"cam".into()).unwrap().viewer_count(), 1);

    viewer.disconnect();
    viewer.disconnect();
    drop(viewer);

    assert_eq!(h.manager.get_stream(&"cam".into()).unwrap().viewer_count(), 0);
    assert!(h.manager.viewer_transport(&viewer_id).is_none());

    let events = drain(&mut h.events);
    assert_eq!(events.iter().filter(|e| **e == EventType::ViewerJoin).count(), 1);
    assert_eq!(events.iter().filter(|e| **e == EventType::ViewerLeave).count(), 1);
}

#[tokio::test]
async fn test_rejoin_leaves_previous_stream() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    whip::publish(&h.manager, &"a".into(), OFFER).await.unwrap();
    whip::publish(&h.manager, &"b".into(), OFFER).await.unwrap();

    let (mut viewer, _notices) = session(&h.manager);
    join(&mut viewer, "a").await;
    assert!(matches!(join(&mut viewer, "b").await, Reply::Transport(_)));

    assert_eq!(h.manager.get_stream(&"a".into()).unwrap().viewer_count(), 0);
    assert_eq!(h.manager.get_stream(&"b".into()).unwrap().viewer_count(), 1);
    assert_eq!(viewer.joined_stream(), Some(&StreamId::from("b")));

    let reply = viewer
        .handle(ClientRequest::LeaveStream {
            stream_id: "b".into(),
        })
        .await;
    assert_eq!(reply, Reply::Success { success: true });
    assert_eq!(h.manager.get_stream(&"b".into()).unwrap().viewer_count(), 0);
    assert!(h.manager.viewer_transport(viewer.viewer_id()).is_none());
}

#[tokio::test]
async fn test_ingest_dtls_close_tears_stream_down() {
    let mut h = harness(WorkerDeathPolicy::Restart).await;
    let stream_id = StreamId::from("cam");
    whip::publish(&h.manager, &stream_id, OFFER).await.unwrap();
    let caps = router_caps(&h.manager, "cam");

    let (mut viewer, mut notices) = session(&h.manager);
    join(&mut viewer, "cam").await;
    let Reply::Consumers(consumers) = viewer
        .handle(ClientRequest::Consume {
            stream_id: "cam".into(),
            rtp_capabilities: Some(caps),
        })
        .await
    else {
        panic!("consume failed");
    };
    assert_eq!(consumers.len(), 2);

    let stream = h.manager.get_stream(&stream_id).unwrap();
    let router = Arc::clone(stream.router());
    let producers = stream.producers();

    h.manager.ingest_transport(&stream_id).unwrap().close();

    let manager = Arc::clone(&h.manager);
    let id = stream_id.clone();
    wait_until(move || manager.get_stream(&id).is_none()).await;

    assert!(router.is_closed());
    assert!(producers.iter().all(|p| p.is_closed()));
    assert!(h.manager.get_router(&stream_id).is_err());
    assert_eq!(
        notices.recv().await.unwrap(),
        ViewerNotice::StreamEnded {
            stream_id: stream_id.clone()
        }
    );
    assert_eq!(
        viewer
            .handle(ClientRequest::GetRouterRtpCapabilities {
                stream_id: stream_id.clone()
            })
            .await,
        Reply::Error {
            error: "Stream not found".to_string()
        }
    );

    // the attached viewer leaves with the stream, and disconnecting later adds nothing
    viewer.disconnect();
    let events = drain(&mut h.events);
    assert_eq!(
        events,
        vec![
            EventType::StreamStart,
            EventType::ViewerJoin,
            EventType::ViewerLeave,
            EventType::StreamStop
        ]
    );

    // the stream can be published again under the same id
    whip::publish(&h.manager, &stream_id, OFFER).await.unwrap();
    assert!(h.manager.get_stream(&stream_id).is_some());
}

#[tokio::test]
async fn test_worker_death_tears_down_hosted_streams() {
    let h = harness(WorkerDeathPolicy::Restart).await;
    whip::publish(&h.manager, &"a".into(), OFFER).await.unwrap();
    whip::publish(&h.manager, &"b".into(), OFFER).await.unwrap();

    let worker_a = h.manager.get_router(&"a".into()).unwrap().worker_id().clone();
    let worker = h
        .engine
        .workers()
        .into_iter()
        .find(|w| w.id() == &worker_a)
        .unwrap();
    worker.kill("test");

    let manager = Arc::clone(&h.manager);
    wait_until(move || manager.get_stream(&"a".into()).is_none()).await;
    assert!(h.manager.get_stream(&"b".into()).is_some());
    assert!(!h.shutdown.is_cancelled());

    // the restarted slot keeps accepting new streams
    whip::publish(&h.manager, &"a".into(), OFFER).await.unwrap();
}

#[tokio::test]
async fn test_fail_fast_worker_death_requests_shutdown() {
    let h = harness(WorkerDeathPolicy::FailFast).await;
    whip::publish(&h.manager, &"cam".into(), OFFER).await.unwrap();

    for worker in h.engine.workers() {
        worker.kill("test");
    }

    let shutdown = h.shutdown.clone();
    wait_until(move || shutdown.is_cancelled()).await;
    let manager = Arc::clone(&h.manager);
    wait_until(move || manager.stream_count() == 0).await;
}

#[tokio::test]
async fn test_delete_is_idempotent_and_emits_stop_once() {
    let mut h = harness(WorkerDeathPolicy::Restart).await;
    let stream_id = StreamId::from("cam");
    whip::publish(&h.manager, &stream_id, OFFER).await.unwrap();

    assert!(whip::unpublish(&h.manager, &stream_id));
    assert!(!whip::unpublish(&h.manager, &stream_id));
    assert!(!whip::unpublish(&h.manager, &"never".into()));

    let stops = drain(&mut h.events)
        .into_iter()
        .filter(|e| *e == EventType::StreamStop)
        .count();
    assert_eq!(stops, 1);
    assert!(h.manager.list().is_empty());
}
