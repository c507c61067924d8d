// End-to-end session tests over the in-memory backend
//
// The test plays the model backend: it reads the frames the session sends and
// scripts the server frames the session receives.

mod common;

use anyhow::Result;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use voice_session::audio::CaptureConfig;
use voice_session::error::ConnectionError;
use voice_session::protocol::{ConnectionState, TransportEvent};
use voice_session::recognition::{RecognitionConfig, RecognitionSignal};
use voice_session::turn::TurnState;
use voice_session::{EventBus, MessageKind, Session, SessionConfig, SessionEvent};

const PCM_MIME: &str = "audio/pcm;rate=24000";

async fn start_session(
    backend: &Arc<MockBackend>,
    output: &Arc<RecordingOutput>,
) -> Result<(Session, MockServer, broadcast::Receiver<SessionEvent>)> {
    let events = EventBus::new();
    let rx = events.subscribe();

    let session = Session::builder(SessionConfig::default(), output.clone())
        .backend(backend.clone())
        .events(events)
        .start()
        .await?;

    let mut server = backend.take_server()?;
    let setup = server.next_frame().await?;
    assert!(setup.get("setup").is_some(), "first frame must be setup: {}", setup);

    Ok((session, server, rx))
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn text_messages(events: &[SessionEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Message {
                kind: MessageKind::Text,
                content,
                is_complete,
            } => Some((content.clone(), *is_complete)),
            _ => None,
        })
        .collect()
}

fn is_turn_complete(e: &SessionEvent) -> bool {
    matches!(e, SessionEvent::TurnComplete { .. })
}

#[tokio::test]
async fn test_streamed_text_turn_completes_once() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, server, mut rx) = start_session(&backend, &output).await?;

    server.send(text_part("H")).await?;
    server.send(text_part("He")).await?;
    server.send(text_part("Hello there!")).await?;
    server.send(turn_complete()).await?;

    let events = collect_until(&mut rx, is_turn_complete).await?;

    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Connected { backend } if backend == "primary")));

    let messages = text_messages(&events);
    assert_eq!(
        messages,
        vec![
            ("H".to_string(), false),
            ("He".to_string(), false),
            ("Hello there!".to_string(), false),
            ("Hello there!".to_string(), true),
        ]
    );
    assert_eq!(messages.iter().filter(|(_, complete)| *complete).count(), 1);

    // Text-only turn: spoken exactly once
    assert!(eventually(|| output.spoken().len() == 1).await);
    assert_eq!(output.spoken(), vec!["Hello there!".to_string()]);
    assert!(output.played().is_empty());
    assert_eq!(session.stats().playback_invocations, 1);
    assert_eq!(session.stats().turns_completed, 1);
    assert_eq!(session.turn_state(), TurnState::Idle);

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_audio_turn_plays_assembled_container() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, server, mut rx) = start_session(&backend, &output).await?;

    let first: Vec<u8> = (0..480u32).map(|i| (i % 251) as u8).collect();
    let second: Vec<u8> = vec![7u8; 480];
    server.send(audio_part(PCM_MIME, &first)).await?;
    server.send(audio_part(PCM_MIME, &second)).await?;
    server.send(turn_complete()).await?;

    let events = collect_until(&mut rx, is_turn_complete).await?;
    let audio_messages = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Message { kind: MessageKind::Audio, .. }))
        .count();
    assert_eq!(audio_messages, 2);

    assert!(eventually(|| output.played().len() == 1).await);
    let played = output.played().remove(0);
    assert_eq!(played.bytes.len(), 44 + 960);
    assert_eq!(&played.bytes[44..524], first.as_slice());
    assert_eq!(&played.bytes[524..], second.as_slice());

    // The container must be readable by a real WAV decoder
    let reader = hound::WavReader::new(std::io::Cursor::new(played.bytes.clone()))?;
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 24000);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), 480);

    // Audio present: the text is not spoken on top of it
    assert!(output.spoken().is_empty());

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_interrupted_turn_is_discarded() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, server, mut rx) = start_session(&backend, &output).await?;

    server.send(text_part("I was saying")).await?;
    server.send(audio_part(PCM_MIME, &[1u8; 960])).await?;
    server.send(interrupted()).await?;
    // A late turnComplete for the dead turn must not complete it
    server.send(turn_complete()).await?;

    let events = collect_until(&mut rx, |e| matches!(e, SessionEvent::Interrupted { .. })).await?;
    let interrupted_turn = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::Interrupted { turn } => Some(*turn),
            _ => None,
        })
        .unwrap();

    // Next turn proves the buffers were reset
    server.send(text_part("New answer")).await?;
    server.send(turn_complete()).await?;
    let events = collect_until(&mut rx, is_turn_complete).await?;

    let completed: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::TurnComplete { turn } => Some(*turn),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 1);
    assert_ne!(completed[0], interrupted_turn);

    assert_eq!(
        text_messages(&events).last(),
        Some(&("New answer".to_string(), true))
    );
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::AudioStart { .. })));

    assert!(eventually(|| output.spoken().len() == 1).await);
    assert!(output.played().is_empty());
    assert_eq!(output.spoken(), vec!["New answer".to_string()]);

    let stats = session.stats();
    assert_eq!(stats.turns_interrupted, 1);
    assert_eq!(stats.turns_completed, 1);

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_audio_does_not_bleed_between_turns() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, server, mut rx) = start_session(&backend, &output).await?;

    server.send(audio_part(PCM_MIME, &[1u8; 240])).await?;
    server.send(turn_complete()).await?;
    collect_until(&mut rx, is_turn_complete).await?;

    server.send(audio_part(PCM_MIME, &[2u8; 480])).await?;
    server.send(turn_complete()).await?;
    collect_until(&mut rx, is_turn_complete).await?;

    assert!(eventually(|| output.played().len() == 2).await);
    let played = output.played();
    assert_eq!(played[0].data_len(), 240);
    assert_eq!(played[1].data_len(), 480);
    assert!(played[1].bytes[44..].iter().all(|&b| b == 2));
    assert!(played[0].turn < played[1].turn);

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_send_text_emits_client_content() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, mut server, _rx) = start_session(&backend, &output).await?;

    session.send_text("Hola, ¿cómo estás?").await?;

    let frame = server.next_content_frame().await?;
    let content = &frame["clientContent"];
    assert_eq!(content["turnComplete"], true);
    assert_eq!(content["turns"][0]["role"], "user");
    assert_eq!(content["turns"][0]["parts"][0]["text"], "Hola, ¿cómo estás?");

    assert!(session.wait_for_turn_state(TurnState::AwaitingModel).await);

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, mut server, mut rx) = start_session(&backend, &output).await?;

    assert!(session.close("user ended session").await);
    assert!(!session.close("again").await);

    assert_eq!(server.expect_close().await?, "user ended session");
    assert_eq!(output.releases(), 1);

    let events = collect_until(&mut rx, |e| matches!(e, SessionEvent::Close { .. })).await?;
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Close { reason }) if reason == "user ended session"
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, SessionEvent::Close { .. })));

    assert!(session.is_closed());
    assert_eq!(session.connection_state(), ConnectionState::Closed);
    assert_eq!(session.turn_state(), TurnState::Closed);
    assert!(matches!(
        session.send_text("anyone there?").await,
        Err(ConnectionError::Closed)
    ));
    Ok(())
}

#[tokio::test]
async fn test_inbound_turn_during_slow_close_is_not_played() -> Result<()> {
    // The setup frame fills the outbound buffer, so the close frame waits
    // out the full send timeout while the backend keeps talking.
    let backend = MockBackend::with_outbound_capacity("primary", 1);
    let output = RecordingOutput::new();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let config = SessionConfig {
        send_timeout_ms: 1000,
        ..SessionConfig::default()
    };

    let session = Arc::new(
        Session::builder(config, output.clone())
            .backend(backend.clone())
            .events(events)
            .start()
            .await?,
    );
    let server = backend.take_server()?;
    collect_until(&mut rx, |e| matches!(e, SessionEvent::Connected { .. })).await?;

    let closer = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.close("user ended session").await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(session.is_closed());
    // The session may already have stopped reading
    let _ = server.send(audio_part(PCM_MIME, &[3u8; 480])).await;
    let _ = server.send(text_part("too late")).await;
    let _ = server.send(turn_complete()).await;

    assert!(closer.await?);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(output.played().is_empty());
    assert!(output.spoken().is_empty());
    assert_eq!(output.releases(), 1);

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(
        e,
        SessionEvent::AudioStart { .. } | SessionEvent::TtsStart { .. } | SessionEvent::TurnComplete { .. }
    )));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Close { .. }))
            .count(),
        1
    );
    assert_eq!(session.stats().playback_invocations, 0);
    Ok(())
}

#[tokio::test]
async fn test_out_of_range_audio_format_does_not_stall_session() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, mut server, mut rx) = start_session(&backend, &output).await?;

    server
        .send(audio_part("audio/L16;channels=8192;rate=99999999", &[5u8; 480]))
        .await?;
    server.send(text_part("after")).await?;
    server.send(turn_complete()).await?;

    let events = collect_until(&mut rx, is_turn_complete).await?;
    assert_eq!(
        text_messages(&events).last(),
        Some(&("after".to_string(), true))
    );
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Close { .. })));

    // Out-of-range parameters fall back to the default layout
    assert!(eventually(|| output.played().len() == 1).await);
    let played = output.played().remove(0);
    assert_eq!(played.format, voice_session::AudioFormat::default());
    let reader = hound::WavReader::new(std::io::Cursor::new(played.bytes.clone()))?;
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, 24000);

    // Still handling traffic both ways
    assert!(!session.is_closed());
    session.send_text("¿sigues ahí?").await?;
    let frame = server.next_content_frame().await?;
    assert_eq!(frame["clientContent"]["turns"][0]["parts"][0]["text"], "¿sigues ahí?");

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, server, mut rx) = start_session(&backend, &output).await?;

    server.send_raw("{not json").await?;
    server.send_raw(r#"{"somethingElse": 1}"#).await?;
    server.send(serde_json::json!({"setupComplete": {}})).await?;
    server.send(text_part("still here")).await?;
    server.send(turn_complete()).await?;

    let events = collect_until(&mut rx, is_turn_complete).await?;
    assert_eq!(
        text_messages(&events).last(),
        Some(&("still here".to_string(), true))
    );
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));

    let stats = session.stats();
    assert_eq!(stats.protocol_errors, 2);
    assert!(!session.is_closed());

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_transport_error_ends_session() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, server, mut rx) = start_session(&backend, &output).await?;

    server.send(text_part("half a sent")).await?;
    server
        .send_event(TransportEvent::Error(ConnectionError::Fatal(
            "connection reset".to_string(),
        )))
        .await?;

    let events = collect_until(&mut rx, |e| matches!(e, SessionEvent::Close { .. })).await?;
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));
    assert!(!events.iter().any(is_turn_complete));

    assert!(session.wait_for_turn_state(TurnState::Error).await);
    assert!(session.is_closed());
    assert_eq!(session.connection_state(), ConnectionState::Error);
    assert_eq!(output.releases(), 1);

    // Closing after the transport already ended is a no-op
    assert!(!session.close("late").await);
    assert_eq!(output.releases(), 1);
    Ok(())
}

#[tokio::test]
async fn test_backend_closing_ends_session() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, server, mut rx) = start_session(&backend, &output).await?;

    server
        .send_event(TransportEvent::Closed {
            reason: "going away".to_string(),
        })
        .await?;

    let events = collect_until(&mut rx, |e| matches!(e, SessionEvent::Close { .. })).await?;
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Close { reason }) if reason == "going away"
    ));
    assert!(session.wait_for_turn_state(TurnState::Closed).await);
    Ok(())
}

#[tokio::test]
async fn test_fallback_to_second_backend() -> Result<()> {
    let first = MockBackend::failing("first", ConnectionError::Transient("503".to_string()));
    let second = MockBackend::new("second");
    let output = RecordingOutput::new();

    let session = Session::builder(SessionConfig::default(), output.clone())
        .backend(first.clone())
        .backend(second.clone())
        .start()
        .await?;

    assert_eq!(first.attempts(), 1);
    assert_eq!(second.attempts(), 1);
    assert_eq!(session.stats().backend, "second");
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    let mut server = second.take_server()?;
    assert!(server.next_frame().await?.get("setup").is_some());

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_all_backends_failing_returns_last_error() -> Result<()> {
    let first = MockBackend::failing("first", ConnectionError::Transient("503".to_string()));
    let second = MockBackend::failing("second", ConnectionError::Auth("bad key".to_string()));

    let result = Session::builder(SessionConfig::default(), RecordingOutput::new())
        .backend(first.clone())
        .backend(second.clone())
        .start()
        .await;

    assert_eq!(result.err(), Some(ConnectionError::Auth("bad key".to_string())));
    assert_eq!(first.attempts(), 1);
    assert_eq!(second.attempts(), 1);

    let result = Session::builder(SessionConfig::default(), RecordingOutput::new())
        .start()
        .await;
    assert_eq!(result.err(), Some(ConnectionError::NoBackends));
    Ok(())
}

#[tokio::test]
async fn test_autoplay_waits_for_user_gesture() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let events = EventBus::new();
    let mut rx = events.subscribe();

    let session = Session::builder(SessionConfig::default(), output.clone())
        .backend(backend.clone())
        .require_user_gesture(true)
        .events(events)
        .start()
        .await?;
    let server = backend.take_server()?;

    server.send(audio_part(PCM_MIME, &[3u8; 480])).await?;
    server.send(turn_complete()).await?;

    collect_until(&mut rx, |e| matches!(e, SessionEvent::AudioQueued { .. })).await?;
    assert!(output.played().is_empty());

    session.enable_audio();
    collect_until(&mut rx, |e| matches!(e, SessionEvent::AudioEnd { .. })).await?;
    assert_eq!(output.played().len(), 1);

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_captured_audio_is_streamed() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (mic, handle) = MockMic::new();

    let capture = CaptureConfig {
        chunk_duration_ms: 100,
        ..CaptureConfig::default()
    };
    let session = Session::builder(SessionConfig::default(), output.clone())
        .backend(backend.clone())
        .capture_device(mic, capture)
        .start()
        .await?;
    let mut server = backend.take_server()?;
    server.next_frame().await?;

    assert!(session.start_capture().await?);
    assert!(session.wait_for_turn_state(TurnState::UserSpeaking).await);

    handle.feed(vec![100i16; 1600], 16000).await?;

    let frame = server.next_frame().await?;
    let chunk = &frame["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    use base64::Engine;
    let pcm = base64::engine::general_purpose::STANDARD.decode(chunk["data"].as_str().unwrap())?;
    assert_eq!(pcm.len(), 3200);
    assert_eq!(&pcm[..2], &100i16.to_le_bytes());

    assert!(session.stop_capture().await?);
    assert!(session.wait_for_turn_state(TurnState::AwaitingModel).await);
    assert_eq!(handle.closes(), 1);

    let stats = session.end_session("done").await;
    assert_eq!(stats.fragments_captured, 1);
    assert_eq!(stats.fragments_sent, 1);
    assert_eq!(stats.fragments_dropped, 0);
    Ok(())
}

#[tokio::test]
async fn test_start_capture_without_device() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (session, _server, _rx) = start_session(&backend, &output).await?;

    assert!(matches!(
        session.start_capture().await,
        Err(voice_session::CaptureError::DeviceNotFound)
    ));
    // Text input remains usable
    session.send_text("typing instead").await?;

    session.close("done").await;
    Ok(())
}

#[tokio::test]
async fn test_final_transcript_is_sent_as_text() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (recognizer, _probe) = ScriptedRecognizer::new(vec![Run::Signals(vec![
        RecognitionSignal::Interim("buenos".to_string()),
        RecognitionSignal::Final("buenos días".to_string()),
    ])]);

    let session = Session::builder(SessionConfig::default(), output.clone())
        .backend(backend.clone())
        .recognizer(recognizer, RecognitionConfig::default())
        .start()
        .await?;
    let mut server = backend.take_server()?;

    let frame = server.next_content_frame().await?;
    assert_eq!(frame["clientContent"]["turns"][0]["parts"][0]["text"], "buenos días");

    assert!(eventually(|| session.transcript().len() == 2).await);
    let transcript = session.transcript();
    assert!(!transcript[0].is_final());
    assert!(transcript[1].is_final());

    let stats = session.end_session("done").await;
    assert_eq!(stats.transcript_events_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_recognizer_uses_session_language() -> Result<()> {
    let backend = MockBackend::new("primary");
    let output = RecordingOutput::new();
    let (recognizer, probe) = ScriptedRecognizer::new(Vec::new());
    let config = SessionConfig {
        language: "es-ES".to_string(),
        ..SessionConfig::default()
    };
    let recognition = RecognitionConfig {
        language: "en-GB".to_string(),
        ..RecognitionConfig::default()
    };

    let session = Session::builder(config, output.clone())
        .backend(backend.clone())
        .recognizer(recognizer, recognition)
        .start()
        .await?;

    assert!(eventually(|| probe.start_count() == 1).await);
    assert_eq!(probe.languages(), vec!["es-ES".to_string()]);

    session.close("done").await;
    Ok(())
}
