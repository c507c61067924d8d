// Single dispatcher loop for one session
//
// Owns the turn state machine and the per-turn buffers. Every inbound frame,
// user command, capture transition and transcript is handled here in arrival
// order, so the buffers have exactly one writer and are reset atomically at
// turn boundaries.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::stats::SessionCounters;
use super::teardown::Resources;
use crate::audio::{AudioAssembler, PlaybackItem};
use crate::error::ConnectionError;
use crate::events::{MessageKind, SessionEvent};
use crate::protocol::{ContentPart, ServerContent, ServerFrame, TransportEvent};
use crate::recognition::TranscriptEvent;
use crate::text::TextStreamAggregator;
use crate::turn::{Part, TurnState, TurnStateMachine};

pub(crate) enum Command {
    SendText {
        text: String,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
}

pub(crate) struct Dispatcher {
    machine: TurnStateMachine,
    assembler: AudioAssembler,
    aggregator: TextStreamAggregator,
    /// Set when a fragment of the open turn failed to decode
    audio_failed: bool,
    speak_text_turns: bool,
    resources: Arc<Resources>,
    counters: Arc<SessionCounters>,
    transcript_log: Arc<Mutex<Vec<TranscriptEvent>>>,
    turn_state: watch::Sender<TurnState>,
}

pub(crate) struct DispatcherInputs {
    pub inbound: mpsc::Receiver<TransportEvent>,
    pub commands: mpsc::Receiver<Command>,
    pub transcripts: mpsc::Receiver<TranscriptEvent>,
    pub capture: Option<watch::Receiver<bool>>,
    pub shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        resources: Arc<Resources>,
        counters: Arc<SessionCounters>,
        transcript_log: Arc<Mutex<Vec<TranscriptEvent>>>,
        turn_state: watch::Sender<TurnState>,
        speak_text_turns: bool,
    ) -> Self {
        Self {
            machine: TurnStateMachine::new(),
            assembler: AudioAssembler::new(),
            aggregator: TextStreamAggregator::new(),
            audio_failed: false,
            speak_text_turns,
            resources,
            counters,
            transcript_log,
            turn_state,
        }
    }

    pub async fn run(mut self, mut inputs: DispatcherInputs) {
        info!("Dispatcher started for session {}", self.resources.session_id);

        loop {
            tokio::select! {
                biased;

                changed = inputs.shutdown.changed() => {
                    if changed.is_err() || *inputs.shutdown.borrow() {
                        break;
                    }
                }

                event = inputs.inbound.recv() => match event {
                    Some(event) => {
                        if self.handle_transport(event).await {
                            break;
                        }
                    }
                    None => {
                        self.transport_lost("transport channel closed").await;
                        break;
                    }
                },

                Some(command) = inputs.commands.recv() => self.handle_command(command).await,

                Some(transcript) = inputs.transcripts.recv() => {
                    self.handle_transcript(transcript).await;
                }

                active = capture_changed(&mut inputs.capture) => match active {
                    Some(true) => {
                        if let Err(e) = self.machine.user_input_started(None) {
                            debug!("Capture start ignored: {}", e);
                        }
                    }
                    Some(false) => {
                        self.machine.user_input_transmitted();
                    }
                    None => inputs.capture = None,
                },
            }

            self.turn_state.send_replace(self.machine.state());
        }

        // Whatever was buffered belongs to a turn that will never finish
        self.assembler.discard();
        self.aggregator.discard();
        if !self.machine.state().is_terminal() {
            self.machine.close();
        }
        self.turn_state.send_replace(self.machine.state());

        // Reject anything still queued
        inputs.commands.close();
        while let Ok(Command::SendText { reply, .. }) = inputs.commands.try_recv() {
            let _ = reply.send(Err(ConnectionError::Closed));
        }

        info!("Dispatcher stopped for session {}", self.resources.session_id);
    }

    /// Returns true when the session must end
    async fn handle_transport(&mut self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Open => {
                self.resources.events.publish(SessionEvent::Connected {
                    backend: self.resources.connection.backend().to_string(),
                });
                false
            }
            TransportEvent::Message(_) if self.resources.is_closed() => {
                debug!("Session closing, dropping inbound frame");
                false
            }
            TransportEvent::Message(raw) => {
                match ServerFrame::parse(&raw) {
                    Ok(frame) => self.handle_frame(frame),
                    Err(e) => {
                        SessionCounters::bump(&self.counters.protocol_errors);
                        warn!("Dropping inbound frame: {}", e);
                    }
                }
                false
            }
            TransportEvent::Error(e) => {
                error!("Transport error: {}", e);
                self.resources.connection.mark_error();
                self.machine.fail();
                self.resources.events.publish(SessionEvent::Error {
                    error: e.to_string(),
                });
                self.transport_lost(&format!("transport error: {}", e)).await;
                true
            }
            TransportEvent::Closed { reason } => {
                info!("Transport closed: {}", reason);
                self.transport_lost(&reason).await;
                true
            }
        }
    }

    async fn transport_lost(&mut self, reason: &str) {
        self.assembler.discard();
        self.aggregator.discard();
        self.resources.teardown(reason).await;
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        if frame.setup_complete.is_some() {
            info!("Backend acknowledged session setup");
        }

        let Some(content) = frame.server_content else {
            return;
        };
        let ServerContent {
            model_turn,
            turn_complete,
            interrupted,
        } = content;

        if interrupted {
            // Parts riding along with the interrupt belong to the dead turn
            self.handle_interrupted();
            return;
        }

        if let Some(turn) = model_turn {
            for part in turn.parts.into_iter().filter_map(ContentPart::into_part) {
                self.handle_part(part);
            }
        }

        if turn_complete {
            self.handle_turn_complete();
        }
    }

    fn handle_part(&mut self, part: Part) {
        let ordinal = match self.machine.model_part(part.clone()) {
            Ok(ordinal) => ordinal,
            Err(e) => {
                warn!("Dropping model part: {}", e);
                return;
            }
        };

        match part {
            Part::Text(text) => {
                let update = self.aggregator.push(ordinal, &text);
                self.resources.events.publish(SessionEvent::Message {
                    kind: MessageKind::Text,
                    content: update.content,
                    is_complete: false,
                });
            }
            Part::Audio(fragment) => {
                if self.audio_failed {
                    return;
                }
                match self.assembler.push(&fragment) {
                    Ok(()) => {
                        self.resources.events.publish(SessionEvent::Message {
                            kind: MessageKind::Audio,
                            content: fragment.data,
                            is_complete: false,
                        });
                    }
                    Err(e) => {
                        // Fatal for this turn's audio only; text continues
                        error!("Turn {} audio unusable: {}", ordinal, e);
                        self.audio_failed = true;
                        self.assembler.discard();
                        self.resources.events.publish(SessionEvent::AudioError {
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn handle_turn_complete(&mut self) {
        let turn = self.machine.turn_complete();

        // Both buffers are emptied before anyone hears about the boundary
        let text = self.aggregator.complete();
        let ordinal = turn.as_ref().map(|t| t.ordinal).unwrap_or_default();
        let mut audio_failed = std::mem::take(&mut self.audio_failed);
        let audio = match self.assembler.flush(ordinal) {
            Ok(audio) => audio,
            Err(e) => {
                error!("Turn {} audio unusable: {}", ordinal, e);
                if !audio_failed {
                    self.resources.events.publish(SessionEvent::AudioError {
                        error: e.to_string(),
                    });
                }
                audio_failed = true;
                None
            }
        };

        let Some(turn) = turn else {
            debug!("turnComplete without an open model turn");
            return;
        };

        if let Some(text) = &text {
            self.resources.events.publish(SessionEvent::Message {
                kind: MessageKind::Text,
                content: text.content.clone(),
                is_complete: true,
            });
        }

        match (audio, text) {
            (Some(audio), _) if !audio_failed => {
                debug!("Turn {} audio assembled: {} bytes", turn.ordinal, audio.bytes.len());
                self.resources.playback.play(PlaybackItem::Audio(audio));
            }
            (None, Some(text))
                if self.speak_text_turns && !turn.has_audio() && !text.content.trim().is_empty() =>
            {
                self.resources.playback.play(PlaybackItem::Speech(text.content));
            }
            _ => {}
        }

        SessionCounters::bump(&self.counters.turns_completed);
        self.resources
            .events
            .publish(SessionEvent::TurnComplete { turn: turn.ordinal });
    }

    fn handle_interrupted(&mut self) {
        let turn = self.machine.interrupted();

        let dropped_audio = self.assembler.discard();
        let dropped_text = self.aggregator.discard();
        self.audio_failed = false;

        // Barge-in: the user is talking, so nothing of the model keeps playing
        self.resources.playback.stop();

        if let Some(turn) = turn {
            debug!(
                "Interrupted turn {}: discarded {} audio bytes, {} text deltas",
                turn.ordinal, dropped_audio, dropped_text
            );
            SessionCounters::bump(&self.counters.turns_interrupted);
            self.resources
                .events
                .publish(SessionEvent::Interrupted { turn: turn.ordinal });
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendText { text, reply } => {
                let result = self.send_user_text(&text).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn send_user_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        if self.machine.state().is_terminal() {
            return Err(ConnectionError::Closed);
        }
        if let Err(e) = self.machine.user_input_started(Some(text)) {
            debug!("Text input rejected: {}", e);
            return Err(ConnectionError::Closed);
        }

        self.resources.connection.send_text(text).await?;
        self.machine.user_input_transmitted();
        Ok(())
    }

    async fn handle_transcript(&mut self, transcript: TranscriptEvent) {
        let is_final = transcript.is_final();
        let text = transcript.text.clone();

        self.transcript_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(transcript);

        if is_final && !text.trim().is_empty() {
            if let Err(e) = self.send_user_text(text.trim()).await {
                warn!("Failed to send recognized text: {}", e);
            }
        }
    }
}

async fn capture_changed(rx: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
