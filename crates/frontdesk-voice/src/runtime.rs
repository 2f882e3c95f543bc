//! Per-call task orchestration.
//!
//! Each live call gets exactly one consumer task that feeds the engine, so
//! dialogue inputs for a session apply strictly in arrival order while
//! separate calls run in parallel. The runtime also owns teardown: whatever
//! path ends a call (hangup, disconnect, idle eviction), the audio bridge,
//! the session record, and the tasks are released exactly once.

use crate::bridge::AudioBridge;
use crate::transcriber::{SpeechToText, TurnTranscriber};
use dashmap::DashMap;
use frontdesk_core::{
    CallError, ConversationEngine, DialogueInput, Outcome, TelephonyOutbound,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Pause before reopening a failed vendor transcription stream.
const STREAM_RETRY_DELAY: Duration = Duration::from_millis(500);

struct CallHandle {
    cancel: watch::Sender<bool>,
    inputs: mpsc::Sender<DialogueInput>,
}

/// Wires the audio path into the engine, one task pair per call.
pub struct CallRuntime {
    engine: Arc<ConversationEngine>,
    bridge: Arc<AudioBridge>,
    stt: Arc<dyn SpeechToText>,
    telephony: Arc<dyn TelephonyOutbound>,
    calls: DashMap<String, CallHandle>,
}

impl CallRuntime {
    pub fn new(
        engine: Arc<ConversationEngine>,
        bridge: Arc<AudioBridge>,
        stt: Arc<dyn SpeechToText>,
        telephony: Arc<dyn TelephonyOutbound>,
    ) -> Self {
        Self {
            engine,
            bridge,
            stt,
            telephony,
            calls: DashMap::new(),
        }
    }

    pub fn bridge(&self) -> &Arc<AudioBridge> {
        &self.bridge
    }

    pub fn engine(&self) -> &Arc<ConversationEngine> {
        &self.engine
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Telephony reported a new live call: create the session, open the
    /// audio path, start the transcriber and the consumer task, and queue
    /// the greeting. Idempotent per session id.
    pub async fn call_started(self: &Arc<Self>, session_id: &str) {
        if self.calls.contains_key(session_id) {
            debug!(session_id, "Call already running");
            return;
        }

        self.engine.store().get_or_create(session_id);
        let frames = self.bridge.open(session_id);

        let capacity = self.engine.config().utterance_queue_capacity;
        let (input_tx, mut input_rx) = mpsc::channel::<DialogueInput>(capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.calls.insert(
            session_id.to_string(),
            CallHandle {
                cancel: cancel_tx,
                inputs: input_tx.clone(),
            },
        );

        // Transcriber: frames in, finalized utterances onto the input queue.
        // Vendor stream failures reopen a fresh stream on the same queue so
        // one dropped socket does not mute the rest of the call.
        {
            let transcriber = TurnTranscriber::new(Arc::clone(&self.stt));
            let session_id = session_id.to_string();
            let utterances = input_tx.clone();
            tokio::spawn(async move {
                loop {
                    match transcriber
                        .run(&session_id, Arc::clone(&frames), utterances.clone())
                        .await
                    {
                        Ok(()) => break,
                        Err(e) => {
                            if frames.is_closed() || utterances.is_closed() {
                                debug!(session_id, "Call over; transcriber not restarted");
                                break;
                            }
                            warn!(session_id, error = %e, "Transcriber failed; reopening stream");
                            tokio::time::sleep(STREAM_RETRY_DELAY).await;
                        }
                    }
                }
            });
        }

        // Consumer: the only task that feeds this session into the engine.
        {
            let runtime = Arc::clone(self);
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                while let Some(input) = input_rx.recv().await {
                    match runtime
                        .engine
                        .handle_input(&session_id, input, &cancel_rx)
                        .await
                    {
                        Ok(()) => {}
                        Err(CallError::SessionNotFound(_)) => break,
                        Err(e) => {
                            warn!(session_id, error = %e, "Turn failed");
                        }
                    }
                    let ended = runtime
                        .engine
                        .store()
                        .get(&session_id)
                        .map_or(true, |s| s.is_ended());
                    if ended {
                        break;
                    }
                }
                runtime.finish_call(&session_id);
            });
        }

        info!(session_id, "Call started");
        if input_tx.send(DialogueInput::CallStarted).await.is_err() {
            warn!(session_id, "Greeting could not be queued");
        }
    }

    /// Telephony reported the media stream is gone. In-flight collaborator
    /// work is cancelled first so late results are discarded, then the
    /// disconnect is applied as a regular input.
    pub async fn call_disconnected(&self, session_id: &str) {
        let Some(handle) = self.calls.get(session_id) else {
            debug!(session_id, "Disconnect for unknown call ignored");
            return;
        };
        let _ = handle.cancel.send(true);
        let inputs = handle.inputs.clone();
        drop(handle);

        if inputs.send(DialogueInput::Disconnected).await.is_err() {
            // Consumer already gone; make sure the record still closes.
            let _ = self
                .engine
                .store()
                .with_session(session_id, |s| s.set_outcome(Outcome::Abandoned));
            self.finish_call(session_id);
        }
    }

    /// Release everything a call holds. Safe to call from any teardown
    /// path; later calls are no-ops.
    fn finish_call(&self, session_id: &str) {
        if let Some((_, handle)) = self.calls.remove(session_id) {
            let _ = handle.cancel.send(true);
        }
        self.bridge.close(session_id);
        if let Some(session) = self.engine.store().remove(session_id) {
            info!(
                session_id,
                outcome = ?session.outcome(),
                turns = session.transcript.len(),
                sink_pending = session.sink_pending,
                "Call finished"
            );
        }
    }

    /// Background idle sweep: sessions quiet past the configured timeout
    /// are closed as abandoned and the caller is hung up on. Returns the
    /// shutdown flag for the sweep task.
    pub fn start_idle_sweeper(self: &Arc<Self>, interval: Duration) -> watch::Sender<bool> {
        let timeout = self.engine.config().idle_timeout();
        let (shutdown_tx, mut evicted_rx) = self
            .engine
            .store()
            .start_eviction_task(interval, timeout);

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(session) = evicted_rx.recv().await {
                warn!(
                    session_id = %session.session_id,
                    "Call idle past timeout; closing as abandoned"
                );
                if let Err(e) = runtime.telephony.hangup(&session.session_id).await {
                    debug!(session_id = %session.session_id, error = %e, "Hangup for idle call failed");
                }
                runtime.finish_call(&session.session_id);
            }
        });

        shutdown_tx
    }
}
