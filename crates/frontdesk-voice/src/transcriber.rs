//! Turn transcriber: frames in, finalized utterances out.
//!
//! The speech vendor streams partial hypotheses while the caller is still
//! talking; the dialogue machine only ever sees finalized turns. This
//! module pumps a call's frame queue into the vendor stream and filters
//! its events down to `DialogueInput`s.

use crate::frame_queue::FrameQueue;
use async_trait::async_trait;
use frontdesk_core::{CallError, CallResult, DialogueInput};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Event from the vendor's recognition stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UtteranceEvent {
    /// Partial hypothesis, revised as more audio arrives.
    Interim(String),
    /// Finalized turn; the vendor will not revise it.
    Final { text: String, confidence: f32 },
    /// The stream broke and will produce no further events.
    Failed(String),
}

/// One live recognition stream: frames go in, events come out.
pub struct TranscriptionStream {
    pub frames: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::Receiver<UtteranceEvent>,
}

/// Streaming speech-to-text vendor seam. One stream per call.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn open_stream(&self, session_id: &str) -> CallResult<TranscriptionStream>;
}

/// Pumps one call's audio through the vendor and forwards finalized turns.
pub struct TurnTranscriber {
    stt: Arc<dyn SpeechToText>,
}

impl TurnTranscriber {
    pub fn new(stt: Arc<dyn SpeechToText>) -> Self {
        Self { stt }
    }

    /// Run until the frame queue closes or the vendor stream ends. Final
    /// utterances are sent in arrival order; a full utterance channel
    /// backpressures here while the frame queue upstream sheds oldest.
    /// A vendor-side stream failure returns an error so the caller can
    /// reopen a fresh stream on the same frame queue.
    pub async fn run(
        &self,
        session_id: &str,
        frames: Arc<FrameQueue>,
        utterances: mpsc::Sender<DialogueInput>,
    ) -> CallResult<()> {
        let mut stream = self.stt.open_stream(session_id).await?;
        info!(session_id, "Transcription stream opened");

        loop {
            tokio::select! {
                frame = frames.pop() => match frame {
                    Some(frame) => {
                        if stream.frames.send(frame).await.is_err() {
                            debug!(session_id, "Vendor stream closed its frame side");
                            break;
                        }
                    }
                    None => {
                        debug!(session_id, "Frame queue closed; stopping transcription");
                        break;
                    }
                },
                event = stream.events.recv() => match event {
                    Some(UtteranceEvent::Interim(text)) => {
                        trace!(session_id, %text, "Interim hypothesis");
                    }
                    Some(UtteranceEvent::Final { text, confidence }) => {
                        let text = text.trim();
                        if text.is_empty() {
                            continue;
                        }
                        debug!(session_id, %text, confidence, "Final utterance");
                        if utterances
                            .send(DialogueInput::Utterance(text.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(UtteranceEvent::Failed(reason)) => {
                        warn!(session_id, %reason, "Transcription stream failed");
                        // The caller said something we never heard; let the
                        // dialogue reprompt rather than go silent.
                        let _ = utterances.send(DialogueInput::NoInput).await;
                        return Err(CallError::TranscriptionFailed(reason));
                    }
                    None => {
                        debug!(session_id, "Transcription stream ended");
                        break;
                    }
                },
            }
        }

        Ok(())
    }
}
