//! Per-call audio plumbing between the telephony socket and the engine.
//!
//! Inbound: raw frames from the provider's media stream land in a bounded
//! drop-oldest queue that the transcriber drains. Outbound: synthesized
//! clips are re-chunked into 20ms frames and paced onto the wire, because
//! most providers expect media at real-time rate rather than in bursts.

use crate::frame_queue::FrameQueue;
use async_trait::async_trait;
use dashmap::DashMap;
use frontdesk_core::CallResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// 20ms of 8kHz mono mu-law.
pub const FRAME_BYTES: usize = 160;
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// How many whole synthesized clips may wait for the pacer per call.
const CLIP_QUEUE_CAPACITY: usize = 8;

/// Transport half that puts one outbound frame on the wire.
#[async_trait]
pub trait OutboundFrameSink: Send + Sync {
    async fn send_frame(&self, session_id: &str, payload: &[u8]) -> CallResult<()>;
}

/// A clip queued for playback; `done` fires once its last frame is on the
/// wire (or is dropped when the call closes mid-clip).
struct QueuedClip {
    audio: Vec<u8>,
    done: oneshot::Sender<()>,
}

struct CallAudio {
    inbound: Arc<FrameQueue>,
    clips: mpsc::Sender<QueuedClip>,
    closed: watch::Sender<bool>,
}

/// Registry of live call audio paths, keyed by telephony session id.
pub struct AudioBridge {
    calls: DashMap<String, CallAudio>,
    sink: Arc<dyn OutboundFrameSink>,
    frame_queue_capacity: usize,
}

impl AudioBridge {
    pub fn new(sink: Arc<dyn OutboundFrameSink>, frame_queue_capacity: usize) -> Self {
        Self {
            calls: DashMap::new(),
            sink,
            frame_queue_capacity,
        }
    }

    /// Open the audio path for a call and return its inbound frame queue.
    /// Reopening an already-open call returns the existing queue.
    pub fn open(&self, session_id: &str) -> Arc<FrameQueue> {
        if let Some(call) = self.calls.get(session_id) {
            return Arc::clone(&call.inbound);
        }

        let inbound = Arc::new(FrameQueue::new(self.frame_queue_capacity));
        let (clips_tx, clips_rx) = mpsc::channel(CLIP_QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(pace_outbound(
            session_id.to_string(),
            clips_rx,
            Arc::clone(&self.sink),
            closed_rx,
        ));

        info!(session_id, "Audio path opened");
        self.calls.insert(
            session_id.to_string(),
            CallAudio {
                inbound: Arc::clone(&inbound),
                clips: clips_tx,
                closed: closed_tx,
            },
        );
        inbound
    }

    /// One inbound media frame from the provider. Frames for unknown or
    /// already-closed calls are discarded.
    pub fn on_inbound_frame(&self, session_id: &str, payload: Vec<u8>) {
        match self.calls.get(session_id) {
            Some(call) => {
                call.inbound.push(payload);
            }
            None => {
                trace!(session_id, "Frame for unknown call discarded");
            }
        }
    }

    /// Play a synthesized clip at paced rate, returning once the last frame
    /// is on the wire. A hangup queued right behind a goodbye therefore
    /// cannot cut the goodbye short. Playing into a closed call is not an
    /// error; the clip is discarded and playback mid-close resolves early.
    pub async fn play(&self, session_id: &str, audio: Vec<u8>) -> CallResult<()> {
        let clips = match self.calls.get(session_id) {
            Some(call) => call.clips.clone(),
            None => {
                debug!(session_id, "Playback for closed call discarded");
                return Ok(());
            }
        };
        let (done_tx, done_rx) = oneshot::channel();
        if clips
            .send(QueuedClip {
                audio,
                done: done_tx,
            })
            .await
            .is_err()
        {
            debug!(session_id, "Playback for closed call discarded");
            return Ok(());
        }
        // Sender dropped means the call closed mid-clip; not an error.
        let _ = done_rx.await;
        Ok(())
    }

    /// Tear down the audio path: stop playback, close the inbound queue.
    /// Idempotent.
    pub fn close(&self, session_id: &str) {
        if let Some((_, call)) = self.calls.remove(session_id) {
            call.inbound.close();
            let _ = call.closed.send(true);
            info!(session_id, "Audio path closed");
        }
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.calls.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Re-chunk queued clips into wire frames at real-time rate. Ends when the
/// call closes or the clip channel is dropped; a close mid-clip abandons
/// the remainder promptly.
async fn pace_outbound(
    session_id: String,
    mut clips: mpsc::Receiver<QueuedClip>,
    sink: Arc<dyn OutboundFrameSink>,
    mut closed: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let clip = tokio::select! {
            _ = closed.changed() => break,
            clip = clips.recv() => match clip {
                Some(clip) => clip,
                None => break,
            },
        };

        for frame in clip.audio.chunks(FRAME_BYTES) {
            tokio::select! {
                // Dropping `clip.done` here releases the waiting `play`.
                _ = closed.changed() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = sink.send_frame(&session_id, frame).await {
                warn!(session_id, error = %e, "Outbound frame failed; abandoning clip");
                break;
            }
        }
        let _ = clip.done.send(());
    }
    debug!(session_id, "Outbound pacer stopped");
}
