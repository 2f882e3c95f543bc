//! Audio path for live phone calls.
//!
//! ```text
//!   telephony ws ──► AudioBridge ──► FrameQueue ──► TurnTranscriber ──┐
//!                        ▲                                            │ final
//!                        │ paced 20ms frames                          ▼ utterances
//!                   playback clips ◄── ConversationEngine ◄── CallRuntime
//! ```
//!
//! The bridge owns per-call audio plumbing, the transcriber turns frames
//! into utterances, and the runtime gives each call its own consumer task
//! so dialogue inputs apply strictly in arrival order.

pub mod bridge;
pub mod frame_queue;
pub mod runtime;
pub mod transcriber;

pub use bridge::{AudioBridge, OutboundFrameSink, FRAME_BYTES, FRAME_INTERVAL};
pub use frame_queue::FrameQueue;
pub use runtime::CallRuntime;
pub use transcriber::{SpeechToText, TranscriptionStream, TurnTranscriber, UtteranceEvent};
