//! # Frontdesk Core - Call Conversation Engine
//!
//! This crate implements the decision core of the phone-support agent: the
//! per-call session record, the session store, the dialogue state machine,
//! and the turn engine that drives external collaborators (knowledge base,
//! ticketing, speech synthesis, telephony) one awaited effect at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Conversation Engine                      │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐    │
//! │  │  Utterance   │ → │   Dialogue   │ → │   Effects    │    │
//! │  │  (per call)  │   │   Machine    │   │ (fire+await) │    │
//! │  └──────────────┘   └──────────────┘   └──────────────┘    │
//! │         ↓                   ↓                  ↓             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐    │
//! │  │ SessionStore │   │  Transcript  │   │ Resolver /   │    │
//! │  │  (dashmap)   │   │ (append-only)│   │ Sink / TTS   │    │
//! │  └──────────────┘   └──────────────┘   └──────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! One logical task per call. Sessions never share mutable state except
//! through the store, whose per-key updates are serialized. Every failure
//! path converts into a conversational fallback or an escalation; the
//! caller is never left with dead air and no record.

pub mod config;
pub mod dialogue;
pub mod engine;
pub mod error;
pub mod session;
pub mod store;
pub mod traits;

pub use config::{EngineConfig, ServiceConfig};
pub use dialogue::{advance, DialogueInput, DialogueStep, Effect};
pub use engine::ConversationEngine;
pub use error::{CallError, CallResult};
pub use session::{CallSession, CallState, CallerContact, Outcome, Speaker, TranscriptTurn};
pub use store::SessionStore;
pub use traits::{
    EscalationSink, KbCandidate, KnowledgeResolver, SpeechSynthesizer, TelephonyOutbound,
    TicketDraft, TicketId,
};
