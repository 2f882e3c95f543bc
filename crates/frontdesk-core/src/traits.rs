//! Collaborator seams.
//!
//! The engine only ever sees these traits; the SaaS wiring (helpdesk,
//! speech vendor, telephony provider) lives in the gateway. Each trait maps
//! to one excluded capability: knowledge search, ticket filing, speech
//! synthesis, and outbound telephony control.

use crate::error::CallResult;
use crate::session::{CallerContact, TranscriptTurn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One knowledge-base hit, ordered by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbCandidate {
    pub title: String,
    pub content: String,
    /// Vendor relevance signal, normalized to 0.0..=1.0.
    pub relevance_score: f32,
}

/// Follow-up record handed to the escalation sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDraft {
    pub contact: Option<CallerContact>,
    pub summary: String,
    pub transcript: Vec<TranscriptTurn>,
}

/// Identifier returned by the ticketing system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketId(pub String);

/// Abstract knowledge-base search. May return zero candidates; fails with
/// `ResolverUnavailable` when the backend is unreachable.
#[async_trait]
pub trait KnowledgeResolver: Send + Sync {
    async fn search(&self, query: &str) -> CallResult<Vec<KbCandidate>>;
}

/// Persists a follow-up record for a human agent.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn file_ticket(&self, draft: &TicketDraft) -> CallResult<TicketId>;
}

/// Text to audio bytes in the telephony transport's format.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> CallResult<Vec<u8>>;
}

/// Outbound control toward the telephony provider.
#[async_trait]
pub trait TelephonyOutbound: Send + Sync {
    /// Queue synthesized audio for playback on the call. Playing into a
    /// call that already ended is not an error; the audio is discarded.
    async fn play(&self, session_id: &str, audio: Vec<u8>) -> CallResult<()>;

    async fn hangup(&self, session_id: &str) -> CallResult<()>;
}
