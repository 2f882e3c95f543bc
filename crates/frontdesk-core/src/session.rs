//! Per-call session record.
//!
//! One `CallSession` exists per live call id. The transcript is append-only
//! and monotonic; the outcome is write-once and terminal. All mutation goes
//! through the store so the audio path and the decision path cannot race.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who produced a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    Caller,
    Agent,
}

/// One finalized utterance, from either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptTurn {
    pub fn now(speaker: Speaker, text: String) -> Self {
        Self {
            speaker,
            text,
            timestamp: Utc::now(),
        }
    }
}

/// Terminal result of a call. Set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Caller confirmed the delivered answer solved their issue.
    Resolved,
    /// Handed off to a human via the escalation sink.
    Escalated,
    /// Idle timeout or transport loss before a terminal decision.
    Abandoned,
}

/// Node in the conversation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    Greeting,
    CollectingContact,
    AwaitingIssue,
    SearchingKb,
    DeliveringAnswer,
    ConfirmingResolution,
    Escalating,
    Ended,
}

/// Structured contact info, immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContact {
    email: String,
}

impl CallerContact {
    /// Parse a spoken email utterance. Callers say "jane at example dot com";
    /// transcription sometimes produces the literal form already. Returns
    /// None unless the normalized text is syntactically an address.
    pub fn parse_spoken(raw: &str) -> Option<Self> {
        let mut text = format!(" {} ", raw.trim().to_lowercase());
        text = text.replace(" at ", "@");
        text = text.replace(" dot ", ".");
        text = text.replace(" underscore ", "_");
        text = text.replace(" dash ", "-");
        let candidate: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let candidate = candidate.trim_matches(|c: char| c == '.' || c == ',').to_string();

        let (local, domain) = candidate.split_once('@')?;
        if local.is_empty() || domain.contains('@') {
            return None;
        }
        // Domain needs at least one interior dot.
        let (host, tld) = domain.rsplit_once('.')?;
        if host.is_empty() || tld.is_empty() {
            return None;
        }
        Some(Self { email: candidate })
    }

    pub fn email(&self) -> &str {
        &self.email
    }
}

/// State for one phone call, keyed by the telephony session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: String,
    pub state: CallState,
    pub caller_contact: Option<CallerContact>,
    pub transcript: Vec<TranscriptTurn>,
    /// Last unresolved caller question; cleared on resolve or escalation.
    pub pending_query: Option<String>,
    /// Malformed contact attempts so far.
    pub contact_attempts: u32,
    /// No-input re-prompts for the current question.
    pub reprompt_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    outcome: Option<Outcome>,
    /// Set when the escalation record could not be persisted; the session
    /// is then handed to out-of-band reconciliation instead of dropped.
    pub sink_pending: bool,
}

impl CallSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            state: CallState::Greeting,
            caller_contact: None,
            transcript: Vec::new(),
            pending_query: None,
            contact_attempts: 0,
            reprompt_attempts: 0,
            created_at: now,
            last_activity_at: now,
            outcome: None,
            sink_pending: false,
        }
    }

    /// Append a finalized utterance. Append-only; ordering follows call order.
    pub fn record_turn(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.transcript.push(TranscriptTurn::now(speaker, text.into()));
    }

    /// First write wins; later writes are no-ops. Returns whether this call
    /// set the outcome.
    pub fn set_outcome(&mut self, outcome: Outcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        self.state = CallState::Ended;
        true
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_ended(&self) -> bool {
        self.outcome.is_some() || self.state == CallState::Ended
    }

    /// Bump the activity clock (any inbound signal counts).
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_spoken_email_forms() {
        let c = CallerContact::parse_spoken("jane at example dot com").unwrap();
        assert_eq!(c.email(), "jane@example.com");

        let c = CallerContact::parse_spoken("Jane.Doe@Example.com").unwrap();
        assert_eq!(c.email(), "jane.doe@example.com");

        let c = CallerContact::parse_spoken("bob underscore smith at mail dot example dot org");
        assert_eq!(c.unwrap().email(), "bob_smith@mail.example.org");
    }

    #[test]
    fn parse_spoken_rejects_malformed() {
        assert!(CallerContact::parse_spoken("my email is jane").is_none());
        assert!(CallerContact::parse_spoken("at example dot com").is_none());
        assert!(CallerContact::parse_spoken("jane at com").is_none());
        assert!(CallerContact::parse_spoken("").is_none());
    }

    #[test]
    fn outcome_is_write_once() {
        let mut s = CallSession::new("CA123");
        assert!(s.set_outcome(Outcome::Resolved));
        assert!(!s.set_outcome(Outcome::Abandoned));
        assert_eq!(s.outcome(), Some(Outcome::Resolved));
        assert_eq!(s.state, CallState::Ended);
    }

    #[test]
    fn transcript_appends_in_order() {
        let mut s = CallSession::new("CA123");
        s.record_turn(Speaker::Agent, "hello");
        s.record_turn(Speaker::Caller, "hi");
        assert_eq!(s.transcript.len(), 2);
        assert_eq!(s.transcript[0].speaker, Speaker::Agent);
        assert!(s.transcript[0].timestamp <= s.transcript[1].timestamp);
    }
}
