//! Turn engine: applies dialogue inputs and executes their effects.
//!
//! Effects are fire-and-await: the conversation pauses on the resolver or
//! the sink, bounded by timeouts, and every failure is fed back into the
//! machine as an input rather than surfaced to the caller. Cancellation is
//! cooperative: each call carries a watch flag and in-flight collaborator
//! awaits are abandoned as soon as it flips; late results are discarded.

use crate::config::EngineConfig;
use crate::dialogue::{self, DialogueInput, Effect};
use crate::error::CallResult;
use crate::session::CallState;
use crate::store::SessionStore;
use crate::traits::{
    EscalationSink, KnowledgeResolver, SpeechSynthesizer, TelephonyOutbound, TicketDraft,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Spoken when synthesis of the intended utterance fails.
const FALLBACK_UTTERANCE: &str =
    "I'm sorry, I'm having a little trouble right now. Please stay on the line.";

/// Outcome of one utterance attempt.
enum Spoken {
    Played,
    Cancelled,
    /// Both the intended text and the fallback failed; the caller is
    /// effectively unreachable by voice.
    Failed,
}

/// Drives the dialogue machine for all sessions. One instance serves the
/// whole process; per-session serialization comes from the store lock plus
/// the single consumer task per call.
pub struct ConversationEngine {
    store: Arc<SessionStore>,
    resolver: Arc<dyn KnowledgeResolver>,
    sink: Arc<dyn EscalationSink>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    telephony: Arc<dyn TelephonyOutbound>,
    config: EngineConfig,
}

impl ConversationEngine {
    pub fn new(
        store: Arc<SessionStore>,
        resolver: Arc<dyn KnowledgeResolver>,
        sink: Arc<dyn EscalationSink>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        telephony: Arc<dyn TelephonyOutbound>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            sink,
            synthesizer,
            telephony,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply one input and run the resulting effect chain to quiescence.
    /// Callers must not invoke this concurrently for the same session; the
    /// per-call consumer task guarantees arrival-order processing.
    pub async fn handle_input(
        &self,
        session_id: &str,
        input: DialogueInput,
        cancel: &watch::Receiver<bool>,
    ) -> CallResult<()> {
        let mut next = Some(input);

        while let Some(input) = next.take() {
            let step = self.store.with_session(session_id, |s| {
                // Every handled input counts as activity for idle eviction.
                s.touch();
                dialogue::advance(s, input, &self.config)
            })?;

            if let Some(text) = step.say {
                match self.speak(session_id, &text, cancel).await {
                    Spoken::Played => {}
                    Spoken::Cancelled => {
                        debug!(session_id, "Cancelled during synthesis; turn dropped");
                        return Ok(());
                    }
                    Spoken::Failed => {
                        // The caller can't hear us; abandon this step's
                        // conversational effect but still hang up if the
                        // step asked for it, then route to escalation.
                        if matches!(step.effect, Some(Effect::Hangup)) {
                            if let Err(e) = self.telephony.hangup(session_id).await {
                                debug!(session_id, error = %e, "Hangup after call end failed");
                            }
                        }
                        next = Some(DialogueInput::SynthesisUnavailable);
                        continue;
                    }
                }
            }

            match step.effect {
                Some(Effect::Search(query)) => {
                    next = self.run_search(session_id, &query, cancel).await;
                }
                Some(Effect::FileTicket) => {
                    next = self.run_file_ticket(session_id, cancel).await;
                }
                Some(Effect::Hangup) => {
                    if let Err(e) = self.telephony.hangup(session_id).await {
                        debug!(session_id, error = %e, "Hangup after call end failed");
                    }
                }
                None => {
                    // The answer prompt and the confirmation question are
                    // separate states; bridge them once playback is queued.
                    let delivering = self
                        .store
                        .with_session(session_id, |s| s.state == CallState::DeliveringAnswer)?;
                    if delivering {
                        next = Some(DialogueInput::AnswerDelivered);
                    }
                }
            }
        }

        Ok(())
    }

    /// Synthesize and play one utterance. A synthesis failure retries once
    /// with a canned fallback; if that fails too the caller is unreachable
    /// and the turn is downgraded to escalation by the caller of this fn.
    async fn speak(&self, session_id: &str, text: &str, cancel: &watch::Receiver<bool>) -> Spoken {
        let audio = match self.synthesize_guarded(text, cancel).await {
            Ok(Some(audio)) => audio,
            Ok(None) => return Spoken::Cancelled,
            Err(e) => {
                warn!(session_id, error = %e, "Synthesis failed; retrying with fallback utterance");
                match self.synthesize_guarded(FALLBACK_UTTERANCE, cancel).await {
                    Ok(Some(audio)) => audio,
                    Ok(None) => return Spoken::Cancelled,
                    Err(e) => {
                        warn!(session_id, error = %e, "Fallback synthesis failed");
                        return Spoken::Failed;
                    }
                }
            }
        };

        if let Err(e) = self.telephony.play(session_id, audio).await {
            // The call may have ended between synthesis and playback.
            debug!(session_id, error = %e, "Playback discarded");
        }
        Spoken::Played
    }

    /// Ok(None) means cancelled; timeouts surface as errors.
    async fn synthesize_guarded(
        &self,
        text: &str,
        cancel: &watch::Receiver<bool>,
    ) -> CallResult<Option<Vec<u8>>> {
        let mut cancel = cancel.clone();
        tokio::select! {
            _ = cancelled(&mut cancel) => Ok(None),
            res = tokio::time::timeout(self.config.synthesis_timeout(), self.synthesizer.synthesize(text)) => {
                match res {
                    Ok(Ok(audio)) => Ok(Some(audio)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(crate::error::CallError::Timeout("speech synthesis")),
                }
            }
        }
    }

    /// Query the resolver under deadline. Timeout and error both map to
    /// `SearchFailed` so a slow knowledge base behaves exactly like an
    /// empty one. Returns None when the call was cancelled; a result that
    /// arrives after cancellation is discarded.
    async fn run_search(
        &self,
        session_id: &str,
        query: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Option<DialogueInput> {
        let mut cancel = cancel.clone();
        tokio::select! {
            _ = cancelled(&mut cancel) => {
                info!(session_id, "Call cancelled mid-search; resolver result discarded");
                None
            }
            res = tokio::time::timeout(self.config.resolver_timeout(), self.resolver.search(query)) => {
                match res {
                    Ok(Ok(candidates)) => {
                        debug!(session_id, count = candidates.len(), "Resolver returned candidates");
                        Some(DialogueInput::SearchResult(candidates))
                    }
                    Ok(Err(e)) => {
                        warn!(session_id, error = %e, "Resolver unavailable; treating as no answer");
                        Some(DialogueInput::SearchFailed)
                    }
                    Err(_) => {
                        warn!(session_id, "Resolver timed out; treating as no answer");
                        Some(DialogueInput::SearchFailed)
                    }
                }
            }
        }
    }

    /// File the escalation record with bounded retries and doubling backoff.
    async fn run_file_ticket(
        &self,
        session_id: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Option<DialogueInput> {
        let draft = match self.store.with_session(session_id, |s| TicketDraft {
            contact: s.caller_contact.clone(),
            summary: s
                .pending_query
                .clone()
                .map(|q| format!("Phone support request: {q}"))
                .unwrap_or_else(|| "Phone support request".to_string()),
            transcript: s.transcript.clone(),
        }) {
            Ok(draft) => draft,
            Err(_) => return None,
        };

        let mut cancel = cancel.clone();
        let mut backoff = self.config.sink_backoff();

        for attempt in 1..=self.config.sink_retry_limit {
            let res = tokio::select! {
                _ = cancelled(&mut cancel) => return None,
                res = tokio::time::timeout(self.config.resolver_timeout(), self.sink.file_ticket(&draft)) => res,
            };

            match res {
                Ok(Ok(ticket_id)) => {
                    info!(session_id, ticket_id = %ticket_id.0, "Escalation ticket filed");
                    return Some(DialogueInput::TicketFiled(ticket_id));
                }
                Ok(Err(e)) => {
                    warn!(session_id, attempt, error = %e, "Escalation sink failed");
                }
                Err(_) => {
                    warn!(session_id, attempt, "Escalation sink timed out");
                }
            }

            if attempt < self.config.sink_retry_limit {
                tokio::select! {
                    _ = cancelled(&mut cancel) => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff *= 2;
            }
        }

        warn!(session_id, "Escalation sink exhausted retries; flagging for reconciliation");
        Some(DialogueInput::TicketFailed)
    }
}

/// Resolves when the call's cancel flag flips (or its sender is gone).
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
