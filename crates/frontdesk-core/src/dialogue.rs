//! The conversation state machine.
//!
//! Pure transition core: one exhaustive `match` over (state, input), no I/O.
//! The engine executes the returned effects and feeds their results back in
//! as inputs, so the bounded-retry and fallback-to-escalation guarantees are
//! verifiable here without any collaborator in the loop.
//!
//! Every branch has an explicit low-confidence or failure exit that defaults
//! toward escalation. A caller never loops forever and never hangs up
//! without either an answer or a filed ticket.

use crate::config::EngineConfig;
use crate::session::{CallSession, CallState, CallerContact, Outcome, Speaker};
use crate::traits::{KbCandidate, TicketId};

/// Finalized utterance or internal event driving one transition.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogueInput {
    /// Telephony reported the call is live.
    CallStarted,
    /// Finalized caller utterance from the transcriber.
    Utterance(String),
    /// Transcription failed or committed nothing; treated as silence.
    NoInput,
    /// Knowledge resolver answered (possibly with zero candidates).
    SearchResult(Vec<KbCandidate>),
    /// Resolver error or timeout; equivalent to zero candidates.
    SearchFailed,
    /// The candidate answer finished playing to the caller.
    AnswerDelivered,
    /// Escalation sink accepted the record.
    TicketFiled(TicketId),
    /// Escalation sink exhausted its retries.
    TicketFailed,
    /// Both the intended utterance and the fallback failed to synthesize;
    /// the caller cannot hear us.
    SynthesisUnavailable,
    /// Telephony transport gone; unrecoverable.
    Disconnected,
    /// Idle eviction fired for this session.
    IdleTimeout,
}

/// Side effect requested by a transition. At most one per step.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Query the knowledge resolver with the pending question.
    Search(String),
    /// File the escalation record.
    FileTicket,
    /// Terminate the call at the telephony provider.
    Hangup,
}

/// Result of one transition: an utterance to synthesize and/or an effect.
#[derive(Debug, Clone, Default)]
pub struct DialogueStep {
    pub say: Option<String>,
    pub effect: Option<Effect>,
}

impl DialogueStep {
    fn none() -> Self {
        Self::default()
    }
}

pub const GREETING: &str = "Thank you for calling Frontdesk support. \
     Please say your email address so we can follow up if needed.";
pub const CONTACT_REPROMPT: &str = "Sorry, I didn't catch a valid email address. \
     Please say it again, for example jane at example dot com.";
pub const ASK_ISSUE: &str = "How can I help you today?";
pub const ISSUE_REPROMPT: &str = "Sorry, I didn't catch that. What can I help you with?";
pub const SEARCHING_NOTICE: &str = "Let me look into that for you. One moment.";
pub const CONFIRM_PROMPT: &str = "Did that answer your question?";
pub const CONFIRM_REPROMPT: &str = "Sorry, I didn't catch that. Did that answer your question?";
pub const ESCALATE_NOTICE: &str = "I wasn't able to find an answer for that. \
     I'll create a support ticket so a member of our team can follow up with you.";
pub const ESCALATE_NO_CONTACT: &str = "I'm having trouble understanding your email address. \
     I'll create a support ticket so a member of our team can follow up.";
pub const GOODBYE_RESOLVED: &str = "Great, glad I could help. Thanks for calling Frontdesk support. Goodbye.";
pub const GOODBYE_ESCALATED: &str = "Your ticket has been created and a member of our team \
     will follow up with you shortly. Thanks for calling. Goodbye.";
pub const GOODBYE_SINK_DOWN: &str = "I've recorded your issue and a member of our team \
     will follow up with you. Thanks for calling. Goodbye.";

/// Apply one input to the session. The caller holds the store's per-key
/// lock, so transitions for one session are strictly serialized.
pub fn advance(
    session: &mut CallSession,
    input: DialogueInput,
    config: &EngineConfig,
) -> DialogueStep {
    // `ended` is terminal: late inputs (including results of cancelled
    // effects) are absorbed without transition.
    if session.is_ended() {
        return DialogueStep::none();
    }

    // Global exits, valid from any state.
    match input {
        DialogueInput::Disconnected => {
            session.set_outcome(Outcome::Abandoned);
            return DialogueStep::none();
        }
        DialogueInput::IdleTimeout => {
            session.set_outcome(Outcome::Abandoned);
            return DialogueStep {
                say: None,
                effect: Some(Effect::Hangup),
            };
        }
        DialogueInput::SynthesisUnavailable => {
            // The caller cannot hear us, so conversation is over; make sure
            // a record still gets filed. Mid-escalation this retries the
            // filing the failed utterance preempted.
            return if session.state == CallState::Escalating {
                DialogueStep {
                    say: None,
                    effect: Some(Effect::FileTicket),
                }
            } else {
                escalate(session, ESCALATE_NOTICE)
            };
        }
        _ => {}
    }

    match (session.state, input) {
        (CallState::Greeting, DialogueInput::CallStarted) => {
            session.state = CallState::CollectingContact;
            say(session, GREETING)
        }

        (CallState::CollectingContact, DialogueInput::Utterance(text)) => {
            session.record_turn(Speaker::Caller, text.clone());
            match CallerContact::parse_spoken(&text) {
                Some(contact) => {
                    let email = contact.email().to_string();
                    session.caller_contact = Some(contact);
                    session.reprompt_attempts = 0;
                    session.state = CallState::AwaitingIssue;
                    say(
                        session,
                        format!("Thanks, I have your email as {email}. {ASK_ISSUE}"),
                    )
                }
                None => contact_retry(session, config),
            }
        }
        (CallState::CollectingContact, DialogueInput::NoInput) => contact_retry(session, config),

        (CallState::AwaitingIssue, DialogueInput::Utterance(text)) => {
            let trimmed = text.trim().to_string();
            if trimmed.is_empty() {
                return reprompt(session, config, ISSUE_REPROMPT);
            }
            session.record_turn(Speaker::Caller, trimmed.clone());
            session.pending_query = Some(trimmed.clone());
            session.reprompt_attempts = 0;
            session.state = CallState::SearchingKb;
            let mut step = say(session, SEARCHING_NOTICE);
            step.effect = Some(Effect::Search(trimmed));
            step
        }
        (CallState::AwaitingIssue, DialogueInput::NoInput) => {
            reprompt(session, config, ISSUE_REPROMPT)
        }

        (CallState::SearchingKb, DialogueInput::SearchResult(candidates)) => {
            let best = candidates
                .into_iter()
                .find(|c| c.relevance_score >= config.relevance_threshold);
            match best {
                Some(candidate) => {
                    session.state = CallState::DeliveringAnswer;
                    say(session, answer_text(&candidate))
                }
                None => escalate(session, ESCALATE_NOTICE),
            }
        }
        (CallState::SearchingKb, DialogueInput::SearchFailed) => {
            escalate(session, ESCALATE_NOTICE)
        }

        (CallState::DeliveringAnswer, DialogueInput::AnswerDelivered) => {
            session.state = CallState::ConfirmingResolution;
            say(session, CONFIRM_PROMPT)
        }

        (CallState::ConfirmingResolution, DialogueInput::Utterance(text)) => {
            session.record_turn(Speaker::Caller, text.clone());
            if is_affirmative(&text) {
                session.pending_query = None;
                let mut step = say(session, GOODBYE_RESOLVED);
                session.set_outcome(Outcome::Resolved);
                step.effect = Some(Effect::Hangup);
                step
            } else {
                // Negative or unclear both escalate; never re-litigate.
                escalate(session, ESCALATE_NOTICE)
            }
        }
        (CallState::ConfirmingResolution, DialogueInput::NoInput) => {
            reprompt(session, config, CONFIRM_REPROMPT)
        }

        (CallState::Escalating, DialogueInput::TicketFiled(_)) => {
            session.pending_query = None;
            let mut step = say(session, GOODBYE_ESCALATED);
            session.set_outcome(Outcome::Escalated);
            step.effect = Some(Effect::Hangup);
            step
        }
        (CallState::Escalating, DialogueInput::TicketFailed) => {
            // The caller still gets a graceful goodbye; the missing record
            // is flagged for out-of-band reconciliation.
            session.sink_pending = true;
            session.pending_query = None;
            let mut step = say(session, GOODBYE_SINK_DOWN);
            session.set_outcome(Outcome::Escalated);
            step.effect = Some(Effect::Hangup);
            step
        }

        // An utterance in a state that is not listening (e.g. the caller
        // talks over the search). Keep the transcript faithful, hold state.
        (_, DialogueInput::Utterance(text)) => {
            if !text.trim().is_empty() {
                session.record_turn(Speaker::Caller, text.trim().to_string());
            }
            DialogueStep::none()
        }

        _ => DialogueStep::none(),
    }
}

fn say(session: &mut CallSession, text: impl Into<String>) -> DialogueStep {
    let text = text.into();
    session.record_turn(Speaker::Agent, text.clone());
    DialogueStep {
        say: Some(text),
        effect: None,
    }
}

fn contact_retry(session: &mut CallSession, config: &EngineConfig) -> DialogueStep {
    session.contact_attempts += 1;
    if session.contact_attempts >= config.contact_retry_limit {
        escalate(session, ESCALATE_NO_CONTACT)
    } else {
        say(session, CONTACT_REPROMPT)
    }
}

fn reprompt(session: &mut CallSession, config: &EngineConfig, prompt: &str) -> DialogueStep {
    session.reprompt_attempts += 1;
    if session.reprompt_attempts > config.reprompt_retry_limit {
        escalate(session, ESCALATE_NOTICE)
    } else {
        say(session, prompt)
    }
}

fn escalate(session: &mut CallSession, notice: &str) -> DialogueStep {
    session.reprompt_attempts = 0;
    session.state = CallState::Escalating;
    let mut step = say(session, notice);
    step.effect = Some(Effect::FileTicket);
    step
}

fn answer_text(candidate: &KbCandidate) -> String {
    let mut content = candidate.content.trim().to_string();
    // Keep spoken answers short; the full article stays in the KB.
    const MAX_SPOKEN_CHARS: usize = 600;
    if content.chars().count() > MAX_SPOKEN_CHARS {
        content = content.chars().take(MAX_SPOKEN_CHARS).collect::<String>();
        if let Some(cut) = content.rfind(['.', '!', '?']) {
            content.truncate(cut + 1);
        }
    }
    format!("Here's what I found about {}. {}", candidate.title, content)
}

/// Any negation marker wins over any affirmative: "no it didn't help" must
/// not read as "it did". Unclear stays non-affirmative and escalates.
fn is_affirmative(text: &str) -> bool {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();

    const NEGATIONS: &[&str] = &[
        "no", "not", "nope", "nah", "never", "wrong", "incorrect", "didn't", "didnt",
        "doesn't", "doesnt", "don't", "dont", "wasn't", "wasnt", "isn't", "isnt",
    ];
    if words.iter().any(|w| NEGATIONS.contains(w)) {
        return false;
    }

    const AFFIRMATIVE_WORDS: &[&str] = &["yes", "yeah", "yep", "yup", "correct", "perfect"];
    if words.iter().any(|w| AFFIRMATIVE_WORDS.contains(w)) {
        return true;
    }

    const AFFIRMATIVE_PHRASES: &[&str] = &[
        "that's right", "it did", "that works", "that helps", "all set", "sounds good",
    ];
    AFFIRMATIVE_PHRASES.iter().any(|phrase| lowered.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn started_session() -> CallSession {
        let mut s = CallSession::new("CA1");
        advance(&mut s, DialogueInput::CallStarted, &config());
        s
    }

    fn session_awaiting_issue() -> CallSession {
        let mut s = started_session();
        advance(
            &mut s,
            DialogueInput::Utterance("jane at example dot com".into()),
            &config(),
        );
        assert_eq!(s.state, CallState::AwaitingIssue);
        s
    }

    fn candidate(score: f32) -> KbCandidate {
        KbCandidate {
            title: "Resetting your password".into(),
            content: "Open settings, choose security, and follow the reset link.".into(),
            relevance_score: score,
        }
    }

    #[test]
    fn call_start_prompts_for_contact() {
        let mut s = CallSession::new("CA1");
        let step = advance(&mut s, DialogueInput::CallStarted, &config());
        assert_eq!(s.state, CallState::CollectingContact);
        assert_eq!(step.say.as_deref(), Some(GREETING));
        assert!(step.effect.is_none());
    }

    #[test]
    fn valid_contact_advances_to_issue() {
        let mut s = started_session();
        let step = advance(
            &mut s,
            DialogueInput::Utterance("jane at example dot com".into()),
            &config(),
        );
        assert_eq!(s.state, CallState::AwaitingIssue);
        assert_eq!(
            s.caller_contact.as_ref().map(|c| c.email()),
            Some("jane@example.com")
        );
        assert!(step.say.unwrap().contains("jane@example.com"));
    }

    #[test]
    fn contact_collection_is_bounded() {
        // Scenario D: three malformed attempts end in escalation, contact unset.
        let mut s = started_session();
        for _ in 0..2 {
            let step = advance(
                &mut s,
                DialogueInput::Utterance("mumble".into()),
                &config(),
            );
            assert_eq!(s.state, CallState::CollectingContact);
            assert_eq!(step.say.as_deref(), Some(CONTACT_REPROMPT));
        }
        let step = advance(&mut s, DialogueInput::Utterance("mumble".into()), &config());
        assert_eq!(s.state, CallState::Escalating);
        assert!(s.caller_contact.is_none());
        assert_eq!(step.effect, Some(Effect::FileTicket));
    }

    #[test]
    fn issue_utterance_triggers_search() {
        let mut s = session_awaiting_issue();
        let step = advance(
            &mut s,
            DialogueInput::Utterance("how do I reset my password".into()),
            &config(),
        );
        assert_eq!(s.state, CallState::SearchingKb);
        assert_eq!(s.pending_query.as_deref(), Some("how do I reset my password"));
        assert_eq!(
            step.effect,
            Some(Effect::Search("how do I reset my password".into()))
        );
    }

    #[test]
    fn relevant_candidate_delivers_answer() {
        let mut s = session_awaiting_issue();
        advance(
            &mut s,
            DialogueInput::Utterance("reset password".into()),
            &config(),
        );
        let step = advance(
            &mut s,
            DialogueInput::SearchResult(vec![candidate(0.9)]),
            &config(),
        );
        assert_eq!(s.state, CallState::DeliveringAnswer);
        assert!(step.say.unwrap().contains("Resetting your password"));

        let step = advance(&mut s, DialogueInput::AnswerDelivered, &config());
        assert_eq!(s.state, CallState::ConfirmingResolution);
        assert_eq!(step.say.as_deref(), Some(CONFIRM_PROMPT));
    }

    #[test]
    fn low_relevance_escalates_without_delivering() {
        // Scenario B: zero or below-threshold candidates skip delivering_answer.
        let mut s = session_awaiting_issue();
        advance(&mut s, DialogueInput::Utterance("niche topic".into()), &config());
        let step = advance(
            &mut s,
            DialogueInput::SearchResult(vec![candidate(0.2)]),
            &config(),
        );
        assert_eq!(s.state, CallState::Escalating);
        assert_eq!(step.effect, Some(Effect::FileTicket));
    }

    #[test]
    fn search_failure_matches_zero_candidates() {
        let mut a = session_awaiting_issue();
        advance(&mut a, DialogueInput::Utterance("q".into()), &config());
        advance(&mut a, DialogueInput::SearchResult(vec![]), &config());

        let mut b = session_awaiting_issue();
        advance(&mut b, DialogueInput::Utterance("q".into()), &config());
        advance(&mut b, DialogueInput::SearchFailed, &config());

        assert_eq!(a.state, CallState::Escalating);
        assert_eq!(a.state, b.state);
    }

    #[test]
    fn affirmative_confirmation_resolves() {
        let mut s = session_awaiting_issue();
        advance(&mut s, DialogueInput::Utterance("reset password".into()), &config());
        advance(&mut s, DialogueInput::SearchResult(vec![candidate(0.9)]), &config());
        advance(&mut s, DialogueInput::AnswerDelivered, &config());

        let step = advance(
            &mut s,
            DialogueInput::Utterance("yes, that helps".into()),
            &config(),
        );
        assert_eq!(s.outcome(), Some(Outcome::Resolved));
        assert_eq!(step.effect, Some(Effect::Hangup));
        assert!(s.pending_query.is_none());
    }

    #[test]
    fn negated_confirmation_escalates_not_resolves() {
        let mut s = session_awaiting_issue();
        advance(&mut s, DialogueInput::Utterance("reset password".into()), &config());
        advance(&mut s, DialogueInput::SearchResult(vec![candidate(0.9)]), &config());
        advance(&mut s, DialogueInput::AnswerDelivered, &config());

        let step = advance(
            &mut s,
            DialogueInput::Utterance("no it didn't help at all".into()),
            &config(),
        );
        assert_eq!(s.state, CallState::Escalating);
        assert_eq!(s.outcome(), None);
        assert_eq!(step.effect, Some(Effect::FileTicket));
    }

    #[test]
    fn affirmation_requires_unnegated_phrasing() {
        assert!(is_affirmative("Yes, that helped"));
        assert!(is_affirmative("yep, all set"));
        assert!(is_affirmative("it did, thanks"));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative("no it didn't help at all"));
        assert!(!is_affirmative("that's incorrect"));
        assert!(!is_affirmative("it did not work"));
        assert!(!is_affirmative("that doesn't answer it"));
        // Unclear stays non-affirmative.
        assert!(!is_affirmative("can you repeat that"));
    }

    #[test]
    fn unclear_confirmation_escalates() {
        let mut s = session_awaiting_issue();
        advance(&mut s, DialogueInput::Utterance("reset password".into()), &config());
        advance(&mut s, DialogueInput::SearchResult(vec![candidate(0.9)]), &config());
        advance(&mut s, DialogueInput::AnswerDelivered, &config());

        let step = advance(
            &mut s,
            DialogueInput::Utterance("hmm I'm not sure".into()),
            &config(),
        );
        assert_eq!(s.state, CallState::Escalating);
        assert_eq!(step.effect, Some(Effect::FileTicket));
    }

    #[test]
    fn ticket_filed_ends_escalated() {
        let mut s = session_awaiting_issue();
        advance(&mut s, DialogueInput::Utterance("q".into()), &config());
        advance(&mut s, DialogueInput::SearchResult(vec![]), &config());

        let step = advance(
            &mut s,
            DialogueInput::TicketFiled(TicketId("42".into())),
            &config(),
        );
        assert_eq!(s.outcome(), Some(Outcome::Escalated));
        assert!(!s.sink_pending);
        assert_eq!(step.effect, Some(Effect::Hangup));
    }

    #[test]
    fn ticket_failure_still_ends_gracefully() {
        let mut s = session_awaiting_issue();
        advance(&mut s, DialogueInput::Utterance("q".into()), &config());
        advance(&mut s, DialogueInput::SearchFailed, &config());

        let step = advance(&mut s, DialogueInput::TicketFailed, &config());
        assert_eq!(s.outcome(), Some(Outcome::Escalated));
        assert!(s.sink_pending);
        assert_eq!(step.say.as_deref(), Some(GOODBYE_SINK_DOWN));
        assert_eq!(step.effect, Some(Effect::Hangup));
    }

    #[test]
    fn disconnect_abandons_from_any_state() {
        let mut s = session_awaiting_issue();
        advance(&mut s, DialogueInput::Utterance("q".into()), &config());
        assert_eq!(s.state, CallState::SearchingKb);

        let step = advance(&mut s, DialogueInput::Disconnected, &config());
        assert_eq!(s.outcome(), Some(Outcome::Abandoned));
        assert!(step.say.is_none());
        assert!(step.effect.is_none());
    }

    #[test]
    fn idle_timeout_abandons_and_hangs_up() {
        let mut s = started_session();
        let step = advance(&mut s, DialogueInput::IdleTimeout, &config());
        assert_eq!(s.outcome(), Some(Outcome::Abandoned));
        assert_eq!(step.effect, Some(Effect::Hangup));
    }

    #[test]
    fn ended_absorbs_all_inputs() {
        let mut s = started_session();
        advance(&mut s, DialogueInput::Disconnected, &config());
        let transcript_len = s.transcript.len();

        for input in [
            DialogueInput::Utterance("hello?".into()),
            DialogueInput::SearchResult(vec![candidate(0.9)]),
            DialogueInput::TicketFiled(TicketId("7".into())),
            DialogueInput::CallStarted,
        ] {
            let step = advance(&mut s, input, &config());
            assert!(step.say.is_none());
            assert!(step.effect.is_none());
        }
        assert_eq!(s.outcome(), Some(Outcome::Abandoned));
        assert_eq!(s.transcript.len(), transcript_len);
    }

    #[test]
    fn synthesis_loss_escalates_for_the_record() {
        let mut s = session_awaiting_issue();
        let step = advance(&mut s, DialogueInput::SynthesisUnavailable, &config());
        assert_eq!(s.state, CallState::Escalating);
        assert_eq!(step.effect, Some(Effect::FileTicket));

        // A second loss mid-escalation retries the filing without a prompt.
        let step = advance(&mut s, DialogueInput::SynthesisUnavailable, &config());
        assert!(step.say.is_none());
        assert_eq!(step.effect, Some(Effect::FileTicket));
    }

    #[test]
    fn no_input_reprompts_are_bounded() {
        let mut s = session_awaiting_issue();
        for _ in 0..2 {
            let step = advance(&mut s, DialogueInput::NoInput, &config());
            assert_eq!(step.say.as_deref(), Some(ISSUE_REPROMPT));
        }
        let step = advance(&mut s, DialogueInput::NoInput, &config());
        assert_eq!(s.state, CallState::Escalating);
        assert_eq!(step.effect, Some(Effect::FileTicket));
    }

    #[test]
    fn talk_over_during_search_only_records() {
        let mut s = session_awaiting_issue();
        advance(&mut s, DialogueInput::Utterance("q".into()), &config());
        let before = s.transcript.len();
        let step = advance(
            &mut s,
            DialogueInput::Utterance("are you still there".into()),
            &config(),
        );
        assert_eq!(s.state, CallState::SearchingKb);
        assert!(step.say.is_none() && step.effect.is_none());
        assert_eq!(s.transcript.len(), before + 1);
    }

    #[test]
    fn long_answers_are_truncated_for_speech() {
        let long = KbCandidate {
            title: "Billing".into(),
            content: "A sentence. ".repeat(200),
            relevance_score: 0.9,
        };
        let text = answer_text(&long);
        assert!(text.chars().count() < 700);
        assert!(text.ends_with('.'));
    }
}
