//! Helpdesk adapters: knowledge-base search and ticket creation.
//!
//! Auth is session-based: a basic-auth handshake against `me.json` yields a
//! session id that rides along as a header on every later request. A 401
//! invalidates the cached session and the request is retried once.

use async_trait::async_trait;
use frontdesk_core::{
    CallError, CallResult, EscalationSink, KbCandidate, KnowledgeResolver, ServiceConfig, Speaker,
    TicketDraft, TicketId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SEARCH_LIMIT: usize = 5;
const SESSION_HEADER: &str = "X-Session-ID";

pub struct HelpdeskClient {
    http: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    session: Mutex<Option<String>>,
}

impl HelpdeskClient {
    pub fn new(config: &ServiceConfig) -> CallResult<Self> {
        let base_url = config
            .helpdesk_url()
            .ok_or_else(|| CallError::Config("helpdesk_url is not set".into()))?;
        let (email, password) = config
            .helpdesk_auth()
            .ok_or_else(|| CallError::Config("helpdesk credentials are not set".into()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            email,
            password,
            session: Mutex::new(None),
        })
    }

    /// Session id, authenticating on first use.
    async fn session_id(&self) -> Result<String, String> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref() {
            return Ok(id.clone());
        }

        debug!("Authenticating with helpdesk");
        let response = self
            .http
            .get(format!("{}/api/v1/me.json", self.base_url))
            .basic_auth(&self.email, Some(&self.password))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("auth returned {}", response.status()));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        let id = body
            .get("session_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "auth response had no session_id".to_string())?
            .to_string();
        *session = Some(id.clone());
        Ok(id)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }
}

#[async_trait]
impl KnowledgeResolver for HelpdeskClient {
    async fn search(&self, query: &str) -> CallResult<Vec<KbCandidate>> {
        for attempt in 0..2 {
            let session_id = self
                .session_id()
                .await
                .map_err(CallError::ResolverUnavailable)?;
            let response = self
                .http
                .get(format!("{}/api/v1/helpcenter/articles.json", self.base_url))
                .header(SESSION_HEADER, &session_id)
                .query(&[
                    ("query", query),
                    ("limit", &SEARCH_LIMIT.to_string()),
                    ("include", "contents"),
                ])
                .send()
                .await
                .map_err(|e| CallError::ResolverUnavailable(e.to_string()))?;

            if response.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                self.invalidate_session().await;
                continue;
            }
            if !response.status().is_success() {
                return Err(CallError::ResolverUnavailable(format!(
                    "search returned {}",
                    response.status()
                )));
            }

            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| CallError::ResolverUnavailable(e.to_string()))?;
            let candidates = parse_articles(&body, query);
            debug!(query, count = candidates.len(), "Knowledge search complete");
            return Ok(candidates);
        }
        Err(CallError::ResolverUnavailable("session expired twice".into()))
    }
}

#[async_trait]
impl EscalationSink for HelpdeskClient {
    async fn file_ticket(&self, draft: &TicketDraft) -> CallResult<TicketId> {
        let requester = draft
            .contact
            .as_ref()
            .map(|c| c.email().to_string())
            .unwrap_or_else(|| "unknown.caller@invalid".to_string());
        let payload = serde_json::json!({
            "subject": draft.summary,
            "requester": { "email": requester },
            "channel": "phone",
            "status": "new",
            "priority": "normal",
            "description": render_transcript(draft),
        });

        for attempt in 0..2 {
            let session_id = self
                .session_id()
                .await
                .map_err(CallError::SinkUnavailable)?;
            let response = self
                .http
                .post(format!("{}/api/v1/cases.json", self.base_url))
                .header(SESSION_HEADER, &session_id)
                .json(&payload)
                .send()
                .await
                .map_err(|e| CallError::SinkUnavailable(e.to_string()))?;

            if response.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                self.invalidate_session().await;
                continue;
            }
            if !response.status().is_success() {
                return Err(CallError::SinkUnavailable(format!(
                    "ticket creation returned {}",
                    response.status()
                )));
            }

            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| CallError::SinkUnavailable(e.to_string()))?;
            let id = ticket_id_from(&body)
                .ok_or_else(|| CallError::SinkUnavailable("response had no ticket id".into()))?;
            info!(ticket_id = %id.0, "Ticket created");
            return Ok(id);
        }
        Err(CallError::SinkUnavailable("session expired twice".into()))
    }
}

fn ticket_id_from(body: &serde_json::Value) -> Option<TicketId> {
    let data = body.get("data").unwrap_or(body);
    match data.get("id") {
        Some(serde_json::Value::Number(n)) => Some(TicketId(n.to_string())),
        Some(serde_json::Value::String(s)) => Some(TicketId(s.clone())),
        _ => None,
    }
}

/// Flatten the article list to candidates, scored against the query. The
/// helpdesk does not return a relevance signal, so scoring is a plain
/// term-overlap ratio; ranking quality beyond that is out of scope.
fn parse_articles(body: &serde_json::Value, query: &str) -> Vec<KbCandidate> {
    let Some(articles) = body.get("data").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    let mut candidates: Vec<KbCandidate> = articles
        .iter()
        .filter_map(|article| {
            let title = localized_field(article, "titles")
                .or_else(|| article.get("title").and_then(|t| t.as_str()).map(str::to_string))?;
            let content = localized_field(article, "contents")
                .or_else(|| {
                    article
                        .get("content")
                        .and_then(|c| c.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_default();
            let content = strip_tags(&content);
            let score = overlap_score(query, &format!("{title} {content}"));
            Some(KbCandidate {
                title,
                content,
                relevance_score: score,
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// Articles carry locale-keyed field lists; take the first translation.
fn localized_field(article: &serde_json::Value, field: &str) -> Option<String> {
    article
        .get(field)?
        .as_array()?
        .first()?
        .get("translation")?
        .as_str()
        .map(str::to_string)
}

/// Share of query terms present in the document, in 0.0..=1.0.
fn overlap_score(query: &str, document: &str) -> f32 {
    let doc: std::collections::HashSet<String> = terms(document).collect();
    let mut total = 0u32;
    let mut hits = 0u32;
    for term in terms(query) {
        total += 1;
        if doc.contains(&term) {
            hits += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    hits as f32 / total as f32
}

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render_transcript(draft: &TicketDraft) -> String {
    let mut out = String::from("Call transcript:\n");
    for turn in &draft.transcript {
        let speaker = match turn.speaker {
            Speaker::Caller => "Caller",
            Speaker::Agent => "Agent",
        };
        out.push_str(&format!("{speaker}: {}\n", turn.text));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use frontdesk_core::TranscriptTurn;

    #[test]
    fn parses_localized_articles_and_ranks_by_overlap() {
        let body = serde_json::json!({
            "data": [
                {
                    "titles": [{"locale": "en-us", "translation": "Changing your plan"}],
                    "contents": [{"locale": "en-us", "translation": "<p>Go to billing to change your plan.</p>"}]
                },
                {
                    "titles": [{"locale": "en-us", "translation": "Resetting your password"}],
                    "contents": [{"locale": "en-us", "translation": "<p>Use the reset link to change your password.</p>"}]
                }
            ]
        });
        let candidates = parse_articles(&body, "how do I reset my password");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].title, "Resetting your password");
        assert!(candidates[0].relevance_score > candidates[1].relevance_score);
        assert!(!candidates[0].content.contains('<'));
    }

    #[test]
    fn empty_or_malformed_body_yields_no_candidates() {
        assert!(parse_articles(&serde_json::json!({"data": []}), "q").is_empty());
        assert!(parse_articles(&serde_json::json!({"error": "nope"}), "q").is_empty());
    }

    #[test]
    fn overlap_score_separates_relevant_from_unrelated() {
        let doc = "Resetting your password. Use the reset link in account settings.";
        assert!(overlap_score("reset my password", doc) >= 0.55);
        assert!(overlap_score("printer is on fire", doc) < 0.55);
        assert_eq!(overlap_score("", doc), 0.0);
    }

    #[test]
    fn ticket_id_accepts_number_or_string() {
        assert_eq!(
            ticket_id_from(&serde_json::json!({"data": {"id": 42}})),
            Some(TicketId("42".into()))
        );
        assert_eq!(
            ticket_id_from(&serde_json::json!({"id": "C-7"})),
            Some(TicketId("C-7".into()))
        );
        assert_eq!(ticket_id_from(&serde_json::json!({"ok": true})), None);
    }

    #[test]
    fn transcript_renders_speaker_lines() {
        let draft = TicketDraft {
            contact: None,
            summary: "Phone support request".into(),
            transcript: vec![
                TranscriptTurn::now(Speaker::Agent, "How can I help?".into()),
                TranscriptTurn::now(Speaker::Caller, "My login is broken.".into()),
            ],
        };
        let text = render_transcript(&draft);
        assert!(text.contains("Agent: How can I help?"));
        assert!(text.contains("Caller: My login is broken."));
    }
}
