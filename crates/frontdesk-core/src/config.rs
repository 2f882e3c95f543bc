//! Engine configuration loaded from the environment, plus the vendor
//! credential file.
//!
//! The retry bounds and the relevance threshold were never pinned down by
//! the product side, so they are explicit tunables here rather than
//! constants buried in the dialogue machine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_relevance_threshold() -> f32 {
    0.55
}

fn default_contact_retry_limit() -> u32 {
    3
}

fn default_reprompt_retry_limit() -> u32 {
    2
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_resolver_timeout_secs() -> u64 {
    10
}

fn default_synthesis_timeout_secs() -> u64 {
    15
}

fn default_sink_retry_limit() -> u32 {
    3
}

fn default_sink_backoff_ms() -> u64 {
    500
}

fn default_frame_queue_capacity() -> usize {
    64
}

fn default_utterance_queue_capacity() -> usize {
    8
}

/// Engine tunables loaded from environment.
///
/// | Env | Default | Description |
/// |-----|---------|--------------|
/// | FRONTDESK_RELEVANCE_THRESHOLD | 0.55 | Minimum resolver score to deliver an answer. |
/// | FRONTDESK_CONTACT_RETRY_LIMIT | 3 | Failed contact attempts before escalating. |
/// | FRONTDESK_REPROMPT_RETRY_LIMIT | 2 | No-input re-prompts per question before escalating. |
/// | FRONTDESK_IDLE_TIMEOUT_SECS | 90 | Inactivity before a session is evicted as abandoned. |
/// | FRONTDESK_RESOLVER_TIMEOUT_SECS | 10 | Knowledge-base search deadline per turn. |
/// | FRONTDESK_SINK_RETRY_LIMIT | 3 | Ticket filing attempts (doubling backoff). |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Resolver candidates below this relevance score are treated as misses.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,
    /// Malformed contact attempts before proceeding to escalation with contact unset.
    #[serde(default = "default_contact_retry_limit")]
    pub contact_retry_limit: u32,
    /// No-input re-prompts per question before the escalation exit.
    #[serde(default = "default_reprompt_retry_limit")]
    pub reprompt_retry_limit: u32,
    /// Idle eviction threshold; evicted sessions end as abandoned.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Knowledge resolver deadline; timeout is treated as zero candidates.
    #[serde(default = "default_resolver_timeout_secs")]
    pub resolver_timeout_secs: u64,
    /// Speech synthesis deadline per utterance.
    #[serde(default = "default_synthesis_timeout_secs")]
    pub synthesis_timeout_secs: u64,
    /// Escalation sink attempts before flagging the session for reconciliation.
    #[serde(default = "default_sink_retry_limit")]
    pub sink_retry_limit: u32,
    /// Initial sink backoff; doubles per attempt.
    #[serde(default = "default_sink_backoff_ms")]
    pub sink_backoff_ms: u64,
    /// Audio bridge bounded queue capacity (drop-oldest on saturation).
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
    /// Finalized-utterance handoff queue capacity per call.
    #[serde(default = "default_utterance_queue_capacity")]
    pub utterance_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: default_relevance_threshold(),
            contact_retry_limit: default_contact_retry_limit(),
            reprompt_retry_limit: default_reprompt_retry_limit(),
            idle_timeout_secs: default_idle_timeout_secs(),
            resolver_timeout_secs: default_resolver_timeout_secs(),
            synthesis_timeout_secs: default_synthesis_timeout_secs(),
            sink_retry_limit: default_sink_retry_limit(),
            sink_backoff_ms: default_sink_backoff_ms(),
            frame_queue_capacity: default_frame_queue_capacity(),
            utterance_queue_capacity: default_utterance_queue_capacity(),
        }
    }
}

impl EngineConfig {
    /// Load tunables from environment. Unset or invalid => defaults (see struct field docs).
    pub fn from_env() -> Self {
        Self {
            relevance_threshold: env_f32("FRONTDESK_RELEVANCE_THRESHOLD", 0.55).clamp(0.0, 1.0),
            contact_retry_limit: env_u32("FRONTDESK_CONTACT_RETRY_LIMIT", 3).max(1),
            reprompt_retry_limit: env_u32("FRONTDESK_REPROMPT_RETRY_LIMIT", 2).max(1),
            idle_timeout_secs: env_u64("FRONTDESK_IDLE_TIMEOUT_SECS", 90).max(5),
            resolver_timeout_secs: env_u64("FRONTDESK_RESOLVER_TIMEOUT_SECS", 10).max(1),
            synthesis_timeout_secs: env_u64("FRONTDESK_SYNTHESIS_TIMEOUT_SECS", 15).max(1),
            sink_retry_limit: env_u32("FRONTDESK_SINK_RETRY_LIMIT", 3).max(1),
            sink_backoff_ms: env_u64("FRONTDESK_SINK_BACKOFF_MS", 500).max(50),
            frame_queue_capacity: env_usize("FRONTDESK_FRAME_QUEUE_CAPACITY", 64).max(4),
            utterance_queue_capacity: env_usize("FRONTDESK_UTTERANCE_QUEUE_CAPACITY", 8).max(1),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    pub fn sink_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_backoff_ms)
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_f32(name: &str, default: f32) -> f32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ── Vendor credentials ──────────────────────────────────────────────────────
// Stored locally in frontdesk.toml so operators can point the gateway at
// their own speech and helpdesk tenants without code edits. Environment
// variables take over when the file leaves a field empty.

/// Vendor endpoints and credentials stored in frontdesk.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Speech vendor API key (STT + TTS).
    #[serde(default)]
    pub speech_api_key: Option<String>,

    /// Speech vendor base URL (default wired in the gateway adapters).
    #[serde(default)]
    pub speech_api_url: Option<String>,

    /// Streaming STT model identifier.
    #[serde(default)]
    pub stt_model: Option<String>,

    /// TTS voice/model identifier.
    #[serde(default)]
    pub tts_model: Option<String>,

    /// Helpdesk tenant base URL.
    #[serde(default)]
    pub helpdesk_url: Option<String>,

    /// Helpdesk agent email for basic auth.
    #[serde(default)]
    pub helpdesk_email: Option<String>,

    /// Helpdesk agent password for basic auth.
    #[serde(default)]
    pub helpdesk_password: Option<String>,
}

impl ServiceConfig {
    /// Default path for the credential file.
    pub fn default_path() -> PathBuf {
        PathBuf::from("frontdesk.toml")
    }

    /// Load from the default path, creating an empty template on first run.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from_path(&Self::default_path())
    }

    /// Load from a specific path, creating an empty template if missing.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: ServiceConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = ServiceConfig::default();
            config.save_to_path(path)?;
            Ok(config)
        }
    }

    /// Save to a specific path.
    pub fn save_to_path(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Speech API key with env fallback.
    pub fn speech_api_key(&self) -> Option<String> {
        self.speech_api_key
            .clone()
            .or_else(|| env_opt_string("FRONTDESK_SPEECH_API_KEY"))
    }

    /// Helpdesk base URL with env fallback.
    pub fn helpdesk_url(&self) -> Option<String> {
        self.helpdesk_url
            .clone()
            .or_else(|| env_opt_string("FRONTDESK_HELPDESK_URL"))
    }

    /// Helpdesk basic-auth pair with env fallbacks.
    pub fn helpdesk_auth(&self) -> Option<(String, String)> {
        let email = self
            .helpdesk_email
            .clone()
            .or_else(|| env_opt_string("FRONTDESK_HELPDESK_EMAIL"))?;
        let password = self
            .helpdesk_password
            .clone()
            .or_else(|| env_opt_string("FRONTDESK_HELPDESK_PASSWORD"))?;
        Some((email, password))
    }
}
