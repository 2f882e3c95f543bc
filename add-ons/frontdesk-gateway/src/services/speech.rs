//! Speech vendor adapters: streaming STT over websocket, TTS over REST.
//!
//! The vendor streams recognition results as json events with interim and
//! final flags; synthesis is a single POST returning raw audio. Both sides
//! are asked for 8kHz mu-law so audio moves to and from the telephony
//! stream without transcoding.

use async_trait::async_trait;
use frontdesk_core::{CallError, CallResult, ServiceConfig, SpeechSynthesizer};
use frontdesk_voice::{SpeechToText, TranscriptionStream, UtteranceEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const DEFAULT_API_URL: &str = "https://api.deepgram.com";
const DEFAULT_STT_MODEL: &str = "nova-2";
const DEFAULT_TTS_MODEL: &str = "aura-asteria-en";

pub struct SpeechClient {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    stt_model: String,
    tts_model: String,
}

impl SpeechClient {
    pub fn new(config: &ServiceConfig) -> CallResult<Self> {
        let api_key = config
            .speech_api_key()
            .ok_or_else(|| CallError::Config("speech_api_key is not set".into()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            api_url: config
                .speech_api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            stt_model: config
                .stt_model
                .clone()
                .unwrap_or_else(|| DEFAULT_STT_MODEL.to_string()),
            tts_model: config
                .tts_model
                .clone()
                .unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
        })
    }
}

/// Streaming recognition endpoint with telephony audio parameters.
fn listen_url(api_url: &str, model: &str) -> String {
    let ws_base = api_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!(
        "{ws_base}/v1/listen?model={model}&punctuate=true&interim_results=true\
         &encoding=mulaw&sample_rate=8000"
    )
}

/// Synthesis endpoint producing telephony-ready audio.
fn speak_url(api_url: &str, model: &str) -> String {
    format!("{api_url}/v1/speak?model={model}&encoding=mulaw&sample_rate=8000&container=none")
}

/// Map one recognition event to an utterance event. Empty transcripts
/// (silence keepalives) and non-transcript events map to None.
fn parse_listen_event(text: &str) -> Option<UtteranceEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let alternative = value.get("channel")?.get("alternatives")?.get(0)?;
    let transcript = alternative.get("transcript")?.as_str()?.trim();
    if transcript.is_empty() {
        return None;
    }
    if value.get("is_final").and_then(|v| v.as_bool()).unwrap_or(false) {
        Some(UtteranceEvent::Final {
            text: transcript.to_string(),
            confidence: alternative
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0) as f32,
        })
    } else {
        Some(UtteranceEvent::Interim(transcript.to_string()))
    }
}

#[async_trait]
impl SpeechToText for SpeechClient {
    async fn open_stream(&self, session_id: &str) -> CallResult<TranscriptionStream> {
        let url = listen_url(&self.api_url, &self.stt_model);
        let mut request = url
            .into_client_request()
            .map_err(|e| CallError::TranscriptionFailed(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| CallError::TranscriptionFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| CallError::TranscriptionFailed(e.to_string()))?;
        debug!(session_id, "Recognition stream connected");
        let (mut sink, mut stream) = ws.split();

        let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(64);
        let (events_tx, events_rx) = mpsc::channel::<UtteranceEvent>(64);

        // Writer: audio frames out. Closing the frame side tells the vendor
        // to flush any pending final.
        tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        // Reader: recognition events in.
        let session = session_id.to_string();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_listen_event(&text) {
                            if events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(session_id = %session, error = %e, "Recognition stream error");
                        let _ = events_tx.send(UtteranceEvent::Failed(e.to_string())).await;
                        break;
                    }
                }
            }
        });

        Ok(TranscriptionStream {
            frames: frames_tx,
            events: events_rx,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for SpeechClient {
    async fn synthesize(&self, text: &str) -> CallResult<Vec<u8>> {
        let response = self
            .http
            .post(speak_url(&self.api_url, &self.tts_model))
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| CallError::SynthesisFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CallError::SynthesisFailed(format!(
                "speak returned {}",
                response.status()
            )));
        }
        let audio = response
            .bytes()
            .await
            .map_err(|e| CallError::SynthesisFailed(e.to_string()))?;
        debug!(bytes = audio.len(), "Synthesis complete");
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_url_is_websocket_with_telephony_params() {
        let url = listen_url("https://api.deepgram.com", "nova-2");
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("model=nova-2"));
        assert!(url.contains("interim_results=true"));
        assert!(url.contains("encoding=mulaw"));
        assert!(url.contains("sample_rate=8000"));
    }

    #[test]
    fn speak_url_requests_telephony_audio() {
        let url = speak_url("https://api.deepgram.com", "aura-asteria-en");
        assert!(url.contains("/v1/speak?"));
        assert!(url.contains("encoding=mulaw"));
    }

    #[test]
    fn final_event_parses_with_confidence() {
        let text = r#"{"is_final":true,
            "channel":{"alternatives":[{"transcript":"hello there","confidence":0.97}]}}"#;
        assert_eq!(
            parse_listen_event(text),
            Some(UtteranceEvent::Final {
                text: "hello there".into(),
                confidence: 0.97
            })
        );
    }

    #[test]
    fn interim_event_parses() {
        let text = r#"{"is_final":false,
            "channel":{"alternatives":[{"transcript":"hel","confidence":0.4}]}}"#;
        assert_eq!(parse_listen_event(text), Some(UtteranceEvent::Interim("hel".into())));
    }

    #[test]
    fn silence_and_metadata_events_are_skipped() {
        let silence = r#"{"is_final":true,"channel":{"alternatives":[{"transcript":""}]}}"#;
        assert_eq!(parse_listen_event(silence), None);
        let metadata = r#"{"type":"Metadata","request_id":"abc"}"#;
        assert_eq!(parse_listen_event(metadata), None);
        assert_eq!(parse_listen_event("not json"), None);
    }
}
