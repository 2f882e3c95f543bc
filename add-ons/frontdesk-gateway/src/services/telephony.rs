//! Telephony provider glue: the webhook XML document, the media-stream
//! wire protocol, and outbound control toward live calls.
//!
//! The provider speaks json over the media websocket: a `start` event
//! carrying the call and stream ids, then `media` events with base64
//! mu-law payloads, then `stop`. Outbound audio goes back on the same
//! socket as `media` events keyed by stream id.

use axum::extract::ws::Message;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use frontdesk_core::{CallError, CallResult, TelephonyOutbound};
use frontdesk_voice::{AudioBridge, OutboundFrameSink};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Inbound message on the media websocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MediaMessage {
    Connected,
    Start { start: StartMeta },
    Media { media: MediaPayload },
    Mark,
    Stop,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub call_sid: String,
    pub stream_sid: String,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded mu-law audio.
    pub payload: String,
}

/// Parse one text frame from the media websocket. Unknown event types and
/// malformed frames come back as None and are skipped upstream.
pub fn decode_media_message(text: &str) -> Option<MediaMessage> {
    serde_json::from_str(text).ok()
}

pub fn decode_audio_payload(payload: &str) -> Option<Vec<u8>> {
    BASE64.decode(payload).ok()
}

/// One outbound media event for the given stream.
pub fn outbound_media_json(stream_sid: &str, payload: &[u8]) -> String {
    serde_json::json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": BASE64.encode(payload) },
    })
    .to_string()
}

/// Webhook answer document: tells the provider to bridge the call's media
/// onto our websocket.
pub fn connect_stream_xml(ws_url: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Response><Connect><Stream url=\"{}\"/></Connect></Response>",
        xml_escape(ws_url)
    )
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

struct CallWire {
    stream_sid: String,
    tx: mpsc::Sender<Message>,
}

/// Registry of live media sockets, keyed by call sid. The websocket
/// handler registers on `start` and unregisters when the socket ends;
/// everything else reaches the call through here.
#[derive(Default)]
pub struct MediaGateway {
    wires: DashMap<String, CallWire>,
}

impl MediaGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call_sid: &str, stream_sid: &str, tx: mpsc::Sender<Message>) {
        info!(call_sid, stream_sid, "Media stream registered");
        self.wires.insert(
            call_sid.to_string(),
            CallWire {
                stream_sid: stream_sid.to_string(),
                tx,
            },
        );
    }

    pub fn unregister(&self, call_sid: &str) {
        if self.wires.remove(call_sid).is_some() {
            debug!(call_sid, "Media stream unregistered");
        }
    }

    pub fn is_registered(&self, call_sid: &str) -> bool {
        self.wires.contains_key(call_sid)
    }

    /// Ask the provider to end the call by closing its media socket.
    pub async fn hangup(&self, call_sid: &str) -> CallResult<()> {
        let tx = match self.wires.get(call_sid) {
            Some(wire) => wire.tx.clone(),
            None => return Ok(()), // already gone
        };
        if tx.send(Message::Close(None)).await.is_err() {
            debug!(call_sid, "Close for already-dropped socket");
        }
        self.unregister(call_sid);
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutboundFrameSink for MediaGateway {
    async fn send_frame(&self, session_id: &str, payload: &[u8]) -> CallResult<()> {
        let (stream_sid, tx) = match self.wires.get(session_id) {
            Some(wire) => (wire.stream_sid.clone(), wire.tx.clone()),
            None => return Err(CallError::TransportDisconnected),
        };
        let frame = Message::Text(outbound_media_json(&stream_sid, payload));
        tx.send(frame)
            .await
            .map_err(|_| CallError::TransportDisconnected)
    }
}

/// The engine's outbound telephony seam: playback goes through the paced
/// bridge, hangup through the socket registry.
pub struct TelephonyControl {
    bridge: Arc<AudioBridge>,
    media: Arc<MediaGateway>,
}

impl TelephonyControl {
    pub fn new(bridge: Arc<AudioBridge>, media: Arc<MediaGateway>) -> Self {
        Self { bridge, media }
    }
}

#[async_trait::async_trait]
impl TelephonyOutbound for TelephonyControl {
    async fn play(&self, session_id: &str, audio: Vec<u8>) -> CallResult<()> {
        self.bridge.play(session_id, audio).await
    }

    async fn hangup(&self, session_id: &str) -> CallResult<()> {
        if let Err(e) = self.media.hangup(session_id).await {
            warn!(session_id, error = %e, "Hangup request failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_start_event() {
        let text = r#"{"event":"start","sequenceNumber":"1",
            "start":{"accountSid":"AC00","callSid":"CA123","streamSid":"MZ9",
                     "tracks":["inbound"],"mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}},
            "streamSid":"MZ9"}"#;
        match decode_media_message(text) {
            Some(MediaMessage::Start { start }) => {
                assert_eq!(start.call_sid, "CA123");
                assert_eq!(start.stream_sid, "MZ9");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_media_event_payload() {
        let text = r#"{"event":"media","sequenceNumber":"3",
            "media":{"track":"inbound","chunk":"2","timestamp":"40","payload":"AQID"},
            "streamSid":"MZ9"}"#;
        match decode_media_message(text) {
            Some(MediaMessage::Media { media }) => {
                assert_eq!(decode_audio_payload(&media.payload), Some(vec![1, 2, 3]));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_lifecycle_events_and_rejects_garbage() {
        assert!(matches!(
            decode_media_message(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#),
            Some(MediaMessage::Connected)
        ));
        assert!(matches!(
            decode_media_message(r#"{"event":"stop","stop":{"callSid":"CA123"},"streamSid":"MZ9"}"#),
            Some(MediaMessage::Stop)
        ));
        assert!(decode_media_message("not json").is_none());
        assert!(decode_media_message(r#"{"event":"dtmf"}"#).is_none());
    }

    #[test]
    fn outbound_media_roundtrips() {
        let json = outbound_media_json("MZ9", &[1, 2, 3]);
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["event"], "media");
        assert_eq!(v["streamSid"], "MZ9");
        assert_eq!(
            decode_audio_payload(v["media"]["payload"].as_str().unwrap()),
            Some(vec![1, 2, 3])
        );
    }

    #[test]
    fn connect_xml_escapes_the_url() {
        let xml = connect_stream_xml("wss://host/media?a=1&b=2");
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<Connect><Stream url=\"wss://host/media?a=1&amp;b=2\"/></Connect>"));
    }

    #[tokio::test]
    async fn registry_routes_frames_to_the_socket() {
        let gw = MediaGateway::new();
        let (tx, mut rx) = mpsc::channel(4);
        gw.register("CA1", "MZ1", tx);

        gw.send_frame("CA1", &[9, 9]).await.unwrap();
        match rx.recv().await {
            Some(Message::Text(text)) => {
                let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(v["streamSid"], "MZ1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_call_frame_is_an_error() {
        let gw = MediaGateway::new();
        let err = gw.send_frame("CA404", &[0]).await.unwrap_err();
        assert!(matches!(err, CallError::TransportDisconnected));
    }

    #[tokio::test]
    async fn hangup_closes_and_unregisters() {
        let gw = MediaGateway::new();
        let (tx, mut rx) = mpsc::channel(4);
        gw.register("CA1", "MZ1", tx);

        gw.hangup("CA1").await.unwrap();
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
        assert!(!gw.is_registered("CA1"));
        // Second hangup is a no-op.
        gw.hangup("CA1").await.unwrap();
    }
}
