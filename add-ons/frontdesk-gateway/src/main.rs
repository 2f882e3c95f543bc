//! Axum gateway for the phone-support agent: telephony webhook, media
//! websocket, and the vendor adapters wired into the call runtime.

mod services;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use frontdesk_core::{
    ConversationEngine, EngineConfig, EscalationSink, KnowledgeResolver, ServiceConfig,
    SessionStore, SpeechSynthesizer, TelephonyOutbound,
};
use frontdesk_voice::{AudioBridge, CallRuntime, OutboundFrameSink, SpeechToText};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use services::telephony;
use services::{HelpdeskClient, MediaGateway, MediaMessage, SpeechClient, TelephonyControl};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct AppState {
    runtime: Arc<CallRuntime>,
    media: Arc<MediaGateway>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[frontdesk-gateway] .env not loaded: {e} (using system environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,frontdesk_core=debug,frontdesk_voice=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let service_config = match ServiceConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Could not load frontdesk.toml");
            std::process::exit(1);
        }
    };
    let engine_config = EngineConfig::from_env();

    let speech = match SpeechClient::new(&service_config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Speech vendor configuration invalid");
            std::process::exit(1);
        }
    };
    let helpdesk = match HelpdeskClient::new(&service_config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Helpdesk configuration invalid");
            std::process::exit(1);
        }
    };

    let media = Arc::new(MediaGateway::new());
    let bridge = Arc::new(AudioBridge::new(
        Arc::clone(&media) as Arc<dyn OutboundFrameSink>,
        engine_config.frame_queue_capacity,
    ));
    let control = Arc::new(TelephonyControl::new(
        Arc::clone(&bridge),
        Arc::clone(&media),
    ));
    let store = Arc::new(SessionStore::new());
    let engine = Arc::new(ConversationEngine::new(
        store,
        Arc::clone(&helpdesk) as Arc<dyn KnowledgeResolver>,
        Arc::clone(&helpdesk) as Arc<dyn EscalationSink>,
        Arc::clone(&speech) as Arc<dyn SpeechSynthesizer>,
        Arc::clone(&control) as Arc<dyn TelephonyOutbound>,
        engine_config,
    ));
    let runtime = Arc::new(CallRuntime::new(
        engine,
        Arc::clone(&bridge),
        Arc::clone(&speech) as Arc<dyn SpeechToText>,
        Arc::clone(&control) as Arc<dyn TelephonyOutbound>,
    ));
    let _idle_sweep = runtime.start_idle_sweeper(EVICTION_SWEEP_INTERVAL);

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .route("/media", get(media_stream))
        .with_state(AppState { runtime, media });

    let addr = std::env::var("FRONTDESK_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    info!(%addr, "Frontdesk gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

#[derive(Deserialize)]
struct WebhookForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
}

/// Telephony call-start webhook: answer with the XML document that bridges
/// the call's media onto our websocket.
async fn webhook(headers: HeaderMap, Form(form): Form<WebhookForm>) -> Response {
    info!(call_sid = %form.call_sid, "New call received");
    let host = std::env::var("FRONTDESK_PUBLIC_HOST")
        .ok()
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "localhost:8000".to_string());
    let xml = telephony::connect_stream_xml(&format!("wss://{host}/media"));
    ([(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}

async fn media_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

/// One provider media socket. The call sid arrives in the `start` event;
/// everything before it is handshake noise.
async fn handle_media_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let mut call_sid: Option<String> = None;
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "Media socket read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => match telephony::decode_media_message(&text) {
                Some(MediaMessage::Start { start }) => {
                    state
                        .media
                        .register(&start.call_sid, &start.stream_sid, out_tx.clone());
                    state.runtime.call_started(&start.call_sid).await;
                    call_sid = Some(start.call_sid);
                }
                Some(MediaMessage::Media { media }) => {
                    if let (Some(sid), Some(payload)) = (
                        call_sid.as_deref(),
                        telephony::decode_audio_payload(&media.payload),
                    ) {
                        state.runtime.bridge().on_inbound_frame(sid, payload);
                    }
                }
                Some(MediaMessage::Stop) => break,
                Some(MediaMessage::Connected) | Some(MediaMessage::Mark) => {}
                None => debug!("Unrecognized media frame skipped"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(sid) = call_sid {
        info!(call_sid = %sid, "Media socket ended");
        state.runtime.call_disconnected(&sid).await;
        state.media.unregister(&sid);
    }
    writer.abort();
}
