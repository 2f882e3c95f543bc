//! Vendor adapters behind the core trait seams. Everything here is thin
//! request/response glue; conversation decisions live in frontdesk-core.

pub mod helpdesk;
pub mod speech;
pub mod telephony;

pub use helpdesk::HelpdeskClient;
pub use speech::SpeechClient;
pub use telephony::{MediaGateway, MediaMessage, TelephonyControl};
