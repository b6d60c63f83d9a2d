//! Webhook ingestion.
//!
//! Deliveries are authenticated with an HMAC-SHA256 signature, converted per
//! event kind into `ResourceEvent`s, and applied through
//! `SyncCoordinator::apply_event` so pushed and pulled changes share one
//! version-checked write path.

mod convert;
mod ingest;
mod signature;

pub use convert::{convert, WebhookKind};
pub use ingest::{DeliveryResponse, WebhookDelivery, WebhookEvent, WebhookIngest, WebhookResult};
pub use signature::{sign, verify, SIGNATURE_PREFIX};
