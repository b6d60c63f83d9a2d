//! Authenticated ingestion of pushed change notifications.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::resource::ResourceEvent;
use crate::sync::SyncCoordinator;

use super::convert::{self, WebhookKind};
use super::signature;

/// A parsed notification.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
  pub kind: WebhookKind,
  pub delivery_id: String,
  pub payload: serde_json::Value,
}

/// Outcome of converting (and, for deliveries, applying) a notification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WebhookResult {
  pub success: bool,
  pub events: Vec<ResourceEvent>,
  pub errors: Vec<String>,
  pub skipped: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

impl WebhookResult {
  fn skipped(reason: impl Into<String>) -> Self {
    Self {
      success: true,
      skipped: true,
      reason: Some(reason.into()),
      ..Default::default()
    }
  }
}

/// A raw delivery as received by the endpoint.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
  /// Declared event kind (`issues`, `projects_v2_item`, ...)
  pub event_kind: String,
  pub delivery_id: String,
  /// `sha256=<hex>` over the raw body
  pub signature: Option<String>,
  pub body: Vec<u8>,
}

/// What the endpoint answers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DeliveryResponse {
  /// Not processed at all
  Rejected { reason: String },
  /// Processed; the result says what was applied or skipped
  Accepted(WebhookResult),
}

impl DeliveryResponse {
  pub fn is_accepted(&self) -> bool {
    matches!(self, DeliveryResponse::Accepted(_))
  }
}

/// Validates and converts webhook deliveries.
pub struct WebhookIngest {
  secret: Option<Vec<u8>>,
  allow_unsigned: bool,
}

impl std::fmt::Debug for WebhookIngest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WebhookIngest")
      .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
      .field("allow_unsigned", &self.allow_unsigned)
      .finish()
  }
}

impl WebhookIngest {
  /// Without a secret every delivery is rejected unless `allow_unsigned` is
  /// set.
  pub fn new(secret: Option<String>, allow_unsigned: bool) -> Self {
    let secret = secret.filter(|s| !s.is_empty()).map(String::into_bytes);
    if secret.is_none() {
      if allow_unsigned {
        warn!("no webhook secret configured, unsigned deliveries will be ACCEPTED");
      } else {
        warn!("no webhook secret configured, all deliveries will be rejected");
      }
    }
    Self {
      secret,
      allow_unsigned,
    }
  }

  pub fn validate_signature(&self, payload: &[u8], signature: Option<&str>) -> bool {
    match (&self.secret, signature) {
      (Some(secret), Some(provided)) => signature::verify(secret, payload, provided),
      (Some(_), None) => false,
      (None, _) => {
        if self.allow_unsigned {
          warn!("accepting webhook delivery without signature verification");
        }
        self.allow_unsigned
      }
    }
  }

  fn authenticate(&self, delivery: &WebhookDelivery) -> Result<()> {
    if self.validate_signature(&delivery.body, delivery.signature.as_deref()) {
      Ok(())
    } else {
      Err(SyncError::SignatureInvalid)
    }
  }

  /// Convert a notification into events without applying them.
  pub fn process_webhook_event(&self, event: &WebhookEvent) -> WebhookResult {
    match &event.kind {
      WebhookKind::Ping => return WebhookResult::skipped("ping"),
      WebhookKind::Legacy(kind) => {
        return WebhookResult::skipped(format!("legacy event kind: {}", kind));
      }
      WebhookKind::Unsupported(kind) => {
        return WebhookResult::skipped(format!("unsupported event kind: {}", kind));
      }
      _ => {}
    }

    match convert::convert(&event.kind, &event.delivery_id, &event.payload) {
      Ok(events) if events.is_empty() => {
        let action = event
          .payload
          .get("action")
          .and_then(|a| a.as_str())
          .unwrap_or("<none>");
        WebhookResult::skipped(format!("action not tracked: {}", action))
      }
      Ok(events) => WebhookResult {
        success: true,
        events,
        ..Default::default()
      },
      Err(error) => WebhookResult {
        success: false,
        errors: vec![error],
        ..Default::default()
      },
    }
  }

  /// Authenticate, parse, convert, and apply a delivery.
  pub async fn handle_delivery(
    &self,
    delivery: &WebhookDelivery,
    coordinator: &SyncCoordinator,
  ) -> DeliveryResponse {
    if let Err(error) = self.authenticate(delivery) {
      warn!(delivery = %delivery.delivery_id, "rejecting webhook delivery: {}", error);
      return DeliveryResponse::Rejected {
        reason: error.to_string(),
      };
    }

    let payload: serde_json::Value = match serde_json::from_slice(&delivery.body) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(delivery = %delivery.delivery_id, "malformed webhook body: {}", e);
        return DeliveryResponse::Rejected {
          reason: format!("malformed JSON body: {}", e),
        };
      }
    };

    let event = WebhookEvent {
      kind: WebhookKind::parse(&delivery.event_kind),
      delivery_id: delivery.delivery_id.clone(),
      payload,
    };
    let mut result = self.process_webhook_event(&event);

    for resource_event in &result.events {
      match coordinator.apply_event(resource_event).await {
        Ok(outcome) => debug!(
          delivery = %delivery.delivery_id,
          resource_type = %resource_event.resource_type,
          resource_id = %resource_event.resource_id,
          ?outcome,
          "applied webhook event"
        ),
        Err(error) => {
          warn!(
            delivery = %delivery.delivery_id,
            resource_id = %resource_event.resource_id,
            "failed to apply webhook event: {}",
            error
          );
          result.errors.push(error.to_string());
          result.success = false;
        }
      }
    }

    info!(
      delivery = %delivery.delivery_id,
      kind = %delivery.event_kind,
      events = result.events.len(),
      errors = result.errors.len(),
      skipped = result.skipped,
      "webhook delivery processed"
    );
    DeliveryResponse::Accepted(result)
  }
}
