//! Turning raw provider deliveries into [`WebhookEvent`]s.
//!
//! Each provider shapes its payload differently; parsing pulls out the
//! idempotency key, the event type and the booking or meeting the event is
//! about, so handlers can stay provider-neutral.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::IntegrationError;
use crate::types::{Provider, WebhookEvent};

/// Zoom's endpoint ownership challenge. Never dispatched to handlers.
pub const ZOOM_URL_VALIDATION: &str = "endpoint.url_validation";

/// Inbound delivery, either a normal event or Zoom's validation challenge.
#[derive(Debug)]
pub enum Delivery {
    Event(WebhookEvent),
    ZoomUrlValidation { plain_token: String },
}

pub fn parse_delivery(provider: Provider, body: &[u8]) -> Result<Delivery, IntegrationError> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| IntegrationError::MalformedPayload(format!("invalid JSON: {e}")))?;
    if !payload.is_object() {
        return Err(malformed("payload must be a JSON object"));
    }

    let event = match provider {
        Provider::Calcom => parse_calcom(body, payload)?,
        Provider::Calendly => parse_calendly(payload)?,
        Provider::Stripe => parse_stripe(payload)?,
        Provider::Zoom => {
            if str_at(&payload, &["event"]) == Some(ZOOM_URL_VALIDATION) {
                let plain_token = str_at(&payload, &["payload", "plainToken"])
                    .ok_or_else(|| malformed("url validation without plainToken"))?;
                return Ok(Delivery::ZoomUrlValidation {
                    plain_token: plain_token.to_string(),
                });
            }
            parse_zoom(payload)?
        }
    };
    Ok(Delivery::Event(event))
}

fn malformed(msg: &str) -> IntegrationError {
    IntegrationError::MalformedPayload(msg.to_string())
}

fn value_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    value_at(value, path)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// String or number identifiers (Zoom meeting ids, Cal.com booking ids).
fn id_at(value: &Value, path: &[&str]) -> Option<String> {
    match value_at(value, path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn last_segment(uri: &str) -> &str {
    uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri)
}

fn parse_calcom(body: &[u8], payload: Value) -> Result<WebhookEvent, IntegrationError> {
    let trigger = str_at(&payload, &["triggerEvent"])
        .ok_or_else(|| malformed("missing triggerEvent"))?
        .to_string();
    let subject = str_at(&payload, &["payload", "uid"])
        .map(str::to_string)
        .or_else(|| id_at(&payload, &["payload", "bookingId"]));
    // Cal.com sends no delivery id; redeliveries repeat the exact body.
    let id = match id_at(&payload, &["id"]) {
        Some(id) => id,
        None => format!("{trigger}:{}", hex::encode(Sha256::digest(body))),
    };
    Ok(WebhookEvent::new(Provider::Calcom, id, trigger, subject, payload))
}

fn parse_calendly(payload: Value) -> Result<WebhookEvent, IntegrationError> {
    let event_type = str_at(&payload, &["event"])
        .ok_or_else(|| malformed("missing event"))?
        .to_string();
    let invitee = str_at(&payload, &["payload", "uri"])
        .ok_or_else(|| malformed("missing payload.uri"))?;
    let id = format!("{event_type}:{invitee}");
    let subject = str_at(&payload, &["payload", "scheduled_event", "uri"])
        .or_else(|| str_at(&payload, &["payload", "event"]))
        .map(|uri| last_segment(uri).to_string());
    Ok(WebhookEvent::new(Provider::Calendly, id, event_type, subject, payload))
}

fn parse_stripe(payload: Value) -> Result<WebhookEvent, IntegrationError> {
    let id = str_at(&payload, &["id"])
        .ok_or_else(|| malformed("missing id"))?
        .to_string();
    let event_type = str_at(&payload, &["type"])
        .ok_or_else(|| malformed("missing type"))?
        .to_string();
    let object = value_at(&payload, &["data", "object"]);
    let subject = object.and_then(|o| {
        str_at(o, &["metadata", "booking_reference"])
            .or_else(|| str_at(o, &["metadata", "booking_id"]))
            .or_else(|| str_at(o, &["client_reference_id"]))
            .map(str::to_string)
    });
    Ok(WebhookEvent::new(Provider::Stripe, id, event_type, subject, payload))
}

fn parse_zoom(payload: Value) -> Result<WebhookEvent, IntegrationError> {
    let event_type = str_at(&payload, &["event"])
        .ok_or_else(|| malformed("missing event"))?
        .to_string();
    let meeting_id = id_at(&payload, &["payload", "object", "id"]);
    let instance = str_at(&payload, &["payload", "object", "uuid"])
        .map(str::to_string)
        .or_else(|| meeting_id.clone())
        .ok_or_else(|| malformed("missing payload.object"))?;
    let ts = id_at(&payload, &["event_ts"]).unwrap_or_default();
    let id = format!("{event_type}:{instance}:{ts}");
    Ok(WebhookEvent::new(Provider::Zoom, id, event_type, meeting_id, payload))
}

/// Booking start time carried by scheduling events, when present.
pub fn start_time(event: &WebhookEvent) -> Option<DateTime<Utc>> {
    let raw = match event.provider {
        Provider::Calcom => str_at(&event.payload, &["payload", "startTime"]),
        Provider::Calendly => str_at(&event.payload, &["payload", "scheduled_event", "start_time"]),
        Provider::Zoom => str_at(&event.payload, &["payload", "object", "start_time"]),
        Provider::Stripe => None,
    }?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
