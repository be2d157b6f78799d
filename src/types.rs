use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// External providers this service integrates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Calcom,
    Calendly,
    Stripe,
    Zoom,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Calcom,
        Provider::Calendly,
        Provider::Stripe,
        Provider::Zoom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Calcom => "calcom",
            Provider::Calendly => "calendly",
            Provider::Stripe => "stripe",
            Provider::Zoom => "zoom",
        }
    }

    /// Whether users connect this provider through the OAuth code flow.
    /// Stripe is authenticated with the platform's API key instead.
    pub fn uses_oauth(&self) -> bool {
        !matches!(self, Provider::Stripe)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "calcom" | "cal.com" | "cal" => Ok(Provider::Calcom),
            "calendly" => Ok(Provider::Calendly),
            "stripe" => Ok(Provider::Stripe),
            "zoom" => Ok(Provider::Zoom),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

// ─── Integration credentials ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// One user's connection to one provider. Keyed by `(user_id, provider)`.
#[derive(Clone, Serialize, Deserialize)]
pub struct IntegrationCredential {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub status: ConnectionStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationCredential {
    pub fn key(&self) -> (String, Provider) {
        (self.user_id.clone(), self.provider)
    }

    pub fn is_connected(&self) -> bool {
        self.status != ConnectionStatus::Disconnected && !self.access_token.is_empty()
    }
}

// Tokens stay out of Debug output so credentials can be logged safely.
impl fmt::Debug for IntegrationCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationCredential")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("access_token", &crate::config::redact(&self.access_token))
            .field(
                "refresh_token",
                &self.refresh_token.as_deref().map(crate::config::redact),
            )
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .finish()
    }
}

// ─── Webhook events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processed,
    Failed,
}

/// One inbound provider notification. `id` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub provider: Provider,
    pub event_type: String,
    /// Provider-neutral reference to what the event is about (booking uid,
    /// meeting id), extracted while parsing.
    pub subject: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
    #[serde(default)]
    pub attempts: u32,
    /// When the current processing attempt started.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub fn new(
        provider: Provider,
        id: impl Into<String>,
        event_type: impl Into<String>,
        subject: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            event_type: event_type.into(),
            subject,
            payload,
            received_at: Utc::now(),
            status: EventStatus::Pending,
            attempts: 0,
            claimed_at: None,
            last_error: None,
            processed_at: None,
        }
    }
}

// ─── Bookings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Scheduled,
    Rescheduled,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Failed,
    Refunded,
    Disputed,
}

/// Booking state as seen through provider webhooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub reference: String,
    pub provider: Provider,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub meeting_id: Option<String>,
    /// Number of applied updates.
    pub revision: u32,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(reference: impl Into<String>, provider: Provider) -> Self {
        Self {
            reference: reference.into(),
            provider,
            status: BookingStatus::Scheduled,
            payment_status: PaymentStatus::Unpaid,
            start_time: None,
            meeting_id: None,
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    /// Apply an update, returning whether anything changed.
    ///
    /// Deliveries arrive in any order. Cancelled and completed bookings never
    /// move back to scheduled/rescheduled, so a late BOOKING_CREATED
    /// redelivery cannot resurrect a cancelled booking. Payment changes are
    /// accepted in any booking state.
    pub fn apply(&mut self, update: &BookingUpdate) -> bool {
        let changed = match update {
            BookingUpdate::Status { status, start_time } => {
                let terminal = matches!(
                    self.status,
                    BookingStatus::Cancelled | BookingStatus::Completed
                );
                let allowed = match status {
                    BookingStatus::Scheduled | BookingStatus::Rescheduled => !terminal,
                    BookingStatus::Cancelled => self.status != BookingStatus::Cancelled,
                    BookingStatus::Completed => !terminal,
                };
                let new_start = start_time.or(self.start_time);
                if !allowed || (self.status == *status && self.start_time == new_start) {
                    false
                } else {
                    self.status = *status;
                    self.start_time = new_start;
                    true
                }
            }
            BookingUpdate::Payment(payment) => {
                if self.payment_status == *payment {
                    false
                } else {
                    self.payment_status = *payment;
                    true
                }
            }
            BookingUpdate::Meeting(meeting_id) => {
                if self.meeting_id.as_deref() == Some(meeting_id.as_str()) {
                    false
                } else {
                    self.meeting_id = Some(meeting_id.clone());
                    true
                }
            }
        };

        if changed {
            self.revision += 1;
            self.updated_at = Utc::now();
        }
        changed
    }
}

/// Change requested by a webhook handler.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingUpdate {
    Status {
        status: BookingStatus,
        start_time: Option<DateTime<Utc>>,
    },
    Payment(PaymentStatus),
    Meeting(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_aliases() {
        assert_eq!("cal.com".parse::<Provider>().unwrap(), Provider::Calcom);
        assert_eq!("Stripe".parse::<Provider>().unwrap(), Provider::Stripe);
        assert!("paypal".parse::<Provider>().is_err());
    }

    #[test]
    fn credential_debug_hides_tokens() {
        let now = Utc::now();
        let cred = IntegrationCredential {
            user_id: "user_1".into(),
            provider: Provider::Calendly,
            access_token: "access-token-value-123".into(),
            refresh_token: Some("refresh-token-value-456".into()),
            expires_at: None,
            scopes: vec![],
            status: ConnectionStatus::Connected,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let out = format!("{cred:?}");
        assert!(!out.contains("access-token-value-123"));
        assert!(!out.contains("refresh-token-value-456"));
    }

    #[test]
    fn cancelled_booking_is_not_resurrected() {
        let mut booking = Booking::new("bk_1", Provider::Calcom);
        assert!(booking.apply(&BookingUpdate::Status {
            status: BookingStatus::Cancelled,
            start_time: None,
        }));
        assert!(!booking.apply(&BookingUpdate::Status {
            status: BookingStatus::Scheduled,
            start_time: None,
        }));
        assert!(!booking.apply(&BookingUpdate::Status {
            status: BookingStatus::Rescheduled,
            start_time: Some(Utc::now()),
        }));
        assert_eq!(booking.status, BookingStatus::Cancelled);
        assert_eq!(booking.revision, 1);
    }

    #[test]
    fn repeated_update_is_a_no_op() {
        let mut booking = Booking::new("bk_2", Provider::Stripe);
        assert!(booking.apply(&BookingUpdate::Payment(PaymentStatus::Paid)));
        assert!(!booking.apply(&BookingUpdate::Payment(PaymentStatus::Paid)));
        assert_eq!(booking.revision, 1);
    }

    #[test]
    fn refunds_apply_to_cancelled_bookings() {
        let mut booking = Booking::new("bk_3", Provider::Stripe);
        booking.apply(&BookingUpdate::Status {
            status: BookingStatus::Cancelled,
            start_time: None,
        });
        assert!(booking.apply(&BookingUpdate::Payment(PaymentStatus::Refunded)));
        assert_eq!(booking.payment_status, PaymentStatus::Refunded);
    }

    #[test]
    fn status_serializes_screaming_case() {
        let v = serde_json::to_value(EventStatus::Processed).unwrap();
        assert_eq!(v, serde_json::json!("PROCESSED"));
    }
}
