use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserApi;
use crate::error::IntegrationError;

/// Cal.com v2 requires an explicit API version on booking endpoints.
const CAL_API_VERSION: &str = "2024-08-13";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcomBooking {
    pub uid: String,
    #[serde(default)]
    pub title: Option<String>,
    pub status: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Clone)]
pub struct CalcomClient {
    api: UserApi,
}

impl CalcomClient {
    pub fn new(api: UserApi) -> Self {
        Self {
            api: api.with_header("cal-api-version", CAL_API_VERSION),
        }
    }

    /// Upcoming bookings for the connected coach.
    pub async fn list_bookings(&self, user_id: &str) -> Result<Vec<CalcomBooking>, IntegrationError> {
        let envelope: Envelope<Vec<CalcomBooking>> = self
            .api
            .get(user_id, "/bookings", &[("status", "upcoming")])
            .await?;
        Ok(envelope.data)
    }

    pub async fn cancel_booking(
        &self,
        user_id: &str,
        uid: &str,
        reason: &str,
    ) -> Result<(), IntegrationError> {
        let body = serde_json::json!({ "cancellationReason": reason });
        let _: serde_json::Value = self
            .api
            .post(user_id, &format!("/bookings/{uid}/cancel"), &body)
            .await?;
        tracing::info!(target: "provider", user_id, uid, "Cancelled Cal.com booking");
        Ok(())
    }
}
