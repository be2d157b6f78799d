use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::UserApi;
use crate::error::IntegrationError;
use crate::store::BookingStore;
use crate::types::{Booking, BookingUpdate};

/// Zoom meeting type for a scheduled (not instant, not recurring) meeting.
const SCHEDULED_MEETING: u8 = 2;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeetingRequest {
    pub topic: String,
    pub start_time: DateTime<Utc>,
    /// Minutes.
    pub duration: u32,
    #[serde(default)]
    pub agenda: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZoomMeeting {
    pub id: u64,
    pub join_url: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ZoomClient {
    api: UserApi,
    bookings: Arc<dyn BookingStore>,
}

impl ZoomClient {
    pub fn new(api: UserApi, bookings: Arc<dyn BookingStore>) -> Self {
        Self { api, bookings }
    }

    pub async fn create_meeting(
        &self,
        user_id: &str,
        request: &MeetingRequest,
    ) -> Result<ZoomMeeting, IntegrationError> {
        let body = serde_json::json!({
            "topic": request.topic,
            "type": SCHEDULED_MEETING,
            "start_time": request.start_time.to_rfc3339(),
            "duration": request.duration,
            "timezone": "UTC",
            "agenda": request.agenda,
        });
        let meeting: ZoomMeeting = self.api.post(user_id, "/users/me/meetings", &body).await?;
        tracing::info!(target: "provider", user_id, meeting_id = meeting.id, "Created Zoom meeting");
        Ok(meeting)
    }

    pub async fn get_meeting(
        &self,
        user_id: &str,
        meeting_id: &str,
    ) -> Result<ZoomMeeting, IntegrationError> {
        self.api
            .get(user_id, &format!("/meetings/{meeting_id}"), &[])
            .await
    }

    /// Link a meeting to the booking so `meeting.ended` can complete it.
    /// A booking that already has a meeting keeps it.
    pub async fn create_meeting_for_booking(
        &self,
        user_id: &str,
        booking: &Booking,
        request: &MeetingRequest,
    ) -> Result<(ZoomMeeting, Booking), IntegrationError> {
        if let Some(meeting_id) = booking.meeting_id.as_deref() {
            tracing::debug!(
                target: "provider",
                reference = %booking.reference,
                meeting_id,
                "Booking already has a meeting"
            );
            let meeting = self.get_meeting(user_id, meeting_id).await?;
            return Ok((meeting, booking.clone()));
        }

        let meeting = self.create_meeting(user_id, request).await?;
        let change = self
            .bookings
            .apply_booking_update(
                &booking.reference,
                booking.provider,
                BookingUpdate::Meeting(meeting.id.to_string()),
            )
            .await?;
        Ok((meeting, change.booking))
    }
}
