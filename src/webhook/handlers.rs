//! Booking handlers for scheduling, payment and meeting events.
//!
//! Handlers are keyed by event type, not by provider, so a booking
//! cancellation relayed through any provider lands in the same place.

use async_trait::async_trait;
use std::sync::Arc;

use super::dispatcher::{WebhookDispatcher, WebhookHandler};
use super::events::start_time;
use crate::error::HandlerError;
use crate::store::BookingStore;
use crate::types::{BookingStatus, BookingUpdate, PaymentStatus, WebhookEvent};

/// Event types that change a booking's scheduling status.
const STATUS_EVENTS: [(&str, BookingStatus); 5] = [
    ("BOOKING_CREATED", BookingStatus::Scheduled),
    ("BOOKING_RESCHEDULED", BookingStatus::Rescheduled),
    ("BOOKING_CANCELLED", BookingStatus::Cancelled),
    ("invitee.created", BookingStatus::Scheduled),
    ("invitee.canceled", BookingStatus::Cancelled),
];

/// Event types that change a booking's payment status.
const PAYMENT_EVENTS: [(&str, PaymentStatus); 5] = [
    ("checkout.session.completed", PaymentStatus::Paid),
    ("payment_intent.succeeded", PaymentStatus::Paid),
    ("payment_intent.payment_failed", PaymentStatus::Failed),
    ("charge.refunded", PaymentStatus::Refunded),
    ("charge.dispute.created", PaymentStatus::Disputed),
];

pub const MEETING_ENDED: &str = "meeting.ended";

/// Wire the booking handlers into `dispatcher`.
pub fn register_booking_handlers(dispatcher: &mut WebhookDispatcher, bookings: Arc<dyn BookingStore>) {
    for (event_type, status) in STATUS_EVENTS {
        dispatcher.register(
            event_type,
            Arc::new(BookingStatusHandler {
                bookings: bookings.clone(),
                status,
            }),
        );
    }
    for (event_type, status) in PAYMENT_EVENTS {
        dispatcher.register(
            event_type,
            Arc::new(PaymentStatusHandler {
                bookings: bookings.clone(),
                status,
            }),
        );
    }
    dispatcher.register(MEETING_ENDED, Arc::new(MeetingEndedHandler { bookings }));
}

/// Events without a booking reference concern something else (a product
/// purchase, an unrelated meeting) and are acknowledged without changes.
fn booking_reference(event: &WebhookEvent) -> Option<&str> {
    let reference = event.subject.as_deref();
    if reference.is_none() {
        tracing::warn!(
            target: "webhook",
            provider = %event.provider,
            event_id = %event.id,
            event_type = %event.event_type,
            "Event carries no booking reference, skipping"
        );
    }
    reference
}

pub struct BookingStatusHandler {
    bookings: Arc<dyn BookingStore>,
    status: BookingStatus,
}

#[async_trait]
impl WebhookHandler for BookingStatusHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        let Some(reference) = booking_reference(event) else {
            return Ok(());
        };
        let update = BookingUpdate::Status {
            status: self.status,
            start_time: start_time(event),
        };
        let change = self
            .bookings
            .apply_booking_update(reference, event.provider, update)
            .await?;

        if change.applied {
            tracing::info!(
                target: "booking",
                reference,
                status = ?change.booking.status,
                revision = change.booking.revision,
                "Booking status updated"
            );
        } else {
            tracing::info!(
                target: "booking",
                reference,
                current = ?change.booking.status,
                requested = ?self.status,
                "Booking status update skipped"
            );
        }
        Ok(())
    }
}

pub struct PaymentStatusHandler {
    bookings: Arc<dyn BookingStore>,
    status: PaymentStatus,
}

#[async_trait]
impl WebhookHandler for PaymentStatusHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        let Some(reference) = booking_reference(event) else {
            return Ok(());
        };
        let change = self
            .bookings
            .apply_booking_update(reference, event.provider, BookingUpdate::Payment(self.status))
            .await?;
        tracing::info!(
            target: "booking",
            reference,
            payment_status = ?change.booking.payment_status,
            applied = change.applied,
            "Booking payment status"
        );
        Ok(())
    }
}

/// Marks the booking attached to a Zoom meeting as completed.
pub struct MeetingEndedHandler {
    bookings: Arc<dyn BookingStore>,
}

#[async_trait]
impl WebhookHandler for MeetingEndedHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        let Some(meeting_id) = event.subject.as_deref() else {
            return Err(HandlerError("meeting event without meeting id".to_string()));
        };
        let Some(booking) = self.bookings.find_by_meeting_id(meeting_id).await? else {
            tracing::debug!(target: "booking", meeting_id, "Meeting not linked to a booking");
            return Ok(());
        };

        let change = self
            .bookings
            .apply_booking_update(
                &booking.reference,
                booking.provider,
                BookingUpdate::Status {
                    status: BookingStatus::Completed,
                    start_time: None,
                },
            )
            .await?;
        tracing::info!(
            target: "booking",
            reference = %booking.reference,
            meeting_id,
            applied = change.applied,
            "Meeting ended"
        );
        Ok(())
    }
}
