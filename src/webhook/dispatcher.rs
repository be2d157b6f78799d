//! Idempotent routing of verified events to their handlers.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{HandlerError, IntegrationError};
use crate::store::{EventClaim, EventStore};
use crate::types::WebhookEvent;

/// Minutes after which a PENDING claim is considered abandoned.
const CLAIM_STALE_AFTER_MINUTES: i64 = 5;

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    /// A handler ran and succeeded.
    Processed,
    /// The event id was already processed; nothing ran.
    Duplicate,
    /// No handler is registered for the event type.
    Ignored,
}

pub struct WebhookDispatcher {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
}

impl WebhookDispatcher {
    pub fn new(events: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            handlers: HashMap::new(),
            events,
            clock,
        }
    }

    /// Register `handler` for `event_type`, replacing any earlier one.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn WebhookHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub async fn dispatch(&self, event: WebhookEvent) -> Result<ProcessingResult, IntegrationError> {
        let provider = event.provider;
        let event_id = event.id.clone();
        let now = self.clock.now();

        let event = match self
            .events
            .claim_event(
                event,
                now,
                chrono::Duration::minutes(CLAIM_STALE_AFTER_MINUTES),
            )
            .await?
        {
            EventClaim::Claimed(event) => event,
            EventClaim::AlreadyProcessed(_) => {
                tracing::info!(
                    target: "webhook",
                    provider = %provider,
                    event_id = %event_id,
                    "Duplicate delivery, already processed"
                );
                return Ok(ProcessingResult::Duplicate);
            }
            EventClaim::InProgress => {
                tracing::info!(
                    target: "webhook",
                    provider = %provider,
                    event_id = %event_id,
                    "Delivery is already being processed"
                );
                return Err(IntegrationError::EventInProgress(event_id));
            }
        };

        let Some(handler) = self.handlers.get(&event.event_type) else {
            tracing::debug!(
                target: "webhook",
                provider = %provider,
                event_id = %event_id,
                event_type = %event.event_type,
                "No handler registered, ignoring"
            );
            self.events.mark_processed(provider, &event_id, now).await?;
            return Ok(ProcessingResult::Ignored);
        };

        match handler.handle(&event).await {
            Ok(()) => {
                self.events
                    .mark_processed(provider, &event_id, self.clock.now())
                    .await?;
                tracing::info!(
                    target: "webhook",
                    provider = %provider,
                    event_id = %event_id,
                    event_type = %event.event_type,
                    attempts = event.attempts,
                    "Webhook processed"
                );
                Ok(ProcessingResult::Processed)
            }
            Err(err) => {
                tracing::error!(
                    target: "webhook",
                    provider = %provider,
                    event_id = %event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "Webhook handler failed"
                );
                self.events
                    .mark_failed(provider, &event_id, &err.to_string())
                    .await?;
                Err(IntegrationError::Handler {
                    event_type: event.event_type,
                    message: err.0,
                })
            }
        }
    }
}
