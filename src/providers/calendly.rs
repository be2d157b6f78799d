use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserApi;
use crate::error::IntegrationError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CalendlyUser {
    pub uri: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub current_organization: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduledEvent {
    pub uri: String,
    pub name: Option<String>,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Resource<T> {
    resource: T,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    collection: Vec<T>,
}

#[derive(Clone)]
pub struct CalendlyClient {
    api: UserApi,
}

impl CalendlyClient {
    pub fn new(api: UserApi) -> Self {
        Self { api }
    }

    pub async fn current_user(&self, user_id: &str) -> Result<CalendlyUser, IntegrationError> {
        let user: Resource<CalendlyUser> = self.api.get(user_id, "/users/me", &[]).await?;
        Ok(user.resource)
    }

    /// Active scheduled events owned by the Calendly user at `user_uri`.
    pub async fn list_scheduled_events(
        &self,
        user_id: &str,
        user_uri: &str,
    ) -> Result<Vec<ScheduledEvent>, IntegrationError> {
        let events: Collection<ScheduledEvent> = self
            .api
            .get(
                user_id,
                "/scheduled_events",
                &[("user", user_uri), ("status", "active")],
            )
            .await?;
        Ok(events.collection)
    }
}
