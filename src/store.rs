//! Storage collaborators and the JSON-file store behind them.
//!
//! The traits are what the rest of the crate depends on; `JsonStore` keeps
//! everything in memory and, when given a data directory, mirrors each
//! collection to disk. Credentials and bookings are rewritten as whole JSON
//! files; webhook events are journaled one JSON line per change and compacted
//! when the store is opened. A failed write leaves memory unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{Booking, BookingUpdate, EventStatus, IntegrationCredential, Provider, WebhookEvent};

const CREDENTIALS_FILE: &str = "credentials.json";
const EVENTS_FILE: &str = "webhook_events.jsonl";
const BOOKINGS_FILE: &str = "bookings.json";

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<IntegrationCredential>, StoreError>;

    /// Insert or replace the credential for `(user_id, provider)`.
    async fn upsert_credential(
        &self,
        credential: IntegrationCredential,
    ) -> Result<IntegrationCredential, StoreError>;

    async fn list_credentials(&self, user_id: &str) -> Result<Vec<IntegrationCredential>, StoreError>;
}

/// Outcome of trying to take ownership of an event id.
#[derive(Debug, Clone)]
pub enum EventClaim {
    /// Caller now owns processing; the stored record is PENDING.
    Claimed(WebhookEvent),
    /// The event was processed before; nothing to do.
    AlreadyProcessed(WebhookEvent),
    /// Another delivery of the same id is being processed right now.
    InProgress,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically check the idempotency key and mark the event PENDING.
    ///
    /// A PENDING claim older than `stale_after` is treated as abandoned and
    /// may be re-claimed.
    async fn claim_event(
        &self,
        event: WebhookEvent,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<EventClaim, StoreError>;

    async fn mark_processed(
        &self,
        provider: Provider,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_failed(&self, provider: Provider, id: &str, error: &str) -> Result<(), StoreError>;

    async fn get_event(&self, provider: Provider, id: &str) -> Result<Option<WebhookEvent>, StoreError>;
}

/// Result of applying a booking update.
#[derive(Debug, Clone)]
pub struct BookingChange {
    pub booking: Booking,
    pub applied: bool,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_booking(&self, reference: &str) -> Result<Option<Booking>, StoreError>;

    /// Apply `update` to the booking, creating it when unseen.
    async fn apply_booking_update(
        &self,
        reference: &str,
        provider: Provider,
        update: BookingUpdate,
    ) -> Result<BookingChange, StoreError>;

    async fn find_by_meeting_id(&self, meeting_id: &str) -> Result<Option<Booking>, StoreError>;
}

fn event_key(provider: Provider, id: &str) -> String {
    format!("{provider}:{id}")
}

/// In-memory store, optionally mirrored to JSON files in `data_dir`.
pub struct JsonStore {
    data_dir: Option<PathBuf>,
    credentials: RwLock<HashMap<(String, Provider), IntegrationCredential>>,
    events: RwLock<HashMap<String, WebhookEvent>>,
    bookings: RwLock<HashMap<String, Booking>>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            credentials: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            bookings: RwLock::new(HashMap::new()),
        }
    }

    /// Open a file-backed store, loading whatever is already on disk.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let credentials: Vec<IntegrationCredential> =
            load_json(&data_dir.join(CREDENTIALS_FILE)).await?;
        let events = load_journal(&data_dir.join(EVENTS_FILE)).await?;
        let bookings: Vec<Booking> = load_json(&data_dir.join(BOOKINGS_FILE)).await?;

        tracing::info!(
            data_dir = %data_dir.display(),
            credentials = credentials.len(),
            events = events.len(),
            bookings = bookings.len(),
            "Loaded integration store"
        );

        let store = Self {
            data_dir: Some(data_dir),
            credentials: RwLock::new(credentials.into_iter().map(|c| (c.key(), c)).collect()),
            events: RwLock::new(events),
            bookings: RwLock::new(
                bookings
                    .into_iter()
                    .map(|b| (b.reference.clone(), b))
                    .collect(),
            ),
        };
        store.compact_events().await?;
        Ok(store)
    }

    async fn persist<'a, T, I>(&self, file: &str, items: I) -> Result<(), StoreError>
    where
        T: Serialize + 'a,
        I: Iterator<Item = &'a T>,
    {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let items: Vec<&T> = items.collect();
        let content = serde_json::to_vec_pretty(&items)?;
        let path = dir.join(file);
        let tmp = dir.join(format!("{file}.tmp"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Append one event record to the journal.
    async fn append_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Rewrite the journal with one line per event.
    async fn compact_events(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let map = self.events.read().await;
        let mut content = Vec::new();
        for event in map.values() {
            serde_json::to_writer(&mut content, event)?;
            content.push(b'\n');
        }
        let tmp = dir.join(format!("{EVENTS_FILE}.tmp"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, dir.join(EVENTS_FILE)).await?;
        Ok(())
    }

    /// Journal the event, then make it visible.
    async fn put_event(
        &self,
        map: &mut HashMap<String, WebhookEvent>,
        event: WebhookEvent,
    ) -> Result<(), StoreError> {
        self.append_event(&event).await?;
        map.insert(event_key(event.provider, &event.id), event);
        Ok(())
    }
}

/// Undo an insert after the write behind it failed.
fn restore<K: Eq + Hash, V>(map: &mut HashMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(previous) => {
            map.insert(key, previous);
        }
        None => {
            map.remove(&key);
        }
    }
}

async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Replay the event journal; the last record for a key wins.
async fn load_journal(path: &Path) -> Result<HashMap<String, WebhookEvent>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = HashMap::new();
    for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<WebhookEvent>(line) {
            Ok(event) => {
                events.insert(event_key(event.provider, &event.id), event);
            }
            // Torn write from a crash mid-append.
            Err(err) => tracing::warn!(
                path = %path.display(),
                line = index + 1,
                error = %err,
                "Skipping unreadable event journal line"
            ),
        }
    }
    Ok(events)
}

#[async_trait]
impl CredentialStore for JsonStore {
    async fn get_credential(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<IntegrationCredential>, StoreError> {
        let map = self.credentials.read().await;
        Ok(map.get(&(user_id.to_string(), provider)).cloned())
    }

    async fn upsert_credential(
        &self,
        credential: IntegrationCredential,
    ) -> Result<IntegrationCredential, StoreError> {
        let mut map = self.credentials.write().await;
        let mut credential = credential;
        let key = credential.key();
        if let Some(existing) = map.get(&key) {
            credential.created_at = existing.created_at;
        }
        let previous = map.insert(key.clone(), credential.clone());
        if let Err(err) = self.persist(CREDENTIALS_FILE, map.values()).await {
            restore(&mut *map, key, previous);
            return Err(err);
        }
        Ok(credential)
    }

    async fn list_credentials(&self, user_id: &str) -> Result<Vec<IntegrationCredential>, StoreError> {
        let map = self.credentials.read().await;
        let mut items: Vec<IntegrationCredential> = map
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        items.sort_by_key(|c| c.provider);
        Ok(items)
    }
}

#[async_trait]
impl EventStore for JsonStore {
    async fn claim_event(
        &self,
        event: WebhookEvent,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<EventClaim, StoreError> {
        let mut map = self.events.write().await;
        let key = event_key(event.provider, &event.id);

        let claimed = match map.get(&key) {
            Some(existing) => match existing.status {
                EventStatus::Processed => return Ok(EventClaim::AlreadyProcessed(existing.clone())),
                EventStatus::Pending
                    if existing
                        .claimed_at
                        .is_some_and(|at| now.signed_duration_since(at) < stale_after) =>
                {
                    return Ok(EventClaim::InProgress);
                }
                // Failed, or a pending claim that was abandoned.
                _ => {
                    let mut reclaimed = existing.clone();
                    reclaimed.status = EventStatus::Pending;
                    reclaimed.attempts += 1;
                    reclaimed.claimed_at = Some(now);
                    reclaimed.payload = event.payload;
                    reclaimed
                }
            },
            None => {
                let mut event = event;
                event.status = EventStatus::Pending;
                event.attempts = 1;
                event.claimed_at = Some(now);
                event
            }
        };

        self.put_event(&mut *map, claimed.clone()).await?;
        Ok(EventClaim::Claimed(claimed))
    }

    async fn mark_processed(
        &self,
        provider: Provider,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut map = self.events.write().await;
        let Some(mut event) = map.get(&event_key(provider, id)).cloned() else {
            return Ok(());
        };
        event.status = EventStatus::Processed;
        event.processed_at = Some(now);
        event.last_error = None;
        self.put_event(&mut *map, event).await
    }

    async fn mark_failed(&self, provider: Provider, id: &str, error: &str) -> Result<(), StoreError> {
        let mut map = self.events.write().await;
        let Some(mut event) = map.get(&event_key(provider, id)).cloned() else {
            return Ok(());
        };
        event.status = EventStatus::Failed;
        event.last_error = Some(error.to_string());
        self.put_event(&mut *map, event).await
    }

    async fn get_event(&self, provider: Provider, id: &str) -> Result<Option<WebhookEvent>, StoreError> {
        let map = self.events.read().await;
        Ok(map.get(&event_key(provider, id)).cloned())
    }
}

#[async_trait]
impl BookingStore for JsonStore {
    async fn get_booking(&self, reference: &str) -> Result<Option<Booking>, StoreError> {
        let map = self.bookings.read().await;
        Ok(map.get(reference).cloned())
    }

    async fn apply_booking_update(
        &self,
        reference: &str,
        provider: Provider,
        update: BookingUpdate,
    ) -> Result<BookingChange, StoreError> {
        let mut map = self.bookings.write().await;
        let existing = map.get(reference).cloned();
        let is_new = existing.is_none();
        let mut booking = existing.unwrap_or_else(|| Booking::new(reference, provider));

        let mut applied = booking.apply(&update);
        if is_new && !applied {
            // First sighting counts as an update even when it matches defaults.
            booking.revision = 1;
            applied = true;
        }

        if applied {
            let previous = map.insert(reference.to_string(), booking.clone());
            if let Err(err) = self.persist(BOOKINGS_FILE, map.values()).await {
                restore(&mut *map, reference.to_string(), previous);
                return Err(err);
            }
        }
        Ok(BookingChange { booking, applied })
    }

    async fn find_by_meeting_id(&self, meeting_id: &str) -> Result<Option<Booking>, StoreError> {
        let map = self.bookings.read().await;
        Ok(map
            .values()
            .find(|b| b.meeting_id.as_deref() == Some(meeting_id))
            .cloned())
    }
}
