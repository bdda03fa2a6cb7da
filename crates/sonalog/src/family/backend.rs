//! Transport seam for the family channel.
//!
//! A [`FamilyBackend`] stores published location records per family code,
//! tracks member presence, and provides a change feed of inserts, updates
//! and deletes. [`MemoryBackend`] keeps everything in process.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::code::FamilyCode;
use crate::error::{Error, Result};
use crate::location::LocationRecord;

/// Buffer size of a change feed channel.
pub const FEED_CAPACITY: usize = 256;

/// One change feed notification.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A member published for the first time.
    Insert(LocationRecord),
    /// A member published again.
    Update(LocationRecord),
    /// A member's record was removed.
    Delete {
        /// Name of the removed member.
        member_name: String,
    },
    /// The feed broke; no further events will arrive.
    Failed {
        /// Description of the failure.
        reason: String,
    },
}

/// Presence row for one device in a family group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPresence {
    /// Family group the device belongs to.
    pub family_code: FamilyCode,
    /// Name the device publishes under.
    pub member_name: String,
    /// Stable device identifier; the presence key.
    pub device_id: String,
    /// Whether the device is currently sharing.
    pub is_active: bool,
    /// Last publish time.
    pub last_seen: DateTime<Utc>,
}

/// Remote store and change feed for family location records.
#[async_trait::async_trait]
pub trait FamilyBackend: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Every record published under `code`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportFailure`] if the backend is unreachable.
    async fn fetch_all(&self, code: &FamilyCode) -> Result<Vec<LocationRecord>>;

    /// Insert or overwrite the record keyed by `(code, record.member_name)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportFailure`] if the write is not acknowledged.
    async fn upsert_location(&self, code: &FamilyCode, record: &LocationRecord) -> Result<()>;

    /// Insert or overwrite the presence row keyed by device id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportFailure`] if the write is not acknowledged.
    async fn upsert_member(&self, presence: &MemberPresence) -> Result<()>;

    /// Register a newly minted family code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportFailure`] if the write is not acknowledged.
    async fn create_group(&self, code: &FamilyCode, created_by: &str) -> Result<()>;

    /// Open the change feed for `code`.
    ///
    /// The feed is live once this returns; events published afterwards are
    /// delivered in order. Dropping the receiver ends the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportFailure`] if the feed cannot be opened.
    async fn subscribe(&self, code: &FamilyCode) -> Result<mpsc::Receiver<FeedEvent>>;
}

#[derive(Debug, Clone)]
enum Broadcast {
    Event { code: FamilyCode, event: FeedEvent },
    Outage,
}

#[derive(Debug)]
struct MemoryState {
    locations: Mutex<HashMap<(FamilyCode, String), LocationRecord>>,
    members: Mutex<HashMap<String, MemberPresence>>,
    groups: Mutex<HashMap<FamilyCode, String>>,
    feed: broadcast::Sender<Broadcast>,
    offline: AtomicBool,
}

/// In-process backend.
///
/// Clones share state, so several channels built on clones of one backend
/// behave like devices talking to the same server.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Arc::new(MemoryState {
                locations: Mutex::new(HashMap::new()),
                members: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                feed,
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Simulate losing or regaining the connection.
    ///
    /// Going offline fails every open feed; while offline every operation
    /// returns [`Error::TransportFailure`].
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
        if offline {
            let _ = self.state.feed.send(Broadcast::Outage);
        }
    }

    /// Remove a member's record. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportFailure`] while offline.
    pub fn delete_location(&self, code: &FamilyCode, member_name: &str) -> Result<bool> {
        self.ensure_online()?;
        let removed = self
            .state
            .locations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(code.clone(), member_name.to_string()))
            .is_some();
        if removed {
            self.broadcast(
                code,
                FeedEvent::Delete {
                    member_name: member_name.to_string(),
                },
            );
        }
        Ok(removed)
    }

    /// Stored record for a member, if any.
    #[must_use]
    pub fn location(&self, code: &FamilyCode, member_name: &str) -> Option<LocationRecord> {
        self.state
            .locations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(code.clone(), member_name.to_string()))
            .cloned()
    }

    /// Stored presence row for a device, if any.
    #[must_use]
    pub fn presence(&self, device_id: &str) -> Option<MemberPresence> {
        self.state
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    /// Who registered a family code, if anyone.
    #[must_use]
    pub fn group_creator(&self, code: &FamilyCode) -> Option<String> {
        self.state
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code)
            .cloned()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.state.offline.load(Ordering::SeqCst) {
            Err(Error::transport("memory backend is offline"))
        } else {
            Ok(())
        }
    }

    fn broadcast(&self, code: &FamilyCode, event: FeedEvent) {
        // No subscribers is fine
        let _ = self.state.feed.send(Broadcast::Event {
            code: code.clone(),
            event,
        });
    }
}

#[async_trait::async_trait]
impl FamilyBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_all(&self, code: &FamilyCode) -> Result<Vec<LocationRecord>> {
        self.ensure_online()?;
        let mut records: Vec<_> = self
            .state
            .locations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((c, _), _)| c == code)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn upsert_location(&self, code: &FamilyCode, record: &LocationRecord) -> Result<()> {
        self.ensure_online()?;
        let previous = self
            .state
            .locations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((code.clone(), record.member_name.clone()), record.clone());

        let event = if previous.is_some() {
            FeedEvent::Update(record.clone())
        } else {
            FeedEvent::Insert(record.clone())
        };
        debug!(code = %code, member = %record.member_name, "Stored location");
        self.broadcast(code, event);
        Ok(())
    }

    async fn upsert_member(&self, presence: &MemberPresence) -> Result<()> {
        self.ensure_online()?;
        self.state
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(presence.device_id.clone(), presence.clone());
        Ok(())
    }

    async fn create_group(&self, code: &FamilyCode, created_by: &str) -> Result<()> {
        self.ensure_online()?;
        self.state
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code.clone(), created_by.to_string());
        Ok(())
    }

    async fn subscribe(&self, code: &FamilyCode) -> Result<mpsc::Receiver<FeedEvent>> {
        self.ensure_online()?;
        let mut source = self.state.feed.subscribe();
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let code = code.clone();

        tokio::spawn(async move {
            loop {
                let event = match source.recv().await {
                    Ok(Broadcast::Event { code: c, event }) if c == code => event,
                    Ok(Broadcast::Event { .. }) => continue,
                    Ok(Broadcast::Outage) => FeedEvent::Failed {
                        reason: "memory backend went offline".to_string(),
                    },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Change feed lagged");
                        FeedEvent::Failed {
                            reason: format!("change feed dropped {missed} events"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                let failed = matches!(event, FeedEvent::Failed { .. });
                if tx.send(event).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
