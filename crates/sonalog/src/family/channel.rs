//! Family channel client.
//!
//! A [`FamilyChannel`] holds at most one family session at a time and moves
//! through `Disconnected -> Connecting -> Subscribed`. Joining opens the
//! backend's change feed, loads every existing record into a last-write-wins
//! [`FamilyView`], then hands the feed to a background task that applies
//! inserts, updates and deletes until the session ends.
//!
//! Each session carries a generation number. Leaving, rejoining or losing the
//! transport bumps it, and the feed task drops any event whose generation is
//! stale, so nothing is applied after teardown.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{FamilyBackend, FeedEvent, MemberPresence};
use super::code::FamilyCode;
use super::view::FamilyView;
use crate::error::{Error, Result};
use crate::location::{LocationFix, LocationRecord, MemberStatus};

/// Prefix added to emergency alert messages.
pub const EMERGENCY_PREFIX: &str = "🆘 EMERGENCY: ";

/// Connection state of a family channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No live feed.
    #[default]
    Disconnected,
    /// Joining: the feed is opening and the bulk fetch is running.
    Connecting,
    /// Live; inbound records are applied to the view.
    Subscribed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Subscribed => write!(f, "subscribed"),
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    code: FamilyCode,
    member_name: String,
}

#[derive(Debug, Default)]
struct Shared {
    state: ConnectionState,
    generation: u64,
    session: Option<Session>,
    view: FamilyView,
    last_update: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_stamp: Option<DateTime<Utc>>,
    feed_task: Option<JoinHandle<()>>,
}

impl Shared {
    /// End the current session's feed and invalidate in-flight events.
    fn teardown(&mut self) {
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
    }
}

/// Client for one device's participation in a family group.
pub struct FamilyChannel {
    backend: Arc<dyn FamilyBackend>,
    device_id: String,
    shared: Arc<Mutex<Shared>>,
    changes: Arc<watch::Sender<u64>>,
}

impl fmt::Debug for FamilyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FamilyChannel")
            .field("backend", &self.backend.name())
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl FamilyChannel {
    /// Create a disconnected channel.
    #[must_use]
    pub fn new(backend: Arc<dyn FamilyBackend>, device_id: impl Into<String>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            backend,
            device_id: device_id.into(),
            shared: Arc::new(Mutex::new(Shared::default())),
            changes: Arc::new(changes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    /// Join a family group under `member_name`.
    ///
    /// Any current session is left first. On success the channel is
    /// `Subscribed` and the view holds the latest record of every member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty name, or the backend error
    /// if the feed or bulk fetch fails; the channel is then `Disconnected`.
    pub async fn join(&self, code: FamilyCode, member_name: &str) -> Result<()> {
        let member_name = member_name.trim();
        if member_name.is_empty() {
            return Err(Error::validation("member_name", "must not be empty"));
        }

        let generation = {
            let mut shared = self.lock();
            shared.teardown();
            shared.state = ConnectionState::Connecting;
            shared.session = Some(Session {
                code: code.clone(),
                member_name: member_name.to_string(),
            });
            shared.view = FamilyView::new();
            shared.last_update = None;
            shared.last_error = None;
            shared.last_stamp = None;
            shared.generation
        };
        self.notify();
        info!(code = %code, member = member_name, backend = self.backend.name(), "Joining family group");

        let opened = async {
            // Subscribe before fetching so nothing published in between is missed
            let feed = self.backend.subscribe(&code).await?;
            let records = self.backend.fetch_all(&code).await?;
            Ok::<_, Error>((feed, records))
        }
        .await;

        let (feed, records) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                {
                    let mut shared = self.lock();
                    if shared.generation == generation {
                        shared.state = ConnectionState::Disconnected;
                        shared.session = None;
                        shared.last_error = Some(e.to_string());
                    }
                }
                self.notify();
                warn!(code = %code, error = %e, "Failed to join family group");
                return Err(e);
            }
        };

        {
            let mut shared = self.lock();
            if shared.generation != generation {
                // Superseded by a concurrent join or leave
                return Ok(());
            }
            let view = FamilyView::from_records(records);
            shared.last_stamp = view.get(member_name).map(|own| own.updated_at);
            info!(code = %code, members = view.len(), "Subscribed to family group");
            shared.view = view;
            shared.last_update = Some(Utc::now());
            shared.state = ConnectionState::Subscribed;
            shared.feed_task = Some(tokio::spawn(run_feed(
                feed,
                self.shared.clone(),
                self.changes.clone(),
                generation,
            )));
        }
        self.notify();
        Ok(())
    }

    /// Leave the current session. In-flight notifications are discarded.
    pub fn leave(&self) {
        let left = {
            let mut shared = self.lock();
            shared.teardown();
            shared.session.take()
        };
        if let Some(session) = left {
            info!(code = %session.code, "Left family group");
        }
        self.notify();
    }

    /// Publish a record as this device's latest location.
    ///
    /// The record is upserted under `(family code, member name)`; the view is
    /// not touched until the change comes back through the feed. A transport
    /// failure downgrades the channel to `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotJoined`] without a session, [`Error::Validation`]
    /// for an invalid record or one for another member, or the backend error.
    pub async fn publish(&self, record: &LocationRecord) -> Result<()> {
        let (session, generation) = self.session()?;
        if record.member_name != session.member_name {
            return Err(Error::validation(
                "member_name",
                format!(
                    "record is for '{}' but this session publishes as '{}'",
                    record.member_name, session.member_name
                ),
            ));
        }
        record.validate()?;

        if let Err(e) = self.backend.upsert_location(&session.code, record).await {
            self.downgrade(generation, &e);
            return Err(e);
        }

        {
            let mut shared = self.lock();
            if shared.last_stamp.map_or(true, |last| record.updated_at > last) {
                shared.last_stamp = Some(record.updated_at);
            }
        }

        let presence = MemberPresence {
            family_code: session.code.clone(),
            member_name: session.member_name.clone(),
            device_id: self.device_id.clone(),
            is_active: true,
            last_seen: record.updated_at,
        };
        if let Err(e) = self.backend.upsert_member(&presence).await {
            warn!(error = %e, "Failed to update member presence");
        }

        info!(
            code = %session.code,
            member = %record.member_name,
            status = %record.status,
            "Published location"
        );
        Ok(())
    }

    /// Build this member's record from a fix, stamped later than any record
    /// this channel has stamped or seen published before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotJoined`] without a session.
    pub fn record_from_fix(
        &self,
        fix: &LocationFix,
        status: MemberStatus,
        message: Option<String>,
    ) -> Result<LocationRecord> {
        let (session, _) = self.session()?;
        let stamp = self.next_stamp();
        Ok(LocationRecord::from_fix(
            session.member_name,
            fix,
            status,
            message,
            stamp,
        ))
    }

    /// Publish a help request.
    ///
    /// Forces `need_help`, prefixes the message, and uses `last_known` as the
    /// position. Without a known position the record carries (0, 0). There is
    /// no delivery guarantee beyond the backend accepting the write.
    ///
    /// # Errors
    ///
    /// Same as [`FamilyChannel::publish`].
    pub async fn emergency_alert(
        &self,
        message: &str,
        last_known: Option<&LocationFix>,
    ) -> Result<LocationRecord> {
        let fallback;
        let fix = if let Some(fix) = last_known {
            fix
        } else {
            warn!("No known location for the emergency alert, sending (0, 0)");
            fallback = LocationFix::new(0.0, 0.0, 0.0);
            &fallback
        };

        let record = self.record_from_fix(
            fix,
            MemberStatus::NeedHelp,
            Some(format!("{EMERGENCY_PREFIX}{message}")),
        )?;
        self.publish(&record).await?;
        warn!(member = %record.member_name, "Emergency alert sent");
        Ok(record)
    }

    /// Re-run the bulk fetch and merge it into the view.
    ///
    /// Members missing from the fetch are dropped; for the rest the newer of
    /// the fetched and held record wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotJoined`] without a session, or the backend error.
    pub async fn refresh(&self) -> Result<()> {
        let (session, generation) = self.session()?;
        let records = match self.backend.fetch_all(&session.code).await {
            Ok(records) => records,
            Err(e) => {
                self.downgrade(generation, &e);
                return Err(e);
            }
        };

        {
            let mut shared = self.lock();
            if shared.generation != generation {
                return Ok(());
            }
            let mut fresh = FamilyView::from_records(records);
            for held in shared.view.members_by_recency() {
                if fresh.get(&held.member_name).is_some() {
                    fresh.apply(held);
                }
            }
            shared.view = fresh;
            shared.last_update = Some(Utc::now());
        }
        self.notify();
        debug!(code = %session.code, "Refreshed family view");
        Ok(())
    }

    /// Register a family code with the backend, recording this device as
    /// its creator.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn create_family_group(&self, code: &FamilyCode) -> Result<()> {
        self.backend.create_group(code, &self.device_id).await
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Whether the channel is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Subscribed
    }

    /// Code of the current session.
    #[must_use]
    pub fn family_code(&self) -> Option<FamilyCode> {
        self.lock().session.as_ref().map(|s| s.code.clone())
    }

    /// Member name of the current session.
    #[must_use]
    pub fn member_name(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.member_name.clone())
    }

    /// This device's identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Copy of the current view.
    #[must_use]
    pub fn view(&self) -> FamilyView {
        self.lock().view.clone()
    }

    /// Members' latest records, newest first.
    #[must_use]
    pub fn members(&self) -> Vec<LocationRecord> {
        self.lock().view.members_by_recency()
    }

    /// When the view last changed.
    #[must_use]
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.lock().last_update
    }

    /// Why the channel last dropped to `Disconnected`.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Receiver that is marked changed whenever the state or view changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn session(&self) -> Result<(Session, u64)> {
        let shared = self.lock();
        shared
            .session
            .clone()
            .map(|session| (session, shared.generation))
            .ok_or(Error::NotJoined)
    }

    fn next_stamp(&self) -> DateTime<Utc> {
        let mut shared = self.lock();
        let now = Utc::now();
        let stamp = match shared.last_stamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        shared.last_stamp = Some(stamp);
        stamp
    }

    fn downgrade(&self, generation: u64, error: &Error) {
        // A backend call that times out is as unreachable as one that fails
        if !error.is_transport_failure() && !matches!(error, Error::Timeout { .. }) {
            return;
        }
        {
            let mut shared = self.lock();
            if shared.generation != generation || shared.state == ConnectionState::Disconnected {
                return;
            }
            shared.teardown();
            shared.last_error = Some(error.to_string());
        }
        warn!(error = %error, "Family channel disconnected");
        self.notify();
    }
}

impl Drop for FamilyChannel {
    fn drop(&mut self) {
        self.lock().teardown();
    }
}

/// Apply feed events to the shared view until the session ends.
async fn run_feed(
    mut feed: mpsc::Receiver<FeedEvent>,
    shared: Arc<Mutex<Shared>>,
    changes: Arc<watch::Sender<u64>>,
    generation: u64,
) {
    while let Some(event) = feed.recv().await {
        let (changed, disconnected) = {
            let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.generation != generation || shared.state != ConnectionState::Subscribed {
                debug!("Discarding event for a closed session");
                return;
            }

            let outcome = match event {
                FeedEvent::Insert(record) | FeedEvent::Update(record) => {
                    let member = record.member_name.clone();
                    let applied = shared.view.apply(record);
                    if !applied {
                        debug!(%member, "Discarded stale record");
                    }
                    (applied, false)
                }
                FeedEvent::Delete { member_name } => (shared.view.remove(&member_name), false),
                FeedEvent::Failed { reason } => {
                    warn!(%reason, "Change feed failed");
                    shared.generation += 1;
                    shared.state = ConnectionState::Disconnected;
                    shared.last_error = Some(reason);
                    shared.feed_task = None;
                    (false, true)
                }
            };
            if outcome.0 {
                shared.last_update = Some(Utc::now());
            }
            outcome
        };

        if changed || disconnected {
            changes.send_modify(|n| *n += 1);
        }
        if disconnected {
            return;
        }
    }

    let closed = {
        let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.generation == generation && shared.state == ConnectionState::Subscribed {
            shared.generation += 1;
            shared.state = ConnectionState::Disconnected;
            shared.last_error = Some("change feed closed".to_string());
            shared.feed_task = None;
            true
        } else {
            false
        }
    };
    if closed {
        warn!("Change feed closed");
        changes.send_modify(|n| *n += 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::family::backend::MemoryBackend;

    fn code() -> FamilyCode {
        FamilyCode::parse("ABC123").unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn rec(name: &str, secs: i64) -> LocationRecord {
        LocationRecord {
            member_name: name.to_string(),
            latitude: 35.0,
            longitude: 139.0,
            accuracy: 10.0,
            address: None,
            status: MemberStatus::Safe,
            message: None,
            battery_level: None,
            updated_at: at(secs),
        }
    }

    fn channel(backend: &MemoryBackend, device: &str) -> FamilyChannel {
        FamilyChannel::new(Arc::new(backend.clone()), device)
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_join_reduces_existing_records() {
        let backend = MemoryBackend::new();
        let other = FamilyCode::parse("ZZZ999").unwrap();
        backend.upsert_location(&code(), &rec("Taro", 5)).await.unwrap();
        backend.upsert_location(&code(), &rec("Hanako", 3)).await.unwrap();
        backend.upsert_location(&other, &rec("Jiro", 9)).await.unwrap();

        let channel = channel(&backend, "device_a");
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        channel.join(code(), "Hanako").await.unwrap();
        assert!(channel.is_connected());
        assert_eq!(channel.family_code(), Some(code()));
        assert_eq!(channel.member_name().as_deref(), Some("Hanako"));

        let view = channel.view();
        assert_eq!(view.len(), 2);
        assert_eq!(view.get("Taro").unwrap().updated_at, at(5));
        assert!(view.get("Jiro").is_none());
        assert!(channel.last_update().is_some());
    }

    #[tokio::test]
    async fn test_join_rejects_empty_name() {
        let backend = MemoryBackend::new();
        let err = channel(&backend, "d").join(code(), "  ").await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_join_failure_leaves_disconnected() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        let channel = channel(&backend, "d");

        let err = channel.join(code(), "Taro").await.unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(channel.family_code().is_none());
        assert!(channel.last_error().is_some());
    }

    #[tokio::test]
    async fn test_live_feed_between_devices() {
        let backend = MemoryBackend::new();
        let observer = channel(&backend, "device_a");
        let publisher = channel(&backend, "device_b");
        observer.join(code(), "Hanako").await.unwrap();
        publisher.join(code(), "Taro").await.unwrap();

        let fix = LocationFix::new(34.69, 135.50, 15.0);
        let record = publisher
            .record_from_fix(&fix, MemberStatus::Evacuating, Some("heading to school".into()))
            .unwrap();
        publisher.publish(&record).await.unwrap();

        eventually("observer to see Taro", || observer.view().get("Taro").is_some()).await;
        let seen = observer.view().get("Taro").cloned().unwrap();
        assert_eq!(seen, record);
    }

    #[tokio::test]
    async fn test_out_of_order_arrival_converges_on_newest() {
        let backend = MemoryBackend::new();
        let observer = channel(&backend, "device_c");
        observer.join(code(), "Hanako").await.unwrap();

        // Two devices publishing as "Taro": the newer record lands first
        backend.upsert_location(&code(), &rec("Taro", 2)).await.unwrap();
        backend.upsert_location(&code(), &rec("Taro", 1)).await.unwrap();
        backend.upsert_location(&code(), &rec("Marker", 0)).await.unwrap();

        eventually("marker", || observer.view().get("Marker").is_some()).await;
        assert_eq!(observer.view().get("Taro").unwrap().updated_at, at(2));
    }

    #[tokio::test]
    async fn test_delete_removes_member() {
        let backend = MemoryBackend::new();
        backend.upsert_location(&code(), &rec("Taro", 1)).await.unwrap();
        let observer = channel(&backend, "d");
        observer.join(code(), "Hanako").await.unwrap();
        assert_eq!(observer.view().len(), 1);

        backend.delete_location(&code(), "Taro").unwrap();
        eventually("delete", || observer.view().is_empty()).await;
    }

    #[tokio::test]
    async fn test_leave_discards_later_events() {
        let backend = MemoryBackend::new();
        let observer = channel(&backend, "d");
        observer.join(code(), "Hanako").await.unwrap();

        observer.leave();
        assert_eq!(observer.state(), ConnectionState::Disconnected);
        assert!(observer.family_code().is_none());

        backend.upsert_location(&code(), &rec("Taro", 1)).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(observer.view().get("Taro").is_none());
    }

    #[tokio::test]
    async fn test_feed_failure_disconnects_without_retry() {
        let backend = MemoryBackend::new();
        let observer = channel(&backend, "d");
        observer.join(code(), "Hanako").await.unwrap();

        backend.set_offline(true);
        eventually("disconnect", || !observer.is_connected()).await;
        assert!(observer.last_error().unwrap().contains("offline"));

        backend.set_offline(false);
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(observer.state(), ConnectionState::Disconnected);

        observer.join(code(), "Hanako").await.unwrap();
        assert!(observer.is_connected());
    }

    #[tokio::test]
    async fn test_publish_requires_session() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "d");
        let err = channel.publish(&rec("Taro", 1)).await.unwrap_err();
        assert!(matches!(err, Error::NotJoined));

        let err = channel
            .record_from_fix(&LocationFix::new(0.0, 0.0, 0.0), MemberStatus::Safe, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotJoined));
    }

    #[tokio::test]
    async fn test_publish_rejects_other_member() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "d");
        channel.join(code(), "Hanako").await.unwrap();

        let err = channel.publish(&rec("Taro", 1)).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_publish_failure_downgrades_and_skips_view() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "d");
        channel.join(code(), "Taro").await.unwrap();

        // Going offline fails the feed too; either path ends disconnected
        backend.set_offline(true);
        let err = channel.publish(&rec("Taro", 1)).await.unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(channel.view().get("Taro").is_none());
        assert!(backend.location(&code(), "Taro").is_none());
    }

    #[tokio::test]
    async fn test_identical_publish_is_idempotent() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "d");
        channel.join(code(), "Taro").await.unwrap();
        let record = rec("Taro", 1);

        channel.publish(&record).await.unwrap();
        let first = backend.fetch_all(&code()).await.unwrap();
        channel.publish(&record).await.unwrap();
        assert_eq!(backend.fetch_all(&code()).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_publish_updates_presence() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "device_42");
        channel.join(code(), "Taro").await.unwrap();
        channel.publish(&rec("Taro", 1)).await.unwrap();

        let presence = backend.presence("device_42").unwrap();
        assert_eq!(presence.member_name, "Taro");
        assert_eq!(presence.family_code, code());
        assert!(presence.is_active);
        assert_eq!(presence.last_seen, at(1));
    }

    #[tokio::test]
    async fn test_stamps_strictly_increase() {
        let backend = MemoryBackend::new();
        // An earlier session left a record stamped in the future
        let future = Utc::now() + Duration::hours(1);
        let mut own = rec("Taro", 0);
        own.updated_at = future;
        backend.upsert_location(&code(), &own).await.unwrap();

        let channel = channel(&backend, "d");
        channel.join(code(), "Taro").await.unwrap();

        let fix = LocationFix::new(1.0, 1.0, 1.0);
        let a = channel.record_from_fix(&fix, MemberStatus::Safe, None).unwrap();
        let b = channel.record_from_fix(&fix, MemberStatus::Safe, None).unwrap();
        assert!(a.updated_at > future);
        assert!(b.updated_at > a.updated_at);
    }

    #[tokio::test]
    async fn test_emergency_alert() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "d");
        channel.join(code(), "Taro").await.unwrap();

        let fix = LocationFix::new(35.68, 139.76, 8.0);
        let record = channel.emergency_alert("trapped", Some(&fix)).await.unwrap();
        assert_eq!(record.status, MemberStatus::NeedHelp);
        assert_eq!(record.message.as_deref(), Some("🆘 EMERGENCY: trapped"));
        assert!((record.latitude - 35.68).abs() < f64::EPSILON);
        assert_eq!(backend.location(&code(), "Taro"), Some(record));
    }

    #[tokio::test]
    async fn test_emergency_alert_without_location() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "d");
        channel.join(code(), "Taro").await.unwrap();

        let record = channel.emergency_alert("help", None).await.unwrap();
        assert!(record.latitude.abs() < f64::EPSILON);
        assert!(record.longitude.abs() < f64::EPSILON);
    }

    /// Backend whose change feed stays open but never delivers anything.
    #[derive(Debug)]
    struct SilentFeed {
        inner: MemoryBackend,
        senders: Mutex<Vec<mpsc::Sender<FeedEvent>>>,
    }

    #[async_trait::async_trait]
    impl FamilyBackend for SilentFeed {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn fetch_all(&self, code: &FamilyCode) -> Result<Vec<LocationRecord>> {
            self.inner.fetch_all(code).await
        }

        async fn upsert_location(&self, code: &FamilyCode, record: &LocationRecord) -> Result<()> {
            self.inner.upsert_location(code, record).await
        }

        async fn upsert_member(&self, presence: &MemberPresence) -> Result<()> {
            self.inner.upsert_member(presence).await
        }

        async fn create_group(&self, code: &FamilyCode, created_by: &str) -> Result<()> {
            self.inner.create_group(code, created_by).await
        }

        async fn subscribe(&self, _code: &FamilyCode) -> Result<mpsc::Receiver<FeedEvent>> {
            let (tx, rx) = mpsc::channel(1);
            self.senders.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_refresh_picks_up_missed_changes() {
        let backend = MemoryBackend::new();
        backend.upsert_location(&code(), &rec("Jiro", 1)).await.unwrap();
        let channel = FamilyChannel::new(
            Arc::new(SilentFeed {
                inner: backend.clone(),
                senders: Mutex::new(Vec::new()),
            }),
            "d",
        );
        channel.join(code(), "Hanako").await.unwrap();
        assert!(channel.view().get("Jiro").is_some());

        backend.upsert_location(&code(), &rec("Taro", 1)).await.unwrap();
        backend.delete_location(&code(), "Jiro").unwrap();
        assert!(channel.view().get("Taro").is_none());

        channel.refresh().await.unwrap();
        let view = channel.view();
        assert!(view.get("Taro").is_some());
        assert!(view.get("Jiro").is_none());
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_refresh_failure_downgrades() {
        let backend = MemoryBackend::new();
        let channel = FamilyChannel::new(
            Arc::new(SilentFeed {
                inner: backend.clone(),
                senders: Mutex::new(Vec::new()),
            }),
            "d",
        );
        channel.join(code(), "Hanako").await.unwrap();

        backend.set_offline(true);
        assert!(channel.refresh().await.unwrap_err().is_transport_failure());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refresh_requires_session() {
        let backend = MemoryBackend::new();
        let err = channel(&backend, "d").refresh().await.unwrap_err();
        assert!(matches!(err, Error::NotJoined));
    }

    #[tokio::test]
    async fn test_create_family_group_records_creator() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "device_7");
        let code = FamilyCode::generate();
        channel.create_family_group(&code).await.unwrap();
        assert_eq!(backend.group_creator(&code).as_deref(), Some("device_7"));
    }

    #[tokio::test]
    async fn test_watch_notifies_on_change() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "d");
        let mut changes = channel.watch();
        channel.join(code(), "Hanako").await.unwrap();
        changes.borrow_and_update();

        backend.upsert_location(&code(), &rec("Taro", 1)).await.unwrap();
        tokio::time::timeout(StdDuration::from_secs(1), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(channel.view().get("Taro").is_some());
    }

    #[tokio::test]
    async fn test_rejoin_switches_groups() {
        let backend = MemoryBackend::new();
        let other = FamilyCode::parse("ZZZ999").unwrap();
        backend.upsert_location(&other, &rec("Jiro", 1)).await.unwrap();

        let channel = channel(&backend, "d");
        channel.join(code(), "Hanako").await.unwrap();
        channel.join(other.clone(), "Hanako").await.unwrap();

        assert_eq!(channel.family_code(), Some(other));
        assert!(channel.view().get("Jiro").is_some());

        backend.upsert_location(&code(), &rec("Taro", 1)).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(channel.view().get("Taro").is_none());
    }

    #[tokio::test]
    async fn test_stalled_rest_publish_disconnects() {
        use crate::family::rest::RestBackend;
        use crate::testutil::{serve_http, HttpReply};

        let server = serve_http(vec![
            HttpReply::json(200, "[]"),
            HttpReply::json(200, "[]"),
            HttpReply::stall(),
        ])
        .await;
        let backend = RestBackend::new(
            &server.base_url,
            None,
            StdDuration::from_millis(300),
            StdDuration::from_secs(60),
        )
        .unwrap();
        let channel = FamilyChannel::new(Arc::new(backend), "d");
        channel.join(code(), "Taro").await.unwrap();
        assert!(channel.is_connected());

        let err = channel.publish(&rec("Taro", 1)).await.unwrap_err();
        assert!(err.is_transport_failure());
        assert!(!channel.is_connected());
        assert!(channel.last_error().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_backend_timeout_disconnects() {
        let backend = MemoryBackend::new();
        let channel = channel(&backend, "d");
        channel.join(code(), "Taro").await.unwrap();
        let (_, generation) = channel.session().unwrap();

        channel.downgrade(generation, &Error::timeout("family backend"));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
