//! REST family backend.
//!
//! Talks to a PostgREST-compatible service exposing the `family_locations`,
//! `family_members` and `family_groups` tables. Writes are upserts on the
//! natural unique key. The change feed is a polling task that diffs
//! successive snapshots into insert, update and delete events.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::{FamilyBackend, FeedEvent, MemberPresence, FEED_CAPACITY};
use super::code::FamilyCode;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::location::LocationRecord;

const LOCATIONS_TABLE: &str = "family_locations";
const MEMBERS_TABLE: &str = "family_members";
const GROUPS_TABLE: &str = "family_groups";

/// `Prefer` header turning a POST into an upsert.
const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=minimal";

/// A `family_locations` row.
#[derive(Debug, Serialize, Deserialize)]
struct LocationRow {
    family_code: FamilyCode,
    #[serde(flatten)]
    record: LocationRecord,
}

/// A `family_groups` row.
#[derive(Debug, Serialize)]
struct GroupRow<'a> {
    family_code: &'a FamilyCode,
    created_by: &'a str,
}

/// Member name to latest record, as seen by one poll.
pub type Snapshot = HashMap<String, LocationRecord>;

/// Backend for a hosted PostgREST service.
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    poll_interval: Duration,
}

impl fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl RestBackend {
    /// Create a backend for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the API key is not a valid
    /// header value, or an error if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        request_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let invalid = |_| Error::ConfigValidation {
                message: "family.api_key contains characters not allowed in an HTTP header"
                    .to_string(),
            };
            let mut apikey = HeaderValue::from_str(key).map_err(invalid)?;
            apikey.set_sensitive(true);
            let mut bearer = HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?;
            bearer.set_sensitive(true);
            headers.insert("apikey", apikey);
            headers.insert(AUTHORIZATION, bearer);
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("sonalog/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        })
    }

    /// Create the backend described by the family configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if no backend URL is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let url = config
            .family
            .backend_url
            .as_deref()
            .ok_or_else(|| Error::ConfigValidation {
                message: "family.backend_url is required for the rest backend".to_string(),
            })?;
        Self::new(
            url,
            config.family.api_key.as_deref(),
            config.request_timeout(),
            config.poll_interval(),
        )
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    async fn snapshot(&self, code: &FamilyCode) -> Result<Snapshot> {
        Ok(latest_by_member(self.fetch_all(code).await?))
    }
}

/// Any failure to complete a request, timeouts included, means the backend
/// is unreachable.
fn request_failed(action: &str, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::transport(format!("{action} timed out"))
    } else {
        Error::transport(format!("{action} failed: {err}"))
    }
}

async fn check_status(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::transport(format!(
        "{action} failed with HTTP {status}: {}",
        body.trim()
    )))
}

#[async_trait::async_trait]
impl FamilyBackend for RestBackend {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn fetch_all(&self, code: &FamilyCode) -> Result<Vec<LocationRecord>> {
        let response = self
            .client
            .get(self.table_url(LOCATIONS_TABLE))
            .query(&[
                ("select", "*".to_string()),
                ("family_code", format!("eq.{code}")),
                ("order", "updated_at.desc".to_string()),
            ])
            .send()
            .await
            .map_err(|e| request_failed("fetching family locations", &e))?;
        let response = check_status(response, "fetching family locations").await?;

        let body = response
            .text()
            .await
            .map_err(|e| request_failed("fetching family locations", &e))?;
        let rows: Vec<LocationRow> = serde_json::from_str(&body)
            .map_err(|e| Error::malformed(LOCATIONS_TABLE, e.to_string()))?;
        Ok(rows.into_iter().map(|row| row.record).collect())
    }

    async fn upsert_location(&self, code: &FamilyCode, record: &LocationRecord) -> Result<()> {
        let row = LocationRow {
            family_code: code.clone(),
            record: record.clone(),
        };
        let response = self
            .client
            .post(self.table_url(LOCATIONS_TABLE))
            .query(&[("on_conflict", "family_code,member_name")])
            .header("Prefer", PREFER_UPSERT)
            .json(&[row])
            .send()
            .await
            .map_err(|e| request_failed("publishing location", &e))?;
        check_status(response, "publishing location").await?;
        debug!(code = %code, member = %record.member_name, "Published location");
        Ok(())
    }

    async fn upsert_member(&self, presence: &MemberPresence) -> Result<()> {
        let response = self
            .client
            .post(self.table_url(MEMBERS_TABLE))
            .query(&[("on_conflict", "device_id")])
            .header("Prefer", PREFER_UPSERT)
            .json(&[presence])
            .send()
            .await
            .map_err(|e| request_failed("updating member presence", &e))?;
        check_status(response, "updating member presence").await?;
        Ok(())
    }

    async fn create_group(&self, code: &FamilyCode, created_by: &str) -> Result<()> {
        let response = self
            .client
            .post(self.table_url(GROUPS_TABLE))
            .header("Prefer", "return=minimal")
            .json(&[GroupRow {
                family_code: code,
                created_by,
            }])
            .send()
            .await
            .map_err(|e| request_failed("creating family group", &e))?;
        check_status(response, "creating family group").await?;
        info!(code = %code, "Registered family group");
        Ok(())
    }

    async fn subscribe(&self, code: &FamilyCode) -> Result<mpsc::Receiver<FeedEvent>> {
        let mut previous = self.snapshot(code).await?;
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let backend = self.clone();
        let code = code.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(backend.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                if tx.is_closed() {
                    debug!(code = %code, "Change feed receiver dropped");
                    return;
                }

                let current = match backend.snapshot(&code).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(code = %code, error = %e, "Change feed poll failed");
                        let _ = tx
                            .send(FeedEvent::Failed {
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                };

                for event in diff_snapshots(&previous, &current) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                previous = current;
            }
        });

        Ok(rx)
    }
}

/// Reduce fetched rows to one record per member, newest wins.
fn latest_by_member(records: Vec<LocationRecord>) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for record in records {
        match snapshot.get(&record.member_name) {
            Some(current) if current.updated_at >= record.updated_at => {}
            _ => {
                snapshot.insert(record.member_name.clone(), record);
            }
        }
    }
    snapshot
}

/// Events that turn `previous` into `current`.
///
/// Inserts and updates come first, oldest first; deletes follow in name
/// order.
#[must_use]
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> Vec<FeedEvent> {
    let mut changed: Vec<&LocationRecord> = current
        .values()
        .filter(|record| previous.get(&record.member_name) != Some(*record))
        .collect();
    changed.sort_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.member_name.cmp(&b.member_name))
    });

    let mut removed: Vec<&String> = previous
        .keys()
        .filter(|name| !current.contains_key(*name))
        .collect();
    removed.sort();

    changed
        .into_iter()
        .map(|record| {
            if previous.contains_key(&record.member_name) {
                FeedEvent::Update(record.clone())
            } else {
                FeedEvent::Insert(record.clone())
            }
        })
        .chain(removed.into_iter().map(|name| FeedEvent::Delete {
            member_name: name.clone(),
        }))
        .collect()
}
