//! Emergency supply inventory.
//!
//! Items live in the inventory bucket and are only ever replaced whole.
//! Expiry dates drive the warnings shown by `sonalog items` and `sonalog status`.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{Bucket, BucketRecord, Storage};

/// Default window for expiry warnings, in days.
pub const DEFAULT_EXPIRY_WINDOW_DAYS: i64 = 30;

/// Items expiring within this many days are critical.
pub const CRITICAL_DAYS: i64 = 7;

/// Kind of supply.
///
/// Older exports use Japanese labels; those are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Food.
    #[serde(alias = "食料品")]
    Food,
    /// Drinking water.
    #[serde(alias = "飲料水")]
    Water,
    /// Medicine.
    #[serde(alias = "医薬品")]
    Medicine,
    /// Hygiene products.
    #[serde(alias = "衛生用品")]
    Hygiene,
    /// Tools and equipment.
    #[serde(alias = "工具・用具")]
    Tools,
    /// Clothing.
    #[serde(alias = "衣類")]
    Clothing,
    /// Anything else.
    #[serde(alias = "その他")]
    Other,
}

impl Category {
    /// Every category, in display order.
    pub const ALL: [Category; 7] = [
        Category::Food,
        Category::Water,
        Category::Medicine,
        Category::Hygiene,
        Category::Tools,
        Category::Clothing,
        Category::Other,
    ];

    /// Storage name of the category.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Food => "food",
            Self::Water => "water",
            Self::Medicine => "medicine",
            Self::Hygiene => "hygiene",
            Self::Tools => "tools",
            Self::Clothing => "clothing",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| Error::validation("category", format!("unknown category '{s}'")))
    }
}

/// One stocked supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    /// Unique id within the inventory.
    pub id: String,
    /// What the item is.
    pub name: String,
    /// Kind of supply.
    pub category: Category,
    /// Best-before date, if the item expires.
    #[serde(default, deserialize_with = "deserialize_optional_date")]
    pub expiry_date: Option<NaiveDate>,
    /// How many are stocked; at least 1.
    pub quantity: u32,
    /// Free-text notes.
    #[serde(default)]
    pub notes: String,
}

/// Accepts `null`, a missing field, an empty string or `YYYY-MM-DD`.
fn deserialize_optional_date<'de, D>(deserializer: D) -> std::result::Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(date) => NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl BucketRecord for InventoryItem {
    const BUCKET: Bucket = Bucket::Inventory;

    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("id", "must not be empty"));
        }
        validate_fields(&self.name, self.quantity)
    }
}

fn validate_fields(name: &str, quantity: u32) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("name", "must not be empty"));
    }
    if quantity == 0 {
        return Err(Error::validation("quantity", "must be at least 1"));
    }
    Ok(())
}

/// Input for a new item; the id is assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    /// What the item is.
    pub name: String,
    /// Kind of supply.
    pub category: Category,
    /// Best-before date.
    pub expiry_date: Option<NaiveDate>,
    /// How many are stocked.
    pub quantity: u32,
    /// Free-text notes.
    pub notes: String,
}

/// How close an item is to expiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    /// Past its date.
    Expired,
    /// Expires within a week.
    Critical(i64),
    /// Expires within a month.
    Warning(i64),
    /// More than a month left.
    Fresh(i64),
    /// Does not expire.
    NoExpiry,
}

impl ExpiryStatus {
    /// Classify an item by days left.
    #[must_use]
    pub fn from_days(days: Option<i64>) -> Self {
        match days {
            None => Self::NoExpiry,
            Some(d) if d < 0 => Self::Expired,
            Some(d) if d <= CRITICAL_DAYS => Self::Critical(d),
            Some(d) if d <= DEFAULT_EXPIRY_WINDOW_DAYS => Self::Warning(d),
            Some(d) => Self::Fresh(d),
        }
    }

    /// Whether the status calls for attention.
    #[must_use]
    pub fn needs_attention(self) -> bool {
        matches!(self, Self::Expired | Self::Critical(_) | Self::Warning(_))
    }
}

impl fmt::Display for ExpiryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::Critical(d) | Self::Warning(d) | Self::Fresh(d) => write!(f, "{d} days left"),
            Self::NoExpiry => write!(f, "no expiry"),
        }
    }
}

/// Days from `today` until `expiry`; negative once past.
#[must_use]
pub fn days_until(expiry: NaiveDate, today: NaiveDate) -> i64 {
    (expiry - today).num_days()
}

impl InventoryItem {
    /// Days left as of `today`, if the item expires.
    #[must_use]
    pub fn days_left(&self, today: NaiveDate) -> Option<i64> {
        self.expiry_date.map(|date| days_until(date, today))
    }

    /// Expiry classification as of `today`.
    #[must_use]
    pub fn expiry_status(&self, today: NaiveDate) -> ExpiryStatus {
        ExpiryStatus::from_days(self.days_left(today))
    }
}

/// Inventory operations over a store.
#[derive(Debug, Clone, Copy)]
pub struct Inventory<'a> {
    store: &'a Storage,
}

impl<'a> Inventory<'a> {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: &'a Storage) -> Self {
        Self { store }
    }

    /// Every item, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the stored inventory is corrupt.
    pub fn list(&self) -> Result<Vec<InventoryItem>> {
        self.store.get()
    }

    /// Look up one item.
    ///
    /// # Errors
    ///
    /// Same as [`Inventory::list`].
    pub fn get(&self, id: &str) -> Result<Option<InventoryItem>> {
        Ok(self.list()?.into_iter().find(|item| item.id == id))
    }

    /// Add an item and return it with its new id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty name or zero quantity, or a
    /// storage error.
    pub fn add(&self, new: NewItem) -> Result<InventoryItem> {
        validate_fields(&new.name, new.quantity)?;
        let item = InventoryItem {
            id: Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            category: new.category,
            expiry_date: new.expiry_date,
            quantity: new.quantity,
            notes: new.notes,
        };

        let mut items = self.list()?;
        items.push(item.clone());
        self.store.put(&items)?;
        info!(id = %item.id, name = %item.name, "Added inventory item");
        Ok(item)
    }

    /// Replace the item with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no item has that id, [`Error::Validation`]
    /// for invalid fields, or a storage error.
    pub fn replace(&self, item: InventoryItem) -> Result<()> {
        item.validate()?;
        let mut items = self.list()?;
        let slot = items
            .iter_mut()
            .find(|existing| existing.id == item.id)
            .ok_or_else(|| Error::NotFound {
                kind: "item",
                id: item.id.clone(),
            })?;
        *slot = item;
        self.store.put(&items)
    }

    /// Remove an item. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut items = self.list()?;
        let before = items.len();
        items.retain(|item| item.id != id);
        if items.len() == before {
            return Ok(false);
        }
        self.store.put(&items)?;
        info!(%id, "Removed inventory item");
        Ok(true)
    }

    /// Items expiring between `today` and `window_days` from now, soonest first.
    ///
    /// # Errors
    ///
    /// Same as [`Inventory::list`].
    pub fn expiring_soon(&self, today: NaiveDate, window_days: i64) -> Result<Vec<InventoryItem>> {
        let mut items: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|item| {
                item.days_left(today)
                    .is_some_and(|days| (0..=window_days).contains(&days))
            })
            .collect();
        items.sort_by_key(|item| item.expiry_date);
        Ok(items)
    }

    /// Items already past their date.
    ///
    /// # Errors
    ///
    /// Same as [`Inventory::list`].
    pub fn expired(&self, today: NaiveDate) -> Result<Vec<InventoryItem>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|item| item.expiry_status(today) == ExpiryStatus::Expired)
            .collect())
    }
}
