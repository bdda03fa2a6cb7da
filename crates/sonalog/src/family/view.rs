//! Last-write-wins view of a family group.

use std::collections::HashMap;

use crate::location::LocationRecord;

/// Latest record per member name.
///
/// A record replaces the stored one only when its `updated_at` is strictly
/// greater, so records with equal timestamps keep whichever arrived first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FamilyView {
    members: HashMap<String, LocationRecord>,
}

impl FamilyView {
    /// Create an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduce a bulk fetch to one record per member.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = LocationRecord>) -> Self {
        let mut view = Self::new();
        for record in records {
            view.apply(record);
        }
        view
    }

    /// Apply an inserted or updated record.
    ///
    /// Returns `true` if the view changed.
    pub fn apply(&mut self, record: LocationRecord) -> bool {
        match self.members.get(&record.member_name) {
            Some(current) if record.updated_at <= current.updated_at => false,
            _ => {
                self.members.insert(record.member_name.clone(), record);
                true
            }
        }
    }

    /// Remove a member's entry. Returns `true` if it was present.
    pub fn remove(&mut self, member_name: &str) -> bool {
        self.members.remove(member_name).is_some()
    }

    /// Latest record for a member.
    #[must_use]
    pub fn get(&self, member_name: &str) -> Option<&LocationRecord> {
        self.members.get(member_name)
    }

    /// Number of members in the view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Records ordered newest first, ties broken by name.
    #[must_use]
    pub fn members_by_recency(&self) -> Vec<LocationRecord> {
        let mut records: Vec<_> = self.members.values().cloned().collect();
        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.member_name.cmp(&b.member_name))
        });
        records
    }
}
