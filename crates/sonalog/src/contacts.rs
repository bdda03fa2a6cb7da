//! Emergency contacts.
//!
//! Three public emergency numbers are always present and cannot be removed.
//! Only user-added contacts are persisted.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{Bucket, BucketRecord, Storage};

/// Ids reserved for the built-in contacts.
pub const SEED_IDS: [&str; 3] = ["1", "2", "3"];

/// A person or service to call in an emergency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Relationship or purpose.
    #[serde(default)]
    pub relationship: String,
    /// Phone number.
    pub phone: String,
    /// Email address; may be empty.
    #[serde(default)]
    pub email: String,
    /// Postal address; may be empty.
    #[serde(default)]
    pub address: String,
}

impl BucketRecord for Contact {
    const BUCKET: Bucket = Bucket::Contacts;

    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("id", "must not be empty"));
        }
        validate_fields(&self.name, &self.phone)
    }
}

fn validate_fields(name: &str, phone: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("name", "must not be empty"));
    }
    if phone.trim().is_empty() {
        return Err(Error::validation("phone", "must not be empty"));
    }
    Ok(())
}

/// Input for a new contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewContact {
    /// Display name; required.
    pub name: String,
    /// Relationship or purpose.
    pub relationship: String,
    /// Phone number; required.
    pub phone: String,
    /// Email address.
    pub email: String,
    /// Postal address.
    pub address: String,
}

fn seed(id: &str, name: &str, relationship: &str, phone: &str) -> Contact {
    Contact {
        id: id.to_string(),
        name: name.to_string(),
        relationship: relationship.to_string(),
        phone: phone.to_string(),
        email: String::new(),
        address: String::new(),
    }
}

/// The built-in emergency numbers.
#[must_use]
pub fn seed_contacts() -> Vec<Contact> {
    vec![
        seed("1", "警察", "緊急通報", "110"),
        seed("2", "消防・救急", "緊急通報", "119"),
        seed("3", "災害用伝言ダイヤル", "安否確認", "171"),
    ]
}

/// Whether `id` names a built-in contact.
#[must_use]
pub fn is_seed(id: &str) -> bool {
    SEED_IDS.contains(&id)
}

/// Contact operations over a store.
#[derive(Debug, Clone, Copy)]
pub struct Contacts<'a> {
    store: &'a Storage,
}

impl<'a> Contacts<'a> {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: &'a Storage) -> Self {
        Self { store }
    }

    /// User-added contacts only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] if the stored contacts are corrupt.
    pub fn user_contacts(&self) -> Result<Vec<Contact>> {
        Ok(self
            .store
            .get::<Contact>()?
            .into_iter()
            .filter(|c| !is_seed(&c.id))
            .collect())
    }

    /// Built-in contacts followed by user-added ones.
    ///
    /// # Errors
    ///
    /// Same as [`Contacts::user_contacts`].
    pub fn list(&self) -> Result<Vec<Contact>> {
        let mut all = seed_contacts();
        all.extend(self.user_contacts()?);
        Ok(all)
    }

    /// Add a contact and return it with its new id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the name or phone is empty, or a
    /// storage error.
    pub fn add(&self, new: NewContact) -> Result<Contact> {
        validate_fields(&new.name, &new.phone)?;
        let contact = Contact {
            id: Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            relationship: new.relationship.trim().to_string(),
            phone: new.phone.trim().to_string(),
            email: new.email.trim().to_string(),
            address: new.address.trim().to_string(),
        };

        let mut contacts = self.user_contacts()?;
        contacts.push(contact.clone());
        self.store.put(&contacts)?;
        info!(id = %contact.id, name = %contact.name, "Added contact");
        Ok(contact)
    }

    /// Remove a user contact. Built-in and unknown ids are left alone and
    /// return `false`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn remove(&self, id: &str) -> Result<bool> {
        if is_seed(id) {
            return Ok(false);
        }
        let mut contacts = self.user_contacts()?;
        let before = contacts.len();
        contacts.retain(|c| c.id != id);
        if contacts.len() == before {
            return Ok(false);
        }
        self.store.put(&contacts)?;
        info!(%id, "Removed contact");
        Ok(true)
    }

    /// Replace every user contact; built-in ids in `contacts` are dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Storage::put`].
    pub fn replace_all(&self, contacts: Vec<Contact>) -> Result<()> {
        let user: Vec<_> = contacts.into_iter().filter(|c| !is_seed(&c.id)).collect();
        self.store.put(&user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_contact(name: &str, phone: &str) -> NewContact {
        NewContact {
            name: name.to_string(),
            relationship: "family".to_string(),
            phone: phone.to_string(),
            ..NewContact::default()
        }
    }

    #[test]
    fn test_list_starts_with_seeds() {
        let store = Storage::open_in_memory().unwrap();
        let contacts = Contacts::new(&store);
        let all = contacts.list().unwrap();
        let phones: Vec<_> = all.iter().map(|c| c.phone.as_str()).collect();
        assert_eq!(phones, ["110", "119", "171"]);
    }

    #[test]
    fn test_seed_removal_is_noop() {
        let store = Storage::open_in_memory().unwrap();
        let contacts = Contacts::new(&store);
        contacts.add(new_contact("Hanako", "090-0000-0000")).unwrap();
        let before = store.stats().unwrap();

        assert!(!contacts.remove("1").unwrap());
        assert_eq!(contacts.list().unwrap().len(), 4);
        assert_eq!(store.stats().unwrap().last_updated, before.last_updated);
    }

    #[test]
    fn test_add_and_remove() {
        let store = Storage::open_in_memory().unwrap();
        let contacts = Contacts::new(&store);
        let added = contacts.add(new_contact(" Taro ", "090-1111-2222")).unwrap();
        assert_eq!(added.name, "Taro");
        assert!(!is_seed(&added.id));

        let all = contacts.list().unwrap();
        assert_eq!(all.last(), Some(&added));

        assert!(contacts.remove(&added.id).unwrap());
        assert!(!contacts.remove(&added.id).unwrap());
        assert_eq!(contacts.list().unwrap().len(), 3);
    }

    #[test]
    fn test_add_requires_name_and_phone() {
        let store = Storage::open_in_memory().unwrap();
        let contacts = Contacts::new(&store);

        let err = contacts.add(new_contact("", "110")).unwrap_err();
        assert!(matches!(err, Error::Validation { field: "name", .. }));
        let err = contacts.add(new_contact("Taro", " ")).unwrap_err();
        assert!(matches!(err, Error::Validation { field: "phone", .. }));
    }

    #[test]
    fn test_only_user_contacts_are_stored() {
        let store = Storage::open_in_memory().unwrap();
        let contacts = Contacts::new(&store);
        contacts.add(new_contact("Taro", "090")).unwrap();

        let stored: Vec<Contact> = store.get().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Taro");
    }

    #[test]
    fn test_replace_all_drops_seed_ids() {
        let store = Storage::open_in_memory().unwrap();
        let contacts = Contacts::new(&store);
        let mut incoming = seed_contacts();
        incoming.push(Contact {
            id: "abc".to_string(),
            name: "Aunt".to_string(),
            relationship: String::new(),
            phone: "03".to_string(),
            email: String::new(),
            address: String::new(),
        });
        contacts.replace_all(incoming).unwrap();

        assert_eq!(contacts.user_contacts().unwrap().len(), 1);
        assert_eq!(contacts.list().unwrap().len(), 4);
    }

    #[test]
    fn test_wire_format_tolerates_missing_optional_fields() {
        let contact: Contact =
            serde_json::from_str(r#"{"id": "9", "name": "Jiro", "phone": "080"}"#).unwrap();
        assert!(contact.email.is_empty());
        assert!(contact.relationship.is_empty());
    }
}
