//! The profile aggregate: one owner's complete synchronizable state
//!
//! A profile is a fixed, ordered set of keyed observables. Changes are tracked
//! per key in a dirty set and collected into a single update packet:
//!
//! ```text
//! count:i32, then count x { key:u16, length:i32, payload:[u8; length] }
//! ```
//!
//! The same record framing carries full snapshots (every property, full
//! payloads) and incremental updates (dirty properties, delta payloads).

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use log::{debug, warn};
use thiserror::Error;

use crate::codec::{DecodeError, Reader, Writer};
use crate::observable::{ListError, Observable, ObservableList, ObservableValue, Value};

/// Errors raised by local profile access and mutation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("property key {0} is declared twice")]
    DuplicateKey(u16),

    #[error("profile has no property with key {0}")]
    UnknownProperty(u16),

    #[error("property {key} is not a {expected}")]
    TypeMismatch { key: u16, expected: &'static str },

    #[error(transparent)]
    List(#[from] ListError),
}

/// How a snapshot with a different property count is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaMode {
    /// Reject the snapshot
    #[default]
    Strict,
    /// Log a warning and apply whatever keys match
    Tolerant,
}

/// Declares the properties of a profile, in order
pub struct ProfileBuilder {
    owner_id: String,
    properties: Vec<Box<dyn Observable>>,
}

impl ProfileBuilder {
    pub fn value<T: Value>(self, key: u16, default: T) -> Self {
        self.property(ObservableValue::new(key, default))
    }

    pub fn list<T: Value>(self, key: u16) -> Self {
        self.property(ObservableList::<T>::new(key))
    }

    pub fn property(mut self, property: impl Observable) -> Self {
        self.properties.push(Box::new(property));
        self
    }

    pub fn build(self) -> Result<Profile, ProfileError> {
        let mut index = HashMap::with_capacity(self.properties.len());
        for (position, property) in self.properties.iter().enumerate() {
            if index.insert(property.key(), position).is_some() {
                return Err(ProfileError::DuplicateKey(property.key()));
            }
        }

        Ok(Profile {
            owner_id: self.owner_id,
            properties: self.properties,
            index,
            dirty: BTreeSet::new(),
        })
    }
}

/// One owner's keyed properties plus the set of keys changed since the last flush
#[derive(Clone)]
pub struct Profile {
    owner_id: String,
    properties: Vec<Box<dyn Observable>>,
    index: HashMap<u16, usize>,
    /// Declaration positions, so iteration follows declaration order
    dirty: BTreeSet<usize>,
}

impl Profile {
    pub fn builder(owner_id: impl Into<String>) -> ProfileBuilder {
        ProfileBuilder {
            owner_id: owner_id.into(),
            properties: Vec::new(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Number of declared properties; both ends of a sync must agree on it
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = u16> + '_ {
        self.properties.iter().map(|property| property.key())
    }

    pub fn property(&self, key: u16) -> Option<&dyn Observable> {
        self.index
            .get(&key)
            .map(|&position| self.properties[position].as_ref())
    }

    /// Typed read access to a property
    pub fn get<P: Observable>(&self, key: u16) -> Result<&P, ProfileError> {
        self.property(key)
            .ok_or(ProfileError::UnknownProperty(key))?
            .as_any()
            .downcast_ref::<P>()
            .ok_or(ProfileError::TypeMismatch {
                key,
                expected: std::any::type_name::<P>(),
            })
    }

    pub fn value<T: Value>(&self, key: u16) -> Result<&T, ProfileError> {
        self.get::<ObservableValue<T>>(key).map(ObservableValue::get)
    }

    pub fn list<T: Value>(&self, key: u16) -> Result<&[T], ProfileError> {
        self.get::<ObservableList<T>>(key).map(ObservableList::items)
    }

    /// Runs `f` against a typed property, recording the key if it got dirty
    pub fn edit<P: Observable, R>(
        &mut self,
        key: u16,
        f: impl FnOnce(&mut P) -> R,
    ) -> Result<R, ProfileError> {
        let position = *self
            .index
            .get(&key)
            .ok_or(ProfileError::UnknownProperty(key))?;
        let property = self.properties[position]
            .as_any_mut()
            .downcast_mut::<P>()
            .ok_or(ProfileError::TypeMismatch {
                key,
                expected: std::any::type_name::<P>(),
            })?;

        let result = f(property);
        if property.is_dirty() {
            self.dirty.insert(position);
        }
        Ok(result)
    }

    pub fn set_value<T: Value>(&mut self, key: u16, value: T) -> Result<(), ProfileError> {
        self.edit::<ObservableValue<T>, _>(key, |property| property.set(value))
    }

    pub fn update_value<T: Value, R>(
        &mut self,
        key: u16,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, ProfileError> {
        self.edit::<ObservableValue<T>, _>(key, |property| property.update(f))
    }

    pub fn edit_list<T: Value, R>(
        &mut self,
        key: u16,
        f: impl FnOnce(&mut ObservableList<T>) -> R,
    ) -> Result<R, ProfileError> {
        self.edit::<ObservableList<T>, _>(key, f)
    }

    /// Adds `key` to the dirty set; idempotent
    pub fn mark_dirty(&mut self, key: u16) -> Result<(), ProfileError> {
        let position = *self
            .index
            .get(&key)
            .ok_or(ProfileError::UnknownProperty(key))?;
        self.dirty.insert(position);
        Ok(())
    }

    pub fn has_updates(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_keys(&self) -> Vec<u16> {
        self.dirty
            .iter()
            .map(|&position| self.properties[position].key())
            .collect()
    }

    /// Collects the deltas of every dirty property
    ///
    /// Does not clear anything: call [`Profile::clear_updates`] once the bytes
    /// have been handed off.
    pub fn get_updates(&self) -> Vec<u8> {
        let dirty = self
            .dirty
            .iter()
            .map(|&position| &self.properties[position]);
        write_records(self.dirty.len(), dirty, |property, writer| {
            property.serialize_delta(writer)
        })
    }

    pub fn clear_updates(&mut self) {
        for &position in &self.dirty {
            self.properties[position].clear_updates();
        }
        self.dirty.clear();
    }

    /// Writes a snapshot of every property
    pub fn serialize_full(&self) -> Vec<u8> {
        write_records(self.properties.len(), self.properties.iter(), |property, writer| {
            property.serialize_full(writer)
        })
    }

    /// Replaces the whole state from a snapshot and drops pending updates
    pub fn restore_full(&mut self, data: &[u8], mode: SchemaMode) -> Result<(), DecodeError> {
        let mut reader = Reader::new(data);
        let count = reader.read_len()?;
        if count != self.properties.len() {
            match mode {
                SchemaMode::Strict => {
                    return Err(DecodeError::SchemaMismatch {
                        expected: self.properties.len(),
                        actual: count,
                    })
                }
                SchemaMode::Tolerant => warn!(
                    "Profile {} snapshot has {} properties, expected {}",
                    self.owner_id,
                    count,
                    self.properties.len()
                ),
            }
        }

        self.apply_records(&mut reader, count, |property, payload| {
            property.apply_full(payload)
        })?;
        self.clear_updates();
        Ok(())
    }

    /// Applies an update packet produced by [`Profile::get_updates`]
    ///
    /// Unknown keys are skipped. Either every record applies or none does.
    pub fn apply_updates(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        let mut reader = Reader::new(data);
        let count = reader.read_len()?;
        self.apply_records(&mut reader, count, |property, payload| {
            property.apply_delta(payload)
        })
    }

    fn apply_records(
        &mut self,
        reader: &mut Reader<'_>,
        count: usize,
        apply: impl Fn(&mut dyn Observable, &mut Reader<'_>) -> Result<(), DecodeError>,
    ) -> Result<(), DecodeError> {
        let mut staged: Vec<(usize, Box<dyn Observable>)> = Vec::new();

        for _ in 0..count {
            let key = reader.read_u16()?;
            let payload = reader.read_bytes()?;

            let Some(&position) = self.index.get(&key) else {
                debug!("Skipping unknown property {} for {}", key, self.owner_id);
                continue;
            };

            let slot = match staged.iter().position(|(staged_at, _)| *staged_at == position) {
                Some(slot) => slot,
                None => {
                    staged.push((position, self.properties[position].boxed_clone()));
                    staged.len() - 1
                }
            };

            let mut payload = Reader::new(payload);
            apply(staged[slot].1.as_mut(), &mut payload)?;
            payload.finish()?;
        }
        reader.finish()?;

        for (position, property) in staged {
            self.properties[position] = property;
        }
        Ok(())
    }
}

fn write_records<'a>(
    count: usize,
    properties: impl Iterator<Item = &'a Box<dyn Observable>>,
    write: impl Fn(&dyn Observable, &mut Writer),
) -> Vec<u8> {
    let mut writer = Writer::new();
    writer.write_len(count);
    for property in properties {
        let mut payload = Writer::new();
        write(property.as_ref(), &mut payload);

        writer.write_u16(property.key());
        writer.write_bytes(&payload.freeze());
    }
    writer.into_vec()
}

impl PartialEq for Profile {
    fn eq(&self, other: &Self) -> bool {
        self.owner_id == other.owner_id
            && self.properties.len() == other.properties.len()
            && self
                .properties
                .iter()
                .zip(&other.properties)
                .all(|(left, right)| left.value_eq(right.as_ref()))
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("owner_id", &self.owner_id)
            .field("properties", &self.properties)
            .field("dirty", &self.dirty_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: u16 = 0;
    const GOLD: u16 = 1;
    const ITEMS: u16 = 2;
    const FLAGS: u16 = 7;

    fn profile() -> Profile {
        Profile::builder("alice")
            .value(NAME, String::from("alice"))
            .value(GOLD, 0i64)
            .list::<String>(ITEMS)
            .value(FLAGS, 0u32)
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let err = Profile::builder("bob")
            .value(1, 0u8)
            .value(1, 0u8)
            .build()
            .unwrap_err();
        assert_eq!(err, ProfileError::DuplicateKey(1));
    }

    #[test]
    fn test_typed_access() {
        let mut profile = profile();
        profile.set_value(GOLD, 50i64).unwrap();

        assert_eq!(*profile.value::<i64>(GOLD).unwrap(), 50);
        assert!(matches!(
            profile.value::<i32>(GOLD),
            Err(ProfileError::TypeMismatch { key: GOLD, .. })
        ));
        assert_eq!(
            profile.value::<i64>(99),
            Err(ProfileError::UnknownProperty(99))
        );
    }

    #[test]
    fn test_updates_follow_declaration_order() {
        let mut profile = profile();
        profile.set_value(FLAGS, 1u32).unwrap();
        profile.set_value(NAME, "Alice".to_string()).unwrap();

        assert_eq!(profile.dirty_keys(), vec![NAME, FLAGS]);

        let updates = profile.get_updates();
        let mut reader = Reader::new(&updates);
        assert_eq!(reader.read_len().unwrap(), 2);
        assert_eq!(reader.read_u16().unwrap(), NAME);
        reader.read_bytes().unwrap();
        assert_eq!(reader.read_u16().unwrap(), FLAGS);
    }

    #[test]
    fn test_get_updates_does_not_clear() {
        let mut profile = profile();
        profile.set_value(GOLD, 5i64).unwrap();

        let first = profile.get_updates();
        assert_eq!(first, profile.get_updates());
        assert!(profile.has_updates());

        profile.clear_updates();
        profile.clear_updates();
        assert!(!profile.has_updates());
        assert_eq!(profile.get_updates(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_mark_dirty_is_idempotent() {
        let mut profile = profile();
        profile.mark_dirty(GOLD).unwrap();
        profile.mark_dirty(GOLD).unwrap();
        assert_eq!(profile.dirty_keys(), vec![GOLD]);
        assert_eq!(
            profile.mark_dirty(42),
            Err(ProfileError::UnknownProperty(42))
        );
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut source = profile();
        source.set_value(GOLD, 1234i64).unwrap();
        source
            .edit_list::<String, _>(ITEMS, |items| {
                items.push("sword".to_string());
                items.push("shield".to_string());
            })
            .unwrap();

        let mut restored = profile();
        restored
            .restore_full(&source.serialize_full(), SchemaMode::Strict)
            .unwrap();

        assert_eq!(restored, source);
        assert!(!restored.has_updates());
    }

    #[test]
    fn test_updates_reproduce_state_on_copy() {
        let mut server = profile();
        server
            .edit_list::<String, _>(ITEMS, |items| items.push("apple".to_string()))
            .unwrap();
        server.clear_updates();
        let mut client = server.clone();

        server.set_value(GOLD, 9i64).unwrap();
        server
            .edit_list::<String, _>(ITEMS, |items| {
                items.insert(0, "pear".to_string()).unwrap();
                items.remove(1).unwrap();
            })
            .unwrap();

        client.apply_updates(&server.get_updates()).unwrap();
        assert_eq!(client, server);
    }

    #[test]
    fn test_unknown_keys_are_skipped() {
        let mut newer = Profile::builder("alice")
            .value(GOLD, 0i64)
            .value(40, String::new())
            .build()
            .unwrap();
        newer.set_value(GOLD, 3i64).unwrap();
        newer.set_value(40, "extra".to_string()).unwrap();

        let mut older = profile();
        older.apply_updates(&newer.get_updates()).unwrap();
        assert_eq!(*older.value::<i64>(GOLD).unwrap(), 3);
    }

    #[test]
    fn test_failed_apply_is_atomic() {
        let mut server = profile();
        server.set_value(GOLD, 77i64).unwrap();
        server.set_value(NAME, "x".to_string()).unwrap();
        let mut updates = server.get_updates();
        // the GOLD record is last; cut it short
        updates.truncate(updates.len() - 1);

        let mut client = profile();
        assert!(client.apply_updates(&updates).is_err());
        assert_eq!(client, profile());
    }

    #[test]
    fn test_strict_schema_rejects_count_mismatch() {
        let small = Profile::builder("alice")
            .value(GOLD, 5i64)
            .build()
            .unwrap();
        let snapshot = small.serialize_full();

        let mut strict = profile();
        assert_eq!(
            strict.restore_full(&snapshot, SchemaMode::Strict),
            Err(DecodeError::SchemaMismatch {
                expected: 4,
                actual: 1
            })
        );

        let mut tolerant = profile();
        tolerant
            .restore_full(&snapshot, SchemaMode::Tolerant)
            .unwrap();
        assert_eq!(*tolerant.value::<i64>(GOLD).unwrap(), 5);
    }

    #[test]
    fn test_payload_must_be_consumed() {
        let mut writer = Writer::new();
        writer.write_len(1);
        writer.write_u16(GOLD);
        writer.write_bytes(&[0, 0, 0, 0, 0, 0, 0, 1, 0xAA]);

        let mut client = profile();
        assert_eq!(
            client.apply_updates(&writer.into_vec()),
            Err(DecodeError::TrailingBytes(1))
        );
    }
}
