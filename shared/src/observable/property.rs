use std::any::Any;

use super::{Observable, Value};
use crate::codec::{DecodeError, Reader, Writer};

/// A single scalar value tracked for updates
///
/// Every call to [`ObservableValue::set`] marks the property dirty, even when
/// the new value equals the old one.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableValue<T: Value> {
    key: u16,
    value: T,
    dirty: bool,
}

impl<T: Value> ObservableValue<T> {
    pub fn new(key: u16, value: T) -> Self {
        Self {
            key,
            value,
            dirty: false,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        self.dirty = true;
    }

    /// Mutates the value in place and marks it dirty
    pub fn update<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.value);
        self.dirty = true;
        result
    }
}

impl<T: Value> Observable for ObservableValue<T> {
    fn key(&self) -> u16 {
        self.key
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn serialize_full(&self, writer: &mut Writer) {
        self.value.encode(writer);
    }

    fn serialize_delta(&self, writer: &mut Writer) {
        self.serialize_full(writer);
    }

    fn apply_full(&mut self, reader: &mut Reader<'_>) -> Result<(), DecodeError> {
        let staged = T::decode(reader)?;
        self.value = staged;
        Ok(())
    }

    fn apply_delta(&mut self, reader: &mut Reader<'_>) -> Result<(), DecodeError> {
        self.apply_full(reader)
    }

    fn clear_updates(&mut self) {
        self.dirty = false;
    }

    fn value_eq(&self, other: &dyn Observable) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| other.key == self.key && other.value == self.value)
    }

    fn boxed_clone(&self) -> Box<dyn Observable> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
