//! Dirty-tracked values that can be shipped as full snapshots or deltas

mod list;
mod property;

use std::any::Any;
use std::fmt::Debug;

use crate::codec::{Decode, DecodeError, Encode, Reader, Writer};

pub use list::{ListError, ListOp, ObservableList};
pub use property::ObservableValue;

/// Anything that can live inside an observable property
pub trait Value: Encode + Decode + Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> Value for T where T: Encode + Decode + Clone + PartialEq + Debug + Send + Sync + 'static {}

/// A keyed, dirty-tracked piece of synchronizable state
///
/// Implementations must leave themselves untouched when an `apply_*` call
/// fails: decode into a staging value first, then commit.
pub trait Observable: Debug + Send + Sync + 'static {
    /// Stable wire identifier, unique within a profile
    fn key(&self) -> u16;

    /// True when the value changed since the last `clear_updates`
    fn is_dirty(&self) -> bool;

    /// Writes the whole current value
    fn serialize_full(&self, writer: &mut Writer);

    /// Writes what changed since the last `clear_updates`
    fn serialize_delta(&self, writer: &mut Writer);

    fn apply_full(&mut self, reader: &mut Reader<'_>) -> Result<(), DecodeError>;

    fn apply_delta(&mut self, reader: &mut Reader<'_>) -> Result<(), DecodeError>;

    /// Drops the dirty flag and any pending delta log
    fn clear_updates(&mut self);

    /// Value equality with another property, ignoring dirty state
    fn value_eq(&self, other: &dyn Observable) -> bool;

    fn boxed_clone(&self) -> Box<dyn Observable>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn Observable> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}
