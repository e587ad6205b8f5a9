use std::any::Any;

use thiserror::Error;

use super::{Observable, Value};
use crate::codec::{DecodeError, Reader, Writer};

const OP_SET: u8 = 0;
const OP_REMOVE: u8 = 1;
const OP_INSERT: u8 = 2;

/// Local mutation rejected by an [`ObservableList`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListError {
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// One recorded list mutation, in the order it happened
#[derive(Debug, Clone, PartialEq)]
pub enum ListOp<T> {
    Set { index: usize, value: T },
    Remove { index: usize },
    Insert { index: usize, value: T },
}

impl<T: Value> ListOp<T> {
    fn opcode(&self) -> u8 {
        match self {
            ListOp::Set { .. } => OP_SET,
            ListOp::Remove { .. } => OP_REMOVE,
            ListOp::Insert { .. } => OP_INSERT,
        }
    }

    fn index(&self) -> usize {
        match self {
            ListOp::Set { index, .. } | ListOp::Remove { index } | ListOp::Insert { index, .. } => {
                *index
            }
        }
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.opcode());
        writer.write_len(self.index());
        match self {
            ListOp::Set { value, .. } | ListOp::Insert { value, .. } => value.encode(writer),
            ListOp::Remove { .. } => {}
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let opcode = reader.read_u8()?;
        let index = reader.read_i32()?;
        let index = usize::try_from(index).map_err(|_| DecodeError::IndexOutOfRange {
            index,
            len: 0,
        })?;
        match opcode {
            OP_SET => Ok(ListOp::Set {
                index,
                value: T::decode(reader)?,
            }),
            OP_REMOVE => Ok(ListOp::Remove { index }),
            OP_INSERT => Ok(ListOp::Insert {
                index,
                value: T::decode(reader)?,
            }),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }

    /// Replays this op against `items`, exactly as the sender applied it
    fn replay(self, items: &mut Vec<T>) -> Result<(), DecodeError> {
        let len = items.len();
        let out_of_range = |index: usize| DecodeError::IndexOutOfRange {
            index: i32::try_from(index).unwrap_or(i32::MAX),
            len,
        };
        match self {
            ListOp::Set { index, value } if index < len => items[index] = value,
            ListOp::Set { index, value } if index == len => items.push(value),
            ListOp::Set { index, .. } => return Err(out_of_range(index)),
            ListOp::Remove { index } if index < len => {
                items.remove(index);
            }
            ListOp::Remove { index } => return Err(out_of_range(index)),
            ListOp::Insert { index, value } if index <= len => items.insert(index, value),
            ListOp::Insert { index, .. } => return Err(out_of_range(index)),
        }
        Ok(())
    }
}

/// An ordered sequence that records every mutation for incremental sync
///
/// The delta is the op log itself, not a diff of the final state: a receiver
/// replays `Remove` / `Insert` in order so that index shifts line up with the
/// sender.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableList<T: Value> {
    key: u16,
    items: Vec<T>,
    pending: Vec<ListOp<T>>,
    dirty: bool,
}

impl<T: Value> ObservableList<T> {
    pub fn new(key: u16) -> Self {
        Self::from_items(key, Vec::new())
    }

    pub fn from_items(key: u16, items: Vec<T>) -> Self {
        Self {
            key,
            items,
            pending: Vec::new(),
            dirty: false,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    pub fn position(&self, value: &T) -> Option<usize> {
        self.items.iter().position(|item| item == value)
    }

    /// Ops recorded since the last flush
    pub fn pending_ops(&self) -> &[ListOp<T>] {
        &self.pending
    }

    /// Appends a value, recorded as a `Set` one past the end
    pub fn push(&mut self, value: T) {
        let index = self.items.len();
        self.items.push(value.clone());
        self.record(ListOp::Set { index, value });
    }

    /// Overwrites `index`, or appends when `index == len`
    pub fn set(&mut self, index: usize, value: T) -> Result<(), ListError> {
        let len = self.items.len();
        if index < len {
            self.items[index] = value.clone();
        } else if index == len {
            self.items.push(value.clone());
        } else {
            return Err(ListError::IndexOutOfBounds { index, len });
        }
        self.record(ListOp::Set { index, value });
        Ok(())
    }

    pub fn insert(&mut self, index: usize, value: T) -> Result<(), ListError> {
        let len = self.items.len();
        if index > len {
            return Err(ListError::IndexOutOfBounds { index, len });
        }
        self.items.insert(index, value.clone());
        self.record(ListOp::Insert { index, value });
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<T, ListError> {
        let len = self.items.len();
        if index >= len {
            return Err(ListError::IndexOutOfBounds { index, len });
        }
        let removed = self.items.remove(index);
        self.record(ListOp::Remove { index });
        Ok(removed)
    }

    /// Removes every element, back to front
    pub fn clear(&mut self) {
        while let Some(index) = self.items.len().checked_sub(1) {
            self.items.pop();
            self.record(ListOp::Remove { index });
        }
    }

    fn record(&mut self, op: ListOp<T>) {
        self.pending.push(op);
        self.dirty = true;
    }
}

impl<T: Value> Observable for ObservableList<T> {
    fn key(&self) -> u16 {
        self.key
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn serialize_full(&self, writer: &mut Writer) {
        writer.write_len(self.items.len());
        for item in &self.items {
            item.encode(writer);
        }
    }

    fn serialize_delta(&self, writer: &mut Writer) {
        writer.write_len(self.pending.len());
        for op in &self.pending {
            op.write(writer);
        }
    }

    fn apply_full(&mut self, reader: &mut Reader<'_>) -> Result<(), DecodeError> {
        let count = reader.read_len()?;
        // never trust the prefix for preallocation
        let mut staged = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            staged.push(T::decode(reader)?);
        }
        self.items = staged;
        Ok(())
    }

    fn apply_delta(&mut self, reader: &mut Reader<'_>) -> Result<(), DecodeError> {
        let count = reader.read_len()?;
        let mut staged = self.items.clone();
        for _ in 0..count {
            ListOp::<T>::read(reader)?.replay(&mut staged)?;
        }
        self.items = staged;
        Ok(())
    }

    fn clear_updates(&mut self) {
        self.pending.clear();
        self.dirty = false;
    }

    fn value_eq(&self, other: &dyn Observable) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| other.key == self.key && other.items == self.items)
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
