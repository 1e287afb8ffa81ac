//! Framed list and map.
//!
//! Each collection is one framed object whose record holds the whole
//! collection: a frame's first mutation copies it, reads never mark it
//! modified, and two frames mutating the same collection collide even
//! when they touch different elements.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::access::{created, read, write};
use crate::collections::map::HashMap;
use crate::collections::new_map;
use crate::error::Result;
use crate::frame::current_frame;
use crate::framed::{Framed, FramedObject, ObjectId};
use crate::record::{RecordChain, ValueRecord};

struct CollectionCell<C> {
    records: RecordChain<ValueRecord<C>>,
}

impl<C: Clone + Send + Sync + 'static> Framed for CollectionCell<C> {
    type Record = ValueRecord<C>;

    fn records(&self) -> &RecordChain<Self::Record> {
        &self.records
    }
}

impl<C: Clone + Send + Sync + 'static> CollectionCell<C> {
    fn new(value: C) -> Arc<Self> {
        let cell = Arc::new(Self {
            records: RecordChain::new(ValueRecord::new(value)),
        });
        created(&cell);
        cell
    }

    fn read<R>(&self, f: impl FnOnce(&C) -> R) -> Result<R> {
        let frame = current_frame()?;
        Ok(read(self, &frame, |record| f(&record.value)))
    }

    fn write<R>(self: &Arc<Self>, f: impl FnOnce(&mut C) -> R) -> Result<R> {
        let frame = current_frame()?;
        write(self, &frame, |record| f(&mut record.value))
    }
}

/// A `Vec<T>` isolated per frame. All accessors use the frame bound to the
/// calling thread.
pub struct FramedList<T> {
    cell: Arc<CollectionCell<Vec<T>>>,
}

impl<T: Clone + Send + Sync + 'static> FramedList<T> {
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            cell: CollectionCell::new(items),
        }
    }

    pub fn len(&self) -> Result<usize> {
        self.cell.read(Vec::len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.cell.read(Vec::is_empty)
    }

    pub fn get(&self, index: usize) -> Result<Option<T>> {
        self.cell.read(|items| items.get(index).cloned())
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.cell.read(Vec::clone)
    }

    /// Borrow the visible items.
    pub fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        self.cell.read(|items| f(items))
    }

    pub fn push(&self, value: T) -> Result<()> {
        self.cell.write(|items| items.push(value))
    }

    /// # Panics
    ///
    /// If `index > len`.
    pub fn insert(&self, index: usize, value: T) -> Result<()> {
        self.cell.write(|items| items.insert(index, value))
    }

    /// Remove and return the item at `index`. Out of bounds indices return
    /// `None` without modifying the list.
    pub fn remove(&self, index: usize) -> Result<Option<T>> {
        if index >= self.len()? {
            return Ok(None);
        }
        self.cell.write(|items| Some(items.remove(index)))
    }

    /// Replace the item at `index`, returning the previous one. Out of
    /// bounds indices return `None` without modifying the list.
    pub fn set(&self, index: usize, value: T) -> Result<Option<T>> {
        if index >= self.len()? {
            return Ok(None);
        }
        self.cell
            .write(|items| Some(std::mem::replace(&mut items[index], value)))
    }

    /// Remove every item. Clearing an empty list doesn't modify it.
    pub fn clear(&self) -> Result<()> {
        if self.is_empty()? {
            return Ok(());
        }
        self.cell.write(Vec::clear)
    }

    pub fn retain(&self, f: impl FnMut(&T) -> bool) -> Result<()> {
        self.cell.write(|items| items.retain(f))
    }

    pub fn extend(&self, values: impl IntoIterator<Item = T>) -> Result<()> {
        self.cell.write(|items| items.extend(values))
    }

    pub fn record_count(&self) -> usize {
        self.cell.records.len()
    }

    pub fn object_id(&self) -> ObjectId {
        self.cell.records.object_id()
    }

    pub fn as_object(&self) -> &dyn FramedObject {
        &*self.cell
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> FramedList<T> {
    pub fn contains(&self, value: &T) -> Result<bool> {
        self.cell.read(|items| items.contains(value))
    }

    pub fn index_of(&self, value: &T) -> Result<Option<usize>> {
        self.cell
            .read(|items| items.iter().position(|item| item == value))
    }
}

impl<T: Clone + Send + Sync + 'static> Default for FramedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> FromIterator<T> for FramedList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<T> Clone for FramedList<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for FramedList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedList")
            .field("records", &self.cell.records)
            .finish()
    }
}

/// A hash map isolated per frame. All accessors use the frame bound to the
/// calling thread.
pub struct FramedMap<K, V> {
    cell: Arc<CollectionCell<HashMap<K, V>>>,
}

impl<K, V> FramedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            cell: CollectionCell::new(new_map()),
        }
    }

    pub fn len(&self) -> Result<usize> {
        self.cell.read(HashMap::len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.cell.read(HashMap::is_empty)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.cell.read(|entries| entries.get(key).cloned())
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.cell.read(|entries| entries.contains_key(key))
    }

    /// Keys in unspecified order.
    pub fn keys(&self) -> Result<Vec<K>> {
        self.cell.read(|entries| entries.keys().cloned().collect())
    }

    /// Values in unspecified order.
    pub fn values(&self) -> Result<Vec<V>> {
        self.cell.read(|entries| entries.values().cloned().collect())
    }

    pub fn with<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> Result<R> {
        self.cell.read(f)
    }

    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.cell.write(|entries| entries.insert(key, value))
    }

    /// Remove `key`, returning its value. An absent key doesn't modify the
    /// map.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        if !self.contains_key(key)? {
            return Ok(None);
        }
        self.cell.write(|entries| entries.remove(key))
    }

    pub fn clear(&self) -> Result<()> {
        if self.is_empty()? {
            return Ok(());
        }
        self.cell.write(HashMap::clear)
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        self.cell.write(|map| map.extend(entries))
    }

    pub fn record_count(&self) -> usize {
        self.cell.records.len()
    }

    pub fn object_id(&self) -> ObjectId {
        self.cell.records.object_id()
    }

    pub fn as_object(&self) -> &dyn FramedObject {
        &*self.cell
    }
}

impl<K, V> Default for FramedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for FramedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<K, V> fmt::Debug for FramedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedMap")
            .field("records", &self.cell.records)
            .finish()
    }
}
