//! Growable scratch registry used while enumerating devices

use std::collections::TryReserveError;
use thiserror::Error;

/// Slots reserved on the first growth
const INITIAL_CAPACITY: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Failed to grow registry: {0}")]
    Grow(#[from] TryReserveError),
}

/// Owning dynamic array whose growth failures are reported instead of aborting.
///
/// Capacity doubles when full. A failed growth leaves the registry untouched,
/// so callers can abandon whatever depended on the new item and keep going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry<T> {
    items: Vec<T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append an item and return its index
    pub fn push(&mut self, item: T) -> Result<usize, RegistryError> {
        if self.items.len() == self.items.capacity() {
            let additional = self.items.capacity().max(INITIAL_CAPACITY);
            self.items.try_reserve_exact(additional)?;
        }
        self.items.push(item);
        Ok(self.items.len() - 1)
    }

    /// Make room for `additional` more items up front
    pub fn reserve(&mut self, additional: usize) -> Result<(), RegistryError> {
        self.items.try_reserve(additional)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Index of the first item matching `pred`
    pub fn position<F>(&self, pred: F) -> Option<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.items.iter().position(pred)
    }

    /// Hand the items over, typically to a distance matrix
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: PartialEq> Registry<T> {
    pub fn find(&self, item: &T) -> Option<usize> {
        self.position(|i| i == item)
    }
}

impl<'a, T> IntoIterator for &'a Registry<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
