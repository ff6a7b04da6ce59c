//! Dense arena addressed by stable integer ids.
//!
//! Slots are never reused: removing an element leaves a hole, so an id
//! handed out once keeps meaning the same element (or nothing) for the
//! lifetime of the arena. Iteration always walks slots in id order.

use std::{
    marker::PhantomData,
    ops::{Index, IndexMut},
};

#[derive(Clone, Debug, PartialEq)]
pub struct Arena<Id: IdLike + Copy, T> {
    slots: Vec<Option<T>>,
    len: usize,
    _phantom: PhantomData<Id>,
}

impl<Id: IdLike + Copy, T> Arena<Id, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            _phantom: PhantomData,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            len: 0,
            _phantom: PhantomData,
        }
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever handed out, i.e. one past the largest id.
    /// Useful for sizing per-id side tables such as visited sets.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, x: T) -> Id {
        let id = Id::from_raw(self.slots.len());
        self.slots.push(Some(x));
        self.len += 1;
        id
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.slots.get(id.into_raw()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.slots.get_mut(id.into_raw()).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: Id) -> Option<T> {
        let removed = self.slots.get_mut(id.into_raw()).and_then(Option::take);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Removes every element for which `f` returns `false`, returning the
    /// ids that were dropped in ascending order.
    pub fn retain(&mut self, mut f: impl FnMut(Id, &T) -> bool) -> Vec<Id> {
        let mut removed = vec![];
        for (raw, slot) in self.slots.iter_mut().enumerate() {
            let id = Id::from_raw(raw);
            if slot.as_ref().is_some_and(|x| !f(id, x)) {
                *slot = None;
                self.len -= 1;
                removed.push(id);
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(raw, x)| x.as_ref().map(|x| (Id::from_raw(raw), x)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(raw, x)| x.as_mut().map(|x| (Id::from_raw(raw), x)))
    }
}

impl<Id: IdLike + Copy, T> Default for Arena<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: IdLike + Copy, T> FromIterator<T> for Arena<Id, T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut arena = Self::new();
        for x in iter {
            arena.push(x);
        }
        arena
    }
}

impl<Id: IdLike + Copy, T> Index<Id> for Arena<Id, T> {
    type Output = T;

    fn index(&self, index: Id) -> &Self::Output {
        self.get(index).expect("arena id refers to a removed element")
    }
}

impl<Id: IdLike + Copy, T> IndexMut<Id> for Arena<Id, T> {
    fn index_mut(&mut self, index: Id) -> &mut Self::Output {
        self.get_mut(index)
            .expect("arena id refers to a removed element")
    }
}

pub trait IdLike {
    fn from_raw(index: usize) -> Self;
    fn into_raw(self) -> usize;
}
