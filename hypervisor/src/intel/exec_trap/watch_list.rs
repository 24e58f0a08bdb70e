//! Sorted set of process identifiers whose mode transitions are trapped.
//!
//! Looked up on every MOV to CR3 exit, so the set is a fixed-size sorted array searched with a
//! binary search under a spinlock; nothing allocates once the list exists.

use {
    crate::{config::MAX_WATCHED_PROCESSES, error::HypervisorError},
    spin::Mutex,
};

#[derive(Debug)]
struct SortedIds {
    ids: [u32; MAX_WATCHED_PROCESSES],
    len: usize,
}

impl SortedIds {
    fn as_slice(&self) -> &[u32] {
        &self.ids[..self.len]
    }

    fn insert(&mut self, id: u32) -> Result<(), HypervisorError> {
        let Err(position) = self.as_slice().binary_search(&id) else {
            return Ok(());
        };

        if self.len == MAX_WATCHED_PROCESSES {
            return Err(HypervisorError::WatchListFull);
        }

        self.ids.copy_within(position..self.len, position + 1);
        self.ids[position] = id;
        self.len += 1;

        Ok(())
    }

    fn remove(&mut self, id: u32) -> bool {
        let Ok(position) = self.as_slice().binary_search(&id) else {
            return false;
        };

        self.ids.copy_within(position + 1..self.len, position);
        self.len -= 1;
        self.ids[self.len] = 0;

        true
    }
}

/// The process watch-list.
#[derive(Debug)]
pub struct WatchList {
    inner: Mutex<SortedIds>,
}

impl Default for WatchList {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchList {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(SortedIds {
                ids: [0; MAX_WATCHED_PROCESSES],
                len: 0,
            }),
        }
    }

    /// Adds `process_id`. Adding an id that is already present succeeds without a change.
    ///
    /// # Errors
    ///
    /// [`HypervisorError::WatchListFull`] if the list holds `MAX_WATCHED_PROCESSES` ids.
    pub fn add(&self, process_id: u32) -> Result<(), HypervisorError> {
        self.inner.lock().insert(process_id)
    }

    /// Removes `process_id`, returning whether it was present.
    pub fn remove(&self, process_id: u32) -> bool {
        self.inner.lock().remove(process_id)
    }

    pub fn contains(&self, process_id: u32) -> bool {
        self.inner.lock().as_slice().binary_search(&process_id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
