//! Arena of live timer entries addressed by generational handles.
//!
//! The registry owns every [`TimerEntry`] and therefore every timer
//! descriptor. Removing an entry drops it, which closes its descriptor; the
//! same path is taken for every slot, so there is exactly one way for an entry
//! to release its resources. Stale handles carry an old generation and never
//! match a reused slot.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::TimerFd;
use crate::error::{TimerError, TimerResult};

/// Opaque data handed to every invocation of a timer callback.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Callback invoked on the dispatcher thread when a timer expires.
pub type TimerCallback = Arc<dyn Fn(TimerHandle, Option<&UserData>) + Send + Sync>;

/// Whether a timer repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Expires once, then stays dormant until stopped.
    SingleShot,
    /// Expires every interval.
    Periodic,
}

/// Opaque identifier of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle {
    index: u32,
    generation: u32,
}

impl TimerHandle {
    /// Slot index inside the registry.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}.{}", self.index, self.generation)
    }
}

/// One armed timer.
pub struct TimerEntry {
    handle: TimerHandle,
    descriptor: TimerFd,
    callback: TimerCallback,
    user_data: Option<UserData>,
    interval_ms: f64,
    kind: TimerKind,
}

impl TimerEntry {
    /// Handle identifying this entry.
    #[must_use]
    pub fn handle(&self) -> TimerHandle {
        self.handle
    }

    /// Descriptor backing this entry.
    #[must_use]
    pub fn descriptor(&self) -> &TimerFd {
        &self.descriptor
    }

    /// Callback invoked on expiration.
    #[must_use]
    pub fn callback(&self) -> &TimerCallback {
        &self.callback
    }

    /// User data passed to the callback.
    #[must_use]
    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    /// Requested interval in milliseconds.
    #[must_use]
    pub fn interval_ms(&self) -> f64 {
        self.interval_ms
    }

    /// Timer kind.
    #[must_use]
    pub fn kind(&self) -> TimerKind {
        self.kind
    }
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("handle", &self.handle)
            .field("fd", &self.descriptor.as_raw_fd())
            .field("interval_ms", &self.interval_ms)
            .field("kind", &self.kind)
            .field("has_user_data", &self.user_data.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<TimerEntry>,
}

/// Collection of live timer entries.
#[derive(Debug)]
pub struct TimerRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_fd: HashMap<RawFd, TimerHandle>,
    capacity: usize,
}

impl TimerRegistry {
    /// Create an empty registry holding at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_fd: HashMap::new(),
            capacity,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_fd.len()
    }

    /// Whether the registry holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_fd.is_empty()
    }

    /// Maximum number of live entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether another entry would exceed the capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Register an armed descriptor and return the handle of the new entry.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::CapacityExhausted`] when the registry is full. The
    /// descriptor is dropped in that case.
    pub fn insert(
        &mut self,
        descriptor: TimerFd,
        kind: TimerKind,
        interval_ms: f64,
        callback: TimerCallback,
        user_data: Option<UserData>,
    ) -> TimerResult<TimerHandle> {
        if self.is_full() {
            return Err(TimerError::CapacityExhausted(self.capacity));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_overflow| TimerError::CapacityExhausted(self.capacity))?;
                self.slots.push(Slot::default());
                index
            }
        };

        let Some(slot) = self.slots.get_mut(index as usize) else {
            return Err(TimerError::CapacityExhausted(self.capacity));
        };

        let handle = TimerHandle {
            index,
            generation: slot.generation,
        };
        self.by_fd.insert(descriptor.as_raw_fd(), handle);
        slot.entry = Some(TimerEntry {
            handle,
            descriptor,
            callback,
            user_data,
            interval_ms,
            kind,
        });

        Ok(handle)
    }

    /// Remove the entry identified by `handle`.
    ///
    /// Returns `None` for unknown or stale handles. Dropping the returned
    /// entry closes its descriptor.
    pub fn remove(&mut self, handle: TimerHandle) -> Option<TimerEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }

        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_fd.remove(&entry.descriptor.as_raw_fd());
        Some(entry)
    }

    /// Look up a live entry.
    #[must_use]
    pub fn get(&self, handle: TimerHandle) -> Option<&TimerEntry> {
        self.slots
            .get(handle.index as usize)
            .and_then(|slot| slot.entry.as_ref())
            .filter(|entry| entry.handle == handle)
    }

    /// Whether `handle` identifies a live entry.
    #[must_use]
    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Resolve a descriptor to the entry that owns it.
    #[must_use]
    pub fn lookup_fd(&self, fd: RawFd) -> Option<&TimerEntry> {
        self.by_fd.get(&fd).and_then(|&handle| self.get(handle))
    }

    /// Handles of all live entries in slot order.
    pub fn handles(&self) -> impl Iterator<Item = TimerHandle> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(TimerEntry::handle))
    }

    /// Replace the contents of `poll_set` with one read-interest entry per
    /// live descriptor, in slot order.
    pub fn fill_poll_set(&self, poll_set: &mut Vec<libc::pollfd>) {
        poll_set.clear();
        poll_set.extend(self.slots.iter().filter_map(|slot| {
            slot.entry.as_ref().map(|entry| libc::pollfd {
                fd: entry.descriptor.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
        }));
    }

    /// Remove every entry, returning them for the caller to drop.
    pub fn drain(&mut self) -> Vec<TimerEntry> {
        let handles: Vec<TimerHandle> = self.handles().collect();
        handles
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }
}
