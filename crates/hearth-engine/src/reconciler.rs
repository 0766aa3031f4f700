use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::instrument;

use hearth_core::{Deadline, DeviceId, DeviceState};
use hearth_store::EventStore;

use crate::error::ReconcileError;

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Max cached device states. The least recently used entry is evicted
    /// on overflow.
    pub cache_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
        }
    }
}

struct CacheEntry {
    state: DeviceState,
    last_used: u64,
}

/// Bounded cache of derived states. Pure optimization: any entry may be
/// evicted at will; the reconciler rebuilds from sequence 1 on a miss.
struct StateCache {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    tick: u64,
}

impl StateCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            tick: 0,
        }
    }

    fn get(&mut self, device_id: &str) -> Option<DeviceState> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(device_id).map(|entry| {
            entry.last_used = tick;
            entry.state.clone()
        })
    }

    /// Publish a computed state. The watermark never decreases: a stale
    /// result from a racing query is dropped.
    fn put(&mut self, state: DeviceState) {
        self.tick += 1;
        let key = state.device_id.as_str().to_string();
        if let Some(existing) = self.entries.get(&key) {
            if existing.state.as_of_sequence > state.as_of_sequence {
                return;
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                state,
                last_used: self.tick,
            },
        );
        self.evict_over_capacity();
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                return;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Derives the current state of a device by folding its event history,
/// resuming from a cached snapshot's watermark instead of replaying from
/// sequence 1 on every call.
pub struct StateReconciler {
    store: Arc<EventStore>,
    cache: Mutex<StateCache>,
}

impl StateReconciler {
    pub fn new(store: Arc<EventStore>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            cache: Mutex::new(StateCache::new(config.cache_capacity)),
        }
    }

    /// Current state for a device. Always re-queries the store for events
    /// past the cached watermark, so a read started after an append's
    /// durability point observes it.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn current_state(
        &self,
        device_id: &DeviceId,
        deadline: Deadline,
    ) -> Result<DeviceState, ReconcileError> {
        let cached = self.cache.lock().get(device_id.as_str());
        let mut state = cached.unwrap_or_else(|| DeviceState::initial(device_id.clone()));

        let fresh = self
            .store
            .read_from(device_id, state.as_of_sequence, deadline)?;

        if state.as_of_sequence == 0 && fresh.is_empty() {
            return Err(ReconcileError::NotFound(device_id.clone()));
        }

        for event in &fresh {
            state.apply(event);
        }

        self.cache.lock().put(state.clone());
        Ok(state)
    }
}
