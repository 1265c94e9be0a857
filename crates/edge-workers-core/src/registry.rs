use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use edge_workers_common::WorkerError;

use crate::instance::RunningInstance;

enum Slot {
    Starting,
    Running(Arc<RunningInstance>),
    Stopping,
}

/// Map of worker id to instance state.
///
/// A worker id is either absent, `Starting`, `Running` or `Stopping`. Only
/// `Running` entries count as running; the transitional states make a
/// concurrent `start` of the same id fail instead of racing.
#[derive(Default)]
pub(crate) struct InstanceRegistry {
    slots: DashMap<String, Slot>,
}

impl InstanceRegistry {
    /// Claim `worker_id` for starting.
    pub(crate) fn reserve(&self, worker_id: &str) -> Result<Reservation<'_>, WorkerError> {
        match self.slots.entry(worker_id.to_string()) {
            Entry::Occupied(_) => Err(WorkerError::already_running(worker_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Starting);
                Ok(Reservation {
                    registry: self,
                    worker_id: worker_id.to_string(),
                    committed: false,
                })
            }
        }
    }

    /// Move a running instance to `Stopping` and hand it back.
    pub(crate) fn begin_stop(&self, worker_id: &str) -> Result<Arc<RunningInstance>, WorkerError> {
        let mut slot = self
            .slots
            .get_mut(worker_id)
            .ok_or_else(|| WorkerError::not_running(worker_id))?;
        match std::mem::replace(&mut *slot, Slot::Stopping) {
            Slot::Running(instance) => Ok(instance),
            other => {
                *slot = other;
                Err(WorkerError::not_running(worker_id))
            }
        }
    }

    pub(crate) fn finish_stop(&self, worker_id: &str) {
        self.slots
            .remove_if(worker_id, |_, slot| matches!(slot, Slot::Stopping));
    }

    pub(crate) fn get(&self, worker_id: &str) -> Option<Arc<RunningInstance>> {
        self.slots.get(worker_id).and_then(|slot| match &*slot {
            Slot::Running(instance) => Some(Arc::clone(instance)),
            _ => None,
        })
    }

    pub(crate) fn is_running(&self, worker_id: &str) -> bool {
        self.slots
            .get(worker_id)
            .is_some_and(|slot| matches!(&*slot, Slot::Running(_)))
    }

    /// Ids of running workers.
    pub(crate) fn snapshot(&self) -> BTreeSet<String> {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Running(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove `instance` if it is still the one registered for its id.
    pub(crate) fn retire(&self, instance: &RunningInstance) -> bool {
        self.slots
            .remove_if(instance.worker_id(), |_, slot| {
                matches!(slot, Slot::Running(current) if std::ptr::eq(Arc::as_ptr(current), instance))
            })
            .is_some()
    }

    /// Remove every running instance.
    pub(crate) fn drain(&self) -> Vec<Arc<RunningInstance>> {
        let ids = self.snapshot();
        ids.iter()
            .filter_map(|id| {
                self.slots
                    .remove_if(id, |_, slot| matches!(slot, Slot::Running(_)))
            })
            .filter_map(|(_, slot)| match slot {
                Slot::Running(instance) => Some(instance),
                _ => None,
            })
            .collect()
    }
}

/// A `Starting` slot. Released on drop unless committed, so an abandoned
/// start never leaves the id stuck.
pub(crate) struct Reservation<'a> {
    registry: &'a InstanceRegistry,
    worker_id: String,
    committed: bool,
}

impl Reservation<'_> {
    pub(crate) fn commit(mut self, instance: Arc<RunningInstance>) {
        self.registry
            .slots
            .insert(self.worker_id.clone(), Slot::Running(instance));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry
                .slots
                .remove_if(&self.worker_id, |_, slot| matches!(slot, Slot::Starting));
        }
    }
}
