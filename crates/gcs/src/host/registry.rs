//! Sharded container registry.
//!
//! Each container sits behind its own async mutex, so commands against one
//! container serialize while different containers proceed in parallel.
//! Creations in flight are tracked separately: a container only enters the
//! map once the runtime has created it.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;

use super::container::{Container, ContainerState};
use crate::error::HandlerError;

pub type ContainerRef = Arc<Mutex<Container>>;

#[derive(Default)]
pub struct ContainerRegistry {
    containers: DashMap<String, ContainerRef>,
    creating: DashSet<String>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<ContainerRef> {
        self.containers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Like [`get`](Self::get), failing with `InvalidContainerState` for unknown ids.
    pub fn container(&self, id: &str) -> Result<ContainerRef, HandlerError> {
        self.get(id).ok_or_else(|| {
            HandlerError::InvalidContainerState(format!("container {id} does not exist"))
        })
    }

    /// Claims `id` for creation.
    ///
    /// Fails if another create for the id is in flight or a live container
    /// holds it. A `Deleted` tombstone may be replaced.
    pub async fn reserve(&self, id: &str) -> Result<Reservation<'_>, HandlerError> {
        if !self.creating.insert(id.to_string()) {
            return Err(HandlerError::InvalidContainerState(format!(
                "container {id} is already being created"
            )));
        }
        let reservation = Reservation {
            registry: self,
            id: id.to_string(),
        };

        if let Some(existing) = self.get(id) {
            let state = existing.lock().await.state();
            if state != ContainerState::Deleted {
                return Err(HandlerError::InvalidContainerState(format!(
                    "container {id} already exists ({state})"
                )));
            }
        }
        Ok(reservation)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// In-flight creation of one container id. Dropping it without
/// [`commit`](Reservation::commit) releases the id untouched.
pub struct Reservation<'a> {
    registry: &'a ContainerRegistry,
    id: String,
}

impl Reservation<'_> {
    pub fn commit(self, container: Container) -> ContainerRef {
        let container = Arc::new(Mutex::new(container));
        self.registry
            .containers
            .insert(self.id.clone(), Arc::clone(&container));
        container
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.creating.remove(&self.id);
    }
}
