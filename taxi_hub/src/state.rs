use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use taxi_sim::{codec::FeedRecord, transport::Outgoing, FeedBatch, PositionMessage, Role, TransportError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("{role} {id} is already subscribed")]
    AlreadySubscribed { role: Role, id: String },
}

/// Close reason sent to a client whose queue overflowed.
pub const SLOW_SUBSCRIBER: &str = "slow subscriber";

/// Identifies one admission, so a stale connection cannot remove the entry of
/// a newer one with the same id.
pub type Generation = u64;

#[derive(Debug)]
struct TaxiEntry {
    generation: Generation,
    position: PositionMessage,
}

#[derive(Debug)]
struct ClientEntry {
    generation: Generation,
    /// `None` until the client's connection is attached.
    outgoing: Option<Outgoing>,
}

/// Everything the hub knows about its subscribers.
#[derive(Debug, Default)]
pub struct HubState {
    taxis: HashMap<String, TaxiEntry>,
    clients: HashMap<String, ClientEntry>,
    next_generation: Generation,
}

pub type SharedState = Arc<Mutex<HubState>>;

pub fn lock(state: &SharedState) -> MutexGuard<'_, HubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HubState {
    /// Reserves `id` for `role`. Taxis start at `initial`.
    pub fn admit(
        &mut self,
        id: &str,
        role: Role,
        initial: PositionMessage,
    ) -> Result<Generation, AdmitError> {
        let taken = match role {
            Role::Producer => self.taxis.contains_key(id),
            Role::Consumer => self.clients.contains_key(id),
        };
        if taken {
            return Err(AdmitError::AlreadySubscribed {
                role,
                id: id.to_string(),
            });
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        match role {
            Role::Producer => {
                let entry = TaxiEntry {
                    generation,
                    position: initial,
                };
                self.taxis.insert(id.to_string(), entry);
            }
            Role::Consumer => {
                let entry = ClientEntry {
                    generation,
                    outgoing: None,
                };
                self.clients.insert(id.to_string(), entry);
            }
        }
        Ok(generation)
    }

    /// Hands the client its connection. Returns false, and drops
    /// `outgoing`, if that admission is no longer current.
    pub fn attach_client(&mut self, id: &str, generation: Generation, outgoing: Outgoing) -> bool {
        match self.clients.get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.outgoing = Some(outgoing);
                true
            }
            _ => false,
        }
    }

    /// Records a taxi's latest position. Unknown ids are ignored.
    pub fn update_position(&mut self, id: &str, position: PositionMessage) -> bool {
        match self.taxis.get_mut(id) {
            Some(entry) => {
                entry.position = position;
                true
            }
            None => false,
        }
    }

    /// Removes `id` if it still belongs to `generation`.
    pub fn remove(&mut self, id: &str, role: Role, generation: Generation) -> bool {
        let current = match role {
            Role::Producer => self.taxis.get(id).map(|entry| entry.generation),
            Role::Consumer => self.clients.get(id).map(|entry| entry.generation),
        };
        if current != Some(generation) {
            return false;
        }
        match role {
            Role::Producer => {
                self.taxis.remove(id);
            }
            Role::Consumer => {
                self.clients.remove(id);
            }
        }
        true
    }

    pub fn taxi_count(&self) -> usize {
        self.taxis.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn position(&self, id: &str) -> Option<PositionMessage> {
        self.taxis.get(id).map(|entry| entry.position)
    }

    pub fn snapshot(&self) -> FeedBatch {
        FeedBatch {
            records: self
                .taxis
                .iter()
                .map(|(id, entry)| FeedRecord {
                    producer_id: id.clone(),
                    latitude: entry.position.latitude,
                    longitude: entry.position.longitude,
                })
                .collect(),
        }
    }

    /// Queues `batch` for every attached client. Clients that are gone or
    /// not keeping up are dropped; slow ones are closed with a policy
    /// violation. Returns how many clients got the batch.
    pub fn broadcast(&mut self, batch: &FeedBatch) -> usize {
        let text = batch.to_string();
        let mut delivered = 0;
        self.clients.retain(|id, entry| {
            let Some(outgoing) = &entry.outgoing else {
                return true;
            };
            match outgoing.try_send_text(text.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TransportError::Full) => {
                    warn!(%id, "dropping slow client");
                    outgoing.abort(SLOW_SUBSCRIBER);
                    false
                }
                Err(e) => {
                    debug!(%id, error = %e, "dropping closed client");
                    false
                }
            }
        });
        delivered
    }
}

/// A subscription that leaves the hub state when dropped.
pub struct Membership {
    state: SharedState,
    id: String,
    role: Role,
    generation: Generation,
}

impl Membership {
    pub fn new(state: SharedState, id: String, role: Role, generation: Generation) -> Self {
        Self {
            state,
            id,
            role,
            generation,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if !lock(&self.state).remove(&self.id, self.role, self.generation) {
            debug!(id = %self.id, role = %self.role, "entry already replaced");
        }
    }
}
