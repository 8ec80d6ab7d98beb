use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use vibetree_core::protocol::DaemonEvent;

/// Events queued per client before new ones are dropped. Terminal output
/// lost this way is resent as a full backlog snapshot on the next chunk.
pub const CLIENT_QUEUE_DEPTH: usize = 4096;

struct Client {
    event_tx: mpsc::Sender<DaemonEvent>,
    subscribed: bool,
}

/// Connected IPC clients keyed by session id.
pub struct SessionManager {
    clients: BTreeMap<usize, Client>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
    Gone,
}

fn deliver(session_id: usize, client: &Client, event: DaemonEvent) -> Delivery {
    match client.event_tx.try_send(event) {
        Ok(()) => Delivery::Sent,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(session_id, "client queue full, dropping event");
            Delivery::Dropped
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
        }
    }

    pub fn add_session_with_id(&mut self, id: usize, event_tx: mpsc::Sender<DaemonEvent>) {
        debug!(session_id = id, "client registered");
        self.clients.insert(
            id,
            Client {
                event_tx,
                subscribed: false,
            },
        );
    }

    pub fn remove_session(&mut self, id: usize) {
        if self.clients.remove(&id).is_some() {
            debug!(session_id = id, "client removed");
        }
    }

    pub fn set_subscribed(&mut self, id: usize, subscribed: bool) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.subscribed = subscribed;
        }
    }

    /// Queue `event` for every subscribed client, forgetting clients that hung up.
    pub fn broadcast(&mut self, event: &DaemonEvent) {
        self.clients.retain(|&id, client| {
            !client.subscribed || !matches!(deliver(id, client, event.clone()), Delivery::Gone)
        });
    }

    /// Queue `event` for one client. `false` means the client is gone.
    pub fn send_to(&mut self, session_id: usize, event: DaemonEvent) -> bool {
        self.deliver_to(session_id, event) != Delivery::Gone
    }

    /// Like [`send_to`](Self::send_to), but tells a full queue apart from a delivered event.
    pub fn deliver_to(&mut self, session_id: usize, event: DaemonEvent) -> Delivery {
        let Some(client) = self.clients.get(&session_id) else {
            return Delivery::Gone;
        };
        let delivery = deliver(session_id, client, event);
        if delivery == Delivery::Gone {
            self.clients.remove(&session_id);
        }
        delivery
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.clients.len()
    }
}
