//! Server-side collection of live connections.
//!
//! The [`Registry`] assigns every admitted connection an id from a counter that only ever
//! grows, so an id is never handed out twice for the lifetime of the server. Connections
//! stay in the registry until they are observed closed during a send, a
//! [`Registry::prune`] or an explicit [`Registry::disconnect_client`]; removal is never
//! eager. Dead entries found during a broadcast are marked and compacted out in one pass
//! after the iteration.
//!
//! Application behaviour is injected through [`ServerHooks`].
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU32, Ordering},
};

use log::{debug, info};

use super::{Connection, ConnectionId, Message, MessageKind};

/// Application callbacks for a server endpoint.
///
/// `on_client_connect` and `on_client_disconnect` may run on the I/O thread;
/// `on_message` runs on whichever thread calls [`Server::update`](super::Server::update).
pub trait ServerHooks<T: MessageKind>: Send + Sync + 'static {
    /// Decides whether a freshly accepted peer is admitted. Rejected sockets are dropped.
    fn on_client_connect(&self, candidate: &Connection<T>) -> bool;

    /// Called once for every admitted connection that is found closed.
    fn on_client_disconnect(&self, client: &Connection<T>) {
        let _ = client;
    }

    /// Called for every drained inbound message, in arrival order.
    fn on_message(&self, registry: &Registry<T>, sender: ConnectionId, message: Message<T>) {
        let _ = (registry, sender, message);
    }
}

pub struct Registry<T: MessageKind> {
    connections: Mutex<Vec<Arc<Connection<T>>>>,
    next_id: AtomicU32,
    hooks: Arc<dyn ServerHooks<T>>,
}

impl<T: MessageKind> Registry<T> {
    pub fn new(first_id: u32, hooks: Arc<dyn ServerHooks<T>>) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(first_id),
            hooks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Connection<T>>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn hooks(&self) -> &dyn ServerHooks<T> {
        self.hooks.as_ref()
    }

    /// Offers `candidate` to the application and, if accepted, registers it under the next id
    /// and starts its read loop.
    pub fn admit(&self, candidate: Arc<Connection<T>>) -> Option<ConnectionId> {
        if !self.hooks.on_client_connect(&candidate) {
            info!("[-----] connection denied");
            return None;
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::AcqRel));
        {
            // The id is stored before the entry becomes visible to lookups.
            let mut connections = self.lock();
            candidate.connect_to_client(id);
            connections.push(candidate);
        }

        info!("[{id}] connection approved");
        Some(id)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection<T>>> {
        self.lock().iter().find(|c| c.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.lock().iter().map(|c| c.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sends to `client` if it is connected; otherwise drops it from the registry.
    pub fn message_client(&self, client: &Arc<Connection<T>>, msg: &Message<T>) {
        if client.is_connected() {
            client.send(msg.clone());
        } else {
            self.remove(&[client.id()]);
        }
    }

    /// Sends to the connection registered under `id`. No-op if there is none.
    pub fn message_client_id(&self, id: ConnectionId, msg: &Message<T>) {
        match self.connection(id) {
            Some(client) => self.message_client(&client, msg),
            None => debug!("[{id}] no such client"),
        }
    }

    /// Sends to every connected client except `except`, then drops any found disconnected.
    pub fn message_all_clients(&self, msg: &Message<T>, except: Option<ConnectionId>) {
        let mut dead = Vec::new();

        for client in self.lock().iter() {
            if !client.is_connected() {
                dead.push(client.id());
            } else if Some(client.id()) != except {
                client.send(msg.clone());
            }
        }

        if !dead.is_empty() {
            self.remove(&dead);
        }
    }

    /// Closes the connection registered under `id` and drops it. Returns `false` if unknown.
    pub fn disconnect_client(&self, id: ConnectionId) -> bool {
        let Some(client) = self.connection(id) else {
            return false;
        };

        client.disconnect();
        self.remove(&[id]);
        true
    }

    /// Drops every closed connection. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let dead: Vec<_> = self
            .lock()
            .iter()
            .filter(|c| !c.is_connected())
            .map(|c| c.id())
            .collect();

        if dead.is_empty() {
            0
        } else {
            self.remove(&dead)
        }
    }

    /// Closes and forgets all connections without notifying the hooks.
    pub(crate) fn close_all(&self) {
        for client in self.lock().drain(..) {
            client.close();
        }
    }

    /// Compacts `ids` out of the registry in one pass and notifies the hooks once for each
    /// connection actually removed.
    fn remove(&self, ids: &[ConnectionId]) -> usize {
        let removed: Vec<_> = {
            let mut connections = self.lock();
            let (removed, kept): (Vec<_>, Vec<_>) = connections
                .drain(..)
                .partition(|c| ids.contains(&c.id()));
            *connections = kept;
            removed
        };

        for client in &removed {
            info!("[{}] client disconnected", client.id());
            self.hooks.on_client_disconnect(client);
        }
        removed.len()
    }
}
