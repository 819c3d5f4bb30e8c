//! Subscription registry and fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;

use super::{ConnectionId, Envelope};
use crate::task::TaskId;

/// Outbound queue of one connection. A closed receiver marks the connection dead.
pub type Sink = mpsc::UnboundedSender<Envelope>;

struct Connection {
    /// Label chosen by the client; several sockets may share it
    client_id: String,
    sink: Sink,
}

/// Routes envelopes from tasks to live connections.
///
/// Delivery never blocks: every sink is an unbounded queue drained by the
/// connection's own writer task.
#[derive(Default)]
pub struct NotificationHub {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    subscriptions: RwLock<HashMap<TaskId, HashSet<ConnectionId>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket opened by `client_id` and return its connection id.
    pub fn connect(&self, client_id: &str, sink: Sink) -> ConnectionId {
        let conn = ConnectionId::new();
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                conn,
                Connection {
                    client_id: client_id.to_string(),
                    sink,
                },
            );
        tracing::info!(connection = %conn, client_id = %client_id, "Observer connected");
        conn
    }

    /// Drop one socket and its subscriptions. Other sockets of the same
    /// client are untouched.
    pub fn disconnect(&self, conn: ConnectionId) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn);

        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|_, conns| {
            conns.remove(&conn);
            !conns.is_empty()
        });

        if let Some(connection) = removed {
            tracing::info!(connection = %conn, client_id = %connection.client_id, "Observer disconnected");
        }
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&conn)
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Live sockets opened under `client_id`.
    pub fn connections_of(&self, client_id: &str) -> Vec<ConnectionId> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, connection)| connection.client_id == client_id)
            .map(|(conn, _)| *conn)
            .collect()
    }

    /// Subscribe `conn` to `task_id`. Idempotent.
    pub fn subscribe(&self, task_id: TaskId, conn: ConnectionId) {
        let added = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task_id)
            .or_default()
            .insert(conn);
        if added {
            tracing::debug!(task_id = %task_id, connection = %conn, "Subscribed to task");
        }
    }

    /// Idempotent. A task left without subscribers loses its index entry.
    pub fn unsubscribe(&self, task_id: TaskId, conn: ConnectionId) {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(conns) = subscriptions.get_mut(&task_id) {
            conns.remove(&conn);
            if conns.is_empty() {
                subscriptions.remove(&task_id);
            }
        }
    }

    /// Drop every subscription to a task that no longer exists.
    pub fn forget_task(&self, task_id: TaskId) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_id);
    }

    /// Current subscribers of a task.
    pub fn subscribers(&self, task_id: TaskId) -> Vec<ConnectionId> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the subscription index has an entry for the task.
    pub fn has_subscriptions(&self, task_id: TaskId) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&task_id)
    }

    /// Deliver to every subscriber of `task_id`. Returns how many accepted it.
    ///
    /// Dead sinks are pruned; delivery to the rest goes on.
    pub fn broadcast(&self, task_id: TaskId, envelope: &Envelope) -> usize {
        let recipients = self.subscribers(task_id);
        if recipients.is_empty() {
            return 0;
        }

        let sinks: Vec<(ConnectionId, Option<Sink>)> = {
            let connections = self
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            recipients
                .into_iter()
                .map(|conn| {
                    let sink = connections.get(&conn).map(|c| c.sink.clone());
                    (conn, sink)
                })
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn, sink) in sinks {
            match sink {
                Some(sink) if sink.send(envelope.clone()).is_ok() => delivered += 1,
                _ => dead.push(conn),
            }
        }

        for conn in dead {
            tracing::debug!(task_id = %task_id, connection = %conn, "Removing dead subscriber");
            self.disconnect(conn);
        }
        delivered
    }

    /// Deliver to one connection. A dead sink is removed.
    pub fn send_to(&self, conn: ConnectionId, envelope: Envelope) -> bool {
        let sink = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conn)
            .map(|c| c.sink.clone());
        match sink {
            Some(sink) if sink.send(envelope).is_ok() => true,
            Some(_) => {
                self.disconnect(conn);
                false
            }
            None => false,
        }
    }

    /// Deliver to every connection, subscribed or not.
    pub fn broadcast_all(&self, envelope: &Envelope) -> usize {
        let sinks: Vec<(ConnectionId, Sink)> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(conn, c)| (*conn, c.sink.clone()))
            .collect();

        let mut delivered = 0;
        for (conn, sink) in sinks {
            if sink.send(envelope.clone()).is_ok() {
                delivered += 1;
            } else {
                self.disconnect(conn);
            }
        }
        delivered
    }
}
