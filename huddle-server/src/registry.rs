//! Live connection registry and broadcast router.
//!
//! One mutex guards the chat core together with the per-connection sender
//! handles. Delivery effects enqueue synchronously while the lock is held
//! (UnboundedSender::send never blocks), which gives every recipient the
//! core's mutation order. No socket I/O happens under the lock; the writer
//! tasks own the sockets, and a slow consumer only grows its own queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use huddle_core::room::{ChatCore, ConnId, Effect, ServerEvent};
use huddle_core::wire;

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    ConnId(NEXT_CONN.fetch_add(1, Ordering::Relaxed))
}

pub type SharedState = Arc<Mutex<ChatState>>;

pub struct ChatState {
    pub core: ChatCore,
    clients: HashMap<ConnId, mpsc::UnboundedSender<String>>,
    peers: HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>>,
    max_envelope_bytes: usize,
}

impl ChatState {
    pub fn new(core: ChatCore, max_envelope_bytes: usize) -> Self {
        Self {
            core,
            clients: HashMap::new(),
            peers: HashMap::new(),
            max_envelope_bytes,
        }
    }

    pub fn register_client(&mut self, conn: ConnId, tx: mpsc::UnboundedSender<String>) {
        self.clients.insert(conn, tx);
    }

    pub fn remove_client(&mut self, conn: ConnId) {
        self.clients.remove(&conn);
    }

    pub fn register_peer(&mut self, conn: ConnId, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.peers.insert(conn, tx);
    }

    pub fn remove_peer(&mut self, conn: ConnId) {
        self.peers.remove(&conn);
    }

    /// Execute the delivery effects now, fire-and-forget; return the
    /// persistence effects for the caller to run after releasing the lock.
    pub fn apply(&mut self, effects: Vec<Effect>) -> Vec<Effect> {
        let mut storage = Vec::new();
        for effect in effects {
            match effect {
                Effect::Unicast(conn, event) => {
                    if let (Some(tx), Some(text)) = (self.clients.get(&conn), encode(&event)) {
                        let _ = tx.send(text);
                    }
                }
                Effect::Multicast {
                    room_id,
                    event,
                    exclude,
                } => {
                    let Some(text) = encode(&event) else { continue };
                    for conn in self.core.conns_in_room(room_id, exclude.as_deref()) {
                        if let Some(tx) = self.clients.get(&conn) {
                            let _ = tx.send(text.clone());
                        }
                    }
                }
                Effect::BroadcastAll(event) => {
                    let Some(text) = encode(&event) else { continue };
                    for tx in self.clients.values() {
                        let _ = tx.send(text.clone());
                    }
                }
                Effect::PeerUnicast(conn, msg) => {
                    match wire::encode_envelope(&msg, self.max_envelope_bytes) {
                        Ok(bytes) => {
                            if let Some(tx) = self.peers.get(&conn) {
                                let _ = tx.send(bytes);
                            }
                        }
                        Err(e) => warn!(%conn, "dropping outbound peer message: {e}"),
                    }
                }
                Effect::PeerBroadcast(msg) => {
                    match wire::encode_envelope(&msg, self.max_envelope_bytes) {
                        Ok(bytes) => {
                            for tx in self.peers.values() {
                                let _ = tx.send(bytes.clone());
                            }
                        }
                        Err(e) => warn!("dropping outbound peer broadcast: {e}"),
                    }
                }
                other => storage.push(other),
            }
        }
        storage
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("failed to encode server event: {e}");
            None
        }
    }
}
