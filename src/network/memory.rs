// In-process transport: a hub of named inboxes standing in for the wire.
// Tests share one hub between all nodes; delivery is a channel send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::ballot::Ballot;
use crate::endpoint::{Endpoint, Scheme};
use crate::error::Error;
use crate::network::{Message, Network, NetworkClient};
use crate::node::LocalNode;
use crate::transaction::Transaction;

const INBOX_CAPACITY: usize = 1024;

struct HubEntry {
    sender: mpsc::SyncSender<Message>,
    node: Option<Arc<LocalNode>>,
    ready: bool,
}

/// Shared registry of in-process endpoints. Passed explicitly to every
/// `MemoryNetwork` instead of living in a process global.
pub struct MemoryHub {
    entries: Mutex<HashMap<String, HubEntry>>,
    counter: AtomicUsize,
}

impl MemoryHub {
    pub fn new() -> Arc<MemoryHub> {
        Arc::new(MemoryHub {
            entries: Mutex::new(HashMap::new()),
            counter: AtomicUsize::new(0),
        })
    }

    fn deliver(&self, addr: &str, message: Message) -> Result<(), Error> {
        let sender = {
            let entries = self.entries.lock().unwrap();
            let entry = entries
                .get(addr)
                .ok_or_else(|| Error::NetworkProblem(format!("unknown endpoint {}", addr)))?;
            entry.sender.clone()
        };
        sender
            .send(message)
            .map_err(|_| Error::NetworkProblem(format!("endpoint {} is gone", addr)))
    }
}

pub struct MemoryNetwork {
    hub: Arc<MemoryHub>,
    endpoint: Endpoint,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl MemoryNetwork {
    pub fn new(hub: &Arc<MemoryHub>) -> Arc<MemoryNetwork> {
        let seq = hub.counter.fetch_add(1, Ordering::SeqCst);
        let endpoint = Endpoint::new(Scheme::Memory, &format!("h{}", seq), 1);

        let (sender, receiver) = mpsc::sync_channel(INBOX_CAPACITY);
        hub.entries.lock().unwrap().insert(
            endpoint.addr(),
            HubEntry {
                sender,
                node: None,
                ready: false,
            },
        );

        Arc::new(MemoryNetwork {
            hub: Arc::clone(hub),
            endpoint,
            receiver: Mutex::new(Some(receiver)),
        })
    }
}

impl Network for MemoryNetwork {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn set_local_node(&self, node: Arc<LocalNode>) {
        let mut entries = self.hub.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&self.endpoint.addr()) {
            entry.node = Some(node);
        }
    }

    fn start(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Deregisters the inbox; the dropped sender closes the receive channel,
    /// which is the runner's shutdown signal.
    fn stop(&self) {
        self.hub.entries.lock().unwrap().remove(&self.endpoint.addr());
    }

    fn ready(&self) {
        let mut entries = self.hub.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&self.endpoint.addr()) {
            entry.ready = true;
        }
    }

    fn is_ready(&self) -> bool {
        let entries = self.hub.entries.lock().unwrap();
        entries
            .get(&self.endpoint.addr())
            .map(|e| e.ready && e.node.is_some())
            .unwrap_or(false)
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.receiver.lock().unwrap().take()
    }

    fn get_client(&self, endpoint: &Endpoint) -> Option<Arc<dyn NetworkClient>> {
        if endpoint.scheme != Scheme::Memory {
            return None;
        }
        Some(Arc::new(MemoryClient {
            hub: Arc::clone(&self.hub),
            addr: endpoint.addr(),
        }))
    }
}

struct MemoryClient {
    hub: Arc<MemoryHub>,
    addr: String,
}

impl NetworkClient for MemoryClient {
    fn connect(&self, _node: &LocalNode) -> Result<Vec<u8>, Error> {
        let entries = self.hub.entries.lock().unwrap();
        let entry = entries
            .get(&self.addr)
            .ok_or_else(|| Error::NetworkProblem(format!("unknown endpoint {}", self.addr)))?;
        if !entry.ready {
            return Err(Error::NetworkProblem(format!("endpoint {} not ready", self.addr)));
        }
        let node = entry
            .node
            .as_ref()
            .ok_or_else(|| Error::NetworkProblem(format!("endpoint {} not ready", self.addr)))?;
        serde_json::to_vec(&node.as_validator())
            .map_err(|e| Error::NetworkProblem(format!("encode validator: {}", e)))
    }

    fn get_node_info(&self) -> Result<Vec<u8>, Error> {
        let entries = self.hub.entries.lock().unwrap();
        let entry = entries
            .get(&self.addr)
            .ok_or_else(|| Error::NetworkProblem(format!("unknown endpoint {}", self.addr)))?;
        let node = entry
            .node
            .as_ref()
            .ok_or_else(|| Error::NetworkProblem(format!("endpoint {} not ready", self.addr)))?;
        Ok(node.serialize())
    }

    fn send_message(&self, transaction: &Transaction) -> Result<(), Error> {
        self.hub
            .deliver(&self.addr, Message::Transaction(transaction.clone()))
    }

    fn send_ballot(&self, ballot: &Ballot) -> Result<(), Error> {
        self.hub.deliver(&self.addr, Message::Ballot(ballot.clone()))
    }
}
