// Validator connection manager: one liveness probe per validator, plus the
// broadcast fan-out. Probes tick once per second forever; only the shutdown
// token stops them. Broadcasts go through a bounded per-peer queue that
// drops the oldest message instead of blocking consensus.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::common::Address;
use crate::error::Error;
use crate::network::{Message, Network, NetworkClient};
use crate::node::{LocalNode, Validator};
use crate::voting::VotingThresholdPolicy;

const LIVENESS_TICK: Duration = Duration::from_secs(1);
const BROADCAST_QUEUE_CAPACITY: usize = 256;

struct PeerQueue {
    messages: Mutex<VecDeque<Message>>,
    wakeup: Condvar,
}

impl PeerQueue {
    fn new() -> PeerQueue {
        PeerQueue {
            messages: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
        }
    }

    /// Drop-oldest on overflow; the queue never blocks the caller.
    fn push(&self, message: Message) {
        let mut messages = self.messages.lock().unwrap();
        if messages.len() >= BROADCAST_QUEUE_CAPACITY {
            messages.pop_front();
        }
        messages.push_back(message);
        self.wakeup.notify_one();
    }

    fn pop(&self, timeout: Duration) -> Option<Message> {
        let mut messages = self.messages.lock().unwrap();
        if messages.is_empty() {
            let (guard, _) = self.wakeup.wait_timeout(messages, timeout).unwrap();
            messages = guard;
        }
        messages.pop_front()
    }
}

struct ConnectionState {
    clients: HashMap<Address, Arc<dyn NetworkClient>>,
    connected: HashMap<Address, bool>,
}

pub struct ValidatorConnectionManager {
    local_node: Arc<LocalNode>,
    network: Arc<dyn Network>,
    policy: Arc<RwLock<VotingThresholdPolicy>>,
    validators: HashMap<Address, Validator>,
    state: RwLock<ConnectionState>,
    queues: HashMap<Address, Arc<PeerQueue>>,
    shutdown: Arc<AtomicBool>,
}

impl ValidatorConnectionManager {
    pub fn new(
        local_node: Arc<LocalNode>,
        network: Arc<dyn Network>,
        policy: Arc<RwLock<VotingThresholdPolicy>>,
        validators: HashMap<Address, Validator>,
    ) -> Arc<ValidatorConnectionManager> {
        let queues = validators
            .keys()
            .map(|addr| (addr.clone(), Arc::new(PeerQueue::new())))
            .collect();

        Arc::new(ValidatorConnectionManager {
            local_node,
            network,
            policy,
            validators,
            state: RwLock::new(ConnectionState {
                clients: HashMap::new(),
                connected: HashMap::new(),
            }),
            queues,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawns the liveness probe and broadcast worker for every validator.
    pub fn start(self: Arc<Self>) {
        debug!(node = %self.local_node.alias(), "starting to connect to validators");
        for validator in self.validators.values() {
            let manager = Arc::clone(&self);
            let v = validator.clone();
            thread::spawn(move || manager.connecting_validator(v));

            let manager = Arc::clone(&self);
            let address = validator.address.clone();
            thread::spawn(move || manager.broadcast_worker(address));
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for queue in self.queues.values() {
            queue.wakeup.notify_one();
        }
    }

    /// Lazy, memoized client lookup; absent for unknown addresses.
    pub fn get_connection(&self, address: &str) -> Option<Arc<dyn NetworkClient>> {
        {
            let state = self.state.read().unwrap();
            if let Some(client) = state.clients.get(address) {
                return Some(Arc::clone(client));
            }
        }

        let validator = self.validators.get(address)?;
        let client = self.network.get_client(&validator.endpoint)?;
        let mut state = self.state.write().unwrap();
        state
            .clients
            .entry(address.to_string())
            .or_insert_with(|| Arc::clone(&client));
        Some(client)
    }

    /// All validator addresses, including our own.
    pub fn all_validators(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.validators.keys().cloned().collect();
        addresses.push(self.local_node.address().clone());
        addresses
    }

    pub fn all_connected(&self) -> Vec<Address> {
        let state = self.state.read().unwrap();
        state
            .connected
            .iter()
            .filter(|(_, is_connected)| **is_connected)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    pub fn count_connected(&self) -> usize {
        let state = self.state.read().unwrap();
        Self::count_connected_locked(&state)
    }

    fn count_connected_locked(state: &ConnectionState) -> usize {
        state.connected.values().filter(|c| **c).count()
    }

    /// Hook invoked by the transport on connection state changes. Reserved;
    /// the default policy does nothing with it.
    pub fn connection_watcher(&self) {}

    /// Fan out to every currently connected validator. Ordering between
    /// destinations is not guaranteed; a slow peer only loses its own
    /// backlog.
    pub fn broadcast(&self, message: Message) {
        let connected = self.all_connected();
        for address in connected {
            if let Some(queue) = self.queues.get(&address) {
                queue.push(message.clone());
            }
        }
    }

    /// Returns true when the flag transitioned (or was seen first).
    fn set_connected(&self, validator: &Validator, connected: bool) -> bool {
        let mut state = self.state.write().unwrap();
        let old = state
            .connected
            .insert(validator.address.clone(), connected);

        let count = Self::count_connected_locked(&state);
        self.policy.write().unwrap().set_connected(count as u32);

        old.map(|was| was != connected).unwrap_or(true)
    }

    fn connecting_validator(&self, validator: Validator) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }

            let result = self.connect_validator(&validator);
            let changed = self.set_connected(&validator, result.is_ok());
            if changed {
                match &result {
                    Ok(()) => {
                        debug!(node = %self.local_node.alias(), validator = %validator.alias, "validator is connected")
                    }
                    Err(err) => {
                        debug!(node = %self.local_node.alias(), validator = %validator.alias, error = %err, "validator is disconnected")
                    }
                }
            }

            thread::sleep(LIVENESS_TICK);
        }
    }

    /// One probe: dial or reuse the client, exchange node descriptors, and
    /// insist the peer is who the validator table says it is.
    fn connect_validator(&self, validator: &Validator) -> Result<(), Error> {
        let client = self
            .get_connection(&validator.address)
            .ok_or_else(|| Error::NetworkProblem("no client for validator".into()))?;

        let raw = client.connect(&self.local_node)?;
        let descriptor = Validator::from_json(&raw)?;
        if descriptor.address != validator.address {
            return Err(Error::AddressMismatch);
        }

        Ok(())
    }

    fn broadcast_worker(&self, address: Address) {
        let queue = match self.queues.get(&address) {
            Some(queue) => Arc::clone(queue),
            None => return,
        };

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let Some(message) = queue.pop(Duration::from_millis(250)) else {
                continue;
            };

            let Some(client) = self.get_connection(&address) else {
                continue;
            };
            let result = match &message {
                Message::Transaction(tx) => client.send_message(tx),
                Message::Ballot(ballot) => client.send_ballot(ballot),
            };
            if let Err(err) = result {
                warn!(node = %self.local_node.alias(), validator = %address, error = %err, "broadcast send failed");
            }
        }
    }
}
