// The `LocalNode` is our node; a `Validator` is a remote node this
// `LocalNode` sees. There should be only one `LocalNode` per process.

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::common::{address_from_pubkey, Address};
use crate::endpoint::Endpoint;
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "BOOTING")]
    Booting,
    #[serde(rename = "SYNC")]
    Sync,
    #[serde(rename = "CONSENSUS")]
    Consensus,
    #[serde(rename = "TERMINATING")]
    Terminating,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub endpoint: Endpoint,
    pub alias: String,
}

impl Validator {
    pub fn new(address: Address, endpoint: Endpoint, alias: &str) -> Validator {
        let alias = if alias.is_empty() {
            make_alias(&address)
        } else {
            alias.to_string()
        };
        Validator {
            address,
            endpoint,
            alias,
        }
    }

    pub fn from_json(raw: &[u8]) -> Result<Validator, Error> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::MessageNotWellFormed(format!("validator: {}", e)))
    }
}

struct NodeInner {
    state: NodeState,
    publish_endpoint: Option<Endpoint>,
    validators: HashMap<Address, Validator>,
}

pub struct LocalNode {
    keypair: Arc<Keypair>,
    address: Address,
    alias: String,
    bind_endpoint: Endpoint,
    inner: Mutex<NodeInner>,
}

impl LocalNode {
    pub fn new(keypair: Keypair, bind_endpoint: Endpoint, alias: &str) -> LocalNode {
        let address = address_from_pubkey(&keypair.public);
        let alias = if alias.is_empty() {
            make_alias(&address)
        } else {
            alias.to_string()
        };

        LocalNode {
            keypair: Arc::new(keypair),
            address,
            alias,
            bind_endpoint,
            inner: Mutex::new(NodeInner {
                state: NodeState::None,
                publish_endpoint: None,
                validators: HashMap::new(),
            }),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn keypair(&self) -> Arc<Keypair> {
        Arc::clone(&self.keypair)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.bind_endpoint
    }

    pub fn publish_endpoint(&self) -> Option<Endpoint> {
        self.inner.lock().unwrap().publish_endpoint.clone()
    }

    pub fn set_publish_endpoint(&self, endpoint: Endpoint) {
        self.inner.lock().unwrap().publish_endpoint = Some(endpoint);
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().unwrap().state
    }

    pub fn set_booting(&self) {
        self.inner.lock().unwrap().state = NodeState::Booting;
    }

    pub fn set_sync(&self) {
        self.inner.lock().unwrap().state = NodeState::Sync;
    }

    pub fn set_consensus(&self) {
        self.inner.lock().unwrap().state = NodeState::Consensus;
    }

    pub fn set_terminating(&self) {
        self.inner.lock().unwrap().state = NodeState::Terminating;
    }

    pub fn has_validator(&self, address: &str) -> bool {
        self.inner.lock().unwrap().validators.contains_key(address)
    }

    pub fn validators(&self) -> HashMap<Address, Validator> {
        self.inner.lock().unwrap().validators.clone()
    }

    /// Registers validators; the node's own address is never its own
    /// validator and is silently skipped.
    pub fn add_validators(&self, validators: &[Validator]) {
        let mut inner = self.inner.lock().unwrap();
        for v in validators {
            if v.address == self.address {
                continue;
            }
            inner.validators.insert(v.address.clone(), v.clone());
        }
    }

    pub fn as_validator(&self) -> Validator {
        Validator::new(self.address.clone(), self.bind_endpoint.clone(), &self.alias)
    }

    /// Node-info payload served on `GetNodeInfo`.
    pub fn serialize(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let info = json!({
            "address": self.address,
            "alias": self.alias,
            "endpoint": self.bind_endpoint.to_string(),
            "state": inner.state,
            "validators": inner.validators,
        });
        serde_json::to_vec(&info).expect("node info encoding")
    }
}

impl fmt::Display for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.alias)
    }
}

pub fn make_alias(address: &str) -> String {
    if address.len() < 8 {
        return address.to_string();
    }
    let l = address.len();
    format!("{}.{}", &address[..4], &address[l - 8..l - 4])
}
