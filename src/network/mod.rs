// The transport seam. Consensus only sees these traits plus the typed
// `Message`; the memory and TCP transports live in the submodules.

pub mod http;
pub mod memory;

use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::Arc;

use crate::ballot::Ballot;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::node::LocalNode;
use crate::storage::Storage;
use crate::transaction::Transaction;

/// Everything that moves between validators. The discriminator string is the
/// wire-level message type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "transaction")]
    Transaction(Transaction),
    #[serde(rename = "ballot")]
    Ballot(Ballot),
}

pub trait NetworkClient: Send + Sync {
    /// Peer handshake: posts our node descriptor, returns the peer's
    /// Validator descriptor JSON.
    fn connect(&self, node: &LocalNode) -> Result<Vec<u8>, Error>;
    fn get_node_info(&self) -> Result<Vec<u8>, Error>;
    fn send_message(&self, transaction: &Transaction) -> Result<(), Error>;
    fn send_ballot(&self, ballot: &Ballot) -> Result<(), Error>;
}

pub trait Network: Send + Sync {
    fn endpoint(&self) -> Endpoint;
    fn set_local_node(&self, node: Arc<LocalNode>);
    /// Storage handle for the read-only `/api` routes; transports without an
    /// API surface ignore it.
    fn set_storage(&self, _storage: Arc<Storage>) {}
    /// Binds and starts serving. A bind failure is the caller's to handle.
    fn start(&self) -> Result<(), Error>;
    fn stop(&self);
    fn ready(&self);
    /// Self-probe: issues GetNodeInfo against our own endpoint with a 50 ms
    /// deadline.
    fn is_ready(&self) -> bool;
    /// The inbox. Taken once by the runner; a closed channel is the
    /// shutdown signal.
    fn take_receiver(&self) -> Option<mpsc::Receiver<Message>>;
    fn get_client(&self, endpoint: &Endpoint) -> Option<Arc<dyn NetworkClient>>;
}

pub const PROBLEM_ERROR_TYPE_PREFIX: &str = "https://boscoin.io/sebak/error/";
pub const PROBLEM_DEFAULT_TYPE: &str = "about:blank";

/// RFC 7807 problem document; the serialization of every error response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl Problem {
    pub fn from_error(err: &Error) -> Problem {
        Problem {
            problem_type: format!("{}{}", PROBLEM_ERROR_TYPE_PREFIX, err.code()),
            title: err.to_string(),
            status: Some(err.http_status()),
            detail: None,
            instance: None,
        }
    }

    pub fn from_status(status: u16, title: &str) -> Problem {
        Problem {
            problem_type: PROBLEM_DEFAULT_TYPE.to_string(),
            title: title.to_string(),
            status: Some(status),
            detail: None,
            instance: None,
        }
    }
}
