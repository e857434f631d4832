// Ballots: one node's signed statement about a proposal in a specific round
// and phase. The proposal fingerprint (round + transaction set) is what keys
// the voting result; the ballot hash itself differs per sender.

use chrono::Utc;
use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::common::{
    address_from_pubkey, make_object_hash, now_iso8601, parse_iso8601, sign_hash,
    verify_hash_signature, Address, Hash, BALLOT_CONFIRMED_TIME_ALLOW_DURATION,
    MAX_TRANSACTIONS_IN_BALLOT,
};
use crate::error::Error;
use crate::round::Round;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BallotState {
    #[serde(rename = "INIT")]
    Init,
    #[serde(rename = "SIGN")]
    Sign,
    #[serde(rename = "ACCEPT")]
    Accept,
    #[serde(rename = "ALLCONFIRM")]
    AllConfirm,
    #[serde(rename = "NONE")]
    None,
}

impl BallotState {
    /// The phase a YES threshold advances into. `AllConfirm` is terminal.
    pub fn next(self) -> BallotState {
        match self {
            BallotState::Init => BallotState::Sign,
            BallotState::Sign => BallotState::Accept,
            BallotState::Accept => BallotState::AllConfirm,
            BallotState::AllConfirm | BallotState::None => BallotState::None,
        }
    }

    /// Phases that carry votes into a tally.
    pub fn is_voting_phase(self) -> bool {
        matches!(self, BallotState::Init | BallotState::Sign | BallotState::Accept)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingHole {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
    #[serde(rename = "NOTYET")]
    NotYet,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotHeader {
    pub hash: Hash,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotBody {
    pub source: Address,
    pub proposer: Address,
    pub round: Round,
    pub state: BallotState,
    pub voting_hole: VotingHole,
    pub transactions: Vec<Hash>,
    pub proposer_confirmed: String,
    pub confirmed: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub header: BallotHeader,
    pub body: BallotBody,
}

impl Ballot {
    /// A fresh INIT proposal in the proposer's own name.
    pub fn new(proposer: Address, round: Round, transactions: Vec<Hash>) -> Ballot {
        let proposer_confirmed = now_iso8601();
        let body = BallotBody {
            source: proposer.clone(),
            proposer,
            round,
            state: BallotState::Init,
            voting_hole: VotingHole::Yes,
            transactions,
            proposer_confirmed: proposer_confirmed.clone(),
            confirmed: proposer_confirmed,
        };
        Ballot {
            header: BallotHeader {
                hash: make_object_hash(&body),
                signature: String::new(),
            },
            body,
        }
    }

    /// This node's ballot about someone else's proposal: same round and
    /// transaction set, the given phase and vote, to be signed by the caller.
    pub fn derived(&self, state: BallotState, voting_hole: VotingHole) -> Ballot {
        let mut next = self.clone();
        next.body.state = state;
        next.body.voting_hole = voting_hole;
        next.header.signature = String::new();
        next
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    /// Proposal fingerprint: identical for every validator's ballot about
    /// the same (round, transactions) pair.
    pub fn message_hash(&self) -> Hash {
        make_object_hash(&(&self.body.round, &self.body.transactions))
    }

    pub fn state(&self) -> BallotState {
        self.body.state
    }

    pub fn vote(&mut self, voting_hole: VotingHole) {
        self.body.voting_hole = voting_hole;
    }

    /// Stamps the sender and confirmed time, recomputes the hash, signs.
    pub fn sign(&mut self, keypair: &Keypair, network_id: &[u8]) {
        self.body.source = address_from_pubkey(&keypair.public);
        self.body.confirmed = now_iso8601();
        self.header.hash = make_object_hash(&self.body);
        self.header.signature = sign_hash(keypair, network_id, &self.header.hash);
    }

    /// Context-free checks; the round-against-chain check lives in the
    /// ballot pipeline where storage is at hand.
    pub fn is_well_formed(&self, network_id: &[u8]) -> Result<(), Error> {
        if self.header.hash != make_object_hash(&self.body) {
            return Err(Error::HashDoesNotMatch);
        }
        if self.body.state == BallotState::None {
            return Err(Error::BallotNotWellFormed("state is NONE".into()));
        }
        if self.body.transactions.is_empty() {
            return Err(Error::BallotNotWellFormed("no transactions".into()));
        }
        if self.body.transactions.len() > MAX_TRANSACTIONS_IN_BALLOT {
            return Err(Error::BallotNotWellFormed("too many transactions".into()));
        }
        for confirmed in [&self.body.confirmed, &self.body.proposer_confirmed] {
            let at = parse_iso8601(confirmed)
                .map_err(|_| Error::BallotNotWellFormed("bad confirmed time".into()))?;
            let skew = (Utc::now() - at).num_seconds().unsigned_abs();
            if skew > BALLOT_CONFIRMED_TIME_ALLOW_DURATION.as_secs() {
                return Err(Error::BallotNotWellFormed("confirmed time out of range".into()));
            }
        }
        verify_hash_signature(
            &self.body.source,
            network_id,
            &self.header.hash,
            &self.header.signature,
        )
    }
}
