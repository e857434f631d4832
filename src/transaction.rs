// Transactions and their operations. The body hash is the canonical object
// hash; the signature covers `network_id ∥ hash` and is made by the source.

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::amount::{Amount, BASE_FEE};
use crate::common::{
    make_object_hash, now_iso8601, parse_address, sign_hash, verify_hash_signature, Address,
    Hash, MAX_OPERATIONS_IN_TRANSACTION,
};
use crate::error::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "create-account")]
    CreateAccount { target: Address, amount: Amount },
    #[serde(rename = "payment")]
    Payment { target: Address, amount: Amount },
}

impl Operation {
    pub fn target(&self) -> &Address {
        match self {
            Operation::CreateAccount { target, .. } => target,
            Operation::Payment { target, .. } => target,
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            Operation::CreateAccount { amount, .. } => *amount,
            Operation::Payment { amount, .. } => *amount,
        }
    }

    pub fn is_well_formed(&self) -> Result<(), Error> {
        parse_address(self.target())?;
        if self.amount() < Amount(1) {
            return Err(Error::OperationAmountUnderflow);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub created: String,
    pub hash: Hash,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBody {
    pub source: Address,
    pub fee: Amount,
    pub sequence_id: u64,
    pub operations: Vec<Operation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub header: TransactionHeader,
    pub body: TransactionBody,
}

impl Transaction {
    pub fn new(source: Address, sequence_id: u64, operations: Vec<Operation>) -> Transaction {
        Self::with_fee(source, BASE_FEE, sequence_id, operations)
    }

    pub fn with_fee(
        source: Address,
        fee: Amount,
        sequence_id: u64,
        operations: Vec<Operation>,
    ) -> Transaction {
        let body = TransactionBody {
            source,
            fee,
            sequence_id,
            operations,
        };
        Transaction {
            header: TransactionHeader {
                created: now_iso8601(),
                hash: make_object_hash(&body),
                signature: String::new(),
            },
            body,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    /// Recomputes the body hash; call after mutating the body in tests.
    pub fn update_hash(&mut self) {
        self.header.hash = make_object_hash(&self.body);
    }

    pub fn sign(&mut self, keypair: &Keypair, network_id: &[u8]) {
        self.update_hash();
        self.header.signature = sign_hash(keypair, network_id, &self.header.hash);
    }

    /// Total of all operation amounts; with `with_fee`, the fee is charged
    /// once per operation on top.
    pub fn total_amount(&self, with_fee: bool) -> Result<Amount, Error> {
        let mut total = Amount::ZERO;
        for op in &self.body.operations {
            total = total.add(op.amount())?;
        }
        if with_fee {
            total = total.add(self.body.fee.mult(self.body.operations.len())?)?;
        }
        Ok(total)
    }

    /// Context-free validity: everything checkable without account state.
    pub fn is_well_formed(&self, network_id: &[u8]) -> Result<(), Error> {
        if self.header.hash != make_object_hash(&self.body) {
            return Err(Error::HashDoesNotMatch);
        }
        parse_address(&self.body.source)?;
        if self.body.operations.is_empty() {
            return Err(Error::TransactionEmptyOperations);
        }
        if self.body.operations.len() > MAX_OPERATIONS_IN_TRANSACTION {
            return Err(Error::TransactionTooManyOperations);
        }
        for op in &self.body.operations {
            op.is_well_formed()?;
        }
        if self.body.fee < BASE_FEE {
            return Err(Error::InvalidFee);
        }
        verify_hash_signature(
            &self.body.source,
            network_id,
            &self.header.hash,
            &self.header.signature,
        )
    }
}
