// Blocks, accounts, and their persistence keys. A block save writes three
// records: hash -> block, confirmed-index -> hash, height-index -> hash. The
// height key is zero-padded so lexicographic order is height order.

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;
use crate::ballot::Ballot;
use crate::common::{
    hash_to_hex, make_object_hash, Address, Hash, GENESIS_BLOCK_CONFIRMED_TIME, ZERO_HASH,
};
use crate::error::Error;
use crate::observer::{BlockObserver, EVENT_BLOCK_SAVED};
use crate::round::Round;
use crate::storage::{Batch, Storage};
use crate::transaction::{Operation, Transaction};

const MAX_BLOCK_HEIGHT_STRING_LENGTH: usize = 20;

pub fn block_key(hash: &Hash) -> String {
    format!("block/hash/{}", hash_to_hex(hash))
}

pub fn block_key_prefix_height(height: u64) -> String {
    format!("block/height/{:0width$}", height, width = MAX_BLOCK_HEIGHT_STRING_LENGTH)
}

pub fn account_key(address: &str) -> String {
    format!("account/{}", address)
}

pub fn block_transaction_key(hash: &Hash) -> String {
    format!("transaction/{}", hash_to_hex(hash))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_block_hash: Hash,
    pub transactions_root: Hash,
    pub total_txs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: BlockHeader,
    pub transactions: Vec<Hash>,
    pub hash: Hash,
    pub confirmed: String,
    pub proposer: Address,
    pub round: Round,
}

impl Block {
    pub fn new(
        proposer: Address,
        round: Round,
        transactions: Vec<Hash>,
        confirmed: String,
    ) -> Block {
        let header = BlockHeader {
            height: round.block_height + 1,
            prev_block_hash: round.prev_block_hash,
            transactions_root: make_object_hash(&transactions),
            total_txs: round.total_txs + transactions.len() as u64,
        };
        let mut block = Block {
            header,
            transactions,
            hash: ZERO_HASH,
            confirmed,
            proposer,
            round,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn from_ballot(ballot: &Ballot) -> Block {
        Block::new(
            ballot.body.proposer.clone(),
            ballot.body.round.clone(),
            ballot.body.transactions.clone(),
            ballot.body.proposer_confirmed.clone(),
        )
    }

    /// Object hash of the block with its own hash field zeroed.
    pub fn compute_hash(&self) -> Hash {
        let mut shadow = self.clone();
        shadow.hash = ZERO_HASH;
        make_object_hash(&shadow)
    }

    fn confirmed_index_key(&self) -> String {
        format!(
            "block/confirmed/{}-{:016x}-{}",
            self.confirmed,
            self.header.height,
            Uuid::new_v4()
        )
    }

    /// Stages the three block records; `BlockAlreadyExists` when the hash
    /// key is already present.
    pub fn save(&self, batch: &mut Batch<'_>) -> Result<(), Error> {
        let key = block_key(&self.hash);
        if batch.has(&key) {
            return Err(Error::BlockAlreadyExists);
        }
        batch.new_record(&key, self)?;
        batch.new_record(&self.confirmed_index_key(), &self.hash)?;
        batch.new_record(&block_key_prefix_height(self.header.height), &self.hash)?;
        Ok(())
    }

    pub fn get(storage: &Storage, hash: &Hash) -> Result<Block, Error> {
        storage.get(&block_key(hash)).map_err(|e| match e {
            Error::StorageRecordDoesNotExist => Error::BlockNotFound,
            other => other,
        })
    }

    pub fn exists_by_height(storage: &Storage, height: u64) -> bool {
        storage.has(&block_key_prefix_height(height))
    }

    pub fn get_by_height(storage: &Storage, height: u64) -> Result<Block, Error> {
        let hash: Hash = storage
            .get(&block_key_prefix_height(height))
            .map_err(|_| Error::BlockNotFound)?;
        Block::get(storage, &hash)
    }

    pub fn get_latest(storage: &Storage) -> Result<Block, Error> {
        let (_, raw) = storage
            .last_with_prefix("block/height/")
            .ok_or(Error::BlockNotFound)?;
        let hash: Hash = serde_json::from_slice(&raw)
            .map_err(|e| Error::MessageNotWellFormed(format!("storage: {}", e)))?;
        Block::get(storage, &hash)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAccount {
    pub address: Address,
    pub balance: Amount,
    pub sequence_id: u64,
}

impl BlockAccount {
    pub fn new(address: Address, balance: Amount) -> BlockAccount {
        BlockAccount {
            address,
            balance,
            sequence_id: 0,
        }
    }

    pub fn save(&self, storage: &Storage) -> Result<(), Error> {
        storage.set(&account_key(&self.address), self)
    }

    pub fn save_in(&self, batch: &mut Batch<'_>) -> Result<(), Error> {
        batch.set(&account_key(&self.address), self)
    }

    pub fn get(storage: &Storage, address: &str) -> Result<BlockAccount, Error> {
        storage.get(&account_key(address)).map_err(|e| match e {
            Error::StorageRecordDoesNotExist => Error::BlockAccountDoesNotExists,
            other => other,
        })
    }

    pub fn get_in(batch: &Batch<'_>, address: &str) -> Result<BlockAccount, Error> {
        batch.get(&account_key(address)).map_err(|e| match e {
            Error::StorageRecordDoesNotExist => Error::BlockAccountDoesNotExists,
            other => other,
        })
    }

    pub fn exists(storage: &Storage, address: &str) -> bool {
        storage.has(&account_key(address))
    }
}

/// A transaction as committed inside one block; written exactly once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransaction {
    pub hash: Hash,
    pub block: Hash,
    pub height: u64,
    pub confirmed: String,
    pub transaction: Transaction,
}

impl BlockTransaction {
    pub fn from_transaction(block: &Block, transaction: Transaction) -> BlockTransaction {
        BlockTransaction {
            hash: transaction.hash(),
            block: block.hash,
            height: block.header.height,
            confirmed: block.confirmed.clone(),
            transaction,
        }
    }

    pub fn save(&self, batch: &mut Batch<'_>) -> Result<(), Error> {
        batch.new_record(&block_transaction_key(&self.hash), self)
    }

    pub fn get(storage: &Storage, hash: &Hash) -> Result<BlockTransaction, Error> {
        storage.get(&block_transaction_key(hash))
    }

    pub fn exists(storage: &Storage, hash: &Hash) -> bool {
        storage.has(&block_transaction_key(hash))
    }
}

/// Creates the genesis block: empty proposer, empty round, fixed confirmed
/// time, and a single zero-fee CreateAccount whose source equals its target.
/// Idempotent: a present block at height 1 yields `BlockAlreadyExists`.
pub fn make_genesis_block(
    storage: &Storage,
    observer: &BlockObserver,
    account: &BlockAccount,
    keypair: &Keypair,
    network_id: &[u8],
) -> Result<Block, Error> {
    if Block::exists_by_height(storage, 1) {
        return Err(Error::BlockAlreadyExists);
    }

    let operation = Operation::CreateAccount {
        target: account.address.clone(),
        amount: account.balance,
    };
    let mut tx = Transaction::with_fee(
        account.address.clone(),
        Amount::ZERO,
        account.sequence_id,
        vec![operation],
    );
    tx.header.created = GENESIS_BLOCK_CONFIRMED_TIME.to_string();
    tx.sign(keypair, network_id);

    let block = Block::new(
        String::new(),
        Round::default(),
        vec![tx.hash()],
        GENESIS_BLOCK_CONFIRMED_TIME.to_string(),
    );

    let mut batch = storage.batch();
    block.save(&mut batch)?;
    BlockTransaction::from_transaction(&block, tx).save(&mut batch)?;
    batch.commit()?;

    observer.trigger(EVENT_BLOCK_SAVED, &block);
    Ok(block)
}
