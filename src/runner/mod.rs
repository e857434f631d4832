// The node runner owns every consensus-facing component and fans incoming
// network messages into the checker pipelines.

pub mod checker_ballot;
pub mod checker_transaction;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ballot::{Ballot, VotingHole};
use crate::block::{account_key, Block, BlockAccount, BlockTransaction};
use crate::checker::{Checker, CheckerFunc, DeferFunc};
use crate::common::Hash;
use crate::connection_manager::ValidatorConnectionManager;
use crate::error::Error;
use crate::network::{Message, Network};
use crate::node::LocalNode;
use crate::observer::{BlockObserver, EVENT_BLOCK_SAVED};
use crate::round::Round;
use crate::runner::checker_ballot::{default_ballot_checker_funcs, BallotContext};
use crate::runner::checker_transaction::validate_tx;
use crate::storage::{Batch, Storage};
use crate::transaction::{Operation, Transaction};
use crate::voting::{VotingResult, VotingThresholdPolicy};

/// An open tally with no progress for this long is closed as timed out.
const VOTING_RESULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct NodeRunner {
    local_node: Arc<LocalNode>,
    network: Arc<dyn Network>,
    connection_manager: Arc<ValidatorConnectionManager>,
    policy: Arc<RwLock<VotingThresholdPolicy>>,
    storage: Arc<Storage>,
    observer: Arc<BlockObserver>,
    network_id: Vec<u8>,
    voting: Mutex<HashMap<Hash, Arc<Mutex<VotingResult>>>>,
    terminated: Mutex<HashSet<Hash>>,
    pending: Mutex<HashMap<Hash, Transaction>>,
    ballot_checker: RwLock<Arc<Checker<NodeRunner, BallotContext>>>,
    shutdown: AtomicBool,
}

impl NodeRunner {
    pub fn new(
        local_node: Arc<LocalNode>,
        network: Arc<dyn Network>,
        policy: Arc<RwLock<VotingThresholdPolicy>>,
        storage: Arc<Storage>,
        observer: Arc<BlockObserver>,
        network_id: &[u8],
    ) -> Arc<NodeRunner> {
        network.set_local_node(Arc::clone(&local_node));
        network.set_storage(Arc::clone(&storage));

        let connection_manager = ValidatorConnectionManager::new(
            Arc::clone(&local_node),
            Arc::clone(&network),
            Arc::clone(&policy),
            local_node.validators(),
        );

        let mut builder = Checker::builder();
        for (name, func) in default_ballot_checker_funcs() {
            builder = builder.add(name, func);
        }

        Arc::new(NodeRunner {
            local_node,
            network,
            connection_manager,
            policy,
            storage,
            observer,
            network_id: network_id.to_vec(),
            voting: Mutex::new(HashMap::new()),
            terminated: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            ballot_checker: RwLock::new(Arc::new(builder.build())),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local_node
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub fn connection_manager(&self) -> &Arc<ValidatorConnectionManager> {
        &self.connection_manager
    }

    pub fn policy(&self) -> &Arc<RwLock<VotingThresholdPolicy>> {
        &self.policy
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn observer(&self) -> &Arc<BlockObserver> {
        &self.observer
    }

    pub fn network_id(&self) -> &[u8] {
        &self.network_id
    }

    /// Test seam: replaces the ballot chain wholesale.
    pub fn set_handle_ballot_checker_funcs(
        &self,
        defer_func: Option<DeferFunc<BallotContext>>,
        funcs: Vec<(&'static str, CheckerFunc<NodeRunner, BallotContext>)>,
    ) {
        let mut builder = Checker::builder();
        for (name, func) in funcs {
            builder = builder.add(name, func);
        }
        if let Some(defer_func) = defer_func {
            builder = builder.defer_func(defer_func);
        }
        *self.ballot_checker.write().unwrap() = Arc::new(builder.build());
    }

    /// Opens the listener, marks the node ready, starts the connection
    /// manager, and drains the inbox. A closed channel is the shutdown
    /// signal.
    pub fn start(self: Arc<Self>) -> Result<(), Error> {
        let receiver = self
            .network
            .take_receiver()
            .ok_or_else(|| Error::NetworkProblem("network receiver already taken".into()))?;

        self.local_node.set_booting();
        self.network.start()?;
        self.network.ready();
        Arc::clone(&self.connection_manager).start();
        self.local_node.set_consensus();
        info!(node = %self.local_node.alias(), endpoint = %self.network.endpoint(), "node runner started");

        let janitor = Arc::clone(&self);
        thread::spawn(move || janitor.voting_janitor());

        while let Ok(message) = receiver.recv() {
            self.handle_message(message);
        }

        debug!(node = %self.local_node.alias(), "receive channel closed, runner exits");
        Ok(())
    }

    pub fn stop(&self) {
        self.local_node.set_terminating();
        self.shutdown.store(true, Ordering::Relaxed);
        self.connection_manager.stop();
        self.network.stop();
    }

    /// Background sweep: superseded proposal windows are dropped and tallies
    /// that made no progress within the round timeout are closed.
    fn voting_janitor(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            if let Ok(latest) = Block::get_latest(&self.storage) {
                self.expire_stale_results(latest.header.height);
            }
            self.expire_timed_out_results(VOTING_RESULT_TIMEOUT);
            thread::sleep(Duration::from_secs(1));
        }
    }

    /// Dispatch by wire type. Pipeline errors are logged, never fatal.
    pub fn handle_message(&self, message: Message) {
        let outcome = match message {
            Message::Transaction(tx) => self.handle_transaction(tx),
            Message::Ballot(ballot) => self.handle_ballot(ballot),
        };
        if let Err(err) = outcome {
            warn!(node = %self.local_node.alias(), error = %err, "message handling failed");
        }
    }

    /// An accepted transaction is pooled, re-broadcast, and proposed as a
    /// new ballot in this node's own name.
    pub fn handle_transaction(&self, transaction: Transaction) -> Result<(), Error> {
        let hash = transaction.hash();
        {
            let pending = self.pending.lock().unwrap();
            if pending.contains_key(&hash) {
                return Ok(());
            }
        }

        transaction.is_well_formed(&self.network_id)?;
        validate_tx(&self.storage, &self.network_id, &transaction)?;

        self.pending
            .lock()
            .unwrap()
            .insert(hash, transaction.clone());
        self.connection_manager
            .broadcast(Message::Transaction(transaction));

        let latest = Block::get_latest(&self.storage)?;
        let round = Round::new(
            latest.header.height,
            0,
            latest.hash,
            latest.header.total_txs,
        );
        let mut ballot = Ballot::new(self.local_node.address().clone(), round, vec![hash]);
        ballot.sign(&self.local_node.keypair(), &self.network_id);

        self.handle_ballot(ballot)
    }

    pub fn handle_ballot(&self, ballot: Ballot) -> Result<(), Error> {
        let checker = Arc::clone(&self.ballot_checker.read().unwrap());
        let ctx = BallotContext::new(ballot);
        let (_, outcome) = checker.run(self, ctx);

        // Tallies for proposal windows a committed block has superseded are
        // garbage; collect them outside the pipeline's locks.
        if let Ok(latest) = Block::get_latest(&self.storage) {
            self.expire_stale_results(latest.header.height);
        }

        outcome
    }

    pub fn pending_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.pending.lock().unwrap().get(hash).cloned()
    }

    pub fn voting_result(&self, message_hash: &Hash) -> Option<Arc<Mutex<VotingResult>>> {
        self.voting.lock().unwrap().get(message_hash).cloned()
    }

    pub fn get_or_create_voting_result(&self, ballot: &Ballot) -> Arc<Mutex<VotingResult>> {
        let mut voting = self.voting.lock().unwrap();
        Arc::clone(
            voting
                .entry(ballot.message_hash())
                .or_insert_with(|| Arc::new(Mutex::new(VotingResult::new(ballot.clone())))),
        )
    }

    pub fn is_terminated(&self, message_hash: &Hash) -> bool {
        self.terminated.lock().unwrap().contains(message_hash)
    }

    /// Terminal outcome: the fingerprint is remembered and the live tally
    /// dropped.
    pub fn mark_terminated(&self, message_hash: &Hash) {
        self.terminated.lock().unwrap().insert(*message_hash);
        self.voting.lock().unwrap().remove(message_hash);
    }

    /// This node's vote on a proposal's transaction set: NotYet until every
    /// body is known, No when validation fails, Yes otherwise.
    pub fn decide_vote(&self, transactions: &[Hash]) -> VotingHole {
        let pending = self.pending.lock().unwrap();
        for hash in transactions {
            match pending.get(hash) {
                None => return VotingHole::NotYet,
                Some(tx) => {
                    if validate_tx(&self.storage, &self.network_id, tx).is_err() {
                        return VotingHole::No;
                    }
                }
            }
        }
        VotingHole::Yes
    }

    /// Persists the confirmed block: applies every transaction and writes
    /// the block records in one batch, then notifies observers.
    pub fn commit_block(&self, result: &VotingResult) -> Result<Block, Error> {
        let ballot = &result.ballot;
        let block = Block::from_ballot(ballot);

        {
            let pending = self.pending.lock().unwrap();
            let mut batch = self.storage.batch();
            for hash in &ballot.body.transactions {
                let tx = pending
                    .get(hash)
                    .cloned()
                    .ok_or(Error::TransactionNotFound)?;
                apply_transaction(&mut batch, &tx)?;
                BlockTransaction::from_transaction(&block, tx).save(&mut batch)?;
            }
            block.save(&mut batch)?;
            batch.commit()?;
        }

        self.observer.trigger(EVENT_BLOCK_SAVED, &block);
        info!(
            node = %self.local_node.alias(),
            height = block.header.height,
            "block confirmed"
        );

        {
            let mut pending = self.pending.lock().unwrap();
            for hash in &ballot.body.transactions {
                pending.remove(hash);
            }
        }

        Ok(block)
    }

    /// Drops voting results whose proposal window has been superseded by a
    /// committed block.
    pub fn expire_stale_results(&self, latest_height: u64) {
        let mut voting = self.voting.lock().unwrap();
        voting.retain(|_, result| {
            // A tally locked by an in-flight pipeline is live by definition;
            // skip it and let a later pass collect it.
            match result.try_lock() {
                Ok(result) => result.ballot.body.round.block_height >= latest_height,
                Err(_) => true,
            }
        });
    }

    /// Closes tallies older than `timeout` as timed out; the fingerprint
    /// stays terminal so late ballots are dropped quietly.
    pub fn expire_timed_out_results(&self, timeout: Duration) {
        let mut timed_out = Vec::new();
        {
            let mut voting = self.voting.lock().unwrap();
            voting.retain(|hash, result| match result.try_lock() {
                Ok(result) if result.age() > timeout => {
                    timed_out.push(*hash);
                    false
                }
                _ => true,
            });
        }
        let mut terminated = self.terminated.lock().unwrap();
        for hash in timed_out {
            debug!(node = %self.local_node.alias(), "voting result timed out");
            terminated.insert(hash);
        }
    }
}

/// Applies one transaction's account mutations into the batch: the source
/// pays the total plus per-operation fees and bumps its sequence id by one;
/// targets receive or come into existence.
fn apply_transaction(batch: &mut Batch<'_>, tx: &Transaction) -> Result<(), Error> {
    let mut source = BlockAccount::get_in(batch, &tx.body.source)?;
    source.balance = source.balance.sub(tx.total_amount(true)?)?;
    source.sequence_id += 1;
    source.save_in(batch)?;

    for op in &tx.body.operations {
        match op {
            Operation::Payment { target, amount } => {
                let mut account = BlockAccount::get_in(batch, target)?;
                account.balance = account.balance.add(*amount)?;
                account.save_in(batch)?;
            }
            Operation::CreateAccount { target, amount } => {
                if batch.has(&account_key(target)) {
                    return Err(Error::BlockAccountAlreadyExists);
                }
                BlockAccount::new(target.clone(), *amount).save_in(batch)?;
            }
        }
    }

    Ok(())
}
