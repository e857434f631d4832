// End-to-end consensus over the in-process transport: every validator runs
// a full node runner and ballots flow through the real pipelines.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use sebak::amount::{Amount, BASE_RESERVE, ONE_COIN};
use sebak::ballot::{BallotState, VotingHole};
use sebak::block::{make_genesis_block, Block, BlockAccount, BlockTransaction};
use sebak::checker::{CheckerFunc, DeferFunc};
use sebak::common::{address_from_pubkey, keypair_from_seed, Address};
use sebak::network::memory::{MemoryHub, MemoryNetwork};
use sebak::network::{Network, NetworkClient};
use sebak::node::{LocalNode, Validator};
use sebak::observer::BlockObserver;
use sebak::runner::checker_ballot::{
    check_broadcast, check_is_new, check_is_wellformed, check_receive_ballot, check_store,
    default_ballot_checker_funcs, BallotContext,
};
use sebak::runner::NodeRunner;
use sebak::storage::Storage;
use sebak::transaction::{Operation, Transaction};
use sebak::voting::{VotingStateStaging, VotingThresholdPolicy};

const NETWORK_ID: &[u8] = b"sebak-test-network";

struct TestNode {
    runner: Arc<NodeRunner>,
    network: Arc<MemoryNetwork>,
}

fn genesis_keypair() -> ed25519_dalek::Keypair {
    keypair_from_seed([99u8; 32])
}

fn create_node_runners(count: usize, threshold: u32) -> Vec<TestNode> {
    let hub = MemoryHub::new();
    let networks: Vec<_> = (0..count).map(|_| MemoryNetwork::new(&hub)).collect();
    let keypairs: Vec<_> = (0..count)
        .map(|i| keypair_from_seed([i as u8 + 1; 32]))
        .collect();

    let validators: Vec<Validator> = keypairs
        .iter()
        .zip(&networks)
        .map(|(kp, net)| Validator::new(address_from_pubkey(&kp.public), net.endpoint(), ""))
        .collect();

    let genesis_kp = genesis_keypair();
    let genesis_address = address_from_pubkey(&genesis_kp.public);

    let mut nodes = Vec::with_capacity(count);
    for (kp, network) in keypairs.into_iter().zip(networks) {
        let local_node = Arc::new(LocalNode::new(kp, network.endpoint(), ""));
        local_node.add_validators(&validators);

        let storage = Arc::new(Storage::new());
        let observer = Arc::new(BlockObserver::new());
        let account = BlockAccount::new(genesis_address.clone(), Amount(100 * ONE_COIN.value()));
        account.save(&storage).unwrap();
        make_genesis_block(&storage, &observer, &account, &genesis_kp, NETWORK_ID).unwrap();

        let policy = Arc::new(RwLock::new(VotingThresholdPolicy::new(
            count as u32,
            threshold,
        )));
        let runner = NodeRunner::new(
            local_node,
            network.clone(),
            policy,
            storage,
            observer,
            NETWORK_ID,
        );
        nodes.push(TestNode { runner, network });
    }

    nodes
}

fn start_nodes(nodes: &[TestNode]) {
    for node in nodes {
        let runner = Arc::clone(&node.runner);
        thread::spawn(move || {
            let _ = runner.start();
        });
    }
}

fn wait_until_connected(nodes: &[TestNode], timeout: Duration) {
    let expected = nodes.len() - 1;
    let start = Instant::now();
    loop {
        let all_connected = nodes
            .iter()
            .all(|n| n.runner.connection_manager().count_connected() == expected);
        if all_connected {
            return;
        }
        if start.elapsed() > timeout {
            panic!("timeout waiting for validators to connect");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn stop_nodes(nodes: Vec<TestNode>) {
    for node in &nodes {
        node.runner.stop();
    }
}

fn make_transaction(sequence_id: u64) -> Transaction {
    let genesis_kp = genesis_keypair();
    let target_kp = keypair_from_seed([98u8; 32]);
    let mut tx = Transaction::new(
        address_from_pubkey(&genesis_kp.public),
        sequence_id,
        vec![Operation::CreateAccount {
            target: address_from_pubkey(&target_kp.public),
            amount: BASE_RESERVE,
        }],
    );
    tx.sign(&genesis_kp, NETWORK_ID);
    tx
}

// All the validators get consensus: the ballot walks INIT -> SIGN -> ACCEPT
// and every node commits the same transaction at height 2.
#[test]
fn consensus_reached_with_ten_validators() {
    let count = 10;
    let nodes = create_node_runners(count, 66);

    let confirmed: Arc<Mutex<Vec<(Address, VotingStateStaging)>>> =
        Arc::new(Mutex::new(Vec::new()));
    for node in &nodes {
        let confirmed = Arc::clone(&confirmed);
        let address = node.runner.local_node().address().clone();
        let defer: DeferFunc<BallotContext> = Arc::new(move |_, _, ctx, err| {
            let Some(err) = err else { return };
            if !err.is_stop() {
                return;
            }
            if let Some(staging) = &ctx.staging {
                if staging.state == BallotState::AllConfirm {
                    confirmed
                        .lock()
                        .unwrap()
                        .push((address.clone(), staging.clone()));
                }
            }
        });
        node.runner
            .set_handle_ballot_checker_funcs(Some(defer), default_ballot_checker_funcs());
    }

    start_nodes(&nodes);
    wait_until_connected(&nodes, Duration::from_secs(15));

    let manager = nodes[0].runner.connection_manager();
    assert_eq!(manager.all_validators().len(), count);
    assert_eq!(manager.all_connected().len(), count - 1);

    let tx = make_transaction(0);
    let client = nodes[0]
        .network
        .get_client(&nodes[0].network.endpoint())
        .unwrap();
    client.send_message(&tx).unwrap();

    let start = Instant::now();
    loop {
        let blocks_done = nodes
            .iter()
            .all(|n| Block::get_by_height(n.runner.storage(), 2).is_ok());
        let all_confirmed = confirmed.lock().unwrap().len() >= count;
        if blocks_done && all_confirmed {
            break;
        }
        if start.elapsed() > Duration::from_secs(30) {
            panic!(
                "timeout waiting for consensus: {} nodes confirmed",
                confirmed.lock().unwrap().len()
            );
        }
        thread::sleep(Duration::from_millis(50));
    }

    for node in &nodes {
        let storage = node.runner.storage();
        let block = Block::get_by_height(storage, 2).unwrap();
        assert_eq!(block.transactions[0], tx.hash());
        assert!(BlockTransaction::exists(storage, &tx.hash()));

        // The transaction was applied against the pre-block account state.
        let genesis_address = address_from_pubkey(&genesis_keypair().public);
        let source = BlockAccount::get(storage, &genesis_address).unwrap();
        assert_eq!(source.sequence_id, 1);
        let target_address = address_from_pubkey(&keypair_from_seed([98u8; 32]).public);
        let created = BlockAccount::get(storage, &target_address).unwrap();
        assert_eq!(created.balance, BASE_RESERVE);

        // Committed transactions leave the pending pool.
        assert!(node.runner.pending_transaction(&tx.hash()).is_none());
    }

    for (_, staging) in confirmed.lock().unwrap().iter() {
        assert_eq!(staging.state, BallotState::AllConfirm);
        assert_eq!(staging.voting_hole, VotingHole::Yes);
        assert!(staging.is_closed());
    }

    stop_nodes(nodes);
}

// Consensus is denied when NO reaches the threshold: with the INIT
// threshold at 100 percent and two of three validators voting NO, every
// tally closes at INIT and no block is produced.
#[test]
fn consensus_denied_by_no_votes() {
    let count = 3;
    let nodes = create_node_runners(count, 66);
    for node in &nodes {
        node.runner
            .policy()
            .write()
            .unwrap()
            .reset(BallotState::Init, 100);
    }

    let say_no: HashSet<Address> = nodes[1..]
        .iter()
        .map(|n| n.runner.local_node().address().clone())
        .collect();

    let closed: Arc<Mutex<Vec<(Address, VotingStateStaging)>>> = Arc::new(Mutex::new(Vec::new()));
    for node in &nodes {
        let say_no = say_no.clone();
        let manipulate: CheckerFunc<NodeRunner, BallotContext> = Arc::new(move |runner, mut ctx| {
            if !say_no.contains(runner.local_node().address()) {
                return Ok(ctx);
            }
            if ctx.ballot.state() != BallotState::Init {
                return Ok(ctx);
            }
            ctx.ballot.vote(VotingHole::No);
            ctx.ballot
                .sign(&runner.local_node().keypair(), runner.network_id());
            Ok(ctx)
        });

        let closed = Arc::clone(&closed);
        let address = node.runner.local_node().address().clone();
        let defer: DeferFunc<BallotContext> = Arc::new(move |_, _, ctx, err| {
            let Some(err) = err else { return };
            if !err.is_stop() {
                return;
            }
            if let Some(staging) = &ctx.staging {
                if staging.is_closed() && staging.voting_hole == VotingHole::No {
                    closed
                        .lock()
                        .unwrap()
                        .push((address.clone(), staging.clone()));
                }
            }
        });

        node.runner.set_handle_ballot_checker_funcs(
            Some(defer),
            vec![
                ("is_wellformed", Arc::new(check_is_wellformed)),
                ("check_is_new", Arc::new(check_is_new)),
                ("receive_ballot", Arc::new(check_receive_ballot)),
                ("say_no", manipulate),
                ("store", Arc::new(check_store)),
                ("broadcast", Arc::new(check_broadcast)),
            ],
        );
    }

    start_nodes(&nodes);
    wait_until_connected(&nodes, Duration::from_secs(15));

    let tx = make_transaction(0);
    let client = nodes[0]
        .network
        .get_client(&nodes[0].network.endpoint())
        .unwrap();
    client.send_message(&tx).unwrap();

    let start = Instant::now();
    loop {
        if closed.lock().unwrap().len() >= count {
            break;
        }
        if start.elapsed() > Duration::from_secs(30) {
            panic!(
                "timeout waiting for NO close: {} nodes closed",
                closed.lock().unwrap().len()
            );
        }
        thread::sleep(Duration::from_millis(50));
    }

    for (_, staging) in closed.lock().unwrap().iter() {
        assert_eq!(staging.state, BallotState::Init);
        assert_eq!(staging.voting_hole, VotingHole::No);
        assert!(staging.is_closed());
    }
    for node in &nodes {
        assert!(Block::get_by_height(node.runner.storage(), 2).is_err());
    }

    stop_nodes(nodes);
}
