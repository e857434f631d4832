use std::env;
use std::fs;
use std::process;
use std::sync::{Arc, RwLock};

use sebak::amount::Amount;
use sebak::block::{make_genesis_block, BlockAccount};
use sebak::common::keypair_from_seed;
use sebak::config::NodeConfig;
use sebak::network::http::HttpNetwork;
use sebak::node::LocalNode;
use sebak::observer::BlockObserver;
use sebak::runner::NodeRunner;
use sebak::storage::Storage;
use sebak::voting::VotingThresholdPolicy;

fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let mut config_path: Option<String> = None;
    let mut key_hex: Option<String> = None;
    let mut key_file: Option<String> = None;
    let mut bind_override: Option<String> = None;
    let mut alias: Option<String> = None;
    let mut genesis: Option<String> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            "--key-hex" => key_hex = args.next(),
            "--key-file" => key_file = args.next(),
            "--bind" => bind_override = args.next(),
            "--alias" => alias = args.next(),
            "--genesis" => genesis = args.next(),
            _ => {
                eprintln!("unknown arg {}", arg);
                process::exit(2);
            }
        }
    }

    let config_path = config_path.expect("missing --config");
    let config_bytes = fs::read_to_string(&config_path).expect("read config");
    let mut config: NodeConfig = serde_json::from_str(&config_bytes).expect("parse config json");
    if let Some(bind) = bind_override {
        config.bind = bind.parse().expect("parse --bind endpoint");
    }

    let secret_hex = if let Some(h) = key_hex {
        h
    } else if let Some(path) = key_file {
        fs::read_to_string(path)
            .expect("read key file")
            .trim()
            .to_string()
    } else {
        eprintln!("missing --key-hex or --key-file");
        process::exit(2);
    };

    let secret_bytes = hex::decode(secret_hex.trim()).expect("bad secret hex");
    if secret_bytes.len() != 32 {
        eprintln!("secret key must be 32 bytes hex");
        process::exit(2);
    }
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&secret_bytes);
    let keypair = keypair_from_seed(seed);

    let local_node = Arc::new(LocalNode::new(
        keypair,
        config.bind.clone(),
        alias.as_deref().unwrap_or(""),
    ));
    if let Some(publish) = &config.publish {
        local_node.set_publish_endpoint(publish.clone());
    }

    let validators = config.validator_infos().expect("validator list");
    local_node.add_validators(&validators);

    let network = match HttpNetwork::new(
        config.bind.clone(),
        config.http_config().expect("http config"),
    ) {
        Ok(network) => network,
        Err(err) => {
            eprintln!("network setup failed: {}", err);
            process::exit(1);
        }
    };

    let storage = Arc::new(Storage::new());
    let observer = Arc::new(BlockObserver::new());
    let network_id = config.network_id.as_bytes().to_vec();

    if let Some(genesis) = genesis {
        let (address, balance) = genesis.split_once(':').expect("--genesis <address>:<balance>");
        let balance: u64 = balance.parse().expect("genesis balance");
        let account = BlockAccount::new(address.to_string(), Amount(balance));
        account.save(&storage).expect("save genesis account");
        let genesis_keypair = local_node.keypair();
        match make_genesis_block(&storage, &observer, &account, &genesis_keypair, &network_id) {
            Ok(block) => eprintln!("genesis block created at height {}", block.header.height),
            Err(sebak::Error::BlockAlreadyExists) => {}
            Err(err) => {
                eprintln!("genesis failed: {}", err);
                process::exit(1);
            }
        }
    }

    let policy = Arc::new(RwLock::new(VotingThresholdPolicy::new(
        validators.len() as u32 + 1,
        config.threshold,
    )));
    let runner = NodeRunner::new(
        local_node,
        network,
        policy,
        storage,
        observer,
        &network_id,
    );

    if let Err(err) = runner.start() {
        eprintln!("node failed to start: {}", err);
        process::exit(1);
    }
}
