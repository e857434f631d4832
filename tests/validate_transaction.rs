// Precondition checks of the transaction validator against account state.
// When a fail condition is tested, the test is made to pass afterwards so
// the error is known to come from the expected cause and not from something
// else being broken.

use ed25519_dalek::Keypair;

use sebak::amount::{Amount, BASE_FEE, ONE_COIN};
use sebak::block::BlockAccount;
use sebak::common::{address_from_pubkey, keypair_from_seed};
use sebak::error::Error;
use sebak::runner::checker_transaction::validate_tx;
use sebak::storage::Storage;
use sebak::transaction::{Operation, Transaction};

const NETWORK_ID: &[u8] = b"sebak-test-network";

fn payment_tx(kp: &Keypair, target: &str, amount: u64, sequence_id: u64) -> Transaction {
    let source = address_from_pubkey(&kp.public);
    let mut tx = Transaction::new(
        source,
        sequence_id,
        vec![Operation::Payment {
            target: target.to_string(),
            amount: Amount(amount),
        }],
    );
    tx.sign(kp, NETWORK_ID);
    tx
}

#[test]
fn payment_with_missing_block_account() {
    let kps = keypair_from_seed([1u8; 32]);
    let kpt = keypair_from_seed([2u8; 32]);
    let source = address_from_pubkey(&kps.public);
    let target = address_from_pubkey(&kpt.public);

    let tx = payment_tx(&kps, &target, 10_000, 0);

    let st = Storage::new();
    assert_eq!(
        validate_tx(&st, NETWORK_ID, &tx),
        Err(Error::BlockAccountDoesNotExists)
    );

    // Now add the source account but not the target.
    let bas = BlockAccount::new(source.clone(), ONE_COIN);
    bas.save(&st).unwrap();
    assert_eq!(
        validate_tx(&st, NETWORK_ID, &tx),
        Err(Error::BlockAccountDoesNotExists)
    );

    // Now just the target.
    let st1 = Storage::new();
    let bat = BlockAccount::new(target.clone(), ONE_COIN);
    bat.save(&st1).unwrap();
    assert_eq!(
        validate_tx(&st1, NETWORK_ID, &tx),
        Err(Error::BlockAccountDoesNotExists)
    );

    // And finally, both.
    let st2 = Storage::new();
    bas.save(&st2).unwrap();
    bat.save(&st2).unwrap();
    assert_eq!(validate_tx(&st2, NETWORK_ID, &tx), Ok(()));
}

#[test]
fn wrong_sequence_id_is_rejected_both_ways() {
    let kps = keypair_from_seed([3u8; 32]);
    let kpt = keypair_from_seed([4u8; 32]);
    let source = address_from_pubkey(&kps.public);
    let target = address_from_pubkey(&kpt.public);

    let st = Storage::new();
    let mut bas = BlockAccount::new(source, ONE_COIN);
    bas.sequence_id = 1;
    bas.save(&st).unwrap();
    BlockAccount::new(target.clone(), ONE_COIN).save(&st).unwrap();

    let tx = payment_tx(&kps, &target, 10_000, 0);
    assert_eq!(
        validate_tx(&st, NETWORK_ID, &tx),
        Err(Error::TransactionInvalidSequenceID)
    );

    let tx = payment_tx(&kps, &target, 10_000, 2);
    assert_eq!(
        validate_tx(&st, NETWORK_ID, &tx),
        Err(Error::TransactionInvalidSequenceID)
    );

    let tx = payment_tx(&kps, &target, 10_000, 1);
    assert_eq!(validate_tx(&st, NETWORK_ID, &tx), Ok(()));
}

#[test]
fn payment_over_balance() {
    let kps = keypair_from_seed([5u8; 32]);
    let kpt = keypair_from_seed([6u8; 32]);
    let source = address_from_pubkey(&kps.public);
    let target = address_from_pubkey(&kpt.public);

    let st = Storage::new();
    let mut bas = BlockAccount::new(source.clone(), ONE_COIN);
    bas.sequence_id = 1;
    bas.save(&st).unwrap();
    BlockAccount::new(target.clone(), ONE_COIN).save(&st).unwrap();

    // The whole balance leaves no room for the fee.
    let tx = payment_tx(&kps, &target, ONE_COIN.value(), 1);
    assert_eq!(
        validate_tx(&st, NETWORK_ID, &tx),
        Err(Error::TransactionExcessAbilityToPay)
    );

    let tx = payment_tx(&kps, &target, ONE_COIN.sub(BASE_FEE).unwrap().value(), 1);
    assert_eq!(validate_tx(&st, NETWORK_ID, &tx), Ok(()));

    // Multiple operations: the balance is 1 BOS (10M units), so four ops of
    // 2.5M blow past it once each op's fee is added.
    let op = |amount: u64| Operation::Payment {
        target: target.clone(),
        amount: Amount(amount),
    };
    let mut tx = Transaction::new(
        source.clone(),
        1,
        vec![op(2_500_000), op(2_500_000), op(2_500_000), op(2_500_000)],
    );
    tx.sign(&kps, NETWORK_ID);
    assert_eq!(
        validate_tx(&st, NETWORK_ID, &tx),
        Err(Error::TransactionExcessAbilityToPay)
    );

    // Shaving four fees off one operation makes ops + fees equal the balance.
    let first = 2_500_000 - BASE_FEE.mult(4).unwrap().value();
    let mut tx = Transaction::new(
        source,
        1,
        vec![op(first), op(2_500_000), op(2_500_000), op(2_500_000)],
    );
    tx.sign(&kps, NETWORK_ID);
    assert_eq!(validate_tx(&st, NETWORK_ID, &tx), Ok(()));
}

#[test]
fn create_account_on_existing_target() {
    let kps = keypair_from_seed([7u8; 32]);
    let kpt = keypair_from_seed([8u8; 32]);
    let source = address_from_pubkey(&kps.public);
    let target = address_from_pubkey(&kpt.public);

    let st = Storage::new();
    let bas = BlockAccount::new(source.clone(), ONE_COIN);
    bas.save(&st).unwrap();
    BlockAccount::new(target.clone(), ONE_COIN).save(&st).unwrap();

    let mut tx = Transaction::new(
        source,
        0,
        vec![Operation::CreateAccount {
            target,
            amount: Amount(10_000),
        }],
    );
    tx.sign(&kps, NETWORK_ID);
    assert_eq!(
        validate_tx(&st, NETWORK_ID, &tx),
        Err(Error::BlockAccountAlreadyExists)
    );

    let st1 = Storage::new();
    bas.save(&st1).unwrap();
    assert_eq!(validate_tx(&st1, NETWORK_ID, &tx), Ok(()));
}
