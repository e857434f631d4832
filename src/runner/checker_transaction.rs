// Transaction validation against account state. Context-free checks run
// first; nothing here mutates storage, application happens at block save.

use std::sync::Arc;

use crate::block::{account_key, BlockAccount};
use crate::checker::{Checker, CheckerResult};
use crate::error::Error;
use crate::storage::Storage;
use crate::transaction::{Operation, Transaction};

pub struct TransactionContext {
    pub network_id: Vec<u8>,
    pub transaction: Transaction,
}

fn check_well_formed(_: &Storage, ctx: TransactionContext) -> CheckerResult<TransactionContext> {
    if let Err(err) = ctx.transaction.is_well_formed(&ctx.network_id) {
        return Err((ctx, err.into()));
    }
    Ok(ctx)
}

fn check_source_exists(
    storage: &Storage,
    ctx: TransactionContext,
) -> CheckerResult<TransactionContext> {
    if !BlockAccount::exists(storage, &ctx.transaction.body.source) {
        return Err((ctx, Error::BlockAccountDoesNotExists.into()));
    }
    Ok(ctx)
}

/// The source sequence id must match exactly; both behind and ahead are
/// rejected the same way.
fn check_sequence_id(
    storage: &Storage,
    ctx: TransactionContext,
) -> CheckerResult<TransactionContext> {
    let account = match BlockAccount::get(storage, &ctx.transaction.body.source) {
        Ok(account) => account,
        Err(err) => return Err((ctx, err.into())),
    };
    if account.sequence_id != ctx.transaction.body.sequence_id {
        return Err((ctx, Error::TransactionInvalidSequenceID.into()));
    }
    Ok(ctx)
}

fn check_operation_targets(
    storage: &Storage,
    ctx: TransactionContext,
) -> CheckerResult<TransactionContext> {
    for op in &ctx.transaction.body.operations {
        let exists = storage.has(&account_key(op.target()));
        match op {
            Operation::Payment { .. } if !exists => {
                return Err((ctx, Error::BlockAccountDoesNotExists.into()));
            }
            Operation::CreateAccount { .. } if exists => {
                return Err((ctx, Error::BlockAccountAlreadyExists.into()));
            }
            _ => {}
        }
    }
    Ok(ctx)
}

/// Operation amounts plus the per-operation fee must fit in the balance.
fn check_balance(storage: &Storage, ctx: TransactionContext) -> CheckerResult<TransactionContext> {
    let account = match BlockAccount::get(storage, &ctx.transaction.body.source) {
        Ok(account) => account,
        Err(err) => return Err((ctx, err.into())),
    };
    let total = match ctx.transaction.total_amount(true) {
        Ok(total) => total,
        Err(_) => return Err((ctx, Error::TransactionExcessAbilityToPay.into())),
    };
    if total > account.balance {
        return Err((ctx, Error::TransactionExcessAbilityToPay.into()));
    }
    Ok(ctx)
}

fn validation_chain() -> Checker<Storage, TransactionContext> {
    Checker::builder()
        .add("well_formed", Arc::new(check_well_formed))
        .add("source_exists", Arc::new(check_source_exists))
        .add("sequence_id", Arc::new(check_sequence_id))
        .add("operation_targets", Arc::new(check_operation_targets))
        .add("balance", Arc::new(check_balance))
        .build()
}

/// Runs the full precondition chain for one transaction against a storage
/// snapshot, failing at the first violation.
pub fn validate_tx(storage: &Storage, network_id: &[u8], tx: &Transaction) -> Result<(), Error> {
    let ctx = TransactionContext {
        network_id: network_id.to_vec(),
        transaction: tx.clone(),
    };
    let (_, outcome) = validation_chain().run(storage, ctx);
    outcome
}
