// The ballot handler pipeline: receive -> classify -> vote -> store ->
// broadcast. Each step takes the voting-state lock, computes its
// transition, releases the lock, and only then initiates I/O.

use std::sync::Arc;

use crate::ballot::{Ballot, BallotState, VotingHole};
use crate::block::Block;
use crate::checker::{CheckerFunc, CheckerResult};
use crate::common::{Hash, ZERO_HASH};
use crate::error::Error;
use crate::network::Message;
use crate::runner::NodeRunner;
use crate::voting::VotingStateStaging;

/// Context threaded through the ballot chain. `ballot` starts as the
/// incoming message and becomes this node's own response when the pipeline
/// produces one.
pub struct BallotContext {
    pub ballot: Ballot,
    pub message_hash: Hash,
    pub is_new: bool,
    pub staging: Option<VotingStateStaging>,
    pub broadcast_states: Vec<BallotState>,
}

impl BallotContext {
    pub fn new(ballot: Ballot) -> BallotContext {
        BallotContext {
            ballot,
            message_hash: ZERO_HASH,
            is_new: false,
            staging: None,
            broadcast_states: Vec::new(),
        }
    }
}

/// Hash, signature, times, size limits, and the round-against-chain check.
pub fn check_is_wellformed(runner: &NodeRunner, mut ctx: BallotContext) -> CheckerResult<BallotContext> {
    if let Err(err) = ctx.ballot.is_well_formed(runner.network_id()) {
        return Err((ctx, err.into()));
    }

    let latest = match Block::get_latest(runner.storage()) {
        Ok(latest) => latest,
        Err(err) => return Err((ctx, err.into())),
    };
    let round = &ctx.ballot.body.round;
    if round.block_height != latest.header.height || round.prev_block_hash != latest.hash {
        let err = Error::BallotNotWellFormed("round does not reference the latest block".into());
        return Err((ctx, err.into()));
    }

    ctx.message_hash = ctx.ballot.message_hash();
    Ok(ctx)
}

/// A proposal that already reached a terminal outcome is dropped quietly.
pub fn check_is_new(runner: &NodeRunner, mut ctx: BallotContext) -> CheckerResult<BallotContext> {
    if runner.is_terminated(&ctx.message_hash) {
        return Err((ctx, crate::checker::CheckerError::Stop("ballot already finished")));
    }
    ctx.is_new = runner.voting_result(&ctx.message_hash).is_none();
    Ok(ctx)
}

/// Records the incoming vote and, for a fresh proposal from someone else,
/// builds this node's own response ballot. The response's vote is recorded
/// later, in `store`, so a test seam between the two can rewrite it.
pub fn check_receive_ballot(
    runner: &NodeRunner,
    mut ctx: BallotContext,
) -> CheckerResult<BallotContext> {
    if ctx.ballot.state() == BallotState::AllConfirm {
        // Confirming ballots carry no vote; our own tally reaches the same
        // terminal state by threshold.
        return Err((ctx, crate::checker::CheckerError::Stop("confirming ballot")));
    }

    let result = runner.get_or_create_voting_result(&ctx.ballot);
    {
        let mut result = result.lock().unwrap();
        if let Err(err) = result.record_vote(
            &ctx.ballot.body.source,
            ctx.ballot.state(),
            ctx.ballot.body.voting_hole,
        ) {
            if err == Error::BallotAlreadyFinished {
                return Err((ctx, crate::checker::CheckerError::Stop("ballot already finished")));
            }
            return Err((ctx, err.into()));
        }
    }

    if ctx.is_new && &ctx.ballot.body.source != runner.local_node().address() {
        let voting_hole = runner.decide_vote(&ctx.ballot.body.transactions);
        let mut own = ctx.ballot.derived(BallotState::Init, voting_hole);
        own.sign(&runner.local_node().keypair(), runner.network_id());
        ctx.ballot = own;
    }

    Ok(ctx)
}

/// Records the context ballot's vote, drives phase transitions, and commits
/// the block when ACCEPT closes with YES. A commit failure reopens the
/// result so the next round can retry.
pub fn check_store(runner: &NodeRunner, mut ctx: BallotContext) -> CheckerResult<BallotContext> {
    let Some(result) = runner.voting_result(&ctx.message_hash) else {
        return Err((ctx, crate::checker::CheckerError::Stop("no voting result")));
    };

    let policy = runner.policy().read().unwrap().clone();
    let own_address = runner.local_node().address().clone();

    let mut result = result.lock().unwrap();
    if let Err(err) = result.record_vote(
        &ctx.ballot.body.source,
        ctx.ballot.state(),
        ctx.ballot.body.voting_hole,
    ) {
        if err == Error::BallotAlreadyFinished {
            return Err((ctx, crate::checker::CheckerError::Stop("ballot already finished")));
        }
        return Err((ctx, err.into()));
    }

    while let Some(staging) = result.transition(&policy) {
        ctx.staging = Some(staging.clone());

        if staging.closed && staging.voting_hole == VotingHole::No {
            runner.mark_terminated(&ctx.message_hash);
            break;
        }

        if staging.state == BallotState::AllConfirm {
            match runner.commit_block(&result) {
                Ok(_) => {
                    runner.mark_terminated(&ctx.message_hash);
                }
                Err(err) => {
                    result.reopen_last();
                    ctx.staging = None;
                    return Err((ctx, err.into()));
                }
            }
            break;
        }

        // Advanced to SIGN or ACCEPT: our own endorsement of the new phase
        // counts immediately and goes out in `broadcast`.
        if let Err(err) = result.record_vote(&own_address, staging.state, VotingHole::Yes) {
            return Err((ctx, err.into()));
        }
        ctx.broadcast_states.push(staging.state);
    }

    if ctx.staging.is_none() && &ctx.ballot.body.source != runner.local_node().address() {
        return Err((ctx, crate::checker::CheckerError::Stop("ballot got no changes")));
    }

    Ok(ctx)
}

/// Emits our own ballots: the response vote, one per advanced phase, and the
/// confirming ALLCONFIRM after a commit. Always stops the chain so the
/// deferred hook observes the final staging.
pub fn check_broadcast(runner: &NodeRunner, ctx: BallotContext) -> CheckerResult<BallotContext> {
    let own_address = runner.local_node().address();

    if &ctx.ballot.body.source == own_address
        && ctx.ballot.body.voting_hole != VotingHole::NotYet
    {
        runner
            .connection_manager()
            .broadcast(Message::Ballot(ctx.ballot.clone()));
    }

    let keypair = runner.local_node().keypair();
    for state in &ctx.broadcast_states {
        let mut own = ctx.ballot.derived(*state, VotingHole::Yes);
        own.sign(&keypair, runner.network_id());
        runner.connection_manager().broadcast(Message::Ballot(own));
    }

    if let Some(staging) = &ctx.staging {
        if staging.state == BallotState::AllConfirm {
            let mut confirm = ctx.ballot.derived(BallotState::AllConfirm, VotingHole::Yes);
            confirm.sign(&keypair, runner.network_id());
            runner.connection_manager().broadcast(Message::Ballot(confirm));
        }
    }

    Err((ctx, crate::checker::CheckerError::Stop("ballot broadcast finished")))
}

/// The default chain, in pipeline order.
pub fn default_ballot_checker_funcs() -> Vec<(&'static str, CheckerFunc<NodeRunner, BallotContext>)>
{
    vec![
        ("is_wellformed", Arc::new(check_is_wellformed)),
        ("check_is_new", Arc::new(check_is_new)),
        ("receive_ballot", Arc::new(check_receive_ballot)),
        ("store", Arc::new(check_store)),
        ("broadcast", Arc::new(check_broadcast)),
    ]
}
