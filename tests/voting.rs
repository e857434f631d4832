// Threshold policy arithmetic and the per-proposal tally state machine.

use sebak::ballot::{Ballot, BallotState, VotingHole};
use sebak::common::{address_from_pubkey, keypair_from_seed, Hash};
use sebak::error::Error;
use sebak::round::Round;
use sebak::voting::{VotingResult, VotingThresholdPolicy};

fn test_address(seed: u8) -> String {
    address_from_pubkey(&keypair_from_seed([seed; 32]).public)
}

fn test_ballot() -> Ballot {
    let round = Round::new(1, 0, [7u8; 32], 1);
    let transactions: Vec<Hash> = vec![[9u8; 32]];
    Ballot::new(test_address(1), round, transactions)
}

#[test]
fn required_scales_with_connected_count() {
    let mut policy = VotingThresholdPolicy::new(10, 66);
    assert_eq!(policy.required(BallotState::Init), 0);

    policy.set_connected(9);
    assert_eq!(policy.required(BallotState::Init), 6);
    assert_eq!(policy.required(BallotState::Sign), 6);
    assert_eq!(policy.required(BallotState::Accept), 6);

    policy.set_connected(2);
    assert_eq!(policy.required(BallotState::Init), 2);

    policy.set_connected(100);
    assert_eq!(policy.required(BallotState::Init), 66);
}

#[test]
fn required_is_monotone_in_connected_count() {
    for percent in [1u32, 34, 50, 66, 100] {
        let mut policy = VotingThresholdPolicy::new(32, percent);
        let mut previous = 0;
        for connected in 0..=32 {
            policy.set_connected(connected);
            let required = policy.required(BallotState::Sign);
            assert!(required >= previous, "required must not shrink");
            previous = required;
        }
    }
}

#[test]
fn reset_overrides_one_phase_only() {
    let mut policy = VotingThresholdPolicy::new(3, 66);
    policy.set_connected(2);
    assert_eq!(policy.required(BallotState::Init), 2);

    policy.reset(BallotState::Init, 100);
    assert_eq!(policy.required(BallotState::Init), 2);
    policy.set_connected(3);
    assert_eq!(policy.required(BallotState::Init), 3);
    assert_eq!(policy.required(BallotState::Sign), 2);
}

#[test]
fn later_vote_from_same_source_replaces_earlier() {
    let mut result = VotingResult::new(test_ballot());
    let voter = test_address(2);

    result
        .record_vote(&voter, BallotState::Init, VotingHole::NotYet)
        .unwrap();
    assert_eq!(result.count(BallotState::Init, VotingHole::NotYet), 1);

    result
        .record_vote(&voter, BallotState::Init, VotingHole::Yes)
        .unwrap();
    assert_eq!(result.count(BallotState::Init, VotingHole::NotYet), 0);
    assert_eq!(result.count(BallotState::Init, VotingHole::Yes), 1);
    assert_eq!(result.votes_at(BallotState::Init), 1);
}

#[test]
fn yes_threshold_advances_phases_to_allconfirm() {
    let mut policy = VotingThresholdPolicy::new(4, 66);
    policy.set_connected(3);
    let required = policy.required(BallotState::Init) as u8;
    assert_eq!(required, 2);

    let mut result = VotingResult::new(test_ballot());
    for seed in 0..required {
        result
            .record_vote(&test_address(10 + seed), BallotState::Init, VotingHole::Yes)
            .unwrap();
    }

    let staging = result.transition(&policy).expect("init should close");
    assert_eq!(staging.previous_state, BallotState::Init);
    assert_eq!(staging.state, BallotState::Sign);
    assert!(staging.is_changed());
    assert!(!staging.is_closed());
    assert!(result.transition(&policy).is_none());

    for seed in 0..required {
        result
            .record_vote(&test_address(20 + seed), BallotState::Sign, VotingHole::Yes)
            .unwrap();
    }
    let staging = result.transition(&policy).expect("sign should close");
    assert_eq!(staging.state, BallotState::Accept);

    for seed in 0..required {
        result
            .record_vote(&test_address(30 + seed), BallotState::Accept, VotingHole::Yes)
            .unwrap();
    }
    let staging = result.transition(&policy).expect("accept should close");
    assert_eq!(staging.state, BallotState::AllConfirm);
    assert!(staging.is_closed());
    assert_eq!(staging.voting_hole, VotingHole::Yes);
    assert!(result.closed);
}

#[test]
fn no_threshold_closes_at_init() {
    let mut policy = VotingThresholdPolicy::new(3, 100);
    policy.set_connected(2);

    let mut result = VotingResult::new(test_ballot());
    result
        .record_vote(&test_address(2), BallotState::Init, VotingHole::Yes)
        .unwrap();
    assert!(result.transition(&policy).is_none());

    result
        .record_vote(&test_address(3), BallotState::Init, VotingHole::No)
        .unwrap();
    result
        .record_vote(&test_address(4), BallotState::Init, VotingHole::No)
        .unwrap();

    let staging = result.transition(&policy).expect("no votes should close");
    assert_eq!(staging.previous_state, BallotState::Init);
    assert_eq!(staging.state, BallotState::Init);
    assert_eq!(staging.voting_hole, VotingHole::No);
    assert!(staging.is_closed());
    assert!(!staging.is_changed());

    // Closed means closed: no more votes, no more transitions.
    assert_eq!(
        result.record_vote(&test_address(5), BallotState::Init, VotingHole::Yes),
        Err(Error::BallotAlreadyFinished)
    );
    assert!(result.transition(&policy).is_none());
}

#[test]
fn no_votes_outside_init_do_not_close() {
    let mut policy = VotingThresholdPolicy::new(3, 66);
    policy.set_connected(2);

    let mut result = VotingResult::new(test_ballot());
    for seed in 0..2 {
        result
            .record_vote(&test_address(70 + seed), BallotState::Init, VotingHole::Yes)
            .unwrap();
    }
    let staging = result.transition(&policy).unwrap();
    assert_eq!(staging.state, BallotState::Sign);

    // A NO majority after INIT has passed is inert; the ballot can only
    // move forward from here.
    result
        .record_vote(&test_address(80), BallotState::Sign, VotingHole::No)
        .unwrap();
    result
        .record_vote(&test_address(81), BallotState::Sign, VotingHole::No)
        .unwrap();
    assert!(result.transition(&policy).is_none());
    assert!(!result.closed);
    assert_eq!(result.state, BallotState::Sign);

    // A later YES quorum at SIGN still advances it.
    result
        .record_vote(&test_address(82), BallotState::Sign, VotingHole::Yes)
        .unwrap();
    result
        .record_vote(&test_address(83), BallotState::Sign, VotingHole::Yes)
        .unwrap();
    let staging = result.transition(&policy).unwrap();
    assert_eq!(staging.state, BallotState::Accept);
    assert_eq!(staging.voting_hole, VotingHole::Yes);
}

#[test]
fn transitions_cascade_when_later_votes_arrived_first() {
    let mut policy = VotingThresholdPolicy::new(3, 66);
    policy.set_connected(2);

    let mut result = VotingResult::new(test_ballot());
    // SIGN votes arrive before INIT reaches its threshold.
    for seed in 0..2 {
        result
            .record_vote(&test_address(40 + seed), BallotState::Sign, VotingHole::Yes)
            .unwrap();
    }
    assert!(result.transition(&policy).is_none());

    for seed in 0..2 {
        result
            .record_vote(&test_address(50 + seed), BallotState::Init, VotingHole::Yes)
            .unwrap();
    }
    let first = result.transition(&policy).unwrap();
    assert_eq!(first.state, BallotState::Sign);
    let second = result.transition(&policy).unwrap();
    assert_eq!(second.state, BallotState::Accept);
    assert!(result.transition(&policy).is_none());
}

#[test]
fn reopen_rolls_back_the_last_transition() {
    let mut policy = VotingThresholdPolicy::new(3, 66);
    policy.set_connected(2);

    let mut result = VotingResult::new(test_ballot());
    result.state = BallotState::Accept;
    for seed in 0..2 {
        result
            .record_vote(&test_address(60 + seed), BallotState::Accept, VotingHole::Yes)
            .unwrap();
    }
    let staging = result.transition(&policy).unwrap();
    assert_eq!(staging.state, BallotState::AllConfirm);
    assert!(result.closed);

    result.reopen_last();
    assert_eq!(result.state, BallotState::Accept);
    assert!(!result.closed);
    assert!(result.latest_staging().is_none());

    // The retry sees the same tally and fires again.
    let staging = result.transition(&policy).unwrap();
    assert_eq!(staging.state, BallotState::AllConfirm);
}

#[test]
fn zero_connected_validators_produce_no_result() {
    let policy = VotingThresholdPolicy::new(5, 66);
    let mut result = VotingResult::new(test_ballot());
    result
        .record_vote(&test_address(2), BallotState::Init, VotingHole::Yes)
        .unwrap();
    assert!(result.transition(&policy).is_none());
}
