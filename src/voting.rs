// Voting: the threshold policy mapping connected validators to required YES
// counts, and the per-proposal tally that drives phase transitions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::ballot::{Ballot, BallotState, VotingHole};
use crate::common::{Address, Hash};
use crate::error::Error;

/// Threshold policy for N validators at T percent. `required` scales with
/// the *connected* count, so a partitioned node demands fewer votes but
/// never fewer than the percentage of what it can see.
#[derive(Clone, Debug)]
pub struct VotingThresholdPolicy {
    validators: u32,
    connected: u32,
    thresholds: HashMap<BallotState, u32>,
}

impl VotingThresholdPolicy {
    pub fn new(validators: u32, threshold_percent: u32) -> VotingThresholdPolicy {
        let mut thresholds = HashMap::new();
        for state in [BallotState::Init, BallotState::Sign, BallotState::Accept] {
            thresholds.insert(state, threshold_percent);
        }
        VotingThresholdPolicy {
            validators,
            connected: 0,
            thresholds,
        }
    }

    pub fn validators(&self) -> u32 {
        self.validators
    }

    pub fn connected(&self) -> u32 {
        self.connected
    }

    pub fn set_connected(&mut self, connected: u32) {
        self.connected = connected;
    }

    /// Minimum YES votes to advance from `state`: ceil(connected * T / 100).
    /// Zero connected validators can never produce a result.
    pub fn required(&self, state: BallotState) -> u32 {
        let percent = match self.thresholds.get(&state) {
            Some(p) => u64::from(*p),
            None => return 0,
        };
        let connected = u64::from(self.connected);
        ((connected * percent + 99) / 100) as u32
    }

    /// Test hook: override the percentage for one phase.
    pub fn reset(&mut self, state: BallotState, threshold_percent: u32) {
        self.thresholds.insert(state, threshold_percent);
    }
}

/// Outcome snapshot of one phase transition, passed through the checker
/// context and kept in the result's history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VotingStateStaging {
    pub previous_state: BallotState,
    pub state: BallotState,
    pub voting_hole: VotingHole,
    pub message_hash: Hash,
    pub closed: bool,
}

impl VotingStateStaging {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_changed(&self) -> bool {
        self.previous_state != self.state
    }
}

/// Per-proposal tally. Keyed externally by the proposal fingerprint; open
/// until a threshold closes it, after which no further votes are accepted.
#[derive(Clone, Debug)]
pub struct VotingResult {
    pub message_hash: Hash,
    pub ballot: Ballot,
    pub state: BallotState,
    pub voting_hole: VotingHole,
    pub closed: bool,
    votes: HashMap<BallotState, HashMap<Address, VotingHole>>,
    pub staging: Vec<VotingStateStaging>,
    created: Instant,
}

impl VotingResult {
    pub fn new(ballot: Ballot) -> VotingResult {
        let message_hash = ballot.message_hash();
        let mut votes = HashMap::new();
        for state in [BallotState::Init, BallotState::Sign, BallotState::Accept] {
            votes.insert(state, HashMap::new());
        }
        VotingResult {
            message_hash,
            ballot,
            state: BallotState::Init,
            voting_hole: VotingHole::NotYet,
            closed: false,
            votes,
            staging: Vec::new(),
            created: Instant::now(),
        }
    }

    /// Time since the first ballot opened this tally; the round timeout
    /// bounds how long an open result may live.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Records one vote. A second vote from the same source in the same
    /// phase replaces the earlier one; the later arrival wins.
    pub fn record_vote(
        &mut self,
        source: &Address,
        state: BallotState,
        voting_hole: VotingHole,
    ) -> Result<(), Error> {
        if self.closed {
            return Err(Error::BallotAlreadyFinished);
        }
        let phase = self
            .votes
            .get_mut(&state)
            .ok_or(Error::BallotStalePhaseVote)?;
        phase.insert(source.clone(), voting_hole);
        Ok(())
    }

    pub fn count(&self, state: BallotState, voting_hole: VotingHole) -> usize {
        self.votes
            .get(&state)
            .map(|phase| phase.values().filter(|h| **h == voting_hole).count())
            .unwrap_or(0)
    }

    pub fn votes_at(&self, state: BallotState) -> usize {
        self.votes.get(&state).map(HashMap::len).unwrap_or(0)
    }

    /// One transition step at the current phase. A YES threshold advances
    /// the phase (closing at ALLCONFIRM). A NO threshold closes the result
    /// early, but only while it still sits at INIT; a ballot that advanced
    /// past INIT can only move forward, so later NO votes accumulate without
    /// effect. Returns the staging snapshot when anything changed.
    pub fn transition(&mut self, policy: &VotingThresholdPolicy) -> Option<VotingStateStaging> {
        if self.closed || !self.state.is_voting_phase() {
            return None;
        }
        let required = policy.required(self.state) as usize;
        if required == 0 {
            return None;
        }

        let yes = self.count(self.state, VotingHole::Yes);
        let no = self.count(self.state, VotingHole::No);

        let staging = if yes >= required {
            let previous_state = self.state;
            self.state = self.state.next();
            if self.state == BallotState::AllConfirm {
                self.closed = true;
                self.voting_hole = VotingHole::Yes;
            }
            VotingStateStaging {
                previous_state,
                state: self.state,
                voting_hole: VotingHole::Yes,
                message_hash: self.message_hash,
                closed: self.closed,
            }
        } else if self.state == BallotState::Init && no >= required {
            self.closed = true;
            self.voting_hole = VotingHole::No;
            VotingStateStaging {
                previous_state: self.state,
                state: self.state,
                voting_hole: VotingHole::No,
                message_hash: self.message_hash,
                closed: true,
            }
        } else {
            return None;
        };

        self.staging.push(staging.clone());
        Some(staging)
    }

    pub fn latest_staging(&self) -> Option<&VotingStateStaging> {
        self.staging.last()
    }

    /// Rolls back the most recent transition, reopening the tally. Used when
    /// the block commit behind an ALLCONFIRM fails and the result must stay
    /// open for retry.
    pub fn reopen_last(&mut self) {
        let Some(last) = self.staging.pop() else {
            return;
        };
        self.state = last.previous_state;
        self.closed = false;
        self.voting_hole = VotingHole::NotYet;
    }
}
