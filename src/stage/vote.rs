#![forbid(unsafe_code)]

// PK/VS vote session - timed two-sided tally with countdown and resolution

use super::types::VoteSide;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const TICK: Duration = Duration::from_secs(1);

/// Phase of the vote state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VotePhase {
    #[default]
    Idle,
    Active,
    Resolved,
}

/// Winner of a resolved round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Winner {
    #[default]
    None,
    Creator,
    Participant,
    Draw,
}

/// Round result from one side's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundResult {
    Win,
    Lose,
    Draw,
}

impl Winner {
    fn from_scores(creator: u32, participant: u32) -> Self {
        match creator.cmp(&participant) {
            std::cmp::Ordering::Greater => Self::Creator,
            std::cmp::Ordering::Less => Self::Participant,
            std::cmp::Ordering::Equal => Self::Draw,
        }
    }

    pub fn result_for(&self, side: VoteSide) -> Option<RoundResult> {
        match (self, side) {
            (Self::None, _) => None,
            (Self::Draw, _) => Some(RoundResult::Draw),
            (Self::Creator, VoteSide::Creator) | (Self::Participant, VoteSide::Participant) => Some(RoundResult::Win),
            _ => Some(RoundResult::Lose),
        }
    }
}

/// Current vote state as shown by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteSnapshot {
    pub phase: VotePhase,
    pub remaining_secs: i64,
    pub creator_score: u32,
    pub participant_score: u32,
    pub winner: Winner,
}

/// Vote state transitions, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteEvent {
    Started { remaining_secs: i64 },
    Tick { remaining_secs: i64 },
    ScoreChanged { creator_score: u32, participant_score: u32 },
    Resolved { winner: Winner, creator_score: u32, participant_score: u32 },
    Cleared,
}

#[derive(Debug, Default)]
struct VoteState {
    snapshot: VoteSnapshot,
    /// Bumped on every start/reset; a countdown only applies while its epoch is current
    epoch: u64,
}

/// Timed voting round. Owns its countdown task; dropping the session or
/// calling [`VoteSession::reset`] stops it.
pub struct VoteSession {
    state: Arc<Mutex<VoteState>>,
    countdown: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<VoteEvent>,
    round_secs: i64,
    result_display: Duration,
}

impl VoteSession {
    pub fn new(round_secs: i64, result_display: Duration, events: mpsc::UnboundedSender<VoteEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(VoteState::default())),
            countdown: Mutex::new(None),
            events,
            round_secs,
            result_display,
        }
    }

    pub fn snapshot(&self) -> VoteSnapshot {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).snapshot
    }

    /// Starts a full round
    pub fn start_round(&self) -> bool {
        self.start(self.round_secs)
    }

    /// Starts the remainder of a round that began `elapsed_secs` ago
    pub fn start_mid_round(&self, elapsed_secs: i64) -> bool {
        self.start(self.round_secs - elapsed_secs.max(0))
    }

    /// Starts a countdown from `remaining_secs`. A negative remainder means the
    /// round is already over and there is nothing to resolve. Returns whether a
    /// countdown was started.
    pub fn start(&self, remaining_secs: i64) -> bool {
        self.stop_countdown();
        if remaining_secs < 0 {
            debug!("Vote round already over ({}s), nothing to resolve", remaining_secs);
            self.clear_state();
            return false;
        }

        let epoch = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.epoch += 1;
            state.snapshot = VoteSnapshot {
                phase: VotePhase::Active,
                remaining_secs,
                ..VoteSnapshot::default()
            };
            state.epoch
        };
        info!("Vote round started with {}s remaining", remaining_secs);
        let _ = self.events.send(VoteEvent::Started { remaining_secs });

        let handle = tokio::spawn(run_countdown(
            self.state.clone(),
            self.events.clone(),
            self.result_display,
            epoch,
        ));
        *self.countdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        true
    }

    /// Applies incoming totals. Without `should_reset_score` a side's score
    /// never goes down.
    pub fn apply_scores(&self, creator_score: u32, participant_score: u32, should_reset_score: bool) {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let snapshot = &mut state.snapshot;
            if snapshot.phase != VotePhase::Active {
                debug!("Ignoring vote totals outside an active round");
                return;
            }
            let (creator, participant) = if should_reset_score {
                (creator_score, participant_score)
            } else {
                (
                    snapshot.creator_score.max(creator_score),
                    snapshot.participant_score.max(participant_score),
                )
            };
            let changed = creator != snapshot.creator_score || participant != snapshot.participant_score;
            snapshot.creator_score = creator;
            snapshot.participant_score = participant;
            changed.then_some((creator, participant))
        };
        if let Some((creator_score, participant_score)) = changed {
            let _ = self.events.send(VoteEvent::ScoreChanged { creator_score, participant_score });
        }
    }

    /// Counts a vote the local user cast successfully
    pub fn record_local_vote(&self, side: VoteSide) {
        let snapshot = self.snapshot();
        match side {
            VoteSide::Creator => self.apply_scores(snapshot.creator_score + 1, snapshot.participant_score, false),
            VoteSide::Participant => self.apply_scores(snapshot.creator_score, snapshot.participant_score + 1, false),
        }
    }

    /// Cancels the countdown and resets counters to their defaults
    pub fn reset(&self) {
        self.stop_countdown();
        self.clear_state();
    }

    fn clear_state(&self) {
        let was_idle = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.epoch += 1;
            let was_idle = state.snapshot == VoteSnapshot::default();
            state.snapshot = VoteSnapshot::default();
            was_idle
        };
        if !was_idle {
            let _ = self.events.send(VoteEvent::Cleared);
        }
    }

    fn stop_countdown(&self) {
        if let Some(handle) = self.countdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl Drop for VoteSession {
    fn drop(&mut self) {
        self.stop_countdown();
    }
}

async fn run_countdown(
    state: Arc<Mutex<VoteState>>,
    events: mpsc::UnboundedSender<VoteEvent>,
    result_display: Duration,
    epoch: u64,
) {
    loop {
        let remaining_secs = {
            let guard = state.lock().unwrap_or_else(|e| e.into_inner());
            if guard.epoch != epoch {
                return;
            }
            guard.snapshot.remaining_secs
        };
        let _ = events.send(VoteEvent::Tick { remaining_secs });
        if remaining_secs <= 0 {
            break;
        }
        tokio::time::sleep(TICK).await;
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.epoch != epoch {
            return;
        }
        guard.snapshot.remaining_secs -= 1;
    }

    let resolved = {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.epoch != epoch {
            return;
        }
        let snapshot = &mut state.snapshot;
        snapshot.phase = VotePhase::Resolved;
        snapshot.winner = Winner::from_scores(snapshot.creator_score, snapshot.participant_score);
        *snapshot
    };
    info!(
        "Vote round resolved: {:?} ({} - {})",
        resolved.winner, resolved.creator_score, resolved.participant_score
    );
    let _ = events.send(VoteEvent::Resolved {
        winner: resolved.winner,
        creator_score: resolved.creator_score,
        participant_score: resolved.participant_score,
    });

    tokio::time::sleep(result_display).await;
    {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.epoch != epoch {
            return;
        }
        state.epoch += 1;
        state.snapshot = VoteSnapshot::default();
    }
    let _ = events.send(VoteEvent::Cleared);
}
