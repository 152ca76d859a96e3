#![forbid(unsafe_code)]

// Stage list - feed position, joined stage and REST snapshot merge

use super::types::{ScrollDirection, Stage};
use crate::api::StageDetails;
use tracing::debug;

/// What a REST merge changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Ids of stages dropped because the snapshot no longer lists them
    pub removed: Vec<String>,
    /// The joined stage was among the removed ones
    pub joined_removed: bool,
    /// The current stage vanished and the index went back to 0
    pub index_reset: bool,
    /// Seat assignments of the current stage, when the snapshot carries them
    pub current_seats: Option<Vec<Option<String>>>,
}

/// Ordered stage feed with a current position and the id of the joined stage
#[derive(Debug, Clone, Default)]
pub struct StageList {
    stages: Vec<Stage>,
    current: usize,
    joined: Option<String>,
}

impl StageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> Option<&Stage> {
        self.stages.get(self.current)
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current().map(|s| s.stage_id.as_str())
    }

    pub fn joined_id(&self) -> Option<&str> {
        self.joined.as_deref()
    }

    pub fn set_joined(&mut self, stage_id: Option<String>) {
        self.joined = stage_id;
    }

    pub fn get(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn get_mut(&mut self, stage_id: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.stage_id == stage_id)
    }

    /// The current stage id when it is not the joined one
    pub fn pending_join(&self) -> Option<String> {
        let current = self.current_id()?;
        (self.joined.as_deref() != Some(current)).then(|| current.to_string())
    }

    /// Moves the current position with wraparound (Down = next). Returns the
    /// new current stage.
    pub fn scroll(&mut self, direction: ScrollDirection) -> Option<&Stage> {
        let len = self.stages.len();
        if len == 0 {
            return None;
        }
        self.current = match direction {
            ScrollDirection::Down => (self.current + 1) % len,
            ScrollDirection::Up => (self.current + len - 1) % len,
        };
        self.stages.get(self.current)
    }

    /// Puts a stage the local user created at the front and makes it current.
    pub fn insert_created(&mut self, stage: Stage) {
        self.stages.retain(|s| s.stage_id != stage.stage_id);
        for existing in &mut self.stages {
            existing.is_stage_creator = false;
        }
        self.stages.insert(0, stage);
        self.current = 0;
    }

    /// Removes a stage; keeps the current position on the same stage when it
    /// survives, else falls back to index 0.
    pub fn remove(&mut self, stage_id: &str) -> Option<Stage> {
        let index = self.stages.iter().position(|s| s.stage_id == stage_id)?;
        let current_id = self.current_id().map(str::to_string);
        let removed = self.stages.remove(index);
        if self.joined.as_deref() == Some(stage_id) {
            self.joined = None;
        }
        self.current = current_id
            .and_then(|id| self.stages.iter().position(|s| s.stage_id == id))
            .unwrap_or(0);
        Some(removed)
    }

    /// Merges a REST snapshot. Stages missing from it are dropped, known ones
    /// keep their position and new ones are appended in snapshot order.
    /// Entries without a stage id are skipped.
    pub fn merge_snapshot(&mut self, snapshot: &[StageDetails]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let entries: Vec<(&str, &StageDetails)> = snapshot
            .iter()
            .filter_map(|d| match d.stage_id.as_deref() {
                Some(id) if !id.is_empty() => Some((id, d)),
                _ => {
                    debug!("Skipping stage entry without id");
                    None
                }
            })
            .collect();
        let current_id = self.current_id().map(str::to_string);

        let joined = self.joined.clone();
        self.stages.retain(|stage| {
            let live = entries.iter().any(|(id, _)| *id == stage.stage_id);
            if !live {
                if joined.as_deref() == Some(stage.stage_id.as_str()) {
                    outcome.joined_removed = true;
                }
                outcome.removed.push(stage.stage_id.clone());
            }
            live
        });
        if outcome.joined_removed {
            self.joined = None;
        }

        for (id, details) in &entries {
            match self.stages.iter_mut().find(|s| s.stage_id == *id) {
                Some(stage) => {
                    stage.kind = Some(details.kind);
                    stage.mode = details.mode;
                    stage.creator_avatar = details.creator_avatar.clone();
                    stage.guest_avatar = details.guest_avatar.clone();
                }
                None => {
                    let mut stage = Stage::new(*id, details.kind);
                    stage.mode = details.mode;
                    stage.creator_avatar = details.creator_avatar.clone();
                    stage.guest_avatar = details.guest_avatar.clone();
                    self.stages.push(stage);
                }
            }
        }

        match current_id.and_then(|id| self.stages.iter().position(|s| s.stage_id == id)) {
            Some(index) => self.current = index,
            None => {
                outcome.index_reset = self.current != 0 || !outcome.removed.is_empty();
                self.current = 0;
            }
        }

        if let Some(current) = self.current_id() {
            outcome.current_seats = entries
                .iter()
                .find(|(id, d)| *id == current && !d.seats.is_empty())
                .map(|(_, d)| d.seat_assignments());
        }
        outcome
    }

    pub fn clear(&mut self) {
        self.stages.clear();
        self.current = 0;
        self.joined = None;
    }
}
