#![forbid(unsafe_code)]

// Publish/subscribe policy handed to the media engine

use super::engine::{EngineParticipant, LocalStream, Strategy, SubscribeType};
use crate::stage::types::{MediaKind, StageMode};
use std::sync::RwLock;

/// Subscription breadth as a pure function of who we are and what the stage is.
pub fn subscribe_type_for(is_creator: bool, mode: StageMode, kind: Option<MediaKind>) -> SubscribeType {
    if is_creator && mode == StageMode::None {
        return SubscribeType::None;
    }
    match kind {
        Some(MediaKind::Audio) => SubscribeType::AudioOnly,
        Some(MediaKind::Video) => SubscribeType::AudioVideo,
        None => SubscribeType::None,
    }
}

#[derive(Debug, Clone, Default)]
struct PolicyState {
    is_creator: bool,
    mode: StageMode,
    kind: Option<MediaKind>,
    participating: bool,
    local_streams: Vec<LocalStream>,
}

/// Mutable strategy shared between the session manager and the engine.
#[derive(Debug, Default)]
pub struct StagePolicy {
    state: RwLock<PolicyState>,
}

impl StagePolicy {
    pub fn new(is_creator: bool, kind: MediaKind) -> Self {
        Self {
            state: RwLock::new(PolicyState {
                is_creator,
                kind: Some(kind),
                ..PolicyState::default()
            }),
        }
    }

    pub fn set_mode(&self, mode: StageMode) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).mode = mode;
    }

    /// Starts publishing `streams`
    pub fn participate(&self, streams: Vec<LocalStream>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.participating = true;
        state.local_streams = streams;
    }

    pub fn withdraw(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.participating = false;
        state.local_streams.clear();
    }

    pub fn is_participating(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).participating
    }

    pub fn local_streams(&self) -> Vec<LocalStream> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).local_streams.clone()
    }
}

impl Strategy for StagePolicy {
    fn subscribe_type(&self, participant: &EngineParticipant) -> SubscribeType {
        if participant.is_local {
            return SubscribeType::None;
        }
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        subscribe_type_for(state.is_creator, state.mode, state.kind)
    }

    fn should_publish(&self, participant: &EngineParticipant) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        participant.is_local && state.participating && !state.local_streams.is_empty()
    }

    fn streams_to_publish(&self, participant: &EngineParticipant) -> Vec<LocalStream> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if participant.is_local && state.participating {
            state.local_streams.clone()
        } else {
            Vec::new()
        }
    }
}
