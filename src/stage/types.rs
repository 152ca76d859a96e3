#![forbid(unsafe_code)]

// Stage domain types and the closed failure taxonomy returned by the orchestrator

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::seats::Seat;

/// Media kind of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Participation mode of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageMode {
    #[default]
    None,
    GuestSpot,
    Pk,
}

impl StageMode {
    /// Parses the mode string used by chat attributes and the REST API.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NONE" => Some(Self::None),
            "GUEST_SPOT" | "GUESTSPOT" => Some(Self::GuestSpot),
            "PK" | "VS" => Some(Self::Pk),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::GuestSpot => "GUEST_SPOT",
            Self::Pk => "PK",
        }
    }
}

/// Direction of a feed scroll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Side of a PK/VS vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteSide {
    Creator,
    Participant,
}

/// A stage as rendered by the UI layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stage {
    pub stage_id: String,
    pub kind: Option<MediaKind>,
    pub mode: StageMode,
    pub is_stage_creator: bool,
    pub is_loading: bool,
    pub creator_avatar: Option<String>,
    pub guest_avatar: Option<String>,
    pub self_avatar: Option<String>,
    pub seats: Vec<Seat>,
    pub creator_present: bool,
    pub creator_audio_muted: bool,
    pub creator_video_off: bool,
    pub guest_participant_id: Option<String>,
    pub guest_audio_muted: bool,
    pub guest_video_off: bool,
    pub self_audio_muted: bool,
    pub self_video_off: bool,
    pub local_speaking: bool,
}

impl Stage {
    pub fn new(stage_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            stage_id: stage_id.into(),
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn is_audio(&self) -> bool {
        self.kind == Some(MediaKind::Audio)
    }

    /// Clears everything a joined session contributed to this stage.
    pub fn clear_session_state(&mut self) {
        self.is_loading = false;
        self.creator_present = false;
        self.guest_participant_id = None;
        self.guest_avatar = None;
        self.guest_audio_muted = false;
        self.guest_video_off = false;
        self.self_audio_muted = false;
        self.self_video_off = false;
        self.local_speaking = false;
        for seat in &mut self.seats {
            seat.speaking = false;
        }
    }
}

/// Failure of an orchestrator operation. The display text is the user-facing
/// message; the cause is only meant for logs.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Failed to create stage")]
    CreateStage(#[source] anyhow::Error),

    #[error("Failed to join stage")]
    JoinStage(#[source] anyhow::Error),

    #[error("Failed to leave stage")]
    LeaveStage(#[source] anyhow::Error),

    #[error("Failed to load stages")]
    GetStages(#[source] anyhow::Error),

    #[error("Failed to update seats")]
    UpdateSeats(#[source] anyhow::Error),

    #[error("Failed to update stage mode")]
    UpdateMode(#[source] anyhow::Error),

    #[error("Failed to cast vote")]
    CastVote(#[source] anyhow::Error),

    #[error("Failed to remove participant")]
    KickParticipant(#[source] anyhow::Error),

    #[error("Failed to delete stage")]
    DeleteStage(#[source] anyhow::Error),

    #[error("Invalid customer code")]
    CustomerCode(#[source] anyhow::Error),
}

/// Result type alias for orchestrator operations
pub type StageResult<T> = Result<T, StageError>;
