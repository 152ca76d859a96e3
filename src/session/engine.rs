#![forbid(unsafe_code)]

// Media engine contract - device/stream creation, session join and renderer callbacks

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Attribute carrying a participant's stable user id
pub const ATTR_USER_ID: &str = "username";
/// Attribute carrying a participant's avatar
pub const ATTR_AVATAR: &str = "avatar";

/// Error raised by the media engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("device not available: {0}")]
    DeviceUnavailable(String),

    #[error("join failed: {0}")]
    Join(String),

    #[error("stats unavailable: {0}")]
    Stats(String),
}

/// Kind of a media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
}

/// Which camera a video device faces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Back,
    External,
}

/// Capture device reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: StreamKind,
    pub facing: Option<CameraFacing>,
}

/// Parameters used to create a local stream
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStreamConfig {
    pub muted: bool,
    pub max_bitrate: u32,
    pub simulcast: bool,
}

/// A local capture stream the engine can publish
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStream {
    pub stream_id: String,
    pub kind: StreamKind,
    pub muted: bool,
}

/// Remote or local stream as reported by renderer callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub stream_id: String,
    pub kind: StreamKind,
    pub muted: bool,
}

/// Participant as reported by the engine
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineParticipant {
    /// Engine-assigned id, re-issued on every join
    pub participant_id: String,
    pub is_local: bool,
    /// Declared attributes (user id, avatar)
    pub attributes: HashMap<String, String>,
}

impl EngineParticipant {
    pub fn user_id(&self) -> Option<&str> {
        self.attributes.get(ATTR_USER_ID).map(String::as_str)
    }

    pub fn avatar(&self) -> Option<&str> {
        self.attributes.get(ATTR_AVATAR).map(String::as_str)
    }
}

/// Connection state of an engine session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Renderer callbacks. The engine delivers these in order on the channel it
/// was handed at session creation.
#[derive(Debug, Clone, PartialEq)]
pub enum RendererEvent {
    ConnectionStateChanged {
        state: ConnectionState,
        error: Option<String>,
    },
    ParticipantJoined {
        participant: EngineParticipant,
    },
    ParticipantLeft {
        participant: EngineParticipant,
    },
    StreamsAdded {
        participant: EngineParticipant,
        streams: Vec<StreamInfo>,
    },
    StreamsRemoved {
        participant: EngineParticipant,
        streams: Vec<StreamInfo>,
    },
    StreamsMuted {
        participant: EngineParticipant,
        streams: Vec<StreamInfo>,
    },
    /// Per-stream audio statistics (RMS energy in dB)
    AudioStats {
        participant_id: String,
        stream_id: String,
        rms_db: f32,
    },
    /// Engine-level error; informational only
    Error {
        message: String,
    },
}

/// What to subscribe to for a remote participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeType {
    None,
    AudioOnly,
    AudioVideo,
}

/// Publish/subscribe policy the core hands to the engine. The engine queries
/// it whenever participants change or the session calls
/// [`EngineSession::refresh_strategy`].
pub trait Strategy: Send + Sync {
    fn subscribe_type(&self, participant: &EngineParticipant) -> SubscribeType;

    fn should_publish(&self, participant: &EngineParticipant) -> bool;

    fn streams_to_publish(&self, participant: &EngineParticipant) -> Vec<LocalStream>;
}

/// Whose stats to pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsTarget {
    /// Local published streams
    Local,
    /// Subscribed streams of a remote participant
    Remote(String),
}

/// One raw RTC stat record. Only the fields the aggregator reads are typed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStat {
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(default)]
    pub quality_limitation_reason: Option<String>,
    #[serde(default)]
    pub quality_limitation_durations: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub frames_per_second: Option<f64>,
    #[serde(default)]
    pub packets_lost: Option<i64>,
    #[serde(default)]
    pub current_round_trip_time: Option<f64>,
}

/// Raw stats keyed by an implementation-defined record id
pub type RawStatsReport = HashMap<String, RawStat>;

/// A joined (or joining) engine session
#[async_trait]
pub trait EngineSession: Send + Sync {
    /// Connects to the stage; returns once the engine confirms the join
    async fn join(&self) -> Result<(), EngineError>;

    /// Re-evaluates the strategy after a publish/mode change
    fn refresh_strategy(&self);

    /// Pulls RTC stats for the given target
    async fn request_rtc_stats(&self, target: StatsTarget) -> Result<Vec<(StreamKind, RawStatsReport)>, EngineError>;

    /// Leaves the stage
    fn leave(&self);

    /// Detaches all renderer listeners; no callbacks are delivered afterwards
    fn release(&self);
}

/// Media engine factory
#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn devices(&self) -> Vec<DeviceInfo>;

    fn create_local_stream(
        &self,
        device: &DeviceInfo,
        config: &LocalStreamConfig,
    ) -> Result<LocalStream, EngineError>;

    /// Creates a session for `token`. Renderer callbacks for this session are
    /// sent on `renderer` until [`EngineSession::release`] is called.
    fn create_session(
        &self,
        token: &str,
        strategy: Arc<dyn Strategy>,
        renderer: mpsc::UnboundedSender<RendererEvent>,
    ) -> Result<Arc<dyn EngineSession>, EngineError>;
}
