#![forbid(unsafe_code)]

// Session module - lifecycle of one media-engine join (one session generation)
pub mod engine;
pub mod participants;
pub mod stats;
pub mod strategy;

use crate::config::StageConfig;
use crate::stage::seats::{Seat, SeatClick, SeatTable};
use crate::stage::types::{MediaKind, StageMode};
use crate::stage::vote::{VoteEvent, VoteSession};
use engine::{
    CameraFacing, ConnectionState, EngineError, EngineParticipant, EngineSession, LocalStream,
    LocalStreamConfig, MediaEngine, RendererEvent, StatsTarget, StreamKind,
};
use futures_util::future::join_all;
use participants::{Participant, ParticipantRegistry};
use stats::{RtcMetric, StatsAggregator};
use std::sync::{Arc, Mutex, Weak};
use strategy::StagePolicy;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State of the media-engine join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Joined,
    Publishing,
}

/// Structured session event, one per engine callback at most
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    CreatorJoined(Participant),
    GuestJoined(Participant),
    CreatorUpdated(Participant),
    GuestUpdated(Participant),
    CreatorLeft(Participant),
    GuestLeft(Participant),
    LocalParticipantUpdated(Participant),
    /// The creator's own seat was bound locally and must be pushed to the REST API
    LocalSeatClaimed(Vec<Option<String>>),
    GuestSpeakingStateUpdated {
        participant_id: String,
        is_local: bool,
        speaking: bool,
    },
    StageGone,
}

/// Receiving ends of every event category a manager publishes. The
/// orchestrator attaches one listener task per field.
pub struct SessionChannels {
    pub events: mpsc::UnboundedReceiver<StageEvent>,
    pub speaking: mpsc::UnboundedReceiver<StageEvent>,
    pub rtc_self: watch::Receiver<Option<RtcMetric>>,
    pub rtc_list: watch::Receiver<Vec<RtcMetric>>,
    pub vote: mpsc::UnboundedReceiver<VoteEvent>,
}

/// Construction parameters of a manager
pub struct SessionParams {
    pub generation: u64,
    pub stage_id: String,
    pub kind: MediaKind,
    pub is_creator: bool,
    pub bitrate: u32,
    pub engine: Arc<dyn MediaEngine>,
    pub config: Arc<StageConfig>,
    pub cancel: CancellationToken,
}

/// Which side a non-local participant is on
enum Role {
    Local,
    Creator,
    Guest,
}

struct Inner {
    state: SessionState,
    mode: StageMode,
    session: Option<Arc<dyn EngineSession>>,
    registry: ParticipantRegistry,
    seats: SeatTable,
    creator_participant_id: Option<String>,
    local_participant_id: Option<String>,
    stats: StatsAggregator,
    dispatch: Option<JoinHandle<()>>,
    stats_poll: Option<JoinHandle<()>>,
}

/// Owns one engine session together with its participant registry, seat
/// table, stats aggregator and vote session.
pub struct StageManager {
    generation: u64,
    stage_id: String,
    kind: MediaKind,
    is_creator: bool,
    bitrate: u32,
    engine: Arc<dyn MediaEngine>,
    config: Arc<StageConfig>,
    policy: Arc<StagePolicy>,
    cancel: CancellationToken,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<StageEvent>,
    speaking: mpsc::UnboundedSender<StageEvent>,
    rtc_self: watch::Sender<Option<RtcMetric>>,
    rtc_list: watch::Sender<Vec<RtcMetric>>,
    vote: VoteSession,
}

impl StageManager {
    pub fn new(params: SessionParams) -> (Arc<Self>, SessionChannels) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (speaking_tx, speaking_rx) = mpsc::unbounded_channel();
        let (vote_tx, vote_rx) = mpsc::unbounded_channel();
        let (rtc_self_tx, rtc_self_rx) = watch::channel(None);
        let (rtc_list_tx, rtc_list_rx) = watch::channel(Vec::new());

        let seat_count = if params.kind == MediaKind::Audio {
            params.config.audio_seat_count
        } else {
            0
        };

        let manager = Arc::new(Self {
            generation: params.generation,
            stage_id: params.stage_id,
            kind: params.kind,
            is_creator: params.is_creator,
            bitrate: params.bitrate,
            engine: params.engine,
            policy: Arc::new(StagePolicy::new(params.is_creator, params.kind)),
            cancel: params.cancel,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                mode: StageMode::None,
                session: None,
                registry: ParticipantRegistry::new(),
                seats: SeatTable::new(seat_count),
                creator_participant_id: None,
                local_participant_id: None,
                stats: StatsAggregator::new(),
                dispatch: None,
                stats_poll: None,
            }),
            events: events_tx,
            speaking: speaking_tx,
            rtc_self: rtc_self_tx,
            rtc_list: rtc_list_tx,
            vote: VoteSession::new(
                params.config.vote_round_secs,
                params.config.vote_result_display,
                vote_tx,
            ),
            config: params.config,
        });

        let channels = SessionChannels {
            events: events_rx,
            speaking: speaking_rx,
            rtc_self: rtc_self_rx,
            rtc_list: rtc_list_rx,
            vote: vote_rx,
        };
        (manager, channels)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    pub fn vote(&self) -> &VoteSession {
        &self.vote
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn mode(&self) -> StageMode {
        self.lock().mode
    }

    pub fn local_participant_id(&self) -> Option<String> {
        self.lock().local_participant_id.clone()
    }

    pub fn creator_participant_id(&self) -> Option<String> {
        self.lock().creator_participant_id.clone()
    }

    pub fn participants(&self) -> Vec<Participant> {
        let inner = self.lock();
        inner
            .registry
            .remote()
            .chain(inner.registry.local())
            .cloned()
            .collect()
    }

    pub fn participant(&self, participant_id: &str) -> Option<Participant> {
        self.lock().registry.get(participant_id).cloned()
    }

    pub fn seats(&self) -> Vec<Seat> {
        self.lock().seats.seats().to_vec()
    }

    /// Joins the engine session. Renderer callbacks are dispatched from the
    /// moment the session exists, so none are lost while the join is pending.
    ///
    /// # Errors
    /// Returns an error if the manager is not idle, local devices are missing
    /// or the engine rejects the join
    pub async fn join(self: &Arc<Self>, token: &str) -> Result<(), EngineError> {
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Idle {
                return Err(EngineError::Join(format!("session already {:?}", inner.state)));
            }
            inner.state = SessionState::Joining;
        }
        info!("Joining stage {} (generation {})", self.stage_id, self.generation);

        if self.is_creator {
            match self.create_local_streams() {
                Ok(streams) => self.policy.participate(streams),
                Err(e) => {
                    self.lock().state = SessionState::Idle;
                    return Err(e);
                }
            }
        }

        let (renderer_tx, renderer_rx) = mpsc::unbounded_channel();
        let session = match self
            .engine
            .create_session(token, self.policy.clone(), renderer_tx)
        {
            Ok(session) => session,
            Err(e) => {
                self.policy.withdraw();
                self.lock().state = SessionState::Idle;
                return Err(e);
            }
        };

        let dispatch = tokio::spawn(Self::dispatch_task(
            renderer_rx,
            Arc::downgrade(self),
            self.cancel.clone(),
        ));
        {
            let mut inner = self.lock();
            inner.session = Some(session.clone());
            inner.dispatch = Some(dispatch);
        }

        let joined = tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Join("session superseded".to_string())),
            result = session.join() => result,
        };

        if let Err(e) = joined {
            warn!("Join of stage {} failed: {}", self.stage_id, e);
            self.leave();
            return Err(e);
        }

        let mut inner = self.lock();
        if inner.state != SessionState::Joining {
            // Torn down while the engine was connecting
            return Err(EngineError::Join("session left during join".to_string()));
        }
        inner.state = if self.is_creator {
            SessionState::Publishing
        } else {
            SessionState::Joined
        };
        info!("Joined stage {} as {:?}", self.stage_id, inner.state);
        Ok(())
    }

    /// Starts publishing local streams in `mode`
    ///
    /// # Errors
    /// Returns an error if the session is not joined or local devices are missing
    pub fn start_publishing(&self, mode: StageMode) -> Result<(), EngineError> {
        let state = self.state();
        if !matches!(state, SessionState::Joined | SessionState::Publishing) {
            return Err(EngineError::Join(format!("cannot publish while {:?}", state)));
        }
        if !self.policy.is_participating() {
            let streams = self.create_local_streams()?;
            self.policy.participate(streams);
        }
        self.lock().state = SessionState::Publishing;
        info!("Publishing on stage {} in mode {:?}", self.stage_id, mode);
        self.switch_mode(mode);
        Ok(())
    }

    /// Stops publishing and returns to mode None. The creator keeps its own
    /// streams; only the mode is reset.
    pub fn stop_publishing(&self) {
        if !self.is_creator {
            self.policy.withdraw();
            let mut inner = self.lock();
            if inner.state == SessionState::Publishing {
                inner.state = SessionState::Joined;
            }
        }
        self.switch_mode(StageMode::None);
    }

    /// Applies a mode change to the strategy and the vote session
    pub fn switch_mode(&self, mode: StageMode) {
        let (previous, session) = {
            let mut inner = self.lock();
            if inner.state == SessionState::Idle {
                return;
            }
            let previous = inner.mode;
            inner.mode = mode;
            (previous, inner.session.clone())
        };
        self.policy.set_mode(mode);
        if let Some(session) = session {
            session.refresh_strategy();
        }
        if previous != mode {
            debug!("Stage {} mode {:?} -> {:?}", self.stage_id, previous, mode);
            if mode == StageMode::Pk {
                self.vote.start_round();
            } else if previous == StageMode::Pk {
                self.vote.reset();
            }
        }
    }

    /// Reconciles seats against an authoritative assignment list. In audio
    /// rooms the creator's subscription follows seat occupancy.
    pub fn apply_seat_assignments(&self, assignments: &[Option<String>]) -> Vec<Seat> {
        let (seats, creator_mode) = {
            let mut inner = self.lock();
            let Inner { seats, registry, local_participant_id, .. } = &mut *inner;
            seats.apply_assignments(assignments, registry);
            let guests_seated = seats
                .assignments()
                .iter()
                .flatten()
                .any(|id| Some(id) != local_participant_id.as_ref());
            let creator_mode = if self.is_creator && self.kind == MediaKind::Audio {
                Some(if guests_seated { StageMode::GuestSpot } else { StageMode::None })
            } else {
                None
            };
            (seats.seats().to_vec(), creator_mode)
        };
        if let Some(mode) = creator_mode {
            if self.mode() != mode {
                self.switch_mode(mode);
            }
        }
        seats
    }

    /// Optimistic seat click by the local participant. Returns the outcome and
    /// the resulting assignments, or `None` before the engine has reported the
    /// local participant.
    pub fn click_seat(&self, index: usize) -> Option<(SeatClick, Vec<Option<String>>)> {
        let mut inner = self.lock();
        let local_id = inner.local_participant_id.clone()?;
        let Inner { seats, registry, .. } = &mut *inner;
        let click = seats.click(index, &local_id, registry);
        Some((click, seats.assignments()))
    }

    /// Whether the local participant currently occupies a seat
    pub fn is_locally_seated(&self) -> bool {
        let inner = self.lock();
        inner
            .local_participant_id
            .as_deref()
            .map_or(false, |id| inner.seats.seat_of(id).is_some())
    }

    /// Leaves the session: releases renderer listeners, leaves the engine and
    /// clears every per-session table. Safe to call in any state.
    pub fn leave(&self) {
        let (session, dispatch, stats_poll) = {
            let mut inner = self.lock();
            if inner.state == SessionState::Idle && inner.session.is_none() {
                return;
            }
            inner.state = SessionState::Idle;
            inner.mode = StageMode::None;
            inner.registry.clear();
            let seat_count = inner.seats.len();
            inner.seats = SeatTable::new(seat_count);
            inner.creator_participant_id = None;
            inner.local_participant_id = None;
            inner.stats.clear();
            (inner.session.take(), inner.dispatch.take(), inner.stats_poll.take())
        };

        if let Some(handle) = stats_poll {
            handle.abort();
        }
        if let Some(handle) = dispatch {
            handle.abort();
        }
        self.policy.withdraw();
        self.vote.reset();
        self.rtc_self.send_replace(None);
        self.rtc_list.send_replace(Vec::new());

        if let Some(session) = session {
            session.release();
            session.leave();
        }
        info!("Left stage {} (generation {})", self.stage_id, self.generation);
    }

    /// Cancels everything bound to this generation and leaves
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.leave();
    }

    fn create_local_streams(&self) -> Result<Vec<LocalStream>, EngineError> {
        let devices = self.engine.devices();
        let config = LocalStreamConfig {
            muted: false,
            max_bitrate: self.bitrate,
            simulcast: self.kind == MediaKind::Video,
        };

        let microphone = devices
            .iter()
            .find(|d| d.kind == StreamKind::Audio)
            .ok_or_else(|| EngineError::DeviceUnavailable("microphone".to_string()))?;
        let mut streams = vec![self.engine.create_local_stream(microphone, &config)?];

        if self.kind == MediaKind::Video {
            let cameras: Vec<_> = devices.iter().filter(|d| d.kind == StreamKind::Video).collect();
            let camera = cameras
                .iter()
                .find(|d| d.facing == Some(CameraFacing::Front))
                .or_else(|| cameras.first())
                .ok_or_else(|| EngineError::DeviceUnavailable("camera".to_string()))?;
            streams.push(self.engine.create_local_stream(camera, &config)?);
        }
        Ok(streams)
    }

    /// Background task that applies renderer callbacks in order.
    /// Uses a Weak reference so the task exits when the manager is dropped.
    async fn dispatch_task(
        mut rx: mpsc::UnboundedReceiver<RendererEvent>,
        weak_manager: Weak<StageManager>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(manager) = weak_manager.upgrade() else {
                break;
            };
            let gone = matches!(
                event,
                RendererEvent::ConnectionStateChanged { state: ConnectionState::Disconnected, .. }
            );
            manager.handle_renderer_event(event);
            if gone {
                break;
            }
        }
    }

    /// Applies one renderer callback and publishes at most one event for it.
    /// Callbacks arriving while idle belong to a torn-down session and are dropped.
    pub fn handle_renderer_event(&self, event: RendererEvent) {
        match event {
            RendererEvent::ConnectionStateChanged { state: ConnectionState::Disconnected, error } => {
                if self.state() == SessionState::Idle {
                    debug!("Disconnect for stage {} after teardown, ignoring", self.stage_id);
                    return;
                }
                warn!(
                    "Stage {} disconnected{}",
                    self.stage_id,
                    error.map(|e| format!(": {e}")).unwrap_or_default()
                );
                let _ = self.events.send(StageEvent::StageGone);
                self.leave();
            }
            RendererEvent::ConnectionStateChanged { state, .. } => {
                debug!("Stage {} connection state {:?}", self.stage_id, state);
            }
            RendererEvent::Error { message } => {
                warn!("Engine error on stage {}: {}", self.stage_id, message);
            }
            RendererEvent::ParticipantJoined { participant } => {
                self.apply_participant_change(&participant, ChangeKind::Joined);
            }
            RendererEvent::ParticipantLeft { participant } => {
                self.apply_participant_change(&participant, ChangeKind::Left);
            }
            RendererEvent::StreamsAdded { participant, streams } => {
                self.apply_participant_change(&participant, ChangeKind::StreamsAdded(&streams));
            }
            RendererEvent::StreamsRemoved { participant, streams } => {
                self.apply_participant_change(&participant, ChangeKind::StreamsRemoved(&streams));
            }
            RendererEvent::StreamsMuted { participant, streams } => {
                self.apply_participant_change(&participant, ChangeKind::StreamsMuted(&streams));
            }
            RendererEvent::AudioStats { participant_id, stream_id, rms_db } => {
                self.apply_audio_level(&participant_id, &stream_id, rms_db);
            }
        }
    }

    fn apply_participant_change(&self, participant: &EngineParticipant, change: ChangeKind<'_>) {
        let event = {
            let mut inner = self.lock();
            if inner.state == SessionState::Idle {
                debug!("Dropping participant callback for torn-down stage {}", self.stage_id);
                return;
            }
            let role = self.classify(&mut inner, participant);
            let id = participant.participant_id.as_str();

            let event = match change {
                ChangeKind::Left => {
                    let removed = inner
                        .registry
                        .remove(id)
                        .unwrap_or_else(|| Participant {
                            participant_id: id.to_string(),
                            ..Participant::default()
                        });
                    inner.stats.retain_participants(|pid| pid != id);
                    match role {
                        Role::Local => None,
                        Role::Creator => {
                            inner.creator_participant_id = None;
                            Some(StageEvent::CreatorLeft(removed))
                        }
                        Role::Guest => Some(StageEvent::GuestLeft(removed)),
                    }
                }
                ChangeKind::Joined => {
                    let entry = inner.registry.upsert(participant).clone();
                    Some(match role {
                        Role::Local => StageEvent::LocalParticipantUpdated(entry),
                        Role::Creator => StageEvent::CreatorJoined(entry),
                        Role::Guest => StageEvent::GuestJoined(entry),
                    })
                }
                ChangeKind::StreamsAdded(streams) => {
                    let entry = inner.registry.add_streams(participant, streams).clone();
                    Some(Self::updated_event(role, entry))
                }
                ChangeKind::StreamsRemoved(streams) => {
                    let entry = inner.registry.remove_streams(participant, streams).clone();
                    Some(Self::updated_event(role, entry))
                }
                ChangeKind::StreamsMuted(streams) => {
                    let entry = inner.registry.mute_streams(participant, streams).clone();
                    Some(Self::updated_event(role, entry))
                }
            };

            let Inner { seats, registry, .. } = &mut *inner;
            seats.refresh(registry);
            event
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        if participant.is_local {
            self.claim_creator_seat();
        }
    }

    fn updated_event(role: Role, entry: Participant) -> StageEvent {
        match role {
            Role::Local => StageEvent::LocalParticipantUpdated(entry),
            Role::Creator => StageEvent::CreatorUpdated(entry),
            Role::Guest => StageEvent::GuestUpdated(entry),
        }
    }

    /// Local participant, the creator, or a guest. The creator is the first
    /// non-local participant declaring the stage id as its identity; once found
    /// it stays pinned until it leaves.
    fn classify(&self, inner: &mut Inner, participant: &EngineParticipant) -> Role {
        if participant.is_local {
            inner.local_participant_id = Some(participant.participant_id.clone());
            return Role::Local;
        }
        let pinned = inner.creator_participant_id.clone();
        match pinned.as_deref() {
            Some(creator) if creator == participant.participant_id => Role::Creator,
            Some(_) => Role::Guest,
            None if participant.user_id() == Some(self.stage_id.as_str()) => {
                inner.creator_participant_id = Some(participant.participant_id.clone());
                Role::Creator
            }
            None => Role::Guest,
        }
    }

    /// Seat 0 of a new audio room belongs to its creator
    fn claim_creator_seat(&self) {
        if !self.is_creator || self.kind != MediaKind::Audio {
            return;
        }
        let assignments = {
            let mut inner = self.lock();
            let Some(local_id) = inner.local_participant_id.clone() else {
                return;
            };
            let Inner { seats, registry, .. } = &mut *inner;
            if seats.seat_of(&local_id).is_some() || seats.seats().first().map_or(true, |s| !s.is_empty()) {
                return;
            }
            let mut assignments = seats.assignments();
            assignments[0] = Some(local_id);
            seats.apply_assignments(&assignments, registry);
            assignments
        };
        let _ = self.events.send(StageEvent::LocalSeatClaimed(assignments));
    }

    fn apply_audio_level(&self, participant_id: &str, stream_id: &str, rms_db: f32) {
        let update = {
            let mut inner = self.lock();
            if inner.state == SessionState::Idle {
                return;
            }
            let owner = inner
                .registry
                .get(participant_id)
                .or_else(|| inner.registry.find_stream_owner(stream_id))
                .map(|p| (p.participant_id.clone(), p.is_local, p.audio_muted));
            let Some((id, is_local, muted)) = owner else {
                return;
            };
            if muted {
                return;
            }
            let speaking = rms_db >= self.config.speaking_threshold_db;
            if !inner.registry.set_speaking(&id, speaking) {
                return;
            }
            let Inner { seats, registry, .. } = &mut *inner;
            seats.refresh(registry);
            StageEvent::GuestSpeakingStateUpdated {
                participant_id: id,
                is_local,
                speaking,
            }
        };
        let _ = self.speaking.send(update);
    }

    /// Pulls RTC stats once and republishes the derived metrics
    pub async fn request_rtc_stats(&self) {
        let (session, local_id, publishing, remotes) = {
            let inner = self.lock();
            let Some(session) = inner.session.clone() else {
                return;
            };
            let remotes: Vec<(String, Option<String>)> = inner
                .registry
                .remote()
                .filter(|p| !p.streams.is_empty())
                .map(|p| (p.participant_id.clone(), p.user_id.clone()))
                .collect();
            (
                session,
                inner.local_participant_id.clone(),
                inner.state == SessionState::Publishing,
                remotes,
            )
        };

        let local_reports = match (&local_id, publishing) {
            (Some(_), true) => match session.request_rtc_stats(StatsTarget::Local).await {
                Ok(reports) => reports,
                Err(e) => {
                    debug!("Local stats unavailable on stage {}: {}", self.stage_id, e);
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };
        let remote_reports = join_all(remotes.iter().map(|(id, _)| {
            let session = session.clone();
            let target = StatsTarget::Remote(id.clone());
            async move { session.request_rtc_stats(target).await }
        }))
        .await;

        let mut inner = self.lock();
        if self.cancel.is_cancelled() || inner.state == SessionState::Idle {
            return;
        }
        let Inner { stats, registry, .. } = &mut *inner;
        if let Some(local_id) = &local_id {
            for (kind, report) in &local_reports {
                stats.record_self(local_id, *kind, report);
            }
        }
        for ((id, user_id), result) in remotes.iter().zip(remote_reports) {
            match result {
                Ok(reports) => {
                    for (kind, report) in &reports {
                        stats.record_viewer(id, user_id.as_deref(), *kind, report);
                    }
                }
                Err(e) => debug!("Stats unavailable for participant {}: {}", id, e),
            }
        }
        stats.retain_participants(|pid| registry.get(pid).is_some());
        self.rtc_self.send_replace(stats.self_metric().cloned());
        self.rtc_list.send_replace(stats.viewer_metrics().to_vec());
    }

    /// Starts the self-rescheduling stats loop (delay measured from the end of
    /// each pull). Replaces a running loop.
    pub fn start_stats_polling(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.config.rtc_stats_interval;
        let handle = tokio::spawn(async move {
            loop {
                match weak.upgrade() {
                    Some(manager) => manager.request_rtc_stats().await,
                    None => break,
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        if let Some(previous) = self.lock().stats_poll.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_stats_polling(&self) {
        if let Some(handle) = self.lock().stats_poll.take() {
            handle.abort();
        }
    }
}

/// Participant callback being applied
enum ChangeKind<'a> {
    Joined,
    Left,
    StreamsAdded(&'a [engine::StreamInfo]),
    StreamsRemoved(&'a [engine::StreamInfo]),
    StreamsMuted(&'a [engine::StreamInfo]),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{audio_stream, remote_participant, local_participant, FakeEngine};

    fn manager(is_creator: bool, kind: MediaKind) -> (Arc<StageManager>, SessionChannels, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::default());
        let (manager, channels) = StageManager::new(SessionParams {
            generation: 1,
            stage_id: "alice".to_string(),
            kind,
            is_creator,
            bitrate: 1_000_000,
            engine: engine.clone(),
            config: Arc::new(StageConfig {
                audio_seat_count: 4,
                ..StageConfig::default()
            }),
            cancel: CancellationToken::new(),
        });
        (manager, channels, engine)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StageEvent>) -> Vec<StageEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_join_and_leave_state_machine() {
        let (manager, _channels, engine) = manager(false, MediaKind::Video);
        assert_eq!(manager.state(), SessionState::Idle);
        manager.join("token").await.unwrap();
        assert_eq!(manager.state(), SessionState::Joined);
        assert!(manager.join("token").await.is_err());

        manager.start_publishing(StageMode::GuestSpot).unwrap();
        assert_eq!(manager.state(), SessionState::Publishing);
        assert_eq!(manager.mode(), StageMode::GuestSpot);

        manager.stop_publishing();
        assert_eq!(manager.state(), SessionState::Joined);
        assert_eq!(manager.mode(), StageMode::None);

        manager.leave();
        assert_eq!(manager.state(), SessionState::Idle);
        let session = engine.last_session().unwrap();
        assert!(session.released());
        assert!(session.left());
    }

    #[tokio::test]
    async fn test_creator_publishes_on_join() {
        let (manager, _channels, _engine) = manager(true, MediaKind::Video);
        manager.join("token").await.unwrap();
        assert_eq!(manager.state(), SessionState::Publishing);
    }

    #[tokio::test]
    async fn test_one_event_per_callback_with_creator_detection() {
        let (manager, mut channels, _engine) = manager(false, MediaKind::Video);
        manager.join("token").await.unwrap();

        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: remote_participant("p-1", "alice"),
        });
        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: remote_participant("p-2", "bob"),
        });
        manager.handle_renderer_event(RendererEvent::StreamsAdded {
            participant: remote_participant("p-2", "bob"),
            streams: vec![audio_stream("a-2", false)],
        });
        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: local_participant("p-me"),
        });
        manager.handle_renderer_event(RendererEvent::ParticipantLeft {
            participant: remote_participant("p-2", "bob"),
        });

        let events = drain(&mut channels.events);
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], StageEvent::CreatorJoined(p) if p.participant_id == "p-1"));
        assert!(matches!(&events[1], StageEvent::GuestJoined(p) if p.participant_id == "p-2"));
        assert!(matches!(&events[2], StageEvent::GuestUpdated(p) if !p.audio_muted));
        assert!(matches!(&events[3], StageEvent::LocalParticipantUpdated(p) if p.is_local));
        assert!(matches!(&events[4], StageEvent::GuestLeft(p) if p.participant_id == "p-2"));
        assert_eq!(manager.creator_participant_id().as_deref(), Some("p-1"));
        assert_eq!(manager.local_participant_id().as_deref(), Some("p-me"));
    }

    #[tokio::test]
    async fn test_creator_pinned_to_first_match() {
        let (manager, mut channels, _engine) = manager(false, MediaKind::Video);
        manager.join("token").await.unwrap();
        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: remote_participant("p-1", "alice"),
        });
        // Same declared identity, different engine id: treated as a guest
        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: remote_participant("p-9", "alice"),
        });
        let events = drain(&mut channels.events);
        assert!(matches!(&events[1], StageEvent::GuestJoined(p) if p.participant_id == "p-9"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (manager, mut channels, _engine) = manager(false, MediaKind::Audio);
        manager.join("token").await.unwrap();
        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: remote_participant("p-1", "alice"),
        });
        drain(&mut channels.events);

        let disconnected = RendererEvent::ConnectionStateChanged {
            state: ConnectionState::Disconnected,
            error: None,
        };
        manager.handle_renderer_event(disconnected.clone());
        let after_first = (manager.state(), manager.participants(), manager.seats());
        manager.handle_renderer_event(disconnected);
        let after_second = (manager.state(), manager.participants(), manager.seats());

        assert_eq!(drain(&mut channels.events), vec![StageEvent::StageGone]);
        assert_eq!(after_first, after_second);
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(manager.participants().is_empty());
    }

    #[tokio::test]
    async fn test_callbacks_after_leave_are_dropped() {
        let (manager, mut channels, _engine) = manager(false, MediaKind::Video);
        manager.join("token").await.unwrap();
        manager.leave();
        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: remote_participant("p-1", "alice"),
        });
        assert!(drain(&mut channels.events).is_empty());
        assert!(manager.participants().is_empty());
    }

    #[tokio::test]
    async fn test_speaking_flips_only_when_unmuted() {
        let (manager, mut channels, _engine) = manager(false, MediaKind::Audio);
        manager.join("token").await.unwrap();
        let bob = remote_participant("p-2", "bob");
        manager.handle_renderer_event(RendererEvent::StreamsAdded {
            participant: bob.clone(),
            streams: vec![audio_stream("a-2", false)],
        });
        let level = |rms_db| RendererEvent::AudioStats {
            participant_id: "p-2".to_string(),
            stream_id: "a-2".to_string(),
            rms_db,
        };

        manager.handle_renderer_event(level(-20.0));
        manager.handle_renderer_event(level(-18.0));
        manager.handle_renderer_event(level(-70.0));
        manager.handle_renderer_event(RendererEvent::StreamsMuted {
            participant: bob,
            streams: vec![audio_stream("a-2", true)],
        });
        manager.handle_renderer_event(level(-10.0));

        let speaking: Vec<bool> = drain(&mut channels.speaking)
            .into_iter()
            .filter_map(|e| match e {
                StageEvent::GuestSpeakingStateUpdated { speaking, .. } => Some(speaking),
                _ => None,
            })
            .collect();
        assert_eq!(speaking, vec![true, false]);
    }

    #[tokio::test]
    async fn test_audio_creator_claims_seat_zero() {
        let (manager, mut channels, _engine) = manager(true, MediaKind::Audio);
        manager.join("token").await.unwrap();
        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: local_participant("p-me"),
        });
        let events = drain(&mut channels.events);
        assert!(events.contains(&StageEvent::LocalSeatClaimed(vec![
            Some("p-me".to_string()),
            None,
            None,
            None,
        ])));
        assert_eq!(manager.seats()[0].participant_id.as_deref(), Some("p-me"));

        // Guest seated: the creator starts subscribing
        manager.apply_seat_assignments(&[Some("p-me".to_string()), Some("p-2".to_string())]);
        assert_eq!(manager.mode(), StageMode::GuestSpot);
        manager.apply_seat_assignments(&[Some("p-me".to_string())]);
        assert_eq!(manager.mode(), StageMode::None);
    }

    #[tokio::test]
    async fn test_pk_mode_drives_vote() {
        let (manager, _channels, engine) = manager(false, MediaKind::Video);
        manager.join("token").await.unwrap();
        manager.start_publishing(StageMode::Pk).unwrap();
        assert_eq!(manager.vote().snapshot().phase, crate::stage::vote::VotePhase::Active);
        // The engine re-reads the subscription policy on every mode change
        assert_eq!(engine.last_session().unwrap().refreshes(), 1);
        manager.stop_publishing();
        assert_eq!(manager.vote().snapshot().phase, crate::stage::vote::VotePhase::Idle);
        assert_eq!(engine.last_session().unwrap().refreshes(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_generation_and_leaves() {
        let (manager, _channels, engine) = manager(false, MediaKind::Video);
        manager.join("token").await.unwrap();
        manager.shutdown();
        assert!(manager.cancel.is_cancelled());
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(engine.last_session().unwrap().left());
        assert!(engine.last_session().unwrap().released());
    }

    #[tokio::test]
    async fn test_rtc_stats_pull_publishes_metrics() {
        let (manager, channels, engine) = manager(false, MediaKind::Video);
        manager.join("token").await.unwrap();
        manager.handle_renderer_event(RendererEvent::ParticipantJoined {
            participant: local_participant("p-me"),
        });
        manager.handle_renderer_event(RendererEvent::StreamsAdded {
            participant: remote_participant("p-1", "alice"),
            streams: vec![audio_stream("a-1", false)],
        });
        manager.start_publishing(StageMode::GuestSpot).unwrap();
        engine.set_rtt(0.05);

        manager.request_rtc_stats().await;
        let viewers = channels.rtc_list.borrow().clone();
        assert_eq!(viewers.len(), 1);
        assert_eq!(viewers[0].participant_id, "p-1");
        assert_eq!(viewers[0].user_id.as_deref(), Some("alice"));
        let own = channels.rtc_self.borrow().clone().unwrap();
        assert!((own.latency_ms.unwrap() - 50.0).abs() < 1e-9);

        manager.leave();
        assert!(channels.rtc_list.borrow().is_empty());
    }
}
