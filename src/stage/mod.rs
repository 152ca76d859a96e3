#![forbid(unsafe_code)]

// Stage module - orchestrator reconciling REST polling, chat pushes and engine callbacks

pub mod list;
pub mod seats;
pub mod types;
pub mod vote;

use crate::api::{ApiResult, ConnectionCode, CreateStageRequest, StageApi, StageCredentials};
use crate::chat::{parse_frame, ChatEvent, ChatFrame, ChatMessage, ChatTransport};
use crate::config::StageConfig;
use crate::metrics::OrchestratorMetrics;
use crate::preferences::PreferenceStore;
use crate::session::engine::MediaEngine;
use crate::session::participants::ParticipantRegistry;
use crate::session::stats::RtcMetric;
use crate::session::{SessionChannels, SessionParams, SessionState, StageEvent, StageManager};
use anyhow::anyhow;
use list::StageList;
use seats::{SeatClick, SeatTable};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vote::{RoundResult, VoteEvent, VoteSnapshot, Winner};

pub use list::MergeOutcome;
pub use types::{MediaKind, ScrollDirection, Stage, StageError, StageMode, StageResult, VoteSide};

const NOTICE_CAPACITY: usize = 64;

/// Published stage list state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagesSnapshot {
    pub stages: Vec<Stage>,
    pub current_index: usize,
    pub joined_stage_id: Option<String>,
    /// Id of the live session generation
    pub generation: Option<u64>,
}

/// Transient UI notices that are not part of the stage list
#[derive(Debug, Clone, PartialEq)]
pub enum StageNotice {
    Message(ChatMessage),
    MessageDeleted { message_id: String },
    Reaction { sender_id: String, reaction: String },
    Notice(String),
    UserDisconnected { user_id: String, reason: Option<String> },
    /// The local user was removed from the stage
    Kicked { reason: Option<String> },
    /// A vote round ended; `result` is set when the local user was on a side
    VoteResolved { winner: Winner, result: Option<RoundResult> },
}

/// Injected collaborators
pub struct Collaborators {
    pub api: Arc<dyn StageApi>,
    pub chat: Arc<dyn ChatTransport>,
    pub engine: Arc<dyn MediaEngine>,
    pub preferences: Arc<dyn PreferenceStore>,
}

/// One session generation: a manager plus the listener tasks folding its events
struct Generation {
    id: u64,
    stage_id: String,
    manager: Arc<StageManager>,
    cancel: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
}

impl Generation {
    fn cancel_listeners(&mut self) {
        self.cancel.cancel();
        for handle in self.listeners.drain(..) {
            handle.abort();
        }
    }
}

struct State {
    list: StageList,
    generation: Option<Generation>,
    generation_seq: u64,
    join_seq: u64,
    join_job: Option<(String, JoinHandle<()>)>,
    /// Generation installed by a join that has not completed yet
    joining_generation: Option<u64>,
    /// A creator generation is being built; background joins wait
    creating: bool,
    refresh_job: Option<JoinHandle<()>>,
    feed_active: bool,
    collect_stats: bool,
}

/// Clears `State::creating` however `create_stage` ends
struct CreatingGuard<'a>(&'a StageRepository);

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().creating = false;
    }
}

struct Inner {
    api: Arc<dyn StageApi>,
    chat: Arc<dyn ChatTransport>,
    engine: Arc<dyn MediaEngine>,
    preferences: Arc<dyn PreferenceStore>,
    config: Arc<StageConfig>,
    metrics: OrchestratorMetrics,
    state: Mutex<State>,
    /// Serializes chat connect/disconnect across generations
    chat_lock: tokio::sync::Mutex<()>,
    snapshot: watch::Sender<StagesSnapshot>,
    vote: watch::Sender<VoteSnapshot>,
    rtc_self: watch::Sender<Option<RtcMetric>>,
    rtc_list: watch::Sender<Vec<RtcMetric>>,
    notices: broadcast::Sender<StageNotice>,
}

/// The stage orchestrator. Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct StageRepository {
    inner: Arc<Inner>,
}

impl StageRepository {
    pub fn new(collaborators: Collaborators, config: StageConfig, metrics: OrchestratorMetrics) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api: collaborators.api,
                chat: collaborators.chat,
                engine: collaborators.engine,
                preferences: collaborators.preferences,
                config: Arc::new(config),
                metrics,
                state: Mutex::new(State {
                    list: StageList::new(),
                    generation: None,
                    generation_seq: 0,
                    join_seq: 0,
                    join_job: None,
                    joining_generation: None,
                    creating: false,
                    refresh_job: None,
                    feed_active: false,
                    collect_stats: false,
                }),
                chat_lock: tokio::sync::Mutex::new(()),
                snapshot: watch::channel(StagesSnapshot::default()).0,
                vote: watch::channel(VoteSnapshot::default()).0,
                rtc_self: watch::channel(None).0,
                rtc_list: watch::channel(Vec::new()).0,
                notices,
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &State) {
        self.inner.snapshot.send_replace(StagesSnapshot {
            stages: state.list.stages().to_vec(),
            current_index: state.list.current_index(),
            joined_stage_id: state.list.joined_id().map(str::to_string),
            generation: state.generation.as_ref().map(|g| g.id),
        });
    }

    fn user_id(&self) -> Option<String> {
        self.inner.preferences.stage_id()
    }

    pub fn snapshot(&self) -> StagesSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StagesSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn subscribe_vote(&self) -> watch::Receiver<VoteSnapshot> {
        self.inner.vote.subscribe()
    }

    pub fn subscribe_rtc_self(&self) -> watch::Receiver<Option<RtcMetric>> {
        self.inner.rtc_self.subscribe()
    }

    pub fn subscribe_rtc_list(&self) -> watch::Receiver<Vec<RtcMetric>> {
        self.inner.rtc_list.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<StageNotice> {
        self.inner.notices.subscribe()
    }

    pub fn metrics(&self) -> &OrchestratorMetrics {
        &self.inner.metrics
    }

    /// Manager of the live generation
    pub fn current_manager(&self) -> Option<Arc<StageManager>> {
        self.lock().generation.as_ref().map(|g| g.manager.clone())
    }

    fn live(&self) -> Option<(u64, String, Arc<StageManager>)> {
        self.lock()
            .generation
            .as_ref()
            .map(|g| (g.id, g.stage_id.clone(), g.manager.clone()))
    }

    /// Manager of `generation` if it is still the live one. Stale lookups are
    /// counted as dropped events.
    fn live_manager(&self, generation: u64) -> Option<Arc<StageManager>> {
        let manager = self
            .lock()
            .generation
            .as_ref()
            .filter(|g| g.id == generation)
            .map(|g| g.manager.clone());
        if manager.is_none() {
            self.inner.metrics.inc_stale_events_dropped();
            debug!("Dropping event of stale generation {}", generation);
        }
        manager
    }

    /// Applies `apply` to the stage of `generation` and republishes. Events of
    /// any other generation are dropped.
    fn fold(&self, generation: u64, apply: impl FnOnce(&mut Stage, &StageManager)) -> bool {
        let mut state = self.lock();
        let live = state
            .generation
            .as_ref()
            .filter(|g| g.id == generation)
            .map(|g| (g.manager.clone(), g.stage_id.clone()));
        let Some((manager, stage_id)) = live else {
            drop(state);
            self.inner.metrics.inc_stale_events_dropped();
            debug!("Dropping event of stale generation {}", generation);
            return false;
        };
        if let Some(stage) = state.list.get_mut(&stage_id) {
            apply(stage, &manager);
        }
        self.inner.metrics.inc_events_folded();
        self.publish(&state);
        true
    }

    fn notify(&self, notice: StageNotice) {
        // No receivers is fine
        let _ = self.inner.notices.send(notice);
    }

    /// Times a REST call and counts its failure
    async fn rest<T>(&self, call: impl Future<Output = ApiResult<T>>) -> ApiResult<T> {
        let started = Instant::now();
        let result = call.await;
        self.inner.metrics.observe_rest_call(started.elapsed());
        if let Err(e) = &result {
            self.inner.metrics.inc_rest_failures();
            warn!("REST call failed: {}", e);
        }
        result
    }

    /// Moves the current stage with wraparound. Any in-flight join is canceled
    /// first; a join starts when the new current stage is not the joined one.
    pub fn scroll(&self, direction: ScrollDirection) -> Option<Stage> {
        let (current, pending) = {
            let mut state = self.lock();
            self.cancel_join(&mut state);
            let current = state.list.scroll(direction).cloned();
            self.publish(&state);
            (current, state.list.pending_join())
        };
        if let Some(stage) = &current {
            debug!("Scrolled {:?} to stage {}", direction, stage.stage_id);
        }
        if let Some(stage_id) = pending {
            self.spawn_join(stage_id);
        }
        current
    }

    fn cancel_join(&self, state: &mut State) {
        state.join_seq += 1;
        if let Some((stage_id, job)) = state.join_job.take() {
            if !job.is_finished() {
                job.abort();
                self.inner.metrics.inc_joins_canceled();
                info!("Canceled in-flight join of stage {}", stage_id);
            }
            if let Some(stage) = state.list.get_mut(&stage_id) {
                stage.is_loading = false;
            }
        }
        // The generation of a superseded join goes down with it
        if let Some(id) = state.joining_generation.take() {
            if state.generation.as_ref().map(|g| g.id) == Some(id) {
                self.teardown(state);
                self.reset_session_views();
                self.spawn_chat_disconnect();
            }
        }
    }

    /// Starts a background join of `stage_id`, replacing any other in-flight join
    fn spawn_join(&self, stage_id: String) {
        let mut state = self.lock();
        if state.creating {
            debug!("Not joining stage {} while a stage is being created", stage_id);
            return;
        }
        if let Some((target, job)) = &state.join_job {
            if *target == stage_id && !job.is_finished() {
                debug!("Join of stage {} already in flight", stage_id);
                return;
            }
        }
        self.cancel_join(&mut state);
        let seq = state.join_seq;
        if let Some(stage) = state.list.get_mut(&stage_id) {
            stage.is_loading = true;
        }
        self.publish(&state);

        let repo = self.clone();
        let target = stage_id.clone();
        let job = tokio::spawn(async move {
            if let Err(e) = repo.join_stage(&target, seq).await {
                warn!("Join of stage {} failed: {:?}", target, e);
            }
        });
        state.join_job = Some((stage_id, job));
    }

    /// Joins the current stage in place
    pub async fn join_current_stage(&self) -> StageResult<()> {
        let (stage_id, seq) = {
            let mut state = self.lock();
            let Some(stage_id) = state.list.current_id().map(str::to_string) else {
                return Err(StageError::JoinStage(anyhow!("no current stage")));
            };
            self.cancel_join(&mut state);
            if let Some(stage) = state.list.get_mut(&stage_id) {
                stage.is_loading = true;
            }
            self.publish(&state);
            (stage_id, state.join_seq)
        };
        self.join_stage(&stage_id, seq).await
    }

    async fn join_stage(&self, stage_id: &str, seq: u64) -> StageResult<()> {
        self.inner.metrics.inc_joins_started();
        let user_id = self
            .user_id()
            .ok_or_else(|| StageError::JoinStage(anyhow!("no local user id")))?;
        info!("Joining stage {} as {}", stage_id, user_id);

        let credentials = match self.rest(self.inner.api.join_stage(stage_id, &user_id)).await {
            Ok(credentials) => credentials,
            Err(e) => {
                self.inner.metrics.inc_joins_failed();
                self.clear_loading(stage_id);
                return Err(StageError::JoinStage(e.into()));
            }
        };
        if self.lock().join_seq != seq {
            debug!("Join of stage {} superseded", stage_id);
            return Ok(());
        }

        let kind = self
            .lock()
            .list
            .get(stage_id)
            .and_then(|s| s.kind)
            .unwrap_or(MediaKind::Video);
        match self.begin_generation(stage_id, kind, false, credentials, Some(seq)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.inner.metrics.inc_joins_failed();
                self.clear_loading(stage_id);
                Err(StageError::JoinStage(e))
            }
        }
    }

    fn clear_loading(&self, stage_id: &str) {
        let mut state = self.lock();
        if let Some(stage) = state.list.get_mut(stage_id) {
            stage.is_loading = false;
        }
        self.publish(&state);
    }

    /// Replaces the live generation. Old listeners are canceled first, the new
    /// manager is built and wired, and only then does the old manager leave.
    /// Returns false when the join was superseded along the way.
    async fn begin_generation(
        &self,
        stage_id: &str,
        kind: MediaKind,
        is_creator: bool,
        credentials: StageCredentials,
        join_seq: Option<u64>,
    ) -> anyhow::Result<bool> {
        let (old, manager, generation) = {
            let mut state = self.lock();
            match join_seq {
                Some(seq) if seq != state.join_seq => return Ok(false),
                Some(_) => {}
                // Creator generations supersede any background join
                None => self.cancel_join(&mut state),
            }

            let mut old = state.generation.take();
            if let Some(old) = old.as_mut() {
                old.cancel_listeners();
            }

            state.generation_seq += 1;
            let id = state.generation_seq;
            let cancel = CancellationToken::new();
            let bitrate = self
                .inner
                .preferences
                .bitrate()
                .unwrap_or(self.inner.config.default_bitrate);
            let (manager, channels) = StageManager::new(SessionParams {
                generation: id,
                stage_id: stage_id.to_string(),
                kind,
                is_creator,
                bitrate,
                engine: self.inner.engine.clone(),
                config: self.inner.config.clone(),
                cancel: cancel.clone(),
            });
            let listeners = self.attach_listeners(id, channels);
            state.generation = Some(Generation {
                id,
                stage_id: stage_id.to_string(),
                manager: manager.clone(),
                cancel,
                listeners,
            });
            state.joining_generation = join_seq.map(|_| id);

            if let Some(old) = &old {
                if state.list.joined_id() == Some(old.stage_id.as_str()) {
                    state.list.set_joined(None);
                }
                if let Some(stage) = state.list.get_mut(&old.stage_id) {
                    stage.clear_session_state();
                }
            }
            self.restart_refresh_loop(&mut state);
            self.publish(&state);
            (old, manager, id)
        };
        self.inner.metrics.inc_generations();
        self.reset_session_views();
        info!("Generation {} started for stage {}", generation, stage_id);

        if let Some(old) = old {
            old.manager.shutdown();
        }

        {
            let _chat = self.inner.chat_lock.lock().await;
            self.inner.chat.disconnect().await;
        }

        if let Err(e) = manager.join(&credentials.token).await {
            let mut state = self.lock();
            if state.generation.as_ref().map(|g| g.id) != Some(generation) {
                debug!("Generation {} superseded during engine join", generation);
                return Ok(false);
            }
            self.teardown(&mut state);
            self.publish(&state);
            return Err(anyhow::Error::new(e).context(format!("engine join of stage {stage_id}")));
        }
        if !self.is_live(generation) {
            return Ok(false);
        }

        let frames = {
            let _chat = self.inner.chat_lock.lock().await;
            self.inner
                .chat
                .connect(&credentials.chat_token, &credentials.region)
                .await
        };

        let mut state = self.lock();
        let Some(live) = state.generation.as_mut().filter(|g| g.id == generation) else {
            return Ok(false);
        };
        match frames {
            Ok(frames) => live.listeners.push(tokio::spawn(Self::chat_listener(
                Arc::downgrade(&self.inner),
                generation,
                frames,
            ))),
            Err(e) => warn!("Chat unavailable for stage {}: {}", stage_id, e),
        }
        if state.collect_stats {
            manager.start_stats_polling();
        }
        if state.joining_generation == Some(generation) {
            state.joining_generation = None;
        }
        state.list.set_joined(Some(stage_id.to_string()));
        if let Some(stage) = state.list.get_mut(stage_id) {
            stage.is_loading = false;
            if stage.is_audio() && !stage.seats.is_empty() {
                let assignments: Vec<Option<String>> =
                    stage.seats.iter().map(|s| s.participant_id.clone()).collect();
                stage.seats = manager.apply_seat_assignments(&assignments);
            } else if stage.is_audio() {
                stage.seats = manager.seats();
            }
        }
        self.publish(&state);
        info!("Joined stage {} (generation {})", stage_id, generation);
        Ok(true)
    }

    fn is_live(&self, generation: u64) -> bool {
        self.lock().generation.as_ref().map(|g| g.id) == Some(generation)
    }

    /// Takes down the live generation: listeners first, then the manager.
    /// Returns the id of the stage it was bound to.
    fn teardown(&self, state: &mut State) -> Option<String> {
        let mut generation = state.generation.take()?;
        generation.cancel_listeners();
        generation.manager.shutdown();
        if state.joining_generation == Some(generation.id) {
            state.joining_generation = None;
        }
        if state.list.joined_id() == Some(generation.stage_id.as_str()) {
            state.list.set_joined(None);
        }
        if let Some(stage) = state.list.get_mut(&generation.stage_id) {
            stage.clear_session_state();
        }
        info!("Generation {} torn down (stage {})", generation.id, generation.stage_id);
        Some(generation.stage_id)
    }

    fn reset_session_views(&self) {
        self.inner.vote.send_replace(VoteSnapshot::default());
        self.inner.rtc_self.send_replace(None);
        self.inner.rtc_list.send_replace(Vec::new());
    }

    /// Leaves the chat room unless a newer generation already owns it
    fn spawn_chat_disconnect(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let Some(repo) = Self::from_weak(&weak) else {
                return;
            };
            let _chat = repo.inner.chat_lock.lock().await;
            if repo.lock().generation.is_none() {
                repo.inner.chat.disconnect().await;
            }
        });
    }

    fn attach_listeners(&self, generation: u64, channels: SessionChannels) -> Vec<JoinHandle<()>> {
        let SessionChannels {
            events,
            speaking,
            rtc_self,
            rtc_list,
            vote,
        } = channels;
        let weak = Arc::downgrade(&self.inner);
        vec![
            tokio::spawn(Self::event_listener(weak.clone(), generation, events)),
            tokio::spawn(Self::event_listener(weak.clone(), generation, speaking)),
            tokio::spawn(Self::rtc_self_listener(weak.clone(), generation, rtc_self)),
            tokio::spawn(Self::rtc_list_listener(weak.clone(), generation, rtc_list)),
            tokio::spawn(Self::vote_listener(weak, generation, vote)),
        ]
    }

    /// Folds one category of session events in receipt order.
    /// Uses a Weak reference so the task exits when the orchestrator is dropped.
    async fn event_listener(
        weak: Weak<Inner>,
        generation: u64,
        mut rx: mpsc::UnboundedReceiver<StageEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(repo) = Self::from_weak(&weak) else {
                break;
            };
            repo.fold_session_event(generation, event);
        }
    }

    async fn rtc_self_listener(
        weak: Weak<Inner>,
        generation: u64,
        mut rx: watch::Receiver<Option<RtcMetric>>,
    ) {
        while rx.changed().await.is_ok() {
            let metric = rx.borrow_and_update().clone();
            let Some(repo) = Self::from_weak(&weak) else {
                break;
            };
            if repo.live_manager(generation).is_some() {
                repo.inner.rtc_self.send_replace(metric);
            }
        }
    }

    async fn rtc_list_listener(
        weak: Weak<Inner>,
        generation: u64,
        mut rx: watch::Receiver<Vec<RtcMetric>>,
    ) {
        while rx.changed().await.is_ok() {
            let metrics = rx.borrow_and_update().clone();
            let Some(repo) = Self::from_weak(&weak) else {
                break;
            };
            if repo.live_manager(generation).is_some() {
                repo.inner.rtc_list.send_replace(metrics);
            }
        }
    }

    async fn vote_listener(weak: Weak<Inner>, generation: u64, mut rx: mpsc::UnboundedReceiver<VoteEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(repo) = Self::from_weak(&weak) else {
                break;
            };
            repo.fold_vote_event(generation, event);
        }
    }

    async fn chat_listener(weak: Weak<Inner>, generation: u64, mut rx: mpsc::UnboundedReceiver<ChatFrame>) {
        while let Some(frame) = rx.recv().await {
            let Some(repo) = Self::from_weak(&weak) else {
                break;
            };
            for event in parse_frame(frame) {
                repo.fold_chat_event(generation, event);
            }
        }
        debug!("Chat stream of generation {} ended", generation);
    }

    pub(crate) fn fold_session_event(&self, generation: u64, event: StageEvent) {
        match event {
            StageEvent::StageGone => self.handle_stage_gone(generation),
            StageEvent::LocalSeatClaimed(assignments) => {
                if self.fold(generation, |stage, manager| stage.seats = manager.seats()) {
                    self.spawn_seat_update(generation, assignments);
                }
            }
            event => {
                self.fold(generation, |stage, manager| apply_session_event(stage, manager, event));
            }
        }
    }

    fn handle_stage_gone(&self, generation: u64) {
        let pending = {
            let mut state = self.lock();
            if state.generation.as_ref().map(|g| g.id) != Some(generation) {
                drop(state);
                self.inner.metrics.inc_stale_events_dropped();
                debug!("Ignoring stage-gone of stale generation {}", generation);
                return;
            }
            // Also aborts the task running this fold; nothing below awaits
            let Some(stage_id) = self.teardown(&mut state) else {
                return;
            };
            warn!("Stage {} is gone", stage_id);
            state.list.remove(&stage_id);
            self.publish(&state);
            state.list.pending_join()
        };
        self.reset_session_views();
        self.spawn_chat_disconnect();
        if let Some(stage_id) = pending {
            self.spawn_join(stage_id);
        }
    }

    fn spawn_seat_update(&self, generation: u64, assignments: Vec<Option<String>>) {
        let target = self
            .lock()
            .generation
            .as_ref()
            .filter(|g| g.id == generation)
            .map(|g| (g.stage_id.clone(), g.cancel.clone()));
        let Some((stage_id, cancel)) = target else {
            return;
        };
        let repo = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("Seat update of generation {} canceled", generation),
                result = repo.rest(repo.inner.api.update_seats(&stage_id, &assignments)) => {
                    if let Err(e) = result {
                        warn!("Seat update for stage {} failed: {}", stage_id, e);
                    }
                }
            }
        });
    }

    fn fold_vote_event(&self, generation: u64, event: VoteEvent) {
        let Some(manager) = self.live_manager(generation) else {
            return;
        };
        self.inner.vote.send_replace(manager.vote().snapshot());
        if let VoteEvent::Resolved { winner, creator_score, participant_score } = event {
            let side = if manager.is_creator() {
                Some(VoteSide::Creator)
            } else if manager.state() == SessionState::Publishing {
                Some(VoteSide::Participant)
            } else {
                None
            };
            let result = side.and_then(|side| winner.result_for(side));
            info!(
                "Vote on stage {} resolved {}:{} ({:?})",
                manager.stage_id(),
                creator_score,
                participant_score,
                winner
            );
            self.notify(StageNotice::VoteResolved { winner, result });
        }
    }

    pub(crate) fn fold_chat_event(&self, generation: u64, event: ChatEvent) {
        let Some(manager) = self.live_manager(generation) else {
            return;
        };
        match event {
            ChatEvent::ModeChanged(mode) => {
                if mode == StageMode::None
                    && !manager.is_creator()
                    && manager.state() == SessionState::Publishing
                {
                    info!("Mode reset on stage {}, leaving guest spot", manager.stage_id());
                    manager.stop_publishing();
                } else {
                    manager.switch_mode(mode);
                }
                self.fold(generation, |stage, _| stage.mode = mode);
            }
            ChatEvent::SeatsChanged(assignments) => {
                let seats = manager.apply_seat_assignments(&assignments);
                self.follow_seat(&manager);
                self.fold(generation, |stage, _| stage.seats = seats);
            }
            ChatEvent::Vote { creator_score, participant_score, should_reset_score } => {
                manager
                    .vote()
                    .apply_scores(creator_score, participant_score, should_reset_score);
            }
            ChatEvent::VoteStart { started_at_ms } => {
                manager.vote().start_mid_round(elapsed_secs_since(started_at_ms));
            }
            ChatEvent::Message(message) => self.notify(StageNotice::Message(message)),
            ChatEvent::Notice(notice) => self.notify(StageNotice::Notice(notice)),
            ChatEvent::Reaction { sender_id, reaction } => {
                self.notify(StageNotice::Reaction { sender_id, reaction })
            }
            ChatEvent::MessageDeleted { message_id } => {
                self.notify(StageNotice::MessageDeleted { message_id })
            }
            ChatEvent::UserDisconnected { user_id, reason } => {
                if self.user_id().as_deref() == Some(user_id.as_str()) {
                    self.handle_kicked(generation, reason);
                } else {
                    self.notify(StageNotice::UserDisconnected { user_id, reason });
                }
            }
        }
    }

    /// Audio guests publish exactly while they hold a seat
    fn follow_seat(&self, manager: &StageManager) {
        if manager.kind() != MediaKind::Audio || manager.is_creator() {
            return;
        }
        match (manager.is_locally_seated(), manager.state()) {
            (true, SessionState::Joined) => {
                if let Err(e) = manager.start_publishing(manager.mode()) {
                    warn!("Could not publish on stage {}: {}", manager.stage_id(), e);
                }
            }
            (false, SessionState::Publishing) => manager.stop_publishing(),
            _ => {}
        }
    }

    fn handle_kicked(&self, generation: u64, reason: Option<String>) {
        {
            let mut state = self.lock();
            if state.generation.as_ref().map(|g| g.id) != Some(generation) {
                return;
            }
            if let Some(stage_id) = self.teardown(&mut state) {
                warn!("Removed from stage {}", stage_id);
            }
            self.publish(&state);
        }
        self.reset_session_views();
        self.spawn_chat_disconnect();
        self.notify(StageNotice::Kicked { reason });
    }

    /// Fetches the stage list and merges it into the feed
    pub async fn refresh_stages(&self) -> StageResult<MergeOutcome> {
        self.inner.metrics.inc_stage_refreshes();
        let snapshot = self
            .rest(self.inner.api.get_stages())
            .await
            .map_err(|e| StageError::GetStages(e.into()))?;

        let (outcome, pending, torn_down) = {
            let mut state = self.lock();
            let outcome = state.list.merge_snapshot(&snapshot);

            let mut torn_down = false;
            if outcome.joined_removed
                || state
                    .generation
                    .as_ref()
                    .map_or(false, |g| outcome.removed.contains(&g.stage_id))
            {
                torn_down = self.teardown(&mut state).is_some();
            }

            // Seats are reconciled for the current stage only
            let current_id = state.list.current_id().map(str::to_string);
            if let (Some(assignments), Some(current_id)) = (&outcome.current_seats, current_id) {
                let live = state
                    .generation
                    .as_ref()
                    .filter(|g| g.stage_id == current_id)
                    .map(|g| g.manager.clone());
                let seats = match live {
                    Some(manager) => manager.apply_seat_assignments(assignments),
                    None => {
                        let mut table = SeatTable::new(self.inner.config.audio_seat_count);
                        table.apply_assignments(assignments, &mut ParticipantRegistry::new());
                        table.seats().to_vec()
                    }
                };
                if let Some(stage) = state.list.get_mut(&current_id).filter(|s| s.is_audio()) {
                    stage.seats = seats;
                }
            }

            self.publish(&state);
            (outcome, state.list.pending_join(), torn_down)
        };

        if !outcome.removed.is_empty() {
            info!("Stages removed by refresh: {:?}", outcome.removed);
        }
        if torn_down {
            self.reset_session_views();
            self.spawn_chat_disconnect();
        }
        if let Some(stage_id) = pending {
            self.spawn_join(stage_id);
        }
        Ok(outcome)
    }

    /// Restarts the self-rescheduling refresh loop for the live generation.
    /// The loop only runs while the feed and the stats view are both active
    /// and the local user is not the creator of the live stage.
    fn restart_refresh_loop(&self, state: &mut State) {
        if let Some(job) = state.refresh_job.take() {
            job.abort();
        }
        let creator = state
            .generation
            .as_ref()
            .map_or(false, |g| g.manager.is_creator());
        if !state.feed_active || !state.collect_stats || creator {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.stage_refresh_delay;
        state.refresh_job = Some(tokio::spawn(async move {
            loop {
                match Self::from_weak(&weak) {
                    Some(repo) => {
                        if let Err(e) = repo.refresh_stages().await {
                            warn!("Stage refresh failed: {:?}", e);
                        }
                    }
                    None => break,
                }
                tokio::time::sleep(delay).await;
            }
        }));
    }

    /// Turns the stage feed (and with it the refresh loop) on or off
    pub fn set_feed_active(&self, active: bool) {
        let mut state = self.lock();
        if state.feed_active == active {
            return;
        }
        state.feed_active = active;
        info!("Stage feed {}", if active { "active" } else { "inactive" });
        self.restart_refresh_loop(&mut state);
    }

    /// Turns the stats view on or off. It drives RTC stats collection of the
    /// live generation and gates the stage refresh loop.
    pub fn set_collect_stats(&self, collect: bool) {
        let manager = {
            let mut state = self.lock();
            if state.collect_stats != collect {
                state.collect_stats = collect;
                self.restart_refresh_loop(&mut state);
            }
            state.generation.as_ref().map(|g| g.manager.clone())
        };
        match manager {
            Some(manager) if collect && manager.state() != SessionState::Idle => {
                manager.start_stats_polling()
            }
            Some(manager) => manager.stop_stats_polling(),
            None => {}
        }
    }

    /// Creates a stage owned by the local user and joins it as creator
    pub async fn create_stage(&self, kind: MediaKind) -> StageResult<Stage> {
        let user_id = self
            .user_id()
            .ok_or_else(|| StageError::CreateStage(anyhow!("no local user id")))?;
        let avatar = self.inner.preferences.avatar();
        {
            let mut state = self.lock();
            self.cancel_join(&mut state);
            state.creating = true;
        }
        let _creating = CreatingGuard(self);

        let credentials = self
            .rest(self.inner.api.create_stage(CreateStageRequest {
                user_id,
                avatar: avatar.clone(),
                kind,
            }))
            .await
            .map_err(|e| StageError::CreateStage(e.into()))?;
        info!("Created {:?} stage {}", kind, credentials.stage_id);

        let stage_id = credentials.stage_id.clone();
        let mut stage = Stage::new(stage_id.clone(), kind);
        stage.is_stage_creator = true;
        stage.is_loading = true;
        stage.self_avatar = avatar.clone();
        stage.creator_avatar = avatar;
        {
            let mut state = self.lock();
            state.list.insert_created(stage);
            self.publish(&state);
        }

        self.begin_generation(&stage_id, kind, true, credentials, None)
            .await
            .map_err(|e| {
                self.clear_loading(&stage_id);
                StageError::CreateStage(e)
            })?;

        let created = self.lock().list.get(&stage_id).cloned();
        created.ok_or_else(|| StageError::CreateStage(anyhow!("stage {stage_id} vanished while joining")))
    }

    /// Starts publishing on the live stage in `mode`
    pub async fn start_publishing(&self, mode: StageMode) -> StageResult<()> {
        let (generation, stage_id, manager) = self
            .live()
            .ok_or_else(|| StageError::UpdateMode(anyhow!("no joined stage")))?;
        self.rest(self.inner.api.update_stage_mode(&stage_id, mode))
            .await
            .map_err(|e| StageError::UpdateMode(e.into()))?;
        if !self.is_live(generation) {
            return Err(StageError::UpdateMode(anyhow!("stage {stage_id} left meanwhile")));
        }
        manager
            .start_publishing(mode)
            .map_err(|e| StageError::UpdateMode(e.into()))?;
        self.fold(generation, |stage, _| stage.mode = mode);
        Ok(())
    }

    /// Stops publishing and resets the stage mode to None
    pub async fn stop_publishing(&self) -> StageResult<()> {
        let (generation, stage_id, manager) = self
            .live()
            .ok_or_else(|| StageError::UpdateMode(anyhow!("no joined stage")))?;
        self.rest(self.inner.api.update_stage_mode(&stage_id, StageMode::None))
            .await
            .map_err(|e| StageError::UpdateMode(e.into()))?;
        if self.is_live(generation) {
            manager.stop_publishing();
            self.fold(generation, |stage, _| stage.mode = StageMode::None);
        }
        Ok(())
    }

    /// Optimistic seat click in an audio room, followed by the REST seat update
    pub async fn click_seat(&self, index: usize) -> StageResult<SeatClick> {
        let (generation, stage_id, manager) = self
            .live()
            .ok_or_else(|| StageError::UpdateSeats(anyhow!("no joined stage")))?;
        if manager.kind() != MediaKind::Audio {
            return Err(StageError::UpdateSeats(anyhow!("stage {stage_id} has no seats")));
        }
        let (click, assignments) = manager
            .click_seat(index)
            .ok_or_else(|| StageError::UpdateSeats(anyhow!("local participant not known yet")))?;
        if matches!(click, SeatClick::Occupied(_) | SeatClick::OutOfRange(_)) {
            return Ok(click);
        }
        self.fold(generation, |stage, manager| stage.seats = manager.seats());

        self.rest(self.inner.api.update_seats(&stage_id, &assignments))
            .await
            .map_err(|e| StageError::UpdateSeats(e.into()))?;
        if self.is_live(generation) {
            self.follow_seat(&manager);
        }
        Ok(click)
    }

    /// Deletes the stage the local user created
    pub async fn delete_stage(&self) -> StageResult<()> {
        let (_, stage_id, manager) = self
            .live()
            .filter(|(_, _, manager)| manager.is_creator())
            .ok_or_else(|| StageError::DeleteStage(anyhow!("no owned stage")))?;
        self.rest(self.inner.api.delete_stage(&stage_id))
            .await
            .map_err(|e| StageError::DeleteStage(e.into()))?;
        {
            let mut state = self.lock();
            if state.generation.as_ref().map(|g| Arc::ptr_eq(&g.manager, &manager)) == Some(true) {
                self.teardown(&mut state);
            }
            state.list.remove(&stage_id);
            self.restart_refresh_loop(&mut state);
            self.publish(&state);
        }
        self.reset_session_views();
        self.disconnect_chat().await;
        info!("Deleted stage {}", stage_id);
        Ok(())
    }

    /// Removes the current guest from the creator's stage
    pub async fn kick_participant(&self) -> StageResult<()> {
        let (generation, stage_id, manager) = self
            .live()
            .filter(|(_, _, manager)| manager.is_creator())
            .ok_or_else(|| StageError::KickParticipant(anyhow!("no owned stage")))?;
        let guest = self
            .lock()
            .list
            .get(&stage_id)
            .and_then(|s| s.guest_participant_id.clone())
            .and_then(|id| manager.participant(&id))
            .ok_or_else(|| StageError::KickParticipant(anyhow!("no guest on stage {stage_id}")))?;
        let guest_user = guest
            .user_id
            .clone()
            .ok_or_else(|| StageError::KickParticipant(anyhow!("guest without user id")))?;

        self.rest(self.inner.api.disconnect_user(&stage_id, &guest_user))
            .await
            .map_err(|e| StageError::KickParticipant(e.into()))?;
        info!("Kicked {} from stage {}", guest_user, stage_id);
        if self.is_live(generation) {
            manager.switch_mode(StageMode::None);
            self.fold(generation, |stage, _| {
                stage.mode = StageMode::None;
                stage.guest_participant_id = None;
                stage.guest_avatar = None;
                stage.guest_audio_muted = false;
                stage.guest_video_off = false;
            });
        }
        Ok(())
    }

    /// Casts a vote for `side` in the running round
    pub async fn cast_vote(&self, side: VoteSide) -> StageResult<()> {
        let (generation, stage_id, manager) = self
            .live()
            .ok_or_else(|| StageError::CastVote(anyhow!("no joined stage")))?;
        self.rest(self.inner.api.cast_vote(&stage_id, side))
            .await
            .map_err(|e| StageError::CastVote(e.into()))?;
        if self.is_live(generation) {
            manager.vote().record_local_vote(side);
        }
        Ok(())
    }

    /// Leaves the joined stage. Calling it with nothing joined is a no-op.
    pub async fn disconnect_from_current_stage(&self) -> StageResult<()> {
        let Some((_, stage_id, _)) = self.live() else {
            debug!("Disconnect requested with no joined stage");
            return Ok(());
        };
        let user_id = self
            .user_id()
            .ok_or_else(|| StageError::LeaveStage(anyhow!("no local user id")))?;

        let result = self
            .rest(self.inner.api.disconnect_user(&stage_id, &user_id))
            .await
            .map_err(|e| StageError::LeaveStage(e.into()));
        {
            let mut state = self.lock();
            self.cancel_join(&mut state);
            if state.generation.as_ref().map(|g| g.stage_id == stage_id) == Some(true) {
                self.teardown(&mut state);
            }
            self.publish(&state);
        }
        self.reset_session_views();
        self.disconnect_chat().await;
        info!("Disconnected from stage {}", stage_id);
        result
    }

    async fn disconnect_chat(&self) {
        let _chat = self.inner.chat_lock.lock().await;
        if self.lock().generation.is_none() {
            self.inner.chat.disconnect().await;
        }
    }

    /// Verifies a customer connection code and stores the returned credentials
    pub async fn verify_connection_code(&self, code: &str) -> StageResult<ConnectionCode> {
        let verified = self
            .rest(self.inner.api.verify_connection_code(code))
            .await
            .map_err(|e| StageError::CustomerCode(e.into()))?;
        self.inner
            .preferences
            .set_customer_code(Some(verified.customer_code.clone()));
        self.inner.preferences.set_api_key(Some(verified.api_key.clone()));
        info!("Connection code verified for customer {}", verified.customer_code);
        Ok(verified)
    }

    /// Cancels every job of the live generation and clears all feed state.
    /// Safe to call repeatedly.
    pub fn clear_resources(&self) {
        let torn_down = {
            let mut state = self.lock();
            self.cancel_join(&mut state);
            if let Some(job) = state.refresh_job.take() {
                job.abort();
            }
            state.feed_active = false;
            let torn_down = self.teardown(&mut state).is_some();
            state.list.clear();
            self.publish(&state);
            torn_down
        };
        self.reset_session_views();
        if torn_down {
            self.spawn_chat_disconnect();
            info!("Stage resources cleared");
        }
    }
}

/// Folds one structured session event into the joined stage
fn apply_session_event(stage: &mut Stage, manager: &StageManager, event: StageEvent) {
    match event {
        StageEvent::CreatorJoined(p) | StageEvent::CreatorUpdated(p) => {
            stage.creator_present = true;
            stage.creator_audio_muted = p.audio_muted;
            stage.creator_video_off = p.video_off;
            if p.avatar.is_some() {
                stage.creator_avatar = p.avatar;
            }
        }
        StageEvent::CreatorLeft(_) => {
            stage.creator_present = false;
        }
        StageEvent::GuestJoined(p) | StageEvent::GuestUpdated(p) => {
            // Audio guests show up on seats; video stages have one guest spot
            if !stage.is_audio() && !p.streams.is_empty() {
                stage.guest_participant_id = Some(p.participant_id);
                stage.guest_audio_muted = p.audio_muted;
                stage.guest_video_off = p.video_off;
                if p.avatar.is_some() {
                    stage.guest_avatar = p.avatar;
                }
            }
        }
        StageEvent::GuestLeft(p) => {
            if stage.guest_participant_id.as_ref() == Some(&p.participant_id) {
                stage.guest_participant_id = None;
                stage.guest_avatar = None;
                stage.guest_audio_muted = false;
                stage.guest_video_off = false;
            }
        }
        StageEvent::LocalParticipantUpdated(p) => {
            stage.self_audio_muted = p.audio_muted;
            stage.self_video_off = p.video_off;
            if p.avatar.is_some() {
                stage.self_avatar = p.avatar;
            }
        }
        StageEvent::GuestSpeakingStateUpdated { is_local, speaking, .. } => {
            if is_local {
                stage.local_speaking = speaking;
            }
        }
        StageEvent::LocalSeatClaimed(_) | StageEvent::StageGone => {}
    }
    if stage.is_audio() {
        stage.seats = manager.seats();
    }
}

/// Whole seconds since a unix-millisecond timestamp; 0 if the clock is behind
fn elapsed_secs_since(started_at_ms: i64) -> i64 {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(started_at_ms);
    now_ms.saturating_sub(started_at_ms).max(0) / 1000
}
