#![forbid(unsafe_code)]

// In-memory collaborators for tests: REST API, chat transport and media engine

use crate::api::{
    ApiError, ApiResult, ConnectionCode, CreateStageRequest, StageApi, StageCredentials,
    StageDetails,
};
use crate::chat::{ChatError, ChatFrame, ChatTransport};
use crate::session::engine::{
    CameraFacing, DeviceInfo, EngineError, EngineParticipant, EngineSession, LocalStream,
    LocalStreamConfig, MediaEngine, RawStat, RawStatsReport, RendererEvent, StatsTarget,
    Strategy, StreamInfo, StreamKind, ATTR_AVATAR, ATTR_USER_ID,
};
use crate::stage::types::{MediaKind, StageMode, VoteSide};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub fn remote_participant(participant_id: &str, user_id: &str) -> EngineParticipant {
    EngineParticipant {
        participant_id: participant_id.to_string(),
        is_local: false,
        attributes: HashMap::from([
            (ATTR_USER_ID.to_string(), user_id.to_string()),
            (ATTR_AVATAR.to_string(), format!("{user_id}.png")),
        ]),
    }
}

pub fn local_participant(participant_id: &str) -> EngineParticipant {
    EngineParticipant {
        participant_id: participant_id.to_string(),
        is_local: true,
        attributes: HashMap::new(),
    }
}

pub fn audio_stream(stream_id: &str, muted: bool) -> StreamInfo {
    StreamInfo {
        stream_id: stream_id.to_string(),
        kind: StreamKind::Audio,
        muted,
    }
}

pub fn stage_details(stage_id: &str, kind: MediaKind) -> StageDetails {
    StageDetails {
        stage_id: Some(stage_id.to_string()),
        kind,
        mode: StageMode::None,
        creator_avatar: None,
        guest_avatar: None,
        seats: Vec::new(),
    }
}

/// Polls `condition` while letting spawned tasks run
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn credentials(stage_id: &str) -> StageCredentials {
    StageCredentials {
        stage_id: stage_id.to_string(),
        token: format!("token-{stage_id}"),
        chat_token: format!("chat-{stage_id}"),
        region: "test".to_string(),
    }
}

/// REST API double. Calls are logged as `op:arg`; any call can be held open
/// with [`FakeApi::gate`].
#[derive(Default)]
pub struct FakeApi {
    stages: Mutex<Vec<StageDetails>>,
    calls: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeApi {
    pub fn set_stages(&self, stages: Vec<StageDetails>) {
        *self.stages.lock().unwrap() = stages;
    }

    /// Holds every `op:arg` call until the returned notify fires
    pub fn gate(&self, call: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(call.to_string(), gate.clone());
        gate
    }

    pub fn gate_join(&self, stage_id: &str) -> Arc<Notify> {
        self.gate(&format!("join:{stage_id}"))
    }

    /// Makes every call of `op` fail
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.calls()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    async fn record(&self, op: &'static str, arg: &str) -> ApiResult<()> {
        let call = format!("{op}:{arg}");
        let gate = self.gates.lock().unwrap().get(&call).cloned();
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(op) {
            return Err(ApiError::Rejected(format!("{op} refused")));
        }
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }
}

#[async_trait]
impl StageApi for FakeApi {
    async fn create_stage(&self, request: CreateStageRequest) -> ApiResult<StageCredentials> {
        self.record("create", &request.user_id).await?;
        Ok(credentials(&request.user_id))
    }

    async fn join_stage(&self, stage_id: &str, _user_id: &str) -> ApiResult<StageCredentials> {
        self.record("join", stage_id).await?;
        Ok(credentials(stage_id))
    }

    async fn get_stages(&self) -> ApiResult<Vec<StageDetails>> {
        self.record("list", "").await?;
        Ok(self.stages.lock().unwrap().clone())
    }

    async fn update_seats(&self, stage_id: &str, _seats: &[Option<String>]) -> ApiResult<()> {
        self.record("seats", stage_id).await
    }

    async fn update_stage_mode(&self, _stage_id: &str, mode: StageMode) -> ApiResult<()> {
        self.record("mode", mode.as_str()).await
    }

    async fn delete_stage(&self, stage_id: &str) -> ApiResult<()> {
        self.record("delete", stage_id).await
    }

    async fn cast_vote(&self, stage_id: &str, _side: VoteSide) -> ApiResult<()> {
        self.record("vote", stage_id).await
    }

    async fn verify_connection_code(&self, code: &str) -> ApiResult<ConnectionCode> {
        self.record("verify", code).await?;
        Ok(ConnectionCode {
            customer_code: code.to_string(),
            api_key: format!("key-{code}"),
        })
    }

    async fn disconnect_user(&self, _stage_id: &str, user_id: &str) -> ApiResult<()> {
        self.record("disconnect", user_id).await
    }
}

/// Chat transport double; frames pushed with [`FakeChat::push`] reach the
/// most recently connected room.
#[derive(Default)]
pub struct FakeChat {
    sender: Mutex<Option<mpsc::UnboundedSender<ChatFrame>>>,
    tokens: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
}

impl FakeChat {
    pub fn push(&self, frame: ChatFrame) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.sender.lock().unwrap().is_some()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChatTransport for FakeChat {
    async fn connect(
        &self,
        token: &str,
        _region: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChatFrame>, ChatError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        self.tokens.lock().unwrap().push(token.to_string());
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.sender.lock().unwrap().take();
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

/// Media engine double with a microphone and two cameras
#[derive(Default)]
pub struct FakeEngine {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    rtt: Arc<Mutex<f64>>,
    join_gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeEngine {
    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    /// Holds the engine join of the session created with `token`
    pub fn gate_join(&self, token: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.join_gates
            .lock()
            .unwrap()
            .insert(token.to_string(), gate.clone());
        gate
    }

    /// Round-trip time (seconds) reported by every stats pull
    pub fn set_rtt(&self, rtt: f64) {
        *self.rtt.lock().unwrap() = rtt;
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn devices(&self) -> Vec<DeviceInfo> {
        vec![
            DeviceInfo {
                device_id: "mic".to_string(),
                kind: StreamKind::Audio,
                facing: None,
            },
            DeviceInfo {
                device_id: "back".to_string(),
                kind: StreamKind::Video,
                facing: Some(CameraFacing::Back),
            },
            DeviceInfo {
                device_id: "front".to_string(),
                kind: StreamKind::Video,
                facing: Some(CameraFacing::Front),
            },
        ]
    }

    fn create_local_stream(
        &self,
        device: &DeviceInfo,
        config: &LocalStreamConfig,
    ) -> Result<LocalStream, EngineError> {
        Ok(LocalStream {
            stream_id: format!("local-{}", device.device_id),
            kind: device.kind,
            muted: config.muted,
        })
    }

    fn create_session(
        &self,
        token: &str,
        strategy: Arc<dyn Strategy>,
        renderer: mpsc::UnboundedSender<RendererEvent>,
    ) -> Result<Arc<dyn EngineSession>, EngineError> {
        let session = Arc::new(FakeSession {
            token: token.to_string(),
            strategy,
            renderer: Mutex::new(Some(renderer)),
            rtt: self.rtt.clone(),
            join_gate: self.join_gates.lock().unwrap().get(token).cloned(),
            left: AtomicBool::new(false),
            released: AtomicBool::new(false),
            refreshes: AtomicUsize::new(0),
            stats_pulls: AtomicUsize::new(0),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct FakeSession {
    pub token: String,
    pub strategy: Arc<dyn Strategy>,
    renderer: Mutex<Option<mpsc::UnboundedSender<RendererEvent>>>,
    rtt: Arc<Mutex<f64>>,
    join_gate: Option<Arc<Notify>>,
    left: AtomicBool,
    released: AtomicBool,
    refreshes: AtomicUsize,
    stats_pulls: AtomicUsize,
}

impl FakeSession {
    /// Delivers a renderer callback; false once listeners were released
    pub fn emit(&self, event: RendererEvent) -> bool {
        match self.renderer.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn left(&self) -> bool {
        self.left.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::Relaxed)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn stats_pulls(&self) -> usize {
        self.stats_pulls.load(Ordering::Relaxed)
    }

    fn report(&self) -> RawStatsReport {
        let rtt = *self.rtt.lock().unwrap();
        RawStatsReport::from([
            (
                "CP".to_string(),
                RawStat {
                    record_type: "candidate-pair".to_string(),
                    current_round_trip_time: Some(rtt),
                    ..RawStat::default()
                },
            ),
            (
                "IN".to_string(),
                RawStat {
                    record_type: "inbound-rtp".to_string(),
                    frames_per_second: Some(30.0),
                    packets_lost: Some(0),
                    ..RawStat::default()
                },
            ),
        ])
    }
}

#[async_trait]
impl EngineSession for FakeSession {
    async fn join(&self) -> Result<(), EngineError> {
        if let Some(gate) = &self.join_gate {
            gate.notified().await;
        }
        Ok(())
    }

    fn refresh_strategy(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    async fn request_rtc_stats(
        &self,
        _target: StatsTarget,
    ) -> Result<Vec<(StreamKind, RawStatsReport)>, EngineError> {
        self.stats_pulls.fetch_add(1, Ordering::Relaxed);
        Ok(vec![(StreamKind::Video, self.report())])
    }

    fn leave(&self) {
        self.left.store(true, Ordering::Relaxed);
    }

    fn release(&self) {
        self.released.store(true, Ordering::Relaxed);
        self.renderer.lock().unwrap().take();
    }
}
