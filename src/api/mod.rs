#![forbid(unsafe_code)]

// REST stage API - request/response types and the client trait consumed by the orchestrator

pub mod http;

use crate::stage::types::{MediaKind, StageMode, VoteSide};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpStageApi;

/// Error returned by a REST call
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Result type alias for REST calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Request to create a new stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStageRequest {
    pub user_id: String,
    pub avatar: Option<String>,
    pub kind: MediaKind,
}

/// Credentials returned when creating or joining a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCredentials {
    pub stage_id: String,
    /// Media-engine participant token
    pub token: String,
    /// Chat room token
    pub chat_token: String,
    #[serde(default)]
    pub region: String,
}

/// One entry of the stage-list snapshot. The backend has been seen to return
/// entries without a stage id, so it is optional here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDetails {
    #[serde(default)]
    pub stage_id: Option<String>,
    pub kind: MediaKind,
    #[serde(default)]
    pub mode: StageMode,
    #[serde(default)]
    pub creator_avatar: Option<String>,
    #[serde(default)]
    pub guest_avatar: Option<String>,
    /// Seat occupancy by participant id; empty string marks an empty seat
    #[serde(default)]
    pub seats: Vec<String>,
}

impl StageDetails {
    /// Seat assignments with empty strings mapped to `None`.
    pub fn seat_assignments(&self) -> Vec<Option<String>> {
        self.seats
            .iter()
            .map(|id| if id.is_empty() { None } else { Some(id.clone()) })
            .collect()
    }
}

/// Stage list response body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageListResponse {
    #[serde(default)]
    pub stages: Vec<StageDetails>,
}

/// Result of verifying a customer connection code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCode {
    pub customer_code: String,
    pub api_key: String,
}

/// The REST stage API. Every call either returns its payload or an
/// [`ApiError`]; the orchestrator converts errors into typed failures.
#[async_trait]
pub trait StageApi: Send + Sync {
    async fn create_stage(&self, request: CreateStageRequest) -> ApiResult<StageCredentials>;

    async fn join_stage(&self, stage_id: &str, user_id: &str) -> ApiResult<StageCredentials>;

    async fn get_stages(&self) -> ApiResult<Vec<StageDetails>>;

    async fn update_seats(&self, stage_id: &str, seats: &[Option<String>]) -> ApiResult<()>;

    async fn update_stage_mode(&self, stage_id: &str, mode: StageMode) -> ApiResult<()>;

    async fn delete_stage(&self, stage_id: &str) -> ApiResult<()>;

    async fn cast_vote(&self, stage_id: &str, side: VoteSide) -> ApiResult<()>;

    async fn verify_connection_code(&self, code: &str) -> ApiResult<ConnectionCode>;

    async fn disconnect_user(&self, stage_id: &str, user_id: &str) -> ApiResult<()>;
}
