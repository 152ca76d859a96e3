#![forbid(unsafe_code)]

// reqwest-backed implementation of the REST stage API

use super::{
    ApiError, ApiResult, ConnectionCode, CreateStageRequest, StageApi, StageCredentials,
    StageDetails, StageListResponse,
};
use crate::config::StageConfig;
use crate::preferences::PreferenceStore;
use crate::stage::types::{StageMode, VoteSide};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const API_KEY_HEADER: &str = "x-api-key";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// JSON-over-HTTP stage API client. The api key is read from the preference
/// store on every call so a freshly verified connection code takes effect
/// without rebuilding the client.
#[derive(Clone)]
pub struct HttpStageApi {
    http: Client,
    base_url: String,
    preferences: Arc<dyn PreferenceStore>,
}

impl HttpStageApi {
    /// Creates a client for the configured base URL
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built
    pub fn new(config: &StageConfig, preferences: Arc<dyn PreferenceStore>) -> ApiResult<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            preferences,
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let text = self.post_raw(path, body).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn post_raw<B>(&self, path: &str, body: &B) -> ApiResult<String>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let request_id = Uuid::new_v4().to_string();
        debug!("POST {} ({})", url, request_id);

        let mut request = self
            .http
            .post(&url)
            .header(REQUEST_ID_HEADER, &request_id)
            .json(body);
        if let Some(key) = self.preferences.api_key() {
            request = request.header(API_KEY_HEADER, key);
        }

        let res = request.send().await?;
        let status = res.status();
        let text = res.text().await?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(ApiError::UnexpectedStatus {
                status: status.as_u16(),
                body: text,
            })
        }
    }
}

#[async_trait]
impl StageApi for HttpStageApi {
    async fn create_stage(&self, request: CreateStageRequest) -> ApiResult<StageCredentials> {
        self.post("/create", &request).await
    }

    async fn join_stage(&self, stage_id: &str, user_id: &str) -> ApiResult<StageCredentials> {
        self.post("/join", &json!({ "stageId": stage_id, "userId": user_id })).await
    }

    async fn get_stages(&self) -> ApiResult<Vec<StageDetails>> {
        let list: StageListResponse = self.post("/list", &json!({})).await?;
        Ok(list.stages)
    }

    async fn update_seats(&self, stage_id: &str, seats: &[Option<String>]) -> ApiResult<()> {
        let seats: Vec<&str> = seats.iter().map(|s| s.as_deref().unwrap_or("")).collect();
        self.post_raw("/update/seats", &json!({ "stageId": stage_id, "seats": seats }))
            .await
            .map(|_| ())
    }

    async fn update_stage_mode(&self, stage_id: &str, mode: StageMode) -> ApiResult<()> {
        self.post_raw("/update/mode", &json!({ "stageId": stage_id, "mode": mode }))
            .await
            .map(|_| ())
    }

    async fn delete_stage(&self, stage_id: &str) -> ApiResult<()> {
        self.post_raw("/delete", &json!({ "stageId": stage_id }))
            .await
            .map(|_| ())
    }

    async fn cast_vote(&self, stage_id: &str, side: VoteSide) -> ApiResult<()> {
        self.post_raw("/castvote", &json!({ "stageId": stage_id, "vote": side }))
            .await
            .map(|_| ())
    }

    async fn verify_connection_code(&self, code: &str) -> ApiResult<ConnectionCode> {
        let verified: ConnectionCode = self.post("/verify", &json!({ "code": code })).await?;
        if verified.api_key.is_empty() {
            return Err(ApiError::Rejected("empty api key".to_string()));
        }
        Ok(verified)
    }

    async fn disconnect_user(&self, stage_id: &str, user_id: &str) -> ApiResult<()> {
        self.post_raw("/disconnect", &json!({ "stageId": stage_id, "userId": user_id }))
            .await
            .map(|_| ())
    }
}
