//! 后端 HTTP API 客户端（`/api/v1`）
//!
//! 非 2xx 响应统一转成 [`Error::Api`]，消息优先取服务端的 `detail`。

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::store::ChatBackend;
use crate::types::{
    Category, ClassificationRequest, ClassificationResponse, CollectionCreate, CollectionInfo,
    CollectionStats, Document, DocumentChunk, EmbeddingModel, HealthReport, IndexingJob,
    IndexingRequest, Message, ModelValidation, SearchRequest, SearchResult, Session,
    SessionSettings, SessionUpdate, SystemStatus,
};
use crate::{Error, Result};

/// HTTP API 客户端
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

/// 列表接口可能直接返回数组，也可能包一层
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Plain(Vec<T>),
    Sessions { sessions: Vec<T> },
    Messages { messages: Vec<T> },
}

impl<T> ListBody<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListBody::Plain(v)
            | ListBody::Sessions { sessions: v }
            | ListBody::Messages { messages: v } => v,
        }
    }
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        tracing::debug!("➡️ {} {}", method, url);
        self.http.request(method, url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request(Method::GET, path).send().await?;
        decode(response).await
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.request(method, path).json(body).send().await?;
        decode(response).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self.request(Method::DELETE, path).send().await?;
        check(response).await.map(|_| ())
    }

    // ==================== 聊天会话 ====================

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let body: ListBody<Session> = self.get_json("chat/sessions").await?;
        Ok(body.into_vec())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.get_json(&format!("chat/sessions/{}", session_id)).await
    }

    pub async fn create_session(&self, settings: &SessionSettings) -> Result<Session> {
        self.send_json(Method::POST, "chat/sessions", settings).await
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        update: &SessionUpdate,
    ) -> Result<Session> {
        self.send_json(Method::PUT, &format!("chat/sessions/{}", session_id), update)
            .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.delete(&format!("chat/sessions/{}", session_id)).await
    }

    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let body: ListBody<Message> = self
            .get_json(&format!("chat/sessions/{}/messages", session_id))
            .await?;
        Ok(body.into_vec())
    }

    // ==================== 集合 ====================

    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        self.get_json("collections/").await
    }

    pub async fn create_collection(&self, request: &CollectionCreate) -> Result<CollectionInfo> {
        self.send_json(Method::POST, "collections/", request).await
    }

    pub async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        self.get_json(&format!("collections/{}/stats", name)).await
    }

    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        self.delete(&format!("collections/{}", name)).await
    }

    pub async fn available_models(&self) -> Result<Vec<EmbeddingModel>> {
        self.get_json("collections/models/available").await
    }

    pub async fn recommended_models(&self) -> Result<Vec<EmbeddingModel>> {
        self.get_json("collections/models/recommended").await
    }

    pub async fn validate_model(&self, model_name: &str) -> Result<ModelValidation> {
        let path = format!("collections/models/{}/validate", model_name);
        let response = self.request(Method::POST, &path).send().await?;
        decode(response).await
    }

    // ==================== 文档 / 索引 ====================

    pub async fn get_document(&self, document_id: i64) -> Result<Document> {
        self.get_json(&format!("documents/{}", document_id)).await
    }

    pub async fn document_chunks(&self, document_id: i64) -> Result<Vec<DocumentChunk>> {
        self.get_json(&format!("documents/{}/chunks", document_id))
            .await
    }

    /// 提交索引任务，进度可通过 [`crate::monitor::watch_indexing`] 订阅
    pub async fn start_indexing(&self, request: &IndexingRequest) -> Result<IndexingJob> {
        self.send_json(Method::POST, "indexing/", request).await
    }

    pub async fn indexing_jobs(&self) -> Result<Vec<IndexingJob>> {
        self.get_json("indexing/jobs").await
    }

    pub async fn indexing_job(&self, job_id: &str) -> Result<IndexingJob> {
        self.get_json(&format!("indexing/jobs/{}", job_id)).await
    }

    // ==================== 检索 / 系统 / 分类 ====================

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        self.send_json(Method::POST, "search/", request).await
    }

    pub async fn system_status(&self) -> Result<SystemStatus> {
        self.get_json("system/status").await
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.get_json("system/health").await
    }

    pub async fn categories(&self) -> Result<Vec<Category>> {
        self.get_json("classification/categories").await
    }

    pub async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassificationResponse> {
        self.send_json(Method::POST, "classification/classify", request)
            .await
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn list_sessions(&self) -> Result<Vec<Session>> {
        ApiClient::list_sessions(self).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Session> {
        ApiClient::get_session(self, session_id).await
    }

    async fn create_session(&self, settings: &SessionSettings) -> Result<Session> {
        ApiClient::create_session(self, settings).await
    }

    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<Session> {
        ApiClient::update_session(self, session_id, update).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        ApiClient::delete_session(self, session_id).await
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        ApiClient::list_messages(self, session_id).await
    }
}

/// 非 2xx 转成错误，否则原样返回
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let error = api_error(status, &body);
    tracing::warn!("❌ API 请求失败: {}", error);
    Err(error)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = check(response).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// 从错误响应体提取可读消息
///
/// 服务端的 `detail` 可能是字符串，也可能是校验错误列表 `[{msg, ...}]`。
fn api_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| extract_detail(&json))
        .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));

    Error::Api {
        status: status.as_u16(),
        message,
    }
}

fn extract_detail(json: &Value) -> Option<String> {
    match json.get("detail") {
        Some(Value::String(s)) => return Some(s.clone()),
        Some(Value::Array(items)) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(Value::as_str))
                .collect();
            if !messages.is_empty() {
                return Some(messages.join("; "));
            }
        }
        _ => {}
    }
    json.get("message").and_then(Value::as_str).map(str::to_string)
}
