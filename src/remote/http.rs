use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::{NoteCreate, NoteUpdate, NotesRemote, RemoteError};
use crate::storage::{NoteId, NoteSnapshot, TreeSnapshot};

/// HTTP client for the notes API
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    /// Create a new client.
    ///
    /// `token` is sent as a bearer token; obtaining and refreshing it is the
    /// caller's business.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(RemoteError::Server {
                status: 0,
                message: format!("Invalid URL {:?}: must start with http:// or https://", base_url),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| from_reqwest(&e))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Build full URL for a path
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| from_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        let response = self.send(request).await?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| from_reqwest(&e))?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Server {
            status: status.as_u16(),
            message: format!("Unexpected response body: {}", e),
        })
    }
}

#[async_trait]
impl NotesRemote for HttpRemote {
    async fn create_note(&self, payload: &NoteCreate) -> Result<NoteSnapshot, RemoteError> {
        self.json(self.client.post(self.url("notes")).json(payload)).await
    }

    async fn update_note(&self, id: NoteId, payload: &NoteUpdate) -> Result<NoteSnapshot, RemoteError> {
        self.json(
            self.client
                .patch(self.url(&format!("notes/{}", id)))
                .json(payload),
        )
        .await
    }

    async fn delete_note(&self, id: NoteId) -> Result<(), RemoteError> {
        self.send(self.client.delete(self.url(&format!("notes/{}", id))))
            .await?;
        Ok(())
    }

    async fn get_tree(&self) -> Result<TreeSnapshot, RemoteError> {
        self.json(self.client.get(self.url("folders"))).await
    }

    async fn get_note(&self, id: NoteId) -> Result<NoteSnapshot, RemoteError> {
        self.json(self.client.get(self.url(&format!("notes/{}", id))))
            .await
    }
}

/// Map a transport-level failure onto the error taxonomy
fn from_reqwest(error: &reqwest::Error) -> RemoteError {
    if error.is_connect() || error.is_timeout() || error.is_request() {
        return RemoteError::Network(error.to_string());
    }
    match error.status() {
        Some(status) => classify_status(status, ""),
        None => RemoteError::classify_message(error.to_string()),
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
///
/// Gateway failures mean the API itself was not reached, so they count as
/// connectivity problems. The API reports rejections as `{"detail": "..."}`.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            RemoteError::Network(format!("{}: {}", status, message))
        }
        _ => RemoteError::Server {
            status: status.as_u16(),
            message,
        },
    }
}
