use reqwest::Url;
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{Map, Value};

use crate::error::{ErrorResponse, TwinError};
use crate::types::EntityKind;

pub const DEFAULT_DAEMON_URL: &str = "http://localhost:7534";

pub struct Client {
    http: HttpClient,
    base_url: String,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        let base_url =
            std::env::var("TW_DAEMON").unwrap_or_else(|_| DEFAULT_DAEMON_URL.to_string());
        Self::with_base_url(base_url)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Client {
            http: HttpClient::new(),
            base_url,
        }
    }

    pub fn check_reachable(&self) -> Result<(), String> {
        match self.http.get(format!("{}/status", self.base_url)).send() {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("daemon returned status {}", resp.status())),
            Err(e) => Err(format!("cannot reach daemon at {}: {}", self.base_url, e)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn parse_error(resp: reqwest::blocking::Response) -> TwinError {
        let status = resp.status();
        match resp.json::<ErrorResponse>() {
            Ok(err_resp) => TwinError::Remote {
                code: err_resp.code.unwrap_or_else(|| "internal".to_string()),
                message: err_resp.message,
            },
            Err(_) => TwinError::Internal(format!("daemon returned status {status}")),
        }
    }

    /// Send a request and unwrap the `data` field of the success envelope.
    fn send(&self, req: RequestBuilder) -> Result<Value, TwinError> {
        let resp = req.send().map_err(|e| TwinError::Internal(e.to_string()))?;

        if resp.status().is_success() {
            let mut envelope: Value = resp
                .json()
                .map_err(|e| TwinError::Internal(e.to_string()))?;
            Ok(envelope["data"].take())
        } else {
            Err(Self::parse_error(resp))
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `/records/...` URL with each segment percent-encoded, so identifiers
    /// containing `/` or `?` stay inside their segment.
    fn records_url(&self, segments: &[&str]) -> Result<Url, TwinError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| TwinError::Internal(format!("invalid daemon url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| TwinError::Internal(format!("daemon url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push("records")
            .extend(segments);
        Ok(url)
    }

    pub fn status(&self) -> Result<Value, TwinError> {
        self.send(self.http.get(self.url("/status")))
    }

    pub fn kinds(&self) -> Result<Value, TwinError> {
        self.send(self.http.get(self.url("/kinds")))
    }

    pub fn create_record(
        &self,
        kind: EntityKind,
        data: &Map<String, Value>,
        actor: &str,
    ) -> Result<Value, TwinError> {
        let body = serde_json::json!({ "data": data, "actor": actor });
        let url = self.records_url(&[kind.as_str()])?;
        self.send(self.http.post(url).json(&body))
    }

    pub fn get_record(&self, kind: EntityKind, id: &str) -> Result<Value, TwinError> {
        let url = self.records_url(&[kind.as_str(), id])?;
        self.send(self.http.get(url))
    }

    pub fn list_records(&self, kind: EntityKind, limit: Option<usize>) -> Result<Value, TwinError> {
        let mut params = Vec::new();
        if let Some(l) = limit {
            params.push(("limit".to_string(), l.to_string()));
        }
        let url = self.records_url(&[kind.as_str()])?;
        self.send(self.http.get(url).query(&params))
    }

    pub fn update_record(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &Map<String, Value>,
        actor: &str,
    ) -> Result<Value, TwinError> {
        let body = serde_json::json!({ "data": patch, "actor": actor });
        let url = self.records_url(&[kind.as_str(), id])?;
        self.send(self.http.patch(url).json(&body))
    }

    pub fn next_id(&self, kind: EntityKind) -> Result<Value, TwinError> {
        let url = self.records_url(&[kind.as_str(), "next"])?;
        self.send(self.http.get(url))
    }

    pub fn record_history(&self, kind: EntityKind, id: &str) -> Result<Value, TwinError> {
        let url = self.records_url(&[kind.as_str(), id, "history"])?;
        self.send(self.http.get(url))
    }
}
