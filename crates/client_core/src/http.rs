//! REST seams: the paginated collection endpoint and the message API.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use shared::{
    error::SyncError,
    protocol::{CollectionResponse, HistoryResponse, Message, SendMessageRequest, SendMessageResponse},
};
use url::Url;

use crate::{
    channel::MessageApi,
    collection::CollectionEndpoint,
    credentials::{authorize, CredentialProvider},
};

pub struct HttpCollectionEndpoint {
    http: reqwest::Client,
    url: Url,
    headers: Vec<(String, String)>,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpCollectionEndpoint {
    pub fn new(url: Url, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            headers: Vec::new(),
            credentials,
        }
    }

    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Extra headers sent with every request, next to the bearer header.
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl<T> CollectionEndpoint<T> for HttpCollectionEndpoint
where
    T: DeserializeOwned + Send + 'static,
{
    async fn fetch(
        &self,
        params: &[(String, String)],
    ) -> Result<CollectionResponse<T>, SyncError> {
        let request = self.http.get(self.url.clone()).query(params);
        let request = authorize(request, &self.headers, self.credentials.as_ref()).await;
        read_json(request).await
    }
}

/// `GET {base}/messages` for history and `POST {base}/messages` as the send
/// path used while the realtime transport is down.
pub struct HttpMessageApi {
    http: reqwest::Client,
    base_url: String,
    headers: Vec<(String, String)>,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpMessageApi {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: Vec::new(),
            credentials,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn history(&self, limit: u32, before: Option<&str>) -> Result<HistoryResponse, SyncError> {
        let mut request = self
            .http
            .get(self.messages_url())
            .query(&[("limit", limit.to_string())]);
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }
        let request = authorize(request, &self.headers, self.credentials.as_ref()).await;
        read_json(request).await
    }

    async fn send(&self, payload: &SendMessageRequest) -> Result<Message, SyncError> {
        let request = self.http.post(self.messages_url()).json(payload);
        let request = authorize(request, &self.headers, self.credentials.as_ref()).await;
        let response: SendMessageResponse = read_json(request).await?;
        Ok(response.message)
    }
}

async fn read_json<R: DeserializeOwned>(request: RequestBuilder) -> Result<R, SyncError> {
    let response = request
        .send()
        .await
        .map_err(|err| SyncError::Network(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::from_status(status.as_u16(), body));
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| SyncError::Network(err.to_string()))?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
