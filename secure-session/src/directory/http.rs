//! HTTP key directory client
//!
//! Talks to `GET`/`PUT /api/users/{userId}/preKeyBundle?deviceId=N`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::{KeyDirectory, PublishedKeys};
use crate::address::PeerAddress;
use crate::crypto::x3dh::PreKeyBundle;
use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDirectory {
    pub fn new(base_url: &str) -> SessionResult<Self> {
        url::Url::parse(base_url).map_err(|e| SessionError::Config(format!("directory url: {}", e)))?;

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn bundle_url(&self, address: &PeerAddress) -> String {
        format!(
            "{}/api/users/{}/preKeyBundle?deviceId={}",
            self.base_url,
            urlencoding::encode(&address.name),
            address.device_id
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        address: &PeerAddress,
        response: Response,
    ) -> SessionResult<T> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(SessionError::BundleNotFound(address.to_string()));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SessionError::Directory(format!("API error ({}): {}", status, error_text)));
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| SessionError::MalformedBundle(e.to_string()))
    }
}

#[async_trait]
impl KeyDirectory for HttpDirectory {
    async fn publish(&self, keys: &PublishedKeys) -> SessionResult<()> {
        let address = keys.address();
        let request = self.authorize(self.client.put(self.bundle_url(&address)).json(keys));
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SessionError::Directory(format!("API error ({}): {}", status, error_text)));
        }

        tracing::info!(
            peer = %address,
            one_time_pre_keys = keys.one_time_pre_keys.len(),
            "Published keys to directory"
        );
        Ok(())
    }

    async fn fetch(&self, address: &PeerAddress) -> SessionResult<PreKeyBundle> {
        let request = self.authorize(self.client.get(self.bundle_url(address)));
        let response = request.send().await?;
        let bundle: PreKeyBundle = self.handle_response(address, response).await?;
        bundle.validate()?;
        Ok(bundle)
    }
}
