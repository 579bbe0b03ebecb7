//! HTTP client for the resource manager endpoints

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("API error ({status}): {body}")]
    Api { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Client for one resource manager endpoint
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(ClientError::Decode)?;

        let base_url = Url::parse(base_url).map_err(|source| ClientError::InvalidUrl {
            url: base_url.to_string(),
            source,
        })?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|source| ClientError::InvalidUrl {
                url: path.to_string(),
                source,
            })
    }

    /// GET `path`, decoding the body of any response with one of the
    /// `accepted` statuses besides success.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        accepted: &[StatusCode],
    ) -> Result<T, ClientError> {
        let url = self.url(path)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| ClientError::Request { url, source })?;

        let status = response.status();
        if !status.is_success() && !accepted.contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, body });
        }

        response.json().await.map_err(ClientError::Decode)
    }

    /// POST a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = self.url(path)?;
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|source| ClientError::Request { url, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, body });
        }

        response.json().await.map_err(ClientError::Decode)
    }
}
