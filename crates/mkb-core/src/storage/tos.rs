//! Object storage client speaking the TOS REST API with V4 signatures.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{ObjectStore, StoredObject};
use crate::error::ClientError;
use crate::signing::{Credentials, SignableRequest, Signer, SigningScheme, canonical_query};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const LIST_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct TosConfig {
    /// Regional endpoint, e.g. `https://tos-cn-beijing.volces.com`.
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub credentials: Credentials,
    pub presign_expiry: Duration,
}

impl TosConfig {
    pub const DEFAULT_ENDPOINT: &str = "https://tos-cn-beijing.volces.com";
    pub const DEFAULT_REGION: &str = "cn-beijing";
    pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(3600);

    pub fn new(bucket: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            region: Self::DEFAULT_REGION.to_string(),
            bucket: bucket.into(),
            credentials,
            presign_expiry: Self::DEFAULT_PRESIGN_EXPIRY,
        }
    }
}

pub struct TosClient {
    http: Client,
    signer: Signer,
    url_scheme: String,
    /// Virtual-hosted bucket host: `<bucket>.<endpoint host>`.
    host: String,
    presign_expiry: Duration,
}

impl TosClient {
    pub fn new(config: TosConfig) -> Result<Self, ClientError> {
        if config.bucket.is_empty() {
            return Err(ClientError::Config("storage bucket is not set".to_string()));
        }
        let url = reqwest::Url::parse(&config.endpoint)
            .map_err(|e| ClientError::Config(format!("invalid endpoint {}: {e}", config.endpoint)))?;
        let endpoint_host = url.host_str().ok_or_else(|| {
            ClientError::Config(format!("endpoint has no host: {}", config.endpoint))
        })?;
        let host = match url.port() {
            Some(port) => format!("{}.{endpoint_host}:{port}", config.bucket),
            None => format!("{}.{endpoint_host}", config.bucket),
        };

        Ok(Self {
            http: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            signer: Signer::new(
                config.credentials,
                config.region,
                "tos",
                SigningScheme::TOS,
            ),
            url_scheme: url.scheme().to_string(),
            host,
            presign_expiry: config.presign_expiry,
        })
    }

    fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let path = format!("/{key}");
        let headers: Vec<(String, String)> = content_type
            .map(|ct| vec![("Content-Type".to_string(), ct.to_string())])
            .unwrap_or_default();
        let signed = self.signer.sign(
            &SignableRequest {
                method: method.as_str(),
                host: &self.host,
                path: &path,
                query,
                headers: &headers,
                body: &body,
            },
            Utc::now(),
        );

        let mut url = format!(
            "{}://{}{}",
            self.url_scheme,
            self.host,
            crate::signing::uri_encode(&path, false)
        );
        if !query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query(query));
        }

        let mut req = self.http.request(method, url);
        for (name, value) in headers.into_iter().chain(signed) {
            req = req.header(name, value);
        }
        req.body(body)
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status { status, body })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<ListedObject>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    last_modified: Option<String>,
}

#[async_trait]
impl ObjectStore for TosClient {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ClientError> {
        debug!(key, bytes = body.len(), "storing object");
        let response = self
            .request(Method::PUT, key, &[], body, Some(content_type))
            .send()
            .await?;
        error_for_status(response).await?;
        Ok(())
    }

    fn presigned_get_url(&self, key: &str) -> Result<String, ClientError> {
        Ok(self.signer.presign_url(
            "GET",
            &self.url_scheme,
            &self.host,
            &format!("/{key}"),
            self.presign_expiry,
            Utc::now(),
        ))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, ClientError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
                ("max-keys".to_string(), LIST_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self
                .request(Method::GET, "", &query, Vec::new(), None)
                .send()
                .await?;
            let page: ListObjectsOutput = error_for_status(response)
                .await?
                .json()
                .await
                .map_err(|e| ClientError::Decode(e.to_string()))?;

            objects.extend(
                page.contents
                    .into_iter()
                    .filter(|o| !o.key.ends_with('/'))
                    .map(|o| StoredObject::new(o.key, o.size, o.last_modified)),
            );

            if !page.is_truncated || page.next_continuation_token.is_empty() {
                break;
            }
            continuation = Some(page.next_continuation_token);
        }

        Ok(objects)
    }

    async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        let response = self
            .request(Method::HEAD, key, &[], Vec::new(), None)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        error_for_status(response).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), ClientError> {
        debug!(key, "deleting object");
        let response = self
            .request(Method::DELETE, key, &[], Vec::new(), None)
            .send()
            .await?;
        error_for_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TosConfig {
        TosConfig::new("mkb-files", Credentials::new("ak", "sk"))
    }

    #[test]
    fn host_is_virtual_hosted_bucket() {
        let client = TosClient::new(config()).unwrap();
        assert_eq!(client.host, "mkb-files.tos-cn-beijing.volces.com");
        assert_eq!(client.url_scheme, "https");
    }

    #[test]
    fn empty_bucket_is_rejected() {
        let mut cfg = config();
        cfg.bucket.clear();
        assert!(matches!(TosClient::new(cfg), Err(ClientError::Config(_))));
    }

    #[test]
    fn presigned_url_targets_object() {
        let client = TosClient::new(config()).unwrap();
        let url = client.presigned_get_url("uploads/u1/a b.pdf").unwrap();
        assert!(url.starts_with("https://mkb-files.tos-cn-beijing.volces.com/uploads/u1/a%20b.pdf?"));
        assert!(url.contains("X-Tos-Expires=3600"));
    }

    #[test]
    fn list_output_parses_pascal_case() {
        let out: ListObjectsOutput = serde_json::from_value(serde_json::json!({
            "Name": "mkb-files",
            "IsTruncated": true,
            "NextContinuationToken": "tok",
            "Contents": [
                {"Key": "uploads/u1/a.pdf", "Size": 42, "LastModified": "2024-01-02T03:04:05.000Z"}
            ]
        }))
        .unwrap();
        assert!(out.is_truncated);
        assert_eq!(out.next_continuation_token, "tok");
        assert_eq!(out.contents[0].key, "uploads/u1/a.pdf");
        assert_eq!(out.contents[0].size, 42);
    }
}
