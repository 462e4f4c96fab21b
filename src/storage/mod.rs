//! Object storage access
//!
//! The pipeline consumes storage as a plain byte store: get by location,
//! put by location, existence check. `GcsClient` implements that over GCS
//! V4 signed URLs; tests substitute an in-memory store.

use crate::config::Config;
use crate::models::StorageLocation;
use crate::{Result, WorkerError};
use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client as HttpClient;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::fs;
use std::time::Duration;
use tracing::{debug, info};

/// Characters that must be percent-encoded in the path component
const PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const SIGNED_URL_EXPIRY: Duration = Duration::from_secs(300);

/// Byte-store capability consumed by the job processor.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, location: &StorageLocation) -> Result<Bytes>;
    async fn upload(
        &self,
        location: &StorageLocation,
        data: Bytes,
        content_type: &str,
    ) -> Result<()>;
    async fn exists(&self, location: &StorageLocation) -> Result<bool>;
}

/// GCS client using V4 signed URLs with service account credentials
pub struct GcsClient {
    client_email: String,
    private_key: RsaPrivateKey,
    host: String,
    http_client: HttpClient,
}

impl GcsClient {
    pub fn new(service_account_json: &str, host: &str) -> Result<Self> {
        #[derive(serde::Deserialize)]
        struct Sa {
            client_email: String,
            private_key: String,
        }
        let sa: Sa = serde_json::from_str(service_account_json)
            .map_err(|e| WorkerError::Storage(format!("Invalid service account JSON: {e}")))?;

        let private_key = RsaPrivateKey::from_pkcs8_pem(&sa.private_key).map_err(|e| {
            WorkerError::Storage(format!("Failed to parse service account private key: {e}"))
        })?;

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| WorkerError::Storage(format!("Failed to create HTTP client: {e}")))?;

        info!(host = %host, "GCS client initialized");

        Ok(Self {
            client_email: sa.client_email,
            private_key,
            host: host.to_string(),
            http_client,
        })
    }

    /// Create a new GCS client from configuration
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let raw_json = if let Some(ref inline) = cfg.gcs_service_account_json {
            inline.clone()
        } else if let Some(ref path) = cfg.gcs_service_account_json_path {
            fs::read_to_string(path).map_err(|e| {
                WorkerError::Storage(format!(
                    "Failed to read GCS service account JSON at {path}: {e}"
                ))
            })?
        } else {
            return Err(WorkerError::Storage(
                "GCS client requested but no service account JSON provided".into(),
            ));
        };

        Self::new(&raw_json, &cfg.gcs_host)
    }

    /// Generate a V4 signed URL for a given HTTP method
    fn sign_url(
        &self,
        method: &str,
        location: &StorageLocation,
        expires_in: Duration,
    ) -> Result<String> {
        let now = chrono::Utc::now();
        let datestamp = now.format("%Y%m%d").to_string();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();

        let credential_scope = format!("{datestamp}/auto/storage/goog4_request");
        let credential = format!("{}/{}", self.client_email, credential_scope);

        let encoded_object = utf8_percent_encode(&location.object, PATH_SET).to_string();
        let canonical_uri = format!(
            "/{}{}",
            location.bucket,
            if encoded_object.starts_with('/') {
                encoded_object
            } else {
                format!("/{}", encoded_object)
            }
        );

        let canonical_headers = format!("host:{}\n", self.host);
        let signed_headers = "host";

        let expires = expires_in.as_secs();
        let mut query_items = vec![
            ("X-Goog-Algorithm", "GOOG4-RSA-SHA256".to_string()),
            (
                "X-Goog-Credential",
                urlencoding::encode(&credential).into_owned(),
            ),
            ("X-Goog-Date", timestamp.clone()),
            ("X-Goog-Expires", expires.to_string()),
            ("X-Goog-SignedHeaders", signed_headers.to_string()),
        ];

        query_items.sort_by(|a, b| a.0.cmp(b.0));
        let canonical_query = query_items
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\nUNSIGNED-PAYLOAD"
        );
        let canonical_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign =
            format!("GOOG4-RSA-SHA256\n{timestamp}\n{credential_scope}\n{canonical_hash}");

        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key.sign(string_to_sign.as_bytes()).to_bytes();
        let signature_hex = hex::encode(signature);

        let query_with_sig = format!("{canonical_query}&X-Goog-Signature={signature_hex}");
        let url = format!(
            "https://{host}{canonical_uri}?{query_with_sig}",
            host = self.host
        );
        Ok(url)
    }

    /// Get the public URL for an object
    pub fn public_url(&self, location: &StorageLocation) -> String {
        format!(
            "https://storage.googleapis.com/{}/{}",
            location.bucket, location.object
        )
    }
}

#[async_trait]
impl ObjectStore for GcsClient {
    async fn download(&self, location: &StorageLocation) -> Result<Bytes> {
        let signed_url = self.sign_url("GET", location, SIGNED_URL_EXPIRY)?;

        debug!(location = %location, "Downloading from GCS");

        let response = self
            .http_client
            .get(&signed_url)
            .send()
            .await
            .map_err(|e| WorkerError::Storage(format!("GCS download failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Storage(format!(
                "GCS download of {location} failed with status {status}: {body}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| WorkerError::Storage(format!("Failed to read GCS response: {e}")))?;

        debug!(location = %location, size = bytes.len(), "Downloaded from GCS");
        Ok(bytes)
    }

    async fn upload(
        &self,
        location: &StorageLocation,
        data: Bytes,
        content_type: &str,
    ) -> Result<()> {
        let signed_url = self.sign_url("PUT", location, SIGNED_URL_EXPIRY)?;

        debug!(location = %location, size = data.len(), "Uploading to GCS");

        let response = self
            .http_client
            .put(&signed_url)
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| WorkerError::Storage(format!("GCS upload failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Storage(format!(
                "GCS upload to {location} failed with status {status}: {body}"
            )));
        }

        info!(location = %location, "Uploaded to GCS");
        Ok(())
    }

    async fn exists(&self, location: &StorageLocation) -> Result<bool> {
        let signed_url = self.sign_url("HEAD", location, SIGNED_URL_EXPIRY)?;

        match self.http_client.head(&signed_url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
