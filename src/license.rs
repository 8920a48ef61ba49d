use crate::error::{ServiceError, ServiceResult};
use serde::Deserialize;
use std::{future::Future, time::Duration};

/// Verdict from the license registry for one API key.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseInfo {
    pub is_valid: bool,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub rate_limit_remaining: u64,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Consumed interface to the external license/registry service. The core
/// never implements licensing itself.
pub trait LicenseRegistry: Send + Sync {
    fn validate_license(
        &self,
        api_key: &str,
    ) -> impl Future<Output = ServiceResult<LicenseInfo>> + Send;

    fn consume_license_usage(&self, api_key: &str) -> impl Future<Output = ServiceResult<()>> + Send;
}

/// HTTP registry client. `POST {base}/validate` and `POST {base}/consume`
/// with a JSON body carrying the key.
pub struct HttpLicenseRegistry {
    base_url: String,
    http: reqwest::Client,
}

impl HttpLicenseRegistry {
    pub fn new(base_url: String, timeout: Duration) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| eyre::eyre!("failed to build http client: {e}"))?;
        Ok(Self { base_url, http })
    }
}

impl LicenseRegistry for HttpLicenseRegistry {
    async fn validate_license(&self, api_key: &str) -> ServiceResult<LicenseInfo> {
        let url = format!("{}/validate", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "apiKey": api_key }))
            .send()
            .await
            .map_err(|e| ServiceError::Transient(format!("license registry unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(ServiceError::Transient(format!(
                "license registry returned HTTP {}",
                resp.status()
            )));
        }

        resp.json::<LicenseInfo>()
            .await
            .map_err(|e| ServiceError::Transient(format!("bad license registry response: {e}")))
    }

    async fn consume_license_usage(&self, api_key: &str) -> ServiceResult<()> {
        let url = format!("{}/consume", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "apiKey": api_key }))
            .send()
            .await
            .map_err(|e| ServiceError::Transient(format!("license registry unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(ServiceError::Transient(format!(
                "license consume returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Allow-all registry for deployments without a license service and for
/// tests. Rejects only empty keys.
pub struct StaticRegistry;

impl LicenseRegistry for StaticRegistry {
    async fn validate_license(&self, api_key: &str) -> ServiceResult<LicenseInfo> {
        Ok(LicenseInfo {
            is_valid: !api_key.is_empty(),
            tier: "unmetered".to_string(),
            rate_limit_remaining: u64::MAX,
            expires_at: None,
        })
    }

    async fn consume_license_usage(&self, _api_key: &str) -> ServiceResult<()> {
        Ok(())
    }
}

/// Registry selection made once at startup from configuration.
pub enum Registry {
    Http(HttpLicenseRegistry),
    Static(StaticRegistry),
}

impl LicenseRegistry for Registry {
    async fn validate_license(&self, api_key: &str) -> ServiceResult<LicenseInfo> {
        match self {
            Registry::Http(r) => r.validate_license(api_key).await,
            Registry::Static(r) => r.validate_license(api_key).await,
        }
    }

    async fn consume_license_usage(&self, api_key: &str) -> ServiceResult<()> {
        match self {
            Registry::Http(r) => r.consume_license_usage(api_key).await,
            Registry::Static(r) => r.consume_license_usage(api_key).await,
        }
    }
}
