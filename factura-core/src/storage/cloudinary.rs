use super::{ArtifactError, PdfStorage, StoredObject};
use crate::config::CloudinaryConfig;
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use reqwest::{Client, Url};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

const FOLDER: &str = "facturas-electronicas";
const PUBLIC_ID_PREFIX: &str = "facturas";
const DELIVERY_HOST: &str = "https://res.cloudinary.com";

/// Cloudinary `raw` resource storage via the signed upload API.
#[derive(Debug, Clone)]
pub struct CloudinaryStorage {
    config: CloudinaryConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct DestroyResponse {
    result: String,
}

impl CloudinaryStorage {
    pub fn new(config: CloudinaryConfig) -> Result<Self, ArtifactError> {
        if !config.is_complete() {
            return Err(ArtifactError::Config(
                "CLOUDINARY_CLOUD_NAME, CLOUDINARY_API_KEY and CLOUDINARY_API_SECRET are required"
                    .to_string(),
            ));
        }
        Ok(Self {
            config,
            client: Client::new(),
        })
    }

    fn endpoint(&self, action: &str) -> String {
        let base = if self.config.api_base_url.is_empty() {
            CloudinaryConfig::DEFAULT_API_BASE_URL
        } else {
            self.config.api_base_url.as_str()
        };
        format!(
            "{}/v1_1/{}/raw/{action}",
            base.trim_end_matches('/'),
            self.config.cloud_name
        )
    }

    fn signed_params(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        let signature = sign_params(&params, &self.config.api_secret);
        params.push(("api_key", self.config.api_key.clone()));
        params.push(("signature", signature));
        params
    }

    /// Recover the public id from a delivery URL such as
    /// `https://res.cloudinary.com/demo/raw/upload/v1712/facturas/x.pdf`.
    pub fn extract_public_id(url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let segments: Vec<&str> = url.path_segments()?.collect();
        let upload = segments.iter().position(|s| *s == "upload")?;
        // Skip the version segment after `upload`.
        let rest = segments.get(upload + 2..)?;
        if rest.is_empty() {
            return None;
        }
        let joined = rest.join("/");
        Some(joined.strip_suffix(".pdf").unwrap_or(&joined).to_string())
    }
}

/// Cloudinary request signature: SHA-1 hex of the parameters sorted by
/// name, joined as `k=v&k=v`, followed by the API secret.
pub fn sign_params(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    hex::encode(Sha1::digest(format!("{joined}{api_secret}").as_bytes()))
}

#[async_trait]
impl PdfStorage for CloudinaryStorage {
    async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<StoredObject, ArtifactError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let mut form = self.signed_params(vec![
            ("folder", FOLDER.to_string()),
            ("public_id", format!("{PUBLIC_ID_PREFIX}/{name}")),
            ("timestamp", timestamp),
        ]);
        form.push((
            "file",
            format!("data:application/pdf;base64,{}", Base64::encode_string(&bytes)),
        ));

        let response = self
            .client
            .post(self.endpoint("upload"))
            .form(&form)
            .send()
            .await
            .map_err(|e| ArtifactError::Upload(e.to_string()))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ArtifactError::Upload(format!("status {status}: {body}")));
        }
        let parsed: UploadResponse = serde_json::from_str(&body)
            .map_err(|e| ArtifactError::Upload(format!("invalid response: {e}: {body}")))?;
        debug!(public_id = %parsed.public_id, "PDF uploaded to Cloudinary");
        Ok(StoredObject {
            url: parsed.secure_url,
            public_id: parsed.public_id,
            size: parsed.bytes,
            provider: self.provider_name().to_string(),
        })
    }

    async fn delete(&self, public_id: &str) -> bool {
        let form = self.signed_params(vec![
            ("public_id", public_id.to_string()),
            ("timestamp", chrono::Utc::now().timestamp().to_string()),
        ]);
        let response = match self.client.post(self.endpoint("destroy")).form(&form).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(public_id, error = %e, "Cloudinary delete failed");
                return false;
            }
        };
        match response.json::<DestroyResponse>().await {
            Ok(parsed) if parsed.result == "ok" => true,
            Ok(parsed) => {
                warn!(public_id, result = %parsed.result, "Cloudinary did not delete file");
                false
            }
            Err(e) => {
                warn!(public_id, error = %e, "invalid Cloudinary delete response");
                false
            }
        }
    }

    fn public_url(&self, public_id: &str) -> String {
        format!(
            "{DELIVERY_HOST}/{}/raw/upload/{public_id}.pdf",
            self.config.cloud_name
        )
    }

    fn provider_name(&self) -> &'static str {
        "cloudinary"
    }
}
