//! Contract with the SRI reception endpoint.
use crate::model::SriStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response from SRI: {0}")]
    InvalidResponse(String),
}

/// Reception result as reported by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SriResponse {
    pub estado: SriStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mensajes: Option<serde_json::Value>,
}

impl SriResponse {
    pub fn new(estado: impl Into<SriStatus>) -> Self {
        Self {
            estado: estado.into(),
            mensajes: None,
        }
    }

    pub fn with_messages(mut self, mensajes: serde_json::Value) -> Self {
        self.mensajes = Some(mensajes);
        self
    }

    pub fn is_received(&self) -> bool {
        self.estado == SriStatus::Recibida
    }
}

/// Submits signed documents to the authority.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn submit(&self, signed_xml: &str) -> Result<SriResponse, SubmissionError>;
}
