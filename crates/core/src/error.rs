use serde::{Deserialize, Serialize};

/// Errors surfaced by the engine. Every async operation reports failure
/// exclusively through one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum PaasError {
    /// Configuration or contract error carrying an HTTP-like domain code.
    #[error("{message}")]
    Domain { message: String, code: u16 },
    #[error("resource capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("quotas not compliant: {0}")]
    QuotasNotCompliant(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("already configured: {0}")]
    AlreadyConfigured(String),
    /// A process exit or a cluster rejection.
    #[error("{message}")]
    Execution { message: String, code: u16 },
}

pub type PaasResult<T> = Result<T, PaasError>;

impl PaasError {
    pub fn domain(message: impl Into<String>, code: u16) -> Self {
        Self::Domain { message: message.into(), code }
    }

    pub fn execution(message: impl Into<String>, code: u16) -> Self {
        Self::Execution { message: message.into(), code }
    }

    pub fn not_found(message: impl Into<String>) -> Self { Self::domain(message, 404) }

    pub fn code(&self) -> u16 {
        match self {
            Self::Domain { code, .. } | Self::Execution { code, .. } => *code,
            Self::CapacityExceeded(_) | Self::QuotasNotCompliant(_) => 400,
            Self::NotConfigured(_) | Self::AlreadyConfigured(_) => 500,
        }
    }

    /// Wrap any infrastructure error (kube, sqlite, io) at the core boundary.
    pub fn from_infra(err: impl std::fmt::Display) -> Self {
        Self::execution(err.to_string(), 500)
    }
}

impl From<std::io::Error> for PaasError {
    fn from(e: std::io::Error) -> Self { Self::from_infra(e) }
}

impl From<serde_json::Error> for PaasError {
    fn from(e: serde_json::Error) -> Self { Self::domain(format!("invalid json: {}", e), 400) }
}
