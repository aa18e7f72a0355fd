//! Glucose Client Seam
//!
//! What the session controller needs from a CGM cloud service, independent of
//! the concrete HTTP client.

use std::future::Future;

use crate::auth::Credentials;
use crate::model::{HistoryPoint, Reading};

/// Substring the upstream service uses when it rejects a login
const BAD_CREDENTIALS_MARKER: &str = "Bad credentials";

/// Result of one successful round trip to the service
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GlucoseData {
    /// Missing when the service answered without a current measurement
    pub current: Option<Reading>,
    pub history: Vec<HistoryPoint>,
}

/// Authenticates and reads the current value plus recent history
pub trait GlucoseClient: Send + Sync + 'static {
    fn read(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<GlucoseData, ClientError>> + Send;
}

/// Client errors, split by whether the user has to fix their credentials
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Classify an unstructured upstream message.
    ///
    /// Only for services that report failures as free text: the match on the
    /// "Bad credentials" wording breaks if the upstream ever rephrases it.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains(BAD_CREDENTIALS_MARKER) {
            ClientError::Authentication(message)
        } else {
            ClientError::Transport(message)
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}
