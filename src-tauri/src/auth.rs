//! Authentication Module
//!
//! The credential record persisted between runs and handed to the glucose client.

use serde::{Deserialize, Serialize};

/// LibreLinkUp account credentials plus the client protocol version to announce
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub protocol_version: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        protocol_version: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            protocol_version: protocol_version.into(),
        }
    }

    /// True when every field is filled in. Anything else is treated as no record at all.
    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty()
            && !self.password.is_empty()
            && !self.protocol_version.trim().is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}
