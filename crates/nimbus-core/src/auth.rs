//! Authentication context shared by every item in a tree.
//!
//! Only the root item stores an [`Auth`]; everything else discovers it by
//! walking up the parent chain. The context is read-only once the tree is
//! built and is handed around as `Arc<Auth>`.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::time::SystemTime;

/// Bearer credentials for the remote drive API.
pub struct Auth {
    access_token: SecretString,
    /// Expiry of the access token, if the issuer reported one.
    pub expires_at: Option<SystemTime>,
}

impl Auth {
    /// Creates an auth context from an access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            expires_at: None,
        }
    }

    /// An auth context with no token.
    ///
    /// Passing this to identity resolution means "never talk to the server",
    /// which is what local-only items (or items known to have an ID) want.
    pub fn empty() -> Self {
        Self::new(String::new())
    }

    /// Sets the access token expiry.
    #[must_use]
    pub fn expiring_at(mut self, at: SystemTime) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Returns true when no access token is present.
    pub fn is_empty(&self) -> bool {
        self.access_token().is_empty()
    }

    /// The raw access token, for building request headers.
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// Returns true if the token has a known expiry that lies in the past.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= SystemTime::now())
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("access_token", &if self.is_empty() { "<empty>" } else { "<redacted>" })
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_auth() {
        assert!(Auth::empty().is_empty());
        assert!(Auth::default().is_empty());
        assert!(!Auth::new("token").is_empty());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let auth = Auth::new("super-secret");
        let debug = format!("{auth:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_expiry() {
        let past = SystemTime::now() - Duration::from_secs(60);
        let future = SystemTime::now() + Duration::from_secs(3600);
        assert!(Auth::new("t").expiring_at(past).is_expired());
        assert!(!Auth::new("t").expiring_at(future).is_expired());
        assert!(!Auth::new("t").is_expired());
    }
}
