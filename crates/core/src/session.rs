//! Cached upstream authentication state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Credential material for the upstream platform.
///
/// An API key and a cookie set are mutually exclusive; when both could be
/// configured, the API key wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Credential {
    ApiKey(String),
    /// Raw `Set-Cookie` pairs (`name=value`) captured at login.
    Cookies(Vec<String>),
}

impl Credential {
    /// Render the cookie set as a single `Cookie` header value.
    pub fn cookie_header(&self) -> Option<String> {
        match self {
            Credential::ApiKey(_) => None,
            Credential::Cookies(pairs) => Some(pairs.join("; ")),
        }
    }
}

/// A persisted upstream session: credential plus expiry.
///
/// Persisted on every refresh so a process restart can skip the login when
/// the session is still usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub credential: Credential,
    pub expires_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn new(credential: Credential, expires_at: DateTime<Utc>) -> Self {
        Self {
            credential,
            expires_at,
        }
    }

    /// A session is usable strictly before its expiry.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn validity_is_strict() {
        let s = StoredSession::new(
            Credential::ApiKey("k".to_string()),
            Utc::now() + Duration::hours(1),
        );
        assert!(s.is_valid(Utc::now()));
        assert!(!s.is_valid(s.expires_at));
        assert!(!s.is_valid(s.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let c = Credential::Cookies(vec!["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(c.cookie_header().as_deref(), Some("a=1; b=2"));
        assert!(Credential::ApiKey("k".to_string()).cookie_header().is_none());
    }
}
