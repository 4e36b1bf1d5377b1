// ABOUTME: Stream-open authentication collaborator
// ABOUTME: Resolves a bearer credential into a principal and its permitted tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use table_watcher::TableSet;

use crate::error::AuthError;

/// Caller identity and the tables it may observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub scope: TableSet,
}

/// Checks a bearer credential once, when a stream is opened.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Principal, AuthError>;
}

/// Hex-encoded SHA-256 of a token, as stored in configuration.
pub fn token_digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// A configured token: only its digest is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub name: String,
    pub digest: String,
    pub scope: TableSet,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Authenticator backed by a fixed list of token digests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    grants: Vec<TokenGrant>,
}

impl StaticTokenAuthenticator {
    pub fn new(grants: Vec<TokenGrant>) -> Self {
        let grants = grants
            .into_iter()
            .map(|grant| TokenGrant {
                digest: grant.digest.trim().to_ascii_lowercase(),
                ..grant
            })
            .collect();
        Self { grants }
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    fn check(&self, credential: &str, now: DateTime<Utc>) -> Result<Principal, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        let digest = token_digest(credential);
        let grant = self
            .grants
            .iter()
            .find(|grant| digests_match(&grant.digest, &digest))
            .ok_or(AuthError::InvalidCredential)?;

        if grant.expires_at.is_some_and(|expires_at| expires_at <= now) {
            tracing::debug!(principal = %grant.name, "rejected expired credential");
            return Err(AuthError::ExpiredCredential);
        }
        Ok(Principal {
            name: grant.name.clone(),
            scope: grant.scope,
        })
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Principal, AuthError> {
        self.check(credential, Utc::now())
    }
}

fn digests_match(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len()
        && expected
            .bytes()
            .zip(actual.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(name: &str, token: &str, scope: &str) -> TokenGrant {
        TokenGrant {
            name: name.to_string(),
            digest: token_digest(token),
            scope: scope.parse().unwrap(),
            expires_at: None,
        }
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let digest = token_digest("registrar-secret");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn resolves_principal_scope() {
        let auth = StaticTokenAuthenticator::new(vec![
            grant("registrar", "reg-token", "students,enrollments"),
            grant("kiosk", "kiosk-token", "announcements"),
        ]);
        let principal = auth.authenticate("kiosk-token").await.unwrap();
        assert_eq!(principal.name, "kiosk");
        assert_eq!(principal.scope, "announcements".parse::<TableSet>().unwrap());
    }

    #[tokio::test]
    async fn rejects_unknown_and_missing_credentials() {
        let auth = StaticTokenAuthenticator::new(vec![grant("registrar", "reg-token", "*")]);
        assert_eq!(
            auth.authenticate("nope").await.unwrap_err(),
            AuthError::InvalidCredential
        );
        assert_eq!(
            auth.authenticate("   ").await.unwrap_err(),
            AuthError::MissingCredential
        );
    }

    #[test]
    fn rejects_expired_credentials() {
        let now = Utc::now();
        let mut expired = grant("old", "old-token", "*");
        expired.expires_at = Some(now - Duration::minutes(1));
        let mut current = grant("new", "new-token", "*");
        current.expires_at = Some(now + Duration::days(1));
        let auth = StaticTokenAuthenticator::new(vec![expired, current]);

        assert_eq!(
            auth.check("old-token", now).unwrap_err(),
            AuthError::ExpiredCredential
        );
        assert_eq!(auth.check("new-token", now).unwrap().name, "new");
    }

    #[test]
    fn accepts_uppercase_configured_digest() {
        let mut upper = grant("ops", "ops-token", "*");
        upper.digest = upper.digest.to_ascii_uppercase();
        let auth = StaticTokenAuthenticator::new(vec![upper]);
        assert!(auth.check("ops-token", Utc::now()).is_ok());
    }
}
