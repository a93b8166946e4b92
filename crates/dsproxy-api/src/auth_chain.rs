//! Authentication chain
//!
//! Bearer tokens are tried against the key-set verifier first and, when
//! enabled, the TokenReview verifier second. ID tokens (`X-Id-Token`) are
//! only ever checked against the key set.

use std::sync::Arc;

use tracing::debug;

use crate::auth::{Identity, Verifier};
use crate::error::{Error, Result};

/// Ordered set of verifiers
pub struct AuthChain {
    /// Key-set verifier, also used for ID tokens
    jwks: Arc<dyn Verifier>,
    /// Optional TokenReview fallback for bearer tokens
    token_review: Option<Arc<dyn Verifier>>,
}

impl AuthChain {
    /// Chain with only the key-set verifier
    pub fn new(jwks: Arc<dyn Verifier>) -> Self {
        Self {
            jwks,
            token_review: None,
        }
    }

    /// Add a TokenReview fallback
    pub fn with_token_review(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.token_review = Some(verifier);
        self
    }

    /// Verify an `Authorization: Bearer` token.
    ///
    /// Returns the first success, or the last error.
    pub async fn verify_bearer(&self, token: &str) -> Result<Identity> {
        let mut last_error: Option<Error> = None;

        for verifier in std::iter::once(&self.jwks).chain(self.token_review.as_ref()) {
            match verifier.verify(token).await {
                Ok(identity) => {
                    debug!(
                        verifier = verifier.name(),
                        subject = %identity.subject,
                        "Bearer token verified"
                    );
                    return Ok(identity);
                }
                Err(e) => {
                    debug!(verifier = verifier.name(), error = %e, "Verifier rejected token");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Config("no verifiers configured".into())))
    }

    /// Verify an `X-Id-Token` header value
    pub async fn verify_id_token(&self, token: &str) -> Result<Identity> {
        self.jwks.verify(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockVerifier;

    fn identity(subject: &str) -> Identity {
        Identity {
            subject: subject.to_string(),
            ..Default::default()
        }
    }

    fn verifier(name: &'static str, result: fn() -> Result<Identity>) -> Arc<dyn Verifier> {
        let mut mock = MockVerifier::new();
        mock.expect_name().return_const(name);
        mock.expect_verify().returning(move |_| result());
        Arc::new(mock)
    }

    #[tokio::test]
    async fn first_success_wins() {
        let chain = AuthChain::new(verifier("jwks", || Ok(identity("alice"))))
            .with_token_review(verifier("token-review", || Ok(identity("sa"))));
        assert_eq!(chain.verify_bearer("t").await.unwrap().subject, "alice");
    }

    #[tokio::test]
    async fn falls_back_to_token_review() {
        let chain = AuthChain::new(verifier("jwks", || {
            Err(Error::Unauthenticated("bad signature".into()))
        }))
        .with_token_review(verifier("token-review", || Ok(identity("sa"))));
        assert_eq!(chain.verify_bearer("t").await.unwrap().subject, "sa");
    }

    #[tokio::test]
    async fn returns_last_error() {
        let chain = AuthChain::new(verifier("jwks", || {
            Err(Error::ServiceUnavailable("no keys".into()))
        }))
        .with_token_review(verifier("token-review", || {
            Err(Error::Unauthenticated("expired".into()))
        }));
        assert!(matches!(
            chain.verify_bearer("t").await,
            Err(Error::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn id_token_skips_token_review() {
        let chain = AuthChain::new(verifier("jwks", || {
            Err(Error::Unauthenticated("bad".into()))
        }))
        .with_token_review(verifier("token-review", || Ok(identity("sa"))));
        assert!(chain.verify_id_token("t").await.is_err());
    }
}
