//! Token verification via the Kubernetes TokenReview API
//!
//! Used as a fallback for bearer tokens the key-set verifier rejects, e.g.
//! projected ServiceAccount tokens. The API server checks the audience
//! requested here; the reviewed audiences are carried on the identity so the
//! pipeline's audience check applies uniformly.

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::{Api, Client};
use tracing::debug;

use crate::auth::{Identity, Verifier};
use crate::error::{Error, Result};

/// Verifies tokens by submitting them to the TokenReview API
pub struct TokenReviewVerifier {
    client: Client,
    audiences: Vec<String>,
}

impl TokenReviewVerifier {
    /// Create a verifier that requests review for `audiences`
    pub fn new(client: Client, audiences: Vec<String>) -> Self {
        Self { client, audiences }
    }
}

#[async_trait]
impl Verifier for TokenReviewVerifier {
    fn name(&self) -> &'static str {
        "token-review"
    }

    async fn verify(&self, token: &str) -> Result<Identity> {
        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: Some(self.audiences.clone()),
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| Error::Internal(format!("TokenReview API error: {}", e)))?;

        let status = result
            .status
            .ok_or_else(|| Error::Internal("TokenReview returned no status".into()))?;

        identity_from_status(&status, &self.audiences)
    }
}

/// Build an identity from a review status
///
/// `requested` is used when the API server does not echo audiences back.
fn identity_from_status(status: &TokenReviewStatus, requested: &[String]) -> Result<Identity> {
    if !status.authenticated.unwrap_or(false) {
        let reason = status
            .error
            .as_deref()
            .unwrap_or("token authentication failed");
        return Err(Error::Unauthenticated(reason.to_string()));
    }

    let user = status
        .user
        .as_ref()
        .ok_or_else(|| Error::Internal("TokenReview authenticated but no user info".into()))?;

    let subject = user
        .username
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::Internal("TokenReview user has no username".into()))?;

    let groups = user.groups.clone().unwrap_or_default();
    let audiences = status
        .audiences
        .clone()
        .unwrap_or_else(|| requested.to_vec());

    debug!(subject = %subject, groups = ?groups, "TokenReview validated token");

    Ok(Identity {
        subject,
        email: None,
        groups,
        audiences,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::authentication::v1::UserInfo;

    fn status(authenticated: bool, username: Option<&str>) -> TokenReviewStatus {
        TokenReviewStatus {
            authenticated: Some(authenticated),
            user: username.map(|u| UserInfo {
                username: Some(u.to_string()),
                groups: Some(vec![
                    "system:serviceaccounts".to_string(),
                    "system:serviceaccounts:monitoring".to_string(),
                ]),
                uid: None,
                extra: None,
            }),
            error: None,
            audiences: None,
        }
    }

    #[test]
    fn authenticated_status_yields_identity() {
        let identity = identity_from_status(
            &status(true, Some("system:serviceaccount:monitoring:grafana")),
            &["example-app".to_string()],
        )
        .unwrap();
        assert_eq!(identity.subject, "system:serviceaccount:monitoring:grafana");
        assert_eq!(identity.groups.len(), 2);
        assert!(identity.has_audience("example-app"));
    }

    #[test]
    fn reviewed_audiences_take_precedence() {
        let mut st = status(true, Some("u"));
        st.audiences = Some(vec!["other-app".to_string()]);
        let identity = identity_from_status(&st, &["example-app".to_string()]).unwrap();
        assert!(!identity.has_audience("example-app"));
    }

    #[test]
    fn unauthenticated_status_is_rejected() {
        let mut st = status(false, None);
        st.error = Some("token expired".to_string());
        let err = identity_from_status(&st, &[]).unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(ref m) if m == "token expired"));
    }

    #[test]
    fn missing_user_is_internal() {
        let err = identity_from_status(&status(true, None), &[]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
