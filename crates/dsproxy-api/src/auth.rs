//! Bearer token verification against a published key set
//!
//! The verifier resolves the key-set URL from an OIDC discovery document,
//! caches the decoded keys, and refreshes them on a fixed interval from a
//! background task. A token signed with an unknown key id triggers an
//! on-demand refresh at most once per [`VerifierConfig::min_refresh_interval`],
//! so a flood of forged key ids cannot turn into a flood of key fetches.
//!
//! Signature, issuer, and expiry are checked here. The audience is returned
//! on the [`Identity`] and checked by the request pipeline.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// Identity
// ============================================================================

/// Caller identity derived from a verified token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier; the primary authorization key
    pub subject: String,
    /// Display/email attribute, informational only
    pub email: Option<String>,
    /// Group memberships
    pub groups: Vec<String>,
    /// Audiences the token was issued for
    pub audiences: Vec<String>,
}

impl Identity {
    /// Subject followed by groups, for authorization lookups
    pub fn principals(&self) -> Vec<&str> {
        std::iter::once(self.subject.as_str())
            .chain(self.groups.iter().map(String::as_str))
            .collect()
    }

    /// Whether the token was issued for `audience`
    pub fn has_audience(&self, audience: &str) -> bool {
        self.audiences.iter().any(|a| a == audience)
    }
}

/// Something that turns a raw token into an [`Identity`]
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Verify `token` and extract the caller identity
    async fn verify(&self, token: &str) -> Result<Identity>;
}

// ============================================================================
// Claim decoding
// ============================================================================

/// Group claim in any of the shapes issuers emit
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum GroupsClaim {
    #[default]
    None,
    Strings(Vec<String>),
    Mixed(Vec<serde_json::Value>),
    Single(String),
}

impl GroupsClaim {
    fn from_value(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Flatten to strings; non-string list entries are dropped
    fn into_vec(self) -> Vec<String> {
        match self {
            GroupsClaim::None => vec![],
            GroupsClaim::Strings(v) => v,
            GroupsClaim::Mixed(v) => v
                .into_iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
            GroupsClaim::Single(s) => vec![s],
        }
    }
}

/// `aud` is either one string or a list (RFC 7519 section 4.1.3)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    Single(String),
    Multiple(Vec<serde_json::Value>),
}

impl AudienceClaim {
    fn from_value(value: Option<&serde_json::Value>) -> Vec<String> {
        match value.and_then(|v| serde_json::from_value(v.clone()).ok()) {
            Some(AudienceClaim::Single(s)) => vec![s],
            Some(AudienceClaim::Multiple(v)) => v
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            None => vec![],
        }
    }
}

type Claims = HashMap<String, serde_json::Value>;

// ============================================================================
// Key set
// ============================================================================

/// OIDC discovery document (fields we use)
#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    issuer: String,
    jwks_uri: String,
}

/// JWKS document
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

/// Individual JWK
#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    alg: Option<String>,
    #[serde(rename = "use")]
    use_: Option<String>,
    // RSA
    n: Option<String>,
    e: Option<String>,
    // EC / OKP
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
    // Symmetric
    k: Option<String>,
}

struct CachedKey {
    key: DecodingKey,
    /// Algorithm pinned by the JWK, if it declares one
    alg: Option<Algorithm>,
}

struct KeySet {
    issuer: String,
    keys: HashMap<String, CachedKey>,
    fetched_at: Instant,
}

impl KeySet {
    fn lookup(&self, kid: Option<&str>) -> Option<&CachedKey> {
        match kid {
            Some(kid) => self.keys.get(kid),
            // Without a kid the key is only unambiguous if there is one
            None if self.keys.len() == 1 => self.keys.values().next(),
            None => None,
        }
    }
}

/// Convert a JWK to a decoding key; unsupported keys yield `None`
fn jwk_to_decoding_key(jwk: &JwkKey) -> Result<Option<DecodingKey>> {
    fn field<'a>(value: &'a Option<String>, kty: &str, name: &str) -> Result<&'a str> {
        value
            .as_deref()
            .ok_or_else(|| Error::Config(format!("{} key missing '{}'", kty, name)))
    }

    match jwk.kty.as_str() {
        "RSA" => DecodingKey::from_rsa_components(
            field(&jwk.n, "RSA", "n")?,
            field(&jwk.e, "RSA", "e")?,
        )
        .map(Some)
        .map_err(|e| Error::Config(format!("invalid RSA key: {}", e))),
        "EC" => match field(&jwk.crv, "EC", "crv")? {
            "P-256" | "P-384" => DecodingKey::from_ec_components(
                field(&jwk.x, "EC", "x")?,
                field(&jwk.y, "EC", "y")?,
            )
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid EC key: {}", e))),
            crv => {
                warn!(crv = %crv, "Unsupported EC curve");
                Ok(None)
            }
        },
        "OKP" => match field(&jwk.crv, "OKP", "crv")? {
            "Ed25519" => DecodingKey::from_ed_components(field(&jwk.x, "OKP", "x")?)
                .map(Some)
                .map_err(|e| Error::Config(format!("invalid OKP key: {}", e))),
            crv => {
                warn!(crv = %crv, "Unsupported OKP curve");
                Ok(None)
            }
        },
        "oct" => {
            let secret = URL_SAFE_NO_PAD
                .decode(field(&jwk.k, "oct", "k")?.trim_end_matches('='))
                .map_err(|e| Error::Config(format!("invalid oct key: {}", e)))?;
            Ok(Some(DecodingKey::from_secret(&secret)))
        }
        kty => {
            warn!(kty = %kty, "Unsupported key type");
            Ok(None)
        }
    }
}

// ============================================================================
// TokenVerifier
// ============================================================================

/// Verifier configuration
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// OIDC discovery document URL
    pub discovery_url: String,
    /// Claim holding the subject
    pub subject_claim: String,
    /// Claim holding group memberships
    pub groups_claim: String,
    /// Scheduled key refresh period
    pub refresh_interval: Duration,
    /// Minimum spacing between fetches, including on-demand ones
    pub min_refresh_interval: Duration,
    /// Clock skew tolerance for `exp`/`nbf`
    pub leeway: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            discovery_url: "https://oidc/.well-known/openid-configuration".to_string(),
            subject_claim: "sub".to_string(),
            groups_claim: "groups".to_string(),
            refresh_interval: Duration::from_secs(3600),
            min_refresh_interval: Duration::from_secs(60),
            leeway: Duration::from_secs(60),
        }
    }
}

/// Verifies tokens against the issuer's published key set
pub struct TokenVerifier {
    config: VerifierConfig,
    keys: RwLock<Option<KeySet>>,
    last_attempt: Mutex<Option<Instant>>,
    /// Serializes fetches so concurrent misses share one refresh
    refresh_gate: tokio::sync::Mutex<()>,
    http_client: reqwest::Client,
}

impl TokenVerifier {
    /// Create a verifier; no keys are fetched until [`refresh`](Self::refresh)
    /// or the first verification
    pub fn new(config: VerifierConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            keys: RwLock::new(None),
            last_attempt: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            http_client,
        }
    }

    /// Verifier configuration
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Whether a key set has been loaded
    pub fn is_ready(&self) -> bool {
        self.keys.read().is_some()
    }

    /// Fetch the discovery document and key set, replacing the cached keys.
    ///
    /// Returns the number of usable keys. On error the cached keys are kept.
    pub async fn refresh(&self) -> Result<usize> {
        let _gate = self.refresh_gate.lock().await;
        self.fetch().await
    }

    async fn fetch(&self) -> Result<usize> {
        *self.last_attempt.lock() = Some(Instant::now());

        debug!(url = %self.config.discovery_url, "Fetching OIDC discovery document");
        let discovery: OidcDiscovery = self
            .http_client
            .get(&self.config.discovery_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ServiceUnavailable(format!("OIDC discovery fetch failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("invalid OIDC discovery: {}", e)))?;

        debug!(url = %discovery.jwks_uri, "Fetching JWKS");
        let jwks: JwksDocument = self
            .http_client
            .get(&discovery.jwks_uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ServiceUnavailable(format!("JWKS fetch failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("invalid JWKS: {}", e)))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if jwk.use_.as_deref().is_some_and(|u| u != "sig") {
                continue;
            }
            let decoded = match jwk_to_decoding_key(&jwk) {
                Ok(Some(key)) => key,
                Ok(None) => continue,
                Err(e) => {
                    warn!(kid = ?jwk.kid, error = %e, "Skipping unusable JWK");
                    continue;
                }
            };
            let alg = jwk.alg.as_deref().and_then(|a| Algorithm::from_str(a).ok());
            let kid = jwk.kid.unwrap_or_else(|| "default".to_string());
            keys.insert(kid, CachedKey { key: decoded, alg });
        }

        if keys.is_empty() {
            return Err(Error::ServiceUnavailable("no usable keys in JWKS".into()));
        }

        let count = keys.len();
        *self.keys.write() = Some(KeySet {
            issuer: discovery.issuer,
            keys,
            fetched_at: Instant::now(),
        });
        info!(key_count = count, "Refreshed JWKS cache");
        Ok(count)
    }

    /// Refresh unless a fetch happened within `min_refresh_interval`
    async fn refresh_if_allowed(&self) {
        let _gate = self.refresh_gate.lock().await;
        let recent = self
            .last_attempt
            .lock()
            .is_some_and(|t| t.elapsed() < self.config.min_refresh_interval);
        if recent {
            debug!("Skipping JWKS refresh, last attempt too recent");
            return;
        }
        if let Err(e) = self.fetch().await {
            warn!(error = %e, "On-demand JWKS refresh failed");
        }
    }

    /// Refresh the key set every `refresh_interval` until `cancel` fires
    pub fn spawn_refresh(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.refresh_interval;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        if let Err(e) = self.refresh().await {
                            warn!(error = %e, "Scheduled JWKS refresh failed, keeping cached keys");
                        }
                    }
                }
            }
            debug!("JWKS refresh task stopped");
        })
    }

    /// Decode and validate `token` with the cached key for `kid`
    fn decode_with_cached(
        &self,
        token: &str,
        kid: Option<&str>,
        alg: Algorithm,
    ) -> Option<Result<Claims>> {
        let guard = self.keys.read();
        let set = guard.as_ref()?;
        let cached = set.lookup(kid)?;

        if cached.alg.is_some_and(|pinned| pinned != alg) {
            return Some(Err(Error::Unauthenticated(format!(
                "token algorithm {:?} does not match key",
                alg
            ))));
        }

        let mut validation = Validation::new(alg);
        validation.set_issuer(&[&set.issuer]);
        // set_issuer only rejects a mismatch; an absent iss must fail too
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_aud = false;
        validation.leeway = self.config.leeway.as_secs();

        debug!(kid = ?kid, age_secs = set.fetched_at.elapsed().as_secs(), "Validating token");
        Some(
            decode::<Claims>(token, &cached.key, &validation)
                .map(|data| data.claims)
                .map_err(Error::from),
        )
    }

    fn identity_from_claims(&self, mut claims: Claims) -> Result<Identity> {
        let subject = match claims.remove(&self.config.subject_claim) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            _ => {
                return Err(Error::Unauthenticated(format!(
                    "missing claim: {}",
                    self.config.subject_claim
                )))
            }
        };
        let email = claims
            .get("email")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let groups = GroupsClaim::from_value(claims.get(&self.config.groups_claim)).into_vec();
        let audiences = AudienceClaim::from_value(claims.get("aud"));

        Ok(Identity {
            subject,
            email,
            groups,
            audiences,
        })
    }
}

#[async_trait]
impl Verifier for TokenVerifier {
    fn name(&self) -> &'static str {
        "jwks"
    }

    async fn verify(&self, token: &str) -> Result<Identity> {
        let header = decode_header(token)?;
        let kid = header.kid.as_deref();

        let claims = match self.decode_with_cached(token, kid, header.alg) {
            Some(result) => result?,
            None => {
                // Unknown kid or no keys yet
                self.refresh_if_allowed().await;
                if !self.is_ready() {
                    return Err(Error::ServiceUnavailable("signing keys not loaded".into()));
                }
                self.decode_with_cached(token, kid, header.alg)
                    .ok_or_else(|| Error::Unauthenticated(format!("unknown signing key: {:?}", kid)))??
            }
        };

        let identity = self.identity_from_claims(claims)?;
        debug!(subject = %identity.subject, groups = ?identity.groups, "Verified token");
        Ok(identity)
    }
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
