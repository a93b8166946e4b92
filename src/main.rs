//! dsproxy - policy-enforcing query proxy for multi-tenant observability backends

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use dsproxy_api::{
    serve, AppState, AuthChain, Forwarder, ForwarderConfig, InjectionConfig, ServerConfig,
    TlsFiles, TokenReviewVerifier, TokenVerifier, UpstreamTarget, Verifier, VerifierConfig,
};
use dsproxy_common::crd::GrafanaDataSourceRule;
use dsproxy_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use dsproxy_common::{DEFAULT_ACTION, DEFAULT_POLICY_PATH, MODEL_FILE_NAME, POLICY_FILE_NAME};
use dsproxy_policy::{
    FileAdapter, FileWatch, KubeAdapter, PolicyAdapter, PolicyEngine, PolicyWatcher, Polling,
    WatchStrategy,
};

/// Where policy tuples come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicySource {
    /// `model.conf` and `policy.csv` under `--policy-path`
    File,
    /// GrafanaDataSourceRule objects
    Kubernetes,
}

/// dsproxy - authenticates callers, resolves their authorized namespaces, and
/// pins every forwarded query to one of them
#[derive(Parser, Debug)]
#[command(name = "dsproxy", version, about, long_about = None)]
struct Cli {
    /// Print the GrafanaDataSourceRule CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Plain HTTP listen address
    #[arg(long, env = "DSPROXY_HTTP_ADDR", default_value = "127.0.0.1:5533")]
    http_addr: SocketAddr,

    /// TLS listen address; only used with --tls-cert and --tls-key
    #[arg(long, env = "DSPROXY_HTTPS_ADDR", default_value = "127.0.0.1:5534")]
    https_addr: SocketAddr,

    /// PEM certificate chain for the TLS listener
    #[arg(long, env = "DSPROXY_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the TLS listener
    #[arg(long, env = "DSPROXY_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// OIDC discovery document URL
    #[arg(
        long,
        env = "DSPROXY_OIDC_DISCOVERY_URL",
        alias = "jwks-url",
        default_value = "https://oidc/.well-known/openid-configuration"
    )]
    oidc_discovery_url: String,

    /// Required token audience
    #[arg(long, env = "DSPROXY_JWT_AUDIENCE", default_value = "example-app")]
    jwt_audience: String,

    /// Claim holding the subject
    #[arg(long, env = "DSPROXY_SUBJECT_CLAIM", default_value = "sub")]
    subject_claim: String,

    /// Claim holding group memberships
    #[arg(long, env = "DSPROXY_GROUPS_CLAIM", default_value = "groups")]
    groups_claim: String,

    /// Scheduled key set refresh period
    #[arg(long, env = "DSPROXY_JWKS_REFRESH_INTERVAL_SECS", default_value_t = 3600)]
    jwks_refresh_interval_secs: u64,

    /// Extra PEM roots for discovery, key set, and upstream TLS
    #[arg(long, env = "DSPROXY_CA_BUNDLE")]
    ca_bundle: Option<PathBuf>,

    /// Skip upstream certificate verification
    #[arg(long, env = "DSPROXY_INSECURE_SKIP_VERIFY")]
    insecure_skip_verify: bool,

    /// Fall back to the Kubernetes TokenReview API for bearer tokens
    #[arg(long, env = "DSPROXY_TOKEN_REVIEW")]
    token_review: bool,

    /// Directory holding model.conf and policy.csv
    #[arg(long, env = "DSPROXY_POLICY_PATH", default_value = DEFAULT_POLICY_PATH)]
    policy_path: PathBuf,

    /// Policy source
    #[arg(long, env = "DSPROXY_POLICY_SOURCE", value_enum, default_value_t = PolicySource::File)]
    policy_source: PolicySource,

    /// Reload period when polling
    #[arg(long, env = "DSPROXY_POLICY_POLL_INTERVAL_SECS", default_value_t = 30)]
    policy_poll_interval_secs: u64,

    /// Namespace to read rules from; all namespaces when unset
    #[arg(long, env = "DSPROXY_RULES_NAMESPACE")]
    rules_namespace: Option<String>,

    /// Label pinned in PromQL selectors
    #[arg(long, env = "DSPROXY_INJECTION_LABEL", default_value = "namespace")]
    injection_label: String,

    /// Label pinned in LogQL stream selectors
    #[arg(
        long,
        env = "DSPROXY_LOKI_INJECTION_LABEL",
        default_value = "kubernetes_namespace_name"
    )]
    loki_injection_label: String,

    /// Static upstream base URL; derived from the Host header when unset
    #[arg(long, env = "DSPROXY_UPSTREAM_URL")]
    upstream_url: Option<Url>,

    /// Action checked for every proxied request
    #[arg(long, env = "DSPROXY_ACTION", default_value = DEFAULT_ACTION)]
    action: String,

    /// Drain period for in-flight requests on shutdown
    #[arg(long, env = "DSPROXY_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,

    /// Log line format: json or text
    #[arg(long, env = "DSPROXY_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

/// Validated startup configuration
#[derive(Debug)]
struct ProxyConfig {
    server: ServerConfig,
    verifier: VerifierConfig,
    audience: String,
    token_review: bool,
    ca_bundle_pem: Option<Vec<u8>>,
    insecure_skip_verify: bool,
    policy_source: PolicySource,
    model_path: PathBuf,
    policy_file: PathBuf,
    poll_interval: Duration,
    rules_namespace: Option<String>,
    injection: InjectionConfig,
    upstream: UpstreamTarget,
    action: String,
}

impl ProxyConfig {
    async fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        if cli.action.trim().is_empty() {
            anyhow::bail!("--action must not be empty");
        }
        if cli.injection_label.is_empty() || cli.loki_injection_label.is_empty() {
            anyhow::bail!("injection labels must not be empty");
        }

        let ca_bundle_pem = match &cli.ca_bundle {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read CA bundle {}", path.display()))?,
            ),
            None => None,
        };

        let tls = tls_files(cli.tls_cert, cli.tls_key).await;

        Ok(Self {
            server: ServerConfig {
                http_addr: cli.http_addr,
                https_addr: cli.https_addr,
                tls,
                shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            },
            verifier: VerifierConfig {
                discovery_url: cli.oidc_discovery_url,
                subject_claim: cli.subject_claim,
                groups_claim: cli.groups_claim,
                refresh_interval: Duration::from_secs(cli.jwks_refresh_interval_secs.max(1)),
                ..Default::default()
            },
            audience: cli.jwt_audience,
            token_review: cli.token_review,
            ca_bundle_pem,
            insecure_skip_verify: cli.insecure_skip_verify,
            policy_source: cli.policy_source,
            model_path: cli.policy_path.join(MODEL_FILE_NAME),
            policy_file: cli.policy_path.join(POLICY_FILE_NAME),
            poll_interval: Duration::from_secs(cli.policy_poll_interval_secs.max(1)),
            rules_namespace: cli.rules_namespace.filter(|ns| !ns.is_empty()),
            injection: InjectionConfig {
                prometheus_label: cli.injection_label,
                loki_label: cli.loki_injection_label,
            },
            upstream: cli
                .upstream_url
                .map_or(UpstreamTarget::FromHost, UpstreamTarget::Static),
            action: cli.action,
        })
    }
}

/// TLS material, when both files are configured and present
async fn tls_files(cert: Option<PathBuf>, key: Option<PathBuf>) -> Option<TlsFiles> {
    match (cert, key) {
        (Some(cert), Some(key)) => {
            if is_file(&cert).await && is_file(&key).await {
                Some(TlsFiles { cert, key })
            } else {
                warn!(
                    cert = %cert.display(),
                    key = %key.display(),
                    "TLS certificate or key not found, HTTPS listener disabled"
                );
                None
            }
        }
        (None, None) => None,
        _ => {
            warn!("Both --tls-cert and --tls-key are required, HTTPS listener disabled");
            None
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&GrafanaDataSourceRule::crd())
            .context("failed to serialize CRD")?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    let config = ProxyConfig::from_cli(cli).await?;
    run(config).await
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // Only needed for the cluster rule source, TokenReview, and the rule API
    let kube = match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) if config.policy_source == PolicySource::Kubernetes || config.token_review => {
            return Err(e).context("Kubernetes client required but no cluster config found");
        }
        Err(e) => {
            info!(error = %e, "No Kubernetes client, rule API disabled");
            None
        }
    };

    let policy = start_policy(&config, kube.clone(), cancel.clone()).await?;
    let auth = start_auth(&config, kube.clone(), cancel.clone())?;

    let upstream = Forwarder::new(ForwarderConfig {
        target: config.upstream.clone(),
        ca_bundle_pem: config.ca_bundle_pem.clone(),
        insecure_skip_verify: config.insecure_skip_verify,
        ..Default::default()
    })?;

    let state = AppState {
        auth: Arc::new(auth),
        policy,
        upstream: Arc::new(upstream),
        injection: Arc::new(config.injection.clone()),
        action: config.action.clone(),
        audience: config.audience.clone(),
        kube,
    };

    tokio::spawn(shutdown_on_signal(cancel.clone()));

    info!(
        http = %config.server.http_addr,
        https = ?config.server.tls.as_ref().map(|_| config.server.https_addr),
        upstream = ?config.upstream,
        action = %config.action,
        "dsproxy starting"
    );
    serve(config.server, state, cancel.clone()).await?;

    cancel.cancel();
    info!("dsproxy stopped");
    Ok(())
}

/// Build the policy engine, load it once, and start its watcher
async fn start_policy(
    config: &ProxyConfig,
    kube: Option<Client>,
    cancel: CancellationToken,
) -> anyhow::Result<Arc<PolicyEngine>> {
    let (adapter, model_path): (Arc<dyn PolicyAdapter>, Option<PathBuf>) =
        match (config.policy_source, kube) {
            (PolicySource::File, _) => (
                Arc::new(FileAdapter::new(&config.policy_file)),
                Some(config.model_path.clone()),
            ),
            (PolicySource::Kubernetes, Some(client)) => {
                let adapter = match &config.rules_namespace {
                    Some(ns) => KubeAdapter::namespaced(client, ns),
                    None => KubeAdapter::new(client),
                };
                (Arc::new(adapter), None)
            }
            (PolicySource::Kubernetes, None) => {
                anyhow::bail!("--policy-source kubernetes requires a Kubernetes client")
            }
        };

    let engine = Arc::new(PolicyEngine::new(adapter, model_path));
    match engine.reload().await {
        Ok(stats) => info!(tuples = stats.tuples, roles = stats.roles, "Initial policy loaded"),
        Err(e) => warn!(error = %e, "Initial policy load failed, requests get 503 until a reload succeeds"),
    }

    let strategy: Box<dyn WatchStrategy> = match config.policy_source {
        PolicySource::File => match FileWatch::new([&config.model_path, &config.policy_file]) {
            Ok(watch) => Box::new(watch),
            Err(e) => {
                warn!(error = %e, "File watch setup failed, falling back to polling");
                Box::new(Polling::new(config.poll_interval))
            }
        },
        PolicySource::Kubernetes => Box::new(Polling::new(config.poll_interval)),
    };
    PolicyWatcher::new(engine.clone(), strategy).spawn(cancel);

    Ok(engine)
}

/// Build the verifier chain and start the key refresh task
fn start_auth(
    config: &ProxyConfig,
    kube: Option<Client>,
    cancel: CancellationToken,
) -> anyhow::Result<AuthChain> {
    let mut http = reqwest::Client::builder().timeout(Duration::from_secs(30));
    if let Some(pem) = &config.ca_bundle_pem {
        for cert in reqwest::Certificate::from_pem_bundle(pem).context("invalid CA bundle")? {
            http = http.add_root_certificate(cert);
        }
    }
    let http = http.build().context("failed to build HTTP client")?;

    let verifier = Arc::new(TokenVerifier::new(config.verifier.clone(), http));
    {
        let verifier = verifier.clone();
        tokio::spawn(async move {
            match verifier.refresh().await {
                Ok(keys) => info!(keys, "Loaded signing keys"),
                Err(e) => warn!(error = %e, "Initial key fetch failed, retrying on demand"),
            }
        });
    }
    verifier.clone().spawn_refresh(cancel);

    let mut chain = AuthChain::new(verifier as Arc<dyn Verifier>);
    if config.token_review {
        if let Some(client) = kube {
            info!("TokenReview fallback enabled");
            chain = chain.with_token_review(Arc::new(TokenReviewVerifier::new(
                client,
                vec![config.audience.clone()],
            )));
        }
    }
    Ok(chain)
}

/// Cancel `cancel` on SIGINT or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_flags() {
        let cli = Cli::try_parse_from(["dsproxy"]).unwrap();
        assert_eq!(cli.http_addr, "127.0.0.1:5533".parse().unwrap());
        assert_eq!(cli.https_addr, "127.0.0.1:5534".parse().unwrap());
        assert_eq!(cli.jwt_audience, "example-app");
        assert_eq!(cli.policy_source, PolicySource::File);
        assert_eq!(cli.policy_path, PathBuf::from("/etc/dsproxy/policy"));
        assert_eq!(cli.action, "read");
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::try_parse_from([
            "dsproxy",
            "--policy-source",
            "kubernetes",
            "--upstream-url",
            "http://prometheus:9090",
            "--log-format",
            "text",
            "--jwks-url",
            "https://issuer/.well-known/openid-configuration",
        ])
        .unwrap();
        assert_eq!(cli.policy_source, PolicySource::Kubernetes);
        assert_eq!(cli.upstream_url.unwrap().as_str(), "http://prometheus:9090/");
        assert_eq!(cli.log_format, LogFormat::Text);
        assert_eq!(
            cli.oidc_discovery_url,
            "https://issuer/.well-known/openid-configuration"
        );
    }

    #[tokio::test]
    async fn config_joins_policy_files_and_skips_missing_tls() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "dsproxy".to_string(),
            "--policy-path".to_string(),
            dir.path().display().to_string(),
            "--tls-cert".to_string(),
            dir.path().join("tls.crt").display().to_string(),
            "--tls-key".to_string(),
            dir.path().join("tls.key").display().to_string(),
        ])
        .unwrap();
        let config = ProxyConfig::from_cli(cli).await.unwrap();
        assert_eq!(config.model_path, dir.path().join("model.conf"));
        assert_eq!(config.policy_file, dir.path().join("policy.csv"));
        assert!(config.server.tls.is_none());
        assert_eq!(config.upstream, UpstreamTarget::FromHost);
    }

    #[tokio::test]
    async fn config_uses_tls_when_files_exist() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("tls.crt");
        let key = dir.path().join("tls.key");
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();
        let tls = tls_files(Some(cert.clone()), Some(key)).await.unwrap();
        assert_eq!(tls.cert, cert);
        assert!(tls_files(Some(cert), None).await.is_none());
    }
}
