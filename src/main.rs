//! signer-ca - sign approved Kubernetes CertificateSigningRequests with a CA key pair

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing::{error, info, warn};

use signer_ca::config::{parse_duration, validate_validity, SignerArgs, SignerConfig};
use signer_ca::controller::{error_policy, reconcile, Context};
use signer_ca::health::start_health_server;
use signer_ca::leader_election::LeaderElector;
use signer_ca::pki::{CaSigner, CertificateAuthority};
use signer_ca::telemetry::{init_telemetry, TelemetryConfig};

/// Server-side watch timeout, below the API server's 30s idle cutoff
const WATCH_TIMEOUT_SECS: u32 = 25;

/// signer-ca - automated certificate authority for Kubernetes CSRs
#[derive(Parser, Debug)]
#[command(name = "signer-ca", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    signer: SignerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the signing controller (default mode)
    ///
    /// Watches CertificateSigningRequests and signs the approved ones that
    /// name this signer.
    Controller,

    /// Generate a self-signed CA certificate and key
    ///
    /// Writes `ca.pem` and `ca-key.pem` into the output directory. Intended
    /// for development clusters; production CAs come from your PKI.
    GenerateCa(GenerateCaArgs),
}

#[derive(clap::Args, Debug)]
struct GenerateCaArgs {
    /// Subject common name of the CA
    #[arg(long, default_value = "signer-ca")]
    common_name: String,

    /// CA validity (e.g. 8760h)
    #[arg(long, default_value = "8760h", value_parser = parse_duration)]
    validity: Duration,

    /// Directory to write ca.pem and ca-key.pem into
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the aws-lc-rs crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The Kubernetes client cannot use TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateCa(args)) => generate_ca(args),
        Some(Commands::Controller) | None => run_controller(cli.signer.into_config()?).await,
    }
}

/// Write a fresh self-signed CA to disk
fn generate_ca(args: GenerateCaArgs) -> anyhow::Result<()> {
    validate_validity("validity", args.validity)?;
    let ca = CertificateAuthority::generate(&args.common_name, args.validity)
        .context("failed to generate CA")?;

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    let cert_path = args.out_dir.join("ca.pem");
    let key_path = args.out_dir.join("ca-key.pem");

    std::fs::write(&cert_path, ca.ca_cert_pem())
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    std::fs::write(&key_path, ca.ca_key_pem())
        .with_context(|| format!("failed to write {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict {}", key_path.display()))?;
    }

    println!("CA certificate: {}", cert_path.display());
    println!("CA private key: {}", key_path.display());
    Ok(())
}

/// Load the CA, optionally wait for leadership, and run the controller
async fn run_controller(config: SignerConfig) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        debug_logging: config.debug_logging,
        ..Default::default()
    })?;

    info!(
        signer_name = %config.signer_name,
        certificate_duration_secs = config.certificate_duration.as_secs(),
        "starting signer-ca"
    );

    let ca = CertificateAuthority::from_files(&config.ca_cert_path, &config.ca_key_path)
        .with_context(|| {
            format!(
                "failed to load CA from {} and {}",
                config.ca_cert_path.display(),
                config.ca_key_path.display()
            )
        })?;

    let ca_info = ca.cert_info();
    if ca_info.is_expired() {
        anyhow::bail!("CA certificate '{}' has expired", ca_info.common_name);
    }
    if ca_info.needs_rotation() {
        warn!(
            ca = %ca_info.common_name,
            remaining_secs = ca_info.remaining_secs(),
            "CA certificate is past 80% of its lifetime, plan a rotation"
        );
    }

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let elector = config.leader_election.as_ref().map(|le| {
        Arc::new(LeaderElector::new(
            client.clone(),
            &le.lease_name,
            &le.namespace,
            &le.identity,
        ))
    });

    tokio::spawn(start_health_server(
        config.health_addr,
        elector.as_ref().map(|e| e.leadership_flag()),
    ));

    let signer = Arc::new(CaSigner::new(ca, config.certificate_duration));
    let ctx = Arc::new(
        Context::builder(client.clone(), signer, config.signer_name.clone())
            .sign_timeout(config.sign_timeout)
            .persist_timeout(config.persist_timeout)
            .build(),
    );

    let Some(elector) = elector else {
        run_signer(client, ctx).await;
        return Ok(());
    };

    let mut guard = elector.acquire().await;
    tokio::select! {
        _ = run_signer(client, ctx) => {
            if let Err(e) = guard.release_leadership().await {
                warn!(error = %e, "Failed to release lease on shutdown");
            }
        }
        _ = guard.lost() => {
            error!("Leadership lost, exiting so another replica can take over");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Run the CSR controller until a shutdown signal arrives
async fn run_signer(client: Client, ctx: Arc<Context>) {
    let csrs: Api<CertificateSigningRequest> = Api::all(client);
    let watcher_config = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    info!("Starting CertificateSigningRequest controller");
    Controller::new(csrs, watcher_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("csr"))
        .await;
    info!("CertificateSigningRequest controller stopped");
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::debug!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
