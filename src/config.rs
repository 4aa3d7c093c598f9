//! Operator-facing configuration
//!
//! Every setting is a command-line flag that can also be supplied through an
//! environment variable. Parsed flags are validated once into a
//! [`SignerConfig`], which is immutable for the life of the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args};

use crate::{Error, Result};

/// Default signer name this controller answers to
pub const DEFAULT_SIGNER_NAME: &str = "example.com/foo";

/// Default Lease name used for leader election
pub const DEFAULT_LEADER_ELECTION_ID: &str = "signer-ca-leader-election";

/// Longest certificate or CA validity accepted from configuration (100 years)
pub const MAX_VALIDITY: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Parse a duration string into a [`Duration`]
///
/// Supports `Nh` (hours), `Nm` (minutes), `Ns` (seconds) and bare seconds.
/// Examples: "1h" → 3600s, "30m" → 1800s, "3600s" → 3600s, "90" → 90s.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || {
        Error::config(format!(
            "invalid duration '{}', expected e.g. 1h, 30m, 3600s",
            s
        ))
    };
    let (digits, multiplier) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s, 1)
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    n.checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Command-line flags for the controller
#[derive(Args, Debug, Clone)]
pub struct SignerArgs {
    /// Only sign CSRs with this `spec.signerName`
    #[arg(long, env = "SIGNER_NAME", default_value = DEFAULT_SIGNER_NAME)]
    pub signer_name: String,

    /// Path to the PEM-encoded CA certificate
    #[arg(
        long,
        env = "CA_CERT_PATH",
        default_value = "/etc/pki/example.com/foo/ca.pem"
    )]
    pub ca_cert_path: PathBuf,

    /// Path to the PEM-encoded CA private key
    #[arg(
        long,
        env = "CA_KEY_PATH",
        default_value = "/etc/pki/example.com/foo/ca-key.pem"
    )]
    pub ca_key_path: PathBuf,

    /// Validity of issued certificates (e.g. 1h, 30m, 86400s)
    #[arg(long, env = "CERTIFICATE_DURATION", default_value = "1h", value_parser = parse_duration)]
    pub certificate_duration: Duration,

    /// Human-readable debug logs instead of JSON
    #[arg(long, env = "DEBUG_LOGGING", default_value_t = true, action = ArgAction::Set)]
    pub debug_logging: bool,

    /// Hold a Lease before signing so only one replica is active
    #[arg(long, env = "ENABLE_LEADER_ELECTION")]
    pub enable_leader_election: bool,

    /// Name of the Lease used for leader election
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = DEFAULT_LEADER_ELECTION_ID)]
    pub leader_election_id: String,

    /// Namespace of the leader election Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub leader_election_namespace: String,

    /// Identity recorded as the Lease holder (defaults to the hostname)
    #[arg(long, env = "POD_NAME")]
    pub leader_election_identity: Option<String>,

    /// Address for the /healthz endpoint
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    pub health_addr: SocketAddr,

    /// Upper bound on a single signer call
    #[arg(long, env = "SIGN_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub sign_timeout: Duration,

    /// Upper bound on writing a certificate back to the API server
    #[arg(long, env = "PERSIST_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub persist_timeout: Duration,
}

/// Leader election settings, present only when election is enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// Lease name
    pub lease_name: String,
    /// Lease namespace
    pub namespace: String,
    /// Holder identity written into the Lease
    pub identity: String,
}

/// Validated controller configuration
#[derive(Debug, Clone)]
pub struct SignerConfig {
    /// Signer name this controller answers to
    pub signer_name: String,
    /// CA certificate path
    pub ca_cert_path: PathBuf,
    /// CA private key path
    pub ca_key_path: PathBuf,
    /// Validity of issued certificates
    pub certificate_duration: Duration,
    /// Human-readable debug logs
    pub debug_logging: bool,
    /// Leader election, if enabled
    pub leader_election: Option<LeaderElectionConfig>,
    /// /healthz listen address
    pub health_addr: SocketAddr,
    /// Bound on the signer call
    pub sign_timeout: Duration,
    /// Bound on the status write
    pub persist_timeout: Duration,
}

/// Check that `name` looks like `domain/path`
fn validate_signer_name(name: &str) -> Result<()> {
    let Some((domain, path)) = name.split_once('/') else {
        return Err(Error::config(format!(
            "signer name '{}' must have the form <domain>/<path>",
            name
        )));
    };
    if domain.is_empty() || path.is_empty() {
        return Err(Error::config(format!(
            "signer name '{}' has an empty domain or path",
            name
        )));
    }
    Ok(())
}

fn require_positive(flag: &str, d: Duration) -> Result<()> {
    if d.is_zero() {
        return Err(Error::config(format!("--{} must be greater than zero", flag)));
    }
    Ok(())
}

/// Check that a validity period is non-zero and no longer than [`MAX_VALIDITY`]
pub fn validate_validity(flag: &str, d: Duration) -> Result<()> {
    require_positive(flag, d)?;
    if d > MAX_VALIDITY {
        return Err(Error::config(format!(
            "--{} of {}s exceeds the maximum of {}s",
            flag,
            d.as_secs(),
            MAX_VALIDITY.as_secs()
        )));
    }
    Ok(())
}

impl SignerArgs {
    /// Validate flags into a [`SignerConfig`]
    pub fn into_config(self) -> Result<SignerConfig> {
        validate_signer_name(&self.signer_name)?;
        validate_validity("certificate-duration", self.certificate_duration)?;
        require_positive("sign-timeout", self.sign_timeout)?;
        require_positive("persist-timeout", self.persist_timeout)?;

        let leader_election = if self.enable_leader_election {
            if self.leader_election_id.is_empty() {
                return Err(Error::config("--leader-election-id must not be empty"));
            }
            let identity = self
                .leader_election_identity
                .or_else(|| std::env::var("HOSTNAME").ok())
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    Error::config("leader election needs --leader-election-identity or HOSTNAME")
                })?;
            Some(LeaderElectionConfig {
                lease_name: self.leader_election_id,
                namespace: self.leader_election_namespace,
                identity,
            })
        } else {
            None
        };

        Ok(SignerConfig {
            signer_name: self.signer_name,
            ca_cert_path: self.ca_cert_path,
            ca_key_path: self.ca_key_path,
            certificate_duration: self.certificate_duration,
            debug_logging: self.debug_logging,
            leader_election,
            health_addr: self.health_addr,
            sign_timeout: self.sign_timeout,
            persist_timeout: self.persist_timeout,
        })
    }
}
