//! Sign-and-persist coordinator
//!
//! Every delivery runs the same sequence from scratch: fetch the request,
//! classify it, and for requests that pass, parse, sign and write the
//! certificate back with a resourceVersion-guarded patch. Nothing about an
//! in-flight signing is stored, so redelivery after any failure re-derives
//! the state and the admission gate's "already signed" check prevents a
//! second certificate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::gate::{classify, IgnoreReason, Outcome};
use crate::csr::{self, ParsedCsr};
use crate::events::{actions, notes, reasons, EventPublisher, KubeEventPublisher};
use crate::metrics::{self, SignTimer};
use crate::optimistic;
use crate::pki::CsrSigner;
use crate::{Error, CONTROLLER_NAME};

/// Bound on a single signer call unless configured otherwise
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the status write unless configured otherwise
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait abstracting Kubernetes access for CertificateSigningRequests
///
/// Allows the coordinator to run against mocks and in-memory stores in
/// tests while using the real API server in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a CSR by name, `None` if it does not exist
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error>;

    /// Apply a merge patch to a CSR's status, guarded by `resource_version`
    ///
    /// Returns [`Error::Conflict`] if the stored object is no longer at
    /// `resource_version`.
    async fn patch_csr_status(
        &self,
        name: &str,
        resource_version: &str,
        patch: &Value,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error> {
        Ok(self.api().get_opt(name).await?)
    }

    async fn patch_csr_status(
        &self,
        name: &str,
        resource_version: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        optimistic::patch_status_guarded(&self.api(), name, resource_version, patch.clone())
            .await
            .map(|_| ())
    }
}

/// Controller context shared by all reconciliations
///
/// Immutable after construction. Use [`ContextBuilder`] to construct:
///
/// ```ignore
/// let ctx = Context::builder(client, Arc::new(CaSigner::new(ca, duration)), "example.com/foo")
///     .sign_timeout(Duration::from_secs(5))
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for CSR reads and writes
    pub kube: Arc<dyn KubeClient>,
    /// Signer that turns parsed requests into certificates
    pub signer: Arc<dyn CsrSigner>,
    /// Event publisher for signing outcomes
    pub events: Arc<dyn EventPublisher>,
    /// The signer name this controller answers to
    pub signer_name: String,
    /// Bound on the signer call
    pub sign_timeout: Duration,
    /// Bound on the status write
    pub persist_timeout: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        signer: Arc<dyn CsrSigner>,
        signer_name: impl Into<String>,
    ) -> ContextBuilder {
        ContextBuilder::new(client, signer, signer_name.into())
    }

    /// Create a context for testing with custom clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        signer: Arc<dyn CsrSigner>,
        events: Arc<dyn EventPublisher>,
        signer_name: &str,
    ) -> Self {
        Self {
            kube,
            signer,
            events,
            signer_name: signer_name.to_string(),
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    signer: Arc<dyn CsrSigner>,
    signer_name: String,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    sign_timeout: Duration,
    persist_timeout: Duration,
}

impl ContextBuilder {
    fn new(client: Client, signer: Arc<dyn CsrSigner>, signer_name: String) -> Self {
        Self {
            client,
            signer,
            signer_name,
            kube: None,
            events: None,
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
        }
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the bound on the signer call
    pub fn sign_timeout(mut self, timeout: Duration) -> Self {
        self.sign_timeout = timeout;
        self
    }

    /// Set the bound on the status write
    pub fn persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            signer: self.signer,
            signer_name: self.signer_name,
            sign_timeout: self.sign_timeout,
            persist_timeout: self.persist_timeout,
        }
    }
}

/// What one delivery did to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The request no longer exists
    NotFound,
    /// The admission gate declined the request
    Ignored(IgnoreReason),
    /// The embedded request could not be parsed; a warning event was recorded
    ParseFailed,
    /// A certificate was written to status
    Signed,
}

impl Reconciled {
    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Ignored(reason) => reason.as_str(),
            Self::ParseFailed => "parse failed",
            Self::Signed => "signed",
        }
    }
}

/// Fetch, classify and (if admitted) sign and persist one request
///
/// Returns `Ok` for every outcome that should not be retried, including an
/// unparseable request. Returns `Err` only for dependency failures: the
/// API server, the signer, a guarded-write conflict, or a timeout.
pub async fn handle_request(name: &str, ctx: &Context) -> Result<Reconciled, Error> {
    let Some(request) = ctx.kube.get_csr(name).await? else {
        debug!(csr = name, "CSR not found");
        return Ok(Reconciled::NotFound);
    };

    if let Outcome::Ignore(reason) = classify(&request, &ctx.signer_name) {
        debug!(csr = name, %reason, "ignoring CSR");
        metrics::record_ignored(reason.as_str());
        return Ok(Reconciled::Ignored(reason));
    }

    let object_ref = request.object_ref(&());

    let parsed = match ParsedCsr::parse(&request.spec.request.0) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(csr = name, error = %e, "unable to parse CSR request");
            metrics::record_parse_failure();
            ctx.events
                .publish(
                    &object_ref,
                    EventType::Warning,
                    reasons::SIGNING_FAILED,
                    actions::PARSE,
                    Some(format!("{}: {}", notes::UNPARSEABLE, e)),
                )
                .await;
            return Ok(Reconciled::ParseFailed);
        }
    };

    let certificate = sign(name, parsed, csr::usages(&request).to_vec(), ctx).await?;
    persist(&request, certificate, ctx).await?;

    info!(csr = name, "CSR signed");
    metrics::record_signed();
    ctx.events
        .publish(
            &object_ref,
            EventType::Normal,
            reasons::SIGNED,
            actions::SIGN,
            Some(notes::SIGNED.to_string()),
        )
        .await;

    Ok(Reconciled::Signed)
}

/// Run the signer on a blocking thread, bounded by the sign timeout
async fn sign(
    name: &str,
    parsed: ParsedCsr,
    usages: Vec<String>,
    ctx: &Context,
) -> Result<Vec<u8>, Error> {
    let signer = Arc::clone(&ctx.signer);
    let timer = SignTimer::start();
    let task = tokio::task::spawn_blocking(move || signer.sign(&parsed, &usages));

    let result = match tokio::time::timeout(ctx.sign_timeout, task).await {
        Err(_) => Err(Error::timeout("sign", ctx.sign_timeout)),
        Ok(Err(join)) => Err(Error::internal_with_context("sign", join.to_string())),
        Ok(Ok(Err(e))) => Err(Error::signer(name, e.to_string())),
        Ok(Ok(Ok(certificate))) if certificate.is_empty() => {
            Err(Error::signer(name, "signer returned an empty certificate"))
        }
        Ok(Ok(Ok(certificate))) => Ok(certificate),
    };

    match result {
        Ok(_) => timer.success(),
        Err(_) => timer.error(),
    }
    result
}

/// Write `certificate` into status, guarded by the version that was read
///
/// The patch is the diff between the request as read and the same request
/// with the certificate set, so it carries nothing but the certificate.
async fn persist(
    request: &CertificateSigningRequest,
    certificate: Vec<u8>,
    ctx: &Context,
) -> Result<(), Error> {
    let name = request.name_any();
    let resource_version = optimistic::resource_version_of(request, "persist")?;

    let mut signed = request.clone();
    signed.status.get_or_insert_with(Default::default).certificate = Some(ByteString(certificate));

    let patch = optimistic::merge_diff(&serde_json::to_value(request)?, &serde_json::to_value(&signed)?);

    tokio::time::timeout(
        ctx.persist_timeout,
        ctx.kube.patch_csr_status(&name, &resource_version, &patch),
    )
    .await
    .map_err(|_| Error::timeout("persist", ctx.persist_timeout))?
}

/// Reconcile a CertificateSigningRequest
///
/// The delivered object only identifies the request; [`handle_request`]
/// re-reads it so every decision is made on current state.
#[instrument(skip(csr, ctx), fields(csr = %csr.name_any()))]
pub async fn reconcile(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let outcome = handle_request(&csr.name_any(), &ctx).await?;
    debug!(outcome = outcome.as_str(), "reconcile complete");
    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Retryable errors come back quickly; anything else needs a fix elsewhere
/// and is retried slowly.
pub fn error_policy(
    csr: Arc<CertificateSigningRequest>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    let retryable = error.is_retryable();
    metrics::record_reconcile_error(error.kind(), retryable);

    if retryable {
        warn!(
            csr = %csr.name_any(),
            error = %error,
            "reconciliation failed, retrying"
        );
        Action::requeue(Duration::from_secs(5))
    } else {
        error!(
            csr = %csr.name_any(),
            error = %error,
            "reconciliation failed with non-retryable error"
        );
        Action::requeue(Duration::from_secs(300))
    }
}
