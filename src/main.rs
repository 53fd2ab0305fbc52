//! kubeaccess operator - per-user cluster access credentials

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, Resource};

use kubeaccess::config::{Settings, DEFAULT_CLUSTER_ROLE, DEFAULT_FALLBACK_ENDPOINT};
use kubeaccess::controller::{
    error_policy, reconcile, reconcile_signing_request, requester_ref, signing_error_policy,
    Context, SigningContext, FOR_NAME_LABEL,
};
use kubeaccess::crd::AccessRequest;
use kubeaccess::retry::{retry_kube, RetryConfig};
use kubeaccess::store::FIELD_MANAGER;
use kubeaccess::telemetry::{init_tracing, LogFormat};

/// kubeaccess - provisions client certificates and kubeconfigs for AccessRequests
#[derive(Parser, Debug)]
#[command(name = "kubeaccess", version, about, long_about = None)]
struct Cli {
    /// Print the AccessRequest CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Objects reconciled in parallel by each controller
    #[arg(long, env = "KUBEACCESS_CONCURRENCY", default_value_t = 8)]
    concurrency: u16,

    /// Seconds between checks of an approved signing request without certificate
    #[arg(long, env = "KUBEACCESS_CERTIFICATE_REQUEUE_SECS", default_value_t = 15)]
    certificate_requeue_secs: u64,

    /// API endpoint used when neither the request nor cluster-info names one
    #[arg(long, env = "KUBEACCESS_FALLBACK_ENDPOINT", default_value = DEFAULT_FALLBACK_ENDPOINT)]
    fallback_endpoint: String,

    /// ClusterRole bound when a request has no roleRef
    #[arg(long, env = "KUBEACCESS_DEFAULT_CLUSTER_ROLE", default_value = DEFAULT_CLUSTER_ROLE)]
    default_cluster_role: String,

    /// Do not install the CRD at startup
    #[arg(long, env = "KUBEACCESS_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,

    /// Log output format
    #[arg(long, env = "KUBEACCESS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings::default()
            .certificate_requeue(Duration::from_secs(self.certificate_requeue_secs))
            .fallback_endpoint(self.fallback_endpoint.clone())
            .default_cluster_role(self.default_cluster_role.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&AccessRequest::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install the aws-lc-rs crypto provider"))?;

    init_tracing(cli.log_format)?;

    run_controllers(cli).await
}

/// Install the AccessRequest CRD with server-side apply
///
/// The operator owns its CRD, so the schema always matches the binary.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = AccessRequest::crd();
    let name = crd
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Generated CRD has no name"))?;
    let patch = Patch::Apply(&crd);

    tracing::info!(crd = %name, "Installing CRD");
    retry_kube(&RetryConfig::default(), "install_crd", || {
        crds.patch(&name, &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;

    tracing::info!(crd = %name, "CRD installed/updated");
    Ok(())
}

/// Log the outcome of one reconcile
fn log_reconcile_result<K, E>(controller: &'static str, result: Result<(ObjectRef<K>, Action), E>)
where
    K: Resource<DynamicType = ()>,
    E: Debug,
{
    match result {
        Ok((object, action)) => {
            tracing::debug!(controller, ?object, ?action, "Reconciliation completed");
        }
        Err(e) => {
            tracing::error!(controller, error = ?e, "Reconciliation error");
        }
    }
}

/// Run both controllers until a shutdown signal arrives
async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("kubeaccess controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.skip_crd_install {
        tracing::info!("Skipping CRD install");
    } else {
        ensure_crd_installed(&client).await?;
    }

    let settings = cli.settings();
    tracing::info!(
        concurrency = cli.concurrency,
        certificate_requeue = ?settings.certificate_requeue,
        fallback_endpoint = %settings.fallback_endpoint,
        default_role = %settings.default_role.name,
        "Controller settings"
    );

    let access_ctx = Arc::new(Context::builder(client.clone()).settings(settings).build());
    let signing_ctx = Arc::new(SigningContext::new(client.clone()));
    let controller_config = ControllerConfig::default().concurrency(cli.concurrency);

    let requests: Api<AccessRequest> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());
    let signing_requests: Api<CertificateSigningRequest> = Api::all(client.clone());
    let owned = WatcherConfig::default().labels(FOR_NAME_LABEL);

    tracing::info!("Starting kubeaccess controllers...");
    tracing::info!("  - AccessRequest controller");
    tracing::info!("  - Signing request approval controller");

    let access_controller = Controller::new(requests, WatcherConfig::default())
        .with_config(controller_config.clone())
        .owns(secrets, owned.clone())
        .watches(signing_requests.clone(), owned, requester_ref)
        .shutdown_on_signal()
        .run(reconcile, error_policy, access_ctx)
        .for_each(|result| async move { log_reconcile_result("accessrequest", result) });

    let signing_controller = Controller::new(signing_requests, WatcherConfig::default())
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(reconcile_signing_request, signing_error_policy, signing_ctx)
        .for_each(|result| async move { log_reconcile_result("signing", result) });

    tokio::select! {
        _ = access_controller => {
            tracing::info!("AccessRequest controller completed");
        }
        _ = signing_controller => {
            tracing::info!("Signing controller completed");
        }
    }

    tracing::info!("kubeaccess controller shutting down");
    Ok(())
}
