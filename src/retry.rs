//! Bounded retry for startup API calls
//!
//! Installing the AccessRequest CRD must survive an API server that is still
//! coming up, but must not spin on a request the server will never accept.
//! Only transient kube failures are retried: transport errors, throttling
//! and 5xx responses. Any other API response is returned at once.
//!
//! Reconciles never retry inline; they return an error and the controller
//! requeues them.
//!
//! # Example
//!
//! ```ignore
//! use kubeaccess::retry::{retry_kube, RetryConfig};
//!
//! retry_kube(&RetryConfig::default(), "install_crd", || {
//!     crds.patch("accessrequests.kubeaccess.dev", &params, &patch)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters for a retried API call
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Whether a failed API call may succeed when repeated unchanged
pub fn is_transient(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(response) => response.code == 429 || response.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

/// Doubling delays with 0.5x-1.5x jitter, capped at `max_delay`
struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_delay,
            max: config.max_delay,
        }
    }

    fn delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * 2).min(self.max);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        base.mul_f64(jitter).min(self.max)
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out
///
/// The last error is returned unchanged.
pub async fn retry_kube<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    mut call: F,
) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 1u32;

    loop {
        let e = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_transient(&e) {
            error!(operation, attempt, error = %e, "request rejected, not retrying");
            return Err(e);
        }
        if attempt >= config.attempts {
            error!(operation, attempt, error = %e, "giving up after transient failures");
            return Err(e);
        }

        let delay = backoff.delay();
        warn!(
            operation,
            attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
