//! Bootstrap utilities for the catalog-ingest binaries.
//!
//! Shared initialization code: tracing setup, connection retry and
//! shutdown signal handling.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig, LOG_ENV_VAR};

/// Initialize tracing.
///
/// The filter comes from the `INGEST_LOG` environment variable, falling back
/// to `logging.level`. Output is JSON when `logging.format` is `json`.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Run `connect` until it succeeds or `backoff` runs out of delays.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "MongoDB")
/// * `backoff` - Delays between attempts; one attempt more than it yields
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connected client on success, or the last error once retries are exhausted.
pub async fn connect_with_retry<T, E, F, Fut, B>(
    service_name: &str,
    backoff: B,
    mut connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: BackoffBuilder,
{
    let mut delays = backoff.build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                info!(service = service_name, attempt, "Connected");
                return Ok(client);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        service = service_name,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        service = service_name,
                        attempts = attempt,
                        error = %e,
                        "Connection failed, giving up"
                    );
                    return Err(e);
                }
            },
        }
    }
}

/// Config file path from the command line: `--config <path>`, `-c <path>`,
/// `--config=<path>` or a bare first argument.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from(mut args: impl Iterator<Item = String>) -> Option<String> {
    let first = args.next()?;
    match first.as_str() {
        "--config" | "-c" => args.next(),
        _ => match first.strip_prefix("--config=") {
            Some(path) => Some(path.to_string()),
            None if !first.starts_with('-') => Some(first),
            None => None,
        },
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::retry::fixed_backoff;
    use std::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_config_path_forms() {
        assert_eq!(config_path_from(args(&[])), None);
        assert_eq!(config_path_from(args(&["ingest.yaml"])), Some("ingest.yaml".into()));
        assert_eq!(config_path_from(args(&["-c", "a.yaml"])), Some("a.yaml".into()));
        assert_eq!(config_path_from(args(&["--config", "b.yaml"])), Some("b.yaml".into()));
        assert_eq!(config_path_from(args(&["--config=c.yaml"])), Some("c.yaml".into()));
        assert_eq!(config_path_from(args(&["--config"])), None);
        assert_eq!(config_path_from(args(&["--verbose"])), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_succeeds_after_failures() {
        let calls = AtomicUsize::new(0);

        let result: Result<&str, String> =
            connect_with_retry("test", fixed_backoff(Duration::from_secs(5), 5), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("refused {n}"))
                    } else {
                        Ok("client")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("client"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_retry_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<(), String> =
            connect_with_retry("test", fixed_backoff(Duration::from_secs(5), 3), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("refused {n}")) }
            })
            .await;

        assert_eq!(result, Err("refused 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}
