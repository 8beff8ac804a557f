//! pebble - command line tool for the Pebble SDK.
//!
//! Connects to watches over the phone developer connection, QEMU or a
//! running emulator, manages local SDK state, and checks for tool and SDK
//! updates in the background.

mod cli;
mod commands;
mod connection;
mod error;
mod sdk;
mod transport;
mod updates;
mod websocket;

use anyhow::Result;
use std::future::Future;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{CommandContext, CommandRegistry, SharedArgs};
use sdk::{ChannelSource, DefaultChannel, SdkManager};
use updates::{Notifications, UpdateChecker, UpdateChecks, UpdateClient};

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    run_to_exit(runtime, run())
}

/// Run `future` to completion, then drop the runtime without waiting on
/// update checks still stuck in name resolution or a request.
fn run_to_exit(runtime: Runtime, future: impl Future<Output = ExitCode>) -> ExitCode {
    let code = runtime.block_on(future);
    runtime.shutdown_background();
    code
}

async fn run() -> ExitCode {
    let registry = match commands::registry() {
        Ok(registry) => registry,
        Err(e) => return report_failure(&e, &mut std::io::stderr()),
    };
    let matches = registry.cli().get_matches();
    let shared = match CommandRegistry::shared_args(&matches) {
        Ok(shared) => shared,
        Err(e) => return report_failure(&e, &mut std::io::stderr()),
    };

    init_logging(&shared);

    let sdk = match SdkManager::new() {
        Ok(sdk) => Some(Arc::new(sdk)),
        Err(e) => {
            warn!("SDK directory unavailable: {:#}", e);
            None
        }
    };
    let notifications = Notifications::default();

    let checks = match UpdateClient::new(updates::UPDATE_SERVICE_BASE) {
        Ok(client) => {
            let channels: Arc<dyn ChannelSource> = match &sdk {
                Some(sdk) => Arc::clone(sdk) as Arc<dyn ChannelSource>,
                None => Arc::new(DefaultChannel),
            };
            let checker = UpdateChecker::new(client, channels, notifications.clone());
            Some(UpdateChecks::start_default(&checker, sdk.clone()))
        }
        Err(e) => {
            info!("Update checks disabled: {}", e);
            None
        }
    };

    let ctx = CommandContext { shared, sdk };
    let result = registry.dispatch(&ctx, &matches).await;

    if let Some(checks) = checks {
        debug!("Waiting for {} update checks", checks.len());
        checks.wait_for_update_checks(updates::EXIT_WAIT).await;
    }
    debug!("{} update notices pending", notifications.len());
    finish(result, &notifications, &mut std::io::stderr())
}

/// Report the command's outcome, then deliver update notices after it.
fn finish(result: Result<()>, notifications: &Notifications, err: &mut impl Write) -> ExitCode {
    let code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_failure(&e, err),
    };
    notifications.deliver_all();
    code
}

fn report_failure(error: &anyhow::Error, err: &mut impl Write) -> ExitCode {
    let _ = err.write_all(format!("Error: {error:?}\n").as_bytes());
    ExitCode::FAILURE
}

fn init_logging(shared: &SharedArgs) {
    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(shared.log_filter()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use crate::updates::TrackedComponent;

    /// Records writes as one event per call, sharing a log with notice callbacks.
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl Write for EventLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(buf).trim_end().to_string());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_error_is_reported_before_update_notices() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/files/pebble-tool-test/latest")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"version": "9.9"}"#)
            .create_async()
            .await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let component = TrackedComponent::new("pebble-tool-test", "1.0", move |version| {
            sink.lock().unwrap().push(format!("notice {version}"));
        });

        let notifications = Notifications::default();
        let client = UpdateClient::new(&server.url()).unwrap();
        let checker = UpdateChecker::new(client, Arc::new(DefaultChannel), notifications.clone());
        checker.check(&component).await;

        let code = finish(
            Err(anyhow::anyhow!("No pebble connection specified.")),
            &notifications,
            &mut EventLog(events.clone()),
        );

        assert_eq!(code, ExitCode::FAILURE);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("Error: No pebble connection specified."));
        assert_eq!(events[1], "notice 9.9");
    }

    #[test]
    fn test_success_writes_no_error_output() {
        let notifications = Notifications::default();
        let events = Arc::new(Mutex::new(Vec::new()));

        let code = finish(Ok(()), &notifications, &mut EventLog(events.clone()));

        assert_eq!(code, ExitCode::SUCCESS);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_exit_does_not_wait_for_stuck_blocking_work() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();

        let started = Instant::now();
        let code = run_to_exit(runtime, async {
            // Stands in for a resolver call that never comes back.
            let _stuck = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(30)));
            tokio::time::sleep(Duration::from_millis(50)).await;
            ExitCode::SUCCESS
        });

        assert_eq!(code, ExitCode::SUCCESS);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
