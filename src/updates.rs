//! Background update checks.
//!
//! Each tracked component gets one detached task that asks the update service
//! for the latest release on the configured channel. A newer version is queued
//! as a pending notification; `main` delivers the queue once the command has
//! finished so notices never interleave with command output.

use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::UpdateError;
use crate::sdk::{ChannelSource, SdkManager};

pub const UPDATE_SERVICE_BASE: &str = "https://sdk.getpebble.com";

/// How long `main` gives outstanding checks before exiting.
pub const EXIT_WAIT: Duration = Duration::from_secs(2);

const SDK_COMPONENT: &str = "sdk-core";

/// Invoked with the newly available version.
pub type UpdateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Something whose latest release is checked.
pub struct TrackedComponent {
    pub name: String,
    /// Empty means "not installed": any reported version is an update.
    pub current_version: String,
    callback: UpdateCallback,
}

impl TrackedComponent {
    pub fn new(
        name: impl Into<String>,
        current_version: impl Into<String>,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            current_version: current_version.into(),
            callback: Arc::new(callback),
        }
    }
}

/// Response body of the latest-release endpoint
#[derive(Debug, Deserialize)]
struct LatestRelease {
    version: String,
}

/// HTTP client for the update service
#[derive(Clone)]
pub struct UpdateClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpdateClient {
    pub fn new(base_url: &str) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pebble-tool/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the latest version of `component` on `channel`
    pub async fn fetch_latest(&self, component: &str, channel: &str) -> Result<String, UpdateError> {
        let url = format!("{}/v1/files/{}/latest", self.base_url, component);

        let response = self
            .client
            .get(&url)
            .query(&[("channel", channel)])
            .send()
            .await?;

        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(UpdateError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let body = response.text().await?;
        let latest: LatestRelease =
            serde_json::from_str(&body).map_err(|e| UpdateError::InvalidResponse(e.to_string()))?;

        Ok(latest.version)
    }
}

/// A detected update waiting to be shown to the user.
pub struct PendingNotification {
    pub component: String,
    pub version: String,
    callback: UpdateCallback,
}

impl PendingNotification {
    pub fn deliver(self) {
        debug!("Delivering update notice for {}", self.component);
        (self.callback)(&self.version);
    }
}

/// Ordered queue of pending notifications, shared with the checker tasks.
#[derive(Clone, Default)]
pub struct Notifications {
    pending: Arc<Mutex<Vec<PendingNotification>>>,
}

impl Notifications {
    fn schedule(&self, notification: PendingNotification) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }

    /// Take every pending notification in the order they were scheduled.
    pub fn drain(&self) -> Vec<PendingNotification> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn deliver_all(&self) {
        for notification in self.drain() {
            notification.deliver();
        }
    }
}

/// Runs version checks and queues notifications for detected updates.
#[derive(Clone)]
pub struct UpdateChecker {
    client: UpdateClient,
    channels: Arc<dyn ChannelSource>,
    notifications: Notifications,
}

impl UpdateChecker {
    pub fn new(client: UpdateClient, channels: Arc<dyn ChannelSource>, notifications: Notifications) -> Self {
        Self {
            client,
            channels,
            notifications,
        }
    }

    /// Start a background check for `component`.
    pub fn spawn(&self, component: TrackedComponent) -> CheckHandle {
        let checker = self.clone();
        let name = component.name.clone();
        let handle = tokio::spawn(async move {
            checker.check(&component).await;
        });

        CheckHandle {
            component: name,
            handle,
        }
    }

    /// Perform one check. Returns the newer version if one was found and queued.
    pub async fn check(&self, component: &TrackedComponent) -> Option<String> {
        // Read at check time so a channel change after start still applies.
        let channel = self.channels.channel();

        let latest = match self.client.fetch_latest(&component.name, &channel).await {
            Ok(version) => version,
            Err(UpdateError::InvalidResponse(e)) => {
                debug!("Ignoring update response for {}: {}", component.name, e);
                return None;
            }
            Err(e) => {
                info!("Update check failed: {}", e);
                return None;
            }
        };

        if latest == component.current_version {
            debug!("{} is up to date ({})", component.name, latest);
            return None;
        }

        debug!("Found an update: {}", latest);
        self.notifications.schedule(PendingNotification {
            component: component.name.clone(),
            version: latest.clone(),
            callback: component.callback.clone(),
        });

        Some(latest)
    }
}

/// Handle to a running check. Dropping it detaches the task.
pub struct CheckHandle {
    component: String,
    handle: JoinHandle<()>,
}

/// The set of checks started for this invocation, in priority order.
pub struct UpdateChecks {
    checkers: Vec<CheckHandle>,
}

impl UpdateChecks {
    pub fn start(checker: &UpdateChecker, components: Vec<TrackedComponent>) -> Self {
        let checkers = components
            .into_iter()
            .map(|component| checker.spawn(component))
            .collect();

        Self { checkers }
    }

    /// Check the tool, and the SDK when one is installed.
    pub fn start_default(checker: &UpdateChecker, sdk: Option<Arc<SdkManager>>) -> Self {
        let mut components = vec![tool_component()];

        match sdk.filter(|sdk| sdk.get_current_sdk().is_some()) {
            Some(sdk) => components.push(sdk_component(sdk)),
            None => debug!("No SDK installed, skipping SDK update check"),
        }

        Self::start(checker, components)
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    /// Give outstanding checks until `timeout` from now to finish.
    ///
    /// Checks are awaited in creation order against a single deadline, so the
    /// total time spent here never exceeds `timeout`. Checks still running
    /// afterwards are detached, not cancelled.
    ///
    /// A timeout too large to represent as a deadline waits for every check.
    pub async fn wait_for_update_checks(self, timeout: Duration) {
        let deadline = Instant::now().checked_add(timeout);

        for mut checker in self.checkers {
            let result = match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        debug!("Update check deadline passed before {}", checker.component);
                        break;
                    }
                    tokio::time::timeout_at(deadline, &mut checker.handle).await
                }
                None => Ok((&mut checker.handle).await),
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Update check for {} did not complete: {}", checker.component, e),
                Err(_) => debug!("Stopped waiting for update check of {}", checker.component),
            }
        }
    }
}

/// Platform tag used in the tool's component name, e.g. `linux64`.
pub fn platform_tag() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win",
        other => other,
    };
    format!("{}{}", os, usize::BITS)
}

pub fn tool_component() -> TrackedComponent {
    TrackedComponent::new(
        format!("pebble-tool-{}", platform_tag()),
        env!("CARGO_PKG_VERSION"),
        |version| {
            let homebrew = std::env::var_os("PEBBLE_IS_HOMEBREW").is_some();
            println!();
            println!("{}", tool_update_message(version, homebrew));
        },
    )
}

pub fn tool_update_message(version: &str, homebrew: bool) -> String {
    let instructions = if homebrew {
        "Run `brew update && brew upgrade pebble-sdk` to get it."
    } else {
        "Head to https://developer.getpebble.com/sdk/ to get it."
    };
    format!("An updated pebble tool, version {version}, is available.\n{instructions}")
}

pub fn sdk_component(sdk: Arc<SdkManager>) -> TrackedComponent {
    TrackedComponent::new(SDK_COMPONENT, "", move |version| {
        let installed = sdk.list_local_sdk_versions().unwrap_or_default();
        if let Some(message) = sdk_update_message(version, &installed) {
            println!();
            println!("{message}");
        }
    })
}

/// Notice for a new SDK, or `None` if that version is already installed.
pub fn sdk_update_message(version: &str, installed: &[String]) -> Option<String> {
    if installed.iter().any(|v| v == version) {
        return None;
    }
    Some(format!(
        "A new SDK, version {version}, is available! Run `pebble sdk install {version}` to get it."
    ))
}
