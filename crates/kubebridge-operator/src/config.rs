//! Bridge configuration
//!
//! Flags with environment fallbacks, parsed by clap and checked by
//! [`BridgeConfig::validate`] before anything connects to the cluster.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use kubebridge_common::kube_utils::DEFAULT_READ_TIMEOUT;
use kubebridge_common::runtime::{ManagerOptions, DEFAULT_WORKERS, WATCH_TIMEOUT_SECS};
use kubebridge_common::telemetry::LogFormat;
use kubebridge_common::Error;

/// Runtime configuration of the bridge service
#[derive(Args, Debug, Clone)]
pub struct BridgeConfig {
    /// Path to a kubeconfig; in-cluster or default config is inferred when unset
    #[arg(long, env = "KUBEBRIDGE_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Concurrent reconciles per controller
    #[arg(long, env = "KUBEBRIDGE_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: u16,

    /// Server-side watch timeout in seconds (must be below the client read timeout)
    #[arg(long, env = "KUBEBRIDGE_WATCH_TIMEOUT_SECS", default_value_t = WATCH_TIMEOUT_SECS)]
    pub watch_timeout_secs: u32,

    /// Deadline for a single reconcile attempt, in seconds
    #[arg(long, env = "KUBEBRIDGE_ATTEMPT_TIMEOUT_SECS")]
    pub attempt_timeout_secs: Option<u64>,

    /// How long stop waits for in-flight reconciles before cancelling them
    #[arg(long, env = "KUBEBRIDGE_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Log output format: text or json
    #[arg(long, env = "KUBEBRIDGE_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            workers: DEFAULT_WORKERS,
            watch_timeout_secs: WATCH_TIMEOUT_SECS,
            attempt_timeout_secs: None,
            shutdown_grace_secs: 30,
            log_format: LogFormat::Text,
        }
    }
}

impl BridgeConfig {
    /// Reject values the bridge cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.watch_timeout_secs == 0
            || u64::from(self.watch_timeout_secs) >= DEFAULT_READ_TIMEOUT.as_secs()
        {
            return Err(Error::config(format!(
                "watch timeout must be between 1 and {} seconds, got {}",
                DEFAULT_READ_TIMEOUT.as_secs() - 1,
                self.watch_timeout_secs
            )));
        }
        if self.attempt_timeout_secs == Some(0) {
            return Err(Error::config("attempt timeout must be positive when set"));
        }
        if let Some(path) = &self.kubeconfig {
            if !path.exists() {
                return Err(Error::config(format!(
                    "kubeconfig {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Options for the controller manager
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            concurrency: self.workers,
            attempt_timeout: self.attempt_timeout_secs.map(Duration::from_secs),
            watch_timeout_secs: self.watch_timeout_secs,
        }
    }

    /// Grace period granted to in-flight reconciles on shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
