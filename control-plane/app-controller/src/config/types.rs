use std::time::Duration;

use envconfig::Envconfig;

use crate::controller::retry::Backoff;

#[derive(Envconfig, Clone, Debug)]
pub struct ControllerConfig {
    #[envconfig(from = "APP_CTRL_HTTP_PORT", default = "8088")]
    pub http_port: u16,

    /// Namespace to watch; empty watches all namespaces.
    /// Env: APP_CTRL_WATCH_NAMESPACE
    #[envconfig(from = "APP_CTRL_WATCH_NAMESPACE", default = "")]
    pub watch_namespace: String,

    #[envconfig(from = "APP_CTRL_FIELD_MANAGER", default = "app-controller")]
    pub field_manager: String,

    /// Attempts for the status read-modify-write cycle.
    #[envconfig(from = "APP_CTRL_STATUS_RETRY_STEPS", default = "5")]
    pub status_retry_steps: u32,

    /// First retry delay; doubled per attempt.
    #[envconfig(from = "APP_CTRL_STATUS_RETRY_BACKOFF_MS", default = "10")]
    pub status_retry_backoff_ms: u64,

    #[envconfig(from = "APP_CTRL_RECONCILE_TIMEOUT_SECS", default = "30")]
    pub reconcile_timeout_secs: u64,

    #[envconfig(from = "APP_CTRL_ERROR_REQUEUE_SECS", default = "15")]
    pub error_requeue_secs: u64,

    /// Requeue delay after a child creation lost a race.
    #[envconfig(from = "APP_CTRL_DEFERRED_REQUEUE_SECS", default = "5")]
    pub deferred_requeue_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_port: 8088,
            watch_namespace: String::new(),
            field_manager: "app-controller".into(),
            status_retry_steps: 5,
            status_retry_backoff_ms: 10,
            reconcile_timeout_secs: 30,
            error_requeue_secs: 15,
            deferred_requeue_secs: 5,
        }
    }
}

impl ControllerConfig {
    pub fn watch_namespace(&self) -> Option<&str> {
        let ns = self.watch_namespace.trim();
        (!ns.is_empty()).then_some(ns)
    }

    pub fn status_backoff(&self) -> Backoff {
        Backoff::new(
            self.status_retry_steps.max(1),
            Duration::from_millis(self.status_retry_backoff_ms),
        )
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn deferred_requeue(&self) -> Duration {
        Duration::from_secs(self.deferred_requeue_secs)
    }
}
