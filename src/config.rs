use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use duration_string::DurationString;

use crate::{helper, store::ObjectKey, Error, Result};

/// Name of the one authorized OCSInitialization instance
pub static CANONICAL_NAME: &str = "ocsinit";

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    s.parse::<DurationString>()
        .map(Into::into)
        .map_err(|e| format!("invalid duration `{s}`: {e:?}"))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about = "Maintains the OCSInitialization singleton and provisions storage defaults"
)]
pub struct Settings {
    /// Namespace holding the singleton; defaults to the pod's own namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Also watch other namespaces so misplaced instances get flagged
    #[arg(long, env = "OCS_WATCH_ALL_NAMESPACES")]
    pub all_namespaces: bool,

    /// Multi-document YAML file with the StorageClasses to provision
    #[arg(long, env = "OCS_STORAGE_CLASSES")]
    pub storage_classes: Option<PathBuf>,

    /// Deadline for all store calls made by one reconcile
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub store_timeout: Duration,

    /// How often the singleton is reconciled without a change notification
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    pub resync_interval: Duration,

    /// Retry delay after a failed reconcile
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub error_backoff: Duration,

    /// Reconciles of distinct objects that may run at once
    #[arg(long, default_value_t = 2)]
    pub workers: u16,

    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact, env = "OCS_LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl Settings {
    /// Resolve the watch scope, falling back to the service account namespace
    pub fn watch_scope(&self) -> Result<WatchScope> {
        let namespace = match &self.watch_namespace {
            Some(ns) => ns.clone(),
            None => helper::get_my_namespace().map_err(|e| {
                Error::ConfigError(format!("watch namespace not set and not discoverable: {e}"))
            })?,
        };
        WatchScope::new(namespace, self.all_namespaces)
    }

    pub fn dispatch(&self) -> Result<DispatchSettings> {
        Ok(DispatchSettings {
            resync_interval: non_zero("resync-interval", self.resync_interval)?,
            error_backoff: non_zero("error-backoff", self.error_backoff)?,
            workers: self.workers.max(1),
        })
    }

    /// Deadline for the store calls of one reconcile
    pub fn deadline(&self) -> Result<Duration> {
        non_zero("store-timeout", self.store_timeout)
    }
}

fn non_zero(flag: &str, value: Duration) -> Result<Duration> {
    if value.is_zero() {
        return Err(Error::ConfigError(format!("--{flag} must be greater than zero")));
    }
    Ok(value)
}

/// Retry and concurrency policy of the controller
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub resync_interval: Duration,
    pub error_backoff: Duration,
    pub workers: u16,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(10 * 60),
            error_backoff: Duration::from_secs(5),
            workers: 2,
        }
    }
}

/// Resolved once at startup and immutable afterwards
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchScope {
    namespace: String,
    all_namespaces: bool,
}

impl WatchScope {
    pub fn new(namespace: impl Into<String>, all_namespaces: bool) -> Result<Self> {
        let namespace = namespace.into().trim().to_string();
        if namespace.is_empty() {
            return Err(Error::ConfigError("watch namespace is empty".into()));
        }
        Ok(Self {
            namespace,
            all_namespaces,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn all_namespaces(&self) -> bool {
        self.all_namespaces
    }

    /// The single (namespace, name) the reconciler is allowed to manage
    pub fn canonical_identity(&self) -> ObjectKey {
        ObjectKey::namespaced(self.namespace.clone(), CANONICAL_NAME)
    }
}
