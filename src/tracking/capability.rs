//! Capabilities the coordinator consumes but does not implement.
//!
//! The coordinator only sees these traits: a position source that yields
//! [`Fix`]es, a permission signal, and a named-task scheduler. Concrete
//! implementations live next door ([`super::gpsd`], [`super::scheduler`],
//! [`StaticPermissions`]); tests plug in their own.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::gate::Fix;

/// Requested accuracy. Sources map this to whatever knob they have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    Lowest,
    Low,
    #[default]
    Balanced,
    High,
    Highest,
    BestForNavigation,
}

impl AccuracyTier {
    /// Largest acceptable horizontal error estimate, in meters.
    pub fn max_error_m(self) -> f64 {
        match self {
            Self::Lowest => 3000.0,
            Self::Low => 1000.0,
            Self::Balanced => 100.0,
            Self::High => 10.0,
            Self::Highest | Self::BestForNavigation => 5.0,
        }
    }
}

/// Cadence and quality requested from a [`PositionSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceOptions {
    pub accuracy: AccuracyTier,
    /// Emit at least this often while fixes are available.
    pub min_time_interval_ms: u64,
    /// Emit immediately after moving this far.
    pub min_distance_interval_m: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("position source unavailable: {0}")]
    Unavailable(String),
}

/// Something that periodically yields raw fixes.
///
/// The returned channel closing means "no more data" (source gone,
/// permission revoked); it is not an error. Dropping the receiver releases
/// the subscription.
pub trait PositionSource: Send + Sync {
    fn watch(&self, options: SourceOptions) -> Result<mpsc::Receiver<Fix>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Authorization signal checked before a producer starts.
pub trait PermissionProvider: Send + Sync {
    fn status(&self, scope: PermissionScope) -> PermissionStatus;
}

/// Grants fixed at startup (from config), revocable at runtime.
pub struct StaticPermissions {
    foreground: AtomicBool,
    background: AtomicBool,
}

impl StaticPermissions {
    #[must_use]
    pub fn new(foreground: bool, background: bool) -> Self {
        Self {
            foreground: AtomicBool::new(foreground),
            background: AtomicBool::new(background),
        }
    }

    pub fn set(&self, scope: PermissionScope, granted: bool) {
        match scope {
            PermissionScope::Foreground => self.foreground.store(granted, Ordering::Relaxed),
            PermissionScope::Background => self.background.store(granted, Ordering::Relaxed),
        }
    }
}

impl PermissionProvider for StaticPermissions {
    fn status(&self, scope: PermissionScope) -> PermissionStatus {
        let granted = match scope {
            PermissionScope::Foreground => self.foreground.load(Ordering::Relaxed),
            PermissionScope::Background => self.background.load(Ordering::Relaxed),
        };
        if granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("task {0} is already registered")]
    AlreadyRegistered(String),
    #[error("scheduler rejected task {name}: {reason}")]
    Rejected { name: String, reason: String },
}

/// Registry of named long-running tasks.
pub trait TaskScheduler: Send + Sync {
    /// Start `task` under `name`. The task must return once `cancel` fires.
    fn register(
        &self,
        name: &str,
        task: BoxFuture<'static, ()>,
        cancel: CancellationToken,
    ) -> Result<(), ScheduleError>;

    /// Cancel the task and wait for it to finish. `false` if nothing was
    /// registered under `name`.
    fn deregister<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool>;

    /// Whether a task is registered under `name` and still running.
    fn is_registered(&self, name: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_permissions_can_be_revoked() {
        let perms = StaticPermissions::new(true, false);
        assert!(perms.status(PermissionScope::Foreground).is_granted());
        assert_eq!(
            perms.status(PermissionScope::Background),
            PermissionStatus::Denied
        );

        perms.set(PermissionScope::Foreground, false);
        perms.set(PermissionScope::Background, true);
        assert!(!perms.status(PermissionScope::Foreground).is_granted());
        assert!(perms.status(PermissionScope::Background).is_granted());
    }

    #[test]
    fn accuracy_tiers_tighten() {
        assert!(AccuracyTier::Low.max_error_m() > AccuracyTier::Balanced.max_error_m());
        assert!(AccuracyTier::Balanced.max_error_m() > AccuracyTier::High.max_error_m());
        let tier: AccuracyTier = serde_json::from_str("\"best_for_navigation\"").unwrap();
        assert_eq!(tier, AccuracyTier::BestForNavigation);
    }
}
