#![forbid(unsafe_code)]

//! Reconciler tuning as data.
//!
//! Every knob the reconciler consults lives in [`ReconcilerConfig`]. The
//! defaults reproduce the behavior the runtime is tested against, so
//! `ReconcilerConfig::default()` is always a safe starting point.
//!
//! # Loading
//!
//! ```toml
//! # fibra.toml
//! nested_update_limit = 100
//! fallback_throttle_ms = 300
//! ```
//!
//! ```rust,ignore
//! let config = ReconcilerConfig::from_toml_str(text)?;
//! ```

#[cfg(feature = "config-serde")]
use serde::{Deserialize, Serialize};

use crate::lane::ExpirationWindows;
use crate::scheduler::Timestamp;

/// Tunables consulted by the reconciler.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-serde", serde(default))]
pub struct ReconcilerConfig {
    /// Expiry window for sync and input-continuous lanes.
    pub sync_expiration_ms: Timestamp,

    /// Expiry window for default and transition lanes.
    pub transition_expiration_ms: Timestamp,

    /// Synchronous re-commits of one root before the update loop is fatal.
    pub nested_update_limit: u32,

    /// Passive-effect flushes that schedule more passive work before a
    /// warning is logged.
    pub nested_passive_update_limit: u32,

    /// Render-phase re-renders of one component before it errors.
    pub rerender_limit: u32,

    /// Minimum time between two retry-only fallback reveals.
    pub fallback_throttle_ms: Timestamp,

    /// Time budget for rendering SuspenseList tail rows in one pass.
    pub suspense_list_render_timeout_ms: Timestamp,

    /// Delays shorter than this commit immediately instead of scheduling.
    pub min_suspense_timeout_ms: Timestamp,

    /// Compute state eagerly on dispatch and skip equal updates.
    pub eager_state_bailout: bool,

    /// Time-slice default-lane renders on concurrent roots.
    pub concurrent_updates_by_default: bool,

    /// Record render durations for profiler boundaries.
    pub profiling: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sync_expiration_ms: 250,
            transition_expiration_ms: 5000,
            nested_update_limit: 50,
            nested_passive_update_limit: 50,
            rerender_limit: 25,
            fallback_throttle_ms: 500,
            suspense_list_render_timeout_ms: 500,
            min_suspense_timeout_ms: 10,
            eager_state_bailout: true,
            concurrent_updates_by_default: false,
            profiling: true,
        }
    }
}

/// Errors from loading or validating a [`ReconcilerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "config-serde")]
    #[error("config toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[cfg(feature = "config-serde")]
    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl ReconcilerConfig {
    #[must_use]
    pub fn with_nested_update_limit(mut self, limit: u32) -> Self {
        self.nested_update_limit = limit;
        self
    }

    #[must_use]
    pub fn with_rerender_limit(mut self, limit: u32) -> Self {
        self.rerender_limit = limit;
        self
    }

    #[must_use]
    pub fn with_eager_state_bailout(mut self, enabled: bool) -> Self {
        self.eager_state_bailout = enabled;
        self
    }

    #[must_use]
    pub fn with_concurrent_updates_by_default(mut self, enabled: bool) -> Self {
        self.concurrent_updates_by_default = enabled;
        self
    }

    #[must_use]
    pub fn with_fallback_throttle_ms(mut self, ms: Timestamp) -> Self {
        self.fallback_throttle_ms = ms;
        self
    }

    #[must_use]
    pub fn expiration_windows(&self) -> ExpirationWindows {
        ExpirationWindows {
            sync_ms: self.sync_expiration_ms,
            transition_ms: self.transition_expiration_ms,
        }
    }

    /// Load from a TOML string.
    #[cfg(feature = "config-serde")]
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validated()
    }

    /// Load from a JSON string.
    #[cfg(feature = "config-serde")]
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validated()
    }

    /// Load from a TOML file on disk.
    #[cfg(feature = "config-serde")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Return every constraint violation.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.sync_expiration_ms <= 0 {
            errors.push(format!(
                "sync_expiration_ms must be > 0, got {}",
                self.sync_expiration_ms
            ));
        }
        if self.transition_expiration_ms < self.sync_expiration_ms {
            errors.push(format!(
                "transition_expiration_ms must be >= sync_expiration_ms, got {}",
                self.transition_expiration_ms
            ));
        }
        if self.nested_update_limit == 0 {
            errors.push("nested_update_limit must be > 0".into());
        }
        if self.rerender_limit == 0 {
            errors.push("rerender_limit must be > 0".into());
        }
        if self.fallback_throttle_ms < 0 {
            errors.push(format!(
                "fallback_throttle_ms must be >= 0, got {}",
                self.fallback_throttle_ms
            ));
        }
        errors
    }

    /// `self` if valid, otherwise every violation.
    pub fn validated(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ReconcilerConfig::default().validate().is_empty());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let cfg = ReconcilerConfig::default()
            .with_nested_update_limit(0)
            .with_rerender_limit(0);
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("nested_update_limit")));
        assert!(errors.iter().any(|e| e.contains("rerender_limit")));
        assert!(matches!(cfg.validated(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn expiration_windows_follow_fields() {
        let cfg = ReconcilerConfig {
            sync_expiration_ms: 100,
            transition_expiration_ms: 900,
            ..ReconcilerConfig::default()
        };
        let w = cfg.expiration_windows();
        assert_eq!((w.sync_ms, w.transition_ms), (100, 900));
    }

    #[cfg(feature = "config-serde")]
    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = ReconcilerConfig::from_toml_str("nested_update_limit = 7\n").expect("parse");
        assert_eq!(cfg.nested_update_limit, 7);
        assert_eq!(cfg.rerender_limit, 25);
    }

    #[cfg(feature = "config-serde")]
    #[test]
    fn json_round_trip() {
        let cfg = ReconcilerConfig::default().with_eager_state_bailout(false);
        let text = serde_json::to_string(&cfg).expect("serialize");
        let back = ReconcilerConfig::from_json_str(&text).expect("parse");
        assert_eq!(back, cfg);
    }
}
