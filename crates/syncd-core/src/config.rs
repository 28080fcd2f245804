use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// DatabaseConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("syncd.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the status gateway.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cadence / DriverConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Fire every interval regardless of how long ticks take; ticks may
    /// overlap.
    FixedRate,
    /// Sleep for the interval after each completed round.
    FixedDelay,
}

/// Per-driver settings as written in the config file. `cadence` and
/// `interval_secs` default differently for each driver, see
/// `ReconcileConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence: Option<Cadence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

const DEFAULT_SELECT_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 10 * 60;
const DEFAULT_MAX_CONCURRENCY: usize = 1000;
/// Upper bound for any configured interval, budget or claim ttl.
const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

impl DriverConfig {
    fn resolve(&self, cadence: Cadence, interval_secs: u64) -> DriverSettings {
        let select_timeout = self
            .select_timeout_secs
            .unwrap_or(DEFAULT_SELECT_TIMEOUT_SECS);
        let dispatch_timeout = self
            .dispatch_timeout_secs
            .unwrap_or(DEFAULT_DISPATCH_TIMEOUT_SECS);
        // A claim lasts as long as the round that stamped it may run.
        let claim_ttl = self
            .claim_ttl_secs
            .unwrap_or_else(|| select_timeout.saturating_add(dispatch_timeout));
        DriverSettings {
            cadence: self.cadence.unwrap_or(cadence),
            interval: Duration::from_secs(self.interval_secs.unwrap_or(interval_secs)),
            select_timeout: Duration::from_secs(select_timeout),
            dispatch_timeout: Duration::from_secs(dispatch_timeout),
            claim_ttl: Duration::from_secs(claim_ttl),
            max_concurrency: self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
        }
    }
}

/// Resolved settings for one reconciliation driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub cadence: Cadence,
    pub interval: Duration,
    /// Budget for listing candidates and stamping claims.
    pub select_timeout: Duration,
    /// Budget for the fan-out phase.
    pub dispatch_timeout: Duration,
    /// Age after which a claim no longer hides a record from selection.
    /// Defaults to `select_timeout + dispatch_timeout`. A shorter value lets
    /// the next round re-dispatch records an earlier round is still syncing;
    /// a longer one delays the retry of records whose round died.
    pub claim_ttl: Duration,
    pub max_concurrency: usize,
}

// ---------------------------------------------------------------------------
// ReconcileConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub deployments: DriverConfig,
    #[serde(default)]
    pub build_artifacts: DriverConfig,
}

impl ReconcileConfig {
    /// Deployments: fixed rate, every minute.
    pub fn deployment_settings(&self) -> DriverSettings {
        self.deployments.resolve(Cadence::FixedRate, 60)
    }

    /// Build artifacts: fixed delay, 20 seconds between rounds.
    pub fn build_artifact_settings(&self) -> DriverSettings {
        self.build_artifacts.resolve(Cadence::FixedDelay, 20)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Config {
    /// Read a YAML config file. An empty file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. The status gateway must be an http(s) URL
        let url = self.remote.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "remote.base_url '{}' must start with http:// or https://",
                    self.remote.base_url
                ),
            });
        }
        if self.remote.request_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "remote.request_timeout_secs must be greater than zero".to_string(),
            });
        }

        // 2. Driver budgets
        for (name, s) in [
            ("deployments", self.reconcile.deployment_settings()),
            ("build_artifacts", self.reconcile.build_artifact_settings()),
        ] {
            let zero_fields = [
                ("interval_secs", s.interval.is_zero()),
                ("select_timeout_secs", s.select_timeout.is_zero()),
                ("dispatch_timeout_secs", s.dispatch_timeout.is_zero()),
                ("max_concurrency", s.max_concurrency == 0),
            ];
            for (field, is_zero) in zero_fields {
                if is_zero {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("reconcile.{name}.{field} must be greater than zero"),
                    });
                }
            }

            let too_long = [
                ("interval_secs", s.interval),
                ("select_timeout_secs", s.select_timeout),
                ("dispatch_timeout_secs", s.dispatch_timeout),
                ("claim_ttl_secs", s.claim_ttl),
            ];
            for (field, value) in too_long {
                if value.as_secs() > MAX_DURATION_SECS {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "reconcile.{name}.{field} must be at most {MAX_DURATION_SECS}"
                        ),
                    });
                }
            }

            let round_budget = s.select_timeout.saturating_add(s.dispatch_timeout);
            if s.claim_ttl < round_budget {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "reconcile.{name}.claim_ttl_secs ({}s) is shorter than the round budget \
                         ({}s); later rounds may re-dispatch records still being synced",
                        s.claim_ttl.as_secs(),
                        round_budget.as_secs()
                    ),
                });
            }
        }

        warnings
    }
}
