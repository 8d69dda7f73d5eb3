use crate::domain::types::{BillingPeriod, UsageGroupDefinition};
use crate::error::{BillingError, Result};
use chrono::Weekday;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub cycle: CycleConfig,
    pub usage: UsageConfig,
    #[serde(default)]
    pub plans: Vec<PlanConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service_id: String,
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
    /// Upper bound on waiting for the usage scope lock during a gauge takeover
    pub lock_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_seconds)
    }
}

/// Cadence of the billing cycles resolved by the calculator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Name stored on every cycle row, e.g. "monthly"
    pub cycle_type: String,
    pub period: BillingPeriod,
    /// Asynchronous cycles start at the instant that first created them
    /// instead of being aligned to calendar boundaries.
    pub asynchronous: bool,
    pub week_start: Weekday,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    pub conflict_retries_enabled: bool,
}

/// A plan and the usage groups it meters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub usage_groups: Vec<UsageGroupDefinition>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                service_id: "license-billing".to_string(),
                environment: "development".to_string(),
            },
            database: DatabaseConfig {
                url: "postgres://billing@localhost:5432/license_billing".to_string(),
                max_connections: 32,
                min_connections: 2,
                connect_timeout_seconds: 30,
                acquire_timeout_seconds: 30,
                idle_timeout_seconds: 600,
                max_lifetime_seconds: 1800,
                lock_timeout_ms: 5000,
            },
            cycle: CycleConfig {
                cycle_type: "monthly".to_string(),
                period: BillingPeriod::Month,
                asynchronous: false,
                week_start: Weekday::Mon,
            },
            usage: UsageConfig {
                conflict_retries_enabled: true,
            },
            plans: Vec::new(),
        }
    }
}

impl BillingConfig {
    /// Layers defaults, an optional TOML file and `BILLING_` environment
    /// variables (nested keys separated by `__`).
    pub fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(BillingConfig::default()));

        if let Some(path) = path_override {
            if !path.exists() {
                return Err(BillingError::ConfigurationError {
                    message: format!("config file {} does not exist", path.display()),
                });
            }
            figment = figment.merge(Toml::file(&path));
        } else {
            let default_path = PathBuf::from("billing.toml");
            if default_path.exists() {
                figment = figment.merge(Toml::file(default_path));
            }
        }

        figment = figment.merge(Env::prefixed("BILLING_").split("__"));

        let config: BillingConfig =
            figment
                .extract()
                .map_err(|e| BillingError::ConfigurationError {
                    message: e.to_string(),
                })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(Self::invalid("database.url must not be empty"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(Self::invalid(
                "database.min_connections exceeds database.max_connections",
            ));
        }
        if self.cycle.cycle_type.trim().is_empty() {
            return Err(Self::invalid("cycle.cycle_type must not be empty"));
        }

        let mut plan_ids = HashSet::new();
        for plan in &self.plans {
            if !plan_ids.insert(plan.id.as_str()) {
                return Err(Self::invalid(&format!("duplicate plan id {}", plan.id)));
            }

            let mut group_names = HashSet::new();
            for group in &plan.usage_groups {
                if !group_names.insert(group.name.as_str()) {
                    return Err(Self::invalid(&format!(
                        "plan {} defines usage group {} twice",
                        plan.id, group.name
                    )));
                }
                if group.free_quantity < Decimal::ZERO {
                    return Err(Self::invalid(&format!(
                        "plan {} group {} has a negative free_quantity",
                        plan.id, group.name
                    )));
                }
                if group.initial_quantity.map_or(false, |q| q < Decimal::ZERO) {
                    return Err(Self::invalid(&format!(
                        "plan {} group {} has a negative initial_quantity",
                        plan.id, group.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn invalid(message: &str) -> BillingError {
        BillingError::ConfigurationError {
            message: message.to_string(),
        }
    }
}
