//! Configuration module for credit-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::models::AccountType;

#[derive(Debug, Clone)]
pub struct CreditConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Absent: the in-memory ledger store is used.
    pub database: Option<DatabaseConfig>,
    pub scheduler: SchedulerConfig,
    pub entitlement: EntitlementConfig,
    pub notifications: NotificationConfig,
    pub coupons: CouponConfig,
    pub catalog_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub workers: usize,
    pub signal_queue_size: usize,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            workers: 4,
            signal_queue_size: 1024,
        }
    }
}

/// Percent-used thresholds that turn on `low_credits`, per account type.
#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    pub low_credit_thresholds: HashMap<AccountType, u8>,
}

impl EntitlementConfig {
    pub const DEFAULT_THRESHOLD: u8 = 80;

    pub fn threshold_for(&self, account_type: AccountType) -> u8 {
        self.low_credit_thresholds
            .get(&account_type)
            .copied()
            .unwrap_or(Self::DEFAULT_THRESHOLD)
    }
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            low_credit_thresholds: AccountType::ALL
                .iter()
                .map(|t| (*t, Self::DEFAULT_THRESHOLD))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub account_types: Vec<AccountType>,
}

impl NotificationConfig {
    pub fn delivers_to(&self, account_type: AccountType) -> bool {
        self.account_types.contains(&account_type)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            account_types: AccountType::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CouponConfig {
    pub max_uses_standard: u32,
    pub max_uses_non_standard: u32,
    pub default_validity_days: i64,
}

impl Default for CouponConfig {
    fn default() -> Self {
        Self {
            max_uses_standard: 1,
            max_uses_non_standard: 1000,
            default_validity_days: 90,
        }
    }
}

fn threshold_from_env(key: &str) -> Result<u8, AppError> {
    match env::var(key) {
        Err(_) => Ok(EntitlementConfig::DEFAULT_THRESHOLD),
        Ok(raw) => raw
            .trim()
            .parse::<u8>()
            .ok()
            .filter(|pct| *pct <= 100)
            .ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "{} must be a percentage between 0 and 100, got {}",
                    key,
                    raw
                ))
            }),
    }
}

impl CreditConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let database = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(|url| DatabaseConfig {
                url,
                max_connections: core_config::Config::env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: core_config::Config::env_or("DATABASE_MIN_CONNECTIONS", 2),
            });

        let mut low_credit_thresholds = HashMap::new();
        low_credit_thresholds.insert(
            AccountType::Standard,
            threshold_from_env("LOW_CREDIT_THRESHOLD_STANDARD")?,
        );
        low_credit_thresholds.insert(
            AccountType::Premium,
            threshold_from_env("LOW_CREDIT_THRESHOLD_PREMIUM")?,
        );
        low_credit_thresholds.insert(
            AccountType::Enterprise,
            threshold_from_env("LOW_CREDIT_THRESHOLD_ENTERPRISE")?,
        );

        let notify_types = match core_config::Config::env_list("NOTIFY_ACCOUNT_TYPES") {
            None => AccountType::ALL.to_vec(),
            Some(names) => names
                .iter()
                .map(|n| n.parse::<AccountType>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(AppError::ConfigError)?,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "credit-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|e| !e.is_empty()),
            database,
            scheduler: SchedulerConfig {
                enabled: core_config::Config::env_or("SCHEDULER_ENABLED", true),
                interval_secs: core_config::Config::env_or("SCHEDULER_INTERVAL_SECS", 60),
                workers: core_config::Config::env_or("SCHEDULER_WORKERS", 4usize).max(1),
                signal_queue_size: 1024,
            },
            entitlement: EntitlementConfig {
                low_credit_thresholds,
            },
            notifications: NotificationConfig {
                account_types: notify_types,
            },
            coupons: CouponConfig {
                max_uses_standard: core_config::Config::env_or("COUPON_MAX_USES_STANDARD", 1),
                max_uses_non_standard: core_config::Config::env_or(
                    "COUPON_MAX_USES_NON_STANDARD",
                    1000,
                ),
                default_validity_days: core_config::Config::env_or(
                    "COUPON_DEFAULT_VALIDITY_DAYS",
                    90,
                ),
            },
            catalog_path: env::var("PRODUCT_CATALOG_PATH").ok().filter(|p| !p.is_empty()),
        })
    }

    /// Configuration for tests: in-memory store, ephemeral port, scheduler loop off.
    pub fn for_tests() -> Self {
        Self {
            common: core_config::Config { port: 0 },
            service_name: "credit-service-test".to_string(),
            service_version: "test".to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
            database: None,
            scheduler: SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            },
            entitlement: EntitlementConfig::default(),
            notifications: NotificationConfig::default(),
            coupons: CouponConfig::default(),
            catalog_path: None,
        }
    }
}
