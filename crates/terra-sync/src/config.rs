use std::path::PathBuf;
use std::time::Duration;

use terra_drift::DriftPaths;
use terra_storage::{default_user_agents, BackoffPolicy, FetcherConfig};

pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * Mon";

/// Runtime settings, read from `TERRA_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct TerraConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub live_fetch: bool,
    pub user_agents: Vec<String>,
    pub min_request_interval: Duration,
    pub max_retries: usize,
    pub http_timeout: Duration,
    pub http_fallback_timeout: Duration,
    /// Hard ceiling on one source attempt, retries included.
    pub source_deadline: Duration,
    pub max_listings: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

impl TerraConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let workspace_root = lookup("TERRA_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let data_dir = lookup("TERRA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join("data"));
        let user_agents = lookup("TERRA_USER_AGENTS")
            .map(|v| {
                v.split('|')
                    .map(str::trim)
                    .filter(|ua| !ua.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|agents| !agents.is_empty())
            .unwrap_or_else(default_user_agents);

        Self {
            data_dir,
            live_fetch: lookup("TERRA_LIVE_FETCH").map(|v| truthy(&v)).unwrap_or(true),
            user_agents,
            min_request_interval: Duration::from_millis(number("TERRA_MIN_REQUEST_INTERVAL_MS", 2_000)),
            max_retries: number("TERRA_MAX_RETRIES", 3) as usize,
            http_timeout: Duration::from_secs(number("TERRA_HTTP_TIMEOUT_SECS", 15)),
            http_fallback_timeout: Duration::from_secs(number("TERRA_HTTP_FALLBACK_TIMEOUT_SECS", 30)),
            source_deadline: Duration::from_secs(number("TERRA_SOURCE_DEADLINE_SECS", 120)),
            max_listings: number("TERRA_MAX_LISTINGS", 50) as usize,
            scheduler_enabled: lookup("TERRA_SCHEDULER_ENABLED")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            sync_cron: lookup("TERRA_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            workspace_root,
        }
    }

    pub fn sources_file(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.workspace_root.join("config")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn drift_paths(&self) -> DriftPaths {
        let config_dir = self.config_dir();
        DriftPaths {
            benchmarks_file: config_dir.join("benchmarks.yaml"),
            regions_file: config_dir.join("regions.yaml"),
            drift_config_file: config_dir.join("drift.yaml"),
            history_dir: self.data_dir.join("history"),
            backups_dir: self.data_dir.join("backups"),
            recalibration_dir: self.reports_dir().join("recalibration"),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            min_interval: self.min_request_interval,
            first_timeout: self.http_timeout,
            fallback_timeout: self.http_fallback_timeout,
            user_agents: self.user_agents.clone(),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> TerraConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TerraConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config(&[]);
        assert_eq!(config.workspace_root, PathBuf::from("."));
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert!(config.live_fetch);
        assert_eq!(config.min_request_interval, Duration::from_secs(2));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.source_deadline, Duration::from_secs(120));
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.user_agents, default_user_agents());
    }

    #[test]
    fn environment_overrides_and_derived_paths() {
        let config = config(&[
            ("TERRA_WORKSPACE_ROOT", "/srv/terra"),
            ("TERRA_LIVE_FETCH", "false"),
            ("TERRA_USER_AGENTS", "agent-a | agent-b"),
            ("TERRA_MAX_RETRIES", "5"),
            ("TERRA_MIN_REQUEST_INTERVAL_MS", "250"),
            ("TERRA_SCHEDULER_ENABLED", "1"),
            ("TERRA_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]);
        assert!(!config.live_fetch);
        assert_eq!(config.user_agents, vec!["agent-a", "agent-b"]);
        assert_eq!(config.http_timeout, Duration::from_secs(15));
        assert!(config.scheduler_enabled);

        let fetcher = config.fetcher_config();
        assert_eq!(fetcher.backoff.max_retries, 5);
        assert_eq!(fetcher.min_interval, Duration::from_millis(250));

        let paths = config.drift_paths();
        assert_eq!(paths.history_dir, PathBuf::from("/srv/terra/data/history"));
        assert_eq!(paths.benchmarks_file, PathBuf::from("/srv/terra/config/benchmarks.yaml"));
        assert_eq!(
            paths.recalibration_dir,
            PathBuf::from("/srv/terra/reports/recalibration")
        );
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/terra/data/cache"));
    }

    #[tokio::test]
    async fn shipped_drift_configuration_loads() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let data = tempfile::tempdir().unwrap();
        let config = config(&[
            ("TERRA_WORKSPACE_ROOT", root.to_str().unwrap()),
            ("TERRA_DATA_DIR", data.path().to_str().unwrap()),
        ]);
        let monitor = terra_drift::DriftMonitor::open(config.drift_paths()).await.unwrap();
        assert_eq!(monitor.benchmarks().await.currency, "IDR");
        assert_eq!(monitor.config(), &terra_drift::DriftConfig::default());
        let jogja = monitor.classify("Jogja").unwrap();
        assert_eq!(jogja.region, "Kota Yogyakarta");
        assert_eq!(jogja.tier, terra_core::Tier::Secondary);
    }
}
