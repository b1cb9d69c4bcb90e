//! Runtime configuration.
//!
//! Settings come from an optional TOML file plus environment overrides
//! (loaded once at startup via `dotenvy`). Everything the core needs is
//! resolved here; no component reads the environment on its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::ServiceType;
use crate::pool::SelectionStrategy;

/// Endpoint URL lists, one per worker service type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub static_analysis: Vec<String>,
    pub dynamic_analysis: Vec<String>,
    pub performance: Vec<String>,
    pub ai_review: Vec<String>,
}

impl EndpointSettings {
    pub fn for_service(&self, service: ServiceType) -> &[String] {
        match service {
            ServiceType::StaticAnalysis => &self.static_analysis,
            ServiceType::DynamicAnalysis => &self.dynamic_analysis,
            ServiceType::Performance => &self.performance,
            ServiceType::AiReview => &self.ai_review,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub cooldown_secs: u64,
    pub probe_timeout_secs: u64,
    pub strategy: SelectionStrategy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            probe_timeout_secs: 2,
            strategy: SelectionStrategy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_concurrent_generation: usize,
    pub max_concurrent_analysis: usize,
    pub poll_interval_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_generation: 2,
            max_concurrent_analysis: 2,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    pub interval_secs: u64,
    pub running_timeout_secs: u64,
    pub pending_timeout_secs: u64,
    pub grace_period_secs: u64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            running_timeout_secs: 2 * 3600,
            pending_timeout_secs: 4 * 3600,
            grace_period_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub gateway_url: String,
    pub timeout_secs: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:8600/generate".to_string(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub lock_dir: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("crucible.db"),
            lock_dir: PathBuf::from(".crucible/locks"),
        }
    }
}

/// Top-level settings, read once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub endpoints: EndpointSettings,
    pub pool: PoolSettings,
    pub dispatch: DispatchSettings,
    pub pipeline: PipelineSettings,
    pub sweep: SweepSettings,
    pub generator: GeneratorSettings,
    pub database: DatabaseSettings,
}

impl Settings {
    /// Load settings from `path` (or `crucible.toml` in the working
    /// directory if present), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Pull in a .env file if there is one; absence is fine.
        dotenvy::dotenv().ok();

        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new("crucible.toml");
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_env();
        Ok(settings)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Environment overrides for the values that differ across deployments.
    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("CRUCIBLE_DB") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("CRUCIBLE_GATEWAY_URL") {
            self.generator.gateway_url = url;
        }
        for service in ServiceType::ALL {
            let var = format!("CRUCIBLE_ENDPOINTS_{}", service.as_str().to_uppercase());
            if let Ok(urls) = std::env::var(&var) {
                let parsed: Vec<String> = urls
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                match service {
                    ServiceType::StaticAnalysis => self.endpoints.static_analysis = parsed,
                    ServiceType::DynamicAnalysis => self.endpoints.dynamic_analysis = parsed,
                    ServiceType::Performance => self.endpoints.performance = parsed,
                    ServiceType::AiReview => self.endpoints.ai_review = parsed,
                }
            }
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.pool.cooldown_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.probe_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.pool.cooldown_secs, 60);
        assert_eq!(settings.pool.probe_timeout_secs, 2);
        assert_eq!(settings.pipeline.max_concurrent_generation, 2);
        assert_eq!(settings.sweep.grace_period_secs, 300);
        assert!(settings.endpoints.static_analysis.is_empty());
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            [endpoints]
            static_analysis = ["ws://worker-a:8100", "ws://worker-b:8100"]
            ai_review = ["ws://reviewer:8400"]

            [pool]
            cooldown_secs = 30
            strategy = "least_in_flight"

            [sweep]
            pending_timeout_secs = 7200
        "#;
        let settings: Settings = toml::from_str(raw).unwrap();
        assert_eq!(settings.endpoints.static_analysis.len(), 2);
        let ai_review = settings.endpoints.for_service(ServiceType::AiReview);
        assert_eq!(ai_review.len(), 1);
        assert_eq!(ai_review[0], "ws://reviewer:8400");
        assert_eq!(settings.pool.cooldown_secs, 30);
        assert_eq!(settings.pool.strategy, SelectionStrategy::LeastInFlight);
        assert_eq!(settings.sweep.pending_timeout_secs, 7200);
        // untouched sections keep their defaults
        assert_eq!(settings.dispatch.timeout_secs, 120);
    }

    #[test]
    fn test_for_service_covers_all_variants() {
        let settings = EndpointSettings {
            static_analysis: vec!["a".into()],
            dynamic_analysis: vec!["b".into()],
            performance: vec!["c".into()],
            ai_review: vec!["d".into()],
        };
        for service in ServiceType::ALL {
            assert_eq!(settings.for_service(service).len(), 1);
        }
    }
}
