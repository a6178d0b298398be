use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use super::config::{ConfigRejection, ScoringConfig};
use super::repository::{ConfigRepository, RepositoryError};

/// Key under which the scoring config blob lives in the kv table.
pub const CONFIG_KEY: &str = "fraud_config";

const CACHE_TTL: Duration = Duration::from_secs(30);

struct CachedConfig {
    config: ScoringConfig,
    loaded_at: Instant,
}

/// Process-scoped, TTL-cached view of the persisted scoring config.
/// Constructed once at startup and shared; the cache is never visible
/// to the scorer, which receives a plain `ScoringConfig` value.
pub struct ConfigStore<C> {
    repository: Arc<C>,
    cache: Mutex<Option<CachedConfig>>,
}

/// Admin-facing config write failures; reads never surface errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigWriteError {
    #[error(transparent)]
    Rejected(#[from] ConfigRejection),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl<C: ConfigRepository> ConfigStore<C> {
    pub fn new(repository: Arc<C>) -> Self {
        Self {
            repository,
            cache: Mutex::new(None),
        }
    }

    /// Current config. Serves the cached copy while it is younger than
    /// 30 seconds (the not-configured default is cached the same way);
    /// persistence failures degrade to the last-known value or the
    /// defaults and are never propagated.
    pub fn read(&self, allow_cache: bool) -> ScoringConfig {
        if allow_cache {
            if let Some(cached) = self.cached_if_fresh() {
                return cached;
            }
        }

        let loaded = match self.repository.load(CONFIG_KEY) {
            Ok(Some(value)) => ScoringConfig::from_value_or_default(value),
            Ok(None) => ScoringConfig::default(),
            Err(err) => {
                warn!(error = %err, "fraud config load failed; serving last known value");
                return self.last_known_or_default();
            }
        };

        self.refresh_cache(loaded.clone());
        loaded
    }

    /// Validate, persist, and synchronously refresh the cache so reads
    /// within this process observe the write immediately.
    pub fn write(&self, next: serde_json::Value) -> Result<ScoringConfig, ConfigWriteError> {
        let normalized = ScoringConfig::from_value_strict(next)?;
        let value = serde_json::to_value(&normalized)
            .map_err(|err| ConfigRejection::Malformed(err.to_string()))?;
        self.repository.store(CONFIG_KEY, value)?;
        self.refresh_cache(normalized.clone());
        Ok(normalized)
    }

    fn cached_if_fresh(&self) -> Option<ScoringConfig> {
        let cache = self.cache.lock().ok()?;
        cache
            .as_ref()
            .filter(|entry| entry.loaded_at.elapsed() < CACHE_TTL)
            .map(|entry| entry.config.clone())
    }

    fn last_known_or_default(&self) -> ScoringConfig {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.as_ref().map(|entry| entry.config.clone()))
            .unwrap_or_default()
    }

    fn refresh_cache(&self, config: ScoringConfig) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedConfig {
                config,
                loaded_at: Instant::now(),
            });
        }
    }
}
