use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Config;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api_keys: Option<ApiKeysConfig>,
    pub resolution: Option<ResolutionConfig>,
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    pub s2_api_key: Option<String>,
    pub openalex_key: Option<String>,
    pub crossref_mailto: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionConfig {
    pub num_workers: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub loose_threshold: Option<f64>,
    pub year_tolerance: Option<i32>,
    pub disabled_providers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: Option<String>,
}

/// Platform config directory path: `<config_dir>/refnavi/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("refnavi").join("config.toml"))
}

/// Load config by cascading CWD `.refnavi.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(&PathBuf::from(".refnavi.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &PathBuf) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    toml::from_str(&content).ok()
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (base_keys, over_keys) = (
        base.api_keys.unwrap_or_default(),
        overlay.api_keys.unwrap_or_default(),
    );
    let (base_res, over_res) = (
        base.resolution.unwrap_or_default(),
        overlay.resolution.unwrap_or_default(),
    );
    let (base_cache, over_cache) = (
        base.cache.unwrap_or_default(),
        overlay.cache.unwrap_or_default(),
    );

    ConfigFile {
        api_keys: Some(ApiKeysConfig {
            s2_api_key: over_keys.s2_api_key.or(base_keys.s2_api_key),
            openalex_key: over_keys.openalex_key.or(base_keys.openalex_key),
            crossref_mailto: over_keys.crossref_mailto.or(base_keys.crossref_mailto),
        }),
        resolution: Some(ResolutionConfig {
            num_workers: over_res.num_workers.or(base_res.num_workers),
            request_timeout_secs: over_res
                .request_timeout_secs
                .or(base_res.request_timeout_secs),
            max_attempts: over_res.max_attempts.or(base_res.max_attempts),
            base_delay_ms: over_res.base_delay_ms.or(base_res.base_delay_ms),
            loose_threshold: over_res.loose_threshold.or(base_res.loose_threshold),
            year_tolerance: over_res.year_tolerance.or(base_res.year_tolerance),
            disabled_providers: over_res
                .disabled_providers
                .or(base_res.disabled_providers),
        }),
        cache: Some(CacheConfig {
            path: over_cache.path.or(base_cache.path),
        }),
    }
}

impl ConfigFile {
    /// Resolve into a runtime [`Config`], filling gaps with defaults.
    pub fn into_config(self) -> Config {
        let defaults = Config::default();
        let keys = self.api_keys.unwrap_or_default();
        let res = self.resolution.unwrap_or_default();
        let cache = self.cache.unwrap_or_default();

        Config {
            s2_api_key: keys.s2_api_key,
            openalex_key: keys.openalex_key,
            crossref_mailto: keys.crossref_mailto,
            disabled_providers: res.disabled_providers.unwrap_or_default(),
            num_workers: res.num_workers.unwrap_or(defaults.num_workers),
            request_timeout_secs: res
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
            max_attempts: res.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay_ms: res.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            loose_threshold: res.loose_threshold.unwrap_or(defaults.loose_threshold),
            year_tolerance: res.year_tolerance.unwrap_or(defaults.year_tolerance),
            cache_path: cache.path.map(PathBuf::from),
        }
    }
}

/// Save the current config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
    Ok(path)
}
