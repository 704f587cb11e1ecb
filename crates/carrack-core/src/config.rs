//! Framework configuration: an immutable string property map with typed
//! accessors, plus the programmatic collaborator slots that have no string
//! representation (system activators, activator factories).

use crate::activator::{Activator, ActivatorRegistry};
use std::collections::BTreeMap;

pub mod keys {
    /// List of activators run at system-bundle start/stop (programmatic;
    /// supplied via [`FrameworkConfig::add_system_activator`](super::FrameworkConfig::add_system_activator)).
    pub const SYSTEM_BUNDLE_ACTIVATORS: &str = "system_bundle.activators";
    /// Logger override marker; honored by the embedding application.
    pub const LOG_LOGGER: &str = "log.logger";
    /// Integer verbosity 0..4.
    pub const LOG_LEVEL: &str = "log.level";
    /// Target framework start level reached by `start()`.
    pub const FRAMEWORK_START_LEVEL: &str = "startlevel.framework";
    /// Default start level assigned to newly installed bundles.
    pub const BUNDLE_START_LEVEL: &str = "startlevel.bundle";
    /// Enable URL handler registration in the embedding application.
    pub const URL_HANDLERS: &str = "framework.service.urlhandlers";
    /// I/O copy buffer size used by the bundle cache.
    pub const CACHE_BUFSIZE: &str = "cache.bufsize";
    pub const CACHE_DIR: &str = "cache.dir";
    pub const CACHE_PROFILE: &str = "cache.profile";
    pub const CACHE_PROFILE_DIR: &str = "cache.profiledir";
    /// `onFirstInit` flushes the cache on the first `init()`.
    pub const STORAGE_CLEAN: &str = "framework.storage.clean";
    pub const STORAGE_CLEAN_ON_FIRST_INIT: &str = "onFirstInit";
    /// Comma-separated execution environments the framework provides.
    pub const EXECUTION_ENVIRONMENT: &str = "framework.executionenvironment";
}

pub const DEFAULT_FRAMEWORK_START_LEVEL: u32 = 1;
pub const DEFAULT_BUNDLE_START_LEVEL: u32 = 1;

pub struct FrameworkConfig {
    properties: BTreeMap<String, String>,
    activators: ActivatorRegistry,
    system_activators: Vec<Box<dyn Activator>>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkConfig {
    pub fn new() -> Self {
        Self {
            properties: BTreeMap::new(),
            activators: ActivatorRegistry::new(),
            system_activators: Vec::new(),
        }
    }

    pub fn from_properties(properties: BTreeMap<String, String>) -> Self {
        Self {
            properties,
            activators: ActivatorRegistry::new(),
            system_activators: Vec::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Register an activator factory under the name bundles use in their
    /// manifest `activator` field.
    pub fn register_activator(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Activator> + Send + Sync + 'static,
    ) -> &mut Self {
        self.activators.register(name, factory);
        self
    }

    /// Add an activator run when the system bundle starts and stops.
    pub fn add_system_activator(&mut self, activator: Box<dyn Activator>) -> &mut Self {
        self.system_activators.push(activator);
        self
    }

    pub fn activators(&self) -> &ActivatorRegistry {
        &self.activators
    }

    pub(crate) fn take_system_activators(&mut self) -> Vec<Box<dyn Activator>> {
        std::mem::take(&mut self.system_activators)
    }

    pub fn log_level(&self) -> u32 {
        self.parsed(keys::LOG_LEVEL).unwrap_or(1).min(4)
    }

    /// The `log.level` verbosity mapped onto a tracing filter, for
    /// subscriber setup in binaries and test harnesses. 0 silences the
    /// framework entirely; 4 is full debug output.
    pub fn log_level_filter(&self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self.log_level() {
            0 => LevelFilter::OFF,
            1 => LevelFilter::ERROR,
            2 => LevelFilter::WARN,
            3 => LevelFilter::INFO,
            _ => LevelFilter::DEBUG,
        }
    }

    pub fn framework_start_level(&self) -> u32 {
        self.parsed(keys::FRAMEWORK_START_LEVEL)
            .filter(|&l| l > 0)
            .unwrap_or(DEFAULT_FRAMEWORK_START_LEVEL)
    }

    pub fn initial_bundle_start_level(&self) -> u32 {
        self.parsed(keys::BUNDLE_START_LEVEL)
            .filter(|&l| l > 0)
            .unwrap_or(DEFAULT_BUNDLE_START_LEVEL)
    }

    pub fn url_handlers_enabled(&self) -> bool {
        self.get(keys::URL_HANDLERS)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true)
    }

    pub fn cache_buf_size(&self) -> usize {
        self.parsed(keys::CACHE_BUFSIZE)
            .filter(|&n| n > 0)
            .unwrap_or(carrack_cache::DEFAULT_BUFFER_SIZE)
    }

    pub fn storage_clean_on_first_init(&self) -> bool {
        self.get(keys::STORAGE_CLEAN)
            .map(|v| v.eq_ignore_ascii_case(keys::STORAGE_CLEAN_ON_FIRST_INIT))
            .unwrap_or(false)
    }

    /// Execution environments this framework provides, split and trimmed.
    /// Empty means every bundle requirement is accepted.
    pub fn execution_environments(&self) -> Vec<String> {
        self.get(keys::EXECUTION_ENVIRONMENT)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_level_defaults() {
        let cfg = FrameworkConfig::new();
        assert_eq!(cfg.framework_start_level(), 1);
        assert_eq!(cfg.initial_bundle_start_level(), 1);
    }

    #[test]
    fn start_level_from_properties() {
        let mut cfg = FrameworkConfig::new();
        cfg.set(keys::FRAMEWORK_START_LEVEL, "5");
        cfg.set(keys::BUNDLE_START_LEVEL, "3");
        assert_eq!(cfg.framework_start_level(), 5);
        assert_eq!(cfg.initial_bundle_start_level(), 3);
    }

    #[test]
    fn invalid_start_level_falls_back() {
        let mut cfg = FrameworkConfig::new();
        cfg.set(keys::FRAMEWORK_START_LEVEL, "junk");
        cfg.set(keys::BUNDLE_START_LEVEL, "0");
        assert_eq!(cfg.framework_start_level(), 1);
        assert_eq!(cfg.initial_bundle_start_level(), 1);
    }

    #[test]
    fn storage_clean_flag() {
        let mut cfg = FrameworkConfig::new();
        assert!(!cfg.storage_clean_on_first_init());
        cfg.set(keys::STORAGE_CLEAN, "onFirstInit");
        assert!(cfg.storage_clean_on_first_init());
        cfg.set(keys::STORAGE_CLEAN, "onfirstinit");
        assert!(cfg.storage_clean_on_first_init());
    }

    #[test]
    fn execution_environments_split() {
        let mut cfg = FrameworkConfig::new();
        assert!(cfg.execution_environments().is_empty());
        cfg.set(keys::EXECUTION_ENVIRONMENT, "std-2021, std-2018,");
        assert_eq!(cfg.execution_environments(), vec!["std-2021", "std-2018"]);
    }

    #[test]
    fn cache_buf_size_default_and_override() {
        let mut cfg = FrameworkConfig::new();
        assert_eq!(cfg.cache_buf_size(), 4096);
        cfg.set(keys::CACHE_BUFSIZE, "8192");
        assert_eq!(cfg.cache_buf_size(), 8192);
        cfg.set(keys::CACHE_BUFSIZE, "0");
        assert_eq!(cfg.cache_buf_size(), 4096);
    }

    #[test]
    fn log_level_clamped() {
        let mut cfg = FrameworkConfig::new();
        cfg.set(keys::LOG_LEVEL, "9");
        assert_eq!(cfg.log_level(), 4);
    }

    #[test]
    fn log_level_maps_to_tracing_filters() {
        use tracing::level_filters::LevelFilter;
        let mut cfg = FrameworkConfig::new();
        assert_eq!(cfg.log_level_filter(), LevelFilter::ERROR);
        for (value, filter) in [
            ("0", LevelFilter::OFF),
            ("1", LevelFilter::ERROR),
            ("2", LevelFilter::WARN),
            ("3", LevelFilter::INFO),
            ("4", LevelFilter::DEBUG),
            ("9", LevelFilter::DEBUG),
        ] {
            cfg.set(keys::LOG_LEVEL, value);
            assert_eq!(cfg.log_level_filter(), filter, "log.level = {value}");
        }
    }
}
