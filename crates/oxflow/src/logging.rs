// Logging - tracing subscriber setup
//
// The engine logs through `tracing`; nothing is printed unless a subscriber
// is installed. `init_tracing` installs a fmt subscriber whose filter is
// resolved, first match wins, from:
//
//   1. LoggingConfig::directives
//   2. OXFLOW_LOG
//   3. RUST_LOG
//   4. LoggingConfig::default_directive ("info")
//
// Installing twice is harmless: the second call returns Ok(false).

use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

pub const ENV_LOG: &str = "OXFLOW_LOG";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Explicit filter directives, e.g. `oxflow=debug,info`.
    pub directives: Option<String>,
    pub default_directive: String,
    pub with_target: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            with_target: true,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    pub fn default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    pub fn ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Filter directives after applying the environment fallbacks.
    pub fn resolve_directives(&self) -> String {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    fn resolve_with(&self, lookup: impl Fn(&str) -> Option<String>) -> String {
        self.directives
            .clone()
            .or_else(|| lookup(ENV_LOG))
            .or_else(|| lookup("RUST_LOG"))
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| self.default_directive.clone())
    }
}

/// Install the global fmt subscriber. Returns `Ok(false)` when a global
/// subscriber was already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let directives = config.resolve_directives();
    let filter = EnvFilter::try_new(&directives)
        .map_err(|e| Error::msg(format!("invalid log filter '{directives}': {e}")))?;
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(%directives, "tracing subscriber installed");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_resolution_order() {
        let config = LoggingConfig::default();
        assert_eq!(config.resolve_with(lookup(&[])), "info");
        assert_eq!(
            config.resolve_with(lookup(&[("RUST_LOG", "warn"), (ENV_LOG, "debug")])),
            "debug"
        );
        assert_eq!(config.resolve_with(lookup(&[("RUST_LOG", "warn")])), "warn");
        let explicit = LoggingConfig::default().directives("oxflow=trace");
        assert_eq!(
            explicit.resolve_with(lookup(&[(ENV_LOG, "debug")])),
            "oxflow=trace"
        );
    }

    #[test]
    fn test_second_install_is_noop() {
        let config = LoggingConfig::default().directives("warn").ansi(false);
        init_tracing(&config).unwrap();
        assert!(!init_tracing(&config).unwrap());
    }

    #[test]
    fn test_invalid_filter() {
        let config = LoggingConfig::default().directives("oxflow=notalevel");
        assert!(init_tracing(&config).is_err());
    }
}
