//! Process settings.
//!
//! Layered with figment: built-in defaults, then the optional TOML file, then
//! `HOSTLOOP_` environment variables (nested keys split on `__`, e.g.
//! `HOSTLOOP_ENGINE__BINDING_NAME`), then command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use hostloop_runtime::{DEFAULT_WORKERS, EngineConfig};

pub const DEFAULT_CONFIG_FILE: &str = "hostloop.toml";
pub const ENV_PREFIX: &str = "HOSTLOOP_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Workers per pool
    pub workers: usize,
    /// Rounds to run
    pub trials: usize,
    /// Startup script replacing the fixed one
    pub script: Option<PathBuf>,
    /// Used when `RUST_LOG` is unset
    pub log_filter: String,
    pub engine: EngineConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            trials: 1,
            script: None,
            log_filter: "hostloop=info".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trials: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
}

impl Settings {
    /// The provider stack, lowest precedence first.
    pub fn figment(config_file: &Path, overrides: &Overrides) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides))
    }

    /// Load settings and grant the named capabilities on top.
    pub fn load(
        config_file: &Path,
        overrides: &Overrides,
        capabilities: &[String],
    ) -> Result<Self> {
        let mut settings: Settings = Self::figment(config_file, overrides)
            .extract()
            .with_context(|| format!("failed to load settings ({})", config_file.display()))?;

        for name in capabilities {
            settings
                .engine
                .capabilities
                .grant(name)
                .map_err(anyhow::Error::msg)?;
        }
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.workers > 0, "workers must be at least 1");
        anyhow::ensure!(self.trials > 0, "trials must be at least 1");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    // Every test runs inside a jail: loading reads `HOSTLOOP_` variables, and the
    // jail serializes access to the process environment.

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_| {
            let file = Path::new("missing.toml");
            let settings = Settings::load(file, &Overrides::default(), &[]).unwrap();
            assert_eq!(settings.workers, 8);
            assert_eq!(settings.trials, 1);
            assert_eq!(settings.engine.binding_name, "hostInvoke");
            assert!(settings.engine.capabilities.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_file_values_apply() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "hostloop.toml",
                r#"
                workers = 4
                trials = 10

                [engine]
                binding_name = "proxyFun"

                [engine.capabilities]
                threads = true
                "#,
            )?;

            let file = Path::new("hostloop.toml");
            let settings = Settings::load(file, &Overrides::default(), &[]).unwrap();
            assert_eq!(settings.workers, 4);
            assert_eq!(settings.trials, 10);
            assert_eq!(settings.engine.binding_name, "proxyFun");
            assert!(settings.engine.capabilities.threads);
            assert_eq!(settings.engine.max_snapshot_depth, 32);
            Ok(())
        });
    }

    #[test]
    fn test_env_beats_file_and_cli_beats_env() {
        Jail::expect_with(|jail| {
            jail.create_file("hostloop.toml", "workers = 4\ntrials = 2")?;
            jail.set_env("HOSTLOOP_WORKERS", 6);
            jail.set_env("HOSTLOOP_ENGINE__BINDING_NAME", "fromEnv");

            let file = Path::new("hostloop.toml");
            let settings: Settings = Settings::figment(file, &Overrides::default()).extract()?;
            assert_eq!(settings.workers, 6);
            assert_eq!(settings.trials, 2);
            assert_eq!(settings.engine.binding_name, "fromEnv");

            let overrides = Overrides {
                workers: Some(2),
                ..Overrides::default()
            };
            let settings: Settings = Settings::figment(file, &overrides).extract()?;
            assert_eq!(settings.workers, 2);
            assert_eq!(settings.trials, 2);
            Ok(())
        });
    }

    #[test]
    fn test_capability_flags() {
        Jail::expect_with(|_| {
            let missing = Path::new("none.toml");
            let settings = Settings::load(
                missing,
                &Overrides::default(),
                &["env".to_string(), "io".to_string()],
            )
            .unwrap();
            assert_eq!(settings.engine.capabilities.names(), vec!["env", "io"]);

            let net = ["net".to_string()];
            let err = Settings::load(missing, &Overrides::default(), &net).unwrap_err();
            assert!(err.to_string().contains("unknown capability"), "{err}");
            Ok(())
        });
    }

    #[test]
    fn test_zero_workers_rejected() {
        Jail::expect_with(|_| {
            let overrides = Overrides {
                workers: Some(0),
                ..Overrides::default()
            };
            assert!(Settings::load(Path::new("x.toml"), &overrides, &[]).is_err());
            Ok(())
        });
    }
}
