//! Configuration loading.
//!
//! Layering, weakest first: built-in defaults, an optional TOML/YAML
//! file, then `PACTS_*` environment variables. An explicit `--config`
//! path must exist; the default locations are optional.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pacts_core_types::EngineConfig;

/// Default file locations probed when no explicit path is given.
fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("pacts.toml")];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("pacts/config.toml"));
    }
    paths
}

pub fn load(explicit: Option<&Path>) -> Result<EngineConfig> {
    let mut builder = config::Config::builder().add_source(
        config::Config::try_from(&EngineConfig::default())
            .context("default configuration is not representable")?,
    );

    match explicit {
        Some(path) => {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        None => {
            for path in default_config_paths() {
                builder = builder.add_source(config::File::from(path).required(false));
            }
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PACTS")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("spa_markers")
            .with_list_parse_key("bypass_form_cache_for_origin"),
    );

    let cfg: EngineConfig = builder
        .build()
        .context("configuration could not be assembled")?
        .try_deserialize()
        .context("configuration has invalid values")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_any_file() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.max_heal_rounds, 3);
        assert_eq!(cfg.hitl_env_var, "PACTS_2FA_CODE");
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pacts.toml");
        std::fs::write(
            &path,
            "max_heal_rounds = 5\naction_timeout_ms = 2500\n",
        )
        .unwrap();

        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.max_heal_rounds, 5);
        assert_eq!(cfg.action_timeout_ms, 2_500);
        // Untouched knobs keep their defaults.
        assert_eq!(cfg.discovery_total_timeout_ms, 30_000);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("configuration"));
    }
}
