use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "PG_ROUTER_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("pg-router.toml"))
        .merge(Json::file("pg-router.json"))
        .merge(Yaml::file("pg-router.yaml"))
        .merge(Yaml::file("pg-router.yml"))
        // PG_ROUTER_LOGGING_JSON=true sets logging.json
        .merge(Env::prefixed(ENV_PREFIX).split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config
        .cluster
        .validate()
        .map_err(ConfigError::Validation)?;

    config
        .plugins
        .validate()
        .map_err(ConfigError::Validation)?;

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for plugin in &mut config.plugins.plugins {
        if let Some(command) = &mut plugin.command {
            *command = PathBuf::from(substitute_env_vars(&command.to_string_lossy())?);
        }

        for arg in &mut plugin.args {
            *arg = substitute_env_vars(arg)?;
        }

        for value in plugin.env.values_mut() {
            *value = substitute_env_vars(value)?;
        }
    }

    for database in &mut config.cluster.databases {
        database.host = substitute_env_vars(&database.host)?;
    }

    Ok(config)
}

/// Expand `${VAR}` and `${VAR:-default}`.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let (name, default) = match cap[1].split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (&cap[1], None),
        };

        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    name
                ))
                .into())
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
