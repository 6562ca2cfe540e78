//! Configuration loading and validation.
//!
//! The types live in [`schema`]; this module owns the TOML loaders plus
//! the cross-field checks serde alone can't express, like port collisions
//! or warm-spare targets that exceed a backend's capacity. Everything that
//! builds a [`Config`] goes through these loaders, so a config that parses
//! is also one the pool can actually run with.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{bail, Context, Result};

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("couldn't read config file {}", path.display()))?;

    load_config_str(&content).with_context(|| format!("in config file {}", path.display()))
}

/// Load and validate configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("couldn't parse config")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pool.selenium_port == config.pool.agent_port {
        bail!(
            "selenium_port and agent_port must differ (both are {})",
            config.pool.selenium_port
        );
    }

    for provider in &config.provider {
        let (kind, max_count) = match provider {
            ProviderConfig::Docker(c) => ("docker", c.max_count),
            ProviderConfig::Kvm(c) => ("kvm", c.max_count),
            ProviderConfig::Openstack(c) => ("openstack", c.max_count),
        };

        let preload_total: u32 = provider.preloaded().values().sum();
        if max_count > 0 && preload_total > max_count {
            bail!(
                "{} provider preloads {} endpoint(s) but max_count is {}",
                kind,
                preload_total,
                max_count
            );
        }

        // Docker platforms are static config, so bad preload keys are
        // catchable here; kvm/openstack platforms are discovered live.
        if let ProviderConfig::Docker(docker) = provider {
            for platform in docker.preloaded.keys() {
                if !docker.images.iter().any(|image| &image.name == platform) {
                    bail!("docker provider preloads unknown platform {}", platform);
                }
            }
        }
    }

    Ok(())
}
