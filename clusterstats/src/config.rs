// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::granularity::{GranularityProfile, ReportPeriod};

pub fn initialise_tracing() {
    let sub = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());

    match std::env::var("RUST_LOG_FORMAT") {
        Ok(format) => {
            let format = format.to_lowercase();
            match format.as_str() {
                "json" => {
                    sub.json().init();
                }
                "pretty" => {
                    sub.pretty().init();
                }
                _ => {
                    sub.init();
                }
            }
        }
        Err(_) => sub.init(),
    };
}

///
/// Load a configuration of type `T` from the passed toml file
///
pub fn load<T: serde::de::DeserializeOwned>(config_file: &Path) -> Result<T, Error> {
    let config_file = std::path::absolute(config_file)?;

    if !config_file.try_exists()? {
        return Err(Error::NotFound(format!(
            "Config file {:?} does not exist",
            config_file
        )));
    }

    let config = std::fs::read_to_string(&config_file)
        .with_context(|| format!("Could not read config file: {:?}", config_file))?;

    let config: T = toml::from_str(&config)
        .with_context(|| format!("Could not parse config file from toml: {:?}", config_file))?;

    Ok(config)
}

///
/// Save the configuration to the passed toml file, creating the
/// parent directory if needed
///
pub fn save<T: Serialize>(config: &T, config_file: &Path) -> Result<(), Error> {
    let config_toml =
        toml::to_string(config).with_context(|| "Could not serialise config to toml")?;

    let prefix = config_file.parent().with_context(|| {
        format!(
            "Could not get parent directory for config file: {:?}",
            config_file
        )
    })?;

    std::fs::create_dir_all(prefix).with_context(|| {
        format!(
            "Could not create parent directory for config file: {:?}",
            config_file
        )
    })?;

    std::fs::write(config_file, config_toml)
        .with_context(|| format!("Could not write config file: {:?}", config_file))?;

    Ok(())
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("clusterstats"))
        .unwrap_or_else(|| PathBuf::from("report_cache"))
}

fn default_partitions() -> Vec<String> {
    [
        "defq",
        "short",
        "long",
        "interactive",
        "bigmem",
        "dell-gpu",
        "power",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

///
/// Settings that control how reports are generated
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory holding cached bucket results
    cache_dir: PathBuf,

    /// Partitions that are tallied. Empty means every partition.
    partitions: Vec<String>,

    league_table_size: usize,

    /// Treat a failed query as "no jobs" rather than losing the bucket
    tolerate_gaps: bool,

    /// Also query pending jobs for each bucket
    query_pending: bool,

    /// Granularity overrides, keyed by report period name
    profiles: BTreeMap<String, GranularityProfile>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            partitions: default_partitions(),
            league_table_size: 25,
            tolerate_gaps: false,
            query_pending: false,
            profiles: BTreeMap::new(),
        }
    }
}

impl ReportConfig {
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    pub fn is_known_partition(&self, partition: &str) -> bool {
        self.partitions.is_empty() || self.partitions.iter().any(|p| p == partition)
    }

    pub fn league_table_size(&self) -> usize {
        self.league_table_size
    }

    pub fn tolerate_gaps(&self) -> bool {
        self.tolerate_gaps
    }

    pub fn query_pending(&self) -> bool {
        self.query_pending
    }

    ///
    /// The settings that change the content of a cached `name` result,
    /// in a stable form. Partition order does not matter.
    ///
    pub fn result_settings(&self, name: &str) -> String {
        let mut partitions = self.partitions.clone();
        partitions.sort();
        partitions.dedup();

        match name {
            "stats" => format!(
                "partitions={};pending={}",
                partitions.join(","),
                self.query_pending
            ),
            _ => format!("partitions={}", partitions.join(",")),
        }
    }

    pub fn profile(&self, period: ReportPeriod) -> GranularityProfile {
        self.profiles
            .get(&period.to_string())
            .cloned()
            .unwrap_or_else(|| period.default_profile())
    }

    pub fn with_cache_dir(self, cache_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            ..self
        }
    }

    pub fn with_partitions(self, partitions: &[&str]) -> Self {
        Self {
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
            ..self
        }
    }

    pub fn with_league_table_size(self, league_table_size: usize) -> Self {
        Self {
            league_table_size,
            ..self
        }
    }

    pub fn with_tolerate_gaps(self, tolerate_gaps: bool) -> Self {
        Self {
            tolerate_gaps,
            ..self
        }
    }

    pub fn with_query_pending(self, query_pending: bool) -> Self {
        Self {
            query_pending,
            ..self
        }
    }

    pub fn with_profile(self, period: ReportPeriod, profile: GranularityProfile) -> Self {
        let mut profiles = self.profiles;
        profiles.insert(period.to_string(), profile);
        Self { profiles, ..self }
    }
}
