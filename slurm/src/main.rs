// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{absolute, PathBuf};

use clusterstats::cache::ResultCache;
use clusterstats::config::{self, ReportConfig};
use clusterstats::granularity::ReportPeriod;
use clusterstats::report::{ReportGenerator, ReportWindow};
use clusterstats::source::{JobRecordSource, JobState, NodeInventory};
use clusterstats::Error;

mod runner;
mod sacct;
mod sinfo;

use runner::{SlurmConfig, SlurmRunner};
use sacct::SacctSource;
use sinfo::SinfoInventory;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn version() -> &'static str {
    built_info::GIT_VERSION.unwrap_or(built_info::PKG_VERSION)
}

fn default_config_file() -> PathBuf {
    dirs::config_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clusterstats")
        .join("slurm-stats.toml")
}

///
/// Everything that can be set in the config file
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Config {
    report: ReportConfig,
    slurm: SlurmConfig,
}

#[derive(Parser)]
#[command(version = version(), about, long_about = None)]
struct Args {
    #[arg(
        long,
        short='c',
        help=format!(
            "Path to the config file [default: {}]",
            &default_config_file().display(),
        )
    )]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file containing the default settings
    Init {
        #[arg(long, short = 'f', help = "Overwrite an existing config file")]
        force: bool,
    },

    /// Summarise cluster utilisation over a window of days
    Report {
        #[arg(
            long,
            short = 'p',
            default_value = "daily",
            help = "Report period (daily, weekly, monthly or yearly)"
        )]
        period: String,

        #[arg(
            long,
            short = 'd',
            help = "Last day of the report, as YYYY-MM-DD [default: yesterday]"
        )]
        date: Option<String>,

        #[arg(
            long,
            short = 'r',
            help = "Explicit window, as YYYY-MM-DD:YYYY-MM-DD. Overrides --date"
        )]
        range: Option<String>,

        #[arg(long, help = "Write the summary as JSON")]
        json: bool,
    },

    /// Show the accounting record of a job
    Job { id: String },

    /// Show a node and the jobs running on it
    Node { hostname: String },

    /// List the jobs in a partition
    Partition {
        name: String,

        #[arg(
            long,
            short = 's',
            default_value = "running",
            help = "Job state (running, pending, completed, failed or a slurm state code)"
        )]
        state: String,
    },

    /// Print the fingerprint that keys cached results
    Fingerprint,
}

fn load_config(config_file: &std::path::Path) -> Result<Config> {
    match config::load::<Config>(config_file) {
        Ok(config) => Ok(config),
        Err(Error::NotFound(_)) => {
            tracing::debug!(
                "No config file at {:?} - using default settings",
                config_file
            );
            Ok(Config::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}': expected YYYY-MM-DD", date))
}

fn report(
    config: &Config,
    period: &str,
    date: Option<&str>,
    range: Option<&str>,
    json: bool,
) -> Result<()> {
    let period = ReportPeriod::parse(period)?;
    let now = chrono::Local::now().naive_local();

    let window = match (range, date) {
        (Some(range), _) => ReportWindow::parse(range)?,
        (None, Some(date)) => ReportWindow::ending(period, &parse_date(date)?),
        (None, None) => ReportWindow::ending(period, &(now.date() - chrono::Duration::days(1))),
    };

    let runner = SlurmRunner::new(&config.slurm);
    let source = SacctSource::new(&runner);
    let inventory = SinfoInventory::new(&runner);
    let cache = ResultCache::new(config.report.cache_dir());

    let generator = ReportGenerator::new(&source, &inventory, &cache, &config.report);
    let summary = generator.generate(&window, &config.report.profile(period), &now)?;

    match json {
        true => println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Could not serialise summary")?
        ),
        false => println!("{}", summary),
    }

    Ok(())
}

fn main() -> Result<()> {
    config::initialise_tracing();

    let args = Args::parse();

    let config_file = absolute(match &args.config_file {
        Some(f) => f.clone(),
        None => default_config_file(),
    })?;

    if let Some(Commands::Init { force }) = &args.command {
        if config_file.try_exists()? && !*force {
            anyhow::bail!(
                "Config file {:?} already exists. Use --force to overwrite it.",
                config_file
            );
        }

        config::save(&Config::default(), &config_file)?;
        println!("Wrote default config to {}", config_file.display());
        return Ok(());
    }

    let config = load_config(&config_file)?;
    let runner = SlurmRunner::new(&config.slurm);

    match &args.command {
        Some(Commands::Report {
            period,
            date,
            range,
            json,
        }) => report(&config, period, date.as_deref(), range.as_deref(), *json)?,
        Some(Commands::Job { id }) => {
            let record = SacctSource::new(&runner).record_detail(id)?;
            println!("{}", record);
        }
        Some(Commands::Node { hostname }) => {
            let node = SinfoInventory::new(&runner).node_detail(hostname)?;
            println!("{}", node);

            for record in SacctSource::new(&runner).records_by_node(hostname)? {
                println!("  {}", record);
            }
        }
        Some(Commands::Partition { name, state }) => {
            let state = JobState::parse(state)?;
            let records = SacctSource::new(&runner).records_by_partition(name, &state)?;

            println!("{} {} jobs in {}", records.len(), state, name);

            for record in records {
                println!("  {}", record);
            }
        }
        Some(Commands::Fingerprint) => {
            let cache = ResultCache::new(config.report.cache_dir());
            println!("{}", cache.fingerprint());
        }
        Some(Commands::Init { .. }) => {}
        None => {
            println!("No command given. Use --help to see the available commands.");
        }
    }

    Ok(())
}
