// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use anyhow::Context;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::Error;

///
/// The accounting fields requested from the scheduler, in the order
/// in which they appear in each line of output
///
pub const ACCOUNTING_FIELDS: [&str; 16] = [
    "JobID",
    "User",
    "Account",
    "Partition",
    "State",
    "AllocCPUS",
    "ReqCPUS",
    "AllocNodes",
    "ReqNodes",
    "CPUTimeRaw",
    "Elapsed",
    "Reserved",
    "NodeList",
    "ReqMem",
    "Submit",
    "Reason",
];

pub const SUBMIT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Comma-separated field list, suitable for passing to `--format`
pub fn accounting_format() -> String {
    ACCOUNTING_FIELDS.join(",")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryScope {
    PerCore,
    PerNode,
}

///
/// A requested-memory figure, normalised to megabytes, together
/// with whether it applies to each core or to each node
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySpec {
    megabytes: f64,
    scope: MemoryScope,
}

impl MemorySpec {
    ///
    /// Parse `<number><unit><scope>`, e.g. `4Gn` or `500Mc`. The
    /// unit is one of K, M, G or T. A missing unit means megabytes and a missing scope means
    /// per-node. An empty field is no request at all, returned as None.
    ///
    pub fn parse(spec: &str) -> Result<Option<Self>, Error> {
        let spec = spec.trim();

        if spec.is_empty() {
            return Ok(None);
        }

        let (spec, scope) = match spec.chars().last() {
            Some('c') => (&spec[..spec.len() - 1], MemoryScope::PerCore),
            Some('n') => (&spec[..spec.len() - 1], MemoryScope::PerNode),
            _ => (spec, MemoryScope::PerNode),
        };

        let (number, multiplier) = match spec.chars().last() {
            Some('K') => (&spec[..spec.len() - 1], 1.0 / 1024.0),
            Some('M') => (&spec[..spec.len() - 1], 1.0),
            Some('G') => (&spec[..spec.len() - 1], 1024.0),
            Some('T') => (&spec[..spec.len() - 1], 1024.0 * 1024.0),
            Some(c) if c.is_ascii_digit() => (spec, 1.0),
            _ => {
                return Err(Error::Parse(format!(
                    "Invalid memory specification '{}' - unknown unit",
                    spec
                )));
            }
        };

        let magnitude = number
            .parse::<f64>()
            .with_context(|| format!("Invalid memory specification - bad number '{}'", number))?;

        if !magnitude.is_finite() || magnitude < 0.0 {
            return Err(Error::Parse(format!(
                "Invalid memory specification - negative or non-finite '{}'",
                number
            )));
        }

        Ok(Some(Self {
            megabytes: magnitude * multiplier,
            scope,
        }))
    }

    pub fn megabytes(&self) -> f64 {
        self.megabytes
    }

    pub fn scope(&self) -> MemoryScope {
        self.scope
    }

    ///
    /// Return the memory per core in megabytes. Per-node figures are
    /// shared across the cores on each node.
    ///
    pub fn per_core(&self, cores: u64, nodes: u64) -> Result<f64, Error> {
        match self.scope {
            MemoryScope::PerCore => Ok(self.megabytes),
            MemoryScope::PerNode => {
                if cores == 0 || nodes == 0 {
                    return Err(Error::Parse(format!(
                        "Cannot share {} MB per node across {} cores on {} nodes",
                        self.megabytes, cores, nodes
                    )));
                }

                let cores_per_node = cores as f64 / nodes as f64;
                Ok(self.megabytes / cores_per_node)
            }
        }
    }
}

///
/// Parse a scheduler duration in the form `HH:MM:SS` or `D-HH:MM:SS`
/// into a number of seconds. An empty field is zero.
///
pub fn parse_duration(duration: &str) -> Result<u64, Error> {
    let duration = duration.trim();

    if duration.is_empty() {
        return Ok(0);
    }

    let (days, clock) = match duration.split_once('-') {
        Some((days, clock)) => (
            days.parse::<u64>()
                .with_context(|| format!("Invalid duration - bad days in '{}'", duration))?,
            clock,
        ),
        None => (0, duration),
    };

    let parts: Vec<&str> = clock.split(':').collect();

    if parts.len() != 3 {
        return Err(Error::Parse(format!(
            "Invalid duration '{}' - expected [D-]HH:MM:SS",
            duration
        )));
    }

    let mut seconds = days * 24 * 3600;

    for (part, scale) in parts.iter().zip([3600, 60, 1]) {
        let value = part
            .parse::<u64>()
            .with_context(|| format!("Invalid duration - bad field '{}' in '{}'", part, duration))?;
        seconds += value * scale;
    }

    Ok(seconds)
}

fn parse_count(field: &str, name: &str) -> Result<u64, Error> {
    let field = field.trim();

    if field.is_empty() {
        return Ok(0);
    }

    Ok(field
        .parse::<u64>()
        .with_context(|| format!("Invalid {} '{}'", name, field))?)
}

fn parse_submit(field: &str) -> Result<Option<NaiveDateTime>, Error> {
    match field.trim() {
        "" | "Unknown" | "None" => Ok(None),
        submit => Ok(Some(
            NaiveDateTime::parse_from_str(submit, SUBMIT_FORMAT)
                .with_context(|| format!("Invalid submit time '{}'", submit))?,
        )),
    }
}

///
/// One normalised accounting entry. Derived values are computed once
/// when the record is parsed and never change afterwards.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    job_id: String,
    user: String,
    account: String,
    partition: String,
    state: String,
    alloc_cpus: u64,
    req_cpus: u64,
    alloc_nodes: u64,
    req_nodes: u64,
    cpu_time: u64,
    elapsed: String,
    reserved: String,
    node_expression: String,
    nodes: Vec<String>,
    req_mem: String,
    submit: Option<NaiveDateTime>,
    reason: String,

    memory_per_core: f64,
    total_memory: f64,
    elapsed_minutes: u64,
    reserved_minutes: u64,
    minutes_since_submit: i64,
}

impl JobRecord {
    ///
    /// Parse one pipe-delimited accounting line whose fields are in
    /// [ACCOUNTING_FIELDS] order. `now` is used to work out how long
    /// ago the job was submitted.
    ///
    pub fn parse(line: &str, now: &NaiveDateTime) -> Result<Self, Error> {
        let mut fields: Vec<&str> = line.trim_end_matches(['\n', '\r']).split('|').collect();

        // `--parsable` leaves a trailing delimiter
        if fields.len() == ACCOUNTING_FIELDS.len() + 1 && fields.last() == Some(&"") {
            fields.pop();
        }

        if fields.len() != ACCOUNTING_FIELDS.len() {
            return Err(Error::Parse(format!(
                "Expected {} fields, got {}: '{}'",
                ACCOUNTING_FIELDS.len(),
                fields.len(),
                line
            )));
        }

        let job_id = fields[0].trim().to_string();

        if job_id.is_empty() {
            return Err(Error::Parse(format!("Missing job ID: '{}'", line)));
        }

        let alloc_cpus = parse_count(fields[5], "AllocCPUS")?;
        let req_cpus = parse_count(fields[6], "ReqCPUS")?;
        let alloc_nodes = parse_count(fields[7], "AllocNodes")?;
        let req_nodes = parse_count(fields[8], "ReqNodes")?;
        let cpu_time = parse_count(fields[9], "CPUTimeRaw")?;

        let elapsed = fields[10].trim().to_string();
        let reserved = fields[11].trim().to_string();
        let elapsed_minutes = parse_duration(&elapsed)? / 60;
        let reserved_minutes = parse_duration(&reserved)? / 60;

        let cores = if alloc_cpus != 0 { alloc_cpus } else { req_cpus };
        let node_count = if alloc_nodes != 0 {
            alloc_nodes
        } else {
            req_nodes
        };

        let req_mem = fields[13].trim().to_string();
        let memory_per_core = match MemorySpec::parse(&req_mem)? {
            Some(spec) => spec.per_core(cores, node_count)?,
            None => 0.0,
        };

        let submit = parse_submit(fields[14])?;
        let minutes_since_submit = submit
            .map(|submit| (*now - submit).num_minutes())
            .unwrap_or(0);

        let node_expression = fields[12].trim().to_string();
        let nodes = match node_expression.as_str() {
            "" | "None assigned" => Vec::new(),
            expression => vec![expression.to_string()],
        };

        Ok(Self {
            job_id,
            user: fields[1].trim().to_string(),
            account: fields[2].trim().to_string(),
            partition: fields[3].trim().to_string(),
            state: fields[4].trim().to_string(),
            alloc_cpus,
            req_cpus,
            alloc_nodes,
            req_nodes,
            cpu_time,
            elapsed,
            reserved,
            node_expression,
            nodes,
            req_mem,
            submit,
            reason: fields[15].trim().to_string(),
            memory_per_core,
            total_memory: memory_per_core * cores as f64,
            elapsed_minutes,
            reserved_minutes,
            minutes_since_submit,
        })
    }

    ///
    /// Return a copy of this record with the compact node expression
    /// replaced by the expanded list of hostnames
    ///
    pub fn with_nodes(self, nodes: Vec<String>) -> Self {
        Self { nodes, ..self }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn alloc_cpus(&self) -> u64 {
        self.alloc_cpus
    }

    pub fn req_cpus(&self) -> u64 {
        self.req_cpus
    }

    /// Allocated cores, or the requested cores if nothing is allocated yet
    pub fn cores(&self) -> u64 {
        if self.alloc_cpus != 0 {
            self.alloc_cpus
        } else {
            self.req_cpus
        }
    }

    pub fn alloc_nodes(&self) -> u64 {
        self.alloc_nodes
    }

    pub fn req_nodes(&self) -> u64 {
        self.req_nodes
    }

    /// CPU time in seconds
    pub fn cpu_time(&self) -> u64 {
        self.cpu_time
    }

    pub fn elapsed(&self) -> &str {
        &self.elapsed
    }

    pub fn reserved(&self) -> &str {
        &self.reserved
    }

    pub fn node_expression(&self) -> &str {
        &self.node_expression
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn req_mem(&self) -> &str {
        &self.req_mem
    }

    pub fn submit(&self) -> Option<&NaiveDateTime> {
        self.submit.as_ref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Memory per core in megabytes
    pub fn memory_per_core(&self) -> f64 {
        self.memory_per_core
    }

    /// Total memory for the job in megabytes
    pub fn total_memory(&self) -> f64 {
        self.total_memory
    }

    pub fn elapsed_minutes(&self) -> u64 {
        self.elapsed_minutes
    }

    pub fn reserved_minutes(&self) -> u64 {
        self.reserved_minutes
    }

    pub fn minutes_since_submit(&self) -> i64 {
        self.minutes_since_submit
    }
}

impl std::fmt::Display for JobRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {} cores={} nodes={} cpu_time={}s memory={:.1}MB",
            self.job_id,
            self.user,
            self.account,
            self.partition,
            self.state,
            self.cores(),
            self.alloc_nodes,
            self.cpu_time,
            self.total_memory
        )
    }
}

///
/// Parse every line of accounting output. Lines that cannot be
/// parsed are logged and skipped so that one bad row never loses
/// the rest of the batch.
///
pub fn parse_accounting_output(output: &str, now: &NaiveDateTime) -> Vec<JobRecord> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match JobRecord::parse(line, now) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping unparseable accounting line '{}': {}", line, e);
                None
            }
        })
        .collect()
}
