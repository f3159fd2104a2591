// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::record::JobRecord;

/// The scheduler state codes that together mean "ended abnormally"
pub const FAILED_STATE_CODES: [&str; 9] = ["CA", "DL", "F", "NF", "PR", "RS", "RV", "TO", "OOM"];

///
/// The job states that statistics are gathered for. `Failed` is a
/// pseudo-state covering every abnormal terminal state, and must be
/// expanded by the source into the underlying codes.
///
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Pending,
    Completed,
    Failed,
    Other(String),
}

impl JobState {
    pub fn parse(state: &str) -> Result<Self, Error> {
        let state = state.trim();

        match state.to_uppercase().as_str() {
            "" => Err(Error::Parse("Invalid job state - cannot be empty".to_string())),
            "R" | "RUNNING" => Ok(JobState::Running),
            "PD" | "PENDING" => Ok(JobState::Pending),
            "CD" | "COMPLETED" => Ok(JobState::Completed),
            "F" | "FAILED" => Ok(JobState::Failed),
            other => Ok(JobState::Other(other.to_string())),
        }
    }

    /// The scheduler state codes this state expands to
    pub fn codes(&self) -> Vec<String> {
        match self {
            JobState::Running => vec!["R".to_string()],
            JobState::Pending => vec!["PD".to_string()],
            JobState::Completed => vec!["CD".to_string()],
            JobState::Failed => FAILED_STATE_CODES.iter().map(|c| c.to_string()).collect(),
            JobState::Other(code) => vec![code.clone()],
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Pending => write!(f, "pending"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Other(code) => write!(f, "{}", code),
        }
    }
}

///
/// Anything that can supply normalised job records for a window
/// of time. Every call can fail, and callers must be able to tell
/// a failed query apart from a query that found no jobs.
///
pub trait JobRecordSource {
    ///
    /// Return the jobs that were in `state` at any point between
    /// `start` and `end`. If `expand_nodes` is set then each record's
    /// node list holds individual hostnames.
    ///
    fn records_by_state(
        &self,
        state: &JobState,
        start: &NaiveDateTime,
        end: &NaiveDateTime,
        expand_nodes: bool,
    ) -> Result<Vec<JobRecord>, Error>;

    /// Return the jobs currently running on `hostname`
    fn records_by_node(&self, hostname: &str) -> Result<Vec<JobRecord>, Error>;

    /// Return the jobs in `partition` that are currently in `state`
    fn records_by_partition(&self, partition: &str, state: &JobState)
        -> Result<Vec<JobRecord>, Error>;

    /// Return the record for a single job
    fn record_detail(&self, job_id: &str) -> Result<JobRecord, Error>;
}

///
/// Static details of one compute node
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetail {
    hostname: String,
    cpus: u64,
    memory_mb: u64,
    partitions: Vec<String>,
    state: String,
}

impl NodeDetail {
    pub fn new(
        hostname: &str,
        cpus: u64,
        memory_mb: u64,
        partitions: &[String],
        state: &str,
    ) -> Self {
        Self {
            hostname: hostname.to_string(),
            cpus,
            memory_mb,
            partitions: partitions.to_vec(),
            state: state.to_string(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cpus(&self) -> u64 {
        self.cpus
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    pub fn state(&self) -> &str {
        &self.state
    }
}

impl std::fmt::Display for NodeDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cpus={} memory={}MB partitions={} state={}",
            self.hostname,
            self.cpus,
            self.memory_mb,
            self.partitions.join(","),
            self.state
        )
    }
}

/// The live list of compute nodes and their capacity
pub trait NodeInventory {
    fn list_nodes(&self) -> Result<Vec<String>, Error>;

    fn node_detail(&self, hostname: &str) -> Result<NodeDetail, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state() {
        #[allow(clippy::unwrap_used)]
        let state = JobState::parse("R").unwrap();
        assert_eq!(state, JobState::Running);
        assert_eq!(state.codes(), vec!["R".to_string()]);

        #[allow(clippy::unwrap_used)]
        let state = JobState::parse("failed").unwrap();
        assert_eq!(state, JobState::Failed);
        assert_eq!(state.codes().join(","), "CA,DL,F,NF,PR,RS,RV,TO,OOM");

        #[allow(clippy::unwrap_used)]
        let state = JobState::parse("to").unwrap();
        assert_eq!(state, JobState::Other("TO".to_string()));

        assert!(JobState::parse(" ").is_err());
    }
}
