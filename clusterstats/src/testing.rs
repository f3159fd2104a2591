// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

//! In-memory job sources and node inventories for tests

use chrono::NaiveDateTime;
use std::cell::Cell;
use std::collections::HashMap;

use crate::error::Error;
use crate::record::{JobRecord, SUBMIT_FORMAT};
use crate::source::{JobRecordSource, JobState, NodeDetail, NodeInventory};

pub fn datetime(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, SUBMIT_FORMAT).unwrap_or_default()
}

/// A running job with `cpus` cores spread over `nodes`
pub fn job(id: &str, user: &str, partition: &str, cpus: u64, nodes: &[&str], mem: &str) -> JobRecord {
    let line = format!(
        "{}|{}|acct|{}|RUNNING|{}|{}|{}|{}|{}|01:00:00|00:00:00|{}|{}|2024-03-01T00:00:00|None",
        id,
        user,
        partition,
        cpus,
        cpus,
        nodes.len(),
        nodes.len(),
        cpus * 3600,
        nodes.join(","),
        mem
    );

    #[allow(clippy::unwrap_used)]
    JobRecord::parse(&line, &datetime("2024-03-01T12:00:00"))
        .unwrap()
        .with_nodes(nodes.iter().map(|n| n.to_string()).collect())
}

///
/// Returns the same jobs for every window, unless jobs have been
/// set for a specific window start. Counts every query made.
///
#[derive(Debug, Default)]
pub struct FakeSource {
    jobs: HashMap<JobState, Vec<JobRecord>>,
    windows: HashMap<(JobState, NaiveDateTime), Vec<JobRecord>>,
    failing: Vec<JobState>,
    calls: Cell<usize>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_running(self, jobs: Vec<JobRecord>) -> Self {
        self.with_state(JobState::Running, jobs)
    }

    pub fn with_completed(self, jobs: Vec<JobRecord>) -> Self {
        self.with_state(JobState::Completed, jobs)
    }

    pub fn with_state(mut self, state: JobState, jobs: Vec<JobRecord>) -> Self {
        self.jobs.insert(state, jobs);
        self
    }

    pub fn with_window(mut self, state: JobState, start: &str, jobs: Vec<JobRecord>) -> Self {
        self.windows.insert((state, datetime(start)), jobs);
        self
    }

    pub fn failing(mut self, state: JobState) -> Self {
        self.failing.push(state);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl JobRecordSource for FakeSource {
    fn records_by_state(
        &self,
        state: &JobState,
        start: &NaiveDateTime,
        _end: &NaiveDateTime,
        _expand_nodes: bool,
    ) -> Result<Vec<JobRecord>, Error> {
        self.calls.set(self.calls.get() + 1);

        if self.failing.contains(state) {
            return Err(Error::Call(format!("Query for {} jobs failed", state)));
        }

        if let Some(jobs) = self.windows.get(&(state.clone(), *start)) {
            return Ok(jobs.clone());
        }

        Ok(self.jobs.get(state).cloned().unwrap_or_default())
    }

    fn records_by_node(&self, hostname: &str) -> Result<Vec<JobRecord>, Error> {
        Ok(self
            .jobs
            .get(&JobState::Running)
            .map(|jobs| {
                jobs.iter()
                    .filter(|j| j.nodes().iter().any(|n| n == hostname))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn records_by_partition(
        &self,
        partition: &str,
        state: &JobState,
    ) -> Result<Vec<JobRecord>, Error> {
        Ok(self
            .jobs
            .get(state)
            .map(|jobs| {
                jobs.iter()
                    .filter(|j| j.partition() == partition)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn record_detail(&self, job_id: &str) -> Result<JobRecord, Error> {
        self.jobs
            .values()
            .flatten()
            .find(|j| j.job_id() == job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No job {}", job_id)))
    }
}

#[derive(Debug, Default)]
pub struct FakeInventory {
    nodes: Vec<NodeDetail>,
    broken: Vec<String>,
    unavailable: bool,
}

impl FakeInventory {
    pub fn new(nodes: &[(&str, u64)]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|(name, cpus)| NodeDetail::new(name, *cpus, cpus * 4096, &["defq".to_string()], "idle"))
                .collect(),
            ..Default::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    /// Listed, but with no details
    pub fn with_broken(mut self, hostname: &str) -> Self {
        self.broken.push(hostname.to_string());
        self
    }
}

impl NodeInventory for FakeInventory {
    fn list_nodes(&self) -> Result<Vec<String>, Error> {
        if self.unavailable {
            return Err(Error::Call("sinfo failed".to_string()));
        }

        Ok(self
            .nodes
            .iter()
            .map(|n| n.hostname().to_string())
            .chain(self.broken.iter().cloned())
            .collect())
    }

    fn node_detail(&self, hostname: &str) -> Result<NodeDetail, Error> {
        self.nodes
            .iter()
            .find(|n| n.hostname() == hostname)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No node {}", hostname)))
    }
}
