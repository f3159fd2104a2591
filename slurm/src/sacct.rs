// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use chrono::NaiveDateTime;
use clusterstats::record::{accounting_format, parse_accounting_output, JobRecord, SUBMIT_FORMAT};
use clusterstats::source::{JobRecordSource, JobState};
use clusterstats::Error;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::runner::{SlurmCommand, SlurmRunner};

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

///
/// Arguments for an allocation-level query of every user's jobs,
/// in parsable form with the accounting fields we normalise
///
fn query_args(filters: &[String]) -> Vec<String> {
    let mut command = args(&["--allocations", "--parsable2", "--noheader", "--allusers"]);
    command.extend(filters.iter().cloned());
    command.push(format!("--format={}", accounting_format()));
    command
}

fn state_args(state: &JobState) -> String {
    format!("--state={}", state.codes().join(","))
}

///
/// Job records fetched from slurm accounting with `sacct`. Node
/// lists are expanded with `scontrol show hostnames`, and each
/// distinct expression is only expanded once per source.
///
pub struct SacctSource {
    runner: SlurmRunner,
    hostnames: RefCell<HashMap<String, Vec<String>>>,
}

impl SacctSource {
    pub fn new(runner: &SlurmRunner) -> Self {
        Self {
            runner: runner.clone(),
            hostnames: RefCell::new(HashMap::new()),
        }
    }

    /// Expand a compact node expression, e.g. `node[01-03]`
    pub fn expand_hostnames(&self, expression: &str) -> Result<Vec<String>, Error> {
        let expression = expression.trim();

        if expression.is_empty() || expression == "None assigned" {
            return Ok(Vec::new());
        }

        if let Some(hostnames) = self.hostnames.borrow().get(expression) {
            return Ok(hostnames.clone());
        }

        let output = self.runner.call(
            SlurmCommand::Scontrol,
            &args(&["show", "hostnames", expression]),
        )?;

        let hostnames: Vec<String> = output
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();

        self.hostnames
            .borrow_mut()
            .insert(expression.to_string(), hostnames.clone());

        Ok(hostnames)
    }

    fn expand(&self, records: Vec<JobRecord>) -> Result<Vec<JobRecord>, Error> {
        records
            .into_iter()
            .map(|record| {
                let hostnames = self.expand_hostnames(record.node_expression())?;
                Ok(record.with_nodes(hostnames))
            })
            .collect()
    }

    fn query(&self, filters: &[String], expand_nodes: bool) -> Result<Vec<JobRecord>, Error> {
        let output = self.runner.call(SlurmCommand::Sacct, &query_args(filters))?;
        let records = parse_accounting_output(&output, &now());

        match expand_nodes {
            true => self.expand(records),
            false => Ok(records),
        }
    }
}

impl JobRecordSource for SacctSource {
    fn records_by_state(
        &self,
        state: &JobState,
        start: &NaiveDateTime,
        end: &NaiveDateTime,
        expand_nodes: bool,
    ) -> Result<Vec<JobRecord>, Error> {
        self.query(
            &[
                format!("--starttime={}", start.format(SUBMIT_FORMAT)),
                format!("--endtime={}", end.format(SUBMIT_FORMAT)),
                state_args(state),
            ],
            expand_nodes,
        )
    }

    fn records_by_node(&self, hostname: &str) -> Result<Vec<JobRecord>, Error> {
        self.query(
            &[
                format!("--nodelist={}", hostname),
                state_args(&JobState::Running),
            ],
            true,
        )
    }

    fn records_by_partition(
        &self,
        partition: &str,
        state: &JobState,
    ) -> Result<Vec<JobRecord>, Error> {
        self.query(
            &[format!("--partition={}", partition), state_args(state)],
            true,
        )
    }

    ///
    /// The allocation record of a single job. Job steps (`<id>.batch`,
    /// `<id>.0`, ...) are not returned, as every query is made with
    /// `--allocations`.
    ///
    fn record_detail(&self, job_id: &str) -> Result<JobRecord, Error> {
        let records = self.query(&[format!("--jobs={}", job_id)], true)?;

        records
            .into_iter()
            .find(|record| record.job_id() == job_id)
            .ok_or_else(|| Error::NotFound(format!("No accounting record for job {}", job_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::SlurmConfig;

    #[test]
    fn test_query_args() {
        let a = query_args(&[state_args(&JobState::Failed)]);

        assert_eq!(
            a,
            vec![
                "--allocations",
                "--parsable2",
                "--noheader",
                "--allusers",
                "--state=CA,DL,F,NF,PR,RS,RV,TO,OOM",
                "--format=JobID,User,Account,Partition,State,AllocCPUS,ReqCPUS,AllocNodes,ReqNodes,CPUTimeRaw,Elapsed,Reserved,NodeList,ReqMem,Submit,Reason",
            ]
        );
    }

    #[cfg(unix)]
    fn source(lines: &[&str], calls: &std::path::Path) -> SacctSource {
        let sacct = lines
            .iter()
            .map(|line| format!("echo '{}'", line))
            .collect::<Vec<_>>()
            .join("; ");

        let scontrol = format!(
            "echo call >> '{}'; echo node01; echo node02",
            calls.display()
        );

        let config = SlurmConfig::default()
            .with_command(SlurmCommand::Sacct, &format!("sh -c \"{}\"", sacct))
            .with_command(SlurmCommand::Scontrol, &format!("sh -c \"{}\"", scontrol));

        SacctSource::new(&SlurmRunner::new(&config))
    }

    #[cfg(unix)]
    #[test]
    fn test_records() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls");

        let source = source(
            &[
                "101|alice|acct|defq|RUNNING|8|8|2|2|28800|01:00:00|00:00:00|node[01-02]|1Gc|2024-03-01T00:00:00|None",
                "102|bob|acct|defq|RUNNING|4|4|2|2|14400|01:00:00|00:00:00|node[01-02]|1Gc|2024-03-01T00:00:00|None",
                "103|carol|acct|defq|PENDING|0|4|0|1|0|00:00:00|00:10:00|None assigned|4Gn|2024-03-01T00:00:00|Priority",
                "not a record",
            ],
            &calls,
        );

        let start = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        let end = start + chrono::Duration::minutes(10);

        #[allow(clippy::unwrap_used)]
        let records = source
            .records_by_state(&JobState::Running, &start, &end, true)
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].nodes(), &["node01", "node02"]);
        assert_eq!(records[1].nodes(), &["node01", "node02"]);
        assert!(records[2].nodes().is_empty());

        // the shared expression was expanded once
        #[allow(clippy::unwrap_used)]
        let expansions = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(expansions.lines().count(), 1);

        #[allow(clippy::unwrap_used)]
        let unexpanded = source
            .records_by_state(&JobState::Running, &start, &end, false)
            .unwrap();
        assert_eq!(unexpanded[0].node_expression(), "node[01-02]");

        #[allow(clippy::unwrap_used)]
        let detail = source.record_detail("102").unwrap();
        assert_eq!(detail.user(), "bob");

        assert!(matches!(source.record_detail("999"), Err(Error::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_query() {
        let config = SlurmConfig::default().with_command(SlurmCommand::Sacct, "sh -c 'exit 1'");
        let source = SacctSource::new(&SlurmRunner::new(&config));

        assert!(source.records_by_partition("defq", &JobState::Pending).is_err());
        assert!(source.records_by_node("node01").is_err());

        #[allow(clippy::unwrap_used)]
        let hostnames = source.expand_hostnames("None assigned").unwrap();
        assert!(hostnames.is_empty());
    }
}
