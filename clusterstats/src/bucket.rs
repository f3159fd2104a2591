// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cache::ResultCache;
use crate::config::ReportConfig;
use crate::distribution::JobMetrics;
use crate::error::Error;
use crate::granularity::{GranularityProfile, Slot};
use crate::record::JobRecord;
use crate::source::{JobRecordSource, JobState};

///
/// One sampling interval of a report: a slot of the granularity
/// profile on a specific day
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucket {
    date: NaiveDate,
    hour_label: String,
    minute_label: String,
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl TimeBucket {
    pub fn new(date: &NaiveDate, slot: &Slot) -> Self {
        Self {
            date: *date,
            hour_label: slot.hour_label().to_string(),
            minute_label: slot.minute_label().to_string(),
            start: date.and_time(*slot.start()),
            end: date.and_time(*slot.end()),
        }
    }

    pub fn date(&self) -> &NaiveDate {
        &self.date
    }

    pub fn hour_label(&self) -> &str {
        &self.hour_label
    }

    pub fn minute_label(&self) -> &str {
        &self.minute_label
    }

    pub fn start(&self) -> &NaiveDateTime {
        &self.start
    }

    pub fn end(&self) -> &NaiveDateTime {
        &self.end
    }

    /// The one-second window at the start of the bucket used for snapshots
    pub fn snapshot_end(&self) -> NaiveDateTime {
        self.start + chrono::Duration::seconds(1)
    }
}

impl std::fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%H:%M:%S")
        )
    }
}

///
/// Build the bucket grid for the passed days, in day, hour, then
/// minute order
///
pub fn build_grid(days: &[NaiveDate], profile: &GranularityProfile) -> Result<Vec<TimeBucket>, Error> {
    let slots = profile.slots()?;

    Ok(days
        .iter()
        .flat_map(|day| slots.iter().map(move |slot| TimeBucket::new(day, slot)))
        .collect())
}

///
/// Number of cores a job uses on each of its nodes
///
fn cores_per_node(job: &JobRecord) -> Option<u64> {
    let nodes = match job.alloc_nodes() {
        0 => job.nodes().len() as u64,
        n => n,
    };

    match nodes {
        0 => None,
        n => Some(job.alloc_cpus() / n),
    }
}

///
/// Occupancy at the instant a bucket starts. Jobs that start or stop
/// during the bucket are not seen.
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    total_cores: u64,
    partition_cores: BTreeMap<String, u64>,
    node_cores: BTreeMap<String, u64>,
    jobs_running: Vec<JobRecord>,
}

impl Snapshot {
    pub fn from_jobs(jobs: Vec<JobRecord>, config: &ReportConfig) -> Self {
        let mut snapshot = Snapshot::default();

        for job in &jobs {
            snapshot.total_cores += job.alloc_cpus();

            if config.is_known_partition(job.partition()) {
                *snapshot
                    .partition_cores
                    .entry(job.partition().to_string())
                    .or_default() += job.alloc_cpus();
            } else {
                tracing::warn!(
                    "Job {} is in unknown partition '{}' - not counted against any partition",
                    job.job_id(),
                    job.partition()
                );
            }

            if let Some(share) = cores_per_node(job) {
                for node in job.nodes() {
                    *snapshot.node_cores.entry(node.clone()).or_default() += share;
                }
            }
        }

        snapshot.jobs_running = jobs;
        snapshot
    }

    pub fn total_cores(&self) -> u64 {
        self.total_cores
    }

    pub fn partition_cores(&self) -> &BTreeMap<String, u64> {
        &self.partition_cores
    }

    pub fn node_cores(&self) -> &BTreeMap<String, u64> {
        &self.node_cores
    }

    /// Cores in use on `hostname`, zero if it was not in use
    pub fn cores_on(&self, hostname: &str) -> u64 {
        self.node_cores.get(hostname).copied().unwrap_or(0)
    }

    pub fn jobs_running(&self) -> &[JobRecord] {
        &self.jobs_running
    }
}

///
/// Job counts for one partition
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTally {
    running: u64,
    pending: u64,
    completed: u64,
    failed: u64,
}

impl PartitionTally {
    pub fn running(&self) -> u64 {
        self.running
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn add(&mut self, other: &PartitionTally) {
        self.running += other.running;
        self.pending += other.pending;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

///
/// The full statistics for one bucket. Distributions are over the
/// running jobs only. The total cores and memory count a job in
/// every bucket it overlaps, so they are not a true measure of use.
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalStats {
    running: Vec<JobRecord>,
    pending: Vec<JobRecord>,
    completed: Vec<JobRecord>,
    failed: Vec<JobRecord>,
    partitions: BTreeMap<String, PartitionTally>,
    metrics: JobMetrics,
    total_cores: u64,
    total_memory: f64,

    #[serde(skip)]
    snapshot: Snapshot,
}

impl IntervalStats {
    pub fn from_jobs(
        running: Vec<JobRecord>,
        pending: Vec<JobRecord>,
        completed: Vec<JobRecord>,
        failed: Vec<JobRecord>,
        config: &ReportConfig,
    ) -> Self {
        let mut partitions: BTreeMap<String, PartitionTally> = config
            .partitions()
            .iter()
            .map(|p| (p.clone(), PartitionTally::default()))
            .collect();

        let mut tally = |jobs: &[JobRecord], count: fn(&mut PartitionTally)| {
            for job in jobs {
                if config.is_known_partition(job.partition()) {
                    count(partitions.entry(job.partition().to_string()).or_default());
                } else {
                    tracing::warn!(
                        "Job {} is in unknown partition '{}' - excluded from partition tallies",
                        job.job_id(),
                        job.partition()
                    );
                }
            }
        };

        tally(&running, |t| t.running += 1);
        tally(&pending, |t| t.pending += 1);
        tally(&completed, |t| t.completed += 1);
        tally(&failed, |t| t.failed += 1);

        let mut metrics = JobMetrics::new();
        let mut total_cores = 0;
        let mut total_memory = 0.0;

        for job in &running {
            metrics.add_job(job);
            total_cores += job.alloc_cpus();
            total_memory += job.total_memory();
        }

        metrics.finalise();

        Self {
            running,
            pending,
            completed,
            failed,
            partitions,
            metrics,
            total_cores,
            total_memory,
            snapshot: Snapshot::default(),
        }
    }

    pub fn running(&self) -> &[JobRecord] {
        &self.running
    }

    pub fn pending(&self) -> &[JobRecord] {
        &self.pending
    }

    pub fn completed(&self) -> &[JobRecord] {
        &self.completed
    }

    pub fn failed(&self) -> &[JobRecord] {
        &self.failed
    }

    pub fn jobs_running(&self) -> usize {
        self.running.len()
    }

    pub fn jobs_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn jobs_completed(&self) -> usize {
        self.completed.len()
    }

    pub fn jobs_failed(&self) -> usize {
        self.failed.len()
    }

    pub fn partitions(&self) -> &BTreeMap<String, PartitionTally> {
        &self.partitions
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    pub fn total_cores(&self) -> u64 {
        self.total_cores
    }

    pub fn total_memory(&self) -> f64 {
        self.total_memory
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn with_snapshot(self, snapshot: Snapshot) -> Self {
        Self { snapshot, ..self }
    }
}

///
/// The result of aggregating one bucket. A bucket whose jobs could
/// not be fetched is unavailable, which is different from a bucket
/// that had no jobs.
///
#[derive(Debug, Clone, PartialEq)]
pub enum BucketOutcome {
    Available {
        bucket: TimeBucket,
        stats: IntervalStats,
    },
    Unavailable {
        bucket: TimeBucket,
        reason: String,
    },
}

impl BucketOutcome {
    pub fn bucket(&self) -> &TimeBucket {
        match self {
            BucketOutcome::Available { bucket, .. } => bucket,
            BucketOutcome::Unavailable { bucket, .. } => bucket,
        }
    }

    pub fn stats(&self) -> Option<&IntervalStats> {
        match self {
            BucketOutcome::Available { stats, .. } => Some(stats),
            BucketOutcome::Unavailable { .. } => None,
        }
    }
}

/// A computed value, and whether every query behind it succeeded
struct Fetched<T> {
    value: T,
    complete: bool,
}

///
/// Computes the snapshot and interval statistics for buckets,
/// reusing cached results where they exist
///
pub struct BucketAggregator<'a> {
    source: &'a dyn JobRecordSource,
    cache: &'a ResultCache,
    config: &'a ReportConfig,
    now: NaiveDateTime,
}

impl<'a> BucketAggregator<'a> {
    pub fn new(
        source: &'a dyn JobRecordSource,
        cache: &'a ResultCache,
        config: &'a ReportConfig,
        now: &NaiveDateTime,
    ) -> Self {
        Self {
            source,
            cache,
            config,
            now: *now,
        }
    }

    /// Results computed with different settings are kept apart
    fn key(&self, bucket: &TimeBucket, name: &str) -> String {
        self.cache.key(
            bucket.date().year(),
            bucket.date().month(),
            bucket.date().day(),
            bucket.hour_label(),
            bucket.minute_label(),
            &format!("{}[{}]", name, self.config.result_settings(name)),
        )
    }

    fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.load(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache entry {}: {}", key, e);
                None
            }
        }
    }

    fn persist<T: Serialize>(&self, bucket: &TimeBucket, key: &str, fetched: &Fetched<T>) {
        if !fetched.complete {
            tracing::debug!("Not caching {} as some queries failed", bucket);
            return;
        }

        // the accounting data for a bucket can still change until it has ended
        if *bucket.end() >= self.now {
            tracing::debug!("Not caching {} as it has not finished", bucket);
            return;
        }

        if let Err(e) = self.cache.store(key, &fetched.value) {
            tracing::warn!("Could not cache result for {}: {}", bucket, e);
        }
    }

    fn query(
        &self,
        state: &JobState,
        start: &NaiveDateTime,
        end: &NaiveDateTime,
        expand_nodes: bool,
        complete: &mut bool,
    ) -> Result<Vec<JobRecord>, Error> {
        match self
            .source
            .records_by_state(state, start, end, expand_nodes)
        {
            Ok(records) => Ok(records),
            Err(e) if self.config.tolerate_gaps() => {
                tracing::warn!(
                    "Query for {} jobs from {} to {} failed - treating as no jobs: {}",
                    state,
                    start,
                    end,
                    e
                );
                *complete = false;
                Ok(Vec::new())
            }
            Err(e) => {
                tracing::error!(
                    "Query for {} jobs from {} to {} failed: {}",
                    state,
                    start,
                    end,
                    e
                );
                Err(e)
            }
        }
    }

    fn compute_snapshot(&self, bucket: &TimeBucket) -> Result<Fetched<Snapshot>, Error> {
        let mut complete = true;

        let running = self.query(
            &JobState::Running,
            bucket.start(),
            &bucket.snapshot_end(),
            true,
            &mut complete,
        )?;

        Ok(Fetched {
            value: Snapshot::from_jobs(running, self.config),
            complete,
        })
    }

    fn compute_stats(&self, bucket: &TimeBucket) -> Result<Fetched<IntervalStats>, Error> {
        let mut complete = true;
        let (start, end) = (bucket.start(), bucket.end());

        let running = self.query(&JobState::Running, start, end, false, &mut complete)?;
        let completed = self.query(&JobState::Completed, start, end, false, &mut complete)?;
        let failed = self.query(&JobState::Failed, start, end, false, &mut complete)?;

        let pending = match self.config.query_pending() {
            true => self.query(&JobState::Pending, start, end, false, &mut complete)?,
            false => Vec::new(),
        };

        Ok(Fetched {
            value: IntervalStats::from_jobs(running, pending, completed, failed, self.config),
            complete,
        })
    }

    /// Occupancy at the start of the bucket
    pub fn snapshot(&self, bucket: &TimeBucket) -> Result<Snapshot, Error> {
        let key = self.key(bucket, "snapshot");

        if let Some(snapshot) = self.cached(&key) {
            return Ok(snapshot);
        }

        let fetched = self.compute_snapshot(bucket)?;
        self.persist(bucket, &key, &fetched);
        Ok(fetched.value)
    }

    /// Statistics over the whole bucket, without the snapshot attached
    pub fn interval_stats(&self, bucket: &TimeBucket) -> Result<IntervalStats, Error> {
        let key = self.key(bucket, "stats");

        if let Some(stats) = self.cached(&key) {
            return Ok(stats);
        }

        let fetched = self.compute_stats(bucket)?;
        self.persist(bucket, &key, &fetched);
        Ok(fetched.value)
    }

    ///
    /// Compute the statistics for one bucket, with its snapshot
    /// attached. A failure is reported as an unavailable bucket
    /// rather than an error, so that one bad bucket never loses
    /// the rest of a report.
    ///
    pub fn aggregate(&self, bucket: &TimeBucket) -> BucketOutcome {
        let result = self.snapshot(bucket).and_then(|snapshot| {
            self.interval_stats(bucket)
                .map(|stats| stats.with_snapshot(snapshot))
        });

        match result {
            Ok(stats) => BucketOutcome::Available {
                bucket: bucket.clone(),
                stats,
            },
            Err(e) => {
                tracing::warn!("Statistics for {} are unavailable: {}", bucket, e);
                BucketOutcome::Unavailable {
                    bucket: bucket.clone(),
                    reason: e.to_string(),
                }
            }
        }
    }
}
