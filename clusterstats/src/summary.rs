// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::bucket::{BucketOutcome, IntervalStats, PartitionTally};
use crate::distribution::{Distribution, JobMetrics};
use crate::record::JobRecord;
use crate::source::NodeInventory;

///
/// The smallest and largest of a series of values
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Extrema {
    min: Option<f64>,
    max: Option<f64>,
}

impl Extrema {
    pub fn include(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.min = Some(self.min.map_or(value, |m| m.min(value)));
            self.max = Some(self.max.map_or(value, |m| m.max(value)));
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }
}

///
/// One metric over the whole window. `min` and `max` are over every
/// bucket, `median` and `p75` are recomputed from the pooled values
/// of every bucket, and the bucket ranges show how the per-bucket
/// median and waterline moved over the window.
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    min: Option<f64>,
    max: Option<f64>,
    total: f64,
    count: usize,
    median: Option<f64>,
    p75: Option<f64>,
    bucket_median: Extrema,
    bucket_p75: Extrema,
}

impl MetricSummary {
    fn fold(parts: &[&Distribution]) -> Self {
        let pooled = Distribution::pooled(parts.iter().copied());

        let mut bucket_median = Extrema::default();
        let mut bucket_p75 = Extrema::default();

        for part in parts {
            bucket_median.include(part.median());
            bucket_p75.include(part.p75());
        }

        Self {
            min: pooled.min(),
            max: pooled.max(),
            total: pooled.total(),
            count: pooled.count(),
            median: pooled.median(),
            p75: pooled.p75(),
            bucket_median,
            bucket_p75,
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn median(&self) -> Option<f64> {
        self.median
    }

    pub fn p75(&self) -> Option<f64> {
        self.p75
    }

    pub fn bucket_median(&self) -> &Extrema {
        &self.bucket_median
    }

    pub fn bucket_p75(&self) -> &Extrema {
        &self.bucket_p75
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    cores: MetricSummary,
    cpu_time: MetricSummary,
    nodes: MetricSummary,
    memory_per_core: MetricSummary,
    memory_per_job: MetricSummary,
}

impl WindowMetrics {
    fn fold(metrics: &[&JobMetrics]) -> Self {
        let fold = |f: fn(&JobMetrics) -> &Distribution| {
            MetricSummary::fold(&metrics.iter().map(|m| f(m)).collect::<Vec<_>>())
        };

        Self {
            cores: fold(JobMetrics::cores),
            cpu_time: fold(JobMetrics::cpu_time),
            nodes: fold(JobMetrics::nodes),
            memory_per_core: fold(JobMetrics::memory_per_core),
            memory_per_job: fold(JobMetrics::memory_per_job),
        }
    }

    pub fn cores(&self) -> &MetricSummary {
        &self.cores
    }

    pub fn cpu_time(&self) -> &MetricSummary {
        &self.cpu_time
    }

    pub fn nodes(&self) -> &MetricSummary {
        &self.nodes
    }

    pub fn memory_per_core(&self) -> &MetricSummary {
        &self.memory_per_core
    }

    pub fn memory_per_job(&self) -> &MetricSummary {
        &self.memory_per_job
    }
}

///
/// Job counts and totals over every available bucket
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowTotals {
    total_cores: Extrema,
    total_memory: Extrema,
    jobs_running: Extrema,
    jobs_pending: Extrema,
    jobs_completed: u64,
    jobs_failed: u64,
    metrics: WindowMetrics,
}

impl WindowTotals {
    fn fold(stats: &[&IntervalStats]) -> Self {
        let mut totals = WindowTotals::default();

        for s in stats {
            totals.total_cores.include(Some(s.total_cores() as f64));
            totals.total_memory.include(Some(s.total_memory()));
            totals.jobs_running.include(Some(s.jobs_running() as f64));
            totals.jobs_pending.include(Some(s.jobs_pending() as f64));
            totals.jobs_completed += s.jobs_completed() as u64;
            totals.jobs_failed += s.jobs_failed() as u64;
        }

        totals.metrics = WindowMetrics::fold(&stats.iter().map(|s| s.metrics()).collect::<Vec<_>>());

        totals
    }

    pub fn total_cores(&self) -> &Extrema {
        &self.total_cores
    }

    pub fn total_memory(&self) -> &Extrema {
        &self.total_memory
    }

    pub fn jobs_running(&self) -> &Extrema {
        &self.jobs_running
    }

    pub fn jobs_pending(&self) -> &Extrema {
        &self.jobs_pending
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed
    }

    pub fn metrics(&self) -> &WindowMetrics {
        &self.metrics
    }
}

///
/// Cores used and free on one node, one sample per bucket. Buckets
/// that were unavailable have no sample.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUsage {
    hostname: String,
    cpus: u64,
    cores_used: Vec<Option<u64>>,
    cores_free: Vec<Option<u64>>,
}

impl NodeUsage {
    pub fn new(hostname: &str, cpus: u64) -> Self {
        Self {
            hostname: hostname.to_string(),
            cpus,
            cores_used: Vec::new(),
            cores_free: Vec::new(),
        }
    }

    /// Record a sample. Free cores never go below zero, even if the
    /// node appears to be oversubscribed.
    pub fn record(&mut self, used: Option<u64>) {
        self.cores_used.push(used);
        self.cores_free.push(used.map(|used| self.cpus.saturating_sub(used)));
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cpus(&self) -> u64 {
        self.cpus
    }

    pub fn cores_used(&self) -> &[Option<u64>] {
        &self.cores_used
    }

    pub fn cores_free(&self) -> &[Option<u64>] {
        &self.cores_free
    }

    /// Mean cores in use over the buckets that have a sample
    pub fn mean_used(&self) -> Option<f64> {
        let samples: Vec<u64> = self.cores_used.iter().flatten().copied().collect();

        match samples.is_empty() {
            true => None,
            false => Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64),
        }
    }
}

///
/// Cores in use across the cluster at the start of each bucket,
/// compared with the total number of cores available. The extrema
/// and median only cover buckets that have a sample.
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Utilisation {
    capacity: u64,
    use_list: Vec<Option<u64>>,
    use_min: Option<u64>,
    use_max: Option<u64>,
    use_median: Option<f64>,
    percent_min: f64,
    percent_max: f64,
    percent_median: f64,
}

impl Utilisation {
    fn new(capacity: u64, use_list: Vec<Option<u64>>) -> Self {
        let samples: Vec<u64> = use_list.iter().flatten().copied().collect();

        let use_min = samples.iter().min().copied();
        let use_max = samples.iter().max().copied();
        let use_median = match samples.is_empty() {
            true => None,
            false => Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64),
        };

        let percent = |used: Option<f64>| match (capacity, used) {
            (0, _) | (_, None) => 0.0,
            (capacity, Some(used)) => used / capacity as f64 * 100.0,
        };

        Self {
            capacity,
            percent_min: percent(use_min.map(|u| u as f64)),
            percent_max: percent(use_max.map(|u| u as f64)),
            percent_median: percent(use_median),
            use_list,
            use_min,
            use_max,
            use_median,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// One entry per bucket, in bucket order
    pub fn use_list(&self) -> &[Option<u64>] {
        &self.use_list
    }

    pub fn use_min(&self) -> Option<u64> {
        self.use_min
    }

    pub fn use_max(&self) -> Option<u64> {
        self.use_max
    }

    pub fn use_median(&self) -> Option<f64> {
        self.use_median
    }

    pub fn percent_min(&self) -> f64 {
        self.percent_min
    }

    pub fn percent_max(&self) -> f64 {
        self.percent_max
    }

    pub fn percent_median(&self) -> f64 {
        self.percent_median
    }
}

fn per_job(total: f64, jobs: u64) -> f64 {
    match jobs {
        0 => 0.0,
        jobs => total / jobs as f64,
    }
}

///
/// Everything one user ran in the window, with per-job averages
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserUsage {
    user: String,
    jobs: u64,
    cpu_time: u64,
    cores: u64,
    memory: f64,
    memory_per_core: f64,
    nodes: u64,
}

impl UserUsage {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            ..Default::default()
        }
    }

    pub fn add_job(&mut self, job: &JobRecord) {
        self.jobs += 1;
        self.cpu_time += job.cpu_time();
        self.cores += job.alloc_cpus();
        self.memory += job.total_memory();
        self.memory_per_core += job.memory_per_core();
        self.nodes += job.alloc_nodes();
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn jobs(&self) -> u64 {
        self.jobs
    }

    pub fn cpu_time(&self) -> u64 {
        self.cpu_time
    }

    pub fn cores(&self) -> u64 {
        self.cores
    }

    pub fn memory(&self) -> f64 {
        self.memory
    }

    pub fn memory_per_core(&self) -> f64 {
        self.memory_per_core
    }

    pub fn nodes(&self) -> u64 {
        self.nodes
    }

    pub fn average_cpu_time(&self) -> f64 {
        per_job(self.cpu_time as f64, self.jobs)
    }

    pub fn average_cores(&self) -> f64 {
        per_job(self.cores as f64, self.jobs)
    }

    pub fn average_memory(&self) -> f64 {
        per_job(self.memory, self.jobs)
    }

    pub fn average_memory_per_core(&self) -> f64 {
        per_job(self.memory_per_core, self.jobs)
    }

    pub fn average_nodes(&self) -> f64 {
        per_job(self.nodes as f64, self.jobs)
    }
}

///
/// The metrics that users are ranked by
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeagueMetric {
    Jobs,
    CpuTime,
    Cores,
    Memory,
    MemoryPerCore,
    Nodes,
    AverageCpuTime,
    AverageCores,
    AverageMemory,
    AverageMemoryPerCore,
    AverageNodes,
}

impl LeagueMetric {
    pub const ALL: [LeagueMetric; 11] = [
        LeagueMetric::Jobs,
        LeagueMetric::CpuTime,
        LeagueMetric::Cores,
        LeagueMetric::Memory,
        LeagueMetric::MemoryPerCore,
        LeagueMetric::Nodes,
        LeagueMetric::AverageCpuTime,
        LeagueMetric::AverageCores,
        LeagueMetric::AverageMemory,
        LeagueMetric::AverageMemoryPerCore,
        LeagueMetric::AverageNodes,
    ];

    pub fn value(&self, usage: &UserUsage) -> f64 {
        match self {
            LeagueMetric::Jobs => usage.jobs() as f64,
            LeagueMetric::CpuTime => usage.cpu_time() as f64,
            LeagueMetric::Cores => usage.cores() as f64,
            LeagueMetric::Memory => usage.memory(),
            LeagueMetric::MemoryPerCore => usage.memory_per_core(),
            LeagueMetric::Nodes => usage.nodes() as f64,
            LeagueMetric::AverageCpuTime => usage.average_cpu_time(),
            LeagueMetric::AverageCores => usage.average_cores(),
            LeagueMetric::AverageMemory => usage.average_memory(),
            LeagueMetric::AverageMemoryPerCore => usage.average_memory_per_core(),
            LeagueMetric::AverageNodes => usage.average_nodes(),
        }
    }
}

impl std::fmt::Display for LeagueMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LeagueMetric::Jobs => "jobs",
            LeagueMetric::CpuTime => "CPU time (s)",
            LeagueMetric::Cores => "cores",
            LeagueMetric::Memory => "memory (MB)",
            LeagueMetric::MemoryPerCore => "memory per core (MB)",
            LeagueMetric::Nodes => "nodes",
            LeagueMetric::AverageCpuTime => "CPU time per job (s)",
            LeagueMetric::AverageCores => "cores per job",
            LeagueMetric::AverageMemory => "memory per job (MB)",
            LeagueMetric::AverageMemoryPerCore => "memory per core per job (MB)",
            LeagueMetric::AverageNodes => "nodes per job",
        };

        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueEntry {
    user: String,
    value: f64,
}

impl LeagueEntry {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

///
/// The top users for one metric, highest first. Users with equal
/// values keep the order in which they were first seen.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueTable {
    metric: LeagueMetric,
    entries: Vec<LeagueEntry>,
}

impl LeagueTable {
    pub fn build(metric: LeagueMetric, users: &[UserUsage], size: usize) -> Self {
        let mut ranked: Vec<&UserUsage> = users.iter().collect();

        // sort_by is stable, so ties stay in first-seen order
        ranked.sort_by(|a, b| metric.value(b).total_cmp(&metric.value(a)));

        Self {
            metric,
            entries: ranked
                .into_iter()
                .take(size)
                .map(|u| LeagueEntry {
                    user: u.user().to_string(),
                    value: metric.value(u),
                })
                .collect(),
        }
    }

    pub fn metric(&self) -> LeagueMetric {
        self.metric
    }

    pub fn entries(&self) -> &[LeagueEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnavailableBucket {
    start: NaiveDateTime,
    end: NaiveDateTime,
    reason: String,
}

impl UnavailableBucket {
    pub fn start(&self) -> &NaiveDateTime {
        &self.start
    }

    pub fn end(&self) -> &NaiveDateTime {
        &self.end
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

///
/// The rollup of a whole reporting window
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
    buckets: usize,
    nodes: Vec<NodeUsage>,
    utilisation: Utilisation,
    totals: WindowTotals,
    partitions: BTreeMap<String, PartitionTally>,
    jobs: Vec<JobRecord>,
    users: Vec<UserUsage>,
    league_tables: Vec<LeagueTable>,
    unavailable: Vec<UnavailableBucket>,
}

impl Summary {
    pub fn start(&self) -> Option<&NaiveDateTime> {
        self.start.as_ref()
    }

    pub fn end(&self) -> Option<&NaiveDateTime> {
        self.end.as_ref()
    }

    /// Number of buckets in the window, available or not
    pub fn buckets(&self) -> usize {
        self.buckets
    }

    pub fn nodes(&self) -> &[NodeUsage] {
        &self.nodes
    }

    pub fn utilisation(&self) -> &Utilisation {
        &self.utilisation
    }

    pub fn totals(&self) -> &WindowTotals {
        &self.totals
    }

    pub fn partitions(&self) -> &BTreeMap<String, PartitionTally> {
        &self.partitions
    }

    /// Every job seen running in the window, once each
    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    pub fn users(&self) -> &[UserUsage] {
        &self.users
    }

    pub fn league_tables(&self) -> &[LeagueTable] {
        &self.league_tables
    }

    pub fn league_table(&self, metric: LeagueMetric) -> Option<&LeagueTable> {
        self.league_tables.iter().find(|t| t.metric() == metric)
    }

    pub fn unavailable(&self) -> &[UnavailableBucket] {
        &self.unavailable
    }
}

///
/// Folds bucket results into a [Summary]
///
pub struct SummaryBuilder<'a> {
    inventory: &'a dyn NodeInventory,
    league_table_size: usize,
}

impl<'a> SummaryBuilder<'a> {
    pub fn new(inventory: &'a dyn NodeInventory, league_table_size: usize) -> Self {
        Self {
            inventory,
            league_table_size,
        }
    }

    ///
    /// Fetch the capacity of every node once. Nodes whose details
    /// cannot be fetched are left out rather than failing the report.
    ///
    fn node_capacity(&self) -> Vec<NodeUsage> {
        let hostnames = match self.inventory.list_nodes() {
            Ok(hostnames) => hostnames,
            Err(e) => {
                tracing::warn!("Could not list nodes - per-node usage is unavailable: {}", e);
                return Vec::new();
            }
        };

        hostnames
            .iter()
            .filter_map(|hostname| match self.inventory.node_detail(hostname) {
                Ok(detail) => Some(NodeUsage::new(hostname, detail.cpus())),
                Err(e) => {
                    tracing::warn!("Could not get details of node {}: {}", hostname, e);
                    None
                }
            })
            .collect()
    }

    pub fn build(&self, outcomes: &[BucketOutcome]) -> Summary {
        let mut nodes = self.node_capacity();
        let capacity: u64 = nodes.iter().map(|n| n.cpus()).sum();

        let mut use_list = Vec::new();
        let mut stats = Vec::new();
        let mut unavailable = Vec::new();

        for outcome in outcomes {
            match outcome {
                BucketOutcome::Available { stats: s, .. } => {
                    let snapshot = s.snapshot();

                    let used = match nodes.is_empty() {
                        // without an inventory, fall back to the snapshot's own total
                        true => snapshot.total_cores(),
                        false => nodes
                            .iter_mut()
                            .map(|node| {
                                let used = snapshot.cores_on(node.hostname());
                                node.record(Some(used));
                                used
                            })
                            .sum(),
                    };

                    use_list.push(Some(used));
                    stats.push(s);
                }
                BucketOutcome::Unavailable { bucket, reason } => {
                    for node in nodes.iter_mut() {
                        node.record(None);
                    }
                    use_list.push(None);

                    unavailable.push(UnavailableBucket {
                        start: *bucket.start(),
                        end: *bucket.end(),
                        reason: reason.clone(),
                    });
                }
            }
        }

        let mut partitions: BTreeMap<String, PartitionTally> = BTreeMap::new();

        for s in &stats {
            for (name, tally) in s.partitions() {
                partitions.entry(name.clone()).or_default().add(tally);
            }
        }

        let jobs = unique_jobs(&stats);
        let users = user_usage(&jobs);

        let league_tables = LeagueMetric::ALL
            .iter()
            .map(|metric| LeagueTable::build(*metric, &users, self.league_table_size))
            .collect();

        if !unavailable.is_empty() {
            tracing::warn!(
                "{} of {} buckets are unavailable and are not included",
                unavailable.len(),
                outcomes.len()
            );
        }

        Summary {
            start: outcomes.first().map(|o| *o.bucket().start()),
            end: outcomes.last().map(|o| *o.bucket().end()),
            buckets: outcomes.len(),
            nodes,
            utilisation: Utilisation::new(capacity, use_list),
            totals: WindowTotals::fold(&stats),
            partitions,
            jobs,
            users,
            league_tables,
            unavailable,
        }
    }
}

/// Running jobs from every bucket, keeping only the first sighting of each
fn unique_jobs(stats: &[&IntervalStats]) -> Vec<JobRecord> {
    let mut seen = HashSet::new();

    stats
        .iter()
        .flat_map(|s| s.running())
        .filter(|job| seen.insert(job.job_id().to_string()))
        .cloned()
        .collect()
}

/// Per-user totals, in the order users were first seen
fn user_usage(jobs: &[JobRecord]) -> Vec<UserUsage> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut users: Vec<UserUsage> = Vec::new();

    for job in jobs {
        let i = *index.entry(job.user()).or_insert_with(|| {
            users.push(UserUsage::new(job.user()));
            users.len() - 1
        });

        users[i].add_job(job);
    }

    users
}

fn show(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{:.1}", value),
        None => "-".to_string(),
    }
}

impl std::fmt::Display for MetricSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min={} max={} median={} p75={} (bucket median {}..{}, bucket p75 {}..{})",
            show(self.min),
            show(self.max),
            show(self.median),
            show(self.p75),
            show(self.bucket_median.min()),
            show(self.bucket_median.max()),
            show(self.bucket_p75.min()),
            show(self.bucket_p75.max())
        )
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => writeln!(f, "Usage from {} to {}", start, end)?,
            _ => writeln!(f, "Usage for an empty window")?,
        }

        writeln!(
            f,
            "Buckets: {} ({} unavailable)",
            self.buckets,
            self.unavailable.len()
        )?;

        let u = &self.utilisation;
        writeln!(
            f,
            "Cores in use: min={} max={} median={} of {} ({:.1}% / {:.1}% / {:.1}%)",
            u.use_min.map_or("-".to_string(), |v| v.to_string()),
            u.use_max.map_or("-".to_string(), |v| v.to_string()),
            show(u.use_median),
            u.capacity,
            u.percent_min,
            u.percent_max,
            u.percent_median
        )?;

        let t = &self.totals;
        writeln!(
            f,
            "Jobs running: min={} max={}",
            show(t.jobs_running.min()),
            show(t.jobs_running.max())
        )?;
        writeln!(
            f,
            "Jobs pending: min={} max={}",
            show(t.jobs_pending.min()),
            show(t.jobs_pending.max())
        )?;
        writeln!(f, "Jobs completed: {}", t.jobs_completed)?;
        writeln!(f, "Jobs failed: {}", t.jobs_failed)?;
        writeln!(f, "Unique jobs: {}", self.jobs.len())?;

        let m = &t.metrics;
        writeln!(f, "Cores per job: {}", m.cores)?;
        writeln!(f, "CPU time per job (s): {}", m.cpu_time)?;
        writeln!(f, "Nodes per job: {}", m.nodes)?;
        writeln!(f, "Memory per core (MB): {}", m.memory_per_core)?;
        writeln!(f, "Memory per job (MB): {}", m.memory_per_job)?;

        if !self.partitions.is_empty() {
            writeln!(f, "\nPartitions:")?;
            for (name, tally) in &self.partitions {
                writeln!(
                    f,
                    "  {}: running={} pending={} completed={} failed={}",
                    name,
                    tally.running(),
                    tally.pending(),
                    tally.completed(),
                    tally.failed()
                )?;
            }
        }

        if !self.nodes.is_empty() {
            writeln!(f, "\nNodes:")?;
            for node in &self.nodes {
                writeln!(
                    f,
                    "  {}: {} cores, mean {} in use",
                    node.hostname,
                    node.cpus,
                    show(node.mean_used())
                )?;
            }
        }

        for table in &self.league_tables {
            if table.entries.is_empty() {
                continue;
            }

            writeln!(f, "\nTop users by {}:", table.metric)?;
            for (i, entry) in table.entries.iter().enumerate() {
                writeln!(f, "  {:>3}. {} {:.1}", i + 1, entry.user, entry.value)?;
            }
        }

        for bucket in &self.unavailable {
            writeln!(
                f,
                "\nUnavailable: {} to {}: {}",
                bucket.start, bucket.end, bucket.reason
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{build_grid, BucketAggregator, Snapshot};
    use crate::cache::ResultCache;
    use crate::config::ReportConfig;
    use crate::granularity::ReportPeriod;
    use crate::source::JobState;
    use crate::testing::{datetime, job, FakeInventory, FakeSource};

    fn outcomes(source: &FakeSource, config: &ReportConfig) -> Vec<BucketOutcome> {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());

        let day = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap_or_default();

        #[allow(clippy::unwrap_used)]
        let grid = build_grid(&[day], &ReportPeriod::Monthly.default_profile()).unwrap();

        let now = datetime("2024-04-01T00:00:00");
        let aggregator = BucketAggregator::new(source, &cache, config, &now);

        grid[..3].iter().map(|b| aggregator.aggregate(b)).collect()
    }

    #[test]
    fn test_free_cores_clamp() {
        let mut node = NodeUsage::new("node01", 4);
        node.record(Some(6));
        node.record(None);
        node.record(Some(1));
        assert_eq!(node.cores_used(), &[Some(6), None, Some(1)]);
        assert_eq!(node.cores_free(), &[Some(0), None, Some(3)]);
        assert_eq!(node.mean_used(), Some(3.5));
    }

    #[test]
    fn test_league_table() {
        let mut users = Vec::new();

        for (name, cores) in [("a", 50), ("b", 50), ("c", 30)] {
            let mut u = UserUsage::new(name);
            u.add_job(&job("1", name, "defq", cores, &["node01"], "1Gc"));
            users.push(u);
        }

        let table = LeagueTable::build(LeagueMetric::Cores, &users, 2);
        let names: Vec<&str> = table.entries().iter().map(|e| e.user()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let table = LeagueTable::build(LeagueMetric::Cores, &users[1..], 5);
        let names: Vec<&str> = table.entries().iter().map(|e| e.user()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_user_averages() {
        let mut u = UserUsage::new("alice");
        assert_eq!(u.average_cores(), 0.0);

        u.add_job(&job("1", "alice", "defq", 4, &["node01"], "1Gc"));
        u.add_job(&job("2", "alice", "defq", 8, &["node01", "node02"], "2Gc"));

        assert_eq!(u.jobs(), 2);
        assert_eq!(u.cores(), 12);
        assert_eq!(u.nodes(), 3);
        assert_eq!(u.average_cores(), 6.0);
        assert_eq!(u.memory(), 4096.0 + 16384.0);
        assert_eq!(u.average_memory_per_core(), 1536.0);
        assert_eq!(u.average_cpu_time(), 6.0 * 3600.0);
    }

    #[test]
    fn test_deduplication() {
        let source = FakeSource::new().with_running(vec![
            job("1", "alice", "defq", 4, &["node01"], "1Gc"),
            job("2", "bob", "defq", 2, &["node02"], "1Gc"),
        ]);

        let config = ReportConfig::default();
        let outcomes = outcomes(&source, &config);
        assert_eq!(outcomes.len(), 3);

        let inventory = FakeInventory::new(&[("node01", 4), ("node02", 4)]);
        let summary = SummaryBuilder::new(&inventory, 25).build(&outcomes);

        // both jobs span all three buckets but are counted once
        assert_eq!(summary.jobs().len(), 2);
        assert_eq!(summary.users().len(), 2);
        assert_eq!(summary.users()[0].user(), "alice");
        assert_eq!(summary.users()[0].jobs(), 1);
        assert_eq!(summary.users()[0].cores(), 4);

        assert_eq!(summary.nodes()[0].cores_free(), &[Some(0), Some(0), Some(0)]);
        assert_eq!(summary.nodes()[1].cores_free(), &[Some(2), Some(2), Some(2)]);
        assert_eq!(summary.utilisation().capacity(), 8);
        assert_eq!(summary.utilisation().use_list(), &[Some(6), Some(6), Some(6)]);
        assert_eq!(summary.utilisation().percent_max(), 75.0);

        // the pooled distributions keep every bucket's values
        assert_eq!(summary.totals().metrics().cores().count(), 6);
        assert_eq!(summary.totals().metrics().cores().median(), Some(3.0));
        assert_eq!(summary.totals().jobs_running().max(), Some(2.0));
        assert_eq!(summary.partitions()["defq"].running(), 6);
    }

    #[test]
    fn test_window_statistics() {
        let source = FakeSource::new()
            .with_window(
                JobState::Running,
                "2024-03-01T00:00:00",
                vec![
                    job("1", "alice", "defq", 1, &["node01"], "1Gc"),
                    job("2", "bob", "defq", 2, &["node01"], "1Gc"),
                ],
            )
            .with_window(
                JobState::Running,
                "2024-03-01T01:00:00",
                vec![
                    job("3", "carol", "defq", 3, &["node01"], "1Gc"),
                    job("4", "carol", "defq", 4, &["node02"], "1Gc"),
                    job("5", "dave", "defq", 5, &["node02"], "1Gc"),
                    job("6", "dave", "defq", 6, &["node02"], "1Gc"),
                    job("7", "erin", "defq", 7, &["node02"], "1Gc"),
                    job("8", "erin", "defq", 8, &["node02"], "1Gc"),
                ],
            )
            .with_completed(vec![job("9", "frank", "defq", 1, &["node01"], "1Gc")]);

        let config = ReportConfig::default();
        let outcomes = outcomes(&source, &config);

        let inventory = FakeInventory::new(&[("node01", 64), ("node02", 64)]);
        let summary = SummaryBuilder::new(&inventory, 3).build(&outcomes);

        let cores = summary.totals().metrics().cores();
        assert_eq!(cores.count(), 8);
        assert_eq!(cores.min(), Some(1.0));
        assert_eq!(cores.max(), Some(8.0));
        assert_eq!(cores.median(), Some(4.5));
        assert_eq!(cores.p75(), Some(7.0));
        assert_eq!(cores.bucket_median().min(), Some(1.5));
        assert_eq!(cores.bucket_median().max(), Some(5.5));

        assert_eq!(summary.totals().jobs_completed(), 3);
        assert_eq!(summary.totals().jobs_running().min(), Some(0.0));
        assert_eq!(summary.totals().jobs_running().max(), Some(6.0));

        // the third bucket had nothing running
        assert_eq!(summary.utilisation().use_list(), &[Some(3), Some(33), Some(0)]);
        assert_eq!(summary.utilisation().use_min(), Some(0));
        assert_eq!(summary.utilisation().use_median(), Some(12.0));

        #[allow(clippy::unwrap_used)]
        let top = summary.league_table(LeagueMetric::Cores).unwrap();
        let names: Vec<&str> = top.entries().iter().map(|e| e.user()).collect();
        assert_eq!(names, vec!["erin", "dave", "carol"]);

        #[allow(clippy::unwrap_used)]
        let top = summary.league_table(LeagueMetric::Jobs).unwrap();
        let names: Vec<&str> = top.entries().iter().map(|e| e.user()).collect();
        assert_eq!(names, vec!["carol", "dave", "erin"]);

        assert_eq!(summary.league_tables().len(), LeagueMetric::ALL.len());
        assert!(summary.to_string().contains("Top users by cores"));
    }

    #[test]
    fn test_unavailable_buckets() {
        let source = FakeSource::new()
            .with_running(vec![job("1", "alice", "defq", 4, &["node01"], "1Gc")])
            .failing(JobState::Completed);

        let config = ReportConfig::default();
        let outcomes = outcomes(&source, &config);

        let inventory = FakeInventory::new(&[("node01", 4)]);
        let summary = SummaryBuilder::new(&inventory, 25).build(&outcomes);

        assert_eq!(summary.buckets(), 3);
        assert_eq!(summary.unavailable().len(), 3);
        assert!(summary.jobs().is_empty());
        assert_eq!(summary.utilisation().use_list(), &[None::<u64>; 3]);
        assert_eq!(summary.utilisation().use_median(), None);
        assert_eq!(summary.utilisation().percent_median(), 0.0);
        assert_eq!(summary.totals().metrics().cores().median(), None);
        assert_eq!(summary.nodes()[0].cores_used(), &[None::<u64>; 3]);
    }

    #[test]
    fn test_samples_stay_aligned_with_buckets() {
        let source = FakeSource::new()
            .with_running(vec![job("1", "alice", "defq", 4, &["node01"], "1Gc")]);

        let config = ReportConfig::default();
        let mut outcomes = outcomes(&source, &config);

        let failed = outcomes[1].bucket().clone();
        outcomes[1] = BucketOutcome::Unavailable {
            bucket: failed,
            reason: "sacct failed".to_string(),
        };

        let inventory = FakeInventory::new(&[("node01", 8)]);
        let summary = SummaryBuilder::new(&inventory, 25).build(&outcomes);

        assert_eq!(summary.buckets(), 3);
        assert_eq!(summary.utilisation().use_list(), &[Some(4), None, Some(4)]);
        assert_eq!(summary.nodes()[0].cores_used(), &[Some(4), None, Some(4)]);
        assert_eq!(summary.nodes()[0].cores_free(), &[Some(4), None, Some(4)]);

        // the gap is left out of the statistics rather than counted as idle
        assert_eq!(summary.utilisation().use_min(), Some(4));
        assert_eq!(summary.utilisation().use_median(), Some(4.0));
        assert_eq!(summary.utilisation().percent_median(), 50.0);
        assert_eq!(summary.unavailable().len(), 1);
    }

    #[test]
    fn test_inventory_failures() {
        let mut stats = IntervalStats::default();
        let snapshot = Snapshot::from_jobs(
            vec![job("1", "alice", "defq", 4, &["node01"], "1Gc")],
            &ReportConfig::default(),
        );
        stats = stats.with_snapshot(snapshot);

        let day = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap_or_default();
        #[allow(clippy::unwrap_used)]
        let bucket = build_grid(&[day], &ReportPeriod::Yearly.default_profile())
            .unwrap()
            .remove(0);

        let outcomes = vec![BucketOutcome::Available { bucket, stats }];

        // no inventory - utilisation falls back to the snapshot, with no percentage
        let inventory = FakeInventory::unavailable();
        let summary = SummaryBuilder::new(&inventory, 25).build(&outcomes);
        assert!(summary.nodes().is_empty());
        assert_eq!(summary.utilisation().use_list(), &[Some(4)]);
        assert_eq!(summary.utilisation().capacity(), 0);
        assert_eq!(summary.utilisation().percent_max(), 0.0);

        // a node without details is skipped
        let inventory = FakeInventory::new(&[("node01", 8)]).with_broken("node02");
        let summary = SummaryBuilder::new(&inventory, 25).build(&outcomes);
        assert_eq!(summary.nodes().len(), 1);
        assert_eq!(summary.utilisation().percent_max(), 50.0);
    }
}
