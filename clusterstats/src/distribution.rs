// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

use crate::record::JobRecord;

/// The percentile reported alongside the median
pub const WATERLINE: f64 = 0.75;

/// Arithmetic mean, reported as the "median" of a distribution
pub fn mean(values: &[f64]) -> Option<f64> {
    match values.is_empty() {
        true => None,
        false => Some(values.iter().sum::<f64>() / values.len() as f64),
    }
}

///
/// Nearest-rank percentile of an already sorted list: the value at
/// zero-based index `floor(count * fraction)`, with no interpolation
///
pub fn nearest_rank(sorted: &[f64], fraction: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let index = (sorted.len() as f64 * fraction).floor() as usize;
    sorted.get(index.min(sorted.len() - 1)).copied()
}

///
/// The distribution of one metric over a set of jobs. Statistics of
/// an empty distribution are None, never zero.
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    min: Option<f64>,
    max: Option<f64>,
    total: f64,
    values: Vec<f64>,
    median: Option<f64>,
    p75: Option<f64>,
}

impl Distribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
        self.total += value;
        self.values.push(value);
    }

    /// Sort the values and derive the median and waterline
    pub fn finalise(&mut self) {
        self.values.sort_by(|a, b| a.total_cmp(b));
        self.median = mean(&self.values);
        self.p75 = nearest_rank(&self.values, WATERLINE);
    }

    ///
    /// Pool the raw values of many distributions into one, so that
    /// the median and waterline are recomputed over every value
    /// rather than averaged from the parts
    ///
    pub fn pooled<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a Distribution>,
    {
        let mut pooled = Self::new();

        for part in parts {
            pooled.values.extend_from_slice(&part.values);
            pooled.total += part.total;

            if let Some(min) = part.min {
                pooled.min = Some(pooled.min.map_or(min, |m| m.min(min)));
            }

            if let Some(max) = part.max {
                pooled.max = Some(pooled.max.map_or(max, |m| m.max(max)));
            }
        }

        pooled.finalise();
        pooled
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
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

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn median(&self) -> Option<f64> {
        self.median
    }

    pub fn p75(&self) -> Option<f64> {
        self.p75
    }
}

fn show(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{:.1}", value),
        None => "-".to_string(),
    }
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min={} max={} median={} p75={} total={:.1}",
            show(self.min),
            show(self.max),
            show(self.median),
            show(self.p75),
            self.total
        )
    }
}

///
/// The distributions gathered for every running job in a bucket
///
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    cores: Distribution,
    cpu_time: Distribution,
    nodes: Distribution,
    memory_per_core: Distribution,
    memory_per_job: Distribution,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, job: &JobRecord) {
        self.cores.add(job.alloc_cpus() as f64);
        self.cpu_time.add(job.cpu_time() as f64);
        self.nodes.add(job.alloc_nodes() as f64);
        self.memory_per_core.add(job.memory_per_core());
        self.memory_per_job.add(job.total_memory());
    }

    pub fn finalise(&mut self) {
        self.cores.finalise();
        self.cpu_time.finalise();
        self.nodes.finalise();
        self.memory_per_core.finalise();
        self.memory_per_job.finalise();
    }

    pub fn cores(&self) -> &Distribution {
        &self.cores
    }

    pub fn cpu_time(&self) -> &Distribution {
        &self.cpu_time
    }

    pub fn nodes(&self) -> &Distribution {
        &self.nodes
    }

    pub fn memory_per_core(&self) -> &Distribution {
        &self.memory_per_core
    }

    pub fn memory_per_job(&self) -> &Distribution {
        &self.memory_per_job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distribution(values: &[f64]) -> Distribution {
        let mut d = Distribution::new();
        values.iter().for_each(|v| d.add(*v));
        d.finalise();
        d
    }

    #[test]
    fn test_nearest_rank() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        assert_eq!(nearest_rank(&sorted, WATERLINE), Some(7.0));
        assert_eq!(nearest_rank(&[42.0], WATERLINE), Some(42.0));
        assert_eq!(nearest_rank(&[], WATERLINE), None);
        assert_eq!(nearest_rank(&sorted, 1.0), Some(8.0));
    }

    #[test]
    fn test_median_is_mean() {
        let d = distribution(&[2.0, 4.0, 6.0]);
        assert_eq!(d.median(), Some(4.0));

        let d = distribution(&[1.0, 1.0, 100.0]);
        assert_eq!(d.median(), Some(34.0));
    }

    #[test]
    fn test_distribution() {
        let d = distribution(&[8.0, 3.0, 5.0, 1.0]);
        assert_eq!(d.min(), Some(1.0));
        assert_eq!(d.max(), Some(8.0));
        assert_eq!(d.total(), 17.0);
        assert_eq!(d.count(), 4);
        assert_eq!(d.values(), &[1.0, 3.0, 5.0, 8.0]);
        assert_eq!(d.p75(), Some(8.0));
    }

    #[test]
    fn test_empty_is_none() {
        let d = distribution(&[]);
        assert!(d.is_empty());
        assert_eq!(d.min(), None);
        assert_eq!(d.max(), None);
        assert_eq!(d.median(), None);
        assert_eq!(d.p75(), None);
        assert_eq!(d.total(), 0.0);
    }

    #[test]
    fn test_pooled() {
        let a = distribution(&[1.0, 2.0]);
        let b = distribution(&[]);
        let c = distribution(&[3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let pooled = Distribution::pooled([&a, &b, &c]);
        assert_eq!(pooled.count(), 8);
        assert_eq!(pooled.min(), Some(1.0));
        assert_eq!(pooled.max(), Some(8.0));
        assert_eq!(pooled.median(), Some(4.5));
        assert_eq!(pooled.p75(), Some(7.0));
        assert_eq!(pooled.total(), 36.0);

        // not the average of the parts
        assert_ne!(pooled.median(), Some((1.5 + 5.5) / 2.0));
    }
}
