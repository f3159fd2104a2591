// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};

use crate::bucket::{build_grid, BucketAggregator};
use crate::cache::ResultCache;
use crate::config::ReportConfig;
use crate::error::Error;
use crate::granularity::{GranularityProfile, ReportPeriod};
use crate::source::{JobRecordSource, NodeInventory};
use crate::summary::{Summary, SummaryBuilder};

///
/// The inclusive range of days covered by a report
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl ReportWindow {
    pub fn new(start: &NaiveDate, end: &NaiveDate) -> Self {
        match start <= end {
            true => Self {
                start: *start,
                end: *end,
            },
            false => Self {
                start: *end,
                end: *start,
            },
        }
    }

    /// The days of `period` that end with (and include) `end`
    pub fn ending(period: ReportPeriod, end: &NaiveDate) -> Self {
        let start = *end - chrono::Duration::days(period.days() as i64 - 1);
        Self { start, end: *end }
    }

    ///
    /// Parse either a single `YYYY-MM-DD` day, or a range of days
    /// written as `YYYY-MM-DD:YYYY-MM-DD`
    ///
    pub fn parse(window: &str) -> Result<Self, Error> {
        let window = window.trim();

        let (start, end) = match window.split_once(':') {
            Some((start, end)) => (start, end),
            None => (window, window),
        };

        let parse = |date: &str| {
            NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
                .with_context(|| format!("Invalid date '{}' in report window '{}'", date, window))
        };

        Ok(Self::new(&parse(start)?, &parse(end)?))
    }

    pub fn start(&self) -> &NaiveDate {
        &self.start
    }

    pub fn end(&self) -> &NaiveDate {
        &self.end
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|day| day <= &self.end)
            .collect()
    }
}

impl std::fmt::Display for ReportWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

///
/// Generates summaries by walking the bucket grid of a window in
/// order, one bucket at a time
///
pub struct ReportGenerator<'a> {
    source: &'a dyn JobRecordSource,
    inventory: &'a dyn NodeInventory,
    cache: &'a ResultCache,
    config: &'a ReportConfig,
}

impl<'a> ReportGenerator<'a> {
    pub fn new(
        source: &'a dyn JobRecordSource,
        inventory: &'a dyn NodeInventory,
        cache: &'a ResultCache,
        config: &'a ReportConfig,
    ) -> Self {
        Self {
            source,
            inventory,
            cache,
            config,
        }
    }

    ///
    /// Summarise `window` at the granularity of `profile`. Only an
    /// invalid profile is an error; buckets that cannot be computed
    /// are reported as unavailable in the summary.
    ///
    pub fn generate(
        &self,
        window: &ReportWindow,
        profile: &GranularityProfile,
        now: &NaiveDateTime,
    ) -> Result<Summary, Error> {
        let grid = build_grid(&window.days(), profile)?;

        tracing::info!("Generating report for {} over {} buckets", window, grid.len());

        let aggregator = BucketAggregator::new(self.source, self.cache, self.config, now);

        let outcomes: Vec<_> = grid
            .iter()
            .enumerate()
            .map(|(i, bucket)| {
                tracing::debug!("Bucket {} of {}: {}", i + 1, grid.len(), bucket);
                aggregator.aggregate(bucket)
            })
            .collect();

        let summary =
            SummaryBuilder::new(self.inventory, self.config.league_table_size()).build(&outcomes);

        tracing::info!(
            "Report for {} complete: {} unique jobs, {} unavailable buckets",
            window,
            summary.jobs().len(),
            summary.unavailable().len()
        );

        Ok(summary)
    }

    /// Summarise the `period` ending on `end`
    pub fn generate_period(
        &self,
        period: ReportPeriod,
        end: &NaiveDate,
        now: &NaiveDateTime,
    ) -> Result<Summary, Error> {
        self.generate(
            &ReportWindow::ending(period, end),
            &self.config.profile(period),
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{datetime, job, FakeInventory, FakeSource};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
    }

    #[test]
    fn test_window() {
        let window = ReportWindow::ending(ReportPeriod::Weekly, &date("2024-03-07"));
        assert_eq!(window.start(), &date("2024-03-01"));
        assert_eq!(window.days().len(), 7);

        let window = ReportWindow::ending(ReportPeriod::Daily, &date("2024-03-07"));
        assert_eq!(window.days(), vec![date("2024-03-07")]);

        #[allow(clippy::unwrap_used)]
        let window = ReportWindow::parse("2024-03-10:2024-02-28").unwrap();
        assert_eq!(window.start(), &date("2024-02-28"));
        assert_eq!(window.days().len(), 12);
        assert_eq!(window.to_string(), "2024-02-28:2024-03-10");

        #[allow(clippy::unwrap_used)]
        let window = ReportWindow::parse("2024-03-10").unwrap();
        assert_eq!(window.days().len(), 1);

        assert!(ReportWindow::parse("last_week").is_err());
        assert!(ReportWindow::parse("2024-13-01").is_err());
    }

    #[test]
    fn test_generate() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let config = ReportConfig::default().with_league_table_size(1);

        let source = FakeSource::new().with_running(vec![
            job("1", "alice", "defq", 4, &["node01"], "1Gc"),
            job("2", "bob", "short", 8, &["node02"], "1Gc"),
        ]);
        let inventory = FakeInventory::new(&[("node01", 8), ("node02", 8)]);

        let generator = ReportGenerator::new(&source, &inventory, &cache, &config);
        let now = datetime("2024-04-01T00:00:00");

        #[allow(clippy::unwrap_used)]
        let summary = generator
            .generate_period(ReportPeriod::Daily, &date("2024-03-01"), &now)
            .unwrap();

        assert_eq!(summary.buckets(), 24 * 6);
        assert_eq!(summary.start(), Some(&datetime("2024-03-01T00:00:00")));
        assert_eq!(summary.end(), Some(&datetime("2024-03-01T23:59:59")));
        assert_eq!(summary.jobs().len(), 2);
        assert_eq!(summary.utilisation().percent_median(), 75.0);
        assert_eq!(summary.league_tables()[0].entries().len(), 1);

        // the second run is served from the cache
        let calls = source.calls();

        #[allow(clippy::unwrap_used)]
        let again = generator
            .generate_period(ReportPeriod::Daily, &date("2024-03-01"), &now)
            .unwrap();
        assert_eq!(source.calls(), calls);
        assert_eq!(again, summary);
    }

    #[test]
    fn test_invalid_profile() {
        #[allow(clippy::unwrap_used)]
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let config = ReportConfig::default();
        let source = FakeSource::new();
        let inventory = FakeInventory::new(&[]);

        let generator = ReportGenerator::new(&source, &inventory, &cache, &config);
        let profile = GranularityProfile::new(vec![("25".into(), "25".into())], vec![]);

        let result = generator.generate(
            &ReportWindow::new(&date("2024-03-01"), &date("2024-03-01")),
            &profile,
            &datetime("2024-04-01T00:00:00"),
        );
        assert!(result.is_err());
    }
}
