// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use anyhow::Context;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::Error;

///
/// The length of a report, and so which granularity profile and how
/// many days it covers
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl ReportPeriod {
    pub fn parse(period: &str) -> Result<Self, Error> {
        match period.trim().to_lowercase().as_str() {
            "day" | "daily" => Ok(ReportPeriod::Daily),
            "week" | "weekly" => Ok(ReportPeriod::Weekly),
            "month" | "monthly" => Ok(ReportPeriod::Monthly),
            "year" | "yearly" => Ok(ReportPeriod::Yearly),
            _ => Err(Error::Parse(format!(
                "Invalid report period '{}' - must be daily, weekly, monthly or yearly",
                period
            ))),
        }
    }

    pub fn days(&self) -> u32 {
        match self {
            ReportPeriod::Daily => 1,
            ReportPeriod::Weekly => 7,
            ReportPeriod::Monthly => 30,
            ReportPeriod::Yearly => 365,
        }
    }

    /// The granularity used for this period unless configured otherwise
    pub fn default_profile(&self) -> GranularityProfile {
        match self {
            ReportPeriod::Daily => GranularityProfile::new(hourly(), minute_slots(10)),
            ReportPeriod::Weekly => GranularityProfile::new(hourly(), minute_slots(20)),
            ReportPeriod::Monthly => GranularityProfile::new(hourly(), minute_slots(60)),
            ReportPeriod::Yearly => GranularityProfile::new(
                vec![("00".to_string(), "23".to_string())],
                minute_slots(60),
            ),
        }
    }
}

impl std::fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportPeriod::Daily => write!(f, "daily"),
            ReportPeriod::Weekly => write!(f, "weekly"),
            ReportPeriod::Monthly => write!(f, "monthly"),
            ReportPeriod::Yearly => write!(f, "yearly"),
        }
    }
}

fn hourly() -> Vec<(String, String)> {
    (0..24)
        .map(|h| (format!("{:02}", h), format!("{:02}", h)))
        .collect()
}

fn minute_slots(width: u32) -> Vec<(String, String)> {
    (0..60)
        .step_by(width as usize)
        .map(|m| (format!("{:02}:00", m), format!("{:02}:59", m + width - 1)))
        .collect()
}

///
/// One sampling slot within a day: an hour range combined with a
/// minute range, e.g. hours 09..09 and minutes 10:00..19:59 is the
/// slot 09:10:00 to 09:19:59
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    hour_label: String,
    minute_label: String,
    start: NaiveTime,
    end: NaiveTime,
}

impl Slot {
    pub fn hour_label(&self) -> &str {
        &self.hour_label
    }

    pub fn minute_label(&self) -> &str {
        &self.minute_label
    }

    pub fn start(&self) -> &NaiveTime {
        &self.start
    }

    pub fn end(&self) -> &NaiveTime {
        &self.end
    }
}

fn parse_hour(hour: &str) -> Result<u32, Error> {
    let value = hour
        .trim()
        .parse::<u32>()
        .with_context(|| format!("Invalid hour '{}'", hour))?;

    match value < 24 {
        true => Ok(value),
        false => Err(Error::Parse(format!("Invalid hour '{}'", hour))),
    }
}

fn parse_minute(minute: &str) -> Result<(u32, u32), Error> {
    let (m, s) = minute
        .trim()
        .split_once(':')
        .ok_or_else(|| Error::Parse(format!("Invalid minute '{}' - expected MM:SS", minute)))?;

    let m = m
        .parse::<u32>()
        .with_context(|| format!("Invalid minute '{}'", minute))?;
    let s = s
        .parse::<u32>()
        .with_context(|| format!("Invalid minute '{}'", minute))?;

    match m < 60 && s < 60 {
        true => Ok((m, s)),
        false => Err(Error::Parse(format!("Invalid minute '{}'", minute))),
    }
}

fn time(hour: u32, (minute, second): (u32, u32)) -> Result<NaiveTime, Error> {
    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(|| {
        Error::Parse(format!(
            "Invalid time {:02}:{:02}:{:02}",
            hour, minute, second
        ))
    })
}

///
/// The grid of sampling slots used for every day of a report. The
/// hour and minute ranges are supplied as `("HH", "HH")` and
/// `("MM:SS", "MM:SS")` string pairs; every hour range is combined
/// with every minute range.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranularityProfile {
    hours: Vec<(String, String)>,
    minutes: Vec<(String, String)>,
}

impl GranularityProfile {
    pub fn new(hours: Vec<(String, String)>, minutes: Vec<(String, String)>) -> Self {
        Self { hours, minutes }
    }

    pub fn hours(&self) -> &[(String, String)] {
        &self.hours
    }

    pub fn minutes(&self) -> &[(String, String)] {
        &self.minutes
    }

    /// The slots of one day, in hour then minute order
    pub fn slots(&self) -> Result<Vec<Slot>, Error> {
        if self.hours.is_empty() || self.minutes.is_empty() {
            return Err(Error::InvalidConfig(
                "A granularity profile needs at least one hour and one minute range".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(self.hours.len() * self.minutes.len());

        for (hour_start, hour_end) in &self.hours {
            let hs = parse_hour(hour_start)?;
            let he = parse_hour(hour_end)?;

            for (minute_start, minute_end) in &self.minutes {
                let start = time(hs, parse_minute(minute_start)?)?;
                let end = time(he, parse_minute(minute_end)?)?;

                if end < start {
                    return Err(Error::InvalidConfig(format!(
                        "Slot {}:{} to {}:{} ends before it starts",
                        hour_start, minute_start, hour_end, minute_end
                    )));
                }

                slots.push(Slot {
                    hour_label: format!("{}-{}", hour_start, hour_end),
                    minute_label: format!("{}-{}", minute_start, minute_end),
                    start,
                    end,
                });
            }
        }

        Ok(slots)
    }
}
