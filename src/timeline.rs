//! Merge per-task log shards into one job timeline.
//!
//! Shards are written independently by every task; since each record carries
//! a UTC timestamp and the full rank identity, sorting by
//! `(timestamp, world_rank)` reconstructs a global view of the run.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::logger::TIMESTAMP_FORMAT;

/// A line that does not follow the record layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("not a rank-correlated record: {0}")]
pub struct ParseLineError(String);

/// One parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// When the record was emitted
    pub timestamp: DateTime<Utc>,
    /// Task index in the job
    pub world_rank: usize,
    /// Number of tasks in the job
    pub world_size: usize,
    /// Task index on its node
    pub local_rank: usize,
    /// Number of tasks on that node
    pub local_size: usize,
    /// Scheduler job id
    pub job_id: String,
    /// Scheduler job name
    pub job_name: String,
    /// Severity as written
    pub level: String,
    /// Message and fields; continuation lines are joined with `\n`
    pub message: String,
}

/// Levels as the formatter writes them, right-aligned in this many columns.
const LEVEL_WIDTH: usize = 10;
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Split `job_name | level | message` at the padded level column, so the
/// separator may occur inside the job name as well as the message.
fn split_level(rest: &str) -> Option<(&str, &str, &str)> {
    rest.match_indices(" | ").find_map(|(at, sep)| {
        let (level, message) = rest[at + sep.len()..].split_once(" | ")?;
        let name = level.trim_start();
        let is_level = level.len() == LEVEL_WIDTH && LEVELS.contains(&name);
        is_level.then(|| (&rest[..at], name, message))
    })
}

fn pair(field: &str) -> Option<(usize, usize)> {
    let (rank, size) = field.split_once(':')?;
    Some((rank.parse().ok()?, size.parse().ok()?))
}

impl FromStr for LogLine {
    type Err = ParseLineError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let bad = || ParseLineError(line.to_string());
        let parts: Vec<&str> = line.splitn(5, " | ").collect();
        let [timestamp, world, local, job_id, rest] = parts[..] else {
            return Err(bad());
        };
        let (job_name, level, message) = split_level(rest).ok_or_else(bad)?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| bad())?
            .with_timezone(&Utc);
        let (world_rank, world_size) = pair(world).ok_or_else(bad)?;
        let (local_rank, local_size) = pair(local).ok_or_else(bad)?;
        Ok(LogLine {
            timestamp,
            world_rank,
            world_size,
            local_rank,
            local_size,
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            level: level.to_string(),
            message: message.to_string(),
        })
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {:03}:{:03} | {:03}:{:03} | {} | {} | {:>10} | {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.world_rank,
            self.world_size,
            self.local_rank,
            self.local_size,
            self.job_id,
            self.job_name,
            self.level,
            self.message
        )
    }
}

/// Parse one shard's text. Lines that are not records are appended to the
/// preceding record; leading ones are dropped.
pub fn parse_shard(text: &str) -> Vec<LogLine> {
    let mut records: Vec<LogLine> = Vec::new();
    for line in text.lines() {
        match line.parse::<LogLine>() {
            Ok(record) => records.push(record),
            Err(_) => {
                if let Some(last) = records.last_mut() {
                    last.message.push('\n');
                    last.message.push_str(line);
                }
            }
        }
    }
    records
}

/// Read every shard and order all records by `(timestamp, world_rank)`.
///
/// Records with equal keys keep their order within their shard.
pub fn merge<P: AsRef<Path>>(shards: &[P]) -> Result<Vec<LogLine>> {
    let mut records = Vec::new();
    for shard in shards {
        let path = shard.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::log_sink(path, source))?;
        records.extend(parse_shard(&text));
    }
    records.sort_by_key(|record| (record.timestamp, record.world_rank));
    Ok(records)
}
