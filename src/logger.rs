//! Rank-correlated logging.
//!
//! Every record is decorated with the full [`RankContext`] so that shards
//! written by different tasks can be merged into a single timeline
//! afterwards (see [`crate::timeline`]). Two sinks are always attached:
//!
//! - the console, shared and interleaved between all tasks of the job;
//! - a per-task shard `{logs_dir}/{job_id}-{job_name}-{world_rank:04}.log`.
//!
//! No level filtering happens here; everything from TRACE up is written.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::dispatcher::{self, DefaultGuard, Dispatch};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, TestWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;

use crate::error::{Error, Result};
use crate::rank::RankContext;

/// Sortable UTC timestamp written at the start of every record.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Where the shared console stream goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleSink {
    /// Process stdout
    #[default]
    Stdout,
    /// libtest's captured output
    Captured,
}

impl ConsoleSink {
    fn make_writer(self) -> BoxMakeWriter {
        match self {
            ConsoleSink::Stdout => BoxMakeWriter::new(std::io::stdout),
            ConsoleSink::Captured => BoxMakeWriter::new(TestWriter::new()),
        }
    }
}

/// Event formatter that prefixes each record with the task identity.
///
/// `2026-10-16T09:30:00.123456Z | 001:004 | 001:002 | 12345 | job |       INFO | message`
#[derive(Debug, Clone)]
pub struct RankFormat {
    ctx: Arc<RankContext>,
}

impl RankFormat {
    /// Decorate records with `ctx`.
    pub fn new(ctx: Arc<RankContext>) -> Self {
        RankFormat { ctx }
    }
}

impl<S, N> FormatEvent<S, N> for RankFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} | {} | {:>10} | ",
            Utc::now().format(TIMESTAMP_FORMAT),
            self.ctx,
            event.metadata().level().as_str()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// A logger bound to one task of the job.
pub struct CorrelatedLogger {
    channel: String,
    shard_path: PathBuf,
    shard: Arc<File>,
    dispatch: Dispatch,
}

impl fmt::Debug for CorrelatedLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelatedLogger")
            .field("channel", &self.channel)
            .field("shard_path", &self.shard_path)
            .finish_non_exhaustive()
    }
}

impl CorrelatedLogger {
    /// Open the shard under `logs_dir` and build the two-sink subscriber.
    ///
    /// `logs_dir` must already exist. Failing to open the shard is fatal:
    /// the task would otherwise run without a durable record.
    pub fn open(ctx: &RankContext, logs_dir: &Path, console: ConsoleSink) -> Result<Self> {
        let channel = ctx.channel();
        let shard_path = logs_dir.join(format!("{channel}.log"));
        let shard = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&shard_path)
            .map_err(|source| Error::log_sink(&shard_path, source))?;
        let shard = Arc::new(shard);
        let format = RankFormat::new(Arc::new(ctx.clone()));

        let console_layer = tracing_subscriber::fmt::layer()
            .event_format(format.clone())
            .with_ansi(false)
            .with_writer(console.make_writer());
        let shard_layer = tracing_subscriber::fmt::layer()
            .event_format(format)
            .with_ansi(false)
            .with_writer(Arc::clone(&shard));

        let subscriber = tracing_subscriber::registry()
            .with(LevelFilter::TRACE)
            .with(console_layer)
            .with(shard_layer);

        Ok(CorrelatedLogger {
            channel,
            shard_path,
            shard,
            dispatch: Dispatch::new(subscriber),
        })
    }

    /// `{job_id}-{job_name}-{world_rank:04}`.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Path of this task's shard.
    pub fn shard_path(&self) -> &Path {
        &self.shard_path
    }

    /// Route `tracing` events from the current thread to this logger until
    /// the guard is dropped.
    pub fn enter(&self) -> DefaultGuard {
        dispatcher::set_default(&self.dispatch)
    }

    /// Force the shard to stable storage.
    pub fn flush(&self) -> Result<()> {
        let sync = || -> std::io::Result<()> {
            let mut shard = self.shard.as_ref();
            shard.flush()?;
            shard.sync_data()
        };
        sync().map_err(|source| Error::log_sink(&self.shard_path, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tracing::{debug, info, trace, warn};

    fn ctx() -> RankContext {
        RankContext {
            job_id: "4242".into(),
            job_name: "shard".into(),
            local_rank: 1,
            local_size: 2,
            world_rank: 5,
            world_size: 8,
        }
    }

    #[test]
    fn shard_is_named_from_identity() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CorrelatedLogger::open(&ctx(), dir.path(), ConsoleSink::Captured).unwrap();
        assert_eq!(logger.channel(), "4242-shard-0005");
        assert_eq!(logger.shard_path(), dir.path().join("4242-shard-0005.log"));
        assert!(logger.shard_path().exists());
    }

    #[test]
    fn records_carry_full_identity_at_every_level() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CorrelatedLogger::open(&ctx(), dir.path(), ConsoleSink::Captured).unwrap();
        {
            let _guard = logger.enter();
            trace!("lowest");
            debug!("Starting...");
            info!(step = 2, "probe done");
            warn!("odd");
        }
        logger.flush().unwrap();

        let text = fs::read_to_string(logger.shard_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in &lines {
            assert!(line.contains(" | 005:008 | 001:002 | 4242 | shard | "), "{line}");
        }
        assert!(lines[0].ends_with("|      TRACE | lowest"));
        assert!(lines[1].ends_with("|      DEBUG | Starting..."));
        assert!(lines[2].ends_with("|       INFO | probe done step=2"));
        assert!(lines[3].ends_with("|       WARN | odd"));
    }

    #[test]
    fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        for msg in ["first", "second"] {
            let logger =
                CorrelatedLogger::open(&ctx(), dir.path(), ConsoleSink::Captured).unwrap();
            let _guard = logger.enter();
            info!("{msg}");
        }
        let text = fs::read_to_string(dir.path().join("4242-shard-0005.log")).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().ends_with("first"));
    }

    #[test]
    fn missing_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = CorrelatedLogger::open(&ctx(), &dir.path().join("absent"), ConsoleSink::Captured)
            .unwrap_err();
        assert_eq!(err.kind(), "LogSink");
        assert!(err.is_preflight());
    }
}
