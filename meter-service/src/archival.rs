//! Moves aged hourly aggregates out of the durable store into CSV files.
//!
//! A batch is deleted only after its file has been flushed and renamed into
//! place, so a crash mid-run leaves the rows in the store and at worst a
//! `.partial` file behind.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use meter_client::domain::{datetime_from_millis, HourlyAggregate};
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;

use crate::{
    clock::Clock,
    config::ArchivalConfig,
    persistence::{AggregateRepository, RepositoryError},
};

const DAY_MS: i64 = 86_400_000;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("archive task failed: {0}")]
    Task(String),
}

#[derive(Debug, Serialize)]
struct ArchiveRow<'a> {
    meter_id: &'a str,
    hour_start: String,
    sample_count: i64,
    channel: &'a str,
    power_avg: Option<f64>,
    power_min: Option<f64>,
    power_max: Option<f64>,
    voltage_avg: Option<f64>,
    current_avg: Option<f64>,
    energy_wh: Option<f64>,
    samples: Option<u32>,
}

/// One row per meter, hour and channel. Aggregates without channels keep a
/// single row with an empty channel so the hour is not lost.
fn write_csv(path: &Path, rows: &[HourlyAggregate]) -> Result<(), ArchiveError> {
    let mut wtr = csv::Writer::from_path(path)?;
    for agg in rows {
        let hour_start = agg
            .hour_start
            .format(&Rfc3339)
            .map_err(|e| ArchiveError::Task(format!("format hour_start: {e}")))?;

        if agg.channels.is_empty() {
            wtr.serialize(ArchiveRow {
                meter_id: &agg.meter_id,
                hour_start: hour_start.clone(),
                sample_count: agg.sample_count,
                channel: "",
                power_avg: None,
                power_min: None,
                power_max: None,
                voltage_avg: None,
                current_avg: None,
                energy_wh: None,
                samples: None,
            })?;
        }
        for (channel, stats) in &agg.channels {
            wtr.serialize(ArchiveRow {
                meter_id: &agg.meter_id,
                hour_start: hour_start.clone(),
                sample_count: agg.sample_count,
                channel: channel.as_str(),
                power_avg: Some(stats.power_avg),
                power_min: Some(stats.power_min),
                power_max: Some(stats.power_max),
                voltage_avg: stats.voltage_avg,
                current_avg: stats.current_avg,
                energy_wh: Some(stats.energy_wh),
                samples: Some(stats.samples),
            })?;
        }
    }
    wtr.flush()?;
    let file = wtr.into_inner().map_err(|e| ArchiveError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

fn archive_file_name(at: OffsetDateTime, seq: usize) -> String {
    format!(
        "hourly_aggregates_{:04}{:02}{:02}T{:02}{:02}{:02}{:03}Z_{seq:03}.csv",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.millisecond(),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveRun {
    pub files: Vec<PathBuf>,
    pub aggregates_exported: usize,
    pub aggregates_deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    pub archive_files: usize,
    pub total_bytes: u64,
    pub last_run_rows: Option<usize>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    pub eligible_aggregates: i64,
}

pub struct ArchivalJob {
    repo: Arc<dyn AggregateRepository>,
    clock: Arc<dyn Clock>,
    config: ArchivalConfig,
    last_run: Mutex<Option<(OffsetDateTime, usize)>>,
}

impl ArchivalJob {
    pub fn new(repo: Arc<dyn AggregateRepository>, clock: Arc<dyn Clock>, config: ArchivalConfig) -> Self {
        Self {
            repo,
            clock,
            config,
            last_run: Mutex::new(None),
        }
    }

    fn cutoff(&self) -> OffsetDateTime {
        datetime_from_millis(self.clock.now_ms() - i64::from(self.config.retention_days) * DAY_MS)
    }

    /// Archive everything older than the retention window, one file per batch.
    pub async fn run_once(&self) -> Result<ArchiveRun, ArchiveError> {
        let started = self.clock.now();
        let cutoff = self.cutoff();
        let batch_size = self.config.batch_size.max(1);
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let mut run = ArchiveRun::default();
        loop {
            let batch = self.repo.older_than(cutoff, batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let name = archive_file_name(started, run.files.len());
            let path = self.config.output_dir.join(&name);
            let partial = self.config.output_dir.join(format!("{name}.partial"));

            let rows = Arc::new(batch);
            {
                let rows = rows.clone();
                let partial = partial.clone();
                tokio::task::spawn_blocking(move || write_csv(&partial, &rows))
                    .await
                    .map_err(|e| ArchiveError::Task(e.to_string()))??;
            }
            tokio::fs::rename(&partial, &path).await?;

            let keys: Vec<(String, OffsetDateTime)> = rows.iter().map(|a| (a.meter_id.clone(), a.hour_start)).collect();
            let deleted = self.repo.delete(&keys).await?;

            tracing::info!(file = %path.display(), aggregates = rows.len(), deleted, "archived hourly aggregates");
            metrics::counter!("aggregates_archived_total").increment(rows.len() as u64);

            run.aggregates_exported += rows.len();
            run.aggregates_deleted += deleted;
            run.files.push(path);

            if (rows.len() as i64) < batch_size {
                break;
            }
        }

        *self.last_run.lock().await = Some((started, run.aggregates_exported));
        Ok(run)
    }

    pub async fn stats(&self) -> Result<ArchiveStats, ArchiveError> {
        let mut archive_files = 0;
        let mut total_bytes = 0;

        match tokio::fs::read_dir(&self.config.output_dir).await {
            Ok(mut dir) => {
                while let Some(entry) = dir.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("csv") {
                        archive_files += 1;
                        total_bytes += entry.metadata().await?.len();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let last = *self.last_run.lock().await;
        Ok(ArchiveStats {
            archive_files,
            total_bytes,
            last_run_rows: last.map(|(_, rows)| rows),
            last_run_at: last.map(|(at, _)| at),
            eligible_aggregates: self.repo.count_older_than(self.cutoff()).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, persistence::InMemoryAggregateRepository};
    use meter_client::domain::{Channel, ChannelStats, HOUR_MS};
    use std::collections::BTreeMap;

    const NOW: i64 = 1_704_067_200_000 + 40 * DAY_MS;

    fn agg(meter_id: &str, hour_ms: i64) -> HourlyAggregate {
        let mut channels = BTreeMap::new();
        channels.insert(
            Channel::Export,
            ChannelStats {
                power_avg: 10.0,
                power_min: 5.0,
                power_max: 15.0,
                voltage_avg: Some(230.0),
                current_avg: None,
                energy_wh: 12.0,
                samples: 3,
            },
        );
        channels.insert(
            Channel::Import,
            ChannelStats {
                power_avg: 1.0,
                power_min: 1.0,
                power_max: 1.0,
                voltage_avg: None,
                current_avg: None,
                energy_wh: 0.5,
                samples: 3,
            },
        );
        HourlyAggregate {
            meter_id: meter_id.to_string(),
            hour_start: datetime_from_millis(hour_ms),
            sample_count: 3,
            channels,
        }
    }

    fn job(dir: &Path, repo: Arc<InMemoryAggregateRepository>, batch_size: i64) -> ArchivalJob {
        let config = ArchivalConfig {
            enabled: true,
            interval_hours: 24,
            retention_days: 30,
            output_dir: dir.to_path_buf(),
            batch_size,
        };
        ArchivalJob::new(repo, Arc::new(ManualClock::new(NOW)), config)
    }

    #[tokio::test]
    async fn archives_only_aggregates_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryAggregateRepository::new());
        let old = NOW - 35 * DAY_MS;
        let recent = NOW - 2 * DAY_MS;
        repo.upsert(&[agg("m-1", old), agg("m-2", old + HOUR_MS), agg("m-1", recent)])
            .await
            .unwrap();

        let job = job(dir.path(), repo.clone(), 1000);
        assert_eq!(job.stats().await.unwrap().eligible_aggregates, 2);

        let run = job.run_once().await.unwrap();
        assert_eq!(run.aggregates_exported, 2);
        assert_eq!(run.aggregates_deleted, 2);
        assert_eq!(run.files.len(), 1);

        let remaining = repo.all().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].hour_start, datetime_from_millis(recent));

        let mut rdr = csv::Reader::from_path(&run.files[0]).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(&headers[0], "meter_id");
        assert_eq!(&headers[3], "channel");
        let records: Vec<csv::StringRecord> = rdr.records().map(Result::unwrap).collect();
        // Two aggregates with two channels each.
        assert_eq!(records.len(), 4);
        assert_eq!(&records[0][3], "export");

        let stats = job.stats().await.unwrap();
        assert_eq!(stats.archive_files, 1);
        assert!(stats.total_bytes > 0);
        assert_eq!(stats.last_run_rows, Some(2));
        assert_eq!(stats.eligible_aggregates, 0);
    }

    #[tokio::test]
    async fn large_backlog_is_split_into_batches() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryAggregateRepository::new());
        let base = NOW - 60 * DAY_MS;
        let rows: Vec<HourlyAggregate> = (0..5).map(|h| agg("m-1", base + h * HOUR_MS)).collect();
        repo.upsert(&rows).await.unwrap();

        let run = job(dir.path(), repo.clone(), 2).run_once().await.unwrap();
        assert_eq!(run.files.len(), 3);
        assert_eq!(run.aggregates_exported, 5);
        assert!(repo.all().await.is_empty());
    }

    #[tokio::test]
    async fn stats_on_missing_directory_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryAggregateRepository::new());
        let job = job(&dir.path().join("never-created"), repo, 10);
        let stats = job.stats().await.unwrap();
        assert_eq!(stats.archive_files, 0);
        assert_eq!(stats.last_run_at, None);
    }
}
