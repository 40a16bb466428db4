//! JSON-lines persistence sink used by the command line tool.
//!
//! Every line is one JSON object: an `activity_started` header, one
//! `sample` line per routed sample, and an `activity_ended` trailer.

use crate::recording::types::{ActivityId, RoutedSample, SamplePersistence};
use crate::sensors::types::Sport;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line<'a> {
    ActivityStarted {
        activity: ActivityId,
        sport: Sport,
        started_at: DateTime<Utc>,
    },
    Sample {
        activity: ActivityId,
        sample: &'a RoutedSample,
    },
    ActivityEnded {
        activity: ActivityId,
        ended_at: DateTime<Utc>,
    },
}

/// Appends activities to a JSON-lines file.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: &Line<'_>) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl SamplePersistence for JsonLinesSink {
    fn begin_activity(
        &mut self,
        sport: Sport,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<ActivityId> {
        let activity = uuid::Uuid::new_v4();
        self.write_line(&Line::ActivityStarted {
            activity,
            sport,
            started_at,
        })?;
        self.writer.flush()?;
        Ok(activity)
    }

    fn persist(&mut self, activity: ActivityId, sample: &RoutedSample) -> anyhow::Result<()> {
        self.write_line(&Line::Sample { activity, sample })
    }

    fn end_activity(&mut self, activity: ActivityId) -> anyhow::Result<()> {
        self.write_line(&Line::ActivityEnded {
            activity,
            ended_at: Utc::now(),
        })?;
        self.writer.flush()?;
        Ok(())
    }
}
