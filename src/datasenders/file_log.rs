/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{DataSender, LineBatch, SendFailure};
use crate::checkpoint::{CheckpointClient, CheckpointStorage, ComponentKind};
use async_trait::async_trait;
use std::{io, path::PathBuf, sync::Arc};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::{debug, info};

const OFFSET_KEY: &str = "offset";

/// Lines written between two checkpoints while load is running.
const CHECKPOINT_EVERY: u64 = 10_000;

/// Appends synthetic log lines to a file which the pipeline tails with its `filelog` receiver.
///
/// When given checkpoint storage the writer persists the sequence number of the last line it
/// flushed, every `CHECKPOINT_EVERY` lines and on flush. A writer restarted mid-scenario appends to
/// the existing file instead of truncating it and carries on numbering where it stopped.
pub struct FileLogWriter {
    name: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    sequence: u64,
    pending: Option<LineBatch>,
    storage: Option<Arc<dyn CheckpointStorage>>,
    checkpoint: Option<Box<dyn CheckpointClient>>,
    checkpointed: u64,
}
impl FileLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            name: "filelog".to_string(),
            path: path.into(),
            writer: None,
            sequence: 0,
            pending: None,
            storage: None,
            checkpoint: None,
            checkpointed: 0,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_checkpoint_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Number of lines written so far, including lines from before a restart.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Removes the log left behind by an earlier run, so the pipeline only ever reads lines
    /// written during the current one. Must happen before the pipeline starts tailing the file.
    pub fn discard_previous_log(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    async fn restore_sequence(&mut self) -> Result<u64, SendFailure> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };

        let client = storage
            .client(ComponentKind::Sender, &self.name)
            .await
            .map_err(|err| SendFailure::Fatal(format!("{err:#}")))?;
        let offset = client
            .get(OFFSET_KEY)
            .await
            .map_err(|err| SendFailure::Transient(format!("{err:#}")))?;
        self.checkpoint = Some(client);

        match offset {
            None => Ok(0),
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse::<u64>()
                .map_err(|err| SendFailure::Fatal(format!("corrupt checkpoint offset: {err}"))),
        }
    }

    /// Flushes the file and records how far it got. Idempotent, so an interrupted call can simply
    /// be repeated.
    async fn save_checkpoint(&mut self) -> Result<(), SendFailure> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
            writer.get_ref().sync_data().await?;
        }

        if let Some(checkpoint) = &self.checkpoint {
            checkpoint
                .set(OFFSET_KEY, self.sequence.to_string().as_bytes())
                .await
                .map_err(|err| SendFailure::Transient(format!("{err:#}")))?;
            self.checkpointed = self.sequence;
            debug!("Checkpointed {} at {}", self.name, self.sequence);
        }
        Ok(())
    }
}

#[async_trait]
impl DataSender for FileLogWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn receiver_config_fragment(&self) -> String {
        format!(
            "filelog:\n  include: [ \"{}\" ]\n  start_at: beginning\n  operators:\n    - type: json_parser\n",
            self.path.display()
        )
    }

    async fn start(&mut self) -> Result<(), SendFailure> {
        self.sequence = self.restore_sequence().await?;
        self.checkpointed = self.sequence;

        let resuming = self.checkpoint.is_some();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(&self.path)
            .await?;
        self.writer = Some(BufWriter::new(file));

        info!(
            "Writing logs to {} starting at sequence {}",
            self.path.display(),
            self.sequence
        );
        Ok(())
    }

    async fn send(&mut self, count: u64) -> Result<(), SendFailure> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SendFailure::Fatal("file log writer was not started".to_string()))?;

        let batch = self.pending.get_or_insert_with(|| {
            let batch = LineBatch::encode(self.sequence, count);
            self.sequence += count;
            batch
        });
        batch.write_to(writer).await?;

        // the batch stays pending until the checkpoint is saved, so a retry cannot encode it twice
        if self.checkpoint.is_some() && self.sequence - self.checkpointed >= CHECKPOINT_EVERY {
            self.save_checkpoint().await?;
        }
        self.pending = None;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SendFailure> {
        self.save_checkpoint().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::memory::MemoryStorage;
    use std::time::Duration;

    fn temp_log_path() -> PathBuf {
        std::env::temp_dir().join(format!("testbed-{}.log", nanoid::nanoid!(8)))
    }

    #[tokio::test]
    async fn writes_one_line_per_item() -> anyhow::Result<()> {
        let path = temp_log_path();
        let mut writer = FileLogWriter::new(&path);

        writer.start().await?;
        writer.send(25).await?;
        writer.flush().await?;

        let contents = tokio::fs::read_to_string(&path).await?;
        assert_eq!(contents.lines().count(), 25);
        assert!(contents
            .lines()
            .last()
            .is_some_and(|line| line.contains("Counter #24")));

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn send_before_start_is_fatal() {
        let mut writer = FileLogWriter::new(temp_log_path());
        let res = writer.send(1).await;
        assert!(res.is_err_and(|failure| failure.is_fatal()));
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_after_restart() -> anyhow::Result<()> {
        let path = temp_log_path();
        let storage: Arc<dyn CheckpointStorage> = Arc::new(MemoryStorage::new());

        let mut writer = FileLogWriter::new(&path).with_checkpoint_storage(storage.clone());
        writer.start().await?;
        writer.send(10).await?;
        writer.flush().await?;
        drop(writer);

        let mut restarted = FileLogWriter::new(&path).with_checkpoint_storage(storage);
        restarted.start().await?;
        assert_eq!(restarted.sequence(), 10);
        restarted.send(5).await?;
        restarted.flush().await?;

        let contents = tokio::fs::read_to_string(&path).await?;
        assert_eq!(contents.lines().count(), 15);

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn checkpoints_while_load_is_running() -> anyhow::Result<()> {
        let path = temp_log_path();
        let storage: Arc<dyn CheckpointStorage> = Arc::new(MemoryStorage::new());
        let client = storage.client(ComponentKind::Sender, "filelog").await?;

        let mut writer = FileLogWriter::new(&path).with_checkpoint_storage(storage.clone());
        writer.start().await?;
        writer.send(6_000).await?;
        assert_eq!(client.get(OFFSET_KEY).await?, None);

        writer.send(6_000).await?;
        assert_eq!(client.get(OFFSET_KEY).await?, Some(b"12000".to_vec()));

        // everything up to the checkpoint is on disk, so a crash here resumes cleanly
        let contents = tokio::fs::read_to_string(&path).await?;
        assert_eq!(contents.lines().count(), 12_000);

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_sends_write_each_line_once() -> anyhow::Result<()> {
        let path = temp_log_path();
        let mut writer = FileLogWriter::new(&path);
        writer.start().await?;

        // give every attempt a single poll, then retry the same batch as the load generator does
        let mut attempts = 0;
        while tokio::time::timeout(Duration::ZERO, writer.send(2_000))
            .await
            .is_err()
        {
            attempts += 1;
            assert!(attempts < 100_000, "send never completed");
            tokio::task::yield_now().await;
        }
        writer.flush().await?;

        let contents = tokio::fs::read_to_string(&path).await?;
        let sequences = contents
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line)?;
                Ok(value["attributes"]["sequence"].as_u64().unwrap_or(u64::MAX))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        assert!(sequences.into_iter().eq(0..2_000));
        assert_eq!(writer.sequence(), 2_000);

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    #[test]
    fn discarding_a_missing_log_is_fine() -> anyhow::Result<()> {
        let path = temp_log_path();
        std::fs::write(&path, "stale\n")?;

        let writer = FileLogWriter::new(&path);
        writer.discard_previous_log()?;
        assert!(!path.exists());
        writer.discard_previous_log()?;
        Ok(())
    }

    #[test]
    fn fragment_points_filelog_receiver_at_the_file() {
        let writer = FileLogWriter::new("/tmp/load.log");
        let fragment = writer.receiver_config_fragment();
        assert!(fragment.starts_with("filelog:\n"));
        assert!(fragment.contains("\"/tmp/load.log\""));
    }
}
