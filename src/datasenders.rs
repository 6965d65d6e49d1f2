/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod file_log;
pub mod loopback;
pub mod tcp_lines;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendFailure {
    /// Worth retrying, e.g. a refused connection while the pipeline is still binding its ports.
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help.
    #[error("{0}")]
    Fatal(String),
}
impl SendFailure {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SendFailure::Fatal(_))
    }
}
impl From<std::io::Error> for SendFailure {
    fn from(err: std::io::Error) -> Self {
        SendFailure::Transient(err.to_string())
    }
}

/// Produces synthetic telemetry against the pipeline under test.
///
/// A sender owns its own connection lifecycle. Failures are transient unless they are explicitly
/// returned as `SendFailure::Fatal`.
#[async_trait]
pub trait DataSender: Send {
    fn name(&self) -> &str;

    /// The pipeline signal this sender produces, used as the pipeline id in the rendered config.
    fn pipeline_type(&self) -> &'static str {
        "logs"
    }

    /// The receiver section the pipeline needs in order to accept this sender's data.
    fn receiver_config_fragment(&self) -> String;

    async fn start(&mut self) -> Result<(), SendFailure>;

    /// Sends `count` items. Cancel safe: if the returned future is dropped before it completes,
    /// the next call finishes the interrupted batch instead of starting a new one, so a retried
    /// send never delivers an item twice.
    async fn send(&mut self, count: u64) -> Result<(), SendFailure>;

    async fn flush(&mut self) -> Result<(), SendFailure>;
}

/// Builds the synthetic log record with the given sequence number as a single JSON line.
pub fn log_record(sequence: u64) -> String {
    json!({
        "ts": Utc::now().to_rfc3339(),
        "severity": "INFO",
        "body": format!("Load Generator Counter #{sequence}"),
        "attributes": {
            "load_generator": "testbed",
            "item_index": sequence % 10,
            "sequence": sequence,
        }
    })
    .to_string()
}

/// A batch of encoded log lines on its way out.
///
/// Progress is tracked here rather than in the future doing the writing, so a write that is
/// dropped part way picks up at the first byte that was not accepted.
#[derive(Debug)]
pub(crate) struct LineBatch {
    buf: Vec<u8>,
    written: usize,
}
impl LineBatch {
    /// Encodes `count` records numbered from `first`.
    pub(crate) fn encode(first: u64, count: u64) -> Self {
        let mut buf = Vec::new();
        for sequence in first..first + count {
            buf.extend_from_slice(log_record(sequence).as_bytes());
            buf.push(b'\n');
        }
        Self { buf, written: 0 }
    }

    /// Writes whatever is left of the batch.
    pub(crate) async fn write_to<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while self.written < self.buf.len() {
            let n = writer.write(&self.buf[self.written..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.written += n;
        }
        Ok(())
    }

    /// Moves back to the start of a line that was only partly written, for when the rest of the
    /// batch goes out on a new connection.
    pub(crate) fn rewind_partial_line(&mut self) {
        self.written = self.buf[..self.written]
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |newline| newline + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_records_are_single_json_lines() -> anyhow::Result<()> {
        let line = log_record(42);
        assert!(!line.contains('\n'));

        let value: serde_json::Value = serde_json::from_str(&line)?;
        assert_eq!(value["body"], "Load Generator Counter #42");
        assert_eq!(value["attributes"]["item_index"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_batch_resumes_where_it_stopped() -> anyhow::Result<()> {
        let mut batch = LineBatch::encode(0, 3);
        let expected = batch.buf.clone();

        // the first 10 bytes were accepted before the previous attempt was dropped
        let mut out = expected[..10].to_vec();
        batch.written = 10;
        batch.write_to(&mut out).await?;

        assert_eq!(out, expected);
        assert_eq!(String::from_utf8(out)?.lines().count(), 3);
        Ok(())
    }

    #[test]
    fn rewinds_to_the_start_of_a_partial_line() {
        let mut batch = LineBatch::encode(0, 2);
        let first_line = batch.buf.iter().position(|byte| *byte == b'\n').unwrap_or(0) + 1;

        batch.written = first_line + 5;
        batch.rewind_partial_line();
        assert_eq!(batch.written, first_line);

        batch.written = 3;
        batch.rewind_partial_line();
        assert_eq!(batch.written, 0);
    }

    #[test]
    fn io_errors_are_transient() {
        let failure = SendFailure::from(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        ));
        assert!(!failure.is_fatal());
    }
}
