/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{DataSender, LineBatch, SendFailure};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing::{debug, warn};

/// Streams newline-delimited JSON log records to the pipeline's `tcplog` receiver.
///
/// A broken connection is dropped and re-established on the next send, and the interrupted batch
/// carries on from the start of the line that was cut off. Lines the old connection had accepted
/// but not yet delivered are lost with it.
pub struct TcpLineSender {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    sequence: u64,
    pending: Option<LineBatch>,
}
impl TcpLineSender {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
            sequence: 0,
            pending: None,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&mut self) -> Result<(), SendFailure> {
        if self.stream.is_none() {
            debug!("Connecting to {}", self.endpoint());
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.set_nodelay(true)?;
            self.stream = Some(stream);
        }
        Ok(())
    }
}

#[async_trait]
impl DataSender for TcpLineSender {
    fn name(&self) -> &str {
        "tcplog"
    }

    fn receiver_config_fragment(&self) -> String {
        format!(
            "tcplog:\n  listen_address: \"{}\"\n  operators:\n    - type: json_parser\n",
            self.endpoint()
        )
    }

    async fn start(&mut self) -> Result<(), SendFailure> {
        self.connect().await
    }

    async fn send(&mut self, count: u64) -> Result<(), SendFailure> {
        if self.pending.is_none() {
            self.pending = Some(LineBatch::encode(self.sequence, count));
            self.sequence += count;
        }
        self.connect().await?;

        let (Some(stream), Some(batch)) = (self.stream.as_mut(), self.pending.as_mut()) else {
            return Err(SendFailure::Transient("connection unavailable".to_string()));
        };
        let res = batch.write_to(stream).await;
        if res.is_err() {
            batch.rewind_partial_line();
        }
        if let Err(err) = res {
            warn!("Lost connection to {}: {}", self.endpoint(), err);
            self.stream = None;
            return Err(err.into());
        }

        self.pending = None;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SendFailure> {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(err) = stream.flush().await {
                self.stream = None;
                return Err(err.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::TcpListener,
    };

    #[tokio::test]
    async fn streams_json_lines() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let reader = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut lines = BufReader::new(stream).lines();
            let mut count = 0;
            while let Some(line) = lines.next_line().await? {
                serde_json::from_str::<serde_json::Value>(&line)?;
                count += 1;
            }
            anyhow::Ok(count)
        });

        let mut sender = TcpLineSender::new("127.0.0.1", port);
        sender.start().await?;
        sender.send(100).await?;
        sender.flush().await?;
        drop(sender);

        assert_eq!(reader.await??, 100);
        Ok(())
    }

    #[tokio::test]
    async fn timed_out_send_is_retried_without_duplicates() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let reader = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            // stall like a pipeline applying backpressure, so the first attempt times out
            tokio::time::sleep(Duration::from_secs(1)).await;

            let mut lines = BufReader::new(stream).lines();
            let mut sequences = vec![];
            while let Some(line) = lines.next_line().await? {
                let value: serde_json::Value = serde_json::from_str(&line)?;
                sequences.push(value["attributes"]["sequence"].as_u64().unwrap_or(u64::MAX));
            }
            anyhow::Ok(sequences)
        });

        let mut sender = TcpLineSender::new("127.0.0.1", port);
        sender.start().await?;
        let first = tokio::time::timeout(Duration::from_millis(300), sender.send(50_000)).await;
        assert!(first.is_err(), "expected the stalled send to time out");

        sender.send(50_000).await?;
        sender.flush().await?;
        drop(sender);

        let sequences = reader.await??;
        assert_eq!(sequences.len(), 50_000);
        assert!(sequences.iter().copied().eq(0..50_000));
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_is_transient() -> anyhow::Result<()> {
        // grab a free port and release it again so nothing is listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };

        let mut sender = TcpLineSender::new("127.0.0.1", port);
        let res = sender.start().await;
        assert!(res.is_err_and(|failure| !failure.is_fatal()));
        Ok(())
    }
}
