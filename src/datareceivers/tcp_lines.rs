/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{DataReceiver, ReceiverFault};
use anyhow::Context;
use async_trait::async_trait;
use std::{
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const DEFAULT_EXPORTER_TEMPLATE: &str =
    "syslog:\n  network: tcp\n  endpoint: {host}\n  port: {port}\n  tls:\n    insecure: true\n";

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    fault: Mutex<Option<String>>,
}
impl Counters {
    fn record_fault(&self, fault: String) {
        error!("Receiver fault: {}", fault);
        if let Ok(mut slot) = self.fault.lock() {
            slot.get_or_insert(fault);
        }
    }
}

/// Listens for newline-delimited records from the pipeline's exporter and counts them.
///
/// Each accepted connection is read on its own task. A record that is not valid UTF-8 is a
/// protocol fault which `received_count` reports from then on; connection resets are only logged,
/// since exporters reconnect.
pub struct TcpLineReceiver {
    host: String,
    port: u16,
    exporter_template: String,
    counters: Arc<Counters>,
    token: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}
impl TcpLineReceiver {
    /// Port `0` lets the OS pick a free port on `start`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            exporter_template: DEFAULT_EXPORTER_TEMPLATE.to_string(),
            counters: Arc::new(Counters::default()),
            token: CancellationToken::new(),
            accept_task: None,
        }
    }

    /// Overrides the exporter section handed to the pipeline. `{host}` and `{port}` are replaced
    /// with the listening address.
    pub fn with_exporter_template(mut self, template: &str) -> Self {
        self.exporter_template = template.to_string();
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl DataReceiver for TcpLineReceiver {
    fn name(&self) -> &str {
        "tcp_lines"
    }

    fn exporter_config_fragment(&self) -> String {
        self.exporter_template
            .replace("{host}", &self.host)
            .replace("{port}", &self.port.to_string())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .context(format!("Error binding receiver to {}:{}", self.host, self.port))?;
        let addr = listener.local_addr()?;
        self.port = addr.port();
        debug!("Receiver listening on {}", addr);

        let task = tokio::spawn(accept_loop(
            listener,
            self.counters.clone(),
            self.token.clone(),
        ));
        self.accept_task = Some(task);
        Ok(())
    }

    fn received_count(&self) -> Result<u64, ReceiverFault> {
        let fault = self
            .counters
            .fault
            .lock()
            .map_err(|_| ReceiverFault("receiver state lock was poisoned".to_string()))?;

        match fault.as_ref() {
            Some(fault) => Err(ReceiverFault(fault.clone())),
            None => Ok(self.counters.received.load(Ordering::Acquire)),
        }
    }

    async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(err) = task.await {
                warn!("Receiver task did not exit cleanly: {}", err);
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, counters: Arc<Counters>, token: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(count_lines(stream, peer, counters.clone(), token.clone()));
                }
                Err(err) => warn!("Error accepting connection: {}", err),
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
}

async fn count_lines(
    stream: TcpStream,
    peer: SocketAddr,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    debug!("Accepted connection from {}", peer);
    let mut lines = BufReader::new(stream).lines();

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(_)) => {
                counters.received.fetch_add(1, Ordering::AcqRel);
            }
            Ok(None) => break,
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                counters.record_fault(format!("malformed record from {peer}: {err}"));
                break;
            }
            Err(err) => {
                warn!("Connection from {} closed: {}", peer, err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn wait_for_count(receiver: &TcpLineReceiver, expected: u64) -> Result<u64, ReceiverFault> {
        for _ in 0..100 {
            let count = receiver.received_count()?;
            if count >= expected {
                return Ok(count);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        receiver.received_count()
    }

    #[tokio::test]
    async fn counts_lines_across_connections() -> anyhow::Result<()> {
        let mut receiver = TcpLineReceiver::new("127.0.0.1", 0);
        receiver.start().await?;
        let port = receiver.port();
        assert_ne!(port, 0);

        for _ in 0..3 {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
            stream.write_all(b"{\"a\":1}\n{\"a\":2}\n\n").await?;
            stream.shutdown().await?;
        }

        assert_eq!(wait_for_count(&receiver, 6).await?, 6);
        receiver.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_fault() -> anyhow::Result<()> {
        let mut receiver = TcpLineReceiver::new("127.0.0.1", 0);
        receiver.start().await?;

        let mut stream = TcpStream::connect(("127.0.0.1", receiver.port())).await?;
        stream.write_all(b"ok\n\xff\xfe\n").await?;
        stream.shutdown().await?;

        let mut res = receiver.received_count();
        for _ in 0..100 {
            if res.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            res = receiver.received_count();
        }
        assert!(res.is_err());

        receiver.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let mut receiver = TcpLineReceiver::new("127.0.0.1", 0);
        receiver.stop().await;
        assert_eq!(receiver.received_count(), Ok(0));
    }

    #[test]
    fn exporter_fragment_fills_in_the_address() {
        let receiver = TcpLineReceiver::new("127.0.0.1", 54001)
            .with_exporter_template("tcp:\n  endpoint: \"{host}:{port}\"\n");
        assert_eq!(
            receiver.exporter_config_fragment(),
            "tcp:\n  endpoint: \"127.0.0.1:54001\"\n"
        );
    }
}
