//! Plain-text log files fed from broker subscriptions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tonetest_broker::{BrokerConnection, Subscription};
use tonetest_core::error::TonetestError;

/// How long a single read waits before checking for shutdown again.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Appends every message on a topic pattern to a file as rendered lines.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<std::io::Result<u64>>,
}

impl LogSink {
    /// Truncates `path`, subscribes to `pattern` and starts copying.
    pub async fn start(
        connection: &BrokerConnection,
        pattern: &str,
        path: impl AsRef<Path>,
    ) -> Result<Self, TonetestError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        let subscription = connection.subscribe(pattern).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(copy_loop(subscription, file, cancel.clone()));
        debug!(path = %path.display(), pattern, "log sink started");
        Ok(Self { path, cancel, task })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes out everything buffered so far and closes the file.
    ///
    /// Flush the broker connection first so in-flight messages are included.
    pub async fn finish(self) -> Result<u64, TonetestError> {
        self.cancel.cancel();
        let written = match self.task.await {
            Ok(result) => result?,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "log sink task failed");
                0
            }
        };
        debug!(path = %self.path.display(), lines = written, "log sink finished");
        Ok(written)
    }
}

async fn copy_loop(
    subscription: Arc<Subscription>,
    file: File,
    cancel: CancellationToken,
) -> std::io::Result<u64> {
    let mut writer = BufWriter::new(file);
    let mut cursor = 0;
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            let batch = subscription.since(cursor).await;
            for message in &batch.messages {
                writer.write_all(message.render().as_bytes()).await?;
                writer.write_all(b"\n").await?;
                written += 1;
            }
            break;
        }

        let deadline = Instant::now() + POLL_INTERVAL;
        let batch = tokio::select! {
            batch = subscription.read_from(cursor, deadline) => batch,
            _ = cancel.cancelled() => continue,
        };
        let Some(batch) = batch else { continue };

        cursor = batch.next;
        for message in &batch.messages {
            writer.write_all(message.render().as_bytes()).await?;
            writer.write_all(b"\n").await?;
            written += 1;
        }
        if batch.closed {
            break;
        }
    }

    writer.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonetest_broker::{ConnectOptions, EmbeddedBroker};
    use tonetest_core::message::Message;

    #[tokio::test]
    async fn sink_writes_rendered_lines_and_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("run.log");
        tokio::fs::create_dir_all(path.parent().expect("parent"))
            .await
            .expect("mkdir");
        tokio::fs::write(&path, "stale line\n").await.expect("seed");

        let broker = EmbeddedBroker::bind("127.0.0.1:0").await.expect("bind");
        let conn = BrokerConnection::connect(&broker.local_addr().to_string(), ConnectOptions::default())
            .await
            .expect("connect");

        let sink = LogSink::start(&conn, "logs.test.v1.>", &path)
            .await
            .expect("start");
        conn.publish(Message::info("logs.test.v1.boot", "one").with_source("boot"))
            .expect("publish");
        conn.publish(Message::error("logs.test.v1.error", "two").with_source("boot"))
            .expect("publish");
        conn.publish(Message::info("elsewhere", "three")).expect("publish");
        conn.flush(Duration::from_secs(2)).await.expect("flush");

        let written = sink.finish().await.expect("finish");
        assert_eq!(written, 2);

        let content = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(
            content,
            "[T+0000s|INFO|boot] one\n[T+0000s|ERROR|boot] two\n"
        );

        conn.close().await;
        broker.shutdown().await;
    }
}
