//! Line-delimited JSON bridge to the foreground process.
//!
//! Requests arrive one [`Frame`] per line on the reader; events leave one
//! frame per line on the writer. The only request is
//! `START_NOTIFICATION_SERVICE` with an [`Identity`] payload.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{emit, EventSink};
use crate::protocol::{Frame, Identity, PushEvent, START_NOTIFICATION_SERVICE};
use crate::supervisor::Supervisor;

pub struct Bridge {
    supervisor: Supervisor,
    sink: Arc<dyn EventSink>,
}

impl Bridge {
    /// `sink` must be the same sink the supervisor reports to, so rejected
    /// requests are answered on the same stream.
    pub fn new(supervisor: Supervisor, sink: Arc<dyn EventSink>) -> Self {
        Self { supervisor, sink }
    }

    /// Read requests until EOF. Start requests run on their own tasks so a
    /// slow registration never blocks the reader.
    pub async fn serve<R>(&self, reader: R) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            self.handle_line(&line);
        }
        tracing::debug!("bridge input closed");
        Ok(())
    }

    /// Shut the supervisor down, then let `writer` drain what is already
    /// queued. Start tasks still running hold sink handles, so the wait is
    /// bounded by `grace`.
    pub async fn close(self, writer: JoinHandle<std::io::Result<()>>, grace: Duration) {
        self.supervisor.shutdown().await;
        drop(self);
        match tokio::time::timeout(grace, writer).await {
            Ok(Ok(Ok(()))) => tracing::debug!("event writer drained"),
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "event writer failed"),
            Ok(Err(e)) => tracing::warn!(?e, "event writer task panicked"),
            Err(_) => tracing::warn!("event writer did not drain in time"),
        }
    }

    /// Dispatch one request line. Returns the task running a start request.
    pub fn handle_line(&self, line: &str) -> Option<JoinHandle<()>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let frame: Frame = match serde_json::from_str(line) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed bridge frame");
                return None;
            }
        };

        match frame.channel.as_str() {
            START_NOTIFICATION_SERVICE => {
                let identity = match parse_identity(frame.payload) {
                    Ok(identity) => identity,
                    Err(e) => {
                        tracing::warn!(error = %e, "rejecting start request");
                        emit(self.sink.as_ref(), PushEvent::ServiceError(e));
                        return None;
                    }
                };
                let supervisor = self.supervisor.clone();
                Some(tokio::spawn(async move { supervisor.start(identity).await }))
            }
            other => {
                tracing::warn!(channel = other, "ignoring unknown bridge channel");
                None
            }
        }
    }
}

fn parse_identity(payload: serde_json::Value) -> Result<Identity, String> {
    let identity: Identity = serde_json::from_value(payload)
        .map_err(|e| format!("invalid start request: {}", e))?;
    identity
        .validate()
        .map_err(|e| format!("invalid start request: {}", e))?;
    Ok(identity)
}

/// Write every event to `writer` as one JSON line. Returns when the event
/// channel closes or the writer fails; either way the receiver is dropped, and
/// the sink then reports the target as gone.
pub async fn forward_events<W>(
    mut events: mpsc::UnboundedReceiver<PushEvent>,
    mut writer: W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event.to_frame())?;
        line.push(b'\n');
        if let Err(e) = write_line(&mut writer, &line).await {
            tracing::warn!(error = %e, "event consumer gone");
            return Err(e);
        }
    }
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}
