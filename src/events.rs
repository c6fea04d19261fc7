use tokio::sync::mpsc;

use crate::protocol::PushEvent;

/// Where the supervisor reports to. Fire-and-forget.
///
/// The consumer may disappear at any time (window closed, pipe broken).
/// Callers check [`EventSink::is_alive`] before every send and drop the event
/// silently when the target is gone.
pub trait EventSink: Send + Sync {
    fn is_alive(&self) -> bool;
    fn deliver(&self, event: PushEvent);
}

/// Send `event` if the target is still there. Returns whether it was sent.
pub fn emit(sink: &dyn EventSink, event: PushEvent) -> bool {
    if !sink.is_alive() {
        tracing::debug!(channel = event.channel(), "event target gone, dropping event");
        return false;
    }
    sink.deliver(event);
    true
}

/// Sink backed by an unbounded channel. The target counts as gone once the
/// receiver is dropped.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PushEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn deliver(&self, event: PushEvent) {
        // Receiver can vanish between the liveness check and the send.
        let _ = self.tx.send(event);
    }
}
