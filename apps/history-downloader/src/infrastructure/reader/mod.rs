//! Reader Loop
//!
//! Moves callbacks from a connection's buffer onto the session's inbound
//! queue. The loop sleeps on the connection's wake signal, drains everything
//! buffered, and forwards it in order.
//!
//! When the connection closes on its own, whatever is still buffered is
//! forwarded, followed by a single `ConnectionLost`. A deliberate `stop`
//! ends the loop without reporting a loss.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{MessageSource, ProtocolCallback, ReaderLauncher};
use crate::application::services::{InboundSender, SessionInput};

struct RunningReader {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// [`ReaderLauncher`] backed by a tokio task.
pub struct ReaderTask {
    inbound: InboundSender,
    running: Option<RunningReader>,
}

impl ReaderTask {
    /// Reader that forwards onto `inbound`.
    #[must_use]
    pub const fn new(inbound: InboundSender) -> Self {
        Self {
            inbound,
            running: None,
        }
    }
}

impl ReaderLauncher for ReaderTask {
    fn start(&mut self, source: Arc<dyn MessageSource>) {
        self.stop();
        let stop = CancellationToken::new();
        let task = tokio::spawn(read_loop(source, self.inbound.clone(), stop.clone()));
        self.running = Some(RunningReader { stop, task });
        tracing::debug!("Reader started");
    }

    fn stop(&mut self) {
        if let Some(reader) = self.running.take() {
            reader.stop.cancel();
            tracing::debug!("Reader stop requested");
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|reader| !reader.task.is_finished())
    }
}

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward every buffered callback. Returns `false` once the session is gone.
async fn forward(source: &dyn MessageSource, inbound: &InboundSender) -> bool {
    for callback in source.drain() {
        if inbound.send(SessionInput::Callback(callback)).await.is_err() {
            tracing::debug!("Inbound queue closed, reader exiting");
            return false;
        }
    }
    true
}

async fn read_loop(source: Arc<dyn MessageSource>, inbound: InboundSender, stop: CancellationToken) {
    let wake = source.wake_signal();
    let closed = source.closed();

    loop {
        if !forward(source.as_ref(), &inbound).await {
            return;
        }

        tokio::select! {
            biased;

            () = stop.cancelled() => {
                tracing::debug!("Reader stopped");
                return;
            }
            () = closed.cancelled() => {
                if forward(source.as_ref(), &inbound).await {
                    tracing::info!("Connection closed by peer");
                    let _ = inbound
                        .send(SessionInput::Callback(ProtocolCallback::ConnectionLost))
                        .await;
                }
                return;
            }
            () = wake.notified() => {}
        }
    }
}
