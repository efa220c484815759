//! Output fan-out for one job.
//!
//! A single task owns the subscriber list. Everyone else talks to it
//! through a channel, so chunks reach each subscriber in order and a
//! subscriber added mid-stream sees every chunk published after it.

use tokio::sync::mpsc;

use super::ProcessStream;

#[derive(Debug)]
enum Message {
    Subscribe(mpsc::UnboundedSender<ProcessStream>),
    Publish(ProcessStream),
    Close,
}

/// Handle to a job's dispatch task.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
}

impl Dispatcher {
    /// Start a dispatch task on the current runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Register a subscriber.
    ///
    /// Returns `None` once the dispatcher has closed. A subscription racing
    /// with close yields a stream that ends without an exit event.
    #[must_use]
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<ProcessStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx.send(Message::Subscribe(tx)).ok()?;
        Some(rx)
    }

    /// Send an event to every current subscriber.
    pub fn publish(&self, event: ProcessStream) {
        let _ = self.tx.send(Message::Publish(event));
    }

    /// End every subscriber's stream and stop the task.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close);
    }

    /// Whether the task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Message>) {
    let mut subscribers: Vec<mpsc::UnboundedSender<ProcessStream>> = Vec::new();

    while let Some(message) = rx.recv().await {
        match message {
            Message::Subscribe(subscriber) => subscribers.push(subscriber),
            Message::Publish(event) => {
                subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
            }
            Message::Close => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::StreamSource;
    use bytes::Bytes;

    fn chunk(data: &'static str) -> ProcessStream {
        ProcessStream::Output {
            source: StreamSource::Stdout,
            data: Bytes::from_static(data.as_bytes()),
        }
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<ProcessStream>) -> Vec<ProcessStream> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_chunk_in_order() {
        let dispatcher = Dispatcher::spawn();
        let a = dispatcher.subscribe().unwrap();
        let b = dispatcher.subscribe().unwrap();

        for data in ["1", "2", "3"] {
            dispatcher.publish(chunk(data));
        }
        dispatcher.publish(ProcessStream::Exit { status: 0 });
        dispatcher.close();

        let expected = vec![
            chunk("1"),
            chunk("2"),
            chunk("3"),
            ProcessStream::Exit { status: 0 },
        ];
        assert_eq!(drain(a).await, expected);
        assert_eq!(drain(b).await, expected);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_chunks() {
        let dispatcher = Dispatcher::spawn();
        let early = dispatcher.subscribe().unwrap();
        dispatcher.publish(chunk("before"));
        let late = dispatcher.subscribe().unwrap();
        dispatcher.publish(chunk("after"));
        dispatcher.close();

        assert_eq!(drain(early).await, vec![chunk("before"), chunk("after")]);
        assert_eq!(drain(late).await, vec![chunk("after")]);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_others() {
        let dispatcher = Dispatcher::spawn();
        let gone = dispatcher.subscribe().unwrap();
        let kept = dispatcher.subscribe().unwrap();
        drop(gone);

        dispatcher.publish(chunk("x"));
        dispatcher.close();
        assert_eq!(drain(kept).await, vec![chunk("x")]);
    }

    #[tokio::test]
    async fn subscribe_after_close_is_unavailable() {
        let dispatcher = Dispatcher::spawn();
        dispatcher.close();

        for _ in 0..100 {
            if dispatcher.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dispatcher.subscribe().is_none());
    }
}
