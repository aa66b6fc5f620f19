//! Change-stream plumbing shared by the state model and accessors.
//!
//! A [`Watcher`] is the consumer half of a change stream: a channel of
//! change sets whose first event carries the current membership rather
//! than a diff. Publishers hold the matching [`WatcherSender`] and emit
//! coalesced sets of changed ids; a consumer that stops (or is dropped)
//! simply stops receiving.

use tokio::sync::mpsc;

/// Consumer half of a change stream.
#[derive(Debug)]
pub struct Watcher<T> {
    changes: mpsc::UnboundedReceiver<T>,
}

/// Publisher half of a change stream.
#[derive(Clone, Debug)]
pub struct WatcherSender<T> {
    changes: mpsc::UnboundedSender<T>,
}

/// Creates a connected publisher/consumer pair.
#[must_use]
pub fn channel<T>() -> (WatcherSender<T>, Watcher<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WatcherSender { changes: tx }, Watcher { changes: rx })
}

impl<T> Watcher<T> {
    /// Waits for the next change set. Returns `None` once the publisher
    /// has gone away and all buffered events have been drained.
    pub async fn next(&mut self) -> Option<T> {
        self.changes.recv().await
    }

    /// Stops the stream. Idempotent; events already buffered may still be
    /// drained with [`Watcher::next`].
    pub fn stop(&mut self) {
        self.changes.close();
    }
}

impl<T> WatcherSender<T> {
    /// Emits a change set. Returns `false` when the consumer is gone,
    /// letting publishers prune dead streams.
    pub fn send(&self, event: T) -> bool {
        self.changes.send(event).is_ok()
    }

    /// Reports whether the consumer half has stopped or been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.changes.is_closed()
    }
}

/// Stream carrying bare notifications (the event is the wake-up).
pub type NotifyWatcher = Watcher<()>;

/// Stream carrying sets of changed entity ids in string form.
pub type StringsWatcher = Watcher<Vec<String>>;

/// Publisher registry that fans one event out to any number of streams,
/// pruning streams whose consumers have stopped.
#[derive(Debug)]
pub struct Fanout<T: Clone> {
    senders: Vec<WatcherSender<T>>,
}

impl<T: Clone> Default for Fanout<T> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
        }
    }
}

impl<T: Clone> Fanout<T> {
    /// Registers a new stream, delivering `initial` as its first event.
    pub fn subscribe(&mut self, initial: T) -> Watcher<T> {
        let (tx, rx) = channel();
        tx.send(initial);
        self.senders.push(tx);
        rx
    }

    /// Broadcasts an event to all live streams.
    pub fn publish(&mut self, event: &T) {
        self.senders.retain(|sender| sender.send(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initial_event_carries_current_membership() {
        let mut fanout = Fanout::default();
        let mut watcher = fanout.subscribe(vec![String::from("0"), String::from("1")]);
        assert_eq!(
            watcher.next().await,
            Some(vec![String::from("0"), String::from("1")])
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_drains_buffered_events() {
        let (tx, mut watcher) = channel();
        assert!(tx.send(vec![String::from("2")]));
        watcher.stop();
        watcher.stop();
        assert_eq!(watcher.next().await, Some(vec![String::from("2")]));
        assert_eq!(watcher.next().await, None);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn publish_prunes_stopped_streams() {
        let mut fanout = Fanout::default();
        let mut alive = fanout.subscribe(Vec::new());
        let mut stopped = fanout.subscribe(Vec::new());
        assert_eq!(stopped.next().await, Some(Vec::new()));
        stopped.stop();
        drop(stopped);

        fanout.publish(&vec![String::from("3")]);
        assert_eq!(alive.next().await, Some(Vec::new()));
        assert_eq!(alive.next().await, Some(vec![String::from("3")]));
    }
}
