//! One-shot phase signalling for tally.
//!
//! Both tally binaries coordinate phase changes, chiefly shutdown, between
//! tasks that do not otherwise know about each other: the delivery pipeline
//! must stop dispatching new sends while in-flight attempts drain, and the
//! server must stop accepting connections while open ones complete. The
//! mechanism here is a single-fire `Broadcaster` paired with any number of
//! cloned `Watcher` instances.
//!
//! A signal fires once and is never rescinded. Watchers may poll with
//! [`Watcher::is_signaled`] from tight loops or park on [`Watcher::recv`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use tokio::sync::watch;
use tracing::info;

/// Construct a connected [`Watcher`]/[`Broadcaster`] pair.
///
/// There is one `Broadcaster` per phase; every party interested in the phase
/// holds a clone of the `Watcher`.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// The sending half of a phase signal. Firing consumes the broadcaster; a
/// phase cannot be un-achieved.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Fire the signal. Does not wait for watchers to observe it.
    pub fn signal(self) {
        // Send only fails if every watcher is already gone, in which case
        // there is nobody left to inform.
        let _ = self.sender.send(true);
    }

    /// Fire the signal, then wait until every `Watcher` clone has dropped.
    ///
    /// Used at shutdown to linger until all participating tasks have wound
    /// down. Tasks signal completion implicitly by dropping their watcher.
    pub async fn signal_and_wait(self) {
        let _ = self.sender.send(true);
        info!("signal fired, waiting for watchers to drop");
        self.sender.closed().await;
    }
}

#[derive(Debug, Clone)]
/// The receiving half of a phase signal.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait until the signal fires. Returns immediately if it already has,
    /// or if the `Broadcaster` was dropped without firing.
    pub async fn recv(mut self) {
        // An Err means the broadcaster is gone; treat that as the phase
        // having been reached so no watcher parks forever.
        let _ = self.receiver.wait_for(|fired| *fired).await;
    }

    /// Check without blocking whether the signal has fired.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.receiver.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn watchers_observe_signal() {
        let (watcher, broadcaster) = signal();
        let second = watcher.clone();

        assert!(!watcher.is_signaled());
        broadcaster.signal();
        assert!(watcher.is_signaled());

        // recv returns promptly on an already-fired signal.
        tokio::time::timeout(Duration::from_secs(1), second.recv())
            .await
            .expect("recv should not block after signal");
    }

    #[tokio::test]
    async fn signal_and_wait_blocks_until_watchers_drop() {
        let (watcher, broadcaster) = signal();
        let held = watcher.clone();

        let handle = tokio::spawn(async move {
            watcher.recv().await;
            // watcher dropped here
        });

        let waiter = tokio::spawn(broadcaster.signal_and_wait());
        handle.await.expect("task panicked");

        // The broadcaster is still waiting on `held`.
        assert!(!waiter.is_finished());
        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal_and_wait should return once watchers drop")
            .expect("task panicked");
    }

    #[tokio::test]
    async fn dropped_broadcaster_unparks_watchers() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        tokio::time::timeout(Duration::from_secs(1), watcher.recv())
            .await
            .expect("recv should return when broadcaster is dropped");
    }
}
