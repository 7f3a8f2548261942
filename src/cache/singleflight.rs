//! Per-key build latch.
//!
//! The first acquirer of an absent key installs a [`BuildLatch`] in the
//! instance table and spawns the build. Everyone who arrives while the build
//! runs clones the latch and waits on it. The outcome (entry or error) is
//! published once through a `watch` channel, so late subscribers still see it
//! and a waiter that gives up does not affect anyone else.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{HuginnError, Result};

use super::entry::CacheEntry;

type Outcome<H> = Option<std::result::Result<Arc<CacheEntry<H>>, HuginnError>>;

/// Create a connected publisher/latch pair for build number `id`.
pub(crate) fn latch<H: Send + Sync + 'static>(id: u64) -> (BuildPublisher<H>, BuildLatch<H>) {
    let (tx, rx) = watch::channel(None);
    (BuildPublisher { tx }, BuildLatch { id, rx })
}

/// Write side, owned by the build task.
pub(crate) struct BuildPublisher<H: Send + Sync + 'static> {
    tx: watch::Sender<Outcome<H>>,
}

impl<H: Send + Sync + 'static> BuildPublisher<H> {
    /// Publish the outcome to every current and future waiter.
    pub(crate) fn publish(self, outcome: Result<Arc<CacheEntry<H>>>) {
        self.tx.send_replace(Some(outcome));
    }
}

/// Read side, stored in the table while the build runs.
pub(crate) struct BuildLatch<H: Send + Sync + 'static> {
    id: u64,
    rx: watch::Receiver<Outcome<H>>,
}

impl<H: Send + Sync + 'static> BuildLatch<H> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the build to finish.
    ///
    /// Returns the loader's error unchanged on failure, or `BuildAborted` if
    /// the build task went away without publishing.
    pub(crate) async fn wait(mut self, model: &str) -> Result<Arc<CacheEntry<H>>> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(entry)) => Ok(entry),
            Some(Err(err)) => Err(err),
            None => Err(HuginnError::BuildAborted(model.to_string())),
        }
    }
}

impl<H: Send + Sync + 'static> Clone for BuildLatch<H> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            rx: self.rx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_waiters_receive_error() {
        let (publisher, latch) = latch::<u32>(1);
        let a = tokio::spawn(latch.clone().wait("m"));
        let b = tokio::spawn(latch.clone().wait("m"));

        publisher.publish(Err(HuginnError::load("m", "out of memory")));

        let expected = HuginnError::load("m", "out of memory");
        assert_eq!(a.await.unwrap().unwrap_err(), expected);
        assert_eq!(b.await.unwrap().unwrap_err(), expected);
        // Subscribers arriving after publication still see the outcome.
        assert_eq!(latch.wait("m").await.unwrap_err(), expected);
    }

    #[tokio::test]
    async fn dropped_publisher_aborts_waiters() {
        let (publisher, latch) = latch::<u32>(2);
        assert_eq!(latch.id(), 2);
        drop(publisher);

        let err = latch.wait("m").await.unwrap_err();
        assert_eq!(err, HuginnError::BuildAborted("m".to_string()));
    }
}
