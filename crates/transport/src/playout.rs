//! Real-time playout queue
//!
//! Outgoing audio is produced much faster than it plays. Packets wait here
//! and a writer task releases one per period, so anything still queued when
//! the user interrupts can be dropped with [`Playout::clear`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::TransportError;

/// Paced queue feeding a packet writer
pub struct Playout<T> {
    queue: Arc<Mutex<VecDeque<T>>>,
    wake: Arc<Notify>,
    writer: JoinHandle<()>,
}

impl<T: Send + 'static> Playout<T> {
    /// Spawn the writer task; `write` is called once per `period` while
    /// packets are queued
    pub fn spawn<F, Fut>(period: Duration, write: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let wake = Arc::new(Notify::new());
        let writer = tokio::spawn(run_writer(Arc::clone(&queue), Arc::clone(&wake), period, write));
        Self { queue, wake, writer }
    }

    pub fn push(&self, packets: impl IntoIterator<Item = T>) {
        self.queue.lock().extend(packets);
        self.wake.notify_one();
    }

    /// Drop every packet not yet written, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

impl<T> Drop for Playout<T> {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

async fn run_writer<T, F, Fut>(queue: Arc<Mutex<VecDeque<T>>>, wake: Arc<Notify>, period: Duration, mut write: F)
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let idle = queue.lock().is_empty();
        if idle {
            wake.notified().await;
            ticker.reset();
            continue;
        }

        ticker.tick().await;
        // Popped only after the tick so a clear during the wait drops it too
        let Some(packet) = queue.lock().pop_front() else {
            continue;
        };
        if let Err(e) = write(packet).await {
            tracing::debug!(error = %e, "Dropped outgoing audio packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_playout(written: &Arc<Mutex<Vec<u32>>>) -> Playout<u32> {
        let written = Arc::clone(written);
        Playout::spawn(Duration::from_millis(20), move |packet| {
            let written = Arc::clone(&written);
            async move {
                written.lock().push(packet);
                Ok(())
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_packets_leave_at_real_time_pace() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let playout = recording_playout(&written);

        playout.push(0..5);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = written.lock().len();
        assert!((2..=3).contains(&sent), "sent {sent} packets in 50ms");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*written.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(playout.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_unplayed_packets() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let playout = recording_playout(&written);

        playout.push(0..50);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let dropped = playout.clear();
        let sent = written.lock().len();
        assert_eq!(sent + dropped, 50);
        assert!(dropped > 40);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(written.lock().len(), sent);

        // Playback resumes with the next reply
        playout.push([99]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(written.lock().last(), Some(&99));
    }
}
