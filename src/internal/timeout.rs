use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// identifies one arming of the scheduler. a fire is only honored if its id is still armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// single-shot timer. at most one is live; arming again replaces the previous one.
///
/// a fire is not run inline: the id is sent on `fired_chan` so the owner can handle it
/// in its own serialized context. `fired` filters out fires that lost a race with `cancel`.
pub struct TimeoutScheduler {
    fired_chan: mpsc::UnboundedSender<TimerId>,
    armed: Option<(TimerId, JoinHandle<()>)>,
    next_id: u64,
}

impl TimeoutScheduler {
    pub fn new(fired_chan: mpsc::UnboundedSender<TimerId>) -> Self {
        Self {
            fired_chan,
            armed: None,
            next_id: 0,
        }
    }

    pub fn arm(&mut self, duration: Duration) -> TimerId {
        self.cancel();
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let tx = self.fired_chan.clone();
        // the deadline is fixed here, not when the task is first polled
        let sleep = tokio::time::sleep(duration);
        let handle = tokio::spawn(async move {
            sleep.await;
            if tx.send(id).is_err() {
                log::debug!("timer fired after its owner went away");
            }
        });
        self.armed = Some((id, handle));
        id
    }

    pub fn cancel(&mut self) {
        if let Some((_, handle)) = self.armed.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// consumes a fire notification. true only if `id` is the live timer
    pub fn fired(&mut self, id: TimerId) -> bool {
        match &self.armed {
            Some((armed, _)) if *armed == id => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_duration() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = TimeoutScheduler::new(tx);
        let id = timer.arm(Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.recv().await, Some(id));
        assert!(timer.fired(id));
        assert!(!timer.is_armed());
        assert!(!timer.fired(id));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = TimeoutScheduler::new(tx);
        let first = timer.arm(Duration::from_secs(1));
        let second = timer.arm(Duration::from_secs(3));
        assert_ne!(first, second);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.fired(first));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(second));
        assert!(timer.fired(second));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = TimeoutScheduler::new(tx);
        timer.cancel();
        let id = timer.arm(Duration::from_secs(1));
        timer.cancel();
        timer.cancel();
        assert!(!timer.is_armed());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.fired(id));
    }
}
