//! Restartable per-session timers
//!
//! A timer never touches session state. On expiry it posts
//! `Event::Timeout` carrying the generation it was armed with. Generations
//! come from one counter per engine, so an expiry that raced with a re-arm,
//! a cancel or a torn-down record is recognised as stale by the protocol
//! task and ignored, even when a new record for the same peer has armed
//! its own timer since.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Event;
use crate::types::MacAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// EAPOL-Key retransmission
    Resend,
    /// SAE commit/confirm retransmission
    SaeRetransmit,
    /// Overall SAE authentication phase
    SaeAuth,
}

/// Event queue timers post to, with the engine-wide generation counter
#[derive(Debug)]
pub struct TimerQueue {
    events: mpsc::UnboundedSender<Event>,
    generations: AtomicU64,
}

impl TimerQueue {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            generations: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Default)]
pub struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn arm(
        &mut self,
        after: Duration,
        peer: MacAddr,
        kind: TimerKind,
        queue: &TimerQueue,
    ) {
        self.cancel();
        let generation = queue.next_generation();
        self.generation = generation;
        let events = queue.events.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The engine may already be gone
            let _ = events.send(Event::Timeout {
                peer,
                kind,
                generation,
            });
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Claim an expiry. Returns false for a stale one; a current one
    /// leaves the slot disarmed.
    pub fn take_expiry(&mut self, generation: u64) -> bool {
        if self.handle.is_none() || generation != self.generation {
            return false;
        }
        self.handle = None;
        true
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: MacAddr = MacAddr([2, 0, 0, 0, 0, 7]);

    async fn next_generation(rx: &mut mpsc::UnboundedReceiver<Event>) -> u64 {
        match rx.recv().await {
            Some(Event::Timeout { generation, .. }) => generation,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_posted_and_claimed_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TimerQueue::new(tx);
        let mut slot = TimerSlot::default();
        slot.arm(Duration::from_millis(100), PEER, TimerKind::Resend, &queue);
        assert!(slot.is_armed());

        let generation = next_generation(&mut rx).await;
        assert!(slot.take_expiry(generation));
        assert!(!slot.is_armed());
        assert!(!slot.take_expiry(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_makes_earlier_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TimerQueue::new(tx);
        let mut slot = TimerSlot::default();
        slot.arm(Duration::from_millis(100), PEER, TimerKind::Resend, &queue);
        let stale = slot.generation;
        slot.arm(Duration::from_millis(300), PEER, TimerKind::Resend, &queue);
        assert!(!slot.take_expiry(stale));

        let generation = next_generation(&mut rx).await;
        assert!(slot.take_expiry(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TimerQueue::new(tx);
        let mut slot = TimerSlot::default();
        slot.arm(Duration::from_millis(100), PEER, TimerKind::SaeAuth, &queue);
        slot.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_of_a_dropped_slot_is_stale_for_its_successor() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TimerQueue::new(tx);
        let mut old = TimerSlot::default();
        old.arm(Duration::from_millis(100), PEER, TimerKind::Resend, &queue);
        let stale = next_generation(&mut rx).await;
        drop(old);

        let mut fresh = TimerSlot::default();
        fresh.arm(Duration::from_millis(100), PEER, TimerKind::Resend, &queue);
        assert!(!fresh.take_expiry(stale));
        let current = next_generation(&mut rx).await;
        assert!(fresh.take_expiry(current));
    }
}
