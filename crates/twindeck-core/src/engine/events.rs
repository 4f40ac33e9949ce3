//! Loop restart publish/subscribe
//!
//! Each deck's looper publishes a [`LoopRestart`] the moment its playhead
//! wraps. Gate alignment, sync correction, the recorder and any external
//! observer hold their own [`Subscription`] and drain it on their own
//! schedule; nobody polls the looper.
//!
//! Delivery uses bounded crossbeam channels so publishing from the audio
//! thread never blocks or allocates. A full subscriber queue drops the
//! event for that subscriber only.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::types::DeckId;

/// Queue depth per subscriber
pub const SUBSCRIPTION_CAPACITY: usize = 64;

/// A loop boundary crossing on one deck
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopRestart {
    pub deck: DeckId,
    /// Restart counter for this deck since the track was loaded, starting at 1.
    /// Consumers use it to ignore an event they have already acted on.
    pub cycle: u64,
    /// Absolute clock frame of the first frame of the new cycle
    pub clock_frame: u64,
    /// Clock time of `clock_frame` in seconds
    pub clock_time: f64,
    /// Whole output frames the wrap was detected after the boundary
    pub late_frames: u64,
}

/// Identifies one subscription on a [`LoopEventBus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a bus subscription
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: Receiver<LoopRestart>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next pending restart, if any (non-blocking)
    pub fn try_recv(&self) -> Option<LoopRestart> {
        self.receiver.try_recv().ok()
    }

    /// Iterate over every restart queued so far
    pub fn drain(&self) -> channel::TryIter<'_, LoopRestart> {
        self.receiver.try_iter()
    }

    /// Blocking wait with timeout, for observers off the audio thread
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<LoopRestart> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

struct Subscriber {
    id: SubscriptionId,
    deck: Option<DeckId>,
    sender: Sender<LoopRestart>,
}

/// Fan-out of loop restart events
#[derive(Default)]
pub struct LoopEventBus {
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

impl LoopEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to restarts of one deck, or of every deck with `None`
    pub fn subscribe(&mut self, deck: Option<DeckId>) -> Subscription {
        let (sender, receiver) = channel::bounded(SUBSCRIPTION_CAPACITY);
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, deck, sender });
        Subscription { id, receiver }
    }

    /// Remove a subscription; returns false if it was already gone
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Deliver a restart to every matching subscriber
    ///
    /// Subscribers whose [`Subscription`] was dropped are pruned here.
    /// Returns the number of subscribers that received the event.
    pub fn publish(&mut self, event: LoopRestart) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|sub| {
            if sub.deck.is_some_and(|d| d != event.deck) {
                return true;
            }
            match sub.sender.try_send(event) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "Loop restart subscriber {:?} is full, dropping cycle {} of deck {}",
                        sub.id,
                        event.cycle,
                        event.deck
                    );
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restart(deck: DeckId, cycle: u64) -> LoopRestart {
        LoopRestart {
            deck,
            cycle,
            clock_frame: cycle * 1000,
            clock_time: cycle as f64,
            late_frames: 0,
        }
    }

    #[test]
    fn test_deck_filter() {
        let mut bus = LoopEventBus::new();
        let only_a = bus.subscribe(Some(DeckId::A));
        let all = bus.subscribe(None);

        assert_eq!(bus.publish(restart(DeckId::A, 1)), 2);
        assert_eq!(bus.publish(restart(DeckId::B, 1)), 1);

        assert_eq!(only_a.drain().count(), 1);
        let decks: Vec<DeckId> = all.drain().map(|e| e.deck).collect();
        assert_eq!(decks, vec![DeckId::A, DeckId::B]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut bus = LoopEventBus::new();
        let sub = bus.subscribe(None);
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        assert_eq!(bus.publish(restart(DeckId::A, 1)), 0);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let mut bus = LoopEventBus::new();
        let sub = bus.subscribe(None);
        drop(sub);
        bus.publish(restart(DeckId::B, 1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_full_subscriber_does_not_block_others() {
        let mut bus = LoopEventBus::new();
        let slow = bus.subscribe(None);
        let fast = bus.subscribe(None);

        for cycle in 1..=(SUBSCRIPTION_CAPACITY as u64 + 5) {
            bus.publish(restart(DeckId::A, cycle));
            fast.drain().for_each(drop);
        }

        assert_eq!(slow.drain().count(), SUBSCRIPTION_CAPACITY);
        assert_eq!(bus.subscriber_count(), 2);
    }
}
