//! The coordinator's event bus.
//!
//! The state machine publishes phase transitions, round rows and freshly
//! committed global patterns over `watch` channels. Anyone holding an
//! [`EventSubscriber`] can obtain per-event listeners; a listener always
//! observes the latest value.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    state_machine::phases::PhaseName,
    storage::{FederatedRound, GlobalPattern},
};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// The round number the event belongs to.
    pub round_number: u64,
    /// The event itself.
    pub event: E,
}

/// Round row update event.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundUpdate {
    Invalidate,
    New(Arc<FederatedRound>),
}

/// Global pattern set update event.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalPatternsUpdate {
    Invalidate,
    New(Arc<Vec<GlobalPattern>>),
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// The round number attached to all published events.
    round_number: u64,
    phase_tx: EventBroadcaster<PhaseName>,
    round_tx: EventBroadcaster<RoundUpdate>,
    patterns_tx: EventBroadcaster<GlobalPatternsUpdate>,
}

/// The `EventSubscriber` hands out `EventListener`s for any coordinator
/// event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    round_rx: EventListener<RoundUpdate>,
    patterns_rx: EventListener<GlobalPatternsUpdate>,
}

impl EventPublisher {
    /// Initializes a new event publisher with the given initial events.
    pub fn init(round_number: u64, phase: PhaseName) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel(Event {
            round_number,
            event: phase,
        });
        let (round_tx, round_rx) = watch::channel(Event {
            round_number,
            event: RoundUpdate::Invalidate,
        });
        let (patterns_tx, patterns_rx) = watch::channel(Event {
            round_number,
            event: GlobalPatternsUpdate::Invalidate,
        });

        let publisher = EventPublisher {
            round_number,
            phase_tx: phase_tx.into(),
            round_tx: round_tx.into(),
            patterns_tx: patterns_tx.into(),
        };
        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            round_rx: round_rx.into(),
            patterns_rx: patterns_rx.into(),
        };
        (publisher, subscriber)
    }

    /// Sets the round number that is attached to published events.
    pub fn set_round_number(&mut self, round_number: u64) {
        self.round_number = round_number;
    }

    fn event<E>(&self, event: E) -> Event<E> {
        Event {
            round_number: self.round_number,
            event,
        }
    }

    /// Emits a phase event.
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emits a round row update.
    pub fn broadcast_round(&mut self, update: RoundUpdate) {
        self.round_tx.broadcast(self.event(update));
    }

    /// Emits a global pattern set update.
    pub fn broadcast_patterns(&mut self, update: GlobalPatternsUpdate) {
        self.patterns_tx.broadcast(self.event(update));
    }
}

impl EventSubscriber {
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    pub fn round_listener(&self) -> EventListener<RoundUpdate> {
        self.round_rx.clone()
    }

    pub fn patterns_listener(&self) -> EventListener<GlobalPatternsUpdate> {
        self.patterns_rx.clone()
    }
}

/// A listener for one kind of coordinator event.
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    /// The most recently published event.
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for the next published event.
    pub async fn changed(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow().clone())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Sends `event` to every listener; whether anyone is listening is
    /// irrelevant.
    fn broadcast(&self, event: Event<E>) {
        let _ = self.0.send(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}
