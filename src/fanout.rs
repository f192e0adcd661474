//! Broadcast of live readings and rollup snapshots to connected observers.
//!
//! Every observer owns a small bounded queue. Publishing never blocks the
//! acquisition worker: when an observer's queue is full the message is
//! dropped for that observer only. Delivery is at most once and missed
//! messages are not replayed, apart from the last live update which a newly
//! connected observer receives straight away.

use core::cell::RefCell;
use std::sync::{Arc, Weak};

use chrono::Local;
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embassy_sync::channel::Channel;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::rollup::RollupSnapshot;
use crate::storage::Sample;

/// Messages an observer may have queued before it starts losing them
pub const OBSERVER_QUEUE_DEPTH: usize = 16;

/// Event name of live-update messages
pub const LIVE_EVENT: &str = "sensor_data";
/// Event name of rollup-snapshot messages
pub const ROLLUP_EVENT: &str = "stats_update";

type ObserverQueue = Channel<CriticalSectionRawMutex, FanoutMessage, OBSERVER_QUEUE_DEPTH>;

/// Rounded reading pushed to observers on the emit cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub temperature: f64,
    pub humidity: f64,
    /// Local wall-clock time, `hh:mm:ss AM`
    pub timestamp: String,
}

impl LiveUpdate {
    pub fn from_sample(sample: &Sample) -> Self {
        Self {
            temperature: round2(sample.temperature),
            humidity: round2(sample.humidity),
            timestamp: sample
                .captured_at
                .with_timezone(&Local)
                .format("%I:%M:%S %p")
                .to_string(),
        }
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub enum FanoutMessage {
    Live(LiveUpdate),
    /// Shared so that one snapshot is not deep-copied per observer
    Rollups(Arc<RollupSnapshot>),
}

impl FanoutMessage {
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Live(_) => LIVE_EVENT,
            Self::Rollups(_) => ROLLUP_EVENT,
        }
    }

    /// JSON body handed to the transport.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Live(update) => serde_json::to_string(update),
            Self::Rollups(snapshot) => serde_json::to_string(snapshot.as_ref()),
        }
    }
}

/// Receiving end held by one connected observer.
///
/// Dropping it disconnects the observer; the fanout forgets it on the next
/// publish.
pub struct Observer {
    id: u64,
    queue: Arc<ObserverQueue>,
}

impl Observer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> FanoutMessage {
        self.queue.receive().await
    }

    /// Next queued message, if any.
    pub fn try_recv(&self) -> Option<FanoutMessage> {
        self.queue.try_receive().ok()
    }
}

struct FanoutState {
    observers: Vec<(u64, Weak<ObserverQueue>)>,
    last_live: Option<LiveUpdate>,
    next_id: u64,
}

impl FanoutState {
    /// Queue `message` for every live observer; returns how many took it.
    fn broadcast(&mut self, message: &FanoutMessage) -> usize {
        let mut delivered = 0;
        self.observers.retain(|(id, queue)| {
            let Some(queue) = queue.upgrade() else {
                debug!("Observer {} disconnected", id);
                return false;
            };
            match queue.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => debug!("Observer {} queue full, dropped {}", id, message.event_name()),
            }
            true
        });
        delivered
    }
}

pub struct Fanout {
    state: Mutex<CriticalSectionRawMutex, RefCell<FanoutState>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(FanoutState {
                observers: Vec::new(),
                last_live: None,
                next_id: 0,
            })),
        }
    }

    /// Broadcast a live update and remember it for connect replay.
    ///
    /// The remembered value and the broadcast change under one lock, so a
    /// concurrent [`Fanout::connect`] sees either the previous update or
    /// this one, and never both.
    pub fn publish_live(&self, update: LiveUpdate) -> usize {
        self.state.lock(|s| {
            let mut state = s.borrow_mut();
            let message = FanoutMessage::Live(update.clone());
            state.last_live = Some(update);
            state.broadcast(&message)
        })
    }

    /// Broadcast one aggregate rollup message.
    pub fn publish_rollups(&self, snapshot: RollupSnapshot) -> usize {
        let message = FanoutMessage::Rollups(Arc::new(snapshot));
        self.state.lock(|s| s.borrow_mut().broadcast(&message))
    }

    /// Register a new observer.
    ///
    /// The last live update, if there is one, is queued for this observer
    /// only.
    pub fn connect(&self) -> Observer {
        let queue = Arc::new(ObserverQueue::new());

        let id = self.state.lock(|s| {
            let mut state = s.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;

            if let Some(last) = &state.last_live {
                // A fresh queue always has room.
                let _ = queue.try_send(FanoutMessage::Live(last.clone()));
            }
            state.observers.push((id, Arc::downgrade(&queue)));
            id
        });

        debug!("Observer {} connected", id);
        Observer { id, queue }
    }

    pub fn last_live(&self) -> Option<LiveUpdate> {
        self.state.lock(|s| s.borrow().last_live.clone())
    }

    /// Observers still holding their receiving end.
    pub fn observer_count(&self) -> usize {
        self.state
            .lock(|s| s.borrow().observers.iter().filter(|(_, q)| q.strong_count() > 0).count())
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::{Bucket, Timeframe};
    use chrono::{TimeZone, Utc};

    fn update(t: f64) -> LiveUpdate {
        LiveUpdate {
            temperature: t,
            humidity: 50.0,
            timestamp: "01:02:03 PM".to_string(),
        }
    }

    #[test]
    fn test_live_update_rounds_and_formats() {
        let captured_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let live = LiveUpdate::from_sample(&Sample::new(22.34567, 40.005001, captured_at));

        assert_eq!(live.temperature, 22.35);
        assert_eq!(live.humidity, 40.01);

        let ts = live.timestamp.as_bytes();
        assert_eq!(ts.len(), 11, "{}", live.timestamp);
        assert_eq!((ts[2], ts[5], ts[8]), (b':', b':', b' '));
        assert!(live.timestamp.ends_with("AM") || live.timestamp.ends_with("PM"));
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(21.999), 22.0);
        assert_eq!(round2(-3.14159), -3.14);
        assert_eq!(round2(55.0), 55.0);
    }

    #[test]
    fn test_publish_reaches_every_observer() {
        let fanout = Fanout::new();
        let a = fanout.connect();
        let b = fanout.connect();

        assert_eq!(fanout.publish_live(update(21.0)), 2);

        for observer in [&a, &b] {
            match observer.try_recv() {
                Some(FanoutMessage::Live(live)) => assert_eq!(live.temperature, 21.0),
                other => panic!("unexpected {:?}", other),
            }
            assert!(observer.try_recv().is_none());
        }
    }

    #[test]
    fn test_connect_replays_last_live_to_newcomer_only() {
        let fanout = Fanout::new();
        let early = fanout.connect();
        fanout.publish_live(update(20.0));
        fanout.publish_live(update(21.0));
        let _ = early.try_recv();
        let _ = early.try_recv();

        let late = fanout.connect();

        match late.try_recv() {
            Some(FanoutMessage::Live(live)) => assert_eq!(live, update(21.0)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(late.try_recv().is_none());
        assert!(early.try_recv().is_none());
    }

    #[test]
    fn test_connect_without_history_queues_nothing() {
        let fanout = Fanout::new();
        let observer = fanout.connect();
        assert!(observer.try_recv().is_none());
        assert!(fanout.last_live().is_none());
    }

    #[test]
    fn test_dropped_observer_is_forgotten() {
        let fanout = Fanout::new();
        let kept = fanout.connect();
        drop(fanout.connect());

        assert_eq!(fanout.observer_count(), 1);
        assert_eq!(fanout.publish_rollups(RollupSnapshot::default()), 1);
        assert!(matches!(kept.try_recv(), Some(FanoutMessage::Rollups(_))));
    }

    #[test]
    fn test_slow_observer_loses_overflow() {
        let fanout = Fanout::new();
        let slow = fanout.connect();

        for i in 0..OBSERVER_QUEUE_DEPTH + 4 {
            fanout.publish_live(update(i as f64));
        }

        let received: Vec<_> = core::iter::from_fn(|| slow.try_recv()).collect();
        assert_eq!(received.len(), OBSERVER_QUEUE_DEPTH);
        // The oldest messages are kept, later ones were dropped.
        assert!(matches!(&received[0], FanoutMessage::Live(l) if l.temperature == 0.0));
        assert_eq!(fanout.last_live(), Some(update((OBSERVER_QUEUE_DEPTH + 3) as f64)));
    }

    #[test]
    fn test_message_json() {
        let live = FanoutMessage::Live(update(22.5));
        assert_eq!(live.event_name(), "sensor_data");
        assert_eq!(
            live.to_json().unwrap(),
            r#"{"temperature":22.5,"humidity":50.0,"timestamp":"01:02:03 PM"}"#
        );

        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut snapshot = RollupSnapshot::default();
        snapshot.insert(
            Timeframe::OneHour,
            vec![Bucket::from_samples(start, &[Sample::new(22.0, 40.0, start)]).unwrap()],
        );
        let rollups = FanoutMessage::Rollups(Arc::new(snapshot));
        assert_eq!(rollups.event_name(), "stats_update");

        let json: serde_json::Value = serde_json::from_str(&rollups.to_json().unwrap()).unwrap();
        assert_eq!(json["1h"][0]["bucketStart"]["$date"], "2024-05-01T12:00:00.000Z");
        assert_eq!(json["1h"][0]["count"], 1);
    }
}
