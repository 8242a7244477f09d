//! Fan-out to attached consumers
//!
//! Every consumer owns a bounded queue. Delivery never blocks the ingest
//! path: a consumer whose queue is full is detached instead of slowing the
//! producer down or silently losing units.
//!
//! ```text
//!                 broadcast(unit)
//!                       │
//!        ┌──────────────┼──────────────┐
//!        ▼              ▼              ▼
//!   [queue: 256]   [queue: 256]   [queue: full] ──► detach(SlowConsumer)
//!        │              │
//!   relay task     relay task
//! ```
//!
//! A consumer attached while a [`ParameterBundle`] is cached starts with
//! SPS, PPS and IDR. One attached before the first bundle is enrolled
//! unprimed and receives nothing until the next bundle is committed, which
//! is then delivered whole.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc::{self, error::TrySendError};

use super::frame::StreamEvent;
use crate::device::StreamInfo;
use crate::media::cache::ParameterBundle;
use crate::media::h264::NalUnit;

/// Identifier of an attached consumer, unique for the life of the process
pub type ConsumerId = u64;

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// Queue room needed for the info event plus a full bundle
const MIN_QUEUE_DEPTH: usize = 4;

/// Why a consumer left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// The consumer asked to leave
    Requested,
    /// Its queue was full when a unit had to be delivered
    SlowConsumer,
    /// The receiving end was dropped
    Closed,
    /// The session stopped
    SessionEnded,
}

impl std::fmt::Display for DetachReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DetachReason::Requested => "requested",
            DetachReason::SlowConsumer => "slow consumer",
            DetachReason::Closed => "closed",
            DetachReason::SessionEnded => "session ended",
        };
        f.write_str(s)
    }
}

/// Broadcaster-side state for one consumer
#[derive(Debug)]
struct ConsumerHandle {
    id: ConsumerId,
    tx: mpsc::Sender<StreamEvent>,
    attached_at: Instant,
    /// Units queued so far
    delivered: u64,
    /// Whether the consumer has received a bundle
    primed: bool,
}

impl ConsumerHandle {
    fn send(&mut self, event: StreamEvent) -> Result<(), DetachReason> {
        let is_unit = event.is_unit();
        match self.tx.try_send(event) {
            Ok(()) => {
                if is_unit {
                    self.delivered += 1;
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(DetachReason::SlowConsumer),
            Err(TrySendError::Closed(_)) => Err(DetachReason::Closed),
        }
    }

    fn send_bundle(&mut self, bundle: &ParameterBundle) -> Result<(), DetachReason> {
        for unit in bundle.units() {
            self.send(StreamEvent::Unit(unit.clone()))?;
        }
        self.primed = true;
        Ok(())
    }
}

/// Receiving end handed to an attached consumer
#[derive(Debug)]
pub struct Subscription {
    id: ConsumerId,
    receiver: mpsc::Receiver<StreamEvent>,
}

impl Subscription {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Next event; `None` once the consumer has been detached
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok()
    }
}

/// A consumer removed during delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached {
    pub id: ConsumerId,
    pub reason: DetachReason,
    /// Units the consumer had been sent
    pub delivered: u64,
}

/// Set of attached consumers for one session
#[derive(Debug)]
pub struct Broadcaster {
    consumers: Vec<ConsumerHandle>,
    queue_depth: usize,
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            consumers: Vec::new(),
            queue_depth: queue_depth.max(MIN_QUEUE_DEPTH),
        }
    }

    /// Enroll a consumer
    ///
    /// The queue starts with the stream info, followed by the bundle when
    /// one exists.
    pub fn attach(&mut self, info: StreamInfo, bundle: Option<&ParameterBundle>) -> Subscription {
        let id = NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed);

        let (tx, receiver) = mpsc::channel(self.queue_depth);
        let mut consumer = ConsumerHandle {
            id,
            tx,
            attached_at: Instant::now(),
            delivered: 0,
            primed: false,
        };

        // A fresh queue always has room for these
        let _ = consumer.send(StreamEvent::Info(info));
        if let Some(bundle) = bundle {
            let _ = consumer.send_bundle(bundle);
        }

        tracing::debug!(
            consumer = id,
            primed = consumer.primed,
            consumers = self.consumers.len() + 1,
            "Consumer attached"
        );
        self.consumers.push(consumer);

        Subscription { id, receiver }
    }

    /// Remove a consumer; returns false if it was not attached
    pub fn detach(&mut self, id: ConsumerId) -> bool {
        let Some(pos) = self.consumers.iter().position(|c| c.id == id) else {
            return false;
        };
        let consumer = self.consumers.swap_remove(pos);
        tracing::debug!(
            consumer = id,
            delivered = consumer.delivered,
            attached_for = ?consumer.attached_at.elapsed(),
            "Consumer detached"
        );
        true
    }

    /// Deliver one unit to every consumer
    ///
    /// `committed` is the bundle this unit just completed, if any. Unprimed
    /// consumers receive that bundle instead of the bare unit.
    pub fn broadcast(&mut self, unit: &NalUnit, committed: Option<&ParameterBundle>) -> Vec<Detached> {
        let mut detached = Vec::new();

        self.consumers.retain_mut(|consumer| {
            let result = if consumer.primed {
                consumer.send(StreamEvent::Unit(unit.clone()))
            } else if let Some(bundle) = committed {
                consumer.send_bundle(bundle)
            } else {
                Ok(())
            };

            match result {
                Ok(()) => true,
                Err(reason) => {
                    detached.push(Detached {
                        id: consumer.id,
                        reason,
                        delivered: consumer.delivered,
                    });
                    false
                }
            }
        });

        detached
    }

    /// Report new stream info to every consumer
    pub fn announce(&mut self, info: StreamInfo) -> Vec<Detached> {
        let mut detached = Vec::new();

        self.consumers.retain_mut(|consumer| match consumer.send(StreamEvent::Info(info)) {
            Ok(()) => true,
            Err(reason) => {
                detached.push(Detached {
                    id: consumer.id,
                    reason,
                    delivered: consumer.delivered,
                });
                false
            }
        });

        detached
    }

    /// Tell every consumer the stream ended and detach them all
    pub fn close_all(&mut self, reason: &str) -> usize {
        let count = self.consumers.len();
        for mut consumer in self.consumers.drain(..) {
            // A full queue still ends: the receiver sees the channel close
            let _ = consumer.send(StreamEvent::Ended(reason.to_string()));
        }
        count
    }

    /// Number of attached consumers
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn contains(&self, id: ConsumerId) -> bool {
        self.consumers.iter().any(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::device::Resolution;
    use crate::media::cache::ParameterCache;

    fn unit(header: u8, tag: u8) -> NalUnit {
        NalUnit::new(Bytes::from(vec![0, 0, 0, 1, header, tag]), None).unwrap()
    }

    fn drain_units(sub: &mut Subscription) -> Vec<u8> {
        let mut tags = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let StreamEvent::Unit(unit) = event {
                tags.push(unit.payload()[1]);
            }
        }
        tags
    }

    /// Ingest a unit through a cache and broadcaster the way a session does
    fn ingest(cache: &mut ParameterCache, broadcaster: &mut Broadcaster, unit: NalUnit) -> Vec<Detached> {
        let committed = cache.on_unit(&unit).cloned();
        broadcaster.broadcast(&unit, committed.as_ref())
    }

    #[tokio::test]
    async fn test_info_first() {
        let mut broadcaster = Broadcaster::new(16);
        let info = StreamInfo::new(Some(Resolution::new(1080, 2400)), None);
        let mut sub = broadcaster.attach(info, None);

        assert_eq!(sub.recv().await, Some(StreamEvent::Info(info)));
        assert_eq!(broadcaster.len(), 1);
    }

    #[test]
    fn test_late_joiner_gets_bundle_then_live() {
        let mut cache = ParameterCache::new();
        let mut broadcaster = Broadcaster::new(16);
        let mut early = broadcaster.attach(StreamInfo::default(), None);

        ingest(&mut cache, &mut broadcaster, unit(0x67, 1));
        ingest(&mut cache, &mut broadcaster, unit(0x68, 2));
        ingest(&mut cache, &mut broadcaster, unit(0x65, 3));
        ingest(&mut cache, &mut broadcaster, unit(0x41, 4));

        let mut late = broadcaster.attach(StreamInfo::default(), cache.current_bundle());
        ingest(&mut cache, &mut broadcaster, unit(0x41, 5));

        assert_eq!(drain_units(&mut early), vec![1, 2, 3, 4, 5]);
        assert_eq!(drain_units(&mut late), vec![1, 2, 3, 5]);
    }

    #[test]
    fn test_unprimed_consumer_starts_at_first_live_intra() {
        let mut cache = ParameterCache::new();
        let mut broadcaster = Broadcaster::new(16);

        // Stream joined mid-GOP: inter units before any parameter set
        let mut sub = broadcaster.attach(StreamInfo::default(), None);
        ingest(&mut cache, &mut broadcaster, unit(0x41, 1));
        ingest(&mut cache, &mut broadcaster, unit(0x67, 2));
        ingest(&mut cache, &mut broadcaster, unit(0x41, 3));
        ingest(&mut cache, &mut broadcaster, unit(0x68, 4));
        assert!(drain_units(&mut sub).is_empty());

        ingest(&mut cache, &mut broadcaster, unit(0x65, 5));
        ingest(&mut cache, &mut broadcaster, unit(0x41, 6));
        assert_eq!(drain_units(&mut sub), vec![2, 4, 5, 6]);
    }

    #[test]
    fn test_slow_consumer_is_detached() {
        let mut cache = ParameterCache::new();
        let mut broadcaster = Broadcaster::new(4);
        let mut fast = broadcaster.attach(StreamInfo::default(), None);
        let slow = broadcaster.attach(StreamInfo::default(), None);

        let mut detached = Vec::new();
        for (i, header) in [0x67, 0x68, 0x65, 0x41, 0x41].into_iter().enumerate() {
            detached.extend(ingest(&mut cache, &mut broadcaster, unit(header, i as u8)));
            // Only the fast consumer keeps up
            drain_units(&mut fast);
        }

        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].id, slow.id());
        assert_eq!(detached[0].reason, DetachReason::SlowConsumer);
        assert!(broadcaster.contains(fast.id()));
        assert!(!broadcaster.contains(slow.id()));
    }

    #[test]
    fn test_dropped_receiver_is_detached() {
        let mut cache = ParameterCache::new();
        let mut broadcaster = Broadcaster::new(16);
        cache.on_unit(&unit(0x67, 1));
        cache.on_unit(&unit(0x68, 2));
        cache.on_unit(&unit(0x65, 3));

        let sub = broadcaster.attach(StreamInfo::default(), cache.current_bundle());
        drop(sub);

        let detached = ingest(&mut cache, &mut broadcaster, unit(0x41, 4));
        assert_eq!(detached[0].reason, DetachReason::Closed);
        assert_eq!(detached[0].delivered, 3);
        assert!(broadcaster.is_empty());
    }

    #[test]
    fn test_detach_is_idempotent() {
        let mut broadcaster = Broadcaster::new(16);
        let sub = broadcaster.attach(StreamInfo::default(), None);

        assert!(broadcaster.detach(sub.id()));
        assert!(!broadcaster.detach(sub.id()));
        assert!(!broadcaster.detach(ConsumerId::MAX));
    }

    #[tokio::test]
    async fn test_close_all_ends_subscriptions() {
        let mut broadcaster = Broadcaster::new(16);
        let mut sub = broadcaster.attach(StreamInfo::default(), None);

        assert_eq!(broadcaster.close_all("stream ended: eof"), 1);
        assert!(broadcaster.is_empty());

        assert!(matches!(sub.recv().await, Some(StreamEvent::Info(_))));
        assert_eq!(
            sub.recv().await,
            Some(StreamEvent::Ended("stream ended: eof".into()))
        );
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_announce_reaches_unprimed_consumers() {
        let mut broadcaster = Broadcaster::new(16);
        let mut sub = broadcaster.attach(StreamInfo::default(), None);
        let rotated = StreamInfo::new(None, Some(Resolution::new(1280, 576)));

        assert!(broadcaster.announce(rotated).is_empty());
        assert_eq!(sub.try_recv(), Some(StreamEvent::Info(StreamInfo::default())));
        assert_eq!(sub.try_recv(), Some(StreamEvent::Info(rotated)));
    }
}
