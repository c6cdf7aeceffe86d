//! Transport notifications for the UI
//!
//! The audio thread posts single-byte [`SyncEvent`] codes on a ring buffer.
//! Posting never blocks: if the ring is full the event is dropped and counted.
//! Events are hints; receivers re-read positions and state from
//! [`TransportAtomics`](super::TransportAtomics) instead of trusting ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

/// Notification codes posted by the audio thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyncEvent {
    /// Transport started rolling
    RollStarted = b'1',
    /// Transport stopped rolling
    RollStopped = b'0',
    /// A seek was applied and downstream workers re-seeked
    SeekCompleted = b'G',
    /// Bounce render started
    BounceStarted = b'f',
    /// Bounce render reached the right marker
    BounceFinished = b'F',
    /// A pending start was aborted by the device
    RollAborted = b'3',
    /// The audio backend shut down
    Shutdown = b'S',
}

impl SyncEvent {
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(SyncEvent::RollStarted),
            b'0' => Some(SyncEvent::RollStopped),
            b'G' => Some(SyncEvent::SeekCompleted),
            b'f' => Some(SyncEvent::BounceStarted),
            b'F' => Some(SyncEvent::BounceFinished),
            b'3' => Some(SyncEvent::RollAborted),
            b'S' => Some(SyncEvent::Shutdown),
            _ => None,
        }
    }
}

/// Realtime side of the notification ring
pub struct SyncNotifier {
    producer: rtrb::Producer<u8>,
    dropped: Arc<AtomicU64>,
}

impl SyncNotifier {
    /// Post an event without blocking; returns false if it was dropped
    #[inline]
    pub fn notify(&mut self, event: SyncEvent) -> bool {
        match self.producer.push(event.as_byte()) {
            Ok(()) => true,
            Err(rtrb::PushError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Control side of the notification ring
pub struct SyncEvents {
    consumer: rtrb::Consumer<u8>,
    dropped: Arc<AtomicU64>,
}

impl SyncEvents {
    /// Next pending event, skipping unknown codes
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        while let Ok(byte) = self.consumer.pop() {
            match SyncEvent::from_byte(byte) {
                Some(event) => return Some(event),
                None => log::warn!("Ignoring unknown sync code 0x{:02x}", byte),
            }
        }
        None
    }

    /// Poll for the next event with spin/yield backoff, up to `timeout`
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<SyncEvent> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if Instant::now() >= deadline {
                return None;
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Drain every pending event into `out`
    pub fn drain_into(&mut self, out: &mut Vec<SyncEvent>) {
        while let Some(event) = self.try_recv() {
            out.push(event);
        }
    }

    /// Number of events the audio thread had to drop
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a notification ring with room for `capacity` events
pub fn sync_channel(capacity: usize) -> (SyncNotifier, SyncEvents) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        SyncNotifier {
            producer,
            dropped: Arc::clone(&dropped),
        },
        SyncEvents { consumer, dropped },
    )
}
