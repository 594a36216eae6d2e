use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

pub(crate) const CONNECT: u32 = 1 << 0;
pub(crate) const SUBSCRIBE: u32 = 1 << 1;
pub(crate) const RESPONSE: u32 = 1 << 2;
pub(crate) const REQUEST: u32 = 1 << 3;
pub(crate) const DISCONNECT: u32 = 1 << 4;

/// Pending-event bits shared between the dispatcher and everyone who may
/// post work for it. Posting never blocks and never takes a lock, so it is
/// safe from the MQTT callbacks and from callers holding the context lock.
#[derive(Default)]
pub(crate) struct EventSet {
    bits: AtomicU32,
    wakeup: Notify,
}

impl EventSet {
    pub(crate) fn post(&self, events: u32) {
        self.bits.fetch_or(events, Ordering::AcqRel);
        self.wakeup.notify_one();
    }

    /// Takes every pending bit, leaving the set empty. Bits posted during
    /// a dispatch pass stay pending for the next one.
    pub(crate) fn drain(&self) -> u32 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    pub(crate) async fn posted(&self) {
        self.wakeup.notified().await;
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }
}
