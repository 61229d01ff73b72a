//! Async events from the mixer to the application.
//!
//! The mixer is the producer: it posts fixed-size events into a lock-free
//! SPSC ring and pokes a condition variable (without holding the lock, so
//! it never blocks). A dispatch thread on the API side drains the ring,
//! drops retired effect states, and forwards the rest to subscribers over
//! a channel. Delivery is at most once; when the ring is full the event is
//! dropped, which is survivable since state changes and disconnects are
//! derivable by polling.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::effects::EffectState;
use crate::ring::{ring_buffer, Consumer, Producer};

pub const EVENT_TYPE_SOURCE_STATE: u32 = 1 << 0;
pub const EVENT_TYPE_DISCONNECTED: u32 = 1 << 1;

/// Playback state carried by source state-change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Playing,
    Paused,
    Stopped,
}

/// Fixed-capacity message so the mixer can describe a disconnect without
/// touching the allocator.
#[derive(Clone, Copy)]
pub struct DisconnectMsg {
    buf: [u8; 160],
    len: usize,
}

impl DisconnectMsg {
    pub fn new(msg: &str) -> Self {
        let mut buf = [0u8; 160];
        let mut len = msg.len().min(buf.len());
        // Stay on a char boundary when truncating.
        while len > 0 && !msg.is_char_boundary(len) {
            len -= 1;
        }
        buf[..len].copy_from_slice(&msg.as_bytes()[..len]);
        Self { buf, len }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl fmt::Debug for DisconnectMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DisconnectMsg").field(&self.as_str()).finish()
    }
}

/// Internal event record moved through the ring.
pub enum AsyncEvent {
    SourceStateChange { id: u32, state: SourceState },
    /// An effect state retired by the mixer; the dispatch thread drops it
    /// so no destructor runs on the audio thread.
    ReleaseEffectState(Box<dyn EffectState>),
    Disconnected(DisconnectMsg),
}

/// Application-facing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrisonicEvent {
    SourceStateChange { source: u32, state: SourceState },
    Disconnected { message: String },
}

const EVENT_RING_CAPACITY: usize = 128;

struct Wakeup {
    flag: Mutex<bool>,
    cond: Condvar,
}

/// Mixer-side handle: post events and wake the dispatcher.
pub struct EventWriter {
    producer: Producer<AsyncEvent>,
    enabled: Arc<AtomicU32>,
    wakeup: Arc<Wakeup>,
}

impl EventWriter {
    pub fn enabled(&self, kind: u32) -> bool {
        self.enabled.load(Ordering::Acquire) & kind != 0
    }

    /// Post an event if there is room; a full ring drops it.
    pub fn post(&mut self, event: AsyncEvent) {
        if self.producer.push(event).is_err() {
            log::warn!("Event queue overflow, dropping event");
            return;
        }
        // Notifying without taking the lock keeps the mixer wait-free.
        self.wakeup.cond.notify_one();
    }

    /// Post, handing the event back instead of dropping it when the ring
    /// is full. For payloads that must not be destroyed on this thread.
    pub fn try_post(&mut self, event: AsyncEvent) -> std::result::Result<(), AsyncEvent> {
        self.producer.push(event)?;
        self.wakeup.cond.notify_one();
        Ok(())
    }

    pub fn post_source_stopped(&mut self, id: u32) {
        if self.enabled(EVENT_TYPE_SOURCE_STATE) {
            self.post(AsyncEvent::SourceStateChange {
                id,
                state: SourceState::Stopped,
            });
        }
    }
}

/// API-side handle: dispatch-loop state plus the subscription mask.
pub struct EventReader {
    consumer: Consumer<AsyncEvent>,
    enabled: Arc<AtomicU32>,
    wakeup: Arc<Wakeup>,
}

impl EventReader {
    pub fn set_enabled(&self, mask: u32) {
        self.enabled.store(mask, Ordering::Release);
    }

    /// Drain everything currently queued, converting to public events.
    /// Retired effect states are dropped here, on the calling thread.
    pub fn drain(&mut self, sink: &mut impl FnMut(IrisonicEvent)) {
        while let Some(event) = self.consumer.pop() {
            match event {
                AsyncEvent::SourceStateChange { id, state } => sink(IrisonicEvent::SourceStateChange {
                    source: id,
                    state,
                }),
                AsyncEvent::ReleaseEffectState(state) => drop(state),
                AsyncEvent::Disconnected(msg) => sink(IrisonicEvent::Disconnected {
                    message: msg.as_str().to_owned(),
                }),
            }
        }
    }

    /// Park until woken or `timeout` passes. Returns whether events are
    /// pending.
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        if self.consumer.read_space() > 0 {
            return true;
        }
        let guard = self
            .wakeup
            .flag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _unused = self
            .wakeup
            .cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.consumer.read_space() > 0
    }
}

/// Build the connected writer/reader pair.
pub fn event_queue() -> (EventWriter, EventReader) {
    let (producer, consumer) = ring_buffer(EVENT_RING_CAPACITY);
    let enabled = Arc::new(AtomicU32::new(
        EVENT_TYPE_SOURCE_STATE | EVENT_TYPE_DISCONNECTED,
    ));
    let wakeup = Arc::new(Wakeup {
        flag: Mutex::new(false),
        cond: Condvar::new(),
    });
    (
        EventWriter {
            producer,
            enabled: enabled.clone(),
            wakeup: wakeup.clone(),
        },
        EventReader {
            consumer,
            enabled,
            wakeup,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_change_round_trips() {
        let (mut writer, mut reader) = event_queue();
        writer.post_source_stopped(42);
        let mut seen = Vec::new();
        reader.drain(&mut |event| seen.push(event));
        assert_eq!(
            seen,
            vec![IrisonicEvent::SourceStateChange {
                source: 42,
                state: SourceState::Stopped,
            }]
        );
    }

    #[test]
    fn disabled_kinds_are_not_posted() {
        let (mut writer, mut reader) = event_queue();
        reader.set_enabled(EVENT_TYPE_DISCONNECTED);
        writer.post_source_stopped(7);
        let mut seen = Vec::new();
        reader.drain(&mut |event| seen.push(event));
        assert!(seen.is_empty());
    }

    #[test]
    fn disconnect_message_truncates_not_panics() {
        let long = "x".repeat(500);
        let msg = DisconnectMsg::new(&long);
        assert_eq!(msg.as_str().len(), 160);
    }

    #[test]
    fn overflow_drops_newest_quietly() {
        let (mut writer, mut reader) = event_queue();
        for i in 0..(EVENT_RING_CAPACITY as u32 + 16) {
            writer.post_source_stopped(i);
        }
        let mut count = 0usize;
        reader.drain(&mut |_| count += 1);
        assert_eq!(count, EVENT_RING_CAPACITY);
    }
}
