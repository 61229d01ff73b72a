//! State shared between a world handle and the device mixer.
//!
//! The world (API side) and the render quantum communicate through this
//! structure: lock-free update slots for property snapshots, the bounded
//! voice pool, the effect slot list, and the async event queue. The
//! `mix` mutex guards state only the mixer thread touches; API threads
//! never take it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::calc::{ListenerParams, ListenerProps, WorldProps};
use crate::effects::{EffectProps, EffectSlotProps, SlotId, SlotMixState};
use crate::events::{event_queue, EventReader, EventWriter};
use crate::source::SourceProps;
use crate::update::{PropsPool, UpdateSlot};
use crate::voice::VoicePool;

/// Sentinel for "no default slot".
pub const NO_SLOT: usize = usize::MAX;

/// One auxiliary effect slot as shared between sides.
pub struct SlotShared {
    pub update: UpdateSlot<EffectSlotProps>,
    pub mix: Mutex<SlotMixState>,
}

impl SlotShared {
    pub fn new(num_channels: usize) -> Self {
        Self {
            update: UpdateSlot::new(),
            mix: Mutex::new(SlotMixState::new(num_channels)),
        }
    }
}

/// Mixer-thread-only context state.
pub struct ContextMix {
    pub listener: ListenerParams,
    pub events: EventWriter,
    /// Scratch for the per-quantum effect slot ordering.
    pub sorted_slots: Vec<SlotId>,
    pub slot_targets: Vec<Option<SlotId>>,
    /// Retained copies of each slot's effect props, for re-running state
    /// updates when the listener or world changes.
    pub slot_props: Vec<EffectProps>,
}

pub struct ContextShared {
    pub world_update: UpdateSlot<WorldProps>,
    pub listener_update: UpdateSlot<ListenerProps>,
    pub world_pool: PropsPool<WorldProps>,
    pub listener_pool: PropsPool<ListenerProps>,
    pub source_pool: PropsPool<SourceProps>,
    pub slot_pool: PropsPool<EffectSlotProps>,
    pub voices: VoicePool,
    pub slots: Mutex<Vec<Arc<SlotShared>>>,
    /// While set, the mixer skips all parameter recomputation for this
    /// context; pending updates stay queued.
    pub hold_updates: AtomicBool,
    /// Incremented entering and leaving parameter processing; odd while
    /// updates are being applied.
    pub update_count: AtomicU32,
    /// Slot receiving send 0 when a source names none; `NO_SLOT` for
    /// nothing.
    pub default_slot: AtomicUsize,
    pub mix: Mutex<ContextMix>,
}

impl ContextShared {
    pub fn new(voice_count: usize, num_sends: usize) -> (Arc<Self>, EventReader) {
        let (writer, reader) = event_queue();
        let shared = Arc::new(Self {
            world_update: UpdateSlot::new(),
            listener_update: UpdateSlot::new(),
            world_pool: PropsPool::new(),
            listener_pool: PropsPool::new(),
            source_pool: PropsPool::new(),
            slot_pool: PropsPool::new(),
            voices: VoicePool::new(voice_count, num_sends),
            slots: Mutex::new(Vec::new()),
            hold_updates: AtomicBool::new(false),
            update_count: AtomicU32::new(0),
            default_slot: AtomicUsize::new(NO_SLOT),
            mix: Mutex::new(ContextMix {
                listener: ListenerParams::default(),
                events: writer,
                sorted_slots: Vec::new(),
                slot_targets: Vec::new(),
                slot_props: Vec::new(),
            }),
        });
        (shared, reader)
    }

    pub fn default_slot(&self) -> Option<SlotId> {
        match self.default_slot.load(Ordering::Acquire) {
            NO_SLOT => None,
            id => Some(id),
        }
    }
}
