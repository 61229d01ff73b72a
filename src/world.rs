//! The API-side scene: buffers, sources, listener, and effect slots.
//!
//! A `World` is the application's handle onto one context of a device.
//! It owns the buffer registry and per-source bookkeeping on the calling
//! thread, and talks to the mixer exclusively through lock-free property
//! publication and the voice pool atomics, so nothing here can stall a
//! render quantum. Events flow back through a dispatch thread that drains
//! the mixer's queue and forwards them over a channel.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use uuid::Uuid;

use crate::calc::{ListenerProps, WorldProps};
use crate::context::{ContextShared, NO_SLOT};
use crate::device::Device;
use crate::effects::{validate_routing, EffectProps, EffectSlotProps, EffectState, SlotId};
use crate::error::{IrisonicError, Result};
use crate::events::{EventReader, IrisonicEvent, SourceState};
use crate::source::{AudioBuffer, SourceProps};

pub type SourceId = u32;

struct SourceEntry {
    props: SourceProps,
    queue: Vec<Arc<AudioBuffer>>,
    voice: Option<usize>,
    state: SourceState,
}

/// Central scene object; create one per device context.
pub struct World {
    device: Arc<Device>,
    shared: Arc<ContextShared>,
    buffers: HashMap<Uuid, Arc<AudioBuffer>>,
    sources: HashMap<SourceId, SourceEntry>,
    next_source: SourceId,
    slot_targets: Vec<Option<SlotId>>,
    events_rx: Receiver<IrisonicEvent>,
    dispatch: Option<JoinHandle<()>>,
    dispatch_stop: Arc<std::sync::atomic::AtomicBool>,
}

impl World {
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        Self::with_voices(device, 64)
    }

    /// Create a world with a bounded voice pool of `voice_count` entries.
    pub fn with_voices(device: &Arc<Device>, voice_count: usize) -> Result<Self> {
        if voice_count == 0 {
            return Err(IrisonicError::InvalidParameter(
                "voice pool cannot be empty".into(),
            ));
        }
        let (shared, reader) = ContextShared::new(voice_count, device.num_sends());
        device.register_context(shared.clone());

        let (events_tx, events_rx) = unbounded();
        let dispatch_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let dispatch = spawn_dispatch(reader, events_tx, dispatch_stop.clone());

        Ok(Self {
            device: device.clone(),
            shared,
            buffers: HashMap::new(),
            sources: HashMap::new(),
            next_source: 1,
            slot_targets: Vec::new(),
            events_rx,
            dispatch: Some(dispatch),
            dispatch_stop,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Receiver for mixer events; clone it to listen from other threads.
    pub fn events(&self) -> Receiver<IrisonicEvent> {
        self.events_rx.clone()
    }

    // -- Buffers ---------------------------------------------------------

    /// Register PCM data, returning its handle.
    pub fn add_buffer(&mut self, buffer: Arc<AudioBuffer>) -> Uuid {
        let id = Uuid::new_v4();
        self.buffers.insert(id, buffer);
        id
    }

    pub fn buffer(&self, id: Uuid) -> Option<&Arc<AudioBuffer>> {
        self.buffers.get(&id)
    }

    /// Drop a buffer from the registry. Playing voices keep their
    /// reference until they finish.
    pub fn remove_buffer(&mut self, id: Uuid) -> Option<Arc<AudioBuffer>> {
        self.buffers.remove(&id)
    }

    // -- World and listener ----------------------------------------------

    pub fn set_world_props(&self, props: WorldProps) {
        let mut block = self.shared.world_pool.acquire(|| props.clone());
        block.props = props;
        if let Some(stale) = self.shared.world_update.publish(block) {
            self.shared.world_pool.recycle(stale);
        }
    }

    pub fn set_listener(&self, props: ListenerProps) {
        let mut block = self.shared.listener_pool.acquire(|| props.clone());
        block.props = props;
        if let Some(stale) = self.shared.listener_update.publish(block) {
            self.shared.listener_pool.recycle(stale);
        }
    }

    /// Defer all parameter recomputation until [`World::process_updates`].
    /// Published updates queue up meanwhile; only the latest per entity
    /// survives.
    pub fn defer_updates(&self) {
        self.shared.hold_updates.store(true, Ordering::Release);
    }

    /// Resume applying updates at the next quantum.
    pub fn process_updates(&self) {
        self.shared.hold_updates.store(false, Ordering::Release);
    }

    // -- Effect slots ----------------------------------------------------

    /// Create an auxiliary effect slot. The slot starts as a null effect.
    pub fn create_effect_slot(&mut self) -> SlotId {
        let channels = 4usize;
        let mut slots = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = slots.len();
        slots.push(Arc::new(crate::context::SlotShared::new(channels)));
        self.slot_targets.push(None);
        id
    }

    /// Publish new slot properties. Target routing is validated against
    /// the current graph; a cycle is rejected and nothing changes.
    pub fn set_slot_props(
        &mut self,
        slot: SlotId,
        gain: f32,
        aux_send_auto: bool,
        target: Option<SlotId>,
        props: EffectProps,
        state: Option<Box<dyn EffectState>>,
    ) -> Result<()> {
        if slot >= self.slot_targets.len() {
            return Err(IrisonicError::InvalidParameter(format!(
                "unknown effect slot {slot}"
            )));
        }
        if !(0.0..=1.0).contains(&gain) {
            return Err(IrisonicError::InvalidParameter(format!(
                "slot gain {gain} out of range"
            )));
        }
        validate_routing(slot, target, &self.slot_targets)?;
        self.slot_targets[slot] = target;

        let slots = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut block = self.shared.slot_pool.acquire(EffectSlotProps::default);
        block.props = EffectSlotProps {
            gain,
            aux_send_auto,
            target,
            props,
            state,
        };
        if let Some(stale) = slots[slot].update.publish(block) {
            self.shared.slot_pool.recycle(stale);
        }
        Ok(())
    }

    /// Route send 0 of sources that name no slot to this one.
    pub fn set_default_slot(&self, slot: Option<SlotId>) {
        self.shared
            .default_slot
            .store(slot.unwrap_or(NO_SLOT), Ordering::Release);
    }

    // -- Sources ---------------------------------------------------------

    pub fn create_source(&mut self) -> SourceId {
        let id = self.next_source;
        self.next_source += 1;
        self.sources.insert(
            id,
            SourceEntry {
                props: SourceProps::default(),
                queue: Vec::new(),
                voice: None,
                state: SourceState::Stopped,
            },
        );
        id
    }

    pub fn destroy_source(&mut self, id: SourceId) {
        self.stop(id).ok();
        self.sources.remove(&id);
    }

    /// Append a buffer to the source's play queue. Rejected while the
    /// source is playing.
    pub fn queue_buffer(&mut self, id: SourceId, buffer: Uuid) -> Result<()> {
        let data = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| {
                IrisonicError::InvalidParameter(format!("unknown buffer {buffer}"))
            })?
            .clone();
        let entry = self.source_entry_mut(id)?;
        if entry.state == SourceState::Playing {
            return Err(IrisonicError::InvalidParameter(
                "cannot requeue a playing source".into(),
            ));
        }
        if let Some(first) = entry.queue.first() {
            if first.format() != data.format() || first.frequency() != data.frequency() {
                return Err(IrisonicError::AudioFormat(
                    "queued buffers must share format and sample rate".into(),
                ));
            }
        }
        entry.queue.push(data);
        Ok(())
    }

    pub fn clear_queue(&mut self, id: SourceId) -> Result<()> {
        let entry = self.source_entry_mut(id)?;
        if entry.state == SourceState::Playing {
            return Err(IrisonicError::InvalidParameter(
                "cannot clear the queue of a playing source".into(),
            ));
        }
        entry.queue.clear();
        Ok(())
    }

    /// Update a source's mixing properties. For a playing source the
    /// snapshot is published to the mixer; it applies at the next quantum.
    pub fn set_source_props(&mut self, id: SourceId, props: SourceProps) -> Result<()> {
        props.validate()?;
        let shared = self.shared.clone();
        let entry = self.source_entry_mut(id)?;
        entry.props = props.clone();
        if let Some(index) = entry.voice {
            let slot = shared.voices.slot(index);
            if slot.source_id.load(Ordering::Acquire) == id {
                let mut block = shared.source_pool.acquire(SourceProps::default);
                block.props = props;
                if let Some(stale) = slot.update.publish(block) {
                    shared.source_pool.recycle(stale);
                }
            }
        }
        Ok(())
    }

    pub fn source_props(&self, id: SourceId) -> Option<&SourceProps> {
        self.sources.get(&id).map(|entry| &entry.props)
    }

    /// Source state as this side knows it, reconciling voices the mixer
    /// already retired.
    pub fn source_state(&mut self, id: SourceId) -> Option<SourceState> {
        let shared = self.shared.clone();
        let entry = self.sources.get_mut(&id)?;
        if let Some(index) = entry.voice {
            let slot = shared.voices.slot(index);
            if slot.source_id.load(Ordering::Acquire) != id {
                entry.voice = None;
                if entry.state == SourceState::Playing {
                    entry.state = SourceState::Stopped;
                }
            }
        }
        Some(entry.state)
    }

    /// Start playback: claim a voice from the pool (stealing the oldest
    /// playing one when dry), seed it, and hand it to the mixer.
    pub fn play(&mut self, id: SourceId) -> Result<()> {
        let entry = self
            .sources
            .get(&id)
            .ok_or_else(|| IrisonicError::InvalidParameter(format!("unknown source {id}")))?;
        if entry.queue.is_empty() {
            return Err(IrisonicError::InvalidParameter(
                "source has no queued buffers".into(),
            ));
        }
        if entry.state == SourceState::Playing {
            return Ok(());
        }
        let queue = entry.queue.clone();
        let props = entry.props.clone();

        let index = match self.shared.voices.allocate() {
            Some(index) => index,
            None => self
                .steal_voice()
                .ok_or_else(|| IrisonicError::ResourceExhausted("voice pool exhausted".into()))?,
        };

        let slot = self.shared.voices.slot(index);
        {
            // Waits out at most one in-flight mix of the previous owner.
            let mut voice = slot
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            voice.prepare(queue, props.clone());
        }
        let mut block = self.shared.source_pool.acquire(SourceProps::default);
        block.props = props;
        if let Some(stale) = slot.update.publish(block) {
            self.shared.source_pool.recycle(stale);
        }
        self.shared.voices.stamp(index);
        slot.source_id.store(id, Ordering::Relaxed);
        slot.playing.store(true, Ordering::Release);

        let entry = self.sources.get_mut(&id).expect("checked above");
        entry.voice = Some(index);
        entry.state = SourceState::Playing;
        log::debug!("Source {id} playing on voice {index}");
        Ok(())
    }

    /// Retire the oldest playing voice and reuse its slot.
    fn steal_voice(&mut self) -> Option<usize> {
        let index = self.shared.voices.oldest_playing()?;
        let slot = self.shared.voices.slot(index);
        let sid = slot.source_id.swap(0, Ordering::AcqRel);
        if sid == 0 {
            // The mixer retired it first; its release will surface in the
            // pool shortly.
            return self.shared.voices.allocate();
        }
        slot.playing.store(false, Ordering::Release);
        log::debug!("Stole voice {index} from source {sid}");
        if let Some(entry) = self.sources.get_mut(&sid) {
            entry.voice = None;
            entry.state = SourceState::Stopped;
        }
        Some(index)
    }

    /// Pause playback, keeping the voice and its position.
    pub fn pause(&mut self, id: SourceId) -> Result<()> {
        let shared = self.shared.clone();
        let entry = self.source_entry_mut(id)?;
        if entry.state != SourceState::Playing {
            return Ok(());
        }
        if let Some(index) = entry.voice {
            let slot = shared.voices.slot(index);
            if slot.source_id.load(Ordering::Acquire) == id {
                slot.playing.store(false, Ordering::Release);
            }
        }
        entry.state = SourceState::Paused;
        Ok(())
    }

    /// Resume a paused source.
    pub fn resume(&mut self, id: SourceId) -> Result<()> {
        let shared = self.shared.clone();
        let entry = self.source_entry_mut(id)?;
        if entry.state != SourceState::Paused {
            return Ok(());
        }
        if let Some(index) = entry.voice {
            let slot = shared.voices.slot(index);
            if slot.source_id.load(Ordering::Acquire) == id {
                slot.playing.store(true, Ordering::Release);
                entry.state = SourceState::Playing;
                return Ok(());
            }
            entry.voice = None;
        }
        // The voice was reclaimed while paused; restart from the top.
        self.play(id)
    }

    /// Stop playback and release the voice.
    pub fn stop(&mut self, id: SourceId) -> Result<()> {
        let shared = self.shared.clone();
        let entry = self.source_entry_mut(id)?;
        if let Some(index) = entry.voice.take() {
            let slot = shared.voices.slot(index);
            // Whoever zeroes the source id owns the release.
            if slot.source_id.swap(0, Ordering::AcqRel) == id {
                slot.playing.store(false, Ordering::Release);
                shared.voices.release(index);
            }
        }
        entry.state = SourceState::Stopped;
        Ok(())
    }

    fn source_entry_mut(&mut self, id: SourceId) -> Result<&mut SourceEntry> {
        self.sources
            .get_mut(&id)
            .ok_or_else(|| IrisonicError::InvalidParameter(format!("unknown source {id}")))
    }
}

impl Drop for World {
    fn drop(&mut self) {
        // Silence our voices before the context goes away.
        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in ids {
            self.stop(id).ok();
        }
        self.device.unregister_context(&self.shared);
        self.dispatch_stop.store(true, Ordering::Release);
        if let Some(handle) = self.dispatch.take() {
            handle.join().ok();
        }
    }
}

fn spawn_dispatch(
    mut reader: EventReader,
    sender: Sender<IrisonicEvent>,
    stop: Arc<std::sync::atomic::AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("irisonic-events".into())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                reader.wait(Duration::from_millis(50));
                reader.drain(&mut |event| {
                    let _ = sender.send(event);
                });
            }
            // Final sweep so retired effect states are freed.
            reader.drain(&mut |event| {
                let _ = sender.send(event);
            });
        })
        .expect("spawn event dispatch thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceDesc;
    use crate::source::BufferFormat;

    fn world() -> World {
        let device = Device::new(DeviceDesc::default()).unwrap();
        World::new(&device).unwrap()
    }

    fn tone(frames: usize) -> Arc<AudioBuffer> {
        let data: Vec<f32> = (0..frames).map(|i| (i as f32 * 0.1).sin()).collect();
        AudioBuffer::new(data, BufferFormat::Mono, 44100).unwrap()
    }

    #[test]
    fn play_binds_a_voice() {
        let mut world = world();
        let buffer = world.add_buffer(tone(512));
        let source = world.create_source();
        world.queue_buffer(source, buffer).unwrap();
        world.play(source).unwrap();
        assert_eq!(world.source_state(source), Some(SourceState::Playing));
    }

    #[test]
    fn play_without_buffers_fails() {
        let mut world = world();
        let source = world.create_source();
        assert!(world.play(source).is_err());
    }

    #[test]
    fn mismatched_queue_formats_rejected() {
        let mut world = world();
        let mono = world.add_buffer(tone(64));
        let stereo = world.add_buffer(
            AudioBuffer::new(vec![0.0; 128], BufferFormat::Stereo, 44100).unwrap(),
        );
        let source = world.create_source();
        world.queue_buffer(source, mono).unwrap();
        assert!(world.queue_buffer(source, stereo).is_err());
    }

    #[test]
    fn pool_exhaustion_steals_oldest() {
        let device = Device::new(DeviceDesc::default()).unwrap();
        let mut world = World::with_voices(&device, 2).unwrap();
        let buffer = world.add_buffer(tone(4096));
        let mut sources = Vec::new();
        for _ in 0..3 {
            let source = world.create_source();
            world.queue_buffer(source, buffer).unwrap();
            world.play(source).unwrap();
            sources.push(source);
        }
        // All three play; the first was robbed of its voice.
        assert_eq!(world.source_state(sources[0]), Some(SourceState::Stopped));
        assert_eq!(world.source_state(sources[1]), Some(SourceState::Playing));
        assert_eq!(world.source_state(sources[2]), Some(SourceState::Playing));
    }

    #[test]
    fn stop_releases_the_voice() {
        let device = Device::new(DeviceDesc::default()).unwrap();
        let mut world = World::with_voices(&device, 1).unwrap();
        let buffer = world.add_buffer(tone(4096));
        let source = world.create_source();
        world.queue_buffer(source, buffer).unwrap();
        world.play(source).unwrap();
        world.stop(source).unwrap();
        // The pool has its only voice back.
        let again = world.create_source();
        world.queue_buffer(again, buffer).unwrap();
        world.play(again).unwrap();
    }

    #[test]
    fn cyclic_slot_routing_is_rejected() {
        let mut world = world();
        let a = world.create_effect_slot();
        let b = world.create_effect_slot();
        world
            .set_slot_props(a, 1.0, true, Some(b), EffectProps::Null, None)
            .unwrap();
        let err = world.set_slot_props(b, 1.0, true, Some(a), EffectProps::Null, None);
        assert!(err.is_err());
    }

    #[test]
    fn slot_gain_out_of_range_is_rejected() {
        let mut world = world();
        let slot = world.create_effect_slot();
        assert!(world
            .set_slot_props(slot, 1.5, true, None, EffectProps::Null, None)
            .is_err());
    }

    #[test]
    fn source_props_validation_guards_publish() {
        let mut world = world();
        let source = world.create_source();
        let mut props = SourceProps::default();
        props.gain = -1.0;
        assert!(world.set_source_props(source, props).is_err());
    }

    #[test]
    fn pause_resume_round_trip() {
        let mut world = world();
        let buffer = world.add_buffer(tone(4096));
        let source = world.create_source();
        world.queue_buffer(source, buffer).unwrap();
        world.play(source).unwrap();
        world.pause(source).unwrap();
        assert_eq!(world.source_state(source), Some(SourceState::Paused));
        world.resume(source).unwrap();
        assert_eq!(world.source_state(source), Some(SourceState::Playing));
    }
}
