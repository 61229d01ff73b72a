//! Auxiliary effect slots and the effect-state seam.
//!
//! Effect DSP itself lives behind the [`EffectState`] trait; the pipeline
//! only clears wet buses, orders slots so producers run before the slots
//! they feed, and invokes `process`. Slot routing forms a DAG: a cycle is
//! rejected when the routing is published, and the mixer's topological
//! ordering relies on that.

use crate::ambi::BFChannelConfig;
use crate::error::{IrisonicError, Result};
use crate::math::BUFFER_SIZE;

pub type SlotId = usize;

/// Reverb-shaped parameters the wet path derives distance decay from.
#[derive(Debug, Clone, Copy)]
pub struct ReverbProps {
    pub gain: f32,
    pub decay_time: f32,
    pub decay_hf_ratio: f32,
    pub decay_lf_ratio: f32,
    pub decay_hf_limit: bool,
    pub air_absorption_gain_hf: f32,
    pub room_rolloff_factor: f32,
}

impl Default for ReverbProps {
    fn default() -> Self {
        Self {
            gain: 0.32,
            decay_time: 1.49,
            decay_hf_ratio: 0.83,
            decay_lf_ratio: 1.0,
            decay_hf_limit: true,
            air_absorption_gain_hf: 0.994,
            room_rolloff_factor: 0.0,
        }
    }
}

/// Parameters for whatever effect a slot hosts.
#[derive(Debug, Clone, Copy)]
pub enum EffectProps {
    Null,
    Reverb(ReverbProps),
}

impl EffectProps {
    pub fn is_null(&self) -> bool {
        matches!(self, EffectProps::Null)
    }
}

/// Where a slot's effect writes its output.
pub struct EffectTarget<'a> {
    /// Main ambisonic bus channel map (or the target slot's map).
    pub ambi_map: &'a [BFChannelConfig],
}

/// The capability set the pipeline manipulates an effect through. `update`
/// runs on the mixer thread when slot properties change; `process` runs
/// every quantum. Neither may block or allocate.
pub trait EffectState: Send {
    fn update(&mut self, slot_gain: f32, props: &EffectProps, target: &EffectTarget<'_>);
    fn process(&mut self, frames: usize, wet_in: &[Vec<f32>], output: &mut [Vec<f32>]);
}

/// The stock do-nothing effect.
pub struct NullEffect;

impl EffectState for NullEffect {
    fn update(&mut self, _slot_gain: f32, _props: &EffectProps, _target: &EffectTarget<'_>) {}
    fn process(&mut self, _frames: usize, _wet_in: &[Vec<f32>], _output: &mut [Vec<f32>]) {}
}

/// Feeds the wet input straight to the output scaled by the slot gain.
/// Stands in for real effect DSP in tests and as a wet-path monitor.
pub struct PassthroughEffect {
    gain: f32,
}

impl PassthroughEffect {
    pub fn new() -> Self {
        Self { gain: 1.0 }
    }
}

impl Default for PassthroughEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectState for PassthroughEffect {
    fn update(&mut self, slot_gain: f32, props: &EffectProps, _target: &EffectTarget<'_>) {
        let effect_gain = match props {
            EffectProps::Null => 1.0,
            EffectProps::Reverb(reverb) => reverb.gain,
        };
        self.gain = slot_gain * effect_gain;
    }

    fn process(&mut self, frames: usize, wet_in: &[Vec<f32>], output: &mut [Vec<f32>]) {
        for (out, input) in output.iter_mut().zip(wet_in.iter()) {
            for (out_sample, &in_sample) in out.iter_mut().take(frames).zip(input.iter()) {
                *out_sample += in_sample * self.gain;
            }
        }
    }
}

/// API-published slot property snapshot.
pub struct EffectSlotProps {
    pub gain: f32,
    pub aux_send_auto: bool,
    pub target: Option<SlotId>,
    pub props: EffectProps,
    /// A fresh state when the hosted effect changes; `None` keeps the
    /// current one. Also doubles as the parking spot for a retired state
    /// when the event queue is too full to carry it out.
    pub state: Option<Box<dyn EffectState>>,
}

impl Default for EffectSlotProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            aux_send_auto: true,
            target: None,
            props: EffectProps::Null,
            state: None,
        }
    }
}

/// Mixer-side digest of slot properties, consumed by the parameter
/// calculator each quantum.
#[derive(Debug, Clone, Copy)]
pub struct SlotParams {
    pub gain: f32,
    pub aux_send_auto: bool,
    pub target: Option<SlotId>,
    pub is_null: bool,
    pub room_rolloff: f32,
    pub decay_time: f32,
    pub decay_lf_ratio: f32,
    pub decay_hf_ratio: f32,
    pub decay_hf_limit: bool,
    pub air_absorption_gain_hf: f32,
}

impl Default for SlotParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            aux_send_auto: true,
            target: None,
            is_null: true,
            room_rolloff: 0.0,
            decay_time: 0.0,
            decay_lf_ratio: 0.0,
            decay_hf_ratio: 0.0,
            decay_hf_limit: false,
            air_absorption_gain_hf: 1.0,
        }
    }
}

impl SlotParams {
    pub fn digest(props: &EffectSlotProps) -> Self {
        let mut params = Self {
            gain: props.gain,
            aux_send_auto: props.aux_send_auto,
            target: props.target,
            is_null: props.props.is_null(),
            ..Self::default()
        };
        if let EffectProps::Reverb(reverb) = props.props {
            params.room_rolloff = reverb.room_rolloff_factor;
            params.decay_time = reverb.decay_time;
            params.decay_lf_ratio = reverb.decay_lf_ratio;
            params.decay_hf_ratio = reverb.decay_hf_ratio;
            params.decay_hf_limit = reverb.decay_hf_limit;
            params.air_absorption_gain_hf = reverb.air_absorption_gain_hf;
        }
        params
    }
}

/// Mixer-owned slot state: the wet bus the voices feed and the effect that
/// drains it.
pub struct SlotMixState {
    pub params: SlotParams,
    pub chan_map: Vec<BFChannelConfig>,
    pub wet_buffer: Vec<Vec<f32>>,
    pub state: Box<dyn EffectState>,
}

impl SlotMixState {
    pub fn new(num_channels: usize) -> Self {
        let chan_map = (0..num_channels)
            .map(|acn| BFChannelConfig::new(1.0, acn))
            .collect();
        Self {
            params: SlotParams::default(),
            chan_map,
            wet_buffer: vec![vec![0.0f32; BUFFER_SIZE]; num_channels],
            state: Box::new(NullEffect),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.wet_buffer.len()
    }

    pub fn clear_wet_buffer(&mut self, frames: usize) {
        for chan in &mut self.wet_buffer {
            chan[..frames].fill(0.0);
        }
    }
}

/// Check that pointing `slot` at `new_target` keeps the routing acyclic.
/// `targets[i]` holds the current target of slot `i`.
pub fn validate_routing(
    slot: SlotId,
    new_target: Option<SlotId>,
    targets: &[Option<SlotId>],
) -> Result<()> {
    let mut hop = new_target;
    let mut steps = 0usize;
    while let Some(next) = hop {
        if next == slot {
            return Err(IrisonicError::EffectRouting(format!(
                "slot {slot} target chain loops back onto itself"
            )));
        }
        if next >= targets.len() {
            return Err(IrisonicError::EffectRouting(format!(
                "slot {slot} targets unknown slot {next}"
            )));
        }
        hop = targets[next];
        steps += 1;
        if steps > targets.len() {
            return Err(IrisonicError::EffectRouting(
                "slot target chain does not terminate".into(),
            ));
        }
    }
    Ok(())
}

/// Order slot ids so every slot comes before any slot it targets,
/// directly or transitively. `targets[i]` is slot `i`'s routing target.
/// Relies on the routing being acyclic.
pub fn sort_slots(order: &mut Vec<SlotId>, targets: &[Option<SlotId>]) {
    order.clear();
    order.extend(0..targets.len());

    // Insertion pass: place each slot ahead of the first already-placed
    // slot it feeds into.
    let in_chain = |mut from: SlotId, to: SlotId| -> bool {
        let mut steps = 0usize;
        while let Some(next) = targets[from] {
            if next == to {
                return true;
            }
            from = next;
            steps += 1;
            if steps > targets.len() {
                break;
            }
        }
        false
    };

    let mut sorted: Vec<SlotId> = Vec::with_capacity(targets.len());
    for &slot in order.iter() {
        let at = sorted
            .iter()
            .position(|&placed| in_chain(slot, placed))
            .unwrap_or(sorted.len());
        sorted.insert(at, slot);
    }
    order.clear();
    order.extend(sorted);
}
