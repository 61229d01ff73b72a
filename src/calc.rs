//! Per-quantum parameter calculation.
//!
//! Turns a voice's latest property snapshot plus the listener and device
//! state into everything the mixer consumes: pan gains per output channel,
//! shelf filter coefficients, HRTF targets, near-field filter tuning, and
//! the fixed-point pitch step. Runs on the mixer thread at quantum start;
//! must not block or allocate.

use glam::{Mat4, Vec3, Vec4};

use crate::ambi::{
    calc_angle_coeffs, compute_pan_gains, scale_azimuth_front, BFChannelConfig, MAX_AMBI_COEFFS,
};
use crate::config::EngineConfig;
use crate::devformat::{Channel, RenderMode};
use crate::effects::SlotParams;
use crate::filters::{calc_rcp_q_from_slope, BiquadType, NfcFilter};
use crate::hrtf::HrtfStore;
use crate::math::{
    lerp, AIR_ABSORB_GAIN_HF, FRACTION_BITS, FRACTION_ONE, GAIN_MIX_MAX, MAX_PITCH,
    REVERB_DECAY_GAIN, SPEED_OF_SOUND_METERS_PER_SEC,
};
use crate::resample::{bsinc12_table, bsinc24_table, bsinc_prepare, Resampler};
use crate::source::{BufferFormat, DistanceModel, SourceProps, MAX_SENDS};
use crate::voice::{MixTarget, Voice, FILTER_HIGH_PASS, FILTER_LOW_PASS, MAX_OUTPUT_CHANNELS};

/// API-published listener placement.
#[derive(Debug, Clone)]
pub struct ListenerProps {
    pub position: Vec3,
    pub velocity: Vec3,
    pub orient_at: Vec3,
    pub orient_up: Vec3,
    pub gain: f32,
}

impl Default for ListenerProps {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            orient_at: Vec3::new(0.0, 0.0, -1.0),
            orient_up: Vec3::new(0.0, 1.0, 0.0),
            gain: 1.0,
        }
    }
}

/// API-published world-level parameters.
#[derive(Debug, Clone)]
pub struct WorldProps {
    pub meters_per_unit: f32,
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
    pub distance_model: DistanceModel,
    /// Let each source override the distance model.
    pub source_distance_model: bool,
}

impl Default for WorldProps {
    fn default() -> Self {
        Self {
            meters_per_unit: 1.0,
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
            speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            distance_model: DistanceModel::InverseClamped,
            source_distance_model: false,
        }
    }
}

/// Mixer-side digest of listener and world state, rebuilt from property
/// snapshots as they arrive.
#[derive(Debug, Clone)]
pub struct ListenerParams {
    pub matrix: Mat4,
    pub velocity: Vec3,
    pub gain: f32,
    pub meters_per_unit: f32,
    pub doppler_factor: f32,
    pub speed_of_sound: f32,
    pub reverb_speed_of_sound: f32,
    pub distance_model: DistanceModel,
    pub source_distance_model: bool,
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self {
            matrix: Mat4::IDENTITY,
            velocity: Vec3::ZERO,
            gain: 1.0,
            meters_per_unit: 1.0,
            doppler_factor: 1.0,
            speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            reverb_speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            distance_model: DistanceModel::InverseClamped,
            source_distance_model: false,
        }
    }
}

impl ListenerParams {
    /// Fold in world-level properties.
    pub fn apply_world(&mut self, props: &WorldProps, config: &EngineConfig) {
        self.meters_per_unit = props.meters_per_unit;
        self.doppler_factor = props.doppler_factor;
        self.speed_of_sound = props.speed_of_sound * props.doppler_velocity;
        if !config.override_reverb_speed_of_sound {
            self.reverb_speed_of_sound = self.speed_of_sound * self.meters_per_unit;
        } else {
            self.reverb_speed_of_sound = SPEED_OF_SOUND_METERS_PER_SEC;
        }
        self.distance_model = props.distance_model;
        self.source_distance_model = props.source_distance_model;
    }

    /// Fold in listener placement: orthonormalize at/up, derive the
    /// world-to-head matrix and head-space velocity.
    pub fn apply_listener(&mut self, props: &ListenerProps) {
        let n = props.orient_at.normalize_or_zero();
        let v = props.orient_up.normalize_or_zero();
        let u = n.cross(v).normalize_or_zero();

        let rotate = Mat4::from_cols(
            Vec4::new(u.x, v.x, -n.x, 0.0),
            Vec4::new(u.y, v.y, -n.y, 0.0),
            Vec4::new(u.z, v.z, -n.z, 0.0),
            Vec4::new(0.0, 0.0, 0.0, 1.0),
        );
        let p = rotate.transform_point3(props.position);
        self.matrix = rotate;
        self.matrix.w_axis = Vec4::new(-p.x, -p.y, -p.z, 1.0);
        self.velocity = self.matrix.transform_vector3(props.velocity);
        self.gain = props.gain;
    }
}

/// The slice of device state the calculator reads.
pub struct CalcDevice<'a> {
    pub frequency: u32,
    pub render_mode: RenderMode,
    /// Average speaker distance in meters; zero disables near-field
    /// control.
    pub avg_speaker_dist: f32,
    pub num_sends: usize,
    pub dry_map: &'a [BFChannelConfig],
    pub foa_map: &'a [BFChannelConfig],
    pub real_channels: &'a [Channel],
    pub channels_per_order: [usize; 4],
    pub hrtf: Option<&'a HrtfStore>,
}

/// A resolved send target for one voice send.
#[derive(Clone, Copy)]
pub struct SendTarget<'a> {
    pub slot: usize,
    pub params: &'a SlotParams,
    pub chan_map: &'a [BFChannelConfig],
}

struct ChanPos {
    channel: Channel,
    angle: f32,
    elevation: f32,
}

const fn chan(channel: Channel, angle_deg: f32) -> ChanPos {
    ChanPos {
        channel,
        angle: angle_deg * (std::f32::consts::PI / 180.0),
        elevation: 0.0,
    }
}

use Channel::*;

static MONO_MAP: [ChanPos; 1] = [chan(FrontCenter, 0.0)];
static REAR_MAP: [ChanPos; 2] = [chan(BackLeft, -150.0), chan(BackRight, 150.0)];
static QUAD_MAP: [ChanPos; 4] = [
    chan(FrontLeft, -45.0),
    chan(FrontRight, 45.0),
    chan(BackLeft, -135.0),
    chan(BackRight, 135.0),
];
static X51_MAP: [ChanPos; 6] = [
    chan(FrontLeft, -30.0),
    chan(FrontRight, 30.0),
    chan(FrontCenter, 0.0),
    chan(Lfe, 0.0),
    chan(SideLeft, -110.0),
    chan(SideRight, 110.0),
];
static X61_MAP: [ChanPos; 7] = [
    chan(FrontLeft, -30.0),
    chan(FrontRight, 30.0),
    chan(FrontCenter, 0.0),
    chan(Lfe, 0.0),
    chan(BackCenter, 180.0),
    chan(SideLeft, -90.0),
    chan(SideRight, 90.0),
];
static X71_MAP: [ChanPos; 8] = [
    chan(FrontLeft, -30.0),
    chan(FrontRight, 30.0),
    chan(FrontCenter, 0.0),
    chan(Lfe, 0.0),
    chan(BackLeft, -150.0),
    chan(BackRight, 150.0),
    chan(SideLeft, -90.0),
    chan(SideRight, 90.0),
];

fn pitch_step(buffer_hz: u32, device_hz: u32, pitch: f32) -> u32 {
    let pitch = buffer_hz as f32 / device_hz as f32 * pitch;
    if pitch > MAX_PITCH as f32 {
        MAX_PITCH << FRACTION_BITS
    } else {
        ((pitch * FRACTION_ONE as f32) as u32).max(1)
    }
}

fn prepare_resampler(voice: &mut Voice) {
    voice.resampler = voice.props.resampler;
    match voice.resampler {
        Resampler::BSinc24 => voice.bsinc = bsinc_prepare(voice.step, bsinc24_table()),
        Resampler::BSinc12 => voice.bsinc = bsinc_prepare(voice.step, bsinc12_table()),
        _ => {}
    }
}

/// Recompute a voice's mixing parameters from its current snapshot.
/// `format` and `buffer_hz` describe the first buffer in its queue;
/// `sends` holds the resolved send targets (None entries feed nothing).
pub fn calc_source_params(
    voice: &mut Voice,
    format: BufferFormat,
    buffer_hz: u32,
    listener: &ListenerParams,
    device: &CalcDevice<'_>,
    sends: &[Option<SendTarget<'_>>],
    config: &EngineConfig,
) {
    let spatialize = match voice.props.spatialize {
        crate::source::SpatializeMode::On => true,
        crate::source::SpatializeMode::Off => false,
        crate::source::SpatializeMode::Auto => format == BufferFormat::Mono,
    };
    if spatialize {
        calc_attenuated_params(voice, format, buffer_hz, listener, device, sends, config);
    } else {
        calc_direct_params(voice, format, buffer_hz, listener, device, sends, config);
    }
}

/// Non-spatialized path: gains from the property block only, no distance
/// or orientation involvement.
fn calc_direct_params(
    voice: &mut Voice,
    format: BufferFormat,
    buffer_hz: u32,
    listener: &ListenerParams,
    device: &CalcDevice<'_>,
    sends: &[Option<SendTarget<'_>>],
    config: &EngineConfig,
) {
    voice.step = pitch_step(buffer_hz, device.frequency, voice.props.pitch);
    prepare_resampler(voice);

    let props = &voice.props;
    let mut dry_gain = props.gain.clamp(props.min_gain, props.max_gain);
    dry_gain = (dry_gain * props.direct.gain * listener.gain).min(GAIN_MIX_MAX);
    let dry_gain_hf = props.direct.gain_hf;
    let dry_gain_lf = props.direct.gain_lf;

    let mut wet_gain = [0.0f32; MAX_SENDS];
    let mut wet_gain_hf = [1.0f32; MAX_SENDS];
    let mut wet_gain_lf = [1.0f32; MAX_SENDS];
    for i in 0..device.num_sends.min(MAX_SENDS) {
        let gain = props.gain.clamp(props.min_gain, props.max_gain);
        wet_gain[i] = (gain * props.sends[i].gain * listener.gain).min(GAIN_MIX_MAX);
        wet_gain_hf[i] = props.sends[i].gain_hf;
        wet_gain_lf[i] = props.sends[i].gain_lf;
    }

    calc_panning_and_filters(
        voice,
        &PanInput {
            azimuth: 0.0,
            elevation: 0.0,
            distance: 0.0,
            spread: 0.0,
            dry_gain,
            dry_gain_hf,
            dry_gain_lf,
            wet_gain,
            wet_gain_hf,
            wet_gain_lf,
            format,
        },
        listener,
        device,
        sends,
        config,
    );
}

/// Spatialized path: distance, cone, Doppler, air absorption and send
/// decay, then panning.
fn calc_attenuated_params(
    voice: &mut Voice,
    format: BufferFormat,
    buffer_hz: u32,
    listener: &ListenerParams,
    device: &CalcDevice<'_>,
    sends: &[Option<SendTarget<'_>>],
    config: &EngineConfig,
) {
    let num_sends = device.num_sends.min(MAX_SENDS);

    // Decay parameters per send, from the slot state.
    let mut room_rolloff = [0.0f32; MAX_SENDS];
    let mut decay_distance = [0.0f32; MAX_SENDS];
    let mut decay_lf_distance = [0.0f32; MAX_SENDS];
    let mut decay_hf_distance = [0.0f32; MAX_SENDS];
    for i in 0..num_sends {
        match sends.get(i).copied().flatten() {
            Some(target) if target.params.aux_send_auto => {
                room_rolloff[i] =
                    target.params.room_rolloff + voice.props.room_rolloff_factor;
                // Where this effect's decay reaches -60dB.
                decay_distance[i] = target.params.decay_time * listener.reverb_speed_of_sound;
                decay_lf_distance[i] = decay_distance[i] * target.params.decay_lf_ratio;
                decay_hf_distance[i] = decay_distance[i] * target.params.decay_hf_ratio;
                if target.params.decay_hf_limit {
                    let air_absorption = target.params.air_absorption_gain_hf;
                    if air_absorption < 1.0 {
                        // Don't let the HF decay outlast what the air
                        // itself would allow.
                        let absorb_dist = REVERB_DECAY_GAIN.log10() / air_absorption.log10();
                        decay_hf_distance[i] = absorb_dist.min(decay_hf_distance[i]);
                    }
                }
            }
            Some(_) => {
                // Send auto off: the wet path attenuates like the dry one.
                room_rolloff[i] = voice.props.rolloff_factor;
            }
            None => {}
        }
    }

    // Transform the source into head space.
    let props = &voice.props;
    let mut position = props.position;
    let mut velocity = props.velocity;
    let mut direction = props.direction;
    if !props.head_relative {
        position = listener.matrix.transform_point3(position);
        velocity = listener.matrix.transform_vector3(velocity);
        direction = listener.matrix.transform_vector3(direction);
    } else {
        velocity += listener.velocity;
    }

    let directional = direction.length_squared() > 0.0;
    if directional {
        direction = direction.normalize();
    }
    let distance = position.length();
    let to_listener = if distance > 0.0 {
        -position / distance
    } else {
        Vec3::ZERO
    };

    let mut dry_gain = props.gain;
    let mut dry_gain_hf = 1.0f32;
    let mut dry_gain_lf = 1.0f32;
    let mut wet_gain = [0.0f32; MAX_SENDS];
    let mut wet_gain_hf = [1.0f32; MAX_SENDS];
    let mut wet_gain_lf = [1.0f32; MAX_SENDS];
    for item in wet_gain.iter_mut().take(num_sends) {
        *item = props.gain;
    }

    // Distance attenuation.
    let model = if listener.source_distance_model {
        props.distance_model.unwrap_or(listener.distance_model)
    } else {
        listener.distance_model
    };
    let mut clamped_dist = distance;
    match model {
        DistanceModel::InverseClamped | DistanceModel::Inverse => {
            let mut skip = false;
            if model == DistanceModel::InverseClamped {
                clamped_dist = clamped_dist.max(props.ref_distance).min(props.max_distance);
                skip = props.max_distance < props.ref_distance;
            }
            if !skip {
                if props.ref_distance <= 0.0 {
                    clamped_dist = props.ref_distance;
                } else {
                    let dist = lerp(props.ref_distance, clamped_dist, props.rolloff_factor);
                    if dist > 0.0 {
                        dry_gain *= props.ref_distance / dist;
                    }
                    for i in 0..num_sends {
                        let dist = lerp(props.ref_distance, clamped_dist, room_rolloff[i]);
                        if dist > 0.0 {
                            wet_gain[i] *= props.ref_distance / dist;
                        }
                    }
                }
            }
        }
        DistanceModel::LinearClamped | DistanceModel::Linear => {
            let mut skip = false;
            if model == DistanceModel::LinearClamped {
                clamped_dist = clamped_dist.max(props.ref_distance).min(props.max_distance);
                skip = props.max_distance < props.ref_distance;
            }
            if !skip {
                if props.max_distance == props.ref_distance {
                    clamped_dist = props.ref_distance;
                } else {
                    let span = props.max_distance - props.ref_distance;
                    let attn =
                        props.rolloff_factor * (clamped_dist - props.ref_distance) / span;
                    dry_gain *= (1.0 - attn).max(0.0);
                    for i in 0..num_sends {
                        let attn = room_rolloff[i] * (clamped_dist - props.ref_distance) / span;
                        wet_gain[i] *= (1.0 - attn).max(0.0);
                    }
                }
            }
        }
        DistanceModel::ExponentClamped | DistanceModel::Exponent => {
            let mut skip = false;
            if model == DistanceModel::ExponentClamped {
                clamped_dist = clamped_dist.max(props.ref_distance).min(props.max_distance);
                skip = props.max_distance < props.ref_distance;
            }
            if !skip {
                if clamped_dist <= 0.0 || props.ref_distance <= 0.0 {
                    clamped_dist = props.ref_distance;
                } else {
                    let ratio = clamped_dist / props.ref_distance;
                    dry_gain *= ratio.powf(-props.rolloff_factor);
                    for i in 0..num_sends {
                        wet_gain[i] *= ratio.powf(-room_rolloff[i]);
                    }
                }
            }
        }
        DistanceModel::Disable => {
            clamped_dist = props.ref_distance;
        }
    }

    // Directional cone.
    if directional && props.inner_angle < 360.0 {
        let angle = (direction.dot(to_listener).clamp(-1.0, 1.0).acos()
            * config.cone_scale
            * 2.0)
            .to_degrees();

        let (cone_volume, cone_hf) = if angle <= props.inner_angle {
            (1.0, 1.0)
        } else if angle < props.outer_angle {
            let scale = (angle - props.inner_angle) / (props.outer_angle - props.inner_angle);
            (
                lerp(1.0, props.outer_gain, scale),
                lerp(1.0, props.outer_gain_hf, scale),
            )
        } else {
            (props.outer_gain, props.outer_gain_hf)
        };

        dry_gain *= cone_volume;
        if props.dry_gain_hf_auto {
            dry_gain_hf *= cone_hf;
        }
        if props.wet_gain_auto {
            for gain in wet_gain.iter_mut().take(num_sends) {
                *gain *= cone_volume;
            }
        }
        if props.wet_gain_hf_auto {
            for gain in wet_gain_hf.iter_mut().take(num_sends) {
                *gain *= cone_hf;
            }
        }
    }

    // Gain stage and filter settings.
    dry_gain = dry_gain.clamp(props.min_gain, props.max_gain);
    dry_gain = (dry_gain * props.direct.gain * listener.gain).min(GAIN_MIX_MAX);
    dry_gain_hf *= props.direct.gain_hf;
    dry_gain_lf *= props.direct.gain_lf;
    for i in 0..num_sends {
        wet_gain[i] = wet_gain[i].clamp(props.min_gain, props.max_gain);
        wet_gain[i] = (wet_gain[i] * props.sends[i].gain * listener.gain).min(GAIN_MIX_MAX);
        wet_gain_hf[i] *= props.sends[i].gain_hf;
        wet_gain_lf[i] *= props.sends[i].gain_lf;
    }

    // Distance-based air absorption and initial send decay.
    if clamped_dist > props.ref_distance && props.rolloff_factor > 0.0 {
        let meters_base =
            (clamped_dist - props.ref_distance) * props.rolloff_factor * listener.meters_per_unit;
        if props.air_absorption_factor > 0.0 {
            let hf_attn =
                AIR_ABSORB_GAIN_HF.powf(meters_base * props.air_absorption_factor);
            dry_gain_hf *= hf_attn;
            for gain in wet_gain_hf.iter_mut().take(num_sends) {
                *gain *= hf_attn;
            }
        }

        if props.wet_gain_auto {
            // Apply the effect's own distance decay to the wet path so the
            // reverb starts at the level it would have decayed to over the
            // travel distance. The HF/LF shaping rides along under the
            // same flag as the base decay.
            for i in 0..num_sends {
                if decay_distance[i] <= 0.0 {
                    continue;
                }
                let gain = REVERB_DECAY_GAIN.powf(meters_base / decay_distance[i]);
                wet_gain[i] *= gain;
                if gain > 0.0 {
                    let gain_hf = REVERB_DECAY_GAIN.powf(meters_base / decay_hf_distance[i]);
                    wet_gain_hf[i] *= (gain_hf / gain).min(1.0);
                    let gain_lf = REVERB_DECAY_GAIN.powf(meters_base / decay_lf_distance[i]);
                    wet_gain_lf[i] *= (gain_lf / gain).min(1.0);
                }
            }
        }
    }

    // Doppler shift.
    let mut pitch = props.pitch;
    let doppler = props.doppler_factor * listener.doppler_factor;
    if doppler > 0.0 {
        let vss = velocity.dot(to_listener) * doppler;
        let vls = listener.velocity.dot(to_listener) * doppler;
        let c = listener.speed_of_sound;
        if vls >= c {
            // The listener outruns the sound entirely.
            pitch = 0.0;
        } else if vss >= c {
            // Waves bunch up to an unbounded frequency; the step clamp
            // bounds it.
            pitch = f32::INFINITY;
        } else {
            pitch *= (c - vls) / (c - vss);
        }
    }

    voice.step = if pitch == 0.0 {
        0
    } else {
        pitch_step(buffer_hz, device.frequency, pitch)
    };

    let (mut azimuth, mut elevation) = (0.0f32, 0.0f32);
    if distance > 0.0 {
        // Guard asin against rounding pushing the component out of range.
        elevation = (-to_listener.y).clamp(-1.0, 1.0).asin();
        // One negation flips source-to-listener to listener-to-source,
        // the other matches right-handed coordinates with -Z ahead.
        azimuth = (-to_listener.x).atan2(to_listener.z * config.z_scale);
    }

    let spread = if props.radius > distance {
        std::f32::consts::TAU - distance / props.radius * std::f32::consts::PI
    } else if distance > 0.0 {
        (props.radius / distance).asin() * 2.0
    } else {
        0.0
    };

    prepare_resampler(voice);

    calc_panning_and_filters(
        voice,
        &PanInput {
            azimuth,
            elevation,
            distance,
            spread,
            dry_gain,
            dry_gain_hf,
            dry_gain_lf,
            wet_gain,
            wet_gain_hf,
            wet_gain_lf,
            format,
        },
        listener,
        device,
        sends,
        config,
    );
}

struct PanInput {
    azimuth: f32,
    elevation: f32,
    distance: f32,
    spread: f32,
    dry_gain: f32,
    dry_gain_hf: f32,
    dry_gain_lf: f32,
    wet_gain: [f32; MAX_SENDS],
    wet_gain_hf: [f32; MAX_SENDS],
    wet_gain_lf: [f32; MAX_SENDS],
    format: BufferFormat,
}

fn nfc_w0(device: &CalcDevice<'_>, distance_meters: f32) -> f32 {
    // Clamp very close sources so the proximity boost stays sane.
    let dist = distance_meters.max(device.avg_speaker_dist / 4.0);
    SPEED_OF_SOUND_METERS_PER_SEC / (dist * device.frequency as f32)
}

fn adjust_nfc(voice: &mut Voice, device: &CalcDevice<'_>, num_channels: usize, w0: f32) {
    let w1 = SPEED_OF_SOUND_METERS_PER_SEC
        / (device.avg_speaker_dist * device.frequency as f32);
    for chan in voice.direct.params.iter_mut().take(num_channels) {
        if chan.nfc.control_w() != w1 {
            chan.nfc = NfcFilter::new(w1);
        }
        chan.nfc.adjust(w0);
    }
}

fn calc_panning_and_filters(
    voice: &mut Voice,
    pan: &PanInput,
    listener: &ListenerParams,
    device: &CalcDevice<'_>,
    sends: &[Option<SendTarget<'_>>],
    config: &EngineConfig,
) {
    let num_sends = device.num_sends.min(MAX_SENDS);
    let props = voice.props.clone();

    let stereo_map = [
        // Stored counter-clockwise; panning uses clockwise angles.
        chan(FrontLeft, 0.0),
        chan(FrontRight, 0.0),
    ];
    let mut stereo_map = stereo_map;
    stereo_map[0].angle = -props.stereo_pan.0;
    stereo_map[1].angle = -props.stereo_pan.1;

    let mut direct_channels = props.direct_channels;
    let mut downmix_gain = 1.0f32;
    let is_bformat = pan.format.is_bformat();
    let chans: &[ChanPos] = match pan.format {
        BufferFormat::Mono => {
            // Mono content never plays channel-direct.
            direct_channels = false;
            &MONO_MAP
        }
        BufferFormat::Stereo => {
            downmix_gain = 1.0 / 2.0;
            &stereo_map
        }
        BufferFormat::Rear => {
            downmix_gain = 1.0 / 2.0;
            &REAR_MAP
        }
        BufferFormat::Quad => {
            downmix_gain = 1.0 / 4.0;
            &QUAD_MAP
        }
        BufferFormat::X51 => {
            // Excludes LFE.
            downmix_gain = 1.0 / 5.0;
            &X51_MAP
        }
        BufferFormat::X61 => {
            downmix_gain = 1.0 / 6.0;
            &X61_MAP
        }
        BufferFormat::X71 => {
            downmix_gain = 1.0 / 7.0;
            &X71_MAP
        }
        BufferFormat::BFormat2D | BufferFormat::BFormat3D => {
            direct_channels = false;
            &[]
        }
    };
    let num_channels = if is_bformat {
        pan.format.channels()
    } else {
        chans.len()
    };

    // Start every target from silence; stale gains must not linger.
    for chan_params in voice.direct.params.iter_mut().take(num_channels.max(1)) {
        chan_params.hrtf.target = Default::default();
        chan_params.gains.target = [0.0; MAX_OUTPUT_CHANNELS];
    }
    for send in voice.sends.iter_mut().take(num_sends) {
        for chan_params in send.params.iter_mut().take(num_channels.max(1)) {
            chan_params.gains.target = [0.0; MAX_OUTPUT_CHANNELS];
        }
    }

    voice.has_hrtf = false;
    voice.has_nfc = false;
    voice.direct.channel_count = num_channels;
    for (send, resolved) in voice.sends.iter_mut().zip(sends.iter()).take(num_sends) {
        send.channel_count = num_channels;
        send.slot = resolved.map(|target| target.slot);
    }

    if is_bformat {
        if pan.distance > f32::EPSILON {
            // Panning B-format toward a direction: pan W as a mono sound
            // and silence X/Y/Z in this branch.
            if device.avg_speaker_dist > 0.0 {
                let mdist = pan.distance * listener.meters_per_unit;
                let w0 = nfc_w0(device, mdist);
                adjust_nfc(voice, device, 1, w0);
                voice.direct.channels_per_order = device.channels_per_order;
                voice.has_nfc = true;
            }

            // Render to the first-order bus so panned and unpanned states
            // transition smoothly.
            voice.direct.target = MixTarget::Foa;

            let azimuth = if device.render_mode == RenderMode::StereoPair {
                scale_azimuth_front(pan.azimuth, 1.5)
            } else {
                pan.azimuth
            };
            let coeffs = calc_angle_coeffs(azimuth, pan.elevation, pan.spread);

            // W carries FuMa scaling that the N3D bus has to make up.
            let scale0 = crate::ambi::scale::FROM_FUMA[0];
            compute_pan_gains(
                device.foa_map,
                &coeffs,
                pan.dry_gain * scale0,
                &mut voice.direct.params[0].gains.target,
            );
            for (i, send) in voice.sends.iter_mut().enumerate().take(num_sends) {
                if let Some(target) = sends[i] {
                    compute_pan_gains(
                        target.chan_map,
                        &coeffs,
                        pan.wet_gain[i] * scale0,
                        &mut send.params[0].gains.target,
                    );
                }
            }
        } else {
            if device.avg_speaker_dist > 0.0 {
                // A local B-format source is first-order input; only W and
                // the three first-order channels carry signal.
                adjust_nfc(voice, device, 1, 0.0);
                voice.direct.channels_per_order = [1, (num_channels - 1).min(3), 0, 0];
                voice.has_nfc = true;
            }

            // Rotate XYZ by the source orientation, in head space.
            let (mut n, mut v) = (
                props.orientation.0.normalize_or_zero(),
                props.orientation.1.normalize_or_zero(),
            );
            if !props.head_relative {
                n = listener.matrix.transform_vector3(n);
                v = listener.matrix.transform_vector3(v);
            }
            let u = n.cross(v).normalize_or_zero();

            // Rotation combined with FuMa-to-ACN/N3D conversion. Inputs
            // align on rows, bus channels on columns.
            let s = &crate::ambi::scale::FROM_FUMA;
            let rows: [[f32; 4]; 4] = [
                [s[0], 0.0, 0.0, 0.0],
                [0.0, -n.x * s[1], n.y * s[2], -n.z * s[3]],
                [0.0, u.x * s[1], -u.y * s[2], u.z * s[3]],
                [0.0, -v.x * s[1], v.y * s[2], -v.z * s[3]],
            ];

            voice.direct.target = MixTarget::Foa;
            for c in 0..num_channels {
                let mut coeffs = [0.0f32; MAX_AMBI_COEFFS];
                coeffs[..4].copy_from_slice(&rows[c]);
                compute_pan_gains(
                    device.foa_map,
                    &coeffs,
                    pan.dry_gain,
                    &mut voice.direct.params[c].gains.target,
                );
                for (i, send) in voice.sends.iter_mut().enumerate().take(num_sends) {
                    if let Some(target) = sends[i] {
                        compute_pan_gains(
                            target.chan_map,
                            &coeffs,
                            pan.wet_gain[i],
                            &mut send.params[c].gains.target,
                        );
                    }
                }
            }
        }
    } else if direct_channels {
        // Channel-direct: inputs feed the matching real outputs, skipping
        // the virtual bus entirely.
        voice.direct.target = MixTarget::Real;
        for (c, chan_pos) in chans.iter().enumerate() {
            if let Some(idx) = device
                .real_channels
                .iter()
                .position(|&have| have == chan_pos.channel)
            {
                voice.direct.params[c].gains.target[idx] = pan.dry_gain;
            }
        }

        // Sends still pan normally; B-format buses can't channel-match.
        for (c, chan_pos) in chans.iter().enumerate() {
            let coeffs = calc_angle_coeffs(chan_pos.angle, chan_pos.elevation, 0.0);
            for (i, send) in voice.sends.iter_mut().enumerate().take(num_sends) {
                if let Some(target) = sends[i] {
                    compute_pan_gains(
                        target.chan_map,
                        &coeffs,
                        pan.wet_gain[i],
                        &mut send.params[c].gains.target,
                    );
                }
            }
        }
    } else if device.render_mode == RenderMode::Hrtf {
        // Full binaural rendering to the real outputs.
        voice.direct.target = MixTarget::Real;
        if let Some(hrtf) = device.hrtf {
            if pan.distance > f32::EPSILON {
                // One response for the source direction, shared by every
                // input channel.
                let mut target = crate::voice::HrtfFilter::default();
                hrtf.get_coeffs(
                    pan.elevation,
                    pan.azimuth,
                    pan.spread,
                    &mut target.coeffs,
                    &mut target.delays,
                );
                target.gain = pan.dry_gain * downmix_gain;
                voice.direct.params[0].hrtf.target = target;
                for c in 1..num_channels {
                    if chans[c].channel != Lfe {
                        voice.direct.params[c].hrtf.target = target;
                    }
                }

                let coeffs = calc_angle_coeffs(pan.azimuth, pan.elevation, pan.spread);
                for (i, send) in voice.sends.iter_mut().enumerate().take(num_sends) {
                    if let Some(send_target) = sends[i] {
                        for c in 0..num_channels {
                            if !chans.is_empty() && chans[c].channel == Lfe {
                                continue;
                            }
                            compute_pan_gains(
                                send_target.chan_map,
                                &coeffs,
                                pan.wet_gain[i] * downmix_gain,
                                &mut send.params[c].gains.target,
                            );
                        }
                    }
                }
            } else {
                // Local sources pan each channel to its own position as a
                // virtual speaker response.
                for (c, chan_pos) in chans.iter().enumerate() {
                    if chan_pos.channel == Lfe {
                        continue;
                    }
                    let hrtf_state = &mut voice.direct.params[c].hrtf;
                    hrtf.get_coeffs(
                        chan_pos.elevation,
                        chan_pos.angle,
                        pan.spread,
                        &mut hrtf_state.target.coeffs,
                        &mut hrtf_state.target.delays,
                    );
                    hrtf_state.target.gain = pan.dry_gain;

                    let coeffs = calc_angle_coeffs(chan_pos.angle, chan_pos.elevation, pan.spread);
                    for (i, send) in voice.sends.iter_mut().enumerate().take(num_sends) {
                        if let Some(send_target) = sends[i] {
                            compute_pan_gains(
                                send_target.chan_map,
                                &coeffs,
                                pan.wet_gain[i],
                                &mut send.params[c].gains.target,
                            );
                        }
                    }
                }
            }
        }
        voice.has_hrtf = true;
    } else {
        // Ambisonic panning into the dry bus.
        voice.direct.target = MixTarget::Dry;
        if pan.distance > f32::EPSILON {
            if device.avg_speaker_dist > 0.0 {
                let mdist = pan.distance * listener.meters_per_unit;
                let w0 = nfc_w0(device, mdist);
                adjust_nfc(voice, device, num_channels, w0);
                voice.direct.channels_per_order = device.channels_per_order;
                voice.has_nfc = true;
            }

            let azimuth = if device.render_mode == RenderMode::StereoPair {
                scale_azimuth_front(pan.azimuth, 1.5)
            } else {
                pan.azimuth
            };
            let coeffs = calc_angle_coeffs(azimuth, pan.elevation, pan.spread);

            for (c, chan_pos) in chans.iter().enumerate() {
                if chan_pos.channel == Lfe {
                    continue;
                }
                compute_pan_gains(
                    device.dry_map,
                    &coeffs,
                    pan.dry_gain * downmix_gain,
                    &mut voice.direct.params[c].gains.target,
                );
            }
            for (i, send) in voice.sends.iter_mut().enumerate().take(num_sends) {
                if let Some(target) = sends[i] {
                    for (c, chan_pos) in chans.iter().enumerate() {
                        if chan_pos.channel == Lfe {
                            continue;
                        }
                        compute_pan_gains(
                            target.chan_map,
                            &coeffs,
                            pan.wet_gain[i] * downmix_gain,
                            &mut send.params[c].gains.target,
                        );
                    }
                }
            }
        } else {
            if device.avg_speaker_dist > 0.0 {
                // Zero distance: run the filters as pass-through so their
                // history stays valid for when the source moves away.
                let w0 = SPEED_OF_SOUND_METERS_PER_SEC
                    / (device.avg_speaker_dist * device.frequency as f32);
                adjust_nfc(voice, device, num_channels, w0);
                voice.direct.channels_per_order = device.channels_per_order;
                voice.has_nfc = true;
            }

            for (c, chan_pos) in chans.iter().enumerate() {
                if chan_pos.channel == Lfe {
                    continue;
                }
                let angle = if device.render_mode == RenderMode::StereoPair {
                    scale_azimuth_front(chan_pos.angle, 3.0)
                } else {
                    chan_pos.angle
                };
                let coeffs = calc_angle_coeffs(angle, chan_pos.elevation, pan.spread);

                compute_pan_gains(
                    device.dry_map,
                    &coeffs,
                    pan.dry_gain,
                    &mut voice.direct.params[c].gains.target,
                );
                for (i, send) in voice.sends.iter_mut().enumerate().take(num_sends) {
                    if let Some(target) = sends[i] {
                        compute_pan_gains(
                            target.chan_map,
                            &coeffs,
                            pan.wet_gain[i],
                            &mut send.params[c].gains.target,
                        );
                    }
                }
            }
        }
    }

    // Shelf filters, shared coefficients across a voice's channels.
    let frequency = device.frequency as f32;
    {
        let hf_norm = props.direct.hf_reference / frequency;
        let lf_norm = props.direct.lf_reference / frequency;
        let gain_hf = pan.dry_gain_hf.max(0.001); // -60dB floor
        let gain_lf = pan.dry_gain_lf.max(0.001);

        voice.direct.filter_mask = 0;
        if gain_hf != 1.0 {
            voice.direct.filter_mask |= FILTER_LOW_PASS;
        }
        if gain_lf != 1.0 {
            voice.direct.filter_mask |= FILTER_HIGH_PASS;
        }
        voice.direct.params[0].low_pass.set_params(
            BiquadType::HighShelf,
            gain_hf,
            hf_norm,
            calc_rcp_q_from_slope(gain_hf, 1.0),
        );
        voice.direct.params[0].high_pass.set_params(
            BiquadType::LowShelf,
            gain_lf,
            lf_norm,
            calc_rcp_q_from_slope(gain_lf, 1.0),
        );
        let (first, rest) = voice.direct.params.split_first_mut().unwrap();
        for chan_params in rest.iter_mut().take(num_channels.saturating_sub(1)) {
            chan_params.low_pass.copy_params_from(&first.low_pass);
            chan_params.high_pass.copy_params_from(&first.high_pass);
        }
    }
    for i in 0..num_sends {
        let hf_norm = props.sends[i].hf_reference / frequency;
        let lf_norm = props.sends[i].lf_reference / frequency;
        let gain_hf = pan.wet_gain_hf[i].max(0.001);
        let gain_lf = pan.wet_gain_lf[i].max(0.001);

        let send = &mut voice.sends[i];
        send.filter_mask = 0;
        if gain_hf != 1.0 {
            send.filter_mask |= FILTER_LOW_PASS;
        }
        if gain_lf != 1.0 {
            send.filter_mask |= FILTER_HIGH_PASS;
        }
        send.params[0].low_pass.set_params(
            BiquadType::HighShelf,
            gain_hf,
            hf_norm,
            calc_rcp_q_from_slope(gain_hf, 1.0),
        );
        send.params[0].high_pass.set_params(
            BiquadType::LowShelf,
            gain_lf,
            lf_norm,
            calc_rcp_q_from_slope(gain_lf, 1.0),
        );
        let (first, rest) = send.params.split_first_mut().unwrap();
        for chan_params in rest.iter_mut().take(num_channels.saturating_sub(1)) {
            chan_params.low_pass.copy_params_from(&first.low_pass);
            chan_params.high_pass.copy_params_from(&first.high_pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambi::BFChannelConfig;
    use crate::math::assert_close;
    use crate::source::SourceProps;
    use crate::voice::VoicePool;

    fn dry_map() -> Vec<BFChannelConfig> {
        (0..4).map(|acn| BFChannelConfig::new(1.0, acn)).collect()
    }

    fn device<'a>(maps: &'a (Vec<BFChannelConfig>, Vec<Channel>)) -> CalcDevice<'a> {
        CalcDevice {
            frequency: 44100,
            render_mode: RenderMode::Normal,
            avg_speaker_dist: 0.0,
            num_sends: 0,
            dry_map: &maps.0,
            foa_map: &maps.0,
            real_channels: &maps.1,
            channels_per_order: [1, 3, 0, 0],
            hrtf: None,
        }
    }

    fn calc(voice: &mut Voice, device: &CalcDevice<'_>, listener: &ListenerParams) {
        calc_source_params(
            voice,
            BufferFormat::Mono,
            44100,
            listener,
            device,
            &[None; MAX_SENDS],
            &EngineConfig::default(),
        );
    }

    fn voice_with(props: SourceProps) -> (VoicePool, usize) {
        let pool = VoicePool::new(1, 0);
        let index = pool.allocate().unwrap();
        pool.slot(index).inner.lock().unwrap().prepare(Vec::new(), props);
        (pool, index)
    }

    fn total_target_gain(voice: &Voice) -> f32 {
        voice.direct.params[0]
            .gains
            .target
            .iter()
            .map(|g| g.abs())
            .sum()
    }

    #[test]
    fn inverse_distance_quarters_gain_at_four_units() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(0.0, 0.0, -4.0);
        props.ref_distance = 1.0;
        props.rolloff_factor = 1.0;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let listener = ListenerParams::default();
        calc(&mut voice, &device, &listener);
        // W gain carries the attenuated source gain.
        assert_close(voice.direct.params[0].gains.target[0], 0.25, 1e-5);
    }

    #[test]
    fn doppler_approaching_source_raises_pitch() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(10.0, 0.0, 0.0);
        props.velocity = Vec3::new(-100.0, 0.0, 0.0);
        props.distance_model = None;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let listener = ListenerParams::default();
        calc(&mut voice, &device, &listener);
        let expected = 343.3 / (343.3 - 100.0);
        let step = voice.step as f32 / FRACTION_ONE as f32;
        assert_close(step, expected, 2e-3);
    }

    #[test]
    fn listener_outrunning_sound_silences_pitch() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(10.0, 0.0, 0.0);
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let mut listener = ListenerParams::default();
        // Moving away from the source faster than sound.
        listener.velocity = Vec3::new(-400.0, 0.0, 0.0);
        calc(&mut voice, &device, &listener);
        assert_eq!(voice.step, 0);
    }

    #[test]
    fn source_at_speed_of_sound_clamps_step() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(10.0, 0.0, 0.0);
        props.velocity = Vec3::new(-400.0, 0.0, 0.0);
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let listener = ListenerParams::default();
        calc(&mut voice, &device, &listener);
        assert_eq!(voice.step, MAX_PITCH << FRACTION_BITS);
    }

    #[test]
    fn zero_distance_with_radius_yields_finite_gains() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::ZERO;
        props.radius = 2.0;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let listener = ListenerParams::default();
        calc(&mut voice, &device, &listener);
        for &gain in &voice.direct.params[0].gains.target {
            assert!(gain.is_finite());
        }
    }

    #[test]
    fn gain_targets_respect_mix_ceiling() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.gain = 100.0;
        props.max_gain = 100.0;
        props.position = Vec3::new(0.0, 0.0, -0.01);
        props.ref_distance = 1.0;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let listener = ListenerParams::default();
        calc(&mut voice, &device, &listener);
        // The source gain is capped at the mix ceiling; the projection
        // coefficients can scale a channel by at most the first-order
        // normalization on a mono source.
        for &gain in &voice.direct.params[0].gains.target {
            assert!(gain.abs() <= GAIN_MIX_MAX * 1.7321);
        }
        assert!(total_target_gain(&voice) > 0.0);
    }

    #[test]
    fn cone_outer_gain_applies_behind_source() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(0.0, 0.0, -2.0);
        // Source faces away from the listener with a tight cone.
        props.direction = Vec3::new(0.0, 0.0, -1.0);
        props.inner_angle = 30.0;
        props.outer_angle = 60.0;
        props.outer_gain = 0.25;
        props.distance_model = None;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let mut listener = ListenerParams::default();
        listener.distance_model = DistanceModel::Disable;
        calc(&mut voice, &device, &listener);
        assert_close(voice.direct.params[0].gains.target[0], 0.25, 1e-5);
    }

    #[test]
    fn cone_inside_inner_angle_is_unattenuated() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(0.0, 0.0, -2.0);
        // Facing the listener head on.
        props.direction = Vec3::new(0.0, 0.0, 1.0);
        props.inner_angle = 90.0;
        props.outer_angle = 180.0;
        props.outer_gain = 0.0;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let mut listener = ListenerParams::default();
        listener.distance_model = DistanceModel::Disable;
        calc(&mut voice, &device, &listener);
        assert_close(voice.direct.params[0].gains.target[0], 1.0, 1e-5);
    }

    #[test]
    fn cone_interpolates_between_inner_and_outer() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(0.0, 0.0, -2.0);
        // Facing sideways puts the listener at 180 degrees of cone angle,
        // the midpoint of a 0..360 cone.
        props.direction = Vec3::new(1.0, 0.0, 0.0);
        props.inner_angle = 0.0;
        props.outer_angle = 360.0;
        props.outer_gain = 0.5;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let mut listener = ListenerParams::default();
        listener.distance_model = DistanceModel::Disable;
        calc(&mut voice, &device, &listener);
        assert_close(voice.direct.params[0].gains.target[0], 0.75, 1e-5);
    }

    #[test]
    fn linear_model_reaches_zero_at_max_distance() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(0.0, 0.0, -8.0);
        props.ref_distance = 1.0;
        props.max_distance = 8.0;
        props.rolloff_factor = 1.0;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let mut listener = ListenerParams::default();
        listener.distance_model = DistanceModel::LinearClamped;
        calc(&mut voice, &device, &listener);
        assert_close(total_target_gain(&voice), 0.0, 1e-6);
    }

    #[test]
    fn max_below_ref_disables_clamped_attenuation() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        let mut props = SourceProps::default();
        props.position = Vec3::new(0.0, 0.0, -50.0);
        props.ref_distance = 4.0;
        props.max_distance = 2.0;
        props.rolloff_factor = 1.0;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        let listener = ListenerParams::default();
        calc(&mut voice, &device, &listener);
        // No attenuation: W target carries the full gain.
        assert_close(voice.direct.params[0].gains.target[0], 1.0, 1e-5);
    }

    #[test]
    fn listener_transform_pans_relative_to_orientation() {
        let maps = (dry_map(), vec![Channel::FrontLeft, Channel::FrontRight]);
        let device = device(&maps);
        // Listener faces +X; a source on +X is dead ahead.
        let mut listener_params = ListenerParams::default();
        listener_params.apply_listener(&ListenerProps {
            orient_at: Vec3::X,
            ..Default::default()
        });
        let mut props = SourceProps::default();
        props.position = Vec3::new(2.0, 0.0, 0.0);
        props.distance_model = None;
        let (pool, index) = voice_with(props);
        let mut voice = pool.slot(index).inner.lock().unwrap();
        calc(&mut voice, &device, &listener_params);
        // Dead ahead: no lateral (ACN1) component.
        assert_close(voice.direct.params[0].gains.target[1], 0.0, 1e-5);
        assert!(voice.direct.params[0].gains.target[3] > 0.0);
    }
}
