//! Engine-wide configuration and device descriptors.

use crate::bformatdec::DecoderPreset;
use crate::devformat::{AmbiLayout, AmbiNorm, ChannelLayout, SampleType};

fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(val) => {
            let val = val.trim();
            val.eq_ignore_ascii_case("true") || val.parse::<i64>().map(|v| v == 1).unwrap_or(false)
        }
        Err(_) => false,
    }
}

/// Process-wide tuning loaded from the environment once at engine creation.
///
/// These values are captured when the config is built and copied into the
/// listener parameter snapshots; they are never re-read on the audio thread.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Scale applied to source cone angles. `IRISONIC_HALF_ANGLE_CONES`
    /// (truthy) halves the effective angle, treating the configured angles
    /// as half-angles.
    pub cone_scale: f32,
    /// Z scale for mono source localization. `IRISONIC_REVERSE_Z` (truthy)
    /// flips the front/back axis.
    pub z_scale: f32,
    /// `IRISONIC_REVERB_IGNORES_SOUND_SPEED` (truthy) pins the reverb decay
    /// distance to the default speed of sound instead of the listener's.
    pub override_reverb_speed_of_sound: bool,
    /// Apply the sqrt(2) W-channel boost in the UHJ encoder. The reference
    /// literature is split on whether this scaling belongs in the encoding;
    /// off matches the Gerzon formulation.
    pub uhj_w_boost: bool,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cone_scale = 1.0;
        if env_truthy("IRISONIC_HALF_ANGLE_CONES") {
            cone_scale *= 0.5;
        }
        let mut z_scale = 1.0;
        if env_truthy("IRISONIC_REVERSE_Z") {
            z_scale *= -1.0;
        }
        Self {
            cone_scale,
            z_scale,
            override_reverb_speed_of_sound: env_truthy("IRISONIC_REVERB_IGNORES_SOUND_SPEED"),
            uhj_w_boost: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cone_scale: 1.0,
            z_scale: 1.0,
            override_reverb_speed_of_sound: false,
            uhj_w_boost: false,
        }
    }
}

/// Stereo rendering flavor for non-HRTF stereo devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoMode {
    /// Plain amplitude panning over the ±30 degree speaker pair. Azimuths
    /// are widened 1.5x so hard left/right reach the speakers.
    Pair,
    /// Binaural rendering through the device HRTF.
    Hrtf,
    /// Stereo-compatible UHJ encoding of the first-order mix.
    Uhj,
}

/// Output device description.
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub layout: ChannelLayout,
    pub sample_type: SampleType,
    /// Output sample rate in Hz.
    pub frequency: u32,
    /// Frames rendered per update (one render quantum per update).
    pub update_size: usize,
    pub num_updates: usize,
    /// Number of auxiliary sends per voice, clamped to `MAX_SENDS`.
    pub num_aux_sends: usize,
    pub stereo_mode: StereoMode,
    /// Crossfeed strength for `Bs2b` post-processing, 1..=6. 0 disables.
    pub bs2b_level: u8,
    /// Ambisonic channel layout for `ChannelLayout::Ambi3D` output.
    pub ambi_layout: AmbiLayout,
    /// Ambisonic normalization for `ChannelLayout::Ambi3D` output.
    pub ambi_norm: AmbiNorm,
    /// Ambisonic order for `ChannelLayout::Ambi3D` output, 0..=3.
    pub ambi_order: u8,
    /// Custom speaker decoder; a rejected preset falls back to the
    /// built-in matrix for the layout.
    pub decoder_preset: Option<DecoderPreset>,
    /// Run the output limiter ahead of quantization.
    pub limiter: bool,
    /// Re-anchor the front image through the center speaker on surround
    /// layouts.
    pub front_stabilizer: bool,
    /// Near-field reference delay in seconds for `Ambi3D` output; 0
    /// disables distance correction filters.
    pub nfc_ref_delay: f32,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            layout: ChannelLayout::Stereo,
            sample_type: SampleType::F32,
            frequency: 44100,
            update_size: 512,
            num_updates: 3,
            num_aux_sends: 2,
            stereo_mode: StereoMode::Pair,
            bs2b_level: 0,
            ambi_layout: AmbiLayout::Acn,
            ambi_norm: AmbiNorm::N3D,
            ambi_order: 1,
            decoder_preset: None,
            limiter: true,
            front_stabilizer: false,
            nfc_ref_delay: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_neutral() {
        let config = EngineConfig::default();
        assert_eq!(config.cone_scale, 1.0);
        assert_eq!(config.z_scale, 1.0);
        assert!(!config.override_reverb_speed_of_sound);
        assert!(!config.uhj_w_boost);
    }
}
