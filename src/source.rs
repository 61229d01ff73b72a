//! API-side source description: PCM buffers and the property snapshot the
//! mixer consumes.

use std::sync::Arc;

use glam::Vec3;

use crate::effects::SlotId;
use crate::error::{IrisonicError, Result};
use crate::resample::Resampler;

/// Hard limit on auxiliary sends per source.
pub const MAX_SENDS: usize = 4;

/// Channel arrangement of buffer content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    Mono,
    Stereo,
    /// Stereo content meant for the back pair.
    Rear,
    Quad,
    X51,
    X61,
    X71,
    /// First-order ambisonic, horizontal only (FuMa W/X/Y).
    BFormat2D,
    /// Full first-order ambisonic (FuMa W/X/Y/Z).
    BFormat3D,
}

impl BufferFormat {
    pub fn channels(self) -> usize {
        match self {
            BufferFormat::Mono => 1,
            BufferFormat::Stereo | BufferFormat::Rear => 2,
            BufferFormat::BFormat2D => 3,
            BufferFormat::Quad | BufferFormat::BFormat3D => 4,
            BufferFormat::X51 => 6,
            BufferFormat::X61 => 7,
            BufferFormat::X71 => 8,
        }
    }

    pub fn is_bformat(self) -> bool {
        matches!(self, BufferFormat::BFormat2D | BufferFormat::BFormat3D)
    }
}

/// An immutable PCM buffer, interleaved f32.
pub struct AudioBuffer {
    data: Vec<f32>,
    format: BufferFormat,
    frequency: u32,
}

impl AudioBuffer {
    pub fn new(data: Vec<f32>, format: BufferFormat, frequency: u32) -> Result<Arc<Self>> {
        if frequency == 0 {
            return Err(IrisonicError::InvalidParameter(
                "buffer frequency must be positive".into(),
            ));
        }
        if data.len() % format.channels() != 0 {
            return Err(IrisonicError::AudioFormat(format!(
                "sample count {} does not divide into {} channels",
                data.len(),
                format.channels()
            )));
        }
        Ok(Arc::new(Self {
            data,
            format,
            frequency,
        }))
    }

    pub fn format(&self) -> BufferFormat {
        self.format
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn frames(&self) -> usize {
        self.data.len() / self.format.channels()
    }

    /// Sample for `channel` at `frame`, without bounds checking beyond the
    /// slice's own.
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        self.data[frame * self.format.channels() + channel]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Distance attenuation models. Clamped variants restrict the effective
/// distance to [ref, max], except when max < ref, which disables the
/// attenuation entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    Inverse,
    #[default]
    InverseClamped,
    Linear,
    LinearClamped,
    Exponent,
    ExponentClamped,
    Disable,
}

/// When to apply full 3D spatialization to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatializeMode {
    Off,
    On,
    /// Spatialize mono content only; multichannel plays by channel map.
    #[default]
    Auto,
}

/// Per-send routing and filter settings.
#[derive(Debug, Clone, Copy)]
pub struct SendProps {
    pub slot: Option<SlotId>,
    pub gain: f32,
    pub gain_hf: f32,
    pub hf_reference: f32,
    pub gain_lf: f32,
    pub lf_reference: f32,
}

impl Default for SendProps {
    fn default() -> Self {
        Self {
            slot: None,
            gain: 1.0,
            gain_hf: 1.0,
            hf_reference: 5000.0,
            gain_lf: 1.0,
            lf_reference: 250.0,
        }
    }
}

/// Direct-path filter settings.
#[derive(Debug, Clone, Copy)]
pub struct DirectProps {
    pub gain: f32,
    pub gain_hf: f32,
    pub hf_reference: f32,
    pub gain_lf: f32,
    pub lf_reference: f32,
}

impl Default for DirectProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gain_hf: 1.0,
            hf_reference: 5000.0,
            gain_lf: 1.0,
            lf_reference: 250.0,
        }
    }
}

/// Immutable snapshot of a source's mixing parameters. The world publishes
/// a fresh copy through the update channel whenever the application
/// changes something; the mixer consumes it at quantum start.
#[derive(Debug, Clone)]
pub struct SourceProps {
    pub pitch: f32,
    pub gain: f32,
    pub min_gain: f32,
    pub max_gain: f32,

    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
    /// Orientation for local B-format content: (at, up).
    pub orientation: (Vec3, Vec3),
    /// Positions and vectors are already in listener space.
    pub head_relative: bool,

    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub room_rolloff_factor: f32,
    pub distance_model: Option<DistanceModel>,

    pub inner_angle: f32,
    pub outer_angle: f32,
    pub outer_gain: f32,
    pub outer_gain_hf: f32,

    pub air_absorption_factor: f32,
    pub doppler_factor: f32,
    /// Source extent; a radius at or beyond the distance surrounds the
    /// listener.
    pub radius: f32,
    /// Stereo content pan angles in radians, counter-clockwise positive.
    pub stereo_pan: (f32, f32),

    pub dry_gain_hf_auto: bool,
    pub wet_gain_auto: bool,
    pub wet_gain_hf_auto: bool,

    pub direct_channels: bool,
    pub spatialize: SpatializeMode,
    pub resampler: Resampler,
    pub looping: bool,

    pub direct: DirectProps,
    pub sends: [SendProps; MAX_SENDS],
}

impl Default for SourceProps {
    fn default() -> Self {
        Self {
            pitch: 1.0,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            orientation: (Vec3::new(0.0, 0.0, -1.0), Vec3::new(0.0, 1.0, 0.0)),
            head_relative: false,
            ref_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            room_rolloff_factor: 0.0,
            distance_model: None,
            inner_angle: 360.0,
            outer_angle: 360.0,
            outer_gain: 0.0,
            outer_gain_hf: 1.0,
            air_absorption_factor: 0.0,
            doppler_factor: 1.0,
            radius: 0.0,
            stereo_pan: (
                std::f32::consts::FRAC_PI_6,
                -std::f32::consts::FRAC_PI_6,
            ),
            dry_gain_hf_auto: true,
            wet_gain_auto: true,
            wet_gain_hf_auto: true,
            direct_channels: false,
            spatialize: SpatializeMode::Auto,
            resampler: Resampler::default(),
            looping: false,
            direct: DirectProps::default(),
            sends: [SendProps::default(); MAX_SENDS],
        }
    }
}

impl SourceProps {
    /// Range-check the fields the mixer trusts blindly.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, what: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(IrisonicError::InvalidParameter(format!(
                    "source {what} out of range"
                )))
            }
        };
        check(self.pitch > 0.0 && self.pitch.is_finite(), "pitch")?;
        check(self.gain >= 0.0 && self.gain.is_finite(), "gain")?;
        check(self.min_gain >= 0.0 && self.min_gain <= self.max_gain, "min/max gain")?;
        check(self.ref_distance >= 0.0, "reference distance")?;
        check(self.rolloff_factor >= 0.0, "rolloff factor")?;
        check(
            (0.0..=360.0).contains(&self.inner_angle)
                && (0.0..=360.0).contains(&self.outer_angle),
            "cone angles",
        )?;
        check((0.0..=1.0).contains(&self.outer_gain), "outer gain")?;
        check(self.radius >= 0.0 && self.radius.is_finite(), "radius")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_rejects_ragged_data() {
        assert!(AudioBuffer::new(vec![0.0; 5], BufferFormat::Stereo, 44100).is_err());
        assert!(AudioBuffer::new(vec![0.0; 6], BufferFormat::Stereo, 44100).is_ok());
        assert!(AudioBuffer::new(vec![0.0; 4], BufferFormat::Mono, 0).is_err());
    }

    #[test]
    fn buffer_sample_indexing_is_interleaved() {
        let buffer =
            AudioBuffer::new(vec![1.0, 2.0, 3.0, 4.0], BufferFormat::Stereo, 44100).unwrap();
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.sample(0, 0), 1.0);
        assert_eq!(buffer.sample(0, 1), 2.0);
        assert_eq!(buffer.sample(1, 0), 3.0);
        assert_eq!(buffer.sample(1, 1), 4.0);
    }

    #[test]
    fn default_props_validate() {
        assert!(SourceProps::default().validate().is_ok());
    }

    #[test]
    fn invalid_props_are_caught() {
        let mut props = SourceProps::default();
        props.pitch = 0.0;
        assert!(props.validate().is_err());

        let mut props = SourceProps::default();
        props.outer_gain = 1.5;
        assert!(props.validate().is_err());

        let mut props = SourceProps::default();
        props.inner_angle = 400.0;
        assert!(props.validate().is_err());
    }
}
