//! Irisonic, a 3D positional audio rendering engine.
//!
//! Applications describe a scene (a listener, sources with positions and
//! cones, auxiliary effect slots) through a [`World`]; a [`Device`]
//! continuously renders what the listener hears as interleaved PCM, either
//! pulled directly with [`Device::mix_data`] or pushed to the system
//! output by an [`Engine`]. Rendering runs through an ambisonic
//! intermediate mix with selectable output paths: speaker decoding,
//! binaural HRTF, stereo-compatible UHJ, or headphone crossfeed.

pub mod ambi;
pub mod bformatdec;
pub mod bs2b;
pub mod calc;
pub mod config;
pub mod context;
pub mod devformat;
pub mod device;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod filters;
pub mod hrtf;
pub mod math;
pub mod mixer;
pub mod output;
pub mod resample;
pub mod ring;
pub mod source;
pub mod uhj;
pub mod update;
pub mod voice;
pub mod world;

pub use calc::{ListenerProps, WorldProps};
pub use config::{DeviceDesc, EngineConfig, StereoMode};
pub use devformat::{AmbiLayout, AmbiNorm, Channel, ChannelLayout, SampleType};
pub use device::Device;
pub use effects::{EffectProps, EffectState, ReverbProps};
pub use engine::Engine;
pub use error::{IrisonicError, Result};
pub use events::{IrisonicEvent, SourceState};
pub use resample::Resampler;
pub use source::{AudioBuffer, BufferFormat, DistanceModel, SourceProps, SpatializeMode};
pub use world::{SourceId, World};
