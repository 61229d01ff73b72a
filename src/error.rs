//! Error types for Irisonic

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IrisonicError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Decoder preset error: {0}")]
    DecoderPreset(String),

    #[error("Effect routing error: {0}")]
    EffectRouting(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IrisonicError>;
