//! Per-sample IIR primitives used throughout the pipeline.

pub mod biquad;
pub mod nfc;
pub mod splitter;

pub use biquad::{calc_rcp_q_from_bandwidth, calc_rcp_q_from_slope, BiquadFilter, BiquadType};
pub use nfc::NfcFilter;
pub use splitter::{AllPassSplitter, BandSplitter};
