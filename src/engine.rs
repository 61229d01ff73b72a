//! Hardware output driver.
//!
//! Wraps the render contract in a cpal output stream: the device callback
//! calls [`Device::mix_data`] to fill each hardware buffer, converting to
//! the stream's sample format on the way out. Platform specifics stay in
//! cpal; a stream failure disconnects the engine's device so renders keep
//! producing (silent) output and the application hears about it through
//! the event channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};

use crate::config::DeviceDesc;
use crate::devformat::SampleType;
use crate::device::Device;
use crate::error::{IrisonicError, Result};

/// Drives a [`Device`] from the default system output.
pub struct Engine {
    device: Arc<Device>,
    stream: Option<cpal::Stream>,
    is_running: Arc<AtomicBool>,
}

impl Engine {
    /// Create an engine and its device in one go. The descriptor's sample
    /// type should be `F32`; the stream converts from the float mix.
    pub fn new(desc: DeviceDesc) -> Result<Self> {
        let device = Device::new(desc)?;
        Ok(Self::with_device(device))
    }

    pub fn with_device(device: Arc<Device>) -> Self {
        Self {
            device,
            stream: None,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Open the default output device and start rendering.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.device.sample_type() != SampleType::F32 {
            return Err(IrisonicError::AudioFormat(
                "the stream driver renders from an F32 device".into(),
            ));
        }

        let host = cpal::default_host();
        let output = host.default_output_device().ok_or_else(|| {
            IrisonicError::AudioDevice("no default output device available".into())
        })?;
        let supported = output.default_output_config().map_err(|err| {
            IrisonicError::AudioDevice(format!("failed to get default config: {err}"))
        })?;

        let channels = self.device.channel_count() as u16;
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.device.frequency()),
            buffer_size: cpal::BufferSize::Default,
        };
        log::info!(
            "Starting output stream: {} channels at {} Hz ({:?})",
            channels,
            self.device.frequency(),
            supported.sample_format()
        );

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(&output, &config)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(&output, &config)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(&output, &config)?,
            other => {
                return Err(IrisonicError::AudioFormat(format!(
                    "unsupported stream sample format {other:?}"
                )))
            }
        };
        stream
            .play()
            .map_err(|err| IrisonicError::AudioDevice(format!("failed to start stream: {err}")))?;

        self.stream = Some(stream);
        self.is_running.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.is_running.store(false, Ordering::Relaxed);
            drop(stream);
        }
    }

    fn build_stream<T>(
        &self,
        output: &cpal::Device,
        config: &cpal::StreamConfig,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let device = self.device.clone();
        let error_device = self.device.clone();
        let channels = config.channels as usize;
        // The mix fills bytes of f32; converted per callback when the
        // stream wants integers.
        let scratch = Arc::new(Mutex::new(Vec::<u8>::new()));

        let stream = output
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let mut scratch = scratch
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    scratch.resize(data.len() * 4, 0);
                    if device.mix_data(Some(scratch.as_mut_slice()), frames).is_err() {
                        for sample in data.iter_mut() {
                            *sample = T::from_sample(0.0f32);
                        }
                        return;
                    }
                    for (out, chunk) in data.iter_mut().zip(scratch.chunks_exact(4)) {
                        let value =
                            f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        *out = T::from_sample(value);
                    }
                },
                move |err| {
                    log::error!("Audio stream error: {err}");
                    error_device.handle_disconnect(&format!("stream error: {err}"));
                },
                None,
            )
            .map_err(|err| IrisonicError::AudioDevice(format!("failed to build stream: {err}")))?;
        Ok(stream)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
