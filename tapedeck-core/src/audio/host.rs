//! Audio I/O via the cpal backend.
//!
//! Any cpal host can be selected by name (`"alsa"`, `"jack"` with the `jack`
//! feature, `"coreaudio"`, `"wasapi"`, …); `None` uses the platform default.
//! Devices are chosen by preferred name, otherwise the host default, and then
//! the first available device.
//!
//! Non-f32 device formats are converted in a scratch buffer owned by the
//! stream closure. The scratch buffer only grows when the host delivers a
//! larger block than before.

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Sample, SampleFormat,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use super::{
    AudioBackend, InputHandler, OpenStream, OutputHandler, PortInfo, ShutdownHandler,
    StreamInfo, StreamRequest,
};
#[cfg(feature = "audio-cpal")]
use super::{
    device::{best_match, sort_ports},
    PortDirection,
};
use crate::error::{Result, TapedeckError};

/// [`AudioBackend`] backed by a cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    /// Host name; `None` selects `cpal::default_host()`.
    host: Option<String>,
}

impl CpalBackend {
    pub fn new(host: Option<String>) -> Self {
        Self {
            host: host
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty()),
        }
    }

    /// Names of the hosts compiled into this build.
    #[cfg(feature = "audio-cpal")]
    pub fn available_hosts() -> Vec<String> {
        cpal::available_hosts()
            .into_iter()
            .map(|id| id.name().to_ascii_lowercase())
            .collect()
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn available_hosts() -> Vec<String> {
        Vec::new()
    }
}

#[cfg(feature = "audio-cpal")]
impl CpalBackend {
    fn host(&self) -> Result<cpal::Host> {
        let Some(wanted) = self.host.as_deref() else {
            return Ok(cpal::default_host());
        };
        let id = cpal::available_hosts()
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                TapedeckError::HostUnavailable(format!(
                    "'{wanted}' (available: {})",
                    Self::available_hosts().join(", ")
                ))
            })?;
        cpal::host_from_id(id).map_err(|e| TapedeckError::HostUnavailable(e.to_string()))
    }

    fn select_device(
        host: &cpal::Host,
        direction: PortDirection,
        preferred: Option<&str>,
    ) -> Result<cpal::Device> {
        if let Some(preferred_name) = preferred {
            let listed = match direction {
                PortDirection::Capture => host.input_devices().map(|d| d.collect::<Vec<_>>()),
                PortDirection::Playback => host.output_devices().map(|d| d.collect::<Vec<_>>()),
            };
            match listed {
                Ok(devices) => {
                    let names: Vec<String> = devices
                        .iter()
                        .map(|d| d.name().unwrap_or_default())
                        .collect();
                    let found = best_match(names.iter().map(String::as_str), preferred_name)
                        .and_then(|idx| devices.into_iter().nth(idx));
                    if let Some(device) = found {
                        return Ok(device);
                    }
                    warn!(
                        "preferred {direction} device '{}' not found, falling back",
                        preferred_name
                    );
                }
                Err(e) => {
                    warn!("failed to list {direction} devices while resolving preference: {e}");
                }
            }
        }

        let default = match direction {
            PortDirection::Capture => host.default_input_device(),
            PortDirection::Playback => host.default_output_device(),
        };
        if let Some(device) = default {
            return Ok(device);
        }

        let first = match direction {
            PortDirection::Capture => host
                .input_devices()
                .map_err(|e| TapedeckError::AudioDevice(e.to_string()))?
                .next(),
            PortDirection::Playback => host
                .output_devices()
                .map_err(|e| TapedeckError::AudioDevice(e.to_string()))?
                .next(),
        };
        let device = first.ok_or(TapedeckError::NoDefaultDevice(direction.as_str()))?;
        warn!("no default {direction} device, falling back to first available");
        Ok(device)
    }

    /// Device default config, or one with the requested channel count at the
    /// default rate when the device offers it.
    fn resolve_config(
        device: &cpal::Device,
        direction: PortDirection,
        request: &StreamRequest,
    ) -> Result<cpal::SupportedStreamConfig> {
        let default = match direction {
            PortDirection::Capture => device.default_input_config(),
            PortDirection::Playback => device.default_output_config(),
        }
        .map_err(|e| TapedeckError::AudioDevice(e.to_string()))?;

        let Some(wanted) = request.channels else {
            return Ok(default);
        };
        if wanted == default.channels() {
            return Ok(default);
        }

        let rate = default.sample_rate();
        let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
            PortDirection::Capture => device
                .supported_input_configs()
                .map(|r| r.collect())
                .unwrap_or_default(),
            PortDirection::Playback => device
                .supported_output_configs()
                .map(|r| r.collect())
                .unwrap_or_default(),
        };
        let fits = |r: &&cpal::SupportedStreamConfigRange| {
            r.channels() == wanted && r.min_sample_rate() <= rate && rate <= r.max_sample_rate()
        };
        let chosen = ranges
            .iter()
            .filter(fits)
            .find(|r| r.sample_format() == default.sample_format())
            .or_else(|| ranges.iter().find(fits))
            .cloned();

        match chosen {
            Some(range) => Ok(range.with_sample_rate(rate)),
            None => {
                warn!(
                    wanted,
                    available = default.channels(),
                    "device does not offer the requested channel count, remapping channels"
                );
                Ok(default)
            }
        }
    }

    fn resolve(
        &self,
        direction: PortDirection,
        request: &StreamRequest,
    ) -> Result<(cpal::Device, cpal::SupportedStreamConfig, StreamInfo)> {
        let host = self.host()?;
        let device = Self::select_device(&host, direction, request.device.as_deref())?;
        let supported = Self::resolve_config(&device, direction, request)?;
        let info = StreamInfo {
            host: host.id().name().to_ascii_lowercase(),
            device: device.name().unwrap_or_default(),
            direction,
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
            block_size: request.block_size,
        };
        Ok((device, supported, info))
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioBackend for CpalBackend {
    fn host_name(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| cpal::default_host().id().name().to_ascii_lowercase())
    }

    fn probe_input(&self, request: &StreamRequest) -> Result<StreamInfo> {
        self.resolve(PortDirection::Capture, request).map(|(_, _, info)| info)
    }

    fn probe_output(&self, request: &StreamRequest) -> Result<StreamInfo> {
        self.resolve(PortDirection::Playback, request).map(|(_, _, info)| info)
    }

    fn open_input(
        &self,
        request: &StreamRequest,
        on_data: InputHandler,
        on_shutdown: ShutdownHandler,
    ) -> Result<OpenStream> {
        let (device, supported, info) = self.resolve(PortDirection::Capture, request)?;
        let mut config = supported.config();
        if let Some(frames) = request.block_size {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }

        info!(
            client = request.client_name.as_str(),
            device = info.device.as_str(),
            sample_rate = info.sample_rate,
            channels = info.channels,
            format = ?supported.sample_format(),
            "opening input stream"
        );

        let on_error = stream_error_handler(on_shutdown);
        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut on_data = on_data;
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| on_data(data),
                    on_error,
                    None,
                )
            }
            SampleFormat::I16 => build_converting_input::<i16>(&device, &config, on_data, on_error),
            SampleFormat::I32 => build_converting_input::<i32>(&device, &config, on_data, on_error),
            SampleFormat::U16 => build_converting_input::<u16>(&device, &config, on_data, on_error),
            SampleFormat::U8 => build_converting_input::<u8>(&device, &config, on_data, on_error),
            fmt => return Err(TapedeckError::UnsupportedFormat(format!("{fmt:?}"))),
        }
        .map_err(|e| TapedeckError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TapedeckError::AudioStream(e.to_string()))?;

        Ok(OpenStream::new(info, stream))
    }

    fn open_output(
        &self,
        request: &StreamRequest,
        on_data: OutputHandler,
        on_shutdown: ShutdownHandler,
    ) -> Result<OpenStream> {
        let (device, supported, info) = self.resolve(PortDirection::Playback, request)?;
        let mut config = supported.config();
        if let Some(frames) = request.block_size {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }

        info!(
            client = request.client_name.as_str(),
            device = info.device.as_str(),
            sample_rate = info.sample_rate,
            channels = info.channels,
            format = ?supported.sample_format(),
            "opening output stream"
        );

        let on_error = stream_error_handler(on_shutdown);
        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut on_data = on_data;
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| on_data(data),
                    on_error,
                    None,
                )
            }
            SampleFormat::I16 => build_converting_output::<i16>(&device, &config, on_data, on_error),
            SampleFormat::I32 => build_converting_output::<i32>(&device, &config, on_data, on_error),
            SampleFormat::U16 => build_converting_output::<u16>(&device, &config, on_data, on_error),
            fmt => return Err(TapedeckError::UnsupportedFormat(format!("{fmt:?}"))),
        }
        .map_err(|e| TapedeckError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TapedeckError::AudioStream(e.to_string()))?;

        Ok(OpenStream::new(info, stream))
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let host = self.host()?;
        let default_in = host.default_input_device().and_then(|d| d.name().ok());
        let default_out = host.default_output_device().and_then(|d| d.name().ok());
        let mut ports = Vec::new();

        match host.input_devices() {
            Ok(devices) => {
                for (idx, device) in devices.enumerate() {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                    let config = device.default_input_config().ok();
                    ports.push(PortInfo {
                        is_default: default_in.as_deref() == Some(name.as_str()),
                        name,
                        direction: PortDirection::Capture,
                        channels: config.as_ref().map(|c| c.channels()),
                        sample_rate: config.map(|c| c.sample_rate().0),
                    });
                }
            }
            Err(e) => warn!("failed to enumerate input devices: {e}"),
        }

        match host.output_devices() {
            Ok(devices) => {
                for (idx, device) in devices.enumerate() {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                    let config = device.default_output_config().ok();
                    ports.push(PortInfo {
                        is_default: default_out.as_deref() == Some(name.as_str()),
                        name,
                        direction: PortDirection::Playback,
                        channels: config.as_ref().map(|c| c.channels()),
                        sample_rate: config.map(|c| c.sample_rate().0),
                    });
                }
            }
            Err(e) => warn!("failed to enumerate output devices: {e}"),
        }

        sort_ports(&mut ports);
        Ok(ports)
    }
}

/// Device loss is reported as an unsolicited stop; other stream errors are
/// logged and the stream keeps running.
#[cfg(feature = "audio-cpal")]
fn stream_error_handler(
    mut on_shutdown: ShutdownHandler,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| match err {
        cpal::StreamError::DeviceNotAvailable => {
            error!("audio device no longer available");
            on_shutdown("audio device no longer available".into());
        }
        other => error!("audio stream error: {other}"),
    }
}

#[cfg(feature = "audio-cpal")]
fn build_converting_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut on_data: InputHandler,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            for (dst, &src) in scratch.iter_mut().zip(data) {
                *dst = src.to_sample::<f32>();
            }
            on_data(&scratch);
        },
        on_error,
        None,
    )
}

#[cfg(feature = "audio-cpal")]
fn build_converting_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut on_data: OutputHandler,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            on_data(&mut scratch);
            for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                *dst = T::from_sample(src);
            }
        },
        on_error,
        None,
    )
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioBackend for CpalBackend {
    fn host_name(&self) -> String {
        self.host.clone().unwrap_or_else(|| "none".into())
    }

    fn probe_input(&self, _request: &StreamRequest) -> Result<StreamInfo> {
        Err(unavailable())
    }

    fn probe_output(&self, _request: &StreamRequest) -> Result<StreamInfo> {
        Err(unavailable())
    }

    fn open_input(
        &self,
        _request: &StreamRequest,
        _on_data: InputHandler,
        _on_shutdown: ShutdownHandler,
    ) -> Result<OpenStream> {
        Err(unavailable())
    }

    fn open_output(
        &self,
        _request: &StreamRequest,
        _on_data: OutputHandler,
        _on_shutdown: ShutdownHandler,
    ) -> Result<OpenStream> {
        Err(unavailable())
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(Vec::new())
    }
}

#[cfg(not(feature = "audio-cpal"))]
fn unavailable() -> TapedeckError {
    TapedeckError::AudioStream("compiled without audio-cpal feature".into())
}
