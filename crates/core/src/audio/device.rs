use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use super::{AudioFrame, CaptureBackend, FrameFormat, FrameSource};
use crate::{Result, VoiceLayerError};

/// Longest a read waits for the next frame before the device counts as gone.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);
const FRAME_QUEUE_DEPTH: usize = 32;

/// Capture backend on top of the host's default `cpal` audio API.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCapture;

impl CaptureBackend for CpalCapture {
    fn input_devices(&self) -> Vec<String> {
        let host = cpal::default_host();
        host.input_devices()
            .map(|devices| devices.filter_map(|device| device.name().ok()).collect())
            .unwrap_or_default()
    }

    fn open(&self, name: &str, format: FrameFormat) -> Result<Box<dyn FrameSource>> {
        let host = cpal::default_host();
        let device = find_device(&host, name)?;
        let (config, sample_format) = choose_config(&device, format.sample_rate)?;

        tracing::info!(
            device = name,
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            ?sample_format,
            "opening capture stream"
        );

        let (frame_tx, frame_rx) = crossbeam_channel::bounded(FRAME_QUEUE_DEPTH);
        let (error_tx, error_rx) = crossbeam_channel::bounded(1);
        let mut chunker = FrameChunker::new(format.frame_size, config.channels as usize, frame_tx);
        let err_fn = move |err: cpal::StreamError| {
            tracing::error!(%err, "capture stream error");
            let _ = error_tx.try_send(err.to_string());
        };

        let stream = match sample_format {
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    chunker.push(data.iter().copied());
                },
                err_fn,
                None,
            ),
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    chunker.push(data.iter().map(|&sample| f32_to_i16(sample)));
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    chunker.push(data.iter().map(|&sample| u16_to_i16(sample)));
                },
                err_fn,
                None,
            ),
            other => {
                return Err(VoiceLayerError::Device(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        }
        .map_err(|err| VoiceLayerError::Device(err.to_string()))?;

        stream
            .play()
            .map_err(|err| VoiceLayerError::Device(err.to_string()))?;

        Ok(Box::new(CpalSource {
            _stream: stream,
            inbox: FrameInbox::new(frame_rx, error_rx, READ_TIMEOUT),
        }))
    }
}

fn find_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    if name == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| VoiceLayerError::Device("no default input device".into()));
    }

    let devices = host
        .input_devices()
        .map_err(|err| VoiceLayerError::Device(err.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(VoiceLayerError::Device(format!("input device `{name}` not found")))
}

/// Keeps the device's preferred layout but asks for `sample_rate` when one of
/// its supported ranges allows it.
fn choose_config(device: &cpal::Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let default = device
        .default_input_config()
        .map_err(|err| VoiceLayerError::Device(err.to_string()))?;
    let wanted = SampleRate(sample_rate);

    let preferred = device.supported_input_configs().ok().and_then(|mut ranges| {
        ranges
            .find(|range| {
                range.channels() == default.channels()
                    && range.sample_format() == default.sample_format()
                    && range.min_sample_rate() <= wanted
                    && wanted <= range.max_sample_rate()
            })
            .map(|range| range.with_sample_rate(wanted))
    });

    let chosen = preferred.unwrap_or(default);
    let sample_format = chosen.sample_format();
    Ok((chosen.config(), sample_format))
}

struct CpalSource {
    _stream: cpal::Stream,
    inbox: FrameInbox,
}

impl FrameSource for CpalSource {
    fn read_frame(&mut self) -> Result<AudioFrame> {
        self.inbox.next_frame()
    }
}

/// Receiving end of the callback hand-off: frames plus forwarded stream
/// errors, with a bounded wait.
struct FrameInbox {
    frames: Receiver<Vec<i16>>,
    errors: Receiver<String>,
    timeout: Duration,
}

impl FrameInbox {
    fn new(frames: Receiver<Vec<i16>>, errors: Receiver<String>, timeout: Duration) -> Self {
        Self {
            frames,
            errors,
            timeout,
        }
    }

    /// A pending stream error wins over queued frames.
    fn next_frame(&self) -> Result<AudioFrame> {
        if let Ok(err) = self.errors.try_recv() {
            return Err(VoiceLayerError::Device(err));
        }

        match self.frames.recv_timeout(self.timeout) {
            Ok(samples) => Ok(AudioFrame::new(samples)),
            Err(RecvTimeoutError::Timeout) => Err(VoiceLayerError::Device(
                self.errors
                    .try_recv()
                    .unwrap_or_else(|_| format!("no audio received for {:?}", self.timeout)),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(VoiceLayerError::Device("capture stream closed".into()))
            }
        }
    }
}

/// Downmixes interleaved callback buffers to mono and cuts them into frames.
struct FrameChunker {
    frame_size: usize,
    channels: usize,
    pending: Vec<i16>,
    mix: i32,
    mixed: usize,
    overflowed: u64,
    tx: Sender<Vec<i16>>,
}

impl FrameChunker {
    fn new(frame_size: usize, channels: usize, tx: Sender<Vec<i16>>) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            channels: channels.max(1),
            pending: Vec::with_capacity(frame_size),
            mix: 0,
            mixed: 0,
            overflowed: 0,
            tx,
        }
    }

    fn push(&mut self, interleaved: impl IntoIterator<Item = i16>) {
        for sample in interleaved {
            self.mix += i32::from(sample);
            self.mixed += 1;
            if self.mixed < self.channels {
                continue;
            }

            self.pending.push((self.mix / self.channels as i32) as i16);
            self.mix = 0;
            self.mixed = 0;

            if self.pending.len() == self.frame_size {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                self.emit(frame);
            }
        }
    }

    fn emit(&mut self, frame: Vec<i16>) {
        match self.tx.try_send(frame) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                // Reader fell behind. Dropping keeps capture running.
                self.overflowed += 1;
                tracing::debug!(dropped = self.overflowed, "capture overflow");
            }
        }
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn u16_to_i16(sample: u16) -> i16 {
    (i32::from(sample) - 32_768) as i16
}
