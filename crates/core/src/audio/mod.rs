//! Microphone capture and loudness measurement.
//!
//! Frames come from a [`FrameSource`] opened through a [`CaptureBackend`].
//! [`AudioSampler`] turns each frame into one RMS value and mirrors it onto a
//! lossy observation channel so a UI can show a live meter without ever
//! slowing the switching path down.

mod device;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::{Result, ThresholdConfig};

pub use device::CpalCapture;

/// Samples per frame handed to the classifier.
pub const FRAME_SIZE: usize = 1024;
/// Requested capture rate in Hz.
pub const SAMPLE_RATE: u32 = 44_100;
/// RMS value that fills the level meter completely.
pub const METER_CEILING: f64 = 2000.0;
/// Readings buffered for the observer before new ones are dropped.
pub const LEVEL_QUEUE_DEPTH: usize = 256;

/// Fixed count of signed 16-bit mono samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Root-mean-square of the frame. An empty frame is silent.
    pub fn rms(&self) -> f64 {
        compute_rms(&self.samples)
    }
}

/// Shape of the frames a capture stream produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub sample_rate: u32,
    pub frame_size: usize,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_size: FRAME_SIZE,
        }
    }
}

/// Open capture stream. Dropping it releases the device.
pub trait FrameSource {
    /// Blocks until a full frame is available. Fails with
    /// [`crate::VoiceLayerError::Device`] on disconnect or timeout; an input
    /// overflow is not an error.
    fn read_frame(&mut self) -> Result<AudioFrame>;
}

/// Host audio API able to enumerate and open input devices.
///
/// The backend itself is shared across threads, the stream it opens stays on
/// the thread that opened it.
pub trait CaptureBackend: Send + Sync {
    fn input_devices(&self) -> Vec<String>;

    fn has_device(&self, name: &str) -> bool {
        name == "default" || self.input_devices().iter().any(|device| device == name)
    }

    fn open(&self, device: &str, format: FrameFormat) -> Result<Box<dyn FrameSource>>;
}

/// Where a reading sits relative to the active thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelZone {
    Below,
    Within,
    Above,
}

/// One loudness sample as seen by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelReading {
    pub rms: f64,
    /// `rms` scaled into `[0, 1]` against [`METER_CEILING`].
    pub meter: f64,
    pub zone: LevelZone,
}

impl LevelReading {
    pub fn new(rms: f64, thresholds: &ThresholdConfig) -> Self {
        let zone = if rms < thresholds.min() {
            LevelZone::Below
        } else if rms >= thresholds.max() {
            LevelZone::Above
        } else {
            LevelZone::Within
        };
        Self {
            rms,
            meter: (rms / METER_CEILING).clamp(0.0, 1.0),
            zone,
        }
    }
}

/// Creates the publishing and observing halves of the level channel.
pub fn level_channel(capacity: usize) -> (LevelFeed, LevelMonitor) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (LevelFeed { tx: Some(tx) }, LevelMonitor { rx })
}

/// Publishing half of the level channel. Never blocks.
#[derive(Debug, Clone)]
pub struct LevelFeed {
    tx: Option<Sender<LevelReading>>,
}

impl LevelFeed {
    /// A feed with no observer attached.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, reading: LevelReading) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(reading) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("level observer is behind, dropping reading");
            }
        }
    }
}

/// Observing half of the level channel, polled on the observer's own timer.
#[derive(Debug, Clone)]
pub struct LevelMonitor {
    rx: Receiver<LevelReading>,
}

impl LevelMonitor {
    /// Takes every reading queued since the previous call.
    pub fn drain(&self) -> Vec<LevelReading> {
        self.rx.try_iter().collect()
    }

    /// Drains the queue and keeps only the newest reading.
    pub fn latest(&self) -> Option<LevelReading> {
        self.rx.try_iter().last()
    }
}

/// Reads frames and reports their loudness.
pub struct AudioSampler {
    source: Box<dyn FrameSource>,
    feed: LevelFeed,
    thresholds: ThresholdConfig,
}

impl AudioSampler {
    pub fn new(source: Box<dyn FrameSource>, feed: LevelFeed, thresholds: ThresholdConfig) -> Self {
        Self {
            source,
            feed,
            thresholds,
        }
    }

    /// Reads one frame, publishes its loudness and returns it.
    pub fn next_loudness(&mut self) -> Result<f64> {
        let frame = self.source.read_frame()?;
        let rms = frame.rms();
        self.feed.publish(LevelReading::new(rms, &self.thresholds));
        Ok(rms)
    }
}

impl std::fmt::Debug for AudioSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSampler")
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

fn compute_rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&sample| {
            let value = f64::from(sample);
            value * value
        })
        .sum();
    (sum / samples.len() as f64).sqrt()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted capture used to drive the control loop without hardware.

    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::VoiceLayerError;

    /// Frame with every sample set to `level`, whose RMS is `|level|`.
    pub fn flat_frame(level: i16) -> AudioFrame {
        AudioFrame::new(vec![level; 64])
    }

    #[derive(Debug, Clone)]
    pub enum Step {
        Frame(i16),
        Fail(&'static str),
    }

    /// Plays a script, then repeats its last frame forever.
    pub struct ScriptedSource {
        steps: VecDeque<Step>,
        last: i16,
        period: Duration,
        log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            if let Some(log) = &self.log {
                log.lock().unwrap().push("device released".to_string());
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<AudioFrame> {
            thread::sleep(self.period);
            match self.steps.pop_front() {
                Some(Step::Frame(level)) => {
                    self.last = level;
                    Ok(flat_frame(level))
                }
                Some(Step::Fail(reason)) => Err(VoiceLayerError::Device(reason.to_string())),
                None => Ok(flat_frame(self.last)),
            }
        }
    }

    #[derive(Clone)]
    pub struct ScriptedCapture {
        script: Vec<Step>,
        period: Duration,
        refuse_open: bool,
        log: Option<Arc<Mutex<Vec<String>>>>,
        pub opened: Arc<Mutex<usize>>,
    }

    impl ScriptedCapture {
        pub fn new(script: Vec<Step>, period: Duration) -> Self {
            Self {
                script,
                period,
                refuse_open: false,
                log: None,
                opened: Arc::new(Mutex::new(0)),
            }
        }

        /// Appends "device opened"/"device released" to `log`.
        pub fn logging_to(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
            self.log = Some(log);
            self
        }

        pub fn refusing() -> Self {
            Self {
                refuse_open: true,
                ..Self::new(Vec::new(), Duration::from_millis(1))
            }
        }
    }

    impl CaptureBackend for ScriptedCapture {
        fn input_devices(&self) -> Vec<String> {
            vec!["Scripted Mic".to_string()]
        }

        fn open(&self, _device: &str, _format: FrameFormat) -> Result<Box<dyn FrameSource>> {
            if self.refuse_open {
                return Err(VoiceLayerError::Device("device unplugged".into()));
            }
            *self.opened.lock().unwrap() += 1;
            if let Some(log) = &self.log {
                log.lock().unwrap().push("device opened".to_string());
            }
            Ok(Box::new(ScriptedSource {
                steps: self.script.iter().cloned().collect(),
                last: 0,
                period: self.period,
                log: self.log.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn thresholds() -> ThresholdConfig {
        ThresholdConfig::new(50.0, 500.0).unwrap()
    }

    #[test]
    fn empty_frame_is_silent() {
        assert_eq!(AudioFrame::default().rms(), 0.0);
    }

    #[test]
    fn rms_matches_definition() {
        let frame = AudioFrame::new(vec![3, -4, 3, -4]);
        let expected = ((9.0 + 16.0 + 9.0 + 16.0) / 4.0_f64).sqrt();
        assert!((frame.rms() - expected).abs() < 1e-9);
        assert!((flat_frame(-300).rms() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn rms_of_full_scale_does_not_overflow() {
        let frame = AudioFrame::new(vec![i16::MIN; FRAME_SIZE]);
        assert!((frame.rms() - 32768.0).abs() < 1e-6);
    }

    #[test]
    fn readings_are_zoned_and_scaled() {
        let t = thresholds();
        assert_eq!(LevelReading::new(10.0, &t).zone, LevelZone::Below);
        assert_eq!(LevelReading::new(50.0, &t).zone, LevelZone::Within);
        assert_eq!(LevelReading::new(500.0, &t).zone, LevelZone::Above);
        assert_eq!(LevelReading::new(5000.0, &t).meter, 1.0);
        assert!((LevelReading::new(1000.0, &t).meter - 0.5).abs() < 1e-9);
    }

    #[test]
    fn publishing_never_blocks_on_a_full_or_absent_observer() {
        let (feed, monitor) = level_channel(2);
        for rms in [1.0, 2.0, 3.0, 4.0] {
            feed.publish(LevelReading::new(rms, &thresholds()));
        }
        let readings = monitor.drain();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].rms, 1.0);

        drop(monitor);
        feed.publish(LevelReading::new(5.0, &thresholds()));
        LevelFeed::detached().publish(LevelReading::new(5.0, &thresholds()));
    }

    #[test]
    fn sampler_publishes_every_loudness() {
        let capture = ScriptedCapture::new(
            vec![Step::Frame(100), Step::Frame(600)],
            std::time::Duration::ZERO,
        );
        let source = capture.open("Scripted Mic", FrameFormat::default()).unwrap();
        let (feed, monitor) = level_channel(8);
        let mut sampler = AudioSampler::new(source, feed, thresholds());

        assert!((sampler.next_loudness().unwrap() - 100.0).abs() < 1e-9);
        assert!((sampler.next_loudness().unwrap() - 600.0).abs() < 1e-9);

        let latest = monitor.latest().unwrap();
        assert_eq!(latest.zone, LevelZone::Above);
        assert!(monitor.drain().is_empty());
    }

    #[test]
    fn sampler_surfaces_device_errors() {
        let capture = ScriptedCapture::new(vec![Step::Fail("unplugged")], std::time::Duration::ZERO);
        let source = capture.open("Scripted Mic", FrameFormat::default()).unwrap();
        let mut sampler = AudioSampler::new(source, LevelFeed::detached(), thresholds());
        let err = sampler.next_loudness().unwrap_err();
        assert!(matches!(err, crate::VoiceLayerError::Device(_)));
    }

    #[test]
    fn default_device_is_always_available() {
        let capture = ScriptedCapture::new(Vec::new(), std::time::Duration::ZERO);
        assert!(capture.has_device("default"));
        assert!(capture.has_device("Scripted Mic"));
        assert!(!capture.has_device("Line In"));
    }
}
