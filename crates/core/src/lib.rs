//! Core library for the voicelayer overlay driver.
//!
//! Microphone loudness picks one image out of a numbered set of sources in
//! an OBS group and keeps exactly that one visible. Each module owns one
//! subsystem: capture and loudness in [`audio`], the loudness to state
//! mapping in [`classify`], debouncing in [`switch`], the control plane in
//! [`remote`], source discovery in [`registry`] and the worker lifecycle in
//! [`control`].

pub mod audio;
pub mod classify;
pub mod config;
pub mod control;
pub mod error;
pub mod registry;
pub mod remote;
pub mod switch;

pub use audio::{
    AudioFrame, AudioSampler, CaptureBackend, CpalCapture, FrameFormat, FrameSource, LevelMonitor,
    LevelReading, LevelZone,
};
pub use classify::classify;
pub use config::{
    AppConfig, AudioConfig, LoopConfig, ObsConfig, OverlayConfig, SelectionRange, StopPolicy,
    ThresholdConfig,
};
pub use control::{ControlLoop, LoopState, LoopStatus};
pub use error::{Result, VoiceLayerError};
pub use registry::{
    CatalogKey, DiscoveryMode, DiscoveryReport, DiscoveryScope, GroupCatalog, NamePattern,
    SourceRegistry, VisualState,
};
pub use remote::{Connector, ItemId, Lookup, MemoryControlPlane, ObsConnector, VisibilityClient};
pub use switch::{SwitchController, SwitchEvent, SWITCH_COOLDOWN};
