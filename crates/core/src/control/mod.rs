//! The sampling/switching worker and its lifecycle.
//!
//! [`ControlLoop`] owns at most one worker thread. A run connects to the
//! control plane, hides every selected source, then repeatedly reads a
//! frame, classifies its loudness and applies debounced switches until the
//! stop flag is observed. Teardown releases the capture device first and the
//! control plane session last.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    audio::{
        level_channel, AudioSampler, CaptureBackend, FrameFormat, LevelFeed, LevelMonitor,
        LEVEL_QUEUE_DEPTH,
    },
    classify::classify,
    registry::{DiscoveryMode, DiscoveryReport, DiscoveryScope, RunClaim, SourceRegistry, VisualState},
    remote::{Connection, Connector, VisibilityClient},
    switch::{policy_for, SwitchController, SwitchEvent, SWITCH_COOLDOWN},
    LoopConfig, Result, StopPolicy, ThresholdConfig, VoiceLayerError,
};

/// Lifecycle notification delivered to the status callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LoopStatus {
    Connecting,
    Running,
    Error(String),
    Stopped,
}

/// Whether a worker is currently alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
}

pub type StatusCallback = Arc<dyn Fn(LoopStatus) + Send + Sync>;

/// Everything one run needs, resolved and validated up front.
struct Session {
    _claim: RunClaim,
    states: VisualState,
    thresholds: ThresholdConfig,
    device: String,
    format: FrameFormat,
    cooldown: Duration,
    stop_policy: StopPolicy,
    sustain_frames: u32,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owner of the sampling worker. At most one worker runs at a time.
pub struct ControlLoop {
    connector: Arc<dyn Connector>,
    capture: Arc<dyn CaptureBackend>,
    registry: Arc<SourceRegistry>,
    feed: LevelFeed,
    monitor: LevelMonitor,
    status: StatusCallback,
    worker: Option<Worker>,
}

impl ControlLoop {
    /// Idle loop with a no-op status callback.
    pub fn new(
        connector: Arc<dyn Connector>,
        capture: Arc<dyn CaptureBackend>,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        let (feed, monitor) = level_channel(LEVEL_QUEUE_DEPTH);
        Self {
            connector,
            capture,
            registry,
            feed,
            monitor,
            status: Arc::new(|_| {}),
            worker: None,
        }
    }

    /// Installs the lifecycle callback. It runs on the worker thread.
    pub fn with_status<F>(mut self, callback: F) -> Self
    where
        F: Fn(LoopStatus) + Send + Sync + 'static,
    {
        self.status = Arc::new(callback);
        self
    }

    /// Catalog shared with discovery.
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Live loudness readings. Lossy, poll it on your own timer.
    pub fn levels(&self) -> LevelMonitor {
        self.monitor.clone()
    }

    /// `Idle` once the worker has exited, including after an error.
    pub fn state(&self) -> LoopState {
        match &self.worker {
            Some(worker) if !worker.handle.is_finished() => LoopState::Running,
            _ => LoopState::Idle,
        }
    }

    /// Runs discovery over a short-lived connection of its own.
    pub fn discover(&self, scope: DiscoveryScope, mode: DiscoveryMode) -> Result<DiscoveryReport> {
        self.registry
            .discover_with(self.connector.as_ref(), scope, mode)
    }

    /// Validates `config` and spawns the worker. A live worker is stopped
    /// and joined first.
    pub fn start(&mut self, config: &LoopConfig) -> Result<()> {
        self.stop();

        let session = match self.prepare(config) {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(%err, "refusing to start control loop");
                (self.status)(LoopStatus::Error(err.to_string()));
                return Err(err);
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let (began_tx, began_rx) = crossbeam_channel::bounded(1);
        let connector = self.connector.clone();
        let capture = self.capture.clone();
        let feed = self.feed.clone();
        let status = self.status.clone();
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("voicelayer-loop".to_string())
            .spawn(move || {
                let _ = began_tx.send(());
                run_worker(session, connector.as_ref(), capture.as_ref(), feed, &status, &stop_flag);
            })?;

        if began_rx.recv().is_err() {
            let _ = handle.join();
            return Err(VoiceLayerError::msg("control loop worker died before starting"));
        }

        tracing::info!(key = %config.key, "control loop started");
        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Signals the worker and blocks until it has exited. No visibility
    /// call happens after this returns.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                tracing::error!("control loop worker panicked");
            }
        }
    }

    /// Stops, drains and starts again with `config`. Exclusive access
    /// through `&mut self` keeps the sequence from interleaving with
    /// another start.
    pub fn restart(&mut self, config: &LoopConfig) -> Result<()> {
        self.stop();
        self.start(config)
    }

    fn prepare(&self, config: &LoopConfig) -> Result<Session> {
        let device = config.device.trim();
        if device.is_empty() {
            return Err(VoiceLayerError::config("no capture device selected"));
        }
        if !self.capture.has_device(device) {
            return Err(VoiceLayerError::config(format!(
                "capture device `{device}` is not available"
            )));
        }

        let claim = self.registry.claim_run(&config.key)?;
        let states = self.registry.select(&config.key, config.range)?;

        Ok(Session {
            _claim: claim,
            states,
            thresholds: config.thresholds,
            device: device.to_string(),
            format: FrameFormat::default(),
            cooldown: SWITCH_COOLDOWN,
            stop_policy: config.stop_policy,
            sustain_frames: config.sustain_frames,
        })
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("state", &self.state())
            .finish()
    }
}

fn run_worker(
    session: Session,
    connector: &dyn Connector,
    capture: &dyn CaptureBackend,
    feed: LevelFeed,
    status: &StatusCallback,
    stop: &AtomicBool,
) {
    status(LoopStatus::Connecting);
    match drive(&session, connector, capture, feed, status, stop) {
        Ok(()) => tracing::info!("control loop stopped"),
        Err(err) => {
            tracing::error!(%err, "control loop aborted");
            status(LoopStatus::Error(err.to_string()));
        }
    }
    drop(session);
    status(LoopStatus::Stopped);
}

fn drive(
    session: &Session,
    connector: &dyn Connector,
    capture: &dyn CaptureBackend,
    feed: LevelFeed,
    status: &StatusCallback,
    stop: &AtomicBool,
) -> Result<()> {
    let states = &session.states;
    let mut connection = Connection::open(connector)?;
    for member in states.members() {
        connection
            .client()
            .set_visible(states.container(), member.item, false);
    }

    // Declared after the connection so it is released first on every path.
    let source = capture.open(&session.device, session.format)?;
    let mut sampler = AudioSampler::new(source, feed, session.thresholds);
    let mut switch =
        SwitchController::with_policy(session.cooldown, policy_for(session.sustain_frames));

    status(LoopStatus::Running);
    tracing::info!(states = states.len(), container = states.container(), "sampling");

    while !stop.load(Ordering::Acquire) {
        let rms = sampler.next_loudness()?;
        let index = classify(rms, &session.thresholds, states.len());
        if let Some(event) = switch.apply(index, Instant::now()) {
            apply_switch(connection.client(), states, &event);
        }
    }

    if session.stop_policy == StopPolicy::HideAll {
        if let Some(member) = switch.current().and_then(|index| states.get(index)) {
            connection
                .client()
                .set_visible(states.container(), member.item, false);
        }
    }

    drop(sampler);
    Ok(())
}

fn apply_switch(client: &mut dyn VisibilityClient, states: &VisualState, event: &SwitchEvent) {
    tracing::debug!(previous = ?event.previous, next = event.next, "switching");
    if let Some(previous) = event.previous.and_then(|index| states.get(index)) {
        client.set_visible(states.container(), previous.item, false);
    }
    if let Some(next) = states.get(event.next) {
        client.set_visible(states.container(), next.item, true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        audio::testing::{ScriptedCapture, Step},
        registry::{CatalogKey, GroupCatalog, NamePattern},
        remote::{ItemId, MemoryControlPlane},
        SelectionRange,
    };

    const FRAME: Duration = Duration::from_millis(2);

    struct Rig {
        plane: MemoryControlPlane,
        registry: Arc<SourceRegistry>,
        items: Vec<ItemId>,
        statuses: Arc<Mutex<Vec<LoopStatus>>>,
    }

    fn rig() -> Rig {
        let plane = MemoryControlPlane::new();
        plane.add_group("Stream", "Avatar");
        let items: Vec<ItemId> = (1..=4)
            .map(|n| plane.add_source("Avatar", &format!("{n}.png")))
            .collect();
        let registry = Arc::new(SourceRegistry::with_probe_limit(NamePattern::default(), 6));
        registry
            .discover_with(
                &plane,
                DiscoveryScope::Group(avatar()),
                DiscoveryMode::Refresh,
            )
            .unwrap();
        Rig {
            plane,
            registry,
            items,
            statuses: Arc::new(Mutex::new(Vec::new())),
        }
    }

    impl Rig {
        fn control(&self, capture: ScriptedCapture) -> ControlLoop {
            let statuses = self.statuses.clone();
            ControlLoop::new(
                Arc::new(self.plane.clone()),
                Arc::new(capture),
                self.registry.clone(),
            )
            .with_status(move |status| statuses.lock().unwrap().push(status))
        }

        fn statuses(&self) -> Vec<LoopStatus> {
            self.statuses.lock().unwrap().clone()
        }
    }

    fn avatar() -> CatalogKey {
        CatalogKey::new("Stream", "Avatar")
    }

    fn config() -> LoopConfig {
        LoopConfig {
            device: "Scripted Mic".to_string(),
            thresholds: ThresholdConfig::new(50.0, 500.0).unwrap(),
            key: avatar(),
            range: SelectionRange::new(1, 4).unwrap(),
            stop_policy: StopPolicy::LeaveVisible,
            sustain_frames: 0,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn force_hides_then_switches_between_states() {
        let rig = rig();
        let capture = ScriptedCapture::new(vec![Step::Frame(0), Step::Frame(600)], FRAME);
        let mut control = rig.control(capture);

        control.start(&config()).unwrap();
        assert_eq!(control.state(), LoopState::Running);
        assert!(wait_until(|| rig.plane.changes().len() >= 7));
        control.stop();

        let changes: Vec<(ItemId, bool)> = rig
            .plane
            .changes()
            .iter()
            .map(|change| (change.item, change.visible))
            .collect();
        let items = &rig.items;
        assert_eq!(
            changes,
            vec![
                (items[0], false),
                (items[1], false),
                (items[2], false),
                (items[3], false),
                (items[0], true),
                (items[0], false),
                (items[3], true),
            ]
        );
        assert_eq!(rig.plane.visible_items("Avatar"), vec![items[3]]);
        assert_eq!(
            rig.statuses(),
            vec![LoopStatus::Connecting, LoopStatus::Running, LoopStatus::Stopped]
        );
    }

    #[test]
    fn stop_joins_before_returning() {
        let rig = rig();
        let script: Vec<Step> = (0..5000)
            .map(|i| Step::Frame(if i % 2 == 0 { 0 } else { 900 }))
            .collect();
        let mut control = rig.control(ScriptedCapture::new(script, Duration::from_micros(200)));

        control.start(&config()).unwrap();
        assert!(wait_until(|| rig.plane.changes().len() > 8));
        control.stop();

        let after_stop = rig.plane.changes().len();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(rig.plane.changes().len(), after_stop);
        assert_eq!(control.state(), LoopState::Idle);
        assert_eq!(rig.plane.disconnect_count(), rig.plane.connect_count());
    }

    #[test]
    fn switches_respect_the_cooldown() {
        let rig = rig();
        let script: Vec<Step> = (0..3000)
            .map(|i| Step::Frame([0, 200, 350, 900][i % 4]))
            .collect();
        let mut control = rig.control(ScriptedCapture::new(script, Duration::from_micros(300)));

        control.start(&config()).unwrap();
        assert!(wait_until(|| rig.plane.changes().len() > 12));
        control.stop();

        let shows: Vec<Instant> = rig
            .plane
            .changes()
            .iter()
            .filter(|change| change.visible)
            .map(|change| change.at)
            .collect();
        // Timestamps are taken after the switch decision, allow for jitter.
        for pair in shows.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= SWITCH_COOLDOWN - Duration::from_millis(5));
        }
    }

    #[test]
    fn hide_all_policy_clears_the_overlay_on_stop() {
        let rig = rig();
        let mut control = rig.control(ScriptedCapture::new(vec![Step::Frame(300)], FRAME));
        let mut config = config();
        config.stop_policy = StopPolicy::HideAll;

        control.start(&config).unwrap();
        assert!(wait_until(|| !rig.plane.visible_items("Avatar").is_empty()));
        control.stop();

        assert!(rig.plane.visible_items("Avatar").is_empty());
    }

    #[test]
    fn leave_visible_policy_keeps_the_last_state() {
        let rig = rig();
        let mut control = rig.control(ScriptedCapture::new(vec![Step::Frame(300)], FRAME));

        control.start(&config()).unwrap();
        assert!(wait_until(|| !rig.plane.visible_items("Avatar").is_empty()));
        control.stop();

        assert_eq!(rig.plane.visible_items("Avatar"), vec![rig.items[2]]);
    }

    #[test]
    fn configuration_errors_keep_the_loop_idle() {
        let rig = rig();
        let capture = ScriptedCapture::new(Vec::new(), FRAME);
        let opened = capture.opened.clone();
        let mut control = rig.control(capture);

        let mut empty_range = config();
        empty_range.range = SelectionRange::new(7, 9).unwrap();
        let mut unknown_device = config();
        unknown_device.device = "Line In".into();
        let mut no_device = config();
        no_device.device = String::new();
        let mut undiscovered = config();
        undiscovered.key = CatalogKey::new("Stream", "Props");

        for bad in [empty_range, unknown_device, no_device, undiscovered] {
            let err = control.start(&bad).unwrap_err();
            assert!(matches!(err, VoiceLayerError::Configuration(_)), "{err}");
            assert_eq!(control.state(), LoopState::Idle);
        }
        assert_eq!(*opened.lock().unwrap(), 0);
        assert_eq!(rig.plane.connect_count(), 1);
        assert!(rig
            .statuses()
            .iter()
            .all(|status| matches!(status, LoopStatus::Error(_))));
    }

    #[test]
    fn connection_failure_is_reported_once() {
        let rig = rig();
        rig.plane.refuse_connections(true);
        let capture = ScriptedCapture::new(Vec::new(), FRAME);
        let opened = capture.opened.clone();
        let mut control = rig.control(capture);

        control.start(&config()).unwrap();
        assert!(wait_until(|| control.state() == LoopState::Idle));
        control.stop();

        let statuses = rig.statuses();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0], LoopStatus::Connecting);
        assert!(matches!(&statuses[1], LoopStatus::Error(msg) if msg.contains("refused")));
        assert_eq!(statuses[2], LoopStatus::Stopped);
        assert_eq!(*opened.lock().unwrap(), 0);
    }

    #[test]
    fn device_failures_release_the_session() {
        let rig = rig();
        let mut control = rig.control(ScriptedCapture::refusing());

        control.start(&config()).unwrap();
        assert!(wait_until(|| control.state() == LoopState::Idle));
        assert_eq!(rig.plane.disconnect_count(), rig.plane.connect_count());

        let mut control = rig.control(ScriptedCapture::new(
            vec![Step::Frame(0), Step::Fail("unplugged")],
            FRAME,
        ));
        control.start(&config()).unwrap();
        assert!(wait_until(|| control.state() == LoopState::Idle));
        assert_eq!(rig.plane.disconnect_count(), rig.plane.connect_count());
        assert!(rig
            .statuses()
            .iter()
            .any(|status| matches!(status, LoopStatus::Error(msg) if msg.contains("unplugged"))));
    }

    /// Runs once with a shared lifecycle log. With `runs_out` the worker is
    /// expected to end on its own before `stop`.
    fn run_logged(script: Vec<Step>, stop_policy: StopPolicy, runs_out: bool) -> (Rig, Vec<String>) {
        let rig = rig();
        let log = Arc::new(Mutex::new(Vec::new()));
        rig.plane.log_sessions_to(log.clone());
        let mut control = rig.control(ScriptedCapture::new(script, FRAME).logging_to(log.clone()));
        let mut config = config();
        config.stop_policy = stop_policy;

        control.start(&config).unwrap();
        if runs_out {
            assert!(wait_until(|| control.state() == LoopState::Idle));
        } else {
            assert!(wait_until(|| !rig.plane.visible_items("Avatar").is_empty()));
        }
        control.stop();

        let events = log.lock().unwrap().clone();
        (rig, events)
    }

    const TEARDOWN: [&str; 4] = ["connected", "device opened", "device released", "disconnected"];

    #[test]
    fn clean_stop_releases_device_before_session() {
        let (_rig, events) = run_logged(vec![Step::Frame(300)], StopPolicy::LeaveVisible, false);
        assert_eq!(events, TEARDOWN);
    }

    #[test]
    fn device_failure_releases_device_before_session() {
        let (rig, events) = run_logged(
            vec![Step::Frame(300), Step::Fail("unplugged")],
            StopPolicy::LeaveVisible,
            true,
        );
        assert_eq!(events, TEARDOWN);
        assert!(rig
            .statuses()
            .iter()
            .any(|status| matches!(status, LoopStatus::Error(_))));
    }

    #[test]
    fn hide_all_stop_releases_device_before_session() {
        let (rig, events) = run_logged(vec![Step::Frame(300)], StopPolicy::HideAll, false);
        assert_eq!(events, TEARDOWN);
        assert!(rig.plane.visible_items("Avatar").is_empty());
    }

    #[test]
    fn start_replaces_a_live_worker() {
        let rig = rig();
        let mut control = rig.control(ScriptedCapture::new(vec![Step::Frame(0)], FRAME));

        control.start(&config()).unwrap();
        assert!(wait_until(|| rig.plane.connect_count() == 2));
        control.start(&config()).unwrap();
        assert!(wait_until(|| rig.plane.connect_count() == 3));
        assert_eq!(rig.plane.disconnect_count(), 2);

        let mut narrower = config();
        narrower.range = SelectionRange::new(2, 3).unwrap();
        control.restart(&narrower).unwrap();
        assert_eq!(control.state(), LoopState::Running);
        control.stop();
        assert_eq!(rig.plane.disconnect_count(), rig.plane.connect_count());
    }

    #[test]
    fn discovery_is_refused_while_running() {
        let rig = rig();
        let mut control = rig.control(ScriptedCapture::new(vec![Step::Frame(0)], FRAME));

        control.start(&config()).unwrap();
        let err = control
            .discover(DiscoveryScope::Group(avatar()), DiscoveryMode::Refresh)
            .unwrap_err();
        assert!(matches!(err, VoiceLayerError::Busy(_)));
        control.stop();

        assert!(control
            .discover(DiscoveryScope::Group(avatar()), DiscoveryMode::Refresh)
            .is_ok());
    }

    #[test]
    fn runs_against_a_restored_catalog() {
        let rig = rig();
        let key = CatalogKey::new("Stream", "Props");
        let prop = rig.plane.add_source("Props", "1.png");
        rig.registry
            .store(key.clone(), GroupCatalog::from_named([("1.png".to_string(), prop)]));
        let mut control = rig.control(ScriptedCapture::new(vec![Step::Frame(900)], FRAME));

        let mut config = config();
        config.key = key;
        control.start(&config).unwrap();
        assert!(wait_until(|| rig.plane.is_visible("Props", prop) == Some(true)
            && rig.plane.changes().len() >= 2));
        control.stop();
    }
}
