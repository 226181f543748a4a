//! `Link`: the public façade
//!
//! A `Link` owns one peer in the network. It offers two ways to read and
//! change the session:
//!
//! - the **control path** ([`Link::capture_app_session_state`] /
//!   [`Link::commit_app_session_state`]) for application threads; it may
//!   block briefly on a mutex
//! - the **real-time path** ([`RealtimeHandle`]) for the audio thread; it
//!   never blocks, locks or allocates
//!
//! Using both paths to change the same thing at the same time is not
//! supported: the last commit to be applied wins.
//!
//! ```ignore
//! let link = Link::new(120.0)?;
//! let mut audio = link.take_realtime_handle().unwrap();
//!
//! // audio callback
//! let mut state = audio.capture();
//! let beat = state.beat_at_time(output_time, 4.0)?;
//! audio.commit(state);
//!
//! // UI thread
//! link.on_tempo_changed(|bpm| println!("tempo {bpm:.1}"));
//! link.poll_events();
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::{LinkConfig, SettingsWatcher, UserSettings};
use crate::controller::{self, ControlCommand, ControllerHandle, EngineSlot, SessionCore};
use crate::error::{LinkError, LinkResult};
use crate::events::{event_channel, Callbacks, EventTracker, SessionEvent};
use crate::exchange::{RealtimeHandle, StatePublisher};
use crate::gc::gc_handle;
use crate::merge::SessionEngine;
use crate::session_state::SessionState;
use crate::timeline::{validate_tempo, Timeline};
use crate::transport::{LoopbackHub, PeerTransport};
use crate::types::{HostTime, PeerId, SessionId};
use std::sync::{Arc, Mutex, PoisonError};

/// One peer taking part in a tempo/beat/start-stop session
pub struct Link {
    id: PeerId,
    core: Arc<SessionCore>,
    threads: ControllerHandle,
    events: flume::Receiver<SessionEvent>,
    callbacks: Mutex<Callbacks>,
    /// Serializes `poll_events` callers
    dispatching: Mutex<()>,
    realtime: Mutex<Option<RealtimeHandle>>,
    _settings_watcher: Option<SettingsWatcher>,
}

impl Link {
    /// Create a link without a network transport
    ///
    /// The link behaves as a permanently solo session. Use
    /// [`Link::with_transport`] to connect it to peers.
    pub fn new(bpm: f64) -> LinkResult<Self> {
        let transport = Arc::new(LoopbackHub::new().endpoint());
        Self::with_transport(bpm, LinkConfig::default(), transport)
    }

    /// Create a link that exchanges session state through `transport`
    pub fn with_transport(bpm: f64, config: LinkConfig, transport: Arc<dyn PeerTransport>) -> LinkResult<Self> {
        Self::with_clock(bpm, config, transport, Arc::new(SystemClock::new()))
    }

    /// Create a link with an explicit host clock
    pub fn with_clock(
        bpm: f64,
        config: LinkConfig,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn Clock>,
    ) -> LinkResult<Self> {
        let bpm = validate_tempo(bpm)?;
        let now = clock.now();
        let timeline = Timeline::new(bpm, 0.0, now)?;

        let id = PeerId::random();
        let settings_path = config.settings.resolved_path();
        let settings = UserSettings::load(&settings_path);
        let active = config.session.start_active;

        let mut engine = SessionEngine::new(id, timeline, config.engine_config());
        engine.set_start_stop_sync(settings.start_stop_sync_enabled);
        engine.set_participating(active && settings.enabled, now);

        let (event_tx, events) = event_channel();
        let tracker = EventTracker::new(EngineSlot::observed(&engine), event_tx);
        let publisher = StatePublisher::new(gc_handle()?, engine.capture());
        let (realtime, rt_commits) = publisher.realtime_channel(config.session.realtime_queue_capacity);

        let (command_tx, command_rx) = crossbeam::channel::unbounded();
        let core = Arc::new(SessionCore::new(
            EngineSlot::new(engine, tracker),
            publisher,
            clock,
            command_tx.clone(),
            settings_path.clone(),
            active,
            settings,
        ));

        let threads = controller::spawn(
            core.clone(),
            transport,
            command_rx,
            rt_commits,
            config.controller_poll(),
        )
        .map_err(|source| LinkError::Spawn {
            name: "pulselink-controller",
            source,
        })?;

        let settings_watcher = if config.settings.watch {
            let tx = command_tx;
            match SettingsWatcher::spawn(&settings_path, move || {
                let _ = tx.send(ControlCommand::ReloadSettings);
            }) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::warn!("User settings will not be reloaded automatically: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        log::info!(
            "Link {} created at {:.2} bpm (enabled: {}, start/stop sync: {})",
            id,
            bpm,
            settings.enabled,
            settings.start_stop_sync_enabled
        );

        Ok(Self {
            id,
            core,
            threads,
            events,
            callbacks: Mutex::new(Callbacks::default()),
            dispatching: Mutex::new(()),
            realtime: Mutex::new(Some(realtime)),
            _settings_watcher: settings_watcher,
        })
    }

    /// This peer's id on the network
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Session this peer currently belongs to
    pub fn session_id(&self) -> SessionId {
        self.core.with_engine(|slot, _| slot.engine.session())
    }

    /// Current host time of the clock this link measures against
    pub fn now(&self) -> HostTime {
        self.core.clock().now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.core.clock().clone()
    }

    // ─────────────────────────────────────────────────────────────
    // Activity and settings
    // ─────────────────────────────────────────────────────────────

    /// Allow or forbid network participation
    ///
    /// The link takes part in sessions only while it is active and the user
    /// has enabled it.
    pub fn set_active(&self, active: bool) {
        self.core.set_active(active);
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// Whether the user allows network participation
    pub fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }

    /// Whether start/stop state is shared with peers
    pub fn is_start_stop_sync_enabled(&self) -> bool {
        self.core.is_start_stop_sync_enabled()
    }

    /// Whether at least one peer shares the session
    pub fn is_connected(&self) -> bool {
        self.num_peers() > 0
    }

    pub fn num_peers(&self) -> usize {
        self.core.publisher().load().state.num_peers()
    }

    /// Re-read the user settings file
    pub fn reload_user_settings(&self) {
        self.core.reload_settings();
    }

    // ─────────────────────────────────────────────────────────────
    // Callbacks
    // ─────────────────────────────────────────────────────────────

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_tempo_changed<F: FnMut(f64) + Send + 'static>(&self, f: F) {
        self.callbacks().on_tempo(Box::new(f));
    }

    pub fn on_num_peers_changed<F: FnMut(usize) + Send + 'static>(&self, f: F) {
        self.callbacks().on_num_peers(Box::new(f));
    }

    pub fn on_connected_changed<F: FnMut(bool) + Send + 'static>(&self, f: F) {
        self.callbacks().on_connected(Box::new(f));
    }

    pub fn on_start_stop_changed<F: FnMut(bool) + Send + 'static>(&self, f: F) {
        self.callbacks().on_start_stop(Box::new(f));
    }

    pub fn on_enabled_changed<F: FnMut(bool) + Send + 'static>(&self, f: F) {
        self.callbacks().on_enabled(Box::new(f));
    }

    pub fn on_start_stop_sync_enabled_changed<F: FnMut(bool) + Send + 'static>(&self, f: F) {
        self.callbacks().on_start_stop_sync_enabled(Box::new(f));
    }

    /// Run callbacks for every event since the last call
    ///
    /// Callbacks only ever run here, on the calling thread. A callback may
    /// register further callbacks, which first run for the next poll; it
    /// must not call `poll_events` itself. Returns the events that were
    /// dispatched.
    pub fn poll_events(&self) -> Vec<SessionEvent> {
        let _dispatching = self.dispatching.lock().unwrap_or_else(PoisonError::into_inner);
        let events: Vec<SessionEvent> = self.events.drain().collect();
        if events.is_empty() {
            return events;
        }

        // Run with the registry unlocked so callbacks can reach `on_*`
        let mut running = std::mem::take(&mut *self.callbacks());
        for event in &events {
            running.dispatch(*event);
        }
        let mut callbacks = self.callbacks();
        let registered = std::mem::replace(&mut *callbacks, running);
        callbacks.append(registered);
        events
    }

    // ─────────────────────────────────────────────────────────────
    // Session state
    // ─────────────────────────────────────────────────────────────

    /// Snapshot for application threads
    pub fn capture_app_session_state(&self) -> SessionState {
        self.core.with_engine(|slot, _| slot.engine.capture())
    }

    /// Apply the changes made to a snapshot from [`Link::capture_app_session_state`]
    pub fn commit_app_session_state(&self, state: SessionState) {
        if state.changes().is_empty() {
            return;
        }
        self.core
            .with_engine(|slot, now| slot.engine.commit_local(&state, now));
        self.core.wake();
    }

    /// The audio thread's capture/commit handle; `None` once taken
    pub fn take_realtime_handle(&self) -> Option<RealtimeHandle> {
        self.realtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // Queue a Bye for the controller's last flush
        self.core
            .with_engine(|slot, now| slot.engine.set_participating(false, now));
        self.threads.join(&self.core);
        log::info!("Link {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Config that never touches the user's real settings file
    fn isolated_config(dir: &tempfile::TempDir) -> LinkConfig {
        LinkConfig {
            settings: SettingsConfig {
                path: Some(dir.path().join("settings.yaml")),
                watch: false,
            },
            ..LinkConfig::default()
        }
    }

    fn solo_link(dir: &tempfile::TempDir, bpm: f64) -> Link {
        let transport = Arc::new(LoopbackHub::new().endpoint());
        Link::with_transport(bpm, isolated_config(dir), transport).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_rejects_invalid_tempo() {
        let dir = tempfile::tempdir().unwrap();
        for bpm in [0.0, -10.0, f64::NAN] {
            let transport = Arc::new(LoopbackHub::new().endpoint());
            let result = Link::with_transport(bpm, isolated_config(&dir), transport);
            assert!(matches!(result, Err(LinkError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let link = solo_link(&dir, 120.0);
        let state = link.capture_app_session_state();
        assert_eq!(state.tempo(), 120.0);
        assert!(!state.is_playing());
        assert!(link.is_active());
        assert!(link.is_enabled());
        assert!(!link.is_start_stop_sync_enabled());
        assert!(!link.is_connected());
    }

    #[test]
    fn test_app_commit_is_visible_to_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let link = solo_link(&dir, 120.0);
        let mut audio = link.take_realtime_handle().unwrap();
        assert!(link.take_realtime_handle().is_none());

        let mut state = link.capture_app_session_state();
        state.set_tempo(96.0, link.now()).unwrap();
        link.commit_app_session_state(state);

        assert_eq!(link.capture_app_session_state().tempo(), 96.0);
        assert_eq!(audio.capture().tempo(), 96.0);
    }

    #[test]
    fn test_realtime_commit_reaches_control_path() {
        let dir = tempfile::tempdir().unwrap();
        let link = solo_link(&dir, 120.0);
        let mut audio = link.take_realtime_handle().unwrap();

        let mut state = audio.capture();
        state.set_is_playing(true, link.now());
        audio.commit(state);
        assert!(audio.capture().is_playing());

        assert!(wait_until(|| link.capture_app_session_state().is_playing()));
    }

    #[test]
    fn test_tempo_callback_runs_on_poll() {
        let dir = tempfile::tempdir().unwrap();
        let link = solo_link(&dir, 120.0);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        link.on_tempo_changed(move |bpm| {
            assert_eq!(bpm, 75.0);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut state = link.capture_app_session_state();
        state.set_tempo(75.0, link.now()).unwrap();
        link.commit_app_session_state(state);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let events = link.poll_events();
        assert!(events.contains(&SessionEvent::TempoChanged(75.0)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_can_register_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let link = Arc::new(solo_link(&dir, 120.0));
        let calls = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&link);
        let seen = calls.clone();
        link.on_tempo_changed(move |_| {
            let Some(link) = weak.upgrade() else { return };
            let seen = seen.clone();
            link.on_tempo_changed(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        });

        for bpm in [80.0, 90.0] {
            let mut state = link.capture_app_session_state();
            state.set_tempo(bpm, link.now()).unwrap();
            link.commit_app_session_state(state);
            link.poll_events();
        }
        // Registered during the first poll, run once in the second
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_user_settings_emits_events() {
        let dir = tempfile::tempdir().unwrap();
        let link = solo_link(&dir, 120.0);
        let settings = UserSettings {
            enabled: false,
            start_stop_sync_enabled: true,
        };
        settings.save(&dir.path().join("settings.yaml")).unwrap();

        link.reload_user_settings();
        assert!(!link.is_enabled());
        assert!(link.is_start_stop_sync_enabled());
        let events = link.poll_events();
        assert!(events.contains(&SessionEvent::EnabledChanged(false)));
        assert!(events.contains(&SessionEvent::StartStopSyncEnabledChanged(true)));
    }
}
