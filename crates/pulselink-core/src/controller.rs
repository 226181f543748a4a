//! Controller thread and the state it shares with the control path
//!
//! The controller owns the network side of a `Link`: it applies real-time
//! commits, folds in peer messages, runs the engine timers and sends what the
//! engine queued. A second thread blocks on the transport and forwards what
//! arrives, so a slow network never stalls the controller loop.
//!
//! The engine itself sits behind a mutex in [`SessionCore`], shared with the
//! control path. Whoever holds the lock publishes the result before
//! releasing it, so the real-time path always sees the latest state.

use crate::clock::Clock;
use crate::config::UserSettings;
use crate::events::{EventTracker, Observed, SessionEvent};
use crate::exchange::{RealtimeCommits, StatePublisher};
use crate::merge::SessionEngine;
use crate::session_state::SessionState;
use crate::transport::{PeerTransport, TransportError, TransportEvent};
use crate::types::HostTime;
use crate::wire;
use crossbeam::channel::{Receiver, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// How long the receive thread blocks before checking for shutdown
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Commands for the controller thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlCommand {
    /// Something changed; service the engine now instead of at the next poll
    Wake,
    /// Re-read the user settings file
    ReloadSettings,
    Shutdown,
}

/// Engine plus the bookkeeping that has to change with it under one lock
pub(crate) struct EngineSlot {
    pub engine: SessionEngine,
    /// Id of the last real-time commit applied to `engine`
    pub rt_applied: u64,
    pub tracker: EventTracker,
    last_published: Option<(SessionState, u64)>,
}

impl EngineSlot {
    pub fn new(engine: SessionEngine, tracker: EventTracker) -> Self {
        Self {
            engine,
            rt_applied: 0,
            tracker,
            last_published: None,
        }
    }

    pub fn observed(engine: &SessionEngine) -> Observed {
        let state = engine.start_stop();
        Observed {
            tempo: engine.session_tempo(),
            num_peers: engine.num_peers(),
            is_playing: state.is_playing,
        }
    }

    fn publish(&mut self, publisher: &StatePublisher) {
        let state = self.engine.capture();
        let current = (state, self.rt_applied);
        if self.last_published == Some(current) {
            return;
        }
        publisher.publish(state, self.rt_applied);
        self.last_published = Some(current);
        self.tracker.observe(Self::observed(&self.engine));
    }
}

/// State shared by the `Link` façade and the controller thread
pub(crate) struct SessionCore {
    slot: Mutex<EngineSlot>,
    publisher: StatePublisher,
    clock: Arc<dyn Clock>,
    commands: Sender<ControlCommand>,
    settings_path: PathBuf,
    active: AtomicBool,
    enabled: AtomicBool,
    start_stop_sync: AtomicBool,
}

impl SessionCore {
    pub fn new(
        slot: EngineSlot,
        publisher: StatePublisher,
        clock: Arc<dyn Clock>,
        commands: Sender<ControlCommand>,
        settings_path: PathBuf,
        active: bool,
        settings: UserSettings,
    ) -> Self {
        Self {
            slot: Mutex::new(slot),
            publisher,
            clock,
            commands,
            settings_path,
            active: AtomicBool::new(active),
            enabled: AtomicBool::new(settings.enabled),
            start_stop_sync: AtomicBool::new(settings.start_stop_sync_enabled),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn publisher(&self) -> &StatePublisher {
        &self.publisher
    }

    /// Run `f` on the engine under the lock, then publish
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut EngineSlot, HostTime) -> R) -> R {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let result = f(&mut slot, now);
        slot.publish(&self.publisher);
        result
    }

    /// Nudge the controller thread
    pub fn wake(&self) {
        let _ = self.commands.send(ControlCommand::Wake);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ControlCommand::Shutdown);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_start_stop_sync_enabled(&self) -> bool {
        self.start_stop_sync.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        self.update_participation();
    }

    fn update_participation(&self) {
        let participating = self.is_active() && self.is_enabled();
        self.with_engine(|slot, now| slot.engine.set_participating(participating, now));
        self.wake();
    }

    /// Re-read the user settings file and apply any change
    pub fn reload_settings(&self) {
        let settings = UserSettings::load(&self.settings_path);
        self.apply_settings(settings);
    }

    pub fn apply_settings(&self, settings: UserSettings) {
        let was_enabled = self.enabled.swap(settings.enabled, Ordering::AcqRel);
        let was_sync = self
            .start_stop_sync
            .swap(settings.start_stop_sync_enabled, Ordering::AcqRel);
        let participating = self.is_active() && settings.enabled;

        self.with_engine(|slot, now| {
            slot.engine.set_start_stop_sync(settings.start_stop_sync_enabled);
            slot.engine.set_participating(participating, now);
            if was_enabled != settings.enabled {
                slot.tracker.emit(SessionEvent::EnabledChanged(settings.enabled));
            }
            if was_sync != settings.start_stop_sync_enabled {
                slot.tracker
                    .emit(SessionEvent::StartStopSyncEnabledChanged(settings.start_stop_sync_enabled));
            }
        });
        self.wake();
    }
}

/// Spawned controller and receive threads
pub(crate) struct ControllerHandle {
    controller: Option<thread::JoinHandle<()>>,
    receiver: Option<thread::JoinHandle<()>>,
    stop_receiver: Arc<AtomicBool>,
}

impl ControllerHandle {
    /// Stop both threads and wait for them; the controller flushes its outbox first
    pub fn join(&mut self, core: &SessionCore) {
        core.shutdown();
        self.stop_receiver.store(true, Ordering::Release);
        if let Some(handle) = self.controller.take() {
            if handle.join().is_err() {
                log::error!("Controller thread panicked");
            }
        }
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                log::error!("Receive thread panicked");
            }
        }
    }
}

/// Controller loop state
struct Controller {
    core: Arc<SessionCore>,
    transport: Arc<dyn PeerTransport>,
    commands: Receiver<ControlCommand>,
    inbound: Receiver<TransportEvent>,
    rt_commits: RealtimeCommits,
    poll: Duration,
}

/// Spawn the controller and receive threads
pub(crate) fn spawn(
    core: Arc<SessionCore>,
    transport: Arc<dyn PeerTransport>,
    commands: Receiver<ControlCommand>,
    rt_commits: RealtimeCommits,
    poll: Duration,
) -> std::io::Result<ControllerHandle> {
    let (inbound_tx, inbound_rx) = crossbeam::channel::unbounded();
    let stop_receiver = Arc::new(AtomicBool::new(false));

    let controller = Controller {
        core: core.clone(),
        transport: transport.clone(),
        commands,
        inbound: inbound_rx,
        rt_commits,
        poll,
    };
    let controller = thread::Builder::new()
        .name("pulselink-controller".into())
        .spawn(move || controller.run())?;

    let stop = stop_receiver.clone();
    let receiver = thread::Builder::new()
        .name("pulselink-rx".into())
        .spawn(move || receive_loop(transport, inbound_tx, stop));

    let mut handle = ControllerHandle {
        controller: Some(controller),
        receiver: None,
        stop_receiver,
    };
    match receiver {
        Ok(receiver) => {
            handle.receiver = Some(receiver);
            Ok(handle)
        }
        Err(e) => {
            handle.join(&core);
            Err(e)
        }
    }
}

/// What the controller loop does after one wait
enum Step {
    Service,
    ReloadSettings,
    ReceiverGone,
    Stop,
}

impl Controller {
    fn run(mut self) {
        log::info!("Controller started");
        let mut inbound = Vec::new();

        loop {
            let step = crossbeam::select! {
                recv(self.commands) -> cmd => match cmd {
                    Ok(ControlCommand::Wake) => Step::Service,
                    Ok(ControlCommand::ReloadSettings) => Step::ReloadSettings,
                    Ok(ControlCommand::Shutdown) | Err(_) => Step::Stop,
                },
                recv(self.inbound) -> event => match event {
                    Ok(event) => {
                        inbound.push(event);
                        inbound.extend(self.inbound.try_iter());
                        Step::Service
                    }
                    Err(_) => Step::ReceiverGone,
                },
                default(self.poll) => Step::Service,
            };

            match step {
                Step::Service => {}
                Step::ReloadSettings => self.core.reload_settings(),
                Step::ReceiverGone => {
                    log::warn!("Receive thread stopped; no more peer updates");
                    self.inbound = crossbeam::channel::never();
                }
                Step::Stop => {
                    self.service(&mut inbound);
                    break;
                }
            }
            self.service(&mut inbound);
        }

        log::info!("Controller stopped");
    }

    /// Apply pending input, run timers and send what the engine queued
    fn service(&mut self, inbound: &mut Vec<TransportEvent>) {
        let rt_commits = &mut self.rt_commits;
        let outbox = self.core.with_engine(|slot, now| {
            while let Some(commit) = rt_commits.pop() {
                slot.engine.commit_local(&commit.state, now);
                slot.rt_applied = commit.id;
            }
            for event in inbound.drain(..) {
                match event {
                    TransportEvent::Datagram(bytes) => match wire::decode(&bytes) {
                        Ok(message) => slot.engine.handle_message(message, now),
                        Err(e) => log::debug!("Dropping datagram: {}", e),
                    },
                    TransportEvent::PeerLost(peer) => slot.engine.peer_lost(peer),
                }
            }
            slot.engine.tick(now);
            slot.engine.drain_outbox()
        });

        for message in outbox {
            match wire::encode(&message) {
                Ok(bytes) => {
                    if let Err(e) = self.transport.send(&bytes) {
                        log::warn!("Failed to send peer message: {}", e);
                    }
                }
                Err(e) => log::warn!("Failed to encode peer message: {}", e),
            }
        }
    }
}

/// Forward transport events to the controller until told to stop
fn receive_loop(transport: Arc<dyn PeerTransport>, tx: Sender<TransportEvent>, stop: Arc<AtomicBool>) {
    log::debug!("Receive thread started");
    while !stop.load(Ordering::Acquire) {
        match transport.recv(RECV_TIMEOUT) {
            Ok(Some(event)) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(TransportError::Closed) => {
                log::warn!("Transport closed");
                break;
            }
            Err(e) => {
                log::warn!("Transport receive failed: {}", e);
                thread::sleep(RECV_TIMEOUT);
            }
        }
    }
    log::debug!("Receive thread stopped");
}
