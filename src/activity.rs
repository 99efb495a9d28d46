use crate::{
    config::ActivityConfig,
    events::{EventBus, FramepulseEvent},
    scheduler::{spawn_periodic, PeriodicTask},
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Keyboard allow-list sampled for gameplay input (virtual-key codes).
///
/// WASD, Space, Shift, Ctrl, Alt, Q, E, R, T, F, G, C, V, Tab, Esc, Enter
/// and the 1-5 row. Mouse input is deliberately not sampled: cursor movement
/// in menus would read as gameplay.
pub const GAMEPLAY_KEYS: [u16; 24] = [
    0x57, 0x41, 0x53, 0x44, // W A S D
    0x20, 0x10, 0x11, 0x12, // Space Shift Ctrl Alt
    0x51, 0x45, 0x52, 0x54, // Q E R T
    0x46, 0x47, 0x43, 0x56, // F G C V
    0x09, 0x1B, 0x0D, // Tab Esc Enter
    0x31, 0x32, 0x33, 0x34, 0x35, // 1-5
];

/// Number of controller slots polled per tick
pub const MAX_CONTROLLERS: usize = 4;

/// Snapshot of one controller's inputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub buttons: u16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub thumb_lx: i16,
    pub thumb_ly: i16,
    pub thumb_rx: i16,
    pub thumb_ry: i16,
}

/// External collaborator supplying foreground and raw input signals.
///
/// The core never touches OS window or input APIs itself; the embedding
/// application implements this against whatever platform it runs on.
pub trait ActivitySource: Send + Sync {
    /// Whether a tracked game process owns the foreground window
    fn is_game_in_foreground(&self) -> bool;

    /// Whether the given virtual key is currently held down
    fn is_key_down(&self, key: u16) -> bool;

    /// Current state of the controller in the given slot, if connected
    fn controller_state(&self, index: usize) -> Option<ControllerState>;
}

/// Session classification derived from the two gate signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    /// No tracked game in the foreground
    WaitingForGame,
    /// Game in foreground but no (recent) gameplay input
    Inactive,
    /// Game in foreground and the user is providing input
    Active,
}

/// Activity-gated recording state machine.
///
/// Polled on a fixed cadence (1.5 s). Classifies "game in foreground" and
/// "user providing input" into a recording/active state, raises transition
/// events, and fires a single upload trigger per sustained-inactivity
/// streak (10 ticks, ~15 s debounce). Input is only evaluated while the
/// game is in the foreground; losing the foreground collapses straight to
/// the never-seen-activity baseline with no grace period.
pub struct ActivityGate {
    config: ActivityConfig,
    source: Arc<dyn ActivitySource>,
    event_bus: EventBus,
    was_recording: bool,
    was_display_active: bool,
    has_ever_seen_activity: bool,
    inactivity_count: u32,
    upload_triggered: bool,
    last_controller_states: [ControllerState; MAX_CONTROLLERS],
}

impl ActivityGate {
    pub fn new(config: ActivityConfig, source: Arc<dyn ActivitySource>, event_bus: EventBus) -> Self {
        Self {
            config,
            source,
            event_bus,
            was_recording: false,
            was_display_active: false,
            has_ever_seen_activity: false,
            inactivity_count: 0,
            upload_triggered: false,
            last_controller_states: [ControllerState::default(); MAX_CONTROLLERS],
        }
    }

    /// Probe the foreground state once and announce it.
    ///
    /// Run when monitoring starts so callers don't wait a full poll interval
    /// for the initial recording status.
    pub fn prime(&mut self) {
        let recording = self.source.is_game_in_foreground();
        self.was_recording = recording;
        self.event_bus
            .publish_lossy(FramepulseEvent::RecordingStatusChanged {
                recording,
                timestamp: SystemTime::now(),
            });
        info!(
            "Activity gate primed: game {} foreground",
            if recording { "in" } else { "not in" }
        );
    }

    /// Evaluate one poll tick
    pub fn tick(&mut self) {
        let game_in_foreground = self.source.is_game_in_foreground();
        let mut has_activity = false;

        if game_in_foreground != self.was_recording {
            self.was_recording = game_in_foreground;
            self.event_bus
                .publish_lossy(FramepulseEvent::RecordingStatusChanged {
                    recording: game_in_foreground,
                    timestamp: SystemTime::now(),
                });
        }

        if game_in_foreground {
            has_activity = self.check_keyboard_input() || self.check_controller_input();
        } else {
            // Back to the baseline: no carryover of prior activity
            self.has_ever_seen_activity = false;
            self.inactivity_count = self.config.inactivity_ticks;
        }

        if has_activity {
            trace!("Input activity this tick");
            self.inactivity_count = 0;
            self.upload_triggered = false;
            self.has_ever_seen_activity = true;
        }

        // Inactive until input is first seen, then active until the debounce
        // runs out; prevents main-menu idling from reading as active
        let display_active = self.has_ever_seen_activity
            && self.inactivity_count < self.config.inactivity_ticks;
        if display_active != self.was_display_active {
            self.was_display_active = display_active;
            self.event_bus
                .publish_lossy(FramepulseEvent::ActivityStatusChanged {
                    active: display_active,
                    timestamp: SystemTime::now(),
                });
        }

        if !has_activity {
            self.inactivity_count =
                std::cmp::min(self.inactivity_count + 1, self.config.inactivity_ticks);
            if self.inactivity_count == self.config.inactivity_ticks && !self.upload_triggered {
                self.upload_triggered = true;
                debug!(
                    "{} consecutive inactive ticks, raising upload trigger",
                    self.inactivity_count
                );
                self.event_bus
                    .publish_lossy(FramepulseEvent::InactivityUploadTriggered {
                        timestamp: SystemTime::now(),
                    });
            }
        }
    }

    fn check_keyboard_input(&self) -> bool {
        GAMEPLAY_KEYS.iter().any(|&key| self.source.is_key_down(key))
    }

    fn check_controller_input(&mut self) -> bool {
        for index in 0..MAX_CONTROLLERS {
            if let Some(current) = self.source.controller_state(index) {
                if self.controller_state_changed(self.last_controller_states[index], current) {
                    self.last_controller_states[index] = current;
                    return true;
                }
            }
        }
        false
    }

    fn controller_state_changed(&self, old: ControllerState, current: ControllerState) -> bool {
        if old.buttons != current.buttons {
            return true;
        }

        let trigger_delta = self.config.trigger_delta as i16;
        if (old.left_trigger as i16 - current.left_trigger as i16).abs() > trigger_delta
            || (old.right_trigger as i16 - current.right_trigger as i16).abs() > trigger_delta
        {
            return true;
        }

        let threshold = self.config.thumbstick_delta as i32;
        if (old.thumb_lx as i32 - current.thumb_lx as i32).abs() > threshold
            || (old.thumb_ly as i32 - current.thumb_ly as i32).abs() > threshold
            || (old.thumb_rx as i32 - current.thumb_rx as i32).abs() > threshold
            || (old.thumb_ry as i32 - current.thumb_ry as i32).abs() > threshold
        {
            return true;
        }

        false
    }

    /// Current classification of the session
    pub fn state(&self) -> ActivityState {
        if !self.was_recording {
            ActivityState::WaitingForGame
        } else if self.was_display_active {
            ActivityState::Active
        } else {
            ActivityState::Inactive
        }
    }

    pub fn is_recording(&self) -> bool {
        self.was_recording
    }

    pub fn is_display_active(&self) -> bool {
        self.was_display_active
    }

    #[cfg(test)]
    fn inactivity_count(&self) -> u32 {
        self.inactivity_count
    }
}

/// Runs an [`ActivityGate`] on its poll cadence as a background task
pub struct ActivityGatePoller {
    gate: Arc<Mutex<ActivityGate>>,
    task: PeriodicTask,
}

impl ActivityGatePoller {
    /// Prime the gate and start polling
    pub fn spawn(
        config: ActivityConfig,
        source: Arc<dyn ActivitySource>,
        event_bus: EventBus,
        parent: &CancellationToken,
    ) -> Self {
        let interval = Duration::from_millis(config.poll_interval_ms);
        let gate = Arc::new(Mutex::new(ActivityGate::new(config, source, event_bus)));
        gate.lock().prime();

        let tick_gate = Arc::clone(&gate);
        let task = spawn_periodic("activity_gate", interval, parent, move || {
            tick_gate.lock().tick();
        });

        Self { gate, task }
    }

    pub fn state(&self) -> ActivityState {
        self.gate.lock().state()
    }

    /// Stop polling and wait for the task to exit
    pub async fn stop(self) {
        self.task.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramepulseConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scriptable activity source for driving the gate by hand
    struct MockSource {
        foreground: AtomicBool,
        key_down: AtomicBool,
        controller: Mutex<Option<ControllerState>>,
    }

    impl MockSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                foreground: AtomicBool::new(false),
                key_down: AtomicBool::new(false),
                controller: Mutex::new(None),
            })
        }

        fn set_foreground(&self, value: bool) {
            self.foreground.store(value, Ordering::SeqCst);
        }

        fn set_key_down(&self, value: bool) {
            self.key_down.store(value, Ordering::SeqCst);
        }

        fn set_controller(&self, state: Option<ControllerState>) {
            *self.controller.lock() = state;
        }
    }

    impl ActivitySource for MockSource {
        fn is_game_in_foreground(&self) -> bool {
            self.foreground.load(Ordering::SeqCst)
        }

        fn is_key_down(&self, _key: u16) -> bool {
            self.key_down.load(Ordering::SeqCst)
        }

        fn controller_state(&self, index: usize) -> Option<ControllerState> {
            if index == 0 {
                *self.controller.lock()
            } else {
                None
            }
        }
    }

    fn gate_with_source(source: Arc<MockSource>) -> (ActivityGate, EventBus) {
        let bus = EventBus::new(64);
        let config = FramepulseConfig::default().activity;
        (ActivityGate::new(config, source, bus.clone()), bus)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<FramepulseEvent>) -> Vec<FramepulseEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_starts_waiting_for_game() {
        let source = MockSource::new();
        let (gate, _bus) = gate_with_source(source);
        assert_eq!(gate.state(), ActivityState::WaitingForGame);
    }

    #[test]
    fn test_no_activity_before_first_input() {
        let source = MockSource::new();
        source.set_foreground(true);
        let (mut gate, _bus) = gate_with_source(Arc::clone(&source));

        // Game focused but nobody pressed anything yet: inactive, not active
        for _ in 0..5 {
            gate.tick();
        }
        assert_eq!(gate.state(), ActivityState::Inactive);
        assert!(!gate.is_display_active());
    }

    #[test]
    fn test_input_makes_active() {
        let source = MockSource::new();
        source.set_foreground(true);
        source.set_key_down(true);
        let (mut gate, bus) = gate_with_source(Arc::clone(&source));
        let mut rx = bus.subscribe();

        gate.tick();
        assert_eq!(gate.state(), ActivityState::Active);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            FramepulseEvent::ActivityStatusChanged { active: true, .. }
        )));
    }

    #[test]
    fn test_foreground_loss_collapses_immediately() {
        let source = MockSource::new();
        source.set_foreground(true);
        source.set_key_down(true);
        let (mut gate, _bus) = gate_with_source(Arc::clone(&source));

        gate.tick();
        assert!(gate.is_display_active());

        // One background tick: no grace period, no carryover
        source.set_foreground(false);
        source.set_key_down(false);
        gate.tick();
        assert!(!gate.is_display_active());
        assert_eq!(gate.state(), ActivityState::WaitingForGame);
    }

    #[test]
    fn test_single_upload_trigger_per_streak() {
        let source = MockSource::new();
        source.set_foreground(true);
        source.set_key_down(true);
        let (mut gate, bus) = gate_with_source(Arc::clone(&source));
        let mut rx = bus.subscribe();

        gate.tick();
        source.set_key_down(false);

        // Run well past the threshold: exactly one trigger
        for _ in 0..25 {
            gate.tick();
        }
        let triggers = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, FramepulseEvent::InactivityUploadTriggered { .. }))
            .count();
        assert_eq!(triggers, 1);

        // Activity rearms the trigger and resets the streak
        source.set_key_down(true);
        gate.tick();
        assert_eq!(gate.inactivity_count(), 0);
        source.set_key_down(false);
        for _ in 0..15 {
            gate.tick();
        }
        let triggers = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, FramepulseEvent::InactivityUploadTriggered { .. }))
            .count();
        assert_eq!(triggers, 1);
    }

    #[test]
    fn test_trigger_fires_on_tenth_inactive_tick() {
        let source = MockSource::new();
        source.set_foreground(true);
        source.set_key_down(true);
        let (mut gate, bus) = gate_with_source(Arc::clone(&source));
        let mut rx = bus.subscribe();

        gate.tick();
        source.set_key_down(false);
        drain(&mut rx);

        for _ in 0..9 {
            gate.tick();
        }
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, FramepulseEvent::InactivityUploadTriggered { .. })));

        gate.tick();
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, FramepulseEvent::InactivityUploadTriggered { .. })));
    }

    #[test]
    fn test_recording_status_changes_only_on_transition() {
        let source = MockSource::new();
        let (mut gate, bus) = gate_with_source(Arc::clone(&source));
        let mut rx = bus.subscribe();

        gate.tick();
        gate.tick();
        source.set_foreground(true);
        gate.tick();
        gate.tick();

        let recording_events = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, FramepulseEvent::RecordingStatusChanged { .. }))
            .count();
        assert_eq!(recording_events, 1);
    }

    #[test]
    fn test_controller_deltas() {
        let source = MockSource::new();
        source.set_foreground(true);
        let (mut gate, _bus) = gate_with_source(Arc::clone(&source));

        // Establish a baseline state
        source.set_controller(Some(ControllerState::default()));
        gate.tick();

        // Below thresholds: not activity
        source.set_controller(Some(ControllerState {
            left_trigger: 40,
            thumb_lx: 4000,
            ..Default::default()
        }));
        gate.tick();
        assert!(!gate.is_display_active());

        // Button bitmask change is always activity
        source.set_controller(Some(ControllerState {
            buttons: 0x0001,
            ..Default::default()
        }));
        gate.tick();
        assert!(gate.is_display_active());
    }

    #[test]
    fn test_thumbstick_delta_detected() {
        let source = MockSource::new();
        source.set_foreground(true);
        let (mut gate, _bus) = gate_with_source(Arc::clone(&source));

        source.set_controller(Some(ControllerState::default()));
        gate.tick();

        source.set_controller(Some(ControllerState {
            thumb_ry: 6000,
            ..Default::default()
        }));
        gate.tick();
        assert!(gate.is_display_active());
    }

    #[test]
    fn test_prime_announces_initial_state() {
        let source = MockSource::new();
        source.set_foreground(true);
        let (mut gate, bus) = gate_with_source(Arc::clone(&source));
        let mut rx = bus.subscribe();

        gate.prime();
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            FramepulseEvent::RecordingStatusChanged {
                recording: true,
                ..
            }
        )));
        assert!(gate.is_recording());
    }

    #[tokio::test]
    async fn test_poller_runs_and_stops() {
        let source = MockSource::new();
        source.set_foreground(true);
        let bus = EventBus::new(64);
        let mut config = FramepulseConfig::default().activity;
        config.poll_interval_ms = 10;
        let token = CancellationToken::new();

        let poller = ActivityGatePoller::spawn(config, source, bus, &token);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(poller.state(), ActivityState::Inactive);
        poller.stop().await;
    }
}
