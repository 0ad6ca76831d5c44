//! Dispatch controller: owns the pad registry, the executor and the session
//! telemetry, and turns inbound MIDI into alias executions.
//!
//! Lifecycle: `Disconnected` → `connect()` → `Running` → `shutdown()` →
//! `Terminated`. The transport delivers bytes on its own thread; the callback
//! only forwards them into a channel drained by `run()`. Executions are
//! spawned on a task tracker so a slow alias never holds up the next press.
//!
//! Lock order is state → telemetry and state → transport.

use crate::button::{Button, ButtonRegistry};
use crate::error::{ConnectionError, ControllerError, PortDirection, TelemetryError, TransportError};
use crate::executor::{AliasExecutor, ExecutionResult, ExecutorConfig};
use crate::grid::{self, palette, Coordinate};
use crate::midi::{InputCallback, MidiTransport};
use crate::sink::FileSink;
use crate::telemetry::{AliasEvent, ButtonEvent, NullSink, SessionSummary, SessionTelemetry, TelemetrySink};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PORT_NAME: &str = "Launchpad Mini MK3:Launchpad Mini MK3 LPMiniMK3 MI";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Case-sensitive substring matched against port names.
    pub port_name: String,
    pub client_name: String,
    /// Inbound messages queued between the transport thread and `run()`.
    pub channel_capacity: usize,
    /// `None` keeps telemetry in memory only.
    pub log_dir: Option<PathBuf>,
    pub executor: ExecutorConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port_name: DEFAULT_PORT_NAME.to_string(),
            client_name: "LaunchpadAlias".to_string(),
            channel_capacity: 32,
            log_dir: Some(PathBuf::from("logs")),
            executor: ExecutorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Running,
    Terminated,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Running => "running",
            SessionPhase::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not exactly three bytes.
    Malformed,
    Unmapped,
    NotRunning,
}

/// What a single inbound message led to.
#[derive(Debug)]
pub enum Dispatch {
    Ignored(IgnoreReason),
    Released {
        coordinate: Coordinate,
    },
    Pressed {
        coordinate: Coordinate,
        press_count: u64,
        /// Present when the pad has an alias. Dropping it detaches the task.
        execution: Option<JoinHandle<ExecutionResult>>,
    },
}

struct ControllerState {
    phase: SessionPhase,
    registry: ButtonRegistry,
}

pub struct DispatchController {
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    transport: Mutex<Box<dyn MidiTransport>>,
    output_open: AtomicBool,
    executor: Arc<AliasExecutor>,
    telemetry: Arc<SessionTelemetry>,
    executions: TaskTracker,
    cancel: CancellationToken,
    message_tx: mpsc::Sender<Vec<u8>>,
    message_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl DispatchController {
    /// Opens the session's telemetry files under `config.log_dir`, if set.
    pub fn new(
        config: ControllerConfig,
        transport: Box<dyn MidiTransport>,
    ) -> Result<Arc<Self>, TelemetryError> {
        let started_at = Utc::now();
        let sink: Box<dyn TelemetrySink> = match &config.log_dir {
            Some(dir) => {
                let session_id = crate::telemetry::session_id_for(started_at);
                Box::new(FileSink::create(dir.clone(), &session_id)?)
            }
            None => Box::new(NullSink),
        };
        let telemetry = Arc::new(SessionTelemetry::new(started_at, sink));
        Ok(Self::with_telemetry(config, transport, telemetry))
    }

    pub fn with_telemetry(
        config: ControllerConfig,
        transport: Box<dyn MidiTransport>,
        telemetry: Arc<SessionTelemetry>,
    ) -> Arc<Self> {
        let (message_tx, message_rx) = mpsc::channel(config.channel_capacity.max(1));
        let executor = Arc::new(AliasExecutor::new(config.executor.clone()));
        info!("Initializing dispatch controller (session {})", telemetry.session_id());

        Arc::new(Self {
            config,
            state: Mutex::new(ControllerState {
                phase: SessionPhase::Disconnected,
                registry: ButtonRegistry::new(),
            }),
            transport: Mutex::new(transport),
            output_open: AtomicBool::new(false),
            executor,
            telemetry,
            executions: TaskTracker::new(),
            cancel: CancellationToken::new(),
            message_tx,
            message_rx: Mutex::new(Some(message_rx)),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock_state().phase
    }

    pub fn executor(&self) -> &Arc<AliasExecutor> {
        &self.executor
    }

    pub fn telemetry(&self) -> &Arc<SessionTelemetry> {
        &self.telemetry
    }

    /// Cancelling the token stops `run()`, which then shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn button(&self, coordinate: Coordinate) -> Option<Button> {
        self.lock_state().registry.lookup(coordinate).cloned()
    }

    pub fn buttons(&self) -> Vec<Button> {
        self.lock_state().registry.all().cloned().collect()
    }

    /// Maps the pad at `(x, y)`, lights it and records a mapping-created event.
    pub fn add_mapping(
        &self,
        x: u8,
        y: u8,
        color: u8,
        alias: Option<&str>,
    ) -> Result<Button, ControllerError> {
        let mut state = self.lock_state();
        if state.phase == SessionPhase::Terminated {
            return Err(ControllerError::Terminated);
        }

        let button = state
            .registry
            .register(Coordinate::new(x, y), color, alias.map(str::to_string));
        if let Err(e) = self.send_color(button.note, button.color) {
            error!("Failed to set button color: {}", e);
        }
        if let Err(e) = self
            .telemetry
            .record_button_event(ButtonEvent::mapping_created(&button))
        {
            warn!("Failed to persist mapping event: {}", e);
        }
        drop(state);

        info!(
            "Mapped button: coordinates ({}, {}), alias {}, color {}, MIDI note {}",
            x,
            y,
            alias.unwrap_or("None"),
            color,
            button.note
        );
        Ok(button)
    }

    /// Opens the first input and output ports whose names contain the
    /// configured substring and starts forwarding inbound messages.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let mut state = self.lock_state();
        if state.phase != SessionPhase::Disconnected {
            return Err(ConnectionError::InvalidState(state.phase.as_str()));
        }

        let pattern = self.config.port_name.as_str();
        let mut transport = self.lock_transport();
        let inputs = transport.input_ports()?;
        let outputs = transport.output_ports()?;
        debug!("Available input ports: {:?}", inputs);
        debug!("Available output ports: {:?}", outputs);

        let input_index = find_port(&inputs, pattern).ok_or_else(|| ConnectionError::NoMatchingPort {
            direction: PortDirection::Input,
            pattern: pattern.to_string(),
            available: inputs.clone(),
        })?;
        let output_index = find_port(&outputs, pattern).ok_or_else(|| ConnectionError::NoMatchingPort {
            direction: PortDirection::Output,
            pattern: pattern.to_string(),
            available: outputs.clone(),
        })?;

        let tx = self.message_tx.clone();
        let callback: InputCallback = Box::new(move |_stamp, message| {
            if tx.try_send(message.to_vec()).is_err() {
                // Queue full or controller gone; the press is dropped.
            }
        });
        transport
            .open_input(input_index, callback)
            .map_err(|source| ConnectionError::Open {
                direction: PortDirection::Input,
                name: inputs[input_index].clone(),
                source,
            })?;
        if let Err(source) = transport.open_output(output_index) {
            if let Err(e) = transport.close() {
                warn!("Failed to close MIDI input after output failure: {}", e);
            }
            return Err(ConnectionError::Open {
                direction: PortDirection::Output,
                name: outputs[output_index].clone(),
                source,
            });
        }
        drop(transport);

        self.output_open.store(true, Ordering::SeqCst);
        state.phase = SessionPhase::Running;

        // Pads mapped before the output was open have not been lit yet.
        for button in state.registry.all() {
            if let Err(e) = self.send_color(button.note, button.color) {
                error!("Failed to set button color: {}", e);
            }
        }

        info!("Connected to Launchpad: {}", inputs[input_index]);
        Ok(())
    }

    /// Handles one inbound message. Must be called from within a Tokio
    /// runtime, since an alias execution is spawned for a mapped press.
    ///
    /// Only the velocity decides press or release. The status byte is not
    /// inspected: in programmer mode the Launchpad reports its top row and
    /// right column as CC, and those pads must still dispatch.
    pub fn handle_message(self: &Arc<Self>, message: &[u8]) -> Dispatch {
        let &[_status, note, velocity] = message else {
            return Dispatch::Ignored(IgnoreReason::Malformed);
        };
        let released = velocity == 0;
        let coordinate = grid::decode(u16::from(note));

        let mut state = self.lock_state();
        if state.phase != SessionPhase::Running {
            return Dispatch::Ignored(IgnoreReason::NotRunning);
        }

        if released {
            return match state.registry.lookup(coordinate) {
                Some(_) => {
                    debug!("Button released at {}", coordinate);
                    Dispatch::Released { coordinate }
                }
                None => Dispatch::Ignored(IgnoreReason::Unmapped),
            };
        }

        let Some(button) = state
            .registry
            .record_press(coordinate, velocity, Utc::now())
            .cloned()
        else {
            debug!("No button mapped at {} (note {})", coordinate, note);
            return Dispatch::Ignored(IgnoreReason::Unmapped);
        };

        let execution = button
            .alias
            .clone()
            .map(|alias| self.spawn_execution(alias, coordinate));
        drop(state);

        // The sink writes synchronously; keep that off the state lock.
        if let Err(e) = self
            .telemetry
            .record_button_event(ButtonEvent::pressed(&button, velocity))
        {
            warn!("Failed to persist button press: {}", e);
        }

        info!("Button press #{} at {}\n{}", button.press_count, coordinate, button);
        Dispatch::Pressed {
            coordinate,
            press_count: button.press_count,
            execution,
        }
    }

    fn spawn_execution(self: &Arc<Self>, alias: String, coordinate: Coordinate) -> JoinHandle<ExecutionResult> {
        let controller = Arc::clone(self);
        self.executions.spawn(async move {
            let result = controller.executor.execute(&alias).await;

            let event = AliasEvent {
                timestamp: Utc::now(),
                alias: alias.clone(),
                success: result.success,
                output: result.output.clone(),
                error: result.error.clone(),
            };
            if let Err(e) = controller.telemetry.record_alias_event(event) {
                warn!("Failed to persist alias execution: {}", e);
            }

            if result.success {
                info!("Alias execution succeeded: {}", alias);
            } else {
                warn!("Alias execution failed: {}", alias);
            }

            controller.confirm(coordinate);
            result
        })
    }

    /// Re-lights a pad in its mapped color once its alias has finished.
    fn confirm(&self, coordinate: Coordinate) {
        let state = self.lock_state();
        if state.phase != SessionPhase::Running {
            return;
        }
        if let Some(button) = state.registry.lookup(coordinate) {
            if let Err(e) = self.send_color(button.note, button.color) {
                warn!("Failed to refresh button color: {}", e);
            }
        }
    }

    fn send_color(&self, note: u16, color: u8) -> Result<(), TransportError> {
        if !self.output_open.load(Ordering::SeqCst) {
            debug!("MIDI output not open; color {} for note {} deferred", color, note);
            return Ok(());
        }
        let Some(message) = grid::note_on(note, color) else {
            warn!("Note {} does not fit a MIDI data byte; LED not updated", note);
            return Ok(());
        };
        self.lock_transport().send(&message)?;
        debug!("Set color {} for note {}", color, note);
        Ok(())
    }

    /// Drains inbound messages until cancelled, then shuts down.
    pub async fn run(self: &Arc<Self>) -> Option<SessionSummary> {
        let Some(mut message_rx) = self.lock_receiver().take() else {
            warn!("Dispatch loop is already running");
            return None;
        };

        info!("Starting MIDI message processing");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = message_rx.recv() => match received {
                    Some(message) => {
                        self.handle_message(&message);
                    }
                    None => break,
                },
            }
        }

        self.shutdown().await
    }

    /// Turns every mapped pad off, closes the ports and reports the session.
    /// Only the first call does anything; later calls return `None`.
    pub async fn shutdown(&self) -> Option<SessionSummary> {
        let buttons: Vec<Button> = {
            let mut state = self.lock_state();
            if state.phase == SessionPhase::Terminated {
                debug!("Shutdown already performed");
                return None;
            }
            state.phase = SessionPhase::Terminated;
            state.registry.all().cloned().collect()
        };

        info!("Shutting down...");
        self.cancel.cancel();

        for button in &buttons {
            if let Err(e) = self.send_color(button.note, palette::OFF) {
                error!("Failed to turn off button {}: {}", button.coordinate, e);
            }
        }

        self.output_open.store(false, Ordering::SeqCst);
        if let Err(e) = self.lock_transport().close() {
            error!("Failed to close MIDI ports: {}", e);
        }

        self.executions.close();
        let grace = self.executor.config().timeout + Duration::from_secs(1);
        if timeout(grace, self.executions.wait()).await.is_err() {
            warn!(
                "Abandoning {} alias execution(s) still in flight",
                self.executions.len()
            );
        }

        let summary = self.telemetry.finalize();
        log_summary(&summary, buttons.len());

        let stats = self.executor.stats();
        info!("   Execution Stats:");
        info!("      total: {}", stats.total);
        info!("      successful: {}", stats.successful);
        info!("      failed: {}", stats.failed);
        info!("      unique aliases: {}", stats.unique_aliases);

        Some(summary)
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_transport(&self) -> MutexGuard<'_, Box<dyn MidiTransport>> {
        self.transport.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_receiver(&self) -> MutexGuard<'_, Option<mpsc::Receiver<Vec<u8>>>> {
        self.message_rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn find_port(names: &[String], pattern: &str) -> Option<usize> {
    names.iter().position(|name| name.contains(pattern))
}

fn log_summary(summary: &SessionSummary, mapped_buttons: usize) {
    info!("Session Summary:");
    info!("   Session ID: {}", summary.session_id);
    info!("   Duration: {:.1}s", summary.duration_secs);
    info!("   Mapped Buttons: {}", mapped_buttons);
    info!("   Button Presses: {}", summary.total_button_presses);
    info!("   Alias Executions: {}", summary.total_alias_executions);
    info!("   Successful Aliases: {}", summary.successful_aliases);
    info!("   Failed Aliases: {}", summary.failed_aliases);
    for entry in summary.top_buttons.iter().take(5) {
        info!("      {} pressed {} time(s)", entry.coordinates, entry.count);
    }
    for entry in summary.top_aliases.iter().take(5) {
        info!("      {} ran {} time(s)", entry.alias, entry.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ButtonEventKind;
    use std::sync::atomic::AtomicUsize;

    const PAD: &str = "Launchpad Mini MK3 LPMiniMK3 MI";

    #[derive(Clone, Default)]
    struct MockHandles {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        callback: Arc<Mutex<Option<InputCallback>>>,
        closes: Arc<AtomicUsize>,
    }

    impl MockHandles {
        fn fire(&self, message: &[u8]) {
            if let Some(callback) = self.callback.lock().unwrap().as_mut() {
                callback(0, message);
            }
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        fn count_sent(&self, message: &[u8]) -> usize {
            self.sent().iter().filter(|m| m.as_slice() == message).count()
        }
    }

    struct MockTransport {
        inputs: Vec<String>,
        outputs: Vec<String>,
        fail_output: bool,
        output_open: bool,
        handles: MockHandles,
    }

    impl MockTransport {
        fn new(handles: MockHandles) -> Self {
            Self {
                inputs: vec!["Midi Through".to_string(), PAD.to_string()],
                outputs: vec!["Midi Through".to_string(), PAD.to_string()],
                fail_output: false,
                output_open: false,
                handles,
            }
        }
    }

    impl MidiTransport for MockTransport {
        fn input_ports(&self) -> Result<Vec<String>, TransportError> {
            Ok(self.inputs.clone())
        }

        fn output_ports(&self) -> Result<Vec<String>, TransportError> {
            Ok(self.outputs.clone())
        }

        fn open_input(&mut self, _index: usize, callback: InputCallback) -> Result<(), TransportError> {
            *self.handles.callback.lock().unwrap() = Some(callback);
            Ok(())
        }

        fn open_output(&mut self, _index: usize) -> Result<(), TransportError> {
            if self.fail_output {
                return Err(TransportError::Port("device busy".to_string()));
            }
            self.output_open = true;
            Ok(())
        }

        fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
            if !self.output_open {
                return Err(TransportError::NotOpen(PortDirection::Output));
            }
            self.handles.sent.lock().unwrap().push(message.to_vec());
            Ok(())
        }

        fn close(&mut self) -> Result<(), TransportError> {
            self.output_open = false;
            self.handles.callback.lock().unwrap().take();
            self.handles.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            port_name: "Launchpad Mini MK3".to_string(),
            log_dir: None,
            executor: ExecutorConfig {
                shell: PathBuf::from("/bin/sh"),
                interactive: false,
                timeout: Duration::from_secs(2),
            },
            ..ControllerConfig::default()
        }
    }

    fn create_test_controller(transport: MockTransport) -> Arc<DispatchController> {
        DispatchController::new(test_config(), Box::new(transport)).unwrap()
    }

    fn connected_controller() -> (Arc<DispatchController>, MockHandles) {
        let handles = MockHandles::default();
        let controller = create_test_controller(MockTransport::new(handles.clone()));
        controller.connect().unwrap();
        (controller, handles)
    }

    fn pressed_count(controller: &DispatchController) -> usize {
        controller
            .telemetry()
            .button_events()
            .iter()
            .filter(|e| e.event_type == ButtonEventKind::ButtonPressed)
            .count()
    }

    #[tokio::test]
    async fn test_press_runs_alias_end_to_end() {
        let (controller, handles) = connected_controller();
        controller
            .add_mapping(4, 4, palette::RED, Some("echo hi"))
            .unwrap();

        let dispatch = controller.handle_message(&[0x90, 44, 100]);

        let result = match dispatch {
            Dispatch::Pressed {
                coordinate,
                press_count,
                execution: Some(execution),
            } => {
                assert_eq!(coordinate, Coordinate::new(4, 4));
                assert_eq!(press_count, 1);
                execution.await.unwrap()
            }
            other => panic!("Expected press with execution, got {:?}", other),
        };
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("hi"));

        assert_eq!(pressed_count(&controller), 1);
        let alias_events = controller.telemetry().alias_events();
        assert_eq!(alias_events.len(), 1);
        assert!(alias_events[0].success);
        assert_eq!(alias_events[0].alias, "echo hi");
        assert_eq!(controller.button(Coordinate::new(4, 4)).unwrap().press_count, 1);

        // Lit on mapping, re-lit once the alias finished.
        assert_eq!(handles.count_sent(&[0x90, 44, palette::RED]), 2);
    }

    #[tokio::test]
    async fn test_run_loop_dispatches_callback_messages() {
        let (controller, handles) = connected_controller();
        controller
            .add_mapping(1, 5, palette::BLUE, Some("echo from-run"))
            .unwrap();

        let runner = Arc::clone(&controller);
        let run = tokio::spawn(async move { runner.run().await });

        handles.fire(&[0x90, 51, 127]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while controller.telemetry().alias_events().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "alias never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        controller.cancellation_token().cancel();
        let summary = run.await.unwrap().expect("run should produce a summary");

        assert_eq!(summary.total_button_presses, 1);
        assert_eq!(summary.total_alias_executions, 1);
        assert_eq!(summary.successful_aliases, 1);
        assert_eq!(controller.phase(), SessionPhase::Terminated);
        assert_eq!(handles.closes.load(Ordering::SeqCst), 1);
        assert_eq!(handles.count_sent(&[0x90, 51, palette::OFF]), 1);
    }

    #[tokio::test]
    async fn test_malformed_messages_change_nothing() {
        let (controller, _handles) = connected_controller();
        controller.add_mapping(4, 4, palette::RED, Some("echo hi")).unwrap();
        let events_before = controller.telemetry().button_events().len();

        for message in [&[0x90, 44][..], &[0x90, 44, 100, 0][..], &[][..]] {
            match controller.handle_message(message) {
                Dispatch::Ignored(IgnoreReason::Malformed) => {}
                other => panic!("Expected malformed, got {:?}", other),
            }
        }

        assert_eq!(controller.telemetry().button_events().len(), events_before);
        assert!(controller.telemetry().alias_events().is_empty());
        assert_eq!(controller.button(Coordinate::new(4, 4)).unwrap().press_count, 0);
    }

    #[tokio::test]
    async fn test_unmapped_press_is_ignored() {
        let (controller, _handles) = connected_controller();
        controller.add_mapping(4, 4, palette::RED, Some("echo hi")).unwrap();

        match controller.handle_message(&[0x90, 45, 100]) {
            Dispatch::Ignored(IgnoreReason::Unmapped) => {}
            other => panic!("Expected unmapped, got {:?}", other),
        }
        assert_eq!(pressed_count(&controller), 0);
    }

    #[tokio::test]
    async fn test_release_does_not_execute() {
        let (controller, _handles) = connected_controller();
        controller.add_mapping(4, 4, palette::RED, Some("echo hi")).unwrap();

        for message in [[0x90, 44, 0], [0x80, 44, 0], [0xB0, 44, 0]] {
            match controller.handle_message(&message) {
                Dispatch::Released { coordinate } => assert_eq!(coordinate, Coordinate::new(4, 4)),
                other => panic!("Expected release, got {:?}", other),
            }
        }

        assert_eq!(controller.button(Coordinate::new(4, 4)).unwrap().press_count, 0);
        assert_eq!(pressed_count(&controller), 0);
        assert!(controller.executor().history().is_empty());
    }

    #[tokio::test]
    async fn test_press_is_decided_by_velocity_not_status() {
        let (controller, _handles) = connected_controller();
        controller.add_mapping(4, 4, palette::RED, None).unwrap();
        controller.add_mapping(9, 1, palette::PURPLE, None).unwrap();

        // Note-Off with a release velocity, and a CC from the right column.
        let cases: [([u8; 3], Coordinate); 2] = [
            ([0x80, 44, 64], Coordinate::new(4, 4)),
            ([0xB0, 19, 127], Coordinate::new(9, 1)),
        ];
        for (message, expected) in cases {
            match controller.handle_message(&message) {
                Dispatch::Pressed {
                    coordinate,
                    press_count: 1,
                    ..
                } => assert_eq!(coordinate, expected),
                other => panic!("Expected press, got {:?}", other),
            }
        }

        assert_eq!(controller.button(Coordinate::new(4, 4)).unwrap().press_count, 1);
        assert_eq!(controller.button(Coordinate::new(9, 1)).unwrap().press_count, 1);
        assert_eq!(pressed_count(&controller), 2);
    }

    #[tokio::test]
    async fn test_press_without_alias_is_tracked_only() {
        let (controller, _handles) = connected_controller();
        controller.add_mapping(2, 2, palette::GREEN, None).unwrap();

        match controller.handle_message(&[0x90, 22, 90]) {
            Dispatch::Pressed {
                press_count: 1,
                execution: None,
                ..
            } => {}
            other => panic!("Expected press without execution, got {:?}", other),
        }
        assert_eq!(pressed_count(&controller), 1);
        assert!(controller.executor().history().is_empty());
    }

    #[tokio::test]
    async fn test_slow_alias_does_not_block_next_press() {
        let (controller, _handles) = connected_controller();
        controller.add_mapping(0, 0, palette::RED, Some("sleep 1")).unwrap();
        controller.add_mapping(1, 0, palette::GREEN, Some("echo fast")).unwrap();

        let slow = match controller.handle_message(&[0x90, 0, 100]) {
            Dispatch::Pressed { execution: Some(h), .. } => h,
            other => panic!("Expected press, got {:?}", other),
        };
        let fast = match controller.handle_message(&[0x90, 1, 100]) {
            Dispatch::Pressed { execution: Some(h), .. } => h,
            other => panic!("Expected press, got {:?}", other),
        };

        let fast_result = timeout(Duration::from_millis(800), fast)
            .await
            .expect("fast alias waited on slow alias")
            .unwrap();
        assert_eq!(fast_result.output.as_deref(), Some("fast"));
        assert!(!slow.is_finished());
        assert!(slow.await.unwrap().success);
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let (controller, handles) = connected_controller();
        controller.add_mapping(4, 4, palette::RED, Some("echo hi")).unwrap();
        controller.add_mapping(1, 1, palette::GREEN, None).unwrap();
        if let Dispatch::Pressed { execution: Some(h), .. } = controller.handle_message(&[0x90, 44, 100]) {
            h.await.unwrap();
        }

        let first = controller.shutdown().await.expect("first shutdown reports");
        let second = controller.shutdown().await;

        assert!(second.is_none());
        assert_eq!(first.total_alias_executions, 1);
        assert_eq!(handles.closes.load(Ordering::SeqCst), 1);
        assert_eq!(handles.count_sent(&[0x90, 44, 0]), 1);
        assert_eq!(handles.count_sent(&[0x90, 11, 0]), 1);
        assert_eq!(controller.phase(), SessionPhase::Terminated);
    }

    #[tokio::test]
    async fn test_concurrent_shutdowns_coalesce() {
        let (controller, handles) = connected_controller();
        controller.add_mapping(4, 4, palette::RED, Some("echo hi")).unwrap();

        let runner = Arc::clone(&controller);
        let run = tokio::spawn(async move { runner.run().await });
        tokio::task::yield_now().await;

        controller.cancellation_token().cancel();
        let (first, second) = tokio::join!(controller.shutdown(), controller.shutdown());
        let from_run = run.await.unwrap();

        let reports = [first, second, from_run].into_iter().flatten().count();
        assert_eq!(reports, 1);
        assert_eq!(handles.closes.load(Ordering::SeqCst), 1);
        assert_eq!(handles.count_sent(&[0x90, 44, palette::OFF]), 1);
        assert_eq!(controller.phase(), SessionPhase::Terminated);
    }

    #[tokio::test]
    async fn test_terminated_controller_rejects_work() {
        let (controller, _handles) = connected_controller();
        controller.add_mapping(4, 4, palette::RED, Some("echo hi")).unwrap();
        controller.shutdown().await;

        match controller.handle_message(&[0x90, 44, 100]) {
            Dispatch::Ignored(IgnoreReason::NotRunning) => {}
            other => panic!("Expected not running, got {:?}", other),
        }
        assert!(matches!(
            controller.add_mapping(1, 1, palette::GREEN, None),
            Err(ControllerError::Terminated)
        ));
        assert!(matches!(
            controller.connect(),
            Err(ConnectionError::InvalidState("terminated"))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_inflight_execution() {
        let (controller, _handles) = connected_controller();
        controller.add_mapping(3, 3, palette::CYAN, Some("sleep 0.3; echo late")).unwrap();
        controller.handle_message(&[0x90, 33, 100]);

        let summary = controller.shutdown().await.unwrap();

        assert_eq!(summary.total_alias_executions, 1);
        assert_eq!(summary.successful_aliases, 1);
    }

    #[test]
    fn test_connect_without_matching_port_fails() {
        let handles = MockHandles::default();
        let mut transport = MockTransport::new(handles.clone());
        transport.inputs = vec!["Midi Through".to_string()];
        let controller = create_test_controller(transport);

        match controller.connect() {
            Err(ConnectionError::NoMatchingPort {
                direction: PortDirection::Input,
                available,
                ..
            }) => assert_eq!(available, vec!["Midi Through".to_string()]),
            other => panic!("Expected no matching port, got {:?}", other),
        }
        assert_eq!(controller.phase(), SessionPhase::Disconnected);
    }

    #[test]
    fn test_port_match_is_case_sensitive() {
        let names = vec!["launchpad mini mk3".to_string(), PAD.to_string()];
        assert_eq!(find_port(&names, "Launchpad Mini MK3"), Some(1));
        assert_eq!(find_port(&names, "APC"), None);
    }

    #[test]
    fn test_output_open_failure_closes_input() {
        let handles = MockHandles::default();
        let mut transport = MockTransport::new(handles.clone());
        transport.fail_output = true;
        let controller = create_test_controller(transport);

        match controller.connect() {
            Err(ConnectionError::Open {
                direction: PortDirection::Output,
                ..
            }) => {}
            other => panic!("Expected output open failure, got {:?}", other),
        }
        assert_eq!(handles.closes.load(Ordering::SeqCst), 1);
        assert_eq!(controller.phase(), SessionPhase::Disconnected);
    }

    #[test]
    fn test_mappings_are_lit_on_connect() {
        let handles = MockHandles::default();
        let controller = create_test_controller(MockTransport::new(handles.clone()));
        controller.add_mapping(4, 4, palette::RED, Some("claude1")).unwrap();
        controller.add_mapping(1, 5, palette::BLUE, Some("claude3")).unwrap();
        assert!(handles.sent().is_empty());

        controller.connect().unwrap();

        assert_eq!(
            handles.sent(),
            vec![vec![0x90, 44, palette::RED], vec![0x90, 51, palette::BLUE]]
        );
        let mapped = controller
            .telemetry()
            .button_events()
            .iter()
            .filter(|e| e.event_type == ButtonEventKind::MappingCreated)
            .count();
        assert_eq!(mapped, 2);
    }

    #[tokio::test]
    async fn test_telemetry_files_written_under_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let handles = MockHandles::default();
        let config = ControllerConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..test_config()
        };
        let controller = DispatchController::new(config, Box::new(MockTransport::new(handles))).unwrap();
        controller.connect().unwrap();
        controller.add_mapping(4, 4, palette::RED, Some("echo hi")).unwrap();
        if let Dispatch::Pressed { execution: Some(h), .. } = controller.handle_message(&[0x90, 44, 100]) {
            h.await.unwrap();
        }
        let summary = controller.shutdown().await.unwrap();

        let sid = summary.session_id;
        for name in [
            format!("button_presses_{}.json", sid),
            format!("alias_executions_{}.json", sid),
            format!("button_mapping_{}.log", sid),
            format!("alias_execution_{}.log", sid),
            format!("session_summary_{}.json", sid),
        ] {
            assert!(dir.path().join(&name).exists(), "missing {}", name);
        }
    }
}
