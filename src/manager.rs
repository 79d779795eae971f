//! Controller side of program execution.
//!
//! The [`ProgramManager`] owns at most one sandbox and walks it through
//! `Idle -> Starting -> Running -> Idle`. While running it replays every change of the sandbox's
//! private cube onto the shared cube and only then acknowledges it, so the sandbox can never get
//! ahead of what is visible.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, PortReceiver, WorkerPort};
use crate::cube::{Cube, CubeError, CubeSnapshot, Move};
use crate::event::{Event, MutationOrigin};
use crate::inbox::MessageInbox;
use crate::protocol::{
    decode_payload, encode_payload, CrashReport, CubeStateSync, FailureReport, LogSync, Message, MessageData,
    MessageId, OverlaySync, ProtocolError, UiSync, WorkerCallbackSync, WorkerFinishedSync, WorkerStartSync,
};
use crate::sandbox::{SandboxError, SandboxInbound, SandboxSession};

/// Lifecycle of the manager's single sandbox slot.
///
/// `Starting` only lasts while the sandbox is spawned and the start request is posted; a failure
/// there goes straight back to `Idle` without raising an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramManagerState {
    Idle,
    Starting,
    Running,
}

impl fmt::Display for ProgramManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgramManagerState::Idle => "idle",
            ProgramManagerState::Starting => "starting",
            ProgramManagerState::Running => "running",
        };
        f.write_str(name)
    }
}

/// Raised on every transition of [`ProgramManagerState`], after the new state is visible through
/// [`ProgramManager::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramManagerStateChanged {
    pub old_state: ProgramManagerState,
    pub new_state: ProgramManagerState,
}

/// Terminal result of one program run. Exactly one is raised per successful `start`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramOutcome {
    Success,
    Failure(FailureReport),
    Crash(CrashReport),
    Aborted,
}

/// Errors from [`ProgramManager::start`] and [`ProgramManager::abort`].
///
/// Anything that goes wrong after the sandbox is running is reported as a [`ProgramOutcome`]
/// instead.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot {operation} while the program manager is {state}")]
    InvalidState {
        operation: &'static str,
        state: ProgramManagerState,
    },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cube(#[from] CubeError),
}

struct ManagerInner {
    state: ProgramManagerState,
    session: Option<SandboxSession>,
    /// Bumped on every start and abort; listeners of an older session ignore late messages.
    generation: u64,
}

/// Runs programs one at a time against a shared cube.
///
/// The manager is shared as `Arc<ProgramManager>`: listeners registered on a sandbox hold weak
/// references, so dropping the last handle lets a running session wind down.
pub struct ProgramManager {
    cube: Arc<Cube>,
    inner: Mutex<ManagerInner>,
    pub state_changed: Event<ProgramManagerStateChanged>,
    /// Log lines written by the running program.
    pub logged: Event<LogSync>,
    pub overlaid: Event<OverlaySync>,
    /// One [`ProgramOutcome`] per run.
    pub outcome: Event<ProgramOutcome>,
}

/// Inboxes for everything a sandbox sends to the controller.
struct ContextBus {
    cube_state_sync: MessageInbox<CubeStateSync>,
    ui_sync: MessageInbox<UiSync>,
    worker_finished_sync: MessageInbox<WorkerFinishedSync>,
}

impl ContextBus {
    fn new() -> Self {
        Self {
            cube_state_sync: MessageInbox::new(),
            ui_sync: MessageInbox::new(),
            worker_finished_sync: MessageInbox::new(),
        }
    }

    async fn relay(&self, message: &Message) {
        let matched = self.cube_state_sync.try_relay(message).await
            | self.ui_sync.try_relay(message).await
            | self.worker_finished_sync.try_relay(message).await;
        if !matched {
            warn!(message_type = message.message_type(), "controller ignored message");
        }
    }

    /// Relays inbound messages until the sandbox reports completion.
    ///
    /// A sandbox that goes away without reporting is turned into a crash outcome, using its crash
    /// report when it left one.
    async fn pump(self, inbound: SandboxInbound) {
        let SandboxInbound { mut messages, crash } = inbound;
        if self.relay_until_finished(&mut messages).await {
            return;
        }
        let report = crash.await.unwrap_or_else(|_| CrashReport {
            message: "sandbox exited without reporting completion".to_string(),
        });
        self.relay(&WorkerFinishedSync::crashed(report).into()).await;
    }

    async fn relay_until_finished(&self, messages: &mut PortReceiver) -> bool {
        while let Some(raw) = messages.recv().await {
            match Message::decode(&raw) {
                Ok(message) => {
                    let finished = WorkerFinishedSync::from_message(&message).is_some();
                    self.relay(&message).await;
                    if finished {
                        return true;
                    }
                }
                Err(err) => warn!(%err, "controller dropped undecodable message"),
            }
        }
        false
    }
}

impl ProgramManager {
    pub fn new(cube: Arc<Cube>) -> Arc<Self> {
        Arc::new(Self {
            cube,
            inner: Mutex::new(ManagerInner {
                state: ProgramManagerState::Idle,
                session: None,
                generation: 0,
            }),
            state_changed: Event::new(),
            logged: Event::new(),
            overlaid: Event::new(),
            outcome: Event::new(),
        })
    }

    pub fn state(&self) -> ProgramManagerState {
        self.inner.lock().expect("manager state poisoned").state
    }

    /// The shared cube programs are mirrored onto.
    pub fn cube(&self) -> &Arc<Cube> {
        &self.cube
    }

    /// Starts `program_code` in a fresh sandbox seeded with the shared cube's current state.
    ///
    /// Returns once the sandbox is running; the result arrives later through [`Self::outcome`].
    /// `animate` decides whether the program's moves are animated on the shared cube.
    pub fn start(self: &Arc<Self>, program_code: &str, animate: bool) -> Result<(), ManagerError> {
        let generation = {
            let mut inner = self.inner.lock().expect("manager state poisoned");
            if inner.state != ProgramManagerState::Idle {
                return Err(ManagerError::InvalidState {
                    operation: "start a program",
                    state: inner.state,
                });
            }
            inner.state = ProgramManagerState::Starting;
            inner.generation += 1;
            inner.generation
        };
        self.notify_state(ProgramManagerState::Idle, ProgramManagerState::Starting);

        match self.launch(program_code, animate, generation) {
            Ok(()) => {
                info!(generation, animate, "program started");
                Ok(())
            }
            Err(err) => {
                self.inner.lock().expect("manager state poisoned").state = ProgramManagerState::Idle;
                self.notify_state(ProgramManagerState::Starting, ProgramManagerState::Idle);
                error!(%err, "failed to start program");
                Err(err)
            }
        }
    }

    fn launch(self: &Arc<Self>, program_code: &str, animate: bool, generation: u64) -> Result<(), ManagerError> {
        let (session, inbound) = SandboxSession::spawn()?;
        let port = session.port();
        let bus = self.wire(port.clone(), animate, generation);

        let start = WorkerStartSync {
            id: MessageId::generate(),
            program_code: program_code.to_string(),
            cube_spec: encode_payload(&self.cube.spec())?,
            cube_solution_condition: encode_payload(&self.cube.solution_condition())?,
            cube_state: encode_payload(&self.cube.state())?,
        };
        port.post(&start.into())?;

        {
            let mut inner = self.inner.lock().expect("manager state poisoned");
            inner.session = Some(session);
            inner.state = ProgramManagerState::Running;
        }
        self.notify_state(ProgramManagerState::Starting, ProgramManagerState::Running);

        // The session must be running before the first message is relayed.
        let pump = tokio::spawn(bus.pump(inbound));
        let mut inner = self.inner.lock().expect("manager state poisoned");
        if inner.generation == generation {
            if let Some(session) = inner.session.as_mut() {
                session.attach_pump(pump);
            }
        }
        Ok(())
    }

    /// Registers the three controller listeners for one session.
    fn wire(self: &Arc<Self>, port: WorkerPort, animate: bool, generation: u64) -> ContextBus {
        let bus = ContextBus::new();

        {
            let manager = Arc::downgrade(self);
            let port = port.clone();
            bus.cube_state_sync.on(move |sync| {
                let manager = manager.clone();
                let port = port.clone();
                Box::pin(async move {
                    let Some(manager) = live(&manager, generation) else {
                        return;
                    };
                    if let Err(err) = manager.apply_cube_sync(&sync, animate).await {
                        warn!(%err, "failed to apply program change to the shared cube");
                    }
                    acknowledge(&port, sync.id);
                })
            });
        }

        {
            let manager = Arc::downgrade(self);
            bus.ui_sync.on_sync(move |sync| {
                let Some(manager) = live(&manager, generation) else {
                    return;
                };
                for log in &sync.logs {
                    manager.logged.trigger(log);
                }
                for overlay in &sync.overlays {
                    manager.overlaid.trigger(overlay);
                }
                acknowledge(&port, sync.id);
            });
        }

        {
            let manager = Arc::downgrade(self);
            bus.worker_finished_sync.on_sync(move |finished| {
                if let Some(manager) = manager.upgrade() {
                    manager.finish(generation, finished);
                }
            });
        }

        bus
    }

    async fn apply_cube_sync(&self, sync: &CubeStateSync, animate: bool) -> Result<(), ManagerError> {
        let origin = match decode_payload::<MutationOrigin>(&sync.source)? {
            // The sandbox has no history of its own to replay.
            MutationOrigin::HistoryReplay { .. } => MutationOrigin::Program,
            origin => origin,
        };
        match sync.cube_move.as_deref() {
            Some(raw) => {
                let mv: Move = decode_payload(raw)?;
                self.cube.apply_move(&mv, origin, animate).await?;
            }
            None => {
                let state: CubeSnapshot = decode_payload(&sync.state)?;
                self.cube.set_state(state, origin, animate).await?;
            }
        }
        Ok(())
    }

    fn finish(&self, generation: u64, finished: WorkerFinishedSync) {
        let session = {
            let mut inner = self.inner.lock().expect("manager state poisoned");
            if inner.generation != generation || inner.state != ProgramManagerState::Running {
                debug!(generation, "ignoring completion of a stale session");
                return;
            }
            inner.state = ProgramManagerState::Idle;
            inner.session.take()
        };
        // Runs on the session's own pump, so only the worker is killed here.
        drop(session);
        self.notify_state(ProgramManagerState::Running, ProgramManagerState::Idle);

        let outcome = match (finished.crash, finished.failure) {
            (Some(crash), _) => {
                debug!(message = %crash.message, "program sandbox crashed");
                ProgramOutcome::Crash(crash)
            }
            (None, Some(failure)) => {
                error!(message = %failure.message, "program failed");
                ProgramOutcome::Failure(failure)
            }
            (None, None) => {
                info!("program finished");
                ProgramOutcome::Success
            }
        };
        self.outcome.trigger(&outcome);
    }

    /// Kills the running sandbox. Changes it sent but that were not yet applied are dropped.
    pub fn abort(&self) -> Result<(), ManagerError> {
        let session = {
            let mut inner = self.inner.lock().expect("manager state poisoned");
            if inner.state != ProgramManagerState::Running {
                return Err(ManagerError::InvalidState {
                    operation: "abort",
                    state: inner.state,
                });
            }
            inner.generation += 1;
            inner.state = ProgramManagerState::Idle;
            inner.session.take()
        };
        if let Some(session) = session {
            session.terminate();
        }
        self.notify_state(ProgramManagerState::Running, ProgramManagerState::Idle);
        info!("program aborted");
        self.outcome.trigger(&ProgramOutcome::Aborted);
        Ok(())
    }

    fn notify_state(&self, old_state: ProgramManagerState, new_state: ProgramManagerState) {
        debug!(%old_state, %new_state, "program manager state");
        self.state_changed.trigger(&ProgramManagerStateChanged { old_state, new_state });
    }

    fn generation(&self) -> u64 {
        self.inner.lock().expect("manager state poisoned").generation
    }
}

fn live(manager: &Weak<ProgramManager>, generation: u64) -> Option<Arc<ProgramManager>> {
    manager.upgrade().filter(|manager| manager.generation() == generation)
}

fn acknowledge(port: &WorkerPort, original_id: MessageId) {
    if let Err(err) = port.post(&WorkerCallbackSync::acknowledging(original_id).into()) {
        debug!(%err, %original_id, "acknowledgment not delivered");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    use super::*;
    use crate::channel::port_pair;
    use crate::cube::{CubeSpec, Face, SolutionCondition};
    use crate::history::History;
    use crate::protocol::Level;

    fn shared_cube() -> Arc<Cube> {
        let spec = CubeSpec::new(3).unwrap();
        Arc::new(Cube::new(spec, SolutionCondition::Strict, CubeSnapshot::solved(spec)).unwrap())
    }

    fn outcomes(manager: &ProgramManager) -> mpsc::UnboundedReceiver<ProgramOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.outcome.on(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ProgramOutcome>) -> ProgramOutcome {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("outcome in time")
            .expect("outcome channel open")
    }

    #[tokio::test]
    async fn three_moves_are_mirrored_and_recorded() {
        let cube = shared_cube();
        let history = History::new(cube.clone());
        let manager = ProgramManager::new(cube.clone());

        let states = Arc::new(Mutex::new(Vec::new()));
        {
            let states = states.clone();
            manager
                .state_changed
                .on(move |change| states.lock().unwrap().push(change.new_state));
        }
        let mut rx = outcomes(&manager);

        manager.start("move R U' F2", false).unwrap();
        assert_eq!(next(&mut rx).await, ProgramOutcome::Success);

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ProgramManagerState::Starting,
                ProgramManagerState::Running,
                ProgramManagerState::Idle
            ]
        );
        assert_eq!(history.len(), 3);
        assert_eq!(history.current_position(), 2);

        let expected = Move::parse_sequence("R U' F2")
            .unwrap()
            .iter()
            .try_fold(CubeSnapshot::solved(cube.spec()), |state, mv| state.apply(mv))
            .unwrap();
        assert_eq!(cube.state(), expected);
        assert!(rx.try_recv().is_err(), "exactly one outcome");
    }

    #[tokio::test]
    async fn logs_and_overlays_reach_observers() {
        let manager = ProgramManager::new(shared_cube());
        let logs = Arc::new(Mutex::new(Vec::new()));
        {
            let logs = logs.clone();
            manager.logged.on(move |log| logs.lock().unwrap().push(log.clone()));
        }
        let overlays = Arc::new(Mutex::new(Vec::new()));
        {
            let overlays = overlays.clone();
            manager.overlaid.on(move |overlay| overlays.lock().unwrap().push(overlay.clone()));
        }
        let mut rx = outcomes(&manager);

        manager
            .start("log warning \"careful\"\noverlay success \"Done\" \"all good\" 500", false)
            .unwrap();
        assert_eq!(next(&mut rx).await, ProgramOutcome::Success);

        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "careful");
        assert_eq!(logs[0].level, Level::Warning);
        let overlays = overlays.lock().unwrap();
        assert_eq!(overlays[0].title, "Done");
        assert_eq!(overlays[0].duration, 500);
    }

    #[tokio::test]
    async fn throwing_program_fails_once() {
        let manager = ProgramManager::new(shared_cube());
        let mut rx = outcomes(&manager);

        manager.start("move R\nexpect_solved", false).unwrap();
        match next(&mut rx).await {
            ProgramOutcome::Failure(report) => {
                assert!(!report.message.is_empty());
                assert!(report.stack.contains("(program:2)"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(manager.state(), ProgramManagerState::Idle);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        // The manager is reusable afterwards.
        manager.start("", false).unwrap();
        assert_eq!(next(&mut rx).await, ProgramOutcome::Success);
    }

    #[tokio::test]
    async fn start_and_abort_are_rejected_in_the_wrong_state() {
        let manager = ProgramManager::new(shared_cube());
        assert!(matches!(
            manager.abort(),
            Err(ManagerError::InvalidState {
                state: ProgramManagerState::Idle,
                ..
            })
        ));

        let mut rx = outcomes(&manager);
        manager.start("sleep 200", false).unwrap();
        assert!(matches!(
            manager.start("", false),
            Err(ManagerError::InvalidState {
                state: ProgramManagerState::Running,
                ..
            })
        ));
        assert_eq!(next(&mut rx).await, ProgramOutcome::Success);
    }

    #[tokio::test]
    async fn abort_stops_mirroring() {
        let cube = shared_cube();
        let changes = Arc::new(Mutex::new(0usize));
        {
            let changes = changes.clone();
            cube.state_changed.on(move |_| *changes.lock().unwrap() += 1);
        }
        let manager = ProgramManager::new(cube.clone());
        let mut rx = outcomes(&manager);

        manager.start("repeat 10000\n  move R\n  sleep 5\nend", false).unwrap();
        timeout(Duration::from_secs(5), async {
            while *changes.lock().unwrap() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("program makes progress");

        manager.abort().unwrap();
        assert_eq!(manager.state(), ProgramManagerState::Idle);
        assert_eq!(next(&mut rx).await, ProgramOutcome::Aborted);

        let frozen = *changes.lock().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*changes.lock().unwrap(), frozen);
        assert!(rx.try_recv().is_err(), "no completion after abort");
    }

    /// Puts the manager into `Running` for a fresh generation and wires a bus for it, as `launch`
    /// does, without a real sandbox behind it.
    fn running_bus(manager: &Arc<ProgramManager>) -> (ContextBus, PortReceiver) {
        let generation = {
            let mut inner = manager.inner.lock().unwrap();
            inner.generation += 1;
            inner.state = ProgramManagerState::Running;
            inner.generation
        };
        let (port, acks) = port_pair();
        (manager.wire(port, false, generation), acks)
    }

    #[tokio::test]
    async fn sandbox_closing_without_completion_crashes_once() {
        let manager = ProgramManager::new(shared_cube());
        let mut rx = outcomes(&manager);
        let (bus, _acks) = running_bus(&manager);

        let (to_controller, messages) = port_pair();
        let (crash_tx, crash) = oneshot::channel::<CrashReport>();
        drop(crash_tx);
        drop(to_controller);
        timeout(Duration::from_secs(2), bus.pump(SandboxInbound { messages, crash }))
            .await
            .expect("pump ends when the sandbox is gone");

        assert_eq!(
            next(&mut rx).await,
            ProgramOutcome::Crash(CrashReport {
                message: "sandbox exited without reporting completion".to_string()
            })
        );
        assert_eq!(manager.state(), ProgramManagerState::Idle);
        assert!(rx.try_recv().is_err(), "exactly one outcome");
    }

    #[tokio::test]
    async fn crash_report_left_by_the_sandbox_is_forwarded() {
        let manager = ProgramManager::new(shared_cube());
        let mut rx = outcomes(&manager);
        let logs = Arc::new(Mutex::new(Vec::new()));
        {
            let logs = logs.clone();
            manager.logged.on(move |log| logs.lock().unwrap().push(log.message.clone()));
        }
        let (bus, mut acks) = running_bus(&manager);

        let (to_controller, messages) = port_pair();
        let (crash_tx, crash) = oneshot::channel();
        to_controller
            .post(&UiSync::log("before the crash", Level::Info).into())
            .unwrap();
        crash_tx
            .send(CrashReport {
                message: "sandbox panicked".into(),
            })
            .unwrap();
        drop(to_controller);
        timeout(Duration::from_secs(2), bus.pump(SandboxInbound { messages, crash }))
            .await
            .expect("pump ends when the sandbox is gone");

        assert_eq!(
            next(&mut rx).await,
            ProgramOutcome::Crash(CrashReport {
                message: "sandbox panicked".into()
            })
        );
        assert_eq!(manager.state(), ProgramManagerState::Idle);
        assert_eq!(*logs.lock().unwrap(), vec!["before the crash".to_string()]);
        assert!(acks.try_recv().is_ok(), "messages before the crash are still acknowledged");
        assert!(rx.try_recv().is_err(), "exactly one outcome");
    }

    #[tokio::test]
    async fn history_replay_from_the_sandbox_is_recorded_as_program() {
        let cube = shared_cube();
        let manager = ProgramManager::new(cube.clone());
        let origins = Arc::new(Mutex::new(Vec::new()));
        {
            let origins = origins.clone();
            cube.state_changed.on(move |change| origins.lock().unwrap().push(change.origin));
        }

        let sync = CubeStateSync {
            id: MessageId::generate(),
            state: encode_payload(&cube.state()).unwrap(),
            cube_move: Some(encode_payload(&Move::outer(Face::U, 1)).unwrap()),
            source: encode_payload(&MutationOrigin::HistoryReplay { delta: -1 }).unwrap(),
        };
        manager.apply_cube_sync(&sync, false).await.unwrap();

        assert_eq!(*origins.lock().unwrap(), vec![MutationOrigin::Program]);
    }
}
