//! Worker side of a sandbox: the thread entry point, the inbound message bus and the
//! [`ExecutionContext`] that runs one program against a private cube.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::api::{CubeApi, ExecutionApi, ForwardQueue, SystemApi, UiApi};
use super::script::{Interpreter, Program, ProgramFailure};
use super::SandboxError;
use crate::channel::{AcknowledgedChannel, PortReceiver, WorkerPort};
use crate::cube::{Cube, CubeSnapshot, CubeSpec, SolutionCondition};
use crate::event::ChangeEvent;
use crate::inbox::MessageInbox;
use crate::protocol::{
    decode_payload, encode_payload, CrashReport, CubeStateSync, Message, MessageId, ProtocolError,
    WorkerCallbackSync, WorkerFinishedSync, WorkerStartSync,
};

/// Name the submitted program text is reported under in stack frames.
const PROGRAM_FILE: &str = "program";

/// Inbound side of the worker: start requests and acknowledgments.
struct ProgramWorkerBus {
    worker_start_sync: MessageInbox<WorkerStartSync>,
    worker_callback_sync: MessageInbox<WorkerCallbackSync>,
}

impl ProgramWorkerBus {
    fn new(channel: Arc<AcknowledgedChannel>) -> Self {
        let bus = Self {
            worker_start_sync: MessageInbox::new(),
            worker_callback_sync: MessageInbox::new(),
        };
        bus.worker_callback_sync.on_sync(move |callback| {
            channel.acknowledge(&callback);
        });
        bus
    }

    async fn relay(&self, message: &Message) {
        let matched = self.worker_start_sync.try_relay(message).await | self.worker_callback_sync.try_relay(message).await;
        if !matched {
            debug!(message_type = message.message_type(), "sandbox ignored message");
        }
    }

    async fn pump(self: Arc<Self>, mut inbound: PortReceiver) {
        while let Some(raw) = inbound.recv().await {
            match Message::decode(&raw) {
                Ok(message) => self.relay(&message).await,
                Err(err) => warn!(%err, "sandbox dropped undecodable message"),
            }
        }
    }
}

/// Private cube plus the capability surface of one program run.
pub struct ExecutionContext {
    api: ExecutionApi,
}

impl ExecutionContext {
    /// Builds the private cube described by `start` and starts forwarding its changes.
    pub fn bootstrap(start: &WorkerStartSync, channel: Arc<AcknowledgedChannel>) -> Result<Self, SandboxError> {
        let spec: CubeSpec = decode_payload(&start.cube_spec)?;
        let spec = CubeSpec::new(spec.edge_length)?;
        let condition: SolutionCondition = decode_payload(&start.cube_solution_condition)?;
        let state: CubeSnapshot = decode_payload(&start.cube_state)?;
        let cube = Arc::new(Cube::new(spec, condition, state)?);

        let forwarded: ForwardQueue = Arc::new(Mutex::new(VecDeque::new()));
        {
            let channel = channel.clone();
            let forwarded = forwarded.clone();
            cube.state_changed.on(move |event: &ChangeEvent| {
                let sync = match cube_state_sync(event) {
                    Ok(sync) => sync,
                    Err(err) => {
                        error!(%err, "failed to encode cube change");
                        return;
                    }
                };
                match channel.send(sync) {
                    Ok(ack) => forwarded.lock().expect("forward queue poisoned").push_back(ack),
                    Err(err) => error!(%err, "failed to forward cube change"),
                }
            });
        }

        Ok(Self {
            api: ExecutionApi {
                ui: UiApi::new(channel),
                cube: CubeApi::new(cube, forwarded),
                system: SystemApi::new(),
            },
        })
    }

    /// Runs `program_code` to completion and describes the outcome.
    pub async fn run(&self, program_code: &str) -> WorkerFinishedSync {
        let outcome = match Program::parse(PROGRAM_FILE, program_code) {
            Ok(program) => Interpreter::new(&self.api).run(&program).await,
            Err(err) => Err(ProgramFailure::from(err)),
        };
        match outcome {
            Ok(()) => WorkerFinishedSync::success(),
            Err(failure) => {
                debug!(message = %failure.message, "program failed");
                WorkerFinishedSync::failed(failure.into_report())
            }
        }
    }
}

fn cube_state_sync(event: &ChangeEvent) -> Result<CubeStateSync, ProtocolError> {
    Ok(CubeStateSync {
        id: MessageId::generate(),
        state: encode_payload(&event.new_state)?,
        cube_move: event.cube_move.as_ref().map(encode_payload).transpose()?,
        source: encode_payload(&event.origin)?,
    })
}

/// Waits for the start request, runs the program, reports completion and closes.
async fn run_worker(inbound: PortReceiver, outbound: WorkerPort) -> Result<(), SandboxError> {
    let channel = Arc::new(AcknowledgedChannel::new(outbound));
    let bus = Arc::new(ProgramWorkerBus::new(channel.clone()));

    let (start_tx, start_rx) = oneshot::channel();
    let start_tx = Mutex::new(Some(start_tx));
    bus.worker_start_sync.on_sync(move |start| {
        match start_tx.lock().expect("start slot poisoned").take() {
            Some(tx) => {
                let _ = tx.send(start);
            }
            None => warn!("sandbox ignored a second start request"),
        }
    });

    let pump = tokio::spawn(bus.pump(inbound));

    let start = start_rx
        .await
        .map_err(|_| SandboxError::Bootstrap("controller closed before sending a start request".to_string()))?;
    let context = ExecutionContext::bootstrap(&start, channel.clone())?;

    let finished = context.run(&start.program_code).await;
    channel.post(finished)?;

    channel.teardown();
    pump.abort();
    Ok(())
}

/// Thread entry point. Any bootstrap error or panic is reported through `crash`.
pub(crate) fn worker_thread_main(
    inbound: PortReceiver,
    outbound: WorkerPort,
    kill: oneshot::Receiver<()>,
    crash: oneshot::Sender<CrashReport>,
) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(move || -> Result<(), SandboxError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SandboxError::Runtime)?;
        runtime.block_on(async move {
            tokio::select! {
                result = run_worker(inbound, outbound) => result,
                _ = kill => {
                    debug!("sandbox terminated");
                    Ok(())
                }
            }
        })
    }));

    let report = match result {
        Ok(Ok(())) => return,
        Ok(Err(err)) => CrashReport { message: err.to_string() },
        Err(panic) => CrashReport {
            message: panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "sandbox panicked".to_string()),
        },
    };
    debug!(message = %report.message, "sandbox crashed");
    let _ = crash.send(report);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::channel::port_pair;
    use crate::cube::{Face, Move};
    use crate::event::MutationOrigin;
    use crate::protocol::Level;

    fn start_request(program: &str) -> WorkerStartSync {
        let spec = CubeSpec::new(3).unwrap();
        WorkerStartSync {
            id: MessageId::generate(),
            program_code: program.to_string(),
            cube_spec: encode_payload(&spec).unwrap(),
            cube_solution_condition: encode_payload(&SolutionCondition::Strict).unwrap(),
            cube_state: encode_payload(&CubeSnapshot::solved(spec)).unwrap(),
        }
    }

    /// Acknowledges everything the context sends and records it.
    async fn drive(context: ExecutionContext, program: &str, mut rx: PortReceiver, channel: Arc<AcknowledgedChannel>) -> (WorkerFinishedSync, Vec<Message>) {
        let program = program.to_string();
        let runner = tokio::spawn(async move { context.run(&program).await });
        let mut seen = Vec::new();
        while !runner.is_finished() {
            match timeout(Duration::from_millis(20), rx.recv()).await {
                Ok(Some(raw)) => {
                    let message = Message::decode(&raw).unwrap();
                    channel.acknowledge(&WorkerCallbackSync::acknowledging(message.id()));
                    seen.push(message);
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        (runner.await.unwrap(), seen)
    }

    #[tokio::test]
    async fn forwards_each_move_and_log_in_order() {
        let (port, rx) = port_pair();
        let channel = Arc::new(AcknowledgedChannel::new(port));
        let context = ExecutionContext::bootstrap(&start_request(""), channel.clone()).unwrap();

        let (finished, seen) = drive(context, "move R U\nlog \"hi\"", rx, channel).await;

        assert!(finished.failure.is_none() && finished.crash.is_none());
        assert_eq!(seen.len(), 3);
        match &seen[0] {
            Message::CubeStateSync(sync) => {
                let mv: Move = decode_payload(sync.cube_move.as_deref().unwrap()).unwrap();
                assert_eq!(mv, Move::outer(Face::R, 1));
                let origin: MutationOrigin = decode_payload(&sync.source).unwrap();
                assert_eq!(origin, MutationOrigin::Program);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &seen[2] {
            Message::UiSync(ui) => assert_eq!(ui.logs[0].level, Level::Info),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unacknowledged_move_blocks_the_program() {
        let (port, mut rx) = port_pair();
        let channel = Arc::new(AcknowledgedChannel::new(port));
        let context = ExecutionContext::bootstrap(&start_request(""), channel.clone()).unwrap();

        let runner = tokio::spawn(async move { context.run("move R\nmove U").await });
        let first = rx.recv().await.unwrap();
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err(), "second move waits for the first ack");

        channel.acknowledge(&WorkerCallbackSync::acknowledging(Message::decode(&first).unwrap().id()));
        let second = Message::decode(&rx.recv().await.unwrap()).unwrap();
        channel.acknowledge(&WorkerCallbackSync::acknowledging(second.id()));

        let finished = timeout(Duration::from_secs(1), runner).await.unwrap().unwrap();
        assert!(finished.failure.is_none());
    }

    #[tokio::test]
    async fn thrown_error_becomes_failure_with_stack() {
        let (port, rx) = port_pair();
        let channel = Arc::new(AcknowledgedChannel::new(port));
        let context = ExecutionContext::bootstrap(&start_request(""), channel.clone()).unwrap();

        let (finished, _) = drive(context, "repeat 1\n  fail \"nope\"\nend", rx, channel).await;

        let failure = finished.failure.expect("program failed");
        assert_eq!(failure.message, "nope");
        assert!(failure.stack.contains("at fail \"nope\" (program:2)"));
        assert!(failure.stack.contains("at repeat 1 (program:1)"));
    }

    #[tokio::test]
    async fn bundled_demos_behave_as_documented() {
        let (port, rx) = port_pair();
        let channel = Arc::new(AcknowledgedChannel::new(port));
        let context = ExecutionContext::bootstrap(&start_request(""), channel.clone()).unwrap();
        let (finished, _) = drive(context, include_str!("../../demos/showcase.cube"), rx, channel).await;
        assert!(finished.failure.is_none(), "{:?}", finished.failure);

        let (port, rx) = port_pair();
        let channel = Arc::new(AcknowledgedChannel::new(port));
        let context = ExecutionContext::bootstrap(&start_request(""), channel.clone()).unwrap();
        let (finished, _) = drive(context, include_str!("../../demos/broken.cube"), rx, channel).await;
        let failure = finished.failure.expect("broken demo fails");
        assert!(failure.stack.contains("at expect_solved (program:6)"));
    }

    #[test]
    fn malformed_bootstrap_is_an_error() {
        let (port, _rx) = port_pair();
        let mut start = start_request("");
        start.cube_state = "{not json".to_string();
        let err = ExecutionContext::bootstrap(&start, Arc::new(AcknowledgedChannel::new(port)))
            .err()
            .expect("bootstrap fails");
        assert!(matches!(err, SandboxError::Protocol(_)));
    }
}
