use std::thread;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::worker::worker_thread_main;
use super::SandboxError;
use crate::channel::{port_pair, PortReceiver, WorkerPort};
use crate::protocol::CrashReport;

/// Controller-side handle on one sandbox thread.
///
/// The sandbox shares no memory with the controller: its cube, interpreter and runtime live on a
/// dedicated thread and only JSON strings cross over. Dropping the session kills the sandbox.
pub struct SandboxSession {
    port: WorkerPort,
    kill: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

/// What the sandbox sends back: its messages, and a crash report if it dies abnormally.
pub struct SandboxInbound {
    pub messages: PortReceiver,
    pub crash: oneshot::Receiver<CrashReport>,
}

impl SandboxSession {
    pub fn spawn() -> Result<(Self, SandboxInbound), SandboxError> {
        let (to_worker, worker_inbound) = port_pair();
        let (to_controller, inbound) = port_pair();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (crash_tx, crash_rx) = oneshot::channel();

        thread::Builder::new()
            .name("cubelab-sandbox".to_string())
            .spawn(move || worker_thread_main(worker_inbound, to_controller, kill_rx, crash_tx))
            .map_err(SandboxError::Spawn)?;
        debug!("sandbox spawned");

        let session = Self {
            port: to_worker,
            kill: Some(kill_tx),
            pump: None,
        };
        Ok((
            session,
            SandboxInbound {
                messages: inbound,
                crash: crash_rx,
            },
        ))
    }

    /// Port for messages addressed to the sandbox.
    pub fn port(&self) -> WorkerPort {
        self.port.clone()
    }

    /// Ties the task relaying inbound messages to this session's lifetime.
    pub fn attach_pump(&mut self, pump: JoinHandle<()>) {
        self.pump = Some(pump);
    }

    /// Stops relaying and kills the sandbox. Pending acknowledgments on either side never resolve.
    pub fn terminate(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.kill_worker();
    }

    fn kill_worker(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
            debug!("sandbox killed");
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.kill_worker();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::cube::{CubeSnapshot, CubeSpec};
    use crate::protocol::{encode_payload, Message, MessageId, WorkerStartSync};

    #[tokio::test]
    async fn malformed_start_request_is_reported_as_crash() {
        let (session, inbound) = SandboxSession::spawn().unwrap();

        let spec = CubeSpec::new(3).unwrap();
        let start = WorkerStartSync {
            id: MessageId::generate(),
            program_code: String::new(),
            cube_spec: encode_payload(&spec).unwrap(),
            cube_solution_condition: "\"sideways\"".to_string(),
            cube_state: encode_payload(&CubeSnapshot::solved(spec)).unwrap(),
        };
        session.port().post(&Message::from(start)).unwrap();

        let report = timeout(Duration::from_secs(2), inbound.crash)
            .await
            .expect("crash reported in time")
            .expect("crash sender kept until report");
        assert!(report.message.contains("decode"));
    }

    #[tokio::test]
    async fn terminate_closes_the_inbound_stream() {
        let (session, mut inbound) = SandboxSession::spawn().unwrap();
        session.terminate();

        let closed = timeout(Duration::from_secs(2), inbound.messages.recv()).await.expect("stream closes");
        assert!(closed.is_none());
    }
}
