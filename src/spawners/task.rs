//! Spawn Task
//!
//! One tracked request to start a game-server process, from acceptance on a
//! spawner through finalization or abort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::network::peer::Peer;
use crate::network::protocol::{KillProcess, OpCode, ResponseStatus, SpawnStatus};

/// Unique spawn task identifier.
pub type SpawnId = u32;

/// Length of the confirmation code handed to the spawner node.
const SPAWN_CODE_LEN: usize = 6;

type WhenDoneFn = Box<dyn FnOnce(SpawnStatus) + Send>;

struct TaskState {
    status: SpawnStatus,
    finalization: Option<HashMap<String, String>>,
    requester: Option<Arc<Peer>>,
    registered_peer: Option<Arc<Peer>>,
    when_done: Vec<WhenDoneFn>,
    done_notified: bool,
}

/// A spawn request tracked by the orchestrator.
///
/// Status moves forward only, except for the abort branch; observers follow
/// the lifecycle through the watch channel. Only the process presenting the
/// matching confirmation code may register against the task.
pub struct SpawnTask {
    id: SpawnId,
    spawner_id: u32,
    spawner_peer: Arc<Peer>,
    properties: HashMap<String, String>,
    custom_args: String,
    unique_code: String,
    kill_timeout: Duration,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<SpawnStatus>,
}

impl SpawnTask {
    pub fn new(
        id: SpawnId,
        spawner_id: u32,
        spawner_peer: Arc<Peer>,
        properties: HashMap<String, String>,
        custom_args: String,
        kill_timeout: Duration,
    ) -> Self {
        let unique_code: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SPAWN_CODE_LEN)
            .map(char::from)
            .collect();
        let (status_tx, _) = watch::channel(SpawnStatus::None);

        Self {
            id,
            spawner_id,
            spawner_peer,
            properties,
            custom_args,
            unique_code,
            kill_timeout,
            state: Mutex::new(TaskState {
                status: SpawnStatus::None,
                finalization: None,
                requester: None,
                registered_peer: None,
                when_done: Vec::new(),
                done_notified: false,
            }),
            status_tx,
        }
    }

    pub fn id(&self) -> SpawnId {
        self.id
    }

    pub fn spawner_id(&self) -> u32 {
        self.spawner_id
    }

    pub fn spawner_peer(&self) -> &Arc<Peer> {
        &self.spawner_peer
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn custom_args(&self) -> &str {
        &self.custom_args
    }

    /// Confirmation code the spawned process must present.
    pub fn unique_code(&self) -> &str {
        &self.unique_code
    }

    pub fn status(&self) -> SpawnStatus {
        self.locked().status
    }

    /// Watch the status as it advances.
    pub fn subscribe_status(&self) -> watch::Receiver<SpawnStatus> {
        self.status_tx.subscribe()
    }

    pub fn finalization_data(&self) -> Option<HashMap<String, String>> {
        self.locked().finalization.clone()
    }

    pub fn requester(&self) -> Option<Arc<Peer>> {
        self.locked().requester.clone()
    }

    pub fn set_requester(&self, peer: Arc<Peer>) {
        self.locked().requester = Some(peer);
    }

    pub fn registered_peer(&self) -> Option<Arc<Peer>> {
        self.locked().registered_peer.clone()
    }

    /// True once the task can no longer accept an abort from its requester.
    pub fn is_done_starting_process(&self) -> bool {
        let status = self.status();
        status.is_aborted() || status >= SpawnStatus::WaitingForProcess
    }

    /// The spawner accepted the task into its queue.
    pub fn on_queued(&self) {
        let status = self.status();
        if !status.is_aborted() && status < SpawnStatus::InQueue {
            self.transition(SpawnStatus::InQueue);
        }
    }

    /// The dispatch message is on its way to the spawner node.
    pub fn on_dispatched(&self) {
        let status = self.status();
        if !status.is_aborted() && status < SpawnStatus::StartingProcess {
            self.transition(SpawnStatus::StartingProcess);
        }
    }

    /// The node reported the OS process as started.
    pub fn on_process_started(&self) {
        let status = self.status();
        if !status.is_aborted() && status < SpawnStatus::WaitingForProcess {
            self.transition(SpawnStatus::WaitingForProcess);
        }
    }

    /// The node reported the OS process as dead.
    pub fn on_process_killed(&self) {
        self.transition(SpawnStatus::Killed);
    }

    /// The spawned process claimed the task. Records the peer once.
    pub fn on_registered(&self, peer: Arc<Peer>) {
        {
            let mut state = self.locked();
            if state.registered_peer.is_none() {
                state.registered_peer = Some(peer);
            }
        }
        let status = self.status();
        if !status.is_aborted() && status < SpawnStatus::ProcessRegistered {
            self.transition(SpawnStatus::ProcessRegistered);
        }
    }

    /// The spawned process reported its completion data.
    pub fn on_finalized(&self, data: HashMap<String, String>) {
        {
            let mut state = self.locked();
            state.finalization = Some(data);
        }
        let status = self.status();
        if !status.is_aborted() && status < SpawnStatus::Finalized {
            self.transition(SpawnStatus::Finalized);
        }
    }

    /// Register a callback fired exactly once when the task reaches a
    /// terminal status. A callback added after the task is already terminal
    /// fires immediately with the final status.
    pub fn when_done(&self, callback: impl FnOnce(SpawnStatus) + Send + 'static) {
        let callback: WhenDoneFn = Box::new(callback);
        let fire_now = {
            let mut state = self.locked();
            if state.status.is_terminal() {
                Some((callback, state.status))
            } else {
                state.when_done.push(callback);
                None
            }
        };
        if let Some((callback, status)) = fire_now {
            callback(status);
        }
    }

    /// Cancel the task: best-effort kill request to the spawner, marked
    /// `Aborted` locally whether or not the node could be reached.
    pub fn abort(self: &Arc<Self>) {
        if self.status() >= SpawnStatus::Finalized {
            return;
        }
        self.transition(SpawnStatus::Aborting);
        self.kill_spawned_process();
    }

    /// Ask the spawner node to kill the process behind this task.
    pub fn kill_spawned_process(self: &Arc<Self>) {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            let packet = KillProcess {
                spawner_id: task.spawner_id,
                spawn_id: task.id,
            };
            let response = task
                .spawner_peer
                .request(OpCode::KillProcess, &packet, task.kill_timeout)
                .await;

            if response.status != ResponseStatus::Success {
                warn!(
                    spawn_id = task.id,
                    "Spawned process might not have been killed"
                );
            }
            task.transition(SpawnStatus::Aborted);
        });
    }

    fn locked(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().expect("spawn task state poisoned")
    }

    fn transition(&self, status: SpawnStatus) {
        let callbacks = {
            let mut state = self.locked();
            state.status = status;
            if status.is_terminal() && !state.done_notified {
                state.done_notified = true;
                std::mem::take(&mut state.when_done)
            } else {
                Vec::new()
            }
        };

        debug!(spawn_id = self.id, ?status, "Spawn task status changed");
        let _ = self.status_tx.send(status);

        // Invoked outside the lock so callbacks may inspect the task.
        for callback in callbacks {
            callback(status);
        }
    }
}

impl std::fmt::Debug for SpawnTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnTask")
            .field("id", &self.id)
            .field("spawner_id", &self.spawner_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::network::peer::Response;

    fn test_task() -> (Arc<SpawnTask>, tokio::sync::mpsc::UnboundedReceiver<crate::network::peer::OutgoingRequest>) {
        let (peer, rx) = Peer::channel(100);
        let task = Arc::new(SpawnTask::new(
            1,
            7,
            peer,
            HashMap::new(),
            String::new(),
            Duration::from_millis(100),
        ));
        (task, rx)
    }

    #[tokio::test]
    async fn status_advances_through_lifecycle() {
        let (task, _rx) = test_task();
        let mut status_rx = task.subscribe_status();

        assert_eq!(task.status(), SpawnStatus::None);
        task.on_queued();
        task.on_dispatched();
        task.on_process_started();
        assert_eq!(task.status(), SpawnStatus::WaitingForProcess);

        let (peer, _peer_rx) = Peer::channel(200);
        task.on_registered(peer);
        assert_eq!(task.status(), SpawnStatus::ProcessRegistered);

        task.on_finalized(HashMap::from([("roomId".to_string(), "7".to_string())]));
        assert_eq!(task.status(), SpawnStatus::Finalized);
        assert_eq!(
            task.finalization_data().unwrap().get("roomId").unwrap(),
            "7"
        );

        // Observer saw the latest value.
        status_rx.changed().await.unwrap();
        assert_eq!(*status_rx.borrow(), SpawnStatus::Finalized);
    }

    #[tokio::test]
    async fn late_status_reports_do_not_move_backwards() {
        let (task, _rx) = test_task();
        let (peer, _peer_rx) = Peer::channel(200);
        task.on_registered(peer);

        // A ProcessStarted arriving after registration must not regress.
        task.on_process_started();
        assert_eq!(task.status(), SpawnStatus::ProcessRegistered);
    }

    #[tokio::test]
    async fn registered_peer_is_recorded_once() {
        let (task, _rx) = test_task();
        let (first, _rx1) = Peer::channel(201);
        let (second, _rx2) = Peer::channel(202);

        task.on_registered(first);
        task.on_registered(second);

        assert_eq!(task.registered_peer().unwrap().id(), 201);
    }

    #[tokio::test]
    async fn abort_sends_kill_and_settles_locally() {
        let (task, mut rx) = test_task();
        task.on_queued();

        task.abort();
        assert_eq!(task.status(), SpawnStatus::Aborting);

        // The spawner node receives the kill order and acknowledges it.
        let outgoing = rx.recv().await.unwrap();
        assert_eq!(outgoing.opcode, OpCode::KillProcess);
        outgoing.responder.unwrap().send(Response::ok(&true)).unwrap();

        let mut status_rx = task.subscribe_status();
        while *status_rx.borrow() != SpawnStatus::Aborted {
            status_rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn abort_marks_aborted_even_when_kill_request_times_out() {
        let (task, mut rx) = test_task();
        task.on_queued();
        task.abort();

        // Swallow the kill request without answering; the 100ms timeout runs out.
        let _outgoing = rx.recv().await.unwrap();

        let mut status_rx = task.subscribe_status();
        while *status_rx.borrow() != SpawnStatus::Aborted {
            status_rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn abort_after_finalized_is_rejected() {
        let (task, mut rx) = test_task();
        let (peer, _peer_rx) = Peer::channel(203);
        task.on_registered(peer);
        task.on_finalized(HashMap::new());

        task.abort();
        assert_eq!(task.status(), SpawnStatus::Finalized);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn when_done_fires_exactly_once() {
        let (task, _rx) = test_task();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        task.when_done(move |status| {
            assert_eq!(status, SpawnStatus::Killed);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.on_process_killed();
        // A second terminal transition must not re-fire drained callbacks.
        task.on_process_killed();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn when_done_after_terminal_fires_immediately() {
        let (task, _rx) = test_task();
        task.on_process_killed();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        task.when_done(move |status| {
            assert_eq!(status, SpawnStatus::Killed);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
