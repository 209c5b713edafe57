//! Spawn Orchestrator
//!
//! Owns the registered spawner fleet and every in-flight spawn task, picks a
//! node for each request, and drives the dispatch pump. All registries live
//! on the orchestrator instance; nothing is process-global.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::network::peer::{IncomingMessage, Peer, PeerId};
use crate::network::protocol::{
    ClientsSpawnRequest, OpCode, RegisterSpawnedProcess, ResponseStatus, SpawnFinalization,
    SpawnRequest, SpawnStatus, SpawnStatusUpdate, SpawnerOptions, SpawnerProcessCount,
};
use crate::spawners::spawner::{RegisteredSpawner, SpawnerId};
use crate::spawners::task::{SpawnId, SpawnTask};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// How often the dispatch pump runs over every spawner queue.
    pub queue_update_interval: Duration,
    /// Whether plain clients may request spawns at all.
    pub enable_client_spawn_requests: bool,
    /// Minimum permission level required to register a spawner.
    pub create_spawner_permission_level: i32,
    /// Timeout for requests sent to spawner nodes.
    pub request_timeout: Duration,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            queue_update_interval: Duration::from_millis(100),
            enable_client_spawn_requests: true,
            create_spawner_permission_level: 0,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Brokers spawn requests across the registered spawner fleet.
pub struct SpawnOrchestrator {
    config: SpawnerConfig,
    spawners: RwLock<BTreeMap<SpawnerId, Arc<RwLock<RegisteredSpawner>>>>,
    /// Tasks are retained for the lifetime of the orchestrator.
    tasks: RwLock<BTreeMap<SpawnId, Arc<SpawnTask>>>,
    /// Ownership index consulted on peer disconnect.
    peer_spawners: RwLock<BTreeMap<PeerId, Vec<SpawnerId>>>,
    /// Active client-initiated request per peer.
    client_requests: RwLock<BTreeMap<PeerId, SpawnId>>,
    next_spawner_id: AtomicU32,
    next_spawn_id: AtomicU32,
}

impl SpawnOrchestrator {
    pub fn new(config: SpawnerConfig) -> Self {
        Self {
            config,
            spawners: RwLock::new(BTreeMap::new()),
            tasks: RwLock::new(BTreeMap::new()),
            peer_spawners: RwLock::new(BTreeMap::new()),
            client_requests: RwLock::new(BTreeMap::new()),
            next_spawner_id: AtomicU32::new(0),
            next_spawn_id: AtomicU32::new(0),
        }
    }

    // =========================================================================
    // REGISTRY
    // =========================================================================

    /// Register a spawner for the given peer.
    pub async fn register_spawner(
        &self,
        peer: Arc<Peer>,
        options: SpawnerOptions,
    ) -> Arc<RwLock<RegisteredSpawner>> {
        let id = self.next_spawner_id.fetch_add(1, Ordering::SeqCst);
        let peer_id = peer.id();
        let spawner = Arc::new(RwLock::new(RegisteredSpawner::new(id, peer, options)));

        self.spawners.write().await.insert(id, Arc::clone(&spawner));
        self.peer_spawners
            .write()
            .await
            .entry(peer_id)
            .or_default()
            .push(id);

        info!(spawner_id = id, "New spawner registered");
        spawner
    }

    /// Remove a spawner from the fleet.
    pub async fn destroy_spawner(&self, id: SpawnerId) {
        let removed = self.spawners.write().await.remove(&id);
        if let Some(spawner) = removed {
            let peer_id = spawner.read().await.peer().id();
            if let Some(owned) = self.peer_spawners.write().await.get_mut(&peer_id) {
                owned.retain(|owned_id| *owned_id != id);
            }
            info!(spawner_id = id, "Spawner destroyed");
        }
    }

    /// Cascade-destroy everything this peer owned.
    pub async fn on_peer_disconnected(&self, peer_id: PeerId) {
        let owned = self.peer_spawners.write().await.remove(&peer_id);
        if let Some(owned) = owned {
            let mut spawners = self.spawners.write().await;
            for id in owned {
                spawners.remove(&id);
                info!(spawner_id = id, "Spawner destroyed (peer disconnected)");
            }
        }
        self.client_requests.write().await.remove(&peer_id);
    }

    pub async fn get_spawner(&self, id: SpawnerId) -> Option<Arc<RwLock<RegisteredSpawner>>> {
        self.spawners.read().await.get(&id).cloned()
    }

    pub async fn spawner_count(&self) -> usize {
        self.spawners.read().await.len()
    }

    pub async fn get_task(&self, id: SpawnId) -> Option<Arc<SpawnTask>> {
        self.tasks.read().await.get(&id).cloned()
    }

    // =========================================================================
    // SPAWNING
    // =========================================================================

    /// Pick the least loaded spawner serving `region` and queue a task on it.
    ///
    /// Returns `None` when no spawner has a free slot; capacity exhaustion
    /// is a valid outcome the caller must handle, not an error.
    pub async fn spawn(
        &self,
        properties: HashMap<String, String>,
        region: &str,
        custom_args: String,
    ) -> Option<Arc<SpawnTask>> {
        let candidates: Vec<(usize, Arc<RwLock<RegisteredSpawner>>)> = {
            let spawners = self.spawners.read().await;
            let mut out = Vec::with_capacity(spawners.len());
            for spawner in spawners.values() {
                let guard = spawner.read().await;
                if !region.is_empty() && guard.region() != region {
                    continue;
                }
                if guard.can_spawn_another_process() {
                    out.push((guard.free_slots(), Arc::clone(spawner)));
                }
            }
            out
        };

        // First spawner with the strictly greatest free-slot count wins.
        let mut best: Option<(usize, Arc<RwLock<RegisteredSpawner>>)> = None;
        for (free_slots, spawner) in candidates {
            match &best {
                Some((best_slots, _)) if *best_slots >= free_slots => {}
                _ => best = Some((free_slots, spawner)),
            }
        }

        let best = match best {
            Some((_, spawner)) => spawner,
            None => {
                warn!(region, "No spawner available for spawn request");
                return None;
            }
        };

        Some(self.spawn_on(&best, properties, custom_args).await)
    }

    /// Queue a task directly on a specific spawner, bypassing selection.
    pub async fn spawn_on(
        &self,
        spawner: &Arc<RwLock<RegisteredSpawner>>,
        properties: HashMap<String, String>,
        custom_args: String,
    ) -> Arc<SpawnTask> {
        let id = self.next_spawn_id.fetch_add(1, Ordering::SeqCst);

        let mut guard = spawner.write().await;
        let task = Arc::new(SpawnTask::new(
            id,
            guard.id(),
            Arc::clone(guard.peer()),
            properties,
            custom_args,
            self.config.request_timeout,
        ));
        guard.add_task_to_queue(Arc::clone(&task));
        drop(guard);

        self.tasks.write().await.insert(id, Arc::clone(&task));
        debug!(spawn_id = id, "Spawn task created and queued");
        task
    }

    // =========================================================================
    // DISPATCH PUMP
    // =========================================================================

    /// Run one pump pass over every spawner queue.
    pub async fn update_queues(&self) {
        let spawners: Vec<Arc<RwLock<RegisteredSpawner>>> =
            self.spawners.read().await.values().cloned().collect();

        for spawner in spawners {
            let (spawner_id, peer, ready) = {
                let mut guard = spawner.write().await;
                (
                    guard.id(),
                    Arc::clone(guard.peer()),
                    guard.take_dispatchable(),
                )
            };

            for task in ready {
                let peer = Arc::clone(&peer);
                let timeout = self.config.request_timeout;
                tokio::spawn(async move {
                    dispatch_task(spawner_id, peer, task, timeout).await;
                });
            }
        }
    }

    /// Periodic dispatch pump.
    pub fn run_queue_pump(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.queue_update_interval);
            loop {
                ticker.tick().await;
                self.update_queues().await;
            }
        })
    }

    // =========================================================================
    // MESSAGE HANDLERS
    // =========================================================================

    /// `RegisterSpawner`: node -> master.
    pub async fn handle_register_spawner(&self, message: IncomingMessage) {
        if message.peer.permission_level() < self.config.create_spawner_permission_level {
            message.respond_error(ResponseStatus::Unauthorized, "Insufficient permissions");
            return;
        }

        let options: SpawnerOptions = match message.parse() {
            Ok(options) => options,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let spawner = self
            .register_spawner(Arc::clone(&message.peer), options)
            .await;
        let id = spawner.read().await.id();
        message.respond_ok(&id);
    }

    /// `ClientsSpawnRequest`: client -> master.
    pub async fn handle_clients_spawn_request(&self, message: IncomingMessage) {
        if !self.config.enable_client_spawn_requests {
            message.respond_error(ResponseStatus::Unauthorized, "Unauthorized");
            return;
        }

        let data: ClientsSpawnRequest = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let peer = Arc::clone(&message.peer);

        // One unfinished request per peer.
        let previous = self.client_requests.read().await.get(&peer.id()).copied();
        if let Some(previous_id) = previous {
            if let Some(previous_task) = self.get_task(previous_id).await {
                if !previous_task.is_done_starting_process() {
                    message
                        .respond_error(ResponseStatus::Failed, "You already have an active request");
                    return;
                }
            }
        }

        let task = match self.spawn(data.options, &data.region, String::new()).await {
            Some(task) => task,
            None => {
                message.respond_error(
                    ResponseStatus::Failed,
                    "All the servers are busy. Try again later",
                );
                return;
            }
        };

        task.set_requester(Arc::clone(&peer));
        self.client_requests
            .write()
            .await
            .insert(peer.id(), task.id());

        // Stream status changes back to the requester until the task settles.
        let mut status_rx = task.subscribe_status();
        let spawn_id = task.id();
        let requester = Arc::clone(&peer);
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow();
                requester.notify(
                    OpCode::SpawnStatusUpdate,
                    &SpawnStatusUpdate { spawn_id, status },
                );
                if status.is_terminal() {
                    break;
                }
            }
        });

        message.respond_ok(&task.id());
    }

    /// `AbortSpawnRequest`: client -> master.
    pub async fn handle_abort_spawn_request(&self, message: IncomingMessage) {
        let previous = self
            .client_requests
            .read()
            .await
            .get(&message.peer.id())
            .copied();

        let task = match previous {
            Some(id) => self.get_task(id).await,
            None => None,
        };

        let task = match task {
            Some(task) => task,
            None => {
                message.respond_error(ResponseStatus::Failed, "There's nothing to abort");
                return;
            }
        };

        if task.status() >= SpawnStatus::Finalized {
            message.respond_error(ResponseStatus::Failed, "You can't abort a completed request");
            return;
        }

        if task.status() <= SpawnStatus::None {
            message.respond_ok(&"Already aborting");
            return;
        }

        task.abort();
        message.respond_ok(&task.id());
    }

    /// `GetSpawnFinalizationData`: client -> master.
    pub async fn handle_get_finalization_data(&self, message: IncomingMessage) {
        let spawn_id: SpawnId = match message.parse() {
            Ok(id) => id,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let task = match self.get_task(spawn_id).await {
            Some(task) => task,
            None => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        match task.requester() {
            Some(requester) if requester.id() == message.peer.id() => {}
            _ => {
                message.respond_error(ResponseStatus::Unauthorized, "You're not the requester");
                return;
            }
        }

        match task.finalization_data() {
            Some(data) => message.respond_ok(&data),
            None => message.respond_error(ResponseStatus::Failed, "Task has no completion data"),
        }
    }

    /// `RegisterSpawnedProcess`: spawned process -> master.
    pub async fn handle_register_spawned_process(&self, message: IncomingMessage) {
        let data: RegisterSpawnedProcess = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let task = match self.get_task(data.spawn_id).await {
            Some(task) => task,
            None => {
                error!(spawn_id = data.spawn_id, "Process tried to register to an unknown task");
                message.respond_error(ResponseStatus::Failed, "Invalid spawn task");
                return;
            }
        };

        if task.unique_code() != data.spawn_code {
            error!(
                spawn_id = data.spawn_id,
                "Process registration failed: mismatched confirmation code"
            );
            message.respond_error(ResponseStatus::Unauthorized, "Unauthorized");
            return;
        }

        task.on_registered(Arc::clone(&message.peer));
        message.respond_ok(task.properties());
    }

    /// `CompleteSpawnProcess`: spawned process -> master.
    pub async fn handle_complete_spawn_process(&self, message: IncomingMessage) {
        let data: SpawnFinalization = match message.parse() {
            Ok(data) => data,
            Err(_) => {
                message.respond_error(ResponseStatus::Failed, "Invalid request");
                return;
            }
        };

        let task = match self.get_task(data.spawn_id).await {
            Some(task) => task,
            None => {
                error!(spawn_id = data.spawn_id, "Process tried to complete an unknown task");
                message.respond_error(ResponseStatus::Failed, "Invalid spawn task");
                return;
            }
        };

        match task.registered_peer() {
            Some(registered) if registered.id() == message.peer.id() => {}
            _ => {
                error!(
                    spawn_id = data.spawn_id,
                    "Finalization attempted by a peer that did not register the task"
                );
                message.respond_error(ResponseStatus::Unauthorized, "Unauthorized");
                return;
            }
        }

        task.on_finalized(data.data);
        message.respond_ok(&data.spawn_id);
    }

    /// `ProcessStarted`: node -> master (notification).
    pub async fn handle_process_started(&self, message: IncomingMessage) {
        let spawn_id: SpawnId = match message.parse() {
            Ok(id) => id,
            Err(_) => return,
        };

        if let Some(task) = self.get_task(spawn_id).await {
            task.on_process_started();
            if let Some(spawner) = self.get_spawner(task.spawner_id()).await {
                spawner.write().await.on_process_started();
            }
        }
    }

    /// `ProcessKilled`: node -> master (notification).
    pub async fn handle_process_killed(&self, message: IncomingMessage) {
        let spawn_id: SpawnId = match message.parse() {
            Ok(id) => id,
            Err(_) => return,
        };

        if let Some(task) = self.get_task(spawn_id).await {
            task.on_process_killed();
            if let Some(spawner) = self.get_spawner(task.spawner_id()).await {
                spawner.write().await.on_process_killed();
            }
        }
    }

    /// `UpdateSpawnerProcessCount`: node -> master (notification).
    pub async fn handle_update_process_count(&self, message: IncomingMessage) {
        let data: SpawnerProcessCount = match message.parse() {
            Ok(data) => data,
            Err(_) => return,
        };

        if let Some(spawner) = self.get_spawner(data.spawner_id).await {
            spawner.write().await.update_process_count(data.count);
        }
    }
}

/// Send one queued task to its spawner node.
async fn dispatch_task(
    spawner_id: SpawnerId,
    peer: Arc<Peer>,
    task: Arc<SpawnTask>,
    timeout: Duration,
) {
    task.on_dispatched();

    let packet = SpawnRequest {
        spawner_id,
        spawn_id: task.id(),
        spawn_code: task.unique_code().to_string(),
        properties: task.properties().clone(),
        custom_args: task.custom_args().to_string(),
    };

    let response = peer.request(OpCode::SpawnRequest, &packet, timeout).await;
    if response.status != ResponseStatus::Success {
        warn!(
            spawn_id = task.id(),
            status = ?response.status,
            "Spawn request was not handled by the node"
        );
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::{OutgoingRequest, Response};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn orchestrator() -> Arc<SpawnOrchestrator> {
        Arc::new(SpawnOrchestrator::new(SpawnerConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        }))
    }

    async fn spawner_in(
        orchestrator: &SpawnOrchestrator,
        peer_id: u64,
        region: &str,
        max_processes: usize,
    ) -> (Arc<RwLock<RegisteredSpawner>>, UnboundedReceiver<OutgoingRequest>) {
        let (peer, rx) = Peer::channel(peer_id);
        let spawner = orchestrator
            .register_spawner(
                peer,
                SpawnerOptions {
                    max_processes,
                    region: region.to_string(),
                    properties: HashMap::new(),
                },
            )
            .await;
        (spawner, rx)
    }

    /// Answer every incoming spawn/kill request on this node with success.
    fn autorespond(mut rx: UnboundedReceiver<OutgoingRequest>) {
        tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                if let Some(responder) = outgoing.responder {
                    let _ = responder.send(Response::ok(&true));
                }
            }
        });
    }

    #[tokio::test]
    async fn spawn_picks_greatest_free_slot_count() {
        let orchestrator = orchestrator();
        let (busy, _rx1) = spawner_in(&orchestrator, 1, "EU", 4).await;
        let (idle, _rx2) = spawner_in(&orchestrator, 2, "EU", 4).await;

        // First node already runs three processes; second is empty.
        {
            let mut guard = busy.write().await;
            guard.on_process_started();
            guard.on_process_started();
            guard.on_process_started();
        }

        let task = orchestrator
            .spawn(HashMap::new(), "EU", String::new())
            .await
            .unwrap();
        assert_eq!(task.spawner_id(), idle.read().await.id());
        assert_eq!(task.status(), SpawnStatus::InQueue);
    }

    #[tokio::test]
    async fn spawn_returns_none_when_all_full() {
        let orchestrator = orchestrator();
        let (only, _rx) = spawner_in(&orchestrator, 1, "EU", 1).await;
        only.write().await.on_process_started();

        let task = orchestrator.spawn(HashMap::new(), "", String::new()).await;
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn spawn_filters_by_region() {
        let orchestrator = orchestrator();
        let (_eu, _rx1) = spawner_in(&orchestrator, 1, "EU", 2).await;
        let (us, _rx2) = spawner_in(&orchestrator, 2, "US", 2).await;

        let task = orchestrator
            .spawn(HashMap::new(), "US", String::new())
            .await
            .unwrap();
        assert_eq!(task.spawner_id(), us.read().await.id());

        // Empty region considers every spawner.
        assert!(orchestrator
            .spawn(HashMap::new(), "", String::new())
            .await
            .is_some());

        // Unknown region matches nothing.
        assert!(orchestrator
            .spawn(HashMap::new(), "ASIA", String::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn pump_dispatches_spawn_request_to_node() {
        let orchestrator = orchestrator();
        let (_spawner, mut rx) = spawner_in(&orchestrator, 1, "EU", 1).await;

        let task = orchestrator
            .spawn(HashMap::new(), "EU", String::new())
            .await
            .unwrap();

        orchestrator.update_queues().await;

        let outgoing = rx.recv().await.unwrap();
        assert_eq!(outgoing.opcode, OpCode::SpawnRequest);
        let packet: SpawnRequest = serde_json::from_value(outgoing.payload).unwrap();
        assert_eq!(packet.spawn_id, task.id());
        assert_eq!(packet.spawn_code, task.unique_code());
        outgoing.responder.unwrap().send(Response::ok(&true)).unwrap();
    }

    #[tokio::test]
    async fn rejected_dispatch_aborts_the_task() {
        let orchestrator = orchestrator();
        let (_spawner, mut rx) = spawner_in(&orchestrator, 1, "EU", 1).await;

        let task = orchestrator
            .spawn(HashMap::new(), "EU", String::new())
            .await
            .unwrap();

        orchestrator.update_queues().await;

        let outgoing = rx.recv().await.unwrap();
        outgoing
            .responder
            .unwrap()
            .send(Response::error(ResponseStatus::Failed, "no ports left"))
            .unwrap();
        // The follow-up kill request is answered by the same node.
        autorespond(rx);

        let mut status_rx = task.subscribe_status();
        while !status_rx.borrow().is_aborted() {
            status_rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn register_spawned_process_rejects_wrong_code() {
        let orchestrator = orchestrator();
        let (_spawner, _rx) = spawner_in(&orchestrator, 1, "EU", 1).await;
        let task = orchestrator
            .spawn(HashMap::new(), "EU", String::new())
            .await
            .unwrap();

        let (process_peer, _prx) = Peer::channel(50);
        let (message, response_rx) = IncomingMessage::request(
            process_peer,
            OpCode::RegisterSpawnedProcess,
            &RegisterSpawnedProcess {
                spawn_id: task.id(),
                spawn_code: "nope".to_string(),
            },
        );
        orchestrator.handle_register_spawned_process(message).await;

        let response = response_rx.await.unwrap();
        assert_eq!(response.status, ResponseStatus::Unauthorized);
        // A failed registration must not advance the task.
        assert_eq!(task.status(), SpawnStatus::InQueue);
        assert!(task.registered_peer().is_none());
    }

    #[tokio::test]
    async fn finalization_requires_the_registering_peer() {
        let orchestrator = orchestrator();
        let (_spawner, _rx) = spawner_in(&orchestrator, 1, "EU", 1).await;
        let task = orchestrator
            .spawn(HashMap::new(), "EU", String::new())
            .await
            .unwrap();

        let (process_peer, _prx) = Peer::channel(50);
        let (message, response_rx) = IncomingMessage::request(
            Arc::clone(&process_peer),
            OpCode::RegisterSpawnedProcess,
            &RegisterSpawnedProcess {
                spawn_id: task.id(),
                spawn_code: task.unique_code().to_string(),
            },
        );
        orchestrator.handle_register_spawned_process(message).await;
        assert_eq!(response_rx.await.unwrap().status, ResponseStatus::Success);
        assert_eq!(task.status(), SpawnStatus::ProcessRegistered);

        // A different peer tries to finalize.
        let (impostor, _irx) = Peer::channel(51);
        let (message, response_rx) = IncomingMessage::request(
            impostor,
            OpCode::CompleteSpawnProcess,
            &SpawnFinalization {
                spawn_id: task.id(),
                data: HashMap::new(),
            },
        );
        orchestrator.handle_complete_spawn_process(message).await;
        assert_eq!(
            response_rx.await.unwrap().status,
            ResponseStatus::Unauthorized
        );
        assert_eq!(task.status(), SpawnStatus::ProcessRegistered);
    }

    #[tokio::test]
    async fn client_cannot_stack_spawn_requests() {
        let orchestrator = orchestrator();
        let (_spawner, _rx) = spawner_in(&orchestrator, 1, "EU", 4).await;
        let (client, _crx) = Peer::channel(30);

        let (message, response_rx) = IncomingMessage::request(
            Arc::clone(&client),
            OpCode::ClientsSpawnRequest,
            &ClientsSpawnRequest::default(),
        );
        orchestrator.handle_clients_spawn_request(message).await;
        assert_eq!(response_rx.await.unwrap().status, ResponseStatus::Success);

        let (message, response_rx) = IncomingMessage::request(
            client,
            OpCode::ClientsSpawnRequest,
            &ClientsSpawnRequest::default(),
        );
        orchestrator.handle_clients_spawn_request(message).await;
        let response = response_rx.await.unwrap();
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.as_str(""), "You already have an active request");
    }

    #[tokio::test]
    async fn disconnect_cascades_to_owned_spawners() {
        let orchestrator = orchestrator();
        let (peer, _rx) = Peer::channel(9);
        orchestrator
            .register_spawner(Arc::clone(&peer), SpawnerOptions::default())
            .await;
        orchestrator
            .register_spawner(Arc::clone(&peer), SpawnerOptions::default())
            .await;
        assert_eq!(orchestrator.spawner_count().await, 2);

        peer.mark_disconnected();
        orchestrator.on_peer_disconnected(peer.id()).await;
        assert_eq!(orchestrator.spawner_count().await, 0);
    }

    #[tokio::test]
    async fn finalized_task_remains_queryable() {
        // Tasks are never evicted; a finished one can still be looked up.
        let orchestrator = orchestrator();
        let (_spawner, _rx) = spawner_in(&orchestrator, 1, "EU", 1).await;
        let task = orchestrator
            .spawn(HashMap::new(), "EU", String::new())
            .await
            .unwrap();

        let (process_peer, _prx) = Peer::channel(50);
        task.on_registered(process_peer);
        task.on_finalized(HashMap::from([("roomId".to_string(), "3".to_string())]));

        let looked_up = orchestrator.get_task(task.id()).await.unwrap();
        assert_eq!(looked_up.status(), SpawnStatus::Finalized);
    }
}
