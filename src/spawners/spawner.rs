//! Registered Spawner
//!
//! Master-side model of one worker node: its capacity, its live process
//! count and the FIFO queue of spawn tasks waiting to be dispatched to it.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::network::peer::Peer;
use crate::network::protocol::SpawnerOptions;
use crate::spawners::task::SpawnTask;

/// Unique spawner identifier.
pub type SpawnerId = u32;

/// One worker node capable of starting game-server processes.
pub struct RegisteredSpawner {
    id: SpawnerId,
    peer: Arc<Peer>,
    options: SpawnerOptions,
    processes_running: usize,
    queue: VecDeque<Arc<SpawnTask>>,
}

impl RegisteredSpawner {
    pub fn new(id: SpawnerId, peer: Arc<Peer>, options: SpawnerOptions) -> Self {
        Self {
            id,
            peer,
            options,
            processes_running: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SpawnerId {
        self.id
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn options(&self) -> &SpawnerOptions {
        &self.options
    }

    pub fn region(&self) -> &str {
        &self.options.region
    }

    pub fn processes_running(&self) -> usize {
        self.processes_running
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Slots left for new tasks: capacity minus live and queued work.
    /// An unlimited spawner (`max_processes == 0`) always reports capacity.
    pub fn free_slots(&self) -> usize {
        if self.options.max_processes == 0 {
            usize::MAX
        } else {
            self.options
                .max_processes
                .saturating_sub(self.processes_running + self.queue.len())
        }
    }

    pub fn can_spawn_another_process(&self) -> bool {
        self.options.max_processes == 0
            || self.processes_running + self.queue.len() < self.options.max_processes
    }

    /// Append a task to the dispatch queue and mark it queued.
    pub fn add_task_to_queue(&mut self, task: Arc<SpawnTask>) {
        task.on_queued();
        self.queue.push_back(task);
    }

    /// Pull tasks the pump may dispatch right now.
    ///
    /// Capacity is only enforced here, not at enqueue time, so a queue can
    /// transiently hold more work than the node has slots. Tasks aborted
    /// while waiting are dropped on the floor.
    pub fn take_dispatchable(&mut self) -> Vec<Arc<SpawnTask>> {
        let mut ready = Vec::new();

        if !self.peer.is_connected() {
            return ready;
        }

        while let Some(task) = self.queue.pop_front() {
            if task.status().is_aborted() {
                continue;
            }
            // Work dispatched in this pass counts against capacity until the
            // node reports the processes as started.
            let unlimited = self.options.max_processes == 0;
            if !unlimited && self.processes_running + ready.len() >= self.options.max_processes {
                self.queue.push_front(task);
                break;
            }
            ready.push(task);
        }

        ready
    }

    /// Node reported one more live process.
    pub fn on_process_started(&mut self) {
        self.processes_running += 1;
    }

    /// Node reported one process gone.
    pub fn on_process_killed(&mut self) {
        self.processes_running = self.processes_running.saturating_sub(1);
    }

    /// Node-side correction of the live count.
    pub fn update_process_count(&mut self, count: usize) {
        self.processes_running = count;
    }
}

impl std::fmt::Debug for RegisteredSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSpawner")
            .field("id", &self.id)
            .field("region", &self.options.region)
            .field("running", &self.processes_running)
            .field("queued", &self.queue.len())
            .finish()
    }
}
