//! Registry of named per-node workers.
//!
//! Each worker owns two queues: textual commands pushed by the TCP command
//! router, and answer frames pushed by the CAN supervisor. The worker with
//! ID 0 is the tap: it receives a copy of every inbound frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::frame::CanFrame;
use crate::roles::Role;
use crate::sdo::NODEID_MASK;

/// Max length (in bytes) of a worker name
pub const WORKER_NAME_MAX: usize = 31;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("worker name must be 1..=31 characters")]
    BadName,
    #[error("a worker named {0:?} already exists")]
    DuplicateName(String),
    #[error("a worker with ID 0x{0:X} already exists")]
    DuplicateId(u16),
    #[error("no worker named {0:?}")]
    NotFound(String),
    #[error("worker {0:?} no longer accepts commands")]
    SendFailed(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything a worker loop needs: its identity, its two receive queues and
/// the two process-global buses it may publish to.
pub struct WorkerCtx {
    pub name: String,
    pub id: u16,
    pub commands: Receiver<String>,
    pub answers: Receiver<CanFrame>,
    pub broadcast: Sender<String>,
    pub outbound: Sender<CanFrame>,
    pub shutdown: Arc<AtomicBool>,
}

impl WorkerCtx {
    /// CANopen node ID encoded in the low bits of the worker ID.
    pub fn node_id(&self) -> u8 {
        (self.id & NODEID_MASK) as u8
    }

    /// Posts a line to the broadcast bus (fanned to every TCP client).
    pub fn post(&self, line: String) {
        if self.broadcast.send(line).is_err() {
            log::warn!("worker {:?}: broadcast bus is gone", self.name);
        }
    }

    /// Queues a frame for transmission on the CAN bus.
    pub fn send_frame(&self, frame: CanFrame) {
        if self.outbound.send(frame).is_err() {
            log::warn!("worker {:?}: outbound bus is gone", self.name);
        }
    }
}

struct WorkerSlot {
    name: String,
    id: u16,
    role: Role,
    commands: Sender<String>,
    answers: Sender<CanFrame>,
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Keeps workers addressable both by unique name and by unique numeric ID.
pub struct Registry {
    workers: Mutex<Vec<WorkerSlot>>,
    broadcast: Sender<String>,
    outbound: Sender<CanFrame>,
}

impl Registry {
    pub fn new(broadcast: Sender<String>, outbound: Sender<CanFrame>) -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            broadcast,
            outbound,
        }
    }

    /// Creates the worker's queues, spawns its behaviour thread and
    /// publishes it under both keys. Names must be unique; IDs must be
    /// unique as well, which limits the ID-0 tap to a single instance.
    pub fn register(&self, name: &str, id: u16, role: Role) -> Result<(), RegistryError> {
        if name.is_empty() || name.len() > WORKER_NAME_MAX {
            return Err(RegistryError::BadName);
        }

        let mut workers = self.workers.lock().unwrap();
        if workers.iter().any(|w| w.name == name) {
            return Err(RegistryError::DuplicateName(name.to_owned()));
        }
        if workers.iter().any(|w| w.id == id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let (cmd_tx, cmd_rx) = unbounded();
        let (ans_tx, ans_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let ctx = WorkerCtx {
            name: name.to_owned(),
            id,
            commands: cmd_rx,
            answers: ans_rx,
            broadcast: self.broadcast.clone(),
            outbound: self.outbound.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", name))
            .spawn(move || role.run(ctx))?;

        log::info!("registered worker {:?} with ID 0x{:X} ({})", name, id, role);
        workers.push(WorkerSlot {
            name: name.to_owned(),
            id,
            role,
            commands: cmd_tx,
            answers: ans_tx,
            shutdown,
            thread,
        });
        Ok(())
    }

    /// Requests cooperative shutdown of the worker, waits for its thread and
    /// drops both queues.
    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let slot = {
            let mut workers = self.workers.lock().unwrap();
            let position = workers
                .iter()
                .position(|w| w.name == name)
                .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
            workers.remove(position)
        };
        // join outside the lock so other registry calls keep working while
        // the worker finishes its current iteration
        stop_worker(slot);
        log::info!("unregistered worker {:?}", name);
        Ok(())
    }

    /// Pushes a textual command onto a worker's command queue.
    pub fn send_command(&self, name: &str, command: &str) -> Result<(), RegistryError> {
        let workers = self.workers.lock().unwrap();
        let slot = workers
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
        slot.commands
            .send(command.to_owned())
            .map_err(|_| RegistryError::SendFailed(name.to_owned()))
    }

    /// Fans one inbound frame out: a copy to the ID-0 tap (when present)
    /// and a copy to the worker whose ID matches the frame. Frames nobody
    /// listens for are dropped after tapping.
    pub fn dispatch(&self, frame: &CanFrame) {
        let workers = self.workers.lock().unwrap();
        for slot in workers.iter() {
            if slot.id == 0 || slot.id == frame.raw_id() {
                if slot.answers.send(frame.clone()).is_err() {
                    log::warn!("worker {:?} dropped its answer queue", slot.name);
                }
            }
        }
    }

    /// One line per worker, in registration order.
    pub fn list(&self) -> Vec<String> {
        let workers = self.workers.lock().unwrap();
        workers
            .iter()
            .map(|w| format!("{} 0x{:03X} {}", w.name, w.id, w.role))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.lock().unwrap().iter().any(|w| w.name == name)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for slot in workers {
            stop_worker(slot);
        }
    }
}

fn stop_worker(slot: WorkerSlot) {
    slot.shutdown.store(true, Ordering::Relaxed);
    let WorkerSlot { name, thread, .. } = slot;
    if thread.join().is_err() {
        log::warn!("worker {:?} panicked before shutdown", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::StandardId;
    use std::time::Duration;

    fn registry() -> (Registry, Receiver<String>, Receiver<CanFrame>) {
        let (b_tx, b_rx) = unbounded();
        let (o_tx, o_rx) = unbounded();
        (Registry::new(b_tx, o_tx), b_rx, o_rx)
    }

    fn frame(id: u16, data: &[u8]) -> CanFrame {
        CanFrame::new(StandardId::new(id).unwrap(), data).unwrap()
    }

    #[test]
    fn names_and_ids_are_unique() {
        let (registry, _b, _o) = registry();
        registry.register("m1", 0x181, Role::Stepper).unwrap();

        assert!(matches!(
            registry.register("m1", 0x200, Role::Raw),
            Err(RegistryError::DuplicateName(_))
        ));
        assert!(matches!(
            registry.register("m2", 0x181, Role::Raw),
            Err(RegistryError::DuplicateId(0x181))
        ));
        // a second tap is rejected like any other duplicate ID
        registry.register("tap", 0, Role::Raw).unwrap();
        assert!(matches!(
            registry.register("tap2", 0, Role::Raw),
            Err(RegistryError::DuplicateId(0))
        ));
    }

    #[test]
    fn rejects_bad_names() {
        let (registry, _b, _o) = registry();
        assert!(matches!(
            registry.register("", 1, Role::Raw),
            Err(RegistryError::BadName)
        ));
        let long = "x".repeat(32);
        assert!(matches!(
            registry.register(&long, 1, Role::Raw),
            Err(RegistryError::BadName)
        ));
        registry.register(&"x".repeat(31), 1, Role::Raw).unwrap();
    }

    #[test]
    fn dispatch_fans_out_to_tap_and_matching_worker() {
        let (registry, b_rx, _o) = registry();
        registry.register("tap", 0, Role::Raw).unwrap();
        registry.register("m1", 0x181, Role::Raw).unwrap();

        registry.dispatch(&frame(0x181, &[0x01]));
        registry.dispatch(&frame(0x181, &[0x02]));
        // unknown id still reaches the tap
        registry.dispatch(&frame(0x300, &[0x03]));

        // raw workers republish their answers on the broadcast bus; both the
        // tap and m1 see the 0x181 frames, in FIFO order per queue
        let mut lines = Vec::new();
        for _ in 0..5 {
            lines.push(b_rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert!(b_rx.recv_timeout(Duration::from_millis(50)).is_err());

        assert_eq!(lines.iter().filter(|l| *l == "#0x181 0x01").count(), 2);
        assert_eq!(lines.iter().filter(|l| *l == "#0x181 0x02").count(), 2);
        assert_eq!(lines.iter().filter(|l| *l == "#0x300 0x03").count(), 1);
        // per-queue ordering
        let first = lines.iter().position(|l| l == "#0x181 0x01").unwrap();
        let second = lines.iter().rposition(|l| l == "#0x181 0x02").unwrap();
        assert!(first < second);
    }

    #[test]
    fn unregister_stops_the_worker() {
        let (registry, _b, _o) = registry();
        registry.register("m1", 0x200, Role::Raw).unwrap();
        assert!(registry.contains("m1"));

        registry.unregister("m1").unwrap();
        assert!(!registry.contains("m1"));
        assert!(matches!(
            registry.unregister("m1"),
            Err(RegistryError::NotFound(_))
        ));
        // the id can be reused afterwards
        registry.register("m2", 0x200, Role::Raw).unwrap();
    }

    #[test]
    fn listing_preserves_registration_order() {
        let (registry, _b, _o) = registry();
        registry.register("alpha", 0x181, Role::Stepper).unwrap();
        registry.register("beta", 0x200, Role::Raw).unwrap();

        assert_eq!(
            registry.list(),
            vec!["alpha 0x181 stepper".to_owned(), "beta 0x200 raw".to_owned()]
        );
    }
}
