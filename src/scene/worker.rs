//! Background worker that computes animation snapshots.
//!
//! Keeps per-vertex deformation off the frame thread. Requests queue up
//! while the worker is busy; only the latest one is computed.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use super::{Animator, SceneEditQueue};

/// Commands sent to the worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Compute and publish the snapshot for `time`.
    Animate { time: f32, epoch: u64 },
    /// Stop the worker thread.
    Stop,
}

/// Results sent back from the worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerResult {
    /// Snapshot for `time` is in the edit queue.
    Published { time: f32, epoch: u64 },
}

/// Handle to the animation worker thread.
pub struct AnimationWorker {
    tx: Sender<WorkerCommand>,
    rx: Receiver<WorkerResult>,
    handle: Option<JoinHandle<()>>,
}

impl AnimationWorker {
    /// Spawn a worker publishing into `queue`.
    pub fn spawn(animator: Animator, queue: SceneEditQueue) -> Self {
        let (cmd_tx, cmd_rx) = channel::<WorkerCommand>();
        let (res_tx, res_rx) = channel::<WorkerResult>();

        let handle = thread::Builder::new()
            .name("animation-worker".into())
            .spawn(move || worker_loop(animator, queue, cmd_rx, res_tx))
            .ok();
        if handle.is_none() {
            tracing::error!("failed to spawn animation worker thread");
        }

        Self {
            tx: cmd_tx,
            rx: res_rx,
            handle,
        }
    }

    /// Request the snapshot for `time`.
    pub fn request(&self, time: f32, epoch: u64) {
        let _ = self.tx.send(WorkerCommand::Animate { time, epoch });
    }

    /// Check for a published snapshot (non-blocking).
    pub fn try_recv(&self) -> Option<WorkerResult> {
        self.rx.try_recv().ok()
    }

    /// Block until the next snapshot is published. `None` once the worker
    /// has exited.
    pub fn wait(&self) -> Option<WorkerResult> {
        self.rx.recv().ok()
    }

    /// Stop the worker and wait for it to finish.
    pub fn stop(&mut self) {
        let _ = self.tx.send(WorkerCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AnimationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    animator: Animator,
    queue: SceneEditQueue,
    rx: Receiver<WorkerCommand>,
    tx: Sender<WorkerResult>,
) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            WorkerCommand::Animate { time, epoch } => {
                let (time, epoch, stop) = drain_to_latest(&rx, time, epoch);
                queue.publish(animator.snapshot(time));
                if tx.send(WorkerResult::Published { time, epoch }).is_err() || stop {
                    break;
                }
            }
            WorkerCommand::Stop => break,
        }
    }
}

/// Skip queued requests in favour of the newest one. Also reports whether
/// a stop was seen while draining.
fn drain_to_latest(rx: &Receiver<WorkerCommand>, mut time: f32, mut epoch: u64) -> (f32, u64, bool) {
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WorkerCommand::Animate { time: t, epoch: e } => {
                time = t;
                epoch = e;
            }
            WorkerCommand::Stop => return (time, epoch, true),
        }
    }
    (time, epoch, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{self, LoaderConfig, ModelSource, Primitive};
    use crate::scene::ModelRegistry;
    use glam::Mat4;

    #[test]
    fn test_worker_publishes_snapshot() {
        let mut registry = ModelRegistry::new();
        let mesh = loader::load(&ModelSource::procedural(Primitive::Triangle), &LoaderConfig::default())
            .expect("load");
        let a = registry.add_model(mesh, Mat4::IDENTITY);
        let model = registry.instance(a).expect("instance").model;
        let b = registry.add_instance(model, Mat4::IDENTITY).expect("add");
        let animator = Animator::new().with_circle(&registry, &[a, b]).expect("circle");

        let queue = SceneEditQueue::new();
        let mut worker = AnimationWorker::spawn(animator.clone(), queue.clone());
        worker.request(1.5, 7);
        let result = worker.wait().expect("result");
        let WorkerResult::Published { epoch, .. } = result;
        assert_eq!(epoch, 7);

        let update = queue.take().expect("published");
        assert_eq!(update.transforms.len(), 2);
        assert_eq!(update, animator.snapshot(1.5));
        worker.stop();
    }

    #[test]
    fn test_drain_to_latest() {
        let (tx, rx) = channel();
        tx.send(WorkerCommand::Animate { time: 2.0, epoch: 2 }).expect("send");
        tx.send(WorkerCommand::Animate { time: 3.0, epoch: 3 }).expect("send");
        assert_eq!(drain_to_latest(&rx, 1.0, 1), (3.0, 3, false));

        tx.send(WorkerCommand::Stop).expect("send");
        tx.send(WorkerCommand::Animate { time: 4.0, epoch: 4 }).expect("send");
        assert_eq!(drain_to_latest(&rx, 1.0, 1), (1.0, 1, true));
    }
}
