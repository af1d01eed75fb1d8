//! Node task framework: actor-style tasks with typed message channels.
//!
//! Each task runs as an independent tokio task and communicates through
//! bounded channels; a shared `watch` channel signals shutdown. Mutable
//! state (path filters, dedup table, world state) is owned by exactly one
//! task, so no locks are needed.

use tokio::sync::{mpsc, watch};

use senseye_mapping::WorldSnapshot;

use crate::mesh::MeshCommand;
use crate::pipeline::PipelineMessage;

/// Task message envelope wrapping typed messages with control signals.
#[derive(Debug)]
pub enum TaskMessage<T> {
    /// Regular message payload
    Message(T),
    /// Shutdown signal - task should terminate gracefully
    Shutdown,
}

impl<T> TaskMessage<T> {
    /// Returns true if this is a shutdown signal.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, TaskMessage::Shutdown)
    }

    /// Returns the message payload if present, or None for shutdown.
    pub fn into_message(self) -> Option<T> {
        match self {
            TaskMessage::Message(msg) => Some(msg),
            TaskMessage::Shutdown => None,
        }
    }
}

/// Handle for sending messages to a task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    tx: mpsc::Sender<TaskMessage<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> TaskHandle<T> {
    /// Creates a new task handle from a sender.
    pub fn new(tx: mpsc::Sender<TaskMessage<T>>) -> Self {
        Self { tx }
    }

    /// Sends a message to the task.
    pub async fn send(&self, msg: T) -> Result<(), mpsc::error::SendError<TaskMessage<T>>> {
        self.tx.send(TaskMessage::Message(msg)).await
    }

    /// Sends a message without waiting; drops it when the queue is full.
    pub fn try_send(&self, msg: T) -> Result<(), mpsc::error::TrySendError<TaskMessage<T>>> {
        self.tx.try_send(TaskMessage::Message(msg))
    }

    /// Sends a shutdown signal to the task.
    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<TaskMessage<T>>> {
        self.tx.send(TaskMessage::Shutdown).await
    }

    /// Returns true if the task channel is closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Default channel capacity for task message queues.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Handles shared among the node's tasks.
#[derive(Clone)]
pub struct NodeTaskBase {
    /// Handle to the pipeline task
    pub pipeline_tx: TaskHandle<PipelineMessage>,
    /// Handle to the mesh task
    pub mesh_tx: TaskHandle<MeshCommand>,
    /// Latest world snapshot, refreshed each fusion cycle
    pub snapshot_rx: watch::Receiver<WorldSnapshot>,
    /// Shutdown signal
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Channel bundle produced by [`NodeTaskBase::new`].
pub struct NodeTaskChannels {
    /// Pipeline task inbox
    pub pipeline_rx: mpsc::Receiver<TaskMessage<PipelineMessage>>,
    /// Mesh task inbox
    pub mesh_rx: mpsc::Receiver<TaskMessage<MeshCommand>>,
    /// World snapshot publisher side
    pub snapshot_tx: watch::Sender<WorldSnapshot>,
    /// Shutdown publisher side
    pub shutdown_tx: watch::Sender<bool>,
}

impl NodeTaskBase {
    /// Creates the task base plus the receiver ends for task spawning.
    pub fn new(channel_capacity: usize) -> (Self, NodeTaskChannels) {
        let (pipeline_tx, pipeline_rx) = mpsc::channel(channel_capacity);
        let (mesh_tx, mesh_rx) = mpsc::channel(channel_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(WorldSnapshot::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        (
            Self {
                pipeline_tx: TaskHandle::new(pipeline_tx),
                mesh_tx: TaskHandle::new(mesh_tx),
                snapshot_rx,
                shutdown_rx,
            },
            NodeTaskChannels {
                pipeline_rx,
                mesh_rx,
                snapshot_tx,
                shutdown_tx,
            },
        )
    }

    /// Sends shutdown to every task.
    pub async fn shutdown_all(&self) {
        // Ignore errors - tasks may already be gone.
        let _ = self.pipeline_tx.shutdown().await;
        let _ = self.mesh_tx.shutdown().await;
    }
}
