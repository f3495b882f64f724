//! Dedicated worker threads.
//!
//! Each `WorkerThread` owns one OS thread and a private FIFO queue. Tasks
//! run in submission order; a task that panics completes its handle with
//! `TaskError::Panicked` and the worker keeps serving its queue. Dropping a
//! worker sends a poison pill, cancels whatever is still queued behind it and
//! joins the thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use thiserror::Error;

use crate::EvoResult;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Terminate,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled before it ran")]
    Cancelled,
}

/// Completion handle of an enqueued task.
pub struct TaskHandle<T> {
    receiver: Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has finished.
    pub fn wait(self) -> Result<T, TaskError> {
        self.receiver.recv().unwrap_or(Err(TaskError::Cancelled))
    }
}

pub struct WorkerThread {
    id: usize,
    sender: Sender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn new(id: usize) -> EvoResult<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("evojit-worker-{}", id))
            .spawn(move || serve(id, receiver))?;

        Ok(Self {
            id,
            sender,
            handle: Some(handle),
        })
    }

    /// A pool of `count` workers with ids `0..count`.
    pub fn spawn_pool(count: usize) -> EvoResult<Vec<WorkerThread>> {
        (0..count).map(WorkerThread::new).collect()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue `task` behind everything already submitted to this worker.
    pub fn enqueue<T, F>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            // the caller may have stopped waiting
            let _ = sender.send(result);
        });

        if self.sender.send(Message::Run(job)).is_err() {
            warn!("Worker {} is gone, task cancelled", self.id);
        }

        TaskHandle { receiver }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Terminate);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Worker {} terminated abnormally", self.id);
            }
        }
    }
}

fn serve(id: usize, receiver: Receiver<Message>) {
    for message in receiver.iter() {
        match message {
            Message::Run(job) => job(),
            Message::Terminate => break,
        }
    }

    // dropping a queued job drops its result sender, which cancels the handle
    let cancelled = receiver.try_iter().count();
    debug!("Worker {} stopped, {} queued task(s) cancelled", id, cancelled);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
