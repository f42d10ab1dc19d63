//! Keyed registry of worker runtimes.
//!
//! The manager is the host-facing surface: it creates and destroys
//! workers, forwards messages and evals by id, and owns the callback trio
//! every worker reports through. It is an explicit instance: embedders
//! construct one, share it as they see fit, and drop it to tear every
//! worker down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::worker::{CallbackSet, WorkerError, WorkerRuntime};

/// Registry of live workers, keyed by caller-chosen id.
#[derive(Default)]
pub struct WorkerManager {
    workers: Mutex<HashMap<String, WorkerRuntime>>,
    callbacks: Arc<CallbackSet>,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker under `worker_id` and run `script` as its top-level
    /// source. Fails on a duplicate id, or when the script throws during
    /// load, in which case the half-built worker is torn down and the
    /// registry is left unchanged.
    pub fn create_worker(&self, worker_id: &str, script: &str) -> Result<(), WorkerError> {
        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(worker_id) {
            return Err(WorkerError::DuplicateId(worker_id.to_owned()));
        }

        let runtime = WorkerRuntime::spawn(worker_id, Arc::clone(&self.callbacks));
        if !runtime.load_script(script) {
            runtime.terminate();
            return Err(WorkerError::ScriptLoad(worker_id.to_owned()));
        }

        info!(worker = worker_id, "worker created");
        workers.insert(worker_id.to_owned(), runtime);
        Ok(())
    }

    /// Remove and stop a worker. Idempotent: returns `false` when the id
    /// is unknown.
    pub fn terminate_worker(&self, worker_id: &str) -> bool {
        let removed = self.workers.lock().unwrap().remove(worker_id);
        match removed {
            Some(runtime) => {
                runtime.terminate();
                debug!(worker = worker_id, "worker terminated");
                true
            }
            None => false,
        }
    }

    /// Stop every worker and clear the registry.
    pub fn terminate_all(&self) {
        let drained: Vec<WorkerRuntime> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain().map(|(_, runtime)| runtime).collect()
        };
        for runtime in &drained {
            runtime.terminate();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "all workers terminated");
        }
    }

    /// Forward a structured-clone payload to a worker. Returns `false`
    /// when the worker is missing or no longer accepting messages.
    pub fn post_message(&self, worker_id: &str, bytes: &[u8]) -> bool {
        let shared = {
            let workers = self.workers.lock().unwrap();
            workers.get(worker_id).map(|runtime| runtime.shared_handle())
        };
        match shared {
            Some(shared) => shared.post_message(bytes.to_vec()),
            None => false,
        }
    }

    /// Evaluate source on a worker's thread and return the coerced result.
    /// The registry lock is only held for the lookup; the blocking wait
    /// happens outside it.
    pub fn eval_script(&self, worker_id: &str, source: &str) -> Result<String, WorkerError> {
        let shared = {
            let workers = self.workers.lock().unwrap();
            workers.get(worker_id).map(|runtime| runtime.shared_handle())
        };
        match shared {
            Some(shared) => shared.eval_script(source),
            None => Err(WorkerError::NotFound(worker_id.to_owned())),
        }
    }

    pub fn has_worker(&self, worker_id: &str) -> bool {
        self.workers.lock().unwrap().contains_key(worker_id)
    }

    pub fn is_worker_running(&self, worker_id: &str) -> bool {
        self.workers
            .lock()
            .unwrap()
            .get(worker_id)
            .is_some_and(|runtime| runtime.is_running())
    }

    /// Receive every payload workers post to the host. Takes effect for
    /// already-running workers too.
    pub fn set_message_callback(&self, callback: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        self.callbacks.set_message(callback);
    }

    /// Receive worker console output as `(worker_id, level, message)`.
    pub fn set_console_callback(
        &self,
        callback: impl Fn(&str, &str, &str) + Send + Sync + 'static,
    ) {
        self.callbacks.set_console(callback);
    }

    /// Receive worker error reports as `(worker_id, message)`.
    pub fn set_error_callback(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.callbacks.set_error(callback);
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.terminate_all();
    }
}
