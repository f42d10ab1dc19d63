//! Per-worker runtime: one engine instance, one OS thread, one event loop.
//!
//! Each [`WorkerRuntime`] spawns a dedicated thread, builds a Boa `Context`
//! there, installs the worker global scope plus native hooks, and then
//! services a hybrid task queue: host messages, staged evals and timers as
//! macrotasks, with the engine's promise jobs drained after every
//! macrotask. The engine never leaves its thread: host threads talk to a
//! worker exclusively through the queue and a handful of atomics, and
//! values cross the boundary as structured-clone bytes.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use boa_engine::context::ContextBuilder;
use boa_engine::{
    js_string, Context, JsArgs, JsError, JsNativeError, JsResult, JsValue, NativeFunction, Source,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clone::{decode_value, encode_value, CloneError};
use crate::task_queue::{EvalReply, Task, TaskQueue, TaskWork};

/// Callback fired with each structured-clone payload a worker posts to the
/// host: `(worker_id, bytes)`.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback fired for worker console output: `(worker_id, level, message)`.
pub type ConsoleCallback = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Callback fired for worker errors: `(worker_id, message)`.
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Outbound callback trio shared by every worker a manager owns. Setting a
/// callback takes effect for running workers immediately; callbacks fire on
/// worker threads and must hop to another thread themselves if they need
/// one. No callback fires after a worker's `terminate` returns.
#[derive(Default)]
pub struct CallbackSet {
    message: Mutex<Option<MessageCallback>>,
    console: Mutex<Option<ConsoleCallback>>,
    error: Mutex<Option<ErrorCallback>>,
}

impl CallbackSet {
    pub fn set_message(&self, callback: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        *self.message.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_console(&self, callback: impl Fn(&str, &str, &str) + Send + Sync + 'static) {
        *self.console.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_error(&self, callback: impl Fn(&str, &str) + Send + Sync + 'static) {
        *self.error.lock().unwrap() = Some(Arc::new(callback));
    }

    fn emit_message(&self, worker_id: &str, bytes: &[u8]) {
        let callback = self.message.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(worker_id, bytes);
        }
    }

    fn emit_console(&self, worker_id: &str, level: &str, message: &str) {
        let callback = self.console.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(worker_id, level, message);
        }
    }

    fn emit_error(&self, worker_id: &str, message: &str) {
        let callback = self.error.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(worker_id, message);
        }
    }
}

/// Host-facing failures of the worker API.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker already exists: {0}")]
    DuplicateId(String),

    #[error("worker not found: {0}")]
    NotFound(String),

    #[error("worker not running: {0}")]
    NotRunning(String),

    #[error("failed to load script for worker: {0}")]
    ScriptLoad(String),

    #[error("{0}")]
    Eval(String),
}

/// The event loop never sleeps longer than this in one stretch, so a
/// shutdown request is noticed promptly even with no work queued.
const MAX_LOOP_WAIT: Duration = Duration::from_secs(1);

/// Worker global scope, evaluated once at startup. Binds the native hooks
/// into the identifiers a worker script expects.
const GLOBAL_SCOPE_SCRIPT: &str = r#"
    var self = globalThis;
    var global = globalThis;
    var __messageListeners = [];

    self.onmessage = null;

    self.postMessage = function(message) {
        __mamba_post_message(message);
    };

    self.addEventListener = function(type, handler) {
        if (type === 'message' && typeof handler === 'function') {
            __messageListeners.push(handler);
        }
    };

    self.removeEventListener = function(type, handler) {
        if (type === 'message') {
            var index = __messageListeners.indexOf(handler);
            if (index > -1) {
                __messageListeners.splice(index, 1);
            }
        }
    };

    self.__mamba_handle_message = function(data) {
        var event = {
            data: data,
            type: 'message'
        };

        if (typeof self.onmessage === 'function') {
            self.onmessage(event);
        }

        __messageListeners.forEach(function(handler) {
            handler(event);
        });
    };

    var console = {};
    ['log', 'error', 'warn', 'info'].forEach(function(level) {
        console[level] = function() {
            var args = Array.prototype.slice.call(arguments);
            var message = args.map(function(arg) {
                return typeof arg === 'object' ? JSON.stringify(arg) : String(arg);
            }).join(' ');
            __mamba_console_log(level, message);
        };
    });
    self.console = console;

    self.queueMicrotask = function(callback) {
        Promise.resolve().then(callback);
    };

    self.close = function() {
        __mamba_request_close();
    };
"#;

/// Timer surface, evaluated after the global scope. Timer ids are handed
/// out by this script; the native side only schedules and cancels.
const TIMER_SCRIPT: &str = r#"
    var __nextTimerId = 1;

    self.setTimeout = function(callback, delay) {
        if (typeof callback !== 'function') {
            if (typeof callback === 'string') callback = new Function(callback);
            else return 0;
        }
        var timerId = __nextTimerId++;
        var args = Array.prototype.slice.call(arguments, 2);
        __mamba_schedule_timer(timerId, delay || 0, false, function() {
            callback.apply(null, args);
        });
        return timerId;
    };

    self.clearTimeout = function(timerId) {
        if (timerId) __mamba_cancel_timer(timerId);
    };

    self.setInterval = function(callback, delay) {
        if (typeof callback !== 'function') {
            if (typeof callback === 'string') callback = new Function(callback);
            else return 0;
        }
        var timerId = __nextTimerId++;
        var args = Array.prototype.slice.call(arguments, 2);
        __mamba_schedule_timer(timerId, delay || 0, true, function() {
            callback.apply(null, args);
        });
        return timerId;
    };

    self.clearInterval = function(timerId) {
        self.clearTimeout(timerId);
    };

    self.setImmediate = function(callback) {
        var args = Array.prototype.slice.call(arguments, 1);
        return self.setTimeout(function() {
            callback.apply(null, args);
        }, 0);
    };

    self.clearImmediate = function(timerId) {
        self.clearTimeout(timerId);
    };
"#;

/// Control state shared between host threads and the worker thread.
/// Everything engine-related stays out of here.
pub(crate) struct WorkerShared {
    id: String,
    queue: TaskQueue,
    running: AtomicBool,
    initialized: AtomicBool,
    close_requested: AtomicBool,
    terminated: AtomicBool,
    next_task_id: AtomicU64,
    cancelled_timers: Mutex<HashSet<u64>>,
    script: Mutex<ScriptSlot>,
    script_cv: Condvar,
    callbacks: Arc<CallbackSet>,
}

/// One-shot slot for the startup script handshake.
#[derive(Default)]
struct ScriptSlot {
    pending: Option<String>,
    executed: bool,
}

impl WorkerShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Hand the worker its startup script and block until it has been
    /// evaluated. Returns whether the script ran without throwing.
    pub(crate) fn load_script(&self, source: &str) -> bool {
        if !self.is_running() {
            return false;
        }

        {
            let mut slot = self.script.lock().unwrap();
            slot.pending = Some(source.to_owned());
            slot.executed = false;
        }
        self.script_cv.notify_all();

        let mut slot = self.script.lock().unwrap();
        while slot.pending.is_some() && self.is_running() {
            let (guard, _timeout) = self
                .script_cv
                .wait_timeout(slot, Duration::from_millis(100))
                .unwrap();
            slot = guard;
        }
        slot.executed
    }

    /// Queue a structured-clone payload for the worker. Returns `false`
    /// once the worker is stopping; an accepted message runs unless the
    /// worker terminates first.
    pub(crate) fn post_message(&self, bytes: Vec<u8>) -> bool {
        if !self.is_running() || self.close_requested() {
            return false;
        }
        self.queue.enqueue(Task {
            id: self.next_task_id(),
            work: TaskWork::Message(bytes),
        });
        true
    }

    /// Evaluate `source` on the worker thread and return the result
    /// coerced to a string. Blocks the calling host thread until the
    /// staged task completes or the worker dies.
    pub(crate) fn eval_script(&self, source: &str) -> Result<String, WorkerError> {
        if !self.is_running() || self.close_requested() {
            return Err(WorkerError::NotRunning(self.id.clone()));
        }

        let reply = Arc::new(EvalReply::default());
        self.queue.enqueue(Task {
            id: self.next_task_id(),
            work: TaskWork::Eval {
                source: source.to_owned(),
                reply: Arc::clone(&reply),
            },
        });

        match reply.wait(|| self.is_running()) {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(WorkerError::Eval(message)),
            None => Err(WorkerError::NotRunning(self.id.clone())),
        }
    }

    /// `close()` from inside the worker: stop accepting tasks and let the
    /// event loop exit at the top of its next iteration. Queued tasks are
    /// discarded.
    fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        self.queue.shutdown();
    }

    fn cancel_timer(&self, timer_id: u64) {
        self.cancelled_timers.lock().unwrap().insert(timer_id);
        self.queue.cancel(timer_id);
    }
}

/// A worker: an isolated engine on its own thread, addressable by id.
pub struct WorkerRuntime {
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerRuntime {
    /// Spawn the worker thread and wait for its engine to come up. The
    /// returned runtime has no script yet; follow up with
    /// [`WorkerRuntime::load_script`].
    pub fn spawn(worker_id: impl Into<String>, callbacks: Arc<CallbackSet>) -> Self {
        let shared = Arc::new(WorkerShared {
            id: worker_id.into(),
            queue: TaskQueue::new(),
            running: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
            cancelled_timers: Mutex::new(HashSet::new()),
            script: Mutex::new(ScriptSlot::default()),
            script_cv: Condvar::new(),
            callbacks,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("worker-{}", shared.id))
            .spawn(move || worker_main(thread_shared))
            .expect("failed to spawn worker thread");

        // The engine must exist before the host may interact with the
        // worker; a failed engine build also flips this flag and leaves
        // the runtime permanently not-running.
        while !shared.initialized.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn load_script(&self, source: &str) -> bool {
        self.shared.load_script(source)
    }

    pub fn post_message(&self, bytes: Vec<u8>) -> bool {
        self.shared.post_message(bytes)
    }

    pub fn eval_script(&self, source: &str) -> Result<String, WorkerError> {
        self.shared.eval_script(source)
    }

    /// Stop the worker and join its thread. Idempotent and callable from
    /// any host thread; once this returns, no callback will fire again.
    pub fn terminate(&self) {
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(worker = %self.shared.id, "terminating worker");

        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.close_requested.store(true, Ordering::SeqCst);
        self.shared.queue.shutdown();
        // Unblock a worker still waiting for its first script.
        self.shared.script_cv.notify_all();

        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(worker = %self.shared.id, "worker thread panicked before join");
            }
        }
    }

    pub(crate) fn shared_handle(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        self.terminate();
    }
}

// ---------------------------------------------------------------------------
// Worker thread internals
// ---------------------------------------------------------------------------

/// Engine-side state of the worker thread. Timer callbacks are live engine
/// values and must never be reachable from another thread, so they live
/// here rather than in `WorkerShared`; native hooks reach this through a
/// thread-local since the engine only accepts plain function pointers.
struct WorkerThreadState {
    shared: Arc<WorkerShared>,
    timers: RefCell<HashMap<u64, TimerSlot>>,
}

#[derive(Clone)]
struct TimerSlot {
    callback: JsValue,
    delay: Duration,
    repeating: bool,
}

thread_local! {
    static ACTIVE_WORKER: RefCell<Option<Rc<WorkerThreadState>>> = RefCell::new(None);
}

fn active_worker() -> JsResult<Rc<WorkerThreadState>> {
    ACTIVE_WORKER
        .with(|slot| slot.borrow().clone())
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message("no worker runtime is bound to this thread")
                .into()
        })
}

fn worker_main(shared: Arc<WorkerShared>) {
    debug!(worker = %shared.id, "worker thread starting");

    let mut context = match ContextBuilder::default().build() {
        Ok(context) => context,
        Err(e) => {
            shared
                .callbacks
                .emit_error(&shared.id, &format!("Failed to create engine: {e}"));
            shared.initialized.store(true, Ordering::SeqCst);
            return;
        }
    };

    let state = Rc::new(WorkerThreadState {
        shared: Arc::clone(&shared),
        timers: RefCell::new(HashMap::new()),
    });
    ACTIVE_WORKER.with(|slot| *slot.borrow_mut() = Some(Rc::clone(&state)));

    let setup = install_native_hooks(&mut context)
        .and_then(|_| context.eval(Source::from_bytes(GLOBAL_SCOPE_SCRIPT.as_bytes())))
        .and_then(|_| context.eval(Source::from_bytes(TIMER_SCRIPT.as_bytes())));
    if let Err(e) = setup {
        shared
            .callbacks
            .emit_error(&shared.id, &format!("Exception setting up worker scope: {e}"));
        ACTIVE_WORKER.with(|slot| *slot.borrow_mut() = None);
        shared.initialized.store(true, Ordering::SeqCst);
        return;
    }

    shared.running.store(true, Ordering::SeqCst);
    shared.initialized.store(true, Ordering::SeqCst);

    run_pending_script(&shared, &mut context);

    if shared.is_running() && !shared.close_requested() {
        event_loop(&shared, &state, &mut context);
    }

    // Drop timer callbacks before the engine goes away.
    state.timers.borrow_mut().clear();
    ACTIVE_WORKER.with(|slot| *slot.borrow_mut() = None);
    shared.running.store(false, Ordering::SeqCst);
    shared.script_cv.notify_all();
    debug!(worker = %shared.id, "worker thread stopped");
}

/// Worker half of the script handshake: wait for the host to store a
/// script, evaluate it, drain its microtasks, and report back through the
/// same slot.
fn run_pending_script(shared: &Arc<WorkerShared>, context: &mut Context) {
    let mut slot = shared.script.lock().unwrap();
    while slot.pending.is_none() && shared.is_running() && !shared.close_requested() {
        let (guard, _timeout) = shared
            .script_cv
            .wait_timeout(slot, Duration::from_millis(100))
            .unwrap();
        slot = guard;
    }
    if !shared.is_running() || shared.close_requested() {
        return;
    }

    let Some(source) = slot.pending.clone() else {
        return;
    };
    let executed = match context.eval(Source::from_bytes(source.as_bytes())) {
        Ok(_) => {
            context.run_jobs();
            true
        }
        Err(e) => {
            shared
                .callbacks
                .emit_error(&shared.id, &format!("JSError: {e}"));
            false
        }
    };
    slot.executed = executed;
    slot.pending = None;
    drop(slot);
    shared.script_cv.notify_all();
}

enum TaskFailure {
    Js(JsError),
    Host(CloneError),
}

/// Macrotask loop. Each dequeued task runs to completion and has its
/// microtasks drained before the next one starts; a failing task is
/// reported and the loop keeps going.
fn event_loop(shared: &Arc<WorkerShared>, state: &Rc<WorkerThreadState>, context: &mut Context) {
    while shared.is_running() && !shared.close_requested() {
        let wait = shared.queue.time_until_next().min(MAX_LOOP_WAIT);
        let Some(task) = shared.queue.dequeue(wait) else {
            continue;
        };

        if let TaskWork::Timer { timer_id } = &task.work {
            if shared.cancelled_timers.lock().unwrap().contains(timer_id) {
                continue;
            }
        }

        let task_id = task.id;
        if let Err(failure) = run_task(shared, state, context, task) {
            let report = match failure {
                TaskFailure::Js(e) => format!("JSError in task: {e}"),
                TaskFailure::Host(e) => format!("Exception in task: {e}"),
            };
            debug!(worker = %shared.id, task = task_id, "task failed");
            shared.callbacks.emit_error(&shared.id, &report);
        }
    }
}

fn run_task(
    shared: &Arc<WorkerShared>,
    state: &Rc<WorkerThreadState>,
    context: &mut Context,
    task: Task,
) -> Result<(), TaskFailure> {
    match task.work {
        TaskWork::Message(bytes) => {
            let value = decode_value(&bytes, context).map_err(TaskFailure::Host)?;
            let handler = context
                .global_object()
                .get(js_string!("__mamba_handle_message"), context)
                .map_err(TaskFailure::Js)?;
            if let Some(handler) = handler.as_callable() {
                handler
                    .call(&JsValue::undefined(), &[value], context)
                    .map_err(TaskFailure::Js)?;
            }
        }
        TaskWork::Eval { source, reply } => {
            // The staged eval drains its own microtasks before coercing,
            // and its outcome belongs to the blocked host caller, not the
            // error callback.
            reply.complete(eval_source(context, &source));
            return Ok(());
        }
        TaskWork::Timer { timer_id } => {
            fire_timer(shared, state, context, timer_id);
        }
    }
    context.run_jobs();
    Ok(())
}

/// Invoke a registered timer callback. A repeating timer re-enqueues
/// itself afterwards unless it was cancelled (possibly by its own
/// callback); a one-shot timer releases its callback.
fn fire_timer(
    shared: &Arc<WorkerShared>,
    state: &Rc<WorkerThreadState>,
    context: &mut Context,
    timer_id: u64,
) {
    let slot = state.timers.borrow().get(&timer_id).cloned();
    let Some(slot) = slot else {
        return;
    };

    if let Some(callback) = slot.callback.as_callable() {
        if let Err(e) = callback.call(&JsValue::undefined(), &[], context) {
            shared
                .callbacks
                .emit_error(&shared.id, &format!("JSError in timer: {e}"));
        }
    }

    let reschedule = slot.repeating
        && !shared.cancelled_timers.lock().unwrap().contains(&timer_id)
        && state.timers.borrow().contains_key(&timer_id);
    if reschedule {
        shared.queue.enqueue_delayed(
            Task {
                id: timer_id,
                work: TaskWork::Timer { timer_id },
            },
            slot.delay,
        );
    } else {
        state.timers.borrow_mut().remove(&timer_id);
    }
}

fn eval_source(context: &mut Context, source: &str) -> Result<String, String> {
    let value = context
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| format!("JSError: {e}"))?;
    context.run_jobs();
    Ok(coerce_to_string(&value, context))
}

/// Host-facing rendering of an eval result: strings verbatim, integral
/// numbers without a decimal point, objects as best-effort JSON.
fn coerce_to_string(value: &JsValue, context: &mut Context) -> String {
    if let Some(string) = value.as_string() {
        return string.to_std_string_escaped();
    }
    if let Some(number) = value.as_number() {
        return format_number(number);
    }
    if let Some(boolean) = value.as_boolean() {
        return boolean.to_string();
    }
    if value.is_null() {
        return "null".to_string();
    }
    if value.is_undefined() {
        return "undefined".to_string();
    }
    if value.is_object() {
        if let Ok(json) = value.to_json(context) {
            return json.to_string();
        }
        return "[object Object]".to_string();
    }
    "[unknown]".to_string()
}

fn format_number(number: f64) -> String {
    if number.is_nan() {
        return "NaN".to_string();
    }
    if number.is_infinite() {
        return if number > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if number == number.trunc() && number.abs() <= i64::MAX as f64 {
        return (number as i64).to_string();
    }
    number.to_string()
}

/// Native hooks the bootstrap scripts bind into the worker global API.
/// The engine only takes plain function pointers, so each hook finds its
/// runtime through the thread-local slot.
fn install_native_hooks(context: &mut Context) -> JsResult<()> {
    let post_message = NativeFunction::from_fn_ptr(|_this, args, context| {
        let state = active_worker()?;
        // A closing worker neither receives nor delivers messages.
        if state.shared.close_requested() {
            return Ok(JsValue::undefined());
        }
        let value = args.get_or_undefined(0);
        match encode_value(value, context) {
            Ok(bytes) => {
                state.shared.callbacks.emit_message(&state.shared.id, &bytes);
                Ok(JsValue::undefined())
            }
            // Surfaces at the postMessage call site as a catchable error.
            Err(e) => Err(JsNativeError::error().with_message(e.to_string()).into()),
        }
    });
    context.register_global_callable(js_string!("__mamba_post_message"), 1, post_message)?;

    let console_log = NativeFunction::from_fn_ptr(|_this, args, context| {
        let state = active_worker()?;
        match args.len() {
            0 => {}
            1 => {
                let message = args[0].to_string(context)?.to_std_string_escaped();
                state
                    .shared
                    .callbacks
                    .emit_console(&state.shared.id, "log", &message);
            }
            _ => {
                let level = args[0].to_string(context)?.to_std_string_escaped();
                let message = args[1].to_string(context)?.to_std_string_escaped();
                state
                    .shared
                    .callbacks
                    .emit_console(&state.shared.id, &level, &message);
            }
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__mamba_console_log"), 2, console_log)?;

    let request_close = NativeFunction::from_fn_ptr(|_this, _args, _context| {
        let state = active_worker()?;
        state.shared.request_close();
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__mamba_request_close"), 0, request_close)?;

    let schedule_timer = NativeFunction::from_fn_ptr(|_this, args, context| {
        let state = active_worker()?;
        let timer_id = args.get_or_undefined(0).to_number(context)? as u64;
        let delay_ms = args.get_or_undefined(1).to_number(context)?;
        let repeating = args.get_or_undefined(2).to_boolean();
        let callback = args.get_or_undefined(3).clone();

        if callback.as_callable().is_none() {
            return Err(JsNativeError::typ()
                .with_message("timer callback must be a function")
                .into());
        }
        if state.shared.close_requested() {
            return Ok(JsValue::undefined());
        }

        // Negative delays clamp to zero; absurd ones to ~49 days so the
        // deadline arithmetic cannot overflow.
        let delay = Duration::from_millis(delay_ms.clamp(0.0, f64::from(u32::MAX)) as u64);
        state.timers.borrow_mut().insert(
            timer_id,
            TimerSlot {
                callback,
                delay,
                repeating,
            },
        );
        state.shared.queue.enqueue_delayed(
            Task {
                id: timer_id,
                work: TaskWork::Timer { timer_id },
            },
            delay,
        );
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__mamba_schedule_timer"), 4, schedule_timer)?;

    let cancel_timer = NativeFunction::from_fn_ptr(|_this, args, context| {
        let state = active_worker()?;
        let timer_id = args.get_or_undefined(0).to_number(context)? as u64;
        state.timers.borrow_mut().remove(&timer_id);
        state.shared.cancel_timer(timer_id);
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__mamba_cancel_timer"), 1, cancel_timer)?;

    Ok(())
}
