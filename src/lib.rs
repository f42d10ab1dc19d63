//! Mamba - a multi-threaded Web Worker runtime core powered by Boa
//!
//! Mamba gives a host application isolated JavaScript workers in the Web
//! Worker style:
//! - One Boa engine instance per worker, confined to its own OS thread
//! - An HTML-style event loop: macrotasks from a hybrid immediate/delayed
//!   queue, microtasks drained after every macrotask
//! - A binary structured-clone codec for moving rich value graphs
//!   (typed arrays, Map/Set, Date/RegExp, cycles) between threads
//! - Worker scripts see the familiar global surface: `self`, `onmessage`,
//!   `postMessage`, timers, `queueMicrotask`, `console`, `close`
//!
//! The host talks to workers through a [`WorkerManager`] and receives
//! message, console, and error traffic through callbacks. No network, no
//! filesystem, no CLI; this crate is the embeddable core.

pub mod clone;
mod manager;
mod task_queue;
mod worker;

// Re-export commonly used types
pub use clone::{
    decode_value, encode_value, CloneError, CloneTag, ReadBuffer, WriteBuffer, MAX_DEPTH, MAX_SIZE,
};
pub use manager::WorkerManager;
pub use worker::{
    CallbackSet, ConsoleCallback, ErrorCallback, MessageCallback, WorkerError, WorkerRuntime,
};
