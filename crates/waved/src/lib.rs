//! Wave daemon crate: backlog store, scheduler, completion detection,
//! verification gates and the trunk merge pipeline.

pub mod completion;
pub mod controller;
pub mod dependency_graph;
pub mod event_log;
pub mod gate_runner;
pub mod merge;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;

pub use completion::*;
pub use controller::*;
pub use dependency_graph::*;
pub use event_log::*;
pub use gate_runner::*;
pub use merge::*;
pub use runtime::*;
pub use scheduler::*;
pub use service::*;
pub use store::*;
