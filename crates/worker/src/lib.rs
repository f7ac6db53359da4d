//! Command worker: dispatch loop, streaming executor, process registry,
//! arithmetic evaluator and audit log.

pub mod audit;
pub mod dispatcher;
pub mod executor;
pub mod math;
pub mod registry;
pub mod server;

pub use audit::{AuditEntry, AuditLog, AuditSink, AuditStore, DEFAULT_QUEUE_CAPACITY, NoopAudit};
pub use dispatcher::Dispatcher;
pub use executor::{CommandStream, DEFAULT_SHELL, MAX_LINE_LEN, StreamingExecutor};
pub use math::{EvalError, evaluate, evaluate_with};
pub use registry::{ProcessRecord, ProcessRegistry};
pub use server::WorkerServer;
