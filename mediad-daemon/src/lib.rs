//! mediad daemon: lifecycle orchestration, crash diagnostics, readiness
//! handshake and the request server.

pub mod context;
pub mod diagnostics;
mod error;
pub mod protocol;
pub mod readiness;
mod runtime;
pub mod server;

pub use context::{DaemonContext, VERSION};
pub use error::DaemonError;
pub use protocol::{ping, request_status, send_request, Request, Response};
pub use readiness::{ParentNotifier, ReadinessProtocol, SigCont};
pub use runtime::{
    init_tracing, start_blocking, Daemon, DaemonOptions, ExitStatus, LifecycleState, LoopHandle,
    LoopTask, QuitReason, DEFAULT_HEARTBEAT, DEFAULT_JOIN_TIMEOUT,
};
pub use server::{BoundServer, JsonLineServer, RequestServer, ShutdownHandle};
