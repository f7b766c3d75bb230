//! # RPC over Message Queues
//!
//! Asynchronous request/response between processes that share nothing but
//! the coordination backend. Each node owns a queue pair derived from its
//! node path: callers push `Request`s onto the command queue, the node's
//! server loop executes them and pushes `Response`s onto the response queue,
//! and each caller's receiver resolves responses back to waiting futures by
//! request id.
//!
//! The channel is many-outstanding-calls-capable and makes no response
//! ordering promise beyond id correlation.

pub mod client;
pub mod command;
pub mod message;
pub mod server;

pub use client::{PendingCall, RpcClient};
pub use command::{Command, CommandContext};
pub use message::{Request, Response, ABORT_REQUEST_ID};
pub use server::RpcServer;
