//! tagline: synchronous RPC on top of a tag-based completion engine.
//!
//! A native engine runs batches of operations against calls and reports each
//! batch's completion on a shared queue under an opaque [`Tag`]. tagline turns
//! that into blocking, composable operations: a [`CompletionQueue`] whose
//! [`pluck`](CompletionQueue::pluck) waits for exactly one tag while other
//! batches stay in flight, an [`OpContext`] codec that owns every output slot
//! of a batch until it is decoded, and unary [`Client`]/[`Server`] built from
//! those pieces.
//!
//! # Architecture
//!
//! ```text
//!   Client::request / Server::handle
//!        |
//!   +----v-----------+
//!   | Call           |  one outstanding batch, cancel
//!   +----+-----------+
//!        | OpContext::encode
//!   +----v-----------+      post(tag)      +----------------+
//!   | NativeCall     | ------------------> | EventQueue     |
//!   +----------------+                     +-------+--------+
//!                                                  | poller thread
//!                                          +-------v--------+
//!                                          | TagRegistry    |  per-tag slots
//!                                          +-------+--------+
//!                                                  | pluck(tag)
//!                                           OpContext::decode
//! ```
//!
//! Engines implement the traits in [`native`]; `tagline-local` provides an
//! in-process one.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tagline::{ByteBuffer, Client, ClientConfig, MetadataMap};
//!
//! let client = Client::new(&engine, ClientConfig::default())?;
//! let reply = client.request(
//!     "/echo.Echo/Say",
//!     Duration::from_secs(5),
//!     ByteBuffer::copy_in(b"hello world"),
//!     MetadataMap::new(),
//! )?;
//! assert_eq!(reply.body.unwrap().copy_out(), b"hello you");
//! ```

pub mod buffer;
pub mod call;
pub mod client;
pub mod config;
pub mod deadline;
pub mod error;
pub mod metadata;
pub mod method;
pub mod metrics;
pub mod native;
pub mod op;
pub mod queue;
pub mod request;
pub mod server;
pub mod status;
pub mod tag;

pub use buffer::ByteBuffer;
pub use call::{Call, CallState};
pub use client::Client;
pub use config::{ClientConfig, ClientConfigBuilder, ServerConfig, ServerConfigBuilder};
pub use deadline::Deadline;
pub use error::Error;
pub use metadata::MetadataMap;
pub use method::{CallType, RegisteredMethod};
pub use native::{
    CallError, ClientStatus, Completion, ConnectivityState, EngineError, MethodHandle,
};
pub use op::{Op, OpContext, OpResult};
pub use queue::{CompletionQueue, QueueState};
pub use request::{NormalRequestResult, ResponseShape};
pub use server::{Server, ServerCall, ServerRequest, ServerResponse};
pub use status::StatusCode;
pub use tag::Tag;
