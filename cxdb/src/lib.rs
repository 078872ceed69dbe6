//! ```text
//! BinaryClient ──► framed TCP (HELLO, ctx ops, APPEND_TURN, PUT_BLOB)
//!      │
//!      └─ content-addressed blobs (BLAKE3-256)
//!
//! Client ───────► HTTP JSON (/v1/contexts, /v1/registry, /health)
//! ```
//!
//! Clients for the CXDB context-database service. A *context* is a chain of
//! append-only *turns* with a unique linear head; large payloads live in a
//! blob store keyed by BLAKE3-256. The binary protocol carries the hot path
//! (blob upload, high-volume appends); the HTTP surface carries the JSON
//! append/fork/registry operations.

pub mod binary;
pub mod error;
pub mod frame;
pub mod http;

pub use binary::{AppendAck, BinaryClient, ContextInfo};
pub use error::CxdbError;
pub use http::{AppendTurnRequest, AppendTurnResponse, Client, HttpContextInfo};
