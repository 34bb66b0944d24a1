// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod format;
pub mod handlers;
pub mod headers;
pub mod http;
pub mod json;
pub mod metrics;
pub mod parser;
pub mod response;
pub mod server;
pub mod storage;
pub mod stream;
pub mod syscalls;
pub mod worker;

// Re-exports for users
pub use config::Config;
pub use error::{VersoError, VersoResult};
pub use http::{Method, Request};
pub use json::Json;
pub use response::{BodyLength, Response};
pub use server::{Server, ServerState};
pub use storage::Storage;
pub use stream::Stream;
