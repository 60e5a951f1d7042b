// memring-common - Binary wire protocol codec shared by the memring crates
//
// This crate frames requests, parses responses and interprets status codes.
// It performs no I/O; sockets and pooling live in memring-client.

pub mod error;
pub mod frame;
pub mod header;
pub mod opcode;
pub mod operation;
pub mod result;
pub mod status;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use frame::*;
pub use header::*;
pub use opcode::*;
pub use operation::*;
pub use result::*;
pub use status::*;
pub use types::*;
