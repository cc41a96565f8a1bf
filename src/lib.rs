//! Joule core: the streaming pipe abstraction, the module supervisor, and
//! the TimescaleDB-backed time-series store (spec §1). The HTTP
//! controller, CLI, and database bootstrap scripts are external
//! collaborators that consume these types; they are not implemented
//! here.

pub mod block;
pub mod config;
pub mod error;
pub mod interval;
pub mod layout;
pub mod logs;
pub mod module;
pub mod pipe;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod worker;

pub use error::{JouleError, Result};
