//! Pipe abstractions: the in-process queue ([`local`]) and the
//! cross-process byte-stream adapter built on top of it ([`framed`]).

pub mod framed;
pub mod local;

pub use local::{Pipe, PipeVariant, ReadData};
