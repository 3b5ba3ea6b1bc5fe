#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod log;
pub mod raft;

pub use error::{Error, Result};
pub use raft::{Node, NodeAddr, Options};
