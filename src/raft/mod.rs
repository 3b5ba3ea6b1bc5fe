//! The consensus core: a leader-based replication protocol in the Raft
//! family over a fixed membership. A single leader per term appends client
//! commands to the durable log, peer replicators ship them to followers,
//! and committed entries are applied to the user state machine in order.

mod message;
mod node;
mod peer;
mod server;
mod state;

pub use crate::log::{Entry, Index, Term};
pub use message::{AppendEntries, AppendEntriesReply, Message, RequestVote, RequestVoteReply};
pub use node::{Node, NodeAddr, Options, Role, Status};
pub use state::State;
