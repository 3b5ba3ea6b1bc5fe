use super::{Entry, Index, NodeAddr, Term};

use serde::{Deserialize, Serialize};

/// A message passed between nodes. The envelope discriminant selects one of
/// the four consensus messages; requests are answered in-stream with the
/// corresponding reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
}

/// Candidates solicit votes from all peers when campaigning for leadership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    /// The candidate's term.
    pub term: Term,
    /// The candidate's identity.
    pub candidate: NodeAddr,
    /// The index of the candidate's last log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// A vote reply. Voters grant at most one vote per term, on a first-come
/// basis, and only to candidates whose log is at least as up-to-date.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// The voter's current term, which may exceed the candidate's.
    pub term: Term,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// Leaders replicate log entries to followers. An empty entries slice is a
/// heartbeat, which also establishes and maintains leadership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// The leader's term.
    pub term: Term,
    /// The leader's identity, recorded by followers for client forwarding.
    pub leader: NodeAddr,
    /// The index of the log entry immediately preceding the shipped entries.
    pub prev_log_index: Index,
    /// The term of the log entry immediately preceding the shipped entries.
    pub prev_log_term: Term,
    /// Entries to replicate.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: Index,
}

/// An append reply. success is false either for a stale leader term or for
/// a log mismatch at prev_log_index, in which case the leader backtracks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// The follower's current term, which may exceed the leader's.
    pub term: Term,
    /// Whether the entries were appended.
    pub success: bool,
}
