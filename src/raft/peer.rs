use super::node::{Role, Shared};
use super::{AppendEntries, Index, Message, NodeAddr, RequestVote};
use crate::encoding;
use crate::error::Result;

use ::log::debug;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timeout for establishing a peer connection.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for a single request/reply exchange. Bounds how long a hung peer
/// can stall its replicator; it never stalls the core.
const RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Reconnect backoff bounds after a failed exchange.
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// The replicator task for one remote peer, alive for the process lifetime.
/// Each iteration snapshots what to send under the mutex, performs the
/// network exchange with the mutex released, then reacquires it to apply
/// the outcome. Idle states park on the condition variable.
pub(super) fn run(shared: Arc<Shared>, addr: NodeAddr) -> Result<()> {
    let mut conn = Connection::new(addr);
    // Timing state is local to the task: the last successful exchange, the
    // leader commit index last shipped, and the reconnect backoff.
    let mut last_contact: Option<Instant> = None;
    let mut last_sent_commit: Index = 0;
    let mut backoff = MIN_BACKOFF;
    let mut backoff_until: Option<Instant> = None;

    let mut core = shared.lock();
    loop {
        if core.exiting {
            return Ok(());
        }
        let now = Instant::now();

        if let Some(until) = backoff_until {
            if now < until {
                let (guard, _) = shared
                    .cond
                    .wait_timeout(core, until - now)
                    .expect("consensus mutex poisoned");
                core = guard;
                continue;
            }
            backoff_until = None;
        }

        let request = match build_request(&shared, &core, addr, now, last_contact, last_sent_commit)?
        {
            Some(request) => request,
            None => {
                // Nothing to send. Leaders wake for the next heartbeat;
                // everyone wakes on role changes, appends, and shutdown.
                core = match heartbeat_deadline(&shared, &core, last_contact) {
                    Some(deadline) => {
                        let timeout = deadline.saturating_duration_since(now);
                        shared
                            .cond
                            .wait_timeout(core, timeout)
                            .expect("consensus mutex poisoned")
                            .0
                    }
                    None => shared.cond.wait(core).expect("consensus mutex poisoned"),
                };
                continue;
            }
        };

        let term_sent = core.term;
        drop(core);
        let reply = conn.call(&request);
        core = shared.lock();

        match reply {
            Ok(reply) => {
                backoff = MIN_BACKOFF;
                last_contact = Some(Instant::now());
                if let Message::AppendEntries(req) = &request {
                    last_sent_commit = req.leader_commit;
                }
                apply_reply(&shared, &mut core, addr, &request, reply, term_sent)?;
                shared.cond.notify_all();
            }
            Err(err) => {
                debug!("peer {addr} unreachable: {err}");
                backoff_until = Some(Instant::now() + backoff);
                backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
            }
        }
    }
}

/// Decides what to send to the peer, if anything, for the current role:
/// a vote solicitation while we're a candidate with a pending request, or
/// an append while we're the leader and the peer is behind on entries,
/// commit index, heartbeat, or initial leadership contact.
fn build_request(
    shared: &Shared,
    core: &super::node::Core,
    addr: NodeAddr,
    now: Instant,
    last_contact: Option<Instant>,
    last_sent_commit: Index,
) -> Result<Option<Message>> {
    match core.role {
        Role::Follower => Ok(None),
        Role::Candidate => {
            if !core.peers[&addr].vote_pending {
                return Ok(None);
            }
            Ok(Some(Message::RequestVote(RequestVote {
                term: core.term,
                candidate: shared.opts.addr,
                last_log_index: shared.log.last_index(),
                last_log_term: shared.log.last_term(),
            })))
        }
        Role::Leader => {
            let peer = &core.peers[&addr];
            let last_index = shared.log.last_index();
            let heartbeat_due =
                last_contact.map_or(true, |t| now >= t + shared.opts.heartbeat_interval);
            let has_entries = peer.next_index <= last_index;
            let commit_behind = core.commit_index > last_sent_commit;
            if peer.have_leadership && !heartbeat_due && !has_entries && !commit_behind {
                return Ok(None);
            }

            let prev_log_index = peer.next_index - 1;
            let prev_log_term = match prev_log_index {
                0 => 0,
                index => shared.log.get(index)?.expect("next_index beyond log").term,
            };
            let batch_end = std::cmp::min(
                last_index,
                prev_log_index + shared.opts.max_append_entries as Index,
            );
            let mut entries = Vec::new();
            for index in peer.next_index..=batch_end {
                entries.push(shared.log.get(index)?.expect("entry missing below last index"));
            }
            Ok(Some(Message::AppendEntries(AppendEntries {
                term: core.term,
                leader: shared.opts.addr,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: core.commit_index,
            })))
        }
    }
}

/// When the next heartbeat is due for this peer, or None if the node isn't
/// leader (then there is no deadline and the task waits for a wakeup).
fn heartbeat_deadline(
    shared: &Shared,
    core: &super::node::Core,
    last_contact: Option<Instant>,
) -> Option<Instant> {
    match core.role {
        Role::Leader => Some(last_contact? + shared.opts.heartbeat_interval),
        _ => None,
    }
}

/// Applies a reply under the mutex. A higher term always steps us down.
/// Anything else only counts if the role and term still match what was
/// sent; the world may have moved on during the exchange.
fn apply_reply(
    shared: &Shared,
    core: &mut super::node::Core,
    addr: NodeAddr,
    request: &Message,
    reply: Message,
    term_sent: super::Term,
) -> Result<()> {
    match (request, reply) {
        (Message::RequestVote(_), Message::RequestVoteReply(reply)) => {
            if reply.term > core.term {
                return shared.step_down(core, reply.term);
            }
            // A reply from a previous election round must not clear the
            // current round's pending flag.
            if core.role == Role::Candidate && core.term == term_sent {
                let peer = core.peers.get_mut(&addr).unwrap();
                peer.vote_pending = false;
                peer.have_vote = reply.granted;
                if reply.granted {
                    debug!("peer {addr} granted vote in term {}", core.term);
                    shared.maybe_become_leader(core)?;
                }
            }
            Ok(())
        }
        (Message::AppendEntries(req), Message::AppendEntriesReply(reply)) => {
            if reply.term > core.term {
                return shared.step_down(core, reply.term);
            }
            if core.role != Role::Leader || core.term != term_sent {
                return Ok(());
            }
            let peer = core.peers.get_mut(&addr).unwrap();
            if reply.success {
                peer.have_leadership = true;
                let shipped = req.prev_log_index + req.entries.len() as Index;
                if shipped > peer.match_index {
                    debug!("peer {addr} matched up to {shipped}");
                    peer.match_index = shipped;
                }
                peer.next_index = peer.match_index + 1;
                shared.advance_commit_index(core)?;
            } else if peer.next_index > 1 {
                // The follower's log diverges; back up one entry and retry.
                peer.next_index -= 1;
            }
            Ok(())
        }
        (_, reply) => {
            debug!("unexpected reply from {addr}: {reply:?}");
            Ok(())
        }
    }
}

/// An outbound connection to a peer, (re)established lazily. A broken
/// exchange drops the stream; the caller applies backoff before retrying.
struct Connection {
    addr: NodeAddr,
    stream: Option<TcpStream>,
}

impl Connection {
    fn new(addr: NodeAddr) -> Self {
        Self { addr, stream: None }
    }

    /// Performs one request/reply exchange, resetting the connection on
    /// any failure.
    fn call(&mut self, request: &Message) -> Result<Message> {
        let result = self.try_call(request);
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    fn try_call(&mut self, request: &Message) -> Result<Message> {
        if self.stream.is_none() {
            let stream =
                TcpStream::connect_timeout(&SocketAddr::V4(self.addr), CONNECT_TIMEOUT)?;
            stream.set_read_timeout(Some(RPC_TIMEOUT))?;
            stream.set_write_timeout(Some(RPC_TIMEOUT))?;
            stream.set_nodelay(true)?;
            debug!("connected to peer {}", self.addr);
            self.stream = Some(stream);
        }
        let stream = self.stream.as_mut().unwrap();
        encoding::serialize_into(&mut *stream, request)?;
        encoding::deserialize_from(&mut *stream)
    }
}
