use super::state::State;
use super::{peer, server};
use super::{AppendEntries, AppendEntriesReply, Entry, Index, RequestVote, RequestVoteReply, Term};
use crate::error::{Error, Result};
use crate::log::Log;

use ::log::{debug, error, info};
use itertools::Itertools as _;
use rand::Rng as _;
use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A node identity: an (ip, port) pair, fixed at startup. Also the address
/// the node's peer server listens on.
pub type NodeAddr = std::net::SocketAddrV4;

/// Node options. The membership is fixed for the lifetime of the process:
/// the cluster is `peers` plus the local node.
#[derive(Clone, Debug)]
pub struct Options {
    /// The local node identity and listen address.
    pub addr: NodeAddr,
    /// The remote cluster members, excluding the local node.
    pub peers: Vec<NodeAddr>,
    /// The base election timeout. The effective timeout is randomized in
    /// [base, 4 * base) to avoid split votes.
    pub election_timeout: Duration,
    /// The leader heartbeat interval. Should be well below the election
    /// timeout.
    pub heartbeat_interval: Duration,
    /// How long a client proposal waits for its commit and apply outcome.
    pub propose_timeout: Duration,
    /// Maximum number of entries shipped in a single AppendEntries.
    pub max_append_entries: usize,
    /// A node that has just joined the cluster may not vote until its term
    /// has reached this threshold (together with vote_target_index). Zero
    /// means immediately voteable.
    pub vote_target_term: Term,
    /// The commit index the node must reach before it may vote.
    pub vote_target_index: Index,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addr: NodeAddr::new(Ipv4Addr::LOCALHOST, 0),
            peers: Vec::new(),
            election_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(100),
            propose_timeout: Duration::from_secs(10),
            max_append_entries: 64,
            vote_target_term: 0,
            vote_target_index: 0,
        }
    }
}

/// A node role. Transitions are driven by election timeouts, vote outcomes,
/// and observed terms, and only ever happen under the consensus mutex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Leader-side replication state for one peer.
#[derive(Debug, Default)]
pub(super) struct PeerState {
    /// The next log index to send. Initialized to last_index + 1 on
    /// becoming leader.
    pub next_index: Index,
    /// The highest index known to be replicated on the peer. Monotonically
    /// non-decreasing while we remain leader.
    pub match_index: Index,
    /// Whether a vote request for the current election is outstanding.
    pub vote_pending: bool,
    /// Whether the peer granted its vote in the current election.
    pub have_vote: bool,
    /// Whether the peer has accepted us as leader (first successful append).
    pub have_leadership: bool,
}

/// A client waiter for a proposed entry, keyed by index in Core::waiters.
/// The proposal term detects the entry being truncated and replaced by a
/// different leader's entry at the same index.
struct Waiter {
    term: Term,
    outcome: Option<Result<()>>,
}

/// The volatile consensus state, protected by the consensus mutex.
pub(super) struct Core {
    pub role: Role,
    /// The current term. Non-decreasing; persisted on change.
    pub term: Term,
    /// Our vote in the current term, if any. Persisted before any reply
    /// granting it leaves the node.
    pub voted_for: Option<NodeAddr>,
    /// The current leader, if known.
    pub leader: Option<NodeAddr>,
    /// The highest committed index. Monotonically non-decreasing.
    pub commit_index: Index,
    /// The highest index applied to the state machine.
    pub last_applied: Index,
    /// The highest locally durable index. The leader may not count its own
    /// replica toward a quorum beyond this.
    pub last_synced_index: Index,
    /// Set when the leader has appended entries that await a disk sync.
    pub log_sync_queued: bool,
    /// When the election timer fires. None while leader.
    pub election_deadline: Option<Instant>,
    /// Whether this node may cast votes yet; see Options::vote_target_term.
    pub voteable: bool,
    /// Per-peer replication state, reset on becoming leader.
    pub peers: HashMap<NodeAddr, PeerState>,
    /// Pending client proposals by index.
    waiters: HashMap<Index, Waiter>,
    /// Set once at shutdown; every long-lived task unwinds at its next check.
    pub exiting: bool,
}

/// State shared between the node's tasks: the options and log (internally
/// synchronized), and the core under its mutex and condition variable. Tasks
/// hold an Arc to this rather than a back-pointer to the node.
pub(super) struct Shared {
    pub opts: Options,
    pub log: Log,
    mutex: Mutex<Core>,
    pub cond: Condvar,
}

/// Logs the error and terminates the process. Used for durability failures:
/// a node that cannot persist cannot uphold its contract.
pub(super) fn fatal(err: Error) -> ! {
    error!("fatal error: {err}");
    std::process::exit(1);
}

/// Spawns a named long-lived task. Any error escaping the task is fatal;
/// transient conditions are handled inside the task loops.
fn spawn(name: String, f: impl FnOnce() -> Result<()> + Send + 'static) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Err(err) = f() {
                fatal(err);
            }
        })
        .expect("failed to spawn thread")
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, Core> {
        self.mutex.lock().expect("consensus mutex poisoned")
    }

    pub fn is_exiting(&self) -> bool {
        self.lock().exiting
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.opts.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b| a.cmp(b).reverse()).1
    }

    /// Durably persists the term, vote, and applied index in the log's
    /// metadata record.
    fn persist_metadata(&self, core: &Core) -> Result<()> {
        self.log.update_metadata(core.term, core.voted_for, core.last_applied)
    }

    /// Arms the election timer at now + base + uniform(0, 3 * base), and
    /// wakes the timer task.
    fn set_election_timer(&self, core: &mut Core) {
        let base = self.opts.election_timeout;
        let timeout = base + rand::thread_rng().gen_range(Duration::ZERO..3 * base);
        core.election_deadline = Some(Instant::now() + timeout);
        self.cond.notify_all();
    }

    /// Steps down to a follower in the given term, adopting the term and
    /// clearing the vote and leader if it is newer. Arms the election timer
    /// if it isn't running (i.e. when stepping down from leader).
    pub fn step_down(&self, core: &mut Core, term: Term) -> Result<()> {
        assert!(term >= core.term, "term regression {} → {term}", core.term);
        if term > core.term {
            debug!("stepping down to term {term}");
            core.term = term;
            core.leader = None;
            core.voted_for = None;
            self.persist_metadata(core)?;
        }
        core.role = Role::Follower;
        if core.election_deadline.is_none() {
            self.set_election_timer(core);
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Starts a new election: bump the term, vote for ourselves, and ask the
    /// peer tasks to solicit votes. Also called to restart a stale election.
    fn start_election(&self, core: &mut Core) -> Result<()> {
        core.term += 1;
        core.role = Role::Candidate;
        core.leader = None;
        core.voted_for = Some(self.opts.addr);
        info!("starting election for term {}", core.term);
        self.persist_metadata(core)?;
        self.set_election_timer(core);
        for peer in core.peers.values_mut() {
            peer.vote_pending = true;
            peer.have_vote = false;
        }
        self.cond.notify_all();
        // A single-node cluster has its quorum immediately.
        self.maybe_become_leader(core)
    }

    /// Becomes leader if we're a candidate holding a quorum of votes.
    pub fn maybe_become_leader(&self, core: &mut Core) -> Result<()> {
        if core.role != Role::Candidate {
            return Ok(());
        }
        let votes = 1 + core.peers.values().filter(|p| p.have_vote).count();
        if votes >= self.quorum_size() {
            self.become_leader(core)?;
        }
        Ok(())
    }

    /// Transitions a candidate into the leader: disable the election timer,
    /// reset the per-peer replication state, and append a noop entry. The
    /// noop produces an entry in the current term so the commit index can
    /// advance: a leader may not commit prior-term entries by counting
    /// replicas alone.
    fn become_leader(&self, core: &mut Core) -> Result<()> {
        assert_eq!(core.role, Role::Candidate, "can only become leader from candidate");
        core.role = Role::Leader;
        core.leader = Some(self.opts.addr);
        core.election_deadline = None;
        let next_index = self.log.last_index() + 1;
        for peer in core.peers.values_mut() {
            *peer = PeerState { next_index, ..PeerState::default() };
        }
        info!("became leader in term {}", core.term);
        self.append(core, None)?;
        self.cond.notify_all();
        Ok(())
    }

    /// Appends an entry to the log in the current term and queues a disk
    /// sync for the disk task. Returns the assigned index.
    fn append(&self, core: &mut Core, command: Option<Vec<u8>>) -> Result<Index> {
        let entry = Entry { index: self.log.last_index() + 1, term: core.term, command };
        let (_, index) = self.log.append(vec![entry])?;
        core.log_sync_queued = true;
        self.cond.notify_all();
        Ok(index)
    }

    /// Recomputes the commit index from the quorum of match indexes (the
    /// local replica counts only up to its synced index). The quorum index
    /// must hold an entry from the current term to commit.
    pub fn advance_commit_index(&self, core: &mut Core) -> Result<()> {
        assert_eq!(core.role, Role::Leader, "only the leader advances the commit index");
        let mut indexes: Vec<Index> = core.peers.values().map(|p| p.match_index).collect();
        indexes.push(core.last_synced_index);
        let quorum_index = self.quorum_value(indexes);
        if quorum_index <= core.commit_index || quorum_index == 0 {
            return Ok(());
        }
        match self.log.get(quorum_index)? {
            Some(entry) if entry.term == core.term => {}
            Some(_) => return Ok(()), // can't commit an earlier leader's entry directly
            None => panic!("quorum index {quorum_index} missing from log"),
        }
        debug!("advancing commit index to {quorum_index}");
        core.commit_index = quorum_index;
        self.cond.notify_all();
        Ok(())
    }

    /// Handles an inbound vote request. Grants iff the candidate's term
    /// matches ours, we haven't voted for someone else this term, the
    /// candidate's log is at least as up-to-date as ours, and this node has
    /// caught up enough to be allowed to vote. The vote is durable before
    /// the reply is returned.
    pub fn request_vote(&self, req: &RequestVote) -> Result<RequestVoteReply> {
        let mut core = self.lock();
        if req.term > core.term {
            self.step_down(&mut core, req.term)?;
        }

        // A node that has just joined must first catch up; once both
        // thresholds are reached it stays voteable.
        if !core.voteable
            && core.term >= self.opts.vote_target_term
            && core.commit_index >= self.opts.vote_target_index
        {
            core.voteable = true;
        }

        let (last_log_term, last_log_index) = (self.log.last_term(), self.log.last_index());
        let up_to_date = (req.last_log_term, req.last_log_index) >= (last_log_term, last_log_index);

        let mut granted = false;
        if req.term == core.term
            && up_to_date
            && core.voteable
            && core.voted_for.map_or(true, |v| v == req.candidate)
        {
            core.voted_for = Some(req.candidate);
            self.persist_metadata(&core)?;
            self.set_election_timer(&mut core);
            granted = true;
            info!("granted vote to {} in term {}", req.candidate, core.term);
        }
        Ok(RequestVoteReply { term: core.term, granted })
    }

    /// Handles an inbound append. Records the sender as the term's leader,
    /// rearms the election timer, verifies the log matches at the preceding
    /// entry, reconciles the shipped entries against the local log, and
    /// advances the commit index. Appended entries are made durable, with
    /// the mutex released, before the acknowledgement is returned.
    pub fn append_entries(&self, req: &AppendEntries) -> Result<AppendEntriesReply> {
        let mut core = self.lock();
        if req.term < core.term {
            return Ok(AppendEntriesReply { term: core.term, success: false });
        }
        self.step_down(&mut core, req.term)?;
        self.set_election_timer(&mut core);
        match core.leader {
            None => {
                info!("following leader {} in term {}", req.leader, core.term);
                core.leader = Some(req.leader);
            }
            Some(leader) => {
                assert_eq!(leader, req.leader, "two leaders in term {}", core.term);
            }
        }

        // Log match: the entry preceding the shipped batch must agree on
        // its term.
        if req.prev_log_index > 0 {
            match self.log.get(req.prev_log_index)? {
                Some(entry) if entry.term == req.prev_log_term => {}
                _ => {
                    debug!(
                        "rejecting entries: no match at {}@{}",
                        req.prev_log_index, req.prev_log_term
                    );
                    return Ok(AppendEntriesReply { term: core.term, success: false });
                }
            }
        }

        // Skip entries the log already holds; on the first term conflict,
        // truncate the divergent suffix and append the rest.
        let mut entries = req.entries.as_slice();
        while let Some(entry) = entries.first() {
            if entry.index > self.log.last_index() {
                break;
            }
            match self.log.get(entry.index)? {
                Some(local) if local.term == entry.term => entries = &entries[1..],
                _ => {
                    assert!(entry.index > core.commit_index, "log conflict below commit index");
                    info!("truncating divergent log suffix from {}", entry.index);
                    self.log.truncate_suffix(entry.index - 1)?;
                    break;
                }
            }
        }
        let mut sync = None;
        if !entries.is_empty() {
            self.log.append(entries.to_vec())?;
            sync = Some(self.log.sync()?);
        }

        let last_new_index = req.prev_log_index + req.entries.len() as Index;
        let new_commit = std::cmp::min(req.leader_commit, last_new_index);
        if new_commit > core.commit_index {
            core.commit_index = new_commit;
            self.cond.notify_all();
        }
        let reply = AppendEntriesReply { term: core.term, success: true };
        drop(core);

        // The entries must be durable before they are acknowledged. The
        // disk wait happens with the consensus mutex released.
        if let Some(sync) = sync {
            sync.wait()?;
        }
        Ok(reply)
    }

    /// Proposes a command for replication. Appends it to the log at the
    /// current term, wakes the peer and disk tasks, and blocks until the
    /// apply loop records an outcome for the assigned index, the leadership
    /// is lost, or the proposal times out.
    pub fn propose(&self, command: Vec<u8>) -> Result<Index> {
        let mut core = self.lock();
        if core.exiting {
            return Err(Error::Abort);
        }
        if core.role != Role::Leader {
            return Err(Error::NotLeader(core.leader));
        }
        let term = core.term;
        let index = self.append(&mut core, Some(command))?;
        core.waiters.insert(index, Waiter { term, outcome: None });
        debug!("proposed entry {index} in term {term}");

        let deadline = Instant::now() + self.opts.propose_timeout;
        let result = loop {
            if let Some(outcome) = core.waiters.get_mut(&index).and_then(|w| w.outcome.take()) {
                break outcome.map(|()| index);
            }
            if core.exiting {
                break Err(Error::Abort);
            }
            if core.term != term || core.role != Role::Leader {
                break Err(Error::NotLeader(core.leader));
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(Error::Timeout);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(core, deadline - now)
                .expect("consensus mutex poisoned");
            core = guard;
        };
        core.waiters.remove(&index);
        result
    }
}

/// The election timer task: waits until the deadline passes without any
/// valid leader contact, then starts an election. While leader there is no
/// deadline and the task sleeps until woken by a role change.
fn election_loop(shared: Arc<Shared>) -> Result<()> {
    let mut core = shared.lock();
    while !core.exiting {
        match core.election_deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    shared.start_election(&mut core)?;
                    continue;
                }
                let (guard, _) = shared
                    .cond
                    .wait_timeout(core, deadline - now)
                    .expect("consensus mutex poisoned");
                core = guard;
            }
            None => core = shared.cond.wait(core).expect("consensus mutex poisoned"),
        }
    }
    Ok(())
}

/// The disk sync task: takes ownership of queued log syncs and waits for
/// them off the critical path, with the mutex released, then advances the
/// commit index with the newly durable local index. Drains the queue in any
/// role, so a step-down can't strand a queued flush.
fn disk_sync_loop(shared: Arc<Shared>) -> Result<()> {
    let mut core = shared.lock();
    while !core.exiting {
        if !core.log_sync_queued {
            core = shared.cond.wait(core).expect("consensus mutex poisoned");
            continue;
        }
        core.log_sync_queued = false;
        let sync = shared.log.sync()?;
        drop(core);
        sync.wait()?;
        core = shared.lock();
        if sync.last_index > core.last_synced_index {
            core.last_synced_index = sync.last_index;
        }
        if core.role == Role::Leader {
            shared.advance_commit_index(&mut core)?;
        }
    }
    Ok(())
}

/// The apply task: hands committed entries to the state machine in strict
/// index order, with the mutex released, persists the applied index, and
/// completes any client waiter for the index.
fn apply_loop(shared: Arc<Shared>, mut state: Box<dyn State>) -> Result<()> {
    let mut core = shared.lock();
    while !core.exiting {
        if core.commit_index <= core.last_applied {
            core = shared.cond.wait(core).expect("consensus mutex poisoned");
            continue;
        }
        let index = core.last_applied + 1;
        let entry = shared
            .log
            .get(index)?
            .ok_or_else(|| Error::Corrupt(format!("committed entry {index} missing from log")))?;
        drop(core);

        // Noop entries advance the applied index without touching the state
        // machine.
        let outcome = match entry.command {
            Some(ref command) => state.apply(index, command.clone()).map(|_| ()),
            None => Ok(()),
        };

        core = shared.lock();
        core.last_applied = index;
        shared.persist_metadata(&core)?;
        if let Err(err) = &outcome {
            error!("state machine rejected entry {index}: {err}");
        }
        let leader = core.leader;
        if let Some(waiter) = core.waiters.get_mut(&index) {
            // A different term at this index means the proposal was
            // truncated and replaced under the waiter.
            waiter.outcome = Some(match entry.term == waiter.term {
                true => outcome,
                false => Err(Error::NotLeader(leader)),
            });
        }
        shared.cond.notify_all();
    }
    Ok(())
}

/// Node status, as reported by Node::status.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub addr: NodeAddr,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeAddr>,
    pub last_index: Index,
    pub commit_index: Index,
    pub apply_index: Index,
    /// Leader-side match indexes by peer, in address order.
    pub match_index: Vec<(NodeAddr, Index)>,
}

/// A consensus node. Construct it with a recovered log and a state machine,
/// then start() it to spawn the long-lived tasks: the election timer, the
/// disk sync task, the apply loop, one replicator per peer, and the peer
/// server. stop() (or drop) shuts them down and joins them.
pub struct Node {
    shared: Arc<Shared>,
    /// The state machine, held until start() hands it to the apply loop.
    state: Mutex<Option<Box<dyn State>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Creates a node from a recovered log. Consensus state is restored from
    /// the log's metadata record; the commit index resumes from the applied
    /// index (applied entries are necessarily committed) and catches up from
    /// the leader.
    pub fn new(opts: Options, log: Log, state: Box<dyn State>) -> Self {
        let metadata = log.metadata();
        let core = Core {
            role: Role::Follower,
            term: metadata.current_term,
            voted_for: metadata.voted_for,
            leader: None,
            commit_index: metadata.last_applied,
            last_applied: metadata.last_applied,
            last_synced_index: log.last_index(),
            log_sync_queued: false,
            election_deadline: None,
            voteable: false,
            peers: opts.peers.iter().map(|addr| (*addr, PeerState::default())).collect(),
            waiters: HashMap::new(),
            exiting: false,
        };
        let shared = Arc::new(Shared { opts, log, mutex: Mutex::new(core), cond: Condvar::new() });
        Self { shared, state: Mutex::new(Some(state)), threads: Mutex::new(Vec::new()) }
    }

    /// Starts the node: binds the peer server and spawns the long-lived
    /// tasks.
    pub fn start(&self) -> Result<()> {
        let state = self
            .state
            .lock()
            .expect("state mutex poisoned")
            .take()
            .expect("node already started");
        let listener = TcpListener::bind(self.shared.opts.addr)?;
        self.shared.set_election_timer(&mut self.shared.lock());

        let mut threads = self.threads.lock().expect("threads mutex poisoned");
        let shared = self.shared.clone();
        threads.push(spawn("fjord-election".into(), move || election_loop(shared)));
        let shared = self.shared.clone();
        threads.push(spawn("fjord-disk".into(), move || disk_sync_loop(shared)));
        let shared = self.shared.clone();
        threads.push(spawn("fjord-apply".into(), move || apply_loop(shared, state)));
        for addr in self.shared.opts.peers.clone() {
            let shared = self.shared.clone();
            threads.push(spawn(format!("fjord-peer-{addr}"), move || peer::run(shared, addr)));
        }
        let shared = self.shared.clone();
        threads.push(spawn("fjord-server".into(), move || server::serve(shared, listener)));

        info!(
            "node {} started with {} peers",
            self.shared.opts.addr,
            self.shared.opts.peers.len()
        );
        Ok(())
    }

    /// Stops the node and joins all tasks. Pending proposals observe a
    /// terminal Abort. Idempotent.
    pub fn stop(&self) {
        {
            let mut core = self.shared.lock();
            if core.exiting {
                return;
            }
            core.exiting = true;
            self.shared.cond.notify_all();
        }
        // The acceptor blocks in accept(); poke it awake.
        let addr = std::net::SocketAddr::V4(self.shared.opts.addr);
        drop(TcpStream::connect_timeout(&addr, Duration::from_millis(100)));
        for thread in self.threads.lock().expect("threads mutex poisoned").drain(..) {
            thread.join().expect("consensus task panicked");
        }
        info!("node {} stopped", self.shared.opts.addr);
    }

    /// Proposes a command for replication, blocking until it is committed
    /// and applied. Returns the commit index, Error::NotLeader if this node
    /// isn't the leader, or Error::Timeout if the outcome wasn't observed
    /// in time.
    pub fn propose(&self, command: Vec<u8>) -> Result<Index> {
        self.shared.propose(command)
    }

    /// Returns the current leader, if known.
    pub fn leader(&self) -> Option<NodeAddr> {
        self.shared.lock().leader
    }

    /// Returns true if this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.shared.lock().role == Role::Leader
    }

    /// Returns the node status.
    pub fn status(&self) -> Status {
        let core = self.shared.lock();
        Status {
            addr: self.shared.opts.addr,
            role: core.role,
            term: core.term,
            leader: core.leader,
            last_index: self.shared.log.last_index(),
            commit_index: core.commit_index,
            apply_index: core.last_applied,
            match_index: core.peers.iter().map(|(addr, p)| (*addr, p.match_index)).sorted().collect(),
        }
    }

    /// Handles an inbound vote request, for the RPC worker.
    pub fn request_vote(&self, req: &RequestVote) -> Result<RequestVoteReply> {
        self.shared.request_vote(req)
    }

    /// Handles an inbound append, for the RPC worker.
    pub fn append_entries(&self, req: &AppendEntries) -> Result<AppendEntriesReply> {
        self.shared.append_entries(req)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::tests::TestState;
    use super::*;
    use crate::log::Metadata;
    use pretty_assertions::assert_eq;

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::new(Ipv4Addr::LOCALHOST, port)
    }

    fn entry(index: Index, term: Term, command: &str) -> Entry {
        let command = match command {
            "" => None,
            c => Some(c.as_bytes().to_vec()),
        };
        Entry { index, term, command }
    }

    /// Builds an unstarted node over a fresh log, for driving the inbound
    /// handlers directly.
    fn test_node(opts: Options) -> (Node, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let log = Log::open(dir.path()).expect("log open failed");
        let node = Node::new(opts, log, Box::new(TestState::new()));
        (node, dir)
    }

    fn vote_request(term: Term, candidate: NodeAddr, last: (Index, Term)) -> RequestVote {
        RequestVote { term, candidate, last_log_index: last.0, last_log_term: last.1 }
    }

    #[test]
    fn grants_one_vote_per_term() -> crate::Result<()> {
        let (node, _dir) = test_node(Options { addr: addr(9701), ..Options::default() });
        let (a, b) = (addr(9702), addr(9703));

        // First come, first served.
        let reply = node.request_vote(&vote_request(1, a, (0, 0)))?;
        assert_eq!(reply, RequestVoteReply { term: 1, granted: true });
        let reply = node.request_vote(&vote_request(1, b, (0, 0)))?;
        assert_eq!(reply, RequestVoteReply { term: 1, granted: false });

        // Re-requests from the same candidate are granted again.
        let reply = node.request_vote(&vote_request(1, a, (0, 0)))?;
        assert_eq!(reply, RequestVoteReply { term: 1, granted: true });

        // A new term gets a fresh vote, and the vote is persisted.
        let reply = node.request_vote(&vote_request(2, b, (0, 0)))?;
        assert_eq!(reply, RequestVoteReply { term: 2, granted: true });
        assert_eq!(
            node.shared.log.metadata(),
            Metadata { current_term: 2, voted_for: Some(b), last_applied: 0 }
        );
        Ok(())
    }

    #[test]
    fn rejects_stale_candidate_logs() -> crate::Result<()> {
        let (node, _dir) = test_node(Options { addr: addr(9701), ..Options::default() });
        let candidate = addr(9702);

        // Replicate entries 1-3 in term 1.
        let leader = addr(9704);
        let reply = node.append_entries(&AppendEntries {
            term: 1,
            leader,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, ""), entry(2, 1, "a"), entry(3, 1, "b")],
            leader_commit: 0,
        })?;
        assert!(reply.success);

        // A shorter log loses, a same-length log ties, a higher last term
        // wins regardless of length.
        let reply = node.request_vote(&vote_request(2, candidate, (2, 1)))?;
        assert!(!reply.granted);
        let reply = node.request_vote(&vote_request(3, candidate, (3, 1)))?;
        assert!(reply.granted);
        let reply = node.request_vote(&vote_request(4, candidate, (1, 2)))?;
        assert!(reply.granted);
        Ok(())
    }

    #[test]
    fn vote_gated_until_caught_up() -> crate::Result<()> {
        // Scenario: a freshly joined node must reach term 2 and commit
        // index 2 before it may vote.
        let (node, _dir) = test_node(Options {
            addr: addr(9701),
            vote_target_term: 2,
            vote_target_index: 2,
            ..Options::default()
        });
        let candidate = addr(9702);
        let leader = addr(9703);

        // Not caught up: refused, even though the term was adopted.
        let reply = node.request_vote(&vote_request(1, candidate, (9, 9)))?;
        assert_eq!(reply, RequestVoteReply { term: 1, granted: false });

        // Catch up: two committed entries in term 2.
        let reply = node.append_entries(&AppendEntries {
            term: 2,
            leader,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 2, ""), entry(2, 2, "a")],
            leader_commit: 2,
        })?;
        assert!(reply.success);

        // Both thresholds reached: the next eligible request is granted.
        let reply = node.request_vote(&vote_request(3, candidate, (9, 9)))?;
        assert_eq!(reply, RequestVoteReply { term: 3, granted: true });
        Ok(())
    }

    #[test]
    fn append_entries_rejects_stale_terms() -> crate::Result<()> {
        let (node, _dir) = test_node(Options { addr: addr(9701), ..Options::default() });
        node.request_vote(&vote_request(5, addr(9702), (0, 0)))?;

        let reply = node.append_entries(&AppendEntries {
            term: 3,
            leader: addr(9703),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 3, "a")],
            leader_commit: 0,
        })?;
        assert_eq!(reply, AppendEntriesReply { term: 5, success: false });
        assert_eq!(node.shared.log.last_index(), 0);
        Ok(())
    }

    #[test]
    fn append_entries_requires_log_match() -> crate::Result<()> {
        let (node, _dir) = test_node(Options { addr: addr(9701), ..Options::default() });
        let leader = addr(9702);

        // prev 2@1 doesn't exist in an empty log.
        let reply = node.append_entries(&AppendEntries {
            term: 1,
            leader,
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![entry(3, 1, "c")],
            leader_commit: 0,
        })?;
        assert!(!reply.success);

        // The leader backs up to the start of its log and retries.
        let reply = node.append_entries(&AppendEntries {
            term: 1,
            leader,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, "a"), entry(2, 1, "b"), entry(3, 1, "c")],
            leader_commit: 1,
        })?;
        assert!(reply.success);
        assert_eq!(node.status().last_index, 3);
        assert_eq!(node.status().commit_index, 1);
        assert_eq!(node.leader(), Some(leader));
        Ok(())
    }

    #[test]
    fn append_entries_overwrites_divergent_suffix() -> crate::Result<()> {
        let (node, _dir) = test_node(Options { addr: addr(9701), ..Options::default() });

        // Term-1 history from the old leader, committed up to 1.
        let reply = node.append_entries(&AppendEntries {
            term: 1,
            leader: addr(9702),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, "a"), entry(2, 1, "b"), entry(3, 1, "c")],
            leader_commit: 1,
        })?;
        assert!(reply.success);

        // A new leader in term 2 replaces the uncommitted suffix.
        let reply = node.append_entries(&AppendEntries {
            term: 2,
            leader: addr(9703),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![entry(2, 2, "d")],
            leader_commit: 2,
        })?;
        assert_eq!(reply, AppendEntriesReply { term: 2, success: true });
        assert_eq!(node.shared.log.last_index(), 2);
        assert_eq!(node.shared.log.get(2)?, Some(entry(2, 2, "d")));
        assert_eq!(node.shared.log.get(3)?, None);
        assert_eq!(node.status().commit_index, 2);
        Ok(())
    }

    #[test]
    fn append_entries_is_idempotent() -> crate::Result<()> {
        let (node, _dir) = test_node(Options { addr: addr(9701), ..Options::default() });
        let req = AppendEntries {
            term: 1,
            leader: addr(9702),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, "a"), entry(2, 1, "b")],
            leader_commit: 0,
        };
        assert!(node.append_entries(&req)?.success);
        assert!(node.append_entries(&req)?.success);
        assert_eq!(node.shared.log.last_index(), 2);
        Ok(())
    }

    #[test]
    fn commit_restricted_to_current_term() -> crate::Result<()> {
        // A term-2 leader inherits an uncommitted term-1 entry at index 4;
        // it must not commit it until its own term-2 noop at index 5 is
        // quorum-replicated.
        let (p1, p2) = (addr(9702), addr(9703));
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path())?;
        log.append((1..=4).map(|i| entry(i, 1, &format!("c{i}"))).collect())?;
        log.sync()?.wait()?;
        let node = Node::new(
            Options { addr: addr(9701), peers: vec![p1, p2], ..Options::default() },
            log,
            Box::new(TestState::new()),
        );

        let shared = &node.shared;
        let mut core = shared.lock();
        core.term = 2;
        core.role = Role::Candidate;
        core.voted_for = Some(addr(9701));
        shared.become_leader(&mut core)?; // appends the noop at 5@2
        assert_eq!(shared.log.last_index(), 5);
        shared.append(&mut core, Some(b"x".to_vec()))?; // client entry at 6@2
        core.last_synced_index = 6;

        // Quorum at 4, but the entry there is from term 1: no commit.
        core.peers.get_mut(&p1).unwrap().match_index = 4;
        shared.advance_commit_index(&mut core)?;
        assert_eq!(core.commit_index, 0);

        // Quorum reaches the term-2 noop at 5: everything below commits.
        core.peers.get_mut(&p1).unwrap().match_index = 5;
        shared.advance_commit_index(&mut core)?;
        assert_eq!(core.commit_index, 5);

        // And the client entry commits once the second peer catches up.
        core.peers.get_mut(&p2).unwrap().match_index = 6;
        shared.advance_commit_index(&mut core)?;
        assert_eq!(core.commit_index, 6);
        Ok(())
    }

    #[test]
    fn propose_rejected_on_follower() {
        let (node, _dir) = test_node(Options { addr: addr(9701), ..Options::default() });
        assert_eq!(node.propose(b"a".to_vec()), Err(Error::NotLeader(None)));
    }

    #[test]
    fn higher_term_reply_steps_leader_down() -> crate::Result<()> {
        let (node, _dir) = test_node(Options {
            addr: addr(9701),
            peers: vec![addr(9702)],
            ..Options::default()
        });
        let shared = &node.shared;
        {
            let mut core = shared.lock();
            core.term = 1;
            core.role = Role::Candidate;
            core.voted_for = Some(addr(9701));
            shared.become_leader(&mut core)?;
            assert_eq!(core.role, Role::Leader);

            // A reply from a higher term (e.g. a rejoining partitioned
            // node) forces the leader out.
            shared.step_down(&mut core, 7)?;
            assert_eq!(core.role, Role::Follower);
            assert_eq!(core.term, 7);
            assert_eq!(core.voted_for, None);
            assert_eq!(core.leader, None);
            assert!(core.election_deadline.is_some());
        }
        assert_eq!(node.shared.log.metadata().current_term, 7);
        Ok(())
    }
}
