use async_std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::channel::oneshot;
use futures::future::join_all;
use futures::io::Cursor;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::select;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::raft::config::Config;
use crate::raft::error::{
    ApplyError, BootstrapError, MembershipError, RestoreError, SnapshotError, StartError,
    StorageError, TransportError,
};
use crate::raft::future::{ApplyFuture, ApplyResult};
use crate::raft::log::LogSlice;
use crate::raft::state_machine::{SnapshotArtifact, StateMachine};
use crate::raft::storage::{LogStore, SnapshotStore, StableStore};
use crate::raft::transport::{RpcHandler, Transport};
use crate::raft::types::{
    AppendRequest, AppendResponse, Configuration, Entry, EntryData, EntryId, HardState,
    InstallSnapshotRequest, InstallSnapshotResponse, LeaderInfo, RaftStats, Role, Server,
    ServerAddress, ServerId, SnapshotMeta, Suffrage, VoteRequest, VoteResponse,
};

// Handle to a running consensus participant. Cheap to clone, all clones refer
// to the same participant.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

struct Inner {
    // Dependencies and constants.
    id: ServerId,
    address: ServerAddress,
    config: Config,
    transport: Arc<dyn Transport>,
    log_store: Arc<dyn LogStore>,
    stable_store: Arc<dyn StableStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    span: Span,

    state: Mutex<RaftState>,

    // Feeds the task which owns the state machine.
    fsm_tx: UnboundedSender<FsmTask>,

    // Command payloads waiting to be appended, in the order they were submitted.
    submit_tx: UnboundedSender<Submission>,
    applied: Arc<AppliedStatus>,

    // Wakes the leader loop up to replicate before the next heartbeat is due.
    replicate: Notify,

    // Serializes snapshot creation.
    snapshotting: Mutex<()>,

    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// Holds the state a leader tracks about each of its followers.
#[derive(Debug, Clone, PartialEq)]
struct Progress {
    // Next log entry to send to the follower.
    next: u64,

    // Highest index known to be replicated on the follower.
    matched: u64,
}

type Responder = oneshot::Sender<ApplyResult>;

// A command payload together with the caller waiting for its outcome.
type Submission = (Bytes, Responder);

struct RaftState {
    role: Role,

    // Persistent raft state.
    term: u64,
    voted_for: Option<ServerId>,
    log: LogSlice,

    // Highest index known to be committed, and highest index handed to the
    // state machine task.
    commit_index: u64,
    dispatched: u64,

    // The latest configuration in the log, which takes effect as soon as it
    // is appended.
    configuration: Configuration,
    configuration_index: u64,

    // What the latest snapshot covers.
    last_snapshot: EntryId,
    snapshot_configuration: Configuration,
    snapshot_configuration_index: u64,

    leader: Option<LeaderInfo>,
    last_contact: Instant,

    // Only used by leaders.
    last_quorum_contact: Instant,
    followers: HashMap<ServerId, Progress>,
    pending: BTreeMap<u64, Responder>,
}

impl RaftState {
    // Recomputes the current configuration after the log changed.
    fn refresh_configuration(&mut self) {
        match self.log.latest_configuration() {
            Some((index, configuration)) => {
                self.configuration = configuration;
                self.configuration_index = index;
            }
            None => {
                self.configuration = self.snapshot_configuration.clone();
                self.configuration_index = self.snapshot_configuration_index;
            }
        }
    }

    // Returns the latest configuration as of the supplied index.
    fn configuration_at(&self, index: u64) -> (Configuration, u64) {
        match self.log.configuration_at(index) {
            Some((index, configuration)) => (configuration, index),
            None => (
                self.snapshot_configuration.clone(),
                self.snapshot_configuration_index,
            ),
        }
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
        }
    }

    // Answers all callers waiting on entries this node appended as leader.
    fn fail_pending(&mut self, make_error: impl Fn() -> ApplyError) {
        for (_, responder) in std::mem::take(&mut self.pending) {
            let _ = responder.send(Err(make_error()));
        }
    }
}

// Tracks what the state machine task has done so far.
struct AppliedStatus {
    index: AtomicU64,
    halted: AtomicBool,
}

enum FsmTask {
    Apply {
        entry: Entry,
        responder: Option<Responder>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<(Box<dyn SnapshotArtifact>, EntryId), SnapshotError>>,
    },
    Restore {
        meta: SnapshotMeta,
        data: Bytes,
        reply: oneshot::Sender<Result<(), RestoreError>>,
    },
}

// Owns the state machine and feeds it tasks one at a time, in the order the
// engine produced them. Never touches the engine state.
async fn run_state_machine(
    fsm: Arc<dyn StateMachine>,
    mut tasks: UnboundedReceiver<FsmTask>,
    status: Arc<AppliedStatus>,
    mut last: EntryId,
) {
    while let Some(task) = tasks.next().await {
        match task {
            FsmTask::Apply { entry, responder } => {
                if status.halted.load(Ordering::SeqCst) {
                    if let Some(responder) = responder {
                        let _ = responder.send(Err(ApplyError::Shutdown));
                    }
                    continue;
                }

                let result = match &entry.data {
                    EntryData::Command(_) => fsm.apply(&entry).await.map(|_| entry.index),
                    _ => Ok(entry.index),
                };
                let result = match result {
                    Ok(index) => {
                        last = entry.id();
                        status.index.store(index, Ordering::SeqCst);
                        Ok(index)
                    }
                    Err(e) => {
                        error!(entry = %entry.id(), "state machine failed, halting: {}", e);
                        status.halted.store(true, Ordering::SeqCst);
                        Err(ApplyError::StateMachine(e))
                    }
                };
                if let Some(responder) = responder {
                    let _ = responder.send(result);
                }
            }
            FsmTask::Snapshot { reply } => {
                let result = if status.halted.load(Ordering::SeqCst) {
                    Err(SnapshotError::Shutdown)
                } else {
                    fsm.snapshot().await.map(|artifact| (artifact, last))
                };
                let _ = reply.send(result);
            }
            FsmTask::Restore { meta, data, reply } => {
                let result = fsm.restore(Box::new(Cursor::new(data))).await;
                if result.is_ok() {
                    last = meta.last();
                    status.index.store(meta.index, Ordering::SeqCst);
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("state machine task finished");
}

impl Raft {
    // Starts a new participant. Restores the state machine from the latest
    // snapshot, loads the persisted log and starts serving calls from peers.
    // Log lines emitted by the participant carry the span current at the time
    // this is called.
    pub async fn start(
        config: Config,
        fsm: Arc<dyn StateMachine>,
        log_store: Arc<dyn LogStore>,
        stable_store: Arc<dyn StableStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Raft, StartError> {
        config.validate()?;

        // Restore the state machine before anything else can touch it.
        let snapshot = snapshot_store.latest().await?;
        let (last_snapshot, snapshot_configuration, snapshot_configuration_index) =
            match snapshot {
                Some((meta, data)) => {
                    fsm.restore(Box::new(Cursor::new(data))).await?;
                    info!(snapshot = %meta.last(), "restored snapshot");
                    (meta.last(), meta.configuration, meta.configuration_index)
                }
                None => (EntryId::default(), Configuration::default(), 0),
            };

        let log = load_log(log_store.as_ref(), last_snapshot).await?;
        let hard_state = stable_store.load().await?.unwrap_or_default();

        let now = Instant::now();
        let mut state = RaftState {
            role: Role::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: last_snapshot.index,
            dispatched: last_snapshot.index,
            configuration: Configuration::default(),
            configuration_index: 0,
            last_snapshot,
            snapshot_configuration,
            snapshot_configuration_index,
            leader: None,
            last_contact: now,
            last_quorum_contact: now,
            followers: HashMap::new(),
            pending: BTreeMap::new(),
        };
        state.refresh_configuration();

        let span = Span::current();
        let (fsm_tx, fsm_rx) = unbounded();
        let (submit_tx, submit_rx) = unbounded();
        let applied = Arc::new(AppliedStatus {
            index: AtomicU64::new(last_snapshot.index),
            halted: AtomicBool::new(false),
        });
        let (stop, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            id: config.local_id.clone(),
            address: transport.local_addr(),
            config,
            transport,
            log_store,
            stable_store,
            snapshot_store,
            span: span.clone(),
            state: Mutex::new(state),
            fsm_tx,
            submit_tx,
            applied: applied.clone(),
            replicate: Notify::new(),
            snapshotting: Mutex::new(()),
            stop,
            tasks: Mutex::new(Vec::new()),
        });

        let handler: Arc<dyn RpcHandler> = inner.clone();
        inner.transport.serve(handler).await?;

        let tasks = vec![
            tokio::spawn(
                run_state_machine(fsm, fsm_rx, applied, last_snapshot).instrument(span.clone()),
            ),
            tokio::spawn(inner.clone().run().instrument(span.clone())),
            tokio::spawn(inner.clone().run_submissions(submit_rx).instrument(span.clone())),
            tokio::spawn(inner.clone().run_snapshots().instrument(span.clone())),
        ];
        inner.tasks.lock().await.extend(tasks);

        info!(id = %inner.id, address = %inner.address, "started");
        Ok(Raft { inner })
    }

    pub async fn state(&self) -> Role {
        if self.inner.applied.halted.load(Ordering::SeqCst) {
            return Role::Shutdown;
        }
        self.inner.state.lock().await.role
    }

    // Returns the current leader, if known. Never blocks on other participants.
    pub async fn leader_with_id(&self) -> Option<LeaderInfo> {
        self.inner.state.lock().await.leader.clone()
    }

    // Makes this participant the first member of a new cluster with the
    // supplied configuration. Only works on participants without any state.
    pub async fn bootstrap_cluster(
        &self,
        configuration: Configuration,
    ) -> Result<(), BootstrapError> {
        configuration
            .validate()
            .map_err(BootstrapError::InvalidConfiguration)?;

        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.role == Role::Shutdown {
            return Err(BootstrapError::Shutdown);
        }
        if state.term > 0 || state.log.last_id().index > 0 || state.last_snapshot.index > 0 {
            return Err(BootstrapError::AlreadyBootstrapped);
        }

        let entry = Entry {
            index: 1,
            term: 1,
            data: EntryData::Configuration(configuration),
        };
        inner.log_store.store(std::slice::from_ref(&entry)).await?;
        state.term = 1;
        state.voted_for = None;
        inner.stable_store.save(&state.hard_state()).await?;
        state
            .log
            .append_all(std::slice::from_ref(&entry))
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        state.refresh_configuration();

        info!(configuration = ?state.configuration, "bootstrapped cluster");
        Ok(())
    }

    // Adds a voting member. Only works on the leader. If prev_index is not 0,
    // the change is rejected unless the latest configuration is at that index.
    pub async fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<u64, MembershipError> {
        self.inner
            .change_configuration(Server::voter(id, address), prev_index, timeout)
            .instrument(self.inner.span.clone())
            .await
    }

    // Adds a member which receives entries but does not vote.
    pub async fn add_nonvoter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<u64, MembershipError> {
        self.inner
            .change_configuration(Server::nonvoter(id, address), prev_index, timeout)
            .instrument(self.inner.span.clone())
            .await
    }

    // Submits a command payload for replication. Payloads are appended in the
    // order of the calls to this method, the returned future resolves once the
    // entry has been applied locally.
    pub fn apply(&self, payload: Bytes, timeout: Duration) -> ApplyFuture {
        let (sender, receiver) = oneshot::channel();
        if let Err(e) = self.inner.submit_tx.unbounded_send((payload, sender)) {
            let (_, sender) = e.into_inner();
            let _ = sender.send(Err(ApplyError::Shutdown));
        }
        ApplyFuture::new(receiver, timeout)
    }

    // Returns the latest configuration and the index of its log entry.
    pub async fn configuration(&self) -> (Configuration, u64) {
        let state = self.inner.state.lock().await;
        (state.configuration.clone(), state.configuration_index)
    }

    // Takes a snapshot right away rather than waiting for the threshold.
    pub async fn snapshot(&self) -> Result<SnapshotMeta, SnapshotError> {
        self.inner
            .take_snapshot()
            .instrument(self.inner.span.clone())
            .await
    }

    pub async fn stats(&self) -> RaftStats {
        let state = self.inner.state.lock().await;
        let halted = self.inner.applied.halted.load(Ordering::SeqCst);
        RaftStats {
            role: if halted { Role::Shutdown } else { state.role },
            term: state.term,
            last_log_index: state.log.last_id().index,
            commit_index: state.commit_index,
            applied_index: self.inner.applied.index.load(Ordering::SeqCst),
            last_snapshot_index: state.last_snapshot.index,
            configuration_index: state.configuration_index,
            leader: state.leader.clone(),
        }
    }

    // Stops all background work and waits for it to finish. Pending callers
    // are answered with a shutdown error.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.stop_serving().await;
        inner.fsm_tx.close_channel();
        inner.submit_tx.close_channel();
        let tasks = std::mem::take(&mut *inner.tasks.lock().await);
        join_all(tasks).await;
        info!(parent: &inner.span, "shut down");
    }
}

// Reads the persisted entries following the supplied snapshot.
async fn load_log(log_store: &dyn LogStore, last_snapshot: EntryId) -> Result<LogSlice, StartError> {
    let first = log_store.first_index().await?.max(last_snapshot.index + 1);
    let last = log_store.last_index().await?;
    let mut entries = Vec::new();
    for index in first..=last {
        match log_store.get(index).await? {
            Some(entry) => entries.push(entry),
            None => {
                return Err(StorageError::Corrupt(format!("missing log entry {}", index)).into());
            }
        }
    }
    Ok(LogSlice::new(last_snapshot, entries)?)
}

impl Inner {
    fn leader_info(&self) -> LeaderInfo {
        LeaderInfo {
            address: self.address.clone(),
            id: self.id.clone(),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow() || self.applied.halted.load(Ordering::SeqCst)
    }

    // Bounds a call to another participant by the rpc timeout.
    async fn call<T>(
        &self,
        target: &str,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.config.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(target.to_string())),
        }
    }

    async fn persist_hard_state(&self, state: &RaftState) -> Result<(), StorageError> {
        self.stable_store.save(&state.hard_state()).await
    }

    async fn stop_serving(&self) {
        {
            let mut state = self.state.lock().await;
            state.role = Role::Shutdown;
            state.leader = None;
            state.fail_pending(|| ApplyError::Shutdown);
        }
        self.stop.send_replace(true);
        self.transport.close().await;
    }

    // Main loop, runs the loop for whichever role we currently hold.
    async fn run(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            if self.applied.halted.load(Ordering::SeqCst) {
                error!("state machine halted, no longer participating");
                self.stop_serving().await;
                break;
            }

            let role = self.state.lock().await.role;
            match role {
                Role::Follower => self.run_follower(&mut stop).await,
                Role::Candidate => self.run_candidate(&mut stop).await,
                Role::Leader => self.run_leader(&mut stop).await,
                Role::Shutdown => break,
            }
        }
        debug!("main loop finished");
    }

    // Waits for the leader to go quiet, then becomes a candidate.
    async fn run_follower(&self, stop: &mut watch::Receiver<bool>) {
        loop {
            let timeout = self.config.randomized_election_timeout();
            select! {
                _ = sleep(timeout) => {}
                _ = stop.changed() => return,
            }
            if self.is_stopped() {
                return;
            }

            let mut state = self.state.lock().await;
            if state.role != Role::Follower {
                return;
            }
            if state.last_contact.elapsed() < timeout {
                continue;
            }
            if state.leader.take().is_some() {
                info!(term = state.term, "lost contact with leader");
            }

            // Only voters of a known configuration ever campaign. This keeps
            // nodes which have not joined a cluster yet quiet.
            if state.configuration.is_voter(&self.id) {
                info!(term = state.term, "election timeout, becoming candidate");
                state.role = Role::Candidate;
                return;
            }
        }
    }

    // Keeps running elections until one is won or a leader shows up.
    async fn run_candidate(&self, stop: &mut watch::Receiver<bool>) {
        loop {
            self.run_election().await;
            if self.is_stopped() || self.state.lock().await.role != Role::Candidate {
                return;
            }
            select! {
                _ = sleep(self.config.randomized_election_timeout()) => {}
                _ = stop.changed() => return,
            }
            if self.state.lock().await.role != Role::Candidate {
                return;
            }
        }
    }

    async fn run_election(&self) {
        let (term, request, peers, quorum) = {
            let mut state = self.state.lock().await;
            if state.role != Role::Candidate {
                return;
            }

            state.term += 1;
            state.voted_for = Some(self.id.clone());
            state.last_contact = Instant::now();
            if let Err(e) = self.persist_hard_state(&state).await {
                error!("failed to persist vote: {}", e);
                return;
            }

            let term = state.term;
            info!(term, "starting election");

            let quorum = state.configuration.quorum();
            if quorum <= 1 {
                self.become_leader(&mut state).await;
                return;
            }

            let request = VoteRequest {
                term,
                candidate: self.id.clone(),
                last_log: state.log.last_id(),
            };
            let peers: Vec<Server> = state
                .configuration
                .voters()
                .filter(|s| s.id != self.id)
                .cloned()
                .collect();
            (term, request, peers, quorum)
        };

        let results = join_all(peers.iter().map(|peer| {
            self.call(
                &peer.address,
                self.transport.request_vote(&peer.address, request.clone()),
            )
        }))
        .await;

        let mut state = self.state.lock().await;

        // The world has moved on or someone else has won in this term.
        if state.term != term || state.role != Role::Candidate {
            return;
        }

        let mut votes = 1; // Here we count our own vote for ourselves.
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(response) => {
                    if response.term > term {
                        info!(peer = %peer.id, term = response.term, "detected higher term");
                        self.become_follower(&mut state, response.term).await;
                        return;
                    }
                    if response.granted {
                        votes += 1;
                    }
                }
                Err(e) => debug!(peer = %peer.id, "vote request failed: {}", e),
            }
        }

        if votes >= quorum {
            info!(term, votes, "won election");
            self.become_leader(&mut state).await;
        } else {
            info!(term, votes, "lost election");
        }
    }

    async fn become_leader(&self, state: &mut RaftState) {
        info!(term = state.term, "becoming leader");
        state.role = Role::Leader;
        state.leader = Some(self.leader_info());
        state.last_quorum_contact = Instant::now();

        let next = state.log.next_index();
        state.followers = state
            .configuration
            .servers
            .iter()
            .filter(|s| s.id != self.id)
            .map(|s| (s.id.clone(), Progress { next, matched: 0 }))
            .collect();

        // Entries from earlier terms only commit once an entry from our own
        // term does.
        if let Err(e) = self.append_local(state, EntryData::Noop).await {
            error!("failed to append no-op entry: {}", e);
        }
        self.replicate.notify_one();
    }

    // Reverts to follower, adopting the supplied term if it is newer.
    async fn become_follower(&self, state: &mut RaftState, term: u64) {
        if state.role == Role::Shutdown {
            return;
        }
        if term > state.term {
            state.term = term;
            state.voted_for = None;
            if let Err(e) = self.persist_hard_state(state).await {
                error!(term, "failed to persist term: {}", e);
            }
        }
        if state.role == Role::Leader {
            info!(term, "stepping down");
            state.fail_pending(|| ApplyError::LeadershipLost);
            state.followers.clear();
            state.leader = None;
        }
        if state.role != Role::Follower {
            state.role = Role::Follower;
            state.last_contact = Instant::now();
        }
    }

    // Replicates to followers on every heartbeat, or sooner when there are
    // new entries. Steps down once a quorum has gone quiet for too long.
    async fn run_leader(&self, stop: &mut watch::Receiver<bool>) {
        loop {
            self.replicate_round().await;
            if self.is_stopped() {
                return;
            }

            {
                let mut state = self.state.lock().await;
                if state.role != Role::Leader {
                    return;
                }
                if state.last_quorum_contact.elapsed() > self.config.election_timeout {
                    warn!(term = state.term, "lost contact with a quorum");
                    let term = state.term;
                    self.become_follower(&mut state, term).await;
                    return;
                }
            }

            select! {
                _ = sleep(self.config.heartbeat_interval) => {}
                _ = self.replicate.notified() => {}
                _ = stop.changed() => return,
            }
        }
    }

    // Makes a single request to every follower, heartbeating them and sending
    // any entries they don't have.
    async fn replicate_round(&self) {
        let (term, work) = {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            let term = state.term;
            let next = state.log.next_index();
            let peers: Vec<Server> = state
                .configuration
                .servers
                .iter()
                .filter(|s| s.id != self.id)
                .cloned()
                .collect();

            let mut work = Vec::new();
            for peer in peers {
                let progress = state
                    .followers
                    .entry(peer.id.clone())
                    .or_insert(Progress { next, matched: 0 })
                    .clone();
                let previous = progress.next - 1;
                let replication = match state.log.term_at(previous) {
                    Some(previous_term) => {
                        Replication::Append(AppendRequest {
                            term,
                            leader: self.leader_info(),
                            previous: EntryId {
                                index: previous,
                                term: previous_term,
                            },
                            entries: state
                                .log
                                .entries_from(progress.next, self.config.max_append_entries),
                            leader_commit: state.commit_index,
                        })
                    }

                    // The entry before the ones to send has been compacted away.
                    None => Replication::Snapshot,
                };
                work.push((peer, replication));
            }
            (term, work)
        };

        let results = join_all(
            work.into_iter()
                .map(|(peer, replication)| self.replicate_to(peer, term, replication)),
        )
        .await;

        let mut state = self.state.lock().await;
        if state.term != term || state.role != Role::Leader {
            return;
        }

        let mut contacted = 1;
        let mut more = false;
        let last_index = state.log.last_id().index;
        for (peer, result) in results {
            let reply = match result {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(peer = %peer.id, "replication failed: {}", e);
                    continue;
                }
            };
            if reply.term() > term {
                info!(peer = %peer.id, term = reply.term(), "detected higher term");
                self.become_follower(&mut state, reply.term()).await;
                return;
            }
            if peer.suffrage == Suffrage::Voter {
                contacted += 1;
            }

            let Some(progress) = state.followers.get_mut(&peer.id) else {
                continue;
            };
            let before = progress.clone();
            match reply {
                Reply::Appended {
                    previous,
                    count,
                    response,
                } => {
                    if response.success {
                        progress.matched = progress.matched.max(previous + count);
                        progress.next = progress.matched + 1;
                    } else {
                        // The follower could not find our "previous" entry. Skip
                        // back to its last entry, or at least one step.
                        progress.next = (progress.next - 1)
                            .min(response.last_log_index + 1)
                            .max(1);
                    }
                }
                Reply::Installed { index, response } => {
                    if response.success {
                        progress.matched = progress.matched.max(index);
                        progress.next = progress.matched + 1;
                    }
                }
                Reply::NoSnapshot => (),
            }
            if *progress != before {
                debug!(peer = %peer.id, next = progress.next, matched = progress.matched, "follower progress");
                more |= progress.next <= last_index;
            }
        }

        if contacted >= state.configuration.quorum() {
            state.last_quorum_contact = Instant::now();
        }
        self.advance_commit(&mut state);
        if more {
            self.replicate.notify_one();
        }
    }

    async fn replicate_to(
        &self,
        peer: Server,
        term: u64,
        replication: Replication,
    ) -> (Server, Result<Reply, TransportError>) {
        let result = match replication {
            Replication::Append(request) => {
                let previous = request.previous.index;
                let count = request.entries.len() as u64;
                self.call(
                    &peer.address,
                    self.transport.append_entries(&peer.address, request),
                )
                .await
                .map(|response| Reply::Appended {
                    previous,
                    count,
                    response,
                })
            }
            Replication::Snapshot => match self.snapshot_store.latest().await {
                Ok(Some((meta, data))) => {
                    info!(peer = %peer.id, snapshot = %meta.last(), "sending snapshot");
                    let index = meta.index;
                    let request = InstallSnapshotRequest {
                        term,
                        leader: self.leader_info(),
                        meta,
                        data,
                    };
                    self.call(
                        &peer.address,
                        self.transport.install_snapshot(&peer.address, request),
                    )
                    .await
                    .map(|response| Reply::Installed { index, response })
                }
                Ok(None) => {
                    warn!(peer = %peer.id, "follower needs a snapshot but none exists");
                    Ok(Reply::NoSnapshot)
                }
                Err(e) => {
                    warn!(peer = %peer.id, "failed to load snapshot: {}", e);
                    Ok(Reply::NoSnapshot)
                }
            },
        };
        (peer, result)
    }

    // Commits the highest index stored on a quorum of voters, provided the
    // entry there is from our own term.
    fn advance_commit(&self, state: &mut RaftState) {
        let last_index = state.log.last_id().index;
        let mut matched: Vec<u64> = state
            .configuration
            .voters()
            .map(|s| {
                if s.id == self.id {
                    last_index
                } else {
                    state.followers.get(&s.id).map(|p| p.matched).unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[state.configuration.quorum() - 1];
        if candidate > state.commit_index && state.log.term_at(candidate) == Some(state.term) {
            debug!(from = state.commit_index, to = candidate, "advanced commit index");
            state.commit_index = candidate;
            self.dispatch_committed(state);
        }
    }

    // Hands all newly committed entries to the state machine task.
    fn dispatch_committed(&self, state: &mut RaftState) {
        while state.dispatched < state.commit_index {
            let index = state.dispatched + 1;
            let responder = state.pending.remove(&index);
            match state.log.entry_at(index) {
                Some(entry) => {
                    let task = FsmTask::Apply {
                        entry: entry.clone(),
                        responder,
                    };
                    if self.fsm_tx.unbounded_send(task).is_err() {
                        debug!(index, "state machine task is gone");
                    }
                }

                // Already covered by an installed snapshot.
                None => {
                    if let Some(responder) = responder {
                        let _ = responder.send(Ok(index));
                    }
                }
            }
            state.dispatched = index;
        }
    }

    // Appends an entry in the current term to the local log.
    async fn append_local(
        &self,
        state: &mut RaftState,
        data: EntryData,
    ) -> Result<Entry, StorageError> {
        let entry = Entry {
            index: state.log.next_index(),
            term: state.term,
            data,
        };
        self.log_store.store(std::slice::from_ref(&entry)).await?;
        state
            .log
            .append_all(std::slice::from_ref(&entry))
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        if let EntryData::Configuration(_) = entry.data {
            state.refresh_configuration();
        }
        Ok(entry)
    }

    // Appends submitted payloads one at a time until the participant shuts
    // down. Anything still queued at that point is answered by append_command.
    async fn run_submissions(self: Arc<Self>, mut submissions: UnboundedReceiver<Submission>) {
        while let Some((payload, responder)) = submissions.next().await {
            self.append_command(payload, responder).await;
        }
        debug!("submission task finished");
    }

    async fn append_command(&self, payload: Bytes, responder: Responder) {
        let mut state = self.state.lock().await;
        let rejection = match state.role {
            Role::Shutdown => Some(ApplyError::Shutdown),
            Role::Leader => None,
            _ => Some(ApplyError::NotLeader {
                leader: state.leader.clone(),
            }),
        };
        if let Some(error) = rejection {
            let _ = responder.send(Err(error));
            return;
        }

        match self.append_local(&mut state, EntryData::Command(payload)).await {
            Ok(entry) => {
                debug!(entry = %entry.id(), "appended command");
                state.pending.insert(entry.index, responder);
                self.replicate.notify_one();
            }
            Err(e) => {
                error!("failed to append command: {}", e);
                let _ = responder.send(Err(ApplyError::Storage(e)));
            }
        }
    }

    async fn change_configuration(
        &self,
        server: Server,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<u64, MembershipError> {
        let receiver = {
            let mut state = self.state.lock().await;
            match state.role {
                Role::Shutdown => return Err(MembershipError::Shutdown),
                Role::Leader => (),
                _ => {
                    return Err(MembershipError::NotLeader {
                        leader: state.leader.clone(),
                    });
                }
            }
            if prev_index != 0 && prev_index != state.configuration_index {
                return Err(MembershipError::ConfigurationChanged {
                    expected: prev_index,
                    actual: state.configuration_index,
                });
            }
            if state.configuration_index > state.commit_index {
                return Err(MembershipError::ConfigurationPending);
            }
            if state.configuration.get(&server.id) == Some(&server) {
                debug!(server = %server.id, "already a member");
                return Ok(state.configuration_index);
            }

            let updated = state.configuration.with_server(server.clone());
            updated
                .validate()
                .map_err(MembershipError::InvalidConfiguration)?;

            let entry = self
                .append_local(&mut state, EntryData::Configuration(updated))
                .await?;
            info!(server = %server.id, address = %server.address, index = entry.index, "appended configuration change");

            let next = entry.index;
            state
                .followers
                .entry(server.id.clone())
                .or_insert(Progress { next, matched: 0 });

            let (sender, receiver) = oneshot::channel();
            state.pending.insert(entry.index, sender);
            self.replicate.notify_one();
            receiver
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(MembershipError::Shutdown),
            Err(_) => Err(MembershipError::Timeout(timeout)),
        }
    }

    // Periodically snapshots the state machine once enough entries have been
    // applied since the last snapshot.
    async fn run_snapshots(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        loop {
            select! {
                _ = sleep(self.config.snapshot_interval) => {}
                _ = stop.changed() => break,
            }
            if self.is_stopped() {
                break;
            }

            let last_snapshot = self.state.lock().await.last_snapshot.index;
            let applied = self.applied.index.load(Ordering::SeqCst);
            if applied < last_snapshot + self.config.snapshot_threshold {
                continue;
            }
            match self.take_snapshot().await {
                Ok(meta) => info!(snapshot = %meta.last(), bytes = meta.size, "took snapshot"),
                Err(SnapshotError::NothingNew) => (),
                Err(e) => warn!("failed to take snapshot: {}", e),
            }
        }
        debug!("snapshot loop finished");
    }

    async fn take_snapshot(&self) -> Result<SnapshotMeta, SnapshotError> {
        let _guard = self.snapshotting.lock().await;

        let (sender, receiver) = oneshot::channel();
        self.fsm_tx
            .unbounded_send(FsmTask::Snapshot { reply: sender })
            .map_err(|_| SnapshotError::Shutdown)?;
        let (mut artifact, last) = receiver.await.map_err(|_| SnapshotError::Shutdown)??;

        let (configuration, configuration_index) = {
            let state = self.state.lock().await;
            if last.index == 0 || last.index <= state.last_snapshot.index {
                artifact.release();
                return Err(SnapshotError::NothingNew);
            }
            state.configuration_at(last.index)
        };

        // Persisting can be slow, the state machine keeps applying meanwhile.
        let mut sink: Vec<u8> = Vec::new();
        let persisted = artifact.persist(&mut sink).await;
        artifact.release();
        persisted?;

        let meta = SnapshotMeta {
            id: snapshot_id(&last),
            index: last.index,
            term: last.term,
            configuration,
            configuration_index,
            size: sink.len() as u64,
        };
        self.snapshot_store.create(&meta, Bytes::from(sink)).await?;

        let mut state = self.state.lock().await;
        if meta.index > state.last_snapshot.index {
            state.last_snapshot = meta.last();
            state.snapshot_configuration = meta.configuration.clone();
            state.snapshot_configuration_index = meta.configuration_index;
        }
        self.compact(&mut state, meta.index.saturating_sub(self.config.trailing_logs))
            .await?;
        Ok(meta)
    }

    // Drops log entries up to the supplied index, which must be covered by a
    // snapshot.
    async fn compact(&self, state: &mut RaftState, index: u64) -> Result<(), StorageError> {
        let first = state.log.previous_id().index + 1;
        if state.log.is_empty() || index < first || state.log.entry_at(index).is_none() {
            return Ok(());
        }
        state.log.compact_to(index);
        self.log_store.delete_range(first, index).await?;
        debug!(through = index, remaining = state.log.len(), bytes = state.log.size_bytes(), "compacted log");
        Ok(())
    }

    async fn handle_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock().await;
        let reject = |term| VoteResponse {
            term,
            granted: false,
        };

        // Reject anything from an outdated term.
        if state.role == Role::Shutdown || request.term < state.term {
            return reject(state.term);
        }

        // Ignore candidates while a live leader is around, so that a server
        // which was cut off cannot disrupt a healthy cluster.
        let leader_alive = state.role == Role::Leader
            || (state.leader.is_some()
                && state.last_contact.elapsed() < self.config.election_timeout);
        if leader_alive {
            debug!(candidate = %request.candidate, "rejecting vote, leader is alive");
            return reject(state.term);
        }

        if request.term > state.term {
            self.become_follower(&mut state, request.term).await;
        }

        if let Some(voted_for) = &state.voted_for {
            if voted_for != &request.candidate {
                debug!(candidate = %request.candidate, voted_for = %voted_for, "rejecting vote, already voted");
                return reject(state.term);
            }
        }
        if !state.log.is_up_to_date(&request.last_log) {
            debug!(candidate = %request.candidate, "rejecting vote, log is behind");
            return reject(state.term);
        }

        state.voted_for = Some(request.candidate.clone());
        if let Err(e) = self.persist_hard_state(&state).await {
            error!("failed to persist vote: {}", e);
            return reject(state.term);
        }
        state.last_contact = Instant::now();
        info!(candidate = %request.candidate, term = state.term, "granted vote");
        VoteResponse {
            term: state.term,
            granted: true,
        }
    }

    async fn handle_append(&self, request: AppendRequest) -> AppendResponse {
        let mut state = self.state.lock().await;
        let reject = |term, last_log_index| AppendResponse {
            term,
            success: false,
            last_log_index,
        };

        // Handle the case where we are ahead of the leader. We inform the
        // leader of our (greater) term and fail the append.
        if state.role == Role::Shutdown || request.term < state.term {
            return reject(state.term, state.log.last_id().index);
        }
        if request.term > state.term || state.role != Role::Follower {
            self.become_follower(&mut state, request.term).await;
        }
        state.leader = Some(request.leader.clone());
        state.last_contact = Instant::now();

        // Make sure we have the previous entry. Anything before our
        // compaction point is committed, and therefore matches.
        let previous = request.previous;
        let last_index = state.log.last_id().index;
        if previous.index > last_index {
            return reject(state.term, last_index);
        }
        if !state.log.is_index_compacted(previous.index)
            && state.log.term_at(previous.index) != Some(previous.term)
        {
            debug!(previous = %previous, "rejecting append, previous entry mismatch");
            return reject(state.term, previous.index.saturating_sub(1));
        }

        if let Err(e) = self.store_entries(&mut state, &request.entries).await {
            error!("failed to store entries: {}", e);
            return reject(state.term, state.log.last_id().index);
        }

        // The leader only vouches for the entries it sent us.
        let last_new = previous.index + request.entries.len() as u64;
        let commit = request.leader_commit.min(last_new);
        if commit > state.commit_index {
            state.commit_index = commit;
            self.dispatch_committed(&mut state);
        }

        AppendResponse {
            term: state.term,
            success: true,
            last_log_index: state.log.last_id().index,
        }
    }

    // Adds entries received from a leader to the log and the log store.
    async fn store_entries(
        &self,
        state: &mut RaftState,
        entries: &[Entry],
    ) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let outcome = state
            .log
            .append_all(entries)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        if let Some(from) = outcome.truncated_from {
            info!(from, "truncated conflicting entries");
            self.log_store.delete_range(from, u64::MAX).await?;
        }
        if !outcome.appended.is_empty() {
            self.log_store.store(&outcome.appended).await?;
        }
        if outcome.truncated_from.is_some() || !outcome.appended.is_empty() {
            state.refresh_configuration();
        }
        Ok(())
    }

    async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let mut state = self.state.lock().await;
        if state.role == Role::Shutdown || request.term < state.term {
            return InstallSnapshotResponse {
                term: state.term,
                success: false,
            };
        }
        if request.term > state.term || state.role != Role::Follower {
            self.become_follower(&mut state, request.term).await;
        }
        state.leader = Some(request.leader.clone());
        state.last_contact = Instant::now();

        let meta = request.meta;
        let success = |term| InstallSnapshotResponse {
            term,
            success: true,
        };
        let failure = |term| InstallSnapshotResponse {
            term,
            success: false,
        };

        // Everything covered by the snapshot has already been handed to our
        // state machine, there is nothing to restore.
        if meta.index <= state.dispatched {
            return success(state.term);
        }

        info!(snapshot = %meta.last(), "installing snapshot");
        let (sender, receiver) = oneshot::channel();
        let task = FsmTask::Restore {
            meta: meta.clone(),
            data: request.data.clone(),
            reply: sender,
        };
        if self.fsm_tx.unbounded_send(task).is_err() {
            return failure(state.term);
        }
        match receiver.await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                error!(snapshot = %meta.last(), "failed to restore snapshot: {}", e);
                return failure(state.term);
            }
            Err(_) => return failure(state.term),
        }

        if let Err(e) = self.snapshot_store.create(&meta, request.data).await {
            warn!(snapshot = %meta.last(), "failed to store installed snapshot: {}", e);
        }

        // Keep any entries following the snapshot if our log agrees with it.
        let first = state.log.previous_id().index + 1;
        let kept = state.log.prune_until(meta.last());
        let deleted = if kept {
            self.log_store.delete_range(first, meta.index).await
        } else {
            self.log_store.delete_range(0, u64::MAX).await
        };
        if let Err(e) = deleted {
            warn!("failed to drop entries covered by snapshot: {}", e);
        }

        state.last_snapshot = meta.last();
        state.snapshot_configuration = meta.configuration.clone();
        state.snapshot_configuration_index = meta.configuration_index;
        state.commit_index = state.commit_index.max(meta.index);
        state.dispatched = state.dispatched.max(meta.index);
        state.refresh_configuration();
        success(state.term)
    }
}

#[async_trait]
impl RpcHandler for Inner {
    async fn request_vote(&self, request: VoteRequest) -> VoteResponse {
        self.handle_vote(request).instrument(self.span.clone()).await
    }

    async fn append_entries(&self, request: AppendRequest) -> AppendResponse {
        self.handle_append(request)
            .instrument(self.span.clone())
            .await
    }

    async fn install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        self.handle_install_snapshot(request)
            .instrument(self.span.clone())
            .await
    }
}

enum Replication {
    Append(AppendRequest),
    Snapshot,
}

enum Reply {
    Appended {
        previous: u64,
        count: u64,
        response: AppendResponse,
    },
    Installed {
        index: u64,
        response: InstallSnapshotResponse,
    },
    NoSnapshot,
}

impl Reply {
    fn term(&self) -> u64 {
        match self {
            Reply::Appended { response, .. } => response.term,
            Reply::Installed { response, .. } => response.term,
            Reply::NoSnapshot => 0,
        }
    }
}

fn snapshot_id(last: &EntryId) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}-{}-{}", last.term, last.index, millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::storage::{MemoryLogStore, MemorySnapshotStore, MemoryStableStore};
    use crate::raft::testing::{FakeStateMachine, POISON, wait_for};
    use crate::raft::transport::{MemoryTransport, Network};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(id: &str) -> Config {
        Config::new(id)
            .with_heartbeat_interval(Duration::from_millis(10))
            .with_election_timeout(Duration::from_millis(50))
            .with_rpc_timeout(Duration::from_millis(100))
            .with_snapshot_interval(Duration::from_millis(20))
    }

    fn address(id: &str) -> String {
        format!("mem://{}", id)
    }

    struct Node {
        raft: Raft,
        fsm: Arc<FakeStateMachine>,
    }

    async fn start_node(id: &str, config: Config, network: &Arc<Network>) -> Node {
        let fsm = FakeStateMachine::new();
        let raft = Raft::start(
            config,
            fsm.clone(),
            Arc::new(MemoryLogStore::new()),
            Arc::new(MemoryStableStore::new()),
            Arc::new(MemorySnapshotStore::new(2)),
            Arc::new(MemoryTransport::new(&address(id), network.clone())),
        )
        .await
        .expect("start");
        Node { raft, fsm }
    }

    async fn bootstrapped_leader(id: &str, config: Config, network: &Arc<Network>) -> Node {
        let node = start_node(id, config, network).await;
        node.raft
            .bootstrap_cluster(Configuration::new(vec![Server::voter(id, &address(id))]))
            .await
            .expect("bootstrap");
        let raft = node.raft.clone();
        wait_for(WAIT, "leadership", || {
            let raft = raft.clone();
            async move {
                let stats = raft.stats().await;
                stats.role == Role::Leader && stats.commit_index == stats.last_log_index
            }
        })
        .await;
        node
    }

    // Returns a cluster of three voters, with "a" as the leader.
    async fn three_nodes(config: impl Fn(&str) -> Config) -> (Arc<Network>, Vec<Node>) {
        let network = Network::new();
        let a = bootstrapped_leader("a", config("a"), &network).await;
        let b = start_node("b", config("b"), &network).await;
        let c = start_node("c", config("c"), &network).await;
        for id in ["b", "c"] {
            a.raft
                .add_voter(id, &address(id), 0, WAIT)
                .await
                .expect("add voter");
        }
        (network, vec![a, b, c])
    }

    #[tokio::test]
    async fn test_single_node_applies() {
        let network = Network::new();
        let node = bootstrapped_leader("a", test_config("a"), &network).await;

        let first = node
            .raft
            .apply(Bytes::from("one"), WAIT)
            .await
            .expect("apply");
        let second = node
            .raft
            .apply(Bytes::from("two"), WAIT)
            .await
            .expect("apply");
        assert!(second > first);
        assert_eq!(
            vec![Bytes::from("one"), Bytes::from("two")],
            node.fsm.applied().await
        );

        let leader = node.raft.leader_with_id().await.expect("leader");
        assert_eq!("a", leader.id);
        assert_eq!("mem://a", leader.address);
        node.raft.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipelined_applies_keep_call_order() {
        let network = Network::new();
        let node = bootstrapped_leader("a", test_config("a"), &network).await;

        let payloads: Vec<Bytes> = (0..50).map(|i| Bytes::from(format!("cmd-{}", i))).collect();
        let futures: Vec<ApplyFuture> = payloads
            .iter()
            .map(|p| node.raft.apply(p.clone(), WAIT))
            .collect();
        let indexes: Vec<u64> = join_all(futures)
            .await
            .into_iter()
            .map(|r| r.expect("apply"))
            .collect();

        assert!(indexes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(payloads, node.fsm.applied().await);
        node.raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_without_leadership() {
        let network = Network::new();
        let node = start_node("a", test_config("a"), &network).await;
        let result = node.raft.apply(Bytes::from("one"), WAIT).await;
        assert!(matches!(result, Err(ApplyError::NotLeader { leader: None })));
        assert_eq!(Role::Follower, node.raft.state().await);
        node.raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_rules() {
        let network = Network::new();
        let node = start_node("a", test_config("a"), &network).await;

        let empty = node.raft.bootstrap_cluster(Configuration::default()).await;
        assert!(matches!(empty, Err(BootstrapError::InvalidConfiguration(_))));

        let configuration = Configuration::new(vec![Server::voter("a", "mem://a")]);
        node.raft
            .bootstrap_cluster(configuration.clone())
            .await
            .expect("bootstrap");
        let again = node.raft.bootstrap_cluster(configuration.clone()).await;
        assert!(matches!(again, Err(BootstrapError::AlreadyBootstrapped)));

        assert_eq!((configuration, 1), node.raft.configuration().await);
        node.raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_replicates_to_voters() {
        let (_network, nodes) = three_nodes(test_config).await;
        let leader = &nodes[0];
        for i in 0..10 {
            leader
                .raft
                .apply(Bytes::from(format!("entry-{}", i)), WAIT)
                .await
                .expect("apply");
        }

        let expected = leader.fsm.applied().await;
        assert_eq!(10, expected.len());
        for node in &nodes {
            let fsm = node.fsm.clone();
            let expected = expected.clone();
            wait_for(WAIT, "replication", || {
                let fsm = fsm.clone();
                let expected = expected.clone();
                async move { fsm.applied().await == expected }
            })
            .await;
        }

        let (configuration, _) = nodes[2].raft.configuration().await;
        assert_eq!(3, configuration.voters().count());
        for node in &nodes {
            node.raft.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_membership_changes_need_leader() {
        let (_network, nodes) = three_nodes(test_config).await;
        let follower = &nodes[1];
        let (before, before_index) = follower.raft.configuration().await;

        let result = follower
            .raft
            .add_voter("d", "mem://d", 0, WAIT)
            .await;
        match result {
            Err(MembershipError::NotLeader { leader }) => {
                assert_eq!("a", leader.expect("leader hint").id)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!((before, before_index), follower.raft.configuration().await);
        for node in &nodes {
            node.raft.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_add_voter_checks_previous_index() {
        let network = Network::new();
        let node = bootstrapped_leader("a", test_config("a"), &network).await;
        let (_, index) = node.raft.configuration().await;

        let stale = node
            .raft
            .add_nonvoter("b", "mem://b", index + 7, WAIT)
            .await;
        assert!(matches!(
            stale,
            Err(MembershipError::ConfigurationChanged { .. })
        ));

        // Adding an existing member with the same settings changes nothing.
        let unchanged = node
            .raft
            .add_voter("a", "mem://a", index, WAIT)
            .await
            .expect("no-op");
        assert_eq!(index, unchanged);
        node.raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshot_on_demand() {
        let network = Network::new();
        let node = bootstrapped_leader("a", test_config("a"), &network).await;
        for i in 0..5 {
            node.raft
                .apply(Bytes::from(format!("entry-{}", i)), WAIT)
                .await
                .expect("apply");
        }

        let meta = node.raft.snapshot().await.expect("snapshot");
        assert!(meta.index >= 6);
        assert!(meta.configuration.is_voter("a"));
        assert!(matches!(
            node.raft.snapshot().await,
            Err(SnapshotError::NothingNew)
        ));
        assert_eq!(meta.index, node.raft.stats().await.last_snapshot_index);
        node.raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_lagging_follower_gets_snapshot() {
        let config = |id: &str| {
            test_config(id)
                .with_snapshot_threshold(4)
                .with_trailing_logs(1)
        };
        let (network, nodes) = three_nodes(config).await;
        network.disconnect("mem://c").await;

        let leader = nodes[0].raft.clone();
        for i in 0..20 {
            leader
                .apply(Bytes::from(format!("entry-{}", i)), WAIT)
                .await
                .expect("apply");
        }
        let raft = leader.clone();
        wait_for(WAIT, "compaction", || {
            let raft = raft.clone();
            async move { raft.stats().await.last_snapshot_index > 10 }
        })
        .await;

        network.reconnect("mem://c").await;
        let fsm = nodes[2].fsm.clone();
        wait_for(Duration::from_secs(10), "catch up", || {
            let fsm = fsm.clone();
            async move { fsm.applied().await.len() == 20 }
        })
        .await;
        assert!(nodes[2].fsm.restores().await > 0);
        for node in &nodes {
            node.raft.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_state_machine_failure_halts() {
        let network = Network::new();
        let node = bootstrapped_leader("a", test_config("a"), &network).await;

        let result = node.raft.apply(Bytes::from_static(POISON), WAIT).await;
        assert!(matches!(result, Err(ApplyError::StateMachine(_))));
        assert_eq!(Role::Shutdown, node.raft.state().await);

        let after = node.raft.apply(Bytes::from("more"), WAIT).await;
        assert!(after.is_err());
        node.raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown() {
        let network = Network::new();
        let node = bootstrapped_leader("a", test_config("a"), &network).await;
        node.raft.shutdown().await;

        assert_eq!(Role::Shutdown, node.raft.state().await);
        let result = node.raft.apply(Bytes::from("late"), WAIT).await;
        assert!(matches!(result, Err(ApplyError::Shutdown)));
    }
}
