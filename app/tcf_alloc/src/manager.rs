/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The allocation manager.
//!
//! A single task owns the [`AllocationMap`] and every [`RunLedger`]; callers
//! talk to it through an [`AllocationManagerHandle`]. Network I/O is fanned
//! out per server as futures the task polls next to its commands, and the
//! results are folded back by that task, so the book-keeping needs no
//! locks and a server that does not answer holds up nobody but itself.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dupe::Dupe;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use http::Method;
use serde_json::Value;
use tcf_targets::ServerId;
use tcf_targets::TargetGroup;
use tcf_util::cleanup_ctx::AsyncCleanupContext;
use tcf_util::retry::RetryError;
use tcf_util::retry::retrying;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

use crate::config::AllocatorConfig;
use crate::dispatch::BoundRun;
use crate::dispatch::BoundTarget;
use crate::dispatch::ExecutionDispatcher;
use crate::error::AllocationError;
use crate::events::AllocationEvent;
use crate::map::Activation;
use crate::map::AllocKey;
use crate::map::AllocationEntry;
use crate::map::AllocationMap;
use crate::map::AllocationSummary;
use crate::map::RunLedger;
use crate::map::RunOutcome;
use crate::protocol::CREATE_PATH;
use crate::protocol::CreateRequest;
use crate::protocol::CreateResponse;
use crate::protocol::Endtime;
use crate::protocol::KEEPALIVE_PATH;
use crate::protocol::KeepaliveChange;
use crate::protocol::KeepaliveRequest;
use crate::protocol::KeepaliveResponse;
use crate::protocol::remove_path;
use crate::state::AllocId;
use crate::state::AllocationState;
use crate::state::RunId;
use crate::transport::Transport;
use crate::transport::TransportError;

/// Candidate target groups for one run and how many of them to use.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run: RunId,
    /// Group name to group. Groups without targets need no allocation and
    /// are launched straight away.
    pub groups: BTreeMap<String, TargetGroup>,
    /// Groups to launch on; zero launches on every group that activates.
    /// Asking for more candidates than this over-allocates: the surplus is
    /// released as soon as enough groups launched.
    pub needed: u64,
    pub reason: Option<String>,
    pub obo_user: Option<String>,
    pub extra_data: Option<serde_json::Map<String, Value>>,
    pub endtime: Option<Endtime>,
    /// Give up on allocations still queued after this long.
    pub queue_timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(run: RunId, groups: BTreeMap<String, TargetGroup>, needed: u64) -> Self {
        Self {
            run,
            groups,
            needed,
            reason: None,
            obo_user: None,
            extra_data: None,
            endtime: None,
            queue_timeout: None,
        }
    }
}

enum AllocatorCommand {
    Submit(RunRequest, oneshot::Sender<RunOutcome>),
    Cancel(RunId),
    Allocations(oneshot::Sender<Vec<AllocationSummary>>),
    Shutdown(oneshot::Sender<()>),
}

enum Op {
    Command(AllocatorCommand),
    /// Every handle is gone.
    Closed,
    Keepalive,
    Created {
        run: RunId,
        server: ServerId,
        groups: Vec<String>,
        result: Result<Created, AllocationError>,
    },
    KeepaliveDone {
        round: u64,
        server: ServerId,
        body: KeepaliveRequest,
        result: Result<Value, AllocationError>,
    },
    Executed {
        run: RunId,
        group: String,
        result: anyhow::Result<()>,
    },
    Released(AllocationEvent),
}

#[derive(Clone, Dupe)]
pub struct AllocationManagerHandle {
    sender: Arc<mpsc::UnboundedSender<AllocatorCommand>>,
}

impl AllocationManagerHandle {
    fn send(&self, command: AllocatorCommand) -> Result<(), AllocationError> {
        self.sender
            .send(command)
            .map_err(|_| AllocationError::ShutDown)
    }

    /// Starts allocating for `request`; the receiver gets the outcome once
    /// the run is over.
    pub fn submit(
        &self,
        request: RunRequest,
    ) -> Result<oneshot::Receiver<RunOutcome>, AllocationError> {
        let (tx, rx) = oneshot::channel();
        self.send(AllocatorCommand::Submit(request, tx))?;
        Ok(rx)
    }

    /// Allocates, executes and releases, returning when the run is over.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, AllocationError> {
        self.submit(request)?
            .await
            .map_err(|_| AllocationError::ShutDown)
    }

    /// Releases whatever `run` holds that is not executing.
    pub fn cancel(&self, run: &RunId) -> Result<(), AllocationError> {
        self.send(AllocatorCommand::Cancel(run.dupe()))
    }

    pub async fn allocations(&self) -> Result<Vec<AllocationSummary>, AllocationError> {
        let (tx, rx) = oneshot::channel();
        self.send(AllocatorCommand::Allocations(tx))?;
        rx.await.map_err(|_| AllocationError::ShutDown)
    }

    /// Releases every allocation, within the teardown timeout, and stops
    /// the manager.
    pub async fn shutdown(&self) -> Result<(), AllocationError> {
        let (tx, rx) = oneshot::channel();
        self.send(AllocatorCommand::Shutdown(tx))?;
        rx.await.map_err(|_| AllocationError::ShutDown)
    }
}

pub struct AllocationManager {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    config: AllocatorConfig,
    map: AllocationMap,
    runs: HashMap<RunId, RunLedger>,
    events: mpsc::UnboundedSender<AllocationEvent>,
    /// Creation and keepalive requests in flight.
    requests: FuturesUnordered<BoxFuture<'static, Op>>,
    /// Bounds creation requests in flight.
    creates: Arc<Semaphore>,
    /// Servers with a keepalive in flight; they are skipped by new rounds.
    keepalive_busy: HashSet<ServerId>,
    rounds: BTreeMap<u64, KeepaliveRound>,
    next_round: u64,
    executions: FuturesUnordered<BoxFuture<'static, Op>>,
    removals: FuturesUnordered<BoxFuture<'static, AllocationEvent>>,
}

/// Keepalives sent on one tick. Failures are held back until every server
/// in the round answered, since the run only aborts if none could be
/// reached.
#[derive(Default)]
struct KeepaliveRound {
    waiting: usize,
    reached: bool,
    failed: Vec<(ServerId, KeepaliveRequest, AllocationError)>,
}

impl AllocationManager {
    /// Spawns the coordinating task on the current runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn ExecutionDispatcher>,
        config: AllocatorConfig,
    ) -> (
        AllocationManagerHandle,
        mpsc::UnboundedReceiver<AllocationEvent>,
    ) {
        let (sender, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let creates = Arc::new(Semaphore::new(config.max_concurrent_servers.max(1)));
        let manager = AllocationManager {
            transport,
            dispatcher,
            config,
            map: AllocationMap::default(),
            runs: HashMap::new(),
            events,
            requests: FuturesUnordered::new(),
            creates,
            keepalive_busy: HashSet::new(),
            rounds: BTreeMap::new(),
            next_round: 0,
            executions: FuturesUnordered::new(),
            removals: FuturesUnordered::new(),
        };
        tokio::spawn(manager.run(commands));
        (
            AllocationManagerHandle {
                sender: Arc::new(sender),
            },
            events_rx,
        )
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<AllocatorCommand>) {
        let period = self.config.keepalive_period();
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = loop {
            let op = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Op::Command(command),
                    None => Op::Closed,
                },
                _ = keepalive.tick() => Op::Keepalive,
                Some(op) = self.requests.next() => op,
                Some(op) = self.executions.next() => op,
                Some(event) = self.removals.next() => Op::Released(event),
            };
            match op {
                Op::Command(AllocatorCommand::Submit(request, outcome)) => {
                    self.create(request, outcome)
                }
                Op::Command(AllocatorCommand::Cancel(run)) => self.cancel(&run),
                Op::Command(AllocatorCommand::Allocations(reply)) => {
                    let _ = reply.send(self.map.summaries());
                }
                Op::Command(AllocatorCommand::Shutdown(reply)) => break Some(reply),
                Op::Closed => break None,
                Op::Keepalive => self.keepalive(),
                Op::Created {
                    run,
                    server,
                    groups,
                    result,
                } => self.created(run, server, groups, result),
                Op::KeepaliveDone {
                    round,
                    server,
                    body,
                    result,
                } => self.keepalive_done(round, server, body, result),
                Op::Executed { run, group, result } => self.executed(run, group, result),
                Op::Released(event) => self.emit(event),
            }
        };

        self.teardown().await;
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
    }

    fn emit(&self, event: AllocationEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn create(&mut self, request: RunRequest, outcome: oneshot::Sender<RunOutcome>) {
        let RunRequest {
            run,
            groups,
            needed,
            reason,
            obo_user,
            extra_data,
            endtime,
            queue_timeout,
        } = request;
        if self.runs.contains_key(&run) {
            tracing::error!(%run, "Run submitted twice");
            let _ = outcome.send(RunOutcome {
                launched: 0,
                failures: Vec::new(),
                blocked: Some(Arc::new(AllocationError::DuplicateRun(run))),
            });
            return;
        }

        let mut by_server: BTreeMap<ServerId, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for (name, group) in &groups {
            for (server, target_ids) in group.by_server() {
                by_server
                    .entry(server)
                    .or_default()
                    .insert(name.clone(), target_ids);
            }
        }
        let unallocated: Vec<String> = groups
            .iter()
            .filter(|(_, group)| group.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        let deadline = queue_timeout.map(|t| Instant::now() + t);
        let mut ledger = RunLedger::new(needed, groups, deadline, outcome);
        let mut satisfied = false;
        let mut launches = Vec::new();
        for name in unallocated {
            if let Some(enough) = ledger.launch_unallocated(&name) {
                launches.push(name);
                satisfied = enough;
            }
        }
        if satisfied {
            by_server.clear();
        }
        ledger.expect_creates(by_server.len());
        self.runs.insert(run.dupe(), ledger);
        for name in launches {
            self.launch(&run, name, Vec::new());
        }

        tracing::info!(%run, servers = by_server.len(), needed, "Requesting allocations");
        for (server, groups) in by_server {
            let mut request = CreateRequest::new(groups);
            request.priority = self.config.priority;
            request.preempt = self.config.preempt;
            request.reason = reason.clone().or_else(|| Some(run.to_string()));
            request.obo_user = obo_user.clone();
            request.extra_data = extra_data.clone();
            request.endtime = endtime;

            let transport = self.transport.dupe();
            let creates = self.creates.dupe();
            let timeout = self.config.request_timeout();
            let run = run.dupe();
            self.requests.push(
                async move {
                    let groups = request.groups.keys().cloned().collect();
                    let result = match creates.acquire_owned().await {
                        Ok(_permit) => create_on(&*transport, &server, &request, timeout).await,
                        Err(_) => Err(AllocationError::ShutDown),
                    };
                    Op::Created {
                        run,
                        server,
                        groups,
                        result,
                    }
                }
                .boxed(),
            );
        }
        self.check_finished(&run);
    }

    fn created(
        &mut self,
        run: RunId,
        server: ServerId,
        groups: Vec<String>,
        result: Result<Created, AllocationError>,
    ) {
        match result {
            Ok(Created {
                allocid,
                state,
                group_allocated_name,
            }) => {
                tracing::info!(%run, %server, %allocid, %state, "Allocation created");
                self.map.insert(
                    server.dupe(),
                    allocid.dupe(),
                    AllocationEntry {
                        run: run.dupe(),
                        groups: groups.clone(),
                        state: AllocationState::Queued,
                    },
                );
                self.emit(AllocationEvent::Created {
                    run: run.dupe(),
                    server: server.dupe(),
                    allocid: allocid.dupe(),
                    state,
                    groups: groups.clone(),
                });
                let Some(ledger) = self.runs.get_mut(&run) else {
                    self.release((server, allocid));
                    return;
                };
                ledger.created((server.dupe(), allocid.dupe()), groups);
                if state == AllocationState::Active {
                    match group_allocated_name {
                        Some(group) => self.activated(server, allocid, group),
                        None => self.protocol_failure(
                            &server,
                            allocid,
                            "active allocation without `group_allocated_name`".to_owned(),
                        ),
                    }
                }
            }
            Err(e) => {
                tracing::error!(%run, %server, "Allocation failed: {:?}", e);
                if let Some(ledger) = self.runs.get_mut(&run) {
                    ledger.failures.push(Arc::new(e));
                }
            }
        }
        if self
            .runs
            .get_mut(&run)
            .is_some_and(|ledger| ledger.create_answered())
        {
            self.creates_done(&run);
        }
    }

    /// Every creation request of `run` was answered.
    fn creates_done(&mut self, run: &RunId) {
        let Some(ledger) = self.runs.get_mut(run) else {
            return;
        };
        // Everything is tracked before any activation is looked at, so a
        // group is not launched before all its servers are known.
        for ((server, allocid), group) in ledger.finish_creating() {
            let Some(requested) = self.map.get(&server, &allocid).map(|e| e.groups.clone()) else {
                continue;
            };
            self.bind(run, (server, allocid), group, &requested);
        }
        self.prune(run);
        self.check_finished(run);
    }

    fn keepalive(&mut self) {
        self.check_queue_timeouts();
        let requests: Vec<(ServerId, KeepaliveRequest)> = self
            .map
            .keepalive_requests()
            .into_iter()
            .filter(|(server, _)| {
                let busy = self.keepalive_busy.contains(server);
                if busy {
                    tracing::debug!(%server, "Previous keepalive still going");
                }
                !busy
            })
            .collect();
        if requests.is_empty() {
            tracing::trace!("Keepalive: nothing to send");
            return;
        }
        let round = self.next_round;
        self.next_round += 1;
        self.rounds.insert(
            round,
            KeepaliveRound {
                waiting: requests.len(),
                ..Default::default()
            },
        );
        let policy = self.config.retry_policy();
        for (server, body) in requests {
            self.keepalive_busy.insert(server.dupe());
            let transport = self.transport.dupe();
            self.requests.push(
                async move {
                    let result = keepalive_on(&*transport, &server, &body, policy).await;
                    Op::KeepaliveDone {
                        round,
                        server,
                        body,
                        result,
                    }
                }
                .boxed(),
            );
        }
    }

    fn keepalive_done(
        &mut self,
        round: u64,
        server: ServerId,
        body: KeepaliveRequest,
        result: Result<Value, AllocationError>,
    ) {
        self.keepalive_busy.remove(&server);
        let Some(tally) = self.rounds.get_mut(&round) else {
            return;
        };
        tally.waiting = tally.waiting.saturating_sub(1);
        match result {
            Ok(value) => {
                tally.reached = true;
                match serde_json::from_value::<KeepaliveResponse>(value) {
                    Ok(changes) => {
                        for (allocid, change) in changes {
                            self.apply_change(&server, AllocId::new(&allocid), change);
                        }
                    }
                    Err(e) => self.keepalive_failed(
                        server.dupe(),
                        body,
                        AllocationError::Protocol {
                            server,
                            message: format!("malformed keepalive response: {}", e),
                        },
                    ),
                }
            }
            Err(e) => tally.failed.push((server, body, e)),
        }

        if self.rounds.get(&round).is_some_and(|t| t.waiting > 0) {
            return;
        }
        let Some(tally) = self.rounds.remove(&round) else {
            return;
        };
        if !tally.reached {
            tracing::error!(servers = tally.failed.len(), "Keepalive failed on every server");
            self.all_unreachable();
            return;
        }
        for (server, body, e) in tally.failed {
            self.keepalive_failed(server, body, e);
        }
    }

    fn keepalive_failed(&mut self, server: ServerId, body: KeepaliveRequest, e: AllocationError) {
        tracing::error!(%server, "Keepalive failed: {}", e);
        let e = Arc::new(e);
        for allocid in body.into_keys() {
            self.fail_shared(server.dupe(), allocid, e.dupe());
        }
    }

    fn apply_change(&mut self, server: &ServerId, allocid: AllocId, change: KeepaliveChange) {
        let Some(current) = self.map.get(server, &allocid).map(|e| e.state) else {
            tracing::debug!(%server, %allocid, "Change for an allocation no longer tracked");
            return;
        };
        let state = match change.state.as_deref().map(str::parse::<AllocationState>) {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                return self.protocol_failure(server, allocid, e.to_string());
            }
            None => {
                return self.protocol_failure(server, allocid, "change without a state".to_owned());
            }
        };
        if let Err(e) = current.transition(state) {
            return self.protocol_failure(server, allocid, e.to_string());
        }
        match state {
            AllocationState::Active if current == AllocationState::Active => {}
            AllocationState::Active => match change.group_allocated_name {
                Some(group) => self.activated(server.dupe(), allocid, group),
                None => self.protocol_failure(
                    server,
                    allocid,
                    "active allocation without `group_allocated_name`".to_owned(),
                ),
            },
            AllocationState::Queued => {}
            state => {
                tracing::warn!(%server, %allocid, %state, "Allocation terminated by the server");
                self.fail(
                    server.dupe(),
                    allocid.dupe(),
                    AllocationError::Terminated {
                        server: server.dupe(),
                        allocid,
                        state,
                    },
                );
            }
        }
    }

    fn protocol_failure(&mut self, server: &ServerId, allocid: AllocId, message: String) {
        tracing::error!(%server, %allocid, "Protocol error: {}", message);
        self.fail(
            server.dupe(),
            allocid,
            AllocationError::Protocol {
                server: server.dupe(),
                message,
            },
        );
    }

    fn activated(&mut self, server: ServerId, allocid: AllocId, group: String) {
        let Some(entry) = self.map.get_mut(&server, &allocid) else {
            return;
        };
        entry.state = AllocationState::Active;
        let run = entry.run.dupe();
        let requested = entry.groups.clone();
        tracing::info!(%run, %server, %allocid, %group, "Allocation active");
        self.emit(AllocationEvent::Activated {
            run: run.dupe(),
            server: server.dupe(),
            allocid: allocid.dupe(),
            group: group.clone(),
        });

        let key = (server, allocid);
        let Some(ledger) = self.runs.get_mut(&run) else {
            self.release(key);
            return;
        };
        if ledger.is_creating() {
            tracing::debug!(%run, %group, "Run still creating allocations, activation deferred");
            ledger.defer_activation(key, group);
            return;
        }
        self.bind(&run, key, group, &requested);
        self.prune(&run);
        self.check_finished(&run);
    }

    /// Binds the active allocation `key`, requested for `requested`, to
    /// `group` and launches the group once all its allocations are active.
    fn bind(&mut self, run: &RunId, key: AllocKey, group: String, requested: &[String]) {
        let Some(ledger) = self.runs.get_mut(run) else {
            self.release(key);
            return;
        };
        let activation = ledger.activate(&key, &group, requested);
        match activation {
            Activation::Unknown => {
                tracing::warn!(%run, %group, "Activated for a group that is not a candidate");
                self.release(key);
            }
            Activation::Waiting => {
                tracing::debug!(%run, %group, "Group still waiting on other servers");
            }
            Activation::Surplus(allocations) => {
                tracing::info!(%run, %group, "Already launched enough groups, releasing");
                for key in allocations {
                    self.release(key);
                }
            }
            Activation::Launch {
                allocations,
                enough,
            } => {
                self.launch(run, group, allocations);
                if enough {
                    self.release_idle(run);
                }
            }
        }
    }

    fn launch(&mut self, run: &RunId, group_name: String, allocations: Vec<AllocKey>) {
        let Some(group) = self.runs.get(run).and_then(|l| l.group(&group_name)).cloned() else {
            return;
        };
        let targets = group
            .iter()
            .filter_map(|(role, fullid)| {
                let server = fullid.server();
                let allocid = allocations
                    .iter()
                    .find(|(s, _)| *s == server)
                    .map(|(_, a)| a.dupe())?;
                Some((
                    role.to_owned(),
                    BoundTarget {
                        fullid: fullid.dupe(),
                        allocid,
                    },
                ))
            })
            .collect();
        tracing::info!(%run, group = %group_name, targets = %group, "Launching");
        self.emit(AllocationEvent::Launched {
            run: run.dupe(),
            group: group_name.clone(),
        });
        let execution = self.dispatcher.launch(BoundRun {
            run: run.dupe(),
            group_name: group_name.clone(),
            group,
            targets,
        });
        let run = run.dupe();
        self.executions.push(
            async move {
                let result = execution.await;
                Op::Executed {
                    run,
                    group: group_name,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn executed(&mut self, run: RunId, group: String, result: anyhow::Result<()>) {
        let Some(ledger) = self.runs.get_mut(&run) else {
            return;
        };
        if let Err(source) = result {
            tracing::warn!(%run, %group, "Execution failed: {:#}", source);
            ledger.failures.push(Arc::new(AllocationError::Execution {
                run: run.dupe(),
                group: group.clone(),
                source,
            }));
        }
        for key in ledger.finish_group(&group) {
            self.release(key);
        }
        self.check_finished(&run);
    }

    /// Forgets the allocation and asks its server to remove it. Removal
    /// errors are logged and dropped; the server reclaims the allocation
    /// once keepalives stop.
    fn release(&mut self, (server, allocid): AllocKey) {
        let Some(entry) = self.map.remove(&server, &allocid) else {
            return;
        };
        let run = entry.run;
        tracing::debug!(%run, %server, %allocid, state = %entry.state, "Releasing allocation");
        let removal = remove_on(
            self.transport.dupe(),
            server.dupe(),
            allocid.dupe(),
            self.config.retry_policy(),
        );
        self.removals.push(
            async move {
                removal.await;
                AllocationEvent::Released {
                    run,
                    server,
                    allocid,
                }
            }
            .boxed(),
        );
    }

    /// Releases the run's allocations that back no launched group.
    fn release_idle(&mut self, run: &RunId) {
        let Some(ledger) = self.runs.get(run) else {
            return;
        };
        let idle: Vec<AllocKey> = self
            .map
            .of_run(run)
            .into_iter()
            .filter(|key| !ledger.is_running(key))
            .collect();
        for key in idle {
            self.release(key);
        }
    }

    /// Releases queued allocations that no candidate group needs anymore.
    fn prune(&mut self, run: &RunId) {
        let Some(ledger) = self.runs.get(run) else {
            return;
        };
        if ledger.is_creating() {
            return;
        }
        let useless: Vec<AllocKey> = self
            .map
            .iter()
            .filter(|(_, _, entry)| {
                &entry.run == run
                    && entry.state == AllocationState::Queued
                    && !entry.groups.iter().any(|g| ledger.is_candidate(g))
            })
            .map(|(server, allocid, _)| (server.dupe(), allocid.dupe()))
            .collect();
        for key in useless {
            self.release(key);
        }
    }

    fn fail(&mut self, server: ServerId, allocid: AllocId, error: AllocationError) {
        self.fail_shared(server, allocid, Arc::new(error))
    }

    fn fail_shared(&mut self, server: ServerId, allocid: AllocId, error: Arc<AllocationError>) {
        let Some(run) = self.map.get(&server, &allocid).map(|e| e.run.dupe()) else {
            return;
        };
        let key = (server, allocid);
        if let Some(ledger) = self.runs.get_mut(&run) {
            ledger.lose(&key);
            if !ledger
                .failures
                .iter()
                .any(|e| Arc::ptr_eq(e, &error))
            {
                ledger.failures.push(error);
            }
        }
        self.release(key);
        self.prune(&run);
        self.check_finished(&run);
    }

    fn check_queue_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<RunId> = self
            .runs
            .iter()
            .filter(|(_, ledger)| ledger.deadline.is_some_and(|d| d <= now))
            .map(|(run, _)| run.dupe())
            .collect();
        for run in expired {
            let Some(ledger) = self.runs.get_mut(&run) else {
                continue;
            };
            ledger.deadline = None;
            ledger.abandon();
            let waited_secs = ledger.started.elapsed().as_secs_f64();
            tracing::warn!(%run, waited_secs, "Queue timeout");
            if ledger.launched() == 0 {
                ledger.blocked = Some(Arc::new(AllocationError::QueueTimeout {
                    run: run.dupe(),
                    waited_secs,
                }));
            }
            self.release_idle(&run);
            self.check_finished(&run);
        }
    }

    fn all_unreachable(&mut self) {
        let error = Arc::new(AllocationError::AllServersUnreachable);
        let runs: Vec<RunId> = self.runs.keys().map(|r| r.dupe()).collect();
        for run in runs {
            if let Some(ledger) = self.runs.get_mut(&run) {
                ledger.abandon();
                ledger.blocked = Some(error.dupe());
            }
            self.release_idle(&run);
            self.check_finished(&run);
        }
    }

    fn cancel(&mut self, run: &RunId) {
        let Some(ledger) = self.runs.get_mut(run) else {
            return;
        };
        tracing::info!(%run, "Cancelling run");
        ledger.abandon();
        self.release_idle(run);
        self.check_finished(run);
    }

    /// Reports the run once it holds nothing, runs nothing and waits on no
    /// creation request.
    fn check_finished(&mut self, run: &RunId) {
        let Some(ledger) = self.runs.get(run) else {
            return;
        };
        if ledger.is_creating() || ledger.running() > 0 || !self.map.of_run(run).is_empty() {
            return;
        }
        let Some(mut ledger) = self.runs.remove(run) else {
            return;
        };
        let launched = ledger.launched();
        if launched == 0 && ledger.blocked.is_none() {
            ledger.blocked = Some(Arc::new(AllocationError::Exhausted { run: run.dupe() }));
        }
        if let Some(error) = &ledger.blocked {
            tracing::warn!(%run, "Run blocked: {}", error);
            self.emit(AllocationEvent::Blocked {
                run: run.dupe(),
                error: error.dupe(),
            });
        }
        tracing::info!(%run, launched, "Run finished");
        self.emit(AllocationEvent::RunFinished {
            run: run.dupe(),
            launched,
        });
        if let Some(outcome) = ledger.complete() {
            let _ = outcome.send(RunOutcome {
                launched,
                failures: std::mem::take(&mut ledger.failures),
                blocked: ledger.blocked.take(),
            });
        }
    }

    async fn teardown(&mut self) {
        let cleanup = AsyncCleanupContext::new(self.config.teardown_timeout());
        let mut per_server: BTreeMap<ServerId, Vec<(RunId, AllocId)>> = BTreeMap::new();
        for (server, allocid, entry) in self.map.iter() {
            per_server
                .entry(server.dupe())
                .or_default()
                .push((entry.run.dupe(), allocid.dupe()));
        }
        self.map = AllocationMap::default();
        tracing::info!(servers = per_server.len(), "Releasing allocations at shutdown");
        for (server, allocations) in per_server {
            let transport = self.transport.dupe();
            let events = self.events.clone();
            let policy = self.config.retry_policy();
            cleanup.register(
                format!("release allocations on {}", server),
                async move {
                    for (run, allocid) in allocations {
                        remove_on(transport.dupe(), server.dupe(), allocid.dupe(), policy).await;
                        let _ = events.send(AllocationEvent::Released {
                            run,
                            server: server.dupe(),
                            allocid,
                        });
                    }
                }
                .boxed(),
            );
        }
        let removals = std::mem::take(&mut self.removals);
        let events = self.events.clone();
        cleanup.register(
            "pending removals".to_owned(),
            removals
                .for_each(move |event| {
                    let _ = events.send(event);
                    futures::future::ready(())
                })
                .boxed(),
        );
        // Executions still going are abandoned along with their runs, and so
        // are unanswered requests.
        self.executions = FuturesUnordered::new();
        self.requests = FuturesUnordered::new();
        self.keepalive_busy.clear();
        self.rounds.clear();
        self.runs.clear();
        cleanup.cleanup().await;
    }
}

struct Created {
    allocid: AllocId,
    state: AllocationState,
    group_allocated_name: Option<String>,
}

/// Creation is not retried; a server that cannot take the request now is
/// not asked again for this run.
async fn create_on(
    transport: &dyn Transport,
    server: &ServerId,
    request: &CreateRequest,
    timeout: Duration,
) -> Result<Created, AllocationError> {
    let protocol = |message: String| AllocationError::Protocol {
        server: server.dupe(),
        message,
    };
    let body = serde_json::to_value(request).map_err(|e| protocol(e.to_string()))?;
    let response = match tokio::time::timeout(
        timeout,
        transport.send(server, Method::PUT, CREATE_PATH, Some(body)),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(source)) => {
            return Err(AllocationError::Create {
                server: server.dupe(),
                source,
            });
        }
        Err(_) => {
            return Err(AllocationError::Create {
                server: server.dupe(),
                source: TransportError::Timeout(server.dupe()),
            });
        }
    };
    let response: CreateResponse =
        serde_json::from_value(response).map_err(|e| protocol(e.to_string()))?;
    let state = match response.state.as_deref() {
        Some("queued") => AllocationState::Queued,
        Some("active") => AllocationState::Active,
        other => {
            return Err(AllocationError::Refused {
                server: server.dupe(),
                state: other.unwrap_or("none").to_owned(),
                message: response
                    .message
                    .unwrap_or_else(|| "message n/a".to_owned()),
            });
        }
    };
    let allocid = response
        .allocid
        .ok_or_else(|| protocol("allocation response without `allocid`".to_owned()))?;
    Ok(Created {
        allocid: AllocId::new(&allocid),
        state,
        group_allocated_name: response.group_allocated_name,
    })
}

async fn keepalive_on(
    transport: &dyn Transport,
    server: &ServerId,
    body: &KeepaliveRequest,
    policy: tcf_util::retry::RetryPolicy,
) -> Result<Value, AllocationError> {
    let body = serde_json::to_value(body).map_err(|e| AllocationError::Protocol {
        server: server.dupe(),
        message: e.to_string(),
    })?;
    tracing::debug!(%server, allocations = ?body, "Keepalive");
    retrying(policy, TransportError::is_retryable, || {
        transport.send(server, Method::PUT, KEEPALIVE_PATH, Some(body.clone()))
    })
    .await
    .map_err(|source| AllocationError::Keepalive {
        server: server.dupe(),
        source,
    })
}

/// Removing an allocation the server no longer knows is not an error.
async fn remove_on(
    transport: Arc<dyn Transport>,
    server: ServerId,
    allocid: AllocId,
    policy: tcf_util::retry::RetryPolicy,
) {
    let path = remove_path(&allocid);
    let result = retrying(policy, TransportError::is_retryable, || {
        transport.send(&server, Method::DELETE, &path, None)
    })
    .await;
    match result {
        Ok(_) | Err(RetryError::Fatal(TransportError::NotFound { .. })) => {
            tracing::debug!(%server, %allocid, "Allocation removed");
        }
        Err(e) => {
            tracing::warn!(%server, %allocid, "Ignoring error removing allocation: {}", e);
        }
    }
}
