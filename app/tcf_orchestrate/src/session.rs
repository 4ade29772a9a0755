/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! One orchestration run.
//!
//! A [`RunSession`] owns everything a run shares: the inventory snapshot
//! and resolver cache, the registered filters and the allocation manager.
//! For each test case it plans the axis permutations and, for each of
//! those, the target groups to request; then it hands every permutation to
//! the allocation manager as a separate allocation run.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use dupe::Dupe;
use futures::future;
use itertools::Itertools;
use tcf_alloc::AllocationError;
use tcf_alloc::AllocationManager;
use tcf_alloc::AllocationManagerHandle;
use tcf_alloc::RunId;
use tcf_alloc::RunOutcome;
use tcf_alloc::RunRequest;
use tcf_alloc::dispatch::ExecutionDispatcher;
use tcf_alloc::events::AllocationEvent;
use tcf_alloc::transport::Transport;
use tcf_matrix::axes::AxisPermutation;
use tcf_matrix::axes::AxisSet;
use tcf_matrix::enumerator::AxesEnumerator;
use tcf_targets::TargetGroup;
use tcf_targets::inventory::InventorySnapshot;
use tcf_targets::pairing::Pairer;
use tcf_targets::resolver::InventoryExpander;
use tcf_targets::resolver::ResolverStats;
use tcf_targets::resolver::TargetResolver;
use tokio::sync::mpsc;

use crate::config::OrchestrateConfig;
use crate::driver::DriverSet;
use crate::error::ProbeFailure;
use crate::error::SessionError;
use crate::filters::FilterRegistry;
use crate::probe::probe_all;
use crate::testcase::Knobs;
use crate::testcase::TestCase;

/// The target groups requested for one axis permutation.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub run: RunId,
    pub permutation: AxisPermutation,
    /// Groups to launch; zero launches on all of them.
    pub needed: u64,
    /// Named `APID.IC_GROUP_ID.GROUP_ID`.
    pub groups: BTreeMap<String, TargetGroup>,
}

#[derive(Debug, Clone)]
pub struct TestPlan {
    pub testcase: String,
    pub knobs: Knobs,
    pub runs: Vec<PlannedRun>,
}

#[derive(Debug)]
pub enum PermutationOutcome {
    /// No target group could be formed; nothing was requested.
    NoTargets,
    Finished(RunOutcome),
    Failed(AllocationError),
}

#[derive(Debug)]
pub struct PermutationReport {
    pub run: RunId,
    pub permutation_id: u64,
    /// Axis name to value, in axis order.
    pub axes: Vec<(String, String)>,
    pub groups_requested: usize,
    pub outcome: PermutationOutcome,
}

impl PermutationReport {
    pub fn launched(&self) -> u64 {
        match &self.outcome {
            PermutationOutcome::Finished(outcome) => outcome.launched,
            PermutationOutcome::NoTargets | PermutationOutcome::Failed(_) => 0,
        }
    }

    /// Whether something stopped this permutation from running.
    pub fn is_blocked(&self) -> bool {
        match &self.outcome {
            PermutationOutcome::Finished(outcome) => outcome.blocked.is_some(),
            PermutationOutcome::Failed(_) => true,
            PermutationOutcome::NoTargets => false,
        }
    }
}

impl fmt::Display for PermutationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: ",
            self.run,
            self.axes.iter().map(|(k, v)| format!("{}={}", k, v)).join(" ")
        )?;
        match &self.outcome {
            PermutationOutcome::NoTargets => write!(f, "no target groups"),
            PermutationOutcome::Finished(outcome) => match &outcome.blocked {
                Some(e) => write!(f, "blocked: {}", e),
                None => write!(
                    f,
                    "launched {} of {} groups",
                    outcome.launched, self.groups_requested
                ),
            },
            PermutationOutcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct TestCaseReport {
    pub testcase: String,
    /// An error means the test case could not be planned at all.
    pub result: Result<Vec<PermutationReport>, SessionError>,
}

#[derive(Debug, Default)]
pub struct SessionReport {
    pub testcases: Vec<TestCaseReport>,
    pub probe_failures: Vec<ProbeFailure>,
    /// Files no driver claimed.
    pub unclaimed: Vec<PathBuf>,
}

impl SessionReport {
    fn permutations(&self) -> impl Iterator<Item = &PermutationReport> {
        self.testcases
            .iter()
            .filter_map(|t| t.result.as_ref().ok())
            .flatten()
    }

    pub fn launched(&self) -> u64 {
        self.permutations().map(|p| p.launched()).sum()
    }

    pub fn blocked(&self) -> usize {
        self.permutations().filter(|p| p.is_blocked()).count()
    }

    /// Test cases that could not be planned, plus files that could not be
    /// probed.
    pub fn errors(&self) -> usize {
        self.testcases.iter().filter(|t| t.result.is_err()).count() + self.probe_failures.len()
    }
}

pub struct RunSession {
    config: OrchestrateConfig,
    resolver: Arc<TargetResolver>,
    filters: FilterRegistry,
    allocator: AllocationManagerHandle,
}

impl RunSession {
    /// Starts the session's allocation manager on the current runtime.
    /// Allocation events are published on the returned receiver.
    pub fn new(
        inventory: Arc<InventorySnapshot>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn ExecutionDispatcher>,
        filters: FilterRegistry,
        config: OrchestrateConfig,
    ) -> (Self, mpsc::UnboundedReceiver<AllocationEvent>) {
        tracing::info!(targets = inventory.len(), "Starting run session");
        let resolver = Arc::new(TargetResolver::new(
            inventory,
            config.pairing.cache_capacity,
        ));
        let (allocator, events) =
            AllocationManager::spawn(transport, dispatcher, config.allocation.clone());
        (
            Self {
                config,
                resolver,
                filters,
                allocator,
            },
            events,
        )
    }

    pub fn config(&self) -> &OrchestrateConfig {
        &self.config
    }

    pub fn allocator(&self) -> &AllocationManagerHandle {
        &self.allocator
    }

    pub fn resolver_stats(&self) -> ResolverStats {
        self.resolver.stats()
    }

    /// Expands the test case's axes and pairs each permutation with target
    /// groups. Nothing is requested from the servers.
    pub fn plan(&self, testcase: &TestCase) -> Result<TestPlan, SessionError> {
        let name = testcase.name();
        let knobs = testcase.knobs(&self.config.session);
        let expander = InventoryExpander::new(&self.resolver, testcase.roles());
        let axes = AxisSet::build(&testcase.axes_decl(), &expander).map_err(|source| {
            SessionError::Axes {
                testcase: name.to_owned(),
                source,
            }
        })?;
        tracing::info!(
            testcase = name,
            permutations = axes.max(),
            randomizer = %testcase.axes_randomizer(),
            "Axes expanded"
        );

        let mut enumerator = AxesEnumerator::new(Arc::new(axes), testcase.axes_randomizer())
            .with_cap(knobs.axes_permutations);
        if let Some(filter) = testcase.axes_permutation_filter() {
            let f = self
                .filters
                .get(filter)
                .ok_or_else(|| SessionError::UnknownFilter {
                    testcase: name.to_owned(),
                    filter: filter.to_owned(),
                })?;
            enumerator = enumerator.with_filter(f);
        }

        let mut seen = HashSet::new();
        let mut runs = Vec::new();
        for permutation in enumerator {
            if !seen.insert(permutation.id) {
                tracing::debug!(testcase = name, id = permutation.id, "Permutation drawn again");
                continue;
            }
            let groups = self.pair(testcase, &permutation, &knobs)?;
            runs.push(PlannedRun {
                run: RunId::new(&format!("{}#{}", name, permutation.id)),
                permutation,
                needed: knobs.target_group_permutations,
                groups,
            });
        }
        Ok(TestPlan {
            testcase: name.to_owned(),
            knobs,
            runs,
        })
    }

    fn pair(
        &self,
        testcase: &TestCase,
        permutation: &AxisPermutation,
        knobs: &Knobs,
    ) -> Result<BTreeMap<String, TargetGroup>, SessionError> {
        let mut pairer = Pairer::new(
            self.resolver.dupe(),
            testcase.roles(),
            permutation,
            testcase.target_group_randomizer(),
            self.config.pairing.clone(),
        );
        if let Some(filter) = testcase.target_group_filter() {
            pairer = pairer.with_filter(filter.dupe());
        }
        let limit = knobs
            .groups_to_request()
            .map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));

        let mut groups = BTreeMap::new();
        for paired in pairer.take(limit) {
            let paired = paired.map_err(|source| SessionError::Resolve {
                testcase: testcase.name().to_owned(),
                source,
            })?;
            let name = format!(
                "{}.{}.{}",
                permutation.id, paired.ic_group_id, paired.group_id
            );
            tracing::debug!(testcase = testcase.name(), group = %name, targets = %paired.group, "Will request");
            groups.insert(name, paired.group);
        }
        if limit != usize::MAX && groups.len() < limit {
            tracing::info!(
                testcase = testcase.name(),
                id = permutation.id,
                found = groups.len(),
                wanted = limit,
                "Early stop: ran out of target groups"
            );
        }
        Ok(groups)
    }

    async fn execute(&self, planned: PlannedRun) -> PermutationReport {
        let PlannedRun {
            run,
            permutation,
            needed,
            groups,
        } = planned;
        let axes = permutation
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        let groups_requested = groups.len();
        let outcome = if groups.is_empty() {
            tracing::info!(%run, "No target group available");
            PermutationOutcome::NoTargets
        } else {
            let mut request = RunRequest::new(run.dupe(), groups, needed);
            request.queue_timeout = self.config.session.queue_timeout();
            match self.allocator.run(request).await {
                Ok(outcome) => PermutationOutcome::Finished(outcome),
                Err(e) => PermutationOutcome::Failed(e),
            }
        };
        let report = PermutationReport {
            run,
            permutation_id: permutation.id,
            axes,
            groups_requested,
            outcome,
        };
        tracing::info!("{}", report);
        report
    }

    /// Plans the test case and runs all its permutations concurrently.
    pub async fn run_testcase(&self, testcase: &TestCase) -> TestCaseReport {
        let result = match self.plan(testcase) {
            Ok(plan) => Ok(future::join_all(plan.runs.into_iter().map(|r| self.execute(r))).await),
            Err(e) => {
                tracing::error!(testcase = testcase.name(), "Planning failed: {}", e);
                Err(e)
            }
        };
        TestCaseReport {
            testcase: testcase.name().to_owned(),
            result,
        }
    }

    pub async fn run(&self, testcases: &[TestCase]) -> SessionReport {
        SessionReport {
            testcases: future::join_all(testcases.iter().map(|t| self.run_testcase(t))).await,
            ..Default::default()
        }
    }

    /// Probes `paths` with `drivers` and runs every test case found.
    pub async fn run_files(&self, drivers: Arc<DriverSet>, paths: Vec<PathBuf>) -> SessionReport {
        let mut testcases = Vec::new();
        let mut probe_failures = Vec::new();
        let mut unclaimed = Vec::new();
        for probed in probe_all(drivers, paths, self.config.session.probe_workers).await {
            match probed.result {
                Ok(Some(found)) => testcases.extend(found.testcases),
                Ok(None) => unclaimed.push(probed.path),
                Err(e) => probe_failures.push(e),
            }
        }
        tracing::info!(
            testcases = testcases.len(),
            failures = probe_failures.len(),
            unclaimed = unclaimed.len(),
            "Probing done"
        );
        SessionReport {
            probe_failures,
            unclaimed,
            ..self.run(&testcases).await
        }
    }

    /// Releases every allocation still held and stops the allocation
    /// manager.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let stats = self.resolver.stats();
        tracing::info!(
            scans = stats.scans,
            hits = stats.cache.hits,
            misses = stats.cache.misses,
            "Shutting down run session"
        );
        Ok(self.allocator.shutdown().await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::FutureExt;
    use http::Method;
    use parking_lot::Mutex;
    use serde_json::Value;
    use serde_json::json;
    use tcf_alloc::dispatch::BoundRun;
    use tcf_alloc::dispatch::ExecutionHandle;
    use tcf_alloc::transport::TransportError;
    use tcf_matrix::axes::AxisDomain;
    use tcf_matrix::enumerator::Randomizer;
    use tcf_targets::Fullid;
    use tcf_targets::ServerId;
    use tcf_targets::role::TargetRole;

    use super::*;
    use crate::driver::tests::ExtensionDriver;
    use crate::driver::tests::FailingDriver;

    /// Grants the first group of every creation request at once.
    #[derive(Default)]
    struct GrantingServer {
        created: AtomicUsize,
        calls: Mutex<Vec<(ServerId, String, String)>>,
    }

    #[async_trait]
    impl Transport for GrantingServer {
        async fn send(
            &self,
            server: &ServerId,
            method: Method,
            path: &str,
            body: Option<Value>,
        ) -> Result<Value, TransportError> {
            self.calls
                .lock()
                .push((server.dupe(), method.to_string(), path.to_owned()));
            if method == Method::PUT && path == "allocation" {
                let n = self.created.fetch_add(1, Ordering::SeqCst);
                let first = body
                    .as_ref()
                    .and_then(|b| b["groups"].as_object())
                    .and_then(|g| g.keys().next().cloned());
                return Ok(json!({
                    "allocid": format!("{}-{}", server, n),
                    "state": "active",
                    "group_allocated_name": first,
                }));
            }
            Ok(json!({}))
        }
    }

    impl GrantingServer {
        fn creations(&self) -> Vec<ServerId> {
            self.calls
                .lock()
                .iter()
                .filter(|(_, method, path)| method == "PUT" && path == "allocation")
                .map(|(server, _, _)| server.dupe())
                .collect()
        }
    }

    #[derive(Default)]
    struct Recorder {
        launched: Mutex<Vec<BoundRun>>,
    }

    impl ExecutionDispatcher for Recorder {
        fn launch(&self, run: BoundRun) -> ExecutionHandle {
            self.launched.lock().push(run);
            futures::future::ready(Ok(())).boxed()
        }
    }

    fn inventory() -> Arc<InventorySnapshot> {
        Arc::new(InventorySnapshot::from_targets(
            [
                ("s1/q1", json!({"type": "qemu"})),
                ("s1/q2", json!({"type": "qemu"})),
                ("s2/f1", json!({"type": "frdm"})),
            ]
            .into_iter()
            .map(|(id, inv)| (Fullid::parse(id).unwrap(), inv)),
        ))
    }

    fn session(
        filters: FilterRegistry,
    ) -> (RunSession, Arc<GrantingServer>, Arc<Recorder>) {
        let transport = Arc::new(GrantingServer::default());
        let dispatcher = Arc::new(Recorder::default());
        let (session, _events) = RunSession::new(
            inventory(),
            transport.dupe(),
            dispatcher.dupe(),
            filters,
            OrchestrateConfig::default(),
        );
        (session, transport, dispatcher)
    }

    fn by_type() -> TestCase {
        TestCase::new("by_type")
            .with_role(TargetRole::new("target").with_axis("type", AxisDomain::FromInventory))
            .with_axes_randomizer(Randomizer::Sequential)
            .with_target_group_randomizer(Randomizer::Sequential)
    }

    fn report_for<'a>(reports: &'a [PermutationReport], value: &str) -> &'a PermutationReport {
        reports
            .iter()
            .find(|r| r.axes.iter().any(|(_, v)| v == value))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_testcase_without_roles() {
        let (session, transport, dispatcher) = session(FilterRegistry::new());
        let testcase = TestCase::new("local").with_axis(
            "os",
            AxisDomain::Values(vec!["linux".into(), "zephyr".into()]),
        );
        let report = session.run_testcase(&testcase).await;
        let reports = report.result.unwrap();
        assert_eq!(2, reports.len());
        assert!(reports.iter().all(|r| r.launched() == 1));
        assert!(reports.iter().all(|r| !r.is_blocked()));
        session.shutdown().await.unwrap();

        assert_eq!(2, dispatcher.launched.lock().len());
        assert!(transport.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overallocates_per_permutation() {
        let (session, transport, dispatcher) = session(FilterRegistry::new());
        let plan = session.plan(&by_type()).unwrap();
        assert_eq!(2, plan.runs.len());
        assert_eq!(Some(2), plan.knobs.groups_to_request());
        for run in &plan.runs {
            assert!(run.run.to_string().starts_with("by_type#"));
            assert_eq!(1, run.needed);
            for name in run.groups.keys() {
                assert!(name.starts_with(&format!("{}.", run.permutation.id)));
            }
        }

        let report = session.run_testcase(&by_type()).await;
        let reports = report.result.unwrap();
        let frdm = report_for(&reports, "frdm");
        assert_eq!(1, frdm.groups_requested);
        assert_eq!(1, frdm.launched());
        let qemu = report_for(&reports, "qemu");
        assert_eq!(2, qemu.groups_requested);
        assert_eq!(1, qemu.launched());
        session.shutdown().await.unwrap();

        let mut servers: Vec<String> = transport
            .creations()
            .iter()
            .map(|s| s.to_string())
            .collect();
        servers.sort();
        assert_eq!(vec!["s1", "s2"], servers);
        let launched = dispatcher.launched.lock();
        assert_eq!(2, launched.len());
        assert!(
            launched
                .iter()
                .any(|r| r.targets["target"].fullid.as_str() == "s2/f1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permutation_filter() {
        let mut filters = FilterRegistry::new();
        filters.register("only_qemu", |_, values| {
            values.iter().any(|v| v.to_string() == "qemu")
        });
        let (session, _transport, _dispatcher) = session(filters);

        let plan = session
            .plan(&by_type().with_axes_permutation_filter("only_qemu"))
            .unwrap();
        assert_eq!(1, plan.runs.len());
        assert_eq!(2, plan.runs[0].groups.len());

        assert_matches!(
            session.plan(&by_type().with_axes_permutation_filter("nope")),
            Err(SessionError::UnknownFilter { filter, .. }) if filter == "nope"
        );
        session.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_targets() {
        let (session, transport, dispatcher) = session(FilterRegistry::new());
        let testcase = TestCase::new("picky")
            .with_role(TargetRole::new("target").with_spec("type == 'arduino'").unwrap());
        let reports = session.run_testcase(&testcase).await.result.unwrap();
        assert_eq!(1, reports.len());
        assert_matches!(reports[0].outcome, PermutationOutcome::NoTargets);
        assert!(!reports[0].is_blocked());
        session.shutdown().await.unwrap();

        assert!(transport.creations().is_empty());
        assert!(dispatcher.launched.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_target_groups() {
        let (session, _transport, dispatcher) = session(FilterRegistry::new());
        let testcase = TestCase::new("all_qemu")
            .with_role(TargetRole::new("target").with_spec("type == 'qemu'").unwrap())
            .with_target_group_permutations(0);
        let reports = session.run_testcase(&testcase).await.result.unwrap();
        assert_eq!(1, reports.len());
        assert_eq!(2, reports[0].groups_requested);
        assert_eq!(2, reports[0].launched());
        session.shutdown().await.unwrap();
        assert_eq!(2, dispatcher.launched.lock().len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_files() {
        let (session, _transport, dispatcher) = session(FilterRegistry::new());
        let drivers = Arc::new(DriverSet::new(vec![
            Arc::new(FailingDriver),
            Arc::new(ExtensionDriver("py")),
        ]));
        let report = session
            .run_files(
                drivers,
                vec![
                    PathBuf::from("a/test_one.py"),
                    PathBuf::from("a/bad.py"),
                    PathBuf::from("a/README"),
                ],
            )
            .await;
        session.shutdown().await.unwrap();

        assert_eq!(1, report.testcases.len());
        assert_eq!(1, report.launched());
        assert_eq!(0, report.blocked());
        assert_eq!(1, report.errors());
        assert_matches!(&report.probe_failures[0], ProbeFailure::Driver { driver, .. } if driver == "failing");
        assert_eq!(vec![PathBuf::from("a/README")], report.unclaimed);
        assert_eq!(1, dispatcher.launched.lock().len());
    }
}
