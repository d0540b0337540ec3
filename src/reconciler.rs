//! The run state machine.
//!
//! `calculate` drives every controller through prefetch, validate and
//! calculate. `execute` applies the resulting actions and always lets the
//! auditors commit, whatever happened during apply.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use chrono::{DateTime, Utc};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::calculated::Calculator;
use crate::context::RunContext;
use crate::controller::BackendController;
use crate::error::ReconcileError;
use crate::timers::{PhaseTimer, RunStats};
use crate::traits::Auditor;
use crate::types::Action;

/// Where a reconciler is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum Phase {
    Idle,
    Prefetch,
    Validate,
    Calculate,
    /// Actions are calculated and ready for `execute`.
    Calculated,
    Preapply,
    Apply,
    AuditCommit,
    Done,
    Failed,
}

pub struct Reconciler {
    calculator: Calculator,
    controllers: Vec<Box<dyn BackendController>>,
    auditors: Vec<Box<dyn Auditor>>,
    now: Option<DateTime<Utc>>,
    phase: Phase,
    stats: RunStats,
}

impl Reconciler {
    pub fn new(
        calculator: Calculator,
        controllers: Vec<Box<dyn BackendController>>,
        auditors: Vec<Box<dyn Auditor>>,
    ) -> Result<Self, ReconcileError> {
        let mut seen = HashSet::new();
        for controller in &controllers {
            let ou = controller.ou();
            let configured = calculator.config().ou(ou)?;
            if controller.mirror_of() != configured.mirror.as_deref() {
                return Err(ReconcileError::Configuration(format!(
                    "controller for OU '{ou}' mirrors {:?} but the configuration says {:?}",
                    controller.mirror_of(),
                    configured.mirror
                )));
            }
            if let Some(base) = controller.base()
                && base != configured.base
            {
                return Err(ReconcileError::Configuration(format!(
                    "controller for OU '{ou}' uses base {base} but the configuration says {}",
                    configured.base
                )));
            }
            if !seen.insert(ou.to_string()) {
                return Err(ReconcileError::Configuration(format!(
                    "OU '{ou}' has more than one controller"
                )));
            }
        }
        Ok(Reconciler {
            calculator,
            controllers,
            auditors,
            now: None,
            phase: Phase::Idle,
            stats: RunStats::default(),
        })
    }

    /// Evaluate expirations against a fixed time instead of the clock.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn calculator(&self) -> &Calculator {
        &self.calculator
    }

    /// Compute every action needed to converge the backends.
    ///
    /// Each call starts a fresh run. The first error from any OU aborts it.
    pub fn calculate(&mut self) -> Result<Vec<Action>, ReconcileError> {
        let mut run = RunContext::new(self.now.unwrap_or_else(Utc::now));
        let mut stats = RunStats::default();
        let result = self.calculate_run(&mut run, &mut stats);
        match &result {
            Ok(actions) => {
                stats.actions = actions.len();
                self.phase = Phase::Calculated;
            }
            Err(err) => {
                error!(event = "Reconcile", phase = %self.phase, "{err}");
                self.phase = Phase::Failed;
            }
        }
        self.stats = stats;
        result
    }

    fn calculate_run(
        &mut self,
        run: &mut RunContext,
        stats: &mut RunStats,
    ) -> Result<Vec<Action>, ReconcileError> {
        let workers = self.calculator.config().parallelism;

        self.phase = Phase::Prefetch;
        {
            let _timer = PhaseTimer::new(&mut stats.prefetch);
            for_each_parallel(&self.controllers, workers, |c| c.prefetch())?;
        }

        self.phase = Phase::Validate;
        {
            let _timer = PhaseTimer::new(&mut stats.validate);
            for_each_parallel(&self.controllers, workers, |c| c.validate())?;
        }

        self.phase = Phase::Calculate;
        let _timer = PhaseTimer::new(&mut stats.calculate);
        let mut actions = Vec::new();
        for (controller, source) in self.calculation_order() {
            if let Some(source) = source {
                // The source may have no controller of its own.
                self.calculator.read_all(run, source)?;
            }
            let produced = controller.calculate(&self.calculator, run)?;
            info!(
                event = "Reconcile",
                phase = "Calculate",
                ou = controller.ou(),
                actions = produced.len()
            );
            actions.extend(produced);
        }
        Ok(actions)
    }

    /// Sources before the mirrors that copy them, each mirror paired with
    /// its configured source OU.
    fn calculation_order(&self) -> Vec<(&dyn BackendController, Option<&str>)> {
        let groups = &self.calculator.config().groups;
        let (mirrors, sources): (Vec<_>, Vec<_>) = self
            .controllers
            .iter()
            .map(|c| {
                let source = groups.get(c.ou()).and_then(|g| g.mirror.as_deref());
                (c.as_ref(), source)
            })
            .partition(|(_, source)| source.is_some());
        sources.into_iter().chain(mirrors).collect()
    }

    fn controller(&self, ou: &str) -> Option<&dyn BackendController> {
        self.controllers
            .iter()
            .find(|c| c.ou() == ou)
            .map(|c| c.as_ref())
    }

    /// Apply `actions`, then commit every auditor.
    ///
    /// Auditors commit exactly once per call once their setup has succeeded,
    /// even when pre-apply or apply fails. A provider error wins over audit
    /// errors; of several audit errors only the first is returned.
    pub fn execute(&mut self, actions: &[Action]) -> Result<(), ReconcileError> {
        let mut stats = self.stats.clone();
        let result = self.execute_run(actions, &mut stats);
        self.stats = stats;
        self.phase = if result.is_ok() {
            Phase::Done
        } else {
            Phase::Failed
        };
        result
    }

    fn execute_run(
        &mut self,
        actions: &[Action],
        stats: &mut RunStats,
    ) -> Result<(), ReconcileError> {
        for action in actions {
            if self.controller(action.ou()).is_none() {
                return Err(ReconcileError::Configuration(format!(
                    "{action} belongs to OU '{}', which has no controller",
                    action.ou()
                )));
            }
        }

        for auditor in &self.auditors {
            auditor.setup().inspect_err(|err| {
                error!(
                    event = "Reconcile",
                    phase = "AuditSetup",
                    auditor = auditor.description(),
                    "{err}"
                );
            })?;
        }

        let mut successful_actions = BTreeSet::new();
        let mut provider_error = None;

        self.phase = Phase::Preapply;
        {
            let _timer = PhaseTimer::new(&mut stats.preapply);
            for controller in &self.controllers {
                if let Err(err) = controller.preapply() {
                    error!(event = "Reconcile", phase = "Preapply", ou = controller.ou(), "{err}");
                    provider_error = Some(err);
                    break;
                }
            }
        }

        if provider_error.is_none() {
            self.phase = Phase::Apply;
            let _timer = PhaseTimer::new(&mut stats.apply);
            for action in actions {
                let Some(controller) = self.controller(action.ou()) else {
                    continue;
                };
                match controller.apply(action) {
                    Ok(()) => {
                        successful_actions.insert(action.dn().to_string());
                    }
                    Err(err) => {
                        error!(event = "Reconcile", phase = "Apply", action = %action, "{err}");
                        provider_error = Some(err);
                        break;
                    }
                }
            }
        }
        stats.applied = successful_actions.len();

        self.phase = Phase::AuditCommit;
        let mut audit_errors = Vec::new();
        {
            let _timer = PhaseTimer::new(&mut stats.audit);
            for auditor in &self.auditors {
                match auditor.commit(actions, &successful_actions, provider_error.as_ref()) {
                    Ok(()) => debug!(
                        event = "Reconcile",
                        phase = "AuditCommit",
                        auditor = auditor.description()
                    ),
                    Err(err) => {
                        error!(
                            event = "Reconcile",
                            phase = "AuditCommit",
                            auditor = auditor.description(),
                            "{err}"
                        );
                        audit_errors.push(err);
                    }
                }
            }
        }

        if let Some(err) = provider_error {
            return Err(err);
        }
        if audit_errors.len() > 1 {
            warn!(
                event = "Reconcile",
                phase = "AuditCommit",
                failures = audit_errors.len(),
                "multiple auditors failed; only the first error is returned"
            );
        }
        match audit_errors.into_iter().next() {
            Some(err) => Err(err),
            None => {
                info!(
                    event = "Reconcile",
                    phase = "Done",
                    actions = actions.len(),
                    applied = stats.applied
                );
                Ok(())
            }
        }
    }
}

/// Run `task` for every controller on at most `workers` threads.
///
/// Returns once all have finished; the error of the earliest controller in
/// list order wins.
fn for_each_parallel<F>(
    controllers: &[Box<dyn BackendController>],
    workers: usize,
    task: F,
) -> Result<(), ReconcileError>
where
    F: Fn(&dyn BackendController) -> Result<(), ReconcileError> + Sync,
{
    let workers = workers.clamp(1, controllers.len().max(1));
    if workers == 1 {
        return controllers.iter().try_for_each(|c| task(c.as_ref()));
    }

    let next = AtomicUsize::new(0);
    let errors: Mutex<Vec<(usize, ReconcileError)>> = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(controller) = controllers.get(index) else {
                        break;
                    };
                    if let Err(err) = task(controller.as_ref()) {
                        if let Ok(mut errors) = errors.lock() {
                            errors.push((index, err));
                        }
                    }
                }
            });
        }
    });

    let mut errors = errors.into_inner()?;
    errors.sort_by_key(|(index, _)| *index);
    match errors.into_iter().next() {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OuConfig;
    use crate::controller::GroupController;
    use crate::memory::MemoryProvider;
    use crate::testing::{CONFIG, Harness, now};
    use crate::traits::Provider;
    use crate::types::Group;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const TEAMS: &str = "ou=Teams,dc=example,dc=net";
    const MIRROR: &str = "ou=Mirror,dc=example,dc=net";

    const FILES: &[(&str, &str)] = &[
        ("teams/a.yaml", "rules:\n  username: alice\n"),
        ("teams/b.yaml", "rules:\n  username: bob\n"),
        ("teams/c.yaml", "rules:\n  username: carol\n"),
    ];

    /// Delegates to a [`MemoryProvider`], failing the nth upsert.
    struct Flaky {
        inner: Arc<MemoryProvider>,
        fail_on: usize,
        upserts: AtomicUsize,
    }

    impl Provider for Flaky {
        fn read_all(&self, base: &str) -> Result<BTreeSet<String>, ReconcileError> {
            self.inner.read_all(base)
        }

        fn read(&self, dn: &str) -> Result<Group, ReconcileError> {
            self.inner.read(dn)
        }

        fn upsert(
            &self,
            group: &Group,
            overrides: &BTreeMap<String, String>,
        ) -> Result<bool, ReconcileError> {
            if self.upserts.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(ReconcileError::Provider(format!("cannot write {}", group.dn())));
            }
            self.inner.upsert(group, overrides)
        }

        fn delete(&self, dn: &str) -> Result<bool, ReconcileError> {
            self.inner.delete(dn)
        }

        fn exists(&self, dn: &str) -> Result<bool, ReconcileError> {
            self.inner.exists(dn)
        }
    }

    #[derive(Clone, Default)]
    struct Recording {
        setups: Arc<AtomicUsize>,
        commits: Arc<Mutex<Vec<(BTreeSet<String>, Option<String>)>>>,
        fail_setup: bool,
        fail_commit: Option<&'static str>,
    }

    impl Auditor for Recording {
        fn setup(&self) -> Result<(), ReconcileError> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                return Err(ReconcileError::Audit("setup failed".into()));
            }
            Ok(())
        }

        fn commit(
            &self,
            _actions: &[Action],
            successful_actions: &BTreeSet<String>,
            provider_error: Option<&ReconcileError>,
        ) -> Result<(), ReconcileError> {
            self.commits.lock().unwrap().push((
                successful_actions.clone(),
                provider_error.map(|e| e.to_string()),
            ));
            match self.fail_commit {
                Some(message) => Err(ReconcileError::Audit(message.into())),
                None => Ok(()),
            }
        }

        fn description(&self) -> String {
            "recording".into()
        }
    }

    fn reconciler(
        controllers: Vec<Box<dyn BackendController>>,
        auditors: Vec<Box<dyn Auditor>>,
    ) -> Reconciler {
        let h = Harness::new(CONFIG, FILES);
        Reconciler::new(h.calculator, controllers, auditors)
            .unwrap()
            .with_now(now())
    }

    fn teams(provider: impl Provider + 'static) -> Box<dyn BackendController> {
        Box::new(GroupController::new(
            "teams",
            OuConfig::new("ldap", TEAMS),
            provider,
        ))
    }

    fn flaky(fail_on: usize) -> (Arc<MemoryProvider>, Box<dyn BackendController>) {
        let inner = Arc::new(MemoryProvider::new().with_ou(TEAMS));
        let controller = teams(Flaky {
            inner: inner.clone(),
            fail_on,
            upserts: AtomicUsize::new(0),
        });
        (inner, controller)
    }

    #[test]
    fn test_full_run_converges() {
        let (inner, controller) = flaky(0);
        let auditor = Recording::default();
        let mut r = reconciler(vec![controller], vec![Box::new(auditor.clone())]);
        assert_eq!(r.phase(), Phase::Idle);

        let actions = r.calculate().unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(r.phase(), Phase::Calculated);
        assert_eq!(r.stats().actions, 3);

        r.execute(&actions).unwrap();
        assert_eq!(r.phase(), Phase::Done);
        assert_eq!(r.stats().applied, 3);
        assert_eq!(inner.groups().unwrap().len(), 3);
        let commits = auditor.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0.len(), 3);
        assert_eq!(commits[0].1, None);
        drop(commits);

        assert!(r.calculate().unwrap().is_empty());
    }

    #[test]
    fn test_audit_commits_after_provider_failure() {
        let (inner, controller) = flaky(2);
        let first = Recording::default();
        let second = Recording::default();
        let mut r = reconciler(
            vec![controller],
            vec![Box::new(first.clone()), Box::new(second.clone())],
        );
        let actions = r.calculate().unwrap();
        let err = r.execute(&actions).unwrap_err();

        assert_eq!(
            err,
            ReconcileError::Provider(format!("cannot write cn=b,{TEAMS}"))
        );
        assert_eq!(r.phase(), Phase::Failed);
        for auditor in [&first, &second] {
            let commits = auditor.commits.lock().unwrap();
            assert_eq!(commits.len(), 1);
            assert_eq!(
                commits[0].0,
                BTreeSet::from([format!("cn=a,{TEAMS}")])
            );
            assert_eq!(commits[0].1.as_deref(), Some(err.to_string().as_str()));
        }
        // The third action is never attempted.
        assert_eq!(inner.groups().unwrap().len(), 1);
    }

    #[test]
    fn test_provider_error_beats_audit_error() {
        let (_, controller) = flaky(1);
        let failing = Recording {
            fail_commit: Some("disk full"),
            ..Recording::default()
        };
        let mut r = reconciler(vec![controller], vec![Box::new(failing)]);
        let actions = r.calculate().unwrap();
        assert!(matches!(
            r.execute(&actions),
            Err(ReconcileError::Provider(_))
        ));
    }

    #[derive(Clone, Default)]
    struct SharedLogBuffer(Arc<Mutex<Vec<u8>>>);

    struct SharedLogWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogBuffer {
        type Writer = SharedLogWriter;

        fn make_writer(&'a self) -> Self::Writer {
            SharedLogWriter(Arc::clone(&self.0))
        }
    }

    impl std::io::Write for SharedLogWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_only_first_audit_error_is_returned() {
        let (_, controller) = flaky(0);
        let first = Recording {
            fail_commit: Some("first"),
            ..Recording::default()
        };
        let second = Recording {
            fail_commit: Some("second"),
            ..Recording::default()
        };
        let mut r = reconciler(
            vec![controller],
            vec![Box::new(first.clone()), Box::new(second.clone())],
        );
        let actions = r.calculate().unwrap();

        let sink = SharedLogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(sink.clone())
            .finish();
        let err = tracing::subscriber::with_default(subscriber, || {
            tracing::callsite::rebuild_interest_cache();
            r.execute(&actions).unwrap_err()
        });

        assert_eq!(err, ReconcileError::Audit("first".into()));
        assert_eq!(first.commits.lock().unwrap().len(), 1);
        assert_eq!(second.commits.lock().unwrap().len(), 1);
        let logs = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(
            logs.contains("only the first error is returned"),
            "expected suppression warning, logs: {logs}"
        );
    }

    #[test]
    fn test_setup_failure_skips_apply_and_commit() {
        let (inner, controller) = flaky(0);
        let broken = Recording {
            fail_setup: true,
            ..Recording::default()
        };
        let mut r = reconciler(vec![controller], vec![Box::new(broken.clone())]);
        let actions = r.calculate().unwrap();
        assert_eq!(
            r.execute(&actions).unwrap_err(),
            ReconcileError::Audit("setup failed".into())
        );
        assert!(inner.groups().unwrap().is_empty());
        assert!(broken.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_preapply_failure_still_commits() {
        let mut config = OuConfig::new("github_team", TEAMS);
        config.create_if_missing = true;
        // The default create_ou refuses.
        let controller: Box<dyn BackendController> = Box::new(GroupController::new(
            "teams",
            config,
            Flaky {
                inner: Arc::new(MemoryProvider::new()),
                fail_on: 0,
                upserts: AtomicUsize::new(0),
            },
        ));
        let auditor = Recording::default();
        let mut r = reconciler(vec![controller], vec![Box::new(auditor.clone())]);
        let actions = r.calculate().unwrap();
        let err = r.execute(&actions).unwrap_err();
        assert!(matches!(err, ReconcileError::Provider(_)));
        let commits = auditor.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].0.is_empty());
    }

    #[test]
    fn test_unrouted_action_is_a_configuration_error() {
        let (_, controller) = flaky(0);
        let auditor = Recording::default();
        let mut r = reconciler(vec![controller], vec![Box::new(auditor.clone())]);
        let stray = Action::new("cn=x,ou=Else", None, None, "elsewhere");
        assert!(matches!(
            r.execute(&[stray]),
            Err(ReconcileError::Configuration(_))
        ));
        assert_eq!(auditor.setups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mirror_calculated_after_source() {
        let mirror: Box<dyn BackendController> = Box::new(GroupController::new(
            "mirror",
            OuConfig {
                mirror: Some("teams".into()),
                ..OuConfig::new("github_team", MIRROR)
            },
            MemoryProvider::new().with_ou(MIRROR),
        ));
        let (_, source) = flaky(0);
        let mut r = reconciler(vec![mirror, source], vec![]);
        let actions = r.calculate().unwrap();
        let mirrored: Vec<&str> = actions
            .iter()
            .filter(|a| a.ou() == "mirror")
            .map(|a| a.dn())
            .collect();
        assert_eq!(
            mirrored,
            vec![
                format!("cn=a,{MIRROR}"),
                format!("cn=b,{MIRROR}"),
                format!("cn=c,{MIRROR}"),
            ]
        );
        assert_eq!(actions[0].ou(), "teams");
    }

    #[test]
    fn test_mirror_without_source_controller() {
        let mirror: Box<dyn BackendController> = Box::new(GroupController::new(
            "mirror",
            OuConfig {
                mirror: Some("teams".into()),
                ..OuConfig::new("github_team", MIRROR)
            },
            MemoryProvider::new().with_ou(MIRROR),
        ));
        let mut r = reconciler(vec![mirror], vec![]);
        let actions = r.calculate().unwrap();
        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|a| a.ou() == "mirror"));
        assert_eq!(r.phase(), Phase::Calculated);
    }

    #[test]
    fn test_controller_must_match_configuration() {
        let h = Harness::new(CONFIG, FILES);
        let unmarked: Box<dyn BackendController> = Box::new(GroupController::new(
            "mirror",
            OuConfig::new("github_team", MIRROR),
            MemoryProvider::new(),
        ));
        let (_, source) = flaky(0);
        let err = Reconciler::new(h.calculator, vec![unmarked, source], vec![])
            .err()
            .unwrap();
        assert!(matches!(err, ReconcileError::Configuration(_)));

        let h = Harness::new(CONFIG, FILES);
        let elsewhere = teams_at("ou=Elsewhere,dc=example,dc=net");
        let err = Reconciler::new(h.calculator, vec![elsewhere], vec![])
            .err()
            .unwrap();
        insta::assert_snapshot!(err.to_string(), @"configuration error: controller for OU 'teams' uses base ou=Elsewhere,dc=example,dc=net but the configuration says ou=Teams,dc=example,dc=net");
    }

    fn teams_at(base: &str) -> Box<dyn BackendController> {
        Box::new(GroupController::new(
            "teams",
            OuConfig::new("ldap", base),
            MemoryProvider::new(),
        ))
    }

    /// Records each hook call and how many prefetches overlap.
    struct StepLog {
        ou: &'static str,
        mirror: Option<&'static str>,
        log: Arc<Mutex<Vec<String>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl StepLog {
        fn push(&self, step: &str) {
            self.log.lock().unwrap().push(format!("{step}:{}", self.ou));
        }
    }

    impl BackendController for StepLog {
        fn ou(&self) -> &str {
            self.ou
        }

        fn mirror_of(&self) -> Option<&str> {
            self.mirror
        }

        fn prefetch(&self) -> Result<(), ReconcileError> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            self.push("prefetch");
            thread::sleep(std::time::Duration::from_millis(50));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn validate(&self) -> Result<(), ReconcileError> {
            self.push("validate");
            Ok(())
        }

        fn calculate(
            &self,
            _calculator: &Calculator,
            _run: &mut RunContext,
        ) -> Result<Vec<Action>, ReconcileError> {
            self.push("calculate");
            Ok(Vec::new())
        }

        fn preapply(&self) -> Result<(), ReconcileError> {
            Ok(())
        }

        fn apply(&self, _action: &Action) -> Result<(), ReconcileError> {
            Ok(())
        }

        fn change_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_parallel_prefetch_finishes_before_validate() {
        let config = format!(
            "parallelism: 2\n{CONFIG}  extra:\n    type: ldap\n    base: ou=Extra,dc=example,dc=net\n"
        );
        let h = Harness::new(&config, FILES);
        let log = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let controllers: Vec<Box<dyn BackendController>> = [
            ("mirror", Some("teams")),
            ("teams", None),
            ("extra", None),
        ]
        .into_iter()
        .map(|(ou, mirror)| {
            Box::new(StepLog {
                ou,
                mirror,
                log: log.clone(),
                in_flight: in_flight.clone(),
                max_in_flight: max_in_flight.clone(),
            }) as Box<dyn BackendController>
        })
        .collect();
        let mut r = Reconciler::new(h.calculator, controllers, vec![]).unwrap();
        assert!(r.calculate().unwrap().is_empty());

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 2);
        let log = log.lock().unwrap().clone();
        let steps: Vec<&str> = log
            .iter()
            .map(|entry| entry.split(':').next().unwrap())
            .collect();
        assert_eq!(
            steps,
            vec![
                "prefetch",
                "prefetch",
                "prefetch",
                "validate",
                "validate",
                "validate",
                "calculate",
                "calculate",
                "calculate",
            ]
        );
        assert_eq!(
            &log[6..],
            &["calculate:teams", "calculate:extra", "calculate:mirror"]
        );
        assert!(r.stats().prefetch >= std::time::Duration::from_millis(100));
    }

    #[test]
    fn test_parallel_prefetch_reports_first_failure() {
        let config = format!("parallelism: 4\n{CONFIG}");
        let h = Harness::new(&config, FILES);
        // Neither base exists and neither OU may create it.
        let controllers: Vec<Box<dyn BackendController>> = vec![
            teams(MemoryProvider::new()),
            Box::new(GroupController::new(
                "mirror",
                OuConfig {
                    mirror: Some("teams".into()),
                    ..OuConfig::new("github_team", MIRROR)
                },
                MemoryProvider::new(),
            )),
        ];
        let mut r = Reconciler::new(h.calculator, controllers, vec![]).unwrap();
        let err = r.calculate().unwrap_err();
        assert_eq!(
            err,
            ReconcileError::Configuration(format!(
                "base {TEAMS} of OU 'teams' does not exist and create_if_missing is off"
            ))
        );
        assert_eq!(r.phase(), Phase::Failed);
    }

    #[test]
    fn test_duplicate_and_unknown_controllers() {
        let h = Harness::new(CONFIG, FILES);
        let err = Reconciler::new(
            h.calculator,
            vec![teams(MemoryProvider::new()), teams(MemoryProvider::new())],
            vec![],
        )
        .err()
        .unwrap();
        assert!(matches!(err, ReconcileError::Configuration(_)));

        let h = Harness::new(CONFIG, FILES);
        let stray: Box<dyn BackendController> = Box::new(GroupController::new(
            "nowhere",
            OuConfig::new("ldap", TEAMS),
            MemoryProvider::new(),
        ));
        assert!(Reconciler::new(h.calculator, vec![stray], vec![]).is_err());
    }
}
