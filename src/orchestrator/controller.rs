//! Simulation controller.
//!
//! Owns submit/status/terminate/cleanup and schedules lane tasks onto the
//! bounded worker pool.

use super::writer::run_status_writer;
use crate::aggregate;
use crate::engine::{HarnessError, LaneCommand, WorkerHarness};
use crate::model::{Lane, LaneEvent, RunnerConfig, SimulationId, SimulationRequest, SimulationStatus};
use crate::preflight;
use crate::registry::{Registry, RegistryError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub(crate) enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Cancellation handle of a simulation whose lanes have not all reported yet.
pub(super) struct InFlight {
    cancel: CancellationToken,
    lanes_running: usize,
}

pub(super) type InFlightMap = Arc<Mutex<HashMap<SimulationId, InFlight>>>;

pub(crate) struct Orchestrator {
    config: RunnerConfig,
    registry: Arc<Registry>,
    harness: Arc<WorkerHarness>,
    pool: Arc<Semaphore>,
    inflight: InFlightMap,
}

impl Orchestrator {
    pub fn new(config: RunnerConfig) -> Self {
        let registry = Arc::new(Registry::new(config.registry_capacity, config.retention));
        let harness = Arc::new(WorkerHarness::new(&config));
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            config,
            registry,
            harness,
            pool,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a simulation and schedule both lanes. Returns as soon as the lanes
    /// are queued; failures after the record exists are reported on the record.
    pub async fn submit(
        &self,
        mut request: SimulationRequest,
    ) -> Result<SimulationId, OrchestratorError> {
        let id = self.registry.create()?;
        tracing::info!(
            simulation_id = %id,
            input = %request.input_path.display(),
            in_registry = self.registry.len(),
            "simulation created"
        );

        if let Err(err) = preflight::validate(&request, &self.config.validation) {
            tracing::warn!(simulation_id = %id, error = %err, "pre-flight check failed");
            let message = err.to_string();
            self.registry
                .update(&id, |s| aggregate::apply_preflight_error(s, err.kind(), &message));
            return Ok(id);
        }

        // Workers run from their script directory, so hand them an absolute input path.
        match check_input(&request.input_path).await {
            Ok(path) => request.input_path = path,
            Err(message) => {
                tracing::error!(simulation_id = %id, error = %message, "simulation setup failed");
                self.registry
                    .update(&id, |s| aggregate::apply_setup_error(s, &message));
                return Ok(id);
            }
        }

        let cancel = CancellationToken::new();
        self.inflight.lock().insert(
            id.clone(),
            InFlight {
                cancel: cancel.clone(),
                lanes_running: Lane::ALL.len(),
            },
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel::<LaneEvent>();
        for lane in Lane::ALL {
            let cmd = LaneCommand {
                lane,
                script: self.script_for(lane),
                args: request.worker_args(lane),
            };
            spawn_lane(
                id.clone(),
                cmd,
                self.harness.clone(),
                self.pool.clone(),
                self.inflight.clone(),
                event_tx.clone(),
                cancel.clone(),
            );
        }
        drop(event_tx);

        tokio::spawn(run_status_writer(
            self.registry.clone(),
            self.inflight.clone(),
            id.clone(),
            event_rx,
        ));

        Ok(id)
    }

    pub fn status(&self, id: &SimulationId) -> Option<SimulationStatus> {
        self.registry.get(id)
    }

    /// Request cancellation of a running simulation.
    ///
    /// Returns `false` when the simulation is unknown, already terminal, already
    /// being terminated, or when every lane has already produced its outcome.
    /// On `true`, every lane that had not yet reported ends with a
    /// `terminated by request` error, so the record settles as `ERROR`.
    pub fn terminate(&self, id: &SimulationId) -> bool {
        // Lanes report under this lock, so the check and the cancel are atomic
        // with respect to them.
        let inflight = self.inflight.lock();
        let Some(entry) = inflight.get(id) else {
            return false;
        };
        if entry.cancel.is_cancelled() || entry.lanes_running == 0 {
            return false;
        }
        if self.registry.get(id).map_or(true, |status| status.is_terminal()) {
            return false;
        }
        tracing::info!(simulation_id = %id, lanes_running = entry.lanes_running, "terminating simulation");
        entry.cancel.cancel();
        true
    }

    /// Drop a simulation's record, stopping its workers first if they are still
    /// running. Safe to call at any point and more than once.
    pub fn cleanup(&self, id: &SimulationId) {
        if let Some(entry) = self.inflight.lock().remove(id) {
            entry.cancel.cancel();
        }
        if self.registry.remove(id) {
            tracing::info!(simulation_id = %id, "simulation cleaned up");
        }
    }

    fn script_for(&self, lane: Lane) -> PathBuf {
        match lane {
            Lane::Ga => self.config.ga_script.clone(),
            Lane::Aco => self.config.aco_script.clone(),
        }
    }
}

async fn check_input(path: &Path) -> Result<PathBuf, String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => tokio::fs::canonicalize(path)
            .await
            .map_err(|e| format!("cannot resolve input {}: {e}", path.display())),
        Ok(_) => Err(format!("input {} is not a regular file", path.display())),
        Err(e) => Err(format!("cannot read input {}: {e}", path.display())),
    }
}

/// Run one lane on the pool and guarantee it produces exactly one terminal event,
/// even if the harness task panics.
fn spawn_lane(
    id: SimulationId,
    cmd: LaneCommand,
    harness: Arc<WorkerHarness>,
    pool: Arc<Semaphore>,
    inflight: InFlightMap,
    event_tx: UnboundedSender<LaneEvent>,
    cancel: CancellationToken,
) {
    let lane = cmd.lane;
    let progress_tx = event_tx.clone();
    let work_id = id.clone();
    let work_cancel = cancel.clone();
    let work = tokio::spawn(async move {
        let (id, cancel) = (work_id, work_cancel);
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HarnessError::Terminated),
            permit = pool.acquire_owned() => permit.map_err(|_| HarnessError::PoolClosed)?,
        };
        tracing::debug!(simulation_id = %id, %lane, "lane acquired a pool slot");
        let outcome = harness.run(cmd, &progress_tx, &cancel).await;
        drop(permit);
        outcome
    });

    tokio::spawn(async move {
        let outcome = work.await;
        let mut inflight = inflight.lock();
        if let Some(entry) = inflight.get_mut(&id) {
            entry.lanes_running = entry.lanes_running.saturating_sub(1);
        }
        // A terminate that won the race overrides a result that arrived too late.
        let event = match outcome {
            Ok(Ok(_)) if cancel.is_cancelled() => LaneEvent::Error {
                lane,
                message: HarnessError::Terminated.to_string(),
            },
            Ok(Ok(result)) => LaneEvent::Result {
                lane,
                result: Box::new(result),
            },
            Ok(Err(err)) => LaneEvent::Error {
                lane,
                message: err.to_string(),
            },
            Err(join) => LaneEvent::Error {
                lane,
                message: format!("lane task failed: {join}"),
            },
        };
        let _ = event_tx.send(event);
        drop(inflight);
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::fixtures::request;
    use crate::model::OverallStatus;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        orchestrator: Orchestrator,
    }

    impl Fixture {
        fn new(ga_body: &str, aco_body: &str) -> Self {
            Self::with_pool(ga_body, aco_body, 2)
        }

        fn with_pool(ga_body: &str, aco_body: &str, pool_size: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("ga.sh"), ga_body).unwrap();
            std::fs::write(dir.path().join("ant.sh"), aco_body).unwrap();
            std::fs::write(dir.path().join("input.csv"), "Product,Price\nShirt,10\n").unwrap();
            let config = RunnerConfig {
                interpreters: vec!["sh".into()],
                ga_script: dir.path().join("ga.sh"),
                aco_script: dir.path().join("ant.sh"),
                pool_size,
                progress_grace: Duration::from_secs(60),
                heartbeat_interval: Duration::from_millis(50),
                ..Default::default()
            };
            Self {
                dir,
                orchestrator: Orchestrator::new(config),
            }
        }

        fn input(&self) -> PathBuf {
            self.dir.path().join("input.csv")
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        async fn wait_terminal(&self, id: &SimulationId) -> SimulationStatus {
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let status = self.orchestrator.status(id).expect("record exists");
                    if status.is_terminal() {
                        return status;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .expect("simulation reached a terminal state")
        }
    }

    fn worker(lane: &str, profit: f64) -> String {
        format!(
            "echo '[PROGRESS] {lane}: 50.0% completed, estimated 1.0s remaining'\n\
             echo '{{\"total_profit\": {profit}, \"products\": []}}'\n"
        )
    }

    fn touching_worker(marker: &Path) -> String {
        format!("touch '{}'\necho '{{\"total_profit\": 1}}'\n", marker.display())
    }

    #[tokio::test]
    async fn both_lanes_complete() {
        let fx = Fixture::new(&worker("GA", 150.0), &worker("ACO", 80.0));
        let id = fx.orchestrator.submit(request(fx.input())).await.unwrap();
        let status = fx.wait_terminal(&id).await;
        assert_eq!(status.overall_status, OverallStatus::Completed);
        assert!(status.both_finished());
        assert_eq!(status.ga.progress_percent, 100.0);
        let combined = status.result.unwrap();
        assert_eq!(combined.ga.unwrap().total_profit, 150.0);
        assert_eq!(combined.aco.unwrap().total_profit, 80.0);
    }

    #[tokio::test]
    async fn non_positive_profit_is_invisible_solution() {
        let fx = Fixture::new(&worker("GA", 150.0), &worker("ACO", -5.0));
        let id = fx.orchestrator.submit(request(fx.input())).await.unwrap();
        let status = fx.wait_terminal(&id).await;
        assert_eq!(status.overall_status, OverallStatus::InvisibleSolution);
    }

    #[tokio::test]
    async fn one_failing_lane_is_error() {
        let fx = Fixture::new(&worker("GA", 150.0), "echo 'Traceback (most recent call last):'\nexit 2\n");
        let id = fx.orchestrator.submit(request(fx.input())).await.unwrap();
        let status = fx.wait_terminal(&id).await;
        assert_eq!(status.overall_status, OverallStatus::Error);
        assert!(status.aco.has_error);
        assert!(!status.ga.has_error);
        let message = status.error_message.unwrap();
        assert!(message.starts_with("ACO Error: worker failed with exit code 2"), "{message}");
    }

    #[tokio::test]
    async fn shelf_space_error_spawns_nothing() {
        let dir_probe = tempfile::tempdir().unwrap();
        let ga_marker = dir_probe.path().join("ga-ran");
        let aco_marker = dir_probe.path().join("aco-ran");
        let fx = Fixture::new(&touching_worker(&ga_marker), &touching_worker(&aco_marker));
        let mut req = request(fx.input());
        req.required_shelf_space = 120.0;
        req.shelf_space_limit = 100.0;

        let id = fx.orchestrator.submit(req).await.unwrap();
        let status = fx.orchestrator.status(&id).unwrap();
        assert_eq!(status.overall_status, OverallStatus::ShelfSpaceError);
        assert!(status.ga.finished && status.aco.finished);
        assert!(!fx.orchestrator.terminate(&id));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!ga_marker.exists());
        assert!(!aco_marker.exists());
    }

    #[tokio::test]
    async fn out_of_range_discount_is_validation_error() {
        let marker = tempfile::tempdir().unwrap();
        let ga_marker = marker.path().join("ga-ran");
        let fx = Fixture::new(&touching_worker(&ga_marker), &touching_worker(&ga_marker));
        let mut req = request(fx.input());
        req.discount_base = 0.6;
        let id = fx.orchestrator.submit(req).await.unwrap();
        let status = fx.orchestrator.status(&id).unwrap();
        assert_eq!(status.overall_status, OverallStatus::ValidationError);
        assert!(status.both_finished());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!ga_marker.exists());
    }

    #[tokio::test]
    async fn missing_input_becomes_setup_error() {
        let fx = Fixture::new(&worker("GA", 1.0), &worker("ACO", 1.0));
        let id = fx
            .orchestrator
            .submit(request(fx.path("does-not-exist.csv")))
            .await
            .unwrap();
        let status = fx.orchestrator.status(&id).unwrap();
        assert_eq!(status.overall_status, OverallStatus::Error);
        assert!(status
            .error_message
            .unwrap()
            .starts_with("Setup Error: cannot read input"));
    }

    #[tokio::test]
    async fn terminate_mid_flight_reports_each_lane_once() {
        let slow = |lane: &str| {
            format!(
                "echo '[PROGRESS] {lane}: 10.0% completed, estimated 30.0s remaining'\nexec sleep 30\n"
            )
        };
        let fx = Fixture::new(&slow("GA"), &slow("ACO"));
        let id = fx.orchestrator.submit(request(fx.input())).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let s = fx.orchestrator.status(&id).unwrap();
                if s.ga.progress_percent > 0.0 && s.aco.progress_percent > 0.0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("both lanes started");

        assert!(fx.orchestrator.terminate(&id));
        assert!(!fx.orchestrator.terminate(&id));
        let status = fx.wait_terminal(&id).await;
        assert_eq!(status.overall_status, OverallStatus::Error);
        assert!(status.ga.has_error && status.aco.has_error);
        let message = status.error_message.unwrap();
        assert_eq!(message.matches("GA Error: terminated by request").count(), 1);
        assert_eq!(message.matches("ACO Error: terminated by request").count(), 1);
        assert!(!fx.orchestrator.terminate(&id));
    }

    #[tokio::test]
    async fn terminate_while_queued_never_spawns() {
        let marker_dir = tempfile::tempdir().unwrap();
        let aco_marker = marker_dir.path().join("aco-ran");
        let fx = Fixture::with_pool(
            "echo '[PROGRESS] GA: 10.0% completed, estimated 30.0s remaining'\nexec sleep 30\n",
            &touching_worker(&aco_marker),
            1,
        );
        let id = fx.orchestrator.submit(request(fx.input())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // GA grabbed the only slot, unless ACO won the race; either way the
        // terminated simulation must settle.
        assert!(fx.orchestrator.terminate(&id));
        let status = fx.wait_terminal(&id).await;
        assert!(status.both_finished());
        if status.aco.has_error {
            assert!(!aco_marker.exists());
        }
    }

    #[tokio::test]
    async fn terminate_is_refused_once_every_lane_has_reported() {
        let fx = Fixture::new(&worker("GA", 1.0), &worker("ACO", 1.0));
        let orchestrator = &fx.orchestrator;
        let id = orchestrator.registry.create().unwrap();
        let cancel = CancellationToken::new();
        orchestrator.inflight.lock().insert(
            id.clone(),
            InFlight {
                cancel: cancel.clone(),
                lanes_running: 0,
            },
        );
        // Not terminal yet: both outcomes are still queued for the writer.
        assert!(!orchestrator.status(&id).unwrap().is_terminal());
        assert!(!orchestrator.terminate(&id));
        assert!(!cancel.is_cancelled());

        if let Some(entry) = orchestrator.inflight.lock().get_mut(&id) {
            entry.lanes_running = 1;
        }
        assert!(orchestrator.terminate(&id));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_unknown_ids_are_handled() {
        let fx = Fixture::new(&worker("GA", 1.0), &worker("ACO", 1.0));
        let unknown = SimulationId::from("nope");
        assert!(fx.orchestrator.status(&unknown).is_none());
        assert!(!fx.orchestrator.terminate(&unknown));
        fx.orchestrator.cleanup(&unknown);

        let id = fx.orchestrator.submit(request(fx.input())).await.unwrap();
        fx.orchestrator.cleanup(&id);
        fx.orchestrator.cleanup(&id);
        assert!(fx.orchestrator.status(&id).is_none());
    }

    #[tokio::test]
    async fn no_interpreter_errors_both_lanes() {
        let mut fx = Fixture::new(&worker("GA", 1.0), &worker("ACO", 1.0));
        let config = RunnerConfig {
            interpreters: vec!["definitely-not-an-interpreter-7f3a".into()],
            ga_script: fx.path("ga.sh"),
            aco_script: fx.path("ant.sh"),
            ..Default::default()
        };
        fx.orchestrator = Orchestrator::new(config);
        let id = fx.orchestrator.submit(request(fx.input())).await.unwrap();
        let status = fx.wait_terminal(&id).await;
        assert_eq!(status.overall_status, OverallStatus::Error);
        assert!(status
            .error_message
            .unwrap()
            .contains("No usable interpreter found"));
    }
}
