use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationRegistry;
use crate::continuation::ContinuationStore;
use crate::engine::{EngineOutput, EngineParams, GenerationAborted, GenerationEngine};
use crate::events::{
    EventBus, EVENT_JOB_PROGRESS, EVENT_JOB_QUEUE, EVENT_JOB_QUEUED, EVENT_JOB_UPDATE,
};
use crate::gate::{GatePermit, PipelineGate};
use crate::job::{Job, JobStatus};
use crate::queue::AdmissionQueue;
use crate::reference::resolve_reference;
use crate::store::JobStore;
use crate::title::{resolve_title, title_context, TitleAssist, FALLBACK_TITLE};

const FALLBACK_SOUND_TAGS: &str = "pop music";

/// Orchestrator for generation jobs.
///
/// Owns admission, the single-pipeline gate, cancellation bookkeeping, and
/// event emission. Constructed once at startup and passed by handle to every
/// consumer; there is no ambient global instance.
///
/// Concurrency contract: the coordination lock guards the admission queue and
/// is held only for queue/gate bookkeeping, never across an await point. The
/// generation call itself runs on the blocking worker pool so queue, cancel,
/// and subscribe operations for other jobs stay responsive while one job
/// occupies the accelerator.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn GenerationEngine>,
    title: Arc<dyn TitleAssist>,
    continuations: ContinuationStore,
    bus: Arc<EventBus>,
    gate: Arc<PipelineGate>,
    registry: CancellationRegistry,
    waiting: Mutex<AdmissionQueue>,
    audio_dir: PathBuf,
    ref_audio_dir: PathBuf,
}

/// Terminal data carried from a successful generation into the completed
/// record.
struct FinishedGeneration {
    audio_path: String,
    title: String,
    seed: u32,
}

impl JobScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn GenerationEngine>,
        title: Arc<dyn TitleAssist>,
        continuations: ContinuationStore,
        bus: Arc<EventBus>,
        audio_dir: PathBuf,
        ref_audio_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            title,
            continuations,
            bus,
            gate: PipelineGate::new(),
            registry: CancellationRegistry::new(),
            waiting: Mutex::new(AdmissionQueue::new()),
            audio_dir,
            ref_audio_dir,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Enqueue a persisted job and spawn its driver task.
    ///
    /// The queue append and the gate enlistment happen in one critical
    /// section, so the position a client sees is exactly the order in which
    /// the gate will be granted.
    pub fn submit(self: &Arc<Self>, job_id: &str) {
        let pending = {
            let mut waiting = self.waiting();
            waiting.enqueue(job_id);
            let pending = self.gate.enlist(job_id);

            let position = waiting.position_of(job_id);
            let total = waiting.len();
            info!(job_id, position, total, "Job added to queue");
            self.bus.publish(
                EVENT_JOB_QUEUED,
                serde_json::json!({ "job_id": job_id, "position": position, "total": total }),
            );
            Self::broadcast_positions(&self.bus, &waiting);
            pending
        };

        let scheduler = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            scheduler.drive(job_id, pending).await;
        });
    }

    /// Cancel a queued or running job.
    ///
    /// A queued job is withdrawn before it ever starts; a running job is
    /// signalled and will abort at the engine's next checkpoint. Returns
    /// `false` for unknown or already-terminal jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        {
            let mut waiting = self.waiting();
            if waiting.remove(job_id) {
                Self::broadcast_positions(&self.bus, &waiting);
                if self.gate.withdraw(job_id) {
                    info!(job_id, "Removed queued job");
                    return true;
                }
                // The gate was granted between the position display and this
                // call; the job is effectively active already, so fall
                // through to the signal path.
            }
        }

        if self.registry.signal(job_id) {
            info!(job_id, "Cancelling active job");
            return true;
        }

        false
    }

    /// 1-based queue position, or 0 when the job is not waiting.
    pub fn queue_position(&self, job_id: &str) -> usize {
        self.waiting().position_of(job_id)
    }

    pub fn queue_len(&self) -> usize {
        self.waiting().len()
    }

    /// Signal every active job and tell subscribers to close. Called once at
    /// process shutdown.
    pub fn shutdown(&self) {
        let active = self.registry.len();
        info!(active, "Shutting down scheduler; cancelling active jobs");
        self.registry.signal_all();
        self.bus.shutdown();
    }

    async fn drive(self: Arc<Self>, job_id: String, pending: oneshot::Receiver<GatePermit>) {
        // Admission: wait for the gate. A withdrawn waiter was cancelled
        // while queued and must leave no trace.
        let permit = match pending.await {
            Ok(permit) => permit,
            Err(_) => {
                debug!(job_id, "Job withdrawn before admission");
                return;
            }
        };

        {
            let mut waiting = self.waiting();
            waiting.remove(&job_id);
            Self::broadcast_positions(&self.bus, &waiting);
        }

        // The record may have been deleted while we waited; a missing record
        // is a benign cancellation, not an error.
        let job = match self.store.find(&job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "Job was deleted before processing started; aborting");
                return;
            }
            Err(err) => {
                error!(job_id, error = %err, "Failed to re-fetch job before processing");
                return;
            }
        };

        info!(job_id, "Starting generation");
        let mut job = job;
        job.status = JobStatus::Processing;
        if let Err(err) = self.store.save(&job) {
            error!(job_id, error = %err, "Failed to persist processing transition");
            return;
        }
        self.bus.publish(
            EVENT_JOB_UPDATE,
            serde_json::json!({ "job_id": job_id, "status": "processing" }),
        );
        self.bus.publish(
            EVENT_JOB_PROGRESS,
            serde_json::json!({
                "job_id": job_id,
                "progress": 0,
                "msg": "Starting generation pipeline",
            }),
        );

        let token = match self.registry.register(&job_id) {
            Ok(token) => token,
            Err(err) => {
                error!(job_id, error = %err, "Failed to register cancellation token");
                return;
            }
        };

        // From here on every path runs the cleanup tail below; the gate
        // permit is released by drop on all of them.
        let outcome = self.process(&job, token).await;
        self.finish(&job_id, outcome).await;

        self.registry.unregister(&job_id);
        if let Err(err) = self.engine.release_cached_state() {
            warn!(job_id, error = %err, "Engine cache release failed");
        }
        if let Err(err) = self.engine.reclaim_device_memory() {
            warn!(job_id, error = %err, "Device memory reclaim failed");
        }
        debug!(job_id, "Cleaned up after generation");

        drop(permit);
    }

    /// Resolve best-effort inputs and run the engine. Only engine failures
    /// (and worker panics) propagate; every resolution sub-step falls back.
    async fn process(&self, job: &Job, token: CancellationToken) -> Result<FinishedGeneration> {
        let title = {
            let assist = Arc::clone(&self.title);
            let context = title_context(&job.prompt, job.lyrics.as_deref());
            let requested_model = job.title_model.clone();
            match tokio::task::spawn_blocking(move || {
                resolve_title(assist.as_ref(), &context, requested_model.as_deref())
            })
            .await
            {
                Ok(title) => title,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "Title worker failed; using default");
                    FALLBACK_TITLE.to_string()
                }
            }
        };

        let seed = job.seed.unwrap_or_else(rand::random);
        if job.seed.is_none() {
            debug!(job_id = %job.id, seed, "Drew random seed for reproducibility");
        }

        let continuation = match &job.parent_job_id {
            Some(parent_id) => match self.continuations.load(parent_id) {
                Ok(Some(state)) => {
                    info!(job_id = %job.id, parent_id, "Loaded continuation state");
                    Some(state)
                }
                Ok(None) => {
                    warn!(
                        job_id = %job.id,
                        parent_id,
                        "Parent continuation state not found; generating without history"
                    );
                    None
                }
                Err(err) => {
                    warn!(job_id = %job.id, parent_id, error = %err, "Failed to load continuation state");
                    None
                }
            },
            None => None,
        };

        let reference = match &job.ref_audio_id {
            Some(ref_id) => {
                let ref_dir = self.ref_audio_dir.clone();
                let ref_id = ref_id.clone();
                let style_influence = job.style_influence;
                let start_sec = job.ref_audio_start_sec;
                let job_id = job.id.clone();
                match tokio::task::spawn_blocking(move || {
                    resolve_reference(&ref_dir, &ref_id, style_influence, start_sec)
                })
                .await
                {
                    Ok(Ok(Some(conditioning))) => {
                        info!(
                            job_id = %job_id,
                            path = %conditioning.audio_path.display(),
                            window_secs = conditioning.window_secs,
                            "Using reference audio"
                        );
                        Some(conditioning)
                    }
                    Ok(Ok(None)) => {
                        warn!(job_id = %job_id, "Reference audio not found; ignoring");
                        None
                    }
                    Ok(Err(err)) => {
                        warn!(job_id = %job_id, error = %err, "Reference audio resolution failed; ignoring");
                        None
                    }
                    Err(err) => {
                        warn!(job_id = %job_id, error = %err, "Reference worker failed; ignoring");
                        None
                    }
                }
            }
            None => None,
        };

        let sound_tags = job
            .tags
            .as_deref()
            .map(str::trim)
            .filter(|tags| !tags.is_empty())
            .unwrap_or(FALLBACK_SOUND_TAGS)
            .to_string();

        let filename = format!("song_{}.wav", job.id);
        let params = EngineParams {
            job_id: job.id.clone(),
            lyrics: job.lyrics.clone(),
            tags: sound_tags,
            duration_ms: job.duration_ms,
            temperature: job.temperature,
            cfg_scale: job.cfg_scale,
            top_k: job.top_k,
            seed,
            output_path: self.audio_dir.join(&filename),
            reference,
            continuation,
        };

        let output = self.run_engine(params, token).await?;

        if let Some(state) = &output.continuation {
            if let Err(err) = self.continuations.save(&job.id, state) {
                warn!(job_id = %job.id, error = %err, "Failed to save continuation state");
            }
        }

        Ok(FinishedGeneration {
            audio_path: format!("/audio/{filename}"),
            title,
            seed,
        })
    }

    /// Run the blocking generation call on the worker pool, bridging progress
    /// callbacks onto the event bus. The bus publish is non-blocking, so it
    /// is safe to call straight from the worker thread.
    async fn run_engine(
        &self,
        params: EngineParams,
        token: CancellationToken,
    ) -> Result<EngineOutput> {
        let engine = Arc::clone(&self.engine);
        let bus = Arc::clone(&self.bus);
        let progress_job_id = params.job_id.clone();

        tokio::task::spawn_blocking(move || {
            let progress = move |percent: u8, msg: &str| {
                bus.publish(
                    EVENT_JOB_PROGRESS,
                    serde_json::json!({
                        "job_id": progress_job_id,
                        "progress": percent,
                        "msg": msg,
                    }),
                );
            };
            engine.generate(&params, &progress, &token)
        })
        .await
        .context("generation worker panicked")?
    }

    /// Persist the terminal transition and publish the terminal event. A
    /// record deleted during generation means no writes and no event.
    async fn finish(&self, job_id: &str, outcome: Result<FinishedGeneration>) {
        match outcome {
            Ok(done) => match self.store.find(job_id) {
                Ok(Some(mut job)) => {
                    job.status = JobStatus::Completed;
                    job.audio_path = Some(done.audio_path.clone());
                    job.title = Some(done.title.clone());
                    job.seed = Some(done.seed);
                    if let Err(err) = self.store.save(&job) {
                        error!(job_id, error = %err, "Failed to persist completed transition");
                        return;
                    }
                    info!(job_id, audio_path = %done.audio_path, "Job completed");
                    self.bus.publish(
                        EVENT_JOB_UPDATE,
                        serde_json::json!({
                            "job_id": job_id,
                            "status": "completed",
                            "audio_path": done.audio_path,
                            "title": done.title,
                        }),
                    );
                    self.bus.publish(
                        EVENT_JOB_PROGRESS,
                        serde_json::json!({ "job_id": job_id, "progress": 100, "msg": "Done!" }),
                    );
                }
                Ok(None) => {
                    warn!(job_id, "Job was deleted during generation; discarding result");
                }
                Err(err) => {
                    error!(job_id, error = %err, "Failed to re-fetch job after generation");
                }
            },
            Err(generation_err) => {
                let aborted = generation_err.downcast_ref::<GenerationAborted>().is_some();
                if aborted {
                    info!(job_id, "Job aborted by cancellation");
                } else {
                    error!(job_id, error = %format!("{generation_err:#}"), "Job failed");
                }

                match self.store.find(job_id) {
                    Ok(Some(mut job)) => {
                        job.status = JobStatus::Failed;
                        job.error_message = Some(format!("{generation_err:#}"));
                        if let Err(err) = self.store.save(&job) {
                            error!(job_id, error = %err, "Failed to persist failed transition");
                            return;
                        }
                        self.bus.publish(
                            EVENT_JOB_UPDATE,
                            serde_json::json!({
                                "job_id": job_id,
                                "status": "failed",
                                "error": format!("{generation_err:#}"),
                            }),
                        );
                    }
                    Ok(None) => {
                        warn!(job_id, "Job was deleted during generation; discarding failure");
                    }
                    Err(err) => {
                        error!(job_id, error = %err, "Failed to re-fetch job after failure");
                    }
                }
            }
        }
    }

    fn broadcast_positions(bus: &EventBus, waiting: &AdmissionQueue) {
        let total = waiting.len();
        for (index, id) in waiting.ids().enumerate() {
            bus.publish(
                EVENT_JOB_QUEUE,
                serde_json::json!({ "job_id": id, "position": index + 1, "total": total }),
            );
        }
    }

    fn waiting(&self) -> MutexGuard<'_, AdmissionQueue> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use anyhow::bail;

    use crate::events::Subscription;
    use crate::job::GenerationRequest;
    use crate::store::MemoryJobStore;
    use crate::title::ModelEntry;

    use super::*;

    /// Engine whose `generate` blocks until the test releases that job id,
    /// recording invocation order and the params it was handed.
    #[derive(Default)]
    struct ControlledEngine {
        state: StdMutex<ControlState>,
    }

    #[derive(Default)]
    struct ControlState {
        started: Vec<String>,
        released: HashSet<String>,
        params_seen: Vec<EngineParams>,
        cleanups: usize,
    }

    impl ControlledEngine {
        fn release(&self, job_id: &str) {
            self.lock().released.insert(job_id.to_string());
        }

        fn started(&self) -> Vec<String> {
            self.lock().started.clone()
        }

        fn params_for(&self, job_id: &str) -> Option<EngineParams> {
            self.lock()
                .params_seen
                .iter()
                .find(|p| p.job_id == job_id)
                .cloned()
        }

        fn cleanups(&self) -> usize {
            self.lock().cleanups
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl GenerationEngine for ControlledEngine {
        fn generate(
            &self,
            params: &EngineParams,
            progress: &crate::engine::ProgressFn<'_>,
            cancel: &CancellationToken,
        ) -> Result<EngineOutput> {
            {
                let mut state = self.lock();
                state.started.push(params.job_id.clone());
                state.params_seen.push(params.clone());
            }
            progress(0, "starting");

            loop {
                if cancel.is_cancelled() {
                    return Err(GenerationAborted.into());
                }
                if self.lock().released.contains(&params.job_id) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }

            progress(100, "done");
            Ok(EngineOutput {
                audio_path: params.output_path.clone(),
                continuation: Some(b"continuation-state".to_vec()),
            })
        }

        fn release_cached_state(&self) -> Result<()> {
            self.lock().cleanups += 1;
            Ok(())
        }
    }

    struct StaticTitle;

    impl TitleAssist for StaticTitle {
        fn list_models(&self) -> Result<Vec<ModelEntry>> {
            bail!("no title service in tests");
        }

        fn generate_title(&self, _context: &str, _model: &str) -> Result<String> {
            bail!("no title service in tests");
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        store: Arc<MemoryJobStore>,
        engine: Arc<ControlledEngine>,
        scheduler: Arc<JobScheduler>,
        events: Subscription,
        continuations: ContinuationStore,
    }

    fn harness() -> Harness {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let store = Arc::new(MemoryJobStore::new());
        let engine = Arc::new(ControlledEngine::default());
        let bus = EventBus::new();
        let continuations = ContinuationStore::new(temp.path().join("continuations"));
        let scheduler = JobScheduler::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&engine) as Arc<dyn GenerationEngine>,
            Arc::new(StaticTitle),
            continuations.clone(),
            Arc::clone(&bus),
            temp.path().join("audio"),
            temp.path().join("ref_audio"),
        );
        let events = bus.subscribe();
        Harness {
            _temp: temp,
            store,
            engine,
            scheduler,
            events,
            continuations,
        }
    }

    fn submit_job(harness: &Harness, request: serde_json::Value) -> String {
        let request: GenerationRequest =
            serde_json::from_value(request).expect("request should deserialize");
        let job = Job::from_request(request);
        harness.store.save(&job).expect("save job");
        harness.scheduler.submit(&job.id);
        job.id
    }

    async fn wait_for_status(harness: &Harness, job_id: &str, expected: JobStatus) {
        for _ in 0..400 {
            if let Some(job) = harness.store.find(job_id).expect("find job") {
                if job.status == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} did not reach {expected:?} within timeout");
    }

    async fn wait_for_engine_start(harness: &Harness, job_id: &str) {
        for _ in 0..400 {
            if harness.engine.started().iter().any(|id| id == job_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine never started job {job_id}");
    }

    fn drain_events(events: &mut Subscription) -> Vec<crate::events::BusEvent> {
        let mut drained = Vec::new();
        while let Some(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn second_submission_waits_at_position_one() {
        let mut harness = harness();

        let first = submit_job(&harness, serde_json::json!({"prompt": "first", "duration_ms": 30000}));
        wait_for_engine_start(&harness, &first).await;
        drain_events(&mut harness.events);

        let second =
            submit_job(&harness, serde_json::json!({"prompt": "second", "duration_ms": 30000}));
        let queued: Vec<_> = drain_events(&mut harness.events)
            .into_iter()
            .filter(|e| e.kind == EVENT_JOB_QUEUED)
            .collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload["job_id"], second.as_str());
        assert_eq!(queued[0].payload["position"], 1);
        assert_eq!(queued[0].payload["total"], 1);

        harness.engine.release(&first);
        wait_for_status(&harness, &first, JobStatus::Completed).await;
        wait_for_status(&harness, &second, JobStatus::Processing).await;
        assert_eq!(harness.scheduler.queue_len(), 0);

        harness.engine.release(&second);
        wait_for_status(&harness, &second, JobStatus::Completed).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_job_processes_at_a_time() {
        let harness = harness();

        let ids: Vec<String> = (0..4)
            .map(|i| submit_job(&harness, serde_json::json!({"prompt": format!("job {i}")})))
            .collect();

        for id in &ids {
            wait_for_engine_start(&harness, id).await;
            let processing = harness
                .store
                .list()
                .expect("list jobs")
                .into_iter()
                .filter(|job| job.status == JobStatus::Processing)
                .count();
            assert!(processing <= 1, "more than one job in processing state");
            harness.engine.release(id);
            wait_for_status(&harness, id, JobStatus::Completed).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn gate_grants_follow_submission_order() {
        let harness = harness();

        let ids: Vec<String> = (0..5)
            .map(|i| submit_job(&harness, serde_json::json!({"prompt": format!("job {i}")})))
            .collect();

        for id in &ids {
            wait_for_engine_start(&harness, id).await;
            harness.engine.release(id);
            wait_for_status(&harness, id, JobStatus::Completed).await;
        }

        assert_eq!(harness.engine.started(), ids, "admission order diverged");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelling_a_queued_job_prevents_it_from_starting() {
        let mut harness = harness();

        let first = submit_job(&harness, serde_json::json!({"prompt": "first"}));
        wait_for_engine_start(&harness, &first).await;
        let second = submit_job(&harness, serde_json::json!({"prompt": "second"}));
        drain_events(&mut harness.events);

        assert!(harness.scheduler.cancel(&second));
        assert_eq!(harness.scheduler.queue_len(), 0);

        harness.engine.release(&first);
        wait_for_status(&harness, &first, JobStatus::Completed).await;
        // Give the withdrawn driver a chance to (incorrectly) run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!harness.engine.started().contains(&second));
        let record = harness
            .store
            .find(&second)
            .expect("find job")
            .expect("record remains");
        assert_eq!(record.status, JobStatus::Queued, "job never started");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelling_a_processing_job_fails_with_abort_error() {
        let mut harness = harness();

        let job_id = submit_job(&harness, serde_json::json!({"prompt": "cancel me"}));
        wait_for_engine_start(&harness, &job_id).await;
        drain_events(&mut harness.events);

        assert!(harness.scheduler.cancel(&job_id));
        wait_for_status(&harness, &job_id, JobStatus::Failed).await;

        let record = harness
            .store
            .find(&job_id)
            .expect("find job")
            .expect("record remains");
        assert!(record
            .error_message
            .as_deref()
            .is_some_and(|msg| msg.contains("aborted")));

        let failed_update = drain_events(&mut harness.events)
            .into_iter()
            .find(|e| e.kind == EVENT_JOB_UPDATE && e.payload["status"] == "failed")
            .expect("failed update published");
        assert_eq!(failed_update.payload["job_id"], job_id.as_str());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_of_unknown_or_terminal_job_returns_false() {
        let harness = harness();
        assert!(!harness.scheduler.cancel("unknown"));

        let job_id = submit_job(&harness, serde_json::json!({"prompt": "finish"}));
        wait_for_engine_start(&harness, &job_id).await;
        harness.engine.release(&job_id);
        wait_for_status(&harness, &job_id, JobStatus::Completed).await;
        assert!(!harness.scheduler.cancel(&job_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn record_deleted_while_queued_aborts_silently() {
        let mut harness = harness();

        let first = submit_job(&harness, serde_json::json!({"prompt": "first"}));
        wait_for_engine_start(&harness, &first).await;
        let second = submit_job(&harness, serde_json::json!({"prompt": "second"}));
        assert!(harness.store.delete(&second).expect("delete record"));
        drain_events(&mut harness.events);

        harness.engine.release(&first);
        wait_for_status(&harness, &first, JobStatus::Completed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!harness.engine.started().contains(&second));
        assert!(harness.store.find(&second).expect("find").is_none());
        let stray: Vec<_> = drain_events(&mut harness.events)
            .into_iter()
            .filter(|e| {
                e.kind == EVENT_JOB_UPDATE && e.payload["job_id"] == second.as_str()
            })
            .collect();
        assert!(stray.is_empty(), "no terminal event for a deleted record");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completion_persists_artifact_title_and_seed() {
        let mut harness = harness();

        let job_id = submit_job(&harness, serde_json::json!({"prompt": "finish me"}));
        wait_for_engine_start(&harness, &job_id).await;
        harness.engine.release(&job_id);
        wait_for_status(&harness, &job_id, JobStatus::Completed).await;

        let record = harness
            .store
            .find(&job_id)
            .expect("find job")
            .expect("record remains");
        assert_eq!(
            record.audio_path.as_deref(),
            Some(format!("/audio/song_{job_id}.wav").as_str())
        );
        assert_eq!(record.title.as_deref(), Some(FALLBACK_TITLE));
        assert!(record.seed.is_some(), "auto-drawn seed is persisted");

        let seen = harness
            .engine
            .params_for(&job_id)
            .expect("engine saw params");
        assert_eq!(Some(seen.seed), record.seed, "persisted seed is the one used");

        let completed = drain_events(&mut harness.events)
            .into_iter()
            .find(|e| e.kind == EVENT_JOB_UPDATE && e.payload["status"] == "completed")
            .expect("completed update published");
        assert_eq!(completed.payload["title"], FALLBACK_TITLE);

        assert!(harness.engine.cleanups() >= 1, "engine cleanup ran");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn caller_supplied_seed_is_used_verbatim() {
        let harness = harness();

        let job_id = submit_job(
            &harness,
            serde_json::json!({"prompt": "seeded", "seed": 4242}),
        );
        wait_for_engine_start(&harness, &job_id).await;
        harness.engine.release(&job_id);
        wait_for_status(&harness, &job_id, JobStatus::Completed).await;

        let seen = harness
            .engine
            .params_for(&job_id)
            .expect("engine saw params");
        assert_eq!(seen.seed, 4242);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn continuation_state_is_loaded_for_extension_jobs() {
        let harness = harness();

        harness
            .continuations
            .save("parent-job", b"parent state")
            .expect("save parent state");

        let job_id = submit_job(
            &harness,
            serde_json::json!({"prompt": "extend", "parent_job_id": "parent-job"}),
        );
        wait_for_engine_start(&harness, &job_id).await;
        harness.engine.release(&job_id);
        wait_for_status(&harness, &job_id, JobStatus::Completed).await;

        let seen = harness
            .engine
            .params_for(&job_id)
            .expect("engine saw params");
        assert_eq!(seen.continuation.as_deref(), Some(b"parent state".as_slice()));

        // The child run's own continuation state was persisted for future
        // extensions.
        let saved = harness
            .continuations
            .load(&job_id)
            .expect("load child state");
        assert_eq!(saved.as_deref(), Some(b"continuation-state".as_slice()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_continuation_state_is_not_an_error() {
        let harness = harness();

        let job_id = submit_job(
            &harness,
            serde_json::json!({"prompt": "extend", "parent_job_id": "no-such-parent"}),
        );
        wait_for_engine_start(&harness, &job_id).await;
        harness.engine.release(&job_id);
        wait_for_status(&harness, &job_id, JobStatus::Completed).await;

        let seen = harness
            .engine
            .params_for(&job_id)
            .expect("engine saw params");
        assert!(seen.continuation.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_reference_audio_is_ignored() {
        let harness = harness();

        let job_id = submit_job(
            &harness,
            serde_json::json!({"prompt": "styled", "ref_audio_id": "nope", "style_influence": 50.0}),
        );
        wait_for_engine_start(&harness, &job_id).await;
        harness.engine.release(&job_id);
        wait_for_status(&harness, &job_id, JobStatus::Completed).await;

        let seen = harness
            .engine
            .params_for(&job_id)
            .expect("engine saw params");
        assert!(seen.reference.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_tags_fall_back_to_default_sound() {
        let harness = harness();

        let job_id = submit_job(&harness, serde_json::json!({"prompt": "no tags", "tags": "  "}));
        wait_for_engine_start(&harness, &job_id).await;
        harness.engine.release(&job_id);
        wait_for_status(&harness, &job_id, JobStatus::Completed).await;

        let seen = harness
            .engine
            .params_for(&job_id)
            .expect("engine saw params");
        assert_eq!(seen.tags, FALLBACK_SOUND_TAGS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_signals_active_jobs_and_subscribers() {
        let mut harness = harness();

        let job_id = submit_job(&harness, serde_json::json!({"prompt": "shutdown victim"}));
        wait_for_engine_start(&harness, &job_id).await;

        harness.scheduler.shutdown();
        wait_for_status(&harness, &job_id, JobStatus::Failed).await;

        let kinds: Vec<String> = drain_events(&mut harness.events)
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.iter().any(|k| k == crate::events::EVENT_SHUTDOWN));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queue_positions_rebroadcast_on_every_change() {
        let mut harness = harness();

        let first = submit_job(&harness, serde_json::json!({"prompt": "first"}));
        wait_for_engine_start(&harness, &first).await;
        let second = submit_job(&harness, serde_json::json!({"prompt": "second"}));
        let third = submit_job(&harness, serde_json::json!({"prompt": "third"}));
        drain_events(&mut harness.events);

        // Removing the second job must rebroadcast the third at position 1.
        assert!(harness.scheduler.cancel(&second));
        let rebroadcast: Vec<_> = drain_events(&mut harness.events)
            .into_iter()
            .filter(|e| e.kind == EVENT_JOB_QUEUE)
            .collect();
        assert_eq!(rebroadcast.len(), 1);
        assert_eq!(rebroadcast[0].payload["job_id"], third.as_str());
        assert_eq!(rebroadcast[0].payload["position"], 1);
        assert_eq!(rebroadcast[0].payload["total"], 1);

        harness.engine.release(&first);
        wait_for_status(&harness, &first, JobStatus::Completed).await;
        wait_for_engine_start(&harness, &third).await;
        harness.engine.release(&third);
        wait_for_status(&harness, &third, JobStatus::Completed).await;
    }
}
