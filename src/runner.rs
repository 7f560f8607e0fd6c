use crate::config::RunnerConfig;
use crate::error::StepError;
use crate::evaluation::{Evaluator, score_trajectory};
use crate::frame::{Frame, FrameExtractor};
use crate::models::{
    Action, RunStatus, Scenario, ScenarioResult, StepFailure, StepResult, TerminationReason, VlmResponse,
};
use crate::prompt::{AccumulatingPrompt, PromptStrategy};
use crate::vlm::VlmBackend;
use crate::world_model::{ClipRequest, JobHandle, JobStatus, Seed, WorldModel};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Receives every step as soon as it is appended to a trajectory
pub trait StepObserver: Send + Sync {
    fn on_step(&self, scenario: &Scenario, step: &StepResult);
}

/// A rendered clip reduced to its last frame
struct RenderedClip {
    frame: Frame,
    /// Transient poll errors that were retried successfully
    recovered: Option<String>,
}

/// Drives the clip-chaining control loop for scenarios.
///
/// Each step renders a clip from the accumulated prompt, shows its last frame
/// to the VLM and feeds the chosen action into the next clip. The runner owns
/// no mutable state across runs, so one instance can execute many scenarios
/// concurrently.
pub struct ScenarioRunner {
    world: Arc<dyn WorldModel>,
    extractor: Arc<dyn FrameExtractor>,
    prompts: Arc<dyn PromptStrategy>,
    observer: Option<Arc<dyn StepObserver>>,
    settings: RunnerConfig,
}

impl ScenarioRunner {
    pub fn new(world: Arc<dyn WorldModel>, extractor: Arc<dyn FrameExtractor>, settings: RunnerConfig) -> Self {
        Self {
            world,
            extractor,
            prompts: Arc::new(AccumulatingPrompt),
            observer: None,
            settings,
        }
    }

    pub fn with_prompt_strategy(mut self, prompts: Arc<dyn PromptStrategy>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn settings(&self) -> &RunnerConfig {
        &self.settings
    }

    /// Run one scenario to completion and score it.
    ///
    /// Never fails: errors end the run as `Failed` with the steps collected so far.
    pub async fn execute(
        &self,
        scenario: &Scenario,
        vlm: &mut dyn VlmBackend,
        evaluators: &[Arc<dyn Evaluator>],
        step_budget: usize,
    ) -> ScenarioResult {
        let started = Instant::now();
        let mut result = ScenarioResult::new(scenario.clone());
        let limit = scenario.timeout().unwrap_or_else(|| self.settings.scenario_timeout());
        info!(scenario = %scenario.name, bound = scenario.step_bound(step_budget), "starting scenario");

        let outcome = timeout(limit, self.drive(scenario, vlm, step_budget, &mut result)).await;
        match outcome {
            Ok(Ok(reason)) => result.termination = reason,
            Ok(Err(failure)) => result.fail(failure.step_index, failure.error),
            Err(_) => {
                let step_index = result.steps.len();
                result.fail(step_index, StepError::scenario_timeout(limit));
            }
        }
        result.wall_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.log_outcome(&result);
        self.score(evaluators, result).await
    }

    /// Run independent scenarios concurrently, up to the configured limit.
    ///
    /// Every scenario gets its own backend from `backend_factory`; backends are
    /// closed after their run. Results keep the input order.
    pub async fn execute_all<F>(
        &self,
        scenarios: &[Scenario],
        mut backend_factory: F,
        evaluators: &[Arc<dyn Evaluator>],
        step_budget: usize,
    ) -> Vec<ScenarioResult>
    where
        F: FnMut(&Scenario) -> anyhow::Result<Box<dyn VlmBackend>>,
    {
        let concurrency = self.settings.concurrency.max(1);
        let runs = scenarios.iter().map(|scenario| {
            let backend = backend_factory(scenario);
            async move {
                match backend {
                    Ok(mut backend) => {
                        let result = self.execute(scenario, backend.as_mut(), evaluators, step_budget).await;
                        backend.close().await;
                        result
                    }
                    Err(e) => {
                        warn!(scenario = %scenario.name, error = %format!("{:#}", e), "could not create VLM backend");
                        let mut result = ScenarioResult::new(scenario.clone());
                        result.fail(
                            0,
                            StepError::Backend {
                                message: format!("{:#}", e),
                            },
                        );
                        self.score(evaluators, result).await
                    }
                }
            }
        });

        stream::iter(runs).buffered(concurrency).collect().await
    }

    /// Attach evaluator scores; the verdict is derived from them
    async fn score(&self, evaluators: &[Arc<dyn Evaluator>], mut result: ScenarioResult) -> ScenarioResult {
        let scores = score_trajectory(evaluators, &result).await;
        result.record_scores(scores);
        result
    }

    /// The step loop; returns why the run stopped or the step that failed
    async fn drive(
        &self,
        scenario: &Scenario,
        vlm: &mut dyn VlmBackend,
        step_budget: usize,
        result: &mut ScenarioResult,
    ) -> Result<TerminationReason, StepFailure> {
        let bound = scenario.step_bound(step_budget);
        let mut history: Vec<Action> = Vec::new();
        let mut step_index = 0;

        while step_index < bound {
            let prompt = self.prompts.build(scenario, step_index, &history);
            let request = self.clip_request(scenario, &prompt, &history, result);
            let clip = self
                .render(&request)
                .await
                .map_err(|error| StepFailure { step_index, error })?;
            let frame = Arc::new(clip.frame);
            result.final_frame = Some(Arc::clone(&frame));

            let response = self
                .decide(vlm, &frame, step_index, scenario, &history)
                .await
                .map_err(|error| StepFailure { step_index, error })?;
            result.add_usage(&response);

            if response.action.is_terminal() {
                debug!(scenario = %scenario.name, step = step_index, "VLM signalled done");
                return Ok(TerminationReason::Done);
            }

            let done = response.done;
            let mut step = StepResult::new(step_index, prompt, frame, response);
            step.error = clip.recovered;
            debug!(
                scenario = %scenario.name,
                step = step_index,
                action = %step.action().describe(),
                "step recorded"
            );
            if let Some(observer) = &self.observer {
                observer.on_step(scenario, &step);
            }
            history.push(step.action().clone());
            result.push_step(step);
            step_index += 1;

            if done {
                self.render_outcome(scenario, &history, result).await?;
                return Ok(TerminationReason::Done);
            }
        }

        self.render_outcome(scenario, &history, result).await?;
        Ok(TerminationReason::MaxSteps)
    }

    /// Render the clip showing the consequence of the last recorded action
    async fn render_outcome(
        &self,
        scenario: &Scenario,
        history: &[Action],
        result: &mut ScenarioResult,
    ) -> Result<(), StepFailure> {
        if history.is_empty() {
            return Ok(());
        }
        let step_index = result.steps.len();
        let prompt = self.prompts.build(scenario, step_index, history);
        let request = self.clip_request(scenario, &prompt, history, result);
        let clip = self
            .render(&request)
            .await
            .map_err(|error| StepFailure { step_index, error })?;
        result.final_frame = Some(Arc::new(clip.frame));
        Ok(())
    }

    /// Build the world-model request for the next clip
    fn clip_request(&self, scenario: &Scenario, prompt: &str, history: &[Action], result: &ScenarioResult) -> ClipRequest {
        let seed = match &result.final_frame {
            Some(frame) => Some(Seed::Frame(Arc::clone(frame))),
            None => scenario.image.clone().map(Seed::Reference),
        };
        ClipRequest {
            prompt: prompt.to_string(),
            prior_action: history.last().cloned(),
            seed,
            portrait: scenario.portrait,
        }
    }

    /// Generate a clip and extract its last frame
    async fn render(&self, request: &ClipRequest) -> Result<RenderedClip, StepError> {
        let clip_timeout = self.settings.clip_timeout();
        let (clip, recovered) = match timeout(clip_timeout, self.generate(request)).await {
            Ok(generated) => generated?,
            Err(_) => return Err(StepError::adapter_timeout(clip_timeout)),
        };
        let frame = self.extractor.extract_last_frame(&clip).await?;
        Ok(RenderedClip { frame, recovered })
    }

    /// Start, await and download one clip
    async fn generate(&self, request: &ClipRequest) -> Result<(Vec<u8>, Option<String>), StepError> {
        let job = self.world.start_clip(request).await?;
        let recovered = self.wait_until_ready(&job).await?;
        let clip = self.world.fetch_clip(&job).await?;
        Ok((clip, recovered))
    }

    /// Poll the job with exponential backoff until it is ready.
    ///
    /// Up to `poll_retries` consecutive transient errors are tolerated; a
    /// reported failure or a permanent error ends the wait immediately.
    async fn wait_until_ready(&self, job: &JobHandle) -> Result<Option<String>, StepError> {
        let mut delay = self.settings.poll_interval();
        let mut consecutive_errors = 0;
        let mut recovered = Vec::new();

        loop {
            match self.world.poll_status(job).await {
                Ok(JobStatus::Ready) => {
                    return Ok(if recovered.is_empty() {
                        None
                    } else {
                        Some(recovered.join("; "))
                    });
                }
                Ok(JobStatus::Failed(message)) => return Err(StepError::Adapter { message }),
                Ok(JobStatus::Pending) => consecutive_errors = 0,
                Err(e) if e.is_transient() && consecutive_errors < self.settings.poll_retries => {
                    consecutive_errors += 1;
                    warn!(
                        job_id = %job,
                        error = %e,
                        retry = consecutive_errors,
                        backoff_ms = delay.as_millis() as u64,
                        "retrying clip status poll"
                    );
                    recovered.push(e.to_string());
                }
                Err(e) => return Err(e.into()),
            }

            sleep(delay).await;
            delay = self.next_delay(delay);
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let cap = self.settings.max_poll_interval();
        let factor = self.settings.poll_backoff.max(1.0);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).map_or(cap, |next| next.min(cap))
    }

    /// Ask the VLM for the next action within the decision timeout
    async fn decide(
        &self,
        vlm: &mut dyn VlmBackend,
        frame: &Frame,
        step_index: usize,
        scenario: &Scenario,
        history: &[Action],
    ) -> Result<VlmResponse, StepError> {
        let limit = self.settings.decide_timeout();
        match timeout(limit, vlm.decide(frame, step_index, scenario, history)).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(StepError::backend_timeout(limit)),
        }
    }

    /// Log how a run ended
    fn log_outcome(&self, result: &ScenarioResult) {
        match (&result.status, &result.failure) {
            (RunStatus::Failed, Some(failure)) => warn!(
                scenario = %result.scenario.name,
                step = failure.step_index,
                steps = result.steps.len(),
                error = %failure.error,
                "scenario failed"
            ),
            _ => info!(
                scenario = %result.scenario.name,
                steps = result.steps.len(),
                termination = result.termination.as_str(),
                wall_time_ms = result.wall_time_ms,
                "scenario finished"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StillImageExtractor;
    use crate::vlm::ReplayBackend;
    use crate::world_model::WorldModelError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Status sequence served for one clip
    #[derive(Clone)]
    enum Poll {
        Pending,
        Ready,
        Failed,
        Transient,
        Permanent,
    }

    /// World model that serves scripted poll sequences, then `Ready`
    struct ScriptedWorld {
        polls: Mutex<VecDeque<Poll>>,
        requests: Mutex<Vec<ClipRequest>>,
    }

    impl ScriptedWorld {
        fn new(polls: Vec<Poll>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorldModel for ScriptedWorld {
        async fn start_clip(&self, request: &ClipRequest) -> Result<JobHandle, WorldModelError> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            Ok(JobHandle(format!("job-{}", requests.len())))
        }

        async fn poll_status(&self, _job: &JobHandle) -> Result<JobStatus, WorldModelError> {
            match self.polls.lock().unwrap().pop_front().unwrap_or(Poll::Ready) {
                Poll::Pending => Ok(JobStatus::Pending),
                Poll::Ready => Ok(JobStatus::Ready),
                Poll::Failed => Ok(JobStatus::Failed("render crashed".to_string())),
                Poll::Transient => Err(WorldModelError::Transient("HTTP 503".to_string())),
                Poll::Permanent => Err(WorldModelError::Rejected("HTTP 403".to_string())),
            }
        }

        async fn fetch_clip(&self, _job: &JobHandle) -> Result<Vec<u8>, WorldModelError> {
            Ok(Frame::solid(4, 4, [10, 20, 30]).to_png().unwrap())
        }
    }

    fn fast_settings() -> RunnerConfig {
        RunnerConfig {
            poll_interval_ms: 1,
            max_poll_interval_ms: 4,
            poll_retries: 2,
            ..RunnerConfig::default()
        }
    }

    fn runner(world: Arc<ScriptedWorld>) -> ScenarioRunner {
        ScenarioRunner::new(world, Arc::new(StillImageExtractor), fast_settings())
    }

    #[tokio::test]
    async fn test_pending_polls_then_ready() {
        let world = Arc::new(ScriptedWorld::new(vec![Poll::Pending, Poll::Pending, Poll::Ready]));
        let runner = runner(world.clone());
        let mut vlm = ReplayBackend::from_actions(vec![Action::new("turn")]);

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.termination, TerminationReason::Done);
        assert_eq!(result.steps.len(), 1);
        assert!(result.steps[0].error.is_none());
    }

    #[tokio::test]
    async fn test_transient_errors_within_bound_are_recovered() {
        let world = Arc::new(ScriptedWorld::new(vec![Poll::Transient, Poll::Transient, Poll::Ready]));
        let runner = runner(world);
        let mut vlm = ReplayBackend::from_actions(vec![Action::new("turn")]);

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert_eq!(result.status, RunStatus::Completed);
        let noted = result.steps[0].error.as_deref().unwrap();
        assert!(noted.contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_transient_errors_beyond_bound_fail() {
        let world = Arc::new(ScriptedWorld::new(vec![Poll::Transient, Poll::Transient, Poll::Transient]));
        let runner = runner(world);
        let mut vlm = ReplayBackend::from_actions(vec![Action::new("turn")]);

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.termination, TerminationReason::Error);
        assert!(result.steps.is_empty());
        assert_eq!(vlm.calls(), 0);
    }

    #[tokio::test]
    async fn test_permanent_poll_error_is_not_retried() {
        let world = Arc::new(ScriptedWorld::new(vec![Poll::Permanent, Poll::Ready]));
        let runner = runner(world.clone());
        let mut vlm = ReplayBackend::default();

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error_message().unwrap().contains("HTTP 403"));
        assert_eq!(world.polls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_on_first_poll() {
        let world = Arc::new(ScriptedWorld::new(vec![Poll::Failed]));
        let runner = runner(world);
        let mut vlm = ReplayBackend::default();

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert!(result.steps.is_empty());
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.step_index, 0);
        assert!(matches!(failure.error, StepError::Adapter { ref message } if message == "render crashed"));
    }

    #[tokio::test]
    async fn test_clip_timeout_is_adapter_timeout() {
        let world = Arc::new(ScriptedWorld::new(vec![Poll::Pending; 10_000]));
        let settings = RunnerConfig {
            clip_timeout_secs: 0.05,
            ..fast_settings()
        };
        let runner = ScenarioRunner::new(world, Arc::new(StillImageExtractor), settings);
        let mut vlm = ReplayBackend::default();

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert_eq!(result.termination, TerminationReason::Timeout);
        assert!(matches!(
            result.failure.as_ref().map(|f| &f.error),
            Some(StepError::AdapterTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_decide_timeout_is_backend_timeout() {
        let world = Arc::new(ScriptedWorld::new(vec![]));
        let settings = RunnerConfig {
            decide_timeout_secs: 0.02,
            ..fast_settings()
        };
        let runner = ScenarioRunner::new(world, Arc::new(StillImageExtractor), settings);
        let mut vlm = ReplayBackend::from_actions(vec![Action::new("turn")]).with_delay(Duration::from_secs(5));

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(matches!(
            result.failure.as_ref().map(|f| &f.error),
            Some(StepError::BackendTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_requests_chain_prompt_action_and_frame() {
        let world = Arc::new(ScriptedWorld::new(vec![]));
        let runner = runner(world.clone());
        let mut scenario = Scenario::new("s", "A table").with_max_steps(2);
        scenario.image = Some("https://img/start.png".to_string());
        let mut vlm = ReplayBackend::from_actions(vec![
            Action::new("move_forward").with_param("distance", 0.5),
            Action::new("pick_up").with_param("object", "cup"),
        ]);

        let result = runner.execute(&scenario, &mut vlm, &[], 10).await;
        assert_eq!(result.termination, TerminationReason::MaxSteps);

        let requests = world.requests.lock().unwrap();
        // two steps plus the closing clip for the last action
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].prompt, "A table");
        assert!(requests[0].prior_action.is_none());
        assert!(matches!(requests[0].seed, Some(Seed::Reference(ref url)) if url == "https://img/start.png"));
        assert_eq!(requests[1].prompt, "A table\n\nmove_forward distance=0.5");
        assert_eq!(requests[1].prior_action.as_ref().map(|a| a.name.as_str()), Some("move_forward"));
        assert!(matches!(requests[1].seed, Some(Seed::Frame(_))));
        assert_eq!(requests[2].prior_action.as_ref().map(|a| a.name.as_str()), Some("pick_up"));
    }

    #[tokio::test]
    async fn test_done_flag_on_regular_action_is_recorded() {
        let world = Arc::new(ScriptedWorld::new(vec![]));
        let runner = runner(world);
        let mut vlm = ReplayBackend::new(vec![VlmResponse::finished(Action::new("place").with_param("location", "shelf"))]);

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert_eq!(result.termination, TerminationReason::Done);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].action().name, "place");
    }

    #[tokio::test]
    async fn test_usage_totals_include_terminal_call() {
        let world = Arc::new(ScriptedWorld::new(vec![]));
        let runner = runner(world);
        let mut vlm = ReplayBackend::new(vec![
            VlmResponse::new(Action::new("turn")).with_cost(0.01).with_latency_ms(100.0),
            VlmResponse::finished(Action::new("done")).with_cost(0.02).with_latency_ms(50.0),
        ]);

        let result = runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 5).await;
        assert_eq!(result.steps.len(), 1);
        assert!((result.total_cost_usd - 0.03).abs() < 1e-12);
        assert!((result.total_latency_ms - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_backoff_is_capped() {
        let runner = runner(Arc::new(ScriptedWorld::new(vec![])));
        let mut delay = Duration::from_millis(1);
        for _ in 0..10 {
            delay = runner.next_delay(delay);
        }
        assert_eq!(delay, Duration::from_millis(4));
    }

    #[test]
    fn test_huge_backoff_factor_hits_cap() {
        for poll_backoff in [1e20, f64::INFINITY, f64::NAN] {
            let settings = RunnerConfig {
                poll_backoff,
                ..fast_settings()
            };
            let runner = ScenarioRunner::new(
                Arc::new(ScriptedWorld::new(vec![])),
                Arc::new(StillImageExtractor),
                settings,
            );
            let next = runner.next_delay(Duration::from_secs(3600));
            assert!(next <= Duration::from_millis(4), "poll_backoff = {}", poll_backoff);
        }
    }

    struct Recorder(Mutex<Vec<usize>>);

    impl StepObserver for Recorder {
        fn on_step(&self, _scenario: &Scenario, step: &StepResult) {
            self.0.lock().unwrap().push(step.step_index);
        }
    }

    #[tokio::test]
    async fn test_observer_sees_every_step() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let runner = runner(Arc::new(ScriptedWorld::new(vec![]))).with_observer(recorder.clone());
        let mut vlm = ReplayBackend::from_actions(vec![Action::new("a"), Action::new("b"), Action::new("c")]);

        runner.execute(&Scenario::new("s", "p"), &mut vlm, &[], 10).await;
        assert_eq!(*recorder.0.lock().unwrap(), vec![0, 1, 2]);
    }
}
