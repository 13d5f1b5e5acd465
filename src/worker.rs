//! Worker threads for running pipelines off the calling thread.
//!
//! Workers never see stage implementations. Each job carries the stage ids
//! and options of a pipeline, serialised to CBOR together with the asset,
//! and the worker resolves the ids against a shared [`Registry`].

use std::borrow::Cow;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::pipeline::{Pipeline, PipelineOutput, Step, run_steps};
use crate::stage::Registry;

/// How much parallelism a pass may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallel {
    /// One worker per core, keeping one core for the host.
    #[default]
    Auto,
    /// Always run in-process.
    Off,
    /// At most this many workers, never more than [`Parallel::Auto`] would use.
    Max(NonZeroUsize),
}

impl Parallel {
    pub fn available_workers(self, cores: usize) -> usize {
        let spare = cores.saturating_sub(1);

        match self {
            Parallel::Auto => spare,
            Parallel::Off => 0,
            Parallel::Max(max) => spare.min(max.get()),
        }
    }
}

impl From<bool> for Parallel {
    fn from(enabled: bool) -> Self {
        if enabled { Parallel::Auto } else { Parallel::Off }
    }
}

impl From<usize> for Parallel {
    fn from(max: usize) -> Self {
        NonZeroUsize::new(max).map_or(Parallel::Off, Parallel::Max)
    }
}

/// Where the pipelines of a pass are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    InProcess,
    Workers(usize),
}

impl Strategy {
    /// Sizes the pool as `min(misses, available workers)`. A pipeline with
    /// any stage unable to run on a worker runs in-process as a whole.
    pub fn choose(parallel: Parallel, cores: usize, misses: usize, pipeline: &Pipeline) -> Self {
        let workers = parallel.available_workers(cores).min(misses);

        if workers == 0 || !pipeline.supports_worker_threads() {
            Strategy::InProcess
        } else {
            Strategy::Workers(workers)
        }
    }
}

/// Number of cores available to this process, 1 when unknown.
pub fn available_cores() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerRequest<'a> {
    name: Cow<'a, str>,
    input: Cow<'a, str>,
    stages: Cow<'a, [Step]>,
}

type WorkerResponse = Result<PipelineOutput, PipelineError>;

struct Job {
    payload: Vec<u8>,
    reply: Sender<Vec<u8>>,
}

/// A fixed set of named OS threads pulling jobs from a shared queue.
pub(crate) struct WorkerPool {
    sender: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(size: usize, registry: Arc<Registry>) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut pool = Self {
            sender: Some(sender),
            threads: Vec::with_capacity(size),
        };

        for i in 0..size {
            let receiver = receiver.clone();
            let registry = registry.clone();

            // On error the partially built pool is dropped, which joins the
            // threads started so far.
            let handle = thread::Builder::new()
                .name(format!("chijimi-worker-{i}"))
                .spawn(move || work(&registry, receiver))?;

            pool.threads.push(handle);
        }

        tracing::debug!(size, "started worker pool");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Runs a pipeline on one of the workers and waits for the answer.
    pub fn submit(&self, name: &str, input: &str, stages: &[Step]) -> WorkerResponse {
        let payload = encode(&WorkerRequest {
            name: Cow::Borrowed(name),
            input: Cow::Borrowed(input),
            stages: Cow::Borrowed(stages),
        })?;

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| PipelineError::Transport("worker pool is shut down".into()))?;

        let (reply, response) = crossbeam_channel::bounded(1);
        sender
            .send(Job { payload, reply })
            .map_err(|_| PipelineError::Transport("no worker is accepting jobs".into()))?;

        let bytes = response
            .recv()
            .map_err(|_| PipelineError::Transport("worker exited without replying".into()))?;

        decode::<WorkerResponse>(&bytes)?
    }

    /// Closes the queue and waits for every worker to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        drop(self.sender.take());

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_owned();
            if handle.join().is_err() {
                tracing::warn!(%name, "worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn work(registry: &Registry, jobs: Receiver<Job>) {
    for job in jobs {
        let response: WorkerResponse = decode::<WorkerRequest<'static>>(&job.payload)
            .and_then(|request| run_steps(registry, &request.stages, &request.name, &request.input));

        // A response that can't be encoded is dropped along with the reply
        // channel, the caller sees it as a transport failure.
        let Ok(bytes) = encode(&response) else {
            continue;
        };

        let _ = job.reply.send(bytes);
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)
        .map_err(|e| PipelineError::Transport(format!("Couldn't encode message: {e}")))?;
    Ok(buffer)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PipelineError> {
    ciborium::from_reader(bytes)
        .map_err(|e| PipelineError::Transport(format!("Couldn't decode message: {e}")))
}

/// Runs pipelines for the tasks of a single pass, in-process or on a pool
/// that is started on first use and shut down with the dispatcher.
pub(crate) struct Dispatcher<'p> {
    pipeline: &'p Pipeline,
    strategy: Strategy,
    pool: OnceLock<Result<WorkerPool, String>>,
}

impl<'p> Dispatcher<'p> {
    pub fn new(pipeline: &'p Pipeline, strategy: Strategy) -> Self {
        Self {
            pipeline,
            strategy,
            pool: OnceLock::new(),
        }
    }

    pub fn run(&self, name: &str, input: &str) -> WorkerResponse {
        let Strategy::Workers(size) = self.strategy else {
            return self.pipeline.run(name, input);
        };

        let pool = self
            .pool
            .get_or_init(|| {
                WorkerPool::spawn(size, self.pipeline.registry().clone()).map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| PipelineError::Transport(format!("Couldn't start worker pool: {e}")))?;

        pool.submit(name, input, self.pipeline.steps())
    }

    pub fn pool_started(&self) -> bool {
        matches!(self.pool.get(), Some(Ok(_)))
    }

    pub fn shutdown(self) {
        if let Some(Ok(pool)) = self.pool.into_inner() {
            pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::pipeline::{Input, StageOptions};
    use crate::stage::Stage;

    fn pipeline(stages: Vec<Stage>) -> Pipeline {
        let ids = stages.iter().map(|s| s.id().to_owned()).collect();
        let mut registry = Registry::new();
        for stage in stages {
            registry.register(stage).unwrap();
        }
        Pipeline::new(Arc::new(registry), ids, StageOptions::default()).unwrap()
    }

    fn thread_name() -> Stage {
        Stage::new("thread", |input: Input<'_>, _: &Value| {
            let name = thread::current().name().unwrap_or("unnamed").to_owned();
            Ok(format!("{}@{name}", input.code))
        })
    }

    #[test]
    fn parallel_caps_at_spare_cores() {
        assert_eq!(Parallel::Auto.available_workers(4), 3);
        assert_eq!(Parallel::Auto.available_workers(1), 0);
        assert_eq!(Parallel::Off.available_workers(16), 0);
        assert_eq!(Parallel::from(2).available_workers(16), 2);
        assert_eq!(Parallel::from(8).available_workers(4), 3);
        assert_eq!(Parallel::from(0), Parallel::Off);
        assert_eq!(Parallel::from(true), Parallel::Auto);
    }

    #[test]
    fn strategy_is_sized_by_misses() {
        let pipeline = pipeline(vec![thread_name()]);

        assert_eq!(Strategy::choose(Parallel::Auto, 4, 5, &pipeline), Strategy::Workers(3));
        assert_eq!(Strategy::choose(Parallel::Auto, 4, 2, &pipeline), Strategy::Workers(2));
        assert_eq!(Strategy::choose(Parallel::Auto, 4, 0, &pipeline), Strategy::InProcess);
        assert_eq!(Strategy::choose(Parallel::Off, 4, 5, &pipeline), Strategy::InProcess);
        assert_eq!(Strategy::choose(Parallel::Auto, 1, 5, &pipeline), Strategy::InProcess);
    }

    #[test]
    fn any_stage_without_worker_support_forces_in_process() {
        let pipeline = pipeline(vec![
            thread_name(),
            Stage::new("local", |input: Input<'_>, _: &Value| Ok(input.code.to_owned()))
                .with_worker_threads(false),
        ]);

        assert_eq!(Strategy::choose(Parallel::Auto, 8, 5, &pipeline), Strategy::InProcess);
    }

    #[test]
    fn pipelines_run_on_named_workers() {
        let pipeline = pipeline(vec![thread_name()]);
        let dispatcher = Dispatcher::new(&pipeline, Strategy::Workers(2));

        assert!(!dispatcher.pool_started());
        let output = dispatcher.run("a.html", "x").unwrap();
        assert!(dispatcher.pool_started());
        assert!(output.code.starts_with("x@chijimi-worker-"), "{}", output.code);

        dispatcher.shutdown();
    }

    #[test]
    fn in_process_never_starts_a_pool() {
        let pipeline = pipeline(vec![thread_name()]);
        let dispatcher = Dispatcher::new(&pipeline, Strategy::InProcess);

        let output = dispatcher.run("a.html", "x").unwrap();
        assert!(!dispatcher.pool_started());
        assert!(!output.code.contains("chijimi-worker"));
    }

    #[test]
    fn stage_failures_cross_the_worker_boundary() {
        let pipeline = pipeline(vec![Stage::new(
            "fail",
            |_: Input<'_>, _: &Value| -> anyhow::Result<String> { anyhow::bail!("bad markup") },
        )]);

        let pool = WorkerPool::spawn(1, pipeline.registry().clone()).unwrap();
        assert_eq!(pool.size(), 1);

        match pool.submit("a.html", "x", pipeline.steps()) {
            Err(PipelineError::Stage { id, message, .. }) => {
                assert_eq!(id, "fail");
                assert!(message.contains("bad markup"));
            }
            other => panic!("expected stage failure, got {other:?}"),
        }

        pool.shutdown();
    }

    #[test]
    fn unknown_stage_on_worker_is_reported() {
        let pool = WorkerPool::spawn(1, Arc::new(Registry::new())).unwrap();
        let steps = [Step {
            id: "missing".into(),
            options: Value::Null,
        }];

        assert_eq!(
            pool.submit("a.html", "x", &steps),
            Err(PipelineError::UnknownStage("missing".into()))
        );
    }
}
