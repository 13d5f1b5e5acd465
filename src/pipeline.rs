//! Sequential execution of minimizer stages over a single asset.

use std::backtrace::BacktraceStatus;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::{ConfigError, PipelineError};
use crate::stage::{Registry, Stage};

/// The named input handed to every stage, the current code of a single
/// asset.
#[derive(Debug, Clone, Copy)]
pub struct Input<'a> {
    /// Name of the asset being minimized.
    pub name: &'a str,
    /// Output of the previous stage, or the asset's source for the first one.
    pub code: &'a str,
}

/// A warning or an error reported by a minimizer stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Problem {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

impl Problem {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Attaches a source location.
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    /// Names the tool that reported the problem.
    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Reads a problem from loosely-typed JSON: either a bare string or an
    /// object carrying at least a `message`. Anything else is rendered as
    /// its JSON text.
    fn from_json(value: Value) -> Self {
        match value {
            Value::String(message) => Problem::new(message),
            Value::Object(ref map) if map.get("message").is_some_and(Value::is_string) => {
                serde_json::from_value(value.clone()).unwrap_or_else(|_| {
                    Problem::new(map["message"].as_str().unwrap_or_default())
                })
            }
            other => Problem::new(other.to_string()),
        }
    }
}

impl From<&str> for Problem {
    fn from(message: &str) -> Self {
        Problem::new(message)
    }
}

impl From<String> for Problem {
    fn from(message: String) -> Self {
        Problem::new(message)
    }
}

impl From<anyhow::Error> for Problem {
    fn from(error: anyhow::Error) -> Self {
        Self {
            message: format!("{error:#}"),
            stack: stack_of(&error),
            ..Default::default()
        }
    }
}

/// Structured output of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MinimizedResult {
    pub code: String,
    #[serde(default)]
    pub warnings: Vec<Problem>,
    #[serde(default)]
    pub errors: Vec<Problem>,
}

impl MinimizedResult {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn warning(mut self, warning: impl Into<Problem>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn error(mut self, error: impl Into<Problem>) -> Self {
        self.errors.push(error.into());
        self
    }

    /// Accepts a JSON string, or an object with a `code` string and
    /// optional `warnings` and `errors` arrays. Any other value is handed
    /// back unchanged.
    pub fn from_json(value: Value) -> Result<Self, Value> {
        match value {
            Value::String(code) => Ok(MinimizedResult::new(code)),
            Value::Object(mut map) => match map.remove("code") {
                Some(Value::String(code)) => Ok(Self {
                    code,
                    warnings: problems(map.remove("warnings")),
                    errors: problems(map.remove("errors")),
                }),
                Some(other) => {
                    map.insert("code".into(), other);
                    Err(Value::Object(map))
                }
                None => Err(Value::Object(map)),
            },
            other => Err(other),
        }
    }
}

fn problems(value: Option<Value>) -> Vec<Problem> {
    match value {
        Some(Value::Array(items)) => items.into_iter().map(Problem::from_json).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![Problem::from_json(other)],
    }
}

/// Everything a stage is allowed to return.
///
/// Stages written in Rust usually return plain code or a
/// [`MinimizedResult`]; stages bridging to external tools may return raw
/// JSON, which is validated before the next stage runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Minified {
    Code(String),
    Result(MinimizedResult),
    Json(Value),
}

impl Minified {
    fn normalize(self) -> Option<MinimizedResult> {
        match self {
            Minified::Code(code) => Some(MinimizedResult::new(code)),
            Minified::Result(result) => Some(result),
            Minified::Json(value) => MinimizedResult::from_json(value).ok(),
        }
    }
}

impl From<String> for Minified {
    fn from(code: String) -> Self {
        Minified::Code(code)
    }
}

impl From<&str> for Minified {
    fn from(code: &str) -> Self {
        Minified::Code(code.to_owned())
    }
}

impl From<MinimizedResult> for Minified {
    fn from(result: MinimizedResult) -> Self {
        Minified::Result(result)
    }
}

impl From<Value> for Minified {
    fn from(value: Value) -> Self {
        Minified::Json(value)
    }
}

/// Final output of a pipeline: the last stage's code, plus every warning and
/// error reported along the way, in stage order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub code: String,
    pub warnings: Vec<Problem>,
    pub errors: Vec<Problem>,
}

/// Options passed to the stages of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOptions {
    /// One value, handed to every stage.
    Shared(Value),
    /// One value per stage, matched by position. Stages past the end of
    /// the list get `null`.
    PerStage(Vec<Value>),
}

impl Default for StageOptions {
    fn default() -> Self {
        StageOptions::Shared(Value::Object(Map::new()))
    }
}

/// A stage reference with its resolved options, the serialisable half of a
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Step {
    pub id: String,
    pub options: Value,
}

/// An ordered list of minimizer stages, validated against a [`Registry`].
#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<Registry>,
    steps: Vec<Step>,
    identity: Hash32,
}

impl Pipeline {
    pub fn new(
        registry: Arc<Registry>,
        ids: Vec<String>,
        options: StageOptions,
    ) -> Result<Self, ConfigError> {
        if ids.is_empty() {
            return Err(ConfigError::EmptyPipeline);
        }

        if let Some(unknown) = ids.iter().find(|id| registry.get(id).is_none()) {
            return Err(ConfigError::UnknownStage(unknown.clone()));
        }

        let options = match options {
            StageOptions::Shared(value) => vec![value; ids.len()],
            StageOptions::PerStage(mut values) if values.len() <= ids.len() => {
                values.resize(ids.len(), Value::Null);
                values
            }
            StageOptions::PerStage(values) => {
                return Err(ConfigError::OptionsLength {
                    expected: ids.len(),
                    actual: values.len(),
                });
            }
        };

        let steps: Vec<_> = ids
            .into_iter()
            .zip(options)
            .map(|(id, options)| Step { id, options })
            .collect();

        let mut hasher = Blake3Hasher::default();
        for step in &steps {
            hasher
                .chunk(step.id.as_bytes())
                .chunk(&serde_json::to_vec(&step.options)?);
        }

        Ok(Self {
            registry,
            steps,
            identity: hasher.into(),
        })
    }

    /// Fingerprint of the stage ids and their options. Part of every cache
    /// key, so that reconfiguring the pipeline invalidates cached output.
    pub fn identity(&self) -> Hash32 {
        self.identity
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.id.as_str())
    }

    /// Whether every stage may run on a worker thread.
    pub fn supports_worker_threads(&self) -> bool {
        self.steps.iter().all(|step| {
            self.registry
                .get(&step.id)
                .is_some_and(Stage::supports_worker_threads)
        })
    }

    /// Runs the whole pipeline on the calling thread.
    pub fn run(&self, name: &str, input: &str) -> Result<PipelineOutput, PipelineError> {
        run_steps(&self.registry, &self.steps, name, input)
    }

    pub(crate) fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Resolves every step through the registry and runs them in order. Shared
/// by the in-process path and the worker threads.
pub(crate) fn run_steps(
    registry: &Registry,
    steps: &[Step],
    name: &str,
    input: &str,
) -> Result<PipelineOutput, PipelineError> {
    let stages = steps
        .iter()
        .map(|step| {
            registry
                .get(&step.id)
                .map(|stage| (stage, &step.options))
                .ok_or_else(|| PipelineError::UnknownStage(step.id.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut output = PipelineOutput {
        code: input.to_owned(),
        ..Default::default()
    };

    for (index, (stage, options)) in stages.into_iter().enumerate() {
        let input = Input {
            name,
            code: &output.code,
        };

        let called = panic::catch_unwind(AssertUnwindSafe(|| stage.call(input, options)));

        let minified = match called {
            Ok(Ok(minified)) => minified,
            Ok(Err(error)) => {
                return Err(PipelineError::Stage {
                    index,
                    id: stage.id().to_string(),
                    message: format!("{error:#}"),
                    stack: stack_of(&error),
                });
            }
            Err(panic) => {
                return Err(PipelineError::Stage {
                    index,
                    id: stage.id().to_string(),
                    message: panic_message(panic),
                    stack: None,
                });
            }
        };

        let Some(result) = minified.normalize() else {
            return Err(PipelineError::Contract {
                index,
                id: stage.id().to_string(),
            });
        };

        output.code = result.code;
        output.warnings.extend(result.warnings);
        output.errors.extend(result.errors);
    }

    Ok(output)
}

fn stack_of(error: &anyhow::Error) -> Option<String> {
    let backtrace = error.backtrace();
    (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Stage panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Stage panicked: {s}")
    } else {
        String::from("Stage panicked with unknown payload")
    }
}
