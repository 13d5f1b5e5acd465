//! Minimizer stages and the registry that names them.

mod command;
#[cfg(feature = "html")]
mod html;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use serde_json::Value;

use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::pipeline::{Input, Minified};

pub use command::COMMAND;
#[cfg(feature = "html")]
pub use html::HTML;

type MinifyFn = dyn Fn(Input<'_>, &Value) -> anyhow::Result<Minified> + Send + Sync;

/// A single minimizer: a named function from code to minified code.
///
/// Stages are registered once under a unique id and referenced by that id
/// from pipeline configuration, which lets worker threads resolve them
/// without shipping closures around.
#[derive(Clone)]
pub struct Stage {
    id: ArcStr,
    func: Arc<MinifyFn>,
    supports_worker_threads: bool,
}

impl Stage {
    pub fn new<F, R>(id: impl Into<ArcStr>, func: F) -> Self
    where
        F: Fn(Input<'_>, &Value) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<Minified>,
    {
        Self {
            id: id.into(),
            func: Arc::new(
                move |input: Input<'_>, options: &Value| -> anyhow::Result<Minified> {
                    func(input, options).map(Into::into)
                },
            ),
            supports_worker_threads: true,
        }
    }

    /// Wraps an asynchronous minimizer. Every call blocks on the future
    /// using a single-threaded Tokio runtime owned by the stage.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let stage = Stage::from_async("remote", |input, _options| async move {
    ///     let code = minify_remotely(&input.code).await?;
    ///     Ok(code)
    /// })?;
    /// ```
    #[cfg(feature = "tokio")]
    pub fn from_async<F, Fut, R>(id: impl Into<ArcStr>, func: F) -> std::io::Result<Self>
    where
        F: Fn(OwnedInput, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>>,
        R: Into<Minified>,
    {
        let executor = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self::new(id, move |input: Input<'_>, options: &Value| {
            let input = OwnedInput {
                name: input.name.to_owned(),
                code: input.code.to_owned(),
            };
            executor.block_on(func(input, options.clone()))
        }))
    }

    /// Marks whether this stage may be executed on a worker thread. A single
    /// stage opting out forces the whole batch to run in-process.
    pub fn supports_worker_threads(&self) -> bool {
        self.supports_worker_threads
    }

    pub fn with_worker_threads(mut self, supported: bool) -> Self {
        self.supports_worker_threads = supported;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn call(&self, input: Input<'_>, options: &Value) -> anyhow::Result<Minified> {
        (self.func)(input, options)
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("supports_worker_threads", &self.supports_worker_threads)
            .finish_non_exhaustive()
    }
}

/// Owned copy of [`Input`], handed to asynchronous stages.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct OwnedInput {
    pub name: String,
    pub code: String,
}

static BUILTIN: LazyLock<Registry> = LazyLock::new(|| {
    let mut registry = Registry::new();
    registry.insert(command::stage());
    #[cfg(feature = "html")]
    registry.insert(html::stage());
    registry
});

/// Lookup table of stages by id.
#[derive(Clone, Default, Debug)]
pub struct Registry {
    stages: HashMap<ArcStr, Stage>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the stages shipped with this crate.
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Adds a stage. Registering the very same stage twice is a no-op, a
    /// different stage under a taken id is an error.
    pub fn register(&mut self, stage: Stage) -> Result<(), ConfigError> {
        if let Some(existing) = self.stages.get(&stage.id) {
            if Arc::ptr_eq(&existing.func, &stage.func) {
                return Ok(());
            }
            return Err(ConfigError::DuplicateStage(stage.id.to_string()));
        }

        self.insert(stage);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Stage> {
        self.stages.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.stages.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(|id| &**id)
    }

    fn insert(&mut self, stage: Stage) {
        self.stages.insert(stage.id.clone(), stage);
    }
}
