//! Building a [`Minimizer`], either programmatically or from JSON options.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::pipeline::{Pipeline, StageOptions};
use crate::rules::{Matcher, Rule, Rules};
use crate::stage::{Registry, Stage};
use crate::worker::{Parallel, available_cores};

/// A configured minimizer: which assets to select, how to minify them and
/// how much parallelism to use. Run it with [`Minimizer::optimize`].
#[derive(Debug, Clone)]
pub struct Minimizer {
    pub(crate) matcher: Matcher,
    pub(crate) pipeline: Pipeline,
    pub(crate) parallel: Parallel,
    pub(crate) cores: usize,
}

impl Minimizer {
    pub fn builder() -> MinimizerBuilder {
        MinimizerBuilder::default()
    }

    /// Resolves declarative options against a registry of stages.
    pub fn from_options(options: Options, registry: &Registry) -> Result<Self, ConfigError> {
        let mut builder = Minimizer::builder().registry(registry.clone());

        if let Some(test) = options.test {
            builder.test = Some(compile(test)?);
        }
        if let Some(include) = options.include {
            builder.include = Some(compile(include)?);
        }
        if let Some(exclude) = options.exclude {
            builder.exclude = Some(compile(exclude)?);
        }

        if let Some(parallel) = options.parallel {
            builder = builder.parallel(parallel);
        }

        for id in options.minify.map(OneOrMany::into_vec).unwrap_or_default() {
            builder = builder.minify(id);
        }

        builder = match options.minimizer_options {
            Some(Value::Array(values)) => builder.stage_options(values),
            Some(value) => builder.options(value),
            None => builder,
        };

        builder.build()
    }

    /// Whether an asset with this name would be selected, ignoring its
    /// `minimized` flag.
    pub fn matches(&self, name: &str) -> bool {
        self.matcher.matches(name)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn parallel(&self) -> Parallel {
        self.parallel
    }

    pub fn cores(&self) -> usize {
        self.cores
    }
}

/// Builder for [`Minimizer`]. Errors are collected along the way and
/// reported by [`MinimizerBuilder::build`].
pub struct MinimizerBuilder {
    registry: Registry,
    custom: Vec<Stage>,
    stages: Vec<String>,
    options: StageOptions,
    test: Option<Rules>,
    include: Option<Rules>,
    exclude: Option<Rules>,
    parallel: Parallel,
    cores: Option<usize>,
    error: Option<ConfigError>,
}

impl Default for MinimizerBuilder {
    fn default() -> Self {
        Self {
            registry: Registry::builtin(),
            custom: Vec::new(),
            stages: Vec::new(),
            options: StageOptions::default(),
            test: None,
            include: None,
            exclude: None,
            parallel: Parallel::default(),
            cores: None,
            error: None,
        }
    }
}

impl MinimizerBuilder {
    /// Replaces the registry stage ids are resolved against. Defaults to
    /// [`Registry::builtin`].
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Appends a custom stage to the pipeline, registering it under its id.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage.id().to_owned());
        self.custom.push(stage);
        self
    }

    /// Appends an already registered stage to the pipeline.
    pub fn minify(mut self, id: impl Into<String>) -> Self {
        self.stages.push(id.into());
        self
    }

    /// Options handed to every stage.
    pub fn options(mut self, options: Value) -> Self {
        self.options = StageOptions::Shared(options);
        self
    }

    /// Options for each stage, by position.
    pub fn stage_options(mut self, options: Vec<Value>) -> Self {
        self.options = StageOptions::PerStage(options);
        self
    }

    pub fn test(mut self, rule: impl Into<Rule>) -> Self {
        self.test.get_or_insert_with(Rules::default).push(rule);
        self
    }

    pub fn test_regex(self, pattern: &str) -> Self {
        match Rule::regex(pattern) {
            Ok(rule) => self.test(rule),
            Err(e) => self.fail(e),
        }
    }

    pub fn include(mut self, rule: impl Into<Rule>) -> Self {
        self.include.get_or_insert_with(Rules::default).push(rule);
        self
    }

    pub fn include_regex(self, pattern: &str) -> Self {
        match Rule::regex(pattern) {
            Ok(rule) => self.include(rule),
            Err(e) => self.fail(e),
        }
    }

    pub fn exclude(mut self, rule: impl Into<Rule>) -> Self {
        self.exclude.get_or_insert_with(Rules::default).push(rule);
        self
    }

    pub fn exclude_regex(self, pattern: &str) -> Self {
        match Rule::regex(pattern) {
            Ok(rule) => self.exclude(rule),
            Err(e) => self.fail(e),
        }
    }

    pub fn parallel(mut self, parallel: impl Into<Parallel>) -> Self {
        self.parallel = parallel.into();
        self
    }

    /// Overrides the detected number of cores.
    pub fn cores(mut self, cores: usize) -> Self {
        self.cores = Some(cores);
        self
    }

    fn fail(mut self, error: ConfigError) -> Self {
        self.error.get_or_insert(error);
        self
    }

    pub fn build(self) -> Result<Minimizer, ConfigError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let mut registry = self.registry;
        for stage in self.custom {
            registry.register(stage)?;
        }

        let mut stages = self.stages;
        #[cfg(feature = "html")]
        if stages.is_empty() {
            stages.push(crate::stage::HTML.to_owned());
        }

        let pipeline = Pipeline::new(Arc::new(registry), stages, self.options)?;

        Ok(Minimizer {
            matcher: Matcher {
                test: self.test.unwrap_or_else(Rules::default_test),
                include: self.include,
                exclude: self.exclude,
            },
            pipeline,
            parallel: self.parallel,
            cores: self.cores.unwrap_or_else(available_cores),
        })
    }
}

/// A rule as written in JSON: a plain string matched literally, or a
/// `{ "regex": "...", "flags": "i" }` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RuleSpec {
    Literal(String),
    Regex {
        regex: String,
        #[serde(default)]
        flags: String,
    },
}

impl RuleSpec {
    pub fn compile(&self) -> Result<Rule, ConfigError> {
        match self {
            RuleSpec::Literal(text) => Ok(Rule::literal(text.as_str())),
            RuleSpec::Regex { regex, flags } => Rule::regex_with_flags(regex, flags),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        }
    }
}

/// `parallel` accepts a flag or a worker cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ParallelSpec {
    Flag(bool),
    Max(usize),
}

impl From<ParallelSpec> for Parallel {
    fn from(spec: ParallelSpec) -> Self {
        match spec {
            ParallelSpec::Flag(flag) => flag.into(),
            ParallelSpec::Max(max) => max.into(),
        }
    }
}

/// Declarative configuration, as it appears in a build config file.
///
/// ```json
/// {
///   "test": { "regex": "\\.html?$", "flags": "i" },
///   "exclude": "vendor/",
///   "parallel": 4,
///   "minify": ["command", "minify-html"],
///   "minimizerOptions": [{ "program": "tidy" }, { "keep_comments": false }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    pub test: Option<OneOrMany<RuleSpec>>,
    pub include: Option<OneOrMany<RuleSpec>>,
    pub exclude: Option<OneOrMany<RuleSpec>>,
    pub parallel: Option<ParallelSpec>,
    pub minify: Option<OneOrMany<String>>,
    pub minimizer_options: Option<Value>,
}

impl Options {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn compile(specs: OneOrMany<RuleSpec>) -> Result<Rules, ConfigError> {
    specs.into_vec().iter().map(RuleSpec::compile).collect()
}
