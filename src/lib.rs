#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod asset;
mod cache;
mod config;
mod core;
mod diagnostics;
mod error;
mod io;
#[cfg(feature = "logging")]
pub mod logging;
mod optimize;
mod pipeline;
mod rules;
pub mod stage;
mod throttle;
mod worker;

pub use crate::asset::{Asset, AssetGraph, AssetInfo, Compilation};
pub use crate::cache::{Cache, CacheEntry, MemoryCache};
pub use crate::config::{Minimizer, MinimizerBuilder, OneOrMany, Options, ParallelSpec, RuleSpec};
pub use crate::core::{ArcStr, Hash32};
pub use crate::diagnostics::{Diagnostic, Severity};
pub use crate::error::*;
pub use crate::io::as_overhead;
pub use crate::optimize::{PassReport, TaskExecution};
pub use crate::pipeline::{
    Input, Minified, MinimizedResult, Pipeline, PipelineOutput, Problem, StageOptions,
};
pub use crate::rules::{Matcher, Rule, Rules};
pub use crate::stage::{Registry, Stage};
pub use crate::throttle::{Task, throttle_all, throttle_local};
pub use crate::worker::{Parallel, Strategy, available_cores};
