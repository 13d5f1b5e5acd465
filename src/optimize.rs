use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::asset::AssetGraph;
use crate::cache::{Cache, CacheEntry};
use crate::config::Minimizer;
use crate::core::{ArcStr, Hash32};
use crate::diagnostics::Diagnostic;
use crate::error::{OptimizeError, PipelineError};
use crate::io::{PASS_STYLE, as_overhead};
use crate::pipeline::{PipelineOutput, Problem};
use crate::throttle::{Task, throttle_all, throttle_local};
use crate::worker::{Dispatcher, Strategy};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Summary of a single [`Minimizer::optimize`] pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    /// Assets selected for minification.
    pub matched: usize,
    /// Selected assets served from the cache.
    pub cached: usize,
    /// Assets whose pipeline ran and succeeded.
    pub processed: usize,
    /// Assets whose pipeline ran and failed.
    pub failed: usize,
    pub strategy: Strategy,
    /// Concurrency limit handed to the throttle, 0 when nothing ran.
    pub limit: usize,
    pub pool_started: bool,
    /// Execution time of every pipeline run during the pass.
    pub durations: BTreeMap<ArcStr, TaskExecution>,
}

impl Default for PassReport {
    fn default() -> Self {
        Self {
            matched: 0,
            cached: 0,
            processed: 0,
            failed: 0,
            strategy: Strategy::InProcess,
            limit: 0,
            pool_started: false,
            durations: BTreeMap::new(),
        }
    }
}

struct Selected<'g> {
    name: ArcStr,
    source: &'g [u8],
    etag: Hash32,
    hit: Option<Arc<CacheEntry>>,
}

type Executed = (Result<PipelineOutput, PipelineError>, TaskExecution);

impl Minimizer {
    /// Minifies every selected asset of the graph in place.
    ///
    /// A pass goes through the following steps:
    /// 1. Assets that are not yet minimized and match the rules are
    ///    selected, and each one is looked up in the cache by its etag.
    /// 2. The number of cache misses decides whether pipelines run
    ///    in-process or on a worker pool, and how large that pool is.
    /// 3. Pipelines for the misses run through the throttle, each successful
    ///    result is stored in the cache by the task itself. In-process
    ///    pipelines run one by one on the calling thread; only a worker pool
    ///    runs them in parallel.
    /// 4. The worker pool, if one was started, is shut down.
    /// 5. Cached and fresh results are written back to the graph and their
    ///    warnings and errors are reported, one asset at a time.
    ///
    /// Failing assets are left untouched and reported as errors, they never
    /// fail the pass. Only cache read failures do.
    pub fn optimize<G>(&self, assets: &mut G, cache: &dyn Cache) -> Result<PassReport, OptimizeError>
    where
        G: AssetGraph + ?Sized,
    {
        let start = Instant::now();
        let selected = self.collect(&*assets, cache)?;

        if selected.is_empty() {
            tracing::debug!("no assets to minify");
            return Ok(PassReport::default());
        }

        let mut report = PassReport {
            matched: selected.len(),
            cached: selected.iter().filter(|s| s.hit.is_some()).count(),
            ..Default::default()
        };

        let misses: Vec<&Selected<'_>> = selected.iter().filter(|s| s.hit.is_none()).collect();
        report.strategy = Strategy::choose(self.parallel, self.cores, misses.len(), &self.pipeline);
        report.limit = match report.strategy {
            Strategy::Workers(workers) => workers,
            Strategy::InProcess => misses.len(),
        };

        tracing::debug!(
            matched = report.matched,
            misses = misses.len(),
            strategy = ?report.strategy,
            limit = report.limit,
            "dispatching"
        );

        let dispatcher = Dispatcher::new(&self.pipeline, report.strategy);
        let executed = execute(&dispatcher, cache, &misses, report.strategy, report.limit);
        report.pool_started = dispatcher.pool_started();
        dispatcher.shutdown();
        let executed = executed?;

        let plan: Vec<(ArcStr, Option<Arc<CacheEntry>>)> =
            selected.into_iter().map(|s| (s.name, s.hit)).collect();

        let mut executed = executed.into_iter();
        for (name, hit) in plan {
            match hit {
                Some(entry) => merge(assets, &name, &entry.code, &entry.warnings, &entry.errors),
                None => {
                    let Some((result, timing)) = executed.next() else {
                        continue;
                    };
                    report.durations.insert(name.clone(), timing);

                    match result {
                        Ok(output) => {
                            report.processed += 1;
                            merge(assets, &name, &output.code, &output.warnings, &output.errors);
                        }
                        Err(error) => {
                            report.failed += 1;
                            tracing::debug!(asset = %name, %error, "pipeline failed");
                            assets.report(Diagnostic::failure(&name, &error));
                        }
                    }
                }
            }
        }

        tracing::info!(
            "Minified {} assets ({} cached, {} failed) {}",
            report.processed + report.cached,
            report.cached,
            report.failed,
            as_overhead(start)
        );

        Ok(report)
    }

    fn collect<'g, G>(&self, assets: &'g G, cache: &dyn Cache) -> Result<Vec<Selected<'g>>, OptimizeError>
    where
        G: AssetGraph + ?Sized,
    {
        let identity = self.pipeline.identity();
        let mut selected = Vec::new();

        for name in assets.names() {
            let Some(asset) = assets.asset(&name) else {
                continue;
            };

            if asset.info.minimized || !self.matcher.matches(&name) {
                continue;
            }

            let etag = Hash32::etag(identity, &asset.source);
            let hit = cache
                .get(&name, etag)
                .map_err(|e| OptimizeError::Cache(name.to_string(), e))?;

            selected.push(Selected {
                name,
                source: &asset.source,
                etag,
                hit,
            });
        }

        Ok(selected)
    }
}

/// Runs one task per cache miss and returns their results in the same order.
fn execute(
    dispatcher: &Dispatcher<'_>,
    cache: &dyn Cache,
    misses: &[&Selected<'_>],
    strategy: Strategy,
    limit: usize,
) -> Result<Vec<Executed>, OptimizeError> {
    if misses.is_empty() {
        return Ok(Vec::new());
    }

    let pass = tracing::span!(Level::INFO, "minify");
    pass.pb_set_length(misses.len() as u64);
    pass.pb_set_style(&PASS_STYLE);
    pass.pb_set_message("Minifying assets...");
    let _enter = pass.enter();

    let tasks: Vec<Task<'_, Executed, Infallible>> = misses
        .iter()
        .map(|&selected| {
            let pass = pass.clone();

            Box::new(move || {
                let span = tracing::span!(parent: &pass, Level::INFO, "asset", name = %selected.name);
                let _enter = span.enter();
                let start = Instant::now();

                let result = match std::str::from_utf8(selected.source) {
                    Ok(input) => dispatcher.run(&selected.name, input),
                    Err(e) => Err(PipelineError::Encoding(e.to_string())),
                };

                if let Ok(output) = &result
                    && let Err(error) =
                        cache.store(&selected.name, selected.etag, CacheEntry::from(output.clone()))
                {
                    tracing::warn!(asset = %selected.name, %error, "couldn't store cache entry");
                }

                let timing = TaskExecution {
                    start,
                    duration: start.elapsed(),
                };
                pass.pb_inc(1);

                Ok((result, timing))
            }) as Task<'_, Executed, Infallible>
        })
        .collect();

    let executed = match strategy {
        Strategy::Workers(_) => throttle_all(limit, tasks)?,
        Strategy::InProcess => throttle_local(limit, tasks)?,
    };

    Ok(executed)
}

/// Writes minified code back and forwards diagnostics. Metadata other than
/// the `minimized` flag is kept as is.
fn merge<G>(assets: &mut G, name: &str, code: &str, warnings: &[Problem], errors: &[Problem])
where
    G: AssetGraph + ?Sized,
{
    let Some(asset) = assets.asset(name) else {
        return;
    };

    let mut info = asset.info.clone();
    info.minimized = true;
    assets.update(name, code.as_bytes().to_vec(), info);

    for warning in warnings {
        assets.report(Diagnostic::warning(name, warning));
    }

    for error in errors {
        assets.report(Diagnostic::error(name, error));
    }
}
