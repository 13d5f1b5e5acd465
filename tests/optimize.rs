use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use chijimi::{
    Asset, Compilation, Input, MemoryCache, Minimizer, MinimizedResult, Parallel, Registry,
    Severity, Stage, Strategy,
};
use regex::Regex;
use serde_json::{Value, json};

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static AFTER_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">\s+").unwrap());
static BEFORE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+<").unwrap());

fn trim() -> Stage {
    Stage::new("trim", |input: Input<'_>, _: &Value| {
        let code = COMMENT.replace_all(input.code, "");
        let code = AFTER_TAG.replace_all(&code, ">");
        let code = BEFORE_TAG.replace_all(&code, "<");
        Ok(code.into_owned())
    })
}

fn counting(id: &str, calls: Arc<AtomicUsize>) -> Stage {
    Stage::new(id, move |input: Input<'_>, options: &Value| {
        calls.fetch_add(1, Ordering::SeqCst);
        let suffix = options.get("suffix").and_then(Value::as_str).unwrap_or("");
        Ok(format!("{}{suffix}", input.code.trim()))
    })
}

fn append(id: &str, suffix: &'static str) -> Stage {
    Stage::new(id, move |input: Input<'_>, _: &Value| Ok(format!("{}{suffix}", input.code)))
}

fn html_assets(count: usize) -> Compilation {
    let mut compilation = Compilation::new();
    for i in 0..count {
        compilation.insert(format!("page{i}.html"), Asset::new(format!("  <p>{i}</p>  ")));
    }
    compilation
}

#[test]
fn trims_the_single_html_asset() {
    let mut compilation = Compilation::new();
    compilation.insert("a.html", Asset::new("<!-- c --><p>  x  </p>"));
    compilation.insert("a.css", Asset::new("body {  }"));

    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(trim())
        .build()
        .unwrap();

    let report = minimizer
        .optimize(&mut compilation, &MemoryCache::new())
        .unwrap();

    assert_eq!(report.matched, 1);
    assert_eq!(compilation.text("a.html"), Some("<p>x</p>"));
    assert!(compilation.get("a.html").unwrap().info.minimized);
    assert_eq!(compilation.text("a.css"), Some("body {  }"));
    assert!(!compilation.get("a.css").unwrap().info.minimized);
    assert!(compilation.warnings().is_empty());
    assert!(compilation.errors().is_empty());
}

#[test]
fn selection_follows_test_include_and_exclude() {
    let mut compilation = Compilation::new();
    for name in ["a.html", "b.html", "c.html", "d.css"] {
        compilation.insert(name, Asset::new("  x  "));
    }
    compilation.insert(
        "e.html",
        Asset {
            info: chijimi::AssetInfo {
                minimized: true,
                ..Default::default()
            },
            ..Asset::new("  x  ")
        },
    );

    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(counting("count", Arc::default()))
        .include("a.html")
        .include("b.html")
        .include("e.html")
        .exclude_regex(r"^b\.")
        .build()
        .unwrap();

    let report = minimizer
        .optimize(&mut compilation, &MemoryCache::new())
        .unwrap();

    assert_eq!(report.matched, 1);
    assert_eq!(compilation.text("a.html"), Some("x"));
    for untouched in ["b.html", "c.html", "d.css", "e.html"] {
        assert_eq!(compilation.text(untouched), Some("  x  "), "{untouched}");
    }
}

#[test]
fn second_pass_is_served_from_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = MemoryCache::new();
    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(counting("count", calls.clone()))
        .parallel(false)
        .build()
        .unwrap();

    let mut first = html_assets(3);
    let report = minimizer.optimize(&mut first, &cache).unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let mut second = html_assets(3);
    let report = minimizer.optimize(&mut second, &cache).unwrap();
    assert_eq!(report.cached, 3);
    assert_eq!(report.processed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let first: Vec<_> = first.iter().map(|(n, a)| (n.to_owned(), a.clone())).collect();
    let second: Vec<_> = second.iter().map(|(n, a)| (n.to_owned(), a.clone())).collect();
    assert_eq!(first, second);
}

#[test]
fn cache_keys_follow_content_and_configuration() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = MemoryCache::new();
    let minimizer = |suffix: &str| {
        Minimizer::builder()
            .registry(Registry::new())
            .stage(counting("count", calls.clone()))
            .options(json!({ "suffix": suffix }))
            .build()
            .unwrap()
    };

    let mut compilation = Compilation::new();
    compilation.insert("a.html", Asset::new("<p>x</p>"));
    minimizer("").optimize(&mut compilation, &cache).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut compilation = Compilation::new();
    compilation.insert("a.html", Asset::new("<p>y</p>"));
    minimizer("").optimize(&mut compilation, &cache).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let mut compilation = Compilation::new();
    compilation.insert("a.html", Asset::new("<p>x</p>"));
    minimizer("!").optimize(&mut compilation, &cache).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(compilation.text("a.html"), Some("<p>x</p>!"));
}

#[test]
fn stages_apply_in_configured_order() {
    let mut compilation = Compilation::new();
    compilation.insert("a.html", Asset::new("x"));

    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(append("a", "1"))
        .stage(append("b", "2"))
        .build()
        .unwrap();

    minimizer
        .optimize(&mut compilation, &MemoryCache::new())
        .unwrap();
    assert_eq!(compilation.text("a.html"), Some("x12"));
}

#[test]
fn one_failing_asset_does_not_affect_the_others() {
    let mut compilation = Compilation::new();
    compilation.insert("a.html", Asset::new("a"));
    compilation.insert("b.html", Asset::new("fail"));
    compilation.insert("c.html", Asset::new("c"));

    let stage = Stage::new("picky", |input: Input<'_>, _: &Value| {
        if input.code == "fail" {
            anyhow::bail!("unexpected token");
        }
        Ok(input.code.to_uppercase())
    });

    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(stage)
        .build()
        .unwrap();

    let report = minimizer
        .optimize(&mut compilation, &MemoryCache::new())
        .unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(compilation.text("a.html"), Some("A"));
    assert_eq!(compilation.text("c.html"), Some("C"));
    assert_eq!(compilation.text("b.html"), Some("fail"));
    assert!(!compilation.get("b.html").unwrap().info.minimized);

    let errors = compilation.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].file, "b.html");
    assert!(errors[0].message.starts_with("b.html from chijimi\n"));
    assert!(errors[0].message.contains("unexpected token"));
}

#[test]
fn stage_diagnostics_are_forwarded() {
    let mut compilation = Compilation::new();
    compilation.insert("a.html", Asset::new("x").with_info("immutable", true));

    let stage = Stage::new("noisy", |input: Input<'_>, _: &Value| {
        Ok(MinimizedResult::new(input.code)
            .warning("unused attribute")
            .error("unclosed tag"))
    });

    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(stage)
        .build()
        .unwrap();

    minimizer
        .optimize(&mut compilation, &MemoryCache::new())
        .unwrap();

    let asset = compilation.get("a.html").unwrap();
    assert!(asset.info.minimized);
    assert_eq!(asset.info.extra["immutable"], Value::Bool(true));

    assert_eq!(compilation.warnings().len(), 1);
    assert_eq!(compilation.warnings()[0].severity, Severity::Warning);
    assert_eq!(compilation.warnings()[0].message, "unused attribute");
    assert_eq!(
        compilation.errors()[0].message,
        "a.html from chijimi\nunclosed tag"
    );
}

#[test]
fn parallel_off_runs_everything_in_process() {
    let mut compilation = html_assets(5);

    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(counting("count", Arc::default()))
        .parallel(false)
        .cores(4)
        .build()
        .unwrap();

    let report = minimizer
        .optimize(&mut compilation, &MemoryCache::new())
        .unwrap();

    assert_eq!(report.strategy, Strategy::InProcess);
    assert_eq!(report.limit, 5);
    assert!(!report.pool_started);
    assert_eq!(report.processed, 5);
}

/// Records how many calls overlap and which threads they run on.
fn observed(id: &str, peak: Arc<AtomicUsize>, threads: Arc<Mutex<HashSet<ThreadId>>>) -> Stage {
    let active = Arc::new(AtomicUsize::new(0));

    Stage::new(id, move |input: Input<'_>, _: &Value| {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut threads) = threads.lock() {
            threads.insert(thread::current().id());
        }
        thread::sleep(Duration::from_millis(20));
        active.fetch_sub(1, Ordering::SeqCst);
        Ok(input.code.trim().to_owned())
    })
}

#[test]
fn in_process_pipelines_run_one_at_a_time_on_the_caller() {
    for worker_threads in [true, false] {
        let peak = Arc::new(AtomicUsize::new(0));
        let threads = Arc::new(Mutex::new(HashSet::new()));
        let stage = observed("observed", peak.clone(), threads.clone())
            .with_worker_threads(worker_threads);

        let minimizer = Minimizer::builder()
            .registry(Registry::new())
            .stage(stage)
            .parallel(false)
            .cores(4)
            .build()
            .unwrap();
        let mut compilation = html_assets(8);

        let report = minimizer
            .optimize(&mut compilation, &MemoryCache::new())
            .unwrap();

        assert_eq!(report.strategy, Strategy::InProcess);
        assert_eq!(report.limit, 8);
        assert_eq!(report.processed, 8);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(
            *threads.lock().unwrap(),
            HashSet::from([thread::current().id()])
        );
    }
}

#[test]
fn optimize_completes_inside_a_single_thread_pool() {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();

    for parallel in [Parallel::Off, Parallel::Auto] {
        let minimizer = Minimizer::builder()
            .registry(Registry::new())
            .stage(trim())
            .parallel(parallel)
            .cores(4)
            .build()
            .unwrap();
        let mut compilation = html_assets(3);

        let report = pool
            .install(|| minimizer.optimize(&mut compilation, &MemoryCache::new()))
            .unwrap();

        assert_eq!(report.processed, 3, "{parallel:?}");
        assert_eq!(compilation.text("page0.html"), Some("<p>0</p>"));
    }
}

#[test]
fn parallel_on_four_cores_uses_three_workers() {
    let mut compilation = html_assets(5);

    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(counting("count", Arc::default()))
        .parallel(Parallel::Auto)
        .cores(4)
        .build()
        .unwrap();

    let report = minimizer
        .optimize(&mut compilation, &MemoryCache::new())
        .unwrap();

    assert_eq!(report.strategy, Strategy::Workers(3));
    assert_eq!(report.limit, 3);
    assert!(report.pool_started);
    assert_eq!(report.processed, 5);
    for i in 0..5 {
        assert_eq!(
            compilation.text(&format!("page{i}.html")),
            Some(format!("<p>{i}</p>").as_str())
        );
    }
}

#[test]
fn worker_results_match_in_process_results() {
    let build = |parallel: Parallel| {
        Minimizer::builder()
            .registry(Registry::new())
            .stage(trim())
            .stage(append("mark", "!"))
            .parallel(parallel)
            .cores(8)
            .build()
            .unwrap()
    };

    let mut local = html_assets(6);
    let mut pooled = html_assets(6);

    build(Parallel::Off)
        .optimize(&mut local, &MemoryCache::new())
        .unwrap();
    let report = build(Parallel::Auto)
        .optimize(&mut pooled, &MemoryCache::new())
        .unwrap();

    assert_eq!(report.strategy, Strategy::Workers(6));
    let local: Vec<_> = local.iter().map(|(_, a)| a.source.clone()).collect();
    let pooled: Vec<_> = pooled.iter().map(|(_, a)| a.source.clone()).collect();
    assert_eq!(local, pooled);
}

#[test]
fn stage_without_worker_support_keeps_batch_in_process() {
    let mut compilation = html_assets(4);

    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(trim())
        .stage(append("local", "").with_worker_threads(false))
        .cores(8)
        .build()
        .unwrap();

    let report = minimizer
        .optimize(&mut compilation, &MemoryCache::new())
        .unwrap();

    assert_eq!(report.strategy, Strategy::InProcess);
    assert!(!report.pool_started);
    assert_eq!(report.limit, 4);
}

#[test]
fn fully_cached_pass_never_starts_a_pool() {
    let cache = MemoryCache::new();
    let minimizer = Minimizer::builder()
        .registry(Registry::new())
        .stage(trim())
        .cores(8)
        .build()
        .unwrap();

    minimizer.optimize(&mut html_assets(3), &cache).unwrap();
    let report = minimizer.optimize(&mut html_assets(3), &cache).unwrap();

    assert_eq!(report.cached, 3);
    assert_eq!(report.strategy, Strategy::InProcess);
    assert!(!report.pool_started);
}
