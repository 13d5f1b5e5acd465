//! Minifies every HTML file of a directory into another one.
//!
//! ```sh
//! cargo run --example minify_dir --features logging -- public dist
//! ```

use chijimi::{Compilation, MemoryCache, Minimizer, Options, Registry};

fn main() -> anyhow::Result<()> {
    chijimi::logging::init("info")?;

    let mut args = std::env::args().skip(1);
    let src = args.next().unwrap_or_else(|| "public".into());
    let dist = args.next().unwrap_or_else(|| "dist".into());

    // Options may also come from a JSON file, e.g. a section of a build config.
    let options = Options::from_json(r#"{ "minify": "minify-html", "exclude": "vendor/" }"#)?;
    let minimizer = Minimizer::from_options(options, &Registry::builtin())?;

    let mut compilation = Compilation::load_glob("**/*.html", &src)?;
    let cache = MemoryCache::new();
    let report = minimizer.optimize(&mut compilation, &cache)?;

    for diagnostic in compilation.warnings().iter().chain(compilation.errors()) {
        eprintln!("{diagnostic}");
    }

    compilation.write_all(&dist)?;
    tracing::info!(
        matched = report.matched,
        failed = report.failed,
        strategy = ?report.strategy,
        "done"
    );

    Ok(())
}
