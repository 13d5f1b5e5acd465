use std::fmt::Display;
use std::fs;
use std::sync::LazyLock;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};

use crate::asset::{Asset, Compilation};
use crate::error::IoError;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) static PASS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static WRITE_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("#>-")
});

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

impl Compilation {
    /// Loads every file matching `pattern`, relative to `base`, as an asset
    /// named by its path relative to `base`.
    pub fn load_glob(pattern: &str, base: impl AsRef<Utf8Path>) -> Result<Self, IoError> {
        let mut compilation = Compilation::new();
        compilation.add_glob(pattern, base)?;
        Ok(compilation)
    }

    /// Like [`Compilation::load_glob`], adding to an existing compilation.
    /// Returns the number of files loaded.
    pub fn add_glob(&mut self, pattern: &str, base: impl AsRef<Utf8Path>) -> Result<usize, IoError> {
        let base = base.as_ref();
        let mut loaded = 0;

        for path in glob(base.join(pattern).as_str())? {
            let path = Utf8PathBuf::try_from(path?)?;
            if !path.is_file() {
                continue;
            }

            let name = path
                .strip_prefix(base)
                .map_err(|_| IoError::OutsideBase(path.to_string(), base.to_string()))?;

            self.insert(name.as_str(), Asset::new(fs::read(&path)?));
            loaded += 1;
        }

        tracing::debug!(%pattern, %base, loaded, "loaded assets");
        Ok(loaded)
    }

    /// Writes every asset to `dist`, creating directories as needed.
    pub fn write_all(&self, dist: impl AsRef<Utf8Path>) -> Result<(), IoError> {
        let dist = dist.as_ref();
        let s = Instant::now();

        let pb = ProgressBar::new(self.len() as u64);
        pb.set_message("Writing assets...");
        pb.set_style(WRITE_STYLE.clone());

        for (name, asset) in self.iter() {
            let path = dist.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(&path, &asset.source)?;
            pb.inc(1);
        }

        pb.finish_with_message(format!("Wrote {} assets {}", self.len(), as_overhead(s)));
        Ok(())
    }
}
