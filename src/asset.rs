use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ArcStr;
use crate::diagnostics::{Diagnostic, Severity};

/// Metadata attached to an asset. Everything other than `minimized` is
/// opaque to this crate and survives minification untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    #[serde(default)]
    pub minimized: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A named blob produced by the build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Asset {
    pub source: Vec<u8>,
    pub info: AssetInfo,
}

impl Asset {
    pub fn new(source: impl Into<Vec<u8>>) -> Self {
        Self {
            source: source.into(),
            info: AssetInfo::default(),
        }
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.info.extra.insert(key.into(), value.into());
        self
    }
}

/// The build's asset graph, as seen by the minimizer.
///
/// Assets are only read while a pass is running; all writes happen in a
/// single-threaded merge step at the end of it.
pub trait AssetGraph {
    /// Names of every asset currently in the graph.
    fn names(&self) -> Vec<ArcStr>;

    fn asset(&self, name: &str) -> Option<&Asset>;

    /// Replaces the contents and metadata of an existing asset.
    fn update(&mut self, name: &str, source: Vec<u8>, info: AssetInfo);

    /// Attaches a warning or an error to the build.
    fn report(&mut self, diagnostic: Diagnostic);
}

/// In-memory [`AssetGraph`] with assets ordered by name.
#[derive(Debug, Default)]
pub struct Compilation {
    assets: BTreeMap<ArcStr, Asset>,
    warnings: Vec<Diagnostic>,
    errors: Vec<Diagnostic>,
}

impl Compilation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an asset.
    pub fn insert(&mut self, name: impl Into<ArcStr>, asset: Asset) {
        self.assets.insert(name.into(), asset);
    }

    pub fn get(&self, name: &str) -> Option<&Asset> {
        self.assets.get(name)
    }

    /// Source of an asset as text, if it is valid UTF-8.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|asset| std::str::from_utf8(&asset.source).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Asset)> {
        self.assets.iter().map(|(name, asset)| (&**name, asset))
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }
}

impl AssetGraph for Compilation {
    fn names(&self) -> Vec<ArcStr> {
        self.assets.keys().cloned().collect()
    }

    fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.get(name)
    }

    fn update(&mut self, name: &str, source: Vec<u8>, info: AssetInfo) {
        if let Some(asset) = self.assets.get_mut(name) {
            asset.source = source;
            asset.info = info;
        }
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Warning => self.warnings.push(diagnostic),
            Severity::Error => self.errors.push(diagnostic),
        }
    }
}
