//! JavaScript execution infrastructure.
//!
//! Provides a shared trait and error type for running a page's inline
//! scripts inside a sandboxed DOM shim, along with the Boa-backed
//! default implementation. Execution is best-effort: the harvest
//! carries whatever the scripts managed to produce.

mod boa;

pub use boa::BoaScriptEngine;

use thiserror::Error;
use url::Url;

/// What running a page's inline scripts produced.
#[derive(Debug, Clone, Default)]
pub struct ScriptHarvest {
    /// Markup emitted via `document.write`, in call order.
    pub written_html: String,
    /// Navigation target assigned to `location.href` (or passed to
    /// `location.assign`/`replace`), resolved to an absolute URL.
    pub redirect: Option<String>,
}

impl ScriptHarvest {
    pub fn is_empty(&self) -> bool {
        self.written_html.is_empty() && self.redirect.is_none()
    }
}

/// Abstraction over JavaScript runtimes used by the scripted strategy.
pub trait ScriptEngine: Send + Sync {
    /// Runs every inline `<script>` of the page against a DOM shim
    /// seeded from the page URL. Individual script errors are logged
    /// and skipped; the call only fails when the page has no runnable
    /// script at all or the engine itself breaks.
    fn run_inline(&self, page_html: &str, page_url: &Url) -> ScriptResult<ScriptHarvest>;
}

/// Failures produced by JavaScript runtimes.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("javascript execution failed: {0}")]
    Execution(String),
    #[error("javascript engine error: {0}")]
    Engine(String),
    #[error("page contains no executable script")]
    NoScripts,
}

/// Convenience alias for runtime results.
pub type ScriptResult<T> = Result<T, ScriptError>;
