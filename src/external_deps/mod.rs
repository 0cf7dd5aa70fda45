//! Integrations that rely on external runtimes.
//!
//! This module groups adapters for the embedded JavaScript engine and
//! the headless browser, the two escalation rungs that leave plain
//! HTTP behind.

pub mod browser;
pub mod interpreters;

pub use browser::{BrowserError, HeadlessBrowser, RenderedPage};
pub use interpreters::{BoaScriptEngine, ScriptEngine, ScriptError, ScriptHarvest};
