use boa_engine::{Context, Source};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

use super::{ScriptEngine, ScriptError, ScriptHarvest, ScriptResult};

/// Default engine backed by the Boa JavaScript interpreter.
///
/// Each call builds a fresh context with a minimal DOM shim:
/// `document.write` output is collected, `location` assignments are
/// captured as a redirect target, timers run inline. Scripts that
/// reach for APIs the shim lacks fail individually without aborting
/// the harvest.
#[derive(Debug, Default)]
pub struct BoaScriptEngine;

impl BoaScriptEngine {
    pub fn new() -> Self {
        Self
    }

    fn extract_scripts<'a>(&self, html: &'a str) -> Vec<&'a str> {
        static SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
            RegexBuilder::new(r"(?is)<script[^>]*>(?P<body>.*?)</script>")
                .dot_matches_new_line(true)
                .case_insensitive(true)
                .build()
                .unwrap()
        });

        // External scripts (src=...) have empty bodies and drop out of
        // the non-empty filter downstream.
        SCRIPT_RE
            .captures_iter(html)
            .filter_map(|caps| caps.name("body").map(|m| m.as_str()))
            .collect()
    }

    fn build_prelude(&self, page_url: &Url) -> String {
        let host = page_url.host_str().unwrap_or("localhost");
        let scheme = page_url.scheme();
        let port = page_url
            .port()
            .map(|p| p.to_string())
            .unwrap_or_default();
        // Origin keeps an explicit port so relative redirects resolve
        // back to the same server.
        let origin = page_url
            .port()
            .map(|p| format!("{scheme}://{host}:{p}"))
            .unwrap_or_else(|| format!("{scheme}://{host}"));
        let path = page_url.path();
        let href = page_url.as_str();

        format!(
            r#"
var __writes = [];
var __redirect = null;
var __host = "{host}";
var __origin = "{origin}";
function __absUrl(input) {{
    if (!input) return "";
    input = String(input);
    if (input.startsWith("http://") || input.startsWith("https://")) return input;
    if (input.startsWith("//")) return "{scheme}:" + input;
    if (input.startsWith("/")) return __origin + input;
    return __origin + (input.startsWith("?") ? "{path}" + input : "/" + input.replace(/^\/+/, ""));
}}
var __loc = {{
    _href: "{href}",
    hostname: __host,
    protocol: "{scheme}:",
    port: "{port}",
    pathname: "{path}",
    assign: function(url) {{ __redirect = __absUrl(url); }},
    replace: function(url) {{ __redirect = __absUrl(url); }},
    reload: function() {{}},
    toString: function() {{ return this._href; }}
}};
Object.defineProperty(__loc, "href", {{
    get: function() {{ return this._href; }},
    set: function(val) {{ __redirect = __absUrl(val); }}
}});
var location = __loc;
var window = {{}};
Object.defineProperty(window, "location", {{
    get: function() {{ return __loc; }},
    set: function(val) {{ __redirect = __absUrl(val); }}
}});
var navigator = {{
    userAgent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
    language: "en-US",
    languages: ["en-US", "en"],
    platform: "Win32"
}};
window.navigator = navigator;
var history = {{ replaceState: function() {{}}, pushState: function() {{}} }};
window.history = history;
var performance = {{ now: function() {{ return Date.now(); }} }};
window.performance = performance;
var __state = {{
    values: {{}},
    setValue: function(id, value) {{ this.values[id] = value; }},
    getValue: function(id) {{ return this.values[id]; }}
}};
function __makeElement(id) {{
    var element = {{
        id: id,
        style: {{}},
        attributes: {{}},
        children: [],
        addEventListener: function() {{}},
        removeEventListener: function() {{}},
        appendChild: function(child) {{ this.children.push(child); return child; }},
        setAttribute: function(name, value) {{ this.attributes[name] = value; }},
        getAttribute: function(name) {{ return this.attributes[name] || ""; }},
        submit: function() {{}}
    }};
    Object.defineProperty(element, "value", {{
        get: function() {{ return __state.getValue(id); }},
        set: function(v) {{ __state.setValue(id, v); }}
    }});
    Object.defineProperty(element, "innerHTML", {{
        get: function() {{ return this._innerHTML || ""; }},
        set: function(val) {{
            this._innerHTML = val;
            var match = /href\s*=\s*['"]([^'"]+)['"]/i.exec(val || "");
            if (match) {{
                this.firstChild = {{ href: __absUrl(match[1]) }};
            }} else {{
                this.firstChild = {{ href: "" }};
            }}
        }}
    }});
    Object.defineProperty(element, "href", {{
        get: function() {{ return this._href || ""; }},
        set: function(val) {{ this._href = __absUrl(val); }}
    }});
    return element;
}}
var document = {{
    _cache: {{}},
    location: __loc,
    cookie: "",
    write: function(html) {{ __writes.push(String(html)); }},
    writeln: function(html) {{ __writes.push(String(html) + "\n"); }},
    createElement: function(tag) {{ return __makeElement(tag); }},
    querySelector: function(sel) {{ return __makeElement(sel); }},
    querySelectorAll: function(sel) {{ return []; }},
    getElementById: function(id) {{
        if (!this._cache[id]) {{
            this._cache[id] = __makeElement(id);
        }}
        return this._cache[id];
    }}
}};
window.document = document;
document.defaultView = window;
function setTimeout(cb, delay) {{ return cb(); }}
function clearTimeout() {{}}
function setInterval(cb, delay) {{ return 0; }}
function clearInterval() {{}}
var atob = function(str) {{ return str; }};
var btoa = function(str) {{ return str; }};
"#
        )
    }

    fn read_string(&self, context: &mut Context, expr: &str) -> ScriptResult<String> {
        let value = context
            .eval(Source::from_bytes(expr))
            .map_err(|err| ScriptError::Execution(err.to_string()))?;
        value
            .to_string(context)
            .map_err(|err| ScriptError::Execution(err.to_string()))?
            .to_std_string()
            .map_err(|_| ScriptError::Engine("unable to convert interpreter output".into()))
    }
}

impl ScriptEngine for BoaScriptEngine {
    fn run_inline(&self, page_html: &str, page_url: &Url) -> ScriptResult<ScriptHarvest> {
        let scripts = self.extract_scripts(page_html);
        if scripts.is_empty() {
            return Err(ScriptError::NoScripts);
        }

        let mut context = Context::default();
        let prelude = self.build_prelude(page_url);
        context
            .eval(Source::from_bytes(&prelude))
            .map_err(|err| ScriptError::Engine(err.to_string()))?;

        let mut executed_any = false;
        for script in scripts {
            if script.trim().is_empty() {
                continue;
            }
            executed_any = true;
            if let Err(err) = context.eval(Source::from_bytes(script)) {
                log::debug!("inline script failed, continuing: {err}");
            }
        }
        if !executed_any {
            return Err(ScriptError::NoScripts);
        }

        let written_html = self.read_string(&mut context, "__writes.join('');")?;
        let redirect =
            self.read_string(&mut context, "__redirect === null ? '' : String(__redirect);")?;

        Ok(ScriptHarvest {
            written_html,
            redirect: (!redirect.is_empty()).then_some(redirect),
        })
    }
}
