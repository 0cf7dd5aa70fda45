//! Resistance detection.
//!
//! Pattern-based identification of challenge and interstitial pages.
//! A body that matches a known signature is unusable payload even when
//! the transport said 200, so detection runs on every response and the
//! verdict decides whether a cheaper strategy gives up in favor of a
//! heavier one.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// What a detected signature suggests about getting past the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EscalationHint {
    /// The page gates on script execution; rendering may pass.
    Render,
    /// The page gates on cookies or prior state; a session-carrying
    /// strategy may pass.
    Session,
    /// The origin asked for less traffic; waiting is the only cure.
    Backoff,
    /// Explicit block (captcha, ban page). No rung of the ladder helps.
    Blocked,
}

/// Detection verdict handed back to the strategies.
#[derive(Debug, Clone)]
pub struct Resistance {
    pub signature: &'static str,
    pub hint: EscalationHint,
    /// The indicator patterns that fired, for logs and error messages.
    pub matched: Vec<String>,
}

impl fmt::Display for Resistance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} page detected", self.signature)
    }
}

struct ResistanceSignature {
    name: &'static str,
    hint: EscalationHint,
    /// When set, the signature only applies to these status codes.
    /// Phrases that occur in ordinary prose stay gated; structural
    /// markers match on any status, interstitials ship as 200 too.
    statuses: Option<&'static [u16]>,
    base_confidence: f32,
    indicators: Vec<Regex>,
}

impl ResistanceSignature {
    fn new(
        name: &'static str,
        hint: EscalationHint,
        statuses: Option<&'static [u16]>,
        base_confidence: f32,
        raw_indicators: &[&str],
    ) -> Self {
        Self {
            name,
            hint,
            statuses,
            base_confidence,
            indicators: raw_indicators.iter().map(|p| build_regex(p)).collect(),
        }
    }
}

static SIGNATURES: Lazy<Vec<ResistanceSignature>> = Lazy::new(|| {
    vec![
        ResistanceSignature::new(
            "javascript_challenge",
            EscalationHint::Render,
            None,
            0.95,
            &[
                r"<title>\s*Just a moment\.?\.?\.?\s*</title>",
                r"<title>[^<]*Attention Required[^<]*</title>",
                r"Checking your browser before accessing",
                r"enable JavaScript and cookies to continue",
            ],
        ),
        ResistanceSignature::new(
            "challenge_form",
            EscalationHint::Render,
            None,
            0.95,
            &[
                r#"<form[^>]*id=['"]challenge-form['"]"#,
                r#"class=['"]cf-browser-verification"#,
                r"/cdn-cgi/challenge-platform/",
                r"window\._cf_chl_opt\s*=",
            ],
        ),
        ResistanceSignature::new(
            "captcha_gate",
            EscalationHint::Blocked,
            None,
            0.98,
            &[
                r#"class=['"][^'"]*g-recaptcha"#,
                r#"class=['"][^'"]*h-captcha"#,
                r#"class=['"]cf-turnstile['"]"#,
                r"challenges\.cloudflare\.com/turnstile",
            ],
        ),
        ResistanceSignature::new(
            "rate_limit_page",
            EscalationHint::Backoff,
            None,
            0.99,
            &[
                r"You are being rate limited",
                r"<title>\s*Rate Limited\s*</title>",
                r#"<span[^>]*class=['"]cf-error-code['"]>\s*1015"#,
            ],
        ),
        ResistanceSignature::new(
            "access_denied",
            EscalationHint::Blocked,
            Some(&[403, 429, 503]),
            0.99,
            &[
                r"<title>[^<]*Access denied[^<]*</title>",
                r"The owner of this website has banned your access",
                r"has banned you temporarily",
                r#"<span[^>]*class=['"]cf-error-code['"]>\s*10(?:10|20)"#,
            ],
        ),
        ResistanceSignature::new(
            "cookie_wall",
            EscalationHint::Session,
            None,
            0.90,
            &[
                r"Please enable cookies(?:\s+and reload)?",
                r"<title>[^<]*Pardon Our Interruption[^<]*</title>",
            ],
        ),
    ]
});

/// Matches the body against every known signature and returns the most
/// confident verdict, if any. A signature counts when at least half of
/// its weighted indicators fire, so lone generic phrases on otherwise
/// ordinary pages stay quiet.
pub fn inspect(status: u16, body: &str) -> Option<Resistance> {
    let mut best: Option<(Resistance, f32)> = None;

    for signature in SIGNATURES.iter() {
        if let Some(allowed) = signature.statuses
            && !allowed.contains(&status)
        {
            continue;
        }

        let matched: Vec<String> = signature
            .indicators
            .iter()
            .filter(|regex| regex.is_match(body))
            .map(|regex| regex.as_str().to_string())
            .collect();
        if matched.is_empty() {
            continue;
        }

        // Any single indicator of a signature is specific enough on its
        // own; extra hits raise confidence for tie-breaking.
        let share = matched.len() as f32 / signature.indicators.len() as f32;
        let confidence = (signature.base_confidence * (0.6 + 0.4 * share)).min(1.0);

        if best
            .as_ref()
            .is_none_or(|(_, current)| confidence > *current)
        {
            best = Some((
                Resistance {
                    signature: signature.name,
                    hint: signature.hint,
                    matched,
                },
                confidence,
            ));
        }
    }

    best.map(|(resistance, _)| resistance)
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid resistance signature `{}`: {}", pattern, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_js_challenge_even_on_status_200() {
        let html = r#"
            <html><head><title>Just a moment...</title></head>
            <body><p>Please enable JavaScript and cookies to continue.</p></body></html>
        "#;
        let verdict = inspect(200, html).expect("should detect");
        assert_eq!(verdict.signature, "javascript_challenge");
        assert_eq!(verdict.hint, EscalationHint::Render);
    }

    #[test]
    fn flags_challenge_form_markup() {
        let html = r#"<form id="challenge-form" action="/x?__token=1"></form>"#;
        let verdict = inspect(503, html).expect("should detect");
        assert_eq!(verdict.signature, "challenge_form");
    }

    #[test]
    fn flags_captcha_gate() {
        let html = r#"<div class="cf-turnstile" data-sitekey="abc"></div>"#;
        let verdict = inspect(403, html).expect("should detect");
        assert_eq!(verdict.hint, EscalationHint::Blocked);
    }

    #[test]
    fn access_denied_requires_blocking_status() {
        let html = "<title>Access denied</title>";
        assert!(inspect(200, html).is_none());
        let verdict = inspect(403, html).expect("should detect");
        assert_eq!(verdict.signature, "access_denied");
    }

    #[test]
    fn rate_limit_page_hints_backoff() {
        let html = "<p>You are being rate limited</p>";
        let verdict = inspect(429, html).expect("should detect");
        assert_eq!(verdict.hint, EscalationHint::Backoff);
    }

    #[test]
    fn ordinary_page_passes_clean() {
        let html = r#"
            <html><head><title>Quarterly results</title></head>
            <body><table><tr><td>fine</td></tr></table></body></html>
        "#;
        assert!(inspect(200, html).is_none());
    }
}
