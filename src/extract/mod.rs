//! Payload extraction.
//!
//! Two table passes over fetched HTML: a regex-based quick pass for the
//! cheap first rung, and a DOM pass (via `scraper`) that understands
//! captions, header rows, colspan and nested tables. Link and title
//! extraction resolve against the final URL of the response.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// One extracted table. Header cells are kept separate from data rows;
/// both are whitespace-normalized and entity-decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Table {
    pub caption: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.rows.is_empty()
    }
}

/// Title and outbound links of a page, resolved in a single DOM parse.
#[derive(Debug, Clone, Default)]
pub struct PageContent {
    pub title: Option<String>,
    /// Absolute http/https URLs, fragment-stripped, deduplicated in
    /// document order.
    pub links: Vec<String>,
}

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|e| panic!("Invalid regex pattern '{pattern}': {e}"))
}

fn build_selector(css: &'static str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("Invalid selector '{css}': {e}"))
}

static TABLE_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"<table[^>]*>(?P<body>.*?)</table>"));
static ROW_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"<tr[^>]*>(?P<cells>.*?)</tr>"));
static CELL_RE: Lazy<Regex> =
    Lazy::new(|| build_regex(r"<(?P<tag>t[hd])[^>]*>(?P<text>.*?)</t[hd]>"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"<[^>]*>"));
static TITLE_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"<title[^>]*>(?P<text>.*?)</title>"));

static TABLE_SEL: Lazy<Selector> = Lazy::new(|| build_selector("table"));
static CAPTION_SEL: Lazy<Selector> = Lazy::new(|| build_selector("caption"));
static THEAD_ROW_SEL: Lazy<Selector> = Lazy::new(|| build_selector("thead tr"));
static ROW_SEL: Lazy<Selector> = Lazy::new(|| build_selector("tr"));
static CELL_SEL: Lazy<Selector> = Lazy::new(|| build_selector("th, td"));
static TITLE_SEL: Lazy<Selector> = Lazy::new(|| build_selector("title"));
static ANCHOR_SEL: Lazy<Selector> = Lazy::new(|| build_selector("a[href]"));

/// Collapses runs of whitespace and trims the ends.
fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_tags(fragment: &str) -> String {
    let stripped = TAG_RE.replace_all(fragment, " ");
    normalize_ws(&html_escape::decode_html_entities(stripped.as_ref()))
}

/// Regex-based table pass. Fast and allocation-light, but deliberately
/// naive: nested tables truncate at the first closing tag and markup
/// inside cells is flattened to text. The DOM pass covers those cases.
pub fn quick_tables(html: &str) -> Vec<Table> {
    let mut tables = Vec::new();

    for table_caps in TABLE_RE.captures_iter(html) {
        let body = table_caps.name("body").map(|m| m.as_str()).unwrap_or("");
        let mut table = Table::default();

        for (row_index, row_caps) in ROW_RE.captures_iter(body).enumerate() {
            let cells_fragment = row_caps.name("cells").map(|m| m.as_str()).unwrap_or("");
            let mut cells = Vec::new();
            let mut all_header_cells = true;

            for cell_caps in CELL_RE.captures_iter(cells_fragment) {
                let tag = cell_caps.name("tag").map(|m| m.as_str()).unwrap_or("td");
                if !tag.eq_ignore_ascii_case("th") {
                    all_header_cells = false;
                }
                let text = cell_caps.name("text").map(|m| m.as_str()).unwrap_or("");
                cells.push(strip_tags(text));
            }

            if cells.is_empty() {
                continue;
            }
            if row_index == 0 && all_header_cells {
                table.headers = cells;
            } else {
                table.rows.push(cells);
            }
        }

        if !table.is_empty() {
            tables.push(table);
        }
    }

    tables
}

/// Regex-based title lookup for the cheap rung.
pub fn quick_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .and_then(|caps| caps.name("text"))
        .map(|m| strip_tags(m.as_str()))
        .filter(|t| !t.is_empty())
}

/// DOM table pass. Handles `<caption>`, `<thead>` header rows, a
/// first-row-of-`<th>` fallback, colspan expansion and nested tables
/// (a row is attributed to its nearest enclosing table only).
pub fn dom_tables(html: &str) -> Vec<Table> {
    let document = Html::parse_document(html);
    let mut tables = Vec::new();

    for table_el in document.select(&TABLE_SEL) {
        let mut table = Table {
            caption: table_el
                .select(&CAPTION_SEL)
                .find(|c| owned_by(*c, &table_el, "table"))
                .map(|c| element_text(c))
                .filter(|c| !c.is_empty()),
            ..Table::default()
        };

        if let Some(head_row) = table_el
            .select(&THEAD_ROW_SEL)
            .find(|r| owned_by(*r, &table_el, "table"))
        {
            table.headers = row_cells(head_row);
        }

        for row in table_el.select(&ROW_SEL) {
            if !owned_by(row, &table_el, "table") {
                continue;
            }
            if in_thead(row) {
                continue;
            }
            let cells = row_cells(row);
            if cells.is_empty() {
                continue;
            }
            // No <thead>: promote a leading all-<th> row to headers.
            if table.headers.is_empty() && table.rows.is_empty() && all_header_cells(row) {
                table.headers = cells;
            } else {
                table.rows.push(cells);
            }
        }

        if !table.is_empty() {
            tables.push(table);
        }
    }

    tables
}

/// Title plus absolute outbound links in one parse.
pub fn page_content(html: &str, base: &Url) -> PageContent {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE_SEL)
        .next()
        .map(|el| element_text(el))
        .filter(|t| !t.is_empty());

    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&ANCHOR_SEL) {
        if let Some(href) = anchor.value().attr("href")
            && let Some(resolved) = resolve_link(href, base)
            && seen.insert(resolved.clone())
        {
            links.push(resolved);
        }
    }

    PageContent { title, links }
}

/// Resolves an href against the page URL, dropping non-http(s) schemes
/// and same-page anchors. Fragments are stripped so `/a#x` and `/a#y`
/// dedupe to one link.
fn resolve_link(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    match base.join(href) {
        Ok(mut absolute) => {
            if absolute.scheme() != "http" && absolute.scheme() != "https" {
                return None;
            }
            absolute.set_fragment(None);
            Some(absolute.to_string())
        }
        Err(_) => None,
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_ws(&el.text().collect::<String>())
}

/// True when `el`'s nearest ancestor with the given tag name is
/// `owner`. Used to keep nested-table rows out of the outer table.
fn owned_by(el: ElementRef<'_>, owner: &ElementRef<'_>, tag: &str) -> bool {
    for ancestor in el.ancestors() {
        if let Some(element) = ElementRef::wrap(ancestor)
            && element.value().name() == tag
        {
            return element.id() == owner.id();
        }
    }
    false
}

fn in_thead(row: ElementRef<'_>) -> bool {
    for ancestor in row.ancestors() {
        if let Some(element) = ElementRef::wrap(ancestor) {
            match element.value().name() {
                "thead" => return true,
                "table" => return false,
                _ => {}
            }
        }
    }
    false
}

fn all_header_cells(row: ElementRef<'_>) -> bool {
    let mut saw_cell = false;
    for cell in row.select(&CELL_SEL) {
        if !owned_by(cell, &row, "tr") {
            continue;
        }
        saw_cell = true;
        if cell.value().name() != "th" {
            return false;
        }
    }
    saw_cell
}

/// Cell texts of one row, with `colspan` repeated so every row of a
/// table lines up column-wise. Spans are capped to keep hostile markup
/// from ballooning the output.
fn row_cells(row: ElementRef<'_>) -> Vec<String> {
    const MAX_SPAN: usize = 64;

    let mut cells = Vec::new();
    for cell in row.select(&CELL_SEL) {
        if !owned_by(cell, &row, "tr") {
            continue;
        }
        let span = cell
            .value()
            .attr("colspan")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(1)
            .clamp(1, MAX_SPAN);
        let text = element_text(cell);
        for _ in 0..span {
            cells.push(text.clone());
        }
    }
    cells
}
