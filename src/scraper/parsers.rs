use crate::models::RawTable;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on `colspan`; anything larger is treated as garbage.
const MAX_COLSPAN: usize = 64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no table whose id contains {0:?}")]
    NotFound(String),

    #[error("malformed table {id:?}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("invalid selector: {0}")]
    Selector(String),
}

fn selector(s: &str) -> Result<Selector, ExtractError> {
    Selector::parse(s).map_err(|e| ExtractError::Selector(format!("{s}: {e:?}")))
}

// ── Table lookup ──────────────────────────────────────────────────────────────

/// Finds the `<table>` whose id contains `fragment` and parses it.
///
/// The site ships every table after the first inside an HTML comment for
/// clients that do not run its scripts, so a miss in the live markup is
/// retried once with comment markers stripped.
pub fn extract_table(html: &str, fragment: &str) -> Result<RawTable, ExtractError> {
    if fragment.is_empty() || !fragment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ExtractError::Selector(format!("unsupported table id fragment {fragment:?}")));
    }

    if let Some(table) = find_table(html, fragment)? {
        return Ok(table);
    }

    if html.contains("<!--") {
        debug!("{}: not in live markup, looking inside comments", fragment);
        let uncommented = html.replace("<!--", "").replace("-->", "");
        if let Some(table) = find_table(&uncommented, fragment)? {
            return Ok(table);
        }
    }

    Err(ExtractError::NotFound(fragment.to_string()))
}

fn find_table(html: &str, fragment: &str) -> Result<Option<RawTable>, ExtractError> {
    let doc = Html::parse_document(html);
    let table_sel = selector(&format!("table[id*='{fragment}']"))?;

    let Some(table) = doc.select(&table_sel).next() else { return Ok(None) };
    parse_table(table).map(Some)
}

// ── Table parsing ─────────────────────────────────────────────────────────────

fn parse_table(table: ElementRef) -> Result<RawTable, ExtractError> {
    let id = table.value().id().unwrap_or_default().to_string();
    let head_sel = selector("thead > tr")?;
    let body_sel = selector("tbody > tr")?;
    let any_row_sel = selector("tr")?;
    let cell_sel = selector("th, td")?;

    let mut header: Vec<Vec<String>> = table
        .select(&head_sel)
        .map(|tr| expand_row(tr, &cell_sel))
        .collect();

    let rows: Vec<Vec<String>> = if header.is_empty() {
        // No <thead>: first row is the header.
        let mut all = table.select(&any_row_sel).map(|tr| expand_row(tr, &cell_sel));
        header.extend(all.next());
        all.collect()
    } else {
        table.select(&body_sel).map(|tr| expand_row(tr, &cell_sel)).collect()
    };

    let width = header.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return Err(ExtractError::Malformed { id, reason: "no header cells".into() });
    }
    for level in &mut header {
        if level.len() < width {
            warn!("{}: header level has {} of {} columns, padding", id, level.len(), width);
            level.resize(width, String::new());
        }
    }

    let rows: Vec<Vec<String>> = rows
        .into_iter()
        .filter(|r| r.iter().any(|c| !c.is_empty()))
        .collect();

    debug!("{}: {} header levels, {} columns, {} rows", id, header.len(), width, rows.len());
    Ok(RawTable { header, rows })
}

/// Cell texts with whitespace collapsed and `colspan` expanded (a spanning
/// cell repeats its text, so group labels cover every leaf below them).
fn expand_row(tr: ElementRef, cell_sel: &Selector) -> Vec<String> {
    let mut out = Vec::new();
    for cell in tr.select(cell_sel) {
        let text = cell.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let span = cell
            .value()
            .attr("colspan")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(1)
            .clamp(1, MAX_COLSPAN);
        out.extend(std::iter::repeat_n(text, span));
    }
    out
}
