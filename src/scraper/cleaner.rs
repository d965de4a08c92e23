use crate::models::{Cell, DataTable, RawTable};
use std::collections::HashSet;
use tracing::debug;

/// Row-number column; the site repeats the header mid-table with this label.
pub const RANK_COLUMN: &str = "Rk";

/// Link-only columns with no statistical content.
pub const DROPPED_COLUMNS: [&str; 1] = ["Matches"];

/// Row identity for de-duplication.
pub const DEDUP_KEY: [&str; 2] = ["Player", "Squad"];

// ── Header flattening ─────────────────────────────────────────────────────────

/// Blank or pandas-style `Unnamed: …` group labels carry no meaning.
fn is_placeholder(group: &str) -> bool {
    let g = group.trim();
    g.is_empty() || g.starts_with("Unnamed")
}

/// One name per column. With two or more header levels the outermost one is
/// the group: `"Performance" / "Gls"` → `Performance_Gls`, `"" / "Player"` →
/// `Player`. Repeated names get `.1`, `.2`, … suffixes.
pub fn flatten_header(raw: &RawTable) -> Vec<String> {
    let width = raw.width();
    let leaves = raw.header.last().cloned().unwrap_or_default();
    let groups = if raw.header.len() > 1 { raw.header.first().cloned() } else { None };

    let names: Vec<String> = (0..width)
        .map(|i| {
            let leaf = leaves[i].trim();
            let group = groups.as_ref().map(|g| g[i].trim()).unwrap_or("");
            match (is_placeholder(group), leaf.is_empty()) {
                (true, false) => leaf.to_string(),
                (false, false) => format!("{group}_{leaf}"),
                (false, true) => group.to_string(),
                (true, true) => format!("Unnamed: {i}"),
            }
        })
        .collect();

    disambiguate(names)
}

fn disambiguate(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut n = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{name}.{n}");
                n += 1;
            }
            candidate
        })
        .collect()
}

/// Flattened header over typed cells.
pub fn to_data_table(raw: &RawTable) -> DataTable {
    let columns = flatten_header(raw);
    let rows = raw
        .rows
        .iter()
        .map(|r| r.iter().map(|s| Cell::parse(s)).collect())
        .collect();
    DataTable::from_rows(columns, rows)
}

// ── Row / column cleanup ──────────────────────────────────────────────────────

/// Drops header rows repeated inside the body, then the rank column itself.
/// Returns the number of rows removed.
pub fn drop_repeated_headers(table: &mut DataTable) -> usize {
    let Some(idx) = table.column_index(RANK_COLUMN) else { return 0 };
    let before = table.len();
    table.retain_rows(|row| row[idx].as_text() != Some(RANK_COLUMN));
    table.drop_column(RANK_COLUMN);
    before - table.len()
}

pub fn drop_irrelevant_columns(table: &mut DataTable) {
    for col in DROPPED_COLUMNS {
        if table.drop_column(col) {
            debug!("Dropped column {}", col);
        }
    }
}

/// Keeps the first row per (Player, Squad). Uses whichever of the two key
/// columns exist; does nothing if neither does. Returns rows removed.
pub fn dedupe_players(table: &mut DataTable) -> usize {
    let key_idx: Vec<usize> = DEDUP_KEY.iter().filter_map(|c| table.column_index(c)).collect();
    if key_idx.is_empty() {
        return 0;
    }

    let before = table.len();
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    table.retain_rows(|row| seen.insert(key_idx.iter().map(|&i| row[i].to_string()).collect()));
    before - table.len()
}

/// Prefixes every non-identity column with `{stat_prefix}_`. Columns already
/// carrying the prefix are left alone, so the step is idempotent.
pub fn namespace_columns(table: &mut DataTable, stat_prefix: &str, id_columns: &[&str]) {
    let prefix = format!("{stat_prefix}_");
    table.rename_columns(|col| {
        if id_columns.contains(&col) || col.starts_with(&prefix) {
            None
        } else {
            Some(format!("{prefix}{col}"))
        }
    });
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Raw page table → namespaced, de-duplicated table ready to merge.
pub fn normalize(raw: &RawTable, stat_prefix: &str, id_columns: &[&str]) -> DataTable {
    normalize_table(to_data_table(raw), stat_prefix, id_columns)
}

/// Cleanup steps on an already-flattened table.
pub fn normalize_table(mut table: DataTable, stat_prefix: &str, id_columns: &[&str]) -> DataTable {
    let header_rows = drop_repeated_headers(&mut table);
    drop_irrelevant_columns(&mut table);
    let dupes = dedupe_players(&mut table);
    namespace_columns(&mut table, stat_prefix, id_columns);

    debug!(
        "{}: {} rows × {} columns ({} repeated headers, {} duplicates removed)",
        stat_prefix,
        table.len(),
        table.columns().len(),
        header_rows,
        dupes
    );
    table
}

// ── Tests ─────────────────────────────────────────────────────────────────────
