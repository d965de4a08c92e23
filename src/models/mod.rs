use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Columns that identify a player row. Never namespaced, used as merge keys.
pub const ID_COLUMNS: [&str; 6] = ["Player", "Nation", "Pos", "Squad", "Age", "Born"];

/// Season the site serves without a year segment in its URLs.
pub const CURRENT_SEASON: Season = Season { start: 25, end: 26 };

/// Oldest season offered in the catalog.
const OLDEST_SEASON_START: u8 = 17;

// ── League ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct League {
    pub name: &'static str,
    pub competition_id: u32,
    pub slug: &'static str,
}

pub const LEAGUES: [League; 5] = [
    League { name: "Serie A", competition_id: 11, slug: "Serie-A" },
    League { name: "Premier League", competition_id: 9, slug: "Premier-League" },
    League { name: "Liga", competition_id: 12, slug: "La-Liga" },
    League { name: "Bundesliga", competition_id: 20, slug: "Bundesliga" },
    League { name: "Ligue 1", competition_id: 13, slug: "Ligue-1" },
];

impl League {
    /// Case-insensitive lookup by display name or URL slug.
    pub fn find(name: &str) -> Option<&'static League> {
        let name = name.trim();
        LEAGUES
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name) || l.slug.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for League {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ── Stat type ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatType {
    /// Command-line name.
    pub key: &'static str,
    /// Prefix of this stat's columns in the merged table. Matches the labels
    /// earlier exports used, so `"sca & gca"` rather than the key.
    pub column_prefix: &'static str,
    pub url_segment: &'static str,
    /// Substring of the table's DOM id (ids carry per-competition suffixes).
    pub table_fragment: &'static str,
    #[serde(skip)]
    pub aliases: &'static [&'static str],
}

pub const STAT_TYPES: [StatType; 11] = [
    StatType { key: "standard", column_prefix: "standard", url_segment: "stats", table_fragment: "stats_standard", aliases: &[] },
    StatType { key: "gk", column_prefix: "gk", url_segment: "keepers", table_fragment: "stats_keeper", aliases: &["goalkeeping"] },
    StatType { key: "gk_advanced", column_prefix: "gk_advanced", url_segment: "keepersadv", table_fragment: "stats_keeper_adv", aliases: &[] },
    StatType { key: "shooting", column_prefix: "shooting", url_segment: "shooting", table_fragment: "stats_shooting", aliases: &[] },
    StatType { key: "passing", column_prefix: "passing", url_segment: "passing", table_fragment: "stats_passing", aliases: &[] },
    StatType { key: "pass_types", column_prefix: "pass_types", url_segment: "passing_types", table_fragment: "stats_passing_types", aliases: &[] },
    StatType { key: "sca_gca", column_prefix: "sca & gca", url_segment: "gca", table_fragment: "stats_gca", aliases: &["sca & gca", "gca"] },
    StatType { key: "defense", column_prefix: "defense", url_segment: "defense", table_fragment: "stats_defense", aliases: &[] },
    StatType { key: "possession", column_prefix: "possession", url_segment: "possession", table_fragment: "stats_possession", aliases: &[] },
    StatType { key: "playing_time", column_prefix: "playing time", url_segment: "playingtime", table_fragment: "stats_playing_time", aliases: &["playing time"] },
    StatType { key: "misc", column_prefix: "miscellaneous", url_segment: "misc", table_fragment: "stats_misc", aliases: &["miscellaneous"] },
];

impl StatType {
    pub fn find(key: &str) -> Option<&'static StatType> {
        let key = key.trim();
        STAT_TYPES.iter().find(|s| {
            s.key.eq_ignore_ascii_case(key) || s.aliases.iter().any(|a| a.eq_ignore_ascii_case(key))
        })
    }
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key)
    }
}

// ── Season ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid season {0:?}: expected two consecutive two-digit years like \"24-25\"")]
pub struct SeasonParseError(String);

/// Two-digit year pair, e.g. `24-25`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Season {
    start: u8,
    end: u8,
}

impl Season {
    pub fn is_current(&self) -> bool {
        *self == CURRENT_SEASON
    }

    /// `"2024-2025"` for `24-25`; `None` for the current season.
    pub fn year_range(&self) -> Option<String> {
        if self.is_current() {
            None
        } else {
            Some(format!("20{:02}-20{:02}", self.start, self.end))
        }
    }

    /// Newest first, current season included.
    pub fn catalog() -> Vec<Season> {
        (OLDEST_SEASON_START..=CURRENT_SEASON.start)
            .rev()
            .map(|start| Season { start, end: (start + 1) % 100 })
            .collect()
    }
}

impl FromStr for Season {
    type Err = SeasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SeasonParseError(s.to_string());
        let (a, b) = s.trim().split_once('-').ok_or_else(err)?;
        if a.len() != 2 || b.len() != 2 {
            return Err(err());
        }
        let start: u8 = a.parse().map_err(|_| err())?;
        let end: u8 = b.parse().map_err(|_| err())?;
        if (start + 1) % 100 != end {
            return Err(err());
        }
        Ok(Season { start, end })
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.start, self.end)
    }
}

// ── Stat request ──────────────────────────────────────────────────────────────

/// One (league, season, statistic) unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRequest {
    pub league: &'static League,
    pub season: Season,
    pub stat: &'static StatType,
}

impl StatRequest {
    pub fn new(league: &'static League, season: Season, stat: &'static StatType) -> Self {
        Self { league, season, stat }
    }

    /// e.g. `{base}/en/comps/11/2023-2024/shooting/2023-2024-Serie-A-Stats`
    pub fn url(&self, base: &Url) -> Result<Url, url::ParseError> {
        let base = base.as_str().trim_end_matches('/');
        let League { competition_id, slug, .. } = *self.league;
        let segment = self.stat.url_segment;

        let path = match self.season.year_range() {
            Some(years) => format!("en/comps/{competition_id}/{years}/{segment}/{years}-{slug}-Stats"),
            None => format!("en/comps/{competition_id}/{segment}/{slug}-Stats"),
        };
        Url::parse(&format!("{base}/{path}"))
    }
}

impl fmt::Display for StatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.league, self.season, self.stat)
    }
}

// ── Cells & tables ────────────────────────────────────────────────────────────

/// Dynamically typed table cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Missing,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// "1,234" → Int(1234) | "0.35", "1,234.5" → Float | "" → Missing | anything else → Text
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        if s.is_empty() {
            return Cell::Missing;
        }
        if let Some(digits) = strip_thousands(s) {
            if let Ok(n) = digits.parse::<i64>() {
                return Cell::Int(n);
            }
        }
        if let Some(x) = parse_grouped_decimal(s) {
            return Cell::Float(x);
        }
        let numeric_chars = s.bytes().all(|b| b.is_ascii_digit() || b"+-.eE".contains(&b));
        if numeric_chars && s.bytes().any(|b| b.is_ascii_digit()) {
            if let Ok(x) = s.parse::<f64>() {
                if x.is_finite() {
                    return Cell::Float(x);
                }
            }
        }
        Cell::Text(s.to_string())
    }

    pub fn text(s: impl Into<String>) -> Self {
        Cell::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Returns the digits of an integer literal with optional well-formed
/// thousands separators, or `None` if `s` is not one.
fn strip_thousands(s: &str) -> Option<String> {
    let (sign, body) = match s.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", s.strip_prefix('+').unwrap_or(s)),
    };
    let mut groups = body.split(',');
    let head = groups.next()?;
    if head.is_empty() || (head.len() > 3 && body.contains(',')) || !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut out = format!("{sign}{head}");
    for g in groups {
        if g.len() != 3 || !g.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        out.push_str(g);
    }
    Some(out)
}

/// `"1,234.5"`: well-formed thousands groups, then a fraction.
fn parse_grouped_decimal(s: &str) -> Option<f64> {
    let (whole, frac) = s.split_once('.')?;
    if !whole.contains(',') || frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits = strip_thousands(whole)?;
    format!("{digits}.{frac}").parse().ok()
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Missing => Ok(()),
            Cell::Int(n) => write!(f, "{n}"),
            // Whole floats keep a decimal so float columns stay recognisable.
            Cell::Float(x) if x.fract() == 0.0 => write!(f, "{x:.1}"),
            Cell::Float(x) => write!(f, "{x}"),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<i64> for Cell {
    fn from(n: i64) -> Self {
        Cell::Int(n)
    }
}

/// Table exactly as it came out of the page markup.
///
/// `header` holds one vector per header level (outermost first), each
/// `width()` long after colspan expansion. Rows are not padded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub header: Vec<Vec<String>>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn width(&self) -> usize {
        self.header.last().map(Vec::len).unwrap_or(0)
    }
}

/// Schema-flexible table: named columns over rows of dynamic cells.
/// Every row is exactly `columns.len()` wide.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl DataTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Pads short rows with `Missing`, truncates long ones.
    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        row.resize(self.columns.len(), Cell::Missing);
        self.rows.push(row);
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Removes a column. Returns `false` if it did not exist.
    pub fn drop_column(&mut self, name: &str) -> bool {
        let Some(idx) = self.column_index(name) else { return false };
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        true
    }

    pub fn rename_columns(&mut self, mut f: impl FnMut(&str) -> Option<String>) {
        for col in &mut self.columns {
            if let Some(new) = f(col) {
                *col = new;
            }
        }
    }

    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[Cell]) -> bool) {
        self.rows.retain(|r| keep(r));
    }

    /// Appends a column holding `value` on every row.
    pub fn with_constant(mut self, name: &str, value: Cell) -> Self {
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(value.clone());
        }
        self
    }

    /// Stacks tables; columns are the union in first-seen order.
    pub fn concat(tables: impl IntoIterator<Item = DataTable>) -> DataTable {
        let tables: Vec<DataTable> = tables.into_iter().collect();
        let mut columns: Vec<String> = Vec::new();
        let mut mappings: Vec<Vec<usize>> = Vec::with_capacity(tables.len());
        for t in &tables {
            let mapping = t
                .columns
                .iter()
                .map(|c| match columns.iter().position(|x| x == c) {
                    Some(idx) => idx,
                    None => {
                        columns.push(c.clone());
                        columns.len() - 1
                    }
                })
                .collect();
            mappings.push(mapping);
        }

        let mut out = DataTable::new(columns);
        for (t, mapping) in tables.into_iter().zip(mappings) {
            for row in t.rows {
                let mut full = vec![Cell::Missing; out.columns.len()];
                for (cell, &idx) in row.into_iter().zip(&mapping) {
                    full[idx] = cell;
                }
                out.rows.push(full);
            }
        }
        out
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://fbref.com").unwrap()
    }

    #[test]
    fn test_past_season_url_expands_years() {
        let req = StatRequest::new(
            League::find("Serie A").unwrap(),
            "23-24".parse().unwrap(),
            StatType::find("shooting").unwrap(),
        );
        assert_eq!(
            req.url(&base()).unwrap().as_str(),
            "https://fbref.com/en/comps/11/2023-2024/shooting/2023-2024-Serie-A-Stats"
        );
    }

    #[test]
    fn test_year_expansion_holds_for_whole_catalog() {
        for season in Season::catalog().into_iter().filter(|s| !s.is_current()) {
            let token = season.to_string();
            let (yy1, yy2) = token.split_once('-').unwrap();
            let expected = format!("20{yy1}-20{yy2}");
            assert_eq!(season.year_range().as_deref(), Some(expected.as_str()));

            for league in &LEAGUES {
                let url = StatRequest::new(league, season, &STAT_TYPES[0]).url(&base()).unwrap();
                assert!(url.path().contains(&format!("/{expected}/stats/{expected}-{}-Stats", league.slug)));
            }
        }
    }

    #[test]
    fn test_current_season_url_has_no_year_segment() {
        let req = StatRequest::new(
            League::find("premier league").unwrap(),
            CURRENT_SEASON,
            StatType::find("standard").unwrap(),
        );
        assert_eq!(
            req.url(&base()).unwrap().as_str(),
            "https://fbref.com/en/comps/9/stats/Premier-League-Stats"
        );
    }

    #[test]
    fn test_season_catalog() {
        let seasons: Vec<String> = Season::catalog().iter().map(|s| s.to_string()).collect();
        assert_eq!(seasons.len(), 9);
        assert_eq!(seasons.first().map(String::as_str), Some("25-26"));
        assert_eq!(seasons.last().map(String::as_str), Some("17-18"));
    }

    #[test]
    fn test_season_rejects_garbage() {
        assert!("2024-2025".parse::<Season>().is_err());
        assert!("24-26".parse::<Season>().is_err());
        assert!("ab-cd".parse::<Season>().is_err());
        assert_eq!("99-00".parse::<Season>().unwrap().year_range().as_deref(), Some("2099-2000"));
    }

    #[test]
    fn test_stat_lookup_accepts_display_labels() {
        assert_eq!(StatType::find("sca & gca").unwrap().key, "sca_gca");
        assert_eq!(StatType::find("Playing Time").unwrap().url_segment, "playingtime");
        assert!(StatType::find("xg_chain").is_none());
    }

    #[test]
    fn test_column_prefixes_use_display_labels() {
        assert_eq!(StatType::find("sca_gca").unwrap().column_prefix, "sca & gca");
        assert_eq!(StatType::find("playing_time").unwrap().column_prefix, "playing time");
        assert_eq!(StatType::find("misc").unwrap().column_prefix, "miscellaneous");
        assert_eq!(StatType::find("standard").unwrap().column_prefix, "standard");
    }

    #[test]
    fn test_cell_parse() {
        assert_eq!(Cell::parse(" 3 "), Cell::Int(3));
        assert_eq!(Cell::parse("1,234"), Cell::Int(1234));
        assert_eq!(Cell::parse("0.35"), Cell::Float(0.35));
        assert_eq!(Cell::parse(""), Cell::Missing);
        assert_eq!(Cell::parse("24-123"), Cell::text("24-123"));
        assert_eq!(Cell::parse("Nan"), Cell::text("Nan"));
        assert_eq!(Cell::parse("1,2"), Cell::text("1,2"));
        assert_eq!(Cell::parse("1,234.5"), Cell::Float(1234.5));
        assert_eq!(Cell::parse("-12,000.25"), Cell::Float(-12000.25));
        assert_eq!(Cell::parse("1,23.5"), Cell::text("1,23.5"));
        assert_eq!(Cell::parse("1,234."), Cell::text("1,234."));
    }

    #[test]
    fn test_float_display_keeps_a_decimal() {
        assert_eq!(Cell::parse("90.0").to_string(), "90.0");
        assert_eq!(Cell::parse("1.50").to_string(), "1.5");
        assert_eq!(Cell::Float(-3.0).to_string(), "-3.0");
        assert_eq!(Cell::Int(90).to_string(), "90");
    }

    #[test]
    fn test_concat_unions_columns() {
        let a = DataTable::from_rows(vec!["Player".into(), "A".into()], vec![vec!["x".into(), 1.into()]]);
        let b = DataTable::from_rows(vec!["Player".into(), "B".into()], vec![vec!["y".into(), 2.into()]]);
        let out = DataTable::concat([a, b]);
        assert_eq!(out.columns(), ["Player", "A", "B"]);
        assert_eq!(out.value(1, "A"), Some(&Cell::Missing));
        assert_eq!(out.value(1, "B"), Some(&Cell::Int(2)));
    }
}
