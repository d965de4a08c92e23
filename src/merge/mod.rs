//! Per-(league, season) accumulation of normalized stat tables.
//!
//! Each stat table is outer-joined into its group's accumulator on whichever
//! identity columns both sides carry. At the end every group is tagged with
//! its league and season and the groups are stacked into one table.

use crate::models::{Cell, DataTable, League, Season};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

pub const LEAGUE_COLUMN: &str = "League";
pub const SEASON_COLUMN: &str = "Season";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupKey {
    pub league: &'static League,
    pub season: Season,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.league, self.season)
    }
}

/// What happened to a table handed to [`Accumulator::fold_into`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    /// First table for the group.
    Seeded,
    /// Joined on these columns.
    Joined(Vec<String>),
    /// No shared identity column; the table was discarded.
    Dropped,
}

/// Groups in first-seen order.
#[derive(Debug, Default)]
pub struct Accumulator {
    groups: Vec<(GroupKey, DataTable)>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn fold_into(&mut self, key: GroupKey, table: DataTable, id_columns: &[&str]) -> FoldOutcome {
        let Some(pos) = self.groups.iter().position(|(k, _)| *k == key) else {
            debug!("{}: seeded with {} rows", key, table.len());
            self.groups.push((key, table));
            return FoldOutcome::Seeded;
        };
        let acc = &mut self.groups[pos].1;

        let merge_keys: Vec<String> = id_columns
            .iter()
            .filter(|c| acc.has_column(c) && table.has_column(c))
            .map(|c| c.to_string())
            .collect();

        // Kept as-is: a table sharing no identity column is lost, not appended.
        if merge_keys.is_empty() {
            warn!(
                "{}: no identity column shared with accumulated table ({} columns), dropping {} rows",
                key,
                table.columns().len(),
                table.len()
            );
            return FoldOutcome::Dropped;
        }

        let merged = outer_join(std::mem::take(acc), table, &merge_keys);
        debug!("{}: joined on {:?} → {} rows", key, merge_keys, merged.len());
        *acc = merged;
        FoldOutcome::Joined(merge_keys)
    }

    /// Tags each group with League and Season and stacks them. Empty when
    /// nothing was folded.
    pub fn into_final(self) -> DataTable {
        DataTable::concat(self.groups.into_iter().map(|(key, table)| {
            table
                .with_constant(LEAGUE_COLUMN, Cell::text(key.league.name))
                .with_constant(SEASON_COLUMN, Cell::text(key.season.to_string()))
        }))
    }
}

// ── Join ──────────────────────────────────────────────────────────────────────

fn row_key(row: &[Cell], idx: &[usize]) -> Vec<String> {
    idx.iter().map(|&i| row[i].to_string()).collect()
}

/// Full outer join on `keys`.
///
/// Every key combination present on either side appears; a key matching
/// several rows yields their cross product. Missing keys compare equal.
/// Non-key columns present on both sides become `{name}_x` / `{name}_y`.
/// Output is left rows in order (with their matches), then right rows that
/// matched nothing.
pub fn outer_join(left: DataTable, right: DataTable, keys: &[String]) -> DataTable {
    let left_key_idx: Vec<usize> = keys.iter().filter_map(|k| left.column_index(k)).collect();
    let right_key_idx: Vec<usize> = keys.iter().filter_map(|k| right.column_index(k)).collect();
    let key_set: HashSet<&str> = keys.iter().map(String::as_str).collect();

    let left_cols = left.columns();
    let right_cols = right.columns();
    let overlap: HashSet<&str> = left_cols
        .iter()
        .filter(|c| !key_set.contains(c.as_str()) && right_cols.contains(c))
        .map(String::as_str)
        .collect();

    let right_extra: Vec<usize> = (0..right_cols.len())
        .filter(|i| !key_set.contains(right_cols[*i].as_str()))
        .collect();

    let mut columns: Vec<String> = left_cols
        .iter()
        .map(|c| if overlap.contains(c.as_str()) { format!("{c}_x") } else { c.clone() })
        .collect();
    columns.extend(right_extra.iter().map(|&i| {
        let c = &right_cols[i];
        if overlap.contains(c.as_str()) { format!("{c}_y") } else { c.clone() }
    }));

    let mut index: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for (i, row) in right.rows().iter().enumerate() {
        index.entry(row_key(row, &right_key_idx)).or_default().push(i);
    }

    let width_left = left_cols.len();
    let mut matched = vec![false; right.len()];
    let mut rows: Vec<Vec<Cell>> = Vec::with_capacity(left.len().max(right.len()));

    for lrow in left.rows() {
        match index.get(&row_key(lrow, &left_key_idx)) {
            Some(hits) => {
                for &ri in hits {
                    matched[ri] = true;
                    let rrow = &right.rows()[ri];
                    let mut out = lrow.clone();
                    out.extend(right_extra.iter().map(|&i| rrow[i].clone()));
                    rows.push(out);
                }
            }
            None => {
                let mut out = lrow.clone();
                out.resize(columns.len(), Cell::Missing);
                rows.push(out);
            }
        }
    }

    for (ri, rrow) in right.rows().iter().enumerate() {
        if matched[ri] {
            continue;
        }
        let mut out = vec![Cell::Missing; width_left];
        for (&li, &rk) in left_key_idx.iter().zip(&right_key_idx) {
            out[li] = rrow[rk].clone();
        }
        out.extend(right_extra.iter().map(|&i| rrow[i].clone()));
        rows.push(out);
    }

    DataTable::from_rows(columns, rows)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ID_COLUMNS;
    use std::collections::BTreeSet;

    fn table(columns: &[&str], rows: Vec<Vec<Cell>>) -> DataTable {
        DataTable::from_rows(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    fn group_table<'a>(acc: &'a Accumulator, key: &GroupKey) -> Option<&'a DataTable> {
        acc.groups.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }

    fn group() -> GroupKey {
        GroupKey { league: League::find("Serie A").unwrap(), season: "23-24".parse().unwrap() }
    }

    fn standard() -> DataTable {
        table(
            &["Player", "Squad", "standard_Gls"],
            vec![
                vec!["X".into(), "Y".into(), Cell::Int(3)],
                vec!["A".into(), "B".into(), Cell::Int(1)],
            ],
        )
    }

    fn shooting() -> DataTable {
        table(
            &["Player", "Squad", "shooting_Sh"],
            vec![
                vec!["X".into(), "Y".into(), Cell::Int(10)],
                vec!["C".into(), "D".into(), Cell::Int(7)],
            ],
        )
    }

    fn identities(t: &DataTable) -> BTreeSet<(String, String)> {
        t.rows()
            .iter()
            .map(|r| {
                let p = t.column_index("Player").unwrap();
                let s = t.column_index("Squad").unwrap();
                (r[p].to_string(), r[s].to_string())
            })
            .collect()
    }

    #[test]
    fn test_first_table_seeds_group() {
        let mut acc = Accumulator::new();
        assert_eq!(acc.fold_into(group(), standard(), &ID_COLUMNS), FoldOutcome::Seeded);
        assert_eq!(group_table(&acc, &group()), Some(&standard()));
    }

    #[test]
    fn test_outer_join_keeps_all_rows() {
        let mut acc = Accumulator::new();
        acc.fold_into(group(), standard(), &ID_COLUMNS);
        let outcome = acc.fold_into(group(), shooting(), &ID_COLUMNS);
        assert_eq!(outcome, FoldOutcome::Joined(vec!["Player".into(), "Squad".into()]));

        let t = group_table(&acc, &group()).unwrap();
        assert_eq!(t.columns(), ["Player", "Squad", "standard_Gls", "shooting_Sh"]);
        assert_eq!(t.len(), 3);
        assert_eq!(t.rows()[0], vec![Cell::text("X"), Cell::text("Y"), Cell::Int(3), Cell::Int(10)]);
        assert_eq!(t.rows()[1], vec![Cell::text("A"), Cell::text("B"), Cell::Int(1), Cell::Missing]);
        assert_eq!(t.rows()[2], vec![Cell::text("C"), Cell::text("D"), Cell::Missing, Cell::Int(7)]);
    }

    #[test]
    fn test_row_coverage_is_commutative() {
        let keys = vec!["Player".to_string(), "Squad".to_string()];
        let ab = outer_join(standard(), shooting(), &keys);
        let ba = outer_join(shooting(), standard(), &keys);
        assert_eq!(ab.len(), ba.len());
        assert_eq!(identities(&ab), identities(&ba));
    }

    #[test]
    fn test_no_shared_identity_drops_table() {
        let mut acc = Accumulator::new();
        acc.fold_into(group(), standard(), &ID_COLUMNS);
        let stray = table(&["Rank", "Value"], vec![vec![Cell::Int(1), Cell::Int(2)]]);
        assert_eq!(acc.fold_into(group(), stray, &ID_COLUMNS), FoldOutcome::Dropped);
        assert_eq!(group_table(&acc, &group()), Some(&standard()));
    }

    #[test]
    fn test_cross_product_and_suffixes() {
        let keys = vec!["Squad".to_string()];
        let left = table(&["Squad", "v"], vec![vec!["Y".into(), Cell::Int(1)], vec!["Y".into(), Cell::Int(2)]]);
        let right = table(&["Squad", "v"], vec![vec!["Y".into(), Cell::Int(3)], vec!["Y".into(), Cell::Int(4)]]);
        let t = outer_join(left, right, &keys);
        assert_eq!(t.columns(), ["Squad", "v_x", "v_y"]);
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn test_missing_keys_match_each_other() {
        let keys = vec!["Player".to_string()];
        let left = table(&["Player", "a"], vec![vec![Cell::Missing, Cell::Int(1)]]);
        let right = table(&["Player", "b"], vec![vec![Cell::Missing, Cell::Int(2)]]);
        let t = outer_join(left, right, &keys);
        assert_eq!(t.rows(), [vec![Cell::Missing, Cell::Int(1), Cell::Int(2)]]);
    }

    #[test]
    fn test_final_table_tags_and_stacks_groups() {
        let mut acc = Accumulator::new();
        let other = GroupKey { league: League::find("Liga").unwrap(), season: group().season };
        acc.fold_into(group(), standard(), &ID_COLUMNS);
        acc.fold_into(other, shooting(), &ID_COLUMNS);

        let out = acc.into_final();
        assert_eq!(
            out.columns(),
            ["Player", "Squad", "standard_Gls", "League", "Season", "shooting_Sh"]
        );
        assert_eq!(out.len(), 4);
        assert_eq!(out.value(0, "League"), Some(&Cell::text("Serie A")));
        assert_eq!(out.value(0, "Season"), Some(&Cell::text("23-24")));
        assert_eq!(out.value(2, "League"), Some(&Cell::text("Liga")));
        assert_eq!(out.value(2, "standard_Gls"), Some(&Cell::Missing));
    }

    #[test]
    fn test_empty_accumulator_gives_empty_table() {
        let out = Accumulator::new().into_final();
        assert!(out.is_empty());
        assert!(out.columns().is_empty());
    }
}
