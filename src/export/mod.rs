//! CSV export of the merged dataset.

use crate::models::DataTable;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Header row, then one record per row. Missing cells are empty fields.
pub fn to_writer<W: Write>(table: &DataTable, out: W) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(table.columns()).context("Failed to write CSV header")?;
    for (i, row) in table.rows().iter().enumerate() {
        writer
            .write_record(row.iter().map(|c| c.to_string()))
            .with_context(|| format!("Failed to write CSV row {}", i + 1))?;
    }
    writer.flush().context("Failed to flush CSV output")?;
    Ok(())
}

/// Writes `table` to `path`, creating parent directories as needed.
pub fn write_csv(table: &DataTable, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Cannot create {:?}", parent))?;
    }
    let file = fs::File::create(path).with_context(|| format!("Cannot create {:?}", path))?;
    to_writer(table, file)?;
    info!("Wrote {} rows × {} columns to {:?}", table.len(), table.columns().len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cell;

    fn merged() -> DataTable {
        DataTable::from_rows(
            vec!["Player".into(), "Squad".into(), "standard_Gls".into(), "League".into()],
            vec![
                vec![Cell::text("Rafael Leão"), Cell::text("Milan"), Cell::Int(9), Cell::text("Serie A")],
                vec![Cell::text("Smith, J"), Cell::text("Y"), Cell::Missing, Cell::text("Serie A")],
                vec![Cell::text("Z"), Cell::text("Y"), Cell::Float(0.35), Cell::text("Serie A")],
            ],
        )
    }

    #[test]
    fn test_csv_layout() {
        let mut buf = Vec::new();
        to_writer(&merged(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "Player,Squad,standard_Gls,League\n\
             Rafael Leão,Milan,9,Serie A\n\
             \"Smith, J\",Y,,Serie A\n\
             Z,Y,0.35,Serie A\n"
        );
    }

    #[test]
    fn test_write_csv_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("fbref_export_{}", std::process::id()));
        let path = dir.join("nested").join("out.csv");
        write_csv(&merged(), &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap().len(), 4);
        assert_eq!(reader.records().count(), 3);
        fs::remove_dir_all(&dir).ok();
    }
}
