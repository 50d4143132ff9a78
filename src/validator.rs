//! Shape check run on every candidate table before anything else touches it.

use crate::error::{Result, StatementInsightError};
use crate::schema::{Cell, RawTable};
use serde_json::Value;

/// Validates a candidate grid and converts it into a [`RawTable`].
///
/// Rejects anything that is not a list of lists, has fewer than two rows
/// (a header plus at least one data row), or has rows of differing width.
pub fn validate_table(candidate: &Value) -> Result<RawTable> {
    let rows = candidate
        .as_array()
        .ok_or_else(|| StatementInsightError::Shape("table is not a list of rows".to_string()))?;

    let grid = rows
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            row.as_array()
                .map(|cells| cells.iter().map(Cell::from_json).collect::<Vec<_>>())
                .ok_or_else(|| {
                    StatementInsightError::Shape(format!("row {} is not a list of cells", idx))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    validate_grid(grid)
}

/// Same check for an already-typed grid (first row is the header).
pub fn validate_grid(mut grid: Vec<Vec<Cell>>) -> Result<RawTable> {
    if grid.len() < 2 {
        return Err(StatementInsightError::Shape(format!(
            "table needs a header and at least one data row, got {} row(s)",
            grid.len()
        )));
    }

    let width = grid[0].len();
    if width == 0 {
        return Err(StatementInsightError::Shape("header row is empty".to_string()));
    }
    if let Some((idx, row)) = grid.iter().enumerate().find(|(_, row)| row.len() != width) {
        return Err(StatementInsightError::Shape(format!(
            "row {} has {} cells, expected {}",
            idx,
            row.len(),
            width
        )));
    }

    let rows = grid.split_off(1);
    let header = grid.swap_remove(0);
    Ok(RawTable { header, rows })
}

pub fn is_valid_table(candidate: &Value) -> bool {
    validate_table(candidate).is_ok()
}
