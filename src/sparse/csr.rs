//! Validation of compressed-row input

use crate::error::{Error, Result};

/// Check a global CSR triple against `ncols` columns
///
/// Returns the number of rows. Every check runs on the host, so a malformed
/// matrix is rejected before any kernel is compiled or buffer allocated.
pub fn validate<T>(row_ptr: &[usize], col: &[usize], val: &[T], ncols: usize) -> Result<usize> {
    let Some((&first, _)) = row_ptr.split_first() else {
        return Err(Error::malformed("row_ptr must hold nrows + 1 entries, got none"));
    };
    let nrows = row_ptr.len() - 1;

    if first != 0 {
        return Err(Error::malformed(format!("row_ptr[0] is {first}, expected 0")));
    }
    if let Some(r) = row_ptr.windows(2).position(|w| w[1] < w[0]) {
        return Err(Error::malformed(format!(
            "row_ptr decreases at row {r}: {} > {}",
            row_ptr[r],
            row_ptr[r + 1]
        )));
    }
    let nnz = row_ptr[nrows];
    if col.len() != nnz || val.len() != nnz {
        return Err(Error::malformed(format!(
            "row_ptr ends at {nnz} but there are {} column indices and {} values",
            col.len(),
            val.len()
        )));
    }
    if let Some(j) = col.iter().position(|&c| c >= ncols) {
        let row = row_ptr.partition_point(|&p| p <= j) - 1;
        return Err(Error::malformed(format!(
            "column index {} in row {row} is outside [0, {ncols})",
            col[j]
        )));
    }
    if nnz > u32::MAX as usize || ncols > u32::MAX as usize {
        return Err(Error::malformed(format!(
            "{nnz} entries over {ncols} columns do not fit 32-bit device indices"
        )));
    }
    Ok(nrows)
}
