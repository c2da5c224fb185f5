//! Local/remote split and exchange planning
//!
//! Rows are split by the row layout and columns by the column layout of the
//! same queue list, so partition `d` owns rows `rows[d]` and the slice
//! `cols[d]` of every vector it multiplies. Entries whose column falls in the
//! partition's own slice are *local*; all others are *remote* and need the
//! value of `x` from another partition before they can be applied.
//!
//! For each partition the plan holds:
//!
//! - a local CSR block with columns relative to the partition's own slice,
//! - a remote CSR block with columns renumbered into a compact import buffer,
//! - `send`: the sorted distinct local column offsets other partitions need,
//! - `recv`: for each import slot, which partition sends it and where it sits
//!   in that partition's `send` list.

use std::collections::BTreeSet;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::partition::Layout;

/// One partition's rows in compressed-row form with 32-bit indices
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartCsr<T> {
    /// Row offsets, `rows + 1` entries starting at 0
    pub row_ptr: Vec<u32>,
    /// Column indices, relative to whatever `x` the block is multiplied with
    pub col: Vec<u32>,
    /// Values
    pub val: Vec<T>,
}

impl<T> PartCsr<T> {
    fn with_rows(rows: usize) -> Self {
        let mut row_ptr = Vec::with_capacity(rows + 1);
        row_ptr.push(0);
        Self {
            row_ptr,
            col: Vec::new(),
            val: Vec::new(),
        }
    }

    fn end_row(&mut self) {
        self.row_ptr.push(self.col.len() as u32);
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.col.len()
    }
}

/// Work of one partition in a distributed multiply
#[derive(Debug, Clone)]
pub struct PartPlan<T> {
    /// Global rows owned by the partition
    pub rows: Range<usize>,
    /// Entries whose column the partition owns
    pub local: PartCsr<T>,
    /// Entries whose column another partition owns, columns index `recv`
    pub remote: PartCsr<T>,
    /// Local column offsets other partitions import, sorted and distinct
    pub send: Vec<u32>,
    /// Import slot -> (source partition, index into its `send`)
    pub recv: Vec<(usize, usize)>,
}

/// Exchange plan for every partition of a matrix
#[derive(Debug, Clone)]
pub struct ExchangePlan<T> {
    parts: Vec<PartPlan<T>>,
}

impl<T: Copy> ExchangePlan<T> {
    /// Split a validated global CSR matrix by `rows` and `cols`
    ///
    /// `rows` and `cols` must be layouts over the same device list, with
    /// `rows.size() + 1 == row_ptr.len()` and every column `< cols.size()`.
    pub fn build(
        row_ptr: &[usize],
        col: &[usize],
        val: &[T],
        rows: &Layout,
        cols: &Layout,
    ) -> Result<Self> {
        if rows.num_parts() != cols.num_parts() || rows.size() + 1 != row_ptr.len() {
            return Err(Error::Internal(format!(
                "row layout {rows} and column layout {cols} do not fit a {}-row matrix",
                row_ptr.len().saturating_sub(1)
            )));
        }

        let owner = |c: usize| -> Result<usize> {
            cols.locate(c)
                .map(|(s, _)| s)
                .ok_or_else(|| Error::Internal(format!("column {c} has no owning partition")))
        };

        // Remote columns each partition imports, in global order.
        let mut imports: Vec<Vec<usize>> = Vec::with_capacity(rows.num_parts());
        for (rp, cp) in rows.parts().iter().zip(cols.parts()) {
            let needed: BTreeSet<usize> = col[row_ptr[rp.start]..row_ptr[rp.end()]]
                .iter()
                .copied()
                .filter(|&c| !cp.contains(c))
                .collect();
            imports.push(needed.into_iter().collect());
        }

        // What each partition must send: the union of what others import from it.
        let mut sends: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); cols.num_parts()];
        for needed in &imports {
            for &c in needed {
                let s = owner(c)?;
                sends[s].insert((c - cols.parts()[s].start) as u32);
            }
        }
        let sends: Vec<Vec<u32>> = sends.into_iter().map(|s| s.into_iter().collect()).collect();

        let mut parts = Vec::with_capacity(rows.num_parts());
        for (d, (rp, cp)) in rows.parts().iter().zip(cols.parts()).enumerate() {
            let needed = &imports[d];
            let mut local = PartCsr::with_rows(rp.len);
            let mut remote = PartCsr::with_rows(rp.len);

            for r in rp.start..rp.end() {
                for j in row_ptr[r]..row_ptr[r + 1] {
                    let c = col[j];
                    if cp.contains(c) {
                        local.col.push((c - cp.start) as u32);
                        local.val.push(val[j]);
                    } else {
                        let slot = needed.binary_search(&c).map_err(|_| {
                            Error::Internal(format!("column {c} missing from import list"))
                        })?;
                        remote.col.push(slot as u32);
                        remote.val.push(val[j]);
                    }
                }
                local.end_row();
                remote.end_row();
            }

            let recv = needed
                .iter()
                .map(|&c| {
                    let s = owner(c)?;
                    let offset = (c - cols.parts()[s].start) as u32;
                    sends[s]
                        .binary_search(&offset)
                        .map(|k| (s, k))
                        .map_err(|_| Error::Internal(format!("column {c} missing from send list")))
                })
                .collect::<Result<Vec<_>>>()?;

            parts.push(PartPlan {
                rows: rp.start..rp.end(),
                local,
                remote,
                send: sends[d].clone(),
                recv,
            });
        }

        Ok(Self { parts })
    }
}

impl<T> ExchangePlan<T> {
    /// Per-partition plans in device-list order
    pub fn parts(&self) -> &[PartPlan<T>] {
        &self.parts
    }

    /// Total number of values imported per multiply
    pub fn import_count(&self) -> usize {
        self.parts.iter().map(|p| p.recv.len()).sum()
    }

    /// Number of entries that need imported values
    pub fn remote_nnz(&self) -> usize {
        self.parts.iter().map(|p| p.remote.nnz()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::DeviceKey;

    fn layout(sizes: &[usize]) -> Layout {
        let devices: Vec<_> = (0..sizes.len()).map(|i| DeviceKey::new("cpu", i)).collect();
        Layout::from_sizes(&devices, sizes).unwrap()
    }

    #[test]
    fn test_tridiagonal_split_one_two() {
        // [[2,-1,0],[-1,2,-1],[0,-1,2]]
        let row_ptr = [0, 2, 5, 7];
        let col = [0, 1, 0, 1, 2, 1, 2];
        let val = [2.0, -1.0, -1.0, 2.0, -1.0, -1.0, 2.0];
        let split = layout(&[1, 2]);
        let plan = ExchangePlan::build(&row_ptr, &col, &val, &split, &split).unwrap();
        let [a, b] = plan.parts() else {
            panic!("expected two partitions")
        };

        assert_eq!(a.local.row_ptr, vec![0, 1]);
        assert_eq!(a.local.col, vec![0]);
        assert_eq!(a.remote.col, vec![0]);
        assert_eq!(a.remote.val, vec![-1.0]);
        assert_eq!(a.send, vec![0]);
        assert_eq!(a.recv, vec![(1, 0)]);

        assert_eq!(b.rows, 1..3);
        assert_eq!(b.local.row_ptr, vec![0, 2, 4]);
        assert_eq!(b.local.col, vec![0, 1, 0, 1]);
        assert_eq!(b.remote.row_ptr, vec![0, 1, 1]);
        assert_eq!(b.send, vec![0]);
        assert_eq!(b.recv, vec![(0, 0)]);

        assert_eq!(plan.import_count(), 2);
        assert_eq!(plan.remote_nnz(), 2);
    }

    #[test]
    fn test_send_list_is_shared_by_importers() {
        // Three partitions of one row each; rows 0 and 2 both read column 1.
        let row_ptr = [0, 2, 3, 5];
        let col = [0, 1, 1, 1, 2];
        let val = [1, 2, 3, 4, 5];
        let split = layout(&[1, 1, 1]);
        let plan = ExchangePlan::build(&row_ptr, &col, &val, &split, &split).unwrap();

        assert_eq!(plan.parts()[1].send, vec![0]);
        assert!(plan.parts()[1].recv.is_empty());
        assert_eq!(plan.parts()[0].recv, vec![(1, 0)]);
        assert_eq!(plan.parts()[2].recv, vec![(1, 0)]);
        assert_eq!(plan.parts()[2].local.val, vec![5]);
    }

    #[test]
    fn test_rectangular_columns() {
        // 2x4 matrix, columns split 3 + 1
        let row_ptr = [0, 2, 3];
        let col = [0, 3, 2];
        let val = [1.0f32, 2.0, 3.0];
        let rows = layout(&[1, 1]);
        let cols = layout(&[3, 1]);
        let plan = ExchangePlan::build(&row_ptr, &col, &val, &rows, &cols).unwrap();

        assert_eq!(plan.parts()[0].local.col, vec![0]);
        assert_eq!(plan.parts()[0].recv, vec![(1, 0)]);
        assert_eq!(plan.parts()[1].recv, vec![(0, 0)]);
        assert_eq!(plan.parts()[0].send, vec![2]);
        assert_eq!(plan.parts()[1].local.nnz(), 0);
    }
}
