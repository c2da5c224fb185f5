//! Partitioned sparse matrix-vector products
//!
//! A global compressed-row matrix is validated on the host, split by row
//! ranges over a queue list and uploaded once. Each partition keeps two CSR
//! blocks: entries whose column it owns, and entries that reference columns
//! owned by other partitions. The second block is applied after the
//! referenced `x` values have been exchanged.
//!
//! ```ignore
//! let a = SpMat::<f64, CpuRuntime>::new(&queues, &row_ptr, &col, &val, n)?;
//! let x = Vector::<f64, CpuRuntime>::new(&queues, n)?;
//! let y = Vector::<f64, CpuRuntime>::new(&queues, n)?;
//! a.mul(&x, &y)?;
//! ```

pub mod csr;
pub mod plan;
mod spmat;

pub use plan::{ExchangePlan, PartCsr, PartPlan};
pub use spmat::SpMat;
