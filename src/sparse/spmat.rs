//! Sparse matrix partitioned by rows across devices

use smallvec::smallvec;

use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::fusion::{cache, Signature};
use crate::partition::{self, Layout};
use crate::runtime::{wait_all, KernelArg, KernelArgs, KernelSource, Runtime, RuntimeClient};
use crate::vector::Vector;

use super::csr;
use super::plan::{ExchangePlan, PartCsr};

/// Device copy of one CSR block
struct DeviceCsr<T: Element, R: Runtime> {
    row_ptr: Vector<u32, R>,
    col: Vector<u32, R>,
    val: Vector<T, R>,
}

impl<T: Element, R: Runtime> DeviceCsr<T, R> {
    fn upload(block: &PartCsr<T>, client: &R::Client) -> Result<Self> {
        let queue = std::slice::from_ref(client);
        Ok(Self {
            row_ptr: Vector::from_slice(queue, &block.row_ptr)?,
            col: Vector::from_slice(queue, &block.col)?,
            val: Vector::from_slice(queue, &block.val)?,
        })
    }

    fn args(&self, x: u64, y: u64, alpha: T) -> KernelArgs {
        smallvec![
            KernelArg::Buffer(self.row_ptr.buffer(0)),
            KernelArg::Buffer(self.col.buffer(0)),
            KernelArg::Buffer(self.val.buffer(0)),
            KernelArg::Buffer(x),
            KernelArg::Buffer(y),
            KernelArg::Scalar(alpha.to_f64()),
        ]
    }
}

/// Values one partition gathers from its slice of `x` for other partitions
struct Outbox<T: Element, R: Runtime> {
    idx: Vector<u32, R>,
    values: Vector<T, R>,
}

/// Per-device state of a partitioned matrix
struct DevicePart<T: Element, R: Runtime> {
    rows: usize,
    local: DeviceCsr<T, R>,
    remote: Option<DeviceCsr<T, R>>,
    outbox: Option<Outbox<T, R>>,
    import: Option<Vector<T, R>>,
    recv: Vec<(usize, usize)>,
}

/// A CSR matrix split by row ranges across a queue list
///
/// Rows follow the partitioning of an `nrows`-element vector on the same
/// queues and columns that of an `ncols`-element vector, so `mul` takes `x`
/// shaped like the columns and `y` shaped like the rows.
///
/// Each multiply runs in three passes: every partition applies the entries
/// whose column it owns, partitions exchange the `x` values other partitions
/// reference through the host, then every partition adds the entries that
/// needed imported values. The call blocks until all passes finish.
pub struct SpMat<T: Element, R: Runtime> {
    queues: Vec<R::Client>,
    rows: Layout,
    cols: Layout,
    parts: Vec<DevicePart<T, R>>,
    nnz: usize,
    remote_nnz: usize,
}

impl<T: Element, R: Runtime> SpMat<T, R> {
    /// Distribute a global CSR matrix over `queues`
    ///
    /// `row_ptr` has `nrows + 1` entries. Malformed input fails with
    /// `MalformedMatrix` before any device work.
    pub fn new(
        queues: &[R::Client],
        row_ptr: &[usize],
        col: &[usize],
        val: &[T],
        ncols: usize,
    ) -> Result<Self> {
        let nrows = csr::validate(row_ptr, col, val, ncols)?;
        let rows = partition::layout::<R>(queues, nrows)?;
        let cols = partition::layout::<R>(queues, ncols)?;
        Self::build(queues, rows, cols, row_ptr, col, val)
    }

    /// Distribute with explicit row and column partition sizes
    ///
    /// The column count is the sum of `col_sizes`. Vectors used with the
    /// matrix must be created with the matching partition sizes.
    pub fn with_partition(
        queues: &[R::Client],
        row_sizes: &[usize],
        col_sizes: &[usize],
        row_ptr: &[usize],
        col: &[usize],
        val: &[T],
    ) -> Result<Self> {
        let ncols = col_sizes.iter().sum();
        let nrows = csr::validate(row_ptr, col, val, ncols)?;
        if row_sizes.iter().sum::<usize>() != nrows {
            return Err(Error::invalid_argument(
                "row_sizes",
                format!("row partition sizes do not add up to {nrows} rows"),
            ));
        }
        let devices: Vec<_> = queues.iter().map(|q| q.key()).collect();
        let rows = Layout::from_sizes(&devices, row_sizes)?;
        let cols = Layout::from_sizes(&devices, col_sizes)?;
        Self::build(queues, rows, cols, row_ptr, col, val)
    }

    fn build(
        queues: &[R::Client],
        rows: Layout,
        cols: Layout,
        row_ptr: &[usize],
        col: &[usize],
        val: &[T],
    ) -> Result<Self> {
        let plan = ExchangePlan::build(row_ptr, col, val, &rows, &cols)?;
        log::debug!(
            "partitioned {}x{} matrix ({} entries, {} remote, {} imports) over {}",
            rows.size(),
            cols.size(),
            col.len(),
            plan.remote_nnz(),
            plan.import_count(),
            rows
        );

        let parts = queues
            .iter()
            .zip(plan.parts())
            .map(|(client, p)| {
                let queue = std::slice::from_ref(client);
                let remote = match p.remote.nnz() {
                    0 => None,
                    _ => Some(DeviceCsr::upload(&p.remote, client)?),
                };
                let outbox = match p.send.len() {
                    0 => None,
                    n => Some(Outbox {
                        idx: Vector::from_slice(queue, &p.send)?,
                        values: Vector::new(queue, n)?,
                    }),
                };
                let import = match p.recv.len() {
                    0 => None,
                    n => Some(Vector::new(queue, n)?),
                };
                Ok(DevicePart {
                    rows: p.rows.len(),
                    local: DeviceCsr::upload(&p.local, client)?,
                    remote,
                    outbox,
                    import,
                    recv: p.recv.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            queues: queues.to_vec(),
            nnz: col.len(),
            remote_nnz: plan.remote_nnz(),
            rows,
            cols,
            parts,
        })
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.rows.size()
    }

    /// Number of columns
    pub fn ncols(&self) -> usize {
        self.cols.size()
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// Entries whose column lives on another partition
    pub fn remote_nnz(&self) -> usize {
        self.remote_nnz
    }

    /// Layout of the rows (and of result vectors)
    pub fn row_layout(&self) -> &Layout {
        &self.rows
    }

    /// Layout of the columns (and of input vectors)
    pub fn col_layout(&self) -> &Layout {
        &self.cols
    }

    /// `y = A * x` (blocking)
    pub fn mul(&self, x: &Vector<T, R>, y: &Vector<T, R>) -> Result<()> {
        self.multiply(x, y, T::one(), false)
    }

    /// `y += alpha * A * x` (blocking)
    pub fn mul_add(&self, x: &Vector<T, R>, y: &Vector<T, R>, alpha: T) -> Result<()> {
        self.multiply(x, y, alpha, true)
    }

    /// `r = f - A * x` (blocking)
    ///
    /// Only defined for signed element types.
    pub fn residual(&self, f: &Vector<T, R>, x: &Vector<T, R>, r: &Vector<T, R>) -> Result<()> {
        if !T::DTYPE.is_signed() {
            return Err(Error::unsupported_dtype(T::DTYPE, "residual"));
        }
        self.rows.ensure_matches(f.layout(), "right-hand side")?;
        self.check_operands(x, r)?;
        r.assign(f)?;
        self.multiply(x, r, T::zero() - T::one(), true)
    }

    fn check_operands(&self, x: &Vector<T, R>, y: &Vector<T, R>) -> Result<()> {
        self.cols.ensure_matches(x.layout(), "input vector")?;
        self.rows.ensure_matches(y.layout(), "output vector")?;
        if std::ptr::eq(x, y) {
            return Err(Error::invalid_argument(
                "y",
                "output vector must not be the input vector",
            ));
        }
        Ok(())
    }

    fn multiply(&self, x: &Vector<T, R>, y: &Vector<T, R>, alpha: T, accumulate: bool) -> Result<()> {
        self.check_operands(x, y)?;

        let dtype = T::DTYPE;
        let local = KernelSource::new(Signature::CsrProduct { dtype, accumulate })?;
        let remote = KernelSource::new(Signature::CsrProduct {
            dtype,
            accumulate: true,
        })?;
        let gather = KernelSource::new(Signature::Gather { dtype })?;
        let local_kernels = cache::kernels_for::<R>(&local, &self.queues)?;
        let remote_kernels = match self.remote_nnz {
            0 => Vec::new(),
            _ => cache::kernels_for::<R>(&remote, &self.queues)?,
        };
        let gather_kernels = match self.remote_nnz {
            0 => Vec::new(),
            _ => cache::kernels_for::<R>(&gather, &self.queues)?,
        };

        let mut events = Vec::new();
        let result = self.run(
            x,
            y,
            alpha,
            &local_kernels,
            &gather_kernels,
            &remote_kernels,
            &mut events,
        );
        let completed = wait_all(events);
        result.and(completed)
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        x: &Vector<T, R>,
        y: &Vector<T, R>,
        alpha: T,
        local_kernels: &[std::sync::Arc<R::Kernel>],
        gather_kernels: &[std::sync::Arc<R::Kernel>],
        remote_kernels: &[std::sync::Arc<R::Kernel>],
        events: &mut Vec<R::Event>,
    ) -> Result<()> {
        // Local pass.
        for (d, (part, client)) in self.parts.iter().zip(&self.queues).enumerate() {
            if part.rows == 0 {
                continue;
            }
            let args = part.local.args(x.buffer(d), y.buffer(d), alpha);
            events.push(R::launch(&local_kernels[d], &args, part.rows, client)?);
        }
        if self.remote_nnz == 0 {
            return Ok(());
        }

        // Gather what other partitions need from each slice of x.
        for (d, (part, client)) in self.parts.iter().zip(&self.queues).enumerate() {
            if let Some(outbox) = &part.outbox {
                let args: KernelArgs = smallvec![
                    KernelArg::Buffer(outbox.values.buffer(0)),
                    KernelArg::Buffer(x.buffer(d)),
                    KernelArg::Buffer(outbox.idx.buffer(0)),
                ];
                events.push(R::launch(&gather_kernels[d], &args, outbox.values.len(), client)?);
            }
        }

        // Exchange through the host.
        let sent = self
            .parts
            .iter()
            .map(|part| match &part.outbox {
                Some(outbox) => outbox.values.to_vec(),
                None => Ok(Vec::new()),
            })
            .collect::<Result<Vec<_>>>()?;
        for part in &self.parts {
            if let Some(import) = &part.import {
                let values: Vec<T> = part.recv.iter().map(|&(s, k)| sent[s][k]).collect();
                import.write_from(&values)?;
            }
        }

        // Remote pass.
        for (d, (part, client)) in self.parts.iter().zip(&self.queues).enumerate() {
            if let (Some(remote), Some(import)) = (&part.remote, &part.import) {
                let args = remote.args(import.buffer(0), y.buffer(d), alpha);
                events.push(R::launch(&remote_kernels[d], &args, part.rows, client)?);
            }
        }
        Ok(())
    }
}

impl<T: Element, R: Runtime> std::fmt::Debug for SpMat<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpMat")
            .field("nrows", &self.nrows())
            .field("ncols", &self.ncols())
            .field("nnz", &self.nnz)
            .field("remote_nnz", &self.remote_nnz)
            .field("rows", &format_args!("{}", self.rows))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn queues(ids: &[usize]) -> Vec<CpuClient> {
        ids.iter()
            .map(|&id| CpuClient::new(CpuDevice::new(id)).unwrap())
            .collect()
    }

    fn tridiagonal() -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        (
            vec![0, 2, 5, 7],
            vec![0, 1, 0, 1, 2, 1, 2],
            vec![2.0, -1.0, -1.0, 2.0, -1.0, -1.0, 2.0],
        )
    }

    #[test]
    fn test_tridiagonal_with_exchange() {
        let q = queues(&[110, 111]);
        let (row_ptr, col, val) = tridiagonal();
        let a = SpMat::<f64, CpuRuntime>::with_partition(&q, &[1, 2], &[1, 2], &row_ptr, &col, &val)
            .unwrap();
        assert_eq!(a.remote_nnz(), 2);

        let x = Vector::<f64, CpuRuntime>::with_partition(&q, &[1, 2]).unwrap();
        let y = Vector::<f64, CpuRuntime>::with_partition(&q, &[1, 2]).unwrap();
        x.fill(1.0).unwrap();
        a.mul(&x, &y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![1.0, 0.0, 1.0]);

        x.write_from(&[1.0, 2.0, 3.0]).unwrap();
        a.mul_add(&x, &y, 0.5).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![1.0, 0.0, 3.0]);

        let r = Vector::<f64, CpuRuntime>::with_partition(&q, &[1, 2]).unwrap();
        a.residual(&y, &x, &r).unwrap();
        assert_eq!(r.to_vec().unwrap(), vec![1.0, 0.0, -1.0]);
    }

    #[test]
    fn test_malformed_input_is_rejected_first() {
        let q = queues(&[110, 111]);
        let err = SpMat::<f32, CpuRuntime>::new(&q, &[0, 1, 2], &[0, 5], &[1.0, 1.0], 2)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedMatrix { .. }), "{err}");
    }

    #[test]
    fn test_operand_checks() {
        let q = queues(&[110, 111]);
        let (row_ptr, col, val) = tridiagonal();
        let a = SpMat::<f64, CpuRuntime>::with_partition(&q, &[1, 2], &[1, 2], &row_ptr, &col, &val)
            .unwrap();
        let x = Vector::<f64, CpuRuntime>::with_partition(&q, &[1, 2]).unwrap();
        let wrong = Vector::<f64, CpuRuntime>::with_partition(&q, &[2, 1]).unwrap();

        assert!(matches!(
            a.mul(&x, &wrong),
            Err(Error::PartitionMismatch { .. })
        ));
        assert!(matches!(
            a.mul(&x, &x),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_unsigned_residual_is_unsupported() {
        let q = queues(&[110]);
        let a = SpMat::<u32, CpuRuntime>::new(&q, &[0, 1], &[0], &[3], 1).unwrap();
        let x = Vector::<u32, CpuRuntime>::from_slice(&q, &[2]).unwrap();
        let y = Vector::<u32, CpuRuntime>::new(&q, 1).unwrap();
        a.mul(&x, &y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![6]);
        assert!(matches!(
            a.residual(&x, &x, &y),
            Err(Error::UnsupportedDType { .. })
        ));
    }
}
