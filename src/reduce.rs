//! Reductions of fused expressions to a single scalar
//!
//! A [`Reductor`] evaluates an expression and folds it with an associative
//! operator in two stages:
//!
//! 1. Every device runs one generated kernel that evaluates the expression
//!    over its partition and folds it into `REDUCE_GROUPS` partial results.
//! 2. The partials are read back and combined on the host in device-list
//!    order, then group order.
//!
//! The combination order is fixed, so repeated reductions of the same data
//! on the same devices give the same result. Floating-point results may
//! still differ from a sequential fold.

use parking_lot::Mutex;
use smallvec::smallvec;

use crate::config::REDUCE_GROUPS;
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::fusion::{self, cache, Expr, ReduceOp, Signature};
use crate::runtime::{wait_all, KernelArg, KernelArgs, KernelSource, Runtime, RuntimeClient};
use crate::vector::Vector;

/// Reusable reduction over a fixed queue list
///
/// ```ignore
/// let sum = Reductor::<f64, CpuRuntime>::sum(&queues)?;
/// let dot = sum.apply(&x * &y)?;
/// let norm = sum.apply(&x * &x)?.sqrt();
/// ```
pub struct Reductor<T: Element, R: Runtime> {
    queues: Vec<R::Client>,
    op: ReduceOp,
    // REDUCE_GROUPS partials per device
    partials: Vector<T, R>,
    // One reduction at a time owns `partials`
    busy: Mutex<()>,
}

impl<T: Element, R: Runtime> Reductor<T, R> {
    /// Reductor applying `op` on `queues`
    pub fn new(queues: &[R::Client], op: ReduceOp) -> Result<Self> {
        let groups = vec![REDUCE_GROUPS as usize; queues.len()];
        let partials = Vector::with_partition(queues, &groups)?;
        Ok(Self {
            queues: queues.to_vec(),
            op,
            partials,
            busy: Mutex::new(()),
        })
    }

    /// Sum reductor
    pub fn sum(queues: &[R::Client]) -> Result<Self> {
        Self::new(queues, ReduceOp::Sum)
    }

    /// Product reductor
    pub fn prod(queues: &[R::Client]) -> Result<Self> {
        Self::new(queues, ReduceOp::Prod)
    }

    /// Minimum reductor
    pub fn min(queues: &[R::Client]) -> Result<Self> {
        Self::new(queues, ReduceOp::Min)
    }

    /// Maximum reductor
    pub fn max(queues: &[R::Client]) -> Result<Self> {
        Self::new(queues, ReduceOp::Max)
    }

    /// The reduction operator
    pub fn op(&self) -> ReduceOp {
        self.op
    }

    /// Reduce `expr` to a scalar (blocking)
    ///
    /// All vector operands must be partitioned identically over this
    /// reductor's queue list; otherwise `PartitionMismatch` is returned and
    /// nothing is launched. An empty vector reduces to the operator's
    /// identity.
    pub fn apply<'a>(&self, expr: impl Into<Expr<'a, T, R>>) -> Result<T> {
        let expr = expr.into();
        let (shape, leaves) = expr.lower();
        let first = expr.first_vector().ok_or_else(|| {
            Error::invalid_argument("expr", "reduction needs at least one vector operand")
        })?;

        let layout = first.layout();
        if !layout.devices().eq(self.queues.iter().map(|q| q.key())) {
            return Err(Error::partition_mismatch(format!(
                "operand is partitioned over {layout}, reductor runs on {} queues",
                self.queues.len()
            )));
        }
        fusion::check_operands(layout, &leaves)?;

        let source = KernelSource::new(Signature::Reduce {
            dtype: T::DTYPE,
            op: self.op,
            shape,
            groups: REDUCE_GROUPS,
        })?;
        let kernels = cache::kernels_for::<R>(&source, &self.queues)?;

        let _busy = self.busy.lock();
        let mut events = Vec::with_capacity(kernels.len());
        for (d, (client, kernel)) in self.queues.iter().zip(&kernels).enumerate() {
            let n = first.part_size(d);
            if n == 0 {
                continue;
            }
            let mut args: KernelArgs = smallvec![KernelArg::Buffer(self.partials.buffer(d))];
            fusion::bind_leaves(&mut args, &leaves, d);

            match R::launch(kernel, &args, n, client) {
                Ok(event) => events.push(event),
                Err(e) => {
                    let _ = wait_all(events);
                    return Err(e);
                }
            }
        }
        wait_all(events)?;

        let partials = self.partials.to_vec()?;
        let groups = REDUCE_GROUPS as usize;
        let mut acc = self.op.identity::<T>();
        for (d, chunk) in partials.chunks_exact(groups).enumerate() {
            // Partials of devices with nothing to reduce are stale.
            if first.part_size(d) == 0 {
                continue;
            }
            for &p in chunk {
                acc = self.op.combine(acc, p);
            }
        }
        Ok(acc)
    }
}

impl<T: Element, R: Runtime> std::fmt::Debug for Reductor<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reductor")
            .field("op", &self.op)
            .field("queues", &self.queues.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::{abs, sin};
    use crate::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn queues(ids: &[usize]) -> Vec<CpuClient> {
        ids.iter()
            .map(|&id| CpuClient::new(CpuDevice::new(id)).unwrap())
            .collect()
    }

    #[test]
    fn test_sum_of_fused_expression() {
        let q = queues(&[100, 101]);
        let x = Vector::<f64, CpuRuntime>::with_partition(&q, &[600, 401]).unwrap();
        let host: Vec<f64> = (0..1001).map(|i| i as f64).collect();
        x.write_from(&host).unwrap();

        let sum = Reductor::<f64, CpuRuntime>::sum(&q).unwrap();
        assert_eq!(sum.apply(&x).unwrap(), 500_500.0);
        assert_eq!(sum.apply(2.0f64 * &x - 1.0f64).unwrap(), 999_999.0);
        let s = sum.apply(sin(&x) * sin(&x)).unwrap();
        let expected: f64 = host.iter().map(|v| v.sin() * v.sin()).sum();
        assert!((s - expected).abs() < 1e-9);
    }

    #[test]
    fn test_min_max_with_empty_partition() {
        let q = queues(&[100, 101, 102]);
        let x = Vector::<i32, CpuRuntime>::with_partition(&q, &[4, 0, 3]).unwrap();
        x.write_from(&[5, -2, 9, 1, 3, -8, 4]).unwrap();

        let min = Reductor::<i32, CpuRuntime>::min(&q).unwrap();
        let max = Reductor::<i32, CpuRuntime>::max(&q).unwrap();
        assert_eq!(min.apply(&x).unwrap(), -8);
        assert_eq!(max.apply(&x).unwrap(), 9);
        assert_eq!(max.apply(abs(&x)).unwrap(), 9);
        assert_eq!(min.apply(abs(&x)).unwrap(), 1);
    }

    #[test]
    fn test_empty_vector_reduces_to_identity() {
        let q = queues(&[100]);
        let x = Vector::<f32, CpuRuntime>::with_partition(&q, &[0]).unwrap();
        let prod = Reductor::<f32, CpuRuntime>::prod(&q).unwrap();
        assert_eq!(prod.apply(&x).unwrap(), 1.0);
    }

    #[test]
    fn test_operands_must_live_on_reductor_queues() {
        let q = queues(&[100, 101]);
        let other = queues(&[101, 100]);
        let x = Vector::<f32, CpuRuntime>::with_partition(&other, &[2, 2]).unwrap();
        let sum = Reductor::<f32, CpuRuntime>::sum(&q).unwrap();
        assert!(matches!(
            sum.apply(&x),
            Err(Error::PartitionMismatch { .. })
        ));
        assert!(matches!(
            sum.apply(Expr::Scalar(1.0f32)),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
