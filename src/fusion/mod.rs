//! Expression fusion compiler
//!
//! An [`Expr`] tree is lowered into an [`ExprShape`] plus the leaves to bind.
//! The shape, element type and assignment (or reduction) operator form the
//! kernel [`Signature`]; one kernel is generated and compiled per signature
//! and device, then reused for every expression of the same shape no matter
//! which vectors or scalar values it binds.
//!
//! - `expr`: expression trees and operator overloading
//! - `shape`: structural signatures and kernel naming
//! - `codegen`: WGSL generation for the WebGPU backend
//! - `cache`: process-wide compiled kernel cache

pub mod cache;
pub mod codegen;
pub mod expr;
pub mod ops;
pub mod shape;

pub use expr::{
    abs, ceil, cos, exp, floor, log, max, min, pow, sin, sqrt, tan, tanh, Expr,
};
pub use ops::{AssignOp, BinaryOp, ReduceOp, UnaryOp};
pub use shape::{ExprShape, Signature};

use smallvec::smallvec;

use crate::dtype::Element;
use crate::error::Result;
use crate::partition::Layout;
use crate::runtime::{wait_all, KernelArg, KernelArgs, KernelSource, Runtime};
use crate::vector::Vector;
use expr::Leaf;

/// Check every vector operand against `layout`
///
/// Runs before anything is compiled or launched.
pub(crate) fn check_operands<T: Element, R: Runtime>(
    layout: &Layout,
    leaves: &[Leaf<'_, T, R>],
) -> Result<()> {
    for (k, leaf) in leaves.iter().enumerate() {
        if let Leaf::Vector(v) = leaf {
            layout.ensure_matches(v.layout(), &format!("operand {k}"))?;
        }
    }
    Ok(())
}

/// Append the kernel arguments of `leaves` for partition `d`
pub(crate) fn bind_leaves<T: Element, R: Runtime>(
    args: &mut KernelArgs,
    leaves: &[Leaf<'_, T, R>],
    d: usize,
) {
    args.extend(leaves.iter().map(|leaf| match leaf {
        Leaf::Vector(v) => KernelArg::Buffer(v.buffer(d)),
        Leaf::Scalar(s) => KernelArg::Scalar(s.to_f64()),
    }));
}

/// Enqueue `target <op>= expr` on every non-empty partition of `target`
///
/// Returns one event per launch. If a launch fails part-way, the launches
/// already issued are waited for before the error is returned.
pub(crate) fn enqueue_assign<T: Element, R: Runtime>(
    target: &Vector<T, R>,
    assign: AssignOp,
    expr: &Expr<'_, T, R>,
) -> Result<Vec<R::Event>> {
    let (shape, leaves) = expr.lower();
    check_operands(target.layout(), &leaves)?;

    let source = KernelSource::new(Signature::Elementwise {
        dtype: T::DTYPE,
        assign,
        shape,
    })?;
    let kernels = cache::kernels_for::<R>(&source, target.queues())?;

    let mut events = Vec::with_capacity(kernels.len());
    for (d, (client, kernel)) in target.queues().iter().zip(&kernels).enumerate() {
        let n = target.part_size(d);
        if n == 0 {
            continue;
        }
        let mut args: KernelArgs = smallvec![KernelArg::Buffer(target.buffer(d))];
        bind_leaves(&mut args, &leaves, d);

        match R::launch(kernel, &args, n, client) {
            Ok(event) => events.push(event),
            Err(e) => {
                let _ = wait_all(events);
                return Err(e);
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
    use crate::runtime::RuntimeClient;

    fn queues(ids: &[usize]) -> Vec<CpuClient> {
        ids.iter()
            .map(|&id| CpuClient::new(CpuDevice::new(id)).unwrap())
            .collect()
    }

    #[test]
    fn test_fused_expression_over_two_partitions() {
        let q = queues(&[90, 91]);
        let x = Vector::<f32, CpuRuntime>::with_partition(&q, &[3, 2]).unwrap();
        let y = Vector::<f32, CpuRuntime>::with_partition(&q, &[3, 2]).unwrap();
        x.write_from(&[1.0, 4.0, 9.0, 16.0, 25.0]).unwrap();
        y.fill(1.0).unwrap();

        y.assign(2.0f32 * &x + sqrt(&x) - &y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![2.0, 9.0, 20.0, 35.0, 54.0]);
    }

    #[test]
    fn test_mismatch_launches_nothing() {
        let q = queues(&[92, 93]);
        let a = Vector::<f32, CpuRuntime>::with_partition(&q, &[2, 2]).unwrap();
        let b = Vector::<f32, CpuRuntime>::with_partition(&q, &[1, 3]).unwrap();
        let before: Vec<u64> = q.iter().map(|c| c.launch_count()).collect();

        let err = a.assign(&a + &b).unwrap_err();
        assert!(matches!(err, Error::PartitionMismatch { .. }), "{err}");
        let after: Vec<u64> = q.iter().map(|c| c.launch_count()).collect();
        assert_eq!(before, after);
        for c in &q {
            c.synchronize().unwrap();
        }
    }

    #[test]
    fn test_same_shape_hits_the_cache() {
        let q = queues(&[94]);
        let a = Vector::<f64, CpuRuntime>::new(&q, 16).unwrap();
        let b = Vector::<f64, CpuRuntime>::new(&q, 16).unwrap();

        a.assign(&b * 2.0f64 + tanh(&b)).unwrap();
        let sig = Signature::Elementwise {
            dtype: crate::dtype::DType::F64,
            assign: AssignOp::Set,
            shape: (&b * 2.0f64 + tanh(&b)).lower().0,
        };
        assert!(cache::is_compiled(&sig, q[0].key()));
        let (hits, _) = cache::counters();
        b.assign(&a * -1.0f64 + tanh(&a)).unwrap();
        let (hits_after, _) = cache::counters();
        assert!(hits_after > hits);
        a.finish().unwrap();
    }
}
