//! Common test utilities
#![allow(dead_code)]

use std::sync::Once;

use vexr::runtime::cpu::{CpuClient, CpuRuntime};
#[cfg(feature = "wgpu")]
use vexr::runtime::wgpu::{WgpuClient, WgpuRuntime};

static LOGGER: Once = Once::new();

/// Route `log` output through the test harness (`RUST_LOG=debug` to see it)
pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Host queues with the given virtual device ids
///
/// Tests that count launches use ids nobody else in the binary uses, so the
/// counters are not disturbed by concurrently running tests.
pub fn create_cpu_queues(ids: &[usize]) -> Vec<CpuClient> {
    init_logging();
    CpuRuntime::queue_list_with_ids(ids).expect("host queues")
}

/// WebGPU queues, or None if no adapter is available
#[cfg(feature = "wgpu")]
pub fn create_wgpu_queues(max: usize) -> Option<Vec<WgpuClient>> {
    init_logging();
    WgpuRuntime::queue_list(max).ok()
}

/// Assert two f64 slices are close within tolerance
///
/// Uses the formula: |a - b| <= atol + rtol * |b|
pub fn assert_allclose_f64(a: &[f64], b: &[f64], rtol: f64, atol: f64, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Assert two f32 slices are close within tolerance
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// 1D Laplacian (SPD tridiagonal, 2 on the diagonal, -1 beside it) in CSR form
pub fn laplacian_1d(n: usize) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let mut row_ptr = Vec::with_capacity(n + 1);
    let mut col = Vec::new();
    let mut val = Vec::new();

    row_ptr.push(0);
    for i in 0..n {
        if i > 0 {
            col.push(i - 1);
            val.push(-1.0);
        }
        col.push(i);
        val.push(2.0);
        if i + 1 < n {
            col.push(i + 1);
            val.push(-1.0);
        }
        row_ptr.push(col.len());
    }
    (row_ptr, col, val)
}

/// Host reference of `y = A x` for a CSR matrix
pub fn host_spmv(row_ptr: &[usize], col: &[usize], val: &[f64], x: &[f64]) -> Vec<f64> {
    row_ptr
        .windows(2)
        .map(|w| (w[0]..w[1]).map(|j| val[j] * x[col[j]]).sum())
        .collect()
}
