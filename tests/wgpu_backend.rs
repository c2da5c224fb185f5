//! WebGPU backend tests, compared against the host backend
//!
//! Every test returns early when no WebGPU adapter is available.

#![cfg(feature = "wgpu")]

mod common;

use common::{assert_allclose_f32, create_cpu_queues, create_wgpu_queues};
use vexr::prelude::*;

#[test]
fn test_fused_expression_parity() {
    let Some(gpu) = create_wgpu_queues(1) else {
        println!("No GPU available, skipping test");
        return;
    };
    let cpu = create_cpu_queues(&[0]);
    let xs: Vec<f32> = (0..10_000).map(|i| (i % 97) as f32 * 0.1).collect();

    let run_gpu = {
        let x = Vector::<f32, WgpuRuntime>::from_slice(&gpu, &xs).unwrap();
        let y = Vector::<f32, WgpuRuntime>::new(&gpu, xs.len()).unwrap();
        y.assign(2.0f32 * &x + sqrt(&x) - cos(&x)).unwrap();
        y.to_vec().unwrap()
    };
    let run_cpu = {
        let x = Vector::<f32, CpuRuntime>::from_slice(&cpu, &xs).unwrap();
        let y = Vector::<f32, CpuRuntime>::new(&cpu, xs.len()).unwrap();
        y.assign(2.0f32 * &x + sqrt(&x) - cos(&x)).unwrap();
        y.to_vec().unwrap()
    };
    assert_allclose_f32(&run_gpu, &run_cpu, 1e-5, 1e-5, "2x + sqrt(x) - cos(x)");
}

#[test]
fn test_reduction_and_spmv() {
    let Some(gpu) = create_wgpu_queues(1) else {
        println!("No GPU available, skipping test");
        return;
    };

    let ones = Vector::<f32, WgpuRuntime>::new(&gpu, 1 << 16).unwrap();
    ones.fill(1.0).unwrap();
    let sum = Reductor::<f32, WgpuRuntime>::sum(&gpu).unwrap();
    assert_eq!(sum.apply(&ones).unwrap(), 65536.0);

    let row_ptr = [0, 2, 5, 7];
    let col = [0, 1, 0, 1, 2, 1, 2];
    let val = [2.0f32, -1.0, -1.0, 2.0, -1.0, -1.0, 2.0];
    let a = SpMat::<f32, WgpuRuntime>::new(&gpu, &row_ptr, &col, &val, 3).unwrap();
    let x = Vector::<f32, WgpuRuntime>::from_slice(&gpu, &[1.0, 1.0, 1.0]).unwrap();
    let y = Vector::<f32, WgpuRuntime>::new(&gpu, 3).unwrap();
    a.mul(&x, &y).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![1.0, 0.0, 1.0]);
}

#[test]
fn test_f64_is_unsupported() {
    let Some(gpu) = create_wgpu_queues(1) else {
        println!("No GPU available, skipping test");
        return;
    };
    let x = Vector::<f64, WgpuRuntime>::new(&gpu, 16).unwrap();
    let y = Vector::<f64, WgpuRuntime>::new(&gpu, 16).unwrap();
    assert!(y.assign(&x * 2.0f64).is_err());
}
