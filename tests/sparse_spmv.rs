//! Integration tests for partitioned sparse matrix-vector products

mod common;

use common::{assert_allclose_f64, create_cpu_queues, host_spmv, laplacian_1d};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vexr::prelude::*;

/// Random CSR matrix with every row referencing columns all over the range
fn random_csr(nrows: usize, ncols: usize, per_row: usize, seed: u64) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut row_ptr = vec![0];
    let mut col = Vec::new();
    let mut val = Vec::new();
    for _ in 0..nrows {
        let mut cols: Vec<usize> = (0..rng.random_range(0..=per_row))
            .map(|_| rng.random_range(0..ncols))
            .collect();
        cols.sort_unstable();
        cols.dedup();
        for c in cols {
            col.push(c);
            val.push(rng.random_range(-1.0..1.0));
        }
        row_ptr.push(col.len());
    }
    (row_ptr, col, val)
}

#[test]
fn test_tridiagonal_split_after_first_row() {
    let queues = create_cpu_queues(&[0, 1]);
    let (row_ptr, col, val) = laplacian_1d(3);
    let a = SpMat::<f64, CpuRuntime>::with_partition(&queues, &[1, 2], &[1, 2], &row_ptr, &col, &val)
        .unwrap();
    assert!(a.remote_nnz() > 0);

    let x = Vector::<f64, CpuRuntime>::with_partition(&queues, &[1, 2]).unwrap();
    let y = Vector::<f64, CpuRuntime>::with_partition(&queues, &[1, 2]).unwrap();
    x.write_from(&[1.0, 1.0, 1.0]).unwrap();
    a.mul(&x, &y).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![1.0, 0.0, 1.0]);
}

#[test]
fn test_random_matrix_matches_single_partition() {
    let (nrows, ncols) = (700, 450);
    let (row_ptr, col, val) = random_csr(nrows, ncols, 12, 11);
    let mut rng = StdRng::seed_from_u64(12);
    let xs: Vec<f64> = (0..ncols).map(|_| rng.random_range(-2.0..2.0)).collect();

    let single = create_cpu_queues(&[0]);
    let a1 = SpMat::<f64, CpuRuntime>::new(&single, &row_ptr, &col, &val, ncols).unwrap();
    assert_eq!(a1.remote_nnz(), 0);
    let x1 = Vector::<f64, CpuRuntime>::from_slice(&single, &xs).unwrap();
    let y1 = Vector::<f64, CpuRuntime>::new(&single, nrows).unwrap();
    a1.mul(&x1, &y1).unwrap();
    let reference = y1.to_vec().unwrap();
    assert_allclose_f64(&reference, &host_spmv(&row_ptr, &col, &val, &xs), 1e-12, 1e-12, "single");

    let queues = create_cpu_queues(&[0, 1, 2]);
    let a = SpMat::<f64, CpuRuntime>::with_partition(
        &queues,
        &[200, 300, 200],
        &[150, 100, 200],
        &row_ptr,
        &col,
        &val,
    )
    .unwrap();
    assert_eq!(a.nnz(), col.len());
    assert!(a.remote_nnz() > 0);
    let x = Vector::<f64, CpuRuntime>::with_partition(&queues, &[150, 100, 200]).unwrap();
    let y = Vector::<f64, CpuRuntime>::with_partition(&queues, &[200, 300, 200]).unwrap();
    x.write_from(&xs).unwrap();
    a.mul(&x, &y).unwrap();
    assert_allclose_f64(&y.to_vec().unwrap(), &reference, 1e-12, 1e-12, "three partitions");

    // Computed layouts on the same queues give the same product.
    let b = SpMat::<f64, CpuRuntime>::new(&queues, &row_ptr, &col, &val, ncols).unwrap();
    let xb = Vector::<f64, CpuRuntime>::from_slice(&queues, &xs).unwrap();
    let yb = Vector::<f64, CpuRuntime>::new(&queues, nrows).unwrap();
    assert_eq!(b.col_layout(), xb.layout());
    assert_eq!(b.row_layout(), yb.layout());
    b.mul(&xb, &yb).unwrap();
    assert_allclose_f64(&yb.to_vec().unwrap(), &reference, 1e-12, 1e-12, "computed layout");
}

#[test]
fn test_mul_add_accumulates() {
    let queues = create_cpu_queues(&[0, 1]);
    let (row_ptr, col, val) = laplacian_1d(6);
    let a = SpMat::<f64, CpuRuntime>::new(&queues, &row_ptr, &col, &val, 6).unwrap();
    let x = Vector::<f64, CpuRuntime>::from_slice(&queues, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let y = Vector::<f64, CpuRuntime>::new(&queues, 6).unwrap();
    y.fill(10.0).unwrap();

    a.mul_add(&x, &y, 2.0).unwrap();
    // A x = [0, 0, 0, 0, 0, 7]
    assert_eq!(y.to_vec().unwrap(), vec![10.0, 10.0, 10.0, 10.0, 10.0, 24.0]);
}

#[test]
fn test_conjugate_gradient_poisson() {
    let queues = create_cpu_queues(&[0, 1, 2]);
    let n = 128;
    let (row_ptr, col, val) = laplacian_1d(n);
    let a = SpMat::<f64, CpuRuntime>::new(&queues, &row_ptr, &col, &val, n).unwrap();
    let sum = Reductor::<f64, CpuRuntime>::sum(&queues).unwrap();

    let f = Vector::<f64, CpuRuntime>::new(&queues, n).unwrap();
    let x = Vector::<f64, CpuRuntime>::new(&queues, n).unwrap();
    let r = Vector::<f64, CpuRuntime>::new(&queues, n).unwrap();
    let p = Vector::<f64, CpuRuntime>::new(&queues, n).unwrap();
    let q = Vector::<f64, CpuRuntime>::new(&queues, n).unwrap();
    f.fill(1.0).unwrap();

    a.residual(&f, &x, &r).unwrap();
    p.assign(&r).unwrap();
    let mut rho = sum.apply(&r * &r).unwrap();
    let mut iterations = 0;
    while rho.sqrt() > 1e-10 && iterations < 2 * n {
        a.mul(&p, &q).unwrap();
        let alpha = rho / sum.apply(&p * &q).unwrap();
        x.assign_add(alpha * &p).unwrap();
        r.assign_sub(alpha * &q).unwrap();
        let rho_next = sum.apply(&r * &r).unwrap();
        p.assign(&r + (rho_next / rho) * &p).unwrap();
        rho = rho_next;
        iterations += 1;
    }
    assert!(rho.sqrt() <= 1e-10, "CG stalled after {iterations} iterations");

    // Exact solution of -u'' = 1 with zero boundaries: u_i = (i+1)(n-i)/2
    let expected: Vec<f64> = (0..n).map(|i| ((i + 1) * (n - i)) as f64 / 2.0).collect();
    assert_allclose_f64(&x.to_vec().unwrap(), &expected, 1e-6, 1e-6, "poisson solution");

    a.residual(&f, &x, &r).unwrap();
    let max_residual = Reductor::<f64, CpuRuntime>::max(&queues).unwrap().apply(abs(&r)).unwrap();
    assert!(max_residual < 1e-7, "residual {max_residual}");
}

#[test]
fn test_malformed_matrices() {
    let queues = create_cpu_queues(&[0, 1]);
    let bad = [
        (vec![0, 2, 1], vec![0, 1], vec![1.0, 1.0]),
        (vec![1, 2], vec![0], vec![1.0]),
        (vec![0, 1, 2], vec![0, 3], vec![1.0, 1.0]),
        (vec![0, 1, 3], vec![0, 1], vec![1.0, 1.0]),
    ];
    for (row_ptr, col, val) in bad {
        let err = SpMat::<f64, CpuRuntime>::new(&queues, &row_ptr, &col, &val, 3).unwrap_err();
        assert!(matches!(err, Error::MalformedMatrix { .. }), "{row_ptr:?}: {err}");
    }
}

#[test]
fn test_operands_on_other_devices_are_a_mismatch() {
    let queues = create_cpu_queues(&[50, 51]);
    let other = create_cpu_queues(&[51, 50]);
    let (row_ptr, col, val) = laplacian_1d(4);
    let a = SpMat::<f64, CpuRuntime>::with_partition(&queues, &[2, 2], &[2, 2], &row_ptr, &col, &val)
        .unwrap();
    let x = Vector::<f64, CpuRuntime>::with_partition(&other, &[2, 2]).unwrap();
    let y = Vector::<f64, CpuRuntime>::with_partition(&queues, &[2, 2]).unwrap();

    let before: u64 = queues.iter().map(|q| q.launch_count()).sum();
    assert!(matches!(a.mul(&x, &y), Err(Error::PartitionMismatch { .. })));
    let after: u64 = queues.iter().map(|q| q.launch_count()).sum();
    assert_eq!(before, after);
}
