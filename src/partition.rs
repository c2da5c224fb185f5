//! Splitting logical vectors across devices
//!
//! A [`Layout`] records, for every device of a queue list, the contiguous
//! element range it owns. Layouts are computed from the vector length and
//! per-device weights: either the throughput each device reached on a short
//! benchmark (measured once per device and cached for the process), or equal
//! weights when the process runs in [`PartitionMode::Equal`].
//!
//! Sizes are rounded with the largest-remainder method, ties going to the
//! device listed first. When there are at least as many elements as devices
//! every partition receives at least one element.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

use crate::config::{self, PartitionMode, BENCHMARK_LEN, BENCHMARK_RUNS};
use crate::error::{Error, Result};
use crate::runtime::{DeviceKey, Runtime, RuntimeClient};
use crate::vector::Vector;

/// The range of a logical vector owned by one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Part {
    /// Device holding the partition
    pub device: DeviceKey,
    /// Global index of the first element
    pub start: usize,
    /// Number of elements
    pub len: usize,
}

impl Part {
    /// One past the last global index
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Whether global index `i` lies in this partition
    #[inline]
    pub fn contains(&self, i: usize) -> bool {
        i >= self.start && i < self.end()
    }
}

/// Partitioning of a logical vector over an ordered device list
///
/// Two vectors can be combined in one kernel only if their layouts are equal,
/// i.e. the same devices in the same order with the same ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    parts: Vec<Part>,
    size: usize,
}

impl Layout {
    /// Layout with explicit partition sizes, one per device
    pub fn from_sizes(devices: &[DeviceKey], sizes: &[usize]) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::DeviceEnumeration {
                reason: "empty queue list".into(),
            });
        }
        if devices.len() != sizes.len() {
            return Err(Error::invalid_argument(
                "sizes",
                format!(
                    "{} partition sizes given for {} devices",
                    sizes.len(),
                    devices.len()
                ),
            ));
        }

        let mut start = 0;
        let parts = devices
            .iter()
            .zip(sizes)
            .map(|(&device, &len)| {
                let part = Part { device, start, len };
                start += len;
                part
            })
            .collect();
        Ok(Self { parts, size: start })
    }

    /// Partitions in device-list order
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Number of partitions
    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// Total number of elements
    pub fn size(&self) -> usize {
        self.size
    }

    /// Partition sizes in device-list order
    pub fn sizes(&self) -> Vec<usize> {
        self.parts.iter().map(|p| p.len).collect()
    }

    /// Devices in list order
    pub fn devices(&self) -> impl Iterator<Item = DeviceKey> + '_ {
        self.parts.iter().map(|p| p.device)
    }

    /// Partition owning global index `i`, and the offset of `i` within it
    pub fn locate(&self, i: usize) -> Option<(usize, usize)> {
        if i >= self.size {
            return None;
        }
        // First partition whose end is past i; empty partitions are skipped
        // because their end equals their start.
        let d = self.parts.partition_point(|p| p.end() <= i);
        self.parts.get(d).map(|p| (d, i - p.start))
    }

    /// Fail with `PartitionMismatch` unless `other` is partitioned identically
    pub fn ensure_matches(&self, other: &Layout, what: &str) -> Result<()> {
        if self == other {
            return Ok(());
        }
        Err(Error::partition_mismatch(format!(
            "{what}: expected {self}, found {other}"
        )))
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, p) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}..{}", p.device, p.start, p.end())?;
        }
        f.write_str("]")
    }
}

/// Compute the layout of an `n`-element vector on `queues`
///
/// Deterministic for a given process: once every device in the list has been
/// measured, the same `(queues, n)` always yields the same layout.
pub fn layout<R: Runtime>(queues: &[R::Client], n: usize) -> Result<Layout> {
    let devices: Vec<DeviceKey> = queues.iter().map(|q| q.key()).collect();
    if devices.is_empty() {
        return Err(Error::DeviceEnumeration {
            reason: "empty queue list".into(),
        });
    }

    let weights = match config::partition_mode() {
        PartitionMode::Equal => vec![1.0; devices.len()],
        PartitionMode::Proportional if devices.len() == 1 => vec![1.0],
        PartitionMode::Proportional => queues
            .iter()
            .map(throughput::<R>)
            .collect::<Result<Vec<_>>>()?,
    };

    Layout::from_sizes(&devices, &partition_sizes(n, &weights))
}

/// Split `n` elements proportionally to `weights`
///
/// Largest-remainder rounding: every device first gets the floor of its exact
/// quota, then the leftover elements go one each to the largest fractional
/// parts, ties to the lower index. Non-finite or non-positive weights count
/// as zero; if no weight is usable all devices are weighted equally. When
/// `n >= weights.len()` empty partitions are topped up with one element taken
/// from the largest partition.
pub fn partition_sizes(n: usize, weights: &[f64]) -> Vec<usize> {
    let k = weights.len();
    if k == 0 {
        return Vec::new();
    }

    let mut w: Vec<f64> = weights
        .iter()
        .map(|&w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
        .collect();
    let mut total: f64 = w.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        w = vec![1.0; k];
        total = k as f64;
    }

    let quotas: Vec<f64> = w.iter().map(|w| n as f64 * w / total).collect();
    let mut sizes: Vec<usize> = quotas.iter().map(|q| (q.floor() as usize).min(n)).collect();

    // Float error can push the floors over n; shave the largest back.
    while sizes.iter().sum::<usize>() > n {
        let d = largest(&sizes);
        sizes[d] -= 1;
    }

    let assigned: usize = sizes.iter().sum();
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| {
        let fa = quotas[a] - quotas[a].floor();
        let fb = quotas[b] - quotas[b].floor();
        fb.partial_cmp(&fa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    for &d in order.iter().cycle().take(n - assigned) {
        sizes[d] += 1;
    }

    if n >= k {
        for d in 0..k {
            if sizes[d] == 0 {
                let from = largest(&sizes);
                sizes[from] -= 1;
                sizes[d] = 1;
            }
        }
    }

    sizes
}

fn largest(sizes: &[usize]) -> usize {
    let mut best = 0;
    for (d, &s) in sizes.iter().enumerate() {
        if s > sizes[best] {
            best = d;
        }
    }
    best
}

fn throughput_cache() -> &'static Mutex<HashMap<DeviceKey, f64>> {
    static CACHE: OnceLock<Mutex<HashMap<DeviceKey, f64>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Throughput of the client's device in elements per second
///
/// Measured by a benchmark on first request and cached for the rest of the
/// process. Concurrent first requests may both measure; the first stored
/// value wins so every caller sees the same number.
pub fn throughput<R: Runtime>(client: &R::Client) -> Result<f64> {
    let key = client.key();
    if let Some(&t) = throughput_cache().lock().get(&key) {
        return Ok(t);
    }

    let measured = benchmark::<R>(client)?;
    let stored = *throughput_cache().lock().entry(key).or_insert(measured);
    Ok(stored)
}

/// Cached throughput of `device`, if it has been measured
pub fn measured_throughput(device: DeviceKey) -> Option<f64> {
    throughput_cache().lock().get(&device).copied()
}

/// Time `a = 2 * b + c` on a single device
fn benchmark<R: Runtime>(client: &R::Client) -> Result<f64> {
    let queues = [client.clone()];
    let a = Vector::<f32, R>::new(&queues, BENCHMARK_LEN)?;
    let b = Vector::<f32, R>::new(&queues, BENCHMARK_LEN)?;
    let c = Vector::<f32, R>::new(&queues, BENCHMARK_LEN)?;
    b.fill(1.0)?;
    c.fill(0.5)?;

    // Warm-up run pays for kernel compilation.
    a.assign(2.0f32 * &b + &c)?;
    a.finish()?;

    let started = Instant::now();
    for _ in 0..BENCHMARK_RUNS {
        a.assign(2.0f32 * &b + &c)?;
    }
    a.finish()?;
    let seconds = started.elapsed().as_secs_f64().max(1e-9);

    let throughput = (BENCHMARK_LEN * BENCHMARK_RUNS) as f64 / seconds;
    log::info!(
        "device {} throughput: {:.3e} elements/s",
        client.key(),
        throughput
    );
    Ok(throughput)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn keys(k: usize) -> Vec<DeviceKey> {
        (0..k).map(|id| DeviceKey::new("cpu", id)).collect()
    }

    #[test]
    fn test_equal_weights_favour_first_devices() {
        assert_eq!(partition_sizes(10, &[1.0, 1.0, 1.0]), vec![4, 3, 3]);
        assert_eq!(partition_sizes(3, &[1.0, 1.0]), vec![2, 1]);
        assert_eq!(partition_sizes(1 << 16, &[1.0, 1.0]), vec![1 << 15, 1 << 15]);
    }

    #[test]
    fn test_largest_remainder() {
        // quotas 1.5, 3.0, 5.5: floors 1, 3, 5, one left over goes to index 0
        assert_eq!(partition_sizes(10, &[1.5, 3.0, 5.5]), vec![2, 3, 5]);
        // quotas 2.5, 5.0, 2.5: the tie between 0 and 2 goes to 0
        assert_eq!(partition_sizes(10, &[1.0, 2.0, 1.0]), vec![3, 5, 2]);
        // [4, 0, 0, 0] before every empty partition takes one from the largest
        assert_eq!(partition_sizes(4, &[100.0, 1.0, 1.0, 1.0]), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_sizes_sum_and_no_empty_partition() {
        let weights = [1000.0, 1.0, 0.001, 5.0];
        for n in 0..200 {
            let sizes = partition_sizes(n, &weights);
            assert_eq!(sizes.iter().sum::<usize>(), n);
            if n >= weights.len() {
                assert!(sizes.iter().all(|&s| s > 0), "n={n}: {sizes:?}");
            }
        }
    }

    #[test]
    fn test_invalid_weights_fall_back_to_equal() {
        assert_eq!(partition_sizes(4, &[0.0, f64::NAN]), vec![2, 2]);
        assert_eq!(partition_sizes(4, &[-1.0, 3.0]), vec![1, 3]);
        assert!(partition_sizes(5, &[]).is_empty());
    }

    #[test]
    fn test_locate_skips_empty_partitions() {
        let layout = Layout::from_sizes(&keys(4), &[2, 0, 3, 0]).unwrap();
        assert_eq!(layout.size(), 5);
        assert_eq!(layout.locate(0), Some((0, 0)));
        assert_eq!(layout.locate(1), Some((0, 1)));
        assert_eq!(layout.locate(2), Some((2, 0)));
        assert_eq!(layout.locate(4), Some((2, 2)));
        assert_eq!(layout.locate(5), None);
    }

    #[test]
    fn test_mismatch_names_both_layouts() {
        let a = Layout::from_sizes(&keys(2), &[2, 2]).unwrap();
        let b = Layout::from_sizes(&keys(2), &[3, 1]).unwrap();
        assert!(a.ensure_matches(&a.clone(), "x").is_ok());
        let err = a.ensure_matches(&b, "operand 1").unwrap_err();
        assert!(matches!(err, Error::PartitionMismatch { .. }));
        assert!(err.to_string().contains("cpu:0 0..3"), "{err}");
    }

    #[test]
    fn test_layout_is_stable_across_calls() {
        let queues = vec![
            CpuClient::new(CpuDevice::new(70)).unwrap(),
            CpuClient::new(CpuDevice::new(71)).unwrap(),
        ];
        let first = layout::<CpuRuntime>(&queues, 1000).unwrap();
        let second = layout::<CpuRuntime>(&queues, 1000).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size(), 1000);
        assert!(first.parts().iter().all(|p| p.len > 0));
    }

    #[test]
    fn test_benchmark_is_cached() {
        let client = CpuClient::new(CpuDevice::new(72)).unwrap();
        let t = throughput::<CpuRuntime>(&client).unwrap();
        assert!(t > 0.0);
        assert_eq!(measured_throughput(client.key()), Some(t));
        assert_eq!(throughput::<CpuRuntime>(&client).unwrap(), t);
    }
}
