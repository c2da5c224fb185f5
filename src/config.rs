//! Process-wide configuration
//!
//! Settings here are decided once per process. The partition mode in
//! particular must not change after the first vector has been partitioned,
//! otherwise two vectors of the same length on the same devices could end up
//! with different boundaries.

use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Default workgroup size for element-wise and sparse kernels.
pub const WORKGROUP_SIZE: u32 = 256;
/// Workgroup size of reduction kernels (must be a power of two).
pub const REDUCE_WORKGROUP_SIZE: u32 = 256;
/// Number of partial results one device produces per reduction.
pub const REDUCE_GROUPS: u32 = 256;
/// Upper bound on workgroups in a single dispatch dimension.
pub const MAX_DISPATCH_WORKGROUPS: u32 = 65_535;
/// Element count of the throughput benchmark run on first use of a device.
pub const BENCHMARK_LEN: usize = 1 << 18;
/// Number of timed benchmark launches per device.
pub const BENCHMARK_RUNS: usize = 4;

/// How vector lengths are split across a device list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionMode {
    /// Proportional to the measured throughput of each device
    Proportional,
    /// Equal-size partitions, no benchmarking
    Equal,
}

impl PartitionMode {
    fn from_env() -> Self {
        match std::env::var("VEXR_PARTITIONING") {
            Ok(val) if val.trim().eq_ignore_ascii_case("equal") => PartitionMode::Equal,
            Ok(val) if val.trim().eq_ignore_ascii_case("proportional") => {
                PartitionMode::Proportional
            }
            Ok(val) => {
                log::warn!("ignoring unknown VEXR_PARTITIONING value '{val}'");
                PartitionMode::Proportional
            }
            Err(_) => PartitionMode::Proportional,
        }
    }
}

static PARTITION_MODE: OnceLock<PartitionMode> = OnceLock::new();

/// Select the partition mode for this process.
///
/// The first decision wins: either this call, or the first partitioning
/// (which falls back to `VEXR_PARTITIONING`, then `Proportional`). Asking
/// again for the same mode is fine; asking for a different one is an error.
pub fn set_partition_mode(mode: PartitionMode) -> Result<()> {
    let current = *PARTITION_MODE.get_or_init(|| mode);
    if current == mode {
        Ok(())
    } else {
        log::warn!("partition mode already fixed to {current:?}, refusing {mode:?}");
        Err(Error::invalid_argument(
            "mode",
            format!("partition mode is already {current:?} for this process"),
        ))
    }
}

/// The partition mode in effect for this process.
pub fn partition_mode() -> PartitionMode {
    *PARTITION_MODE.get_or_init(PartitionMode::from_env)
}

/// Effective workgroup size for element-wise kernels.
/// Overridable via env `VEXR_WG` (u32). Falls back to WORKGROUP_SIZE.
pub fn effective_workgroup_size() -> u32 {
    static WG: OnceLock<u32> = OnceLock::new();
    *WG.get_or_init(|| {
        if let Ok(val) = std::env::var("VEXR_WG") {
            if let Ok(parsed) = val.trim().parse::<u32>() {
                if parsed > 0 {
                    return parsed;
                }
            }
        }
        WORKGROUP_SIZE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_workgroup_is_power_of_two() {
        assert!(REDUCE_WORKGROUP_SIZE.is_power_of_two());
        assert!(effective_workgroup_size() > 0);
    }

    #[test]
    fn test_partition_mode_is_sticky() {
        let mode = partition_mode();
        assert!(set_partition_mode(mode).is_ok());
        let other = match mode {
            PartitionMode::Equal => PartitionMode::Proportional,
            PartitionMode::Proportional => PartitionMode::Equal,
        };
        assert!(set_partition_mode(other).is_err());
        assert_eq!(partition_mode(), mode);
    }
}
