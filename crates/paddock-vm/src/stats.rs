//! Resource usage counters reported by a driver.

use serde::{Deserialize, Serialize};

/// A snapshot of a VM's resource usage.
///
/// Counters are cumulative since the hypervisor started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    /// One entry per attached block device
    #[serde(default)]
    pub block: Vec<BlockStats>,
    /// One entry per plugged network device
    #[serde(default)]
    pub network: Vec<NetworkStats>,
}

/// CPU time in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    pub total_ns: u64,
    pub user_ns: u64,
    pub system_ns: u64,
    /// Total time per vCPU, indexed by vCPU number
    #[serde(default)]
    pub per_cpu_ns: Vec<u64>,
}

/// Guest memory in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub usage_bytes: u64,
    pub available_bytes: u64,
    pub rss_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    /// Volume name the device was attached for
    pub name: String,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Host device name
    pub device: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

impl VmStats {
    /// Sum of the per-device counters: (read, written) block bytes.
    pub fn block_bytes(&self) -> (u64, u64) {
        self.block.iter().fold((0, 0), |(r, w), b| {
            (r + b.read_bytes, w + b.write_bytes)
        })
    }
}
