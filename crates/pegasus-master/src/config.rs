use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Config schema path for the master entry.
pub const MASTER_CFG_PATH: &str = "pegasus.master.MasterCfg";

/// Tunables for the worker pool and job pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterCfg {
    /// Heartbeat period advertised to workers.
    pub hb_interval_ms: u64,
    /// Period of the pool monitor sweep; also the heartbeat window length.
    pub monitor_interval_ms: u64,
    /// Heartbeats per window at or above which a worker counts as good.
    pub hb_cnt_good: u32,
    /// Heartbeats per window below which a worker counts as bad.
    pub hb_cnt_norm: u32,
    /// Failed task reports before a worker is moved to Fault.
    pub max_fault_cnt: u32,
    /// Failures of one task id before the whole job aborts.
    pub task_max_err: u32,
    /// Monitor sweeps a Pending worker survives before it is reaped.
    pub pending_grace_ticks: u32,
    /// Start verified workers as Unstable instead of Active, leaving
    /// promotion to the first monitor window.
    pub start_unstable: bool,
    /// Permit registering our address on the cfg server even when another
    /// master is already advertised there.
    pub allow_master_takeover: bool,
}

impl Default for MasterCfg {
    fn default() -> Self {
        Self {
            hb_interval_ms: 5_000,
            monitor_interval_ms: 30_000,
            hb_cnt_good: 5,
            hb_cnt_norm: 3,
            max_fault_cnt: 2,
            task_max_err: 5,
            pending_grace_ticks: 2,
            start_unstable: false,
            allow_master_takeover: true,
        }
    }
}

impl MasterCfg {
    pub fn hb_interval(&self) -> Duration {
        Duration::from_millis(self.hb_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn pending_grace(&self) -> Duration {
        self.monitor_interval() * self.pending_grace_ticks.max(1)
    }
}
