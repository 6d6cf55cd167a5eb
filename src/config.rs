// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accelerator configuration.

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Where the interrupt controller is emulated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelIrqchip {
    /// Everything lives in user space; no irqfds or GSI routing.
    Off,
    /// The whole interrupt controller lives in the kernel.
    #[default]
    On,
    /// Local APICs in the kernel, IOAPIC/PIC in user space. Resample events are delivered by the
    /// routing layer instead of the kernel.
    Split,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccelConfig {
    /// Entries per vCPU dirty ring. Zero selects bitmap dirty tracking.
    pub dirty_ring_size: u32,
    /// Upper bound on the size of one kernel memory slot. Larger sections are split.
    pub max_slot_size: Option<u64>,
    pub kernel_irqchip: KernelIrqchip,
    /// Use manual dirty log protection when the kernel offers it.
    pub manual_dirty_log_protect: bool,
    /// Period of the dirty ring reaper thread.
    pub reaper_interval_ms: u64,
    /// CPU whose cycles are sampled by the profiling hook.
    pub profiling_cpu: i32,
    /// Slot count used when the kernel does not report one.
    pub default_nr_slots: u32,
}

impl Default for AccelConfig {
    fn default() -> Self {
        AccelConfig {
            dirty_ring_size: 0,
            max_slot_size: None,
            kernel_irqchip: KernelIrqchip::On,
            manual_dirty_log_protect: true,
            reaper_interval_ms: 1000,
            profiling_cpu: 0,
            default_nr_slots: 32,
        }
    }
}

impl AccelConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<AccelConfig> {
        let config: AccelConfig =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dirty_ring_size != 0 && !self.dirty_ring_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "dirty ring size {} is not a power of two",
                self.dirty_ring_size
            )));
        }
        if self.max_slot_size == Some(0) {
            return Err(Error::InvalidConfig("max slot size is zero".to_string()));
        }
        if self.default_nr_slots == 0 {
            return Err(Error::InvalidConfig("default slot count is zero".to_string()));
        }
        if self.reaper_interval_ms == 0 {
            return Err(Error::InvalidConfig("reaper interval is zero".to_string()));
        }
        Ok(())
    }

    pub fn uses_dirty_ring(&self) -> bool {
        self.dirty_ring_size > 0
    }

    pub fn split_irqchip(&self) -> bool {
        self.kernel_irqchip == KernelIrqchip::Split
    }
}
