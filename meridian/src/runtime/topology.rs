//! Core selection for the conductor thread.
//!
//! Uses `num_cpus` for core counts and `core_affinity` for pinning. On most
//! systems core ids 0..N map to separate physical cores before SMT siblings
//! are enumerated.

use core_affinity::CoreId;

/// CPU topology detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    pub logical_cores: usize,
    pub physical_cores: usize,
    pub has_smt: bool,
    /// Core ids this process may be pinned to.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            has_smt: logical_cores > physical_cores,
            available_cores,
        }
    }

    /// Core for the conductor, or `None` to leave placement to the OS.
    ///
    /// With two or more physical cores the conductor takes the highest
    /// physical core, leaving core 0 to the application.
    #[must_use]
    pub fn conductor_core(&self) -> Option<usize> {
        if self.physical_cores < 2 {
            return None;
        }
        self.available_cores
            .iter()
            .copied()
            .filter(|core| *core < self.physical_cores)
            .max()
    }
}

/// Pinning policy for the conductor thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CpuConfig {
    #[default]
    Auto,
    Pinned(usize),
    Disabled,
}

impl CpuConfig {
    #[must_use]
    pub fn resolve(&self) -> Option<usize> {
        match self {
            Self::Auto => CpuTopology::detect().conductor_core(),
            Self::Pinned(core) => Some(*core),
            Self::Disabled => None,
        }
    }
}

/// Pins the current thread. Returns false if the OS refused or the core
/// id is invalid.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}
