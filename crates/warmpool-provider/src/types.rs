//! Values exchanged with providers.

/// Power state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Attributes of a machine as the provider sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineAttrs {
    pub name: String,
    /// Guest hostname, `None` until guest tools report it.
    pub hostname: Option<String>,
    /// Boot time in epoch seconds.
    pub boot_time: Option<u64>,
    pub power_state: PowerState,
}

impl MachineAttrs {
    /// A freshly booted, powered-on machine whose hostname matches its name.
    pub fn running(name: impl Into<String>, boot_time: u64) -> Self {
        let name = name.into();
        Self {
            hostname: Some(name.clone()),
            name,
            boot_time: Some(boot_time),
            power_state: PowerState::PoweredOn,
        }
    }
}

/// Where a machine currently runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachinePlacement {
    pub host: String,
    pub cluster: String,
    /// Grouping key (e.g. CPU generation) constraining valid migration targets.
    pub compat_class: String,
}

/// Raw utilization report for one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostStats {
    pub name: String,
    pub compat_class: String,
    pub in_maintenance: bool,
    pub healthy: bool,
    /// CPU utilization in percent.
    pub cpu_percent: f64,
    /// Memory utilization in percent.
    pub memory_percent: f64,
}

/// A host eligible for placement, ordered by `utilization`.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHost {
    pub name: String,
    pub compat_class: String,
    pub utilization: f64,
}
