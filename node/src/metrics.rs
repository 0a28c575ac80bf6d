use common::{Heartbeat, NodeStatus};
use sysinfo::{CpuExt, System, SystemExt};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub cpu_percent: f32,
    pub mem_bytes: u64,
}

/// Fuente de métricas del host para los heartbeats.
pub trait HostSampler: Send {
    fn sample(&mut self) -> HostSample;
}

pub struct SysinfoSampler {
    sys: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new_all(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&mut self) -> HostSample {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        HostSample {
            cpu_percent: self.sys.global_cpu_info().cpu_usage(),
            mem_bytes: self.sys.used_memory(),
        }
    }
}

/// DEGRADED por encima del techo de utilización; `load` es la fracción de CPU.
pub fn heartbeat_from(sample: HostSample, hostname: &str, max_utilization_percent: f32) -> Heartbeat {
    let status = if sample.cpu_percent > max_utilization_percent {
        NodeStatus::Degraded
    } else {
        NodeStatus::Online
    };

    Heartbeat {
        status,
        load: (f64::from(sample.cpu_percent) / 100.0).max(0.0),
        hostname: hostname.to_string(),
        cpu_percent: Some(sample.cpu_percent),
        mem_bytes: Some(sample.mem_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_alta_degrada_el_nodo() {
        let hb = heartbeat_from(
            HostSample {
                cpu_percent: 90.0,
                mem_bytes: 10,
            },
            "auto-1",
            85.0,
        );
        assert_eq!(hb.status, NodeStatus::Degraded);
        assert!((hb.load - 0.9).abs() < 1e-6);
    }

    #[test]
    fn en_el_techo_sigue_online() {
        let hb = heartbeat_from(
            HostSample {
                cpu_percent: 85.0,
                mem_bytes: 0,
            },
            "auto-1",
            85.0,
        );
        assert_eq!(hb.status, NodeStatus::Online);
        assert_eq!(hb.hostname, "auto-1");
    }
}
