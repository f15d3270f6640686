//! Deterministic cost estimate from pod resource requests

use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

use preview_common::crd::CostEstimate;

use crate::quantity::{parse_cpu, parse_memory_gb};

/// Currency the estimate is expressed in
pub const CURRENCY: &str = "USD";

/// Unit prices used by [`estimate`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rates {
    /// Price per CPU core-hour
    pub cpu_core_hour: f64,
    /// Price per GB-hour of memory
    pub memory_gb_hour: f64,
}

impl Default for Rates {
    fn default() -> Self {
        Self {
            cpu_core_hour: 0.04,
            memory_gb_hour: 0.005,
        }
    }
}

/// Summed requests across every container of every pod
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Requests {
    /// CPU cores
    pub cpu_cores: f64,
    /// Memory in GiB-based gigabytes
    pub memory_gb: f64,
}

/// Sum container CPU and memory requests; unparsable quantities are skipped
pub fn sum_requests(pods: &[Pod]) -> Requests {
    let mut total = Requests::default();
    let containers = pods
        .iter()
        .filter_map(|p| p.spec.as_ref())
        .flat_map(|spec| spec.containers.iter());

    for container in containers {
        let Some(requests) = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
        else {
            continue;
        };
        if let Some(cpu) = requests.get("cpu") {
            match parse_cpu(&cpu.0) {
                Some(cores) => total.cpu_cores += cores,
                None => warn!(
                    container = %container.name,
                    quantity = %cpu.0,
                    "ignoring unparsable CPU request"
                ),
            }
        }
        if let Some(memory) = requests.get("memory") {
            match parse_memory_gb(&memory.0) {
                Some(gb) => total.memory_gb += gb,
                None => warn!(
                    container = %container.name,
                    quantity = %memory.0,
                    "ignoring unparsable memory request"
                ),
            }
        }
    }
    total
}

/// Estimate hourly and total cost for an environment.
///
/// `use_spot` is recorded by callers but applies no discount.
pub fn estimate(pods: &[Pod], ttl_hours: f64, _use_spot: bool, rates: Rates) -> CostEstimate {
    let requests = sum_requests(pods);
    let hourly =
        requests.cpu_cores * rates.cpu_core_hour + requests.memory_gb * rates.memory_gb_hour;
    CostEstimate {
        currency: CURRENCY.to_string(),
        hourly_cost: format!("{:.4}", hourly),
        total_cost: format!("{:.4}", hourly * ttl_hours),
    }
}
