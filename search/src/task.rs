//! The search task: what is being tuned, and for which hardware.

use std::sync::Arc;

use loft_ir::{ComputeDag, HardwareParams};

/// One tuning task: a compute DAG, a stable workload key for measurement
/// bookkeeping, and the hardware facts the rules consult.
#[derive(Debug, Clone)]
pub struct SearchTask {
    pub dag: Arc<ComputeDag>,
    pub workload_key: String,
    pub hardware_params: HardwareParams,
}

impl SearchTask {
    pub fn new(dag: Arc<ComputeDag>, workload_key: impl Into<String>, hardware_params: HardwareParams) -> Self {
        Self { dag, workload_key: workload_key.into(), hardware_params }
    }
}
