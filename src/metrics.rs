// Copyright 2023 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for the snapshotter surface.

use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge, TextEncoder,
};

use snapshotter_api::error::{Error, Result};

lazy_static::lazy_static! {
    pub static ref SNAPSHOT_OPS: IntCounterVec = register_int_counter_vec!(
        "nydus_snapshotter_operations_total",
        "Snapshot operations by kind and outcome",
        &["op", "outcome"]
    )
    .unwrap();
    pub static ref DAEMON_COUNT: IntGauge = register_int_gauge!(
        "nydus_snapshotter_daemons",
        "Number of live FS daemons"
    )
    .unwrap();
    pub static ref INSTANCE_COUNT: IntGauge = register_int_gauge!(
        "nydus_snapshotter_rafs_instances",
        "Number of mounted RAFS instances"
    )
    .unwrap();
}

pub fn observe(op: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    SNAPSHOT_OPS.with_label_values(&[op, outcome]).inc();
}

/// Render every registered metric in the Prometheus text format.
pub fn export_text() -> Result<String> {
    let mut buf = String::new();
    TextEncoder
        .encode_utf8(&prometheus::gather(), &mut buf)
        .map_err(|e| Error::internal(format!("encode metrics: {}", e)))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_counters() {
        observe("prepare", true);
        observe("prepare", false);
        DAEMON_COUNT.set(1);
        let text = export_text().unwrap();
        assert!(text.contains("nydus_snapshotter_operations_total"));
        assert!(text.contains("nydus_snapshotter_daemons"));
    }
}
