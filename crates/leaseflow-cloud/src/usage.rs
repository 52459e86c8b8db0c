//! Usage metering for billing

use chrono::{DateTime, Utc};
use leaseflow_core::ResourceSpec;
use serde::{Deserialize, Serialize};

/// One billing sample, covering the interval since the previous sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    #[serde(rename = "workloadID")]
    pub workload_id: String,
    pub measured_at: DateTime<Utc>,
    pub cpu_seconds: f64,
    pub memory_byte_seconds: f64,
    pub network_bytes: u64,
}

/// Accrues resource time while a workload runs
#[derive(Debug, Clone)]
pub struct UsageMeter {
    /// Millicores across all replicas
    cpu_millicores: i64,
    /// Bytes across all replicas
    memory_bytes: i64,
    running_since: Option<DateTime<Utc>>,
    accrued_ms: i64,
    last_network_total: Option<u64>,
}

impl UsageMeter {
    pub fn new(resources: ResourceSpec, replicas: u32) -> Self {
        let replicas = i64::from(replicas.max(1));
        Self {
            cpu_millicores: resources.cpu.saturating_mul(replicas),
            memory_bytes: resources.memory.saturating_mul(replicas),
            running_since: None,
            accrued_ms: 0,
            last_network_total: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// Start or stop the clock
    pub fn set_running(&mut self, running: bool, now: DateTime<Utc>) {
        match (running, self.running_since) {
            (true, None) => self.running_since = Some(now),
            (false, Some(since)) => {
                self.accrue(since, now);
                self.running_since = None;
            }
            _ => {}
        }
    }

    /// Close the current interval
    ///
    /// `network_total` is the backend's cumulative byte counter, when it has
    /// one. The first sample only establishes the baseline.
    pub fn sample(
        &mut self,
        workload_id: &str,
        now: DateTime<Utc>,
        network_total: Option<u64>,
    ) -> UsageRecord {
        if let Some(since) = self.running_since {
            self.accrue(since, now);
            self.running_since = Some(now);
        }

        let seconds = self.accrued_ms as f64 / 1000.0;
        self.accrued_ms = 0;

        let network_bytes = match (network_total, self.last_network_total) {
            (Some(total), Some(last)) => total.saturating_sub(last),
            _ => 0,
        };
        if network_total.is_some() {
            self.last_network_total = network_total;
        }

        UsageRecord {
            workload_id: workload_id.to_string(),
            measured_at: now,
            cpu_seconds: self.cpu_millicores as f64 / 1000.0 * seconds,
            memory_byte_seconds: self.memory_bytes as f64 * seconds,
            network_bytes,
        }
    }

    fn accrue(&mut self, since: DateTime<Utc>, now: DateTime<Utc>) {
        self.accrued_ms += (now - since).num_milliseconds().max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use leaseflow_core::GIB;

    fn spec() -> ResourceSpec {
        ResourceSpec {
            cpu: 2000,
            memory: GIB,
            gpu: 0,
        }
    }

    #[test]
    fn test_accrues_only_while_running() {
        let t0 = Utc::now();
        let mut meter = UsageMeter::new(spec(), 1);

        meter.set_running(true, t0);
        meter.set_running(false, t0 + Duration::seconds(10));
        // Paused for 50s
        meter.set_running(true, t0 + Duration::seconds(60));

        let record = meter.sample("aws-d1", t0 + Duration::seconds(70), None);
        assert_eq!(record.cpu_seconds, 40.0);
        assert_eq!(record.memory_byte_seconds, (GIB * 20) as f64);
        assert_eq!(record.network_bytes, 0);
    }

    #[test]
    fn test_sample_resets_interval() {
        let t0 = Utc::now();
        let mut meter = UsageMeter::new(spec(), 2);
        meter.set_running(true, t0);

        let first = meter.sample("k8s-d1", t0 + Duration::seconds(5), Some(1_000));
        assert_eq!(first.cpu_seconds, 20.0);
        assert_eq!(first.network_bytes, 0);

        let second = meter.sample("k8s-d1", t0 + Duration::seconds(6), Some(1_500));
        assert_eq!(second.cpu_seconds, 4.0);
        assert_eq!(second.network_bytes, 500);
    }

    #[test]
    fn test_stopped_meter_reports_zero() {
        let mut meter = UsageMeter::new(spec(), 1);
        let record = meter.sample("vs-d1", Utc::now(), None);
        assert_eq!(record.cpu_seconds, 0.0);
        assert_eq!(record.memory_byte_seconds, 0.0);
    }

    #[test]
    fn test_usage_record_wire_names() {
        let record = UsageMeter::new(spec(), 1).sample("az-d1", Utc::now(), None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["workloadID"], "az-d1");
        assert!(json.get("memoryByteSeconds").is_some());
        assert!(json.get("networkBytes").is_some());
    }
}
