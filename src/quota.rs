//! Resource quantity handling for the namespace scheduler.
//!
//! Quantities are normalised into a [`ResourceVector`] (CPU millicores,
//! memory bytes) so that slice arithmetic and capacity accounting work on
//! plain integers.

use k8s_openapi::api::core::v1::ResourceQuota;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::SchedulingSlice;
use crate::error::{OperatorError, Result};

/// A (cpu, memory) pair in canonical units: millicores and bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceVector {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        cpu_millis: 0,
        memory_bytes: 0,
    };

    pub fn new(cpu_millis: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    /// Coordinate-wise maximum.
    pub fn max(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis.max(other.cpu_millis),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
        }
    }

    pub fn add(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis + other.cpu_millis,
            memory_bytes: self.memory_bytes + other.memory_bytes,
        }
    }

    pub fn sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis - other.cpu_millis,
            memory_bytes: self.memory_bytes - other.memory_bytes,
        }
    }

    pub fn scale(&self, n: u32) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis * n as i64,
            memory_bytes: self.memory_bytes * n as i64,
        }
    }

    /// True when `other` fits inside this vector on both axes.
    pub fn covers(&self, other: &ResourceVector) -> bool {
        self.cpu_millis >= other.cpu_millis && self.memory_bytes >= other.memory_bytes
    }
}

/// Parse a CPU quantity ("2", "500m", "1.5") into millicores.
pub fn parse_cpu(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    if let Some(millis) = s.strip_suffix('m') {
        return millis
            .parse::<i64>()
            .map_err(|e| OperatorError::Configuration(format!("invalid cpu quantity {s:?}: {e}")));
    }
    let cores: f64 = s
        .parse()
        .map_err(|e| OperatorError::Configuration(format!("invalid cpu quantity {s:?}: {e}")))?;
    Ok((cores * 1000.0).round() as i64)
}

/// Parse a memory quantity ("128974848", "129M", "4Gi") into bytes.
pub fn parse_memory(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let suffixes: [(&str, i64); 10] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
    ];
    for (suffix, multiplier) in suffixes {
        if let Some(value) = s.strip_suffix(suffix) {
            let value: f64 = value.parse().map_err(|e| {
                OperatorError::Configuration(format!("invalid memory quantity {s:?}: {e}"))
            })?;
            return Ok((value * multiplier as f64).round() as i64);
        }
    }
    let bytes: f64 = s
        .parse()
        .map_err(|e| OperatorError::Configuration(format!("invalid memory quantity {s:?}: {e}")))?;
    Ok(bytes.round() as i64)
}

/// Build a vector from cpu/memory quantity strings.
pub fn parse_vector(cpu: &str, memory: &str) -> Result<ResourceVector> {
    Ok(ResourceVector {
        cpu_millis: parse_cpu(cpu)?,
        memory_bytes: parse_memory(memory)?,
    })
}

impl SchedulingSlice {
    /// The slice as a canonical vector.
    pub fn to_vector(&self) -> Result<ResourceVector> {
        parse_vector(&self.cpu, &self.memory)
    }
}

fn quantity_or_zero(q: Option<&Quantity>, parse: fn(&str) -> Result<i64>) -> i64 {
    q.and_then(|q| parse(&q.0).ok()).unwrap_or(0)
}

/// Coordinate-wise maximum over the hard limits of every quota in the
/// namespace. Multiple quotas bind the tightest limit, but scheduling wants
/// the envelope; operators who want a sum should collapse their quotas.
pub fn max_quota(quotas: &[ResourceQuota]) -> ResourceVector {
    let mut envelope = ResourceVector::ZERO;
    for quota in quotas {
        let hard = quota.spec.as_ref().and_then(|s| s.hard.as_ref());
        let Some(hard) = hard else { continue };
        let cpu = hard
            .get("cpu")
            .or_else(|| hard.get("requests.cpu"))
            .or_else(|| hard.get("limits.cpu"));
        let memory = hard
            .get("memory")
            .or_else(|| hard.get("requests.memory"))
            .or_else(|| hard.get("limits.memory"));
        let found = ResourceVector {
            cpu_millis: quantity_or_zero(cpu, parse_cpu),
            memory_bytes: quantity_or_zero(memory, parse_memory),
        };
        envelope = envelope.max(&found);
    }
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ResourceQuotaSpec;
    use std::collections::BTreeMap;

    fn quota(cpu: &str, memory: &str) -> ResourceQuota {
        let mut hard = BTreeMap::new();
        hard.insert("cpu".to_string(), Quantity(cpu.to_string()));
        hard.insert("memory".to_string(), Quantity(memory.to_string()));
        ResourceQuota {
            spec: Some(ResourceQuotaSpec {
                hard: Some(hard),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("2").unwrap(), 2000);
        assert_eq!(parse_cpu("500m").unwrap(), 500);
        assert_eq!(parse_cpu("1.5").unwrap(), 1500);
        assert_eq!(parse_cpu("0").unwrap(), 0);
        assert!(parse_cpu("two").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("4Gi").unwrap(), 4 * (1 << 30));
        assert_eq!(parse_memory("512Mi").unwrap(), 512 * (1 << 20));
        assert_eq!(parse_memory("129M").unwrap(), 129_000_000);
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert!(parse_memory("lots").is_err());
    }

    #[test]
    fn test_max_quota_is_envelope_not_sum() {
        let quotas = vec![quota("8", "8Gi"), quota("4", "16Gi")];
        let envelope = max_quota(&quotas);
        assert_eq!(envelope.cpu_millis, 8000);
        assert_eq!(envelope.memory_bytes, 16 * (1 << 30));
    }

    #[test]
    fn test_max_quota_empty_is_zero() {
        assert_eq!(max_quota(&[]), ResourceVector::ZERO);
    }

    #[test]
    fn test_max_quota_accepts_requests_keys() {
        let mut hard = BTreeMap::new();
        hard.insert("requests.cpu".to_string(), Quantity("2".to_string()));
        hard.insert("requests.memory".to_string(), Quantity("4Gi".to_string()));
        let q = ResourceQuota {
            spec: Some(ResourceQuotaSpec {
                hard: Some(hard),
                ..Default::default()
            }),
            ..Default::default()
        };
        let envelope = max_quota(&[q]);
        assert_eq!(envelope.cpu_millis, 2000);
        assert_eq!(envelope.memory_bytes, 4 * (1 << 30));
    }

    #[test]
    fn test_vector_ops() {
        let a = ResourceVector::new(2000, 4096);
        let b = ResourceVector::new(1000, 8192);
        assert_eq!(a.max(&b), ResourceVector::new(2000, 8192));
        assert_eq!(a.add(&b), ResourceVector::new(3000, 12288));
        assert_eq!(b.sub(&a), ResourceVector::new(-1000, 4096));
        assert_eq!(a.scale(3), ResourceVector::new(6000, 12288));
        assert!(a.covers(&ResourceVector::new(2000, 4096)));
        assert!(!a.covers(&b));
    }
}
