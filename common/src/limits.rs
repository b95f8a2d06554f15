use serde::{Deserialize, Serialize};

/// Resource caps applied to builds and runtime containers, parsed from the
/// human-readable forms used in configuration ("512m", "2g", "0.5").
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResourceLimits {
    /// Hard memory limit in bytes
    pub memory_bytes: i64,
    /// CPU limit in units of 1e-9 CPUs
    pub nano_cpus: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 2 * 1024 * 1024 * 1024,
            nano_cpus: 2_000_000_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid resource limit {0:?}")]
pub struct InvalidLimit(pub String);

/// Parses "512m", "2g", "1024k" or plain byte counts into bytes.
pub fn parse_memory(value: &str) -> Result<i64, InvalidLimit> {
    let value = value.trim().to_ascii_lowercase();

    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b'k') => (&value[..value.len() - 1], 1024i64),
        Some(b'm') => (&value[..value.len() - 1], 1024i64 * 1024),
        Some(b'g') => (&value[..value.len() - 1], 1024i64 * 1024 * 1024),
        Some(b'0'..=b'9') => (value.as_str(), 1),
        _ => return Err(InvalidLimit(value.clone())),
    };

    let count: i64 = digits.parse().map_err(|_| InvalidLimit(value.clone()))?;
    count
        .checked_mul(multiplier)
        .filter(|bytes| *bytes > 0)
        .ok_or(InvalidLimit(value))
}

/// Parses fractional CPU counts ("0.5", "2") into nano-CPUs.
pub fn parse_cpus(value: &str) -> Result<i64, InvalidLimit> {
    let cpus: f64 = value
        .trim()
        .parse()
        .map_err(|_| InvalidLimit(value.to_string()))?;

    if !(cpus > 0.0 && cpus <= 1024.0) {
        return Err(InvalidLimit(value.to_string()));
    }

    Ok((cpus * 1e9) as i64)
}

impl ResourceLimits {
    pub fn parse(memory: &str, cpus: &str) -> Result<Self, InvalidLimit> {
        Ok(Self {
            memory_bytes: parse_memory(memory)?,
            nano_cpus: parse_cpus(cpus)?,
        })
    }
}
