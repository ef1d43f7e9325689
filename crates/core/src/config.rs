//! Run configuration

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ReduceError, Result};
use crate::tensor::{DType, ReduceOp};

/// Default element count per buffer (32M elements)
pub const DEFAULT_COUNT: usize = 32 * 1024 * 1024;

/// Byte written into every send buffer before the collective
pub const DEFAULT_SEND_FILL: u8 = 1;

/// Byte written into every receive buffer before the collective
pub const DEFAULT_RECV_FILL: u8 = 0;

/// Buffer allocation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    /// Plain device allocation
    #[default]
    Direct,
    /// Reserved virtual address range with physical chunks mapped on growth
    Vmm,
}

impl AllocatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            AllocatorKind::Direct => "direct",
            AllocatorKind::Vmm => "vmm",
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AllocatorKind {
    type Err = ReduceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" | "malloc" => Ok(AllocatorKind::Direct),
            "vmm" | "memmap" => Ok(AllocatorKind::Vmm),
            _ => Err(ReduceError::InvalidConfig(format!("unknown allocator '{}'", s))),
        }
    }
}

/// Configuration of one all-reduce run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Device ordinals taking part, one communicator each
    pub devices: Vec<usize>,
    /// Elements per buffer
    pub count: usize,
    /// Element type
    pub dtype: DType,
    /// Reduction operator
    pub op: ReduceOp,
    /// Buffer allocation strategy
    pub allocator: AllocatorKind,
    /// Byte memset into send buffers
    pub send_fill: u8,
    /// Byte memset into receive buffers
    pub recv_fill: u8,
    /// Number of grouped all-reduce calls to issue
    pub iterations: usize,
    /// Copy results back and compare against the host reference
    pub verify: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            devices: vec![0, 1],
            count: DEFAULT_COUNT,
            dtype: DType::F32,
            op: ReduceOp::Sum,
            allocator: AllocatorKind::Direct,
            send_fill: DEFAULT_SEND_FILL,
            recv_fill: DEFAULT_RECV_FILL,
            iterations: 1,
            verify: false,
        }
    }
}

impl RunConfig {
    /// Defaults overridden by `GPUREDUCE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup (env in production, a map in tests)
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GPUREDUCE_DEVICES") {
            self.devices = parse_device_list(&v)?;
        }
        if let Some(v) = lookup("GPUREDUCE_COUNT") {
            self.count = parse_number("GPUREDUCE_COUNT", &v)?;
        }
        if let Some(v) = lookup("GPUREDUCE_DTYPE") {
            self.dtype = v.parse()?;
        }
        if let Some(v) = lookup("GPUREDUCE_OP") {
            self.op = v.parse()?;
        }
        if let Some(v) = lookup("GPUREDUCE_ALLOCATOR") {
            self.allocator = v.parse()?;
        }
        if let Some(v) = lookup("GPUREDUCE_SEND_FILL") {
            self.send_fill = parse_number("GPUREDUCE_SEND_FILL", &v)?;
        }
        if let Some(v) = lookup("GPUREDUCE_RECV_FILL") {
            self.recv_fill = parse_number("GPUREDUCE_RECV_FILL", &v)?;
        }
        if let Some(v) = lookup("GPUREDUCE_ITERS") {
            self.iterations = parse_number("GPUREDUCE_ITERS", &v)?;
        }
        if let Some(v) = lookup("GPUREDUCE_VERIFY") {
            self.verify = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        Ok(self)
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Check the configuration before any device is touched
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(ReduceError::InvalidConfig("at least one device is required".into()));
        }
        let mut seen = HashSet::new();
        for &d in &self.devices {
            if !seen.insert(d) {
                return Err(ReduceError::InvalidConfig(format!("device {} listed twice", d)));
            }
        }
        if self.count == 0 {
            return Err(ReduceError::InvalidConfig("element count must be positive".into()));
        }
        if self.iterations == 0 {
            return Err(ReduceError::InvalidConfig("iterations must be positive".into()));
        }
        if self.count.checked_mul(self.dtype.size_bytes()).is_none() {
            return Err(ReduceError::InvalidConfig(format!(
                "{} elements of {} overflow the address space",
                self.count, self.dtype
            )));
        }
        Ok(())
    }

    /// Bytes in each send and each receive buffer
    pub fn bytes_per_buffer(&self) -> usize {
        self.count * self.dtype.size_bytes()
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }
}

/// Parse "0,1,3" into ordinals
pub fn parse_device_list(s: &str) -> Result<Vec<usize>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| parse_number("device list", p))
        .collect()
}

fn parse_number<T: FromStr>(what: &str, s: &str) -> Result<T> {
    s.trim()
        .parse()
        .map_err(|_| ReduceError::InvalidConfig(format!("{}: '{}' is not a valid number", what, s)))
}
