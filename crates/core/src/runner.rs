//! The all-reduce run: set up buffers on every device, reduce, check, tear down

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::comm::CommGroup;
use crate::config::{AllocatorKind, RunConfig};
use crate::error::{ReduceError, Result};
use crate::gpu::{DeviceStream, MultiGpuContext};
use crate::memory::{allocator_for, DeviceBuffer, MemoryEstimate};
use crate::tensor::{reduce_into, DType};

#[cfg(not(feature = "cuda"))]
use crate::gpu::SimulatedTopology;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Success,
    /// The run could not take place on this hardware; not a failure
    Skipped { reason: String },
}

/// Wall-clock time spent in each phase, in milliseconds
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseTimings {
    /// Device open, allocation, memset and stream creation
    pub setup_ms: f64,
    /// Communicator initialization
    pub init_ms: f64,
    /// All iterations, each including its stream synchronization
    pub collective_ms: f64,
    pub verify_ms: f64,
    /// Buffers freed, communicators destroyed
    pub teardown_ms: f64,
}

/// Per-iteration collective latency
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationStats {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl IterationStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mean_ms = values.iter().sum::<f64>() / values.len() as f64;
        let min_ms = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_ms = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Self { mean_ms, min_ms, max_ms }
    }
}

/// Result of comparing every receive buffer with the host reference
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub expected: f64,
    pub elements_checked: usize,
    pub max_abs_error: f64,
}

/// Everything one run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub config: RunConfig,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub device_names: Vec<String>,
    pub memory: Option<MemoryEstimate>,
    pub bytes_per_rank: usize,
    pub timings: PhaseTimings,
    pub iterations: IterationStats,
    /// Bytes per rank over mean iteration time, GB/s
    pub algbw_gbps: f64,
    /// Algorithm bandwidth scaled by 2(n-1)/n, GB/s
    pub busbw_gbps: f64,
    pub verification: Option<Verification>,
}

impl RunReport {
    fn skipped(config: RunConfig, reason: String) -> Self {
        Self {
            bytes_per_rank: config.bytes_per_buffer(),
            config,
            outcome: Outcome::Skipped { reason },
            device_names: Vec::new(),
            memory: None,
            timings: PhaseTimings::default(),
            iterations: IterationStats::default(),
            algbw_gbps: 0.0,
            busbw_gbps: 0.0,
            verification: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Algorithm and bus bandwidth in GB/s for `bytes` moved per rank in `seconds`
pub fn bandwidth(bytes: usize, seconds: f64, num_ranks: usize) -> (f64, f64) {
    if seconds <= 0.0 || num_ranks == 0 {
        return (0.0, 0.0);
    }
    let algbw = bytes as f64 / 1e9 / seconds;
    let factor = 2.0 * (num_ranks as f64 - 1.0) / num_ranks as f64;
    (algbw, algbw * factor)
}

/// Value every output element should hold: the reduction of each rank's memset value
pub fn expected_result(config: &RunConfig) -> Result<f64> {
    let size = config.dtype.size_bytes();
    let inputs = vec![vec![config.send_fill; size]; config.num_devices()];
    let mut out = vec![0u8; size];
    reduce_into(config.dtype, config.op, 1, &inputs, &mut out)?;
    Ok(config.dtype.decode(&out))
}

/// Relative error accepted when comparing device results with the host reference
fn tolerance(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => 1e-5,
        DType::F16 | DType::BF16 => 1e-2,
        DType::F64 => 1e-12,
        DType::I32 => 0.0,
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// One configured all-reduce run
pub struct AllReduceRun {
    config: RunConfig,
    #[cfg(not(feature = "cuda"))]
    topology: SimulatedTopology,
}

impl AllReduceRun {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            #[cfg(not(feature = "cuda"))]
            topology: SimulatedTopology::default(),
        }
    }

    /// Run against a custom set of simulated devices
    #[cfg(not(feature = "cuda"))]
    pub fn with_topology(config: RunConfig, topology: SimulatedTopology) -> Self {
        Self { config, topology }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    #[cfg(feature = "cuda")]
    fn open_context(&self) -> Result<MultiGpuContext> {
        MultiGpuContext::new(&self.config.devices)
    }

    #[cfg(not(feature = "cuda"))]
    fn open_context(&self) -> Result<MultiGpuContext> {
        MultiGpuContext::with_topology(&self.config.devices, &self.topology)
    }

    /// Execute the run end to end
    pub fn run(&self) -> Result<RunReport> {
        let config = &self.config;
        config.validate()?;
        let n = config.num_devices();
        info!(
            "All-reduce of {} x {} ({}) over devices {:?} with {} allocator",
            config.count, config.dtype, config.op, config.devices, config.allocator
        );

        let setup_start = Instant::now();
        let ctx = self.open_context()?;

        if config.allocator == AllocatorKind::Vmm {
            for device in &ctx.devices {
                if !device.supports_vmm()? {
                    let reason = ReduceError::VmmUnsupported {
                        device: device.device_id,
                    }
                    .to_string();
                    warn!("{}; skipping run", reason);
                    return Ok(RunReport::skipped(config.clone(), reason));
                }
            }
        }

        let device_names = ctx.devices.iter().map(|d| d.name()).collect::<Result<Vec<_>>>()?;

        let allocator = allocator_for(config.allocator);
        let bytes = config.bytes_per_buffer();
        let mut memory = None;
        for device in &ctx.devices {
            let estimate = MemoryEstimate::for_device(config, allocator.as_ref(), device)?;
            estimate.check_fits(device)?;
            memory.get_or_insert(estimate);
        }

        let mut sends: Vec<Box<dyn DeviceBuffer>> = Vec::with_capacity(n);
        let mut recvs: Vec<Box<dyn DeviceBuffer>> = Vec::with_capacity(n);
        let mut streams: Vec<DeviceStream> = Vec::with_capacity(n);
        for device in &ctx.devices {
            device.bind_to_thread()?;
            let mut send = allocator.allocate(device, bytes)?;
            let mut recv = allocator.allocate(device, bytes)?;
            send.memset(config.send_fill)?;
            recv.memset(config.recv_fill)?;
            streams.push(device.create_stream()?);
            debug!(device = device.device_id, bytes, "buffers ready");
            sends.push(send);
            recvs.push(recv);
        }
        let setup = setup_start.elapsed();
        info!("Allocated {} bytes x 2 on each of {} devices", bytes, n);

        let init_start = Instant::now();
        let comms = CommGroup::init_all(&ctx)?;
        let init = init_start.elapsed();

        let collective_start = Instant::now();
        let mut iteration_ms = Vec::with_capacity(config.iterations);
        for iter in 0..config.iterations {
            let start = Instant::now();
            comms.all_reduce_grouped(&sends, &mut recvs, config.count, config.dtype, config.op, &streams)?;
            for stream in &streams {
                stream.device().bind_to_thread()?;
                stream.synchronize()?;
            }
            iteration_ms.push(ms(start.elapsed()));
            debug!(iter, "all-reduce complete");
        }
        let collective = collective_start.elapsed();
        let iterations = IterationStats::from_values(&iteration_ms);
        info!("All-reduce finished: {} iterations, mean {:.3} ms", config.iterations, iterations.mean_ms);

        let verify_start = Instant::now();
        let verification = if config.verify {
            let v = verify(config, &recvs)?;
            info!("Verified {} elements, expected {}", v.elements_checked, v.expected);
            Some(v)
        } else {
            None
        };
        let verify_time = verify_start.elapsed();

        let teardown_start = Instant::now();
        for buffer in sends.into_iter().chain(recvs) {
            buffer.free()?;
        }
        drop(comms);
        drop(streams);
        drop(ctx);
        let teardown = teardown_start.elapsed();

        let (algbw_gbps, busbw_gbps) = bandwidth(bytes, iterations.mean_ms / 1000.0, n);
        Ok(RunReport {
            config: config.clone(),
            outcome: Outcome::Success,
            device_names,
            memory,
            bytes_per_rank: bytes,
            timings: PhaseTimings {
                setup_ms: ms(setup),
                init_ms: ms(init),
                collective_ms: ms(collective),
                verify_ms: ms(verify_time),
                teardown_ms: ms(teardown),
            },
            iterations,
            algbw_gbps,
            busbw_gbps,
            verification,
        })
    }
}

/// Compare the first `count` elements of every receive buffer with the reference
fn verify(config: &RunConfig, recvs: &[Box<dyn DeviceBuffer>]) -> Result<Verification> {
    let expected = expected_result(config)?;
    let tol = tolerance(config.dtype);
    let size = config.dtype.size_bytes();
    let nbytes = config.count * size;

    let mut max_abs_error = 0.0f64;
    let mut elements_checked = 0;
    for recv in recvs {
        let data = recv.read()?;
        for (index, elem) in data[..nbytes].chunks_exact(size).enumerate() {
            let got = config.dtype.decode(elem);
            elements_checked += 1;
            if got == expected || (got.is_nan() && expected.is_nan()) {
                continue;
            }
            let err = (got - expected).abs();
            if !(err <= tol * expected.abs()) {
                return Err(ReduceError::VerificationFailed {
                    device: recv.device_id(),
                    index,
                    expected: expected.to_string(),
                    got: got.to_string(),
                });
            }
            max_abs_error = max_abs_error.max(err);
        }
    }
    Ok(Verification {
        expected,
        elements_checked,
        max_abs_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::ReduceOp;

    #[test]
    fn test_expected_result_default_run() {
        let config = RunConfig::default();
        let one = f32::from_le_bytes([1, 1, 1, 1]) as f64;
        assert_eq!(expected_result(&config).unwrap(), 2.0 * one);
    }

    #[test]
    fn test_expected_result_per_op() {
        let base = RunConfig {
            devices: vec![0, 1, 2],
            dtype: DType::I32,
            send_fill: 0,
            ..RunConfig::default()
        };
        assert_eq!(expected_result(&base).unwrap(), 0.0);

        let max = RunConfig {
            send_fill: 1,
            op: ReduceOp::Max,
            ..base.clone()
        };
        assert_eq!(expected_result(&max).unwrap(), 0x0101_0101 as f64);
    }

    #[test]
    fn test_bandwidth_scaling() {
        let (alg, bus) = bandwidth(2_000_000_000, 1.0, 2);
        assert!((alg - 2.0).abs() < 1e-12);
        assert!((bus - 2.0).abs() < 1e-12);

        let (alg, bus) = bandwidth(1_000_000_000, 0.5, 4);
        assert!((alg - 2.0).abs() < 1e-12);
        assert!((bus - 3.0).abs() < 1e-12);

        assert_eq!(bandwidth(1024, 0.0, 2), (0.0, 0.0));
        assert_eq!(bandwidth(1024, 1.0, 1).1, 0.0);
    }

    #[test]
    fn test_iteration_stats() {
        let stats = IterationStats::from_values(&[1.0, 3.0, 2.0]);
        assert_eq!(stats.mean_ms, 2.0);
        assert_eq!(stats.min_ms, 1.0);
        assert_eq!(stats.max_ms, 3.0);
        assert_eq!(IterationStats::from_values(&[]).mean_ms, 0.0);
    }

    #[test]
    fn test_skipped_report_serializes_status() {
        let report = RunReport::skipped(RunConfig::default(), "no vmm".into());
        assert!(!report.is_success());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "no vmm");
    }
}
