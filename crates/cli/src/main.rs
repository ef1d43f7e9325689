//! gpureduce CLI
//!
//! Runs one grouped all-reduce across the GPUs of this process.
//!
//! # Usage
//!
//! ```bash
//! # Two devices, 32M floats, direct allocation
//! gpureduce run
//!
//! # VMM-backed buffers, checked against the host reference
//! gpureduce run --allocator vmm --verify
//!
//! # Machine-readable report
//! gpureduce run --devices 0,1,2,3 --dtype bf16 --iters 20 --json
//!
//! # What is visible
//! gpureduce devices
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use console::style;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gpureduce_core::{device_count, AllReduceRun, AllocatorKind, DType, GpuDevice, Outcome, ReduceOp, RunConfig};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Parser)]
#[command(name = "gpureduce")]
#[command(version)]
#[command(about = "Grouped all-reduce across the GPUs of one process")]
#[command(long_about = r#"
gpureduce

Allocates a send and a receive buffer on every listed device, creates one
communicator per device, issues one all-reduce per device inside a group
and synchronizes every stream.

Settings come from GPUREDUCE_* environment variables (or a JSON file given
with --config), and command-line flags override either.

Examples:
  gpureduce run
  gpureduce run --allocator vmm --verify
  gpureduce run -d 0,1,2,3 --dtype bf16 --op max --iters 20 --json
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the all-reduce
    Run(RunArgs),

    /// List visible devices
    Devices,
}

#[derive(Args)]
struct RunArgs {
    /// Device ordinals, comma separated
    #[arg(short, long, value_delimiter = ',')]
    devices: Option<Vec<usize>>,

    /// Elements per buffer
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Element type (f32, f16, bf16, f64, i32)
    #[arg(long)]
    dtype: Option<DType>,

    /// Reduction (sum, prod, max, min, avg)
    #[arg(long)]
    op: Option<ReduceOp>,

    /// Buffer allocation (direct or vmm)
    #[arg(short, long)]
    allocator: Option<AllocatorKind>,

    /// Byte written into every send buffer
    #[arg(long)]
    send_fill: Option<u8>,

    /// Byte written into every receive buffer
    #[arg(long)]
    recv_fill: Option<u8>,

    /// Number of all-reduce iterations
    #[arg(short, long)]
    iters: Option<usize>,

    /// Check every result element against the host reference
    #[arg(long, default_value = "false")]
    verify: bool,

    /// Print the run report as JSON instead of the status line
    #[arg(long, default_value = "false")]
    json: bool,

    /// JSON configuration file (replaces environment settings)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl RunArgs {
    /// Defaults, then env or file, then flags
    fn resolve(&self) -> Result<RunConfig> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    fn resolve_with<F>(&self, lookup: F) -> Result<RunConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)?,
            None => RunConfig::default().with_env_lookup(lookup)?,
        };
        if let Some(devices) = &self.devices {
            config.devices = devices.clone();
        }
        if let Some(count) = self.count {
            config.count = count;
        }
        if let Some(dtype) = self.dtype {
            config.dtype = dtype;
        }
        if let Some(op) = self.op {
            config.op = op;
        }
        if let Some(allocator) = self.allocator {
            config.allocator = allocator;
        }
        if let Some(fill) = self.send_fill {
            config.send_fill = fill;
        }
        if let Some(fill) = self.recv_fill {
            config.recv_fill = fill;
        }
        if let Some(iters) = self.iters {
            config.iterations = iters;
        }
        if self.verify {
            config.verify = true;
        }
        Ok(config)
    }
}

/// One-line verdict of a finished run and the stream it goes to
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Stdout(&'static str),
    Stderr(&'static str),
}

/// What to print for `outcome`; a JSON report replaces the success line
fn verdict(outcome: &Outcome, json: bool) -> Option<Verdict> {
    match outcome {
        Outcome::Success if json => None,
        Outcome::Success => Some(Verdict::Stdout("Success")),
        Outcome::Skipped { .. } => Some(Verdict::Stderr("not support CUDA VMM")),
    }
}

/// Process exit status: a skipped run still exits 0
fn exit_status<T>(result: &Result<T>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn failure_line(err: &anyhow::Error) -> String {
    format!("{} {}", style("Failed:").red().bold(), err)
}

fn main() -> Result<ExitCode> {
    // Logs go to stderr so stdout carries only the status line or the report
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gpureduce=info,gpureduce_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => args
            .resolve()
            .and_then(|config| execute(config, args.json))
            .map(|outcome| verdict(&outcome, args.json)),
        Commands::Devices => list_devices().map(|()| None),
    };

    match &result {
        Ok(Some(Verdict::Stdout(line))) => println!("{}", style(line).green().bold()),
        Ok(Some(Verdict::Stderr(line))) => eprintln!("{}", line),
        Ok(None) => {}
        Err(e) => eprintln!("{}", failure_line(e)),
    }
    Ok(ExitCode::from(exit_status(&result)))
}

fn execute(config: RunConfig, json: bool) -> Result<Outcome> {
    tracing::info!("gpureduce v{}", env!("CARGO_PKG_VERSION"));

    let report = AllReduceRun::new(config).run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Outcome::Skipped { reason } = &report.outcome {
        tracing::debug!("skipped: {}", reason);
    } else {
        tracing::info!(
            "{} bytes per rank, algbw {:.2} GB/s, busbw {:.2} GB/s",
            report.bytes_per_rank,
            report.algbw_gbps,
            report.busbw_gbps
        );
    }
    Ok(report.outcome)
}

fn list_devices() -> Result<()> {
    let n = device_count()?;
    if n == 0 {
        println!("{} No devices visible", style("[WARN]").yellow().bold());
        return Ok(());
    }

    for ordinal in 0..n {
        let device = GpuDevice::new(ordinal)?;
        let (used, total) = device.memory_info()?;
        let vmm = if device.supports_vmm()? {
            style("yes").green()
        } else {
            style("no").red()
        };
        println!(
            "{} {}  {:.1}/{:.1} GiB used  vmm: {}",
            style(format!("GPU {}", ordinal)).cyan().bold(),
            device.name()?,
            used as f64 / GIB,
            total as f64 / GIB,
            vmm
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["gpureduce", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Run(args) => args,
            Commands::Devices => panic!("expected the run subcommand"),
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn config_file(name: &str, json: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gpureduce-cli-{}-{}.json",
            std::process::id(),
            name
        ));
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_env_or_flags() {
        let config = run_args(&[]).resolve_with(env(&[])).unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_env_applies_without_config_file() {
        let lookup = env(&[("GPUREDUCE_COUNT", "64"), ("GPUREDUCE_ALLOCATOR", "vmm")]);
        let config = run_args(&[]).resolve_with(lookup).unwrap();
        assert_eq!(config.count, 64);
        assert_eq!(config.allocator, AllocatorKind::Vmm);
    }

    #[test]
    fn test_config_file_replaces_env() {
        let path = config_file("replaces-env", r#"{"count": 128, "dtype": "bf16"}"#);
        let args = run_args(&["--config", path.to_str().unwrap()]);
        let lookup = env(&[("GPUREDUCE_COUNT", "64"), ("GPUREDUCE_OP", "max")]);
        let config = args.resolve_with(lookup).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.count, 128);
        assert_eq!(config.dtype, DType::BF16);
        // Env is not consulted at all once a file is given
        assert_eq!(config.op, ReduceOp::Sum);
    }

    #[test]
    fn test_flags_override_env_and_file() {
        let lookup = env(&[("GPUREDUCE_COUNT", "64"), ("GPUREDUCE_DEVICES", "2,3")]);
        let config = run_args(&["-d", "0,1,2", "-n", "16", "--op", "min", "--verify"])
            .resolve_with(lookup)
            .unwrap();
        assert_eq!(config.devices, vec![0, 1, 2]);
        assert_eq!(config.count, 16);
        assert_eq!(config.op, ReduceOp::Min);
        assert!(config.verify);

        let path = config_file("flags-win", r#"{"count": 128, "iterations": 4, "send_fill": 7}"#);
        let args = run_args(&[
            "--config",
            path.to_str().unwrap(),
            "--iters",
            "2",
            "--allocator",
            "vmm",
        ]);
        let config = args.resolve_with(env(&[])).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.count, 128);
        assert_eq!(config.iterations, 2);
        assert_eq!(config.send_fill, 7);
        assert_eq!(config.allocator, AllocatorKind::Vmm);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        assert!(run_args(&[]).resolve_with(env(&[("GPUREDUCE_DTYPE", "f8")])).is_err());
    }

    #[test]
    fn test_verdict_per_outcome() {
        assert_eq!(verdict(&Outcome::Success, false), Some(Verdict::Stdout("Success")));
        assert_eq!(verdict(&Outcome::Success, true), None);
        let skipped = Outcome::Skipped {
            reason: "GPU 1 does not support virtual address management".into(),
        };
        assert_eq!(verdict(&skipped, false), Some(Verdict::Stderr("not support CUDA VMM")));
        assert_eq!(verdict(&skipped, true), Some(Verdict::Stderr("not support CUDA VMM")));
    }

    #[test]
    fn test_exit_status_policy() {
        assert_eq!(exit_status::<Option<Verdict>>(&Ok(Some(Verdict::Stdout("Success")))), 0);
        let skipped: Result<Option<Verdict>> = Ok(Some(Verdict::Stderr("not support CUDA VMM")));
        assert_eq!(exit_status(&skipped), 0);
        assert_eq!(exit_status::<()>(&Err(anyhow::anyhow!("boom"))), 1);
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_good_run_exits_zero() {
        let config = run_args(&["-n", "64", "--verify"]).resolve_with(env(&[])).unwrap();
        let result = execute(config, false);
        assert_eq!(result.as_ref().unwrap(), &Outcome::Success);
        assert_eq!(exit_status(&result), 0);
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_failed_runs_exit_one_with_message() {
        for (devices, needle) in [("0,0", "listed twice"), ("0,9", "GPU 9 not available")] {
            let config = run_args(&["-d", devices, "-n", "64"]).resolve_with(env(&[])).unwrap();
            let result = execute(config, false);
            assert_eq!(exit_status(&result), 1, "devices {}", devices);
            let line = failure_line(result.as_ref().unwrap_err());
            assert!(line.contains("Failed:"), "{}", line);
            assert!(line.contains(needle), "{}", line);
        }
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_vmm_skip_exits_zero() {
        use gpureduce_core::{SimulatedDevice, SimulatedTopology};

        let topology = SimulatedTopology::uniform(
            2,
            SimulatedDevice {
                vmm_supported: false,
                ..SimulatedDevice::default()
            },
        );
        let config = run_args(&["-n", "64", "--allocator", "vmm"]).resolve_with(env(&[])).unwrap();
        let result: Result<Outcome> = AllReduceRun::with_topology(config, topology)
            .run()
            .map(|report| report.outcome)
            .map_err(Into::into);
        assert_eq!(exit_status(&result), 0);
        assert_eq!(
            verdict(result.as_ref().unwrap(), false),
            Some(Verdict::Stderr("not support CUDA VMM"))
        );
    }
}
