//! Benchmark harness executable for the TileGrad backward-data driver.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use tilegrad_geometry::{resolve, ConvDescriptor, TunableConfig};
use tilegrad_launch::{BwdDataDriver, DeviceBuffers, MeasurementResult, SimulatedRuntime};

#[derive(Parser, Debug)]
#[command(name = "tilegrad-bench", about = "Backward-data implicit-GEMM launch driver toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sweep the built-in tunable table over one problem shape.
    Sweep {
        #[arg(long, default_value_t = 14)]
        hi: u32,
        #[arg(long, default_value_t = 14)]
        wi: u32,
        #[arg(long, default_value_t = 4)]
        n: u32,
        #[arg(long, default_value_t = 64)]
        k: u32,
        #[arg(long, default_value_t = 64)]
        c: u32,
        #[arg(long, default_value_t = 2)]
        stride_h: u32,
        #[arg(long, default_value_t = 2)]
        stride_w: u32,
        #[arg(long, default_value_t = 1)]
        dilation_h: u32,
        #[arg(long, default_value_t = 1)]
        dilation_w: u32,
        #[arg(long, default_value_t = 1)]
        pad_h: u32,
        #[arg(long, default_value_t = 1)]
        pad_w: u32,
        #[arg(long, default_value_t = 3)]
        fil_y: u32,
        #[arg(long, default_value_t = 3)]
        fil_x: u32,
        #[arg(long, default_value_t = 1)]
        group: u32,
        #[arg(long, default_value_t = 3)]
        warmup: usize,
        #[arg(long, default_value_t = 8)]
        repeat: usize,
        /// Write the sweep report as pretty-printed JSON.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the built-in tunable table with derived launch parameters.
    Tunables,
}

#[derive(Debug, Serialize)]
struct SweepCase {
    kernel: String,
    accepted: bool,
    duration_ms: f64,
    gflops: f64,
}

#[derive(Debug, Serialize)]
struct SweepReport {
    descriptor: ConvDescriptor,
    cases: Vec<SweepCase>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match Cli::parse().command {
        Command::Sweep {
            hi,
            wi,
            n,
            k,
            c,
            stride_h,
            stride_w,
            dilation_h,
            dilation_w,
            pad_h,
            pad_w,
            fil_y,
            fil_x,
            group,
            warmup,
            repeat,
            output,
        } => {
            let desc = ConvDescriptor {
                hi,
                wi,
                n,
                k,
                c,
                stride_h,
                stride_w,
                dilation_h,
                dilation_w,
                pad_h,
                pad_w,
                y: fil_y,
                x: fil_x,
                group,
            };
            desc.validate()?;
            run_sweep(desc, warmup, repeat, output)?;
        }
        Command::Tunables => {
            print_tunables();
        }
    }
    Ok(())
}

fn run_sweep(
    desc: ConvDescriptor,
    warmup: usize,
    repeat: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    let runtime = SimulatedRuntime::new();
    let driver = BwdDataDriver::new().with_runs(warmup, repeat);
    let buffers = DeviceBuffers {
        dinput: 0x1000_0000,
        weights: 0x2000_0000,
        doutput: 0x3000_0000,
    };

    info!(
        hi = desc.hi,
        wi = desc.wi,
        n = desc.n,
        k = desc.k,
        c = desc.c,
        ho = desc.ho(),
        wo = desc.wo(),
        "sweeping tunable table"
    );

    let mut cases = Vec::new();
    for tunable in TunableConfig::presets() {
        let result: MeasurementResult = driver.run(&runtime, &desc, &tunable, buffers)?;
        if result.is_rejected() {
            println!("- {}: rejected", result.kernel_name);
        } else {
            println!(
                "- {}: latency_ms={:.3} gflops={:.3}",
                result.kernel_name,
                result.duration_ms,
                result.gflops(&desc)
            );
        }
        cases.push(SweepCase {
            kernel: result.kernel_name.clone(),
            accepted: !result.is_rejected(),
            gflops: result.gflops(&desc),
            duration_ms: result.duration_ms,
        });
    }

    if let Some(path) = output {
        let report = SweepReport {
            descriptor: desc,
            cases,
        };
        fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        info!(path = %path.display(), "sweep report written");
    }
    Ok(())
}

fn print_tunables() {
    // The table shows shape-independent properties; grid sizes depend on
    // the problem and are reported by `sweep`.
    let reference = ConvDescriptor {
        hi: 14,
        wi: 14,
        n: 4,
        k: 64,
        c: 64,
        stride_h: 2,
        stride_w: 2,
        dilation_h: 1,
        dilation_w: 1,
        pad_h: 1,
        pad_w: 1,
        y: 3,
        x: 3,
        group: 1,
    };
    for tunable in TunableConfig::presets() {
        let geom = resolve(&reference, &tunable);
        println!(
            "{}\n  block_size={} shared_mem={}B num_of_gemm(ref)={} multihead={}",
            tunable.kernel_name(),
            tunable.block_size(),
            tunable.shared_mem_size(),
            geom.num_of_gemm,
            tunable.multihead,
        );
    }
}
