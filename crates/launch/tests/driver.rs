use tilegrad_geometry::{resolve, ConvDescriptor, TunableConfig};
use tilegrad_launch::{
    BwdDataDriver, BwdKernelArgs, DeviceBuffers, SimCall, SimulatedRuntime, ZeroFillMode,
};

fn stride2_3x3() -> ConvDescriptor {
    ConvDescriptor {
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
    }
}

fn buffers() -> DeviceBuffers {
    DeviceBuffers {
        dinput: 0x1000_0000,
        weights: 0x2000_0000,
        doutput: 0x3000_0000,
    }
}

fn launch_count(runtime: &SimulatedRuntime) -> usize {
    runtime
        .calls()
        .iter()
        .filter(|call| matches!(call, SimCall::Launch { .. }))
        .count()
}

#[test]
fn rejected_tunable_touches_no_device_state() {
    let runtime = SimulatedRuntime::new();
    let driver = BwdDataDriver::new().with_runs(1, 3);

    // n = 4 is not divisible by gemm_n_per_block/nxb = 8 for this tunable.
    let result = driver
        .run(
            &runtime,
            &stride2_3x3(),
            &TunableConfig::xdlops_128x128x16(),
            buffers(),
        )
        .unwrap();

    assert_eq!(result.return_code, -1);
    assert!(result.is_rejected());
    assert!(runtime.calls().is_empty());
}

#[test]
fn per_sub_gemm_mode_launches_each_non_empty_sub_gemm() {
    let runtime = SimulatedRuntime::new();
    let driver = BwdDataDriver::new().with_runs(2, 4);
    let desc = stride2_3x3();
    let tunable = TunableConfig::mac_64x64x16();

    let result = driver.run(&runtime, &desc, &tunable, buffers()).unwrap();

    assert_eq!(result.return_code, 0);
    assert!(result.duration_ms > 0.0);
    assert_eq!(result.kernel_name, tunable.kernel_name());
    assert!(result.gflops(&desc) > 0.0);

    // 3x3 filter covers the stride-2 grid, so no zero-fill pre-pass; all
    // four sub-GEMMs are non-empty; 2 warmup + 4 measured passes.
    let calls = runtime.calls();
    assert!(calls
        .iter()
        .all(|call| matches!(call, SimCall::Launch { .. })));
    assert_eq!(calls.len(), (2 + 4) * 4);
    assert!(calls.iter().all(|call| match call {
        SimCall::Launch { args_len, .. } => *args_len == BwdKernelArgs::SIZE,
        _ => false,
    }));
}

#[test]
fn multihead_mode_folds_into_one_launch_per_pass() {
    let runtime = SimulatedRuntime::new();
    let driver = BwdDataDriver::new().with_runs(1, 3);
    let desc = stride2_3x3();
    let tunable = TunableConfig::xdlops_64x64x16_multihead();

    let result = driver.run(&runtime, &desc, &tunable, buffers()).unwrap();
    assert_eq!(result.return_code, 0);
    assert_eq!(launch_count(&runtime), 1 + 3);
}

#[test]
fn upsampling_shape_zero_fills_before_every_accumulation_pass() {
    let runtime = SimulatedRuntime::new();
    let driver = BwdDataDriver::new().with_runs(1, 3);
    // 1x1 filter under stride 2: filter < stride forces the pre-pass, and
    // only the (0, 0) sublattice survives.
    let desc = ConvDescriptor {
        y: 1,
        x: 1,
        pad_h: 0,
        pad_w: 0,
        ..stride2_3x3()
    };
    let tunable = TunableConfig::mac_64x64x16();

    let result = driver.run(&runtime, &desc, &tunable, buffers()).unwrap();
    assert_eq!(result.return_code, 0);

    let calls = runtime.calls();
    // Each pass: one zero-fill then one launch, (1 warmup + 3 measured).
    assert_eq!(calls.len(), (1 + 3) * 2);
    for pass in calls.chunks(2) {
        assert!(
            matches!(pass[0], SimCall::ZeroFill { .. }),
            "zero-fill must precede the accumulating launch"
        );
        assert!(matches!(pass[1], SimCall::Launch { .. }));
    }
    let expected_bytes =
        desc.dgrad_len() * tunable.precision.data_byte() as usize;
    assert!(calls.iter().any(|call| matches!(
        call,
        SimCall::ZeroFill { addr: 0x1000_0000, len } if *len == expected_bytes
    )));
}

#[test]
fn clear_kernel_strategy_replaces_the_memset() {
    let runtime = SimulatedRuntime::new();
    let driver = BwdDataDriver::new()
        .with_runs(1, 3)
        .with_zero_fill(ZeroFillMode::ClearKernel);
    let desc = ConvDescriptor {
        y: 1,
        x: 1,
        pad_h: 0,
        pad_w: 0,
        ..stride2_3x3()
    };

    let result = driver
        .run(&runtime, &desc, &TunableConfig::mac_64x64x16(), buffers())
        .unwrap();
    assert_eq!(result.return_code, 0);

    let calls = runtime.calls();
    assert!(calls
        .iter()
        .all(|call| matches!(call, SimCall::Launch { .. })));
    let clear_launches = calls
        .iter()
        .filter(|call| match call {
            SimCall::Launch { kernel, dims, .. } => {
                kernel.starts_with("igemm_upsampling_clear_") && dims.block == 256
            }
            _ => false,
        })
        .count();
    assert_eq!(clear_launches, 1 + 3);
}

#[test]
fn unknown_kernel_is_a_fatal_runtime_error() {
    // A runtime with an empty module table cannot resolve the kernel.
    let runtime = SimulatedRuntime::with_kernels(Vec::new());
    let driver = BwdDataDriver::new().with_runs(1, 3);

    let err = driver
        .run(
            &runtime,
            &stride2_3x3(),
            &TunableConfig::mac_64x64x16(),
            buffers(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("kernel not found"));
}

#[test]
fn too_few_repeats_are_refused_up_front() {
    let runtime = SimulatedRuntime::new();
    let driver = BwdDataDriver::new().with_runs(0, 2);

    let err = driver
        .run(
            &runtime,
            &stride2_3x3(),
            &TunableConfig::mac_64x64x16(),
            buffers(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("at least 3 repeats"));
    assert!(runtime.calls().is_empty());
}

#[test]
fn grid_size_matches_the_block_decomposition() {
    let desc = stride2_3x3();
    let tunable = TunableConfig::mac_64x64x16();
    let geom = resolve(&desc, &tunable);
    // gemm_m = 64, gemm_n = 256: 1 * ceil(64/64) * ceil(256/64) = 4 blocks.
    assert_eq!(geom.grid_size(&desc, &tunable).unwrap(), 4);

    let runtime = SimulatedRuntime::new();
    let driver = BwdDataDriver::new().with_runs(1, 3);
    driver.run(&runtime, &desc, &tunable, buffers()).unwrap();
    assert!(runtime.calls().iter().all(|call| match call {
        SimCall::Launch { dims, .. } => dims.grid == 4 && dims.block == 256,
        _ => false,
    }));
}
