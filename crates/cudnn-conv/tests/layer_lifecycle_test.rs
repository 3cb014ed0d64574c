//! Integration tests for the convolution layer lifecycle.
//!
//! All tests run against `SimDevice`, which counts every create/release call
//! and lets failures be injected at chosen points.
//!
//! # Test Categories
//!
//! 1. Single-group and grouped configurations
//! 2. Workspace sizing and reuse across reshapes
//! 3. Degraded modes (no suitable algorithm, allocation failure)
//! 4. Setup failures and teardown safety
//! 5. Input validation

use std::sync::Arc;

use cudnn_conv::{
    AlgoPerf, Algorithm, ConvError, ConvOp, ConvolutionConfig, CudnnConvLayer, DeviceCapabilities,
    EngineConfig, LifecycleState, SimDevice, WorkspaceOutcome,
};
use cudnn_conv::algo::{BwdDataAlgo, FwdAlgo};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(
    device: &Arc<SimDevice>,
    engine: EngineConfig,
    conv: ConvolutionConfig,
) -> CudnnConvLayer<SimDevice> {
    init_tracing();
    CudnnConvLayer::new(Arc::clone(device), engine, conv).expect("layer construction")
}

// ============================================================================
// CONFIGURATIONS
// ============================================================================

#[test]
fn test_single_group_scenario() {
    let device = Arc::new(SimDevice::new());
    let free_before = device.free_memory();
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(16, 3).with_pad(1),
    );

    layer.setup(&[[8usize, 3, 32, 32]]).unwrap();
    assert_eq!(layer.context_count(), 1);

    let report = layer.reshape(&[[8usize, 3, 32, 32]]).unwrap();
    assert_eq!(report.output_shape, [8, 16, 32, 32]);
    assert_eq!(layer.output_shape(), Some([8, 16, 32, 32]));

    let plan = *layer.descriptors().expect("descriptors").plan();
    assert_eq!(plan.input.c, 3);
    assert_eq!(plan.output.c, 16);
    assert_eq!(plan.filter.in_channels, 3);
    assert_eq!(plan.filter.out_channels, 16);

    let entry = layer.algorithms().input(0).expect("one input");
    for op in ConvOp::ALL {
        let choice = entry.get(op);
        assert!(choice.found, "{} should have a selected algorithm", op);
        assert!(choice.workspace_bytes <= free_before);
    }
    assert_eq!(report.fallbacks, 0);
    assert_eq!(report.workspace_size, report.requested_workspace_bytes);
    println!("[PASS] g=1 scenario: one context, full channel counts, all ops selected");
}

#[test]
fn test_two_group_scenario() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(16, 3).with_pad(1).with_group(2),
    );

    layer.setup(&[[8usize, 4, 32, 32]]).unwrap();
    assert_eq!(layer.context_count(), 2);
    assert_eq!(layer.bias_offset(), 8);

    let report = layer.reshape(&[[8usize, 4, 32, 32]]).unwrap();
    let plan = *layer.descriptors().unwrap().plan();
    assert_eq!(plan.input.c, 2);
    assert_eq!(plan.output.c, 8);
    assert_eq!(plan.bias.map(|b| b.c), Some(8));

    let geometry = layer.group_geometry().unwrap();
    assert_eq!(geometry.bottom_offset, 2 * 32 * 32);
    assert_eq!(geometry.top_offset, 8 * 32 * 32);
    assert_eq!(geometry.weight_offset, 8 * 2 * 3 * 3);
    assert_eq!(geometry.bias_offset, 8);

    assert_eq!(report.workspace_size, report.requested_workspace_bytes * 2);
    let first = layer.workspace_region(0).unwrap();
    let second = layer.workspace_region(1).unwrap();
    assert_eq!(first.len, report.requested_workspace_bytes);
    assert_eq!(second.offset, first.offset + first.len);
    assert_eq!(second.ptr, first.ptr.offset(first.len));
    assert!(layer.workspace_region(2).is_none());
    println!("[PASS] g=2 scenario: halved channels, bias offset 8, disjoint regions");
}

#[test]
fn test_context_count_is_groups_times_streams() {
    for group in 1..=4 {
        for streams in 1..=3 {
            let device = Arc::new(SimDevice::new());
            let engine = EngineConfig {
                streams_per_group: streams,
                ..Default::default()
            };
            let mut layer = build(
                &device,
                engine,
                ConvolutionConfig::new(4 * group, 3).with_pad(1).with_group(group),
            );
            layer.setup(&[[2usize, 2 * group, 8, 8]]).unwrap();
            assert_eq!(layer.context_count(), group * streams);

            let report = layer.reshape(&[[2usize, 2 * group, 8, 8]]).unwrap();
            assert_eq!(
                report.workspace_size,
                report.requested_workspace_bytes * group * streams,
                "group={} streams={}",
                group,
                streams
            );
            assert_eq!(device.stats().handles_created, group * streams);
        }
    }
    println!("[PASS] context count and workspace size scale with group * streams");
}

#[test]
fn test_multiple_inputs_get_one_entry_each() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3));
    let dims = [[2usize, 3, 16, 16]; 3];

    layer.setup(&dims).unwrap();
    layer.reshape(&dims).unwrap();
    assert_eq!(layer.algorithms().len(), 3);
    assert_eq!(layer.descriptors().unwrap().len(), 3);
    assert_eq!(layer.algorithms().input(0), layer.algorithms().input(2));

    // fewer inputs: the table is rebuilt, not resized in place
    layer.reshape(&dims[..1]).unwrap();
    assert_eq!(layer.algorithms().len(), 1);
    assert_eq!(layer.descriptors().unwrap().len(), 1);
}

// ============================================================================
// WORKSPACE SIZING
// ============================================================================

#[test]
fn test_identical_reshape_does_not_reallocate() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(16, 3).with_pad(1),
    );
    layer.setup(&[[8usize, 3, 32, 32]]).unwrap();

    let first = layer.reshape(&[[8usize, 3, 32, 32]]).unwrap();
    let chosen = layer.algorithms().clone();
    let second = layer.reshape(&[[8usize, 3, 32, 32]]).unwrap();

    assert_eq!(layer.algorithms(), &chosen);
    assert!(matches!(first.workspace, WorkspaceOutcome::Reallocated { .. }));
    assert_eq!(second.workspace, WorkspaceOutcome::Unchanged);
    assert_eq!(first.workspace_size, second.workspace_size);
    assert_eq!(device.stats().allocations, 1);
    assert_eq!(device.stats().frees, 0);
    println!("[PASS] identical reshape leaves the workspace alone");
}

#[test]
fn test_identical_reshape_under_memory_pressure_keeps_choices() {
    let device = Arc::new(SimDevice::new());
    device.set_free_memory(400_000);
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(16, 3).with_pad(1),
    );
    layer.setup(&[[8usize, 3, 32, 32]]).unwrap();

    let first = layer.reshape(&[[8usize, 3, 32, 32]]).unwrap();
    let chosen = layer.algorithms().clone();
    let entry = chosen.input(0).unwrap();
    assert_eq!(entry.forward.algorithm, Algorithm::Forward(FwdAlgo::Fft));
    assert_eq!(entry.backward_filter.workspace_bytes, 393_216);
    assert_eq!(first.fallbacks, 0);
    // the layer's own buffer now takes most of what was free
    assert!(device.free_memory() < entry.forward.workspace_bytes);

    let second = layer.reshape(&[[8usize, 3, 32, 32]]).unwrap();
    assert_eq!(second.workspace, WorkspaceOutcome::Unchanged);
    assert_eq!(second.fallbacks, 0);
    assert_eq!(layer.algorithms(), &chosen);
    assert_eq!(device.stats().allocations, 1);
    println!("[PASS] owned workspace counts as available on repeat reshape");
}

#[test]
fn test_workspace_grows_but_never_shrinks() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3).with_pad(1));
    layer.setup(&[[4usize, 3, 32, 32]]).unwrap();

    let small = layer.reshape(&[[4usize, 3, 32, 32]]).unwrap();
    let large = layer.reshape(&[[16usize, 3, 32, 32]]).unwrap();
    assert!(large.workspace_size > small.workspace_size);
    assert!(matches!(large.workspace, WorkspaceOutcome::Reallocated { .. }));

    let back = layer.reshape(&[[4usize, 3, 32, 32]]).unwrap();
    assert_eq!(back.workspace, WorkspaceOutcome::Unchanged);
    assert_eq!(back.workspace_size, large.workspace_size);

    let stats = device.stats();
    assert_eq!(stats.allocations, 2);
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.live_buffers(), 1);
}

#[test]
fn test_ranked_choices_respect_free_memory() {
    let device = Arc::new(SimDevice::new());
    // input view: 8 * 3 * 32 * 32 * 4 bytes = 98304; FFT needs twice that
    device.set_free_memory(150_000);
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(16, 3).with_pad(1),
    );
    layer.setup(&[[8usize, 3, 32, 32]]).unwrap();
    let report = layer.reshape(&[[8usize, 3, 32, 32]]).unwrap();

    let forward = layer.algorithms().choice(0, ConvOp::Forward).unwrap();
    assert_eq!(forward.algorithm, Algorithm::Forward(FwdAlgo::ImplicitPrecompGemm));
    for entry in layer.algorithms().iter() {
        for choice in entry.iter() {
            assert!(choice.workspace_bytes < 150_000);
        }
    }
    assert!(!report.is_degraded());
}

// ============================================================================
// DEGRADED MODES
// ============================================================================

#[test]
fn test_allocation_failure_resets_to_defaults() {
    let device = Arc::new(SimDevice::new());
    device.set_alloc_limit(Some(1));
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(16, 3).with_pad(1).with_group(2),
    );
    layer.setup(&[[8usize, 4, 32, 32]]).unwrap();

    let report = layer.reshape(&[[8usize, 4, 32, 32]]).expect("degraded, not fatal");
    assert!(report.is_degraded());
    assert_eq!(report.workspace_size, 0);
    assert_eq!(report.fallbacks, 3);
    assert!(report.requested_workspace_bytes > 0, "the failed request is still reported");
    assert_eq!(layer.algorithms().max_workspace(), 0);
    assert_eq!(layer.workspace_size(), 0);
    assert_eq!(layer.state(), LifecycleState::Configured);

    for entry in layer.algorithms().iter() {
        for op in ConvOp::ALL {
            let choice = entry.get(op);
            assert_eq!(choice.algorithm, Algorithm::default_for(op));
            assert_eq!(choice.workspace_bytes, 0);
        }
    }
    for index in 0..layer.context_count() {
        assert!(layer.workspace_ptr(index).is_null());
        assert!(layer.workspace_region(index).is_none());
    }
    println!("[PASS] allocation failure: default algorithms, null regions, size 0");
}

#[test]
fn test_reshape_recovers_after_degraded_mode() {
    let device = Arc::new(SimDevice::new());
    device.set_alloc_limit(Some(1));
    let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3).with_pad(1));
    layer.setup(&[[2usize, 3, 16, 16]]).unwrap();
    assert!(layer.reshape(&[[2usize, 3, 16, 16]]).unwrap().is_degraded());

    device.set_alloc_limit(None);
    let report = layer.reshape(&[[2usize, 3, 16, 16]]).unwrap();
    assert!(matches!(report.workspace, WorkspaceOutcome::Reallocated { .. }));
    assert_eq!(report.fallbacks, 0);
    assert!(!layer.workspace_ptr(0).is_null());
}

#[test]
fn test_no_suitable_algorithm_keeps_default() {
    let device = Arc::new(SimDevice::new());
    device.script_ranked(
        ConvOp::Forward,
        vec![
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::WinogradNonfused), 0),
            AlgoPerf::failed(Algorithm::Forward(FwdAlgo::Gemm), 3),
            AlgoPerf::failed(Algorithm::Forward(FwdAlgo::Fft), 9),
        ],
    );
    device.script_ranked(
        ConvOp::BackwardData,
        vec![
            AlgoPerf::success(Algorithm::BackwardData(BwdDataAlgo::Winograd), 0),
            AlgoPerf::success(Algorithm::BackwardData(BwdDataAlgo::WinogradNonfused), 0),
        ],
    );
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(16, 3).with_pad(1),
    );
    layer.setup(&[[8usize, 3, 32, 32]]).unwrap();

    let report = layer.reshape(&[[8usize, 3, 32, 32]]).expect("not fatal");
    let entry = *layer.algorithms().input(0).unwrap();

    assert_eq!(entry.forward.algorithm, Algorithm::Forward(FwdAlgo::ImplicitGemm));
    assert_eq!(entry.forward.workspace_bytes, 0);
    assert!(!entry.forward.found);
    assert_eq!(entry.backward_data.algorithm, Algorithm::default_for(ConvOp::BackwardData));
    assert_eq!(entry.backward_data.workspace_bytes, 0);
    // fixed backward-filter fallback needs a successful forward selection
    assert!(!entry.backward_filter.found);
    assert_eq!(report.fallbacks, 3);
    assert_eq!(report.requested_workspace_bytes, 0);
    println!("[PASS] excluded or failed candidates fall back to the default algorithm");
}

#[test]
fn test_fixed_backward_filter_is_twice_forward() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3).with_pad(1));
    layer.setup(&[[2usize, 3, 16, 16]]).unwrap();
    layer.reshape(&[[2usize, 3, 16, 16]]).unwrap();

    let entry = layer.algorithms().input(0).unwrap();
    assert_eq!(
        entry.backward_filter.algorithm,
        Algorithm::BackwardFilter(cudnn_conv::algo::BwdFilterAlgo::Algo1)
    );
    assert_eq!(
        entry.backward_filter.workspace_bytes,
        entry.forward.workspace_bytes * 2
    );
    assert_eq!(device.stats().ranked_queries, 2, "forward and backward-data only");
}

#[test]
fn test_ranked_backward_filter_when_offered() {
    let caps = DeviceCapabilities {
        ranked_backward_filter: true,
        ..DeviceCapabilities::for_version(8_200)
    };
    let device = Arc::new(SimDevice::with_capabilities(caps));
    let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3).with_pad(1));
    layer.setup(&[[2usize, 3, 16, 16]]).unwrap();
    layer.reshape(&[[2usize, 3, 16, 16]]).unwrap();

    let entry = layer.algorithms().input(0).unwrap();
    assert!(entry.backward_filter.found);
    assert!(!entry.backward_filter.algorithm.is_known_unstable());
    assert_eq!(device.stats().ranked_queries, 3);
}

#[test]
fn test_legacy_device_uses_workspace_limit() {
    let device = Arc::new(SimDevice::legacy());
    let engine = EngineConfig {
        workspace_limit_bytes: 16 * 1024,
        ..Default::default()
    };
    let mut layer = build(&device, engine, ConvolutionConfig::new(16, 3).with_pad(1));
    assert_eq!(layer.strategy_name(), "workspace-limit");

    layer.setup(&[[8usize, 3, 32, 32]]).unwrap();
    let report = layer.reshape(&[[8usize, 3, 32, 32]]).unwrap();
    assert!(report.requested_workspace_bytes <= 16 * 1024);
    assert_eq!(device.stats().memory_queries, 0);
    assert_eq!(device.stats().ranked_queries, 0);
}

// ============================================================================
// SETUP FAILURE AND TEARDOWN
// ============================================================================

#[test]
fn test_teardown_without_setup_releases_nothing() {
    let device = Arc::new(SimDevice::new());
    {
        let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3));
        layer.teardown();
        assert_eq!(layer.state(), LifecycleState::Uninitialized);
    }
    assert_eq!(device.stats().release_calls(), 0);
    println!("[PASS] teardown before setup makes zero release calls");
}

#[test]
fn test_partial_setup_failure_cleans_up() {
    let device = Arc::new(SimDevice::new());
    device.fail_handle_creation_at(Some(1));
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(12, 3).with_group(3),
    );

    let err = layer.setup(&[[1usize, 3, 8, 8]]).unwrap_err();
    assert!(matches!(err, ConvError::ContextCreation { index: 1, .. }));
    assert_eq!(layer.state(), LifecycleState::Uninitialized);
    assert_eq!(layer.context_count(), 0);

    let stats = device.stats();
    assert_eq!(stats.live_streams(), 0);
    assert_eq!(stats.live_handles(), 0);

    let releases = stats.release_calls();
    drop(layer);
    assert_eq!(device.stats().release_calls(), releases, "drop after failed setup is a no-op");
    println!("[PASS] failed setup leaves nothing live and drop is safe");
}

#[test]
fn test_teardown_releases_everything_once() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(16, 3).with_pad(1).with_group(2),
    );
    layer.setup(&[[4usize, 4, 16, 16]; 2]).unwrap();
    layer.reshape(&[[4usize, 4, 16, 16]; 2]).unwrap();

    layer.teardown();
    let stats = device.stats();
    assert_eq!(stats.live_streams(), 0);
    assert_eq!(stats.live_handles(), 0);
    assert_eq!(stats.live_descriptors(), 0);
    assert_eq!(stats.live_buffers(), 0);

    let releases = stats.release_calls();
    layer.teardown();
    drop(layer);
    assert_eq!(device.stats().release_calls(), releases);
}

// ============================================================================
// INPUT VALIDATION
// ============================================================================

#[test]
fn test_rejects_non_2d_inputs() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3));

    let err = layer.setup(&[vec![1usize, 3, 8, 8, 8]]).unwrap_err();
    assert!(matches!(err, ConvError::UnsupportedSpatialRank { axes: 3 }));
    let err = layer.setup(&[vec![1usize, 3, 8]]).unwrap_err();
    assert!(matches!(err, ConvError::UnsupportedSpatialRank { axes: 1 }));
    assert_eq!(device.stats().streams_created, 0);
}

#[test]
fn test_rejects_indivisible_channels_at_setup() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(
        &device,
        EngineConfig::default(),
        ConvolutionConfig::new(8, 3).with_group(2),
    );
    let err = layer.setup(&[[1usize, 3, 8, 8]]).unwrap_err();
    assert!(matches!(err, ConvError::GroupDivisibility { .. }));
    assert!(err.is_configuration());
}

#[test]
fn test_descriptor_failure_is_fatal() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3));
    layer.setup(&[[1usize, 3, 8, 8]]).unwrap();

    device.fail_descriptor_creation(true);
    let err = layer.reshape(&[[1usize, 3, 8, 8]]).unwrap_err();
    assert!(matches!(err, ConvError::DescriptorCreation(_)));
    assert!(!err.is_recoverable());
    assert_eq!(device.stats().live_descriptors(), 0);
}

#[test]
fn test_descriptor_failure_midway_leaks_nothing() {
    let device = Arc::new(SimDevice::new());
    let mut layer = build(&device, EngineConfig::default(), ConvolutionConfig::new(8, 3));
    layer.setup(&[[1usize, 3, 8, 8]]).unwrap();
    layer.reshape(&[[1usize, 3, 8, 8]; 2]).unwrap();
    let created = device.stats().descriptors_created;

    // second reshape: filter and the first input's three succeed
    device.fail_descriptor_creation_at(Some(created + 4));
    let err = layer.reshape(&[[1usize, 3, 8, 8]; 2]).unwrap_err();
    assert!(matches!(err, ConvError::DescriptorCreation(_)));
    assert!(layer.descriptors().is_none());
    assert_eq!(device.stats().live_descriptors(), 0);
    println!("[PASS] descriptor failure mid-rebuild releases old and partial sets");
}
