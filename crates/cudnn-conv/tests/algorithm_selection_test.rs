//! Integration tests for the two selection strategies.
//!
//! Descriptors are built through `DescriptorSet` exactly as a reshape would,
//! then handed to each strategy directly.

use cudnn_conv::algo::{strategy_for, BwdFilterAlgo, FwdAlgo};
use cudnn_conv::{
    AlgoPerf, Algorithm, ConvError, ConvOp, ConvolutionConfig, DescriptorPlan, DescriptorSet,
    DeviceCapabilities, DnnDevice, EngineConfig, InputShape, RankedCandidateStrategy,
    SelectionPolicy, SelectionStrategy, SimDevice, WorkspaceLimitStrategy,
};

fn descriptors(device: &SimDevice, inputs: usize) -> DescriptorSet<SimDevice> {
    let conv = ConvolutionConfig::new(16, 3).with_pad(1);
    let plan = DescriptorPlan::new(&conv, &InputShape::new(8, 3, 32, 32), inputs).unwrap();
    DescriptorSet::build(device, plan).unwrap()
}

// ============================================================================
// STRATEGY RESOLUTION
// ============================================================================

#[test]
fn test_strategy_resolution_by_tier() {
    let auto = EngineConfig::default();
    let cases = [
        (6_021, "workspace-limit"),
        (7_605, "workspace-limit"),
        (8_200, "ranked"),
    ];
    for (version, expected) in cases {
        let caps = DeviceCapabilities::for_version(version);
        let strategy = strategy_for::<SimDevice>(&auto, &caps).unwrap();
        assert_eq!(strategy.name(), expected, "cuDNN {}", version);
    }

    let forced = EngineConfig {
        selection: SelectionPolicy::WorkspaceLimit,
        ..Default::default()
    };
    let err = strategy_for::<SimDevice>(&forced, &DeviceCapabilities::for_version(8_200)).unwrap_err();
    assert!(matches!(err, ConvError::Unsupported(_)));
    println!("[PASS] strategy follows policy and capability tier");
}

// ============================================================================
// RANKED STRATEGY
// ============================================================================

#[test]
fn test_ranked_reads_free_memory_once_per_select() {
    let device = SimDevice::new();
    let stream = device.create_stream().unwrap();
    let handle = device.create_handle(&stream).unwrap();
    let set = descriptors(&device, 3);

    let strategy = RankedCandidateStrategy::new(4, 2, false);
    let table = strategy.select(&device, &handle, &set.queries(), 0).unwrap();

    assert_eq!(table.len(), 3);
    let stats = device.stats();
    assert_eq!(stats.memory_queries, 1);
    assert_eq!(stats.ranked_queries, 6);
    assert_eq!(stats.limit_queries, 0);
}

#[test]
fn test_ranked_walks_past_rejected_candidates() {
    let device = SimDevice::new();
    let stream = device.create_stream().unwrap();
    let handle = device.create_handle(&stream).unwrap();
    let set = descriptors(&device, 1);
    device.set_free_memory(10_000);

    device.script_ranked(
        ConvOp::Forward,
        vec![
            AlgoPerf::failed(Algorithm::Forward(FwdAlgo::Fft), 9),
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::WinogradNonfused), 16),
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::Gemm), 10_000),
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::ImplicitPrecompGemm), 9_999),
        ],
    );

    let strategy = RankedCandidateStrategy::new(4, 2, false);
    let table = strategy.select(&device, &handle, &set.queries(), 0).unwrap();
    let forward = table.choice(0, ConvOp::Forward).unwrap();
    assert_eq!(forward.algorithm, Algorithm::Forward(FwdAlgo::ImplicitPrecompGemm));
    assert_eq!(forward.workspace_bytes, 9_999);

    let backward_filter = table.choice(0, ConvOp::BackwardFilter).unwrap();
    assert_eq!(backward_filter.algorithm, Algorithm::BackwardFilter(BwdFilterAlgo::Algo1));
    assert_eq!(backward_filter.workspace_bytes, 19_998);
    println!("[PASS] ranked walk skips failed, unstable and too-large candidates");
}

#[test]
fn test_ranked_honours_candidate_count() {
    let device = SimDevice::new();
    let stream = device.create_stream().unwrap();
    let handle = device.create_handle(&stream).unwrap();
    let set = descriptors(&device, 1);

    // the only acceptable candidate is third; asking for two hides it
    device.script_ranked(
        ConvOp::Forward,
        vec![
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::WinogradNonfused), 0),
            AlgoPerf::failed(Algorithm::Forward(FwdAlgo::Direct), 9),
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::Gemm), 64),
        ],
    );
    let narrow = RankedCandidateStrategy::new(2, 2, false);
    assert_eq!(narrow.max_candidates(), 2);
    let table = narrow.select(&device, &handle, &set.queries(), 0).unwrap();
    assert!(!table.choice(0, ConvOp::Forward).unwrap().found);

    let wide = RankedCandidateStrategy::new(3, 2, false);
    let table = wide.select(&device, &handle, &set.queries(), 0).unwrap();
    assert_eq!(
        table.choice(0, ConvOp::Forward).unwrap().algorithm,
        Algorithm::Forward(FwdAlgo::Gemm)
    );

    // back to the device's own ranking
    device.clear_scripts();
    let table = narrow.select(&device, &handle, &set.queries(), 0).unwrap();
    assert_eq!(
        table.choice(0, ConvOp::Forward).unwrap().algorithm,
        Algorithm::Forward(FwdAlgo::Fft)
    );
}

// ============================================================================
// WORKSPACE-LIMIT STRATEGY
// ============================================================================

#[test]
fn test_limit_strategy_tracks_the_ceiling() {
    let device = SimDevice::legacy();
    let stream = device.create_stream().unwrap();
    let handle = device.create_handle(&stream).unwrap();
    let set = descriptors(&device, 1);

    let mut previous = 0;
    for limit in [0, 16 * 1024, 64 * 1024, 1 << 20] {
        let strategy = WorkspaceLimitStrategy::new(limit);
        let table = strategy.select(&device, &handle, &set.queries(), 0).unwrap();
        let max = table.max_workspace();
        assert!(max <= limit, "limit {} gave {}", limit, max);
        assert!(max >= previous);
        previous = max;
    }
    println!("[PASS] workspace-limit selections stay under each ceiling");
}
