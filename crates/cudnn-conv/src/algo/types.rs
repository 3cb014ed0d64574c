//! Algorithm identifiers, query results and per-input choices.
//!
//! Discriminants match the cuDNN enumerators so they can cross the FFI
//! boundary unchanged.

use std::fmt;

/// The three logical convolution operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvOp {
    Forward,
    BackwardFilter,
    BackwardData,
}

impl ConvOp {
    pub const ALL: [ConvOp; 3] = [ConvOp::Forward, ConvOp::BackwardFilter, ConvOp::BackwardData];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConvOp::Forward => "forward",
            ConvOp::BackwardFilter => "backward-filter",
            ConvOp::BackwardData => "backward-data",
        }
    }
}

impl fmt::Display for ConvOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `cudnnConvolutionFwdAlgo_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FwdAlgo {
    #[default]
    ImplicitGemm = 0,
    ImplicitPrecompGemm = 1,
    Gemm = 2,
    Direct = 3,
    Fft = 4,
    FftTiling = 5,
    Winograd = 6,
    WinogradNonfused = 7,
}

/// `cudnnConvolutionBwdFilterAlgo_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BwdFilterAlgo {
    #[default]
    Algo0 = 0,
    Algo1 = 1,
    Fft = 2,
    Algo3 = 3,
    Winograd = 4,
    WinogradNonfused = 5,
    FftTiling = 6,
}

/// `cudnnConvolutionBwdDataAlgo_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BwdDataAlgo {
    #[default]
    Algo0 = 0,
    Algo1 = 1,
    Fft = 2,
    FftTiling = 3,
    Winograd = 4,
    WinogradNonfused = 5,
}

impl FwdAlgo {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use FwdAlgo::*;
        [ImplicitGemm, ImplicitPrecompGemm, Gemm, Direct, Fft, FftTiling, Winograd, WinogradNonfused]
            .into_iter()
            .find(|a| *a as u32 == raw)
    }
}

impl BwdFilterAlgo {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use BwdFilterAlgo::*;
        [Algo0, Algo1, Fft, Algo3, Winograd, WinogradNonfused, FftTiling]
            .into_iter()
            .find(|a| *a as u32 == raw)
    }
}

impl BwdDataAlgo {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use BwdDataAlgo::*;
        [Algo0, Algo1, Fft, FftTiling, Winograd, WinogradNonfused]
            .into_iter()
            .find(|a| *a as u32 == raw)
    }
}

/// An algorithm for one specific operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Forward(FwdAlgo),
    BackwardFilter(BwdFilterAlgo),
    BackwardData(BwdDataAlgo),
}

impl Algorithm {
    /// The zero-index enumerator for `op`; needs no workspace.
    pub fn default_for(op: ConvOp) -> Self {
        match op {
            ConvOp::Forward => Algorithm::Forward(FwdAlgo::default()),
            ConvOp::BackwardFilter => Algorithm::BackwardFilter(BwdFilterAlgo::default()),
            ConvOp::BackwardData => Algorithm::BackwardData(BwdDataAlgo::default()),
        }
    }

    pub fn from_raw(op: ConvOp, raw: u32) -> Option<Self> {
        match op {
            ConvOp::Forward => FwdAlgo::from_raw(raw).map(Algorithm::Forward),
            ConvOp::BackwardFilter => BwdFilterAlgo::from_raw(raw).map(Algorithm::BackwardFilter),
            ConvOp::BackwardData => BwdDataAlgo::from_raw(raw).map(Algorithm::BackwardData),
        }
    }

    pub fn op(&self) -> ConvOp {
        match self {
            Algorithm::Forward(_) => ConvOp::Forward,
            Algorithm::BackwardFilter(_) => ConvOp::BackwardFilter,
            Algorithm::BackwardData(_) => ConvOp::BackwardData,
        }
    }

    /// Raw cuDNN enumerator value.
    pub fn raw(&self) -> u32 {
        match self {
            Algorithm::Forward(a) => *a as u32,
            Algorithm::BackwardFilter(a) => *a as u32,
            Algorithm::BackwardData(a) => *a as u32,
        }
    }

    /// Winograd-family variants that misbehave on current hardware and must
    /// never be accepted from a ranked query.
    pub fn is_known_unstable(&self) -> bool {
        matches!(
            self,
            Algorithm::Forward(FwdAlgo::WinogradNonfused)
                | Algorithm::BackwardFilter(BwdFilterAlgo::WinogradNonfused)
                | Algorithm::BackwardData(BwdDataAlgo::Winograd)
                | Algorithm::BackwardData(BwdDataAlgo::WinogradNonfused)
        )
    }
}

/// Status attached to a ranked candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgoStatus {
    Success,
    /// Non-zero `cudnnStatus_t`.
    Failed(i32),
}

/// One entry of a ranked algorithm query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlgoPerf {
    pub algorithm: Algorithm,
    pub status: AlgoStatus,
    /// Required workspace in bytes.
    pub memory: usize,
    /// Estimated time in milliseconds (negative when unknown).
    pub time_ms: f32,
}

impl AlgoPerf {
    pub fn success(algorithm: Algorithm, memory: usize) -> Self {
        Self {
            algorithm,
            status: AlgoStatus::Success,
            memory,
            time_ms: -1.0,
        }
    }

    pub fn failed(algorithm: Algorithm, status: i32) -> Self {
        Self {
            algorithm,
            status: AlgoStatus::Failed(status),
            memory: 0,
            time_ms: -1.0,
        }
    }
}

/// The algorithm chosen for one operation of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmChoice {
    pub algorithm: Algorithm,
    pub workspace_bytes: usize,
    /// Whether selection produced this algorithm (vs. the default).
    pub found: bool,
}

impl AlgorithmChoice {
    pub fn default_for(op: ConvOp) -> Self {
        Self {
            algorithm: Algorithm::default_for(op),
            workspace_bytes: 0,
            found: false,
        }
    }

    pub fn selected(algorithm: Algorithm, workspace_bytes: usize) -> Self {
        Self {
            algorithm,
            workspace_bytes,
            found: true,
        }
    }

    pub fn is_default(&self) -> bool {
        self.algorithm == Algorithm::default_for(self.algorithm.op()) && self.workspace_bytes == 0
    }
}

/// Choices for the three operations of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputAlgorithms {
    pub forward: AlgorithmChoice,
    pub backward_filter: AlgorithmChoice,
    pub backward_data: AlgorithmChoice,
}

impl Default for InputAlgorithms {
    fn default() -> Self {
        Self {
            forward: AlgorithmChoice::default_for(ConvOp::Forward),
            backward_filter: AlgorithmChoice::default_for(ConvOp::BackwardFilter),
            backward_data: AlgorithmChoice::default_for(ConvOp::BackwardData),
        }
    }
}

impl InputAlgorithms {
    pub fn get(&self, op: ConvOp) -> &AlgorithmChoice {
        match op {
            ConvOp::Forward => &self.forward,
            ConvOp::BackwardFilter => &self.backward_filter,
            ConvOp::BackwardData => &self.backward_data,
        }
    }

    pub fn get_mut(&mut self, op: ConvOp) -> &mut AlgorithmChoice {
        match op {
            ConvOp::Forward => &mut self.forward,
            ConvOp::BackwardFilter => &mut self.backward_filter,
            ConvOp::BackwardData => &mut self.backward_data,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlgorithmChoice> {
        [&self.forward, &self.backward_filter, &self.backward_data].into_iter()
    }
}

/// Per-input algorithm choices, rebuilt on every reshape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlgorithmTable {
    inputs: Vec<InputAlgorithms>,
}

impl AlgorithmTable {
    /// A table of `num_inputs` entries, all at their defaults.
    pub fn defaults(num_inputs: usize) -> Self {
        Self {
            inputs: vec![InputAlgorithms::default(); num_inputs],
        }
    }

    pub fn from_inputs(inputs: Vec<InputAlgorithms>) -> Self {
        Self { inputs }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn input(&self, index: usize) -> Option<&InputAlgorithms> {
        self.inputs.get(index)
    }

    pub fn choice(&self, index: usize, op: ConvOp) -> Option<&AlgorithmChoice> {
        self.inputs.get(index).map(|i| i.get(op))
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputAlgorithms> {
        self.inputs.iter()
    }

    /// Largest workspace over every operation of every input.
    pub fn max_workspace(&self) -> usize {
        self.inputs
            .iter()
            .flat_map(|i| i.iter())
            .map(|c| c.workspace_bytes)
            .max()
            .unwrap_or(0)
    }

    /// Number of operations that fell back to the default algorithm.
    pub fn fallback_count(&self) -> usize {
        self.inputs
            .iter()
            .flat_map(|i| i.iter())
            .filter(|c| !c.found)
            .count()
    }

    /// Force every choice back to its zero-workspace default.
    pub fn reset_to_defaults(&mut self) {
        for entry in &mut self.inputs {
            *entry = InputAlgorithms::default();
        }
    }
}
