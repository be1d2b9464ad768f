use faer::{Mat, MatRef};
use rand::rngs::StdRng;

use super::StepHistory;
use crate::{
    Context, Initialization, Layer, LayerConfig, Module, NnError, Result,
    core::{ParamSlot, param_buffer::layout},
    utils::{check_shape, copy_rows_into, rows_of, shape, zip_map},
};

/// How a `Merge` combines the outputs of its branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Stack branch outputs along the feature axis.
    Concat,
    /// Elementwise sum.
    Add,
    /// Elementwise product.
    Multiply,
}

#[derive(Debug, Clone, Default)]
struct BranchRecord {
    heights: Vec<usize>,
    /// Branch outputs, only retained for `MergeKind::Multiply`.
    outputs: Vec<Mat<f64>>,
}

/// Fan-out layer: every branch consumes the same input, their outputs are
/// combined according to `MergeKind`.
///
/// The merge owns its branches. Their parameters are laid out back to back
/// inside the merge's own slot.
#[derive(Debug, Clone)]
pub struct Merge {
    kind: MergeKind,
    branches: Vec<Layer>,
    history: StepHistory<BranchRecord>,
    /// Output gradients routed to each branch by the last backward call.
    branch_grads: Vec<Mat<f64>>,
}

impl Merge {
    pub fn new(kind: MergeKind) -> Self {
        Self {
            kind,
            branches: Vec::new(),
            history: StepHistory::default(),
            branch_grads: Vec::new(),
        }
    }

    pub fn concat() -> Self {
        Self::new(MergeKind::Concat)
    }

    pub fn add_merge() -> Self {
        Self::new(MergeKind::Add)
    }

    pub fn multiply_merge() -> Self {
        Self::new(MergeKind::Multiply)
    }

    pub fn with_branches(kind: MergeKind, branches: Vec<Layer>) -> Result<Self> {
        if branches.is_empty() {
            return Err(NnError::invalid("merge layer needs at least one branch"));
        }
        Ok(Self {
            branches,
            ..Self::new(kind)
        })
    }

    /// Adds a branch. Must happen before the owning network is reset.
    pub fn push(&mut self, branch: impl Into<Layer>) {
        self.branches.push(branch.into());
    }

    pub fn kind(&self) -> MergeKind {
        self.kind
    }

    pub fn branches(&self) -> &[Layer] {
        &self.branches
    }

    fn slots(&self) -> Box<[ParamSlot]> {
        layout(self.branches.iter().map(Module::n_params)).0
    }

    fn ensure_branches(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(NnError::invalid(format!("{} has no branches", self.name())));
        }
        Ok(())
    }

    fn combine(&self, outputs: &[Mat<f64>]) -> Result<Mat<f64>> {
        let first = outputs[0].as_ref();
        match self.kind {
            MergeKind::Concat => {
                let height = outputs.iter().map(|o| o.nrows()).sum();
                let mut combined = Mat::zeros(height, first.ncols());
                let mut row = 0;
                for output in outputs {
                    check_shape(self.name(), output.as_ref(), (output.nrows(), first.ncols()))?;
                    copy_rows_into(&mut combined, row, output.as_ref());
                    row += output.nrows();
                }
                Ok(combined)
            }
            MergeKind::Add | MergeKind::Multiply => {
                let mut combined = first.to_owned();
                for output in &outputs[1..] {
                    check_shape(self.name(), output.as_ref(), shape(first))?;
                    combined = match self.kind {
                        MergeKind::Add => zip_map(combined.as_ref(), output.as_ref(), |a, b| a + b),
                        _ => zip_map(combined.as_ref(), output.as_ref(), |a, b| a * b),
                    };
                }
                Ok(combined)
            }
        }
    }

    /// Output gradient seen by branch `b`.
    fn route(&self, record: &BranchRecord, b: usize, output_grad: MatRef<'_, f64>) -> Mat<f64> {
        match self.kind {
            MergeKind::Add => output_grad.to_owned(),
            MergeKind::Multiply => {
                let mut routed = output_grad.to_owned();
                for (k, other) in record.outputs.iter().enumerate() {
                    if k != b {
                        routed = zip_map(routed.as_ref(), other.as_ref(), |g, o| g * o);
                    }
                }
                routed
            }
            MergeKind::Concat => {
                let start = record.heights[..b].iter().sum();
                rows_of(output_grad, start, record.heights[b])
            }
        }
    }
}

impl Module for Merge {
    fn name(&self) -> &'static str {
        match self.kind {
            MergeKind::Concat => "concat",
            MergeKind::Add => "add_merge",
            MergeKind::Multiply => "multiply_merge",
        }
    }

    fn n_params(&self) -> usize {
        self.branches.iter().map(Module::n_params).sum()
    }

    fn reset(
        &mut self,
        params: &mut [f64],
        init: &Initialization,
        rng: &mut StdRng,
    ) -> Result<()> {
        self.ensure_branches()?;
        let slots = self.slots();
        for (branch, slot) in self.branches.iter_mut().zip(&slots) {
            branch.reset(slot.of_mut(params), init, rng)?;
        }
        Ok(())
    }

    fn forward(
        &mut self,
        ctx: &mut Context,
        params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        self.ensure_branches()?;
        let slots = self.slots();
        let outputs = self
            .branches
            .iter_mut()
            .zip(&slots)
            .map(|(branch, slot)| branch.forward(ctx, slot.of(params), input))
            .collect::<Result<Vec<_>>>()?;
        let combined = self.combine(&outputs)?;
        let heights = outputs.iter().map(|o| o.nrows()).collect();
        let outputs = match self.kind {
            MergeKind::Multiply => outputs,
            _ => Vec::new(),
        };
        self.history.push(BranchRecord { heights, outputs });
        Ok(combined)
    }

    fn backward(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let Some(record) = self.history.activate_latest().cloned() else {
            return Err(NnError::invalid(format!(
                "{}: backward without a matching forward",
                self.name()
            )));
        };
        let height = match self.kind {
            MergeKind::Concat => record.heights.iter().sum(),
            _ => record.heights[0],
        };
        let name = self.name();
        check_shape(name, output_grad, (height, output_grad.ncols()))?;
        let slots = self.slots();
        self.branch_grads = (0..self.branches.len())
            .map(|b| self.route(&record, b, output_grad))
            .collect();
        let mut delta = Mat::zeros(input.nrows(), input.ncols());
        for ((branch, slot), routed) in self.branches.iter_mut().zip(&slots).zip(&self.branch_grads) {
            let branch_delta = branch.backward(slot.of(params), input, routed.as_ref())?;
            check_shape(name, branch_delta.as_ref(), shape(input))?;
            delta += &branch_delta;
        }
        Ok(delta)
    }

    fn gradient(
        &mut self,
        params: &[f64],
        input: MatRef<'_, f64>,
        _output_grad: MatRef<'_, f64>,
        grad: &mut [f64],
    ) -> Result<()> {
        let slots = self.slots();
        for ((branch, slot), routed) in self.branches.iter_mut().zip(&slots).zip(&self.branch_grads) {
            branch.gradient(slot.of(params), input, routed.as_ref(), slot.of_mut(grad))?;
        }
        Ok(())
    }

    fn begin_sequence(&mut self) {
        self.history.clear();
        self.branch_grads.clear();
        for branch in &mut self.branches {
            branch.begin_sequence();
        }
    }

    fn config(&self) -> LayerConfig {
        let branches = self.branches.iter().map(Module::config).collect();
        match self.kind {
            MergeKind::Concat => LayerConfig::Concat { branches },
            MergeKind::Add => LayerConfig::AddMerge { branches },
            MergeKind::Multiply => LayerConfig::MultiplyMerge { branches },
        }
    }
}

#[cfg(test)]
mod tests {
    use faer::mat;

    use super::*;
    use crate::{Activation, DynActivationFunction, Linear, activation_functions::Identity};

    fn identity() -> Activation {
        Activation::new(DynActivationFunction::new(Identity))
    }

    #[test]
    fn multiply_merge_applies_the_product_rule() {
        let mut merge = Merge::multiply_merge();
        merge.push(identity());
        merge.push(crate::MultiplyConstant::new(3.0));
        let mut ctx = Context::training(0);
        let x = mat![[2.0], [-1.0]];
        let output = merge.forward(&mut ctx, &[], x.as_ref()).unwrap();
        // 3 * x^2
        assert_eq!(output[(0, 0)], 12.0);
        let dy = mat![[1.0], [1.0]];
        let delta = merge.backward(&[], x.as_ref(), dy.as_ref()).unwrap();
        // 6 * x
        assert_eq!(delta[(0, 0)], 12.0);
        assert_eq!(delta[(1, 0)], -6.0);
    }

    #[test]
    fn concat_of_zero_input_is_the_biases() {
        let mut merge = Merge::concat();
        merge.push(Linear::new(10, 10));
        merge.push(Linear::new(10, 10));
        let params: Vec<f64> = (0..merge.n_params()).map(|i| (i % 7) as f64 * 0.1).collect();
        let mut ctx = Context::training(0);
        let input = Mat::zeros(10, 1);
        let output = merge.forward(&mut ctx, &params, input.as_ref()).unwrap();
        assert_eq!(output.nrows(), 20);
        let bias_a: f64 = params[100..110].iter().sum();
        let bias_b: f64 = params[210..220].iter().sum();
        let top: f64 = (0..10).map(|i| output[(i, 0)]).sum();
        let bottom: f64 = (10..20).map(|i| output[(i, 0)]).sum();
        approx::assert_relative_eq!(top, bias_a, max_relative = 1e-12);
        approx::assert_relative_eq!(bottom, bias_b, max_relative = 1e-12);

        let delta = merge
            .backward(&params, input.as_ref(), Mat::<f64>::zeros(20, 1).as_ref())
            .unwrap();
        assert_eq!(delta.sum(), 0.0);
    }

    #[test]
    fn mismatched_branch_shapes_abort_the_pass() {
        let mut merge = Merge::add_merge();
        merge.push(identity());
        merge.push(crate::Constant::new(3, 1.0));
        let mut ctx = Context::training(0);
        let result = merge.forward(&mut ctx, &[], Mat::<f64>::zeros(2, 1).as_ref());
        assert!(matches!(result, Err(NnError::ShapeMismatch { .. })));
    }

    #[test]
    fn empty_merge_is_invalid() {
        assert!(Merge::with_branches(MergeKind::Add, Vec::new()).is_err());
        let mut ctx = Context::training(0);
        let result = Merge::concat().forward(&mut ctx, &[], Mat::<f64>::zeros(2, 1).as_ref());
        assert!(matches!(result, Err(NnError::InvalidConfiguration { .. })));
    }
}
