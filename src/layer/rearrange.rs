//! Parameter-free layers that treat their input as one matrix rather than a
//! batch of samples.

use faer::{Mat, MatRef};

use crate::{
    Context, LayerConfig, Module, NnError, Result,
    utils::{check_shape, shape},
};

/// Keeps column `index` of the input, or only its first `elements` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Select {
    index: usize,
    elements: Option<usize>,
}

impl Select {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            elements: None,
        }
    }

    pub fn with_elements(index: usize, elements: usize) -> Self {
        Self {
            index,
            elements: Some(elements),
        }
    }

    fn check_input(&self, input: MatRef<'_, f64>) -> Result<usize> {
        let rows = self.elements.unwrap_or(input.nrows());
        if self.index >= input.ncols() || rows > input.nrows() {
            return Err(NnError::ShapeMismatch {
                layer: "select",
                expected: (rows.max(input.nrows()), self.index + 1),
                found: shape(input),
            });
        }
        Ok(rows)
    }
}

impl Module for Select {
    fn name(&self) -> &'static str {
        "select"
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let rows = self.check_input(input)?;
        Ok(Mat::from_fn(rows, 1, |i, _| input[(i, self.index)]))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let rows = self.check_input(input)?;
        check_shape(self.name(), output_grad, (rows, 1))?;
        let mut delta = Mat::zeros(input.nrows(), input.ncols());
        for i in 0..rows {
            delta[(i, self.index)] = output_grad[(i, 0)];
        }
        Ok(delta)
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Select {
            index: self.index,
            elements: self.elements,
        }
    }
}

/// Flattens the whole input, column after column, into a single column.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Join;

impl Module for Join {
    fn name(&self) -> &'static str {
        "join"
    }

    fn forward(
        &mut self,
        _ctx: &mut Context,
        _params: &[f64],
        input: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let rows = input.nrows();
        Ok(Mat::from_fn(rows * input.ncols(), 1, |i, _| {
            input[(i % rows, i / rows)]
        }))
    }

    fn backward(
        &mut self,
        _params: &[f64],
        input: MatRef<'_, f64>,
        output_grad: MatRef<'_, f64>,
    ) -> Result<Mat<f64>> {
        let rows = input.nrows();
        check_shape(self.name(), output_grad, (rows * input.ncols(), 1))?;
        Ok(Mat::from_fn(rows, input.ncols(), |i, j| {
            output_grad[(j * rows + i, 0)]
        }))
    }

    fn config(&self) -> LayerConfig {
        LayerConfig::Join
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 10 x 5, column `j` filled with `j`.
    fn columns() -> Mat<f64> {
        Mat::from_fn(10, 5, |_, j| j as f64)
    }

    #[test]
    fn select_keeps_one_column() {
        let input = columns();
        let mut ctx = Context::deterministic(0);

        let mut whole = Select::new(3);
        let output = whole.forward(&mut ctx, &[], input.as_ref()).unwrap();
        assert_eq!(output.sum(), 30.0);
        let delta = whole
            .backward(&[], input.as_ref(), output.as_ref())
            .unwrap();
        assert_eq!(shape(delta.as_ref()), (10, 5));
        assert_eq!(delta.sum(), 30.0);

        let mut head = Select::with_elements(3, 5);
        let output = head.forward(&mut ctx, &[], input.as_ref()).unwrap();
        assert_eq!(shape(output.as_ref()), (5, 1));
        assert_eq!(output.sum(), 15.0);
        let delta = head.backward(&[], input.as_ref(), output.as_ref()).unwrap();
        assert_eq!(delta.sum(), 15.0);
    }

    #[test]
    fn select_outside_the_input_is_a_shape_mismatch() {
        let input = columns();
        let mut ctx = Context::deterministic(0);
        for mut layer in [Select::new(5), Select::with_elements(0, 11)] {
            assert!(matches!(
                layer.forward(&mut ctx, &[], input.as_ref()),
                Err(NnError::ShapeMismatch { layer: "select", .. })
            ));
        }
    }

    #[test]
    fn join_flattens_and_restores() {
        let input = Mat::from_fn(10, 5, |i, j| (i + 10 * j) as f64);
        let mut ctx = Context::deterministic(0);
        let output = Join.forward(&mut ctx, &[], input.as_ref()).unwrap();
        assert_eq!(shape(output.as_ref()), (50, 1));
        for i in 0..50 {
            assert_eq!(output[(i, 0)], i as f64);
        }
        let delta = Join.backward(&[], input.as_ref(), output.as_ref()).unwrap();
        assert_eq!(shape(delta.as_ref()), (10, 5));
        for j in 0..5 {
            for i in 0..10 {
                assert_eq!(delta[(i, j)], input[(i, j)]);
            }
        }
    }
}
