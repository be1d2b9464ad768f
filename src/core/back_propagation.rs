use faer::MatRef;

use crate::{
    Layer, Module, Result,
    core::{DerivBuffer, ParamSlot, ResultBuffer},
};

/// Propagates `seed` (the loss gradient at the pipeline output) back through
/// `layers` in reverse order.
///
/// `result_buffer` must hold the results of the matching `forward` call.
pub fn backward(
    layers: &mut [Layer],
    slots: &[ParamSlot],
    params: &[f64],
    result_buffer: &ResultBuffer,
    seed: MatRef<'_, f64>,
    deriv_buffer: &mut DerivBuffer,
) -> Result<()> {
    debug_assert_eq!(result_buffer.n_layers(), layers.len());
    deriv_buffer.begin(layers.len(), seed);
    for u in (0..layers.len()).rev() {
        let a_prev = result_buffer.input_of(u);
        let da = deriv_buffer.output_grad(u);
        let da_prev = layers[u].backward(slots[u].of(params), a_prev, da)?;
        deriv_buffer.set_input_grad(u, da_prev);
    }
    Ok(())
}

/// Adds every layer's parameter gradient into its slot of `grad`.
///
/// Must follow the matching `backward` call.
pub fn accumulate_gradient(
    layers: &mut [Layer],
    slots: &[ParamSlot],
    params: &[f64],
    result_buffer: &ResultBuffer,
    deriv_buffer: &DerivBuffer,
    grad: &mut [f64],
) -> Result<()> {
    debug_assert_eq!(params.len(), grad.len());
    for (u, (layer, slot)) in layers.iter_mut().zip(slots).enumerate() {
        layer.gradient(
            slot.of(params),
            result_buffer.input_of(u),
            deriv_buffer.output_grad(u),
            slot.of_mut(grad),
        )?;
    }
    Ok(())
}
