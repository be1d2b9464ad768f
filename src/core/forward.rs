use faer::MatRef;

use crate::{
    Context, Layer, Module, Result,
    core::{ParamSlot, ResultBuffer},
};

/// Runs `input` through `layers` in order, retaining every intermediate
/// output in `result_buffer`.
///
/// `slots[u]` addresses layer `u` inside `params`.
pub fn forward(
    layers: &mut [Layer],
    slots: &[ParamSlot],
    params: &[f64],
    ctx: &mut Context,
    input: MatRef<'_, f64>,
    result_buffer: &mut ResultBuffer,
) -> Result<()> {
    debug_assert_eq!(layers.len(), slots.len());
    result_buffer.begin(input);
    for (u, (layer, slot)) in layers.iter_mut().zip(slots).enumerate() {
        let a_prev = result_buffer.input_of(u);
        let a = layer.forward(ctx, slot.of(params), a_prev)?;
        result_buffer.push(a);
    }
    Ok(())
}
