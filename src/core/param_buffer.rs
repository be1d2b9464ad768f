use std::ops::Range;

/// Location of one layer's parameters inside a flat parameter buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParamSlot {
    pub offset: usize,
    pub len: usize,
}

impl ParamSlot {
    pub fn range(self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    pub fn of(self, buffer: &[f64]) -> &[f64] {
        &buffer[self.range()]
    }

    pub fn of_mut(self, buffer: &mut [f64]) -> &mut [f64] {
        &mut buffer[self.range()]
    }
}

/// Lays slots of the given sizes out back to back.
/// Returns the slots and the total length they cover.
pub fn layout(sizes: impl IntoIterator<Item = usize>) -> (Box<[ParamSlot]>, usize) {
    let mut offset = 0usize;
    let slots = sizes
        .into_iter()
        .map(|len| {
            let slot = ParamSlot { offset, len };
            offset += len;
            slot
        })
        .collect();
    (slots, offset)
}

/// Buffer for storing neural network parameters.
///
/// Owned by the network; every layer only knows its `ParamSlot`.
#[derive(Debug, Clone, Default)]
pub struct ParamBuffer {
    slots: Box<[ParamSlot]>,
    buffer: Box<[f64]>,
}

impl ParamBuffer {
    pub fn create(sizes: impl IntoIterator<Item = usize>) -> Self {
        let (slots, n_floats) = layout(sizes);
        Self {
            slots,
            buffer: zeroed(n_floats),
        }
    }

    /// Number of layers in the neural network.
    pub fn n_layers(&self) -> usize {
        self.slots.len()
    }

    /// Total number of parameters.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.buffer
    }

    /// Parameters of one layer.
    /// Returns `None` if `index` is out of range.
    pub fn layer(&self, index: usize) -> Option<&[f64]> {
        let slot = self.slots.get(index)?;
        Some(slot.of(&self.buffer))
    }

    /// Returns `None` if `index` is out of range.
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut [f64]> {
        let slot = *self.slots.get(index)?;
        Some(slot.of_mut(&mut self.buffer))
    }

    /// Zero the whole buffer.
    pub fn clear(&mut self) {
        bytemuck::fill_zeroes(&mut self.buffer[..]);
    }
}

/// Zero-initialized gradient or parameter storage.
pub(crate) fn zeroed(len: usize) -> Box<[f64]> {
    if len == 0 {
        Box::default()
    } else {
        bytemuck::zeroed_slice_box(len)
    }
}
