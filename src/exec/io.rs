//! Caller-side buffers for one `execute` call.

use std::collections::BTreeMap;

/// Positional input and output buffers.
///
/// `inputs[i]` feeds the i-th declared graph input and `outputs[i]`
/// receives the i-th declared graph output. Buffers hold elements in the
/// graph's logical layout, row-major.
#[derive(Debug, Default)]
pub struct IoDescription<'a> {
    pub inputs: Vec<&'a [u8]>,
    pub outputs: Vec<&'a mut [u8]>,
    /// Run-time shape of dynamic inputs, by input position
    pub input_shapes: BTreeMap<usize, Vec<usize>>,
}

impl<'a> IoDescription<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, buffer: &'a [u8]) -> Self {
        self.inputs.push(buffer);
        self
    }

    pub fn with_output(mut self, buffer: &'a mut [u8]) -> Self {
        self.outputs.push(buffer);
        self
    }

    pub fn with_input_shape(mut self, index: usize, dims: impl Into<Vec<usize>>) -> Self {
        self.input_shapes.insert(index, dims.into());
        self
    }
}
