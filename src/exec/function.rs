//! Executable units and their composition.

use crate::error::ForgeResult;

/// One backend-produced callable.
///
/// A unit is configured when constructed and only knows the tensors it was
/// bound to then. It has no view of the graph.
pub trait Function: Send {
    fn run(&mut self) -> ForgeResult<()>;

    /// One-time work before the first run
    fn prepare(&mut self) -> ForgeResult<()> {
        Ok(())
    }

    /// Re-check or re-infer output shapes from the current input shapes.
    /// Only called for sequences that contain dynamic tensors.
    fn validate_shapes(&mut self) -> ForgeResult<()> {
        Ok(())
    }

    fn is_nop(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

/// Unit that does nothing: an identity epilogue, or a copy the tensor
/// planner made unnecessary
#[derive(Debug, Default, Clone, Copy)]
pub struct NopFunction;

impl Function for NopFunction {
    fn run(&mut self) -> ForgeResult<()> {
        Ok(())
    }

    fn is_nop(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "Nop"
    }
}

/// Ordered, owned list of units
#[derive(Default)]
pub struct FunctionSequence {
    functions: Vec<Box<dyn Function>>,
    dynamic_shape_check: bool,
}

impl FunctionSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two-stage fused sequence: primary unit then its epilogue
    pub fn fused(primary: Box<dyn Function>, epilogue: Box<dyn Function>) -> Self {
        Self {
            functions: vec![primary, epilogue],
            dynamic_shape_check: false,
        }
    }

    pub fn push(&mut self, function: Box<dyn Function>) {
        self.functions.push(function);
    }

    /// Re-validate shapes of every unit before running it
    pub fn enable_dynamic_shape_check(&mut self, enabled: bool) {
        self.dynamic_shape_check = enabled;
    }

    pub fn dynamic_shape_check(&self) -> bool {
        self.dynamic_shape_check
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn functions(&self) -> &[Box<dyn Function>] {
        &self.functions
    }

    /// Names of the units in order
    pub fn describe(&self) -> Vec<String> {
        self.functions.iter().map(|f| f.name().to_string()).collect()
    }
}

impl Function for FunctionSequence {
    fn run(&mut self) -> ForgeResult<()> {
        let check = self.dynamic_shape_check;
        for function in &mut self.functions {
            if check {
                function.validate_shapes()?;
            }
            function.run()?;
        }
        Ok(())
    }

    fn prepare(&mut self) -> ForgeResult<()> {
        for function in &mut self.functions {
            function.prepare()?;
        }
        Ok(())
    }

    fn validate_shapes(&mut self) -> ForgeResult<()> {
        for function in &mut self.functions {
            function.validate_shapes()?;
        }
        Ok(())
    }

    fn is_nop(&self) -> bool {
        self.functions.iter().all(|f| f.is_nop())
    }

    fn name(&self) -> &str {
        "FunctionSequence"
    }
}

impl std::fmt::Debug for FunctionSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSequence")
            .field("functions", &self.describe())
            .field("dynamic_shape_check", &self.dynamic_shape_check)
            .finish()
    }
}
