//! Runtime configuration types.

/// Execution engine used to run `main`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Engine {
    /// Interpret bytecode directly
    #[default]
    Interpreter,
    /// Build block graphs and hand them to the evaluator
    Jit,
}

/// Runtime configuration for a run
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub engine: Engine,
    /// Write every compiled block graph to stderr (JIT engine only)
    pub dump_cfg: bool,
}
