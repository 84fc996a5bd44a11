//! User-defined functions: byte-code representation, compiler, and VM.
//!
//! `function { … }` bodies are parsed into an expression tree
//! ([`expr::FnExpr`]), compiled by [`compiler::FnCompiler`] into a
//! [`FunctionCode`], and executed at render time by [`vm::VmContext`].
//! Compiled programs and the constants pool live in the session-wide
//! [`FunctionRegistry`]; both are immutable once parsing finishes, so any
//! number of render threads may evaluate concurrently on private contexts.

pub use op::{Instruction, Op};
pub use vm::{VmContext, VmError, VmErrorKind};

pub(crate) mod compiler;
pub(crate) mod expr;
pub mod op;
pub mod vm;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::source::SourcePosition;

/// Maximum parameters plus locals a single function may declare.
pub const MAX_FUNCTION_PARAMETERS: usize = 56;

/// Handle to a compiled function in the [`FunctionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId(u32);

impl FunctionId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("function table exceeds u32"))
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A compiled function: the parser-produced, renderer-consumed artifact.
///
/// Immutable once installed in the registry. `return_size` 0 means the
/// result is a scalar left in r0; 2–5 means the result is a vector or color
/// written to the return window at the base of the callee frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCode {
    pub name: String,
    /// Display name of the stream the body was read from.
    pub source_file: String,
    pub position: SourcePosition,
    pub parameters: SmallVec<[String; 4]>,
    pub return_size: u8,
    pub program: Vec<Instruction>,
}

impl FunctionCode {
    /// Stack slot of the first parameter: vector-returning functions keep
    /// their return window below the parameters.
    #[inline]
    #[must_use]
    pub fn parameter_base(&self) -> u16 {
        u16::from(self.return_size)
    }
}

/// Session-wide store of compiled functions and the shared constants pool.
///
/// Constants are deduplicated by bit pattern, so `0.0` and `-0.0` occupy
/// distinct slots and NaN payloads are preserved.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FunctionRegistry {
    constants: Vec<f64>,
    #[serde(skip)]
    constant_index: ahash::AHashMap<u64, u16>,
    functions: Vec<FunctionCode>,
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a constant, returning its pool index.
    ///
    /// Returns `None` when the pool is full (65536 doubles), which the
    /// compiler reports as a "function too complex" resource error.
    pub fn add_constant(&mut self, value: f64) -> Option<u16> {
        if let Some(&idx) = self.constant_index.get(&value.to_bits()) {
            return Some(idx);
        }
        let idx = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(value);
        self.constant_index.insert(value.to_bits(), idx);
        Some(idx)
    }

    #[inline]
    #[must_use]
    pub fn constant(&self, index: u16) -> f64 {
        self.constants[index as usize]
    }

    #[must_use]
    pub fn constants(&self) -> &[f64] {
        &self.constants
    }

    /// Installs a compiled function and returns its handle.
    pub fn install(&mut self, code: FunctionCode) -> FunctionId {
        let id = FunctionId::new(self.functions.len());
        self.functions.push(code);
        id
    }

    #[must_use]
    pub fn get(&self, id: FunctionId) -> &FunctionCode {
        &self.functions[id.index()]
    }

    /// Replaces a function installed as a placeholder.
    ///
    /// Declarations pre-install an empty program under their id so the body
    /// can reference itself (a demotable possible-error); the compiled
    /// program lands here afterwards.
    pub(crate) fn update(&mut self, id: FunctionId, code: FunctionCode) {
        self.functions[id.index()] = code;
    }

    /// Looks a function up by its declared name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(FunctionId::new)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Rebuilds the constant lookup index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.constant_index = self
            .constants
            .iter()
            .enumerate()
            .map(|(i, c)| (c.to_bits(), i as u16))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_constant_dedup() {
        let mut reg = FunctionRegistry::new();
        let a = reg.add_constant(1.5).unwrap();
        let b = reg.add_constant(2.5).unwrap();
        let c = reg.add_constant(1.5).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(reg.constants().len(), 2);
    }

    #[test]
    fn test_zero_signs_distinct() {
        let mut reg = FunctionRegistry::new();
        let pos = reg.add_constant(0.0).unwrap();
        let neg = reg.add_constant(-0.0).unwrap();
        assert_ne!(pos, neg);
    }
}
