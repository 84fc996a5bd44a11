//! The register VM that evaluates compiled functions at render time.
//!
//! Execution is a straight fetch/decode/dispatch loop. All mutable state
//! lives in the per-thread [`VmContext`]; the program and constants pool are
//! shared read-only through [`FunctionRegistry`], so concurrent evaluation
//! needs no synchronization.

use std::{cmp::Ordering, fmt};

use smallvec::SmallVec;
use strum::{Display, IntoStaticStr};

use super::{
    FunctionId, FunctionRegistry,
    op::{Op, SYS1_TABLE, SYS2_TABLE},
};
use crate::source::SourcePosition;

/// Calls can only nest through distinct functions (direct recursion is
/// rejected at compile time), but a demoted possible-error can let a
/// recursive program through; this bound turns that into a clean error.
const MAX_CALL_DEPTH: usize = 128;

/// What went wrong during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum VmErrorKind {
    DivisionByZero,
    LogOfNonPositive,
    ZeroPowZero,
    /// `TRAP`/`TRAPS` with an id that has no host implementation, or a
    /// `SYS` index outside its table.
    MissingIntrinsic,
    /// Decoded an unused encoding; indicates a corrupted program.
    InvalidInstruction,
    CallDepthExceeded,
    /// Host called with the wrong number of arguments.
    ArityMismatch,
}

/// A render-time evaluation error.
///
/// Carries the function name and the source position captured when the
/// function was compiled, so the message can point back into the scene file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub function: String,
    pub file: String,
    pub position: SourcePosition,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            VmErrorKind::DivisionByZero => "division by zero",
            VmErrorKind::LogOfNonPositive => "logarithm of non-positive value",
            VmErrorKind::ZeroPowZero => "0 raised to the power 0",
            VmErrorKind::MissingIntrinsic => "call of a missing intrinsic",
            VmErrorKind::InvalidInstruction => "invalid instruction",
            VmErrorKind::CallDepthExceeded => "function call depth exceeded",
            VmErrorKind::ArityMismatch => "wrong number of arguments",
        };
        if self.function.is_empty() {
            write!(f, "{what} in anonymous function ({} at {})", self.file, self.position)
        } else {
            write!(
                f,
                "{what} in function '{}' ({} at {})",
                self.function, self.file, self.position
            )
        }
    }
}

impl std::error::Error for VmError {}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    function: FunctionId,
    return_pc: usize,
}

/// Per-thread mutable evaluation state.
///
/// Reused across evaluations; the stack keeps its allocated capacity.
#[derive(Debug)]
pub struct VmContext {
    registers: [f64; 8],
    stack: Vec<f64>,
    base: usize,
    calls: Vec<CallFrame>,
    /// Result of the last CMP/CMPI; `None` after comparing with NaN, which
    /// makes every subsequent set/branch treat the comparison as false.
    ord: Option<Ordering>,
}

impl Default for VmContext {
    fn default() -> Self {
        Self::new()
    }
}

impl VmContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registers: [0.0; 8],
            stack: Vec::with_capacity(64),
            base: 0,
            calls: Vec::new(),
            ord: None,
        }
    }

    /// Evaluates a scalar-returning function.
    pub fn run_scalar(&mut self, registry: &FunctionRegistry, id: FunctionId, args: &[f64]) -> Result<f64, VmError> {
        let code = registry.get(id);
        if code.return_size != 0 {
            return Err(self.error(registry, id, VmErrorKind::ArityMismatch));
        }
        self.run(registry, id, args)?;
        Ok(self.registers[0])
    }

    /// Evaluates a vector- or color-returning function; the result has
    /// `return_size` components.
    pub fn run_vector(
        &mut self,
        registry: &FunctionRegistry,
        id: FunctionId,
        args: &[f64],
    ) -> Result<SmallVec<[f64; 5]>, VmError> {
        let size = registry.get(id).return_size as usize;
        if size == 0 {
            return Err(self.error(registry, id, VmErrorKind::ArityMismatch));
        }
        self.run(registry, id, args)?;
        Ok(SmallVec::from_slice(&self.stack[..size]))
    }

    fn error(&self, registry: &FunctionRegistry, id: FunctionId, kind: VmErrorKind) -> VmError {
        let code = registry.get(id);
        VmError {
            kind,
            function: code.name.clone(),
            file: code.source_file.clone(),
            position: code.position,
        }
    }

    fn run(&mut self, registry: &FunctionRegistry, entry: FunctionId, args: &[f64]) -> Result<(), VmError> {
        let mut code = registry.get(entry);
        if args.len() != code.parameters.len() {
            return Err(self.error(registry, entry, VmErrorKind::ArityMismatch));
        }

        self.registers = [0.0; 8];
        self.stack.clear();
        self.base = 0;
        self.calls.clear();
        self.ord = None;

        let param_base = code.parameter_base() as usize;
        self.stack.resize(param_base + args.len(), 0.0);
        self.stack[param_base..].copy_from_slice(args);

        let mut current = entry;
        let mut pc = 0usize;
        loop {
            let Some(&instruction) = code.program.get(pc) else {
                // Falling off the end without RTS indicates a compiler bug;
                // treat as a clean end of the entry function.
                return Ok(());
            };
            pc += 1;
            match instruction.decode() {
                Op::Add(rs, rd) => self.registers[rd as usize] += self.registers[rs as usize],
                Op::Sub(rs, rd) => self.registers[rd as usize] -= self.registers[rs as usize],
                Op::Mul(rs, rd) => self.registers[rd as usize] *= self.registers[rs as usize],
                Op::Div(rs, rd) => self.registers[rd as usize] /= self.registers[rs as usize],
                Op::Move(rs, rd) => self.registers[rd as usize] = self.registers[rs as usize],
                Op::Cmp(rs, rd) => {
                    self.ord = self.registers[rd as usize].partial_cmp(&self.registers[rs as usize]);
                }
                Op::Neg(rd) => self.registers[rd as usize] = -self.registers[rd as usize],
                Op::Abs(rd) => self.registers[rd as usize] = self.registers[rd as usize].abs(),
                Op::Teq(rd) => {
                    self.registers[rd as usize] = f64::from(self.registers[rd as usize] == 0.0);
                }
                Op::Tne(rd) => {
                    self.registers[rd as usize] = f64::from(self.registers[rd as usize] != 0.0);
                }
                Op::Addi(rd, k) => self.registers[rd as usize] += registry.constant(k),
                Op::Subi(rd, k) => self.registers[rd as usize] -= registry.constant(k),
                Op::Muli(rd, k) => self.registers[rd as usize] *= registry.constant(k),
                Op::Loadi(rd, k) => self.registers[rd as usize] = registry.constant(k),
                Op::Cmpi(rd, k) => {
                    self.ord = self.registers[rd as usize].partial_cmp(&registry.constant(k));
                }
                Op::Seq(rd) => self.registers[rd as usize] = f64::from(self.ord == Some(Ordering::Equal)),
                Op::Sne(rd) => {
                    self.registers[rd as usize] = f64::from(self.ord.is_some_and(|o| o != Ordering::Equal));
                }
                Op::Slt(rd) => self.registers[rd as usize] = f64::from(self.ord == Some(Ordering::Less)),
                Op::Sle(rd) => {
                    self.registers[rd as usize] = f64::from(self.ord.is_some_and(|o| o != Ordering::Greater));
                }
                Op::Sgt(rd) => self.registers[rd as usize] = f64::from(self.ord == Some(Ordering::Greater)),
                Op::Sge(rd) => {
                    self.registers[rd as usize] = f64::from(self.ord.is_some_and(|o| o != Ordering::Less));
                }
                Op::Load(rd, k) => self.registers[rd as usize] = self.stack[self.base + k as usize],
                Op::Store(rs, k) => self.stack[self.base + k as usize] = self.registers[rs as usize],
                Op::Nop => {}
                Op::Jmp(k) => pc = k as usize,
                Op::Beq(k) => {
                    if self.ord == Some(Ordering::Equal) {
                        pc = k as usize;
                    }
                }
                Op::Bne(k) => {
                    if self.ord.is_some_and(|o| o != Ordering::Equal) {
                        pc = k as usize;
                    }
                }
                Op::Blt(k) => {
                    if self.ord == Some(Ordering::Less) {
                        pc = k as usize;
                    }
                }
                Op::Ble(k) => {
                    if self.ord.is_some_and(|o| o != Ordering::Greater) {
                        pc = k as usize;
                    }
                }
                Op::Bgt(k) => {
                    if self.ord == Some(Ordering::Greater) {
                        pc = k as usize;
                    }
                }
                Op::Bge(k) => {
                    if self.ord.is_some_and(|o| o != Ordering::Less) {
                        pc = k as usize;
                    }
                }
                Op::Xeq => {
                    if self.registers[0] == 0.0 {
                        return Err(self.error(registry, current, VmErrorKind::DivisionByZero));
                    }
                }
                Op::Xle => {
                    if self.registers[0] <= 0.0 {
                        return Err(self.error(registry, current, VmErrorKind::LogOfNonPositive));
                    }
                }
                Op::Xdz => {
                    if self.registers[0] == 0.0 && self.registers[1] == 0.0 {
                        return Err(self.error(registry, current, VmErrorKind::ZeroPowZero));
                    }
                }
                Op::Sys1(k) => match SYS1_TABLE.get(k as usize) {
                    Some((_, f)) => self.registers[0] = f(self.registers[0]),
                    None => return Err(self.error(registry, current, VmErrorKind::MissingIntrinsic)),
                },
                Op::Sys2(k) => match SYS2_TABLE.get(k as usize) {
                    Some((_, f)) => self.registers[0] = f(self.registers[0], self.registers[1]),
                    None => return Err(self.error(registry, current, VmErrorKind::MissingIntrinsic)),
                },
                Op::Trap(_) | Op::Traps(_) => {
                    // No host-side internal function table is installed.
                    return Err(self.error(registry, current, VmErrorKind::MissingIntrinsic));
                }
                Op::Grow(k) => {
                    let needed = self.base + k as usize;
                    if self.stack.len() < needed {
                        self.stack.resize(needed, 0.0);
                    }
                }
                Op::Push(k) => self.base += k as usize,
                Op::Pop(k) => {
                    debug_assert!(self.base >= k as usize, "POP below stack base");
                    self.base = self.base.saturating_sub(k as usize);
                }
                Op::Call(k) => {
                    if self.calls.len() >= MAX_CALL_DEPTH {
                        return Err(self.error(registry, current, VmErrorKind::CallDepthExceeded));
                    }
                    self.calls.push(CallFrame {
                        function: current,
                        return_pc: pc,
                    });
                    current = FunctionId::new(k as usize);
                    code = registry.get(current);
                    pc = 0;
                }
                Op::Rts => match self.calls.pop() {
                    Some(frame) => {
                        current = frame.function;
                        code = registry.get(current);
                        pc = frame.return_pc;
                    }
                    None => return Ok(()),
                },
                Op::Invalid(_) => {
                    return Err(self.error(registry, current, VmErrorKind::InvalidInstruction));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    use super::*;
    use crate::function::{
        FunctionCode,
        op::{Instruction, r0, r1, r2},
    };
    use crate::source::{SourcePosition, StreamId};

    fn install(registry: &mut FunctionRegistry, params: &[&str], return_size: u8, program: Vec<Instruction>) -> FunctionId {
        registry.install(FunctionCode {
            name: "test".to_owned(),
            source_file: "test.pov".to_owned(),
            position: SourcePosition::start_of(StreamId::new(0)),
            parameters: params.iter().map(|s| (*s).to_owned()).collect(),
            return_size,
            program,
        })
    }

    #[test]
    fn test_hand_assembled_add() {
        let mut registry = FunctionRegistry::new();
        // f(x, y, z) = x + y: load params into r0/r1 and add
        let program = vec![
            Instruction::plain(r0::GROW, 3),
            Instruction::one_reg(r1::LOAD, 0, 0),
            Instruction::one_reg(r1::LOAD, 1, 1),
            Instruction::two_reg(r2::ADD, 1, 0),
            Instruction::plain(r0::RTS, 0),
        ];
        let id = install(&mut registry, &["x", "y", "z"], 0, program);
        let mut ctx = VmContext::new();
        let out = ctx.run_scalar(&registry, id, &[2.0, 3.0, 0.0]).unwrap();
        assert_eq!(out, 5.0);
    }

    #[test]
    fn test_xeq_trap() {
        let mut registry = FunctionRegistry::new();
        let program = vec![
            Instruction::plain(r0::GROW, 1),
            Instruction::one_reg(r1::LOAD, 0, 0),
            Instruction::plain(r0::XEQ, 0),
            Instruction::plain(r0::RTS, 0),
        ];
        let id = install(&mut registry, &["x"], 0, program);
        let mut ctx = VmContext::new();
        let err = ctx.run_scalar(&registry, id, &[0.0]).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::DivisionByZero);
        assert!(err.to_string().contains("test.pov"));
    }

    #[test]
    fn test_nan_comparison_is_false() {
        let mut registry = FunctionRegistry::new();
        // compare x with 0 and set "less" flag
        let k = registry.add_constant(0.0).unwrap();
        let program = vec![
            Instruction::plain(r0::GROW, 1),
            Instruction::one_reg(r1::LOAD, 0, 0),
            Instruction::one_reg(r1::CMPI, 0, k),
            Instruction::one_reg(r1::SLT, 0, 0),
            Instruction::plain(r0::RTS, 0),
        ];
        let id = install(&mut registry, &["x"], 0, program);
        let mut ctx = VmContext::new();
        assert_eq!(ctx.run_scalar(&registry, id, &[f64::NAN]).unwrap(), 0.0);
        assert_eq!(ctx.run_scalar(&registry, id, &[-1.0]).unwrap(), 1.0);
    }

    #[test]
    fn test_vector_return_window() {
        let mut registry = FunctionRegistry::new();
        let one = registry.add_constant(1.0).unwrap();
        let two = registry.add_constant(2.0).unwrap();
        let three = registry.add_constant(3.0).unwrap();
        // return <1, 2, 3>: store into slots 0..3 (the return window)
        let program = vec![
            Instruction::plain(r0::GROW, 6),
            Instruction::one_reg(r1::LOADI, 0, one),
            Instruction::one_reg(r1::STORE, 0, 0),
            Instruction::one_reg(r1::LOADI, 0, two),
            Instruction::one_reg(r1::STORE, 0, 1),
            Instruction::one_reg(r1::LOADI, 0, three),
            Instruction::one_reg(r1::STORE, 0, 2),
            Instruction::plain(r0::RTS, 0),
        ];
        let id = install(&mut registry, &["x", "y", "z"], 3, program);
        let mut ctx = VmContext::new();
        let out = ctx.run_vector(&registry, id, &[0.0, 0.0, 0.0]).unwrap();
        let expected: SmallVec<[f64; 5]> = smallvec![1.0, 2.0, 3.0];
        assert_eq!(out, expected);
    }

    #[test]
    fn test_missing_intrinsic_trap() {
        let mut registry = FunctionRegistry::new();
        let program = vec![Instruction::plain(r0::TRAP, 42), Instruction::plain(r0::RTS, 0)];
        let id = install(&mut registry, &[], 0, program);
        let mut ctx = VmContext::new();
        let err = ctx.run_scalar(&registry, id, &[]).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::MissingIntrinsic);
    }

    #[test]
    fn test_arity_checked() {
        let mut registry = FunctionRegistry::new();
        let program = vec![Instruction::plain(r0::RTS, 0)];
        let id = install(&mut registry, &["x"], 0, program);
        let mut ctx = VmContext::new();
        let err = ctx.run_scalar(&registry, id, &[1.0, 2.0]).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::ArityMismatch);
    }
}
