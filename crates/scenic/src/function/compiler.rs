//! The byte-code compiler for function bodies.
//!
//! Compilation is a recursive walk of the [`FnExpr`] tree with an explicit
//! register-scheduling discipline: the result of every subexpression lands
//! in r0, and a pending right operand is parked by nesting `level` in r5,
//! r6, r7, or a stack spill slot. Parameters x, y, z live permanently in
//! r2, r3, r4.

use smallvec::SmallVec;

use super::{
    FunctionCode, FunctionId, FunctionRegistry, MAX_FUNCTION_PARAMETERS,
    expr::{FnBinOp, FnExpr, FnMember},
    op::{self, Instruction, r0, r1, r2},
};
use crate::{
    diag::{ErrorKind, ParseError, ParseResult},
    math::{BLUE_INTENSITY, GREEN_INTENSITY, RED_INTENSITY},
    source::SourcePosition,
};

/// Register assignments fixed by the calling convention.
const REG_RESULT: u8 = 0;
const REG_OPERAND: u8 = 1;
const REG_X: u8 = 2;
const REG_Y: u8 = 3;
const REG_Z: u8 = 4;
const REG_SAVE_BASE: u8 = 5;

/// Compiles one function body into a [`FunctionCode`].
///
/// The compiler owns no I/O; warnings produced by the constant-folding
/// peephole are collected for the caller to emit.
pub(crate) struct FnCompiler<'a> {
    registry: &'a mut FunctionRegistry,
    program: Vec<Instruction>,
    /// Expression nesting depth; 1 while compiling the outermost operand.
    level: u32,
    /// First free stack slot of the current frame region.
    stack_pointer: u32,
    /// High-water mark patched into the prologue GROW.
    max_stack: u32,
    parameters: SmallVec<[String; 4]>,
    /// Parameters start here: vector-returning functions keep their return
    /// window in slots `0..return_size`.
    param_base: u32,
    return_size: u8,
    /// Active `sum`/`prod` loop variables, innermost last.
    locals: Vec<(String, u32)>,
    name: String,
    source_file: String,
    position: SourcePosition,
    warnings: Vec<String>,
}

impl<'a> FnCompiler<'a> {
    pub fn new(
        registry: &'a mut FunctionRegistry,
        name: impl Into<String>,
        source_file: impl Into<String>,
        position: SourcePosition,
        parameters: SmallVec<[String; 4]>,
    ) -> Self {
        Self {
            registry,
            program: Vec::with_capacity(64),
            level: 1,
            stack_pointer: 0,
            max_stack: 0,
            parameters,
            param_base: 0,
            return_size: 0,
            locals: Vec::new(),
            name: name.into(),
            source_file: source_file.into(),
            position,
            warnings: Vec::new(),
        }
    }

    /// Compiles the body and returns the finished code plus any peephole
    /// warnings.
    pub fn compile(mut self, body: &FnExpr) -> ParseResult<(FunctionCode, Vec<String>)> {
        if self.parameters.is_empty() {
            self.parameters = SmallVec::from_vec(vec!["x".to_owned(), "y".to_owned(), "z".to_owned()]);
        }
        if self.parameters.len() > MAX_FUNCTION_PARAMETERS {
            return Err(self.error(ErrorKind::Resource, "too many function parameters"));
        }

        self.return_size = match body {
            FnExpr::Vector(parts) => {
                if !(2..=5).contains(&parts.len()) {
                    return Err(self.error(
                        ErrorKind::Type,
                        "a vector-valued function must have two to five components",
                    ));
                }
                parts.len() as u8
            }
            _ => 0,
        };
        self.param_base = u32::from(self.return_size);

        let grow_pos = self.emit(Instruction::plain(r0::NOP, 0))?;
        self.compile_parameters()?;

        self.level = 1;
        self.stack_pointer = self.param_base + self.parameters.len() as u32;
        self.max_stack = self.stack_pointer;

        match body {
            FnExpr::Vector(parts) => {
                for (slot, part) in parts.iter().enumerate() {
                    self.compile_expr(part)?;
                    self.emit(Instruction::one_reg(r1::STORE, REG_RESULT, slot as u16))?;
                }
            }
            _ => self.compile_expr(body)?,
        }

        let max_stack = self.slot16(self.max_stack)?;
        self.program[grow_pos] = Instruction::plain(r0::GROW, max_stack);
        self.emit(Instruction::plain(r0::RTS, 0))?;

        Ok((
            FunctionCode {
                name: self.name,
                source_file: self.source_file,
                position: self.position,
                parameters: self.parameters,
                return_size: self.return_size,
                program: self.program,
            },
            self.warnings,
        ))
    }

    fn error(&self, kind: ErrorKind, message: impl Into<String>) -> ParseError {
        let mut message = message.into();
        if !self.name.is_empty() {
            message = format!("{message} (in function '{}')", self.name);
        }
        ParseError::new(kind, message).at(&self.source_file, self.position)
    }

    fn emit(&mut self, instruction: Instruction) -> ParseResult<usize> {
        if self.program.len() >= usize::from(u16::MAX) {
            return Err(self.error(ErrorKind::Resource, "function too complex"));
        }
        self.program.push(instruction);
        Ok(self.program.len() - 1)
    }

    fn constant(&mut self, value: f64) -> ParseResult<u16> {
        self.registry
            .add_constant(value)
            .ok_or_else(|| self.error(ErrorKind::Resource, "function too complex: constant pool exhausted"))
    }

    fn slot16(&self, slot: u32) -> ParseResult<u16> {
        u16::try_from(slot).map_err(|_| self.error(ErrorKind::Resource, "function too complex: stack frame too large"))
    }

    fn target16(&self, target: usize) -> ParseResult<u16> {
        u16::try_from(target).map_err(|_| self.error(ErrorKind::Resource, "function too complex"))
    }

    fn bump_stack(&mut self, needed: u32) {
        self.max_stack = self.max_stack.max(needed);
    }

    /// Loads x/u, y/v, z parameters into their registers, zero-filling any
    /// of the three that the parameter list does not name. Also emitted
    /// after every call returns, because the callee owns the same registers.
    fn compile_parameters(&mut self) -> ParseResult<()> {
        let mut had = [false; 3];
        let params: Vec<(usize, String)> = self.parameters.iter().cloned().enumerate().collect();
        for (i, name) in &params {
            let slot = self.slot16(self.param_base + *i as u32)?;
            match name.as_str() {
                "x" | "u" => {
                    self.emit(Instruction::one_reg(r1::LOAD, REG_X, slot))?;
                    had[0] = true;
                }
                "y" | "v" => {
                    self.emit(Instruction::one_reg(r1::LOAD, REG_Y, slot))?;
                    had[1] = true;
                }
                "z" => {
                    self.emit(Instruction::one_reg(r1::LOAD, REG_Z, slot))?;
                    had[2] = true;
                }
                _ => {}
            }
        }
        for (i, seen) in had.into_iter().enumerate() {
            if !seen {
                let zero = self.constant(0.0)?;
                self.emit(Instruction::one_reg(r1::LOADI, REG_X + i as u8, zero))?;
            }
        }
        Ok(())
    }

    /// Parks r0 while the left operand is compiled. The save location is
    /// chosen by `level`: r5, r6, r7, then stack slots above the frame.
    /// Returns the spill slot for `restore_operand`.
    fn park_operand(&mut self) -> ParseResult<u32> {
        let slot = match self.level {
            1..=3 => {
                self.emit(Instruction::two_reg(
                    r2::MOVE,
                    REG_RESULT,
                    REG_SAVE_BASE + (self.level - 1) as u8,
                ))?;
                0
            }
            level => {
                let slot = self.stack_pointer + level - 4;
                self.bump_stack(slot + 1);
                let slot16 = self.slot16(slot)?;
                self.emit(Instruction::one_reg(r1::STORE, REG_RESULT, slot16))?;
                slot
            }
        };
        self.level += 1;
        Ok(slot)
    }

    /// Restores the parked operand into r1.
    fn restore_operand(&mut self, slot: u32) -> ParseResult<()> {
        self.level -= 1;
        match self.level {
            1..=3 => {
                self.emit(Instruction::two_reg(
                    r2::MOVE,
                    REG_SAVE_BASE + (self.level - 1) as u8,
                    REG_OPERAND,
                ))?;
            }
            _ => {
                let slot16 = self.slot16(slot)?;
                self.emit(Instruction::one_reg(r1::LOAD, REG_OPERAND, slot16))?;
            }
        }
        Ok(())
    }

    /// Number of r5/r6/r7 registers holding live parked operands.
    fn live_saves(&self) -> u32 {
        (self.level - 1).min(3)
    }

    /// First stack slot available above the frame and any live stack spills.
    fn spill_area(&self) -> u32 {
        self.stack_pointer + (self.level - 1).saturating_sub(3)
    }

    fn compile_expr(&mut self, expr: &FnExpr) -> ParseResult<()> {
        match expr {
            FnExpr::Constant(value) => {
                let k = self.constant(*value)?;
                self.emit(Instruction::one_reg(r1::LOADI, REG_RESULT, k))?;
            }
            FnExpr::Variable(name) => self.compile_variable(name)?,
            FnExpr::Binary { op, left, right } => self.compile_binary(*op, left, right)?,
            FnExpr::Neg(inner) => {
                self.compile_expr(inner)?;
                self.emit(Instruction::one_reg(r1::NEG, REG_RESULT, 0))?;
            }
            FnExpr::Not(inner) => {
                self.compile_expr(inner)?;
                self.emit(Instruction::one_reg(r1::TEQ, REG_RESULT, 0))?;
            }
            FnExpr::Abs(inner) => {
                self.compile_expr(inner)?;
                self.emit(Instruction::one_reg(r1::ABS, REG_RESULT, 0))?;
            }
            FnExpr::Sqr(inner) => {
                self.compile_expr(inner)?;
                self.emit(Instruction::two_reg(r2::MUL, REG_RESULT, REG_RESULT))?;
            }
            FnExpr::Radians(inner) => {
                self.compile_expr(inner)?;
                let k = self.constant(std::f64::consts::PI / 180.0)?;
                self.emit(Instruction::one_reg(r1::MULI, REG_RESULT, k))?;
            }
            FnExpr::Degrees(inner) => {
                self.compile_expr(inner)?;
                let k = self.constant(180.0 / std::f64::consts::PI)?;
                self.emit(Instruction::one_reg(r1::MULI, REG_RESULT, k))?;
            }
            FnExpr::Intrinsic1 {
                sys,
                guard_positive,
                arg,
            } => {
                self.compile_expr(arg)?;
                if *guard_positive {
                    self.emit(Instruction::plain(r0::XLE, 0))?;
                }
                self.emit(Instruction::plain(r0::SYS1, *sys))?;
            }
            FnExpr::Intrinsic2 {
                sys,
                guard_second_nonzero,
                guard_pow,
                first,
                second,
            } => {
                self.compile_expr(second)?;
                if *guard_second_nonzero {
                    self.emit(Instruction::plain(r0::XEQ, 0))?;
                }
                let slot = self.park_operand()?;
                self.compile_expr(first)?;
                self.restore_operand(slot)?;
                if *guard_pow {
                    self.emit(Instruction::plain(r0::XDZ, 0))?;
                }
                self.emit(Instruction::plain(r0::SYS2, *sys))?;
            }
            FnExpr::MinMax { is_max, args } => self.compile_min_max(*is_max, args)?,
            FnExpr::Select(args) => self.compile_select(args)?,
            FnExpr::Reduce {
                is_prod,
                variable,
                from,
                to,
                body,
            } => self.compile_reduce(*is_prod, variable, from, to, body)?,
            FnExpr::Call { function, name, args } => {
                self.compile_call(*function, name, args)?;
            }
            FnExpr::Member { call, member } => self.compile_member(call, *member)?,
            FnExpr::Vector(_) => {
                return Err(self.error(ErrorKind::Parse, "vector expressions are only valid as a whole function body"));
            }
        }
        Ok(())
    }

    fn compile_variable(&mut self, name: &str) -> ParseResult<()> {
        // loop variables shadow parameters, innermost first
        if let Some(&(_, slot)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            let slot16 = self.slot16(slot)?;
            self.emit(Instruction::one_reg(r1::LOAD, REG_RESULT, slot16))?;
            return Ok(());
        }
        match name {
            "x" | "u" => {
                self.emit(Instruction::two_reg(r2::MOVE, REG_X, REG_RESULT))?;
                return Ok(());
            }
            "y" | "v" => {
                self.emit(Instruction::two_reg(r2::MOVE, REG_Y, REG_RESULT))?;
                return Ok(());
            }
            "z" => {
                self.emit(Instruction::two_reg(r2::MOVE, REG_Z, REG_RESULT))?;
                return Ok(());
            }
            _ => {}
        }
        if let Some(index) = self.parameters.iter().position(|p| p == name) {
            let slot = self.slot16(self.param_base + index as u32)?;
            self.emit(Instruction::one_reg(r1::LOAD, REG_RESULT, slot))?;
            return Ok(());
        }
        Err(self.error(
            ErrorKind::Symbol,
            format!("expected parameter identifier or float constant, found '{name}'"),
        ))
    }

    fn compile_binary(&mut self, op: FnBinOp, left: &FnExpr, right: &FnExpr) -> ParseResult<()> {
        // constant right-hand peephole
        if let Some(c) = right.as_constant() {
            match op {
                FnBinOp::Add | FnBinOp::Sub => {
                    self.compile_expr(left)?;
                    if c != 0.0 {
                        let k = self.constant(c)?;
                        let base = if op == FnBinOp::Add { r1::ADDI } else { r1::SUBI };
                        self.emit(Instruction::one_reg(base, REG_RESULT, k))?;
                    }
                    return Ok(());
                }
                FnBinOp::Mul => {
                    self.compile_expr(left)?;
                    if c != 1.0 {
                        let k = self.constant(c)?;
                        self.emit(Instruction::one_reg(r1::MULI, REG_RESULT, k))?;
                    }
                    return Ok(());
                }
                FnBinOp::Div => {
                    if c == 0.0 {
                        return Err(self.error(ErrorKind::Domain, "division by zero"));
                    }
                    self.compile_expr(left)?;
                    if c != 1.0 {
                        let k = self.constant(1.0 / c)?;
                        self.emit(Instruction::one_reg(r1::MULI, REG_RESULT, k))?;
                    }
                    return Ok(());
                }
                FnBinOp::Pow => {
                    if c == 0.0 {
                        // the left operand is not compiled at all
                        let k = self.constant(1.0)?;
                        self.emit(Instruction::one_reg(r1::LOADI, REG_RESULT, k))?;
                        self.warnings.push("zero power optimized to constant 1.0".to_owned());
                        return Ok(());
                    }
                    if c.fract() == 0.0 && (2.0..=8.0).contains(&c) {
                        self.compile_expr(left)?;
                        self.compile_small_power(c as u32)?;
                        return Ok(());
                    }
                    // fall through to the generic sequence
                }
                _ => {}
            }
        }

        self.compile_expr(right)?;
        if op == FnBinOp::Div {
            // divisor is in r0 right now
            self.emit(Instruction::plain(r0::XEQ, 0))?;
        }
        let slot = self.park_operand()?;
        self.compile_expr(left)?;
        self.restore_operand(slot)?;

        match op {
            FnBinOp::Add => {
                self.emit(Instruction::two_reg(r2::ADD, REG_OPERAND, REG_RESULT))?;
            }
            FnBinOp::Sub => {
                self.emit(Instruction::two_reg(r2::SUB, REG_OPERAND, REG_RESULT))?;
            }
            FnBinOp::Mul => {
                self.emit(Instruction::two_reg(r2::MUL, REG_OPERAND, REG_RESULT))?;
            }
            FnBinOp::Div => {
                self.emit(Instruction::two_reg(r2::DIV, REG_OPERAND, REG_RESULT))?;
            }
            FnBinOp::Pow => {
                self.emit(Instruction::plain(r0::XDZ, 0))?;
                self.emit(Instruction::plain(r0::SYS2, op::SYS2_POW))?;
            }
            FnBinOp::And => {
                self.emit(Instruction::one_reg(r1::TNE, REG_RESULT, 0))?;
                self.emit(Instruction::one_reg(r1::TNE, REG_OPERAND, 0))?;
                self.emit(Instruction::two_reg(r2::MUL, REG_OPERAND, REG_RESULT))?;
            }
            FnBinOp::Or => {
                self.emit(Instruction::one_reg(r1::TNE, REG_RESULT, 0))?;
                self.emit(Instruction::one_reg(r1::TNE, REG_OPERAND, 0))?;
                self.emit(Instruction::two_reg(r2::ADD, REG_OPERAND, REG_RESULT))?;
                self.emit(Instruction::one_reg(r1::TNE, REG_RESULT, 0))?;
            }
            FnBinOp::Eq | FnBinOp::Ne | FnBinOp::Lt | FnBinOp::Le | FnBinOp::Gt | FnBinOp::Ge => {
                self.emit(Instruction::two_reg(r2::CMP, REG_OPERAND, REG_RESULT))?;
                let set = match op {
                    FnBinOp::Eq => r1::SEQ,
                    FnBinOp::Ne => r1::SNE,
                    FnBinOp::Lt => r1::SLT,
                    FnBinOp::Le => r1::SLE,
                    FnBinOp::Gt => r1::SGT,
                    _ => r1::SGE,
                };
                self.emit(Instruction::one_reg(set, REG_RESULT, 0))?;
            }
        }
        Ok(())
    }

    /// Fixed multiply sequences for `x ** 2` through `x ** 8`.
    ///
    /// Only r0 and r1 are touched; r1 is dead between operand restore and
    /// the operation, and no operand is pending on this path.
    fn compile_small_power(&mut self, exponent: u32) -> ParseResult<()> {
        let mul = |rs, rd| Instruction::two_reg(r2::MUL, rs, rd);
        let save = Instruction::two_reg(r2::MOVE, REG_RESULT, REG_OPERAND);
        match exponent {
            2 => {
                self.emit(mul(0, 0))?;
            }
            3 => {
                self.emit(save)?;
                self.emit(mul(0, 0))?;
                self.emit(mul(1, 0))?;
            }
            4 => {
                self.emit(mul(0, 0))?;
                self.emit(mul(0, 0))?;
            }
            5 => {
                self.emit(save)?;
                self.emit(mul(0, 0))?;
                self.emit(mul(0, 0))?;
                self.emit(mul(1, 0))?;
            }
            6 => {
                self.emit(save)?;
                self.emit(mul(0, 0))?;
                self.emit(mul(1, 0))?;
                self.emit(mul(0, 0))?;
            }
            7 => {
                self.emit(save)?;
                self.emit(mul(0, 0))?;
                self.emit(mul(1, 0))?;
                self.emit(mul(0, 0))?;
                self.emit(mul(1, 0))?;
            }
            8 => {
                self.emit(mul(0, 0))?;
                self.emit(mul(0, 0))?;
                self.emit(mul(0, 0))?;
            }
            _ => unreachable!("small power range is 2..=8"),
        }
        Ok(())
    }

    fn compile_min_max(&mut self, is_max: bool, args: &[FnExpr]) -> ParseResult<()> {
        if args.len() < 2 {
            let name = if is_max { "max" } else { "min" };
            return Err(self.error(
                ErrorKind::Parse,
                format!("invalid number of parameters for '{name}': at least two expected"),
            ));
        }
        self.compile_expr(&args[0])?;
        for arg in &args[1..] {
            let slot = self.park_operand()?;
            self.compile_expr(arg)?;
            self.restore_operand(slot)?;
            // r0 = candidate, r1 = best so far
            self.emit(Instruction::two_reg(r2::CMP, REG_OPERAND, REG_RESULT))?;
            let branch_pos = self.emit(Instruction::plain(r0::NOP, 0))?;
            self.emit(Instruction::two_reg(r2::MOVE, REG_OPERAND, REG_RESULT))?;
            let target = self.target16(self.program.len())?;
            let base = if is_max { r0::BGT } else { r0::BLT };
            self.program[branch_pos] = Instruction::plain(base, target);
        }
        Ok(())
    }

    fn compile_select(&mut self, args: &[FnExpr]) -> ParseResult<()> {
        if !(3..=4).contains(&args.len()) {
            return Err(self.error(
                ErrorKind::Parse,
                "invalid number of parameters for 'select': three or four expected",
            ));
        }
        let has_positive = args.len() == 4;

        self.compile_expr(&args[0])?;
        let zero = self.constant(0.0)?;
        self.emit(Instruction::one_reg(r1::CMPI, REG_RESULT, zero))?;

        let branch_negative = self.emit(Instruction::plain(r0::NOP, 0))?;
        let branch_positive = if has_positive {
            Some(self.emit(Instruction::plain(r0::NOP, 0))?)
        } else {
            None
        };

        // fallthrough: condition is zero (or non-negative with three args)
        self.compile_expr(&args[2])?;
        let jump_zero_end = self.emit(Instruction::plain(r0::NOP, 0))?;

        let negative_start = self.target16(self.program.len())?;
        self.compile_expr(&args[1])?;
        let jump_negative_end = if has_positive {
            Some(self.emit(Instruction::plain(r0::NOP, 0))?)
        } else {
            None
        };

        let positive_start = self.target16(self.program.len())?;
        if let Some(pos) = args.get(3) {
            self.compile_expr(pos)?;
        }

        let end = self.target16(self.program.len())?;
        self.program[branch_negative] = Instruction::plain(r0::BLT, negative_start);
        if let Some(bp) = branch_positive {
            self.program[bp] = Instruction::plain(r0::BGT, positive_start);
        }
        self.program[jump_zero_end] = Instruction::plain(r0::JMP, end);
        if let Some(jn) = jump_negative_end {
            self.program[jn] = Instruction::plain(r0::JMP, end);
        }
        Ok(())
    }

    fn compile_reduce(
        &mut self,
        is_prod: bool,
        variable: &str,
        from: &FnExpr,
        to: &FnExpr,
        body: &FnExpr,
    ) -> ParseResult<()> {
        if self.locals.len() + self.parameters.len() >= MAX_FUNCTION_PARAMETERS {
            return Err(self.error(ErrorKind::Resource, "too many local variables"));
        }

        // spill the save registers like a call would; the loop scratches r0/r1
        // and the body runs at a level that spills to the stack
        let spill_count = self.live_saves();
        let spill_base = self.spill_area();
        for i in 0..spill_count {
            let slot = self.slot16(spill_base + i)?;
            self.emit(Instruction::one_reg(r1::STORE, REG_SAVE_BASE + i as u8, slot))?;
        }

        let accum_slot = spill_base + spill_count;
        let loop_slot = accum_slot + 1;
        let limit_slot = accum_slot + 2;
        self.bump_stack(accum_slot + 3);
        let accum16 = self.slot16(accum_slot)?;
        let loop16 = self.slot16(loop_slot)?;
        let limit16 = self.slot16(limit_slot)?;

        let old_level = self.level;
        // subsequent spills must land above the three loop slots
        self.level = accum_slot + 3 - self.stack_pointer + 4;
        self.locals.push((variable.to_owned(), loop_slot));

        let neutral = self.constant(if is_prod { 1.0 } else { 0.0 })?;
        self.emit(Instruction::one_reg(r1::LOADI, REG_OPERAND, neutral))?;
        self.emit(Instruction::one_reg(r1::STORE, REG_OPERAND, accum16))?;

        self.compile_expr(from)?;
        self.emit(Instruction::one_reg(r1::STORE, REG_RESULT, loop16))?;
        self.compile_expr(to)?;
        self.emit(Instruction::one_reg(r1::STORE, REG_RESULT, limit16))?;

        let loop_start = self.target16(self.program.len())?;
        self.emit(Instruction::one_reg(r1::LOAD, REG_RESULT, loop16))?;
        self.emit(Instruction::one_reg(r1::LOAD, REG_OPERAND, limit16))?;
        self.emit(Instruction::two_reg(r2::CMP, REG_OPERAND, REG_RESULT))?;
        let exit_branch = self.emit(Instruction::plain(r0::NOP, 0))?;

        self.compile_expr(body)?;
        self.emit(Instruction::one_reg(r1::LOAD, REG_OPERAND, accum16))?;
        let combine = if is_prod { r2::MUL } else { r2::ADD };
        self.emit(Instruction::two_reg(combine, REG_OPERAND, REG_RESULT))?;
        self.emit(Instruction::one_reg(r1::STORE, REG_RESULT, accum16))?;

        self.emit(Instruction::one_reg(r1::LOAD, REG_RESULT, loop16))?;
        let one = self.constant(1.0)?;
        self.emit(Instruction::one_reg(r1::ADDI, REG_RESULT, one))?;
        self.emit(Instruction::one_reg(r1::STORE, REG_RESULT, loop16))?;
        self.emit(Instruction::plain(r0::JMP, loop_start))?;

        let exit = self.target16(self.program.len())?;
        self.program[exit_branch] = Instruction::plain(r0::BGT, exit);

        self.emit(Instruction::one_reg(r1::LOAD, REG_RESULT, accum16))?;

        self.locals.pop();
        self.level = old_level;
        for i in 0..spill_count {
            let slot = self.slot16(spill_base + i)?;
            self.emit(Instruction::one_reg(r1::LOAD, REG_SAVE_BASE + i as u8, slot))?;
        }
        Ok(())
    }

    /// Compiles a user-defined function call following the stack-based
    /// calling convention.
    fn compile_call(&mut self, function: FunctionId, name: &str, args: &[FnExpr]) -> ParseResult<u32> {
        let callee = self.registry.get(function);
        let callee_params = callee.parameters.len();
        let callee_return = u32::from(callee.return_size);
        if args.len() != callee_params {
            return Err(self.error(
                ErrorKind::Parse,
                format!(
                    "invalid number of parameters for '{name}': {} supplied, {callee_params} required",
                    args.len()
                ),
            ));
        }

        let spill_count = self.live_saves();
        let spill_base = self.spill_area();
        // the callee's frame base; its return window (if any) comes first
        let callee_base = spill_base + spill_count;
        let call_parameter_sp = callee_base + callee_return;
        let call_sp = call_parameter_sp + callee_params as u32;
        self.bump_stack(call_sp);

        for i in 0..spill_count {
            let slot = self.slot16(spill_base + i)?;
            self.emit(Instruction::one_reg(r1::STORE, REG_SAVE_BASE + i as u8, slot))?;
        }

        let old_level = self.level;
        let old_sp = self.stack_pointer;
        self.level = 1;
        self.stack_pointer = call_sp;

        for (i, arg) in args.iter().enumerate() {
            self.compile_expr(arg)?;
            let slot = self.slot16(call_parameter_sp + i as u32)?;
            self.emit(Instruction::one_reg(r1::STORE, REG_RESULT, slot))?;
        }

        self.level = old_level;
        self.stack_pointer = old_sp;

        let base16 = self.slot16(callee_base)?;
        let fn16 = self.target16(function.index())?;
        self.emit(Instruction::plain(r0::PUSH, base16))?;
        self.emit(Instruction::plain(r0::CALL, fn16))?;
        self.emit(Instruction::plain(r0::POP, base16))?;

        for i in 0..spill_count {
            let slot = self.slot16(spill_base + i)?;
            self.emit(Instruction::one_reg(r1::LOAD, REG_SAVE_BASE + i as u8, slot))?;
        }
        self.compile_parameters()?;

        // where the callee left its return values, for member access
        Ok(callee_base)
    }

    fn compile_member(&mut self, call: &FnExpr, member: FnMember) -> ParseResult<()> {
        let FnExpr::Call { function, name, args } = call else {
            return Err(self.error(
                ErrorKind::Type,
                "member access in a function body requires a vector function call",
            ));
        };
        if self.registry.get(*function).return_size == 0 {
            return Err(self.error(
                ErrorKind::Type,
                format!("function '{name}' does not return a vector; member access is invalid"),
            ));
        }
        let window = self.compile_call(*function, name, args)?;

        match member.window_offset() {
            Some(offset) => {
                let slot = self.slot16(window + u32::from(offset))?;
                self.emit(Instruction::one_reg(r1::LOAD, REG_RESULT, slot))?;
            }
            None => {
                // gray: weighted sum of the three chromatic components
                let red_k = self.constant(RED_INTENSITY)?;
                let green_k = self.constant(GREEN_INTENSITY)?;
                let blue_k = self.constant(BLUE_INTENSITY)?;
                let w0 = self.slot16(window)?;
                let w1 = self.slot16(window + 1)?;
                let w2 = self.slot16(window + 2)?;
                self.emit(Instruction::one_reg(r1::LOAD, REG_OPERAND, w0))?;
                self.emit(Instruction::one_reg(r1::MULI, REG_OPERAND, red_k))?;
                self.emit(Instruction::one_reg(r1::LOAD, REG_RESULT, w1))?;
                self.emit(Instruction::one_reg(r1::MULI, REG_RESULT, green_k))?;
                self.emit(Instruction::two_reg(r2::ADD, REG_RESULT, REG_OPERAND))?;
                self.emit(Instruction::one_reg(r1::LOAD, REG_RESULT, w2))?;
                self.emit(Instruction::one_reg(r1::MULI, REG_RESULT, blue_k))?;
                self.emit(Instruction::two_reg(r2::ADD, REG_OPERAND, REG_RESULT))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    use super::*;
    use crate::function::vm::{VmContext, VmErrorKind};
    use crate::source::{SourcePosition, StreamId};

    fn compile(
        registry: &mut FunctionRegistry,
        params: &[&str],
        body: FnExpr,
    ) -> ParseResult<FunctionId> {
        let parameters: SmallVec<[String; 4]> = params.iter().map(|s| (*s).to_owned()).collect();
        let compiler = FnCompiler::new(
            registry,
            "f",
            "test.pov",
            SourcePosition::start_of(StreamId::new(0)),
            parameters,
        );
        let (code, _warnings) = compiler.compile(&body)?;
        Ok(registry.install(code))
    }

    fn eval(registry: &FunctionRegistry, id: FunctionId, args: &[f64]) -> f64 {
        VmContext::new().run_scalar(registry, id, args).unwrap()
    }

    fn var(name: &str) -> Box<FnExpr> {
        Box::new(FnExpr::Variable(name.to_owned()))
    }

    fn num(v: f64) -> Box<FnExpr> {
        Box::new(FnExpr::Constant(v))
    }

    fn bin(op: FnBinOp, left: Box<FnExpr>, right: Box<FnExpr>) -> Box<FnExpr> {
        FnExpr::Binary { op, left, right }.into()
    }

    #[test]
    fn test_pythagoras() {
        let mut registry = FunctionRegistry::new();
        // sqrt(x*x + y*y)
        let body = FnExpr::Intrinsic1 {
            sys: op::SYS1_SQRT,
            guard_positive: false,
            arg: bin(
                FnBinOp::Add,
                bin(FnBinOp::Mul, var("x"), var("x")),
                bin(FnBinOp::Mul, var("y"), var("y")),
            ),
        };
        let id = compile(&mut registry, &["x", "y"], body).unwrap();
        assert_eq!(eval(&registry, id, &[3.0, 4.0]), 5.0);
    }

    #[test]
    fn test_deep_nesting_spills_to_stack() {
        let mut registry = FunctionRegistry::new();
        // left-leaning tree: every level compiles its left child one level
        // deeper, so six rounds push saves past r5/r6/r7 into stack slots
        let mut body = *var("x");
        for _ in 0..6 {
            body = *bin(FnBinOp::Add, bin(FnBinOp::Mul, Box::new(body), var("x")), var("y"));
        }
        let id = compile(&mut registry, &["x", "y", "z"], body).unwrap();
        let (x, y) = (1.25, 0.5);
        let mut expected = x;
        for _ in 0..6 {
            expected = expected * x + y;
        }
        assert_eq!(eval(&registry, id, &[x, y, 0.0]), expected);
    }

    #[test]
    fn test_divide_by_zero_constant_rejected() {
        let mut registry = FunctionRegistry::new();
        let body = *bin(FnBinOp::Div, var("x"), num(0.0));
        let err = compile(&mut registry, &["x", "y", "z"], body).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Domain);
    }

    #[test]
    fn test_divide_by_zero_at_runtime_traps() {
        let mut registry = FunctionRegistry::new();
        let body = *bin(FnBinOp::Div, num(1.0), var("x"));
        let id = compile(&mut registry, &["x"], body).unwrap();
        let err = VmContext::new().run_scalar(&registry, id, &[0.0]).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::DivisionByZero);
        assert_eq!(eval(&registry, id, &[4.0]), 0.25);
    }

    #[test]
    fn test_pow_expansions() {
        let mut registry = FunctionRegistry::new();
        for exponent in 2..=8u32 {
            let body = *bin(FnBinOp::Pow, var("x"), num(f64::from(exponent)));
            let id = compile(&mut registry, &["x"], body).unwrap();
            let x: f64 = 1.3;
            let expected = x.powi(exponent as i32);
            assert!((eval(&registry, id, &[x]) - expected).abs() < 1e-12, "x^{exponent}");
        }
    }

    #[test]
    fn test_pow_zero_warns_and_folds() {
        let mut registry = FunctionRegistry::new();
        let parameters: SmallVec<[String; 4]> = smallvec!["x".to_owned()];
        let compiler = FnCompiler::new(
            &mut registry,
            "f",
            "test.pov",
            SourcePosition::start_of(StreamId::new(0)),
            parameters,
        );
        let body = *bin(FnBinOp::Pow, var("x"), num(0.0));
        let (code, warnings) = compiler.compile(&body).unwrap();
        assert_eq!(warnings.len(), 1);
        let id = registry.install(code);
        assert_eq!(eval(&registry, id, &[123.0]), 1.0);
    }

    #[test]
    fn test_zero_pow_zero_traps() {
        let mut registry = FunctionRegistry::new();
        let body = *bin(FnBinOp::Pow, var("x"), var("y"));
        let id = compile(&mut registry, &["x", "y"], body).unwrap();
        let err = VmContext::new().run_scalar(&registry, id, &[0.0, 0.0]).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::ZeroPowZero);
        assert_eq!(eval(&registry, id, &[2.0, 10.0]), 1024.0);
    }

    #[test]
    fn test_log_guard() {
        let mut registry = FunctionRegistry::new();
        let body = FnExpr::Intrinsic1 {
            sys: op::SYS1_LN,
            guard_positive: true,
            arg: var("x"),
        };
        let id = compile(&mut registry, &["x"], body).unwrap();
        let err = VmContext::new().run_scalar(&registry, id, &[-1.0]).unwrap_err();
        assert_eq!(err.kind, VmErrorKind::LogOfNonPositive);
        assert!((eval(&registry, id, &[std::f64::consts::E]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_select_three_and_four() {
        let mut registry = FunctionRegistry::new();
        let three = FnExpr::Select(vec![*var("x"), FnExpr::Constant(-1.0), FnExpr::Constant(1.0)]);
        let id3 = compile(&mut registry, &["x"], three).unwrap();
        assert_eq!(eval(&registry, id3, &[-5.0]), -1.0);
        assert_eq!(eval(&registry, id3, &[0.0]), 1.0);
        assert_eq!(eval(&registry, id3, &[5.0]), 1.0);

        let four = FnExpr::Select(vec![
            *var("x"),
            FnExpr::Constant(-1.0),
            FnExpr::Constant(0.0),
            FnExpr::Constant(1.0),
        ]);
        let id4 = compile(&mut registry, &["x"], four).unwrap();
        assert_eq!(eval(&registry, id4, &[-5.0]), -1.0);
        assert_eq!(eval(&registry, id4, &[0.0]), 0.0);
        assert_eq!(eval(&registry, id4, &[5.0]), 1.0);
    }

    #[test]
    fn test_sum_reduction() {
        let mut registry = FunctionRegistry::new();
        // sum(i, 1, x, i) == x*(x+1)/2
        let body = FnExpr::Reduce {
            is_prod: false,
            variable: "i".to_owned(),
            from: num(1.0),
            to: var("x"),
            body: var("i"),
        };
        let id = compile(&mut registry, &["x"], body).unwrap();
        assert_eq!(eval(&registry, id, &[100.0]), 5050.0);
        // empty range: from > to gives the neutral element
        assert_eq!(eval(&registry, id, &[0.0]), 0.0);
    }

    #[test]
    fn test_prod_reduction() {
        let mut registry = FunctionRegistry::new();
        // prod(i, 1, x, i) == x!
        let body = FnExpr::Reduce {
            is_prod: true,
            variable: "i".to_owned(),
            from: num(1.0),
            to: var("x"),
            body: var("i"),
        };
        let id = compile(&mut registry, &["x"], body).unwrap();
        assert_eq!(eval(&registry, id, &[6.0]), 720.0);
        assert_eq!(eval(&registry, id, &[0.0]), 1.0);
    }

    #[test]
    fn test_min_max_chains() {
        let mut registry = FunctionRegistry::new();
        let body = FnExpr::MinMax {
            is_max: false,
            args: vec![*var("x"), *var("y"), *var("z")],
        };
        let id = compile(&mut registry, &["x", "y", "z"], body).unwrap();
        assert_eq!(eval(&registry, id, &[3.0, 1.0, 2.0]), 1.0);

        let body = FnExpr::MinMax {
            is_max: true,
            args: vec![*var("x"), *var("y"), *var("z")],
        };
        let id = compile(&mut registry, &["x", "y", "z"], body).unwrap();
        assert_eq!(eval(&registry, id, &[3.0, 1.0, 2.0]), 3.0);
    }

    #[test]
    fn test_user_call_and_member() {
        let mut registry = FunctionRegistry::new();
        // g(x, y, z) = <y, z, x>
        let g_body = FnExpr::Vector(vec![*var("y"), *var("z"), *var("x")]);
        let g = compile(&mut registry, &["x", "y", "z"], g_body).unwrap();
        // f(x, y, z) = g(x, y, z).y + 100  ->  z + 100
        let f_body = *bin(
            FnBinOp::Add,
            Box::new(FnExpr::Member {
                call: Box::new(FnExpr::Call {
                    function: g,
                    name: "g".to_owned(),
                    args: vec![*var("x"), *var("y"), *var("z")],
                }),
                member: FnMember::Y,
            }),
            num(100.0),
        );
        let f = compile(&mut registry, &["x", "y", "z"], f_body).unwrap();
        assert_eq!(eval(&registry, f, &[1.0, 2.0, 3.0]), 103.0);
    }

    #[test]
    fn test_scalar_call_nested_in_expression() {
        let mut registry = FunctionRegistry::new();
        // h(x) = x * 2
        let h_body = *bin(FnBinOp::Mul, var("x"), num(2.0));
        let h = compile(&mut registry, &["x"], h_body).unwrap();
        // f(x, y, z) = (x + h(y)) * (z - h(x))
        let f_body = *bin(
            FnBinOp::Mul,
            bin(
                FnBinOp::Add,
                var("x"),
                Box::new(FnExpr::Call {
                    function: h,
                    name: "h".to_owned(),
                    args: vec![*var("y")],
                }),
            ),
            bin(
                FnBinOp::Sub,
                var("z"),
                Box::new(FnExpr::Call {
                    function: h,
                    name: "h".to_owned(),
                    args: vec![*var("x")],
                }),
            ),
        );
        let f = compile(&mut registry, &["x", "y", "z"], f_body).unwrap();
        let (x, y, z) = (1.5, 2.0, 10.0);
        assert_eq!(eval(&registry, f, &[x, y, z]), (x + y * 2.0) * (z - x * 2.0));
    }

    #[test]
    fn test_gray_member() {
        let mut registry = FunctionRegistry::new();
        // c(x, y, z) = <x, y, z, 0, 0> as a color
        let c_body = FnExpr::Vector(vec![
            *var("x"),
            *var("y"),
            *var("z"),
            FnExpr::Constant(0.0),
            FnExpr::Constant(0.0),
        ]);
        let c = compile(&mut registry, &["x", "y", "z"], c_body).unwrap();
        let f_body = FnExpr::Member {
            call: Box::new(FnExpr::Call {
                function: c,
                name: "c".to_owned(),
                args: vec![*var("x"), *var("y"), *var("z")],
            }),
            member: FnMember::Gray,
        };
        let f = compile(&mut registry, &["x", "y", "z"], f_body).unwrap();
        let out = eval(&registry, f, &[1.0, 0.5, 0.25]);
        let expected = RED_INTENSITY + 0.5 * GREEN_INTENSITY + 0.25 * BLUE_INTENSITY;
        assert!((out - expected).abs() < 1e-12);
    }

    #[test]
    fn test_comparisons_and_logic() {
        let mut registry = FunctionRegistry::new();
        // (x < y) & (y <= z)
        let body = *bin(
            FnBinOp::And,
            bin(FnBinOp::Lt, var("x"), var("y")),
            bin(FnBinOp::Le, var("y"), var("z")),
        );
        let id = compile(&mut registry, &["x", "y", "z"], body).unwrap();
        assert_eq!(eval(&registry, id, &[1.0, 2.0, 2.0]), 1.0);
        assert_eq!(eval(&registry, id, &[2.0, 2.0, 3.0]), 0.0);

        // x | y normalizes to 0/1
        let body = *bin(FnBinOp::Or, var("x"), var("y"));
        let id = compile(&mut registry, &["x", "y"], body).unwrap();
        assert_eq!(eval(&registry, id, &[0.0, 7.0]), 1.0);
        assert_eq!(eval(&registry, id, &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_default_parameters_are_xyz() {
        let mut registry = FunctionRegistry::new();
        let compiler = FnCompiler::new(
            &mut registry,
            "f",
            "test.pov",
            SourcePosition::start_of(StreamId::new(0)),
            SmallVec::new(),
        );
        let (code, _) = compiler.compile(&FnExpr::Variable("z".to_owned())).unwrap();
        assert_eq!(code.parameters.as_slice(), &["x", "y", "z"]);
        let id = registry.install(code);
        assert_eq!(eval(&registry, id, &[0.0, 0.0, 9.0]), 9.0);
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let mut registry = FunctionRegistry::new();
        let err = compile(&mut registry, &["x"], FnExpr::Variable("nope".to_owned())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Symbol);
    }

    #[test]
    fn test_not_operator() {
        let mut registry = FunctionRegistry::new();
        let body = FnExpr::Not(var("x"));
        let id = compile(&mut registry, &["x"], body).unwrap();
        assert_eq!(eval(&registry, id, &[0.0]), 1.0);
        assert_eq!(eval(&registry, id, &[5.0]), 0.0);
    }
}
