//! Packed VM instructions and their decoded form.
//!
//! An [`Instruction`] is two halfwords: a 10-bit operation word that folds
//! up to two 3-bit register indices into its low bits, and a 16-bit
//! immediate `k` (constant-pool index, stack slot, branch target, called
//! function, or system-call index).
//!
//! The operation space is split by range so decoding needs no tables:
//!
//! - `word < 0x1C0`: two-register ops; opcode in bits 6..10, `rs` in bits
//!   3..6, `rd` in bits 0..3.
//! - `0x1C0 <= word < 0x250`: one-register ops; opcode in bits 3..10, `rd`
//!   in bits 0..3.
//! - `word >= 0x250`: register-free ops; the word is the opcode.

use serde::{Deserialize, Serialize};

/// Register indices are 0..8.
pub type Reg = u8;

/// Base values for the two-register ops (`r[rd] = r[rd] op r[rs]`, plus
/// MOVE and CMP).
pub mod r2 {
    pub const ADD: u16 = 0x000;
    pub const SUB: u16 = 0x040;
    pub const MUL: u16 = 0x080;
    pub const DIV: u16 = 0x0C0;
    pub const MOVE: u16 = 0x100;
    pub const CMP: u16 = 0x140;
    pub const LIMIT: u16 = 0x1C0;
}

/// Base values for the one-register ops.
pub mod r1 {
    pub const NEG: u16 = 0x1C0;
    pub const ABS: u16 = 0x1C8;
    /// `r[rd] = (r[rd] == 0.0) as f64`
    pub const TEQ: u16 = 0x1D0;
    /// `r[rd] = (r[rd] != 0.0) as f64`
    pub const TNE: u16 = 0x1D8;
    pub const ADDI: u16 = 0x1E0;
    pub const SUBI: u16 = 0x1E8;
    pub const MULI: u16 = 0x1F0;
    pub const LOADI: u16 = 0x1F8;
    pub const CMPI: u16 = 0x200;
    pub const SEQ: u16 = 0x208;
    pub const SNE: u16 = 0x210;
    pub const SLT: u16 = 0x218;
    pub const SLE: u16 = 0x220;
    pub const SGT: u16 = 0x228;
    pub const SGE: u16 = 0x230;
    pub const LOAD: u16 = 0x238;
    pub const STORE: u16 = 0x240;
    pub const LIMIT: u16 = 0x250;
}

/// Values for the register-free ops.
pub mod r0 {
    pub const NOP: u16 = 0x250;
    pub const JMP: u16 = 0x251;
    pub const BEQ: u16 = 0x252;
    pub const BNE: u16 = 0x253;
    pub const BLT: u16 = 0x254;
    pub const BLE: u16 = 0x255;
    pub const BGT: u16 = 0x256;
    pub const BGE: u16 = 0x257;
    /// Trap when r0 is zero (division guard).
    pub const XEQ: u16 = 0x258;
    /// Trap when r0 is non-positive (logarithm guard).
    pub const XLE: u16 = 0x259;
    /// Trap when both r0 and r1 are zero (`0 ** 0` guard).
    pub const XDZ: u16 = 0x25A;
    pub const SYS1: u16 = 0x25B;
    pub const SYS2: u16 = 0x25C;
    pub const TRAP: u16 = 0x25D;
    pub const TRAPS: u16 = 0x25E;
    pub const GROW: u16 = 0x25F;
    pub const PUSH: u16 = 0x260;
    pub const POP: u16 = 0x261;
    pub const CALL: u16 = 0x262;
    pub const RTS: u16 = 0x263;
    pub const LIMIT: u16 = 0x264;
}

/// One packed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    word: u16,
    k: u16,
}

impl Instruction {
    /// Packs a two-register instruction.
    ///
    /// # Panics
    /// Panics on a base outside the two-register range or a register
    /// index above 7; both indicate a compiler bug, not user input.
    #[must_use]
    pub fn two_reg(base: u16, rs: Reg, rd: Reg) -> Self {
        assert!(base < r2::LIMIT && base & 0x3F == 0, "bad two-register base {base:#x}");
        assert!(rs < 8 && rd < 8, "register index out of range");
        Self {
            word: base | (u16::from(rs) << 3) | u16::from(rd),
            k: 0,
        }
    }

    /// Packs a one-register instruction with an immediate.
    #[must_use]
    pub fn one_reg(base: u16, rd: Reg, k: u16) -> Self {
        assert!(
            (r2::LIMIT..r1::LIMIT).contains(&base) && base & 0x7 == 0,
            "bad one-register base {base:#x}"
        );
        assert!(rd < 8, "register index out of range");
        Self {
            word: base | u16::from(rd),
            k,
        }
    }

    /// Packs a register-free instruction with an immediate.
    #[must_use]
    pub fn plain(word: u16, k: u16) -> Self {
        assert!((r1::LIMIT..r0::LIMIT).contains(&word), "bad plain op {word:#x}");
        Self { word, k }
    }

    #[inline]
    #[must_use]
    pub fn k(self) -> u16 {
        self.k
    }

    /// Decodes the packed word.
    #[inline]
    #[must_use]
    pub fn decode(self) -> Op {
        let word = self.word;
        if word < r2::LIMIT {
            let rs = ((word >> 3) & 7) as Reg;
            let rd = (word & 7) as Reg;
            match word & 0x3C0 {
                r2::ADD => Op::Add(rs, rd),
                r2::SUB => Op::Sub(rs, rd),
                r2::MUL => Op::Mul(rs, rd),
                r2::DIV => Op::Div(rs, rd),
                r2::MOVE => Op::Move(rs, rd),
                r2::CMP => Op::Cmp(rs, rd),
                _ => Op::Invalid(word),
            }
        } else if word < r1::LIMIT {
            let rd = (word & 7) as Reg;
            let k = self.k;
            match word & !7 {
                r1::NEG => Op::Neg(rd),
                r1::ABS => Op::Abs(rd),
                r1::TEQ => Op::Teq(rd),
                r1::TNE => Op::Tne(rd),
                r1::ADDI => Op::Addi(rd, k),
                r1::SUBI => Op::Subi(rd, k),
                r1::MULI => Op::Muli(rd, k),
                r1::LOADI => Op::Loadi(rd, k),
                r1::CMPI => Op::Cmpi(rd, k),
                r1::SEQ => Op::Seq(rd),
                r1::SNE => Op::Sne(rd),
                r1::SLT => Op::Slt(rd),
                r1::SLE => Op::Sle(rd),
                r1::SGT => Op::Sgt(rd),
                r1::SGE => Op::Sge(rd),
                r1::LOAD => Op::Load(rd, k),
                r1::STORE => Op::Store(rd, k),
                _ => Op::Invalid(word),
            }
        } else {
            let k = self.k;
            match word {
                r0::NOP => Op::Nop,
                r0::JMP => Op::Jmp(k),
                r0::BEQ => Op::Beq(k),
                r0::BNE => Op::Bne(k),
                r0::BLT => Op::Blt(k),
                r0::BLE => Op::Ble(k),
                r0::BGT => Op::Bgt(k),
                r0::BGE => Op::Bge(k),
                r0::XEQ => Op::Xeq,
                r0::XLE => Op::Xle,
                r0::XDZ => Op::Xdz,
                r0::SYS1 => Op::Sys1(k),
                r0::SYS2 => Op::Sys2(k),
                r0::TRAP => Op::Trap(k),
                r0::TRAPS => Op::Traps(k),
                r0::GROW => Op::Grow(k),
                r0::PUSH => Op::Push(k),
                r0::POP => Op::Pop(k),
                r0::CALL => Op::Call(k),
                r0::RTS => Op::Rts,
                _ => Op::Invalid(word),
            }
        }
    }
}

/// Decoded instruction, what the dispatch loop matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add(Reg, Reg),
    Sub(Reg, Reg),
    Mul(Reg, Reg),
    Div(Reg, Reg),
    Move(Reg, Reg),
    Cmp(Reg, Reg),
    Neg(Reg),
    Abs(Reg),
    Teq(Reg),
    Tne(Reg),
    Addi(Reg, u16),
    Subi(Reg, u16),
    Muli(Reg, u16),
    Loadi(Reg, u16),
    Cmpi(Reg, u16),
    Seq(Reg),
    Sne(Reg),
    Slt(Reg),
    Sle(Reg),
    Sgt(Reg),
    Sge(Reg),
    Load(Reg, u16),
    Store(Reg, u16),
    Nop,
    Jmp(u16),
    Beq(u16),
    Bne(u16),
    Blt(u16),
    Ble(u16),
    Bgt(u16),
    Bge(u16),
    Xeq,
    Xle,
    Xdz,
    Sys1(u16),
    Sys2(u16),
    Trap(u16),
    Traps(u16),
    Grow(u16),
    Push(u16),
    Pop(u16),
    Call(u16),
    Rts,
    /// Unused encoding; executing it is a VM error.
    Invalid(u16),
}

/// One-argument system calls, indexed by the `k` of `SYS1`.
pub const SYS1_TABLE: &[(&str, fn(f64) -> f64)] = &[
    ("sin", f64::sin),
    ("cos", f64::cos),
    ("tan", f64::tan),
    ("asin", f64::asin),
    ("acos", f64::acos),
    ("atan", f64::atan),
    ("sinh", f64::sinh),
    ("cosh", f64::cosh),
    ("tanh", f64::tanh),
    ("asinh", f64::asinh),
    ("acosh", f64::acosh),
    ("atanh", f64::atanh),
    ("int", f64::trunc),
    ("floor", f64::floor),
    ("ceil", f64::ceil),
    ("sqrt", f64::sqrt),
    ("exp", f64::exp),
    ("ln", f64::ln),
    ("log", f64::log10),
];

pub const SYS1_SIN: u16 = 0;
pub const SYS1_COS: u16 = 1;
pub const SYS1_TAN: u16 = 2;
pub const SYS1_ASIN: u16 = 3;
pub const SYS1_ACOS: u16 = 4;
pub const SYS1_ATAN: u16 = 5;
pub const SYS1_SINH: u16 = 6;
pub const SYS1_COSH: u16 = 7;
pub const SYS1_TANH: u16 = 8;
pub const SYS1_ASINH: u16 = 9;
pub const SYS1_ACOSH: u16 = 10;
pub const SYS1_ATANH: u16 = 11;
pub const SYS1_INT: u16 = 12;
pub const SYS1_FLOOR: u16 = 13;
pub const SYS1_CEIL: u16 = 14;
pub const SYS1_SQRT: u16 = 15;
pub const SYS1_EXP: u16 = 16;
pub const SYS1_LN: u16 = 17;
pub const SYS1_LOG: u16 = 18;

/// Two-argument system calls, indexed by the `k` of `SYS2`.
pub const SYS2_TABLE: &[(&str, fn(f64, f64) -> f64)] = &[
    ("pow", f64::powf),
    ("atan2", f64::atan2),
    ("mod", |a, b| a % b),
    ("div", |a, b| (a / b).trunc()),
];

pub const SYS2_POW: u16 = 0;
pub const SYS2_ATAN2: u16 = 1;
pub const SYS2_MOD: u16 = 2;
pub const SYS2_DIV: u16 = 3;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_two_reg_round_trip() {
        let i = Instruction::two_reg(r2::MUL, 1, 0);
        assert_eq!(i.decode(), Op::Mul(1, 0));
        let i = Instruction::two_reg(r2::MOVE, 5, 7);
        assert_eq!(i.decode(), Op::Move(5, 7));
    }

    #[test]
    fn test_one_reg_round_trip() {
        let i = Instruction::one_reg(r1::ADDI, 5, 1234);
        assert_eq!(i.decode(), Op::Addi(5, 1234));
        let i = Instruction::one_reg(r1::STORE, 0, 7);
        assert_eq!(i.decode(), Op::Store(0, 7));
    }

    #[test]
    fn test_plain_round_trip() {
        let i = Instruction::plain(r0::CALL, 3);
        assert_eq!(i.decode(), Op::Call(3));
        let i = Instruction::plain(r0::RTS, 0);
        assert_eq!(i.decode(), Op::Rts);
    }

    #[test]
    fn test_sys_tables_consistent() {
        assert_eq!(SYS1_TABLE[SYS1_SQRT as usize].0, "sqrt");
        assert_eq!(SYS1_TABLE[SYS1_LOG as usize].0, "log");
        assert_eq!(SYS2_TABLE[SYS2_MOD as usize].0, "mod");
        assert_eq!(SYS1_TABLE.len(), 19);
    }

    #[test]
    fn test_ranges_do_not_overlap() {
        assert!(r2::LIMIT <= r1::NEG);
        assert!(r1::LIMIT <= r0::NOP);
        assert!(r0::LIMIT < 0x400, "operation space exceeds 10 bits");
    }
}
