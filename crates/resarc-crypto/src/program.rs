//! Cipher program representation and interpreter
//!
//! A program is a straight-line list of register operations over an
//! accumulator (`eax`), a secondary register (`ebx`), a shift counter
//! (`ecx`), the input argument (`edi`) and a value stack. Programs are
//! produced by [`crate::synth`] and are pure functions of their input.

use std::fmt;

use crate::control_block::ControlBlock;
use crate::error::SynthesisError;

/// A single cipher program operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Load the program input into `edi`
    MovEdiArg,
    /// Push `ebx`
    PushEbx,
    /// Pop into `ebx`
    PopEbx,
    /// Push `ecx`
    PushEcx,
    /// Pop into `ecx`
    PopEcx,
    /// `ebx = eax`
    MovEbxEax,
    /// `eax = ebx`
    MovEaxEbx,
    /// `eax = edi`
    MovEaxEdi,
    /// `ecx = ebx`
    MovEcxEbx,
    /// `ecx &= 0x0F`
    AndEcx0F,
    /// `ebx >>= 1`
    ShrEbx1,
    /// `eax <<= 1`
    ShlEax1,
    /// `eax >>= cl`
    ShrEaxCl,
    /// `eax <<= cl`
    ShlEaxCl,
    /// `eax |= ebx`
    OrEaxEbx,
    /// `eax = !eax`
    NotEax,
    /// `eax = -eax`
    NegEax,
    /// `eax -= 1`
    DecEax,
    /// `eax += 1`
    IncEax,
    /// `eax += ebx`
    AddEaxEbx,
    /// `eax -= ebx`
    SubEaxEbx,
    /// `eax *= ebx` (signed, low 32 bits)
    ImulEaxEbx,
    /// `eax += imm`
    AddEaxImm(u32),
    /// `eax -= imm`
    SubEaxImm(u32),
    /// `ebx &= imm`
    AndEbxImm(u32),
    /// `eax &= imm`
    AndEaxImm(u32),
    /// `eax ^= imm`
    XorEaxImm(u32),
    /// `eax = imm`
    MovEaxImm(u32),
    /// `eax = !control_block[eax]`
    MovEaxIndirect,
    /// Return `eax`
    Retn,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MovEdiArg => write!(f, "mov edi, [arg]"),
            Self::PushEbx => write!(f, "push ebx"),
            Self::PopEbx => write!(f, "pop ebx"),
            Self::PushEcx => write!(f, "push ecx"),
            Self::PopEcx => write!(f, "pop ecx"),
            Self::MovEbxEax => write!(f, "mov ebx, eax"),
            Self::MovEaxEbx => write!(f, "mov eax, ebx"),
            Self::MovEaxEdi => write!(f, "mov eax, edi"),
            Self::MovEcxEbx => write!(f, "mov ecx, ebx"),
            Self::AndEcx0F => write!(f, "and ecx, 0Fh"),
            Self::ShrEbx1 => write!(f, "shr ebx, 1"),
            Self::ShlEax1 => write!(f, "shl eax, 1"),
            Self::ShrEaxCl => write!(f, "shr eax, cl"),
            Self::ShlEaxCl => write!(f, "shl eax, cl"),
            Self::OrEaxEbx => write!(f, "or eax, ebx"),
            Self::NotEax => write!(f, "not eax"),
            Self::NegEax => write!(f, "neg eax"),
            Self::DecEax => write!(f, "dec eax"),
            Self::IncEax => write!(f, "inc eax"),
            Self::AddEaxEbx => write!(f, "add eax, ebx"),
            Self::SubEaxEbx => write!(f, "sub eax, ebx"),
            Self::ImulEaxEbx => write!(f, "imul eax, ebx"),
            Self::AddEaxImm(v) => write!(f, "add eax, {v:08X}h"),
            Self::SubEaxImm(v) => write!(f, "sub eax, {v:08X}h"),
            Self::AndEbxImm(v) => write!(f, "and ebx, {v:08X}h"),
            Self::AndEaxImm(v) => write!(f, "and eax, {v:08X}h"),
            Self::XorEaxImm(v) => write!(f, "xor eax, {v:08X}h"),
            Self::MovEaxImm(v) => write!(f, "mov eax, {v:08X}h"),
            Self::MovEaxIndirect => write!(f, "mov eax, ~[block + eax*4]"),
            Self::Retn => write!(f, "retn"),
        }
    }
}

/// A synthesized cipher program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub(crate) seed: u8,
    pub(crate) stage: u8,
    pub(crate) slots: usize,
    pub(crate) ops: Vec<Op>,
}

impl Program {
    /// Seed this program was synthesized from
    pub fn seed(&self) -> u8 {
        self.seed
    }

    /// Recursion depth that fit the slot budget
    pub fn stage(&self) -> u8 {
        self.stage
    }

    /// Opcode slots consumed, in machine-code bytes
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Operations in execution order
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Run the program on `input`.
    pub fn execute(&self, block: &ControlBlock, input: u32) -> Result<u32, SynthesisError> {
        let mut eax = 0u32;
        let mut ebx = 0u32;
        let mut ecx = 0u32;
        let mut edi = 0u32;
        let mut stack: Vec<u32> = Vec::with_capacity(8);

        for op in &self.ops {
            match *op {
                Op::MovEdiArg => edi = input,
                Op::PushEbx => stack.push(ebx),
                Op::PopEbx => ebx = stack.pop().ok_or(SynthesisError::StackUnderflow)?,
                Op::PushEcx => stack.push(ecx),
                Op::PopEcx => ecx = stack.pop().ok_or(SynthesisError::StackUnderflow)?,
                Op::MovEbxEax => ebx = eax,
                Op::MovEaxEbx => eax = ebx,
                Op::MovEaxEdi => eax = edi,
                Op::MovEcxEbx => ecx = ebx,
                Op::AndEcx0F => ecx &= 0x0F,
                Op::ShrEbx1 => ebx >>= 1,
                Op::ShlEax1 => eax <<= 1,
                Op::ShrEaxCl => eax = eax.wrapping_shr(ecx),
                Op::ShlEaxCl => eax = eax.wrapping_shl(ecx),
                Op::OrEaxEbx => eax |= ebx,
                Op::NotEax => eax = !eax,
                Op::NegEax => eax = eax.wrapping_neg(),
                Op::DecEax => eax = eax.wrapping_sub(1),
                Op::IncEax => eax = eax.wrapping_add(1),
                Op::AddEaxEbx => eax = eax.wrapping_add(ebx),
                Op::SubEaxEbx => eax = eax.wrapping_sub(ebx),
                Op::ImulEaxEbx => eax = eax.wrapping_mul(ebx),
                Op::AddEaxImm(v) => eax = eax.wrapping_add(v),
                Op::SubEaxImm(v) => eax = eax.wrapping_sub(v),
                Op::AndEbxImm(v) => ebx &= v,
                Op::AndEaxImm(v) => eax &= v,
                Op::XorEaxImm(v) => eax ^= v,
                Op::MovEaxImm(v) => eax = v,
                Op::MovEaxIndirect => {
                    let word = block
                        .get(eax)
                        .ok_or(SynthesisError::TableIndexOutOfRange(eax))?;
                    eax = !word;
                }
                Op::Retn => {
                    if !stack.is_empty() {
                        return Err(SynthesisError::UnbalancedStack(stack.len()));
                    }
                    return Ok(eax);
                }
            }
        }

        Err(SynthesisError::MissingReturn)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "; seed {:#04x}, stage {}, {} slots",
            self.seed, self.stage, self.slots
        )?;
        for op in &self.ops {
            writeln!(f, "    {op}")?;
        }
        Ok(())
    }
}
