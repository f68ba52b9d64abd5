//! Cipher program synthesis
//!
//! Each 7-bit seed deterministically selects one program. The seed drives a
//! small pseudo-random generator whose draws pick a recursive expression
//! shape and the variant of every leaf and inner node, filtered through the
//! scheme's permutation tables.
//!
//! Programs are limited to a budget of opcode slots measured in machine
//! code bytes of the engine's native encoding. Synthesis starts at
//! recursion stage 5 and drops one stage each time the budget is exceeded.
//! The generator keeps its state across attempts, so a retry continues the
//! same draw sequence.

use tracing::debug;

use crate::error::SynthesisError;
use crate::program::{Op, Program};
use crate::scheme::CipherScheme;

/// Slot budget of a cipher program
pub const PROGRAM_SLOT_LIMIT: usize = 128;

/// Highest recursion stage attempted
pub const MAX_STAGE: u8 = 5;

/// Pseudo-random generator driving synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramRng {
    /// Linear congruential generator seeded with the program seed
    Lcg {
        /// Current state
        seed: u32,
    },
    /// Dual xorshift generator used by schemes with a random seed
    XorShift {
        /// First state word, starts at the program seed
        x: u32,
        /// Second state word, starts at the scheme's random seed
        y: u32,
    },
}

impl ProgramRng {
    /// Generator for `seed` under a scheme with optional `random_seed`.
    pub fn new(seed: u8, random_seed: Option<u32>) -> Self {
        match random_seed {
            Some(y) => Self::XorShift {
                x: u32::from(seed),
                y,
            },
            None => Self::Lcg {
                seed: u32::from(seed),
            },
        }
    }

    /// Next 32-bit draw.
    pub fn draw(&mut self) -> u32 {
        match self {
            Self::Lcg { seed } => {
                let old = *seed;
                *seed = old.wrapping_mul(1_103_515_245).wrapping_add(12345);
                *seed ^ (old << 16) ^ (old >> 16)
            }
            Self::XorShift { x, y } => {
                let mut s = *x ^ (*x << 17);
                s ^= (s << 18) | (s >> 15);
                *x = !s;

                let mut r = *y ^ (*y << 13);
                r ^= r >> 17;
                *y = r ^ (r << 5);

                *x ^ *y
            }
        }
    }
}

/// Marker for a stage attempt that ran out of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BudgetExceeded;

type Emit = Result<(), BudgetExceeded>;

/// One stage attempt
struct Emitter<'a> {
    scheme: &'a CipherScheme,
    rng: &'a mut ProgramRng,
    ops: Vec<Op>,
    slots: usize,
    limit: usize,
}

impl<'a> Emitter<'a> {
    fn new(scheme: &'a CipherScheme, rng: &'a mut ProgramRng, limit: usize) -> Self {
        Self {
            scheme,
            rng,
            ops: Vec::with_capacity(64),
            slots: 0,
            limit,
        }
    }

    fn charge(&mut self, n: usize) -> Emit {
        if self.slots + n > self.limit {
            return Err(BudgetExceeded);
        }
        self.slots += n;
        Ok(())
    }

    fn op(&mut self, op: Op, cost: usize) -> Emit {
        self.charge(cost)?;
        self.ops.push(op);
        Ok(())
    }

    /// Opcode slots are charged before the operand is drawn, the 4-byte
    /// operand after.
    fn op_imm(&mut self, make: fn(u32) -> Op, cost: usize, operand: Operand) -> Emit {
        self.charge(cost)?;
        let value = match operand {
            Operand::Fixed(v) => v,
            Operand::Random => self.rng.draw(),
            Operand::RandomIndex => self.rng.draw() & 0x3FF,
        };
        self.charge(4)?;
        self.ops.push(make(value));
        Ok(())
    }

    fn program(&mut self, stage: u8) -> Emit {
        self.charge(5)?;
        self.op(Op::MovEdiArg, 4)?;
        self.body(stage)?;
        self.charge(5)?;
        self.op(Op::Retn, 1)
    }

    fn subtree(&mut self, stage: u8) -> Emit {
        if self.rng.draw() & 1 != 0 {
            self.body(stage)
        } else {
            self.body_even(stage)
        }
    }

    /// Two subtrees combined by an odd-branch operation.
    fn body(&mut self, stage: u8) -> Emit {
        if stage == 1 {
            return self.prolog();
        }
        self.op(Op::PushEbx, 1)?;
        self.subtree(stage - 1)?;
        self.op(Op::MovEbxEax, 2)?;
        self.subtree(stage - 1)?;
        self.odd_branch()?;
        self.op(Op::PopEbx, 1)
    }

    /// One subtree followed by an even-branch operation.
    fn body_even(&mut self, stage: u8) -> Emit {
        if stage == 1 {
            return self.prolog();
        }
        self.subtree(stage - 1)?;
        self.even_branch()
    }

    fn prolog(&mut self) -> Emit {
        let choice = self.scheme.prolog_order[(self.rng.draw() % 3) as usize];
        match choice {
            0 => self.op_imm(Op::MovEaxImm, 1, Operand::Random),
            1 => self.op(Op::MovEaxEdi, 2),
            _ => {
                self.charge(5)?;
                self.op_imm(Op::MovEaxImm, 2, Operand::RandomIndex)?;
                self.op(Op::MovEaxIndirect, 0)
            }
        }
    }

    fn even_branch(&mut self) -> Emit {
        let choice = self.scheme.even_branch_order[(self.rng.draw() & 7) as usize];
        match choice {
            0 => self.op(Op::NotEax, 2),
            1 => self.op(Op::DecEax, 1),
            2 => self.op(Op::NegEax, 2),
            3 => self.op(Op::IncEax, 1),
            4 => {
                self.charge(5)?;
                self.op_imm(Op::AndEaxImm, 1, Operand::Fixed(0x3FF))?;
                self.op(Op::MovEaxIndirect, 3)
            }
            5 => {
                self.op(Op::PushEbx, 1)?;
                self.op(Op::MovEbxEax, 2)?;
                self.op_imm(Op::AndEbxImm, 2, Operand::Fixed(0xAAAA_AAAA))?;
                self.op_imm(Op::AndEaxImm, 1, Operand::Fixed(0x5555_5555))?;
                self.op(Op::ShrEbx1, 2)?;
                self.op(Op::ShlEax1, 2)?;
                self.op(Op::OrEaxEbx, 2)?;
                self.op(Op::PopEbx, 1)
            }
            6 => self.op_imm(Op::XorEaxImm, 1, Operand::Random),
            _ => {
                let make: fn(u32) -> Op = if self.rng.draw() & 1 != 0 {
                    Op::AddEaxImm
                } else {
                    Op::SubEaxImm
                };
                self.op_imm(make, 1, Operand::Random)
            }
        }
    }

    fn odd_branch(&mut self) -> Emit {
        let choice = self.scheme.odd_branch_order[(self.rng.draw() % 6) as usize];
        match choice {
            0 | 1 => {
                self.op(Op::PushEcx, 1)?;
                self.op(Op::MovEcxEbx, 2)?;
                self.op(Op::AndEcx0F, 3)?;
                let shift = if choice == 0 { Op::ShrEaxCl } else { Op::ShlEaxCl };
                self.op(shift, 2)?;
                self.op(Op::PopEcx, 1)
            }
            2 => self.op(Op::AddEaxEbx, 2),
            3 => {
                self.op(Op::NegEax, 2)?;
                self.op(Op::AddEaxEbx, 2)
            }
            4 => self.op(Op::ImulEaxEbx, 3),
            _ => self.op(Op::SubEaxEbx, 2),
        }
    }
}

/// Source of an immediate operand
#[derive(Debug, Clone, Copy)]
enum Operand {
    Fixed(u32),
    Random,
    RandomIndex,
}

/// Synthesize the program for `seed` under the standard slot budget.
///
/// The scheme's permutation tables are expected to be valid (see
/// [`CipherScheme::validate`]).
pub fn synthesize(seed: u8, scheme: &CipherScheme) -> Result<Program, SynthesisError> {
    synthesize_with_limit(seed, scheme, PROGRAM_SLOT_LIMIT)
}

/// Synthesize the program for `seed` with an explicit slot budget.
pub fn synthesize_with_limit(
    seed: u8,
    scheme: &CipherScheme,
    limit: usize,
) -> Result<Program, SynthesisError> {
    let mut rng = ProgramRng::new(seed, scheme.random_seed);

    for stage in (1..=MAX_STAGE).rev() {
        let mut emitter = Emitter::new(scheme, &mut rng, limit);
        if emitter.program(stage).is_ok() {
            debug!(
                "Synthesized program for seed {seed:#04x}: stage {stage}, {} ops, {} slots",
                emitter.ops.len(),
                emitter.slots
            );
            return Ok(Program {
                seed,
                stage,
                slots: emitter.slots,
                ops: emitter.ops,
            });
        }
    }

    Err(SynthesisError::ProgramTooLarge { seed, limit })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scheme() -> CipherScheme {
        CipherScheme::new(0x17C, 0x682, [1, 0, 2], [2, 1, 4, 5, 0, 3], [4, 6, 1, 5, 2, 7, 0, 3])
    }

    #[test]
    fn test_lcg_sequence() {
        let mut rng = ProgramRng::new(0, None);
        // seed 0 -> 12345, no old-state mixing
        assert_eq!(rng.draw(), 12345);
        let old = 12345u32;
        let next = old.wrapping_mul(1_103_515_245).wrapping_add(12345);
        assert_eq!(rng.draw(), next ^ (old << 16) ^ (old >> 16));
    }

    #[test]
    fn test_xorshift_uses_both_states() {
        let mut a = ProgramRng::new(1, Some(100));
        let mut b = ProgramRng::new(1, Some(101));
        assert_ne!(a.draw(), b.draw());
    }

    #[test]
    fn test_known_program_seed_0() {
        let prog = synthesize(0, &scheme()).unwrap();
        assert_eq!(prog.stage(), 4);
        assert_eq!(prog.ops().len(), 23);
        assert_eq!(prog.slots(), 76);
        assert_eq!(
            &prog.ops()[..8],
            &[
                Op::MovEdiArg,
                Op::PushEbx,
                Op::MovEaxImm(275),
                Op::MovEaxIndirect,
                Op::DecEax,
                Op::XorEaxImm(4_272_879_678),
                Op::MovEbxEax,
                Op::PushEbx,
            ]
        );
        assert_eq!(prog.ops().last(), Some(&Op::Retn));
    }

    #[test]
    fn test_known_program_shapes() {
        let scheme = scheme();
        let expected = [
            (1u8, 3u8, 20usize, 59usize),
            (3, 5, 29, 80),
            (42, 4, 18, 67),
            (127, 4, 36, 86),
        ];
        for (seed, stage, ops, slots) in expected {
            let prog = synthesize(seed, &scheme).unwrap();
            assert_eq!(
                (prog.stage(), prog.ops().len(), prog.slots()),
                (stage, ops, slots),
                "seed {seed}"
            );
        }
    }

    #[test]
    fn test_xorshift_program_shapes() {
        let scheme = scheme().with_random_seed(0x2D6E_7A3C);
        let prog = synthesize(0, &scheme).unwrap();
        assert_eq!((prog.stage(), prog.ops().len(), prog.slots()), (4, 28, 75));
        let prog = synthesize(5, &scheme).unwrap();
        assert_eq!((prog.stage(), prog.ops().len(), prog.slots()), (5, 19, 59));
    }

    #[test]
    fn test_exhausted_budget() {
        // Even a stage-1 program needs more than 16 slots
        let err = synthesize_with_limit(0, &scheme(), 16).unwrap_err();
        assert_eq!(err, SynthesisError::ProgramTooLarge { seed: 0, limit: 16 });
    }

    #[test]
    fn test_tight_budget_falls_back_to_stage_1() {
        let prog = synthesize_with_limit(0, &scheme(), 18).unwrap();
        assert_eq!((prog.stage(), prog.ops().len(), prog.slots()), (1, 3, 17));
    }

    #[test]
    fn test_all_seeds_fit_and_balance() {
        let scheme = scheme();
        for seed in 0..0x80u8 {
            let prog = synthesize(seed, &scheme).unwrap();
            assert!(prog.slots() <= PROGRAM_SLOT_LIMIT);
            let pushes = prog
                .ops()
                .iter()
                .filter(|op| matches!(op, Op::PushEbx | Op::PushEcx))
                .count();
            let pops = prog
                .ops()
                .iter()
                .filter(|op| matches!(op, Op::PopEbx | Op::PopEcx))
                .count();
            assert_eq!(pushes, pops, "seed {seed}");
        }
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn synthesis_is_deterministic(seed in 0u8..0x80, random_seed in proptest::option::of(any::<u32>())) {
                let mut scheme = scheme();
                scheme.random_seed = random_seed;
                let a = synthesize(seed, &scheme);
                let b = synthesize(seed, &scheme);
                prop_assert_eq!(a, b);
            }
        }
    }
}
