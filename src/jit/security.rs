//! Constant blinding and NOP insertion
//!
//! Runs over the LIR stream right before encoding. Immediates an attacker
//! could use as gadgets are split into `imm ^ key` plus an `xor key`, and
//! random-length NOPs shift instruction addresses. Neither transformation
//! changes what the code computes.

use super::lir::{Imm, LirInstr, LirOp};
use crate::config::SecurityConfig;
use crate::runtime::FunctionId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// What the pass did to one function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStats {
    pub constants_blinded: u32,
    pub nops_inserted: u32,
    pub nop_bytes: u32,
}

/// A byte worth hiding: anything but all-zeros or all-ones
pub fn is_byte_set(byte: u8) -> bool {
    byte != 0x00 && byte != 0xFF
}

/// Number of set bytes in the low `width` bytes of `bits`
pub fn get_byte_count(bits: u64, width: u32) -> u32 {
    bits.to_le_bytes()
        .iter()
        .take(width as usize)
        .filter(|b| is_byte_set(**b))
        .count() as u32
}

fn should_blind(imm: &Imm, config: &SecurityConfig) -> bool {
    imm.width() > 0 && get_byte_count(imm.bits, imm.width()) >= config.min_set_bytes
}

/// RNG for one compilation: a pure function of the context cookie and the
/// function, so in-process and remote compiles of the same item agree
pub fn rng_for(cookie: u64, function: FunctionId) -> StdRng {
    StdRng::seed_from_u64(cookie ^ (function.0 as u64).rotate_left(32))
}

/// Replace blindable immediates with an atomic `mov imm^key; xor key` pair
pub fn blind_constants(instrs: Vec<LirInstr>, config: &SecurityConfig, rng: &mut StdRng, stats: &mut SecurityStats) -> Vec<LirInstr> {
    let mut out = Vec::with_capacity(instrs.len());
    for instr in instrs {
        let LirOp::MovImm { dst, imm } = instr.op else {
            out.push(instr);
            continue;
        };
        if !should_blind(&imm, config) {
            out.push(instr);
            continue;
        }
        let mut key = 0;
        while key == 0 {
            key = rng.gen::<u64>() & imm.mask();
        }
        out.push(LirInstr {
            op: LirOp::MovImm {
                dst,
                imm: Imm {
                    tag: imm.tag,
                    bits: imm.bits ^ key,
                },
            },
            offset: instr.offset,
            frame: instr.frame,
            atomic: true,
        });
        out.push(LirInstr::new(
            LirOp::XorImm {
                dst,
                tag: imm.tag,
                key,
            },
            instr.offset,
            instr.frame,
        ));
        stats.constants_blinded += 1;
    }
    out
}

/// Whether a NOP may go between `prev` and `next`
fn is_safe_boundary(prev: &LirInstr, next: Option<&LirInstr>) -> bool {
    if prev.atomic || prev.op.is_call() {
        return false;
    }
    next.is_some_and(|n| !n.op.is_return())
}

/// Insert random-length NOPs at safe boundaries
pub fn insert_nops(instrs: Vec<LirInstr>, config: &SecurityConfig, rng: &mut StdRng, stats: &mut SecurityStats) -> Vec<LirInstr> {
    let mut out = Vec::with_capacity(instrs.len() + instrs.len() / config.nop_frequency.max(1) as usize);
    let mut iter = instrs.into_iter().peekable();
    while let Some(instr) = iter.next() {
        let safe = is_safe_boundary(&instr, iter.peek());
        let (offset, frame) = (instr.offset, instr.frame);
        out.push(instr);
        if safe && rng.gen_ratio(1, config.nop_frequency.max(1)) {
            let len = rng.gen_range(1..=config.max_nop_length.max(1));
            out.push(LirInstr::new(LirOp::Nop { len }, offset, frame));
            stats.nops_inserted += 1;
            stats.nop_bytes += len as u32;
        }
    }
    out
}

/// Run every enabled hardening step
pub fn harden(instrs: Vec<LirInstr>, config: &SecurityConfig, cookie: u64, function: FunctionId) -> (Vec<LirInstr>, SecurityStats) {
    let mut rng = rng_for(cookie, function);
    let mut stats = SecurityStats::default();
    let mut instrs = instrs;
    if config.constant_blinding {
        instrs = blind_constants(instrs, config, &mut rng, &mut stats);
    }
    if config.nop_insertion {
        instrs = insert_nops(instrs, config, &mut rng, &mut stats);
    }
    trace!(
        function = %function,
        blinded = stats.constants_blinded,
        nops = stats.nops_inserted,
        "Hardened"
    );
    (instrs, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::lir::{ImmTag, Loc};

    fn at(op: LirOp) -> LirInstr {
        LirInstr::new(op, 0, 0)
    }

    #[test]
    fn test_byte_counting() {
        assert!(!is_byte_set(0x00));
        assert!(!is_byte_set(0xFF));
        assert!(is_byte_set(0x41));
        assert_eq!(get_byte_count(0x0000_00FF, 4), 0);
        assert_eq!(get_byte_count(0x1234_0000, 4), 2);
        assert_eq!(get_byte_count(0x1234_5678_0000_0000, 4), 0);
    }

    #[test]
    fn test_blinding_pairs_are_atomic_and_reversible() {
        let config = SecurityConfig::default();
        let mut rng = rng_for(7, FunctionId(1));
        let mut stats = SecurityStats::default();
        let imm = Imm::int(0x1234_5678);
        let out = blind_constants(
            vec![at(LirOp::MovImm { dst: Loc::Gpr(0), imm }), at(LirOp::MovImm { dst: Loc::Gpr(1), imm: Imm::int(1) })],
            &config,
            &mut rng,
            &mut stats,
        );
        assert_eq!(stats.constants_blinded, 1);
        assert_eq!(out.len(), 3);
        assert!(out[0].atomic);
        match (&out[0].op, &out[1].op) {
            (LirOp::MovImm { imm: masked, .. }, LirOp::XorImm { key, tag, .. }) => {
                assert_eq!(*tag, ImmTag::Int);
                assert_ne!(masked.bits, imm.bits);
                assert_eq!(masked.bits ^ key, imm.bits);
                assert_eq!(masked.bits & !imm.mask(), 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nops_respect_boundaries() {
        let config = SecurityConfig {
            nop_frequency: 1,
            ..SecurityConfig::default()
        };
        let mut rng = rng_for(3, FunctionId(0));
        let mut stats = SecurityStats::default();
        let mut pair = at(LirOp::MovImm { dst: Loc::Gpr(0), imm: Imm::int(5) });
        pair.atomic = true;
        let call = at(LirOp::CallHelper {
            helper: crate::jit::lir::Helper::CallDirect {
                target: FunctionId(2),
                has_this: false,
            },
            dst: Some(Loc::Gpr(1)),
            args: vec![],
        });
        let out = insert_nops(
            vec![
                pair,
                at(LirOp::XorImm { dst: Loc::Gpr(0), tag: ImmTag::Int, key: 1 }),
                call,
                at(LirOp::Mov { dst: Loc::Gpr(2), src: Loc::Gpr(1) }),
                at(LirOp::Ret { src: Loc::Gpr(2) }),
            ],
            &config,
            &mut rng,
            &mut stats,
        );
        let kinds: Vec<bool> = out.iter().map(|i| matches!(i.op, LirOp::Nop { .. })).collect();
        // Only the boundary after the xor is eligible
        assert_eq!(kinds, vec![false, false, true, false, false, false]);
        assert_eq!(stats.nops_inserted, 1);
    }

    #[test]
    fn test_same_seed_same_output() {
        let config = SecurityConfig::default();
        let input: Vec<LirInstr> = (0..20)
            .map(|i| at(LirOp::MovImm { dst: Loc::Gpr(0), imm: Imm::int(0x0101_0101 * i) }))
            .collect();
        let a = harden(input.clone(), &config, 99, FunctionId(4));
        let b = harden(input, &config, 99, FunctionId(4));
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }
}
