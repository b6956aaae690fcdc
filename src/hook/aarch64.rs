//! AArch64 prologue relocation.
//!
//! Every instruction is 4 bytes, so the prologue is always exactly the four
//! words replaced by `ldr x16, #8 ; br x16 ; .quad dest`. PC-relative forms
//! that can be expressed absolutely (`ADR`, `ADRP`, `B`, `BL`) are rewritten;
//! the conditional and literal-load forms are refused.

use super::{CodePatcher, RelocatedPrologue};
use crate::error::HookError;

const BRANCH_LEN: usize = 16;
const X16: u32 = 16;
const X17: u32 = 17;
const BRK_0: u32 = 0xD420_0000;

// =============================================================================
// Instruction Detection
// =============================================================================

#[inline]
fn is_adr(insn: u32) -> bool {
    (insn & 0x9F00_0000) == 0x1000_0000
}

#[inline]
fn is_adrp(insn: u32) -> bool {
    (insn & 0x9F00_0000) == 0x9000_0000
}

#[inline]
fn is_b(insn: u32) -> bool {
    (insn & 0xFC00_0000) == 0x1400_0000
}

#[inline]
fn is_bl(insn: u32) -> bool {
    (insn & 0xFC00_0000) == 0x9400_0000
}

#[inline]
fn is_ret(insn: u32) -> bool {
    (insn & 0xFFFF_FC1F) == 0xD65F_0000 || insn == 0xD65F_0BFF || insn == 0xD65F_0FFF
}

#[inline]
fn is_br(insn: u32) -> bool {
    (insn & 0xFFFF_FC1F) == 0xD61F_0000
}

#[inline]
fn is_braa(insn: u32) -> bool {
    (insn & 0xFFFF_FC00) == 0xD71F_0800 || (insn & 0xFFFF_FC1F) == 0xD61F_081F
}

#[inline]
fn is_trap(insn: u32) -> bool {
    (insn & 0xFFE0_001F) == 0xD420_0000
}

/// Conditional branches, compare/test-and-branch, and literal loads.
#[inline]
fn is_unrelocatable(insn: u32) -> bool {
    (insn & 0xFF00_0010) == 0x5400_0000
        || (insn & 0x7E00_0000) == 0x3400_0000
        || (insn & 0x7E00_0000) == 0x3600_0000
        || (insn & 0x3B00_0000) == 0x1800_0000
}

#[inline]
fn ends_function(insn: u32) -> bool {
    is_ret(insn) || is_br(insn) || is_braa(insn) || is_b(insn) || is_trap(insn)
}

#[inline]
fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

// =============================================================================
// Encoding
// =============================================================================

#[inline]
fn ldr_literal(rt: u32, offset: i64) -> u32 {
    0x5800_0000 | ((((offset >> 2) as u32) & 0x7FFFF) << 5) | rt
}

#[inline]
fn br(rn: u32) -> u32 {
    0xD61F_0000 | (rn << 5)
}

#[inline]
fn blr(rn: u32) -> u32 {
    0xD63F_0000 | (rn << 5)
}

#[inline]
fn b(offset: i64) -> u32 {
    0x1400_0000 | (((offset >> 2) as u32) & 0x03FF_FFFF)
}

fn push_quad(out: &mut Vec<u32>, value: u64) {
    out.push(value as u32);
    out.push((value >> 32) as u32);
}

fn adr_target(insn: u32, pc: usize) -> u64 {
    let immlo = u64::from((insn >> 29) & 0x3);
    let immhi = u64::from((insn >> 5) & 0x7FFFF);
    let imm = sign_extend((immhi << 2) | immlo, 21);
    if is_adrp(insn) {
        ((pc as u64 & !0xFFF) as i64).wrapping_add(imm << 12) as u64
    } else {
        (pc as i64).wrapping_add(imm) as u64
    }
}

fn branch_target(insn: u32, pc: usize) -> u64 {
    let imm = sign_extend(u64::from(insn & 0x03FF_FFFF), 26) << 2;
    (pc as i64).wrapping_add(imm) as u64
}

/// Append the position-independent equivalent of `insn` (originally at `pc`).
fn relocate(insn: u32, pc: usize, out: &mut Vec<u32>) -> Result<(), HookError> {
    if is_adr(insn) || is_adrp(insn) {
        // ldr xd, #8 ; b #12 ; .quad value
        let rd = insn & 0x1F;
        out.push(ldr_literal(rd, 8));
        out.push(b(12));
        push_quad(out, adr_target(insn, pc));
    } else if is_bl(insn) {
        // ldr x17, #12 ; blr x17 ; b #12 ; .quad dest
        out.push(ldr_literal(X17, 12));
        out.push(blr(X17));
        out.push(b(12));
        push_quad(out, branch_target(insn, pc));
    } else if is_b(insn) {
        out.push(ldr_literal(X16, 8));
        out.push(br(X16));
        push_quad(out, branch_target(insn, pc));
    } else if is_unrelocatable(insn) {
        return Err(HookError::UnsupportedInstruction {
            addr: pc,
            insn: u64::from(insn),
        });
    } else {
        out.push(insn);
    }
    Ok(())
}

fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Arm64Patcher;

impl CodePatcher for Arm64Patcher {
    fn branch_size(&self) -> usize {
        BRANCH_LEN
    }

    fn wants_near_trampoline(&self) -> bool {
        false
    }

    fn encode_branch(&self, _from: usize, to: usize) -> Vec<u8> {
        let mut words = vec![ldr_literal(X16, 8), br(X16)];
        push_quad(&mut words, to as u64);
        to_bytes(&words)
    }

    fn padding(&self, len: usize) -> Vec<u8> {
        to_bytes(&vec![BRK_0; len / 4])
    }

    fn relocate_prologue(
        &self,
        code: &[u8],
        target: usize,
        _trampoline: usize,
    ) -> Result<RelocatedPrologue, HookError> {
        let mut out = Vec::new();
        let mut covered = 0usize;

        while covered < BRANCH_LEN {
            let Some(chunk) = code.get(covered..covered + 4) else {
                return Err(HookError::PrologueTooShort {
                    target,
                    available: covered,
                    required: BRANCH_LEN,
                });
            };
            let insn = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let pc = target + covered;
            covered += 4;
            if ends_function(insn) && covered < BRANCH_LEN {
                return Err(HookError::PrologueTooShort {
                    target,
                    available: covered,
                    required: BRANCH_LEN,
                });
            }
            relocate(insn, pc, &mut out)?;
        }

        Ok(RelocatedPrologue {
            saved_len: covered,
            code: to_bytes(&out),
        })
    }
}
