//! x86-64 prologue relocation.
//!
//! The branch written over a hooked prologue is `jmp qword ptr [rip+0]`
//! followed by the absolute 64-bit destination (14 bytes). It clobbers no
//! registers, which matters for variadic functions that receive a vector
//! count in `al`.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use super::{CodePatcher, RelocatedPrologue};
use crate::error::HookError;

const JMP_ABS_LEN: usize = 14;

#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64Patcher;

impl X86_64Patcher {
    fn ends_function(insn: &Instruction) -> bool {
        matches!(
            insn.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
        )
    }
}

fn raw_bytes(code: &[u8], offset: usize, len: usize) -> u64 {
    code[offset..(offset + len).min(code.len())]
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}

impl CodePatcher for X86_64Patcher {
    fn branch_size(&self) -> usize {
        JMP_ABS_LEN
    }

    fn wants_near_trampoline(&self) -> bool {
        // RIP-relative operands copied into the trampoline need a ±2 GiB displacement.
        true
    }

    fn encode_branch(&self, _from: usize, to: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(JMP_ABS_LEN);
        out.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&(to as u64).to_le_bytes());
        out
    }

    fn padding(&self, len: usize) -> Vec<u8> {
        vec![0xCC; len]
    }

    fn relocate_prologue(
        &self,
        code: &[u8],
        target: usize,
        trampoline: usize,
    ) -> Result<RelocatedPrologue, HookError> {
        let mut decoder = Decoder::with_ip(64, code, target as u64, DecoderOptions::NONE);
        let mut instructions = Vec::new();
        let mut covered = 0usize;

        while covered < JMP_ABS_LEN {
            if !decoder.can_decode() {
                return Err(HookError::PrologueTooShort {
                    target,
                    available: covered,
                    required: JMP_ABS_LEN,
                });
            }
            let insn = decoder.decode();
            if insn.is_invalid() {
                return Err(HookError::UnsupportedInstruction {
                    addr: target + covered,
                    insn: raw_bytes(code, covered, 8),
                });
            }
            covered += insn.len();
            let terminal = Self::ends_function(&insn);
            instructions.push(insn);
            if terminal && covered < JMP_ABS_LEN {
                return Err(HookError::PrologueTooShort {
                    target,
                    available: covered,
                    required: JMP_ABS_LEN,
                });
            }
        }

        let block = InstructionBlock::new(&instructions, trampoline as u64);
        let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE).map_err(|_| {
            HookError::UnsupportedInstruction {
                addr: target,
                insn: raw_bytes(code, 0, covered),
            }
        })?;

        Ok(RelocatedPrologue {
            saved_len: covered,
            code: encoded.code_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // mov rax, rdi ; add rax, 0x10 ; nop x8 ; ret
    const ADD_CONST: [u8; 18] = [
        0x48, 0x89, 0xF8, 0x48, 0x05, 0x10, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0x90, 0x90, 0xC3,
    ];

    #[test]
    fn covers_whole_instructions() {
        let p = X86_64Patcher;
        let r = p.relocate_prologue(&ADD_CONST, 0x1000, 0x2000).unwrap();
        // 3 + 6 + five single-byte nops
        assert_eq!(r.saved_len, 14);
        assert_eq!(r.code, ADD_CONST[..14].to_vec());
    }

    #[test]
    fn never_splits_an_instruction() {
        // endbr64 ; push rbp ; mov rbp, rsp ; sub rsp, 0x20 ; mov eax, 1 ; ret
        let code = [
            0xF3, 0x0F, 0x1E, 0xFA, 0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, 0xB8, 0x01,
            0x00, 0x00, 0x00, 0xC3,
        ];
        let r = X86_64Patcher.relocate_prologue(&code, 0x1000, 0x2000).unwrap();
        assert_eq!(r.saved_len, 17);
    }

    #[test]
    fn short_function_is_rejected() {
        // mov rax, rdi ; ret
        let code = [0x48, 0x89, 0xF8, 0xC3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC];
        let err = X86_64Patcher.relocate_prologue(&code, 0x1000, 0x2000).unwrap_err();
        assert_eq!(
            err,
            HookError::PrologueTooShort {
                target: 0x1000,
                available: 4,
                required: 14
            }
        );
    }

    #[test]
    fn relative_call_keeps_its_destination() {
        // call rel32 (+0x100) ; nop x12
        let mut code = vec![0xE8, 0x00, 0x01, 0x00, 0x00];
        code.extend(std::iter::repeat_n(0x90, 12));
        let target = 0x1000_0000usize;
        let trampoline = 0x1100_0000usize;
        let r = X86_64Patcher.relocate_prologue(&code, target, trampoline).unwrap();

        let mut decoder = Decoder::with_ip(64, &r.code, trampoline as u64, DecoderOptions::NONE);
        let call = decoder.decode();
        assert_eq!(call.near_branch_target(), (target + 5 + 0x100) as u64);
    }

    #[test]
    fn branch_is_absolute() {
        let bytes = X86_64Patcher.encode_branch(0, 0x1122_3344_5566_7788);
        assert_eq!(bytes.len(), 14);
        assert_eq!(&bytes[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(&bytes[6..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }
}
