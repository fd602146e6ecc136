use iced_x86::{BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, InstructionBlock};

use crate::error::{Error, Result};

/// `jmp qword ptr [rip+0]; dq target` / `call qword ptr [rip+0]; dq target`:
/// the same no-scratch-register indirection the jumper uses, reused here so
/// the generated stub never has to pick (and therefore clobber) a register
/// to hold a jump or call target.
fn indirect_shellcode(opcode_modrm: [u8; 2], target: u64) -> [u8; 14] {
    let mut code = [0u8; 14];
    code[0] = opcode_modrm[0];
    code[1] = opcode_modrm[1];
    code[6..14].copy_from_slice(&target.to_le_bytes());
    code
}

fn jmp_abs(target: u64) -> [u8; 14] {
    indirect_shellcode([0xff, 0x25], target)
}

fn call_abs(target: u64) -> [u8; 14] {
    indirect_shellcode([0xff, 0x15], target)
}

/// `mov r64, imm64`, REX.W + `B8+r` with no ModRM (this form always encodes
/// the destination register directly in the opcode byte).
fn mov_imm64(dest_is_extended: bool, dest_low3: u8, imm: u64) -> Vec<u8> {
    let rex = 0x48 | if dest_is_extended { 0x01 } else { 0x00 };
    let mut v = vec![rex, 0xb8 + dest_low3];
    v.extend_from_slice(&imm.to_le_bytes());
    v
}

fn mov_rdi_imm64(imm: u64) -> Vec<u8> {
    mov_imm64(false, 7, imm)
}

fn mov_rax_imm64(imm: u64) -> Vec<u8> {
    mov_imm64(false, 0, imm)
}

fn mov_rsi_from_r11() -> Vec<u8> {
    // mov rsi, r11 -- dest rsi (reg field, not extended), src r11 (rm field,
    // extended by REX.B). 48 89 DE.
    vec![0x4c, 0x89, 0xde]
}

fn mov_mem_r11_from_rax() -> Vec<u8> {
    // mov [r11], rax -- dest [r11] (rm field, mod=00, extended by REX.B),
    // src rax (reg field, not extended). 49 89 03.
    vec![0x49, 0x89, 0x03]
}

/// Saves the pre-call stack pointer into r11 (caller-saved scratch, so it
/// needs no save/restore of its own), pushes flags and the remaining
/// caller-saved integer registers, calls `on_enter(callee, sp)`, overwrites
/// the return-address slot at `[r11]` with the exit stub's address (4.C step
/// 4 -- `r11` still holds the pre-call `rsp`, which is exactly that slot),
/// then restores everything. r11 is deliberately excluded from the
/// push/pop set: its value is still live right up until the overwrite, and
/// nothing downstream depends on it surviving past this stub. rax is reused
/// as a scratch register for the overwrite after the call returns, since its
/// pre-call value is already saved on the stack and the following `pop rax`
/// restores it untouched.
fn entry_stub(callee: u64, on_enter: u64, exit_stub_addr: u64) -> Vec<u8> {
    let mut v = Vec::new();
    v.push(0x4c);
    v.push(0x89);
    v.push(0xe3); // mov r11, rsp
    v.push(0x9c); // pushfq
    v.extend_from_slice(&[0x50, 0x51, 0x52, 0x56, 0x57]); // push rax,rcx,rdx,rsi,rdi
    v.extend_from_slice(&[0x41, 0x50, 0x41, 0x51, 0x41, 0x52]); // push r8,r9,r10
    v.extend_from_slice(&mov_rdi_imm64(callee)); // rdi = callee
    v.extend_from_slice(&mov_rsi_from_r11()); // rsi = sp
    v.extend_from_slice(&call_abs(on_enter));
    v.extend_from_slice(&mov_rax_imm64(exit_stub_addr)); // rax = exit stub address
    v.extend_from_slice(&mov_mem_r11_from_rax()); // [sp] = exit stub address
    v.extend_from_slice(&[0x41, 0x5a, 0x41, 0x59, 0x41, 0x58]); // pop r10,r9,r8
    v.extend_from_slice(&[0x5f, 0x5e, 0x5a, 0x59, 0x58]); // pop rdi,rsi,rdx,rcx,rax
    v.push(0x9d); // popfq
    v
}

/// Runs in place of the real return address. Preserves the integer return
/// value (rax/rdx) across the call to `on_exit`, which hands back the
/// original return address recovered from the shadow stack, then jumps
/// there. Floating-point return values in xmm0/xmm1 are not preserved —
/// instrumented leaf functions returning `f32`/`f64` will see corrupted
/// results, a known limitation of this stub.
fn exit_stub(on_exit: u64) -> Vec<u8> {
    let mut v = Vec::new();
    v.push(0x53); // push rbx
    v.extend_from_slice(&[0x41, 0x54]); // push r12
    v.extend_from_slice(&[0x48, 0x89, 0xc3]); // mov rbx, rax
    v.extend_from_slice(&[0x49, 0x89, 0xd4]); // mov r12, rdx
    v.extend_from_slice(&call_abs(on_exit));
    v.extend_from_slice(&[0x49, 0x89, 0xc3]); // mov r11, rax
    v.extend_from_slice(&[0x48, 0x89, 0xd8]); // mov rax, rbx
    v.extend_from_slice(&[0x4c, 0x89, 0xe2]); // mov rdx, r12
    v.extend_from_slice(&[0x41, 0x5c]); // pop r12
    v.push(0x5b); // pop rbx
    v.extend_from_slice(&[0x41, 0xff, 0xe3]); // jmp r11
    v
}

/// Decodes whole instructions starting at `entry` until at least
/// `min_bytes` have been consumed, re-encodes them at a new instruction
/// pointer. Mirrors the displaced-instruction relocation every inline
/// hooking trampoline needs: anything with a RIP-relative operand or any
/// kind of branch can't simply be copied, since its meaning depends on its
/// address.
fn relocate_prologue(entry: u64, prologue: &[u8], min_bytes: usize, new_ip: u64) -> Result<(Vec<u8>, usize)> {
    let mut decoder = Decoder::with_ip(64, prologue, entry, DecoderOptions::NONE);
    let mut consumed = 0usize;
    let mut instructions = Vec::new();

    for instr in &mut decoder {
        if instr.is_invalid() {
            return Err(Error::InvalidBytes(entry));
        }
        if consumed >= min_bytes {
            break;
        }
        if instr.is_ip_rel_memory_operand() {
            return Err(Error::RelativeInstruction(entry));
        }
        match instr.flow_control() {
            FlowControl::Next | FlowControl::Return => {
                consumed += instr.len();
                instructions.push(instr);
            }
            _ => return Err(Error::UnsupportedControlFlow(entry)),
        }
    }

    if consumed < min_bytes {
        return Err(Error::NotEnoughBytes(entry, min_bytes));
    }

    let block = InstructionBlock::new(&instructions, new_ip);
    let encoded = BlockEncoder::encode(decoder.bitness(), block, BlockEncoderOptions::NONE)
        .map_err(|_| Error::EncodingFailed(entry))?
        .code_buffer;
    Ok((encoded, consumed))
}

/// The generated code backing one installed patch: an entry stub that calls
/// `on_enter`, the relocated original prologue, a jump back into the
/// function's unpatched body, and a standalone exit stub whose address
/// becomes the shadow return address (4.C).
pub struct Trampoline {
    code: Vec<u8>,
    exit_stub_offset: usize,
    original_prologue_len: usize,
}

impl Trampoline {
    /// `entry` is the original function's address; `prologue` must contain
    /// at least `jump_len * 2` readable bytes starting there (the jumper
    /// only needs `jump_len`, but decoding wants headroom to find whole
    /// instructions). `slot_address` is where this trampoline's code will
    /// ultimately live, needed up front because the relocated instructions
    /// and both stubs are position-dependent.
    pub fn build(
        entry: u64,
        prologue: &[u8],
        jump_len: usize,
        slot_address: u64,
        on_enter: u64,
        on_exit: u64,
    ) -> Result<Self> {
        // Every instruction emitted by `entry_stub` is fixed-length
        // regardless of the immediates it embeds, so its length can be
        // measured with a placeholder exit-stub address before the real one
        // (which depends on the length of the relocated prologue and the
        // jump-back, computed below) is known.
        let entry_code_len = entry_stub(entry, on_enter, 0).len();
        let relocated_ip = slot_address + entry_code_len as u64;
        let (relocated, original_prologue_len) =
            relocate_prologue(entry, prologue, jump_len, relocated_ip)?;

        let jump_back_target = entry + original_prologue_len as u64;
        let jump_back = jmp_abs(jump_back_target);

        let exit_stub_offset = entry_code_len + relocated.len() + jump_back.len();
        let exit_stub_addr = slot_address + exit_stub_offset as u64;

        let mut code = entry_stub(entry, on_enter, exit_stub_addr);
        debug_assert_eq!(code.len(), entry_code_len);
        code.extend_from_slice(&relocated);
        code.extend_from_slice(&jump_back);
        code.extend_from_slice(&exit_stub(on_exit));

        Ok(Trampoline {
            code,
            exit_stub_offset,
            original_prologue_len,
        })
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Absolute address of the exit stub once the trampoline has been
    /// written to `slot_address` (the same value passed to `build`).
    pub fn exit_stub_address(&self, slot_address: u64) -> u64 {
        slot_address + self.exit_stub_offset as u64
    }

    /// How many bytes of the original function's prologue this trampoline
    /// displaces — the jumper must overwrite exactly this many bytes (it is
    /// always `>= jump_len`, since decoding only stops on whole-instruction
    /// boundaries).
    pub fn original_prologue_len(&self) -> usize {
        self.original_prologue_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `nop; nop; nop; nop; nop; nop; nop; nop; nop; nop; nop; nop; nop; nop;
    // ret` -- fourteen single-byte NOPs cover exactly `jump_len` and decode
    // to whole one-byte instructions, which keeps construction deterministic
    // without needing a real compiled function to borrow bytes from.
    fn nop_prologue(len: usize) -> Vec<u8> {
        vec![0x90; len]
    }

    #[test]
    fn build_produces_entry_stub_relocated_body_and_exit_stub() {
        let entry = 0x1000u64;
        let prologue = nop_prologue(32);
        let trampoline =
            Trampoline::build(entry, &prologue, 14, 0x2000, 0x3000, 0x4000).unwrap();
        assert!(trampoline.len() > 14);
        assert!(trampoline.original_prologue_len() >= 14);
        assert!(trampoline.exit_stub_address(0x2000) > 0x2000);
    }

    #[test]
    fn entry_stub_embeds_the_exit_stub_address_as_the_overwrite_immediate() {
        let entry = 0x1000u64;
        let prologue = nop_prologue(32);
        let slot_address = 0x2000u64;
        let trampoline =
            Trampoline::build(entry, &prologue, 14, slot_address, 0x3000, 0x4000).unwrap();
        let exit_stub_addr = trampoline.exit_stub_address(slot_address);

        // `mov rax, imm64` immediately followed by `mov [r11], rax` (49 89
        // 03) is how the entry stub overwrites the return-address slot; the
        // immediate must match the exit stub's real address.
        let overwrite = [0x49, 0x89, 0x03];
        let pos = trampoline
            .code()
            .windows(overwrite.len())
            .position(|w| w == overwrite)
            .expect("entry stub must contain the [r11] overwrite");
        let imm_bytes: [u8; 8] = trampoline.code()[pos - 8..pos].try_into().unwrap();
        assert_eq!(u64::from_le_bytes(imm_bytes), exit_stub_addr);
    }

    #[test]
    fn rejects_a_prologue_with_an_internal_branch() {
        // `jmp short +2` (eb 02) followed by padding: the decoder sees an
        // unconditional branch before it has consumed `min_bytes`.
        let entry = 0x1000u64;
        let mut prologue = vec![0xeb, 0x02];
        prologue.extend(nop_prologue(30));
        let result = Trampoline::build(entry, &prologue, 14, 0x2000, 0x3000, 0x4000);
        assert!(matches!(result, Err(Error::UnsupportedControlFlow(_))));
    }

    #[test]
    fn rejects_a_prologue_with_a_rip_relative_operand() {
        // `lea rax, [rip+0x10]` (48 8d 05 10 00 00 00) reads its own address.
        let entry = 0x1000u64;
        let mut prologue = vec![0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00];
        prologue.extend(nop_prologue(30));
        let result = Trampoline::build(entry, &prologue, 14, 0x2000, 0x3000, 0x4000);
        assert!(matches!(result, Err(Error::RelativeInstruction(_))));
    }

    #[test]
    fn rejects_too_few_decodable_bytes() {
        let entry = 0x1000u64;
        let prologue = nop_prologue(4);
        let result = Trampoline::build(entry, &prologue, 14, 0x2000, 0x3000, 0x4000);
        assert!(matches!(result, Err(Error::NotEnoughBytes(_, 14))));
    }

    #[test]
    fn indirect_jump_and_call_shellcode_embed_the_target_address() {
        let jmp = jmp_abs(0x1122_3344_5566_7788);
        assert_eq!(&jmp[0..2], &[0xff, 0x25]);
        assert_eq!(&jmp[6..14], &0x1122_3344_5566_7788u64.to_le_bytes());

        let call = call_abs(0xdead_beef);
        assert_eq!(&call[0..2], &[0xff, 0x15]);
        assert_eq!(&call[6..14], &0xdead_beefu64.to_le_bytes());
    }
}
