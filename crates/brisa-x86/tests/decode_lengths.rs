//! Differential length checks against the `iced-x86` decoder.
//!
//! The bytecode compiler trusts `Instruction::len` to advance EIP and to
//! detect page-boundary spills, so decoded lengths have to agree with a
//! reference decoder on every supported encoding.

use brisa_x86::decode;
use iced_x86::{Decoder, DecoderOptions};
use proptest::prelude::*;

fn our_len(bytes: &[u8], is32: bool) -> Option<u8> {
    let mut it = bytes.iter().copied();
    decode(&mut it, is32).ok().map(|i| i.len)
}

fn iced_len(bytes: &[u8], is32: bool) -> usize {
    let mut dec = Decoder::with_ip(if is32 { 32 } else { 16 }, bytes, 0, DecoderOptions::NONE);
    dec.decode().len()
}

#[test]
fn curated_corpus_matches_iced() {
    // (encoding, decode in 32-bit mode)
    let corpus: &[(&[u8], bool)] = &[
        (&[0x01, 0xD8], true),                                  // add eax, ebx
        (&[0x66, 0x01, 0xD8], true),                            // add ax, bx
        (&[0x05, 0x78, 0x56, 0x34, 0x12], true),                // add eax, imm32
        (&[0x83, 0xC0, 0x05], true),                            // add eax, 5
        (&[0x81, 0x45, 0x04, 0x11, 0x22, 0x33, 0x44], true),    // add [ebp+4], imm32
        (&[0x8B, 0x84, 0xB3, 0x78, 0x56, 0x34, 0x12], true),    // mov eax, [ebx+esi*4+d32]
        (&[0x8B, 0x0D, 0x44, 0x33, 0x22, 0x11], true),          // mov ecx, [d32]
        (&[0x8A, 0x45, 0xFC], true),                            // mov al, [ebp-4]
        (&[0x8D, 0x44, 0x88, 0x10], true),                      // lea eax, [eax+ecx*4+16]
        (&[0xB8, 0x01, 0x00, 0x00, 0x00], true),                // mov eax, 1
        (&[0xB0, 0x7F], true),                                  // mov al, 0x7f
        (&[0xC6, 0x03, 0xAA], true),                            // mov byte [ebx], 0xaa
        (&[0xC7, 0x04, 0x24, 0x01, 0x00, 0x00, 0x00], true),    // mov dword [esp], 1
        (&[0x50], true),                                        // push eax
        (&[0x68, 0x10, 0x00, 0x00, 0x00], true),                // push imm32
        (&[0x6A, 0x10], true),                                  // push imm8
        (&[0x0F, 0xA0], true),                                  // push fs
        (&[0x74, 0x05], true),                                  // je +5
        (&[0x0F, 0x84, 0x00, 0x01, 0x00, 0x00], true),          // je +0x100
        (&[0xE8, 0x00, 0x00, 0x00, 0x00], true),                // call rel32
        (&[0xEB, 0xFE], true),                                  // jmp $
        (&[0xFF, 0x25, 0x00, 0x10, 0x00, 0x00], true),          // jmp [d32]
        (&[0xFF, 0xD0], true),                                  // call eax
        (&[0xC3], true),                                        // ret
        (&[0xC2, 0x08, 0x00], true),                            // ret 8
        (&[0xCF], true),                                        // iretd
        (&[0xF3, 0xA4], true),                                  // rep movsb
        (&[0xF3, 0xA5], true),                                  // rep movsd
        (&[0xF2, 0xAE], true),                                  // repne scasb
        (&[0x66, 0xF3, 0xAB], true),                            // rep stosw
        (&[0xD1, 0xE0], true),                                  // shl eax, 1
        (&[0xC1, 0xE0, 0x04], true),                            // shl eax, 4
        (&[0xD3, 0xC8], true),                                  // ror eax, cl
        (&[0x0F, 0xA4, 0xD0, 0x08], true),                      // shld eax, edx, 8
        (&[0x0F, 0xAD, 0xD0], true),                            // shrd eax, edx, cl
        (&[0xF7, 0xF3], true),                                  // div ebx
        (&[0xF7, 0xE1], true),                                  // mul ecx
        (&[0x69, 0xC3, 0x10, 0x00, 0x00, 0x00], true),          // imul eax, ebx, 16
        (&[0x6B, 0xC3, 0x10], true),                            // imul eax, ebx, 16 (imm8)
        (&[0x0F, 0xAF, 0xC3], true),                            // imul eax, ebx
        (&[0x0F, 0xB6, 0xC3], true),                            // movzx eax, bl
        (&[0x0F, 0xBF, 0x45, 0x00], true),                      // movsx eax, word [ebp]
        (&[0x0F, 0x92, 0xC0], true),                            // setb al
        (&[0x0F, 0x44, 0xC8], true),                            // cmove ecx, eax
        (&[0x0F, 0xA3, 0xD8], true),                            // bt eax, ebx
        (&[0x0F, 0xBA, 0xE0, 0x03], true),                      // bt eax, 3
        (&[0x0F, 0xBC, 0xC3], true),                            // bsf eax, ebx
        (&[0x0F, 0xC8], true),                                  // bswap eax
        (&[0x0F, 0xB1, 0x0B], true),                            // cmpxchg [ebx], ecx
        (&[0x0F, 0xC7, 0x0B], true),                            // cmpxchg8b [ebx]
        (&[0x0F, 0xC1, 0xD8], true),                            // xadd eax, ebx
        (&[0x0F, 0x22, 0xC0], true),                            // mov cr0, eax
        (&[0x0F, 0x20, 0xD8], true),                            // mov eax, cr3
        (&[0x0F, 0x01, 0x15, 0x00, 0x00, 0x00, 0x00], true),    // lgdt [d32]
        (&[0x0F, 0x01, 0x38], true),                            // invlpg [eax]
        (&[0x0F, 0x00, 0xD8], true),                            // ltr ax
        (&[0x0F, 0x31], true),                                  // rdtsc
        (&[0x0F, 0xA2], true),                                  // cpuid
        (&[0xE4, 0x60], true),                                  // in al, 0x60
        (&[0xEE], true),                                        // out dx, al
        (&[0xF4], true),                                        // hlt
        (&[0xFA], true),                                        // cli
        (&[0x9C], true),                                        // pushfd
        (&[0xCD, 0x80], true),                                  // int 0x80
        (&[0xCC], true),                                        // int3
        (&[0xC8, 0x10, 0x00, 0x02], true),                      // enter 16, 2
        (&[0xC9], true),                                        // leave
        (&[0x60], true),                                        // pushad
        (&[0xE2, 0xF0], true),                                  // loop -16
        (&[0xE3, 0x02], true),                                  // jecxz +2
        (&[0xD9, 0xC0], true),                                  // fld st(0)
        (&[0xDD, 0x45, 0x08], true),                            // fld qword [ebp+8]
        (&[0xDB, 0x2C, 0x24], true),                            // fld tword [esp]
        // 16-bit mode forms.
        (&[0x8B, 0x42, 0x08], false),                           // mov ax, [bp+si+8]
        (&[0x8B, 0x06, 0x34, 0x12], false),                     // mov ax, [0x1234]
        (&[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12], false),         // mov eax, imm32
        (&[0x67, 0x8B, 0x00], false),                           // mov ax, [eax]
        (&[0xEA, 0x00, 0x10, 0x00, 0xF0], false),               // jmp f000:1000
        (&[0x9A, 0x00, 0x10, 0x00, 0xF0], false),               // call f000:1000
        (&[0xC4, 0x1E, 0x00, 0x20], false),                     // les bx, [0x2000]
        (&[0xCD, 0x10], false),                                 // int 0x10
    ];

    for (bytes, is32) in corpus {
        assert_eq!(
            our_len(bytes, *is32).map(usize::from),
            Some(iced_len(bytes, *is32)),
            "length mismatch for {bytes:02X?} (is32={is32})"
        );
    }
}

proptest! {
    // Every ModRM/SIB/displacement combination of `mov r32, r/m32` is a
    // valid encoding, so lengths must match iced on all of them, with or
    // without prefixes.
    #[test]
    fn mov_rm_forms_match_iced(
        modrm in any::<u8>(),
        tail in proptest::array::uniform15(any::<u8>()),
        op_prefix in any::<bool>(),
        seg_prefix in any::<bool>(),
    ) {
        let mut bytes = Vec::with_capacity(18);
        if seg_prefix {
            bytes.push(0x64); // fs
        }
        if op_prefix {
            bytes.push(0x66);
        }
        bytes.push(0x8B);
        bytes.push(modrm);
        bytes.extend_from_slice(&tail);

        prop_assert_eq!(
            our_len(&bytes, true).map(usize::from),
            Some(iced_len(&bytes, true))
        );
    }

    #[test]
    fn group1_imm_forms_match_iced(
        opcode in prop::sample::select(vec![0x80u8, 0x81, 0x83]),
        modrm in any::<u8>(),
        tail in proptest::array::uniform15(any::<u8>()),
    ) {
        let mut bytes = vec![opcode, modrm];
        bytes.extend_from_slice(&tail);
        prop_assert_eq!(
            our_len(&bytes, true).map(usize::from),
            Some(iced_len(&bytes, true))
        );
    }

    // Decoding is a pure function of the byte stream.
    #[test]
    fn decode_is_deterministic(bytes in proptest::collection::vec(any::<u8>(), 1..16)) {
        let mut a = bytes.iter().copied();
        let mut b = bytes.iter().copied();
        prop_assert_eq!(brisa_x86::decode(&mut a, true), brisa_x86::decode(&mut b, true));
    }
}
