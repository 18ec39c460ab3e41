//! End-to-end trampoline creation and teardown
//!
//! These tests run the real pipeline: host memory is probed, regions are
//! allocated near the targets, prologues are relocated and the results are
//! read back through the returned handles.

#![cfg(windows)]

use core::ffi::c_void;

use revenant::{
    trampoline_create, trampoline_create_ex, trampoline_free, Error, Trampoline, TrampolineFlags,
};

const RANGE_OF_RELATIVE_JUMP: usize = 0x7FFF_FFFF;
const TRAP: u8 = 0xCC;

/// read the trampoline code bytes back out of the chunk
fn code_bytes(trampoline: &Trampoline, length: usize) -> Vec<u8> {
    let address = trampoline.address_of_trampoline_code() as *const u8;
    // SAFETY: the chunk's code buffer is at least `length` bytes and the
    // region is readable while the trampoline is live
    unsafe { core::slice::from_raw_parts(address, length) }.to_vec()
}

/// resolve the pointer slot an `FF 25`/`FF 15` indirect branch reads through
#[cfg(target_arch = "x86_64")]
fn resolve_indirect_slot(branch: &[u8], branch_address: usize) -> usize {
    assert_eq!(branch[0], 0xFF);
    let displacement = i32::from_le_bytes(branch[2..6].try_into().unwrap());
    (branch_address as i64 + 6 + displacement as i64) as usize
}

#[cfg(target_arch = "x86_64")]
fn distance(a: usize, b: usize) -> usize {
    a.max(b) - a.min(b)
}

// the multi-byte fixtures below encode x86-64 prologues; their 32-bit
// decodings differ instruction by instruction
#[cfg(target_arch = "x86_64")]
#[test]
fn create_plain_prologue() {
    // push rbp; mov rbp, rsp; sub rsp, 0x20; trap padding
    static TARGET: [u8; 32] = [
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP,
    ];
    let target = TARGET.as_ptr() as *const c_void;
    let callback = create_plain_prologue as *const c_void;

    let trampoline = trampoline_create(target, callback, 5).unwrap();

    // the three instructions are copied verbatim
    let code = code_bytes(&trampoline, 33);
    assert_eq!(&code[..8], &TARGET[..8]);
    assert_eq!(trampoline.original_code(), &TARGET[..8]);

    let items: Vec<(u8, u8)> = trampoline
        .translation()
        .iter()
        .map(|item| (item.offset_source, item.offset_destination))
        .collect();
    assert_eq!(items, vec![(0, 0), (1, 1), (4, 4)]);

    // the backjump reads a pointer slot holding target + 8
    let backjump_address = trampoline.address_of_trampoline_code() as usize + 8;
    let slot = resolve_indirect_slot(&code[8..14], backjump_address);
    // SAFETY: the slot lives inside the live chunk
    let continuation = unsafe { *(slot as *const usize) };
    assert_eq!(continuation, target as usize + 8);

    // trap bytes pad the rest of the code buffer
    assert!(code[14..].iter().all(|&b| b == TRAP));

    // the chunk was placed within relative-jump reach of the hook site
    assert!(
        distance(
            trampoline.address_of_trampoline_code() as usize,
            target as usize
        ) <= RANGE_OF_RELATIVE_JUMP
    );

    trampoline_free(trampoline).unwrap();
}

#[test]
fn create_rebias_short_jump() {
    // jmp +0x10; everything after the jump is unreachable
    static TARGET: [u8; 32] = {
        let mut bytes = [TRAP; 32];
        bytes[0] = 0xEB;
        bytes[1] = 0x10;
        bytes
    };
    let target = TARGET.as_ptr() as *const c_void;
    let callback = create_rebias_short_jump as *const c_void;

    let trampoline = trampoline_create(target, callback, 5).unwrap();

    assert_eq!(trampoline.original_code(), &TARGET[..2]);
    let items: Vec<(u8, u8)> = trampoline
        .translation()
        .iter()
        .map(|item| (item.offset_source, item.offset_destination))
        .collect();
    assert_eq!(items, vec![(0, 0)]);

    // widened to a near jump with the same absolute destination
    let code = code_bytes(&trampoline, 5);
    assert_eq!(code[0], 0xE9);
    let displacement = i32::from_le_bytes(code[1..5].try_into().unwrap());
    let destination = (trampoline.address_of_trampoline_code() as i64 + 5 + displacement as i64)
        as usize;
    assert_eq!(destination, target as usize + 2 + 0x10);

    trampoline_free(trampoline).unwrap();
}

#[test]
fn create_rewrites_jecxz() {
    // jecxz +5; nop padding reachable on the fall-through path
    static TARGET: [u8; 32] = {
        let mut bytes = [0x90; 32];
        bytes[0] = 0xE3;
        bytes[1] = 0x05;
        bytes
    };
    let target = TARGET.as_ptr() as *const c_void;
    let callback = create_rewrites_jecxz as *const c_void;

    let trampoline = trampoline_create(target, callback, 5).unwrap();
    let base = trampoline.address_of_trampoline_code() as usize;
    let code = code_bytes(&trampoline, 12);

    // jecxz +2 over a short hop over a near jump
    assert_eq!(&code[..4], &[0xE3, 0x02, 0xEB, 0x05]);
    assert_eq!(code[4], 0xE9);

    // the taken path computes the original destination
    let displacement = i32::from_le_bytes(code[5..9].try_into().unwrap());
    let taken = (base as i64 + 9 + displacement as i64) as usize;
    assert_eq!(taken, target as usize + 2 + 0x05);

    // the fall-through path continues with the relocated nops
    assert_eq!(&code[9..12], &[0x90, 0x90, 0x90]);

    trampoline_free(trampoline).unwrap();
}

#[test]
fn create_jecxz_without_flag_fails() {
    static TARGET: [u8; 32] = {
        let mut bytes = [0x90; 32];
        bytes[0] = 0xE3;
        bytes[1] = 0x05;
        bytes
    };
    let target = TARGET.as_ptr() as *const c_void;
    let callback = create_jecxz_without_flag_fails as *const c_void;

    let status = trampoline_create_ex(
        target,
        callback,
        5,
        TrampolineFlags::REWRITE_CALL | TrampolineFlags::REWRITE_LOOP,
    );
    assert_eq!(status.unwrap_err(), Error::RewriteDisabled { mnemonic: "jcxz" });

    // the failure rolled everything back; the same target still hooks fine
    let trampoline = trampoline_create(target, callback, 5).unwrap();
    trampoline_free(trampoline).unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
fn create_twice_shares_a_region() {
    static FIRST: [u8; 32] = [
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP,
    ];
    static SECOND: [u8; 32] = [
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x28, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP,
    ];
    let callback = create_twice_shares_a_region as *const c_void;

    let first = trampoline_create(FIRST.as_ptr() as *const c_void, callback, 5).unwrap();
    let second = trampoline_create(SECOND.as_ptr() as *const c_void, callback, 5).unwrap();

    let first_code = first.address_of_trampoline_code() as usize;
    let second_code = second.address_of_trampoline_code() as usize;

    // both targets sit in the same 2 GiB window, so both chunks come out of
    // the same granule-sized region
    assert_ne!(first_code, second_code);
    assert_eq!(first_code & !0xFFFF, second_code & !0xFFFF);

    trampoline_free(second).unwrap();
    trampoline_free(first).unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
fn create_free_create_reuses_pool() {
    static TARGET: [u8; 32] = [
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP,
    ];
    let target = TARGET.as_ptr() as *const c_void;
    let callback = create_free_create_reuses_pool as *const c_void;

    let first = trampoline_create(target, callback, 5).unwrap();
    trampoline_free(first).unwrap();

    // the freed slot is eligible again
    let second = trampoline_create(target, callback, 5).unwrap();
    assert_eq!(&code_bytes(&second, 8), &TARGET[..8]);
    trampoline_free(second).unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
fn callback_jump_is_reachable_from_target() {
    static TARGET: [u8; 32] = [
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP, TRAP,
        TRAP, TRAP,
    ];
    let target = TARGET.as_ptr() as *const c_void;
    let callback = callback_jump_is_reachable_from_target as *const c_void;

    let trampoline = trampoline_create(target, callback, 5).unwrap();

    // the stub sits in the chunk, within rel32 reach of the patched entry,
    // and forwards to the callback through its pointer slot
    let stub_address = trampoline.address_of_callback_jump() as usize;
    assert!(distance(stub_address, target as usize) <= RANGE_OF_RELATIVE_JUMP);

    // SAFETY: the stub is 6 readable bytes inside the live chunk
    let stub = unsafe { core::slice::from_raw_parts(stub_address as *const u8, 6) };
    assert_eq!(&stub[..2], &[0xFF, 0x25]);
    let slot = resolve_indirect_slot(stub, stub_address);
    // SAFETY: the slot lives inside the live chunk
    let destination = unsafe { *(slot as *const usize) };
    assert_eq!(destination, callback as usize);

    trampoline_free(trampoline).unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
fn trampoline_runs_the_original_function() {
    #[inline(never)]
    extern "system" fn sample(a: u64, b: u64) -> u64 {
        std::hint::black_box(a.wrapping_mul(3).wrapping_add(b ^ 0x5A5A))
    }

    let target = sample as *const c_void;
    let callback = trampoline_runs_the_original_function as *const c_void;

    let trampoline = trampoline_create(target, callback, 5).unwrap();

    // the relocated prologue plus backjump must behave exactly like the
    // unpatched function
    let call: extern "system" fn(u64, u64) -> u64 =
        // SAFETY: the trampoline continues `sample`, which is still unpatched
        unsafe { core::mem::transmute(trampoline.address_of_trampoline_code()) };

    for (a, b) in [(0u64, 0u64), (1, 2), (0xFFFF_FFFF, 42), (7, u64::MAX)] {
        assert_eq!(call(a, b), sample(a, b));
    }

    trampoline_free(trampoline).unwrap();
}

#[test]
fn minimal_relocation_single_instruction() {
    // a single one-byte instruction satisfies min_bytes_to_reloc == 1
    static TARGET: [u8; 32] = {
        let mut bytes = [TRAP; 32];
        bytes[0] = 0x55; // push rbp
        bytes
    };
    let target = TARGET.as_ptr() as *const c_void;
    let callback = minimal_relocation_single_instruction as *const c_void;

    let trampoline = trampoline_create(target, callback, 1).unwrap();

    assert_eq!(trampoline.original_code(), &[0x55]);
    assert_eq!(trampoline.translation().len(), 1);

    trampoline_free(trampoline).unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
fn long_first_instruction_is_kept_intact() {
    // a 15-byte instruction: lock or with every prefix iced accepts
    // 66 F0 48 81 0C 25 00 10 00 00 78 56 34 12 — or qword [0x1000], imm
    // use a simpler long form: movabs with REX + 8-byte immediate padded by
    // prefixes is awkward; nop with a long 66-prefix chain works everywhere
    static TARGET: [u8; 32] = {
        let mut bytes = [TRAP; 32];
        // 66 66 66 66 66 66 2E 0F 1F 84 00 00 00 00 00: 15-byte nop
        let long_nop = [
            0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x2E, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00,
            0x00,
        ];
        let mut i = 0;
        while i < long_nop.len() {
            bytes[i] = long_nop[i];
            i += 1;
        }
        bytes
    };
    let target = TARGET.as_ptr() as *const c_void;
    let callback = long_first_instruction_is_kept_intact as *const c_void;

    let trampoline = trampoline_create(target, callback, 5).unwrap();

    // one 15-byte instruction covers the requested 5 bytes on its own
    assert_eq!(trampoline.original_code(), &TARGET[..15]);
    assert_eq!(trampoline.translation().len(), 1);
    assert_eq!(&code_bytes(&trampoline, 15), &TARGET[..15]);

    trampoline_free(trampoline).unwrap();
}
