//! Mach-O 64 container
//!
//! Minimal executables for macOS: `__PAGEZERO`, a `__TEXT` segment with
//! one `__text` section, and an `LC_UNIXTHREAD` command whose saved
//! program counter is the entry stub. Size fields are placeholder-
//! written at header time and patched in the footer.

use crate::gen::Generator;
use crate::prefs::Arch;

/// Mach-O constants
pub mod consts {
    pub const MH_MAGIC_64: u32 = 0xFEED_FACF;

    pub const CPU_TYPE_X86_64: i32 = 0x0100_0007;
    pub const CPU_SUBTYPE_X86_64_ALL: i32 = 3;
    pub const CPU_TYPE_ARM64: i32 = 0x0100_000C;
    pub const CPU_SUBTYPE_ARM64_ALL: i32 = 0;

    pub const MH_EXECUTE: u32 = 2;
    pub const MH_NOUNDEFS: u32 = 0x1;

    pub const LC_SEGMENT_64: u32 = 0x19;
    pub const LC_UNIXTHREAD: u32 = 0x5;

    pub const VM_PROT_READ: i32 = 0x1;
    pub const VM_PROT_WRITE: i32 = 0x2;
    pub const VM_PROT_EXECUTE: i32 = 0x4;

    pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
    pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

    pub const X86_THREAD_STATE64: u32 = 4;
    pub const X86_THREAD_STATE64_COUNT: u32 = 42;
    pub const ARM_THREAD_STATE64: u32 = 6;
    pub const ARM_THREAD_STATE64_COUNT: u32 = 68;

    pub const MACH_HEADER_64_SIZE: u32 = 32;
    pub const SEGMENT_COMMAND_64_SIZE: u32 = 72;
    pub const SECTION_64_SIZE: u32 = 80;

    /// Default load address of the text segment.
    pub const BASE_VADDR: u64 = 0x1_0000_0000;

    pub const PAGE_SIZE: u64 = 0x4000;
}

/// Offsets the footer pass must fill in.
#[derive(Debug, Clone, Copy)]
pub struct MachoPatches {
    pub seg_vmsize_pos: usize,
    pub seg_filesize_pos: usize,
    pub sect_size_pos: usize,
}

fn thread_command_size(arch: Arch) -> u32 {
    // cmd + cmdsize + flavor + count + register file
    16 + 4 * match arch {
        Arch::Amd64 => consts::X86_THREAD_STATE64_COUNT,
        Arch::Arm64 => consts::ARM_THREAD_STATE64_COUNT,
    }
}

/// Emit the Mach-O header and load commands into the generator's buffer.
pub fn write_header(g: &mut Generator) {
    let text_cmd_size = consts::SEGMENT_COMMAND_64_SIZE + consts::SECTION_64_SIZE;
    let cmds_size =
        consts::SEGMENT_COMMAND_64_SIZE + text_cmd_size + thread_command_size(g.arch);
    let code_start = align_to(
        (consts::MACH_HEADER_64_SIZE + cmds_size) as u64,
        16,
    ) as usize;
    let entry = consts::BASE_VADDR + code_start as u64;

    let (cputype, cpusubtype) = match g.arch {
        Arch::Amd64 => (consts::CPU_TYPE_X86_64, consts::CPU_SUBTYPE_X86_64_ALL),
        Arch::Arm64 => (consts::CPU_TYPE_ARM64, consts::CPU_SUBTYPE_ARM64_ALL),
    };

    let buf = &mut g.buf;
    buf.emit_u32(consts::MH_MAGIC_64);
    buf.emit_u32(cputype as u32);
    buf.emit_u32(cpusubtype as u32);
    buf.emit_u32(consts::MH_EXECUTE);
    buf.emit_u32(3); // ncmds
    buf.emit_u32(cmds_size);
    buf.emit_u32(consts::MH_NOUNDEFS);
    buf.emit_u32(0); // reserved

    // __PAGEZERO
    buf.emit_u32(consts::LC_SEGMENT_64);
    buf.emit_u32(consts::SEGMENT_COMMAND_64_SIZE);
    buf.emit_str_fixed("__PAGEZERO", 16);
    buf.emit_u64(0); // vmaddr
    buf.emit_u64(consts::BASE_VADDR); // vmsize
    buf.emit_u64(0); // fileoff
    buf.emit_u64(0); // filesize
    buf.emit_u32(0); // maxprot
    buf.emit_u32(0); // initprot
    buf.emit_u32(0); // nsects
    buf.emit_u32(0); // flags

    // __TEXT with one __text section
    buf.emit_u32(consts::LC_SEGMENT_64);
    buf.emit_u32(text_cmd_size);
    buf.emit_str_fixed("__TEXT", 16);
    buf.emit_u64(consts::BASE_VADDR);
    let seg_vmsize_pos = buf.pos();
    buf.emit_u64(0); // vmsize, patched
    buf.emit_u64(0); // fileoff
    let seg_filesize_pos = buf.pos();
    buf.emit_u64(0); // filesize, patched
    let prot = consts::VM_PROT_READ | consts::VM_PROT_WRITE | consts::VM_PROT_EXECUTE;
    buf.emit_u32(prot as u32); // maxprot
    buf.emit_u32(prot as u32); // initprot
    buf.emit_u32(1); // nsects
    buf.emit_u32(0); // flags

    buf.emit_str_fixed("__text", 16);
    buf.emit_str_fixed("__TEXT", 16);
    buf.emit_u64(entry); // addr
    let sect_size_pos = buf.pos();
    buf.emit_u64(0); // size, patched
    buf.emit_u32(code_start as u32); // offset
    buf.emit_u32(4); // align 2^4
    buf.emit_u32(0); // reloff
    buf.emit_u32(0); // nreloc
    buf.emit_u32(consts::S_ATTR_PURE_INSTRUCTIONS | consts::S_ATTR_SOME_INSTRUCTIONS);
    buf.emit_u32(0); // reserved1
    buf.emit_u32(0); // reserved2
    buf.emit_u32(0); // reserved3

    // LC_UNIXTHREAD: zeroed register file with pc at the entry stub.
    buf.emit_u32(consts::LC_UNIXTHREAD);
    buf.emit_u32(thread_command_size(g.arch));
    match g.arch {
        Arch::Amd64 => {
            buf.emit_u32(consts::X86_THREAD_STATE64);
            buf.emit_u32(consts::X86_THREAD_STATE64_COUNT);
            // rax rbx rcx rdx rdi rsi rbp rsp r8-r15 (16 registers)
            for _ in 0..16 {
                buf.emit_u64(0);
            }
            buf.emit_u64(entry); // rip
            buf.emit_u64(0); // rflags
            buf.emit_u64(0); // cs
            buf.emit_u64(0); // fs
            buf.emit_u64(0); // gs
        }
        Arch::Arm64 => {
            buf.emit_u32(consts::ARM_THREAD_STATE64);
            buf.emit_u32(consts::ARM_THREAD_STATE64_COUNT);
            // x0-x28, fp, lr, sp (32 registers)
            for _ in 0..32 {
                buf.emit_u64(0);
            }
            buf.emit_u64(entry); // pc
            buf.emit_u32(0); // cpsr
            buf.emit_u32(0); // padding
        }
    }

    while buf.pos() < code_start {
        buf.emit(0);
    }

    g.code_start = code_start;
    g.base_addr = consts::BASE_VADDR;
    g.macho_patches = Some(MachoPatches {
        seg_vmsize_pos,
        seg_filesize_pos,
        sect_size_pos,
    });
    g.sync_debug_pos();
}

/// Fill the segment and section sizes now that the image is complete.
pub fn patch_footer(g: &mut Generator) {
    let total = g.buf.pos() as u64;
    let text_size = total - g.code_start as u64;
    if let Some(patches) = g.macho_patches {
        g.buf
            .patch_u64(patches.seg_vmsize_pos, align_to(total, consts::PAGE_SIZE));
        g.buf.patch_u64(patches.seg_filesize_pos, total);
        g.buf.patch_u64(patches.sect_size_pos, text_size);
    }
}

fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::{Os, Preferences};
    use crate::types::TypeTable;

    fn generator_for(arch: Arch) -> (Preferences, TypeTable) {
        let mut p = Preferences::new(Os::Macos);
        p.arch = Some(arch);
        (p, TypeTable::new())
    }

    #[test]
    fn test_magic_and_cputype() {
        let (prefs, mut table) = generator_for(Arch::Amd64);
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        let code = g.buf.code();
        assert_eq!(&code[0..4], &[0xCF, 0xFA, 0xED, 0xFE]);
        let cputype = i32::from_le_bytes(code[4..8].try_into().unwrap());
        assert_eq!(cputype, consts::CPU_TYPE_X86_64);
    }

    #[test]
    fn test_arm64_cputype() {
        let (prefs, mut table) = generator_for(Arch::Arm64);
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        let cputype = i32::from_le_bytes(g.buf.code()[4..8].try_into().unwrap());
        assert_eq!(cputype, consts::CPU_TYPE_ARM64);
    }

    #[test]
    fn test_code_start_is_aligned_past_commands() {
        let (prefs, mut table) = generator_for(Arch::Amd64);
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        let cmds = 72 + 72 + 80 + (16 + 4 * consts::X86_THREAD_STATE64_COUNT);
        assert_eq!(g.code_start as u64, align_to(32 + cmds as u64, 16));
        assert_eq!(g.buf.pos(), g.code_start);
    }

    #[test]
    fn test_footer_patches_sizes() {
        let (prefs, mut table) = generator_for(Arch::Amd64);
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        g.buf.emit_bytes(&[0xC3; 16]);
        patch_footer(&mut g);
        let patches = g.macho_patches.unwrap();
        let code = g.buf.code();
        let filesize = u64::from_le_bytes(
            code[patches.seg_filesize_pos..patches.seg_filesize_pos + 8]
                .try_into()
                .unwrap(),
        );
        let sect_size = u64::from_le_bytes(
            code[patches.sect_size_pos..patches.sect_size_pos + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(filesize, g.buf.pos() as u64);
        assert_eq!(sect_size, 16);
    }
}
