//! ELF64 container
//!
//! Two variants. The simple executable wraps the text in a single RWX
//! `PT_LOAD` segment with no section table; its size fields are
//! placeholder-written at header time and patched in the footer. The
//! linkable variant assembles a relocatable object (`.text`,
//! `.rela.text`, `.symtab`, `.strtab`, `.shstrtab`) for the system
//! linker when external symbols are referenced.

use crate::gen::buffer::CodeBuffer;
use crate::gen::Generator;
use crate::prefs::Arch;
use crate::Result;

/// ELF constants
pub mod consts {
    pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
    pub const ELFCLASS64: u8 = 2;
    pub const ELFDATA2LSB: u8 = 1;
    pub const EV_CURRENT: u8 = 1;

    pub const ET_REL: u16 = 1;
    pub const ET_EXEC: u16 = 2;

    pub const EM_X86_64: u16 = 62;
    pub const EM_AARCH64: u16 = 183;

    pub const PT_LOAD: u32 = 1;
    pub const PF_X: u32 = 1;
    pub const PF_W: u32 = 2;
    pub const PF_R: u32 = 4;

    pub const SHT_PROGBITS: u32 = 1;
    pub const SHT_SYMTAB: u32 = 2;
    pub const SHT_STRTAB: u32 = 3;
    pub const SHT_RELA: u32 = 4;

    pub const SHF_ALLOC: u64 = 0x2;
    pub const SHF_EXECINSTR: u64 = 0x4;
    pub const SHF_INFO_LINK: u64 = 0x40;

    pub const STB_LOCAL: u8 = 0;
    pub const STB_GLOBAL: u8 = 1;
    pub const STT_FUNC: u8 = 2;
    pub const STT_SECTION: u8 = 3;

    pub const R_X86_64_64: u32 = 1;
    pub const R_X86_64_PLT32: u32 = 4;

    pub const EHDR_SIZE: u16 = 64;
    pub const PHDR_SIZE: u16 = 56;
    pub const SHDR_SIZE: u16 = 64;
    pub const SYM_SIZE: usize = 24;
    pub const RELA_SIZE: usize = 24;

    /// Default load address for Linux executables.
    pub const DEFAULT_LOAD_ADDR: u64 = 0x40_0000;
}

fn machine(arch: Arch) -> u16 {
    match arch {
        Arch::Amd64 => consts::EM_X86_64,
        Arch::Arm64 => consts::EM_AARCH64,
    }
}

/// Header fields the footer pass must fill in.
#[derive(Debug, Clone, Copy)]
pub struct ElfPatches {
    pub filesz_pos: usize,
    pub memsz_pos: usize,
}

/// Emit the executable's ELF header and single program header into the
/// generator's buffer. Size fields stay zero until `patch_footer`.
pub fn write_exec_header(g: &mut Generator) {
    let base = consts::DEFAULT_LOAD_ADDR;
    let headers = consts::EHDR_SIZE as u64 + consts::PHDR_SIZE as u64;

    let buf = &mut g.buf;
    buf.emit_bytes(&consts::ELF_MAGIC);
    buf.emit(consts::ELFCLASS64);
    buf.emit(consts::ELFDATA2LSB);
    buf.emit(consts::EV_CURRENT);
    buf.emit(0); // ELFOSABI_NONE
    buf.emit_bytes(&[0u8; 8]); // padding
    buf.emit_u16(consts::ET_EXEC);
    buf.emit_u16(machine(g.arch));
    buf.emit_u32(consts::EV_CURRENT as u32);
    buf.emit_u64(base + headers); // e_entry: the stub follows the headers
    buf.emit_u64(consts::EHDR_SIZE as u64); // e_phoff
    buf.emit_u64(0); // e_shoff
    buf.emit_u32(0); // e_flags
    buf.emit_u16(consts::EHDR_SIZE);
    buf.emit_u16(consts::PHDR_SIZE);
    buf.emit_u16(1); // e_phnum
    buf.emit_u16(0); // e_shentsize
    buf.emit_u16(0); // e_shnum
    buf.emit_u16(0); // e_shstrndx

    // Program header: one RWX segment mapping the whole file. The
    // writable bit keeps in-text data cells honest.
    buf.emit_u32(consts::PT_LOAD);
    buf.emit_u32(consts::PF_R | consts::PF_W | consts::PF_X);
    buf.emit_u64(0); // p_offset
    buf.emit_u64(base); // p_vaddr
    buf.emit_u64(base); // p_paddr
    let filesz_pos = buf.pos();
    buf.emit_u64(0); // p_filesz, patched
    let memsz_pos = buf.pos();
    buf.emit_u64(0); // p_memsz, patched
    buf.emit_u64(0x1000); // p_align

    g.code_start = buf.pos();
    g.base_addr = base;
    g.elf_patches = Some(ElfPatches {
        filesz_pos,
        memsz_pos,
    });
    g.sync_debug_pos();
}

/// Fill the size fields now that the image is complete.
pub fn patch_footer(g: &mut Generator) {
    let total = g.buf.pos() as u64;
    if let Some(patches) = g.elf_patches {
        g.buf.patch_u64(patches.filesz_pos, total);
        g.buf.patch_u64(patches.memsz_pos, total);
    }
}

/// One symbol of the relocatable object.
struct Sym {
    name: String,
    value: u64,
    info: u8,
    shndx: u16,
}

/// Assemble the relocatable object around the emitted text: symbols for
/// every defined function (plus a `main` alias the C runtime can use),
/// undefined entries for the external referents, PLT32 relocations for
/// their call sites and ABS64 relocations for pooled string addresses.
pub fn build_object(g: &mut Generator) -> Result<Vec<u8>> {
    let text = g.buf.code().to_vec();

    let mut syms: Vec<Sym> = vec![
        Sym {
            name: String::new(),
            value: 0,
            info: 0,
            shndx: 0,
        },
        // Section symbol for .text, referent of data relocations.
        Sym {
            name: String::new(),
            value: 0,
            info: (consts::STB_LOCAL << 4) | consts::STT_SECTION,
            shndx: 1,
        },
    ];
    let first_global = syms.len();

    let mut defined: Vec<(&String, &usize)> = g.fn_addr.iter().collect();
    defined.sort_by_key(|(_, &addr)| addr);
    for (name, &addr) in &defined {
        syms.push(Sym {
            name: (*name).clone(),
            value: addr as u64,
            info: (consts::STB_GLOBAL << 4) | consts::STT_FUNC,
            shndx: 1,
        });
    }
    if let Some(&main_addr) = g.fn_addr.get("main.main") {
        syms.push(Sym {
            name: "main".to_string(),
            value: main_addr as u64,
            info: (consts::STB_GLOBAL << 4) | consts::STT_FUNC,
            shndx: 1,
        });
    }
    let mut externs: Vec<String> = g
        .extern_calls
        .iter()
        .map(|c| c.name.clone())
        .collect();
    externs.sort();
    externs.dedup();
    let extern_base = syms.len();
    for name in &externs {
        syms.push(Sym {
            name: name.clone(),
            value: 0,
            info: (consts::STB_GLOBAL << 4), // NOTYPE
            shndx: 0,
        });
    }

    // String table.
    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::with_capacity(syms.len());
    for sym in &syms {
        if sym.name.is_empty() {
            name_offsets.push(0u32);
        } else {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }
    }

    // Relocations.
    let sym_index = |name: &str| -> u64 {
        (extern_base + externs.iter().position(|n| n == name).unwrap()) as u64
    };
    let mut rela = CodeBuffer::new();
    for call in &g.extern_calls {
        rela.emit_u64(call.pos as u64);
        rela.emit_u64((sym_index(&call.name) << 32) | consts::R_X86_64_PLT32 as u64);
        rela.emit_u64(-4i64 as u64);
    }
    for &(ref_pos, target) in &g.abs_relocs {
        rela.emit_u64(ref_pos as u64);
        rela.emit_u64((1u64 << 32) | consts::R_X86_64_64 as u64);
        rela.emit_u64(target as u64);
    }

    // Section name table: offsets are fixed by construction.
    let shstrtab: &[u8] = b"\0.text\0.rela.text\0.symtab\0.strtab\0.shstrtab\0";
    let (n_text, n_rela, n_symtab, n_strtab, n_shstrtab) = (1u32, 7, 18, 26, 34);

    // Layout.
    let align_to = |v: usize, a: usize| (v + a - 1) & !(a - 1);
    let text_off = align_to(consts::EHDR_SIZE as usize, 16);
    let rela_off = align_to(text_off + text.len(), 8);
    let symtab_off = align_to(rela_off + rela.pos(), 8);
    let symtab_len = syms.len() * consts::SYM_SIZE;
    let strtab_off = symtab_off + symtab_len;
    let shstrtab_off = strtab_off + strtab.len();
    let shoff = align_to(shstrtab_off + shstrtab.len(), 8);

    let mut out = CodeBuffer::with_capacity(shoff + 6 * consts::SHDR_SIZE as usize);
    out.emit_bytes(&consts::ELF_MAGIC);
    out.emit(consts::ELFCLASS64);
    out.emit(consts::ELFDATA2LSB);
    out.emit(consts::EV_CURRENT);
    out.emit(0);
    out.emit_bytes(&[0u8; 8]);
    out.emit_u16(consts::ET_REL);
    out.emit_u16(machine(g.arch));
    out.emit_u32(consts::EV_CURRENT as u32);
    out.emit_u64(0); // e_entry
    out.emit_u64(0); // e_phoff
    out.emit_u64(shoff as u64);
    out.emit_u32(0);
    out.emit_u16(consts::EHDR_SIZE);
    out.emit_u16(0); // e_phentsize
    out.emit_u16(0); // e_phnum
    out.emit_u16(consts::SHDR_SIZE);
    out.emit_u16(6); // e_shnum
    out.emit_u16(5); // e_shstrndx

    while out.pos() < text_off {
        out.emit(0);
    }
    out.emit_bytes(&text);
    while out.pos() < rela_off {
        out.emit(0);
    }
    out.emit_bytes(rela.code());
    while out.pos() < symtab_off {
        out.emit(0);
    }
    for (sym, &name_off) in syms.iter().zip(&name_offsets) {
        out.emit_u32(name_off);
        out.emit(sym.info);
        out.emit(0); // st_other
        out.emit_u16(sym.shndx);
        out.emit_u64(sym.value);
        out.emit_u64(0); // st_size
    }
    out.emit_bytes(&strtab);
    out.emit_bytes(shstrtab);
    while out.pos() < shoff {
        out.emit(0);
    }

    let mut shdr = |name: u32,
                    sh_type: u32,
                    flags: u64,
                    off: usize,
                    size: usize,
                    link: u32,
                    info: u32,
                    align: u64,
                    entsize: u64| {
        out.emit_u32(name);
        out.emit_u32(sh_type);
        out.emit_u64(flags);
        out.emit_u64(0); // sh_addr
        out.emit_u64(off as u64);
        out.emit_u64(size as u64);
        out.emit_u32(link);
        out.emit_u32(info);
        out.emit_u64(align);
        out.emit_u64(entsize);
    };
    // Null section.
    shdr(0, 0, 0, 0, 0, 0, 0, 0, 0);
    shdr(
        n_text,
        consts::SHT_PROGBITS,
        consts::SHF_ALLOC | consts::SHF_EXECINSTR,
        text_off,
        text.len(),
        0,
        0,
        16,
        0,
    );
    shdr(
        n_rela,
        consts::SHT_RELA,
        consts::SHF_INFO_LINK,
        rela_off,
        rela.pos(),
        3, // .symtab
        1, // .text
        8,
        consts::RELA_SIZE as u64,
    );
    shdr(
        n_symtab,
        consts::SHT_SYMTAB,
        0,
        symtab_off,
        symtab_len,
        4, // .strtab
        first_global as u32,
        8,
        consts::SYM_SIZE as u64,
    );
    shdr(n_strtab, consts::SHT_STRTAB, 0, strtab_off, strtab.len(), 0, 0, 1, 0);
    shdr(
        n_shstrtab,
        consts::SHT_STRTAB,
        0,
        shstrtab_off,
        shstrtab.len(),
        0,
        0,
        1,
        0,
    );

    Ok(out.into_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::{Os, Preferences};
    use crate::types::TypeTable;

    fn prefs() -> Preferences {
        let mut p = Preferences::new(Os::Linux);
        p.arch = Some(Arch::Amd64);
        p
    }

    #[test]
    fn test_exec_header_layout() {
        let prefs = prefs();
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_exec_header(&mut g);

        assert_eq!(g.code_start, 120);
        let code = g.buf.code();
        assert_eq!(&code[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(code[4], 2); // 64-bit
        assert_eq!(code[5], 1); // little endian
        assert_eq!(u16::from_le_bytes([code[16], code[17]]), consts::ET_EXEC);
        assert_eq!(u16::from_le_bytes([code[18], code[19]]), consts::EM_X86_64);
        let entry = u64::from_le_bytes(code[24..32].try_into().unwrap());
        assert_eq!(entry, consts::DEFAULT_LOAD_ADDR + 120);
    }

    #[test]
    fn test_footer_sizes_match_buffer() {
        let prefs = prefs();
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_exec_header(&mut g);
        g.buf.emit_bytes(&[0xC3; 7]);
        patch_footer(&mut g);

        let total = g.buf.pos() as u64;
        let code = g.buf.code();
        let filesz = u64::from_le_bytes(code[96..104].try_into().unwrap());
        let memsz = u64::from_le_bytes(code[104..112].try_into().unwrap());
        assert_eq!(filesz, total);
        assert_eq!(memsz, total);
    }

    #[test]
    fn test_arm64_machine_field() {
        let mut prefs = prefs();
        prefs.arch = Some(Arch::Arm64);
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_exec_header(&mut g);
        let code = g.buf.code();
        assert_eq!(u16::from_le_bytes([code[18], code[19]]), consts::EM_AARCH64);
    }

    #[test]
    fn test_object_sections() {
        let prefs = prefs();
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        g.link_object = true;
        g.buf.emit_bytes(&[0x55, 0xC3]);
        g.fn_addr.insert("main.main".to_string(), 0);
        let obj = build_object(&mut g).unwrap();

        assert_eq!(&obj[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(u16::from_le_bytes([obj[16], obj[17]]), consts::ET_REL);
        // Six sections, names in .shstrtab at index 5.
        assert_eq!(u16::from_le_bytes([obj[60], obj[61]]), 6);
        assert_eq!(u16::from_le_bytes([obj[62], obj[63]]), 5);
    }
}
