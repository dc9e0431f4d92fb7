//! PE32+ container
//!
//! Windows x64 executables: DOS stub, COFF header, PE32+ optional
//! header, a `.text` section (entered past an 8-byte stdout-handle
//! cell) and an `.idata` section importing `GetStdHandle`, `WriteFile`
//! and `ExitProcess` from kernel32. The section RVAs are fixed so IAT
//! call displacements are computable during emission; raw sizes are
//! patched in the footer.

use crate::diag::n_error;
use crate::gen::Generator;
use crate::Result;

/// PE constants
pub mod consts {
    pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
    pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"

    pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
    pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
    pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;

    pub const PE32_PLUS_MAGIC: u16 = 0x020B;
    pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;

    pub const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x0100;
    pub const IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE: u16 = 0x8000;

    pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
    pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
    pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
    pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
    pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

    pub const SECTION_ALIGNMENT: u32 = 0x1000;
    pub const FILE_ALIGNMENT: u32 = 0x200;

    pub const DEFAULT_IMAGE_BASE: u64 = 0x1_4000_0000;

    /// Fixed section plan: headers in the first file page, text from
    /// RVA 0x1000 (two virtual pages), imports at RVA 0x3000.
    pub const TEXT_RVA: u32 = 0x1000;
    pub const TEXT_FILE_OFF: u32 = 0x200;
    pub const TEXT_VSIZE_MAX: u32 = 0x2000;
    pub const IDATA_RVA: u32 = 0x3000;
    pub const SIZE_OF_IMAGE: u32 = 0x4000;
}

/// Fixed layout facts the backend needs while emitting code.
#[derive(Debug, Clone, Copy)]
pub struct PeLayout {
    pub image_base: u64,
    pub text_rva: u32,
    pub text_file_off: u32,
    pub iat_get_std_handle: u32,
    pub iat_write_file: u32,
    pub iat_exit_process: u32,
    /// Buffer offset of the stdout-handle cell at the start of .text.
    pub stdout_cell: usize,
}

/// Section-header fields the footer pass must fill in.
#[derive(Debug, Clone, Copy)]
pub struct PePatches {
    pub size_of_code_pos: usize,
    pub text_vsize_pos: usize,
    pub text_rawsize_pos: usize,
    pub idata_vsize_pos: usize,
    pub idata_rawsize_pos: usize,
    pub idata_ptr_pos: usize,
}

/// Emit DOS stub, COFF and optional headers and the two section
/// headers; pad to the text file offset and reserve the stdout cell.
pub fn write_header(g: &mut Generator) {
    // Import layout inside .idata: descriptor (20) + null (20), then
    // the lookup table and address table (4 qwords each), then names.
    let ilt_rva = consts::IDATA_RVA + 40;
    let iat_rva = consts::IDATA_RVA + 72;

    let buf = &mut g.buf;
    // DOS header: magic, 58 reserved bytes, e_lfanew at offset 60.
    buf.emit_u16(consts::DOS_MAGIC);
    buf.emit_bytes(&[0u8; 58]);
    buf.emit_u32(64);

    buf.emit_u32(consts::PE_SIGNATURE);

    // COFF header
    buf.emit_u16(consts::IMAGE_FILE_MACHINE_AMD64);
    buf.emit_u16(2); // sections
    buf.emit_u32(0); // timestamp
    buf.emit_u32(0); // symbol table
    buf.emit_u32(0); // symbol count
    buf.emit_u16(240); // optional header size
    buf.emit_u16(consts::IMAGE_FILE_EXECUTABLE_IMAGE | consts::IMAGE_FILE_LARGE_ADDRESS_AWARE);

    // Optional header (PE32+)
    buf.emit_u16(consts::PE32_PLUS_MAGIC);
    buf.emit(14); // linker major
    buf.emit(0); // linker minor
    let size_of_code_pos = buf.pos();
    buf.emit_u32(0); // SizeOfCode, patched
    buf.emit_u32(0x200); // SizeOfInitializedData
    buf.emit_u32(0); // SizeOfUninitializedData
    buf.emit_u32(consts::TEXT_RVA + 8); // entry: past the stdout cell
    buf.emit_u32(consts::TEXT_RVA); // BaseOfCode
    buf.emit_u64(consts::DEFAULT_IMAGE_BASE);
    buf.emit_u32(consts::SECTION_ALIGNMENT);
    buf.emit_u32(consts::FILE_ALIGNMENT);
    buf.emit_u16(6); // OS major
    buf.emit_u16(0);
    buf.emit_u16(0); // image version
    buf.emit_u16(0);
    buf.emit_u16(6); // subsystem major
    buf.emit_u16(0);
    buf.emit_u32(0); // win32 version
    buf.emit_u32(consts::SIZE_OF_IMAGE);
    buf.emit_u32(consts::FILE_ALIGNMENT); // SizeOfHeaders
    buf.emit_u32(0); // checksum
    buf.emit_u16(consts::IMAGE_SUBSYSTEM_WINDOWS_CUI);
    buf.emit_u16(
        consts::IMAGE_DLLCHARACTERISTICS_NX_COMPAT
            | consts::IMAGE_DLLCHARACTERISTICS_TERMINAL_SERVER_AWARE,
    );
    buf.emit_u64(0x10_0000); // stack reserve
    buf.emit_u64(0x1000); // stack commit
    buf.emit_u64(0x10_0000); // heap reserve
    buf.emit_u64(0x1000); // heap commit
    buf.emit_u32(0); // loader flags
    buf.emit_u32(16); // rva-and-sizes count
    for index in 0..16u32 {
        match index {
            1 => {
                buf.emit_u32(consts::IDATA_RVA); // import directory
                buf.emit_u32(40);
            }
            12 => {
                buf.emit_u32(iat_rva); // IAT directory
                buf.emit_u32(32);
            }
            _ => {
                buf.emit_u32(0);
                buf.emit_u32(0);
            }
        }
    }

    // .text section header
    buf.emit_str_fixed(".text", 8);
    let text_vsize_pos = buf.pos();
    buf.emit_u32(0); // virtual size, patched
    buf.emit_u32(consts::TEXT_RVA);
    let text_rawsize_pos = buf.pos();
    buf.emit_u32(0); // raw size, patched
    buf.emit_u32(consts::TEXT_FILE_OFF);
    buf.emit_u32(0); // relocations
    buf.emit_u32(0); // line numbers
    buf.emit_u32(0); // counts
    // Writable so the stdout cell can live in text, like the RWX simple
    // ELF segment.
    buf.emit_u32(
        consts::IMAGE_SCN_CNT_CODE
            | consts::IMAGE_SCN_MEM_EXECUTE
            | consts::IMAGE_SCN_MEM_READ
            | consts::IMAGE_SCN_MEM_WRITE,
    );

    // .idata section header
    buf.emit_str_fixed(".idata", 8);
    let idata_vsize_pos = buf.pos();
    buf.emit_u32(0); // virtual size, patched
    buf.emit_u32(consts::IDATA_RVA);
    let idata_rawsize_pos = buf.pos();
    buf.emit_u32(0); // raw size, patched
    let idata_ptr_pos = buf.pos();
    buf.emit_u32(0); // raw pointer, patched
    buf.emit_u32(0);
    buf.emit_u32(0);
    buf.emit_u32(0);
    buf.emit_u32(
        consts::IMAGE_SCN_CNT_INITIALIZED_DATA
            | consts::IMAGE_SCN_MEM_READ
            | consts::IMAGE_SCN_MEM_WRITE,
    );

    while buf.pos() < consts::TEXT_FILE_OFF as usize {
        buf.emit(0);
    }
    let stdout_cell = buf.pos();
    buf.emit_u64(0); // stdout handle cell

    g.code_start = consts::TEXT_FILE_OFF as usize;
    g.base_addr = consts::DEFAULT_IMAGE_BASE;
    g.addr_delta = (consts::TEXT_RVA - consts::TEXT_FILE_OFF) as u64;
    g.pe = Some(PeLayout {
        image_base: consts::DEFAULT_IMAGE_BASE,
        text_rva: consts::TEXT_RVA,
        text_file_off: consts::TEXT_FILE_OFF,
        iat_get_std_handle: iat_rva,
        iat_write_file: iat_rva + 8,
        iat_exit_process: iat_rva + 16,
        stdout_cell,
    });
    g.pe_patch_slots = Some(PePatches {
        size_of_code_pos,
        text_vsize_pos,
        text_rawsize_pos,
        idata_vsize_pos,
        idata_rawsize_pos,
        idata_ptr_pos,
    });
    g.sync_debug_pos();
}

/// Append the import section and patch every size field.
pub fn write_footer(g: &mut Generator) -> Result<()> {
    let text_end = g.buf.pos();
    let text_size = (text_end - consts::TEXT_FILE_OFF as usize) as u32;
    if text_size > consts::TEXT_VSIZE_MAX {
        return Err(n_error(format!(
            "text section ({text_size} bytes) exceeds the fixed PE layout ({} bytes)",
            consts::TEXT_VSIZE_MAX
        )));
    }

    align_file(g, consts::FILE_ALIGNMENT as usize);
    let idata_off = g.buf.pos();

    // Hint/name entries come after the two thunk tables.
    let names_rva = consts::IDATA_RVA + 104;
    let entries = ["GetStdHandle", "WriteFile", "ExitProcess"];
    let mut name_rvas = Vec::new();
    let mut cursor = names_rva;
    for name in entries {
        name_rvas.push(cursor);
        // hint + name + NUL, padded to even length
        let mut len = 2 + name.len() as u32 + 1;
        if len % 2 == 1 {
            len += 1;
        }
        cursor += len;
    }
    let dll_name_rva = cursor;

    // Import descriptor for kernel32.dll, then the null terminator.
    g.buf.emit_u32(consts::IDATA_RVA + 40); // OriginalFirstThunk
    g.buf.emit_u32(0); // timestamp
    g.buf.emit_u32(0); // forwarder chain
    g.buf.emit_u32(dll_name_rva);
    g.buf.emit_u32(consts::IDATA_RVA + 72); // FirstThunk (IAT)
    g.buf.emit_bytes(&[0u8; 20]);

    // Import lookup table, then the address table with identical
    // entries; the loader overwrites the IAT at load time.
    for _ in 0..2 {
        for &rva in &name_rvas {
            g.buf.emit_u64(rva as u64);
        }
        g.buf.emit_u64(0);
    }

    for (name, &rva) in entries.iter().zip(&name_rvas) {
        debug_assert_eq!(
            rva - consts::IDATA_RVA,
            (g.buf.pos() - idata_off) as u32,
            "hint/name layout drifted"
        );
        g.buf.emit_u16(0); // hint
        g.buf.emit_bytes(name.as_bytes());
        g.buf.emit(0);
        if (2 + name.len() + 1) % 2 == 1 {
            g.buf.emit(0);
        }
    }
    g.buf.emit_bytes(b"kernel32.dll\0");
    if g.buf.pos() % 2 == 1 {
        g.buf.emit(0);
    }

    let idata_size = (g.buf.pos() - idata_off) as u32;
    align_file(g, consts::FILE_ALIGNMENT as usize);

    if let Some(patches) = g.pe_patch_slots {
        let text_raw = (idata_off - consts::TEXT_FILE_OFF as usize) as u32;
        let idata_raw = (g.buf.pos() - idata_off) as u32;
        g.buf.patch_u32(patches.size_of_code_pos, text_raw);
        g.buf.patch_u32(patches.text_vsize_pos, text_size);
        g.buf.patch_u32(patches.text_rawsize_pos, text_raw);
        g.buf.patch_u32(patches.idata_vsize_pos, idata_size);
        g.buf.patch_u32(patches.idata_rawsize_pos, idata_raw);
        g.buf.patch_u32(patches.idata_ptr_pos, idata_off as u32);
    }
    Ok(())
}

fn align_file(g: &mut Generator, alignment: usize) {
    while g.buf.pos() % alignment != 0 {
        g.buf.emit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::{Arch, Os, Preferences};
    use crate::types::TypeTable;

    fn prefs() -> Preferences {
        let mut p = Preferences::new(Os::Windows);
        p.arch = Some(Arch::Amd64);
        p
    }

    #[test]
    fn test_dos_and_pe_magic() {
        let prefs = prefs();
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        let code = g.buf.code();
        assert_eq!(&code[0..2], b"MZ");
        assert_eq!(&code[64..68], &[0x50, 0x45, 0x00, 0x00]);
        let machine = u16::from_le_bytes([code[68], code[69]]);
        assert_eq!(machine, consts::IMAGE_FILE_MACHINE_AMD64);
    }

    #[test]
    fn test_entry_point_past_stdout_cell() {
        let prefs = prefs();
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        // AddressOfEntryPoint lives 16 bytes into the optional header.
        let opt = 88;
        let entry = u32::from_le_bytes(g.buf.code()[opt + 16..opt + 20].try_into().unwrap());
        assert_eq!(entry, consts::TEXT_RVA + 8);
        assert_eq!(g.pe.unwrap().stdout_cell, consts::TEXT_FILE_OFF as usize);
        assert_eq!(g.buf.pos(), consts::TEXT_FILE_OFF as usize + 8);
    }

    #[test]
    fn test_footer_sizes_consistent() {
        let prefs = prefs();
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        g.buf.emit_bytes(&[0xC3; 32]);
        write_footer(&mut g).unwrap();

        let total = g.buf.pos();
        assert_eq!(total % consts::FILE_ALIGNMENT as usize, 0);
        let patches = g.pe_patch_slots.unwrap();
        let code = g.buf.code();
        let text_raw =
            u32::from_le_bytes(code[patches.text_rawsize_pos..patches.text_rawsize_pos + 4].try_into().unwrap());
        let idata_ptr =
            u32::from_le_bytes(code[patches.idata_ptr_pos..patches.idata_ptr_pos + 4].try_into().unwrap());
        let idata_raw =
            u32::from_le_bytes(code[patches.idata_rawsize_pos..patches.idata_rawsize_pos + 4].try_into().unwrap());
        assert_eq!(consts::TEXT_FILE_OFF + text_raw, idata_ptr);
        assert_eq!(idata_ptr + idata_raw, total as u32);
    }

    #[test]
    fn test_iat_rvas() {
        let prefs = prefs();
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        let pe = g.pe.unwrap();
        assert_eq!(pe.iat_get_std_handle, consts::IDATA_RVA + 72);
        assert_eq!(pe.iat_write_file, consts::IDATA_RVA + 80);
        assert_eq!(pe.iat_exit_process, consts::IDATA_RVA + 88);
    }

    #[test]
    fn test_oversized_text_rejected() {
        let prefs = prefs();
        let mut table = TypeTable::new();
        let mut g = Generator::new(&prefs, &mut table).unwrap();
        write_header(&mut g);
        g.buf
            .emit_bytes(&vec![0x90; consts::TEXT_VSIZE_MAX as usize + 1]);
        assert!(write_footer(&mut g).is_err());
    }
}
