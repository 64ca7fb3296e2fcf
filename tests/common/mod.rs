//! Synthesizes minimal ET_DYN images for the loading and linking tests.
//!
//! The layout is fixed: one read-write PT_LOAD covering the whole file, a
//! PT_DYNAMIC, and optionally a PT_TLS. Virtual addresses equal file
//! offsets, which keeps every table congruent to its mapped address.
#![allow(dead_code)]

use rtld::abi::*;

pub const EHDR_OFF: usize = 0;
pub const PHDR_OFF: usize = 0x40;
pub const STRTAB_OFF: usize = 0x200;
pub const SYMTAB_OFF: usize = 0x300;
pub const HASH_OFF: usize = 0x480;
pub const RELA_OFF: usize = 0x500;
pub const DYN_OFF: usize = 0x680;
/// Start of the payload area; relocation targets and symbol values live
/// here.
pub const DATA_VADDR: usize = 0x800;
pub const FILE_SIZE: usize = 0xf00;
pub const ENTRY_VADDR: usize = 0x100;

const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;
const DYN_SIZE: usize = 16;
const PHDR_SIZE: usize = 56;

struct RawSym {
    name_off: u32,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

pub struct DylibBuilder {
    strtab: Vec<u8>,
    syms: Vec<RawSym>,
    relas: Vec<(u64, u64, i64)>,
    pltrelas: Vec<(u64, u64, i64)>,
    needed: Vec<u32>,
    extra_dyn: Vec<(i64, u64)>,
    data: Vec<u8>,
    tls: Option<(usize, usize, usize, usize)>,
    bss: usize,
}

impl DylibBuilder {
    pub fn new() -> Self {
        DylibBuilder {
            strtab: vec![0],
            syms: Vec::new(),
            relas: Vec::new(),
            pltrelas: Vec::new(),
            needed: Vec::new(),
            extra_dyn: Vec::new(),
            data: Vec::new(),
            tls: None,
            bss: 0,
        }
    }

    fn add_str(&mut self, s: &str) -> u32 {
        let off = self.strtab.len() as u32;
        self.strtab.extend_from_slice(s.as_bytes());
        self.strtab.push(0);
        off
    }

    fn define(&mut self, name: &str, info: u8, shndx: u16, value: u64, size: u64) -> u32 {
        let name_off = self.add_str(name);
        self.syms.push(RawSym {
            name_off,
            info,
            shndx,
            value,
            size,
        });
        self.syms.len() as u32
    }

    /// A defined global data symbol at `vaddr`.
    pub fn global_object(&mut self, name: &str, vaddr: usize, size: usize) -> u32 {
        self.define(
            name,
            (STB_GLOBAL << 4) | STT_OBJECT,
            1,
            vaddr as u64,
            size as u64,
        )
    }

    /// A defined weak data symbol at `vaddr`.
    pub fn weak_object(&mut self, name: &str, vaddr: usize, size: usize) -> u32 {
        self.define(
            name,
            (STB_WEAK << 4) | STT_OBJECT,
            1,
            vaddr as u64,
            size as u64,
        )
    }

    /// An undefined global reference.
    pub fn global_undef(&mut self, name: &str) -> u32 {
        self.define(name, (STB_GLOBAL << 4) | STT_NOTYPE, SHN_UNDEF, 0, 0)
    }

    /// An undefined weak reference.
    pub fn weak_undef(&mut self, name: &str) -> u32 {
        self.define(name, (STB_WEAK << 4) | STT_NOTYPE, SHN_UNDEF, 0, 0)
    }

    /// A thread-local symbol at `offset` within the TLS template.
    pub fn tls_symbol(&mut self, name: &str, offset: usize, size: usize) -> u32 {
        self.define(
            name,
            (STB_GLOBAL << 4) | STT_TLS,
            1,
            offset as u64,
            size as u64,
        )
    }

    pub fn needed(&mut self, name: &str) -> &mut Self {
        let off = self.add_str(name);
        self.needed.push(off);
        self
    }

    pub fn rela(&mut self, target_vaddr: usize, r_type: u32, sym: u32, addend: i64) -> &mut Self {
        self.relas.push((
            target_vaddr as u64,
            ((sym as u64) << 32) | r_type as u64,
            addend,
        ));
        self
    }

    pub fn plt_rela(&mut self, target_vaddr: usize, r_type: u32, sym: u32, addend: i64) -> &mut Self {
        self.pltrelas.push((
            target_vaddr as u64,
            ((sym as u64) << 32) | r_type as u64,
            addend,
        ));
        self
    }

    pub fn dyn_entry(&mut self, tag: i64, val: u64) -> &mut Self {
        self.extra_dyn.push((tag, val));
        self
    }

    /// Payload bytes placed at [`DATA_VADDR`].
    pub fn data(&mut self, bytes: &[u8]) -> &mut Self {
        self.data = bytes.to_vec();
        self
    }

    /// A TLS template at `vaddr` within the data area.
    pub fn tls_segment(&mut self, vaddr: usize, filesz: usize, memsz: usize, align: usize) -> &mut Self {
        self.tls = Some((vaddr, filesz, memsz, align));
        self
    }

    /// Zero-initialized bytes past the end of the file image.
    pub fn bss(&mut self, size: usize) -> &mut Self {
        self.bss = size;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        assert!(self.strtab.len() <= SYMTAB_OFF - STRTAB_OFF, "strtab overflow");
        assert!(
            (self.syms.len() + 1) * SYM_SIZE <= HASH_OFF - SYMTAB_OFF,
            "symtab overflow"
        );
        assert!(
            (self.relas.len() + self.pltrelas.len()) * RELA_SIZE <= DYN_OFF - RELA_OFF,
            "rela overflow"
        );
        assert!(DATA_VADDR + self.data.len() <= FILE_SIZE, "data overflow");

        let mut file = vec![0u8; FILE_SIZE];

        // ELF header
        file[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        file[4] = ELFCLASS64;
        file[5] = ELFDATA2LSB;
        file[6] = 1; // EV_CURRENT
        w16(&mut file, 0x10, ET_DYN);
        w16(&mut file, 0x12, EM_X86_64);
        w32(&mut file, 0x14, 1);
        w64(&mut file, 0x18, ENTRY_VADDR as u64); // e_entry
        w64(&mut file, 0x20, PHDR_OFF as u64); // e_phoff
        w64(&mut file, 0x28, 0); // e_shoff
        w32(&mut file, 0x30, 0); // e_flags
        w16(&mut file, 0x34, 64); // e_ehsize
        w16(&mut file, 0x36, PHDR_SIZE as u16); // e_phentsize
        let phnum = 2 + self.tls.is_some() as u16;
        w16(&mut file, 0x38, phnum);
        w16(&mut file, 0x3a, 64); // e_shentsize
        w16(&mut file, 0x3c, 0); // e_shnum
        w16(&mut file, 0x3e, 0); // e_shstrndx

        // PT_LOAD over the whole file
        let mut ph = PHDR_OFF;
        write_phdr(
            &mut file,
            ph,
            PT_LOAD,
            PF_R | PF_W,
            0,
            0,
            FILE_SIZE as u64,
            (FILE_SIZE + self.bss) as u64,
            0x1000,
        );
        ph += PHDR_SIZE;
        let dyn_count = self.dynamic_len();
        write_phdr(
            &mut file,
            ph,
            PT_DYNAMIC,
            PF_R | PF_W,
            DYN_OFF as u64,
            DYN_OFF as u64,
            (dyn_count * DYN_SIZE) as u64,
            (dyn_count * DYN_SIZE) as u64,
            8,
        );
        ph += PHDR_SIZE;
        if let Some((vaddr, filesz, memsz, align)) = self.tls {
            write_phdr(
                &mut file,
                ph,
                PT_TLS,
                PF_R,
                vaddr as u64,
                vaddr as u64,
                filesz as u64,
                memsz as u64,
                align as u64,
            );
        }

        // .dynstr
        file[STRTAB_OFF..STRTAB_OFF + self.strtab.len()].copy_from_slice(&self.strtab);

        // .dynsym: the reserved null entry, then the declared symbols
        for (idx, sym) in self.syms.iter().enumerate() {
            let off = SYMTAB_OFF + (idx + 1) * SYM_SIZE;
            w32(&mut file, off, sym.name_off);
            file[off + 4] = sym.info;
            file[off + 5] = 0;
            w16(&mut file, off + 6, sym.shndx);
            w64(&mut file, off + 8, sym.value);
            w64(&mut file, off + 16, sym.size);
        }

        // .hash: one bucket, chains linking every symbol
        let nsyms = self.syms.len() + 1;
        w32(&mut file, HASH_OFF, 1); // nbucket
        w32(&mut file, HASH_OFF + 4, nsyms as u32); // nchain
        w32(
            &mut file,
            HASH_OFF + 8,
            if nsyms > 1 { 1 } else { 0 },
        ); // bucket 0
        for idx in 1..nsyms {
            let next = if idx + 1 < nsyms { idx as u32 + 1 } else { 0 };
            w32(&mut file, HASH_OFF + 12 + idx * 4, next);
        }

        // .rela.dyn then .rela.plt
        for (idx, (offset, info, addend)) in
            self.relas.iter().chain(self.pltrelas.iter()).enumerate()
        {
            let off = RELA_OFF + idx * RELA_SIZE;
            w64(&mut file, off, *offset);
            w64(&mut file, off + 8, *info);
            w64(&mut file, off + 16, *addend as u64);
        }

        // .dynamic
        let mut entries: Vec<(i64, u64)> = Vec::new();
        for needed in &self.needed {
            entries.push((DT_NEEDED, *needed as u64));
        }
        entries.push((DT_STRTAB, STRTAB_OFF as u64));
        entries.push((DT_STRSZ, self.strtab.len() as u64));
        entries.push((DT_SYMTAB, SYMTAB_OFF as u64));
        entries.push((DT_SYMENT, SYM_SIZE as u64));
        entries.push((DT_HASH, HASH_OFF as u64));
        if !self.relas.is_empty() {
            entries.push((DT_RELA, RELA_OFF as u64));
            entries.push((DT_RELASZ, (self.relas.len() * RELA_SIZE) as u64));
            entries.push((DT_RELAENT, RELA_SIZE as u64));
            let rela_count = self
                .relas
                .iter()
                .take_while(|(_, info, _)| *info as u32 == R_X86_64_RELATIVE)
                .count();
            if rela_count > 0 {
                entries.push((DT_RELACOUNT, rela_count as u64));
            }
        }
        if !self.pltrelas.is_empty() {
            entries.push((
                DT_JMPREL,
                (RELA_OFF + self.relas.len() * RELA_SIZE) as u64,
            ));
            entries.push((DT_PLTRELSZ, (self.pltrelas.len() * RELA_SIZE) as u64));
            entries.push((DT_PLTREL, DT_RELA as u64));
        }
        entries.extend_from_slice(&self.extra_dyn);
        entries.push((DT_NULL, 0));
        assert_eq!(entries.len(), self.dynamic_len());
        assert!(entries.len() * DYN_SIZE <= DATA_VADDR - DYN_OFF, "dynamic overflow");
        for (idx, (tag, val)) in entries.iter().enumerate() {
            let off = DYN_OFF + idx * DYN_SIZE;
            w64(&mut file, off, *tag as u64);
            w64(&mut file, off + 8, *val);
        }

        // payload
        file[DATA_VADDR..DATA_VADDR + self.data.len()].copy_from_slice(&self.data);
        file
    }

    fn dynamic_len(&self) -> usize {
        let mut count = self.needed.len() + 5 + self.extra_dyn.len() + 1;
        if !self.relas.is_empty() {
            count += 3;
            let rela_count = self
                .relas
                .iter()
                .take_while(|(_, info, _)| *info as u32 == R_X86_64_RELATIVE)
                .count();
            if rela_count > 0 {
                count += 1;
            }
        }
        if !self.pltrelas.is_empty() {
            count += 3;
        }
        count
    }
}

fn w16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn w32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn w64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
fn write_phdr(
    buf: &mut [u8],
    off: usize,
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
) {
    w32(buf, off, p_type);
    w32(buf, off + 4, p_flags);
    w64(buf, off + 8, p_offset);
    w64(buf, off + 16, p_vaddr);
    w64(buf, off + 24, p_vaddr);
    w64(buf, off + 32, p_filesz);
    w64(buf, off + 40, p_memsz);
    w64(buf, off + 48, p_align);
}

/// Writes `image` into a fresh temp directory and returns (dir, full path).
pub fn write_image(image: &[u8], dir: &std::path::Path, name: &str) -> String {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, image).unwrap();
    path.to_str().unwrap().to_string()
}

/// A per-test scratch directory under the system temp dir.
pub fn scratch_dir(test: &str) -> std::path::PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("rtld-test-{test}-{}", std::process::id()));
    dir
}

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Read one word of a loaded image.
///
/// The caller names a vaddr inside the generated object's PT_LOAD, which
/// the load mapped read-write.
pub unsafe fn read_word(base: usize, vaddr: usize) -> u64 {
    unsafe { ((base + vaddr) as *const u64).read() }
}
