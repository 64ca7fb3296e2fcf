//! Traditional SysV hash table
use crate::{
    arch::ElfSymbol,
    hash::{ElfHashTable, PreCompute},
    symbol::{SymbolInfo, SymbolTable},
};

#[repr(C)]
struct SysvHashHeader {
    nbucket: u32,
    nchain: u32,
}

pub(crate) struct SysvHash {
    header: SysvHashHeader,
    buckets: *const u32,
    chains: *const u32,
}

impl SysvHash {
    pub(crate) fn parse(ptr: *const u8) -> SysvHash {
        const HEADER_SIZE: usize = size_of::<SysvHashHeader>();
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(unsafe { core::slice::from_raw_parts(ptr, HEADER_SIZE) });
        let header: SysvHashHeader = unsafe { core::mem::transmute(bytes) };
        let bucket_size = header.nbucket as usize * size_of::<u32>();

        let buckets = unsafe { ptr.add(HEADER_SIZE) };
        let chains = unsafe { buckets.add(bucket_size) };
        SysvHash {
            header,
            buckets: buckets.cast(),
            chains: chains.cast(),
        }
    }
}

impl ElfHashTable for SysvHash {
    fn hash(name: &[u8]) -> u64 {
        let mut hash = 0u32;
        #[allow(unused_assignments)]
        let mut g = 0u32;
        for byte in name {
            hash = (hash << 4) + u32::from(*byte);
            g = hash & 0xf0000000;
            if g != 0 {
                hash ^= g >> 24;
            }
            hash &= !g;
        }
        hash as u64
    }

    /// `nchain` equals the number of symbol table entries.
    #[inline]
    fn count_syms(&self) -> usize {
        self.header.nchain as usize
    }

    fn lookup<'sym>(
        table: &'sym SymbolTable,
        symbol: &SymbolInfo,
        precompute: &mut PreCompute,
    ) -> Option<&'sym ElfSymbol> {
        let hash = if let Some(hash) = precompute.sysv_hash {
            hash
        } else {
            let hash = SysvHash::hash(symbol.name().as_bytes()) as u32;
            precompute.sysv_hash = Some(hash);
            hash
        };
        let hashtab = table.hashtab.as_sysv().unwrap();
        let bucket_idx = (hash as usize) % hashtab.header.nbucket as usize;
        let mut chain_idx = unsafe { hashtab.buckets.add(bucket_idx).read() as usize };

        // Chain entry 0 terminates the walk.
        loop {
            if chain_idx == 0 {
                return None;
            }
            let cur_symbol = unsafe { &*table.symtab.add(chain_idx) };
            let sym_name = table.strtab.get_str(cur_symbol.st_name());
            if sym_name == symbol.name() && table.check_match(chain_idx, symbol.version()) {
                return Some(cur_symbol);
            }
            chain_idx = unsafe { hashtab.chains.add(chain_idx).read() as usize };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_hash_values() {
        assert_eq!(SysvHash::hash(b""), 0);
        assert_eq!(SysvHash::hash(b"printf"), 0x077905a6);
        assert_eq!(SysvHash::hash(b"exit"), 0x0006cf04);
    }
}
