//! The global address→function index.
//!
//! Built once at startup from the target's executable mappings, then
//! read-only. The executable image contributes its static symbol table
//! (values are already absolute); every other executable mapping
//! contributes its dynamic table, range-filtered and rebased into the
//! target's address space.

use std::io::{self, Write};

use anyhow::{Context, Result};
use log::warn;

use crate::core::demangle::Demangler;
use crate::core::elf::{self, RawSymbol, SymbolTable};
use crate::core::proc_maps::{self, MappedRegion};
use crate::core::types::Pid;

/// A resolved unit of attribution: one function of the target.
///
/// `len` of zero means the entry matches a single address only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub addr: u64,
    pub len: u64,
}

/// Index of a [`Function`] in its [`AddressIndex`]. Call-tree nodes hold
/// these instead of references, which keeps the tree free of lifetimes and
/// of dangling-pointer hazards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

#[derive(Debug, Default)]
pub struct AddressIndex {
    funcs: Vec<Function>,
}

impl AddressIndex {
    /// Builds the index for `pid` from every executable mapping backed by an
    /// absolute path. Unreadable images are skipped with a warning.
    pub fn load(pid: Pid, demangler: Demangler) -> Result<AddressIndex> {
        let exe = proc_maps::process_exe(pid)
            .with_context(|| format!("failed to locate the executable of {}", pid))?;
        let regions = proc_maps::read_process_maps(pid)
            .with_context(|| format!("failed to read the memory map of {}", pid))?;

        let mut funcs = Vec::new();
        for region in &regions {
            if !region.is_exec() {
                continue;
            }
            let path = match &region.path {
                Some(path) if path.is_absolute() => path,
                _ => continue,
            };
            let table = if *path == exe {
                SymbolTable::Static
            } else {
                SymbolTable::Dynamic
            };
            match elf::read_symbols(path, table) {
                Ok(symbols) => {
                    crate::status!(
                        "reading symbols from {} ({})",
                        path.display(),
                        match table {
                            SymbolTable::Static => "exe",
                            SymbolTable::Dynamic => "dynlib",
                        }
                    );
                    collect_region(&mut funcs, region, table, &symbols, demangler);
                }
                Err(e) => warn!("skipping mapping: {}", e),
            }
        }

        Ok(AddressIndex::from_functions(funcs))
    }

    /// Reconciles and wraps an arbitrary function list.
    pub fn from_functions(mut funcs: Vec<Function>) -> AddressIndex {
        reconcile(&mut funcs);
        AddressIndex { funcs }
    }

    /// Finds the function covering `ip`, if any. Misses are normal for
    /// stripped or anonymous code.
    pub fn lookup(&self, ip: u64) -> Option<FuncId> {
        let mut lo = 0;
        let mut hi = self.funcs.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let f = &self.funcs[mid];
            if ip < f.addr {
                hi = mid;
            } else if ip > f.addr && ip >= f.addr.saturating_add(f.len) {
                lo = mid + 1;
            } else {
                return Some(FuncId(mid as u32));
            }
        }
        None
    }

    pub fn get(&self, id: FuncId) -> &Function {
        &self.funcs[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.funcs.iter()
    }

    /// Dumps the resolved table, one `addr len name` record per line.
    pub fn print(&self, w: &mut impl Write) -> io::Result<()> {
        for f in &self.funcs {
            writeln!(w, "{:#x}\t{}\t{}", f.addr, f.len, f.name)?;
        }
        Ok(())
    }
}

fn collect_region(
    out: &mut Vec<Function>,
    region: &MappedRegion,
    table: SymbolTable,
    symbols: &[RawSymbol],
    demangler: Demangler,
) {
    for sym in symbols {
        let addr = match table {
            // Static symbol values are absolute target-space addresses.
            SymbolTable::Static => sym.value,
            // Dynamic values are file-relative: keep the ones this mapping
            // actually covers and rebase them onto the mapping.
            SymbolTable::Dynamic => {
                if sym.value < region.offset || sym.value >= region.offset + region.extent() {
                    continue;
                }
                sym.value - region.offset + region.start
            }
        };
        let name = demangler(&sym.name).unwrap_or_else(|| sym.name.clone());
        out.push(Function {
            name,
            addr,
            len: sym.size,
        });
    }
}

/// Collapses aliases and overlapping bounds: sort so that the tightest
/// entry of every address comes first, then drop the rest of each address
/// run. Stripped dynamic tables are full of both.
fn reconcile(funcs: &mut Vec<Function>) {
    funcs.sort_by(|a, b| {
        a.addr
            .cmp(&b.addr)
            .then(a.len.cmp(&b.len))
            .then(a.name.len().cmp(&b.name.len()))
    });
    funcs.dedup_by(|next, kept| next.addr == kept.addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::demangle;

    fn f(name: &str, addr: u64, len: u64) -> Function {
        Function {
            name: name.to_string(),
            addr,
            len,
        }
    }

    #[test]
    fn test_reconcile_keeps_tightest_alias() {
        let index = AddressIndex::from_functions(vec![
            f("operator new(unsigned long)", 0x1000, 32),
            f("_Znwm", 0x1000, 16),
        ]);
        assert_eq!(index.len(), 1);
        let kept = index.get(index.lookup(0x1000).unwrap());
        assert_eq!(kept.addr, 0x1000);
        assert_eq!(kept.len, 16);
        assert_eq!(kept.name, "_Znwm");
    }

    #[test]
    fn test_reconcile_tie_breaks_on_name_length() {
        let index = AddressIndex::from_functions(vec![
            f("a_very_long_alias_name", 0x2000, 8),
            f("short", 0x2000, 8),
        ]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(FuncId(0)).name, "short");
    }

    #[test]
    fn test_index_sorted_and_unique() {
        let index = AddressIndex::from_functions(vec![
            f("c", 0x3000, 4),
            f("a", 0x1000, 4),
            f("b", 0x2000, 4),
            f("a2", 0x1000, 2),
        ]);
        let addrs: Vec<u64> = index.iter().map(|f| f.addr).collect();
        assert_eq!(addrs, vec![0x1000, 0x2000, 0x3000]);
        let mut sorted = addrs.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(addrs, sorted);
    }

    #[test]
    fn test_lookup_ranges() {
        let index = AddressIndex::from_functions(vec![
            f("low", 0x1000, 0x100),
            f("mid", 0x2000, 0x10),
            f("high", 0x3000, 0x1),
        ]);
        let low = index.lookup(0x1000).unwrap();
        assert_eq!(index.get(low).name, "low");
        // every address of a covered range resolves to the same function
        assert_eq!(index.lookup(0x10ff), Some(low));
        assert_eq!(index.lookup(0x1080), Some(low));

        assert_eq!(index.lookup(0x1100), None);
        assert_eq!(index.lookup(0xfff), None);
        assert_eq!(index.lookup(0x2010), None);
        assert_eq!(index.lookup(0x9999), None);
        assert!(index.lookup(0x3000).is_some());
    }

    #[test]
    fn test_zero_length_matches_single_address() {
        let index = AddressIndex::from_functions(vec![f("point", 0x4000, 0)]);
        assert!(index.lookup(0x4000).is_some());
        assert_eq!(index.lookup(0x4001), None);
        assert_eq!(index.lookup(0x3fff), None);
    }

    #[test]
    fn test_dynamic_rebase_and_filter() {
        let region = MappedRegion {
            start: 0x7f00_0000,
            end: 0x7f00_1000,
            offset: 0x2000,
            perms: "r-xp".to_string(),
            dev: "00:00".to_string(),
            inode: 0,
            path: None,
        };
        let symbols = vec![
            RawSymbol {
                name: "inside".to_string(),
                value: 0x2100,
                size: 8,
                class: 'T',
            },
            RawSymbol {
                name: "below".to_string(),
                value: 0x1fff,
                size: 8,
                class: 'T',
            },
            RawSymbol {
                name: "beyond".to_string(),
                value: 0x3000,
                size: 8,
                class: 'W',
            },
        ];

        let mut funcs = Vec::new();
        collect_region(
            &mut funcs,
            &region,
            SymbolTable::Dynamic,
            &symbols,
            demangle::identity,
        );
        assert_eq!(funcs, vec![f("inside", 0x7f00_0100, 8)]);

        // static values pass through untranslated
        let mut funcs = Vec::new();
        collect_region(
            &mut funcs,
            &region,
            SymbolTable::Static,
            &symbols[..1],
            demangle::identity,
        );
        assert_eq!(funcs, vec![f("inside", 0x2100, 8)]);
    }

    #[test]
    fn test_demangled_display_names() {
        let symbols = vec![RawSymbol {
            name: "_Znwm".to_string(),
            value: 0x100,
            size: 4,
            class: 'T',
        }];
        let region = MappedRegion {
            start: 0x100,
            end: 0x200,
            offset: 0,
            perms: "r-xp".to_string(),
            dev: "00:00".to_string(),
            inode: 0,
            path: None,
        };
        let mut funcs = Vec::new();
        collect_region(
            &mut funcs,
            &region,
            SymbolTable::Static,
            &symbols,
            demangle::auto,
        );
        assert_eq!(funcs[0].name, "operator new(unsigned long)");
    }

    #[test]
    fn test_print_symbols() {
        let index = AddressIndex::from_functions(vec![f("work", 0x1000, 64)]);
        let mut out = Vec::new();
        index.print(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0x1000\t64\twork\n");
    }
}
