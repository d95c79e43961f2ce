//! Extracts function symbols from the symbol tables of an ELF image.

use std::fs::File;
use std::path::Path;

use goblin::elf::section_header::SHN_UNDEF;
use goblin::elf::sym::{Sym, STB_GLOBAL, STB_WEAK, STT_FUNC};
use goblin::elf::Elf;
use memmap2::Mmap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("{path} is not a readable ELF image: {source}")]
    Parse {
        path: String,
        source: goblin::error::Error,
    },
}

/// Which symbol table of the image to read.
///
/// The static table carries the full picture for the main executable; shared
/// libraries are usually stripped down to their dynamic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolTable {
    Static,
    Dynamic,
}

/// One function-class symbol table entry, name still mangled.
///
/// `class` follows the nm(1) convention: `T` global text, `W` weak, `t`
/// local text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSymbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub class: char,
}

/// Reads the function symbols of the requested table. Static reads retain
/// class `T` only; dynamic reads retain `T` and `W` (weak symbols catch
/// library aliases). An empty result is fine; only an unreadable or
/// non-ELF file is an error.
pub fn read_symbols(path: &Path, table: SymbolTable) -> Result<Vec<RawSymbol>, ElfError> {
    let file = File::open(path).map_err(|source| ElfError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let map = unsafe { Mmap::map(&file) }.map_err(|source| ElfError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let elf = Elf::parse(&map).map_err(|source| ElfError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let (syms, strtab) = match table {
        SymbolTable::Static => (&elf.syms, &elf.strtab),
        SymbolTable::Dynamic => (&elf.dynsyms, &elf.dynstrtab),
    };

    let mut out = Vec::new();
    for sym in syms.iter() {
        if !defined(&sym) {
            continue;
        }
        let class = match classify(&sym) {
            Some(class) if retained(class, table) => class,
            _ => continue,
        };
        let name = match strtab.get_at(sym.st_name) {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        out.push(RawSymbol {
            name: name.to_string(),
            value: sym.st_value,
            size: sym.st_size,
            class,
        });
    }
    Ok(out)
}

/// Dynamic tables also list imports: undefined entries whose value
/// belongs to whichever image eventually provides them.
fn defined(sym: &Sym) -> bool {
    sym.st_shndx != SHN_UNDEF as usize
}

fn classify(sym: &Sym) -> Option<char> {
    if sym.st_type() != STT_FUNC {
        return None;
    }
    match sym.st_bind() {
        STB_WEAK => Some('W'),
        STB_GLOBAL => Some('T'),
        _ => Some('t'),
    }
}

fn retained(class: char, table: SymbolTable) -> bool {
    match table {
        SymbolTable::Static => class == 'T',
        SymbolTable::Dynamic => class == 'T' || class == 'W',
    }
}
