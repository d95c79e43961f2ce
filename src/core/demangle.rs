//! Symbol demangling.
//!
//! The index takes the demangler as a plain function so the rest of the
//! pipeline never depends on any particular scheme; `identity` keeps every
//! name as found, which only costs readability.

/// A demangler maps a raw symbol name to a display name, or `None` to keep
/// the raw name.
pub type Demangler = fn(&str) -> Option<String>;

/// Tries Rust mangling first (Rust symbols are also well-formed C++
/// manglings, so order matters), then the Itanium C++ ABI.
pub fn auto(raw: &str) -> Option<String> {
    if let Ok(demangled) = rustc_demangle::try_demangle(raw) {
        return Some(format!("{:#}", demangled));
    }
    if let Ok(symbol) = cpp_demangle::Symbol::new(raw) {
        return Some(symbol.to_string());
    }
    None
}

/// Keeps every name mangled.
pub fn identity(_raw: &str) -> Option<String> {
    None
}
