pub mod calltree;
pub mod demangle;
pub mod elf;
pub mod proc_maps;
pub mod ptime;
pub mod symbols;
pub mod tracer;
pub mod types;
pub mod unwinder;
