//! Writes the call tree as a Callgrind dump
//! (https://valgrind.org/docs/manual/cl-format.html).
//!
//! Functions are numbered by their index in the address index, so the
//! name table and the per-node blocks agree by construction. A sampling
//! profile has no real call counts; every edge is written as a single
//! call carrying the child's inclusive cost.

use std::collections::BTreeSet;
use std::io::{self, Write};

use crate::core::calltree::{CallTree, NodeId};
use crate::core::symbols::AddressIndex;

pub fn write(w: &mut impl Write, tree: &CallTree, index: &AddressIndex) -> io::Result<()> {
    let total: u64 = tree.nodes().map(|n| n.self_cost).sum();
    let used: BTreeSet<u32> = tree.nodes().map(|n| n.func.0).collect();

    writeln!(w, "events: Instructions")?;
    writeln!(w, "summary: {}", total)?;
    writeln!(w)?;
    for id in &used {
        writeln!(w, "fn=({}) {}", id, index.get(crate::core::symbols::FuncId(*id)).name)?;
    }
    writeln!(w)?;

    if let Some(root) = tree.root() {
        print_costs(w, tree, root)?;
    }
    writeln!(w)?;
    Ok(())
}

fn print_costs(w: &mut impl Write, tree: &CallTree, node: NodeId) -> io::Result<()> {
    let n = tree.node(node);
    writeln!(w, "fn=({})", n.func.0)?;
    writeln!(w, "1 {}", n.self_cost)?;

    for &child in &n.children {
        let c = tree.node(child);
        writeln!(w, "cfn=({})", c.func.0)?;
        writeln!(w, "calls={} 1", c.inclusive())?;
        writeln!(w, "1 {}", c.inclusive())?;
    }

    for &child in &n.children {
        writeln!(w)?;
        print_costs(w, tree, child)?;
    }
    Ok(())
}
