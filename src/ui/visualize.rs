//! Renders the call tree as an indented list.
//!
//! Children are sorted by inclusive cost and pruned below a percentage
//! threshold. An ASCII gutter keeps subtree connectors readable at any
//! depth:
//!
//! ```text
//! main (100.0% | 0.0% self)
//!  \_ parse (60.0% | 10.0% self)
//!  |   \_ lex (50.0% | 50.0% self)
//!  \_ eval (40.0% | 40.0% self)
//! ```

use std::io::{self, Write};

use terminal_size::{terminal_size, Width};

use crate::core::calltree::{CallTree, NodeId};
use crate::core::symbols::AddressIndex;

const GUTTER: usize = 4;
const DEFAULT_NAME_WIDTH: usize = 60;

#[derive(Debug, Clone)]
pub struct Options {
    /// Hide subtrees below this percentage of the session total.
    pub threshold: f64,
    /// Show at most this many levels.
    pub max_depth: Option<usize>,
    /// Keep the start-up chain instead of skipping to the first
    /// interesting frame.
    pub full_stack: bool,
    /// Column budget for function names; the terminal width when `None`.
    pub name_width: Option<usize>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            threshold: 5.0,
            max_depth: None,
            full_stack: false,
            name_width: None,
        }
    }
}

pub fn render(
    w: &mut impl Write,
    tree: &CallTree,
    index: &AddressIndex,
    opts: &Options,
) -> io::Result<()> {
    let root = match tree.root() {
        Some(root) => root,
        None => return Ok(()),
    };
    let total = tree.total_cost();
    if total == 0 {
        return Ok(());
    }

    // crt start-up frames carry no self cost and a single child each;
    // nobody wants to scroll past them every time
    let mut start = root;
    if !opts.full_stack {
        while tree.node(start).self_cost == 0 && tree.node(start).children.len() == 1 {
            start = tree.node(start).children[0];
        }
    }

    let name_width = opts.name_width.unwrap_or_else(name_width_for_terminal);
    let mut prefix = String::new();
    show_layer(
        w, tree, index, opts, total, name_width, start, 0, false, &mut prefix,
    )
}

fn name_width_for_terminal() -> usize {
    match terminal_size() {
        // leave room for the gutter and the percentage suffix
        Some((Width(w), _)) if (w as usize) > 40 => DEFAULT_NAME_WIDTH.min(w as usize - 24),
        _ => DEFAULT_NAME_WIDTH,
    }
}

#[allow(clippy::too_many_arguments)]
fn show_layer(
    w: &mut impl Write,
    tree: &CallTree,
    index: &AddressIndex,
    opts: &Options,
    total: u64,
    name_width: usize,
    node: NodeId,
    depth: usize,
    is_last: bool,
    prefix: &mut String,
) -> io::Result<()> {
    let n = tree.node(node);
    let percent_full = n.inclusive() as f64 * 100.0 / total as f64;
    let percent_self = n.self_cost as f64 * 100.0 / total as f64;

    if depth > 0 {
        write!(w, "{} \\_ ", &prefix[..(depth - 1) * GUTTER])?;
    }
    let name = &index.get(n.func).name;
    let display: String = name.chars().take(name_width).collect();
    writeln!(w, "{} ({:.1}% | {:.1}% self)", display, percent_full, percent_self)?;

    if let Some(max) = opts.max_depth {
        if depth + 1 >= max {
            return Ok(());
        }
    }

    let mut children = n.children.clone();
    children.sort_by_key(|&c| std::cmp::Reverse(tree.node(c).inclusive()));
    let visible = children
        .iter()
        .take_while(|&&c| tree.node(c).inclusive() as f64 * 100.0 / total as f64 >= opts.threshold)
        .count();
    if visible == 0 {
        return Ok(());
    }

    if depth > 0 {
        prefix.truncate((depth - 1) * GUTTER);
        prefix.push_str(if is_last { "    " } else { " |  " });
    }
    for (i, &child) in children[..visible].iter().enumerate() {
        show_layer(
            w,
            tree,
            index,
            opts,
            total,
            name_width,
            child,
            depth + 1,
            i + 1 == visible,
            prefix,
        )?;
    }
    Ok(())
}
