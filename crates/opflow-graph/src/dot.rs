use std::collections::HashSet;
use std::fmt::Write as _;

use crate::graph::Graph;
use crate::refs::RawRef;

/// Graphviz rendering for diagnostic dumps. The visual details are not a
/// compatibility surface; only the debug string representation is.
impl Graph {
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        out.push_str("digraph opflow {\n");
        out.push_str("  rankdir = LR;\n");
        out.push_str("  node [shape = plaintext, fontname = \"monospace\"];\n");

        for (i, value) in self.values.iter().enumerate() {
            let _ = writeln!(
                out,
                "  v{} [label = <<table border=\"0\" cellborder=\"1\" cellspacing=\"0\">\
                 <tr><td bgcolor=\"lightyellow\">v[{}]</td></tr><tr><td>{}</td></tr></table>>];",
                i,
                i,
                escape(&value.to_string())
            );
        }

        for (i, op) in self.operations.iter().enumerate() {
            let mut rows = format!(
                "<tr><td bgcolor=\"lightblue\" colspan=\"2\"><b>r[{}] = {}</b></td></tr>",
                i, op.opcode
            );
            for (n, operand) in op.operands.iter().enumerate() {
                let mut text = String::new();
                self.render_operand(*operand, &mut text, &mut HashSet::new());
                let _ = write!(
                    rows,
                    "<tr><td>{}</td><td>{}</td></tr>",
                    n,
                    escape(&text)
                );
            }
            let _ = writeln!(
                out,
                "  r{} [label = <<table border=\"0\" cellborder=\"1\" cellspacing=\"0\">{}</table>>];",
                i, rows
            );
            for operand in &op.operands {
                edges_into(&mut out, self, *operand, &format!("r{}", i));
            }
        }

        for (n, (addr, target)) in self.sinks.iter().enumerate() {
            let _ = writeln!(
                out,
                "  s{} [shape = house, label = \"{}\"];",
                n,
                escape(&addr.to_string())
            );
            edges_into(&mut out, self, *target, &format!("s{}", n));
        }

        out.push_str("}\n");
        out
    }
}

/// Draw the edges feeding `target`, flattening waiters into dashed edges from
/// their components.
fn edges_into(out: &mut String, graph: &Graph, source: RawRef, target: &str) {
    let mut queue = vec![(source, false)];
    let mut visited = HashSet::new();
    while let Some((r, via_waiter)) = queue.pop() {
        if !visited.insert(r) {
            continue;
        }
        let style = if via_waiter { " [style = dashed]" } else { "" };
        match r {
            RawRef::ConstValue(i) => {
                let _ = writeln!(out, "  v{} -> {}{};", i, target, style);
            }
            RawRef::OpResult(i, _) => {
                let _ = writeln!(out, "  r{} -> {}{};", i, target, style);
            }
            RawRef::Waiter(i) => {
                if let Some(components) = graph.waiter(i) {
                    queue.extend(components.iter().map(|c| (*c, true)));
                }
            }
            // address constants render inline in the operand rows
            RawRef::ConstResourceAddr(_) | RawRef::ConstProviderAddr(_) | RawRef::Nil(_) => {}
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
