use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use opflow_domain::{DynValue, ProviderInstanceAddr, ResourceInstanceAddr};

use crate::ops::Operation;
use crate::refs::RawRef;

/// An immutable execution graph: the constant tables, the operations, the
/// waiters, and the sink map exporting final objects to the evaluator.
/// Produced by [`GraphBuilder::finish`](crate::GraphBuilder::finish) or by
/// unmarshalling; never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub(crate) values: Vec<DynValue>,
    pub(crate) resource_addrs: Vec<ResourceInstanceAddr>,
    pub(crate) provider_addrs: Vec<ProviderInstanceAddr>,
    pub(crate) operations: Vec<Operation>,
    pub(crate) waiters: Vec<Vec<RawRef>>,
    pub(crate) sinks: BTreeMap<ResourceInstanceAddr, RawRef>,
}

impl Graph {
    pub fn values(&self) -> &[DynValue] {
        &self.values
    }

    pub fn resource_addr(&self, index: usize) -> Option<&ResourceInstanceAddr> {
        self.resource_addrs.get(index)
    }

    pub fn provider_addr(&self, index: usize) -> Option<&ProviderInstanceAddr> {
        self.provider_addrs.get(index)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn waiter(&self, index: usize) -> Option<&[RawRef]> {
        self.waiters.get(index).map(Vec::as_slice)
    }

    pub fn sinks(&self) -> &BTreeMap<ResourceInstanceAddr, RawRef> {
        &self.sinks
    }

    /// Short human description of an operation, for runtime bug reports:
    /// the opcode plus the resource (or, failing that, provider) address
    /// transitively reachable through its operands.
    pub fn operation_summary(&self, op_index: usize) -> String {
        let Some(op) = self.operations.get(op_index) else {
            return format!("unknown operation r[{}]", op_index);
        };
        match self.reachable_addr(op_index) {
            Some(ReachableAddr::Resource(addr)) => format!("{} for {}", op.opcode, addr),
            Some(ReachableAddr::Provider(addr)) => format!("{} for {}", op.opcode, addr),
            None => op.opcode.to_string(),
        }
    }

    /// The resource instance address an operation is about, when one is
    /// reachable through its operands. Drives the executor's postcondition
    /// calls.
    pub fn operation_resource_addr(&self, op_index: usize) -> Option<&ResourceInstanceAddr> {
        match self.reachable_addr(op_index) {
            Some(ReachableAddr::Resource(addr)) => Some(addr),
            _ => None,
        }
    }

    fn reachable_addr(&self, op_index: usize) -> Option<ReachableAddr<'_>> {
        let mut queue: VecDeque<RawRef> = self
            .operations
            .get(op_index)?
            .operands
            .iter()
            .copied()
            .collect();
        let mut visited = HashSet::new();
        let mut provider_fallback = None;
        while let Some(r) = queue.pop_front() {
            if !visited.insert(r) {
                continue;
            }
            match r {
                RawRef::ConstResourceAddr(i) => {
                    if let Some(addr) = self.resource_addrs.get(i) {
                        return Some(ReachableAddr::Resource(addr));
                    }
                }
                RawRef::ConstProviderAddr(i) => {
                    if provider_fallback.is_none() {
                        provider_fallback = self.provider_addrs.get(i);
                    }
                }
                RawRef::OpResult(i, _) => {
                    if let Some(op) = self.operations.get(i) {
                        queue.extend(op.operands.iter().copied());
                    }
                }
                RawRef::Waiter(i) => {
                    if let Some(components) = self.waiters.get(i) {
                        queue.extend(components.iter().copied());
                    }
                }
                RawRef::ConstValue(_) | RawRef::Nil(_) => {}
            }
        }
        provider_fallback.map(ReachableAddr::Provider)
    }

    pub(crate) fn render_operand(&self, r: RawRef, out: &mut String, visiting: &mut HashSet<usize>) {
        match r {
            RawRef::ConstValue(i) => out.push_str(&format!("v[{}]", i)),
            RawRef::ConstResourceAddr(i) => match self.resource_addrs.get(i) {
                Some(addr) => out.push_str(&addr.to_string()),
                None => out.push_str("<dangling addr>"),
            },
            RawRef::ConstProviderAddr(i) => match self.provider_addrs.get(i) {
                Some(addr) => out.push_str(&addr.to_string()),
                None => out.push_str("<dangling addr>"),
            },
            RawRef::OpResult(i, _) => out.push_str(&format!("r[{}]", i)),
            RawRef::Waiter(i) => {
                if !visiting.insert(i) {
                    out.push_str("await(...)"); // waiter cycle; rejected elsewhere
                    return;
                }
                out.push_str("await(");
                if let Some(components) = self.waiters.get(i) {
                    for (n, component) in components.iter().enumerate() {
                        if n > 0 {
                            out.push_str(", ");
                        }
                        self.render_operand(*component, out, visiting);
                    }
                }
                out.push(')');
                visiting.remove(&i);
            }
            RawRef::Nil(_) => out.push_str("nil"),
        }
    }

    /// Escape hatch for tests that need graphs the typed builder refuses to
    /// produce.
    #[doc(hidden)]
    pub fn from_raw_parts(
        values: Vec<DynValue>,
        resource_addrs: Vec<ResourceInstanceAddr>,
        provider_addrs: Vec<ProviderInstanceAddr>,
        operations: Vec<Operation>,
        waiters: Vec<Vec<RawRef>>,
        sinks: BTreeMap<ResourceInstanceAddr, RawRef>,
    ) -> Graph {
        Graph {
            values,
            resource_addrs,
            provider_addrs,
            operations,
            waiters,
            sinks,
        }
    }
}

enum ReachableAddr<'a> {
    Resource(&'a ResourceInstanceAddr),
    Provider(&'a ProviderInstanceAddr),
}

/// The textual debug representation: one line per constant, operation, and
/// sink. Stable across marshal round trips, so tests compare these strings.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.values.iter().enumerate() {
            writeln!(f, "v[{}] = {};", i, value)?;
        }
        for (i, op) in self.operations.iter().enumerate() {
            let mut args = String::new();
            let mut visiting = HashSet::new();
            for (n, operand) in op.operands.iter().enumerate() {
                if n > 0 {
                    args.push_str(", ");
                }
                self.render_operand(*operand, &mut args, &mut visiting);
            }
            writeln!(f, "r[{}] = {}({});", i, op.opcode, args)?;
        }
        let mut sinks: Vec<(String, RawRef)> = self
            .sinks
            .iter()
            .map(|(addr, r)| (addr.to_string(), *r))
            .collect();
        sinks.sort_by(|a, b| a.0.cmp(&b.0));
        for (addr, r) in sinks {
            let mut target = String::new();
            self.render_operand(r, &mut target, &mut HashSet::new());
            writeln!(f, "{} = {};", addr, target)?;
        }
        Ok(())
    }
}
