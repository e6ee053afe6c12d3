use std::collections::{BTreeSet, HashMap};

use bytes::{Buf, BufMut, BytesMut};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use opflow_domain::{AddrError, DynValue};

use crate::builder::GraphBuilder;
use crate::graph::Graph;
use crate::ops::OpCode;
use crate::refs::{RawRef, ResultType};

use thiserror::Error;

const MAGIC: &[u8; 4] = b"OFG\0";
const VERSION: u8 = 1;

const KIND_VALUE: u8 = 1;
const KIND_RESOURCE_ADDR: u8 = 2;
const KIND_PROVIDER_ADDR: u8 = 3;
const KIND_NIL: u8 = 4;
const KIND_OPERATION: u8 = 5;
const KIND_WAITER: u8 = 6;
const KIND_WAITER_APPEND: u8 = 7;

/// Failure to serialize or replay a graph. The wire format is not a
/// compatibility boundary across tool versions; plan-file versioning in the
/// surrounding tooling gates which build reads which bytes.
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("invalid wire format: {0}")]
    InvalidFormat(&'static str),

    #[error("unrecognized element kind {0}")]
    UnknownElementKind(u8),

    #[error("unrecognized opcode tag {0}")]
    UnknownOpcode(u8),

    #[error("unrecognized result type tag {0}")]
    UnknownResultType(u8),

    #[error("{opcode} has wrong number of operands: got {got}, want {want}")]
    WrongOperandCount {
        opcode: &'static str,
        got: usize,
        want: usize,
    },

    #[error("{opcode} operand {index} has type {got}, want {want}")]
    OperandTypeMismatch {
        opcode: &'static str,
        index: usize,
        got: ResultType,
        want: ResultType,
    },

    #[error("element {element} refers to later element {target}")]
    ForwardReference { element: usize, target: usize },

    #[error("unparseable address {addr:?}")]
    BadAddress {
        addr: String,
        #[source]
        source: AddrError,
    },

    #[error("constant value does not decode")]
    ValueDecode(#[from] rmp_serde::decode::Error),

    #[error("constant value does not encode")]
    ValueEncode(#[from] rmp_serde::encode::Error),

    #[error("graph contains a waiter cycle and has no serial order")]
    WaiterCycle,

    #[error("operation r[{op}] refers to a later operation")]
    UnorderedOperation { op: usize },

    #[error("duplicate sink for {0}")]
    DuplicateSink(String),
}

impl Graph {
    /// Serialize for embedding in a plan file. Driven by reachability from
    /// the operations and sinks: constants nothing references are discarded.
    pub fn marshal(&self) -> Result<Vec<u8>, MarshalError> {
        marshal(self)
    }

    /// Replay a serialized graph into a fresh builder, validating opcode
    /// arity, operand types, and that every element reference points
    /// backwards.
    pub fn unmarshal(bytes: &[u8]) -> Result<Graph, MarshalError> {
        unmarshal(bytes)
    }
}

// ── Marshal ──────────────────────────────────────────────────────────────────

fn marshal(graph: &Graph) -> Result<Vec<u8>, MarshalError> {
    MarshalPlan::build(graph)?.encode()
}

/// Emission order for the element stream. Operations keep their table order
/// so a round trip preserves the debug representation; waiters are placed
/// before their first referencing operation with whatever components exist by
/// then, and the rest arrive through append elements at the end of the
/// stream. Every reference stays backward-only.
struct MarshalPlan<'g> {
    elements: Vec<Element<'g>>,
    sinks: Vec<(String, u32)>,
    value_elem: HashMap<usize, u32>,
    resource_addr_elem: HashMap<usize, u32>,
    provider_addr_elem: HashMap<usize, u32>,
    nil_elem: HashMap<u8, u32>,
    op_elem: HashMap<usize, u32>,
    waiter_elem: HashMap<usize, u32>,
}

enum Element<'g> {
    Value(&'g DynValue),
    ResourceAddr(String),
    ProviderAddr(String),
    Nil(u8),
    Operation { opcode: OpCode, operands: Vec<u32> },
    Waiter(Vec<u32>),
    WaiterAppend { target: u32, components: Vec<u32> },
}

impl<'g> MarshalPlan<'g> {
    fn build(graph: &'g Graph) -> Result<Self, MarshalError> {
        let mut plan = MarshalPlan {
            elements: Vec::new(),
            sinks: Vec::new(),
            value_elem: HashMap::new(),
            resource_addr_elem: HashMap::new(),
            provider_addr_elem: HashMap::new(),
            nil_elem: HashMap::new(),
            op_elem: HashMap::new(),
            waiter_elem: HashMap::new(),
        };

        // Reachability from operations and sinks.
        let mut used_values = vec![false; graph.values.len()];
        let mut used_resource_addrs = vec![false; graph.resource_addrs.len()];
        let mut used_provider_addrs = vec![false; graph.provider_addrs.len()];
        let mut used_waiters = vec![false; graph.waiters.len()];
        let mut used_nils: BTreeSet<u8> = BTreeSet::new();
        let mut queue: Vec<RawRef> = graph
            .operations
            .iter()
            .flat_map(|op| op.operands.iter().copied())
            .chain(graph.sinks.values().copied())
            .collect();
        while let Some(r) = queue.pop() {
            match r {
                RawRef::ConstValue(i) => used_values[i] = true,
                RawRef::ConstResourceAddr(i) => used_resource_addrs[i] = true,
                RawRef::ConstProviderAddr(i) => used_provider_addrs[i] = true,
                RawRef::OpResult(..) => {} // operations always serialize
                RawRef::Waiter(i) => {
                    if !used_waiters[i] {
                        used_waiters[i] = true;
                        queue.extend(graph.waiters[i].iter().copied());
                    }
                }
                RawRef::Nil(ty) => {
                    used_nils.insert(result_type_tag(ty));
                }
            }
        }

        // A waiter that transitively contains itself has no serial order (and
        // could never complete at runtime either).
        let mut cycle_check: DiGraph<(), ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = graph
            .waiters
            .iter()
            .map(|_| cycle_check.add_node(()))
            .collect();
        for (w, components) in graph.waiters.iter().enumerate() {
            for component in components {
                if let RawRef::Waiter(inner) = component {
                    cycle_check.add_edge(nodes[w], nodes[*inner], ());
                }
            }
        }
        if is_cyclic_directed(&cycle_check) {
            return Err(MarshalError::WaiterCycle);
        }

        // Constants first, in table order.
        for (i, used) in used_values.iter().enumerate() {
            if *used {
                let id = plan.next_id();
                plan.value_elem.insert(i, id);
                plan.elements.push(Element::Value(&graph.values[i]));
            }
        }
        for (i, used) in used_resource_addrs.iter().enumerate() {
            if *used {
                let id = plan.next_id();
                plan.resource_addr_elem.insert(i, id);
                plan.elements
                    .push(Element::ResourceAddr(graph.resource_addrs[i].to_string()));
            }
        }
        for (i, used) in used_provider_addrs.iter().enumerate() {
            if *used {
                let id = plan.next_id();
                plan.provider_addr_elem.insert(i, id);
                plan.elements
                    .push(Element::ProviderAddr(graph.provider_addrs[i].to_string()));
            }
        }
        for tag in used_nils {
            let id = plan.next_id();
            plan.nil_elem.insert(tag, id);
            plan.elements.push(Element::Nil(tag));
        }

        // Operations in table order, waiters just before first use.
        let mut deferred: Vec<(usize, RawRef)> = Vec::new();
        for (i, op) in graph.operations.iter().enumerate() {
            for operand in &op.operands {
                if let RawRef::Waiter(w) = operand {
                    plan.emit_waiter(graph, *w, &mut deferred);
                }
            }
            let operands = op
                .operands
                .iter()
                .map(|r| {
                    plan.ref_elem(r)
                        .ok_or(MarshalError::UnorderedOperation { op: i })
                })
                .collect::<Result<Vec<u32>, MarshalError>>()?;
            let id = plan.next_id();
            plan.op_elem.insert(i, id);
            plan.elements.push(Element::Operation {
                opcode: op.opcode,
                operands,
            });
        }

        // Waiters reachable only through sinks.
        for (w, used) in used_waiters.iter().enumerate() {
            if *used {
                plan.emit_waiter(graph, w, &mut deferred);
            }
        }

        // Late close-blocker registrations. Everything is assigned by now.
        let mut appends: HashMap<usize, Vec<u32>> = HashMap::new();
        for (w, r) in deferred {
            let id = plan
                .ref_elem(&r)
                .ok_or(MarshalError::UnorderedOperation { op: w })?;
            appends.entry(w).or_default().push(id);
        }
        let mut append_order: Vec<usize> = appends.keys().copied().collect();
        append_order.sort_unstable();
        for w in append_order {
            let target = plan.waiter_elem[&w];
            plan.elements.push(Element::WaiterAppend {
                target,
                components: appends.remove(&w).unwrap_or_default(),
            });
        }

        // Sink targets are all assigned by now; order by address string for
        // a deterministic stream.
        for (addr, target) in &graph.sinks {
            let id = plan
                .ref_elem(target)
                .ok_or(MarshalError::InvalidFormat("sink target was not emitted"))?;
            plan.sinks.push((addr.to_string(), id));
        }
        plan.sinks.sort();

        Ok(plan)
    }

    fn next_id(&self) -> u32 {
        self.elements.len() as u32
    }

    fn ref_elem(&self, r: &RawRef) -> Option<u32> {
        match r {
            RawRef::ConstValue(i) => self.value_elem.get(i).copied(),
            RawRef::ConstResourceAddr(i) => self.resource_addr_elem.get(i).copied(),
            RawRef::ConstProviderAddr(i) => self.provider_addr_elem.get(i).copied(),
            RawRef::OpResult(i, _) => self.op_elem.get(i).copied(),
            RawRef::Waiter(i) => self.waiter_elem.get(i).copied(),
            RawRef::Nil(ty) => self.nil_elem.get(&result_type_tag(*ty)).copied(),
        }
    }

    /// Emit waiter `w` (and any waiters it contains, depth-first) with the
    /// components that already have element ids; later components go to
    /// `deferred` and become append elements.
    fn emit_waiter(&mut self, graph: &'g Graph, w: usize, deferred: &mut Vec<(usize, RawRef)>) {
        if self.waiter_elem.contains_key(&w) {
            return;
        }
        let components = graph.waiters[w].clone();
        for component in &components {
            if let RawRef::Waiter(inner) = component {
                self.emit_waiter(graph, *inner, deferred);
            }
        }
        let mut ready = Vec::new();
        for component in components {
            match self.ref_elem(&component) {
                Some(id) => ready.push(id),
                None => deferred.push((w, component)),
            }
        }
        let id = self.next_id();
        self.waiter_elem.insert(w, id);
        self.elements.push(Element::Waiter(ready));
    }

    fn encode(&self) -> Result<Vec<u8>, MarshalError> {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u32(self.elements.len() as u32);
        for element in &self.elements {
            match element {
                Element::Value(value) => {
                    buf.put_u8(KIND_VALUE);
                    let encoded = rmp_serde::to_vec(value)?;
                    buf.put_u32(encoded.len() as u32);
                    buf.put_slice(&encoded);
                }
                Element::ResourceAddr(s) => {
                    buf.put_u8(KIND_RESOURCE_ADDR);
                    buf.put_u32(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                }
                Element::ProviderAddr(s) => {
                    buf.put_u8(KIND_PROVIDER_ADDR);
                    buf.put_u32(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                }
                Element::Nil(tag) => {
                    buf.put_u8(KIND_NIL);
                    buf.put_u8(*tag);
                }
                Element::Operation { opcode, operands } => {
                    buf.put_u8(KIND_OPERATION);
                    buf.put_u8(opcode_tag(*opcode));
                    buf.put_u8(operands.len() as u8);
                    for id in operands {
                        buf.put_u32(*id);
                    }
                }
                Element::Waiter(components) => {
                    buf.put_u8(KIND_WAITER);
                    buf.put_u32(components.len() as u32);
                    for id in components {
                        buf.put_u32(*id);
                    }
                }
                Element::WaiterAppend { target, components } => {
                    buf.put_u8(KIND_WAITER_APPEND);
                    buf.put_u32(*target);
                    buf.put_u32(components.len() as u32);
                    for id in components {
                        buf.put_u32(*id);
                    }
                }
            }
        }
        buf.put_u32(self.sinks.len() as u32);
        for (addr, id) in &self.sinks {
            buf.put_u32(addr.len() as u32);
            buf.put_slice(addr.as_bytes());
            buf.put_u32(*id);
        }
        Ok(buf.to_vec())
    }
}

fn result_type_tag(ty: ResultType) -> u8 {
    ResultType::ALL
        .iter()
        .position(|t| *t == ty)
        .expect("result type missing from ALL") as u8
}

fn opcode_tag(opcode: OpCode) -> u8 {
    OpCode::ALL
        .iter()
        .position(|o| *o == opcode)
        .expect("opcode missing from ALL") as u8
}

// ── Unmarshal ────────────────────────────────────────────────────────────────

fn unmarshal(bytes: &[u8]) -> Result<Graph, MarshalError> {
    let mut reader = Reader { buf: bytes };
    if reader.take(4)? != MAGIC {
        return Err(MarshalError::InvalidFormat("bad magic"));
    }
    if reader.u8()? != VERSION {
        return Err(MarshalError::InvalidFormat("unsupported version"));
    }

    let builder = GraphBuilder::new();
    let element_count = reader.u32()? as usize;
    // None marks elements (waiter appends) that nothing may refer to.
    let mut elems: Vec<Option<RawRef>> = Vec::new();

    for element in 0..element_count {
        let resolve = |elems: &[Option<RawRef>], target: usize| -> Result<RawRef, MarshalError> {
            if target >= element {
                return Err(MarshalError::ForwardReference { element, target });
            }
            elems[target].ok_or(MarshalError::InvalidFormat(
                "reference to a non-referencable element",
            ))
        };

        match reader.u8()? {
            KIND_VALUE => {
                let value: DynValue = rmp_serde::from_slice(reader.len_bytes()?)?;
                elems.push(Some(builder.const_value(value).erase()));
            }
            KIND_RESOURCE_ADDR => {
                let s = reader.str()?;
                let addr = s.parse().map_err(|source| MarshalError::BadAddress {
                    addr: s.to_string(),
                    source,
                })?;
                elems.push(Some(builder.const_resource_addr(addr).erase()));
            }
            KIND_PROVIDER_ADDR => {
                let s = reader.str()?;
                let addr = s.parse().map_err(|source| MarshalError::BadAddress {
                    addr: s.to_string(),
                    source,
                })?;
                elems.push(Some(builder.const_provider_addr(addr).erase()));
            }
            KIND_NIL => {
                let tag = reader.u8()?;
                let ty = ResultType::ALL
                    .get(tag as usize)
                    .copied()
                    .ok_or(MarshalError::UnknownResultType(tag))?;
                elems.push(Some(RawRef::Nil(ty)));
            }
            KIND_OPERATION => {
                let tag = reader.u8()?;
                let opcode = OpCode::ALL
                    .get(tag as usize)
                    .copied()
                    .ok_or(MarshalError::UnknownOpcode(tag))?;
                let got = reader.u8()? as usize;
                let mut operands = Vec::with_capacity(got);
                for _ in 0..got {
                    let target = reader.u32()? as usize;
                    operands.push(resolve(&elems, target)?);
                }
                let expected = opcode.operand_types();
                if got != expected.len() {
                    return Err(MarshalError::WrongOperandCount {
                        opcode: opcode.name(),
                        got,
                        want: expected.len(),
                    });
                }
                for (index, (operand, want)) in operands.iter().zip(expected).enumerate() {
                    if operand.result_type() != *want {
                        return Err(MarshalError::OperandTypeMismatch {
                            opcode: opcode.name(),
                            index,
                            got: operand.result_type(),
                            want: *want,
                        });
                    }
                }
                let raw = builder
                    .try_push_op(opcode, operands)
                    .map_err(|_| MarshalError::InvalidFormat("inconsistent operand reference"))?;
                elems.push(Some(raw));
            }
            KIND_WAITER => {
                let count = reader.u32()? as usize;
                let mut components = Vec::with_capacity(count);
                for _ in 0..count {
                    let target = reader.u32()? as usize;
                    components.push(resolve(&elems, target)?);
                }
                elems.push(Some(builder.new_growable_waiter(components)));
            }
            KIND_WAITER_APPEND => {
                let target = reader.u32()? as usize;
                let target_ref = resolve(&elems, target)?;
                let RawRef::Waiter(waiter) = target_ref else {
                    return Err(MarshalError::InvalidFormat(
                        "waiter append targets a non-waiter element",
                    ));
                };
                let count = reader.u32()? as usize;
                let mut components = Vec::with_capacity(count);
                for _ in 0..count {
                    let component = reader.u32()? as usize;
                    components.push(resolve(&elems, component)?);
                }
                builder.append_to_waiter(waiter, components);
                elems.push(None);
            }
            other => return Err(MarshalError::UnknownElementKind(other)),
        }
    }

    let sink_count = reader.u32()? as usize;
    for _ in 0..sink_count {
        let s = reader.str()?;
        let addr: opflow_domain::ResourceInstanceAddr =
            s.parse().map_err(|source| MarshalError::BadAddress {
                addr: s.to_string(),
                source,
            })?;
        let target = reader.u32()? as usize;
        let target_ref = elems
            .get(target)
            .copied()
            .flatten()
            .ok_or(MarshalError::InvalidFormat("sink refers to a missing element"))?;
        builder
            .try_set_sink(addr, target_ref)
            .map_err(|addr| MarshalError::DuplicateSink(addr.to_string()))?;
    }

    if !reader.buf.is_empty() {
        return Err(MarshalError::InvalidFormat("trailing data"));
    }
    Ok(builder.finish())
}

struct Reader<'a> {
    buf: &'a [u8],
}


impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MarshalError> {
        if self.buf.len() < n {
            return Err(MarshalError::InvalidFormat("unexpected end of input"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, MarshalError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, MarshalError> {
        let mut chunk = self.take(4)?;
        Ok(chunk.get_u32())
    }

    fn len_bytes(&mut self) -> Result<&'a [u8], MarshalError> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    fn str(&mut self) -> Result<&'a str, MarshalError> {
        std::str::from_utf8(self.len_bytes()?)
            .map_err(|_| MarshalError::InvalidFormat("invalid utf-8 in address"))
    }
}
