//! Recursive materialisation of a remote object graph.
//!
//! [`DebugSession::inspect`] expands a [`Variable`] into a concrete value
//! tree by repeated `variables` queries. The debuggee graph may be cyclic
//! and references may expire mid-walk, so the result is an arena of nodes
//! addressed by [`NodeId`]: children hold ids, never owned subtrees, and a
//! per-call `reference → NodeId` map guarantees that every occurrence of a
//! remote reference resolves to the same node. A node is registered in
//! that map *before* its children are fetched, which is what terminates
//! cycles.
//!
//! Expansion is best-effort: a failed child fetch (an expired reference,
//! say) leaves that node's container empty rather than failing the walk.

use std::{collections::HashMap, future::Future, pin::Pin};

use crate::{
    session::{DebugSession, MinecraftSession},
    types::{PrimitiveValue, Variable, VariableValue, VariablesQuery},
    TRACE_TARGET,
};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectOptions {
    /// Container nesting budget; a node at depth 0 collapses to the
    /// agent's rendered string.
    pub max_depth: u32,
    /// Expand `__proto__` children into prototype links instead of
    /// skipping them.
    pub inspect_proto: bool,
}

impl Default for InspectOptions {
    fn default() -> Self {
        Self {
            max_depth: 16,
            inspect_proto: false,
        }
    }
}

/// One materialised value: a scalar, a rendered-only leaf, or a container
/// in the arena.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectedValue {
    Primitive(PrimitiveValue),
    /// The agent's rendered string: non-object non-primitives, and objects
    /// past the depth budget.
    Rendered(String),
    Node(NodeId),
}

impl InspectedValue {
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            InspectedValue::Node(id) => Some(*id),
            _ => None,
        }
    }
}

/// The children of a materialised container.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectedChildren {
    /// Ordered array elements.
    Items(Vec<InspectedValue>),
    /// Object properties, in agent order.
    Entries(Vec<(String, InspectedValue)>),
}

/// A materialised container, tagged with the remote reference it came
/// from so callers can round-trip back to the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectedNode {
    pub reference: i64,
    pub children: InspectedChildren,
    /// Prototype link, only populated under
    /// [`InspectOptions::inspect_proto`].
    pub prototype: Option<NodeId>,
}

impl InspectedNode {
    /// Look up an object property by name.
    pub fn entry(&self, name: &str) -> Option<&InspectedValue> {
        match &self.children {
            InspectedChildren::Entries(entries) => entries
                .iter()
                .find(|(entry, _)| entry == name)
                .map(|(_, value)| value),
            InspectedChildren::Items(_) => None,
        }
    }

    /// Array element by index.
    pub fn item(&self, index: usize) -> Option<&InspectedValue> {
        match &self.children {
            InspectedChildren::Items(items) => items.get(index),
            InspectedChildren::Entries(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match &self.children {
            InspectedChildren::Items(items) => items.len(),
            InspectedChildren::Entries(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The product of one `inspect` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub root: InspectedValue,
    nodes: Vec<InspectedNode>,
}

impl Inspection {
    pub fn node(&self, id: NodeId) -> &InspectedNode {
        &self.nodes[id]
    }

    pub fn root_node(&self) -> Option<&InspectedNode> {
        self.root.node_id().map(|id| self.node(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl DebugSession {
    /// Materialise `var` into a concrete value tree.
    ///
    /// Never fails: fetch errors degrade to empty containers and the rest
    /// of the graph is still produced.
    pub async fn inspect(&self, var: &Variable, options: InspectOptions) -> Inspection {
        let mut walker = Walker {
            session: self,
            options,
            nodes: Vec::new(),
            seen: HashMap::new(),
        };
        let root = walker.value(var, options.max_depth).await;
        Inspection {
            root,
            nodes: walker.nodes,
        }
    }
}

impl MinecraftSession {
    pub async fn inspect(&self, var: &Variable, options: InspectOptions) -> Inspection {
        self.core().inspect(var, options).await
    }
}

struct Walker<'a> {
    session: &'a DebugSession,
    options: InspectOptions,
    nodes: Vec<InspectedNode>,
    seen: HashMap<i64, NodeId>,
}

impl Walker<'_> {
    /// Materialise one variable. Boxed because the recursion depth follows
    /// the remote graph.
    fn value<'s>(
        &'s mut self,
        var: &'s Variable,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = InspectedValue> + Send + 's>> {
        Box::pin(async move {
            if let Some(primitive) = var.value.primitive() {
                return InspectedValue::Primitive(primitive);
            }

            let rendered = var.value.rendered().unwrap_or_default();
            let indexed_count = match &var.value {
                VariableValue::Object { indexed_count, .. } => *indexed_count,
                // Functions and opaque values don't expand.
                _ => return InspectedValue::Rendered(rendered.to_string()),
            };

            // A reference we have already started is always the same node,
            // even past the depth budget; this is what keeps cycles and
            // diamonds identity-preserving.
            if let Some(&id) = self.seen.get(&var.reference) {
                return InspectedValue::Node(id);
            }

            if depth == 0 {
                return InspectedValue::Rendered(rendered.to_string());
            }

            let is_array = indexed_count.is_some();
            let id = self.nodes.len();
            self.nodes.push(InspectedNode {
                reference: var.reference,
                children: if is_array {
                    InspectedChildren::Items(Vec::new())
                } else {
                    InspectedChildren::Entries(Vec::new())
                },
                prototype: None,
            });
            self.seen.insert(var.reference, id);

            let query = match indexed_count {
                Some(count) => VariablesQuery::indexed(0, count),
                None => VariablesQuery::default(),
            };
            let children = match self.session.variables(var.reference, &query).await {
                Ok(children) => children,
                Err(err) => {
                    // Best-effort: the reference may have expired while we
                    // were walking. The container stays empty.
                    tracing::debug!(
                        target: TRACE_TARGET,
                        event = "inspect_children_failed",
                        reference = var.reference,
                        error = %err
                    );
                    return InspectedValue::Node(id);
                }
            };

            if is_array {
                let mut items = Vec::with_capacity(children.len());
                for child in &children {
                    items.push(self.value(child, depth - 1).await);
                }
                self.nodes[id].children = InspectedChildren::Items(items);
            } else {
                let mut entries = Vec::with_capacity(children.len());
                for child in &children {
                    if child.name == "__proto__" {
                        if self.options.inspect_proto {
                            if let InspectedValue::Node(proto) =
                                self.value(child, depth - 1).await
                            {
                                self.nodes[id].prototype = Some(proto);
                            }
                        }
                        continue;
                    }
                    let value = self.value(child, depth - 1).await;
                    entries.push((child.name.clone(), value));
                }
                self.nodes[id].children = InspectedChildren::Entries(entries);
            }

            InspectedValue::Node(id)
        })
    }
}
