//! Call graph over concrete module instances
//!
//! Nodes are (module instance, method) pairs or free functions, so two
//! instances of one class are distinct callers. Edges record whether the
//! callee runs inline or across a fork boundary.

use crate::error::FreezeError;
use crate::module::ModuleId;
use crate::store::Store;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallSite {
    /// Method by index in the module's class.
    Method(ModuleId, u32),
    /// Free function by index in the store's function table.
    Function(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Call,
    Fork,
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    graph: DiGraphMap<CallSite, CallKind>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_site(&mut self, site: CallSite) {
        self.graph.add_node(site);
    }

    /// Adds an edge. A fork edge is never downgraded to a plain call.
    pub fn add_call(&mut self, caller: CallSite, callee: CallSite, kind: CallKind) {
        let kind = match self.graph.edge_weight(caller, callee) {
            Some(CallKind::Fork) => CallKind::Fork,
            _ => kind,
        };
        self.graph.add_edge(caller, callee, kind);
    }

    pub fn site_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn fork_count(&self) -> usize {
        self.graph.all_edges().filter(|(_, _, k)| **k == CallKind::Fork).count()
    }

    pub fn callees(&self, site: CallSite) -> Vec<(CallSite, CallKind)> {
        self.graph
            .edges(site)
            .map(|(_, callee, kind)| (callee, *kind))
            .collect()
    }

    /// Every site reachable from `from`, including itself.
    pub fn reachable_from(&self, from: CallSite) -> Vec<CallSite> {
        if !self.graph.contains_node(from) {
            return Vec::new();
        }
        let mut dfs = Dfs::new(&self.graph, from);
        let mut out = Vec::new();
        while let Some(site) = dfs.next(&self.graph) {
            out.push(site);
        }
        out
    }

    /// A call cycle, if any. Self-recursion counts.
    pub fn find_cycle(&self) -> Option<Vec<CallSite>> {
        tarjan_scc(&self.graph).into_iter().find(|component| match component.as_slice() {
            [single] => self.graph.contains_edge(*single, *single),
            _ => true,
        })
    }

    /// Rejects recursive call chains, which cannot be inlined.
    pub fn check_acyclic(&self, store: &Store) -> Result<(), FreezeError> {
        match self.find_cycle() {
            None => Ok(()),
            Some(cycle) => {
                let names: Vec<String> = cycle.iter().map(|site| describe(store, *site)).collect();
                Err(FreezeError::Malformed(format!("recursive call chain: {}", names.join(" -> "))))
            }
        }
    }
}

/// Human-readable name of a call site.
pub fn describe(store: &Store, site: CallSite) -> String {
    match site {
        CallSite::Method(module, index) => {
            let method = store
                .class_of(module)
                .ok()
                .and_then(|class| class.methods.get_index(index as usize))
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| format!("#{index}"));
            let path = store.path_of(module);
            format!("{path}.{method}")
        }
        CallSite::Function(index) => format!("function#{index}"),
    }
}
