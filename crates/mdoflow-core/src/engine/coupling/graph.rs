use crate::core::ids::{DisciplineId, VarId};
use crate::engine::discipline::NodeBehavior;
use crate::engine::error::EngineError;
use crate::engine::factory::Factory;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Variables a discipline (or a whole subtree seen from outside) reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DisciplineIo {
    pub inputs: BTreeSet<VarId>,
    pub outputs: BTreeSet<VarId>,
    pub paths: HashMap<VarId, String>,
}

impl DisciplineIo {
    fn absorb_ports(&mut self, factory: &Factory, id: DisciplineId) -> Result<(), EngineError> {
        let node = factory.get(id)?;
        for port in &node.inputs {
            self.inputs.insert(port.var);
            self.paths.insert(port.var, port.path.clone());
        }
        for port in &node.outputs {
            self.outputs.insert(port.var);
            self.paths.insert(port.var, port.path.clone());
        }
        Ok(())
    }

    pub fn path(&self, var: VarId) -> String {
        self.paths
            .get(&var)
            .cloned()
            .unwrap_or_else(|| format!("{var:?}"))
    }
}

/// Collects the external inputs and outputs of the subtree rooted at `id`.
///
/// Inputs produced inside the subtree are internal and not reported. An evaluation driver
/// only exposes its own outputs since its sub-process outputs are sampled, not published.
pub(crate) fn subtree_io(factory: &Factory, id: DisciplineId) -> Result<DisciplineIo, EngineError> {
    let node = factory.get(id)?;
    let mut io = DisciplineIo::default();
    if node.children.is_empty() {
        io.absorb_ports(factory, id)?;
        return Ok(io);
    }

    let mut inner = DisciplineIo::default();
    for member in factory.subtree(id) {
        inner.absorb_ports(factory, member)?;
    }
    let external_inputs: BTreeSet<VarId> =
        inner.inputs.difference(&inner.outputs).copied().collect();

    if matches!(node.behavior, NodeBehavior::EvalDriver(_)) {
        io.absorb_ports(factory, id)?;
        io.inputs.extend(external_inputs);
        io.paths.extend(inner.paths);
        return Ok(io);
    }
    io.inputs = external_inputs;
    io.outputs = inner.outputs;
    io.paths = inner.paths;
    Ok(io)
}

/// Data-dependency graph over the children of a coupling.
///
/// Node `i` has an edge to node `j` when `j` reads a variable written by `i`.
#[derive(Debug, Clone)]
pub(crate) struct CouplingGraph {
    io: Vec<DisciplineIo>,
    edges: Vec<BTreeSet<usize>>,
}

impl CouplingGraph {
    pub fn new(io: Vec<DisciplineIo>) -> Self {
        let n = io.len();
        let mut edges = vec![BTreeSet::new(); n];
        for (i, source) in io.iter().enumerate() {
            for (j, target) in io.iter().enumerate() {
                if i != j && !source.outputs.is_disjoint(&target.inputs) {
                    edges[i].insert(j);
                }
            }
        }
        Self { io, edges }
    }

    pub fn io(&self, index: usize) -> &DisciplineIo {
        &self.io[index]
    }

    pub fn len(&self) -> usize {
        self.io.len()
    }

    pub fn has_self_loop(&self, index: usize) -> bool {
        let io = &self.io[index];
        !io.outputs.is_disjoint(&io.inputs)
    }

    /// Strongly connected components (Tarjan), each sorted by child index.
    pub fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        struct Tarjan<'g> {
            edges: &'g [BTreeSet<usize>],
            index: Vec<Option<usize>>,
            lowlink: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            next_index: usize,
            components: Vec<Vec<usize>>,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.index[v] = Some(self.next_index);
                self.lowlink[v] = self.next_index;
                self.next_index += 1;
                self.stack.push(v);
                self.on_stack[v] = true;

                for &w in self.edges[v].iter() {
                    match self.index[w] {
                        None => {
                            self.visit(w);
                            self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                        }
                        Some(w_index) if self.on_stack[w] => {
                            self.lowlink[v] = self.lowlink[v].min(w_index);
                        }
                        Some(_) => {}
                    }
                }

                if Some(self.lowlink[v]) == self.index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    self.components.push(component);
                }
            }
        }

        let n = self.len();
        let mut tarjan = Tarjan {
            edges: &self.edges,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next_index: 0,
            components: Vec::new(),
        };
        for v in 0..n {
            if tarjan.index[v].is_none() {
                tarjan.visit(v);
            }
        }
        tarjan.components
    }

    /// Components in an order where every producer runs before its consumers.
    ///
    /// Among components that are ready at the same time, the one holding the lowest child
    /// index goes first, so independent children keep their declaration order.
    pub fn execution_sequence(&self) -> Vec<Vec<usize>> {
        let components = self.strongly_connected_components();
        let mut owner = vec![0; self.len()];
        for (c, component) in components.iter().enumerate() {
            for &v in component {
                owner[v] = c;
            }
        }

        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        let mut in_degree = vec![0usize; components.len()];
        for (v, targets) in self.edges.iter().enumerate() {
            for &w in targets {
                let (a, b) = (owner[v], owner[w]);
                if a != b && successors[a].insert(b) {
                    in_degree[b] += 1;
                }
            }
        }

        let mut ready: BTreeMap<usize, usize> = components
            .iter()
            .enumerate()
            .filter(|(c, _)| in_degree[*c] == 0)
            .map(|(c, component)| (component[0], c))
            .collect();
        let mut sequence = Vec::with_capacity(components.len());
        while let Some((_, c)) = ready.pop_first() {
            sequence.push(components[c].clone());
            for &next in &successors[c] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(components[next][0], next);
                }
            }
        }
        sequence
    }

    /// Variables written by one member of `component` and read by a member of it.
    pub fn strong_couplings(&self, component: &[usize]) -> Vec<VarId> {
        let outputs: BTreeSet<VarId> = component
            .iter()
            .flat_map(|&i| self.io[i].outputs.iter().copied())
            .collect();
        let inputs: BTreeSet<VarId> = component
            .iter()
            .flat_map(|&i| self.io[i].inputs.iter().copied())
            .collect();
        outputs.intersection(&inputs).copied().collect()
    }

    /// Splits a component into consecutive groups with no data dependency inside a group.
    ///
    /// A member joins the current group unless it reads something the group writes.
    pub fn parallel_batches(&self, component: &[usize]) -> Vec<Vec<usize>> {
        let mut batches: Vec<Vec<usize>> = Vec::new();
        let mut written: BTreeSet<VarId> = BTreeSet::new();
        for &member in component {
            let io = &self.io[member];
            let depends = !io.inputs.is_disjoint(&written);
            match batches.last_mut() {
                Some(batch) if !depends => batch.push(member),
                _ => {
                    batches.push(vec![member]);
                    written.clear();
                }
            }
            written.extend(io.outputs.iter().copied());
        }
        batches
    }
}
