//! Static, type-directed resolution of [Rule]s into a graph of call sites.
//!
//! Every query `(product, param types)` is resolved to a tree of
//! [GraphNode]s, each being either a parameter or a rule applied within a
//! specific set of parameter types in scope. Nodes live in an arena and
//! refer to each other by [NodeId], which is what allows recursion through
//! [crate::rules::Get]s to be represented as a back edge.
use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::CompileError;
use crate::rules::{DependencyKey, Get, Rule};
use crate::types::{Params, TypeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphNodeKind {
    /// Taken directly from the request parameters.
    Param(TypeKey),
    /// An index into the registered rules.
    Rule(usize),
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    kind: GraphNodeKind,
    params: BTreeSet<TypeKey>,
    inputs: Vec<NodeId>,
    gets: Vec<(Get, NodeId)>,
    used_params: BTreeSet<TypeKey>,
}

impl GraphNode {
    pub fn kind(&self) -> GraphNodeKind {
        self.kind
    }

    /// Parameter types in scope.
    pub fn params(&self) -> &BTreeSet<TypeKey> {
        &self.params
    }

    /// Positional inputs, in declaration order.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn get(&self, get: &Get) -> Option<NodeId> {
        self.gets
            .iter()
            .find(|(g, _)| g == get)
            .map(|(_, id)| *id)
    }

    /// Parameter types this node transitively consumes. Execution nodes are
    /// keyed by these only.
    pub fn used_params(&self) -> &BTreeSet<TypeKey> {
        &self.used_params
    }
}

/// A top-level request shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub product: TypeKey,
    pub params: BTreeSet<TypeKey>,
}

/// The compiled, immutable rule graph.
#[derive(Debug)]
pub struct RuleGraph {
    rules: Vec<Rule>,
    nodes: Vec<GraphNode>,
    queries: HashMap<Query, NodeId>,
}

impl RuleGraph {
    pub fn query(&self, product: TypeKey, params: &BTreeSet<TypeKey>) -> Option<NodeId> {
        self.queries
            .get(&Query {
                product,
                params: params.clone(),
            })
            .copied()
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0 as usize]
    }

    pub fn rule(&self, id: NodeId) -> Option<&Rule> {
        match self.node(id).kind {
            GraphNodeKind::Rule(rule_id) => Some(&self.rules[rule_id]),
            GraphNodeKind::Param(_) => None,
        }
    }

    /// Human readable name of running `id` with `params`, like `rule b(X(3))`.
    pub fn describe(&self, id: NodeId, params: &Params) -> String {
        match self.node(id).kind {
            GraphNodeKind::Rule(rule_id) => self.describe_rule(rule_id, params),
            GraphNodeKind::Param(type_key) => format!("param {}", type_key),
        }
    }

    pub fn describe_rule(&self, rule_id: usize, params: &Params) -> String {
        match self.rules.get(rule_id) {
            Some(rule) => format!("rule {}({})", rule.name(), params),
            None => format!("rule #{}({})", rule_id, params),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Default)]
pub struct RuleGraphBuilder {
    rules: Vec<Rule>,
    queries: Vec<Query>,
}

impl RuleGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Declares that `Out` will be requested with parameters of the given types.
    pub fn query<Out: 'static>(mut self, params: impl IntoIterator<Item = TypeKey>) -> Self {
        self.queries.push(Query {
            product: TypeKey::of::<Out>(),
            params: params.into_iter().collect(),
        });
        self
    }

    pub fn compile(self) -> Result<RuleGraph, CompileError> {
        let mut producers: HashMap<TypeKey, Vec<usize>> = HashMap::new();
        for (rule_id, rule) in self.rules.iter().enumerate() {
            producers.entry(rule.output()).or_default().push(rule_id);
        }

        let mut compiler = Compiler {
            rules: &self.rules,
            producers,
            nodes: vec![],
            param_nodes: HashMap::new(),
            memo: HashMap::new(),
        };

        let mut queries = HashMap::new();
        for query in self.queries {
            let id = compiler
                .resolve_product(query.product, &query.params, "query", Edge::Input)
                .map_err(Unresolved::into_inner)?;
            queries.insert(query, id);
        }

        let mut nodes = compiler.nodes;
        compute_used_params(&mut nodes);

        let graph = RuleGraph {
            rules: self.rules,
            nodes,
            queries,
        };
        graph.warn_unreachable();
        debug!(nodes = graph.len(), "compiled rule graph");

        Ok(graph)
    }
}

impl RuleGraph {
    fn warn_unreachable(&self) {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut worklist: Vec<NodeId> = self.queries.values().copied().collect();
        let mut reached_rules: HashSet<usize> = HashSet::new();

        while let Some(id) = worklist.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.node(id);
            if let GraphNodeKind::Rule(rule_id) = node.kind {
                reached_rules.insert(rule_id);
            }
            worklist.extend(node.inputs.iter().copied());
            worklist.extend(node.gets.iter().map(|(_, id)| *id));
        }

        for (rule_id, rule) in self.rules.iter().enumerate() {
            if !reached_rules.contains(&rule_id) {
                warn!(rule = rule.name(), "rule is not reachable from any query");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Input,
    Get,
}

enum Unresolved {
    /// Nothing can produce the product. Not fatal while other candidates
    /// are being tried.
    Missing(CompileError),
    Fatal(CompileError),
}

impl Unresolved {
    fn into_inner(self) -> CompileError {
        match self {
            Unresolved::Missing(e) | Unresolved::Fatal(e) => e,
        }
    }
}

enum Memo {
    InProgress(NodeId),
    Done(NodeId),
    Unsatisfiable(CompileError),
}

fn fmt_params(params: &BTreeSet<TypeKey>) -> String {
    params
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

struct Compiler<'r> {
    rules: &'r [Rule],
    producers: HashMap<TypeKey, Vec<usize>>,
    nodes: Vec<GraphNode>,
    param_nodes: HashMap<TypeKey, NodeId>,
    memo: HashMap<(usize, BTreeSet<TypeKey>), Memo>,
}

impl Compiler<'_> {
    fn push(&mut self, node: GraphNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn param_node(&mut self, type_key: TypeKey) -> NodeId {
        if let Some(id) = self.param_nodes.get(&type_key) {
            return *id;
        }
        let id = self.push(GraphNode {
            kind: GraphNodeKind::Param(type_key),
            params: BTreeSet::from([type_key]),
            inputs: vec![],
            gets: vec![],
            used_params: BTreeSet::new(),
        });
        self.param_nodes.insert(type_key, id);
        id
    }

    fn resolve_product(
        &mut self,
        product: TypeKey,
        params: &BTreeSet<TypeKey>,
        requester: &str,
        edge: Edge,
    ) -> Result<NodeId, Unresolved> {
        // params shadow rules.
        if params.contains(&product) {
            return Ok(self.param_node(product));
        }

        let candidates = self.producers.get(&product).cloned().unwrap_or_default();
        let mut found: Vec<(usize, NodeId)> = vec![];
        let mut missing: Vec<CompileError> = vec![];

        for rule_id in candidates.iter().copied() {
            match self.resolve_rule(rule_id, params, edge) {
                Ok(id) => found.push((rule_id, id)),
                Err(Unresolved::Missing(e)) => missing.push(e),
                Err(fatal) => return Err(fatal),
            }
        }

        match found.as_slice() {
            [(_, id)] => Ok(*id),
            [] => {
                // with a single candidate, its own missing dependency is
                // the more useful error.
                if let ([_], Some(e)) = (candidates.as_slice(), missing.pop()) {
                    return Err(Unresolved::Missing(e));
                }
                Err(Unresolved::Missing(CompileError::MissingDependency {
                    requester: requester.to_string(),
                    product: product.to_string(),
                    params: fmt_params(params),
                }))
            }
            _ => Err(Unresolved::Fatal(CompileError::Ambiguous {
                product: product.to_string(),
                params: fmt_params(params),
                candidates: found
                    .iter()
                    .map(|(rule_id, _)| self.rules[*rule_id].name().to_string())
                    .collect(),
            })),
        }
    }

    fn resolve_rule(
        &mut self,
        rule_id: usize,
        params: &BTreeSet<TypeKey>,
        edge: Edge,
    ) -> Result<NodeId, Unresolved> {
        let rules = self.rules;
        let rule = &rules[rule_id];
        let key = (rule_id, params.clone());

        match self.memo.get(&key) {
            Some(Memo::Done(id)) => return Ok(*id),
            Some(Memo::Unsatisfiable(e)) => return Err(Unresolved::Missing(e.clone())),
            // recursion through a Get is resolved at runtime with a
            // different parameter value.
            Some(Memo::InProgress(id)) if edge == Edge::Get => return Ok(*id),
            Some(Memo::InProgress(_)) => {
                return Err(Unresolved::Fatal(CompileError::Cyclic {
                    rule: rule.name().to_string(),
                    params: fmt_params(params),
                }))
            }
            None => {}
        }

        // reserve the slot, so back edges can point to it.
        let id = self.push(GraphNode {
            kind: GraphNodeKind::Rule(rule_id),
            params: params.clone(),
            inputs: vec![],
            gets: vec![],
            used_params: BTreeSet::new(),
        });
        self.memo.insert(key.clone(), Memo::InProgress(id));

        match self.resolve_dependencies(rule, params) {
            Ok((inputs, gets)) => {
                let node = &mut self.nodes[id.0 as usize];
                node.inputs = inputs;
                node.gets = gets;
                self.memo.insert(key, Memo::Done(id));
                Ok(id)
            }
            Err(Unresolved::Missing(e)) => {
                self.rollback(id);
                self.memo.insert(key, Memo::Unsatisfiable(e.clone()));
                Err(Unresolved::Missing(e))
            }
            Err(fatal) => Err(fatal),
        }
    }

    #[allow(clippy::type_complexity)]
    fn resolve_dependencies(
        &mut self,
        rule: &Rule,
        params: &BTreeSet<TypeKey>,
    ) -> Result<(Vec<NodeId>, Vec<(Get, NodeId)>), Unresolved> {
        let mut inputs = vec![];
        let mut gets = vec![];

        for dependency in rule.dependencies() {
            match dependency {
                DependencyKey::Input(product) => {
                    inputs.push(self.resolve_product(*product, params, rule.name(), Edge::Input)?);
                }
                DependencyKey::Get(get) => {
                    let mut get_params = params.clone();
                    get_params.insert(get.provided);
                    gets.push((
                        *get,
                        self.resolve_product(get.product, &get_params, rule.name(), Edge::Get)?,
                    ));
                }
            }
        }

        Ok((inputs, gets))
    }

    /// Drops all nodes from `from` on, which were created while resolving
    /// an unsatisfiable rule.
    fn rollback(&mut self, from: NodeId) {
        self.nodes.truncate(from.0 as usize);
        self.memo.retain(|_, memo| match memo {
            Memo::Done(id) | Memo::InProgress(id) => *id < from,
            Memo::Unsatisfiable(_) => true,
        });
        self.param_nodes.retain(|_, id| *id < from);
    }
}

/// Computes used params by fixpoint, as recursion makes the graph cyclic.
fn compute_used_params(nodes: &mut [GraphNode]) {
    loop {
        let mut changed = false;
        for i in 0..nodes.len() {
            let used: BTreeSet<TypeKey> = match nodes[i].kind {
                GraphNodeKind::Param(type_key) => BTreeSet::from([type_key]),
                GraphNodeKind::Rule(_) => {
                    let node = &nodes[i];
                    let mut used = BTreeSet::new();
                    for input in &node.inputs {
                        used.extend(nodes[input.0 as usize].used_params.iter().copied());
                    }
                    for (get, id) in &node.gets {
                        used.extend(
                            nodes[id.0 as usize]
                                .used_params
                                .iter()
                                .filter(|t| **t != get.provided)
                                .copied(),
                        );
                    }
                    used
                }
            };
            if used != nodes[i].used_params {
                nodes[i].used_params = used;
                changed = true;
            }
        }
        if !changed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use kiln_castore::fingerprint::{Fingerprint, FingerprintHasher};

    use super::{GraphNodeKind, RuleGraphBuilder};
    use crate::error::{CompileError, Failure};
    use crate::rules::Rule;
    use crate::scheduler::RuleContext;
    use crate::types::{TypeKey, Value};

    macro_rules! newtype {
        ($name:ident) => {
            #[derive(Debug, Clone, PartialEq)]
            struct $name(i64);

            impl Fingerprint for $name {
                fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
                    hasher.field(&self.0);
                }
            }
        };
    }

    newtype!(X);
    newtype!(Y);
    newtype!(A);
    newtype!(B);

    async fn unreachable_body(_: RuleContext, _: Vec<Value>) -> Result<Value, Failure> {
        Err(Failure::rule("not run in these tests"))
    }

    #[test]
    fn resolves_through_rules_and_params() {
        let graph = RuleGraphBuilder::new()
            .register(Rule::new::<A>("a", unreachable_body).input::<X>())
            .register(Rule::new::<B>("b", unreachable_body).input::<A>())
            .query::<B>([TypeKey::of::<X>(), TypeKey::of::<Y>()])
            .compile()
            .expect("must compile");

        let params = BTreeSet::from([TypeKey::of::<X>(), TypeKey::of::<Y>()]);
        let b = graph.query(TypeKey::of::<B>(), &params).expect("query");
        assert_eq!("b", graph.rule(b).unwrap().name());

        // Y is in scope, but unused.
        assert_eq!(
            &BTreeSet::from([TypeKey::of::<X>()]),
            graph.node(b).used_params()
        );

        let a = graph.node(b).inputs()[0];
        assert_eq!("a", graph.rule(a).unwrap().name());
        assert_eq!(
            GraphNodeKind::Param(TypeKey::of::<X>()),
            graph.node(graph.node(a).inputs()[0]).kind()
        );

        assert!(graph
            .query(TypeKey::of::<B>(), &BTreeSet::from([TypeKey::of::<X>()]))
            .is_none());
    }

    #[test]
    fn params_shadow_rules() {
        let graph = RuleGraphBuilder::new()
            .register(Rule::new::<A>("a", unreachable_body).input::<X>())
            .register(Rule::new::<B>("b", unreachable_body).input::<A>())
            .query::<B>([TypeKey::of::<A>()])
            .compile()
            .expect("must compile");

        let b = graph
            .query(TypeKey::of::<B>(), &BTreeSet::from([TypeKey::of::<A>()]))
            .unwrap();
        assert_eq!(
            GraphNodeKind::Param(TypeKey::of::<A>()),
            graph.node(graph.node(b).inputs()[0]).kind()
        );
    }

    #[test]
    fn ambiguous() {
        let err = RuleGraphBuilder::new()
            .register(Rule::new::<A>("a_from_x", unreachable_body).input::<X>())
            .register(Rule::new::<A>("a_from_y", unreachable_body).input::<Y>())
            .query::<A>([TypeKey::of::<X>(), TypeKey::of::<Y>()])
            .compile()
            .expect_err("must fail");

        match err {
            CompileError::Ambiguous { candidates, .. } => {
                assert_eq!(vec!["a_from_x", "a_from_y"], candidates)
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn unsatisfiable_candidates_are_not_ambiguous() {
        // only a_from_x can be satisfied with X.
        RuleGraphBuilder::new()
            .register(Rule::new::<A>("a_from_x", unreachable_body).input::<X>())
            .register(Rule::new::<A>("a_from_y", unreachable_body).input::<Y>())
            .query::<A>([TypeKey::of::<X>()])
            .compile()
            .expect("must compile");
    }

    #[test]
    fn missing_dependency_names_the_rule() {
        let err = RuleGraphBuilder::new()
            .register(Rule::new::<B>("b", unreachable_body).input::<A>())
            .query::<B>([TypeKey::of::<X>()])
            .compile()
            .expect_err("must fail");

        assert_eq!(
            CompileError::MissingDependency {
                requester: "b".into(),
                product: "A".into(),
                params: "X".into(),
            },
            err
        );
    }

    #[test]
    fn cyclic_inputs() {
        let err = RuleGraphBuilder::new()
            .register(Rule::new::<A>("a", unreachable_body).input::<B>())
            .register(Rule::new::<B>("b", unreachable_body).input::<A>())
            .query::<A>([TypeKey::of::<X>()])
            .compile()
            .expect_err("must fail");

        assert!(matches!(err, CompileError::Cyclic { .. }), "{err}");
    }

    #[test]
    fn recursion_through_get() {
        let graph = RuleGraphBuilder::new()
            .register(
                Rule::new::<A>("fib", unreachable_body)
                    .input::<X>()
                    .get::<A, X>(),
            )
            .query::<A>([TypeKey::of::<X>()])
            .compile()
            .expect("must compile");

        let fib = graph
            .query(TypeKey::of::<A>(), &BTreeSet::from([TypeKey::of::<X>()]))
            .unwrap();
        let get = graph.node(fib).get(&crate::rules::Get {
            product: TypeKey::of::<A>(),
            provided: TypeKey::of::<X>(),
        });
        // a back edge to itself.
        assert_eq!(Some(fib), get);
    }

    #[test]
    fn unreachable_rules_are_fine() {
        RuleGraphBuilder::new()
            .register(Rule::new::<A>("a", unreachable_body).input::<X>())
            .register(Rule::new::<B>("b", unreachable_body).input::<Y>())
            .query::<A>([TypeKey::of::<X>()])
            .compile()
            .expect("must compile");
    }
}
