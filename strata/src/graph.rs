// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Named pipeline stages wired into directed acyclic graphs.
//!
//! A [`GraphBuilder`] registers stages under unique names. A stage's output is a [`Next`] handle,
//! obtained from the builder before the stage is constructed and handed to it like any other
//! downstream [`Worker`]. Downstream stages are connected to a `Next` with
//! [`GraphBuilder::connect`]; adding a consumer to an output never touches the stage producing it.
//! [`GraphBuilder::build`] checks the wiring is acyclic and freezes every output.

use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet},
    error::Error,
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use strata_core::Worker;

/// An error wiring or looking up a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// Two stages of one graph share a name
    DuplicateStage(String),
    /// An output or edge refers to a stage that was never registered
    UnknownStage(String),
    /// The wiring loops back through the named stage
    Cycle(String),
    /// [`GraphBuilder::build`] was called before a root stage was set
    MissingRoot,
    /// A graph with this id is already registered
    DuplicateGraph(String),
    /// No graph with this id is registered
    UnknownGraph(String),
    /// The graph exists but takes another input type
    InputTypeMismatch(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateStage(name) => write!(f, "stage `{name}` is registered twice"),
            GraphError::UnknownStage(name) => write!(f, "stage `{name}` is not registered"),
            GraphError::Cycle(name) => write!(f, "stage `{name}` is part of a cycle"),
            GraphError::MissingRoot => f.write_str("graph has no root stage"),
            GraphError::DuplicateGraph(id) => write!(f, "graph `{id}` is already registered"),
            GraphError::UnknownGraph(id) => write!(f, "graph `{id}` is not registered"),
            GraphError::InputTypeMismatch(id) => {
                write!(f, "graph `{id}` takes a different input type")
            }
        }
    }
}

impl Error for GraphError {}

/// A registered stage accepting `T`.
pub struct NodeRef<T> {
    name: Arc<str>,
    worker: Arc<dyn Worker<T>>,
}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            worker: self.worker.clone(),
        }
    }
}

impl<T> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.name).finish()
    }
}

impl<T> NodeRef<T> {
    /// Stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stage itself, for wiring it into a stage that is not graph aware.
    pub fn worker(&self) -> Arc<dyn Worker<T>> {
        self.worker.clone()
    }
}

struct NextInner<T> {
    stage: Arc<str>,
    pending: Mutex<Vec<Arc<dyn Worker<T>>>>,
    targets: OnceLock<Box<[Arc<dyn Worker<T>>]>>,
}

/// The output of a stage. Hands every input to each connected downstream stage.
///
/// Cloning is cheap and clones feed the same downstream stages.
pub struct Next<T>(Arc<NextInner<T>>);

impl<T> Clone for Next<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for Next<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("stage", &self.0.stage)
            .field("targets", &self.0.targets.get().map(|t| t.len()))
            .finish()
    }
}

impl<T> Next<T> {
    /// Name of the stage this is the output of.
    pub fn stage(&self) -> &str {
        &self.0.stage
    }

    /// Number of connected downstream stages, once the graph is built.
    pub fn targets(&self) -> Option<usize> {
        self.0.targets.get().map(|targets| targets.len())
    }
}

impl<T: Clone + Send + 'static> Worker<T> for Next<T> {
    fn accept(&self, input: T) {
        let Some(targets) = self.0.targets.get() else {
            panic!("output of stage `{}` used before its graph was built", self.0.stage);
        };
        if let Some((last, rest)) = targets.split_last() {
            for target in rest {
                target.accept(input.clone());
            }
            last.accept(input);
        }
    }
}

trait Freeze: Send {
    fn freeze(&self);
}

impl<T: Send + 'static> Freeze for Next<T> {
    fn freeze(&self) {
        let pending = std::mem::take(&mut *self.0.pending.lock().unwrap_or_else(PoisonError::into_inner));
        // a Next is only handed out by one builder, which freezes it once
        let _ = self.0.targets.set(pending.into_boxed_slice());
    }
}

/// Builds a [`Graph`] taking inputs of type `I`.
pub struct GraphBuilder<I> {
    id: String,
    stages: BTreeSet<Arc<str>>,
    edges: BTreeMap<Arc<str>, BTreeSet<Arc<str>>>,
    outputs: Vec<(Arc<str>, Box<dyn Freeze>)>,
    root: Option<NodeRef<I>>,
}

impl<I> fmt::Debug for GraphBuilder<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("id", &self.id)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

impl<I: 'static> GraphBuilder<I> {
    /// A builder for the graph registered as `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stages: BTreeSet::new(),
            edges: BTreeMap::new(),
            outputs: vec![],
            root: None,
        }
    }

    /// Register `worker` as stage `name`.
    pub fn node<T>(&mut self, name: &str, worker: impl Worker<T> + 'static) -> Result<NodeRef<T>, GraphError> {
        self.shared_node(name, Arc::new(worker))
    }

    /// Register a stage that is also referenced outside the graph.
    pub fn shared_node<T>(&mut self, name: &str, worker: Arc<dyn Worker<T>>) -> Result<NodeRef<T>, GraphError> {
        let name: Arc<str> = name.into();
        if !self.stages.insert(name.clone()) {
            return Err(GraphError::DuplicateStage(name.to_string()));
        }
        Ok(NodeRef { name, worker })
    }

    /// The output handle of stage `stage`, to be handed to the stage when constructing it.
    ///
    /// The stage itself may be registered before or after this call, but before [`build`](Self::build).
    pub fn output<T: Clone + Send + 'static>(&mut self, stage: &str) -> Next<T> {
        let next = Next(Arc::new(NextInner {
            stage: stage.into(),
            pending: Mutex::new(vec![]),
            targets: OnceLock::new(),
        }));
        self.outputs.push((next.0.stage.clone(), Box::new(next.clone())));
        next
    }

    /// Feed the output `from` into stage `to`.
    pub fn connect<T>(&mut self, from: &Next<T>, to: &NodeRef<T>) {
        from.0
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(to.worker.clone());
        self.edge(from.stage(), to.name());
    }

    /// Record that stage `from` feeds stage `to` through a reference it was constructed with.
    pub fn edge(&mut self, from: &str, to: &str) {
        self.edges.entry(from.into()).or_default().insert(to.into());
    }

    /// Stage receiving [`Graph::start`] inputs.
    pub fn root(&mut self, node: &NodeRef<I>) {
        self.root = Some(node.clone());
    }

    /// Check the wiring and freeze every output.
    pub fn build(self) -> Result<Graph<I>, GraphError> {
        let root = self.root.ok_or(GraphError::MissingRoot)?;
        for (stage, _) in &self.outputs {
            if !self.stages.contains(stage) {
                return Err(GraphError::UnknownStage(stage.to_string()));
            }
        }
        for (from, tos) in &self.edges {
            if let Some(unknown) = std::iter::once(from).chain(tos).find(|s| !self.stages.contains(*s)) {
                return Err(GraphError::UnknownStage(unknown.to_string()));
            }
        }
        check_acyclic(&self.stages, &self.edges)?;
        for (_, output) in &self.outputs {
            output.freeze();
        }
        Ok(Graph {
            id: self.id,
            root: root.worker,
            stages: self.stages.iter().map(|s| s.to_string()).collect(),
        })
    }
}

fn check_acyclic(
    stages: &BTreeSet<Arc<str>>,
    edges: &BTreeMap<Arc<str>, BTreeSet<Arc<str>>>,
) -> Result<(), GraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        stage: &'a Arc<str>,
        edges: &'a BTreeMap<Arc<str>, BTreeSet<Arc<str>>>,
        marks: &mut BTreeMap<&'a Arc<str>, Mark>,
    ) -> Result<(), GraphError> {
        match marks.get(stage) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(GraphError::Cycle(stage.to_string())),
            None => {}
        }
        marks.insert(stage, Mark::Visiting);
        for next in edges.get(stage).into_iter().flatten() {
            visit(next, edges, marks)?;
        }
        marks.insert(stage, Mark::Done);
        Ok(())
    }

    let mut marks = BTreeMap::new();
    for stage in stages {
        visit(stage, edges, &mut marks)?;
    }
    Ok(())
}

/// A built pipeline graph.
pub struct Graph<I> {
    id: String,
    root: Arc<dyn Worker<I>>,
    stages: Vec<String>,
}

impl<I> fmt::Debug for Graph<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("stages", &self.stages)
            .finish()
    }
}

impl<I> Graph<I> {
    /// Inject `input` at the root stage.
    pub fn start(&self, input: I) {
        self.root.accept(input);
    }

    /// Graph id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stage names, sorted.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }
}

/// Graphs by id, owned by whoever assembles the pipeline.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for GraphRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.graphs.keys()).finish()
    }
}

impl GraphRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `graph` under its id.
    pub fn register<I: 'static>(&mut self, graph: Graph<I>) -> Result<Arc<Graph<I>>, GraphError> {
        if self.graphs.contains_key(graph.id()) {
            return Err(GraphError::DuplicateGraph(graph.id().to_owned()));
        }
        let graph = Arc::new(graph);
        self.graphs.insert(graph.id().to_owned(), graph.clone());
        Ok(graph)
    }

    /// The graph registered as `id`.
    pub fn get<I: 'static>(&self, id: &str) -> Result<Arc<Graph<I>>, GraphError> {
        let graph = self
            .graphs
            .get(id)
            .ok_or_else(|| GraphError::UnknownGraph(id.to_owned()))?;
        graph
            .clone()
            .downcast::<Graph<I>>()
            .map_err(|_| GraphError::InputTypeMismatch(id.to_owned()))
    }

    /// Inject `input` at the root of graph `id`.
    pub fn start<I: 'static>(&self, id: &str, input: I) -> Result<(), GraphError> {
        self.get::<I>(id)?.start(input);
        Ok(())
    }

    /// Whether a graph is registered as `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.graphs.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert2::check;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<u32>>);

    impl Worker<u32> for Collect {
        fn accept(&self, input: u32) {
            self.0.lock().unwrap().push(input);
        }
    }

    struct Double(Next<u32>);

    impl Worker<u32> for Double {
        fn accept(&self, input: u32) {
            self.0.accept(input * 2);
        }
    }

    #[test]
    fn outputs_fan_out_to_every_connected_stage() {
        let alarm = Arc::new(Collect::default());
        let export = Arc::new(Collect::default());
        let mut builder = GraphBuilder::new("calls");
        let doubled = builder.output::<u32>("double");
        let root = builder.node("double", Double(doubled.clone())).unwrap();
        let alarm_ref = builder.shared_node::<u32>("alarm", alarm.clone()).unwrap();
        let export_ref = builder.shared_node::<u32>("export", export.clone()).unwrap();
        builder.connect(&doubled, &alarm_ref);
        builder.connect(&doubled, &export_ref);
        builder.root(&root);
        let graph = builder.build().unwrap();

        graph.start(21);
        check!(*alarm.0.lock().unwrap() == [42]);
        check!(*export.0.lock().unwrap() == [42]);
        check!(graph.stages() == ["alarm", "double", "export"]);
    }

    #[test]
    fn rejects_duplicate_stage_names() {
        let mut builder = GraphBuilder::<u32>::new("calls");
        builder.node("a", Collect::default()).unwrap();
        check!(builder.node("a", Collect::default()).unwrap_err() == GraphError::DuplicateStage("a".into()));
    }

    #[test]
    fn rejects_cycles() {
        let mut builder = GraphBuilder::new("calls");
        let out = builder.output::<u32>("double");
        let root = builder.node("double", Double(out.clone())).unwrap();
        builder.connect(&out, &root);
        builder.root(&root);
        check!(matches!(builder.build(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn rejects_outputs_of_unknown_stages() {
        let mut builder = GraphBuilder::new("calls");
        let _orphan = builder.output::<u32>("nowhere");
        let root = builder.node("root", Collect::default()).unwrap();
        builder.root(&root);
        check!(builder.build().unwrap_err() == GraphError::UnknownStage("nowhere".into()));
    }

    #[test]
    fn registry_checks_input_types() {
        let mut registry = GraphRegistry::new();
        let mut builder = GraphBuilder::<u32>::new("calls");
        let root = builder.node("root", Collect::default()).unwrap();
        builder.root(&root);
        registry.register(builder.build().unwrap()).unwrap();

        check!(registry.start("calls", 1_u32).is_ok());
        check!(registry.get::<String>("calls").unwrap_err() == GraphError::InputTypeMismatch("calls".into()));
        check!(registry.get::<u32>("other").unwrap_err() == GraphError::UnknownGraph("other".into()));
        check!(registry.ids().collect::<Vec<_>>() == ["calls"]);
    }

    #[test]
    #[should_panic(expected = "used before its graph was built")]
    fn output_is_unusable_before_build() {
        let mut builder = GraphBuilder::<u32>::new("calls");
        let out = builder.output::<u32>("double");
        out.accept(1);
    }
}
