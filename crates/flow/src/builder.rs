// Archivo: builder.rs
// Propósito: API fluida para ensamblar un flujo. Cada operación añade un
// nodo enlazado a las colas actuales; `close()` añade el End, calcula los
// upstreams de cada nodo y arranca el `Flow`.
//
// Ejemplo:
//   engine.create::<String>("chat", "1")
//         .flat_map(|s| Ok(generate(s)))
//         .conditions()
//         .when(|c: &Chunk| c.think, |b| b)
//         .others(|b| b.just(|c| { log(c); Ok(()) }))
//         .map(|c| Ok(mask(c)))
//         .close()?;
use crate::config::EngineConfig;
use crate::domain::FlowContext;
use crate::errors::{FlowError, Result};
use crate::flow::{Flow, TypedOutlet};
use crate::locks::FlowLocks;
use crate::node::{Node, NodeConfig, Runtime, Stage, END};
use crate::operators::{Collector, ErrorAction, ErrorHandler, Join, Operator, Route, Whether};
use crate::registry::SessionRegistry;
use crate::repository::FlowContextRepository;
use crate::session::StateContext;
use crate::window::WindowCondition;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

struct RouteSpec {
    whether: Option<Whether>,
    // `None`: rama vacía, se enlaza con el nodo que siga al bloque.
    target: Option<String>,
}

enum SpecStage {
    Op(Operator),
    Branch(Vec<RouteSpec>),
    Fork,
    Join(Join),
    End,
}

struct NodeSpec {
    stage: SpecStage,
    config: NodeConfig,
    next: Vec<String>,
}

struct BuildState {
    stream_id: String,
    repo: Arc<dyn FlowContextRepository>,
    locks: Arc<dyn FlowLocks>,
    config: EngineConfig,
    specs: IndexMap<String, NodeSpec>,
    tags: HashMap<String, String>,
    // Bloques `conditions` con ramas vacías a la espera del siguiente nodo.
    pending_joins: Vec<String>,
    last: Option<String>,
    counter: usize,
    errors: Vec<FlowError>,
}

/// Builder tipado: `D` es la entrada del flujo y `T` la salida del último
/// nodo añadido.
pub struct FlowBuilder<D, T> {
    state: BuildState,
    tails: Vec<String>,
    _types: PhantomData<fn(D) -> T>,
}

fn decode<T: DeserializeOwned>(value: JsonValue) -> anyhow::Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn encode<T: Serialize>(value: T) -> anyhow::Result<JsonValue> {
    Ok(serde_json::to_value(value)?)
}

fn whether_of<T, P>(pred: P) -> Whether
    where T: DeserializeOwned,
          P: Fn(&T) -> bool + Send + Sync + 'static
{
    Arc::new(move |v: &JsonValue| {
        serde_json::from_value::<T>(v.clone()).map(|t| pred(&t))
                                              .unwrap_or(false)
    })
}

impl<D> FlowBuilder<D, D> {
    pub(crate) fn new(stream_id: String,
                      repo: Arc<dyn FlowContextRepository>,
                      locks: Arc<dyn FlowLocks>,
                      config: EngineConfig)
                      -> Self {
        let state = BuildState { stream_id,
                                 repo,
                                 locks,
                                 config,
                                 specs: IndexMap::new(),
                                 tags: HashMap::new(),
                                 pending_joins: Vec::new(),
                                 last: None,
                                 counter: 0,
                                 errors: Vec::new() };
        Self { state,
               tails: Vec::new(),
               _types: PhantomData }
    }
}

impl<D, T> FlowBuilder<D, T> {
    fn retype<R>(self) -> FlowBuilder<D, R> {
        FlowBuilder { state: self.state,
                      tails: self.tails,
                      _types: PhantomData }
    }

    fn push_with_id(&mut self, id: String, stage: SpecStage) {
        for tail in &self.tails {
            let joined = self.state.pending_joins.contains(tail);
            let Some(spec) = self.state.specs.get_mut(tail) else {
                continue;
            };
            if !spec.next.contains(&id) {
                spec.next.push(id.clone());
            }
            if let (true, SpecStage::Branch(routes)) = (joined, &mut spec.stage) {
                for route in routes.iter_mut().filter(|r| r.target.is_none()) {
                    route.target = Some(id.clone());
                }
            }
        }
        let tails = &self.tails;
        self.state.pending_joins.retain(|b| !tails.contains(b));
        let config = NodeConfig::from_engine(&self.state.config);
        self.state.specs.insert(id.clone(),
                                NodeSpec { stage,
                                           config,
                                           next: Vec::new() });
        self.state.last = Some(id.clone());
        self.tails = vec![id];
    }

    fn push(mut self, op: Operator) -> Self {
        self.state.counter += 1;
        let id = format!("{}-{}", op.name(), self.state.counter);
        self.push_with_id(id, SpecStage::Op(op));
        self
    }

    fn configure(mut self, what: &str, f: impl FnOnce(&mut NodeConfig)) -> Self {
        let spec = self.state
                       .last
                       .as_ref()
                       .and_then(|id| self.state.specs.get_mut(id));
        match spec {
            Some(spec) => f(&mut spec.config),
            None => self.state
                        .errors
                        .push(FlowError::Config(format!("'{what}' sin nodo previo"))),
        }
        self
    }

    /// Items procesados en paralelo por el último nodo.
    pub fn concurrency(mut self, k: usize) -> Self {
        if k == 0 {
            self.state
                .errors
                .push(FlowError::Config("concurrency debe ser > 0".into()));
            return self;
        }
        self.configure("concurrency", |c| c.concurrency = k)
    }

    /// Contextos tomados por ciclo en el último nodo.
    pub fn batch(self, n: usize) -> Self {
        self.configure("batch", |c| c.batch_size = Some(n.max(1)))
    }

    pub fn backlog(self, n: usize) -> Self {
        self.configure("backlog", |c| c.backlog = n.max(1))
    }

    pub fn max_retries(self, n: u32) -> Self {
        self.configure("max_retries", |c| c.max_retries = n)
    }

    pub fn retry_backoff(self, backoff: Duration) -> Self {
        self.configure("retry_backoff", |c| c.retry_backoff = backoff)
    }

    /// Condición de panel del último nodo (Reduce/Produce).
    pub fn window(self, condition: WindowCondition) -> Self {
        self.configure("window", |c| c.window = condition)
    }

    pub fn error_handler(self,
                         handler: impl Fn(&FlowError, bool, &[FlowContext]) -> ErrorAction + Send + Sync + 'static)
                         -> Self {
        let handler: ErrorHandler = Arc::new(handler);
        self.configure("error_handler", |c| c.error_handler = Some(handler))
    }

    /// Etiqueta el último nodo como punto de reentrada para `offer_to`.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        match self.state.last.clone() {
            Some(id) => {
                if self.state.tags.insert(tag.clone(), id).is_some() {
                    self.state
                        .errors
                        .push(FlowError::Config(format!("tag '{tag}' duplicado")));
                }
            }
            None => self.state
                        .errors
                        .push(FlowError::Config(format!("tag '{tag}' sin nodo previo"))),
        }
        self
    }
}

impl<D, T> FlowBuilder<D, T> where T: DeserializeOwned + 'static
{
    pub fn map<R, F>(self, f: F) -> FlowBuilder<D, R>
        where R: Serialize + 'static,
              F: Fn(T) -> anyhow::Result<R> + Send + Sync + 'static
    {
        self.push(Operator::Map(Arc::new(move |v| encode(f(decode(v)?)?))))
            .retype()
    }

    pub fn process_map<R, F>(self, f: F) -> FlowBuilder<D, R>
        where R: Serialize + 'static,
              F: Fn(T, &StateContext) -> anyhow::Result<R> + Send + Sync + 'static
    {
        self.push(Operator::ProcessMap(Arc::new(move |v, state| encode(f(decode(v)?, state)?))))
            .retype()
    }

    /// 1→N: el operador recoge sus salidas en un `Collector`.
    pub fn process<R, F>(self, f: F) -> FlowBuilder<D, R>
        where R: Serialize + 'static,
              F: Fn(T, &StateContext, &mut Collector<R>) -> anyhow::Result<()> + Send + Sync + 'static
    {
        self.push(Operator::Process(Arc::new(move |v, state| {
                                                let mut out = Collector::new();
                                                f(decode(v)?, state, &mut out)?;
                                                Ok(out.into_items())
                                            })))
            .retype()
    }

    pub fn flat_map<R, I, F>(self, f: F) -> FlowBuilder<D, R>
        where R: Serialize + 'static,
              I: IntoIterator<Item = R>,
              F: Fn(T) -> anyhow::Result<I> + Send + Sync + 'static
    {
        self.push(Operator::FlatMap(Arc::new(move |v| f(decode(v)?)?.into_iter().map(encode).collect())))
            .retype()
    }

    pub fn reduce<A, I, F>(self, init: I, reducer: F) -> FlowBuilder<D, A>
        where A: Serialize + DeserializeOwned + 'static,
              I: Fn() -> A + Send + Sync + 'static,
              F: Fn(A, T) -> anyhow::Result<A> + Send + Sync + 'static
    {
        let op = Operator::Reduce { init: Arc::new(move || encode(init())),
                                    reducer: Arc::new(move |acc, item| encode(reducer(decode(acc)?, decode(item)?)?)) };
        self.push(op).retype()
    }

    pub fn process_reduce<A, I, F>(self, init: I, reducer: F) -> FlowBuilder<D, A>
        where A: Serialize + DeserializeOwned + 'static,
              I: Fn() -> A + Send + Sync + 'static,
              F: Fn(A, T, &StateContext) -> anyhow::Result<A> + Send + Sync + 'static
    {
        let op = Operator::ProcessReduce { init: Arc::new(move || encode(init())),
                                           reducer: Arc::new(move |acc, item, state| {
                                               encode(reducer(decode(acc)?, decode(item)?, state)?)
                                           }) };
        self.push(op).retype()
    }

    /// Transforma en bloque el panel acumulado.
    pub fn produce<R, F>(self, f: F) -> FlowBuilder<D, R>
        where R: Serialize + 'static,
              F: Fn(Vec<T>) -> anyhow::Result<Vec<R>> + Send + Sync + 'static
    {
        self.push(Operator::Produce(Arc::new(move |items| {
                                                let typed = items.into_iter().map(decode).collect::<anyhow::Result<Vec<T>>>()?;
                                                f(typed)?.into_iter().map(encode).collect()
                                            })))
            .retype()
    }

    /// Deja pasar los items que cumplen el predicado.
    pub fn filter<F>(self, pred: F) -> Self
        where F: Fn(&T) -> bool + Send + Sync + 'static
    {
        self.push(Operator::Filter(whether_of(pred)))
    }

    /// Filtro de lote: un veredicto por item, en el mismo orden.
    pub fn validate<F>(self, f: F) -> Self
        where F: Fn(&[T]) -> anyhow::Result<Vec<bool>> + Send + Sync + 'static
    {
        self.push(Operator::Validator(Arc::new(move |items| {
                                                  let typed = items.iter()
                                                                   .cloned()
                                                                   .map(decode)
                                                                   .collect::<anyhow::Result<Vec<T>>>()?;
                                                  f(&typed)
                                              })))
    }

    /// Efecto lateral sobre cada item; el item sigue sin cambios.
    pub fn just<F>(self, f: F) -> Self
        where F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static
    {
        self.push(Operator::Just(Arc::new(move |v| f(&decode(v.clone())?))))
    }

    pub fn process_just<F>(self, f: F) -> Self
        where F: Fn(&T, &StateContext) -> anyhow::Result<()> + Send + Sync + 'static
    {
        self.push(Operator::ProcessJust(Arc::new(move |v, state| f(&decode(v.clone())?, state))))
    }

    /// Abre un bloque de ramas. La primera rama cuyo predicado se cumple se
    /// lleva el item.
    pub fn conditions(mut self) -> Conditions<D, T> {
        self.state.counter += 1;
        let id = format!("conditions-{}", self.state.counter);
        self.push_with_id(id.clone(), SpecStage::Branch(Vec::new()));
        Conditions { builder: self,
                     branch_id: id }
    }

    /// Abre un bloque paralelo: cada item se copia a todas las ramas
    /// `fork` y un `join` reúne sus resultados.
    pub fn parallel(mut self) -> Parallel<D, T> {
        self.state.counter += 1;
        let id = format!("parallel-{}", self.state.counter);
        self.push_with_id(id.clone(), SpecStage::Fork);
        Parallel { builder: self,
                   fork_id: id }
    }

    /// Añade el End y pone el flujo en marcha. Debe llamarse dentro de un
    /// runtime tokio.
    pub fn close(mut self) -> Result<Flow<D, T>>
        where D: Serialize,
              T: Clone + Send + Sync
    {
        if let Some(e) = self.state.errors.first() {
            return Err(e.clone());
        }
        self.state.config.validate()?;
        self.push_with_id(END.to_string(), SpecStage::End);
        let BuildState { stream_id,
                         repo,
                         locks,
                         specs,
                         tags,
                         .. } = self.state;

        let start = specs.keys().next().cloned().unwrap_or_else(|| END.to_string());
        let mut upstreams: HashMap<String, usize> = HashMap::new();
        for spec in specs.values() {
            for next in &spec.next {
                *upstreams.entry(next.clone()).or_insert(0) += 1;
            }
        }
        *upstreams.entry(start.clone()).or_insert(0) += 1;

        let nodes: IndexMap<String, Arc<Node>> =
            specs.into_iter()
                 .map(|(id, spec)| {
                     let stage = match spec.stage {
                         SpecStage::Op(op) => Stage::Op(op),
                         SpecStage::Branch(routes) => {
                             let routes = routes.into_iter()
                                                .map(|r| Route { whether: r.whether,
                                                                 target: r.target.unwrap_or_else(|| END.to_string()) })
                                                .collect();
                             Stage::Op(Operator::Branch(routes))
                         }
                         SpecStage::Fork => Stage::Fork,
                         SpecStage::Join(join) => Stage::Join(join),
                         SpecStage::End => Stage::End,
                     };
                     let up = upstreams.get(&id).copied().unwrap_or(0);
                     let node = Node::new(id.clone(), stage, spec.config, spec.next, up);
                     (id, Arc::new(node))
                 })
                 .collect();

        let outlet = Arc::new(TypedOutlet::<T>::new());
        let runtime = Runtime { stream_id,
                                repo,
                                locks,
                                registry: Arc::new(SessionRegistry::new()),
                                outlet: outlet.clone(),
                                nodes,
                                start };
        Ok(Flow::launch(Arc::new(runtime), outlet, tags))
    }
}

/// Bloque `conditions()` recién abierto.
pub struct Conditions<D, T> {
    builder: FlowBuilder<D, T>,
    branch_id: String,
}

impl<D, T> Conditions<D, T> where T: DeserializeOwned + 'static
{
    /// Primera rama. `branch` recibe un builder cuyo primer nodo queda
    /// enlazado a la rama; devolverlo sin cambios deja la rama vacía.
    pub fn when<R, P, B>(self, pred: P, branch: B) -> WhenHappen<D, T, R>
        where P: Fn(&T) -> bool + Send + Sync + 'static,
              B: FnOnce(FlowBuilder<D, T>) -> FlowBuilder<D, R>
    {
        let happen = WhenHappen { state: self.builder.state,
                                  branch_id: self.branch_id,
                                  tails: Vec::new(),
                                  _types: PhantomData };
        happen.route(Some(whether_of(pred)), branch)
    }
}

/// Bloque `conditions()` con al menos una rama.
pub struct WhenHappen<D, T, R> {
    state: BuildState,
    branch_id: String,
    tails: Vec<String>,
    _types: PhantomData<fn(D, T) -> R>,
}

impl<D, T, R> WhenHappen<D, T, R> where T: DeserializeOwned + 'static
{
    fn route<B>(self, whether: Option<Whether>, branch: B) -> Self
        where B: FnOnce(FlowBuilder<D, T>) -> FlowBuilder<D, R>
    {
        let WhenHappen { state,
                         branch_id,
                         mut tails,
                         .. } = self;
        let before = state.specs.len();
        let sub = FlowBuilder { state,
                                tails: vec![branch_id.clone()],
                                _types: PhantomData };
        let out = branch(sub);
        let mut state = out.state;
        let target = state.specs.get_index(before).map(|(id, _)| id.clone());
        if let Some(SpecStage::Branch(routes)) = state.specs.get_mut(&branch_id).map(|s| &mut s.stage) {
            routes.push(RouteSpec { whether, target });
        }
        for tail in out.tails {
            if !tails.contains(&tail) {
                tails.push(tail);
            }
        }
        WhenHappen { state,
                     branch_id,
                     tails,
                     _types: PhantomData }
    }

    pub fn when<P, B>(self, pred: P, branch: B) -> Self
        where P: Fn(&T) -> bool + Send + Sync + 'static,
              B: FnOnce(FlowBuilder<D, T>) -> FlowBuilder<D, R>
    {
        self.route(Some(whether_of(pred)), branch)
    }

    /// Rama por defecto; cierra el bloque. Las colas de todas las ramas se
    /// unen en el siguiente nodo.
    pub fn others<B>(self, branch: B) -> FlowBuilder<D, R>
        where B: FnOnce(FlowBuilder<D, T>) -> FlowBuilder<D, R>
    {
        let mut happen = self.route(None, branch);
        if happen.tails.contains(&happen.branch_id) {
            happen.state.pending_joins.push(happen.branch_id.clone());
        }
        happen.state.last = Some(happen.branch_id.clone());
        FlowBuilder { state: happen.state,
                      tails: happen.tails,
                      _types: PhantomData }
    }
}

/// Bloque `parallel()` recién abierto.
pub struct Parallel<D, T> {
    builder: FlowBuilder<D, T>,
    fork_id: String,
}

impl<D, T> Parallel<D, T> where T: DeserializeOwned + 'static
{
    /// Primera rama. Todas las ramas reciben una copia de cada item.
    pub fn fork<R, B>(self, branch: B) -> Forks<D, T, R>
        where R: DeserializeOwned + 'static,
              B: FnOnce(FlowBuilder<D, T>) -> FlowBuilder<D, R>
    {
        let forks = Forks { state: self.builder.state,
                            fork_id: self.fork_id,
                            tails: Vec::new(),
                            _types: PhantomData };
        forks.fork(branch)
    }
}

/// Bloque `parallel()` con al menos una rama.
pub struct Forks<D, T, R> {
    state: BuildState,
    fork_id: String,
    tails: Vec<String>,
    _types: PhantomData<fn(D, T) -> R>,
}

impl<D, T, R> Forks<D, T, R> where R: DeserializeOwned + 'static
{
    pub fn fork<B>(self, branch: B) -> Self
        where B: FnOnce(FlowBuilder<D, T>) -> FlowBuilder<D, R>
    {
        let Forks { state,
                    fork_id,
                    mut tails,
                    .. } = self;
        let sub = FlowBuilder { state,
                                tails: vec![fork_id.clone()],
                                _types: PhantomData };
        let out = branch(sub);
        for tail in out.tails {
            if !tails.contains(&tail) {
                tails.push(tail);
            }
        }
        Forks { state: out.state,
                fork_id,
                tails,
                _types: PhantomData }
    }

    fn join_with<A>(self, join: Join) -> FlowBuilder<D, A> {
        let mut builder = FlowBuilder { state: self.state,
                                        tails: self.tails,
                                        _types: PhantomData };
        builder.state.counter += 1;
        let id = format!("join-{}", builder.state.counter);
        builder.push_with_id(id, SpecStage::Join(join));
        builder
    }

    /// Espera a todas las ramas de cada item y pliega sus resultados, en
    /// orden de llegada, partiendo de `init()`.
    pub fn join<A, I, F>(self, init: I, reducer: F) -> FlowBuilder<D, A>
        where A: Serialize + DeserializeOwned + 'static,
              I: Fn() -> A + Send + Sync + 'static,
              F: Fn(A, R) -> anyhow::Result<A> + Send + Sync + 'static
    {
        let join = Join::All { init: Arc::new(move || encode(init())),
                               reducer: Arc::new(move |acc, item| encode(reducer(decode(acc)?, decode(item)?)?)) };
        self.join_with(join)
    }

    /// Se queda con el primer resultado de cada item.
    pub fn join_any(self) -> FlowBuilder<D, R> {
        self.join_with(Join::Any)
    }
}
