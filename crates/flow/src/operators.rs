// Archivo: operators.rs
// Propósito: formas de cómputo que aporta la aplicación. Cada variante de
// `Operator` lleva su función; el nodo hace `match` sobre la variante.
//
// Los operadores trabajan sobre `serde_json::Value`; el builder tipado
// convierte desde y hacia los tipos de la aplicación.
use crate::domain::FlowContext;
use crate::errors::FlowError;
use crate::session::StateContext;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub type MapFn = Arc<dyn Fn(JsonValue) -> anyhow::Result<JsonValue> + Send + Sync>;
pub type ProcessMapFn = Arc<dyn Fn(JsonValue, &StateContext) -> anyhow::Result<JsonValue> + Send + Sync>;
pub type ProcessFn = Arc<dyn Fn(JsonValue, &StateContext) -> anyhow::Result<Vec<JsonValue>> + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(JsonValue) -> anyhow::Result<Vec<JsonValue>> + Send + Sync>;
pub type InitFn = Arc<dyn Fn() -> anyhow::Result<JsonValue> + Send + Sync>;
pub type ReduceFn = Arc<dyn Fn(JsonValue, JsonValue) -> anyhow::Result<JsonValue> + Send + Sync>;
pub type ProcessReduceFn = Arc<dyn Fn(JsonValue, JsonValue, &StateContext) -> anyhow::Result<JsonValue> + Send + Sync>;
pub type ProduceFn = Arc<dyn Fn(Vec<JsonValue>) -> anyhow::Result<Vec<JsonValue>> + Send + Sync>;
pub type ValidatorFn = Arc<dyn Fn(&[JsonValue]) -> anyhow::Result<Vec<bool>> + Send + Sync>;
pub type JustFn = Arc<dyn Fn(&JsonValue) -> anyhow::Result<()> + Send + Sync>;
pub type ProcessJustFn = Arc<dyn Fn(&JsonValue, &StateContext) -> anyhow::Result<()> + Send + Sync>;
/// Predicado de rama.
pub type Whether = Arc<dyn Fn(&JsonValue) -> bool + Send + Sync>;

/// Qué hacer con un contexto cuyo operador falló.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Dejarlo `Pending` para volver a tomarlo.
    Retry,
    /// Marcarlo `Error`; la traza termina igualmente, marcada como fallida.
    Fail,
    /// Marcarlo `Error` y notificar el error a los listeners del flujo.
    Escalate,
}

/// Manejador de errores de nodo: `(error, reintentable, contextos)`.
pub type ErrorHandler = Arc<dyn Fn(&FlowError, bool, &[FlowContext]) -> ErrorAction + Send + Sync>;

/// Rama de un `Branch`: sin predicado es la rama por defecto.
#[derive(Clone)]
pub struct Route {
    pub whether: Option<Whether>,
    pub target: String,
}

/// Operador de un nodo.
#[derive(Clone)]
pub enum Operator {
    Map(MapFn),
    ProcessMap(ProcessMapFn),
    /// 1→N con colector explícito.
    Process(ProcessFn),
    /// 1→M: cada entrada abre un abanico con su propia ventana.
    FlatMap(FlatMapFn),
    Reduce { init: InitFn, reducer: ReduceFn },
    ProcessReduce { init: InitFn, reducer: ProcessReduceFn },
    /// Transforma en bloque todo lo acumulado en el panel.
    Produce(ProduceFn),
    /// Descarta items; se evalúa en el almacén.
    Filter(Whether),
    /// Descarta items evaluando el lote completo.
    Validator(ValidatorFn),
    /// Efecto lateral; el item sigue sin cambios.
    Just(JustFn),
    ProcessJust(ProcessJustFn),
    /// Enruta cada item a la primera rama cuyo predicado se cumple.
    Branch(Vec<Route>),
}

/// Cómo reúne un join los resultados de las ramas de un `parallel`.
#[derive(Clone)]
pub enum Join {
    /// Espera a que terminen todas las ramas y pliega sus resultados.
    All { init: InitFn, reducer: ReduceFn },
    /// Emite el primer resultado que llega; el resto se descarta.
    Any,
}

impl fmt::Debug for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Join::All { .. } => write!(f, "Join::All"),
            Join::Any => write!(f, "Join::Any"),
        }
    }
}

/// Resultado de aplicar un operador a un item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    One(JsonValue),
    Many(Vec<JsonValue>),
    Routed(String, JsonValue),
    Dropped,
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Map(_) => "map",
            Operator::ProcessMap(_) => "process-map",
            Operator::Process(_) => "process",
            Operator::FlatMap(_) => "flat-map",
            Operator::Reduce { .. } => "reduce",
            Operator::ProcessReduce { .. } => "process-reduce",
            Operator::Produce(_) => "produce",
            Operator::Filter(_) => "filter",
            Operator::Validator(_) => "validator",
            Operator::Just(_) => "just",
            Operator::ProcessJust(_) => "process-just",
            Operator::Branch(_) => "conditions",
        }
    }

    /// Operadores que acumulan por panel en lugar de emitir por item.
    pub fn is_accumulator(&self) -> bool {
        matches!(self, Operator::Reduce { .. } | Operator::ProcessReduce { .. } | Operator::Produce(_))
    }

    /// Aplica un operador de item. Los de lote y acumulación no pasan por
    /// aquí.
    pub fn apply_item(&self, data: JsonValue, state: &StateContext) -> anyhow::Result<ItemOutcome> {
        Ok(match self {
            Operator::Map(f) => ItemOutcome::One(f(data)?),
            Operator::ProcessMap(f) => ItemOutcome::One(f(data, state)?),
            Operator::Process(f) => ItemOutcome::Many(f(data, state)?),
            Operator::FlatMap(f) => ItemOutcome::Many(f(data)?),
            Operator::Filter(whether) => {
                if whether(&data) {
                    ItemOutcome::One(data)
                } else {
                    ItemOutcome::Dropped
                }
            }
            Operator::Just(f) => {
                f(&data)?;
                ItemOutcome::One(data)
            }
            Operator::ProcessJust(f) => {
                f(&data, state)?;
                ItemOutcome::One(data)
            }
            Operator::Branch(routes) => {
                match routes.iter()
                            .find(|r| r.whether.as_ref().map_or(true, |w| w(&data)))
                {
                    Some(route) => ItemOutcome::Routed(route.target.clone(), data),
                    None => ItemOutcome::Dropped,
                }
            }
            Operator::Reduce { .. } | Operator::ProcessReduce { .. } | Operator::Produce(_) | Operator::Validator(_) => {
                anyhow::bail!("el operador '{}' no se aplica por item", self.name())
            }
        })
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operator::{}", self.name())
    }
}

/// Colector de un operador `process`: lo recogido se emite aguas abajo en
/// orden.
pub struct Collector<R> {
    items: Vec<JsonValue>,
    _out: PhantomData<fn(R)>,
}

impl<R: Serialize> Collector<R> {
    pub(crate) fn new() -> Self {
        Self { items: Vec::new(),
               _out: PhantomData }
    }

    pub fn collect(&mut self, item: R) -> anyhow::Result<()> {
        self.items.push(serde_json::to_value(item)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn into_items(self) -> Vec<JsonValue> {
        self.items
    }
}
