//! Crate `flow`: motor de ejecución de flujos por nodos.
//!
//! Un flujo es una cadena de nodos (map, flat-map, reduce, produce, filter,
//! ramas...) entre un Start y un End. Cada dato en tránsito es un
//! `FlowContext` persistido en un `FlowContextRepository`; cada nodo toma
//! sus contextos pendientes bajo un lock propio, aplica su operador y
//! avanza los resultados a la posición siguiente.
//!
//! Diseño resumido:
//! - Sesiones y ventanas: cada sesión lleva una ventana por nodo que decide
//!   cuándo el nodo terminó con ella. Una ventana se cumple como mucho una
//!   vez.
//! - Concurrencia por nodo (`concurrency(k)`) conservando el índice de
//!   llegada; con `k = 1` la salida respeta el orden de entrada.
//! - Backpressure: cada nodo admite un backlog acotado de contextos
//!   pendientes; los productores esperan cuando está lleno.
//! - Paralelo: `parallel().fork(..).join(..)` copia cada item a todas las
//!   ramas bajo un mismo `parallel_id` y el join espera a todas (o se queda
//!   con la primera, `join_any`).
//! - Errores: los fallos de operador pasan por el `ErrorHandler` del nodo;
//!   los fallos de almacén o lock abortan el ciclo, que se repite entero.
//!
//! Ejemplo rápido:
//! ```rust,no_run
//! use flow::{EngineConfig, FlowEngine};
//!
//! #[tokio::main]
//! async fn main() -> flow::Result<()> {
//!     let engine = FlowEngine::in_memory(EngineConfig::default());
//!     let flow = engine.create::<String>("saludo", "1")
//!                      .map(|s: String| Ok(s.to_uppercase()))
//!                      .close()?;
//!     let out = flow.converse().offer(vec!["hola".to_string()]).await?.await_result().await?;
//!     assert_eq!(out, vec!["HOLA".to_string()]);
//!     Ok(())
//! }
//! ```
pub mod builder;
pub mod config;
pub mod domain;
pub mod emitter;
pub mod engine;
pub mod errors;
pub mod flow;
pub mod locks;
pub mod node;
pub mod operators;
pub mod registry;
pub mod repository;
pub mod session;
pub mod stubs;
pub mod window;

pub use builder::{Conditions, FlowBuilder, Forks, Parallel, WhenHappen};
pub use config::EngineConfig;
pub use domain::*;
pub use emitter::{ConverseLatch, Emitter, EmitterListener, ListenerId};
pub use engine::FlowEngine;
pub use errors::*;
pub use flow::{Converse, Flow};
pub use locks::{FlowLock, FlowLockGuard, FlowLocks};
pub use node::{NodeConfig, END};
pub use operators::{Collector, ErrorAction, Join, Operator};
pub use registry::SessionRegistry;
pub use repository::*;
pub use session::{FlowSession, StateContext};
pub use stubs::*;
pub use window::{FlatMapSourceWindow, Window, WindowArg, WindowCondition};
