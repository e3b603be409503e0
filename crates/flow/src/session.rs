// Archivo: session.rs
// Propósito: `FlowSession` (ámbito de ejecución que viaja con los datos) y
// `StateContext` (acceso tipado a su estado interno desde los operadores).
use crate::errors::Result;
use crate::window::{Window, WindowCondition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Clave reservada: id de la sesión padre.
pub const PARENT_SESSION_KEY: &str = "__flow.parent_session";
/// Clave reservada: listener al que entregar el resultado de una conversación.
pub const CONVERSE_KEY: &str = "__flow.converse";

struct SessionInner {
    id: Uuid,
    bounded: bool,
    parent_id: Option<Uuid>,
    state: RwLock<HashMap<String, JsonValue>>,
    window: Arc<Window>,
}

/// Ámbito de ejecución de un flujo.
///
/// Es un handle barato de clonar. Las sesiones forman un árbol: una hija
/// copia el estado del padre al crearse y tiene su propia ventana. La
/// ventana de la sesión es la del Start: cuenta lo ofrecido y se cumple al
/// completar la sesión.
#[derive(Clone)]
pub struct FlowSession {
    inner: Arc<SessionInner>,
}

impl FlowSession {
    /// Nueva sesión raíz. `bounded` indica que recibirá un conjunto finito
    /// de datos y se completa sola tras el `offer`.
    pub fn new(bounded: bool) -> Self {
        Self::with_id(Uuid::new_v4(), bounded)
    }

    pub fn with_id(id: Uuid, bounded: bool) -> Self {
        Self::build(id, bounded, None, HashMap::new())
    }

    /// Sesión hija: hereda una copia del estado del padre.
    pub fn child(&self) -> Self {
        let mut state = self.state_snapshot();
        state.insert(PARENT_SESSION_KEY.to_string(), JsonValue::String(self.id().to_string()));
        Self::build(Uuid::new_v4(), self.is_bounded(), Some(self.id()), state)
    }

    fn build(id: Uuid, bounded: bool, parent_id: Option<Uuid>, state: HashMap<String, JsonValue>) -> Self {
        let window = Arc::new(Window::new(WindowCondition::session_complete(), 1));
        Self { inner: Arc::new(SessionInner { id,
                                              bounded,
                                              parent_id,
                                              state: RwLock::new(state),
                                              window }) }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn is_bounded(&self) -> bool {
        self.inner.bounded
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.inner.parent_id
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.inner.window
    }

    pub fn get_inner_state(&self, key: &str) -> Option<JsonValue> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set_inner_state(&self, key: &str, value: JsonValue) {
        self.inner
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }

    pub fn state_snapshot(&self) -> HashMap<String, JsonValue> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PartialEq for FlowSession {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for FlowSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowSession")
         .field("id", &self.id())
         .field("bounded", &self.is_bounded())
         .field("parent_id", &self.parent_id())
         .finish()
    }
}

/// Estado de sesión visible para los operadores `Process*`.
#[derive(Clone, Debug)]
pub struct StateContext {
    session: FlowSession,
}

impl StateContext {
    pub fn new(session: FlowSession) -> Self {
        Self { session }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    /// Lee un valor del estado. Devuelve `None` si no existe o si no encaja
    /// en el tipo pedido.
    pub fn get_state<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        self.session
            .get_inner_state(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set_state<V: Serialize>(&self, key: &str, value: V) -> Result<()> {
        self.session.set_inner_state(key, serde_json::to_value(value)?);
        Ok(())
    }
}
