// Archivo: errors.rs
// Propósito: definir los errores del motor de flujos y el alias Result<T>
// usado por las APIs del crate. Los mensajes están en español.
use thiserror::Error;

/// Errores del motor de flujos.
///
/// Taxonomía principal:
/// - `OperatorFailure`: un operador devolvió error para un contexto.
/// - `StoreUnavailable`: falló una llamada al almacén de contextos.
/// - `LockUnavailable`: el proveedor de locks no respondió.
/// - `WindowViolation`: una ventana se evaluó o disparó tras cumplirse.
///
/// El resto de variantes cubre errores de uso, configuración y serialización.
/// `FlowError` es `Clone` para poder notificar el mismo error a varios
/// listeners.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
  /// Un operador falló al procesar datos del nodo `node`.
  #[error("Fallo de operador en '{node}': {message}")]
  OperatorFailure { node: String, message: String },
  /// El almacén de contextos no está disponible.
  #[error("Almacén no disponible: {0}")]
  StoreUnavailable(String),
  /// El proveedor de locks no está disponible.
  #[error("Lock no disponible: {0}")]
  LockUnavailable(String),
  /// Una ventana se usó después de cumplirse (error de programación).
  #[error("Violación de ventana: {0}")]
  WindowViolation(String),
  /// Entidad no encontrada (contexto, traza, sesión, nodo o tag).
  #[error("No encontrado: {0}")]
  NotFound(String),
  /// Conflicto de concurrencia: el contexto ya no está en el estado esperado.
  #[error("Conflicto: {0}")]
  Conflict(String),
  /// Operación no soportada por la implementación del contrato.
  #[error("No soportado: {0}")]
  Unsupported(String),
  /// Error al (de)serializar datos del flujo.
  #[error("Error de serialización: {0}")]
  Serialization(String),
  /// Configuración inválida.
  #[error("Configuración inválida: {0}")]
  Config(String),
  /// Espera sincrónica cancelada.
  #[error("Cancelado: {0}")]
  Cancelled(String),
  /// Espera sincrónica agotada.
  #[error("Tiempo agotado: {0}")]
  Timeout(String),
  /// Otro tipo de error.
  #[error("Otro: {0}")]
  Other(String),
}

impl FlowError {
  /// Construye un `OperatorFailure` a partir del error devuelto por el código
  /// de aplicación.
  pub fn operator(node: &str, error: anyhow::Error) -> Self {
    FlowError::OperatorFailure { node: node.to_string(),
                                 message: format!("{error:#}") }
  }

  /// Errores que abortan el ciclo actual de un nodo para reintentarlo
  /// completo: nada se persistió todavía en ese ciclo.
  pub fn is_transient(&self) -> bool {
    matches!(self,
             FlowError::StoreUnavailable(_) | FlowError::LockUnavailable(_) | FlowError::Conflict(_))
  }
}

impl From<serde_json::Error> for FlowError {
  fn from(e: serde_json::Error) -> Self {
    FlowError::Serialization(e.to_string())
  }
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, FlowError>;
