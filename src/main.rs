use flow::{EngineConfig, FlowEngine, StateContext};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Fragmento de respuesta de un generador de texto.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chunk {
    text: String,
    think: bool,
}

/// Generador simulado: un bloque `<think>` de 50 fragmentos seguido de 50
/// fragmentos de respuesta.
fn generate(prompt: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(100);
    out.push("<think>".to_string());
    out.extend((0..48).map(|i| format!("{prompt}:pensando {i} {}", i * 7)));
    out.push("</think>".to_string());
    out.extend((0..50).map(|i| format!("{prompt}:respuesta {i} tel 555-{:04}", i * 13)));
    out
}

// Marca como "think" todo lo que va entre `<think>` y `</think>`, ambos
// incluidos.
fn classify(text: String, state: &StateContext) -> anyhow::Result<Chunk> {
    let thinking = state.get_state::<bool>("isThinking").unwrap_or(false);
    let chunk = match text.as_str() {
        "<think>" => {
            state.set_state("isThinking", true)?;
            Chunk { text, think: true }
        }
        "</think>" => {
            state.set_state("isThinking", false)?;
            Chunk { text, think: true }
        }
        _ => Chunk { text, think: thinking },
    };
    Ok(chunk)
}

fn mask(chunk: Chunk, digit: char) -> Chunk {
    Chunk { text: chunk.text.replace(digit, "*"),
            ..chunk }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env())
                                     .compact()
                                     .try_init();

    let config = EngineConfig::from_env()?;
    info!(?config, "configuración cargada");
    let engine = FlowEngine::in_memory(config);

    let flow = engine.create::<String>("desensitize", "1")
                     .flat_map(|prompt: String| Ok(generate(&prompt)))
                     .process_map(classify)
                     .concurrency(1)
                     .conditions()
                     .when(|c: &Chunk| c.think, |b| b)
                     .others(|b| {
                         b.just(|c: &Chunk| {
                              info!(text = %c.text, "fragmento de respuesta");
                              Ok(())
                          })
                     })
                     .map(|c: Chunk| Ok(mask(c, '3')))
                     .map(|c: Chunk| Ok(mask(c, '4')))
                     .close()?;

    let latch = flow.converse()
                    .do_on_consume(|c: &Chunk| println!("{}", c.text))
                    .offer(vec!["hi".to_string()])
                    .await?;
    let results = latch.await_result().await?;
    info!(count = results.len(), nodes = ?flow.node_ids(), "conversación terminada");
    flow.shutdown().await;
    Ok(())
}
