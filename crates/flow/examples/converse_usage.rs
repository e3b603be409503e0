// Ejemplo: flujo con ramas, estado de sesión y conversación sincrónica.
//
// Ejecutar con `RUST_LOG=flow=debug cargo run -p flow --example converse_usage`
// para ver los avances de cada nodo.
use flow::{EngineConfig, FlowEngine, FlowSession, StateContext};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env())
                                     .try_init();

    let engine = FlowEngine::in_memory(EngineConfig::default());
    let flow = engine.create::<String>("pedidos", "1")
                     .flat_map(|line: String| Ok(line.split(',').map(|s| s.trim().to_string()).collect::<Vec<_>>()))
                     .process_map(|item: String, state: &StateContext| {
                         let prefix = state.get_state::<String>("cliente").unwrap_or_default();
                         Ok(format!("{prefix}:{item}"))
                     })
                     .conditions()
                     .when(|s: &String| s.ends_with("urgente"), |b| b.map(|s: String| Ok(s.to_uppercase())))
                     .others(|b| b)
                     .tag("salida")
                     .close()?;

    let session = FlowSession::new(true);
    session.set_inner_state("cliente", serde_json::json!("acme"));
    let latch = flow.converse()
                    .with_session(session)
                    .do_on_consume(|s: &String| println!("-> {s}"))
                    .offer(vec!["tornillos, tuercas urgente".to_string(), "arandelas".to_string()])
                    .await?;
    let results = latch.await_timeout(Duration::from_secs(5)).await?;
    println!("{} resultados, nodos {:?}", results.len(), flow.node_ids());

    flow.shutdown().await;
    Ok(())
}
