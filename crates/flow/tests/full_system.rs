use flow::domain::ContextStatus;
use flow::window::WindowCondition;
use flow::{Collector, EngineConfig, FlowEngine, FlowError, FlowSession, StateContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env())
                                   .with_test_writer()
                                   .compact()
                                   .try_init();
}

fn engine() -> FlowEngine {
  init_tracing();
  FlowEngine::in_memory(EngineConfig { retry_backoff_ms: 1,
                                       ..EngineConfig::default() })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chunk {
  text: String,
  think: bool,
}

// 50 fragmentos "think" (apertura, 48, cierre) y 50 de respuesta.
fn generate(prompt: &str) -> Vec<String> {
  let mut out = vec!["<think>".to_string()];
  out.extend((0..48).map(|i| format!("{prompt} pienso {i}-{}", i * 3 + 4)));
  out.push("</think>".to_string());
  out.extend((0..50).map(|i| format!("{prompt} digo {i}: 34{i}43")));
  out
}

fn classify(text: String, state: &StateContext) -> anyhow::Result<Chunk> {
  let thinking = state.get_state::<bool>("isThinking").unwrap_or(false);
  Ok(match text.as_str() {
    "<think>" => {
      state.set_state("isThinking", true)?;
      Chunk { text, think: true }
    }
    "</think>" => {
      state.set_state("isThinking", false)?;
      Chunk { text, think: true }
    }
    _ => Chunk { text, think: thinking },
  })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn desensitize_round_trip_delivers_every_chunk() {
  let engine = engine();
  let logged = Arc::new(AtomicUsize::new(0));
  let log_counter = logged.clone();
  let flow = engine.create::<String>("desensitize", "1")
                   .flat_map(|prompt: String| Ok(generate(&prompt)))
                   .process_map(classify)
                   .concurrency(1)
                   .conditions()
                   .when(|c: &Chunk| c.think, |b| b)
                   .others(move |b| {
                     b.just(move |_c: &Chunk| {
                        log_counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                      })
                   })
                   .map(|c: Chunk| Ok(Chunk { text: c.text.replace('3', "*"), ..c }))
                   .map(|c: Chunk| Ok(Chunk { text: c.text.replace('4', "*"), ..c }))
                   .close()
                   .unwrap();

  let out = flow.converse()
                .offer(vec!["hi".to_string()])
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();

  assert_eq!(out.len(), 100);
  assert!(out.iter().all(|c| !c.text.contains('3') && !c.text.contains('4')));
  assert_eq!(out.iter().filter(|c| c.think).count(), 50);
  assert_eq!(logged.load(Ordering::SeqCst), 50);
  let texts: BTreeSet<String> = out.iter().map(|c| c.text.clone()).collect();
  let expected: BTreeSet<String> = generate("hi").into_iter()
                                                 .map(|t| t.replace(['3', '4'], "*"))
                                                 .collect();
  assert_eq!(texts, expected);
  flow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_one_preserves_order() {
  let engine = engine();
  let flow = engine.create::<u32>("order", "1")
                   .map(|x: u32| {
                     // Los primeros tardan más: sin orden se adelantarían los últimos.
                     std::thread::sleep(Duration::from_millis(u64::from(20 - x.min(20))));
                     Ok(x * 2)
                   })
                   .concurrency(1)
                   .close()
                   .unwrap();
  let input: Vec<u32> = (0..30).collect();
  let out = flow.converse()
                .offer(input.clone())
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();
  assert_eq!(out, input.iter().map(|x| x * 2).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_k_keeps_the_output_set() {
  let engine = engine();
  let inside = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));
  let (i, m) = (inside.clone(), max_seen.clone());
  let flow = engine.create::<u32>("parallel", "1")
                   .map(move |x: u32| {
                     let now = i.fetch_add(1, Ordering::SeqCst) + 1;
                     m.fetch_max(now, Ordering::SeqCst);
                     std::thread::sleep(Duration::from_millis(15));
                     i.fetch_sub(1, Ordering::SeqCst);
                     Ok(x + 1000)
                   })
                   .concurrency(4)
                   .close()
                   .unwrap();
  let out = flow.converse()
                .offer((0..40).collect())
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();
  let got: BTreeSet<u32> = out.into_iter().collect();
  let expected: BTreeSet<u32> = (1000..1040).collect();
  assert_eq!(got, expected);
  let max = max_seen.load(Ordering::SeqCst);
  assert!(max <= 4, "máximo en paralelo {max}");
  assert!(max >= 2, "no hubo paralelismo");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_node_throttles_and_bounds_pending() {
  const ITEMS: u32 = 100;
  const FAST: Duration = Duration::from_millis(1);
  const SLOW: Duration = Duration::from_millis(10);
  const BACKLOG: usize = 8;
  let engine = engine();
  let flow = engine.create::<u32>("backpressure", "1")
                   .map(|x: u32| {
                     std::thread::sleep(FAST);
                     Ok(x)
                   })
                   .map(|x: u32| {
                     std::thread::sleep(SLOW);
                     Ok(x)
                   })
                   .concurrency(1)
                   .backlog(BACKLOG)
                   .close()
                   .unwrap();
  let slow_node = flow.node_ids()[1].clone();
  let stream = flow.stream_id().to_string();

  let done = Arc::new(AtomicBool::new(false));
  let max_pending = Arc::new(AtomicUsize::new(0));
  let probe = {
    let repo = engine.repository().clone();
    let done = done.clone();
    let max_pending = max_pending.clone();
    tokio::spawn(async move {
      while !done.load(Ordering::SeqCst) {
        let pending = repo.get_contexts_by_position(&stream, &[slow_node.clone()], ContextStatus::Pending)
                          .unwrap()
                          .len();
        max_pending.fetch_max(pending, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    })
  };

  let started = Instant::now();
  let out = flow.converse()
                .offer((0..ITEMS).collect())
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(30))
                .await
                .unwrap();
  let elapsed = started.elapsed();
  done.store(true, Ordering::SeqCst);
  probe.await.unwrap();

  assert_eq!(out.len(), ITEMS as usize);
  // El nodo lento marca el ritmo: diez veces el coste del rápido por item.
  assert!(elapsed >= FAST * 10 * ITEMS, "terminó en {elapsed:?}");
  let max = max_pending.load(Ordering::SeqCst);
  assert!(max <= BACKLOG, "pendientes en el nodo lento: {max}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn branches_route_each_item_once() {
  let engine = engine();
  let flow = engine.create::<i64>("branches", "1")
                   .conditions()
                   .when(|x: &i64| x % 2 == 0, |b| b.map(|x: i64| Ok(x * 10)))
                   .when(|x: &i64| x % 3 == 0, |b| b.map(|x: i64| Ok(-x)))
                   .others(|b| b)
                   .map(|x: i64| Ok(x + 1))
                   .close()
                   .unwrap();
  let out = flow.converse()
                .offer((1..=9).collect())
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();
  let got: BTreeSet<i64> = out.into_iter().collect();
  // pares ×10, múltiplos de 3 impares negados, el resto tal cual; todo +1.
  let expected: BTreeSet<i64> = [2, 21, -2, 41, 6, 61, 8, 81, -8].into_iter().collect();
  assert_eq!(got, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn filter_and_validator_drop_items() {
  let engine = engine();
  let flow = engine.create::<u32>("filters", "1")
                   .filter(|x: &u32| x % 2 == 0)
                   .validate(|xs: &[u32]| Ok(xs.iter().map(|x| *x < 10).collect()))
                   .batch(4)
                   .close()
                   .unwrap();
  let out = flow.converse()
                .offer((0..20).collect())
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();
  assert_eq!(out, vec![0, 2, 4, 6, 8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn process_collects_many_outputs_in_order() {
  let engine = engine();
  let flow = engine.create::<i64>("process", "1")
                   .process(|x: i64, _state: &StateContext, out: &mut Collector<i64>| {
                     out.collect(x)?;
                     out.collect(-x)?;
                     Ok(())
                   })
                   .close()
                   .unwrap();
  let out = flow.converse()
                .offer(vec![1, 2, 3])
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();
  assert_eq!(out, vec![1, -1, 2, -2, 3, -3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reduce_emits_once_per_session() {
  let engine = engine();
  let flow = engine.create::<u64>("sum", "1")
                   .reduce(|| 0u64, |acc, x: u64| Ok(acc + x))
                   .close()
                   .unwrap();
  let out = flow.converse()
                .offer((1..=10).collect())
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();
  assert_eq!(out, vec![55]);

  // Otra sesión empieza con el acumulador vacío.
  let again = flow.converse()
                  .offer(vec![4, 5])
                  .await
                  .unwrap()
                  .await_timeout(Duration::from_secs(20))
                  .await
                  .unwrap();
  assert_eq!(again, vec![9]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn process_reduce_sees_session_state() {
  let engine = engine();
  let flow = engine.create::<String>("words", "1")
                   .process_reduce(Vec::<String>::new, |mut acc, w: String, state: &StateContext| {
                     let sep = state.get_state::<String>("sep").unwrap_or_default();
                     acc.push(format!("{sep}{w}"));
                     Ok(acc)
                   })
                   .close()
                   .unwrap();
  let session = FlowSession::new(true);
  session.set_inner_state("sep", serde_json::json!("#"));
  let out = flow.converse()
                .with_session(session)
                .offer(vec!["a".into(), "b".into()])
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();
  assert_eq!(out, vec![vec!["#a".to_string(), "#b".to_string()]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn produce_flushes_count_panes() {
  let engine = engine();
  let flow = engine.create::<u32>("panes", "1")
                   .produce(|items: Vec<u32>| Ok(vec![items.iter().sum::<u32>()]))
                   .window(WindowCondition::count(3))
                   .close()
                   .unwrap();
  let out = flow.converse()
                .offer((1..=7).collect())
                .await
                .unwrap()
                .await_timeout(Duration::from_secs(20))
                .await
                .unwrap();
  assert_eq!(out, vec![6, 15, 7]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flat_map_children_share_a_parallel_id() {
  let engine = engine();
  let flow = engine.create::<u32>("fanout", "1")
                   .flat_map(|n: u32| Ok((0..n).map(move |i| n * 100 + i)))
                   .close()
                   .unwrap();
  let session = FlowSession::new(true);
  let latch = flow.converse()
                  .with_session(session.clone())
                  .offer(vec![2, 3])
                  .await
                  .unwrap();
  let out = latch.await_timeout(Duration::from_secs(20)).await.unwrap();
  assert_eq!(out, vec![200, 201, 300, 301, 302]);

  let end_contexts = engine.repository()
                           .find_by_stream_id(flow.stream_id())
                           .unwrap()
                           .into_iter()
                           .filter(|c| c.position == "end")
                           .collect::<Vec<_>>();
  assert_eq!(end_contexts.len(), 5);
  let parallel: BTreeSet<_> = end_contexts.iter().map(|c| c.parallel_id).collect();
  assert_eq!(parallel.len(), 1);
  assert!(parallel.iter().all(|p| p.is_some()));
  assert!(end_contexts.iter().all(|c| c.session_id == session.id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_join_waits_for_every_branch() {
  let engine = engine();
  let flow = engine.create::<i64>("fork-all", "1")
                   .parallel()
                   .fork(|b| b.map(|x: i64| Ok(x + 1)))
                   .fork(|b| {
                     b.map(|x: i64| {
                       std::thread::sleep(Duration::from_millis(10));
                       Ok(x * 100)
                     })
                   })
                   .fork(|b| b.filter(|x: &i64| x % 2 == 0).map(|x: i64| Ok(x * 10_000)))
                   .join(Vec::new, |mut acc: Vec<i64>, x: i64| {
                     acc.push(x);
                     Ok(acc)
                   })
                   .map(|mut parts: Vec<i64>| {
                     parts.sort();
                     Ok(parts)
                   })
                   .close()
                   .unwrap();
  let join = flow.node_ids()
                 .into_iter()
                 .find(|id| id.starts_with("join-"))
                 .unwrap();

  let session = FlowSession::new(true);
  let latch = flow.converse()
                  .with_session(session.clone())
                  .offer(vec![1, 2, 3])
                  .await
                  .unwrap();
  let mut out = latch.await_timeout(Duration::from_secs(20)).await.unwrap();
  out.sort();
  assert_eq!(out, vec![vec![2, 100], vec![3, 200, 20_000], vec![4, 300]]);

  // Cada item bifurcado llega al join bajo un único parallel_id, y la
  // salida del join recupera la correlación previa (ninguna).
  let contexts = engine.repository().find_by_stream_id(flow.stream_id()).unwrap();
  let mut per_fork: BTreeMap<_, usize> = BTreeMap::new();
  for ctx in contexts.iter().filter(|c| c.position == join) {
    *per_fork.entry(ctx.parallel_id.unwrap()).or_insert(0) += 1;
  }
  let mut sizes: Vec<usize> = per_fork.into_values().collect();
  sizes.sort();
  assert_eq!(sizes, vec![2, 2, 3]);
  assert!(contexts.iter()
                  .filter(|c| c.position == "end")
                  .all(|c| c.parallel_id.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_join_any_keeps_the_first_result() {
  let engine = engine();
  let flow = engine.create::<u64>("fork-any", "1")
                   .parallel()
                   .fork(|b| {
                     b.map(|x: u64| {
                       std::thread::sleep(Duration::from_millis(300));
                       Ok(format!("lento-{x}"))
                     })
                   })
                   .fork(|b| b.map(|x: u64| Ok(format!("rapido-{x}"))))
                   .join_any()
                   .close()
                   .unwrap();
  let mut out = flow.converse()
                    .offer(vec![1, 2])
                    .await
                    .unwrap()
                    .await_timeout(Duration::from_secs(20))
                    .await
                    .unwrap();
  out.sort();
  assert_eq!(out, vec!["rapido-1".to_string(), "rapido-2".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn default_session_completes_on_demand() {
  let engine = engine();
  let flow = engine.create::<u32>("unbounded", "1")
                   .map(|x: u32| Ok(x + 1))
                   .close()
                   .unwrap();
  let (data_tx, mut data_rx) = tokio::sync::mpsc::unbounded_channel();
  flow.register(Arc::new(move |x: &u32, _: &FlowSession| {
                  let _ = data_tx.send(*x);
                }));
  let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
  flow.on_complete(move |session, traces| {
        let _ = done_tx.send((session.id(), traces.to_vec()));
      });

  let trace = flow.offer(vec![1, 2, 3]).await.unwrap();
  let mut got = Vec::new();
  for _ in 0..3 {
    got.push(tokio::time::timeout(Duration::from_secs(10), data_rx.recv()).await.unwrap().unwrap());
  }
  got.sort();
  assert_eq!(got, vec![2, 3, 4]);
  // Sin completar la sesión la traza sigue viva.
  assert!(!engine.is_trace_terminated(&trace).unwrap());

  let session = flow.default_session();
  flow.complete().unwrap();
  let (done_session, traces) = tokio::time::timeout(Duration::from_secs(10), done_rx.recv()).await
                                                                                         .unwrap()
                                                                                         .unwrap();
  assert_eq!(done_session, session.id());
  assert_eq!(traces, vec![trace]);
  assert!(engine.is_trace_terminated(&trace).unwrap());
  assert!(engine.contexts_of_trace(&trace)
                .unwrap()
                .iter()
                .all(|c| c.status.is_terminal()));
  assert!(flow.registry().is_empty());

  // La sesión por defecto se renovó.
  assert_ne!(flow.default_session().id(), session.id());
  flow.offer(vec![10]).await.unwrap();
  assert_eq!(tokio::time::timeout(Duration::from_secs(10), data_rx.recv()).await.unwrap(), Some(11));

  // Una sola notificación de fin por sesión.
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert!(done_rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completed_session_rejects_more_data() {
  let engine = engine();
  let flow = engine.create::<u32>("closed", "1")
                   .map(|x: u32| Ok(x))
                   .close()
                   .unwrap();
  let session = FlowSession::new(false);
  flow.offer_with(vec![1], &session).await.unwrap();
  flow.complete_session(&session).unwrap();
  assert!(matches!(flow.complete_session(&session), Err(FlowError::WindowViolation(_))));
  assert!(matches!(flow.offer_with(vec![2], &session).await, Err(FlowError::WindowViolation(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admin_reads_after_a_run() {
  let engine = engine();
  let flow = engine.create::<u32>("admin", "7")
                   .map(|x: u32| Ok(x))
                   .close()
                   .unwrap();
  flow.converse()
      .offer(vec![1, 2])
      .await
      .unwrap()
      .await_timeout(Duration::from_secs(10))
      .await
      .unwrap();
  assert_eq!(flow.stream_id(), "admin-7");
  assert_eq!(flow.node_ids(), vec!["map-1".to_string(), "end".to_string()]);
  assert!(engine.running_contexts("admin").unwrap().is_empty());
  // Entrada en map-1 y salida en end por cada item.
  assert_eq!(engine.purge("admin", "7").unwrap(), 4);
  assert!(engine.repository().find_by_stream_id("admin-7").unwrap().is_empty());
}
