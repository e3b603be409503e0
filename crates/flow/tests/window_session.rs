use flow::emitter::{ConverseLatch, Emitter, EmitterListener};
use flow::errors::FlowError;
use flow::registry::SessionRegistry;
use flow::session::{FlowSession, StateContext, PARENT_SESSION_KEY};
use flow::window::{FlatMapSourceWindow, Window, WindowArg, WindowCondition};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[test]
fn window_fires_exactly_once() {
  let w = Window::new(WindowCondition::session_complete(), 1);
  let fired = Arc::new(AtomicUsize::new(0));
  let counter = fired.clone();
  w.on_fulfilled(move |_| {
     counter.fetch_add(1, Ordering::SeqCst);
   });
  w.complete_upstream();
  assert!(w.evaluate().unwrap());
  w.fire().unwrap();

  // Re-disparar o re-evaluar tras cumplirse es un error, nunca silencioso.
  assert!(matches!(w.fire(), Err(FlowError::WindowViolation(_))));
  assert!(matches!(w.evaluate(), Err(FlowError::WindowViolation(_))));
  assert!(matches!(w.accept(1), Err(FlowError::WindowViolation(_))));
  assert_eq!(fired.load(Ordering::SeqCst), 1);

  // Un callback tardío corre en el acto, una vez.
  let late = fired.clone();
  w.on_fulfilled(move |_| {
     late.fetch_add(1, Ordering::SeqCst);
   });
  assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_fire_has_one_winner() {
  let w = Arc::new(Window::new(WindowCondition::session_complete(), 1));
  let fired = Arc::new(AtomicUsize::new(0));
  let counter = fired.clone();
  w.on_fulfilled(move |_| {
     counter.fetch_add(1, Ordering::SeqCst);
   });
  let handles: Vec<_> = (0..8).map(|_| {
                                let w = w.clone();
                                std::thread::spawn(move || w.fire().is_ok())
                              })
                              .collect();
  let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
  assert_eq!(winners, 1);
  assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn window_arg_reflects_counters() {
  let w = Window::new(WindowCondition::count(2), 1);
  assert_eq!(w.accept(3).unwrap(), 0);
  assert_eq!(w.accept(1).unwrap(), 3);
  w.consume(1);
  let arg = w.arg();
  assert_eq!(arg.data_length, 3);
  assert_eq!(arg.count_to_now, 1);
  assert!(!arg.is_session_complete);
  assert!(w.evaluate().unwrap());

  w.retract(1);
  assert_eq!(w.accepted(), 3);
  assert_eq!(w.allocate(2), 0);
  assert_eq!(w.allocate(2), 2);
}

#[test]
fn elapsed_condition_needs_data_and_time() {
  let cond = WindowCondition::elapsed(Duration::from_millis(100));
  let mut arg = WindowArg { is_session_complete: false,
                            data_length: 0,
                            count_to_now: 0,
                            time_to_now: Duration::from_millis(200) };
  assert!(!cond.test(&arg));
  arg.data_length = 1;
  assert!(cond.test(&arg));
  arg.time_to_now = Duration::from_millis(10);
  assert!(!cond.test(&arg));
  arg.is_session_complete = true;
  assert!(cond.test(&arg));
}

#[test]
fn flat_map_source_tracks_ranges_and_closes_once() {
  let parent = FlowSession::new(true);
  let source = FlatMapSourceWindow::new(Arc::new(Window::new(WindowCondition::session_complete(), 1)), parent.child());
  let a = Uuid::new_v4();
  let b = Uuid::new_v4();
  assert_eq!(source.record(a, 3).unwrap(), 0);
  assert_eq!(source.record(b, 2).unwrap(), 3);
  assert_eq!(source.source_range(&a), Some((0, 3)));
  assert_eq!(source.source_range(&b), Some((3, 2)));
  assert_eq!(source.session().parent_id(), Some(parent.id()));

  source.close().unwrap();
  assert!(source.window().is_fulfilled());
  source.close().unwrap();
  assert!(source.record(Uuid::new_v4(), 1).is_err());
}

#[test]
fn child_session_inherits_a_copy_of_state() {
  let parent = FlowSession::new(false);
  parent.set_inner_state("user", json!("ana"));
  let child = parent.child();
  assert_eq!(child.get_inner_state("user"), Some(json!("ana")));
  assert_eq!(child.get_inner_state(PARENT_SESSION_KEY), Some(json!(parent.id().to_string())));

  child.set_inner_state("user", json!("luis"));
  assert_eq!(parent.get_inner_state("user"), Some(json!("ana")));
  assert_ne!(child.window().key(), parent.window().key());
}

#[test]
fn state_context_is_typed() {
  let session = FlowSession::new(false);
  let state = StateContext::new(session.clone());
  state.set_state("isThinking", true).unwrap();
  assert_eq!(state.get_state::<bool>("isThinking"), Some(true));
  assert_eq!(state.get_state::<String>("isThinking"), None);
  assert_eq!(session.get_inner_state("isThinking"), Some(json!(true)));
  assert_eq!(state.session_id(), session.id());
}

#[test]
fn registry_lifecycle() {
  let registry = SessionRegistry::new();
  let session = FlowSession::new(false);
  assert!(matches!(registry.node_window(&session.id(), "map-1", 1), Err(FlowError::NotFound(_))));

  registry.register(&session);
  let w1 = registry.node_window(&session.id(), "map-1", 1).unwrap();
  let w2 = registry.node_window(&session.id(), "map-1", 1).unwrap();
  assert_eq!(w1.key(), w2.key());
  assert_eq!(registry.windows_for_node("map-1").len(), 1);

  let source = registry.flat_map_source(&session, "flat-map-1").unwrap();
  let child_id = source.session().id();
  assert!(registry.contains(&child_id));
  let again = registry.next_session(&session, source.window().key()).unwrap();
  assert_eq!(again.id(), child_id);

  let trace = Uuid::new_v4();
  registry.add_trace(&session.id(), trace).unwrap();
  assert_eq!(registry.traces(&session.id()), vec![trace]);

  assert!(registry.mark_failed(&session.id(), FlowError::Other("x".into())));
  assert!(!registry.mark_failed(&session.id(), FlowError::Other("y".into())));
  assert_eq!(registry.failure(&session.id()), Some(FlowError::Other("x".into())));

  registry.release(&session.id());
  assert!(!registry.contains(&session.id()));
  assert!(!registry.contains(&child_id));
  assert!(registry.is_empty());
  assert!(registry.find_flat_map_source(&session.id(), "flat-map-1").is_none());
  assert!(registry.windows_for_node("map-1").is_empty());
}

struct Recorder {
  seen: Mutex<Vec<String>>,
}

impl EmitterListener<i64> for Recorder {
  fn handle(&self, data: &i64, _session: &FlowSession) {
    self.seen.lock().unwrap().push(format!("data:{data}"));
  }

  fn on_complete(&self, _session: &FlowSession) {
    self.seen.lock().unwrap().push("complete".into());
  }

  fn on_error(&self, error: &FlowError, _session: &FlowSession) {
    self.seen.lock().unwrap().push(format!("error:{error}"));
  }
}

#[test]
fn emitter_fans_out_and_unregisters() {
  let emitter: Emitter<i64> = Emitter::new();
  let rec = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
  let id = emitter.register(rec.clone());
  let closure_hits = Arc::new(AtomicUsize::new(0));
  let hits = closure_hits.clone();
  emitter.register(Arc::new(move |_: &i64, _: &FlowSession| {
                     hits.fetch_add(1, Ordering::SeqCst);
                   }));
  let session = FlowSession::new(true);
  emitter.emit(&1, &session);
  emitter.complete(&session);
  assert!(emitter.unregister(id));
  assert!(!emitter.unregister(id));
  emitter.emit(&2, &session);

  assert_eq!(*rec.seen.lock().unwrap(), vec!["data:1".to_string(), "complete".to_string()]);
  assert_eq!(closure_hits.load(Ordering::SeqCst), 2);
  assert_eq!(emitter.len(), 1);
}

#[tokio::test]
async fn latch_collects_only_its_session() {
  let emitter = Arc::new(Emitter::<i64>::new());
  let mine = FlowSession::new(true);
  let other = FlowSession::new(true);
  let consumed = Arc::new(AtomicUsize::new(0));
  let counter = consumed.clone();
  let latch = ConverseLatch::attach(emitter.clone(),
                                    mine.id(),
                                    Some(Arc::new(move |_: &i64| {
                                      counter.fetch_add(1, Ordering::SeqCst);
                                    })));
  emitter.emit(&1, &mine);
  emitter.emit(&99, &other);
  emitter.emit(&2, &mine);
  emitter.complete(&other);
  assert_eq!(latch.results(), vec![1, 2]);
  emitter.complete(&mine);

  let out = latch.await_result().await.unwrap();
  assert_eq!(out, vec![1, 2]);
  assert_eq!(consumed.load(Ordering::SeqCst), 2);
  // El latch se desengancha al consumirse.
  assert!(emitter.is_empty());
}

#[tokio::test]
async fn latch_returns_escalated_error() {
  let emitter = Arc::new(Emitter::<i64>::new());
  let session = FlowSession::new(true);
  let latch = ConverseLatch::attach(emitter.clone(), session.id(), None);
  let failure = FlowError::OperatorFailure { node: "map-1".into(),
                                             message: "boom".into() };
  emitter.error(&failure, &session);
  // Lo que llegue después del error no cambia el desenlace.
  emitter.complete(&session);
  assert_eq!(latch.await_result().await, Err(failure));
}

#[tokio::test]
async fn latch_timeout_and_cancel() {
  let emitter = Arc::new(Emitter::<i64>::new());
  let session = FlowSession::new(true);
  let latch = ConverseLatch::attach(emitter.clone(), session.id(), None);
  let res = latch.await_timeout(Duration::from_millis(20)).await;
  assert!(matches!(res, Err(FlowError::Timeout(_))));
  assert!(emitter.is_empty());

  let other = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
  emitter.register(other.clone());
  let latch = ConverseLatch::attach(emitter.clone(), session.id(), None);
  assert_eq!(emitter.len(), 2);
  latch.cancel();
  assert_eq!(emitter.len(), 1);
  emitter.emit(&5, &session);
  assert_eq!(*other.seen.lock().unwrap(), vec!["data:5".to_string()]);
}
