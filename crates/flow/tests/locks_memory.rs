use flow::errors::FlowError;
use flow::locks::{FlowLockGuard, FlowLocks, PROCESS};
use flow::stubs::MemoryFlowLocks;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn lock_key_has_expected_layout() {
  let locks = MemoryFlowLocks::new();
  assert_eq!(locks.lock_key("chat-1", "map-2", PROCESS), "flow-node-chat-1-map-2-process");
}

#[tokio::test]
async fn try_lock_fails_while_held() {
  let locks = MemoryFlowLocks::new();
  let a = locks.local_lock("k");
  let b = locks.local_lock("k");
  a.lock().await.unwrap();
  assert!(!b.try_lock().unwrap());
  assert!(!b.try_lock_for(Duration::from_millis(20)).await.unwrap());
  a.unlock().unwrap();
  assert!(b.try_lock().unwrap());
  b.unlock().unwrap();
}

#[tokio::test]
async fn unlock_without_lock_is_an_error() {
  let locks = MemoryFlowLocks::new();
  let lock = locks.local_lock("k");
  assert!(matches!(lock.unlock(), Err(FlowError::LockUnavailable(_))));
}

#[tokio::test]
async fn cells_are_collected_when_unused() {
  let locks = MemoryFlowLocks::new();
  {
    let lock = locks.distributed_lock("a");
    let _guard = FlowLockGuard::acquire(lock).await.unwrap();
    assert_eq!(locks.len(), 1);
  }
  assert!(locks.is_empty());

  // Una celda tomada sigue viva mientras otro handle la referencia.
  let held = locks.local_lock("b");
  let other = locks.local_lock("b");
  held.lock().await.unwrap();
  drop(other);
  assert_eq!(locks.len(), 1);
  // Soltar el handle que tiene el lock lo libera.
  drop(held);
  assert!(locks.is_empty());
}

#[tokio::test]
async fn only_the_holder_can_unlock() {
  let locks = MemoryFlowLocks::new();
  let owner = locks.local_lock("k");
  let intruder = locks.local_lock("k");
  owner.lock().await.unwrap();

  assert!(matches!(intruder.unlock(), Err(FlowError::LockUnavailable(_))));
  // El lock sigue tomado por su dueño.
  assert!(!intruder.try_lock().unwrap());

  owner.unlock().unwrap();
  assert!(matches!(owner.unlock(), Err(FlowError::LockUnavailable(_))));
  assert!(intruder.try_lock().unwrap());
  intruder.unlock().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn guard_gives_mutual_exclusion() {
  let locks = MemoryFlowLocks::new();
  let inside = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));
  let mut handles = Vec::new();
  for _ in 0..8 {
    let locks = locks.clone();
    let inside = inside.clone();
    let max_seen = max_seen.clone();
    handles.push(tokio::spawn(async move {
                   for _ in 0..5 {
                     let _guard = FlowLockGuard::acquire(locks.local_lock("shared")).await.unwrap();
                     let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                     max_seen.fetch_max(now, Ordering::SeqCst);
                     tokio::time::sleep(Duration::from_millis(1)).await;
                     inside.fetch_sub(1, Ordering::SeqCst);
                   }
                 }));
  }
  for h in handles {
    h.await.unwrap();
  }
  assert_eq!(max_seen.load(Ordering::SeqCst), 1);
  assert!(locks.is_empty());
}

#[test]
fn try_lock_for_gives_up_without_holding() {
  let locks = MemoryFlowLocks::new();
  let held = locks.local_lock("slow");
  let waiter = locks.local_lock("slow");
  tokio_test::block_on(async {
    held.lock().await.unwrap();
    assert!(!waiter.try_lock_for(Duration::from_millis(10)).await.unwrap());
    held.unlock().unwrap();
    assert!(waiter.try_lock_for(Duration::from_millis(10)).await.unwrap());
    waiter.unlock().unwrap();
  });
  drop((held, waiter));
  assert!(locks.is_empty());
}
