use beryld::core::locks::{EntityLock, Held, LockMode};
use std::time::Duration;

#[tokio::test]
async fn test_none_mode_holds_nothing() {
    let lock = EntityLock::new(42u32);
    let held = lock.acquire(LockMode::None).await;
    assert!(!held.held());
    assert_eq!(lock.counts().readers, 0);
    assert_eq!(lock.counts().writers, 0);
}

#[tokio::test]
async fn test_concurrent_readers() {
    let lock = EntityLock::new(42u32);
    let a = lock.acquire(LockMode::Read).await;
    let b = lock.acquire(LockMode::Read).await;
    assert_eq!(*a.get(), 42);
    assert_eq!(*b.get(), 42);
    assert_eq!(lock.counts().readers, 2);
    drop(a);
    assert_eq!(lock.counts().readers, 1);
    drop(b);
    assert_eq!(lock.counts().readers, 0);
}

#[tokio::test]
async fn test_writer_excludes_readers() {
    let lock = EntityLock::new(0u32);
    let mut w = lock.acquire(LockMode::Write).await;
    *w.get_mut() = 7;
    assert_eq!(lock.counts().writers, 1);

    // A reader must block while the writer is held.
    let blocked = tokio::time::timeout(Duration::from_millis(50), lock.acquire(LockMode::Read));
    assert!(blocked.await.is_err());

    drop(w);
    let r = lock.acquire(LockMode::Read).await;
    assert_eq!(*r.get(), 7);
}

#[tokio::test]
async fn test_reader_blocks_writer() {
    let lock = EntityLock::new(0u32);
    let _r = lock.acquire(LockMode::Read).await;
    let blocked = tokio::time::timeout(Duration::from_millis(50), lock.acquire(LockMode::Write));
    assert!(blocked.await.is_err());
}

#[tokio::test]
async fn test_writer_sees_previous_writer_effects() {
    let lock = EntityLock::new(Vec::<u32>::new());
    {
        let mut w = lock.acquire(LockMode::Write).await;
        w.get_mut().push(1);
    }
    {
        let mut w = lock.acquire(LockMode::Write).await;
        w.get_mut().push(2);
    }
    let r = lock.acquire(LockMode::Read).await;
    assert_eq!(r.get().as_slice(), &[1, 2]);
}

#[test]
#[should_panic]
fn test_get_without_lock_panics() {
    let held: Held<u32> = Held::None;
    let _ = held.get();
}
