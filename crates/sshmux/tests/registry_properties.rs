//! Registry laws under random operation sequences and concurrent switching.

mod common;

use std::sync::Arc;

use proptest::prelude::*;

use common::{make_ready, FakeRemote};
use sshmux::session::{SessionManager, SessionState};

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Select(usize),
    Next,
    Previous,
    Close(usize),
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..6).prop_map(Op::Create),
        2 => (0usize..8).prop_map(Op::Select),
        2 => Just(Op::Next),
        2 => Just(Op::Previous),
        2 => (0usize..8).prop_map(Op::Close),
        1 => Just(Op::Clear),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn check_invariants(manager: &SessionManager) -> Result<(), TestCaseError> {
    let stats = manager.stats();
    prop_assert!(stats.active <= 1, "more than one active session: {stats:?}");

    let sessions = manager.list_sessions();
    match manager.active_id() {
        Some(id) => {
            prop_assert!(sessions.iter().any(|s| s.id == id), "active id {id} is dangling");
            for info in &sessions {
                if info.state == SessionState::Active {
                    prop_assert_eq!(&info.id, &id);
                }
            }
        }
        None => prop_assert_eq!(stats.active, 0),
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_active_is_never_dangling(ops in proptest::collection::vec(op(), 1..60)) {
        let rt = runtime();
        let manager = SessionManager::new();
        let mut remotes: Vec<FakeRemote> = Vec::new();

        for op in ops {
            match op {
                Op::Create(host) => {
                    if let Ok(session) = manager.create(&format!("host{host}"), "deploy") {
                        remotes.push(make_ready(&session));
                    }
                }
                Op::Select(index) => {
                    if let Some(session) = manager.get_by_index(index) {
                        manager.set_active(session.id()).unwrap();
                        prop_assert_eq!(session.state(), SessionState::Active);
                    }
                }
                Op::Next => {
                    manager.switch_next();
                }
                Op::Previous => {
                    manager.switch_previous();
                }
                Op::Close(index) => {
                    if let Some(session) = manager.get_by_index(index) {
                        let was_active = manager.is_active(session.id());
                        let before = manager.session_count();
                        rt.block_on(manager.close(session.id())).unwrap();
                        prop_assert_eq!(session.state(), SessionState::Closed);
                        prop_assert_eq!(manager.session_count(), before - 1);
                        if was_active && before > 1 {
                            prop_assert!(manager.active_id().is_some());
                        }
                    }
                }
                Op::Clear => manager.clear_active(),
            }
            check_invariants(&manager)?;
        }
    }

    #[test]
    fn prop_next_then_previous_returns(count in 2usize..7, start in 0usize..7, steps in 0usize..15) {
        let manager = SessionManager::new();
        let mut remotes = Vec::new();
        for i in 0..count {
            let session = manager.create(&format!("host{i}"), "deploy").unwrap();
            remotes.push(make_ready(&session));
        }

        let origin = manager.get_by_index(start % count).unwrap();
        manager.set_active(origin.id()).unwrap();

        for _ in 0..steps {
            manager.switch_next();
        }
        let expected = manager.get_by_index((start % count + steps) % count).unwrap();
        prop_assert_eq!(manager.active_id(), Some(expected.id().clone()));

        for _ in 0..steps {
            manager.switch_previous();
        }
        prop_assert_eq!(manager.active_id(), Some(origin.id().clone()));
        prop_assert_eq!(manager.active_count(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_switching_keeps_one_active() {
    let manager = Arc::new(SessionManager::new());
    let sessions: Arc<Vec<_>> = Arc::new(
        (0..6)
            .map(|i| manager.create(&format!("host{i}"), "deploy").unwrap())
            .collect(),
    );
    let _remotes: Vec<FakeRemote> = sessions.iter().map(|s| make_ready(s)).collect();
    manager.set_active(sessions[0].id()).unwrap();

    let mut tasks = Vec::new();
    for worker in 0..8usize {
        let manager = Arc::clone(&manager);
        let sessions = Arc::clone(&sessions);
        tasks.push(tokio::spawn(async move {
            for round in 0..500usize {
                match (worker + round) % 3 {
                    0 => {
                        let target = &sessions[(worker * 7 + round) % sessions.len()];
                        manager.set_active(target.id()).unwrap();
                    }
                    1 => {
                        manager.switch_next();
                    }
                    _ => {
                        manager.switch_previous();
                    }
                }
                if round % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let checker = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            for round in 0..2000usize {
                let stats = manager.stats();
                assert!(stats.active <= 1, "observed {stats:?}");
                assert_eq!(stats.active + stats.idle, 6);
                if round % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    for task in tasks {
        task.await.unwrap();
    }
    checker.await.unwrap();

    assert_eq!(manager.active_count(), 1);
    let active = manager.get_active().unwrap();
    assert_eq!(active.state(), SessionState::Active);
}
