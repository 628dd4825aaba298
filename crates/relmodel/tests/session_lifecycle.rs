mod common;

use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use common::*;
use relmodel::prelude::*;
use relmodel::{SessionEvent, Statement};

#[test]
fn remove_deletes_children_before_parent() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = memory_session();

    rt.block_on(async {
        session.persist(&fixture_parent()).expect("persist fixture");
        unwrap_outcome(session.commit(&cx).await);
        store.clear_statements();

        session.remove_key("parent", &parent_key()).expect("remove parent");
        assert_eq!(session.pending_counts().deleted, 3);
        assert_eq!(session.state_of("parent", &parent_key()), EntityState::Removed);
        unwrap_outcome(session.commit(&cx).await);

        assert_eq!(
            shape(&store.statements()),
            vec![("DELETE", "child"), ("DELETE", "child"), ("DELETE", "parent")]
        );
        assert_eq!(store.row_count("parent"), 0);
        assert_eq!(store.row_count("child"), 0);

        let missing = session.find(&cx, "parent", &parent_key()).await;
        assert!(matches!(missing, Outcome::Err(ref e) if e.is_not_found()));
        assert_eq!(session.state_of("child", &child_key(1)), EntityState::Removed);
    });
}

#[test]
fn remove_of_unknown_entity_is_not_found() {
    let (mut session, _store) = memory_session();
    let err = session.remove_key("parent", &parent_key()).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn rollback_restores_pending_removal() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = memory_session();

    rt.block_on(async {
        session.persist(&fixture_parent()).expect("persist fixture");
        unwrap_outcome(session.commit(&cx).await);

        let mut parent = session.get("parent", &parent_key()).expect("parent is managed");
        parent.collection_mut("children").clear();
        session.persist(&parent).expect("synchronize parent");
        session.remove_key("child", &child_key(1)).expect("remove C1");
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(store.row_count("child"), 0);

        unwrap_outcome(session.rollback(&cx).await);
        assert!(!session.in_transaction());
        assert_eq!(store.row_count("child"), 2);
        assert!(session.pending_counts().is_empty());

        let parent = unwrap_outcome(session.find(&cx, "parent", &parent_key()).await);
        assert!(parent.collection("children").unwrap().contains_key(&child_key(2)));
        assert!(parent.one("child").is_some());
    });
}

#[test]
fn commit_failure_rolls_back_everything() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = memory_session();
    store.fail_next_commit("disk full");

    rt.block_on(async {
        session.persist(&fixture_parent()).expect("persist fixture");
        let outcome = session.commit(&cx).await;
        let Outcome::Err(Error::Persistence(failure)) = outcome else {
            panic!("expected persistence failure, got {outcome:?}");
        };
        assert!(failure.rolled_back);
        assert!(matches!(*failure.source, Error::Query(_)));
    });

    assert_eq!(store.row_count("parent"), 0);
    assert_eq!(store.row_count("child"), 0);
    assert!(!store.in_transaction());
    assert_eq!(session.state_of("parent", &parent_key()), EntityState::Transient);
    assert_eq!(session.debug_state().tracked, 0);
}

#[test]
fn constraint_violation_during_flush_rolls_back() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = memory_session();
    store
        .execute_sync(&Statement::Insert {
            table: "parent",
            columns: vec!["id"],
            values: vec![text(PARENT_KEY)],
        })
        .expect("seed parent row");

    rt.block_on(async {
        session.persist(&fixture_parent()).expect("persist fixture");
        let outcome = session.commit(&cx).await;
        let Outcome::Err(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(err.is_constraint_violation(), "{err}");
        assert!(matches!(err, Error::Persistence(ref f) if f.rolled_back));
    });

    assert_eq!(store.row_count("parent"), 1);
    assert_eq!(store.row_count("child"), 0);
    assert!(session.pending_counts().is_empty());
}

#[test]
fn attribute_change_becomes_update() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = memory_session();

    rt.block_on(async {
        session.persist(&fixture_parent()).expect("persist fixture");
        unwrap_outcome(session.commit(&cx).await);
        store.clear_statements();

        let mut parent = session.get("parent", &parent_key()).expect("parent is managed");
        parent.set_attr("name", "renamed");
        session.persist(&parent).expect("synchronize parent");
        assert_eq!(session.pending_counts().dirty, 1);
        unwrap_outcome(session.commit(&cx).await);
    });

    let statements = store.statements();
    assert_eq!(shape(&statements), vec![("UPDATE", "parent")]);
    let Statement::Update { set_columns, .. } = &statements[0] else {
        panic!("expected update");
    };
    assert_eq!(set_columns, &vec!["name"]);
    let rows = store.rows("parent").unwrap();
    assert_eq!(rows[0].get_by_name("name"), Some(&text("renamed")));
}

#[test]
fn detach_and_clear_evict_entities() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = memory_session();

    rt.block_on(async {
        session.persist(&fixture_parent()).expect("persist fixture");

        // A detached entity's pending insert is dropped.
        session.detach("child", &child_key(1)).expect("detach C1");
        assert_eq!(session.state_of("child", &child_key(1)), EntityState::Detached);
        assert!(session.detach("child", &child_key(1)).unwrap_err().is_not_found());
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(store.row_count("child"), 1);

        session.clear();
        assert_eq!(session.state_of("parent", &parent_key()), EntityState::Detached);
        assert_eq!(session.debug_state().tracked, 0);

        // Detached entities are read again from the store.
        let parent = unwrap_outcome(session.find(&cx, "parent", &parent_key()).await);
        assert_eq!(parent.attr("name"), Some(&text("p")));
        assert!(session.contains("parent", &parent_key()));
    });
}

#[test]
fn events_fire_around_flush_and_commit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, _store) = memory_session();
    let seen: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));

    let log = |event: SessionEvent| {
        let seen = Arc::clone(&seen);
        move || {
            seen.lock().unwrap().push(event);
            Ok::<(), Error>(())
        }
    };
    session.on_before_flush(log(SessionEvent::BeforeFlush));
    session.on_after_flush(log(SessionEvent::AfterFlush));
    session.on_before_commit(log(SessionEvent::BeforeCommit));
    session.on_after_commit(log(SessionEvent::AfterCommit));
    session.on_after_rollback(log(SessionEvent::AfterRollback));

    rt.block_on(async {
        session.persist(&fixture_parent()).expect("persist fixture");
        unwrap_outcome(session.commit(&cx).await);
        unwrap_outcome(session.rollback(&cx).await);
    });

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            SessionEvent::BeforeFlush,
            SessionEvent::AfterFlush,
            SessionEvent::BeforeCommit,
            SessionEvent::AfterCommit,
            SessionEvent::AfterRollback,
        ]
    );
}

#[test]
fn debug_state_lists_tracked_entities() {
    let (mut session, _store) = memory_session();
    session.persist(&fixture_parent()).expect("persist fixture");

    let info = session.debug_state();
    assert_eq!(info.tracked, 3);
    assert_eq!(info.pending_new, 3);
    assert!(!info.in_transaction);
    assert!(info.entities.iter().all(|e| e.state == EntityState::Managed));

    let json = info.to_json().unwrap();
    assert!(json.contains("SOME_PARENT"));
}

const TEAM_ASSOCIATIONS: &[AssociationInfo] = &[AssociationInfo::new(
    "members",
    "player",
    AssociationKind::OneToMany,
)
.join_columns(&[JoinColumn::new("team_id", "id")])
.cascade(CascadeType::PERSIST)];

/// Teams own `player.team_id` through a collection without orphan removal.
fn team_session() -> (Session<MemoryStore>, MemoryStore) {
    let registry = MappingRegistry::builder()
        .register(EntityMapping::new("team", "team", KeyShape::simple("id")).associations(TEAM_ASSOCIATIONS))
        .register(EntityMapping::new("player", "player", KeyShape::simple("id")))
        .build()
        .expect("team mapping is valid");
    let session = SessionBuilder::new(registry)
        .build_memory()
        .expect("schema derives from the mapping");
    let store = session.store().clone();
    (session, store)
}

fn player(id: &str) -> Entity {
    Entity::new("player").with_key(KeyDraft::simple(id))
}

#[test]
fn links_are_cleared_before_their_owner_is_deleted() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = team_session();

    rt.block_on(async {
        let team = Entity::new("team")
            .with_key(KeyDraft::simple("T"))
            .with_member("members", player("P1"));
        session.persist(&team).expect("persist team");
        unwrap_outcome(session.commit(&cx).await);
        store.clear_statements();

        let mut team = session.get("team", &EntityKey::simple("T")).expect("team is managed");
        team.collection_mut("members").clear();
        session.persist(&team).expect("synchronize team");
        session.remove_key("team", &EntityKey::simple("T")).expect("remove team");
        unwrap_outcome(session.commit(&cx).await);

        assert_eq!(session.state_of("player", &EntityKey::simple("P1")), EntityState::Managed);
    });

    assert_eq!(
        shape(&store.statements()),
        vec![("UPDATE", "player"), ("DELETE", "team")]
    );
    assert_eq!(store.row_count("team"), 0);
    let players = store.rows("player").unwrap();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].get_by_name("team_id"), Some(&Value::Null));
}

#[test]
fn member_moved_to_a_new_owner_is_repointed_after_insert() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (mut session, store) = team_session();

    rt.block_on(async {
        let team = Entity::new("team")
            .with_key(KeyDraft::simple("T"))
            .with_member("members", player("P1"));
        session.persist(&team).expect("persist team");
        unwrap_outcome(session.commit(&cx).await);
        store.clear_statements();

        let mut old = session.get("team", &EntityKey::simple("T")).expect("team is managed");
        let moved = old
            .collection_mut("members")
            .remove_key(&EntityKey::simple("P1"))
            .expect("P1 is a member");
        session.persist(&old).expect("synchronize old team");
        let new = Entity::new("team")
            .with_key(KeyDraft::simple("U"))
            .with_member("members", moved);
        session.persist(&new).expect("persist new team");
        session.remove_key("team", &EntityKey::simple("T")).expect("remove old team");
        unwrap_outcome(session.commit(&cx).await);
    });

    assert_eq!(
        shape(&store.statements()),
        vec![("INSERT", "team"), ("UPDATE", "player"), ("DELETE", "team")]
    );
    let players = store.rows("player").unwrap();
    assert_eq!(players[0].get_by_name("team_id"), Some(&Value::from("U")));
}
