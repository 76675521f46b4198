mod common;

use common::{embed_text, ScriptedOracle, TestEngine, DIM};
use memoire_core::{EngineError, MetadataStore, VectorIndex};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

fn engine() -> TestEngine {
    TestEngine::new(ScriptedOracle::file_under("general"))
}

#[test]
fn store_fragment_writes_row_vector_and_both_membership_directions() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let finance = engine
        .service
        .create_context(project.id, "Finance", "money")
        .unwrap()
        .context;

    let fragment = engine
        .service
        .store_fragment(project.id, "  Q3 budget draft  ", BTreeSet::from([finance.id]))
        .unwrap();

    assert_eq!(fragment.content, "Q3 budget draft");
    assert_eq!(fragment.source, "user");
    let context = engine.metadata.get_context(finance.id).unwrap().unwrap();
    assert_eq!(context.member_ids, BTreeSet::from([fragment.id]));
    assert_eq!(engine.index.ids(project.id).unwrap(), vec![fragment.id]);
    engine.assert_consistent(project.id);
}

#[test]
fn create_context_reuses_label_case_insensitively() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();

    let first = engine.service.create_context(project.id, "Finance", "").unwrap();
    let second = engine
        .service
        .create_context(project.id, "  FINANCE ", "other")
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.context.id, second.context.id);
    assert_eq!(engine.service.list_contexts(project.id).unwrap().len(), 1);
}

#[test]
fn failed_vector_upsert_removes_metadata_row() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let context = engine
        .service
        .create_context(project.id, "Finance", "")
        .unwrap()
        .context;
    engine.index.fail_upsert.store(true, Ordering::SeqCst);

    let err = engine
        .service
        .store_fragment(project.id, "Q3 budget", BTreeSet::from([context.id]))
        .unwrap_err();

    assert!(matches!(err, EngineError::IndexUnavailable(_)), "{err:?}");
    assert!(engine.metadata.list_fragments(project.id, None).unwrap().is_empty());
    let context = engine.metadata.get_context(context.id).unwrap().unwrap();
    assert!(context.member_ids.is_empty());
    engine.assert_consistent(project.id);
}

#[test]
fn failed_vector_delete_restores_memberships() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let a = engine.service.create_context(project.id, "A", "").unwrap().context;
    let b = engine.service.create_context(project.id, "B", "").unwrap().context;
    let fragment = engine
        .service
        .store_fragment(project.id, "shared note", BTreeSet::from([a.id, b.id]))
        .unwrap();
    engine.index.fail_delete.store(true, Ordering::SeqCst);

    let err = engine.service.delete_fragment(fragment.id).unwrap_err();

    assert!(matches!(err, EngineError::IndexUnavailable(_)), "{err:?}");
    let stored = engine.metadata.get_fragment(fragment.id).unwrap().unwrap();
    assert_eq!(stored.context_ids, BTreeSet::from([a.id, b.id]));
    engine.assert_consistent(project.id);
}

#[test]
fn deleting_twice_returns_not_found_and_leaves_state_unchanged() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let context = engine.service.create_context(project.id, "Ops", "").unwrap().context;
    let keep = engine
        .service
        .store_fragment(project.id, "keep me", BTreeSet::from([context.id]))
        .unwrap();
    let drop = engine
        .service
        .store_fragment(project.id, "drop me", BTreeSet::from([context.id]))
        .unwrap();

    let deleted = engine.service.delete_fragment(drop.id).unwrap();
    assert_eq!(deleted.id, drop.id);
    let fragments_after_first = engine.metadata.list_fragments(project.id, None).unwrap();
    let contexts_after_first = engine.metadata.list_contexts(project.id).unwrap();

    let err = engine.service.delete_fragment(drop.id).unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert_eq!(
        engine.metadata.list_fragments(project.id, None).unwrap(),
        fragments_after_first
    );
    assert_eq!(
        engine.metadata.list_contexts(project.id).unwrap(),
        contexts_after_first
    );
    assert_eq!(contexts_after_first[0].member_ids, BTreeSet::from([keep.id]));
    engine.assert_consistent(project.id);
}

#[test]
fn merge_covers_union_of_source_contexts_and_deletes_sources() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let a = engine.service.create_context(project.id, "A", "").unwrap().context;
    let b = engine.service.create_context(project.id, "B", "").unwrap().context;
    let c = engine.service.create_context(project.id, "C", "").unwrap().context;
    let first = engine
        .service
        .store_fragment(project.id, "first half", BTreeSet::from([a.id]))
        .unwrap();
    let second = engine
        .service
        .store_fragment(project.id, "second half", BTreeSet::from([b.id, c.id]))
        .unwrap();

    let outcome = engine
        .service
        .merge_fragments(vec![first.id, second.id], "both halves", BTreeSet::new())
        .unwrap();

    assert_eq!(outcome.merged.context_ids, BTreeSet::from([a.id, b.id, c.id]));
    assert_eq!(outcome.merged.source, "merge");
    assert_eq!(outcome.deleted_source_ids, vec![first.id, second.id]);
    assert!(outcome.missing_source_ids.is_empty());
    assert!(engine.metadata.get_fragment(first.id).unwrap().is_none());
    assert!(engine.metadata.get_fragment(second.id).unwrap().is_none());
    engine.assert_consistent(project.id);
}

#[test]
fn merge_with_vanished_source_is_last_writer_wins() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let a = engine.service.create_context(project.id, "A", "").unwrap().context;
    let x = engine
        .service
        .store_fragment(project.id, "x", BTreeSet::from([a.id]))
        .unwrap();
    let y = engine
        .service
        .store_fragment(project.id, "y", BTreeSet::from([a.id]))
        .unwrap();
    let z = engine
        .service
        .store_fragment(project.id, "z", BTreeSet::from([a.id]))
        .unwrap();

    let winner = engine
        .service
        .merge_fragments(vec![x.id, y.id], "x and y", BTreeSet::new())
        .unwrap();
    let loser = engine
        .service
        .merge_fragments(vec![x.id, z.id], "x and z", BTreeSet::new())
        .unwrap();

    assert_eq!(winner.deleted_source_ids, vec![x.id, y.id]);
    assert_eq!(loser.deleted_source_ids, vec![z.id]);
    assert_eq!(loser.missing_source_ids, vec![x.id]);

    let err = engine
        .service
        .merge_fragments(vec![x.id, y.id], "again", BTreeSet::new())
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    engine.assert_consistent(project.id);
}

#[test]
fn merge_rejects_sources_from_different_projects() {
    let engine = engine();
    let first = engine.service.create_project("One", "").unwrap();
    let second = engine.service.create_project("Two", "").unwrap();
    let a = engine
        .service
        .store_fragment(first.id, "alpha", BTreeSet::new())
        .unwrap();
    let b = engine
        .service
        .store_fragment(second.id, "beta", BTreeSet::new())
        .unwrap();

    let err = engine
        .service
        .merge_fragments(vec![a.id, b.id], "mixed", BTreeSet::new())
        .unwrap_err();

    assert!(matches!(err, EngineError::ConstraintViolation(_)), "{err:?}");
    assert!(engine.metadata.get_fragment(a.id).unwrap().is_some());
    assert!(engine.metadata.get_fragment(b.id).unwrap().is_some());
}

#[test]
fn delete_context_cascades_to_members_and_their_other_contexts() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let target = engine.service.create_context(project.id, "Target", "").unwrap().context;
    let other = engine.service.create_context(project.id, "Other", "").unwrap().context;
    let f1 = engine
        .service
        .store_fragment(project.id, "first", BTreeSet::from([target.id, other.id]))
        .unwrap();
    let f2 = engine
        .service
        .store_fragment(project.id, "second", BTreeSet::from([target.id]))
        .unwrap();
    let survivor = engine
        .service
        .store_fragment(project.id, "survivor", BTreeSet::from([other.id]))
        .unwrap();

    let deletion = engine.service.delete_context(target.id).unwrap();

    let deleted: BTreeSet<_> = deletion.deleted_fragment_ids.into_iter().collect();
    assert_eq!(deleted, BTreeSet::from([f1.id, f2.id]));
    assert!(engine.metadata.get_context(target.id).unwrap().is_none());
    let other = engine.metadata.get_context(other.id).unwrap().unwrap();
    assert_eq!(other.member_ids, BTreeSet::from([survivor.id]));
    assert_eq!(engine.index.ids(project.id).unwrap(), vec![survivor.id]);
    engine.assert_consistent(project.id);
}

#[test]
fn membership_to_foreign_context_is_a_constraint_violation() {
    let engine = engine();
    let first = engine.service.create_project("One", "").unwrap();
    let second = engine.service.create_project("Two", "").unwrap();
    let foreign = engine.service.create_context(second.id, "Foreign", "").unwrap().context;
    let fragment = engine
        .service
        .store_fragment(first.id, "mine", BTreeSet::new())
        .unwrap();

    let err = engine
        .service
        .add_to_context(fragment.id, foreign.id)
        .unwrap_err();
    assert!(matches!(err, EngineError::ConstraintViolation(_)), "{err:?}");

    let err = engine
        .service
        .store_fragment(first.id, "cross", BTreeSet::from([foreign.id]))
        .unwrap_err();
    assert!(matches!(err, EngineError::ConstraintViolation(_)), "{err:?}");
    assert_eq!(engine.index.ids(first.id).unwrap().len(), 1);
}

#[test]
fn add_and_remove_membership_report_changes() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let context = engine.service.create_context(project.id, "Ops", "").unwrap().context;
    let fragment = engine
        .service
        .store_fragment(project.id, "note", BTreeSet::new())
        .unwrap();

    assert!(engine.service.add_to_context(fragment.id, context.id).unwrap());
    assert!(!engine.service.add_to_context(fragment.id, context.id).unwrap());
    assert_eq!(
        engine
            .service
            .contexts_for_fragment(fragment.id)
            .unwrap()
            .into_iter()
            .map(|context| context.id)
            .collect::<Vec<_>>(),
        vec![context.id]
    );
    assert!(engine.service.remove_from_context(fragment.id, context.id).unwrap());
    assert!(!engine.service.remove_from_context(fragment.id, context.id).unwrap());
    engine.assert_consistent(project.id);
}

#[test]
fn similar_fragments_skips_vectors_without_metadata_row() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let fragment = engine
        .service
        .store_fragment(project.id, "budget review", BTreeSet::new())
        .unwrap();
    let orphan = uuid::Uuid::new_v4();
    engine
        .index
        .upsert(project.id, orphan, &embed_text("budget review", DIM))
        .unwrap();

    let hits = engine
        .service
        .coordinator()
        .similar_fragments(&[project.id], &embed_text("budget review", DIM), 10, 0.0)
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].fragment.id, fragment.id);
}

#[test]
fn orphan_vectors_never_take_a_result_slot() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let fragment = engine
        .service
        .store_fragment(project.id, "budget review", BTreeSet::new())
        .unwrap();
    let query = embed_text("budget review", DIM);
    for n in 0..5u128 {
        // Low ids win the score tie against the real fragment.
        engine
            .index
            .upsert(project.id, uuid::Uuid::from_u128(n), &query)
            .unwrap();
    }

    let hits = engine
        .service
        .coordinator()
        .similar_fragments(&[project.id], &query, 1, 0.95)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].fragment.id, fragment.id);

    let none = engine
        .service
        .coordinator()
        .similar_fragments(&[project.id], &embed_text("plumbing", DIM), 3, 0.95)
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn membership_added_during_merge_is_never_lost() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let a = engine.service.create_context(project.id, "A", "").unwrap().context;
    let b = engine.service.create_context(project.id, "B", "").unwrap().context;

    for round in 0..40 {
        let x = engine
            .service
            .store_fragment(project.id, &format!("x {round}"), BTreeSet::from([a.id]))
            .unwrap();
        let y = engine
            .service
            .store_fragment(project.id, &format!("y {round}"), BTreeSet::from([a.id]))
            .unwrap();
        let barrier = std::sync::Barrier::new(2);

        let (added, merged) = std::thread::scope(|scope| {
            let adder = scope.spawn(|| {
                barrier.wait();
                engine.service.add_to_context(x.id, b.id)
            });
            let merger = scope.spawn(|| {
                barrier.wait();
                engine
                    .service
                    .merge_fragments(vec![x.id, y.id], &format!("x+y {round}"), BTreeSet::new())
            });
            (adder.join().unwrap(), merger.join().unwrap().unwrap())
        });

        match added {
            Ok(true) => assert!(
                merged.merged.context_ids.contains(&b.id),
                "round {round}: edge to B acknowledged but missing from merge"
            ),
            Ok(false) => panic!("round {round}: x was never in B"),
            Err(err) => assert!(
                matches!(err, EngineError::ConstraintViolation(_)),
                "round {round}: {err:?}"
            ),
        }
        engine.assert_consistent(project.id);
    }
}

#[test]
fn non_finite_vector_is_invalid_input() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();
    let mut vector = embed_text("budget", DIM);
    vector[0] = f32::NAN;

    let err = engine
        .service
        .coordinator()
        .create_fragment(memoire_core::service::coordinator::FragmentDraft {
            project_id: project.id,
            content: "budget".to_string(),
            source: "user".to_string(),
            vector,
            context_ids: BTreeSet::new(),
        })
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidInput(_)), "{err:?}");
    assert!(engine.metadata.list_fragments(project.id, None).unwrap().is_empty());
}

#[test]
fn wrong_vector_dimension_is_invalid_input() {
    let engine = engine();
    let project = engine.service.create_project("Work", "").unwrap();

    let err = engine
        .service
        .coordinator()
        .create_fragment(memoire_core::service::coordinator::FragmentDraft {
            project_id: project.id,
            content: "short".to_string(),
            source: "user".to_string(),
            vector: vec![1.0, 0.0],
            context_ids: BTreeSet::new(),
        })
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidInput(_)), "{err:?}");
    assert!(engine.metadata.list_fragments(project.id, None).unwrap().is_empty());
}
