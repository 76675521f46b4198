mod common;

use common::{embed_text, ScriptedOracle, TestEngine, DIM};
use memoire_core::{EngineError, MetadataStore, OracleError, VectorIndex};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

const MEETING_NOTES: &str = "Meeting notes: discuss Q3 budget";

#[test]
fn first_ingestion_files_fragment_under_new_context() {
    let engine = TestEngine::new(ScriptedOracle::file_under("Finance"));
    let project = engine.service.create_project("P", "").unwrap();

    let report = engine.service.remember(project.id, MEETING_NOTES).unwrap();

    let request = engine.oracle.last_request().unwrap();
    assert_eq!(request.new_content, MEETING_NOTES);
    assert!(request.candidate_fragments.is_empty());
    assert!(request.candidate_contexts.is_empty());

    let contexts = engine.service.list_contexts(project.id).unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].label, "Finance");
    assert_eq!(contexts[0].member_ids.len(), 1);
    assert_eq!(report.created_context_ids, vec![contexts[0].id]);

    let members = engine.service.fragments_by_context(contexts[0].id).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].content, MEETING_NOTES);
    assert_eq!(members[0].source, "curated_ingestion");
    assert_eq!(report.created_fragment_ids, vec![members[0].id]);
    engine.assert_consistent(project.id);
}

#[test]
fn near_duplicate_ingestion_collapses_into_existing_fragment() {
    let engine = TestEngine::new(ScriptedOracle::file_under("Finance"));
    let project = engine.service.create_project("P", "").unwrap();
    let first = engine.service.remember(project.id, MEETING_NOTES).unwrap();

    let second = engine
        .service
        .remember(project.id, "meeting notes - discuss Q3 budget")
        .unwrap();

    let request = engine.oracle.last_request().unwrap();
    assert_eq!(request.candidate_fragments.len(), 1);
    assert_eq!(request.candidate_contexts.len(), 1);
    assert_eq!(request.candidate_contexts[0].label, "Finance");

    assert!(second.created_fragment_ids.is_empty());
    assert!(second.created_context_ids.is_empty());
    assert_eq!(second.updated_fragment_ids, first.created_fragment_ids);
    assert_eq!(second.collapsed_proposals, 1);

    let contexts = engine.service.list_contexts(project.id).unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].member_ids.len(), 1);
    assert_eq!(engine.service.list_fragments(project.id, None).unwrap().len(), 1);
    engine.assert_consistent(project.id);
}

#[test]
fn orphan_vector_does_not_hide_existing_duplicate() {
    let engine = TestEngine::new(ScriptedOracle::file_under("Finance"));
    let project = engine.service.create_project("P", "").unwrap();
    let first = engine.service.remember(project.id, MEETING_NOTES).unwrap();
    // Ties at score 1.0 rank by ascending id, so the nil id comes first.
    engine
        .index
        .upsert(project.id, uuid::Uuid::nil(), &embed_text(MEETING_NOTES, DIM))
        .unwrap();

    let second = engine.service.remember(project.id, MEETING_NOTES).unwrap();

    assert!(second.created_fragment_ids.is_empty());
    assert_eq!(second.updated_fragment_ids, first.created_fragment_ids);
    let contexts = engine.service.list_contexts(project.id).unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].member_ids.len(), 1);
    assert_eq!(engine.service.list_fragments(project.id, None).unwrap().len(), 1);

    assert_eq!(engine.service.run_repair().unwrap().orphan_vectors_removed, 1);
    engine.assert_consistent(project.id);
}

#[test]
fn duplicate_proposals_within_one_decision_become_one_fragment() {
    let engine = TestEngine::new(ScriptedOracle::new(|_| {
        Ok(json!({
            "fragments_to_create": [
                { "content": "Invoice due Friday", "contexts": ["Billing"] },
                { "content": "invoice due friday!", "contexts": ["Deadlines"] }
            ],
            "ids_to_delete": []
        })
        .to_string())
    }));
    let project = engine.service.create_project("P", "").unwrap();

    let report = engine.service.remember(project.id, "invoice stuff").unwrap();

    assert_eq!(report.created_fragment_ids.len(), 1);
    assert_eq!(report.created_context_ids.len(), 2);
    assert_eq!(report.collapsed_proposals, 1);
    let fragment = engine
        .service
        .get_fragment(report.created_fragment_ids[0])
        .unwrap();
    assert_eq!(fragment.content, "Invoice due Friday");
    assert_eq!(fragment.context_ids.len(), 2);
    engine.assert_consistent(project.id);
}

#[test]
fn decision_can_replace_candidates_with_a_rewritten_fragment() {
    let engine = TestEngine::new(ScriptedOracle::new(|request| {
        let ids: Vec<String> = request
            .candidate_fragments
            .iter()
            .map(|candidate| candidate.id.to_string())
            .collect();
        let contexts: Vec<String> = request
            .candidate_contexts
            .iter()
            .map(|context| context.id.to_string())
            .collect();
        Ok(json!({
            "fragments_to_create": [
                { "content": format!("{} (revised)", request.new_content), "contexts": contexts }
            ],
            "ids_to_delete": ids
        })
        .to_string())
    }));
    let project = engine.service.create_project("P", "").unwrap();
    let finance = engine
        .service
        .create_context(project.id, "Finance", "")
        .unwrap()
        .context;
    let old = engine
        .service
        .store_fragment(project.id, "budget review Q3", BTreeSet::from([finance.id]))
        .unwrap();

    let report = engine
        .service
        .remember(project.id, "budget review Q3 moved to Friday")
        .unwrap();

    assert_eq!(report.deleted_fragment_ids, vec![old.id]);
    assert_eq!(report.created_fragment_ids.len(), 1);
    let fragments = engine.service.list_fragments(project.id, None).unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].content, "budget review Q3 moved to Friday (revised)");
    assert_eq!(fragments[0].context_ids, BTreeSet::from([finance.id]));
    engine.assert_consistent(project.id);
}

#[test]
fn proposal_without_contexts_lands_in_general_context() {
    let engine = TestEngine::new(ScriptedOracle::new(|request| {
        Ok(json!({
            "fragments_to_create": [{ "content": request.new_content }],
            "ids_to_delete": [],
            "contexts_to_create": [{ "name": "Unused", "description": "never cited" }]
        })
        .to_string())
    }));
    let project = engine.service.create_project("P", "").unwrap();

    engine.service.remember(project.id, "loose thought").unwrap();

    let contexts = engine.service.list_contexts(project.id).unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].label, "general");
    assert_eq!(contexts[0].member_ids.len(), 1);
}

#[test]
fn label_reference_reuses_existing_context_and_takes_declared_description() {
    let engine = TestEngine::new(ScriptedOracle::new(|_| {
        Ok(json!({
            "fragments_to_create": [
                { "content": "renew passport", "contexts": ["  TRAVEL  ", "Errands"] }
            ],
            "ids_to_delete": [],
            "contexts_to_create": [{ "name": "errands", "description": "small chores" }]
        })
        .to_string())
    }));
    let project = engine.service.create_project("P", "").unwrap();
    let travel = engine
        .service
        .create_context(project.id, "Travel", "")
        .unwrap()
        .context;

    let report = engine.service.remember(project.id, "passport").unwrap();

    assert_eq!(report.created_context_ids.len(), 1);
    let errands = engine
        .service
        .find_context(project.id, "ERRANDS")
        .unwrap()
        .unwrap();
    assert_eq!(errands.description, "small chores");
    let fragment = engine
        .service
        .get_fragment(report.created_fragment_ids[0])
        .unwrap();
    assert_eq!(fragment.context_ids, BTreeSet::from([travel.id, errands.id]));
}

#[test]
fn malformed_decision_leaves_both_stores_untouched() {
    let engine = TestEngine::new(ScriptedOracle::new(|_| Ok("I think you should".to_string())));
    let project = engine.service.create_project("P", "").unwrap();

    let err = engine.service.remember(project.id, MEETING_NOTES).unwrap_err();

    assert!(matches!(err, EngineError::OracleContractViolation(_)), "{err:?}");
    assert!(engine.service.list_fragments(project.id, None).unwrap().is_empty());
    assert!(engine.service.list_contexts(project.id).unwrap().is_empty());
    assert!(engine.index.ids(project.id).unwrap().is_empty());
}

#[test]
fn decision_citing_unknown_context_id_is_rejected_before_writes() {
    let engine = TestEngine::new(ScriptedOracle::new(|_| {
        Ok(json!({
            "fragments_to_create": [
                { "content": "a", "contexts": ["New Label"] },
                { "content": "b", "contexts": [uuid::Uuid::new_v4().to_string()] }
            ],
            "ids_to_delete": []
        })
        .to_string())
    }));
    let project = engine.service.create_project("P", "").unwrap();

    let err = engine.service.remember(project.id, "x").unwrap_err();

    assert!(matches!(err, EngineError::OracleContractViolation(_)), "{err:?}");
    assert!(engine.service.list_contexts(project.id).unwrap().is_empty());
    assert!(engine.service.list_fragments(project.id, None).unwrap().is_empty());
}

#[test]
fn deleting_foreign_fragment_is_a_contract_violation() {
    let foreign_id = Arc::new(std::sync::Mutex::new(String::new()));
    let captured = Arc::clone(&foreign_id);
    let engine = TestEngine::new(ScriptedOracle::new(move |request| {
        Ok(json!({
            "fragments_to_create": [{ "content": request.new_content, "contexts": ["A"] }],
            "ids_to_delete": [captured.lock().unwrap().clone()]
        })
        .to_string())
    }));
    let mine = engine.service.create_project("Mine", "").unwrap();
    let theirs = engine.service.create_project("Theirs", "").unwrap();
    let victim = engine
        .service
        .store_fragment(theirs.id, "their secret", BTreeSet::new())
        .unwrap();
    *foreign_id.lock().unwrap() = victim.id.to_string();

    let err = engine.service.remember(mine.id, "steal").unwrap_err();

    assert!(matches!(err, EngineError::OracleContractViolation(_)), "{err:?}");
    assert!(engine.metadata.get_fragment(victim.id).unwrap().is_some());
    assert!(engine.service.list_fragments(mine.id, None).unwrap().is_empty());
}

#[test]
fn oracle_outage_surfaces_without_writes() {
    let engine = TestEngine::new(ScriptedOracle::new(|_| Err(OracleError::new("timeout"))));
    let project = engine.service.create_project("P", "").unwrap();

    let err = engine.service.remember(project.id, "hello").unwrap_err();

    assert!(matches!(err, EngineError::OracleUnavailable(_)), "{err:?}");
    assert!(engine.service.list_fragments(project.id, None).unwrap().is_empty());
}

#[test]
fn failed_create_undoes_earlier_creates_of_the_same_ingestion() {
    let engine = TestEngine::new(ScriptedOracle::new(|_| {
        Ok(json!({
            "fragments_to_create": [
                { "content": "alpha release checklist", "contexts": ["Ops"] },
                { "content": "rotate database credentials", "contexts": ["Ops"] }
            ],
            "ids_to_delete": []
        })
        .to_string())
    }));
    let project = engine.service.create_project("P", "").unwrap();
    engine.index.fail_upserts_after(1);

    let err = engine.service.remember(project.id, "ops work").unwrap_err();

    assert!(matches!(err, EngineError::IndexUnavailable(_)), "{err:?}");
    assert!(engine.service.list_fragments(project.id, None).unwrap().is_empty());
    assert!(engine.service.list_contexts(project.id).unwrap().is_empty());
    engine.assert_consistent(project.id);
}

#[test]
fn repeated_delete_id_is_applied_once() {
    let engine = TestEngine::new(ScriptedOracle::new(|request| {
        let ids: Vec<String> = request
            .candidate_fragments
            .iter()
            .map(|candidate| candidate.id.to_string())
            .collect();
        Ok(json!({
            "fragments_to_create": [],
            "ids_to_delete": [ids[0].clone(), ids[0].clone()]
        })
        .to_string())
    }));
    let project = engine.service.create_project("P", "").unwrap();
    let old = engine
        .service
        .store_fragment(project.id, "stale reminder", BTreeSet::new())
        .unwrap();

    let report = engine.service.remember(project.id, "stale reminder").unwrap();

    assert_eq!(report.deleted_fragment_ids, vec![old.id]);
    assert!(report.skipped_delete_ids.is_empty());
    assert!(engine.service.list_fragments(project.id, None).unwrap().is_empty());
}

#[test]
fn blank_content_and_unknown_project_are_rejected_before_oracle_call() {
    let engine = TestEngine::new(ScriptedOracle::file_under("Finance"));
    let project = engine.service.create_project("P", "").unwrap();

    let err = engine.service.remember(project.id, "   ").unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)), "{err:?}");

    let err = engine
        .service
        .remember(uuid::Uuid::new_v4(), "hello")
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert_eq!(engine.oracle.request_count(), 0);
}

#[test]
fn concurrent_ingestions_into_one_context_lose_no_memberships() {
    let engine = TestEngine::new(ScriptedOracle::file_under("Shared"));
    let project = engine.service.create_project("P", "").unwrap();
    let service = &engine.service;

    std::thread::scope(|scope| {
        for worker in 0..8 {
            scope.spawn(move || {
                service
                    .remember(
                        project.id,
                        &format!("worker{worker} wrote entry{worker} about topic{worker}"),
                    )
                    .unwrap();
            });
        }
    });

    let contexts = engine.service.list_contexts(project.id).unwrap();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].member_ids.len(), 8);
    assert_eq!(engine.service.list_fragments(project.id, None).unwrap().len(), 8);
    engine.assert_consistent(project.id);
}
