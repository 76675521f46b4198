//! Shared stubs and fixtures for engine integration tests.

#![allow(dead_code)]

use memoire_core::index::IndexResult;
use memoire_core::oracle::{CurationRequest, SynthesisRequest};
use memoire_core::{
    Collaborators, DecisionOracle, EmbeddingError, EmbeddingGenerator, EngineConfig,
    FragmentId, InMemoryVectorIndex, IndexError, IndexHit, MemoryService, MetadataStore,
    OracleError, ProjectId, SqliteMetadataStore, SynthesisOracle, VectorIndex,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DIM: usize = 128;

/// Deterministic bag-of-words embedder.
///
/// Lowercased alphanumeric tokens are hashed (FNV-1a) into buckets and the
/// result is L2-normalized, so texts with the same words embed identically.
pub struct HashEmbedder {
    dimension: usize,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
        }
    }
}

impl EmbeddingGenerator for HashEmbedder {
    fn model(&self) -> &str {
        "hash-bow"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(embed_text(text, self.dimension))
    }
}

pub fn embed_text(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0_f32; dimension];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
    {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.to_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        vector[(hash % dimension as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

type DecideFn = dyn Fn(&CurationRequest) -> Result<String, OracleError> + Send + Sync;

/// Decision oracle driven by a closure; records every request.
pub struct ScriptedOracle {
    decide: Box<DecideFn>,
    pub requests: Mutex<Vec<CurationRequest>>,
}

impl ScriptedOracle {
    pub fn new(
        decide: impl Fn(&CurationRequest) -> Result<String, OracleError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            decide: Box::new(decide),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Files the new content verbatim under `label`.
    pub fn file_under(label: &'static str) -> Self {
        Self::new(move |request| {
            Ok(serde_json::json!({
                "fragments_to_create": [
                    { "content": request.new_content, "contexts": [label] }
                ],
                "ids_to_delete": []
            })
            .to_string())
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<CurationRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl DecisionOracle for ScriptedOracle {
    fn decide(&self, request: &CurationRequest) -> Result<String, OracleError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.decide)(request)
    }
}

/// Synthesizer that echoes the query and fragment count.
#[derive(Default)]
pub struct EchoSynthesizer {
    pub requests: Mutex<Vec<SynthesisRequest>>,
    pub fail: AtomicBool,
}

impl SynthesisOracle for EchoSynthesizer {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<String, OracleError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(OracleError::new("synthesizer offline"));
        }
        Ok(format!(
            "answer to `{}` from {} fragments",
            request.query,
            request.fragments.len()
        ))
    }
}

/// In-memory index with switchable failures.
pub struct FlakyIndex {
    inner: InMemoryVectorIndex,
    pub fail_upsert: AtomicBool,
    pub fail_delete: AtomicBool,
    /// Full id listings served so far.
    pub ids_calls: AtomicUsize,
    /// Upserts allowed before `fail_upsert` kicks in on its own.
    upsert_budget: Mutex<Option<usize>>,
}

impl FlakyIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: InMemoryVectorIndex::new(dimension),
            fail_upsert: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            ids_calls: AtomicUsize::new(0),
            upsert_budget: Mutex::new(None),
        }
    }

    /// Lets the next `count` upserts succeed and fails every later one.
    pub fn fail_upserts_after(&self, count: usize) {
        *self.upsert_budget.lock().unwrap() = Some(count);
    }

    /// Clears every injected failure.
    pub fn heal(&self) {
        self.fail_upsert.store(false, Ordering::SeqCst);
        self.fail_delete.store(false, Ordering::SeqCst);
        *self.upsert_budget.lock().unwrap() = None;
    }

    fn upsert_allowed(&self) -> bool {
        if self.fail_upsert.load(Ordering::SeqCst) {
            return false;
        }
        let mut budget = self.upsert_budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => true,
        }
    }
}

fn outage(project_id: ProjectId) -> IndexError {
    IndexError::Unavailable {
        project_id: Some(project_id),
        message: "injected outage".to_string(),
    }
}

impl VectorIndex for FlakyIndex {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn upsert(
        &self,
        project_id: ProjectId,
        fragment_id: FragmentId,
        vector: &[f32],
    ) -> IndexResult<()> {
        if !self.upsert_allowed() {
            return Err(outage(project_id));
        }
        self.inner.upsert(project_id, fragment_id, vector)
    }

    fn delete(&self, project_id: ProjectId, fragment_id: FragmentId) -> IndexResult<bool> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(outage(project_id));
        }
        self.inner.delete(project_id, fragment_id)
    }

    fn search(
        &self,
        project_id: ProjectId,
        query: &[f32],
        k: usize,
    ) -> IndexResult<Vec<IndexHit>> {
        self.inner.search(project_id, query, k)
    }

    fn contains(&self, project_id: ProjectId, fragment_id: FragmentId) -> IndexResult<bool> {
        self.inner.contains(project_id, fragment_id)
    }

    fn ids(&self, project_id: ProjectId) -> IndexResult<Vec<FragmentId>> {
        self.ids_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.ids(project_id)
    }

    fn drop_project(&self, project_id: ProjectId) -> IndexResult<usize> {
        self.inner.drop_project(project_id)
    }
}

/// A fully wired engine over in-memory stores and stub collaborators.
pub struct TestEngine {
    pub service: MemoryService,
    pub metadata: Arc<SqliteMetadataStore>,
    pub index: Arc<FlakyIndex>,
    pub embedder: Arc<HashEmbedder>,
    pub oracle: Arc<ScriptedOracle>,
    pub synthesizer: Arc<EchoSynthesizer>,
}

impl TestEngine {
    pub fn new(oracle: ScriptedOracle) -> Self {
        Self::with_config(oracle, test_config())
    }

    pub fn with_config(oracle: ScriptedOracle, config: EngineConfig) -> Self {
        let metadata = Arc::new(SqliteMetadataStore::open_in_memory().unwrap());
        let index = Arc::new(FlakyIndex::new(DIM));
        let embedder = Arc::new(HashEmbedder::new(DIM));
        let oracle = Arc::new(oracle);
        let synthesizer = Arc::new(EchoSynthesizer::default());
        let service = MemoryService::new(
            metadata.clone(),
            index.clone(),
            Collaborators {
                embedder: embedder.clone(),
                decision_oracle: oracle.clone(),
                synthesizer: synthesizer.clone(),
            },
            config,
        )
        .unwrap();
        Self {
            service,
            metadata,
            index,
            embedder,
            oracle,
            synthesizer,
        }
    }

    /// Asserts both graph directions agree, nothing dangles, and every
    /// fragment has exactly one vector.
    pub fn assert_consistent(&self, project_id: ProjectId) {
        self.assert_graph_consistent(project_id);
        let mut fragment_ids = self.metadata.list_fragment_ids(project_id).unwrap();
        fragment_ids.sort();
        let mut indexed = self.index.ids(project_id).unwrap();
        indexed.sort();
        assert_eq!(fragment_ids, indexed, "metadata and index disagree");
    }

    /// Like [`Self::assert_consistent`], but tolerates orphan vectors, which
    /// only the repair sweep removes.
    pub fn assert_graph_consistent(&self, project_id: ProjectId) {
        let fragments = self.metadata.list_fragments(project_id, None).unwrap();
        let contexts = self.metadata.list_contexts(project_id).unwrap();

        for fragment in &fragments {
            for context_id in &fragment.context_ids {
                let context = contexts
                    .iter()
                    .find(|context| context.id == *context_id)
                    .unwrap_or_else(|| panic!("fragment {} cites missing context", fragment.id));
                assert!(context.member_ids.contains(&fragment.id));
            }
        }
        for context in &contexts {
            for member_id in &context.member_ids {
                let fragment = fragments
                    .iter()
                    .find(|fragment| fragment.id == *member_id)
                    .unwrap_or_else(|| panic!("context {} lists missing fragment", context.id));
                assert!(fragment.context_ids.contains(&context.id));
            }
        }

        for fragment in &fragments {
            assert!(
                self.index.contains(project_id, fragment.id).unwrap(),
                "fragment {} has no vector",
                fragment.id
            );
        }
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        embedding_dimension: DIM,
        ..EngineConfig::default()
    }
}
