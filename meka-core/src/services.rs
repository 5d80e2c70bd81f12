//! Shared service handles, built once per process and injected into stages.

use crate::brain::Brain;
use crate::checkpoint::{CheckpointStore, create_checkpoint_store};
use crate::config::{MekaConfig, resolve_path};
use crate::corpus::{CorpusSupplier, DirectoryCorpus};
use crate::embeddings::create_embedder;
use crate::error::MekaError;
use crate::lexical::CachedLexicalIndex;
use crate::providers::create_provider;
use crate::reranker::{RelevanceReranker, create_scorer};
use crate::retriever::HybridRetriever;
use crate::runs::RunRegistry;
use crate::vector_store::SqliteVectorStore;
use crate::web::{TavilySearch, WebSearch};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct Services {
    pub brain: Arc<Brain>,
    pub retriever: Arc<HybridRetriever>,
    pub reranker: Arc<RelevanceReranker>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub stage_timeout: Option<Duration>,
    pub max_finished_runs: usize,
}

impl Services {
    pub fn new(
        brain: Arc<Brain>,
        retriever: Arc<HybridRetriever>,
        reranker: Arc<RelevanceReranker>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            brain,
            retriever,
            reranker,
            checkpoints,
            stage_timeout: None,
            max_finished_runs: RunRegistry::DEFAULT_RETENTION,
        }
    }

    /// Build every handle from configuration. Relative paths resolve against
    /// `workspace`. A missing LLM credential fails here, before any run.
    pub async fn from_config(config: &MekaConfig, workspace: &Path) -> Result<Self, MekaError> {
        for warning in config.validate() {
            tracing::warn!("{}", warning);
        }

        let provider = create_provider(&config.llm)?;
        let brain = Arc::new(Brain::new(provider, &config.llm));

        let corpus: Arc<dyn CorpusSupplier> = Arc::new(DirectoryCorpus::from_config(
            &config.corpus,
            resolve_path(workspace, &config.corpus.path),
        ));

        let embedder = create_embedder(&config.embedding);
        let index_path = resolve_path(workspace, &config.retrieval.index_path);
        let vector = Arc::new(
            SqliteVectorStore::open(&index_path, embedder)?
                .with_batch_size(config.embedding.batch_size),
        );
        if let Some(indexed) = vector.indexed_with().await?
            && indexed != vector.embedder_id()
        {
            tracing::warn!(
                indexed = %indexed,
                current = %vector.embedder_id(),
                "Vector index was built with a different embedder; run `meka resync`"
            );
        }

        let lexical = Arc::new(CachedLexicalIndex::new(Arc::clone(&corpus)));
        let web = TavilySearch::from_config(&config.web).map(|w| Arc::new(w) as Arc<dyn WebSearch>);

        let retriever = Arc::new(HybridRetriever::new(
            vector,
            lexical,
            web,
            corpus,
            config.retrieval.clone(),
        ));

        let reranker = Arc::new(RelevanceReranker::new(
            create_scorer(&config.reranker),
            config.reranker.top_k,
        ));

        let mut checkpoint_config = config.checkpoint.clone();
        checkpoint_config.path = resolve_path(workspace, &checkpoint_config.path);
        let checkpoints = create_checkpoint_store(&checkpoint_config);

        tracing::info!(
            model = %brain.model_name(),
            reranker = %config.reranker.provider,
            web = retriever.web_available(),
            index = %index_path.display(),
            "Services initialized"
        );

        Ok(Self {
            brain,
            retriever,
            reranker,
            checkpoints,
            stage_timeout: config.pipeline.stage_timeout_secs.map(Duration::from_secs),
            max_finished_runs: config.pipeline.max_finished_runs,
        })
    }
}
