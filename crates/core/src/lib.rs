pub mod cache;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod http;
pub mod judge;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod rus;
pub mod session;
pub mod similarity;
pub mod visualization;

pub use cache::{CacheStore, DocumentCache, JsonFileCacheStore, MemoryCacheStore};
pub use chunking::{normalize_whitespace, split_document};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingProvider, EmbeddingRegistry, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS, LOCAL_NGRAM_MODEL,
};
pub use error::{EvalError, PipelineError};
pub use extractor::{
    discover_documents, ExtensionExtractor, ExtractedText, LopdfExtractor, PlainTextExtractor,
    TextExtractor, SUPPORTED_EXTENSIONS,
};
pub use generation::{
    BackendRegistry, GeminiBackend, JudgeReply, LlmBackend, LlmRelevanceJudge, OpenAiChatBackend,
    Prompt, RelevanceEntry, RelevanceJudge, GEMINI_DEFAULT_MODEL, OPENAI_DEFAULT_MODEL,
};
pub use http::HttpProviderConfig;
pub use judge::{evaluate_session, CrossConfigJudge, JudgeVerdict, LlmCrossConfigJudge};
pub use locks::KeyedLocks;
pub use models::{
    ArtifactRef, Chunk, ChunkSizes, ChunkingStrategy, Configuration, Document, DocumentFingerprint,
    EvalOptions, FailurePolicy, LlmResponse, ProcessedDocument, ProjectionTechnique, Question,
    RelevanceWarning, ResponseStatus, RusMetrics, Session, SimilarityMetric, Stage, Triple,
};
pub use orchestrator::{PipelineOrchestrator, RunReport, RunRequest};
pub use retry::{CallContext, RetryPolicy};
pub use session::{
    FileSessionRepository, InMemorySessionRepository, SessionRepository, SessionStore,
};
pub use similarity::RankedChunk;
pub use visualization::{ProjectionRequest, Projector, ScatterProjector};
