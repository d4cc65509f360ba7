use crate::cache::DocumentCache;
use crate::embeddings::EmbeddingProvider;
use crate::error::{EvalError, PipelineError};
use crate::generation::{validate_relevance, RelevanceJudge};
use crate::locks::KeyedLocks;
use crate::models::{
    ArtifactRef, Chunk, Configuration, Document, EvalOptions, FailurePolicy, LlmResponse,
    ProcessedDocument, Question, ResponseStatus, Session, Stage, Triple,
};
use crate::retry::{CallContext, RetryPolicy};
use crate::rus;
use crate::session::SessionRepository;
use crate::similarity::{self, RankedChunk};
use crate::visualization::{ProjectionRequest, Projector};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: String,
    /// Model id resolved through the generation backend registry.
    pub query_llm: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub responses: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Drives the configuration x document x question matrix for one session.
///
/// Units of work are (configuration, document) pairs. Units run on a bounded
/// pool; the questions of a unit run one after another against that unit's
/// processed document. Results are appended in configuration, document,
/// question order regardless of completion order, and the session is saved
/// as soon as a triple's response can take its place in that order. A failed
/// or cancelled run keeps every response that completed before it stopped.
pub struct PipelineOrchestrator {
    sessions: Arc<dyn SessionRepository>,
    locks: KeyedLocks,
    cache: Arc<DocumentCache>,
    embedder: Arc<dyn EmbeddingProvider>,
    judge: Arc<dyn RelevanceJudge>,
    projector: Option<Arc<dyn Projector>>,
    options: EvalOptions,
}

struct Unit<'a> {
    session_id: &'a str,
    configuration: &'a Configuration,
    document: &'a Document,
    questions: &'a [Question],
    request: &'a RunRequest,
    ctx: &'a CallContext,
}

type StageResult<T> = Result<T, (Stage, EvalError)>;

/// Owns the session while a run is in flight. Responses of unit `n` are held
/// back until units `0..n` have finished, then appended and saved.
struct Recorder {
    sessions: Arc<dyn SessionRepository>,
    session: Session,
    pending: Vec<Vec<LlmResponse>>,
    finished: Vec<bool>,
    cursor: usize,
}

impl Recorder {
    fn new(sessions: Arc<dyn SessionRepository>, session: Session, units: usize) -> Self {
        Self {
            sessions,
            session,
            pending: vec![Vec::new(); units],
            finished: vec![false; units],
            cursor: 0,
        }
    }

    async fn record(&mut self, unit: usize, response: LlmResponse) -> Result<(), EvalError> {
        self.pending[unit].push(response);
        self.flush().await
    }

    async fn finish(&mut self, unit: usize) -> Result<(), EvalError> {
        self.finished[unit] = true;
        self.flush().await
    }

    /// Appends whatever every unit has produced so far, in unit order.
    async fn salvage(&mut self) -> Result<(), EvalError> {
        self.finished.fill(true);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), EvalError> {
        let mut moved = false;
        while self.cursor < self.pending.len() {
            let ready = std::mem::take(&mut self.pending[self.cursor]);
            moved |= !ready.is_empty();
            self.session.responses.extend(ready);
            if !self.finished[self.cursor] {
                break;
            }
            self.cursor += 1;
        }
        if moved {
            self.sessions.save(&self.session).await?;
        }
        Ok(())
    }
}

fn at(stage: Stage) -> impl FnOnce(EvalError) -> (Stage, EvalError) {
    move |error| (stage, error)
}

impl PipelineOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        locks: KeyedLocks,
        cache: Arc<DocumentCache>,
        embedder: Arc<dyn EmbeddingProvider>,
        judge: Arc<dyn RelevanceJudge>,
        options: EvalOptions,
    ) -> Self {
        Self {
            sessions,
            locks,
            cache,
            embedder,
            judge,
            projector: None,
            options,
        }
    }

    pub fn with_projector(mut self, projector: Arc<dyn Projector>) -> Self {
        self.projector = Some(projector);
        self
    }

    pub async fn run(
        &self,
        request: &RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();
        let session_id = request.session_id.as_str();

        let _session_guard = self.locks.acquire(session_id).await;
        info!(session_id, "loading session");
        let mut session = self
            .sessions
            .load(session_id)
            .await
            .map_err(|error| PipelineError::new(Stage::Load, None, error))?;

        for configuration in &session.configurations {
            configuration
                .validate()
                .map_err(|error| PipelineError::new(Stage::Load, None, error))?;
        }

        session.responses.clear();
        session.last_run_at = Some(started_at);
        self.sessions
            .save(&session)
            .await
            .map_err(|error| PipelineError::new(Stage::Record, None, error))?;

        let configurations = session.configurations.clone();
        let documents = session.documents.clone();
        let questions = session.questions.clone();
        if configurations.is_empty() || documents.is_empty() || questions.is_empty() {
            warn!(
                session_id,
                configurations = configurations.len(),
                documents = documents.len(),
                questions = questions.len(),
                "nothing to evaluate"
            );
        }

        let cancel = cancel.child_token();
        let ctx = CallContext::new(RetryPolicy::from_options(&self.options), cancel.clone());
        let (documents, questions, ctx) = (documents.as_slice(), questions.as_slice(), &ctx);
        let units = configurations
            .iter()
            .flat_map(|configuration| {
                documents.iter().map(move |document| Unit {
                    session_id,
                    configuration,
                    document,
                    questions,
                    request,
                    ctx,
                })
            })
            .collect::<Vec<_>>();

        info!(
            session_id,
            units = units.len(),
            questions = questions.len(),
            max_concurrency = self.options.max_concurrency,
            "starting evaluation run"
        );

        let recorder = Mutex::new(Recorder::new(
            Arc::clone(&self.sessions),
            session,
            units.len(),
        ));
        let mut outcomes = stream::iter(units.into_iter().enumerate())
            .map(|(index, unit)| self.run_unit(index, unit, &recorder))
            .buffered(self.options.max_concurrency.max(1));

        let mut failure = None;
        while let Some(outcome) = outcomes.next().await {
            if let Err(error) = outcome {
                cancel.cancel();
                failure = Some(error);
                break;
            }
        }
        drop(outcomes);
        let mut recorder = recorder.into_inner();

        if let Some(error) = failure {
            warn!(session_id, stage = %error.stage, error = %error, "evaluation run failed");
            if let Err(save_error) = recorder.salvage().await {
                warn!(session_id, error = %save_error, "could not save responses completed before the failure");
            }
            return Err(error);
        }

        let responses = &recorder.session.responses;
        let report = RunReport {
            session_id: recorder.session.id.clone(),
            responses: responses.len(),
            failed: responses
                .iter()
                .filter(|response| !response.is_completed())
                .count(),
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            session_id,
            responses = report.responses,
            failed = report.failed,
            "evaluation run completed"
        );
        Ok(report)
    }

    async fn run_unit(
        &self,
        index: usize,
        unit: Unit<'_>,
        recorder: &Mutex<Recorder>,
    ) -> Result<(), PipelineError> {
        if !unit.questions.is_empty() {
            self.evaluate_unit(index, &unit, recorder).await?;
        }
        recorder
            .lock()
            .await
            .finish(index)
            .await
            .map_err(|error| PipelineError::new(Stage::Record, None, error))
    }

    async fn evaluate_unit(
        &self,
        index: usize,
        unit: &Unit<'_>,
        recorder: &Mutex<Recorder>,
    ) -> Result<(), PipelineError> {
        debug!(
            configuration_id = %unit.configuration.id,
            document = %unit.document.name,
            "processing unit"
        );

        let processed = match self
            .cache
            .get_or_create(unit.document, unit.configuration, unit.ctx)
            .await
        {
            Ok(processed) => processed,
            Err(error) => {
                // Every question of the unit depends on the processed document.
                if self.aborts_run(&error) {
                    let triple = triple_for(unit, &unit.questions[0]);
                    return Err(PipelineError::new(Stage::Process, Some(triple), error));
                }
                warn!(
                    configuration_id = %unit.configuration.id,
                    document = %unit.document.name,
                    error = %error,
                    "document processing failed, recording failed responses"
                );
                for question in unit.questions {
                    let triple = triple_for(unit, question);
                    let response =
                        LlmResponse::failed(&triple, &question.text, Stage::Process, &error);
                    record(recorder, index, triple, response).await?;
                }
                return Ok(());
            }
        };

        for question in unit.questions {
            let triple = triple_for(unit, question);
            let response = match self.run_triple(unit, &processed, question, &triple).await {
                Ok(response) => response,
                Err((stage, error)) => {
                    if self.aborts_run(&error) {
                        return Err(PipelineError::new(stage, Some(triple), error));
                    }
                    warn!(%triple, %stage, error = %error, "triple failed, continuing");
                    LlmResponse::failed(&triple, &question.text, stage, &error)
                }
            };
            record(recorder, index, triple, response).await?;
        }
        Ok(())
    }

    async fn run_triple(
        &self,
        unit: &Unit<'_>,
        processed: &ProcessedDocument,
        question: &Question,
        triple: &Triple,
    ) -> StageResult<LlmResponse> {
        let configuration = unit.configuration;
        let request = unit.request;
        let ctx = unit.ctx;

        let query_vector = self
            .embed_single(&question.text, &configuration.embedding_model, ctx, "embed_query")
            .await
            .map_err(at(Stage::EmbedQuery))?;

        let scores = similarity::score(
            &query_vector,
            &processed.embeddings,
            configuration.similarity_metric,
        )
        .map_err(at(Stage::Similarity))?;

        let retrieved = similarity::top_k(&processed.chunks, &scores, configuration.top_k)
            .map_err(at(Stage::TopK))?;

        let reply = ctx
            .call("generate", || {
                self.judge
                    .ask(&question.text, &retrieved, &request.query_llm, &request.api_key)
            })
            .await
            .map_err(at(Stage::Generate))?;
        let relevance = validate_relevance(&request.query_llm, &reply, retrieved.len())
            .map_err(at(Stage::Generate))?;
        for warning in &relevance.warnings {
            warn!(%triple, ?warning, "relevance analysis accepted with warning");
        }

        let similarity_scores = retrieved.iter().map(|chunk| chunk.score).collect::<Vec<_>>();
        let relevance_fractions = relevance
            .scores
            .iter()
            .map(|percent| percent / 100.0)
            .collect::<Vec<_>>();
        let metrics =
            rus::compute(&similarity_scores, &relevance_fractions).map_err(at(Stage::Score))?;

        let visualizations = self
            .visualize(unit, processed, triple, &query_vector, &reply.answer, &retrieved)
            .await
            .map_err(at(Stage::Visualize))?;

        let chunks = retrieved
            .iter()
            .zip(&relevance.scores)
            .enumerate()
            .map(|(position, (chunk, relevance_score))| Chunk {
                chunk_number: chunk.chunk_number(),
                rank: position + 1,
                text: chunk.text.clone(),
                similarity_score: chunk.score,
                relevance_score: *relevance_score,
            })
            .collect();

        debug!(%triple, rus = metrics.rus, "triple completed");
        Ok(LlmResponse {
            configuration_id: triple.configuration_id.clone(),
            document_id: triple.document_id.clone(),
            question_id: triple.question_id.clone(),
            question: question.text.clone(),
            answer: reply.answer,
            chunks,
            visualizations,
            metrics: Some(metrics),
            warnings: relevance.warnings,
            status: ResponseStatus::Completed,
            created_at: Utc::now(),
        })
    }

    async fn visualize(
        &self,
        unit: &Unit<'_>,
        processed: &ProcessedDocument,
        triple: &Triple,
        query_vector: &[f32],
        answer: &str,
        retrieved: &[RankedChunk],
    ) -> Result<Vec<ArtifactRef>, EvalError> {
        let Some(projector) = &self.projector else {
            return Ok(Vec::new());
        };
        if self.options.projections.is_empty() {
            return Ok(Vec::new());
        }

        let answer_vector = self
            .embed_single(answer, &unit.configuration.embedding_model, unit.ctx, "embed_answer")
            .await?;
        let highlighted = retrieved.iter().map(|chunk| chunk.index).collect::<Vec<_>>();

        let mut artifacts = Vec::with_capacity(self.options.projections.len());
        for &technique in &self.options.projections {
            let artifact = unit
                .ctx
                .call("project", || {
                    projector.project(ProjectionRequest {
                        session_id: unit.session_id,
                        configuration_id: &triple.configuration_id,
                        document_id: &triple.document_id,
                        question_id: &triple.question_id,
                        technique,
                        chunk_vectors: &processed.embeddings,
                        query_vector,
                        answer_vector: &answer_vector,
                        highlighted: &highlighted,
                    })
                })
                .await?;
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }

    async fn embed_single(
        &self,
        text: &str,
        model: &str,
        ctx: &CallContext,
        label: &'static str,
    ) -> Result<Vec<f32>, EvalError> {
        let input = vec![text.to_string()];
        ctx.call(label, || self.embedder.embed(&input, model))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EvalError::parse(self.embedder.name(), "no embedding returned"))
    }

    /// Cancellation and cache failures end the run under either policy.
    fn aborts_run(&self, error: &EvalError) -> bool {
        self.options.failure_policy == FailurePolicy::FailFast
            || matches!(error, EvalError::Cancelled | EvalError::Cache(_))
    }
}

async fn record(
    recorder: &Mutex<Recorder>,
    index: usize,
    triple: Triple,
    response: LlmResponse,
) -> Result<(), PipelineError> {
    recorder
        .lock()
        .await
        .record(index, response)
        .await
        .map_err(|error| PipelineError::new(Stage::Record, Some(triple), error))
}

fn triple_for(unit: &Unit<'_>, question: &Question) -> Triple {
    Triple {
        configuration_id: unit.configuration.id.clone(),
        document_id: unit.document.id.clone(),
        question_id: question.id.clone(),
    }
}
