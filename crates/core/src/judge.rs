use crate::error::EvalError;
use crate::generation::{BackendRegistry, Prompt};
use crate::http;
use crate::models::{Configuration, LlmResponse, RusMetrics, Session};
use crate::retry::CallContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

const SYSTEM_PROMPT: &str = "You are a specialized evaluator for Retrieval-Augmented Generation (RAG) systems. \
Your task is to analyze multiple RAG configurations and determine which one performs best based on the provided \
metrics and results. You will examine how well the retrieval mechanism aligns with the generation process and \
identify potential issues in the RAG pipeline.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeVerdict {
    pub recommendation: String,
    pub analysis: Vec<String>,
}

/// Compares every configuration's results and recommends one.
#[async_trait]
pub trait CrossConfigJudge: Send + Sync {
    async fn judge(&self, payload: &str, model: &str, api_key: &str) -> Result<JudgeVerdict, EvalError>;
}

pub struct LlmCrossConfigJudge {
    registry: BackendRegistry,
}

impl LlmCrossConfigJudge {
    pub fn new(registry: BackendRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CrossConfigJudge for LlmCrossConfigJudge {
    async fn judge(&self, payload: &str, model: &str, api_key: &str) -> Result<JudgeVerdict, EvalError> {
        let backend = self.registry.resolve(model)?;
        let raw = backend.complete(&judge_prompt(payload), api_key).await?;
        parse_verdict(backend.name(), &raw)
    }
}

#[derive(Debug, Serialize)]
pub struct JudgePayload {
    pub questions: Vec<QuestionResults>,
}

#[derive(Debug, Serialize)]
pub struct QuestionResults {
    pub question: String,
    pub configurations: Vec<ConfigurationResult>,
}

#[derive(Debug, Serialize)]
pub struct ConfigurationResult {
    pub configuration: ConfigurationSummary,
    pub document: String,
    pub answer: String,
    pub chunks: Vec<ChunkScores>,
    pub metrics: Option<RusMetrics>,
}

#[derive(Debug, Serialize)]
pub struct ConfigurationSummary {
    pub id: String,
    pub chunking_strategy: String,
    pub chunk_size: Option<usize>,
    pub embedding_model: String,
    pub similarity_metric: String,
    pub top_k: usize,
}

impl From<&Configuration> for ConfigurationSummary {
    fn from(configuration: &Configuration) -> Self {
        Self {
            id: configuration.id.clone(),
            chunking_strategy: configuration.chunking_strategy.to_string(),
            chunk_size: configuration.chunk_size().ok().map(|size| size.get()),
            embedding_model: configuration.embedding_model.clone(),
            similarity_metric: configuration.similarity_metric.to_string(),
            top_k: configuration.top_k,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChunkScores {
    pub chunk_number: usize,
    pub similarity_score: f64,
    pub relevance_score: f64,
}

/// Groups completed responses by question (in session question order), then
/// by configuration (in session configuration order).
pub fn build_payload(session: &Session) -> Result<JudgePayload, EvalError> {
    let completed = session
        .responses
        .iter()
        .filter(|response| response.is_completed())
        .collect::<Vec<_>>();

    if completed.is_empty() {
        return Err(EvalError::Configuration(format!(
            "session {} has no completed results to judge",
            session.id
        )));
    }

    let questions = session
        .questions
        .iter()
        .filter_map(|question| {
            let configurations = session
                .configurations
                .iter()
                .flat_map(|configuration| {
                    completed
                        .iter()
                        .filter(move |response| {
                            response.question_id == question.id
                                && response.configuration_id == configuration.id
                        })
                        .map(move |response| configuration_result(session, configuration, response))
                })
                .collect::<Vec<_>>();

            if configurations.is_empty() {
                None
            } else {
                Some(QuestionResults {
                    question: question.text.clone(),
                    configurations,
                })
            }
        })
        .collect();

    Ok(JudgePayload { questions })
}

fn configuration_result(
    session: &Session,
    configuration: &Configuration,
    response: &LlmResponse,
) -> ConfigurationResult {
    let document = session
        .documents
        .iter()
        .find(|document| document.id == response.document_id)
        .map(|document| document.name.clone())
        .unwrap_or_else(|| response.document_id.clone());

    ConfigurationResult {
        configuration: configuration.into(),
        document,
        answer: response.answer.clone(),
        chunks: response
            .chunks
            .iter()
            .map(|chunk| ChunkScores {
                chunk_number: chunk.chunk_number,
                similarity_score: chunk.similarity_score,
                relevance_score: chunk.relevance_score,
            })
            .collect(),
        metrics: response.metrics,
    }
}

pub fn judge_prompt(payload: &str) -> Prompt {
    let user = format!(
        r#"## Input Data
{payload}

## Evaluation Guidelines
- Analyze the RAG configurations and determine which one performs best based on the metrics and results.
- A correct final answer is not always evidence of good retrieval. Analyze both the retrieval and the generation side.
- Identify patterns that indicate an optimized or suboptimal process and their likely causes.
- Judge which answer is better overall in terms of information covered.

Meaning of the metrics
- Similarity Score: similarity between the query and the chunk under the configuration's similarity metric.
- Relevance Score: share of the answer an LLM attributes to the chunk.
- RUS: overall retrieval utility, combining the three metrics below.
- Normalized DCR: how well relevant chunks are ranked near the top.
- Scaled Correlation: how well similarity order predicts relevance order.
- Wasted Similarity Penalty: how much similarity went to chunks that were not used.

## Output Format
{{
    "recommendation": "brief; list the best configuration's chunking strategy, embedding model, similarity metric and number of chunks",
    "analysis": ["short insights that explain the recommendation without quoting raw numbers"]
}}"#
    );

    Prompt {
        system: Some(SYSTEM_PROMPT.to_string()),
        user,
    }
}

pub fn parse_verdict(provider: &str, raw: &str) -> Result<JudgeVerdict, EvalError> {
    let value = http::parse_json_payload(provider, raw)?;
    let verdict: JudgeVerdict = serde_json::from_value(value)
        .map_err(|error| EvalError::parse(provider, format!("unexpected verdict shape: {error}")))?;

    if verdict.recommendation.trim().is_empty() {
        return Err(EvalError::parse(provider, "recommendation is empty"));
    }
    Ok(verdict)
}

/// Builds the payload from a session's latest run and asks the judge once.
/// Failures are reported to the caller, never retried beyond transient
/// transport errors.
pub async fn evaluate_session(
    judge: &dyn CrossConfigJudge,
    session: &Session,
    model: &str,
    api_key: &str,
    ctx: &CallContext,
) -> Result<JudgeVerdict, EvalError> {
    let payload = serde_json::to_string_pretty(&build_payload(session)?)?;
    info!(session_id = %session.id, model, payload_bytes = payload.len(), "judging configurations");
    ctx.call("judge", || judge.judge(&payload, model, api_key)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Chunk, ChunkSizes, ChunkingStrategy, Document, Question, ResponseStatus, SimilarityMetric,
        Stage, Triple,
    };
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn configuration(id: &str, top_k: usize) -> Configuration {
        Configuration {
            id: id.to_string(),
            chunking_strategy: ChunkingStrategy::Page,
            sizes: ChunkSizes {
                page_size: Some(1),
                ..Default::default()
            },
            embedding_model: "local-ngram".to_string(),
            similarity_metric: SimilarityMetric::Cosine,
            top_k,
        }
    }

    fn response(configuration_id: &str, question_id: &str, answer: &str) -> LlmResponse {
        LlmResponse {
            configuration_id: configuration_id.to_string(),
            document_id: "doc-1".to_string(),
            question_id: question_id.to_string(),
            question: "What is the budget?".to_string(),
            answer: answer.to_string(),
            chunks: vec![Chunk {
                chunk_number: 2,
                rank: 1,
                text: "Budget".to_string(),
                similarity_score: 0.8,
                relevance_score: 100.0,
            }],
            visualizations: Vec::new(),
            metrics: None,
            warnings: Vec::new(),
            status: ResponseStatus::Completed,
            created_at: Utc::now(),
        }
    }

    fn session() -> Session {
        let mut session = Session::new("s-1");
        session.documents.push(Document {
            id: "doc-1".to_string(),
            name: "report.pdf".to_string(),
            path: PathBuf::from("report.pdf"),
            size: 1,
            extension: "pdf".to_string(),
        });
        session.questions.push(Question {
            id: "q-1".to_string(),
            text: "What is the budget?".to_string(),
            session_id: "s-1".to_string(),
        });
        session.configurations = vec![configuration("c-1", 1), configuration("c-2", 2)];
        session.responses = vec![
            response("c-2", "q-1", "second"),
            response("c-1", "q-1", "first"),
        ];
        session
    }

    struct RecordingJudge {
        payloads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CrossConfigJudge for RecordingJudge {
        async fn judge(&self, payload: &str, _model: &str, _api_key: &str) -> Result<JudgeVerdict, EvalError> {
            if let Ok(mut payloads) = self.payloads.lock() {
                payloads.push(payload.to_string());
            }
            Ok(JudgeVerdict {
                recommendation: "page chunking, top 2".to_string(),
                analysis: vec!["wider context helps".to_string()],
            })
        }
    }

    #[test]
    fn payload_groups_by_question_then_configuration_order() {
        let payload = build_payload(&session()).unwrap();
        assert_eq!(payload.questions.len(), 1);
        let answers = payload.questions[0]
            .configurations
            .iter()
            .map(|result| result.answer.as_str())
            .collect::<Vec<_>>();
        assert_eq!(answers, vec!["first", "second"]);
        assert_eq!(payload.questions[0].configurations[0].document, "report.pdf");
    }

    #[test]
    fn failed_responses_are_left_out() {
        let mut session = session();
        session.responses = vec![LlmResponse::failed(
            &Triple {
                configuration_id: "c-1".to_string(),
                document_id: "doc-1".to_string(),
                question_id: "q-1".to_string(),
            },
            "What is the budget?",
            Stage::Generate,
            &EvalError::Generation("quota".to_string()),
        )];
        assert!(matches!(
            build_payload(&session),
            Err(EvalError::Configuration(_))
        ));
    }

    #[test]
    fn verdict_requires_recommendation_and_analysis() {
        let verdict = parse_verdict(
            "judge",
            r#"{"recommendation": "sentence x3", "analysis": ["a", "b"]}"#,
        )
        .unwrap();
        assert_eq!(verdict.analysis.len(), 2);

        assert!(matches!(
            parse_verdict("judge", r#"{"recommendation": "x"}"#),
            Err(EvalError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn evaluate_session_sends_one_payload() {
        let judge = RecordingJudge {
            payloads: Mutex::new(Vec::new()),
        };
        let ctx = CallContext::new(
            RetryPolicy {
                timeout: Duration::from_secs(5),
                max_retries: 0,
                backoff: Duration::from_millis(1),
            },
            CancellationToken::new(),
        );

        let verdict = evaluate_session(&judge, &session(), "gpt-4o-mini", "key", &ctx)
            .await
            .unwrap();
        assert_eq!(verdict.recommendation, "page chunking, top 2");

        let payloads = judge.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("\"similarity_metric\": \"cosine\""));
    }
}
