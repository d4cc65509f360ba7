use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rag_eval_core::{
    evaluate_session, BackendRegistry, CallContext, CharacterNgramEmbedder, ChunkSizes,
    ChunkingStrategy, Configuration, DocumentCache, EmbeddingProvider, EmbeddingRegistry,
    EvalOptions, ExtensionExtractor, FailurePolicy, FileSessionRepository, HttpProviderConfig,
    JsonFileCacheStore, KeyedLocks, LlmCrossConfigJudge, LlmRelevanceJudge, OpenAiEmbedder,
    PipelineOrchestrator, ProjectionTechnique, RetryPolicy, RunRequest, ScatterProjector,
    SessionStore, SimilarityMetric,
    LOCAL_NGRAM_MODEL, OPENAI_DEFAULT_MODEL,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rag-eval", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root for sessions, uploaded documents, the processed-document cache and visualizations.
    #[arg(long, env = "RAG_EVAL_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1/")]
    openai_url: String,

    /// Gemini API base URL
    #[arg(long, default_value = "https://generativelanguage.googleapis.com/v1beta/")]
    gemini_url: String,

    /// API key for remote embedding models (`text-embedding-*`).
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Texts per embeddings request.
    #[arg(long, default_value = "64")]
    embedding_batch_size: usize,

    /// Timeout for each external call, in seconds.
    #[arg(long, default_value = "60")]
    call_timeout_secs: u64,

    /// Retries for transient provider failures.
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Base delay between retries, in milliseconds.
    #[arg(long, default_value = "500")]
    retry_backoff_ms: u64,

    /// (configuration, document) units processed concurrently.
    #[arg(long, default_value = "4")]
    max_concurrency: usize,

    /// Record failed triples and keep going instead of aborting the run.
    #[arg(long, default_value_t = false)]
    continue_on_error: bool,

    /// Skip writing projection artifacts.
    #[arg(long, default_value_t = false)]
    no_visualizations: bool,

    /// Projections written per triple: pca, tsne.
    #[arg(
        long = "projection",
        value_delimiter = ',',
        default_values_t = [ProjectionTechnique::Pca, ProjectionTechnique::Tsne]
    )]
    projections: Vec<ProjectionTechnique>,
}

#[derive(Subcommand)]
enum Command {
    /// Create or inspect evaluation sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Add or remove documents of a session.
    Document {
        #[command(subcommand)]
        action: DocumentAction,
    },
    /// Add or remove questions of a session.
    Question {
        #[command(subcommand)]
        action: QuestionAction,
    },
    /// Add or remove RAG configurations of a session.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run every configuration against every document and question.
    Run {
        #[arg(long)]
        session: String,
        /// Generation model answering questions and scoring relevance.
        #[arg(long, default_value = OPENAI_DEFAULT_MODEL)]
        query_llm: String,
        /// API key for the generation model.
        #[arg(long, env = "RAG_EVAL_LLM_API_KEY", hide_env_values = true)]
        api_key: String,
    },
    /// Ask a model to compare the configurations of the latest run.
    Judge {
        #[arg(long)]
        session: String,
        #[arg(long, default_value = OPENAI_DEFAULT_MODEL)]
        judge_llm: String,
        #[arg(long, env = "RAG_EVAL_LLM_API_KEY", hide_env_values = true)]
        api_key: String,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    Create,
    Show {
        #[arg(long)]
        session: String,
    },
}

#[derive(Subcommand)]
enum DocumentAction {
    /// Upload one file, or every supported file under a folder.
    Add {
        #[arg(long)]
        session: String,
        #[arg(long)]
        path: PathBuf,
    },
    Remove {
        #[arg(long)]
        session: String,
        #[arg(long)]
        document: String,
    },
}

#[derive(Subcommand)]
enum QuestionAction {
    Add {
        #[arg(long)]
        session: String,
        #[arg(long)]
        text: String,
    },
    Remove {
        #[arg(long)]
        session: String,
        #[arg(long)]
        question: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Add(ConfigArgs),
    Remove {
        #[arg(long)]
        session: String,
        #[arg(long)]
        config: String,
    },
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    session: String,
    /// token, sentence, paragraph or page
    #[arg(long)]
    strategy: ChunkingStrategy,
    #[arg(long)]
    token_size: Option<usize>,
    #[arg(long)]
    sentence_size: Option<usize>,
    #[arg(long)]
    paragraph_size: Option<usize>,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long, default_value = LOCAL_NGRAM_MODEL)]
    embedding_model: String,
    /// cosine, dot_product or euclidean
    #[arg(long, default_value = "cosine")]
    metric: SimilarityMetric,
    #[arg(long, default_value = "3")]
    top_k: usize,
}

impl Cli {
    fn options(&self) -> EvalOptions {
        EvalOptions {
            max_concurrency: self.max_concurrency,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            failure_policy: if self.continue_on_error {
                FailurePolicy::Continue
            } else {
                FailurePolicy::FailFast
            },
            projections: if self.no_visualizations {
                Vec::new()
            } else {
                self.projections.clone()
            },
        }
    }

    fn backends(&self) -> anyhow::Result<BackendRegistry> {
        Ok(BackendRegistry::with_defaults(
            HttpProviderConfig::new(&self.openai_url, None)?,
            HttpProviderConfig::new(&self.gemini_url, None)?,
        ))
    }

    fn embedder(&self) -> anyhow::Result<EmbeddingRegistry> {
        let openai = HttpProviderConfig::new(&self.openai_url, self.openai_api_key.clone())?;
        Ok(EmbeddingRegistry::new()
            .register(LOCAL_NGRAM_MODEL, Arc::new(CharacterNgramEmbedder::default()))
            .register(
                "text-embedding",
                Arc::new(OpenAiEmbedder::new(openai, self.embedding_batch_size)),
            ))
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        data_dir = %cli.data_dir.display(),
        started_at = %Utc::now().to_rfc3339(),
        "rag-eval boot"
    );

    let locks = KeyedLocks::new();
    let repository = Arc::new(FileSessionRepository::new(cli.data_dir.join("sessions")));
    let sessions = SessionStore::new(repository.clone(), locks.clone(), cli.data_dir.join("documents"));

    match &cli.command {
        Command::Session { action } => match action {
            SessionAction::Create => print_json(&sessions.create_session().await?)?,
            SessionAction::Show { session } => print_json(&sessions.get_session(session).await?)?,
        },
        Command::Document { action } => match action {
            DocumentAction::Add { session, path } => {
                if path.is_dir() {
                    print_json(&sessions.add_documents_from(session, path).await?)?;
                } else {
                    print_json(&sessions.add_document(session, path).await?)?;
                }
            }
            DocumentAction::Remove { session, document } => {
                sessions.remove_document(session, document).await?;
                print_json(&json!({ "removed": document }))?;
            }
        },
        Command::Question { action } => match action {
            QuestionAction::Add { session, text } => {
                print_json(&sessions.add_question(session, text).await?)?
            }
            QuestionAction::Remove { session, question } => {
                sessions.remove_question(session, question).await?;
                print_json(&json!({ "removed": question }))?;
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Add(args) => {
                let configuration = Configuration {
                    id: String::new(),
                    chunking_strategy: args.strategy,
                    sizes: ChunkSizes {
                        token_size: args.token_size,
                        sentence_size: args.sentence_size,
                        paragraph_size: args.paragraph_size,
                        page_size: args.page_size,
                    },
                    embedding_model: args.embedding_model.clone(),
                    similarity_metric: args.metric,
                    top_k: args.top_k,
                };
                print_json(&sessions.add_configuration(&args.session, configuration).await?)?;
            }
            ConfigAction::Remove { session, config } => {
                sessions.remove_configuration(session, config).await?;
                print_json(&json!({ "removed": config }))?;
            }
        },
        Command::Run {
            session,
            query_llm,
            api_key,
        } => {
            let embedder: Arc<dyn EmbeddingProvider> = Arc::new(cli.embedder()?);
            let cache = DocumentCache::new(
                Arc::new(JsonFileCacheStore::new(cli.data_dir.join("cache"))),
                Arc::new(ExtensionExtractor::default()),
                Arc::clone(&embedder),
            );
            let mut orchestrator = PipelineOrchestrator::new(
                repository,
                locks,
                Arc::new(cache),
                embedder,
                Arc::new(LlmRelevanceJudge::new(cli.backends()?)),
                cli.options(),
            );
            if !cli.no_visualizations {
                orchestrator = orchestrator
                    .with_projector(Arc::new(ScatterProjector::new(cli.data_dir.join("visualizations"))));
            }

            let request = RunRequest {
                session_id: session.clone(),
                query_llm: query_llm.clone(),
                api_key: api_key.clone(),
            };
            let report = orchestrator.run(&request, cancel_on_ctrl_c()).await?;
            print_json(&report)?;
        }
        Command::Judge {
            session,
            judge_llm,
            api_key,
        } => {
            let session = sessions.get_session(session).await?;
            let judge = LlmCrossConfigJudge::new(cli.backends()?);
            let ctx = CallContext::new(RetryPolicy::from_options(&cli.options()), cancel_on_ctrl_c());
            let verdict = evaluate_session(&judge, &session, judge_llm, api_key, &ctx).await?;
            print_json(&verdict)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projections_default_to_pca_and_tsne() {
        let cli = Cli::try_parse_from(["rag-eval", "session", "create"]).unwrap();
        assert_eq!(
            cli.options().projections,
            vec![ProjectionTechnique::Pca, ProjectionTechnique::Tsne]
        );
    }

    #[test]
    fn projections_can_be_narrowed_or_disabled() {
        let cli = Cli::try_parse_from(["rag-eval", "--projection", "tsne", "session", "create"]).unwrap();
        assert_eq!(cli.options().projections, vec![ProjectionTechnique::Tsne]);

        let cli = Cli::try_parse_from(["rag-eval", "--no-visualizations", "session", "create"]).unwrap();
        assert!(cli.options().projections.is_empty());
    }
}
