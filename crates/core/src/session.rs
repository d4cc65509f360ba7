use crate::error::EvalError;
use crate::extractor::{discover_documents, extension_of, SUPPORTED_EXTENSIONS};
use crate::locks::KeyedLocks;
use crate::models::{Configuration, Document, Question, Session};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// System of record for sessions. Both operations are atomic: a concurrent
/// reader sees either the previous or the new session, never a torn one.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn load(&self, id: &str) -> Result<Session, EvalError>;

    async fn save(&self, session: &Session) -> Result<(), EvalError>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn load(&self, id: &str) -> Result<Session, EvalError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EvalError::not_found("session", id))
    }

    async fn save(&self, session: &Session) -> Result<(), EvalError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }
}

/// Stores `session_<id>.json` files, written to a temp file then renamed.
#[derive(Debug, Clone)]
pub struct FileSessionRepository {
    directory: PathBuf,
}

impl FileSessionRepository {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn session_path(&self, id: &str) -> Result<PathBuf, EvalError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|character| character.is_ascii_alphanumeric() || character == '-' || character == '_');
        if !valid {
            return Err(EvalError::not_found("session", id));
        }
        Ok(self.directory.join(format!("session_{id}.json")))
    }
}

#[async_trait]
impl SessionRepository for FileSessionRepository {
    async fn load(&self, id: &str) -> Result<Session, EvalError> {
        let path = self.session_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(EvalError::not_found("session", id))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), EvalError> {
        let path = self.session_path(&session.id)?;
        tokio::fs::create_dir_all(&self.directory).await?;

        let temp_path = self
            .directory
            .join(format!(".session_{}.{}.tmp", session.id, Uuid::new_v4()));
        tokio::fs::write(&temp_path, serde_json::to_vec_pretty(session)?).await?;
        if let Err(error) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(error.into());
        }
        Ok(())
    }
}

/// Session CRUD. Every mutation is a load-modify-save under the session's
/// lock, shared with the pipeline so runs and edits never interleave.
#[derive(Clone)]
pub struct SessionStore {
    repository: Arc<dyn SessionRepository>,
    locks: KeyedLocks,
    documents_dir: PathBuf,
}

impl SessionStore {
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        locks: KeyedLocks,
        documents_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository,
            locks,
            documents_dir: documents_dir.into(),
        }
    }

    pub fn repository(&self) -> Arc<dyn SessionRepository> {
        Arc::clone(&self.repository)
    }

    pub fn locks(&self) -> KeyedLocks {
        self.locks.clone()
    }

    pub async fn create_session(&self) -> Result<Session, EvalError> {
        let session = Session::new(Uuid::new_v4().to_string());
        self.repository.save(&session).await?;
        info!(session_id = %session.id, "created session");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, EvalError> {
        self.repository.load(session_id).await
    }

    /// Copies the file into the session's document directory and records it.
    pub async fn add_document(&self, session_id: &str, source: &Path) -> Result<Document, EvalError> {
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| EvalError::Configuration(format!("path has no file name: {}", source.display())))?
            .to_string();
        let extension = extension_of(source).unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(EvalError::Configuration(format!(
                "unsupported document type '{extension}', expected one of: {}",
                SUPPORTED_EXTENSIONS.join(", ")
            )));
        }

        self.update(session_id, |mut session| async move {
            let target_dir = self.documents_dir.join(&session.id);
            tokio::fs::create_dir_all(&target_dir).await?;
            let target = target_dir.join(&name);
            let size = tokio::fs::copy(source, &target).await?;

            let document = Document {
                id: Uuid::new_v4().to_string(),
                name,
                path: target,
                size,
                extension,
            };
            session.documents.push(document.clone());
            Ok((session, document))
        })
        .await
    }

    /// Adds every supported file under `folder`, in path order.
    pub async fn add_documents_from(&self, session_id: &str, folder: &Path) -> Result<Vec<Document>, EvalError> {
        let files = discover_documents(folder);
        if files.is_empty() {
            return Err(EvalError::Configuration(format!(
                "no supported documents found in {}",
                folder.display()
            )));
        }

        let mut added = Vec::with_capacity(files.len());
        for file in files {
            added.push(self.add_document(session_id, &file).await?);
        }
        Ok(added)
    }

    pub async fn remove_document(&self, session_id: &str, document_id: &str) -> Result<(), EvalError> {
        self.update(session_id, |mut session| async move {
            let position = session
                .documents
                .iter()
                .position(|document| document.id == document_id)
                .ok_or_else(|| EvalError::not_found("document", document_id))?;
            session.documents.remove(position);
            Ok((session, ()))
        })
        .await
    }

    pub async fn add_question(&self, session_id: &str, text: &str) -> Result<Question, EvalError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EvalError::Configuration("question text must not be empty".to_string()));
        }

        self.update(session_id, |mut session| async move {
            let question = Question {
                id: Uuid::new_v4().to_string(),
                text: text.to_string(),
                session_id: session.id.clone(),
            };
            session.questions.push(question.clone());
            Ok((session, question))
        })
        .await
    }

    pub async fn remove_question(&self, session_id: &str, question_id: &str) -> Result<(), EvalError> {
        self.update(session_id, |mut session| async move {
            let position = session
                .questions
                .iter()
                .position(|question| question.id == question_id)
                .ok_or_else(|| EvalError::not_found("question", question_id))?;
            session.questions.remove(position);
            Ok((session, ()))
        })
        .await
    }

    /// Validates and stores the configuration under a fresh id.
    pub async fn add_configuration(
        &self,
        session_id: &str,
        mut configuration: Configuration,
    ) -> Result<Configuration, EvalError> {
        configuration.validate()?;
        configuration.id = Uuid::new_v4().to_string();

        self.update(session_id, |mut session| async move {
            session.configurations.push(configuration.clone());
            Ok((session, configuration))
        })
        .await
    }

    pub async fn remove_configuration(&self, session_id: &str, configuration_id: &str) -> Result<(), EvalError> {
        self.update(session_id, |mut session| async move {
            let position = session
                .configurations
                .iter()
                .position(|configuration| configuration.id == configuration_id)
                .ok_or_else(|| EvalError::not_found("configuration", configuration_id))?;
            session.configurations.remove(position);
            Ok((session, ()))
        })
        .await
    }

    async fn update<T, F, Fut>(&self, session_id: &str, change: F) -> Result<T, EvalError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: std::future::Future<Output = Result<(Session, T), EvalError>>,
    {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.repository.load(session_id).await?;
        let (session, value) = change(session).await?;
        self.repository.save(&session).await?;
        Ok(value)
    }
}
