// src/summarizer.rs
// Background worker that compresses oversized conversation logs with the
// external generator, archiving the originals.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SummarizerConfig;
use crate::error::Result;
use crate::llm::{ChatMessage, Generator};

/// Backoff after an unexpected scan error before the next attempt
const ERROR_RETRY: Duration = Duration::from_secs(60);

/// Tokens requested for an in-flight context summary
const CONTEXT_SUMMARY_TOKENS: u32 = 300;

/// Tail of the context considered when it needs compression
const CONTEXT_TAIL_CHARS: usize = 8000;

/// Worker state visible to the façade
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerStatus {
    Idle,
    Monitoring,
    Error(String),
}

/// On-disk conversation blob the worker consumes
#[derive(Debug, Deserialize)]
struct ConversationBlob {
    session_id: String,
    device: String,
    timestamp: String,
    messages: Vec<BlobMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobMessage {
    role: String,
    content: String,
}

/// Snapshot of summarizer activity
#[derive(Debug, Clone, Serialize)]
pub struct SummarizerStats {
    pub model: String,
    pub is_running: bool,
    pub monitoring_interval_seconds: u64,
    pub max_file_size_kb: u64,
    pub max_context_tokens: usize,
    pub conversation_files: usize,
    pub summary_files: usize,
    pub archived_files: usize,
}

/// Background agent that summarizes conversation logs to bound their size
pub struct SummarizerAgent {
    conversations_dir: PathBuf,
    archive_dir: PathBuf,
    summaries_dir: PathBuf,
    config: SummarizerConfig,
    generator: Arc<dyn Generator>,
    status: std::sync::RwLock<WorkerStatus>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SummarizerAgent {
    /// Create the agent and its state directories under `data_dir`.
    pub fn new(
        data_dir: &Path,
        config: SummarizerConfig,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let conversations_dir = data_dir.join("conversations");
        let archive_dir = data_dir.join("archive").join("conversations");
        let summaries_dir = data_dir.join("summaries");

        std::fs::create_dir_all(&archive_dir)?;
        std::fs::create_dir_all(&summaries_dir)?;

        info!(model = %generator.model_name(), "Summarizer agent initialized");

        Ok(Self {
            conversations_dir,
            archive_dir,
            summaries_dir,
            config,
            generator,
            status: std::sync::RwLock::new(WorkerStatus::Idle),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.read().unwrap().clone()
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.write().unwrap() = status;
    }

    /// Start the background monitoring loop. No-op when already running.
    pub async fn start_background_monitoring(self: Arc<Self>) {
        let mut shutdown_guard = self.shutdown.lock().await;
        if shutdown_guard.is_some() {
            warn!("Summarizer is already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *shutdown_guard = Some(shutdown_tx);
        drop(shutdown_guard);

        let agent = self.clone();
        let handle = tokio::spawn(async move {
            agent.monitoring_loop(shutdown_rx).await;
        });
        *self.handle.lock().await = Some(handle);

        self.set_status(WorkerStatus::Monitoring);
        info!(
            interval_seconds = self.config.monitoring_interval_seconds,
            "Started background conversation monitoring"
        );
    }

    /// Cooperative stop: in-flight file writes finish, pending work is
    /// abandoned with the originals intact on disk.
    pub async fn stop_background_monitoring(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        if self.status() == WorkerStatus::Monitoring {
            self.set_status(WorkerStatus::Idle);
        }
        info!("Stopped background conversation monitoring");
    }

    async fn monitoring_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.monitoring_interval_seconds);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let sleep_for = match self.check_and_summarize_files().await {
                Ok(()) => interval,
                Err(e) if e.is_transient() => {
                    error!("Summarizer scan failed: {e}");
                    ERROR_RETRY
                }
                Err(e) => {
                    // Unrecoverable condition: stop and make it visible
                    error!("Summarizer stopping on fatal error: {e}");
                    self.set_status(WorkerStatus::Error(e.to_string()));
                    break;
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One sweep: apply the trigger rule to every conversation file and
    /// process matches sequentially. A failure on one file never stops the
    /// sweep.
    pub async fn check_and_summarize_files(&self) -> Result<()> {
        if !self.conversations_dir.exists() {
            return Ok(());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.conversations_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        debug!("Checking {} conversation files", files.len());

        for path in files {
            match self.should_summarize_file(&path) {
                Ok(true) => {
                    info!(file = %path.display(), "Summarizing oversized conversation file");
                    if let Err(e) = self.summarize_conversation_file(&path).await {
                        error!(file = %path.display(), "Failed to summarize: {e}");
                    }
                }
                Ok(false) => {}
                Err(e) => error!(file = %path.display(), "Failed to stat: {e}"),
            }
        }

        Ok(())
    }

    /// Size or age is sufficient to trigger summarization.
    fn should_summarize_file(&self, path: &Path) -> Result<bool> {
        let metadata = std::fs::metadata(path)?;

        if metadata.len() > self.config.max_file_size_bytes {
            debug!(
                file = %path.display(),
                size = metadata.len(),
                "File exceeds size trigger"
            );
            return Ok(true);
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .unwrap_or_default();
        if age > Duration::from_secs(self.config.max_age_days * 86_400) {
            debug!(file = %path.display(), age_days = age.as_secs() / 86_400, "File exceeds age trigger");
            return Ok(true);
        }

        Ok(false)
    }

    /// Summarize one conversation file and archive (or delete) the original.
    /// On generator failure the file is left untouched.
    pub async fn summarize_conversation_file(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let blob: ConversationBlob = serde_json::from_str(&raw)?;

        let transcript = format_transcript(&blob.messages);
        let summary = self.generate_summary(&transcript).await?;

        let file_size = std::fs::metadata(path)?.len();
        let summary_data = serde_json::json!({
            "original_session_id": blob.session_id,
            "device": blob.device,
            "original_timestamp": blob.timestamp,
            "original_message_count": blob.messages.len(),
            "summary": summary,
            "summarized_at": chrono::Utc::now().to_rfc3339(),
            "summarizer_model": self.generator.model_name(),
            "file_size_bytes": file_size,
        });

        // Write-then-rename so a crash never leaves a torn summary
        let summary_path = self
            .summaries_dir
            .join(format!("{}_summary.json", blob.session_id));
        let tmp_path = summary_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(&summary_data)?)?;
        std::fs::rename(&tmp_path, &summary_path)?;

        if self.config.keep_originals {
            let archive_path = self.archive_dir.join(path.file_name().unwrap_or_default());
            std::fs::rename(path, &archive_path)?;
            info!(archived = %archive_path.display(), "Archived original conversation");
        } else {
            std::fs::remove_file(path)?;
        }

        info!(
            session_id = %blob.session_id,
            messages = blob.messages.len(),
            summary_chars = summary.len(),
            "Summarized conversation"
        );
        Ok(())
    }

    async fn generate_summary(&self, transcript: &str) -> Result<String> {
        let prompt = format!(
            "Please provide a comprehensive but concise summary of this conversation. Focus on:\n\
             \n\
             1. **Key topics and themes** discussed\n\
             2. **Important user information** (name, preferences, requirements)\n\
             3. **Decisions or conclusions** reached\n\
             4. **Action items** or follow-ups mentioned\n\
             5. **Emotional context** or user sentiment\n\
             \n\
             Keep the summary informative but not verbose. Capture the essence of the \
             conversation while preserving important details.\n\
             \n\
             Conversation to summarize:\n\
             ---\n\
             {transcript}\n\
             ---"
        );

        let (summary, usage) = self
            .generator
            .generate(
                &[ChatMessage::user(prompt)],
                self.config.temperature,
                self.config.max_summary_tokens,
                false,
            )
            .await?;

        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Summary generated"
        );
        Ok(summary.trim().to_string())
    }

    /// One synchronous sweep at startup.
    pub async fn summarize_on_startup(&self) -> Result<()> {
        info!("Running startup summarization check");
        self.check_and_summarize_files().await?;
        info!("Startup summarization check complete");
        Ok(())
    }

    /// Out-of-band single-file processing. Returns false for a missing or
    /// non-JSON path.
    pub async fn manual_summarize_file(&self, path: &Path) -> Result<bool> {
        if !path.exists() || path.extension().is_none_or(|ext| ext != "json") {
            warn!(file = %path.display(), "File not found or not a JSON file");
            return Ok(false);
        }
        info!(file = %path.display(), "Manually summarizing");
        self.summarize_conversation_file(path).await?;
        Ok(true)
    }

    /// Check whether a context block is over the token budget; if so,
    /// request a short summary of its tail.
    ///
    /// Tokens are estimated as len/4. On generator failure the caller still
    /// learns the context was too large, with a fallback notice.
    pub async fn check_context_size(&self, context_text: &str) -> (bool, Option<String>) {
        let estimated_tokens = context_text.len() / 4;
        if estimated_tokens <= self.config.max_context_tokens {
            return (false, None);
        }

        info!(
            estimated_tokens,
            cap = self.config.max_context_tokens,
            "Context too large, requesting summary"
        );

        let tail = char_tail(context_text, CONTEXT_TAIL_CHARS);
        let prompt = format!(
            "This conversation context is too long for the AI model. Please create a concise \
             summary that captures:\n\
             - Current conversation topic\n\
             - Key points discussed so far\n\
             - User's main questions or requests\n\
             - Important context to maintain\n\
             \n\
             Keep it under 200 words.\n\
             \n\
             Context to summarize:\n\
             {tail}"
        );

        match self
            .generator
            .generate(
                &[ChatMessage::user(prompt)],
                self.config.temperature,
                CONTEXT_SUMMARY_TOKENS,
                false,
            )
            .await
        {
            Ok((summary, _)) => (true, Some(summary.trim().to_string())),
            Err(e) => {
                error!("Failed to generate context summary: {e}");
                (
                    true,
                    Some(format!(
                        "Context too long ({estimated_tokens} tokens). Consider clearing history."
                    )),
                )
            }
        }
    }

    /// Snapshot of configuration and per-directory file counts.
    pub fn stats(&self) -> SummarizerStats {
        SummarizerStats {
            model: self.generator.model_name(),
            is_running: self.status() == WorkerStatus::Monitoring,
            monitoring_interval_seconds: self.config.monitoring_interval_seconds,
            max_file_size_kb: self.config.max_file_size_bytes / 1024,
            max_context_tokens: self.config.max_context_tokens,
            conversation_files: count_json_files(&self.conversations_dir),
            summary_files: count_json_files(&self.summaries_dir),
            archived_files: count_json_files(&self.archive_dir),
        }
    }
}

fn count_json_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count()
        })
        .unwrap_or(0)
}

/// Render blob messages into the summarization transcript.
fn format_transcript(messages: &[BlobMessage]) -> String {
    messages
        .iter()
        .map(|msg| {
            let role = if msg.role == "user" { "USER" } else { "ASSISTANT" };
            format!("**{role}**: {}", msg.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Last `chars` characters of a string, on a char boundary.
fn char_tail(text: &str, chars: usize) -> &str {
    let total = text.chars().count();
    if total <= chars {
        return text;
    }
    let skip = total - chars;
    let (idx, _) = text.char_indices().nth(skip).unwrap_or((0, ' '));
    &text[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HivemindError;
    use crate::llm::mock::MockGenerator;

    fn write_conversation_blob(dir: &Path, session_id: &str, padding: usize) -> PathBuf {
        let blob = serde_json::json!({
            "session_id": session_id,
            "device": "dev-a",
            "timestamp": "2026-01-01T00:00:00Z",
            "messages": [
                {"role": "user", "content": "x".repeat(padding)},
                {"role": "assistant", "content": "short reply"},
            ],
        });
        let path = dir.join(format!("{session_id}.json"));
        std::fs::write(&path, serde_json::to_string(&blob).unwrap()).unwrap();
        path
    }

    fn agent_with(
        data_dir: &Path,
        config: SummarizerConfig,
        generator: Arc<MockGenerator>,
    ) -> Arc<SummarizerAgent> {
        Arc::new(SummarizerAgent::new(data_dir, config, generator).unwrap())
    }

    #[tokio::test]
    async fn test_size_trigger_archives_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let conversations = dir.path().join("conversations");
        std::fs::create_dir_all(&conversations).unwrap();

        // 60 KiB file against a 50 KiB limit
        let path = write_conversation_blob(&conversations, "sess1", 60 * 1024);
        let original_bytes = std::fs::read(&path).unwrap();

        let config = SummarizerConfig::default();
        let generator = Arc::new(MockGenerator::new("the gist of it"));
        let agent = agent_with(dir.path(), config, generator.clone());

        agent.check_and_summarize_files().await.unwrap();

        // Original moved to archive byte-for-byte, summary written
        assert!(!path.exists());
        let archived = dir
            .path()
            .join("archive")
            .join("conversations")
            .join("sess1.json");
        assert_eq!(std::fs::read(&archived).unwrap(), original_bytes);

        let summary_path = dir.path().join("summaries").join("sess1_summary.json");
        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
        assert_eq!(summary["original_session_id"], "sess1");
        assert_eq!(summary["original_message_count"], 2);
        assert_eq!(summary["summary"], "the gist of it");
        assert_eq!(summary["summarizer_model"], "mock");
        assert!(summary["file_size_bytes"].as_u64().unwrap() > 50 * 1024);
    }

    #[tokio::test]
    async fn test_small_fresh_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let conversations = dir.path().join("conversations");
        std::fs::create_dir_all(&conversations).unwrap();
        let path = write_conversation_blob(&conversations, "tiny", 10);

        let generator = Arc::new(MockGenerator::new("unused"));
        let agent = agent_with(dir.path(), SummarizerConfig::default(), generator.clone());

        agent.check_and_summarize_files().await.unwrap();

        assert!(path.exists());
        assert!(generator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_originals_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let conversations = dir.path().join("conversations");
        std::fs::create_dir_all(&conversations).unwrap();
        let path = write_conversation_blob(&conversations, "gone", 60 * 1024);

        let config = SummarizerConfig {
            keep_originals: false,
            ..SummarizerConfig::default()
        };
        let agent = agent_with(dir.path(), config, Arc::new(MockGenerator::new("s")));

        agent.summarize_conversation_file(&path).await.unwrap();

        assert!(!path.exists());
        assert!(
            !dir.path()
                .join("archive")
                .join("conversations")
                .join("gone.json")
                .exists()
        );
        assert!(dir.path().join("summaries").join("gone_summary.json").exists());
    }

    #[tokio::test]
    async fn test_transcript_format() {
        let messages = vec![
            BlobMessage {
                role: "user".into(),
                content: "hello".into(),
            },
            BlobMessage {
                role: "assistant".into(),
                content: "hi there".into(),
            },
        ];
        assert_eq!(
            format_transcript(&messages),
            "**USER**: hello\n\n**ASSISTANT**: hi there"
        );
    }

    #[tokio::test]
    async fn test_summary_prompt_contract() {
        let dir = tempfile::tempdir().unwrap();
        let conversations = dir.path().join("conversations");
        std::fs::create_dir_all(&conversations).unwrap();
        let path = write_conversation_blob(&conversations, "sess2", 100);

        let generator = Arc::new(MockGenerator::new("ok"));
        let agent = agent_with(dir.path(), SummarizerConfig::default(), generator.clone());
        agent.summarize_conversation_file(&path).await.unwrap();

        let calls = generator.calls.lock().unwrap();
        let prompt = &calls[0][0].content;
        assert!(prompt.starts_with(
            "Please provide a comprehensive but concise summary of this conversation. Focus on:"
        ));
        assert!(prompt.contains("1. **Key topics and themes** discussed"));
        assert!(prompt.contains("5. **Emotional context** or user sentiment"));
        assert!(prompt.contains("---\n**USER**:"));
    }

    #[tokio::test]
    async fn test_check_context_size_under_cap() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(MockGenerator::new("unused"));
        let agent = agent_with(dir.path(), SummarizerConfig::default(), generator.clone());

        let (needs, summary) = agent.check_context_size("short context").await;
        assert!(!needs);
        assert!(summary.is_none());
        assert!(generator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_context_size_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(MockGenerator::new("condensed"));
        let agent = agent_with(dir.path(), SummarizerConfig::default(), generator.clone());

        // 6000-token cap means > 24000 chars
        let big = "y".repeat(30_000);
        let (needs, summary) = agent.check_context_size(&big).await;
        assert!(needs);
        assert_eq!(summary.as_deref(), Some("condensed"));

        // Only the last 8000 chars go to the generator
        let calls = generator.calls.lock().unwrap();
        assert!(calls[0][0].content.len() < 9_000);
    }

    #[tokio::test]
    async fn test_generator_failure_leaves_file_untouched() {
        struct BrokenGenerator;

        #[async_trait::async_trait]
        impl Generator for BrokenGenerator {
            async fn generate(
                &self,
                _messages: &[ChatMessage],
                _temperature: f32,
                _max_tokens: u32,
                _stream: bool,
            ) -> Result<(String, crate::llm::TokenUsage)> {
                Err(HivemindError::External("model offline".into()))
            }

            fn model_name(&self) -> String {
                "broken".into()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let conversations = dir.path().join("conversations");
        std::fs::create_dir_all(&conversations).unwrap();
        let path = write_conversation_blob(&conversations, "stuck", 60 * 1024);

        let agent = Arc::new(
            SummarizerAgent::new(dir.path(), SummarizerConfig::default(), Arc::new(BrokenGenerator))
                .unwrap(),
        );

        assert!(agent.summarize_conversation_file(&path).await.is_err());
        assert!(path.exists(), "original must survive a generator failure");
        assert!(!dir.path().join("summaries").join("stuck_summary.json").exists());
    }

    #[tokio::test]
    async fn test_start_stop_monitoring() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(
            dir.path(),
            SummarizerConfig::default(),
            Arc::new(MockGenerator::new("s")),
        );

        agent.clone().start_background_monitoring().await;
        assert_eq!(agent.status(), WorkerStatus::Monitoring);
        assert!(agent.stats().is_running);

        agent.stop_background_monitoring().await;
        assert_eq!(agent.status(), WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_manual_summarize_rejects_non_json() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(
            dir.path(),
            SummarizerConfig::default(),
            Arc::new(MockGenerator::new("s")),
        );

        let text_file = dir.path().join("notes.txt");
        std::fs::write(&text_file, "plain").unwrap();
        assert!(!agent.manual_summarize_file(&text_file).await.unwrap());
        assert!(
            !agent
                .manual_summarize_file(Path::new("/missing.json"))
                .await
                .unwrap()
        );
    }
}
