use std::{path::Path, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use ts_rs::TS;
use utils::path::join_confined;
use uuid::Uuid;

use super::{
    error::ErrorKind,
    swarm::{AgentDispatcher, AgentTask, TaskContext, TaskKind},
};

/// `FILE: <relpath>` header followed by a fenced content block — the wire
/// format agents are instructed to emit.
static FILE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)FILE:\s*([^\n]+?)\s*\n```[A-Za-z0-9_+.\-]*\n(.*?)\n```")
        .expect("static file-block pattern")
});

static FENCED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+.\-]*\n(.*?)\n```").expect("static fence pattern")
});

#[derive(Debug, Clone, Serialize, TS)]
pub struct UpdatedFile {
    pub path: String,
}

/// Tagged outcome instead of a `success` flag: the engine and the API layer
/// match on the variant, not on a boolean buried in a map.
#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AiUpdateOutcome {
    Ok {
        summary: String,
        files: Vec<UpdatedFile>,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        /// Writes are atomic per file; earlier files stay written when a
        /// later one fails.
        files_written: Vec<UpdatedFile>,
    },
}

impl AiUpdateOutcome {
    pub fn success(&self) -> bool {
        matches!(self, AiUpdateOutcome::Ok { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            AiUpdateOutcome::Ok { .. } => None,
            AiUpdateOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InlineOutcome {
    Ok { new_content: String },
    Failed { kind: ErrorKind, message: String },
}

/// Classification of the update prompt into a task kind, after the
/// original's keyword rules.
pub fn classify(prompt: &str) -> TaskKind {
    let lower = prompt.to_lowercase();
    if ["fix", "bug", "error", "broken", "crash"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        TaskKind::Fix
    } else if ["refactor", "rename", "clean up", "restructure", "simplify"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        TaskKind::Refactor
    } else {
        TaskKind::Generate
    }
}

pub fn parse_file_blocks(solution: &str) -> Vec<(String, String)> {
    FILE_BLOCK_RE
        .captures_iter(solution)
        .map(|caps| (caps[1].trim().to_string(), caps[2].to_string()))
        .collect()
}

fn extract_fenced(solution: &str) -> Option<String> {
    FENCED_RE
        .captures(solution)
        .map(|caps| caps[1].to_string())
}

fn splice_lines(original: &str, start: usize, end: usize, replacement: &str) -> String {
    let lines: Vec<&str> = original.lines().collect();
    let start_idx = start.saturating_sub(1).min(lines.len());
    let end_idx = end.clamp(start_idx, lines.len());
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend(&lines[..start_idx]);
    out.extend(replacement.lines());
    out.extend(&lines[end_idx..]);
    let mut joined = out.join("\n");
    if original.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

/// Applies agent-produced mutations to a workspace.
pub struct AiUpdateService {
    dispatcher: Arc<dyn AgentDispatcher>,
}

impl AiUpdateService {
    pub fn new(dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Writes one file atomically (temp + rename), confined to the
    /// workspace root.
    async fn write_confined(
        &self,
        root: &Path,
        relative: &str,
        content: &str,
    ) -> Result<(), (ErrorKind, String)> {
        let target = join_confined(root, relative)
            .map_err(|err| (ErrorKind::Precondition, err.to_string()))?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|err| (ErrorKind::Internal, err.to_string()))?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let tmp = parent.join(format!(
            ".{file_name}.tmp-{}",
            utils::text::short_uuid(&Uuid::new_v4())
        ));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|err| (ErrorKind::Internal, err.to_string()))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|err| (ErrorKind::Internal, err.to_string()))
    }

    /// Chat-driven update across the workspace: dispatches to the swarm,
    /// parses FILE blocks out of the reply, and writes each one under
    /// `workspace`.
    pub async fn apply_chat(
        &self,
        project_id: Uuid,
        workspace: &Path,
        prompt: &str,
        context: Option<serde_json::Value>,
    ) -> AiUpdateOutcome {
        let kind = classify(prompt);
        tracing::info!(%project_id, ?kind, "applying AI chat update");

        let task = AgentTask::new(kind, prompt).with_context(TaskContext {
            context_type: Some("code_update".to_string()),
            project_path: Some(workspace.display().to_string()),
            extra: context,
            ..Default::default()
        });

        let outcome = match self.dispatcher.act(&task).await {
            Ok(outcome) => outcome,
            Err(err) => {
                return AiUpdateOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                    files_written: Vec::new(),
                };
            }
        };

        let blocks = parse_file_blocks(&outcome.solution);
        if blocks.is_empty() {
            return AiUpdateOutcome::Failed {
                kind: ErrorKind::External,
                message: "agent reply contained no FILE blocks".to_string(),
                files_written: Vec::new(),
            };
        }

        let mut written: Vec<UpdatedFile> = Vec::new();
        for (relative, content) in blocks {
            if let Err((kind, message)) = self.write_confined(workspace, &relative, &content).await
            {
                tracing::warn!(path = %relative, %message, "AI update write refused");
                return AiUpdateOutcome::Failed {
                    kind,
                    message: format!("{relative}: {message}"),
                    files_written: written,
                };
            }
            // Later blocks for the same path win (a verify node re-emits
            // corrected files); keep the list unique.
            if !written.iter().any(|f| f.path == relative) {
                written.push(UpdatedFile { path: relative });
            }
        }

        AiUpdateOutcome::Ok {
            summary: format!("updated {} file(s)", written.len()),
            files: written,
        }
    }

    /// Single-file update: only the target file (and optional selection
    /// window) is sent to the agent, and the file is replaced atomically.
    pub async fn apply_inline(
        &self,
        workspace: &Path,
        file_path: &str,
        prompt: &str,
        selection: Option<(usize, usize)>,
    ) -> InlineOutcome {
        let target = match join_confined(workspace, file_path) {
            Ok(target) => target,
            Err(err) => {
                return InlineOutcome::Failed {
                    kind: ErrorKind::Precondition,
                    message: err.to_string(),
                };
            }
        };
        let original = match tokio::fs::read_to_string(&target).await {
            Ok(content) => content,
            Err(_) => {
                return InlineOutcome::Failed {
                    kind: ErrorKind::NotFound,
                    message: format!("file {file_path} not found in workspace"),
                };
            }
        };

        let window = match selection {
            Some((start, end)) => original
                .lines()
                .skip(start.saturating_sub(1))
                .take(end.saturating_sub(start.saturating_sub(1)).max(1))
                .collect::<Vec<_>>()
                .join("\n"),
            None => original.clone(),
        };

        let task_prompt = format!(
            "{prompt}\n\nFile: {file_path}\n```\n{window}\n```",
        );
        let task = AgentTask::new(classify(prompt), task_prompt).with_context(TaskContext {
            context_type: Some("inline_edit".to_string()),
            project_path: Some(workspace.display().to_string()),
            ..Default::default()
        });

        let solution = match self.dispatcher.act(&task).await {
            Ok(outcome) => outcome.solution,
            Err(err) => {
                return InlineOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                };
            }
        };

        let replacement = extract_fenced(&solution).unwrap_or_else(|| solution.trim().to_string());
        if replacement.is_empty() {
            return InlineOutcome::Failed {
                kind: ErrorKind::External,
                message: "agent returned empty content".to_string(),
            };
        }

        let new_content = match selection {
            Some((start, end)) => splice_lines(&original, start, end, &replacement),
            None => replacement,
        };

        if let Err((kind, message)) = self
            .write_confined(workspace, file_path, &new_content)
            .await
        {
            return InlineOutcome::Failed { kind, message };
        }
        InlineOutcome::Ok { new_content }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::services::swarm::{SwarmError, SwarmOutcome};

    use super::*;

    struct ScriptedDispatcher {
        solution: Result<String, ()>,
    }

    #[async_trait]
    impl AgentDispatcher for ScriptedDispatcher {
        async fn act(&self, _task: &AgentTask) -> Result<SwarmOutcome, SwarmError> {
            match &self.solution {
                Ok(solution) => Ok(SwarmOutcome {
                    solution: solution.clone(),
                    worker_results: Vec::new(),
                    decomposition: Vec::new(),
                }),
                Err(()) => Err(SwarmError::Llm(llm::LlmError::Unavailable(
                    "backend down".to_string(),
                ))),
            }
        }
    }

    fn service(solution: &str) -> AiUpdateService {
        AiUpdateService::new(Arc::new(ScriptedDispatcher {
            solution: Ok(solution.to_string()),
        }))
    }

    #[test]
    fn classify_follows_keyword_rules() {
        assert_eq!(classify("fix the login bug"), TaskKind::Fix);
        assert_eq!(classify("please refactor the parser"), TaskKind::Refactor);
        assert_eq!(classify("rename greet to hello"), TaskKind::Refactor);
        assert_eq!(classify("add a dark mode toggle"), TaskKind::Generate);
    }

    #[test]
    fn file_blocks_parse_paths_and_content() {
        let reply = "intro\nFILE: src/app.js\n```js\nconsole.log(1);\n```\n\nFILE: README.md\n```\n# hi\n```";
        let blocks = parse_file_blocks(reply);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, "src/app.js");
        assert_eq!(blocks[0].1, "console.log(1);");
        assert_eq!(blocks[1].0, "README.md");
    }

    #[tokio::test]
    async fn apply_chat_writes_files_under_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service("FILE: src/deep/mod.rs\n```rust\npub fn hello() {}\n```");

        let outcome = svc
            .apply_chat(Uuid::new_v4(), dir.path(), "add hello", None)
            .await;
        match outcome {
            AiUpdateOutcome::Ok { files, .. } => {
                assert_eq!(files.len(), 1);
                assert_eq!(
                    std::fs::read_to_string(dir.path().join("src/deep/mod.rs")).unwrap(),
                    "pub fn hello() {}"
                );
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn escaping_paths_fail_but_keep_earlier_writes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(
            "FILE: ok.txt\n```\nfine\n```\nFILE: ../evil.txt\n```\nnope\n```",
        );

        let outcome = svc
            .apply_chat(Uuid::new_v4(), dir.path(), "update", None)
            .await;
        match outcome {
            AiUpdateOutcome::Failed {
                kind,
                files_written,
                ..
            } => {
                assert_eq!(kind, ErrorKind::Precondition);
                assert_eq!(files_written.len(), 1);
                assert!(dir.path().join("ok.txt").exists());
                assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_without_blocks_is_external_failure() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service("I could not figure out what to change.");
        let outcome = svc
            .apply_chat(Uuid::new_v4(), dir.path(), "update", None)
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::External));
    }

    #[tokio::test]
    async fn dispatcher_failure_maps_to_external() {
        let dir = tempfile::tempdir().unwrap();
        let svc = AiUpdateService::new(Arc::new(ScriptedDispatcher { solution: Err(()) }));
        let outcome = svc
            .apply_chat(Uuid::new_v4(), dir.path(), "update", None)
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::External));
    }

    #[tokio::test]
    async fn inline_update_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print('old')\n").unwrap();
        let svc = service("Here you go:\n```python\nprint('new')\n```");

        let outcome = svc
            .apply_inline(dir.path(), "main.py", "modernize the print", None)
            .await;
        match outcome {
            InlineOutcome::Ok { new_content } => {
                assert_eq!(new_content, "print('new')");
                assert_eq!(
                    std::fs::read_to_string(dir.path().join("main.py")).unwrap(),
                    "print('new')"
                );
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inline_update_with_selection_splices_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "one\ntwo\nthree\n").unwrap();
        let svc = service("```\nTWO\n```");

        let outcome = svc
            .apply_inline(dir.path(), "f.txt", "uppercase line two", Some((2, 2)))
            .await;
        match outcome {
            InlineOutcome::Ok { new_content } => {
                assert_eq!(new_content, "one\nTWO\nthree\n");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inline_update_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service("```\nx\n```");
        let outcome = svc.apply_inline(dir.path(), "nope.txt", "edit", None).await;
        assert!(matches!(
            outcome,
            InlineOutcome::Failed {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
    }
}
