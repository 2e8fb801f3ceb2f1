//! 知识库：研究产出分块写入，按关键词相似度检索
//!
//! - `chunk_text`：按字符切块（UTF-8 安全），相邻块重叠 overlap 个字符
//! - `KnowledgeIndex`：RwLock 保护的内存索引，可选 JSONL 文件持久化（追加写、启动时重载）
//! - 打分：jieba 分词后的 Jaccard 相似度；同分按写入顺序

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::tokenizer::{jaccard_similarity, tokenize_to_set};

/// 无法确定来源时使用的定位符
pub const UNKNOWN_SOURCE: &str = "unknown";

/// 检索命中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub id: String,
    pub text: String,
    pub source: String,
    pub source_locator: String,
    pub score: f32,
}

/// 知识库接口：写入（返回文档 id，空白文本不写入并返回空 id）与 top-k 检索
pub trait KnowledgeStore: Send + Sync {
    fn store(&self, text: &str, source: &str, source_locator: &str) -> Result<String, AgentError>;

    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<KnowledgeHit>, AgentError>;
}

/// 按字符切块：块长 size，相邻块重叠 overlap（超过 size-1 时截断为 size-1）
///
/// 空文本返回空列表；size 为 0 时整段作为一个块。
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if size == 0 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    let overlap = overlap.min(size - 1);
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }
    chunks
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChunk {
    id: String,
    text: String,
    source: String,
    source_locator: String,
    created_at: DateTime<Utc>,
}

struct IndexedChunk {
    chunk: StoredChunk,
    tokens: std::collections::HashSet<String>,
}

impl From<StoredChunk> for IndexedChunk {
    fn from(chunk: StoredChunk) -> Self {
        let tokens = tokenize_to_set(&chunk.text);
        Self { chunk, tokens }
    }
}

/// 内存索引 + 可选 JSONL 文件
pub struct KnowledgeIndex {
    chunks: RwLock<Vec<IndexedChunk>>,
    path: Option<PathBuf>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl KnowledgeIndex {
    /// 纯内存索引（测试 / 不需要持久化时）
    pub fn in_memory(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            path: None,
            chunk_size,
            chunk_overlap,
        }
    }

    /// 打开 JSONL 文件；文件不存在时视为空库，无法解析的行跳过并告警
    pub fn open(
        path: impl AsRef<Path>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<Self, AgentError> {
        let path = path.as_ref().to_path_buf();
        let mut chunks = Vec::new();
        if path.exists() {
            let file = fs::File::open(&path)
                .map_err(|e| AgentError::Knowledge(format!("open {}: {}", path.display(), e)))?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| AgentError::Knowledge(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredChunk>(&line) {
                    Ok(chunk) => chunks.push(IndexedChunk::from(chunk)),
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping malformed knowledge entry"
                    ),
                }
            }
        }
        tracing::info!(path = %path.display(), chunks = chunks.len(), "Knowledge index loaded");
        Ok(Self {
            chunks: RwLock::new(chunks),
            path: Some(path),
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_to_file(&self, new_chunks: &[StoredChunk]) -> Result<(), AgentError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| AgentError::Knowledge(e.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AgentError::Knowledge(format!("open {}: {}", path.display(), e)))?;
        for chunk in new_chunks {
            let line =
                serde_json::to_string(chunk).map_err(|e| AgentError::Knowledge(e.to_string()))?;
            writeln!(file, "{}", line).map_err(|e| AgentError::Knowledge(e.to_string()))?;
        }
        Ok(())
    }
}

impl KnowledgeStore for KnowledgeIndex {
    fn store(&self, text: &str, source: &str, source_locator: &str) -> Result<String, AgentError> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        let doc_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let new_chunks: Vec<StoredChunk> = chunk_text(text, self.chunk_size, self.chunk_overlap)
            .into_iter()
            .filter(|piece| !piece.trim().is_empty())
            .enumerate()
            .map(|(i, piece)| StoredChunk {
                id: format!("{}-{}", doc_id, i),
                text: piece,
                source: source.to_string(),
                source_locator: source_locator.to_string(),
                created_at: now,
            })
            .collect();

        let count = new_chunks.len();
        let mut chunks = self
            .chunks
            .write()
            .map_err(|_| AgentError::Knowledge("index lock poisoned".to_string()))?;
        // 持写锁落盘再进索引：并发写入的 JSONL 行不交错，写文件失败时内存与文件一致
        self.append_to_file(&new_chunks)?;
        chunks.extend(new_chunks.into_iter().map(IndexedChunk::from));
        tracing::debug!(id = %doc_id, source, source_locator, chunks = count, "Stored research");
        Ok(doc_id)
    }

    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<KnowledgeHit>, AgentError> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_tokens = tokenize_to_set(query);
        let chunks = self
            .chunks
            .read()
            .map_err(|_| AgentError::Knowledge("index lock poisoned".to_string()))?;

        let mut scored: Vec<(f32, usize)> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (jaccard_similarity(&query_tokens, &c.tokens), i))
            .collect();
        // 稳定排序：同分保持写入顺序
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, i)| {
                let c = &chunks[i].chunk;
                KnowledgeHit {
                    id: c.id.clone(),
                    text: c.text.clone(),
                    source: c.source.clone(),
                    source_locator: c.source_locator.clone(),
                    score,
                }
            })
            .collect())
    }
}
