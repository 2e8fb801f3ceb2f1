//! 知识库工具：store_research / retrieve_knowledge
//!
//! 包装共享的 KnowledgeStore；存取失败只告警并返回空结果，不让一次存取失败中断研究。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::memory::{KnowledgeStore, UNKNOWN_SOURCE};
use crate::tools::schema::{parameters_for, parse_args, RetrieveKnowledgeArgs, StoreResearchArgs};
use crate::tools::Tool;

pub struct StoreResearchTool {
    store: Arc<dyn KnowledgeStore>,
}

impl StoreResearchTool {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for StoreResearchTool {
    fn name(&self) -> &str {
        "store_research"
    }

    fn description(&self) -> &str {
        "Store research text in the knowledge store so later stages can retrieve it. Returns the stored document id."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<StoreResearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: StoreResearchArgs = parse_args(args)?;
        let source = args.source.as_deref().unwrap_or("research");
        let source_url = args.source_url.as_deref().unwrap_or(UNKNOWN_SOURCE);
        match self.store.store(&args.text, source, source_url) {
            Ok(id) => Ok(id),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to store research");
                Ok(String::new())
            }
        }
    }
}

pub struct RetrieveKnowledgeTool {
    store: Arc<dyn KnowledgeStore>,
}

impl RetrieveKnowledgeTool {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for RetrieveKnowledgeTool {
    fn name(&self) -> &str {
        "retrieve_knowledge"
    }

    fn description(&self) -> &str {
        "Retrieve previously stored research entries similar to the query, with their source URLs."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<RetrieveKnowledgeArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: RetrieveKnowledgeArgs = parse_args(args)?;
        let hits = self
            .store
            .retrieve(&args.query, args.k.unwrap_or(3))
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to retrieve knowledge");
                Vec::new()
            });
        let entries: Vec<Value> = hits
            .into_iter()
            .map(|h| json!({ "text": h.text, "source_url": h.source_locator }))
            .collect();
        Ok(Value::Array(entries).to_string())
    }
}
