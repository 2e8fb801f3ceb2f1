//! 工具层：注册表、带超时与审计的执行器、内置研究工具

pub mod executor;
pub mod knowledge;
pub mod registry;
pub mod schema;
pub mod web_fetch;
pub mod web_search;

pub use executor::ToolExecutor;
pub use knowledge::{RetrieveKnowledgeTool, StoreResearchTool};
pub use registry::{Tool, ToolRegistry};
pub use web_fetch::WebFetchTool;
pub use web_search::WebSearchTool;
