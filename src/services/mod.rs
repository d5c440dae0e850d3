pub mod audit;
pub mod console;
pub mod llm;
pub mod radio;

pub use audit::AuditLog;
pub use console::ConsoleRadio;
pub use llm::{ChatMessage, LlmClient, OllamaClient, SharedLlm};
pub use radio::{RadioLink, SharedRadio};
