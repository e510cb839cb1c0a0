pub mod conversation_engine;
pub mod reconciliation;

pub use conversation_engine::{ConversationEngine, SendTarget};
pub use reconciliation::{CatchUpPayload, ConversationCatchUp, ReconciliationService};
