pub mod event_bus;
pub mod lifecycle;
pub mod prompts;
pub mod streaming_session;
pub mod token_budget;

pub use event_bus::{ConversationEvent, EventBus};
pub use lifecycle::{LifecycleOptions, SessionLifecycleManager};
pub use prompts::{render_prompt, PromptType};
pub use streaming_session::{ChunkStream, SessionId, StreamingSession};
pub use token_budget::{TokenBudget, TokenBudgetEstimator};
