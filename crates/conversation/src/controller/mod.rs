pub mod conversation;
pub mod handle;

pub use conversation::ConversationController;
pub use handle::ConversationHandle;
