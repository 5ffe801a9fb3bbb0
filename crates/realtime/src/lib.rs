//! Realtime core: session tracking, presence, ephemeral caching, message
//! pipeline and event fan-out. Components are constructed once at process
//! start and passed explicitly to whoever needs them.

pub mod cache;
pub mod conversations;
pub mod dispatch;
pub mod pipeline;
pub mod presence;
pub mod session;

pub use cache::EphemeralCache;
pub use conversations::ConversationService;
pub use dispatch::Dispatcher;
pub use pipeline::MessagePipeline;
pub use presence::PresenceTracker;
pub use session::SessionRegistry;
