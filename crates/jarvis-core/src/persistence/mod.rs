pub mod sqlite;
pub mod traits;

pub use sqlite::SqlitePersistence;
pub use traits::{
    ChatMessage, ChatRole, CostEntry, CostRange, CostSummary, EventQueryFilter, MemoryRecord,
    MemoryTier, Persistence, PersistedEvent,
};
