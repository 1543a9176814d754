pub mod gate;
pub mod key;
pub mod memory;
pub mod middleware;
pub mod principal;
pub mod storage;
pub mod token;

pub use gate::{
    is_storable, ConcurrencyMode, GateConfig, GateOutcome, GateStats, GateStatsSnapshot,
    RequestGate, StoreFailurePolicy, DEFAULT_ENFORCED_METHODS, DEFAULT_HEADER_NAME,
    DEFAULT_MAX_BODY_SIZE, DEFAULT_TTL_SECONDS, REPLAY_HEADER,
};
pub use key::{normalize_method, CacheKey, KeyDeriver, KeyDeriverConfig, KeyFormat, DEFAULT_KEY_PREFIX};
pub use memory::{ExpirySweeper, InMemoryResponseStore};
pub use middleware::{idempotency_middleware, IdempotencyLayerState};
pub use principal::{
    ExtensionPrincipalResolver, HeaderPrincipalResolver, Principal, PrincipalResolver,
};
pub use storage::{RedisResponseStore, ResponseStore, StoredResponse};
pub use token::{IdempotencyToken, TokenPolicy, TokenValidator, ULID_LENGTH};
