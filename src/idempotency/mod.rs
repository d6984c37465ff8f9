mod executor;
mod key;
mod lock;
mod phase;
pub mod store;

pub use executor::Executor;
pub use key::{IdempotencyKey, KeyRecord, RecoveryPoint, StoredResponse};
pub use lock::{Acquisition, InboundRequest, acquire, release};
pub use phase::{Outcome, Phase, PhaseContext, PhaseError};
