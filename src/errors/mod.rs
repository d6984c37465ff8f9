mod idempotency;
mod rides;

pub use idempotency::*;
pub use rides::*;
