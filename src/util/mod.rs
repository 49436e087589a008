pub mod assert;
pub mod backoff;
pub mod subscribe;

pub use assert::{assertion_error, hard_assert};
pub use backoff::{jittered_delay_millis, next_base_millis};
pub use subscribe::{Observer, PartialObserver};
