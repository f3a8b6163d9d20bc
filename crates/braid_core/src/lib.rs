//! Shared foundation of the braid commit pipeline: primitive types, the
//! tagged-message codec, collaborator contracts, process knobs, and the
//! peek-cursor layer consumed by storage servers.

pub mod clock;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod interfaces;
pub mod knobs;
pub mod message;
pub mod mutation;
pub mod smoother;
pub mod timed_cache;
pub mod types;
pub mod watch;

pub use error::{Error, Result};
pub use knobs::Knobs;
pub use types::{Subsequence, Tag, Version};
