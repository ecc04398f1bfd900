//! External Callback object subclasses referenced by the object graph but
//! not mandated by it: a demonstrative Credentials object and a
//! shared-memory-backed Memory object.

pub mod credentials;
pub mod memory;

pub use credentials::CredentialsObject;
pub use memory::{Memory, MemoryBackend, StubMemoryBackend};
