//! In-memory session storage.

mod session_store;

pub use session_store::{SessionStore, SESSION_CAPACITY};
