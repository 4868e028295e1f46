pub mod envelope;
pub mod ids;

pub use envelope::{Envelope, EnvelopeError, derive_default_lock_key};
pub use ids::{db_id, fingerprint_hex, short_hash};
