//! Fleetstore Auth - the access-control boundary
//!
//! Mutating calls reach the engine only after an [`AccessGate`] turned the
//! caller's token into a [`Principal`]. [`HmacTokenGate`] validates
//! self-contained tokens signed with a shared HMAC-SHA256 key.

pub mod error;
pub mod gate;
pub mod token;

pub use error::AuthError;
pub use gate::{AccessGate, Principal};
pub use token::{HmacTokenGate, TokenClaims};
