//! Catering workflow sync contract types and validation
//!
//! This crate defines the wire types exchanged with the remote data store:
//! change-feed messages, remote procedure requests and responses, combination
//! suggestions and audit records. They are shared between the REST client,
//! the in-memory mock backend and the sync core.

pub mod error;
pub mod types;
pub mod validation;

pub use error::*;
pub use types::*;
