//! Core types and trait definitions for the Doreen ticket pipeline.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! It holds the field metadata model, the tagged field-value representation,
//! the ticket aggregate, the per-operation context, and the traits behind
//! which the search index, mail delivery, and access control live.
//! The persistence pipeline depends on this crate, not the other way round.

pub mod context;
pub mod error;
pub mod field;
pub mod registry;
pub mod sink;
pub mod ticket;
pub mod value;

pub use error::{Error, Result};
