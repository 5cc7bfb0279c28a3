//! SQLite persistence pipeline for the ticket data model.
//!
//! This crate owns the schema, the field-handler framework, the ticket
//! lifecycle (create from template, update, batch delete, comments and
//! attachments), batch population, query construction, and changelog
//! assembly. Everything runs through a single [`tokio_rusqlite`] connection;
//! each lifecycle operation is one transaction inside one `call` closure,
//! with search/mail side effects pushed after commit.

mod changelog;
mod encode;
mod error;
mod handler;
mod handlers;
mod plugin;
mod query;
mod schema;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
  changelog::{ChangelogRow, FormatError},
  error::{Error, Result},
  handler::{FieldHandler, HandlerRegistry, WriteFlags},
  handlers::{AmountFieldHandler, StdFieldHandler, WordListFieldHandler},
  plugin::TicketPlugin,
  query::{FindResults, Page, SortBy, TicketFilters},
  store::{AttachmentPayload, OpFlags, StoreConfig, TicketStore},
};
