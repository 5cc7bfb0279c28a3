//! SQLite schema bootstrap.
//!
//! One header table (`tickets`), narrow per-storage-class value tables, the
//! changelog, and the two definition tables. Value tables keep their own
//! rowid primary key (`i`) because the changelog references individual value
//! rows; scalar history works by soft-orphaning superseded rows (`ticket_id`
//! set to NULL) rather than deleting them.

use rusqlite::Connection;

pub(crate) const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS tickets (
    i            INTEGER PRIMARY KEY,
    template     TEXT,
    type_id      INTEGER NOT NULL,
    aid          INTEGER NOT NULL DEFAULT 0,
    owner_uid    INTEGER NOT NULL,
    created_dt   TEXT    NOT NULL,
    lastmod_uid  INTEGER NOT NULL,
    lastmod_dt   TEXT    NOT NULL,
    created_from INTEGER
  );

  CREATE TABLE IF NOT EXISTS ticket_ints (
    i         INTEGER PRIMARY KEY,
    ticket_id INTEGER,
    field_id  INTEGER NOT NULL,
    value     INTEGER
  );
  CREATE INDEX IF NOT EXISTS idx_ticket_ints_ticket
    ON ticket_ints (ticket_id, field_id);
  CREATE INDEX IF NOT EXISTS idx_ticket_ints_value
    ON ticket_ints (field_id, value);

  CREATE TABLE IF NOT EXISTS ticket_texts (
    i         INTEGER PRIMARY KEY,
    ticket_id INTEGER,
    field_id  INTEGER NOT NULL,
    value     TEXT
  );
  CREATE INDEX IF NOT EXISTS idx_ticket_texts_ticket
    ON ticket_texts (ticket_id, field_id);

  CREATE TABLE IF NOT EXISTS ticket_amounts (
    i         INTEGER PRIMARY KEY,
    ticket_id INTEGER,
    field_id  INTEGER NOT NULL,
    value     TEXT
  );
  CREATE INDEX IF NOT EXISTS idx_ticket_amounts_ticket
    ON ticket_amounts (ticket_id, field_id);

  CREATE TABLE IF NOT EXISTS ticket_categories (
    i         INTEGER PRIMARY KEY,
    ticket_id INTEGER,
    field_id  INTEGER NOT NULL,
    value     INTEGER
  );
  CREATE INDEX IF NOT EXISTS idx_ticket_categories_ticket
    ON ticket_categories (ticket_id, field_id);
  CREATE INDEX IF NOT EXISTS idx_ticket_categories_value
    ON ticket_categories (field_id, value);

  CREATE TABLE IF NOT EXISTS ticket_parents (
    i         INTEGER PRIMARY KEY,
    ticket_id INTEGER,
    field_id  INTEGER NOT NULL,
    value     INTEGER NOT NULL,
    count     INTEGER NOT NULL DEFAULT 1
  );
  CREATE INDEX IF NOT EXISTS idx_ticket_parents_ticket
    ON ticket_parents (ticket_id, field_id);
  CREATE INDEX IF NOT EXISTS idx_ticket_parents_value
    ON ticket_parents (field_id, value);

  CREATE TABLE IF NOT EXISTS keyword_defs (
    i    INTEGER PRIMARY KEY,
    word TEXT NOT NULL UNIQUE
  );

  CREATE TABLE IF NOT EXISTS ticket_words (
    i         INTEGER PRIMARY KEY,
    ticket_id INTEGER,
    field_id  INTEGER NOT NULL,
    value     INTEGER NOT NULL
  );
  CREATE INDEX IF NOT EXISTS idx_ticket_words_ticket
    ON ticket_words (ticket_id, field_id);

  -- Negative size means the payload lives on the filesystem at `path`
  -- instead of in `data`.
  CREATE TABLE IF NOT EXISTS ticket_binaries (
    i         INTEGER PRIMARY KEY,
    ticket_id INTEGER,
    field_id  INTEGER NOT NULL,
    filename  TEXT    NOT NULL,
    mime      TEXT    NOT NULL,
    size      INTEGER NOT NULL,
    data      BLOB,
    path      TEXT
  );
  CREATE INDEX IF NOT EXISTS idx_ticket_binaries_ticket
    ON ticket_binaries (ticket_id, field_id);

  -- `what` is the subject ticket id. value_1/value_2 reference value-table
  -- rows (old/new); value_str carries array diff tokens and event payloads.
  CREATE TABLE IF NOT EXISTS changelog (
    i         INTEGER PRIMARY KEY,
    field_id  INTEGER NOT NULL,
    what      INTEGER NOT NULL,
    chg_uid   INTEGER NOT NULL,
    chg_dt    TEXT    NOT NULL,
    value_1   INTEGER,
    value_2   INTEGER,
    value_str TEXT
  );
  CREATE INDEX IF NOT EXISTS idx_changelog_what ON changelog (what);

  CREATE TABLE IF NOT EXISTS field_defs (
    i        INTEGER PRIMARY KEY,
    name     TEXT NOT NULL,
    tblname  TEXT,
    ordering INTEGER NOT NULL DEFAULT 0
  );

  CREATE TABLE IF NOT EXISTS ticket_types (
    i              INTEGER PRIMARY KEY,
    name           TEXT NOT NULL,
    field_ids      TEXT NOT NULL,
    list_field_ids TEXT NOT NULL,
    automatic      TEXT NOT NULL DEFAULT '',
    parent_type    INTEGER
  );
";

/// Apply pragmas and create any missing tables. Idempotent.
pub(crate) fn apply(conn: &Connection) -> rusqlite::Result<()> {
  conn.pragma_update(None, "journal_mode", "WAL")?;
  conn.pragma_update(None, "foreign_keys", "ON")?;
  conn.execute_batch(SCHEMA)?;

  let version: i32 =
    conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
  if version < SCHEMA_VERSION {
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
  }
  Ok(())
}
