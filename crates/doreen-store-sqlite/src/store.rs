//! The ticket store: lifecycle operations over one SQLite connection.
//!
//! Each operation is a single `call` into the connection task running one
//! transaction; field handlers execute synchronously inside it. Search and
//! mail side effects fire after the transaction commits (delete's index
//! removal is the one pre-commit exception), so a rollback never leaves
//! phantom notifications behind.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  path::Path,
  sync::{Arc, Mutex, PoisonError},
};

use bitflags::bitflags;
use chrono::Utc;
use doreen_core::{
  Error as CoreError,
  context::{TicketContext, TicketMode, UserRef},
  field::{
    FIELD_ATTACHMENT, FIELD_ATTACHMENT_DELETED, FIELD_COMMENT,
    FIELD_COMMENT_DELETED, FIELD_COMMENT_UPDATED, FIELD_TEMPLATE_DELETED,
    FIELD_TICKET_CREATED, FIELD_TITLE, FieldFlags, FieldId, TicketField,
  },
  registry::{FieldRegistry, builtin_registry},
  sink::{
    AccessFlags, AccessResolver, MailSink, NullMailSink, NullSearchSink,
    OpenAccess, SearchRequest, SearchSink,
  },
  ticket::{DetailLevel, Ticket, TicketSet, TicketType},
  value::FieldValue,
};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::{
  changelog::{self, ChangelogRow},
  encode::{decode_dt, decode_field_ids, encode_dt, encode_field_ids},
  error::{Error, Result, call_err},
  handler::{HandlerRegistry, WriteFlags, html_escape},
  handlers::builtin_handlers,
  plugin::TicketPlugin,
  query::{self, FindResults, Page, SortBy, TicketFilters},
  schema,
};

// ─── Flags ───────────────────────────────────────────────────────────────────

bitflags! {
  /// Per-call lifecycle modifiers.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct OpFlags: u32 {
    /// Suppress the aggregate notification mail.
    const NO_MAIL = 1 << 0;
    /// Suppress changelog rows (migrations, imports).
    const NO_CHANGELOG = 1 << 1;
    /// Skip the search-index push.
    const NO_INDEX = 1 << 2;
    /// Absent required fields do not fail the operation.
    const IGNORE_MISSING = 1 << 3;
  }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Startup wiring: plugins plus the three boundary collaborators.
pub struct StoreConfig {
  pub plugins:        Vec<Arc<dyn TicketPlugin>>,
  pub search:         Arc<dyn SearchSink>,
  pub mail:           Arc<dyn MailSink>,
  pub access:         Arc<dyn AccessResolver>,
  pub mail_from_addr: String,
  pub mail_from_name: String,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      plugins:        Vec::new(),
      search:         Arc::new(NullSearchSink),
      mail:           Arc::new(NullMailSink),
      access:         Arc::new(OpenAccess),
      mail_from_addr: "doreen@localhost".to_owned(),
      mail_from_name: "Doreen".to_owned(),
    }
  }
}

// ─── Store ───────────────────────────────────────────────────────────────────

struct StoreInner {
  registry:  FieldRegistry,
  handlers:  HandlerRegistry,
  types:     Mutex<HashMap<i64, TicketType>>,
  search:    Arc<dyn SearchSink>,
  mail:      Arc<dyn MailSink>,
  access:    Arc<dyn AccessResolver>,
  from_addr: String,
  from_name: String,
}

impl StoreInner {
  fn ticket_type(&self, id: i64) -> Option<TicketType> {
    self
      .types
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&id)
      .cloned()
  }
}

/// Handle to one ticket database. Cheap to clone; all clones share the
/// connection task and the startup-built registries.
#[derive(Clone)]
pub struct TicketStore {
  conn:  tokio_rusqlite::Connection,
  inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TicketStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TicketStore").finish_non_exhaustive()
  }
}

impl TicketStore {
  pub async fn open(
    path: impl AsRef<Path>,
    config: StoreConfig,
  ) -> Result<Self> {
    let conn =
      tokio_rusqlite::Connection::open(path.as_ref().to_owned()).await?;
    Self::init(conn, config).await
  }

  pub async fn open_in_memory(config: StoreConfig) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn, config).await
  }

  async fn init(
    conn: tokio_rusqlite::Connection,
    config: StoreConfig,
  ) -> Result<Self> {
    // Registry assembly is fail-fast: duplicate ids or misconfigured boosts
    // abort startup here, never at request time.
    let mut builder = builtin_registry()?;
    for plugin in &config.plugins {
      for field in plugin.field_defs() {
        builder.register(field)?;
      }
    }
    for plugin in &config.plugins {
      for (id, boost) in plugin.search_boosts() {
        builder.register_search_boost(id, boost)?;
      }
      for id in plugin.drill_down_ids() {
        builder.register_drill_down(id);
      }
    }
    let registry = builder.build();
    let handlers = HandlerRegistry::build(&config.plugins, builtin_handlers())?;

    let field_rows: Vec<(i32, String, Option<String>, i32)> = registry
      .iter()
      .map(|f| (f.id.0, f.name.clone(), f.storage_table.clone(), f.ordering))
      .collect();
    let known_ids: HashSet<i32> = field_rows.iter().map(|r| r.0).collect();

    let types = conn
      .call(move |conn| {
        schema::apply(conn)?;
        let tx = conn.transaction()?;

        // Mirror the registry into field_defs so raw-SQL consumers can name
        // fields, then refuse to start if the database knows fields we
        // do not.
        for (id, name, table, ordering) in &field_rows {
          tx.execute(
            "INSERT INTO field_defs (i, name, tblname, ordering) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (i) DO UPDATE SET name = ?2, tblname = ?3, \
             ordering = ?4",
            params![id, name, table, ordering],
          )?;
        }
        let mut stmt = tx.prepare("SELECT i FROM field_defs")?;
        let persisted = stmt
          .query_map([], |row| row.get::<_, i32>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for id in persisted {
          if !known_ids.contains(&id) {
            return Err(call_err(CoreError::UnknownField(FieldId(id))));
          }
        }

        let mut stmt = tx.prepare(
          "SELECT i, name, field_ids, list_field_ids, automatic, \
           parent_type FROM ticket_types",
        )?;
        let types = stmt
          .query_map([], |row| {
            let field_ids: String = row.get(2)?;
            let list_field_ids: String = row.get(3)?;
            let automatic: String = row.get(4)?;
            Ok(TicketType {
              id:             row.get(0)?,
              name:           row.get(1)?,
              field_ids:      decode_field_ids(&field_ids),
              list_field_ids: decode_field_ids(&list_field_ids),
              automatic:      decode_field_ids(&automatic),
              parent_type_id: row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        tx.commit()?;
        Ok(types.into_iter().map(|t| (t.id, t)).collect::<HashMap<_, _>>())
      })
      .await
      .map_err(Error::from_call)?;

    info!(types = types.len(), "ticket store opened");
    Ok(Self {
      conn,
      inner: Arc::new(StoreInner {
        registry,
        handlers,
        types: Mutex::new(types),
        search: config.search,
        mail: config.mail,
        access: config.access,
        from_addr: config.mail_from_addr,
        from_name: config.mail_from_name,
      }),
    })
  }

  // ── Type administration ───────────────────────────────────────────────────

  /// Persist a ticket type definition and cache it.
  pub async fn define_type(&self, ticket_type: TicketType) -> Result<()> {
    let row = ticket_type.clone();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO ticket_types (i, name, field_ids, \
           list_field_ids, automatic, parent_type) VALUES \
           (?1, ?2, ?3, ?4, ?5, ?6)",
          params![
            row.id,
            row.name,
            encode_field_ids(&row.field_ids),
            encode_field_ids(&row.list_field_ids),
            encode_field_ids(&row.automatic),
            row.parent_type_id
          ],
        )?;
        Ok(())
      })
      .await
      .map_err(Error::from_call)?;
    self
      .inner
      .types
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(ticket_type.id, ticket_type);
    Ok(())
  }

  pub fn ticket_type(&self, id: i64) -> Option<TicketType> {
    self.inner.ticket_type(id)
  }

  // ── Template creation ─────────────────────────────────────────────────────

  /// Create a template ticket: a named prototype regular tickets are copied
  /// from. Templates are neither indexed nor announced, and missing
  /// required fields are allowed (the template only provides defaults).
  pub async fn create_template(
    &self,
    user: UserRef,
    name: String,
    type_id: i64,
    access_list_id: i64,
    input: HashMap<String, String>,
  ) -> Result<i64> {
    let inner = self.inner.clone();
    let ticket = self
      .conn
      .call(move |conn| {
        let ttype = inner
          .ticket_type(type_id)
          .ok_or_else(|| call_err(CoreError::InvalidTypeId(type_id)))?;
        let now = Utc::now();
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO tickets (template, type_id, aid, owner_uid, \
           created_dt, lastmod_uid, lastmod_dt, created_from) VALUES \
           (?1, ?2, ?3, ?4, ?5, ?4, ?5, NULL)",
          params![name, type_id, access_list_id, user.uid, encode_dt(now)],
        )?;
        let id = tx.last_insert_rowid();

        let mut ticket = new_ticket_instance(id, type_id, access_list_id,
          &user, now);
        ticket.template = Some(name);
        let mut ctx =
          TicketContext::new(user, TicketMode::Create, input);
        run_field_loop(
          &tx,
          &inner,
          &ttype,
          &mut ctx,
          &mut ticket,
          None,
          WriteFlags::NO_CHANGELOG | WriteFlags::IGNORE_MISSING,
        )
        .map_err(Error::into_call)?;

        tx.commit()?;
        Ok(ticket)
      })
      .await
      .map_err(Error::from_call)?;
    Ok(ticket.id)
  }

  // ── Create from template ──────────────────────────────────────────────────

  /// The one factory for regular tickets: copy identity from a template,
  /// run the field loop over the request input, record a single synthetic
  /// creation event, and announce the result once after commit.
  ///
  /// `force_id` pins the new ticket's id, for importers that must preserve
  /// numbering; normally the database assigns the next one.
  pub async fn create_another(
    &self,
    set: &mut TicketSet,
    template_id: i64,
    user: UserRef,
    input: HashMap<String, String>,
    use_parent_type: bool,
    force_id: Option<i64>,
    flags: OpFlags,
  ) -> Result<i64> {
    if !self.access_of(&user).contains(AccessFlags::CREATE) {
      return Err(CoreError::InvalidTemplateId(template_id).into());
    }
    let inner = self.inner.clone();
    let (ticket, mut ctx) = self
      .conn
      .call(move |conn| {
        let headers = query::fetch_headers(conn, &[template_id])
          .map_err(Error::into_call)?;
        let Some(template) = headers.into_iter().next() else {
          return Err(call_err(CoreError::InvalidTemplateId(template_id)));
        };
        if !template.is_template() {
          return Err(call_err(CoreError::NotATemplate(template_id)));
        }

        let base_type = inner.ticket_type(template.type_id).ok_or_else(|| {
          call_err(CoreError::InvalidTypeId(template.type_id))
        })?;
        let ttype = if use_parent_type {
          let parent = base_type.parent_type_id.ok_or_else(|| {
            call_err(CoreError::TypeMismatch(format!(
              "type {} has no parent type",
              base_type.id
            )))
          })?;
          inner
            .ticket_type(parent)
            .ok_or_else(|| call_err(CoreError::InvalidTypeId(parent)))?
        } else {
          base_type
        };

        // Template field values feed the mapped-through copies.
        let mut template_set = TicketSet::new();
        template_set.insert(template);
        let fields: Vec<&TicketField> = ttype
          .field_ids
          .iter()
          .filter_map(|id| inner.registry.find(*id).ok())
          .collect();
        query::populate_fields(
          conn,
          &inner.registry,
          &mut template_set,
          &[template_id],
          &fields,
          DetailLevel::Details,
        )
        .map_err(Error::into_call)?;
        let Some(template) = template_set.take(template_id) else {
          return Err(call_err(CoreError::InvalidTemplateId(template_id)));
        };

        let now = Utc::now();
        let tx = conn.transaction()?;
        // A NULL id lets the database assign one; imports force their own.
        tx.execute(
          "INSERT INTO tickets (i, template, type_id, aid, owner_uid, \
           created_dt, lastmod_uid, lastmod_dt, created_from) VALUES \
           (?1, NULL, ?2, ?3, ?4, ?5, ?4, ?5, ?6)",
          params![
            force_id,
            ttype.id,
            template.access_list_id,
            user.uid,
            encode_dt(now),
            template_id
          ],
        )?;
        let id = force_id.unwrap_or_else(|| tx.last_insert_rowid());

        let mut ticket = new_ticket_instance(
          id,
          ttype.id,
          template.access_list_id,
          &user,
          now,
        );
        ticket.created_from = Some(template_id);
        let mut ctx = TicketContext::new(user, TicketMode::Create, input);

        // Per-field changelog rows are suppressed during creation; the
        // single synthetic event below is the audit record.
        let mut write_flags = WriteFlags::NO_CHANGELOG;
        if flags.contains(OpFlags::IGNORE_MISSING) {
          write_flags |= WriteFlags::IGNORE_MISSING;
        }
        run_field_loop(
          &tx,
          &inner,
          &ttype,
          &mut ctx,
          &mut ticket,
          Some(&template),
          write_flags,
        )
        .map_err(Error::into_call)?;

        if !flags.contains(OpFlags::NO_CHANGELOG) {
          changelog::insert_row(
            &tx,
            FIELD_TICKET_CREATED,
            id,
            ctx.user.uid,
            now,
            None,
            None,
            None,
          )?;
        }
        tx.commit()?;

        // Creation mail lines come from the final field values, since the
        // per-field loop ran changelog-suppressed.
        for &fid in &ttype.field_ids {
          let Ok(field) = inner.registry.find(fid) else { continue };
          if field.flags.skipped_on_write() {
            continue;
          }
          let value = ticket.field_value(fid);
          if value.is_empty() {
            continue;
          }
          let Ok(handler) = inner.handlers.get(fid) else { continue };
          let rendered = handler.format_value(field, &value);
          ctx.notification.push_line(
            format!(
              "<b>{}:</b> {}",
              html_escape(&field.name),
              html_escape(&rendered)
            ),
            format!("{}: {rendered}", field.name),
          );
        }
        Ok((ticket, ctx))
      })
      .await
      .map_err(Error::from_call)?;

    if !flags.contains(OpFlags::NO_INDEX) {
      self.inner.search.on_ticket_created(&ticket);
    }
    if !flags.contains(OpFlags::NO_MAIL) && !ctx.notification.is_empty() {
      if let Some(email) = ctx.user.email.clone() {
        let title = ticket.field_value(FIELD_TITLE).format_plain();
        let subject =
          format!("[Doreen] Ticket #{} created: {title}", ticket.id);
        let notification =
          std::mem::take(&mut ctx.notification);
        self.inner.mail.enqueue(notification.into_mail(
          &email,
          subject,
          &self.inner.from_addr,
          &self.inner.from_name,
        ));
      }
    }

    let id = ticket.id;
    set.insert(ticket);
    Ok(id)
  }

  // ── Update ────────────────────────────────────────────────────────────────

  /// Apply request input to an existing ticket. Returns the number of
  /// changed fields. At most one aggregate notification mail is sent, after
  /// commit, regardless of how many fields changed.
  pub async fn update(
    &self,
    set: &mut TicketSet,
    ticket_id: i64,
    user: UserRef,
    input: HashMap<String, String>,
    flags: OpFlags,
  ) -> Result<usize> {
    if !self.access_of(&user).contains(AccessFlags::UPDATE) {
      // Forbidden and nonexistent are indistinguishable to the caller.
      return Err(CoreError::InvalidTicketId(ticket_id).into());
    }

    let needs_populate = set
      .get(ticket_id)
      .map(|t| t.populated < DetailLevel::Details)
      .unwrap_or(true);
    if needs_populate {
      self.fetch(set, &[ticket_id]).await?;
      self.populate(set, &[ticket_id], DetailLevel::Details).await?;
    }
    {
      let ticket = set
        .get(ticket_id)
        .ok_or(CoreError::InvalidTicketId(ticket_id))?;
      if ticket.is_template() {
        return Err(CoreError::IsATemplate(ticket_id).into());
      }
    }
    let Some(original) = set.take(ticket_id) else {
      return Err(CoreError::InvalidTicketId(ticket_id).into());
    };
    let snapshot = original.clone();

    let inner = self.inner.clone();
    let result = self
      .conn
      .call(move |conn| {
        let mut ticket = original;
        let mut ctx = TicketContext::new(user, TicketMode::Edit, input);
        let tx = conn.transaction()?;

        // Timestamp/owner overrides bypass the handler pipeline; they exist
        // for migrations and imports.
        let mut changed = apply_audit_overrides(&tx, &mut ticket, &ctx)
          .map_err(Error::into_call)?;

        let ttype = inner.ticket_type(ticket.type_id).ok_or_else(|| {
          call_err(CoreError::InvalidTypeId(ticket.type_id))
        })?;
        let mut write_flags = WriteFlags::empty();
        if flags.contains(OpFlags::NO_CHANGELOG) {
          write_flags |= WriteFlags::NO_CHANGELOG;
        }
        if flags.contains(OpFlags::IGNORE_MISSING) {
          write_flags |= WriteFlags::IGNORE_MISSING;
        }
        changed += run_field_loop(
          &tx,
          &inner,
          &ttype,
          &mut ctx,
          &mut ticket,
          None,
          write_flags,
        )
        .map_err(Error::into_call)?;

        // "_comment" is not a field: it appends to the audit trail without
        // touching ticket data.
        let mut comment_row = None;
        if let Some(text) = ctx.input.get("_comment").cloned() {
          let text = text.trim().to_owned();
          if !text.is_empty() {
            tx.execute(
              "INSERT INTO ticket_texts (ticket_id, field_id, value) \
               VALUES (?1, ?2, ?3)",
              params![ticket.id, FIELD_COMMENT.0, text],
            )?;
            let row = tx.last_insert_rowid();
            if !write_flags.contains(WriteFlags::NO_CHANGELOG) {
              changelog::insert_row(
                &tx,
                FIELD_COMMENT,
                ticket.id,
                ctx.user.uid,
                Utc::now(),
                None,
                Some(row),
                None,
              )?;
            }
            ctx.notification.set_comment(text.clone());
            comment_row = Some((row, text));
          }
        }

        if changed > 0 && !write_flags.contains(WriteFlags::NO_CHANGELOG) {
          // An explicit audit override in this call wins over the
          // automatic write-back.
          if ctx.raw_input("lastmod_uid").is_none() {
            tx.execute(
              "UPDATE tickets SET lastmod_uid = ?1 WHERE i = ?2",
              params![ctx.user.uid, ticket.id],
            )?;
            ticket.lastmod_uid = ctx.user.uid;
          }
          if ctx.raw_input("lastmod_dt").is_none() {
            let now = Utc::now();
            tx.execute(
              "UPDATE tickets SET lastmod_dt = ?1 WHERE i = ?2",
              params![encode_dt(now), ticket.id],
            )?;
            ticket.lastmod_at = now;
          }
        }
        tx.commit()?;
        Ok((ticket, ctx, changed, comment_row))
      })
      .await
      .map_err(Error::from_call);

    let (ticket, mut ctx, changed, comment_row) = match result {
      Ok(out) => out,
      Err(e) => {
        // The transaction rolled back; restore the untouched instance so
        // the identity map does not diverge from the database.
        set.insert(snapshot);
        return Err(e);
      }
    };

    if !flags.contains(OpFlags::NO_INDEX) {
      self.inner.search.on_ticket_updated(&ticket);
      if let Some((row, text)) = &comment_row {
        self.inner.search.on_comment_added(ticket.id, *row, text);
      }
    }
    if !flags.contains(OpFlags::NO_MAIL) && !ctx.notification.is_empty() {
      if let Some(email) = ctx.user.email.clone() {
        let title = ticket.field_value(FIELD_TITLE).format_plain();
        let subject = if ctx.notification.is_comment_only() {
          format!("[Doreen] New comment on ticket #{}: {title}", ticket.id)
        } else {
          format!("[Doreen] Ticket #{} updated: {title}", ticket.id)
        };
        let notification = std::mem::take(&mut ctx.notification);
        self.inner.mail.enqueue(notification.into_mail(
          &email,
          subject,
          &self.inner.from_addr,
          &self.inner.from_name,
        ));
      }
    }

    set.insert(ticket);
    Ok(changed)
  }

  // ── Comments and attachments ──────────────────────────────────────────────

  /// Append a standalone comment outside an update cycle.
  pub async fn add_comment(
    &self,
    ticket_id: i64,
    user: UserRef,
    text: String,
  ) -> Result<i64> {
    let stored = text.clone();
    let row = self
      .conn
      .call(move |conn| {
        require_ticket(conn, ticket_id)?;
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO ticket_texts (ticket_id, field_id, value) VALUES \
           (?1, ?2, ?3)",
          params![ticket_id, FIELD_COMMENT.0, stored],
        )?;
        let row = tx.last_insert_rowid();
        changelog::insert_row(
          &tx,
          FIELD_COMMENT,
          ticket_id,
          user.uid,
          Utc::now(),
          None,
          Some(row),
          None,
        )?;
        tx.commit()?;
        Ok(row)
      })
      .await
      .map_err(Error::from_call)?;
    self.inner.search.on_comment_added(ticket_id, row, &text);
    Ok(row)
  }

  /// Rewrite an existing comment in place, recording an edit event.
  pub async fn update_comment(
    &self,
    ticket_id: i64,
    comment_row: i64,
    user: UserRef,
    text: String,
  ) -> Result<()> {
    let pushed = text.clone();
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let updated = tx.execute(
          "UPDATE ticket_texts SET value = ?1 WHERE i = ?2 AND \
           ticket_id = ?3 AND field_id = ?4",
          params![text, comment_row, ticket_id, FIELD_COMMENT.0],
        )?;
        if updated == 0 {
          return Err(call_err(CoreError::InvalidTicketId(ticket_id)));
        }
        changelog::insert_row(
          &tx,
          FIELD_COMMENT_UPDATED,
          ticket_id,
          user.uid,
          Utc::now(),
          Some(comment_row),
          None,
          None,
        )?;
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(Error::from_call)?;
    self.inner.search.on_comment_added(ticket_id, comment_row, &pushed);
    Ok(())
  }

  /// Detach a comment from its ticket. The row is orphaned, not deleted, so
  /// its text survives in the deletion event and old changelog references
  /// still resolve.
  pub async fn delete_comment(
    &self,
    ticket_id: i64,
    comment_row: i64,
    user: UserRef,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let old: Option<String> = tx
          .query_row(
            "SELECT value FROM ticket_texts WHERE i = ?1 AND \
             ticket_id = ?2 AND field_id = ?3",
            params![comment_row, ticket_id, FIELD_COMMENT.0],
            |row| row.get(0),
          )
          .optional()?;
        let Some(old) = old else {
          return Err(call_err(CoreError::InvalidTicketId(ticket_id)));
        };
        tx.execute(
          "UPDATE ticket_texts SET ticket_id = NULL WHERE i = ?1",
          params![comment_row],
        )?;
        changelog::insert_row(
          &tx,
          FIELD_COMMENT_DELETED,
          ticket_id,
          user.uid,
          Utc::now(),
          Some(comment_row),
          None,
          Some(&old),
        )?;
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(Error::from_call)?;
    self.inner.search.on_comment_deleted(ticket_id, comment_row);
    Ok(())
  }

  /// Attach a file. Inline payloads land in the row; external payloads are
  /// recorded with a negative size and a filesystem path.
  pub async fn add_attachment(
    &self,
    ticket_id: i64,
    user: UserRef,
    filename: String,
    mime: String,
    payload: AttachmentPayload,
  ) -> Result<i64> {
    let pushed_name = filename.clone();
    let row = self
      .conn
      .call(move |conn| {
        require_ticket(conn, ticket_id)?;
        let (size, data, path) = match payload {
          AttachmentPayload::Inline(bytes) => {
            (bytes.len() as i64, Some(bytes), None)
          }
          AttachmentPayload::External { path, size } => {
            (-size.abs(), None, Some(path))
          }
        };
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO ticket_binaries (ticket_id, field_id, filename, \
           mime, size, data, path) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          params![
            ticket_id,
            FIELD_ATTACHMENT.0,
            filename,
            mime,
            size,
            data,
            path
          ],
        )?;
        let row = tx.last_insert_rowid();
        changelog::insert_row(
          &tx,
          FIELD_ATTACHMENT,
          ticket_id,
          user.uid,
          Utc::now(),
          None,
          Some(row),
          None,
        )?;
        tx.commit()?;
        Ok(row)
      })
      .await
      .map_err(Error::from_call)?;
    self
      .inner
      .search
      .on_attachment_added(ticket_id, row, &pushed_name);
    Ok(row)
  }

  /// Detach an attachment, recording a deletion event. External payload
  /// files are removed after commit.
  pub async fn delete_attachment(
    &self,
    ticket_id: i64,
    attachment_row: i64,
    user: UserRef,
  ) -> Result<()> {
    let file = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let found: Option<(String, i64, Option<String>)> = tx
          .query_row(
            "SELECT filename, size, path FROM ticket_binaries WHERE \
             i = ?1 AND ticket_id = ?2",
            params![attachment_row, ticket_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
          )
          .optional()?;
        let Some((filename, size, path)) = found else {
          return Err(call_err(CoreError::InvalidTicketId(ticket_id)));
        };
        tx.execute(
          "UPDATE ticket_binaries SET ticket_id = NULL, data = NULL \
           WHERE i = ?1",
          params![attachment_row],
        )?;
        changelog::insert_row(
          &tx,
          FIELD_ATTACHMENT_DELETED,
          ticket_id,
          user.uid,
          Utc::now(),
          Some(attachment_row),
          None,
          Some(&filename),
        )?;
        tx.commit()?;
        Ok(if size < 0 { path } else { None })
      })
      .await
      .map_err(Error::from_call)?;
    if let Some(path) = file {
      remove_payload_file(&path);
    }
    Ok(())
  }

  // ── Delete ────────────────────────────────────────────────────────────────

  /// Batch-delete tickets: every live value row, every changelog-referenced
  /// value row, the changelog itself, and the header go in one transaction.
  /// Deleting a template leaves a synthetic event behind as the only trace.
  pub async fn delete_many(
    &self,
    set: &mut TicketSet,
    ids: &[i64],
    user: UserRef,
  ) -> Result<()> {
    if ids.is_empty() {
      return Ok(());
    }
    if !self.access_of(&user).contains(AccessFlags::DELETE) {
      return Err(CoreError::InvalidTicketId(ids[0]).into());
    }
    self.fetch(set, ids).await?;
    self.populate(set, ids, DetailLevel::Details).await?;

    let victims: Vec<Ticket> =
      ids.iter().filter_map(|id| set.take(*id)).collect();
    let snapshot = victims.clone();
    let inner = self.inner.clone();
    let result = self
      .conn
      .call(move |conn| {
        let now = Utc::now();
        let tx = conn.transaction()?;
        let mut files: Vec<String> = Vec::new();

        for ticket in &victims {
          let mut rows_by_table: BTreeMap<String, BTreeSet<i64>> =
            BTreeMap::new();
          for (field_id, rows) in &ticket.field_row_ids {
            if let Ok(field) = inner.registry.find(*field_id) {
              if let Some(table) = &field.storage_table {
                rows_by_table.entry(table.clone()).or_default().extend(rows);
              }
            }
          }

          // Soft-orphaned rows are only reachable through the changelog;
          // harvest the references so nothing is left behind.
          {
            let mut stmt = tx.prepare(
              "SELECT field_id, value_1, value_2 FROM changelog WHERE \
               what = ?1",
            )?;
            let mut rows = stmt.query(params![ticket.id])?;
            while let Some(row) = rows.next()? {
              let field_id = FieldId(row.get(0)?);
              let Ok(field) = inner.registry.find(field_id) else {
                continue;
              };
              if field.flags.is_pure_event() {
                continue;
              }
              let Some(table) = &field.storage_table else { continue };
              let refs = rows_by_table.entry(table.clone()).or_default();
              for col in [1, 2] {
                if let Some(value_row) = row.get::<_, Option<i64>>(col)? {
                  refs.insert(value_row);
                }
              }
            }
          }

          {
            let mut stmt = tx.prepare(
              "SELECT i, size, path FROM ticket_binaries WHERE \
               ticket_id = ?1",
            )?;
            let mut rows = stmt.query(params![ticket.id])?;
            while let Some(row) = rows.next()? {
              rows_by_table
                .entry("ticket_binaries".to_owned())
                .or_default()
                .insert(row.get(0)?);
              let size: i64 = row.get(1)?;
              if size < 0 {
                if let Some(path) = row.get::<_, Option<String>>(2)? {
                  files.push(path);
                }
              }
            }
          }

          // Index removal happens before commit by design; a sink failure
          // must not abort the delete.
          inner.search.on_ticket_deleted(ticket.id);

          for (table, rows) in &rows_by_table {
            if rows.is_empty() {
              continue;
            }
            let list = rows
              .iter()
              .map(|r| r.to_string())
              .collect::<Vec<_>>()
              .join(", ");
            tx.execute(
              &format!("DELETE FROM {table} WHERE i IN ({list})"),
              [],
            )?;
          }
          tx.execute(
            "DELETE FROM changelog WHERE what = ?1",
            params![ticket.id],
          )?;
          if let Some(template_name) = &ticket.template {
            changelog::insert_row(
              &tx,
              FIELD_TEMPLATE_DELETED,
              ticket.id,
              user.uid,
              now,
              None,
              None,
              Some(&format!(
                "type={};access={};template={template_name}",
                ticket.type_id, ticket.access_list_id
              )),
            )?;
          }
          tx.execute("DELETE FROM tickets WHERE i = ?1", params![ticket.id])?;
        }
        tx.commit()?;
        Ok(files)
      })
      .await
      .map_err(Error::from_call);

    let files = match result {
      Ok(files) => files,
      Err(e) => {
        for ticket in snapshot {
          set.insert(ticket);
        }
        return Err(e);
      }
    };

    // Post-commit filesystem cleanup is advisory: a missing file never
    // rolls back the delete.
    for path in files {
      remove_payload_file(&path);
    }
    Ok(())
  }

  // ── Fetch and populate ────────────────────────────────────────────────────

  /// Load stage-1 headers into the set; ids already present keep their live
  /// instance. Fails if any id does not exist.
  pub async fn fetch(&self, set: &mut TicketSet, ids: &[i64]) -> Result<()> {
    self.load_headers(set, ids).await?;
    for &id in ids {
      if !set.contains(id) {
        return Err(CoreError::InvalidTicketId(id).into());
      }
    }
    Ok(())
  }

  async fn load_headers(
    &self,
    set: &mut TicketSet,
    ids: &[i64],
  ) -> Result<()> {
    let missing: Vec<i64> =
      ids.iter().copied().filter(|id| !set.contains(*id)).collect();
    if missing.is_empty() {
      return Ok(());
    }
    let loaded = self
      .conn
      .call(move |conn| {
        query::fetch_headers(conn, &missing).map_err(Error::into_call)
      })
      .await
      .map_err(Error::from_call)?;
    for ticket in loaded {
      // Guards a race with a concurrent caller: never replace a live
      // instance.
      if !set.contains(ticket.id) {
        set.insert(ticket);
      }
    }
    Ok(())
  }

  /// Upgrade tickets to the requested detail level, one grouped query per
  /// ticket type. Already-populated tickets are not re-read.
  pub async fn populate(
    &self,
    set: &mut TicketSet,
    ids: &[i64],
    level: DetailLevel,
  ) -> Result<()> {
    let mut work = TicketSet::new();
    for &id in ids {
      let upgrade = set.get(id).map(|t| t.populated < level).unwrap_or(false);
      if upgrade {
        if let Some(ticket) = set.take(id) {
          work.insert(ticket);
        }
      }
    }
    if work.is_empty() {
      return Ok(());
    }

    let inner = self.inner.clone();
    let work = self
      .conn
      .call(move |conn| {
        let mut by_type: HashMap<i64, Vec<i64>> = HashMap::new();
        for ticket in work.iter() {
          by_type.entry(ticket.type_id).or_default().push(ticket.id);
        }
        for (type_id, type_ids) in by_type {
          let Some(ttype) = inner.ticket_type(type_id) else {
            warn!(type_id, "unknown ticket type, leaving tickets at stage 1");
            continue;
          };
          let wanted = match level {
            DetailLevel::List => &ttype.list_field_ids,
            _ => &ttype.field_ids,
          };
          let fields: Vec<&TicketField> = wanted
            .iter()
            .filter_map(|id| inner.registry.find(*id).ok())
            .collect();
          query::populate_fields(
            conn,
            &inner.registry,
            &mut work,
            &type_ids,
            &fields,
            level,
          )
          .map_err(Error::into_call)?;

          for field in &fields {
            if field.flags.contains(FieldFlags::CUSTOM_SERIALIZATION) {
              if let Ok(handler) = inner.handlers.get(field.id) {
                handler
                  .populate(conn, field, &mut work, &type_ids)
                  .map_err(Error::into_call)?;
              }
            }
          }
        }
        Ok(work)
      })
      .await
      .map_err(Error::from_call)?;

    for ticket in work.into_tickets() {
      set.insert(ticket);
    }
    Ok(())
  }

  // ── Find ──────────────────────────────────────────────────────────────────

  /// Find tickets. The search sink is consulted first for fulltext and
  /// drill-down queries; otherwise a naive database scan runs. Matching
  /// headers are loaded into the set.
  ///
  /// Returns `Ok(None)` for one historical quirk: a fulltext term with no
  /// searchable field configured and no ticket-number shape yields the
  /// empty result, not the unfiltered one.
  pub async fn find_many(
    &self,
    set: &mut TicketSet,
    filters: TicketFilters,
    sort: SortBy,
    page: Page,
    drill: HashMap<FieldId, i64>,
  ) -> Result<Option<FindResults>> {
    if filters.fulltext.is_some() || !drill.is_empty() {
      let request = SearchRequest {
        fulltext:   filters.fulltext.clone(),
        drill_down: drill.clone(),
        page:       page.page,
        per_page:   page.per_page,
      };
      if let Some(hits) = self.inner.search.search(&request) {
        debug!(total = hits.total, "search sink served the query");
        self.load_headers(set, &hits.ids).await?;
        return Ok(Some(FindResults {
          total:             hits.total,
          ids:               hits.ids,
          drill_down_counts: hits.drill_down_counts,
        }));
      }
    }

    let inner = self.inner.clone();
    let results = self
      .conn
      .call(move |conn| {
        query::find_fallback(conn, &inner.registry, &filters, sort, page,
          &drill)
          .map_err(Error::into_call)
      })
      .await
      .map_err(Error::from_call)?;
    let Some(results) = results else {
      return Ok(None);
    };
    self.load_headers(set, &results.ids).await?;
    Ok(Some(results))
  }

  // ── Changelog and serialization ───────────────────────────────────────────

  /// The ticket's audit trail, each row paired with its display line. Rows
  /// that no longer format degrade to placeholders instead of failing the
  /// whole view.
  pub async fn changelog(
    &self,
    ticket_id: i64,
  ) -> Result<Vec<(ChangelogRow, String)>> {
    let inner = self.inner.clone();
    self
      .conn
      .call(move |conn| {
        let rows = changelog::rows_for_ticket(conn, ticket_id)?;
        Ok(
          rows
            .into_iter()
            .map(|row| {
              let line = changelog::render_row(conn, &inner.registry, &row);
              (row, line)
            })
            .collect(),
        )
      })
      .await
      .map_err(Error::from_call)
  }

  /// Render one ticket as a JSON object: header columns, every field (with
  /// a `_formatted` companion for numeric values), and a `subtickets`
  /// object with the referenced tickets' identity, fetched in one batch
  /// rather than recursively.
  pub async fn serialize_ticket(
    &self,
    set: &mut TicketSet,
    ticket_id: i64,
    user: UserRef,
  ) -> Result<serde_json::Value> {
    self.fetch(set, &[ticket_id]).await?;
    self.populate(set, &[ticket_id], DetailLevel::Details).await?;

    let (mut map, subticket_ids) = {
      let ticket = set
        .get(ticket_id)
        .ok_or(CoreError::InvalidTicketId(ticket_id))?;
      let ttype = self
        .inner
        .ticket_type(ticket.type_id)
        .ok_or(CoreError::InvalidTypeId(ticket.type_id))?;
      let ctx = TicketContext::new(user, TicketMode::Json, HashMap::new());

      let mut map = serde_json::Map::new();
      map.insert("id".into(), ticket.id.into());
      map.insert("type".into(), ttype.name.clone().into());
      map.insert("owner_uid".into(), ticket.owner_uid.into());
      map.insert("created_at".into(), encode_dt(ticket.created_at).into());
      map.insert("lastmod_at".into(), encode_dt(ticket.lastmod_at).into());

      let mut subticket_ids = BTreeSet::new();
      for &field_id in &ttype.field_ids {
        let Ok(field) = self.inner.registry.find(field_id) else { continue };
        if field
          .flags
          .intersects(FieldFlags::CHANGELOGONLY | FieldFlags::EMPTYSYSEVENT)
        {
          continue;
        }
        let Ok(handler) = self.inner.handlers.get(field_id) else { continue };
        handler.serialize_to_map(
          &ctx,
          ticket,
          field,
          &mut map,
          &mut subticket_ids,
        );
      }
      subticket_ids.remove(&ticket.id);
      (map, subticket_ids)
    };

    if !subticket_ids.is_empty() {
      let sub_ids: Vec<i64> = subticket_ids.into_iter().collect();
      self.load_headers(set, &sub_ids).await?;
      self.populate(set, &sub_ids, DetailLevel::List).await?;
      let mut subs = serde_json::Map::new();
      for id in sub_ids {
        if let Some(sub) = set.get(id) {
          subs.insert(
            id.to_string(),
            serde_json::json!({
              "id": sub.id,
              "type_id": sub.type_id,
              "title": sub.field_value(FIELD_TITLE).format_plain(),
            }),
          );
        }
      }
      map.insert("subtickets".into(), subs.into());
    }

    Ok(serde_json::Value::Object(map))
  }

  fn access_of(&self, user: &UserRef) -> AccessFlags {
    self.inner.access.user_access(user.uid)
  }
}

// ─── Attachment payloads ─────────────────────────────────────────────────────

/// Where an attachment's bytes live.
pub enum AttachmentPayload {
  Inline(Vec<u8>),
  /// Stored on the filesystem; recorded with a negative size.
  External { path: String, size: i64 },
}

// ─── Lifecycle helpers ───────────────────────────────────────────────────────

fn new_ticket_instance(
  id: i64,
  type_id: i64,
  access_list_id: i64,
  user: &UserRef,
  now: chrono::DateTime<Utc>,
) -> Ticket {
  Ticket {
    id,
    template: None,
    type_id,
    access_list_id,
    owner_uid: user.uid,
    created_at: now,
    lastmod_uid: user.uid,
    lastmod_at: now,
    created_from: None,
    field_data: HashMap::new(),
    field_row_ids: HashMap::new(),
    populated: DetailLevel::Details,
  }
}

/// The shared create/update field loop: walk the type's field list, skip
/// type-automatic and write-exempt fields, copy mapped-through values from
/// the template on create, and delegate everything else to its handler. A
/// missing handler is fatal only for required fields.
fn run_field_loop(
  conn: &Connection,
  inner: &StoreInner,
  ttype: &TicketType,
  ctx: &mut TicketContext,
  ticket: &mut Ticket,
  template: Option<&Ticket>,
  write_flags: WriteFlags,
) -> Result<usize> {
  let mut changed = 0usize;
  for &field_id in &ttype.field_ids {
    let field = inner.registry.find(field_id)?;
    if ttype.is_automatic(field_id) || field.flags.skipped_on_write() {
      continue;
    }

    if field.flags.contains(FieldFlags::MAPPED_FROM_PROJECT) {
      if let Some(template) = template {
        let value = template.field_value(field_id);
        if !value.is_empty() {
          if let Ok(handler) = inner.handlers.get(field_id) {
            handler.write_to_database(
              conn,
              &inner.registry,
              ctx,
              ticket,
              field,
              &FieldValue::Null,
              value,
              false,
            )?;
          }
        }
      }
      continue;
    }

    match inner.handlers.get(field_id) {
      Ok(handler) => {
        if handler.on_create_or_update(
          conn,
          &inner.registry,
          ctx,
          ticket,
          field,
          write_flags,
        )? {
          changed += 1;
        }
      }
      Err(e) => {
        if field.flags.contains(FieldFlags::REQUIRED) {
          return Err(e);
        }
        debug!(field = %field_id, "no handler, skipping optional field");
      }
    }
  }
  Ok(changed)
}

/// Apply the timestamp/owner override keys, bypassing field handlers.
fn apply_audit_overrides(
  conn: &Connection,
  ticket: &mut Ticket,
  ctx: &TicketContext,
) -> Result<usize> {
  let mut changed = 0usize;

  if let Some(raw) = ctx.raw_input("created_dt") {
    let dt = decode_dt(raw)?;
    if dt != ticket.created_at {
      conn.execute(
        "UPDATE tickets SET created_dt = ?1 WHERE i = ?2",
        params![encode_dt(dt), ticket.id],
      )?;
      ticket.created_at = dt;
      changed += 1;
    }
  }
  if let Some(raw) = ctx.raw_input("lastmod_dt") {
    let dt = decode_dt(raw)?;
    if dt != ticket.lastmod_at {
      conn.execute(
        "UPDATE tickets SET lastmod_dt = ?1 WHERE i = ?2",
        params![encode_dt(dt), ticket.id],
      )?;
      ticket.lastmod_at = dt;
      changed += 1;
    }
  }
  if let Some(raw) = ctx.raw_input("owner_uid") {
    let uid = parse_uid(raw, "owner_uid")?;
    if uid != ticket.owner_uid {
      conn.execute(
        "UPDATE tickets SET owner_uid = ?1 WHERE i = ?2",
        params![uid, ticket.id],
      )?;
      ticket.owner_uid = uid;
      changed += 1;
    }
  }
  if let Some(raw) = ctx.raw_input("lastmod_uid") {
    let uid = parse_uid(raw, "lastmod_uid")?;
    if uid != ticket.lastmod_uid {
      conn.execute(
        "UPDATE tickets SET lastmod_uid = ?1 WHERE i = ?2",
        params![uid, ticket.id],
      )?;
      ticket.lastmod_uid = uid;
      changed += 1;
    }
  }
  Ok(changed)
}

fn parse_uid(raw: &str, key: &str) -> Result<i64> {
  raw.trim().parse::<i64>().map_err(|_| {
    CoreError::BadValue {
      field:  key.to_owned(),
      reason: format!("not a user id: {raw:?}"),
    }
    .into()
  })
}

fn require_ticket(
  conn: &Connection,
  ticket_id: i64,
) -> std::result::Result<(), tokio_rusqlite::Error> {
  let exists: Option<i64> = conn
    .query_row(
      "SELECT i FROM tickets WHERE i = ?1",
      params![ticket_id],
      |row| row.get(0),
    )
    .optional()
    .map_err(tokio_rusqlite::Error::from)?;
  if exists.is_none() {
    return Err(call_err(CoreError::InvalidTicketId(ticket_id)));
  }
  Ok(())
}

fn remove_payload_file(path: &str) {
  if let Err(e) = std::fs::remove_file(path) {
    warn!(path, error = %e, "attachment payload file not removed");
  }
}
