use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};

use doreen_core::{
  Error as CoreError,
  context::{MailMessage, UserRef},
  field::{
    FIELD_AMOUNT, FIELD_CHILDREN, FIELD_COMMENT, FIELD_COMMENT_DELETED,
    FIELD_COMMENT_UPDATED, FIELD_DESCRIPTION, FIELD_KEYWORDS, FIELD_PARENTS,
    FIELD_PRIORITY, FIELD_STATUS, FIELD_TEMPLATE_DELETED,
    FIELD_TICKET_CREATED, FIELD_TITLE, FieldFlags, FieldId, TicketField,
  },
  sink::{SearchHits, SearchRequest, SearchSink},
  ticket::{DetailLevel, TicketSet, TicketType},
  value::{CountedId, FieldValue},
};

use crate::{
  AttachmentPayload, Error, FieldHandler, OpFlags, Page, SortBy,
  StdFieldHandler, StoreConfig, TicketFilters, TicketPlugin, TicketStore,
};

fn user() -> UserRef {
  UserRef::new(7, "alice").with_email("alice@example.com")
}

fn basic_type() -> TicketType {
  TicketType {
    id:             1,
    name:           "task".into(),
    field_ids:      vec![
      FIELD_TITLE,
      FIELD_DESCRIPTION,
      FIELD_PRIORITY,
      FIELD_STATUS,
      FIELD_KEYWORDS,
      FIELD_PARENTS,
      FIELD_CHILDREN,
      FIELD_AMOUNT,
    ],
    list_field_ids: vec![FIELD_TITLE, FIELD_PRIORITY, FIELD_STATUS],
    automatic:      vec![],
    parent_type_id: None,
  }
}

fn input(pairs: &[(&str, &str)]) -> HashMap<String, String> {
  pairs
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

async fn store_with(config: StoreConfig) -> (TicketStore, i64) {
  let store = TicketStore::open_in_memory(config).await.unwrap();
  store.define_type(basic_type()).await.unwrap();
  let template = store
    .create_template(user(), "default".into(), 1, 0, HashMap::new())
    .await
    .unwrap();
  (store, template)
}

async fn store() -> (TicketStore, i64) {
  store_with(StoreConfig::default()).await
}

async fn create(
  store: &TicketStore,
  set: &mut TicketSet,
  template: i64,
  pairs: &[(&str, &str)],
) -> i64 {
  store
    .create_another(set, template, user(), input(pairs), false, None,
      OpFlags::NO_MAIL)
    .await
    .unwrap()
}

// ─── Recording sinks ─────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingMailSink {
  mails: Mutex<Vec<MailMessage>>,
}

impl doreen_core::sink::MailSink for RecordingMailSink {
  fn enqueue(&self, mail: MailMessage) {
    self.mails.lock().unwrap().push(mail);
  }
}

#[derive(Default)]
struct RecordingSearchSink {
  created: Mutex<Vec<i64>>,
  deleted: Mutex<Vec<i64>>,
  hits:    Option<SearchHits>,
}

impl SearchSink for RecordingSearchSink {
  fn on_ticket_created(&self, ticket: &doreen_core::ticket::Ticket) {
    self.created.lock().unwrap().push(ticket.id);
  }
  fn on_ticket_updated(&self, _ticket: &doreen_core::ticket::Ticket) {}
  fn on_ticket_deleted(&self, ticket_id: i64) {
    self.deleted.lock().unwrap().push(ticket_id);
  }
  fn on_comment_added(&self, _ticket_id: i64, _row_id: i64, _text: &str) {}
  fn on_comment_deleted(&self, _ticket_id: i64, _row_id: i64) {}
  fn on_attachment_added(
    &self,
    _ticket_id: i64,
    _row_id: i64,
    _filename: &str,
  ) {
  }
  fn search(&self, _request: &SearchRequest) -> Option<SearchHits> {
    self.hits.clone()
  }
}

// ─── Creation ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_from_template_populates_field_data() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "Printer on fire"),
    ("priority", "2"),
  ])
  .await;

  let ticket = set.get(id).unwrap();
  assert_eq!(ticket.created_from, Some(template));
  assert_eq!(
    ticket.field_value(FIELD_TITLE),
    FieldValue::Text("Printer on fire".into())
  );
  assert_eq!(ticket.field_value(FIELD_PRIORITY), FieldValue::Int(2));

  // The values survive a fresh read through fetch + populate.
  let mut fresh = TicketSet::new();
  store.fetch(&mut fresh, &[id]).await.unwrap();
  store
    .populate(&mut fresh, &[id], DetailLevel::Details)
    .await
    .unwrap();
  assert_eq!(fresh.get(id).unwrap().field_value(FIELD_PRIORITY),
    FieldValue::Int(2));
}

#[tokio::test]
async fn creation_is_one_synthetic_event_not_per_field_rows() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "t"),
    ("priority", "3"),
    ("keywords", "alpha,beta"),
  ])
  .await;

  let log = store.changelog(id).await.unwrap();
  assert_eq!(log.len(), 1);
  assert_eq!(log[0].0.field_id, FIELD_TICKET_CREATED);
}

#[tokio::test]
async fn missing_required_field_fails_create() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let err = store
    .create_another(&mut set, template, user(), input(&[("priority", "1")]),
      false, None, OpFlags::NO_MAIL)
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(CoreError::MissingRequiredField { ref field })
      if field.as_str() == "title"
  ));

  // The same omission passes with the ignore-missing flag.
  store
    .create_another(
      &mut set,
      template,
      user(),
      input(&[("priority", "1")]),
      false,
      None,
      OpFlags::NO_MAIL | OpFlags::IGNORE_MISSING,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn create_from_non_template_is_rejected() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "t")]).await;

  let err = store
    .create_another(&mut set, id, user(), input(&[("title", "u")]), false,
      None, OpFlags::NO_MAIL)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Core(CoreError::NotATemplate(t)) if t == id));
}

#[tokio::test]
async fn forced_ids_preserve_imported_numbering() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = store
    .create_another(&mut set, template, user(), input(&[("title", "old #4711")]),
      false, Some(4711), OpFlags::NO_MAIL)
    .await
    .unwrap();
  assert_eq!(id, 4711);

  // The next auto-assigned id continues past the forced one.
  let next = create(&store, &mut set, template, &[("title", "t")]).await;
  assert!(next > 4711);
}

#[tokio::test]
async fn amounts_round_to_storage_precision() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "t"),
    ("amount", "12.346"),
  ])
  .await;

  assert_eq!(
    set.get(id).unwrap().field_value(FIELD_AMOUNT),
    FieldValue::Amount("12.35".parse().unwrap())
  );
}

// ─── Update ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unchanged_update_is_a_noop() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "same")]).await;

  let changed = store
    .update(&mut set, id, user(), input(&[("title", "same")]),
      OpFlags::NO_MAIL)
    .await
    .unwrap();
  assert_eq!(changed, 0);
  assert_eq!(store.changelog(id).await.unwrap().len(), 1); // creation only
}

#[tokio::test]
async fn scalar_update_keeps_old_value_resolvable() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "first")]).await;

  let changed = store
    .update(&mut set, id, user(), input(&[("title", "second")]),
      OpFlags::NO_MAIL)
    .await
    .unwrap();
  assert_eq!(changed, 1);

  // The changelog references the soft-orphaned old row and resolves it.
  let log = store.changelog(id).await.unwrap();
  let title_entry = log
    .iter()
    .find(|(row, _)| row.field_id == FIELD_TITLE)
    .unwrap();
  assert!(title_entry.0.value_1.is_some());
  assert!(title_entry.0.value_2.is_some());
  assert!(title_entry.1.contains("first"));
  assert!(title_entry.1.contains("second"));
}

#[tokio::test]
async fn update_requires_required_fields_unless_ignored() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "t")]).await;

  let err = store
    .update(&mut set, id, user(), input(&[("priority", "1")]),
      OpFlags::NO_MAIL)
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(CoreError::MissingRequiredField { .. })
  ));
  // Nothing was applied: the failed transaction rolled back.
  assert_eq!(set.get(id).unwrap().field_value(FIELD_PRIORITY),
    FieldValue::Null);

  let changed = store
    .update(
      &mut set,
      id,
      user(),
      input(&[("priority", "1")]),
      OpFlags::NO_MAIL | OpFlags::IGNORE_MISSING,
    )
    .await
    .unwrap();
  assert_eq!(changed, 1);
}

#[tokio::test]
async fn updating_a_template_is_rejected() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let err = store
    .update(&mut set, template, user(), input(&[("title", "x")]),
      OpFlags::NO_MAIL)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Core(CoreError::IsATemplate(t)) if t == template));
}

#[tokio::test]
async fn clearing_a_text_field_is_a_change_once() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "t"),
    ("description", "details"),
  ])
  .await;

  let base = input(&[("title", "t"), ("description", "")]);
  let changed = store
    .update(&mut set, id, user(), base.clone(), OpFlags::NO_MAIL)
    .await
    .unwrap();
  assert_eq!(changed, 1);

  // Clearing an already-empty field is not a change.
  let changed = store
    .update(&mut set, id, user(), base, OpFlags::NO_MAIL)
    .await
    .unwrap();
  assert_eq!(changed, 0);
}

#[tokio::test]
async fn audit_overrides_bypass_the_field_loop() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "t")]).await;

  let changed = store
    .update(
      &mut set,
      id,
      user(),
      input(&[("created_dt", "2020-01-01T00:00:00+00:00")]),
      OpFlags::NO_MAIL | OpFlags::NO_CHANGELOG | OpFlags::IGNORE_MISSING,
    )
    .await
    .unwrap();
  assert_eq!(changed, 1);
  assert_eq!(
    set.get(id).unwrap().created_at,
    "2020-01-01T00:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
  );
}

#[tokio::test]
async fn lastmod_override_survives_the_write_back() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "t")]).await;

  let changed = store
    .update(
      &mut set,
      id,
      user(),
      input(&[
        ("title", "renamed"),
        ("lastmod_dt", "2021-06-01T12:00:00+00:00"),
      ]),
      OpFlags::NO_MAIL,
    )
    .await
    .unwrap();
  assert_eq!(changed, 2);

  // The override is what was persisted, not the post-loop write-back.
  let mut fresh = TicketSet::new();
  store.fetch(&mut fresh, &[id]).await.unwrap();
  assert_eq!(
    fresh.get(id).unwrap().lastmod_at,
    "2021-06-01T12:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
  );
}

// ─── Arrays ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn counted_array_diff_writes_one_aggregate_entry() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "t"),
    ("parents", "5:2,9"),
  ])
  .await;

  let changed = store
    .update(&mut set, id, user(),
      input(&[("title", "t"), ("parents", "5:2,7")]), OpFlags::NO_MAIL)
    .await
    .unwrap();
  assert_eq!(changed, 1);

  let log = store.changelog(id).await.unwrap();
  let entries: Vec<_> = log
    .iter()
    .filter(|(row, _)| row.field_id == FIELD_PARENTS)
    .collect();
  assert_eq!(entries.len(), 1);
  let tokens = entries[0].0.value_str.as_deref().unwrap();
  assert!(tokens.contains("-9"));
  assert!(tokens.contains("+7"));

  assert_eq!(
    set.get(id).unwrap().field_value(FIELD_PARENTS),
    FieldValue::CountedList(vec![
      CountedId { id: 5, count: 2 },
      CountedId { id: 7, count: 1 },
    ])
  );
}

#[tokio::test]
async fn count_change_rewrites_the_membership_row() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "t"),
    ("parents", "5:2"),
  ])
  .await;

  store
    .update(&mut set, id, user(),
      input(&[("title", "t"), ("parents", "5:3")]), OpFlags::NO_MAIL)
    .await
    .unwrap();

  let log = store.changelog(id).await.unwrap();
  let entry = log
    .iter()
    .find(|(row, _)| row.field_id == FIELD_PARENTS)
    .unwrap();
  assert_eq!(entry.0.value_str.as_deref(), Some("+5:3"));
  assert_eq!(
    set.get(id).unwrap().field_value(FIELD_PARENTS),
    FieldValue::CountedList(vec![CountedId { id: 5, count: 3 }])
  );
}

#[tokio::test]
async fn reverse_pair_is_visible_from_the_other_side() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let parent = create(&store, &mut set, template, &[("title", "parent")])
    .await;
  let child = create(&store, &mut set, template, &[("title", "child")]).await;

  store
    .update(
      &mut set,
      child,
      user(),
      input(&[("title", "child"), ("parents", &parent.to_string())]),
      OpFlags::NO_MAIL,
    )
    .await
    .unwrap();

  // The parent sees the child through the reverse field without any write
  // of its own.
  let mut fresh = TicketSet::new();
  store.fetch(&mut fresh, &[parent]).await.unwrap();
  store
    .populate(&mut fresh, &[parent], DetailLevel::Details)
    .await
    .unwrap();
  assert_eq!(
    fresh.get(parent).unwrap().field_value(FIELD_CHILDREN),
    FieldValue::IdList(vec![child])
  );

  // And its changelog carries the complementary entry.
  let log = store.changelog(parent).await.unwrap();
  let entry = log
    .iter()
    .find(|(row, _)| row.field_id == FIELD_CHILDREN)
    .unwrap();
  assert_eq!(entry.0.value_str.as_deref(), Some(&*format!("+{child}")));
}

#[tokio::test]
async fn keywords_are_normalized_and_dictionary_backed() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "t"),
    ("keywords", "Alpha, beta"),
  ])
  .await;

  let mut fresh = TicketSet::new();
  store.fetch(&mut fresh, &[id]).await.unwrap();
  store
    .populate(&mut fresh, &[id], DetailLevel::Details)
    .await
    .unwrap();
  assert_eq!(
    fresh.get(id).unwrap().field_value(FIELD_KEYWORDS),
    FieldValue::WordList(vec!["alpha".into(), "beta".into()])
  );

  // Word diffs are human-readable in the changelog.
  store
    .update(
      &mut set,
      id,
      user(),
      input(&[("title", "t"), ("keywords", "alpha, gamma")]),
      OpFlags::NO_MAIL,
    )
    .await
    .unwrap();
  let log = store.changelog(id).await.unwrap();
  let entry = log
    .iter()
    .find(|(row, _)| row.field_id == FIELD_KEYWORDS)
    .unwrap();
  let tokens = entry.0.value_str.as_deref().unwrap();
  assert!(tokens.contains("-beta"));
  assert!(tokens.contains("+gamma"));
}

// ─── Delete ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_erases_live_rows_orphans_and_history() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "first"),
    ("keywords", "alpha"),
  ])
  .await;
  // Orphan a title row and leave a comment behind.
  store
    .update(&mut set, id, user(), input(&[("title", "second")]),
      OpFlags::NO_MAIL)
    .await
    .unwrap();
  store.add_comment(id, user(), "note".into()).await.unwrap();

  store.delete_many(&mut set, &[id], user()).await.unwrap();

  assert!(!set.contains(id));
  assert!(matches!(
    store.fetch(&mut set, &[id]).await.unwrap_err(),
    Error::Core(CoreError::InvalidTicketId(t)) if t == id
  ));
  assert!(store.changelog(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_a_template_leaves_a_synthetic_event() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  store
    .delete_many(&mut set, &[template], user())
    .await
    .unwrap();

  let log = store.changelog(template).await.unwrap();
  assert_eq!(log.len(), 1);
  assert_eq!(log[0].0.field_id, FIELD_TEMPLATE_DELETED);
  // The event is the only trace left, so it captures the template's type,
  // access list and name as value strings.
  let value = log[0].0.value_str.as_deref().unwrap();
  assert!(value.contains("type=1"));
  assert!(value.contains("access=0"));
  assert!(value.contains("template=default"));
}

// ─── Find ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fallback_find_matches_title_text_and_ticket_numbers() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let a = create(&store, &mut set, template, &[("title", "printer on fire")])
    .await;
  let _b =
    create(&store, &mut set, template, &[("title", "quiet day")]).await;

  let mut out = TicketSet::new();
  let results = store
    .find_many(
      &mut out,
      TicketFilters {
        fulltext: Some("printer".into()),
        ..Default::default()
      },
      SortBy::default(),
      Page::default(),
      HashMap::new(),
    )
    .await
    .unwrap()
    .unwrap();
  assert_eq!(results.ids, vec![a]);
  assert!(out.contains(a));

  let results = store
    .find_many(
      &mut out,
      TicketFilters {
        fulltext: Some(format!("#{a}")),
        ..Default::default()
      },
      SortBy::default(),
      Page::default(),
      HashMap::new(),
    )
    .await
    .unwrap()
    .unwrap();
  assert_eq!(results.ids, vec![a]);
}

#[tokio::test]
async fn find_sorts_with_id_as_final_tiebreaker() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let a = create(&store, &mut set, template, &[
    ("title", "a"),
    ("priority", "2"),
  ])
  .await;
  let b = create(&store, &mut set, template, &[
    ("title", "b"),
    ("priority", "1"),
  ])
  .await;
  let c = create(&store, &mut set, template, &[
    ("title", "c"),
    ("priority", "1"),
  ])
  .await;

  let mut out = TicketSet::new();
  let results = store
    .find_many(
      &mut out,
      TicketFilters::default(),
      SortBy { field: Some(FIELD_PRIORITY), descending: true },
      Page::default(),
      HashMap::new(),
    )
    .await
    .unwrap()
    .unwrap();
  assert_eq!(results.ids, vec![a, b, c]);
  assert_eq!(results.total, 3);
}

#[tokio::test]
async fn fallback_find_counts_drill_down_values() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  for priority in ["1", "1", "2"] {
    create(&store, &mut set, template, &[
      ("title", "t"),
      ("priority", priority),
    ])
    .await;
  }

  let mut out = TicketSet::new();
  let results = store
    .find_many(
      &mut out,
      TicketFilters::default(),
      SortBy::default(),
      Page::default(),
      HashMap::new(),
    )
    .await
    .unwrap()
    .unwrap();
  let counts = &results.drill_down_counts[&FIELD_PRIORITY];
  assert_eq!(counts.get(&1), Some(&2));
  assert_eq!(counts.get(&2), Some(&1));
}

#[tokio::test]
async fn find_paginates_deterministically() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let mut ids = Vec::new();
  for i in 0..5 {
    ids.push(
      create(&store, &mut set, template, &[("title", &format!("t{i}"))])
        .await,
    );
  }

  let mut out = TicketSet::new();
  let page2 = store
    .find_many(
      &mut out,
      TicketFilters::default(),
      SortBy::default(),
      Page { page: 2, per_page: 2 },
      HashMap::new(),
    )
    .await
    .unwrap()
    .unwrap();
  assert_eq!(page2.total, 5);
  assert_eq!(page2.ids, vec![ids[2], ids[3]]);
}

#[tokio::test]
async fn search_sink_serves_queries_and_receives_pushes() {
  let sink = Arc::new(RecordingSearchSink {
    hits: Some(SearchHits {
      ids:               vec![999],
      total:             1,
      drill_down_counts: HashMap::new(),
    }),
    ..Default::default()
  });
  let (store, template) = store_with(StoreConfig {
    search: sink.clone(),
    ..Default::default()
  })
  .await;

  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "t")]).await;
  assert_eq!(sink.created.lock().unwrap().as_slice(), &[id]);

  let mut out = TicketSet::new();
  let results = store
    .find_many(
      &mut out,
      TicketFilters {
        fulltext: Some("anything".into()),
        ..Default::default()
      },
      SortBy::default(),
      Page::default(),
      HashMap::new(),
    )
    .await
    .unwrap()
    .unwrap();
  assert_eq!(results.ids, vec![999]);

  store.delete_many(&mut set, &[id], user()).await.unwrap();
  assert_eq!(sink.deleted.lock().unwrap().as_slice(), &[id]);
}

// ─── Mail ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_sends_one_mail_built_from_final_values() {
  let mail = Arc::new(RecordingMailSink::default());
  let (store, template) = store_with(StoreConfig {
    mail: mail.clone(),
    ..Default::default()
  })
  .await;

  let mut set = TicketSet::new();
  let id = store
    .create_another(
      &mut set,
      template,
      user(),
      input(&[("title", "new printer"), ("amount", "1234.5")]),
      false,
      None,
      OpFlags::empty(),
    )
    .await
    .unwrap();

  let mails = mail.mails.lock().unwrap();
  assert_eq!(mails.len(), 1);
  assert!(mails[0].subject.contains(&format!("#{id} created")));
  assert!(mails[0].plain.contains("title: new printer"));
  // Monetary lines use the grouped rendering.
  assert!(mails[0].plain.contains("amount: 1,234.50"));
}

#[tokio::test]
async fn no_mail_flag_suppresses_the_creation_mail() {
  let mail = Arc::new(RecordingMailSink::default());
  let (store, template) = store_with(StoreConfig {
    mail: mail.clone(),
    ..Default::default()
  })
  .await;

  let mut set = TicketSet::new();
  create(&store, &mut set, template, &[("title", "quiet")]).await;
  assert!(mail.mails.lock().unwrap().is_empty());
}

#[tokio::test]
async fn update_sends_one_aggregate_mail() {
  let mail = Arc::new(RecordingMailSink::default());
  let (store, template) = store_with(StoreConfig {
    mail: mail.clone(),
    ..Default::default()
  })
  .await;

  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "t"),
    ("priority", "1"),
  ])
  .await;

  store
    .update(
      &mut set,
      id,
      user(),
      input(&[("title", "renamed"), ("priority", "2")]),
      OpFlags::empty(),
    )
    .await
    .unwrap();

  let mails = mail.mails.lock().unwrap();
  assert_eq!(mails.len(), 1);
  assert!(mails[0].subject.contains("updated"));
  assert!(mails[0].plain.contains("title: t -> renamed"));
  assert!(mails[0].plain.contains("priority: 1 -> 2"));
}

#[tokio::test]
async fn comment_only_update_gets_a_comment_subject() {
  let mail = Arc::new(RecordingMailSink::default());
  let (store, template) = store_with(StoreConfig {
    mail: mail.clone(),
    ..Default::default()
  })
  .await;

  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "t")]).await;

  let changed = store
    .update(
      &mut set,
      id,
      user(),
      input(&[("title", "t"), ("_comment", "just a note")]),
      OpFlags::empty(),
    )
    .await
    .unwrap();
  assert_eq!(changed, 0);

  let mails = mail.mails.lock().unwrap();
  assert_eq!(mails.len(), 1);
  assert!(mails[0].subject.starts_with("[Doreen] New comment"));
  assert!(mails[0].plain.contains("just a note"));
}

// ─── Comments and attachments ────────────────────────────────────────────────

#[tokio::test]
async fn comment_lifecycle_is_fully_audited() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "t")]).await;

  let row = store.add_comment(id, user(), "first draft".into()).await.unwrap();
  store
    .update_comment(id, row, user(), "final wording".into())
    .await
    .unwrap();
  store.delete_comment(id, row, user()).await.unwrap();

  let log = store.changelog(id).await.unwrap();
  let fields: Vec<FieldId> = log.iter().map(|(r, _)| r.field_id).collect();
  assert!(fields.contains(&FIELD_COMMENT));
  assert!(fields.contains(&FIELD_COMMENT_UPDATED));
  assert!(fields.contains(&FIELD_COMMENT_DELETED));

  // The deletion event preserves the text of the detached row.
  let deleted = log
    .iter()
    .find(|(r, _)| r.field_id == FIELD_COMMENT_DELETED)
    .unwrap();
  assert_eq!(deleted.0.value_str.as_deref(), Some("final wording"));
}

#[tokio::test]
async fn external_attachment_payload_is_removed_after_delete() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[("title", "t")]).await;

  let path = std::env::temp_dir().join(format!(
    "doreen-attach-{}-{id}.bin",
    std::process::id()
  ));
  std::fs::write(&path, b"payload").unwrap();
  store
    .add_attachment(
      id,
      user(),
      "dump.bin".into(),
      "application/octet-stream".into(),
      AttachmentPayload::External {
        path: path.to_string_lossy().into_owned(),
        size: 7,
      },
    )
    .await
    .unwrap();

  store.delete_many(&mut set, &[id], user()).await.unwrap();
  assert!(!path.exists());
}

// ─── Plugins ─────────────────────────────────────────────────────────────────

struct SeverityPlugin;

const FIELD_SEVERITY: FieldId = FieldId(500);

impl TicketPlugin for SeverityPlugin {
  fn name(&self) -> &str { "severity" }

  fn field_defs(&self) -> Vec<TicketField> {
    vec![
      TicketField::new(
        FIELD_SEVERITY,
        "severity",
        FieldFlags::STD_DATA_OLD_NEW
          | FieldFlags::TYPE_INT
          | FieldFlags::SORTABLE,
      )
      .with_table("ticket_ints"),
    ]
  }

  fn handlers(&self) -> Vec<Arc<dyn FieldHandler>> {
    vec![Arc::new(StdFieldHandler::new(FIELD_SEVERITY))]
  }
}

struct ClashingPlugin;

impl TicketPlugin for ClashingPlugin {
  fn name(&self) -> &str { "clash" }

  fn field_defs(&self) -> Vec<TicketField> {
    vec![TicketField::new(FIELD_TITLE, "title2", FieldFlags::TYPE_TEXT)]
  }
}

#[tokio::test]
async fn plugin_fields_flow_through_the_pipeline() {
  let (store, template) = store_with(StoreConfig {
    plugins: vec![Arc::new(SeverityPlugin)],
    ..Default::default()
  })
  .await;
  let mut ttype = basic_type();
  ttype.field_ids.push(FIELD_SEVERITY);
  store.define_type(ttype).await.unwrap();

  let mut set = TicketSet::new();
  let id = create(&store, &mut set, template, &[
    ("title", "t"),
    ("severity", "3"),
  ])
  .await;

  let mut fresh = TicketSet::new();
  store.fetch(&mut fresh, &[id]).await.unwrap();
  store
    .populate(&mut fresh, &[id], DetailLevel::Details)
    .await
    .unwrap();
  assert_eq!(
    fresh.get(id).unwrap().field_value(FIELD_SEVERITY),
    FieldValue::Int(3)
  );
}

#[tokio::test]
async fn plugin_field_collision_fails_startup() {
  let err = TicketStore::open_in_memory(StoreConfig {
    plugins: vec![Arc::new(ClashingPlugin)],
    ..Default::default()
  })
  .await
  .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(CoreError::DuplicateField(id)) if id == FIELD_TITLE
  ));
}

// ─── Serialization ───────────────────────────────────────────────────────────

#[tokio::test]
async fn serialize_adds_formatted_values_and_subtickets() {
  let (store, template) = store().await;
  let mut set = TicketSet::new();
  let parent =
    create(&store, &mut set, template, &[("title", "the parent")]).await;
  let id = create(&store, &mut set, template, &[
    ("title", "child"),
    ("amount", "1234.5"),
    ("parents", &parent.to_string()),
  ])
  .await;

  let json = store
    .serialize_ticket(&mut set, id, user())
    .await
    .unwrap();
  assert_eq!(json["title"], "child");
  assert_eq!(json["amount_formatted"], "1,234.50");
  assert_eq!(
    json["subtickets"][parent.to_string()]["title"],
    "the parent"
  );
}
