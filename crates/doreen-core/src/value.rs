//! The tagged field-value representation.
//!
//! Raw request input arrives as strings; [`FieldValue::parse_input`] decodes
//! it exactly once at the pipeline boundary, guided by the field's flags.
//! Everything downstream works on the tagged union — no ad-hoc re-parsing of
//! comma-separated strings by individual consumers.
//!
//! "Absent" is a single state: SQL NULL and a missing row both map to
//! [`FieldValue::Null`], never treated differently.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  field::{FieldFlags, TicketField},
};

// ─── CountedId ───────────────────────────────────────────────────────────────

/// One member of a count-tracking array field, input-encoded as `id:count`.
/// Used where a relation carries a quantity.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CountedId {
  pub id:    i64,
  pub count: i64,
}

// ─── FieldValue ──────────────────────────────────────────────────────────────

/// A single field's value: a scalar or an explicit list, decoded once at the
/// data-access boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
  Null,
  Int(i64),
  Text(String),
  Amount(Decimal),
  IdList(Vec<i64>),
  CountedList(Vec<CountedId>),
  WordList(Vec<String>),
}

impl Default for FieldValue {
  fn default() -> Self { Self::Null }
}

impl FieldValue {
  // ── Input decoding ────────────────────────────────────────────────────────

  /// Decode a raw request string according to the field's storage shape.
  ///
  /// Array-typed fields explode on commas; count-tracking fields expect
  /// `id:count` tokens and fail descriptively on malformed ones. Scalars
  /// keep the empty string as `Text("")` — normalization to `Null` for
  /// numeric storage happens in `validate_before_write`, not here.
  pub fn parse_input(raw: &str, field: &TicketField) -> Result<Self> {
    let flags = field.flags;

    if flags.is_array() {
      let tokens: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

      if flags.contains(FieldFlags::WORDLIST) {
        return Ok(Self::WordList(
          tokens.into_iter().map(str::to_owned).collect(),
        ));
      }

      if flags.contains(FieldFlags::ARRAY_COUNT) {
        let mut out = Vec::with_capacity(tokens.len());
        for t in tokens {
          out.push(parse_counted(t)?);
        }
        return Ok(Self::CountedList(out));
      }

      let mut out = Vec::with_capacity(tokens.len());
      for t in tokens {
        let id = t.parse::<i64>().map_err(|_| Error::BadValue {
          field:  field.name.clone(),
          reason: format!("not a ticket id: {t:?}"),
        })?;
        out.push(id);
      }
      return Ok(Self::IdList(out));
    }

    if raw.is_empty() {
      return Ok(Self::Text(String::new()));
    }

    if flags.contains(FieldFlags::TYPE_INT) {
      let n = raw.parse::<i64>().map_err(|_| Error::BadValue {
        field:  field.name.clone(),
        reason: format!("not an integer: {raw:?}"),
      })?;
      return Ok(Self::Int(n));
    }

    if flags.contains(FieldFlags::TYPE_AMOUNT) {
      let d = raw.parse::<Decimal>().map_err(|_| Error::BadValue {
        field:  field.name.clone(),
        reason: format!("not a monetary amount: {raw:?}"),
      })?;
      return Ok(Self::Amount(d));
    }

    Ok(Self::Text(raw.to_owned()))
  }

  // ── Emptiness and change detection ────────────────────────────────────────

  /// SQL NULL and missing rows both land here; an empty string or empty
  /// list is the same "no data" state.
  pub fn is_empty(&self) -> bool {
    match self {
      Self::Null => true,
      Self::Text(s) => s.is_empty(),
      Self::IdList(v) => v.is_empty(),
      Self::CountedList(v) => v.is_empty(),
      Self::WordList(v) => v.is_empty(),
      Self::Int(_) | Self::Amount(_) => false,
    }
  }

  /// Loose truthiness, matching the original semantics: zero and the empty
  /// string are falsy, everything else present is truthy.
  pub fn is_truthy(&self) -> bool {
    match self {
      Self::Null => false,
      Self::Int(n) => *n != 0,
      Self::Text(s) => !s.is_empty() && s != "0",
      Self::Amount(d) => !d.is_zero(),
      Self::IdList(v) => !v.is_empty(),
      Self::CountedList(v) => !v.is_empty(),
      Self::WordList(v) => !v.is_empty(),
    }
  }

  /// Loose equality: all empty representations compare equal, numeric text
  /// compares numerically, arrays compare as sets.
  pub fn loose_equals(&self, other: &Self) -> bool {
    use FieldValue::*;

    if self.is_empty() && other.is_empty() {
      return true;
    }
    if self.is_empty() != other.is_empty() {
      return false;
    }

    match (self, other) {
      (Int(a), Int(b)) => a == b,
      (Text(a), Text(b)) => a == b,
      (Amount(a), Amount(b)) => a == b,
      (Int(a), Text(s)) | (Text(s), Int(a)) => {
        s.parse::<i64>().map(|b| *a == b).unwrap_or(false)
      }
      (Amount(a), Text(s)) | (Text(s), Amount(a)) => {
        s.parse::<Decimal>().map(|b| *a == b).unwrap_or(false)
      }
      (Int(a), Amount(d)) | (Amount(d), Int(a)) => Decimal::from(*a) == *d,
      (IdList(a), IdList(b)) => as_set(a) == as_set(b),
      (WordList(a), WordList(b)) => {
        let sa: std::collections::BTreeSet<&str> =
          a.iter().map(String::as_str).collect();
        let sb: std::collections::BTreeSet<&str> =
          b.iter().map(String::as_str).collect();
        sa == sb
      }
      (CountedList(a), CountedList(b)) => {
        counted_map(a) == counted_map(b)
      }
      // A plain id list equals a counted list whose counts are all 1.
      (IdList(a), CountedList(b)) | (CountedList(b), IdList(a)) => {
        b.iter().all(|c| c.count == 1)
          && as_set(a) == b.iter().map(|c| c.id).collect()
      }
      _ => false,
    }
  }

  /// The default "did this write change anything" check.
  ///
  /// `old == Null && new truthy` always counts as a change, even though the
  /// loose check would usually catch it — this matters for fields whose
  /// "empty" representation is not exactly null. The reverse direction
  /// (old truthy, new empty string) is deliberately NOT forced and falls
  /// through to the loose check; this asymmetry is preserved from the
  /// original behavior, not corrected.
  pub fn is_changed_from(&self, old: &Self) -> bool {
    if old.is_empty() && self.is_truthy() {
      return true;
    }
    !self.loose_equals(old)
  }

  // ── Array views ───────────────────────────────────────────────────────────

  /// Membership as id → count; plain arrays report count 1. Empty for
  /// scalars.
  pub fn id_counts(&self) -> BTreeMap<i64, i64> {
    match self {
      Self::IdList(v) => v.iter().map(|id| (*id, 1)).collect(),
      Self::CountedList(v) => v.iter().map(|c| (c.id, c.count)).collect(),
      _ => BTreeMap::new(),
    }
  }

  pub fn words(&self) -> &[String] {
    match self {
      Self::WordList(v) => v,
      _ => &[],
    }
  }

  // ── Formatting ────────────────────────────────────────────────────────────

  /// Pure formatting; never fails, renders `Null` as the empty string.
  pub fn format_plain(&self) -> String {
    match self {
      Self::Null => String::new(),
      Self::Int(n) => n.to_string(),
      Self::Text(s) => s.clone(),
      Self::Amount(d) => d.to_string(),
      Self::IdList(v) => {
        v.iter()
          .map(|n| n.to_string())
          .collect::<Vec<_>>()
          .join(", ")
      }
      Self::CountedList(v) => {
        v.iter()
          .map(|c| format!("{}:{}", c.id, c.count))
          .collect::<Vec<_>>()
          .join(", ")
      }
      Self::WordList(v) => v.join(", "),
    }
  }

  /// Human formatting for numeric fields: digit grouping, two decimal
  /// places for amounts. Returns `None` for non-numeric values.
  pub fn format_human(&self) -> Option<String> {
    match self {
      Self::Int(n) => Some(group_digits(&n.to_string())),
      Self::Amount(d) => {
        let rounded = d.round_dp(2);
        let s = format!("{rounded:.2}");
        let (int_part, frac) = s.split_once('.').unwrap_or((s.as_str(), "00"));
        Some(format!("{}.{frac}", group_digits(int_part)))
      }
      _ => None,
    }
  }

  /// JSON rendering for API output.
  pub fn to_json(&self) -> serde_json::Value {
    use serde_json::{Value, json};
    match self {
      Self::Null => Value::Null,
      Self::Int(n) => json!(n),
      Self::Text(s) => json!(s),
      Self::Amount(d) => json!(d.to_string()),
      Self::IdList(v) => json!(v),
      Self::CountedList(v) => json!(v),
      Self::WordList(v) => json!(v),
    }
  }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn parse_counted(token: &str) -> Result<CountedId> {
  match token.split_once(':') {
    Some((id, count)) => {
      let id = id
        .trim()
        .parse::<i64>()
        .map_err(|_| Error::MalformedCountValue(token.to_owned()))?;
      let count = count
        .trim()
        .parse::<i64>()
        .map_err(|_| Error::MalformedCountValue(token.to_owned()))?;
      Ok(CountedId { id, count })
    }
    None => {
      let id = token
        .parse::<i64>()
        .map_err(|_| Error::MalformedCountValue(token.to_owned()))?;
      Ok(CountedId { id, count: 1 })
    }
  }
}

fn as_set(v: &[i64]) -> std::collections::BTreeSet<i64> {
  v.iter().copied().collect()
}

fn counted_map(v: &[CountedId]) -> BTreeMap<i64, i64> {
  v.iter().map(|c| (c.id, c.count)).collect()
}

/// Insert thousands separators into a (possibly signed) digit string.
fn group_digits(s: &str) -> String {
  let (sign, digits) = match s.strip_prefix('-') {
    Some(rest) => ("-", rest),
    None => ("", s),
  };
  let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
  for (i, ch) in digits.chars().enumerate() {
    if i > 0 && (digits.len() - i) % 3 == 0 {
      out.push(',');
    }
    out.push(ch);
  }
  format!("{sign}{out}")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
