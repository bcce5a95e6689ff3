use chrono::NaiveDate;

use crate::error::TwinError;
use crate::types::{EntityKind, KindInfo};

/// Source of the most recently created identifier for a kind.
pub trait LatestId {
    /// Identifier of the newest record of `kind`, ordered by creation time.
    /// When `scope` is set only identifiers starting with it are considered.
    fn latest_id(&self, kind: EntityKind, scope: Option<&str>) -> Result<Option<String>, TwinError>;
}

/// Identifiers in creation order, oldest first.
impl LatestId for [String] {
    fn latest_id(&self, _kind: EntityKind, scope: Option<&str>) -> Result<Option<String>, TwinError> {
        Ok(self
            .iter()
            .rev()
            .find(|id| scope.is_none_or(|s| id.starts_with(s)))
            .cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedId {
    pub date: Option<NaiveDate>,
    pub seq: u64,
}

/// Everything in front of the counter: the prefix, plus `YYYYMMDD-` for
/// date-scoped kinds.
pub fn scope_prefix(kind: EntityKind, date: NaiveDate) -> String {
    if kind.is_date_scoped() {
        format!("{}{}-", kind.prefix(), date.format("%Y%m%d"))
    } else {
        kind.prefix().to_string()
    }
}

pub fn format_id(kind: EntityKind, date: NaiveDate, seq: u64) -> String {
    format!(
        "{}{:0width$}",
        scope_prefix(kind, date),
        seq,
        width = kind.pad_width()
    )
}

pub fn parse_id(kind: EntityKind, id: &str) -> Result<ParsedId, TwinError> {
    let malformed = || TwinError::MalformedId {
        kind,
        id: id.to_string(),
    };

    let rest = id.strip_prefix(kind.prefix()).ok_or_else(malformed)?;

    let (date, digits) = if kind.is_date_scoped() {
        let (date_part, digits) = rest.split_once('-').ok_or_else(malformed)?;
        if date_part.len() != 8 || !date_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").map_err(|_| malformed())?;
        (Some(date), digits)
    } else {
        (None, rest)
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let seq = digits.parse::<u64>().map_err(|_| malformed())?;

    Ok(ParsedId { date, seq })
}

pub fn parse_seq(kind: EntityKind, id: &str) -> Result<u64, TwinError> {
    parse_id(kind, id).map(|p| p.seq)
}

/// Counter value the next record of `kind` created on `today` should get.
pub fn next_seq<L>(kind: EntityKind, today: NaiveDate, lookup: &L) -> Result<u64, TwinError>
where
    L: LatestId + ?Sized,
{
    let scope = kind.is_date_scoped().then(|| scope_prefix(kind, today));
    let Some(latest) = lookup.latest_id(kind, scope.as_deref())? else {
        tracing::debug!(%kind, "no previous {kind} in scope, seeding at 1");
        return Ok(1);
    };

    let parsed = parse_id(kind, &latest).inspect_err(|_| {
        tracing::warn!(%kind, latest = %latest, "latest identifier is malformed");
    })?;
    if kind.is_date_scoped() && parsed.date != Some(today) {
        return Err(TwinError::MalformedId { kind, id: latest });
    }

    let next = parsed
        .seq
        .checked_add(1)
        .ok_or_else(|| TwinError::MalformedId {
            kind,
            id: latest.clone(),
        })?;
    tracing::debug!(%kind, latest = %latest, next, "derived next sequence");
    Ok(next)
}

pub fn next_id<L>(kind: EntityKind, today: NaiveDate, lookup: &L) -> Result<String, TwinError>
where
    L: LatestId + ?Sized,
{
    let seq = next_seq(kind, today, lookup)?;
    Ok(format_id(kind, today, seq))
}

pub fn kind_info(kind: EntityKind, today: NaiveDate) -> KindInfo {
    KindInfo {
        kind,
        prefix: kind.prefix().to_string(),
        pad_width: kind.pad_width(),
        date_scoped: kind.is_date_scoped(),
        example: format_id(kind, today, 1),
        required_fields: kind.required_fields().iter().map(|f| f.to_string()).collect(),
    }
}
