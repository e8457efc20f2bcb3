//! Query builder: object class, caller filter and tombstone flag to an LDAP
//! filter string.

use dirsync_connector::error::ConnectorResult;
use dirsync_connector::filter::Filter;
use dirsync_connector::operation::{NAME_ATTRIBUTE, UID_ATTRIBUTE};
use dirsync_connector::options::OperationOptions;
use tracing::warn;

use crate::guid;
use crate::schema::{ClassInfo, DISTINGUISHED_NAME, OBJECT_GUID};

/// Compose the final filter.
///
/// Accounts searched without tombstones are additionally restricted to
/// `ObjectCategory=Person`, which older callers relied on when they sent raw
/// filters matching any class.
pub fn build_filter(class: &ClassInfo, caller_filter: Option<&str>, include_deleted: bool) -> String {
    let class_clause = format!("(objectclass={})", class.native_class);
    let query = match caller_filter {
        Some(filter) if !filter.trim().is_empty() => format!("(&{class_clause}{filter})"),
        _ => class_clause,
    };
    if class.person_category && !include_deleted {
        format!("(&(ObjectCategory=Person){query})")
    } else {
        query
    }
}

/// Caller filter text plus a diagnostic when a legacy option supplied it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerFilter {
    pub text: Option<String>,
    pub diagnostic: Option<String>,
}

fn is_empty_filter(filter: &Filter) -> bool {
    match filter {
        Filter::And { filters } | Filter::Or { filters } => filters.iter().all(is_empty_filter),
        _ => false,
    }
}

/// Pick the caller's filter: the structured one when present, otherwise the
/// first non-empty legacy filter option.
pub fn caller_filter(
    filter: Option<&Filter>,
    options: &OperationOptions,
) -> ConnectorResult<CallerFilter> {
    if let Some(filter) = filter.filter(|f| !is_empty_filter(f)) {
        return Ok(CallerFilter {
            text: Some(translate(filter.clone())?.to_ldap()),
            diagnostic: None,
        });
    }
    let Some((key, text)) = options.legacy_filter() else {
        return Ok(CallerFilter::default());
    };
    let trimmed = text.trim();
    let text = if trimmed.starts_with('(') {
        trimmed.to_string()
    } else {
        format!("({trimmed})")
    };
    // Reject text the directory would refuse anyway.
    Filter::parse(&text)?;

    warn!(
        option = key,
        "Filter supplied through a legacy option; pass a structured filter instead"
    );
    Ok(CallerFilter {
        text: Some(text),
        diagnostic: Some(format!(
            "option '{key}' is deprecated; pass a structured filter instead"
        )),
    })
}

/// Map operational attribute names in a caller filter onto the directory's.
pub fn translate(filter: Filter) -> ConnectorResult<Filter> {
    Ok(match filter {
        Filter::Equals { attribute, value } if attribute.eq_ignore_ascii_case(UID_ATTRIBUTE) => {
            Filter::EqualsBinary {
                attribute: OBJECT_GUID.to_string(),
                value: guid::parse_uid(&value)?,
            }
        }
        Filter::And { filters } => Filter::And {
            filters: filters.into_iter().map(translate).collect::<Result<_, _>>()?,
        },
        Filter::Or { filters } => Filter::Or {
            filters: filters.into_iter().map(translate).collect::<Result<_, _>>()?,
        },
        Filter::Not { filter } => Filter::negate(translate(*filter)?),
        other => other.map_attributes(&|name| {
            if name.eq_ignore_ascii_case(NAME_ATTRIBUTE) {
                DISTINGUISHED_NAME.to_string()
            } else if name.eq_ignore_ascii_case(UID_ATTRIBUTE) {
                OBJECT_GUID.to_string()
            } else {
                name.to_string()
            }
        }),
    })
}
