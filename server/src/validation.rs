//! Input checks run before any network call

use chrono::NaiveDate;

use crate::error::{PiwikError, PiwikResult};
use crate::types::{AnalyticsQuery, QueryAnalyticsArgs};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const MAX_ANNOTATION_LEN: usize = 150;

/// Website ids are opaque upstream identifiers (usually UUIDs)
pub fn website_id(id: &str) -> PiwikResult<String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(PiwikError::validation("website_id is required"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PiwikError::validation(format!(
            "website_id '{}' contains invalid characters",
            id
        )));
    }
    Ok(id.to_string())
}

pub fn date(field: &str, value: &str) -> PiwikResult<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PiwikError::validation(format!("{} is required", field)));
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| {
        PiwikError::validation(format!(
            "{} must be a date in YYYY-MM-DD format, got '{}'",
            field, value
        ))
    })
}

pub fn date_range(date_from: &str, date_to: &str) -> PiwikResult<(NaiveDate, NaiveDate)> {
    let from = date("date_from", date_from)?;
    let to = date("date_to", date_to)?;
    if from > to {
        return Err(PiwikError::validation(format!(
            "date_from ({}) must not be after date_to ({})",
            from, to
        )));
    }
    Ok((from, to))
}

/// Optional bounds for annotation listing; ordered when both are set
pub fn optional_range(
    date_from: Option<&str>,
    date_to: Option<&str>,
) -> PiwikResult<(Option<NaiveDate>, Option<NaiveDate>)> {
    let from = date_from.map(|d| date("date_from", d)).transpose()?;
    let to = date_to.map(|d| date("date_to", d)).transpose()?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(PiwikError::validation(format!(
                "date_from ({}) must not be after date_to ({})",
                f, t
            )));
        }
    }
    Ok((from, to))
}

/// Returns the content unchanged; only blank-ness is judged on the trimmed text
pub fn annotation_content(content: &str) -> PiwikResult<String> {
    if content.trim().is_empty() {
        return Err(PiwikError::validation("content is required"));
    }
    if content.chars().count() > MAX_ANNOTATION_LEN {
        return Err(PiwikError::validation(format!(
            "content must be {} characters or less",
            MAX_ANNOTATION_LEN
        )));
    }
    Ok(content.to_string())
}

/// Checks a query built directly, before it is sent
pub fn analytics_query(query: &AnalyticsQuery) -> PiwikResult<()> {
    website_id(&query.website_id)?;
    date_range(&query.date_from, &query.date_to)?;

    if query.metrics.is_empty() {
        return Err(PiwikError::validation("At least one metric is required"));
    }
    if query.metrics.iter().any(|m| m.trim().is_empty()) {
        return Err(PiwikError::validation("Metric names must not be empty"));
    }
    if query.dimensions.iter().any(|d| d.trim().is_empty()) {
        return Err(PiwikError::validation("Dimension names must not be empty"));
    }
    if query.limit == 0 {
        return Err(PiwikError::validation("limit must be greater than 0"));
    }
    Ok(())
}

impl TryFrom<QueryAnalyticsArgs> for AnalyticsQuery {
    type Error = PiwikError;

    fn try_from(args: QueryAnalyticsArgs) -> PiwikResult<Self> {
        let query = AnalyticsQuery {
            website_id: args.website_id.trim().to_string(),
            date_from: args.date_from.trim().to_string(),
            date_to: args.date_to.trim().to_string(),
            metrics: args.metrics.iter().map(|m| m.trim().to_string()).collect(),
            dimensions: args
                .dimensions
                .iter()
                .map(|d| d.trim().to_string())
                .collect(),
            filters: args.filters,
            offset: args.offset.unwrap_or(0),
            limit: args.limit.unwrap_or(AnalyticsQuery::DEFAULT_LIMIT),
        };
        analytics_query(&query)?;
        Ok(query)
    }
}
