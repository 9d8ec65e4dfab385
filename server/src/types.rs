use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Friendly metric names accepted by `query_analytics` and their Piwik PRO column ids
pub const METRIC_ALIASES: &[(&str, &str)] = &[
    ("visits", "sessions"),
    ("pageviews", "page_views"),
    ("bounce_rate", "bounce_rate"),
    ("avg_time_on_site", "session_total_time"),
    ("unique_visitors", "visitors"),
    ("conversion_rate", "goal_conversion_rate"),
    ("revenue", "revenue"),
    ("cart_abandonment", "abandoned_cart_rate"),
    ("exit_rate", "exit_rate"),
    ("entry_rate", "entry_rate"),
];

/// Resolve a metric name to a column id. Unknown names pass through unchanged.
pub fn column_id(metric: &str) -> &str {
    METRIC_ALIASES
        .iter()
        .find(|(alias, _)| *alias == metric)
        .map(|(_, id)| *id)
        .unwrap_or(metric)
}

/// One tracked website/app
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebsiteSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Remaining upstream attributes, in upstream order
    #[serde(skip_serializing_if = "IndexMap::is_empty", default)]
    pub attributes: IndexMap<String, Value>,
}

impl WebsiteSummary {
    /// Project a JSON:API resource (`{id, attributes}`) or a flat object
    pub fn from_resource(resource: &Value) -> Option<Self> {
        let obj = resource.as_object()?;
        let id = scalar_string(obj.get("id")?)?;

        let mut attributes: IndexMap<String, Value> = match obj.get("attributes") {
            Some(Value::Object(attrs)) => attrs.clone().into_iter().collect(),
            Some(_) => return None,
            None => obj
                .iter()
                .filter(|(k, _)| k.as_str() != "id")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        let name = take_string(&mut attributes, "name");
        let timezone = take_string(&mut attributes, "timezone");
        let url = take_string(&mut attributes, "url").or_else(|| {
            attributes
                .get("urls")
                .and_then(|v| v.as_array())
                .and_then(|urls| urls.first())
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        });

        Some(WebsiteSummary {
            id,
            name,
            url,
            timezone,
            attributes,
        })
    }
}

/// Validated analytics query, built from tool arguments
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsQuery {
    pub website_id: String,
    pub date_from: String,
    pub date_to: String,
    pub metrics: Vec<String>,
    pub dimensions: Vec<String>,
    pub filters: Option<Value>,
    pub offset: u32,
    pub limit: u32,
}

impl AnalyticsQuery {
    pub const DEFAULT_LIMIT: u32 = 100;

    /// Caller-facing column names: dimensions first, then metrics
    pub fn column_names(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .chain(self.metrics.iter())
            .cloned()
            .collect()
    }

    /// Request body for the analytics query endpoint
    pub fn to_body(&self) -> Value {
        let columns: Vec<Value> = self
            .dimensions
            .iter()
            .chain(self.metrics.iter())
            .map(|name| serde_json::json!({ "column_id": column_id(name) }))
            .collect();

        let mut body = serde_json::json!({
            "website_id": self.website_id,
            "date_from": self.date_from,
            "date_to": self.date_to,
            "columns": columns,
            "format": "json",
            "column_format": "id",
            "offset": self.offset,
            "limit": self.limit,
            "options": { "sampling": 1.0 },
        });
        if let (Some(filters), Some(obj)) = (&self.filters, body.as_object_mut()) {
            obj.insert("filters".to_string(), filters.clone());
        }
        body
    }
}

/// Analytics response keyed by the names the caller asked for
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalyticsResult {
    pub website_id: String,
    pub date_from: String,
    pub date_to: String,
    pub columns: Vec<String>,
    /// Metric name to value, when upstream returned a single aggregate row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<IndexMap<String, Value>>,
    /// Per-row values in upstream order (dimension breakdowns, time series)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<IndexMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl AnalyticsResult {
    /// Reshape `{data: [[..]], meta: {columns}}`. Returns the reason on a shape mismatch.
    pub fn from_response(query: &AnalyticsQuery, response: &Value) -> Result<Self, String> {
        let data = response
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| "analytics response has no data array".to_string())?;
        let meta = response.get("meta").cloned();

        let requested = query.column_names();
        let caller_name = |key: &str| -> String {
            requested
                .iter()
                .find(|name| column_id(name.as_str()) == key)
                .cloned()
                .unwrap_or_else(|| key.to_string())
        };
        let upstream_columns: Option<Vec<String>> = meta
            .as_ref()
            .and_then(|m| m.get("columns"))
            .and_then(|c| c.as_array())
            .map(|cols| {
                cols.iter()
                    .filter_map(|c| match c {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(o) => o
                            .get("column_id")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                        _ => None,
                    })
                    .collect()
            });

        // Positions match the request order, so requested names win when counts agree
        let columns = match upstream_columns {
            Some(cols) if cols.len() != requested.len() && !cols.is_empty() => cols,
            _ => requested.clone(),
        };

        let mut rows = Vec::with_capacity(data.len());
        for (index, row) in data.iter().enumerate() {
            let mapped: IndexMap<String, Value> = match row {
                Value::Array(values) => {
                    if values.len() != columns.len() {
                        return Err(format!(
                            "row {} has {} values, expected {}",
                            index,
                            values.len(),
                            columns.len()
                        ));
                    }
                    columns.iter().cloned().zip(values.iter().cloned()).collect()
                }
                Value::Object(obj) => obj
                    .iter()
                    .map(|(key, value)| (caller_name(key), value.clone()))
                    .collect(),
                other => return Err(format!("row {} is not an array: {}", index, other)),
            };
            rows.push(mapped);
        }

        let values = if query.dimensions.is_empty() && rows.len() == 1 {
            rows.pop()
        } else {
            None
        };

        Ok(AnalyticsResult {
            website_id: query.website_id.clone(),
            date_from: query.date_from.clone(),
            date_to: query.date_to.clone(),
            columns,
            values,
            rows,
            meta,
        })
    }
}

/// A user annotation on a website's timeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub id: String,
    pub website_id: String,
    pub content: String,
    pub date: String,
    pub is_public: bool,
}

impl Annotation {
    pub fn visibility(is_public: bool) -> &'static str {
        if is_public {
            "public"
        } else {
            "private"
        }
    }

    /// Request body for creating an annotation
    pub fn create_body(website_id: &str, content: &str, date: &str, is_public: bool) -> Value {
        serde_json::json!({
            "data": {
                "type": "UserAnnotation",
                "attributes": {
                    "content": content,
                    "website_id": website_id,
                    "date": date,
                    "visibility": Self::visibility(is_public),
                }
            }
        })
    }

    /// Id assigned by upstream, from `{id}` or `{data: {id}}`
    pub fn created_id(response: &Value) -> Option<String> {
        response
            .get("id")
            .or_else(|| response.get("data").and_then(|d| d.get("id")))
            .and_then(scalar_string)
    }

    /// Decode one listed annotation, flat or JSON:API shaped
    pub fn from_resource(resource: &Value, website_id: &str) -> Option<Self> {
        let obj = resource.as_object()?;
        let id = scalar_string(obj.get("id")?)?;
        let attrs = match obj.get("attributes") {
            Some(Value::Object(a)) => a,
            Some(_) => return None,
            None => obj,
        };

        let content = attrs.get("content")?.as_str()?.to_string();
        let date = attrs.get("date")?.as_str()?.to_string();
        let is_public = match (attrs.get("visibility"), attrs.get("is_public")) {
            (Some(Value::String(v)), _) => v == "public",
            (_, Some(Value::Bool(b))) => *b,
            _ => false,
        };
        let website_id = attrs
            .get("website_id")
            .and_then(scalar_string)
            .unwrap_or_else(|| website_id.to_string());

        Some(Annotation {
            id,
            website_id,
            content,
            date,
            is_public,
        })
    }
}

// ---------------------------------------------------------------------------
// Tool arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetWebsiteArgs {
    /// The ID of the website/app to get details for
    pub website_id: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct QueryAnalyticsArgs {
    /// The ID of the website/app to query
    pub website_id: String,
    /// Start date in YYYY-MM-DD format
    pub date_from: String,
    /// End date in YYYY-MM-DD format (inclusive)
    pub date_to: String,
    /// Metrics to retrieve. Friendly names (visits, pageviews, bounce_rate,
    /// avg_time_on_site, unique_visitors, conversion_rate, revenue,
    /// cart_abandonment, exit_rate, entry_rate) or raw Piwik PRO column ids
    pub metrics: Vec<String>,
    /// Optional dimension column ids to break results down by (e.g. "source", "timestamp")
    #[serde(default)]
    pub dimensions: Vec<String>,
    /// Optional Piwik PRO filter expression, passed through unchanged
    #[serde(default)]
    pub filters: Option<Value>,
    /// Row offset (default 0)
    #[serde(default)]
    pub offset: Option<u32>,
    /// Maximum number of rows (default 100)
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CreateAnnotationArgs {
    /// The ID of the website/app to annotate
    pub website_id: String,
    /// Content of the annotation (max 150 characters)
    pub content: String,
    /// Date in YYYY-MM-DD format (defaults to today)
    #[serde(default)]
    pub date: Option<String>,
    /// Whether other users of the website can see the annotation (default false)
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListAnnotationsArgs {
    /// The ID of the website/app to list annotations for
    pub website_id: String,
    /// Only annotations on or after this date (YYYY-MM-DD)
    #[serde(default)]
    pub date_from: Option<String>,
    /// Only annotations on or before this date (YYYY-MM-DD)
    #[serde(default)]
    pub date_to: Option<String>,
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn take_string(map: &mut IndexMap<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(_)) => map.shift_remove(key).and_then(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        }),
        _ => None,
    }
}
