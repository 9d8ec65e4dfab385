use crate::error::{PiwikError, PiwikResult};
use crate::piwik_client::PiwikClient;
use crate::types::{
    AnalyticsQuery, CreateAnnotationArgs, GetWebsiteArgs, ListAnnotationsArgs,
    QueryAnalyticsArgs,
};
use rmcp::handler::server::ServerHandler;
use rmcp::model::*;
use rmcp::service::{RequestContext, RoleServer};
use rmcp::ErrorData;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Static description of one exposed tool
struct ToolDef {
    name: &'static str,
    description: &'static str,
    schema: fn() -> JsonObject,
}

const TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "list_websites",
        description: "List all websites/apps tracked in Piwik PRO, in the order Piwik PRO returns them.",
        schema: empty_schema,
    },
    ToolDef {
        name: "get_website",
        description: "Get details (name, URL, timezone and settings) for a specific website/app.",
        schema: schema_of::<GetWebsiteArgs>,
    },
    ToolDef {
        name: "query_analytics",
        description: "Query analytics metrics for a website over a date range. Returns a metric-to-value map \
                      for a single aggregate row, or per-row values when dimensions or periods split the result.",
        schema: schema_of::<QueryAnalyticsArgs>,
    },
    ToolDef {
        name: "create_annotation",
        description: "Create an annotation on a website's analytics timeline. Each call creates a new annotation.",
        schema: schema_of::<CreateAnnotationArgs>,
    },
    ToolDef {
        name: "list_annotations",
        description: "List user annotations for a website, optionally limited to a date range.",
        schema: schema_of::<ListAnnotationsArgs>,
    },
];

fn schema_of<T: JsonSchema>() -> JsonObject {
    let schema = schemars::schema_for!(T);
    match serde_json::to_value(schema) {
        Ok(Value::Object(map)) => map,
        _ => empty_schema(),
    }
}

fn empty_schema() -> JsonObject {
    let mut schema = JsonObject::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema.insert("properties".to_string(), Value::Object(JsonObject::new()));
    schema
}

fn parse_args<T: DeserializeOwned>(arguments: JsonObject) -> PiwikResult<T> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|e| PiwikError::validation(format!("Invalid arguments: {}", e)))
}

/// MCP Service for Piwik PRO Analytics
#[derive(Clone)]
pub struct PiwikService {
    client: Arc<PiwikClient>,
}

impl PiwikService {
    pub fn new(client: PiwikClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    fn tool_to_mcp(def: &ToolDef) -> Tool {
        Tool {
            name: Cow::Borrowed(def.name),
            description: Some(Cow::Borrowed(def.description)),
            input_schema: Arc::new((def.schema)()),
            annotations: None,
            icons: None,
            meta: None,
            output_schema: None,
            title: None,
        }
    }

    pub fn tools() -> Vec<Tool> {
        TOOLS.iter().map(Self::tool_to_mcp).collect()
    }

    /// Run a tool by name. Tool failures are returned as error results,
    /// only unknown tool names fail at the protocol level.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: JsonObject,
    ) -> Result<CallToolResult, ErrorData> {
        let outcome = match name {
            "list_websites" => self.list_websites().await,
            "get_website" => self.get_website(arguments).await,
            "query_analytics" => self.query_analytics(arguments).await,
            "create_annotation" => self.create_annotation(arguments).await,
            "list_annotations" => self.list_annotations(arguments).await,
            _ => {
                return Err(ErrorData::invalid_params(
                    format!("Unknown tool: {}", name),
                    None,
                ))
            }
        };

        Ok(match outcome {
            Ok(value) => {
                debug!("Tool {} succeeded", name);
                let text =
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                CallToolResult {
                    content: vec![Content::text(text)],
                    is_error: Some(false),
                    meta: None,
                    structured_content: Some(value),
                }
            }
            Err(e) => {
                warn!("Tool {} failed ({}): {}", name, e.kind(), e);
                let payload = json!(e.to_payload());
                CallToolResult {
                    content: vec![Content::text(payload.to_string())],
                    is_error: Some(true),
                    meta: None,
                    structured_content: Some(payload),
                }
            }
        })
    }

    async fn list_websites(&self) -> PiwikResult<Value> {
        let websites = self.client.list_websites().await?;
        info!("Retrieved {} websites", websites.len());
        Ok(json!({ "websites": websites }))
    }

    async fn get_website(&self, arguments: JsonObject) -> PiwikResult<Value> {
        let args: GetWebsiteArgs = parse_args(arguments)?;
        let website = self.client.get_website(&args.website_id).await?;
        Ok(json!(website))
    }

    async fn query_analytics(&self, arguments: JsonObject) -> PiwikResult<Value> {
        let args: QueryAnalyticsArgs = parse_args(arguments)?;
        let query = AnalyticsQuery::try_from(args)?;
        let result = self.client.query_analytics(&query).await?;
        Ok(json!(result))
    }

    async fn create_annotation(&self, arguments: JsonObject) -> PiwikResult<Value> {
        let args: CreateAnnotationArgs = parse_args(arguments)?;
        let annotation = self
            .client
            .create_annotation(
                &args.website_id,
                &args.content,
                args.date.as_deref(),
                args.is_public,
            )
            .await?;
        Ok(json!(annotation))
    }

    async fn list_annotations(&self, arguments: JsonObject) -> PiwikResult<Value> {
        let args: ListAnnotationsArgs = parse_args(arguments)?;
        let annotations = self
            .client
            .list_annotations(
                &args.website_id,
                args.date_from.as_deref(),
                args.date_to.as_deref(),
            )
            .await?;
        Ok(json!({ "annotations": annotations }))
    }
}

impl ServerHandler for PiwikService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "mcp-piwik-pro".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                title: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Piwik PRO Analytics Suite server.\n\
                 Connected to: {}\n\n\
                 Use list_websites to find website ids, then query_analytics for metrics \
                 and create_annotation / list_annotations to manage timeline notes.",
                self.client.base_url()
            )),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        debug!("Listing {} tools", TOOLS.len());
        Ok(ListToolsResult {
            tools: Self::tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        info!("Calling tool: {}", request.name);
        self.dispatch(request.name.as_ref(), request.arguments.unwrap_or_default())
            .await
    }
}
