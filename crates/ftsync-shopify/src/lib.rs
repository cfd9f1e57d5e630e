//! Admin GraphQL adapter: transport, cursor pagination, metafield writes,
//! and the HTML-to-text extraction used to derive friendly titles.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ftsync_core::{CatalogItem, ExtractionPolicy};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "ftsync-shopify";

/// Cap applied to derived titles unless overridden in config.
pub const DEFAULT_MAX_LEN: usize = 120;

const ELLIPSIS: &str = "...";

/// Derive a single plain-text line from a rich-text/HTML description.
///
/// Pure: the same input always yields the same output. Returns an empty
/// string when nothing survives; the caller decides the fallback.
pub fn first_text(raw: &str, policy: ExtractionPolicy, max_len: usize) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let normalized = normalize_breaks(raw);
    let document = Html::parse_fragment(&normalized);

    let slice = match policy {
        ExtractionPolicy::FirstParagraph => {
            first_paragraph_text(&document).unwrap_or_else(|| first_line_text(&document))
        }
        ExtractionPolicy::FirstLine | ExtractionPolicy::FirstSentence => {
            first_line_text(&document)
        }
    };

    let mut text = collapse_whitespace(&slice);
    if policy == ExtractionPolicy::FirstSentence {
        text = cut_at_sentence(&text);
    }
    truncate_to(&text, max_len)
}

/// `<br>` variants become newlines so the line-based policies can see them;
/// literal newlines in the markup are formatting, not breaks, and become
/// spaces.
fn normalize_breaks(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut skip_until = 0;
    for (i, ch) in html.char_indices() {
        if i < skip_until {
            continue;
        }
        if let Some(len) = br_tag_len(&html[i..]) {
            out.push('\n');
            skip_until = i + len;
        } else if ch == '\n' || ch == '\r' {
            out.push(' ');
        } else {
            out.push(ch);
        }
    }
    out
}

fn br_tag_len(rest: &str) -> Option<usize> {
    let head = rest.get(..3)?;
    if !head.eq_ignore_ascii_case("<br") {
        return None;
    }
    for (j, ch) in rest[3..].char_indices() {
        match ch {
            '>' => return Some(3 + j + 1),
            ' ' | '\t' | '/' => {}
            _ => return None,
        }
    }
    None
}

fn first_paragraph_text(document: &Html) -> Option<String> {
    let paragraph = Selector::parse("p").expect("static selector");
    document
        .select(&paragraph)
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .find(|text| !text.trim().is_empty())
}

fn first_line_text(document: &Html) -> String {
    // Text nodes join with a space so adjacent elements cannot run together.
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    match text.find('\n') {
        Some(pos) => text[..pos].to_string(),
        None => text,
    }
}

// split_whitespace also covers the U+00A0 that `&nbsp;` decodes to.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sentence rule: cut at the first `". "`, keeping the period. A bare
/// trailing period is left alone.
fn cut_at_sentence(text: &str) -> String {
    match text.find(". ") {
        Some(pos) => text[..pos + 1].to_string(),
        None => text.to_string(),
    }
}

/// Bound `text` to `max_len` characters, marking truncation with `...`.
pub fn truncate_to(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    if max_len <= ELLIPSIS.len() {
        return text.chars().take(max_len).collect();
    }
    let kept: String = text.chars().take(max_len - ELLIPSIS.len()).collect();
    let mut out = kept.trim_end().to_string();
    out.push_str(ELLIPSIS);
    out
}

/// One edge of the product connection: the item plus its pagination cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEdge {
    pub cursor: String,
    pub item: CatalogItem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPage {
    pub edges: Vec<CatalogEdge>,
    pub has_next_page: bool,
}

/// Field-level validation error reported by the write mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserError {
    #[serde(default)]
    pub field: Vec<String>,
    pub message: String,
}

/// Result of a metafield upsert. Transport failures travel as [`ApiError`]
/// and abort the run; a rejected write is data the caller counts and moves
/// past.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Rejected(Vec<UserError>),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("graphql errors: {0}")]
    GraphQl(String),
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("response missing data for {0}")]
    MissingData(&'static str),
}

/// Boundary to the remote catalog; implemented by [`ShopifyClient`] and by
/// in-memory fakes in tests.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn list_page(&self, cursor: Option<&str>) -> Result<CatalogPage, ApiError>;

    async fn upsert_metafield(
        &self,
        owner_id: &str,
        value: &str,
    ) -> Result<WriteOutcome, ApiError>;
}

const LIST_PRODUCTS: &str = r#"
query CatalogPage($first: Int!, $cursor: String, $query: String, $namespace: String!, $key: String!) {
  products(first: $first, after: $cursor, query: $query) {
    edges {
      cursor
      node {
        id
        title
        descriptionHtml
        metafield(namespace: $namespace, key: $key) {
          value
        }
      }
    }
    pageInfo {
      hasNextPage
    }
  }
}
"#;

const SET_METAFIELD: &str = r#"
mutation SetFriendlyTitle($ownerId: ID!, $namespace: String!, $key: String!, $value: String!) {
  metafieldsSet(
    metafields: [{
      ownerId: $ownerId,
      namespace: $namespace,
      key: $key,
      type: "single_line_text_field",
      value: $value
    }]
  ) {
    metafields {
      id
    }
    userErrors {
      field
      message
    }
  }
}
"#;

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    pub shop_domain: String,
    pub api_version: String,
    pub access_token: String,
    pub namespace: String,
    pub key: String,
    pub page_size: u32,
    pub updated_since: Option<DateTime<Utc>>,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct ShopifyClient {
    client: reqwest::Client,
    endpoint: String,
    config: ShopifyConfig,
}

impl ShopifyClient {
    pub fn new(config: ShopifyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        let endpoint = format!(
            "https://{}/admin/api/{}/graphql.json",
            config.shop_domain, config.api_version
        );
        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    fn updated_since_filter(&self) -> Option<String> {
        self.config
            .updated_since
            .map(|ts| format!("updated_at:>'{}'", ts.to_rfc3339()))
    }

    async fn graphql(
        &self,
        op: &'static str,
        query: &str,
        variables: JsonValue,
    ) -> Result<JsonValue, ApiError> {
        let span = info_span!("graphql_post", op);
        let _guard = span.enter();

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.config.access_token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }

        let envelope: GraphQlEnvelope = response.json().await?;
        if let Some(errors) = envelope.errors {
            if !errors.is_empty() {
                let joined = errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ApiError::GraphQl(joined));
            }
        }
        envelope.data.ok_or(ApiError::MissingData(op))
    }
}

#[async_trait]
impl CatalogService for ShopifyClient {
    async fn list_page(&self, cursor: Option<&str>) -> Result<CatalogPage, ApiError> {
        let variables = json!({
            "first": self.config.page_size,
            "cursor": cursor,
            "query": self.updated_since_filter(),
            "namespace": self.config.namespace,
            "key": self.config.key,
        });
        let data = self.graphql("list_products", LIST_PRODUCTS, variables).await?;
        let decoded: ProductsData = serde_json::from_value(data)?;

        let edges = decoded
            .products
            .edges
            .into_iter()
            .map(|edge| CatalogEdge {
                cursor: edge.cursor,
                item: CatalogItem {
                    id: edge.node.id,
                    title: edge.node.title,
                    description_html: edge.node.description_html,
                    current_value: edge.node.metafield.map(|m| m.value),
                },
            })
            .collect();

        Ok(CatalogPage {
            edges,
            has_next_page: decoded.products.page_info.has_next_page,
        })
    }

    async fn upsert_metafield(
        &self,
        owner_id: &str,
        value: &str,
    ) -> Result<WriteOutcome, ApiError> {
        let variables = json!({
            "ownerId": owner_id,
            "namespace": self.config.namespace,
            "key": self.config.key,
            "value": value,
        });
        let data = self.graphql("metafields_set", SET_METAFIELD, variables).await?;
        let decoded: MetafieldsSetData = serde_json::from_value(data)?;

        if decoded.metafields_set.user_errors.is_empty() {
            Ok(WriteOutcome::Applied)
        } else {
            Ok(WriteOutcome::Rejected(decoded.metafields_set.user_errors))
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProductsData {
    products: ProductConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductConnection {
    edges: Vec<ProductEdge>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct ProductEdge {
    cursor: String,
    node: ProductNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductNode {
    id: String,
    title: String,
    #[serde(default)]
    description_html: String,
    #[serde(default)]
    metafield: Option<MetafieldValue>,
}

#[derive(Debug, Deserialize)]
struct MetafieldValue {
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetData {
    metafields_set: MetafieldsSetPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetPayload {
    #[serde(default)]
    user_errors: Vec<UserError>,
}

/// Pull-based pager over the product connection.
///
/// Finite and not restartable: the cursor only moves forward, and a fresh
/// pager starts back at page one. The first transport or protocol error
/// ends the sequence.
pub struct ProductPager<'a, S: CatalogService + ?Sized> {
    service: &'a S,
    cursor: Option<String>,
    buffer: VecDeque<CatalogItem>,
    exhausted: bool,
    started: bool,
    page_delay: Option<Duration>,
}

impl<'a, S: CatalogService + ?Sized> ProductPager<'a, S> {
    pub fn new(service: &'a S) -> Self {
        Self {
            service,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            started: false,
            page_delay: None,
        }
    }

    /// Fixed delay before every page request after the first, to cooperate
    /// with the remote rate limit. Not adaptive.
    pub fn with_page_delay(mut self, delay: Option<Duration>) -> Self {
        self.page_delay = delay;
        self
    }

    pub async fn next_item(&mut self) -> Result<Option<CatalogItem>, ApiError> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }
            if self.started {
                if let Some(delay) = self.page_delay {
                    tokio::time::sleep(delay).await;
                }
            }

            let page = self.service.list_page(self.cursor.as_deref()).await?;
            self.started = true;
            match page.edges.last() {
                Some(last) => self.cursor = Some(last.cursor.clone()),
                None => {
                    // An empty page cannot advance the cursor; stop here.
                    self.exhausted = true;
                    return Ok(None);
                }
            }
            self.exhausted = !page.has_next_page;
            self.buffer
                .extend(page.edges.into_iter().map(|edge| edge.item));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn item(id: &str) -> CatalogItem {
        CatalogItem {
            id: id.to_string(),
            title: format!("Product {id}"),
            description_html: String::new(),
            current_value: None,
        }
    }

    fn edge(id: &str, cursor: &str) -> CatalogEdge {
        CatalogEdge {
            cursor: cursor.to_string(),
            item: item(id),
        }
    }

    struct ScriptedCatalog {
        pages: Mutex<VecDeque<Result<CatalogPage, ApiError>>>,
        list_calls: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedCatalog {
        fn new(pages: Vec<Result<CatalogPage, ApiError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into_iter().collect()),
                list_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CatalogService for ScriptedCatalog {
        async fn list_page(&self, cursor: Option<&str>) -> Result<CatalogPage, ApiError> {
            self.list_calls
                .lock()
                .expect("lock")
                .push(cursor.map(str::to_string));
            self.pages
                .lock()
                .expect("lock")
                .pop_front()
                .expect("unexpected extra list_page call")
        }

        async fn upsert_metafield(
            &self,
            _owner_id: &str,
            _value: &str,
        ) -> Result<WriteOutcome, ApiError> {
            Ok(WriteOutcome::Applied)
        }
    }

    #[test]
    fn extraction_is_pure_and_deterministic() {
        let html = "<p>Hand-thrown mug.&nbsp;Glazed twice.</p>";
        let a = first_text(html, ExtractionPolicy::FirstSentence, DEFAULT_MAX_LEN);
        let b = first_text(html, ExtractionPolicy::FirstSentence, DEFAULT_MAX_LEN);
        assert_eq!(a, b);
    }

    #[test]
    fn first_paragraph_wins_over_later_ones() {
        let html = "<p>Hello world.</p><p>more</p>";
        assert_eq!(
            first_text(html, ExtractionPolicy::FirstParagraph, DEFAULT_MAX_LEN),
            "Hello world."
        );
        assert_eq!(
            first_text(html, ExtractionPolicy::FirstSentence, DEFAULT_MAX_LEN),
            "Hello world."
        );
    }

    #[test]
    fn empty_and_blank_input_yield_empty() {
        assert_eq!(first_text("", ExtractionPolicy::FirstSentence, DEFAULT_MAX_LEN), "");
        assert_eq!(
            first_text("   \n ", ExtractionPolicy::FirstParagraph, DEFAULT_MAX_LEN),
            ""
        );
        assert_eq!(
            first_text("<p> </p>", ExtractionPolicy::FirstParagraph, DEFAULT_MAX_LEN),
            ""
        );
    }

    #[test]
    fn markup_is_stripped_and_whitespace_collapsed() {
        let html = "<div><span>Soft</span>   cotton&nbsp;&nbsp;tee</div>";
        assert_eq!(
            first_text(html, ExtractionPolicy::FirstLine, DEFAULT_MAX_LEN),
            "Soft cotton tee"
        );
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(
            first_text("No tags at all", ExtractionPolicy::FirstParagraph, DEFAULT_MAX_LEN),
            "No tags at all"
        );
    }

    #[test]
    fn br_variants_break_the_first_line() {
        for html in [
            "line one<br>line two",
            "line one<br/>line two",
            "line one<br />line two",
            "line one<BR>line two",
        ] {
            assert_eq!(
                first_text(html, ExtractionPolicy::FirstLine, DEFAULT_MAX_LEN),
                "line one",
                "input: {html}"
            );
        }
    }

    #[test]
    fn literal_newlines_are_formatting_not_breaks() {
        let html = "<p>wraps\nacross lines.</p>";
        assert_eq!(
            first_text(html, ExtractionPolicy::FirstLine, DEFAULT_MAX_LEN),
            "wraps across lines."
        );
    }

    #[test]
    fn sentence_policy_cuts_at_first_period_space() {
        assert_eq!(
            first_text(
                "Great mug. Dishwasher safe. Microwave safe.",
                ExtractionPolicy::FirstSentence,
                DEFAULT_MAX_LEN
            ),
            "Great mug."
        );
        // A bare trailing period is not a cut point.
        assert_eq!(
            first_text("Great mug.", ExtractionPolicy::FirstSentence, DEFAULT_MAX_LEN),
            "Great mug."
        );
    }

    #[test]
    fn long_text_truncates_with_ellipsis_inside_the_cap() {
        let raw = "x".repeat(500);
        let out = first_text(&raw, ExtractionPolicy::FirstLine, 40);
        assert_eq!(out.chars().count(), 40);
        assert!(out.ends_with("..."));

        let exact = "y".repeat(40);
        assert_eq!(first_text(&exact, ExtractionPolicy::FirstLine, 40), exact);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let raw = "é".repeat(50);
        let out = truncate_to(&raw, 10);
        assert_eq!(out.chars().count(), 10);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn decodes_product_connection_payload() {
        let data: ProductsData = serde_json::from_value(json!({
            "products": {
                "edges": [
                    {
                        "cursor": "abc",
                        "node": {
                            "id": "gid://shopify/Product/1",
                            "title": "Mug",
                            "descriptionHtml": "<p>Hi.</p>",
                            "metafield": { "value": "Hi." }
                        }
                    },
                    {
                        "cursor": "def",
                        "node": {
                            "id": "gid://shopify/Product/2",
                            "title": "Cap",
                            "descriptionHtml": "",
                            "metafield": null
                        }
                    }
                ],
                "pageInfo": { "hasNextPage": true }
            }
        }))
        .expect("decode");

        assert_eq!(data.products.edges.len(), 2);
        assert_eq!(data.products.edges[0].node.metafield.as_ref().map(|m| m.value.as_str()), Some("Hi."));
        assert!(data.products.edges[1].node.metafield.is_none());
        assert!(data.products.page_info.has_next_page);
    }

    #[test]
    fn decodes_user_errors_payload() {
        let data: MetafieldsSetData = serde_json::from_value(json!({
            "metafieldsSet": {
                "metafields": [],
                "userErrors": [
                    { "field": ["metafields", "0", "value"], "message": "Value is too long" }
                ]
            }
        }))
        .expect("decode");

        assert_eq!(data.metafields_set.user_errors.len(), 1);
        assert_eq!(data.metafields_set.user_errors[0].message, "Value is too long");
    }

    #[test]
    fn decodes_top_level_error_envelope() {
        let envelope: GraphQlEnvelope =
            serde_json::from_str(r#"{"errors":[{"message":"Throttled"}]}"#).expect("decode");
        assert!(envelope.data.is_none());
        assert_eq!(envelope.errors.expect("errors")[0].message, "Throttled");
    }

    #[tokio::test]
    async fn pager_yields_all_items_in_order_and_stops() {
        let catalog = ScriptedCatalog::new(vec![
            Ok(CatalogPage {
                edges: vec![edge("1", "c1"), edge("2", "c2")],
                has_next_page: true,
            }),
            Ok(CatalogPage {
                edges: vec![edge("3", "c3"), edge("4", "c4")],
                has_next_page: false,
            }),
        ]);

        let mut pager = ProductPager::new(&catalog);
        let mut seen = Vec::new();
        while let Some(item) = pager.next_item().await.expect("page") {
            seen.push(item.id);
        }
        assert_eq!(seen, vec!["1", "2", "3", "4"]);

        // Exhaustion is sticky: pulling again must not issue another request.
        assert!(pager.next_item().await.expect("page").is_none());
        let calls = catalog.list_calls.lock().expect("lock");
        assert_eq!(*calls, vec![None, Some("c2".to_string())]);
    }

    #[tokio::test]
    async fn pager_fails_fast_on_transport_error() {
        let catalog = ScriptedCatalog::new(vec![
            Ok(CatalogPage {
                edges: vec![edge("1", "c1")],
                has_next_page: true,
            }),
            Err(ApiError::HttpStatus {
                status: 500,
                url: "https://example.myshopify.com/admin/api/2024-10/graphql.json".to_string(),
                body: String::new(),
            }),
        ]);

        let mut pager = ProductPager::new(&catalog);
        assert_eq!(pager.next_item().await.expect("page").expect("item").id, "1");
        assert!(pager.next_item().await.is_err());
    }

    #[tokio::test]
    async fn pager_treats_empty_page_as_end() {
        let catalog = ScriptedCatalog::new(vec![Ok(CatalogPage {
            edges: Vec::new(),
            has_next_page: true,
        })]);

        let mut pager = ProductPager::new(&catalog);
        assert!(pager.next_item().await.expect("page").is_none());
        assert_eq!(catalog.list_calls.lock().expect("lock").len(), 1);
    }
}
