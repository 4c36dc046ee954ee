//! # Site Endpoints and Response Matchers
//!
//! The aggregator's pages are rendered client-side; each page fires one
//! internal `find` request whose `q` parameter carries the whole query as
//! JSON. Navigation URLs are built here, and the matchers recognise the
//! `find` request a navigation provokes by decoding that parameter and
//! comparing it field by field.

use serde_json::{json, Value};
use url::Url;

use crate::domain::{ItemId, SearchQuery};
use crate::infrastructure::fetcher::ResponseMatcher;

pub const DEFAULT_BASE_URL: &str = "https://barbechli.tn";

/// URL layout of the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteEndpoints {
    base: Url,
}

impl SiteEndpoints {
    pub fn new(base_url: &str) -> Result<Self, url::ParseError> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
        }
        Ok(Self { base })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `{base}/search;text=..;category=..;subcategories=a,b;sources=x;orderby=<kind>;pagenumber=<n>`
    #[must_use]
    pub fn listing_url(&self, query: &SearchQuery, page: u32) -> String {
        let mut segments = vec!["search".to_string()];
        push_segment(&mut segments, "text", &escape(&query.free_text));
        push_segment(&mut segments, "category", &escape(&query.category));
        push_segment(&mut segments, "subcategories", &escape_list(&query.subcategories));
        push_segment(&mut segments, "sources", &escape_list(&query.sources));
        push_segment(&mut segments, "orderby", &escape(&query.sort.kind));
        segments.push(format!("pagenumber={page}"));
        self.with_path(&segments.join(";"))
    }

    #[must_use]
    pub fn detail_url(&self, id: &ItemId) -> String {
        self.with_path(&format!("product/{}", escape(id.as_str())))
    }

    /// Address of the internal request a listing navigation fires.
    #[must_use]
    pub fn listing_resource(&self, query: &SearchQuery, page: u32) -> String {
        self.find_resource(&json!({
            "text": query.free_text.trim(),
            "category": query.category.trim(),
            "subcategories": clean_list(&query.subcategories),
            "sources": clean_list(&query.sources),
            "orderby": {"type": query.sort.kind.trim(), "direction": query.sort.direction.as_str()},
            "pages": {"number": page, "rows": query.page_size},
        }))
    }

    /// Address of the internal request a detail navigation fires.
    #[must_use]
    pub fn detail_resource(&self, id: &ItemId) -> String {
        self.find_resource(&json!({"uid": id.as_str()}))
    }

    fn find_resource(&self, q: &Value) -> String {
        let mut url = self.base.clone();
        url.set_path(&format!("{}/find/", self.path_prefix()));
        url.set_fragment(None);
        url.query_pairs_mut().clear().append_pair("q", &q.to_string());
        url.to_string()
    }

    fn with_path(&self, path: &str) -> String {
        let mut url = self.base.clone();
        url.set_path(&format!("{}/{path}", self.path_prefix()));
        url.set_query(None);
        url.set_fragment(None);
        url.to_string()
    }

    fn path_prefix(&self) -> &str {
        self.base.path().trim_end_matches('/')
    }
}

fn push_segment(segments: &mut Vec<String>, key: &str, value: &str) {
    if !value.is_empty() {
        segments.push(format!("{key}={value}"));
    }
}

/// Escapes the characters that carry structure in the matrix-style path.
/// Everything else is percent-encoded by `Url::set_path`.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.trim().chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ';' => escaped.push_str("%3B"),
            '=' => escaped.push_str("%3D"),
            ',' => escaped.push_str("%2C"),
            '/' => escaped.push_str("%2F"),
            '?' => escaped.push_str("%3F"),
            '#' => escaped.push_str("%23"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn escape_list(values: &[String]) -> String {
    clean_list(values).iter().map(|v| escape(v)).collect::<Vec<_>>().join(",")
}

/// Decodes the `q` JSON of a `.../find/?q=...` resource address.
fn decode_find_query(resource_url: &str) -> Option<Value> {
    let url = Url::parse(resource_url).ok()?;
    if !url.path().trim_end_matches('/').ends_with("/find") {
        return None;
    }
    let (_, q) = url.query_pairs().find(|(key, _)| key == "q")?;
    serde_json::from_str(&q).ok()
}

fn text_field<'a>(q: &'a Value, pointer: &str) -> &'a str {
    q.pointer(pointer).and_then(Value::as_str).map_or("", str::trim)
}

fn number_field(q: &Value, pointer: &str) -> Option<u64> {
    match q.pointer(pointer)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts both `["a","b"]` and `"a,b"`; order-insensitive.
fn list_field(q: &Value, key: &str) -> Vec<String> {
    let mut values: Vec<String> = match q.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        Some(Value::String(joined)) => joined.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    values = clean_list(&values);
    values.sort();
    values
}

/// Values the way they reach the wire: trimmed, blanks dropped.
fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn sorted(values: &[String]) -> Vec<String> {
    let mut values = clean_list(values);
    values.sort();
    values
}

/// Matches the `find` request of one listing page of one query.
#[derive(Debug, Clone)]
pub struct ListingMatcher {
    text: String,
    category: String,
    subcategories: Vec<String>,
    sources: Vec<String>,
    sort_kind: String,
    sort_direction: String,
    page: u32,
    page_size: u32,
}

impl ListingMatcher {
    #[must_use]
    pub fn new(query: &SearchQuery, page: u32) -> Self {
        Self {
            text: query.free_text.trim().to_string(),
            category: query.category.trim().to_string(),
            subcategories: sorted(&query.subcategories),
            sources: sorted(&query.sources),
            sort_kind: query.sort.kind.trim().to_string(),
            sort_direction: query.sort.direction.as_str().to_string(),
            page,
            page_size: query.page_size,
        }
    }

    fn matches_query(&self, q: &Value) -> bool {
        if number_field(q, "/pages/number") != Some(u64::from(self.page)) {
            return false;
        }
        if number_field(q, "/pages/rows").is_some_and(|rows| rows != u64::from(self.page_size)) {
            return false;
        }
        let kind = text_field(q, "/orderby/type");
        let direction = text_field(q, "/orderby/direction");
        text_field(q, "/text") == self.text
            && text_field(q, "/category") == self.category
            && list_field(q, "subcategories") == self.subcategories
            && list_field(q, "sources") == self.sources
            && (kind.is_empty() || kind == self.sort_kind)
            && (direction.is_empty() || direction == self.sort_direction)
    }
}

impl ResponseMatcher for ListingMatcher {
    fn matches(&self, resource_url: &str) -> bool {
        decode_find_query(resource_url).is_some_and(|q| self.matches_query(&q))
    }
}

/// Matches the `find` request of one product detail page.
#[derive(Debug, Clone)]
pub struct DetailMatcher {
    id: ItemId,
}

impl DetailMatcher {
    #[must_use]
    pub fn new(id: &ItemId) -> Self {
        Self { id: id.clone() }
    }
}

impl ResponseMatcher for DetailMatcher {
    fn matches(&self, resource_url: &str) -> bool {
        decode_find_query(resource_url).is_some_and(|q| match q.get("uid") {
            Some(Value::String(uid)) => uid == self.id.as_str(),
            Some(Value::Number(uid)) => uid.to_string() == self.id.as_str(),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SortDirection;
    use rstest::rstest;

    fn query() -> SearchQuery {
        SearchQuery::new("iphone 15")
            .with_category("telephonie")
            .with_subcategories(["smartphone", "accessoires"])
            .with_sources(["mytek"])
    }

    #[test]
    fn listing_url_uses_matrix_segments() {
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        assert_eq!(
            endpoints.listing_url(&query(), 3),
            "https://barbechli.tn/search;text=iphone%2015;category=telephonie;\
             subcategories=smartphone,accessoires;sources=mytek;orderby=popularity;pagenumber=3"
        );
    }

    #[test]
    fn empty_segments_are_omitted() {
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        assert_eq!(
            endpoints.listing_url(&SearchQuery::default(), 1),
            "https://barbechli.tn/search;orderby=popularity;pagenumber=1"
        );
    }

    #[test]
    fn structural_characters_in_values_are_escaped() {
        let endpoints = SiteEndpoints::new("https://shop.test/").unwrap();
        let url = endpoints.listing_url(&SearchQuery::new("a;b=c"), 1);
        assert!(url.starts_with("https://shop.test/search;text=a%3Bb%3Dc;"));
    }

    #[test]
    fn detail_url_and_resource() {
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        let id = ItemId::from("abc123");
        assert_eq!(endpoints.detail_url(&id), "https://barbechli.tn/product/abc123");
        assert!(DetailMatcher::new(&id).matches(&endpoints.detail_resource(&id)));
        assert!(!DetailMatcher::new(&ItemId::from("abc")).matches(&endpoints.detail_resource(&id)));
    }

    #[test]
    fn listing_matcher_accepts_its_own_resource() {
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        let resource = endpoints.listing_resource(&query(), 2);
        assert!(ListingMatcher::new(&query(), 2).matches(&resource));
    }

    #[test]
    fn padded_values_match_the_trimmed_request() {
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        let padded = SearchQuery::new("tv ")
            .with_category(" electromenager")
            .with_subcategories(["led ", " "])
            .with_sources([" mytek"]);
        let trimmed = SearchQuery::new("tv")
            .with_category("electromenager")
            .with_subcategories(["led"])
            .with_sources(["mytek"]);

        assert_eq!(endpoints.listing_url(&padded, 1), endpoints.listing_url(&trimmed, 1));
        assert_eq!(endpoints.listing_resource(&padded, 1), endpoints.listing_resource(&trimmed, 1));
        assert!(ListingMatcher::new(&padded, 1).matches(&endpoints.listing_resource(&trimmed, 1)));
        assert!(ListingMatcher::new(&trimmed, 1).matches(&endpoints.listing_resource(&padded, 1)));
    }

    #[rstest]
    #[case::other_page(query(), 3)]
    #[case::other_category(query().with_category("informatique"), 2)]
    #[case::other_sources(query().with_sources(["jumia"]), 2)]
    #[case::other_sort(query().with_sort("price", SortDirection::Asc), 2)]
    #[case::other_page_size(query().with_page_size(48), 2)]
    fn listing_matcher_rejects_other_queries(#[case] observed: SearchQuery, #[case] page: u32) {
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        let resource = endpoints.listing_resource(&observed, page);
        assert!(!ListingMatcher::new(&query(), 2).matches(&resource));
    }

    #[test]
    fn listing_matcher_tolerates_reordered_and_joined_lists() {
        let q = r#"{"text":"iphone 15","category":"telephonie","subcategories":"accessoires,smartphone","sources":["mytek"],"pages":{"number":"2"}}"#;
        let mut url = Url::parse("https://barbechli.tn/find/").unwrap();
        url.query_pairs_mut().append_pair("q", q);
        assert!(ListingMatcher::new(&query(), 2).matches(url.as_str()));
    }

    #[rstest]
    #[case("https://barbechli.tn/static/main.js")]
    #[case("https://barbechli.tn/find/?q=not-json")]
    #[case("https://barbechli.tn/find/")]
    #[case("not a url")]
    fn unrelated_resources_never_match(#[case] resource: &str) {
        assert!(!ListingMatcher::new(&query(), 1).matches(resource));
        assert!(!DetailMatcher::new(&ItemId::from("x")).matches(resource));
    }
}
