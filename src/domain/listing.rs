//! # Listing Pages
//!
//! Typed view of one listing response plus the end-of-results decision the
//! producer takes after every page.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::product::PayloadError;
use super::query::ItemId;

/// Status code the aggregator returns once a query is exhausted.
pub const END_OF_RESULTS_STATUS: &str = "ERROR_ELASTIC";

/// Why a listing crawl stopped naturally. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The response carried the explicit end-of-results status.
    StatusSentinel,
    /// The page held no items.
    EmptyPage,
    /// The page held fewer items than the page size.
    ShortPage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub ids: Vec<ItemId>,
    /// Raw number of items in `response`, including those without an id.
    pub item_count: usize,
    /// Items skipped because they carried no `uniqueID`.
    pub skipped: usize,
    pub end_of_results: bool,
}

impl ListingPage {
    /// Reads a listing response.
    ///
    /// A sentinel response may omit `response` entirely. Otherwise a missing
    /// or non-array `response` is a malformed payload.
    pub fn from_response(payload: &Value) -> Result<Self, PayloadError> {
        let end_of_results = payload
            .pointer("/status/code")
            .and_then(Value::as_str)
            .is_some_and(|code| code == END_OF_RESULTS_STATUS);

        let items = match payload.get("response") {
            Some(Value::Array(items)) => items.as_slice(),
            None | Some(Value::Null) if end_of_results => &[][..],
            Some(_) => return Err(PayloadError::NotAnArray),
            None => return Err(PayloadError::MissingResponse),
        };

        let ids: Vec<ItemId> = items
            .iter()
            .filter_map(|item| match item.get("uniqueID") {
                Some(Value::String(id)) if !id.trim().is_empty() => Some(ItemId::new(id.trim())),
                Some(Value::Number(id)) => Some(ItemId::new(id.to_string())),
                _ => None,
            })
            .collect();

        Ok(Self {
            skipped: items.len() - ids.len(),
            item_count: items.len(),
            ids,
            end_of_results,
        })
    }

    /// Termination check: explicit status first, then empty page, then short page.
    #[must_use]
    pub fn end_reason(&self, page_size: u32) -> Option<EndReason> {
        if self.end_of_results {
            Some(EndReason::StatusSentinel)
        } else if self.item_count == 0 {
            Some(EndReason::EmptyPage)
        } else if self.item_count < page_size as usize {
            Some(EndReason::ShortPage)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn items(n: usize) -> Value {
        Value::Array((0..n).map(|i| json!({"uniqueID": format!("id-{i}")})).collect())
    }

    #[rstest]
    #[case(24, None)]
    #[case(3, Some(EndReason::ShortPage))]
    #[case(0, Some(EndReason::EmptyPage))]
    fn end_reason_follows_item_count(#[case] count: usize, #[case] expected: Option<EndReason>) {
        let page = ListingPage::from_response(&json!({"response": items(count)})).unwrap();
        assert_eq!(page.ids.len(), count);
        assert_eq!(page.end_reason(24), expected);
    }

    #[test]
    fn sentinel_wins_over_item_count() {
        let page = ListingPage::from_response(&json!({
            "status": {"code": "ERROR_ELASTIC"},
            "response": items(24)
        }))
        .unwrap();
        assert_eq!(page.end_reason(24), Some(EndReason::StatusSentinel));
    }

    #[test]
    fn sentinel_without_response_is_not_an_error() {
        let page = ListingPage::from_response(&json!({"status": {"code": "ERROR_ELASTIC"}})).unwrap();
        assert!(page.ids.is_empty());
        assert_eq!(page.end_reason(24), Some(EndReason::StatusSentinel));
    }

    #[test]
    fn items_without_id_are_counted_but_skipped() {
        let page = ListingPage::from_response(&json!({
            "response": [{"uniqueID": "a"}, {"title": "no id"}, {"uniqueID": 42}]
        }))
        .unwrap();
        assert_eq!(page.ids, vec![ItemId::from("a"), ItemId::from("42")]);
        assert_eq!(page.item_count, 3);
        assert_eq!(page.skipped, 1);
    }

    #[test]
    fn malformed_response_is_rejected() {
        assert_eq!(
            ListingPage::from_response(&json!({"status": {"code": "OK"}})),
            Err(PayloadError::MissingResponse)
        );
        assert_eq!(
            ListingPage::from_response(&json!({"response": "oops"})),
            Err(PayloadError::NotAnArray)
        );
    }
}
