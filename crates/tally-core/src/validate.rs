use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Accept only predictable ids (letters, numbers, dash) up to 128 chars
    static ref ITEM_ID_RE: Regex = Regex::new(r"^[A-Za-z0-9-]{1,128}$").unwrap();
}

/// Check an item id by syntactic shape only.
///
/// Ids are not checked against the catalog: unknown ids are accepted and
/// stored so the catalog can grow without invalidating existing progress.
pub fn is_valid_item_id(id: &str) -> bool {
    ITEM_ID_RE.is_match(id)
}
