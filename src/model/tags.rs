//! Tag normalization
//!
//! Tags arrive from callers in whatever shape they were typed. Everything
//! stored in either store goes through [`normalize_tags`] first.

use std::collections::BTreeSet;

/// Normalize a collection of tags: trim, lowercase, drop empties, dedupe.
///
/// The result is ordered, so two normalized tag sets compare equal exactly
/// when they contain the same tags. Normalizing an already normalized set
/// returns it unchanged.
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .filter_map(|tag| {
            let tag = tag.as_ref().trim();
            if tag.is_empty() {
                None
            } else {
                Some(tag.to_lowercase())
            }
        })
        .collect()
}
