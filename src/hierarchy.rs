//! Hierarchical location tags.
//!
//! A leaf selection such as `Residential Interior / Private Spaces / Bathroom /
//! Full` is stored as its full prefix chain, one tag per ancestor:
//!
//! ```text
//! Residential Interior
//! Residential Interior > Private Spaces
//! Residential Interior > Private Spaces > Bathroom
//! Residential Interior > Private Spaces > Bathroom > Full
//! ```
//!
//! A payload may carry several chains; shared ancestors may repeat.

use std::collections::HashSet;

use crate::commit::ValidationError;

/// Separator between path segments inside one tag.
pub const SEPARATOR: &str = " > ";

/// Expand a leaf path into its prefix chain.
pub fn expand_chain<S: AsRef<str>>(path: &[S]) -> Vec<String> {
    (1..=path.len())
        .map(|i| {
            path[..i]
                .iter()
                .map(|s| s.as_ref())
                .collect::<Vec<_>>()
                .join(SEPARATOR)
        })
        .collect()
}

/// The tag one level up, or `None` for a root tag.
pub fn parent(tag: &str) -> Option<&str> {
    tag.rfind(SEPARATOR).map(|i| &tag[..i])
}

/// Check that `tags` is a sequence of complete prefix chains.
///
/// Every tag must have non-empty segments, and its parent must appear
/// earlier in the sequence.
pub fn validate_chain(tags: &[String]) -> Result<(), ValidationError> {
    if tags.is_empty() {
        return Err(ValidationError::NoLocation);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for tag in tags {
        if tag.split(SEPARATOR).any(|seg| seg.trim().is_empty()) {
            return Err(ValidationError::MalformedTag { tag: tag.clone() });
        }
        if let Some(parent) = parent(tag) {
            if !seen.contains(parent) {
                return Err(ValidationError::IncompleteHierarchy {
                    tag: tag.clone(),
                    missing: parent.to_string(),
                });
            }
        }
        seen.insert(tag);
    }
    Ok(())
}
