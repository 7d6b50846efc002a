//! Inline citation extraction.
//!
//! The model cites retrieved passages with `!!<fetchUniqueId>!!` markers
//! placed right after the supported sentence. This module renumbers the
//! markers in first-appearance order, resolves each to the source link
//! carrying that correlation id, and optionally strips the markers from
//! the visible text. Markers whose id matches no known source are
//! dropped from the citation list without corrupting the text.

use std::collections::BTreeMap;

use regex::Regex;

use crate::models::SourceLink;

/// Options for [`extract_citations`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CitationOptions {
    /// Remove the renumbered markers from the returned text.
    pub clean_citations: bool,
}

/// Result of citation extraction.
#[derive(Debug, Clone)]
pub struct ExtractedCitations {
    pub content: String,
    /// Citation index (as renumbered in the text) → resolved source.
    pub cited_links: BTreeMap<usize, SourceLink>,
}

fn marker_regex() -> Regex {
    // Correlation ids are ASCII alphanumerics only.
    Regex::new(r"!!([0-9A-Za-z]+)!!").expect("static regex")
}

/// Extract and resolve inline citation markers.
pub fn extract_citations(
    content: &str,
    links: &[SourceLink],
    options: CitationOptions,
) -> ExtractedCitations {
    let re = marker_regex();

    // Unique marker ids in first-appearance order.
    let mut keys: Vec<String> = Vec::new();
    for capture in re.captures_iter(content) {
        let key = capture[1].to_string();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    let mut cleaned = content.to_string();
    let mut cited_links: BTreeMap<usize, SourceLink> = BTreeMap::new();

    for (index, key) in keys.iter().enumerate() {
        cleaned = cleaned.replace(&format!("!!{}!!", key), &format!("!!{}!!", index));

        match links.iter().find(|l| l.fetch_id.as_deref() == Some(key)) {
            Some(link) => {
                cited_links.insert(index, link.clone());
            }
            None => {
                tracing::debug!(marker = %key, "Citation marker has no matching source");
            }
        }
    }

    if options.clean_citations {
        let strip = Regex::new(r"!!([0-9]+)!!").expect("static regex");
        cleaned = strip.replace_all(&cleaned, "").to_string();
        // The model occasionally echoes the placeholder from the prompt.
        cleaned = cleaned.replace("!!<fetchUniqueId>!!", "");
    }

    ExtractedCitations {
        content: cleaned,
        cited_links,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(fetch_id: &str, url: &str) -> SourceLink {
        SourceLink {
            url: Some(url.to_string()),
            title: Some(format!("Title for {}", fetch_id)),
            score: 0.9,
            item_id: None,
            fetch_id: Some(fetch_id.to_string()),
            group_id: None,
            search_query: None,
        }
    }

    #[test]
    fn test_roundtrip_resolves_and_cleans() {
        let links = vec![link("abc123", "https://e.com/a")];
        let result = extract_citations(
            "The plan costs $10.!!abc123!!",
            &links,
            CitationOptions {
                clean_citations: true,
            },
        );
        assert_eq!(result.content, "The plan costs $10.");
        assert_eq!(result.cited_links.len(), 1);
        assert_eq!(
            result.cited_links[&0].url.as_deref(),
            Some("https://e.com/a")
        );
    }

    #[test]
    fn test_renumbering_in_first_appearance_order() {
        let links = vec![link("zzz", "https://e.com/z"), link("aaa", "https://e.com/a")];
        let result = extract_citations(
            "First claim.!!zzz!! Second claim.!!aaa!! Repeat.!!zzz!!",
            &links,
            CitationOptions::default(),
        );
        assert_eq!(
            result.content,
            "First claim.!!0!! Second claim.!!1!! Repeat.!!0!!"
        );
        assert_eq!(result.cited_links[&0].url.as_deref(), Some("https://e.com/z"));
        assert_eq!(result.cited_links[&1].url.as_deref(), Some("https://e.com/a"));
    }

    #[test]
    fn test_unknown_marker_dropped_but_text_intact() {
        let links = vec![link("abc123", "https://e.com/a")];
        let result = extract_citations(
            "Known.!!abc123!! Unknown.!!zzz!! End.",
            &links,
            CitationOptions {
                clean_citations: true,
            },
        );
        assert_eq!(result.content, "Known. Unknown. End.");
        assert_eq!(result.cited_links.len(), 1);
        assert!(result.cited_links.values().all(|l| l.fetch_id.as_deref() == Some("abc123")));
    }

    #[test]
    fn test_no_markers_is_a_noop() {
        let result = extract_citations("Plain answer.", &[], CitationOptions::default());
        assert_eq!(result.content, "Plain answer.");
        assert!(result.cited_links.is_empty());
    }

    #[test]
    fn test_prompt_placeholder_echo_is_stripped() {
        let result = extract_citations(
            "Answer.!!<fetchUniqueId>!!",
            &[],
            CitationOptions {
                clean_citations: true,
            },
        );
        assert_eq!(result.content, "Answer.");
    }

    #[test]
    fn test_dedupes_repeated_markers_in_citation_list() {
        let links = vec![link("abc", "https://e.com/a")];
        let result = extract_citations(
            "One.!!abc!! Two.!!abc!! Three.!!abc!!",
            &links,
            CitationOptions::default(),
        );
        assert_eq!(result.cited_links.len(), 1);
        assert_eq!(result.content, "One.!!0!! Two.!!0!! Three.!!0!!");
    }
}
