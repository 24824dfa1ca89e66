//! Search-text modifier grammar (spec.md §6 "Search-text modifiers") and the
//! `{sort:FIELD:ORDER}` clause also used to declare an index's native sort
//! orders (spec.md §4.6).

use crate::lwps::SortOrder;

/// Resolve a field-name alias the way spec.md's modifier table lists them:
/// `relevance`/`r`, `rank`/`rk`, `date`/`d`. Any other token is taken
/// case-preserved as a literal field name.
pub fn resolve_field_alias(token: &str) -> String {
    match token.to_ascii_lowercase().as_str() {
        "relevance" | "r" => "relevance".to_string(),
        "rank" | "rk" => "rank".to_string(),
        "date" | "d" => "date".to_string(),
        _ => token.to_string(),
    }
}

fn parse_order(token: &str) -> Option<SortOrder> {
    match token.to_ascii_lowercase().as_str() {
        "asc" | "a" => Some(SortOrder::Asc),
        "desc" | "d" => Some(SortOrder::Desc),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortClause {
    None,
    Field { field: String, order: SortOrder },
}

/// Parse the body of a `{sort:...}` / `{s:...}` clause (without braces).
/// Accepts both the long and abbreviated (`s`) forms.
pub fn parse_sort_clause(body: &str) -> Option<SortClause> {
    let mut parts = body.splitn(3, ':');
    let head = parts.next()?;
    if !matches!(head.to_ascii_lowercase().as_str(), "sort" | "s") {
        return None;
    }

    let second = parts.next()?;
    if matches!(second.to_ascii_lowercase().as_str(), "none" | "n") {
        return Some(SortClause::None);
    }

    let third = parts.next()?;
    let order = parse_order(third)?;
    let field = resolve_field_alias(second);
    Some(SortClause::Field { field, order })
}

/// Per-request overrides extracted from free-form search text (spec.md §6).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    pub sort_clause: Option<SortClause>,
    pub early_completion_disabled: bool,
    pub connection_timeout_ms: Option<u64>,
    pub search_timeout_ms: Option<u64>,
    pub retrieval_timeout_ms: Option<u64>,
    pub information_timeout_ms: Option<u64>,
    pub mirror_affinity: Option<i32>,
    pub max_segments_searched: Option<u32>,
    pub min_segments_searched: Option<u32>,
}

impl SearchOptions {
    /// Any modifier besides the sort clause was present — these are the
    /// ones gated by `gateway-allow-search-overrides` (spec.md §6).
    pub fn has_overrides(&self) -> bool {
        self.early_completion_disabled
            || self.connection_timeout_ms.is_some()
            || self.search_timeout_ms.is_some()
            || self.retrieval_timeout_ms.is_some()
            || self.information_timeout_ms.is_some()
            || self.mirror_affinity.is_some()
            || self.max_segments_searched.is_some()
            || self.min_segments_searched.is_some()
    }
}

/// Scan `search_text` for recognized `{...}` modifier clauses, strip them
/// out, and return the cleaned query text plus the parsed options.
pub fn extract_search_options(search_text: &str) -> (String, SearchOptions) {
    let mut options = SearchOptions::default();
    let mut clean = String::with_capacity(search_text.len());

    let mut rest = search_text;
    while let Some(start) = rest.find('{') {
        clean.push_str(&rest[..start]);
        let after_brace = &rest[start + 1..];
        let end = match after_brace.find('}') {
            Some(e) => e,
            None => {
                // unterminated clause: keep the rest verbatim
                clean.push_str(&rest[start..]);
                rest = "";
                break;
            }
        };
        let body = &after_brace[..end];
        rest = &after_brace[end + 1..];

        if apply_modifier(body, &mut options) {
            // recognized: drop from the query text
        } else {
            // unrecognized clause: warn-and-ignore (spec.md §4.6) — still
            // dropped from the search text since it is not a query term.
            log::warn!("unrecognized search modifier clause '{{{}}}'", body);
        }
    }
    clean.push_str(rest);

    (clean.trim().to_string(), options)
}

fn apply_modifier(body: &str, options: &mut SearchOptions) -> bool {
    if let Some(clause) = parse_sort_clause(body) {
        options.sort_clause = Some(clause);
        return true;
    }

    let mut parts = body.splitn(2, ':');
    let key = match parts.next() {
        Some(k) => k.to_ascii_lowercase(),
        None => return false,
    };
    let value = parts.next();

    match key.as_str() {
        "gtwy_early_completion" | "gec" => {
            if matches!(value.map(str::to_ascii_lowercase).as_deref(), Some("disable") | Some("d")) {
                options.early_completion_disabled = true;
                true
            } else {
                false
            }
        }
        "gtwy_connection_timeout" | "gct" => parse_u64_into(value, &mut options.connection_timeout_ms),
        "gtwy_search_timeout" | "gst" => parse_u64_into(value, &mut options.search_timeout_ms),
        "gtwy_retrieval_timeout" | "grt" => parse_u64_into(value, &mut options.retrieval_timeout_ms),
        "gtwy_information_timeout" | "git" => parse_u64_into(value, &mut options.information_timeout_ms),
        "gtwy_mirror_affinity" | "gma" => {
            if let Some(v) = value.and_then(|v| v.parse::<i32>().ok()) {
                if v >= -1 {
                    options.mirror_affinity = Some(v);
                    return true;
                }
            }
            false
        }
        "gtwy_segments_searched_maximum" | "gssmx" => parse_u32_into(value, &mut options.max_segments_searched),
        "gtwy_segments_searched_minimum" | "gssmn" => parse_u32_into(value, &mut options.min_segments_searched),
        _ => false,
    }
}

fn parse_u64_into(value: Option<&str>, slot: &mut Option<u64>) -> bool {
    if let Some(v) = value.and_then(|v| v.parse::<u64>().ok()) {
        *slot = Some(v);
        true
    } else {
        false
    }
}

fn parse_u32_into(value: Option<&str>, slot: &mut Option<u32>) -> bool {
    if let Some(v) = value.and_then(|v| v.parse::<u32>().ok()) {
        *slot = Some(v);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_and_abbreviated_sort_clause() {
        assert_eq!(
            parse_sort_clause("sort:date:desc"),
            Some(SortClause::Field {
                field: "date".into(),
                order: SortOrder::Desc
            })
        );
        assert_eq!(
            parse_sort_clause("s:d:d"),
            Some(SortClause::Field {
                field: "date".into(),
                order: SortOrder::Desc
            })
        );
    }

    #[test]
    fn parses_sort_none() {
        assert_eq!(parse_sort_clause("sort:none"), Some(SortClause::None));
        assert_eq!(parse_sort_clause("s:n"), Some(SortClause::None));
    }

    #[test]
    fn extract_strips_modifiers_from_text() {
        let (clean, opts) = extract_search_options("hello {sort:date:desc} world {gst:500}");
        assert_eq!(clean, "hello  world");
        assert_eq!(
            opts.sort_clause,
            Some(SortClause::Field {
                field: "date".into(),
                order: SortOrder::Desc
            })
        );
        assert_eq!(opts.search_timeout_ms, Some(500));
        assert!(opts.has_overrides());
    }

    #[test]
    fn unrecognized_clause_is_dropped_and_warned() {
        let (clean, opts) = extract_search_options("term {bogus:thing}");
        assert_eq!(clean, "term");
        assert!(!opts.has_overrides());
        assert!(opts.sort_clause.is_none());
    }

    #[test]
    fn scenario_s6_override_value_parsed_but_gateway_may_refuse_to_apply() {
        // Parsing always succeeds; whether it's applied is the gateway's
        // allow-search-overrides decision (tested in gateway.rs).
        let (_clean, opts) = extract_search_options("{gtwy_search_timeout:10}");
        assert_eq!(opts.search_timeout_ms, Some(10));
    }
}
