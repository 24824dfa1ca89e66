//! Request dispatch: fan-out orchestration, merge/sort/splice, and
//! retrieval routing (spec.md §4.7).

use std::time::{Duration, Instant};

use crate::error::{GatewayError, RequestError, TransportError};
use crate::index::{LogicalIndex, Origin};
use crate::lwps::{
    ResultRow, RetrievalChunk, RetrievalRequest, SearchRequest, SearchResponse, SortKeyValue,
    SortOrder, SortType, Transport,
};
use crate::modifiers::{extract_search_options, SortClause};

/// One caller-supplied search, before per-index fan-out (spec.md §4.7 "Entry").
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub language: Option<String>,
    pub search_text: String,
    pub positive_feedback: Option<String>,
    pub negative_feedback: Option<String>,
    pub start_index: u32,
    pub end_index: u32,
}

#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub rows: Vec<ResultRow>,
    pub total_results: u64,
    pub max_sort_key: Option<f64>,
    pub sort_type: SortType,
    pub elapsed_ms: u64,
}

struct PerIndexResult {
    rows: Vec<ResultRow>,
    total_results: u64,
    max_sort_key: Option<f64>,
    sort_type: SortType,
}

fn empty_result() -> PerIndexResult {
    PerIndexResult {
        rows: Vec::new(),
        total_results: 0,
        max_sort_key: None,
        sort_type: SortType::None,
    }
}

/// spec.md §4.7 "Per-index search": everything one index's worker does,
/// including the §4.7 "Early-completion" split.
fn search_one_index(
    index: &mut LogicalIndex,
    transport: &dyn Transport,
    send_init: bool,
    request: &SearchRequest,
    sort_clause: &Option<SortClause>,
    early_completion_disabled: bool,
) -> PerIndexResult {
    let segment_count = index.segment_count();
    if segment_count == 0 {
        return empty_result();
    }

    let early_completion_applicable = !early_completion_disabled
        && !index.sort_orders.is_empty()
        && index.effective_min_segments_searched > 0
        && index.effective_min_segments_searched < segment_count as u32
        && sort_clause.is_some();

    let result = if early_completion_applicable {
        let clause = sort_clause.as_ref().unwrap();
        let (reverse_order, walk_natural_order) = match clause {
            SortClause::None => (false, true),
            SortClause::Field { field, order } => {
                let declared = index.sort_orders.iter().find(|e| &e.field == field);
                match declared {
                    Some(entry) => (entry.order != *order, false),
                    None => (false, true),
                }
            }
        };
        search_with_early_completion(
            index,
            transport,
            send_init,
            request,
            reverse_order,
            walk_natural_order,
        )
    } else {
        search_all_segments(index, transport, send_init, request)
    };

    result
}

/// spec.md §4.7 "Phase B (no early-completion)": every segment in parallel,
/// merge totals linearly.
fn search_all_segments(
    index: &mut LogicalIndex,
    transport: &dyn Transport,
    send_init: bool,
    request: &SearchRequest,
) -> PerIndexResult {
    let search_timeout_ms = index.effective_timeouts.search_ms;
    let connection_timeout_ms = index.effective_timeouts.connection_ms;
    let mirror_affinity = index.effective_mirror_affinity;
    let ignore_search_error = index.flags.ignore_search_error;
    let origin = index.origin;

    let outcomes: Vec<Option<SearchResponse>> = if index.segments.len() > 1 {
        std::thread::scope(|scope| {
            let handles: Vec<_> = index
                .segments
                .iter_mut()
                .map(|segment| {
                    let request = request.clone();
                    scope.spawn(move || {
                        segment.search(
                            &request,
                            transport,
                            connection_timeout_ms,
                            send_init,
                            mirror_affinity,
                            search_timeout_ms,
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(index.segments.iter())
                .map(|(h, seg)| {
                    let res = h.join().unwrap();
                    finish_segment_outcome(res, seg.connected_mirror_url(), origin, ignore_search_error)
                })
                .collect()
        })
    } else if let Some(segment) = index.segments.first_mut() {
        let res = segment.search(
            request,
            transport,
            connection_timeout_ms,
            send_init,
            mirror_affinity,
            search_timeout_ms,
        );
        let mirror_url = segment.connected_mirror_url();
        vec![finish_segment_outcome(res, mirror_url, origin, ignore_search_error)]
    } else {
        Vec::new()
    };

    merge_segment_outcomes(outcomes)
}

fn finish_segment_outcome(
    result: Result<SearchResponse, TransportError>,
    mirror_url: Option<String>,
    origin: Origin,
    ignore_search_error: bool,
) -> Option<SearchResponse> {
    match result {
        Ok(mut response) => {
            rewrite_rows(&mut response.rows, mirror_url, origin);
            Some(response)
        }
        Err(err) => {
            if ignore_search_error {
                log::warn!("segment search failed, ignored per index policy: {}", err);
                None
            } else {
                log::warn!("segment search failed: {}", err);
                None
            }
        }
    }
}

fn rewrite_rows(rows: &mut [ResultRow], mirror_url: Option<String>, origin: Origin) {
    for row in rows.iter_mut() {
        row.served_by_mirror = mirror_url.clone();
        if origin == Origin::FromConfig {
            if let Some(url) = &mirror_url {
                row.document_key = format!("{}/{}", url, row.document_key);
            }
        }
    }
}

fn merge_segment_outcomes(outcomes: Vec<Option<SearchResponse>>) -> PerIndexResult {
    let mut merged = empty_result();
    let mut sort_type_set = false;

    for outcome in outcomes.into_iter().flatten() {
        merged.rows.extend(outcome.rows);
        merged.total_results += outcome.total_results;
        merged.max_sort_key = match (merged.max_sort_key, outcome.max_sort_key) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, None) => a,
            (None, b) => b,
        };
        if !sort_type_set {
            merged.sort_type = outcome.sort_type;
            sort_type_set = true;
        } else if merged.sort_type != outcome.sort_type {
            merged.sort_type = SortType::Unknown;
        }
    }

    merged
}

/// spec.md §4.7 "Phase A (early-completion path)".
fn search_with_early_completion(
    index: &mut LogicalIndex,
    transport: &dyn Transport,
    send_init: bool,
    request: &SearchRequest,
    reverse_order: bool,
    _walk_natural_order: bool,
) -> PerIndexResult {
    let segment_count = index.segments.len();
    let min_segments = index.effective_min_segments_searched as usize;
    let max_segments = if index.effective_max_segments_searched == 0 {
        segment_count
    } else {
        index.effective_max_segments_searched as usize
    };
    let end_index = request.end_index as u64;

    let order: Vec<usize> = if reverse_order {
        (0..segment_count).rev().collect()
    } else {
        (0..segment_count).collect()
    };

    let connection_timeout_ms = index.effective_timeouts.connection_ms;
    let search_timeout_ms = index.effective_timeouts.search_ms;
    let mirror_affinity = index.effective_mirror_affinity;
    let ignore_search_error = index.flags.ignore_search_error;
    let origin = index.origin;

    let parallel_count = min_segments.min(order.len());
    let (parallel_segments, sequential_segments) = order.split_at(parallel_count);

    // Phase A.1: run up to min_segments_searched in parallel.
    let mut outcomes: Vec<Option<SearchResponse>> = {
        let segments = &mut index.segments;
        std::thread::scope(|scope| {
            let handles: Vec<_> = parallel_segments
                .iter()
                .map(|&seg_idx| {
                    let request = request.clone();
                    let segment = &mut segments[seg_idx];
                    scope.spawn(move || {
                        let res = segment.search(
                            &request,
                            transport,
                            connection_timeout_ms,
                            send_init,
                            mirror_affinity,
                            search_timeout_ms,
                        );
                        (res, segment.connected_mirror_url())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    let (res, mirror_url) = h.join().unwrap();
                    finish_segment_outcome(res, mirror_url, origin, ignore_search_error)
                })
                .collect()
        })
    };

    let mut remaining_budget = Duration::from_millis(search_timeout_ms);
    let start = Instant::now();
    let mut segments_searched = parallel_count;

    // Phase A.2: continue sequentially.
    for &seg_idx in sequential_segments {
        if segments_searched >= max_segments {
            break;
        }
        let elapsed = start.elapsed();
        if elapsed >= remaining_budget {
            break;
        }
        let accumulated: u64 = outcomes
            .iter()
            .flatten()
            .map(|r| r.rows.len() as u64)
            .sum();
        if accumulated > end_index {
            break;
        }

        let iteration_start = Instant::now();
        let segment = &mut index.segments[seg_idx];
        let res = segment.search(
            request,
            transport,
            connection_timeout_ms,
            send_init,
            mirror_affinity,
            search_timeout_ms.saturating_sub(elapsed.as_millis() as u64).max(1),
        );
        let mirror_url = segment.connected_mirror_url();
        outcomes.push(finish_segment_outcome(res, mirror_url, origin, ignore_search_error));
        segments_searched += 1;

        let spent = iteration_start.elapsed();
        remaining_budget = remaining_budget.saturating_sub(spent);
    }

    let skipped = segments_searched < segment_count;
    let mut merged = merge_segment_outcomes(outcomes);

    // spec.md §4.7 "Total-results estimation for partial searches".
    #[cfg(feature = "total-results-estimation")]
    if skipped && segments_searched > 0 {
        let ratio = segment_count as f64 / segments_searched as f64;
        merged.total_results = (merged.total_results as f64 * ratio).round() as u64;
    }
    #[cfg(not(feature = "total-results-estimation"))]
    let _ = skipped;

    merged
}

/// spec.md §4.7 "Merge": combine every index's per-index result.
fn merge_indices(results: Vec<PerIndexResult>) -> PerIndexResult {
    let mut merged = empty_result();
    let mut sort_type_set = false;

    for result in results {
        merged.total_results += result.total_results;
        merged.max_sort_key = match (merged.max_sort_key, result.max_sort_key) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, None) => a,
            (None, b) => b,
        };
        if !sort_type_set {
            merged.sort_type = result.sort_type;
            sort_type_set = true;
        } else if merged.sort_type != result.sort_type {
            merged.sort_type = SortType::Unknown;
        }
        merged.rows.extend(result.rows);
    }

    if merged.sort_type == SortType::Unknown {
        // "free any character sort keys ... they are meaningless after
        // heterogeneous merge" — in Rust terms, normalize them to None.
        for row in merged.rows.iter_mut() {
            if let SortKeyValue::UChar(_) = row.sort_key {
                row.sort_key = SortKeyValue::None;
            }
        }
    }

    merged
}

/// spec.md §4.7 "Sort & splice": global sort by the common sort type, then
/// splice to `[start_index, end_index]`.
fn sort_and_splice(mut rows: Vec<ResultRow>, sort_type: SortType, start_index: u32, end_index: u32) -> Vec<ResultRow> {
    match sort_type {
        SortType::UintAsc => rows.sort_by_key(|r| match r.sort_key {
            SortKeyValue::Uint(v) => v,
            _ => 0,
        }),
        SortType::UintDesc => {
            rows.sort_by_key(|r| std::cmp::Reverse(match r.sort_key {
                SortKeyValue::Uint(v) => v,
                _ => 0,
            }))
        }
        SortType::DoubleAsc => rows.sort_by(|a, b| {
            let av = match a.sort_key {
                SortKeyValue::Double(v) => v,
                _ => 0.0,
            };
            let bv = match b.sort_key {
                SortKeyValue::Double(v) => v,
                _ => 0.0,
            };
            av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortType::DoubleDesc => rows.sort_by(|a, b| {
            let av = match a.sort_key {
                SortKeyValue::Double(v) => v,
                _ => 0.0,
            };
            let bv = match b.sort_key {
                SortKeyValue::Double(v) => v,
                _ => 0.0,
            };
            bv.partial_cmp(&av).unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortType::UCharAsc => rows.sort_by(|a, b| {
            let av = match &a.sort_key {
                SortKeyValue::UChar(v) => v.as_str(),
                _ => "",
            };
            let bv = match &b.sort_key {
                SortKeyValue::UChar(v) => v.as_str(),
                _ => "",
            };
            av.cmp(bv)
        }),
        SortType::UCharDesc => rows.sort_by(|a, b| {
            let av = match &a.sort_key {
                SortKeyValue::UChar(v) => v.as_str(),
                _ => "",
            };
            let bv = match &b.sort_key {
                SortKeyValue::UChar(v) => v.as_str(),
                _ => "",
            };
            bv.cmp(av)
        }),
        SortType::None | SortType::Unknown => {}
    }

    let start = start_index as usize;
    let end = (end_index as usize).min(rows.len().saturating_sub(1));
    if start >= rows.len() {
        return Vec::new();
    }
    rows[start..=end.max(start)].to_vec()
}

/// spec.md §4.7 "Entry" through "Merge"/"Sort & splice": the full fan-out
/// for one logical search across one or more already-open indices.
pub fn dispatch_search(
    indices: &mut [LogicalIndex],
    transport: &dyn Transport,
    send_init: bool,
    allow_overrides: bool,
    request: &DispatchRequest,
) -> DispatchResponse {
    let start = Instant::now();

    // Prologue (spec.md §4.7 steps 1-2).
    for index in indices.iter_mut() {
        index.reset_temporary_errors();
        index.reset_search_overrides();
    }

    let (clean_text, options) = extract_search_options(&request.search_text);
    if allow_overrides {
        for index in indices.iter_mut() {
            apply_overrides(index, &options);
        }
    }

    let multi_gateway_index = indices.len() > 1;
    let multi_index =
        multi_gateway_index || indices.iter().any(|i| i.segment_count() > 1);

    let effective_start_index = if multi_index { 0 } else { request.start_index };

    let sort_field_order = options.sort_clause.clone();
    let wire_request = SearchRequest {
        search_text: clean_text,
        positive_feedback: request.positive_feedback.clone(),
        negative_feedback: request.negative_feedback.clone(),
        language: request.language.clone(),
        start_index: effective_start_index,
        end_index: request.end_index,
        sort_field: sort_field_from_clause(&sort_field_order),
        sort_order: sort_order_from_clause(&sort_field_order),
    };

    let per_index_results: Vec<PerIndexResult> = if indices.len() > 1 {
        std::thread::scope(|scope| {
            let handles: Vec<_> = indices
                .iter_mut()
                .map(|index| {
                    let wire_request = wire_request.clone();
                    let sort_field_order = sort_field_order.clone();
                    scope.spawn(move || {
                        search_one_index(
                            index,
                            transport,
                            send_init,
                            &wire_request,
                            &sort_field_order,
                            options.early_completion_disabled,
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    } else {
        indices
            .iter_mut()
            .map(|index| {
                search_one_index(
                    index,
                    transport,
                    send_init,
                    &wire_request,
                    &sort_field_order,
                    options.early_completion_disabled,
                )
            })
            .collect()
    };

    // "On join, override every returned result's index_name field with the
    // logical index name" (spec.md §4.7).
    let mut per_index_results = per_index_results;
    for (index, result) in indices.iter().zip(per_index_results.iter_mut()) {
        for row in result.rows.iter_mut() {
            row.index_name = index.name.clone();
        }
    }

    let merged = merge_indices(per_index_results);
    let rows = if multi_index {
        sort_and_splice(merged.rows, merged.sort_type, request.start_index, request.end_index)
    } else {
        merged.rows
    };

    DispatchResponse {
        rows,
        total_results: merged.total_results,
        max_sort_key: merged.max_sort_key,
        sort_type: merged.sort_type,
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

fn sort_field_from_clause(clause: &Option<SortClause>) -> Option<String> {
    match clause {
        Some(SortClause::Field { field, .. }) => Some(field.clone()),
        _ => None,
    }
}

fn sort_order_from_clause(clause: &Option<SortClause>) -> Option<SortOrder> {
    match clause {
        Some(SortClause::Field { order, .. }) => Some(*order),
        _ => None,
    }
}

fn apply_overrides(index: &mut LogicalIndex, options: &crate::modifiers::SearchOptions) {
    if !options.has_overrides() {
        return;
    }
    if let Some(ms) = options.connection_timeout_ms {
        index.effective_timeouts.connection_ms = ms;
    }
    if let Some(ms) = options.search_timeout_ms {
        index.effective_timeouts.search_ms = ms;
    }
    if let Some(ms) = options.retrieval_timeout_ms {
        index.effective_timeouts.retrieval_ms = ms;
    }
    if let Some(ms) = options.information_timeout_ms {
        index.effective_timeouts.information_ms = ms;
    }
    if let Some(affinity) = options.mirror_affinity {
        index.effective_mirror_affinity = affinity;
    }
    let segment_count = index.segment_count() as u32;
    if let Some(max) = options.max_segments_searched {
        index.effective_max_segments_searched = if max == 0 || max > segment_count {
            segment_count
        } else {
            max
        };
    }
    if let Some(min) = options.min_segments_searched {
        index.effective_min_segments_searched = min.min(index.effective_max_segments_searched);
    }
}

/// spec.md §4.7 "Retrieval dispatch": recover `(host, port, index, key)` from
/// a rewritten document key, matching a segment's mirror exactly.
pub fn parse_rewritten_key(key: &str) -> Option<(String, u16, String, String)> {
    let rest = key.strip_prefix("lwps://")?;
    let (host_port, rest) = rest.split_once('/')?;
    let (remote_index_name, real_key) = rest.split_once('/')?;
    let (host, port) = host_port.split_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port, remote_index_name.to_string(), real_key.to_string()))
}

/// spec.md §4.7 "Retrieval dispatch": route a retrieval to the segment (and,
/// for search-report items, the exact mirror) that the document key names;
/// fall back to the first segment when the key carries no rewrite prefix.
pub fn dispatch_retrieve(
    index: &mut LogicalIndex,
    transport: &dyn Transport,
    send_init: bool,
    document_key: &str,
    item: &str,
    mime_type: Option<&str>,
    chunk_type: Option<&str>,
    chunk_start: Option<u64>,
    chunk_end: Option<u64>,
    is_search_report_item: bool,
) -> Result<RetrievalChunk, GatewayError> {
    let connection_timeout_ms = index.effective_timeouts.connection_ms;
    let retrieval_timeout_ms = index.effective_timeouts.retrieval_ms;
    let mirror_affinity = index.effective_mirror_affinity;

    let (segment_idx, real_key, target_mirror) = match parse_rewritten_key(document_key) {
        Some((host, port, remote_index_name, real_key)) => {
            let canonical = format!("lwps://{}:{}/{}", host, port, remote_index_name);
            let found = index.segments.iter().position(|segment| {
                segment
                    .mirrors
                    .iter()
                    .any(|m| m.location.canonical_url() == canonical)
            });
            match found {
                Some(idx) => (
                    idx,
                    real_key,
                    if is_search_report_item { Some(canonical) } else { None },
                ),
                None => (0, document_key.to_string(), None),
            }
        }
        None => (0, document_key.to_string(), None),
    };

    if index.segments.is_empty() {
        return Err(GatewayError::Request(RequestError::InvalidDocumentKey(
            document_key.to_string(),
        )));
    }

    let request = RetrievalRequest {
        document_key: real_key,
        item: item.to_string(),
        mime_type: mime_type.map(str::to_string),
        chunk_type: chunk_type.map(str::to_string),
        chunk_start,
        chunk_end,
    };

    let segment = &mut index.segments[segment_idx.min(index.segments.len() - 1)];
    segment
        .retrieve(
            &request,
            transport,
            connection_timeout_ms,
            send_init,
            mirror_affinity,
            retrieval_timeout_ms,
            target_mirror.as_deref(),
        )
        .map_err(|e| GatewayError::Transport(e.into()))
}
