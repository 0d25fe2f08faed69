/// Entity compression — deterministic, reversible, zero model calls.
///
/// Long strings that repeat across a conversation (paths, class names,
/// function names, URLs) are substituted with short ids (`E1`, `E2`, …).
/// A markdown legend maps ids back to values; decompression is exact.
///
/// Substitution is purely textual and only touches text blocks and tool
/// result bodies — tool inputs and images are never rewritten.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::messages::Message;

// ── Entities ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Path,
    Class,
    Function,
    Url,
}

impl EntityKind {
    fn legend_heading(&self) -> &'static str {
        match self {
            EntityKind::Path => "Paths",
            EntityKind::Class => "Classes",
            EntityKind::Function => "Functions",
            EntityKind::Url => "URLs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub value: String,
    pub kind: EntityKind,
    pub count: usize,
    pub first_seen_index: usize,
}

/// An entity only pays for itself when the substitution saves more
/// characters than the id costs: `(len - 3) * count > 0`.
fn worth_materializing(value: &str, count: usize) -> bool {
    count >= 2 && value.chars().count() > 3
}

// ── Recognizers ───────────────────────────────────────────────────────────────

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s"'<>)\]]+"#).unwrap())
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // At least two segments separated by '/'.
    RE.get_or_init(|| Regex::new(r"(?:\.{1,2}/)?[A-Za-z0-9_@.-]+(?:/[A-Za-z0-9_@.-]+)+").unwrap())
}

fn class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z][A-Za-z0-9]{2,}\b").unwrap())
}

// regex has no lookahead; the call recognizer captures the identifier and
// uses the capture span, ignoring the trailing paren.
fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([a-z][A-Za-z0-9]*)\s*\(").unwrap())
}

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"E\d+").unwrap())
}

#[derive(Debug)]
struct Candidate {
    start: usize,
    value: String,
    kind: EntityKind,
}

fn overlaps(claimed: &[(usize, usize)], start: usize, end: usize) -> bool {
    claimed.iter().any(|&(s, e)| start < e && s < end)
}

/// Paths and URLs at sentence end drag punctuation into the match;
/// trim it so "src/auth.ts" and "src/auth.ts." count as one value.
fn trim_trailing_punct(value: &str) -> &str {
    value.trim_end_matches(['.', ',', ';', ':', '!', '?'])
}

/// Scan the joined text with all four recognizers. URL spans are claimed
/// first so a path inside a URL is not double-counted; id assignment later
/// follows the recognizer listing order (path, class, function, url).
fn collect_candidates(joined: &str) -> Vec<Candidate> {
    let mut claimed: Vec<(usize, usize)> = Vec::new();
    let mut out: Vec<Candidate> = Vec::new();

    for m in url_re().find_iter(joined) {
        let value = trim_trailing_punct(m.as_str());
        let end = m.start() + value.len();
        claimed.push((m.start(), end));
        out.push(Candidate { start: m.start(), value: value.to_string(), kind: EntityKind::Url });
    }

    for m in path_re().find_iter(joined) {
        let value = trim_trailing_punct(m.as_str());
        if !value.contains('/') {
            continue;
        }
        let end = m.start() + value.len();
        if overlaps(&claimed, m.start(), end) {
            continue;
        }
        claimed.push((m.start(), end));
        out.push(Candidate { start: m.start(), value: value.to_string(), kind: EntityKind::Path });
    }

    for m in class_re().find_iter(joined) {
        if overlaps(&claimed, m.start(), m.end()) {
            continue;
        }
        claimed.push((m.start(), m.end()));
        out.push(Candidate {
            start: m.start(),
            value: m.as_str().to_string(),
            kind: EntityKind::Class,
        });
    }

    for c in call_re().captures_iter(joined) {
        let m = c.get(1).expect("call recognizer capture");
        if overlaps(&claimed, m.start(), m.end()) {
            continue;
        }
        claimed.push((m.start(), m.end()));
        out.push(Candidate {
            start: m.start(),
            value: m.as_str().to_string(),
            kind: EntityKind::Function,
        });
    }

    out
}

fn joined_text(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.text_content())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract repeated entities from a conversation. Ids are assigned per
/// recognizer pass (paths, then classes, functions, urls), first occurrence
/// first within each pass.
pub fn extract_entities(messages: &[Message]) -> Vec<Entity> {
    let joined = joined_text(messages);
    let candidates = collect_candidates(&joined);

    // value → (kind, count, first_seen)
    let mut tally: Vec<(String, EntityKind, usize, usize)> = Vec::new();
    for c in &candidates {
        if let Some(entry) = tally.iter_mut().find(|(v, k, _, _)| v == &c.value && *k == c.kind) {
            entry.2 += 1;
            entry.3 = entry.3.min(c.start);
        } else {
            tally.push((c.value.clone(), c.kind, 1, c.start));
        }
    }

    let kind_order = [EntityKind::Path, EntityKind::Class, EntityKind::Function, EntityKind::Url];
    let mut entities: Vec<Entity> = Vec::new();
    for kind in kind_order {
        let mut of_kind: Vec<&(String, EntityKind, usize, usize)> = tally
            .iter()
            .filter(|(v, k, count, _)| *k == kind && worth_materializing(v, *count))
            .collect();
        of_kind.sort_by_key(|(_, _, _, first)| *first);
        for (value, kind, count, first) in of_kind {
            entities.push(Entity {
                id: format!("E{}", entities.len() + 1),
                value: value.clone(),
                kind: *kind,
                count: *count,
                first_seen_index: *first,
            });
        }
    }
    entities
}

// ── Compression ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub messages: Vec<Message>,
    pub entities: Vec<Entity>,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compression_ratio: f64,
}

/// Substitute every entity value with its id across all textual content.
/// Longer values are replaced first so a value that contains another
/// value's text cannot be corrupted mid-replacement.
pub fn compress(messages: &[Message]) -> CompressionResult {
    let entities = extract_entities(messages);

    let mut by_len: Vec<&Entity> = entities.iter().collect();
    by_len.sort_by(|a, b| b.value.len().cmp(&a.value.len()));

    let original_size: usize = messages.iter().map(|m| m.text_content().chars().count()).sum();

    let mut out: Vec<Message> = messages.to_vec();
    for msg in out.iter_mut() {
        msg.map_text(&|text| {
            let mut t = text.to_string();
            for e in &by_len {
                if t.contains(&e.value) {
                    t = t.replace(&e.value, &e.id);
                }
            }
            t
        });
    }

    let compressed_size: usize = out.iter().map(|m| m.text_content().chars().count()).sum();
    let compression_ratio = if compressed_size == 0 {
        1.0
    } else {
        original_size as f64 / compressed_size as f64
    };

    CompressionResult { messages: out, entities, original_size, compressed_size, compression_ratio }
}

// ── Legend ────────────────────────────────────────────────────────────────────

/// Deterministic markdown block used to prime decompression after the
/// compressed text is persisted.
pub fn generate_legend(entities: &[Entity]) -> String {
    if entities.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Entity References\n");
    for kind in [EntityKind::Path, EntityKind::Class, EntityKind::Function, EntityKind::Url] {
        let mut of_kind: Vec<&Entity> = entities.iter().filter(|e| e.kind == kind).collect();
        if of_kind.is_empty() {
            continue;
        }
        of_kind.sort_by_key(|e| id_number(&e.id));
        out.push_str(&format!("\n### {}\n", kind.legend_heading()));
        for e in of_kind {
            out.push_str(&format!("- {}: {}\n", e.id, e.value));
        }
    }
    out
}

/// Recover entities from a legend block embedded in a summary message.
/// Counts and positions are not recorded in the legend and come back zeroed.
pub fn parse_legend(text: &str) -> Vec<Entity> {
    let mut entities = Vec::new();
    let mut kind = EntityKind::Path;
    let mut in_legend = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed == "## Entity References" {
            in_legend = true;
            continue;
        }
        if !in_legend {
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix("### ") {
            kind = match heading {
                "Paths" => EntityKind::Path,
                "Classes" => EntityKind::Class,
                "Functions" => EntityKind::Function,
                "URLs" => EntityKind::Url,
                _ => continue,
            };
            continue;
        }
        if trimmed.starts_with("## ") {
            break; // next section — legend over
        }
        if let Some(rest) = trimmed.strip_prefix("- E") {
            if let Some((num, value)) = rest.split_once(": ") {
                if num.chars().all(|c| c.is_ascii_digit()) && !value.is_empty() {
                    entities.push(Entity {
                        id: format!("E{num}"),
                        value: value.to_string(),
                        kind,
                        count: 0,
                        first_seen_index: 0,
                    });
                }
            }
        }
    }
    entities
}

fn id_number(id: &str) -> usize {
    id.trim_start_matches('E').parse().unwrap_or(0)
}

// ── Decompression ─────────────────────────────────────────────────────────────

fn lookup<'a>(entities: &'a [Entity], id: &str) -> Option<&'a Entity> {
    entities.iter().find(|e| e.id == id)
}

/// Replace ids with their values. Matching is greedy-longest: the regex
/// consumes the maximal digit run, and when that exact id is unknown the
/// longest known prefix wins (covers an id immediately followed by digits
/// in the surrounding text).
pub fn decompress(text: &str, entities: &[Entity]) -> String {
    if entities.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in id_re().find_iter(text) {
        out.push_str(&text[last..m.start()]);
        let token = m.as_str();
        if let Some(e) = lookup(entities, token) {
            out.push_str(&e.value);
        } else if let Some((e, rest)) = longest_prefix_entity(entities, token) {
            out.push_str(&e.value);
            out.push_str(rest);
        } else {
            out.push_str(token);
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Longest known id that is a proper prefix of `token`, with the leftover.
fn longest_prefix_entity<'a>(entities: &'a [Entity], token: &'a str) -> Option<(&'a Entity, &'a str)> {
    for cut in (2..token.len()).rev() {
        if let Some(e) = lookup(entities, &token[..cut]) {
            return Some((e, &token[cut..]));
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingChunk {
    pub decompressed: String,
    pub remaining: String,
}

/// Decompress a stream fragment. A trailing `E\d*` token that could still
/// grow into a known longer id is held back in `remaining`; the caller
/// prepends it to the next fragment (and flushes it verbatim at end of
/// stream). Concatenating the outputs of any split equals single-shot
/// `decompress` of the whole text.
pub fn decompress_streaming(chunk: &str, entities: &[Entity]) -> StreamingChunk {
    if entities.is_empty() {
        return StreamingChunk { decompressed: chunk.to_string(), remaining: String::new() };
    }

    let hold_from = trailing_token_start(chunk).filter(|&p| must_hold(&chunk[p..], entities));

    match hold_from {
        Some(p) => StreamingChunk {
            decompressed: decompress(&chunk[..p], entities),
            remaining: chunk[p..].to_string(),
        },
        None => StreamingChunk {
            decompressed: decompress(chunk, entities),
            remaining: String::new(),
        },
    }
}

/// Byte offset of a trailing `E\d*` token, if the chunk ends in one.
fn trailing_token_start(chunk: &str) -> Option<usize> {
    let bytes = chunk.as_bytes();
    let mut i = bytes.len();
    while i > 0 && bytes[i - 1].is_ascii_digit() {
        i -= 1;
    }
    if i > 0 && bytes[i - 1] == b'E' {
        Some(i - 1)
    } else {
        None
    }
}

/// Hold the token back iff some known id extends it: a bare "E" can become
/// any id, and "E1" must wait when "E12" exists. A token no id extends is
/// safe to emit now — it is either complete or literal text.
fn must_hold(token: &str, entities: &[Entity]) -> bool {
    entities.iter().any(|e| e.id.len() > token.len() && e.id.starts_with(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, value: &str, kind: EntityKind) -> Entity {
        Entity { id: id.into(), value: value.into(), kind, count: 2, first_seen_index: 0 }
    }

    #[test]
    fn test_round_trip_scenario() {
        let messages = vec![
            Message::user("The UserAuthService in src/services/auth.ts is important."),
            Message::user("UserAuthService handles src/services/auth.ts."),
        ];
        let result = compress(&messages);

        let ids: Vec<(&str, &str)> = result
            .entities
            .iter()
            .map(|e| (e.id.as_str(), e.value.as_str()))
            .collect();
        assert_eq!(ids, vec![("E1", "src/services/auth.ts"), ("E2", "UserAuthService")]);
        assert!(result.compression_ratio > 1.0, "ratio was {}", result.compression_ratio);

        let joined_original = messages
            .iter()
            .map(|m| m.text_content())
            .collect::<Vec<_>>()
            .join("\n");
        let joined_compressed = result
            .messages
            .iter()
            .map(|m| m.text_content())
            .collect::<Vec<_>>()
            .join("\n");
        assert_ne!(joined_original, joined_compressed);
        assert_eq!(decompress(&joined_compressed, &result.entities), joined_original);
    }

    #[test]
    fn test_singletons_and_short_values_not_materialized() {
        let messages = vec![
            Message::user("OnlyOnceClass appears here a single time."),
            Message::user("The path a/b a/b repeats but is too short to pay for itself."),
        ];
        let entities = extract_entities(&messages);
        assert!(entities.iter().all(|e| e.value != "OnlyOnceClass"));
        assert!(entities.iter().all(|e| e.value != "a/b"));
    }

    #[test]
    fn test_function_requires_call_context() {
        let messages = vec![
            Message::user("call validateToken() then validateToken() again"),
            Message::user("the word banana banana repeats without parens"),
        ];
        let entities = extract_entities(&messages);
        assert!(entities.iter().any(|e| e.value == "validateToken" && e.kind == EntityKind::Function));
        assert!(entities.iter().all(|e| e.value != "banana"));
    }

    #[test]
    fn test_url_claims_span_before_path() {
        let messages = vec![
            Message::user("see https://docs.example.com/guide/setup for setup"),
            Message::user("again https://docs.example.com/guide/setup here"),
        ];
        let entities = extract_entities(&messages);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].kind, EntityKind::Url);
        assert_eq!(entities[0].value, "https://docs.example.com/guide/setup");
    }

    #[test]
    fn test_greedy_longest_id_wins() {
        let entities: Vec<Entity> = (1..=12)
            .map(|i| entity(&format!("E{i}"), &format!("value{i}"), EntityKind::Class))
            .collect();
        assert_eq!(decompress("E12", &entities), "value12");
        assert_eq!(decompress("E1 and E12", &entities), "value1 and value12");
    }

    #[test]
    fn test_prefix_fallback_when_digits_follow() {
        // "E1" directly followed by "2024" in surrounding text.
        let entities = vec![entity("E1", "src/app", EntityKind::Path)];
        assert_eq!(decompress("E12024 release", &entities), "src/app2024 release");
    }

    #[test]
    fn test_unknown_id_left_verbatim() {
        let entities = vec![entity("E1", "src/app", EntityKind::Path)];
        assert_eq!(decompress("E99 unknown", &entities), "E99 unknown");
    }

    #[test]
    fn test_streaming_holdback_scenario() {
        let entities = vec![
            entity("E1", "UserService", EntityKind::Class),
            entity("E12", "AuthService", EntityKind::Class),
        ];
        let first = decompress_streaming("Look at E", &entities);
        assert_eq!(first.decompressed, "Look at ");
        assert_eq!(first.remaining, "E");

        let carried = format!("{}{}", first.remaining, "1 is here");
        let second = decompress_streaming(&carried, &entities);
        assert_eq!(second.decompressed, "UserService is here");
        assert_eq!(second.remaining, "");
    }

    #[test]
    fn test_streaming_holds_extensible_exact_id() {
        let entities = vec![
            entity("E1", "UserService", EntityKind::Class),
            entity("E12", "AuthService", EntityKind::Class),
        ];
        // "E1" at chunk end could still become "E12".
        let r = decompress_streaming("see E1", &entities);
        assert_eq!(r.decompressed, "see ");
        assert_eq!(r.remaining, "E1");

        let r2 = decompress_streaming(&format!("{}2 done", r.remaining), &entities);
        assert_eq!(r2.decompressed, "AuthService done");
    }

    #[test]
    fn test_streaming_splits_match_single_shot() {
        let entities = vec![
            entity("E1", "UserService", EntityKind::Class),
            entity("E2", "src/auth.ts", EntityKind::Path),
            entity("E12", "AuthService", EntityKind::Class),
        ];
        let text = "E1 talks to E12 via E2, NOTE E12 again E1.";
        let single = decompress(text, &entities);

        for split in 0..text.len() {
            if !text.is_char_boundary(split) {
                continue;
            }
            let a = decompress_streaming(&text[..split], &entities);
            let carried = format!("{}{}", a.remaining, &text[split..]);
            let b = decompress_streaming(&carried, &entities);
            let combined = format!("{}{}{}", a.decompressed, b.decompressed, b.remaining);
            assert_eq!(combined, single, "split at {split}");
        }
    }

    #[test]
    fn test_legend_deterministic_and_parseable() {
        let messages = vec![
            Message::user("UserAuthService reads src/services/auth.ts and calls refreshToken()"),
            Message::user("UserAuthService writes src/services/auth.ts after refreshToken()"),
        ];
        let result = compress(&messages);
        let legend = generate_legend(&result.entities);
        assert!(legend.starts_with("## Entity References"));
        assert_eq!(legend, generate_legend(&result.entities));

        let parsed = parse_legend(&legend);
        assert_eq!(parsed.len(), result.entities.len());
        for (p, e) in parsed.iter().zip(result.entities.iter()) {
            assert_eq!(p.id, e.id);
            assert_eq!(p.value, e.value);
            assert_eq!(p.kind, e.kind);
        }
    }

    #[test]
    fn test_empty_messages_compress_to_identity() {
        let result = compress(&[]);
        assert!(result.entities.is_empty());
        assert_eq!(result.original_size, 0);
        assert!((result.compression_ratio - 1.0).abs() < f64::EPSILON);
    }
}
