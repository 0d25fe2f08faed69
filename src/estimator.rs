/// Token estimation — character-based heuristics with online calibration.
///
/// Zero model calls: input is classified as code, JSON, or prose and divided
/// by an empirically-chosen chars-per-token ratio. After each real provider
/// call the caller can feed back (actual_tokens, chars) pairs; the prose
/// divisor then converges via an exponential moving average. Calibration is
/// process-local and never persisted.
use std::sync::Mutex;

use crate::messages::Message;
use crate::tools::ToolDef;

const CODE_CHARS_PER_TOKEN: f64 = 3.0;
const JSON_CHARS_PER_TOKEN: f64 = 3.5;
const PROSE_CHARS_PER_TOKEN: f64 = 4.0;

/// Fixed per-message overhead for role tags and wire formatting.
const MESSAGE_OVERHEAD: usize = 10;

// ── Classification ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Code,
    Json,
    Prose,
}

fn classify(text: &str) -> TextKind {
    if text.contains("```") || text.contains("=>") || text.contains("import ") {
        return TextKind::Code;
    }

    let trimmed = text.trim();
    if looks_like_json(trimmed) {
        return TextKind::Json;
    }

    // Brace-language heuristic: balanced braces plus statement terminators.
    let opens = text.matches('{').count();
    let closes = text.matches('}').count();
    if opens > 0 && opens == closes && text.contains(';') {
        return TextKind::Code;
    }

    TextKind::Prose
}

/// JSON-object density test: delimited like JSON and dense in structural
/// characters relative to length.
fn looks_like_json(trimmed: &str) -> bool {
    let delimited = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if !delimited || trimmed.len() < 2 {
        return false;
    }
    let structural = trimmed
        .chars()
        .filter(|c| matches!(c, '{' | '}' | '[' | ']' | ':' | ',' | '"'))
        .count();
    structural * 8 >= trimmed.chars().count()
}

// ── Estimation ────────────────────────────────────────────────────────────────

fn estimate_with_divisor(text: &str, divisor: f64) -> usize {
    if text.is_empty() {
        return 0;
    }
    // chars().count() instead of len() — avoids overestimating multi-byte Unicode
    (text.chars().count() as f64 / divisor).ceil() as usize
}

/// Estimate tokens for arbitrary text, classifying it first.
pub fn estimate(text: &str) -> usize {
    match classify(text) {
        TextKind::Code => estimate_code(text),
        TextKind::Json => estimate_with_divisor(text, JSON_CHARS_PER_TOKEN),
        TextKind::Prose => estimate_prose(text),
    }
}

pub fn estimate_prose(text: &str) -> usize {
    estimate_with_divisor(text, prose_divisor())
}

pub fn estimate_code(text: &str) -> usize {
    estimate_with_divisor(text, CODE_CHARS_PER_TOKEN)
}

/// Tool definitions are serialized JSON schemas on the wire.
pub fn estimate_tool_defs(tools: &[ToolDef]) -> usize {
    tools
        .iter()
        .map(|t| {
            let schema = serde_json::to_string(&t.parameters).unwrap_or_default();
            estimate_with_divisor(&t.name, JSON_CHARS_PER_TOKEN)
                + estimate_with_divisor(&t.description, prose_divisor())
                + estimate_with_divisor(&schema, JSON_CHARS_PER_TOKEN)
        })
        .sum()
}

pub fn estimate_message(message: &Message) -> usize {
    estimate(&message.text_content()) + MESSAGE_OVERHEAD
}

pub fn estimate_total(messages: &[Message], system_prompt: &str, tools: &[ToolDef]) -> usize {
    messages.iter().map(estimate_message).sum::<usize>()
        + estimate(system_prompt)
        + estimate_tool_defs(tools)
}

// ── Calibration ───────────────────────────────────────────────────────────────

struct Calibration {
    prose_divisor: f64,
    samples: u64,
}

static CALIBRATION: Mutex<Calibration> = Mutex::new(Calibration {
    prose_divisor: PROSE_CHARS_PER_TOKEN,
    samples: 0,
});

fn prose_divisor() -> f64 {
    CALIBRATION.lock().map(|c| c.prose_divisor).unwrap_or(PROSE_CHARS_PER_TOKEN)
}

/// Feed back a real (actual_tokens, chars) observation from a provider call.
/// Samples with an implausible chars/token ratio are rejected outright.
pub fn update_calibration(actual_tokens: u32, chars: usize) {
    if actual_tokens == 0 {
        return;
    }
    let observed = chars as f64 / actual_tokens as f64;
    if !(1.0..=10.0).contains(&observed) {
        return;
    }
    let Ok(mut cal) = CALIBRATION.lock() else { return };
    cal.samples += 1;
    let alpha = (1.0 / cal.samples as f64).min(0.1);
    cal.prose_divisor = cal.prose_divisor * (1.0 - alpha) + observed * alpha;
}

/// Serializes tests that depend on calibration state (it is process-global).
#[cfg(test)]
pub(crate) static CAL_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Reset calibration to the built-in prose divisor.
pub fn reset_calibration() {
    if let Ok(mut cal) = CALIBRATION.lock() {
        cal.prose_divisor = PROSE_CHARS_PER_TOKEN;
        cal.samples = 0;
    }
}
