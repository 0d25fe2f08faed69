use async_trait::async_trait;
use serde_json::{json, Value};

use super::{require_str, ExecContext, ToolDef, ToolHandler};
use crate::error::ToolError;

/// Max lines returned inline. Rest is truncated with a marker.
const MAX_LINES: usize = 2000;

pub struct ReadFileTool;

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "read_file".to_string(),
            description: "Read a file. Optionally pass line_range=[start, end] (1-based, inclusive) to fetch a slice.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "line_range": {
                        "type": "array",
                        "items": { "type": "integer" },
                        "description": "Optional [start, end], 1-based inclusive"
                    }
                },
                "required": ["path"]
            }),
            read_only: true,
        }
    }

    async fn execute(&self, args: &Value, ctx: &ExecContext) -> Result<String, ToolError> {
        let path = require_str("read_file", args, "path")?;
        ctx.check_scope("read_file", path)?;

        let content = std::fs::read_to_string(path)
            .map_err(|e| ToolError::new("read_file", format!("{path}: {e}")))?;

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        let (start, end) = match args["line_range"].as_array() {
            Some(range) => {
                let s = range.first().and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;
                let e = range.get(1).and_then(|v| v.as_u64()).unwrap_or(total as u64) as usize;
                (s, e.min(total))
            }
            None => (1, total),
        };

        if start > total {
            return Ok(format!("[{path} — {total} lines total, range starts past end]"));
        }

        let selected = &lines[start - 1..end];
        let shown = selected.len().min(MAX_LINES);
        let mut out = format!("[{path} — {total} lines total, showing {start}-{}]\n", start + shown - 1);
        for (i, line) in selected.iter().take(MAX_LINES).enumerate() {
            out.push_str(&format!("{:>5} | {}\n", start + i, line));
        }
        if selected.len() > MAX_LINES {
            out.push_str(&format!("[+{} lines truncated — request a narrower range]", selected.len() - MAX_LINES));
        }
        Ok(out)
    }
}
