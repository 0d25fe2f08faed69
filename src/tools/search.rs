use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;

use super::{require_str, ExecContext, ToolDef, ToolHandler};
use crate::error::ToolError;

const MAX_MATCHES: usize = 100;
const MAX_FILES: usize = 2000;

/// Directories never worth searching.
const IGNORED: &[&str] = &[
    "node_modules", ".git", "target", ".next", "dist", "build",
    "__pycache__", ".venv", "venv", "vendor", ".bundle",
];

pub struct SearchTool;

#[async_trait]
impl ToolHandler for SearchTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "search".to_string(),
            description: "Search file contents with a regex. Returns file:line:content matches.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string", "description": "Default: current directory" }
                },
                "required": ["pattern"]
            }),
            read_only: true,
        }
    }

    async fn execute(&self, args: &Value, ctx: &ExecContext) -> Result<String, ToolError> {
        let pattern = require_str("search", args, "pattern")?;
        let root = args["path"].as_str().unwrap_or(".");
        ctx.check_scope("search", root)?;

        let re = Regex::new(pattern)
            .map_err(|e| ToolError::new("search", format!("bad pattern: {e}")))?;

        let mut files = Vec::new();
        collect_files(Path::new(root), &mut files, MAX_FILES);

        let mut matches: Vec<String> = Vec::new();
        'outer: for file in &files {
            let Ok(content) = std::fs::read_to_string(file) else { continue };
            for (line_no, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(format!("{}:{}:{}", file.display(), line_no + 1, line.trim_end()));
                    if matches.len() >= MAX_MATCHES {
                        break 'outer;
                    }
                }
            }
        }

        if matches.is_empty() {
            return Ok(format!("No matches for '{pattern}'"));
        }
        let n = matches.len();
        let mut out = matches.join("\n");
        if n >= MAX_MATCHES {
            out.push_str("\n[match limit reached — narrow the pattern]");
        } else {
            out.push_str(&format!("\n[{n} matches]"));
        }
        Ok(out)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>, max: usize) {
    if out.len() >= max {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if out.len() >= max {
            break;
        }
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if IGNORED.contains(&name_str.as_ref()) {
                continue;
            }
            collect_files(&path, out, max);
        } else {
            out.push(path);
        }
    }
}
