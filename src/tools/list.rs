use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ExecContext, ToolDef, ToolHandler};
use crate::error::ToolError;

const MAX_ENTRIES: usize = 200;

pub struct ListFilesTool;

#[async_trait]
impl ToolHandler for ListFilesTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "list_files".to_string(),
            description: "List directory entries. Directories are suffixed with '/'.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Default: current directory" }
                }
            }),
            read_only: true,
        }
    }

    async fn execute(&self, args: &Value, ctx: &ExecContext) -> Result<String, ToolError> {
        let path = args["path"].as_str().unwrap_or(".");
        ctx.check_scope("list_files", path)?;

        let entries = std::fs::read_dir(path)
            .map_err(|e| ToolError::new("list_files", format!("{path}: {e}")))?;

        let mut names: Vec<String> = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            names.push(if is_dir { format!("{name}/") } else { name });
        }
        names.sort();

        let total = names.len();
        let shown: Vec<String> = names.into_iter().take(MAX_ENTRIES).collect();
        let mut out = format!("{path}\n{}", shown.join("\n"));
        if total > MAX_ENTRIES {
            out.push_str(&format!("\n[truncated — {total} entries total]"));
        } else {
            out.push_str(&format!("\n[{total} entries]"));
        }
        Ok(out)
    }
}
