use async_trait::async_trait;
use serde_json::{json, Value};

use super::{require_str, ExecContext, ToolDef, ToolHandler};
use crate::error::ToolError;

pub struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "write_file".to_string(),
            description: "Create a new file with the given content. Parent directories are created. Use edit_file to modify existing files.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
            read_only: false,
        }
    }

    async fn execute(&self, args: &Value, ctx: &ExecContext) -> Result<String, ToolError> {
        let path = require_str("write_file", args, "path")?;
        let content = require_str("write_file", args, "content")?;
        ctx.check_scope("write_file", path)?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ToolError::new("write_file", format!("{path}: {e}")))?;
            }
        }
        std::fs::write(path, content)
            .map_err(|e| ToolError::new("write_file", format!("{path}: {e}")))?;

        Ok(format!("✓ Wrote {path} ({} lines)", content.lines().count()))
    }
}
