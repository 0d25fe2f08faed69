use async_trait::async_trait;
use serde_json::{json, Value};

use super::{require_str, ExecContext, ToolDef, ToolHandler};
use crate::error::ToolError;

pub struct EditFileTool;

#[async_trait]
impl ToolHandler for EditFileTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "edit_file".to_string(),
            description: "Replace old_str with new_str in a file. old_str must match exactly once — include surrounding lines to disambiguate.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_str": { "type": "string" },
                    "new_str": { "type": "string" }
                },
                "required": ["path", "old_str", "new_str"]
            }),
            read_only: false,
        }
    }

    async fn execute(&self, args: &Value, ctx: &ExecContext) -> Result<String, ToolError> {
        let path = require_str("edit_file", args, "path")?;
        let old_str = require_str("edit_file", args, "old_str")?;
        let new_str = require_str("edit_file", args, "new_str")?;
        ctx.check_scope("edit_file", path)?;

        if old_str.is_empty() {
            return Err(ToolError::new("edit_file", "old_str must not be empty"));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ToolError::new("edit_file", format!("{path}: {e}")))?;

        let occurrences = content.matches(old_str).count();
        match occurrences {
            0 => Err(ToolError::new(
                "edit_file",
                format!("old_str not found in {path} — re-read the file and try again"),
            )),
            1 => {
                let updated = content.replacen(old_str, new_str, 1);
                std::fs::write(path, &updated)
                    .map_err(|e| ToolError::new("edit_file", format!("{path}: {e}")))?;
                Ok(format!("✓ Edited {path}"))
            }
            n => Err(ToolError::new(
                "edit_file",
                format!("old_str matches {n} times in {path} — add surrounding context to make it unique"),
            )),
        }
    }
}
