use crate::builtins::workspace::{Workspace, sanitize_filename};
use crate::builtins::{BuiltinTool, BuiltinToolResult, UserContext, optional_str, optional_u64, required_str};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;

/// A workbook is a directory of one CSV file per sheet; the first row of a
/// sheet is its header.
const WORKBOOK_SUFFIX: &str = ".workbook";
const DEFAULT_SHEET: &str = "Sheet1";

/// Per-cell truncation for reads, so one oversized cell cannot blow up an
/// LLM context.
const CELL_TRUNCATE_CHARS: usize = 500;

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 500;

fn sheet_path(
    workspace: &Workspace,
    user: &UserContext,
    workbook: &str,
    sheet: &str,
) -> Result<PathBuf, String> {
    let workbook = sanitize_filename(workbook).map_err(|e| e.to_string())?;
    let sheet = sanitize_filename(sheet).map_err(|e| e.to_string())?;
    let dir = workspace
        .user_dir(&user.user_id)
        .map_err(|e| e.to_string())?
        .join(format!("{}{}", workbook, WORKBOOK_SUFFIX));
    Ok(dir.join(format!("{}.csv", sheet)))
}

fn truncate_cell(cell: &str) -> String {
    if cell.chars().count() <= CELL_TRUNCATE_CHARS {
        return cell.to_string();
    }
    let truncated: String = cell.chars().take(CELL_TRUNCATE_CHARS).collect();
    format!("{}…", truncated)
}

/// Read a sheet with pagination, offset, and optional column projection.
pub struct SpreadsheetReadTool {
    workspace: Arc<Workspace>,
}

impl SpreadsheetReadTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    fn read(&self, arguments: &Map<String, Value>, user: &UserContext) -> Result<Value, String> {
        let workbook = required_str(arguments, "workbook")?;
        let sheet = optional_str(arguments, "sheet").unwrap_or(DEFAULT_SHEET);
        let offset = optional_u64(arguments, "offset").unwrap_or(0) as usize;
        let limit = optional_u64(arguments, "limit")
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE) as usize;
        let projection: Option<Vec<String>> = arguments
            .get("columns")
            .and_then(Value::as_array)
            .map(|cols| {
                cols.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            });

        let path = sheet_path(&self.workspace, user, workbook, sheet)?;
        if !path.is_file() {
            return Err(format!("sheet '{}' not found in workbook '{}'", sheet, workbook));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| format!("cannot open sheet: {}", e))?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| format!("cannot read header row: {}", e))?
            .iter()
            .map(str::to_string)
            .collect();

        // Column projection by header name.
        let selected: Vec<usize> = match &projection {
            Some(names) => headers
                .iter()
                .enumerate()
                .filter(|(_, h)| names.contains(h))
                .map(|(i, _)| i)
                .collect(),
            None => (0..headers.len()).collect(),
        };
        if selected.is_empty() {
            return Err("no matching columns".into());
        }

        let mut rows = Vec::new();
        let mut total_rows = 0usize;
        for record in reader.records() {
            let record = record.map_err(|e| format!("csv parse error: {}", e))?;
            if total_rows >= offset && rows.len() < limit {
                let row: Map<String, Value> = selected
                    .iter()
                    .map(|&i| {
                        (
                            headers[i].clone(),
                            Value::String(truncate_cell(record.get(i).unwrap_or_default())),
                        )
                    })
                    .collect();
                rows.push(Value::Object(row));
            }
            total_rows += 1;
        }

        Ok(json!({
            "workbook": workbook,
            "sheet": sheet,
            "headers": selected.iter().map(|&i| headers[i].clone()).collect::<Vec<_>>(),
            "rows": rows,
            "offset": offset,
            "total_rows": total_rows,
            "has_more": offset + rows.len() < total_rows,
        }))
    }
}

#[async_trait]
impl BuiltinTool for SpreadsheetReadTool {
    fn name(&self) -> &str {
        "spreadsheet_read"
    }

    fn description(&self) -> &str {
        "Read rows from a workbook sheet with pagination and optional column projection."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "workbook": {"type": "string"},
                "sheet": {"type": "string", "description": "Sheet name (default Sheet1)"},
                "offset": {"type": "integer", "minimum": 0},
                "limit": {"type": "integer", "minimum": 1, "maximum": 500},
                "columns": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["workbook"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, user: &UserContext) -> BuiltinToolResult {
        match self.read(arguments, user) {
            Ok(result) => BuiltinToolResult::ok(result),
            Err(e) => BuiltinToolResult::err(e),
        }
    }
}

/// Write to a workbook: `create`, `add_sheet`, `append_rows`, `update_cell`.
pub struct SpreadsheetWriteTool {
    workspace: Arc<Workspace>,
}

impl SpreadsheetWriteTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    fn write(&self, arguments: &Map<String, Value>, user: &UserContext) -> Result<Value, String> {
        let workbook = required_str(arguments, "workbook")?;
        let sheet = optional_str(arguments, "sheet").unwrap_or(DEFAULT_SHEET);
        let mode = required_str(arguments, "mode")?;
        let path = sheet_path(&self.workspace, user, workbook, sheet)?;

        match mode {
            "create" | "add_sheet" => {
                if mode == "create" {
                    if let Some(parent) = path.parent() {
                        if parent.exists() {
                            return Err(format!("workbook '{}' already exists", workbook));
                        }
                    }
                } else if path.exists() {
                    return Err(format!("sheet '{}' already exists", sheet));
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                let rows = rows_argument(arguments)?;
                if rows.is_empty() {
                    return Err("a new sheet needs at least a header row".into());
                }
                write_all_rows(&path, &rows)?;
                Ok(json!({"workbook": workbook, "sheet": sheet, "rows_written": rows.len()}))
            }
            "append_rows" => {
                if !path.is_file() {
                    return Err(format!("sheet '{}' not found in workbook '{}'", sheet, workbook));
                }
                let rows = rows_argument(arguments)?;
                let mut existing = read_all_rows(&path)?;
                let appended = rows.len();
                existing.extend(rows);
                write_all_rows(&path, &existing)?;
                Ok(json!({"workbook": workbook, "sheet": sheet, "rows_appended": appended}))
            }
            "update_cell" => {
                if !path.is_file() {
                    return Err(format!("sheet '{}' not found in workbook '{}'", sheet, workbook));
                }
                let row_index = optional_u64(arguments, "row")
                    .ok_or("update_cell requires a 'row' index (0-based, data rows)")?
                    as usize;
                let value = required_str(arguments, "value")?;

                let mut rows = read_all_rows(&path)?;
                if rows.is_empty() {
                    return Err("sheet is empty".into());
                }
                let header = rows[0].clone();
                let column_index = match arguments.get("column") {
                    Some(Value::Number(n)) => n.as_u64().ok_or("bad column index")? as usize,
                    Some(Value::String(name)) => header
                        .iter()
                        .position(|h| h == name)
                        .ok_or_else(|| format!("no column named '{}'", name))?,
                    _ => return Err("update_cell requires a 'column' (index or header name)".into()),
                };

                let data_row = rows
                    .get_mut(row_index + 1)
                    .ok_or_else(|| format!("row {} is out of range", row_index))?;
                while data_row.len() <= column_index {
                    data_row.push(String::new());
                }
                data_row[column_index] = value.to_string();
                write_all_rows(&path, &rows)?;
                Ok(json!({
                    "workbook": workbook,
                    "sheet": sheet,
                    "row": row_index,
                    "column": header.get(column_index).cloned().unwrap_or_default(),
                }))
            }
            other => Err(format!(
                "unknown mode '{}'; expected create, add_sheet, append_rows, or update_cell",
                other
            )),
        }
    }
}

fn rows_argument(arguments: &Map<String, Value>) -> Result<Vec<Vec<String>>, String> {
    let rows = arguments
        .get("rows")
        .and_then(Value::as_array)
        .ok_or("missing required argument 'rows' (array of arrays)")?;
    rows.iter()
        .map(|row| {
            row.as_array()
                .ok_or_else(|| "each row must be an array".to_string())
                .map(|cells| {
                    cells
                        .iter()
                        .map(|cell| match cell {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect()
                })
        })
        .collect()
}

fn read_all_rows(path: &PathBuf) -> Result<Vec<Vec<String>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| format!("cannot open sheet: {}", e))?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("csv parse error: {}", e))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn write_all_rows(path: &PathBuf, rows: &[Vec<String>]) -> Result<(), String> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| format!("cannot write sheet: {}", e))?;
    for row in rows {
        writer
            .write_record(row)
            .map_err(|e| format!("csv write error: {}", e))?;
    }
    writer.flush().map_err(|e| e.to_string())
}

#[async_trait]
impl BuiltinTool for SpreadsheetWriteTool {
    fn name(&self) -> &str {
        "spreadsheet_write"
    }

    fn description(&self) -> &str {
        "Write to a workbook: create, add_sheet, append_rows, or update_cell."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "workbook": {"type": "string"},
                "sheet": {"type": "string"},
                "mode": {"type": "string", "enum": ["create", "add_sheet", "append_rows", "update_cell"]},
                "rows": {"type": "array", "items": {"type": "array", "items": {"type": "string"}}},
                "row": {"type": "integer", "description": "Data row index for update_cell (0-based)"},
                "column": {"type": "string", "description": "Column header name or index for update_cell"},
                "value": {"type": "string", "description": "New cell value for update_cell"}
            },
            "required": ["workbook", "mode"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, user: &UserContext) -> BuiltinToolResult {
        match self.write(arguments, user) {
            Ok(result) => BuiltinToolResult::ok(result),
            Err(e) => BuiltinToolResult::err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuiltinSettings;

    fn tools(tmp: &std::path::Path) -> (SpreadsheetWriteTool, SpreadsheetReadTool) {
        let settings = BuiltinSettings {
            workspace_root: Some(tmp.to_path_buf()),
            ..Default::default()
        };
        let workspace = Arc::new(Workspace::new(&settings));
        (
            SpreadsheetWriteTool::new(workspace.clone()),
            SpreadsheetReadTool::new(workspace),
        )
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn create_append_read_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let (writer, reader) = tools(tmp.path());
        let user = UserContext::anonymous();

        let created = writer
            .execute(
                &args(json!({
                    "workbook": "budget",
                    "mode": "create",
                    "rows": [["item", "cost"], ["laptop", "1200"]]
                })),
                &user,
            )
            .await;
        assert!(created.success, "{:?}", created.error);

        writer
            .execute(
                &args(json!({
                    "workbook": "budget",
                    "mode": "append_rows",
                    "rows": [["monitor", "300"]]
                })),
                &user,
            )
            .await;

        let read = reader
            .execute(&args(json!({"workbook": "budget"})), &user)
            .await;
        let value = read.result.unwrap();
        assert_eq!(value["total_rows"], 2);
        assert_eq!(value["rows"][1]["item"], "monitor");
    }

    #[tokio::test]
    async fn pagination_and_projection() {
        let tmp = tempfile::tempdir().unwrap();
        let (writer, reader) = tools(tmp.path());
        let user = UserContext::anonymous();

        let mut rows = vec![vec![
            Value::String("n".into()),
            Value::String("square".into()),
        ]];
        for n in 0..10 {
            rows.push(vec![json!(n.to_string()), json!((n * n).to_string())]);
        }
        writer
            .execute(
                &args(json!({"workbook": "numbers", "mode": "create", "rows": rows})),
                &user,
            )
            .await;

        let read = reader
            .execute(
                &args(json!({
                    "workbook": "numbers",
                    "offset": 4,
                    "limit": 3,
                    "columns": ["square"]
                })),
                &user,
            )
            .await;
        let value = read.result.unwrap();
        let rows = value["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["square"], "16");
        assert!(rows[0].get("n").is_none());
        assert_eq!(value["has_more"], true);
    }

    #[tokio::test]
    async fn update_cell_by_header_name() {
        let tmp = tempfile::tempdir().unwrap();
        let (writer, reader) = tools(tmp.path());
        let user = UserContext::anonymous();

        writer
            .execute(
                &args(json!({
                    "workbook": "budget",
                    "mode": "create",
                    "rows": [["item", "cost"], ["laptop", "1200"]]
                })),
                &user,
            )
            .await;
        let updated = writer
            .execute(
                &args(json!({
                    "workbook": "budget",
                    "mode": "update_cell",
                    "row": 0,
                    "column": "cost",
                    "value": "999"
                })),
                &user,
            )
            .await;
        assert!(updated.success, "{:?}", updated.error);

        let read = reader
            .execute(&args(json!({"workbook": "budget"})), &user)
            .await;
        assert_eq!(read.result.unwrap()["rows"][0]["cost"], "999");
    }

    #[tokio::test]
    async fn add_sheet_and_duplicate_create_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (writer, _) = tools(tmp.path());
        let user = UserContext::anonymous();

        writer
            .execute(
                &args(json!({"workbook": "wb", "mode": "create", "rows": [["a"]]})),
                &user,
            )
            .await;
        let dup = writer
            .execute(
                &args(json!({"workbook": "wb", "mode": "create", "rows": [["a"]]})),
                &user,
            )
            .await;
        assert!(!dup.success);

        let sheet2 = writer
            .execute(
                &args(json!({"workbook": "wb", "sheet": "Extra", "mode": "add_sheet", "rows": [["x"]]})),
                &user,
            )
            .await;
        assert!(sheet2.success, "{:?}", sheet2.error);
    }

    #[tokio::test]
    async fn long_cells_are_truncated_on_read() {
        let tmp = tempfile::tempdir().unwrap();
        let (writer, reader) = tools(tmp.path());
        let user = UserContext::anonymous();
        let long = "y".repeat(2000);

        writer
            .execute(
                &args(json!({
                    "workbook": "big",
                    "mode": "create",
                    "rows": [["text"], [long]]
                })),
                &user,
            )
            .await;
        let read = reader.execute(&args(json!({"workbook": "big"})), &user).await;
        let cell = read.result.unwrap()["rows"][0]["text"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(cell.chars().count() <= CELL_TRUNCATE_CHARS + 1);
        assert!(cell.ends_with('…'));
    }
}
