//! Safe text substitution for URL, header, and body templates.
//!
//! Implements a strict subset of the familiar `{{ … }}` syntax: variable
//! substitution, `{% if name is defined %}…{% endif %}` blocks (nesting
//! allowed), and a `tojson` filter. No file system access, no arbitrary
//! evaluation.
//!
//! Body templates are their own dialect: a JSON array of property names
//! (e.g. `["name","price"]`). Rendering emits a JSON object containing only
//! the properties present in the argument map, so the output parses as JSON
//! no matter which optional fields were supplied.

use crate::errors::{ToolgateError, ToolgateResult};
use serde_json::{Map, Value};

/// Render a template against an argument map.
///
/// `context` names the template in error messages ("url", "header:X-Foo", …).
pub fn render(template: &str, arguments: &Map<String, Value>, context: &str) -> ToolgateResult<String> {
    let nodes = parse(template, context)?;
    let mut out = String::new();
    render_nodes(&nodes, arguments, context, template, &mut out)?;
    Ok(out)
}

/// Render a URL template.
///
/// Same language as [`render`], plus query normalization: adapters emit
/// all-optional query parameters as `&name={{ name }}` conditional blocks,
/// and the first `&` is promoted to `?` here when no `?` survived rendering.
/// The `?` therefore appears only when at least one argument was supplied.
pub fn render_url(template: &str, arguments: &Map<String, Value>) -> ToolgateResult<String> {
    let rendered = render(template, arguments, "url")?;
    if rendered.contains('?') {
        return Ok(rendered);
    }
    match rendered.find('&') {
        Some(pos) => {
            let mut url = rendered;
            url.replace_range(pos..=pos, "?");
            Ok(url)
        }
        None => Ok(rendered),
    }
}

/// Render a body template (JSON array of property names) into a JSON object
/// containing exactly the defined properties.
pub fn render_body(body_template: &str, arguments: &Map<String, Value>) -> ToolgateResult<String> {
    let properties: Vec<String> = serde_json::from_str(body_template).map_err(|e| {
        ToolgateError::template(format!("invalid body template: {}", e))
            .with_detail("syntax", Value::from(e.to_string()))
            .with_detail("template", Value::from(truncate_template(body_template)))
    })?;
    render_body_properties(&properties, arguments)
}

/// Body rendering over an explicit property list.
pub fn render_body_properties(
    properties: &[String],
    arguments: &Map<String, Value>,
) -> ToolgateResult<String> {
    let mut body = Map::new();
    for prop in properties {
        if let Some(value) = arguments.get(prop) {
            if !value.is_null() {
                body.insert(prop.clone(), value.clone());
            }
        }
    }
    serde_json::to_string(&Value::Object(body))
        .map_err(|e| ToolgateError::template(format!("body serialization failed: {}", e)))
}

#[derive(Debug)]
enum Node {
    Literal(String),
    /// `{{ name }}` or `{{ name | tojson }}`
    Variable { name: String, tojson: bool },
    /// `{% if name is defined %} … {% endif %}`
    IfDefined { name: String, body: Vec<Node> },
}

fn parse(template: &str, context: &str) -> ToolgateResult<Vec<Node>> {
    let mut rest = template;
    let mut stack: Vec<(String, Vec<Node>)> = Vec::new();
    let mut current: Vec<Node> = Vec::new();

    while !rest.is_empty() {
        let var_at = rest.find("{{");
        let block_at = rest.find("{%");
        let next = match (var_at, block_at) {
            (Some(v), Some(b)) => Some(v.min(b)),
            (Some(v), None) => Some(v),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        let Some(pos) = next else {
            if !rest.is_empty() {
                current.push(Node::Literal(rest.to_string()));
            }
            break;
        };
        if pos > 0 {
            current.push(Node::Literal(rest[..pos].to_string()));
        }
        rest = &rest[pos..];

        if rest.starts_with("{{") {
            let end = rest.find("}}").ok_or_else(|| {
                syntax_error(template, context, "unterminated '{{' expression")
            })?;
            let expr = rest[2..end].trim();
            let (name, tojson) = match expr.split_once('|') {
                Some((name, filter)) => {
                    let filter = filter.trim();
                    if filter != "tojson" {
                        return Err(syntax_error(
                            template,
                            context,
                            &format!("unknown filter '{}'", filter),
                        ));
                    }
                    (name.trim(), true)
                }
                None => (expr, false),
            };
            if name.is_empty() || !is_identifier(name) {
                return Err(syntax_error(
                    template,
                    context,
                    &format!("invalid variable name '{}'", name),
                ));
            }
            current.push(Node::Variable {
                name: name.to_string(),
                tojson,
            });
            rest = &rest[end + 2..];
        } else {
            let end = rest
                .find("%}")
                .ok_or_else(|| syntax_error(template, context, "unterminated '{%' block"))?;
            let tag = rest[2..end].trim();
            if tag == "endif" {
                let (name, body) = stack.pop().ok_or_else(|| {
                    syntax_error(template, context, "'endif' without matching 'if'")
                })?;
                let node = Node::IfDefined {
                    name,
                    body: current,
                };
                current = body;
                current.push(node);
            } else if let Some(cond) = tag.strip_prefix("if ") {
                let name = cond
                    .strip_suffix(" is defined")
                    .map(str::trim)
                    .filter(|n| is_identifier(n))
                    .ok_or_else(|| {
                        syntax_error(
                            template,
                            context,
                            "only '{% if <name> is defined %}' conditions are supported",
                        )
                    })?;
                stack.push((name.to_string(), std::mem::take(&mut current)));
            } else {
                return Err(syntax_error(
                    template,
                    context,
                    &format!("unsupported block tag '{}'", tag),
                ));
            }
            rest = &rest[end + 2..];
        }
    }

    if !stack.is_empty() {
        return Err(syntax_error(template, context, "unclosed 'if' block"));
    }
    Ok(current)
}

fn render_nodes(
    nodes: &[Node],
    arguments: &Map<String, Value>,
    context: &str,
    template: &str,
    out: &mut String,
) -> ToolgateResult<()> {
    for node in nodes {
        match node {
            Node::Literal(text) => out.push_str(text),
            Node::Variable { name, tojson } => {
                let value = arguments.get(name).filter(|v| !v.is_null()).ok_or_else(|| {
                    missing_variable(template, context, name, arguments)
                })?;
                if *tojson {
                    out.push_str(
                        &serde_json::to_string(value).map_err(|e| {
                            ToolgateError::template(format!("tojson failed for '{}': {}", name, e))
                        })?,
                    );
                } else {
                    out.push_str(&scalar_to_string(value));
                }
            }
            Node::IfDefined { name, body } => {
                if arguments.get(name).is_some_and(|v| !v.is_null()) {
                    render_nodes(body, arguments, context, template, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Render a value for plain (non-tojson) substitution: strings unquoted,
/// everything else in its JSON spelling.
fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn syntax_error(template: &str, context: &str, detail: &str) -> ToolgateError {
    ToolgateError::template(format!("invalid {} template syntax: {}", context, detail))
        .with_detail("syntax", Value::from(detail))
        .with_detail("template", Value::from(truncate_template(template)))
}

fn missing_variable(
    template: &str,
    context: &str,
    name: &str,
    arguments: &Map<String, Value>,
) -> ToolgateError {
    let available: Vec<Value> = arguments.keys().cloned().map(Value::from).collect();
    ToolgateError::template(format!("missing variable '{}' in {} template", name, context))
        .with_detail("template", Value::from(truncate_template(template)))
        .with_detail("available_args", Value::from(available))
}

fn truncate_template(template: &str) -> String {
    const MAX: usize = 200;
    if template.len() <= MAX {
        template.to_string()
    } else {
        let mut end = MAX;
        while !template.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &template[..end])
    }
}
