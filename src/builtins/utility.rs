use crate::builtins::{BuiltinTool, BuiltinToolResult, UserContext, optional_str, optional_u64, required_str};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Current time in UTC, as ISO-8601 plus a unix timestamp.
pub struct CurrentDatetimeTool;

#[async_trait]
impl BuiltinTool for CurrentDatetimeTool {
    fn name(&self) -> &str {
        "get_current_datetime"
    }

    fn description(&self) -> &str {
        "Get the current date and time (UTC)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "description": "Optional strftime format string; defaults to ISO-8601"
                }
            }
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let now = Utc::now();
        let formatted = match optional_str(arguments, "format") {
            Some(format) => now.format(format).to_string(),
            None => now.to_rfc3339(),
        };
        BuiltinToolResult::ok(json!({
            "datetime": formatted,
            "timestamp": now.timestamp(),
            "timezone": "UTC",
        }))
    }
}

/// Safe arithmetic over a fixed symbol table. No free evaluation.
pub struct CalculateTool;

#[async_trait]
impl BuiltinTool for CalculateTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression (+, -, *, /, %, ^, parentheses, abs/sqrt/min/max/round/floor/ceil, pi, e)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {"type": "string", "description": "Arithmetic expression to evaluate"}
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let expression = match required_str(arguments, "expression") {
            Ok(e) => e,
            Err(e) => return BuiltinToolResult::err(e),
        };
        match eval_expression(expression) {
            Ok(value) => BuiltinToolResult::ok(json!({
                "expression": expression,
                "result": value,
            })),
            Err(e) => BuiltinToolResult::err(format!("cannot evaluate '{}': {}", expression, e)),
        }
    }
}

/// Recursive-descent evaluator for the calculator's expression grammar.
fn eval_expression(input: &str) -> Result<f64, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("unexpected trailing input".into());
    }
    if !value.is_finite() {
        return Err("result is not a finite number".into());
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut number = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(
                    number.parse().map_err(|_| format!("bad number '{}'", number))?,
                ));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident.to_lowercase()));
            }
            '+' => { chars.next(); tokens.push(Token::Plus); }
            '-' => { chars.next(); tokens.push(Token::Minus); }
            '*' => { chars.next(); tokens.push(Token::Star); }
            '/' => { chars.next(); tokens.push(Token::Slash); }
            '%' => { chars.next(); tokens.push(Token::Percent); }
            '^' => { chars.next(); tokens.push(Token::Caret); }
            '(' => { chars.next(); tokens.push(Token::LParen); }
            ')' => { chars.next(); tokens.push(Token::RParen); }
            ',' => { chars.next(); tokens.push(Token::Comma); }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token) -> Result<(), String> {
        match self.next() {
            Some(ref t) if t == token => Ok(()),
            other => Err(format!("expected {:?}, found {:?}", token, other)),
        }
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus => {
                    self.next();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.next();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.power()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star => {
                    self.next();
                    value *= self.power()?;
                }
                Token::Slash => {
                    self.next();
                    let divisor = self.power()?;
                    if divisor == 0.0 {
                        return Err("division by zero".into());
                    }
                    value /= divisor;
                }
                Token::Percent => {
                    self.next();
                    let divisor = self.power()?;
                    if divisor == 0.0 {
                        return Err("modulo by zero".into());
                    }
                    value %= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn power(&mut self) -> Result<f64, String> {
        let base = self.unary()?;
        if self.peek() == Some(&Token::Caret) {
            self.next();
            // Right-associative.
            let exponent = self.power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.next();
                Ok(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.next();
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "pi" => Ok(std::f64::consts::PI),
                "e" => Ok(std::f64::consts::E),
                _ => {
                    self.expect(&Token::LParen)?;
                    let mut args = vec![self.expr()?];
                    while self.peek() == Some(&Token::Comma) {
                        self.next();
                        args.push(self.expr()?);
                    }
                    self.expect(&Token::RParen)?;
                    apply_function(&name, &args)
                }
            },
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

fn apply_function(name: &str, args: &[f64]) -> Result<f64, String> {
    let unary = |args: &[f64]| -> Result<f64, String> {
        if args.len() == 1 {
            Ok(args[0])
        } else {
            Err(format!("{} takes exactly one argument", name))
        }
    };
    match name {
        "abs" => Ok(unary(args)?.abs()),
        "sqrt" => {
            let x = unary(args)?;
            if x < 0.0 {
                return Err("sqrt of a negative number".into());
            }
            Ok(x.sqrt())
        }
        "round" => Ok(unary(args)?.round()),
        "floor" => Ok(unary(args)?.floor()),
        "ceil" => Ok(unary(args)?.ceil()),
        "min" => {
            if args.is_empty() {
                return Err("min needs at least one argument".into());
            }
            Ok(args.iter().cloned().fold(f64::INFINITY, f64::min))
        }
        "max" => {
            if args.is_empty() {
                return Err("max needs at least one argument".into());
            }
            Ok(args.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
        }
        other => Err(format!("unknown function '{}'", other)),
    }
}

pub struct GenerateUuidTool;

#[async_trait]
impl BuiltinTool for GenerateUuidTool {
    fn name(&self) -> &str {
        "generate_uuid"
    }

    fn description(&self) -> &str {
        "Generate one or more random (v4) UUIDs."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer", "description": "How many UUIDs (1-100)", "minimum": 1, "maximum": 100}
            }
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let count = optional_u64(arguments, "count").unwrap_or(1).clamp(1, 100);
        let uuids: Vec<String> = (0..count).map(|_| Uuid::new_v4().to_string()).collect();
        if count == 1 {
            BuiltinToolResult::ok(json!({"uuid": uuids[0]}))
        } else {
            BuiltinToolResult::ok(json!({"uuids": uuids}))
        }
    }
}

pub struct EncodeDecodeTool;

#[async_trait]
impl BuiltinTool for EncodeDecodeTool {
    fn name(&self) -> &str {
        "encode_decode"
    }

    fn description(&self) -> &str {
        "Encode or decode text: base64, url, html, hex."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"},
                "encoding": {"type": "string", "enum": ["base64", "url", "html", "hex"]},
                "operation": {"type": "string", "enum": ["encode", "decode"]}
            },
            "required": ["text", "encoding", "operation"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let (text, encoding, operation) = match (
            required_str(arguments, "text"),
            required_str(arguments, "encoding"),
            required_str(arguments, "operation"),
        ) {
            (Ok(t), Ok(e), Ok(o)) => (t, e, o),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return BuiltinToolResult::err(e),
        };

        let output = match (encoding, operation) {
            ("base64", "encode") => Ok(BASE64.encode(text.as_bytes())),
            ("base64", "decode") => BASE64
                .decode(text.as_bytes())
                .map_err(|e| format!("invalid base64: {}", e))
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            ("url", "encode") => Ok(urlencoding::encode(text).into_owned()),
            ("url", "decode") => urlencoding::decode(text)
                .map(|s| s.into_owned())
                .map_err(|e| format!("invalid url encoding: {}", e)),
            ("html", "encode") => Ok(html_escape::encode_safe(text).into_owned()),
            ("html", "decode") => Ok(html_escape::decode_html_entities(text).into_owned()),
            ("hex", "encode") => Ok(hex::encode(text.as_bytes())),
            ("hex", "decode") => hex::decode(text)
                .map_err(|e| format!("invalid hex: {}", e))
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            (encoding, operation) => Err(format!(
                "unsupported combination: {} {}",
                operation, encoding
            )),
        };

        match output {
            Ok(result) => BuiltinToolResult::ok(json!({"result": result})),
            Err(e) => BuiltinToolResult::err(e),
        }
    }
}

pub struct RegexExtractTool;

#[async_trait]
impl BuiltinTool for RegexExtractTool {
    fn name(&self) -> &str {
        "regex_extract"
    }

    fn description(&self) -> &str {
        "Extract matches of a regular expression from text. Returns matches and capture groups."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string"},
                "text": {"type": "string"},
                "max_matches": {"type": "integer", "description": "Cap on returned matches (default 100)"}
            },
            "required": ["pattern", "text"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let (pattern, text) = match (required_str(arguments, "pattern"), required_str(arguments, "text")) {
            (Ok(p), Ok(t)) => (p, t),
            (Err(e), _) | (_, Err(e)) => return BuiltinToolResult::err(e),
        };
        let max_matches = optional_u64(arguments, "max_matches").unwrap_or(100) as usize;

        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return BuiltinToolResult::err(format!("invalid pattern: {}", e)),
        };

        let matches: Vec<Value> = regex
            .captures_iter(text)
            .take(max_matches)
            .map(|caps| {
                let full = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                let groups: Vec<Value> = caps
                    .iter()
                    .skip(1)
                    .map(|g| match g {
                        Some(m) => Value::String(m.as_str().to_string()),
                        None => Value::Null,
                    })
                    .collect();
                json!({"match": full, "groups": groups})
            })
            .collect();

        BuiltinToolResult::ok(json!({"count": matches.len(), "matches": matches}))
    }
}

pub struct JsonTransformTool;

#[async_trait]
impl BuiltinTool for JsonTransformTool {
    fn name(&self) -> &str {
        "json_transform"
    }

    fn description(&self) -> &str {
        "Project a value out of a JSON document using a dotted path (e.g. 'items.0.name')."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "json": {"type": "string", "description": "JSON document as a string"},
                "path": {"type": "string", "description": "Dotted path; empty returns the whole document"}
            },
            "required": ["json"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let raw = match required_str(arguments, "json") {
            Ok(raw) => raw,
            Err(e) => return BuiltinToolResult::err(e),
        };
        let document: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return BuiltinToolResult::err(format!("invalid JSON: {}", e)),
        };
        let path = optional_str(arguments, "path").unwrap_or_default();
        match crate::executor::response::extract_path(&document, path) {
            Some(value) => BuiltinToolResult::ok(json!({"value": value})),
            None => BuiltinToolResult::err(format!("path '{}' not found", path)),
        }
    }
}

pub struct TextStatsTool;

#[async_trait]
impl BuiltinTool for TextStatsTool {
    fn name(&self) -> &str {
        "text_stats"
    }

    fn description(&self) -> &str {
        "Compute statistics for a text: characters, words, lines, sentences."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"}
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let text = match required_str(arguments, "text") {
            Ok(t) => t,
            Err(e) => return BuiltinToolResult::err(e),
        };
        let words: Vec<&str> = text.split_whitespace().collect();
        let sentences = text
            .split(['.', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .count();
        let avg_word_len = if words.is_empty() {
            0.0
        } else {
            words.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / words.len() as f64
        };
        BuiltinToolResult::ok(json!({
            "characters": text.chars().count(),
            "words": words.len(),
            "lines": text.lines().count(),
            "sentences": sentences,
            "average_word_length": (avg_word_len * 100.0).round() / 100.0,
        }))
    }
}
