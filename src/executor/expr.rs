//! A small, closed expression language for the `expression` parse variant.
//!
//! Grounded on `backend/services/protocol_executor.py::_parse_result`, which
//! leans on the third-party `simpleeval` sandbox with a whitelisted function
//! table `{int,float,str,abs,round,min,max,len,json.loads,json.get}`. Per the
//! design notes, the target embeds its own tokenizer -> recursive-descent
//! parser -> tree-walking evaluator instead of calling out to a host-language
//! `eval`, so the surface is exactly this closed set and nothing more.

use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, GatewayError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let num = text
                .parse::<f64>()
                .map_err(|_| GatewayError::ActionError(format!("bad number literal: {text}")))?;
            tokens.push(Token::Num(num));
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err(GatewayError::ActionError("unterminated string literal".to_string()));
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Str(text));
            i += 1;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match word.as_str() {
                "and" | "or" | "not" => tokens.push(Token::Op(word)),
                "True" | "true" => tokens.push(Token::Ident("true".to_string())),
                "False" | "false" => tokens.push(Token::Ident("false".to_string())),
                "None" | "null" => tokens.push(Token::Ident("null".to_string())),
                _ => tokens.push(Token::Ident(word)),
            }
            continue;
        }
        match c {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '[' => tokens.push(Token::LBracket),
            ']' => tokens.push(Token::RBracket),
            '.' => tokens.push(Token::Dot),
            ',' => tokens.push(Token::Comma),
            '+' | '-' | '*' | '/' | '%' => tokens.push(Token::Op(c.to_string())),
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("==".to_string()));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("!=".to_string()));
                i += 1;
            }
            '!' => tokens.push(Token::Op("not".to_string())),
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op("<=".to_string()));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(">=".to_string()));
                i += 1;
            }
            '<' => tokens.push(Token::Op("<".to_string())),
            '>' => tokens.push(Token::Op(">".to_string())),
            other => {
                return Err(GatewayError::ActionError(format!(
                    "unexpected character in expression: {other}"
                )))
            }
        }
        i += 1;
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Str(String),
    Path(Vec<String>),
    Call(String, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Unary(String, Box<Expr>),
    Binary(Box<Expr>, String, Box<Expr>),
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, tok: &Token) -> Result<(), GatewayError> {
        match self.next() {
            Some(ref t) if t == tok => Ok(()),
            other => Err(GatewayError::ActionError(format!(
                "expected {tok:?}, found {other:?}"
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, GatewayError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, GatewayError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Op(op)) if op == "or") {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), "or".to_string(), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, GatewayError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::Op(op)) if op == "and") {
            self.next();
            let right = self.parse_not()?;
            left = Expr::Binary(Box::new(left), "and".to_string(), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, GatewayError> {
        if matches!(self.peek(), Some(Token::Op(op)) if op == "not") {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expr::Unary("not".to_string(), Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, GatewayError> {
        let mut left = self.parse_additive()?;
        while let Some(Token::Op(op)) = self.peek() {
            if matches!(op.as_str(), "==" | "!=" | "<" | "<=" | ">" | ">=") {
                let op = op.clone();
                self.next();
                let right = self.parse_additive()?;
                left = Expr::Binary(Box::new(left), op, Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, GatewayError> {
        let mut left = self.parse_multiplicative()?;
        while let Some(Token::Op(op)) = self.peek() {
            if matches!(op.as_str(), "+" | "-") {
                let op = op.clone();
                self.next();
                let right = self.parse_multiplicative()?;
                left = Expr::Binary(Box::new(left), op, Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, GatewayError> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            if matches!(op.as_str(), "*" | "/" | "%") {
                let op = op.clone();
                self.next();
                let right = self.parse_unary()?;
                left = Expr::Binary(Box::new(left), op, Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, GatewayError> {
        if matches!(self.peek(), Some(Token::Op(op)) if op == "-") {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary("-".to_string(), Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, GatewayError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.next();
                    let idx = self.parse_expr()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(idx));
                }
                Some(Token::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Token::Ident(n)) => n,
                        other => {
                            return Err(GatewayError::ActionError(format!(
                                "expected identifier after '.', found {other:?}"
                            )))
                        }
                    };
                    expr = Expr::Member(Box::new(expr), name);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, GatewayError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                // Qualified names (`json.loads`, `json.get`) are function
                // names, not nested member access, when followed by a call.
                let mut path = vec![name];
                while matches!(self.peek(), Some(Token::Dot)) {
                    let save = self.pos;
                    self.next();
                    match self.next() {
                        Some(Token::Ident(n)) => path.push(n),
                        _ => {
                            self.pos = save;
                            break;
                        }
                    }
                }
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.next();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        args.push(self.parse_expr()?);
                        while matches!(self.peek(), Some(Token::Comma)) {
                            self.next();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call(path.join("."), args))
                } else {
                    Ok(Expr::Path(path))
                }
            }
            other => Err(GatewayError::ActionError(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }
}

fn num(v: &Value) -> Result<f64, GatewayError> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| GatewayError::ActionError(format!("expected a number, got {v}")))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn json_number(f: f64) -> Value {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < (1u64 << 53) as f64 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn lookup_path(root: &Value, path: &[String]) -> Value {
    match path.first().map(|s| s.as_str()) {
        Some("true") => return Value::Bool(true),
        Some("false") => return Value::Bool(false),
        Some("null") => return Value::Null,
        _ => {}
    }
    let mut current = root;
    for (idx, segment) in path.iter().enumerate() {
        match current.get(segment) {
            Some(v) => current = v,
            None => {
                if idx == 0 {
                    return Value::Null;
                }
                return Value::Null;
            }
        }
    }
    current.clone()
}

fn eval(expr: &Expr, ctx: &Value) -> Result<Value, GatewayError> {
    match expr {
        Expr::Num(n) => Ok(json_number(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Path(path) => Ok(lookup_path(ctx, path)),
        Expr::Member(base, name) => {
            let base_val = eval(base, ctx)?;
            Ok(base_val.get(name).cloned().unwrap_or(Value::Null))
        }
        Expr::Index(base, idx) => {
            let base_val = eval(base, ctx)?;
            let idx_val = eval(idx, ctx)?;
            let i = num(&idx_val)? as i64;
            match base_val {
                Value::Array(arr) => {
                    let len = arr.len() as i64;
                    let actual = if i < 0 { len + i } else { i };
                    Ok(arr
                        .get(actual.max(0) as usize)
                        .cloned()
                        .unwrap_or(Value::Null))
                }
                Value::String(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let len = chars.len() as i64;
                    let actual = if i < 0 { len + i } else { i };
                    Ok(chars
                        .get(actual.max(0) as usize)
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null))
                }
                _ => Ok(Value::Null),
            }
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, ctx)?;
            match op.as_str() {
                "-" => Ok(json_number(-num(&v)?)),
                "not" => Ok(Value::Bool(!truthy(&v))),
                other => Err(GatewayError::Unsupported(format!("unary op {other}"))),
            }
        }
        Expr::Binary(left, op, right) => eval_binary(left, op, right, ctx),
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call_builtin(name, &values)
        }
    }
}

fn eval_binary(left: &Expr, op: &str, right: &Expr, ctx: &Value) -> Result<Value, GatewayError> {
    if op == "and" {
        let l = eval(left, ctx)?;
        if !truthy(&l) {
            return Ok(l);
        }
        return eval(right, ctx);
    }
    if op == "or" {
        let l = eval(left, ctx)?;
        if truthy(&l) {
            return Ok(l);
        }
        return eval(right, ctx);
    }

    let l = eval(left, ctx)?;
    let r = eval(right, ctx)?;

    match op {
        "==" => return Ok(Value::Bool(values_equal(&l, &r))),
        "!=" => return Ok(Value::Bool(!values_equal(&l, &r))),
        _ => {}
    }

    if let (Value::String(ls), Value::String(rs)) = (&l, &r) {
        return match op {
            "+" => Ok(Value::String(format!("{ls}{rs}"))),
            "<" => Ok(Value::Bool(ls < rs)),
            "<=" => Ok(Value::Bool(ls <= rs)),
            ">" => Ok(Value::Bool(ls > rs)),
            ">=" => Ok(Value::Bool(ls >= rs)),
            other => Err(GatewayError::Unsupported(format!(
                "operator {other} not supported between strings"
            ))),
        };
    }

    let lf = num(&l)?;
    let rf = num(&r)?;
    match op {
        "+" => Ok(json_number(lf + rf)),
        "-" => Ok(json_number(lf - rf)),
        "*" => Ok(json_number(lf * rf)),
        "/" => Ok(json_number(lf / rf)),
        "%" => Ok(json_number(lf % rf)),
        "<" => Ok(Value::Bool(lf < rf)),
        "<=" => Ok(Value::Bool(lf <= rf)),
        ">" => Ok(Value::Bool(lf > rf)),
        ">=" => Ok(Value::Bool(lf >= rf)),
        other => Err(GatewayError::Unsupported(format!("unsupported operator {other}"))),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Ok(af), Ok(bf)) = (num(a), num(b)) {
        return af == bf;
    }
    a == b
}

/// The closed function table: `{int,float,str,abs,round,min,max,len,json.loads,json.get}`.
fn call_builtin(name: &str, args: &[Value]) -> Result<Value, GatewayError> {
    match name {
        "int" => Ok(Value::from(num(arg(args, 0)?)? as i64)),
        "float" => Ok(json_number(num(arg(args, 0)?)?)),
        "str" => Ok(Value::String(stringify(arg(args, 0)?))),
        "abs" => Ok(json_number(num(arg(args, 0)?)?.abs())),
        "round" => Ok(json_number(num(arg(args, 0)?)?.round())),
        "len" => Ok(Value::from(match arg(args, 0)? {
            Value::Array(a) => a.len(),
            Value::String(s) => s.chars().count(),
            Value::Object(o) => o.len(),
            _ => 0,
        } as i64)),
        "min" => reduce_numeric(args, f64::min),
        "max" => reduce_numeric(args, f64::max),
        "json.loads" => {
            let text = match arg(args, 0)? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            serde_json::from_str(&text)
                .map_err(|e| GatewayError::ActionError(format!("json.loads: {e}")))
        }
        "json.get" => {
            let obj = arg(args, 0)?;
            let key = match arg(args, 1)? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(obj.get(&key).cloned().unwrap_or(Value::Null))
        }
        other => Err(GatewayError::Unsupported(format!(
            "expression function not whitelisted: {other}"
        ))),
    }
}

fn arg(args: &[Value], idx: usize) -> Result<&Value, GatewayError> {
    args.get(idx)
        .ok_or_else(|| GatewayError::ActionError(format!("missing argument {idx}")))
}

fn reduce_numeric(args: &[Value], f: fn(f64, f64) -> f64) -> Result<Value, GatewayError> {
    if args.is_empty() {
        return Err(GatewayError::ActionError("min/max require at least one argument".to_string()));
    }
    let mut acc = num(&args[0])?;
    for a in &args[1..] {
        acc = f(acc, num(a)?);
    }
    Ok(json_number(acc))
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Evaluate `source` against `ctx` (the step-execution context: `registers`,
/// `coils`, `payload`, `steps`, and the resolved template variables).
pub fn evaluate(source: &str, ctx: &Value) -> Result<Value, GatewayError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(GatewayError::ActionError(format!(
            "trailing tokens in expression: {source}"
        )));
    }
    eval(&expr, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn combines_two_registers_into_a_weight() {
        let ctx = json!({"registers": [0, 12340]});
        let result = evaluate("registers[0]*65536+registers[1]", &ctx).unwrap();
        assert_eq!(result, json!(12340));
    }

    #[test]
    fn supports_whitelisted_calls() {
        let ctx = json!({"payload": "3.5"});
        assert_eq!(evaluate("float(payload)", &ctx).unwrap(), json!(3.5));
        assert_eq!(evaluate("len(payload)", &ctx).unwrap(), json!(3));
    }

    #[test]
    fn rejects_non_whitelisted_functions() {
        let ctx = json!({});
        assert!(evaluate("eval(payload)", &ctx).is_err());
    }

    #[test]
    fn supports_step_result_paths() {
        let ctx = json!({"steps": {"read_weight": {"result": 42}}});
        assert_eq!(evaluate("steps.read_weight.result", &ctx).unwrap(), json!(42));
    }
}
