//! Fuel- and depth-limited evaluator for the expression AST.
//!
//! Values follow JavaScript semantics closely enough that user-authored
//! stop conditions behave the way their authors expect: `undefined` is
//! distinct from `null`, truthiness follows ECMAScript ToBoolean, `+`
//! concatenates when either side is a string, and missing properties
//! evaluate to `undefined` rather than failing.

use std::collections::HashMap;

use serde_json::{Map, Number, Value};

use super::parser::{ArrowFn, BinaryOp, Expr, LogicalOp, UnaryOp};
use crate::error::{Error, Result};

/// Evaluation limits. Fuel is consumed per AST node visit and per
/// produced collection element, which bounds both time and allocation.
#[derive(Debug, Clone, Copy)]
pub struct EvalLimits {
    pub max_fuel: u64,
    pub max_depth: usize,
    /// Cap on any single produced string, in bytes.
    pub max_string_bytes: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_fuel: 1_000_000,
            max_depth: 64,
            max_string_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Runtime value. A superset of JSON with `undefined`.
#[derive(Debug, Clone, PartialEq)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<JsValue>),
    Object(Vec<(String, JsValue)>),
}

impl JsValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => {
                Self::Object(map.iter().map(|(k, v)| (k.clone(), Self::from_json(v))).collect())
            }
        }
    }

    /// Convert back to JSON. `undefined` and non-finite numbers become
    /// `null`, matching `JSON.stringify`.
    pub fn into_json(self) -> Value {
        match self {
            Self::Undefined | Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(b),
            Self::Number(n) => Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            Self::String(s) => Value::String(s),
            Self::Array(items) => Value::Array(items.into_iter().map(Self::into_json).collect()),
            Self::Object(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    map.insert(k, v.into_json());
                }
                Value::Object(map)
            }
        }
    }

    /// ECMAScript ToBoolean.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::Array(_) | Self::Object(_) => true,
        }
    }

    fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// `typeof` result.
    fn type_of(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "object",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) | Self::Object(_) => "object",
        }
    }

    /// ECMAScript ToNumber (subset).
    fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(true) => 1.0,
            Self::Bool(false) => 0.0,
            Self::Number(n) => *n,
            Self::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Self::Array(_) | Self::Object(_) => f64::NAN,
        }
    }

    /// Template stringification: what a `${value}` interpolation yields.
    pub fn to_template_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
            Self::Array(_) | Self::Object(_) => {
                serde_json::to_string(&self.clone().into_json()).unwrap_or_default()
            }
        }
    }

    fn get_property(&self, name: &str) -> JsValue {
        match self {
            Self::Object(entries) => entries
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Self::Undefined),
            Self::Array(items) => match name {
                "length" => Self::Number(items.len() as f64),
                _ => name
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Self::Undefined),
            },
            Self::String(s) => match name {
                "length" => Self::Number(s.chars().count() as f64),
                _ => Self::Undefined,
            },
            _ => Self::Undefined,
        }
    }
}

/// Integer-looking floats print without a decimal point, as in JS.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

pub struct Evaluator {
    limits: EvalLimits,
    fuel: u64,
}

impl Evaluator {
    pub fn new(limits: EvalLimits) -> Self {
        Self {
            limits,
            fuel: limits.max_fuel,
        }
    }

    /// Evaluate an arrow function with positionally bound arguments.
    /// Extra parameters bind to `undefined`; extra arguments are ignored.
    pub fn call(&mut self, function: &ArrowFn, args: Vec<JsValue>) -> Result<JsValue> {
        let mut env: HashMap<String, JsValue> = HashMap::new();
        for (i, param) in function.params.iter().enumerate() {
            env.insert(
                param.clone(),
                args.get(i).cloned().unwrap_or(JsValue::Undefined),
            );
        }
        self.eval(&function.body, &env, 0)
    }

    fn burn(&mut self, amount: u64) -> Result<()> {
        if self.fuel < amount {
            return Err(Error::Sandbox(
                "expression exceeded its execution budget".into(),
            ));
        }
        self.fuel -= amount;
        Ok(())
    }

    fn eval(&mut self, expr: &Expr, env: &HashMap<String, JsValue>, depth: usize) -> Result<JsValue> {
        if depth > self.limits.max_depth {
            return Err(Error::Sandbox("expression nesting too deep".into()));
        }
        self.burn(1)?;

        match expr {
            Expr::Null => Ok(JsValue::Null),
            Expr::Undefined => Ok(JsValue::Undefined),
            Expr::Bool(b) => Ok(JsValue::Bool(*b)),
            Expr::Number(n) => Ok(JsValue::Number(*n)),
            Expr::Str(s) => Ok(JsValue::String(s.clone())),
            Expr::Ident(name) => self.eval_ident(name, env),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    self.burn(1)?;
                    values.push(self.eval(item, env, depth + 1)?);
                }
                Ok(JsValue::Array(values))
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let object = self.eval(object, env, depth + 1)?;
                if object.is_nullish() {
                    if *optional {
                        return Ok(JsValue::Undefined);
                    }
                    return Err(Error::Sandbox(format!(
                        "cannot read property '{property}' of {}",
                        object.to_template_string()
                    )));
                }
                Ok(object.get_property(property))
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let object = self.eval(object, env, depth + 1)?;
                if object.is_nullish() {
                    if *optional {
                        return Ok(JsValue::Undefined);
                    }
                    return Err(Error::Sandbox("cannot index a nullish value".into()));
                }
                let index = self.eval(index, env, depth + 1)?;
                let key = index.to_template_string();
                Ok(object.get_property(&key))
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => self.eval_call(callee, args, *optional, env, depth),
            Expr::Unary(op, operand) => {
                let value = self.eval(operand, env, depth + 1)?;
                Ok(match op {
                    UnaryOp::Not => JsValue::Bool(!value.is_truthy()),
                    UnaryOp::Neg => JsValue::Number(-value.to_number()),
                    UnaryOp::Plus => JsValue::Number(value.to_number()),
                    UnaryOp::TypeOf => JsValue::String(value.type_of().to_string()),
                })
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, env, depth + 1)?;
                let right = self.eval(right, env, depth + 1)?;
                self.eval_binary(*op, left, right)
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left, env, depth + 1)?;
                match op {
                    LogicalOp::And => {
                        if left.is_truthy() {
                            self.eval(right, env, depth + 1)
                        } else {
                            Ok(left)
                        }
                    }
                    LogicalOp::Or => {
                        if left.is_truthy() {
                            Ok(left)
                        } else {
                            self.eval(right, env, depth + 1)
                        }
                    }
                    LogicalOp::Nullish => {
                        if left.is_nullish() {
                            self.eval(right, env, depth + 1)
                        } else {
                            Ok(left)
                        }
                    }
                }
            }
            Expr::Ternary {
                condition,
                consequent,
                alternate,
            } => {
                let condition = self.eval(condition, env, depth + 1)?;
                if condition.is_truthy() {
                    self.eval(consequent, env, depth + 1)
                } else {
                    self.eval(alternate, env, depth + 1)
                }
            }
        }
    }

    fn eval_ident(&mut self, name: &str, env: &HashMap<String, JsValue>) -> Result<JsValue> {
        if let Some(value) = env.get(name) {
            return Ok(value.clone());
        }
        match name {
            "NaN" => Ok(JsValue::Number(f64::NAN)),
            "Infinity" => Ok(JsValue::Number(f64::INFINITY)),
            // Builtin namespaces are resolved at the call site; a bare
            // reference evaluates to undefined like any unknown name.
            _ => Err(Error::Sandbox(format!("'{name}' is not defined"))),
        }
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        optional: bool,
        env: &HashMap<String, JsValue>,
        depth: usize,
    ) -> Result<JsValue> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, env, depth + 1)?);
        }

        match callee {
            // Namespace builtins: Math.min(…), JSON.stringify(…), …
            Expr::Member {
                object, property, ..
            } => {
                if let Expr::Ident(namespace) = object.as_ref() {
                    if !env.contains_key(namespace) {
                        return self.call_namespace(namespace, property, values);
                    }
                }
                // Value methods: receiver.includes(…), receiver.trim(), …
                let receiver = self.eval(object, env, depth + 1)?;
                if receiver.is_nullish() && optional {
                    return Ok(JsValue::Undefined);
                }
                self.call_method(&receiver, property, values)
            }
            Expr::Ident(name) => self.call_global(name, values),
            _ => Err(Error::Sandbox("expression is not callable".into())),
        }
    }

    fn call_global(&mut self, name: &str, args: Vec<JsValue>) -> Result<JsValue> {
        let first = args.into_iter().next().unwrap_or(JsValue::Undefined);
        match name {
            "Number" => Ok(JsValue::Number(first.to_number())),
            "String" => Ok(JsValue::String(first.to_template_string())),
            "Boolean" => Ok(JsValue::Bool(first.is_truthy())),
            "parseInt" => {
                let text = first.to_template_string();
                let trimmed = text.trim();
                let digits: String = trimmed
                    .chars()
                    .enumerate()
                    .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
                    .map(|(_, c)| c)
                    .collect();
                Ok(digits
                    .parse::<f64>()
                    .map(|n| JsValue::Number(n.trunc()))
                    .unwrap_or(JsValue::Number(f64::NAN)))
            }
            "parseFloat" => {
                let text = first.to_template_string();
                Ok(text
                    .trim()
                    .parse::<f64>()
                    .map(JsValue::Number)
                    .unwrap_or(JsValue::Number(f64::NAN)))
            }
            "isNaN" => Ok(JsValue::Bool(first.to_number().is_nan())),
            other => Err(Error::Sandbox(format!("'{other}' is not a function"))),
        }
    }

    fn call_namespace(
        &mut self,
        namespace: &str,
        function: &str,
        args: Vec<JsValue>,
    ) -> Result<JsValue> {
        fn numbers(args: &[JsValue]) -> Vec<f64> {
            args.iter().map(JsValue::to_number).collect()
        }
        fn first_number(args: &[JsValue]) -> f64 {
            args.first().map(JsValue::to_number).unwrap_or(f64::NAN)
        }
        match (namespace, function) {
            ("Math", "min") => Ok(JsValue::Number(
                numbers(&args).into_iter().fold(f64::INFINITY, f64::min),
            )),
            ("Math", "max") => Ok(JsValue::Number(
                numbers(&args).into_iter().fold(f64::NEG_INFINITY, f64::max),
            )),
            ("Math", "floor") => Ok(JsValue::Number(first_number(&args).floor())),
            ("Math", "ceil") => Ok(JsValue::Number(first_number(&args).ceil())),
            ("Math", "round") => Ok(JsValue::Number(first_number(&args).round())),
            ("Math", "abs") => Ok(JsValue::Number(first_number(&args).abs())),
            ("Array", "isArray") => Ok(JsValue::Bool(matches!(
                args.first(),
                Some(JsValue::Array(_))
            ))),
            ("Object", "keys") => match args.into_iter().next() {
                Some(JsValue::Object(entries)) => Ok(JsValue::Array(
                    entries.into_iter().map(|(k, _)| JsValue::String(k)).collect(),
                )),
                Some(JsValue::Array(items)) => Ok(JsValue::Array(
                    (0..items.len())
                        .map(|i| JsValue::String(i.to_string()))
                        .collect(),
                )),
                _ => Ok(JsValue::Array(Vec::new())),
            },
            ("Object", "values") => match args.into_iter().next() {
                Some(JsValue::Object(entries)) => {
                    Ok(JsValue::Array(entries.into_iter().map(|(_, v)| v).collect()))
                }
                Some(JsValue::Array(items)) => Ok(JsValue::Array(items)),
                _ => Ok(JsValue::Array(Vec::new())),
            },
            ("JSON", "stringify") => {
                let value = args.into_iter().next().unwrap_or(JsValue::Undefined);
                if matches!(value, JsValue::Undefined) {
                    return Ok(JsValue::Undefined);
                }
                let text = serde_json::to_string(&value.into_json())
                    .map_err(|e| Error::Sandbox(format!("JSON.stringify failed: {e}")))?;
                if text.len() > self.limits.max_string_bytes {
                    return Err(Error::Sandbox("produced string exceeds size limit".into()));
                }
                Ok(JsValue::String(text))
            }
            ("JSON", "parse") => {
                let text = args
                    .into_iter()
                    .next()
                    .unwrap_or(JsValue::Undefined)
                    .to_template_string();
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| Error::Sandbox(format!("JSON.parse failed: {e}")))?;
                Ok(JsValue::from_json(&value))
            }
            (ns, f) => Err(Error::Sandbox(format!("'{ns}.{f}' is not a function"))),
        }
    }

    fn call_method(
        &mut self,
        receiver: &JsValue,
        method: &str,
        args: Vec<JsValue>,
    ) -> Result<JsValue> {
        let first = args.first().cloned().unwrap_or(JsValue::Undefined);
        match (receiver, method) {
            (JsValue::String(s), "includes") => {
                Ok(JsValue::Bool(s.contains(&first.to_template_string())))
            }
            (JsValue::String(s), "startsWith") => {
                Ok(JsValue::Bool(s.starts_with(&first.to_template_string())))
            }
            (JsValue::String(s), "endsWith") => {
                Ok(JsValue::Bool(s.ends_with(&first.to_template_string())))
            }
            (JsValue::String(s), "toLowerCase") => Ok(JsValue::String(s.to_lowercase())),
            (JsValue::String(s), "toUpperCase") => Ok(JsValue::String(s.to_uppercase())),
            (JsValue::String(s), "trim") => Ok(JsValue::String(s.trim().to_string())),
            (JsValue::String(s), "indexOf") => {
                let needle = first.to_template_string();
                Ok(JsValue::Number(match s.find(&needle) {
                    Some(byte_index) => s[..byte_index].chars().count() as f64,
                    None => -1.0,
                }))
            }
            (JsValue::String(s), "split") => {
                let separator = first.to_template_string();
                let parts: Vec<JsValue> = if separator.is_empty() {
                    s.chars().map(|c| JsValue::String(c.to_string())).collect()
                } else {
                    s.split(&separator)
                        .map(|part| JsValue::String(part.to_string()))
                        .collect()
                };
                self.burn(parts.len() as u64)?;
                Ok(JsValue::Array(parts))
            }
            (JsValue::Array(items), "includes") => {
                Ok(JsValue::Bool(items.iter().any(|item| item == &first)))
            }
            (JsValue::Array(items), "indexOf") => Ok(JsValue::Number(
                items
                    .iter()
                    .position(|item| item == &first)
                    .map(|i| i as f64)
                    .unwrap_or(-1.0),
            )),
            (JsValue::Array(items), "join") => {
                let separator = match args.first() {
                    Some(JsValue::Undefined) | None => ",".to_string(),
                    Some(value) => value.to_template_string(),
                };
                let joined = items
                    .iter()
                    .map(JsValue::to_template_string)
                    .collect::<Vec<_>>()
                    .join(&separator);
                if joined.len() > self.limits.max_string_bytes {
                    return Err(Error::Sandbox("produced string exceeds size limit".into()));
                }
                Ok(JsValue::String(joined))
            }
            (JsValue::Array(items), "slice") => {
                let len = items.len() as i64;
                let clamp = |v: f64| -> usize {
                    let v = v as i64;
                    let v = if v < 0 { len + v } else { v };
                    v.clamp(0, len) as usize
                };
                let start = clamp(first.to_number());
                let end = match args.get(1) {
                    Some(v) if !matches!(v, JsValue::Undefined) => clamp(v.to_number()),
                    _ => len as usize,
                };
                Ok(JsValue::Array(
                    items
                        .get(start..end.max(start))
                        .map(|s| s.to_vec())
                        .unwrap_or_default(),
                ))
            }
            _ => Err(Error::Sandbox(format!(
                "method '{method}' is not supported on {}",
                receiver.type_of()
            ))),
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, left: JsValue, right: JsValue) -> Result<JsValue> {
        use BinaryOp::*;
        Ok(match op {
            Add => match (&left, &right) {
                (JsValue::String(_), _) | (_, JsValue::String(_)) => {
                    let text =
                        format!("{}{}", left.to_template_string(), right.to_template_string());
                    if text.len() > self.limits.max_string_bytes {
                        return Err(Error::Sandbox("produced string exceeds size limit".into()));
                    }
                    JsValue::String(text)
                }
                _ => JsValue::Number(left.to_number() + right.to_number()),
            },
            Sub => JsValue::Number(left.to_number() - right.to_number()),
            Mul => JsValue::Number(left.to_number() * right.to_number()),
            Div => JsValue::Number(left.to_number() / right.to_number()),
            Rem => JsValue::Number(left.to_number() % right.to_number()),
            Lt | Le | Gt | Ge => {
                let result = match (&left, &right) {
                    (JsValue::String(a), JsValue::String(b)) => match op {
                        Lt => a < b,
                        Le => a <= b,
                        Gt => a > b,
                        Ge => a >= b,
                        _ => unreachable!(),
                    },
                    _ => {
                        let (a, b) = (left.to_number(), right.to_number());
                        match op {
                            Lt => a < b,
                            Le => a <= b,
                            Gt => a > b,
                            Ge => a >= b,
                            _ => unreachable!(),
                        }
                    }
                };
                JsValue::Bool(result)
            }
            EqStrict => JsValue::Bool(strict_eq(&left, &right)),
            NeStrict => JsValue::Bool(!strict_eq(&left, &right)),
            EqLoose => JsValue::Bool(loose_eq(&left, &right)),
            NeLoose => JsValue::Bool(!loose_eq(&left, &right)),
        })
    }
}

fn strict_eq(left: &JsValue, right: &JsValue) -> bool {
    match (left, right) {
        (JsValue::Number(a), JsValue::Number(b)) => a == b,
        _ => left == right,
    }
}

/// Loose equality for the JSON-ish subset: `null == undefined`, numeric
/// strings compare numerically against numbers, booleans coerce to
/// numbers. Object identity comparisons degrade to structural equality,
/// which is the useful interpretation when values are plain data.
fn loose_eq(left: &JsValue, right: &JsValue) -> bool {
    match (left, right) {
        (JsValue::Undefined | JsValue::Null, JsValue::Undefined | JsValue::Null) => true,
        (JsValue::Undefined | JsValue::Null, _) | (_, JsValue::Undefined | JsValue::Null) => false,
        (JsValue::Number(a), JsValue::String(_)) => *a == right.to_number(),
        (JsValue::String(_), JsValue::Number(b)) => left.to_number() == *b,
        (JsValue::Bool(_), _) => loose_eq(&JsValue::Number(left.to_number()), right),
        (_, JsValue::Bool(_)) => loose_eq(left, &JsValue::Number(right.to_number())),
        _ => strict_eq(left, right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::parse_arrow_fn;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run(source: &str, args: &[Value]) -> Result<JsValue> {
        let f = parse_arrow_fn(source)?;
        let args = args.iter().map(JsValue::from_json).collect();
        Evaluator::new(EvalLimits::default()).call(&f, args)
    }

    fn run_ok(source: &str, args: &[Value]) -> JsValue {
        run(source, args).unwrap()
    }

    #[test]
    fn test_member_lookup() {
        let value = run_ok("(r) => r.meta.next", &[json!({"meta": {"next": "T1"}})]);
        assert_eq!(value, JsValue::String("T1".into()));
    }

    #[test]
    fn test_missing_property_is_undefined() {
        let value = run_ok("(r) => r.missing", &[json!({})]);
        assert_eq!(value, JsValue::Undefined);
    }

    #[test]
    fn test_nullish_member_access_fails_without_optional() {
        assert!(run("(r) => r.a.b", &[json!({})]).is_err());
        assert_eq!(run_ok("(r) => r.a?.b", &[json!({})]), JsValue::Undefined);
    }

    #[test]
    fn test_array_length_and_index() {
        let data = json!({"items": [1, 2, 3]});
        assert_eq!(
            run_ok("(r) => r.items.length", &[data.clone()]),
            JsValue::Number(3.0)
        );
        assert_eq!(run_ok("(r) => r.items[1]", &[data]), JsValue::Number(2.0));
    }

    #[test]
    fn test_truthiness_through_not() {
        assert_eq!(run_ok("(r) => !r.next", &[json!({"next": null})]), JsValue::Bool(true));
        assert_eq!(run_ok("(r) => !r.next", &[json!({"next": ""})]), JsValue::Bool(true));
        assert_eq!(run_ok("(r) => !r.next", &[json!({"next": "x"})]), JsValue::Bool(false));
        assert_eq!(run_ok("(r) => !r.next", &[json!({"next": 0})]), JsValue::Bool(true));
    }

    #[test]
    fn test_stop_condition_shapes() {
        // The classic stop conditions users actually write.
        let last_page = json!({"data": {"has_more": false}});
        assert!(run_ok("(response) => !response.data.has_more", &[last_page]).is_truthy());

        let short_page = json!({"items": [1]});
        assert!(
            run_ok("(response, pageInfo) => response.items.length < 50", &[short_page])
                .is_truthy()
        );

        let done = json!({"meta": {"next": null}});
        assert!(run_ok("(r) => r.meta.next === null", &[done]).is_truthy());
    }

    #[test]
    fn test_loose_equality() {
        assert_eq!(run_ok("(r) => r.n == '5'", &[json!({"n": 5})]), JsValue::Bool(true));
        assert_eq!(run_ok("(r) => r.n === '5'", &[json!({"n": 5})]), JsValue::Bool(false));
        assert_eq!(run_ok("(r) => r.x == null", &[json!({})]), JsValue::Bool(true));
        assert_eq!(run_ok("(r) => r.x == null", &[json!({"x": 0})]), JsValue::Bool(false));
    }

    #[test]
    fn test_string_concat_and_arithmetic() {
        assert_eq!(
            run_ok("(r) => 'p' + r.page", &[json!({"page": 2})]),
            JsValue::String("p2".into())
        );
        assert_eq!(
            run_ok("(r) => r.offset + 50", &[json!({"offset": 100})]),
            JsValue::Number(150.0)
        );
    }

    #[test]
    fn test_ternary_and_nullish() {
        assert_eq!(
            run_ok("(r) => r.cursor ?? ''", &[json!({"cursor": null})]),
            JsValue::String("".into())
        );
        assert_eq!(
            run_ok("(r) => r.done ? 'yes' : 'no'", &[json!({"done": true})]),
            JsValue::String("yes".into())
        );
    }

    #[test]
    fn test_builtins() {
        assert_eq!(
            run_ok("(r) => Math.min(r.a, r.b)", &[json!({"a": 3, "b": 7})]),
            JsValue::Number(3.0)
        );
        assert_eq!(
            run_ok("(r) => Array.isArray(r.items)", &[json!({"items": []})]),
            JsValue::Bool(true)
        );
        assert_eq!(
            run_ok("(r) => Object.keys(r).length", &[json!({"a": 1, "b": 2})]),
            JsValue::Number(2.0)
        );
        assert_eq!(
            run_ok("(r) => JSON.stringify(r.a)", &[json!({"a": [1]})]),
            JsValue::String("[1]".into())
        );
        assert_eq!(
            run_ok("(r) => parseInt('42abc')", &[json!(null)]),
            JsValue::Number(42.0)
        );
    }

    #[test]
    fn test_string_methods() {
        let data = json!({"status": "Has More Pages"});
        assert!(run_ok("(r) => r.status.toLowerCase().includes('more')", &[data]).is_truthy());
        assert_eq!(
            run_ok("(r) => r.tags.join('-')", &[json!({"tags": ["a", "b"]})]),
            JsValue::String("a-b".into())
        );
    }

    #[test]
    fn test_fuel_exhaustion() {
        let limits = EvalLimits {
            max_fuel: 10,
            ..EvalLimits::default()
        };
        let f = parse_arrow_fn("(r) => r.a + r.b + r.c + r.d + r.e + r.f").unwrap();
        let args = vec![JsValue::from_json(&json!({}))];
        let err = Evaluator::new(limits).call(&f, args).unwrap_err();
        assert!(err.to_string().contains("budget"));
    }

    #[test]
    fn test_undefined_param_binding() {
        // Second parameter missing from args binds to undefined.
        assert_eq!(
            run_ok("(response, pageInfo) => typeof pageInfo", &[json!({})]),
            JsValue::String("undefined".into())
        );
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(JsValue::Number(2.0).to_template_string(), "2");
        assert_eq!(JsValue::Number(2.5).to_template_string(), "2.5");
        assert_eq!(JsValue::Number(f64::NAN).to_template_string(), "NaN");
    }

    #[test]
    fn test_unknown_identifier_is_error() {
        assert!(run("(r) => nonexistent", &[json!({})]).is_err());
    }
}
