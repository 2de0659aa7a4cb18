// Condition evaluation
//
// Precedence, loosest first:
//   or ||  ->  and &&  ->  not  ->  == != === !== <> < <= > >=  ->  + -  ->  * / %  ->  ! unary -
// Unresolved lookups evaluate to null. Malformed conditions never fail: a
// missing operand is null and trailing tokens are ignored. A condition nested
// deeper than MAX_NESTING is false.

use std::cmp::Ordering;
use std::mem::discriminant;

use super::expr::{CondToken, Condition, VarPath, MAX_NESTING};
use crate::value::Value;

const COMPARISONS: &[&str] = &["===", "!==", "==", "!=", "<>", "<=", ">=", "<", ">"];

/// Evaluate `condition` to a boolean, resolving bare identifiers with `lookup`.
pub fn evaluate(condition: &Condition, lookup: &dyn Fn(&VarPath) -> Option<Value>) -> bool {
    let mut evaluator = Evaluator {
        tokens: &condition.tokens,
        pos: 0,
        depth: 0,
        too_deep: false,
        lookup,
    };
    let value = evaluator.or_expr();
    if evaluator.too_deep {
        tracing::warn!(condition = %condition.source, limit = MAX_NESTING, "condition nested too deeply");
        return false;
    }
    if evaluator.pos < evaluator.tokens.len() {
        tracing::debug!(condition = %condition.source, "ignoring trailing condition tokens");
    }
    value.is_truthy()
}

struct Evaluator<'a> {
    tokens: &'a [CondToken],
    pos: usize,
    depth: usize,
    too_deep: bool,
    lookup: &'a dyn Fn(&VarPath) -> Option<Value>,
}

impl Evaluator<'_> {
    /// Consume the next token if it is one of `ops`.
    fn eat(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        let tokens = self.tokens;
        let Some(CondToken::Op(op)) = tokens.get(self.pos) else {
            return None;
        };
        let matched = ops.iter().copied().find(|candidate| *candidate == op.as_str())?;
        self.pos += 1;
        Some(matched)
    }

    /// Run `eval` one level deeper. Past the limit the rest of the input is
    /// skipped and the result is null.
    fn nested(&mut self, eval: fn(&mut Self) -> Value) -> Value {
        if self.depth >= MAX_NESTING {
            self.too_deep = true;
            self.pos = self.tokens.len();
            return Value::Null;
        }
        self.depth += 1;
        let value = eval(self);
        self.depth -= 1;
        value
    }

    fn or_expr(&mut self) -> Value {
        let mut left = self.and_expr();
        while self.eat(&["or", "||"]).is_some() {
            let right = self.and_expr();
            left = Value::Bool(left.is_truthy() || right.is_truthy());
        }
        left
    }

    fn and_expr(&mut self) -> Value {
        let mut left = self.not_expr();
        while self.eat(&["and", "&&"]).is_some() {
            let right = self.not_expr();
            left = Value::Bool(left.is_truthy() && right.is_truthy());
        }
        left
    }

    fn not_expr(&mut self) -> Value {
        if self.eat(&["not"]).is_some() {
            return Value::Bool(!self.nested(Self::not_expr).is_truthy());
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Value {
        let mut left = self.additive();
        while let Some(op) = self.eat(COMPARISONS) {
            let right = self.additive();
            left = Value::Bool(compare(op, &left, &right));
        }
        left
    }

    fn additive(&mut self) -> Value {
        let mut left = self.term();
        while let Some(op) = self.eat(&["+", "-"]) {
            let right = self.term();
            left = arithmetic(op, &left, &right);
        }
        left
    }

    fn term(&mut self) -> Value {
        let mut left = self.unary();
        while let Some(op) = self.eat(&["*", "/", "%"]) {
            let right = self.unary();
            left = arithmetic(op, &left, &right);
        }
        left
    }

    fn unary(&mut self) -> Value {
        if self.eat(&["!"]).is_some() {
            return Value::Bool(!self.nested(Self::unary).is_truthy());
        }
        if self.eat(&["-"]).is_some() {
            let operand = self.nested(Self::unary);
            return arithmetic("-", &Value::Int(0), &operand);
        }
        self.primary()
    }

    fn primary(&mut self) -> Value {
        let tokens = self.tokens;
        let Some(token) = tokens.get(self.pos) else {
            return Value::Null;
        };
        self.pos += 1;
        match token {
            CondToken::Literal(lit) => lit.to_value(),
            CondToken::Lookup(path) => (self.lookup)(path).unwrap_or(Value::Null),
            CondToken::Open => {
                let value = self.nested(Self::or_expr);
                if matches!(self.tokens.get(self.pos), Some(CondToken::Close)) {
                    self.pos += 1;
                }
                value
            }
            CondToken::Close | CondToken::Op(_) => Value::Null,
        }
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "==" => loose_eq(left, right),
        "!=" | "<>" => !loose_eq(left, right),
        "===" => strict_eq(left, right),
        "!==" => !strict_eq(left, right),
        "<" => ordering(left, right) == Some(Ordering::Less),
        "<=" => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
        ">" => ordering(left, right) == Some(Ordering::Greater),
        ">=" => matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal)),
        _ => false,
    }
}

/// Loose equality: null and booleans compare by truthiness, numeric strings
/// compare as numbers.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, other) | (other, Value::Null) => !other.is_truthy(),
        (Value::Bool(b), other) | (other, Value::Bool(b)) => *b == other.is_truthy(),
        (Value::String(a), Value::String(b)) => match (left.as_number(), right.as_number()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::String(_), _) | (_, Value::String(_)) => {
            match (left.as_number(), right.as_number()) {
                (Some(x), Some(y)) => x == y,
                _ => left.to_output() == right.to_output(),
            }
        }
        _ => left == right,
    }
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    discriminant(left) == discriminant(right) && left == right
}

/// Two non-numeric strings order lexicographically; everything else numerically.
fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        if left.as_number().is_none() || right.as_number().is_none() {
            return Some(a.cmp(b));
        }
    }
    left.as_number()?.partial_cmp(&right.as_number()?)
}

fn arithmetic(op: &str, left: &Value, right: &Value) -> Value {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let exact = match op {
            "+" => a.checked_add(*b),
            "-" => a.checked_sub(*b),
            "*" => a.checked_mul(*b),
            "%" => a.checked_rem(*b),
            _ => None,
        };
        if let Some(result) = exact {
            return Value::Int(result);
        }
    }

    let a = left.as_number().unwrap_or(0.0);
    let b = right.as_number().unwrap_or(0.0);
    match op {
        "+" => Value::Float(a + b),
        "-" => Value::Float(a - b),
        "*" => Value::Float(a * b),
        "/" | "%" if b == 0.0 => Value::Null,
        "/" => Value::Float(a / b),
        "%" => Value::Float(a % b),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn check(source: &str, vars: &[(&str, Value)]) -> bool {
        let vars: BTreeMap<String, Value> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let lookup = |path: &VarPath| -> Option<Value> {
            let mut current = vars.get(path.root()?)?.clone();
            for segment in &path.segments[1..] {
                current = match segment {
                    crate::template::expr::PathSegment::Key(k) => current.get_key(k)?,
                    crate::template::expr::PathSegment::Index(i) => current.get_index(*i)?,
                };
            }
            Some(current)
        };
        evaluate(&Condition::parse(source), &lookup)
    }

    #[test]
    fn test_bare_identifiers_are_truthiness_checks() {
        assert!(check("name", &[("name", Value::from("x"))]));
        assert!(!check("missing", &[]));
        assert!(!check("zero", &[("zero", Value::Int(0))]));
        assert!(!check("empty", &[("empty", Value::from(""))]));
        assert!(!check("list", &[("list", Value::from(Vec::<Value>::new()))]));
        assert!(check("text", &[("text", Value::from("0"))]));
    }

    #[test]
    fn test_keywords_and_symbols() {
        let vars = [("enabled", Value::Bool(true)), ("visible", Value::Bool(false))];
        assert!(!check("enabled and visible", &vars));
        assert!(check("enabled or visible", &vars));
        assert!(check("enabled && not visible", &vars));
        assert!(check("!visible", &vars));
        assert!(check("not (enabled and visible)", &vars));
    }

    #[test]
    fn test_literal_comparisons() {
        let vars = [("active", Value::Bool(true)), ("role", Value::from("admin"))];
        assert!(check("active == true", &vars));
        assert!(check("role == 'admin'", &vars));
        assert!(check("role != \"guest\"", &vars));
        assert!(check("role <> 'guest'", &vars));
        assert!(check("missing == null", &vars));
    }

    #[test]
    fn test_numeric_comparisons() {
        let vars = [("age", Value::Int(21)), ("score", Value::from("9.5"))];
        assert!(check("age >= 18", &vars));
        assert!(!check("age < 18", &vars));
        assert!(check("score > 9", &vars));
        assert!(check("age == '21'", &vars));
        assert!(!check("age === '21'", &vars));
        assert!(check("age === 21", &vars));
        assert!(check("age !== 21.5", &vars));
    }

    #[test]
    fn test_arithmetic() {
        let vars = [("count", Value::Int(7))];
        assert!(check("count % 2 == 1", &vars));
        assert!(check("count + 3 == 10", &vars));
        assert!(check("count * 2 - 4 == 10", &vars));
        assert!(check("(count - 1) / 2 == 3", &vars));
        assert!(!check("count / 0", &vars));
        assert!(check("-count < 0", &vars));
    }

    #[test]
    fn test_nested_paths() {
        let mut user = BTreeMap::new();
        user.insert("age".to_string(), Value::Int(30));
        let vars = [("user", Value::from(user))];
        assert!(check("$user.age > 18", &vars));
        assert!(!check("user.name", &vars));
    }

    #[test]
    fn test_string_ordering() {
        let vars = [("a", Value::from("apple")), ("b", Value::from("banana"))];
        assert!(check("a < b", &vars));
        assert!(!check("a > b", &vars));
    }

    #[test]
    fn test_deep_nesting_is_false() {
        let vars = [("a", Value::Bool(true))];
        let shallow = format!("{}a{}", "(".repeat(10), ")".repeat(10));
        assert!(check(&shallow, &vars));

        let deep = format!("{}a", "(".repeat(200_000));
        assert!(!check(&deep, &vars));
        assert!(!check(&format!("{}a", "not ".repeat(200_000)), &vars));
        assert!(!check(&format!("{}a", "!".repeat(200_000)), &vars));
        assert!(!check(&format!("{}a", "- ".repeat(200_000)), &vars));
    }

    #[test]
    fn test_malformed_conditions_do_not_panic() {
        assert!(!check("== 1", &[]));
        assert!(!check("(", &[]));
        assert!(check("1 )", &[]));
        assert!(!check("", &[]));
    }
}
