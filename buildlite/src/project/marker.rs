//! PEP 508 environment markers.
//!
//! Markers decide whether a dependency edge applies to the target image
//! (`sys_platform == "win32"` edges are dropped for a Linux image, for
//! example). Evaluation happens against a [`MarkerEnvironment`] describing the
//! runtime interpreter, not the host running the build.

use super::name::PackageName;
use super::version::{Version, VersionSpecifier};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::collections::BTreeSet;
use std::fmt;

/// Interpreter and platform facts of the runtime image.
#[derive(Debug, Clone)]
pub struct MarkerEnvironment {
    pub python_version: String,
    pub python_full_version: String,
    pub implementation_name: String,
    pub implementation_version: String,
    pub platform_python_implementation: String,
    pub os_name: String,
    pub sys_platform: String,
    pub platform_system: String,
    pub platform_machine: String,
    pub platform_release: String,
    pub extras: BTreeSet<String>,
}

impl MarkerEnvironment {
    /// CPython on Linux, the shape of the official `python:*` images.
    pub fn linux_cpython(python_version: &str, machine: &str) -> Self {
        let full = if python_version.matches('.').count() >= 2 {
            python_version.to_string()
        } else {
            format!("{}.0", python_version)
        };
        let short: String = full.split('.').take(2).collect::<Vec<_>>().join(".");
        Self {
            python_version: short,
            python_full_version: full.clone(),
            implementation_name: "cpython".into(),
            implementation_version: full,
            platform_python_implementation: "CPython".into(),
            os_name: "posix".into(),
            sys_platform: "linux".into(),
            platform_system: "Linux".into(),
            platform_machine: machine.into(),
            platform_release: String::new(),
            extras: BTreeSet::new(),
        }
    }

    /// Same environment with the given extras active.
    pub fn with_extras<I, S>(&self, extras: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = self.clone();
        env.extras = extras
            .into_iter()
            .map(|e| PackageName::new(e.as_ref()).to_string())
            .collect();
        env
    }

    fn get(&self, var: &str) -> Option<&str> {
        let value = match var {
            "python_version" => &self.python_version,
            "python_full_version" => &self.python_full_version,
            "implementation_name" => &self.implementation_name,
            "implementation_version" => &self.implementation_version,
            "platform_python_implementation" | "python_implementation" => {
                &self.platform_python_implementation
            }
            "os_name" | "os.name" => &self.os_name,
            "sys_platform" | "sys.platform" => &self.sys_platform,
            "platform_system" => &self.platform_system,
            "platform_machine" | "platform.machine" => &self.platform_machine,
            "platform_release" => &self.platform_release,
            _ => return None,
        };
        Some(value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerValue {
    Variable(String),
    Literal(String),
}

impl fmt::Display for MarkerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerValue::Variable(v) => f.write_str(v),
            MarkerValue::Literal(l) => write!(f, "\"{}\"", l),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerExpr {
    And(Vec<MarkerExpr>),
    Or(Vec<MarkerExpr>),
    Compare {
        lhs: MarkerValue,
        op: String,
        rhs: MarkerValue,
    },
}

impl MarkerExpr {
    pub fn parse(input: &str) -> BuildliteResult<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            src: input,
        };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing tokens"));
        }
        Ok(expr)
    }

    pub fn evaluate(&self, env: &MarkerEnvironment) -> bool {
        match self {
            MarkerExpr::And(items) => items.iter().all(|e| e.evaluate(env)),
            MarkerExpr::Or(items) => items.iter().any(|e| e.evaluate(env)),
            MarkerExpr::Compare { lhs, op, rhs } => compare(lhs, op, rhs, env),
        }
    }

    /// Whether the marker mentions `extra`, i.e. the edge belongs to an extra.
    pub fn references_extra(&self) -> bool {
        match self {
            MarkerExpr::And(items) | MarkerExpr::Or(items) => {
                items.iter().any(|e| e.references_extra())
            }
            MarkerExpr::Compare { lhs, rhs, .. } => [lhs, rhs]
                .iter()
                .any(|v| matches!(v, MarkerValue::Variable(name) if name == "extra")),
        }
    }
}

impl fmt::Display for MarkerExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerExpr::And(items) | MarkerExpr::Or(items) => {
                let joiner = if matches!(self, MarkerExpr::And(_)) {
                    " and "
                } else {
                    " or "
                };
                let parts: Vec<String> = items
                    .iter()
                    .map(|e| match e {
                        MarkerExpr::Compare { .. } => e.to_string(),
                        _ => format!("({})", e),
                    })
                    .collect();
                f.write_str(&parts.join(joiner))
            }
            MarkerExpr::Compare { lhs, op, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
        }
    }
}

fn resolve<'a>(value: &'a MarkerValue, env: &'a MarkerEnvironment) -> Option<&'a str> {
    match value {
        MarkerValue::Literal(l) => Some(l.as_str()),
        MarkerValue::Variable(v) => env.get(v),
    }
}

fn compare(lhs: &MarkerValue, op: &str, rhs: &MarkerValue, env: &MarkerEnvironment) -> bool {
    let is_extra = |v: &MarkerValue| matches!(v, MarkerValue::Variable(name) if name == "extra");

    if is_extra(lhs) || is_extra(rhs) {
        let literal = if is_extra(lhs) { rhs } else { lhs };
        let MarkerValue::Literal(extra) = literal else {
            return false;
        };
        let active = env.extras.contains(PackageName::new(extra).as_str());
        return match op {
            "==" => active,
            "!=" => !active,
            _ => false,
        };
    }

    let (Some(l), Some(r)) = (resolve(lhs, env), resolve(rhs, env)) else {
        // unknown variables never match
        return false;
    };

    match op {
        "in" => r.contains(l),
        "not in" => !r.contains(l),
        _ => {
            if let (Ok(left), Ok(spec)) = (
                Version::parse(l),
                VersionSpecifier::parse(&format!("{}{}", op, r)),
            ) {
                return spec.contains(&left);
            }
            match op {
                "==" | "===" => l == r,
                "!=" => l != r,
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                ">=" => l >= r,
                _ => false,
            }
        }
    }
}

// ============================================================================
// PARSER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Ident(String),
    Literal(String),
    Op(String),
}

fn tokenize(input: &str) -> BuildliteResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| {
                        BuildliteError::Manifest(format!("unterminated string in marker '{}'", input))
                    })?;
                tokens.push(Token::Literal(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '<' | '>' | '=' | '!' | '~' => {
                let start = i;
                while i < chars.len() && matches!(chars[i], '<' | '>' | '=' | '!' | '~') {
                    i += 1;
                }
                tokens.push(Token::Op(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(BuildliteError::Manifest(format!(
                    "unexpected character '{}' in marker '{}'",
                    other, input
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src: &'a str,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> BuildliteError {
        BuildliteError::Manifest(format!("invalid marker '{}': {}", self.src, msg))
    }

    fn peek_ident(&self, word: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Ident(w)) if w == word)
    }

    fn or_expr(&mut self) -> BuildliteResult<MarkerExpr> {
        let mut items = vec![self.and_expr()?];
        while self.peek_ident("or") {
            self.pos += 1;
            items.push(self.and_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            MarkerExpr::Or(items)
        })
    }

    fn and_expr(&mut self) -> BuildliteResult<MarkerExpr> {
        let mut items = vec![self.atom()?];
        while self.peek_ident("and") {
            self.pos += 1;
            items.push(self.atom()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            MarkerExpr::And(items)
        })
    }

    fn atom(&mut self) -> BuildliteResult<MarkerExpr> {
        if self.tokens.get(self.pos) == Some(&Token::Open) {
            self.pos += 1;
            let expr = self.or_expr()?;
            if self.tokens.get(self.pos) != Some(&Token::Close) {
                return Err(self.error("missing ')'"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        let lhs = self.value()?;
        let op = self.operator()?;
        let rhs = self.value()?;
        Ok(MarkerExpr::Compare { lhs, op, rhs })
    }

    fn value(&mut self) -> BuildliteResult<MarkerValue> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("expected a value"))?;
        self.pos += 1;
        match token {
            Token::Ident(name) => Ok(MarkerValue::Variable(name)),
            Token::Literal(value) => Ok(MarkerValue::Literal(value)),
            _ => Err(self.error("expected a variable or a quoted string")),
        }
    }

    fn operator(&mut self) -> BuildliteResult<String> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Op(op)) => {
                self.pos += 1;
                match op.as_str() {
                    "==" | "!=" | "<" | "<=" | ">" | ">=" | "~=" | "===" => Ok(op),
                    _ => Err(self.error(&format!("unknown operator '{}'", op))),
                }
            }
            Some(Token::Ident(word)) if word == "in" => {
                self.pos += 1;
                Ok("in".into())
            }
            Some(Token::Ident(word)) if word == "not" => {
                self.pos += 1;
                if !self.peek_ident("in") {
                    return Err(self.error("expected 'in' after 'not'"));
                }
                self.pos += 1;
                Ok("not in".into())
            }
            _ => Err(self.error("expected an operator")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> MarkerEnvironment {
        MarkerEnvironment::linux_cpython("3.12", "x86_64")
    }

    fn eval(marker: &str) -> bool {
        MarkerExpr::parse(marker).unwrap().evaluate(&env())
    }

    #[test]
    fn test_platform_markers() {
        assert!(eval("sys_platform == 'linux'"));
        assert!(!eval("sys_platform == \"win32\""));
        assert!(eval("platform_system != 'Windows' and platform_machine == 'x86_64'"));
        assert!(eval("sys_platform == 'win32' or sys_platform == 'linux'"));
    }

    #[test]
    fn test_version_markers() {
        assert!(eval("python_version >= '3.8'"));
        assert!(!eval("python_version < '3.11'"));
        assert!(eval("python_full_version >= '3.12.0'"));
        assert!(eval("(python_version >= '3.8') and (os_name == 'posix')"));
    }

    #[test]
    fn test_extra_markers() {
        let marker = MarkerExpr::parse("extra == 'Standard'").unwrap();
        assert!(marker.references_extra());
        assert!(!marker.evaluate(&env()));
        assert!(marker.evaluate(&env().with_extras(["standard"])));
    }

    #[test]
    fn test_in_operator() {
        assert!(eval("'linux' in sys_platform"));
        assert!(eval("platform_machine not in 'arm64 aarch64'"));
    }

    #[test]
    fn test_invalid_markers() {
        assert!(MarkerExpr::parse("python_version >=").is_err());
        assert!(MarkerExpr::parse("(os_name == 'posix'").is_err());
        assert!(MarkerExpr::parse("os_name = 'posix'").is_err());
    }

    #[test]
    fn test_display_is_canonical() {
        let a = MarkerExpr::parse("os_name=='posix'  and python_version>='3.8'").unwrap();
        let b = MarkerExpr::parse("os_name == \"posix\" and python_version >= '3.8'").unwrap();
        assert_eq!(a.to_string(), b.to_string());
    }
}
