//! Template expansion.
//!
//! The test runner only depends on the [`TemplateRenderer`] trait. The
//! built-in [`SimpleRenderer`] covers the small subset question templates
//! need: `{{ path | e('py') }}` substitution, `{% for %}` loops and
//! `{% if %}` blocks. Everything it can't resolve is a [`TemplateError`].

use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("Template syntax error: {0}")]
    Syntax(String),

    #[error("Variable \"{0}\" does not exist")]
    UndefinedVariable(String),

    #[error("Unknown filter or escaper \"{0}\"")]
    UnknownFilter(String),

    #[error("Variable \"{0}\" is not a scalar and can't be printed")]
    NotScalar(String),

    #[error("Variable \"{0}\" is not a list")]
    NotIterable(String),
}

/// Expands a template against an environment of JSON values.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, env: &Value) -> Result<String, TemplateError>;
}

/// Escape for inclusion in a Python string literal.
pub fn python_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escape for inclusion in a Java or C string literal.
pub fn java_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
        .replace('\x0c', "\\f")
        .replace('\x08', "\\b")
}

/// Escape for inclusion in a single-quoted Matlab/Octave string that is
/// later passed through sprintf.
pub fn matlab_escape(s: &str) -> String {
    s.replace("\\n", "\\\\n")
        .replace('\'', "''")
        .replace('\n', "\\n")
        .replace('\r', "")
        .replace('%', "%%")
}

fn escaper(name: &str) -> Option<fn(&str) -> String> {
    match name {
        "py" | "python" => Some(python_escape),
        "java" | "c" => Some(java_escape),
        "matlab" | "ml" => Some(matlab_escape),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Output { path: String, filters: Vec<String> },
    For { var: String, path: String, body: Vec<Node> },
    If { negate: bool, path: String, then: Vec<Node>, otherwise: Vec<Node> },
}

#[derive(Debug, Clone, Copy)]
enum Token<'a> {
    Text(&'a str),
    Output(&'a str),
    Tag(&'a str),
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}|\{%(.*?)%\}").expect("valid regex"))
}

fn filter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^(?:e|escape)\(\s*['"]([a-z]+)['"]\s*\)$"#).expect("valid regex"))
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").expect("valid regex"))
}

fn tokenize(template: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for caps in token_re().captures_iter(template) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        if whole.start > last {
            tokens.push(Token::Text(&template[last..whole.start]));
        }
        if let Some(expr) = caps.get(1) {
            tokens.push(Token::Output(expr.as_str().trim()));
        } else if let Some(tag) = caps.get(2) {
            tokens.push(Token::Tag(tag.as_str().trim()));
        }
        last = whole.end;
    }
    if last < template.len() {
        tokens.push(Token::Text(&template[last..]));
    }
    tokens
}

fn check_path(path: &str) -> Result<String, TemplateError> {
    if path_re().is_match(path) {
        Ok(path.to_string())
    } else {
        Err(TemplateError::Syntax(format!("invalid expression \"{}\"", path)))
    }
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    /// Parse nodes until one of `terminators` (a tag keyword) or the end.
    /// Returns the nodes and the terminator that stopped parsing.
    fn parse_block(&mut self, terminators: &[&str]) -> Result<(Vec<Node>, Option<String>), TemplateError> {
        let mut nodes = Vec::new();
        while self.pos < self.tokens.len() {
            let token = self.tokens[self.pos];
            self.pos += 1;
            match token {
                Token::Text(text) => nodes.push(Node::Text(text.to_string())),
                Token::Output(expr) => {
                    let mut parts = expr.split('|').map(str::trim);
                    let path = check_path(parts.next().unwrap_or_default())?;
                    let filters = parts.map(str::to_string).collect();
                    nodes.push(Node::Output { path, filters });
                }
                Token::Tag(tag) => {
                    let words: Vec<&str> = tag.split_whitespace().collect();
                    match words.as_slice() {
                        [keyword] if terminators.contains(keyword) => {
                            return Ok((nodes, Some(keyword.to_string())));
                        }
                        ["for", var, "in", path] => {
                            let var = var.to_string();
                            let path = check_path(path)?;
                            let (body, end) = self.parse_block(&["endfor"])?;
                            if end.is_none() {
                                return Err(TemplateError::Syntax("unclosed \"for\" block".to_string()));
                            }
                            nodes.push(Node::For { var, path, body });
                        }
                        ["if", rest @ ..] if !rest.is_empty() => {
                            let (negate, path) = match rest {
                                ["not", path] => (true, check_path(path)?),
                                [path] => (false, check_path(path)?),
                                _ => return Err(TemplateError::Syntax(format!("unsupported condition \"{}\"", tag))),
                            };
                            let (then, end) = self.parse_block(&["else", "endif"])?;
                            let otherwise = match end.as_deref() {
                                Some("else") => {
                                    let (otherwise, end) = self.parse_block(&["endif"])?;
                                    if end.is_none() {
                                        return Err(TemplateError::Syntax("unclosed \"if\" block".to_string()));
                                    }
                                    otherwise
                                }
                                Some(_) => Vec::new(),
                                None => return Err(TemplateError::Syntax("unclosed \"if\" block".to_string())),
                            };
                            nodes.push(Node::If { negate, path, then, otherwise });
                        }
                        _ => return Err(TemplateError::Syntax(format!("unexpected tag \"{}\"", tag))),
                    }
                }
            }
        }
        Ok((nodes, None))
    }
}

fn parse(template: &str) -> Result<Vec<Node>, TemplateError> {
    let mut parser = Parser {
        tokens: tokenize(template),
        pos: 0,
    };
    let (nodes, _) = parser.parse_block(&[])?;
    Ok(nodes)
}

struct Scope<'e> {
    env: &'e Value,
    locals: Vec<(String, Value)>,
}

impl<'e> Scope<'e> {
    fn lookup(&self, path: &str) -> Result<Value, TemplateError> {
        let mut segments = path.split('.');
        let head = segments.next().unwrap_or_default();
        let mut current = match self.locals.iter().rev().find(|(name, _)| name == head) {
            Some((_, value)) => value,
            None => self.env.get(head).ok_or_else(|| TemplateError::UndefinedVariable(path.to_string()))?,
        };
        for segment in segments {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| TemplateError::UndefinedVariable(path.to_string()))?;
        }
        Ok(current.clone())
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !(s.is_empty() || s == "0"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn scalar_text(path: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(true) => Ok("1".to_string()),
        Value::Bool(false) => Ok(String::new()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Err(TemplateError::NotScalar(path.to_string())),
    }
}

fn apply_filter(filter: &str, text: String) -> Result<String, TemplateError> {
    let name = filter_re()
        .captures(filter)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| TemplateError::UnknownFilter(filter.to_string()))?;
    let escape = escaper(name.as_str()).ok_or_else(|| TemplateError::UnknownFilter(filter.to_string()))?;
    Ok(escape(&text))
}

fn eval(nodes: &[Node], scope: &mut Scope<'_>, out: &mut String) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output { path, filters } => {
                let mut text = scalar_text(path, &scope.lookup(path)?)?;
                for filter in filters {
                    text = apply_filter(filter, text)?;
                }
                out.push_str(&text);
            }
            Node::For { var, path, body } => {
                let items = match scope.lookup(path)? {
                    Value::Array(items) => items,
                    _ => return Err(TemplateError::NotIterable(path.clone())),
                };
                let len = items.len();
                for (i, item) in items.into_iter().enumerate() {
                    let loop_info = json!({
                        "index": i + 1,
                        "index0": i,
                        "first": i == 0,
                        "last": i + 1 == len,
                        "length": len,
                    });
                    scope.locals.push(("loop".to_string(), loop_info));
                    scope.locals.push((var.clone(), item));
                    let result = eval(body, scope, out);
                    scope.locals.truncate(scope.locals.len() - 2);
                    result?;
                }
            }
            Node::If {
                negate,
                path,
                then,
                otherwise,
            } => {
                let truthy = is_truthy(&scope.lookup(path)?);
                if truthy != *negate {
                    eval(then, scope, out)?;
                } else {
                    eval(otherwise, scope, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Built-in renderer for the template subset described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleRenderer;

impl TemplateRenderer for SimpleRenderer {
    fn render(&self, template: &str, env: &Value) -> Result<String, TemplateError> {
        let nodes = parse(template)?;
        let mut scope = Scope {
            env,
            locals: Vec::new(),
        };
        let mut out = String::with_capacity(template.len());
        eval(&nodes, &mut scope, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(template: &str, env: Value) -> Result<String, TemplateError> {
        SimpleRenderer.render(template, &env)
    }

    #[test]
    fn test_substitution_and_paths() {
        let env = json!({"STUDENT_ANSWER": "def f(): pass", "TEST": {"testcode": "print(f())", "mark": 1.5}});
        let out = render("{{ STUDENT_ANSWER }}\n{{TEST.testcode}} # {{ TEST.mark }}", env).unwrap();
        assert_eq!(out, "def f(): pass\nprint(f()) # 1.5");
    }

    #[test]
    fn test_escape_filters() {
        let env = json!({"s": "say \"hi\"\\n"});
        assert_eq!(render("{{ s | e('py') }}", env.clone()).unwrap(), "say \\\"hi\\\"\\\\n");
        assert_eq!(render("{{ s|e(\"java\") }}", env).unwrap(), "say \\\"hi\\\"\\\\n");
    }

    #[test]
    fn test_python_escape() {
        assert_eq!(python_escape("a\\b\"c'"), "a\\\\b\\\"c'");
    }

    #[test]
    fn test_java_escape() {
        assert_eq!(java_escape("it's\n\t\"x\"\\"), "it\\'s\\n\\t\\\"x\\\"\\\\");
        assert_eq!(java_escape("a\r\x0cb"), "a\\r\\fb");
    }

    #[test]
    fn test_matlab_escape() {
        assert_eq!(matlab_escape("it's 50%\r\n"), "it''s 50%%\\n");
        assert_eq!(matlab_escape("fprintf('\\n')"), "fprintf(''\\\\n'')");
    }

    #[test]
    fn test_for_loop_with_loop_vars() {
        let env = json!({"TESTCASES": [{"testcode": "a"}, {"testcode": "b"}, {"testcode": "c"}]});
        let template = "{% for T in TESTCASES %}{{ loop.index }}:{{ T.testcode }}{% if not loop.last %},{% endif %}{% endfor %}";
        assert_eq!(render(template, env).unwrap(), "1:a,2:b,3:c");
    }

    #[test]
    fn test_if_else() {
        let template = "{% if IS_PRECHECK %}pre{% else %}full{% endif %}";
        assert_eq!(render(template, json!({"IS_PRECHECK": "1"})).unwrap(), "pre");
        assert_eq!(render(template, json!({"IS_PRECHECK": "0"})).unwrap(), "full");
        assert_eq!(render(template, json!({"IS_PRECHECK": ""})).unwrap(), "full");
    }

    #[test]
    fn test_nested_loops_restore_scope() {
        let env = json!({"rows": [[1, 2], [3]], "x": "outer"});
        let template = "{% for r in rows %}[{% for x in r %}{{ x }}{% endfor %}]{% endfor %}{{ x }}";
        assert_eq!(render(template, env).unwrap(), "[12][3]outer");
    }

    #[test]
    fn test_undefined_variable() {
        let err = render("{{ NOPE }}", json!({})).unwrap_err();
        assert_eq!(err, TemplateError::UndefinedVariable("NOPE".to_string()));
        let err = render("{{ TEST.missing }}", json!({"TEST": {}})).unwrap_err();
        assert_eq!(err, TemplateError::UndefinedVariable("TEST.missing".to_string()));
    }

    #[test]
    fn test_unknown_filter() {
        let err = render("{{ s | upper }}", json!({"s": "x"})).unwrap_err();
        assert_eq!(err, TemplateError::UnknownFilter("upper".to_string()));
        let err = render("{{ s | e('perl') }}", json!({"s": "x"})).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownFilter(_)));
    }

    #[test]
    fn test_unbalanced_blocks() {
        assert!(matches!(render("{% for t in x %}a", json!({"x": []})), Err(TemplateError::Syntax(_))));
        assert!(matches!(render("{% if x %}a", json!({"x": 1})), Err(TemplateError::Syntax(_))));
        assert!(matches!(render("a{% endfor %}", json!({})), Err(TemplateError::Syntax(_))));
        assert!(matches!(render("{% include 'x' %}", json!({})), Err(TemplateError::Syntax(_))));
    }

    #[test]
    fn test_non_scalar_and_non_list() {
        let err = render("{{ TESTCASES }}", json!({"TESTCASES": []})).unwrap_err();
        assert_eq!(err, TemplateError::NotScalar("TESTCASES".to_string()));
        let err = render("{% for t in s %}{% endfor %}", json!({"s": "abc"})).unwrap_err();
        assert_eq!(err, TemplateError::NotIterable("s".to_string()));
    }

    #[test]
    fn test_literal_text_preserved() {
        let template = "int main() {\n    return 0;\n}\n";
        assert_eq!(render(template, json!({})).unwrap(), template);
    }
}
