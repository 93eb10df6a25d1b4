//! Function-name recovery from a line of original source.
//!
//! Source maps often omit the `names` entry for a segment. When that happens
//! the line the segment points at usually still reads like a definition, so a
//! handful of patterns gets a usable frame name back. Best effort only.

use std::sync::OnceLock;

use regex::Regex;

/// Words that precede `(` in control flow and must never be reported as names.
const KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "do", "switch", "case", "catch", "try", "finally", "return",
    "function", "with", "new", "typeof", "delete", "void", "await", "yield", "throw", "match",
    "loop", "in", "of",
];

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // function foo(  /  async function* foo(
            r"(?:^|[^\w$])(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)\s*\(",
            // fn foo(  /  pub async fn foo<T>(
            r"(?:^|\W)fn\s+([A-Za-z_][\w]*)\s*[<(]",
            // foo = (a) =>  /  foo: async x =>  /  const foo = function
            r"([A-Za-z_$][\w$]*)\s*[:=]\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*=>|[A-Za-z_$][\w$]*\s*=>)",
            // object-method shorthand: foo(a, b) {
            r"^\s*(?:(?:static|async|get|set|public|private|protected)\s+)*\*?\s*([A-Za-z_$][\w$]*)\s*\([^)]*\)\s*\{",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Extract the name of the function defined on `line`, if it looks like one.
///
/// ```
/// use proftoggle::sourcemap::extract_function_name;
///
/// assert_eq!(extract_function_name("function foo(a, b) {").as_deref(), Some("foo"));
/// assert_eq!(extract_function_name("if (x) {"), None);
/// ```
#[must_use]
pub fn extract_function_name(line: &str) -> Option<String> {
    patterns().iter().find_map(|re| {
        re.captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|name| !KEYWORDS.contains(name))
            .map(ToString::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_function() {
        assert_eq!(extract_function_name("function foo(a, b) {").as_deref(), Some("foo"));
        assert_eq!(
            extract_function_name("export async function loadUser(id) {").as_deref(),
            Some("loadUser")
        );
        assert_eq!(extract_function_name("function* gen() {").as_deref(), Some("gen"));
    }

    #[test]
    fn test_arrow_assigned_to_identifier() {
        assert_eq!(
            extract_function_name("const handler = (req, res) => {").as_deref(),
            Some("handler")
        );
        assert_eq!(extract_function_name("  onClick: async e => {").as_deref(), Some("onClick"));
        assert_eq!(extract_function_name("let parse = function (s) {").as_deref(), Some("parse"));
    }

    #[test]
    fn test_method_shorthand() {
        assert_eq!(extract_function_name("  render(props) {").as_deref(), Some("render"));
        assert_eq!(extract_function_name("  static async create() {").as_deref(), Some("create"));
    }

    #[test]
    fn test_rust_fn() {
        assert_eq!(extract_function_name("pub fn encode<W: Write>(w: W) {").as_deref(), Some("encode"));
    }

    #[test]
    fn test_control_flow_is_not_a_name() {
        assert_eq!(extract_function_name("if (x) {"), None);
        assert_eq!(extract_function_name("  for (let i = 0; i < n; i++) {"), None);
        assert_eq!(extract_function_name("} catch (err) {"), None);
        assert_eq!(extract_function_name("while (true) {"), None);
        assert_eq!(extract_function_name("return x + 1;"), None);
    }
}
