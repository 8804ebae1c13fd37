//! Filters available inside action command templates
//!
//! Parameters end up on a command line, so templates quote them with
//! `ps_quote` for PowerShell or `shell_escape` for POSIX shells.

use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind, State};

pub fn register_filters(env: &mut Environment) {
    env.add_filter("shell_escape", |v: Value| shell_escape(&v.to_string()));
    env.add_filter("ps_quote", |v: Value| ps_quote(&v.to_string()));
    env.add_filter("json", filter_json);
    env.add_filter("default", filter_default);
    env.add_filter("lines", filter_lines);
}

/// Words made only of these characters pass through a POSIX shell untouched
fn is_shell_safe(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

/// Quote `s` for a POSIX shell
///
/// `hello 'world'` becomes `'hello '\''world'\''`; safe words are left bare.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_shell_safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote `s` as a PowerShell single-quoted literal
///
/// Embedded single quotes are doubled: `it's` becomes `'it''s'`. PowerShell
/// also ends a literal on the typographic quotes U+2018..=U+201B, so those
/// are doubled as well.
pub fn ps_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if matches!(c, '\'' | '\u{2018}'..='\u{201b}') {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn filter_json(_state: &State, value: Value) -> Result<Value, Error> {
    serde_json::to_string(&value)
        .map(Value::from)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("cannot encode as JSON: {e}")))
}

/// Fall back to `fallback` for undefined, none or empty-string values
fn filter_default(_state: &State, value: Value, fallback: Value) -> Result<Value, Error> {
    let missing = value.is_undefined() || value.is_none() || value.as_str() == Some("");
    Ok(if missing { fallback } else { value })
}

fn filter_lines(_state: &State, value: Value) -> Result<Value, Error> {
    Ok(value.to_string().lines().map(Value::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;

    fn render(template: &str, ctx: Value) -> String {
        let mut env = Environment::new();
        register_filters(&mut env);
        env.add_template("test", template).unwrap();
        env.get_template("test").unwrap().render(ctx).unwrap()
    }

    #[test]
    fn test_shell_escape_simple() {
        assert_eq!(shell_escape("example.com"), "example.com");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_shell_escape_quotes() {
        let result = render(
            "{{ value | shell_escape }}",
            minijinja::context! { value => "it's a test" },
        );
        assert_eq!(result, "'it'\\''s a test'");
    }

    #[test]
    fn test_shell_escape_special_chars() {
        let result = render(
            "{{ value | shell_escape }}",
            minijinja::context! { value => "$(rm -rf /)" },
        );
        assert_eq!(result, "'$(rm -rf /)'");
    }

    #[test]
    fn test_ps_quote() {
        assert_eq!(ps_quote("W3SVC"), "'W3SVC'");
        assert_eq!(ps_quote("it's"), "'it''s'");
        let result = render(
            "Restart-Service -Name {{ name | ps_quote }}",
            minijinja::context! { name => "Bob's $(evil)" },
        );
        assert_eq!(result, "Restart-Service -Name 'Bob''s $(evil)'");
    }

    #[test]
    fn test_ps_quote_doubles_typographic_quotes() {
        assert_eq!(ps_quote("it\u{2019}s"), "'it\u{2019}\u{2019}s'");
        assert_eq!(
            ps_quote("\u{2018}x\u{201a}\u{201b}"),
            "'\u{2018}\u{2018}x\u{201a}\u{201a}\u{201b}\u{201b}'"
        );
        // Double quotes stay literal inside a single-quoted string
        assert_eq!(ps_quote("\u{201c}x\""), "'\u{201c}x\"'");
    }

    #[test]
    fn test_json_filter_array() {
        let result = render(
            "{{ value | json }}",
            minijinja::context! { value => vec!["a", "b", "c"] },
        );
        assert_eq!(result, "[\"a\",\"b\",\"c\"]");
    }

    #[test]
    fn test_default_filter() {
        let result = render(
            "{{ value | default('localhost') }}",
            minijinja::context! { value => "" },
        );
        assert_eq!(result, "localhost");

        let result = render(
            "{{ value | default('localhost') }}",
            minijinja::context! { value => "example.com" },
        );
        assert_eq!(result, "example.com");
    }

    #[test]
    fn test_lines_filter() {
        let result = render(
            "{% for l in value | lines %}[{{ l }}]{% endfor %}",
            minijinja::context! { value => "a\nb" },
        );
        assert_eq!(result, "[a][b]");
    }
}
