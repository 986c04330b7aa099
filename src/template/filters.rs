//! Custom template filters

use minijinja::value::Value;
use minijinja::{Error, ErrorKind, State};

/// Register all custom filters with a minijinja Environment
pub fn register_filters(env: &mut minijinja::Environment) {
    env.add_filter("json", filter_json);
    env.add_filter("word_count", filter_word_count);
    env.add_filter("strftime", filter_strftime);
}

/// Serialize value to JSON string
fn filter_json(_state: &State, value: Value) -> Result<Value, Error> {
    let json = serde_json::to_string(&value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("JSON serialization failed: {}", e),
        )
    })?;
    Ok(Value::from(json))
}

/// Number of whitespace-separated words
fn filter_word_count(_state: &State, value: Value) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        return Ok(Value::from(0));
    }
    let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
    Ok(Value::from(text.split_whitespace().count()))
}

/// Format an RFC 3339 timestamp, e.g. `{{ last_message.timestamp | strftime("%H:%M") }}`
fn filter_strftime(_state: &State, value: Value, format: Value) -> Result<Value, Error> {
    let raw = value.as_str().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidOperation,
            "strftime expects a timestamp string",
        )
    })?;
    let format = format.as_str().unwrap_or("%Y-%m-%d %H:%M:%S");

    let parsed = chrono::DateTime::parse_from_rfc3339(raw).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid timestamp '{}': {}", raw, e),
        )
    })?;
    Ok(Value::from(parsed.format(format).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;
    use minijinja::context;

    fn render(template: &str, ctx: Value) -> String {
        let mut env = Environment::new();
        register_filters(&mut env);
        env.render_str(template, ctx).unwrap()
    }

    #[test]
    fn test_json_filter() {
        let out = render("{{ v | json }}", context! { v => vec![1, 2] });
        assert_eq!(out, "[1,2]");
    }

    #[test]
    fn test_word_count_filter() {
        let out = render("{{ s | word_count }}", context! { s => "good morning to you" });
        assert_eq!(out, "4");
        assert_eq!(render("{{ missing | word_count }}", context! {}), "0");
    }

    #[test]
    fn test_strftime_filter() {
        let out = render(
            "{{ t | strftime('%Y/%m/%d') }}",
            context! { t => "2026-10-18T09:30:00+00:00" },
        );
        assert_eq!(out, "2026/10/18");
    }
}
