//! Expression evaluation for edge conditions
//!
//! Evaluates expressions like `pending_tasks > 0 and status == 'running'`
//! against a template context.

use super::context::TemplateContext;
use super::errors::{TemplateError, extract_undefined_name};
use minijinja::Environment;

fn expression_env() -> Environment<'static> {
    let mut env = Environment::new();
    super::filters::register_filters(&mut env);
    env
}

/// Evaluate a conditional expression against a context
///
/// Supports:
/// - Variable access: `metadata.decision`, `last_message.role`
/// - Comparison: `==`, `!=`, `>`, `<`
/// - Boolean: `and`, `or`, `not`
/// - Filters: `task_queue | length > 0`
///
/// Missing attributes are undefined and compare false.
pub fn evaluate_condition(expr: &str, ctx: &TemplateContext) -> Result<bool, TemplateError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(true);
    }

    let env = expression_env();
    let compiled = env
        .compile_expression(expr)
        .map_err(|e| TemplateError::expression(format!("invalid expression syntax: {}", e)))?;

    let value = compiled.eval(ctx.to_value()).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("undefined") {
            TemplateError::undefined_variable(extract_undefined_name(&msg), &ctx.known_variables())
        } else {
            TemplateError::expression(msg)
        }
    })?;

    Ok(value.is_true())
}

/// Check that an expression parses
pub fn validate_expression(expr: &str) -> Result<(), TemplateError> {
    let env = expression_env();
    env.compile_expression(expr.trim())
        .map(|_| ())
        .map_err(|e| TemplateError::expression(format!("invalid expression syntax: {}", e)))
}
