//! Template engine for rendering response templates

use super::context::TemplateContext;
use super::errors::{TemplateError, extract_undefined_name};
use super::filters;
use minijinja::Environment;

/// Template rendering engine
///
/// Wraps minijinja with custom filters and strict undefined handling.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        filters::register_filters(&mut env);
        Self { env }
    }

    /// Render a template string with the given context
    ///
    /// ```ignore
    /// let engine = TemplateEngine::new();
    /// let ctx = TemplateContext::from_state(&state);
    /// let reply = engine.render("You said: {{ last_message.content }}", &ctx)?;
    /// ```
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
        let mut env = self.env.clone();
        env.add_template_owned("__render__", template.to_string())
            .map_err(|e| TemplateError::syntax(e.to_string(), e.line().unwrap_or(0)))?;

        let tmpl = env.get_template("__render__")?;

        tmpl.render(ctx.to_value())
            .map_err(|e| convert_minijinja_error(e, ctx))
    }

    /// Check if a template is syntactically valid
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        let mut env = self.env.clone();
        env.add_template_owned("__validate__", template.to_string())
            .map_err(|e| TemplateError::syntax(e.to_string(), e.line().unwrap_or(0)))?;
        Ok(())
    }
}

fn convert_minijinja_error(err: minijinja::Error, ctx: &TemplateContext) -> TemplateError {
    let msg = err.to_string();
    if msg.contains("undefined") {
        let name = extract_undefined_name(&msg);
        return TemplateError::undefined_variable(name, &ctx.known_variables());
    }
    TemplateError::Internal(err)
}
