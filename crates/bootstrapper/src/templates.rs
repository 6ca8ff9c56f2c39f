//! Rendering of the embedded minijinja templates.

use anyhow::Context;
use minijinja::{AutoEscape, Environment};
use serde::Serialize;

/// Renders `source` with `ctx`. Undefined variables render as empty strings,
/// so templates guard optional values with `{% if %}`.
pub fn render<S: Serialize>(name: &str, source: &str, ctx: S) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.add_template(name, source)
        .with_context(|| format!("invalid template {}", name))?;
    env.get_template(name)
        .with_context(|| format!("template {} not found", name))?
        .render(ctx)
        .with_context(|| format!("rendering template {}", name))
}

#[cfg(test)]
mod test {
    use super::*;
    use minijinja::context;

    #[test]
    fn renders_with_context() {
        let out = render(
            "pause",
            "image: {{ repo }}/pause:{{ tag }}\n{% if extra %}extra\n{% endif %}",
            context! { repo => "k8s.gcr.io", tag => "3.6", extra => false },
        )
        .unwrap();
        assert_eq!(out, "image: k8s.gcr.io/pause:3.6\n");
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(render("broken", "{% if %}", context! {}).is_err());
    }
}
