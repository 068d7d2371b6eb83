//! Rendered agent instructions for build and test sessions.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

const BUILD_TEMPLATE: &str = include_str!("instructions/build.md");
const TEST_TEMPLATE: &str = include_str!("instructions/test.md");

fn engine() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_template("build", BUILD_TEMPLATE)
        .expect("build template should be valid");
    env.add_template("test", TEST_TEMPLATE)
        .expect("test template should be valid");
    env
}

/// Instructions for a build session: prepare the checkout until its test
/// suite runs.
pub fn build_instructions() -> Result<String> {
    let env = engine();
    let template = env.get_template("build").context("get build template")?;
    template.render(context! {}).context("render build instructions")
}

/// Instructions for a test session: generate tests for one `target`
/// (`path:symbol` or a plain file path).
pub fn test_instructions(target: &str) -> Result<String> {
    let env = engine();
    let template = env.get_template("test").context("get test template")?;
    template
        .render(context! { target => target })
        .context("render test instructions")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_instructions_render() {
        let text = build_instructions().expect("render");
        assert!(text.contains("stager prepare"));
        assert!(text.contains("plan.json"));
    }

    #[test]
    fn test_instructions_embed_target() {
        let text = test_instructions("src/util.c:parse_time").expect("render");
        assert!(text.contains("src/util.c:parse_time"));
        assert!(text.contains("stager run-tests"));
    }
}
