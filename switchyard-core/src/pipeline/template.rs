//! Prompt interpolation and condition evaluation.
//!
//! The grammar has two tokens: `{{name}}` substitutes a variable, and
//! `{{#if name}}...{{/if}}` keeps its body only when `name` is truthy. Blocks
//! may nest. Literal braces cannot be escaped.

use crate::error::TemplateError;
use crate::pipeline::types::{Condition, ConditionOperator, ExecutionContext};
use std::collections::HashSet;

/// Variables available to a template, plus the names allowed to be absent.
pub struct TemplateContext<'a> {
    values: &'a ExecutionContext,
    optional: HashSet<&'a str>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(values: &'a ExecutionContext) -> Self {
        Self {
            values,
            optional: HashSet::new(),
        }
    }

    /// Absent optional names render as the empty string instead of failing.
    pub fn with_optional(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.optional.extend(names);
        self
    }

    fn lookup(&self, name: &str) -> Result<&str, TemplateError> {
        match self.values.get(name) {
            Some(value) => Ok(value),
            None if self.optional.contains(name) => Ok(""),
            None => Err(TemplateError::Undefined {
                name: name.to_string(),
            }),
        }
    }

    fn truthy(&self, name: &str) -> bool {
        self.values.get(name).is_some_and(is_truthy)
    }
}

/// Non-empty and not `false`.
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !value.eq_ignore_ascii_case("false")
}

#[derive(Debug)]
enum Node<'t> {
    Text(&'t str),
    Var(&'t str),
    If { name: &'t str, body: Vec<Node<'t>> },
}

enum Tag<'t> {
    Var(&'t str),
    Open(&'t str),
    Close,
}

fn syntax(message: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        message: message.into(),
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn classify(expr: &str) -> Result<Tag<'_>, TemplateError> {
    let expr = expr.trim();
    if expr == "/if" {
        return Ok(Tag::Close);
    }
    if let Some(rest) = expr.strip_prefix("#if") {
        let name = rest.trim();
        if rest.starts_with(char::is_whitespace) && valid_name(name) {
            return Ok(Tag::Open(name));
        }
        return Err(syntax(format!("malformed block tag '{{{{{expr}}}}}'")));
    }
    if valid_name(expr) {
        Ok(Tag::Var(expr))
    } else {
        Err(syntax(format!("invalid placeholder '{{{{{expr}}}}}'")))
    }
}

fn parse(template: &str) -> Result<Vec<Node<'_>>, TemplateError> {
    // Each frame holds the open block name and the nodes collected so far.
    let mut stack: Vec<(Option<&str>, Vec<Node<'_>>)> = vec![(None, Vec::new())];
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let frame = &mut stack.last_mut().ok_or_else(|| syntax("unbalanced blocks"))?.1;
        if start > 0 {
            frame.push(Node::Text(&rest[..start]));
        }
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or_else(|| syntax("unclosed '{{' in template"))?;
        match classify(&after_open[..end])? {
            Tag::Var(name) => frame.push(Node::Var(name)),
            Tag::Open(name) => stack.push((Some(name), Vec::new())),
            Tag::Close => {
                let (name, body) = stack
                    .pop()
                    .ok_or_else(|| syntax("unbalanced blocks"))?;
                let Some(name) = name else {
                    return Err(syntax("'{{/if}}' without matching '{{#if}}'"));
                };
                stack
                    .last_mut()
                    .ok_or_else(|| syntax("unbalanced blocks"))?
                    .1
                    .push(Node::If { name, body });
            }
        }
        rest = &after_open[end + 2..];
    }

    let frame = &mut stack.last_mut().ok_or_else(|| syntax("unbalanced blocks"))?.1;
    if !rest.is_empty() {
        frame.push(Node::Text(rest));
    }
    match stack.pop() {
        Some((None, nodes)) if stack.is_empty() => Ok(nodes),
        Some((Some(name), _)) => Err(syntax(format!("unclosed '{{{{#if {name}}}}}' block"))),
        _ => Err(syntax("unbalanced blocks")),
    }
}

fn render(nodes: &[Node<'_>], ctx: &TemplateContext<'_>, out: &mut String) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var(name) => out.push_str(ctx.lookup(name)?),
            Node::If { name, body } => {
                if ctx.truthy(name) {
                    render(body, ctx, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Interpolate `template` against `ctx`.
///
/// Placeholders inside a falsy `{{#if}}` block are never resolved, so they
/// cannot fail the render.
pub fn interpolate(template: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }
    let nodes = parse(template)?;
    let mut out = String::with_capacity(template.len());
    render(&nodes, ctx, &mut out)?;
    Ok(out)
}

/// Every variable name referenced by `template`, in first-use order.
pub fn extract_references(template: &str) -> Result<Vec<String>, TemplateError> {
    fn walk(nodes: &[Node<'_>], seen: &mut Vec<String>) {
        for node in nodes {
            let name = match node {
                Node::Text(_) => continue,
                Node::Var(name) => name,
                Node::If { name, body } => {
                    if !seen.iter().any(|s| s == name) {
                        seen.push(name.to_string());
                    }
                    walk(body, seen);
                    continue;
                }
            };
            if !seen.iter().any(|s| s == name) {
                seen.push(name.to_string());
            }
        }
    }

    let mut seen = Vec::new();
    walk(&parse(template)?, &mut seen);
    Ok(seen)
}

/// Whether `template` substitutes `name` anywhere (outside block tags).
pub fn substitutes(template: &str, name: &str) -> bool {
    fn walk(nodes: &[Node<'_>], name: &str) -> bool {
        nodes.iter().any(|node| match node {
            Node::Var(n) => *n == name,
            Node::If { body, .. } => walk(body, name),
            Node::Text(_) => false,
        })
    }
    parse(template).is_ok_and(|nodes| walk(&nodes, name))
}

/// Evaluate a condition's operator against the checked variable's value.
///
/// `equals` and `not_equals` ignore surrounding whitespace, since model
/// output routinely ends with a newline.
pub fn evaluate_condition(condition: &Condition, value: &str) -> bool {
    let expected = condition.value.as_deref().unwrap_or_default();
    match condition.operator {
        ConditionOperator::Contains => value.contains(expected),
        ConditionOperator::Empty => value.is_empty(),
        ConditionOperator::NotEmpty => !value.is_empty(),
        ConditionOperator::Equals => value.trim() == expected.trim(),
        ConditionOperator::NotEquals => value.trim() != expected.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ConditionAction;
    use pretty_assertions::assert_eq;

    fn ctx(pairs: &[(&str, &str)]) -> ExecutionContext {
        pairs.iter().copied().collect()
    }

    fn condition(operator: ConditionOperator, value: Option<&str>) -> Condition {
        Condition {
            check: "$x".into(),
            operator,
            value: value.map(str::to_string),
            action: ConditionAction::Continue,
            skip_to: None,
        }
    }

    #[test]
    fn test_plain_text_unchanged() {
        let values = ctx(&[]);
        let text = "Summarize this } please {";
        assert_eq!(interpolate(text, &TemplateContext::new(&values)).unwrap(), text);
    }

    #[test]
    fn test_substitution() {
        let values = ctx(&[("language", "French"), ("tone", "formal")]);
        let out = interpolate(
            "Translate to {{language}} in a {{ tone }} tone.",
            &TemplateContext::new(&values),
        )
        .unwrap();
        assert_eq!(out, "Translate to French in a formal tone.");
    }

    #[test]
    fn test_missing_required_fails() {
        let values = ctx(&[]);
        let err = interpolate("Hi {{name}}", &TemplateContext::new(&values)).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Undefined {
                name: "name".into()
            }
        );
    }

    #[test]
    fn test_missing_optional_is_empty() {
        let values = ctx(&[]);
        let template = TemplateContext::new(&values).with_optional(["notes"]);
        assert_eq!(interpolate("[{{notes}}]", &template).unwrap(), "[]");
    }

    #[test]
    fn test_if_block() {
        let template = "Summarize.{{#if focus}} Focus on {{focus}}.{{/if}}";
        let with = ctx(&[("focus", "risks")]);
        assert_eq!(
            interpolate(template, &TemplateContext::new(&with)).unwrap(),
            "Summarize. Focus on risks."
        );
        let without = ctx(&[]);
        assert_eq!(
            interpolate(template, &TemplateContext::new(&without)).unwrap(),
            "Summarize."
        );
        let falsy = ctx(&[("focus", "false")]);
        assert_eq!(
            interpolate(template, &TemplateContext::new(&falsy)).unwrap(),
            "Summarize."
        );
    }

    #[test]
    fn test_nested_blocks() {
        let values = ctx(&[("a", "1"), ("b", "")]);
        let out = interpolate(
            "{{#if a}}A{{#if b}}B{{/if}}{{/if}}!",
            &TemplateContext::new(&values),
        )
        .unwrap();
        assert_eq!(out, "A!");
    }

    #[test]
    fn test_syntax_errors() {
        let values = ctx(&[("a", "1")]);
        let t = TemplateContext::new(&values);
        for bad in ["{{a", "{{#if a}}x", "x{{/if}}", "{{#ifa}}{{/if}}", "{{}}", "{{a b}}"] {
            assert!(
                matches!(interpolate(bad, &t), Err(TemplateError::Syntax { .. })),
                "expected syntax error for {bad:?}"
            );
        }
    }

    #[test]
    fn test_extract_references() {
        let refs =
            extract_references("{{a}} {{#if b}}{{c}} {{a}}{{/if}}").unwrap();
        assert_eq!(refs, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_substitutes() {
        assert!(substitutes("Translate: {{text}}", "text"));
        assert!(!substitutes("{{#if text}}yes{{/if}}", "text"));
        assert!(!substitutes("no placeholders", "text"));
    }

    #[test]
    fn test_condition_operators() {
        assert!(evaluate_condition(&condition(ConditionOperator::Empty, None), ""));
        assert!(!evaluate_condition(&condition(ConditionOperator::Empty, None), "x"));
        assert!(evaluate_condition(&condition(ConditionOperator::NotEmpty, None), "x"));
        assert!(evaluate_condition(
            &condition(ConditionOperator::Contains, Some("ell")),
            "hello"
        ));
        assert!(!evaluate_condition(
            &condition(ConditionOperator::Contains, Some("xyz")),
            "hello"
        ));
        assert!(evaluate_condition(
            &condition(ConditionOperator::Equals, Some("LONG")),
            "LONG\n"
        ));
        assert!(evaluate_condition(
            &condition(ConditionOperator::NotEquals, Some("LONG")),
            "SHORT"
        ));
    }
}
