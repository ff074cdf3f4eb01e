//! Step condition predicates.
//!
//! Conditions are opaque strings; what they mean is up to the injected
//! [`ConditionEvaluator`]. An evaluation error is distinct from `false`:
//! the step executor fails the step instead of skipping it.

use anyhow::bail;
use std::collections::BTreeMap;

/// What a condition can see when it is evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionContext {
    /// Pipeline name.
    pub pipeline: String,
    /// Run id.
    pub run_id: String,
    /// Step whose condition is being evaluated.
    pub step: String,
    /// Extra variables supplied by the caller.
    pub vars: BTreeMap<String, String>,
}

impl ConditionContext {
    /// Creates a context for one step.
    #[must_use]
    pub fn new(pipeline: &str, run_id: &str, step: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            run_id: run_id.to_string(),
            step: step.to_string(),
            vars: BTreeMap::new(),
        }
    }
}

/// A pluggable boolean predicate.
#[cfg_attr(test, mockall::automock)]
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluates `expression`.
    ///
    /// # Errors
    ///
    /// Returns an error when the expression cannot be evaluated.
    fn evaluate(&self, expression: &str, context: &ConditionContext) -> anyhow::Result<bool>;
}

/// Evaluates boolean literals with optional negation.
///
/// Accepts `true/false`, `yes/no`, `on/off` and `1/0` in any case, prefixed
/// by any number of `!` or `not `. Anything else is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralConditionEvaluator;

impl LiteralConditionEvaluator {
    /// Creates the evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ConditionEvaluator for LiteralConditionEvaluator {
    fn evaluate(&self, expression: &str, _context: &ConditionContext) -> anyhow::Result<bool> {
        let mut expr = expression.trim();
        let mut negate = false;
        loop {
            if let Some(rest) = expr.strip_prefix('!') {
                negate = !negate;
                expr = rest.trim_start();
            } else if expr.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("not ")) {
                negate = !negate;
                expr = expr[4..].trim_start();
            } else {
                break;
            }
        }

        let value = match expr.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => true,
            "false" | "no" | "off" | "0" => false,
            _ => bail!("cannot evaluate condition '{expression}'"),
        };
        Ok(value != negate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> anyhow::Result<bool> {
        LiteralConditionEvaluator::new().evaluate(expr, &ConditionContext::default())
    }

    #[test]
    fn test_literals() {
        assert!(eval("true").unwrap());
        assert!(eval(" YES ").unwrap());
        assert!(eval("1").unwrap());
        assert!(!eval("false").unwrap());
        assert!(!eval("Off").unwrap());
        assert!(!eval("0").unwrap());
    }

    #[test]
    fn test_negation() {
        assert!(!eval("!true").unwrap());
        assert!(eval("not false").unwrap());
        assert!(eval("!!yes").unwrap());
        assert!(!eval("NOT on").unwrap());
    }

    #[test]
    fn test_unknown_expressions_are_errors() {
        assert!(eval("").is_err());
        assert!(eval("x > 3").is_err());
        assert!(eval("!").is_err());
        assert!(eval("nothing").is_err());
    }

    #[test]
    fn test_mock_evaluator_sees_context() {
        let mut mock = MockConditionEvaluator::new();
        mock.expect_evaluate()
            .withf(|expr, ctx| expr == "deploy_enabled" && ctx.step == "publish")
            .times(1)
            .returning(|_, _| Ok(false));

        let ctx = ConditionContext::new("deploy", "r1", "publish");
        assert!(!mock.evaluate("deploy_enabled", &ctx).unwrap());
    }
}
