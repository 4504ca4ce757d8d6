// SPDX-License-Identifier: MIT OR Apache-2.0
//! The boolean DSL evaluated by `if`-typed Steps (§4.2, §9).
//!
//! `rumi_core::Step` carries no `then`/`else` fields — it is a shared,
//! stable data model with no knowledge of this dispatch-level DSL — so an
//! `if` Step's `cond`/`then`/`else` are encoded inside its existing
//! `input: serde_json::Value` and parsed here via [`IfInput`].

use rumi_core::Step;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::substitution::{resolve_path, substitute_value};

/// A boolean expression over the Flow execution context. Deliberately
/// narrow: equality, existence, and AND/OR/NOT — no arbitrary expression
/// evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CondExpr {
    /// `true` if `left` and `right`, each substituted against `ctx`, are
    /// equal JSON values.
    Eq {
        /// Left-hand operand, substituted before comparison.
        left: Value,
        /// Right-hand operand, substituted before comparison.
        right: Value,
    },
    /// `true` if the dotted `path` resolves to a non-null value in `ctx`.
    Exists {
        /// Dotted path, same grammar as a `${ctx.path}` placeholder's body.
        path: String,
    },
    /// `true` if every nested expression is `true`.
    And {
        /// Conjuncts.
        of: Vec<CondExpr>,
    },
    /// `true` if any nested expression is `true`.
    Or {
        /// Disjuncts.
        of: Vec<CondExpr>,
    },
    /// `true` if the nested expression is `false`.
    Not {
        /// Expression to negate.
        of: Box<CondExpr>,
    },
}

impl CondExpr {
    /// Evaluate this expression against `ctx`.
    pub fn eval(&self, ctx: &Value) -> bool {
        match self {
            CondExpr::Eq { left, right } => {
                substitute_value(left, ctx) == substitute_value(right, ctx)
            }
            CondExpr::Exists { path } => !resolve_path(ctx, path).is_null(),
            CondExpr::And { of } => of.iter().all(|c| c.eval(ctx)),
            CondExpr::Or { of } => of.iter().any(|c| c.eval(ctx)),
            CondExpr::Not { of } => !of.eval(ctx),
        }
    }
}

/// The parsed shape of an `if`-typed Step's `input` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfInput {
    /// Condition deciding which branch runs.
    pub cond: CondExpr,
    /// Steps to run when `cond` evaluates `true`.
    #[serde(default)]
    pub then: Vec<Step>,
    /// Steps to run when `cond` evaluates `false`.
    #[serde(default, rename = "else")]
    pub else_: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({"inputs": {"mode": "prod"}})
    }

    #[test]
    fn eq_substitutes_both_sides() {
        let expr = CondExpr::Eq { left: json!("${inputs.mode}"), right: json!("prod") };
        assert!(expr.eval(&ctx()));
        let expr = CondExpr::Eq { left: json!("${inputs.mode}"), right: json!("dev") };
        assert!(!expr.eval(&ctx()));
    }

    #[test]
    fn exists_checks_non_null() {
        assert!(CondExpr::Exists { path: "inputs.mode".into() }.eval(&ctx()));
        assert!(!CondExpr::Exists { path: "inputs.missing".into() }.eval(&ctx()));
    }

    #[test]
    fn and_or_not_compose() {
        let a = CondExpr::Exists { path: "inputs.mode".into() };
        let b = CondExpr::Eq { left: json!("${inputs.mode}"), right: json!("prod") };
        let and = CondExpr::And { of: vec![a.clone(), b.clone()] };
        assert!(and.eval(&ctx()));
        let not_b = CondExpr::Not { of: Box::new(b) };
        assert!(!not_b.eval(&ctx()));
        let or = CondExpr::Or { of: vec![not_b, a] };
        assert!(or.eval(&ctx()));
    }

    #[test]
    fn if_input_parses_from_json_with_then_else() {
        let raw = json!({
            "cond": {"op": "eq", "left": "${inputs.mode}", "right": "prod"},
            "then": [{"id": "t1", "phase": "p", "type": "set", "input": "yes", "output": "result"}],
            "else": [{"id": "e1", "phase": "p", "type": "set", "input": "no", "output": "result"}],
        });
        let parsed: IfInput = serde_json::from_value(raw).unwrap();
        assert!(parsed.cond.eval(&ctx()));
        assert_eq!(parsed.then.len(), 1);
        assert_eq!(parsed.else_.len(), 1);
    }
}
