//! Calculator skill — evaluates arithmetic expressions.
//!
//! Shunting-yard over `+`, `-`, `*`, `/`, parentheses, and unary negation.
//! Kept deliberately tiny; anything fancier belongs in an external tool.

use async_trait::async_trait;

use toolmesh_core::error::ToolError;
use toolmesh_core::tool::{Callable, ToolResult};

pub struct CalcSkill;

#[async_trait]
impl Callable for CalcSkill {
    fn name(&self) -> &str {
        "calc"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports +, -, *, /, parentheses, and decimals."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The expression to evaluate, e.g. '(2 + 3) * 4'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let expr = arguments["expression"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'expression' argument".into()))?;

        match evaluate(expr) {
            Ok(value) => {
                let formatted = if value.fract() == 0.0 && value.abs() < 1e15 {
                    format!("{}", value as i64)
                } else {
                    format!("{value}")
                };
                Ok(ToolResult::ok("", formatted)
                    .with_data(serde_json::json!({"result": value})))
            }
            Err(e) => Ok(ToolResult::error("", format!("Error: {e}"))),
        }
    }
}

/// Evaluate an arithmetic expression string.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    let mut output: Vec<f64> = Vec::new();
    let mut ops: Vec<char> = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    // True wherever a '-' would be unary: at the start, after '(' or an operator.
    let mut expect_operand = true;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num: f64 = text.parse().map_err(|_| format!("invalid number '{text}'"))?;
                output.push(num);
                expect_operand = false;
            }
            '(' => {
                ops.push(c);
                expect_operand = true;
                i += 1;
            }
            ')' => {
                loop {
                    match ops.pop() {
                        Some('(') => break,
                        Some(op) => apply(&mut output, op)?,
                        None => return Err("unbalanced parentheses".into()),
                    }
                }
                expect_operand = false;
                i += 1;
            }
            '-' if expect_operand => {
                // Unary minus: fold into the operand as `0 - x` with the
                // precedence of multiplication so `-2 * 3` works out.
                output.push(0.0);
                ops.push('~');
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                while let Some(&top) = ops.last() {
                    if top == '(' || precedence(top) < precedence(c) {
                        break;
                    }
                    ops.pop();
                    apply(&mut output, top)?;
                }
                ops.push(c);
                expect_operand = true;
                i += 1;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    while let Some(op) = ops.pop() {
        if op == '(' {
            return Err("unbalanced parentheses".into());
        }
        apply(&mut output, op)?;
    }

    match output.as_slice() {
        [value] => Ok(*value),
        [] => Err("empty expression".into()),
        _ => Err("malformed expression".into()),
    }
}

fn precedence(op: char) -> u8 {
    match op {
        '+' | '-' => 1,
        '*' | '/' => 2,
        '~' => 3,
        _ => 0,
    }
}

fn apply(output: &mut Vec<f64>, op: char) -> Result<(), String> {
    let rhs = output.pop().ok_or("malformed expression")?;
    let lhs = output.pop().ok_or("malformed expression")?;
    let value = match op {
        '+' => lhs + rhs,
        '-' | '~' => lhs - rhs,
        '*' => lhs * rhs,
        '/' => {
            if rhs == 0.0 {
                return Err("division by zero".into());
            }
            lhs / rhs
        }
        _ => return Err(format!("unknown operator '{op}'")),
    };
    output.push(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_respected() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
    }

    #[test]
    fn parentheses_override() {
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
    }

    #[test]
    fn unary_negation() {
        assert_eq!(evaluate("-5 + 3").unwrap(), -2.0);
        assert_eq!(evaluate("-2 * 3").unwrap(), -6.0);
        assert_eq!(evaluate("2 * -3").unwrap(), -6.0);
    }

    #[test]
    fn division_by_zero_rejected() {
        assert!(evaluate("1 / 0").is_err());
    }

    #[test]
    fn unbalanced_parens_rejected() {
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("1 + 2)").is_err());
    }

    #[test]
    fn empty_and_trailing_rejected() {
        assert!(evaluate("").is_err());
        assert!(evaluate("2 +").is_err());
    }

    #[test]
    fn decimals() {
        assert!((evaluate("3.5 * 2").unwrap() - 7.0).abs() < 1e-10);
    }

    #[tokio::test]
    async fn skill_formats_integers() {
        let result = CalcSkill
            .invoke(serde_json::json!({"expression": "10 / 2"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "5");
    }

    #[tokio::test]
    async fn skill_reports_business_error() {
        let result = CalcSkill
            .invoke(serde_json::json!({"expression": "1 / 0"}))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.output.contains("division by zero"));
    }

    #[tokio::test]
    async fn skill_missing_argument() {
        let err = CalcSkill.invoke(serde_json::json!({})).await;
        assert!(err.is_err());
    }
}
