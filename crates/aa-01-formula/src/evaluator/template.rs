//! Message template substitution.

use super::{Evaluator, Interrupt};
use crate::domain::ast::Expr;
use crate::domain::template::{Template, TemplateKey};
use crate::domain::value::Value;
use crate::errors::EvalError;
use crate::ports::outbound::LedgerReader;
use futures::future::{BoxFuture, FutureExt};

/// Concrete messages produced from a template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Substitution {
    /// Messages in template order, the state message excluded.
    pub messages: Vec<serde_json::Value>,
    /// Statements of the state message, run after the response unit is composed.
    pub state: Option<Expr>,
}

impl<L: LedgerReader + ?Sized> Evaluator<'_, L> {
    /// Substitutes every formula of `template`.
    ///
    /// Nodes whose formula yields `""`, objects whose `if` fails and `cases`
    /// with no matching case are dropped.
    ///
    /// # Errors
    ///
    /// Returns the bounce reason or runtime failure of the first failing
    /// formula, or a structural error when the messages are not a list or
    /// carry more than one state message.
    pub async fn substitute_messages(&mut self, template: &Template) -> Result<Substitution, EvalError> {
        let mut state = None;
        let result = match self.substitute(template, &mut state).await {
            Ok(v) => v,
            Err(Interrupt::Return(_)) => return Err(EvalError::failed("return outside a function")),
            Err(Interrupt::Error(e)) => return Err(e),
        };
        let messages = match result {
            Some(serde_json::Value::Array(items)) => items,
            Some(_) => return Err(EvalError::failed("messages must be a list")),
            None => Vec::new(),
        };
        Ok(Substitution { messages, state })
    }

    async fn run_init(&mut self, init: Option<&Expr>) -> Result<(), Interrupt> {
        if let Some(init) = init {
            self.eval(init).await?;
        }
        Ok(())
    }

    async fn holds(&mut self, cond: Option<&Expr>) -> Result<bool, Interrupt> {
        match cond {
            Some(cond) => Ok(self.eval(cond).await?.is_truthy()),
            None => Ok(true),
        }
    }

    fn substitute<'b>(
        &'b mut self,
        template: &'b Template,
        state: &'b mut Option<Expr>,
    ) -> BoxFuture<'b, Result<Option<serde_json::Value>, Interrupt>> {
        async move {
            match template {
                Template::Literal { value } => Ok(Some(value.clone())),
                Template::Formula { expr } => {
                    let v: Value = self.eval(expr).await?;
                    Ok(match v {
                        Value::Str(s) if s.is_empty() => None,
                        v => Some(v.to_json()),
                    })
                }
                Template::Array { items } => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        if let Some(v) = self.substitute(item, state).await? {
                            out.push(v);
                        }
                    }
                    Ok(Some(serde_json::Value::Array(out)))
                }
                Template::Object { cond, init, fields } => {
                    if !self.holds(cond.as_ref()).await? {
                        return Ok(None);
                    }
                    self.run_init(init.as_ref()).await?;
                    if let Some(statements) = template.as_state_message() {
                        if state.is_some() {
                            return Err(EvalError::failed("more than one state message").into());
                        }
                        *state = Some(statements.cloned().unwrap_or_else(|| Expr::statements(vec![])));
                        return Ok(None);
                    }
                    let mut map = serde_json::Map::new();
                    for field in fields {
                        let key = match &field.key {
                            TemplateKey::Literal(k) => k.clone(),
                            TemplateKey::Formula(e) => self.eval(e).await?.to_text(),
                        };
                        if key.is_empty() {
                            continue;
                        }
                        if let Some(v) = self.substitute(&field.value, state).await? {
                            map.insert(key, v);
                        }
                    }
                    Ok(Some(serde_json::Value::Object(map)))
                }
                Template::Cases { cases } => {
                    for case in cases {
                        if self.holds(case.cond.as_ref()).await? {
                            self.run_init(case.init.as_ref()).await?;
                            return self.substitute(&case.body, state).await;
                        }
                    }
                    Ok(None)
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_ledger::InMemoryLedgerReader;
    use crate::config::AaConfig;
    use crate::domain::ast::{CmpOp, TriggerField};
    use crate::domain::template::Case;
    use crate::evaluator::tests::{context, invocation};
    use crate::evaluator::EvalMode;
    use serde_json::json;

    async fn substitute(template: &Template) -> Result<Substitution, EvalError> {
        let ledger = InMemoryLedgerReader::default();
        let config = AaConfig::default();
        let mut state = context();
        let mut inv = invocation();
        let mut ev = Evaluator::new(&ledger, &config, &mut state, &mut inv, EvalMode::default());
        ev.substitute_messages(template).await
    }

    fn payment(amount: Expr) -> Template {
        Template::object(vec![
            ("app", Template::literal(json!("payment"))),
            (
                "payload",
                Template::object(vec![(
                    "outputs",
                    Template::Array {
                        items: vec![Template::object(vec![
                            ("address", Template::formula(Expr::Trigger { field: TriggerField::Address })),
                            ("amount", Template::formula(amount)),
                        ])],
                    },
                )]),
            ),
        ])
    }

    #[tokio::test]
    async fn test_formulas_are_replaced() {
        let t = Template::Array { items: vec![payment(Expr::num(1000))] };
        let s = substitute(&t).await.unwrap();
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0]["payload"]["outputs"][0]["amount"], json!(1000));
        assert_eq!(s.state, None);
    }

    #[tokio::test]
    async fn test_empty_string_drops_the_node() {
        let t = Template::Array {
            items: vec![Template::object(vec![
                ("app", Template::literal(json!("data"))),
                ("note", Template::formula(Expr::str(""))),
            ])],
        };
        let s = substitute(&t).await.unwrap();
        assert_eq!(s.messages, vec![json!({"app": "data"})]);
    }

    #[tokio::test]
    async fn test_false_condition_drops_the_message() {
        let conditional = Template::Object {
            cond: Some(Expr::compare(CmpOp::Gt, Expr::num(1), Expr::num(2))),
            init: None,
            fields: vec![],
        };
        let t = Template::Array { items: vec![conditional, payment(Expr::num(5))] };
        let s = substitute(&t).await.unwrap();
        assert_eq!(s.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_cases_take_first_match() {
        let t = Template::Array {
            items: vec![Template::Cases {
                cases: vec![
                    Case { cond: Some(Expr::boolean(false)), init: None, body: Template::literal(json!("a")) },
                    Case { cond: Some(Expr::boolean(true)), init: None, body: Template::literal(json!("b")) },
                    Case { cond: None, init: None, body: Template::literal(json!("c")) },
                ],
            }],
        };
        assert_eq!(substitute(&t).await.unwrap().messages, vec![json!("b")]);
    }

    #[tokio::test]
    async fn test_state_message_is_extracted() {
        let statements = Expr::statements(vec![Expr::Log { args: vec![Expr::str("x")] }]);
        let t = Template::Array { items: vec![payment(Expr::num(1)), Template::state_message(statements.clone())] };
        let s = substitute(&t).await.unwrap();
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.state, Some(statements));

        let twice = Template::Array {
            items: vec![Template::state_message(Expr::statements(vec![])), Template::state_message(Expr::statements(vec![]))],
        };
        assert!(substitute(&twice).await.is_err());
    }

    #[tokio::test]
    async fn test_bounce_inside_template() {
        let t = Template::Array { items: vec![payment(Expr::Bounce { message: Box::new(Expr::str("no")) })] };
        assert!(matches!(substitute(&t).await, Err(EvalError::Bounce(m)) if m == "no"));
    }
}
