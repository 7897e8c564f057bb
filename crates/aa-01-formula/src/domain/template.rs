//! # AA Definitions and Message Templates
//!
//! An AA definition carries optional getters and init code plus a message
//! template. Templates are JSON-shaped trees whose leaves may be formulas;
//! substitution turns them into concrete response messages.

use super::ast::Expr;
use serde::{Deserialize, Serialize};
use shared_types::{Address, Amount, Asset, Mci, UnitHash};
use std::collections::BTreeMap;

/// Field name of a message's application.
pub const APP_FIELD: &str = "app";

/// Application name of the state-update message.
pub const STATE_APP: &str = "state";

/// Field holding the state-update formula.
pub const STATE_FIELD: &str = "state";

/// A plain AA definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AaDefinition {
    /// Minimum amounts kept when bouncing, per asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_fees: Option<BTreeMap<Asset, Amount>>,
    /// Documentation link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_url: Option<String>,
    /// Function declarations callable from other AAs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub getters: Option<Expr>,
    /// Statements run before the messages are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Expr>,
    /// Response message template.
    pub messages: Template,
}

/// A stored AA definition: either plain or parameterized over a base AA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AaDefinitionKind {
    /// Self-contained definition.
    Plain(AaDefinition),
    /// Definition borrowed from `base_aa` with `params` exposed to its formulas.
    Parameterized {
        /// AA whose code runs.
        base_aa: Address,
        /// Parameters visible as `params`.
        params: BTreeMap<String, serde_json::Value>,
    },
}

/// An AA definition as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AaDefinitionRecord {
    /// AA address.
    pub address: Address,
    /// The definition.
    pub definition: AaDefinitionKind,
    /// Defining unit.
    pub unit: UnitHash,
    /// MCI at which the definition became stable.
    pub mci: Mci,
}

/// A message template node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum Template {
    /// Constant JSON.
    Literal { value: serde_json::Value },
    /// Formula whose value replaces the node.
    Formula { expr: Expr },
    /// List of templates.
    Array { items: Vec<Template> },
    /// Object, kept only if `cond` holds; `init` runs before its fields.
    Object {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cond: Option<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init: Option<Expr>,
        fields: Vec<TemplateField>,
    },
    /// First case whose condition holds.
    Cases { cases: Vec<Case> },
}

/// One field of an object template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateField {
    /// Field name, constant or computed.
    pub key: TemplateKey,
    /// Field value.
    pub value: Template,
}

/// Name of a template field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKey {
    /// Constant name.
    Literal(String),
    /// Computed name.
    Formula(Expr),
}

/// One alternative of a `cases` template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Condition; a missing condition always matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<Expr>,
    /// Statements run when the case is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Expr>,
    /// Template used when the case is taken.
    pub body: Template,
}

impl Template {
    /// Constant JSON node.
    #[must_use]
    pub fn literal(value: serde_json::Value) -> Self {
        Template::Literal { value }
    }

    /// Formula node.
    #[must_use]
    pub fn formula(expr: Expr) -> Self {
        Template::Formula { expr }
    }

    /// Unconditional object with constant keys.
    #[must_use]
    pub fn object(fields: Vec<(&str, Template)>) -> Self {
        Template::Object {
            cond: None,
            init: None,
            fields: fields
                .into_iter()
                .map(|(k, value)| TemplateField { key: TemplateKey::Literal(k.to_string()), value })
                .collect(),
        }
    }

    /// The `{app: "state", state: ...}` message.
    #[must_use]
    pub fn state_message(statements: Expr) -> Self {
        Template::object(vec![
            (APP_FIELD, Template::literal(serde_json::Value::String(STATE_APP.into()))),
            (STATE_FIELD, Template::formula(statements)),
        ])
    }

    /// The state formula if this is a state message.
    #[must_use]
    pub fn as_state_message(&self) -> Option<Option<&Expr>> {
        let Template::Object { fields, .. } = self else {
            return None;
        };
        let is_state = fields.iter().any(|f| {
            matches!(&f.key, TemplateKey::Literal(k) if k == APP_FIELD)
                && matches!(&f.value, Template::Literal { value } if value.as_str() == Some(STATE_APP))
        });
        if !is_state {
            return None;
        }
        Some(fields.iter().find_map(|f| match (&f.key, &f.value) {
            (TemplateKey::Literal(k), Template::Formula { expr }) if k == STATE_FIELD => Some(expr),
            _ => None,
        }))
    }
}

impl AaDefinition {
    /// Definition with only a message template.
    #[must_use]
    pub fn with_messages(messages: Template) -> Self {
        Self { bounce_fees: None, doc_url: None, getters: None, init: None, messages }
    }

    /// The declared base-asset bounce fee, or `default` if none is declared.
    #[must_use]
    pub fn base_bounce_fee(&self, default: Amount) -> Amount {
        self.bounce_fees
            .as_ref()
            .and_then(|fees| fees.get(&Asset::base()).copied())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_message_detection() {
        let t = Template::state_message(Expr::statements(vec![]));
        assert_eq!(t.as_state_message(), Some(Some(&Expr::statements(vec![]))));

        let payment = Template::object(vec![("app", Template::literal(json!("payment")))]);
        assert_eq!(payment.as_state_message(), None);
    }

    #[test]
    fn test_definition_roundtrips_through_json() {
        let def = AaDefinitionKind::Plain(AaDefinition::with_messages(Template::Array { items: vec![] }));
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["kind"], "plain");
        let back: AaDefinitionKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn test_base_bounce_fee_default() {
        let def = AaDefinition::with_messages(Template::Array { items: vec![] });
        assert_eq!(def.base_bounce_fee(10_000), 10_000);
    }
}
