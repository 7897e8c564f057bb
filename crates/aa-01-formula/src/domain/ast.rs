//! # Formula Syntax Tree
//!
//! Formulas reach this crate already parsed. The tree is plain data: it can
//! be deserialized from JSON, cached, validated once and evaluated many times.

use super::decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An expression or statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expr {
    // ===== Literals =====
    /// Decimal literal.
    Number { value: Decimal },
    /// String literal.
    Str { value: String },
    /// Boolean literal.
    Bool { value: bool },
    /// Array literal.
    Array { items: Vec<Expr> },
    /// Dictionary literal.
    Dictionary { entries: Vec<(String, Expr)> },
    /// π
    Pi,
    /// e
    E,

    // ===== Operators =====
    /// Binary arithmetic.
    Arith { op: ArithOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// Unary minus.
    Negate { expr: Box<Expr> },
    /// String or object concatenation (`||`).
    Concat { lhs: Box<Expr>, rhs: Box<Expr> },
    /// Comparison.
    Compare { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// Short-circuit conjunction.
    And { args: Vec<Expr> },
    /// Short-circuit disjunction.
    Or { args: Vec<Expr> },
    /// Negation.
    Not { expr: Box<Expr> },
    /// `cond ? if_true : if_false`
    Ternary { cond: Box<Expr>, if_true: Box<Expr>, if_false: Box<Expr> },
    /// `value otherwise fallback`
    Otherwise { value: Box<Expr>, fallback: Box<Expr> },
    /// One-argument math function.
    Math { func: MathFunc, arg: Box<Expr> },
    /// `round`, `ceil`, `floor` with optional decimal places.
    Rounding { func: RoundFunc, arg: Box<Expr>, places: Option<Box<Expr>> },
    /// `min` / `max`
    MinMax { func: MinMaxFunc, args: Vec<Expr> },
    /// `hypot(a, b)`
    Hypot { a: Box<Expr>, b: Box<Expr> },

    // ===== Variables =====
    /// Read of a local variable, optionally drilling into it.
    LocalVar { name: String, selectors: Vec<Expr> },
    /// Assignment to a local variable or to a path inside it.
    Assign { name: String, selectors: Vec<Selector>, value: Box<Expr> },
    /// `freeze($name)`
    Freeze { name: String },
    /// `delete($name[path], key)`
    Delete { name: String, selectors: Vec<Expr>, key: Box<Expr> },
    /// Read of a state variable of this or another AA.
    StateVar { address: Option<Box<Expr>>, name: Box<Expr> },
    /// Write of a state variable of this AA.
    StateVarAssign { name: Box<Expr>, op: AssignOp, value: Box<Expr> },
    /// Write of a response variable.
    ResponseVarAssign { name: Box<Expr>, value: Box<Expr> },
    /// Selector chain applied to any expression.
    WithSelectors { expr: Box<Expr>, selectors: Vec<Expr> },

    // ===== Trigger and context =====
    /// A field of the trigger.
    Trigger { field: TriggerField },
    /// Amount of `asset` the trigger sent to this AA.
    TriggerOutput { asset: Box<Expr> },
    /// A field of the execution context.
    Context { field: ContextField },

    // ===== Ledger lookups =====
    /// `data_feed[[...]]`
    DataFeed { params: Vec<SearchParam> },
    /// `in_data_feed[[...]]`
    InDataFeed { params: Vec<SearchParam> },
    /// `attestation[[...]]`, optionally a single profile field.
    Attestation { params: Vec<SearchParam>, field: Option<Box<Expr>> },
    /// `balance[asset]` or `balance[address][asset]`
    Balance { address: Option<Box<Expr>>, asset: Box<Expr> },
    /// `unit[hash]`
    UnitLookup { unit: Box<Expr> },
    /// `definition[address]`
    Definition { address: Box<Expr> },
    /// `asset[asset].field`
    AssetInfo { asset: Box<Expr>, field: Box<Expr> },
    /// `is_aa(address)`
    IsAa { address: Box<Expr> },

    // ===== Functions =====
    /// Builtin function call.
    Call { func: Builtin, args: Vec<Expr> },
    /// Function literal.
    FuncDeclaration { args: Vec<String>, body: Box<Expr> },
    /// Call of a local function.
    FuncCall { name: String, args: Vec<Expr> },
    /// Call of a getter exported by another AA.
    RemoteCall {
        aa: Box<Expr>,
        max_complexity: Option<u32>,
        getter: String,
        args: Vec<Expr>,
    },
    /// `map`, `filter`, `reduce`, `foreach` over a bounded collection.
    Iterate {
        kind: IterKind,
        collection: Box<Expr>,
        count: u32,
        func: Box<Expr>,
        initial: Option<Box<Expr>>,
    },

    // ===== Statements =====
    /// Statement list followed by an optional result expression.
    Main { statements: Vec<Expr>, result: Option<Box<Expr>> },
    /// `if (cond) { then } else { otherwise }`
    IfElse { cond: Box<Expr>, then: Box<Expr>, otherwise: Option<Box<Expr>> },
    /// `return` with an optional value.
    Return { value: Option<Box<Expr>> },
    /// `bounce(message)`
    Bounce { message: Box<Expr> },
    /// `require(cond, message)`
    Require { cond: Box<Expr>, message: Box<Expr> },
    /// `log(...)`
    Log { args: Vec<Expr> },
}

/// Selector of an assignment target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Map key or array index.
    Key(Expr),
    /// `[]`: next free array slot.
    Append,
}

/// A `name op value` filter in a data feed or attestation search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParam {
    /// Parameter name.
    pub name: String,
    /// Comparison operator.
    pub op: CmpOp,
    /// Parameter value.
    pub value: Expr,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    /// Whether `ordering` satisfies this operator.
    #[must_use]
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
        }
    }
}

/// State variable assignment operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Concat,
}

impl AssignOp {
    /// Arithmetic behind a compound assignment.
    #[must_use]
    pub fn arith(self) -> Option<ArithOp> {
        match self {
            AssignOp::Add => Some(ArithOp::Add),
            AssignOp::Sub => Some(ArithOp::Sub),
            AssignOp::Mul => Some(ArithOp::Mul),
            AssignOp::Div => Some(ArithOp::Div),
            AssignOp::Rem => Some(ArithOp::Rem),
            AssignOp::Pow => Some(ArithOp::Pow),
            AssignOp::Assign | AssignOp::Concat => None,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathFunc {
    Sqrt,
    Ln,
    Abs,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundFunc {
    Round,
    Ceil,
    Floor,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinMaxFunc {
    Min,
    Max,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterKind {
    Map,
    Filter,
    Reduce,
    Foreach,
}

/// Trigger fields.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerField {
    Address,
    InitialAddress,
    Unit,
    InitialUnit,
    Data,
    Outputs,
}

/// Execution context fields.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    Mci,
    Timestamp,
    McUnit,
    ThisAddress,
    NumberOfResponses,
    StorageSize,
    Params,
    PreviousAaResponses,
    ResponseUnit,
}

/// Builtin functions.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    Sha256,
    Chash160,
    IsValidSig,
    IsValidMerkleProof,
    IsValidSignedPackage,
    JsonParse,
    JsonStringify,
    Typeof,
    Length,
    ToUpper,
    ToLower,
    Substring,
    IndexOf,
    StartsWith,
    EndsWith,
    Contains,
    Split,
    Join,
    Replace,
    HasOnly,
    ParseDate,
    TimestampToString,
    IsValidAddress,
    IsInteger,
    IsValidAmount,
    NumberFromSeed,
    Exists,
    IsArray,
    IsAssoc,
    ArrayLength,
    Keys,
    Reverse,
}

impl Builtin {
    /// Accepted argument count range.
    #[must_use]
    pub fn arity(self) -> (usize, usize) {
        use Builtin::*;
        match self {
            Chash160 | JsonParse | JsonStringify | Typeof | Length | ToUpper | ToLower
            | ParseDate | IsValidAddress | IsInteger | IsValidAmount | Exists | IsArray
            | IsAssoc | ArrayLength | Keys | Reverse => (1, 1),
            Sha256 | TimestampToString => (1, 2),
            IsValidMerkleProof | IsValidSignedPackage | IndexOf | StartsWith | EndsWith
            | Contains | Join | HasOnly => (2, 2),
            Substring | Split => (2, 3),
            IsValidSig | Replace => (3, 3),
            NumberFromSeed => (1, 3),
        }
    }

    /// Whether the builtin only exists from the second AA protocol upgrade on.
    #[must_use]
    pub fn requires_upgrade(self) -> bool {
        use Builtin::*;
        matches!(
            self,
            JsonParse | JsonStringify | NumberFromSeed | ArrayLength | Keys | Reverse | IsArray
                | IsAssoc | Split | Join | Exists
        )
    }

    /// Source-level name.
    #[must_use]
    pub fn name(self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Expr {
    /// Integer literal.
    #[must_use]
    pub fn num(v: i64) -> Self {
        Expr::Number { value: Decimal::from(v) }
    }

    /// String literal.
    #[must_use]
    pub fn str(s: &str) -> Self {
        Expr::Str { value: s.to_string() }
    }

    /// Boolean literal.
    #[must_use]
    pub fn boolean(value: bool) -> Self {
        Expr::Bool { value }
    }

    /// Plain local variable read.
    #[must_use]
    pub fn local(name: &str) -> Self {
        Expr::LocalVar { name: name.to_string(), selectors: vec![] }
    }

    /// Plain local variable assignment.
    #[must_use]
    pub fn assign(name: &str, value: Expr) -> Self {
        Expr::Assign { name: name.to_string(), selectors: vec![], value: Box::new(value) }
    }

    /// Binary arithmetic.
    #[must_use]
    pub fn arith(op: ArithOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Arith { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    /// Comparison.
    #[must_use]
    pub fn compare(op: CmpOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Compare { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    /// Builtin call.
    #[must_use]
    pub fn call(func: Builtin, args: Vec<Expr>) -> Self {
        Expr::Call { func, args }
    }

    /// This AA's state variable.
    #[must_use]
    pub fn state_var(name: &str) -> Self {
        Expr::StateVar { address: None, name: Box::new(Expr::str(name)) }
    }

    /// Statement list with a result.
    #[must_use]
    pub fn main(statements: Vec<Expr>, result: Option<Expr>) -> Self {
        Expr::Main { statements, result: result.map(Box::new) }
    }

    /// Statement list without a result.
    #[must_use]
    pub fn statements(statements: Vec<Expr>) -> Self {
        Expr::Main { statements, result: None }
    }

    /// Calls `f` on every direct child expression.
    pub fn for_each_child(&self, f: &mut impl FnMut(&Expr)) {
        match self {
            Expr::Number { .. }
            | Expr::Str { .. }
            | Expr::Bool { .. }
            | Expr::Pi
            | Expr::E
            | Expr::Freeze { .. }
            | Expr::Trigger { .. }
            | Expr::Context { .. } => {}
            Expr::Array { items: list }
            | Expr::And { args: list }
            | Expr::Or { args: list }
            | Expr::MinMax { args: list, .. }
            | Expr::Call { args: list, .. }
            | Expr::FuncCall { args: list, .. }
            | Expr::Log { args: list }
            | Expr::LocalVar { selectors: list, .. } => list.iter().for_each(f),
            Expr::Dictionary { entries } => entries.iter().for_each(|(_, e)| f(e)),
            Expr::Arith { lhs, rhs, .. } | Expr::Concat { lhs, rhs } | Expr::Compare { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Expr::Hypot { a, b } => {
                f(a);
                f(b);
            }
            Expr::Negate { expr } | Expr::Not { expr } => f(expr),
            Expr::Ternary { cond, if_true, if_false } => {
                f(cond);
                f(if_true);
                f(if_false);
            }
            Expr::Otherwise { value, fallback } => {
                f(value);
                f(fallback);
            }
            Expr::Math { arg, .. } => f(arg),
            Expr::Rounding { arg, places, .. } => {
                f(arg);
                if let Some(p) = places {
                    f(p);
                }
            }
            Expr::Assign { selectors, value, .. } => {
                for s in selectors {
                    if let Selector::Key(k) = s {
                        f(k);
                    }
                }
                f(value);
            }
            Expr::Delete { selectors, key, .. } => {
                selectors.iter().for_each(&mut *f);
                f(key);
            }
            Expr::StateVar { address, name } => {
                if let Some(a) = address {
                    f(a);
                }
                f(name);
            }
            Expr::StateVarAssign { name, value, .. } | Expr::ResponseVarAssign { name, value } => {
                f(name);
                f(value);
            }
            Expr::WithSelectors { expr, selectors } => {
                f(expr);
                selectors.iter().for_each(f);
            }
            Expr::TriggerOutput { asset } => f(asset),
            Expr::DataFeed { params } | Expr::InDataFeed { params } => params.iter().for_each(|p| f(&p.value)),
            Expr::Attestation { params, field } => {
                params.iter().for_each(|p| f(&p.value));
                if let Some(field) = field {
                    f(field);
                }
            }
            Expr::Balance { address, asset } => {
                if let Some(a) = address {
                    f(a);
                }
                f(asset);
            }
            Expr::UnitLookup { unit: e } | Expr::Definition { address: e } | Expr::IsAa { address: e } => f(e),
            Expr::AssetInfo { asset, field } => {
                f(asset);
                f(field);
            }
            Expr::FuncDeclaration { body, .. } => f(body),
            Expr::RemoteCall { aa, args, .. } => {
                f(aa);
                args.iter().for_each(f);
            }
            Expr::Iterate { collection, func, initial, .. } => {
                f(collection);
                f(func);
                if let Some(i) = initial {
                    f(i);
                }
            }
            Expr::Main { statements, result } => {
                statements.iter().for_each(&mut *f);
                if let Some(r) = result {
                    f(r);
                }
            }
            Expr::IfElse { cond, then, otherwise } => {
                f(cond);
                f(then);
                if let Some(o) = otherwise {
                    f(o);
                }
            }
            Expr::Return { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
            Expr::Bounce { message } => f(message),
            Expr::Require { cond, message } => {
                f(cond);
                f(message);
            }
        }
    }

    /// Addresses of every remote call with a literal target, anywhere below this node.
    #[must_use]
    pub fn literal_remote_targets(&self) -> Vec<String> {
        fn walk(e: &Expr, out: &mut Vec<String>) {
            if let Expr::RemoteCall { aa, .. } = e {
                if let Expr::Str { value } = &**aa {
                    if !out.contains(value) {
                        out.push(value.clone());
                    }
                }
            }
            e.for_each_child(&mut |child| walk(child, out));
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }

    /// Whether this node may stand on its own in a statement list.
    #[must_use]
    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            Expr::Assign { .. }
                | Expr::StateVarAssign { .. }
                | Expr::ResponseVarAssign { .. }
                | Expr::IfElse { .. }
                | Expr::Return { .. }
                | Expr::Bounce { .. }
                | Expr::Require { .. }
                | Expr::Log { .. }
                | Expr::Freeze { .. }
                | Expr::Delete { .. }
                | Expr::FuncCall { .. }
                | Expr::RemoteCall { .. }
                | Expr::Main { result: None, .. }
                | Expr::Iterate { kind: IterKind::Foreach, .. }
        )
    }
}
