//! # Formula Evaluator
//!
//! Async tree-walking interpreter for validated formulas.
//!
//! One [`Evaluator`] runs the formulas of one AA invocation. It shares the
//! cascade's [`ValidationState`] (balances, state variable cache, composed
//! response units) with every other invocation of the same primary trigger,
//! so later invocations observe earlier writes without touching the ledger.
//!
//! ## Control flow
//!
//! Evaluation returns `Result<Value, Interrupt>`. `return` unwinds as
//! [`Interrupt::Return`] to the nearest function call or formula boundary;
//! `bounce`, a failed `require`, and every runtime error unwind as
//! [`Interrupt::Error`] all the way out, so nothing after them runs.

pub mod arith;
pub mod builtins;
pub mod getters;
mod lookups;
pub mod selectors;
mod template;

pub use template::Substitution;

use crate::config::AaConfig;
use crate::domain::ast::{
    ArithOp, AssignOp, Builtin, ContextField, Expr, IterKind, MathFunc, MinMaxFunc, RoundFunc, Selector,
    TriggerField,
};
use crate::domain::decimal::{Decimal, DecimalError, RoundingMode};
use crate::domain::entities::{StateVarEntry, Trigger, ValidationState};
use crate::domain::value::{Node, ObjectRef, Value};
use crate::errors::{EvalError, ValidationError};
use crate::ports::outbound::LedgerReader;
use futures::future::{BoxFuture, FutureExt};
use shared_types::{Address, Asset, LedgerError, UnitHash};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

// =============================================================================
// SCOPE
// =============================================================================

/// A user-defined function together with the locals it captured.
#[derive(Debug)]
pub struct Closure {
    args: Vec<String>,
    body: Expr,
    captured: Scope,
}

/// A local binding.
#[derive(Debug, Clone)]
pub enum Local {
    /// Plain value.
    Data(Value),
    /// Function.
    Func(Arc<Closure>),
}

/// Local variables of a running formula.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: BTreeMap<String, Local>,
}

impl Scope {
    /// Value of a data local.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.vars.get(name) {
            Some(Local::Data(v)) => Some(v),
            _ => None,
        }
    }

    /// A function local.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<Arc<Closure>> {
        match self.vars.get(name) {
            Some(Local::Func(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    fn define(&mut self, name: &str, local: Local) -> Result<(), EvalError> {
        if self.vars.contains_key(name) {
            return Err(EvalError::failed(format!("local var {name} already assigned")));
        }
        self.vars.insert(name.to_string(), local);
        Ok(())
    }
}

// =============================================================================
// INVOCATION
// =============================================================================

/// Per-invocation inputs and outputs that are not shared with the cascade.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The AA being run.
    pub address: Address,
    /// What triggered it.
    pub trigger: Trigger,
    /// Parameters of a parameterized definition; an empty map otherwise.
    pub params: Value,
    /// `response['...']` assignments.
    pub response_vars: BTreeMap<String, Value>,
    /// `log(...)` lines.
    pub logs: Vec<String>,
    /// Hash of the response unit, visible to the state message.
    pub response_unit: Option<UnitHash>,
}

impl Invocation {
    /// Fresh invocation of `address`.
    #[must_use]
    pub fn new(address: Address, trigger: Trigger, params: Value) -> Self {
        Self {
            address,
            trigger,
            params,
            response_vars: BTreeMap::new(),
            logs: Vec::new(),
            response_unit: None,
        }
    }
}

/// Capabilities of the formula being run; mirrors the validator options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalMode {
    /// Running a getter: no trigger, no writes.
    pub is_getter: bool,
    /// Running the state message.
    pub state_var_assignment_allowed: bool,
}

/// Non-local exit from an expression.
#[derive(Debug)]
pub enum Interrupt {
    /// `return`
    Return(Value),
    /// Bounce or runtime failure.
    Error(EvalError),
}

impl From<EvalError> for Interrupt {
    fn from(e: EvalError) -> Self {
        Interrupt::Error(e)
    }
}

impl From<DecimalError> for Interrupt {
    fn from(e: DecimalError) -> Self {
        Interrupt::Error(e.into())
    }
}

impl From<LedgerError> for Interrupt {
    fn from(e: LedgerError) -> Self {
        Interrupt::Error(e.into())
    }
}

impl From<ValidationError> for Interrupt {
    fn from(e: ValidationError) -> Self {
        Interrupt::Error(e.into())
    }
}

type EvalResult = Result<Value, Interrupt>;

fn fail<T>(msg: impl Into<String>) -> Result<T, Interrupt> {
    Err(Interrupt::Error(EvalError::failed(msg)))
}

fn object(node: Node) -> Value {
    Value::Object(ObjectRef::new(node))
}

// =============================================================================
// EVALUATOR
// =============================================================================

/// Runs formulas of one invocation against the shared cascade state.
pub struct Evaluator<'a, L: LedgerReader + ?Sized> {
    ledger: &'a L,
    config: &'a AaConfig,
    state: &'a mut ValidationState,
    inv: &'a mut Invocation,
    scope: Scope,
    mode: EvalMode,
}

impl<'a, L: LedgerReader + ?Sized> Evaluator<'a, L> {
    /// Evaluator with an empty scope.
    pub fn new(
        ledger: &'a L,
        config: &'a AaConfig,
        state: &'a mut ValidationState,
        inv: &'a mut Invocation,
        mode: EvalMode,
    ) -> Self {
        Self { ledger, config, state, inv, scope: Scope::default(), mode }
    }

    /// Continues with locals left by an earlier formula of the same invocation.
    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Hands the locals back for the next formula.
    #[must_use]
    pub fn into_scope(self) -> Scope {
        self.scope
    }

    /// Current locals.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Switches capabilities, e.g. before the state message.
    pub fn set_mode(&mut self, mode: EvalMode) {
        self.mode = mode;
    }

    /// Evaluates a formula. A top-level `return` ends the formula with its value.
    ///
    /// # Errors
    ///
    /// Returns the bounce reason or runtime failure.
    pub async fn evaluate(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match self.eval(expr).await {
            Ok(v) | Err(Interrupt::Return(v)) => Ok(v),
            Err(Interrupt::Error(e)) => Err(e),
        }
    }

    fn aa2(&self) -> bool {
        self.config.aa2_active(self.state.context.mci)
    }

    fn check_str(&self, value: Value) -> EvalResult {
        if let Value::Str(s) = &value {
            arith::check_len(s, self.config.max_aa_string_length)?;
        }
        Ok(value)
    }

    /// Evaluates one node.
    #[allow(clippy::too_many_lines)]
    pub fn eval<'b>(&'b mut self, e: &'b Expr) -> BoxFuture<'b, EvalResult> {
        async move {
            match e {
                // ----- literals -----
                Expr::Number { value } => Ok(Value::Number(*value)),
                Expr::Str { value } => Ok(Value::Str(value.clone())),
                Expr::Bool { value } => Ok(Value::Bool(*value)),
                Expr::Pi => Ok(Value::Number(Decimal::PI)),
                Expr::E => Ok(Value::Number(Decimal::E)),
                Expr::Array { items } => {
                    let mut nodes = Vec::with_capacity(items.len());
                    for item in items {
                        nodes.push(self.eval(item).await?.into_node());
                    }
                    Ok(object(Node::Array(nodes)))
                }
                Expr::Dictionary { entries } => {
                    let mut map = BTreeMap::new();
                    for (key, item) in entries {
                        map.insert(key.clone(), self.eval(item).await?.into_node());
                    }
                    Ok(object(Node::Map(map)))
                }

                // ----- operators -----
                Expr::Arith { op, lhs, rhs } => {
                    let a = self.eval(lhs).await?;
                    let b = self.eval(rhs).await?;
                    Ok(arith::binary(*op, &a, &b)?)
                }
                Expr::Negate { expr } => {
                    let v = self.eval(expr).await?;
                    Ok(Value::Number(arith::to_number(&v)?.negate()))
                }
                Expr::Concat { lhs, rhs } => {
                    let a = self.eval(lhs).await?;
                    let b = self.eval(rhs).await?;
                    Ok(arith::concat(a, b, self.aa2(), self.config.max_aa_string_length)?)
                }
                Expr::Compare { op, lhs, rhs } => {
                    let a = self.eval(lhs).await?;
                    let b = self.eval(rhs).await?;
                    Ok(Value::Bool(arith::compare(*op, &a, &b)?))
                }
                Expr::And { args } => {
                    for arg in args {
                        if !self.eval(arg).await?.is_truthy() {
                            return Ok(Value::Bool(false));
                        }
                    }
                    Ok(Value::Bool(true))
                }
                Expr::Or { args } => {
                    for arg in args {
                        if self.eval(arg).await?.is_truthy() {
                            return Ok(Value::Bool(true));
                        }
                    }
                    Ok(Value::Bool(false))
                }
                Expr::Not { expr } => Ok(Value::Bool(!self.eval(expr).await?.is_truthy())),
                Expr::Ternary { cond, if_true, if_false } => {
                    if self.eval(cond).await?.is_truthy() {
                        self.eval(if_true).await
                    } else {
                        self.eval(if_false).await
                    }
                }
                Expr::Otherwise { value, fallback } => {
                    let v = self.eval(value).await?;
                    if v.is_truthy() {
                        Ok(v)
                    } else {
                        self.eval(fallback).await
                    }
                }
                Expr::Math { func, arg } => {
                    let x = arith::to_number(&self.eval(arg).await?)?;
                    let r = match func {
                        MathFunc::Sqrt => x.sqrt()?,
                        MathFunc::Ln => x.ln()?,
                        MathFunc::Abs => x.abs(),
                    };
                    Ok(Value::Number(r))
                }
                Expr::Rounding { func, arg, places } => {
                    let x = arith::to_number(&self.eval(arg).await?)?;
                    let places = match places {
                        Some(p) => arith::to_small_int(&self.eval(p).await?, "decimal places")?,
                        None => 0,
                    };
                    if places > 15 {
                        return fail("decimal places must be at most 15");
                    }
                    let mode = match func {
                        RoundFunc::Round => RoundingMode::HalfEven,
                        RoundFunc::Ceil => RoundingMode::Ceil,
                        RoundFunc::Floor => RoundingMode::Floor,
                    };
                    Ok(Value::Number(x.round_dp(places, mode)?))
                }
                Expr::MinMax { func, args } => {
                    let mut best: Option<Decimal> = None;
                    for arg in args {
                        let x = arith::to_number(&self.eval(arg).await?)?;
                        best = Some(match (best, func) {
                            (None, _) => x,
                            (Some(b), MinMaxFunc::Min) => b.min(x),
                            (Some(b), MinMaxFunc::Max) => b.max(x),
                        });
                    }
                    match best {
                        Some(b) => Ok(Value::Number(b)),
                        None => fail("min/max of nothing"),
                    }
                }
                Expr::Hypot { a, b } => {
                    let x = arith::to_number(&self.eval(a).await?)?;
                    let y = arith::to_number(&self.eval(b).await?)?;
                    Ok(Value::Number(x.hypot(y)?))
                }

                // ----- locals -----
                Expr::LocalVar { name, selectors } => {
                    let value = match self.scope.vars.get(name) {
                        Some(Local::Data(v)) => v.clone(),
                        Some(Local::Func(_)) => return fail(format!("{name} is a function")),
                        // assigned on a branch that did not run
                        None => Value::Bool(false),
                    };
                    let keys = self.eval_all(selectors).await?;
                    Ok(selectors::get(&value, &keys))
                }
                Expr::Assign { name, selectors, value } => {
                    self.assign_local(name, selectors, value).await?;
                    Ok(Value::Bool(true))
                }
                Expr::Freeze { name } => {
                    match self.scope.vars.get_mut(name) {
                        Some(Local::Data(Value::Object(o))) => o.freeze(),
                        Some(Local::Data(_)) | None => {}
                        Some(Local::Func(_)) => return fail(format!("cannot freeze {name}")),
                    }
                    Ok(Value::Bool(true))
                }
                Expr::Delete { name, selectors, key } => {
                    let path = self.eval_all(selectors).await?;
                    let key = self.eval(key).await?;
                    let node = self.local_object_mut(name)?;
                    selectors::delete(node, &path, &key)?;
                    Ok(Value::Bool(true))
                }
                Expr::WithSelectors { expr, selectors } => {
                    let value = self.eval(expr).await?;
                    let keys = self.eval_all(selectors).await?;
                    Ok(selectors::get(&value, &keys))
                }

                // ----- state and response -----
                Expr::StateVar { address, name } => {
                    let address = match address {
                        Some(a) => self.eval_address(a).await?,
                        None => self.inv.address.clone(),
                    };
                    let name = self.eval(name).await?.to_text();
                    Ok(self.read_state_var(&address, &name).await?)
                }
                Expr::StateVarAssign { name, op, value } => {
                    if !self.mode.state_var_assignment_allowed {
                        return fail("state vars can only be assigned in the state message");
                    }
                    let name = self.eval(name).await?.to_text();
                    let value = self.eval(value).await?;
                    self.assign_state_var(&name, *op, value).await?;
                    Ok(Value::Bool(true))
                }
                Expr::ResponseVarAssign { name, value } => {
                    let name = self.eval(name).await?.to_text();
                    let value = self.eval(value).await?;
                    if value.is_object() {
                        return fail("response vars must be scalars");
                    }
                    self.inv.response_vars.insert(name, value);
                    Ok(Value::Bool(true))
                }

                // ----- trigger and context -----
                Expr::Trigger { field } => Ok(self.trigger_field(*field)?),
                Expr::TriggerOutput { asset } => {
                    let asset = Asset::new(self.eval(asset).await?.to_text());
                    Ok(Value::Number(Decimal::from(self.inv.trigger.amount(&asset))))
                }
                Expr::Context { field } => self.context(*field).await,

                // ----- ledger lookups -----
                Expr::DataFeed { params } => self.data_feed(params, false).await,
                Expr::InDataFeed { params } => self.data_feed(params, true).await,
                Expr::Attestation { params, field } => self.attestation(params, field.as_deref()).await,
                Expr::Balance { address, asset } => {
                    let address = match address {
                        Some(a) => Some(self.eval_address(a).await?),
                        None => None,
                    };
                    let asset = Asset::new(self.eval(asset).await?.to_text());
                    self.balance(address, &asset).await
                }
                Expr::UnitLookup { unit } => {
                    let hash = UnitHash::new(self.eval(unit).await?.to_text());
                    self.unit_lookup(&hash).await
                }
                Expr::Definition { address } => {
                    let address = self.eval_address(address).await?;
                    self.definition(&address).await
                }
                Expr::AssetInfo { asset, field } => {
                    let asset = Asset::new(self.eval(asset).await?.to_text());
                    let field = self.eval(field).await?.to_text();
                    self.asset_info(&asset, &field).await
                }
                Expr::IsAa { address } => {
                    let address = self.eval(address).await?.to_text();
                    let Some(address) = Address::parse(&address) else {
                        return Ok(Value::Bool(false));
                    };
                    Ok(Value::Bool(self.aa_definition_at_mci(&address).await?.is_some()))
                }

                // ----- functions -----
                Expr::Call { func, args } => {
                    let args = self.eval_all(args).await?;
                    if *func == Builtin::IsValidSignedPackage {
                        return self.signed_package(&args).await;
                    }
                    Ok(builtins::call(*func, &args, self.config.max_aa_string_length)?)
                }
                Expr::FuncDeclaration { .. } => fail("function declaration outside an assignment"),
                Expr::FuncCall { name, args } => {
                    let Some(closure) = self.scope.function(name) else {
                        return fail(format!("{name} is not a function"));
                    };
                    let args = self.eval_all(args).await?;
                    self.call_closure(&closure, args).await
                }
                Expr::RemoteCall { aa, max_complexity, getter, args } => {
                    let aa = self.eval_address(aa).await?;
                    let args = self.eval_all(args).await?;
                    self.remote_call(&aa, *max_complexity, getter, args).await
                }
                Expr::Iterate { kind, collection, count, func, initial } => {
                    self.iterate(*kind, collection, *count, func, initial.as_deref()).await
                }

                // ----- statements -----
                Expr::Main { statements, result } => {
                    for statement in statements {
                        self.eval(statement).await?;
                    }
                    match result {
                        Some(result) => self.eval(result).await,
                        None => Ok(Value::Bool(true)),
                    }
                }
                Expr::IfElse { cond, then, otherwise } => {
                    if self.eval(cond).await?.is_truthy() {
                        self.eval(then).await?;
                    } else if let Some(otherwise) = otherwise {
                        self.eval(otherwise).await?;
                    }
                    Ok(Value::Bool(true))
                }
                Expr::Return { value } => {
                    let v = match value {
                        Some(v) => self.eval(v).await?,
                        None => Value::Bool(true),
                    };
                    Err(Interrupt::Return(v))
                }
                Expr::Bounce { message } => {
                    let msg = self.eval(message).await?.to_text();
                    trace!(aa = %self.inv.address, reason = %msg, "bounce");
                    Err(Interrupt::Error(EvalError::Bounce(msg)))
                }
                Expr::Require { cond, message } => {
                    if self.eval(cond).await?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    let msg = self.eval(message).await?.to_text();
                    Err(Interrupt::Error(EvalError::Bounce(msg)))
                }
                Expr::Log { args } => {
                    let parts = self.eval_all(args).await?;
                    let line = parts.iter().map(Value::to_text).collect::<Vec<_>>().join(" ");
                    self.inv.logs.push(line);
                    Ok(Value::Bool(true))
                }
            }
            .and_then(|v| self.check_str(v))
        }
        .boxed()
    }

    async fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, Interrupt> {
        let mut out = Vec::with_capacity(exprs.len());
        for e in exprs {
            out.push(self.eval(e).await?);
        }
        Ok(out)
    }

    async fn eval_address(&mut self, e: &Expr) -> Result<Address, Interrupt> {
        let text = self.eval(e).await?.to_text();
        match Address::parse(&text) {
            Some(a) => Ok(a),
            None => fail(format!("not an address: {text}")),
        }
    }

    // -------------------------------------------------------------------------
    // Locals
    // -------------------------------------------------------------------------

    async fn assign_local(&mut self, name: &str, selectors: &[Selector], value: &Expr) -> Result<(), Interrupt> {
        if selectors.is_empty() {
            let local = match value {
                Expr::FuncDeclaration { args, body } => Local::Func(Arc::new(Closure {
                    args: args.clone(),
                    body: (**body).clone(),
                    captured: self.scope.clone(),
                })),
                other => Local::Data(self.eval(other).await?),
            };
            self.scope.define(name, local)?;
            return Ok(());
        }
        let mut path = Vec::with_capacity(selectors.len());
        for selector in selectors {
            path.push(match selector {
                Selector::Key(e) => Some(self.eval(e).await?),
                Selector::Append => None,
            });
        }
        let new = self.eval(value).await?.into_node();
        let node = self.local_object_mut(name)?;
        selectors::set(node, &path, new)?;
        Ok(())
    }

    fn local_object_mut(&mut self, name: &str) -> Result<&mut Node, Interrupt> {
        match self.scope.vars.get_mut(name) {
            Some(Local::Data(Value::Object(o))) => match o.make_mut() {
                Some(node) => Ok(node),
                None => fail(format!("local var {name} is frozen")),
            },
            Some(_) => fail(format!("local var {name} is not an object")),
            None => fail(format!("uninitialized local var {name}")),
        }
    }

    async fn call_closure(&mut self, closure: &Closure, args: Vec<Value>) -> EvalResult {
        if args.len() > closure.args.len() {
            return fail("too many arguments");
        }
        let mut scope = closure.captured.clone();
        let mut args = args.into_iter();
        for name in &closure.args {
            let value = args.next().unwrap_or(Value::Bool(false));
            scope.vars.insert(name.clone(), Local::Data(value));
        }
        let caller = std::mem::replace(&mut self.scope, scope);
        let result = self.eval(&closure.body).await;
        self.scope = caller;
        match result {
            Ok(v) | Err(Interrupt::Return(v)) => Ok(v),
            Err(e) => Err(e),
        }
    }

    fn callback(&self, func: &Expr) -> Result<Arc<Closure>, Interrupt> {
        match func {
            Expr::FuncDeclaration { args, body } => Ok(Arc::new(Closure {
                args: args.clone(),
                body: (**body).clone(),
                captured: self.scope.clone(),
            })),
            Expr::LocalVar { name, .. } => match self.scope.function(name) {
                Some(f) => Ok(f),
                None => fail(format!("{name} is not a function")),
            },
            _ => fail("iteration callback must be a function"),
        }
    }

    async fn iterate(
        &mut self,
        kind: IterKind,
        collection: &Expr,
        count: u32,
        func: &Expr,
        initial: Option<&Expr>,
    ) -> EvalResult {
        let coll = self.eval(collection).await?;
        let Value::Object(coll) = coll else {
            return fail("can only iterate over objects");
        };
        let mut acc = match initial {
            Some(e) => Some(self.eval(e).await?),
            None => None,
        };
        let f = self.callback(func)?;
        let entries: Vec<(Value, Node)> = match coll.node() {
            Node::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, n)| (Value::Number(Decimal::from(i64::try_from(i).unwrap_or(i64::MAX))), n.clone()))
                .collect(),
            Node::Map(map) => map.iter().map(|(k, n)| (Value::Str(k.clone()), n.clone())).collect(),
            _ => return fail("can only iterate over objects"),
        };
        if entries.len() > count as usize {
            return fail(format!("{} elements exceed the declared limit {count}", entries.len()));
        }
        let is_array = matches!(coll.node(), Node::Array(_));
        let mut mapped_array = Vec::new();
        let mut mapped_map = BTreeMap::new();
        for (key, node) in entries {
            let element = Value::from_node(node.clone());
            let args = match kind {
                IterKind::Reduce => vec![acc.take().unwrap_or(Value::Bool(false)), element, key.clone()],
                _ => vec![element, key.clone()],
            };
            let result = self.call_closure(&f, args).await?;
            match kind {
                IterKind::Map => {
                    if is_array {
                        mapped_array.push(result.into_node());
                    } else {
                        mapped_map.insert(key.to_text(), result.into_node());
                    }
                }
                IterKind::Filter => {
                    if result.is_truthy() {
                        if is_array {
                            mapped_array.push(node);
                        } else {
                            mapped_map.insert(key.to_text(), node);
                        }
                    }
                }
                IterKind::Reduce => acc = Some(result),
                IterKind::Foreach => {}
            }
        }
        Ok(match kind {
            IterKind::Map | IterKind::Filter if is_array => object(Node::Array(mapped_array)),
            IterKind::Map | IterKind::Filter => object(Node::Map(mapped_map)),
            IterKind::Reduce => acc.unwrap_or(Value::Bool(false)),
            IterKind::Foreach => Value::Bool(true),
        })
    }

    // -------------------------------------------------------------------------
    // State variables
    // -------------------------------------------------------------------------

    /// Reads a state variable, caching it in the cascade state on first touch.
    async fn read_state_var(&mut self, address: &Address, name: &str) -> Result<Value, EvalError> {
        if let Some(entry) = self.state.state_vars.get(address).and_then(|vars| vars.get(name)) {
            return Ok(entry.value.clone());
        }
        let value = match self.ledger.read_state_var(address, name).await? {
            Some(stored) => Value::from_stored(&stored).map_err(LedgerError::Corrupted)?,
            None => Value::Bool(false),
        };
        self.state
            .state_vars
            .entry(address.clone())
            .or_default()
            .insert(name.to_string(), StateVarEntry::loaded(value.clone()));
        Ok(value)
    }

    async fn assign_state_var(&mut self, name: &str, op: AssignOp, value: Value) -> Result<(), EvalError> {
        if name.is_empty() || name.len() > self.config.max_state_var_name_length {
            return Err(EvalError::failed(format!("bad state var name {name}")));
        }
        let address = self.inv.address.clone();
        let current = self.read_state_var(&address, name).await?;
        let new = match op {
            AssignOp::Assign => value,
            AssignOp::Concat => match current {
                Value::Bool(false) if value.is_object() => value,
                Value::Bool(false) => arith::concat(
                    Value::Str(String::new()),
                    value,
                    false,
                    self.config.max_aa_string_length,
                )?,
                c => arith::concat(c, value, self.aa2(), self.config.max_aa_string_length)?,
            },
            arith_op => {
                if current.is_object() || value.is_object() {
                    return Err(EvalError::failed("arithmetic assignment on an object"));
                }
                let op = arith_op.arith().unwrap_or(ArithOp::Add);
                arith::binary(op, &current, &value)?
            }
        };
        let new = match new {
            Value::Bool(true) => Value::Number(Decimal::ONE),
            other => other,
        };
        if let Some(stored) = new.to_stored() {
            if stored.text.len() > self.config.max_state_var_value_length {
                return Err(EvalError::failed(format!("state var {name} value too long")));
            }
        }
        if let Some(entry) = self.state.state_vars.get_mut(&address).and_then(|vars| vars.get_mut(name)) {
            entry.value = new;
            entry.updated = true;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trigger and context
    // -------------------------------------------------------------------------

    fn trigger_field(&self, field: TriggerField) -> Result<Value, EvalError> {
        let t = &self.inv.trigger;
        Ok(match field {
            TriggerField::Address => Value::Str(t.address.as_str().to_string()),
            TriggerField::InitialAddress => Value::Str(t.initial_address.as_str().to_string()),
            TriggerField::Unit => Value::Str(t.unit.as_str().to_string()),
            TriggerField::InitialUnit => Value::Str(t.initial_unit.as_str().to_string()),
            TriggerField::Data => match &t.data {
                Some(data) => Value::from_json(data)?,
                None => object(Node::Map(BTreeMap::new())),
            },
            TriggerField::Outputs => object(Node::Map(
                t.outputs
                    .iter()
                    .map(|(asset, amount)| (asset.as_str().to_string(), Node::Number(Decimal::from(*amount))))
                    .collect(),
            )),
        })
    }

    async fn context(&mut self, field: ContextField) -> EvalResult {
        let as_number = |n: u64| Value::Number(Decimal::from(i64::try_from(n).unwrap_or(i64::MAX)));
        Ok(match field {
            ContextField::Mci => as_number(self.state.context.mci),
            ContextField::Timestamp => as_number(self.state.context.timestamp),
            ContextField::McUnit => Value::Str(self.state.context.mc_unit.as_str().to_string()),
            ContextField::ThisAddress => Value::Str(self.inv.address.as_str().to_string()),
            ContextField::NumberOfResponses => as_number(self.state.number_of_responses as u64),
            ContextField::StorageSize => {
                let address = self.inv.address.clone();
                Value::Number(Decimal::from(self.storage_size(&address).await?))
            }
            ContextField::Params => self.inv.params.clone(),
            ContextField::PreviousAaResponses => {
                let json = serde_json::to_value(&self.state.responses)
                    .map_err(|e| EvalError::failed(e.to_string()))?;
                Value::from_json(&json)?
            }
            ContextField::ResponseUnit => match &self.inv.response_unit {
                Some(hash) => Value::Str(hash.as_str().to_string()),
                None => Value::Bool(false),
            },
        })
    }

    /// Storage size of `address`, cached in the cascade state.
    async fn storage_size(&mut self, address: &Address) -> Result<i64, EvalError> {
        if let Some(size) = self.state.storage_sizes.get(address) {
            return Ok(*size);
        }
        let size = self.ledger.read_storage_size(address).await?;
        self.state.storage_sizes.insert(address.clone(), size);
        Ok(size)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapters::memory_ledger::InMemoryLedgerReader;
    use crate::domain::ast::CmpOp;
    use crate::domain::entities::ChainContext;
    use serde_json::json;

    pub(crate) fn addr(c: char) -> Address {
        Address::new(c.to_string().repeat(32))
    }

    pub(crate) fn context() -> ValidationState {
        ValidationState::new(ChainContext {
            mci: 1_000,
            timestamp: 1_600_000_000,
            mc_unit: UnitHash::new("m".repeat(64)),
            last_ball_unit: UnitHash::new("b".repeat(64)),
        })
    }

    pub(crate) fn invocation() -> Invocation {
        let trigger = Trigger {
            address: addr('U'),
            initial_address: addr('U'),
            unit: UnitHash::new("1".repeat(64)),
            initial_unit: UnitHash::new("1".repeat(64)),
            outputs: [(Asset::base(), 30_000)].into_iter().collect(),
            data: Some(json!({"x": 5, "list": [1, 2, 3]})),
        };
        Invocation::new(addr('A'), trigger, object(Node::Map(BTreeMap::new())))
    }

    pub(crate) async fn run_with(ledger: &InMemoryLedgerReader, mode: EvalMode, e: &Expr) -> Result<Value, EvalError> {
        let config = AaConfig::default();
        let mut state = context();
        let mut inv = invocation();
        let mut ev = Evaluator::new(ledger, &config, &mut state, &mut inv, mode);
        ev.evaluate(e).await
    }

    async fn run(e: &Expr) -> Result<Value, EvalError> {
        run_with(&InMemoryLedgerReader::default(), EvalMode::default(), e).await
    }

    fn n(i: i64) -> Value {
        Value::Number(Decimal::from(i))
    }

    fn func(args: &[&str], body: Expr) -> Expr {
        Expr::FuncDeclaration { args: args.iter().map(|a| (*a).to_string()).collect(), body: Box::new(body) }
    }

    #[tokio::test]
    async fn test_arithmetic_and_locals() {
        let e = Expr::main(
            vec![Expr::assign("x", Expr::arith(ArithOp::Mul, Expr::num(6), Expr::num(7)))],
            Some(Expr::arith(ArithOp::Add, Expr::local("x"), Expr::boolean(true))),
        );
        assert_eq!(run(&e).await.unwrap(), n(43));
    }

    #[tokio::test]
    async fn test_bounce_stops_evaluation() {
        let e = Expr::statements(vec![
            Expr::Bounce { message: Box::new(Expr::str("nope")) },
            Expr::Log { args: vec![Expr::str("unreachable")] },
        ]);
        match run(&e).await {
            Err(EvalError::Bounce(msg)) => assert_eq!(msg, "nope"),
            other => panic!("expected bounce, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trigger_data_selectors() {
        let e = Expr::WithSelectors {
            expr: Box::new(Expr::Trigger { field: TriggerField::Data }),
            selectors: vec![Expr::str("list"), Expr::num(2)],
        };
        assert_eq!(run(&e).await.unwrap(), n(3));
        let missing = Expr::WithSelectors {
            expr: Box::new(Expr::Trigger { field: TriggerField::Data }),
            selectors: vec![Expr::str("nope")],
        };
        assert_eq!(run(&missing).await.unwrap(), Value::Bool(false));
    }

    #[tokio::test]
    async fn test_functions_and_return() {
        let body = Expr::main(
            vec![Expr::IfElse {
                cond: Box::new(Expr::compare(CmpOp::Gt, Expr::local("a"), Expr::num(10))),
                then: Box::new(Expr::Return { value: Some(Box::new(Expr::str("big"))) }),
                otherwise: None,
            }],
            Some(Expr::str("small")),
        );
        let e = Expr::main(
            vec![Expr::assign("size", func(&["a"], body))],
            Some(Expr::Concat {
                lhs: Box::new(Expr::FuncCall { name: "size".into(), args: vec![Expr::num(50)] }),
                rhs: Box::new(Expr::FuncCall { name: "size".into(), args: vec![Expr::num(5)] }),
            }),
        );
        assert_eq!(run(&e).await.unwrap(), Value::from("bigsmall"));
    }

    #[tokio::test]
    async fn test_copy_on_write_between_locals() {
        let e = Expr::main(
            vec![
                Expr::assign("a", Expr::Dictionary { entries: vec![("k".into(), Expr::num(1))] }),
                Expr::assign("b", Expr::local("a")),
                Expr::Assign {
                    name: "b".into(),
                    selectors: vec![Selector::Key(Expr::str("k"))],
                    value: Box::new(Expr::num(2)),
                },
            ],
            Some(Expr::LocalVar { name: "a".into(), selectors: vec![Expr::str("k")] }),
        );
        assert_eq!(run(&e).await.unwrap(), n(1));
    }

    #[tokio::test]
    async fn test_frozen_object_refuses_writes() {
        let e = Expr::statements(vec![
            Expr::assign("a", Expr::Array { items: vec![] }),
            Expr::Freeze { name: "a".into() },
            Expr::Assign { name: "a".into(), selectors: vec![Selector::Append], value: Box::new(Expr::num(1)) },
        ]);
        assert!(matches!(run(&e).await, Err(EvalError::Failed(_))));
    }

    #[tokio::test]
    async fn test_iteration() {
        let arr = Expr::Array { items: vec![Expr::num(1), Expr::num(2), Expr::num(3)] };
        let map = Expr::Iterate {
            kind: IterKind::Map,
            collection: Box::new(arr.clone()),
            count: 3,
            func: Box::new(func(&["x"], Expr::arith(ArithOp::Mul, Expr::local("x"), Expr::num(10)))),
            initial: None,
        };
        assert_eq!(run(&map).await.unwrap().to_json(), json!([10, 20, 30]));

        let reduce = Expr::Iterate {
            kind: IterKind::Reduce,
            collection: Box::new(arr.clone()),
            count: 5,
            func: Box::new(func(&["acc", "x"], Expr::arith(ArithOp::Add, Expr::local("acc"), Expr::local("x")))),
            initial: Some(Box::new(Expr::num(0))),
        };
        assert_eq!(run(&reduce).await.unwrap(), n(6));

        let too_many = Expr::Iterate {
            kind: IterKind::Foreach,
            collection: Box::new(arr),
            count: 2,
            func: Box::new(func(&["x"], Expr::local("x"))),
            initial: None,
        };
        assert!(run(&too_many).await.is_err());
    }

    #[tokio::test]
    async fn test_state_var_assignment_modes() {
        let assign = Expr::StateVarAssign {
            name: Box::new(Expr::str("count")),
            op: AssignOp::Add,
            value: Box::new(Expr::num(1)),
        };
        let ledger = InMemoryLedgerReader::default();
        assert!(run_with(&ledger, EvalMode::default(), &assign).await.is_err());

        let config = AaConfig::default();
        let mut state = context();
        let mut inv = invocation();
        let mode = EvalMode { is_getter: false, state_var_assignment_allowed: true };
        let mut ev = Evaluator::new(&ledger, &config, &mut state, &mut inv, mode);
        ev.evaluate(&Expr::statements(vec![assign.clone(), assign])).await.unwrap();
        let entry = &state.state_vars[&addr('A')]["count"];
        assert_eq!(entry.value, n(2));
        assert_eq!(entry.old_value, Value::Bool(false));
        assert!(entry.updated);
    }

    #[tokio::test]
    async fn test_state_var_true_becomes_one() {
        let ledger = InMemoryLedgerReader::default();
        let config = AaConfig::default();
        let mut state = context();
        let mut inv = invocation();
        let mode = EvalMode { is_getter: false, state_var_assignment_allowed: true };
        let mut ev = Evaluator::new(&ledger, &config, &mut state, &mut inv, mode);
        let e = Expr::StateVarAssign {
            name: Box::new(Expr::str("flag")),
            op: AssignOp::Assign,
            value: Box::new(Expr::boolean(true)),
        };
        ev.evaluate(&e).await.unwrap();
        assert_eq!(state.state_vars[&addr('A')]["flag"].value, n(1));
    }

    #[tokio::test]
    async fn test_logs_and_response_vars() {
        let ledger = InMemoryLedgerReader::default();
        let config = AaConfig::default();
        let mut state = context();
        let mut inv = invocation();
        let mut ev = Evaluator::new(&ledger, &config, &mut state, &mut inv, EvalMode::default());
        let e = Expr::statements(vec![
            Expr::Log { args: vec![Expr::str("x ="), Expr::num(5)] },
            Expr::ResponseVarAssign { name: Box::new(Expr::str("message")), value: Box::new(Expr::str("hi")) },
        ]);
        ev.evaluate(&e).await.unwrap();
        assert_eq!(inv.logs, vec!["x = 5".to_string()]);
        assert_eq!(inv.response_vars["message"], Value::from("hi"));
    }

    #[tokio::test]
    async fn test_rounding() {
        let e = Expr::Rounding {
            func: RoundFunc::Round,
            arg: Box::new(Expr::Number { value: "2.345".parse().unwrap() }),
            places: Some(Box::new(Expr::num(2))),
        };
        assert_eq!(run(&e).await.unwrap(), Value::Number("2.34".parse().unwrap()));
    }
}
