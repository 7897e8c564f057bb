//! # Static Formula Validator
//!
//! Walks a formula once, before it is ever run, and computes its cost:
//! every node adds one operation, expensive nodes add complexity. Both
//! totals are capped. Along the way it enforces the scoping rules the
//! evaluator relies on (single assignment, frozen locals, no shadowing by
//! function arguments) and the placement rules for state, response and
//! bounce constructs.
//!
//! The validator never touches the ledger. Remote getter costs come from a
//! [`GetterLookup`].

pub mod locals;

use crate::config::AaConfig;
use crate::domain::ast::{ArithOp, Builtin, ContextField, Expr, IterKind, MathFunc, SearchParam, Selector};
use crate::domain::template::{AaDefinitionKind, Template, TemplateKey};
use crate::errors::ValidationError;
use crate::ports::outbound::GetterLookup;
use locals::{Locals, VarKind};
use serde::{Deserialize, Serialize};
use shared_types::{is_valid_address, Address, Asset, Mci};
use std::collections::{BTreeMap, BTreeSet};

/// Static cost of a formula or function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Complexity {
    /// Weighted count of expensive operations.
    pub complexity: u32,
    /// Number of syntax nodes.
    pub count_ops: u32,
}

/// What kind of formula is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorOptions {
    /// Runs inside an AA (state vars, trigger, `this_address` available).
    pub is_aa: bool,
    /// Part of a getters block.
    pub is_getter: bool,
    /// Must be a statement list with no trailing expression.
    pub statements_only: bool,
    /// State variables may be assigned.
    pub state_var_assignment_allowed: bool,
    /// Height used for feature activation.
    pub mci: Mci,
}

impl ValidatorOptions {
    /// Options for an expression formula inside an AA.
    #[must_use]
    pub fn aa(mci: Mci) -> Self {
        Self {
            is_aa: true,
            is_getter: false,
            statements_only: false,
            state_var_assignment_allowed: false,
            mci,
        }
    }
}

/// Result of validating a whole AA definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionInfo {
    /// Cost of init plus messages.
    pub complexity: Complexity,
    /// Cost of each exported getter.
    pub getters: BTreeMap<String, Complexity>,
}

const DATA_FEED_PARAMS: &[&str] =
    &["oracles", "feed_name", "feed_value", "min_mci", "ifseveral", "ifnone", "what", "type"];
const ATTESTATION_PARAMS: &[&str] = &["attestors", "address", "ifseveral", "ifnone", "type"];
const ASSET_FIELDS: &[&str] = &[
    "cap",
    "is_private",
    "is_transferrable",
    "auto_destroy",
    "fixed_denominations",
    "issued_by_definer_only",
    "cosigned_by_definer",
    "spender_attested",
    "definer_address",
    "exists",
];

// =============================================================================
// PUBLIC ENTRY POINTS
// =============================================================================

/// Validates a single formula.
///
/// # Errors
///
/// Returns the first rule the formula breaks.
pub fn validate_formula(
    expr: &Expr,
    opts: ValidatorOptions,
    config: &AaConfig,
    getters: &dyn GetterLookup,
) -> Result<Complexity, ValidationError> {
    let mut walker = Walker::new(config, getters, opts);
    walker.top_level(expr)?;
    Ok(walker.totals())
}

/// Validates a getters block and returns the cost of each getter.
///
/// # Errors
///
/// Returns the first rule the block breaks.
pub fn validate_getters(
    getters: &Expr,
    mci: Mci,
    config: &AaConfig,
    lookup: &dyn GetterLookup,
) -> Result<BTreeMap<String, Complexity>, ValidationError> {
    let mut walker = Walker::new(config, lookup, getter_options(mci));
    walker.getters_block(getters)
}

/// Validates an AA definition: bounce fees, getters, init and messages.
///
/// Parameterized definitions carry no code of their own; only the base
/// address is checked.
///
/// # Errors
///
/// Returns the first rule the definition breaks.
pub fn validate_aa_definition(
    definition: &AaDefinitionKind,
    mci: Mci,
    config: &AaConfig,
    lookup: &dyn GetterLookup,
) -> Result<DefinitionInfo, ValidationError> {
    let def = match definition {
        AaDefinitionKind::Parameterized { base_aa, .. } => {
            if !base_aa.is_valid() {
                return Err(ValidationError::Invalid(format!("bad base AA {base_aa}")));
            }
            return Ok(DefinitionInfo::default());
        }
        AaDefinitionKind::Plain(def) => def,
    };

    if let Some(fees) = &def.bounce_fees {
        for (asset, amount) in fees {
            if !asset.is_base() && Asset::parse(asset.as_str()).is_none() {
                return Err(ValidationError::Invalid(format!("bad bounce fee asset {asset}")));
            }
            if *amount < 0 {
                return Err(ValidationError::Invalid(format!("negative bounce fee in {asset}")));
            }
        }
        if let Some(base) = fees.get(&Asset::base()) {
            if *base < config.min_bytes_bounce_fee {
                return Err(ValidationError::Invalid(format!(
                    "bounce fee {base} below minimum {}",
                    config.min_bytes_bounce_fee
                )));
            }
        }
    }

    let mut walker = Walker::new(config, lookup, getter_options(mci));
    let getters = match &def.getters {
        Some(g) => walker.getters_block(g)?,
        None => BTreeMap::new(),
    };

    walker.opts = ValidatorOptions { statements_only: true, ..ValidatorOptions::aa(mci) };
    if let Some(init) = &def.init {
        walker.top_level(init)?;
    }
    walker.opts = ValidatorOptions::aa(mci);
    walker.template(&def.messages)?;

    Ok(DefinitionInfo { complexity: walker.totals(), getters })
}

fn getter_options(mci: Mci) -> ValidatorOptions {
    ValidatorOptions {
        is_aa: true,
        is_getter: true,
        statements_only: true,
        state_var_assignment_allowed: false,
        mci,
    }
}

// =============================================================================
// WALKER
// =============================================================================

struct Walker<'a> {
    config: &'a AaConfig,
    getters: &'a dyn GetterLookup,
    opts: ValidatorOptions,
    locals: Locals,
    complexity: u32,
    count_ops: u32,
    in_function: bool,
}

impl<'a> Walker<'a> {
    fn new(config: &'a AaConfig, getters: &'a dyn GetterLookup, opts: ValidatorOptions) -> Self {
        Self {
            config,
            getters,
            opts,
            locals: Locals::default(),
            complexity: 0,
            count_ops: 0,
            in_function: false,
        }
    }

    fn totals(&self) -> Complexity {
        Complexity { complexity: self.complexity, count_ops: self.count_ops }
    }

    fn op(&mut self) -> Result<(), ValidationError> {
        self.add_ops(1)
    }

    fn add_ops(&mut self, n: u32) -> Result<(), ValidationError> {
        self.count_ops = self.count_ops.saturating_add(n);
        if self.count_ops > self.config.max_ops {
            return Err(ValidationError::TooManyOps { count: self.count_ops, max: self.config.max_ops });
        }
        Ok(())
    }

    fn complex(&mut self, n: u32) -> Result<(), ValidationError> {
        self.complexity = self.complexity.saturating_add(n);
        if self.complexity > self.config.max_complexity {
            return Err(ValidationError::ComplexityExceeded {
                complexity: self.complexity,
                max: self.config.max_complexity,
            });
        }
        Ok(())
    }

    fn add(&mut self, c: Complexity) -> Result<(), ValidationError> {
        self.complex(c.complexity)?;
        self.add_ops(c.count_ops)
    }

    fn gate(&self, feature: &str) -> Result<(), ValidationError> {
        if self.config.aa2_active(self.opts.mci) {
            Ok(())
        } else {
            Err(ValidationError::NotActivated(feature.to_string()))
        }
    }

    fn require(&self, allowed: bool, what: &str) -> Result<(), ValidationError> {
        if allowed {
            Ok(())
        } else {
            Err(ValidationError::Forbidden(what.to_string()))
        }
    }

    fn top_level(&mut self, expr: &Expr) -> Result<(), ValidationError> {
        if self.opts.statements_only {
            match expr {
                Expr::Main { result: None, .. } => {}
                Expr::Main { result: Some(_), .. } => {
                    return Err(ValidationError::NotAStatement(
                        "statements-only formula ends in an expression".into(),
                    ))
                }
                other if !other.is_statement() => {
                    return Err(ValidationError::NotAStatement(format!("{other:?}")))
                }
                _ => {}
            }
        }
        self.expr(expr)
    }

    fn getters_block(&mut self, block: &Expr) -> Result<BTreeMap<String, Complexity>, ValidationError> {
        let Expr::Main { statements, result: None } = block else {
            return Err(ValidationError::Invalid("getters must be a statement list".into()));
        };
        let only_functions = statements.iter().all(|s| {
            matches!(s, Expr::Assign { selectors, value, .. }
                if selectors.is_empty() && matches!(**value, Expr::FuncDeclaration { .. }))
        });
        if !only_functions {
            return Err(ValidationError::Invalid("getters may contain only function declarations".into()));
        }
        self.expr(block)?;
        Ok(self.locals.functions().map(|(name, c)| (name.clone(), c)).collect())
    }

    // -------------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn expr(&mut self, e: &Expr) -> Result<(), ValidationError> {
        self.op()?;
        match e {
            Expr::Number { .. } | Expr::Bool { .. } | Expr::Pi | Expr::E => Ok(()),
            Expr::Str { value } => {
                if value.len() > self.config.max_aa_string_length {
                    return Err(ValidationError::Invalid("string literal too long".into()));
                }
                Ok(())
            }
            Expr::Array { items } => self.all(items),
            Expr::Dictionary { entries } => {
                let mut keys = BTreeSet::new();
                for (key, value) in entries {
                    if !keys.insert(key) {
                        return Err(ValidationError::Invalid(format!("duplicate key {key}")));
                    }
                    self.expr(value)?;
                }
                Ok(())
            }

            Expr::Arith { op, lhs, rhs } => {
                if *op == ArithOp::Pow && !matches!(&**rhs, Expr::Number { value } if value.is_integer()) {
                    self.complex(1)?;
                }
                self.expr(lhs)?;
                self.expr(rhs)
            }
            Expr::Negate { expr } | Expr::Not { expr } => self.expr(expr),
            Expr::Concat { lhs, rhs } | Expr::Compare { lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.expr(rhs)
            }
            Expr::And { args } | Expr::Or { args } | Expr::MinMax { args, .. } => {
                if args.is_empty() {
                    return Err(ValidationError::Invalid("empty argument list".into()));
                }
                self.all(args)
            }
            Expr::Ternary { cond, if_true, if_false } => {
                self.expr(cond)?;
                self.expr(if_true)?;
                self.expr(if_false)
            }
            Expr::Otherwise { value, fallback } => {
                self.expr(value)?;
                self.expr(fallback)
            }
            Expr::Math { func, arg } => {
                if matches!(func, MathFunc::Sqrt | MathFunc::Ln) {
                    self.complex(1)?;
                }
                self.expr(arg)
            }
            Expr::Rounding { arg, places, .. } => {
                if let Some(places) = places {
                    if let Expr::Number { value } = &**places {
                        let ok = value.to_i64().is_some_and(|p| (0..=15).contains(&p));
                        if !ok {
                            return Err(ValidationError::Invalid(format!("bad decimal places {value}")));
                        }
                    }
                    self.expr(places)?;
                }
                self.expr(arg)
            }
            Expr::Hypot { a, b } => {
                self.expr(a)?;
                self.expr(b)
            }

            Expr::LocalVar { name, selectors } => {
                if let VarKind::Func { .. } = self.locals.read(name)?.kind {
                    return Err(ValidationError::IsAFunction(name.clone()));
                }
                self.all(selectors)
            }
            Expr::Assign { name, selectors, value } => self.assignment(name, selectors, value),
            Expr::Freeze { name } => {
                self.gate("freeze")?;
                self.locals.freeze(name)
            }
            Expr::Delete { name, selectors, key } => {
                self.gate("delete")?;
                self.locals.check_mutable(name)?;
                self.all(selectors)?;
                self.expr(key)
            }
            Expr::StateVar { address, name } => {
                self.require(self.opts.is_aa, "state var read outside an AA")?;
                if let Some(address) = address {
                    self.literal_address(address)?;
                    self.expr(address)?;
                }
                self.expr(name)
            }
            Expr::StateVarAssign { name, value, .. } => {
                self.require(
                    self.opts.state_var_assignment_allowed && !self.in_function,
                    "state var assignment",
                )?;
                if let Expr::Str { value: n } = &**name {
                    if n.is_empty() || n.len() > self.config.max_state_var_name_length {
                        return Err(ValidationError::Invalid(format!("bad state var name {n}")));
                    }
                }
                self.expr(name)?;
                self.expr(value)
            }
            Expr::ResponseVarAssign { name, value } => {
                self.require(
                    self.opts.is_aa && !self.opts.is_getter && !self.in_function,
                    "response var assignment",
                )?;
                self.expr(name)?;
                self.expr(value)
            }
            Expr::WithSelectors { expr, selectors } => {
                self.expr(expr)?;
                self.all(selectors)
            }

            Expr::Trigger { .. } => self.require(self.opts.is_aa && !self.opts.is_getter, "trigger"),
            Expr::TriggerOutput { asset } => {
                self.require(self.opts.is_aa && !self.opts.is_getter, "trigger")?;
                self.literal_asset(asset)?;
                self.expr(asset)
            }
            Expr::Context { field } => self.context(*field),

            Expr::DataFeed { params } => {
                self.complex(1)?;
                self.search_params(params, DATA_FEED_PARAMS, &["oracles", "feed_name"], true)
            }
            Expr::InDataFeed { params } => {
                self.complex(1)?;
                if params.iter().any(|p| matches!(p.name.as_str(), "ifnone" | "ifseveral" | "what" | "type")) {
                    return Err(ValidationError::BadSearchParams(
                        "in_data_feed accepts only oracles, feed_name, feed_value and min_mci".into(),
                    ));
                }
                self.search_params(params, DATA_FEED_PARAMS, &["oracles", "feed_name", "feed_value"], true)
            }
            Expr::Attestation { params, field } => {
                self.complex(1)?;
                self.search_params(params, ATTESTATION_PARAMS, &["attestors", "address"], false)?;
                if let Some(field) = field {
                    self.expr(field)?;
                }
                Ok(())
            }
            Expr::Balance { address, asset } => {
                match address {
                    None => self.require(self.opts.is_aa, "own balance outside an AA")?,
                    Some(address) => {
                        self.complex(1)?;
                        self.literal_address(address)?;
                        self.expr(address)?;
                    }
                }
                self.literal_asset(asset)?;
                self.expr(asset)
            }
            Expr::UnitLookup { unit: inner } | Expr::Definition { address: inner } | Expr::IsAa { address: inner } => {
                self.complex(1)?;
                self.expr(inner)
            }
            Expr::AssetInfo { asset, field } => {
                self.complex(1)?;
                if let Expr::Str { value } = &**field {
                    if !ASSET_FIELDS.contains(&value.as_str()) {
                        return Err(ValidationError::Invalid(format!("unknown asset field {value}")));
                    }
                }
                self.expr(asset)?;
                self.expr(field)
            }

            Expr::Call { func, args } => self.builtin(*func, args),
            Expr::FuncDeclaration { .. } => Err(ValidationError::Invalid(
                "function declaration must be assigned to a local".into(),
            )),
            Expr::FuncCall { name, args } => {
                let info = self.locals.callable(name)?;
                let VarKind::Func { complexity, arity } = info.kind else {
                    return Err(ValidationError::NotAFunction(name.clone()));
                };
                if args.len() > arity {
                    return Err(ValidationError::WrongArity { func: name.clone(), got: args.len(), min: 0, max: arity });
                }
                self.add(complexity)?;
                self.all(args)
            }
            Expr::RemoteCall { aa, max_complexity, getter, args } => {
                self.gate("remote getter call")?;
                self.complex(1)?;
                let callee = match &**aa {
                    Expr::Str { value } => {
                        if !is_valid_address(value) {
                            return Err(ValidationError::Invalid(format!("bad AA address {value}")));
                        }
                        self.getters.getter_complexity(&Address::new(value.clone()), getter)
                    }
                    _ => None,
                };
                match (callee, max_complexity) {
                    (Some(c), Some(declared)) if c.complexity > *declared => {
                        return Err(ValidationError::ComplexityExceeded { complexity: c.complexity, max: *declared });
                    }
                    (Some(c), _) => self.add(c)?,
                    (None, Some(m)) => self.complex(*m)?,
                    (None, None) => {
                        if let Expr::Str { value } = &**aa {
                            return Err(ValidationError::UnknownGetter { aa: value.clone(), getter: getter.clone() });
                        }
                        return Err(ValidationError::Invalid(
                            "remote call to a computed AA needs a declared max complexity".into(),
                        ));
                    }
                }
                self.expr(aa)?;
                self.all(args)
            }
            Expr::Iterate { kind, collection, count, func, initial } => {
                self.gate(match kind {
                    IterKind::Map => "map",
                    IterKind::Filter => "filter",
                    IterKind::Reduce => "reduce",
                    IterKind::Foreach => "foreach",
                })?;
                if *count == 0 || *count > self.config.max_iterations {
                    return Err(ValidationError::Invalid(format!(
                        "iteration count {count} outside 1..={}",
                        self.config.max_iterations
                    )));
                }
                match (kind, initial) {
                    (IterKind::Reduce, None) => {
                        return Err(ValidationError::Invalid("reduce needs an initial value".into()))
                    }
                    (IterKind::Reduce, Some(_)) | (_, None) => {}
                    (_, Some(_)) => return Err(ValidationError::Invalid("only reduce takes an initial value".into())),
                }
                let max_args = if *kind == IterKind::Reduce { 3 } else { 2 };
                self.expr(collection)?;
                if let Some(initial) = initial {
                    self.expr(initial)?;
                }
                let callback = self.callback(func, max_args)?;
                self.complex(callback.complexity.saturating_mul(*count))?;
                self.add_ops(callback.count_ops.saturating_mul(*count))?;
                self.complex(1)
            }

            Expr::Main { statements, result } => {
                for statement in statements {
                    if !statement.is_statement() {
                        return Err(ValidationError::NotAStatement(format!("{statement:?}")));
                    }
                    self.expr(statement)?;
                }
                match result {
                    Some(result) => self.expr(result),
                    None => Ok(()),
                }
            }
            Expr::IfElse { cond, then, otherwise } => {
                self.expr(cond)?;
                let before = self.locals.clone();
                let then_locals = self.branch(&before, then)?;
                let else_locals = match otherwise {
                    Some(otherwise) => self.branch(&before, otherwise)?,
                    None => before.clone(),
                };
                self.locals = Locals::join(&before, vec![then_locals, else_locals]);
                Ok(())
            }
            Expr::Return { value } => match value {
                Some(value) => self.expr(value),
                None => Ok(()),
            },
            Expr::Bounce { message } => {
                self.require(!self.opts.is_getter, "bounce in a getter")?;
                self.expr(message)
            }
            Expr::Require { cond, message } => {
                self.require(!self.opts.is_getter, "require in a getter")?;
                self.expr(cond)?;
                self.expr(message)
            }
            Expr::Log { args } => self.all(args),
        }
    }

    fn all(&mut self, exprs: &[Expr]) -> Result<(), ValidationError> {
        exprs.iter().try_for_each(|e| self.expr(e))
    }

    fn branch(&mut self, before: &Locals, body: &Expr) -> Result<Locals, ValidationError> {
        let mut scope = before.clone();
        scope.enter_branch();
        self.locals = scope;
        self.expr(body)?;
        Ok(std::mem::replace(&mut self.locals, before.clone()))
    }

    fn assignment(&mut self, name: &str, selectors: &[Selector], value: &Expr) -> Result<(), ValidationError> {
        if selectors.is_empty() {
            if let Expr::FuncDeclaration { args, body } = value {
                self.op()?;
                let complexity = self.function(args, body)?;
                return self.locals.assign(name, VarKind::Func { complexity, arity: args.len() });
            }
            self.expr(value)?;
            return self.locals.assign(name, VarKind::Data);
        }
        self.locals.check_mutable(name)?;
        for selector in selectors {
            if let Selector::Key(key) = selector {
                self.expr(key)?;
            }
        }
        if let Expr::FuncDeclaration { .. } = value {
            return Err(ValidationError::Invalid("function stored inside an object".into()));
        }
        self.expr(value)
    }

    /// Validates a function body in its own scope and returns its cost.
    fn function(&mut self, args: &[String], body: &Expr) -> Result<Complexity, ValidationError> {
        let mut sub = Walker {
            config: self.config,
            getters: self.getters,
            opts: ValidatorOptions { statements_only: false, ..self.opts },
            locals: self.locals.for_function(args)?,
            complexity: 0,
            count_ops: 0,
            in_function: true,
        };
        sub.expr(body)?;
        Ok(sub.totals())
    }

    fn callback(&mut self, func: &Expr, max_args: usize) -> Result<Complexity, ValidationError> {
        match func {
            Expr::FuncDeclaration { args, body } => {
                if args.len() > max_args {
                    return Err(ValidationError::WrongArity {
                        func: "callback".into(),
                        got: args.len(),
                        min: 0,
                        max: max_args,
                    });
                }
                self.op()?;
                self.function(args, body)
            }
            Expr::LocalVar { name, selectors } if selectors.is_empty() => match self.locals.callable(name)?.kind {
                VarKind::Func { complexity, .. } => Ok(complexity),
                VarKind::Data => Err(ValidationError::NotAFunction(name.clone())),
            },
            _ => Err(ValidationError::Invalid("iteration callback must be a function".into())),
        }
    }

    fn context(&mut self, field: ContextField) -> Result<(), ValidationError> {
        match field {
            ContextField::Mci | ContextField::Timestamp | ContextField::McUnit => Ok(()),
            ContextField::ThisAddress | ContextField::StorageSize | ContextField::Params => {
                self.require(self.opts.is_aa, "AA context outside an AA")
            }
            ContextField::NumberOfResponses | ContextField::PreviousAaResponses => {
                self.require(self.opts.is_aa && !self.opts.is_getter, "cascade context in a getter")
            }
            ContextField::ResponseUnit => self.require(
                self.opts.state_var_assignment_allowed,
                "response_unit outside the state message",
            ),
        }
    }

    fn builtin(&mut self, func: Builtin, args: &[Expr]) -> Result<(), ValidationError> {
        let (min, max) = func.arity();
        if args.len() < min || args.len() > max {
            return Err(ValidationError::WrongArity { func: func.name(), got: args.len(), min, max });
        }
        if func.requires_upgrade() {
            self.gate(&func.name())?;
        }
        if matches!(
            func,
            Builtin::Sha256
                | Builtin::Chash160
                | Builtin::IsValidSig
                | Builtin::IsValidMerkleProof
                | Builtin::IsValidSignedPackage
                | Builtin::JsonParse
                | Builtin::NumberFromSeed
        ) {
            self.complex(1)?;
        }
        if func == Builtin::Sha256 {
            if let Some(Expr::Str { value }) = args.get(1) {
                if value != "hex" {
                    return Err(ValidationError::Invalid(format!("unsupported sha256 format {value}")));
                }
            }
        }
        self.all(args)
    }

    fn search_params(
        &mut self,
        params: &[SearchParam],
        allowed: &[&str],
        required: &[&str],
        feed: bool,
    ) -> Result<(), ValidationError> {
        let mut seen = BTreeSet::new();
        for p in params {
            let name = p.name.as_str();
            if !allowed.contains(&name) {
                return Err(ValidationError::BadSearchParams(format!("unknown parameter {name}")));
            }
            if !seen.insert(name) {
                return Err(ValidationError::BadSearchParams(format!("duplicate parameter {name}")));
            }
            if p.op != crate::domain::ast::CmpOp::Eq && !(feed && name == "feed_value") {
                return Err(ValidationError::BadSearchParams(format!("{name} only takes ==")));
            }
            if let Expr::Str { value } = &p.value {
                let ok = match name {
                    "oracles" | "attestors" => value.split(':').all(is_valid_address),
                    "address" => is_valid_address(value),
                    "ifseveral" => matches!(value.as_str(), "last" | "abort"),
                    "what" => matches!(value.as_str(), "value" | "unit"),
                    "type" => matches!(value.as_str(), "auto" | "string"),
                    _ => true,
                };
                if !ok {
                    return Err(ValidationError::BadSearchParams(format!("bad {name}: {value}")));
                }
            }
            self.expr(&p.value)?;
        }
        if let Some(missing) = required.iter().find(|r| !seen.contains(**r)) {
            return Err(ValidationError::BadSearchParams(format!("missing {missing}")));
        }
        Ok(())
    }

    fn literal_address(&self, e: &Expr) -> Result<(), ValidationError> {
        match e {
            Expr::Str { value } if !is_valid_address(value) => {
                Err(ValidationError::Invalid(format!("bad address {value}")))
            }
            _ => Ok(()),
        }
    }

    fn literal_asset(&self, e: &Expr) -> Result<(), ValidationError> {
        match e {
            Expr::Str { value } if Asset::parse(value).is_none() => {
                Err(ValidationError::Invalid(format!("bad asset {value}")))
            }
            _ => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Templates
    // -------------------------------------------------------------------------

    fn template(&mut self, t: &Template) -> Result<(), ValidationError> {
        if let Some(state) = t.as_state_message() {
            let Some(state) = state else {
                return Err(ValidationError::Invalid("state message without a state formula".into()));
            };
            let saved = self.opts;
            self.opts = ValidatorOptions {
                statements_only: true,
                state_var_assignment_allowed: true,
                ..saved
            };
            let result = self.top_level(state);
            self.opts = saved;
            return result;
        }
        match t {
            Template::Literal { .. } => Ok(()),
            Template::Formula { expr } => self.expr(expr),
            Template::Array { items } => items.iter().try_for_each(|item| self.template(item)),
            Template::Object { cond, init, fields } => {
                let before = self.locals.clone();
                if let Some(cond) = cond {
                    self.expr(cond)?;
                    let mut scope = self.locals.clone();
                    scope.enter_branch();
                    self.locals = scope;
                }
                if let Some(init) = init {
                    self.statements(init)?;
                }
                for field in fields {
                    if let TemplateKey::Formula(key) = &field.key {
                        self.expr(key)?;
                    }
                    self.template(&field.value)?;
                }
                if cond.is_some() {
                    let inner = std::mem::take(&mut self.locals);
                    self.locals = Locals::join(&before, vec![inner, before.clone()]);
                }
                Ok(())
            }
            Template::Cases { cases } => {
                if cases.is_empty() {
                    return Err(ValidationError::Invalid("empty cases".into()));
                }
                let before = self.locals.clone();
                let mut outcomes = Vec::with_capacity(cases.len() + 1);
                for case in cases {
                    if let Some(cond) = &case.cond {
                        self.expr(cond)?;
                    }
                    let mut scope = self.locals.clone();
                    scope.enter_branch();
                    self.locals = scope;
                    if let Some(init) = &case.init {
                        self.statements(init)?;
                    }
                    self.template(&case.body)?;
                    outcomes.push(std::mem::replace(&mut self.locals, before.clone()));
                }
                if cases.last().is_some_and(|c| c.cond.is_some()) {
                    outcomes.push(before.clone());
                }
                self.locals = Locals::join(&before, outcomes);
                Ok(())
            }
        }
    }

    fn statements(&mut self, init: &Expr) -> Result<(), ValidationError> {
        let saved = self.opts;
        self.opts.statements_only = true;
        let result = self.top_level(init);
        self.opts = saved;
        result
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ast::{AssignOp, CmpOp, TriggerField};
    use crate::domain::template::AaDefinition;
    use crate::adapters::InMemoryLedgerReader;
    use crate::domain::decimal::Decimal;
    use crate::domain::template::TemplateField;
    use crate::domain::value::Value;
    use crate::errors::EvalError;
    use crate::evaluator::tests::{context, invocation, run_with};
    use crate::evaluator::{EvalMode, Evaluator};
    use crate::ports::outbound::NoGetters;
    use serde_json::json;

    fn aa_opts() -> ValidatorOptions {
        ValidatorOptions::aa(1_000)
    }

    fn check(e: &Expr) -> Result<Complexity, ValidationError> {
        validate_formula(e, aa_opts(), &AaConfig::default(), &NoGetters)
    }

    fn sqrt(e: Expr) -> Expr {
        Expr::Math { func: MathFunc::Sqrt, arg: Box::new(e) }
    }

    fn func(args: &[&str], body: Expr) -> Expr {
        Expr::FuncDeclaration { args: args.iter().map(|a| (*a).to_string()).collect(), body: Box::new(body) }
    }

    fn if_else(cond: Expr, then: Expr, otherwise: Option<Expr>) -> Expr {
        Expr::IfElse { cond: Box::new(cond), then: Box::new(then), otherwise: otherwise.map(Box::new) }
    }

    #[test]
    fn test_complexity_of_arithmetic() {
        let e = Expr::arith(ArithOp::Add, sqrt(Expr::num(4)), Expr::num(1));
        let c = check(&e).unwrap();
        assert_eq!(c.complexity, 1);
        assert_eq!(c.count_ops, 4);

        let const_pow = Expr::arith(ArithOp::Pow, Expr::num(2), Expr::num(10));
        assert_eq!(check(&const_pow).unwrap().complexity, 0);
        let frac_pow = Expr::arith(ArithOp::Pow, Expr::num(2), Expr::Number { value: "0.5".parse().unwrap() });
        assert_eq!(check(&frac_pow).unwrap().complexity, 1);
    }

    #[test]
    fn test_uninitialized_and_reassigned_locals() {
        assert_eq!(check(&Expr::local("x")), Err(ValidationError::Uninitialized("x".into())));

        let twice = Expr::statements(vec![Expr::assign("x", Expr::num(1)), Expr::assign("x", Expr::num(2))]);
        assert_eq!(check(&twice), Err(ValidationError::Reassignment("x".into())));

        let self_ref = Expr::assign("x", Expr::arith(ArithOp::Add, Expr::local("x"), Expr::num(1)));
        assert!(check(&self_ref).is_err());
    }

    #[test]
    fn test_branch_assignment_rules() {
        // assigned in both branches: readable afterwards
        let both = Expr::main(
            vec![if_else(
                Expr::boolean(true),
                Expr::assign("x", Expr::num(1)),
                Some(Expr::assign("x", Expr::num(2))),
            )],
            Some(Expr::local("x")),
        );
        assert!(check(&both).is_ok());

        // assigned in one branch only, then reassigned unconditionally
        let partial = Expr::statements(vec![
            if_else(Expr::boolean(true), Expr::assign("x", Expr::num(1)), None),
            Expr::assign("x", Expr::num(2)),
        ]);
        assert_eq!(check(&partial), Err(ValidationError::Reassignment("x".into())));

        // ... or in a later branch: fine
        let later_branch = Expr::statements(vec![
            if_else(Expr::boolean(true), Expr::assign("x", Expr::num(1)), None),
            if_else(Expr::boolean(false), Expr::assign("x", Expr::num(2)), None),
        ]);
        assert!(check(&later_branch).is_ok());
    }

    #[test]
    fn test_frozen_local_cannot_be_mutated() {
        let e = Expr::statements(vec![
            Expr::assign("o", Expr::Dictionary { entries: vec![] }),
            Expr::Freeze { name: "o".into() },
            Expr::Assign {
                name: "o".into(),
                selectors: vec![Selector::Key(Expr::str("a"))],
                value: Box::new(Expr::num(1)),
            },
        ]);
        assert_eq!(check(&e), Err(ValidationError::Frozen("o".into())));
    }

    #[test]
    fn test_function_cost_charged_per_call() {
        let e = Expr::main(
            vec![Expr::assign("f", func(&["a"], sqrt(Expr::local("a"))))],
            Some(Expr::arith(
                ArithOp::Add,
                Expr::FuncCall { name: "f".into(), args: vec![Expr::num(1)] },
                Expr::FuncCall { name: "f".into(), args: vec![Expr::num(2)] },
            )),
        );
        assert_eq!(check(&e).unwrap().complexity, 2);
    }

    #[test]
    fn test_function_argument_may_not_shadow() {
        let e = Expr::statements(vec![
            Expr::assign("a", Expr::num(1)),
            Expr::assign("f", func(&["a"], Expr::local("a"))),
        ]);
        assert_eq!(check(&e), Err(ValidationError::Reassignment("a".into())));
    }

    #[test]
    fn test_iteration_multiplies_callback() {
        let e = Expr::Iterate {
            kind: IterKind::Map,
            collection: Box::new(Expr::local("arr")),
            count: 5,
            func: Box::new(func(&["x"], sqrt(Expr::local("x")))),
            initial: None,
        };
        let e = Expr::main(vec![Expr::assign("arr", Expr::Array { items: vec![] })], Some(e));
        assert_eq!(check(&e).unwrap().complexity, 6);
    }

    #[test]
    fn test_iteration_gated_by_upgrade() {
        let mut config = AaConfig::default();
        config.activation.aa2_mci = 5_000;
        let e = Expr::Iterate {
            kind: IterKind::Foreach,
            collection: Box::new(Expr::Array { items: vec![] }),
            count: 1,
            func: Box::new(func(&["x"], Expr::local("x"))),
            initial: None,
        };
        assert_eq!(
            validate_formula(&e, aa_opts(), &config, &NoGetters),
            Err(ValidationError::NotActivated("foreach".into()))
        );
    }

    #[test]
    fn test_complexity_cap() {
        let args = (0..101).map(|i| sqrt(Expr::num(i))).collect();
        let e = Expr::MinMax { func: crate::domain::ast::MinMaxFunc::Max, args };
        assert!(matches!(check(&e), Err(ValidationError::ComplexityExceeded { .. })));
    }

    #[test]
    fn test_op_cap() {
        let config = AaConfig { max_ops: 3, ..AaConfig::default() };
        let e = Expr::arith(ArithOp::Add, Expr::num(1), Expr::arith(ArithOp::Add, Expr::num(2), Expr::num(3)));
        assert!(matches!(
            validate_formula(&e, aa_opts(), &config, &NoGetters),
            Err(ValidationError::TooManyOps { .. })
        ));
    }

    #[test]
    fn test_state_assignment_placement() {
        let e = Expr::StateVarAssign {
            name: Box::new(Expr::str("x")),
            op: AssignOp::Assign,
            value: Box::new(Expr::num(1)),
        };
        assert!(matches!(check(&e), Err(ValidationError::Forbidden(_))));
        let opts = ValidatorOptions { state_var_assignment_allowed: true, ..aa_opts() };
        assert!(validate_formula(&e, opts, &AaConfig::default(), &NoGetters).is_ok());
    }

    #[test]
    fn test_data_feed_params() {
        let oracle = "A".repeat(32);
        let good = Expr::DataFeed {
            params: vec![
                SearchParam { name: "oracles".into(), op: CmpOp::Eq, value: Expr::str(&oracle) },
                SearchParam { name: "feed_name".into(), op: CmpOp::Eq, value: Expr::str("BTC_USD") },
            ],
        };
        assert_eq!(check(&good).unwrap().complexity, 1);

        let missing = Expr::DataFeed {
            params: vec![SearchParam { name: "oracles".into(), op: CmpOp::Eq, value: Expr::str(&oracle) }],
        };
        assert!(matches!(check(&missing), Err(ValidationError::BadSearchParams(_))));

        let bad_op = Expr::DataFeed {
            params: vec![
                SearchParam { name: "oracles".into(), op: CmpOp::Gt, value: Expr::str(&oracle) },
                SearchParam { name: "feed_name".into(), op: CmpOp::Eq, value: Expr::str("x") },
            ],
        };
        assert!(matches!(check(&bad_op), Err(ValidationError::BadSearchParams(_))));
    }

    #[test]
    fn test_remote_call_bounds() {
        let callee = Address::new("C".repeat(32));
        let mut lookup = BTreeMap::new();
        lookup.insert((callee.clone(), "price".to_string()), Complexity { complexity: 3, count_ops: 10 });

        let literal = Expr::RemoteCall {
            aa: Box::new(Expr::str(callee.as_str())),
            max_complexity: None,
            getter: "price".into(),
            args: vec![],
        };
        let c = validate_formula(&literal, aa_opts(), &AaConfig::default(), &lookup).unwrap();
        assert_eq!(c.complexity, 4);

        let unknown = Expr::RemoteCall {
            aa: Box::new(Expr::str(callee.as_str())),
            max_complexity: None,
            getter: "nope".into(),
            args: vec![],
        };
        assert!(matches!(
            validate_formula(&unknown, aa_opts(), &AaConfig::default(), &lookup),
            Err(ValidationError::UnknownGetter { .. })
        ));

        let dynamic = Expr::RemoteCall {
            aa: Box::new(Expr::Trigger { field: TriggerField::Address }),
            max_complexity: None,
            getter: "price".into(),
            args: vec![],
        };
        assert!(check(&dynamic).is_err());
        let bounded = Expr::RemoteCall {
            aa: Box::new(Expr::Trigger { field: TriggerField::Address }),
            max_complexity: Some(7),
            getter: "price".into(),
            args: vec![],
        };
        assert_eq!(check(&bounded).unwrap().complexity, 8);
    }

    #[test]
    fn test_definition_validation() {
        let getters = Expr::statements(vec![Expr::assign("double", func(&["x"], Expr::arith(
            ArithOp::Mul,
            Expr::local("x"),
            Expr::num(2),
        )))]);
        let messages = Template::Array {
            items: vec![Template::state_message(Expr::statements(vec![Expr::StateVarAssign {
                name: Box::new(Expr::str("n")),
                op: AssignOp::Add,
                value: Box::new(Expr::FuncCall { name: "double".into(), args: vec![Expr::num(1)] }),
            }]))],
        };
        let def = AaDefinitionKind::Plain(AaDefinition {
            getters: Some(getters),
            ..AaDefinition::with_messages(messages)
        });
        let info = validate_aa_definition(&def, 1, &AaConfig::default(), &NoGetters).unwrap();
        assert!(info.getters.contains_key("double"));

        let bad_getters = AaDefinitionKind::Plain(AaDefinition {
            getters: Some(Expr::statements(vec![Expr::assign("x", Expr::num(1))])),
            ..AaDefinition::with_messages(Template::Array { items: vec![] })
        });
        assert!(validate_aa_definition(&bad_getters, 1, &AaConfig::default(), &NoGetters).is_err());
    }

    #[test]
    fn test_bounce_fee_minimum() {
        let mut fees = BTreeMap::new();
        fees.insert(Asset::base(), 5_000);
        let def = AaDefinitionKind::Plain(AaDefinition {
            bounce_fees: Some(fees),
            ..AaDefinition::with_messages(Template::literal(json!([])))
        });
        assert!(validate_aa_definition(&def, 1, &AaConfig::default(), &NoGetters).is_err());
    }

    #[test]
    fn test_response_var_forbidden_in_getter() {
        let opts = ValidatorOptions { is_getter: true, ..aa_opts() };
        let e = Expr::ResponseVarAssign { name: Box::new(Expr::str("r")), value: Box::new(Expr::num(1)) };
        assert!(matches!(
            validate_formula(&e, opts, &AaConfig::default(), &NoGetters),
            Err(ValidationError::Forbidden(_))
        ));
    }

    // -------------------------------------------------------------------------
    // Accepted formulas evaluate
    // -------------------------------------------------------------------------

    async fn accept_and_run(e: &Expr) -> Result<Value, EvalError> {
        check(e).unwrap();
        run_with(&InMemoryLedgerReader::default(), EvalMode::default(), e).await
    }

    fn assign_if(cond: bool, name: &str, value: i64) -> Expr {
        if_else(Expr::boolean(cond), Expr::statements(vec![Expr::assign(name, Expr::num(value))]), None)
    }

    #[tokio::test]
    async fn test_maybe_assigned_local_reads_false_when_branch_skipped() {
        let skipped = Expr::main(vec![assign_if(false, "x", 1)], Some(Expr::local("x")));
        assert_eq!(accept_and_run(&skipped).await.unwrap(), Value::Bool(false));

        let taken = Expr::main(vec![assign_if(true, "x", 1)], Some(Expr::local("x")));
        assert_eq!(accept_and_run(&taken).await.unwrap(), Value::Number(Decimal::from(1i64)));

        let selected = Expr::main(
            vec![assign_if(false, "x", 1)],
            Some(Expr::LocalVar { name: "x".into(), selectors: vec![Expr::str("a")] }),
        );
        assert_eq!(accept_and_run(&selected).await.unwrap(), Value::Bool(false));
    }

    #[tokio::test]
    async fn test_maybe_assigned_local_assigned_again_in_later_branch() {
        let e = Expr::main(vec![assign_if(false, "x", 1), assign_if(true, "x", 2)], Some(Expr::local("x")));
        assert_eq!(accept_and_run(&e).await.unwrap(), Value::Number(Decimal::from(2i64)));
    }

    #[tokio::test]
    async fn test_local_assigned_on_both_branches() {
        for (cond, expected) in [(true, 1i64), (false, 2)] {
            let e = Expr::main(
                vec![if_else(
                    Expr::boolean(cond),
                    Expr::statements(vec![Expr::assign("x", Expr::num(1))]),
                    Some(Expr::statements(vec![Expr::assign("x", Expr::num(2))])),
                )],
                Some(Expr::arith(ArithOp::Add, Expr::local("x"), Expr::num(0))),
            );
            assert_eq!(accept_and_run(&e).await.unwrap(), Value::Number(Decimal::from(expected)));
        }
    }

    #[tokio::test]
    async fn test_frozen_locals_still_read() {
        let assigned = Expr::main(
            vec![Expr::assign("x", Expr::num(3)), Expr::Freeze { name: "x".into() }],
            Some(Expr::local("x")),
        );
        assert_eq!(accept_and_run(&assigned).await.unwrap(), Value::Number(Decimal::from(3i64)));

        let maybe = Expr::main(vec![assign_if(false, "x", 3), Expr::Freeze { name: "x".into() }], Some(Expr::local("x")));
        assert_eq!(accept_and_run(&maybe).await.unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_function_declared_in_one_branch_rejected() {
        let e = Expr::main(
            vec![if_else(
                Expr::boolean(false),
                Expr::statements(vec![Expr::assign("f", func(&[], Expr::num(1)))]),
                None,
            )],
            Some(Expr::FuncCall { name: "f".into(), args: vec![] }),
        );
        assert_eq!(check(&e), Err(ValidationError::Uninitialized("f".into())));
    }

    #[tokio::test]
    async fn test_template_local_from_skipped_object() {
        let skipped = Template::Object {
            cond: Some(Expr::boolean(false)),
            init: Some(Expr::statements(vec![Expr::assign("x", Expr::num(1))])),
            fields: vec![TemplateField { key: TemplateKey::Literal("app".into()), value: Template::literal(json!("data")) }],
        };
        let reader = Template::object(vec![
            ("app", Template::literal(json!("data"))),
            ("payload", Template::formula(Expr::local("x"))),
        ]);
        let messages = Template::Array { items: vec![skipped, reader] };
        let def = AaDefinitionKind::Plain(AaDefinition::with_messages(messages.clone()));
        validate_aa_definition(&def, 1_000, &AaConfig::default(), &NoGetters).unwrap();

        let ledger = InMemoryLedgerReader::default();
        let config = AaConfig::default();
        let mut state = context();
        let mut inv = invocation();
        let mut ev = Evaluator::new(&ledger, &config, &mut state, &mut inv, EvalMode::default());
        let out = ev.substitute_messages(&messages).await.unwrap();
        assert_eq!(out.messages, vec![json!({"app": "data", "payload": false})]);
    }
}
