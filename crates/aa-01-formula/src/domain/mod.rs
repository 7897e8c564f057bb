//! # Domain Layer (Inner Hexagon)
//!
//! Formula syntax, values and the entities a cascade works on.
//! No I/O and no async here; the evaluator and the ledger ports build on it.

pub mod ast;
pub mod decimal;
pub mod entities;
pub mod template;
pub mod value;

pub use ast::{Builtin, Expr, Selector};
pub use decimal::{Decimal, DecimalError, RoundingMode};
pub use entities::{
    AaResponse, ChainContext, ResponseBody, StateVarEntry, Trigger, UpdatedStateVar, ValidationState,
};
pub use template::{AaDefinition, AaDefinitionKind, AaDefinitionRecord, Case, Template, TemplateField, TemplateKey};
pub use value::{storage_size, Node, ObjectRef, StoredKind, StoredValue, Value};
