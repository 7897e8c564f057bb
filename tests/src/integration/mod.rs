//! Cross-crate scenarios driven through `AaEngineApi`.

pub mod flows;
pub mod invariants;
