//! # Coin Selection
//!
//! Picks the outputs an AA spends to fund one payment message.
//!
//! Candidates are scanned in two ordered passes: stable outputs first, then
//! unstable outputs created by other AA responses of the running cascade.
//! Unstable outputs of ordinary units are never spent.

use super::composer::CompositionError;
use shared_types::{Address, Amount, Asset, Input, SpendableOutput};

/// How missing funds of an asset may be created instead of spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Issuance {
    /// The AA cannot issue this asset.
    #[default]
    None,
    /// Capped asset defined by the AA; the whole cap is issued at once.
    Capped {
        /// Total supply.
        cap: Amount,
        /// Whether the cap was already issued.
        issued: bool,
    },
    /// Uncapped asset defined by the AA.
    Uncapped {
        /// Serial number of the next issue.
        next_serial: u64,
    },
}

/// Inputs chosen for one payment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoinSelection {
    /// Inputs in spending order; an issue input comes first.
    pub inputs: Vec<Input>,
    /// Sum of the transferred outputs.
    pub spent: Amount,
    /// Newly issued amount.
    pub issued: Amount,
}

impl CoinSelection {
    /// Funds available to the payment.
    #[must_use]
    pub fn total(&self) -> Amount {
        self.spent + self.issued
    }
}

/// Candidates in spending order: stable by MCI, then unstable AA outputs.
#[must_use]
pub fn order_candidates(candidates: &[SpendableOutput]) -> Vec<&SpendableOutput> {
    let mut stable: Vec<&SpendableOutput> = candidates.iter().filter(|c| c.mci.is_some()).collect();
    let mut unstable: Vec<&SpendableOutput> =
        candidates.iter().filter(|c| c.mci.is_none() && c.from_aa).collect();
    stable.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    unstable.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    stable.extend(unstable);
    stable
}

fn transfer(output: &SpendableOutput) -> Input {
    Input::Transfer {
        unit: output.unit.clone(),
        message_index: output.message_index,
        output_index: output.output_index,
    }
}

/// Spends candidates until `target` is covered, or all of them when
/// `target` is `None`.
///
/// Missing funds are issued when `issuance` allows it.
///
/// # Errors
///
/// `NotEnoughFunds` when the candidates and any issuance fall short.
pub fn select_coins(
    asset: &Asset,
    candidates: &[SpendableOutput],
    target: Option<Amount>,
    issuance: Issuance,
    issuer: &Address,
) -> Result<CoinSelection, CompositionError> {
    let mut selection = CoinSelection::default();
    for candidate in order_candidates(candidates) {
        if target.is_some_and(|t| selection.spent >= t) {
            break;
        }
        selection.spent += candidate.amount;
        selection.inputs.push(transfer(candidate));
    }

    let Some(target) = target else {
        return Ok(selection);
    };
    if selection.spent >= target {
        return Ok(selection);
    }

    let missing = target - selection.spent;
    let issue = match issuance {
        Issuance::Capped { cap, issued: false } if cap >= missing => Some((1, cap)),
        Issuance::Uncapped { next_serial } => Some((next_serial, missing)),
        _ => None,
    };
    let Some((serial_number, amount)) = issue else {
        return Err(CompositionError::NotEnoughFunds {
            asset: asset.clone(),
            needed: target,
            available: selection.spent,
        });
    };
    selection.inputs.insert(0, Input::Issue { serial_number, amount, address: issuer.clone() });
    selection.issued = amount;
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shared_types::{Mci, UnitHash};

    fn out(unit: char, amount: Amount, mci: Option<Mci>, from_aa: bool) -> SpendableOutput {
        SpendableOutput {
            unit: UnitHash::new(unit.to_string().repeat(64)),
            message_index: 0,
            output_index: 0,
            amount,
            mci,
            from_aa,
        }
    }

    fn aa() -> Address {
        Address::new("A".repeat(32))
    }

    #[test]
    fn test_stable_outputs_are_spent_first() {
        let candidates = vec![out('c', 500, None, true), out('b', 300, Some(20), false), out('a', 100, Some(10), false)];
        let ordered = order_candidates(&candidates);
        let amounts: Vec<Amount> = ordered.iter().map(|c| c.amount).collect();
        assert_eq!(amounts, vec![100, 300, 500]);
    }

    #[test]
    fn test_unstable_non_aa_outputs_are_ignored() {
        let candidates = vec![out('a', 100, None, false)];
        let err = select_coins(&Asset::base(), &candidates, Some(50), Issuance::None, &aa()).unwrap_err();
        assert!(matches!(err, CompositionError::NotEnoughFunds { available: 0, .. }));
    }

    #[test]
    fn test_stops_once_target_is_covered() {
        let candidates = vec![out('a', 100, Some(1), false), out('b', 100, Some(2), false), out('c', 100, Some(3), false)];
        let s = select_coins(&Asset::base(), &candidates, Some(150), Issuance::None, &aa()).unwrap();
        assert_eq!(s.inputs.len(), 2);
        assert_eq!(s.spent, 200);
    }

    #[test]
    fn test_send_all_spends_everything() {
        let candidates = vec![out('a', 100, Some(1), false), out('b', 7, None, true)];
        let s = select_coins(&Asset::base(), &candidates, None, Issuance::None, &aa()).unwrap();
        assert_eq!(s.spent, 107);
    }

    #[test]
    fn test_uncapped_issue_covers_shortfall() {
        let asset = Asset::new("f".repeat(64));
        let candidates = vec![out('a', 40, Some(1), false)];
        let s = select_coins(&asset, &candidates, Some(100), Issuance::Uncapped { next_serial: 3 }, &aa()).unwrap();
        assert_eq!(s.issued, 60);
        assert_eq!(s.total(), 100);
        assert!(matches!(s.inputs[0], Input::Issue { serial_number: 3, amount: 60, .. }));
    }

    #[test]
    fn test_capped_issue_happens_once() {
        let asset = Asset::new("f".repeat(64));
        let s = select_coins(&asset, &[], Some(10), Issuance::Capped { cap: 1000, issued: false }, &aa()).unwrap();
        assert_eq!(s.issued, 1000);
        assert!(matches!(s.inputs[0], Input::Issue { serial_number: 1, .. }));

        let again = select_coins(&asset, &[], Some(10), Issuance::Capped { cap: 1000, issued: true }, &aa());
        assert!(again.is_err());
    }

    proptest! {
        #[test]
        fn prop_selection_is_stable(amounts in proptest::collection::vec(1i64..10_000, 1..20), target in 1i64..50_000) {
            let candidates: Vec<SpendableOutput> = amounts
                .iter()
                .enumerate()
                .map(|(i, a)| SpendableOutput {
                    unit: UnitHash::new(format!("{i:064}")),
                    message_index: 0,
                    output_index: 0,
                    amount: *a,
                    mci: Some((i % 5) as Mci),
                    from_aa: false,
                })
                .collect();
            let mut reversed = candidates.clone();
            reversed.reverse();
            let a = select_coins(&Asset::base(), &candidates, Some(target), Issuance::None, &aa());
            let b = select_coins(&Asset::base(), &reversed, Some(target), Issuance::None, &aa());
            prop_assert_eq!(a, b);
        }
    }
}
