//! Coin selection and transaction assembly

use crate::multisig::transaction::{
    OutPoint, PartialTx, TxInput, TxOutput, DEFAULT_FEE_PER_KB, DUST_THRESHOLD, MAX_MONEY,
};
use thiserror::Error;

/// Errors raised while assembling a transaction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: u64, required: u64 },
    #[error("Amount {0} is below the dust threshold")]
    AmountTooSmall(u64),
    #[error("Amount {0} exceeds the money supply")]
    AmountTooLarge(u64),
    #[error("Transaction has no outputs")]
    NoOutputs,
}

/// An output the wallet can spend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spendable {
    pub outpoint: OutPoint,
    pub address: String,
    pub amount: u64,
    pub confirmations: u32,
}

/// Result of coin selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<Spendable>,
    pub fee: u64,
    /// Zero when the remainder was dust and went to the fee
    pub change: u64,
}

fn fee_for_size(size: usize, fee_per_kb: u64) -> u64 {
    (size as u64).div_ceil(1000).saturating_mul(fee_per_kb)
}

/// Pick outputs covering `amount` plus fee
///
/// Confirmed outputs come first, then larger amounts. Every selected input
/// is assumed to need `input_size` bytes once signed; the fee is charged
/// per started kilobyte of the resulting transaction.
pub fn select_coins(
    candidates: &[Spendable],
    amount: u64,
    fee_per_kb: u64,
    input_size: usize,
) -> Result<CoinSelection, BuildError> {
    if amount < DUST_THRESHOLD {
        return Err(BuildError::AmountTooSmall(amount));
    }
    if amount > MAX_MONEY {
        return Err(BuildError::AmountTooLarge(amount));
    }

    let mut ordered: Vec<&Spendable> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        (b.confirmations > 0)
            .cmp(&(a.confirmations > 0))
            .then(b.amount.cmp(&a.amount))
            .then(a.outpoint.cmp(&b.outpoint))
    });

    let mut selected = Vec::new();
    let mut total = 0u64;
    let mut fee = 0u64;

    for candidate in ordered {
        selected.push(candidate.clone());
        total = total.saturating_add(candidate.amount);

        // Destination and change output
        let size = 10 + selected.len() * input_size + 2 * 34;
        fee = fee_for_size(size, fee_per_kb);
        let needed = amount
            .checked_add(fee)
            .ok_or(BuildError::AmountTooLarge(amount))?;
        if total >= needed {
            let remainder = total - needed;
            let (fee, change) = if remainder < DUST_THRESHOLD {
                (fee + remainder, 0)
            } else {
                (fee, remainder)
            };
            return Ok(CoinSelection {
                selected,
                fee,
                change,
            });
        }
    }

    Err(BuildError::InsufficientFunds {
        available: total,
        required: amount.saturating_add(fee.max(fee_for_size(10 + input_size + 68, fee_per_kb))),
    })
}

/// Builder for unsigned multisig transactions
#[derive(Debug, Clone)]
pub struct TxBuilder {
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    fee_per_kb: u64,
}

impl TxBuilder {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            fee_per_kb: DEFAULT_FEE_PER_KB,
        }
    }

    pub fn fee_per_kb(mut self, fee_per_kb: u64) -> Self {
        self.fee_per_kb = fee_per_kb;
        self
    }

    /// Add an input spending a multisig output
    pub fn add_input(mut self, input: TxInput) -> Self {
        self.inputs.push(input);
        self
    }

    /// Add an output
    pub fn add_output(mut self, address: &str, amount: u64) -> Self {
        self.outputs.push(TxOutput::new(address, amount));
        self
    }

    /// Add a change output unless the amount is zero
    pub fn change(self, address: &str, amount: u64) -> Self {
        if amount == 0 {
            self
        } else {
            self.add_output(address, amount)
        }
    }

    pub fn build(self) -> Result<PartialTx, BuildError> {
        if self.outputs.is_empty() {
            return Err(BuildError::NoOutputs);
        }
        let tx = PartialTx::new(self.inputs, self.outputs);
        let required = tx.output_total();
        if tx.input_total() < required {
            return Err(BuildError::InsufficientFunds {
                available: tx.input_total(),
                required,
            });
        }
        Ok(tx)
    }

    pub fn current_fee_rate(&self) -> u64 {
        self.fee_per_kb
    }
}

impl Default for TxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spendable(n: u8, amount: u64, confirmations: u32) -> Spendable {
        Spendable {
            outpoint: OutPoint::new(hex::encode([n; 32]), 0),
            address: "2N".to_string(),
            amount,
            confirmations,
        }
    }

    #[test]
    fn test_prefers_confirmed_then_largest() {
        let candidates = vec![
            spendable(1, 50_000, 0),
            spendable(2, 30_000, 3),
            spendable(3, 80_000, 1),
        ];

        let selection = select_coins(&candidates, 60_000, 10_000, 300).unwrap();
        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.selected[0].amount, 80_000);
        assert_eq!(selection.fee, 10_000);
        assert_eq!(selection.change, 10_000);
    }

    #[test]
    fn test_accumulates_inputs() {
        let candidates = vec![spendable(1, 40_000, 1), spendable(2, 40_000, 1)];
        let selection = select_coins(&candidates, 60_000, 10_000, 300).unwrap();
        assert_eq!(selection.selected.len(), 2);
        // 10 + 2*300 + 68 bytes: one started kB
        assert_eq!(selection.fee, 10_000);
        assert_eq!(selection.change, 10_000);
    }

    #[test]
    fn test_dust_change_goes_to_fee() {
        let candidates = vec![spendable(1, 72_000, 1)];
        let selection = select_coins(&candidates, 60_000, 10_000, 300).unwrap();
        assert_eq!(selection.change, 0);
        assert_eq!(selection.fee, 12_000);
    }

    #[test]
    fn test_insufficient_funds() {
        let candidates = vec![spendable(1, 20_000, 1)];
        assert!(matches!(
            select_coins(&candidates, 60_000, 10_000, 300),
            Err(BuildError::InsufficientFunds {
                available: 20_000,
                ..
            })
        ));
        assert_eq!(
            select_coins(&candidates, 100, 10_000, 300),
            Err(BuildError::AmountTooSmall(100))
        );
    }

    #[test]
    fn test_huge_amounts_do_not_overflow() {
        let candidates = vec![spendable(1, u64::MAX - 5, 1), spendable(2, 40_000, 1)];
        assert_eq!(
            select_coins(&candidates, u64::MAX - 10, 10_000, 300),
            Err(BuildError::AmountTooLarge(u64::MAX - 10))
        );

        // Fee pushes the total past u64
        assert_eq!(
            select_coins(&candidates, MAX_MONEY, u64::MAX, 300),
            Err(BuildError::AmountTooLarge(MAX_MONEY))
        );

        // Outputs summing past u64 are insufficient, not a panic
        let selection = select_coins(&candidates, MAX_MONEY, 10_000, 300).unwrap();
        assert_eq!(selection.selected.len(), 1);
        let candidates = vec![spendable(3, 1_000, 1)];
        assert!(matches!(
            select_coins(&candidates, MAX_MONEY, 10_000, 300),
            Err(BuildError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_builder_requires_outputs() {
        assert_eq!(TxBuilder::new().build(), Err(BuildError::NoOutputs));
        let builder = TxBuilder::new().fee_per_kb(5_000).change("2N", 0);
        assert_eq!(builder.current_fee_rate(), 5_000);
        assert_eq!(builder.build(), Err(BuildError::NoOutputs));
    }
}
