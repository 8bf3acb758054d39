//! Batch payment application
//!
//! A batch is applied all-or-nothing per sender: if a sender's total debit
//! in the batch exceeds its balance, none of its payments apply. Every
//! surviving payment burns `cost`; the receiver gets `amount - cost`, or
//! nothing when the amount does not exceed the cost.

use crate::types::{Account, Payment, PublicKey};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Apply `payments` to `accounts` at the given transaction cost
///
/// Accounts that end at or below zero are dropped from the result.
pub fn process_payments<'a, I>(accounts: HashSet<Account>, payments: I, cost: Decimal) -> HashSet<Account>
where
    I: IntoIterator<Item = &'a Payment>,
{
    let payments: Vec<&Payment> = payments
        .into_iter()
        .filter(|p| {
            let positive = p.amount > Decimal::ZERO;
            if !positive {
                warn!(from = %p.from, amount = %p.amount, "Skipping non-positive payment");
            }
            positive
        })
        .collect();

    let mut ledger: HashMap<PublicKey, Account> = accounts
        .into_iter()
        .map(|a| (a.public_key.clone(), a))
        .collect();

    let mut requested: HashMap<&str, Decimal> = HashMap::new();
    for payment in &payments {
        *requested.entry(payment.payer_key()).or_default() += payment.amount;
    }

    let refused: HashSet<&str> = requested
        .iter()
        .filter(|(sender, total)| {
            let balance = ledger.get(**sender).map(|a| a.amount).unwrap_or(Decimal::ZERO);
            balance < **total
        })
        .map(|(sender, _)| *sender)
        .collect();

    for sender in &refused {
        warn!(
            public_key = %sender,
            requested = %requested[sender],
            "Insufficient balance, refusing every payment from sender"
        );
    }

    for payment in payments.iter().filter(|p| !refused.contains(p.payer_key())) {
        if let Some(payer) = ledger.get_mut(payment.payer_key()) {
            payer.amount -= payment.amount;
        }

        if payment.amount > cost {
            let receiver = payment.receiver_key();
            let account = ledger
                .entry(receiver.to_string())
                .or_insert_with(|| Account::unnamed(receiver));
            account.amount += payment.amount - cost;
        } else {
            debug!(from = %payment.from, amount = %payment.amount, "Payment at or below cost, nothing credited");
        }
    }

    ledger
        .into_values()
        .filter(|a| a.amount > Decimal::ZERO)
        .collect()
}
