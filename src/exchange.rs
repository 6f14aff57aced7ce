use std::cmp::Ordering;

use serde::Serialize;

use crate::balance::Balances;
use crate::schemas::{Amount, MemberId};

#[derive(Clone, Debug)]
struct PersonalBalance {
    id: MemberId,
    // Always positive: what is still owed to a receiver, or still due from a payer
    balance: Amount,
}

/// A transfer from a debtor to a creditor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub from: MemberId,
    pub to: MemberId,
    pub amount: Amount,
}

// Largest balance first, ties broken by id so the result is reproducible
fn by_largest_balance(a: &PersonalBalance, b: &PersonalBalance) -> Ordering {
    b.balance.cmp(&a.balance).then_with(|| a.id.cmp(&b.id))
}

/// Turns net balances into the transfers that zero them out.
///
/// Greedy matching: the largest debtor pays the largest creditor as much as
/// either of them can absorb, whoever reaches zero drops out, and the rest is
/// re-sorted. This keeps the number of transfers small but is not guaranteed
/// to be the absolute minimum.
pub fn reduce_to_settlements(balances: &Balances) -> Vec<Exchange> {
    let mut payers = Vec::new();
    let mut receivers = Vec::new();

    for (id, balance) in balances {
        let person = PersonalBalance {
            id: id.clone(),
            balance: balance.abs(),
        };
        match balance.cmp(&0) {
            Ordering::Less => payers.push(person),
            Ordering::Greater => receivers.push(person),
            Ordering::Equal => {}
        }
    }

    let mut exchanges = Vec::new();

    while !payers.is_empty() && !receivers.is_empty() {
        payers.sort_by(by_largest_balance);
        receivers.sort_by(by_largest_balance);

        let payer = &mut payers[0];
        let receiver = &mut receivers[0];
        let amount = payer.balance.min(receiver.balance);

        exchanges.push(Exchange {
            from: payer.id.clone(),
            to: receiver.id.clone(),
            amount,
        });
        payer.balance -= amount;
        receiver.balance -= amount;

        if payer.balance == 0 {
            payers.remove(0);
        }
        if receivers[0].balance == 0 {
            receivers.remove(0);
        }
    }

    exchanges
}
