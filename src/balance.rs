use std::collections::{BTreeMap, HashSet};

use crate::error::{ConsistencyReason, LedgerError, LedgerResult};
use crate::schemas::{Amount, Expense, Member, MemberId, NewSplit};

/// Net position of every member: positive means the group owes them money.
pub type Balances = BTreeMap<MemberId, Amount>;

/// Computes each member's net balance over the given expenses.
///
/// Every member starts at zero so that people without any expense still show
/// up. Payers are credited with the full amount and every split debits its
/// member. An expense whose splits don't add up, or that mentions someone
/// outside the group, is reported instead of being corrected.
pub fn compute_balances(
    group_id: &str,
    expenses: &[Expense],
    members: &[Member],
) -> LedgerResult<Balances> {
    let mut balances: Balances = members.iter().map(|m| (m.id.clone(), 0)).collect();
    let member_ids: HashSet<&str> = members.iter().map(|m| m.id.as_str()).collect();

    for expense in expenses {
        validate_expense(group_id, expense, &member_ids)?;
        let overflow = || LedgerError::Consistency {
            expense_id: expense.id.clone(),
            reason: ConsistencyReason::AmountOverflow,
        };
        let paid = balances.entry(expense.paid_by.clone()).or_insert(0);
        *paid = paid.checked_add(expense.amount).ok_or_else(overflow)?;
        for split in &expense.splits {
            let owed = balances.entry(split.member_id.clone()).or_insert(0);
            *owed = owed.checked_sub(split.amount_owed).ok_or_else(overflow)?;
        }
    }

    debug_assert_eq!(balances.values().map(|b| i128::from(*b)).sum::<i128>(), 0);
    Ok(balances)
}

/// Checks a single expense against the group it claims to belong to.
pub fn validate_expense(
    group_id: &str,
    expense: &Expense,
    member_ids: &HashSet<&str>,
) -> LedgerResult<()> {
    let inconsistent = |reason| LedgerError::Consistency {
        expense_id: expense.id.clone(),
        reason,
    };

    if expense.group_id != group_id {
        return Err(inconsistent(ConsistencyReason::WrongGroup(
            expense.group_id.clone(),
        )));
    }
    if expense.amount <= 0 {
        return Err(inconsistent(ConsistencyReason::NonPositiveAmount(
            expense.amount,
        )));
    }
    if !member_ids.contains(expense.paid_by.as_str()) {
        return Err(inconsistent(ConsistencyReason::UnknownMember(
            expense.paid_by.clone(),
        )));
    }

    let mut seen = HashSet::new();
    for split in &expense.splits {
        if !member_ids.contains(split.member_id.as_str()) {
            return Err(inconsistent(ConsistencyReason::UnknownMember(
                split.member_id.clone(),
            )));
        }
        if split.amount_owed < 0 {
            return Err(inconsistent(ConsistencyReason::NegativeSplit(
                split.member_id.clone(),
            )));
        }
        if !seen.insert(split.member_id.as_str()) {
            return Err(inconsistent(ConsistencyReason::DuplicateSplit(
                split.member_id.clone(),
            )));
        }
    }

    let split_total = expense
        .split_total()
        .ok_or_else(|| inconsistent(ConsistencyReason::AmountOverflow))?;
    if split_total != expense.amount {
        return Err(inconsistent(ConsistencyReason::SplitTotalMismatch {
            amount: expense.amount,
            split_total,
        }));
    }
    Ok(())
}

/// Divides `amount` evenly between `members`.
///
/// The leftover minor units go one each to the first members in the given
/// order, so the splits always add up to `amount` exactly.
pub fn split_equally(amount: Amount, members: &[MemberId]) -> LedgerResult<Vec<NewSplit>> {
    if members.is_empty() {
        return Err(LedgerError::InvalidRequest(
            "an expense must be split between at least one member".to_string(),
        ));
    }
    if amount <= 0 {
        return Err(LedgerError::InvalidRequest(format!(
            "amount must be positive, got {amount}"
        )));
    }
    let count = members.len() as Amount;
    let base = amount / count;
    let remainder = (amount % count) as usize;

    Ok(members
        .iter()
        .enumerate()
        .map(|(i, member_id)| NewSplit {
            member_id: member_id.clone(),
            amount_owed: base + Amount::from(i < remainder),
        })
        .collect())
}
