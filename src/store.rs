//! Settlement store: keeps each group's persisted settlements in line with
//! its expenses and answers the outstanding-debt queries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::balance::{compute_balances, validate_expense, Balances};
use crate::error::{LedgerError, LedgerResult};
use crate::exchange::reduce_to_settlements;
use crate::repository::LedgerRepository;
use crate::schemas::{
    Expense, Group, Member, NewExpense, Settlement, SettlementStatus, SettlementSummary, Split,
};

/// One async mutex per group id.
///
/// Different groups never wait on each other; callers on the same group queue
/// up until `timeout` runs out. An entry lives only as long as someone holds
/// or waits for it, so the table doesn't grow with every id ever asked for.
struct GroupLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl GroupLocks {
    fn new(timeout: Duration) -> Self {
        GroupLocks {
            locks: DashMap::new(),
            timeout,
        }
    }

    async fn acquire(&self, group_id: &str) -> LedgerResult<GroupGuard<'_>> {
        // Clone the Arc out so the map shard isn't held across the await
        let lock = self
            .locks
            .entry(group_id.to_string())
            .or_default()
            .value()
            .clone();
        let acquired = tokio::time::timeout(self.timeout, lock.clone().lock_owned()).await;
        match acquired {
            Ok(guard) => Ok(GroupGuard {
                locks: self,
                group_id: group_id.to_string(),
                lock,
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(group_id, &lock);
                Err(LedgerError::ConcurrencyViolation {
                    group_id: group_id.to_string(),
                })
            }
        }
    }

    /// Drops the table entry if `lock` is still the one stored for the group
    /// and nobody but the table and the caller has a handle on it.
    ///
    /// The check runs under the shard lock that `acquire` also takes, so a
    /// handle can't be handed out between the count and the removal.
    fn release(&self, group_id: &str, lock: &Arc<Mutex<()>>) {
        self.locks.remove_if(group_id, |_, current| {
            Arc::ptr_eq(current, lock) && Arc::strong_count(current) == 2
        });
    }
}

/// Holds a group's lock; unlocking also clears the table entry when nobody
/// else is queued on it.
struct GroupGuard<'a> {
    locks: &'a GroupLocks,
    group_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        // The owned guard keeps its own handle, so unlock before counting
        drop(self.guard.take());
        self.locks.release(&self.group_id, &self.lock);
    }
}

/// What a recompute did to the persisted settlements.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub settlements: Vec<Settlement>,
    pub kept: usize,
    pub updated: usize,
    pub created: usize,
    pub removed: usize,
}

/// Subtracts already paid transfers from the ledger balances.
///
/// A paid debtor has discharged part of what they owed and the creditor has
/// received it, so both sides move towards zero by the paid amount.
fn discount_paid(balances: &mut Balances, settlements: &[Settlement]) {
    for paid in settlements.iter().filter(|s| s.is_paid()) {
        *balances.entry(paid.from.clone()).or_insert(0) += paid.amount;
        *balances.entry(paid.to.clone()).or_insert(0) -= paid.amount;
    }
}

/// Merges a freshly reduced transfer list into the persisted settlements.
///
/// Paid settlements are carried over untouched. A pending settlement survives
/// when the new list still has a transfer between the same two members, taking
/// the new amount if it changed; every other pending settlement is dropped and
/// transfers without a match become new pending settlements.
pub fn reconcile(group: &Group) -> LedgerResult<Reconciliation> {
    let mut balances = compute_balances(&group.id, &group.expenses, &group.members)?;
    discount_paid(&mut balances, &group.settlements);
    let exchanges = reduce_to_settlements(&balances);

    let mut outcome = Reconciliation::default();
    let mut pending: Vec<&Settlement> = Vec::new();
    for settlement in &group.settlements {
        if settlement.is_paid() {
            outcome.settlements.push(settlement.clone());
        } else {
            pending.push(settlement);
        }
    }

    let mut matched = HashSet::new();
    for exchange in exchanges {
        let existing = pending
            .iter()
            .find(|s| s.from == exchange.from && s.to == exchange.to && s.group_id == group.id);
        match existing {
            Some(existing) => {
                matched.insert(existing.id.as_str());
                let mut settlement = (*existing).clone();
                if settlement.amount == exchange.amount {
                    outcome.kept += 1;
                } else {
                    settlement.amount = exchange.amount;
                    outcome.updated += 1;
                }
                outcome.settlements.push(settlement);
            }
            None => {
                outcome.created += 1;
                outcome.settlements.push(Settlement {
                    id: Uuid::new_v4().to_string(),
                    group_id: group.id.clone(),
                    from: exchange.from,
                    to: exchange.to,
                    amount: exchange.amount,
                    status: SettlementStatus::Pending,
                    created_at: Utc::now(),
                    paid_at: None,
                });
            }
        }
    }
    outcome.removed = pending
        .iter()
        .filter(|s| !matched.contains(s.id.as_str()))
        .count();

    Ok(outcome)
}

/// Sums the pending settlements around one member.
pub fn summarize(group: &Group, member_id: &str) -> SettlementSummary {
    let settlements: Vec<Settlement> = group
        .settlements
        .iter()
        .filter(|s| s.involves(member_id))
        .cloned()
        .collect();

    let mut total_owed = 0;
    let mut total_owing = 0;
    for settlement in settlements.iter().filter(|s| !s.is_paid()) {
        if settlement.to == member_id {
            total_owed += settlement.amount;
        }
        if settlement.from == member_id {
            total_owing += settlement.amount;
        }
    }

    SettlementSummary {
        settlements,
        total_owed,
        total_owing,
        net_balance: total_owed - total_owing,
    }
}

pub struct SettlementStore<R: LedgerRepository> {
    repo: Arc<R>,
    locks: GroupLocks,
}

impl<R: LedgerRepository> SettlementStore<R> {
    pub fn new(repo: Arc<R>, lock_timeout: Duration) -> Self {
        SettlementStore {
            repo,
            locks: GroupLocks::new(lock_timeout),
        }
    }

    async fn load_group(&self, group_id: &str) -> LedgerResult<Group> {
        self.repo
            .find_group(group_id)
            .await?
            .ok_or_else(|| LedgerError::GroupNotFound(group_id.to_string()))
    }

    /// Regenerates the group's settlements from its current expenses.
    ///
    /// Either the whole settlement set is replaced or nothing is written.
    #[instrument(skip(self), err)]
    pub async fn recompute(&self, group_id: &str) -> LedgerResult<Vec<Settlement>> {
        let _guard = self.locks.acquire(group_id).await?;
        let group = self.load_group(group_id).await?;
        let outcome = reconcile(&group)?;
        self.repo
            .replace_settlements(group_id, outcome.settlements.clone())
            .await?;
        log_reconciliation(group_id, &outcome);
        Ok(outcome.settlements)
    }

    /// Marks a pending settlement as paid.
    ///
    /// Paying twice is reported as `AlreadyPaid` and changes nothing.
    #[instrument(skip(self))]
    pub async fn mark_paid(&self, settlement_id: &str) -> LedgerResult<Settlement> {
        let group_id = self
            .repo
            .find_group_by_settlement(settlement_id)
            .await?
            .map(|g| g.id)
            .ok_or_else(|| LedgerError::SettlementNotFound(settlement_id.to_string()))?;

        let _guard = self.locks.acquire(&group_id).await?;
        // A recompute may have replaced the settlement while we waited
        let group = self.load_group(&group_id).await?;
        let mut settlements = group.settlements;
        let settlement = settlements
            .iter_mut()
            .find(|s| s.id == settlement_id)
            .ok_or_else(|| LedgerError::SettlementNotFound(settlement_id.to_string()))?;

        if settlement.is_paid() {
            warn!(settlement_id, "settlement already paid");
            return Err(LedgerError::AlreadyPaid(settlement_id.to_string()));
        }
        settlement.status = SettlementStatus::Paid;
        settlement.paid_at = Some(Utc::now());
        let paid = settlement.clone();

        self.repo.replace_settlements(&group_id, settlements).await?;
        info!(settlement_id, group_id = %group_id, amount = paid.amount, "settlement paid");
        Ok(paid)
    }

    /// Totals of the member's pending settlements in the group.
    #[instrument(skip(self), err)]
    pub async fn summary(&self, group_id: &str, member_id: &str) -> LedgerResult<SettlementSummary> {
        let group = self.load_group(group_id).await?;
        if !group.has_member(member_id) && !group.settlements.iter().any(|s| s.involves(member_id))
        {
            return Err(LedgerError::MemberNotFound(member_id.to_string()));
        }
        Ok(summarize(&group, member_id))
    }

    /// Net balances straight from the expenses, ignoring settlements.
    pub async fn balances(&self, group_id: &str) -> LedgerResult<Balances> {
        let group = self.load_group(group_id).await?;
        compute_balances(&group.id, &group.expenses, &group.members)
    }

    pub async fn group(&self, group_id: &str) -> LedgerResult<Group> {
        self.load_group(group_id).await
    }

    /// Every group the member belongs to, ordered by id.
    pub async fn groups_for_member(&self, member_id: &str) -> LedgerResult<Vec<Group>> {
        self.repo.find_groups_for_member(member_id).await
    }

    /// Every settlement the member is part of, across all of their groups.
    pub async fn settlements_for_member(&self, member_id: &str) -> LedgerResult<Vec<Settlement>> {
        let groups = self.repo.find_groups_for_member(member_id).await?;
        Ok(groups
            .into_iter()
            .flat_map(|g| g.settlements)
            .filter(|s| s.involves(member_id))
            .collect())
    }

    #[instrument(skip(self, members), err)]
    pub async fn create_group(
        &self,
        group_id: &str,
        name: String,
        members: Vec<Member>,
    ) -> LedgerResult<Group> {
        let mut seen = HashSet::new();
        if let Some(dup) = members.iter().find(|m| !seen.insert(m.id.as_str())) {
            return Err(LedgerError::MemberExists(dup.id.clone()));
        }
        let _guard = self.locks.acquire(group_id).await?;
        let group = Group::new(group_id.to_string(), name, members);
        self.repo.create_group(group.clone()).await?;
        info!(group_id, "group created");
        Ok(group)
    }

    /// Deletes the group along with all of its settlements, paid ones included.
    #[instrument(skip(self), err)]
    pub async fn delete_group(&self, group_id: &str) -> LedgerResult<()> {
        let _guard = self.locks.acquire(group_id).await?;
        if !self.repo.delete_group(group_id).await? {
            return Err(LedgerError::GroupNotFound(group_id.to_string()));
        }
        info!(group_id, "group deleted");
        Ok(())
    }

    #[instrument(skip(self, member), fields(member_id = %member.id), err)]
    pub async fn add_member(&self, group_id: &str, member: Member) -> LedgerResult<Group> {
        let _guard = self.locks.acquire(group_id).await?;
        let group = self.load_group(group_id).await?;
        if group.has_member(&member.id) {
            return Err(LedgerError::MemberExists(member.id));
        }
        self.repo.add_member(group_id, member).await?;
        self.load_group(group_id).await
    }

    /// Removes a member who no longer appears in any expense or settlement.
    #[instrument(skip(self), err)]
    pub async fn remove_member(&self, group_id: &str, member_id: &str) -> LedgerResult<()> {
        let _guard = self.locks.acquire(group_id).await?;
        let group = self.load_group(group_id).await?;
        if !group.has_member(member_id) {
            return Err(LedgerError::MemberNotFound(member_id.to_string()));
        }
        if group.references_member(member_id) {
            return Err(LedgerError::MemberInUse(member_id.to_string()));
        }
        self.repo.remove_member(group_id, member_id).await?;
        debug!(group_id, member_id, "member removed");
        Ok(())
    }

    /// Records a new expense and brings the settlements up to date.
    ///
    /// The expense and the new settlements go out in a single write, and an
    /// inconsistent expense is rejected before anything is written.
    #[instrument(skip(self, new_expense), err)]
    pub async fn add_expense(&self, group_id: &str, new_expense: NewExpense) -> LedgerResult<Expense> {
        let _guard = self.locks.acquire(group_id).await?;
        let mut group = self.load_group(group_id).await?;

        let expense_id = Uuid::new_v4().to_string();
        let expense = Expense {
            splits: new_expense
                .splits
                .into_iter()
                .map(|s| Split {
                    expense_id: expense_id.clone(),
                    member_id: s.member_id,
                    amount_owed: s.amount_owed,
                })
                .collect(),
            id: expense_id,
            group_id: group.id.clone(),
            description: new_expense.description,
            amount: new_expense.amount,
            paid_by: new_expense.paid_by,
            created_at: Utc::now(),
        };
        {
            let member_ids: HashSet<&str> = group.members.iter().map(|m| m.id.as_str()).collect();
            validate_expense(&group.id, &expense, &member_ids)?;
        }

        group.expenses.push(expense.clone());
        let outcome = reconcile(&group)?;
        self.repo
            .insert_expense(group_id, expense.clone(), outcome.settlements.clone())
            .await?;
        debug!(group_id, expense_id = %expense.id, amount = expense.amount, "expense added");
        log_reconciliation(group_id, &outcome);
        Ok(expense)
    }

    /// Deletes an expense with its splits and brings the settlements up to
    /// date in the same write.
    #[instrument(skip(self), err)]
    pub async fn delete_expense(&self, group_id: &str, expense_id: &str) -> LedgerResult<()> {
        let _guard = self.locks.acquire(group_id).await?;
        let mut group = self.load_group(group_id).await?;
        let before = group.expenses.len();
        group.expenses.retain(|e| e.id != expense_id);
        if group.expenses.len() == before {
            return Err(LedgerError::ExpenseNotFound(expense_id.to_string()));
        }

        let outcome = reconcile(&group)?;
        if !self
            .repo
            .delete_expense(group_id, expense_id, outcome.settlements.clone())
            .await?
        {
            return Err(LedgerError::ExpenseNotFound(expense_id.to_string()));
        }
        debug!(group_id, expense_id, "expense deleted");
        log_reconciliation(group_id, &outcome);
        Ok(())
    }
}

fn log_reconciliation(group_id: &str, outcome: &Reconciliation) {
    info!(
        group_id,
        kept = outcome.kept,
        updated = outcome.updated,
        created = outcome.created,
        removed = outcome.removed,
        "settlements recomputed"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::memory::InMemoryRepository;
    use crate::schemas::{Amount, MemberRole, NewSplit};

    const GROUP: &str = "trip";

    /// In-memory storage whose writes can be switched off.
    #[derive(Default)]
    struct FlakyRepository {
        inner: InMemoryRepository,
        refuse_writes: AtomicBool,
    }

    impl FlakyRepository {
        fn check_write(&self) -> LedgerResult<()> {
            if self.refuse_writes.load(Ordering::SeqCst) {
                let io = std::io::Error::other("write refused");
                return Err(LedgerError::from(mongodb::error::Error::from(io)));
            }
            Ok(())
        }
    }

    impl LedgerRepository for FlakyRepository {
        async fn create_group(&self, group: Group) -> LedgerResult<()> {
            self.check_write()?;
            self.inner.create_group(group).await
        }

        async fn find_group(&self, group_id: &str) -> LedgerResult<Option<Group>> {
            self.inner.find_group(group_id).await
        }

        async fn find_group_by_settlement(&self, settlement_id: &str) -> LedgerResult<Option<Group>> {
            self.inner.find_group_by_settlement(settlement_id).await
        }

        async fn find_groups_for_member(&self, member_id: &str) -> LedgerResult<Vec<Group>> {
            self.inner.find_groups_for_member(member_id).await
        }

        async fn delete_group(&self, group_id: &str) -> LedgerResult<bool> {
            self.check_write()?;
            self.inner.delete_group(group_id).await
        }

        async fn add_member(&self, group_id: &str, member: Member) -> LedgerResult<()> {
            self.check_write()?;
            self.inner.add_member(group_id, member).await
        }

        async fn remove_member(&self, group_id: &str, member_id: &str) -> LedgerResult<()> {
            self.check_write()?;
            self.inner.remove_member(group_id, member_id).await
        }

        async fn insert_expense(
            &self,
            group_id: &str,
            expense: Expense,
            settlements: Vec<Settlement>,
        ) -> LedgerResult<()> {
            self.check_write()?;
            self.inner.insert_expense(group_id, expense, settlements).await
        }

        async fn delete_expense(
            &self,
            group_id: &str,
            expense_id: &str,
            settlements: Vec<Settlement>,
        ) -> LedgerResult<bool> {
            self.check_write()?;
            self.inner.delete_expense(group_id, expense_id, settlements).await
        }

        async fn replace_settlements(
            &self,
            group_id: &str,
            settlements: Vec<Settlement>,
        ) -> LedgerResult<()> {
            self.check_write()?;
            self.inner.replace_settlements(group_id, settlements).await
        }
    }

    fn member(id: &str) -> Member {
        Member {
            id: id.to_string(),
            name: Some(id.to_uppercase()),
            email: format!("{id}@example.com"),
            role: MemberRole::Member,
        }
    }

    fn new_expense(description: &str, amount: Amount, paid_by: &str, splits: &[(&str, Amount)]) -> NewExpense {
        NewExpense {
            description: description.to_string(),
            amount,
            paid_by: paid_by.to_string(),
            splits: splits
                .iter()
                .map(|(m, a)| NewSplit {
                    member_id: m.to_string(),
                    amount_owed: *a,
                })
                .collect(),
        }
    }

    fn store() -> SettlementStore<InMemoryRepository> {
        SettlementStore::new(Arc::new(InMemoryRepository::new()), Duration::from_secs(1))
    }

    async fn abc_store() -> SettlementStore<InMemoryRepository> {
        let store = store();
        store
            .create_group(GROUP, "Trip".into(), vec![member("a"), member("b"), member("c")])
            .await
            .unwrap();
        store
    }

    fn triples(settlements: &[Settlement]) -> Vec<(String, String, Amount, SettlementStatus)> {
        settlements
            .iter()
            .map(|s| (s.from.clone(), s.to.clone(), s.amount, s.status))
            .collect()
    }

    fn pending(from: &str, to: &str, amount: Amount) -> (String, String, Amount, SettlementStatus) {
        (from.into(), to.into(), amount, SettlementStatus::Pending)
    }

    fn find<'a>(settlements: &'a [Settlement], from: &str, to: &str) -> &'a Settlement {
        settlements
            .iter()
            .find(|s| s.from == from && s.to == to && !s.is_paid())
            .unwrap()
    }

    #[tokio::test]
    async fn dinner_creates_two_settlements() {
        let store = abc_store().await;
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();

        let group = store.group(GROUP).await.unwrap();
        assert_eq!(
            triples(&group.settlements),
            vec![pending("b", "a", 30), pending("c", "a", 30)]
        );
    }

    #[tokio::test]
    async fn taxi_updates_matching_settlements_in_place() {
        let store = abc_store().await;
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        let before = store.group(GROUP).await.unwrap().settlements;

        store
            .add_expense(GROUP, new_expense("Taxi", 30, "b", &[("a", 10), ("b", 10), ("c", 10)]))
            .await
            .unwrap();
        let after = store.group(GROUP).await.unwrap().settlements;

        assert_eq!(
            triples(&after),
            vec![pending("c", "a", 40), pending("b", "a", 10)]
        );
        // Matched by (from, to), so ids survive the amount change
        assert_eq!(find(&before, "c", "a").id, find(&after, "c", "a").id);
        assert_eq!(find(&before, "b", "a").id, find(&after, "b", "a").id);
        let total: Amount = after.iter().map(|s| s.amount).sum();
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn recompute_is_idempotent() {
        let store = abc_store().await;
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        let first = store.recompute(GROUP).await.unwrap();
        let second = store.recompute(GROUP).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn paid_settlement_survives_when_debt_disappears() {
        let store = abc_store().await;
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        store
            .add_expense(GROUP, new_expense("Taxi", 30, "b", &[("a", 10), ("b", 10), ("c", 10)]))
            .await
            .unwrap();
        let settlements = store.group(GROUP).await.unwrap().settlements;
        let b_to_a = find(&settlements, "b", "a").id.clone();
        store.mark_paid(&b_to_a).await.unwrap();

        // B covers snacks for A and C, which brings B's ledger balance to 0
        store
            .add_expense(GROUP, new_expense("Snacks", 10, "b", &[("a", 5), ("c", 5)]))
            .await
            .unwrap();
        let balances = store.balances(GROUP).await.unwrap();
        assert_eq!(balances["b"], 0);

        let settlements = store.group(GROUP).await.unwrap().settlements;
        let paid = settlements.iter().find(|s| s.id == b_to_a).unwrap();
        assert_eq!(paid.status, SettlementStatus::Paid);
        assert_eq!(paid.amount, 10);

        // Outstanding transfers plus the paid one still settle the ledger
        let mut net = balances.clone();
        for s in &settlements {
            *net.get_mut(&s.from).unwrap() += s.amount;
            *net.get_mut(&s.to).unwrap() -= s.amount;
        }
        assert!(net.values().all(|b| *b == 0));
        assert!(settlements.iter().filter(|s| !s.is_paid()).all(|s| s.id != b_to_a));
    }

    #[tokio::test]
    async fn paid_settlement_is_not_proposed_again() {
        let store = abc_store().await;
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        let settlements = store.group(GROUP).await.unwrap().settlements;
        let b_to_a = find(&settlements, "b", "a").id.clone();
        store.mark_paid(&b_to_a).await.unwrap();

        let settlements = store.recompute(GROUP).await.unwrap();
        assert_eq!(settlements.len(), 2);
        assert_eq!(
            triples(&settlements),
            vec![
                ("b".into(), "a".into(), 30, SettlementStatus::Paid),
                pending("c", "a", 30)
            ]
        );
    }

    #[tokio::test]
    async fn stale_pending_settlements_are_removed() {
        let store = abc_store().await;
        let dinner = store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        store.delete_expense(GROUP, &dinner.id).await.unwrap();
        let group = store.group(GROUP).await.unwrap();
        assert!(group.expenses.is_empty());
        assert!(group.settlements.is_empty());
    }

    #[tokio::test]
    async fn mark_paid_errors() {
        let store = abc_store().await;
        assert!(matches!(
            store.mark_paid("nope").await,
            Err(LedgerError::SettlementNotFound(_))
        ));

        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        let id = store.group(GROUP).await.unwrap().settlements[0].id.clone();
        let paid = store.mark_paid(&id).await.unwrap();
        assert!(paid.paid_at.is_some());
        assert!(matches!(
            store.mark_paid(&id).await,
            Err(LedgerError::AlreadyPaid(_))
        ));
        let still_paid = store.group(GROUP).await.unwrap();
        assert!(still_paid.settlement(&id).unwrap().is_paid());
    }

    #[tokio::test]
    async fn summary_counts_only_pending() {
        let store = abc_store().await;
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();

        let a = store.summary(GROUP, "a").await.unwrap();
        assert_eq!((a.total_owed, a.total_owing, a.net_balance), (60, 0, 60));
        let b = store.summary(GROUP, "b").await.unwrap();
        assert_eq!((b.total_owed, b.total_owing, b.net_balance), (0, 30, -30));

        let b_to_a = find(&b.settlements, "b", "a").id.clone();
        store.mark_paid(&b_to_a).await.unwrap();

        let a = store.summary(GROUP, "a").await.unwrap();
        assert_eq!((a.total_owed, a.total_owing, a.net_balance), (30, 0, 30));
        assert_eq!(a.settlements.len(), 2);
        let b = store.summary(GROUP, "b").await.unwrap();
        assert_eq!(b.net_balance, 0);

        assert!(matches!(
            store.summary(GROUP, "zoe").await,
            Err(LedgerError::MemberNotFound(_))
        ));
    }

    #[tokio::test]
    async fn inconsistent_expense_leaves_state_untouched() {
        let store = abc_store().await;
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        let before = store.group(GROUP).await.unwrap();

        let err = store
            .add_expense(GROUP, new_expense("Broken", 50, "a", &[("b", 20)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Consistency { .. }));
        let err = store
            .add_expense(GROUP, new_expense("Stranger", 20, "zoe", &[("a", 20)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Consistency { .. }));
        let err = store
            .add_expense(
                GROUP,
                new_expense("Huge", 10, "a", &[("a", i64::MAX), ("b", i64::MAX), ("c", 12)]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Consistency { .. }));

        assert_eq!(store.group(GROUP).await.unwrap(), before);
    }

    #[tokio::test]
    async fn single_member_group_has_nothing_to_settle() {
        let store = store();
        store
            .create_group("solo", "Solo".into(), vec![member("a")])
            .await
            .unwrap();
        let balances = store.balances("solo").await.unwrap();
        assert!(balances.values().all(|b| *b == 0));
        assert!(store.recompute("solo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn members_in_use_cannot_leave() {
        let store = abc_store().await;
        store.add_member(GROUP, member("d")).await.unwrap();
        assert!(matches!(
            store.add_member(GROUP, member("d")).await,
            Err(LedgerError::MemberExists(_))
        ));
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();

        assert!(matches!(
            store.remove_member(GROUP, "b").await,
            Err(LedgerError::MemberInUse(_))
        ));
        store.remove_member(GROUP, "d").await.unwrap();
        assert!(!store.group(GROUP).await.unwrap().has_member("d"));
    }

    #[tokio::test]
    async fn deleting_a_group_drops_paid_settlements() {
        let store = abc_store().await;
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        let id = store.group(GROUP).await.unwrap().settlements[0].id.clone();
        store.mark_paid(&id).await.unwrap();

        store.delete_group(GROUP).await.unwrap();
        assert!(matches!(
            store.group(GROUP).await,
            Err(LedgerError::GroupNotFound(_))
        ));
        assert!(matches!(
            store.mark_paid(&id).await,
            Err(LedgerError::SettlementNotFound(_))
        ));
        assert!(matches!(
            store.delete_group(GROUP).await,
            Err(LedgerError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn member_settlements_span_groups() {
        let store = abc_store().await;
        store
            .create_group("flat", "Flat".into(), vec![member("a"), member("d")])
            .await
            .unwrap();
        store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        store
            .add_expense("flat", new_expense("Rent", 100, "d", &[("a", 50), ("d", 50)]))
            .await
            .unwrap();

        let settlements = store.settlements_for_member("a").await.unwrap();
        assert_eq!(settlements.len(), 3);
        let groups: HashSet<&str> = settlements.iter().map(|s| s.group_id.as_str()).collect();
        assert_eq!(groups.len(), 2);
        assert_eq!(store.settlements_for_member("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_write_keeps_expenses_and_settlements_together() {
        let repo = Arc::new(FlakyRepository::default());
        let store = SettlementStore::new(repo.clone(), Duration::from_secs(1));
        store
            .create_group(GROUP, "Trip".into(), vec![member("a"), member("b"), member("c")])
            .await
            .unwrap();
        let dinner = store
            .add_expense(GROUP, new_expense("Dinner", 90, "a", &[("a", 30), ("b", 30), ("c", 30)]))
            .await
            .unwrap();
        let before = store.group(GROUP).await.unwrap();

        repo.refuse_writes.store(true, Ordering::SeqCst);
        let err = store
            .add_expense(GROUP, new_expense("Taxi", 30, "b", &[("a", 10), ("b", 10), ("c", 10)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));
        assert_eq!(store.group(GROUP).await.unwrap(), before);

        assert!(store.delete_expense(GROUP, &dinner.id).await.is_err());
        assert_eq!(store.group(GROUP).await.unwrap(), before);

        repo.refuse_writes.store(false, Ordering::SeqCst);
        store.delete_expense(GROUP, &dinner.id).await.unwrap();
        let after = store.group(GROUP).await.unwrap();
        assert!(after.expenses.is_empty());
        assert!(after.settlements.is_empty());
        assert!(matches!(
            store.delete_expense(GROUP, &dinner.id).await,
            Err(LedgerError::ExpenseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn member_groups_are_listed_by_id() {
        let store = abc_store().await;
        store
            .create_group("flat", "Flat".into(), vec![member("a"), member("d")])
            .await
            .unwrap();

        let ids = |groups: Vec<Group>| groups.into_iter().map(|g| g.id).collect::<Vec<_>>();
        assert_eq!(ids(store.groups_for_member("a").await.unwrap()), vec!["flat", GROUP]);
        assert_eq!(ids(store.groups_for_member("b").await.unwrap()), vec![GROUP]);
        assert!(store.groups_for_member("zoe").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queued_writer_keeps_the_lock_entry_alive() {
        let locks = Arc::new(GroupLocks::new(Duration::from_millis(200)));
        let first = locks.acquire(GROUP).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(GROUP).await.unwrap();
                tokio::time::sleep(Duration::from_millis(500)).await;
            })
        };
        // Let the waiter queue up behind the first holder
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Still the waiter's lock, not a fresh one
        assert!(matches!(
            locks.acquire(GROUP).await,
            Err(LedgerError::ConcurrencyViolation { .. })
        ));
        waiter.await.unwrap();
        assert!(locks.locks.is_empty());
        drop(locks.acquire(GROUP).await.unwrap());
        assert!(locks.locks.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_group_does_not_unlock_queued_writers() {
        let store = Arc::new(abc_store().await);
        let held = store.locks.acquire(GROUP).await.unwrap();
        let deleter = {
            let store = store.clone();
            tokio::spawn(async move { store.delete_group(GROUP).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        deleter.await.unwrap().unwrap();

        assert!(store.locks.locks.is_empty());
        store
            .create_group(GROUP, "Again".into(), vec![member("a")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_groups_leave_no_lock_entries() {
        let store = abc_store().await;
        for i in 0..50 {
            let ghost = format!("ghost-{i}");
            assert!(matches!(
                store.recompute(&ghost).await,
                Err(LedgerError::GroupNotFound(_))
            ));
            assert!(matches!(
                store.add_member(&ghost, member("a")).await,
                Err(LedgerError::GroupNotFound(_))
            ));
        }
        store.recompute(GROUP).await.unwrap();
        assert!(store.locks.locks.is_empty());
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let store = SettlementStore::new(
            Arc::new(InMemoryRepository::new()),
            Duration::from_millis(20),
        );
        store
            .create_group(GROUP, "Trip".into(), vec![member("a")])
            .await
            .unwrap();

        let held = store.locks.acquire(GROUP).await.unwrap();
        assert!(matches!(
            store.recompute(GROUP).await,
            Err(LedgerError::ConcurrencyViolation { .. })
        ));
        // Other groups are not blocked
        store
            .create_group("other", "Other".into(), vec![member("a")])
            .await
            .unwrap();
        assert!(store.recompute("other").await.unwrap().is_empty());

        // The timed-out caller gave up its handle, the holder still has the entry
        assert_eq!(store.locks.locks.len(), 1);
        drop(held);
        assert!(store.locks.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_serialize_per_group() {
        let store = Arc::new(abc_store().await);
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store
                        .add_expense(
                            GROUP,
                            new_expense("Round", 30, "a", &[("a", 10), ("b", 10), ("c", 10)]),
                        )
                        .await
                        .map(|_| ())
                } else {
                    store.recompute(GROUP).await.map(|_| ())
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let group = store.group(GROUP).await.unwrap();
        assert_eq!(group.expenses.len(), 10);
        assert_eq!(
            triples(&group.settlements),
            vec![pending("b", "a", 100), pending("c", "a", 100)]
        );
        assert!(store.locks.locks.is_empty());
    }
}
