//! Storage seam for groups and everything that hangs off them.

use std::future::Future;

use crate::error::LedgerResult;
use crate::schemas::{Expense, Group, Member, Settlement};

/// Persistence for groups, their members, expenses and settlements.
///
/// The settlement store only calls mutating methods while it holds the
/// group's lock, so implementations don't have to guard against concurrent
/// writers on the same group. Every method is a single all-or-nothing write.
pub trait LedgerRepository: Send + Sync {
    /// Inserts a new group. Fails with `GroupExists` if the id is taken.
    fn create_group(&self, group: Group) -> impl Future<Output = LedgerResult<()>> + Send;

    fn find_group(&self, group_id: &str)
        -> impl Future<Output = LedgerResult<Option<Group>>> + Send;

    /// Finds the group that holds the given settlement.
    fn find_group_by_settlement(
        &self,
        settlement_id: &str,
    ) -> impl Future<Output = LedgerResult<Option<Group>>> + Send;

    /// Lists every group the member belongs to.
    fn find_groups_for_member(
        &self,
        member_id: &str,
    ) -> impl Future<Output = LedgerResult<Vec<Group>>> + Send;

    /// Deletes the group with everything inside it. Returns whether it existed.
    fn delete_group(&self, group_id: &str) -> impl Future<Output = LedgerResult<bool>> + Send;

    fn add_member(
        &self,
        group_id: &str,
        member: Member,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    fn remove_member(
        &self,
        group_id: &str,
        member_id: &str,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    /// Appends an expense and stores the settlements derived with it, in one
    /// write.
    fn insert_expense(
        &self,
        group_id: &str,
        expense: Expense,
        settlements: Vec<Settlement>,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    /// Removes an expense together with its splits and stores the settlements
    /// derived without it, in one write. Returns whether the expense existed;
    /// nothing is written when it didn't.
    fn delete_expense(
        &self,
        group_id: &str,
        expense_id: &str,
        settlements: Vec<Settlement>,
    ) -> impl Future<Output = LedgerResult<bool>> + Send;

    /// Swaps the whole settlement set of a group in one write.
    fn replace_settlements(
        &self,
        group_id: &str,
        settlements: Vec<Settlement>,
    ) -> impl Future<Output = LedgerResult<()>> + Send;
}
