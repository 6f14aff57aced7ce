use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::{LedgerError, LedgerResult};
use crate::repository::LedgerRepository;
use crate::schemas::{Expense, Group, Member, Settlement};

/// Keeps every group in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryRepository {
    groups: RwLock<HashMap<String, Group>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerRepository for InMemoryRepository {
    async fn create_group(&self, group: Group) -> LedgerResult<()> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(&group.id) {
            return Err(LedgerError::GroupExists(group.id));
        }
        groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn find_group(&self, group_id: &str) -> LedgerResult<Option<Group>> {
        Ok(self.groups.read().await.get(group_id).cloned())
    }

    async fn find_group_by_settlement(&self, settlement_id: &str) -> LedgerResult<Option<Group>> {
        Ok(self
            .groups
            .read()
            .await
            .values()
            .find(|g| g.settlement(settlement_id).is_some())
            .cloned())
    }

    async fn find_groups_for_member(&self, member_id: &str) -> LedgerResult<Vec<Group>> {
        let mut groups: Vec<Group> = self
            .groups
            .read()
            .await
            .values()
            .filter(|g| g.has_member(member_id))
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn delete_group(&self, group_id: &str) -> LedgerResult<bool> {
        Ok(self.groups.write().await.remove(group_id).is_some())
    }

    async fn add_member(&self, group_id: &str, member: Member) -> LedgerResult<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| LedgerError::GroupNotFound(group_id.to_string()))?;
        group.members.push(member);
        Ok(())
    }

    async fn remove_member(&self, group_id: &str, member_id: &str) -> LedgerResult<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| LedgerError::GroupNotFound(group_id.to_string()))?;
        group.members.retain(|m| m.id != member_id);
        Ok(())
    }

    async fn insert_expense(
        &self,
        group_id: &str,
        expense: Expense,
        settlements: Vec<Settlement>,
    ) -> LedgerResult<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| LedgerError::GroupNotFound(group_id.to_string()))?;
        group.expenses.push(expense);
        group.settlements = settlements;
        Ok(())
    }

    async fn delete_expense(
        &self,
        group_id: &str,
        expense_id: &str,
        settlements: Vec<Settlement>,
    ) -> LedgerResult<bool> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| LedgerError::GroupNotFound(group_id.to_string()))?;
        let Some(index) = group.expenses.iter().position(|e| e.id == expense_id) else {
            return Ok(false);
        };
        group.expenses.remove(index);
        group.settlements = settlements;
        Ok(true)
    }

    async fn replace_settlements(
        &self,
        group_id: &str,
        settlements: Vec<Settlement>,
    ) -> LedgerResult<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(group_id)
            .ok_or_else(|| LedgerError::GroupNotFound(group_id.to_string()))?;
        group.settlements = settlements;
        Ok(())
    }
}
