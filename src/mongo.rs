use futures::TryStreamExt;
use mongodb::{bson::doc, Client, Collection};

use crate::error::{LedgerError, LedgerResult};
use crate::repository::LedgerRepository;
use crate::schemas::{Expense, Group, Member, Settlement};

const GROUPS_COLLECTION: &str = "Groups";

/// Stores each group as one document with its members, expenses and
/// settlements embedded, so every per-group write is a single-document update.
#[derive(Clone)]
pub struct MongoRepository {
    groups: Collection<Group>,
}

impl MongoRepository {
    pub fn new(client: &Client, database: &str) -> Self {
        MongoRepository {
            groups: client.database(database).collection(GROUPS_COLLECTION),
        }
    }

    async fn update_group(
        &self,
        group_id: &str,
        update: mongodb::bson::Document,
    ) -> LedgerResult<()> {
        let result = self
            .groups
            .update_one(doc! { "id": group_id }, update, None)
            .await?;
        if result.matched_count == 0 {
            return Err(LedgerError::GroupNotFound(group_id.to_string()));
        }
        Ok(())
    }
}

impl LedgerRepository for MongoRepository {
    async fn create_group(&self, group: Group) -> LedgerResult<()> {
        if self.find_group(&group.id).await?.is_some() {
            return Err(LedgerError::GroupExists(group.id));
        }
        self.groups.insert_one(&group, None).await?;
        Ok(())
    }

    async fn find_group(&self, group_id: &str) -> LedgerResult<Option<Group>> {
        Ok(self.groups.find_one(doc! { "id": group_id }, None).await?)
    }

    async fn find_group_by_settlement(&self, settlement_id: &str) -> LedgerResult<Option<Group>> {
        Ok(self
            .groups
            .find_one(doc! { "settlements.id": settlement_id }, None)
            .await?)
    }

    async fn find_groups_for_member(&self, member_id: &str) -> LedgerResult<Vec<Group>> {
        let cursor = self
            .groups
            .find(doc! { "members.id": member_id }, None)
            .await?;
        let mut groups: Vec<Group> = cursor.try_collect().await?;
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn delete_group(&self, group_id: &str) -> LedgerResult<bool> {
        let result = self.groups.delete_one(doc! { "id": group_id }, None).await?;
        Ok(result.deleted_count > 0)
    }

    async fn add_member(&self, group_id: &str, member: Member) -> LedgerResult<()> {
        let member = bson::to_bson(&member)?;
        self.update_group(group_id, doc! { "$push": { "members": member } })
            .await?;
        Ok(())
    }

    async fn remove_member(&self, group_id: &str, member_id: &str) -> LedgerResult<()> {
        self.update_group(
            group_id,
            doc! { "$pull": { "members": { "id": member_id } } },
        )
        .await?;
        Ok(())
    }

    async fn insert_expense(
        &self,
        group_id: &str,
        expense: Expense,
        settlements: Vec<Settlement>,
    ) -> LedgerResult<()> {
        let expense = bson::to_bson(&expense)?;
        let settlements = bson::to_bson(&settlements)?;
        self.update_group(
            group_id,
            doc! {
                "$push": { "expenses": expense },
                "$set": { "settlements": settlements },
            },
        )
        .await?;
        Ok(())
    }

    async fn delete_expense(
        &self,
        group_id: &str,
        expense_id: &str,
        settlements: Vec<Settlement>,
    ) -> LedgerResult<bool> {
        let settlements = bson::to_bson(&settlements)?;
        // Only matches while the expense is still there, so a miss writes nothing
        let result = self
            .groups
            .update_one(
                doc! { "id": group_id, "expenses.id": expense_id },
                doc! {
                    "$pull": { "expenses": { "id": expense_id } },
                    "$set": { "settlements": settlements },
                },
                None,
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn replace_settlements(
        &self,
        group_id: &str,
        settlements: Vec<Settlement>,
    ) -> LedgerResult<()> {
        let settlements = bson::to_bson(&settlements)?;
        self.update_group(group_id, doc! { "$set": { "settlements": settlements } })
            .await?;
        Ok(())
    }
}
