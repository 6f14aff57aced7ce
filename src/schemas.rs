use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MemberId = String;
pub type GroupId = String;
pub type ExpenseId = String;
pub type SettlementId = String;

/// Amounts are kept in minor units (cents) so balances add up exactly.
pub type Amount = i64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    #[default]
    Member,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Member {
    pub id: MemberId,
    pub name: Option<String>,
    pub email: String,
    #[serde(default)]
    pub role: MemberRole,
}

/// A group is stored as a single document: its members, expenses and the
/// settlements derived from them travel together.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub expenses: Vec<Expense>,
    #[serde(default)]
    pub settlements: Vec<Settlement>,
}

impl Group {
    pub fn new(id: GroupId, name: String, members: Vec<Member>) -> Self {
        Group {
            id,
            name,
            created_at: Utc::now(),
            members,
            expenses: vec![],
            settlements: vec![],
        }
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn has_member(&self, member_id: &str) -> bool {
        self.members.iter().any(|m| m.id == member_id)
    }

    pub fn settlement(&self, settlement_id: &str) -> Option<&Settlement> {
        self.settlements.iter().find(|s| s.id == settlement_id)
    }

    /// Whether any expense, split or settlement still points at the member.
    pub fn references_member(&self, member_id: &str) -> bool {
        self.expenses.iter().any(|e| {
            e.paid_by == member_id || e.splits.iter().any(|s| s.member_id == member_id)
        }) || self.settlements.iter().any(|s| s.involves(member_id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub group_id: GroupId,
    pub description: String,
    pub amount: Amount,
    pub paid_by: MemberId,
    pub created_at: DateTime<Utc>,
    pub splits: Vec<Split>,
}

impl Expense {
    /// Sum of the split amounts, `None` if it doesn't fit in an `Amount`.
    pub fn split_total(&self) -> Option<Amount> {
        self.splits
            .iter()
            .try_fold(0, |total: Amount, s| total.checked_add(s.amount_owed))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Split {
    pub expense_id: ExpenseId,
    pub member_id: MemberId,
    pub amount_owed: Amount,
}

/// An expense as submitted, before it gets an id and a timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NewExpense {
    pub description: String,
    pub amount: Amount,
    pub paid_by: MemberId,
    pub splits: Vec<NewSplit>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NewSplit {
    pub member_id: MemberId,
    pub amount_owed: Amount,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Paid,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub group_id: GroupId,
    pub from: MemberId,
    pub to: MemberId,
    pub amount: Amount,
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

impl Settlement {
    pub fn is_paid(&self) -> bool {
        self.status == SettlementStatus::Paid
    }

    pub fn involves(&self, member_id: &str) -> bool {
        self.from == member_id || self.to == member_id
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SettlementSummary {
    pub settlements: Vec<Settlement>,
    /// Pending amounts other members owe to this member.
    pub total_owed: Amount,
    /// Pending amounts this member owes to others.
    pub total_owing: Amount,
    pub net_balance: Amount,
}
