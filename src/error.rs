//! Error taxonomy shared by the engine, the repositories and the HTTP layer.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::schemas::{Amount, ExpenseId, GroupId, MemberId, SettlementId};

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Why an expense cannot take part in a balance computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyReason {
    #[error("splits add up to {split_total} but the expense amount is {amount}")]
    SplitTotalMismatch { amount: Amount, split_total: Amount },

    #[error("member {0} is not part of the group")]
    UnknownMember(MemberId),

    #[error("expense belongs to group {0}")]
    WrongGroup(GroupId),

    #[error("split for member {0} is negative")]
    NegativeSplit(MemberId),

    #[error("member {0} appears in more than one split")]
    DuplicateSplit(MemberId),

    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Amount),

    #[error("amounts are too large to add up")]
    AmountOverflow,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Expense {expense_id} is inconsistent: {reason}")]
    Consistency {
        expense_id: ExpenseId,
        reason: ConsistencyReason,
    },

    #[error("Couldn't find group {0}")]
    GroupNotFound(GroupId),

    #[error("Couldn't find settlement {0}")]
    SettlementNotFound(SettlementId),

    #[error("Couldn't find expense {0}")]
    ExpenseNotFound(ExpenseId),

    #[error("Couldn't find member {0}")]
    MemberNotFound(MemberId),

    #[error("Settlement {0} is already paid")]
    AlreadyPaid(SettlementId),

    #[error("Timed out waiting for the lock on group {group_id}")]
    ConcurrencyViolation { group_id: GroupId },

    #[error("Group {0} already exists")]
    GroupExists(GroupId),

    #[error("Member {0} already belongs to the group")]
    MemberExists(MemberId),

    #[error("Member {0} still has expenses or settlements in the group")]
    MemberInUse(MemberId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bson::ser::Error),
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::GroupNotFound(_)
                | Self::SettlementNotFound(_)
                | Self::ExpenseNotFound(_)
                | Self::MemberNotFound(_)
        )
    }

    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Consistency { .. } => "CONSISTENCY_ERROR",
            Self::GroupNotFound(_)
            | Self::SettlementNotFound(_)
            | Self::ExpenseNotFound(_)
            | Self::MemberNotFound(_) => "NOT_FOUND",
            Self::AlreadyPaid(_) => "ALREADY_PAID",
            Self::ConcurrencyViolation { .. } => "CONCURRENCY_VIOLATION",
            Self::GroupExists(_) | Self::MemberExists(_) | Self::MemberInUse(_) => "CONFLICT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Database(_) | Self::Serialization(_) => "STORAGE_ERROR",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ResponseError for LedgerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Consistency { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::GroupNotFound(_)
            | Self::SettlementNotFound(_)
            | Self::ExpenseNotFound(_)
            | Self::MemberNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyPaid(_)
            | Self::GroupExists(_)
            | Self::MemberExists(_)
            | Self::MemberInUse(_) => StatusCode::CONFLICT,
            Self::ConcurrencyViolation { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Database(_) | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.is_not_found() {
            debug!(error = %self, "lookup missed");
        } else if self.status_code().is_server_error() {
            warn!(error = %self, code = self.error_code(), "request failed");
        }
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
        })
    }
}
