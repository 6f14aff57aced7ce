use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::balance::split_equally;
use crate::error::LedgerError;
use crate::repository::LedgerRepository;
use crate::schemas::{Amount, Member, MemberId, NewExpense, NewSplit};
use crate::store::SettlementStore;

type Store<R> = web::Data<SettlementStore<R>>;
type Reply = Result<HttpResponse, LedgerError>;

#[derive(Deserialize)]
struct GroupJson {
    name: String,
    #[serde(default)]
    members: Vec<Member>,
}

/// Either explicit `splits` or a list of members to split evenly between.
#[derive(Deserialize)]
struct ExpenseJson {
    description: String,
    amount: Amount,
    paid_by: MemberId,
    #[serde(default)]
    splits: Vec<NewSplit>,
    #[serde(default)]
    split_between: Vec<MemberId>,
}

impl ExpenseJson {
    fn into_new_expense(self) -> Result<NewExpense, LedgerError> {
        let splits = match (self.splits.is_empty(), self.split_between.is_empty()) {
            (false, true) => self.splits,
            (true, false) => split_equally(self.amount, &self.split_between)?,
            (true, true) => {
                return Err(LedgerError::InvalidRequest(
                    "either splits or split_between is required".to_string(),
                ))
            }
            (false, false) => {
                return Err(LedgerError::InvalidRequest(
                    "splits and split_between can't be combined".to_string(),
                ))
            }
        };
        Ok(NewExpense {
            description: self.description,
            amount: self.amount,
            paid_by: self.paid_by,
            splits,
        })
    }
}

#[derive(Deserialize)]
struct MemberQuery {
    member: MemberId,
}

async fn member_groups<R: LedgerRepository + 'static>(
    store: Store<R>,
    query: web::Query<MemberQuery>,
) -> Reply {
    Ok(HttpResponse::Ok().json(store.groups_for_member(&query.member).await?))
}

async fn add_group<R: LedgerRepository + 'static>(
    store: Store<R>,
    id: web::Path<String>,
    json: web::Json<GroupJson>,
) -> Reply {
    let json = json.into_inner();
    let group = store.create_group(&id, json.name, json.members).await?;
    Ok(HttpResponse::Created().json(group))
}

async fn get_group<R: LedgerRepository + 'static>(store: Store<R>, id: web::Path<String>) -> Reply {
    Ok(HttpResponse::Ok().json(store.group(&id).await?))
}

async fn delete_group<R: LedgerRepository + 'static>(
    store: Store<R>,
    id: web::Path<String>,
) -> Reply {
    store.delete_group(&id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn add_member<R: LedgerRepository + 'static>(
    store: Store<R>,
    id: web::Path<String>,
    member: web::Json<Member>,
) -> Reply {
    Ok(HttpResponse::Ok().json(store.add_member(&id, member.into_inner()).await?))
}

async fn remove_member<R: LedgerRepository + 'static>(
    store: Store<R>,
    path: web::Path<(String, String)>,
) -> Reply {
    let (group_id, member_id) = path.into_inner();
    store.remove_member(&group_id, &member_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn add_expense<R: LedgerRepository + 'static>(
    store: Store<R>,
    id: web::Path<String>,
    expense: web::Json<ExpenseJson>,
) -> Reply {
    let expense = expense.into_inner().into_new_expense()?;
    Ok(HttpResponse::Created().json(store.add_expense(&id, expense).await?))
}

async fn delete_expense<R: LedgerRepository + 'static>(
    store: Store<R>,
    path: web::Path<(String, String)>,
) -> Reply {
    let (group_id, expense_id) = path.into_inner();
    store.delete_expense(&group_id, &expense_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn get_balance<R: LedgerRepository + 'static>(
    store: Store<R>,
    id: web::Path<String>,
) -> Reply {
    Ok(HttpResponse::Ok().json(store.balances(&id).await?))
}

async fn recompute<R: LedgerRepository + 'static>(store: Store<R>, id: web::Path<String>) -> Reply {
    Ok(HttpResponse::Ok().json(store.recompute(&id).await?))
}

async fn get_summary<R: LedgerRepository + 'static>(
    store: Store<R>,
    id: web::Path<String>,
    query: web::Query<MemberQuery>,
) -> Reply {
    Ok(HttpResponse::Ok().json(store.summary(&id, &query.member).await?))
}

async fn mark_paid<R: LedgerRepository + 'static>(
    store: Store<R>,
    id: web::Path<String>,
) -> Reply {
    match store.mark_paid(&id).await {
        Ok(settlement) => Ok(HttpResponse::Ok().json(settlement)),
        // Paying twice is harmless, the caller just gets told
        Err(LedgerError::AlreadyPaid(id)) => {
            info!(settlement_id = %id, "ignoring repeated payment");
            Ok(HttpResponse::Ok().json(json!({ "id": id, "status": "PAID", "already_paid": true })))
        }
        Err(err) => Err(err),
    }
}

async fn member_settlements<R: LedgerRepository + 'static>(
    store: Store<R>,
    id: web::Path<String>,
) -> Reply {
    Ok(HttpResponse::Ok().json(store.settlements_for_member(&id).await?))
}

/// Registers every route against a store backed by `R`.
pub fn configure<R: LedgerRepository + 'static>(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/groups").route(web::get().to(member_groups::<R>)))
    .service(
        web::resource("/groups/settlements/{id}/paid").route(web::patch().to(mark_paid::<R>)),
    )
    .service(
        web::resource("/groups/{id}")
            .route(web::put().to(add_group::<R>))
            .route(web::get().to(get_group::<R>))
            .route(web::delete().to(delete_group::<R>)),
    )
    .service(web::resource("/groups/{id}/members").route(web::post().to(add_member::<R>)))
    .service(
        web::resource("/groups/{id}/members/{member}")
            .route(web::delete().to(remove_member::<R>)),
    )
    .service(web::resource("/groups/{id}/expenses").route(web::post().to(add_expense::<R>)))
    .service(
        web::resource("/groups/{id}/expenses/{expense}")
            .route(web::delete().to(delete_expense::<R>)),
    )
    .service(web::resource("/groups/{id}/balance").route(web::get().to(get_balance::<R>)))
    .service(
        web::resource("/groups/{id}/settlements/recompute").route(web::post().to(recompute::<R>)),
    )
    .service(
        web::resource("/groups/{id}/settlements/summary").route(web::get().to(get_summary::<R>)),
    )
    .service(
        web::resource("/members/{id}/settlements").route(web::get().to(member_settlements::<R>)),
    );
}
