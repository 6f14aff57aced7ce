use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use mongodb::Client;
use splitledger::config::Config;
use splitledger::mongo::MongoRepository;
use splitledger::{routes, telemetry, SettlementStore};
use tracing::info;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    telemetry::init();

    let config = Config::from_env().expect("invalid configuration");
    info!(database = %config.database, "connecting to MongoDB");

    let client = Client::with_uri_str(&config.mongodb_uri)
        .await
        .expect("failed to connect");
    info!("connected");

    let repo = Arc::new(MongoRepository::new(&client, &config.database));
    let store = web::Data::new(SettlementStore::new(repo, config.lock_timeout));

    info!(host = %config.host, port = config.port, "listening");
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(store.clone())
            .configure(routes::configure::<MongoRepository>)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}
