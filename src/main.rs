#[macro_use]
extern crate diesel;

use std::fmt::Display;
use std::io;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager};
use log::{error, info};
use openssl::ssl::{SslAcceptor, SslAcceptorBuilder, SslFiletype, SslMethod};

mod actions;
mod blobs;
mod cipher;
mod config;
mod download;
mod error;
mod identity;
mod keys;
mod models;
mod notify;
mod routes;
mod schema;
mod shares;
mod state;
mod store;
mod tokens;
mod upload;

use crate::blobs::BlobStore;
use crate::config::{Config, TlsConfig};
use crate::keys::EncryptionKey;
use crate::notify::LogNotifier;
use crate::state::AppState;
use crate::store::PgStore;

fn startup_error<E: Display>(e: E) -> io::Error {
    error!("startup failed: {}", e);
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn ssl_acceptor(tls: &TlsConfig) -> io::Result<SslAcceptorBuilder> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls()).map_err(startup_error)?;
    builder
        .set_private_key_file(&tls.key_file, SslFiletype::PEM)
        .map_err(startup_error)?;
    builder
        .set_certificate_chain_file(&tls.cert_file)
        .map_err(startup_error)?;
    Ok(builder)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    sodiumoxide::init().map_err(|_| startup_error("could not initialize libsodium"))?;

    let config = Config::from_env().map_err(startup_error)?;
    let key = EncryptionKey::from_env().map_err(startup_error)?;

    // Set up database connection pool
    let manager = ConnectionManager::<PgConnection>::new(config.database_url.as_str());
    let pool = r2d2::Pool::builder()
        .build(manager)
        .map_err(startup_error)?;

    let blobs = BlobStore::open(config.storage_dir.clone()).await?;
    info!("storing encrypted blobs under {:?}", blobs.root());

    let state = web::Data::new(AppState::new(
        Arc::new(PgStore::new(pool)),
        blobs,
        Arc::new(key),
        Arc::new(LogNotifier),
        config.token_lifetime_hours,
        &config.public_base_url,
        config.max_upload_bytes,
    ));

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(routes::configure)
    });

    let server = match &config.tls {
        Some(tls) => {
            info!("listening on https://{}", config.bind_address);
            server.bind_openssl(&config.bind_address, ssl_acceptor(tls)?)?
        }
        None => {
            info!("listening on http://{}", config.bind_address);
            server.bind(&config.bind_address)?
        }
    };
    server.run().await
}
