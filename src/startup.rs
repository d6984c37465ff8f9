use std::net::TcpListener;
use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, web, web::Data};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing_actix_web::TracingLogger;

use crate::configuration::{DatabaseSettings, IdempotencySettings, Settings};
use crate::payments::{HttpPaymentGateway, PaymentGateway};
use crate::routes::{create_ride, get_ride, health_check};

pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(configuration: Settings) -> Result<Self, anyhow::Error> {
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(HttpPaymentGateway::new(&configuration.payment)?);
        Self::build_with_gateway(configuration, gateway).await
    }

    /// Tests inject a scripted gateway here; `build` wires the HTTP one.
    pub async fn build_with_gateway(
        configuration: Settings,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, anyhow::Error> {
        let connection_pool = get_connection_pool(&configuration.database);

        let address = format!(
            "{}:{}",
            configuration.application.host, configuration.application.port,
        );
        let listener = TcpListener::bind(address)?;
        let port = listener.local_addr()?.port();
        let server = run(listener, connection_pool, configuration.idempotency, gateway)?;

        Ok(Self { port, server })
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    // Only returns once the server stops.
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

fn run(
    listener: TcpListener,
    db_pool: PgPool,
    idempotency: IdempotencySettings,
    gateway: Arc<dyn PaymentGateway>,
) -> Result<Server, anyhow::Error> {
    let db_pool = Data::new(db_pool);
    let idempotency = Data::new(idempotency);
    let gateway: Data<dyn PaymentGateway> = Data::from(gateway);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .route("/rides", web::post().to(create_ride))
            .route("/rides/{ride_id}", web::get().to(get_ride))
            .app_data(db_pool.clone())
            .app_data(idempotency.clone())
            .app_data(gateway.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}

#[must_use]
pub fn get_connection_pool(configuration: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new().connect_lazy_with(configuration.connect_options())
}
