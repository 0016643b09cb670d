pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod membership;
pub mod observer;
pub mod relay;
pub mod transport;

pub use config::Config;
pub use observer::{LoggingObserver, RelayObserver};
pub use relay::Relay;

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;

pub async fn startup(config: Config) -> Result<()> {
    let relay = Relay::new(Arc::new(LoggingObserver));
    let router = http::router(relay);

    log::info!("listening on {}", config.listen);

    #[cfg(feature = "ssl")]
    if let (Some(cert), Some(key)) = (&config.cert, &config.key) {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
        axum_server::bind_rustls(config.listen, tls)
            .serve(router.into_make_service())
            .await?;
        return Ok(());
    }

    #[cfg(not(feature = "ssl"))]
    if config.cert.is_some() || config.key.is_some() {
        anyhow::bail!("--cert/--key require the relay to be built with the `ssl` feature");
    }

    let listener = TcpListener::bind(config.listen).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
