//! Admin endpoint with deferred startup.
//!
//! `new()` wires the shared state, `start()` binds the TCP listener and
//! reports the real port, `serve()` accepts connections until the shutdown
//! future fires. The split lets the binary start background workers between
//! binding and serving, and lets tests bind port 0.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, put};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::telemetry::LogLevelHandle;

use super::config::NetworkConfig;
use super::handlers::{self, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

pub struct NetworkModule {
    config: NetworkConfig,
    coordinator: Arc<Coordinator>,
    loglevel: LogLevelHandle,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Wire the module without binding any port.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        coordinator: Arc<Coordinator>,
        loglevel: LogLevelHandle,
    ) -> Self {
        Self {
            config,
            coordinator,
            loglevel,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// The controller shared with the shutdown RPC and the signal loop.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assemble the admin router: the unauthenticated overview surface, the
    /// authenticated RPC tree under `/api/topom`, and the health probes.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            coordinator: Arc::clone(&self.coordinator),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            loglevel: self.loglevel.clone(),
            start_time: Instant::now(),
        };

        let layers = build_http_layers(&self.config);

        let api = Router::new()
            .route("/model", get(handlers::overview::model))
            .route("/xping/{xauth}", get(handlers::overview::xping))
            .route("/stats/{xauth}", get(handlers::overview::stats_auth))
            .route("/slots/{xauth}", get(handlers::overview::slots_auth))
            .route("/reload/{xauth}", put(handlers::overview::reload))
            .route("/shutdown/{xauth}", put(handlers::overview::shutdown))
            .route("/loglevel/{xauth}/{value}", put(handlers::overview::loglevel))
            .route("/proxy/create/{xauth}/{addr}", put(handlers::proxies::create))
            .route("/proxy/online/{xauth}/{addr}", put(handlers::proxies::online))
            .route("/proxy/reinit/{xauth}/{token}", put(handlers::proxies::reinit))
            .route(
                "/proxy/remove/{xauth}/{token}/{force}",
                put(handlers::proxies::remove),
            )
            .route("/group/create/{xauth}/{gid}", put(handlers::groups::create))
            .route("/group/remove/{xauth}/{gid}", put(handlers::groups::remove))
            .route("/group/resync/{xauth}/{gid}", put(handlers::groups::resync))
            .route("/group/resync-all/{xauth}", put(handlers::groups::resync_all))
            .route(
                "/group/add/{xauth}/{gid}/{addr}",
                put(handlers::groups::add_server),
            )
            .route(
                "/group/add/{xauth}/{gid}/{addr}/{datacenter}",
                put(handlers::groups::add_server_dc),
            )
            .route(
                "/group/del/{xauth}/{gid}/{addr}",
                put(handlers::groups::del_server),
            )
            .route(
                "/group/promote/{xauth}/{gid}/{addr}/{force}",
                put(handlers::groups::promote),
            )
            .route(
                "/group/promote-commit/{xauth}/{gid}",
                put(handlers::groups::promote_commit),
            )
            .route(
                "/group/action/create/{xauth}/{addr}",
                put(handlers::groups::action_create),
            )
            .route(
                "/group/action/remove/{xauth}/{addr}",
                put(handlers::groups::action_remove),
            )
            .route(
                "/slots/action/create/{xauth}/{sid}/{gid}",
                put(handlers::slots::action_create),
            )
            .route(
                "/slots/action/create-some/{xauth}/{src}/{dst}/{num}",
                put(handlers::slots::action_create_some),
            )
            .route(
                "/slots/action/create-range/{xauth}/{beg}/{end}/{gid}",
                put(handlers::slots::action_create_range),
            )
            .route(
                "/slots/action/remove/{xauth}/{sid}",
                put(handlers::slots::action_remove),
            )
            .route(
                "/slots/action/remove-all/{xauth}",
                put(handlers::slots::action_remove_all),
            )
            .route(
                "/slots/action/interval/{xauth}/{value}",
                put(handlers::slots::action_interval),
            )
            .route(
                "/slots/action/disabled/{xauth}/{value}",
                put(handlers::slots::action_disabled),
            )
            .route("/slots/assign/{xauth}", put(handlers::slots::assign))
            .route(
                "/slots/assign/{xauth}/offline",
                put(handlers::slots::assign_offline),
            )
            .route(
                "/slots/rebalance/{xauth}/{confirm}",
                put(handlers::slots::rebalance),
            )
            .route("/sentinels/add/{xauth}/{addr}", put(handlers::sentinels::add))
            .route(
                "/sentinels/del/{xauth}/{addr}/{force}",
                put(handlers::sentinels::del),
            )
            .route(
                "/sentinels/resync-all/{xauth}",
                put(handlers::sentinels::resync_all),
            )
            .route(
                "/sentinels/remove-all/{xauth}",
                put(handlers::sentinels::remove_all),
            )
            .route(
                "/sentinels/remove-group/{xauth}/{gid}",
                put(handlers::sentinels::remove_group),
            )
            .route(
                "/expansion/add-plan/{xauth}/{plan}",
                put(handlers::expansion::add_plan),
            )
            .route(
                "/expansion/pull-plan/{xauth}",
                get(handlers::expansion::pull_plan),
            )
            .route("/expansion/sync/{xauth}/{planid}", put(handlers::expansion::sync))
            .route(
                "/expansion/backup/{xauth}/{planid}/{force}",
                put(handlers::expansion::backup),
            )
            .route(
                "/expansion/slots-migrate/{xauth}/{planid}",
                put(handlers::expansion::slots_migrate),
            )
            .route("/expansion/clean/{xauth}/{planid}", put(handlers::expansion::clean))
            .route(
                "/expansion/group-clean/{xauth}/{gid}",
                put(handlers::expansion::group_clean),
            )
            .route(
                "/expansion/del-plan/{xauth}/{planid}",
                put(handlers::expansion::del_plan),
            );

        Router::new()
            .route("/topom", get(handlers::overview::overview))
            .route("/topom/model", get(handlers::overview::model))
            .route("/topom/stats", get(handlers::overview::stats))
            .route("/topom/slots", get(handlers::overview::slots))
            .nest("/api/topom", api)
            .route("/healthz", get(handlers::health::health_handler))
            .route("/readyz", get(handlers::health::readiness_handler))
            .route("/livez", get(handlers::health::liveness_handler))
            .fallback(handlers::not_found)
            .layer(layers)
            .with_state(state)
    }

    /// Bind the listener. Returns the real port, which differs from the
    /// configured one when port 0 was requested.
    ///
    /// # Errors
    ///
    /// Fails when the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "admin listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serve until `shutdown` resolves, then drain in-flight calls.
    ///
    /// Consumes `self` because the listener moves into the server.
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal I/O failure in the accept loop.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let listener = self
            .listener
            .expect("start() must be called before serve()");
        let controller = self.shutdown;
        let drain_timeout = self.config.drain_timeout;
        let tls = self.config.tls;

        controller.set_ready();

        if let Some(ref tls_config) = tls {
            serve_tls(listener, router, tls_config, shutdown).await?;
        } else {
            serve_plain(listener, router, shutdown).await?;
        }

        controller.trigger_shutdown();
        if controller.wait_for_drain(drain_timeout).await {
            info!("admin endpoint drained");
        } else {
            warn!("drain timeout expired with admin calls still running");
        }
        Ok(())
    }
}

/// Plain HTTP via axum's built-in server.
async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// TLS via `axum-server` with rustls, reusing the pre-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls_config: &super::config::TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls_config.cert_path, &tls_config.key_path)
        .await
        .map_err(|err| anyhow::anyhow!("failed to load TLS certificates: {err}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving TLS");

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
