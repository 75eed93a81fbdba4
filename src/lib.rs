//! POS checkout finalization with Costa Rica e-invoicing.
//!
//! The host (frontend shell, kiosk runner) opens a [`PosSession`] over its
//! data directory, forwards the UI events it receives to the screens, and
//! calls [`FinalizationController::finalize_validation`] once the operator
//! validates a paid order.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
pub mod db;
pub mod drawer;
pub mod finalize;
pub mod gui;
pub mod order;
pub mod partner;
pub mod receipt;
pub mod storage;

pub use api::{OdooClient, OrderSubmitter, QueryParams, RecordQuery, RpcError};
pub use config::{ConfigError, FinalizeSettings, LookupRetry, PosConfig};
pub use finalize::{FailureKind, FinalizationController, FinalizeOutcome, SubmitFailure};
pub use gui::{EventGui, Gui, Popup, Screen, UiEvent};
pub use order::{InvoiceNumbers, Order, OrderLine, PaymentLine, TenderKind};
pub use partner::{Partner, VatType};

/// Initialize structured logging: console plus a daily rolling file in
/// `log_dir`. Keep the returned guard alive; dropping it flushes the file.
pub fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_einvoicing_lib=debug"));

    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(log_dir, "pos");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    // A host may already have installed a subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        "pos-einvoicing starting"
    );
    guard
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("database: {0}")]
    Db(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend client: {0}")]
    Client(#[from] RpcError),
}

/// Everything a terminal needs to check out orders.
pub struct PosSession {
    pub db: Arc<db::DbState>,
    pub config: PosConfig,
    pub client: Arc<OdooClient>,
    pub controller: FinalizationController,
}

impl PosSession {
    /// Open the settings store under `data_dir` and wire the controller.
    /// The receiver yields the navigation requests for the frontend.
    pub fn open(data_dir: &Path) -> Result<(Self, UnboundedReceiver<UiEvent>), SessionError> {
        let db = db::init(data_dir).map_err(SessionError::Db)?;
        let config = PosConfig::load(&db)?;
        Self::from_parts(Arc::new(db), config)
    }

    pub fn from_parts(
        db: Arc<db::DbState>,
        config: PosConfig,
    ) -> Result<(Self, UnboundedReceiver<UiEvent>), SessionError> {
        let client = Arc::new(OdooClient::new(&config.backend)?);
        let drawer = drawer::drawer_for_mode(&config.drawer_mode);
        let (gui, events) = EventGui::channel();

        let controller = FinalizationController::new(
            config.finalize,
            drawer,
            client.clone(),
            client.clone(),
            Arc::new(gui),
        );

        info!(
            backend = %client.base_url(),
            drawer = ?config.drawer_mode,
            cashdrawer = config.finalize.iface_cashdrawer,
            "pos session ready"
        );

        Ok((
            Self {
                db,
                config,
                client,
                controller,
            },
            events,
        ))
    }

    /// Customers with the e-invoicing fields, for the client list screen.
    pub async fn load_partners(&self) -> Result<Vec<Partner>, RpcError> {
        partner::load_partners(self.client.as_ref(), serde_json::json!([])).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
