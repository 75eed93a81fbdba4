//! Post-payment finalization.
//!
//! Runs once the operator validates a fully paid order:
//!
//! 1. kick the cash drawer (cash tender + drawer enabled), fire-and-forget;
//! 2. stamp the validation date and mark the order finalized;
//! 3. send the order, with server-side invoicing when the order asks for it;
//! 4. look up the invoice identifiers the backend assigned and move the UI
//!    to the receipt screen.
//!
//! A failed invoicing round-trip reverts the order to not finalized and
//! shows a popup matching the failure, so the operator can fix the cause
//! and validate again. The plain-sale submission runs in the background and
//! its failures are only logged.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::{
    OrderSubmitter, QueryParams, RecordQuery, RpcError, MISSING_CUSTOMER, SERVER_ERROR_CODE,
};
use crate::config::FinalizeSettings;
use crate::drawer::CashDrawer;
use crate::gui::{Gui, Popup, Screen};
use crate::order::{InvoiceNumbers, Order};

/// Fields read back from `pos.order` after submission.
pub const INVOICE_LOOKUP_FIELDS: &[&str] = &["invoice_number", "invoice_cr_einvoicing_full_number"];

/// Floor for the first lookup retry delay.
const MIN_LOOKUP_INTERVAL: Duration = Duration::from_millis(10);

const MISSING_CUSTOMER_TITLE: &str = "Please select the Customer";
const MISSING_CUSTOMER_BODY: &str =
    "You need to select the customer before you can invoice an order.";
const CONNECTIVITY_TITLE: &str = "The order could not be sent";
const CONNECTIVITY_BODY: &str = "Check your internet connection and try again.";
const SERVER_ERROR_TITLE: &str = "Server Error";
const SERVER_ERROR_BODY: &str = "The server encountered an error while receiving your order.";
const UNKNOWN_ERROR_TITLE: &str = "Unknown Error";
const UNKNOWN_ERROR_BODY: &str =
    "The order could not be sent to the server due to an unknown error";

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The order must be invoiced but has no customer.
    MissingCustomer,
    /// The request never reached the backend (negative code).
    Transport,
    /// Structured backend fault (code 200) with message and traceback.
    Backend,
    Unknown,
}

/// Classified failure of an invoicing submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitFailure {
    pub kind: FailureKind,
    pub error: RpcError,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.is_empty())
}

impl SubmitFailure {
    pub fn classify(error: RpcError) -> Self {
        let kind = if error.message == MISSING_CUSTOMER {
            FailureKind::MissingCustomer
        } else if error.code < 0 {
            FailureKind::Transport
        } else if error.code == SERVER_ERROR_CODE {
            FailureKind::Backend
        } else {
            FailureKind::Unknown
        };
        Self { kind, error }
    }

    /// Popup shown to the operator for this failure.
    pub fn popup(&self) -> Popup {
        match self.kind {
            FailureKind::MissingCustomer => Popup::Confirm {
                title: MISSING_CUSTOMER_TITLE.to_string(),
                body: MISSING_CUSTOMER_BODY.to_string(),
                confirm_screen: Some(Screen::ClientList),
            },
            FailureKind::Transport => Popup::Error {
                title: CONNECTIVITY_TITLE.to_string(),
                body: CONNECTIVITY_BODY.to_string(),
            },
            FailureKind::Backend => {
                let data = self.error.data.as_ref();
                Popup::ErrorTraceback {
                    title: non_empty(data.and_then(|d| d.message.as_ref()))
                        .unwrap_or(SERVER_ERROR_TITLE)
                        .to_string(),
                    body: non_empty(data.and_then(|d| d.debug.as_ref()))
                        .unwrap_or(SERVER_ERROR_BODY)
                        .to_string(),
                }
            }
            FailureKind::Unknown => Popup::Error {
                title: UNKNOWN_ERROR_TITLE.to_string(),
                body: UNKNOWN_ERROR_BODY.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// Invoice identifiers applied and the receipt screen requested.
    Receipt,
    /// Order sent but the lookup found no backend record; the UI stays put.
    Pending,
    /// Invoicing round-trip failed; the order is back to not finalized.
    Failed(SubmitFailure),
    /// The order was already finalized or its own invoicing round-trip is
    /// still in flight.
    Ignored,
}

/// `search_read` on `pos.order` by reference name.
pub fn invoice_lookup_params(reference: &str) -> QueryParams {
    QueryParams::search_read(
        "pos.order",
        json!([["pos_reference", "=", reference]]),
        INVOICE_LOOKUP_FIELDS,
    )
}

enum LookupMiss {
    Empty,
    Rpc(RpcError),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct FinalizationController {
    settings: FinalizeSettings,
    drawer: Arc<dyn CashDrawer>,
    submitter: Arc<dyn OrderSubmitter>,
    query: Arc<dyn RecordQuery>,
    gui: Arc<dyn Gui>,
    /// Reference names of orders whose invoicing submission is in flight.
    invoicing: Mutex<HashSet<String>>,
}

impl FinalizationController {
    pub fn new(
        settings: FinalizeSettings,
        drawer: Arc<dyn CashDrawer>,
        submitter: Arc<dyn OrderSubmitter>,
        query: Arc<dyn RecordQuery>,
        gui: Arc<dyn Gui>,
    ) -> Self {
        Self {
            settings,
            drawer,
            submitter,
            query,
            gui,
            invoicing: Mutex::new(HashSet::new()),
        }
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.invoicing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while any invoicing submission is awaiting the backend.
    pub fn is_invoicing(&self) -> bool {
        !self.in_flight().is_empty()
    }

    /// True while the invoicing submission of `reference` is awaiting the
    /// backend.
    pub fn is_invoicing_order(&self, reference: &str) -> bool {
        self.in_flight().contains(reference)
    }

    pub async fn finalize_validation(&self, order: &mut Order) -> FinalizeOutcome {
        if order.finalized || self.is_invoicing_order(order.get_name()) {
            warn!(
                order = %order.get_name(),
                finalized = order.finalized,
                "finalization requested twice, ignoring"
            );
            return FinalizeOutcome::Ignored;
        }

        if order.is_paid_with_cash() && self.settings.iface_cashdrawer {
            self.drawer.open_cashbox();
        }

        order.initialize_validation_date();
        order.finalized = true;

        if order.is_to_invoice() {
            self.finalize_invoiced(order).await
        } else {
            self.finalize_plain(order).await
        }
    }

    async fn finalize_invoiced(&self, order: &mut Order) -> FinalizeOutcome {
        let payload = order.export_as_json();
        self.in_flight().insert(order.get_name().to_string());
        info!(order = %order.get_name(), "sending order for invoicing");

        let result = self.submitter.push_and_invoice_order(&payload).await;
        self.in_flight().remove(order.get_name());

        match result {
            Ok(ids) => {
                debug!(order = %order.get_name(), ids = ?ids, "invoiced order accepted");
                self.lookup_and_advance(order).await
            }
            Err(error) => {
                order.finalized = false;
                let failure = SubmitFailure::classify(error);
                warn!(
                    order = %order.get_name(),
                    kind = ?failure.kind,
                    error = %failure.error,
                    "invoicing failed, order reverted to not finalized"
                );
                self.gui.show_popup(failure.popup());
                FinalizeOutcome::Failed(failure)
            }
        }
    }

    async fn finalize_plain(&self, order: &mut Order) -> FinalizeOutcome {
        let payload = order.export_as_json();

        if self.settings.await_plain_push {
            if let Err(e) = self.submitter.push_order(&payload).await {
                warn!(order = %order.get_name(), error = %e, "order push failed");
                return FinalizeOutcome::Pending;
            }
        } else {
            let submitter = Arc::clone(&self.submitter);
            tokio::spawn(async move {
                if let Err(e) = submitter.push_order(&payload).await {
                    warn!(order = %payload.data.name, error = %e, "background order push failed");
                }
            });
        }

        self.lookup_and_advance(order).await
    }

    async fn lookup_and_advance(&self, order: &mut Order) -> FinalizeOutcome {
        match self.fetch_invoice_numbers(order.get_name()).await {
            Ok(Some(numbers)) => {
                info!(
                    order = %order.get_name(),
                    invoice_number = ?numbers.invoice_number,
                    "invoice identifiers received"
                );
                order.apply_invoice_numbers(numbers);
                self.gui.show_screen(Screen::Receipt);
                FinalizeOutcome::Receipt
            }
            Ok(None) => {
                info!(order = %order.get_name(), "order not found on backend yet");
                FinalizeOutcome::Pending
            }
            Err(e) => {
                warn!(order = %order.get_name(), error = %e, "invoice lookup failed");
                FinalizeOutcome::Pending
            }
        }
    }

    /// Look up the invoice identifiers of `reference`, retrying empty
    /// results and transport errors within the configured budget.
    pub async fn fetch_invoice_numbers(
        &self,
        reference: &str,
    ) -> Result<Option<InvoiceNumbers>, RpcError> {
        let params = invoice_lookup_params(reference);
        let retry = self.settings.lookup_retry;
        if !retry.is_enabled() {
            return self.query_once(&params).await;
        }

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(retry.initial_interval.max(MIN_LOOKUP_INTERVAL))
            .with_max_elapsed_time(Some(retry.max_elapsed))
            .build();

        let params = &params;
        let result = backoff::future::retry(policy, || async move {
            match self.query_once(params).await {
                Ok(Some(numbers)) => Ok(numbers),
                Ok(None) => {
                    debug!(reference, "lookup empty, retrying");
                    Err(backoff::Error::transient(LookupMiss::Empty))
                }
                Err(e) if e.is_transport() => Err(backoff::Error::transient(LookupMiss::Rpc(e))),
                Err(e) => Err(backoff::Error::permanent(LookupMiss::Rpc(e))),
            }
        })
        .await;

        match result {
            Ok(numbers) => Ok(Some(numbers)),
            Err(LookupMiss::Empty) => Ok(None),
            Err(LookupMiss::Rpc(e)) => Err(e),
        }
    }

    async fn query_once(&self, params: &QueryParams) -> Result<Option<InvoiceNumbers>, RpcError> {
        let rows = self.query.query(params).await?;
        match rows.into_iter().next() {
            None => Ok(None),
            Some(row) => serde_json::from_value(row)
                .map(Some)
                .map_err(|e| RpcError::unexpected(format!("Undecodable pos.order row: {e}"))),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
