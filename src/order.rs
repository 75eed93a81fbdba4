//! Checkout order aggregate.
//!
//! An `Order` lives for one sale: it is created when the sale starts,
//! receives lines and tenders, is finalized once fully paid, and is then
//! handed to the backend. Tax amounts arrive on the lines already computed;
//! this module only aggregates them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::partner::{char_field, Partner};

/// How a payment line was tendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenderKind {
    Cash,
    Card,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: i64,
    pub product_name: String,
    pub qty: f64,
    pub price_unit: f64,
    /// Discount percentage (0–100).
    #[serde(default)]
    pub discount: f64,
    pub price_subtotal: f64,
    pub price_subtotal_incl: f64,
    #[serde(default)]
    pub tax_ids: Vec<i64>,
}

impl OrderLine {
    /// Untaxed line: subtotal with and without tax are equal.
    pub fn new(product_id: i64, product_name: &str, qty: f64, price_unit: f64) -> Self {
        let subtotal = qty * price_unit;
        Self {
            product_id,
            product_name: product_name.to_string(),
            qty,
            price_unit,
            discount: 0.0,
            price_subtotal: subtotal,
            price_subtotal_incl: subtotal,
            tax_ids: Vec::new(),
        }
    }

    /// Attach taxes already computed by the pricing layer.
    pub fn with_taxes(mut self, tax_ids: Vec<i64>, price_subtotal_incl: f64) -> Self {
        self.tax_ids = tax_ids;
        self.price_subtotal_incl = price_subtotal_incl;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentLine {
    pub journal_id: i64,
    pub name: String,
    pub kind: TenderKind,
    pub amount: f64,
}

// ---------------------------------------------------------------------------
// Submission payload
// ---------------------------------------------------------------------------

/// One2many "create" command: `[0, 0, values]`.
pub type CreateCommand<T> = (u8, u8, T);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineValues {
    pub product_id: i64,
    pub qty: f64,
    pub price_unit: f64,
    pub discount: f64,
    pub price_subtotal: f64,
    pub price_subtotal_incl: f64,
    pub tax_ids: Vec<(u8, u8, Vec<i64>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementValues {
    pub name: String,
    pub journal_id: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderData {
    pub name: String,
    pub uid: String,
    pub sequence_number: u32,
    pub pos_session_id: i64,
    pub user_id: Option<i64>,
    pub partner_id: Option<i64>,
    pub amount_paid: f64,
    pub amount_total: f64,
    pub amount_tax: f64,
    pub amount_return: f64,
    pub lines: Vec<CreateCommand<LineValues>>,
    pub statement_ids: Vec<CreateCommand<StatementValues>>,
    pub creation_date: String,
}

/// Body of one `create_from_ui` entry: `{id, to_invoice, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub id: String,
    pub to_invoice: bool,
    pub data: OrderData,
}

impl OrderPayload {
    pub fn partner_id(&self) -> Option<i64> {
        self.data.partner_id
    }
}

/// Invoice identifiers assigned by the backend, as returned by the
/// post-submission lookup on `pos.order`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceNumbers {
    #[serde(default, deserialize_with = "char_field")]
    pub invoice_number: Option<String>,
    #[serde(default, deserialize_with = "char_field")]
    pub invoice_cr_einvoicing_full_number: Option<String>,
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Order {
    uid: String,
    name: String,
    sequence_number: u32,
    pos_session_id: i64,
    user_id: Option<i64>,
    creation_date: DateTime<Utc>,
    lines: Vec<OrderLine>,
    payment_lines: Vec<PaymentLine>,
    client: Option<Partner>,
    to_invoice: bool,
    validation_date: Option<DateTime<Utc>>,
    /// Set once the operator validated payment; cleared again if the
    /// invoicing round-trip fails.
    pub finalized: bool,
    pub invoice_number: Option<String>,
    pub invoice_cr_einvoicing_full_number: Option<String>,
}

fn generate_uid(pos_session_id: i64, login_number: u32, sequence_number: u32) -> String {
    format!("{pos_session_id:05}-{login_number:03}-{sequence_number:04}")
}

impl Order {
    pub fn new(pos_session_id: i64, login_number: u32, sequence_number: u32) -> Self {
        let uid = generate_uid(pos_session_id, login_number, sequence_number);
        Self {
            name: format!("Order {uid}"),
            uid,
            sequence_number,
            pos_session_id,
            user_id: None,
            creation_date: Utc::now(),
            lines: Vec::new(),
            payment_lines: Vec::new(),
            client: None,
            to_invoice: false,
            validation_date: None,
            finalized: false,
            invoice_number: None,
            invoice_cr_einvoicing_full_number: None,
        }
    }

    /// Reference name used by the backend as `pos_reference`.
    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn set_user(&mut self, user_id: i64) {
        self.user_id = Some(user_id);
    }

    pub fn add_line(&mut self, line: OrderLine) {
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn add_payment(&mut self, payment: PaymentLine) {
        self.payment_lines.push(payment);
    }

    pub fn payment_lines(&self) -> &[PaymentLine] {
        &self.payment_lines
    }

    pub fn set_client(&mut self, client: Option<Partner>) {
        self.client = client;
    }

    pub fn get_client(&self) -> Option<&Partner> {
        self.client.as_ref()
    }

    pub fn set_to_invoice(&mut self, to_invoice: bool) {
        self.to_invoice = to_invoice;
    }

    pub fn is_to_invoice(&self) -> bool {
        self.to_invoice
    }

    /// True when any tender on the order was cash.
    pub fn is_paid_with_cash(&self) -> bool {
        self.payment_lines
            .iter()
            .any(|p| p.kind == TenderKind::Cash)
    }

    pub fn initialize_validation_date(&mut self) {
        self.validation_date = Some(Utc::now());
    }

    pub fn validation_date(&self) -> Option<DateTime<Utc>> {
        self.validation_date
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub fn total_with_tax(&self) -> f64 {
        self.lines.iter().map(|l| l.price_subtotal_incl).sum()
    }

    pub fn total_without_tax(&self) -> f64 {
        self.lines.iter().map(|l| l.price_subtotal).sum()
    }

    pub fn total_tax(&self) -> f64 {
        self.total_with_tax() - self.total_without_tax()
    }

    pub fn total_paid(&self) -> f64 {
        self.payment_lines.iter().map(|p| p.amount).sum()
    }

    pub fn change(&self) -> f64 {
        (self.total_paid() - self.total_with_tax()).max(0.0)
    }

    /// Copy invoice identifiers found by the backend lookup.
    pub fn apply_invoice_numbers(&mut self, numbers: InvoiceNumbers) {
        self.invoice_number = numbers.invoice_number;
        self.invoice_cr_einvoicing_full_number = numbers.invoice_cr_einvoicing_full_number;
    }

    /// Build the `create_from_ui` entry for this order.
    pub fn export_as_json(&self) -> OrderPayload {
        let stamp = self.validation_date.unwrap_or(self.creation_date);
        let lines = self
            .lines
            .iter()
            .map(|l| {
                (
                    0,
                    0,
                    LineValues {
                        product_id: l.product_id,
                        qty: l.qty,
                        price_unit: l.price_unit,
                        discount: l.discount,
                        price_subtotal: l.price_subtotal,
                        price_subtotal_incl: l.price_subtotal_incl,
                        tax_ids: vec![(6, 0, l.tax_ids.clone())],
                    },
                )
            })
            .collect();
        let statement_ids = self
            .payment_lines
            .iter()
            .map(|p| {
                (
                    0,
                    0,
                    StatementValues {
                        name: stamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                        journal_id: p.journal_id,
                        amount: p.amount,
                    },
                )
            })
            .collect();

        OrderPayload {
            id: self.uid.clone(),
            to_invoice: self.to_invoice,
            data: OrderData {
                name: self.name.clone(),
                uid: self.uid.clone(),
                sequence_number: self.sequence_number,
                pos_session_id: self.pos_session_id,
                user_id: self.user_id,
                partner_id: self.client.as_ref().map(|c| c.id),
                amount_paid: self.total_paid(),
                amount_total: self.total_with_tax(),
                amount_tax: self.total_tax(),
                amount_return: self.change(),
                lines,
                statement_ids,
                creation_date: stamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cash(amount: f64) -> PaymentLine {
        PaymentLine {
            journal_id: 1,
            name: "Efectivo".to_string(),
            kind: TenderKind::Cash,
            amount,
        }
    }

    fn card(amount: f64) -> PaymentLine {
        PaymentLine {
            journal_id: 2,
            name: "Tarjeta".to_string(),
            kind: TenderKind::Card,
            amount,
        }
    }

    fn sample() -> Order {
        let mut order = Order::new(12, 3, 4);
        order.add_line(OrderLine::new(7, "Café chorreado", 2.0, 1500.0).with_taxes(vec![1], 3390.0));
        order.add_line(OrderLine::new(8, "Empanada", 1.0, 1000.0));
        order
    }

    #[test]
    fn test_name_uses_padded_uid() {
        let order = Order::new(12, 3, 4);
        assert_eq!(order.uid(), "00012-003-0004");
        assert_eq!(order.get_name(), "Order 00012-003-0004");
    }

    #[test]
    fn test_paid_with_cash() {
        let mut order = sample();
        assert!(!order.is_paid_with_cash());
        order.add_payment(card(2000.0));
        assert!(!order.is_paid_with_cash());
        order.add_payment(cash(3000.0));
        assert!(order.is_paid_with_cash());
    }

    #[test]
    fn test_totals_and_change() {
        let mut order = sample();
        order.add_payment(cash(5000.0));
        assert_eq!(order.total_without_tax(), 4000.0);
        assert_eq!(order.total_with_tax(), 4390.0);
        assert_eq!(order.total_tax(), 390.0);
        assert_eq!(order.change(), 610.0);
    }

    #[test]
    fn test_change_never_negative() {
        let mut order = sample();
        order.add_payment(card(100.0));
        assert_eq!(order.change(), 0.0);
    }

    #[test]
    fn test_validation_date_stamped() {
        let mut order = sample();
        assert!(order.validation_date().is_none());
        order.initialize_validation_date();
        assert!(order.validation_date().unwrap() >= order.creation_date());
    }

    #[test]
    fn test_export_shape() {
        let mut order = sample();
        order.add_payment(cash(5000.0));
        order.set_to_invoice(true);
        order.set_client(Some(Partner {
            id: 15,
            ..Partner::default()
        }));

        let payload = serde_json::to_value(order.export_as_json()).unwrap();
        assert_eq!(payload["id"], "00012-003-0004");
        assert_eq!(payload["to_invoice"], true);
        assert_eq!(payload["data"]["name"], "Order 00012-003-0004");
        assert_eq!(payload["data"]["partner_id"], 15);
        assert_eq!(payload["data"]["amount_return"], 610.0);
        assert_eq!(payload["data"]["lines"][0][0], 0);
        assert_eq!(payload["data"]["lines"][0][2]["tax_ids"], json!([[6, 0, [1]]]));
        assert_eq!(payload["data"]["statement_ids"][0][2]["journal_id"], 1);
    }

    #[test]
    fn test_export_without_client_has_no_partner() {
        let payload = sample().export_as_json();
        assert_eq!(payload.partner_id(), None);
    }

    #[test]
    fn test_apply_invoice_numbers_from_lookup_row() {
        let mut order = sample();
        let numbers: InvoiceNumbers = serde_json::from_value(json!({
            "id": 41,
            "invoice_number": "00100001010000000007",
            "invoice_cr_einvoicing_full_number": false
        }))
        .unwrap();
        order.apply_invoice_numbers(numbers);
        assert_eq!(order.invoice_number.as_deref(), Some("00100001010000000007"));
        assert_eq!(order.invoice_cr_einvoicing_full_number, None);
    }
}
