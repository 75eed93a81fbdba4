//! Receipt projection of a finalized order.
//!
//! The projection is rebuilt on every print or display; nothing here is
//! cached on the order.

use serde::{Deserialize, Serialize};

use crate::order::Order;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ReceiptLine {
    pub product_name: String,
    pub quantity: f64,
    pub price_unit: f64,
    pub discount: f64,
    pub price_display: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ReceiptPayment {
    pub name: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ReceiptProjection {
    pub name: String,
    pub date: String,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub orderlines: Vec<ReceiptLine>,
    #[serde(default)]
    pub paymentlines: Vec<ReceiptPayment>,
    pub total_with_tax: f64,
    pub total_without_tax: f64,
    pub total_tax: f64,
    pub total_paid: f64,
    pub change: f64,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub invoice_cr_einvoicing_full_number: Option<String>,
    #[serde(default)]
    pub client_vat: Option<String>,
    #[serde(default)]
    pub client_email: Option<String>,
}

impl Order {
    pub fn export_for_printing(&self) -> ReceiptProjection {
        let client = self.get_client();
        let date = self.validation_date().unwrap_or_else(|| self.creation_date());
        ReceiptProjection {
            name: self.get_name().to_string(),
            date: date.format("%Y-%m-%d %H:%M:%S").to_string(),
            client: client.and_then(|c| c.name.clone()),
            orderlines: self
                .lines()
                .iter()
                .map(|l| ReceiptLine {
                    product_name: l.product_name.clone(),
                    quantity: l.qty,
                    price_unit: l.price_unit,
                    discount: l.discount,
                    price_display: l.price_subtotal_incl,
                })
                .collect(),
            paymentlines: self
                .payment_lines()
                .iter()
                .map(|p| ReceiptPayment {
                    name: p.name.clone(),
                    amount: p.amount,
                })
                .collect(),
            total_with_tax: self.total_with_tax(),
            total_without_tax: self.total_without_tax(),
            total_tax: self.total_tax(),
            total_paid: self.total_paid(),
            change: self.change(),
            invoice_number: self.invoice_number.clone(),
            invoice_cr_einvoicing_full_number: self.invoice_cr_einvoicing_full_number.clone(),
            client_vat: client.and_then(|c| c.vat.clone()),
            client_email: client.and_then(|c| c.email.clone()),
        }
    }
}

impl ReceiptProjection {
    /// E-invoice header block for a printed receipt, wrapped to `width`
    /// columns. Absent values are left out.
    pub fn render_einvoice_lines(&self, width: usize) -> Vec<String> {
        let width = width.max(16);
        let mut out = Vec::new();
        if let Some(number) = &self.invoice_number {
            push_wrapped(&mut out, "Consecutive: ", number, width);
        }
        if let Some(key) = &self.invoice_cr_einvoicing_full_number {
            push_wrapped(&mut out, "Key: ", key, width);
        }
        if let Some(vat) = &self.client_vat {
            push_wrapped(&mut out, "Customer ID: ", vat, width);
        }
        if let Some(email) = &self.client_email {
            push_wrapped(&mut out, "Email: ", email, width);
        }
        out
    }
}

/// Label on the first line, value continued on following lines when it
/// does not fit (the 50-digit document key never does on 58mm paper).
fn push_wrapped(out: &mut Vec<String>, label: &str, value: &str, width: usize) {
    let first_room = width.saturating_sub(label.chars().count());
    let chars: Vec<char> = value.chars().collect();
    if first_room == 0 || chars.len() > first_room {
        out.push(label.trim_end().to_string());
        for chunk in chars.chunks(width) {
            out.push(chunk.iter().collect());
        }
    } else {
        out.push(format!("{label}{value}"));
    }
}
