//! Customer records as loaded from the backend.
//!
//! The base partner fields are extended with the Costa Rica e-invoicing
//! address (province / canton / district / neighborhood), the ID type used
//! on electronic documents, and the extra invoice e-mail recipients.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::{QueryParams, RecordQuery, RpcError};

/// Fields every customer load requests.
pub const PARTNER_BASE_FIELDS: &[&str] = &["id", "name", "vat", "email", "phone"];

/// E-invoicing fields added to the customer load.
pub const PARTNER_EINVOICING_FIELDS: &[&str] = &[
    "email_copies",
    "vat_type",
    "state_id",
    "canton_id",
    "district_id",
    "neighborhood_id",
];

/// Full field list for `res.partner` loads.
pub fn partner_fields() -> Vec<&'static str> {
    PARTNER_BASE_FIELDS
        .iter()
        .chain(PARTNER_EINVOICING_FIELDS)
        .copied()
        .collect()
}

// ---------------------------------------------------------------------------
// Backend field decoding
// ---------------------------------------------------------------------------

/// A many2one reference as delivered by `search_read`: `[id, display_name]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Many2One {
    pub id: i64,
    pub name: String,
}

/// Char fields come back as `false` when unset.
pub(crate) fn char_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

fn many2one_field<'de, D>(deserializer: D) -> Result<Option<Many2One>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(pair) => match (pair.first().and_then(Value::as_i64), pair.get(1)) {
            (Some(id), name) => Some(Many2One {
                id,
                name: name.and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            _ => None,
        },
        Value::Object(obj) => obj.get("id").and_then(Value::as_i64).map(|id| Many2One {
            id,
            name: obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        Value::Number(n) => n.as_i64().map(|id| Many2One {
            id,
            name: String::new(),
        }),
        _ => None,
    })
}

/// Identification type printed on electronic documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VatType {
    #[serde(rename = "01")]
    CitizenId,
    #[serde(rename = "02")]
    LegalEntity,
    #[serde(rename = "03")]
    Dimex,
    #[serde(rename = "04")]
    Nite,
    #[serde(rename = "XX")]
    Foreigner,
}

impl VatType {
    pub fn code(self) -> &'static str {
        match self {
            Self::CitizenId => "01",
            Self::LegalEntity => "02",
            Self::Dimex => "03",
            Self::Nite => "04",
            Self::Foreigner => "XX",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "01" => Some(Self::CitizenId),
            "02" => Some(Self::LegalEntity),
            "03" => Some(Self::Dimex),
            "04" => Some(Self::Nite),
            "XX" | "xx" => Some(Self::Foreigner),
            _ => None,
        }
    }
}

fn vat_type_field<'de, D>(deserializer: D) -> Result<Option<VatType>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => VatType::from_code(&s),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Partner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    pub id: i64,
    #[serde(default, deserialize_with = "char_field")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "char_field")]
    pub vat: Option<String>,
    #[serde(default, deserialize_with = "char_field")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "char_field")]
    pub phone: Option<String>,
    /// Extra recipients of the invoice e-mail, comma separated.
    #[serde(default, deserialize_with = "char_field")]
    pub email_copies: Option<String>,
    #[serde(default, deserialize_with = "vat_type_field")]
    pub vat_type: Option<VatType>,
    #[serde(default, deserialize_with = "many2one_field")]
    pub state_id: Option<Many2One>,
    #[serde(default, deserialize_with = "many2one_field")]
    pub canton_id: Option<Many2One>,
    #[serde(default, deserialize_with = "many2one_field")]
    pub district_id: Option<Many2One>,
    #[serde(default, deserialize_with = "many2one_field")]
    pub neighborhood_id: Option<Many2One>,
}

impl Partner {
    /// A customer can receive an electronic invoice once both the tax id
    /// and its identification type are known.
    pub fn requires_invoice(&self) -> bool {
        self.vat.is_some() && self.vat_type.is_some()
    }

    /// All invoice e-mail recipients: the main address first, then copies.
    pub fn invoice_recipients(&self) -> Vec<String> {
        let copies = self
            .email_copies
            .as_deref()
            .unwrap_or_default()
            .split([',', ';']);
        self.email
            .as_deref()
            .into_iter()
            .chain(copies)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Province, canton, district, neighborhood names, outermost first.
    pub fn address_parts(&self) -> Vec<&str> {
        [
            &self.state_id,
            &self.canton_id,
            &self.district_id,
            &self.neighborhood_id,
        ]
        .into_iter()
        .filter_map(|r| r.as_ref().map(|m| m.name.as_str()))
        .filter(|s| !s.is_empty())
        .collect()
    }
}

/// Load customers matching `domain` with the base and e-invoicing fields.
pub async fn load_partners(
    query: &dyn RecordQuery,
    domain: Value,
) -> Result<Vec<Partner>, RpcError> {
    let fields = partner_fields();
    let params = QueryParams::search_read("res.partner", domain, &fields);
    let rows = query.query(&params).await?;

    let total = rows.len();
    let partners: Vec<Partner> = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<Partner>(row) {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(error = %e, "skipping undecodable partner row");
                None
            }
        })
        .collect();
    debug!(total, loaded = partners.len(), "partners loaded");
    Ok(partners)
}
