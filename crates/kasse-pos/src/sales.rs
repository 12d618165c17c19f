//! Sample point-of-sale transactions for the reference runtime.
//!
//! All data in this module is hardcoded and fictional.

use serde::{Deserialize, Serialize};
use serde_json::json;

use kasse_contracts::{
    ids::{ActorId, OperationId, TransactionRef},
    ledger::EventType,
    operation::FiscalRequest,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    pub description: String,
    pub quantity: u32,
    pub unit_cents: i64,
    /// VAT rate in basis points (1900 = 19 %).
    pub vat_bp: u32,
}

impl SaleLine {
    pub fn new(description: &str, quantity: u32, unit_cents: i64, vat_bp: u32) -> Self {
        Self { description: description.to_string(), quantity, unit_cents, vat_bp }
    }

    pub fn total_cents(&self) -> i64 {
        self.unit_cents * i64::from(self.quantity)
    }
}

/// A closed sale waiting to be fiscalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub operation_id: OperationId,
    pub transaction_ref: TransactionRef,
    pub cashier: ActorId,
    pub lines: Vec<SaleLine>,
}

impl Sale {
    pub fn total_cents(&self) -> i64 {
        self.lines.iter().map(SaleLine::total_cents).sum()
    }

    /// The fiscal request for this sale.
    ///
    /// The device payload is derived from the sale alone, so resubmitting
    /// the same sale produces an identical request.
    pub fn to_request(&self) -> FiscalRequest {
        FiscalRequest {
            operation_id: self.operation_id.clone(),
            transaction_ref: self.transaction_ref.clone(),
            event_type: EventType::TransactionClosed,
            actor_id: Some(self.cashier.clone()),
            payload_for_device: json!({
                "kind": "receipt",
                "transaction_ref": self.transaction_ref,
                "currency": "EUR",
                "lines": self.lines,
                "total_cents": self.total_cents(),
            }),
        }
    }
}

/// Build the `n`-th sample sale, tagged with operation id `op-{n}`.
///
/// Baskets rotate through a small fixed catalogue.
pub fn sample_sale(n: u32) -> Sale {
    let lines = match n % 4 {
        0 => vec![SaleLine::new("Espresso", 2, 240, 1900), SaleLine::new("Croissant", 1, 190, 700)],
        1 => vec![SaleLine::new("Sparkling water 0.5l", 3, 150, 1900)],
        2 => vec![
            SaleLine::new("Sourdough loaf", 1, 450, 700),
            SaleLine::new("Butter 250g", 1, 299, 700),
            SaleLine::new("Carrier bag", 1, 20, 1900),
        ],
        _ => vec![SaleLine::new("Newspaper", 1, 350, 700)],
    };
    Sale {
        operation_id: OperationId::new(format!("op-{}", n)),
        transaction_ref: TransactionRef::new(format!("tx-{:04}", n)),
        cashier: ActorId::new(if n % 2 == 0 { "cashier-anna" } else { "cashier-ben" }),
        lines,
    }
}

#[cfg(test)]
mod tests {
    use super::sample_sale;

    #[test]
    fn test_sample_sale_is_deterministic() {
        let a = sample_sale(2).to_request();
        let b = sample_sale(2).to_request();
        assert_eq!(a.payload_for_device, b.payload_for_device);
        assert_eq!(a.operation_id.as_str(), "op-2");
        assert_eq!(a.payload_for_device["total_cents"], 769);
    }
}
