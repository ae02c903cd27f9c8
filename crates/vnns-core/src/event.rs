// crates/vnns-core/src/event.rs
//
// Events delivered by the verification network's subscription surface.
//
// Delivery is at-least-once and unordered across submissions. The only
// ordering the network guarantees is that a submission's inclusion event
// precedes any aggregation receipt for the aggregation it was assigned to.

use serde::{Deserialize, Serialize};

use crate::artifact::NetworkTicket;
use crate::error::NetworkError;

/// A submission was included in a block and assigned to an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionEvent {
    pub ticket: NetworkTicket,
    pub block_hash: String,
    /// Canonical statement hash the network recorded for the submission.
    pub statement: String,
    pub aggregation_id: u64,
    pub domain_id: u32,
}

/// An aggregation completed. IDs arrive as network-formatted decimal strings
/// that may contain grouping separators (`"1,024"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationReceipt {
    pub block_hash: String,
    pub domain_id: String,
    pub aggregation_id: String,
}

impl AggregationReceipt {
    /// `(domain_id, aggregation_id)` as integers.
    pub fn normalized(&self) -> Result<(u32, u64), NetworkError> {
        let domain = parse_grouped_integer(&self.domain_id)?;
        let domain = u32::try_from(domain)
            .map_err(|_| NetworkError::Protocol(format!("domain id out of range: {}", domain)))?;
        let aggregation = parse_grouped_integer(&self.aggregation_id)?;
        Ok((domain, aggregation))
    }
}

/// The network refused a submission after accepting it for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionEvent {
    pub ticket: NetworkTicket,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkEvent {
    IncludedInBlock(InclusionEvent),
    AggregationReceipt(AggregationReceipt),
    Rejected(RejectionEvent),
}

impl NetworkEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkEvent::IncludedInBlock(_) => "included_in_block",
            NetworkEvent::AggregationReceipt(_) => "aggregation_receipt",
            NetworkEvent::Rejected(_) => "rejected",
        }
    }
}

/// Subscription filter. Receipts for other domains are not delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub domain_id: Option<u32>,
}

impl EventFilter {
    pub fn domain(domain_id: u32) -> Self {
        Self {
            domain_id: Some(domain_id),
        }
    }

    pub fn accepts(&self, event: &NetworkEvent) -> bool {
        let Some(wanted) = self.domain_id else {
            return true;
        };
        match event {
            NetworkEvent::IncludedInBlock(e) => e.domain_id == wanted,
            NetworkEvent::AggregationReceipt(r) => {
                matches!(r.normalized(), Ok((domain, _)) if domain == wanted)
            }
            NetworkEvent::Rejected(_) => true,
        }
    }
}

/// Parse a decimal integer that may carry comma grouping (`"4,2"` -> 42).
pub fn parse_grouped_integer(raw: &str) -> Result<u64, NetworkError> {
    let digits: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(NetworkError::Protocol(format!("not an integer: {:?}", raw)));
    }
    digits
        .parse::<u64>()
        .map_err(|e| NetworkError::Protocol(format!("integer {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grouped_integer() {
        assert_eq!(parse_grouped_integer("42").unwrap(), 42);
        assert_eq!(parse_grouped_integer("4,2").unwrap(), 42);
        assert_eq!(parse_grouped_integer("1,234,567").unwrap(), 1_234_567);
        assert_eq!(parse_grouped_integer(" 7 ").unwrap(), 7);
    }

    #[test]
    fn test_parse_grouped_integer_rejects_garbage() {
        assert!(parse_grouped_integer("").is_err());
        assert!(parse_grouped_integer(",").is_err());
        assert!(parse_grouped_integer("-1").is_err());
        assert!(parse_grouped_integer("4.2").is_err());
        assert!(parse_grouped_integer("99999999999999999999999").is_err());
    }

    #[test]
    fn test_receipt_normalization() {
        let receipt = AggregationReceipt {
            block_hash: "0xabc".to_string(),
            domain_id: "0".to_string(),
            aggregation_id: "1,024".to_string(),
        };
        assert_eq!(receipt.normalized().unwrap(), (0, 1024));
    }

    #[test]
    fn test_filter_drops_other_domains() {
        let filter = EventFilter::domain(0);
        let ours = NetworkEvent::AggregationReceipt(AggregationReceipt {
            block_hash: "b".to_string(),
            domain_id: "0".to_string(),
            aggregation_id: "1".to_string(),
        });
        let theirs = NetworkEvent::AggregationReceipt(AggregationReceipt {
            block_hash: "b".to_string(),
            domain_id: "3".to_string(),
            aggregation_id: "1".to_string(),
        });
        assert!(filter.accepts(&ours));
        assert!(!filter.accepts(&theirs));
        assert!(EventFilter::default().accepts(&theirs));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = NetworkEvent::Rejected(RejectionEvent {
            ticket: NetworkTicket("t-1".to_string()),
            reason: "invalid proof".to_string(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "rejected");
        assert_eq!(value["ticket"], "t-1");
        let back: NetworkEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
