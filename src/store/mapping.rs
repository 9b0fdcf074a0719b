//! DBR document schema installed into the target index before ingestion.

use serde_json::{json, Value};

/// Mapping for the billing line-item document type. String fields that carry
/// identifiers or enumerations are kept unanalyzed; everything else falls
/// through to the dynamic template.
pub fn dbr_mapping(doctype: &str) -> Value {
    json!({
        doctype: {
            "properties": {
                "LinkedAccountId": {"type": "string"},
                "InvoiceID": {"type": "string", "index": "not_analyzed"},
                "RecordType": {"type": "string"},
                "RecordId": {"type": "string", "index": "not_analyzed"},
                "UsageType": {"type": "string", "index": "not_analyzed"},
                "UsageEndDate": {"type": "date", "format": "YYYY-MM-dd HH:mm:ss"},
                "ItemDescription": {"type": "string", "index": "not_analyzed"},
                "ProductName": {"type": "string", "index": "not_analyzed"},
                "RateId": {"type": "string"},
                "Rate": {"type": "float"},
                "AvailabilityZone": {"type": "string", "index": "not_analyzed"},
                "PricingPlanId": {"type": "string", "index": "not_analyzed"},
                "ResourceId": {"type": "string", "index": "not_analyzed"},
                "Cost": {"type": "float"},
                "PayerAccountId": {"type": "string", "index": "not_analyzed"},
                "SubscriptionId": {"type": "string", "index": "not_analyzed"},
                "UsageQuantity": {"type": "float"},
                "Operation": {"type": "string"},
                "ReservedInstance": {"type": "string", "index": "not_analyzed"},
                "UsageStartDate": {"type": "date", "format": "YYYY-MM-dd HH:mm:ss"},
                "BlendedCost": {"type": "float"},
                "BlendedRate": {"type": "float"},
                "UnBlendedCost": {"type": "float"},
                "UnBlendedRate": {"type": "float"}
            },
            "dynamic_templates": [
                {
                    "notanalyzed": {
                        "match": "*",
                        "match_mapping_type": "string",
                        "mapping": {
                            "type": "string",
                            "index": "not_analyzed"
                        }
                    }
                }
            ]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_keyed_by_doctype() {
        let mapping = dbr_mapping("billing");
        assert!(mapping.get("billing").is_some());
        assert_eq!(
            mapping.pointer("/billing/properties/RecordId/index"),
            Some(&json!("not_analyzed"))
        );
    }
}
