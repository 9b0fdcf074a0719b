//! Pure row transformations: control-message detection, nested-key
//! restructuring and EC2 usage classification.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// One CSV data row, keyed by header column name.
pub type Row = HashMap<String, String>;

/// A transformed row ready for delivery.
pub type Document = Map<String, Value>;

/// Separator marking a nested field path inside a column name.
const SUBKEY_SEPARATOR: char = ':';

pub const EC2_PRODUCT_NAME: &str = "Amazon Elastic Compute Cloud";
pub const RUN_INSTANCES_OPERATION: &str = "RunInstances";

/// Returns true iff any field named in `control_spec` holds one of its
/// sentinel values. Runs on the raw row, before any transformation.
pub fn is_control_message(row: &Row, control_spec: &HashMap<String, Vec<String>>) -> bool {
    for (field, sentinels) in control_spec {
        if let Some(value) = row.get(field) {
            if sentinels.iter().any(|s| s == value) {
                return true;
            }
        }
    }
    false
}

/// Rebuilds a flat row into a document, splitting `base:sub` column names at
/// the first separator into `{base: {sub: value}}`.
///
/// When the same base key occurs both flat and nested, the nested form wins
/// regardless of input order; the first-seen value wins per (base, sub) pair.
pub fn restructure(row: &Row) -> Document {
    let mut doc = Document::new();

    for (key, value) in row {
        match key.split_once(SUBKEY_SEPARATOR) {
            Some((base, sub)) => match doc.get_mut(base) {
                Some(Value::Object(nested)) => {
                    nested
                        .entry(sub.to_string())
                        .or_insert_with(|| Value::String(value.clone()));
                }
                // A flat value under the same base: the nested form wins.
                _ => {
                    let mut nested = Map::new();
                    nested.insert(sub.to_string(), Value::String(value.clone()));
                    doc.insert(base.to_string(), Value::Object(nested));
                }
            },
            None => {
                if !matches!(doc.get(key), Some(Value::Object(_))) {
                    doc.entry(key.clone())
                        .or_insert_with(|| Value::String(value.clone()));
                }
            }
        }
    }

    doc
}

/// Classifies EC2 compute line items, adding `UsageItem` (always, defaulting
/// to the empty string) and `InstanceType` (EC2 rows only).
pub fn classify_usage(doc: &mut Document) {
    doc.insert("UsageItem".to_string(), Value::String(String::new()));

    let product = field(doc, "ProductName");
    let operation = field(doc, "Operation");
    if product != EC2_PRODUCT_NAME || !operation.contains(RUN_INSTANCES_OPERATION) {
        return;
    }

    let usage_type = field(doc, "UsageType").to_string();
    let usage_item = if field(doc, "ReservedInstance") == "Y" {
        "Reserved Instance"
    } else if usage_type.contains("BoxUsage") {
        "On-Demand"
    } else if usage_type.contains("SpotUsage") {
        "Spot Instance"
    } else {
        ""
    };
    doc.insert(
        "UsageItem".to_string(),
        Value::String(usage_item.to_string()),
    );

    let instance_type = usage_type
        .split_once(SUBKEY_SEPARATOR)
        .map_or("N/A", |(_, t)| t);
    doc.insert(
        "InstanceType".to_string(),
        Value::String(instance_type.to_string()),
    );
}

fn field<'a>(doc: &'a Document, key: &str) -> &'a str {
    doc.get(key).and_then(Value::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn control_spec() -> HashMap<String, Vec<String>> {
        crate::config::Config::default().control_spec
    }

    #[test]
    fn test_control_message_matches_sentinels() {
        let spec = control_spec();
        for sentinel in ["StatementTotal", "InvoiceTotal", "Rounding", "AccountTotal"] {
            let r = row(&[("RecordType", sentinel), ("RecordId", "1")]);
            assert!(is_control_message(&r, &spec), "{sentinel} should match");
        }
    }

    #[test]
    fn test_control_message_rejects_line_items() {
        let spec = control_spec();
        let r = row(&[("RecordType", "LineItem"), ("RecordId", "1")]);
        assert!(!is_control_message(&r, &spec));

        // Exact equality, not substring.
        let r = row(&[("RecordType", "StatementTotalExtra")]);
        assert!(!is_control_message(&r, &spec));

        // Missing field.
        let r = row(&[("RecordId", "1")]);
        assert!(!is_control_message(&r, &spec));
    }

    #[test]
    fn test_restructure_splits_subkeys() {
        let r = row(&[("a:b", "1"), ("a:c", "2"), ("d", "3")]);
        let doc = restructure(&r);
        assert_eq!(
            Value::Object(doc),
            json!({"a": {"b": "1", "c": "2"}, "d": "3"})
        );
    }

    #[test]
    fn test_restructure_splits_at_first_separator_only() {
        let r = row(&[("user:tag:env", "prod")]);
        let doc = restructure(&r);
        assert_eq!(Value::Object(doc), json!({"user": {"tag:env": "prod"}}));
    }

    #[test]
    fn test_restructure_nested_wins_over_flat() {
        // The nested form must win regardless of iteration order, which
        // HashMap does not fix, so both orders collapse to the same output.
        let r = row(&[("a", "flat"), ("a:b", "1")]);
        let doc = restructure(&r);
        assert_eq!(Value::Object(doc), json!({"a": {"b": "1"}}));
    }

    #[test]
    fn test_restructure_passes_plain_keys_through() {
        let r = row(&[("RecordId", "42"), ("Cost", "0.10")]);
        let doc = restructure(&r);
        assert_eq!(Value::Object(doc), json!({"RecordId": "42", "Cost": "0.10"}));
    }

    #[test]
    fn test_classify_reserved_instance() {
        let r = row(&[
            ("ProductName", "Amazon Elastic Compute Cloud"),
            ("Operation", "RunInstances:0002"),
            ("ReservedInstance", "Y"),
            ("UsageType", "HeavyUsage:m1.small"),
        ]);
        let mut doc = restructure(&r);
        classify_usage(&mut doc);
        assert_eq!(doc["UsageItem"], "Reserved Instance");
        assert_eq!(doc["InstanceType"], "m1.small");
    }

    #[test]
    fn test_classify_on_demand() {
        let r = row(&[
            ("ProductName", "Amazon Elastic Compute Cloud"),
            ("Operation", "RunInstances"),
            ("ReservedInstance", ""),
            ("UsageType", "BoxUsage:m1.small"),
        ]);
        let mut doc = restructure(&r);
        classify_usage(&mut doc);
        assert_eq!(doc["UsageItem"], "On-Demand");
        assert_eq!(doc["InstanceType"], "m1.small");
    }

    #[test]
    fn test_classify_spot_instance() {
        let r = row(&[
            ("ProductName", "Amazon Elastic Compute Cloud"),
            ("Operation", "RunInstances"),
            ("ReservedInstance", ""),
            ("UsageType", "SpotUsage:c3.large"),
        ]);
        let mut doc = restructure(&r);
        classify_usage(&mut doc);
        assert_eq!(doc["UsageItem"], "Spot Instance");
        assert_eq!(doc["InstanceType"], "c3.large");
    }

    #[test]
    fn test_classify_ec2_without_usage_type_marker() {
        let r = row(&[
            ("ProductName", "Amazon Elastic Compute Cloud"),
            ("Operation", "RunInstances"),
            ("ReservedInstance", ""),
            ("UsageType", "DataTransfer"),
        ]);
        let mut doc = restructure(&r);
        classify_usage(&mut doc);
        assert_eq!(doc["UsageItem"], "");
        assert_eq!(doc["InstanceType"], "N/A");
    }

    #[test]
    fn test_classify_non_ec2_gets_empty_default() {
        let r = row(&[
            ("ProductName", "Amazon Simple Storage Service"),
            ("Operation", "PutObject"),
            ("UsageType", "Requests-Tier1"),
        ]);
        let mut doc = restructure(&r);
        classify_usage(&mut doc);
        assert_eq!(doc["UsageItem"], "");
        assert!(!doc.contains_key("InstanceType"));
    }

    #[test]
    fn test_classify_non_run_instances_operation() {
        let r = row(&[
            ("ProductName", "Amazon Elastic Compute Cloud"),
            ("Operation", "CreateSnapshot"),
            ("UsageType", "EBS:SnapshotUsage"),
        ]);
        let mut doc = restructure(&r);
        classify_usage(&mut doc);
        assert_eq!(doc["UsageItem"], "");
        assert!(!doc.contains_key("InstanceType"));
    }
}
