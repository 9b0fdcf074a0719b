//! EC2 usage analytics: fleet size, cost rates, elasticity and reservation
//! coverage derived from a second pass over the billing file.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde_json::{Number, Value};
use tracing::{debug, info};

use crate::config::Config;
use crate::record::{Document, Row, EC2_PRODUCT_NAME, RUN_INSTANCES_OPERATION};
use crate::store::DocumentStore;

/// Aggregates per hour of `UsageStartDate`.
#[derive(Debug, Default, Clone, PartialEq)]
struct HourBucket {
    count: f64,
    cost: f64,
    unblended_cost: f64,
    reserved: f64,
    spot: f64,
}

/// Accumulates EC2 compute usage keyed by `UsageStartDate`. Buckets stay
/// ordered so derived documents come out in chronological order.
#[derive(Debug, Default)]
pub struct Aggregator {
    hours: BTreeMap<String, HourBucket>,
}

impl Aggregator {
    /// Folds one raw row into the aggregates. Non-EC2 rows and rows without
    /// a usage timestamp are ignored.
    pub fn observe(&mut self, row: &Row) {
        let field = |key: &str| row.get(key).map(String::as_str).unwrap_or("");

        if field("ProductName") != EC2_PRODUCT_NAME
            || !field("Operation").contains(RUN_INSTANCES_OPERATION)
        {
            return;
        }
        let timestamp = field("UsageStartDate");
        if timestamp.is_empty() {
            return;
        }

        let quantity = field("UsageQuantity").parse::<f64>().unwrap_or(0.0);
        let bucket = self.hours.entry(timestamp.to_string()).or_default();
        bucket.count += quantity;
        bucket.cost += field("Cost").parse::<f64>().unwrap_or(0.0);
        bucket.unblended_cost += field("UnBlendedCost").parse::<f64>().unwrap_or(0.0);
        if field("ReservedInstance") == "Y" {
            bucket.reserved += quantity;
        }
        if field("UsageType").contains("SpotUsage") {
            bucket.spot += quantity;
        }
    }

    /// One document per usage hour: fleet counts plus inverse-mean cost
    /// rates. A zero cost yields a `0.0` rate rather than infinity.
    pub fn rate_documents(&self) -> Vec<Document> {
        self.hours
            .iter()
            .map(|(timestamp, bucket)| {
                let mut doc = Document::new();
                doc.insert(
                    "UsageStartDate".to_string(),
                    Value::String(timestamp.clone()),
                );
                insert_number(&mut doc, "InstanceCount", bucket.count);
                insert_number(&mut doc, "ReservedCount", bucket.reserved);
                insert_number(&mut doc, "SpotCount", bucket.spot);
                insert_number(&mut doc, "CostRate", ratio(bucket.count, bucket.cost));
                insert_number(
                    &mut doc,
                    "UnBlendedCostRate",
                    ratio(bucket.count, bucket.unblended_cost),
                );
                doc
            })
            .collect()
    }

    /// One document per day: elasticity of the non-reserved fleet plus
    /// reserved and spot coverage ratios.
    pub fn elasticity_documents(&self) -> Vec<Document> {
        let mut days: BTreeMap<&str, Vec<&HourBucket>> = BTreeMap::new();
        for (timestamp, bucket) in &self.hours {
            // "YYYY-MM-DD HH:mm:ss" timestamps group by their date prefix.
            let day = timestamp.split(' ').next().unwrap_or(timestamp);
            days.entry(day).or_default().push(bucket);
        }

        days.iter()
            .map(|(day, buckets)| {
                let total: f64 = buckets.iter().map(|b| b.count).sum();
                let reserved: f64 = buckets.iter().map(|b| b.reserved).sum();
                let spot: f64 = buckets.iter().map(|b| b.spot).sum();

                let mut doc = Document::new();
                doc.insert("Date".to_string(), Value::String(day.to_string()));
                insert_number(&mut doc, "Elasticity", elasticity(buckets));
                insert_number(&mut doc, "ReservedCoverage", ratio(reserved, total));
                insert_number(&mut doc, "SpotCoverage", ratio(spot, total));
                doc
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }
}

/// Variation of the non-reserved fleet across a day's hours: `1 - min/max`
/// of `count - reserved`, or `1.0` for a day with no on-demand usage.
fn elasticity(buckets: &[&HourBucket]) -> f64 {
    let mut min = f64::INFINITY;
    let mut max: f64 = 0.0;
    for bucket in buckets {
        let on_demand = bucket.count - bucket.reserved;
        min = min.min(on_demand);
        max = max.max(on_demand);
    }
    if max == 0.0 {
        1.0
    } else {
        1.0 - min / max
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

fn insert_number(doc: &mut Document, key: &str, value: f64) {
    let number = Number::from_f64(value).unwrap_or_else(|| Number::from(0));
    doc.insert(key.to_string(), Value::Number(number));
}

/// Scans the input file with its own handle and writes the derived documents
/// to the store under `{doctype}-rate` and `{doctype}-elasticity`.
pub async fn run<S: DocumentStore + Sync>(cfg: &Config, store: &S) -> Result<()> {
    let mut aggregator = Aggregator::default();
    let mut reader = crate::pipeline::open_reader(cfg)?;

    for result in reader.deserialize::<Row>() {
        let row = match result {
            Ok(row) => row,
            // Ingestion owns per-record failure reporting.
            Err(err) => {
                debug!(error = %err, "analytics skipping malformed row");
                continue;
            }
        };
        if crate::record::is_control_message(&row, &cfg.control_spec) {
            continue;
        }
        aggregator.observe(&row);
    }

    if aggregator.is_empty() {
        info!("no EC2 compute usage found, skipping analytics documents");
        return Ok(());
    }

    let index = cfg.index_name();
    let mut written = 0u64;

    let rate_doctype = format!("{}-rate", cfg.es_doctype);
    for doc in aggregator.rate_documents() {
        store
            .index_document(&index, &rate_doctype, &doc)
            .await
            .context("writing rate document")?;
        written += 1;
    }

    let elasticity_doctype = format!("{}-elasticity", cfg.es_doctype);
    for doc in aggregator.elasticity_documents() {
        store
            .index_document(&index, &elasticity_doctype, &doc)
            .await
            .context("writing elasticity document")?;
        written += 1;
    }

    info!(index, written, "analytics documents written");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ec2_row(timestamp: &str, quantity: &str, reserved: &str, usage_type: &str) -> Row {
        row(&[
            ("ProductName", EC2_PRODUCT_NAME),
            ("Operation", "RunInstances"),
            ("UsageStartDate", timestamp),
            ("UsageQuantity", quantity),
            ("Cost", "0.5"),
            ("UnBlendedCost", "0.4"),
            ("ReservedInstance", reserved),
            ("UsageType", usage_type),
        ])
    }

    #[test]
    fn test_observe_ignores_non_ec2_rows() {
        let mut agg = Aggregator::default();
        agg.observe(&row(&[
            ("ProductName", "Amazon Simple Storage Service"),
            ("Operation", "PutObject"),
            ("UsageStartDate", "2015-12-01 00:00:00"),
        ]));
        assert!(agg.is_empty());
    }

    #[test]
    fn test_rate_is_count_over_cost() {
        let mut agg = Aggregator::default();
        agg.observe(&ec2_row("2015-12-01 00:00:00", "2", "", "BoxUsage:m1.small"));
        agg.observe(&ec2_row("2015-12-01 00:00:00", "3", "", "BoxUsage:m1.small"));

        let docs = agg.rate_documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["InstanceCount"], 5.0);
        // 5 instances over 1.0 total cost.
        assert_eq!(docs[0]["CostRate"], 5.0);
        assert_eq!(docs[0]["UnBlendedCostRate"], 6.25);
    }

    #[test]
    fn test_rate_with_zero_cost_is_zero() {
        let bucket = HourBucket {
            count: 4.0,
            ..Default::default()
        };
        let mut agg = Aggregator::default();
        agg.hours.insert("2015-12-01 00:00:00".to_string(), bucket);

        let docs = agg.rate_documents();
        assert_eq!(docs[0]["CostRate"], 0.0);
    }

    #[test]
    fn test_elasticity_of_varying_fleet() {
        let mut agg = Aggregator::default();
        agg.observe(&ec2_row("2015-12-01 00:00:00", "10", "", "BoxUsage:m1.small"));
        agg.observe(&ec2_row("2015-12-01 01:00:00", "8", "", "BoxUsage:m1.small"));
        agg.observe(&ec2_row("2015-12-01 02:00:00", "12", "", "BoxUsage:m1.small"));

        let docs = agg.elasticity_documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["Date"], "2015-12-01");
        // 1 - 8/12
        let value = docs[0]["Elasticity"].as_f64().unwrap();
        assert!((value - (1.0 - 8.0 / 12.0)).abs() < 1e-12);
    }

    #[test]
    fn test_elasticity_excludes_reserved_capacity() {
        let mut agg = Aggregator::default();
        // 6 reserved in every hour, on-demand varies 4 -> 2.
        agg.observe(&ec2_row("2015-12-01 00:00:00", "6", "Y", "HeavyUsage:m1.small"));
        agg.observe(&ec2_row("2015-12-01 00:00:00", "4", "", "BoxUsage:m1.small"));
        agg.observe(&ec2_row("2015-12-01 01:00:00", "6", "Y", "HeavyUsage:m1.small"));
        agg.observe(&ec2_row("2015-12-01 01:00:00", "2", "", "BoxUsage:m1.small"));

        let docs = agg.elasticity_documents();
        let value = docs[0]["Elasticity"].as_f64().unwrap();
        assert!((value - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_elasticity_of_all_reserved_day_is_one() {
        let mut agg = Aggregator::default();
        agg.observe(&ec2_row("2015-12-01 00:00:00", "6", "Y", "HeavyUsage:m1.small"));

        let docs = agg.elasticity_documents();
        assert_eq!(docs[0]["Elasticity"], 1.0);
        assert_eq!(docs[0]["ReservedCoverage"], 1.0);
        assert_eq!(docs[0]["SpotCoverage"], 0.0);
    }

    #[test]
    fn test_coverage_ratios() {
        let mut agg = Aggregator::default();
        agg.observe(&ec2_row("2015-12-01 00:00:00", "5", "Y", "HeavyUsage:m1.small"));
        agg.observe(&ec2_row("2015-12-01 00:00:00", "3", "", "SpotUsage:c3.large"));
        agg.observe(&ec2_row("2015-12-01 00:00:00", "2", "", "BoxUsage:m1.small"));

        let docs = agg.elasticity_documents();
        assert_eq!(docs[0]["ReservedCoverage"], 0.5);
        assert_eq!(docs[0]["SpotCoverage"], 0.3);
    }

    #[test]
    fn test_days_are_grouped_by_date_prefix() {
        let mut agg = Aggregator::default();
        agg.observe(&ec2_row("2015-12-01 23:00:00", "1", "", "BoxUsage:m1.small"));
        agg.observe(&ec2_row("2015-12-02 00:00:00", "1", "", "BoxUsage:m1.small"));

        let docs = agg.elasticity_documents();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["Date"], "2015-12-01");
        assert_eq!(docs[1]["Date"], "2015-12-02");
    }
}
