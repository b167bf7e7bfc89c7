use super::{Normalizer, RecordContext, build_record, field, lenient, lenient_items};
use crate::types::{Domain, NormalizedRecord};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RecallsPayload {
    #[serde(rename = "Count", default, deserialize_with = "lenient")]
    pub count: Option<u64>,
    #[serde(deserialize_with = "lenient_items")]
    pub results: Vec<RecallItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecallItem {
    #[serde(rename = "NHTSACampaignNumber", deserialize_with = "lenient")]
    pub campaign_number: Option<String>,
    #[serde(rename = "Manufacturer", deserialize_with = "lenient")]
    pub manufacturer: Option<String>,
    #[serde(rename = "Component", deserialize_with = "lenient")]
    pub component: Option<String>,
    #[serde(rename = "Summary", deserialize_with = "lenient")]
    pub summary: Option<String>,
    #[serde(rename = "Consequence", deserialize_with = "lenient")]
    pub consequence: Option<String>,
    #[serde(rename = "Remedy", deserialize_with = "lenient")]
    pub remedy: Option<String>,
    #[serde(rename = "ReportReceivedDate", deserialize_with = "lenient")]
    pub report_received_date: Option<String>,
    #[serde(rename = "parkIt", deserialize_with = "lenient")]
    pub park_it: Option<bool>,
    #[serde(rename = "overTheAirUpdate", deserialize_with = "lenient")]
    pub over_the_air_update: Option<bool>,
}

impl Normalizer for RecallsPayload {
    fn normalize(&self, ctx: &RecordContext<'_>) -> Vec<NormalizedRecord> {
        self.results
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let fields = BTreeMap::from([
                    field("campaign_number", item.campaign_number.clone()),
                    field("manufacturer", item.manufacturer.clone()),
                    field("component", item.component.clone()),
                    field("summary", item.summary.clone()),
                    field("consequence", item.consequence.clone()),
                    field("remedy", item.remedy.clone()),
                    field("report_received_date", item.report_received_date.clone()),
                    field("park_it", item.park_it),
                    field("over_the_air_update", item.over_the_air_update),
                ]);
                build_record(
                    Domain::Recalls,
                    ctx,
                    item.campaign_number.clone(),
                    index,
                    fields,
                )
            })
            .collect()
    }
}
