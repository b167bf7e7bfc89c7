use super::{Normalizer, RecordContext, build_record, field, lenient, lenient_int, lenient_items};
use crate::types::{Domain, NormalizedRecord};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ComplaintsPayload {
    #[serde(default, deserialize_with = "lenient")]
    pub count: Option<u64>,
    #[serde(deserialize_with = "lenient_items")]
    pub results: Vec<ComplaintItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComplaintItem {
    #[serde(deserialize_with = "lenient_int")]
    pub odi_number: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    pub manufacturer: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub crash: Option<bool>,
    #[serde(deserialize_with = "lenient")]
    pub fire: Option<bool>,
    #[serde(deserialize_with = "lenient_int")]
    pub number_of_injuries: Option<i64>,
    #[serde(deserialize_with = "lenient_int")]
    pub number_of_deaths: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    pub date_of_incident: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub date_complaint_filed: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub components: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub summary: Option<String>,
}

impl Normalizer for ComplaintsPayload {
    fn normalize(&self, ctx: &RecordContext<'_>) -> Vec<NormalizedRecord> {
        self.results
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let fields = BTreeMap::from([
                    field("odi_number", item.odi_number),
                    field("manufacturer", item.manufacturer.clone()),
                    field("crash", item.crash),
                    field("fire", item.fire),
                    field("injuries", item.number_of_injuries),
                    field("deaths", item.number_of_deaths),
                    field("date_of_incident", item.date_of_incident.clone()),
                    field("date_filed", item.date_complaint_filed.clone()),
                    field("components", item.components.clone()),
                    field("summary", item.summary.clone()),
                ]);
                build_record(
                    Domain::Complaints,
                    ctx,
                    item.odi_number.map(|n| n.to_string()),
                    index,
                    fields,
                )
            })
            .collect()
    }
}
