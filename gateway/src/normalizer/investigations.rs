use super::{Normalizer, RecordContext, build_record, field, lenient, lenient_items};
use crate::types::{Domain, NormalizedRecord};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct InvestigationsPayload {
    #[serde(deserialize_with = "lenient_items")]
    pub results: Vec<InvestigationItem>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InvestigationItem {
    #[serde(deserialize_with = "lenient")]
    pub investigation_number: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub investigation_type: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub subject: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub open_date: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub close_date: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub components: Option<String>,
}

impl Normalizer for InvestigationsPayload {
    fn normalize(&self, ctx: &RecordContext<'_>) -> Vec<NormalizedRecord> {
        self.results
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let fields = BTreeMap::from([
                    field("investigation_number", item.investigation_number.clone()),
                    field("investigation_type", item.investigation_type.clone()),
                    field("subject", item.subject.clone()),
                    field("description", item.description.clone()),
                    field("open_date", item.open_date.clone()),
                    field("close_date", item.close_date.clone()),
                    field("status", item.status.clone()),
                    field("components", item.components.clone()),
                ]);
                build_record(
                    Domain::Investigations,
                    ctx,
                    item.investigation_number.clone(),
                    index,
                    fields,
                )
            })
            .collect()
    }
}
