//! Delta partitioning and the messages produced from it.

use super::catalog::{ChangesResponse, EntityChange, ProductInfo, ProductInfoRequest};
use crate::queue::QueueName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary produced to the changes queue for each applied delta.
///
/// Maps entity id to the highest change number seen for it in the delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub app_ids: BTreeMap<u32, u32>,
    pub package_ids: BTreeMap<u32, u32>,
}

/// Which entity queue a detail belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    App,
    Package,
}

impl EntityKind {
    pub fn queue(&self) -> QueueName {
        match self {
            EntityKind::App => QueueName::Apps,
            EntityKind::Package => QueueName::Packages,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::App => "apps",
            EntityKind::Package => "packages",
        }
    }
}

/// Work item for one app or package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMessage {
    pub id: u32,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_number: Option<u32>,
    /// Upstream does not know this id. Consumers should mark it removed.
    #[serde(default)]
    pub missing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EntityMessage {
    pub fn found(kind: EntityKind, info: ProductInfo) -> Self {
        Self {
            id: info.id,
            kind,
            change_number: Some(info.change_number),
            missing: false,
            payload: Some(info.payload),
        }
    }

    pub fn missing(kind: EntityKind, id: u32) -> Self {
        Self {
            id,
            kind,
            change_number: None,
            missing: true,
            payload: None,
        }
    }
}

fn collapse(changes: &[EntityChange]) -> BTreeMap<u32, u32> {
    let mut by_id = BTreeMap::new();
    for change in changes {
        by_id
            .entry(change.id)
            .and_modify(|n: &mut u32| *n = (*n).max(change.change_number))
            .or_insert(change.change_number);
    }
    by_id
}

/// A delta partitioned by entity kind, one entry per id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    apps: BTreeMap<u32, u32>,
    packages: BTreeMap<u32, u32>,
}

impl ChangeBatch {
    pub fn from_response(response: &ChangesResponse) -> Self {
        Self {
            apps: collapse(&response.app_changes),
            packages: collapse(&response.package_changes),
        }
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.packages.is_empty()
    }

    /// Detail requests of at most `max_ids` ids each, apps first.
    pub fn detail_requests(&self, max_ids: usize) -> Vec<ProductInfoRequest> {
        let max_ids = max_ids.max(1);
        let mut requests = Vec::new();
        let mut current = ProductInfoRequest::default();

        for (kind, ids) in [(EntityKind::App, &self.apps), (EntityKind::Package, &self.packages)] {
            for id in ids.keys() {
                if current.len() == max_ids {
                    requests.push(std::mem::take(&mut current));
                }
                match kind {
                    EntityKind::App => current.apps.push(*id),
                    EntityKind::Package => current.packages.push(*id),
                }
            }
        }

        if !current.is_empty() {
            requests.push(current);
        }
        requests
    }

    pub fn to_message(&self) -> ChangeMessage {
        ChangeMessage {
            app_ids: self.apps.clone(),
            package_ids: self.packages.clone(),
        }
    }
}
