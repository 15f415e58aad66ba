//! Fixture and script files: the objects a space starts with and the
//! mutations replayed against it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use quarry_core::{Details, RelationFormat};
use quarry_query::SlicePatch;
use quarry_store::{MemCollections, MemStore};
use quarry_subs::{SearchRequest, SubscribeGroupsRequest, SubscribeIdsRequest};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

/// Reads JSON (`.json`) or YAML (anything else).
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(&text).with_context(|| format!("parsing JSON {}", path.display()))
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing YAML {}", path.display()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Fixture {
    pub space_id: Option<String>,
    pub relations: BTreeMap<String, RelationFormat>,
    pub objects: Vec<serde_json::Value>,
    pub collections: BTreeMap<String, Vec<String>>,
}

impl Fixture {
    pub fn space_id(&self) -> &str { self.space_id.as_deref().unwrap_or("space") }

    pub fn populate(&self) -> (Arc<MemStore>, Arc<MemCollections>) {
        let store = Arc::new(MemStore::new());
        for (key, format) in &self.relations {
            store.set_relation_format(key, *format);
        }
        store.put_many(self.objects.iter().cloned().map(Details::from));
        let collections = Arc::new(MemCollections::default());
        for (id, ids) in &self.collections {
            collections.set_collection(id, ids.clone());
        }
        debug!(objects = store.len(), collections = self.collections.len(), "fixture: loaded");
        (store, collections)
    }
}

/// One mutation of a replay script.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    /// Insert or replace a whole object.
    Put(serde_json::Value),
    /// Merge keys into an existing object; `null` removes a key.
    Update { id: String, set: serde_json::Map<String, serde_json::Value> },
    Delete(String),
    Patch { collection: String, patches: Vec<SlicePatch> },
    /// Wait for the pending batch to be applied before the next step.
    Flush,
}

impl Step {
    pub fn apply(&self, store: &MemStore, collections: &MemCollections) -> Result<()> {
        match self {
            Step::Put(v) => store.put(Details::from(v.clone())),
            Step::Update { id, set } => store
                .update(id, |d| {
                    for (k, v) in set {
                        if v.is_null() {
                            d.remove(k);
                        } else {
                            d.set(k, v.clone());
                        }
                    }
                })
                .with_context(|| format!("updating {}", id))?,
            Step::Delete(id) => store.delete(id),
            Step::Patch { collection, patches } => {
                collections.apply(collection, patches.clone()).with_context(|| format!("patching collection {}", collection))?
            }
            Step::Flush => {}
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Script {
    pub search: Vec<SearchRequest>,
    pub ids: Vec<SubscribeIdsRequest>,
    pub groups: Vec<SubscribeGroupsRequest>,
    pub steps: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fixture_and_script_drive_the_store() {
        let fixture: Fixture = serde_yaml::from_str(
            "spaceId: demo\nrelations:\n  assignee: object\nobjects:\n  - {id: a, name: Alpha}\n  - {id: b, name: Beta}\ncollections:\n  C: [a, b]\n",
        )
        .expect("fixture");
        assert_eq!(fixture.space_id(), "demo");
        let (store, collections) = fixture.populate();
        assert_eq!(store.len(), 2);
        assert_eq!(collections.ids("C"), vec!["a".to_string(), "b".to_string()]);

        let script: Script = serde_json::from_str(
            r#"{"steps": [
                {"update": {"id": "a", "set": {"name": "Zed", "extra": null}}},
                {"delete": "b"},
                {"patch": {"collection": "C", "patches": [{"Move": {"after_id": "", "ids": ["b"]}}]}},
                "flush"
            ]}"#,
        )
        .expect("script");
        for step in &script.steps {
            step.apply(&store, &collections).expect("step");
        }
        assert_eq!(store.get("a").expect("a").get_str("name"), "Zed");
        assert!(store.get("b").map_or(true, |d| d.get_bool("isDeleted")));
        assert_eq!(collections.ids("C"), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn unknown_object_update_is_an_error() {
        let store = MemStore::new();
        let collections = MemCollections::default();
        let step = Step::Update { id: "ghost".into(), set: serde_json::Map::new() };
        assert!(step.apply(&store, &collections).is_err());
    }
}
