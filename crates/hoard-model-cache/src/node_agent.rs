//! Per-node CacheNode lifecycle
//!
//! A node's CacheNode is shared by every ModelCache targeting that node, so
//! each mutation here is a read-then-conditional-update: re-read the object,
//! edit only the one model entry, and write it back carrying the read's
//! resourceVersion. Conflicts from concurrent writers are retried with a
//! fresh read.

use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::Client;
use tracing::{debug, info, warn};

use hoard_common::crd::{CacheNode, CacheNodeSpec, ModelEntry};
use hoard_common::retry::retry_on_conflict;
use hoard_common::Result;

/// Outcome of applying a model entry to a CacheNode spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryChange {
    /// The entry was already present with the same source URI
    Unchanged,
    /// The entry was appended to the model list
    Added,
    /// The entry was present under a different source URI and was corrected
    UriCorrected {
        /// The URI previously recorded for this model
        previous: String,
    },
}

/// Add or correct one model entry in a CacheNode spec.
///
/// The model list holds a given model at most once; a URI mismatch is
/// corrected in place because source URIs are immutable once declared,
/// so a mismatch signals an upstream bug rather than a legitimate edit.
pub fn apply_model_entry(spec: &mut CacheNodeSpec, entry: &ModelEntry) -> EntryChange {
    for existing in &mut spec.models {
        if existing.model_name == entry.model_name {
            if existing.source_model_uri == entry.source_model_uri {
                return EntryChange::Unchanged;
            }
            let previous = std::mem::replace(
                &mut existing.source_model_uri,
                entry.source_model_uri.clone(),
            );
            return EntryChange::UriCorrected { previous };
        }
    }
    spec.models.push(entry.clone());
    EntryChange::Added
}

/// Drop one model entry from a CacheNode spec. Returns whether it was present.
pub fn remove_model_entry(spec: &mut CacheNodeSpec, model_name: &str) -> bool {
    let before = spec.models.len();
    spec.models.retain(|m| m.model_name != model_name);
    spec.models.len() != before
}

/// Ensure the node's CacheNode lists the model with the declared source URI.
///
/// Creates the CacheNode on first contact with a ready, matched node.
/// Returns the post-write (or unchanged) CacheNode so the caller can read
/// the agent's status report without a second round trip.
pub async fn upsert(client: &Client, node_name: &str, entry: &ModelEntry) -> Result<CacheNode> {
    let api: Api<CacheNode> = Api::all(client.clone());

    retry_on_conflict("cache_node_upsert", || async {
        match api.get_opt(node_name).await? {
            None => {
                let cache_node = CacheNode::new(
                    node_name,
                    CacheNodeSpec {
                        models: vec![entry.clone()],
                    },
                );
                info!(node = %node_name, model = %entry.model_name, "Creating CacheNode");
                Ok(api.create(&PostParams::default(), &cache_node).await?)
            }
            Some(mut cache_node) => match apply_model_entry(&mut cache_node.spec, entry) {
                EntryChange::Unchanged => Ok(cache_node),
                change => {
                    if let EntryChange::UriCorrected { previous } = &change {
                        warn!(
                            node = %node_name,
                            model = %entry.model_name,
                            previous_uri = %previous,
                            corrected_uri = %entry.source_model_uri,
                            "CacheNode listed model under an unexpected source URI, correcting"
                        );
                    } else {
                        debug!(node = %node_name, model = %entry.model_name, "Adding model to CacheNode");
                    }
                    // replace() carries the resourceVersion from the read,
                    // so a concurrent writer turns this into a 409 retry.
                    Ok(api
                        .replace(node_name, &PostParams::default(), &cache_node)
                        .await?)
                }
            },
        }
    })
    .await
}

/// Retract the model from the node's CacheNode.
///
/// No-op when the CacheNode or the entry is already gone. A CacheNode whose
/// model list becomes empty is deleted, with a resourceVersion precondition
/// so a concurrent upsert for another cache wins the race.
pub async fn remove(client: &Client, node_name: &str, model_name: &str) -> Result<()> {
    let api: Api<CacheNode> = Api::all(client.clone());

    retry_on_conflict("cache_node_remove", || async {
        let Some(mut cache_node) = api.get_opt(node_name).await? else {
            return Ok(());
        };
        if !remove_model_entry(&mut cache_node.spec, model_name) {
            return Ok(());
        }

        if cache_node.spec.models.is_empty() {
            info!(node = %node_name, model = %model_name, "Deleting empty CacheNode");
            let dp = guarded_delete_params(&cache_node);
            match api.delete(node_name, &dp).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            debug!(node = %node_name, model = %model_name, "Removing model from CacheNode");
            api.replace(node_name, &PostParams::default(), &cache_node)
                .await?;
            Ok(())
        }
    })
    .await
}

/// Delete parameters pinning the delete to the CacheNode revision just read,
/// so a concurrent upsert for another cache wins the race with a 409.
fn guarded_delete_params(cache_node: &CacheNode) -> DeleteParams {
    DeleteParams {
        preconditions: Some(Preconditions {
            resource_version: cache_node.metadata.resource_version.clone(),
            uid: None,
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(model: &str, uri: &str) -> ModelEntry {
        ModelEntry {
            model_name: model.to_string(),
            source_model_uri: uri.to_string(),
        }
    }

    #[test]
    fn apply_appends_missing_entry() {
        let mut spec = CacheNodeSpec::default();
        assert_eq!(
            apply_model_entry(&mut spec, &entry("iris", "s3://models/iris")),
            EntryChange::Added
        );
        assert_eq!(spec.models.len(), 1);
    }

    #[test]
    fn apply_is_idempotent() {
        let mut spec = CacheNodeSpec {
            models: vec![entry("iris", "s3://models/iris")],
        };
        assert_eq!(
            apply_model_entry(&mut spec, &entry("iris", "s3://models/iris")),
            EntryChange::Unchanged
        );
        assert_eq!(spec.models.len(), 1);
    }

    #[test]
    fn apply_corrects_uri_mismatch() {
        let mut spec = CacheNodeSpec {
            models: vec![entry("iris", "s3://stale/iris")],
        };
        assert_eq!(
            apply_model_entry(&mut spec, &entry("iris", "s3://models/iris")),
            EntryChange::UriCorrected {
                previous: "s3://stale/iris".to_string()
            }
        );
        assert_eq!(spec.models[0].source_model_uri, "s3://models/iris");
        assert_eq!(spec.models.len(), 1);
    }

    #[test]
    fn apply_keeps_other_caches_entries() {
        let mut spec = CacheNodeSpec {
            models: vec![entry("fraud", "s3://models/fraud")],
        };
        apply_model_entry(&mut spec, &entry("iris", "s3://models/iris"));
        assert_eq!(spec.models.len(), 2);
        assert_eq!(spec.models[0].model_name, "fraud");
    }

    #[test]
    fn remove_drops_only_the_named_model() {
        let mut spec = CacheNodeSpec {
            models: vec![
                entry("iris", "s3://models/iris"),
                entry("fraud", "s3://models/fraud"),
            ],
        };
        assert!(remove_model_entry(&mut spec, "iris"));
        assert_eq!(spec.models.len(), 1);
        assert_eq!(spec.models[0].model_name, "fraud");
    }

    #[test]
    fn remove_absent_model_is_a_noop() {
        let mut spec = CacheNodeSpec {
            models: vec![entry("fraud", "s3://models/fraud")],
        };
        assert!(!remove_model_entry(&mut spec, "iris"));
        assert_eq!(spec.models.len(), 1);
    }

    #[test]
    fn empty_cache_node_delete_is_revision_guarded() {
        let mut cache_node = CacheNode::new("node-a", CacheNodeSpec::default());
        cache_node.metadata.resource_version = Some("41".to_string());
        let dp = guarded_delete_params(&cache_node);
        let preconditions = dp.preconditions.as_ref().unwrap();
        assert_eq!(preconditions.resource_version.as_deref(), Some("41"));
        assert!(preconditions.uid.is_none());
    }
}
