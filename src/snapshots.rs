//! Reconciliation of snapshot repositories and snapshot-management policies
//! against a managed cluster. Runs inside the one-shot green callback, so
//! the cluster is known reachable. Policies are always rewritten under
//! optimistic-concurrency tokens because OpenSearch normalizes stored fields
//! (`24h` becomes `1d`), which makes naive equality unreliable.

use crate::crd::{SnapshotPolicy, SnapshotRepository};
use crate::opensearch::{OpenSearchClient, OpenSearchError};

use serde_json::{json, Value};

const SM_POLICIES_PATH: &str = "/_plugins/_sm/policies";

/// Converges every configured repository. Per-repository failures are logged
/// and do not block the remaining repositories.
pub async fn upsert_snapshot_repositories(
    client: &OpenSearchClient,
    repositories: &[SnapshotRepository],
    cluster: &str,
) {
    for repository in repositories {
        if let Err(err) = upsert_repository(client, repository).await {
            log::error!(
                "Failed to reconcile snapshot repository '{}' for cluster {}: {}",
                repository.name,
                cluster,
                err
            );
        }
    }
}

async fn upsert_repository(
    client: &OpenSearchClient,
    repository: &SnapshotRepository,
) -> Result<(), OpenSearchError> {
    client
        .put_json(
            &format!("/_snapshot/{}", repository.name),
            &repository_document(repository),
        )
        .await?;

    let existing = parse_policies(&client.get_json(SM_POLICIES_PATH).await?);
    let desired: Vec<String> = repository
        .policies
        .iter()
        .map(|policy| policy_name(repository, policy))
        .collect();

    for (name, policy) in desired.iter().zip(repository.policies.iter()) {
        let document = policy_document(&repository.name, policy);
        let matched = existing
            .iter()
            .find(|e| e.name == *name && e.repository.as_deref() == Some(repository.name.as_str()));
        match matched {
            Some(found) => {
                // always rewrite; the concurrency tokens guard against racing
                // a concurrent writer, not against our own staleness
                let path = format!(
                    "{}/{}?if_seq_no={}&if_primary_term={}",
                    SM_POLICIES_PATH, name, found.seq_no, found.primary_term
                );
                client.put_json(&path, &document).await?;
                log::info!("Updated snapshot policy '{}'", name);
            }
            None => {
                client
                    .post_json(&format!("{}/{}", SM_POLICIES_PATH, name), &document)
                    .await?;
                log::info!("Created snapshot policy '{}'", name);
            }
        }
    }

    for orphan in orphan_names(&existing, &repository.name, &desired) {
        client
            .delete(&format!("{}/{}", SM_POLICIES_PATH, orphan))
            .await?;
        log::info!("Deleted orphaned snapshot policy '{}'", orphan);
    }

    Ok(())
}

/// `shard_path_type: hashed_infix` lets multiple clusters share one bucket.
fn repository_document(repository: &SnapshotRepository) -> Value {
    let mut settings = json!({
        "bucket": repository.bucket,
        "client": repository.name,
        "shard_path_type": "hashed_infix",
    });
    if let Some(base_path) = &repository.base_path {
        settings["base_path"] = json!(base_path);
    }
    json!({
        "type": "s3",
        "settings": settings,
    })
}

fn policy_name(repository: &SnapshotRepository, policy: &SnapshotPolicy) -> String {
    format!("{}-{}", repository.name, policy.name)
}

fn policy_document(repository_name: &str, policy: &SnapshotPolicy) -> Value {
    json!({
        "description": format!("Snapshots of repository {}", repository_name),
        "creation": {
            "schedule": {
                "cron": {
                    "expression": policy.schedule,
                    "timezone": "UTC",
                }
            }
        },
        "deletion": {
            "condition": {
                "max_age": policy.max_age,
            }
        },
        "snapshot_config": {
            "repository": repository_name,
            "include_global_state": false,
            "indices": "*,-.opendistro_security",
        },
    })
}

#[derive(Debug, PartialEq)]
struct ExistingPolicy {
    name: String,
    repository: Option<String>,
    seq_no: i64,
    primary_term: i64,
}

/// Parses `GET /_plugins/_sm/policies`. Document ids carry an `-sm-policy`
/// suffix; the bare name lives in `sm_policy.name`.
fn parse_policies(response: &Value) -> Vec<ExistingPolicy> {
    let policies = match response.pointer("/policies").and_then(Value::as_array) {
        Some(policies) => policies,
        None => return Vec::new(),
    };
    policies
        .iter()
        .filter_map(|entry| {
            let name = entry
                .pointer("/sm_policy/name")
                .and_then(Value::as_str)
                .or_else(|| {
                    entry
                        .pointer("/_id")
                        .and_then(Value::as_str)
                        .map(|id| id.trim_end_matches("-sm-policy"))
                })?
                .to_owned();
            Some(ExistingPolicy {
                name,
                repository: entry
                    .pointer("/sm_policy/snapshot_config/repository")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                seq_no: entry.pointer("/_seq_no").and_then(Value::as_i64).unwrap_or(0),
                primary_term: entry
                    .pointer("/_primary_term")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            })
        })
        .collect()
}

/// Policies that live under `repository` but are no longer desired.
fn orphan_names(existing: &[ExistingPolicy], repository: &str, desired: &[String]) -> Vec<String> {
    existing
        .iter()
        .filter(|policy| policy.repository.as_deref() == Some(repository))
        .filter(|policy| !desired.contains(&policy.name))
        .map(|policy| policy.name.clone())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::SecretKeyRef;

    fn repository(policies: Vec<SnapshotPolicy>) -> SnapshotRepository {
        SnapshotRepository {
            name: "backup".to_owned(),
            bucket: "my-bucket".to_owned(),
            base_path: Some("clusters/example".to_owned()),
            region: None,
            endpoint: None,
            protocol: None,
            access_key_id: SecretKeyRef {
                name: "s3".to_owned(),
                key: "id".to_owned(),
            },
            secret_access_key: SecretKeyRef {
                name: "s3".to_owned(),
                key: "secret".to_owned(),
            },
            policies,
        }
    }

    fn policy(name: &str) -> SnapshotPolicy {
        SnapshotPolicy {
            name: name.to_owned(),
            schedule: "0 3 * * *".to_owned(),
            max_age: "7d".to_owned(),
        }
    }

    #[test]
    fn repository_document_shares_buckets_safely() {
        let document = repository_document(&repository(vec![]));
        assert_eq!("s3", document["type"]);
        assert_eq!("my-bucket", document["settings"]["bucket"]);
        assert_eq!("backup", document["settings"]["client"]);
        assert_eq!("hashed_infix", document["settings"]["shard_path_type"]);
        assert_eq!("clusters/example", document["settings"]["base_path"]);
    }

    #[test]
    fn repository_document_omits_absent_base_path() {
        let mut repo = repository(vec![]);
        repo.base_path = None;
        let document = repository_document(&repo);
        assert!(document["settings"].get("base_path").is_none());
    }

    #[test]
    fn policy_names_are_prefixed_with_the_repository() {
        assert_eq!(
            "backup-daily",
            policy_name(&repository(vec![]), &policy("daily"))
        );
    }

    #[test]
    fn policy_document_excludes_security_indices_and_global_state() {
        let document = policy_document("backup", &policy("daily"));
        assert_eq!(
            "0 3 * * *",
            document["creation"]["schedule"]["cron"]["expression"]
        );
        assert_eq!("UTC", document["creation"]["schedule"]["cron"]["timezone"]);
        assert_eq!("7d", document["deletion"]["condition"]["max_age"]);
        assert_eq!("backup", document["snapshot_config"]["repository"]);
        assert_eq!(false, document["snapshot_config"]["include_global_state"]);
        assert_eq!(
            "*,-.opendistro_security",
            document["snapshot_config"]["indices"]
        );
    }

    #[test]
    fn parses_existing_policies_with_concurrency_tokens() {
        let response = json!({
            "policies": [
                {
                    "_id": "backup-daily-sm-policy",
                    "_seq_no": 11,
                    "_primary_term": 2,
                    "sm_policy": {
                        "name": "backup-daily",
                        "snapshot_config": {"repository": "backup"},
                    },
                },
                {
                    "_id": "other-sm-policy",
                    "_seq_no": 4,
                    "_primary_term": 1,
                    "sm_policy": {
                        "name": "other",
                        "snapshot_config": {"repository": "elsewhere"},
                    },
                },
            ],
            "total_policies": 2,
        });
        let existing = parse_policies(&response);
        assert_eq!(2, existing.len());
        assert_eq!("backup-daily", existing[0].name);
        assert_eq!(Some("backup"), existing[0].repository.as_deref());
        assert_eq!(11, existing[0].seq_no);
        assert_eq!(2, existing[0].primary_term);
    }

    #[test]
    fn empty_policy_listing_parses_to_nothing() {
        assert!(parse_policies(&json!({"total_policies": 0})).is_empty());
    }

    #[test]
    fn orphans_are_scoped_to_the_repository() {
        let existing = vec![
            ExistingPolicy {
                name: "backup-daily".to_owned(),
                repository: Some("backup".to_owned()),
                seq_no: 0,
                primary_term: 0,
            },
            ExistingPolicy {
                name: "backup-hourly".to_owned(),
                repository: Some("backup".to_owned()),
                seq_no: 0,
                primary_term: 0,
            },
            ExistingPolicy {
                name: "other-daily".to_owned(),
                repository: Some("other".to_owned()),
                seq_no: 0,
                primary_term: 0,
            },
        ];
        let desired = vec!["backup-daily".to_owned()];
        // other-daily belongs to a different repository and is untouched
        assert_eq!(vec!["backup-hourly".to_owned()], orphan_names(&existing, "backup", &desired));
    }
}
