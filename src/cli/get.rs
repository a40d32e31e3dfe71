//! The `get` subcommand

use clap::{Args, Subcommand};

use super::format::{format_age, print_table};
use crate::cluster::{parse_api_version, run_id_for, ClusterContext};
use crate::error::Error;
use crate::{Result, LABEL_MANAGED_BY, PROGNAME};

/// Arguments for `get`.
#[derive(Args, Debug)]
pub struct GetArgs {
    /// What to get.
    #[command(subcommand)]
    pub what: GetCommand,
}

/// Subjects `get` understands.
#[derive(Subcommand, Debug)]
pub enum GetCommand {
    /// List Kubernetes objects managed by tests
    ///
    /// Objects created or modified by test documents carry the
    /// `app.kubernetes.io/managed-by` label; this lists every object in
    /// the cluster wearing it.
    Objects,
}

/// Execute the `get` subcommand.
pub async fn run(args: GetArgs) -> Result<u8> {
    match args.what {
        GetCommand::Objects => objects().await,
    }
}

async fn objects() -> Result<u8> {
    let client = kube::Client::try_default()
        .await
        .map_err(|e| Error::transport(format!("failed to initialize Kubernetes context: {e}")))?;
    let cluster = ClusterContext::new(client).await?;

    let results = cluster
        .select_objects_by_label(LABEL_MANAGED_BY, PROGNAME)
        .await?;

    if results.is_empty() {
        return Ok(0);
    }

    let rows: Vec<Vec<String>> = results
        .iter()
        .map(|object| {
            let (group, kind) = object
                .types
                .as_ref()
                .map(|t| (parse_api_version(&t.api_version).0, t.kind.to_lowercase()))
                .unwrap_or_default();

            let group_kind = if group.is_empty() {
                kind
            } else {
                format!("{kind}.{group}")
            };

            vec![
                object.metadata.namespace.clone().unwrap_or_default(),
                format!("{group_kind}/{}", object.metadata.name.as_deref().unwrap_or_default()),
                run_id_for(object).unwrap_or_default().to_string(),
                object
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| format_age(&t.0))
                    .unwrap_or_default(),
            ]
        })
        .collect();

    print_table(&["NAMESPACE", "NAME", "RUN ID", "AGE"], &rows);
    Ok(0)
}
