//! Headless front end: prints what a windowed client would show.

use crate::cli::CliArgs;
use crate::config::{ClusterPreferences, KubeconfigRef, Preferences};
use crate::editor::{ObjectEditor, SaveOutcome};
use crate::extension::{Column, DetailProperty, ExtensionRegistry, Pipeline};
use crate::model::{Object, ResourceKind};
use crate::property::Property;
use crate::state::ClusterState;
use anyhow::{Context, Result, anyhow, bail};
use kube::ResourceExt;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{debug, info, warn};

const FIRST_LIST_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(args: CliArgs) -> Result<()> {
    let preferences = Preferences::load()?;
    let cluster = cluster_preferences(&args, &preferences)?;
    let state = ClusterState::connect(
        Property::new(cluster),
        &ExtensionRegistry::with_defaults(),
        preferences.watch,
    )
    .await
    .context("failed to connect to cluster")?;

    let _namespaces = state.namespaces.subscribe(|namespaces: &Option<Vec<Object>>| {
        if let Some(namespaces) = namespaces {
            debug!(count = namespaces.len(), "namespaces updated");
        }
    });

    let mut stdout = std::io::stdout();
    let result = if let Some(path) = &args.apply {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let editor = ObjectEditor::new(state.cluster.clone());
        let mut stdin = BufReader::new(tokio::io::stdin());
        apply_text(&editor, &text, args.yes, &mut stdin, &mut stdout).await
    } else if let Some(token) = &args.resource {
        let kind = state
            .cluster
            .resource_by_token(token)
            .cloned()
            .ok_or_else(|| anyhow!("the cluster serves no resource matching '{token}'"))?;
        let listing = Listing {
            search: args.search.as_deref(),
            details: args.details,
            watch_for: Duration::from_secs(args.watch_secs),
        };
        list_resource(&state, &kind, &listing, &mut stdout).await
    } else {
        print_namespaces(&state, &mut stdout).await
    };

    state.shutdown();
    result
}

/// Connection settings from a saved cluster, overridden by flags.
pub fn cluster_preferences(args: &CliArgs, preferences: &Preferences) -> Result<ClusterPreferences> {
    let mut cluster = match &args.cluster {
        Some(name) => preferences
            .find_cluster(name)
            .cloned()
            .ok_or_else(|| anyhow!("no saved cluster named '{name}'"))?,
        None => ClusterPreferences {
            name: args.context.clone().unwrap_or_else(|| "default".to_string()),
            ..ClusterPreferences::default()
        },
    };

    if args.in_cluster {
        cluster.in_cluster = true;
        cluster.kubeconfig = None;
    } else if let Some(path) = &args.kubeconfig {
        cluster.in_cluster = false;
        cluster.kubeconfig = Some(KubeconfigRef {
            path: path.clone(),
            context: args.context.clone(),
        });
    } else if let Some(context) = &args.context {
        if let Some(kubeconfig) = cluster.kubeconfig.as_mut() {
            kubeconfig.context = Some(context.clone());
        } else if cluster.in_cluster {
            bail!("--context cannot be used with an in-cluster connection");
        } else {
            let path = default_kubeconfig_path()
                .context("--context needs a kubeconfig; pass --kubeconfig")?;
            cluster.kubeconfig = Some(KubeconfigRef {
                path,
                context: Some(context.clone()),
            });
        }
    }

    cluster.validate()?;
    Ok(cluster)
}

fn default_kubeconfig_path() -> Option<PathBuf> {
    if let Some(paths) = std::env::var_os("KUBECONFIG")
        && let Some(first) = std::env::split_paths(&paths).next()
        && !first.as_os_str().is_empty()
    {
        return Some(first);
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube/config"))
}

pub struct Listing<'a> {
    pub search: Option<&'a str>,
    pub details: bool,
    pub watch_for: Duration,
}

/// Prints the objects of one kind, then every update until `watch_for`
/// has elapsed.
pub async fn list_resource<W: Write>(
    state: &ClusterState,
    kind: &ResourceKind,
    listing: &Listing<'_>,
    out: &mut W,
) -> Result<()> {
    if let Some(search) = listing.search {
        state.set_search_text(search);
    }
    let objects = state
        .select_resource(Some(kind.clone()))
        .ok_or_else(|| anyhow!("cannot watch {kind}"))?;
    let columns = state.extensions.columns(kind);
    let (_subscription, mut updates) = objects.subscribe_channel();

    let deadline = Instant::now() + listing.watch_for;
    let first = first_list(&mut updates).await?;
    print_objects(state, kind, &columns, &first, listing.details, out)?;

    while let Ok(Some(next)) = timeout_at(deadline, updates.recv()).await {
        if let Some(next) = next {
            writeln!(out)?;
            print_objects(state, kind, &columns, &next, listing.details, out)?;
        }
    }
    Ok(())
}

async fn print_namespaces<W: Write>(state: &ClusterState, out: &mut W) -> Result<()> {
    let (_subscription, mut updates) = state.namespaces.subscribe_channel();
    let namespaces = first_list(&mut updates).await?;
    writeln!(
        out,
        "cluster {}: {} resource kinds",
        state.cluster.preferences.get().name,
        state.cluster.resources.len()
    )?;
    for namespace in namespaces {
        writeln!(out, "{}", namespace.name_any())?;
    }
    Ok(())
}

/// Waits for the watch's first full list. A kind with no objects yields
/// an empty list as soon as it has been listed.
async fn first_list(
    updates: &mut UnboundedReceiver<Option<Vec<Object>>>,
) -> Result<Vec<Object>> {
    let deadline = Instant::now() + FIRST_LIST_TIMEOUT;
    loop {
        match timeout_at(deadline, updates.recv()).await {
            Ok(Some(Some(objects))) => return Ok(objects),
            Ok(Some(None)) => continue,
            Ok(None) => bail!("watch ended before the first list"),
            Err(_) => bail!("no list arrived within {}s", FIRST_LIST_TIMEOUT.as_secs()),
        }
    }
}

fn print_objects<W: Write>(
    state: &ClusterState,
    kind: &ResourceKind,
    columns: &[Column],
    objects: &[Object],
    details: bool,
    out: &mut W,
) -> Result<()> {
    let visible = state.filtered(objects);
    write!(out, "{}", render_table(columns, &visible))?;
    if details {
        for object in &visible {
            writeln!(out)?;
            write!(
                out,
                "{}",
                render_properties(&state.extensions.object_properties(kind, object))
            )?;
        }
    }
    Ok(())
}

/// Aligned text table, highest priority column first.
pub fn render_table(columns: &[Column], objects: &[Object]) -> String {
    let mut ordered = columns.to_vec();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut rows = vec![ordered.iter().map(|column| column.name.to_uppercase()).collect::<Vec<_>>()];
    rows.extend(objects.iter().map(|object| Pipeline::render_row(&ordered, object)));

    let widths = (0..ordered.len())
        .map(|index| {
            rows.iter()
                .map(|row| row[index].chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect::<Vec<_>>();

    let mut table = String::new();
    for row in rows {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        table.push_str(line.trim_end());
        table.push('\n');
    }
    table
}

pub fn render_properties(properties: &[DetailProperty]) -> String {
    fn walk(properties: &[DetailProperty], depth: usize, out: &mut String) {
        for property in properties {
            let indent = "  ".repeat(depth);
            match property {
                DetailProperty::Text { name, value } => {
                    out.push_str(&format!("{indent}{name}: {value}\n"))
                }
                DetailProperty::Group { name, children } => {
                    out.push_str(&format!("{indent}{name}:\n"));
                    walk(children, depth + 1, out);
                }
            }
        }
    }

    let mut out = String::new();
    walk(properties, 0, &mut out);
    out
}

/// Runs the edit workflow for one document, asking on `input` before an
/// update unless `assume_yes` is set.
pub async fn apply_text<R, W>(
    editor: &ObjectEditor,
    text: &str,
    assume_yes: bool,
    input: &mut R,
    out: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let pending = match editor.save(text).await? {
        SaveOutcome::Created(object) => {
            writeln!(out, "created {}", describe(&object))?;
            return Ok(());
        }
        SaveOutcome::Review(pending) => pending,
    };

    if !pending.diff().has_changes() {
        writeln!(out, "{} is unchanged", pending.key())?;
        pending.cancel();
        return Ok(());
    }

    write!(out, "{}", pending.diff())?;
    writeln!(out, "{}", pending.summary())?;
    if !assume_yes {
        write!(out, "Apply these changes? [y/N] ")?;
        out.flush()?;
        let mut answer = String::new();
        input.read_line(&mut answer).await?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            writeln!(out, "cancelled")?;
            pending.cancel();
            return Ok(());
        }
    }

    match pending.apply().await {
        Ok(object) => {
            info!(object = %describe(&object), "edit applied");
            writeln!(out, "updated {}", describe(&object))?;
            Ok(())
        }
        Err(error) => {
            if error.server_may_have_changed() {
                warn!("the server copy may differ from what you reviewed");
            }
            Err(error.into())
        }
    }
}

fn describe(object: &Object) -> String {
    format!(
        "{} (resourceVersion {})",
        crate::model::ObjectKey::of(object),
        object.resource_version().unwrap_or_default()
    )
}
