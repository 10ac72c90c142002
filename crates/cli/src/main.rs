use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arbor_apply::{Manager, OnError, Options, Slot};
use arbor_kubehub::{gvk_key_of, KubeClient, ResourceClient};
use arbor_ops::{Callbacks, DeleteOptions, GenericOperator, LinkedItemsOperator, Operator, DEFAULT_OWNER_KIND};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kube::{api::PropagationPolicy, core::DynamicObject, Client};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "arborctl", version, about = "Apply a parent resource and the children it owns")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: manifest namespace, then current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Cancel the run after this many seconds
    #[arg(long = "timeout-secs", env = "ARBOR_TIMEOUT_SECS", global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply the parent manifest, then its children with owner references
    Apply {
        /// Parent manifest (multi-document YAML)
        #[arg(long = "parent")]
        parent: PathBuf,
        /// Children linked to the parent by an ownerID label (stale ones are removed)
        #[arg(long = "linked")]
        linked: Vec<PathBuf>,
        /// Plain children that only receive owner references
        #[arg(long = "child")]
        children: Vec<PathBuf>,
        /// Kind of the owner linked children attach to
        #[arg(long = "owner-kind", default_value = DEFAULT_OWNER_KIND)]
        owner_kind: String,
        /// Validate server-side without persisting
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Do not hand owner references to the children
        #[arg(long = "no-owner-refs", action = ArgAction::SetTrue)]
        no_owner_refs: bool,
        /// Delete the parents again if anything fails
        #[arg(long = "purge-on-error", action = ArgAction::SetTrue)]
        purge_on_error: bool,
    },
    /// Delete the parent manifest's objects (children go with foreground cascade)
    Delete {
        #[arg(long = "parent")]
        parent: PathBuf,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Show whether each manifest object exists and who owns it
    Status {
        #[arg(long = "file")]
        file: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("ARBOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ARBOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ARBOR_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `ctx` on Ctrl-C or once the optional timeout elapses.
fn spawn_cancel_watchers(ctx: &CancellationToken, timeout_secs: Option<u64>) {
    let on_signal = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            on_signal.cancel();
        }
    });
    if let Some(secs) = timeout_secs {
        let on_timeout = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(secs, "timeout reached; cancelling");
            on_timeout.cancel();
        });
    }
}

fn parse_manifests(text: &str) -> Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let v = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", idx))?;
        if v.is_null() {
            continue;
        }
        let obj: DynamicObject = serde_yaml::from_value(v).with_context(|| format!("reading object from document {}", idx))?;
        if obj.metadata.name.is_none() {
            return Err(anyhow!("document {} missing metadata.name", idx));
        }
        out.push(obj);
    }
    Ok(out)
}

fn load_manifests(path: &Path) -> Result<Vec<DynamicObject>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_manifests(&text).with_context(|| format!("loading {}", path.display()))
}

/// Group objects by `group/version/kind`, keeping first-seen order.
fn group_by_kind(objs: Vec<DynamicObject>) -> Result<Vec<(String, Vec<DynamicObject>)>> {
    let mut groups: Vec<(String, Vec<DynamicObject>)> = Vec::new();
    for obj in objs {
        let key = gvk_key_of(&obj)?;
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, items)) => items.push(obj),
            None => groups.push((key, vec![obj])),
        }
    }
    Ok(groups)
}

/// Group documents from several files at once: one group per kind. Linked operators
/// sharing an owner and a kind would wipe each other's items.
fn group_across_files(files: Vec<Vec<DynamicObject>>) -> Result<Vec<(String, Vec<DynamicObject>)>> {
    group_by_kind(files.into_iter().flatten().collect())
}

async fn resource_client(client: &Client, gvk: &str, ns: Option<&str>, items: &[DynamicObject]) -> Result<Arc<dyn ResourceClient>> {
    let ns = ns.or_else(|| items.first().and_then(|o| o.metadata.namespace.as_deref()));
    let rc = KubeClient::discover(client.clone(), gvk, ns).await?;
    Ok(Arc::new(rc))
}

async fn generic_operators(client: &Client, ns: Option<&str>, objs: Vec<DynamicObject>) -> Result<Vec<Slot>> {
    let mut out: Vec<Slot> = Vec::new();
    for (gvk, items) in group_by_kind(objs)? {
        let rc = resource_client(client, &gvk, ns, &items).await?;
        out.push(Some(Box::new(GenericOperator::new(rc, items))));
    }
    Ok(out)
}

/// Print each status entry as it is produced.
fn reporting_callbacks(output: Output) -> Callbacks {
    Callbacks::new()
        .on_pre(|obj| {
            debug!(name = ?obj.metadata.name, "about to process");
            Ok(())
        })
        .on_post(move |entry, err| {
            match output {
                Output::Human => match err {
                    Some(e) => println!("{}  ({})", entry, e),
                    None => println!("{}", entry),
                },
                Output::Json => println!("{}", serde_json::to_string(entry)?),
            }
            Ok(())
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ctx = CancellationToken::new();
    spawn_cancel_watchers(&ctx, cli.timeout_secs);
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Apply { parent, linked, children, owner_kind, dry_run, no_owner_refs, purge_on_error } => {
            let client = Client::try_default().await?;
            let parents = generic_operators(&client, ns, load_manifests(&parent)?).await?;
            let mut kids: Vec<Slot> = Vec::new();
            let linked_docs = linked.iter().map(|p| load_manifests(p.as_path())).collect::<Result<Vec<_>>>()?;
            for (gvk, items) in group_across_files(linked_docs)? {
                let rc = resource_client(&client, &gvk, ns, &items).await?;
                kids.push(Some(Box::new(LinkedItemsOperator::new(rc, items).with_owner_kind(owner_kind.clone()))));
            }
            for path in &children {
                kids.extend(generic_operators(&client, ns, load_manifests(path)?).await?);
            }

            // Children hang off the first parent kind; further parent kinds are applied on their own.
            let mut manager = Manager::default();
            let mut parents = parents.into_iter();
            if let Some(first) = parents.next() {
                manager.push(first, kids);
            }
            for rest in parents {
                manager.push(rest, Vec::new());
            }

            let options = Options {
                dry_run,
                set_owner_references: !no_owner_refs,
                on_error: if purge_on_error { OnError::PurgeOnError } else { OnError::StopOnError },
                callbacks: reporting_callbacks(cli.output),
            };
            info!(parent = %parent.display(), linked = linked.len(), children = children.len(), dry_run, "apply invoked");
            manager.run(&ctx, &options).await?;
        }
        Commands::Delete { parent, dry_run } => {
            let client = Client::try_default().await?;
            let opts = DeleteOptions {
                propagation: Some(PropagationPolicy::Foreground),
                options: arbor_ops::Options { dry_run: arbor_core::dry_run_flags(dry_run), callbacks: reporting_callbacks(cli.output) },
            };
            info!(parent = %parent.display(), dry_run, "delete invoked");
            for mut opr in generic_operators(&client, ns, load_manifests(&parent)?).await?.into_iter().flatten() {
                opr.delete(&ctx, &opts).await?;
            }
        }
        Commands::Status { file } => {
            let client = Client::try_default().await?;
            for (gvk, items) in group_by_kind(load_manifests(&file)?)? {
                let rc = resource_client(&client, &gvk, ns, &items).await?;
                for item in &items {
                    let name = item.metadata.name.clone().unwrap_or_default();
                    let live = rc.get(&name).await?;
                    let owners: Vec<String> = live
                        .as_ref()
                        .and_then(|o| o.metadata.owner_references.as_ref())
                        .map(|refs| refs.iter().map(|r| format!("{}/{}", r.kind, r.name)).collect())
                        .unwrap_or_default();
                    match cli.output {
                        Output::Human => {
                            let state = if live.is_some() { "present" } else { "absent" };
                            let owners = if owners.is_empty() { "-".to_string() } else { owners.join(",") };
                            println!("{:<8} {} {:<30} owners={}", state, gvk, name, owners);
                        }
                        Output::Json => {
                            let row = serde_json::json!({ "gvk": gvk, "name": name, "present": live.is_some(), "owners": owners });
                            println!("{}", serde_json::to_string(&row)?);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
