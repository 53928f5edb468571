use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use korral_api::{InProcApi, KorralApi, NodeKind, NodeSummary, ReorderOp, Settings};
use korral_core::NodeId;
use korral_deploy::TaskState;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "korralctl", version, about = "Korral CLI: edit a resource repository and deploy it")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Repository root directory
    #[arg(long = "repo", global = true, env = "KORRAL_REPO")]
    repo: Option<PathBuf>,

    /// Namespace for resources that name none
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Move { Top, Bottom, Up, Down, Restore }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create (or open) a repository root and print its id
    Init {
        dir: PathBuf,
    },
    /// Print the collection tree with node ids
    Tree {
        /// Start at this node instead of the roots
        id: Option<String>,
    },
    /// Add a child collection
    AddCollection {
        parent: String,
        name: String,
    },
    /// Add a resource; without --file a template for a built-in kind is written
    AddResource {
        collection: String,
        name: String,
        /// apiVer key, e.g. "v1/configmaps" or "apps/v1/deployments"
        #[arg(long = "api")]
        api_ver: String,
        /// YAML document to store
        #[arg(long = "file")]
        file: Option<PathBuf>,
    },
    /// Set a collection property (e.g. namespace)
    Set {
        collection: String,
        key: String,
        value: String,
    },
    /// Remove a collection or resource from disk and the tree
    Rm {
        id: String,
    },
    /// Re-read a node from disk
    Reload {
        id: String,
    },
    /// Move a resource within its collection
    Reorder {
        collection: String,
        #[arg(value_enum)]
        op: Move,
        /// Resource to move (not needed for restore)
        id: Option<String>,
    },
    /// Deploy a collection or resource to the current cluster
    Deploy {
        id: String,
    },
    /// Delete everything a deploy record tracks from the cluster
    Undeploy {
        id: String,
    },
    /// List deploy records for the current cluster
    Deploys,
    /// List API kinds served by the cluster
    Kinds {
        /// Bypass the discovery cache
        #[arg(long = "refresh", action = ArgAction::SetTrue)]
        refresh: bool,
        /// Only list the built-in kinds; no cluster needed
        #[arg(long = "builtin", action = ArgAction::SetTrue)]
        builtin: bool,
    },
}

impl Commands {
    fn needs_cluster(&self) -> bool {
        match self {
            Commands::Deploy { .. } | Commands::Undeploy { .. } | Commands::Deploys => true,
            Commands::Kinds { builtin, .. } => !builtin,
            _ => false,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KORRAL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        tracing::warn!(addr = %addr, "invalid KORRAL_METRICS_ADDR; expected host:port");
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_tree(api: &dyn KorralApi, node: &NodeSummary, depth: usize) -> Result<()> {
    let pad = "  ".repeat(depth);
    println!("{}{}/  [{}]", pad, node.name, node.id);
    for rid in &node.resources {
        let r = api.node(rid)?;
        println!("{}  {:>3} {} ({})  [{}]", pad, r.order.unwrap_or(0), r.name, r.api_ver.as_deref().unwrap_or("-"), r.id);
    }
    for cid in &node.children {
        print_tree(api, &api.node(cid)?, depth + 1)?;
    }
    Ok(())
}

fn reorder_op(op: Move, id: Option<String>) -> Result<ReorderOp> {
    if op == Move::Restore {
        return Ok(ReorderOp::RestoreOriginal);
    }
    let id = NodeId::from(id.ok_or_else(|| anyhow!("reorder {:?} needs a resource id", op))?);
    Ok(match op {
        Move::Top => ReorderOp::ToTop(id),
        Move::Bottom => ReorderOp::ToBottom(id),
        Move::Up => ReorderOp::Up(id),
        Move::Down => ReorderOp::Down(id),
        Move::Restore => ReorderOp::RestoreOriginal,
    })
}

/// Wait for a background task and report its last event.
async fn finish_task(api: &InProcApi, task: u64, output: Output) -> Result<()> {
    let res = api.wait(task).await;
    let last = api.tasks().into_iter().find(|e| e.task == task);
    match (&res, output) {
        (Ok(outcome), Output::Json) => print_json(outcome)?,
        (Ok(outcome), Output::Human) => println!("task {}: {} applied", task, outcome.applied),
        (Err(e), _) => {
            error!(task, error = %e, "task failed");
            if let Some(ev) = last.filter(|ev| ev.state == TaskState::Failed) {
                eprintln!("task {}: {}", task, ev.status);
            }
        }
    }
    res.map(|_| ()).map_err(|e| anyhow!(e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    init_metrics(settings.metrics_addr.as_deref());
    if let Some(repo) = cli.repo.clone() { settings = settings.with_repo(repo); }
    if let Some(ns) = cli.namespace.clone() { settings.default_namespace = ns; }
    if let Commands::Init { dir } = &cli.command { settings.repo = Some(dir.clone()); }

    let api = if cli.command.needs_cluster() {
        InProcApi::connect(settings).await?
    } else {
        InProcApi::offline(settings)?
    };
    info!(command = ?cli.command, "korralctl");

    match cli.command {
        Commands::Init { .. } => {
            let roots = api.roots()?;
            let root = roots.first().ok_or_else(|| anyhow!("repository has no root"))?;
            match cli.output {
                Output::Human => println!("{}  {}", root.id, root.path.display()),
                Output::Json => print_json(root)?,
            }
        }
        Commands::Tree { id } => {
            let start = match id {
                Some(id) => vec![api.node(&NodeId::from(id))?],
                None => api.roots()?,
            };
            match cli.output {
                Output::Json => print_json(&start)?,
                Output::Human => {
                    for node in &start {
                        if node.kind == NodeKind::Collection {
                            print_tree(&api, node, 0)?;
                        } else {
                            println!("{} ({})  [{}]", node.name, node.api_ver.as_deref().unwrap_or("-"), node.id);
                        }
                    }
                }
            }
        }
        Commands::AddCollection { parent, name } => println!("{}", api.add_collection(&NodeId::from(parent), &name)?),
        Commands::AddResource { collection, name, api_ver, file } => {
            let cr = match file {
                Some(path) => Some(std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?),
                None => None,
            };
            println!("{}", api.add_resource(&NodeId::from(collection), &name, &api_ver, cr)?);
        }
        Commands::Set { collection, key, value } => api.set_property(&NodeId::from(collection), &key, &value)?,
        Commands::Rm { id } => api.remove(&NodeId::from(id))?,
        Commands::Reload { id } => println!("{}", api.reload(&NodeId::from(id))?),
        Commands::Reorder { collection, op, id } => {
            let changed = api.reorder(&NodeId::from(collection), reorder_op(op, id)?)?;
            if !changed { println!("order unchanged"); }
        }
        Commands::Deploy { id } => {
            let task = api.deploy(&NodeId::from(id))?;
            finish_task(&api, task, cli.output).await?;
        }
        Commands::Undeploy { id } => {
            let task = api.undeploy(&NodeId::from(id))?;
            finish_task(&api, task, cli.output).await?;
        }
        Commands::Deploys => {
            let records = api.deploys()?;
            match cli.output {
                Output::Json => print_json(&records)?,
                Output::Human => {
                    println!("{:<38} {:<20} {:<16} {:<10} {:>5}  CREATED", "ID", "NAME", "NAMESPACE", "STATUS", "CRS");
                    for d in records {
                        let status = if d.orphaned { "orphaned".to_string() } else { format!("{:?}", d.status) };
                        println!(
                            "{:<38} {:<20} {:<16} {:<10} {:>5}  {}",
                            d.id.as_str(),
                            d.name,
                            d.namespace,
                            status,
                            d.tracked,
                            d.creation.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
            }
        }
        Commands::Kinds { refresh, builtin } => {
            if builtin {
                let kinds = korral_schema::builtin_kinds();
                match cli.output {
                    Output::Json => print_json(&kinds)?,
                    Output::Human => {
                        for k in kinds {
                            println!("{} • {} • {}", k.api_ver, k.kind, if k.namespaced { "namespaced" } else { "cluster" });
                        }
                    }
                }
            } else {
                let kinds = api.kinds(refresh).await?;
                match cli.output {
                    Output::Json => print_json(&kinds)?,
                    Output::Human => {
                        for k in kinds {
                            println!("{} • {} • {}", k.api_ver(), k.kind, if k.namespaced { "namespaced" } else { "cluster" });
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
