use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use gatehouse_core::audit::{AuditFilter, OperationKind, Outcome};
use gatehouse_core::queue::{FinalizeOutcome, ItemFilter, NewTask, Priority, QueuePolicy, QueueSpec};
use gatehouse_core::validation::ValidationStep;
use gatehouse_core::{EnforcementMode, FileRequest, Gatehouse, GatehouseConfig};

mod render;

use render::Output;

/// Gatehouse - governed task queues and gated file operations
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON or TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Artifact root, overrides the configuration
    #[arg(long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// Enforcement mode, overrides the configuration
    #[arg(long, global = true)]
    mode: Option<EnforcementMode>,

    /// Output in JSON for integrations
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Task queue operations
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Entity registry operations
    #[command(subcommand)]
    Registry(RegistryCommand),

    /// Gated file operations
    #[command(subcommand)]
    Fs(FsCommand),

    /// Audit log inspection (needs `audit.log_path` to see earlier runs)
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Validate and enqueue an item
    Push {
        queue: String,
        kind: String,
        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long)]
        priority: Option<Priority>,
    },
    /// Check out the next item
    Pop {
        queue: String,
        /// Only items of this kind
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        min_priority: Option<Priority>,
    },
    /// Finalize the working item with a JSON result
    Finalize {
        queue: String,
        #[arg(long, default_value = "true")]
        result: String,
    },
    /// Show the head item without checking it out
    Peek { queue: String },
    /// Show one queue, or all of them
    Status { queue: Option<String> },
    /// Drop a pending or working item
    Remove { queue: String, id: String },
    /// Attach validation steps and a policy to a queue
    Configure {
        queue: String,
        #[arg(long = "before-insert", value_name = "STEP")]
        before_insert: Vec<String>,
        #[arg(long = "after-pop", value_name = "STEP")]
        after_pop: Vec<String>,
        #[arg(long)]
        default_priority: Option<Priority>,
        #[arg(long)]
        max_items: Option<usize>,
    },
    /// List registered validation steps
    Steps,
}

#[derive(Subcommand)]
enum RegistryCommand {
    /// Register a new entity
    Register {
        #[arg(value_name = "TYPE")]
        entity_type: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Look up an entity by type and name
    Find {
        #[arg(value_name = "TYPE")]
        entity_type: String,
        name: String,
    },
    /// Entities whose parent is `id`
    Children { id: String },
    /// All entities, optionally of one type
    List {
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: Option<String>,
    },
    /// Remove an entity without children
    Remove { id: String },
}

#[derive(Args)]
struct FileArgs {
    path: PathBuf,
    /// Inline content
    #[arg(long, conflicts_with = "from")]
    content: Option<String>,
    /// Read content from a local file
    #[arg(long, value_name = "FILE")]
    from: Option<PathBuf>,
    /// Declared artifact type
    #[arg(long = "type", value_name = "TYPE")]
    artifact_type: Option<String>,
    #[arg(long)]
    caller: Option<String>,
}

#[derive(Subcommand)]
enum FsCommand {
    /// Create a new file
    Create(FileArgs),
    /// Create or replace a file
    Write(FileArgs),
    /// Create a directory
    Mkdir {
        path: PathBuf,
        #[arg(long)]
        caller: Option<String>,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Show recorded events
    Log {
        /// e.g. write, push, register
        #[arg(long)]
        operation: Option<String>,
        /// success, violation or error
        #[arg(long)]
        outcome: Option<String>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Aggregate counters and suspicious patterns
    Stats,
    /// Check the hash chain
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let gh = Gatehouse::open(load_config(&cli)?).context("opening gatehouse")?;
    let out = Output::new(cli.json);

    match cli.command {
        Commands::Queue(cmd) => queue(&gh, &out, cmd).await,
        Commands::Registry(cmd) => registry(&gh, &out, cmd),
        Commands::Fs(cmd) => fs(&gh, &out, cmd).await,
        Commands::Audit(cmd) => audit(&gh, &out, cmd),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<GatehouseConfig> {
    let mut config = match &cli.config {
        Some(path) => GatehouseConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatehouseConfig::default(),
    }
    .apply_env_overrides()?;
    if let Some(root) = &cli.root {
        config = config.with_root(root);
    }
    if let Some(mode) = cli.mode {
        config = config.with_enforcement(mode);
    }
    tracing::debug!(
        root = %config.root.display(),
        mode = config.enforcement.mode.as_str(),
        "configuration loaded"
    );
    Ok(config)
}

fn parse_json(raw: &str, what: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))
}

/// Parse a snake_case enum name through its serde form
fn parse_name<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> anyhow::Result<T> {
    serde_json::from_value(Value::String(raw.to_ascii_lowercase()))
        .with_context(|| format!("unknown {what} '{raw}'"))
}

async fn queue(gh: &Gatehouse, out: &Output, cmd: QueueCommand) -> anyhow::Result<()> {
    let engine = gh.queues();
    match cmd {
        QueueCommand::Push {
            queue,
            kind,
            payload,
            priority,
        } => {
            let mut task = NewTask::new(kind, parse_json(&payload, "payload")?);
            task.priority = priority;
            let item = engine.push(&queue, task).await?;
            out.item("pushed", &item)
        }
        QueueCommand::Pop {
            queue,
            kind,
            min_priority,
        } => {
            let filter = ItemFilter { kind, min_priority };
            let item = engine.pop_where(&queue, |i| filter.matches(i)).await?;
            out.item("checked out", &item)
        }
        QueueCommand::Finalize { queue, result } => {
            let outcome = engine
                .finalize_working(&queue, parse_json(&result, "result")?)
                .await?;
            match &outcome {
                FinalizeOutcome::Completed(item) => out.value(
                    &json!({ "outcome": "completed", "item": item }),
                    || println!("completed {}", item.id),
                ),
                FinalizeOutcome::Requeued { item, failure } => out.value(
                    &json!({ "outcome": "requeued", "item": item, "failure": failure }),
                    || {
                        println!(
                            "requeued {} (attempt {}): step '{}' refused: {}",
                            item.id, item.attempts, failure.step, failure.reason
                        )
                    },
                ),
            }
        }
        QueueCommand::Peek { queue } => match engine.peek(&queue).await? {
            Some(item) => out.item("head", &item),
            None => out.value(&Value::Null, || println!("queue '{queue}' has no pending items")),
        },
        QueueCommand::Status { queue } => {
            let statuses = match queue {
                Some(name) => vec![engine.status(&name).await?],
                None => engine.status_all().await?,
            };
            out.value(&statuses, || {
                for s in &statuses {
                    render::status(s);
                }
            })
        }
        QueueCommand::Remove { queue, id } => {
            let item = engine.remove(&queue, &id).await?;
            out.item("removed", &item)
        }
        QueueCommand::Configure {
            queue,
            before_insert,
            after_pop,
            default_priority,
            max_items,
        } => {
            let spec = QueueSpec {
                before_insert: before_insert.into_iter().map(ValidationStep::new).collect(),
                after_pop: after_pop.into_iter().map(ValidationStep::new).collect(),
                policy: QueuePolicy {
                    default_priority: default_priority.unwrap_or_default(),
                    max_items,
                },
            };
            engine.configure_queue(&queue, spec.clone()).await?;
            out.value(&spec, || println!("configured queue '{queue}'"))
        }
        QueueCommand::Steps => {
            let steps = gh.steps();
            let listed: Vec<Value> = steps
                .names()
                .into_iter()
                .map(|name| json!({ "description": steps.description(&name), "name": name }))
                .collect();
            out.value(&listed, || {
                for step in &listed {
                    println!(
                        "{:<20} {}",
                        step["name"].as_str().unwrap_or_default(),
                        step["description"].as_str().unwrap_or_default()
                    );
                }
            })
        }
    }
}

fn registry(gh: &Gatehouse, out: &Output, cmd: RegistryCommand) -> anyhow::Result<()> {
    let reg = gh.registry();
    match cmd {
        RegistryCommand::Register {
            entity_type,
            name,
            description,
            parent,
        } => {
            let id = reg.register(&entity_type, &name, &description, parent.as_deref())?;
            out.value(&json!({ "id": id }), || println!("{id}"))
        }
        RegistryCommand::Find { entity_type, name } => match reg.find(&entity_type, &name)? {
            Some(entity) => out.value(&entity, || render::entity(&entity)),
            None => anyhow::bail!("no {entity_type} named '{name}'"),
        },
        RegistryCommand::Children { id } => {
            let children = reg.children_of(&id)?;
            out.value(&children, || children.iter().for_each(render::entity))
        }
        RegistryCommand::List { entity_type } => {
            let entities = reg.list(entity_type.as_deref())?;
            out.value(&entities, || entities.iter().for_each(render::entity))
        }
        RegistryCommand::Remove { id } => {
            let entity = reg.remove(&id)?;
            out.value(&entity, || println!("removed {} '{}'", entity.entity_type, entity.name))
        }
    }
}

async fn fs(gh: &Gatehouse, out: &Output, cmd: FsCommand) -> anyhow::Result<()> {
    let receipt = match cmd {
        FsCommand::Create(args) => gh.gate().create(file_request(args)?).await?,
        FsCommand::Write(args) => gh.gate().write(file_request(args)?).await?,
        FsCommand::Mkdir { path, caller } => {
            let mut request = FileRequest::new(path);
            request.caller = caller;
            gh.gate().mkdir(request).await?
        }
    };
    out.value(&receipt, || render::receipt(&receipt))
}

fn file_request(args: FileArgs) -> anyhow::Result<FileRequest> {
    let content = match (args.content, args.from) {
        (Some(inline), _) => inline.into_bytes(),
        (None, Some(path)) => std::fs::read(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => Vec::new(),
    };
    let mut request = FileRequest::new(args.path).content(content);
    request.declared_type = args.artifact_type;
    request.caller = args.caller;
    Ok(request)
}

fn audit(gh: &Gatehouse, out: &Output, cmd: AuditCommand) -> anyhow::Result<()> {
    let trail = gh.audit();
    match cmd {
        AuditCommand::Log {
            operation,
            outcome,
            target,
            limit,
        } => {
            let mut filter = AuditFilter::new();
            if let Some(op) = operation {
                filter = filter.operation(parse_name::<OperationKind>(&op, "operation")?);
            }
            if let Some(o) = outcome {
                filter = filter.outcome(parse_name::<Outcome>(&o, "outcome")?);
            }
            if let Some(prefix) = target {
                filter = filter.target_prefix(prefix);
            }
            if let Some(n) = limit {
                filter = filter.limit(n);
            }
            let events = trail.get_audit_log(&filter);
            out.value(&events, || events.iter().for_each(render::event))
        }
        AuditCommand::Stats => {
            let stats = trail.get_stats();
            out.value(&stats, || render::stats(&stats))
        }
        AuditCommand::Verify => {
            trail.verify_chain()?;
            out.value(&json!({ "verified": trail.len() }), || {
                println!("hash chain intact ({} events)", trail.len())
            })
        }
    }
}
