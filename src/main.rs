use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use planwright::capability::{CapabilityRegistry, Context};
use planwright::config::{Config, LlmProvider};
use planwright::execution::{Engine, ExecutionEvent};
use planwright::llm::{self, LlmClient};
use planwright::persistence::SqliteExecutionStore;
use planwright::planning::{parse_plan, parse_workflow, Planner};

#[derive(Parser)]
#[command(name = "planwright")]
#[command(about = "Run multi-step plans with approval gates, remediation and crash recovery", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan from a JSON file
    Run {
        /// File holding a JSON array of {"agentName", "arguments"} steps
        plan: PathBuf,
        /// Initial context as a JSON object
        #[arg(short, long)]
        context: Option<String>,
        /// Session the execution belongs to
        #[arg(long)]
        session: Option<String>,
    },
    /// Ask the reasoning backend for a plan and print it
    Plan {
        goal: String,
        #[arg(short, long)]
        context: Option<String>,
        /// Plan a dependency graph instead of an ordered list
        #[arg(long)]
        workflow: bool,
    },
    /// Plan a goal and run the resulting plan
    Execute {
        goal: String,
        #[arg(short, long)]
        context: Option<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Run a dependency graph from a JSON file, or planned from a goal
    Workflow {
        /// File holding a JSON array of {"id", "agentName", "arguments", "dependencies"} nodes
        #[arg(short, long, conflicts_with = "goal")]
        file: Option<PathBuf>,
        #[arg(short, long)]
        goal: Option<String>,
        #[arg(short, long)]
        context: Option<String>,
        /// Approve every approval-gated node up front
        #[arg(long)]
        approve: bool,
    },
    /// Approve the pending step of an execution and continue it
    Resume { execution_id: String },
    /// Show the status and results of an execution
    Status { execution_id: String },
    /// Cancel an execution waiting for approval
    Cancel { execution_id: String },
    /// List stored executions
    List,
    /// Mark executions interrupted by a crash as failed
    Recover,
    /// Configure planwright
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
        /// Set provider (anthropic, openai, ollama)
        #[arg(long)]
        provider: Option<String>,
        /// Set API key
        #[arg(long)]
        api_key: Option<String>,
        /// Set model
        #[arg(long)]
        model: Option<String>,
        /// Set the execution database path
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planwright=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config {
            show,
            provider,
            api_key,
            model,
            database,
        } => handle_config(show, provider, api_key, model, database),
        Commands::Plan {
            goal,
            context,
            workflow,
        } => plan_only(&goal, parse_context(context)?, workflow).await,
        command => {
            let config = Config::load()?;
            let engine = Arc::new(build_engine(&config, &command).await?);
            run_command(engine, command).await
        }
    }
}

async fn run_command(engine: Arc<Engine>, command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            plan,
            context,
            session,
        } => {
            let content = std::fs::read_to_string(&plan)
                .with_context(|| format!("Failed to read plan file {}", plan.display()))?;
            let steps = parse_plan(&content).context("Plan file is not a JSON array of steps")?;
            let id = engine
                .submit_plan(steps, parse_context(context)?, session)
                .await?;
            follow(&engine, &id).await
        }
        Commands::Execute {
            goal,
            context,
            session,
        } => {
            let id = engine
                .submit_goal(&goal, parse_context(context)?, session)
                .await?;
            follow(&engine, &id).await
        }
        Commands::Workflow {
            file,
            goal,
            context,
            approve: _,
        } => {
            let context = parse_context(context)?;
            let report = match (file, goal) {
                (Some(file), _) => {
                    let content = std::fs::read_to_string(&file).with_context(|| {
                        format!("Failed to read workflow file {}", file.display())
                    })?;
                    let nodes = parse_workflow(&content)
                        .context("Workflow file is not a JSON array of nodes")?;
                    engine.run_workflow(nodes, context).await?
                }
                (None, Some(goal)) => engine.run_goal_workflow(&goal, context).await?,
                (None, None) => anyhow::bail!("Provide --file or --goal"),
            };
            print_json(&report)
        }
        Commands::Resume { execution_id } => {
            let _printer = print_events(&engine);
            let resume = engine.resume(&execution_id);
            tokio::pin!(resume);
            let report = tokio::select! {
                report = &mut resume => report?,
                _ = tokio::signal::ctrl_c() => {
                    engine.cancel(&execution_id).await?;
                    resume.await?
                }
            };
            print_json(&report)
        }
        Commands::Status { execution_id } => print_json(&engine.report(&execution_id).await?),
        Commands::Cancel { execution_id } => {
            if engine.cancel(&execution_id).await? {
                println!("Cancelled {}", execution_id);
            } else {
                println!("Nothing to cancel: {} is unknown, running elsewhere or finished", execution_id);
            }
            Ok(())
        }
        Commands::List => {
            for state in engine.list().await? {
                println!(
                    "{}  {:<22}  step {}/{}  {}",
                    state.id,
                    state.status,
                    state.current_step_index,
                    state.plan_steps.len(),
                    state.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Commands::Recover => {
            // build_engine already swept once
            let recovered = engine.recover().await?;
            println!("{} execution(s) recovered", recovered.len());
            Ok(())
        }
        Commands::Plan { .. } | Commands::Config { .. } => {
            anyhow::bail!("command does not use the execution engine")
        }
    }
}

/// Stream events until the execution stops, cancelling on Ctrl-C
async fn follow(engine: &Arc<Engine>, execution_id: &str) -> Result<()> {
    let _printer = print_events(engine);
    let report = tokio::select! {
        report = engine.wait(execution_id) => report?,
        _ = tokio::signal::ctrl_c() => {
            engine.cancel(execution_id).await?;
            engine.wait(execution_id).await?
        }
    };
    print_json(&report)
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn print_events(engine: &Engine) -> AbortOnDrop {
    let mut events = engine.subscribe();
    AbortOnDrop(tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                ExecutionEvent::StepStarted {
                    step_index, agent, ..
                } => eprintln!("▶ step {} ({})", step_index, agent),
                ExecutionEvent::StepCompleted { result, .. } => {
                    eprintln!("✓ {}: {}", result.agent_name, result.summary)
                }
                ExecutionEvent::ApprovalRequired {
                    execution_id,
                    agent,
                    ..
                } => eprintln!(
                    "⏸ '{}' requires approval; run `planwright resume {}`",
                    agent, execution_id
                ),
                ExecutionEvent::RemediationApplied {
                    agent,
                    attempt,
                    justification,
                    ..
                } => eprintln!("↻ retrying {} (attempt {}): {}", agent, attempt, justification),
                ExecutionEvent::Failed { reason, .. } => eprintln!("✗ {}", reason),
                ExecutionEvent::Cancelled { execution_id } => {
                    eprintln!("✗ {} cancelled", execution_id)
                }
                _ => {}
            }
        }
    }))
}

async fn build_engine(config: &Config, command: &Commands) -> Result<Engine> {
    let db_path = config.persistence.resolved_database_path()?;
    let store = SqliteExecutionStore::open(&db_path).await?;
    let registry = Arc::new(CapabilityRegistry::with_builtins()?);

    let approve = matches!(command, Commands::Workflow { approve: true, .. });
    let mut builder = Engine::builder(registry, Arc::new(store))
        .config(config.execution.clone())
        .auto_approve_workflows(approve);
    match reasoning_client(config) {
        Ok(client) => builder = builder.llm(client),
        Err(e) => tracing::debug!(error = %e, "no reasoning backend; failures will not be remediated"),
    }

    let engine = builder.build();
    engine.recover().await?;
    Ok(engine)
}

fn reasoning_client(config: &Config) -> Result<Arc<dyn LlmClient>> {
    Ok(Arc::from(llm::create_client(config)?))
}

async fn plan_only(goal: &str, context: Context, workflow: bool) -> Result<()> {
    let config = Config::load()?;
    let registry = Arc::new(CapabilityRegistry::with_builtins()?);
    let planner = Planner::new(reasoning_client(&config)?, registry);

    if workflow {
        print_json(&planner.create_workflow(goal, &context).await?)
    } else {
        print_json(&planner.create_plan(goal, &context).await?)
    }
}

fn parse_context(raw: Option<String>) -> Result<Context> {
    match raw {
        None => Ok(Context::new()),
        Some(raw) => match serde_json::from_str(&raw).context("Context must be valid JSON")? {
            serde_json::Value::Object(map) => Ok(map),
            _ => anyhow::bail!("Context must be a JSON object"),
        },
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_config(
    show: bool,
    provider: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    database: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::load()?;

    if show {
        let mut shown = config.clone();
        if shown.llm.api_key.is_some() {
            shown.llm.api_key = Some("********".to_string());
        }
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&shown)?);
        return Ok(());
    }

    let mut changed = false;

    if let Some(p) = provider {
        config.llm.provider = match p.to_lowercase().as_str() {
            "anthropic" => LlmProvider::Anthropic,
            "openai" => LlmProvider::OpenAI,
            "ollama" => LlmProvider::Ollama,
            other => anyhow::bail!("Unknown provider '{}'", other),
        };
        changed = true;
        println!("Provider updated");
    }

    if let Some(key) = api_key {
        config.llm.api_key = Some(key);
        changed = true;
        println!("API key updated");
    }

    if let Some(m) = model {
        config.llm.model = m;
        changed = true;
        println!("Model updated");
    }

    if let Some(path) = database {
        config.persistence.database_path = Some(path);
        changed = true;
        println!("Database path updated");
    }

    if changed {
        config.save()?;
        println!("Configuration saved to: {:?}", Config::config_path()?);
    } else {
        println!("No changes made. Use --show to view current configuration.");
    }

    Ok(())
}
