//! Taskflow CLI: import templates, then run and steer workflows.
//!
//! Every command opens the SQLite database, builds the shared `AppState`
//! from taskflow-core and calls into the same engine a scheduler would use.

use clap::{Parser, Subcommand};

use taskflow_cli::commands;

/// Taskflow CLI: workflow orchestration engine
#[derive(Parser)]
#[command(name = "taskflow", version, about = "Taskflow CLI — Workflow orchestration engine")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "TASKFLOW_DB_PATH", default_value = "taskflow.db")]
    db: String,

    /// Agent kinds answered by the built-in echo agent (comma-separated)
    #[arg(long, env = "TASKFLOW_ECHO_AGENTS", value_delimiter = ',', default_value = "echo")]
    echo_agents: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage workflow templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Create, run and control workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Decide on HUMAN_APPROVAL steps
    Step {
        #[command(subcommand)]
        action: StepAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Import (or replace by name) a template from a YAML file
    Import {
        /// Path to the template YAML file
        file: String,
        /// Recorded as the template's creator
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Validate a template YAML file without storing it
    Validate {
        /// Path to the template YAML file
        file: String,
    },
    /// List templates
    List {
        /// Include deactivated templates
        #[arg(long)]
        all: bool,
    },
    /// Show a template by ID or name
    Get {
        /// Template ID or name
        template: String,
    },
    /// Allow new workflows to be created from a template
    Activate {
        /// Template ID
        id: String,
    },
    /// Stop new workflows being created from a template
    Deactivate {
        /// Template ID
        id: String,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Create a PENDING workflow from a template
    Create {
        /// Template ID or name
        #[arg(long)]
        template: String,
        /// Who is creating the workflow
        #[arg(long, env = "USER", default_value = "cli")]
        actor: String,
        /// Workflow input as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
        /// Scheduling priority (lower runs first)
        #[arg(long)]
        priority: Option<i32>,
        /// Execute the workflow straight away
        #[arg(long)]
        run: bool,
    },
    /// Execute a PENDING, PAUSED or FAILED workflow
    Run {
        /// Workflow ID
        id: String,
        /// Replace the workflow input (JSON object)
        #[arg(long)]
        input: Option<String>,
    },
    /// Pick up a RUNNING workflow after an approval or resume
    Continue {
        /// Workflow ID
        id: String,
    },
    /// Pause a running workflow before its next step
    Pause {
        /// Workflow ID
        id: String,
    },
    /// Resume a paused workflow and continue it
    Resume {
        /// Workflow ID
        id: String,
        /// Only flip the status; do not run the remaining steps
        #[arg(long)]
        no_continue: bool,
    },
    /// Cancel a workflow
    Cancel {
        /// Workflow ID
        id: String,
    },
    /// Show a workflow and its steps
    Status {
        /// Workflow ID
        id: String,
    },
    /// List workflows
    List {
        /// Filter by status: PENDING, RUNNING, PAUSED, COMPLETED, FAILED, CANCELLED
        #[arg(long)]
        status: Option<String>,
        /// Filter by workflow type (e.g. BUG_LIFECYCLE)
        #[arg(long)]
        workflow_type: Option<String>,
        /// Maximum number of workflows to show
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Execute PENDING workflows by priority, concurrently
    RunPending {
        /// Maximum number of workflows to start
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum StepAction {
    /// Approve a step awaiting human approval
    Approve {
        /// Workflow ID
        #[arg(long)]
        workflow: String,
        /// Step ID or name
        #[arg(long)]
        step: String,
        /// Who approves
        #[arg(long, env = "USER", default_value = "cli")]
        actor: String,
        /// Continue the workflow after approving
        #[arg(long = "continue")]
        and_continue: bool,
    },
    /// Reject a step awaiting human approval (fails the workflow)
    Reject {
        /// Workflow ID
        #[arg(long)]
        workflow: String,
        /// Step ID or name
        #[arg(long)]
        step: String,
        /// Who rejects
        #[arg(long, env = "USER", default_value = "cli")]
        actor: String,
        /// Reason recorded on the step and the workflow
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskflow_core=info,taskflow_cli=info".into()),
        )
        .init();

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        return;
    };

    // Validation needs no database.
    if let Commands::Template {
        action: TemplateAction::Validate { file },
    } = &command
    {
        exit_on_error(commands::template::validate(file));
        return;
    }

    let state = commands::init_state(&cli.db, &cli.echo_agents);

    let result = match command {
        Commands::Template { action } => match action {
            TemplateAction::Import { file, created_by } => {
                commands::template::import(&state, &file, created_by.as_deref()).await
            }
            TemplateAction::Validate { file } => commands::template::validate(&file),
            TemplateAction::List { all } => commands::template::list(&state, !all).await,
            TemplateAction::Get { template } => commands::template::get(&state, &template).await,
            TemplateAction::Activate { id } => {
                commands::template::set_active(&state, &id, true).await
            }
            TemplateAction::Deactivate { id } => {
                commands::template::set_active(&state, &id, false).await
            }
        },

        Commands::Workflow { action } => match action {
            WorkflowAction::Create {
                template,
                actor,
                input,
                priority,
                run,
            } => {
                commands::workflow::create(&state, &template, &actor, &input, priority, run).await
            }
            WorkflowAction::Run { id, input } => {
                commands::workflow::run(&state, &id, input.as_deref()).await
            }
            WorkflowAction::Continue { id } => commands::workflow::continue_run(&state, &id).await,
            WorkflowAction::Pause { id } => commands::workflow::pause(&state, &id).await,
            WorkflowAction::Resume { id, no_continue } => {
                commands::workflow::resume(&state, &id, !no_continue).await
            }
            WorkflowAction::Cancel { id } => commands::workflow::cancel(&state, &id).await,
            WorkflowAction::Status { id } => commands::workflow::status(&state, &id).await,
            WorkflowAction::List {
                status,
                workflow_type,
                limit,
            } => {
                commands::workflow::list(&state, status.as_deref(), workflow_type.as_deref(), limit)
                    .await
            }
            WorkflowAction::RunPending { limit } => {
                commands::workflow::run_pending(&state, limit).await
            }
        },

        Commands::Step { action } => match action {
            StepAction::Approve {
                workflow,
                step,
                actor,
                and_continue,
            } => commands::step::approve(&state, &workflow, &step, &actor, and_continue).await,
            StepAction::Reject {
                workflow,
                step,
                actor,
                reason,
            } => {
                commands::step::reject(&state, &workflow, &step, &actor, reason.as_deref()).await
            }
        },
    };

    exit_on_error(result);
}

fn exit_on_error(result: Result<(), String>) {
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
