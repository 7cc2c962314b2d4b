use clap::{Args, Parser, Subcommand};
use colored::{ColoredString, Colorize};

use flow_state::{
    EnvironmentManager, EnvironmentStatus, LockInfo, LockOperation, OperationType,
    ProjectManager, ResourceStatus, ServiceStatus, StateConfig,
};

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Inspect and administer flow control-plane state", long_about = None)]
struct Cli {
    /// Backend descriptor (file://<path>, s3://<bucket>/<prefix>, flow://<account>)
    #[arg(long, env = "FLOW_BACKEND")]
    backend: Option<String>,

    /// Project name
    #[arg(long, short, env = "FLOW_PROJECT")]
    project: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List environments in the project
    Environments,
    /// List resources in an environment
    Resources {
        /// Environment name
        environment: String,
    },
    /// List services in an environment
    Services {
        /// Environment name
        environment: String,
    },
    /// Show a state record and who holds its lock
    Show {
        /// Environment name
        environment: String,

        #[command(flatten)]
        target: Target,
    },
    /// Remove a lock left behind by an interrupted run
    ForceUnlock {
        /// Environment name
        environment: String,

        #[command(flatten)]
        target: Target,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Delete an environment that has no resources or services left
    DeleteEnvironment {
        /// Environment name
        environment: String,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
}

/// Entity inside the environment; the environment itself when neither is given
#[derive(Args)]
#[group(multiple = false)]
struct Target {
    /// Resource name
    #[arg(long)]
    resource: Option<String>,

    /// Service name
    #[arg(long)]
    service: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let mut config = StateConfig::from_env();
    if let Some(backend) = cli.backend {
        config = config.with_backend(backend);
    }
    log::debug!("project {} on backend {}", cli.project, config.backend);

    let result = match ProjectManager::open(&config, &cli.project).await {
        Ok(project) => match cli.command {
            Commands::Environments => run_environments(&project).await,
            Commands::Resources { environment } => {
                run_resources(&project.environment(environment)).await
            }
            Commands::Services { environment } => {
                run_services(&project.environment(environment)).await
            }
            Commands::Show {
                environment,
                target,
            } => run_show(&project.environment(environment), &target).await,
            Commands::ForceUnlock {
                environment,
                target,
                auto_approve,
            } => run_force_unlock(&project.environment(environment), &target, auto_approve).await,
            Commands::DeleteEnvironment {
                environment,
                auto_approve,
            } => run_delete_environment(&project.environment(environment), auto_approve).await,
        },
        Err(e) => Err(e.to_string()),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_environments(project: &ProjectManager) -> Result<(), String> {
    let environments = project
        .list_environments()
        .await
        .map_err(|e| e.to_string())?;

    if environments.is_empty() {
        println!("{}", format!("No environments in {}.", project.name()).yellow());
        return Ok(());
    }

    println!("{}", format!("Environments in {}:", project.name()).cyan().bold());
    println!();
    for (name, state) in &environments {
        println!(
            "  {:<24} {:<14} {}",
            name.bold(),
            environment_status(state.status),
            state.environment_type
        );
    }
    Ok(())
}

async fn run_resources(environment: &EnvironmentManager) -> Result<(), String> {
    let resources = environment
        .list_resources()
        .await
        .map_err(|e| e.to_string())?;

    if resources.is_empty() {
        println!("{}", format!("No resources in {}.", environment.key()).yellow());
        return Ok(());
    }

    println!("{}", format!("Resources in {}:", environment.key()).cyan().bold());
    println!();
    for (name, state) in &resources {
        let depends_on = if state.depends_on.is_empty() {
            String::new()
        } else {
            format!("(after {})", state.depends_on.join(", "))
        };
        println!(
            "  {:<24} {:<28} {:<16} {}",
            name.bold(),
            state.product,
            resource_status(state.status),
            depends_on.dimmed()
        );
    }
    Ok(())
}

async fn run_services(environment: &EnvironmentManager) -> Result<(), String> {
    let services = environment
        .list_services()
        .await
        .map_err(|e| e.to_string())?;

    if services.is_empty() {
        println!("{}", format!("No services in {}.", environment.key()).yellow());
        return Ok(());
    }

    println!("{}", format!("Services in {}:", environment.key()).cyan().bold());
    println!();
    for (name, state) in &services {
        println!(
            "  {:<24} {:<28} {}",
            name.bold(),
            state.product,
            service_status(state.status)
        );
    }
    Ok(())
}

async fn run_show(environment: &EnvironmentManager, target: &Target) -> Result<(), String> {
    let (record, lock) = match (&target.resource, &target.service) {
        (Some(name), _) => {
            let resource = environment.resource(name);
            let state = resource.load().await.map_err(|e| e.to_string())?;
            (
                serde_json::to_string_pretty(&state),
                resource.lock_info().await,
            )
        }
        (None, Some(name)) => {
            let service = environment.service(name);
            let state = service.load().await.map_err(|e| e.to_string())?;
            (
                serde_json::to_string_pretty(&state),
                service.lock_info().await,
            )
        }
        (None, None) => {
            let state = environment.load().await.map_err(|e| e.to_string())?;
            (
                serde_json::to_string_pretty(&state),
                environment.lock_info().await,
            )
        }
    };

    println!("{}", record.map_err(|e| e.to_string())?);
    println!();
    match lock.map_err(|e| e.to_string())? {
        Some(info) => print_lock(&info),
        None => println!("{}", "Not locked.".green()),
    }
    Ok(())
}

async fn run_force_unlock(
    environment: &EnvironmentManager,
    target: &Target,
    auto_approve: bool,
) -> Result<(), String> {
    let (label, info) = match (&target.resource, &target.service) {
        (Some(name), _) => (
            format!("resource {}", name),
            environment.resource(name).lock_info().await,
        ),
        (None, Some(name)) => (
            format!("service {}", name),
            environment.service(name).lock_info().await,
        ),
        (None, None) => (
            format!("environment {}", environment.key()),
            environment.lock_info().await,
        ),
    };

    let Some(info) = info.map_err(|e| e.to_string())? else {
        println!("{}", format!("No lock held on {}.", label).green());
        return Ok(());
    };
    print_lock(&info);
    println!();

    if !auto_approve
        && !confirm(&format!(
            "Do you really want to force-unlock {}?",
            label
        ))?
    {
        println!("{}", "Force-unlock cancelled.".yellow());
        return Ok(());
    }

    let result = match (&target.resource, &target.service) {
        (Some(name), _) => environment.resource(name).force_unlock().await,
        (None, Some(name)) => environment.service(name).force_unlock().await,
        (None, None) => environment.force_unlock().await,
    };
    result.map_err(|e| e.to_string())?;

    println!("{}", format!("Unlocked {}.", label).green().bold());
    Ok(())
}

async fn run_delete_environment(
    environment: &EnvironmentManager,
    auto_approve: bool,
) -> Result<(), String> {
    environment.load().await.map_err(|e| e.to_string())?;

    if !auto_approve
        && !confirm(&format!(
            "Do you really want to delete environment {}?",
            environment.key()
        ))?
    {
        println!("{}", "Delete cancelled.".yellow());
        return Ok(());
    }

    let guard = environment
        .lock(LockOperation::new(OperationType::DeleteEnvironment))
        .acquire()
        .await
        .map_err(|e| e.to_string())?;

    let result = delete_if_empty(environment, guard.lock_id()).await;
    guard.release().await.map_err(|e| e.to_string())?;
    result?;

    println!(
        "{}",
        format!("Deleted environment {}.", environment.key())
            .green()
            .bold()
    );
    Ok(())
}

async fn delete_if_empty(environment: &EnvironmentManager, lock_id: &str) -> Result<(), String> {
    let resources = environment
        .list_resources()
        .await
        .map_err(|e| e.to_string())?;
    let services = environment
        .list_services()
        .await
        .map_err(|e| e.to_string())?;
    if !resources.is_empty() || !services.is_empty() {
        return Err(format!(
            "{} still has {} resource(s) and {} service(s); destroy them first",
            environment.key(),
            resources.len(),
            services.len()
        ));
    }

    let mut state = environment.load().await.map_err(|e| e.to_string())?;
    state.transition(EnvironmentStatus::Deleting);
    environment
        .save(&state, lock_id)
        .await
        .map_err(|e| e.to_string())?;
    environment.delete(lock_id).await.map_err(|e| e.to_string())
}

fn confirm(question: &str) -> Result<bool, String> {
    println!("{}", question.yellow().bold());
    println!(
        "  {}",
        "This action cannot be undone. Type 'yes' to confirm.".yellow()
    );
    print!("\n  Enter a value: ");
    std::io::Write::flush(&mut std::io::stdout()).map_err(|e| e.to_string())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| e.to_string())?;
    println!();
    Ok(input.trim() == "yes")
}

fn print_lock(info: &LockInfo) {
    println!(
        "{} {} by {} since {}",
        "Locked:".red().bold(),
        info.lock_operation.operation_type,
        info.who,
        info.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  lock id: {}", info.lock_id);
}

fn environment_status(status: EnvironmentStatus) -> ColoredString {
    let text = status_text(serde_json::to_string(&status));
    if status.is_failed() {
        text.red()
    } else if status.is_active() {
        text.yellow()
    } else {
        text.green()
    }
}

fn resource_status(status: ResourceStatus) -> ColoredString {
    let text = status_text(serde_json::to_string(&status));
    if status.is_failed() {
        text.red()
    } else if status.is_active() {
        text.yellow()
    } else {
        text.green()
    }
}

fn service_status(status: ServiceStatus) -> ColoredString {
    let text = status_text(serde_json::to_string(&status));
    if status.is_failed() {
        text.red()
    } else if status.is_active() {
        text.yellow()
    } else {
        text.green()
    }
}

/// Status as persisted (`create_failed`, ...)
fn status_text(json: serde_json::Result<String>) -> String {
    json.map(|s| s.trim_matches('"').to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_matches_persisted_form() {
        assert_eq!(
            status_text(serde_json::to_string(&ResourceStatus::DeleteFailed)),
            "delete_failed"
        );
        assert_eq!(
            status_text(serde_json::to_string(&EnvironmentStatus::Ready)),
            "ready"
        );
    }

    #[test]
    fn test_cli_parses_target() {
        let cli = Cli::try_parse_from([
            "flow",
            "--project",
            "acme",
            "show",
            "dev",
            "--resource",
            "bucket",
        ])
        .unwrap();
        assert_eq!(cli.project, "acme");
        match cli.command {
            Commands::Show {
                environment,
                target,
            } => {
                assert_eq!(environment, "dev");
                assert_eq!(target.resource.as_deref(), Some("bucket"));
                assert!(target.service.is_none());
            }
            _ => panic!("expected show"),
        }
    }

    #[test]
    fn test_cli_rejects_resource_and_service_together() {
        let result = Cli::try_parse_from([
            "flow",
            "--project",
            "acme",
            "force-unlock",
            "dev",
            "--resource",
            "a",
            "--service",
            "b",
        ]);
        assert!(result.is_err());
    }
}
