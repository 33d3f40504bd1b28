use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::PathBuf;
use subtrack::{render, ClientContext};
use subtrack_core::{
    telemetry, ClientError, NewSubmission, SessionEvent, Settings, SubmissionFilter, SyncNotice,
};
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "subtrack", version, about = "Track judge submissions from the terminal")]
struct Cli {
    /// Read settings from this file instead of the default locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the credential.
    Login {
        username: String,
        /// Falls back to SUBTRACK_PASSWORD.
        #[arg(long)]
        password: Option<String>,
    },
    Logout,
    /// List submissions.
    List {
        #[arg(long)]
        problem: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Show one submission.
    Show {
        id: String,
        /// Include the status transition log.
        #[arg(long)]
        logs: bool,
    },
    /// Submit source code for a problem.
    Submit {
        problem: String,
        language: String,
        file: PathBuf,
        /// Follow the new submission until it finishes.
        #[arg(long)]
        watch: bool,
    },
    /// Follow submissions until they reach a final status.
    Watch {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List problems, or show one.
    Problems { id: Option<String> },
}

fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::env_filter("warn"))?;
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_path(path),
        None => Settings::load(),
    }
    .map_err(|err| anyhow!(err.user_message()))?;

    let runtime = Runtime::new()?;
    let context = ClientContext::from_settings(settings)?;
    runtime.block_on(run(cli.command, context))
}

async fn run(command: Command, context: ClientContext) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => env::var("SUBTRACK_PASSWORD")
                    .context("pass --password or set SUBTRACK_PASSWORD")?,
            };
            let user = context
                .api
                .login(&username, &password)
                .await
                .map_err(explain)?;
            println!("Signed in as {}", user.username);
        }
        Command::Logout => {
            context.api.logout();
            println!("Signed out");
        }
        Command::List {
            problem,
            user,
            status,
            limit,
            offset,
        } => {
            let filter = SubmissionFilter {
                problem_id: problem,
                user_id: user,
                status,
                limit: Some(limit),
                offset,
            };
            let page = context.api.list_submissions(&filter).await.map_err(explain)?;
            println!("{}", render::page(&page));
        }
        Command::Show { id, logs } => {
            let submission = context.api.get_submission(&id).await.map_err(explain)?;
            println!("{}", render::submission_detail(&submission));
            if logs {
                let entries = context.api.status_logs(&id).await.map_err(explain)?;
                println!("{}", render::logs(&entries));
            }
        }
        Command::Submit {
            problem,
            language,
            file,
            watch,
        } => {
            let code = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let created = context
                .api
                .create_submission(&NewSubmission {
                    problem_id: problem,
                    language,
                    code,
                })
                .await
                .map_err(explain)?;
            println!("{}", render::submission_line(&created));
            if watch {
                watch_jobs(&context, vec![created.id]).await?;
            }
        }
        Command::Watch { ids } => watch_jobs(&context, ids).await?,
        Command::Problems { id: Some(id) } => {
            let problem = context.api.get_problem(&id).await.map_err(explain)?;
            println!("{}", render::problems(std::slice::from_ref(&problem)));
            if let Some(description) = &problem.description {
                println!("\n{description}");
            }
        }
        Command::Problems { id: None } => {
            let problems = context.api.list_problems().await.map_err(explain)?;
            println!("{}", render::problems(&problems));
        }
    }
    Ok(())
}

async fn watch_jobs(context: &ClientContext, ids: Vec<String>) -> Result<()> {
    if !context.is_signed_in() {
        bail!("Not signed in. Run `subtrack login` first.");
    }
    let (sync, mut notices) = context.synchronizer()?;
    let mut session = context.session.subscribe();
    let mut pending: HashSet<String> = ids.iter().cloned().collect();
    for id in &ids {
        sync.track(id);
    }
    info!(jobs = ids.len(), "watching");

    while !pending.is_empty() {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                if let Some(line) = render::notice(&notice) {
                    println!("{line}");
                }
                if let SyncNotice::Stopped { job_id } = &notice {
                    pending.remove(job_id);
                }
            }
            event = session.recv() => {
                if let Ok(SessionEvent::Invalidated { reason }) = event {
                    sync.shutdown();
                    bail!("Session ended ({reason}). Run `subtrack login` again.");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                sync.shutdown();
                break;
            }
        }
    }
    Ok(())
}

fn explain(err: ClientError) -> anyhow::Error {
    let message = err.user_message();
    anyhow!(err).context(message.to_string())
}
