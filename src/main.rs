mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use reelforge::core::config::Config;
use reelforge::core::models::ProjectStatus;
use reelforge::services::editing::ProjectEditor;
use reelforge::services::workflow::WorkflowManager;
use reelforge::services::Services;
use tokio::task::JoinHandle;

async fn wait(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle.await?
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match Config::load_from(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return Err(e);
        }
    };
    let svc = Services::from_config(config)?;
    let editor = ProjectEditor::new(svc.clone());
    let manager = WorkflowManager::new(svc.clone());
    let owner = cli.owner.as_str();

    match cli.command {
        Commands::Create { name, prompt } => {
            let project = editor.create(owner, &name, &prompt).await?;
            println!("{}", project.id);
        }
        Commands::List => {
            for project in editor.list(owner).await? {
                println!("{}\t{}\t{}", project.id, project.status, project.name);
            }
        }
        Commands::Upload {
            project,
            file,
            description,
        } => {
            let uploaded = editor.upload_file(&project, owner, &file, &description).await?;
            println!("{}", uploaded.path);
        }
        Commands::Step { project, step } => {
            editor.ensure_owner(&project, owner).await?;
            let status = manager.spawn_step(&project, step).await??;
            report(&manager, &project, status).await?;
        }
        Commands::Run { project } => {
            editor.ensure_owner(&project, owner).await?;
            let status = manager.run_all(&project).await?;
            report(&manager, &project, status).await?;
        }
        Commands::Show { project } => {
            let project = editor.ensure_owner(&project, owner).await?;
            println!("{}", serde_json::to_string_pretty(&project)?);
        }
        Commands::Delete { project } => {
            let removed = editor.delete(&project, owner).await?;
            println!("Deleted {} ({} files)", project, removed);
        }
        Commands::RegenerateAsset { project, asset } => {
            wait(editor.regenerate_asset(&project, owner, &asset).await?).await?;
        }
        Commands::RegenerateAnchor {
            project,
            segment,
            slot,
        } => {
            wait(editor.regenerate_anchor(&project, owner, &segment, slot).await?).await?;
        }
        Commands::RegenerateVideo { project, segment } => {
            wait(editor.regenerate_video(&project, owner, &segment).await?).await?;
        }
        Commands::RegenerateTts { project, segment } => {
            wait(editor.regenerate_tts(&project, owner, &segment).await?).await?;
        }
    }
    Ok(())
}

async fn report(manager: &WorkflowManager, pid: &str, status: ProjectStatus) -> Result<()> {
    println!("{}: {}", pid, status);
    if let Some(project) = manager.services().store.get(pid).await? {
        if let Some(error) = project.error {
            eprintln!("Error: {}", error);
        }
        if let Some(result) = project.result {
            println!("Result: {}", result.url);
        }
    }
    Ok(())
}
