use clap::{Parser, Subcommand};
use reelforge::core::models::{AnchorSlot, Step};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reelforge")]
#[command(author, version, about = "Turns a prompt and reference images into a narrated short video")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "config.yml")]
    pub config: PathBuf,

    /// Owner the project operations act on behalf of
    #[arg(long, global = true, env = "REELFORGE_OWNER", default_value = "local")]
    pub owner: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an empty project
    Create {
        /// Display name
        name: String,
        /// Creative prompt describing the video
        prompt: String,
    },

    /// List the owner's projects
    List,

    /// Attach a reference file to a project
    Upload {
        project: String,
        file: PathBuf,
        /// What the file shows
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Run a single pipeline step
    Step { project: String, step: Step },

    /// Run every step from ingestion to assembly
    Run { project: String },

    /// Print the project record as JSON
    Show { project: String },

    /// Delete a project and its files
    Delete { project: String },

    /// Redraw one finalized asset
    RegenerateAsset { project: String, asset: String },

    /// Redraw one anchor frame
    RegenerateAnchor {
        project: String,
        segment: String,
        #[arg(default_value = "start")]
        slot: AnchorSlot,
    },

    /// Render one segment's clip again
    RegenerateVideo { project: String, segment: String },

    /// Synthesize one segment's narration again
    RegenerateTts { project: String, segment: String },
}
