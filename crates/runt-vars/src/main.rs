//! runt-vars: inspect the variables of a running Jupyter kernel.
//!
//! Attaches to a kernel by connection file (or kernel id in the Jupyter
//! runtime directory) as an extra client, so it can run next to a notebook
//! frontend that is using the same kernel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kernel_inspector::channel::{MessageContent, RequestEvent};
use kernel_inspector::settings::{load_settings, save_settings, settings_path};
use kernel_inspector::{
    InspectError, InspectorManager, InspectorSettings, JupyterChannel, ScriptRegistry, SessionId,
};
use log::{debug, info};
use runtimelib::runtime_dir;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

mod render;

use crate::render::{matrix_table, title_line, variables_table, TerminalView};

#[derive(Parser, Debug)]
#[command(name = "runt-vars")]
#[command(author, version, about = "Inspect the variables of a running Jupyter kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Seconds to wait for the kernel before giving up
    #[arg(long, global = true, default_value = "30")]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the kernel languages that have an inspector
    Languages {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print the kernel's variables once
    List {
        #[command(flatten)]
        target: Target,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print the variables again every time code runs on the kernel
    Watch {
        #[command(flatten)]
        target: Target,
        /// Print one JSON object per update
        #[arg(long)]
        json: bool,
    },
    /// Show a table preview of a variable
    Matrix {
        #[command(flatten)]
        target: Target,
        /// Variable name
        name: String,
        /// Maximum number of rows (default from settings)
        #[arg(long, short)]
        rows: Option<usize>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Evaluate an expression and print its HTML rendering
    Preview {
        #[command(flatten)]
        target: Target,
        /// Expression to evaluate
        expression: String,
    },
    /// Display a widget variable and print what the kernel sends back
    Widget {
        #[command(flatten)]
        target: Target,
        /// Variable name
        name: String,
    },
    /// Delete a variable
    Delete {
        #[command(flatten)]
        target: Target,
        /// Variable name
        name: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Delete every user variable
    DeleteAll {
        #[command(flatten)]
        target: Target,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show or manage inspector settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Kernel connection file, or a kernel id in the Jupyter runtime directory
    kernel: String,
    /// Session label (default: the connection file path)
    #[arg(long)]
    session: Option<String>,
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    /// Print the current settings
    Show {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print the settings file location
    Path,
    /// Print the JSON schema of the settings file
    Schema,
    /// Write the default settings to disk
    Reset,
}

#[derive(Serialize, Tabled)]
struct LanguageRow {
    #[tabled(rename = "LANGUAGE")]
    language: String,
    #[tabled(rename = "LABEL")]
    label: String,
}

#[derive(Tabled)]
struct SettingRow {
    #[tabled(rename = "KEY")]
    key: &'static str,
    #[tabled(rename = "VALUE")]
    value: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let timeout = Duration::from_secs(cli.timeout);
    match cli.command {
        Commands::Languages { json } => languages(json),
        Commands::List { target, json } => list(&target, json, timeout).await,
        Commands::Watch { target, json } => watch(&target, json, timeout).await,
        Commands::Matrix {
            target,
            name,
            rows,
            json,
        } => matrix(&target, &name, rows, json, timeout).await,
        Commands::Preview { target, expression } => preview(&target, &expression, timeout).await,
        Commands::Widget { target, name } => widget(&target, &name, timeout).await,
        Commands::Delete { target, name, json } => delete(&target, Some(&name), json, timeout).await,
        Commands::DeleteAll { target, json } => delete(&target, None, json, timeout).await,
        Commands::Settings { command } => settings(command),
    }
}

/// Find the connection file for `kernel`.
///
/// Accepts a path, a file name in the runtime directory, or a bare kernel id
/// (`kernel-<id>.json` or `runt-kernel-<id>.json`).
fn resolve_connection_file(kernel: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(kernel);
    if direct.is_file() {
        return Ok(direct);
    }
    let dir = runtime_dir();
    let candidates = [
        dir.join(kernel),
        dir.join(format!("kernel-{}.json", kernel)),
        dir.join(format!("runt-kernel-{}.json", kernel)),
    ];
    candidates
        .into_iter()
        .find(|p| p.is_file())
        .with_context(|| format!("No connection file for kernel '{}' in {}", kernel, dir.display()))
}

fn session_for(target: &Target, connection_file: &Path) -> Result<SessionId> {
    Ok(match &target.session {
        Some(label) => SessionId::new(label.clone())?,
        None => SessionId::try_from(connection_file)?,
    })
}

/// A connected kernel with its handler registered and active.
struct Attached {
    channel: Arc<JupyterChannel>,
    manager: InspectorManager,
}

impl Attached {
    fn close(self) {
        self.manager.shutdown();
        self.channel.shutdown();
    }
}

async fn attach(target: &Target, timeout: Duration) -> Result<Attached> {
    let connection_file = resolve_connection_file(&target.kernel)?;
    debug!("Using connection file {}", connection_file.display());
    let session = session_for(target, &connection_file)?;

    let channel = tokio::time::timeout(
        timeout,
        JupyterChannel::from_connection_file(&connection_file),
    )
    .await
    .context("Timed out connecting to the kernel")??;
    let channel = Arc::new(channel);

    let manager = InspectorManager::new(load_settings());
    let handler = manager.handler_for(session, channel.clone()).await;
    tokio::time::timeout(timeout, handler.ready())
        .await
        .context("Timed out initializing the inspector")??;
    manager.set_active(Some(handler.clone()));
    info!("Attached to {} ({})", handler.session(), handler.language());

    Ok(Attached { channel, manager })
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: impl std::future::Future<Output = Result<T, InspectError>>,
) -> Result<T> {
    Ok(tokio::time::timeout(timeout, operation)
        .await
        .context("Kernel did not answer in time")??)
}

fn languages(json: bool) -> Result<()> {
    let rows: Vec<LanguageRow> = ScriptRegistry::languages()
        .into_iter()
        .map(|l| LanguageRow {
            language: l.to_string(),
            label: l.label().to_string(),
        })
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    Ok(())
}

async fn list(target: &Target, json: bool, timeout: Duration) -> Result<()> {
    let attached = attach(target, timeout).await?;
    let result = with_timeout(timeout, attached.manager.inspect()).await;
    attached.close();
    let event = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&event)?);
    } else {
        println!("{}", title_line(&event));
        println!("{}", variables_table(&event));
    }
    Ok(())
}

async fn watch(target: &Target, json: bool, timeout: Duration) -> Result<()> {
    let attached = attach(target, timeout).await?;
    // Attaching the view requests the first inspection.
    attached.manager.attach_view(Arc::new(TerminalView { json }));

    tokio::signal::ctrl_c().await?;
    attached.manager.detach_view();
    attached.close();
    Ok(())
}

async fn matrix(
    target: &Target,
    name: &str,
    rows: Option<usize>,
    json: bool,
    timeout: Duration,
) -> Result<()> {
    let attached = attach(target, timeout).await?;
    let result = with_timeout(
        timeout,
        attached.manager.perform_matrix_inspection(name, rows),
    )
    .await;
    attached.close();
    let model = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&model)?);
    } else {
        println!("{}", matrix_table(&model));
        println!("{} rows", model.row_count());
    }
    Ok(())
}

async fn preview(target: &Target, expression: &str, timeout: Duration) -> Result<()> {
    let attached = attach(target, timeout).await?;
    let result = with_timeout(timeout, attached.manager.perform_preview(expression)).await;
    attached.close();
    println!("{}", result?);
    Ok(())
}

async fn widget(target: &Target, name: &str, timeout: Duration) -> Result<()> {
    let attached = attach(target, timeout).await?;
    let outcome: Result<()> = async {
        let mut handle = with_timeout(timeout, attached.manager.perform_widget_inspection(name)).await?;
        loop {
            let event = tokio::time::timeout(timeout, handle.next())
                .await
                .context("Kernel did not answer in time")?;
            match event {
                Some(RequestEvent::Output(MessageContent::Stream { text, .. })) => print!("{}", text),
                Some(RequestEvent::Output(MessageContent::Error { ename, evalue, .. })) => {
                    anyhow::bail!("{}: {}", ename, evalue)
                }
                Some(RequestEvent::Output(content)) => {
                    if let Some(text) = content.mime_text("text/plain") {
                        println!("{}", text);
                    }
                }
                Some(RequestEvent::Done(status)) => {
                    debug!("Widget request finished: {:?}", status);
                    return Ok(());
                }
                None => anyhow::bail!("Kernel connection closed"),
            }
        }
    }
    .await;
    attached.close();
    outcome
}

async fn delete(target: &Target, name: Option<&str>, json: bool, timeout: Duration) -> Result<()> {
    let attached = attach(target, timeout).await?;
    let result = match name {
        Some(name) => with_timeout(timeout, attached.manager.perform_delete(name)).await,
        None => with_timeout(timeout, attached.manager.perform_all_delete()).await,
    };
    attached.close();
    let event = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&event)?);
    } else {
        println!("{}", variables_table(&event));
    }
    Ok(())
}

fn settings(command: SettingsCommands) -> Result<()> {
    match command {
        SettingsCommands::Show { json } => {
            let settings = load_settings();
            if json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                let rows = vec![
                    SettingRow {
                        key: "max_matrix_rows",
                        value: settings.max_matrix_rows.to_string(),
                    },
                    SettingRow {
                        key: "restarting_label",
                        value: settings.restarting_label,
                    },
                    SettingRow {
                        key: "unsupported_label",
                        value: settings.unsupported_label,
                    },
                    SettingRow {
                        key: "query_on_attach",
                        value: settings.query_on_attach.to_string(),
                    },
                ];
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
        SettingsCommands::Path => println!("{}", settings_path().display()),
        SettingsCommands::Schema => {
            let schema = schemars::schema_for!(InspectorSettings);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        SettingsCommands::Reset => {
            save_settings(&InspectorSettings::default())?;
            println!("Wrote defaults to {}", settings_path().display());
        }
    }
    Ok(())
}
