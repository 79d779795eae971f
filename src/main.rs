//! Cube lab entrypoint.
//!
//! Interactive mode runs the terminal UI: the shared cube, its history strip and the output of the
//! loaded program, driven by the keyboard. `--headless` runs the program once, prints its output
//! and exits with its outcome.

mod action;
mod app;
mod tui;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cubelab::history::History;
use cubelab::manager::{ProgramManager, ProgramOutcome};
use cubelab::LabConfig;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::action::Action;
use crate::app::App;
use crate::tui::Tui;

/// Program run when none is given on the command line.
const DEMO_PROGRAM: &str = include_str!("../demos/showcase.cube");

#[tokio::main]
async fn main() -> Result<()> {
    let config = LabConfig::parse();

    if config.headless {
        return run_headless(config).await;
    }

    tracing_subscriber::registry()
        .with(env_filter(&config))
        .with(tui_logger::TuiTracingSubscriberLayer)
        .init();
    let _ = tui_logger::init_logger(log::LevelFilter::Trace);
    tui_logger::set_default_level(log::LevelFilter::Trace);

    let (program_name, program_code) = load_program(&config).await?;
    let cube = config.build_cube()?;

    // Ensure the terminal is restored even if we panic inside the TUI loop.
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = crossterm::terminal::disable_raw_mode();
        let _ = crossterm::execute!(std::io::stderr(), crossterm::terminal::LeaveAlternateScreen);
        original_hook(panic_info);
    }));

    let mut tui = Tui::new()?;
    let (lab_tx, mut lab_rx) = mpsc::unbounded_channel();
    let mut app = App::new(cube, program_name, program_code, !config.fast, lab_tx);
    info!(edge_length = config.edge_length, "cube lab ready");

    while !app.should_quit {
        tokio::select! {
            Some(action) = tui.action_rx.recv() => {
                match action {
                    Action::Render => {
                        tui.draw(&app)?;
                    }
                    other => app.update(other),
                }
            }
            Some(lab_action) = lab_rx.recv() => {
                app.update(lab_action);
            }
        }
    }

    Ok(())
}

async fn run_headless(config: LabConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config))
        .with_writer(std::io::stderr)
        .init();

    let (program_name, program_code) = load_program(&config).await?;
    let cube = config.build_cube()?;
    let history = History::new(cube.clone());
    let manager = ProgramManager::new(cube.clone());

    manager.logged.on(|log| println!("[{}] {}", log.level, log.message));
    manager.overlaid.on(|overlay| println!("[{}] {}: {}", overlay.level, overlay.title, overlay.message));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    manager.outcome.on(move |outcome| {
        let _ = outcome_tx.send(outcome.clone());
    });

    info!(program = %program_name, "running headless");
    manager.start(&program_code, !config.fast)?;

    let outcome = tokio::select! {
        outcome = outcome_rx.recv() => outcome.context("program manager stopped without an outcome")?,
        _ = tokio::signal::ctrl_c() => {
            manager.abort()?;
            ProgramOutcome::Aborted
        }
    };

    println!(
        "{} change(s) recorded, cube {}",
        history.len(),
        if cube.is_solved() { "solved" } else { "not solved" }
    );
    match outcome {
        ProgramOutcome::Success => Ok(()),
        ProgramOutcome::Failure(report) => bail!("{}", report.stack),
        ProgramOutcome::Crash(crash) => bail!("program sandbox crashed: {}", crash.message),
        ProgramOutcome::Aborted => bail!("program aborted"),
    }
}

async fn load_program(config: &LabConfig) -> Result<(String, String)> {
    match &config.program {
        Some(path) => {
            let code = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read program {}", path.display()))?;
            Ok((path.display().to_string(), code))
        }
        None => Ok(("showcase (built in)".to_string(), DEMO_PROGRAM.to_string())),
    }
}

fn env_filter(config: &LabConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}
