//! Interactive command-line player for the gapless playback pipeline.
//!
//! Plays local files through the local media engine (Symphonia decode, Rubato
//! resampling, CPAL output). Up to two URIs can be given on the command line:
//! the first plays right away, the second follows it without a gap. Commands
//! are read from stdin; every pipeline event is printed to stderr.

mod cli;
mod commands;
mod config;
mod events;
mod tokenizer;

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, select};
use playback_pipeline::Pipeline;
use playback_pipeline::engine::local::{LocalEngine, output_device_names};
use playback_pipeline::processing::{ProcessingObject, SoftVolumeControl};
use tracing_subscriber::EnvFilter;

use commands::{Flow, Session};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    let default_filter = if args.verbose {
        "info,cmdline_player=debug,playback_pipeline=debug"
    } else {
        "info,cmdline_player=info,playback_pipeline=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if args.list_devices {
        for name in output_device_names()? {
            println!("{name}");
        }
        return Ok(());
    }

    let file = match args.config.as_deref() {
        Some(path) => config::PlayerConfig::load(path)?,
        None => config::PlayerConfig::default(),
    };
    let settings = config::Settings::resolve(&args, file);
    tracing::debug!(?settings, "resolved settings");

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let volume = Arc::new(SoftVolumeControl::new());
    if let Some(v) = settings.volume {
        volume.set_volume(v);
    }
    let processing: Vec<Arc<dyn ProcessingObject>> = vec![volume.clone()];
    let pipeline = Pipeline::new(
        Box::new(LocalEngine::new(settings.engine)),
        settings.pipeline,
        events::printing_callbacks(),
        processing,
    )?;
    for tag in &settings.postponed_tags {
        pipeline.force_postpone_tag(tag, true);
    }

    let session = Session { pipeline, volume };
    eprintln!("Type help to get a list of valid commands\n");

    let mut uris = args.uris.iter();
    if let Some(uri) = uris.next() {
        session.play(uri, true);
    }
    if let Some(uri) = uris.next() {
        session.play(uri, false);
    }

    let lines = spawn_stdin_reader()?;
    run_repl(&session, &lines, &quit_rx)?;

    tracing::debug!("shutting down");
    drop(session);
    Ok(())
}

/// Read stdin lines on a separate thread so Ctrl-C can interrupt the wait.
fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                print!("cmd> ");
                let _ = std::io::stdout().flush();
                line.clear();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line.trim_end_matches(['\r', '\n']).to_string()).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .context("spawn stdin thread")?;
    Ok(rx)
}

fn run_repl(session: &Session, lines: &Receiver<String>, quit: &Receiver<()>) -> Result<()> {
    let mut err = std::io::stderr();
    loop {
        let line = select! {
            recv(lines) -> line => match line {
                Ok(line) => line,
                // stdin closed
                Err(_) => return Ok(()),
            },
            recv(quit) -> _ => {
                eprintln!();
                return Ok(());
            }
        };

        let tokens = tokenizer::tokenize_line(&line);
        if tokens.is_empty() {
            continue;
        }
        match commands::parse(&tokens) {
            Ok(command) => {
                if let Flow::Quit = session.execute(command, &mut err)? {
                    return Ok(());
                }
            }
            Err(e) => writeln!(err, "{e}")?,
        }
    }
}
