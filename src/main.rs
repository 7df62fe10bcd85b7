use std::fs;
use std::io::{self, Read};

use anyhow::{Context, Result};
use belt_probe::Printer;
use clap::Parser;
use log::info;

/// Belt printer probe host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg()]
    config_file: String,

    /// read commands from file instead of from stdin
    #[arg(short = 'i', long)]
    debuginput: Option<String>,

    /// write log to file instead of stderr
    #[arg(short, long)]
    logfile: Option<String>,

    /// enable debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    if let Some(ref logfile) = args.logfile {
        let target = Box::new(fs::File::create(logfile).with_context(|| format!("Can't create logfile {}", logfile))?);
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();

    info!("Starting belt probe host");

    let config_text = fs::read_to_string(&args.config_file)
        .with_context(|| format!("Unable to open config file {}", args.config_file))?;
    let mut printer = Printer::from_config_str(Some(args.config_file.clone()), &config_text)
        .with_context(|| format!("Error loading config file {}", args.config_file))?;

    let script = match &args.debuginput {
        Some(path) => fs::read_to_string(path).with_context(|| format!("Unable to read input file {}", path))?,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).context("Unable to read commands from stdin")?;
            buf
        }
    };

    // Startup messages come first
    for response in printer.take_output() {
        println!("{}", response);
    }
    for line in script.lines() {
        printer.run_script_line(line);
        for response in printer.take_output() {
            println!("{}", response);
        }
    }

    let pending = printer.pending_config();
    if !pending.is_empty() {
        println!("#*# <---------------------- SAVE_CONFIG ---------------------->");
        for line in pending.lines() {
            println!("#*# {}", line);
        }
    }
    info!("Exiting belt probe host");
    Ok(())
}
