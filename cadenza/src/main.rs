// Cadenza CLI entry point.
//
// Usage:
//   cadenza <preprocess|train|generate> [--config FILE] [--corpus DIR]
//     [--artifacts DIR] [--sequence-length N] [--epochs N] [--batch-size N]
//     [--patience N] [--hidden N] [--num-notes N] [--output FILE] [--seed N]
//     [-v|-vv] [-q] [--ts]
//
// Flags override values from the config file, which override the built-in
// defaults. Log output goes to stderr at info level unless -v or -q change it.
//
// Exit codes: 0 success, 1 usage or configuration error, 2 corpus data error,
// 3 missing or inconsistent artifacts, 4 I/O or file format error, 5 model
// error.

use cadenza::config::PipelineConfig;
use cadenza::error::CadenzaError;
use cadenza::pipeline;
use std::path::PathBuf;
use std::str::FromStr;
use stderrlog::Timestamp;

const USAGE: &str = "usage: cadenza <preprocess|train|generate> [flags]

flags:
  --config FILE          JSON config (fields not given keep their defaults)
  --corpus DIR           directory of .mid/.midi files
  --artifacts DIR        where notes.json, vocab.json and model.json live
  --sequence-length N    training window length
  --epochs N             maximum training epochs
  --batch-size N         training minibatch size
  --patience N           epochs without improvement before stopping (0 = never)
  --hidden N             recurrent state width
  --num-notes N          tokens to generate
  --output FILE          generated MIDI path
  --seed N               seed for training and generation
  -v, -vv                more log output
  -q                     no log output
  --ts                   timestamp log lines";

const VALUE_FLAGS: [&str; 11] = [
    "--config",
    "--corpus",
    "--artifacts",
    "--sequence-length",
    "--epochs",
    "--batch-size",
    "--patience",
    "--hidden",
    "--num-notes",
    "--output",
    "--seed",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Preprocess,
    Train,
    Generate,
}

#[derive(Debug)]
struct Cli {
    command: Command,
    config: PipelineConfig,
    verbose: u8,
    quiet: bool,
    timestamps: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return;
    }

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}\n\n{USAGE}");
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = setup_logging(cli.verbose, cli.quiet, cli.timestamps) {
        eprintln!("warning: could not initialize logging: {e}");
    }

    let result = match cli.command {
        Command::Preprocess => pipeline::preprocess(&cli.config).map(|p| {
            println!(
                "preprocessed {} tokens ({} distinct) into {}",
                p.tokens.len(),
                p.vocab.len(),
                cli.config.artifacts_dir.display()
            );
        }),
        Command::Train => pipeline::train(&cli.config).map(|report| {
            println!(
                "trained {} epochs, best loss {:.4} at epoch {}; model saved to {}",
                report.history.len(),
                report.best_loss,
                report.best_epoch,
                cli.config.model_path().display()
            );
        }),
        Command::Generate => pipeline::generate(&cli.config).map(|out| {
            println!(
                "generated {} tokens ({} events) into {}",
                out.tokens.len(),
                out.events_written,
                out.path.display()
            );
        }),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn setup_logging(verbose: u8, quiet: bool, timestamps: bool) -> Result<(), log::SetLoggerError> {
    let log_level = match verbose {
        0 => stderrlog::LogLevelNum::Info,
        1 => stderrlog::LogLevelNum::Debug,
        _ => stderrlog::LogLevelNum::Trace,
    };
    stderrlog::new()
        .quiet(quiet)
        .verbosity(log_level)
        .timestamp(if timestamps {
            Timestamp::Second
        } else {
            Timestamp::Off
        })
        .init()
}

fn usage_error(msg: impl Into<String>) -> CadenzaError {
    CadenzaError::InvalidConfig(msg.into())
}

fn parse_args(args: &[String]) -> Result<Cli, CadenzaError> {
    let mut command = None;
    let mut verbose = 0u8;
    let mut quiet = false;
    let mut timestamps = false;

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if VALUE_FLAGS.contains(&arg) {
            if args.get(i + 1).is_none() {
                return Err(usage_error(format!("{arg} needs a value")));
            }
            i += 2;
            continue;
        }
        match arg {
            "-q" | "--quiet" => quiet = true,
            "--ts" => timestamps = true,
            "--verbose" => verbose = verbose.saturating_add(1),
            _ if arg.len() > 1 && arg.starts_with('-') && arg[1..].bytes().all(|b| b == b'v') => {
                verbose = verbose.saturating_add((arg.len() - 1) as u8);
            }
            _ if arg.starts_with('-') => return Err(usage_error(format!("unknown flag {arg}"))),
            _ if command.is_some() => {
                return Err(usage_error(format!("unexpected argument {arg}")));
            }
            "preprocess" => command = Some(Command::Preprocess),
            "train" => command = Some(Command::Train),
            "generate" => command = Some(Command::Generate),
            _ => return Err(usage_error(format!("unknown command {arg}"))),
        }
        i += 1;
    }
    let command = command.ok_or_else(|| usage_error("missing command"))?;

    let mut config = match parse_flag::<PathBuf>(args, "--config")? {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::standard(),
    };
    if let Some(dir) = parse_flag(args, "--corpus")? {
        config.corpus_dir = dir;
    }
    if let Some(dir) = parse_flag(args, "--artifacts")? {
        config.artifacts_dir = dir;
    }
    if let Some(n) = parse_flag(args, "--sequence-length")? {
        config.training.sequence_length = n;
    }
    if let Some(n) = parse_flag(args, "--epochs")? {
        config.training.epochs = n;
    }
    if let Some(n) = parse_flag(args, "--batch-size")? {
        config.training.batch_size = n;
    }
    if let Some(n) = parse_flag(args, "--patience")? {
        config.training.patience = n;
    }
    if let Some(n) = parse_flag(args, "--hidden")? {
        config.training.hidden_size = n;
    }
    if let Some(n) = parse_flag(args, "--num-notes")? {
        config.generation.num_notes = n;
    }
    if let Some(path) = parse_flag(args, "--output")? {
        config.generation.output_file = path;
    }
    if let Some(seed) = parse_flag::<u64>(args, "--seed")? {
        config.training.seed = Some(seed);
        config.generation.seed = Some(seed);
    }

    Ok(Cli {
        command,
        config,
        verbose,
        quiet,
        timestamps,
    })
}

/// Value following the last occurrence of `flag`, if present.
fn parse_flag<T: FromStr>(args: &[String], flag: &str) -> Result<Option<T>, CadenzaError> {
    let Some(i) = args.iter().rposition(|a| a == flag) else {
        return Ok(None);
    };
    let raw = args
        .get(i + 1)
        .ok_or_else(|| usage_error(format!("{flag} needs a value")))?;
    raw.parse()
        .map(Some)
        .map_err(|_| usage_error(format!("invalid value {raw:?} for {flag}")))
}
