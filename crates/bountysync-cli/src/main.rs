//! Command-line driver for the bountysync engine.
//!
//! Exit codes: 0 on success, 1 on engine or configuration errors, 2 on
//! usage errors (from the argument parser), 130 when interrupted.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod listener;

use bountysync::orchestrator::DefaultClientFactory;
use bountysync::{Synchronizer, Tester, error_chain};
use bountysync_config::{ConfigFormat, RootConfiguration};
use listener::CliListener;

#[derive(Parser, Debug)]
#[command(name = "bountysync", version)]
#[command(about = "Synchronize bug bounty reports into external issue trackers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Path to the configuration file.
    #[arg(long, short = 'c')]
    config_file: PathBuf,

    /// Format of the configuration file.
    #[arg(long, short = 'f', value_enum, default_value_t = FormatArg::Yaml)]
    config_format: FormatArg,
}

impl ConfigArgs {
    fn load(&self) -> Result<RootConfiguration, CliError> {
        Ok(RootConfiguration::load_file(
            &self.config_file,
            self.config_format.into(),
        )?)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    /// YAML document.
    Yaml,
    /// JSON document.
    Json,
}

impl From<FormatArg> for ConfigFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Yaml => ConfigFormat::Yaml,
            FormatArg::Json => ConfigFormat::Json,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchemaFormatArg {
    /// Indented plain text.
    Text,
    /// Markdown tables.
    Markdown,
    /// JSON Schema.
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration file (mandatory fields, data types, ...).
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Execute synchronization.
    #[command(alias = "sync")]
    Synchronize {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Test the connection to the platforms and the trackers.
    Test {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Convert a configuration file from a format to another.
    Convert {
        #[command(flatten)]
        config: ConfigArgs,

        /// Path of the converted file; `-` prints to stdout.
        #[arg(long, short = 'd', default_value = "-")]
        destination_file: String,

        /// Format of the converted file.
        #[arg(long, value_enum)]
        destination_format: FormatArg,

        /// Override the destination file if it already exists.
        #[arg(long = "override")]
        override_destination: bool,
    },
    /// Dump a schema of the configuration file structure.
    Schema {
        /// Output format.
        #[arg(long, short = 'f', value_enum, default_value_t = SchemaFormatArg::Text)]
        format: SchemaFormatArg,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] bountysync_config::ConfigError),
    #[error(transparent)]
    Synchronizer(#[from] bountysync::SynchronizerError),
    #[error(transparent)]
    Tester(#[from] bountysync::TesterError),
    #[error("destination file {path} already exists (use --override to replace it)")]
    DestinationExists { path: String },
    #[error("unable to write {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", error_chain(&error));
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Validate { config } => {
            config.load()?;
            println!("{} is valid.", config.config_file.display());
            Ok(())
        }
        Command::Synchronize { config } => {
            let configuration = config.load()?;
            let factory = DefaultClientFactory::default();
            let listener = CliListener::default();
            Synchronizer::new(&configuration, &factory, &listener).synchronize()?;
            Ok(())
        }
        Command::Test { config } => {
            let configuration = config.load()?;
            let factory = DefaultClientFactory::default();
            let listener = CliListener::default();
            Tester::new(&configuration, &factory, &listener).test()?;
            Ok(())
        }
        Command::Convert {
            config,
            destination_file,
            destination_format,
            override_destination,
        } => {
            let configuration = config.load()?;
            let document = configuration.dump(destination_format.into())?;
            write_destination(&destination_file, &document, override_destination)
        }
        Command::Schema { format } => {
            let document = match format {
                SchemaFormatArg::Text => bountysync_config::schema_as_text(),
                SchemaFormatArg::Markdown => bountysync_config::schema_as_markdown(),
                SchemaFormatArg::Json => bountysync_config::schema_as_json(),
            };
            println!("{document}");
            Ok(())
        }
    }
}

fn write_destination(destination: &str, document: &str, replace: bool) -> Result<(), CliError> {
    if destination == "-" {
        let mut stdout = std::io::stdout();
        return stdout
            .write_all(document.as_bytes())
            .and_then(|()| stdout.write_all(b"\n"))
            .map_err(|source| CliError::Write {
                path: "<stdout>".to_string(),
                source,
            });
    }
    let path = Path::new(destination);
    if path.exists() && !replace {
        return Err(CliError::DestinationExists {
            path: destination.to_string(),
        });
    }
    std::fs::write(path, document).map_err(|source| CliError::Write {
        path: destination.to_string(),
        source,
    })
}
