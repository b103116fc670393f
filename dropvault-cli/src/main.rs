mod command;
mod event;
mod ui;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use dropvault_core::protocol::HandlingMode;
use dropvault_engine::client::ClientConfig;
use dropvault_engine::server::{DEFAULT_MAX_CONNECTIONS, ServerConfig};

/// DropVault: file storage server with verified, resumable transfers.
///
/// `serve` runs the server; every other subcommand is a client talking to
/// the server given by `--server`.
#[derive(Parser, Debug)]
#[command(name = "dropvault", version, about)]
struct Args {
    /// Server address used by client subcommands.
    #[arg(short, long, global = true, default_value = "localhost:5000")]
    server: String,

    /// Log at debug level (ignored when RUST_LOG is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the server.
    Serve {
        /// Address to listen on.
        #[arg(short, long, default_value = "0.0.0.0:5000")]
        listen: String,

        /// Directory holding the stored files.
        #[arg(long, default_value = "server_storage")]
        storage_dir: PathBuf,

        /// Directory holding archived versions [default: <storage-dir>/version_history].
        #[arg(long)]
        versions_dir: Option<PathBuf>,

        /// Maximum number of connections served at once.
        #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
        max_connections: usize,

        /// Seconds a connection may stay silent mid-operation.
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },

    /// Upload a file.
    Upload {
        /// Local file to upload.
        path: PathBuf,

        /// What to do if the name exists: overwrite, rename or versioning.
        #[arg(short, long, default_value = "overwrite")]
        mode: HandlingMode,
    },

    /// Download a file, resuming if the connection drops.
    Download {
        /// Name of the file on the server.
        filename: String,

        /// Directory to save into.
        #[arg(short, long, default_value = "client_downloads")]
        dir: PathBuf,
    },

    /// List stored files.
    List,

    /// List the archived versions of a file.
    Versions {
        /// Name of the file on the server.
        filename: String,
    },
}

fn init_tracing(verbose: bool) {
    // Tracing goes to stderr so it doesn't mix with tables and progress
    // bars on stdout.  Library crates stay at "warn" unless verbose.
    let default_filter = if verbose {
        "dropvault_cli=debug,dropvault_engine=debug,dropvault_core=debug,warn"
    } else {
        "dropvault_cli=info,dropvault_engine=info,warn"
    };
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let client_config = ClientConfig {
        addr: args.server.clone(),
        ..ClientConfig::default()
    };

    let result = match args.command {
        Cmd::Serve {
            listen,
            storage_dir,
            versions_dir,
            max_connections,
            timeout_secs,
        } => {
            let config = ServerConfig {
                storage_root: storage_dir,
                versions_dir,
                max_connections,
                operation_timeout: Duration::from_secs(timeout_secs),
                ..ServerConfig::default()
            };
            command::serve(&listen, config).await
        }
        Cmd::Upload { path, mode } => command::upload(client_config, &path, mode).await,
        Cmd::Download { filename, dir } => {
            let config = ClientConfig {
                download_dir: dir,
                ..client_config
            };
            command::download(config, &filename).await
        }
        Cmd::List => command::list(client_config).await,
        Cmd::Versions { filename } => command::versions(client_config, &filename).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("  ❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn when_cli_definition_is_built_expect_no_conflicts() {
        Args::command().debug_assert();
    }

    #[test]
    fn when_upload_mode_is_given_expect_handling_mode_parsed() {
        let args = Args::try_parse_from(["dropvault", "upload", "a.txt", "--mode", "versioning"])
            .unwrap();
        assert!(matches!(
            args.command,
            Cmd::Upload {
                mode: HandlingMode::Versioning,
                ..
            }
        ));
        assert_eq!(args.server, "localhost:5000");
    }

    #[test]
    fn when_upload_mode_is_unknown_expect_parse_error() {
        assert!(Args::try_parse_from(["dropvault", "upload", "a.txt", "--mode", "merge"]).is_err());
    }

    #[test]
    fn when_global_server_follows_subcommand_expect_it_applies() {
        let args =
            Args::try_parse_from(["dropvault", "list", "--server", "10.0.0.2:6000"]).unwrap();
        assert_eq!(args.server, "10.0.0.2:6000");
        assert!(matches!(args.command, Cmd::List));
    }
}
