pub mod jobs;
pub mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Avatar Forge - turns a portrait photo into a printable 3D figurine
#[derive(Parser, Debug)]
#[command(
    name = "avatar-forge",
    version,
    about = "Avatar Forge - turns a portrait photo into a printable 3D figurine"
)]
pub struct Cli {
    /// Service host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Service port
    #[arg(long, default_value_t = 8000, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP service in the foreground
    Serve {
        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long = "listen-port")]
        port: Option<u16>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<PathBuf>,
    },

    /// Upload a portrait and start a job
    Submit {
        /// Image file (JPEG or PNG)
        image: PathBuf,

        /// Poll until the job finishes
        #[arg(short, long)]
        wait: bool,

        /// Seconds between status checks when waiting
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },

    /// Show the status of a job
    Status {
        /// Job ID
        job: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download an output of a completed job
    Download {
        /// Job ID
        job: String,

        /// Output kind: stl, cartoon or model_3d
        #[arg(default_value = "stl")]
        kind: String,

        /// Destination file (defaults to the server-suggested name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the supported printer profiles
    Profiles,
}

/// Build the base URL for the service HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Format a connection error message for when the service is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to avatar service at {}:{}. Is it running? (try: avatar-forge serve)",
        host, port
    )
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Some(Commands::Serve {
            config,
            port,
            data_dir,
        }) => {
            serve::cmd_serve(
                &cli.host,
                cli.port,
                config.as_deref(),
                *port,
                data_dir.as_deref(),
                cli.verbose,
            )
            .await
        }
        Some(Commands::Submit {
            image,
            wait,
            interval,
        }) => jobs::cmd_submit(&cli.host, cli.port, image, *wait, *interval).await,
        Some(Commands::Status { job, json }) => {
            jobs::cmd_status(&cli.host, cli.port, job, *json).await
        }
        Some(Commands::Download { job, kind, output }) => {
            jobs::cmd_download(&cli.host, cli.port, job, kind, output.as_deref()).await
        }
        Some(Commands::Profiles) => {
            jobs::cmd_profiles();
            Ok(())
        }
        None => {
            // No subcommand provided -- print help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_version_flag() {
        let result = Cli::try_parse_from(["avatar-forge", "--version"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_cli_default_host_port() {
        let cli = Cli::try_parse_from(["avatar-forge", "profiles"]).unwrap();
        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.port, 8000);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "avatar-forge",
            "status",
            "abc",
            "--host",
            "10.0.0.5",
            "--port",
            "9000",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.host, "10.0.0.5");
        assert_eq!(cli.port, 9000);
        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Status { job, json }) => {
                assert_eq!(job, "abc");
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_serve_flags() {
        let cli = Cli::try_parse_from([
            "avatar-forge",
            "serve",
            "-c",
            "/etc/forge.json",
            "-p",
            "9100",
            "--data-dir",
            "/var/lib/forge",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Serve {
                config,
                port,
                data_dir,
            }) => {
                assert_eq!(config, Some(PathBuf::from("/etc/forge.json")));
                assert_eq!(port, Some(9100));
                assert_eq!(data_dir, Some(PathBuf::from("/var/lib/forge")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_submit_wait() {
        let cli = Cli::try_parse_from(["avatar-forge", "submit", "me.jpg", "--wait"]).unwrap();
        match cli.command {
            Some(Commands::Submit {
                image,
                wait,
                interval,
            }) => {
                assert_eq!(image, PathBuf::from("me.jpg"));
                assert!(wait);
                assert_eq!(interval, 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_download_defaults_to_stl() {
        let cli = Cli::try_parse_from(["avatar-forge", "download", "abc"]).unwrap();
        match cli.command {
            Some(Commands::Download { kind, output, .. }) => {
                assert_eq!(kind, "stl");
                assert!(output.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_connection_error_message() {
        let msg = connection_error_message("127.0.0.1", 8000);
        assert!(msg.contains("127.0.0.1:8000"));
        assert!(msg.contains("avatar-forge serve"));
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("localhost", 8000), "http://localhost:8000");
    }
}
