use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "citypack",
    version,
    about = "Content-addressed CityGML archive packing service and worker",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable debug logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API that admits pack requests and serves results.
    Serve {
        #[arg(short, long, help = "Port to listen on (overrides CITYPACK_PORT)")]
        port: Option<u16>,

        #[arg(long, help = "Address to bind (overrides CITYPACK_HOST)")]
        host: Option<String>,
    },

    /// Build one archive. This is what the command dispatcher runs.
    Pack {
        #[arg(long, help = "Job record location (scheme://bucket/<key>.zip)")]
        dest: String,

        #[arg(long, help = "Only accept source URLs on this host")]
        domain: Option<String>,

        #[arg(long, help = "Job timeout in seconds (default 900)")]
        timeout: Option<u64>,

        #[arg(long, help = "Location of a newline-delimited URL list")]
        source: Option<String>,

        #[arg(help = "Comma-separated source URLs")]
        urls: Option<String>,
    },

    /// Print the cache key of a URL set.
    Key {
        #[arg(required = true, help = "Source URLs")]
        urls: Vec<String>,

        #[arg(long, help = "Reject URLs that are not on this host")]
        domain: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_pack_arguments() {
        let cli = Cli::try_parse_from([
            "citypack",
            "pack",
            "--dest",
            "fs://packs/abc.zip",
            "--timeout",
            "60",
            "http://h/a.zip,http://h/b.zip",
        ])
        .unwrap();
        match cli.command {
            Commands::Pack {
                dest,
                timeout,
                source,
                urls,
                ..
            } => {
                assert_eq!(dest, "fs://packs/abc.zip");
                assert_eq!(timeout, Some(60));
                assert_eq!(source, None);
                assert_eq!(urls.as_deref(), Some("http://h/a.zip,http://h/b.zip"));
            }
            _ => panic!("expected pack"),
        }
    }

    #[test]
    fn test_key_requires_urls() {
        assert!(Cli::try_parse_from(["citypack", "key"]).is_err());
    }
}
