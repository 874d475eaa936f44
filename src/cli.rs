use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Data directory holding config.yaml, index files and tables
    #[clap(long, global = true, env = "RVS_BASE_PATH")]
    pub base_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP service.
    Serve {
        /// Listen address, overrides server.addr
        #[clap(long)]
        addr: Option<String>,

        /// Don't populate empty collections on startup
        #[clap(long, default_value = "false")]
        no_bootstrap: bool,
    },
    /// Populate empty collections from their configured sources.
    Bootstrap {},
    /// Search a collection.
    Search {
        collection: String,

        /// Query text
        text: String,

        /// Number of neighbors, overrides search.top_n
        #[clap(short = 'n', long)]
        top_n: Option<usize>,
    },
    /// Add one record to a collection.
    Add {
        collection: String,

        /// A field value, e.g. --field job_title=Developer
        #[clap(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Repair a halted collection.
    Reconcile { collection: String },
    /// Print vector and row counts per collection.
    Status {},
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field() {
        assert_eq!(
            parse_field("job_title=Rust dev"),
            Ok(("job_title".to_string(), "Rust dev".to_string()))
        );
        assert_eq!(
            parse_field("salary=a=b"),
            Ok(("salary".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_field("edu="), Ok(("edu".to_string(), String::new())));
        assert!(parse_field("no_value").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[test]
    fn test_add_collects_fields() {
        let args = Args::parse_from([
            "rvsearch", "add", "res", "--field", "job_title=dev", "-f", "edu=MSU",
        ]);
        match args.command {
            Command::Add { collection, fields } => {
                assert_eq!(collection, "res");
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[1].1, "MSU");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
