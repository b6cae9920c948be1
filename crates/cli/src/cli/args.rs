pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "transfer")]
#[command(about = "Key management for the secure data transfer protocol")]
pub struct Args {
    /// Path to the transfer state directory (defaults to ~/.transfer)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    /// Default log level, RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: crate::Command,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;

    #[test]
    fn test_parse_publish_with_store() {
        let args = Args::try_parse_from([
            "transfer",
            "--config-path",
            "/tmp/transfer",
            "publish",
            "--store",
            "https://dms.example.org/fhir",
        ])
        .unwrap();

        assert_eq!(args.config_path, Some(PathBuf::from("/tmp/transfer")));
        assert_eq!(args.log_level, tracing::Level::WARN);
        match args.command {
            Command::Publish(publish) => assert_eq!(
                publish.store.unwrap().as_str(),
                "https://dms.example.org/fhir"
            ),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_init_requires_organization() {
        assert!(Args::try_parse_from(["transfer", "init"]).is_err());

        let args = Args::try_parse_from(["transfer", "init", "--organization", "DMS1"]).unwrap();
        match args.command {
            Command::Init(init) => {
                assert_eq!(init.organization, "DMS1");
                assert_eq!(init.modulus_bits, 4096);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
