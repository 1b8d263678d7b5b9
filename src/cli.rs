use clap::Parser;
use std::path::PathBuf;

/// MB Harness - runs consumers and publishers described by an XML document
/// and reports TPS and latency
///
/// Log verbosity follows the RUST_LOG environment variable (default: info).
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Path to the XML configuration document
    #[clap(value_name = "CONFIG")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_path() {
        let args = Args::try_parse_from(["mb-harness", "conf/queue.xml"]).unwrap();
        assert_eq!(args.config, PathBuf::from("conf/queue.xml"));
    }

    #[test]
    fn test_config_path_required() {
        assert!(Args::try_parse_from(["mb-harness"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_flags() {
        assert!(Args::try_parse_from(["mb-harness", "--iterations", "5", "a.xml"]).is_err());
        assert!(Args::try_parse_from(["mb-harness", "a.xml", "b.xml"]).is_err());
    }
}
