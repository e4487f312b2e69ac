//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Collect reference documents from auction case detail pages.
///
/// Each URL is one case. Attachments are saved under
/// `<output-dir>/<case-id>/` next to a `manifest.json` that records what was
/// obtained and which required categories are still missing.
#[derive(Parser, Debug)]
#[command(name = "casefile")]
#[command(author, version, about)]
pub struct Args {
    /// Detail-page URLs (reads stdin when omitted)
    pub urls: Vec<String>,

    /// JSON plan file: a list of {url, candidates?}
    #[arg(long, value_name = "PATH")]
    pub plan: Option<PathBuf>,

    /// Root directory for case folders
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent HTTP requests (1-32)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Maximum retry attempts for failed fetches (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Requests per second across all fetches (0 disables pacing)
    #[arg(long)]
    pub qps: Option<f64>,

    /// Per-request timeout in seconds (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout_secs: Option<u64>,

    /// Required category codes, comma separated (e.g. AP,REG)
    #[arg(long, value_delimiter = ',', value_name = "CODES")]
    pub require: Vec<String>,

    /// Categories recorded as links only, comma separated
    #[arg(long, value_delimiter = ',', value_name = "CODES")]
    pub link_only: Vec<String>,

    /// Pick up files a browser saved to this folder as a last resort
    #[arg(long, value_name = "DIR")]
    pub folder_pickup: Option<PathBuf>,

    /// Save before/after page snapshots under <case>/debug/
    #[arg(long)]
    pub snapshots: bool,

    /// Config file (default: ~/.config/casefile/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["casefile"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.urls.is_empty());
        assert!(args.concurrency.is_none());
        assert!(args.require.is_empty());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["casefile", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["casefile", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_positional_urls_and_output() {
        let args = Args::try_parse_from([
            "casefile",
            "-o",
            "/tmp/out",
            "https://a.example/1",
            "https://a.example/2",
        ])
        .unwrap();
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.output_dir, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn test_cli_category_lists_split_on_comma() {
        let args =
            Args::try_parse_from(["casefile", "--require", "AP,REG", "--link-only", "MAP"]).unwrap();
        assert_eq!(args.require, vec!["AP", "REG"]);
        assert_eq!(args.link_only, vec!["MAP"]);
    }

    #[test]
    fn test_cli_concurrency_range() {
        assert_eq!(
            Args::try_parse_from(["casefile", "-c", "32"]).unwrap().concurrency,
            Some(32)
        );
        let err = Args::try_parse_from(["casefile", "-c", "33"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        let err = Args::try_parse_from(["casefile", "-c", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_max_retries_over_max_rejected() {
        let err = Args::try_parse_from(["casefile", "-r", "11"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_flags_combined() {
        let args = Args::try_parse_from([
            "casefile",
            "--qps",
            "0.5",
            "--timeout-secs",
            "30",
            "--snapshots",
            "--folder-pickup",
            "/tmp/dl",
            "--plan",
            "plan.json",
        ])
        .unwrap();
        assert_eq!(args.qps, Some(0.5));
        assert_eq!(args.timeout_secs, Some(30));
        assert!(args.snapshots);
        assert_eq!(args.folder_pickup, Some(PathBuf::from("/tmp/dl")));
        assert_eq!(args.plan, Some(PathBuf::from("plan.json")));
    }
}
