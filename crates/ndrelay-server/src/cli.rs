//! Command-line and environment surface: `ndrelay -p <port> [-ROOTDIR <dir>]
//! [-TRACE] [-D|-debug]`.
//!
//! `-ROOTDIR`, `-TRACE` and `-debug` are documented as single-dash flags,
//! but clap's derive API always renders a `long` as double-dash. Rather than
//! bend the documented interface to clap's convention, [`normalize_argv`]
//! rewrites the documented single-dash spellings to their double-dash clap
//! equivalents before parsing; every other argument (including `-p`, a
//! genuine single-char short flag, and `-D`) passes through unchanged.

use std::path::PathBuf;

use clap::Parser;

/// `port` is deliberately `Option` rather than `required = true`: the CLI
/// mandates it, but the original reports a distinct exit code (102) for a
/// missing port rather than clap's generic usage-error code, so `main`
/// checks for `None` instead of letting clap reject it.
#[derive(Debug, Parser)]
#[command(name = "ndrelay", about = "TCP pub/sub relay for AR clients")]
pub struct Args {
    /// Listen port.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Root directory for logs and status lockfiles.
    #[arg(long = "rootdir", env = "ROOTDIR")]
    pub rootdir: Option<PathBuf>,

    /// Raise the default log level to trace.
    #[arg(long = "trace")]
    pub trace: bool,

    /// Suppress daemonization and run in the foreground.
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,
}

/// Rewrites the documented single-dash, all-caps long flags (`-ROOTDIR`,
/// `-TRACE`, `-debug`) to the double-dash spellings clap's derive API
/// expects, leaving every other argument — the program name, `-p`, its
/// value, `-D`, an already-double-dash `--rootdir`, etc. — untouched.
pub fn normalize_argv<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|arg| match arg.as_str() {
            "-ROOTDIR" => "--rootdir".to_string(),
            "-TRACE" => "--trace".to_string(),
            "-debug" => "--debug".to_string(),
            _ => arg,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rewrites_documented_single_dash_long_flags() {
        let raw = vec![
            "ndrelay".to_string(),
            "-p".to_string(),
            "9000".to_string(),
            "-ROOTDIR".to_string(),
            "/var/nd".to_string(),
            "-TRACE".to_string(),
            "-debug".to_string(),
        ];
        assert_eq!(
            normalize_argv(raw),
            vec!["ndrelay", "-p", "9000", "--rootdir", "/var/nd", "--trace", "--debug"]
        );
    }

    #[test]
    fn normalize_leaves_short_flags_and_values_untouched() {
        let raw = vec!["ndrelay".to_string(), "-p".to_string(), "9000".to_string(), "-D".to_string()];
        assert_eq!(normalize_argv(raw.clone()), raw);
    }

    #[test]
    fn documented_invocation_parses_into_the_expected_args() {
        let raw = normalize_argv(vec![
            "ndrelay".to_string(),
            "-p".to_string(),
            "9000".to_string(),
            "-ROOTDIR".to_string(),
            "/var/nd".to_string(),
            "-TRACE".to_string(),
        ]);
        let args = Args::parse_from(raw);
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.rootdir, Some(PathBuf::from("/var/nd")));
        assert!(args.trace);
        assert!(!args.debug);
    }
}
