//! Command-line shell: argument parsing, fd-limit raise, backend selection,
//! and one traversal + print pass per root path.

use std::ffi::OsString;
use std::io::{self, BufWriter};
use std::os::unix::ffi::OsStrExt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use duz::output::print_records;
use duz::traversal::threaded;
#[cfg(target_os = "linux")]
use duz::traversal::uring;
use duz::{ThreadedConfig, Traversal};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    /// Try io_uring, fall back to the thread pool if the ring is unavailable.
    Auto,
    IoUring,
    Threaded,
}

struct Options {
    backend: Backend,
    threads: Option<usize>,
    paths: Vec<OsString>,
}

const USAGE: &str = "usage: duz [options] [paths...]
  -h, --help                print this help
  --backend <io_uring|threaded|auto>
                            traversal engine (default: auto)
  -j, --threads <N>         worker threads for the threaded backend
                            (default: 2.5x CPU count, capped at 64)
  --                        end of options";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let options = match parse_args(std::env::args_os().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => return ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("duz: {message}");
            eprintln!("{USAGE}");
            return ExitCode::from(1);
        }
    };

    raise_fd_limit();

    let config = ThreadedConfig {
        workers: options.threads.unwrap_or_else(duz::default_workers),
    };

    let mut backend = options.backend;
    for path in &options.paths {
        let started = Instant::now();
        let traversal = match run_backend(&mut backend, path.as_bytes(), config) {
            Ok(traversal) => traversal,
            Err(err) => {
                error!("{}: traversal failed: {err}", path.to_string_lossy());
                return ExitCode::FAILURE;
            }
        };

        debug!(
            records = traversal.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "traversal finished"
        );

        let stdout = io::stdout().lock();
        let mut out = BufWriter::new(stdout);
        let mut err_stream = io::stderr().lock();
        if let Err(err) = print_records(&traversal, &mut out, &mut err_stream) {
            error!("writing results failed: {err}");
            return ExitCode::FAILURE;
        }
        drop(out);
    }

    ExitCode::SUCCESS
}

/// Runs one root on the selected backend. In auto mode an unavailable ring
/// demotes the process to the threaded backend for all remaining roots.
fn run_backend(
    backend: &mut Backend,
    root: &[u8],
    config: ThreadedConfig,
) -> io::Result<Arc<Traversal>> {
    match *backend {
        Backend::Threaded => threaded::run(root, config),
        Backend::IoUring => {
            #[cfg(target_os = "linux")]
            {
                uring::run(root, Default::default())
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "io_uring backend requires Linux",
                ))
            }
        }
        Backend::Auto => {
            #[cfg(target_os = "linux")]
            {
                match uring::run(root, Default::default()) {
                    Ok(traversal) => Ok(traversal),
                    Err(err) => {
                        debug!("io_uring unavailable ({err}); using threaded backend");
                        *backend = Backend::Threaded;
                        threaded::run(root, config)
                    }
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                *backend = Backend::Threaded;
                threaded::run(root, config)
            }
        }
    }
}

fn parse_args(args: impl Iterator<Item = OsString>) -> Result<Option<Options>, String> {
    let mut backend = Backend::Auto;
    let mut threads = None;
    let mut paths = Vec::new();
    let mut args = args;
    let mut options_done = false;

    while let Some(arg) = args.next() {
        if options_done {
            paths.push(arg);
            continue;
        }
        let flag = arg.to_str().map(str::to_owned);
        let Some(flag) = flag else {
            // Non-UTF-8 arguments can only be paths.
            paths.push(arg);
            continue;
        };
        match flag.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(None);
            }
            "--" => options_done = true,
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--backend requires a value".to_string())?;
                backend = parse_backend(value.to_str().unwrap_or(""))?;
            }
            _ if flag.starts_with("--backend=") => {
                backend = parse_backend(&flag["--backend=".len()..])?;
            }
            "-j" | "--threads" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--threads requires a value".to_string())?;
                threads = Some(parse_threads(value.to_str().unwrap_or(""))?);
            }
            _ if flag.starts_with("--threads=") => {
                threads = Some(parse_threads(&flag["--threads=".len()..])?);
            }
            _ if flag.starts_with('-') && flag.len() > 1 => {
                return Err(format!("unknown option '{flag}'"));
            }
            _ => paths.push(arg),
        }
    }

    if paths.is_empty() {
        paths.push(OsString::from("."));
    }
    for path in &paths {
        let bytes = path.as_bytes();
        if bytes.is_empty() || bytes.contains(&0) {
            return Err(format!("invalid path argument {:?}", path.to_string_lossy()));
        }
    }

    Ok(Some(Options {
        backend,
        threads,
        paths,
    }))
}

fn parse_backend(value: &str) -> Result<Backend, String> {
    match value {
        "io_uring" => Ok(Backend::IoUring),
        "threaded" => Ok(Backend::Threaded),
        "auto" => Ok(Backend::Auto),
        other => Err(format!("unknown backend '{other}'")),
    }
}

fn parse_threads(value: &str) -> Result<usize, String> {
    let threads: usize = value
        .parse()
        .map_err(|_| format!("invalid thread count '{value}'"))?;
    if threads == 0 {
        return Err("thread count must be at least 1".to_string());
    }
    Ok(threads)
}

/// Raises `RLIMIT_NOFILE.cur` to the hard limit so deep fan-out does not
/// starve the traversal of descriptors. Failure is survivable.
fn raise_fd_limit() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: plain getrlimit/setrlimit on a local struct.
    unsafe {
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            warn!("getrlimit(RLIMIT_NOFILE) failed; keeping current limit");
            return;
        }
        if limit.rlim_cur == limit.rlim_max {
            return;
        }
        limit.rlim_cur = limit.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            warn!("raising RLIMIT_NOFILE failed; keeping current limit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Options>, String> {
        parse_args(args.iter().map(OsString::from))
    }

    #[test]
    fn defaults_to_auto_backend_and_current_directory() {
        let options = parse(&[]).unwrap().unwrap();
        assert_eq!(options.backend, Backend::Auto);
        assert_eq!(options.threads, None);
        assert_eq!(options.paths, vec![OsString::from(".")]);
    }

    #[test]
    fn backend_and_threads_accept_both_forms() {
        let options = parse(&["--backend", "threaded", "-j", "4", "tree"])
            .unwrap()
            .unwrap();
        assert_eq!(options.backend, Backend::Threaded);
        assert_eq!(options.threads, Some(4));
        assert_eq!(options.paths, vec![OsString::from("tree")]);

        let options = parse(&["--backend=io_uring", "--threads=9"]).unwrap().unwrap();
        assert_eq!(options.backend, Backend::IoUring);
        assert_eq!(options.threads, Some(9));
    }

    #[test]
    fn double_dash_ends_option_parsing() {
        let options = parse(&["--", "--backend"]).unwrap().unwrap();
        assert_eq!(options.paths, vec![OsString::from("--backend")]);
    }

    #[test]
    fn unknown_flags_and_bad_values_are_rejected() {
        assert!(parse(&["--frobnicate"]).is_err());
        assert!(parse(&["--backend", "epoll"]).is_err());
        assert!(parse(&["-j", "0"]).is_err());
        assert!(parse(&["-j", "many"]).is_err());
    }
}
