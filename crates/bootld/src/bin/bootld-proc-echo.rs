//! Payload used by the end-to-end tests: reports what it sees and ends the
//! way it is told to.

#[cfg(unix)]
mod echo {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::{Duration, Instant};

    use anyhow::{Context, Result};
    use clap::{Parser, Subcommand};
    use serde_json::json;

    #[derive(Parser)]
    #[command(name = "bootld-proc-echo")]
    struct Cli {
        #[command(subcommand)]
        cmd: Cmd,
    }

    #[derive(Subcommand)]
    enum Cmd {
        /// Exit with the given status.
        Exit { code: i32 },
        /// Kill this process with the given signal number.
        Signal { signo: i32 },
        /// Write the received arguments as a JSON array.
        Argv {
            #[arg(long)]
            out: PathBuf,
            #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
            rest: Vec<String>,
        },
        /// Write the loader search path and launch details as JSON.
        Env {
            #[arg(long)]
            out: PathBuf,
        },
        /// Write the pid to `--ready`, then wait for SIGUSR1. Exits with the
        /// signal number if it arrives, 0 on timeout.
        WaitSignal {
            #[arg(long)]
            ready: PathBuf,
            #[arg(long, default_value_t = 3000)]
            timeout_ms: u64,
        },
    }

    static RECEIVED: AtomicI32 = AtomicI32::new(0);

    extern "C" fn record_signal(sig: libc::c_int) {
        RECEIVED.store(sig, Ordering::SeqCst);
    }

    pub fn main() {
        match try_main() {
            Ok(code) => std::process::exit(code),
            Err(err) => {
                eprintln!("bootld-proc-echo: {err:#}");
                std::process::exit(101);
            }
        }
    }

    fn try_main() -> Result<i32> {
        let cli = Cli::parse();
        match cli.cmd {
            Cmd::Exit { code } => Ok(code),
            Cmd::Signal { signo } => {
                unsafe {
                    libc::signal(signo, libc::SIG_DFL);
                    libc::kill(libc::getpid(), signo);
                }
                std::thread::sleep(Duration::from_secs(5));
                anyhow::bail!("still alive after signal {signo}")
            }
            Cmd::Argv { out, rest } => {
                let argv: Vec<String> = std::env::args().skip(1).collect();
                write_json(&out, &json!({ "argv": argv, "rest": rest }))?;
                Ok(0)
            }
            Cmd::Env { out } => {
                let exe = std::env::current_exe().context("current_exe")?;
                let doc = json!({
                    "exe_dir": exe.parent().map(|p| p.display().to_string()),
                    "ld_library_path": std::env::var("LD_LIBRARY_PATH").ok(),
                    "ld_library_path_orig": std::env::var("LD_LIBRARY_PATH_ORIG").ok(),
                    "listen_pid": std::env::var("LISTEN_PID").ok(),
                    "pid": std::process::id(),
                });
                write_json(&out, &doc)?;
                Ok(0)
            }
            Cmd::WaitSignal { ready, timeout_ms } => {
                unsafe {
                    libc::signal(
                        libc::SIGUSR1,
                        record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
                    );
                }
                std::fs::write(&ready, std::process::id().to_string())
                    .with_context(|| format!("write {}", ready.display()))?;
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                while Instant::now() < deadline {
                    let sig = RECEIVED.load(Ordering::SeqCst);
                    if sig != 0 {
                        return Ok(sig);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(0)
            }
        }
    }

    fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("serialize")?;
        std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
    }
}

#[cfg(unix)]
fn main() {
    echo::main()
}

#[cfg(not(unix))]
fn main() {
    eprintln!("bootld-proc-echo: unix only");
    std::process::exit(2);
}
