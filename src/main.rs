use clap::{Parser, Subcommand};
use lodge::kernel::{DEFAULT_APP_GROUP, DEFAULT_EXTENSION, Kernel, SpawnOptions, ThreadWorker};
use lodge::patch::{self, PatchOutcome, PrepareMode};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lodge", version, about = "Run guest binaries as virtual processes")]
struct Cli {
    /// Shared container the kernel and its workers meet in.
    #[arg(long, global = true, env = "LODGE_APP_GROUP", default_value = DEFAULT_APP_GROUP)]
    app_group: String,

    /// Worker executable to start guests with.
    #[arg(long, global = true, env = "LODGE_EXTENSION", default_value = DEFAULT_EXTENSION)]
    extension: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spawn a guest and stream its output until it exits.
    Spawn {
        /// Run the guest from this process instead of a worker.
        #[arg(long)]
        direct: bool,

        /// Have the worker load the guest as a module.
        #[arg(long, conflicts_with = "direct")]
        in_process: bool,

        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment, as KEY=VALUE.
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,

        path: PathBuf,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Prepare a guest binary for loading.
    Patch {
        /// Also move __PAGEZERO out of the way for hosts without JIT.
        #[arg(long)]
        jitless: bool,

        path: PathBuf,
    },

    /// Strip the code signature from a binary.
    Unsign { path: PathBuf },

    /// Describe the slices of a Mach-O binary.
    Inspect { path: PathBuf },

    /// Report whether this process may map unsigned executable pages.
    Jit,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn main() -> ExitCode {
    setup_logging();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("lodge: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> lodge::Result<ExitCode> {
    match cli.command {
        Command::Spawn {
            direct,
            in_process,
            cwd,
            env,
            path,
            args,
        } => {
            let mut builder = Kernel::builder()
                .app_group_identifier(cli.app_group)
                .extension_identifier(cli.extension)
                .load_in_process(in_process);
            if direct {
                builder = builder.worker(ThreadWorker::new());
            }
            let kernel = builder.build();
            let mut options = SpawnOptions::new(path).args(args);
            options.env = env.into_iter().collect();
            options.working_directory = cwd;
            spawn(&kernel, options)
        }
        Command::Patch { jitless, path } => {
            let mode = if jitless {
                PrepareMode::JitLess
            } else {
                PrepareMode::Jit
            };
            report(&path, patch::prepare_guest_binary(&path, mode)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Unsign { path } => {
            report(&path, patch::remove_code_signature(&path)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Inspect { path } => {
            print!("{}", patch::inspect(&path)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Jit => {
            let enabled = lodge::bypass::is_jit_enabled();
            println!("jit: {}", if enabled { "enabled" } else { "disabled" });
            Ok(if enabled {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
    }
}

fn spawn(kernel: &Kernel, options: SpawnOptions) -> lodge::Result<ExitCode> {
    let printer = kernel.on_output(|_, bytes| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    })?;
    let pid = kernel.spawn_with(options).wait()?;
    let code = kernel.wait(pid)?;
    kernel.shutdown();
    let _ = printer.join();
    Ok(ExitCode::from((code & 0xff) as u8))
}

fn report(path: &Path, outcome: PatchOutcome) {
    match outcome {
        PatchOutcome::Applied => println!("patched {}", path.display()),
        PatchOutcome::Unchanged => println!("{} unchanged", path.display()),
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
