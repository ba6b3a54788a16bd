use fuzzctl::config::Config;
use fuzzctl::device::SshConfig;
use fuzzctl::factory::{make_fuzzer, make_fuzzer_for, make_host, resolve};
use fuzzctl::fuzz::StopAction;

use std::env::current_exe;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, Stdio};

use env_logger::{Env, TimestampPrecision};
use nix::unistd::setsid;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "fuzzctl",
    about = "Operate libFuzzer targets baked into a Fuchsia image on a remote device."
)]
struct Settings {
    /// Network address of the device.
    #[structopt(long, short = "d")]
    device: String,
    /// Checkout root of the OS build.
    #[structopt(long, default_value = ".")]
    source_dir: PathBuf,
    /// Build output directory, relative to the source dir.
    #[structopt(long, default_value = "out/default")]
    build_dir: PathBuf,
    /// Symbolizing filter binary; defaults to the one in the build tree.
    #[structopt(long)]
    symbolizer: Option<PathBuf>,
    /// llvm-symbolizer binary for the filter.
    #[structopt(long, default_value = "llvm-symbolizer")]
    llvm_symbolizer: PathBuf,
    /// Extra debug-symbol directory; may be repeated.
    #[structopt(long = "build-id-dir")]
    build_id_dirs: Vec<PathBuf>,
    /// Host directory that receives logs and artifacts.
    #[structopt(long, short = "o", default_value = ".")]
    output: PathBuf,
    /// Ssh port on the device.
    #[structopt(long)]
    ssh_port: Option<u16>,
    /// Ssh identity file.
    #[structopt(long)]
    ssh_identity: Option<PathBuf>,
    /// Ssh config file.
    #[structopt(long)]
    ssh_config: Option<PathBuf>,
    /// Extra ssh -o option; may be repeated.
    #[structopt(long = "ssh-option")]
    ssh_options: Vec<String>,
    /// Verbose transport.
    #[structopt(long, short = "v")]
    verbose: bool,
    /// Run attached to the terminal instead of in the background.
    #[structopt(long, short = "f")]
    foreground: bool,
    /// Leave faults to a debugger: disable the engine's signal handlers.
    #[structopt(long)]
    debug: bool,
    /// Engine option as key=value; may be repeated.
    #[structopt(long = "option", short = "O")]
    options: Vec<String>,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// List fuzz targets known to the build.
    List {
        pattern: Option<String>,
    },
    /// Show running state, corpus size, and artifacts of matching targets.
    Check {
        pattern: Option<String>,
    },
    /// Start a fuzzing run; background unless -f.
    Start {
        pattern: String,
        /// Arguments passed to the target process, after --.
        #[structopt(last = true)]
        args: Vec<String>,
    },
    /// Stop a running fuzzer.
    Stop {
        pattern: String,
    },
    /// Await a background run and collect its logs.
    Monitor {
        pattern: String,
    },
    /// Re-run a target over saved inputs to reproduce a crash.
    Repro {
        pattern: String,
        /// Input files or glob patterns.
        units: Vec<String>,
    },
    /// Merge corpora into the on-device corpus and run.
    Analyze {
        pattern: String,
        /// Host corpus directories, merged in order.
        corpora: Vec<String>,
        /// A remote corpus bundle directory, merged after the corpora.
        #[structopt(long)]
        bundle: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("FUZZCTL_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    run(settings)
}

fn run(settings: Settings) -> anyhow::Result<()> {
    let config = Config {
        device_addr: settings.device.clone(),
        ssh: SshConfig {
            port: settings.ssh_port,
            identity: settings.ssh_identity.clone(),
            config: settings.ssh_config.clone(),
            verbose: settings.verbose,
            options: settings.ssh_options.clone(),
        },
        source_dir: settings.source_dir.clone(),
        build_dir: settings.build_dir.clone(),
        symbolizer: settings.symbolizer.clone(),
        llvm_symbolizer: settings.llvm_symbolizer.clone(),
        build_id_dirs: settings.build_id_dirs.clone(),
        output: settings.output.clone(),
        foreground: settings.foreground,
        debug: settings.debug,
        options: settings.options.clone(),
    };
    config.check()?;
    let host = make_host(&config)?;

    match &settings.command {
        Command::List { pattern } => {
            let catalog = host.fuzzers()?;
            let matches = resolve(&catalog, pattern.as_deref().unwrap_or(""));
            if matches.is_empty() {
                anyhow::bail!("no matching fuzzers");
            }
            println!("found {} matching fuzzer(s):", matches.len());
            for (package, executable) in matches {
                println!("  {}/{}", package, executable);
            }
        }
        Command::Check { pattern } => {
            let catalog = host.fuzzers()?;
            let matches = resolve(&catalog, pattern.as_deref().unwrap_or(""));
            if matches.is_empty() {
                anyhow::bail!("no matching fuzzers");
            }
            for (package, executable) in matches {
                let mut fuzzer =
                    make_fuzzer_for(&config, make_host(&config)?, package, executable)?;
                let name = fuzzer.name();
                let state = if fuzzer.is_running(true)? {
                    "RUNNING"
                } else {
                    "STOPPED"
                };
                let (units, bytes) = fuzzer.measure_corpus();
                println!("{}: {}", name, state);
                println!("    corpus: {} unit(s), {} byte(s)", units, bytes);
                for artifact in fuzzer.list_artifacts() {
                    println!("    artifact: {}", artifact);
                }
            }
        }
        Command::Start { pattern, args } => {
            let mut fuzzer = make_fuzzer(&config, host, pattern)?;
            fuzzer.set_extra_args(args.clone());
            fuzzer.start()?;
            if !config.foreground {
                spawn_monitor(&settings, pattern)?;
                println!(
                    "{} started; logs will arrive in {} when it finishes",
                    fuzzer.name(),
                    config.output.display()
                );
            }
        }
        Command::Stop { pattern } => {
            let mut fuzzer = make_fuzzer(&config, host, pattern)?;
            match fuzzer.stop()? {
                StopAction::Killed(pid) => println!("stopped {} (pid {})", fuzzer.name(), pid),
                StopAction::NotRunning => println!("{} is not running", fuzzer.name()),
            }
        }
        Command::Monitor { pattern } => {
            let mut fuzzer = make_fuzzer(&config, host, pattern)?;
            fuzzer.monitor()?;
        }
        Command::Repro { pattern, units } => {
            let mut fuzzer = make_fuzzer(&config, host, pattern)?;
            fuzzer.set_inputs(units.clone());
            fuzzer.repro()?;
        }
        Command::Analyze {
            pattern,
            corpora,
            bundle,
        } => {
            let mut fuzzer = make_fuzzer(&config, host, pattern)?;
            fuzzer.analyze(corpora, bundle.as_deref())?;
        }
    }
    Ok(())
}

/// Detach a `monitor` invocation for a freshly backgrounded run. The
/// monitor holds no in-process state; it re-finds the run on the device
/// by (package, executable) alone.
fn spawn_monitor(settings: &Settings, pattern: &str) -> anyhow::Result<()> {
    let mut cmd = ProcessCommand::new(current_exe()?);
    cmd.args(monitor_argv(settings, pattern))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }
    cmd.spawn()?;
    Ok(())
}

fn monitor_argv(settings: &Settings, pattern: &str) -> Vec<String> {
    let mut argv = vec![
        "--device".to_string(),
        settings.device.clone(),
        "--source-dir".to_string(),
        settings.source_dir.display().to_string(),
        "--build-dir".to_string(),
        settings.build_dir.display().to_string(),
        "--output".to_string(),
        settings.output.display().to_string(),
    ];
    if let Some(port) = settings.ssh_port {
        argv.push("--ssh-port".to_string());
        argv.push(port.to_string());
    }
    if let Some(identity) = settings.ssh_identity.as_ref() {
        argv.push("--ssh-identity".to_string());
        argv.push(identity.display().to_string());
    }
    if let Some(config) = settings.ssh_config.as_ref() {
        argv.push("--ssh-config".to_string());
        argv.push(config.display().to_string());
    }
    for option in &settings.ssh_options {
        argv.push("--ssh-option".to_string());
        argv.push(option.clone());
    }
    argv.push("monitor".to_string());
    argv.push(pattern.to_string());
    argv
}
