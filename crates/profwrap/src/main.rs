//! profwrap - runs a program under profiling collectors.
//!
//! Collects CPU, heap, thread, blocking and contention profiles around one
//! supervised child and writes them to an output directory once it exits.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Boot options read by jemalloc. Profiling must be on from the start for
/// `prof.reset` to accept a heap sampling interval later.
#[cfg(not(target_env = "msvc"))]
#[allow(non_upper_case_globals)]
#[unsafe(export_name = "_rjem_malloc_conf")]
pub static malloc_conf: &[u8] = b"prof:true,prof_active:true,lg_prof_sample:19\0";

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use profwrap_core::config::{self, CollectionPlan, Settings};
use profwrap_core::supervisor::{SPAWN_FAILURE_EXIT_CODE, StdioMode, Target, supervise};

/// Runs a program and profiles it.
#[derive(Parser, Debug)]
#[command(
    name = "profwrap",
    about = "Runs a program under profiling collectors",
    version,
    after_help = "Every option can also be set through its PROFWRAP_* environment variable."
)]
struct Args {
    /// Directory for artifacts. Profiling is disabled when unset.
    #[arg(short, long, env = "PROFWRAP_OUTPUT_DIR", value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Comma-separated collectors: cpu, heap, goroutine, block, mutex, allocs.
    #[arg(short, long, env = "PROFWRAP_PROFILES", value_name = "LIST")]
    profiles: Option<String>,

    /// Stop CPU sampling after this many seconds (decimals allowed).
    #[arg(long, env = "PROFWRAP_CPU_DURATION", value_name = "SECS")]
    cpu_duration: Option<String>,

    /// CPU samples per second.
    #[arg(long, env = "PROFWRAP_CPU_HZ", value_name = "HZ")]
    cpu_hz: Option<String>,

    /// Average bytes allocated between heap samples.
    #[arg(long, env = "PROFWRAP_MEM_RATE", value_name = "BYTES")]
    mem_rate: Option<String>,

    /// Nanoseconds of blocking per recorded event.
    #[arg(long, env = "PROFWRAP_BLOCK_RATE", value_name = "NS")]
    block_rate: Option<String>,

    /// Keep on average 1/N lock-contention events.
    #[arg(long, env = "PROFWRAP_MUTEX_FRACTION", value_name = "N")]
    mutex_fraction: Option<String>,

    /// Keep artifacts left over from a previous run.
    #[arg(long)]
    no_clean: bool,

    /// Pipe the child's stdout/stderr through the supervisor instead of sharing them.
    #[arg(long)]
    relay: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,

    /// Program to run, followed by its arguments.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "PROGRAM"
    )]
    command: Vec<OsString>,
}

impl Args {
    /// Overlays command-line values on `settings`.
    fn overlay(&self, mut settings: Settings) -> Settings {
        if let Some(dir) = &self.output_dir {
            settings.set(config::OUTPUT_DIR, dir.to_string_lossy());
        }
        let values = [
            (config::PROFILES, &self.profiles),
            (config::CPU_DURATION, &self.cpu_duration),
            (config::CPU_HZ, &self.cpu_hz),
            (config::MEM_RATE, &self.mem_rate),
            (config::BLOCK_RATE, &self.block_rate),
            (config::MUTEX_FRACTION, &self.mutex_fraction),
        ];
        for (key, value) in values {
            if let Some(value) = value {
                settings.set(key, value.as_str());
            }
        }
        if self.no_clean {
            settings.set(config::CLEAN, "false");
        }
        settings
    }

    fn stdio(&self) -> StdioMode {
        if self.relay {
            StdioMode::Relay
        } else {
            StdioMode::Inherit
        }
    }
}

/// Initializes the tracing subscriber on stderr so the child's stdout stays clean.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// The terminal delivers Ctrl-C to the whole process group. The child decides
/// how to react; the supervisor keeps waiting so it can still drain artifacts.
fn install_interrupt_handler() {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::SeqCst) {
            info!("Interrupt received, waiting for the child to exit");
        }
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }
}

fn plan_from(settings: &Settings) -> CollectionPlan {
    match config::resolve(settings) {
        Ok(plan) => plan,
        Err(e) => {
            error!(error = %e, "profiling disabled");
            CollectionPlan::disabled()
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let settings = args.overlay(Settings::from_env());
    let plan = plan_from(&settings);
    if plan.is_active() {
        info!(
            dir = ?plan.output_dir(),
            collectors = ?plan.enabled(),
            cpu_duration = ?plan.cpu_duration(),
            "profwrap {} profiling",
            env!("CARGO_PKG_VERSION")
        );
    } else {
        debug!("profiling disabled, running the program unchanged");
    }

    let stdio = args.stdio();
    let Some(target) = Target::from_argv(args.command) else {
        error!("no program given");
        std::process::exit(SPAWN_FAILURE_EXIT_CODE);
    };
    let target = target.with_stdio(stdio);

    install_interrupt_handler();
    let outcome = supervise(plan, &target);
    std::process::exit(outcome.exit_code());
}
