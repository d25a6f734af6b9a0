use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use expr_engine::backend::{self, Backend};
use expr_engine::differences::DifferenceSearch;
use expr_engine::discovery;
use expr_engine::rpc::WorkerConfig;
use expr_engine::{logging, Expression};

#[derive(Parser, Debug)]
#[command(author, version, about = "Compare how numeric backends evaluate a formula")]
struct Cli {
    /// Log debug output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Worker executable to load remote libraries with, located by the
    /// library's pointer width when omitted
    #[arg(long, global = true, value_name = "FILE")]
    worker: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a formula at evenly spaced points
    Eval(EvalArgs),
    /// List the libraries under a directory and the symbols they lack
    Libraries {
        /// Directory holding `x64/` and `x86/`
        #[arg(default_value = ".")]
        root: PathBuf,
    },
    /// Search a range for inputs on which backends disagree
    Diff(DiffArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Reference {
    Double,
    Float,
}

#[derive(Debug, Args)]
struct BackendArgs {
    /// Built-in backend to use when no library is given
    #[arg(long, value_enum, default_value_t = Reference::Double)]
    reference: Reference,

    /// Native operator library, loaded in process when its pointer width allows
    #[arg(long, value_name = "FILE")]
    library: Option<PathBuf>,

    /// Always load `--library` through a worker process
    #[arg(long, requires = "library")]
    remote: bool,
}

#[derive(Debug, Args)]
struct EvalArgs {
    expression: String,

    #[arg(long, default_value_t = -10.0, allow_negative_numbers = true)]
    from: f64,

    #[arg(long, default_value_t = 10.0, allow_negative_numbers = true)]
    to: f64,

    /// Number of intervals between `from` and `to`
    #[arg(long, default_value_t = 10)]
    steps: u32,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Args)]
struct DiffArgs {
    expression: String,

    #[arg(allow_negative_numbers = true)]
    start: f64,

    #[arg(allow_negative_numbers = true)]
    end: f64,

    /// Library to compare, may be repeated
    #[arg(long = "library", value_name = "FILE")]
    libraries: Vec<PathBuf>,

    /// Also compare the float backend
    #[arg(long)]
    float: bool,

    /// Print the estimate and exit
    #[arg(long)]
    estimate: bool,

    /// Differences to print
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let worker = cli.worker.as_ref().map(WorkerConfig::new);
    let worker = worker.as_ref();

    let result = match cli.command {
        Command::Eval(args) => eval(args, worker),
        Command::Libraries { root } => libraries(&root, worker),
        Command::Diff(args) => diff(args, worker),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn open_backend(path: &Path, remote: bool, worker: Option<&WorkerConfig>) -> Result<Backend, String> {
    let backend = if remote {
        discovery::image_bitness(path)
            .and_then(|bitness| Backend::remote(path, &discovery::worker_for(bitness, worker)))
    } else {
        // The library is chosen by the user, who vouches for its ABI.
        unsafe { Backend::open(path, worker) }
    };
    backend.map_err(|e| format!("cannot load {}: {}", path.display(), e))
}

fn parse(input: &str, backend: Arc<Backend>) -> Result<Expression, String> {
    Expression::parse_with(input, backend).map_err(|e| format!("{}\n{}", e, e.caret()))
}

fn warn_missing(expression: &Expression) {
    let missing = expression.missing_used();
    if !missing.is_empty() {
        let names: Vec<_> = missing.iter().map(|symbol| backend::bare_name(symbol)).collect();
        warn!(
            backend = %expression.backend().name(),
            "using double precision fallback for {}",
            names.join(", ")
        );
    }
}

fn eval(args: EvalArgs, worker: Option<&WorkerConfig>) -> Result<(), String> {
    let backend = match &args.backend.library {
        Some(path) => Arc::new(open_backend(path, args.backend.remote, worker)?),
        None => Arc::new(match args.backend.reference {
            Reference::Double => Backend::double(),
            Reference::Float => Backend::float(),
        }),
    };
    info!(backend = %backend.name(), "evaluating");

    let expression = parse(&args.expression, backend)?;
    warn_missing(&expression);

    let Some(variable) = expression.variable_name() else {
        println!("{}", expression.evaluate(f64::NAN));
        return Ok(());
    };

    let steps = args.steps.max(1);
    for i in 0..=steps {
        let x = args.from + (args.to - args.from) * i as f64 / steps as f64;
        println!("{} = {:<24} {}", variable, x, expression.evaluate(x));
    }
    Ok(())
}

fn libraries(root: &Path, worker: Option<&WorkerConfig>) -> Result<(), String> {
    // Every file under `root` is trusted to follow the native operator ABI.
    let found = unsafe { discovery::discover(root, worker) };
    if found.is_empty() {
        return Err(format!("no libraries found under {}", root.display()));
    }

    for library in found {
        let missing = library.backend.missing_display();
        println!(
            "{} [{}] {}{}",
            library.backend.name(),
            library.bitness,
            library.path.display(),
            if missing.is_empty() {
                String::new()
            } else {
                format!(" (missing: {})", missing)
            }
        );
    }
    Ok(())
}

fn diff(args: DiffArgs, worker: Option<&WorkerConfig>) -> Result<(), String> {
    let mut backends = vec![Backend::shared_double()];
    if args.float {
        backends.push(Arc::new(Backend::float()));
    }
    for path in &args.libraries {
        backends.push(Arc::new(open_backend(path, false, worker)?));
    }

    let expression = parse(&args.expression, Backend::shared_double())?;
    let search = DifferenceSearch::new(&expression, &backends, args.start, args.end).map_err(|e| e.to_string())?;
    for backend in &backends {
        warn_missing(&expression.with_backend(backend.clone()));
    }

    let estimate = search.estimate();
    match estimate.duration {
        Some(duration) => info!(samples = estimate.samples, ?duration, "estimated"),
        None => warn!(samples = estimate.samples, "estimated duration is unbounded"),
    }
    if args.estimate {
        return Ok(());
    }

    let reported = AtomicU64::new(0);
    let differences = search
        .run(|done, total| {
            let decile = (done as f64 / total as f64 * 10.0) as u64;
            if reported.fetch_max(decile, Ordering::Relaxed) < decile {
                info!(done, total, "{}%", decile * 10);
            }
        })
        .map_err(|e| e.to_string())?;

    let names: Vec<_> = backends.iter().map(|backend| backend.name()).collect();
    println!("backends: {}", names.join(" | "));
    for difference in differences.iter().take(args.limit) {
        println!(
            "x = {:<24} min = {:<24} max = {:<24} spread = {:e}",
            difference.x,
            difference.min(),
            difference.max(),
            difference.spread()
        );
    }
    println!(
        "{} differences in {} samples",
        differences.len(),
        search.sample_count()
    );
    Ok(())
}
