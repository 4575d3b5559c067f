use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use clap::{Args, Parser, Subcommand, ValueEnum};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const RUNTIME_BIN: &str = "broker_runtime";

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Workspace automation for the device broker",
    long_about = "CI gates and Lambda packaging for the device identity and shadow broker."
)]
struct Xtask {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Formatting, clippy and the test suites
    Ci {
        #[arg(value_enum, default_value_t = Gate::All)]
        gate: Gate,
    },
    /// Build the broker runtime and wrap it as a Lambda `bootstrap` zip
    LambdaPackage(PackageArgs),
}

#[derive(Args)]
struct PackageArgs {
    /// Target triple of the Lambda host
    #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
    target: String,
    /// Package an unoptimized build
    #[arg(long)]
    debug: bool,
    /// Directory the zip is written to
    #[arg(long, env = "BROKER_DIST_DIR", default_value = "dist")]
    dist_dir: PathBuf,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Gate {
    Lint,
    Test,
    All,
}

type Step = (&'static str, &'static [&'static str]);

const LINT_STEPS: &[Step] = &[
    ("format check", &["fmt", "--all", "--", "--check"]),
    (
        "clippy",
        &["clippy", "--all-targets", "--all-features", "--", "-D", "warnings"],
    ),
];

const TEST_STEPS: &[Step] = &[
    ("broker_core tests", &["test", "-p", "broker_core"]),
    ("broker_lambda tests", &["test", "-p", "broker_lambda"]),
];

/// A failed task: what to print and the exit code to leave with.
struct Failure {
    message: String,
    code: u8,
}

impl Failure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: 1,
        }
    }
}

fn cargo(label: &str, args: &[&str]) -> Result<(), Failure> {
    eprintln!("\n=== {label} ===\n+ cargo {}", args.join(" "));
    let status = Command::new("cargo")
        .args(args)
        .status()
        .map_err(|error| Failure::new(format!("could not start cargo: {error}")))?;
    if status.success() {
        return Ok(());
    }
    Err(Failure {
        message: format!("{label} failed"),
        code: status
            .code()
            .and_then(|code| u8::try_from(code).ok())
            .unwrap_or(1),
    })
}

fn ci(gate: Gate) -> Result<(), Failure> {
    let lint = if gate == Gate::Test { &[][..] } else { LINT_STEPS };
    let test = if gate == Gate::Lint { &[][..] } else { TEST_STEPS };
    for (label, args) in lint.iter().chain(test) {
        cargo(label, args)?;
    }
    eprintln!("\nCI gate passed.");
    Ok(())
}

fn lambda_package(args: &PackageArgs) -> Result<(), Failure> {
    let mut build = vec![
        "build",
        "-p",
        "broker_lambda",
        "--bin",
        RUNTIME_BIN,
        "--target",
        args.target.as_str(),
    ];
    if !args.debug {
        build.push("--release");
    }
    cargo("build broker_runtime", &build)?;

    let profile_dir = if args.debug { "debug" } else { "release" };
    let binary = Path::new("target")
        .join(&args.target)
        .join(profile_dir)
        .join(RUNTIME_BIN);
    let archive = args.dist_dir.join(format!("{RUNTIME_BIN}.zip"));
    write_bootstrap_zip(&binary, &archive).map_err(|error| {
        Failure::new(format!(
            "packaging {} into {} failed: {error}",
            binary.display(),
            archive.display()
        ))
    })?;

    eprintln!("\nPackaged {}", archive.display());
    Ok(())
}

/// Custom Lambda runtimes start the executable named `bootstrap` at the root
/// of the archive.
fn write_bootstrap_zip(binary: &Path, archive: &Path) -> zip::result::ZipResult<()> {
    let executable = fs::read(binary)?;
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut zip = ZipWriter::new(File::create(archive)?);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);
    zip.start_file("bootstrap", options)?;
    zip.write_all(&executable)?;
    zip.finish()?;
    Ok(())
}

fn main() -> ExitCode {
    let result = match Xtask::parse().task {
        Task::Ci { gate } => ci(gate),
        Task::LambdaPackage(args) => lambda_package(&args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("error: {}", failure.message);
            ExitCode::from(failure.code)
        }
    }
}
