//! MITS - Medusa Integration Test Suite CLI
//!
//! The `mits` command drives allow/deny tests against an authorization daemon.
//!
//! ## Commands
//!
//! - `expand`: Expand annotation tokens in a configuration template
//! - `exec`: Run one command through a prompt-synchronised shell session
//! - `catalog`: List the available tests
//! - `run`: Compose the policy, start the daemon and run a suite

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use mits_core::{
    render_table, write_results_json, AnnotationMap, ChannelSession, MitsError, PtyTransport,
    Settings, SshTarget, SuiteKind, TemplateExpander, TestCase, TestCatalog, TestRun,
};

#[derive(Parser)]
#[command(name = "mits")]
#[command(author = "MITS Developers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Integration tests for Linux authorization daemons", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Settings file (TOML)
    #[arg(short, long, global = true, env = "MITS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand annotation tokens in a template and print the result
    Expand {
        /// Template file, or `-` for standard input
        template: PathBuf,

        /// Annotation value, overriding the `[paths]` settings
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,

        /// Opening token delimiter
        #[arg(long, default_value = "@{")]
        open: String,

        /// Closing token delimiter
        #[arg(long, default_value = "}")]
        close: String,
    },

    /// Run a command through a prompt-synchronised shell session
    Exec {
        /// Remote destination as user@host (default: local /bin/sh)
        #[arg(long)]
        ssh: Option<String>,

        /// SSH port
        #[arg(short, long, default_value = "22")]
        port: u16,

        /// SSH private key
        #[arg(short, long)]
        identity: Option<PathBuf>,

        /// Print output as it arrives
        #[arg(long)]
        stream: bool,

        /// Command to run
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// List tests in a catalog
    Catalog {
        /// Catalog file (default: built-in filesystem tests)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Run a suite against the authorization daemon
    Run {
        /// Catalog file (default: built-in filesystem tests)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Suite kind: serial or concurrent
        #[arg(short, long, default_value = "serial")]
        suite: SuiteKind,

        /// Comma-separated test names (default: every test in the catalog)
        #[arg(short, long, value_delimiter = ',')]
        tests: Vec<String>,

        /// Directory tests run in (default: <tmp>/mits)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Daemon command line; annotations are expanded
        #[arg(long)]
        daemon_cmd: Option<String>,

        /// Write the JSON run report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    mits_core::init_tracing(cli.json, level);

    let settings = Settings::load_or_default(cli.config.as_deref())
        .context("Failed to load settings")?;

    match cli.command {
        Commands::Expand {
            template,
            set,
            open,
            close,
        } => cmd_expand(&settings, &template, &set, &open, &close),
        Commands::Exec {
            ssh,
            port,
            identity,
            stream,
            command,
        } => {
            let command = command.join(" ");
            tokio::task::spawn_blocking(move || {
                cmd_exec(&settings, ssh.as_deref(), port, identity, stream, &command)
            })
            .await
            .context("exec task panicked")?
        }
        Commands::Catalog { catalog } => cmd_catalog(catalog.as_deref()),
        Commands::Run {
            catalog,
            suite,
            tests,
            workdir,
            daemon_cmd,
            report,
        } => {
            cmd_run(
                settings,
                catalog.as_deref(),
                suite,
                &tests,
                workdir,
                daemon_cmd,
                report.as_deref(),
            )
            .await
        }
    }
}

/// Wrap a core error, naming the session phase it happened in.
fn with_phase(err: MitsError) -> anyhow::Error {
    match err.phase() {
        Some(phase) => anyhow::Error::new(err).context(format!("{} phase failed", phase)),
        None => anyhow::Error::new(err),
    }
}

fn parse_assignment(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --set '{}', expected NAME=VALUE", raw))?;
    if name.is_empty() {
        bail!("invalid --set '{}', annotation name is empty", raw);
    }
    Ok((name.to_string(), value.to_string()))
}

fn read_template(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read template from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("Failed to read template {:?}", path))
}

/// Expand a template with the configured and command-line annotations
fn cmd_expand(settings: &Settings, template: &Path, set: &[String], open: &str, close: &str) -> Result<()> {
    let overrides = set
        .iter()
        .map(|raw| parse_assignment(raw))
        .collect::<Result<AnnotationMap>>()?;
    let annotations = settings.paths.clone().merged(&overrides);

    let expander = TemplateExpander::with_delimiters(open, close)?;
    let input = read_template(template)?;
    let expanded = expander
        .expand_bytes(&input, &annotations)
        .with_context(|| format!("Failed to expand {:?}", template))?;

    print!("{}", expanded);
    Ok(())
}

/// Run one command over a local or ssh session
fn cmd_exec(
    settings: &Settings,
    ssh: Option<&str>,
    port: u16,
    identity: Option<PathBuf>,
    stream: bool,
    command: &str,
) -> Result<()> {
    let config = settings.session.clone();
    let session = match ssh {
        Some(destination) => {
            let mut target = SshTarget::parse(destination, port).ok_or_else(|| {
                anyhow!("invalid ssh destination '{}', expected user@host", destination)
            })?;
            target.identity = identity;
            info!("Connecting to {}@{}:{}", target.user, target.host, target.port);
            ChannelSession::open(|| PtyTransport::ssh(&target), config)
        }
        None => ChannelSession::open(PtyTransport::local_shell, config),
    };
    let mut session = session
        .map_err(|e| with_phase(e.into()))
        .context("Failed to open shell session")?;

    let stdout = std::io::stdout();
    let output = if stream {
        let mut out = stdout.lock();
        session.execute_streaming(command, |chunk| {
            // Best effort: a closed stdout must not abort the remote command.
            let _ = out.write_all(chunk).and_then(|_| out.flush());
        })
    } else {
        session.execute(command)
    }
    .map_err(|e| with_phase(e.into()))
    .with_context(|| format!("Failed to execute '{}'", command))?;

    if !stream {
        print!("{}", output);
    }
    session.close().map_err(|e| with_phase(e.into()))?;
    Ok(())
}

fn load_catalog(path: Option<&Path>) -> Result<TestCatalog> {
    match path {
        Some(path) => TestCatalog::load(path).with_context(|| format!("Failed to load catalog {:?}", path)),
        None => TestCatalog::builtin().context("Built-in catalog is invalid"),
    }
}

/// List tests in a catalog
fn cmd_catalog(path: Option<&Path>) -> Result<()> {
    let catalog = load_catalog(path)?;
    if catalog.is_empty() {
        println!("No tests found.");
        return Ok(());
    }

    let width = catalog.names().iter().map(|n| n.len()).max().unwrap_or(0);
    for test in catalog.all() {
        println!("{:<width$}  {}", test.name, test.command, width = width);
        if let Some(denied) = &test.denied_command {
            println!("{:<width$}  {}", "", denied, width = width);
        }
    }
    Ok(())
}

/// Run a suite end to end and print the result table
async fn cmd_run(
    mut settings: Settings,
    catalog: Option<&Path>,
    suite: SuiteKind,
    names: &[String],
    workdir: Option<PathBuf>,
    daemon_cmd: Option<String>,
    report_path: Option<&Path>,
) -> Result<()> {
    let catalog = load_catalog(catalog)?;
    let tests: Vec<TestCase> = if names.is_empty() {
        catalog.all().to_vec()
    } else {
        catalog.select(names)?
    };

    let workdir = workdir.unwrap_or_else(|| std::env::temp_dir().join("mits"));
    std::fs::create_dir_all(&workdir).with_context(|| format!("Failed to create {:?}", workdir))?;
    if let Some(command) = daemon_cmd {
        settings.daemon.command = command;
    }

    info!("Running {} {} test(s) in {:?}", tests.len(), suite, workdir);
    let run = TestRun::new(settings, &workdir);
    let executor = Arc::new(run.local_executor());
    let report = run
        .execute(&tests, suite, executor)
        .await
        .map_err(with_phase)
        .context("Test run failed")?;

    print!("{}", render_table(&report.outcomes));

    if let Some(path) = report_path {
        write_results_json(path, &report)?;
        println!("Report written to {:?}", path);
    }
    Ok(())
}
