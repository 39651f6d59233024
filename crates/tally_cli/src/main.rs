mod logging;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use tally_core::{Node, Runtime, SessionConfig, Value};

use logging::Verbosity;

#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Jointly evaluate an arithmetic expression across parties", long_about = None)]
struct Cli {
    /// TOML file listing every party
    #[arg(short = 'C', long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Party address as host:port, once per party; an empty host marks the
    /// local party
    #[arg(short = 'P', value_name = "ADDR")]
    parties: Vec<String>,

    /// Number of parties on localhost
    #[arg(short = 'M', value_name = "M")]
    m: Option<usize>,

    /// Identity of this party
    #[arg(short = 'I', long, value_name = "I")]
    index: Option<u8>,

    /// Port of party 0; party i listens on base + i
    #[arg(short = 'B', long, value_name = "B")]
    base_port: Option<u16>,

    /// Disable logging messages
    #[arg(long)]
    no_log: bool,

    /// Append output for parties i>0 to party{m}_{i}.log
    #[arg(long)]
    output_file: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Resolve the party list and local identity: config file first, then
    /// explicit addresses, then `m` parties on localhost.
    fn session_config(&self) -> Result<SessionConfig> {
        if let Some(path) = &self.config {
            let mut config = SessionConfig::load(path)?;
            if let Some(index) = self.index {
                config.local = index;
                config.validate()?;
            }
            return Ok(config);
        }
        if !self.parties.is_empty() {
            return Ok(SessionConfig::from_party_list(
                &self.parties,
                self.base_port,
                self.index,
            )?);
        }
        let m = self.m.unwrap_or(1);
        Ok(SessionConfig::localhost(m, self.index.unwrap_or(0), self.base_port)?)
    }

    /// Whether this process is party 0 of a local run and must start the
    /// others.
    fn spawns_parties(&self) -> bool {
        self.config.is_none()
            && self.parties.is_empty()
            && self.index.is_none()
            && self.m.unwrap_or(1) > 1
    }

    fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.no_log, self.verbose)
    }
}

/// Arguments for party `index`: the identity first, then everything this
/// process was started with.
fn party_args(index: usize, args: &[String]) -> Vec<String> {
    let mut party = vec!["-I".to_string(), index.to_string()];
    party.extend(args.iter().cloned());
    party
}

/// Command for one respawned party. The child is killed if its handle is
/// dropped before it was waited on.
fn party_command(exe: &Path, party_args: &[String]) -> Command {
    let mut command = Command::new(exe);
    command
        .args(party_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    command
}

/// Start parties `m-1` down to `1` as copies of this executable.
fn spawn_parties(m: usize) -> Result<Vec<Child>> {
    let exe = std::env::current_exe().context("failed to locate the tally executable")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut children = Vec::with_capacity(m.saturating_sub(1));
    for i in (1..m).rev() {
        let party_args = party_args(i, &args);
        info!("$> {} {}", exe.display(), party_args.join(" "));
        let child = party_command(&exe, &party_args)
            .spawn()
            .with_context(|| format!("failed to start party {i}"))?;
        children.push(child);
    }
    Ok(children)
}

/// The reference session: `((var_0 + var_1) * var_2 * 2) ** 3`, with parties
/// 0, 1 and 2 each supplying one input.
async fn run(config: SessionConfig) -> Result<Value> {
    let rt = Runtime::new(config)?;
    let var1 = rt.variable("var_0");
    let var2 = rt.variable("var_1");
    let var3 = rt.variable("var_2");

    let add = &var1 + &var2;
    let mut op = &add * &var3;
    op *= 2.0;
    op.pow_assign(3.0);

    debug!("Starting");
    let result = rt
        .session(|rt| async move {
            debug!("Feeding");
            let inputs: Vec<(&Node, Value)> = match rt.pid() {
                0 => vec![(&var1, Value::ones(&[3, 1])?)],
                1 => vec![(
                    &var2,
                    Value::matrix(&[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]])?,
                )],
                2 => vec![(&var3, Value::column(&[0.0, 1.0, 2.0]))],
                _ => Vec::new(),
            };
            rt.feed(inputs).await?;
            rt.evaluate(&op).await
        })
        .await?;
    Ok(result)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.session_config()?;
    let m = config.parties.len();
    let local = config.local;

    let _guard = if cli.output_file && local > 0 {
        let file_name = logging::log_file_name(m, local);
        Some(logging::init_file(Path::new("."), &file_name, cli.verbosity())?)
    } else {
        logging::init_console(cli.verbosity())?;
        None
    };

    let children = if cli.spawns_parties() {
        spawn_parties(m)?
    } else {
        Vec::new()
    };

    let result = match run(config).await {
        Ok(result) => result,
        Err(e) => {
            for mut child in children {
                if let Err(kill) = child.kill().await {
                    warn!("Failed to stop party process: {kill}");
                }
            }
            return Err(e);
        }
    };
    info!("Party {local}: result {result}");
    println!("{result}");

    for mut child in children {
        let status = child.wait().await?;
        if !status.success() {
            warn!("Party process exited with {status}");
        }
    }
    Ok(())
}
