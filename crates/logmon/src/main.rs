//! logmon CLI
//!
//! Passive log monitor: tails files, matches regex rules, warns on noisy rules.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::Path;

use clap::{Parser, Subcommand};
use logmon_core::aggregator::{FrequentMatchWarning, MatchEvent};
use logmon_core::config::{Config, ConfigOverrides};
use logmon_core::logging::{LogConfig, LogError, init_logging};
use logmon_core::monitor::{MessageOutcome, Monitor};
use logmon_core::patterns::PatternMatcher;
use logmon_core::rules::{Rule, RuleId};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("LOGMON_GIT_HASH"),
    ", ",
    env!("LOGMON_TARGET"),
    ")"
);

/// logmon - passive log monitor
#[derive(Parser)]
#[command(name = "logmon")]
#[command(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "LOGMON_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch configured files and print matches until Ctrl-C
    Watch {
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,

        /// Matches shown in the summary on exit
        #[arg(long, default_value = "10")]
        history: i64,
    },

    /// List configured rules
    Rules {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate a regex against one line
    Test {
        /// `<REGEX> <LINE>`, or just `<LINE>` together with --rule
        #[arg(required = true, num_args = 1..=2, value_name = "ARGS")]
        args: Vec<String>,

        /// Use the regex of a configured rule
        #[arg(long, short = 'r')]
        rule: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(serde::Serialize)]
struct RuleRow<'a> {
    priority: usize,
    id: &'a str,
    name: &'a str,
    path: String,
    enabled: bool,
    regex: &'a str,
    capture_groups: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        handle_fatal_error(&err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let Cli {
        verbose,
        config,
        command,
    } = Cli::parse();

    let mut overrides = ConfigOverrides::default();
    if verbose {
        overrides.log_level = Some("debug".to_string());
    }

    let config_path = config.as_deref().map(Path::new);
    let config = Config::load_with_overrides(config_path, config_path.is_some(), &overrides)?;

    match init_logging(&LogConfig::from(&config.general)) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(err) => return Err(err.into()),
    }

    match command {
        Some(Commands::Watch { json, history }) => run_watch(&config, json, history).await?,
        Some(Commands::Rules { json }) => print_rules(&config, json)?,
        Some(Commands::Test { args, rule }) => {
            let (regex, line) = split_test_args(args, rule.is_some())?;
            run_test(&config, regex.as_deref(), &line, rule.as_deref())?;
        }
        Some(Commands::Config) => print!("{}", config.to_toml()?),
        None => {
            println!("logmon {}", logmon_core::VERSION);
            println!();
            println!("Passive log monitor.");
            println!();
            println!("Use --help to see available commands.");
        }
    }

    Ok(())
}

async fn run_watch(config: &Config, json: bool, history: i64) -> anyhow::Result<()> {
    let mut monitor = Monitor::with_os(config.monitor.runtime_config(), config.rules.clone())?;
    monitor.start();

    let status = monitor.snapshot();
    tracing::info!(
        rules = status.rule_count,
        watchers = status.watchers.len(),
        "Monitor started"
    );
    if status.watchers.is_empty() {
        anyhow::bail!("No enabled rules; add [[rules]] to logmon.toml");
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut announced: HashSet<RuleId> = HashSet::new();
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
            outcome = monitor.next_message() => {
                match outcome {
                    Some(MessageOutcome::Recorded(event)) => {
                        print_event(&event, json)?;
                        announce_warnings(monitor.active_warnings(), &mut announced, json)?;
                    }
                    Some(MessageOutcome::WatcherError(error)) => {
                        eprintln!("warning: {error}");
                    }
                    Some(MessageOutcome::Discarded) => {}
                    None => break,
                }
            }
        }
    }

    monitor.stop_all();
    monitor.process_pending();

    let recent = monitor.recent_matches(history);
    if json {
        println!("{}", serde_json::to_string(&monitor.snapshot())?);
    } else {
        println!();
        println!("Recent matches ({} of {}):", recent.len(), monitor.aggregator().history_len());
        for event in &recent {
            println!(
                "  [{}] {} {}:{} {}",
                event.created_at.format("%H:%M:%S"),
                event.rule_name,
                event.path.display(),
                event.line_number,
                event.line
            );
        }
    }

    Ok(())
}

fn print_event(event: &MatchEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else if event.captures.is_empty() {
        println!(
            "{} {}:{} {}",
            event.rule_name,
            event.path.display(),
            event.line_number,
            event.line
        );
    } else {
        println!(
            "{} {}:{} {} {:?}",
            event.rule_name,
            event.path.display(),
            event.line_number,
            event.line,
            event.captures
        );
    }
    Ok(())
}

/// Print warnings not shown yet; forget acknowledged ones so they can fire again.
fn announce_warnings(
    warnings: &[FrequentMatchWarning],
    announced: &mut HashSet<RuleId>,
    json: bool,
) -> anyhow::Result<()> {
    announced.retain(|id| warnings.iter().any(|w| &w.rule_id == id));
    for warning in warnings {
        if announced.insert(warning.rule_id.clone()) {
            if json {
                println!("{}", serde_json::to_string(warning)?);
            } else {
                eprintln!("WARNING: {}", warning.message);
            }
        }
    }
    Ok(())
}

fn rule_rows<'a>(rules: &'a [Rule], matcher: &PatternMatcher) -> Vec<RuleRow<'a>> {
    rules
        .iter()
        .enumerate()
        .map(|(priority, rule)| {
            let validated = matcher.validate(&rule.regex);
            RuleRow {
                priority,
                id: rule.id.as_str(),
                name: &rule.name,
                path: rule.path.display().to_string(),
                enabled: rule.enabled,
                regex: &rule.regex,
                capture_groups: validated.as_ref().ok().copied(),
                error: validated.err().map(|e| e.to_string()),
            }
        })
        .collect()
}

fn print_rules(config: &Config, json: bool) -> anyhow::Result<()> {
    let matcher = PatternMatcher::new();
    let rows = rule_rows(&config.rules, &matcher);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No rules configured.");
        return Ok(());
    }

    for row in &rows {
        let state = if row.enabled { "on " } else { "off" };
        let groups = row
            .capture_groups
            .map_or_else(|| "invalid".to_string(), |n| format!("{n} groups"));
        println!(
            "{:>3} [{state}] {} ({}) {} /{}/ {groups}",
            row.priority, row.id, row.name, row.path, row.regex
        );
        if let Some(ref error) = row.error {
            println!("          {error}");
        }
    }
    Ok(())
}

/// `logmon test <regex> <line>` or `logmon test --rule <id> <line>`.
fn split_test_args(args: Vec<String>, with_rule: bool) -> anyhow::Result<(Option<String>, String)> {
    let mut args = args.into_iter();
    match (args.next(), args.next(), with_rule) {
        (Some(line), None, true) => Ok((None, line)),
        (Some(regex), Some(line), false) => Ok((Some(regex), line)),
        (Some(_), Some(_), true) => {
            anyhow::bail!("With --rule, pass only the line to test")
        }
        _ => anyhow::bail!("Usage: logmon test <REGEX> <LINE> | logmon test --rule <ID> <LINE>"),
    }
}

fn run_test(
    config: &Config,
    regex: Option<&str>,
    line: &str,
    rule_id: Option<&str>,
) -> anyhow::Result<()> {
    let rule = match rule_id {
        Some(id) => config
            .rules
            .iter()
            .find(|rule| rule.id.as_str() == id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No rule with id '{id}' in the configuration"))?,
        None => {
            let regex = regex.ok_or_else(|| anyhow::anyhow!("A regex or --rule is required"))?;
            Rule::new("cli-test", "cli-test", regex, "-")
        }
    };

    let matcher = PatternMatcher::new();
    matcher
        .validate(&rule.regex)
        .map_err(logmon_core::Error::Pattern)?;

    match matcher.match_line(line, &rule) {
        Some(result) => {
            println!("match at {}..{}", result.range.start, result.range.end);
            for (index, capture) in result.captures.iter().enumerate() {
                println!("  ${}: {capture}", index + 1);
            }
        }
        None => println!("no match"),
    }
    Ok(())
}

fn handle_fatal_error(err: &anyhow::Error) {
    if let Some(core_err) = err.downcast_ref::<logmon_core::Error>() {
        eprintln!(
            "{}",
            logmon_core::error::format_error_with_remediation(core_err)
        );
    } else {
        eprintln!("Error: {err}");
    }
}
