mod agent_cmd;
mod bootstrap;
mod credentials;

use anyhow::{Result, anyhow};
use console::style;
use std::path::PathBuf;

use crate::config::Config;
use crate::core::service::ServiceTag;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging;

pub use bootstrap::Runtime;

fn print_help() {
    GuideSection::new("Agent")
        .command("ask", "Answer one prompt using the user's services")
        .command("chat", "Interactive conversation on stdin")
        .command("services", "List configured services")
        .print();

    GuideSection::new("Credentials")
        .command("credentials add", "Store authorization for a (user, service) pair")
        .command("credentials list", "Show a user's stored credentials")
        .command("credentials deactivate", "Disable a credential, keeping its secret file")
        .command("credentials remove", "Delete a credential and its secret file")
        .command("credentials purge", "Delete inactive credentials older than N days")
        .print();

    GuideSection::new("Global flags")
        .command("--config <path>", "Config file (default: <data dir>/toolhost.toml)")
        .command("--verbose, -v", "Debug logging for toolhost")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("toolhost").green()
    );
}

/// Value following the first of `names` at or after `start`.
pub(crate) fn flag_value(args: &[String], start: usize, names: &[&str]) -> Option<String> {
    let mut i = start;
    while i < args.len() {
        if names.contains(&args[i].as_str()) {
            return args.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

pub(crate) fn required_flag(args: &[String], start: usize, names: &[&str]) -> Result<String> {
    flag_value(args, start, names)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("{} is required", names[0]))
}

/// `a,b , c` → tags, rejecting malformed ones.
pub(crate) fn parse_service_list(raw: &str) -> Result<Vec<ServiceTag>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| ServiceTag::new(s).map_err(anyhow::Error::from))
        .collect()
}

/// Split off global flags; returns the remaining argv and the config path.
fn extract_globals(args: Vec<String>) -> (Vec<String>, Option<PathBuf>, bool) {
    let mut rest = Vec::with_capacity(args.len());
    let mut config = None;
    let mut verbose = false;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => config = iter.next().map(PathBuf::from),
            "--verbose" | "-v" => verbose = true,
            _ => rest.push(arg),
        }
    }
    (rest, config, verbose)
}

fn print_services(config: &Config) {
    let registry = config.registry();
    if registry.is_empty() {
        terminal::print_warn("No services configured. Add [[services]] entries to toolhost.toml.");
        return;
    }
    let mut section = GuideSection::new("Services");
    for def in registry.all() {
        let launch = std::iter::once(def.command.as_str())
            .chain(def.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let description = if def.description.is_empty() { "-" } else { def.description.as_str() };
        section = section.command(def.tag.as_str(), &format!("{} ({})", description, launch));
    }
    section.print();
}

pub async fn run_main() -> Result<()> {
    let (args, config_path, verbose) = extract_globals(std::env::args().collect());
    logging::init_logging(verbose);

    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "services" => {
            let config = Config::load(config_path.as_deref()).await?;
            print_services(&config);
            Ok(())
        }
        "credentials" => {
            let config = Config::load(config_path.as_deref()).await?;
            let runtime = Runtime::open(config).await?;
            credentials::run(&runtime, &args).await
        }
        "ask" => {
            let config = Config::load(config_path.as_deref()).await?;
            let runtime = Runtime::open(config).await?;
            agent_cmd::ask(&runtime, &args).await
        }
        "chat" => {
            let config = Config::load(config_path.as_deref()).await?;
            let runtime = Runtime::open(config).await?;
            agent_cmd::chat(&runtime, &args).await
        }
        other => {
            print_error(&format!("Unknown command '{}'", other));
            print_help();
            Err(anyhow!("unknown command '{}'", other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn flag_value_finds_long_and_short_names() {
        let args = argv("toolhost ask -u alice --services notes,mail");
        assert_eq!(flag_value(&args, 2, &["--user", "-u"]), Some("alice".into()));
        assert_eq!(flag_value(&args, 2, &["--services"]), Some("notes,mail".into()));
        assert_eq!(flag_value(&args, 2, &["--prompt"]), None);
    }

    #[test]
    fn required_flag_reports_the_long_name() {
        let args = argv("toolhost ask --user");
        let err = required_flag(&args, 2, &["--user", "-u"]).unwrap_err();
        assert_eq!(err.to_string(), "--user is required");
    }

    #[test]
    fn service_list_is_trimmed_and_validated() {
        let tags = parse_service_list("notes, mail,,").unwrap();
        assert_eq!(tags.iter().map(|t| t.as_str()).collect::<Vec<_>>(), vec!["notes", "mail"]);
        assert!(parse_service_list("notes,../x").is_err());
    }

    #[test]
    fn globals_are_stripped() {
        let (rest, config, verbose) = extract_globals(argv("toolhost --config /tmp/t.toml services -v"));
        assert_eq!(rest, argv("toolhost services"));
        assert_eq!(config, Some(PathBuf::from("/tmp/t.toml")));
        assert!(verbose);
    }
}
